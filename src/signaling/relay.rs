//! 信令中继
//!
//! 按 ID 登记已连接的客户端，将 offer / answer / ice-candidate 原样转发给目标，
//! 并向控制端广播主机上下线。中继不解析 payload。

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::accept_async;
use tungstenite::protocol::Message;

use super::message::{now_millis, ClientType, HostInfo, MessageType, SignalingMessage};

/// 已注册的客户端
struct Client {
    /// 连接序号，用于区分同一 ID 的重复注册
    conn: u64,
    client_type: ClientType,
    sender: mpsc::UnboundedSender<String>,
}

/// 中继状态
#[derive(Default)]
struct RelayState {
    clients: HashMap<String, Client>,
}

impl RelayState {
    fn send_to(&self, id: &str, msg: &SignalingMessage) -> bool {
        let Some(client) = self.clients.get(id) else {
            return false;
        };
        match msg.encode() {
            Ok(json) => client.sender.send(json).is_ok(),
            Err(_) => false,
        }
    }

    fn host_list(&self) -> Vec<HostInfo> {
        let mut hosts: Vec<HostInfo> = self
            .clients
            .iter()
            .filter(|(_, c)| c.client_type == ClientType::Host)
            .map(|(id, c)| HostInfo {
                id: id.clone(),
                online: !c.sender.is_closed(),
            })
            .collect();
        hosts.sort_by(|a, b| a.id.cmp(&b.id));
        hosts
    }

    fn broadcast_to_controllers(&self, msg: &SignalingMessage) {
        let Ok(json) = msg.encode() else {
            return;
        };
        for client in self.clients.values() {
            if client.client_type == ClientType::Controller {
                let _ = client.sender.send(json.clone());
            }
        }
    }
}

/// 信令中继服务器
pub struct SignalingRelay {
    addr: String,
    port: u16,
    state: Arc<RwLock<RelayState>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl SignalingRelay {
    /// 创建中继，`addr` 形如 `0.0.0.0:8080`，端口为 0 时由系统分配
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            port: 0,
            state: Arc::new(RwLock::new(RelayState::default())),
            shutdown_tx: None,
        }
    }

    /// 启动服务器，返回实际监听端口
    pub async fn start(&mut self) -> Result<u16> {
        let addr: SocketAddr = self.addr.parse()?;
        let listener = TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();
        self.port = actual_port;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let state = self.state.clone();
        let next_conn = Arc::new(AtomicU64::new(1));

        tracing::info!("信令中继启动: {}:{}", addr.ip(), actual_port);

        tokio::spawn(async move {
            let mut shutdown_rx = shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                let conn = next_conn.fetch_add(1, Ordering::Relaxed);
                                let shutdown_rx = shutdown_tx.subscribe();
                                tokio::spawn(handle_client(stream, peer, conn, state.clone(), shutdown_rx));
                            }
                            Err(e) => {
                                tracing::error!("接受连接失败: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("信令中继关闭");
                        break;
                    }
                }
            }
        });

        Ok(actual_port)
    }

    /// 停止服务器并断开所有客户端
    pub fn stop(&self) {
        if let Some(ref tx) = self.shutdown_tx {
            let _ = tx.send(());
        }
    }

    /// 监听端口 (start 之后有效)
    pub fn port(&self) -> u16 {
        self.port
    }

    /// 当前已注册客户端数量
    pub async fn client_count(&self) -> usize {
        self.state.read().await.clients.len()
    }
}

impl Drop for SignalingRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 处理单个客户端连接
async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    conn: u64,
    state: Arc<RwLock<RelayState>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!("WebSocket 握手失败: {}", e);
            return;
        }
    };

    tracing::info!("新连接: {}", peer);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // 发送任务：所有发往该客户端的消息经过同一队列
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut identity: Option<(String, ClientType)> = None;

    loop {
        let next = tokio::select! {
            _ = shutdown_rx.recv() => break,
            msg = ws_receiver.next() => msg,
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                handle_text(&text, conn, &tx, &mut identity, &state).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::debug!("接收错误 {}: {}", peer, e);
                break;
            }
            _ => {}
        }
    }

    // 清理
    if let Some((id, client_type)) = identity {
        let mut state = state.write().await;
        // 同一 ID 已被新连接覆盖时不移除
        if state.clients.get(&id).map(|c| c.conn) == Some(conn) {
            state.clients.remove(&id);
            tracing::info!("客户端断开: {} (剩余 {})", id, state.clients.len());
            if client_type == ClientType::Host {
                state.broadcast_to_controllers(&SignalingMessage {
                    host_id: Some(id),
                    ..SignalingMessage::new(MessageType::HostDisconnected)
                });
            }
        }
    }

    drop(tx);
    let _ = send_task.await;
}

/// 处理一条文本消息
async fn handle_text(
    text: &str,
    conn: u64,
    tx: &mpsc::UnboundedSender<String>,
    identity: &mut Option<(String, ClientType)>,
    state: &Arc<RwLock<RelayState>>,
) {
    let reply = |msg: SignalingMessage| {
        if let Ok(json) = msg.encode() {
            let _ = tx.send(json);
        }
    };

    let msg = match SignalingMessage::decode(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!("无法解析消息: {}", e);
            reply(SignalingMessage::error("Invalid JSON"));
            return;
        }
    };

    match msg.kind {
        MessageType::Register => {
            let Some(id) = msg.id else {
                reply(SignalingMessage::error("Missing id"));
                return;
            };
            let client_type = msg.client_type.unwrap_or(ClientType::Controller);

            let mut state = state.write().await;
            // 同一连接换 ID 重新注册时移除旧 ID
            if let Some((old_id, old_type)) = identity.take() {
                if old_id != id && state.clients.get(&old_id).map(|c| c.conn) == Some(conn) {
                    state.clients.remove(&old_id);
                    tracing::info!("{} 重新注册为 {}", old_id, id);
                    if old_type == ClientType::Host {
                        state.broadcast_to_controllers(&SignalingMessage {
                            host_id: Some(old_id),
                            ..SignalingMessage::new(MessageType::HostDisconnected)
                        });
                    }
                }
            }
            state.clients.insert(
                id.clone(),
                Client {
                    conn,
                    client_type,
                    sender: tx.clone(),
                },
            );
            tracing::info!("注册: {} ({})", id, client_type);

            reply(SignalingMessage {
                id: Some(id.clone()),
                timestamp: Some(now_millis()),
                ..SignalingMessage::new(MessageType::Registered)
            });

            if client_type == ClientType::Host {
                let list = state.host_list();
                state.broadcast_to_controllers(&SignalingMessage {
                    list: Some(list),
                    ..SignalingMessage::new(MessageType::HostsUpdated)
                });
            }
            *identity = Some((id, client_type));
        }
        MessageType::ListHosts => {
            let list = state.read().await.host_list();
            reply(SignalingMessage {
                list: Some(list),
                ..SignalingMessage::new(MessageType::Hosts)
            });
        }
        MessageType::Offer | MessageType::Answer | MessageType::IceCandidate => {
            let target = msg.target.unwrap_or_default();
            let forwarded = SignalingMessage {
                from: identity.as_ref().map(|(id, _)| id.clone()),
                payload: msg.payload,
                timestamp: Some(now_millis()),
                ..SignalingMessage::new(msg.kind.clone())
            };

            let state = state.read().await;
            if state.send_to(&target, &forwarded) {
                tracing::debug!(
                    "转发 {} : {:?} -> {}",
                    msg.kind.as_str(),
                    forwarded.from,
                    target
                );
            } else {
                reply(SignalingMessage::error(format!(
                    "Target {} not found or not connected",
                    target
                )));
            }
        }
        MessageType::Ping => {
            reply(SignalingMessage {
                timestamp: Some(now_millis()),
                ..SignalingMessage::new(MessageType::Pong)
            });
        }
        other => {
            tracing::warn!("未知消息类型: {}", other.as_str());
        }
    }
}
