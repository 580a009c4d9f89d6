//! 信令客户端
//!
//! 与信令中继保持一条 WebSocket 连接：连接后立即注册，随后运行读循环和心跳循环。
//! 收到的消息被转换为 [`SignalingEvent`] 事件流，由协商层按顺序消费。

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::message::{ClientType, HostInfo, MessageType, SignalingMessage};
use crate::error::SignalingError;

/// 默认心跳间隔
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(25);

/// 拨号超时 (唯一的超时)
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// 只接受 ws:// 和 wss:// 地址
fn validate_url(raw: &str) -> Result<(), SignalingError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| SignalingError::Connection(format!("无效的信令地址 {}: {}", raw, e)))?;
    match parsed.scheme() {
        "ws" | "wss" if parsed.host_str().is_some() => Ok(()),
        scheme => Err(SignalingError::Connection(format!(
            "信令地址必须是 ws:// 或 wss://，实际为 {}://",
            scheme
        ))),
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSender = SplitSink<WsStream, Message>;
type WsReceiver = SplitStream<WsStream>;

/// 信令客户端事件
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// 中继确认注册
    Registered,
    /// 收到 Offer
    Offer { from: String, payload: Value },
    /// 收到 Answer
    Answer { from: String, payload: Value },
    /// 收到 ICE 候选
    IceCandidate { from: String, payload: Value },
    /// 主机列表 (hosts / hosts-updated)
    HostList(Vec<HostInfo>),
    /// 主机离线
    HostDisconnected(String),
    /// 中继报告的错误，或读循环异常退出
    Error(String),
}

/// 信令发送接口
///
/// 协商层只依赖这个接口，测试中可以替换为内存实现
#[async_trait]
pub trait SignalSender: Send + Sync {
    /// 本端 ID
    fn local_id(&self) -> &str;

    /// 发送一条信令消息
    async fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError>;
}

/// 读循环与心跳循环共享的状态
struct Shared {
    sender: Mutex<Option<WsSender>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Shared {
    /// 单写者锁下发送，保证消息不会交错
    async fn send(&self, msg: &SignalingMessage) -> Result<(), SignalingError> {
        let json = msg.encode()?;
        let mut sender = self.sender.lock().await;
        match sender.as_mut() {
            Some(sender) => sender
                .send(Message::Text(json))
                .await
                .map_err(|e| SignalingError::Connection(format!("发送失败: {}", e))),
            None => Err(SignalingError::NotConnected),
        }
    }

    /// 取消两个循环并关闭连接；只有第一次调用生效
    async fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        if let Some(mut sender) = self.sender.lock().await.take() {
            let _ = sender.close().await;
        }
        true
    }
}

/// 信令客户端
pub struct SignalingClient {
    url: String,
    local_id: String,
    client_type: ClientType,
    heartbeat: Duration,
    shared: Arc<Shared>,
    events_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<SignalingEvent>>>,
    events_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
}

impl SignalingClient {
    /// 创建新的信令客户端
    pub fn new(
        url: impl Into<String>,
        local_id: impl Into<String>,
        client_type: ClientType,
        heartbeat: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            url: url.into(),
            local_id: local_id.into(),
            client_type,
            heartbeat,
            shared: Arc::new(Shared {
                sender: Mutex::new(None),
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
            events_tx: parking_lot::Mutex::new(Some(tx)),
            events_rx: parking_lot::Mutex::new(Some(rx)),
        }
    }

    /// 取出事件接收器 (只能取一次)
    ///
    /// 读循环退出后通道关闭
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>> {
        self.events_rx.lock().take()
    }

    /// 连接到信令服务器并注册
    pub async fn connect(&self) -> Result<(), SignalingError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Connection("客户端已关闭".to_string()));
        }
        validate_url(&self.url)?;
        let events = self
            .events_tx
            .lock()
            .take()
            .ok_or_else(|| SignalingError::Connection("重复连接".to_string()))?;

        info!("连接到信令服务器: {}", self.url);

        let (ws_stream, _) = tokio::time::timeout(DIAL_TIMEOUT, connect_async(self.url.as_str()))
            .await
            .map_err(|_| SignalingError::Connection(format!("连接超时: {}", self.url)))?
            .map_err(|e| SignalingError::Connection(format!("连接失败: {}", e)))?;

        let (mut sender, receiver) = ws_stream.split();

        let register = SignalingMessage::register(&self.local_id, self.client_type).encode()?;
        if let Err(e) = sender.send(Message::Text(register)).await {
            let _ = sender.close().await;
            return Err(SignalingError::Connection(format!("注册失败: {}", e)));
        }
        *self.shared.sender.lock().await = Some(sender);

        info!("已发送注册: id={}, type={}", self.local_id, self.client_type);

        tokio::spawn(read_loop(receiver, events, self.shared.clone()));
        tokio::spawn(heartbeat_loop(self.heartbeat, self.shared.clone()));

        Ok(())
    }

    /// 发送消息
    pub async fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        self.shared.send(&msg).await
    }

    /// 发送 SDP Offer
    pub async fn send_offer(&self, target: &str, payload: Value) -> Result<(), SignalingError> {
        self.send(SignalingMessage::routed(MessageType::Offer, &self.local_id, target, payload))
            .await
    }

    /// 发送 SDP Answer
    pub async fn send_answer(&self, target: &str, payload: Value) -> Result<(), SignalingError> {
        self.send(SignalingMessage::routed(MessageType::Answer, &self.local_id, target, payload))
            .await
    }

    /// 发送 ICE 候选
    pub async fn send_ice_candidate(
        &self,
        target: &str,
        payload: Value,
    ) -> Result<(), SignalingError> {
        self.send(SignalingMessage::routed(
            MessageType::IceCandidate,
            &self.local_id,
            target,
            payload,
        ))
        .await
    }

    /// 请求主机列表
    pub async fn request_host_list(&self) -> Result<(), SignalingError> {
        self.send(SignalingMessage::list_hosts()).await
    }

    /// 是否已连接
    pub async fn is_connected(&self) -> bool {
        self.shared.sender.lock().await.is_some()
    }

    /// 本端 ID
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// 关闭连接 (幂等)
    pub async fn close(&self) {
        if self.shared.shutdown().await {
            info!("信令客户端已关闭");
        }
    }
}

#[async_trait]
impl SignalSender for SignalingClient {
    fn local_id(&self) -> &str {
        &self.local_id
    }

    async fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        self.shared.send(&msg).await
    }
}

/// 读循环：逐条解码并分发
async fn read_loop(
    mut receiver: WsReceiver,
    events: mpsc::UnboundedSender<SignalingEvent>,
    shared: Arc<Shared>,
) {
    let failure = loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => break None,
            msg = receiver.next() => msg,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                let msg = match SignalingMessage::decode(&text) {
                    Ok(msg) => msg,
                    Err(e) => break Some(format!("无法解析信令消息: {}", e)),
                };
                match event_from_message(msg) {
                    Ok(Some(event)) => {
                        let _ = events.send(event);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("丢弃信令消息: {}", e),
                }
            }
            Some(Ok(Message::Close(_))) | None => break Some("信令连接已关闭".to_string()),
            Some(Ok(Message::Binary(_))) => debug!("忽略二进制信令消息"),
            Some(Ok(_)) => {}
            Some(Err(e)) => break Some(format!("信令接收错误: {}", e)),
        }
    };

    // 主动关闭时不上报
    if let Some(message) = failure {
        if !shared.cancel.is_cancelled() {
            warn!("{}", message);
            let _ = events.send(SignalingEvent::Error(message));
        }
    }
    shared.shutdown().await;
    debug!("信令读循环退出");
}

/// 心跳循环：固定间隔发送 ping，不关联 pong
async fn heartbeat_loop(interval: Duration, shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(interval);
    // 第一次 tick 立即返回
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = shared.send(&SignalingMessage::ping()).await {
                    debug!("发送心跳失败: {}", e);
                } else {
                    trace!("发送心跳");
                }
            }
        }
    }
}

/// 将信令消息转换为事件
///
/// 返回 `Ok(None)` 表示无需分发 (pong、未知类型等)；
/// 缺少必需字段的消息返回协议错误
pub fn event_from_message(msg: SignalingMessage) -> Result<Option<SignalingEvent>, SignalingError> {
    let event = match msg.kind {
        MessageType::Registered => SignalingEvent::Registered,
        MessageType::Offer | MessageType::Answer | MessageType::IceCandidate => {
            let from = msg.from.ok_or_else(|| {
                SignalingError::Protocol(format!("{} 缺少 from 字段", msg.kind.as_str()))
            })?;
            let payload = msg.payload.ok_or_else(|| {
                SignalingError::Protocol(format!("{} 缺少 payload 字段", msg.kind.as_str()))
            })?;
            match msg.kind {
                MessageType::Offer => SignalingEvent::Offer { from, payload },
                MessageType::Answer => SignalingEvent::Answer { from, payload },
                _ => SignalingEvent::IceCandidate { from, payload },
            }
        }
        MessageType::Hosts | MessageType::HostsUpdated => {
            SignalingEvent::HostList(msg.list.unwrap_or_default())
        }
        MessageType::HostDisconnected => {
            let host_id = msg.host_id.ok_or_else(|| {
                SignalingError::Protocol("host-disconnected 缺少 hostId 字段".to_string())
            })?;
            SignalingEvent::HostDisconnected(host_id)
        }
        MessageType::Error => SignalingEvent::Error(msg.message.unwrap_or_default()),
        MessageType::Pong => return Ok(None),
        MessageType::Unknown(kind) => {
            debug!("忽略未知信令类型: {}", kind);
            return Ok(None);
        }
        // 这些类型只会由客户端发出
        MessageType::Register | MessageType::ListHosts | MessageType::Ping => return Ok(None),
    };
    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn test_dispatch_table() {
        let offer = SignalingMessage::routed(
            MessageType::Offer,
            "controller-7",
            "host-1",
            json!({"type": "offer", "sdp": "v=0"}),
        );
        assert_eq!(
            event_from_message(offer).unwrap(),
            Some(SignalingEvent::Offer {
                from: "controller-7".into(),
                payload: json!({"type": "offer", "sdp": "v=0"}),
            })
        );

        assert_eq!(
            event_from_message(SignalingMessage::new(MessageType::Registered)).unwrap(),
            Some(SignalingEvent::Registered)
        );
        assert_eq!(
            event_from_message(SignalingMessage::new(MessageType::Pong)).unwrap(),
            None
        );
        assert_eq!(
            event_from_message(SignalingMessage::new(MessageType::Unknown("x".into()))).unwrap(),
            None
        );
        assert_eq!(
            event_from_message(SignalingMessage::error("boom")).unwrap(),
            Some(SignalingEvent::Error("boom".into()))
        );
        assert_eq!(
            event_from_message(SignalingMessage::new(MessageType::Hosts)).unwrap(),
            Some(SignalingEvent::HostList(Vec::new()))
        );
    }

    #[test]
    fn test_routed_message_without_from_is_protocol_error() {
        let mut msg = SignalingMessage::new(MessageType::Answer);
        msg.payload = Some(json!({}));
        assert!(matches!(
            event_from_message(msg),
            Err(SignalingError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let client = SignalingClient::new(
            "ws://127.0.0.1:1",
            "host-1",
            ClientType::Host,
            DEFAULT_HEARTBEAT,
        );
        let result = client.send(SignalingMessage::list_hosts()).await;
        assert!(matches!(result, Err(SignalingError::NotConnected)));
    }

    #[tokio::test]
    async fn test_invalid_url_rejected_before_dial() {
        for url in ["http://127.0.0.1:8080", "not a url"] {
            let client = SignalingClient::new(url, "host-1", ClientType::Host, DEFAULT_HEARTBEAT);
            assert!(matches!(
                client.connect().await,
                Err(SignalingError::Connection(_))
            ));
        }
        assert!(validate_url("wss://relay.example.com/ws").is_ok());
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_error() {
        // 绑定后立即释放，得到一个无人监听的端口
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = SignalingClient::new(
            format!("ws://127.0.0.1:{}", port),
            "host-1",
            ClientType::Host,
            DEFAULT_HEARTBEAT,
        );
        assert!(matches!(
            client.connect().await,
            Err(SignalingError::Connection(_))
        ));
    }

    /// 接受一个连接，读取注册消息后按脚本发送文本
    async fn scripted_server(script: Vec<String>) -> (u16, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut received = Vec::new();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                received.push(text);
            }
            for text in script {
                ws.send(Message::Text(text)).await.unwrap();
            }
            // 保持连接直到客户端关闭
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    received.push(text);
                }
            }
            received
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let (port, server) = scripted_server(vec![
            r#"{"type":"registered","id":"host-1","timestamp":1}"#.to_string(),
            r#"{"type":"pong"}"#.to_string(),
            r#"{"type":"offer","from":"controller-7","payload":{"type":"offer","sdp":"v=0"}}"#
                .to_string(),
        ])
        .await;

        let client = SignalingClient::new(
            format!("ws://127.0.0.1:{}", port),
            "host-1",
            ClientType::Host,
            DEFAULT_HEARTBEAT,
        );
        let mut events = client.take_events().unwrap();
        client.connect().await.unwrap();

        assert_eq!(events.recv().await, Some(SignalingEvent::Registered));
        assert_eq!(
            events.recv().await,
            Some(SignalingEvent::Offer {
                from: "controller-7".into(),
                payload: json!({"type": "offer", "sdp": "v=0"}),
            })
        );

        client.close().await;
        let received = server.await.unwrap();
        let register: Value = serde_json::from_str(&received[0]).unwrap();
        assert_eq!(
            register,
            json!({"type": "register", "id": "host-1", "clientType": "host"})
        );
    }

    #[tokio::test]
    async fn test_malformed_json_reports_error_once() {
        let (port, _server) = scripted_server(vec![
            "{not json".to_string(),
            r#"{"type":"registered"}"#.to_string(),
        ])
        .await;

        let client = SignalingClient::new(
            format!("ws://127.0.0.1:{}", port),
            "controller-7",
            ClientType::Controller,
            DEFAULT_HEARTBEAT,
        );
        let mut events = client.take_events().unwrap();
        client.connect().await.unwrap();

        let first = events.recv().await;
        assert!(matches!(first, Some(SignalingEvent::Error(_))));
        // 读循环已退出，通道关闭，之后的消息不再分发
        assert_eq!(events.recv().await, None);
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_silent() {
        let (port, server) = scripted_server(Vec::new()).await;
        let client = SignalingClient::new(
            format!("ws://127.0.0.1:{}", port),
            "host-1",
            ClientType::Host,
            DEFAULT_HEARTBEAT,
        );
        let mut events = client.take_events().unwrap();
        client.connect().await.unwrap();

        client.close().await;
        client.close().await;

        // 主动关闭不产生错误事件
        assert_eq!(events.recv().await, None);
        assert!(matches!(
            client.send(SignalingMessage::list_hosts()).await,
            Err(SignalingError::NotConnected)
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_sends_ping() {
        let (port, server) = scripted_server(Vec::new()).await;
        let client = SignalingClient::new(
            format!("ws://127.0.0.1:{}", port),
            "host-1",
            ClientType::Host,
            Duration::from_millis(20),
        );
        client.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        client.close().await;

        let received = server.await.unwrap();
        let pings = received
            .iter()
            .filter(|text| text.contains("\"ping\""))
            .count();
        assert!(pings >= 2, "收到 {} 个 ping", pings);
    }
}
