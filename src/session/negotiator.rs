//! 协商驱动
//!
//! 在一个循环中依次消费信令事件和当前会话的引擎事件，所以会话状态只在
//! 这一个任务里被修改。主机在收到新的 Offer 时先关闭旧会话再创建新会话。

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{NegotiationState, Role, Session};
use crate::error::{SessionError, SignalingError};
use crate::signaling::{HostInfo, SignalSender, SignalingEvent};
use crate::webrtc::{EngineEvent, EngineFactory, WebRTCConfig};

/// 会话建立后挂接流水线
pub trait SessionAttach: Send + Sync {
    /// 每个会话进入 `Connected` 时调用一次
    fn attach(&self, session: &mut Session) -> anyhow::Result<()>;
}

/// 循环的一步
enum Step {
    Stop,
    Signal(Option<SignalingEvent>),
    Engine(Option<EngineEvent>),
}

/// 处理结果
enum Flow {
    Continue,
    Finished,
}

/// 协商驱动
pub struct Negotiator {
    role: Role,
    config: WebRTCConfig,
    factory: Arc<dyn EngineFactory>,
    signaling: Arc<dyn SignalSender>,
    target: Option<String>,
    attach: Option<Arc<dyn SessionAttach>>,
    session: Option<Session>,
    attached: bool,
    state_tx: watch::Sender<NegotiationState>,
    hosts_tx: watch::Sender<Vec<HostInfo>>,
}

impl Negotiator {
    pub fn new(
        role: Role,
        config: WebRTCConfig,
        factory: Arc<dyn EngineFactory>,
        signaling: Arc<dyn SignalSender>,
    ) -> Self {
        let (state_tx, _) = watch::channel(NegotiationState::Idle);
        let (hosts_tx, _) = watch::channel(Vec::new());
        Self {
            role,
            config,
            factory,
            signaling,
            target: None,
            attach: None,
            session: None,
            attached: false,
            state_tx,
            hosts_tx,
        }
    }

    /// 控制端要连接的主机
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_attach(mut self, attach: Arc<dyn SessionAttach>) -> Self {
        self.attach = Some(attach);
        self
    }

    /// 订阅会话状态
    pub fn state(&self) -> watch::Receiver<NegotiationState> {
        self.state_tx.subscribe()
    }

    /// 订阅主机列表
    pub fn hosts(&self) -> watch::Receiver<Vec<HostInfo>> {
        self.hosts_tx.subscribe()
    }

    /// 运行直到取消、控制端会话结束，或信令断开且没有活动会话
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SignalingEvent>,
        cancel: CancellationToken,
    ) -> Result<(), SessionError> {
        let mut signaling_open = true;

        let result = loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => Step::Stop,
                event = events.recv(), if signaling_open => Step::Signal(event),
                event = next_engine_event(&mut self.session) => Step::Engine(event),
            };

            let flow = match step {
                Step::Stop => break Ok(()),
                Step::Signal(Some(event)) => self.handle_signaling_event(event).await,
                Step::Signal(None) => {
                    warn!("信令连接已断开");
                    signaling_open = false;
                    Ok(Flow::Continue)
                }
                Step::Engine(Some(event)) => self.handle_engine_event(event).await,
                Step::Engine(None) => Ok(Flow::Continue),
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Finished) => break Ok(()),
                Err(e) => break Err(e),
            }

            if !signaling_open && !self.has_live_session() {
                break Err(SessionError::Signaling(SignalingError::Connection(
                    "信令连接已断开".to_string(),
                )));
            }
        };

        if let Some(mut session) = self.session.take() {
            session.close().await;
            self.publish(NegotiationState::Closed);
        }
        result
    }

    fn has_live_session(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.state() != NegotiationState::Closed)
            .unwrap_or(false)
    }

    fn publish(&self, state: NegotiationState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn new_session(&self) -> Session {
        let session = Session::new(
            self.role,
            self.config.clone(),
            self.factory.clone(),
            self.signaling.clone(),
        );
        match &self.target {
            Some(target) => session.with_target(target.clone()),
            None => session,
        }
    }

    /// 处理一条信令事件
    async fn handle_signaling_event(&mut self, event: SignalingEvent) -> Result<Flow, SessionError> {
        match event {
            SignalingEvent::Registered => {
                info!("已注册到信令服务器");
                if self.session.is_some() {
                    debug!("重复的注册确认");
                    return Ok(Flow::Continue);
                }
                let mut session = self.new_session();
                let result = session.on_registered().await;
                self.session = Some(session);
                self.settle(result).await
            }
            SignalingEvent::Offer { from, payload } => {
                if self.role != Role::Host {
                    warn!("控制端收到 Offer，忽略 (来自 {})", from);
                    return Ok(Flow::Continue);
                }
                self.replace_host_session().await;
                let result = match self.session.as_mut() {
                    Some(session) => session.handle_offer(&from, &payload).await,
                    None => Err(SessionError::Closed),
                };
                self.settle(result).await
            }
            SignalingEvent::Answer { from, payload } => {
                let Some(session) = self.session.as_mut() else {
                    warn!("没有活动会话，忽略来自 {} 的 Answer", from);
                    return Ok(Flow::Continue);
                };
                if session.remote_peer() != Some(from.as_str()) {
                    warn!("忽略非目标对端 {} 的 Answer", from);
                    let err = SessionError::Protocol {
                        state: session.state().name(),
                        message: "answer from unexpected peer",
                    };
                    return self.settle(Err(err)).await;
                }
                let result = session.handle_answer(&payload).await;
                self.settle(result).await
            }
            SignalingEvent::IceCandidate { from, payload } => {
                let Some(session) = self.session.as_mut() else {
                    debug!("没有活动会话，忽略来自 {} 的 ICE 候选", from);
                    return Ok(Flow::Continue);
                };
                if let Some(peer) = session.remote_peer() {
                    if peer != from {
                        debug!("忽略非当前对端 {} 的 ICE 候选", from);
                        return Ok(Flow::Continue);
                    }
                }
                let result = session.handle_ice_candidate(&payload).await;
                self.settle(result).await
            }
            SignalingEvent::HostList(hosts) => {
                info!("主机列表: {} 台在线", hosts.iter().filter(|h| h.online).count());
                for host in &hosts {
                    debug!("  {} (online={})", host.id, host.online);
                }
                self.hosts_tx.send_replace(hosts);
                Ok(Flow::Continue)
            }
            SignalingEvent::HostDisconnected(host_id) => {
                info!("主机离线: {}", host_id);
                if self.role == Role::Controller && self.target.as_deref() == Some(host_id.as_str()) {
                    if let Some(session) = self.session.as_mut() {
                        session.close().await;
                    }
                    self.publish(NegotiationState::Closed);
                    return Ok(Flow::Finished);
                }
                Ok(Flow::Continue)
            }
            SignalingEvent::Error(message) => {
                error!("信令错误: {}", message);
                Ok(Flow::Continue)
            }
        }
    }

    /// 主机收到 Offer：当前会话不在等待 Offer 时，先关闭再新建
    async fn replace_host_session(&mut self) {
        let reusable = self
            .session
            .as_ref()
            .map(|s| s.state() == NegotiationState::AwaitingOffer)
            .unwrap_or(false);
        if reusable {
            return;
        }

        if let Some(mut old) = self.session.take() {
            if old.close().await {
                info!("新的 Offer 到达，替换现有会话");
            }
        }
        self.attached = false;

        let mut session = self.new_session();
        if let Err(e) = session.on_registered().await {
            warn!("初始化会话失败: {}", e);
        }
        self.session = Some(session);
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) -> Result<Flow, SessionError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(Flow::Continue);
        };
        let result = session.handle_engine_event(event).await;
        self.settle(result).await
    }

    /// 根据操作结果更新状态：协议错误只记录，其余错误关闭会话
    async fn settle(&mut self, result: Result<(), SessionError>) -> Result<Flow, SessionError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(Flow::Continue);
        };

        match result {
            Ok(()) => {}
            Err(e) if !e.is_fatal() => {
                warn!("{}", e);
            }
            Err(e) => {
                error!("会话失败: {}", e);
                session.close().await;
                self.publish(NegotiationState::Closed);
                return match self.role {
                    // 控制端不重试
                    Role::Controller => Err(e),
                    Role::Host => Ok(Flow::Continue),
                };
            }
        }

        let state = session.state();
        if state == NegotiationState::Connected && !self.attached {
            self.attached = true;
            if let Some(attach) = self.attach.clone() {
                if let Err(e) = attach.attach(session) {
                    error!("挂接流水线失败: {:#}", e);
                    session.close().await;
                    self.publish(NegotiationState::Closed);
                    return match self.role {
                        Role::Controller => Err(SessionError::Engine(e.to_string())),
                        Role::Host => Ok(Flow::Continue),
                    };
                }
            }
        }
        self.publish(state);
        Ok(Flow::Continue)
    }
}

async fn next_engine_event(session: &mut Option<Session>) -> Option<EngineEvent> {
    match session {
        Some(session) => session.next_engine_event().await,
        None => std::future::pending().await,
    }
}
