//! 会话协商
//!
//! 一个 [`Session`] 对应一次与对端的协商。主机与控制端共用同一个状态机，
//! 区别由 [`RolePolicy`] 描述：控制端发起 Offer，主机创建数据通道并应答。
//!
//! ```text
//! Idle → Registered → 控制端: Offering → AwaitingAnswer ─┐
//!                     主机:   AwaitingOffer → Answering ──┴→ Connected → Closed
//! ```
//!
//! 任何状态都可以进入 `Closed`。

pub mod negotiator;

pub use negotiator::{Negotiator, SessionAttach};

use std::sync::Arc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::signaling::{ClientType, MessageType, SignalSender, SignalingMessage};
use crate::transport::{ChannelSpec, ChannelTransport};
use crate::webrtc::{
    EngineEvent, EngineFactory, IceCandidate, PeerConnection, PeerConnectionState, SdpType,
    SessionDescription, WebRTCConfig,
};

/// 远端描述之前最多缓存的 ICE 候选数
pub const MAX_PENDING_ICE: usize = 64;

/// 协商状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Registered,
    Offering,
    AwaitingAnswer,
    AwaitingOffer,
    Answering,
    Connected,
    Closed,
}

impl NegotiationState {
    pub fn name(&self) -> &'static str {
        match self {
            NegotiationState::Idle => "Idle",
            NegotiationState::Registered => "Registered",
            NegotiationState::Offering => "Offering",
            NegotiationState::AwaitingAnswer => "AwaitingAnswer",
            NegotiationState::AwaitingOffer => "AwaitingOffer",
            NegotiationState::Answering => "Answering",
            NegotiationState::Connected => "Connected",
            NegotiationState::Closed => "Closed",
        }
    }
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// 会话角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Controller,
}

/// 角色差异
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolePolicy {
    /// 在设置本地描述之前创建两个数据通道
    pub creates_channels: bool,
    /// 注册后立即发起 Offer
    pub initiates: bool,
}

impl Role {
    pub fn policy(&self) -> RolePolicy {
        match self {
            Role::Host => RolePolicy {
                creates_channels: true,
                initiates: false,
            },
            Role::Controller => RolePolicy {
                creates_channels: false,
                initiates: true,
            },
        }
    }

    pub fn client_type(&self) -> ClientType {
        match self {
            Role::Host => ClientType::Host,
            Role::Controller => ClientType::Controller,
        }
    }
}

/// 一次协商会话
///
/// 独占自己的连接引擎和传输，关闭后不可复用
pub struct Session {
    role: Role,
    config: WebRTCConfig,
    factory: Arc<dyn EngineFactory>,
    signaling: Arc<dyn SignalSender>,
    state: NegotiationState,
    remote_peer: Option<String>,
    pc: Option<Arc<dyn PeerConnection>>,
    remote_set: bool,
    /// 远端描述设置之前到达的候选
    pending_ice: Vec<IceCandidate>,
    transport: Arc<ChannelTransport>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    engine_tx: mpsc::UnboundedSender<EngineEvent>,
    engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl Session {
    pub fn new(
        role: Role,
        config: WebRTCConfig,
        factory: Arc<dyn EngineFactory>,
        signaling: Arc<dyn SignalSender>,
    ) -> Self {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        Self {
            role,
            config,
            factory,
            signaling,
            state: NegotiationState::Idle,
            remote_peer: None,
            pc: None,
            remote_set: false,
            pending_ice: Vec::new(),
            transport: Arc::new(ChannelTransport::new()),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            engine_tx,
            engine_rx,
        }
    }

    /// 控制端的目标主机
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.remote_peer = Some(target.into());
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn remote_peer(&self) -> Option<&str> {
        self.remote_peer.as_deref()
    }

    pub fn transport(&self) -> Arc<ChannelTransport> {
        self.transport.clone()
    }

    /// 会话关闭时取消
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 登记一个随会话结束的任务，close 时等待其退出
    pub fn track_task(&mut self, handle: JoinHandle<()>) {
        self.tasks.push(handle);
    }

    /// 等待下一个引擎事件
    pub async fn next_engine_event(&mut self) -> Option<EngineEvent> {
        self.engine_rx.recv().await
    }

    fn protocol_error(&self, message: &'static str) -> SessionError {
        SessionError::Protocol {
            state: self.state.name(),
            message,
        }
    }

    fn set_state(&mut self, state: NegotiationState) {
        if self.state != state {
            debug!("会话状态: {} -> {}", self.state, state);
            self.state = state;
        }
    }

    async fn create_engine(&mut self) -> Result<Arc<dyn PeerConnection>, SessionError> {
        let pc = self
            .factory
            .create_connection(&self.config, self.engine_tx.clone())
            .await?;
        self.pc = Some(pc.clone());
        Ok(pc)
    }

    /// 信令注册完成
    pub async fn on_registered(&mut self) -> Result<(), SessionError> {
        if self.state != NegotiationState::Idle {
            return Err(self.protocol_error("registered"));
        }
        self.set_state(NegotiationState::Registered);

        if !self.role.policy().initiates {
            self.set_state(NegotiationState::AwaitingOffer);
            return Ok(());
        }

        let target = self
            .remote_peer
            .clone()
            .ok_or_else(|| SessionError::Negotiation("未指定目标主机".to_string()))?;

        self.set_state(NegotiationState::Offering);
        let pc = self.create_engine().await?;
        if self.role.policy().creates_channels {
            self.create_channels(&pc).await?;
        }

        let offer = pc.create_offer().await?;
        pc.set_local_description(offer.clone()).await?;
        self.signaling
            .send(SignalingMessage::routed(
                MessageType::Offer,
                self.signaling.local_id(),
                &target,
                offer.to_payload(),
            ))
            .await?;

        info!("已向 {} 发送 Offer", target);
        self.set_state(NegotiationState::AwaitingAnswer);
        Ok(())
    }

    async fn create_channels(&self, pc: &Arc<dyn PeerConnection>) -> Result<(), SessionError> {
        let frames = pc.create_data_channel(&ChannelSpec::FRAMES).await?;
        self.transport.set_frames_channel(frames);
        let input = pc.create_data_channel(&ChannelSpec::INPUT).await?;
        self.transport.set_input_channel(input);
        Ok(())
    }

    /// 处理 Offer (主机)
    pub async fn handle_offer(&mut self, from: &str, payload: &Value) -> Result<(), SessionError> {
        if self.role.policy().initiates || self.state != NegotiationState::AwaitingOffer {
            return Err(self.protocol_error("offer"));
        }
        let offer = SessionDescription::from_payload(payload, SdpType::Offer)?;

        // 从此只接受该对端的候选
        self.remote_peer = Some(from.to_string());
        self.set_state(NegotiationState::Answering);
        let pc = self.create_engine().await?;
        // 通道必须在本地描述确定之前创建
        if self.role.policy().creates_channels {
            self.create_channels(&pc).await?;
        }

        pc.set_remote_description(offer).await?;
        self.remote_set = true;
        self.flush_pending_ice().await?;

        let answer = pc.create_answer().await?;
        pc.set_local_description(answer.clone()).await?;

        self.signaling
            .send(SignalingMessage::routed(
                MessageType::Answer,
                self.signaling.local_id(),
                from,
                answer.to_payload(),
            ))
            .await?;

        info!("已向 {} 发送 Answer", from);
        Ok(())
    }

    /// 处理 Answer (控制端)
    ///
    /// 仅在 `AwaitingAnswer` 有效；否则返回协议错误，状态不变
    pub async fn handle_answer(&mut self, payload: &Value) -> Result<(), SessionError> {
        if self.state != NegotiationState::AwaitingAnswer {
            return Err(self.protocol_error("answer"));
        }
        let answer = SessionDescription::from_payload(payload, SdpType::Answer)?;
        let pc = self.pc.clone().ok_or(SessionError::Closed)?;

        pc.set_remote_description(answer).await?;
        self.remote_set = true;
        self.flush_pending_ice().await?;

        info!("已应用 Answer，会话建立");
        self.set_state(NegotiationState::Connected);
        Ok(())
    }

    /// 处理远端 ICE 候选
    ///
    /// 尚未绑定对端时丢弃；远端描述之前到达的候选最多缓存 [`MAX_PENDING_ICE`] 个
    pub async fn handle_ice_candidate(&mut self, payload: &Value) -> Result<(), SessionError> {
        if matches!(self.state, NegotiationState::Idle | NegotiationState::Closed) {
            return Err(self.protocol_error("ice-candidate"));
        }
        if self.remote_peer.is_none() {
            debug!("尚未绑定对端，丢弃远端 ICE 候选");
            return Ok(());
        }
        let candidate = IceCandidate::from_payload(payload)?;

        match (&self.pc, self.remote_set) {
            (Some(pc), true) => {
                pc.add_ice_candidate(candidate).await?;
            }
            _ if self.pending_ice.len() >= MAX_PENDING_ICE => {
                warn!("缓存的 ICE 候选已达上限 {}，丢弃", MAX_PENDING_ICE);
            }
            _ => {
                debug!("远端描述尚未设置，缓存 ICE 候选");
                self.pending_ice.push(candidate);
            }
        }
        Ok(())
    }

    async fn flush_pending_ice(&mut self) -> Result<(), SessionError> {
        let Some(pc) = self.pc.clone() else {
            return Ok(());
        };
        let pending = std::mem::take(&mut self.pending_ice);
        if !pending.is_empty() {
            debug!("应用 {} 个缓存的 ICE 候选", pending.len());
        }
        for candidate in pending {
            pc.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// 处理引擎事件
    pub async fn handle_engine_event(&mut self, event: EngineEvent) -> Result<(), SessionError> {
        if self.state == NegotiationState::Closed {
            return Ok(());
        }

        match event {
            EngineEvent::IceCandidate(candidate) => {
                // 还没有对端时无处可发
                let Some(peer) = self.remote_peer.clone() else {
                    debug!("尚未绑定对端，丢弃本地 ICE 候选");
                    return Ok(());
                };
                self.signaling
                    .send(SignalingMessage::routed(
                        MessageType::IceCandidate,
                        self.signaling.local_id(),
                        &peer,
                        candidate.to_payload(),
                    ))
                    .await?;
            }
            EngineEvent::DataChannel(channel) => {
                info!("收到数据通道: {}", channel.label());
                self.transport.bind_by_label(channel);
            }
            EngineEvent::StateChanged(state) => {
                info!("连接状态: {:?}", state);
                match state {
                    PeerConnectionState::Connected => {
                        if self.state == NegotiationState::Answering {
                            self.set_state(NegotiationState::Connected);
                        }
                    }
                    PeerConnectionState::Failed => {
                        return Err(SessionError::Engine("连接失败".to_string()));
                    }
                    PeerConnectionState::Disconnected => {
                        warn!("连接中断");
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// 关闭会话 (幂等)
    ///
    /// 依次取消流水线、等待其退出、关闭引擎、解绑通道。返回是否执行了关闭。
    pub async fn close(&mut self) -> bool {
        if self.state == NegotiationState::Closed {
            return false;
        }
        self.set_state(NegotiationState::Closed);
        self.cancel.cancel();

        for handle in self.tasks.drain(..) {
            if let Err(e) = handle.await {
                warn!("会话任务异常退出: {}", e);
            }
        }

        if let Some(pc) = self.pc.take() {
            if let Err(e) = pc.close().await {
                warn!("关闭连接失败: {}", e);
            }
        }
        self.transport.clear().await;
        self.pending_ice.clear();
        self.remote_set = false;

        info!("会话已关闭");
        true
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::error::SignalingError;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// 记录所有发出的信令
    pub struct RecordingSender {
        id: String,
        pub sent: Mutex<Vec<SignalingMessage>>,
    }

    impl RecordingSender {
        pub fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                sent: Mutex::new(Vec::new()),
            })
        }

        pub fn of_kind(&self, kind: MessageType) -> Vec<SignalingMessage> {
            self.sent
                .lock()
                .iter()
                .filter(|m| m.kind == kind)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl SignalSender for RecordingSender {
        fn local_id(&self) -> &str {
            &self.id
        }

        async fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
            self.sent.lock().push(msg);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingSender;
    use super::*;
    use crate::webrtc::mock::MockEngineFactory;
    use serde_json::json;

    fn session(role: Role, factory: &MockEngineFactory, sender: &Arc<RecordingSender>) -> Session {
        Session::new(
            role,
            WebRTCConfig::default(),
            Arc::new(factory.clone()),
            sender.clone(),
        )
    }

    fn candidate(n: u32) -> Value {
        json!({"candidate": format!("candidate:{} 1 udp 1 10.0.0.{} 5000 typ host", n, n), "sdpMid": "0", "sdpMLineIndex": 0})
    }

    /// 执行完整的 offer / answer 交换
    async fn negotiate(host: &mut Session, controller: &mut Session, controller_tx: &RecordingSender, host_tx: &RecordingSender) {
        host.on_registered().await.unwrap();
        controller.on_registered().await.unwrap();
        let offer = controller_tx.of_kind(MessageType::Offer).remove(0);
        host.handle_offer("controller-7", offer.payload.as_ref().unwrap())
            .await
            .unwrap();
        let answer = host_tx.of_kind(MessageType::Answer).remove(0);
        controller
            .handle_answer(answer.payload.as_ref().unwrap())
            .await
            .unwrap();
    }

    #[test]
    fn test_role_policy() {
        assert!(Role::Host.policy().creates_channels);
        assert!(!Role::Host.policy().initiates);
        assert!(Role::Controller.policy().initiates);
        assert!(!Role::Controller.policy().creates_channels);
        assert_eq!(Role::Host.client_type(), ClientType::Host);
    }

    #[tokio::test]
    async fn test_answer_before_offer_is_protocol_error() {
        let factory = MockEngineFactory::new();
        let sender = RecordingSender::new("controller-7");
        let mut controller = session(Role::Controller, &factory, &sender).with_target("host-1");

        let err = controller
            .handle_answer(&json!({"type": "answer", "sdp": "mock-answer 1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Protocol { state: "Idle", message: "answer" }));
        assert!(!err.is_fatal());
        assert_eq!(controller.state(), NegotiationState::Idle);

        let host_sender = RecordingSender::new("host-1");
        let mut host = session(Role::Host, &factory, &host_sender);
        host.on_registered().await.unwrap();
        assert!(host.handle_answer(&json!({})).await.is_err());
        assert_eq!(host.state(), NegotiationState::AwaitingOffer);
    }

    #[tokio::test]
    async fn test_controller_sends_offer_on_registered() {
        let factory = MockEngineFactory::new();
        let sender = RecordingSender::new("controller-7");
        let mut controller = session(Role::Controller, &factory, &sender).with_target("host-1");

        controller.on_registered().await.unwrap();
        assert_eq!(controller.state(), NegotiationState::AwaitingAnswer);

        let offers = sender.of_kind(MessageType::Offer);
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].from.as_deref(), Some("controller-7"));
        assert_eq!(offers[0].target.as_deref(), Some("host-1"));
        assert_eq!(offers[0].payload.as_ref().unwrap()["type"], "offer");

        let pc = &factory.network().connections()[0];
        assert_eq!(pc.calls(), vec!["create_offer", "set_local_description"]);
    }

    #[tokio::test]
    async fn test_controller_without_target_fails() {
        let factory = MockEngineFactory::new();
        let sender = RecordingSender::new("controller-7");
        let mut controller = session(Role::Controller, &factory, &sender);
        assert!(matches!(
            controller.on_registered().await,
            Err(SessionError::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn test_host_creates_channels_before_descriptions() {
        let factory = MockEngineFactory::new();
        let host_tx = RecordingSender::new("host-1");
        let controller_tx = RecordingSender::new("controller-7");
        let mut host = session(Role::Host, &factory, &host_tx);
        let mut controller = session(Role::Controller, &factory, &controller_tx).with_target("host-1");

        negotiate(&mut host, &mut controller, &controller_tx, &host_tx).await;

        assert_eq!(host.state(), NegotiationState::Answering);
        assert_eq!(host.remote_peer(), Some("controller-7"));
        assert_eq!(controller.state(), NegotiationState::Connected);

        let host_pc = &factory.network().connections()[1];
        assert_eq!(
            host_pc.calls(),
            vec![
                "create_data_channel",
                "create_data_channel",
                "set_remote_description",
                "create_answer",
                "set_local_description",
            ]
        );
        let answer = &host_tx.of_kind(MessageType::Answer)[0];
        assert_eq!(answer.target.as_deref(), Some("controller-7"));
    }

    #[tokio::test]
    async fn test_host_connected_on_engine_event() {
        let factory = MockEngineFactory::new();
        let host_tx = RecordingSender::new("host-1");
        let controller_tx = RecordingSender::new("controller-7");
        let mut host = session(Role::Host, &factory, &host_tx);
        let mut controller = session(Role::Controller, &factory, &controller_tx).with_target("host-1");

        negotiate(&mut host, &mut controller, &controller_tx, &host_tx).await;

        while host.state() != NegotiationState::Connected {
            let event = host.next_engine_event().await.unwrap();
            host.handle_engine_event(event).await.unwrap();
        }
        // 本地候选发给已绑定的对端
        let ice = host_tx.of_kind(MessageType::IceCandidate);
        assert!(!ice.is_empty());
        assert_eq!(ice[0].target.as_deref(), Some("controller-7"));
    }

    #[tokio::test]
    async fn test_early_ice_is_buffered_and_flushed() {
        let factory = MockEngineFactory::new();
        let host_tx = RecordingSender::new("host-1");
        let controller_tx = RecordingSender::new("controller-7");
        let mut host = session(Role::Host, &factory, &host_tx);
        let mut controller = session(Role::Controller, &factory, &controller_tx).with_target("host-1");

        host.on_registered().await.unwrap();
        controller.on_registered().await.unwrap();

        // 主机的候选先于 Answer 到达控制端
        controller.handle_ice_candidate(&candidate(1)).await.unwrap();
        controller.handle_ice_candidate(&candidate(2)).await.unwrap();
        let controller_pc = factory.network().connections()[0].clone();
        assert!(controller_pc.applied_candidates().is_empty());

        let offer = controller_tx.of_kind(MessageType::Offer).remove(0);
        host.handle_offer("controller-7", offer.payload.as_ref().unwrap())
            .await
            .unwrap();
        let answer = host_tx.of_kind(MessageType::Answer).remove(0);
        controller
            .handle_answer(answer.payload.as_ref().unwrap())
            .await
            .unwrap();

        let applied = controller_pc.applied_candidates();
        assert_eq!(applied.len(), 2);
        assert!(applied[0].candidate.starts_with("candidate:1 "));
        assert!(applied[1].candidate.starts_with("candidate:2 "));

        // 之后的候选直接应用
        controller.handle_ice_candidate(&candidate(3)).await.unwrap();
        assert_eq!(controller_pc.applied_candidates().len(), 3);
    }

    #[tokio::test]
    async fn test_host_drops_remote_ice_before_offer() {
        let factory = MockEngineFactory::new();
        let host_tx = RecordingSender::new("host-1");
        let controller_tx = RecordingSender::new("controller-y");
        let mut host = session(Role::Host, &factory, &host_tx);
        let mut controller = session(Role::Controller, &factory, &controller_tx).with_target("host-1");

        host.on_registered().await.unwrap();
        for n in 0..500 {
            host.handle_ice_candidate(&candidate(n)).await.unwrap();
        }

        controller.on_registered().await.unwrap();
        let offer = controller_tx.of_kind(MessageType::Offer).remove(0);
        host.handle_offer("controller-y", offer.payload.as_ref().unwrap())
            .await
            .unwrap();

        let host_pc = &factory.network().connections()[1];
        assert!(host_pc.applied_candidates().is_empty());

        // 绑定对端之后的候选照常应用
        host.handle_ice_candidate(&candidate(7)).await.unwrap();
        assert_eq!(host_pc.applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_ice_is_capped() {
        let factory = MockEngineFactory::new();
        let host_tx = RecordingSender::new("host-1");
        let controller_tx = RecordingSender::new("controller-7");
        let mut host = session(Role::Host, &factory, &host_tx);
        let mut controller = session(Role::Controller, &factory, &controller_tx).with_target("host-1");

        host.on_registered().await.unwrap();
        controller.on_registered().await.unwrap();
        for n in 0..(MAX_PENDING_ICE as u32 + 40) {
            controller.handle_ice_candidate(&candidate(n)).await.unwrap();
        }

        let offer = controller_tx.of_kind(MessageType::Offer).remove(0);
        host.handle_offer("controller-7", offer.payload.as_ref().unwrap())
            .await
            .unwrap();
        let answer = host_tx.of_kind(MessageType::Answer).remove(0);
        controller
            .handle_answer(answer.payload.as_ref().unwrap())
            .await
            .unwrap();

        let controller_pc = &factory.network().connections()[0];
        assert_eq!(controller_pc.applied_candidates().len(), MAX_PENDING_ICE);
    }

    #[tokio::test]
    async fn test_local_ice_dropped_without_peer() {
        let factory = MockEngineFactory::new();
        let sender = RecordingSender::new("host-1");
        let mut host = session(Role::Host, &factory, &sender);
        host.on_registered().await.unwrap();

        let event = EngineEvent::IceCandidate(IceCandidate::from_payload(&candidate(1)).unwrap());
        host.handle_engine_event(event).await.unwrap();
        assert!(sender.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_offer_is_negotiation_error() {
        let factory = MockEngineFactory::new();
        let sender = RecordingSender::new("host-1");
        let mut host = session(Role::Host, &factory, &sender);
        host.on_registered().await.unwrap();

        let err = host
            .handle_offer("controller-7", &json!({"sdp": 42}))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Negotiation(_)));
        assert!(err.is_fatal());
        // 负载无效时不创建引擎
        assert!(factory.network().connections().is_empty());
    }

    #[tokio::test]
    async fn test_engine_creation_failure_is_fatal() {
        let factory = MockEngineFactory::new();
        factory.fail_creation(true);
        let sender = RecordingSender::new("controller-7");
        let mut controller = session(Role::Controller, &factory, &sender).with_target("host-1");

        let err = controller.on_registered().await.unwrap_err();
        assert!(matches!(err, SessionError::Engine(_)));
        assert!(err.is_fatal());
        assert!(sender.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_engine_failed_state_is_fatal() {
        let factory = MockEngineFactory::new();
        let sender = RecordingSender::new("host-1");
        let mut host = session(Role::Host, &factory, &sender);
        host.on_registered().await.unwrap();
        let result = host
            .handle_engine_event(EngineEvent::StateChanged(PeerConnectionState::Failed))
            .await;
        assert!(matches!(result, Err(SessionError::Engine(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let factory = MockEngineFactory::new();
        let sender = RecordingSender::new("controller-7");
        let mut controller = session(Role::Controller, &factory, &sender).with_target("host-1");
        controller.on_registered().await.unwrap();

        let cancel = controller.cancellation();
        let task_cancel = cancel.clone();
        controller.track_task(tokio::spawn(async move {
            task_cancel.cancelled().await;
        }));

        assert!(controller.close().await);
        assert!(!controller.close().await);
        assert!(cancel.is_cancelled());
        assert_eq!(controller.state(), NegotiationState::Closed);

        let pc = &factory.network().connections()[0];
        assert!(pc.is_closed());
        assert_eq!(pc.calls().iter().filter(|c| **c == "close").count(), 1);

        // 关闭后的消息被拒绝
        assert!(controller.handle_ice_candidate(&candidate(1)).await.is_err());
    }
}
