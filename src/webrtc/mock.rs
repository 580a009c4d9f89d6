//! 内存连接引擎
//!
//! 不经过网络的连接引擎，用于测试和本地模拟。同一个 [`MockEngineFactory`]
//! 创建的连接共享一个 [`MockNetwork`]：SDP 中携带连接编号，Offer 端设置
//! Answer 作为远端描述时两端互联，双方创建的通道在对端以 `DataChannel`
//! 事件出现，随后两端都收到 `Connected`。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use super::{
    DataChannel, EngineEvent, EngineFactory, IceCandidate, MessageHandler, PeerConnection,
    PeerConnectionState, SdpType, SessionDescription, WebRTCConfig,
};
use crate::error::{SessionError, TransportError};
use crate::transport::ChannelSpec;

type SharedHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// 内存数据通道
///
/// 每个通道有一个投递任务，按到达顺序调用接收回调
pub struct MockDataChannel {
    label: String,
    open: AtomicBool,
    peer: Mutex<Weak<MockDataChannel>>,
    handler: Arc<Mutex<Option<SharedHandler>>>,
    inbox: mpsc::UnboundedSender<Vec<u8>>,
    sent: AtomicU64,
}

impl MockDataChannel {
    fn new(label: &str) -> Arc<Self> {
        let (inbox, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let handler: Arc<Mutex<Option<SharedHandler>>> = Arc::new(Mutex::new(None));

        let deliver = handler.clone();
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                let handler = deliver.lock().clone();
                if let Some(handler) = handler {
                    handler(data);
                }
            }
        });

        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            peer: Mutex::new(Weak::new()),
            handler,
            inbox,
            sent: AtomicU64::new(0),
        })
    }

    fn pair(a: &Arc<Self>, b: &Arc<Self>) {
        *a.peer.lock() = Arc::downgrade(b);
        *b.peer.lock() = Arc::downgrade(a);
        a.open.store(true, Ordering::SeqCst);
        b.open.store(true, Ordering::SeqCst);
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(peer) = self.peer.lock().upgrade() {
            peer.open.store(false, Ordering::SeqCst);
        }
    }

    /// 已成功发送的消息数
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Send(format!("通道 {} 未连接", self.label)));
        }
        let peer = self
            .peer
            .lock()
            .upgrade()
            .ok_or_else(|| TransportError::Send(format!("通道 {} 对端已释放", self.label)))?;
        peer.inbox
            .send(data.to_vec())
            .map_err(|_| TransportError::Send(format!("通道 {} 对端已关闭", self.label)))?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        *self.handler.lock() = Some(Arc::from(handler));
    }

    async fn close(&self) {
        self.mark_closed();
    }
}

/// 内存对等连接
pub struct MockPeerConnection {
    id: u64,
    this: Weak<MockPeerConnection>,
    network: Arc<MockNetwork>,
    events: mpsc::UnboundedSender<EngineEvent>,
    created: Mutex<Vec<Arc<MockDataChannel>>>,
    mirrored: Mutex<Vec<Arc<MockDataChannel>>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    applied: Mutex<Vec<IceCandidate>>,
    calls: Mutex<Vec<&'static str>>,
    closed: AtomicBool,
}

impl MockPeerConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 按顺序记录的接口调用
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    /// 已应用的远端 ICE 候选
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied.lock().clone()
    }

    /// 本端创建的通道
    pub fn created_channels(&self) -> Vec<Arc<MockDataChannel>> {
        self.created.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().push(call);
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Engine("连接已关闭".to_string()));
        }
        Ok(())
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// 两端互联：双方创建的通道在对端镜像出现
    fn link(a: &Arc<Self>, b: &Arc<Self>) {
        for (from, to) in [(a, b), (b, a)] {
            let channels = from.created.lock().clone();
            for channel in channels {
                let mirror = MockDataChannel::new(&channel.label);
                MockDataChannel::pair(&channel, &mirror);
                to.mirrored.lock().push(mirror.clone());
                to.emit(EngineEvent::DataChannel(mirror));
            }
        }
        a.emit(EngineEvent::StateChanged(PeerConnectionState::Connected));
        b.emit(EngineEvent::StateChanged(PeerConnectionState::Connected));
    }
}

/// SDP 格式: `mock-<kind> <id>`
fn encode_sdp(kind: SdpType, id: u64) -> String {
    match kind {
        SdpType::Offer => format!("mock-offer {}", id),
        SdpType::Answer => format!("mock-answer {}", id),
    }
}

fn decode_sdp(desc: &SessionDescription) -> Result<u64, SessionError> {
    let prefix = match desc.sdp_type {
        SdpType::Offer => "mock-offer ",
        SdpType::Answer => "mock-answer ",
    };
    desc.sdp
        .strip_prefix(prefix)
        .and_then(|id| id.trim().parse().ok())
        .ok_or_else(|| SessionError::Negotiation(format!("无法解析 SDP: {:?}", desc.sdp)))
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        self.ensure_open()?;
        self.record("create_offer");
        Ok(SessionDescription::offer(encode_sdp(SdpType::Offer, self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        self.ensure_open()?;
        self.record("create_answer");
        let has_offer = matches!(
            self.remote.lock().as_ref(),
            Some(desc) if desc.sdp_type == SdpType::Offer
        );
        if !has_offer {
            return Err(SessionError::Engine("尚未设置远端 Offer".to_string()));
        }
        Ok(SessionDescription::answer(encode_sdp(SdpType::Answer, self.id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.record("set_local_description");
        *self.local.lock() = Some(desc);
        self.emit(EngineEvent::IceCandidate(IceCandidate {
            candidate: format!("candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host", self.id, 50000 + self.id),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.record("set_remote_description");
        let remote_id = decode_sdp(&desc)?;
        let sdp_type = desc.sdp_type;
        *self.remote.lock() = Some(desc);

        if sdp_type == SdpType::Answer {
            let peer = self
                .network
                .get(remote_id)
                .ok_or_else(|| SessionError::Engine(format!("找不到对端连接 {}", remote_id)))?;
            if let Some(this) = self.this.upgrade() {
                Self::link(&this, &peer);
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.record("add_ice_candidate");
        if self.remote.lock().is_none() {
            return Err(SessionError::Engine("远端描述尚未设置".to_string()));
        }
        self.applied.lock().push(candidate);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        spec: &ChannelSpec,
    ) -> Result<Arc<dyn DataChannel>, SessionError> {
        self.ensure_open()?;
        self.record("create_data_channel");
        let channel = MockDataChannel::new(spec.label);
        self.created.lock().push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.record("close");
        for channel in self.created.lock().iter().chain(self.mirrored.lock().iter()) {
            channel.mark_closed();
        }
        self.emit(EngineEvent::StateChanged(PeerConnectionState::Closed));
        Ok(())
    }
}

/// 内存网络：登记所有创建过的连接
#[derive(Default)]
pub struct MockNetwork {
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, Arc<MockPeerConnection>>>,
    fail_creation: AtomicBool,
}

impl MockNetwork {
    fn get(&self, id: u64) -> Option<Arc<MockPeerConnection>> {
        self.connections.lock().get(&id).cloned()
    }

    /// 按创建顺序返回所有连接
    pub fn connections(&self) -> Vec<Arc<MockPeerConnection>> {
        let mut all: Vec<_> = self.connections.lock().values().cloned().collect();
        all.sort_by_key(|c| c.id);
        all
    }
}

/// 内存连接引擎工厂
#[derive(Clone, Default)]
pub struct MockEngineFactory {
    network: Arc<MockNetwork>,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn network(&self) -> &Arc<MockNetwork> {
        &self.network
    }

    /// 之后的 create_connection 调用失败
    pub fn fail_creation(&self, fail: bool) {
        self.network.fail_creation.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create_connection(
        &self,
        _config: &WebRTCConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn PeerConnection>, SessionError> {
        if self.network.fail_creation.load(Ordering::SeqCst) {
            return Err(SessionError::Engine("模拟的引擎创建失败".to_string()));
        }

        let id = self.network.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let network = self.network.clone();
        let pc = Arc::new_cyclic(|this| MockPeerConnection {
            id,
            this: this.clone(),
            network,
            events,
            created: Mutex::new(Vec::new()),
            mirrored: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.network.connections.lock().insert(id, pc.clone());
        tracing::debug!("创建内存连接 {}", id);
        Ok(pc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next_channel(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Arc<dyn DataChannel> {
        loop {
            match rx.recv().await {
                Some(EngineEvent::DataChannel(dc)) => return dc,
                Some(_) => continue,
                None => panic!("事件通道已关闭"),
            }
        }
    }

    #[tokio::test]
    async fn test_offer_answer_links_channels() {
        let factory = MockEngineFactory::new();
        let config = WebRTCConfig::default();
        let (offer_tx, mut offer_rx) = mpsc::unbounded_channel();
        let (answer_tx, _answer_rx) = mpsc::unbounded_channel();

        let offerer = factory.create_connection(&config, offer_tx).await.unwrap();
        let answerer = factory.create_connection(&config, answer_tx).await.unwrap();

        let input = answerer.create_data_channel(&ChannelSpec::INPUT).await.unwrap();
        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        let mirror = next_channel(&mut offer_rx).await;
        assert_eq!(mirror.label(), "input");
        assert!(mirror.is_open());
        assert!(input.is_open());

        let (tx, mut rx) = mpsc::unbounded_channel();
        input.on_message(Box::new(move |data| {
            let _ = tx.send(data);
        }));
        mirror.send(b"hello").await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_ice_requires_remote_description() {
        let factory = MockEngineFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pc = factory
            .create_connection(&WebRTCConfig::default(), tx)
            .await
            .unwrap();
        let candidate = IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        };
        assert!(pc.add_ice_candidate(candidate).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_creation() {
        let factory = MockEngineFactory::new();
        factory.fail_creation(true);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(factory
            .create_connection(&WebRTCConfig::default(), tx)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_malformed_sdp_rejected() {
        let factory = MockEngineFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pc = factory
            .create_connection(&WebRTCConfig::default(), tx)
            .await
            .unwrap();
        let result = pc
            .set_remote_description(SessionDescription::offer("v=0 garbage"))
            .await;
        assert!(matches!(result, Err(SessionError::Negotiation(_))));
    }
}
