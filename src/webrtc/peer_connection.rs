//! webrtc-rs 连接引擎
//!
//! 把 `RTCPeerConnection` 的回调转换成 [`EngineEvent`] 写入会话的事件通道。

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    DataChannel, EngineEvent, EngineFactory, IceCandidate, MessageHandler, PeerConnection,
    PeerConnectionState, SdpType, SessionDescription, WebRTCConfig,
};
use crate::error::{SessionError, TransportError};
use crate::transport::ChannelSpec;

fn engine_err(context: &str, e: impl std::fmt::Display) -> SessionError {
    SessionError::Engine(format!("{}: {}", context, e))
}

fn ice_servers(config: &WebRTCConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !config.stun_servers.is_empty() {
        servers.push(RTCIceServer {
            urls: config.stun_servers.clone(),
            ..Default::default()
        });
    }
    for turn in &config.turn_servers {
        servers.push(RTCIceServer {
            urls: vec![turn.url.clone()],
            username: turn.username.clone(),
            credential: turn.password.clone(),
            ..Default::default()
        });
    }
    servers
}

fn convert_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            PeerConnectionState::New
        }
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

/// webrtc-rs 数据通道
pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

impl RtcDataChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        Arc::new(Self { dc })
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        self.dc
            .send(&Bytes::copy_from_slice(data))
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn on_message(&self, handler: MessageHandler) {
        let label = self.label();
        self.dc.on_message(Box::new(move |msg: DataChannelMessage| {
            if msg.is_string {
                tracing::debug!("通道 {} 收到文本消息，忽略", label);
            } else {
                handler(msg.data.to_vec());
            }
            Box::pin(async {})
        }));
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            tracing::debug!("关闭数据通道 {} 失败: {}", self.dc.label(), e);
        }
    }
}

/// webrtc-rs 对等连接
pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeerConnection {
    fn install_handlers(pc: &RTCPeerConnection, events: mpsc::UnboundedSender<EngineEvent>) {
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // None 表示收集结束
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(EngineEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::warn!("序列化 ICE 候选失败: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            tracing::debug!("收到对端数据通道: {}", dc.label());
            let _ = tx.send(EngineEvent::DataChannel(RtcDataChannel::new(dc)));
            Box::pin(async {})
        }));

        let tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::info!("PeerConnection 状态: {}", state);
            let _ = tx.send(EngineEvent::StateChanged(convert_state(state)));
            Box::pin(async {})
        }));
    }

    fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, SessionError> {
        let result = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        };
        result.map_err(|e| SessionError::Negotiation(format!("无效的 SDP: {}", e)))
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| engine_err("创建 Offer 失败", e))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| engine_err("创建 Answer 失败", e))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), SessionError> {
        self.pc
            .set_local_description(Self::to_rtc(desc)?)
            .await
            .map_err(|e| engine_err("设置本地描述失败", e))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SessionError> {
        self.pc
            .set_remote_description(Self::to_rtc(desc)?)
            .await
            .map_err(|e| SessionError::Negotiation(format!("设置远端描述失败: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| SessionError::Negotiation(format!("添加 ICE 候选失败: {}", e)))
    }

    async fn create_data_channel(
        &self,
        spec: &ChannelSpec,
    ) -> Result<Arc<dyn DataChannel>, SessionError> {
        let init = RTCDataChannelInit {
            ordered: Some(spec.ordered),
            max_retransmits: spec.max_retransmits,
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(spec.label, Some(init))
            .await
            .map_err(|e| engine_err("创建数据通道失败", e))?;
        Ok(RtcDataChannel::new(dc))
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.pc
            .close()
            .await
            .map_err(|e| engine_err("关闭 PeerConnection 失败", e))
    }
}

/// webrtc-rs 引擎工厂
#[derive(Debug, Default)]
pub struct RtcEngineFactory;

impl RtcEngineFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EngineFactory for RtcEngineFactory {
    async fn create_connection(
        &self,
        config: &WebRTCConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn PeerConnection>, SessionError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| engine_err("注册编解码器失败", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| engine_err("注册拦截器失败", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(config),
            ..Default::default()
        };
        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| engine_err("创建 PeerConnection 失败", e))?;

        tracing::info!(
            "创建 PeerConnection: {} 个 STUN, {} 个 TURN",
            config.stun_servers.len(),
            config.turn_servers.len()
        );
        RtcPeerConnection::install_handlers(&pc, events);
        Ok(Arc::new(RtcPeerConnection { pc: Arc::new(pc) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::TurnServer;

    #[test]
    fn test_ice_servers_from_config() {
        let config = WebRTCConfig {
            stun_servers: vec!["stun:a:3478".into(), "stun:b:3478".into()],
            turn_servers: vec![TurnServer {
                url: "turn:c:3478".into(),
                username: "u".into(),
                password: "p".into(),
            }],
        };
        let servers = ice_servers(&config);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls.len(), 2);
        assert_eq!(servers[1].username, "u");

        let empty = WebRTCConfig {
            stun_servers: vec![],
            turn_servers: vec![],
        };
        assert!(ice_servers(&empty).is_empty());
    }

    #[tokio::test]
    async fn test_offer_contains_data_channel_section() {
        let factory = RtcEngineFactory::new();
        let config = WebRTCConfig {
            stun_servers: vec![],
            turn_servers: vec![],
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let pc = factory.create_connection(&config, tx).await.unwrap();
        let dc = pc.create_data_channel(&ChannelSpec::INPUT).await.unwrap();
        assert_eq!(dc.label(), "input");
        assert!(!dc.is_open());

        let offer = pc.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=application"));

        // 远端描述之前添加候选会失败
        let early = IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        assert!(pc.add_ice_candidate(early).await.is_err());
        pc.close().await.unwrap();
    }
}
