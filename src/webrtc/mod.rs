//! WebRTC 模块
//!
//! 连接引擎的抽象层：SDP / ICE 负载格式、引擎事件，以及
//! `EngineFactory` / `PeerConnection` / `DataChannel` 三个接口。
//! 真实实现基于 webrtc-rs (feature `webrtc`)，测试使用内存实现 [`mock`]。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{SessionError, TransportError};
use crate::transport::ChannelSpec;

pub mod mock;
#[cfg(feature = "webrtc")]
pub mod peer_connection;

/// WebRTC 配置
///
/// 每个会话创建时显式传入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRTCConfig {
    /// STUN 服务器 URL
    pub stun_servers: Vec<String>,
    /// TURN 服务器
    pub turn_servers: Vec<TurnServer>,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
        }
    }
}

/// TURN 服务器配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub password: String,
}

/// SDP 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// SDP 描述，信令 payload 形如 `{"type":"offer","sdp":"..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// 解析信令 payload，并校验 SDP 类型
    pub fn from_payload(payload: &Value, expected: SdpType) -> Result<Self, SessionError> {
        let desc: Self = serde_json::from_value(payload.clone())
            .map_err(|e| SessionError::Negotiation(format!("无效的 SDP 负载: {}", e)))?;
        if desc.sdp_type != expected {
            return Err(SessionError::Negotiation(format!(
                "SDP 类型不匹配: 期望 {:?}，实际 {:?}",
                expected, desc.sdp_type
            )));
        }
        Ok(desc)
    }
}

/// ICE 候选，字段名与浏览器的 `RTCIceCandidateInit` 一致
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_payload(payload: &Value) -> Result<Self, SessionError> {
        serde_json::from_value(payload.clone())
            .map_err(|e| SessionError::Negotiation(format!("无效的 ICE 候选: {}", e)))
    }
}

/// PeerConnection 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// 引擎在自身线程上产生的异步事件
pub enum EngineEvent {
    /// 本地发现的 ICE 候选
    IceCandidate(IceCandidate),
    /// 对端创建的数据通道
    DataChannel(Arc<dyn DataChannel>),
    /// 连接状态变化
    StateChanged(PeerConnectionState),
}

impl std::fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            EngineEvent::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
            EngineEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
        }
    }
}

/// 数据通道消息回调
pub type MessageHandler = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// 数据通道
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    /// 发送一条二进制消息，不等待送达确认
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// 设置接收回调，替换之前的回调
    fn on_message(&self, handler: MessageHandler);

    async fn close(&self);
}

/// 一条对等连接
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, SessionError>;

    async fn create_answer(&self) -> Result<SessionDescription, SessionError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), SessionError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), SessionError>;

    /// 远端描述设置之前调用会失败
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError>;

    async fn create_data_channel(
        &self,
        spec: &ChannelSpec,
    ) -> Result<Arc<dyn DataChannel>, SessionError>;

    async fn close(&self) -> Result<(), SessionError>;
}

/// 连接引擎工厂
#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// 创建连接，引擎事件写入 `events`
    async fn create_connection(
        &self,
        config: &WebRTCConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn PeerConnection>, SessionError>;
}

/// 默认连接引擎
#[cfg(feature = "webrtc")]
pub fn default_engine_factory() -> anyhow::Result<Arc<dyn EngineFactory>> {
    Ok(Arc::new(peer_connection::RtcEngineFactory::new()))
}

/// 默认连接引擎
#[cfg(not(feature = "webrtc"))]
pub fn default_engine_factory() -> anyhow::Result<Arc<dyn EngineFactory>> {
    anyhow::bail!("WebRTC feature 未启用，请使用 --features webrtc 重新编译")
}
