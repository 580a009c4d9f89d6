//! 信令消息格式
//!
//! 每条 WebSocket 文本消息是一个 JSON 信封，`type` 决定其余字段的含义。
//! `payload` 对信令层不透明 (SDP 或 ICE 候选)，只由协商层解释。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// 信令消息类型
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    Register,
    Registered,
    ListHosts,
    Hosts,
    HostsUpdated,
    Offer,
    Answer,
    IceCandidate,
    Ping,
    Pong,
    Error,
    HostDisconnected,
    /// 未知类型，保留原始字符串以便向前兼容
    Unknown(String),
}

impl MessageType {
    /// 线上字符串
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Register => "register",
            MessageType::Registered => "registered",
            MessageType::ListHosts => "list-hosts",
            MessageType::Hosts => "hosts",
            MessageType::HostsUpdated => "hosts-updated",
            MessageType::Offer => "offer",
            MessageType::Answer => "answer",
            MessageType::IceCandidate => "ice-candidate",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Error => "error",
            MessageType::HostDisconnected => "host-disconnected",
            MessageType::Unknown(s) => s,
        }
    }

    /// 从线上字符串解析
    pub fn from_wire(s: &str) -> Self {
        match s {
            "register" => MessageType::Register,
            "registered" => MessageType::Registered,
            "list-hosts" => MessageType::ListHosts,
            "hosts" => MessageType::Hosts,
            "hosts-updated" => MessageType::HostsUpdated,
            "offer" => MessageType::Offer,
            "answer" => MessageType::Answer,
            "ice-candidate" => MessageType::IceCandidate,
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            "error" => MessageType::Error,
            "host-disconnected" => MessageType::HostDisconnected,
            other => MessageType::Unknown(other.to_string()),
        }
    }

    /// offer / answer / ice-candidate 需要路由
    pub fn is_routed(&self) -> bool {
        matches!(
            self,
            MessageType::Offer | MessageType::Answer | MessageType::IceCandidate
        )
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(MessageType::from_wire(&s))
    }
}

/// 客户端角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Host,
    Controller,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::Host => "host",
            ClientType::Controller => "controller",
        }
    }
}

impl std::fmt::Display for ClientType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 主机列表条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub id: String,
    pub online: bool,
}

/// 信令信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(
        rename = "clientType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_type: Option<ClientType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<Vec<HostInfo>>,
    #[serde(rename = "hostId", default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl SignalingMessage {
    /// 只有类型的空信封
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            id: None,
            client_type: None,
            from: None,
            target: None,
            payload: None,
            list: None,
            host_id: None,
            message: None,
            timestamp: None,
        }
    }

    pub fn register(id: impl Into<String>, client_type: ClientType) -> Self {
        Self {
            id: Some(id.into()),
            client_type: Some(client_type),
            ..Self::new(MessageType::Register)
        }
    }

    /// offer / answer / ice-candidate
    pub fn routed(
        kind: MessageType,
        from: impl Into<String>,
        target: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            from: Some(from.into()),
            target: Some(target.into()),
            payload: Some(payload),
            ..Self::new(kind)
        }
    }

    pub fn ping() -> Self {
        Self {
            timestamp: Some(now_millis()),
            ..Self::new(MessageType::Ping)
        }
    }

    pub fn list_hosts() -> Self {
        Self::new(MessageType::ListHosts)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(MessageType::Error)
        }
    }

    /// 编码为 JSON 文本
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 从 JSON 文本解码
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// 当前 Unix 时间戳 (毫秒)
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
