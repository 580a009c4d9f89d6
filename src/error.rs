//! 错误类型
//!
//! 控制路径 (信令、协商) 的错误向上传递并终止对应会话；
//! 媒体 / 输入热路径上的错误只影响单个消息。

use thiserror::Error;

/// 信令客户端错误
#[derive(Debug, Error)]
pub enum SignalingError {
    /// 拨号或注册失败
    #[error("连接信令服务器失败: {0}")]
    Connection(String),

    /// 在 connect 之前或 close 之后发送
    #[error("信令客户端未连接")]
    NotConnected,

    /// 无法解析的信令消息
    #[error("信令协议错误: {0}")]
    Protocol(String),

    #[error("信令消息序列化失败: {0}")]
    Json(#[from] serde_json::Error),
}

/// 会话协商错误
#[derive(Debug, Error)]
pub enum SessionError {
    /// 当前状态不接受该消息；消息被忽略，会话保持原状态
    #[error("协议错误: 状态 {state} 下收到 {message}")]
    Protocol {
        state: &'static str,
        message: &'static str,
    },

    /// SDP / ICE 负载无效，会话随之关闭
    #[error("协商失败: {0}")]
    Negotiation(String),

    /// 连接引擎创建或调用失败
    #[error("连接引擎错误: {0}")]
    Engine(String),

    #[error("会话已关闭")]
    Closed,

    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

impl SessionError {
    /// 是否需要关闭会话
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::Protocol { .. })
    }
}

/// 通道传输错误
#[derive(Debug, Error)]
pub enum TransportError {
    /// 通道尚未绑定或未打开
    #[error("数据通道 {0} 未打开")]
    ChannelNotOpen(&'static str),

    #[error("数据通道发送失败: {0}")]
    Send(String),
}

/// 编解码错误，仅影响单帧
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("编码失败: {0}")]
    Encode(String),

    #[error("解码失败: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_is_not_fatal() {
        let err = SessionError::Protocol {
            state: "Idle",
            message: "answer",
        };
        assert!(!err.is_fatal());
        assert!(SessionError::Negotiation("bad sdp".into()).is_fatal());
        assert!(SessionError::Engine("boom".into()).is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = TransportError::ChannelNotOpen("frames");
        assert_eq!(err.to_string(), "数据通道 frames 未打开");

        let err = SessionError::from(SignalingError::NotConnected);
        assert_eq!(err.to_string(), "信令客户端未连接");
    }
}
