//! 信令模块
//!
//! 信令消息格式、客户端，以及独立运行的中继服务器

mod client;
mod message;
mod relay;

pub use client::{event_from_message, SignalSender, SignalingClient, SignalingEvent, DEFAULT_HEARTBEAT};
pub use message::{now_millis, ClientType, HostInfo, MessageType, SignalingMessage};
pub use relay::SignalingRelay;
