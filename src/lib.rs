//! airdesk - 点对点远程桌面库
//!
//! 通过信令服务器交换 SDP / ICE 建立对等连接，主机推送 JPEG 画面，
//! 控制端回传键鼠输入。

pub mod capture;
pub mod config;
pub mod decoder;
pub mod display;
pub mod encoder;
pub mod error;
pub mod input;
pub mod pipeline;
pub mod session;
pub mod transport;
pub mod webrtc;

// 信令模块 - 客户端与中继
pub mod signaling;
