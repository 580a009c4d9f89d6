//! 双通道传输
//!
//! 把 `frames` (无序、不重传) 和 `input` (有序、可靠) 两条数据通道包装成
//! 统一的发送 / 接收接口。通道句柄可以在协商完成后异步绑定或重新绑定，
//! 接收回调在绑定时重新挂接。

use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::TransportError;
use crate::webrtc::DataChannel;

/// 数据通道规格
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSpec {
    pub label: &'static str,
    pub ordered: bool,
    /// `None` 表示可靠传输
    pub max_retransmits: Option<u16>,
}

impl ChannelSpec {
    /// 视频帧：过期帧不重传
    pub const FRAMES: ChannelSpec = ChannelSpec {
        label: "frames",
        ordered: false,
        max_retransmits: Some(0),
    };

    /// 输入事件：顺序和送达都必须保证
    pub const INPUT: ChannelSpec = ChannelSpec {
        label: "input",
        ordered: true,
        max_retransmits: None,
    };

    /// 按标签查找
    pub fn from_label(label: &str) -> Option<ChannelSpec> {
        match label {
            "frames" => Some(Self::FRAMES),
            "input" => Some(Self::INPUT),
            _ => None,
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.ordered && self.max_retransmits.is_none()
    }
}

type Callback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// 单个方向的状态
struct Lane {
    spec: ChannelSpec,
    channel: RwLock<Option<Arc<dyn DataChannel>>>,
    /// 接收回调；通道的 on_message 在消息到达时读取这里
    callback: Arc<RwLock<Option<Callback>>>,
}

impl Lane {
    fn new(spec: ChannelSpec) -> Self {
        Self {
            spec,
            channel: RwLock::new(None),
            callback: Arc::new(RwLock::new(None)),
        }
    }

    fn bind(&self, channel: Arc<dyn DataChannel>) {
        let callback = self.callback.clone();
        channel.on_message(Box::new(move |data| {
            let callback = callback.read().clone();
            if let Some(callback) = callback {
                callback(data);
            }
        }));
        tracing::debug!("绑定数据通道: {}", self.spec.label);
        *self.channel.write() = Some(channel);
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let channel = self.channel.read().clone();
        match channel {
            Some(channel) if channel.is_open() => channel.send(data).await,
            _ => Err(TransportError::ChannelNotOpen(self.spec.label)),
        }
    }

    fn is_open(&self) -> bool {
        self.channel
            .read()
            .as_ref()
            .map(|c| c.is_open())
            .unwrap_or(false)
    }

    fn take(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.write().take()
    }
}

/// 双通道传输
pub struct ChannelTransport {
    frames: Lane,
    input: Lane,
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self {
            frames: Lane::new(ChannelSpec::FRAMES),
            input: Lane::new(ChannelSpec::INPUT),
        }
    }

    /// 绑定 (或替换) 视频帧通道
    pub fn set_frames_channel(&self, channel: Arc<dyn DataChannel>) {
        self.frames.bind(channel);
    }

    /// 绑定 (或替换) 输入通道
    pub fn set_input_channel(&self, channel: Arc<dyn DataChannel>) {
        self.input.bind(channel);
    }

    /// 按标签绑定，未知标签返回 false
    pub fn bind_by_label(&self, channel: Arc<dyn DataChannel>) -> bool {
        match channel.label().as_str() {
            "frames" => self.set_frames_channel(channel),
            "input" => self.set_input_channel(channel),
            other => {
                tracing::warn!("忽略未知数据通道: {}", other);
                return false;
            }
        }
        true
    }

    /// 发送一帧，尽力而为
    pub async fn send_frame(&self, data: &[u8]) -> Result<(), TransportError> {
        self.frames.send(data).await
    }

    /// 发送一条输入事件
    pub async fn send_input(&self, data: &[u8]) -> Result<(), TransportError> {
        self.input.send(data).await
    }

    /// 注册视频帧回调，替换之前的回调
    pub fn on_frame<F>(&self, f: F)
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        *self.frames.callback.write() = Some(Arc::new(f));
    }

    /// 注册输入回调，替换之前的回调
    pub fn on_input<F>(&self, f: F)
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        *self.input.callback.write() = Some(Arc::new(f));
    }

    pub fn frames_open(&self) -> bool {
        self.frames.is_open()
    }

    pub fn input_open(&self) -> bool {
        self.input.is_open()
    }

    /// 解绑并关闭两个通道，清除回调
    pub async fn clear(&self) {
        *self.frames.callback.write() = None;
        *self.input.callback.write() = None;
        for channel in [self.frames.take(), self.input.take()].into_iter().flatten() {
            channel.close().await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::linked_pair;
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn test_channel_specs() {
        assert!(!ChannelSpec::FRAMES.ordered);
        assert_eq!(ChannelSpec::FRAMES.max_retransmits, Some(0));
        assert!(ChannelSpec::INPUT.is_reliable());
        assert!(!ChannelSpec::FRAMES.is_reliable());
        assert_eq!(ChannelSpec::from_label("input"), Some(ChannelSpec::INPUT));
        assert_eq!(ChannelSpec::from_label("audio"), None);
    }

    #[tokio::test]
    async fn test_send_unbound_channel() {
        let transport = ChannelTransport::new();
        assert!(matches!(
            transport.send_frame(b"x").await,
            Err(TransportError::ChannelNotOpen("frames"))
        ));
        assert!(matches!(
            transport.send_input(b"x").await,
            Err(TransportError::ChannelNotOpen("input"))
        ));
    }

    #[tokio::test]
    async fn test_input_fifo_over_1000_sends() {
        let (creator, receiver, _pcs) = linked_pair().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        creator.on_input(move |data| {
            let _ = tx.send(data);
        });

        for i in 0..1000u32 {
            receiver.send_input(&i.to_be_bytes()).await.unwrap();
        }

        for i in 0..1000u32 {
            let data = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(data, i.to_be_bytes().to_vec());
        }
    }

    #[tokio::test]
    async fn test_rebinding_keeps_callback() {
        let (creator, receiver, pcs) = linked_pair().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.on_frame(move |data| {
            let _ = tx.send(data);
        });
        creator.send_frame(b"one").await.unwrap();
        assert_eq!(rx.recv().await, Some(b"one".to_vec()));

        // 回调在绑定之前注册也会生效
        let late = ChannelTransport::new();
        let (late_tx, mut late_rx) = mpsc::unbounded_channel();
        late.on_frame(move |data| {
            let _ = late_tx.send(data);
        });
        if let Some(frames) = receiver.frames.take() {
            late.set_frames_channel(frames);
        }
        creator.send_frame(b"two").await.unwrap();
        assert_eq!(late_rx.recv().await, Some(b"two".to_vec()));
        drop(pcs);
    }

    #[tokio::test]
    async fn test_clear_closes_channels() {
        let (creator, receiver, _pcs) = linked_pair().await;
        assert!(creator.frames_open());
        receiver.clear().await;
        assert!(!receiver.input_open());
        assert!(matches!(
            creator.send_input(b"x").await,
            Err(TransportError::ChannelNotOpen("input"))
        ));
    }
}
