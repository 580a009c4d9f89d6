//! 流水线
//!
//! 主机端: 捕获 -> 编码 -> 帧槽 -> frames 通道。帧槽容量为 2，满时直接丢弃新帧，
//! 生产者永远不会因为网络而阻塞。
//!
//! 控制端: frames 通道 -> 解码 -> 渲染接收端；本地输入 -> input 通道。
//! 主机端收到的输入反序列化后交给注入器。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::capture::Capturer;
use crate::decoder::Decoder;
use crate::display::RenderSink;
use crate::encoder::{Encoder, JpegEncoder};
use crate::input::{InputEvent, InputInjector};
use crate::session::{Session, SessionAttach};
use crate::transport::ChannelTransport;

/// 帧槽容量
pub const FRAME_SLOT_CAPACITY: usize = 2;

/// 入队结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    Dropped,
}

/// 帧槽计数
#[derive(Debug, Default)]
pub struct SlotStats {
    queued: AtomicU64,
    dropped: AtomicU64,
}

impl SlotStats {
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// 有界帧槽
///
/// `push` 从不阻塞：槽满时新帧被丢弃
pub struct FrameSlot {
    tx: mpsc::Sender<Vec<u8>>,
    stats: Arc<SlotStats>,
}

impl FrameSlot {
    pub fn new() -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(FRAME_SLOT_CAPACITY);
        let slot = Self {
            tx,
            stats: Arc::new(SlotStats::default()),
        };
        (slot, rx)
    }

    pub fn push(&self, frame: Vec<u8>) -> Enqueue {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
                Enqueue::Queued
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Enqueue::Dropped
            }
        }
    }

    /// 当前排队的帧数
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn stats(&self) -> Arc<SlotStats> {
        self.stats.clone()
    }
}

/// 主机推流统计
#[derive(Debug, Default)]
pub struct StreamStats {
    pub captured: AtomicU64,
    pub encode_failed: AtomicU64,
    pub sent: AtomicU64,
    pub send_failed: AtomicU64,
}

/// 主机推流任务句柄
pub struct HostStream {
    pub producer: JoinHandle<()>,
    pub sender: JoinHandle<()>,
    pub slot: Arc<SlotStats>,
    pub stats: Arc<StreamStats>,
}

/// 启动主机推流
///
/// 捕获和编码在阻塞线程上按 `fps` 节拍运行，发送在运行时任务上进行。
/// 两者都在 `cancel` 触发后退出。
pub fn spawn_host_stream(
    mut capturer: Box<dyn Capturer>,
    mut encoder: Box<dyn Encoder>,
    quality: u8,
    fps: u32,
    transport: Arc<ChannelTransport>,
    cancel: CancellationToken,
) -> HostStream {
    let (slot, mut rx) = FrameSlot::new();
    let slot_stats = slot.stats();
    let stats = Arc::new(StreamStats::default());

    let producer = {
        let cancel = cancel.clone();
        let stats = stats.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = capturer.start() {
                error!("启动屏幕捕获失败: {}", e);
                return;
            }

            let interval = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
            let mut next = Instant::now();
            info!("推流开始: {} fps, 质量 {}", fps, quality);

            while !cancel.is_cancelled() {
                match capturer.capture() {
                    Ok(frame) => {
                        stats.captured.fetch_add(1, Ordering::Relaxed);
                        match encoder.encode(&frame, quality) {
                            Ok(bytes) => {
                                if slot.push(bytes) == Enqueue::Dropped {
                                    trace!("帧槽已满，丢弃一帧");
                                }
                            }
                            Err(e) => {
                                stats.encode_failed.fetch_add(1, Ordering::Relaxed);
                                debug!("编码失败，跳过该帧: {}", e);
                            }
                        }
                    }
                    Err(e) => debug!("捕获失败，跳过该帧: {}", e),
                }

                next += interval;
                let now = Instant::now();
                if next > now {
                    std::thread::sleep(next - now);
                } else {
                    next = now;
                }
            }

            if let Err(e) = capturer.stop() {
                warn!("停止屏幕捕获失败: {}", e);
            }
            info!("推流结束");
        })
    };

    let sender = {
        let stats = stats.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = rx.recv() => frame,
                };
                let Some(frame) = frame else { break };
                match transport.send_frame(&frame).await {
                    Ok(()) => {
                        stats.sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        stats.send_failed.fetch_add(1, Ordering::Relaxed);
                        trace!("发送帧失败: {}", e);
                    }
                }
            }
        })
    };

    HostStream {
        producer,
        sender,
        slot: slot_stats,
        stats,
    }
}

/// 控制端解码统计
#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub decoded: AtomicU64,
    pub failed: AtomicU64,
}

/// 挂接帧消费者：解码后写入渲染接收端，解码失败的消息被跳过
pub fn attach_frame_consumer(
    transport: &ChannelTransport,
    decoder: Arc<dyn Decoder>,
    sink: Arc<dyn RenderSink>,
) -> Arc<ConsumerStats> {
    let stats = Arc::new(ConsumerStats::default());
    let counters = stats.clone();
    transport.on_frame(move |data| match decoder.decode(&data) {
        Ok(frame) => {
            counters.decoded.fetch_add(1, Ordering::Relaxed);
            sink.set_frame(frame);
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            debug!("解码失败，跳过 {} 字节: {}", data.len(), e);
        }
    });
    stats
}

/// 输入发送句柄，可以在渲染线程上调用
#[derive(Clone)]
pub struct InputSender {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl InputSender {
    /// 序列化并排队，不等待网络
    pub fn send(&self, event: &InputEvent) -> bool {
        match event.to_bytes() {
            Ok(bytes) => self.tx.send(bytes).is_ok(),
            Err(e) => {
                warn!("序列化输入事件失败: {}", e);
                false
            }
        }
    }
}

/// 启动输入转发任务，按发送顺序写入 input 通道
pub fn spawn_input_forwarder(
    transport: Arc<ChannelTransport>,
    cancel: CancellationToken,
) -> (InputSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let handle = tokio::spawn(async move {
        loop {
            let data = tokio::select! {
                _ = cancel.cancelled() => break,
                data = rx.recv() => data,
            };
            let Some(data) = data else { break };
            if let Err(e) = transport.send_input(&data).await {
                debug!("丢弃输入事件: {}", e);
            }
        }
    });
    (InputSender { tx }, handle)
}

/// 注入统计
#[derive(Debug, Default)]
pub struct InjectStats {
    pub injected: AtomicU64,
    pub rejected: AtomicU64,
}

/// 挂接输入注入器，无法解析的消息记录后丢弃
pub fn attach_input_injector(
    transport: &ChannelTransport,
    injector: Box<dyn InputInjector>,
) -> Arc<InjectStats> {
    let stats = Arc::new(InjectStats::default());
    let counters = stats.clone();
    let injector = Mutex::new(injector);
    transport.on_input(move |data| {
        let event = match InputEvent::from_bytes(&data) {
            Ok(event) => event,
            Err(e) => {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("无法解析输入事件: {}", e);
                return;
            }
        };
        match injector.lock().inject(&event) {
            Ok(()) => {
                counters.injected.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("注入 {} 失败: {}", event.kind(), e);
            }
        }
    });
    stats
}

type CapturerFactory = Box<dyn Fn() -> anyhow::Result<Box<dyn Capturer>> + Send + Sync>;
type InjectorFactory = Box<dyn Fn() -> anyhow::Result<Box<dyn InputInjector>> + Send + Sync>;

/// 主机端会话挂接：推流 + 输入注入
pub struct HostPipeline {
    capturer: CapturerFactory,
    injector: InjectorFactory,
    quality: u8,
    fps: u32,
}

impl HostPipeline {
    pub fn new<C, I>(capturer: C, injector: I, quality: u8, fps: u32) -> Self
    where
        C: Fn() -> anyhow::Result<Box<dyn Capturer>> + Send + Sync + 'static,
        I: Fn() -> anyhow::Result<Box<dyn InputInjector>> + Send + Sync + 'static,
    {
        Self {
            capturer: Box::new(capturer),
            injector: Box::new(injector),
            quality,
            fps,
        }
    }
}

impl SessionAttach for HostPipeline {
    fn attach(&self, session: &mut Session) -> anyhow::Result<()> {
        let transport = session.transport();
        attach_input_injector(&transport, (self.injector)()?);

        let stream = spawn_host_stream(
            (self.capturer)()?,
            Box::new(JpegEncoder::new()),
            self.quality,
            self.fps,
            transport,
            session.cancellation(),
        );
        session.track_task(stream.producer);
        session.track_task(stream.sender);
        Ok(())
    }
}

/// 控制端输入入口，会话建立前发送的事件被丢弃
#[derive(Clone, Default)]
pub struct InputHandle {
    sender: Arc<Mutex<Option<InputSender>>>,
}

impl InputHandle {
    pub fn send(&self, event: &InputEvent) -> bool {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(event),
            None => false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.sender.lock().is_some()
    }
}

/// 控制端会话挂接：解码显示 + 输入转发
pub struct ControllerPipeline {
    decoder: Arc<dyn Decoder>,
    sink: Arc<dyn RenderSink>,
    input: InputHandle,
}

impl ControllerPipeline {
    pub fn new(decoder: Arc<dyn Decoder>, sink: Arc<dyn RenderSink>) -> Self {
        Self {
            decoder,
            sink,
            input: InputHandle::default(),
        }
    }

    pub fn input(&self) -> InputHandle {
        self.input.clone()
    }
}

impl SessionAttach for ControllerPipeline {
    fn attach(&self, session: &mut Session) -> anyhow::Result<()> {
        let transport = session.transport();
        attach_frame_consumer(&transport, self.decoder.clone(), self.sink.clone());

        let (sender, handle) = spawn_input_forwarder(transport, session.cancellation());
        *self.input.sender.lock() = Some(sender);
        session.track_task(handle);
        Ok(())
    }
}
