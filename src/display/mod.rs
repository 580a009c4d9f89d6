//! 显示模块
//!
//! 网络线程把解码后的帧写入 [`LatestFrame`]，渲染线程只读取最新一帧。
//! 具体的窗口实现放在 [`Display`] 能力接口之后，核心逻辑不依赖渲染线程。
//! 本地输入以视图坐标的 [`ViewInput`] 进入渲染循环，按当前帧换算后交给
//! [`InputHandle`]。

pub mod console;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::capture::Frame;
use crate::input::{InputEvent, Key, Modifiers, MouseButton, UNMAPPED_KEY_CODE};
use crate::pipeline::InputHandle;

/// 渲染接收端，由网络线程调用
pub trait RenderSink: Send + Sync {
    fn set_frame(&self, frame: Frame);
}

/// 只保存最新一帧的渲染接收端
#[derive(Default)]
pub struct LatestFrame {
    frame: Mutex<Option<Arc<Frame>>>,
    sequence: AtomicU64,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前帧，不会阻塞写入方太久
    pub fn current(&self) -> Option<Arc<Frame>> {
        self.frame.lock().clone()
    }

    /// 已写入的帧数，渲染线程用它判断是否有新帧
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }
}

impl RenderSink for LatestFrame {
    fn set_frame(&self, frame: Frame) {
        *self.frame.lock() = Some(Arc::new(frame));
        self.sequence.fetch_add(1, Ordering::AcqRel);
    }
}

/// 帧在视图中的等比缩放位置
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AspectFit {
    pub scale: f64,
    pub offset_x: f64,
    pub offset_y: f64,
}

impl AspectFit {
    /// 计算 `frame` 尺寸在 `view` 尺寸内居中等比缩放的结果
    ///
    /// 任何一边为零时返回 `None`
    pub fn compute(frame_w: u32, frame_h: u32, view_w: u32, view_h: u32) -> Option<Self> {
        if frame_w == 0 || frame_h == 0 || view_w == 0 || view_h == 0 {
            return None;
        }
        let (fw, fh) = (frame_w as f64, frame_h as f64);
        let (vw, vh) = (view_w as f64, view_h as f64);
        let scale = (vw / fw).min(vh / fh);
        Some(Self {
            scale,
            offset_x: (vw - fw * scale) / 2.0,
            offset_y: (vh - fh * scale) / 2.0,
        })
    }

    /// 视图坐标换算为远端屏幕坐标
    pub fn view_to_remote(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.offset_x) / self.scale,
            (y - self.offset_y) / self.scale,
        )
    }
}

/// 视图中的本地输入，坐标相对于显示区域
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ViewInput {
    PointerMove { x: f64, y: f64 },
    PointerButton { x: f64, y: f64, button: MouseButton, pressed: bool },
    Scroll { dx: f64, dy: f64 },
    Key { key: Key, modifiers: Modifiers, pressed: bool },
}

impl ViewInput {
    /// 换算为远端输入事件
    ///
    /// 指针事件需要已知的画面位置；没有对应键码的按键被丢弃
    pub fn to_remote(&self, fit: Option<&AspectFit>) -> Option<InputEvent> {
        match *self {
            ViewInput::PointerMove { x, y } => {
                let (x, y) = fit?.view_to_remote(x, y);
                Some(InputEvent::MouseMove { x, y })
            }
            ViewInput::PointerButton { x, y, button, pressed } => {
                let (x, y) = fit?.view_to_remote(x, y);
                Some(if pressed {
                    InputEvent::MouseDown { x, y, button }
                } else {
                    InputEvent::MouseUp { x, y, button }
                })
            }
            ViewInput::Scroll { dx, dy } => Some(InputEvent::MouseScroll { dx, dy }),
            ViewInput::Key { key, modifiers, pressed } => {
                let key_code = key.mac_key_code();
                if key_code == UNMAPPED_KEY_CODE {
                    return None;
                }
                Some(if pressed {
                    InputEvent::KeyDown { key_code, modifiers }
                } else {
                    InputEvent::KeyUp { key_code, modifiers }
                })
            }
        }
    }
}

/// 显示能力
///
/// `run` 占用调用线程直到窗口关闭或收到取消信号。
/// 有些平台要求在主线程调用。本地输入通过 `input` 发往远端。
pub trait Display {
    fn run(&mut self, input: InputHandle, cancel: CancellationToken) -> Result<()>;
}

/// 无窗口显示，定期报告收到的帧率
///
/// 没有真实的视图，输入来自外部提供的 [`ViewInput`] 流，
/// 按 `view_size` 大小的虚拟视图换算坐标。
pub struct HeadlessDisplay {
    frames: Arc<LatestFrame>,
    report_interval: Duration,
    view_size: (u32, u32),
    input_source: Option<mpsc::UnboundedReceiver<ViewInput>>,
}

impl HeadlessDisplay {
    pub fn new(frames: Arc<LatestFrame>) -> Self {
        Self {
            frames,
            report_interval: Duration::from_secs(5),
            view_size: (1280, 720),
            input_source: None,
        }
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    pub fn with_view_size(mut self, width: u32, height: u32) -> Self {
        self.view_size = (width, height);
        self
    }

    pub fn with_input_source(mut self, source: mpsc::UnboundedReceiver<ViewInput>) -> Self {
        self.input_source = Some(source);
        self
    }

    /// 取出本轮积压的输入并发送，返回发出的事件数
    pub(crate) fn forward_input(&mut self, input: &InputHandle) -> usize {
        let Some(source) = self.input_source.as_mut() else {
            return 0;
        };
        let fit = self.frames.current().and_then(|frame| {
            AspectFit::compute(frame.width, frame.height, self.view_size.0, self.view_size.1)
        });

        let mut sent = 0;
        while let Ok(view_input) = source.try_recv() {
            let Some(event) = view_input.to_remote(fit.as_ref()) else {
                tracing::debug!("无法换算的本地输入，丢弃: {:?}", view_input);
                continue;
            };
            if input.send(&event) {
                sent += 1;
            } else {
                tracing::debug!("会话尚未建立，丢弃 {}", event.kind());
            }
        }
        sent
    }
}

impl Display for HeadlessDisplay {
    fn run(&mut self, input: InputHandle, cancel: CancellationToken) -> Result<()> {
        tracing::info!("无界面显示已启动");
        let mut last_seq = self.frames.sequence();
        let mut last_report = Instant::now();
        let mut sent = 0;

        while !cancel.is_cancelled() {
            std::thread::sleep(Duration::from_millis(50));
            sent += self.forward_input(&input);

            let elapsed = last_report.elapsed();
            if elapsed < self.report_interval {
                continue;
            }

            let seq = self.frames.sequence();
            let fps = (seq - last_seq) as f64 / elapsed.as_secs_f64();
            match self.frames.current() {
                Some(frame) => tracing::info!(
                    "接收帧率: {:.1} fps, 分辨率 {}x{}, 已发送输入 {}",
                    fps,
                    frame.width,
                    frame.height,
                    sent
                ),
                None => tracing::info!("尚未收到画面"),
            }
            last_seq = seq;
            last_report = Instant::now();
        }

        tracing::info!("无界面显示已退出");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_frame_keeps_only_newest() {
        let sink = LatestFrame::new();
        assert!(sink.current().is_none());

        sink.set_frame(Frame::new(2, 2));
        sink.set_frame(Frame::new(4, 3));
        let frame = sink.current().unwrap();
        assert_eq!((frame.width, frame.height), (4, 3));
        assert_eq!(sink.sequence(), 2);
    }

    #[test]
    fn test_concurrent_writer_and_reader() {
        let sink = Arc::new(LatestFrame::new());
        let writer = {
            let sink = sink.clone();
            std::thread::spawn(move || {
                for i in 1..=200 {
                    sink.set_frame(Frame::new(i, 1));
                }
            })
        };
        for _ in 0..200 {
            if let Some(frame) = sink.current() {
                assert!(frame.width >= 1 && frame.width <= 200);
            }
        }
        writer.join().unwrap();
        assert_eq!(sink.current().unwrap().width, 200);
    }

    #[test]
    fn test_aspect_fit_letterbox() {
        // 1920x1080 放进 800x800，上下留黑边
        let fit = AspectFit::compute(1920, 1080, 800, 800).unwrap();
        assert!((fit.scale - 800.0 / 1920.0).abs() < 1e-9);
        assert_eq!(fit.offset_x, 0.0);
        assert!((fit.offset_y - 175.0).abs() < 1e-9);

        let (x, y) = fit.view_to_remote(400.0, 400.0);
        assert!((x - 960.0).abs() < 1e-6);
        assert!((y - 540.0).abs() < 1e-6);
    }

    #[test]
    fn test_aspect_fit_zero_sizes() {
        assert!(AspectFit::compute(0, 100, 100, 100).is_none());
        assert!(AspectFit::compute(100, 100, 100, 0).is_none());
    }

    #[test]
    fn test_headless_display_stops_on_cancel() {
        let sink = Arc::new(LatestFrame::new());
        let mut display = HeadlessDisplay::new(sink).with_report_interval(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let stopper = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(120));
                cancel.cancel();
            })
        };
        display.run(InputHandle::default(), cancel).unwrap();
        stopper.join().unwrap();
    }

    #[test]
    fn test_view_input_maps_through_aspect_fit() {
        let fit = AspectFit::compute(1920, 1080, 800, 800).unwrap();
        let event = ViewInput::PointerButton {
            x: 400.0,
            y: 400.0,
            button: MouseButton::Right,
            pressed: true,
        }
        .to_remote(Some(&fit))
        .unwrap();
        match event {
            InputEvent::MouseDown { x, y, button } => {
                assert!((x - 960.0).abs() < 1e-6);
                assert!((y - 540.0).abs() < 1e-6);
                assert_eq!(button, MouseButton::Right);
            }
            other => panic!("unexpected {:?}", other),
        }

        // 还没有画面时指针事件无法换算
        assert!(ViewInput::PointerMove { x: 1.0, y: 1.0 }.to_remote(None).is_none());
        assert_eq!(
            ViewInput::Scroll { dx: 0.0, dy: -2.0 }.to_remote(None),
            Some(InputEvent::MouseScroll { dx: 0.0, dy: -2.0 })
        );
    }

    #[test]
    fn test_view_input_keys_use_mac_codes() {
        let event = ViewInput::Key {
            key: Key::Escape,
            modifiers: Modifiers::SHIFT,
            pressed: false,
        }
        .to_remote(None);
        assert_eq!(
            event,
            Some(InputEvent::KeyUp {
                key_code: 53,
                modifiers: Modifiers::SHIFT,
            })
        );

        let unmapped = ViewInput::Key {
            key: Key::Other,
            modifiers: Modifiers::NONE,
            pressed: true,
        };
        assert!(unmapped.to_remote(None).is_none());
    }

    #[test]
    fn test_input_dropped_before_session() {
        let sink = Arc::new(LatestFrame::new());
        sink.set_frame(Frame::new(64, 48));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut display = HeadlessDisplay::new(sink).with_input_source(rx);

        tx.send(ViewInput::PointerMove { x: 10.0, y: 10.0 }).unwrap();
        assert_eq!(display.forward_input(&InputHandle::default()), 0);
        // 积压的输入已被取走
        assert!(display.input_source.as_mut().unwrap().try_recv().is_err());
    }
}
