//! 屏幕捕获模块
//!
//! 捕获器按需产出原始帧，节奏由调用方控制

use anyhow::Result;

/// 像素格式，每像素 4 字节
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba,
    /// CoreGraphics 的默认字节序
    Bgra,
}

/// 原始视频帧
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub format: PixelFormat,
    /// 时间戳 (毫秒)
    pub timestamp: u64,
    /// 每行字节数，可能大于 width * 4
    pub stride: usize,
}

impl Frame {
    /// 创建一个全黑的 RGBA 帧
    pub fn new(width: u32, height: u32) -> Self {
        let stride = (width as usize) * 4;
        let data = vec![0u8; height as usize * stride];
        Frame {
            width,
            height,
            data,
            format: PixelFormat::Rgba,
            timestamp: Self::current_timestamp(),
            stride,
        }
    }

    /// 获取当前时间戳 (毫秒)
    pub fn current_timestamp() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    /// 从原始数据创建帧
    pub fn from_raw_data(
        width: u32,
        height: u32,
        data: Vec<u8>,
        stride: usize,
        format: PixelFormat,
    ) -> Self {
        Frame {
            width,
            height,
            data,
            format,
            timestamp: Self::current_timestamp(),
            stride,
        }
    }

    /// 数据长度是否与尺寸一致
    pub fn is_valid(&self) -> bool {
        self.stride >= self.width as usize * 4
            && self.data.len() >= self.stride * self.height.saturating_sub(1) as usize + self.width as usize * 4
    }

    /// 读取一个像素，返回 RGBA
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = y as usize * self.stride + x as usize * 4;
        let p = self.data.get(offset..offset + 4)?;
        Some(match self.format {
            PixelFormat::Rgba => [p[0], p[1], p[2], p[3]],
            PixelFormat::Bgra => [p[2], p[1], p[0], p[3]],
        })
    }
}

/// 屏幕捕获器
pub trait Capturer: Send {
    /// 捕获一帧屏幕
    fn capture(&mut self) -> Result<Frame>;

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;
}

/// 创建平台捕获器
pub fn create_capturer(display_index: u32) -> Result<Box<dyn Capturer>> {
    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(macos::MacOSCapturer::new(display_index)?))
    }

    #[cfg(not(target_os = "macos"))]
    {
        let _ = display_index;
        Err(anyhow::anyhow!("不支持的平台: 屏幕捕获只支持 macOS，可使用 --synthetic"))
    }
}

/// 合成画面捕获器
///
/// 每帧移动的渐变条纹，用于没有屏幕权限的环境和测试
pub struct SyntheticCapturer {
    width: u32,
    height: u32,
    tick: u32,
    running: bool,
}

impl SyntheticCapturer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tick: 0,
            running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Capturer for SyntheticCapturer {
    fn capture(&mut self) -> Result<Frame> {
        let mut frame = Frame::new(self.width, self.height);
        let shift = self.tick;
        for y in 0..self.height {
            for x in 0..self.width {
                let offset = y as usize * frame.stride + x as usize * 4;
                let band = ((x + shift) / 8 % 2) as u8;
                frame.data[offset] = (x * 255 / self.width.max(1)) as u8;
                frame.data[offset + 1] = (y * 255 / self.height.max(1)) as u8;
                frame.data[offset + 2] = band * 255;
                frame.data[offset + 3] = 255;
            }
        }
        self.tick = self.tick.wrapping_add(1);
        Ok(frame)
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn start(&mut self) -> Result<()> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }
}

#[cfg(target_os = "macos")]
pub mod macos;
