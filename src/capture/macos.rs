//! macOS 屏幕捕获实现
//!
//! 通过 CGDisplay 截取整屏图像

use super::{Capturer, Frame, PixelFormat};
use anyhow::{anyhow, Result};
use core_graphics::display::CGDisplay;

/// macOS 屏幕捕获器
pub struct MacOSCapturer {
    display_id: u32,
    width: u32,
    height: u32,
}

impl MacOSCapturer {
    /// `display_index` 为活动显示器列表中的序号，0 是主显示器
    pub fn new(display_index: u32) -> Result<Self> {
        let display_id = Self::get_display_id(display_index)?;
        let display = CGDisplay::new(display_id);
        let width = display.pixels_wide() as u32;
        let height = display.pixels_high() as u32;

        tracing::info!(
            "创建 macOS 捕获器: display_id={}, {}x{}",
            display_id,
            width,
            height
        );

        Ok(MacOSCapturer {
            display_id,
            width,
            height,
        })
    }

    fn get_display_id(display_index: u32) -> Result<u32> {
        let displays = CGDisplay::active_displays()
            .map_err(|e| anyhow!("获取显示器列表失败: {:?}", e))?;

        displays.get(display_index as usize).copied().ok_or_else(|| {
            anyhow!(
                "屏幕索引 {} 超出范围，共有 {} 个显示器",
                display_index,
                displays.len()
            )
        })
    }
}

impl Capturer for MacOSCapturer {
    fn capture(&mut self) -> Result<Frame> {
        let image = CGDisplay::new(self.display_id)
            .image()
            .ok_or_else(|| anyhow!("无法捕获屏幕图像，请检查屏幕录制权限"))?;

        let width = image.width() as u32;
        let height = image.height() as u32;
        let bytes_per_row = image.bytes_per_row();
        if image.bits_per_pixel() != 32 {
            return Err(anyhow!("不支持的像素位数: {}", image.bits_per_pixel()));
        }

        tracing::trace!("捕获帧: {}x{}, bpr={}", width, height, bytes_per_row);

        let data = image.data().bytes().to_vec();
        Ok(Frame::from_raw_data(
            width,
            height,
            data,
            bytes_per_row,
            PixelFormat::Bgra,
        ))
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn start(&mut self) -> Result<()> {
        tracing::info!("屏幕捕获已启动");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        tracing::info!("屏幕捕获已停止");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // 需要屏幕录制权限
    fn test_capture_frame() {
        let mut capturer = MacOSCapturer::new(0).unwrap();
        capturer.start().unwrap();

        let frame = capturer.capture().unwrap();
        assert_eq!(frame.width, capturer.width());
        assert!(frame.is_valid());
    }

    #[test]
    fn test_display_index_out_of_range() {
        assert!(MacOSCapturer::new(u32::MAX).is_err());
    }
}
