//! 视频编码模块
//!
//! 每帧独立编码为 JPEG，帧之间没有依赖，丢帧和乱序不影响解码

use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::ExtendedColorType;

use crate::capture::{Frame, PixelFormat};
use crate::error::CodecError;

/// 默认 JPEG 质量
pub const DEFAULT_QUALITY: u8 = 70;

/// 视频编码器
pub trait Encoder: Send {
    /// 编码一帧，`quality` 取值 1-100
    fn encode(&mut self, frame: &Frame, quality: u8) -> Result<Vec<u8>, CodecError>;
}

/// JPEG 编码器
#[derive(Debug, Default)]
pub struct JpegEncoder {
    /// 复用的 RGB 缓冲
    rgb: Vec<u8>,
    frame_count: u64,
}

impl JpegEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// 按行拷贝并去掉 alpha，处理行填充和 BGRA 字节序
    fn fill_rgb(&mut self, frame: &Frame) {
        let width = frame.width as usize;
        self.rgb.clear();
        self.rgb.reserve(width * frame.height as usize * 3);

        for y in 0..frame.height as usize {
            let row = &frame.data[y * frame.stride..y * frame.stride + width * 4];
            for px in row.chunks_exact(4) {
                match frame.format {
                    PixelFormat::Rgba => self.rgb.extend_from_slice(&[px[0], px[1], px[2]]),
                    PixelFormat::Bgra => self.rgb.extend_from_slice(&[px[2], px[1], px[0]]),
                }
            }
        }
    }
}

impl Encoder for JpegEncoder {
    fn encode(&mut self, frame: &Frame, quality: u8) -> Result<Vec<u8>, CodecError> {
        if frame.width == 0 || frame.height == 0 {
            return Err(CodecError::Encode("空帧".to_string()));
        }
        if !frame.is_valid() {
            return Err(CodecError::Encode(format!(
                "帧数据长度 {} 与尺寸 {}x{} (stride {}) 不符",
                frame.data.len(),
                frame.width,
                frame.height,
                frame.stride
            )));
        }

        self.fill_rgb(frame);

        let mut out = Vec::new();
        {
            let mut encoder = ImageJpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
            encoder
                .encode(&self.rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
                .map_err(|e| CodecError::Encode(e.to_string()))?;
        }

        self.frame_count += 1;
        tracing::trace!(
            "编码帧 #{}: {}x{} -> {} bytes",
            self.frame_count,
            frame.width,
            frame.height,
            out.len()
        );
        Ok(out)
    }
}
