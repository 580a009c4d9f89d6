//! 视频解码模块

use image::ImageFormat;

use crate::capture::{Frame, PixelFormat};
use crate::error::CodecError;

/// 视频解码器
pub trait Decoder: Send + Sync {
    /// 解码一条帧消息，输出 RGBA
    fn decode(&self, data: &[u8]) -> Result<Frame, CodecError>;
}

/// JPEG 解码器，无状态
#[derive(Debug, Default, Clone, Copy)]
pub struct JpegDecoder;

impl JpegDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for JpegDecoder {
    fn decode(&self, data: &[u8]) -> Result<Frame, CodecError> {
        let image = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
            .map_err(|e| CodecError::Decode(e.to_string()))?
            .to_rgba8();

        let (width, height) = image.dimensions();
        Ok(Frame::from_raw_data(
            width,
            height,
            image.into_raw(),
            width as usize * 4,
            PixelFormat::Rgba,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{Encoder, JpegEncoder};

    #[test]
    fn test_decode_encoded_frame() {
        let mut frame = Frame::new(24, 12);
        for px in frame.data.chunks_exact_mut(4) {
            px.copy_from_slice(&[0, 128, 255, 255]);
        }
        let jpeg = JpegEncoder::new().encode(&frame, 90).unwrap();

        let decoded = JpegDecoder::new().decode(&jpeg).unwrap();
        assert_eq!((decoded.width, decoded.height), (24, 12));
        assert_eq!(decoded.stride, 24 * 4);
        let [r, g, b, a] = decoded.pixel(12, 6).unwrap();
        // 有损压缩，只比较大致颜色
        assert!(r < 20 && (110..=145).contains(&g) && b > 235);
        assert_eq!(a, 255);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let result = JpegDecoder::new().decode(b"definitely not a jpeg");
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }
}
