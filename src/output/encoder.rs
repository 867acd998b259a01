// 该文件是 Huoyan （火眼） 项目的一部分。
// src/output/encoder.rs - JPEG 编码与 multipart 分块
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use bytes::{BufMut, Bytes, BytesMut};
use image::{RgbImage, codecs::jpeg::JpegEncoder};
use thiserror::Error;

pub const DEFAULT_JPEG_QUALITY: u8 = 95;
pub const MULTIPART_BOUNDARY: &str = "frame";
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const CHUNK_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const CHUNK_TRAILER: &[u8] = b"\r\n";

#[derive(Error, Debug)]
pub enum EncodeError {
  #[error("帧尺寸无效: {width}x{height}")]
  EmptyFrame { width: u32, height: u32 },
  #[error("JPEG 编码错误: {0}")]
  Jpeg(#[from] image::ImageError),
}

/// 固定质量的 JPEG 编码器
#[derive(Debug, Clone, Copy)]
pub struct StreamEncoder {
  quality: u8,
}

impl Default for StreamEncoder {
  fn default() -> Self {
    Self::new(DEFAULT_JPEG_QUALITY)
  }
}

impl StreamEncoder {
  pub fn new(quality: u8) -> Self {
    Self {
      quality: quality.clamp(1, 100),
    }
  }

  pub fn quality(&self) -> u8 {
    self.quality
  }

  pub fn encode(&self, image: &RgbImage) -> Result<Bytes, EncodeError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
      return Err(EncodeError::EmptyFrame { width, height });
    }

    let mut buffer = Vec::with_capacity(width as usize * height as usize / 4);
    JpegEncoder::new_with_quality(&mut buffer, self.quality).encode_image(image)?;
    Ok(Bytes::from(buffer))
  }
}

/// 为一帧 JPEG 加上 multipart 边界与头部
pub fn wrap(jpeg: &[u8]) -> Bytes {
  let mut chunk = BytesMut::with_capacity(CHUNK_HEADER.len() + jpeg.len() + CHUNK_TRAILER.len());
  chunk.put_slice(CHUNK_HEADER);
  chunk.put_slice(jpeg);
  chunk.put_slice(CHUNK_TRAILER);
  chunk.freeze()
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  #[test]
  fn wrap_frames_payload() {
    let chunk = wrap(b"JPEG");
    assert_eq!(
      &chunk[..],
      b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEG\r\n"
    );
    assert!(MULTIPART_CONTENT_TYPE.ends_with(MULTIPART_BOUNDARY));
  }

  #[test]
  fn encoded_frame_decodes_to_same_dimensions() {
    let image = RgbImage::from_pixel(37, 21, Rgb([200, 30, 30]));
    let jpeg = StreamEncoder::default().encode(&image).unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

    let decoded = image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg)
      .unwrap()
      .to_rgb8();
    assert_eq!(decoded.dimensions(), (37, 21));
  }

  #[test]
  fn empty_frame_is_rejected() {
    let err = StreamEncoder::default()
      .encode(&RgbImage::new(0, 10))
      .unwrap_err();
    assert!(matches!(
      err,
      EncodeError::EmptyFrame {
        width: 0,
        height: 10
      }
    ));
  }

  #[test]
  fn quality_is_clamped() {
    assert_eq!(StreamEncoder::new(0).quality(), 1);
    assert_eq!(StreamEncoder::new(255).quality(), 100);
  }
}
