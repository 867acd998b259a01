// 该文件是 Huoyan （火眼） 项目的一部分。
// src/frame.rs - 帧定义
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

use image::RgbImage;
use thiserror::Error;

pub const RGB_CHANNELS: usize = 3;

/// 帧数据
///
/// 帧在流水线中只被一次迭代独占，编码后即被丢弃。
#[derive(Debug, Clone)]
pub struct Frame {
  /// RGB 图像数据
  pub image: RgbImage,
  /// 帧索引
  pub index: u64,
  /// 时间戳（毫秒）
  pub timestamp_ms: u64,
}

impl Frame {
  pub fn new(image: RgbImage, index: u64, timestamp_ms: u64) -> Self {
    Self {
      image,
      index,
      timestamp_ms,
    }
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn is_empty(&self) -> bool {
    self.image.width() == 0 || self.image.height() == 0
  }
}

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("Invalid frame shape: {width}x{height}, stride {stride}")]
  InvalidShape {
    width: u32,
    height: u32,
    stride: usize,
  },
}

/// 打包像素的通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelOrder {
  Rgb,
  Bgr,
}

/// 将按行打包（可能带行填充）的 3 通道缓冲区转换为 RGB 图像
pub fn rgb_from_packed(
  data: &[u8],
  width: u32,
  height: u32,
  stride: usize,
  order: PixelOrder,
) -> Result<RgbImage, FrameError> {
  let row_bytes = width as usize * RGB_CHANNELS;
  if width == 0 || height == 0 || stride < row_bytes {
    return Err(FrameError::InvalidShape {
      width,
      height,
      stride,
    });
  }

  // 最后一行不要求带填充
  let expected = stride * (height as usize - 1) + row_bytes;
  if data.len() < expected {
    return Err(FrameError::BufferSizeMismatch {
      expected,
      actual: data.len(),
    });
  }

  let mut pixels = Vec::with_capacity(row_bytes * height as usize);
  for row in data.chunks(stride).take(height as usize) {
    let row = &row[..row_bytes];
    match order {
      PixelOrder::Rgb => pixels.extend_from_slice(row),
      PixelOrder::Bgr => {
        for px in row.chunks_exact(RGB_CHANNELS) {
          pixels.extend_from_slice(&[px[2], px[1], px[0]]);
        }
      }
    }
  }

  let actual = pixels.len();
  RgbImage::from_raw(width, height, pixels).ok_or(FrameError::BufferSizeMismatch {
    expected: row_bytes * height as usize,
    actual,
  })
}
