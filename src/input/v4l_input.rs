// 该文件是 Huoyan （火眼） 项目的一部分。
// src/input/v4l_input.rs - V4L 视频输入
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

use std::{path::Path, time::Instant};

use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tracing::{debug, info};
use v4l::{
  Device, FourCC,
  buffer::Type,
  io::{mmap::Stream, traits::CaptureStream},
  video::Capture,
};

use super::{FrameSource, InputError, InputSourceType};
use crate::frame::{Frame, FrameError, PixelOrder, rgb_from_packed};

const V4L_BUFFER_COUNT: u32 = 4;

#[derive(Error, Debug)]
pub enum V4lInputError {
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Unsupported pixel format: {0}")]
  UnsupportedPixelFormat(String),
  #[error("MJPG decoding error: {0}")]
  DecodeError(#[from] image::ImageError),
  #[error("Frame error: {0}")]
  FrameError(#[from] FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
  Mjpg,
  Rgb3,
  Yuyv,
}

impl PixelFormat {
  fn from_fourcc(fourcc: FourCC) -> Result<Self, V4lInputError> {
    match &fourcc.repr {
      b"MJPG" => Ok(PixelFormat::Mjpg),
      b"RGB3" => Ok(PixelFormat::Rgb3),
      b"YUYV" => Ok(PixelFormat::Yuyv),
      _ => Err(V4lInputError::UnsupportedPixelFormat(fourcc.to_string())),
    }
  }
}

/// V4L2 摄像头输入，使用内存映射缓冲区逐帧采集
pub struct V4lInput {
  stream: Stream<'static>,
  location: String,
  width: u32,
  height: u32,
  stride: usize,
  pixel_format: PixelFormat,
  index: u64,
  started: Instant,
}

impl V4lInput {
  pub fn open(path: &Path) -> Result<Self, V4lInputError> {
    let device = Device::with_path(path)?;

    // 优先请求 MJPG，驱动可能协商为其他格式
    let mut format = device.format()?;
    format.fourcc = FourCC::new(b"MJPG");
    let format = device.set_format(&format)?;
    let pixel_format = PixelFormat::from_fourcc(format.fourcc)?;

    info!(
      "V4L 设备已打开: {} ({}x{}, {})",
      path.display(),
      format.width,
      format.height,
      format.fourcc
    );

    let stream = Stream::with_buffers(&device, Type::VideoCapture, V4L_BUFFER_COUNT)?;

    Ok(Self {
      stream,
      location: path.display().to_string(),
      width: format.width,
      height: format.height,
      stride: format.stride as usize,
      pixel_format,
      index: 0,
      started: Instant::now(),
    })
  }

  fn capture_frame(&mut self) -> Result<RgbImage, V4lInputError> {
    let (buf, meta) = self.stream.next()?;
    let used = (meta.bytesused as usize).min(buf.len());
    let data = &buf[..used];

    let image = match self.pixel_format {
      PixelFormat::Mjpg => image::load_from_memory_with_format(data, ImageFormat::Jpeg)?.to_rgb8(),
      PixelFormat::Rgb3 => {
        rgb_from_packed(data, self.width, self.height, self.stride, PixelOrder::Rgb)?
      }
      PixelFormat::Yuyv => yuyv_to_rgb(data, self.width, self.height, self.stride)?,
    };
    Ok(image)
  }
}

impl Iterator for V4lInput {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    let frame = self.capture_frame().map(|image| {
      let timestamp_ms = self.started.elapsed().as_millis() as u64;
      Frame::new(image, self.index, timestamp_ms)
    });
    self.index += 1;
    if let Err(e) = &frame {
      debug!("V4L 采集失败 {}: {}", self.location, e);
    }
    Some(frame.map_err(InputError::from))
  }
}

impl FrameSource for V4lInput {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Camera
  }

  fn location(&self) -> &str {
    &self.location
  }
}

/// YUYV (YUV 4:2:2) 转 RGB，BT.601 系数
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32, stride: usize) -> Result<RgbImage, FrameError> {
  let row_bytes = width as usize * 2;
  let stride = stride.max(row_bytes);
  if width == 0 || height == 0 || width % 2 != 0 {
    return Err(FrameError::InvalidShape {
      width,
      height,
      stride,
    });
  }
  let expected = stride * (height as usize - 1) + row_bytes;
  if data.len() < expected {
    return Err(FrameError::BufferSizeMismatch {
      expected,
      actual: data.len(),
    });
  }

  let mut pixels = Vec::with_capacity(width as usize * height as usize * 3);
  for row in data.chunks(stride).take(height as usize) {
    for quad in row[..row_bytes].chunks_exact(4) {
      let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
      pixels.extend_from_slice(&yuv_to_rgb(y0, u, v));
      pixels.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
  }

  let actual = pixels.len();
  RgbImage::from_raw(width, height, pixels).ok_or(FrameError::BufferSizeMismatch {
    expected: width as usize * height as usize * 3,
    actual,
  })
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
  let c = f32::from(y) - 16.0;
  let d = f32::from(u) - 128.0;
  let e = f32::from(v) - 128.0;
  let r = 1.164 * c + 1.596 * e;
  let g = 1.164 * c - 0.392 * d - 0.813 * e;
  let b = 1.164 * c + 2.017 * d;
  [
    r.clamp(0.0, 255.0) as u8,
    g.clamp(0.0, 255.0) as u8,
    b.clamp(0.0, 255.0) as u8,
  ]
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn yuyv_grey_stays_grey() {
    // Y=128, U=V=128 为中性灰
    let data = [128u8, 128, 128, 128];
    let image = yuyv_to_rgb(&data, 2, 1, 4).unwrap();
    let px = image.get_pixel(0, 0).0;
    assert_eq!(px[0], px[1]);
    assert_eq!(px[1], px[2]);
    assert_eq!(image.get_pixel(1, 0).0, px);
  }

  #[test]
  fn yuyv_rejects_odd_width() {
    assert!(yuyv_to_rgb(&[0u8; 6], 3, 1, 6).is_err());
  }
}
