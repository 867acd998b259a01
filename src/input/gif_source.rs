// 该文件是 Huoyan （火眼） 项目的一部分。
// src/input/gif_source.rs - GIF 动画输入源
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

use std::{fs::File, io::BufReader, path::Path};

use image::{AnimationDecoder, DynamicImage, Frames, codecs::gif::GifDecoder};
use tracing::debug;

use super::{FrameSource, InputError, InputSourceType};
use crate::frame::Frame;

/// GIF 动画输入源
///
/// 逐帧惰性解码，每次只在内存中保留一帧。帧时间戳按各帧延迟累加。
pub struct GifSource {
  frames: Frames<'static>,
  location: String,
  index: u64,
  elapsed_ms: u64,
}

impl GifSource {
  pub fn open(path: &Path) -> Result<Self, InputError> {
    let reader = BufReader::new(File::open(path)?);
    let decoder = GifDecoder::new(reader)?;
    debug!("打开 GIF 动画: {}", path.display());

    Ok(Self {
      frames: decoder.into_frames(),
      location: path.display().to_string(),
      index: 0,
      elapsed_ms: 0,
    })
  }
}

impl Iterator for GifSource {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    let frame = match self.frames.next()? {
      Ok(frame) => frame,
      Err(e) => return Some(Err(e.into())),
    };

    let (numer, denom) = frame.delay().numer_denom_ms();
    let delay_ms = if denom == 0 { 0 } else { numer / denom };

    let image = DynamicImage::ImageRgba8(frame.into_buffer()).to_rgb8();
    let output = Frame::new(image, self.index, self.elapsed_ms);

    self.index += 1;
    self.elapsed_ms += u64::from(delay_ms);
    Some(Ok(output))
  }
}

impl FrameSource for GifSource {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Animation
  }

  fn location(&self) -> &str {
    &self.location
  }
}
