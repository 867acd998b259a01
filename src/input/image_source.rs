// 该文件是 Huoyan （火眼） 项目的一部分。
// src/input/image_source.rs - 图片输入源
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

use std::path::Path;

use image::{ImageReader, RgbImage};
use tracing::debug;

use super::{FrameSource, InputError, InputSourceType};
use crate::frame::Frame;

/// 图片输入源，产出一帧后结束
pub struct ImageSource {
  /// 图片数据
  image: Option<RgbImage>,
  location: String,
}

impl ImageSource {
  pub fn open(path: &Path) -> Result<Self, InputError> {
    let image = ImageReader::open(path)?
      .with_guessed_format()?
      .decode()?
      .to_rgb8();
    debug!(
      "图片已解码: {} ({}x{})",
      path.display(),
      image.width(),
      image.height()
    );

    Ok(Self {
      image: Some(image),
      location: path.display().to_string(),
    })
  }
}

impl Iterator for ImageSource {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    self.image.take().map(|image| Ok(Frame::new(image, 0, 0)))
  }
}

impl FrameSource for ImageSource {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Image
  }

  fn location(&self) -> &str {
    &self.location
  }
}
