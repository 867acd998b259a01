// 该文件是 Huoyan （火眼） 项目的一部分。
// src/input.rs - 视频/图像输入
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

use std::{
  fmt::{self, Display},
  path::{Path, PathBuf},
};

use image::RgbImage;
use thiserror::Error;

use crate::{
  FromUrl,
  frame::{Frame, FrameError},
};

#[cfg(feature = "read_image_file")]
mod gif_source;
#[cfg(feature = "read_image_file")]
mod image_source;
#[cfg(feature = "read_image_file")]
pub use self::{gif_source::GifSource, image_source::ImageSource};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{
  GStreamerInput, GStreamerInputError, GStreamerInputPipelineBuilder,
};

#[cfg(feature = "v4l_input")]
mod v4l_input;
#[cfg(feature = "v4l_input")]
pub use self::v4l_input::{V4lInput, V4lInputError};

#[derive(Error, Debug)]
pub enum InputError {
  #[error("Could not open video source {location}: {reason}")]
  SourceUnavailable { location: String, reason: String },
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Image decoding error: {0}")]
  Image(#[from] image::ImageError),
  #[error("Frame conversion error: {0}")]
  Frame(#[from] FrameError),
  #[error("No input backend available for {0}")]
  NoBackend(String),
  #[error("URI scheme mismatch: {0}")]
  SchemeMismatch(String),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer input error: {0}")]
  GStreamer(#[from] GStreamerInputError),
  #[cfg(feature = "v4l_input")]
  #[error("V4L input error: {0}")]
  V4l(#[from] V4lInputError),
}

impl InputError {
  pub fn unavailable(location: impl Display, reason: impl Display) -> Self {
    InputError::SourceUnavailable {
      location: location.to_string(),
      reason: reason.to_string(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSourceType {
  Image,
  Animation,
  Video,
  Camera,
}

/// 视频来源描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
  /// 本地文件
  File(PathBuf),
  /// 实时设备，纯数字 `N` 表示 `/dev/videoN`
  Device(String),
}

impl SourceSpec {
  pub fn device_path(id: &str) -> PathBuf {
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
      PathBuf::from(format!("/dev/video{}", id))
    } else {
      PathBuf::from(id)
    }
  }
}

impl Display for SourceSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SourceSpec::File(path) => write!(f, "file {}", path.display()),
      SourceSpec::Device(id) => write!(f, "device {}", Self::device_path(id).display()),
    }
  }
}

/// 支持 `file:///path/to/video.gif` 与 `camera://0`、`camera:///dev/video2`
impl FromUrl for SourceSpec {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      "file" => Ok(SourceSpec::File(PathBuf::from(crate::decode_url_path(url)))),
      "camera" | "v4l" => {
        let id = match url.host_str() {
          Some(host) if !host.is_empty() => host.to_string(),
          _ => crate::decode_url_path(url),
        };
        let id = if id.is_empty() { "0".to_string() } else { id };
        Ok(SourceSpec::Device(id))
      }
      other => Err(InputError::SchemeMismatch(other.to_string())),
    }
  }
}

/// 帧源：`None` 表示流结束，`Some(Err(_))` 表示读取失败。
///
/// 底层文件或设备句柄在 `Drop` 中释放。
pub trait FrameSource: Iterator<Item = Result<Frame, InputError>> {
  fn source_type(&self) -> InputSourceType;
  fn location(&self) -> &str;
}

pub trait SourceOpener: Send + Sync {
  fn open(&self, spec: &SourceSpec) -> Result<Box<dyn FrameSource>, InputError>;
}

/// 按内容嗅探与已启用的特性选择后端
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultOpener;

impl SourceOpener for DefaultOpener {
  fn open(&self, spec: &SourceSpec) -> Result<Box<dyn FrameSource>, InputError> {
    match spec {
      SourceSpec::File(path) => open_file(path),
      SourceSpec::Device(id) => open_device(id),
    }
  }
}

fn open_file(path: &Path) -> Result<Box<dyn FrameSource>, InputError> {
  if !path.is_file() {
    return Err(InputError::unavailable(path.display(), "no such file"));
  }

  #[allow(unused_mut)]
  let mut last_error = InputError::NoBackend(path.display().to_string());

  #[cfg(feature = "read_image_file")]
  {
    match sniff_image_format(path) {
      Some(image::ImageFormat::Gif) => {
        tracing::debug!("按 GIF 动画打开: {}", path.display());
        return GifSource::open(path)
          .map(|source| Box::new(source) as Box<dyn FrameSource>)
          .map_err(|e| InputError::unavailable(path.display(), e));
      }
      Some(format) => {
        tracing::debug!("按静态图片打开 ({:?}): {}", format, path.display());
        return ImageSource::open(path)
          .map(|source| Box::new(source) as Box<dyn FrameSource>)
          .map_err(|e| InputError::unavailable(path.display(), e));
      }
      None => {}
    }
  }

  #[cfg(feature = "gstreamer_input")]
  {
    match GStreamerInputPipelineBuilder::file(path).build() {
      Ok(input) => return Ok(Box::new(input)),
      Err(e) => {
        tracing::warn!("GStreamer 无法打开 {}: {}", path.display(), e);
        last_error = e.into();
      }
    }
  }

  Err(InputError::unavailable(path.display(), last_error))
}

fn open_device(id: &str) -> Result<Box<dyn FrameSource>, InputError> {
  let device = SourceSpec::device_path(id);

  #[allow(unused_mut)]
  let mut last_error = InputError::NoBackend(device.display().to_string());

  #[cfg(feature = "v4l_input")]
  {
    match V4lInput::open(&device) {
      Ok(input) => return Ok(Box::new(input)),
      Err(e) => {
        tracing::warn!("V4L 无法打开 {}: {}", device.display(), e);
        last_error = e.into();
      }
    }
  }

  #[cfg(feature = "gstreamer_input")]
  {
    match GStreamerInputPipelineBuilder::camera(&device).build() {
      Ok(input) => return Ok(Box::new(input)),
      Err(e) => {
        tracing::warn!("GStreamer 无法打开 {}: {}", device.display(), e);
        last_error = e.into();
      }
    }
  }

  Err(InputError::unavailable(device.display(), last_error))
}

#[cfg(feature = "read_image_file")]
fn sniff_image_format(path: &Path) -> Option<image::ImageFormat> {
  // 只看内容，不看扩展名
  let file = std::fs::File::open(path).ok()?;
  image::ImageReader::new(std::io::BufReader::new(file))
    .with_guessed_format()
    .ok()?
    .format()
}

/// 内存帧源，按顺序产出给定图像
pub struct MemorySource {
  images: std::vec::IntoIter<RgbImage>,
  index: u64,
  interval_ms: u64,
  location: String,
}

impl MemorySource {
  pub fn new(images: Vec<RgbImage>) -> Self {
    Self {
      images: images.into_iter(),
      index: 0,
      interval_ms: 0,
      location: "memory".to_string(),
    }
  }

  pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
    self.interval_ms = interval_ms;
    self
  }
}

impl Iterator for MemorySource {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    let image = self.images.next()?;
    let frame = Frame::new(image, self.index, self.index * self.interval_ms);
    self.index += 1;
    Some(Ok(frame))
  }
}

impl FrameSource for MemorySource {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Video
  }

  fn location(&self) -> &str {
    &self.location
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn numeric_device_ids_map_to_video_nodes() {
    assert_eq!(SourceSpec::device_path("0"), PathBuf::from("/dev/video0"));
    assert_eq!(SourceSpec::device_path("12"), PathBuf::from("/dev/video12"));
    assert_eq!(
      SourceSpec::device_path("/dev/v4l/by-id/usb-cam"),
      PathBuf::from("/dev/v4l/by-id/usb-cam")
    );
  }

  #[test]
  fn source_spec_from_url() {
    let url = url::Url::parse("file:///tmp/some%20clip.gif").unwrap();
    assert_eq!(
      SourceSpec::from_url(&url).unwrap(),
      SourceSpec::File(PathBuf::from("/tmp/some clip.gif"))
    );

    let url = url::Url::parse("camera://2").unwrap();
    assert_eq!(
      SourceSpec::from_url(&url).unwrap(),
      SourceSpec::Device("2".to_string())
    );

    let url = url::Url::parse("camera:///dev/video4").unwrap();
    assert_eq!(
      SourceSpec::from_url(&url).unwrap(),
      SourceSpec::Device("/dev/video4".to_string())
    );

    let url = url::Url::parse("rtsp://host/stream").unwrap();
    assert!(matches!(
      SourceSpec::from_url(&url),
      Err(InputError::SchemeMismatch(_))
    ));
  }

  #[test]
  fn missing_file_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let spec = SourceSpec::File(dir.path().join("missing.mp4"));
    let err = DefaultOpener.open(&spec).err().unwrap();
    assert!(matches!(err, InputError::SourceUnavailable { .. }));
  }

  #[test]
  fn undecodable_file_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.mp4");
    std::fs::write(&path, b"this is not a video").unwrap();
    let err = DefaultOpener.open(&SourceSpec::File(path)).err().unwrap();
    assert!(matches!(err, InputError::SourceUnavailable { .. }));
  }

  #[test]
  fn memory_source_yields_frames_in_order() {
    let images = vec![RgbImage::new(4, 2), RgbImage::new(4, 2)];
    let frames: Vec<Frame> = MemorySource::new(images)
      .with_interval_ms(40)
      .map(Result::unwrap)
      .collect();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].index, 1);
    assert_eq!(frames[1].timestamp_ms, 40);
  }

  #[cfg(feature = "read_image_file")]
  #[test]
  fn gif_file_opens_as_animation() {
    use image::{Delay, Frame as GifFrame, Rgba, RgbaImage, codecs::gif::GifEncoder};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.gif");
    {
      let file = std::fs::File::create(&path).unwrap();
      let mut encoder = GifEncoder::new(file);
      for shade in [0u8, 120, 240] {
        let image = RgbaImage::from_pixel(8, 6, Rgba([shade, shade, shade, 255]));
        encoder
          .encode_frame(GifFrame::from_parts(
            image,
            0,
            0,
            Delay::from_numer_denom_ms(100, 1),
          ))
          .unwrap();
      }
    }

    let source = DefaultOpener.open(&SourceSpec::File(path)).unwrap();
    assert_eq!(source.source_type(), InputSourceType::Animation);
    let frames: Vec<Frame> = source.map(Result::unwrap).collect();
    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(|f| f.width() == 8 && f.height() == 6));
    assert_eq!(frames[2].index, 2);
    assert_eq!(frames[2].timestamp_ms, 200);
  }

  #[cfg(feature = "read_image_file")]
  #[test]
  fn still_image_yields_one_frame() {
    let dir = tempfile::tempdir().unwrap();
    // 扩展名故意不符，依赖内容嗅探
    let path = dir.path().join("snapshot.bin");
    RgbImage::from_pixel(5, 3, image::Rgb([1, 2, 3]))
      .save_with_format(&path, image::ImageFormat::Png)
      .unwrap();

    let source = DefaultOpener.open(&SourceSpec::File(path)).unwrap();
    assert_eq!(source.source_type(), InputSourceType::Image);
    let frames: Vec<Frame> = source.map(Result::unwrap).collect();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].image.get_pixel(4, 2).0, [1, 2, 3]);
  }
}
