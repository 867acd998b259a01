// 该文件是 Huoyan （火眼） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
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

//! # GStreamer 视频输入模块
//!
//! 通过 GStreamer 解码任意容器格式的视频文件，或通过 `v4l2src` 采集摄像头。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! ## Cargo 特性
//!
//! 启用 `gstreamer_input` 特性。
//!
//! ## 基本用法
//!
//! ```no_run
//! use std::path::Path;
//! use huoyan::input::GStreamerInputPipelineBuilder;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let input = GStreamerInputPipelineBuilder::file(Path::new("video.mp4")).build()?;
//! for frame in input {
//!     let frame = frame?;
//!     println!("处理帧: {}x{}", frame.width(), frame.height());
//! }
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{FrameSource, InputError, InputSourceType};
use crate::frame::{Frame, FrameError, PixelOrder, rgb_from_packed};

/// 管道进入 PLAYING 状态的最长等待时间
const GSTREAMER_PREROLL_TIMEOUT_SECS: u64 = 10;

/// GStreamer 输入错误类型
#[derive(Error, Debug)]
pub enum GStreamerInputError {
  /// GStreamer 库错误
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// GStreamer 布尔操作错误
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  /// 无法获取 appsink 元素
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  /// 无法转换元素为 appsink
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  /// 无法从 caps 获取视频信息
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  /// 不支持的视频格式
  #[error("Unsupported video format: {0:?}")]
  UnsupportedFormat(gst_video::VideoFormat),
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 帧转换错误
  #[error("Frame error: {0}")]
  FrameError(#[from] FrameError),
  /// 状态改变错误
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

/// 管道中源元素的名称，位置参数在解析后以属性方式设置
const SOURCE_ELEMENT: &str = "src";

pub enum GStreamerInputBuilderItem {
  FileSource,
  CameraSource,
  TargetFormat { format: String },
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerInputBuilderItem::FileSource => {
        format!("filesrc name={} ! decodebin", SOURCE_ELEMENT)
      }
      GStreamerInputBuilderItem::CameraSource => format!("v4l2src name={}", SOURCE_ELEMENT),
      GStreamerInputBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
    }
  }
}

/// GStreamer 输入管道构建器
pub struct GStreamerInputPipelineBuilder {
  items: Vec<GStreamerInputBuilderItem>,
  source_type: InputSourceType,
  location: String,
}

impl GStreamerInputPipelineBuilder {
  pub fn file(path: &Path) -> Self {
    Self {
      items: vec![
        GStreamerInputBuilderItem::FileSource,
        GStreamerInputBuilderItem::TargetFormat {
          format: "RGB".to_string(),
        },
      ],
      source_type: InputSourceType::Video,
      location: path.display().to_string(),
    }
  }

  pub fn camera(device: &Path) -> Self {
    Self {
      items: vec![
        GStreamerInputBuilderItem::CameraSource,
        GStreamerInputBuilderItem::TargetFormat {
          format: "RGB".to_string(),
        },
      ],
      source_type: InputSourceType::Camera,
      location: device.display().to_string(),
    }
  }

  /// 管道描述，不包含文件路径或设备路径
  pub fn description(&self) -> String {
    let basic_pipeline = self
      .items
      .iter()
      .map(GStreamerInputBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    // 文件逐帧读取不丢帧，摄像头只保留最新的帧
    let sink = match self.source_type {
      InputSourceType::Camera => "appsink name=sink sync=false max-buffers=2 drop=true",
      _ => "appsink name=sink sync=false",
    };
    format!("{} ! {}", basic_pipeline, sink)
  }

  fn source_property(&self) -> &'static str {
    match self.source_type {
      InputSourceType::Camera => "device",
      _ => "location",
    }
  }

  pub fn build(self) -> Result<GStreamerInput, GStreamerInputError> {
    gst::init()?;

    let full_pipeline = self.description();
    info!(
      "GStreamer pipeline description: {} ({}={})",
      full_pipeline,
      self.source_property(),
      self.location
    );

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("Failed to create pipeline".to_string()))?;

    let source = pipeline.by_name(SOURCE_ELEMENT).ok_or_else(|| {
      GStreamerInputError::PipelineError("Failed to get source element".to_string())
    })?;
    source.set_property(self.source_property(), self.location.as_str());

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    // 等待预滚完成，文件无法解码或设备不存在时在这里失败
    if let Err(e) = start(&pipeline) {
      let _ = pipeline.set_state(gst::State::Null);
      return Err(e);
    }

    Ok(GStreamerInput {
      pipeline,
      appsink,
      source_type: self.source_type,
      location: self.location,
      index: 0,
    })
  }
}

fn start(pipeline: &gst::Pipeline) -> Result<(), GStreamerInputError> {
  pipeline.set_state(gst::State::Playing)?;
  let (result, _, _) = pipeline.state(gst::ClockTime::from_seconds(
    GSTREAMER_PREROLL_TIMEOUT_SECS,
  ));
  result?;
  Ok(())
}

/// GStreamer 视频输入
///
/// 管理 GStreamer 管道和 appsink，提供视频帧迭代功能。
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  source_type: InputSourceType,
  location: String,
  index: u64,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
    debug!("GStreamer 管道已停止: {}", self.location);
  }
}

impl Iterator for GStreamerInput {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    let sample = match self.appsink.pull_sample() {
      Ok(sample) => sample,
      Err(e) => {
        if self.appsink.is_eos() {
          return None;
        }
        return Some(Err(
          GStreamerInputError::PipelineError(format!("Failed to pull sample: {}", e)).into(),
        ));
      }
    };

    let frame = convert_sample(&sample, self.index).map_err(InputError::from);
    self.index += 1;
    Some(frame)
  }
}

impl FrameSource for GStreamerInput {
  fn source_type(&self) -> InputSourceType {
    self.source_type
  }

  fn location(&self) -> &str {
    &self.location
  }
}

fn convert_sample(sample: &gst::Sample, index: u64) -> Result<Frame, GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("No caps in sample".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

  let order = match video_info.format() {
    gst_video::VideoFormat::Rgb => PixelOrder::Rgb,
    gst_video::VideoFormat::Bgr => PixelOrder::Bgr,
    other => return Err(GStreamerInputError::UnsupportedFormat(other)),
  };
  let stride = video_info.stride()[0] as usize;

  let map = buffer.map_readable().map_err(|e| {
    GStreamerInputError::PipelineError(format!("Failed to map buffer for reading: {}", e))
  })?;
  let image = rgb_from_packed(
    map.as_slice(),
    video_info.width(),
    video_info.height(),
    stride,
    order,
  )?;

  let timestamp_ms = buffer.pts().map(|pts| pts.mseconds()).unwrap_or(0);
  Ok(Frame::new(image, index, timestamp_ms))
}
