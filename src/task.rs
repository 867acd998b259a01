// 该文件是 Huoyan （火眼） 项目的一部分。
// src/task.rs - 推理流水线
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
  str::FromStr,
  sync::Arc,
  time::Instant,
};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  frame::Frame,
  input::InputError,
  model::{Detection, Detector, InferenceError},
  output::{Draw, StreamEncoder, wrap},
};

/// 推理失败时的处理策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InferencePolicy {
  /// 终止整个流
  #[default]
  Abort,
  /// 原样输出该帧并继续
  Passthrough,
}

impl FromStr for InferencePolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "abort" => Ok(InferencePolicy::Abort),
      "passthrough" => Ok(InferencePolicy::Passthrough),
      other => Err(format!("未知的推理失败策略: {} (可选 abort, passthrough)", other)),
    }
  }
}

impl Display for InferencePolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      InferencePolicy::Abort => f.write_str("abort"),
      InferencePolicy::Passthrough => f.write_str("passthrough"),
    }
  }
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("输入错误: {0}")]
  Input(#[from] InputError),
  #[error("推理错误: {0}")]
  Inference(#[from] InferenceError),
}

/// 已编码的一帧
#[derive(Debug, Clone)]
pub struct EncodedFrame {
  pub index: u64,
  pub timestamp_ms: u64,
  pub width: u32,
  pub height: u32,
  pub detections: Vec<Detection>,
  pub jpeg: Bytes,
}

impl EncodedFrame {
  /// 转换为 multipart 分块
  pub fn into_chunk(self) -> Bytes {
    wrap(&self.jpeg)
  }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
  pub frames_read: u64,
  pub frames_emitted: u64,
  pub frames_skipped: u64,
  pub inference_failures: u64,
  pub detections: u64,
}

/// 拉取式推理流水线：读帧、检测、绘制、编码
///
/// 每次 `next` 最多处理一帧。编码失败的帧被跳过，推理失败按 [`InferencePolicy`]
/// 处理，读取失败会结束流。流水线被丢弃时帧源随之释放。
pub struct Pipeline<S> {
  source: S,
  detector: Arc<dyn Detector>,
  draw: Arc<Draw>,
  encoder: StreamEncoder,
  policy: InferencePolicy,
  frame_limit: Option<u64>,
  stats: PipelineStats,
  started: Instant,
  finished: bool,
}

impl<S> Pipeline<S>
where
  S: Iterator<Item = Result<Frame, InputError>>,
{
  pub fn new(source: S, detector: Arc<dyn Detector>, draw: Arc<Draw>, encoder: StreamEncoder) -> Self {
    Self {
      source,
      detector,
      draw,
      encoder,
      policy: InferencePolicy::default(),
      frame_limit: None,
      stats: PipelineStats::default(),
      started: Instant::now(),
      finished: false,
    }
  }

  pub fn with_policy(mut self, policy: InferencePolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn with_frame_limit(mut self, frame_limit: Option<u64>) -> Self {
    self.frame_limit = frame_limit;
    self
  }

  pub fn stats(&self) -> PipelineStats {
    self.stats
  }

  /// 处理单帧，返回 `None` 表示该帧被跳过
  fn process(&mut self, frame: Frame) -> Result<Option<EncodedFrame>, PipelineError> {
    let detections = match self.detector.detect(&frame.image) {
      Ok(detections) => detections,
      Err(e) => {
        self.stats.inference_failures += 1;
        match self.policy {
          InferencePolicy::Abort => return Err(e.into()),
          InferencePolicy::Passthrough => {
            warn!("第 {} 帧推理失败，原样输出: {}", frame.index, e);
            Vec::new()
          }
        }
      }
    };
    self.stats.detections += detections.len() as u64;
    debug!("第 {} 帧检测到 {} 个目标", frame.index, detections.len());

    let Frame {
      image,
      index,
      timestamp_ms,
    } = frame;
    let annotated = self.draw.annotate(image, &detections);

    match self.encoder.encode(&annotated) {
      Ok(jpeg) => Ok(Some(EncodedFrame {
        index,
        timestamp_ms,
        width: annotated.width(),
        height: annotated.height(),
        detections,
        jpeg,
      })),
      Err(e) => {
        warn!("第 {} 帧编码失败，跳过: {}", index, e);
        self.stats.frames_skipped += 1;
        Ok(None)
      }
    }
  }
}

impl<S> Iterator for Pipeline<S>
where
  S: Iterator<Item = Result<Frame, InputError>>,
{
  type Item = Result<EncodedFrame, PipelineError>;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      if self.finished {
        return None;
      }

      if let Some(limit) = self.frame_limit
        && self.stats.frames_read >= limit
      {
        info!("达到指定帧数 {}, 结束流", limit);
        self.finished = true;
        return None;
      }

      let frame = match self.source.next() {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => {
          self.finished = true;
          return Some(Err(e.into()));
        }
        None => {
          debug!("帧源已结束");
          self.finished = true;
          return None;
        }
      };
      self.stats.frames_read += 1;

      match self.process(frame) {
        Ok(Some(encoded)) => {
          self.stats.frames_emitted += 1;
          return Some(Ok(encoded));
        }
        Ok(None) => continue,
        Err(e) => {
          self.finished = true;
          return Some(Err(e));
        }
      }
    }
  }
}

impl<S> Drop for Pipeline<S> {
  fn drop(&mut self) {
    let stats = self.stats;
    info!(
      "流水线结束: 读取 {} 帧, 输出 {} 帧, 跳过 {} 帧, 推理失败 {} 次, 共 {} 个目标, 耗时 {:.2?}",
      stats.frames_read,
      stats.frames_emitted,
      stats.frames_skipped,
      stats.inference_failures,
      stats.detections,
      self.started.elapsed()
    );
  }
}
