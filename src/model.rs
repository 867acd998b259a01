// 该文件是 Huoyan （火眼） 项目的一部分。
// src/model.rs - 模型
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

use image::RgbImage;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

mod postprocess;
pub use self::postprocess::{Candidate, HeadLayout, decode_predictions, iou, nms};

#[cfg(feature = "model_yolo_onnx")]
mod yolo;
#[cfg(feature = "model_yolo_onnx")]
pub use self::yolo::{YoloBuilder, YoloDetector};

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

/// 单个检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  /// 像素坐标 [x1, y1, x2, y2]
  pub bbox: [i32; 4],
  pub class_id: u32,
  pub label: String,
  /// 置信度，范围 [0, 1]
  pub confidence: f32,
}

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("模型加载错误: {0}")]
  ModelLoad(String),
  #[error("模型推理错误: {0}")]
  Inference(String),
  #[error("模型输出形状不符: {0:?}")]
  UnexpectedOutput(Vec<usize>),
  #[error("模型路径错误: {0}")]
  ModelPath(String),
  #[error("标签文件错误: {0}")]
  Labels(#[from] std::io::Error),
}

/// 目标检测能力
///
/// 实现必须可在多个流之间并发调用，不可并发的后端应包装为 [`SerializedDetector`]。
pub trait Detector: Send + Sync {
  /// 检测一帧图像，不修改输入
  fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, InferenceError>;
  fn name(&self) -> &str;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
  fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, InferenceError> {
    (**self).detect(image)
  }

  fn name(&self) -> &str {
    (**self).name()
  }
}

/// 不做任何检测，原样输出帧
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDetector;

impl Detector for NoopDetector {
  fn detect(&self, _image: &RgbImage) -> Result<Vec<Detection>, InferenceError> {
    Ok(Vec::new())
  }

  fn name(&self) -> &str {
    "none"
  }
}

impl FromUrlWithScheme for NoopDetector {
  const SCHEME: &'static str = "none";
}

impl FromUrl for NoopDetector {
  type Error = InferenceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(InferenceError::ModelPath(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }
    Ok(NoopDetector)
  }
}

/// 串行化检测器，同一时刻只允许一次推理
pub struct SerializedDetector<D> {
  inner: Mutex<D>,
  name: String,
}

impl<D: Detector> SerializedDetector<D> {
  pub fn new(inner: D) -> Self {
    let name = format!("{} (serialized)", inner.name());
    Self {
      inner: Mutex::new(inner),
      name,
    }
  }
}

impl<D: Detector> Detector for SerializedDetector<D> {
  fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, InferenceError> {
    self.inner.lock().detect(image)
  }

  fn name(&self) -> &str {
    &self.name
  }
}

/// 由模型 URL 选择检测器后端
pub enum DetectorBuilder {
  Noop(NoopDetector),
  #[cfg(feature = "model_yolo_onnx")]
  Yolo(YoloBuilder),
}

impl FromUrl for DetectorBuilder {
  type Error = InferenceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "model_yolo_onnx")]
    {
      if url.scheme() == YoloBuilder::SCHEME {
        return Ok(DetectorBuilder::Yolo(YoloBuilder::from_url(url)?));
      }
    }
    if url.scheme() == NoopDetector::SCHEME {
      return Ok(DetectorBuilder::Noop(NoopDetector::from_url(url)?));
    }
    Err(InferenceError::ModelPath(format!(
      "不支持的模型方案: {}",
      url.scheme()
    )))
  }
}

impl DetectorBuilder {
  pub fn build(self) -> Result<Box<dyn Detector>, InferenceError> {
    let detector: Box<dyn Detector> = match self {
      DetectorBuilder::Noop(noop) => Box::new(noop),
      #[cfg(feature = "model_yolo_onnx")]
      DetectorBuilder::Yolo(builder) => Box::new(builder.build()?),
    };
    info!("检测器已就绪: {}", detector.name());
    Ok(detector)
  }
}

/// 读取标签文件，每行一个类别名称，忽略空行
pub fn load_labels(path: &Path) -> Result<Vec<String>, InferenceError> {
  let content = std::fs::read_to_string(path)?;
  Ok(
    content
      .lines()
      .map(str::trim)
      .filter(|line| !line.is_empty())
      .map(String::from)
      .collect(),
  )
}

pub fn coco_labels() -> Vec<String> {
  COCO_CLASSES.iter().map(|label| label.to_string()).collect()
}

pub fn label_for(labels: &[String], class_id: usize) -> String {
  labels
    .get(class_id)
    .cloned()
    .unwrap_or_else(|| format!("class{}", class_id))
}
