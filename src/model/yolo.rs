// 该文件是 Huoyan （火眼） 项目的一部分。
// src/model/yolo.rs - YOLO ONNX 目标检测器
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

use std::{collections::HashMap, path::PathBuf, time::Instant};

use image::{RgbImage, imageops::FilterType};
use tracing::{debug, info};
use tract_onnx::prelude::*;
use url::Url;

use super::{
  Detection, Detector, InferenceError, coco_labels, decode_predictions, label_for, load_labels,
  nms,
};
use crate::{FromUrl, FromUrlWithScheme};

const YOLO_DEFAULT_INPUT_SIZE: u32 = 640;
const YOLO_DEFAULT_CONFIDENCE: f32 = 0.25;
const YOLO_DEFAULT_IOU: f32 = 0.45;
const YOLO_MAX_DETECTIONS: usize = 300;

type YoloPlan = TypedRunnableModel<TypedModel>;

/// YOLO 检测器构建器
///
/// URL 形如 `yolo:///models/yolov8n.onnx?confidence=0.25&iou=0.45&size=640&labels=/models/labels.txt`
#[derive(Debug, Clone)]
pub struct YoloBuilder {
  model_path: PathBuf,
  labels_path: Option<PathBuf>,
  input_size: u32,
  confidence: f32,
  iou: f32,
}

impl FromUrlWithScheme for YoloBuilder {
  const SCHEME: &'static str = "yolo";
}

impl FromUrl for YoloBuilder {
  type Error = InferenceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(InferenceError::ModelPath(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let model_path = crate::decode_url_path(url);
    if model_path.is_empty() || model_path == "/" {
      return Err(InferenceError::ModelPath("缺少模型文件路径".to_string()));
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let parse = |key: &str| -> Result<Option<f32>, InferenceError> {
      query
        .get(key)
        .map(|v| {
          v.parse::<f32>()
            .map_err(|_| InferenceError::ModelPath(format!("参数 {} 无效: {}", key, v)))
        })
        .transpose()
    };

    let mut builder = YoloBuilder::new(model_path);
    if let Some(confidence) = parse("confidence")? {
      builder = builder.confidence(confidence);
    }
    if let Some(iou) = parse("iou")? {
      builder = builder.iou(iou);
    }
    if let Some(size) = query.get("size") {
      let size = size
        .parse::<u32>()
        .map_err(|_| InferenceError::ModelPath(format!("参数 size 无效: {}", size)))?;
      builder = builder.input_size(size);
    }
    if let Some(labels) = query.get("labels") {
      builder = builder.labels(labels);
    }
    Ok(builder)
  }
}

impl YoloBuilder {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: model_path.into(),
      labels_path: None,
      input_size: YOLO_DEFAULT_INPUT_SIZE,
      confidence: YOLO_DEFAULT_CONFIDENCE,
      iou: YOLO_DEFAULT_IOU,
    }
  }

  pub fn confidence(mut self, confidence: f32) -> Self {
    self.confidence = confidence.clamp(0.0, 1.0);
    self
  }

  pub fn iou(mut self, iou: f32) -> Self {
    self.iou = iou.clamp(0.0, 1.0);
    self
  }

  pub fn input_size(mut self, size: u32) -> Self {
    self.input_size = size.max(32);
    self
  }

  pub fn labels(mut self, path: impl Into<PathBuf>) -> Self {
    self.labels_path = Some(path.into());
    self
  }

  pub fn build(self) -> Result<YoloDetector, InferenceError> {
    info!("加载模型文件: {}", self.model_path.display());
    let labels = match &self.labels_path {
      Some(path) => load_labels(path)?,
      None => coco_labels(),
    };
    debug!("类别数量: {}", labels.len());

    let size = self.input_size as usize;
    let started = Instant::now();
    let plan = tract_onnx::onnx()
      .model_for_path(&self.model_path)
      .and_then(|model| model.with_input_fact(0, f32::fact([1, 3, size, size]).into()))
      .and_then(|model| model.into_optimized())
      .and_then(|model| model.into_runnable())
      .map_err(|e| {
        InferenceError::ModelLoad(format!("{}: {}", self.model_path.display(), e))
      })?;
    info!("模型加载完成，耗时: {:.2?}", started.elapsed());

    Ok(YoloDetector {
      plan,
      labels,
      input_size: self.input_size,
      confidence: self.confidence,
      iou: self.iou,
      name: format!("yolo:{}", self.model_path.display()),
    })
  }
}

/// YOLO 目标检测器
///
/// 优化后的 tract 计划不可变，每次推理创建独立状态，可并发调用。
pub struct YoloDetector {
  plan: YoloPlan,
  labels: Vec<String>,
  input_size: u32,
  confidence: f32,
  iou: f32,
  name: String,
}

impl YoloDetector {
  /// 缩放到模型输入尺寸并归一化为 NCHW 浮点张量
  fn preprocess(&self, image: &RgbImage) -> Tensor {
    let size = self.input_size;
    let resized = image::imageops::resize(image, size, size, FilterType::Triangle);
    let size = size as usize;
    tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
      f32::from(resized.get_pixel(x as u32, y as u32)[c]) / 255.0
    })
    .into()
  }
}

impl Detector for YoloDetector {
  fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, InferenceError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
      return Ok(Vec::new());
    }

    let started = Instant::now();
    let input = self.preprocess(image);
    let outputs = self
      .plan
      .run(tvec!(input.into()))
      .map_err(|e| InferenceError::Inference(e.to_string()))?;
    let output = outputs
      .first()
      .ok_or_else(|| InferenceError::Inference("模型没有输出".to_string()))?
      .to_array_view::<f32>()
      .map_err(|e| InferenceError::Inference(e.to_string()))?;

    let shape = output.shape().to_vec();
    let data: Vec<f32> = output.iter().copied().collect();
    let candidates = decode_predictions(&data, &shape, self.labels.len(), self.confidence)?;
    let kept = nms(candidates, self.iou);

    let scale_x = width as f32 / self.input_size as f32;
    let scale_y = height as f32 / self.input_size as f32;
    let max_x = width as f32;
    let max_y = height as f32;

    let detections: Vec<Detection> = kept
      .into_iter()
      .take(YOLO_MAX_DETECTIONS)
      .map(|candidate| {
        let [x1, y1, x2, y2] = candidate.bbox;
        Detection {
          bbox: [
            (x1 * scale_x).clamp(0.0, max_x).round() as i32,
            (y1 * scale_y).clamp(0.0, max_y).round() as i32,
            (x2 * scale_x).clamp(0.0, max_x).round() as i32,
            (y2 * scale_y).clamp(0.0, max_y).round() as i32,
          ],
          class_id: candidate.class_id as u32,
          label: label_for(&self.labels, candidate.class_id),
          confidence: candidate.score.clamp(0.0, 1.0),
        }
      })
      .collect();

    debug!(
      "推理完成，检测到 {} 个目标，耗时: {:.2?}",
      detections.len(),
      started.elapsed()
    );
    Ok(detections)
  }

  fn name(&self) -> &str {
    &self.name
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_reads_query_parameters() {
    let url =
      Url::parse("yolo:///models/fire%20smoke.onnx?confidence=0.4&iou=0.5&size=320&labels=/models/labels.txt")
        .unwrap();
    let builder = YoloBuilder::from_url(&url).unwrap();
    assert_eq!(builder.model_path, PathBuf::from("/models/fire smoke.onnx"));
    assert_eq!(builder.confidence, 0.4);
    assert_eq!(builder.iou, 0.5);
    assert_eq!(builder.input_size, 320);
    assert_eq!(builder.labels_path, Some(PathBuf::from("/models/labels.txt")));
  }

  #[test]
  fn builder_defaults() {
    let url = Url::parse("yolo:///models/yolov8n.onnx").unwrap();
    let builder = YoloBuilder::from_url(&url).unwrap();
    assert_eq!(builder.input_size, YOLO_DEFAULT_INPUT_SIZE);
    assert_eq!(builder.confidence, YOLO_DEFAULT_CONFIDENCE);
    assert!(builder.labels_path.is_none());
  }

  #[test]
  fn invalid_threshold_is_rejected() {
    let url = Url::parse("yolo:///models/yolov8n.onnx?confidence=high").unwrap();
    assert!(matches!(
      YoloBuilder::from_url(&url),
      Err(InferenceError::ModelPath(_))
    ));
  }

  #[test]
  fn missing_model_file_fails_to_load() {
    let dir = tempfile::tempdir().unwrap();
    let result = YoloBuilder::new(dir.path().join("absent.onnx")).build();
    assert!(matches!(result, Err(InferenceError::ModelLoad(_))));
  }
}
