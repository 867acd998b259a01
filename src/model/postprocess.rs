// 该文件是 Huoyan （火眼） 项目的一部分。
// src/model/postprocess.rs - YOLO 输出后处理
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

use tracing::debug;

use super::InferenceError;

/// 候选框，坐标位于模型输入空间 [x1, y1, x2, y2]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
  pub bbox: [f32; 4],
  pub class_id: usize,
  pub score: f32,
}

/// 检测头输出布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadLayout {
  /// YOLOv8 `[1, 4 + C, N]`
  ChannelsFirst { classes: usize, anchors: usize },
  /// YOLOv8 转置导出 `[1, N, 4 + C]`
  ChannelsLast { classes: usize, anchors: usize },
  /// YOLOv5 `[1, N, 5 + C]`，第 5 通道为目标置信度
  Objectness { classes: usize, anchors: usize },
}

impl HeadLayout {
  pub fn detect(shape: &[usize], num_labels: usize) -> Result<Self, InferenceError> {
    let (a, b) = match shape {
      [1, a, b] | [a, b] => (*a, *b),
      _ => return Err(InferenceError::UnexpectedOutput(shape.to_vec())),
    };

    if num_labels > 0 {
      if a == 4 + num_labels {
        return Ok(HeadLayout::ChannelsFirst {
          classes: num_labels,
          anchors: b,
        });
      }
      if b == 4 + num_labels {
        return Ok(HeadLayout::ChannelsLast {
          classes: num_labels,
          anchors: a,
        });
      }
      if b == 5 + num_labels {
        return Ok(HeadLayout::Objectness {
          classes: num_labels,
          anchors: a,
        });
      }
    }

    // 标签数与模型不符时，较短的一维视为通道维
    debug!("无法按标签数 {} 匹配输出形状 {:?}", num_labels, shape);
    if a > 4 && a < b {
      Ok(HeadLayout::ChannelsFirst {
        classes: a - 4,
        anchors: b,
      })
    } else if b > 4 && b < a {
      Ok(HeadLayout::ChannelsLast {
        classes: b - 4,
        anchors: a,
      })
    } else {
      Err(InferenceError::UnexpectedOutput(shape.to_vec()))
    }
  }

  fn len(&self) -> usize {
    match *self {
      HeadLayout::ChannelsFirst { classes, anchors }
      | HeadLayout::ChannelsLast { classes, anchors } => (4 + classes) * anchors,
      HeadLayout::Objectness { classes, anchors } => (5 + classes) * anchors,
    }
  }
}

fn best_class(scores: impl Iterator<Item = f32>) -> Option<(usize, f32)> {
  scores
    .enumerate()
    .max_by(|(_, a), (_, b)| a.total_cmp(b))
}

fn xywh_to_xyxy(cx: f32, cy: f32, w: f32, h: f32) -> [f32; 4] {
  [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
}

/// 将原始输出张量解码为候选框，过滤低于阈值的结果
pub fn decode_predictions(
  data: &[f32],
  shape: &[usize],
  num_labels: usize,
  confidence: f32,
) -> Result<Vec<Candidate>, InferenceError> {
  let layout = HeadLayout::detect(shape, num_labels)?;
  if data.len() < layout.len() {
    return Err(InferenceError::UnexpectedOutput(shape.to_vec()));
  }

  let mut candidates = Vec::new();
  match layout {
    HeadLayout::ChannelsFirst { classes, anchors } => {
      let at = |channel: usize, anchor: usize| data[channel * anchors + anchor];
      for anchor in 0..anchors {
        let Some((class_id, score)) = best_class((4..4 + classes).map(|c| at(c, anchor))) else {
          continue;
        };
        if score < confidence {
          continue;
        }
        candidates.push(Candidate {
          bbox: xywh_to_xyxy(
            at(0, anchor),
            at(1, anchor),
            at(2, anchor),
            at(3, anchor),
          ),
          class_id,
          score,
        });
      }
    }
    HeadLayout::ChannelsLast { classes, .. } => {
      for row in data[..layout.len()].chunks_exact(4 + classes) {
        let Some((class_id, score)) = best_class(row[4..].iter().copied()) else {
          continue;
        };
        if score < confidence {
          continue;
        }
        candidates.push(Candidate {
          bbox: xywh_to_xyxy(row[0], row[1], row[2], row[3]),
          class_id,
          score,
        });
      }
    }
    HeadLayout::Objectness { classes, .. } => {
      for row in data[..layout.len()].chunks_exact(5 + classes) {
        let objectness = row[4];
        if objectness < confidence {
          continue;
        }
        let Some((class_id, class_score)) = best_class(row[5..].iter().copied()) else {
          continue;
        };
        let score = objectness * class_score;
        if score < confidence {
          continue;
        }
        candidates.push(Candidate {
          bbox: xywh_to_xyxy(row[0], row[1], row[2], row[3]),
          class_id,
          score,
        });
      }
    }
  }

  Ok(candidates)
}

/// 按类别进行非极大值抑制，结果按置信度降序
pub fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
  candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut kept: Vec<Candidate> = Vec::new();
  for candidate in candidates {
    let suppressed = kept
      .iter()
      .any(|k| k.class_id == candidate.class_id && iou(&k.bbox, &candidate.bbox) >= iou_threshold);
    if !suppressed {
      kept.push(candidate);
    }
  }
  kept
}

/// 计算两个 [x1, y1, x2, y2] 边界框的 IoU
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn channels_first_head_is_decoded() {
    // 2 个类别，3 个锚点，按通道存放
    let data = [
      10.0, 50.0, 90.0, // cx
      10.0, 50.0, 90.0, // cy
      4.0, 20.0, 10.0, // w
      4.0, 10.0, 10.0, // h
      0.9, 0.1, 0.05, // class 0
      0.05, 0.8, 0.1, // class 1
    ];
    let candidates = decode_predictions(&data, &[1, 6, 3], 2, 0.25).unwrap();
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].class_id, 0);
    assert_eq!(candidates[0].bbox, [8.0, 8.0, 12.0, 12.0]);
    assert_eq!(candidates[1].class_id, 1);
    assert_eq!(candidates[1].bbox, [40.0, 45.0, 60.0, 55.0]);
  }

  #[test]
  fn channels_last_head_is_decoded() {
    let data = [
      20.0, 20.0, 10.0, 10.0, 0.1, 0.7, //
      60.0, 60.0, 10.0, 10.0, 0.2, 0.1,
    ];
    let candidates = decode_predictions(&data, &[1, 2, 6], 2, 0.5).unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].class_id, 1);
    assert!((candidates[0].score - 0.7).abs() < 1e-6);
  }

  #[test]
  fn objectness_head_multiplies_scores() {
    let data = [
      20.0, 20.0, 10.0, 10.0, 0.8, 0.5, 0.9, //
      60.0, 60.0, 10.0, 10.0, 0.2, 0.9, 0.9,
    ];
    let candidates = decode_predictions(&data, &[1, 2, 7], 2, 0.3).unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].class_id, 1);
    assert!((candidates[0].score - 0.72).abs() < 1e-6);
  }

  #[test]
  fn layout_falls_back_when_labels_do_not_match() {
    let layout = HeadLayout::detect(&[1, 6, 8400], 80).unwrap();
    assert_eq!(
      layout,
      HeadLayout::ChannelsFirst {
        classes: 2,
        anchors: 8400
      }
    );
    assert!(HeadLayout::detect(&[1, 2, 3, 4], 80).is_err());
  }

  #[test]
  fn truncated_output_is_rejected() {
    let data = [0.0f32; 10];
    assert!(matches!(
      decode_predictions(&data, &[1, 6, 3], 2, 0.25),
      Err(InferenceError::UnexpectedOutput(_))
    ));
  }

  #[test]
  fn nms_suppresses_same_class_overlap_only() {
    let candidates = vec![
      Candidate {
        bbox: [0.0, 0.0, 10.0, 10.0],
        class_id: 0,
        score: 0.6,
      },
      Candidate {
        bbox: [1.0, 1.0, 11.0, 11.0],
        class_id: 0,
        score: 0.9,
      },
      Candidate {
        bbox: [1.0, 1.0, 11.0, 11.0],
        class_id: 3,
        score: 0.5,
      },
    ];
    let kept = nms(candidates, 0.45);
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[0].score, 0.9);
    assert_eq!(kept[1].class_id, 3);
  }

  #[test]
  fn iou_of_disjoint_and_identical_boxes() {
    let a = [0.0, 0.0, 10.0, 10.0];
    let b = [20.0, 20.0, 30.0, 30.0];
    assert_eq!(iou(&a, &b), 0.0);
    assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
  }
}
