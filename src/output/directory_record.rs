// 该文件是 Huoyan （火眼） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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

use std::path::{Path, PathBuf};

use chrono::{Datelike, Utc};
use thiserror::Error;
use tracing::debug;

use crate::{FromUrl, FromUrlWithScheme, model::Detection, task::EncodedFrame};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 将标注后的帧按日期目录保存为 JPEG，并附带同名的检测记录文本
///
/// URL 形如 `folder:///data/records?record=id&always`。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  label_with_name: bool,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch(
        uri.scheme().to_string(),
      ));
    }

    let label_with_name = !uri.query_pairs().any(|(k, v)| k == "record" && v == "id");
    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(crate::decode_url_path(uri)),
      label_with_name,
      always,
    })
  }
}

impl DirectoryRecordOutput {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
      label_with_name: true,
      always: true,
    }
  }

  pub fn always(mut self, always: bool) -> Self {
    self.always = always;
    self
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  fn frame_path(&self, index: u64) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!("{}-{:06}.jpg", now.format("%H-%M-%S"), index)))
  }

  /// 保存一帧，没有检测结果且未设置 `always` 时跳过
  pub fn record(&self, frame: &EncodedFrame) -> Result<Option<PathBuf>, DirectoryRecordOutputError> {
    if !self.always && frame.detections.is_empty() {
      return Ok(None);
    }

    let path = self.frame_path(frame.index)?;
    std::fs::write(&path, &frame.jpeg)?;
    std::fs::write(
      path.with_extension("txt"),
      format_records(&frame.detections, self.label_with_name),
    )?;
    debug!("保存第 {} 帧到: {}", frame.index, path.display());
    Ok(Some(path))
  }
}

/// 每行一个检测：`名称, 置信度, x1, y1, x2, y2`
pub fn format_records(detections: &[Detection], label_with_name: bool) -> String {
  detections
    .iter()
    .map(|item| {
      let name = if label_with_name {
        item.label.clone()
      } else {
        item.class_id.to_string()
      };
      format!(
        "{}, {:.4}, {}, {}, {}, {}",
        name, item.confidence, item.bbox[0], item.bbox[1], item.bbox[2], item.bbox[3]
      )
    })
    .collect::<Vec<String>>()
    .join("\n")
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;

  fn encoded(detections: Vec<Detection>) -> EncodedFrame {
    EncodedFrame {
      index: 7,
      timestamp_ms: 280,
      width: 4,
      height: 4,
      detections,
      jpeg: Bytes::from_static(b"\xFF\xD8jpeg"),
    }
  }

  fn fire() -> Detection {
    Detection {
      bbox: [1, 2, 30, 40],
      class_id: 0,
      label: "fire".to_string(),
      confidence: 0.5,
    }
  }

  #[test]
  fn records_use_names_or_ids() {
    assert_eq!(format_records(&[fire()], true), "fire, 0.5000, 1, 2, 30, 40");
    assert_eq!(format_records(&[fire()], false), "0, 0.5000, 1, 2, 30, 40");
  }

  #[test]
  fn record_writes_image_and_text() {
    let dir = tempfile::tempdir().unwrap();
    let output = DirectoryRecordOutput::new(dir.path());
    let path = output.record(&encoded(vec![fire()])).unwrap().unwrap();

    assert!(path.starts_with(dir.path()));
    assert!(path.to_string_lossy().ends_with("-000007.jpg"));
    assert_eq!(std::fs::read(&path).unwrap(), b"\xFF\xD8jpeg");
    let records = std::fs::read_to_string(path.with_extension("txt")).unwrap();
    assert!(records.starts_with("fire, 0.5000"));
  }

  #[test]
  fn frames_without_detections_are_skipped_unless_always() {
    let dir = tempfile::tempdir().unwrap();
    let output = DirectoryRecordOutput::new(dir.path()).always(false);
    assert!(output.record(&encoded(Vec::new())).unwrap().is_none());
  }

  #[test]
  fn from_url_reads_options() {
    let url = url::Url::parse("folder:///data/records?record=id").unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    assert_eq!(output.directory(), Path::new("/data/records"));
    assert!(!output.label_with_name);
    assert!(!output.always);

    let url = url::Url::parse("image:///tmp/out.png").unwrap();
    assert!(DirectoryRecordOutput::from_url(&url).is_err());
  }
}
