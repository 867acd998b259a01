// 该文件是 Huoyan （火眼） 项目的一部分。
// src/args.rs - 服务参数配置
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use url::Url;

use huoyan::{input::SourceSpec, server::ServerConfig, task::InferencePolicy};

/// Huoyan 检测推流服务参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 监听地址
  #[arg(long, default_value = "0.0.0.0:8000", value_name = "ADDR")]
  pub bind: SocketAddr,

  /// 检测模型
  /// 支持格式:
  /// - yolo:///path/to/model.onnx?confidence=0.25&iou=0.45
  /// - none: 不做检测，原样推流
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// 上传视频的临时目录
  #[arg(long, default_value = "temp_videos", value_name = "DIR")]
  pub scratch_dir: PathBuf,

  /// 摄像头设备，纯数字 N 表示 /dev/videoN
  #[arg(long, default_value = "0", value_name = "DEVICE")]
  pub webcam: String,

  /// JPEG 质量 (1 - 100)
  #[arg(long, default_value = "95", value_name = "QUALITY")]
  pub jpeg_quality: u8,

  /// 单次上传大小上限（MiB）
  #[arg(long, default_value = "1024", value_name = "MB")]
  pub max_upload_mb: usize,

  /// 上传文件保留时长（秒），0 表示不清理
  #[arg(long, default_value = "86400", value_name = "SECONDS")]
  pub retention_secs: u64,

  /// 推理失败时的处理方式: abort 或 passthrough
  #[arg(long, default_value = "abort", value_name = "POLICY")]
  pub on_inference_error: InferencePolicy,

  /// 串行执行推理（用于不可重入的推理后端）
  #[arg(long)]
  pub serialize_inference: bool,

  /// 每个视频流最多处理的帧数
  #[arg(long, value_name = "COUNT")]
  pub frame_limit: Option<u64>,
}

impl Args {
  pub fn server_config(&self) -> ServerConfig {
    ServerConfig {
      bind: self.bind,
      scratch_dir: self.scratch_dir.clone(),
      webcam: SourceSpec::Device(self.webcam.clone()),
      jpeg_quality: self.jpeg_quality,
      max_upload_bytes: self.max_upload_mb.saturating_mul(1024 * 1024),
      retention: (self.retention_secs > 0).then(|| Duration::from_secs(self.retention_secs)),
      policy: self.on_inference_error,
      frame_limit: self.frame_limit,
    }
  }
}
