// 该文件是 Huoyan （火眼） 项目的一部分。
// src/bin/annotate.rs - 离线标注，将检测结果逐帧写入目录
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
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::Duration,
};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use huoyan::{
  FromUrl,
  input::{DefaultOpener, SourceOpener, SourceSpec},
  model::DetectorBuilder,
  output::{DirectoryRecordOutput, Draw, StreamEncoder},
  task::{InferencePolicy, Pipeline},
};

/// Huoyan 离线标注参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测模型
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源，如 file:///data/clip.gif 或 camera://0
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出目录，如 folder:///data/records?record=id&always
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<u64>,

  #[arg(long, default_value = "95", value_name = "QUALITY")]
  pub jpeg_quality: u8,

  #[arg(long, default_value = "abort", value_name = "POLICY")]
  pub on_inference_error: InferencePolicy,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let detector = DetectorBuilder::from_url(&args.model)?.build()?;
  let spec = SourceSpec::from_url(&args.input)?;
  let output = DirectoryRecordOutput::from_url(&args.output)?;
  let source = DefaultOpener.open(&spec)?;

  let interrupted = Arc::new(AtomicBool::new(false));
  let flag = interrupted.clone();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    flag.store(true, Ordering::SeqCst);
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })?;

  let mut pipeline = Pipeline::new(
    source,
    Arc::from(detector),
    Arc::new(Draw::new()?),
    StreamEncoder::new(args.jpeg_quality),
  )
  .with_policy(args.on_inference_error)
  .with_frame_limit(args.frame_number);

  let mut recorded = 0u64;
  for frame in pipeline.by_ref() {
    let frame = frame?;
    if output.record(&frame)?.is_some() {
      recorded += 1;
    }
    if interrupted.load(Ordering::SeqCst) {
      warn!("中断信号接收，退出任务循环");
      break;
    }
  }

  let stats = pipeline.stats();
  info!(
    "任务完成: 处理 {} 帧, 保存 {} 帧到 {}",
    stats.frames_emitted,
    recorded,
    output.directory().display()
  );
  Ok(())
}
