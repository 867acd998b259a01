// 该文件是 Huoyan （火眼） 项目的一部分。
// src/main.rs - 检测推流服务主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

mod args;

use std::{sync::Arc, thread, time::Duration};

use anyhow::Result;
use clap::Parser;
use tokio::{net::TcpListener, sync::watch};
use tracing::{info, warn};

use huoyan::{
  FromUrl,
  model::{Detector, DetectorBuilder, SerializedDetector},
  output::Draw,
  server::{AppState, create_router},
  store::{UploadStore, spawn_retention_sweeper},
};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();
  let config = args.server_config();

  info!("Huoyan 检测推流服务");
  info!("模型: {}", args.model);
  info!("上传目录: {}", config.scratch_dir.display());
  info!("摄像头: {}", config.webcam);
  info!("推理失败策略: {}", config.policy);

  let detector = DetectorBuilder::from_url(&args.model)?.build()?;
  let detector: Arc<dyn Detector> = if args.serialize_inference {
    Arc::new(SerializedDetector::new(detector))
  } else {
    Arc::from(detector)
  };
  let draw = Arc::new(Draw::new()?);

  let store = Arc::new(UploadStore::open(config.scratch_dir.clone()).await?);
  if let Some(retention) = config.retention {
    spawn_retention_sweeper(store.clone(), retention);
  }

  let router = create_router(AppState::new(&config, store, detector, draw));
  let listener = TcpListener::bind(config.bind).await?;
  info!("服务监听于 http://{}", listener.local_addr()?);

  let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = shutdown_tx.send(true);
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })?;

  axum::serve(listener, router)
    .with_graceful_shutdown(async move {
      let _ = shutdown_rx.wait_for(|stop| *stop).await;
    })
    .await?;

  info!("服务已退出");
  Ok(())
}
