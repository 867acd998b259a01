// 该文件是 Huoyan （火眼） 项目的一部分。
// src/server.rs - HTTP 接口
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

use std::{convert::Infallible, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use axum::{
  Json, Router,
  body::Body,
  extract::{DefaultBodyLimit, Multipart, Path, State},
  http::{StatusCode, header},
  response::{IntoResponse, Response},
  routing::{get, post},
};
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::{
  runtime::Handle,
  sync::{mpsc, oneshot},
};
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::{
  input::{DefaultOpener, InputError, SourceOpener, SourceSpec},
  model::Detector,
  output::{DEFAULT_JPEG_QUALITY, Draw, MULTIPART_CONTENT_TYPE, StreamEncoder},
  store::{StoreError, UploadStore},
  task::{InferencePolicy, Pipeline},
};

/// 上传表单中视频文件的字段名
pub const UPLOAD_FIELD: &str = "video";

const CACHE_CONTROL_NO_CACHE: &str = "no-cache, no-store, must-revalidate";

/// 服务配置
#[derive(Debug, Clone)]
pub struct ServerConfig {
  pub bind: SocketAddr,
  pub scratch_dir: PathBuf,
  pub webcam: SourceSpec,
  pub jpeg_quality: u8,
  pub max_upload_bytes: usize,
  /// `None` 表示不清理上传文件
  pub retention: Option<Duration>,
  pub policy: InferencePolicy,
  pub frame_limit: Option<u64>,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
      scratch_dir: PathBuf::from("temp_videos"),
      webcam: SourceSpec::Device("0".to_string()),
      jpeg_quality: DEFAULT_JPEG_QUALITY,
      max_upload_bytes: 1024 * 1024 * 1024,
      retention: Some(Duration::from_secs(24 * 60 * 60)),
      policy: InferencePolicy::Abort,
      frame_limit: None,
    }
  }
}

/// 各请求共享的状态，启动后只读
#[derive(Clone)]
pub struct AppState {
  pub store: Arc<UploadStore>,
  pub detector: Arc<dyn Detector>,
  pub draw: Arc<Draw>,
  pub opener: Arc<dyn SourceOpener>,
  pub encoder: StreamEncoder,
  pub webcam: SourceSpec,
  pub policy: InferencePolicy,
  pub frame_limit: Option<u64>,
  pub max_upload_bytes: usize,
}

impl AppState {
  pub fn new(
    config: &ServerConfig,
    store: Arc<UploadStore>,
    detector: Arc<dyn Detector>,
    draw: Arc<Draw>,
  ) -> Self {
    Self {
      store,
      detector,
      draw,
      opener: Arc::new(DefaultOpener),
      encoder: StreamEncoder::new(config.jpeg_quality),
      webcam: config.webcam.clone(),
      policy: config.policy,
      frame_limit: config.frame_limit,
      max_upload_bytes: config.max_upload_bytes,
    }
  }

  pub fn with_opener(mut self, opener: Arc<dyn SourceOpener>) -> Self {
    self.opener = opener;
    self
  }
}

#[derive(Error, Debug)]
pub enum ApiError {
  #[error("Video not found")]
  VideoNotFound,
  #[error("Failed to open video source: {0}")]
  SourceUnavailable(String),
  #[error("Missing multipart field `video`")]
  MissingVideo,
  #[error("Invalid upload: {0}")]
  BadUpload(String),
  #[error("Failed to save file: {0}")]
  SaveFailed(String),
  #[error("Internal error: {0}")]
  Internal(String),
}

impl ApiError {
  fn status(&self) -> StatusCode {
    match self {
      ApiError::VideoNotFound | ApiError::SourceUnavailable(_) => StatusCode::NOT_FOUND,
      ApiError::MissingVideo | ApiError::BadUpload(_) => StatusCode::BAD_REQUEST,
      ApiError::SaveFailed(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl From<StoreError> for ApiError {
  fn from(e: StoreError) -> Self {
    match e {
      StoreError::NotFound | StoreError::InvalidName(_) => ApiError::VideoNotFound,
      StoreError::Stream(reason) => ApiError::BadUpload(reason),
      StoreError::Storage(e) => ApiError::SaveFailed(e.to_string()),
    }
  }
}

impl From<InputError> for ApiError {
  fn from(e: InputError) -> Self {
    ApiError::SourceUnavailable(e.to_string())
  }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
  error: String,
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.status();
    if status.is_server_error() {
      error!("请求失败: {}", self);
    } else {
      debug!("请求被拒绝 ({}): {}", status, self);
    }
    (
      status,
      Json(ErrorResponse {
        error: self.to_string(),
      }),
    )
      .into_response()
  }
}

#[derive(Debug, Serialize)]
struct UploadResponse {
  filename: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
  status: &'static str,
  detector: String,
}

pub fn create_router(state: AppState) -> Router {
  let body_limit = state.max_upload_bytes;

  Router::new()
    .route("/upload_video", post(upload_video_handler))
    .route("/video_feed/{video_name}", get(video_feed_handler))
    .route("/webcam_feed", get(webcam_feed_handler))
    .route("/health", get(health_handler))
    .layer(DefaultBodyLimit::max(body_limit))
    .layer(CorsLayer::permissive())
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

/// 保存上传的视频，返回用于拉流的文件名
async fn upload_video_handler(
  State(state): State<AppState>,
  mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
  while let Some(field) = multipart
    .next_field()
    .await
    .map_err(|e| ApiError::BadUpload(e.to_string()))?
  {
    if field.name() != Some(UPLOAD_FIELD) {
      continue;
    }

    let original_name = field.file_name().unwrap_or_default().to_string();
    let stored = state.store.save(field, &original_name).await?;
    return Ok(Json(UploadResponse {
      filename: stored.filename,
    }));
  }

  Err(ApiError::MissingVideo)
}

async fn video_feed_handler(
  State(state): State<AppState>,
  Path(video_name): Path<String>,
) -> Result<Response, ApiError> {
  let path = state.store.resolve(&video_name).await?;
  info!("请求视频流: {}", video_name);
  stream_source(state, SourceSpec::File(path)).await
}

async fn webcam_feed_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
  let spec = state.webcam.clone();
  info!("请求摄像头流: {}", spec);
  stream_source(state, spec).await
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
  Json(HealthResponse {
    status: "ok",
    detector: state.detector.name().to_string(),
  })
}

/// 在阻塞线程上打开帧源并运行流水线，通过单槽通道输出分块
///
/// 帧源打开失败时返回错误，不产生任何分块。
async fn stream_source(state: AppState, spec: SourceSpec) -> Result<Response, ApiError> {
  let (ready_tx, ready_rx) = oneshot::channel();
  let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(1);
  let handle = Handle::current();

  tokio::task::spawn_blocking(move || run_stream(state, spec, ready_tx, chunk_tx, handle));

  ready_rx
    .await
    .map_err(|_| ApiError::Internal("stream worker exited before opening the source".to_string()))??;

  let body = Body::from_stream(ReceiverStream::new(chunk_rx).map(Ok::<_, Infallible>));
  Ok(
    (
      [
        (header::CONTENT_TYPE, MULTIPART_CONTENT_TYPE),
        (header::CACHE_CONTROL, CACHE_CONTROL_NO_CACHE),
      ],
      body,
    )
      .into_response(),
  )
}

fn run_stream(
  state: AppState,
  spec: SourceSpec,
  ready: oneshot::Sender<Result<(), InputError>>,
  chunks: mpsc::Sender<Bytes>,
  handle: Handle,
) {
  let source = match state.opener.open(&spec) {
    Ok(source) => source,
    Err(e) => {
      warn!("无法打开 {}: {}", spec, e);
      let _ = ready.send(Err(e));
      return;
    }
  };
  if ready.send(Ok(())).is_err() {
    return;
  }

  info!("开始推流: {} ({:?})", source.location(), source.source_type());
  let mut pipeline = Pipeline::new(source, state.detector, state.draw, state.encoder)
    .with_policy(state.policy)
    .with_frame_limit(state.frame_limit);

  loop {
    // 先占住唯一的槽位再取帧，客户端断开时不再读取
    let Ok(permit) = handle.block_on(chunks.reserve()) else {
      info!("客户端已断开: {}", spec);
      break;
    };

    match pipeline.next() {
      Some(Ok(frame)) => permit.send(frame.into_chunk()),
      Some(Err(e)) => {
        warn!("视频流中断 {}: {}", spec, e);
        break;
      }
      None => {
        info!("视频流结束: {}", spec);
        break;
      }
    }
  }
}
