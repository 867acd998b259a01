// 该文件是 Huoyan （火眼） 项目的一部分。
// src/store.rs - 上传视频的临时存储
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
  convert::Infallible,
  fmt::Display,
  path::{Path, PathBuf},
  pin::pin,
  sync::Arc,
  time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt, task::JoinHandle, time::MissedTickBehavior};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_NAME_CHARS: usize = 200;
const FALLBACK_NAME: &str = "upload";
const SWEEP_PERIOD_MAX: Duration = Duration::from_secs(600);

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("存储错误: {0}")]
  Storage(#[from] std::io::Error),
  #[error("读取上传内容失败: {0}")]
  Stream(String),
  #[error("文件不存在")]
  NotFound,
  #[error("非法的文件名: {0}")]
  InvalidName(String),
}

/// 一次上传的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredVideo {
  /// 对外的句柄，形如 `{uuid}_{原文件名}`
  pub filename: String,
  pub original_name: String,
  pub path: PathBuf,
  pub size: u64,
}

/// 扁平的临时目录，保存上传的视频
///
/// 写入先落到隐藏的 `.{uuid}.part` 文件，同步后再重命名，
/// 最终文件名下不会出现不完整的内容。
#[derive(Debug)]
pub struct UploadStore {
  root: PathBuf,
}

impl UploadStore {
  pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
    let root = root.into();
    fs::create_dir_all(&root).await?;
    info!("上传目录: {}", root.display());
    Ok(Self { root })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub async fn save<S, E>(&self, stream: S, original_name: &str) -> Result<StoredVideo, StoreError>
  where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
  {
    let id = Uuid::new_v4();
    let filename = format!("{}_{}", id, sanitize_file_name(original_name));
    let part = self.root.join(format!(".{}.part", id));
    let path = self.root.join(&filename);

    let size = match write_part(&part, stream).await {
      Ok(size) => size,
      Err(e) => {
        discard(&part).await;
        return Err(e);
      }
    };

    if let Err(e) = fs::rename(&part, &path).await {
      discard(&part).await;
      return Err(e.into());
    }

    info!("保存上传文件 {} ({} 字节)", filename, size);
    Ok(StoredVideo {
      filename,
      original_name: original_name.to_string(),
      path,
      size,
    })
  }

  pub async fn save_bytes(&self, data: Bytes, original_name: &str) -> Result<StoredVideo, StoreError> {
    self
      .save(tokio_stream::once(Ok::<_, Infallible>(data)), original_name)
      .await
  }

  /// 将句柄解析为目录中已存在的普通文件
  pub async fn resolve(&self, name: &str) -> Result<PathBuf, StoreError> {
    if !is_valid_handle(name) {
      return Err(StoreError::InvalidName(name.to_string()));
    }

    let path = self.root.join(name);
    match fs::metadata(&path).await {
      Ok(meta) if meta.is_file() => Ok(path),
      Ok(_) => Err(StoreError::NotFound),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
      Err(e) => Err(e.into()),
    }
  }

  /// 删除修改时间早于 `max_age` 的文件，返回删除数量
  pub async fn purge_expired(&self, max_age: Duration) -> Result<usize, StoreError> {
    let Some(cutoff) = TimeDelta::from_std(max_age)
      .ok()
      .and_then(|age| Utc::now().checked_sub_signed(age))
    else {
      return Ok(0);
    };

    let mut removed = 0;
    let mut entries = fs::read_dir(&self.root).await?;
    while let Some(entry) = entries.next_entry().await? {
      let meta = match entry.metadata().await {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => continue,
        Err(e) => {
          warn!("无法读取 {} 的元数据: {}", entry.path().display(), e);
          continue;
        }
      };
      let modified: DateTime<Utc> = meta.modified()?.into();
      if modified > cutoff {
        continue;
      }

      match fs::remove_file(entry.path()).await {
        Ok(()) => {
          debug!("删除过期文件: {}", entry.path().display());
          removed += 1;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除 {} 失败: {}", entry.path().display(), e),
      }
    }
    Ok(removed)
  }
}

async fn write_part<S, E>(path: &Path, stream: S) -> Result<u64, StoreError>
where
  S: Stream<Item = Result<Bytes, E>>,
  E: Display,
{
  let mut file = fs::File::create(path).await?;
  let mut stream = pin!(stream);
  let mut written = 0u64;
  while let Some(chunk) = stream.next().await {
    let chunk = chunk.map_err(|e| StoreError::Stream(e.to_string()))?;
    file.write_all(&chunk).await?;
    written += chunk.len() as u64;
  }
  file.flush().await?;
  file.sync_all().await?;
  Ok(written)
}

async fn discard(part: &Path) {
  if let Err(e) = fs::remove_file(part).await
    && e.kind() != std::io::ErrorKind::NotFound
  {
    warn!("无法删除临时文件 {}: {}", part.display(), e);
  }
}

/// 只保留客户端文件名的最后一段，去掉控制字符与开头的点
pub fn sanitize_file_name(name: &str) -> String {
  let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
  let cleaned: String = last
    .chars()
    .filter(|c| !c.is_control())
    .collect::<String>()
    .trim()
    .trim_start_matches('.')
    .chars()
    .take(MAX_NAME_CHARS)
    .collect();

  if cleaned.is_empty() {
    FALLBACK_NAME.to_string()
  } else {
    cleaned
  }
}

/// 句柄必须是目录下的单个文件名；不含分隔符时，开头的点已排除 `.` 与 `..`
fn is_valid_handle(name: &str) -> bool {
  !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\', '\0'])
}

/// 周期性清理过期上传，周期为 `min(retention, 10 分钟)`
pub fn spawn_retention_sweeper(store: Arc<UploadStore>, retention: Duration) -> JoinHandle<()> {
  let period = retention.min(SWEEP_PERIOD_MAX).max(Duration::from_secs(1));
  info!("上传文件保留 {:?}，每 {:?} 清理一次", retention, period);

  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      match store.purge_expired(retention).await {
        Ok(0) => {}
        Ok(count) => info!("清理了 {} 个过期上传文件", count),
        Err(e) => warn!("清理上传目录失败: {}", e),
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn store() -> (tempfile::TempDir, UploadStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = UploadStore::open(dir.path().join("scratch")).await.unwrap();
    (dir, store)
  }

  fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
      .unwrap()
      .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
      .collect();
    names.sort();
    names
  }

  #[tokio::test]
  async fn save_then_resolve_returns_same_content() {
    let (_dir, store) = store().await;
    let saved = store
      .save_bytes(Bytes::from_static(b"GIF89a..."), "clip.gif")
      .await
      .unwrap();

    assert!(saved.filename.ends_with("_clip.gif"));
    assert_eq!(saved.size, 9);
    let path = store.resolve(&saved.filename).await.unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"GIF89a...");
  }

  #[tokio::test]
  async fn chunks_are_concatenated() {
    let (_dir, store) = store().await;
    let chunks = vec![
      Ok::<_, std::io::Error>(Bytes::from_static(b"ab")),
      Ok(Bytes::from_static(b"cd")),
      Ok(Bytes::from_static(b"ef")),
    ];
    let saved = store
      .save(tokio_stream::iter(chunks), "video.mp4")
      .await
      .unwrap();
    assert_eq!(std::fs::read(&saved.path).unwrap(), b"abcdef");
    assert_eq!(file_names(store.root()), vec![saved.filename]);
  }

  #[tokio::test]
  async fn failed_stream_leaves_no_file_behind() {
    let (_dir, store) = store().await;
    let chunks = vec![
      Ok(Bytes::from_static(b"partial")),
      Err(std::io::Error::other("connection reset")),
    ];
    let err = store
      .save(tokio_stream::iter(chunks), "video.mp4")
      .await
      .unwrap_err();
    assert!(matches!(err, StoreError::Stream(_)));
    assert!(file_names(store.root()).is_empty());
  }

  #[tokio::test]
  async fn identical_names_get_distinct_handles() {
    let (_dir, store) = store().await;
    let a = store.save_bytes(Bytes::from_static(b"a"), "same.mp4").await.unwrap();
    let b = store.save_bytes(Bytes::from_static(b"b"), "same.mp4").await.unwrap();
    assert_ne!(a.filename, b.filename);
    assert_eq!(std::fs::read(store.resolve(&a.filename).await.unwrap()).unwrap(), b"a");
    assert_eq!(std::fs::read(store.resolve(&b.filename).await.unwrap()).unwrap(), b"b");
  }

  #[tokio::test]
  async fn resolve_rejects_traversal_and_missing() {
    let (_dir, store) = store().await;
    for name in ["", "../etc/passwd", "a/b", "..", ".hidden.part", "a\\b"] {
      assert!(
        matches!(store.resolve(name).await, Err(StoreError::InvalidName(_))),
        "{name:?}"
      );
    }
    assert!(matches!(
      store.resolve("nothing_here.mp4").await,
      Err(StoreError::NotFound)
    ));
  }

  #[tokio::test]
  async fn purge_removes_only_expired_files() {
    let (_dir, store) = store().await;
    store.save_bytes(Bytes::from_static(b"x"), "a.mp4").await.unwrap();
    store.save_bytes(Bytes::from_static(b"y"), "b.mp4").await.unwrap();

    assert_eq!(store.purge_expired(Duration::from_secs(3600)).await.unwrap(), 0);
    assert_eq!(file_names(store.root()).len(), 2);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.purge_expired(Duration::ZERO).await.unwrap(), 2);
    assert!(file_names(store.root()).is_empty());
  }

  #[tokio::test]
  async fn inner_double_dots_round_trip() {
    let (_dir, store) = store().await;
    for name in ["fire..clip.gif", "x\" ! fakesink name=\"y.mp4"] {
      let saved = store.save_bytes(Bytes::from_static(b"GIF89a"), name).await.unwrap();
      assert!(saved.filename.ends_with(name), "{name:?}");
      let path = store.resolve(&saved.filename).await.unwrap();
      assert_eq!(path, saved.path);
    }
  }

  #[test]
  fn sanitize_keeps_last_component() {
    assert_eq!(sanitize_file_name("clip.gif"), "clip.gif");
    assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
    assert_eq!(sanitize_file_name("C:\\Users\\me\\cam.mp4"), "cam.mp4");
    assert_eq!(sanitize_file_name(".hidden"), "hidden");
    assert_eq!(sanitize_file_name("bad\nname.mp4"), "badname.mp4");
    assert_eq!(sanitize_file_name(""), "upload");
    assert_eq!(sanitize_file_name("dir/"), "upload");
    assert_eq!(sanitize_file_name(&"v".repeat(500)).len(), MAX_NAME_CHARS);
  }
}
