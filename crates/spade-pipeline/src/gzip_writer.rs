// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Writes one category's lines into a local gzip file and hands the file to
//! the upload pool on rotation.
//!
//! The file lives at `<folder>/<subfolder>/<name>.gz` and is owned by a single
//! blocking worker. Rotating (or closing) drains the worker, finishes the gzip
//! member, renames the file to `<folder>/upload/<name>.<inode>.gz` and queues
//! it for upload. A rotated writer rejects further writes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::compressor_pool::CompressorPool;
use crate::errors::WriterError;
use crate::gzip::GzipLineEncoder;
use crate::reporter::Reporter;
use crate::uploader_pool::UploadHandle;
use crate::write_request::{FailMode, WriteRequest, WriteResult};
use crate::writer::EventWriter;

const WRITE_QUEUE_LENGTH: usize = 64;
pub const UPLOAD_DIR: &str = "upload";

/// Thresholds checked on every rotation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotateConditions {
    /// Compressed bytes, on disk or buffered for writing.
    pub max_log_size: u64,
    pub max_time_allowed: Duration,
}

struct Active {
    tx: mpsc::Sender<Arc<WriteRequest>>,
    worker: JoinHandle<std::io::Result<std::fs::File>>,
}

pub struct GzipFileWriter {
    parent_folder: PathBuf,
    full_name: PathBuf,
    created_at: Instant,
    conditions: RotateConditions,
    uploader: UploadHandle,
    buffered: Arc<AtomicU64>,
    active: Mutex<Option<Active>>,
}

impl GzipFileWriter {
    /// Opens (or appends to) `<folder>/<subfolder>/<name>.gz` and starts the
    /// writer's worker.
    pub async fn new(
        folder: &Path,
        subfolder: &str,
        name: &str,
        reporter: Arc<dyn Reporter>,
        uploader: UploadHandle,
        pool: &CompressorPool,
        conditions: RotateConditions,
    ) -> Result<Self, WriterError> {
        let dir = folder.join(subfolder);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| WriterError::io("creating", &dir, e))?;
        let full_name = dir.join(format!("{name}.gz"));
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full_name)
            .await
            .map_err(|e| WriterError::io("opening", &full_name, e))?
            .into_std()
            .await;

        let (tx, rx) = mpsc::channel(WRITE_QUEUE_LENGTH);
        let encoder = GzipLineEncoder::new(file, pool.acquire());
        let buffered = Arc::new(AtomicU64::new(0));
        let pending = Arc::clone(&buffered);
        let worker =
            tokio::task::spawn_blocking(move || listen(rx, encoder, reporter, pending));

        debug!("Opened {}", full_name.display());
        Ok(Self {
            parent_folder: folder.to_path_buf(),
            full_name,
            created_at: Instant::now(),
            conditions,
            uploader,
            buffered,
            active: Mutex::new(Some(Active { tx, worker })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.full_name
    }

    async fn is_rotate_needed(&self) -> Result<bool, WriterError> {
        let on_disk = tokio::fs::metadata(&self.full_name)
            .await
            .map_err(|e| WriterError::io("inspecting", &self.full_name, e))?
            .len();
        let size = on_disk + self.buffered.load(Ordering::Relaxed);
        Ok(size > self.conditions.max_log_size
            || self.created_at.elapsed() > self.conditions.max_time_allowed)
    }

    /// Drains the worker, stages the finished file and queues it for upload.
    /// Returns `false` if the writer had already been rotated.
    async fn rotate_now(&self) -> Result<bool, WriterError> {
        let mut active = self.active.lock().await;
        let Some(Active { tx, worker }) = active.take() else {
            return Ok(false);
        };
        drop(tx);
        let file = worker
            .await?
            .map_err(|e| WriterError::io("finishing", &self.full_name, e))?;
        drop(file);

        let rotated = stage(&self.parent_folder, &self.full_name).await?;
        debug!("Rotated {} to {}", self.full_name.display(), rotated.display());

        if let Err(e) = self.uploader.upload_valid_gzip(rotated).await {
            error!("Failed to queue {} for upload: {}", self.full_name.display(), e);
        }
        Ok(true)
    }
}

#[async_trait]
impl EventWriter for GzipFileWriter {
    async fn write(&self, request: Arc<WriteRequest>) -> Result<(), WriterError> {
        let tx = {
            let active = self.active.lock().await;
            active.as_ref().map(|a| a.tx.clone()).ok_or(WriterError::Closed)?
        };
        tx.send(request).await.map_err(|_| WriterError::Closed)
    }

    async fn rotate(&self) -> Result<bool, WriterError> {
        if self.active.lock().await.is_none() {
            return Err(WriterError::Closed);
        }
        if !self.is_rotate_needed().await? {
            return Ok(false);
        }
        self.rotate_now().await
    }

    async fn close(&self) -> Result<(), WriterError> {
        self.rotate_now().await.map(|_| ())
    }
}

fn listen(
    mut rx: mpsc::Receiver<Arc<WriteRequest>>,
    mut encoder: GzipLineEncoder,
    reporter: Arc<dyn Reporter>,
    buffered: Arc<AtomicU64>,
) -> std::io::Result<std::fs::File> {
    while let Some(request) = rx.blocking_recv() {
        match encoder.write_line(request.line.as_bytes()) {
            Ok(()) => reporter.record(request.result()),
            Err(e) => {
                error!("Failed to write to gzip: {}", e);
                let mut result: WriteResult = request.result();
                result.failure = FailMode::FailedWrite;
                reporter.record(result);
            }
        }
        buffered.store(encoder.buffered() as u64, Ordering::Relaxed);
    }
    encoder.finish()
}

/// Moves a finished file to `<folder>/upload/<stem>.<inode>.gz`.
pub(crate) async fn stage(folder: &Path, path: &Path) -> Result<PathBuf, WriterError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| WriterError::io("inspecting", path, e))?;
    let staging = folder.join(UPLOAD_DIR);
    tokio::fs::create_dir_all(&staging)
        .await
        .map_err(|e| WriterError::io("creating", &staging, e))?;
    let staged = staging.join(staged_name(path, file_identity(&metadata)));
    tokio::fs::rename(path, &staged)
        .await
        .map_err(|e| WriterError::io("renaming", path, e))?;
    Ok(staged)
}

#[cfg(unix)]
fn file_identity(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn file_identity(_metadata: &std::fs::Metadata) -> u64 {
    now_nanos()
}

#[cfg(not(unix))]
fn now_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// `login.v2.gz` with identity 42 becomes `login.v2.42.gz`.
fn staged_name(path: &Path, identity: u64) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{stem}.{identity}.gz")
}
