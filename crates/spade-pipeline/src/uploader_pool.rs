// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Uploads rotated files to a [`BlobSink`] with a fixed pool of workers.
//!
//! Requests are pulled from one shared bounded queue by `N` upload workers.
//! Successful uploads go to a single notifier worker so notification latency
//! never holds up uploads. Closing rejects new requests, even from handles
//! that are still alive, and waits for queued and in-flight work to finish.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::blob_sink::{sha256_hex, BlobSink, ContentType, KeyNameGenerator};
use crate::errors::UploadError;
use crate::gzip::is_valid_gzip;
use crate::notifier::{ErrorNotifier, Notifier};

pub const UPLOAD_BUFFER_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub path: PathBuf,
    pub content_type: ContentType,
}

/// Proof of a verified upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// The local path the file was uploaded from. It is gone by now.
    pub path: PathBuf,
    /// `<bucket>/<key>`.
    pub key_name: String,
}

/// Linear backoff: wait `attempt * backoff_step` after each failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadRetry {
    pub attempts: usize,
    pub backoff_step: Duration,
}

impl Default for UploadRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_step: Duration::from_secs(2),
        }
    }
}

/// Uploads one file at a time.
#[derive(Clone)]
pub struct Uploader {
    bucket: String,
    key_names: Arc<dyn KeyNameGenerator>,
    sink: Arc<dyn BlobSink>,
    retry: UploadRetry,
}

impl Uploader {
    pub fn new(
        bucket: impl Into<String>,
        key_names: Arc<dyn KeyNameGenerator>,
        sink: Arc<dyn BlobSink>,
        retry: UploadRetry,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key_names,
            sink,
            retry,
        }
    }

    /// Uploads the file and removes it, whatever the outcome. A file that
    /// cannot be read is left in place.
    pub async fn upload(&self, request: &UploadRequest) -> Result<UploadReceipt, UploadError> {
        let body = tokio::fs::read(&request.path)
            .await
            .map(Bytes::from)
            .map_err(|source| UploadError::Open {
                path: request.path.clone(),
                source,
            })?;

        let result = self.upload_with_retries(request, body).await;
        if let Err(e) = tokio::fs::remove_file(&request.path).await {
            error!("Failed to remove {}: {}", request.path.display(), e);
        }
        result
    }

    async fn upload_with_retries(
        &self,
        request: &UploadRequest,
        body: Bytes,
    ) -> Result<UploadReceipt, UploadError> {
        let key = self.key_names.key_name(&request.path);
        let expected = sha256_hex(&body);
        let attempts = self.retry.attempts.max(1);

        let mut last_error = UploadError::Closed;
        for attempt in 1..=attempts {
            let result = self
                .sink
                .put_object(&self.bucket, &key, request.content_type, body.clone())
                .await
                .and_then(|actual| {
                    if actual == expected {
                        Ok(())
                    } else {
                        Err(UploadError::HashMismatch {
                            key: key.clone(),
                            expected: expected.clone(),
                            actual,
                        })
                    }
                });
            match result {
                Ok(()) => {
                    debug!("Uploaded {} as {}/{}", request.path.display(), self.bucket, key);
                    return Ok(UploadReceipt {
                        path: request.path.clone(),
                        key_name: format!("{}/{}", self.bucket, key),
                    });
                }
                Err(e) => {
                    warn!(attempt, "Failed to upload {}: {}", request.path.display(), e);
                    last_error = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry.backoff_step * attempt as u32).await;
            }
        }
        Err(last_error)
    }
}

/// Submits work to an [`UploaderPool`]. Fails with [`UploadError::Closed`]
/// once the pool is closing.
#[derive(Clone)]
pub struct UploadHandle {
    tx: mpsc::Sender<UploadRequest>,
    closed: CancellationToken,
}

impl UploadHandle {
    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::Sender<UploadRequest>) -> Self {
        Self {
            tx,
            closed: CancellationToken::new(),
        }
    }

    /// Queues `request`, waiting while the queue is full.
    pub async fn upload(&self, request: UploadRequest) -> Result<(), UploadError> {
        if self.closed.is_cancelled() {
            return Err(UploadError::Closed);
        }
        self.tx.send(request).await.map_err(|_| UploadError::Closed)
    }

    /// Queues `path` if it holds complete gzip data, otherwise removes it.
    /// Returns whether the file was queued.
    pub async fn upload_valid_gzip(&self, path: PathBuf) -> Result<bool, UploadError> {
        let check = path.clone();
        let valid = tokio::task::spawn_blocking(move || is_valid_gzip(&check))
            .await
            .unwrap_or(false);
        if valid {
            self.upload(UploadRequest {
                path,
                content_type: ContentType::Gzip,
            })
            .await?;
            return Ok(true);
        }

        warn!("Not a valid gzip file, removing {}", path.display());
        if let Err(e) = tokio::fs::remove_file(&path).await {
            error!("Failed to remove {}: {}", path.display(), e);
        }
        Ok(false)
    }

    /// Queues every `.gz` file directly inside `dir` whose name `accept`
    /// agrees to. Used at startup to pick up files a previous run staged but
    /// never uploaded.
    pub async fn upload_directory<F>(&self, dir: &Path, accept: F) -> Result<usize, UploadError>
    where
        F: Fn(&str) -> bool,
    {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(UploadError::Open {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        };

        let mut queued = 0;
        loop {
            let entry = entries.next_entry().await.map_err(|source| UploadError::Open {
                path: dir.to_path_buf(),
                source,
            })?;
            let Some(entry) = entry else { break };
            let path = entry.path();
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            let accepted = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(".gz") && accept(name));
            if is_file && accepted && self.upload_valid_gzip(path).await?
            {
                queued += 1;
            }
        }
        if queued > 0 {
            info!("Queued {} leftover files from {}", queued, dir.display());
        }
        Ok(queued)
    }
}

pub struct UploaderPool {
    handle: UploadHandle,
    closed: CancellationToken,
    workers: JoinSet<()>,
    notifier: JoinHandle<()>,
}

impl UploaderPool {
    /// Starts `workers` upload workers and the notifier worker. Must be
    /// called inside a tokio runtime.
    pub fn start(
        workers: usize,
        uploader: Uploader,
        notifier: Arc<dyn Notifier>,
        error_notifier: Arc<dyn ErrorNotifier>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<UploadRequest>(UPLOAD_BUFFER_SIZE);
        let (receipts_tx, mut receipts_rx) = mpsc::channel::<UploadReceipt>(UPLOAD_BUFFER_SIZE);
        let rx = Arc::new(Mutex::new(rx));
        let closed = CancellationToken::new();

        let mut set = JoinSet::new();
        for _ in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let receipts_tx = receipts_tx.clone();
            let uploader = uploader.clone();
            let error_notifier = Arc::clone(&error_notifier);
            let closed = closed.clone();
            set.spawn(async move {
                loop {
                    let next = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            biased;
                            next = rx.recv() => next,
                            _ = closed.cancelled() => {
                                // Buffered requests are still drained.
                                rx.close();
                                rx.recv().await
                            }
                        }
                    };
                    let Some(request) = next else { break };
                    match uploader.upload(&request).await {
                        Ok(receipt) => {
                            if receipts_tx.send(receipt).await.is_err() {
                                error!("Notifier worker is gone, dropping receipt");
                            }
                        }
                        Err(e) => error_notifier.send_error(&e).await,
                    }
                }
            });
        }
        drop(receipts_tx);

        let notifier = tokio::spawn(async move {
            while let Some(receipt) = receipts_rx.recv().await {
                if let Err(e) = notifier.notify(&receipt).await {
                    error_notifier.send_error(&e).await;
                }
            }
        });

        Self {
            handle: UploadHandle {
                tx,
                closed: closed.clone(),
            },
            closed,
            workers: set,
            notifier,
        }
    }

    pub fn handle(&self) -> UploadHandle {
        self.handle.clone()
    }

    /// Stops accepting uploads and waits until every queued upload and its
    /// notification is done. Handles that outlive the pool get
    /// [`UploadError::Closed`].
    pub async fn close(self) {
        let Self {
            handle,
            closed,
            mut workers,
            notifier,
        } = self;
        closed.cancel();
        drop(handle);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Upload worker failed: {}", e);
            }
        }
        if let Err(e) = notifier.await {
            error!("Notifier worker failed: {}", e);
        }
        debug!("Uploader pool closed");
    }
}
