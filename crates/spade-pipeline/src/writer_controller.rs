// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Owns the local rotating writers and routes each request to one of them.
//!
//! Tracked events land in `<folder>/events/<category>.v<version>.gz`, one
//! writer per category version, created on first use and dropped once it has
//! rotated. Untracked events share `<folder>/nontracked/nontracked.gz`, which
//! is replaced by a fresh writer every time it rotates. Requests that failed
//! for any other reason are only reported.
//!
//! Files left in either folder by a previous run are staged for upload before
//! any writer opens. Corrupt ones keep whatever complete lines survive.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::compressor_pool::CompressorPool;
use crate::errors::WriterError;
use crate::gzip::{is_valid_gzip, salvage_gzip};
use crate::gzip_writer::{stage, GzipFileWriter, RotateConditions};
use crate::reporter::Reporter;
use crate::uploader_pool::UploadHandle;
use crate::write_request::{FailMode, WriteRequest};
use crate::writer::EventWriter;

pub const EVENTS_DIR: &str = "events";
pub const NONTRACKED_DIR: &str = "nontracked";
const NONTRACKED_NAME: &str = "nontracked";

pub const DEFAULT_NONTRACKED_CONDITIONS: RotateConditions = RotateConditions {
    max_log_size: 1 << 29,
    max_time_allowed: Duration::from_secs(10 * 60),
};

/// Everything a controller needs to open writers.
pub struct ControllerConfig {
    pub folder: PathBuf,
    pub reporter: Arc<dyn Reporter>,
    pub events_uploader: UploadHandle,
    pub nontracked_uploader: UploadHandle,
    pub compressors: CompressorPool,
    pub conditions: RotateConditions,
    pub nontracked_conditions: RotateConditions,
}

struct Routes {
    events: HashMap<String, GzipFileWriter>,
    nontracked: Option<GzipFileWriter>,
}

pub struct WriterController {
    config: ControllerConfig,
    routes: Mutex<Routes>,
}

impl WriterController {
    pub async fn new(config: ControllerConfig) -> Result<Self, WriterError> {
        recover_leftovers(&config.folder, EVENTS_DIR, &config.events_uploader).await?;
        recover_leftovers(&config.folder, NONTRACKED_DIR, &config.nontracked_uploader).await?;
        let nontracked = open_nontracked(&config).await?;
        Ok(Self {
            config,
            routes: Mutex::new(Routes {
                events: HashMap::new(),
                nontracked: Some(nontracked),
            }),
        })
    }

    pub fn folder(&self) -> &Path {
        &self.config.folder
    }

    /// Category writers currently open.
    pub async fn open_routes(&self) -> usize {
        self.routes.lock().await.events.len()
    }

    fn report_failed_write(&self, request: &WriteRequest) {
        let mut result = request.result();
        result.failure = FailMode::FailedWrite;
        self.config.reporter.record(result);
    }

    async fn write_tracked(
        &self,
        routes: &mut Routes,
        request: Arc<WriteRequest>,
    ) -> Result<(), WriterError> {
        let name = request.category_version();
        if !routes.events.contains_key(&name) {
            let writer = GzipFileWriter::new(
                &self.config.folder,
                EVENTS_DIR,
                &name,
                self.config.reporter.clone(),
                self.config.events_uploader.clone(),
                &self.config.compressors,
                self.config.conditions,
            )
            .await?;
            routes.events.insert(name.clone(), writer);
        }
        match routes.events.get(&name) {
            Some(writer) => writer.write(request).await,
            None => Err(WriterError::Closed),
        }
    }

    async fn write_nontracked(
        &self,
        routes: &mut Routes,
        request: Arc<WriteRequest>,
    ) -> Result<(), WriterError> {
        if routes.nontracked.is_none() {
            routes.nontracked = Some(open_nontracked(&self.config).await?);
        }
        match &routes.nontracked {
            Some(writer) => writer.write(request).await,
            None => Err(WriterError::Closed),
        }
    }
}

/// Stages and queues every `.gz` file directly inside `<folder>/<subfolder>`.
/// Returns how many files were queued.
async fn recover_leftovers(
    folder: &Path,
    subfolder: &str,
    uploader: &UploadHandle,
) -> Result<usize, WriterError> {
    let dir = folder.join(subfolder);
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(WriterError::io("listing", &dir, e)),
    };

    let mut queued = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| WriterError::io("listing", &dir, e))?
    {
        let path = entry.path();
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if !is_file || path.extension().and_then(|ext| ext.to_str()) != Some("gz") {
            continue;
        }

        if !salvage_if_corrupt(path.clone()).await {
            warn!("Nothing to recover, removing {}", path.display());
            if let Err(e) = tokio::fs::remove_file(&path).await {
                error!("Failed to remove {}: {}", path.display(), e);
            }
            continue;
        }
        let staged = stage(folder, &path).await?;
        match uploader.upload_valid_gzip(staged).await {
            Ok(true) => queued += 1,
            Ok(false) => {}
            Err(e) => error!("Failed to queue {} for upload: {}", path.display(), e),
        }
    }
    if queued > 0 {
        info!("Queued {} leftover files from {}", queued, dir.display());
    }
    Ok(queued)
}

/// Whether `path` holds valid gzip data, salvaging it in place if needed.
async fn salvage_if_corrupt(path: PathBuf) -> bool {
    let check = path.clone();
    let salvaged = tokio::task::spawn_blocking(move || {
        if is_valid_gzip(&check) {
            return None;
        }
        Some(salvage_gzip(&check))
    })
    .await;
    match salvaged {
        Ok(None) => true,
        Ok(Some(Ok(true))) => {
            warn!("Salvaged complete lines from corrupt {}", path.display());
            true
        }
        Ok(Some(Ok(false))) => false,
        Ok(Some(Err(e))) => {
            error!("Failed to salvage {}: {}", path.display(), e);
            false
        }
        Err(e) => {
            error!("Failed to salvage {}: {}", path.display(), e);
            false
        }
    }
}

async fn open_nontracked(config: &ControllerConfig) -> Result<GzipFileWriter, WriterError> {
    GzipFileWriter::new(
        &config.folder,
        NONTRACKED_DIR,
        NONTRACKED_NAME,
        config.reporter.clone(),
        config.nontracked_uploader.clone(),
        &config.compressors,
        config.nontracked_conditions,
    )
    .await
}

#[async_trait]
impl EventWriter for WriterController {
    async fn write(&self, request: Arc<WriteRequest>) -> Result<(), WriterError> {
        let mut routes = self.routes.lock().await;
        let result = match request.failure {
            FailMode::None | FailMode::SkippedColumn => {
                self.write_tracked(&mut routes, request.clone()).await
            }
            FailMode::NonTrackingEvent => {
                self.write_nontracked(&mut routes, request.clone()).await
            }
            _ => {
                self.config.reporter.record(request.result());
                return Ok(());
            }
        };
        if let Err(e) = &result {
            error!(category = %request.category, "Failed to route request: {}", e);
            self.report_failed_write(&request);
        }
        result
    }

    /// Rotates every writer that is due. The first error is returned after
    /// the whole pass; a writer that failed to rotate is dropped either way.
    async fn rotate(&self) -> Result<bool, WriterError> {
        let mut routes = self.routes.lock().await;
        let mut first_error = None;

        let mut rotated_routes = Vec::new();
        for (name, writer) in routes.events.iter() {
            match writer.rotate().await {
                Ok(true) => rotated_routes.push(name.clone()),
                Ok(false) => {}
                Err(e) => {
                    error!(route = %name, "Failed to rotate: {}", e);
                    rotated_routes.push(name.clone());
                    first_error.get_or_insert(e);
                }
            }
        }
        for name in rotated_routes {
            routes.events.remove(&name);
        }

        let nontracked_rotated = match &routes.nontracked {
            Some(writer) => match writer.rotate().await {
                Ok(rotated) => rotated,
                Err(e) => {
                    error!("Failed to rotate non-tracked writer: {}", e);
                    first_error.get_or_insert(e);
                    true
                }
            },
            None => true,
        };
        if nontracked_rotated {
            routes.nontracked = None;
            match open_nontracked(&self.config).await {
                Ok(writer) => routes.nontracked = Some(writer),
                Err(e) => {
                    error!("Failed to reopen non-tracked writer: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        debug!(
            open_routes = routes.events.len(),
            nontracked_rotated, "Rotation pass finished"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(nontracked_rotated && routes.events.is_empty()),
        }
    }

    async fn close(&self) -> Result<(), WriterError> {
        let mut routes = self.routes.lock().await;
        let mut first_error = None;
        for (name, writer) in routes.events.drain() {
            if let Err(e) = writer.close().await {
                error!(route = %name, "Failed to close: {}", e);
                first_error.get_or_insert(e);
            }
        }
        if let Some(writer) = routes.nontracked.take() {
            if let Err(e) = writer.close().await {
                error!("Failed to close non-tracked writer: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
