// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use spade_pipeline::config::StreamWriterConfig;
use spade_pipeline::gzip_writer::RotateConditions;
use spade_pipeline::writer_controller::DEFAULT_NONTRACKED_CONDITIONS;

const DEFAULT_MAX_LOG_BYTES: u64 = 1 << 30;
const DEFAULT_MAX_LOG_AGE: Duration = Duration::from_secs(10 * 60);
const DEFAULT_ROTATE_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_UPLOAD_WORKERS: usize = 5;
const DEFAULT_COMPRESSORS: usize = 16;
const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Where stream records go when a stream writer is configured.
#[derive(Debug)]
pub struct StreamSettings {
    pub writer: StreamWriterConfig,
    pub endpoint: String,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct Config {
    pub folder: PathBuf,
    pub conditions: RotateConditions,
    pub nontracked_conditions: RotateConditions,
    pub rotate_interval: Duration,
    pub upload_workers: usize,
    pub compressors: usize,
    /// Uploaded objects are stored under this directory.
    pub blob_dir: PathBuf,
    pub events_bucket: String,
    pub nontracked_bucket: String,
    pub group: String,
    pub node: String,
    pub stream: Option<StreamSettings>,
}

fn parsed<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} is not valid: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn duration(name: &str, default: Duration) -> anyhow::Result<Duration> {
    match env::var(name) {
        Ok(raw) => humantime::parse_duration(raw.trim())
            .with_context(|| format!("{name} is not a valid duration: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn new() -> anyhow::Result<Config> {
        let folder = PathBuf::from(string("SPADE_DIR", "spade-data"));
        let blob_dir = env::var("SPADE_BLOB_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| folder.join("blobs"));

        let stream = match env::var("SPADE_STREAM_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading stream config {path}"))?;
                let writer: StreamWriterConfig = serde_json::from_str(&raw)
                    .with_context(|| format!("parsing stream config {path}"))?;
                let endpoint = env::var("SPADE_STREAM_ENDPOINT").map_err(|_| {
                    anyhow::anyhow!("SPADE_STREAM_ENDPOINT must be set with SPADE_STREAM_CONFIG")
                })?;
                Some(StreamSettings {
                    writer,
                    endpoint,
                    timeout: duration("SPADE_STREAM_TIMEOUT", DEFAULT_STREAM_TIMEOUT)?,
                })
            }
            Err(_) => None,
        };

        Ok(Config {
            folder,
            conditions: RotateConditions {
                max_log_size: parsed("SPADE_MAX_LOG_BYTES", DEFAULT_MAX_LOG_BYTES)?,
                max_time_allowed: duration("SPADE_MAX_LOG_AGE", DEFAULT_MAX_LOG_AGE)?,
            },
            nontracked_conditions: RotateConditions {
                max_log_size: parsed(
                    "SPADE_MAX_UNTRACKED_LOG_BYTES",
                    DEFAULT_NONTRACKED_CONDITIONS.max_log_size,
                )?,
                max_time_allowed: duration(
                    "SPADE_MAX_UNTRACKED_LOG_AGE",
                    DEFAULT_NONTRACKED_CONDITIONS.max_time_allowed,
                )?,
            },
            rotate_interval: duration("SPADE_ROTATE_INTERVAL", DEFAULT_ROTATE_INTERVAL)?,
            upload_workers: parsed("SPADE_UPLOAD_WORKERS", DEFAULT_UPLOAD_WORKERS)?,
            compressors: parsed("SPADE_COMPRESSORS", DEFAULT_COMPRESSORS)?,
            blob_dir,
            events_bucket: string("SPADE_EVENTS_BUCKET", "spade-events"),
            nontracked_bucket: string("SPADE_NONTRACKED_BUCKET", "spade-nontracked"),
            group: string("SPADE_GROUP", "spade"),
            node: string("SPADE_NODE", "local"),
            stream,
        })
    }
}
