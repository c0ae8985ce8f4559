// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for pipeline construction and runtime.

use std::path::PathBuf;

/// Configuration was rejected at construction time.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be a positive value")]
    NotPositive { field: &'static str },
    #[error("MaxEntries must be a positive value or -1, got {0}")]
    InvalidMaxEntries(i64),
    #[error("{field} is not a valid duration: {reason}")]
    InvalidDuration { field: &'static str, reason: String },
    #[error("mandatory field {0} is not populated")]
    Missing(&'static str),
    #[error("unknown stream type: {0}")]
    UnknownStreamType(String),
    #[error("Redshift streaming only valid with non-compressed firehose")]
    RedshiftStreamingMisconfigured,
    #[error("globber config invalid: {0}")]
    Globber(Box<ConfigError>),
    #[error("batcher config invalid: {0}")]
    Batcher(Box<ConfigError>),
}

/// A record could not be handed to an aggregator.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("aggregator is closed")]
    Closed,
}

/// Errors from writers that own local files.
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("writer is closed")]
    Closed,
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl WriterError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WriterError::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

/// A call-level failure reported by a record sink. The whole call is retried.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Response(String),
}

impl From<reqwest::Error> for SinkError {
    fn from(e: reqwest::Error) -> Self {
        SinkError::Transport(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("opening {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("blob sink rejected {key}: {reason}")]
    Sink { key: String, reason: String },
    #[error("content hash mismatch for {key}: expected {expected}, got {actual}")]
    HashMismatch {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("upload pool is closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("extracting event version from {0}")]
    EventVersion(String),
    #[error("encoding notification: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publishing notification: {0}")]
    Publish(String),
}
