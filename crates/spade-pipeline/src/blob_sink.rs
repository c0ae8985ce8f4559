// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Object storage seam and the key names uploaded files are stored under.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::UploadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Gzip,
    Text,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Gzip => "application/x-gzip",
            ContentType::Text => "text/plain",
        }
    }
}

/// An object store. Returns the hex SHA-256 of what it stored.
#[async_trait]
pub trait BlobSink: Send + Sync {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: ContentType,
        body: Bytes,
    ) -> Result<String, UploadError>;
}

pub fn sha256_hex(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Stores objects as files under `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct LocalDirBlobSink {
    root: PathBuf,
}

impl LocalDirBlobSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

#[async_trait]
impl BlobSink for LocalDirBlobSink {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: ContentType,
        body: Bytes,
    ) -> Result<String, UploadError> {
        let path = self.object_path(bucket, key);
        let sink_error = |e: std::io::Error| UploadError::Sink {
            key: key.to_string(),
            reason: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(sink_error)?;
        }
        tokio::fs::write(&path, &body).await.map_err(sink_error)?;
        debug!(
            "Stored {} bytes of {} at {}",
            body.len(),
            content_type.as_str(),
            path.display()
        );
        Ok(sha256_hex(&body))
    }
}

/// Names the object a local file is uploaded as.
pub trait KeyNameGenerator: Send + Sync {
    fn key_name(&self, path: &Path) -> String;
}

/// Event name and the `vN` segment of an event file name such as
/// `minute-watched.v3.8812.gz`.
pub(crate) fn event_and_version(path: &Path) -> (String, Option<String>) {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut segments = file_name.split('.');
    let event = segments.next().unwrap_or_default().to_string();
    let version = segments
        .filter(|segment| {
            segment.len() > 1
                && segment.starts_with('v')
                && segment[1..].bytes().all(|b| b.is_ascii_digit())
        })
        .last()
        .map(str::to_string);
    (event, version)
}

/// Keys tracked event files as
/// `<YYYYMMDD>/<event>/<vN>/<group>/<node>.<unix>.log.gz`.
#[derive(Debug, Clone)]
pub struct ProcessorKeyNameGenerator {
    pub group: String,
    pub node: String,
}

impl ProcessorKeyNameGenerator {
    pub fn key_name_at(&self, path: &Path, now: DateTime<Utc>) -> String {
        let (event, version) = event_and_version(path);
        format!(
            "{}/{}/{}/{}/{}.{}.log.gz",
            now.format("%Y%m%d"),
            event,
            version.as_deref().unwrap_or("v0"),
            self.group,
            self.node,
            now.timestamp()
        )
    }
}

impl KeyNameGenerator for ProcessorKeyNameGenerator {
    fn key_name(&self, path: &Path) -> String {
        self.key_name_at(path, Utc::now())
    }
}

/// Keys non-tracked files as `<YYYYMMDD>/<group>/<unix>.<node>.<random>.log.gz`.
#[derive(Debug, Clone)]
pub struct EdgeKeyNameGenerator {
    pub group: String,
    pub node: String,
}

impl KeyNameGenerator for EdgeKeyNameGenerator {
    fn key_name(&self, _path: &Path) -> String {
        let now = Utc::now();
        let random = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "{}/{}/{}.{}.{}.log.gz",
            now.format("%Y%m%d"),
            self.group,
            now.timestamp(),
            self.node,
            &random[..16]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_event_and_version_from_staged_name() {
        assert_eq!(
            event_and_version(Path::new("/data/upload/minute-watched.v3.8812.gz")),
            ("minute-watched".to_string(), Some("v3".to_string()))
        );
        assert_eq!(
            event_and_version(Path::new("/data/upload/nontracked.77.gz")),
            ("nontracked".to_string(), None)
        );
    }

    #[test]
    fn test_processor_key_name_layout() {
        let generator = ProcessorKeyNameGenerator {
            group: "spade-asg".to_string(),
            node: "i-123".to_string(),
        };
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();

        assert_eq!(
            generator.key_name_at(Path::new("/data/upload/login.v12.55.gz"), now),
            format!("20240309/login/v12/spade-asg/i-123.{}.log.gz", now.timestamp())
        );
    }

    #[test]
    fn test_edge_key_names_are_unique() {
        let generator = EdgeKeyNameGenerator {
            group: "edge".to_string(),
            node: "n1".to_string(),
        };
        let a = generator.key_name(Path::new("nontracked.1.gz"));
        let b = generator.key_name(Path::new("nontracked.1.gz"));
        assert_ne!(a, b);
        assert!(a.ends_with(".log.gz"));
        assert!(a.contains("/edge/"));
    }

    #[tokio::test]
    async fn test_local_dir_sink_stores_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LocalDirBlobSink::new(dir.path());

        let digest = sink
            .put_object(
                "bucket",
                "20240309/login/v1/a.gz",
                ContentType::Gzip,
                Bytes::from_static(b"abc"),
            )
            .await
            .unwrap();

        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let stored = std::fs::read(sink.object_path("bucket", "20240309/login/v1/a.gz")).unwrap();
        assert_eq!(stored, b"abc");
    }
}
