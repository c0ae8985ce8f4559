// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Upload notifications.
//!
//! A [`Notifier`] turns an [`UploadReceipt`] into a message for downstream
//! loaders and hands it to a [`MessagePublisher`]. Errors anywhere in the
//! upload pool go to an [`ErrorNotifier`].

use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info};

use crate::blob_sink::event_and_version;
use crate::errors::NotifyError;
use crate::uploader_pool::UploadReceipt;

/// A pub/sub topic or queue that carries notification messages.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, message: String) -> Result<(), NotifyError>;
}

/// Publishes by logging each message.
#[derive(Debug, Default, Clone)]
pub struct LoggingPublisher;

#[async_trait]
impl MessagePublisher for LoggingPublisher {
    async fn publish(&self, message: String) -> Result<(), NotifyError> {
        info!(message = %message, "Upload notification");
        Ok(())
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, receipt: &UploadReceipt) -> Result<(), NotifyError>;
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RowCopyRequest {
    pub table_name: String,
    pub key_name: String,
    pub table_version: u32,
}

impl RowCopyRequest {
    pub fn from_receipt(receipt: &UploadReceipt) -> Result<Self, NotifyError> {
        let (event, version) = event_and_version(&receipt.path);
        let table_version = version
            .as_deref()
            .and_then(|v| v.strip_prefix('v'))
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| NotifyError::EventVersion(receipt.path.display().to_string()))?;
        Ok(Self {
            table_name: event,
            key_name: receipt.key_name.clone(),
            table_version,
        })
    }
}

/// Announces tracked event files to the table loader.
pub struct RowCopyNotifier {
    publisher: Arc<dyn MessagePublisher>,
}

impl RowCopyNotifier {
    pub fn new(publisher: Arc<dyn MessagePublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl Notifier for RowCopyNotifier {
    async fn notify(&self, receipt: &UploadReceipt) -> Result<(), NotifyError> {
        let message = serde_json::to_string(&RowCopyRequest::from_receipt(receipt)?)?;
        self.publisher.publish(message).await
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct KeyOnly<'a> {
    key_name: &'a str,
}

/// Announces only the key of an uploaded file.
pub struct KeyOnlyNotifier {
    publisher: Arc<dyn MessagePublisher>,
}

impl KeyOnlyNotifier {
    pub fn new(publisher: Arc<dyn MessagePublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl Notifier for KeyOnlyNotifier {
    async fn notify(&self, receipt: &UploadReceipt) -> Result<(), NotifyError> {
        let message = serde_json::to_string(&KeyOnly {
            key_name: &receipt.key_name,
        })?;
        self.publisher.publish(message).await
    }
}

/// For replays, where nobody needs to hear about new files.
#[derive(Debug, Default, Clone)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _receipt: &UploadReceipt) -> Result<(), NotifyError> {
        Ok(())
    }
}

#[async_trait]
pub trait ErrorNotifier: Send + Sync {
    async fn send_error(&self, error: &(dyn Error + Send + Sync));
}

#[derive(Debug, Default, Clone)]
pub struct LoggingErrorNotifier;

#[async_trait]
impl ErrorNotifier for LoggingErrorNotifier {
    async fn send_error(&self, error: &(dyn Error + Send + Sync)) {
        error!("Upload pool error: {}", error);
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorMessage {
    error: String,
}

/// Logs each error and forwards it to an error topic.
pub struct PublishingErrorNotifier {
    publisher: Arc<dyn MessagePublisher>,
}

impl PublishingErrorNotifier {
    pub fn new(publisher: Arc<dyn MessagePublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl ErrorNotifier for PublishingErrorNotifier {
    async fn send_error(&self, error: &(dyn Error + Send + Sync)) {
        error!("Upload pool error: {}", error);
        let message = match serde_json::to_string(&ErrorMessage {
            error: error.to_string(),
        }) {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to encode error message: {}", e);
                return;
            }
        };
        if let Err(e) = self.publisher.publish(message).await {
            error!("Failed to publish error: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        pub(crate) messages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessagePublisher for RecordingPublisher {
        async fn publish(&self, message: String) -> Result<(), NotifyError> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn receipt(path: &str) -> UploadReceipt {
        UploadReceipt {
            path: PathBuf::from(path),
            key_name: "bucket/20240309/login/v2/g/n.1.log.gz".to_string(),
        }
    }

    #[tokio::test]
    async fn test_row_copy_notifier_message() {
        let publisher = Arc::new(RecordingPublisher::default());
        let notifier = RowCopyNotifier::new(publisher.clone());

        notifier
            .notify(&receipt("/data/upload/login.v2.991.gz"))
            .await
            .unwrap();

        let messages = publisher.messages.lock().unwrap();
        let value: serde_json::Value = serde_json::from_str(&messages[0]).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "TableName": "login",
                "KeyName": "bucket/20240309/login/v2/g/n.1.log.gz",
                "TableVersion": 2
            })
        );
    }

    #[tokio::test]
    async fn test_row_copy_requires_version() {
        let notifier = RowCopyNotifier::new(Arc::new(RecordingPublisher::default()));
        let result = notifier.notify(&receipt("/data/upload/login.991.gz")).await;
        assert!(matches!(result, Err(NotifyError::EventVersion(_))));
    }

    #[tokio::test]
    async fn test_key_only_and_null_notifiers() {
        let publisher = Arc::new(RecordingPublisher::default());
        KeyOnlyNotifier::new(publisher.clone())
            .notify(&receipt("/data/upload/nontracked.5.gz"))
            .await
            .unwrap();
        NullNotifier
            .notify(&receipt("/data/upload/nontracked.5.gz"))
            .await
            .unwrap();

        let messages = publisher.messages.lock().unwrap();
        assert_eq!(
            *messages,
            vec![r#"{"KeyName":"bucket/20240309/login/v2/g/n.1.log.gz"}"#.to_string()]
        );
    }

    #[tokio::test]
    async fn test_publishing_error_notifier_forwards_message() {
        let publisher = Arc::new(RecordingPublisher::default());
        let notifier = PublishingErrorNotifier::new(publisher.clone());
        let error = NotifyError::Publish("topic unavailable".to_string());

        notifier.send_error(&error).await;

        assert_eq!(
            publisher.messages.lock().unwrap()[0],
            r#"{"Error":"publishing notification: topic unavailable"}"#
        );
    }
}
