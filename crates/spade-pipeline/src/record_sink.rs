// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::SinkError;

/// One record as the stream service sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkRecord {
    /// Stream shards by this key; firehose records carry none.
    pub partition_key: Option<String>,
    pub data: Bytes,
}

/// Per-record result of a successful sink call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Success,
    Failed { error_code: String },
}

impl RecordOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RecordOutcome::Success)
    }
}

/// A managed stream or firehose service.
///
/// A successful call returns one outcome per submitted record, in the same
/// order. A call-level error means none of the records should be assumed
/// delivered.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn put_records(
        &self,
        stream_name: &str,
        records: &[SinkRecord],
    ) -> Result<Vec<RecordOutcome>, SinkError>;
}
