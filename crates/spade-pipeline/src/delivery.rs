// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivers completed batches to a [`RecordSink`] with bounded retries.
//!
//! Every blob in a batch becomes one wire record. The full set is sent in a
//! single call; records the sink rejects are resent, in their original
//! relative order, until none remain or the attempt limit is reached.
//! Whatever is left at that point is dropped and counted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::StreamType;
use crate::record_sink::{RecordOutcome, RecordSink, SinkRecord};
use crate::stats::{DeliverySnapshot, DeliveryStats, FailureKind};

pub const WIRE_VERSION: u32 = 1;

/// Redshift ingest timestamp layout, always UTC.
const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// How a batch blob turns into a wire record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireFormat {
    pub stream_type: StreamType,
    /// Blobs are compressed globs rather than JSON field maps.
    pub compressed: bool,
    /// Firehose records are the bare field map, for Redshift streaming.
    pub redshift_stream: bool,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireData<'a> {
    Glob(String),
    Fields(&'a HashMap<String, String>),
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireRecord<'a> {
    #[serde(rename = "UUID")]
    uuid: &'a str,
    version: u32,
    data: WireData<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<String>,
}

impl WireFormat {
    pub fn encode(&self, blob: &[u8]) -> Result<SinkRecord, serde_json::Error> {
        let uuid = uuid::Uuid::new_v4().to_string();

        let fields: HashMap<String, String>;
        let data = if self.compressed {
            WireData::Glob(base64::engine::general_purpose::STANDARD.encode(blob))
        } else {
            fields = serde_json::from_slice(blob)?;
            WireData::Fields(&fields)
        };

        match self.stream_type {
            StreamType::Stream => {
                let record = WireRecord {
                    uuid: &uuid,
                    version: WIRE_VERSION,
                    data,
                    created_at: Some(chrono::Utc::now().format(CREATED_AT_FORMAT).to_string()),
                };
                Ok(SinkRecord {
                    data: Bytes::from(serde_json::to_vec(&record)?),
                    partition_key: Some(uuid),
                })
            }
            StreamType::Firehose => {
                let mut encoded = match data {
                    WireData::Fields(fields) if self.redshift_stream => {
                        let scrubbed: HashMap<&str, String> = fields
                            .iter()
                            .map(|(k, v)| (k.as_str(), v.replace('\0', "")))
                            .collect();
                        serde_json::to_vec(&scrubbed)?
                    }
                    data => serde_json::to_vec(&WireRecord {
                        uuid: &uuid,
                        version: WIRE_VERSION,
                        data,
                        created_at: None,
                    })?,
                };
                encoded.push(b'\n');
                Ok(SinkRecord {
                    partition_key: None,
                    data: Bytes::from(encoded),
                })
            }
        }
    }
}

/// What happened to one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryReport {
    pub attempts: usize,
    pub succeeded: usize,
    pub dropped: usize,
}

#[derive(Clone)]
pub struct DeliveryEngine {
    sink: Arc<dyn RecordSink>,
    stream_name: Arc<str>,
    format: WireFormat,
    max_attempts: usize,
    retry_delay: Duration,
    stats: Arc<DeliveryStats>,
}

impl DeliveryEngine {
    pub fn new(
        sink: Arc<dyn RecordSink>,
        stream_name: &str,
        format: WireFormat,
        max_attempts: usize,
        retry_delay: Duration,
    ) -> Self {
        Self {
            sink,
            stream_name: Arc::from(stream_name),
            format,
            max_attempts: max_attempts.max(1),
            retry_delay,
            stats: Arc::new(DeliveryStats::default()),
        }
    }

    pub fn stats(&self) -> DeliverySnapshot {
        self.stats.snapshot()
    }

    /// Encodes and delivers one batch. Never fails; losses are counted.
    pub async fn deliver(&self, batch: Vec<Bytes>) -> DeliveryReport {
        let mut records = Vec::with_capacity(batch.len());
        let mut report = DeliveryReport::default();
        for blob in &batch {
            match self.format.encode(blob) {
                Ok(record) => records.push(record),
                Err(e) => {
                    error!(stream = %self.stream_name, "Failed to encode wire record: {}", e);
                    report.dropped += 1;
                }
            }
        }
        if report.dropped > 0 {
            self.stats.record_dropped(report.dropped);
        }
        if records.is_empty() {
            return report;
        }

        let sent = self.send_with_retries(records).await;
        report.attempts = sent.attempts;
        report.succeeded = sent.succeeded;
        report.dropped += sent.dropped;
        report
    }

    async fn send_with_retries(&self, mut records: Vec<SinkRecord>) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        for attempt in 1..=self.max_attempts {
            report.attempts = attempt;
            self.stats.record_attempt(records.len());

            match self.sink.put_records(&self.stream_name, &records).await {
                Err(e) => {
                    self.stats.record_call_error();
                    warn!(
                        stream = %self.stream_name,
                        attempt,
                        "Failed to put {} records: {}",
                        records.len(),
                        e
                    );
                }
                Ok(outcomes) if outcomes.len() != records.len() => {
                    self.stats.record_call_error();
                    warn!(
                        stream = %self.stream_name,
                        attempt,
                        "Sink returned {} outcomes for {} records",
                        outcomes.len(),
                        records.len()
                    );
                }
                Ok(outcomes) => {
                    let submitted = records.len();
                    records = self.retain_failed(records, outcomes);
                    let succeeded = submitted - records.len();
                    self.stats.record_succeeded(succeeded);
                    report.succeeded += succeeded;

                    if records.is_empty() {
                        debug!(stream = %self.stream_name, attempt, "Delivered batch");
                        return report;
                    }
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        report.dropped = records.len();
        self.stats.record_dropped(records.len());
        error!(
            stream = %self.stream_name,
            "Dropping {} records after {} attempts",
            records.len(),
            self.max_attempts
        );
        report
    }

    fn retain_failed(
        &self,
        records: Vec<SinkRecord>,
        outcomes: Vec<RecordOutcome>,
    ) -> Vec<SinkRecord> {
        records
            .into_iter()
            .zip(outcomes)
            .filter_map(|(record, outcome)| match outcome {
                RecordOutcome::Success => None,
                RecordOutcome::Failed { error_code } => {
                    self.stats
                        .record_failure(FailureKind::from_error_code(&error_code));
                    Some(record)
                }
            })
            .collect()
    }
}
