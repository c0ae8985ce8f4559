// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! [`RecordSink`] over a JSON-over-HTTP put-records endpoint.
//!
//! Request:
//!
//! ```json
//! {"StreamName": "events", "Records": [{"PartitionKey": "..", "Data": "<base64>"}]}
//! ```
//!
//! Response, one entry per record in request order:
//!
//! ```json
//! {"Records": [{}, {"ErrorCode": "ProvisionedThroughputExceededException"}]}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::SinkError;
use crate::record_sink::{RecordOutcome, RecordSink, SinkRecord};

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PutRecordsRequest<'a> {
    stream_name: &'a str,
    records: Vec<RequestEntry<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct RequestEntry<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    partition_key: Option<&'a str>,
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PutRecordsResponse {
    records: Vec<ResponseEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResponseEntry {
    #[serde(default)]
    error_code: Option<String>,
}

#[derive(Clone)]
pub struct HttpRecordSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRecordSink {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl RecordSink for HttpRecordSink {
    async fn put_records(
        &self,
        stream_name: &str,
        records: &[SinkRecord],
    ) -> Result<Vec<RecordOutcome>, SinkError> {
        let body = PutRecordsRequest {
            stream_name,
            records: records
                .iter()
                .map(|record| RequestEntry {
                    partition_key: record.partition_key.as_deref(),
                    data: base64::engine::general_purpose::STANDARD.encode(&record.data),
                })
                .collect(),
        };

        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        let parsed: PutRecordsResponse =
            serde_json::from_str(&text).map_err(|e| SinkError::Response(e.to_string()))?;
        debug!(
            stream = stream_name,
            "Put {} records, {} outcomes",
            records.len(),
            parsed.records.len()
        );

        Ok(parsed
            .records
            .into_iter()
            .map(|entry| match entry.error_code {
                Some(error_code) if !error_code.is_empty() => RecordOutcome::Failed { error_code },
                _ => RecordOutcome::Success,
            })
            .collect())
    }
}
