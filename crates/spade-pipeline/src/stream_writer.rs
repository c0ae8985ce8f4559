// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! An [`EventWriter`] that delivers events to a managed stream.
//!
//! ```text
//! write ─▶ inbound worker ─┬─ compressed ─▶ GlobAggregator ─┐
//!                          └─ plain JSON ───────────────────┴▶ BatchAggregator ─▶ send worker ─▶ DeliveryEngine
//! ```
//!
//! The inbound worker prunes each event down to its configured fields. Every
//! completed batch is delivered on its own task. Closing drains each stage in
//! order before the next one is closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error};

use crate::batcher::BatchAggregator;
use crate::compressor_pool::CompressorPool;
use crate::config::StreamWriterConfig;
use crate::delivery::{DeliveryEngine, WireFormat};
use crate::errors::{ConfigError, WriterError};
use crate::event_filter::EventFilter;
use crate::globber::GlobAggregator;
use crate::record_sink::RecordSink;
use crate::stats::DeliverySnapshot;
use crate::write_request::WriteRequest;
use crate::writer::EventWriter;

const BATCH_QUEUE_LENGTH: usize = 1;

pub struct StreamWriter {
    stream_name: String,
    tx: Mutex<Option<mpsc::Sender<Arc<WriteRequest>>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    engine: DeliveryEngine,
}

impl StreamWriter {
    /// Validates `config` and starts the writer's workers. Must be called
    /// inside a tokio runtime.
    pub fn new(
        config: StreamWriterConfig,
        sink: Arc<dyn RecordSink>,
        pool: CompressorPool,
    ) -> Result<Self, ConfigError> {
        let validated = config.validate()?;
        let config = validated.raw;

        let engine = DeliveryEngine::new(
            sink,
            &config.stream_name,
            WireFormat {
                stream_type: validated.stream_type,
                compressed: config.compress,
                redshift_stream: config.firehose_redshift_stream,
            },
            config.max_attempts_per_record,
            validated.retry_delay,
        );

        let (batches_tx, batches_rx) = mpsc::channel(BATCH_QUEUE_LENGTH);
        let batcher = BatchAggregator::new(&config.batcher, batches_tx)?;
        let globber = if config.compress {
            Some(GlobAggregator::new(&config.globber, pool, batcher.handle())?)
        } else {
            None
        };

        let events = config
            .events
            .iter()
            .map(|(name, event)| {
                (
                    name.clone(),
                    PreparedEvent {
                        filter: event.filter.clone(),
                        fields: event.full_field_map(),
                    },
                )
            })
            .collect();

        let (tx, rx) = mpsc::channel(config.buffer_size);
        let inbound = InboundWorker {
            rx,
            events,
            event_name_target_field: config.event_name_target_field.clone(),
            exclude_empty_fields: config.exclude_empty_fields,
            globber,
            batcher,
        };
        let sender = SendWorker {
            rx: batches_rx,
            engine: engine.clone(),
        };

        debug!(stream = %config.stream_name, "Starting stream writer");
        Ok(Self {
            stream_name: config.stream_name,
            tx: Mutex::new(Some(tx)),
            workers: tokio::sync::Mutex::new(vec![
                tokio::spawn(inbound.run()),
                tokio::spawn(sender.run()),
            ]),
            engine,
        })
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn stats(&self) -> DeliverySnapshot {
        self.engine.stats()
    }
}

#[async_trait]
impl EventWriter for StreamWriter {
    async fn write(&self, request: Arc<WriteRequest>) -> Result<(), WriterError> {
        let tx = {
            #[allow(clippy::expect_used)]
            let guard = self.tx.lock().expect("lock poisoned");
            guard.clone().ok_or(WriterError::Closed)?
        };
        tx.send(request).await.map_err(|_| WriterError::Closed)
    }

    async fn rotate(&self) -> Result<bool, WriterError> {
        Ok(true)
    }

    async fn close(&self) -> Result<(), WriterError> {
        {
            #[allow(clippy::expect_used)]
            let mut guard = self.tx.lock().expect("lock poisoned");
            guard.take();
        }
        let workers = std::mem::take(&mut *self.workers.lock().await);
        join_workers(workers).await?;
        debug!(stream = %self.stream_name, "Stream writer closed");
        Ok(())
    }
}

/// Awaits every worker, even after one has failed, and returns the first
/// failure.
async fn join_workers(workers: Vec<JoinHandle<()>>) -> Result<(), WriterError> {
    let mut first_error = None;
    for (worker_index, worker) in workers.into_iter().enumerate() {
        if let Err(e) = worker.await {
            error!(worker_index, "Stream writer worker failed: {}", e);
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(WriterError::Join(e)),
        None => Ok(()),
    }
}

struct PreparedEvent {
    filter: Option<EventFilter>,
    /// Source field and the name it is written under.
    fields: Vec<(String, String)>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct NamedEvent<'a> {
    name: &'a str,
    fields: &'a HashMap<String, String>,
}

struct InboundWorker {
    rx: mpsc::Receiver<Arc<WriteRequest>>,
    events: HashMap<String, PreparedEvent>,
    event_name_target_field: Option<String>,
    exclude_empty_fields: bool,
    globber: Option<GlobAggregator>,
    batcher: BatchAggregator,
}

impl InboundWorker {
    async fn run(mut self) {
        while let Some(request) = self.rx.recv().await {
            self.submit(&request).await;
        }

        if let Some(globber) = self.globber.take() {
            globber.close().await;
        }
        self.batcher.close().await;
    }

    fn prune(&self, name: &str, record: &HashMap<String, String>) -> Option<HashMap<String, String>> {
        let event = self.events.get(name)?;
        if let Some(filter) = &event.filter {
            if !filter.matches(record) {
                return None;
            }
        }

        let mut pruned: HashMap<String, String> = event
            .fields
            .iter()
            .map(|(source, target)| {
                let value = record.get(source).cloned().unwrap_or_default();
                (target.clone(), value)
            })
            .collect();
        if let Some(target) = &self.event_name_target_field {
            pruned.insert(target.clone(), name.to_string());
        }
        if self.exclude_empty_fields {
            pruned.retain(|_, value| !value.is_empty());
        }

        (!pruned.is_empty()).then_some(pruned)
    }

    async fn submit(&self, request: &WriteRequest) {
        let Some(pruned) = self.prune(&request.category, &request.record) else {
            return;
        };

        match &self.globber {
            Some(globber) => {
                let event = NamedEvent {
                    name: &request.category,
                    fields: &pruned,
                };
                if let Err(e) = globber.submit(&event).await {
                    error!(name = %request.category, "Failed to submit to globber: {}", e);
                }
            }
            None => {
                let encoded = match serde_json::to_vec(&pruned) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        error!(name = %request.category, "Failed to encode event: {}", e);
                        return;
                    }
                };
                if let Err(e) = self.batcher.submit(Bytes::from(encoded)).await {
                    error!(name = %request.category, "Failed to submit to batcher: {}", e);
                }
            }
        }
    }
}

struct SendWorker {
    rx: mpsc::Receiver<Vec<Bytes>>,
    engine: DeliveryEngine,
}

impl SendWorker {
    async fn run(mut self) {
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                batch = self.rx.recv() => {
                    let Some(batch) = batch else { break };
                    let engine = self.engine.clone();
                    in_flight.spawn(async move { engine.deliver(batch).await });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!("Delivery task failed: {}", e);
                    }
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Delivery task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatcherConfig, EventConfig, GlobberConfig};
    use crate::delivery::tests::{Script, ScriptedSink};
    use crate::globber::decode_glob;
    use base64::Engine;
    use flate2::Compression;
    use serde_json::{json, Value};
    use std::time::SystemTime;

    fn config(compress: bool) -> StreamWriterConfig {
        let mut events = HashMap::new();
        events.insert(
            "minute-watched".to_string(),
            EventConfig {
                filter: Some(EventFilter::Present {
                    field: "channel".to_string(),
                }),
                fields: vec!["channel".to_string(), "minutes".to_string()],
                field_renames: HashMap::from([("channel".to_string(), "channel_name".to_string())]),
            },
        );
        StreamWriterConfig {
            stream_name: "spade-events".to_string(),
            stream_type: "stream".to_string(),
            compress,
            firehose_redshift_stream: false,
            event_name_target_field: Some("event".to_string()),
            exclude_empty_fields: true,
            buffer_size: 16,
            max_attempts_per_record: 3,
            retry_delay: "10ms".to_string(),
            events,
            globber: GlobberConfig {
                max_size: 1 << 16,
                max_age: "1h".to_string(),
                buffer_length: 16,
            },
            batcher: BatcherConfig {
                max_size: 1 << 16,
                max_entries: -1,
                max_age: "1h".to_string(),
                buffer_length: 16,
            },
        }
    }

    fn request(category: &str, record: &[(&str, &str)]) -> Arc<WriteRequest> {
        Arc::new(WriteRequest {
            category: category.to_string(),
            version: 1,
            line: String::new(),
            record: record
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            uuid: "uuid".to_string(),
            failure: Default::default(),
            started_at: SystemTime::now(),
        })
    }

    fn pool() -> CompressorPool {
        CompressorPool::new(1, Compression::fast())
    }

    fn delivered_data(sink: &ScriptedSink) -> Vec<Value> {
        sink.calls()
            .iter()
            .flat_map(|(_, records)| records.iter())
            .map(|record| {
                let value: Value = serde_json::from_slice(&record.data).unwrap();
                value["Data"].clone()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_prunes_renames_and_filters_events() {
        let sink = Arc::new(ScriptedSink::new(vec![]));
        let writer = StreamWriter::new(config(false), sink.clone(), pool()).unwrap();

        writer
            .write(request(
                "minute-watched",
                &[("channel", "rustlang"), ("minutes", ""), ("secret", "x")],
            ))
            .await
            .unwrap();
        writer
            .write(request("minute-watched", &[("minutes", "3")]))
            .await
            .unwrap();
        writer
            .write(request("unconfigured", &[("channel", "c")]))
            .await
            .unwrap();
        assert!(writer.rotate().await.unwrap());
        writer.close().await.unwrap();

        assert_eq!(
            delivered_data(&sink),
            vec![json!({"channel_name": "rustlang", "event": "minute-watched"})]
        );
        assert_eq!(sink.calls()[0].0, "spade-events");
        assert_eq!(writer.stats().records_succeeded, 1);
    }

    #[tokio::test]
    async fn test_compressed_events_travel_as_globs() {
        let sink = Arc::new(ScriptedSink::new(vec![]));
        let writer = StreamWriter::new(config(true), sink.clone(), pool()).unwrap();

        writer
            .write(request("minute-watched", &[("channel", "a"), ("minutes", "1")]))
            .await
            .unwrap();
        writer
            .write(request("minute-watched", &[("channel", "b"), ("minutes", "2")]))
            .await
            .unwrap();
        writer.close().await.unwrap();

        let data = delivered_data(&sink);
        assert_eq!(data.len(), 1);
        let glob = base64::engine::general_purpose::STANDARD
            .decode(data[0].as_str().unwrap())
            .unwrap();
        let events: Vec<Value> = serde_json::from_slice(&decode_glob(&glob).unwrap()).unwrap();
        assert_eq!(
            events,
            vec![
                json!({"Name": "minute-watched", "Fields": {"channel_name": "a", "minutes": "1", "event": "minute-watched"}}),
                json!({"Name": "minute-watched", "Fields": {"channel_name": "b", "minutes": "2", "event": "minute-watched"}}),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_retrying_deliveries() {
        let sink = Arc::new(ScriptedSink::new(vec![Script::CallError]));
        let writer = StreamWriter::new(config(false), sink.clone(), pool()).unwrap();

        writer
            .write(request("minute-watched", &[("channel", "a")]))
            .await
            .unwrap();
        writer.close().await.unwrap();

        assert_eq!(sink.calls().len(), 2);
        let stats = writer.stats();
        assert_eq!(stats.put_records_errors, 1);
        assert_eq!(stats.records_succeeded, 1);
    }

    #[tokio::test]
    async fn test_write_after_close_is_rejected() {
        let sink = Arc::new(ScriptedSink::new(vec![]));
        let writer = StreamWriter::new(config(false), sink, pool()).unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap();

        let result = writer.write(request("minute-watched", &[])).await;
        assert!(matches!(result, Err(WriterError::Closed)));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut invalid = config(true);
        invalid.firehose_redshift_stream = true;
        let sink = Arc::new(ScriptedSink::new(vec![]));
        assert!(matches!(
            StreamWriter::new(invalid, sink, pool()),
            Err(ConfigError::RedshiftStreamingMisconfigured)
        ));
    }

    #[tokio::test]
    async fn test_join_workers_waits_for_all_after_a_panic() {
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let workers = vec![
            tokio::spawn(async { panic!("inbound worker died") }),
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
            }),
        ];

        let result = join_workers(workers).await;
        assert!(matches!(result, Err(WriterError::Join(_))));
        assert!(finished.load(std::sync::atomic::Ordering::SeqCst));
    }
}
