// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Combines serializable records into compressed, framed globs.
//!
//! A glob is the JSON-array framing `[r1,r2,...]` of individually serialized
//! records. On completion it is prefixed with a one-byte format version and
//! DEFLATE-compressed through the shared [`CompressorPool`]:
//!
//! ```text
//! +---------+---------------------------------------+
//! | version | deflate( "[" r1 "," r2 "," ... "]" )  |
//! +---------+---------------------------------------+
//! ```
//!
//! A single worker task owns the pending buffer. A glob completes when the
//! next entry would push it past `MaxSize`, when `MaxAge` elapses since its
//! first entry, or when the aggregator is closed.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error};

use crate::compressor_pool::CompressorPool;
use crate::config::GlobberConfig;
use crate::errors::{ConfigError, SubmitError};
use crate::forward::Forward;
use crate::stats::{AggregatorSnapshot, AggregatorStats};

pub const GLOB_VERSION: u8 = 1;

const PREFIX: u8 = b'[';
const SEPARATOR: u8 = b',';
const POSTFIX: u8 = b']';

pub struct GlobAggregator {
    tx: mpsc::Sender<Bytes>,
    worker: JoinHandle<()>,
    stats: Arc<AggregatorStats>,
}

impl GlobAggregator {
    /// Validates `config` and starts the worker. Must be called inside a
    /// tokio runtime.
    pub fn new<F>(
        config: &GlobberConfig,
        pool: CompressorPool,
        downstream: F,
    ) -> Result<Self, ConfigError>
    where
        F: Forward<Bytes> + 'static,
    {
        let max_age = config.validate()?;
        let (tx, rx) = mpsc::channel(config.buffer_length);
        let stats = Arc::new(AggregatorStats::default());

        let worker = GlobWorker {
            rx,
            pending: Vec::with_capacity(config.max_size + 2),
            pending_entries: 0,
            max_size: config.max_size,
            max_age,
            pool,
            downstream,
            stats: Arc::clone(&stats),
        };

        Ok(Self {
            tx,
            worker: tokio::spawn(worker.run()),
            stats,
        })
    }

    /// Serializes `record` and queues it, waiting while the inbound queue is
    /// full. A record that fails to serialize leaves the glob untouched.
    pub async fn submit<T: Serialize + ?Sized>(&self, record: &T) -> Result<(), SubmitError> {
        let encoded = serde_json::to_vec(record)?;
        self.submit_encoded(Bytes::from(encoded)).await
    }

    /// Queues an already serialized record.
    pub async fn submit_encoded(&self, entry: Bytes) -> Result<(), SubmitError> {
        self.tx.send(entry).await.map_err(|_| SubmitError::Closed)
    }

    pub fn stats(&self) -> AggregatorSnapshot {
        self.stats.snapshot()
    }

    /// Stops accepting entries, flushes the partial glob and waits for the
    /// worker to exit.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.worker.await {
            error!("Globber worker failed: {}", e);
        }
    }
}

struct GlobWorker<F> {
    rx: mpsc::Receiver<Bytes>,
    pending: Vec<u8>,
    pending_entries: usize,
    max_size: usize,
    max_age: Duration,
    pool: CompressorPool,
    downstream: F,
    stats: Arc<AggregatorStats>,
}

impl<F: Forward<Bytes>> GlobWorker<F> {
    async fn run(mut self) {
        debug!("Globber started");
        let timer = sleep(self.max_age);
        tokio::pin!(timer);
        let mut armed = false;

        loop {
            tokio::select! {
                () = &mut timer, if armed => {
                    armed = false;
                    self.complete().await;
                }
                entry = self.rx.recv() => {
                    let Some(entry) = entry else { break };
                    self.stats.record_received();
                    if self.pending.len() + entry.len() > self.max_size {
                        self.complete().await;
                    }
                    if self.pending.is_empty() {
                        timer.as_mut().reset(Instant::now() + self.max_age);
                        armed = true;
                        self.pending.push(PREFIX);
                    } else {
                        self.pending.push(SEPARATOR);
                    }
                    self.pending.extend_from_slice(&entry);
                    self.pending_entries += 1;
                }
            }
        }

        self.complete().await;
        debug!("Globber stopped");
    }

    /// Compresses and forwards the pending glob. Failures drop the glob and
    /// are counted; the worker keeps going.
    async fn complete(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        self.pending.push(POSTFIX);
        let entries = self.pending_entries;

        let compressed = {
            let mut compressor = self.pool.acquire();
            let mut out = Vec::with_capacity(self.pending.len() / 2 + 16);
            out.push(GLOB_VERSION);
            compressor.compress_into(&self.pending, &mut out).map(|()| out)
        };
        self.pending.clear();
        self.pending_entries = 0;

        let glob = match compressed {
            Ok(out) => Bytes::from(out),
            Err(e) => {
                error!("Failed to compress glob of {} entries: {}", entries, e);
                self.stats.record_dropped(entries);
                return;
            }
        };

        match self.downstream.forward(glob).await {
            Ok(()) => self.stats.record_flushed(entries),
            Err(e) => {
                error!("Failed to forward glob of {} entries: {}", entries, e);
                self.stats.record_dropped(entries);
            }
        }
    }
}

/// Decodes a glob back into its framed JSON array. Used by consumers and
/// tests that need to look inside a compressed payload.
pub fn decode_glob(glob: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Read;

    match glob.split_first() {
        Some((&GLOB_VERSION, body)) => {
            let mut out = Vec::new();
            flate2::read::DeflateDecoder::new(body).read_to_end(&mut out)?;
            Ok(out)
        }
        Some((version, _)) => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported glob version {version}"),
        )),
        None => Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "empty glob",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use serde_json::Value;

    fn config(max_size: usize, max_age: &str) -> GlobberConfig {
        GlobberConfig {
            max_size,
            max_age: max_age.to_string(),
            buffer_length: 16,
        }
    }

    fn pool() -> CompressorPool {
        CompressorPool::new(1, Compression::fast())
    }

    fn records(glob: &[u8]) -> Vec<Value> {
        let framed = decode_glob(glob).expect("valid glob");
        serde_json::from_slice(&framed).expect("framed glob is a JSON array")
    }

    /// Serializes to exactly 20 bytes: {"id":"<11 chars>"}
    fn twenty_byte_record(tag: char) -> Value {
        let value = serde_json::json!({ "id": tag.to_string().repeat(11) });
        assert_eq!(serde_json::to_vec(&value).unwrap().len(), 20);
        value
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_threshold_completes_previous_glob() {
        let (tx, mut rx) = mpsc::channel(4);
        let globber = GlobAggregator::new(&config(50, "1s"), pool(), tx).unwrap();

        for tag in ['a', 'b', 'c'] {
            globber.submit(&twenty_byte_record(tag)).await.unwrap();
        }

        let first = rx.recv().await.expect("size-triggered glob");
        let first = records(&first);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0], twenty_byte_record('a'));
        assert_eq!(first[1], twenty_byte_record('b'));

        // The third record waits for the age timer.
        let second = rx.recv().await.expect("age-triggered glob");
        assert_eq!(records(&second), vec![twenty_byte_record('c')]);

        globber.close().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_age_timer_flushes_without_more_submissions() {
        let (tx, mut rx) = mpsc::channel(4);
        let globber = GlobAggregator::new(&config(1 << 20, "1s"), pool(), tx).unwrap();

        let submitted_at = Instant::now();
        globber.submit(&serde_json::json!({"n": 1})).await.unwrap();

        let glob = rx.recv().await.expect("age-triggered glob");
        assert!(submitted_at.elapsed() <= Duration::from_secs(1) + Duration::from_millis(5));
        assert_eq!(glob[0], GLOB_VERSION);
        assert_eq!(records(&glob), vec![serde_json::json!({"n": 1})]);

        globber.close().await;
    }

    #[tokio::test]
    async fn test_close_flushes_partial_glob_once() {
        let (tx, mut rx) = mpsc::channel(4);
        let globber = GlobAggregator::new(&config(1 << 20, "1h"), pool(), tx).unwrap();

        for n in 0..5 {
            globber.submit(&serde_json::json!({ "n": n })).await.unwrap();
        }
        globber.close().await;

        let glob = rx.recv().await.expect("glob flushed on close");
        assert_eq!(records(&glob).len(), 5);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_glob_produces_no_output() {
        let (tx, mut rx) = mpsc::channel::<Bytes>(4);
        let globber = GlobAggregator::new(&config(64, "1h"), pool(), tx).unwrap();
        globber.close().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_entry_becomes_its_own_glob() {
        let (tx, mut rx) = mpsc::channel(4);
        let globber = GlobAggregator::new(&config(30, "1h"), pool(), tx).unwrap();

        globber.submit(&serde_json::json!({"s": "x"})).await.unwrap();
        let big = serde_json::json!({ "s": "y".repeat(100) });
        globber.submit(&big).await.unwrap();
        globber.close().await;

        assert_eq!(records(&rx.recv().await.unwrap()).len(), 1);
        assert_eq!(records(&rx.recv().await.unwrap()), vec![big]);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_serialization_error_is_returned_to_submitter() {
        struct Unserializable;
        impl Serialize for Unserializable {
            fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("nope"))
            }
        }

        let (tx, mut rx) = mpsc::channel(4);
        let globber = GlobAggregator::new(&config(1024, "1h"), pool(), tx).unwrap();

        let result = globber.submit(&Unserializable).await;
        assert!(matches!(result, Err(SubmitError::Serialization(_))));

        globber.submit(&serde_json::json!({"ok": true})).await.unwrap();
        globber.close().await;
        assert_eq!(
            records(&rx.recv().await.unwrap()),
            vec![serde_json::json!({"ok": true})]
        );
    }

    #[tokio::test]
    async fn test_forward_failure_drops_glob_and_is_counted() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let globber = GlobAggregator::new(&config(1024, "1h"), pool(), tx).unwrap();
        let stats = Arc::clone(&globber.stats);

        globber.submit(&serde_json::json!({"n": 1})).await.unwrap();
        globber.submit(&serde_json::json!({"n": 2})).await.unwrap();
        globber.close().await;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.entries_received, 2);
        assert_eq!(snapshot.units_dropped, 1);
        assert_eq!(snapshot.entries_dropped, 2);
        assert_eq!(snapshot.units_flushed, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_construction() {
        let (tx, _rx) = mpsc::channel::<Bytes>(1);
        let result = GlobAggregator::new(&config(0, "1s"), pool(), tx);
        assert!(matches!(
            result,
            Err(ConfigError::NotPositive { field: "MaxSize" })
        ));
    }

    #[test]
    fn test_decode_glob_rejects_unknown_version() {
        let err = decode_glob(&[9, 1, 2, 3]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
