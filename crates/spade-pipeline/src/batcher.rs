// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Groups opaque blobs into size, count and age bounded batches.
//!
//! Blobs are forwarded verbatim and in submission order. The worker owns the
//! pending batch; nothing else touches it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error};

use crate::config::{BatcherConfig, EntryLimit};
use crate::errors::{ConfigError, SubmitError};
use crate::forward::Forward;
use crate::stats::{AggregatorSnapshot, AggregatorStats};

pub struct BatchAggregator {
    tx: mpsc::Sender<Bytes>,
    worker: JoinHandle<()>,
    stats: Arc<AggregatorStats>,
}

impl BatchAggregator {
    pub fn new<F>(config: &BatcherConfig, downstream: F) -> Result<Self, ConfigError>
    where
        F: Forward<Vec<Bytes>> + 'static,
    {
        let (max_age, limit) = config.validate()?;
        let (tx, rx) = mpsc::channel(config.buffer_length);
        let stats = Arc::new(AggregatorStats::default());

        let worker = BatchWorker {
            rx,
            pending: Vec::new(),
            pending_size: 0,
            max_size: config.max_size,
            limit,
            max_age,
            downstream,
            stats: Arc::clone(&stats),
        };

        Ok(Self {
            tx,
            worker: tokio::spawn(worker.run()),
            stats,
        })
    }

    /// Queues `blob`, waiting while the inbound queue is full.
    pub async fn submit(&self, blob: Bytes) -> Result<(), SubmitError> {
        self.tx.send(blob).await.map_err(|_| SubmitError::Closed)
    }

    /// A sender feeding this aggregator, for upstream stages that forward
    /// into it. The aggregator only drains once every handle is dropped.
    pub fn handle(&self) -> mpsc::Sender<Bytes> {
        self.tx.clone()
    }

    pub fn stats(&self) -> AggregatorSnapshot {
        self.stats.snapshot()
    }

    /// Flushes the partial batch and waits for the worker to exit.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.worker.await {
            error!("Batcher worker failed: {}", e);
        }
    }
}

struct BatchWorker<F> {
    rx: mpsc::Receiver<Bytes>,
    pending: Vec<Bytes>,
    pending_size: usize,
    max_size: usize,
    limit: EntryLimit,
    max_age: Duration,
    downstream: F,
    stats: Arc<AggregatorStats>,
}

impl<F: Forward<Vec<Bytes>>> BatchWorker<F> {
    async fn run(mut self) {
        debug!("Batcher started");
        let timer = sleep(self.max_age);
        tokio::pin!(timer);
        let mut armed = false;

        loop {
            tokio::select! {
                () = &mut timer, if armed => {
                    armed = false;
                    self.complete().await;
                }
                blob = self.rx.recv() => {
                    let Some(blob) = blob else { break };
                    self.stats.record_received();
                    if self.pending_size + blob.len() > self.max_size
                        || self.limit.is_reached(self.pending.len())
                    {
                        self.complete().await;
                    }
                    if self.pending.is_empty() {
                        timer.as_mut().reset(Instant::now() + self.max_age);
                        armed = true;
                    }
                    self.pending_size += blob.len();
                    self.pending.push(blob);
                }
            }
        }

        self.complete().await;
        debug!("Batcher stopped");
    }

    async fn complete(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        self.pending_size = 0;
        let entries = batch.len();

        match self.downstream.forward(batch).await {
            Ok(()) => self.stats.record_flushed(entries),
            Err(e) => {
                error!("Failed to forward batch of {} entries: {}", entries, e);
                self.stats.record_dropped(entries);
            }
        }
    }
}
