// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Operational counters.
//!
//! Errors that workers absorb (a dropped glob, a record that ran out of
//! attempts) are never returned to a caller; they show up here instead. All
//! counters use relaxed ordering, so a snapshot taken while workers are
//! running is eventually consistent.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for a glob or batch aggregator.
#[derive(Debug, Default)]
pub struct AggregatorStats {
    entries_received: AtomicU64,
    units_flushed: AtomicU64,
    entries_flushed: AtomicU64,
    units_dropped: AtomicU64,
    entries_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorSnapshot {
    pub entries_received: u64,
    pub units_flushed: u64,
    pub entries_flushed: u64,
    pub units_dropped: u64,
    pub entries_dropped: u64,
}

impl AggregatorStats {
    pub(crate) fn record_received(&self) {
        self.entries_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flushed(&self, entries: usize) {
        self.units_flushed.fetch_add(1, Ordering::Relaxed);
        self.entries_flushed
            .fetch_add(entries as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, entries: usize) {
        self.units_dropped.fetch_add(1, Ordering::Relaxed);
        self.entries_dropped
            .fetch_add(entries as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AggregatorSnapshot {
        AggregatorSnapshot {
            entries_received: self.entries_received.load(Ordering::Relaxed),
            units_flushed: self.units_flushed.load(Ordering::Relaxed),
            entries_flushed: self.entries_flushed.load(Ordering::Relaxed),
            units_dropped: self.units_dropped.load(Ordering::Relaxed),
            entries_dropped: self.entries_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Which bucket a per-record delivery failure falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Throttled,
    InternalError,
    Unknown,
}

impl FailureKind {
    pub fn from_error_code(code: &str) -> Self {
        match code {
            "ProvisionedThroughputExceededException" => FailureKind::Throttled,
            "InternalFailure" | "ServiceUnavailableException" => FailureKind::InternalError,
            _ => FailureKind::Unknown,
        }
    }
}

/// Counters for one delivery stream.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    put_records_attempted: AtomicU64,
    put_records_length: AtomicU64,
    put_records_errors: AtomicU64,
    records_failed_throttled: AtomicU64,
    records_failed_internal_error: AtomicU64,
    records_failed_unknown: AtomicU64,
    records_succeeded: AtomicU64,
    records_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySnapshot {
    /// Sink calls made.
    pub put_records_attempted: u64,
    /// Records carried by those calls, retries included.
    pub put_records_length: u64,
    /// Calls that failed as a whole.
    pub put_records_errors: u64,
    pub records_failed_throttled: u64,
    pub records_failed_internal_error: u64,
    pub records_failed_unknown: u64,
    pub records_succeeded: u64,
    pub records_dropped: u64,
}

impl DeliveryStats {
    pub(crate) fn record_attempt(&self, records: usize) {
        self.put_records_attempted.fetch_add(1, Ordering::Relaxed);
        self.put_records_length
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_call_error(&self) {
        self.put_records_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, kind: FailureKind) {
        let counter = match kind {
            FailureKind::Throttled => &self.records_failed_throttled,
            FailureKind::InternalError => &self.records_failed_internal_error,
            FailureKind::Unknown => &self.records_failed_unknown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_succeeded(&self, records: usize) {
        self.records_succeeded
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, records: usize) {
        self.records_dropped
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            put_records_attempted: self.put_records_attempted.load(Ordering::Relaxed),
            put_records_length: self.put_records_length.load(Ordering::Relaxed),
            put_records_errors: self.put_records_errors.load(Ordering::Relaxed),
            records_failed_throttled: self.records_failed_throttled.load(Ordering::Relaxed),
            records_failed_internal_error: self
                .records_failed_internal_error
                .load(Ordering::Relaxed),
            records_failed_unknown: self.records_failed_unknown.load(Ordering::Relaxed),
            records_succeeded: self.records_succeeded.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
        }
    }
}
