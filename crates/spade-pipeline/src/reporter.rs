// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::write_request::{FailMode, WriteResult};

/// Receives the outcome of every request the file path handles.
pub trait Reporter: Send + Sync {
    fn record(&self, result: WriteResult);

    /// Counts per failure description.
    fn report(&self) -> HashMap<String, u64>;
}

/// Counts results per [`FailMode`].
#[derive(Debug, Default)]
pub struct StatsReporter {
    counts: Mutex<HashMap<FailMode, u64>>,
}

impl StatsReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, mode: FailMode) -> u64 {
        #[allow(clippy::expect_used)]
        let counts = self.counts.lock().expect("lock poisoned");
        counts.get(&mode).copied().unwrap_or(0)
    }
}

impl Reporter for StatsReporter {
    fn record(&self, result: WriteResult) {
        debug!(
            category = %result.category,
            failure = %result.failure,
            duration_ms = result.duration.as_millis() as u64,
            "Recorded write result"
        );
        #[allow(clippy::expect_used)]
        let mut counts = self.counts.lock().expect("lock poisoned");
        *counts.entry(result.failure).or_insert(0) += 1;
    }

    fn report(&self) -> HashMap<String, u64> {
        #[allow(clippy::expect_used)]
        let counts = self.counts.lock().expect("lock poisoned");
        counts
            .iter()
            .map(|(mode, count)| (mode.description().to_string(), *count))
            .collect()
    }
}
