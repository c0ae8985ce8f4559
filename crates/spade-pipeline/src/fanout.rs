// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sends every request to several writers at once.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::error;

use crate::errors::WriterError;
use crate::write_request::WriteRequest;
use crate::writer::EventWriter;

pub struct FanOut {
    targets: Vec<Arc<dyn EventWriter>>,
}

impl FanOut {
    pub fn new(targets: Vec<Arc<dyn EventWriter>>) -> Self {
        Self { targets }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[async_trait]
impl EventWriter for FanOut {
    /// Target failures are logged. One failing target never blocks the rest.
    async fn write(&self, request: Arc<WriteRequest>) -> Result<(), WriterError> {
        for (writer_index, target) in self.targets.iter().enumerate() {
            if let Err(e) = target.write(request.clone()).await {
                error!(writer_index, "Failed to write to target: {}", e);
            }
        }
        Ok(())
    }

    async fn rotate(&self) -> Result<bool, WriterError> {
        let mut all_done = true;
        for (writer_index, target) in self.targets.iter().enumerate() {
            match target.rotate().await {
                Ok(done) => all_done &= done,
                Err(e) => {
                    error!(writer_index, "Failed to rotate target: {}", e);
                    all_done = false;
                }
            }
        }
        Ok(all_done)
    }

    async fn close(&self) -> Result<(), WriterError> {
        let results = join_all(self.targets.iter().map(|target| target.close())).await;
        for (writer_index, result) in results.into_iter().enumerate() {
            if let Err(e) = result {
                error!(writer_index, "Failed to close target: {}", e);
            }
        }
        Ok(())
    }
}
