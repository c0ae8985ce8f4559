// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::SubmitError;

/// Where an aggregator hands every completed unit. Forwarding may wait for
/// the downstream queue to have room.
#[async_trait]
pub trait Forward<T: Send + 'static>: Send + Sync {
    async fn forward(&self, item: T) -> Result<(), SubmitError>;
}

#[async_trait]
impl<T: Send + 'static> Forward<T> for mpsc::Sender<T> {
    async fn forward(&self, item: T) -> Result<(), SubmitError> {
        self.send(item).await.map_err(|_| SubmitError::Closed)
    }
}
