// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::WriterError;
use crate::write_request::WriteRequest;

/// A destination for processed events.
#[async_trait]
pub trait EventWriter: Send + Sync {
    /// Queues `request`, waiting while the writer's inbound queue is full.
    async fn write(&self, request: Arc<WriteRequest>) -> Result<(), WriterError>;

    /// Hands off buffered output if the writer's thresholds say so. Returns
    /// whether everything that needed rotating was rotated.
    async fn rotate(&self) -> Result<bool, WriterError>;

    /// Drains pending writes and releases the writer's resources.
    async fn close(&self) -> Result<(), WriterError>;
}
