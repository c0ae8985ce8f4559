// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batcher;
pub mod blob_sink;
pub mod compressor_pool;
pub mod config;
pub mod delivery;
pub mod errors;
pub mod event_filter;
pub mod fanout;
pub mod forward;
pub mod globber;
pub mod gzip;
pub mod gzip_writer;
pub mod http_record_sink;
pub mod notifier;
pub mod record_sink;
pub mod reporter;
pub mod stats;
pub mod stream_writer;
pub mod uploader_pool;
pub mod write_request;
pub mod writer;
pub mod writer_controller;
