// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};

use anyhow::Context;
use flate2::Compression;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use spade_pipeline::{
    blob_sink::{EdgeKeyNameGenerator, LocalDirBlobSink, ProcessorKeyNameGenerator},
    compressor_pool::CompressorPool,
    fanout::FanOut,
    gzip_writer::UPLOAD_DIR,
    http_record_sink::HttpRecordSink,
    notifier::{
        ErrorNotifier, KeyOnlyNotifier, LoggingPublisher, MessagePublisher,
        PublishingErrorNotifier, RowCopyNotifier,
    },
    reporter::{Reporter, StatsReporter},
    stream_writer::StreamWriter,
    uploader_pool::{UploadRetry, Uploader, UploaderPool},
    write_request::WriteRequest,
    writer::EventWriter,
    writer_controller::{ControllerConfig, WriterController},
};

mod config;

const NONTRACKED_PREFIX: &str = "nontracked.";

#[tokio::main]
pub async fn main() {
    let log_level = env::var("SPADE_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    if let Err(e) = run().await {
        error!("spade-processor stopped: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = config::Config::new()?;
    info!(folder = %config.folder.display(), "Starting spade processor");

    let compressors = CompressorPool::new(config.compressors, Compression::default());
    let blobs = Arc::new(LocalDirBlobSink::new(&config.blob_dir));
    let publisher: Arc<dyn MessagePublisher> = Arc::new(LoggingPublisher);
    let error_notifier: Arc<dyn ErrorNotifier> =
        Arc::new(PublishingErrorNotifier::new(publisher.clone()));

    let events_pool = UploaderPool::start(
        config.upload_workers,
        Uploader::new(
            config.events_bucket.clone(),
            Arc::new(ProcessorKeyNameGenerator {
                group: config.group.clone(),
                node: config.node.clone(),
            }),
            blobs.clone(),
            UploadRetry::default(),
        ),
        Arc::new(RowCopyNotifier::new(publisher.clone())),
        error_notifier.clone(),
    );
    let nontracked_pool = UploaderPool::start(
        config.upload_workers,
        Uploader::new(
            config.nontracked_bucket.clone(),
            Arc::new(EdgeKeyNameGenerator {
                group: config.group.clone(),
                node: config.node.clone(),
            }),
            blobs,
            UploadRetry::default(),
        ),
        Arc::new(KeyOnlyNotifier::new(publisher)),
        error_notifier,
    );

    let staging = config.folder.join(UPLOAD_DIR);
    events_pool
        .handle()
        .upload_directory(&staging, |name| !name.starts_with(NONTRACKED_PREFIX))
        .await
        .context("queueing leftover event files")?;
    nontracked_pool
        .handle()
        .upload_directory(&staging, |name| name.starts_with(NONTRACKED_PREFIX))
        .await
        .context("queueing leftover non-tracked files")?;

    let reporter = Arc::new(StatsReporter::new());
    let controller = WriterController::new(ControllerConfig {
        folder: config.folder.clone(),
        reporter: reporter.clone(),
        events_uploader: events_pool.handle(),
        nontracked_uploader: nontracked_pool.handle(),
        compressors: compressors.clone(),
        conditions: config.conditions,
        nontracked_conditions: config.nontracked_conditions,
    })
    .await
    .context("opening local writers")?;

    let mut targets: Vec<Arc<dyn EventWriter>> = vec![Arc::new(controller)];
    let stream = match config.stream {
        Some(settings) => {
            let sink = HttpRecordSink::new(settings.endpoint, settings.timeout)
                .context("building record sink")?;
            let writer = Arc::new(
                StreamWriter::new(settings.writer, Arc::new(sink), compressors)
                    .context("starting stream writer")?,
            );
            info!(stream = writer.stream_name(), "Stream writer enabled");
            targets.push(writer.clone());
            Some(writer)
        }
        None => None,
    };
    let writer = FanOut::new(targets);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut rotate_interval = interval(config.rotate_interval);
    rotate_interval.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match serde_json::from_str::<WriteRequest>(&line) {
                        Ok(request) => {
                            if let Err(e) = writer.write(Arc::new(request)).await {
                                error!("Failed to write request: {}", e);
                            }
                        }
                        Err(e) => warn!("Skipping malformed request: {}", e),
                    },
                    Ok(None) => {
                        info!("Input closed, shutting down");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read input: {}", e);
                        break;
                    }
                }
            }
            _ = rotate_interval.tick() => {
                match writer.rotate().await {
                    Ok(all_done) => debug!(all_done, "Rotation pass finished"),
                    Err(e) => error!("Failed to rotate: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    writer.close().await.context("closing writers")?;
    events_pool.close().await;
    nontracked_pool.close().await;

    for (description, count) in reporter.report() {
        info!(count, "{}", description);
    }
    if let Some(stream) = stream {
        info!(stream = stream.stream_name(), stats = ?stream.stats(), "Stream delivery totals");
    }
    Ok(())
}
