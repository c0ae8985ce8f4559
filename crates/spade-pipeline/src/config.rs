// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Declarative configuration for the stream path.
//!
//! Field names follow the JSON surface the processor configs are written in
//! (`MaxSize`, `MaxAge`, ...). Durations are strings such as `"10s"` or
//! `"250ms"`. Every config is validated once at construction time and the
//! parsed values are kept alongside, so runtime code never re-parses.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::ConfigError;
use crate::event_filter::EventFilter;

fn parse_positive_duration(field: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    let parsed =
        humantime::parse_duration(raw.trim()).map_err(|e| ConfigError::InvalidDuration {
            field,
            reason: e.to_string(),
        })?;
    if parsed.is_zero() {
        return Err(ConfigError::NotPositive { field });
    }
    Ok(parsed)
}

fn require_positive(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::NotPositive { field });
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct GlobberConfig {
    /// Max size per glob before compression, framing included.
    pub max_size: usize,
    /// Max age of the oldest entry in the glob.
    pub max_age: String,
    /// Capacity of the inbound queue. Smaller values stall submitters
    /// sooner; larger values lengthen shutdown.
    pub buffer_length: usize,
}

impl GlobberConfig {
    /// Returns the parsed `MaxAge` if the config is valid.
    pub fn validate(&self) -> Result<Duration, ConfigError> {
        let max_age = parse_positive_duration("MaxAge", &self.max_age)?;
        require_positive("MaxSize", self.max_size)?;
        require_positive("BufferLength", self.buffer_length)?;
        Ok(max_age)
    }
}

/// Upper bound on the number of entries in one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryLimit {
    Unbounded,
    AtMost(usize),
}

impl EntryLimit {
    /// Sentinel used in configs for "no entry limit".
    pub const UNBOUNDED_SENTINEL: i64 = -1;

    pub fn from_config(value: i64) -> Result<Self, ConfigError> {
        match value {
            Self::UNBOUNDED_SENTINEL => Ok(EntryLimit::Unbounded),
            n if n > 0 => usize::try_from(n)
                .map(EntryLimit::AtMost)
                .map_err(|_| ConfigError::InvalidMaxEntries(n)),
            n => Err(ConfigError::InvalidMaxEntries(n)),
        }
    }

    pub fn is_reached(&self, entries: usize) -> bool {
        match self {
            EntryLimit::Unbounded => false,
            EntryLimit::AtMost(max) => entries >= *max,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct BatcherConfig {
    /// Max combined size of the entries in one batch.
    pub max_size: usize,
    /// Max number of entries per batch, or -1 for no limit.
    pub max_entries: i64,
    pub max_age: String,
    pub buffer_length: usize,
}

impl BatcherConfig {
    /// Returns the parsed `MaxAge` and entry limit if the config is valid.
    pub fn validate(&self) -> Result<(Duration, EntryLimit), ConfigError> {
        let max_age = parse_positive_duration("MaxAge", &self.max_age)?;
        require_positive("MaxSize", self.max_size)?;
        let limit = EntryLimit::from_config(self.max_entries)?;
        require_positive("BufferLength", self.buffer_length)?;
        Ok((max_age, limit))
    }
}

/// Which managed stream service a [`crate::stream_writer::StreamWriter`] writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stream,
    Firehose,
}

impl std::str::FromStr for StreamType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(StreamType::Stream),
            "firehose" => Ok(StreamType::Firehose),
            other => Err(ConfigError::UnknownStreamType(other.to_string())),
        }
    }
}

/// Per-event settings for a stream writer.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct EventConfig {
    #[serde(default)]
    pub filter: Option<EventFilter>,
    pub fields: Vec<String>,
    #[serde(default)]
    pub field_renames: HashMap<String, String>,
}

impl EventConfig {
    /// Source field → output field, with renames applied.
    pub fn full_field_map(&self) -> Vec<(String, String)> {
        self.fields
            .iter()
            .map(|field| {
                let target = self
                    .field_renames
                    .get(field)
                    .cloned()
                    .unwrap_or_else(|| field.clone());
                (field.clone(), target)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct StreamWriterConfig {
    pub stream_name: String,
    /// Either `"stream"` or `"firehose"`.
    pub stream_type: String,
    /// Deflate-compress records into globs instead of sending JSON.
    #[serde(default)]
    pub compress: bool,
    /// Send top-level JSON for Firehose → Redshift streaming.
    #[serde(default)]
    pub firehose_redshift_stream: bool,
    /// Field to write the event's name to (useful for uncompressed streams).
    #[serde(default)]
    pub event_name_target_field: Option<String>,
    #[serde(default)]
    pub exclude_empty_fields: bool,
    pub buffer_size: usize,
    pub max_attempts_per_record: usize,
    pub retry_delay: String,
    #[serde(default)]
    pub events: HashMap<String, EventConfig>,
    pub globber: GlobberConfig,
    pub batcher: BatcherConfig,
}

/// A [`StreamWriterConfig`] that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedStreamConfig {
    pub raw: StreamWriterConfig,
    pub stream_type: StreamType,
    pub retry_delay: Duration,
}

impl StreamWriterConfig {
    pub fn validate(self) -> Result<ValidatedStreamConfig, ConfigError> {
        if self.stream_type.is_empty() {
            return Err(ConfigError::Missing("StreamType"));
        }
        if self.stream_name.is_empty() {
            return Err(ConfigError::Missing("StreamName"));
        }
        let stream_type: StreamType = self.stream_type.parse()?;

        self.globber
            .validate()
            .map_err(|e| ConfigError::Globber(Box::new(e)))?;
        self.batcher
            .validate()
            .map_err(|e| ConfigError::Batcher(Box::new(e)))?;

        if self.firehose_redshift_stream && (stream_type != StreamType::Firehose || self.compress)
        {
            return Err(ConfigError::RedshiftStreamingMisconfigured);
        }
        require_positive("BufferSize", self.buffer_size)?;
        require_positive("MaxAttemptsPerRecord", self.max_attempts_per_record)?;

        let retry_delay = humantime::parse_duration(self.retry_delay.trim()).map_err(|e| {
            ConfigError::InvalidDuration {
                field: "RetryDelay",
                reason: e.to_string(),
            }
        })?;

        Ok(ValidatedStreamConfig {
            raw: self,
            stream_type,
            retry_delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn globber(max_size: usize, max_age: &str, buffer_length: usize) -> GlobberConfig {
        GlobberConfig {
            max_size,
            max_age: max_age.to_string(),
            buffer_length,
        }
    }

    fn batcher(max_entries: i64) -> BatcherConfig {
        BatcherConfig {
            max_size: 1024,
            max_entries,
            max_age: "1s".to_string(),
            buffer_length: 8,
        }
    }

    fn stream_config() -> StreamWriterConfig {
        serde_json::from_str(
            r#"{
                "StreamName": "spade-downstream",
                "StreamType": "firehose",
                "Compress": false,
                "FirehoseRedshiftStream": true,
                "BufferSize": 64,
                "MaxAttemptsPerRecord": 3,
                "RetryDelay": "100ms",
                "Events": {
                    "minute-watched": {
                        "Fields": ["channel", "vod_id"],
                        "FieldRenames": {"channel": "channel_name"},
                        "Filter": {"Strategy": "Present", "Field": "vod_id"}
                    }
                },
                "Globber": {"MaxSize": 990000, "MaxAge": "1s", "BufferLength": 1024},
                "Batcher": {"MaxSize": 990000, "MaxEntries": 500, "MaxAge": "1s", "BufferLength": 1024}
            }"#,
        )
        .expect("valid stream config json")
    }

    #[test]
    fn test_globber_config_validation() {
        assert_eq!(
            globber(10, "1s", 4).validate(),
            Ok(Duration::from_secs(1))
        );
        assert_eq!(
            globber(0, "1s", 4).validate(),
            Err(ConfigError::NotPositive { field: "MaxSize" })
        );
        assert_eq!(
            globber(10, "1s", 0).validate(),
            Err(ConfigError::NotPositive {
                field: "BufferLength"
            })
        );
        assert_eq!(
            globber(10, "0s", 4).validate(),
            Err(ConfigError::NotPositive { field: "MaxAge" })
        );
        assert!(matches!(
            globber(10, "soon", 4).validate(),
            Err(ConfigError::InvalidDuration { field: "MaxAge", .. })
        ));
    }

    #[test]
    fn test_batcher_max_entries_sentinel() {
        assert_eq!(
            batcher(-1).validate().map(|(_, limit)| limit),
            Ok(EntryLimit::Unbounded)
        );
        assert_eq!(
            batcher(3).validate().map(|(_, limit)| limit),
            Ok(EntryLimit::AtMost(3))
        );
        assert_eq!(
            batcher(0).validate(),
            Err(ConfigError::InvalidMaxEntries(0))
        );
        assert_eq!(
            batcher(-2).validate(),
            Err(ConfigError::InvalidMaxEntries(-2))
        );
    }

    #[test]
    fn test_entry_limit_is_reached() {
        assert!(!EntryLimit::Unbounded.is_reached(usize::MAX));
        assert!(!EntryLimit::AtMost(2).is_reached(1));
        assert!(EntryLimit::AtMost(2).is_reached(2));
    }

    #[test]
    fn test_stream_config_parses_and_validates() {
        let validated = stream_config().validate().expect("valid config");
        assert_eq!(validated.stream_type, StreamType::Firehose);
        assert_eq!(validated.retry_delay, Duration::from_millis(100));

        let event = &validated.raw.events["minute-watched"];
        assert_eq!(
            event.full_field_map(),
            vec![
                ("channel".to_string(), "channel_name".to_string()),
                ("vod_id".to_string(), "vod_id".to_string()),
            ]
        );
        assert_eq!(
            event.filter,
            Some(EventFilter::Present {
                field: "vod_id".to_string()
            })
        );
    }

    #[test]
    fn test_redshift_streaming_requires_uncompressed_firehose() {
        let mut config = stream_config();
        config.compress = true;
        assert_eq!(
            config.validate().err(),
            Some(ConfigError::RedshiftStreamingMisconfigured)
        );

        let mut config = stream_config();
        config.stream_type = "stream".to_string();
        assert_eq!(
            config.validate().err(),
            Some(ConfigError::RedshiftStreamingMisconfigured)
        );
    }

    #[test]
    fn test_stream_config_rejects_nested_and_top_level_errors() {
        let mut config = stream_config();
        config.globber.max_age = "forever".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Globber(inner)) if matches!(*inner, ConfigError::InvalidDuration { .. })
        ));

        let mut config = stream_config();
        config.batcher.max_entries = 0;
        assert_eq!(
            config.validate().err(),
            Some(ConfigError::Batcher(Box::new(ConfigError::InvalidMaxEntries(0))))
        );

        let mut config = stream_config();
        config.stream_type = "queue".to_string();
        assert_eq!(
            config.validate().err(),
            Some(ConfigError::UnknownStreamType("queue".to_string()))
        );

        let mut config = stream_config();
        config.stream_name = String::new();
        assert_eq!(
            config.validate().err(),
            Some(ConfigError::Missing("StreamName"))
        );

        let mut config = stream_config();
        config.retry_delay = "a while".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDuration {
                field: "RetryDelay",
                ..
            })
        ));
    }
}
