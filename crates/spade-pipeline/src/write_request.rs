// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Outcome of processing one event upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailMode {
    #[default]
    None,
    UnableToParseData,
    NonTrackingEvent,
    BadColumnConversion,
    FailedWrite,
    EmptyRequest,
    SkippedColumn,
    UnknownError,
    PanickedInProcessing,
    FailedTransport,
}

impl FailMode {
    pub const ALL: [FailMode; 10] = [
        FailMode::None,
        FailMode::UnableToParseData,
        FailMode::NonTrackingEvent,
        FailMode::BadColumnConversion,
        FailMode::FailedWrite,
        FailMode::EmptyRequest,
        FailMode::SkippedColumn,
        FailMode::UnknownError,
        FailMode::PanickedInProcessing,
        FailMode::FailedTransport,
    ];

    pub fn description(&self) -> &'static str {
        match self {
            FailMode::None => "Success",
            FailMode::UnableToParseData => "Malformed Data",
            FailMode::NonTrackingEvent => "Untracked Event",
            FailMode::BadColumnConversion => "Badly Typed Columns",
            FailMode::FailedWrite => "Failed To Write",
            FailMode::EmptyRequest => "Empty Request",
            FailMode::SkippedColumn => "Missing One or More Columns",
            FailMode::UnknownError => "Unknown Failure",
            FailMode::PanickedInProcessing => "Panicked in Processing",
            FailMode::FailedTransport => "Failed in Transport",
        }
    }

    /// Whether the event still counts as tracked output.
    pub fn is_success(&self) -> bool {
        matches!(self, FailMode::None | FailMode::SkippedColumn)
    }
}

impl fmt::Display for FailMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A processed event, ready for the file path or the stream path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WriteRequest {
    pub category: String,
    pub version: u32,
    /// Rendered line written to local files.
    pub line: String,
    /// Field map used by stream writers.
    #[serde(default)]
    pub record: HashMap<String, String>,
    #[serde(rename = "UUID", default)]
    pub uuid: String,
    #[serde(default)]
    pub failure: FailMode,
    /// When upstream started processing the event.
    #[serde(default = "SystemTime::now", with = "unix_millis")]
    pub started_at: SystemTime,
}

impl WriteRequest {
    /// `<category>.v<version>`, the name of this event's output files.
    pub fn category_version(&self) -> String {
        format!("{}.v{}", self.category, self.version)
    }

    pub fn result(&self) -> WriteResult {
        let finished_at = SystemTime::now();
        WriteResult {
            failure: self.failure,
            uuid: self.uuid.clone(),
            line: self.line.clone(),
            category: self.category.clone(),
            finished_at,
            duration: finished_at
                .duration_since(self.started_at)
                .unwrap_or(Duration::ZERO),
        }
    }
}

/// What a [`crate::reporter::Reporter`] learns about one processed request.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    pub failure: FailMode,
    pub uuid: String,
    pub line: String,
    pub category: String,
    pub finished_at: SystemTime,
    pub duration: Duration,
}

mod unix_millis {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SystemTime, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + Duration::from_millis(millis))
    }
}
