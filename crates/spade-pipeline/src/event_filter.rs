// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Declarative predicates that decide whether an event reaches a stream.
//!
//! A filter is configured either by one of the historical names
//! (`"isVod"`, `"isUserIDSet"`, `"isChannelIDSet"`) or as a tagged object:
//!
//! ```json
//! {"Strategy": "NotInSet", "Field": "vod_type", "Values": ["clip"]}
//! ```
//!
//! Unknown names fail deserialization, so a bad filter is a configuration
//! error rather than a silently ignored one.

use std::collections::{BTreeSet, HashMap};

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawFilter")]
pub enum EventFilter {
    /// The field is present and non-empty.
    Present { field: String },
    /// The field's value (empty when missing) is one of `values`.
    InSet {
        field: String,
        values: BTreeSet<String>,
    },
    /// The field's value (empty when missing) is none of `values`.
    NotInSet {
        field: String,
        values: BTreeSet<String>,
    },
    /// Every nested filter matches.
    All { filters: Vec<EventFilter> },
}

impl EventFilter {
    pub fn matches(&self, fields: &HashMap<String, String>) -> bool {
        let value = |field: &str| fields.get(field).map(String::as_str).unwrap_or("");
        match self {
            EventFilter::Present { field } => !value(field).is_empty(),
            EventFilter::InSet { field, values } => values.contains(value(field)),
            EventFilter::NotInSet { field, values } => !values.contains(value(field)),
            EventFilter::All { filters } => filters.iter().all(|f| f.matches(fields)),
        }
    }

    fn named(name: &str) -> Option<Self> {
        let present = |field: &str| EventFilter::Present {
            field: field.to_string(),
        };
        match name {
            "isVod" => Some(EventFilter::All {
                filters: vec![
                    present("vod_id"),
                    EventFilter::NotInSet {
                        field: "vod_type".to_string(),
                        values: BTreeSet::from(["clip".to_string()]),
                    },
                ],
            }),
            "isUserIDSet" => Some(present("user_id")),
            "isChannelIDSet" => Some(present("channel_id")),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "Strategy", rename_all_fields = "PascalCase")]
enum FilterSpec {
    Present {
        field: String,
    },
    InSet {
        field: String,
        values: BTreeSet<String>,
    },
    NotInSet {
        field: String,
        values: BTreeSet<String>,
    },
    All {
        filters: Vec<EventFilter>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFilter {
    Named(String),
    Spec(FilterSpec),
}

impl TryFrom<RawFilter> for EventFilter {
    type Error = String;

    fn try_from(raw: RawFilter) -> Result<Self, Self::Error> {
        match raw {
            RawFilter::Named(name) => {
                EventFilter::named(&name).ok_or_else(|| format!("unknown filter: {name}"))
            }
            RawFilter::Spec(FilterSpec::Present { field }) => Ok(EventFilter::Present { field }),
            RawFilter::Spec(FilterSpec::InSet { field, values }) => {
                Ok(EventFilter::InSet { field, values })
            }
            RawFilter::Spec(FilterSpec::NotInSet { field, values }) => {
                Ok(EventFilter::NotInSet { field, values })
            }
            RawFilter::Spec(FilterSpec::All { filters }) => Ok(EventFilter::All { filters }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_named_is_vod_filter() {
        let filter: EventFilter = serde_json::from_str(r#""isVod""#).unwrap();

        assert!(filter.matches(&fields(&[("vod_id", "v123"), ("vod_type", "archive")])));
        assert!(filter.matches(&fields(&[("vod_id", "v123")])));
        assert!(!filter.matches(&fields(&[("vod_id", "v123"), ("vod_type", "clip")])));
        assert!(!filter.matches(&fields(&[("vod_type", "archive")])));
    }

    #[test]
    fn test_named_id_filters() {
        let user: EventFilter = serde_json::from_str(r#""isUserIDSet""#).unwrap();
        let channel: EventFilter = serde_json::from_str(r#""isChannelIDSet""#).unwrap();

        assert!(user.matches(&fields(&[("user_id", "42")])));
        assert!(!user.matches(&fields(&[("user_id", "")])));
        assert!(channel.matches(&fields(&[("channel_id", "7")])));
        assert!(!channel.matches(&fields(&[])));
    }

    #[test]
    fn test_unknown_named_filter_is_rejected() {
        let result: Result<EventFilter, _> = serde_json::from_str(r#""isNotAThing""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_set_membership_strategies() {
        let in_set: EventFilter = serde_json::from_str(
            r#"{"Strategy": "InSet", "Field": "platform", "Values": ["web", "ios"]}"#,
        )
        .unwrap();
        let not_in_set: EventFilter = serde_json::from_str(
            r#"{"Strategy": "NotInSet", "Field": "platform", "Values": ["web", "ios"]}"#,
        )
        .unwrap();

        let web = fields(&[("platform", "web")]);
        let android = fields(&[("platform", "android")]);
        assert!(in_set.matches(&web));
        assert!(!in_set.matches(&android));
        assert!(!not_in_set.matches(&web));
        assert!(not_in_set.matches(&android));
        assert!(not_in_set.matches(&fields(&[])));
    }

    #[test]
    fn test_nested_all_strategy() {
        let filter: EventFilter = serde_json::from_str(
            r#"{"Strategy": "All", "Filters": ["isUserIDSet", {"Strategy": "Present", "Field": "channel"}]}"#,
        )
        .unwrap();

        assert!(filter.matches(&fields(&[("user_id", "1"), ("channel", "c")])));
        assert!(!filter.matches(&fields(&[("user_id", "1")])));
    }
}
