//! Core data types shared by the write path, the planner and the tag index
//!
//! # Key Types
//!
//! - **`Sample`**: A single measurement (timestamp + opaque string value)
//! - **`TagPair`**: One tag key-value pair, encoded as `key=value`
//! - **`series_key`**: Deterministic series identifier from metric + tags
//!
//! # Example
//!
//! ```rust
//! use zset_tsdb::types::{series_key, Sample, TagPair};
//!
//! let sample = Sample::new(100, "0.42");
//! assert_eq!(sample.to_member(), "100\t0.42");
//!
//! let tags = vec![TagPair::new("host", "a"), TagPair::new("dc", "eu")];
//! assert_eq!(series_key("cpu", &tags).unwrap(), "cpu{dc=eu,host=a}");
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between the timestamp and the value inside a sorted-set member,
/// and between fields of every structural key.
pub const FIELD_SEPARATOR: char = '\t';

/// Characters that would break key or tag encoding
const RESERVED_CHARS: [char; 5] = ['\t', '{', '}', ',', '='];

/// A single timestamped sample
///
/// Stored as the sorted-set member `"{timestamp}\t{value}"` scored by
/// `timestamp`, so two samples collapse only when both fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sample {
    /// Timestamp (milliseconds by convention; the bucket width decides)
    pub timestamp: i64,
    /// Opaque value
    pub value: String,
}

impl Sample {
    /// Create a new sample
    pub fn new(timestamp: i64, value: impl Into<String>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }

    /// Encode as a sorted-set member
    pub fn to_member(&self) -> String {
        format!("{}{}{}", self.timestamp, FIELD_SEPARATOR, self.value)
    }

    /// Decode a sorted-set member produced by [`Sample::to_member`]
    ///
    /// Only the first separator is significant, so values may contain tabs.
    pub fn from_member(member: &str) -> Result<Self> {
        let (ts, value) = member.split_once(FIELD_SEPARATOR).ok_or_else(|| {
            Error::StoreCommand(format!("malformed sample member: {:?}", member))
        })?;
        let timestamp = ts.parse::<i64>().map_err(|e| {
            Error::StoreCommand(format!("malformed sample timestamp {:?}: {}", ts, e))
        })?;
        Ok(Self::new(timestamp, value))
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.timestamp, self.value)
    }
}

/// One tag key-value pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TagPair {
    /// Tag key
    pub key: String,
    /// Tag value
    pub value: String,
}

impl TagPair {
    /// Create a new tag pair
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Parse the `key=value` encoding
    pub fn parse(encoded: &str) -> Result<Self> {
        let (key, value) = encoded.split_once('=').ok_or_else(|| {
            Error::InvalidInput(format!("tag {:?} is not of the form key=value", encoded))
        })?;
        let pair = Self::new(key, value);
        pair.validate()?;
        Ok(pair)
    }

    /// Encode as the TagHash field name
    pub fn encode(&self) -> String {
        format!("{}={}", self.key, self.value)
    }

    /// Reject keys or values that cannot round-trip through the encoding
    pub fn validate(&self) -> Result<()> {
        validate_name("tag key", &self.key)?;
        validate_name("tag value", &self.value)
    }
}

impl fmt::Display for TagPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Check that a metric name, tag key or tag value is encodable
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput(format!("{} cannot be empty", kind)));
    }
    if let Some(c) = name.chars().find(|c| RESERVED_CHARS.contains(c)) {
        return Err(Error::InvalidInput(format!(
            "{} {:?} contains reserved character {:?}",
            kind, name, c
        )));
    }
    Ok(())
}

/// Check that a series key can be embedded in bucket keys and TagHash values
pub fn validate_series_key(series_key: &str) -> Result<()> {
    if series_key.is_empty() {
        return Err(Error::InvalidInput("series key cannot be empty".to_string()));
    }
    if series_key.contains(FIELD_SEPARATOR) {
        return Err(Error::InvalidInput(format!(
            "series key {:?} contains a tab",
            series_key
        )));
    }
    Ok(())
}

/// Derive the series key for a metric and its tags
///
/// `metric` alone when there are no tags, otherwise `metric{k1=v1,k2=v2}`
/// with pairs sorted, so the same tag set always yields the same key.
pub fn series_key(metric: &str, tags: &[TagPair]) -> Result<String> {
    validate_name("metric", metric)?;
    if tags.is_empty() {
        return Ok(metric.to_string());
    }

    let mut sorted: Vec<&TagPair> = tags.iter().collect();
    for tag in &sorted {
        tag.validate()?;
    }
    sorted.sort();
    sorted.dedup();

    let body: Vec<String> = sorted.iter().map(|t| t.encode()).collect();
    Ok(format!("{}{{{}}}", metric, body.join(",")))
}

/// Split a series key back into its metric and tags
pub fn parse_series_key(key: &str) -> Result<(String, Vec<TagPair>)> {
    match key.split_once('{') {
        None => {
            validate_name("metric", key)?;
            Ok((key.to_string(), Vec::new()))
        },
        Some((metric, rest)) => {
            let body = rest.strip_suffix('}').ok_or_else(|| {
                Error::InvalidInput(format!("series key {:?} has an unclosed tag list", key))
            })?;
            validate_name("metric", metric)?;
            let tags = body
                .split(',')
                .map(TagPair::parse)
                .collect::<Result<Vec<_>>>()?;
            Ok((metric.to_string(), tags))
        },
    }
}
