//! zset-tsdb - Time-series storage on Redis sorted sets
//!
//! This library provides a time-series layer over Redis with:
//! - Samples bucketed by time into score-sorted sets
//! - Arbitrary time-window queries split into bounded, pipelined sub-queries
//! - A tag inverted index maintained by atomic server-side scripts
//! - Metric and series discovery
//! - A pooled, health-checked connection layer
//!
//! Durability, replication and persistence are Redis's concern.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

/// Configuration management with TOML support
pub mod config;

/// Redis storage layout, scripts, pool and query execution
pub mod redis;

/// Database facade tying the pool and components together
pub mod db;

// Re-export main types
pub use config::Config;
pub use db::TimeSeriesDb;
pub use error::{Error, Result};
pub use types::{parse_series_key, series_key, Sample, TagPair};
