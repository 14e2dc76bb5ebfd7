//! Redis-backed time-series storage
//!
//! Samples live in score-sorted sets, one per series per time bucket; a
//! per-metric hash and set form the tag inverted index.
//!
//! # Architecture
//!
//! ```text
//! Redis Schema:
//! {prefix}{series}\t{bucket_id}   → ZSET(timestamp → "timestamp\tvalue")
//! {prefix}{metric}\tTagHash       → HASH {"k=v" → "series\tseries..."}
//! {prefix}{metric}\tTagList       → SET of series keys
//! ```
//!
//! # Features
//!
//! - Connection pooling with health checks on borrow
//! - Range queries split into per-bucket sub-queries, sent as one pipeline
//! - A hard bound on sub-queries per logical query
//! - Atomic tag index maintenance via Lua scripts
//! - Metric and series discovery
//! - An in-process store for tests
//!
//! # Example
//!
//! ```rust
//! use zset_tsdb::redis::{MemoryStore, PipelinedExecutor, RangeQueryPlanner, TimeSeriesStore};
//!
//! # async fn example() -> zset_tsdb::Result<()> {
//! let store = MemoryStore::new();
//! let mut conn = store.connection();
//!
//! let writer = TimeSeriesStore::default();
//! writer.write(&mut conn, "", "host.cpu", 100, "0.42").await?;
//!
//! let plan = RangeQueryPlanner::default().plan("", "host.cpu", 90, 110);
//! let result = PipelinedExecutor::default().execute(&mut conn, &plan).await?;
//! assert_eq!(result.members, vec!["100\t0.42"]);
//! # Ok(())
//! # }
//! ```

// Store access
pub mod connection;
pub mod memory;
pub mod transport;
pub mod util;

// Data layout and scripts
pub mod keys;
pub mod scripts;

// Operations
pub mod catalog;
pub mod executor;
pub mod query;
pub mod series;
pub mod tags;

// Re-export main types
pub use catalog::MetricCatalog;
pub use connection::{
    ConnectionPool, Connector, HealthStatus, PoolMetricsSnapshot, PooledConnection, RedisConfig,
    RedisConnector, RetryPolicy,
};
pub use executor::{PipelinedExecutor, QueryResult, DEFAULT_MAX_PIPELINE_SIZE};
pub use keys::{BucketLayout, DEFAULT_BUCKET_WIDTH_MS};
pub use memory::{MemoryConnection, MemoryConnector, MemoryStats, MemoryStore};
pub use query::{BucketRange, QueryPlan, RangeQueryPlanner};
pub use scripts::{LuaScript, LuaScripts, ScriptName};
pub use series::TimeSeriesStore;
pub use tags::{SetTagsStatus, TagIndex};
pub use transport::{Command, Reply, StoreConnection};
