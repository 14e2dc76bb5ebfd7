//! Database facade
//!
//! [`TimeSeriesDb`] owns the connection pool and one of each component, all
//! built from a [`Config`]. Every operation borrows one pooled connection
//! for its duration and releases it on every path; a connection that saw a
//! transport error is discarded instead of returned.
//!
//! Operations take the key namespace (`prefix`) per call, so one database
//! and its single pool serve any number of namespaces.
//!
//! # Example
//!
//! ```rust,no_run
//! use zset_tsdb::{TagPair, TimeSeriesDb};
//!
//! # async fn example() -> zset_tsdb::Result<()> {
//! let db = TimeSeriesDb::init("tcp", "127.0.0.1:6379").await?;
//!
//! let (series, _) = db
//!     .register_series("app:", "host.cpu", &[TagPair::new("host", "web-1")])
//!     .await?;
//! db.write("app:", &series, 1_700_000_000_000, "0.42").await?;
//!
//! let result = db
//!     .query("app:", &series, 1_699_999_999_000, 1_700_000_001_000)
//!     .await?;
//! assert!(!result.partial);
//! # Ok(())
//! # }
//! ```

use crate::config::Config;
use crate::error::Result;
use crate::redis::{
    ConnectionPool, Connector, HealthStatus, LuaScripts, MetricCatalog, PipelinedExecutor,
    PoolMetricsSnapshot, QueryResult, RangeQueryPlanner, RedisConfig, RedisConnector,
    SetTagsStatus, TagIndex, TimeSeriesStore,
};
use crate::types::{series_key, Sample, TagPair};

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Time-series database over a pooled store
pub struct TimeSeriesDb<C: Connector = RedisConnector> {
    pool: ConnectionPool<C>,
    writer: TimeSeriesStore,
    planner: RangeQueryPlanner,
    executor: PipelinedExecutor,
    tags: TagIndex,
    catalog: MetricCatalog,
}

impl TimeSeriesDb<RedisConnector> {
    /// Connect to Redis over `tcp` (`host:port`) or `unix` (socket path)
    /// with default settings
    pub async fn init(network: &str, address: &str) -> Result<Self> {
        let pool = RedisConfig::from_network(network, address)?;
        let mut config = Config::default();
        config.redis.url = pool.url;
        Self::connect(config).await
    }

    /// Connect to Redis using `config`
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;
        let connector = RedisConnector::new(&config.pool_config())?;
        Self::with_connector(connector, config).await
    }
}

impl<C: Connector> TimeSeriesDb<C> {
    /// Build the database over an arbitrary connector
    ///
    /// Dials one connection eagerly; an unreachable store fails here.
    pub async fn with_connector(connector: C, config: Config) -> Result<Self> {
        config.validate()?;
        let layout = config.bucket_layout()?;
        let scripts = Arc::new(LuaScripts::new());

        let pool = ConnectionPool::new(connector, config.pool_config()).await?;

        info!(
            "Time-series store ready (bucket_width={}, max_pipeline_size={})",
            layout.width(),
            config.query.max_pipeline_size
        );

        Ok(Self {
            pool,
            writer: TimeSeriesStore::new(layout),
            planner: RangeQueryPlanner::new(layout),
            executor: PipelinedExecutor::new(config.query.max_pipeline_size),
            tags: TagIndex::new(Arc::clone(&scripts))
                .with_materialize_ttl(config.materialize_ttl()),
            catalog: MetricCatalog::new(scripts),
        })
    }

    /// The underlying pool
    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    /// Full store key of the bucket that holds `timestamp` for a series
    pub fn bucket_key(&self, prefix: &str, series_key: &str, timestamp: i64) -> String {
        self.planner
            .layout()
            .key_for(prefix, series_key, timestamp)
    }

    /// Append one sample; returns 1 if new, 0 if the identical pair existed
    pub async fn write(
        &self,
        prefix: &str,
        series_key: &str,
        timestamp: i64,
        value: &str,
    ) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        let result = self
            .writer
            .write(&mut *conn, prefix, series_key, timestamp, value)
            .await;
        conn.release(&result);
        result
    }

    /// Append many samples of one series in one pipelined exchange
    pub async fn write_bulk(
        &self,
        prefix: &str,
        series_key: &str,
        samples: &[Sample],
    ) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        let result = self
            .writer
            .write_bulk(&mut *conn, prefix, series_key, samples)
            .await;
        conn.release(&result);
        result
    }

    /// Every sample of a series in `[start, stop]`
    ///
    /// Plans above the pipeline bound fail with
    /// [`Error::OverLimit`](crate::Error::OverLimit) before
    /// a connection is borrowed.
    pub async fn query(
        &self,
        prefix: &str,
        series_key: &str,
        start: i64,
        stop: i64,
    ) -> Result<QueryResult> {
        let plan = self.planner.plan(prefix, series_key, start, stop);
        self.executor.check(&plan)?;
        if plan.is_empty() {
            return Ok(QueryResult::default());
        }

        let mut conn = self.pool.get().await?;
        let result = self.executor.execute(&mut *conn, &plan).await;
        conn.release(&result);
        result
    }

    /// [`query`](Self::query), decoded into samples
    pub async fn query_samples(
        &self,
        prefix: &str,
        series_key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<Sample>> {
        self.query(prefix, series_key, start, stop).await?.samples()
    }

    /// Query several series over the same window on one connection
    ///
    /// Every plan is checked against the pipeline bound before any I/O.
    /// Results come back in input order.
    pub async fn query_many(
        &self,
        prefix: &str,
        series_keys: &[String],
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, QueryResult)>> {
        let plans: Vec<_> = series_keys
            .iter()
            .map(|key| self.planner.plan(prefix, key, start, stop))
            .collect();
        for plan in &plans {
            self.executor.check(plan)?;
        }
        if plans.iter().all(|p| p.is_empty()) {
            return Ok(series_keys
                .iter()
                .map(|key| (key.clone(), QueryResult::default()))
                .collect());
        }

        let mut conn = self.pool.get().await?;
        let mut results = Vec::with_capacity(plans.len());
        for plan in &plans {
            match self.executor.execute(&mut *conn, plan).await {
                Ok(r) => results.push((plan.series_key().to_string(), r)),
                Err(e) => {
                    if e.is_transport() {
                        conn.discard();
                    }
                    return Err(e);
                },
            }
        }
        drop(conn);
        Ok(results)
    }

    /// Register a series under its tag pairs
    pub async fn set_tags(
        &self,
        prefix: &str,
        metric: &str,
        tags: &[TagPair],
        series_key: &str,
    ) -> Result<SetTagsStatus> {
        let mut conn = self.pool.get().await?;
        let result = self
            .tags
            .set_tags(&mut *conn, prefix, metric, tags, series_key)
            .await;
        conn.release(&result);
        result
    }

    /// Derive the series key for a metric and tags, then register it
    pub async fn register_series(
        &self,
        prefix: &str,
        metric: &str,
        tags: &[TagPair],
    ) -> Result<(String, SetTagsStatus)> {
        let key = series_key(metric, tags)?;
        let status = self.set_tags(prefix, metric, tags, &key).await?;
        Ok((key, status))
    }

    /// Materialize registered series, or one tag key's values, into a set
    ///
    /// `output_key` is placed under `prefix`. Returns the member count.
    pub async fn get_tags(
        &self,
        prefix: &str,
        metric: &str,
        target: &str,
        output_key: &str,
    ) -> Result<u64> {
        let output = format!("{}{}", prefix, output_key);
        let mut conn = self.pool.get().await?;
        let result = self
            .tags
            .get_tags(&mut *conn, prefix, metric, target, &output)
            .await;
        conn.release(&result);
        result
    }

    /// Series carrying each tag pair, one slot per filter in input order
    pub async fn get_seq_by_kv(
        &self,
        prefix: &str,
        metric: &str,
        filters: &[TagPair],
    ) -> Result<Vec<Vec<String>>> {
        let mut conn = self.pool.get().await?;
        let result = self
            .tags
            .get_seq_by_kv(&mut *conn, prefix, metric, filters)
            .await;
        conn.release(&result);
        result
    }

    /// Series carrying every one of the tag pairs, sorted
    ///
    /// With no filters, every series registered under the metric.
    pub async fn find_series(
        &self,
        prefix: &str,
        metric: &str,
        filters: &[TagPair],
    ) -> Result<Vec<String>> {
        if filters.is_empty() {
            let mut conn = self.pool.get().await?;
            let result = self
                .tags
                .registered_series(&mut *conn, prefix, metric)
                .await;
            conn.release(&result);
            return result;
        }

        let slots = self.get_seq_by_kv(prefix, metric, filters).await?;
        let mut slots = slots.into_iter();
        let mut matching: BTreeSet<String> = slots.next().unwrap_or_default().into_iter().collect();
        for slot in slots {
            let slot: BTreeSet<String> = slot.into_iter().collect();
            matching.retain(|series| slot.contains(series));
        }
        debug!(
            "{} series of {} match {} filters",
            matching.len(),
            metric,
            filters.len()
        );
        Ok(matching.into_iter().collect())
    }

    /// Metric names under `prefix`
    pub async fn list_metrics(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let result = self.catalog.list_metrics(&mut *conn, prefix).await;
        conn.release(&result);
        result
    }

    /// Series keys of one metric
    pub async fn list_series_keys(&self, prefix: &str, metric: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let result = self
            .catalog
            .list_series_keys(&mut *conn, prefix, metric)
            .await;
        conn.release(&result);
        result
    }

    /// Delete raw store keys (prefix included)
    ///
    /// Fire and forget: every failure, including failing to borrow a
    /// connection, is logged and nothing is returned.
    pub async fn delete_keys(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Deleting {} keys skipped: {}", keys.len(), e);
                return;
            },
        };
        let result = self.writer.delete_keys(&mut *conn, keys).await;
        if let Err(e) = &result {
            warn!("Deleting {} keys failed: {}", keys.len(), e);
        }
        conn.release(&result);
    }

    /// Remove a series: its buckets and every tag index reference
    ///
    /// Returns the number of bucket keys deleted.
    pub async fn delete_series(&self, prefix: &str, metric: &str, series_key: &str) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        let result = self
            .tags
            .delete_series(&mut *conn, prefix, metric, series_key)
            .await;
        conn.release(&result);
        result
    }

    /// PING the store through the pool
    pub async fn health_check(&self) -> HealthStatus {
        self.pool.health_check().await
    }

    /// Pool counters
    pub fn pool_metrics(&self) -> PoolMetricsSnapshot {
        self.pool.metrics()
    }

    /// Close the pool; later operations fail with a connection error
    pub fn close(&self) {
        self.pool.close();
    }
}
