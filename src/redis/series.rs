//! Sample write path
//!
//! Appends samples to their bucket sorted sets and deletes raw keys.
//!
//! Bucket keys are derived through the same [`BucketLayout`] the range
//! planner uses, so a sample written at `ts` is always found by a query
//! whose range contains `ts`.
//!
//! # Example
//!
//! ```rust
//! use zset_tsdb::redis::{BucketLayout, MemoryStore, TimeSeriesStore};
//!
//! # async fn example() -> zset_tsdb::Result<()> {
//! let store = MemoryStore::new();
//! let mut conn = store.connection();
//! let series = TimeSeriesStore::new(BucketLayout::default());
//!
//! let added = series.write(&mut conn, "app:", "host.cpu", 100, "0.42").await?;
//! assert_eq!(added, 1);
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use crate::types::{validate_series_key, Sample};

use super::keys::BucketLayout;
use super::transport::{query_one, Command, Reply, StoreConnection};

use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Writer for bucketed sample sets
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeSeriesStore {
    layout: BucketLayout,
}

impl TimeSeriesStore {
    /// Create a writer using `layout` for bucket placement
    pub fn new(layout: BucketLayout) -> Self {
        Self { layout }
    }

    /// Bucket layout in use
    pub fn layout(&self) -> BucketLayout {
        self.layout
    }

    /// Append one sample to an explicit bucket key
    ///
    /// Returns 1 when the member was new, 0 when the identical
    /// `(timestamp, value)` pair was already stored.
    pub async fn append_sample(
        &self,
        conn: &mut dyn StoreConnection,
        bucket_key: &str,
        sample: &Sample,
    ) -> Result<u64> {
        self.append_samples(conn, bucket_key, std::slice::from_ref(sample))
            .await
    }

    /// Append several samples to one bucket key in a single ZADD
    pub async fn append_samples(
        &self,
        conn: &mut dyn StoreConnection,
        bucket_key: &str,
        samples: &[Sample],
    ) -> Result<u64> {
        if samples.is_empty() {
            return Ok(0);
        }

        let command = zadd(bucket_key, samples.iter());
        let reply = query_one(conn, command).await?;
        added_count(bucket_key, reply)
    }

    /// Append one sample to the bucket covering its timestamp
    pub async fn write(
        &self,
        conn: &mut dyn StoreConnection,
        prefix: &str,
        series_key: &str,
        timestamp: i64,
        value: &str,
    ) -> Result<u64> {
        validate_series_key(series_key)?;
        let key = self.layout.key_for(prefix, series_key, timestamp);
        let added = self
            .append_sample(conn, &key, &Sample::new(timestamp, value))
            .await?;
        debug!("ZADD {:?} at {} added {}", key, timestamp, added);
        Ok(added)
    }

    /// Append many samples of one series
    ///
    /// Samples are grouped by bucket and sent as one ZADD per bucket, all in
    /// a single pipelined exchange. Returns the total of newly added members.
    pub async fn write_bulk(
        &self,
        conn: &mut dyn StoreConnection,
        prefix: &str,
        series_key: &str,
        samples: &[Sample],
    ) -> Result<u64> {
        validate_series_key(series_key)?;
        if samples.is_empty() {
            return Ok(0);
        }

        let mut by_bucket: BTreeMap<i64, Vec<&Sample>> = BTreeMap::new();
        for sample in samples {
            by_bucket
                .entry(self.layout.bucket_id(sample.timestamp))
                .or_default()
                .push(sample);
        }

        let commands: Vec<Command> = by_bucket
            .iter()
            .map(|(bucket_id, group)| {
                let key = self.layout.bucket_key(prefix, series_key, *bucket_id);
                zadd(&key, group.iter().copied())
            })
            .collect();

        let replies = conn.pipeline(&commands).await?;
        if replies.len() != commands.len() {
            return Err(Error::Connection(format!(
                "pipeline desynchronized: sent {} commands, read {} replies",
                commands.len(),
                replies.len()
            )));
        }

        let mut added = 0;
        for (command, reply) in commands.iter().zip(replies) {
            if let Command::ZAdd { key, .. } = command {
                added += added_count(key, reply)?;
            }
        }
        debug!(
            "Bulk write of {} samples to {} over {} buckets added {}",
            samples.len(),
            series_key,
            commands.len(),
            added
        );
        Ok(added)
    }

    /// Delete raw keys
    ///
    /// Best effort: the DELs go out in one pipeline and per-key failures are
    /// only logged. A transport failure is returned so the caller can drop
    /// the connection. Deleting a series this way leaves its tag index
    /// entries in place; the tag index's `delete_series` removes those too.
    pub async fn delete_keys(
        &self,
        conn: &mut dyn StoreConnection,
        keys: &[String],
    ) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let commands: Vec<Command> = keys
            .iter()
            .map(|key| Command::Del { key: key.clone() })
            .collect();

        let replies = conn.pipeline(&commands).await?;
        let mut deleted = 0;
        for (key, reply) in keys.iter().zip(replies) {
            match reply {
                Reply::Int(n) => deleted += n,
                Reply::Error(e) => warn!("DEL {:?} failed: {}", key, e),
                other => warn!("DEL {:?} returned {:?}", key, other),
            }
        }
        debug!("Deleted {} of {} keys", deleted, keys.len());
        Ok(())
    }
}

fn zadd<'a>(key: &str, samples: impl Iterator<Item = &'a Sample>) -> Command {
    Command::ZAdd {
        key: key.to_string(),
        members: samples.map(|s| (s.timestamp, s.to_member())).collect(),
    }
}

fn added_count(key: &str, reply: Reply) -> Result<u64> {
    reply
        .into_int()
        .map(|n| n.max(0) as u64)
        .map_err(|e| Error::StoreCommand(format!("ZADD {:?}: {}", key, e)))
}
