//! Tag inverted index
//!
//! Per metric, two structures are kept:
//!
//! ```text
//! {prefix}{metric}\tTagHash   → HASH {"k=v" → "series\tseries..."}
//! {prefix}{metric}\tTagList   → SET of every registered series key
//! ```
//!
//! Every series key appearing in a TagHash value is also in the TagList.
//! Only the `set_tags` and `delete_series` scripts write these keys, and
//! each runs as one atomic unit, so the invariant holds for every reader.

use crate::error::{Error, Result};
use crate::types::{validate_name, validate_series_key, TagPair, FIELD_SEPARATOR};

use super::keys::{bucket_key_prefix, escape_glob, tag_hash_key, tag_list_key};
use super::scripts::{LuaScripts, ScriptName};
use super::transport::{query_one, Command, Reply, StoreConnection};

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default lifetime of sets materialized by `get_tags`
pub const DEFAULT_MATERIALIZE_TTL: Duration = Duration::from_secs(300);

/// Outcome of registering a series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SetTagsStatus {
    /// The series was new to the metric's TagList
    Registered,
    /// The series was already registered; its tag entries were refreshed
    AlreadyRegistered,
}

/// Secondary index from tag pairs to series keys
#[derive(Debug, Clone)]
pub struct TagIndex {
    scripts: Arc<LuaScripts>,
    materialize_ttl: Duration,
}

impl TagIndex {
    /// Create an index using the shared script registry
    pub fn new(scripts: Arc<LuaScripts>) -> Self {
        Self {
            scripts,
            materialize_ttl: DEFAULT_MATERIALIZE_TTL,
        }
    }

    /// Set the lifetime of sets materialized by `get_tags`
    ///
    /// Zero leaves them without expiry.
    pub fn with_materialize_ttl(mut self, ttl: Duration) -> Self {
        self.materialize_ttl = ttl;
        self
    }

    /// Register `series_key` under each tag pair and in the metric's TagList
    ///
    /// Runs as one script: either every TagHash field and the TagList entry
    /// are updated, or none are. Re-registering a series is harmless.
    pub async fn set_tags(
        &self,
        conn: &mut dyn StoreConnection,
        prefix: &str,
        metric: &str,
        tags: &[TagPair],
        series_key: &str,
    ) -> Result<SetTagsStatus> {
        validate_name("metric", metric)?;
        validate_series_key(series_key)?;
        for tag in tags {
            tag.validate()?;
        }

        let keys = [tag_hash_key(prefix, metric), tag_list_key(prefix, metric)];
        let mut args = Vec::with_capacity(tags.len() + 1);
        args.push(series_key.to_string());
        args.extend(tags.iter().map(TagPair::encode));

        let reply = self
            .run(conn, ScriptName::SetTags, &keys, &args)
            .await?;
        let status = match script_int(ScriptName::SetTags, reply)? {
            0 => SetTagsStatus::AlreadyRegistered,
            _ => SetTagsStatus::Registered,
        };
        debug!(
            "Tagged {} under {} with {} pairs: {:?}",
            series_key,
            metric,
            tags.len(),
            status
        );
        Ok(status)
    }

    /// Materialize registered series, or one tag key's values, into `output_key`
    ///
    /// With an empty `target` every registered series key of the metric is
    /// copied; otherwise the distinct `target=value` pairs carried by the
    /// registered series are. The output key is replaced and given the
    /// materialization TTL. Returns the number of members written.
    pub async fn get_tags(
        &self,
        conn: &mut dyn StoreConnection,
        prefix: &str,
        metric: &str,
        target: &str,
        output_key: &str,
    ) -> Result<u64> {
        validate_name("metric", metric)?;
        if !target.is_empty() {
            validate_name("tag key", target)?;
        }
        if output_key.is_empty() {
            return Err(Error::InvalidInput("output key cannot be empty".to_string()));
        }

        let keys = [tag_list_key(prefix, metric), output_key.to_string()];
        let args = [
            target.to_string(),
            self.materialize_ttl.as_secs().to_string(),
        ];

        let reply = self.run(conn, ScriptName::GetTags, &keys, &args).await?;
        let count = script_int(ScriptName::GetTags, reply)?;
        Ok(count.max(0) as u64)
    }

    /// Look up the series carrying each tag pair
    ///
    /// One HMGET on the metric's TagHash. The result has one slot per
    /// filter, in input order; a pair nothing carries yields an empty slot.
    /// Slots are not intersected.
    pub async fn get_seq_by_kv(
        &self,
        conn: &mut dyn StoreConnection,
        prefix: &str,
        metric: &str,
        filters: &[TagPair],
    ) -> Result<Vec<Vec<String>>> {
        validate_name("metric", metric)?;
        for filter in filters {
            filter.validate()?;
        }
        if filters.is_empty() {
            return Ok(Vec::new());
        }

        let key = tag_hash_key(prefix, metric);
        let command = Command::HMGet {
            key: key.clone(),
            fields: filters.iter().map(TagPair::encode).collect(),
        };
        let values = query_one(conn, command)
            .await?
            .into_optional_strings()
            .map_err(|e| Error::StoreCommand(format!("HMGET {:?}: {}", key, e)))?;

        if values.len() != filters.len() {
            return Err(Error::StoreCommand(format!(
                "HMGET {:?} returned {} slots for {} fields",
                key,
                values.len(),
                filters.len()
            )));
        }

        Ok(values
            .into_iter()
            .map(|slot| match slot {
                Some(joined) => joined
                    .split(FIELD_SEPARATOR)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
                None => Vec::new(),
            })
            .collect())
    }

    /// Every series key registered under a metric, sorted
    pub async fn registered_series(
        &self,
        conn: &mut dyn StoreConnection,
        prefix: &str,
        metric: &str,
    ) -> Result<Vec<String>> {
        validate_name("metric", metric)?;
        let key = tag_list_key(prefix, metric);
        let mut series = query_one(conn, Command::SMembers { key: key.clone() })
            .await?
            .into_strings()
            .map_err(|e| Error::StoreCommand(format!("SMEMBERS {:?}: {}", key, e)))?;
        series.sort();
        Ok(series)
    }

    /// Remove a series entirely
    ///
    /// Deletes its bucket keys, strips it from every TagHash value (dropping
    /// fields left empty) and removes it from the TagList, all in one
    /// script. Returns the number of bucket keys deleted.
    pub async fn delete_series(
        &self,
        conn: &mut dyn StoreConnection,
        prefix: &str,
        metric: &str,
        series_key: &str,
    ) -> Result<u64> {
        validate_name("metric", metric)?;
        validate_series_key(series_key)?;
        let belongs = series_key == metric
            || series_key
                .strip_prefix(metric)
                .is_some_and(|rest| rest.starts_with('{'));
        if !belongs {
            return Err(Error::InvalidInput(format!(
                "series {:?} does not belong to metric {:?}",
                series_key, metric
            )));
        }

        let bucket_prefix = bucket_key_prefix(prefix, series_key);
        let keys = [tag_hash_key(prefix, metric), tag_list_key(prefix, metric)];
        let args = [
            series_key.to_string(),
            format!("{}*", escape_glob(&bucket_prefix)),
            bucket_prefix,
        ];

        let reply = self
            .run(conn, ScriptName::DeleteSeries, &keys, &args)
            .await?;
        let removed = script_int(ScriptName::DeleteSeries, reply)?.max(0) as u64;
        debug!("Deleted series {} ({} buckets)", series_key, removed);
        Ok(removed)
    }

    async fn run(
        &self,
        conn: &mut dyn StoreConnection,
        name: ScriptName,
        keys: &[String],
        args: &[String],
    ) -> Result<Reply> {
        conn.invoke_script(self.scripts.get(name), keys, args)
            .await
            .inspect_err(|e| warn!("Script {} failed: {}", name, e))
    }
}

fn script_int(name: ScriptName, reply: Reply) -> Result<i64> {
    reply.into_int().map_err(|message| Error::Script {
        script: name.to_string(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::memory::MemoryStore;

    fn index() -> TagIndex {
        TagIndex::new(Arc::new(LuaScripts::new()))
    }

    fn tags(pairs: &[(&str, &str)]) -> Vec<TagPair> {
        pairs.iter().map(|(k, v)| TagPair::new(*k, *v)).collect()
    }

    #[tokio::test]
    async fn test_set_tags_registers_pairs_and_list() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        let idx = index();

        let status = idx
            .set_tags(&mut conn, "p:", "cpu", &tags(&[("host", "a"), ("dc", "x")]), "cpu{dc=x,host=a}")
            .await
            .unwrap();
        assert_eq!(status, SetTagsStatus::Registered);

        let status = idx
            .set_tags(&mut conn, "p:", "cpu", &tags(&[("host", "b"), ("dc", "x")]), "cpu{dc=x,host=b}")
            .await
            .unwrap();
        assert_eq!(status, SetTagsStatus::Registered);

        assert_eq!(
            store.hash_get("p:cpu\tTagHash", "dc=x").as_deref(),
            Some("cpu{dc=x,host=a}\tcpu{dc=x,host=b}")
        );
        assert_eq!(
            store.set_members("p:cpu\tTagList"),
            vec!["cpu{dc=x,host=a}", "cpu{dc=x,host=b}"]
        );
    }

    #[tokio::test]
    async fn test_set_tags_is_idempotent() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        let idx = index();
        let pairs = tags(&[("host", "a")]);

        idx.set_tags(&mut conn, "", "cpu", &pairs, "cpu{host=a}")
            .await
            .unwrap();
        let status = idx
            .set_tags(&mut conn, "", "cpu", &pairs, "cpu{host=a}")
            .await
            .unwrap();
        assert_eq!(status, SetTagsStatus::AlreadyRegistered);
        assert_eq!(store.hash_get("cpu\tTagHash", "host=a").as_deref(), Some("cpu{host=a}"));
    }

    #[tokio::test]
    async fn test_set_tags_wrong_type_writes_nothing() {
        let store = MemoryStore::new();
        store.insert_string("cpu\tTagList", "oops");
        let mut conn = store.connection();

        let err = index()
            .set_tags(&mut conn, "", "cpu", &tags(&[("host", "a")]), "cpu{host=a}")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Script { .. }));
        assert!(!store.contains_key("cpu\tTagHash"));
    }

    #[tokio::test]
    async fn test_set_tags_rejects_reserved_characters() {
        let store = MemoryStore::new();
        let mut conn = store.connection();

        let err = index()
            .set_tags(&mut conn, "", "cpu", &tags(&[("ho,st", "a")]), "cpu")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(store.stats().scripts, 0);
    }

    #[tokio::test]
    async fn test_get_seq_by_kv_slots_follow_input_order() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        let idx = index();
        idx.set_tags(&mut conn, "", "cpu", &tags(&[("host", "a")]), "cpu{host=a}")
            .await
            .unwrap();
        idx.set_tags(&mut conn, "", "cpu", &tags(&[("dc", "x")]), "cpu{dc=x}")
            .await
            .unwrap();

        let slots = idx
            .get_seq_by_kv(&mut conn, "", "cpu", &tags(&[("dc", "x"), ("host", "zz"), ("host", "a")]))
            .await
            .unwrap();
        assert_eq!(
            slots,
            vec![vec!["cpu{dc=x}".to_string()], vec![], vec!["cpu{host=a}".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_get_seq_by_kv_without_filters_does_no_io() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        let slots = index().get_seq_by_kv(&mut conn, "", "cpu", &[]).await.unwrap();
        assert!(slots.is_empty());
        assert_eq!(store.stats().pipelines, 0);
    }

    #[tokio::test]
    async fn test_get_tags_materializes() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        let idx = index().with_materialize_ttl(Duration::from_secs(60));
        idx.set_tags(&mut conn, "", "cpu", &tags(&[("host", "a"), ("dc", "x")]), "cpu{dc=x,host=a}")
            .await
            .unwrap();
        idx.set_tags(&mut conn, "", "cpu", &tags(&[("host", "b"), ("dc", "x")]), "cpu{dc=x,host=b}")
            .await
            .unwrap();

        assert_eq!(idx.get_tags(&mut conn, "", "cpu", "", "out").await.unwrap(), 2);
        assert_eq!(
            store.set_members("out"),
            vec!["cpu{dc=x,host=a}", "cpu{dc=x,host=b}"]
        );
        assert_eq!(store.ttl("out"), Some(60));

        assert_eq!(idx.get_tags(&mut conn, "", "cpu", "host", "out").await.unwrap(), 2);
        assert_eq!(store.set_members("out"), vec!["host=a", "host=b"]);

        assert_eq!(idx.get_tags(&mut conn, "", "cpu", "rack", "out").await.unwrap(), 0);
        assert!(!store.contains_key("out"));
    }

    #[tokio::test]
    async fn test_get_tags_wrong_type_keeps_previous_output() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        let idx = index();
        idx.set_tags(&mut conn, "", "cpu", &tags(&[("host", "a")]), "cpu{host=a}")
            .await
            .unwrap();
        idx.get_tags(&mut conn, "", "cpu", "", "out").await.unwrap();

        store.insert_string("mem\tTagList", "not a set");
        let err = idx
            .get_tags(&mut conn, "", "mem", "", "out")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Script { ref message, .. } if message.contains("WRONGTYPE")));
        assert_eq!(store.set_members("out"), vec!["cpu{host=a}"]);
    }

    #[tokio::test]
    async fn test_delete_series_removes_every_reference() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        let idx = index();
        idx.set_tags(&mut conn, "p:", "cpu", &tags(&[("host", "a"), ("dc", "x")]), "cpu{dc=x,host=a}")
            .await
            .unwrap();
        idx.set_tags(&mut conn, "p:", "cpu", &tags(&[("host", "b"), ("dc", "x")]), "cpu{dc=x,host=b}")
            .await
            .unwrap();
        store.insert_string("p:cpu{dc=x,host=a}\t0", "placeholder");
        store.insert_string("p:cpu{dc=x,host=a}\t-3", "placeholder");
        store.insert_string("p:cpu{dc=x,host=ab}\t0", "other series");

        let removed = idx
            .delete_series(&mut conn, "p:", "cpu", "cpu{dc=x,host=a}")
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(store.contains_key("p:cpu{dc=x,host=ab}\t0"));
        assert_eq!(store.hash_get("p:cpu\tTagHash", "host=a"), None);
        assert_eq!(
            store.hash_get("p:cpu\tTagHash", "dc=x").as_deref(),
            Some("cpu{dc=x,host=b}")
        );
        assert_eq!(store.set_members("p:cpu\tTagList"), vec!["cpu{dc=x,host=b}"]);
    }

    #[tokio::test]
    async fn test_delete_series_checks_metric() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        let err = index()
            .delete_series(&mut conn, "", "cpu", "mem{host=a}")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
