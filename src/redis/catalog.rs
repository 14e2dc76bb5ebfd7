//! Metric and series discovery
//!
//! Both listings run as read-only scripts that SCAN the keyspace under a
//! prefix. They see every key shape the crate writes: bucket keys, TagHash
//! and TagList keys.
//!
//! SCAN walks the whole keyspace, so these are administrative operations,
//! not something to call per query.

use crate::error::{Error, Result};
use crate::types::validate_name;

use super::keys::{escape_glob, tag_list_key};
use super::scripts::{LuaScripts, ScriptName};
use super::transport::StoreConnection;

use std::sync::Arc;
use tracing::{debug, warn};

/// Namespace browser
#[derive(Debug, Clone)]
pub struct MetricCatalog {
    scripts: Arc<LuaScripts>,
}

impl MetricCatalog {
    /// Create a catalog using the shared script registry
    pub fn new(scripts: Arc<LuaScripts>) -> Self {
        Self { scripts }
    }

    /// Distinct metric names with at least one key under `prefix`, sorted
    pub async fn list_metrics(
        &self,
        conn: &mut dyn StoreConnection,
        prefix: &str,
    ) -> Result<Vec<String>> {
        let args = [prefix.to_string(), format!("{}*", escape_glob(prefix))];
        let metrics = self.run(conn, ScriptName::ListMetrics, &[], &args).await?;
        debug!("Found {} metrics under {:?}", metrics.len(), prefix);
        Ok(metrics)
    }

    /// Distinct series keys of `metric`, sorted
    ///
    /// Includes series registered through the tag index and series that
    /// only have sample buckets.
    pub async fn list_series_keys(
        &self,
        conn: &mut dyn StoreConnection,
        prefix: &str,
        metric: &str,
    ) -> Result<Vec<String>> {
        validate_name("metric", metric)?;
        let keys = [tag_list_key(prefix, metric)];
        let args = [
            prefix.to_string(),
            metric.to_string(),
            format!("{}{}*", escape_glob(prefix), escape_glob(metric)),
        ];
        self.run(conn, ScriptName::ListSeriesKeys, &keys, &args).await
    }

    async fn run(
        &self,
        conn: &mut dyn StoreConnection,
        name: ScriptName,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<String>> {
        let reply = match conn.invoke_script(self.scripts.get(name), keys, args).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Script {} failed: {}", name, e);
                return Err(e);
            },
        };

        let mut names = reply.into_strings().map_err(|message| {
            warn!("Script {} returned an unexpected reply: {}", name, message);
            Error::Script {
                script: name.to_string(),
                message,
            }
        })?;
        names.sort();
        names.dedup();
        Ok(names)
    }
}
