//! Pipelined execution of bucket plans
//!
//! One logical query becomes one pipelined exchange: every ZRANGEBYSCORE is
//! sent before any reply is read, then exactly one reply per bucket is
//! drained in send order.
//!
//! The pipeline bound is enforced before any I/O. A plan above it fails
//! fast with [`Error::OverLimit`]; it is never split or throttled.
//!
//! Per-bucket failures do not fail the query. Buckets with no samples are
//! the common case and are skipped silently; buckets whose reply was an
//! error are skipped too but counted, and mark the result as partial.

use crate::error::{Error, Result};
use crate::types::Sample;

use super::query::QueryPlan;
use super::transport::{Command, Reply, StoreConnection};

use serde::Serialize;
use tracing::{debug, warn};

/// Default bound on sub-requests per logical query
pub const DEFAULT_MAX_PIPELINE_SIZE: usize = 8000;

/// Outcome of one range query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryResult {
    /// Raw sorted-set members, concatenated in bucket order
    pub members: Vec<String>,
    /// Number of buckets queried
    pub buckets: u64,
    /// Number of buckets whose reply was an error
    pub failed_buckets: u64,
    /// True when at least one bucket failed, so `members` may be incomplete
    pub partial: bool,
}

impl QueryResult {
    /// Whether no sample was returned
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Number of members returned
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Decode the members into samples
    pub fn samples(&self) -> Result<Vec<Sample>> {
        self.members.iter().map(|m| Sample::from_member(m)).collect()
    }
}

/// Executor enforcing the per-query pipeline bound
#[derive(Debug, Clone, Copy)]
pub struct PipelinedExecutor {
    max_pipeline_size: usize,
}

impl PipelinedExecutor {
    /// Create an executor with the given bound
    pub fn new(max_pipeline_size: usize) -> Self {
        Self { max_pipeline_size }
    }

    /// Configured bound
    pub fn max_pipeline_size(&self) -> usize {
        self.max_pipeline_size
    }

    /// Reject plans above the bound
    pub fn check(&self, plan: &QueryPlan) -> Result<()> {
        let requested = plan.len();
        if requested > self.max_pipeline_size as u64 {
            return Err(Error::OverLimit {
                start: plan.start(),
                stop: plan.stop(),
                requested_buckets: requested,
                limit: self.max_pipeline_size,
            });
        }
        Ok(())
    }

    /// Execute a plan as one pipelined exchange
    ///
    /// A reply count different from the number of commands sent means the
    /// reply stream is out of step with the requests; that is reported as a
    /// connection error so the caller discards the connection.
    pub async fn execute(
        &self,
        conn: &mut dyn StoreConnection,
        plan: &QueryPlan,
    ) -> Result<QueryResult> {
        self.check(plan)?;

        if plan.is_empty() {
            return Ok(QueryResult::default());
        }

        let commands: Vec<Command> = plan
            .iter()
            .map(|bucket| Command::ZRangeByScore {
                key: bucket.key,
                min: bucket.from,
                max: bucket.to,
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

        let mut result = QueryResult {
            buckets: commands.len() as u64,
            ..Default::default()
        };

        for (command, reply) in commands.iter().zip(replies) {
            match reply {
                Reply::Nil => {},
                Reply::Error(e) => {
                    result.failed_buckets += 1;
                    if let Command::ZRangeByScore { key, .. } = command {
                        debug!("Bucket {:?} failed, treating as empty: {}", key, e);
                    }
                },
                other => match other.into_strings() {
                    Ok(members) => result.members.extend(members),
                    Err(e) => {
                        result.failed_buckets += 1;
                        debug!("Unexpected bucket reply, treating as empty: {}", e);
                    },
                },
            }
        }

        result.partial = result.failed_buckets > 0;
        if result.partial {
            warn!(
                "Query of {} over {} - {} is partial: {} of {} buckets failed",
                plan.series_key(),
                plan.start(),
                plan.stop(),
                result.failed_buckets,
                result.buckets
            );
        }

        Ok(result)
    }
}

impl Default for PipelinedExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PIPELINE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::keys::BucketLayout;
    use crate::redis::memory::MemoryStore;
    use crate::redis::query::RangeQueryPlanner;
    use crate::redis::scripts::LuaScript;
    use async_trait::async_trait;

    fn planner() -> RangeQueryPlanner {
        RangeQueryPlanner::new(BucketLayout::new(100).unwrap())
    }

    /// Connection that answers with a fixed reply list
    struct ScriptedConnection {
        replies: Vec<Reply>,
        sent: Vec<Command>,
    }

    #[async_trait]
    impl StoreConnection for ScriptedConnection {
        async fn ping(&mut self) -> Result<()> {
            Ok(())
        }

        async fn pipeline(&mut self, commands: &[Command]) -> Result<Vec<Reply>> {
            self.sent.extend_from_slice(commands);
            Ok(std::mem::take(&mut self.replies))
        }

        async fn invoke_script(
            &mut self,
            _script: &LuaScript,
            _keys: &[String],
            _args: &[String],
        ) -> Result<Reply> {
            Ok(Reply::Nil)
        }
    }

    #[tokio::test]
    async fn test_over_limit_sends_nothing() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        let executor = PipelinedExecutor::new(3);
        let plan = planner().plan("p:", "cpu", 0, 399);

        let err = executor.execute(&mut conn, &plan).await.unwrap_err();
        match err {
            Error::OverLimit {
                start,
                stop,
                requested_buckets,
                limit,
            } => {
                assert_eq!((start, stop), (0, 399));
                assert_eq!(requested_buckets, 4);
                assert_eq!(limit, 3);
            },
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(store.stats().pipelines, 0);
        assert_eq!(store.stats().commands, 0);
    }

    #[tokio::test]
    async fn test_plan_at_limit_is_accepted() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        let executor = PipelinedExecutor::new(4);
        let plan = planner().plan("p:", "cpu", 0, 399);

        let result = executor.execute(&mut conn, &plan).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(result.buckets, 4);
        assert_eq!(store.stats().pipelines, 1);
        assert_eq!(store.stats().commands, 4);
    }

    #[tokio::test]
    async fn test_empty_plan_does_no_io() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        let plan = planner().plan("p:", "cpu", 10, 0);

        let result = PipelinedExecutor::default()
            .execute(&mut conn, &plan)
            .await
            .unwrap();
        assert!(result.is_empty());
        assert!(!result.partial);
        assert_eq!(store.stats().pipelines, 0);
    }

    #[tokio::test]
    async fn test_results_concatenate_in_bucket_order() {
        let mut conn = ScriptedConnection {
            replies: vec![
                Reply::Array(vec![Reply::Text("5\ta".into())]),
                Reply::Array(vec![]),
                Reply::Array(vec![Reply::Text("205\tc".into()), Reply::Text("250\td".into())]),
            ],
            sent: Vec::new(),
        };
        let plan = planner().plan("p:", "cpu", 0, 299);

        let result = PipelinedExecutor::default()
            .execute(&mut conn, &plan)
            .await
            .unwrap();
        assert_eq!(result.members, vec!["5\ta", "205\tc", "250\td"]);
        assert!(!result.partial);

        let keys: Vec<&str> = conn
            .sent
            .iter()
            .map(|c| match c {
                Command::ZRangeByScore { key, .. } => key.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(keys, vec!["p:cpu\t0", "p:cpu\t1", "p:cpu\t2"]);
    }

    #[tokio::test]
    async fn test_failed_bucket_is_skipped_and_flagged() {
        let mut conn = ScriptedConnection {
            replies: vec![
                Reply::Error("WRONGTYPE".into()),
                Reply::Array(vec![Reply::Text("150\tb".into())]),
                Reply::Int(3),
            ],
            sent: Vec::new(),
        };
        let plan = planner().plan("p:", "cpu", 0, 299);

        let result = PipelinedExecutor::default()
            .execute(&mut conn, &plan)
            .await
            .unwrap();
        assert_eq!(result.members, vec!["150\tb"]);
        assert_eq!(result.failed_buckets, 2);
        assert!(result.partial);
    }

    #[tokio::test]
    async fn test_reply_count_mismatch_is_a_connection_error() {
        let mut conn = ScriptedConnection {
            replies: vec![Reply::Nil],
            sent: Vec::new(),
        };
        let plan = planner().plan("p:", "cpu", 0, 299);

        let err = PipelinedExecutor::default()
            .execute(&mut conn, &plan)
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn test_samples_decode() {
        let result = QueryResult {
            members: vec!["100\t0.42".to_string()],
            ..Default::default()
        };
        assert_eq!(result.samples().unwrap(), vec![Sample::new(100, "0.42")]);
    }
}
