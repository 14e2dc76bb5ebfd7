//! Store transport seam
//!
//! Every component talks to the store through [`StoreConnection`]. The trait
//! is deliberately narrow: a liveness probe, a pipelined exchange and script
//! invocation. The Redis implementation lives here; an in-process
//! implementation for tests lives in [`super::memory`].
//!
//! # Pipelining contract
//!
//! [`StoreConnection::pipeline`] sends every command before reading any
//! reply, then reads back exactly one [`Reply`] per command in send order.
//! A command that fails on the server yields [`Reply::Error`] in its slot;
//! only a transport failure turns the whole call into an `Err`.

use crate::error::{Error, Result};

use super::scripts::LuaScript;

use async_trait::async_trait;
use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::Value;

/// A command that can be issued inside a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `ZADD key score member [score member ...]`
    ZAdd {
        /// Sorted-set key
        key: String,
        /// `(score, member)` pairs
        members: Vec<(i64, String)>,
    },
    /// `ZRANGEBYSCORE key min max` (both bounds inclusive)
    ZRangeByScore {
        /// Sorted-set key
        key: String,
        /// Lower score bound
        min: i64,
        /// Upper score bound
        max: i64,
    },
    /// `HMGET key field [field ...]`
    HMGet {
        /// Hash key
        key: String,
        /// Fields to read
        fields: Vec<String>,
    },
    /// `SMEMBERS key`
    SMembers {
        /// Set key
        key: String,
    },
    /// `DEL key`
    Del {
        /// Key to delete
        key: String,
    },
}

impl Command {
    /// Command name, for logs and error messages
    pub fn name(&self) -> &'static str {
        match self {
            Command::ZAdd { .. } => "ZADD",
            Command::ZRangeByScore { .. } => "ZRANGEBYSCORE",
            Command::HMGet { .. } => "HMGET",
            Command::SMembers { .. } => "SMEMBERS",
            Command::Del { .. } => "DEL",
        }
    }

    fn to_redis(&self) -> redis::Cmd {
        match self {
            Command::ZAdd { key, members } => {
                let mut cmd = redis::cmd("ZADD");
                cmd.arg(key);
                for (score, member) in members {
                    cmd.arg(*score).arg(member);
                }
                cmd
            },
            Command::ZRangeByScore { key, min, max } => {
                let mut cmd = redis::cmd("ZRANGEBYSCORE");
                cmd.arg(key).arg(*min).arg(*max);
                cmd
            },
            Command::HMGet { key, fields } => {
                let mut cmd = redis::cmd("HMGET");
                cmd.arg(key).arg(fields);
                cmd
            },
            Command::SMembers { key } => {
                let mut cmd = redis::cmd("SMEMBERS");
                cmd.arg(key);
                cmd
            },
            Command::Del { key } => {
                let mut cmd = redis::cmd("DEL");
                cmd.arg(key);
                cmd
            },
        }
    }
}

/// A single reply read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Missing value
    Nil,
    /// Integer reply
    Int(i64),
    /// Bulk or status string
    Text(String),
    /// Multi-bulk reply
    Array(Vec<Reply>),
    /// The command failed on the server
    Error(String),
}

impl Reply {
    /// Interpret as an integer count
    pub fn into_int(self) -> std::result::Result<i64, String> {
        match self {
            Reply::Int(n) => Ok(n),
            Reply::Text(s) => s
                .parse()
                .map_err(|_| format!("expected integer, got {:?}", s)),
            Reply::Error(e) => Err(e),
            other => Err(format!("expected integer, got {:?}", other)),
        }
    }

    /// Interpret as a list of strings; nil counts as an empty list
    pub fn into_strings(self) -> std::result::Result<Vec<String>, String> {
        match self {
            Reply::Nil => Ok(Vec::new()),
            Reply::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Reply::Text(s) => Ok(s),
                    Reply::Int(n) => Ok(n.to_string()),
                    other => Err(format!("expected string element, got {:?}", other)),
                })
                .collect(),
            Reply::Error(e) => Err(e),
            other => Err(format!("expected array, got {:?}", other)),
        }
    }

    /// Interpret as a list of optional strings (HMGET shape)
    pub fn into_optional_strings(self) -> std::result::Result<Vec<Option<String>>, String> {
        match self {
            Reply::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Reply::Nil => Ok(None),
                    Reply::Text(s) => Ok(Some(s)),
                    other => Err(format!("expected string or nil, got {:?}", other)),
                })
                .collect(),
            Reply::Error(e) => Err(e),
            other => Err(format!("expected array, got {:?}", other)),
        }
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        match value {
            Value::Nil => Reply::Nil,
            Value::Int(n) => Reply::Int(n),
            Value::BulkString(bytes) => Reply::Text(String::from_utf8_lossy(&bytes).into_owned()),
            Value::SimpleString(s) => Reply::Text(s),
            Value::Okay => Reply::Text("OK".to_string()),
            Value::Array(items) | Value::Set(items) => {
                Reply::Array(items.into_iter().map(Reply::from).collect())
            },
            Value::ServerError(e) => Reply::Error(format!("{:?}", e)),
            // RESP3-only shapes this layer never asks for
            other => Reply::Error(format!("unexpected reply {:?}", other)),
        }
    }
}

/// A connection to the underlying store
#[async_trait]
pub trait StoreConnection: Send {
    /// Liveness probe used for health checks on borrow
    async fn ping(&mut self) -> Result<()>;

    /// Issue `commands` as one pipelined exchange
    ///
    /// Returns exactly one reply per command, in send order.
    async fn pipeline(&mut self, commands: &[Command]) -> Result<Vec<Reply>>;

    /// Run a server-side script atomically
    async fn invoke_script(
        &mut self,
        script: &LuaScript,
        keys: &[String],
        args: &[String],
    ) -> Result<Reply>;
}

/// Issue a single command and return its reply
pub async fn query_one(conn: &mut dyn StoreConnection, command: Command) -> Result<Reply> {
    let name = command.name();
    let mut replies = conn.pipeline(std::slice::from_ref(&command)).await?;
    match (replies.pop(), replies.is_empty()) {
        (Some(reply), true) => Ok(reply),
        _ => Err(Error::Connection(format!(
            "{} produced an unexpected number of replies",
            name
        ))),
    }
}

fn transport_error(context: &str, e: &redis::RedisError) -> Error {
    // Only the error kind: the full message may echo connection details
    Error::Connection(format!("{}: {:?}", context, e.kind()))
}

#[async_trait]
impl StoreConnection for MultiplexedConnection {
    async fn ping(&mut self) -> Result<()> {
        redis::cmd("PING")
            .query_async::<String>(self)
            .await
            .map(|_| ())
            .map_err(|e| transport_error("PING failed", &e))
    }

    async fn pipeline(&mut self, commands: &[Command]) -> Result<Vec<Reply>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for command in commands {
            pipe.add_command(command.to_redis());
        }

        // Raw replies: a command that failed on the server comes back as a
        // ServerError value in its own slot instead of failing the exchange.
        let values = ConnectionLike::req_packed_commands(self, &pipe, 0, commands.len())
            .await
            .map_err(|e| transport_error("pipeline failed", &e))?;

        Ok(values.into_iter().map(Reply::from).collect())
    }

    async fn invoke_script(
        &mut self,
        script: &LuaScript,
        keys: &[String],
        args: &[String],
    ) -> Result<Reply> {
        let mut invocation = script.script().prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }

        match invocation.invoke_async::<Value>(self).await {
            Ok(value) => Ok(Reply::from(value)),
            Err(e) if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() => {
                Err(transport_error("script transport failed", &e))
            },
            Err(e) => Err(Error::Script {
                script: script.name().to_string(),
                message: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_from_value() {
        assert_eq!(Reply::from(Value::Nil), Reply::Nil);
        assert_eq!(Reply::from(Value::Int(3)), Reply::Int(3));
        assert_eq!(
            Reply::from(Value::BulkString(b"100\t0.42".to_vec())),
            Reply::Text("100\t0.42".to_string())
        );
        assert_eq!(Reply::from(Value::Okay), Reply::Text("OK".to_string()));
        assert_eq!(
            Reply::from(Value::Array(vec![Value::BulkString(b"a".to_vec()), Value::Nil])),
            Reply::Array(vec![Reply::Text("a".to_string()), Reply::Nil])
        );
    }

    #[test]
    fn test_reply_into_strings() {
        let reply = Reply::Array(vec![Reply::Text("a".into()), Reply::Int(2)]);
        assert_eq!(reply.into_strings().unwrap(), vec!["a", "2"]);
        assert!(Reply::Nil.into_strings().unwrap().is_empty());
        assert!(Reply::Error("WRONGTYPE".into()).into_strings().is_err());
        assert!(Reply::Int(1).into_strings().is_err());
    }

    #[test]
    fn test_reply_into_optional_strings() {
        let reply = Reply::Array(vec![Reply::Text("a".into()), Reply::Nil]);
        assert_eq!(
            reply.into_optional_strings().unwrap(),
            vec![Some("a".to_string()), None]
        );
    }

    #[test]
    fn test_reply_into_int() {
        assert_eq!(Reply::Int(7).into_int().unwrap(), 7);
        assert_eq!(Reply::Text("7".into()).into_int().unwrap(), 7);
        assert!(Reply::Nil.into_int().is_err());
    }

    #[test]
    fn test_command_to_redis_packs_arguments() {
        let cmd = Command::ZRangeByScore {
            key: "p:cpu\t1".to_string(),
            min: 10,
            max: 20,
        }
        .to_redis();
        let packed = String::from_utf8_lossy(&cmd.get_packed_command()).into_owned();
        assert!(packed.contains("ZRANGEBYSCORE"));
        assert!(packed.contains("p:cpu\t1"));
        assert!(packed.contains("10"));
        assert!(packed.contains("20"));
    }

    // ------------------------------------------------------------------
    // Minimal RESP2 server: answers ZRANGEBYSCORE on keys containing
    // "bad" with WRONGTYPE, other ZRANGEBYSCOREs with one member, and
    // everything else (PING, CLIENT SETINFO) with a status reply.
    // ------------------------------------------------------------------

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::{TcpListener, TcpStream};

    async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<String>> {
        let mut line = String::new();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            line.clear();
            reader.read_line(&mut line).await.ok()?;
            let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
            let mut buf = vec![0u8; len + 2];
            reader.read_exact(&mut buf).await.ok()?;
            buf.truncate(len);
            args.push(String::from_utf8_lossy(&buf).into_owned());
        }
        Some(args)
    }

    fn respond(args: &[String]) -> String {
        match args.first().map(|a| a.to_ascii_uppercase()).as_deref() {
            Some("ZRANGEBYSCORE") if args[1].contains("bad") => {
                "-WRONGTYPE Operation against a key holding the wrong kind of value\r\n".to_string()
            },
            Some("ZRANGEBYSCORE") => {
                let member = format!("{}\t0.42", args[2]);
                format!("*1\r\n${}\r\n{}\r\n", member.len(), member)
            },
            Some("PING") => "+PONG\r\n".to_string(),
            _ => "+OK\r\n".to_string(),
        }
    }

    async fn serve(socket: TcpStream) {
        let (read, mut write) = socket.into_split();
        let mut reader = BufReader::new(read);
        while let Some(args) = read_command(&mut reader).await {
            if write.write_all(respond(&args).as_bytes()).await.is_err() {
                return;
            }
        }
    }

    async fn fake_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket));
            }
        });
        format!("redis://{}", addr)
    }

    async fn connect(url: &str) -> MultiplexedConnection {
        redis::Client::open(url)
            .unwrap()
            .get_multiplexed_async_connection()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_server_error_stays_in_its_slot() {
        let url = fake_server().await;
        let mut conn = connect(&url).await;

        let replies = conn
            .pipeline(&[
                Command::ZRangeByScore {
                    key: "p:cpu\t0".to_string(),
                    min: 5,
                    max: 10,
                },
                Command::ZRangeByScore {
                    key: "p:bad\t1".to_string(),
                    min: 5,
                    max: 10,
                },
                Command::ZRangeByScore {
                    key: "p:cpu\t2".to_string(),
                    min: 7,
                    max: 10,
                },
            ])
            .await
            .unwrap();

        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0], Reply::Array(vec![Reply::Text("5\t0.42".to_string())]));
        assert!(matches!(replies[1], Reply::Error(ref e) if e.contains("WRONGTYPE")));
        assert_eq!(replies[2], Reply::Array(vec![Reply::Text("7\t0.42".to_string())]));

        // The connection is still usable after a per-command failure
        assert!(conn.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_bucket_on_redis_marks_query_partial() {
        use crate::redis::executor::PipelinedExecutor;
        use crate::redis::keys::BucketLayout;
        use crate::redis::query::RangeQueryPlanner;

        let url = fake_server().await;
        let mut conn = connect(&url).await;

        let planner = RangeQueryPlanner::new(BucketLayout::new(100).unwrap());
        let plan = planner.plan("p:", "bad", 50, 150);
        let result = PipelinedExecutor::default()
            .execute(&mut conn, &plan)
            .await
            .unwrap();
        assert_eq!(result.buckets, 2);
        assert_eq!(result.failed_buckets, 2);
        assert!(result.partial);

        let plan = planner.plan("p:", "cpu", 50, 150);
        let result = PipelinedExecutor::default()
            .execute(&mut conn, &plan)
            .await
            .unwrap();
        assert_eq!(result.members, vec!["50\t0.42", "100\t0.42"]);
        assert!(!result.partial);
    }
}
