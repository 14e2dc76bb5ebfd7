//! Error types for the time-series layer

use thiserror::Error;

/// Main error type
///
/// Variants map onto the failure classes a caller can act on: transport
/// failures, plan rejections, individual command failures and script
/// failures. Per-bucket failures inside a range query are not errors; they
/// only mark the [`QueryResult`](crate::redis::QueryResult) as partial.
#[derive(Error, Debug)]
pub enum Error {
    /// Dial, health probe or transport failure, or the pool was closed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Every connection is borrowed and the pool does not wait
    #[error("Connection pool exhausted: all {max_active} connections are in use")]
    PoolExhausted {
        /// Configured maximum number of active connections
        max_active: u32,
    },

    /// The bucket plan for a query exceeds the pipeline bound
    #[error(
        "Query over limit: range {start} - {stop} needs {requested_buckets} buckets, limit is {limit}"
    )]
    OverLimit {
        /// Requested range start
        start: i64,
        /// Requested range stop
        stop: i64,
        /// Number of buckets the plan would issue
        requested_buckets: u64,
        /// Configured maximum pipeline size
        limit: usize,
    },

    /// A single store command failed or returned an unexpected reply
    #[error("Store command error: {0}")]
    StoreCommand(String),

    /// A server-side script failed
    #[error("Script {script} failed: {message}")]
    Script {
        /// Name of the script that failed
        script: String,
        /// Failure description
        message: String,
    },

    /// Metric, tag or series names that cannot be encoded into keys
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Whether the error came from the transport rather than the data
    ///
    /// A connection that produced such an error may have unread replies
    /// queued and must not be handed to the next caller.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
