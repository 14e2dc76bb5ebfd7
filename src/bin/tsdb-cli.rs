//! zset-tsdb command line client
//!
//! # Configuration
//!
//! Settings are read from:
//! 1. `--config <path>` (TOML)
//! 2. `TSDB_CONFIG` environment variable (path to TOML file)
//! 3. Default configuration
//!
//! then overridden by `TSDB_*` environment variables and `--url`.
//!
//! # Example Usage
//!
//! ```bash
//! tsdb-cli tag host.cpu host=web-1 dc=eu
//! tsdb-cli write 'host.cpu{dc=eu,host=web-1}' 0.42
//! tsdb-cli query 'host.cpu{dc=eu,host=web-1}' --start 2024-01-01T00:00:00Z --stop now
//! tsdb-cli find host.cpu dc=eu --json
//! ```

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};
use zset_tsdb::{Config, Sample, TagPair, TimeSeriesDb};

/// zset-tsdb - time series on Redis sorted sets
#[derive(Parser)]
#[command(name = "tsdb-cli")]
#[command(version)]
#[command(about = "Write, query and browse time series stored in Redis", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (overrides TSDB_CONFIG env var)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Override the Redis URL
    #[arg(short, long, global = true)]
    url: Option<String>,

    /// Key namespace (defaults to `redis.prefix` from the configuration)
    #[arg(short, long, global = true)]
    prefix: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Append one sample to a series
    Write {
        /// Series key, e.g. `cpu{host=a}`
        series: String,
        /// Sample value
        value: String,
        /// Timestamp: epoch milliseconds, RFC 3339, or `now`
        #[arg(short, long, default_value = "now")]
        timestamp: String,
    },

    /// Print every sample of a series in a time window
    Query {
        /// Series key
        series: String,
        /// Window start: epoch milliseconds, RFC 3339, or `now`
        #[arg(long)]
        start: String,
        /// Window end: epoch milliseconds, RFC 3339, or `now`
        #[arg(long, default_value = "now")]
        stop: String,
    },

    /// Register a series under its tags
    Tag {
        /// Metric name
        metric: String,
        /// Tag pairs as key=value
        tags: Vec<String>,
    },

    /// Find series of a metric carrying every given tag pair
    Find {
        /// Metric name
        metric: String,
        /// Tag pairs as key=value; none lists every registered series
        tags: Vec<String>,
    },

    /// List metric names
    Metrics,

    /// List series keys of a metric
    Series {
        /// Metric name
        metric: String,
    },

    /// Delete a series with its buckets and tag index entries
    Delete {
        /// Metric name
        metric: String,
        /// Series key
        series: String,
    },

    /// Check connectivity and print pool counters
    Ping,

    /// Validate configuration and print it
    CheckConfig,
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn load_config(cli: &Cli) -> CliResult<Config> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var_os("TSDB_CONFIG").map(Into::into));

    let mut config = match path {
        Some(path) => Config::from_file_with_env(&path)?,
        None => Config::from_env(),
    };
    if let Some(url) = &cli.url {
        config.redis.url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Parse epoch milliseconds, RFC 3339, or `now`
fn parse_time(raw: &str) -> CliResult<i64> {
    if raw == "now" {
        return Ok(chrono::Utc::now().timestamp_millis());
    }
    if let Ok(ms) = raw.parse::<i64>() {
        return Ok(ms);
    }
    let parsed = chrono::DateTime::parse_from_rfc3339(raw)
        .map_err(|e| format!("invalid time {:?}: {}", raw, e))?;
    Ok(parsed.timestamp_millis())
}

fn parse_tags(raw: &[String]) -> CliResult<Vec<TagPair>> {
    Ok(raw
        .iter()
        .map(|t| TagPair::parse(t))
        .collect::<zset_tsdb::Result<Vec<_>>>()?)
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T)) -> CliResult<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        text(value);
    }
    Ok(())
}

fn print_lines(lines: &Vec<String>) {
    for line in lines {
        println!("{}", line);
    }
}

#[derive(Serialize)]
struct QueryOutput {
    series: String,
    samples: Vec<Sample>,
    buckets: u64,
    failed_buckets: u64,
    partial: bool,
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::CheckConfig = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let prefix = cli
        .prefix
        .clone()
        .unwrap_or_else(|| config.redis.prefix.clone());
    debug!(
        "Configuration: prefix={:?}, max_active={}, max_pipeline_size={}",
        prefix, config.redis.max_active, config.query.max_pipeline_size
    );
    let db = TimeSeriesDb::connect(config).await?;

    let outcome = run(&cli, &db, &prefix).await;
    db.close();
    outcome
}

async fn run(cli: &Cli, db: &TimeSeriesDb, prefix: &str) -> CliResult<()> {
    match &cli.command {
        Commands::Write {
            series,
            value,
            timestamp,
        } => {
            let ts = parse_time(timestamp)?;
            let added = db.write(prefix, series, ts, value).await?;
            info!("Wrote {} at {} ({} new)", series, ts, added);
            emit(cli.json, &added, |n| println!("{}", n))
        },
        Commands::Query {
            series,
            start,
            stop,
        } => {
            let result = db
                .query(prefix, series, parse_time(start)?, parse_time(stop)?).await?;
            let output = QueryOutput {
                series: series.clone(),
                samples: result.samples()?,
                buckets: result.buckets,
                failed_buckets: result.failed_buckets,
                partial: result.partial,
            };
            emit(cli.json, &output, |out| {
                for sample in &out.samples {
                    println!("{}", sample);
                }
                if out.partial {
                    eprintln!(
                        "warning: {} of {} buckets failed, result is partial",
                        out.failed_buckets, out.buckets
                    );
                }
            })
        },
        Commands::Tag { metric, tags } => {
            let (key, status) = db
                .register_series(prefix, metric, &parse_tags(tags)?).await?;
            emit(cli.json, &(key, status), |(key, status)| {
                println!("{} {:?}", key, status)
            })
        },
        Commands::Find { metric, tags } => {
            let series = db.find_series(prefix, metric, &parse_tags(tags)?).await?;
            emit(cli.json, &series, print_lines)
        },
        Commands::Metrics => {
            let metrics = db.list_metrics(prefix).await?;
            emit(cli.json, &metrics, print_lines)
        },
        Commands::Series { metric } => {
            let series = db.list_series_keys(prefix, metric).await?;
            emit(cli.json, &series, print_lines)
        },
        Commands::Delete { metric, series } => {
            let removed = db.delete_series(prefix, metric, series).await?;
            emit(cli.json, &removed, |n| println!("deleted {} buckets", n))
        },
        Commands::Ping => {
            let status = db.health_check().await;
            let metrics = db.pool_metrics();
            emit(cli.json, &(status, metrics), |(status, metrics)| {
                println!("{:?}", status);
                println!(
                    "connections: created={} failed={} idle={} active={}",
                    metrics.connections_created,
                    metrics.connection_failures,
                    metrics.idle,
                    metrics.active
                );
            })
        },
        Commands::CheckConfig => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("1700000000000").unwrap(), 1_700_000_000_000);
        assert_eq!(parse_time("-5").unwrap(), -5);
        assert_eq!(
            parse_time("2023-11-14T22:13:20Z").unwrap(),
            1_700_000_000_000
        );
        assert!(parse_time("yesterday").is_err());
        assert!(parse_time("now").unwrap() > 1_700_000_000_000);
    }

    #[test]
    fn test_parse_tags() {
        let tags = parse_tags(&["host=a".to_string(), "dc=eu".to_string()]).unwrap();
        assert_eq!(tags, vec![TagPair::new("host", "a"), TagPair::new("dc", "eu")]);
        assert!(parse_tags(&["host".to_string()]).is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::parse_from(["tsdb-cli", "--json", "query", "cpu", "--start", "0"]);
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Query { ref stop, .. } if stop == "now"));
        assert!(cli.prefix.is_none());

        let cli = Cli::parse_from(["tsdb-cli", "metrics", "--prefix", "tenant-a:"]);
        assert_eq!(cli.prefix.as_deref(), Some("tenant-a:"));
    }
}
