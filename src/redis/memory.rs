//! In-process store
//!
//! [`MemoryStore`] implements the subset of Redis this crate uses, plus the
//! five server-side scripts, entirely in memory. It stands in for a live
//! server in tests and in embedders that want the same API without one.
//!
//! Scripts run against a scratch copy of the keyspace that is committed
//! only when the script completes, mirroring the all-or-nothing
//! visibility Redis gives scripts that validate before writing.
//!
//! Fault injection:
//! - [`MemoryStore::fail_key`]: commands touching a key reply with an error
//! - [`MemoryStore::fail_next_script`]: the next run of a script fails
//! - [`MemoryStore::invalidate_connections`]: existing connections go stale
//! - [`MemoryStore::fail_dials`]: the next dials are refused

use crate::error::{Error, Result};
use crate::types::FIELD_SEPARATOR;

use super::connection::Connector;
use super::keys::is_bucket_suffix;
use super::scripts::{LuaScript, ScriptName};
use super::transport::{Command, Reply, StoreConnection};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Pipelined exchanges
    pub pipelines: u64,
    /// Commands inside pipelines
    pub commands: u64,
    /// Script invocations
    pub scripts: u64,
    /// Liveness probes
    pub pings: u64,
    /// Successful dials
    pub dials: u64,
}

#[derive(Debug, Clone)]
enum Entry {
    Text(String),
    ZSet(HashMap<String, i64>),
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
}

impl Entry {
    fn type_name(&self) -> &'static str {
        match self {
            Entry::Text(_) => "string",
            Entry::ZSet(_) => "zset",
            Entry::Hash(_) => "hash",
            Entry::Set(_) => "set",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Keyspace {
    entries: BTreeMap<String, Entry>,
    ttls: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct State {
    keyspace: Keyspace,
    failing_keys: HashSet<String>,
    failing_scripts: HashMap<ScriptName, u32>,
    dial_failures: u32,
    epoch: u64,
    stats: MemoryStats,
}

fn wrong_type(key: &str, found: &Entry) -> String {
    format!(
        "WRONGTYPE Operation against a key holding the wrong kind of value ({} is a {})",
        key,
        found.type_name()
    )
}

fn script_failure(name: ScriptName, message: String) -> Error {
    Error::Script {
        script: name.to_string(),
        message,
    }
}

/// In-memory store shared by every connection it hands out
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection directly, bypassing any pool
    pub fn connection(&self) -> MemoryConnection {
        let epoch = self.state.lock().epoch;
        MemoryConnection {
            state: Arc::clone(&self.state),
            epoch,
        }
    }

    /// Connector for use with a connection pool
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            store: self.clone(),
        }
    }

    /// Current call counters
    pub fn stats(&self) -> MemoryStats {
        self.state.lock().stats
    }

    /// Make every command touching `key` reply with an error
    pub fn fail_key(&self, key: impl Into<String>) {
        self.state.lock().failing_keys.insert(key.into());
    }

    /// Stop failing commands on `key`
    pub fn heal_key(&self, key: &str) {
        self.state.lock().failing_keys.remove(key);
    }

    /// Fail the next run of `script` after it has done its work
    pub fn fail_next_script(&self, script: ScriptName) {
        *self.state.lock().failing_scripts.entry(script).or_insert(0) += 1;
    }

    /// Refuse the next `count` dials
    pub fn fail_dials(&self, count: u32) {
        self.state.lock().dial_failures = count;
    }

    /// Make every connection opened so far fail on use
    pub fn invalidate_connections(&self) {
        self.state.lock().epoch += 1;
    }

    /// Store a plain string value, replacing whatever `key` held
    pub fn insert_string(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state
            .lock()
            .keyspace
            .entries
            .insert(key.into(), Entry::Text(value.into()));
    }

    /// Whether `key` exists
    pub fn contains_key(&self, key: &str) -> bool {
        self.state.lock().keyspace.entries.contains_key(key)
    }

    /// Every key, sorted
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().keyspace.entries.keys().cloned().collect()
    }

    /// Members of a sorted set in score order
    pub fn zset_members(&self, key: &str) -> Vec<String> {
        match self.state.lock().keyspace.entries.get(key) {
            Some(Entry::ZSet(zset)) => sorted_range(zset, i64::MIN, i64::MAX),
            _ => Vec::new(),
        }
    }

    /// One field of a hash
    pub fn hash_get(&self, key: &str, field: &str) -> Option<String> {
        match self.state.lock().keyspace.entries.get(key) {
            Some(Entry::Hash(hash)) => hash.get(field).cloned(),
            _ => None,
        }
    }

    /// Every field of a hash
    pub fn hash_fields(&self, key: &str) -> BTreeMap<String, String> {
        match self.state.lock().keyspace.entries.get(key) {
            Some(Entry::Hash(hash)) => hash.clone(),
            _ => BTreeMap::new(),
        }
    }

    /// Members of a set, sorted
    pub fn set_members(&self, key: &str) -> Vec<String> {
        match self.state.lock().keyspace.entries.get(key) {
            Some(Entry::Set(set)) => set.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// TTL in seconds last set on `key`
    pub fn ttl(&self, key: &str) -> Option<u64> {
        self.state.lock().keyspace.ttls.get(key).copied()
    }
}

/// Connection to a [`MemoryStore`]
#[derive(Debug)]
pub struct MemoryConnection {
    state: Arc<Mutex<State>>,
    epoch: u64,
}

impl MemoryConnection {
    fn check_alive(&self, state: &State) -> Result<()> {
        if state.epoch != self.epoch {
            return Err(Error::Connection("connection reset by store".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn ping(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        self.check_alive(&state)?;
        state.stats.pings += 1;
        Ok(())
    }

    async fn pipeline(&mut self, commands: &[Command]) -> Result<Vec<Reply>> {
        let mut state = self.state.lock();
        self.check_alive(&state)?;
        state.stats.pipelines += 1;
        state.stats.commands += commands.len() as u64;

        let State {
            keyspace,
            failing_keys,
            ..
        } = &mut *state;
        Ok(commands
            .iter()
            .map(|command| apply_command(keyspace, failing_keys, command))
            .collect())
    }

    async fn invoke_script(
        &mut self,
        script: &LuaScript,
        keys: &[String],
        args: &[String],
    ) -> Result<Reply> {
        let mut state = self.state.lock();
        self.check_alive(&state)?;
        state.stats.scripts += 1;

        let name = script.name();
        let mut scratch = state.keyspace.clone();
        let reply = run_script(&mut scratch, name, keys, args)
            .map_err(|message| script_failure(name, message))?;

        if let Some(pending) = state.failing_scripts.get_mut(&name) {
            if *pending > 0 {
                *pending -= 1;
                return Err(script_failure(name, "injected failure".to_string()));
            }
        }

        state.keyspace = scratch;
        Ok(reply)
    }
}

/// Connector handing out [`MemoryConnection`]s
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    store: MemoryStore,
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection> {
        let mut state = self.store.state.lock();
        if state.dial_failures > 0 {
            state.dial_failures -= 1;
            return Err(Error::Connection("store refused the connection".to_string()));
        }
        state.stats.dials += 1;
        Ok(MemoryConnection {
            state: Arc::clone(&self.store.state),
            epoch: state.epoch,
        })
    }

    fn target(&self) -> String {
        "memory".to_string()
    }
}

fn sorted_range(zset: &HashMap<String, i64>, min: i64, max: i64) -> Vec<String> {
    let mut hits: Vec<(i64, &String)> = zset
        .iter()
        .filter(|(_, score)| (min..=max).contains(*score))
        .map(|(member, score)| (*score, member))
        .collect();
    hits.sort();
    hits.into_iter().map(|(_, member)| member.clone()).collect()
}

fn text_array(items: impl IntoIterator<Item = String>) -> Reply {
    Reply::Array(items.into_iter().map(Reply::Text).collect())
}

fn apply_command(
    keyspace: &mut Keyspace,
    failing_keys: &HashSet<String>,
    command: &Command,
) -> Reply {
    let key = match command {
        Command::ZAdd { key, .. }
        | Command::ZRangeByScore { key, .. }
        | Command::HMGet { key, .. }
        | Command::SMembers { key }
        | Command::Del { key } => key,
    };
    if failing_keys.contains(key) {
        return Reply::Error(format!("ERR injected failure on {}", key));
    }

    let entries = &mut keyspace.entries;
    match command {
        Command::ZAdd { key, members } => {
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| Entry::ZSet(HashMap::new()));
            match entry {
                Entry::ZSet(zset) => {
                    let mut added = 0;
                    for (score, member) in members {
                        if zset.insert(member.clone(), *score).is_none() {
                            added += 1;
                        }
                    }
                    Reply::Int(added)
                },
                other => Reply::Error(wrong_type(key, other)),
            }
        },
        Command::ZRangeByScore { key, min, max } => match entries.get(key) {
            None => Reply::Array(Vec::new()),
            Some(Entry::ZSet(zset)) => text_array(sorted_range(zset, *min, *max)),
            Some(other) => Reply::Error(wrong_type(key, other)),
        },
        Command::HMGet { key, fields } => match entries.get(key) {
            None => Reply::Array(fields.iter().map(|_| Reply::Nil).collect()),
            Some(Entry::Hash(hash)) => Reply::Array(
                fields
                    .iter()
                    .map(|f| hash.get(f).cloned().map_or(Reply::Nil, Reply::Text))
                    .collect(),
            ),
            Some(other) => Reply::Error(wrong_type(key, other)),
        },
        Command::SMembers { key } => match entries.get(key) {
            None => Reply::Array(Vec::new()),
            Some(Entry::Set(set)) => text_array(set.iter().cloned()),
            Some(other) => Reply::Error(wrong_type(key, other)),
        },
        Command::Del { key } => {
            keyspace.ttls.remove(key);
            Reply::Int(i64::from(entries.remove(key).is_some()))
        },
    }
}

/// Glob match supporting `*`, `?` and backslash escapes, as `SCAN MATCH` does
fn glob_match(pattern: &str, text: &str) -> bool {
    fn go(p: &[char], t: &[char]) -> bool {
        match p.split_first() {
            None => t.is_empty(),
            Some(('*', rest)) => (0..=t.len()).any(|i| go(rest, &t[i..])),
            Some(('?', rest)) => !t.is_empty() && go(rest, &t[1..]),
            Some(('\\', rest)) if !rest.is_empty() => {
                t.first() == Some(&rest[0]) && go(&rest[1..], &t[1..])
            },
            Some((c, rest)) => t.first() == Some(c) && go(rest, &t[1..]),
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    go(&p, &t)
}

fn scan<'a>(keyspace: &'a Keyspace, pattern: &'a str) -> impl Iterator<Item = &'a String> + 'a {
    keyspace
        .entries
        .keys()
        .filter(move |key| glob_match(pattern, key))
}

fn expect_args(
    name: ScriptName,
    keys: &[String],
    args: &[String],
    nkeys: usize,
    nargs: usize,
) -> std::result::Result<(), String> {
    if keys.len() != nkeys || args.len() < nargs {
        return Err(format!(
            "{} expects {} keys and at least {} arguments, got {} and {}",
            name,
            nkeys,
            nargs,
            keys.len(),
            args.len()
        ));
    }
    Ok(())
}

fn check_type(keyspace: &Keyspace, key: &str, wanted: &str) -> std::result::Result<(), String> {
    match keyspace.entries.get(key) {
        Some(entry) if entry.type_name() != wanted => Err(wrong_type(key, entry)),
        _ => Ok(()),
    }
}

fn run_script(
    keyspace: &mut Keyspace,
    name: ScriptName,
    keys: &[String],
    args: &[String],
) -> std::result::Result<Reply, String> {
    match name {
        ScriptName::SetTags => {
            expect_args(name, keys, args, 2, 1)?;
            set_tags(keyspace, &keys[0], &keys[1], &args[0], &args[1..])
        },
        ScriptName::GetTags => {
            expect_args(name, keys, args, 2, 2)?;
            let ttl: u64 = args[1]
                .parse()
                .map_err(|_| format!("invalid ttl {:?}", args[1]))?;
            get_tags(keyspace, &keys[0], &keys[1], &args[0], ttl)
        },
        ScriptName::ListMetrics => {
            expect_args(name, keys, args, 0, 2)?;
            Ok(list_metrics(keyspace, &args[0], &args[1]))
        },
        ScriptName::ListSeriesKeys => {
            expect_args(name, keys, args, 1, 3)?;
            list_series_keys(keyspace, &keys[0], &args[0], &args[1], &args[2])
        },
        ScriptName::DeleteSeries => {
            expect_args(name, keys, args, 2, 3)?;
            delete_series(keyspace, &keys[0], &keys[1], &args[0], &args[1], &args[2])
        },
    }
}

fn set_tags(
    keyspace: &mut Keyspace,
    hash_key: &str,
    list_key: &str,
    series: &str,
    pairs: &[String],
) -> std::result::Result<Reply, String> {
    check_type(keyspace, hash_key, "hash")?;
    check_type(keyspace, list_key, "set")?;

    if !pairs.is_empty() {
        if let Entry::Hash(hash) = keyspace
            .entries
            .entry(hash_key.to_string())
            .or_insert_with(|| Entry::Hash(BTreeMap::new()))
        {
            for pair in pairs {
                match hash.get_mut(pair) {
                    None => {
                        hash.insert(pair.clone(), series.to_string());
                    },
                    Some(current) => {
                        if !current.split(FIELD_SEPARATOR).any(|member| member == series) {
                            current.push(FIELD_SEPARATOR);
                            current.push_str(series);
                        }
                    },
                }
            }
        }
    }

    let added = match keyspace
        .entries
        .entry(list_key.to_string())
        .or_insert_with(|| Entry::Set(BTreeSet::new()))
    {
        Entry::Set(set) => set.insert(series.to_string()),
        _ => false,
    };
    Ok(Reply::Int(i64::from(added)))
}

fn get_tags(
    keyspace: &mut Keyspace,
    list_key: &str,
    out_key: &str,
    target: &str,
    ttl: u64,
) -> std::result::Result<Reply, String> {
    check_type(keyspace, list_key, "set")?;
    keyspace.entries.remove(out_key);
    keyspace.ttls.remove(out_key);

    let registered: Vec<String> = match keyspace.entries.get(list_key) {
        Some(Entry::Set(set)) => set.iter().cloned().collect(),
        _ => Vec::new(),
    };

    let mut out = BTreeSet::new();
    for series in registered {
        if target.is_empty() {
            out.insert(series);
            continue;
        }
        let Some(open) = series.find('{') else {
            continue;
        };
        let body = series[open + 1..].trim_end_matches('}');
        for pair in body.split(',').filter(|p| !p.is_empty()) {
            if pair.split_once('=').map(|(k, _)| k) == Some(target) {
                out.insert(pair.to_string());
            }
        }
    }

    let count = out.len() as i64;
    if count > 0 {
        keyspace.entries.insert(out_key.to_string(), Entry::Set(out));
        if ttl > 0 {
            keyspace.ttls.insert(out_key.to_string(), ttl);
        }
    }
    Ok(Reply::Int(count))
}

fn list_metrics(keyspace: &Keyspace, prefix: &str, pattern: &str) -> Reply {
    let mut metrics = BTreeSet::new();
    for key in scan(keyspace, pattern) {
        let rest = &key[prefix.len().min(key.len())..];
        if let Some((name, _)) = rest.split_once(FIELD_SEPARATOR) {
            let name = name.split('{').next().unwrap_or(name);
            if !name.is_empty() {
                metrics.insert(name.to_string());
            }
        }
    }
    text_array(metrics)
}

fn list_series_keys(
    keyspace: &Keyspace,
    list_key: &str,
    prefix: &str,
    metric: &str,
    pattern: &str,
) -> std::result::Result<Reply, String> {
    let mut series = BTreeSet::new();
    match keyspace.entries.get(list_key) {
        None => {},
        Some(Entry::Set(set)) => series.extend(set.iter().cloned()),
        Some(other) => return Err(wrong_type(list_key, other)),
    }

    let tagged = format!("{}{{", metric);
    for key in scan(keyspace, pattern) {
        let rest = &key[prefix.len().min(key.len())..];
        if let Some((name, suffix)) = rest.split_once(FIELD_SEPARATOR) {
            if is_bucket_suffix(suffix) && (name == metric || name.starts_with(&tagged)) {
                series.insert(name.to_string());
            }
        }
    }
    Ok(text_array(series))
}

fn delete_series(
    keyspace: &mut Keyspace,
    hash_key: &str,
    list_key: &str,
    series: &str,
    pattern: &str,
    bucket_prefix: &str,
) -> std::result::Result<Reply, String> {
    check_type(keyspace, hash_key, "hash")?;
    check_type(keyspace, list_key, "set")?;

    let buckets: Vec<String> = scan(keyspace, pattern)
        .filter(|key| {
            key.strip_prefix(bucket_prefix)
                .is_some_and(is_bucket_suffix)
        })
        .cloned()
        .collect();
    for key in &buckets {
        keyspace.entries.remove(key);
        keyspace.ttls.remove(key);
    }

    if let Some(Entry::Hash(hash)) = keyspace.entries.get_mut(hash_key) {
        let mut emptied = Vec::new();
        for (pair, members) in hash.iter_mut() {
            if !members.split(FIELD_SEPARATOR).any(|m| m == series) {
                continue;
            }
            let kept: Vec<&str> = members
                .split(FIELD_SEPARATOR)
                .filter(|m| !m.is_empty() && *m != series)
                .collect();
            if kept.is_empty() {
                emptied.push(pair.clone());
            } else {
                let joined = kept.join("\t");
                *members = joined;
            }
        }
        for pair in emptied {
            hash.remove(&pair);
        }
        if hash.is_empty() {
            keyspace.entries.remove(hash_key);
        }
    }

    if let Some(Entry::Set(set)) = keyspace.entries.get_mut(list_key) {
        set.remove(series);
        if set.is_empty() {
            keyspace.entries.remove(list_key);
        }
    }

    Ok(Reply::Int(buckets.len() as i64))
}
