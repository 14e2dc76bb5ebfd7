//! Lua scripts for atomic Redis operations
//!
//! Every multi-structure update of the tag index, and every namespace scan
//! of the metric catalog, runs as one server-side script so that it applies
//! as an indivisible unit relative to other clients.
//!
//! # Scripts Provided
//!
//! - `set_tags`: Register a series under its tag pairs and the metric's TagList
//! - `get_tags`: Materialize the TagList (or one tag key's values) into a key
//! - `list_metrics`: Enumerate metric names under a prefix
//! - `list_series_keys`: Enumerate series keys registered or written under a metric
//! - `delete_series`: Remove a series' buckets and every index reference to it
//!
//! The set is fixed. [`LuaScripts::new`] binds each name to its compiled
//! [`redis::Script`] (body plus SHA1) once; callers resolve by [`ScriptName`].
//!
//! # Example
//!
//! ```rust
//! use zset_tsdb::redis::{LuaScripts, ScriptName};
//!
//! let scripts = LuaScripts::new();
//! let set_tags = scripts.get(ScriptName::SetTags);
//! assert_eq!(set_tags.name(), ScriptName::SetTags);
//! ```

use redis::Script;
use std::fmt;

/// Names of the server-side scripts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptName {
    /// Atomic tag registration
    SetTags,
    /// TagList materialization
    GetTags,
    /// Metric enumeration
    ListMetrics,
    /// Series enumeration under one metric
    ListSeriesKeys,
    /// Atomic series removal
    DeleteSeries,
}

impl ScriptName {
    /// Every script, in registry order
    pub const ALL: [ScriptName; 5] = [
        ScriptName::SetTags,
        ScriptName::GetTags,
        ScriptName::ListMetrics,
        ScriptName::ListSeriesKeys,
        ScriptName::DeleteSeries,
    ];

    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptName::SetTags => "set_tags",
            ScriptName::GetTags => "get_tags",
            ScriptName::ListMetrics => "list_metrics",
            ScriptName::ListSeriesKeys => "list_series_keys",
            ScriptName::DeleteSeries => "delete_series",
        }
    }

    /// Lua source
    pub fn body(&self) -> &'static str {
        match self {
            ScriptName::SetTags => SET_TAGS,
            ScriptName::GetTags => GET_TAGS,
            ScriptName::ListMetrics => LIST_METRICS,
            ScriptName::ListSeriesKeys => LIST_SERIES_KEYS,
            ScriptName::DeleteSeries => DELETE_SERIES,
        }
    }

    fn index(&self) -> usize {
        match self {
            ScriptName::SetTags => 0,
            ScriptName::GetTags => 1,
            ScriptName::ListMetrics => 2,
            ScriptName::ListSeriesKeys => 3,
            ScriptName::DeleteSeries => 4,
        }
    }
}

impl fmt::Display for ScriptName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, compiled script
pub struct LuaScript {
    name: ScriptName,
    script: Script,
}

impl LuaScript {
    fn new(name: ScriptName) -> Self {
        Self {
            name,
            script: Script::new(name.body()),
        }
    }

    /// Logical name
    pub fn name(&self) -> ScriptName {
        self.name
    }

    /// Compiled script handle (EVALSHA with EVAL fallback)
    pub fn script(&self) -> &Script {
        &self.script
    }

    /// SHA1 of the script body
    pub fn hash(&self) -> &str {
        self.script.get_hash()
    }
}

impl fmt::Debug for LuaScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LuaScript")
            .field("name", &self.name)
            .field("hash", &self.hash())
            .finish()
    }
}

/// Registry of every script, bound at construction
#[derive(Debug)]
pub struct LuaScripts {
    scripts: [LuaScript; 5],
}

impl LuaScripts {
    /// Compile every script
    pub fn new() -> Self {
        Self {
            scripts: ScriptName::ALL.map(LuaScript::new),
        }
    }

    /// Resolve a script by name
    pub fn get(&self, name: ScriptName) -> &LuaScript {
        &self.scripts[name.index()]
    }

    /// Iterate over every script
    pub fn iter(&self) -> impl Iterator<Item = &LuaScript> {
        self.scripts.iter()
    }
}

impl Default for LuaScripts {
    fn default() -> Self {
        Self::new()
    }
}

/// Register a series under each of its tag pairs
///
/// # Keys
/// - KEYS[1]: TagHash (`{prefix}{metric}\tTagHash`)
/// - KEYS[2]: TagList (`{prefix}{metric}\tTagList`)
///
/// # Arguments
/// - ARGV[1]: Series key
/// - ARGV[2..]: Encoded tag pairs (`key=value`)
///
/// # Returns
/// - 1 if the series was new to the TagList, 0 otherwise
///
/// Both keys are type-checked before the first write: Redis does not roll
/// back writes made before a runtime error, so nothing may fail midway.
const SET_TAGS: &str = r#"
local hash_key = KEYS[1]
local list_key = KEYS[2]
local series = ARGV[1]

local hash_type = redis.call('TYPE', hash_key).ok
if hash_type ~= 'none' and hash_type ~= 'hash' then
    return redis.error_reply('WRONGTYPE TagHash ' .. hash_key .. ' is a ' .. hash_type)
end
local list_type = redis.call('TYPE', list_key).ok
if list_type ~= 'none' and list_type ~= 'set' then
    return redis.error_reply('WRONGTYPE TagList ' .. list_key .. ' is a ' .. list_type)
end

for i = 2, #ARGV do
    local pair = ARGV[i]
    local current = redis.call('HGET', hash_key, pair)
    if not current then
        redis.call('HSET', hash_key, pair, series)
    else
        local found = false
        for member in string.gmatch(current, '[^\t]+') do
            if member == series then
                found = true
                break
            end
        end
        if not found then
            redis.call('HSET', hash_key, pair, current .. '\t' .. series)
        end
    end
end

return redis.call('SADD', list_key, series)
"#;

/// Materialize the TagList, or one tag key's values, into an output set
///
/// # Keys
/// - KEYS[1]: TagList
/// - KEYS[2]: Output key (replaced)
///
/// # Arguments
/// - ARGV[1]: Target tag key, empty for every registered series key
/// - ARGV[2]: TTL in seconds for the output key (0 for none)
///
/// # Returns
/// - Number of members written to the output key
///
/// The TagList is type-checked before the output key is cleared.
const GET_TAGS: &str = r#"
local list_key = KEYS[1]
local out_key = KEYS[2]
local target = ARGV[1]
local ttl = tonumber(ARGV[2])

local list_type = redis.call('TYPE', list_key).ok
if list_type ~= 'none' and list_type ~= 'set' then
    return redis.error_reply('WRONGTYPE TagList ' .. list_key .. ' is a ' .. list_type)
end

redis.call('DEL', out_key)

local members = redis.call('SMEMBERS', list_key)
for _, series in ipairs(members) do
    if target == '' then
        redis.call('SADD', out_key, series)
    else
        local open = string.find(series, '{', 1, true)
        if open then
            local body = string.sub(series, open + 1, -2)
            for pair in string.gmatch(body, '[^,]+') do
                local eq = string.find(pair, '=', 1, true)
                if eq and string.sub(pair, 1, eq - 1) == target then
                    redis.call('SADD', out_key, pair)
                end
            end
        end
    end
end

local count = redis.call('SCARD', out_key)
if count > 0 and ttl > 0 then
    redis.call('EXPIRE', out_key, ttl)
end
return count
"#;

/// Enumerate metric names under a prefix
///
/// # Arguments
/// - ARGV[1]: Prefix (raw)
/// - ARGV[2]: SCAN MATCH pattern (glob-escaped prefix followed by `*`)
///
/// # Returns
/// - Sorted, distinct metric names
const LIST_METRICS: &str = r#"
local prefix = ARGV[1]
local pattern = ARGV[2]
local seen = {}
local metrics = {}

local cursor = '0'
repeat
    local reply = redis.call('SCAN', cursor, 'MATCH', pattern, 'COUNT', 1000)
    cursor = reply[1]
    for _, key in ipairs(reply[2]) do
        local rest = string.sub(key, #prefix + 1)
        local tab = string.find(rest, '\t', 1, true)
        if tab then
            local name = string.sub(rest, 1, tab - 1)
            local brace = string.find(name, '{', 1, true)
            if brace then
                name = string.sub(name, 1, brace - 1)
            end
            if name ~= '' and not seen[name] then
                seen[name] = true
                table.insert(metrics, name)
            end
        end
    end
until cursor == '0'

table.sort(metrics)
return metrics
"#;

/// Enumerate series keys of one metric
///
/// Unions the TagList with series found through their bucket keys, so
/// series written without tags are listed too.
///
/// # Keys
/// - KEYS[1]: TagList
///
/// # Arguments
/// - ARGV[1]: Prefix (raw)
/// - ARGV[2]: Metric name
/// - ARGV[3]: SCAN MATCH pattern (glob-escaped prefix + metric, then `*`)
///
/// # Returns
/// - Sorted, distinct series keys
const LIST_SERIES_KEYS: &str = r#"
local list_key = KEYS[1]
local prefix = ARGV[1]
local metric = ARGV[2]
local pattern = ARGV[3]
local seen = {}
local series = {}

local function add(name)
    if not seen[name] then
        seen[name] = true
        table.insert(series, name)
    end
end

for _, member in ipairs(redis.call('SMEMBERS', list_key)) do
    add(member)
end

local cursor = '0'
repeat
    local reply = redis.call('SCAN', cursor, 'MATCH', pattern, 'COUNT', 1000)
    cursor = reply[1]
    for _, key in ipairs(reply[2]) do
        local rest = string.sub(key, #prefix + 1)
        local tab = string.find(rest, '\t', 1, true)
        if tab then
            local name = string.sub(rest, 1, tab - 1)
            local suffix = string.sub(rest, tab + 1)
            local is_bucket = string.match(suffix, '^%-?%d+$') ~= nil
            if is_bucket and (name == metric or string.sub(name, 1, #metric + 1) == metric .. '{') then
                add(name)
            end
        end
    end
until cursor == '0'

table.sort(series)
return series
"#;

/// Remove a series: its buckets, its TagList entry and every TagHash reference
///
/// # Keys
/// - KEYS[1]: TagHash
/// - KEYS[2]: TagList
///
/// # Arguments
/// - ARGV[1]: Series key
/// - ARGV[2]: SCAN MATCH pattern for the series' bucket keys
/// - ARGV[3]: Raw bucket key prefix (`{prefix}{series}\t`)
///
/// # Returns
/// - Number of bucket keys deleted
const DELETE_SERIES: &str = r#"
local hash_key = KEYS[1]
local list_key = KEYS[2]
local series = ARGV[1]
local pattern = ARGV[2]
local bucket_prefix = ARGV[3]

local hash_type = redis.call('TYPE', hash_key).ok
if hash_type ~= 'none' and hash_type ~= 'hash' then
    return redis.error_reply('WRONGTYPE TagHash ' .. hash_key .. ' is a ' .. hash_type)
end
local list_type = redis.call('TYPE', list_key).ok
if list_type ~= 'none' and list_type ~= 'set' then
    return redis.error_reply('WRONGTYPE TagList ' .. list_key .. ' is a ' .. list_type)
end

local buckets = {}
local cursor = '0'
repeat
    local reply = redis.call('SCAN', cursor, 'MATCH', pattern, 'COUNT', 1000)
    cursor = reply[1]
    for _, key in ipairs(reply[2]) do
        if string.sub(key, 1, #bucket_prefix) == bucket_prefix then
            local suffix = string.sub(key, #bucket_prefix + 1)
            if string.match(suffix, '^%-?%d+$') then
                table.insert(buckets, key)
            end
        end
    end
until cursor == '0'

local removed = 0
for _, key in ipairs(buckets) do
    removed = removed + redis.call('DEL', key)
end

local fields = redis.call('HGETALL', hash_key)
for i = 1, #fields, 2 do
    local pair = fields[i]
    local kept = {}
    local dropped = false
    for member in string.gmatch(fields[i + 1], '[^\t]+') do
        if member == series then
            dropped = true
        else
            table.insert(kept, member)
        end
    end
    if dropped then
        if #kept == 0 then
            redis.call('HDEL', hash_key, pair)
        else
            redis.call('HSET', hash_key, pair, table.concat(kept, '\t'))
        end
    end
end

redis.call('SREM', list_key, series)
return removed
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_name_resolves_to_its_own_script() {
        let scripts = LuaScripts::new();
        for name in ScriptName::ALL {
            assert_eq!(scripts.get(name).name(), name);
        }
    }

    #[test]
    fn test_script_hashes_are_distinct() {
        let scripts = LuaScripts::new();
        let mut hashes: Vec<&str> = scripts.iter().map(|s| s.hash()).collect();
        hashes.sort();
        hashes.dedup();
        assert_eq!(hashes.len(), ScriptName::ALL.len());
    }

    #[test]
    fn test_hash_is_stable_across_registries() {
        let a = LuaScripts::new();
        let b = LuaScripts::new();
        assert_eq!(
            a.get(ScriptName::SetTags).hash(),
            b.get(ScriptName::SetTags).hash()
        );
    }

    #[test]
    fn test_writing_scripts_check_types_before_writing() {
        for name in [ScriptName::SetTags, ScriptName::GetTags, ScriptName::DeleteSeries] {
            let body = name.body();
            let type_check = body.find("redis.call('TYPE'").unwrap();
            let first_write = ["'HSET'", "'DEL'", "'SADD'"]
                .iter()
                .filter_map(|w| body.find(w))
                .min()
                .unwrap();
            assert!(type_check < first_write, "{} writes before checking types", name);
        }
    }

    #[test]
    fn test_names_are_snake_case() {
        assert_eq!(ScriptName::SetTags.to_string(), "set_tags");
        assert_eq!(ScriptName::ListSeriesKeys.as_str(), "list_series_keys");
    }
}
