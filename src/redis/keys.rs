//! Redis key schema
//!
//! ```text
//! {prefix}{series_key}\t{bucket_id}   → ZSET(timestamp → "timestamp\tvalue")
//! {prefix}{metric}\tTagHash           → HASH {"k=v" → "series\tseries..."}
//! {prefix}{metric}\tTagList           → SET of series keys
//! ```
//!
//! The write path and the read path both derive bucket keys through
//! [`BucketLayout`]; keeping a single derivation is what guarantees a
//! range query finds every sample written inside it.

use crate::error::{Error, Result};
use crate::types::FIELD_SEPARATOR;

/// Default bucket width: one calendar day of millisecond timestamps
pub const DEFAULT_BUCKET_WIDTH_MS: i64 = 86_400_000;

const TAG_HASH_SUFFIX: &str = "TagHash";
const TAG_LIST_SUFFIX: &str = "TagList";

/// Mapping from timestamps to bucket ids and bucket keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketLayout {
    width: i64,
}

impl BucketLayout {
    /// Create a layout with the given bucket width
    pub fn new(width: i64) -> Result<Self> {
        if width <= 0 {
            return Err(Error::Configuration(format!(
                "bucket width must be positive, got {}",
                width
            )));
        }
        Ok(Self { width })
    }

    /// Bucket width
    pub fn width(&self) -> i64 {
        self.width
    }

    /// Bucket holding `timestamp`
    ///
    /// Floors toward negative infinity so pre-epoch timestamps get their own
    /// buckets instead of sharing bucket 0.
    pub fn bucket_id(&self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.width)
    }

    /// Inclusive time span covered by a bucket, clamped to the `i64` range
    pub fn bounds(&self, bucket_id: i64) -> (i64, i64) {
        let width = i128::from(self.width);
        let start = i128::from(bucket_id) * width;
        let end = start + width - 1;
        (clamp_to_i64(start), clamp_to_i64(end))
    }

    /// Key of the sorted set holding one bucket of a series
    pub fn bucket_key(&self, prefix: &str, series_key: &str, bucket_id: i64) -> String {
        format!("{}{}{}{}", prefix, series_key, FIELD_SEPARATOR, bucket_id)
    }

    /// Key of the bucket holding `timestamp`
    pub fn key_for(&self, prefix: &str, series_key: &str, timestamp: i64) -> String {
        self.bucket_key(prefix, series_key, self.bucket_id(timestamp))
    }
}

fn clamp_to_i64(v: i128) -> i64 {
    v.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

impl Default for BucketLayout {
    fn default() -> Self {
        Self {
            width: DEFAULT_BUCKET_WIDTH_MS,
        }
    }
}

/// Key of a metric's TagHash
pub fn tag_hash_key(prefix: &str, metric: &str) -> String {
    format!("{}{}{}{}", prefix, metric, FIELD_SEPARATOR, TAG_HASH_SUFFIX)
}

/// Key of a metric's TagList
pub fn tag_list_key(prefix: &str, metric: &str) -> String {
    format!("{}{}{}{}", prefix, metric, FIELD_SEPARATOR, TAG_LIST_SUFFIX)
}

/// Common prefix of every bucket key of a series
pub fn bucket_key_prefix(prefix: &str, series_key: &str) -> String {
    format!("{}{}{}", prefix, series_key, FIELD_SEPARATOR)
}

/// Escape glob metacharacters so `s` matches literally in `SCAN MATCH`
pub fn escape_glob(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Split a key under `prefix` into its leading name and trailing suffix
///
/// Returns `None` for keys outside the prefix or without a separator.
pub fn split_key<'a>(prefix: &str, key: &'a str) -> Option<(&'a str, &'a str)> {
    key.strip_prefix(prefix)?.split_once(FIELD_SEPARATOR)
}

/// Whether a key suffix is a bucket id (as opposed to TagHash/TagList)
pub fn is_bucket_suffix(suffix: &str) -> bool {
    let digits = suffix.strip_prefix('-').unwrap_or(suffix);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_id_floors() {
        let layout = BucketLayout::new(10).unwrap();
        assert_eq!(layout.bucket_id(0), 0);
        assert_eq!(layout.bucket_id(9), 0);
        assert_eq!(layout.bucket_id(10), 1);
        assert_eq!(layout.bucket_id(-1), -1);
        assert_eq!(layout.bucket_id(-10), -1);
        assert_eq!(layout.bucket_id(-11), -2);
    }

    #[test]
    fn test_bounds() {
        let layout = BucketLayout::new(10).unwrap();
        assert_eq!(layout.bounds(0), (0, 9));
        assert_eq!(layout.bounds(-1), (-10, -1));
        let (_, end) = layout.bounds(layout.bucket_id(i64::MAX));
        assert_eq!(end, i64::MAX);
        let (start, _) = layout.bounds(layout.bucket_id(i64::MIN));
        assert_eq!(start, i64::MIN);
    }

    #[test]
    fn test_bounds_of_clamped_first_bucket() {
        // i64::MIN is not a multiple of 3: the lowest bucket is cut short
        let layout = BucketLayout::new(3).unwrap();
        let first = layout.bucket_id(i64::MIN);
        assert_eq!(layout.bounds(first), (i64::MIN, i64::MIN + 1));
        assert_eq!(layout.bounds(first + 1), (i64::MIN + 2, i64::MIN + 4));
        assert_eq!(layout.bucket_id(i64::MIN + 1), first);
        assert_eq!(layout.bucket_id(i64::MIN + 2), first + 1);

        let last = layout.bucket_id(i64::MAX);
        let (start, end) = layout.bounds(last);
        assert_eq!(end, i64::MAX);
        assert_eq!(layout.bucket_id(start), last);
    }

    #[test]
    fn test_invalid_width() {
        assert!(BucketLayout::new(0).is_err());
        assert!(BucketLayout::new(-5).is_err());
    }

    #[test]
    fn test_default_width_is_one_day() {
        let layout = BucketLayout::default();
        assert_eq!(layout.width(), 86_400_000);
        assert_eq!(layout.bucket_id(86_399_999), 0);
        assert_eq!(layout.bucket_id(86_400_000), 1);
    }

    #[test]
    fn test_key_shapes() {
        let layout = BucketLayout::new(100).unwrap();
        assert_eq!(layout.key_for("p:", "host.cpu", 250), "p:host.cpu\t2");
        assert_eq!(tag_hash_key("p:", "cpu"), "p:cpu\tTagHash");
        assert_eq!(tag_list_key("p:", "cpu"), "p:cpu\tTagList");
        assert_eq!(bucket_key_prefix("p:", "cpu{h=a}"), "p:cpu{h=a}\t");
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
        assert_eq!(escape_glob("cpu{host=a}"), "cpu{host=a}");
    }

    #[test]
    fn test_split_key_and_suffix() {
        assert_eq!(split_key("p:", "p:cpu\t12"), Some(("cpu", "12")));
        assert_eq!(split_key("p:", "q:cpu\t12"), None);
        assert_eq!(split_key("p:", "p:cpu"), None);
        assert!(is_bucket_suffix("12"));
        assert!(is_bucket_suffix("-3"));
        assert!(!is_bucket_suffix("-"));
        assert!(!is_bucket_suffix("TagHash"));
    }
}
