//! Time-window query planning
//!
//! Decomposes a requested `[start, stop]` window into one sub-range per
//! bucket the window touches. Buckets come out in ascending time order; the
//! first and last are clipped to the request, the ones in between span
//! their whole bucket.
//!
//! A plan is never truncated. It is kept lazy (bucket count computed
//! arithmetically, entries produced on iteration) so that a pathological
//! range costs nothing until the executor has checked it against the
//! pipeline bound.
//!
//! # Example
//!
//! ```rust
//! use zset_tsdb::redis::{BucketLayout, RangeQueryPlanner};
//!
//! let planner = RangeQueryPlanner::new(BucketLayout::new(100).unwrap());
//! let plan = planner.plan("p:", "cpu", 50, 250);
//! let ranges: Vec<(i64, i64)> = plan.iter().map(|b| (b.from, b.to)).collect();
//! assert_eq!(ranges, vec![(50, 99), (100, 199), (200, 250)]);
//! ```

use super::keys::BucketLayout;

use serde::Serialize;

/// One per-bucket sub-query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketRange {
    /// Bucket id
    pub bucket_id: i64,
    /// Sorted-set key of the bucket
    pub key: String,
    /// Inclusive lower score bound
    pub from: i64,
    /// Inclusive upper score bound
    pub to: i64,
}

/// Ordered sequence of bucket sub-queries for one series and window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    prefix: String,
    series_key: String,
    start: i64,
    stop: i64,
    layout: BucketLayout,
    /// `(first_bucket, last_bucket)`, `None` for an empty plan
    buckets: Option<(i64, i64)>,
}

impl QueryPlan {
    /// Requested range start
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Requested range stop
    pub fn stop(&self) -> i64 {
        self.stop
    }

    /// Series the plan targets
    pub fn series_key(&self) -> &str {
        &self.series_key
    }

    /// Number of buckets the plan covers
    pub fn len(&self) -> u64 {
        match self.buckets {
            // i128 so the full i64 span cannot overflow; it saturates at u64::MAX
            Some((first, last)) => {
                u64::try_from(i128::from(last) - i128::from(first) + 1).unwrap_or(u64::MAX)
            },
            None => 0,
        }
    }

    /// Whether the plan covers no bucket
    pub fn is_empty(&self) -> bool {
        self.buckets.is_none()
    }

    /// Bucket sub-queries in ascending time order
    pub fn iter(&self) -> impl Iterator<Item = BucketRange> + '_ {
        let ids = match self.buckets {
            Some((first, last)) => first..=last,
            #[allow(clippy::reversed_empty_ranges)]
            None => 1..=0,
        };
        ids.map(move |bucket_id| {
            let (bucket_start, bucket_end) = self.layout.bounds(bucket_id);
            BucketRange {
                bucket_id,
                key: self
                    .layout
                    .bucket_key(&self.prefix, &self.series_key, bucket_id),
                from: bucket_start.max(self.start),
                to: bucket_end.min(self.stop),
            }
        })
    }
}

/// Planner turning time windows into bucket sub-queries
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeQueryPlanner {
    layout: BucketLayout,
}

impl RangeQueryPlanner {
    /// Create a planner over the given bucket layout
    pub fn new(layout: BucketLayout) -> Self {
        Self { layout }
    }

    /// Bucket layout shared with the write path
    pub fn layout(&self) -> BucketLayout {
        self.layout
    }

    /// Plan a query of `[start, stop]` for one series
    ///
    /// `start > stop` yields an empty plan; `start == stop` yields one
    /// bucket with `from == to`.
    pub fn plan(&self, prefix: &str, series_key: &str, start: i64, stop: i64) -> QueryPlan {
        let buckets = if start > stop {
            None
        } else {
            Some((self.layout.bucket_id(start), self.layout.bucket_id(stop)))
        };

        QueryPlan {
            prefix: prefix.to_string(),
            series_key: series_key.to_string(),
            start,
            stop,
            layout: self.layout,
            buckets,
        }
    }
}
