//! Per-group summary statistics and the merge rule shared by every layer
//!
//! Values are integer tenths of a unit, so `-2.1` is stored as `-21`.
//! Merging is associative and commutative, which lets chunk results, file
//! aggregates and process records all be combined in any order.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

/// Four-tuple summary of every observation seen for one group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    pub min: i64,
    pub max: i64,
    pub sum: i64,
    pub count: u64,
}

impl Measurement {
    /// Measurement holding a single observation
    #[inline]
    pub fn new(value: i64) -> Self {
        Self {
            min: value,
            max: value,
            sum: value,
            count: 1,
        }
    }

    /// Fold one more observation in place
    #[inline(always)]
    pub fn record(&mut self, value: i64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
    }

    /// Combine another measurement of the same group into this one
    ///
    /// A side with `count == 0` carries no observations and is ignored, so an
    /// empty measurement never drags `min`/`max` toward zero.
    #[inline]
    pub fn merge(&mut self, other: &Measurement) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.count += other.count;
    }

    /// Mean in whole units, for display
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum as f64 / self.count as f64 / 10.0)
        }
    }
}

/// Identifier rows are grouped by (a station name)
///
/// Equality is exact byte equality. Keys are UTF-8 so they can be used as
/// JSON object keys in the persisted record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(Box<str>);

impl GroupKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<&str> for GroupKey {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for GroupKey {
    fn from(value: String) -> Self {
        Self(value.into_boxed_str())
    }
}

impl Borrow<str> for GroupKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Group key to measurement mapping used for chunk, file and process results
pub type Aggregates = BTreeMap<GroupKey, Measurement>;

/// Merged result of every chunk of one source file
pub type FileAggregate = Aggregates;

/// Merge `other` into `target` using the per-group merge rule
pub fn merge_into(target: &mut Aggregates, other: Aggregates) {
    for (key, measurement) in other {
        match target.get_mut(&key) {
            Some(existing) => existing.merge(&measurement),
            None => {
                target.insert(key, measurement);
            }
        }
    }
}

/// Merge two mappings into a new one
pub fn merge(mut left: Aggregates, right: Aggregates) -> Aggregates {
    if left.len() < right.len() {
        let mut right = right;
        merge_into(&mut right, left);
        return right;
    }
    merge_into(&mut left, right);
    left
}
