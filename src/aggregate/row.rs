//! Row aggregator: one line-aligned byte range to per-group statistics
//!
//! Rows have the fixed form `<name>;<value>\n` where value is `-?D.D` or
//! `-?DD.D`. This loop dominates total runtime, so it avoids every general
//! purpose facility it can:
//!
//! - the key hash is computed while scanning for `;`, never in a second pass;
//! - values are decoded by fixed-position digit arithmetic into tenths;
//! - keys are borrowed from the input buffer until the range is finished;
//! - groups live in a fixed bucket table over a preallocated record array.
//!
//! A hash match is only a candidate: the stored key bytes are compared before
//! a row is folded into an existing group.

use std::marker::PhantomData;

use super::hash::{Fnv1a, KeyHasher};
use crate::model::{Aggregates, GroupKey, Measurement};

/// Bucket count of the lookup table; must be a power of two
pub const BUCKETS: usize = 1 << 12;

/// Distinct keys the record array is sized for up front
pub const EXPECTED_KEYS: usize = 10_000;

/// Output of one parse task over one byte range
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkResult {
    pub aggregates: Aggregates,
    /// Rows folded into `aggregates`
    pub rows: u64,
    /// Malformed rows skipped
    pub rejected: u64,
    /// Byte offset of the first skipped row
    pub first_rejected_offset: Option<usize>,
}

impl ChunkResult {
    /// Shift reported offsets by the start of the range within its file
    pub fn offset_by(mut self, base: usize) -> Self {
        self.first_rejected_offset = self.first_rejected_offset.map(|o| o + base);
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    hash: u64,
    index: usize,
}

struct Slot<'a> {
    key: &'a str,
    measurement: Measurement,
}

/// Single-threaded aggregator over rows borrowed from one buffer
pub struct RowAggregator<'a, H: KeyHasher = Fnv1a> {
    buckets: Vec<Vec<Entry>>,
    slots: Vec<Slot<'a>>,
    rows: u64,
    rejected: u64,
    first_rejected_offset: Option<usize>,
    _hasher: PhantomData<H>,
}

impl<'a> RowAggregator<'a, Fnv1a> {
    pub fn new() -> Self {
        Self::with_capacity(EXPECTED_KEYS)
    }
}

impl Default for RowAggregator<'_, Fnv1a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, H: KeyHasher> RowAggregator<'a, H> {
    /// Aggregator whose record array is preallocated for `expected_keys`
    ///
    /// Cardinality above the preallocation grows the array; the bucket table
    /// is fixed, so chains just get longer.
    pub fn with_capacity(expected_keys: usize) -> Self {
        Self {
            buckets: vec![Vec::new(); BUCKETS],
            slots: Vec::with_capacity(expected_keys),
            rows: 0,
            rejected: 0,
            first_rejected_offset: None,
            _hasher: PhantomData,
        }
    }

    /// Parse every row of `data`
    ///
    /// A final row without a trailing newline is still parsed. Malformed rows
    /// are skipped through their newline and counted.
    pub fn feed(&mut self, data: &'a [u8]) {
        let len = data.len();
        let mut pos = 0;

        'rows: while pos < len {
            let row_start = pos;
            let mut hash = H::start();
            let mut cursor = pos;

            loop {
                if cursor == len {
                    self.reject(row_start);
                    return;
                }
                match data[cursor] {
                    b';' => break,
                    b'\n' => {
                        self.reject(row_start);
                        pos = cursor + 1;
                        continue 'rows;
                    }
                    b => hash = H::step(hash, b),
                }
                cursor += 1;
            }

            let key = &data[row_start..cursor];
            let value_start = cursor + 1;

            let Some((value, consumed)) = parse_tenths(&data[value_start..]) else {
                self.reject(row_start);
                pos = next_line(data, value_start);
                continue;
            };
            pos = value_start + consumed;

            if self.record(hash, key, value) {
                self.rows += 1;
            } else {
                self.reject(row_start);
            }
        }
    }

    /// Number of distinct groups seen so far
    pub fn groups(&self) -> usize {
        self.slots.len()
    }

    /// Consume the aggregator into an owned chunk result
    pub fn finish(self) -> ChunkResult {
        let aggregates = self
            .slots
            .into_iter()
            .map(|slot| (GroupKey::from(slot.key), slot.measurement))
            .collect();

        ChunkResult {
            aggregates,
            rows: self.rows,
            rejected: self.rejected,
            first_rejected_offset: self.first_rejected_offset,
        }
    }

    /// Fold `value` into the group for `key`; false if the key is unusable
    #[inline(always)]
    fn record(&mut self, hash: u64, key: &'a [u8], value: i64) -> bool {
        let bucket = &mut self.buckets[(hash as usize) & (BUCKETS - 1)];

        for entry in bucket.iter() {
            if entry.hash != hash {
                continue;
            }
            let slot = &mut self.slots[entry.index];
            if slot.key.as_bytes() == key {
                slot.measurement.record(value);
                return true;
            }
        }

        if key.is_empty() {
            return false;
        }
        let Ok(key) = std::str::from_utf8(key) else {
            return false;
        };

        bucket.push(Entry {
            hash,
            index: self.slots.len(),
        });
        self.slots.push(Slot {
            key,
            measurement: Measurement::new(value),
        });
        true
    }

    fn reject(&mut self, row_start: usize) {
        self.rejected += 1;
        self.first_rejected_offset.get_or_insert(row_start);
    }
}

/// Aggregate one range with the default hasher
pub fn aggregate_range(data: &[u8]) -> ChunkResult {
    let mut aggregator = RowAggregator::new();
    aggregator.feed(data);
    aggregator.finish()
}

/// Decode `-?D.D` / `-?DD.D` at the start of `bytes` into tenths
///
/// Returns the value and the bytes consumed, including the terminating
/// newline. End of input also terminates a value.
#[inline(always)]
fn parse_tenths(bytes: &[u8]) -> Option<(i64, usize)> {
    let (negative, digits) = match bytes {
        [b'-', rest @ ..] => (true, rest),
        _ => (false, bytes),
    };

    let (magnitude, used, rest) = match digits {
        [a @ b'0'..=b'9', b'.', c @ b'0'..=b'9', rest @ ..] => {
            (i64::from(a - b'0') * 10 + i64::from(c - b'0'), 3, rest)
        }
        [a @ b'0'..=b'9', b @ b'0'..=b'9', b'.', c @ b'0'..=b'9', rest @ ..] => (
            i64::from(a - b'0') * 100 + i64::from(b - b'0') * 10 + i64::from(c - b'0'),
            4,
            rest,
        ),
        _ => return None,
    };

    let terminator = match rest.first() {
        None => 0,
        Some(b'\n') => 1,
        Some(_) => return None,
    };

    let value = if negative { -magnitude } else { magnitude };
    Some((value, usize::from(negative) + used + terminator))
}

/// Position just past the next newline at or after `from`, or the end
fn next_line(data: &[u8], from: usize) -> usize {
    data[from..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(data.len(), |nl| from + nl + 1)
}
