//! In-process aggregation engine
//!
//! - `row` - zero-allocation parser and bucket table for one byte range
//! - `reducer` - line-aligned split, parallel parse, join and merge of a file
//! - `hash` - incremental key hashing used by the parser

pub mod hash;
pub mod reducer;
pub mod row;

pub use hash::{Fnv1a, KeyHasher};
pub use reducer::{split_ranges, FileReducer, FileReport};
pub use row::{aggregate_range, ChunkResult, RowAggregator, BUCKETS, EXPECTED_KEYS};
