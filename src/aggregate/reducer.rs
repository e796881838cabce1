//! Parallel file reducer
//!
//! Splits a file buffer into line-aligned ranges, aggregates each range on
//! the rayon pool, joins, then merges the partial results on the calling
//! thread. Ranges are disjoint and every task owns its table, so nothing is
//! shared until the join.

use rayon::prelude::*;
use std::ops::Range;
use tracing::debug;

use super::row::{aggregate_range, ChunkResult};
use crate::model::{merge_into, FileAggregate};

/// Aggregate of one file plus row diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileReport {
    pub aggregate: FileAggregate,
    pub rows: u64,
    pub rejected: u64,
    pub first_rejected_offset: Option<usize>,
}

impl FileReport {
    fn absorb(&mut self, chunk: ChunkResult) {
        merge_into(&mut self.aggregate, chunk.aggregates);
        self.rows += chunk.rows;
        self.rejected += chunk.rejected;
        self.first_rejected_offset = match (self.first_rejected_offset, chunk.first_rejected_offset) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Splits and reduces whole file buffers
#[derive(Debug, Clone, Copy)]
pub struct FileReducer {
    parallelism: usize,
}

impl FileReducer {
    /// Reducer splitting each buffer into at most `parallelism` ranges
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
        }
    }

    /// Reducer sized to the machine's available parallelism
    pub fn with_available_parallelism() -> Self {
        Self::new(
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        )
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Aggregate a whole file buffer
    pub fn reduce(&self, data: &[u8]) -> FileReport {
        let ranges = split_ranges(data, self.parallelism);
        debug!(
            bytes = data.len(),
            ranges = ranges.len(),
            "Reducing file buffer"
        );

        let chunks: Vec<ChunkResult> = ranges
            .into_par_iter()
            .map(|range| {
                let start = range.start;
                aggregate_range(&data[range]).offset_by(start)
            })
            .collect();

        let mut report = FileReport::default();
        for chunk in chunks {
            report.absorb(chunk);
        }
        report
    }
}

impl Default for FileReducer {
    fn default() -> Self {
        Self::with_available_parallelism()
    }
}

/// Line-aligned ranges covering `data`, about `len / parts` bytes each
///
/// Each split point moves forward to just past the next newline, so no row
/// straddles two ranges. The last range always ends at `data.len()`. An empty
/// buffer yields no ranges.
pub fn split_ranges(data: &[u8], parts: usize) -> Vec<Range<usize>> {
    let len = data.len();
    let parts = parts.max(1);
    let mut chunk_size = len / parts;
    if chunk_size == 0 {
        chunk_size = len;
    }

    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    let mut offset = 0;

    while offset < len {
        offset += chunk_size;
        if offset >= len {
            ranges.push(start..len);
            break;
        }

        match data[offset..].iter().position(|&b| b == b'\n') {
            Some(nl) => {
                offset += nl + 1;
                ranges.push(start..offset);
                start = offset;
            }
            None => {
                ranges.push(start..len);
                break;
            }
        }
    }

    ranges
}
