//! Work items and the shared process record
//!
//! Both types travel as JSON: work items through the queue, process records
//! through the keyed store and the HTTP response. Field names are camelCase
//! on the wire.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::measurement::{merge_into, Aggregates, FileAggregate};

/// One dispatched unit of work: a single source file within a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub process_uuid: String,
    pub filename: String,
}

impl WorkItem {
    pub fn new(process_uuid: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            process_uuid: process_uuid.into(),
            filename: filename.into(),
        }
    }
}

/// Lifecycle status of a process record
///
/// `TimedOut` is never persisted. The trigger endpoint returns it when its
/// wait budget ran out before the record reached `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    Processing,
    Complete,
    TimedOut,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Processing => "Processing",
            Self::Complete => "Complete",
            Self::TimedOut => "TimedOut",
        };
        f.write_str(s)
    }
}

/// Result of applying one file aggregate to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The file was merged and counted
    Merged,
    /// The file was merged earlier; the record is unchanged
    Duplicate,
}

/// Shared, mutable state of one end-to-end aggregation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub result: Aggregates,
    pub process_uuid: String,
    pub status: ProcessStatus,
    pub processed_count: u64,
    /// Total files dispatched; unknown until the orchestrator finishes publishing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_count: Option<u64>,
    #[serde(default)]
    pub merged_files: BTreeSet<String>,
}

impl ProcessRecord {
    /// Fresh record for a run that has not dispatched anything yet
    pub fn new(process_uuid: impl Into<String>) -> Self {
        Self {
            result: Aggregates::new(),
            process_uuid: process_uuid.into(),
            status: ProcessStatus::Processing,
            processed_count: 0,
            expected_count: None,
            merged_files: BTreeSet::new(),
        }
    }

    /// Merge one file's aggregate, at most once per filename
    pub fn apply_file(&mut self, filename: &str, aggregate: FileAggregate) -> MergeOutcome {
        if self.merged_files.contains(filename) {
            return MergeOutcome::Duplicate;
        }
        merge_into(&mut self.result, aggregate);
        self.merged_files.insert(filename.to_string());
        self.processed_count += 1;
        self.refresh_status();
        MergeOutcome::Merged
    }

    /// Record how many files were dispatched for this run
    pub fn set_expected(&mut self, expected: u64) {
        self.expected_count = Some(expected);
        self.refresh_status();
    }

    /// True once every dispatched file has been merged
    pub fn is_complete(&self) -> bool {
        self.status == ProcessStatus::Complete
            || self.expected_count == Some(self.processed_count)
    }

    /// Record as reported to the trigger caller; `waited_out` marks an
    /// incomplete record as `TimedOut`
    pub fn into_response(mut self, waited_out: bool) -> Self {
        if self.is_complete() {
            self.status = ProcessStatus::Complete;
        } else if waited_out {
            self.status = ProcessStatus::TimedOut;
        }
        self
    }

    fn refresh_status(&mut self) {
        if self.expected_count == Some(self.processed_count) {
            self.status = ProcessStatus::Complete;
        }
    }
}
