//! Shared data model: measurements, work items and process records

pub mod measurement;
pub mod record;

pub use measurement::{merge, merge_into, Aggregates, FileAggregate, GroupKey, Measurement};
pub use record::{MergeOutcome, ProcessRecord, ProcessStatus, WorkItem};
