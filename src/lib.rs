//! # trc-aggregator
//!
//! Per-group min/max/sum/count statistics over `<name>;<value>` row files
//! held in object storage, computed by fanning one work item per file out
//! to stateless workers and merging their results into a shared record.
//!
//! ## Modules
//!
//! - `aggregate` - Row parser and the parallel per-file reducer
//! - `model` - Measurements, work items and process records
//! - `pipeline` - Orchestrator, record store and worker merge loop
//! - `storage` - Object store, queue and keyed store traits plus backends
//! - `retry` - Backoff policy for collaborator calls
//! - `api` - HTTP trigger route
//! - `app` - Configuration, logging and runtime wiring
pub mod aggregate;
pub mod api;
pub mod app;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod retry;
pub mod storage;

pub use error::{AggregatorError, ConfigError, ErrorClass, Result};
