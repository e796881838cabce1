//! Distributed fan-out, merge and completion protocol

pub mod orchestrator;
pub mod record;
pub mod worker;

pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use record::RecordStore;
pub use worker::{run_pool, Outcome, Worker, WorkerConfig};
