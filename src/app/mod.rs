//! Application module
//!
//! Configuration loading, logging setup and the runtime wiring behind each
//! CLI command.

pub mod config;
pub mod logging;
pub mod runtime;

pub use config::{AppConfig, ServerConfig};
pub use logging::init_logging;
pub use runtime::{run_server, run_standalone, run_worker, Services};
