//! Logging configuration and initialization

use crate::app::config::AppConfig;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Initialize tracing for the process
///
/// `RUST_LOG` wins over the verbosity-derived level when set.
pub fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level()));

    let initialized = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.verbose >= 2)
        .with_thread_ids(config.verbose >= 3)
        .with_line_number(config.verbose >= 3)
        .try_init();

    // Tests and embedders may have installed a subscriber already
    if initialized.is_ok() {
        debug!(
            verbosity = config.verbose,
            objects = ?config.object_store.backend,
            queue = ?config.queue.backend,
            store = ?config.store.backend,
            "Logging initialized"
        );
    }
}
