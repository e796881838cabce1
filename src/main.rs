use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::error;

use trc_aggregator::app::{self, AppConfig};
use trc_aggregator::storage::ObjectStoreBackend;

/// Distributed per-group min/max/sum/count aggregation
#[derive(Parser)]
#[command(name = "trc")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to a TOML configuration file
    #[arg(short = 'c', long, global = true, env = "TRC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the trigger route against shared backends
    Serve {
        /// Address to listen on
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Run merge loops against shared backends
    Worker {
        #[command(flatten)]
        worker: WorkerArgs,
    },
    /// Run the server and workers in one process on in-memory coordination
    Standalone {
        /// Address to listen on
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Directory holding one subdirectory per container
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Container (subdirectory) to aggregate
        #[arg(long)]
        container: Option<String>,

        #[command(flatten)]
        worker: WorkerArgs,
    },
}

#[derive(Args)]
struct WorkerArgs {
    /// Merge loops to run in this process
    #[arg(long)]
    concurrency: Option<usize>,

    /// Parse tasks per file (defaults to available cores)
    #[arg(long)]
    parallelism: Option<usize>,
}

impl WorkerArgs {
    fn apply(self, config: &mut AppConfig) {
        if let Some(concurrency) = self.concurrency {
            config.worker.concurrency = concurrency;
        }
        if let Some(parallelism) = self.parallelism {
            config.worker.parallelism = Some(parallelism);
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };
    config.verbose = cli.verbose;
    app::init_logging(&config);

    let result = match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            app::run_server(config).await
        }
        Commands::Worker { worker } => {
            worker.apply(&mut config);
            app::run_worker(config).await
        }
        Commands::Standalone {
            bind,
            data_dir,
            container,
            worker,
        } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(dir) = data_dir {
                config.object_store.backend = ObjectStoreBackend::File;
                config.object_store.root = dir;
            }
            if let Some(container) = container {
                config.object_store.container = container;
            }
            worker.apply(&mut config);
            app::run_standalone(config).await
        }
    };

    if let Err(e) = result {
        error!("Fatal error: {:#}", e);
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
