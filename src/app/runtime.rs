//! Runtime wiring for the `serve`, `worker` and `standalone` commands

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::ApiServer;
use crate::app::config::AppConfig;
use crate::pipeline::{run_pool, Orchestrator, RecordStore, Worker};
use crate::storage::{
    instance_name, Backends, ObjectStoreBackend, QueueBackend, StorageFactory, StoreBackend,
};

/// Orchestrator and worker built over one set of backends
pub struct Services {
    pub orchestrator: Arc<Orchestrator>,
    pub worker: Arc<Worker>,
}

impl Services {
    pub fn new(config: &AppConfig, backends: &Backends, instance: &str) -> Self {
        let records =
            RecordStore::from_backends(backends, instance, config.store.clone(), config.retry.clone());

        let orchestrator = Orchestrator::new(
            backends.objects.clone(),
            backends.queue.clone(),
            records.clone(),
            config.retry.clone(),
            config.orchestrator.clone(),
            config.object_store.container.clone(),
        );

        let worker = Worker::new(
            backends.objects.clone(),
            backends.queue.clone(),
            records,
            config.retry.clone(),
            &config.worker,
            config.object_store.container.clone(),
            config.queue.max_deliveries,
        );

        Self {
            orchestrator: Arc::new(orchestrator),
            worker: Arc::new(worker),
        }
    }
}

async fn connect(config: &AppConfig, instance: &str) -> Result<Backends> {
    config.validate()?;
    StorageFactory::from_config(&config.backend_settings(instance))
        .await
        .context("Failed to initialize backends")
}

fn require_shared(config: &AppConfig, command: &str) -> Result<()> {
    if !config.has_shared_backends() {
        bail!(
            "`{}` needs shared queue and store backends (set queue.backend and store.backend); \
             use `standalone` to run everything in one process",
            command
        );
    }
    if config.object_store.backend == ObjectStoreBackend::Memory {
        bail!("`{}` cannot read from the in-memory object store", command);
    }
    Ok(())
}

/// Flip the returned receiver to `true` on Ctrl-C
fn shutdown_on_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
        let _ = tx.send(true);
    });
    rx
}

async fn stopped(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Serve the trigger route against shared backends
pub async fn run_server(config: AppConfig) -> Result<()> {
    require_shared(&config, "serve")?;
    let instance = instance_name();
    let backends = connect(&config, &instance).await?;
    let services = Services::new(&config, &backends, &instance);

    let shutdown = shutdown_on_signal();
    ApiServer::new(services.orchestrator, config.server.bind)
        .serve(stopped(shutdown))
        .await
        .context("API server failed")
}

/// Run merge loops against shared backends until Ctrl-C
pub async fn run_worker(config: AppConfig) -> Result<()> {
    require_shared(&config, "worker")?;
    let instance = instance_name();
    let backends = connect(&config, &instance).await?;
    let services = Services::new(&config, &backends, &instance);

    info!(
        instance = %instance,
        concurrency = config.worker.concurrency,
        "Starting worker"
    );
    run_pool(services.worker, config.worker.concurrency, shutdown_on_signal()).await;
    Ok(())
}

/// Server plus in-process workers over an in-memory queue and store
pub async fn run_standalone(mut config: AppConfig) -> Result<()> {
    config.queue.backend = QueueBackend::Memory;
    config.store.backend = StoreBackend::Memory;
    if config.object_store.backend == ObjectStoreBackend::Memory {
        warn!("The in-memory object store starts empty; every run will be trivially complete");
    }

    let instance = instance_name();
    let backends = connect(&config, &instance).await?;
    let services = Services::new(&config, &backends, &instance);

    let shutdown = shutdown_on_signal();
    let workers = tokio::spawn(run_pool(
        services.worker,
        config.worker.concurrency,
        shutdown.clone(),
    ));

    let served = ApiServer::new(services.orchestrator, config.server.bind)
        .serve(stopped(shutdown))
        .await;

    if let Err(e) = workers.await {
        warn!("Worker pool ended abnormally: {}", e);
    }
    served.context("API server failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_requires_shared_backends() {
        let config = AppConfig::default();
        let err = require_shared(&config, "serve").unwrap_err();
        assert!(err.to_string().contains("standalone"));
    }

    #[test]
    fn test_shared_backends_pass() {
        let mut config = AppConfig::default();
        config.queue.backend = QueueBackend::Redis;
        config.store.backend = StoreBackend::Redis;
        require_shared(&config, "worker").unwrap();

        config.object_store.backend = ObjectStoreBackend::Memory;
        assert!(require_shared(&config, "worker").is_err());
    }
}
