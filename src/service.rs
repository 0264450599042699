//! Service wiring: builds the driver from config, spawns the pool and the
//! feed, and orchestrates shutdown on signal.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::{DriverConfig, InvokerConfig},
    driver::{ContainerHandle, DockerDriver, SandboxDriver},
    feed::{MessageSource, WorkFeed},
    metrics::InvokerMetrics,
    pool::{AccountantCorruption, ContainerPool, PoolContext},
    store::{ActionStore, ActivationSink, LogForwarder, Sinks},
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("fatal configuration: {0}")]
    Config(String),
    #[error("sandbox driver initialization failed: {0}")]
    DriverInit(String),
    #[error(transparent)]
    Accountant(#[from] AccountantCorruption),
    #[error("unrecoverable internal failure: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            ServiceError::Config(_) => 2,
            ServiceError::DriverInit(_) => 3,
            ServiceError::Accountant(_) | ServiceError::Internal(_) => 4,
        }
    }
}

pub struct Service {
    ctx: PoolContext,
    source: Arc<dyn MessageSource>,
    actions: Arc<dyn ActionStore>,
}

impl Service {
    pub fn new(
        config: InvokerConfig,
        source: Arc<dyn MessageSource>,
        actions: Arc<dyn ActionStore>,
        results: Arc<dyn ActivationSink>,
        logs: Arc<dyn LogForwarder>,
    ) -> Result<Self, ServiceError> {
        let driver: Arc<dyn SandboxDriver> = match &config.driver {
            DriverConfig::Docker => Arc::new(
                DockerDriver::new(None, None, config.max_response_bytes)
                    .map_err(|e| ServiceError::DriverInit(e.to_string()))?,
            ),
            DriverConfig::DockerAt { address, network } => Arc::new(
                DockerDriver::new(
                    Some(address.as_str()),
                    network.clone(),
                    config.max_response_bytes,
                )
                .map_err(|e| ServiceError::DriverInit(e.to_string()))?,
            ),
        };

        let metrics = Arc::new(InvokerMetrics::new());
        let ctx = PoolContext {
            driver,
            metrics,
            sinks: Sinks { results, logs },
            config: Arc::new(config),
        };

        Ok(Self {
            ctx,
            source,
            actions,
        })
    }

    pub async fn run(self) -> Result<(), ServiceError> {
        let invoker_id = self.ctx.config.invoker_id.clone();
        info!(%invoker_id, "starting invoker");

        cleanup_orphans(self.ctx.driver.as_ref()).await;

        let (pool_handle, mut pool_join) = ContainerPool::spawn(self.ctx.clone());

        let cancel = CancellationToken::new();
        let feed = WorkFeed::new(
            self.source.clone(),
            self.actions.clone(),
            self.ctx.sinks.results.clone(),
            pool_handle.clone(),
            self.ctx.metrics.clone(),
            self.ctx.config.clone(),
        );
        let feed_join = tokio::spawn(feed.run(cancel.child_token()));

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
            }
            result = &mut pool_join => {
                // The pool never exits on its own unless the accountant is
                // corrupt.
                cancel.cancel();
                let _ = feed_join.await;
                return flatten_pool_result(result);
            }
        }

        // Orderly shutdown: stop the feed first so nothing new reaches the
        // pool, then drain the pool.
        cancel.cancel();
        if let Err(e) = feed_join.await {
            warn!(error = %e, "feed task panicked during shutdown");
        }
        pool_handle.shutdown().await;
        flatten_pool_result(pool_join.await)
    }
}

fn flatten_pool_result(
    result: Result<Result<(), AccountantCorruption>, tokio::task::JoinError>,
) -> Result<(), ServiceError> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(corruption)) => Err(corruption.into()),
        Err(join) => Err(ServiceError::Internal(format!("pool task panicked: {}", join))),
    }
}

/// Destroy containers left behind by a previous invoker process. A crashed
/// invoker must not keep host memory reserved through orphans.
async fn cleanup_orphans(driver: &dyn SandboxDriver) {
    let orphans = match driver.list_containers().await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "orphan enumeration failed, skipping cleanup");
            return;
        }
    };
    if orphans.is_empty() {
        return;
    }
    info!(count = orphans.len(), "destroying orphaned containers");
    for id in orphans {
        let handle = ContainerHandle {
            id: id.clone(),
            address: String::new(),
            kind: String::new(),
            memory_mb: 0,
        };
        if let Err(e) = driver.destroy(&handle).await {
            warn!(container = %id, error = %e, "failed to destroy orphan");
        }
    }
}
