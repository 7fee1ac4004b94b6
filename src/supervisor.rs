//! Top-level wiring (component G): builds the pool, spawns the health
//! probe and optional auto-optimizer as background tasks, runs the
//! listener to completion, then tears the background tasks down. Mirrors
//! this codebase's `cpxy` binary's shutdown dance — signal, tell the
//! listener to stop, wait with a watchdog timeout — generalized from one
//! server loop to this crate's extra background tasks.

use std::sync::Arc;
use std::time::Duration;

use async_shutdown::Shutdown;
use tokio::net::TcpListener;

use crate::health;
use crate::listener;
use crate::optimizer::{self, OptimizerConfig};
use crate::pool::ProxyPool;
use crate::proxy::ProxyDescriptor;
use crate::session::SessionConfig;

pub struct SupervisorConfig {
    pub descriptors: Vec<ProxyDescriptor>,
    pub max_consecutive_failures: u32,
    pub health_probe_interval: Duration,
    pub connect_timeout: Duration,
    pub grace_period: Duration,
    pub auto_optimize: bool,
    pub optimizer: OptimizerConfig,
}

/// Runs until `shutdown` fires and the listener's own grace period
/// finishes; background tasks (health probe, optimizer) are aborted once
/// the listener returns since neither holds anything worth draining.
pub async fn run(shutdown: Shutdown, listener_sock: TcpListener, config: SupervisorConfig) -> anyhow::Result<()> {
    let pool = Arc::new(ProxyPool::with_max_failures(
        config.descriptors,
        config.max_consecutive_failures,
    ));
    let session_config = Arc::new(SessionConfig {
        connect_timeout: config.connect_timeout,
    });

    let health_task = tokio::spawn(health::run(
        shutdown.clone(),
        pool.clone(),
        config.health_probe_interval,
    ));

    let optimizer_task = config.auto_optimize.then(|| {
        tokio::spawn(optimizer::run(shutdown.clone(), pool.clone(), config.optimizer))
    });

    let result = listener::run(
        shutdown,
        listener_sock,
        pool,
        session_config,
        config.grace_period,
    )
    .await;

    health_task.abort();
    if let Some(task) = optimizer_task {
        task.abort();
    }

    result
}
