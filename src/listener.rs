//! Listener / acceptor (spec §4.5, component E). Binds, accepts, and spawns
//! one session task per client, following the `run_server` accept-loop
//! shape this codebase uses elsewhere — with one deliberate departure: the
//! teacher wraps each connection in `shutdown.wrap_cancel(...)`, which
//! drops it the instant shutdown is signalled. Spec §4.5/§8 scenario 5
//! requires in-flight sessions to keep running until a grace period
//! elapses, so sessions instead hold a `delay_shutdown_token` (which only
//! postpones `wait_shutdown_complete`, it doesn't cancel anything) while
//! the accept loop alone is still wrapped in `wrap_cancel` to stop
//! accepting immediately.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_shutdown::Shutdown;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::pool::ProxyPool;
use crate::session::{self, SessionConfig};

/// `listener` is already bound by the caller (see `main.rs`) so a bind
/// failure can be told apart from every other startup error and mapped to
/// its own exit code (spec §6).
pub async fn run(
    shutdown: Shutdown,
    listener: TcpListener,
    pool: Arc<ProxyPool>,
    config: Arc<SessionConfig>,
    grace_period: Duration,
) -> anyhow::Result<()> {
    log::info!(
        "multisocks listening on {}",
        listener.local_addr().context("reading listener address")?
    );

    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    while let Some(accepted) = shutdown.wrap_cancel(listener.accept()).await {
        let (conn, peer) = accepted.context("accepting connection")?;
        log::debug!("accepted connection from {peer}");

        handles.retain(|h| !h.is_finished());

        let pool = pool.clone();
        let config = config.clone();
        let Some(guard) = shutdown.delay_shutdown_token().ok() else {
            log::warn!("rejecting {peer}: already shutting down");
            continue;
        };

        handles.push(tokio::spawn(async move {
            let _guard = guard;
            session::handle_session(conn, pool, config, peer).await;
        }));
    }

    log::info!("no longer accepting; draining in-flight sessions (grace period {grace_period:?})");
    if tokio::time::timeout(grace_period, shutdown.wait_shutdown_complete())
        .await
        .is_err()
    {
        log::warn!("grace period elapsed with sessions still in flight; forcing them closed");
        for handle in &handles {
            handle.abort();
        }
    }

    Ok(())
}
