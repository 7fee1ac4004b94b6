//! Background health-probe task (spec §4.3 "Health probe task"). Runs a
//! full sweep of every descriptor on a fixed interval (default 60s) and,
//! between sweeps, opportunistically re-probes whichever proxies have an
//! elapsed backoff deadline — both drive the same `mark_probe_success`/
//! `mark_probe_failure` pool entry points as the session-reported outcomes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_shutdown::Shutdown;
use socks5_impl::protocol::{
    handshake::Request as HandshakeRequest, handshake::Response as HandshakeResponse,
    AsyncStreamOperation, AuthMethod,
};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::pool::ProxyPool;
use crate::proxy::{ProxyDescriptor, ProxyId};

const PROBE_DEADLINE: Duration = Duration::from_secs(5);
const AD_HOC_TICK: Duration = Duration::from_secs(5);

pub async fn run(shutdown: Shutdown, pool: Arc<ProxyPool>, sweep_interval: Duration) {
    let mut ticker = tokio::time::interval(AD_HOC_TICK);
    let mut last_sweep = Instant::now();

    loop {
        if shutdown.wrap_cancel(ticker.tick()).await.is_none() {
            return;
        }

        if last_sweep.elapsed() >= sweep_interval {
            probe_ids(&pool, (0..pool.len()).collect()).await;
            last_sweep = Instant::now();
        } else {
            let due = pool.due_for_reprobe();
            if !due.is_empty() {
                probe_ids(&pool, due).await;
            }
        }
    }
}

async fn probe_ids(pool: &ProxyPool, ids: Vec<ProxyId>) {
    for id in ids {
        let descriptor = pool.descriptor(id).clone();
        if probe_once(&descriptor).await {
            pool.mark_probe_success(id);
        } else {
            pool.mark_probe_failure(id);
        }
    }
}

/// TCP connect plus, for SOCKS5/5h, method negotiation only — no CONNECT
/// request is sent, matching spec §4.3's "minimal SOCKS greeting".
async fn probe_once(descriptor: &ProxyDescriptor) -> bool {
    let attempt = async {
        let mut stream = TcpStream::connect((descriptor.host.as_str(), descriptor.port))
            .await
            .ok()?;
        if descriptor.scheme.is_socks5_family() {
            let methods = if descriptor.credentials.is_some() {
                vec![AuthMethod::NoAuth, AuthMethod::UserPass]
            } else {
                vec![AuthMethod::NoAuth]
            };
            HandshakeRequest::new(methods)
                .write_to_async_stream(&mut stream)
                .await
                .ok()?;
            HandshakeResponse::retrieve_from_async_stream(&mut stream)
                .await
                .ok()?;
        }
        Some(())
    };
    matches!(timeout(PROBE_DEADLINE, attempt).await, Ok(Some(())))
}
