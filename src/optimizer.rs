//! Auto-optimizer (spec §4.6, component F): periodically measures direct
//! and per-proxy throughput against a configured HTTP target and retunes
//! `active_count` to the smallest top-`k` that covers measured local
//! bandwidth. Fetches a plain, bounded HTTP/1.0 `GET` over a raw
//! `TcpStream` rather than pulling in `hyper`/`reqwest` — this crate never
//! needs more than "read N bytes as fast as possible" (see DESIGN.md).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_shutdown::Shutdown;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::addr::{Host, Target};
use crate::pool::ProxyPool;
use crate::proxy::ProxyDescriptor;
use crate::socks;

pub struct OptimizerConfig {
    pub interval: Duration,
    pub probe_bytes: u64,
    pub url_host: String,
    pub url_port: u16,
    pub url_path: String,
    pub per_proxy_timeout: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            probe_bytes: 1024 * 1024,
            url_host: "speed.hetzner.de".into(),
            url_port: 80,
            url_path: "/100MB.bin".into(),
            per_proxy_timeout: Duration::from_secs(20),
        }
    }
}

/// Runs until `shutdown` is signalled. Each tick is spec §4.6's full
/// retune round; a measurement failure for an individual proxy only
/// excludes it from that round (spec §4.6 step 2), and a failed direct
/// measurement skips the whole round, leaving `active_count` untouched
/// (spec §9 "measurement unavailable").
pub async fn run(shutdown: Shutdown, pool: Arc<ProxyPool>, config: OptimizerConfig) {
    let mut ticker = tokio::time::interval(config.interval);
    loop {
        if shutdown.wrap_cancel(ticker.tick()).await.is_none() {
            return;
        }
        retune_once(&pool, &config).await;
    }
}

async fn retune_once(pool: &ProxyPool, config: &OptimizerConfig) {
    let b_direct = match measure_direct(config).await {
        Some(bps) => bps,
        None => {
            log::warn!("optimizer: direct bandwidth measurement failed, keeping active_count");
            return;
        }
    };

    let mut measured = Vec::new();
    for (id, descriptor) in pool.descriptors().iter().enumerate() {
        if !pool.is_alive(id) {
            continue;
        }
        match measure_via_proxy(descriptor, config).await {
            Some(bps) => {
                pool.set_measured_bandwidth(id, Some(bps));
                measured.push(bps);
            }
            None => {
                pool.set_measured_bandwidth(id, None);
                log::warn!("optimizer: proxy {id} excluded from this round, measurement failed");
            }
        }
    }

    let k = select_active_count(b_direct, measured);
    pool.set_active_count(k as u32);
    log::info!("optimizer: retuned active_count to {k} (direct {b_direct:.0} bps)");
}

/// Spec §4.6 step 3: smallest top-`k` whose summed throughput covers
/// `b_direct`, or every measured proxy if none suffices. Clamping to
/// `[1, total_proxies]` happens in [`ProxyPool::set_active_count`].
fn select_active_count(b_direct: f64, mut measured: Vec<f64>) -> usize {
    measured.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let mut sum = 0.0;
    for (i, bps) in measured.iter().enumerate() {
        sum += bps;
        if sum >= b_direct {
            return i + 1;
        }
    }
    measured.len()
}

async fn measure_direct(config: &OptimizerConfig) -> Option<f64> {
    let started = Instant::now();
    let stream = timeout(
        config.per_proxy_timeout,
        TcpStream::connect((config.url_host.as_str(), config.url_port)),
    )
    .await
    .ok()?
    .ok()?;
    let bytes = timeout(config.per_proxy_timeout, fetch_bounded(stream, config)).await.ok()?.ok()?;
    Some(bytes_per_second(bytes, started.elapsed()))
}

async fn measure_via_proxy(descriptor: &ProxyDescriptor, config: &OptimizerConfig) -> Option<f64> {
    let target = Target::new(Host::Name(config.url_host.clone()), config.url_port);
    let started = Instant::now();
    let stream = socks::connect_via(descriptor, &target, config.per_proxy_timeout)
        .await
        .ok()?;
    let bytes = timeout(config.per_proxy_timeout, fetch_bounded(stream, config)).await.ok()?.ok()?;
    Some(bytes_per_second(bytes, started.elapsed()))
}

async fn fetch_bounded<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    config: &OptimizerConfig,
) -> std::io::Result<u64> {
    let request = format!(
        "GET {} HTTP/1.0\r\nHost: {}\r\nRange: bytes=0-{}\r\nConnection: close\r\n\r\n",
        config.url_path,
        config.url_host,
        config.probe_bytes.saturating_sub(1),
    );
    stream.write_all(request.as_bytes()).await?;

    let mut buf = [0u8; 16 * 1024];
    let mut total = 0u64;
    while total < config.probe_bytes {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        total += n as u64;
    }
    Ok(total)
}

fn bytes_per_second(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / secs
}
