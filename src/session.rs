//! Per-connection session handler (spec §4.4, component D): downstream
//! handshake, upstream acquisition with bounded retry, then bidirectional
//! splice. One [`handle_session`] call is the entire life of a connection,
//! mirroring the per-connection task this codebase's `run_server` loop
//! pattern spawns.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::addr::Target;
use crate::error::{Outcome, ProxyError};
use crate::pool::ProxyPool;
use crate::proxy::ProxyId;
use crate::socks;

/// Spec §4.4 step 3: distinct proxy picks attempted before giving up.
pub const N_ATTEMPTS: usize = 3;

/// Splice buffer size, within spec §5's "16-64 KiB" guidance.
const COPY_BUF_SIZE: usize = 32 * 1024;

pub struct SessionConfig {
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub async fn handle_session(
    mut client: TcpStream,
    pool: Arc<ProxyPool>,
    config: Arc<SessionConfig>,
    peer: SocketAddr,
) {
    let req = match socks::negotiate_client(&mut client).await {
        Ok(req) => req,
        Err(neg_err) => {
            if let Some(kind) = neg_err.kind {
                let _ = socks::reply_failure(&mut client, kind, &neg_err.source).await;
            }
            log::warn!("session {peer}: downstream negotiation failed: {}", neg_err.source);
            return;
        }
    };

    let (mut upstream, pid) = match acquire_upstream(&pool, &config, &req.target).await {
        Ok(acquired) => acquired,
        Err(e) => {
            log::warn!("session {peer}: no usable upstream for {}: {e}", req.target);
            let _ = socks::reply_failure(&mut client, req.kind, &e).await;
            return;
        }
    };

    if let Err(e) = socks::reply_success(&mut client, req.kind).await {
        log::warn!("session {peer}: failed replying success to client: {e}");
        pool.decr_in_flight(pid);
        return;
    }

    log::info!("session {peer}: proxy {pid} -> {}", req.target);

    let (bytes_up, bytes_down) = splice(&mut client, &mut upstream).await;
    pool.decr_in_flight(pid);

    log::info!(
        "session {peer}: closed (proxy {pid}, {bytes_up}B up, {bytes_down}B down)"
    );
}

/// Spec §4.4 step 3: up to [`N_ATTEMPTS`] distinct picks, excluding proxies
/// that already failed this session without touching their global health
/// beyond the outcome report every attempt makes regardless.
async fn acquire_upstream(
    pool: &ProxyPool,
    config: &SessionConfig,
    target: &Target,
) -> Result<(TcpStream, ProxyId), ProxyError> {
    let mut excluded = Vec::new();
    let mut last_err = ProxyError::NoHealthyProxy;

    for _ in 0..N_ATTEMPTS {
        let pid = pool.pick(&excluded)?;
        pool.incr_in_flight(pid);
        let descriptor = pool.descriptor(pid).clone();

        let started = Instant::now();
        match socks::connect_via(&descriptor, target, config.connect_timeout).await {
            Ok(stream) => {
                pool.report_outcome(pid, Outcome::Success, Some(started.elapsed()));
                return Ok((stream, pid));
            }
            Err(e) => {
                pool.decr_in_flight(pid);
                pool.report_outcome(pid, e.outcome(), None);
                log::warn!("proxy {pid} failed handshake for {target}: {e}");
                last_err = e;
                excluded.push(pid);
            }
        }
    }

    Err(last_err)
}

/// Spec §4.4 step 5: copies both directions to completion, shutting down
/// the write side of the opposite peer as soon as one direction's read side
/// hits EOF (or errors) so the other end observes a clean half-close. The
/// session itself only ends once both directions have finished, which is
/// exactly what awaiting both copies concurrently gives for free — no
/// explicit cancellation race is needed since an idle half keeps copying
/// independently until its own peer closes (spec §5: "no idle timeout by
/// default").
async fn splice(client: &mut TcpStream, upstream: &mut TcpStream) -> (u64, u64) {
    let (client_r, client_w) = client.split();
    let (upstream_r, upstream_w) = upstream.split();

    tokio::join!(
        copy_and_shutdown(client_r, upstream_w),
        copy_and_shutdown(upstream_r, client_w),
    )
}

async fn copy_and_shutdown<R, W>(mut reader: R, mut writer: W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        total += n as u64;
    }
    let _ = writer.shutdown().await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyDescriptor;
    use crate::test_support::{spawn_echo_server, spawn_socks5_upstream_to};

    #[tokio::test]
    async fn end_to_end_echo_through_socks5_upstream() {
        let echo_addr = spawn_echo_server().await;
        let upstream_addr = spawn_socks5_upstream_to(echo_addr).await;

        let descriptor = ProxyDescriptor::parse(
            0,
            &format!("socks5://{}:{}", upstream_addr.ip(), upstream_addr.port()),
        )
        .unwrap();
        let pool = Arc::new(ProxyPool::new(vec![descriptor]));
        let config = Arc::new(SessionConfig::default());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();

        let pool_clone = pool.clone();
        let config_clone = config.clone();
        tokio::spawn(async move {
            let (conn, peer) = listener.accept().await.unwrap();
            handle_session(conn, pool_clone, config_clone, peer).await;
        });

        let mut client = TcpStream::connect(local_addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method_reply = [0u8; 2];
        client.read_exact(&mut method_reply).await.unwrap();
        assert_eq!(method_reply, [0x05, 0x00]);

        use socks5_impl::protocol::{
            Address, AsyncStreamOperation, Command, Reply, Request, Response,
        };
        Request::new(Command::Connect, Address::SocketAddress(echo_addr))
            .write_to_async_stream(&mut client)
            .await
            .unwrap();
        let reply = Response::retrieve_from_async_stream(&mut client)
            .await
            .unwrap();
        assert_eq!(reply.reply, Reply::Succeeded);

        let payload = b"hello multisocks";
        client.write_all(payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);
    }

    #[tokio::test]
    async fn client_protocol_error_closes_without_reply() {
        let pool = Arc::new(ProxyPool::new(vec![]));
        let config = Arc::new(SessionConfig::default());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (conn, peer) = listener.accept().await.unwrap();
            handle_session(conn, pool, config, peer).await;
        });

        let mut client = TcpStream::connect(local_addr).await.unwrap();
        client.write_all(&[0x06]).await.unwrap();
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
