//! Upstream SOCKS4/4a/5/5h client handshake (spec §4.2, component B). The
//! one operation this module exposes is [`connect_via`]: open a TCP
//! connection to an upstream proxy and negotiate it into forwarding to
//! `target`, returning a plain stream ready to splice. SOCKS5/5h framing
//! goes through `socks5_impl`, the way `cpxy/src/protocol/socks5/mod.rs`'s
//! `new_stream` does for its own upstream handshake; SOCKS4/4a has no
//! teacher counterpart and stays hand-rolled in [`super::wire`].

use std::time::Duration;

use socks5_impl::protocol::{
    handshake::Request as HandshakeRequest, handshake::Response as HandshakeResponse,
    AsyncStreamOperation, AuthMethod, Command, Reply, Request, Response,
};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::addr::{Host, Target};
use crate::error::ProxyError;
use crate::proxy::{ProxyDescriptor, Scheme};

use super::wire;

pub async fn connect_via(
    upstream: &ProxyDescriptor,
    target: &Target,
    deadline: Duration,
) -> Result<TcpStream, ProxyError> {
    timeout(deadline, connect_via_inner(upstream, target))
        .await
        .map_err(|_| ProxyError::Timeout)?
}

async fn connect_via_inner(
    upstream: &ProxyDescriptor,
    target: &Target,
) -> Result<TcpStream, ProxyError> {
    let mut stream = TcpStream::connect((upstream.host.as_str(), upstream.port))
        .await
        .map_err(ProxyError::Transport)?;

    match upstream.scheme {
        Scheme::Socks4 | Scheme::Socks4a => {
            socks4_handshake(&mut stream, upstream, target).await?
        }
        Scheme::Socks5 | Scheme::Socks5h => {
            socks5_handshake(&mut stream, upstream, target).await?
        }
    }

    Ok(stream)
}

async fn socks4_handshake(
    stream: &mut TcpStream,
    upstream: &ProxyDescriptor,
    target: &Target,
) -> Result<(), ProxyError> {
    let host = match (&target.host, upstream.scheme) {
        (Host::Name(_), Scheme::Socks4a) => target.host.clone(),
        (Host::Name(name), _) => resolve_locally(name).await?,
        (other, _) => other.clone(),
    };

    wire::write_socks4_request(stream, &host, target.port).await?;
    let reply = wire::read_socks4_reply(stream).await?;
    if reply.cd == wire::SOCKS4_GRANTED {
        Ok(())
    } else {
        Err(ProxyError::UpstreamRejected(reply.cd))
    }
}

async fn socks5_handshake(
    stream: &mut TcpStream,
    upstream: &ProxyDescriptor,
    target: &Target,
) -> Result<(), ProxyError> {
    let methods = if upstream.credentials.is_some() {
        vec![AuthMethod::NoAuth, AuthMethod::UserPass]
    } else {
        vec![AuthMethod::NoAuth]
    };
    HandshakeRequest::new(methods)
        .write_to_async_stream(stream)
        .await
        .map_err(wire::transport)?;

    let selection = HandshakeResponse::retrieve_from_async_stream(stream)
        .await
        .map_err(wire::transport)?;

    match selection.method {
        AuthMethod::NoAuth => {}
        AuthMethod::UserPass => {
            let (user, pass) = upstream
                .credentials
                .as_ref()
                .ok_or(ProxyError::AuthFailed)?;
            wire::write_user_pass_request(stream, user, pass).await?;
            if wire::read_user_pass_status(stream).await? != 0 {
                return Err(ProxyError::AuthFailed);
            }
        }
        AuthMethod::NoAcceptableMethods => return Err(ProxyError::NoAcceptableAuthMethods),
        other => {
            return Err(ProxyError::ClientProtocolError(format!(
                "upstream selected unsupported method {other:?}"
            )))
        }
    }

    // SOCKS5 resolves names locally before sending; SOCKS5h never does, and
    // an already-resolved literal (including IPv6) is always sent as-is
    // regardless of scheme (spec §8 boundary case).
    let host = if upstream.scheme.resolves_remotely() {
        target.host.clone()
    } else {
        match &target.host {
            Host::Name(name) => resolve_locally(name).await?,
            other => other.clone(),
        }
    };

    Request::new(Command::Connect, wire::to_impl_address(&host, target.port))
        .write_to_async_stream(stream)
        .await
        .map_err(wire::transport)?;

    let resp = Response::retrieve_from_async_stream(stream)
        .await
        .map_err(wire::transport)?;
    if resp.reply == Reply::Succeeded {
        Ok(())
    } else {
        Err(ProxyError::UpstreamRejected(wire::reply_to_code(resp.reply)))
    }
}

async fn resolve_locally(name: &str) -> Result<Host, ProxyError> {
    let mut addrs = tokio::net::lookup_host((name, 0))
        .await
        .map_err(|_| ProxyError::LocalDnsFailed)?;
    let addr = addrs.next().ok_or(ProxyError::LocalDnsFailed)?;
    Ok(Host::from_resolved(addr.ip()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{spawn_echo_socks5_upstream, spawn_stub_socks4_upstream};

    #[tokio::test]
    async fn socks5_handshake_succeeds_against_stub_upstream() {
        let (addr, _name_requests) = spawn_echo_socks5_upstream().await;
        let upstream = ProxyDescriptor {
            id: 0,
            scheme: Scheme::Socks5,
            host: addr.ip().to_string(),
            port: addr.port(),
            credentials: None,
            weight: 1,
        };
        let target = Target::new(Host::V4([93, 184, 216, 34]), 80);
        let stream = connect_via(&upstream, &target, Duration::from_secs(2))
            .await
            .expect("handshake succeeds");
        drop(stream);
    }

    #[tokio::test]
    async fn socks5h_sends_name_verbatim() {
        let (addr, name_requests) = spawn_echo_socks5_upstream().await;
        let upstream = ProxyDescriptor {
            id: 0,
            scheme: Scheme::Socks5h,
            host: addr.ip().to_string(),
            port: addr.port(),
            credentials: None,
            weight: 1,
        };
        let target = Target::new(Host::Name("example.invalid".into()), 80);
        connect_via(&upstream, &target, Duration::from_secs(2))
            .await
            .expect("handshake succeeds");
        assert_eq!(
            name_requests.lock().as_deref(),
            Some("example.invalid")
        );
    }

    #[tokio::test]
    async fn socks4_rejection_surfaces_upstream_rejected() {
        let addr = spawn_stub_socks4_upstream(wire::SOCKS4_FAILED).await;
        let upstream = ProxyDescriptor {
            id: 0,
            scheme: Scheme::Socks4,
            host: addr.ip().to_string(),
            port: addr.port(),
            credentials: None,
            weight: 1,
        };
        let target = Target::new(Host::V4([1, 1, 1, 1]), 80);
        let err = connect_via(&upstream, &target, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamRejected(code) if code == wire::SOCKS4_FAILED));
    }
}
