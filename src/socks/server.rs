//! Downstream SOCKS4/4a/5 server handshake (spec §4.4 steps 1–4, component
//! D's wire half). [`negotiate_client`] runs the sniff-and-parse steps;
//! [`reply_success`]/[`reply_failure`] send the final reply in whichever
//! wire format the client spoke. SOCKS5 framing goes through `socks5_impl`,
//! the way `cpxy/src/protocol/socks5/server.rs`'s `Socks5Acceptor` does;
//! SOCKS4/4a has no teacher counterpart and stays hand-rolled in
//! [`super::wire`].

use socks5_impl::protocol::{
    handshake::Response as HandshakeResponse, Address, AsyncStreamOperation, AuthMethod, Command,
    Reply, Request, Response,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::addr::Target;
use crate::error::ProxyError;

use super::wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamKind {
    Socks4,
    Socks5,
}

pub struct ClientRequest {
    pub kind: DownstreamKind,
    pub target: Target,
}

/// A negotiation failure, carrying the downstream protocol kind whenever
/// it was determined before the failure (i.e. every case except an
/// unrecognized first byte) so the caller can still send a well-formed
/// failure reply.
pub struct NegotiateError {
    pub kind: Option<DownstreamKind>,
    pub source: ProxyError,
}

impl NegotiateError {
    fn new(kind: Option<DownstreamKind>, source: ProxyError) -> Self {
        Self { kind, source }
    }
}

/// Sniffs the protocol by first byte (`0x04` or `0x05`), runs method
/// selection for SOCKS5 (MultiSocks advertises `NO_AUTH` only, spec §9 Open
/// Question (a)), and parses the CONNECT request. The caller replies on the
/// wire afterwards via [`reply_success`]/[`reply_failure`] using
/// [`NegotiateError::kind`] when present.
pub async fn negotiate_client(
    stream: &mut (impl AsyncRead + AsyncWrite + Unpin + Send),
) -> Result<ClientRequest, NegotiateError> {
    let first = stream
        .read_u8()
        .await
        .map_err(|e| NegotiateError::new(None, wire::transport(e)))?;
    match first {
        0x04 => negotiate_socks4(stream).await,
        0x05 => negotiate_socks5(stream).await,
        other => Err(NegotiateError::new(
            None,
            ProxyError::ClientProtocolError(format!("unrecognized SOCKS version byte {other:#x}")),
        )),
    }
}

async fn negotiate_socks4(
    stream: &mut (impl AsyncRead + Unpin),
) -> Result<ClientRequest, NegotiateError> {
    let kind = Some(DownstreamKind::Socks4);
    let req = wire::read_socks4_request(stream)
        .await
        .map_err(|e| NegotiateError::new(kind, e))?;
    if req.cmd != wire::SOCKS4_CONNECT {
        return Err(NegotiateError::new(kind, ProxyError::CommandNotSupported));
    }
    Ok(ClientRequest {
        kind: DownstreamKind::Socks4,
        target: Target::new(req.host, req.port),
    })
}

/// `negotiate_client` already consumed the leading `VER = 0x05` byte while
/// sniffing the protocol, so the handshake request is read starting from
/// `NMETHODS` rather than via `HandshakeRequest::retrieve_from_async_stream`
/// (which expects to read `VER` itself).
async fn negotiate_socks5(
    stream: &mut (impl AsyncRead + AsyncWrite + Unpin + Send),
) -> Result<ClientRequest, NegotiateError> {
    let kind = Some(DownstreamKind::Socks5);

    let nmethods = stream
        .read_u8()
        .await
        .map_err(|e| NegotiateError::new(kind, wire::transport(e)))? as usize;
    let mut methods = vec![0u8; nmethods];
    stream
        .read_exact(&mut methods)
        .await
        .map_err(|e| NegotiateError::new(kind, wire::transport(e)))?;

    // VER was already consumed while sniffing the protocol, so the method
    // list is parsed directly rather than through
    // `HandshakeRequest::retrieve_from_async_stream`; 0x00 is the wire value
    // for `AuthMethod::NoAuth` regardless of crate version.
    if !methods.contains(&0x00) {
        HandshakeResponse::new(AuthMethod::NoAcceptableMethods)
            .write_to_async_stream(stream)
            .await
            .map_err(|e| NegotiateError::new(kind, wire::transport(e)))?;
        return Err(NegotiateError::new(kind, ProxyError::NoAcceptableAuthMethods));
    }

    HandshakeResponse::new(AuthMethod::NoAuth)
        .write_to_async_stream(stream)
        .await
        .map_err(|e| NegotiateError::new(kind, wire::transport(e)))?;

    let req = Request::retrieve_from_async_stream(stream)
        .await
        .map_err(|e| NegotiateError::new(kind, wire::transport(e)))?;
    if req.command != Command::Connect {
        return Err(NegotiateError::new(kind, ProxyError::CommandNotSupported));
    }

    let (host, port) = wire::from_impl_address(req.address);
    Ok(ClientRequest {
        kind: DownstreamKind::Socks5,
        target: Target::new(host, port),
    })
}

/// Spec §4.4 step 4: the bound-address fields MAY be zero.
pub async fn reply_success(
    stream: &mut (impl AsyncWrite + Unpin + Send),
    kind: DownstreamKind,
) -> Result<(), ProxyError> {
    match kind {
        DownstreamKind::Socks4 => {
            wire::write_socks4_reply(stream, wire::SOCKS4_GRANTED, [0; 4], 0).await
        }
        DownstreamKind::Socks5 => Response::new(Reply::Succeeded, Address::unspecified())
            .write_to_async_stream(stream)
            .await
            .map_err(wire::transport),
    }
}

/// Best-effort failure reply; callers ignore write errors here since the
/// session is closing regardless.
pub async fn reply_failure(
    stream: &mut (impl AsyncWrite + Unpin + Send),
    kind: DownstreamKind,
    err: &ProxyError,
) -> Result<(), ProxyError> {
    match kind {
        DownstreamKind::Socks4 => {
            wire::write_socks4_reply(stream, err.socks4_reply(), [0; 4], 0).await
        }
        DownstreamKind::Socks5 => {
            Response::new(wire::code_to_reply(err.socks5_reply()), Address::unspecified())
                .write_to_async_stream(stream)
                .await
                .map_err(wire::transport)
        }
    }
}
