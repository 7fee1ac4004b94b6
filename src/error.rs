//! Error taxonomy shared by the SOCKS client, the pool and the session
//! handler (spec §7). Startup/config plumbing uses `anyhow` instead, the way
//! the rest of this codebase keeps precise enums at the inner boundaries and
//! `anyhow::Error` with `.context(...)` at the outer ones.

use std::io;

use thiserror::Error;

/// Failures that can occur while handshaking with an upstream SOCKS proxy or
/// while running a session against one. `NoHealthyProxy` and
/// `ClientProtocolError` additionally cover the downstream side.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid proxy spec: {reason}")]
    InvalidProxySpec { reason: String },

    #[error("no healthy proxy available")]
    NoHealthyProxy,

    #[error("upstream rejected the request (code {0})")]
    UpstreamRejected(u8),

    #[error("upstream authentication failed")]
    AuthFailed,

    #[error("upstream offered no acceptable authentication method")]
    NoAcceptableAuthMethods,

    #[error("local DNS resolution failed for upstream handshake")]
    LocalDnsFailed,

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("malformed downstream request: {0}")]
    ClientProtocolError(String),

    #[error("downstream requested an unsupported command")]
    CommandNotSupported,

    #[error("fatal error: {0}")]
    Fatal(String),
}

/// Coarse outcome classification fed back into the pool's health table
/// (spec §4.3 "Outcome reporting"). `UpstreamRejected`/`AuthFailed` count as
/// handshake failures; `Transport`/`Timeout` count as transport failures;
/// both move the same failure counter, spec.md draws the distinction only so
/// logs can tell the two apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    HandshakeFailure,
    TransportFailure,
}

impl ProxyError {
    pub fn outcome(&self) -> Outcome {
        match self {
            ProxyError::UpstreamRejected(_)
            | ProxyError::AuthFailed
            | ProxyError::NoAcceptableAuthMethods => Outcome::HandshakeFailure,
            ProxyError::Transport(_) | ProxyError::Timeout | ProxyError::LocalDnsFailed => {
                Outcome::TransportFailure
            }
            ProxyError::InvalidProxySpec { .. }
            | ProxyError::NoHealthyProxy
            | ProxyError::ClientProtocolError(_)
            | ProxyError::CommandNotSupported
            | ProxyError::Fatal(_) => Outcome::TransportFailure,
        }
    }

    /// SOCKS5 `REP` byte this error should be reported to the downstream
    /// client as, per spec §7.
    pub fn socks5_reply(&self) -> u8 {
        match self {
            ProxyError::UpstreamRejected(code) => *code,
            ProxyError::CommandNotSupported => 0x07,
            _ => 0x01,
        }
    }

    /// SOCKS4 `CD` byte equivalent (only `0x5A` granted / `0x5B` failed
    /// exist, so every failure maps to the same code).
    pub fn socks4_reply(&self) -> u8 {
        0x5B
    }
}

impl From<tokio::time::error::Elapsed> for ProxyError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProxyError::Timeout
    }
}
