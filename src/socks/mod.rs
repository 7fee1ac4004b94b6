//! SOCKS4/4a/5/5h wire protocol: the upstream client handshake ([`client`],
//! spec §4.2 component B) and the downstream server handshake ([`server`],
//! spec §4.4's wire half), both built on `socks5_impl` for their SOCKS5
//! framing with [`wire`] filling the gaps — SOCKS4/4a (no teacher
//! counterpart), RFC 1929 sub-negotiation (never exercised in the corpus),
//! and conversions to/from this crate's own address and error types.

pub mod client;
pub mod server;
pub mod wire;

pub use client::connect_via;
pub use server::{
    negotiate_client, reply_failure, reply_success, ClientRequest, DownstreamKind, NegotiateError,
};
