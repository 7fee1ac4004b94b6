//! Byte-level SOCKS4/4a codec, plus the small glue this crate needs around
//! `socks5_impl` for the parts that crate doesn't cover: username/password
//! sub-negotiation (RFC 1929, never exercised anywhere in the corpus, since
//! the teacher's own SOCKS5 paths only ever speak `AuthMethod::NoAuth`) and
//! conversions between [`crate::addr::Host`] and
//! `socks5_impl::protocol::Address`/`Reply`. SOCKS5 framing itself goes
//! through `socks5_impl`, the way `cpxy/src/protocol/socks5/{mod,server}.rs`
//! use it — see DESIGN.md.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socks5_impl::protocol::{Address, Reply};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::addr::Host;
use crate::error::ProxyError;

pub fn transport(e: std::io::Error) -> ProxyError {
    ProxyError::Transport(e)
}

// --- Host <-> socks5_impl::protocol::Address ----------------------------

pub fn to_impl_address(host: &Host, port: u16) -> Address {
    match host {
        Host::V4(ip) => Address::SocketAddress(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(*ip)), port)),
        Host::V6(ip) => Address::SocketAddress(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(*ip)), port)),
        Host::Name(name) => Address::DomainAddress(name.clone().into(), port),
    }
}

pub fn from_impl_address(addr: Address) -> (Host, u16) {
    match addr {
        Address::SocketAddress(sa) => (Host::from_resolved(sa.ip()), sa.port()),
        Address::DomainAddress(name, port) => (Host::Name(name.to_string()), port),
    }
}

// --- ProxyError socks5_reply() (u8) <-> socks5_impl::protocol::Reply ----

pub fn code_to_reply(code: u8) -> Reply {
    match code {
        0x00 => Reply::Succeeded,
        0x02 => Reply::ConnectionNotAllowed,
        0x03 => Reply::NetworkUnreachable,
        0x04 => Reply::HostUnreachable,
        0x05 => Reply::ConnectionRefused,
        0x06 => Reply::TtlExpired,
        0x07 => Reply::CommandNotSupported,
        0x08 => Reply::AddressTypeNotSupported,
        _ => Reply::GeneralFailure,
    }
}

pub fn reply_to_code(reply: Reply) -> u8 {
    match reply {
        Reply::Succeeded => 0x00,
        Reply::ConnectionNotAllowed => 0x02,
        Reply::NetworkUnreachable => 0x03,
        Reply::HostUnreachable => 0x04,
        Reply::ConnectionRefused => 0x05,
        Reply::TtlExpired => 0x06,
        Reply::CommandNotSupported => 0x07,
        Reply::AddressTypeNotSupported => 0x08,
        _ => 0x01,
    }
}

// --- SOCKS5 username/password sub-negotiation (RFC 1929) ----------------

pub async fn write_user_pass_request(
    w: &mut (impl AsyncWrite + Unpin),
    user: &str,
    pass: &str,
) -> Result<(), ProxyError> {
    w.write_u8(0x01).await.map_err(transport)?;
    w.write_u8(user.len() as u8).await.map_err(transport)?;
    w.write_all(user.as_bytes()).await.map_err(transport)?;
    w.write_u8(pass.len() as u8).await.map_err(transport)?;
    w.write_all(pass.as_bytes()).await.map_err(transport)?;
    Ok(())
}

pub async fn read_user_pass_request(
    r: &mut (impl AsyncRead + Unpin),
) -> Result<(String, String), ProxyError> {
    let _ver = r.read_u8().await.map_err(transport)?;
    let ulen = r.read_u8().await.map_err(transport)? as usize;
    let mut user = vec![0u8; ulen];
    r.read_exact(&mut user).await.map_err(transport)?;
    let plen = r.read_u8().await.map_err(transport)? as usize;
    let mut pass = vec![0u8; plen];
    r.read_exact(&mut pass).await.map_err(transport)?;
    Ok((
        String::from_utf8_lossy(&user).into_owned(),
        String::from_utf8_lossy(&pass).into_owned(),
    ))
}

pub async fn read_user_pass_status(r: &mut (impl AsyncRead + Unpin)) -> Result<u8, ProxyError> {
    let _ver = r.read_u8().await.map_err(transport)?;
    r.read_u8().await.map_err(transport)
}

pub async fn write_user_pass_status(
    w: &mut (impl AsyncWrite + Unpin),
    status: u8,
) -> Result<(), ProxyError> {
    w.write_all(&[0x01, status]).await.map_err(transport)
}

// --- SOCKS4/4a request / reply -------------------------------------------

pub const SOCKS4_CONNECT: u8 = 0x01;
pub const SOCKS4_GRANTED: u8 = 0x5A;
pub const SOCKS4_FAILED: u8 = 0x5B;

pub struct Socks4Request {
    pub cmd: u8,
    pub host: Host,
    pub port: u16,
    pub user_id: Vec<u8>,
}

/// Reads a SOCKS4/4a CONNECT request. The caller has already consumed the
/// leading `VN=4` byte while sniffing the protocol (spec §4.4 step 1).
pub async fn read_socks4_request(
    r: &mut (impl AsyncRead + Unpin),
) -> Result<Socks4Request, ProxyError> {
    let cmd = r.read_u8().await.map_err(transport)?;
    let port = r.read_u16().await.map_err(transport)?;
    let mut ip = [0u8; 4];
    r.read_exact(&mut ip).await.map_err(transport)?;

    let user_id = read_nul_terminated(r).await?;

    // SOCKS4a: 0.0.0.x (x != 0) signals "hostname follows".
    let host = if ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0 {
        let name_bytes = read_nul_terminated(r).await?;
        Host::Name(
            String::from_utf8(name_bytes)
                .map_err(|_| ProxyError::ClientProtocolError("non-utf8 socks4a host".into()))?,
        )
    } else {
        Host::V4(ip)
    };

    Ok(Socks4Request {
        cmd,
        host,
        port,
        user_id,
    })
}

async fn read_nul_terminated(r: &mut (impl AsyncRead + Unpin)) -> Result<Vec<u8>, ProxyError> {
    let mut buf = Vec::new();
    loop {
        let b = r.read_u8().await.map_err(transport)?;
        if b == 0 {
            return Ok(buf);
        }
        buf.push(b);
        if buf.len() > 4096 {
            return Err(ProxyError::ClientProtocolError(
                "socks4 field too long".into(),
            ));
        }
    }
}

/// Writes a SOCKS4 (`host` is an IPv4 literal) or SOCKS4a (`host` is a name,
/// encoded with the classic `0.0.0.x` sentinel) CONNECT request.
pub async fn write_socks4_request(
    w: &mut (impl AsyncWrite + Unpin),
    host: &Host,
    port: u16,
) -> Result<(), ProxyError> {
    w.write_all(&[0x04, SOCKS4_CONNECT]).await.map_err(transport)?;
    w.write_u16(port).await.map_err(transport)?;
    match host {
        Host::V4(ip) => {
            w.write_all(ip).await.map_err(transport)?;
            w.write_u8(0x00).await.map_err(transport)?; // USERID
        }
        Host::Name(name) => {
            w.write_all(&[0, 0, 0, 0x01]).await.map_err(transport)?;
            w.write_u8(0x00).await.map_err(transport)?; // USERID
            w.write_all(name.as_bytes()).await.map_err(transport)?;
            w.write_u8(0x00).await.map_err(transport)?;
        }
        Host::V6(_) => {
            return Err(ProxyError::InvalidProxySpec {
                reason: "SOCKS4/4a cannot address an IPv6 target".into(),
            })
        }
    }
    Ok(())
}

pub struct Socks4Reply {
    pub cd: u8,
    pub host: [u8; 4],
    pub port: u16,
}

pub async fn read_socks4_reply(
    r: &mut (impl AsyncRead + Unpin),
) -> Result<Socks4Reply, ProxyError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).await.map_err(transport)?;
    // buf[0] is VN (0x00), ignored.
    let cd = buf[1];
    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let host = [buf[4], buf[5], buf[6], buf[7]];
    Ok(Socks4Reply { cd, host, port })
}

pub async fn write_socks4_reply(
    w: &mut (impl AsyncWrite + Unpin),
    cd: u8,
    bound: [u8; 4],
    port: u16,
) -> Result<(), ProxyError> {
    let mut buf = [0u8; 8];
    buf[1] = cd;
    buf[2..4].copy_from_slice(&port.to_be_bytes());
    buf[4..8].copy_from_slice(&bound);
    w.write_all(&buf).await.map_err(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_each_host_kind() {
        for (host, port) in [
            (Host::V4([1, 2, 3, 4]), 443),
            (Host::V6([0xAB; 16]), 8443),
            (Host::Name("example.invalid".into()), 80),
        ] {
            let (back, back_port) = from_impl_address(to_impl_address(&host, port));
            assert_eq!(back, host);
            assert_eq!(back_port, port);
        }
    }

    #[test]
    fn reply_code_round_trips_for_known_codes() {
        for code in [0x00, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08] {
            assert_eq!(reply_to_code(code_to_reply(code)), code);
        }
    }

    #[test]
    fn unknown_reply_code_maps_to_general_failure() {
        assert_eq!(reply_to_code(code_to_reply(0x09)), 0x01);
    }

    #[tokio::test]
    async fn socks4_request_round_trips_ipv4() {
        let mut buf = Vec::new();
        write_socks4_request(&mut buf, &Host::V4([10, 0, 0, 1]), 80)
            .await
            .unwrap();
        // Skip the VN/CD bytes this test doesn't parse (read_socks4_request
        // assumes the caller already consumed VN while protocol-sniffing).
        let mut cursor = &buf[1..];
        let req = read_socks4_request(&mut cursor).await.unwrap();
        assert_eq!(req.host, Host::V4([10, 0, 0, 1]));
        assert_eq!(req.port, 80);
    }

    #[tokio::test]
    async fn socks4a_request_round_trips_hostname() {
        let mut buf = Vec::new();
        write_socks4_request(&mut buf, &Host::Name("example.invalid".into()), 80)
            .await
            .unwrap();
        let mut cursor = &buf[1..];
        let req = read_socks4_request(&mut cursor).await.unwrap();
        assert_eq!(req.host, Host::Name("example.invalid".into()));
    }

    #[tokio::test]
    async fn user_pass_negotiation_round_trips() {
        let mut buf = Vec::new();
        write_user_pass_request(&mut buf, "alice", "secret").await.unwrap();
        let (user, pass) = read_user_pass_request(&mut buf.as_slice()).await.unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "secret");

        let mut status_buf = Vec::new();
        write_user_pass_status(&mut status_buf, 0x00).await.unwrap();
        assert_eq!(
            read_user_pass_status(&mut status_buf.as_slice()).await.unwrap(),
            0x00
        );
    }
}
