//! The wire-agnostic target address a session or an upstream handshake is
//! carrying (spec §3 `Session.target`). Kept separate from the SOCKS wire
//! encodings in [`crate::socks`], which translate a `Host` to and from the
//! ATYP-tagged byte layouts of SOCKS4/4a/5/5h.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Name(String),
    V4([u8; 4]),
    V6([u8; 16]),
}

impl Host {
    pub fn is_ipv4(&self) -> bool {
        matches!(self, Host::V4(_))
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Host::V6(_))
    }

    pub fn is_name(&self) -> bool {
        matches!(self, Host::Name(_))
    }

    /// Turns an already-resolved `IpAddr` into the address form the SOCKS4
    /// client path needs after local DNS resolution (spec §4.2).
    pub fn from_resolved(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Host::V4(v4.octets()),
            IpAddr::V6(v6) => Host::V6(v6.octets()),
        }
    }

    pub fn to_ip_addr(&self) -> Option<IpAddr> {
        match self {
            Host::V4(ip) => Some(IpAddr::V4(Ipv4Addr::from(*ip))),
            Host::V6(ip) => Some(IpAddr::V6(Ipv6Addr::from(*ip))),
            Host::Name(_) => None,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Name(name) => write!(f, "{name}"),
            Host::V4(ip) => write!(f, "{}", Ipv4Addr::from(*ip)),
            Host::V6(ip) => write!(f, "{}", Ipv6Addr::from(*ip)),
        }
    }
}

impl From<SocketAddr> for Host {
    fn from(addr: SocketAddr) -> Self {
        Host::from_resolved(addr.ip())
    }
}

/// A fully-qualified session target: `(Host, port)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: Host,
    pub port: u16,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl Target {
    pub fn new(host: Host, port: u16) -> Self {
        Self { host, port }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_each_host_kind() {
        assert_eq!(
            Host::Name("example.invalid".into()).to_string(),
            "example.invalid"
        );
        assert_eq!(Host::V4([127, 0, 0, 1]).to_string(), "127.0.0.1");
        assert_eq!(Host::V6([0; 16]).to_string(), "::");
    }

    #[test]
    fn target_display_joins_host_and_port() {
        let t = Target::new(Host::Name("example.invalid".into()), 80);
        assert_eq!(t.to_string(), "example.invalid:80");
    }
}
