use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
}

impl FromStr for Protocol {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "stream" => Ok(Protocol::Tcp),
            other => Err(AppError::InvalidAddress(format!(
                "unsupported protocol {other}"
            ))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
        }
    }
}

/// A `protocol://host:port` destination, the key of the dialer registry.
///
/// Parsing normalises the protocol and host case so that two spellings of
/// the same destination share one dialer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetAddress {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
}

impl NetAddress {
    /// Resolve through the system resolver, preferring an IPv4 result.
    pub fn resolve(&self) -> AppResult<SocketAddr> {
        let candidates: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| AppError::InvalidAddress(format!("resolve {self}: {e}")))?
            .collect();
        candidates
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| candidates.first())
            .copied()
            .ok_or_else(|| AppError::InvalidAddress(format!("{self} resolved to nothing")))
    }
}

impl FromStr for NetAddress {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        let s = s.trim();
        let (protocol, rest) = match s.split_once("://") {
            Some((protocol, rest)) => (protocol.parse()?, rest),
            None => (Protocol::Tcp, s),
        };
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| AppError::InvalidAddress(format!("missing port in {s}")))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(AppError::InvalidAddress(format!("missing host in {s}")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| AppError::InvalidAddress(format!("bad port in {s}: {e}")))?;
        Ok(NetAddress {
            protocol,
            host: host.to_ascii_lowercase(),
            port,
        })
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.protocol, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let addr: NetAddress = "tcp://Node-1.Local:7878".parse().unwrap();
        assert_eq!(addr.protocol, Protocol::Tcp);
        assert_eq!(addr.host, "node-1.local");
        assert_eq!(addr.port, 7878);
        assert_eq!(addr.to_string(), "tcp://node-1.local:7878");

        let bare: NetAddress = "node-1.local:7878".parse().unwrap();
        assert_eq!(bare, addr);

        let v6: NetAddress = "tcp://[::1]:9000".parse().unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "tcp://[::1]:9000");
    }

    #[test]
    fn test_parse_errors() {
        assert!("udp://host:1".parse::<NetAddress>().is_err());
        assert!("tcp://host".parse::<NetAddress>().is_err());
        assert!("tcp://:80".parse::<NetAddress>().is_err());
        assert!("host:70000".parse::<NetAddress>().is_err());
    }

    #[test]
    fn test_resolve() {
        let addr: NetAddress = "localhost:4000".parse().unwrap();
        let resolved = addr.resolve().unwrap();
        assert_eq!(resolved.port(), 4000);
        assert!(resolved.ip().is_loopback());

        let literal: NetAddress = "127.0.0.1:4001".parse().unwrap();
        assert_eq!(
            literal.resolve().unwrap(),
            "127.0.0.1:4001".parse::<SocketAddr>().unwrap()
        );
    }
}
