//! Host/port addressing shared by connectors, listeners and proxies.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Errors produced when parsing a `host:port` string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DestinationError {
    #[error("missing port in '{0}'")]
    MissingPort(String),
    #[error("invalid port in '{0}'")]
    InvalidPort(String),
    #[error("empty host in '{0}'")]
    EmptyHost(String),
}

/// A connection target: a hostname or IP literal plus a port.
///
/// Hostnames are kept verbatim so that TLS interception can mint a certificate
/// for exactly the name the client asked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, `a.b.c.d:port` or `[v6]:port`.
    pub fn parse(s: &str) -> Result<Self, DestinationError> {
        let s = s.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| DestinationError::MissingPort(s.to_string()))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| DestinationError::MissingPort(s.to_string()))?;
            (host, port)
        } else {
            s.rsplit_once(':')
                .ok_or_else(|| DestinationError::MissingPort(s.to_string()))?
        };
        if host.is_empty() {
            return Err(DestinationError::EmptyHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| DestinationError::InvalidPort(s.to_string()))?;
        Ok(Self::new(host, port))
    }

    /// The host as an IP literal, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// The host as an IPv4 literal, if it is one.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.host.parse().ok()
    }

    /// The destination as a socket address when the host is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for Destination {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hostname() {
        let dest = Destination::parse("example.com:443").unwrap();
        assert_eq!(dest.host, "example.com");
        assert_eq!(dest.port, 443);
        assert!(dest.ip().is_none());
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let dest: Destination = "[::1]:8080".parse().unwrap();
        assert_eq!(dest.host, "::1");
        assert_eq!(dest.to_string(), "[::1]:8080");
        assert_eq!(dest.socket_addr(), Some("[::1]:8080".parse().unwrap()));
    }

    #[test]
    fn rejects_missing_or_bad_port() {
        assert!(matches!(
            Destination::parse("example.com"),
            Err(DestinationError::MissingPort(_))
        ));
        assert!(matches!(
            Destination::parse("example.com:99999"),
            Err(DestinationError::InvalidPort(_))
        ));
        assert!(matches!(
            Destination::parse(":80"),
            Err(DestinationError::EmptyHost(_))
        ));
    }

    #[test]
    fn from_socket_addr_keeps_ip_literal() {
        let dest = Destination::from("10.0.0.5:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(dest.ipv4(), Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(dest.port, 9000);
    }
}
