//! Listen addresses - filesystem paths or host/port pairs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Where a server listens
///
/// Only `Path` addresses are subject to permission changes and unlink-based
/// cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenAddr {
    /// UNIX domain socket bound to a filesystem path
    Path(PathBuf),
    /// TCP host/port pair
    Inet(SocketAddr),
}

/// Address family discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Unix,
    Ipv4,
    Ipv6,
}

impl ListenAddr {
    /// Returns the socket path for path-based addresses
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            ListenAddr::Path(path) => Some(path),
            ListenAddr::Inet(_) => None,
        }
    }

    pub fn is_path(&self) -> bool {
        matches!(self, ListenAddr::Path(_))
    }

    pub fn address_type(&self) -> AddressType {
        match self {
            ListenAddr::Path(_) => AddressType::Unix,
            ListenAddr::Inet(SocketAddr::V4(_)) => AddressType::Ipv4,
            ListenAddr::Inet(SocketAddr::V6(_)) => AddressType::Ipv6,
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Path(path) => write!(f, "{}", path.display()),
            ListenAddr::Inet(addr) => write!(f, "{}", addr),
        }
    }
}

/// Anything that parses as a socket address is `Inet`, everything else is a
/// path. Use `./name` to force a relative path that looks like `host:port`.
impl FromStr for ListenAddr {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<SocketAddr>() {
            Ok(addr) => ListenAddr::Inet(addr),
            Err(_) => ListenAddr::Path(PathBuf::from(s)),
        })
    }
}

impl From<PathBuf> for ListenAddr {
    fn from(path: PathBuf) -> Self {
        ListenAddr::Path(path)
    }
}

impl From<&Path> for ListenAddr {
    fn from(path: &Path) -> Self {
        ListenAddr::Path(path.to_path_buf())
    }
}

impl From<SocketAddr> for ListenAddr {
    fn from(addr: SocketAddr) -> Self {
        ListenAddr::Inet(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inet() {
        let addr: ListenAddr = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(addr.address_type(), AddressType::Ipv4);
        assert!(!addr.is_path());

        let addr: ListenAddr = "[::1]:80".parse().unwrap();
        assert_eq!(addr.address_type(), AddressType::Ipv6);
    }

    #[test]
    fn test_parse_path() {
        let addr: ListenAddr = "/var/run/app.sock".parse().unwrap();
        assert_eq!(addr.as_path(), Some(Path::new("/var/run/app.sock")));
        assert_eq!(addr.address_type(), AddressType::Unix);
        assert_eq!(addr.to_string(), "/var/run/app.sock");
    }

    #[test]
    fn test_wire_format_names_the_family() {
        let addr = ListenAddr::Path(PathBuf::from("/tmp/x.sock"));
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, r#"{"path":"/tmp/x.sock"}"#);
    }
}
