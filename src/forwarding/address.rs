//! Forward endpoint addresses

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::workspace::FsError;

/// One end of a port forward
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn loopback(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    /// Parse `"8080"` (loopback) or `"host:port"`; ports must be 1-65535
    pub fn parse(input: &str) -> Result<Self, FsError> {
        let input = input.trim();
        let invalid = || FsError::InvalidAddress(input.to_string());

        if !input.is_empty() && input.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(Self::loopback(parse_port(input).ok_or_else(invalid)?));
        }

        let (host, port) = input.rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(invalid());
        }

        Ok(Self::new(host, parse_port(port).ok_or_else(invalid)?))
    }

    /// `host:port` form accepted by `TcpListener::bind`
    pub fn socket_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(s: &str) -> Option<u16> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

impl FromStr for Address {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.socket_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_port_is_loopback() {
        assert_eq!(Address::parse("8080").unwrap(), Address::loopback(8080));
        assert_eq!(Address::parse(" 3000 ").unwrap().host, "127.0.0.1");
    }

    #[test]
    fn test_host_and_port() {
        let addr: Address = "db.internal:5432".parse().unwrap();
        assert_eq!(addr, Address::new("db.internal", 5432));

        let v6 = Address::parse("[::1]:9000").unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "[::1]:9000");
    }

    #[test]
    fn test_rejects_out_of_range_and_garbage() {
        for bad in ["0", "65536", "host:0", "host:99999", ":80", "host:", "localhost", "", "a b:80"] {
            assert!(
                matches!(Address::parse(bad), Err(FsError::InvalidAddress(_))),
                "{} should be rejected",
                bad
            );
        }
    }
}
