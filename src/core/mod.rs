//! Core connection primitives shared across the driver.

pub mod auth;
pub mod connection;
pub mod pool;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::config::ConfigError;

/// Port a server listens on when the endpoint text does not name one.
pub const DEFAULT_PORT: u16 = 27017;

/// A (host, port) pair identifying one database server process.
///
/// Endpoints compare and hash case-insensitively on the host, so replica
/// host lists that differ only in casing deduplicate correctly.
#[derive(Debug, Clone)]
pub struct EndPoint {
    host: String,
    port: u16,
}

impl EndPoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse an endpoint from `host` or `host:port` text.
    ///
    /// The text splits on the last `:`; a present port segment must be a
    /// valid non-zero port number. Without one, [`DEFAULT_PORT`] applies.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        if text.is_empty() {
            return Err(ConfigError::InvalidEndpoint(
                "endpoint text is empty".to_string(),
            ));
        }

        match text.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(ConfigError::InvalidEndpoint(format!(
                        "'{}' has no host part",
                        text
                    )));
                }
                let port = port
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p > 0)
                    .ok_or_else(|| {
                        ConfigError::InvalidEndpoint(format!("'{}' has an invalid port", text))
                    })?;
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(text, DEFAULT_PORT)),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl PartialEq for EndPoint {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port && self.host.eq_ignore_ascii_case(&other.host)
    }
}

impl Eq for EndPoint {}

impl Hash for EndPoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.host.as_bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
        state.write_u16(self.port);
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for EndPoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_parse_empty_fails() {
        assert!(EndPoint::parse("").is_err());
    }

    #[test]
    fn test_parse_host_only_uses_default_port() {
        let endpoint = EndPoint::parse("testhost").unwrap();
        assert_eq!(endpoint.host(), "testhost");
        assert_eq!(endpoint.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_parse_host_and_port() {
        let endpoint = EndPoint::parse("testhost:100").unwrap();
        assert_eq!(endpoint.host(), "testhost");
        assert_eq!(endpoint.port(), 100);
    }

    #[test]
    fn test_parse_rejects_bad_ports() {
        assert!(EndPoint::parse("testhost:").is_err());
        assert!(EndPoint::parse("testhost:abc").is_err());
        assert!(EndPoint::parse("testhost:0").is_err());
        assert!(EndPoint::parse("testhost:70000").is_err());
        assert!(EndPoint::parse(":27017").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for text in ["testhost:100", "db1.example.com:27017", "localhost:1"] {
            assert_eq!(EndPoint::parse(text).unwrap().to_string(), text);
        }
        assert_eq!(
            EndPoint::parse("testhost").unwrap().to_string(),
            "testhost:27017"
        );
    }

    #[test]
    fn test_equality_ignores_host_case() {
        let lower = EndPoint::new("dbhost", 27017);
        let upper = EndPoint::new("DBHOST", 27017);
        assert_eq!(lower, upper);
        assert_ne!(lower, EndPoint::new("dbhost", 27018));
        assert_ne!(lower, EndPoint::new("otherhost", 27017));
    }

    #[test]
    fn test_hash_matches_equality() {
        let mut set = HashSet::new();
        set.insert(EndPoint::new("dbhost", 27017));
        assert!(set.contains(&EndPoint::new("DbHost", 27017)));
        assert!(!set.contains(&EndPoint::new("dbhost", 27018)));

        set.insert(EndPoint::new("DBHOST", 27017));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_from_str() {
        let endpoint: EndPoint = "testhost:200".parse().unwrap();
        assert_eq!(endpoint, EndPoint::new("testhost", 200));
    }
}
