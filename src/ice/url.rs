/**
 * ice/url.rs
 *
 * STUN/TURN server URLs (RFC 7064 / RFC 7065, without query parameters)
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::IceUrlError;

const DEFAULT_PORT: u16 = 3478;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Stun,
    Turn,
}

/// A configured STUN or TURN server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IceUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl IceUrl {
    /// `host:port`, suitable for name resolution
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for IceUrl {
    type Err = IceUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| IceUrlError::MissingScheme(s.to_string()))?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "stun" => Scheme::Stun,
            "turn" => Scheme::Turn,
            other => return Err(IceUrlError::Scheme(other.to_string())),
        };
        let rest = rest.split('?').next().unwrap_or_default();

        let (host, port) = if let Some(v6) = rest.strip_prefix('[') {
            let (host, tail) = v6
                .split_once(']')
                .ok_or_else(|| IceUrlError::UnterminatedHost(s.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| IceUrlError::Port(s.to_string()))?,
                None => DEFAULT_PORT,
            };
            (host.to_string(), port)
        } else {
            match rest.rsplit_once(':') {
                Some((host, p)) => (
                    host.to_string(),
                    p.parse().map_err(|_| IceUrlError::Port(s.to_string()))?,
                ),
                None => (rest.to_string(), DEFAULT_PORT),
            }
        };

        if host.is_empty() {
            return Err(IceUrlError::MissingHost(s.to_string()));
        }

        Ok(Self { scheme, host, port })
    }
}

impl TryFrom<String> for IceUrl {
    type Error = IceUrlError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IceUrl> for String {
    fn from(url: IceUrl) -> Self {
        url.to_string()
    }
}

impl fmt::Display for IceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Stun => "stun",
            Scheme::Turn => "turn",
        };
        write!(f, "{}:{}", scheme, self.authority())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_urls() {
        let url: IceUrl = "stun:stun.l.google.com:19302".parse().unwrap();
        assert_eq!(url.scheme, Scheme::Stun);
        assert_eq!(url.host, "stun.l.google.com");
        assert_eq!(url.port, 19302);

        let url: IceUrl = "turn:relay.example.com?transport=udp".parse().unwrap();
        assert_eq!(url.scheme, Scheme::Turn);
        assert_eq!(url.port, DEFAULT_PORT);

        let url: IceUrl = "stun:[2001:db8::1]:3479".parse().unwrap();
        assert_eq!(url.host, "2001:db8::1");
        assert_eq!(url.authority(), "[2001:db8::1]:3479");
    }

    #[test]
    fn test_reject_invalid_urls() {
        assert_eq!(
            "http://example.com".parse::<IceUrl>(),
            Err(IceUrlError::Scheme("http".to_string()))
        );
        assert_eq!(
            "stun:".parse::<IceUrl>(),
            Err(IceUrlError::MissingHost("stun:".to_string()))
        );
        assert!(matches!(
            "stun:host:notaport".parse::<IceUrl>(),
            Err(IceUrlError::Port(_))
        ));
        assert!(matches!(
            "stun:[::1:3478".parse::<IceUrl>(),
            Err(IceUrlError::UnterminatedHost(_))
        ));
        assert!(matches!(
            "example.com".parse::<IceUrl>(),
            Err(IceUrlError::MissingScheme(_))
        ));
    }

    #[test]
    fn test_serde_as_string() {
        let urls: Vec<IceUrl> =
            serde_json::from_str(r#"["stun:stun.example.org:3478"]"#).unwrap();
        assert_eq!(urls[0].to_string(), "stun:stun.example.org:3478");
        assert_eq!(
            serde_json::to_string(&urls).unwrap(),
            r#"["stun:stun.example.org:3478"]"#
        );
    }
}
