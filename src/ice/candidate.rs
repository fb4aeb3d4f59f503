/**
 * ice/candidate.rs
 *
 * NAT traversal candidates and their SDP attribute style wire format
 */

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::CandidateError;

/// Only one component (the tunnel datagrams) is ever negotiated
const COMPONENT: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    /// RFC 8445 recommended type preferences
    fn preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        }
    }
}

impl FromStr for CandidateType {
    type Err = CandidateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "relay" => Ok(CandidateType::Relay),
            other => Err(CandidateError::Type(other.to_string())),
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A UDP transport address usable to reach a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: String,
    pub component: u16,
    pub priority: u32,
    pub addr: SocketAddr,
    pub kind: CandidateType,
    /// Base address for reflexive candidates
    pub related: Option<SocketAddr>,
}

impl Candidate {
    pub fn host(addr: SocketAddr, local_preference: u16) -> Self {
        Self::new(CandidateType::Host, addr, None, local_preference)
    }

    pub fn server_reflexive(addr: SocketAddr, base: SocketAddr) -> Self {
        Self::new(CandidateType::ServerReflexive, addr, Some(base), u16::MAX)
    }

    pub fn peer_reflexive(addr: SocketAddr) -> Self {
        Self::new(CandidateType::PeerReflexive, addr, None, u16::MAX)
    }

    fn new(
        kind: CandidateType,
        addr: SocketAddr,
        related: Option<SocketAddr>,
        local_preference: u16,
    ) -> Self {
        Self {
            foundation: foundation(kind, addr.ip()),
            component: COMPONENT,
            priority: priority(kind, local_preference),
            addr,
            kind,
            related,
        }
    }

    /// Serialize to the wire format
    pub fn marshal(&self) -> String {
        self.to_string()
    }

    /// Parse the wire format (with or without the `candidate:` prefix)
    pub fn unmarshal(raw: &[u8]) -> Result<Self, CandidateError> {
        let text = std::str::from_utf8(raw).map_err(|_| CandidateError::Field {
            field: "encoding",
            value: String::from_utf8_lossy(raw).into_owned(),
        })?;
        text.parse()
    }
}

fn priority(kind: CandidateType, local_preference: u16) -> u32 {
    (kind.preference() << 24) + ((local_preference as u32) << 8) + (256 - COMPONENT as u32)
}

fn foundation(kind: CandidateType, ip: IpAddr) -> String {
    let digest = blake3::hash(format!("{}{}udp", kind, ip).as_bytes());
    let b = digest.as_bytes();
    u32::from_be_bytes([b[0], b[1], b[2], b[3]]).to_string()
}

fn field<T: FromStr>(name: &'static str, value: &str) -> Result<T, CandidateError> {
    value.parse().map_err(|_| CandidateError::Field {
        field: name,
        value: value.to_string(),
    })
}

impl FromStr for Candidate {
    type Err = CandidateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("candidate:").unwrap_or(s);
        let parts: Vec<&str> = s.split_whitespace().collect();
        if parts.len() < 8 {
            return Err(CandidateError::TooShort(parts.len()));
        }

        let foundation = parts[0].to_string();
        let component = field("component", parts[1])?;
        if !parts[2].eq_ignore_ascii_case("udp") {
            return Err(CandidateError::Transport(parts[2].to_string()));
        }
        let priority = field("priority", parts[3])?;
        let ip: IpAddr = field("address", parts[4])?;
        let port: u16 = field("port", parts[5])?;
        if parts[6] != "typ" {
            return Err(CandidateError::Field {
                field: "typ",
                value: parts[6].to_string(),
            });
        }
        let kind: CandidateType = parts[7].parse()?;

        let mut related_ip: Option<IpAddr> = None;
        let mut related_port: Option<u16> = None;
        for pair in parts[8..].chunks(2) {
            match pair {
                ["raddr", v] => related_ip = Some(field("raddr", v)?),
                ["rport", v] => related_port = Some(field("rport", v)?),
                // unknown extension attributes are ignored
                _ => {}
            }
        }
        let related = match (related_ip, related_port) {
            (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
            _ => None,
        };

        Ok(Self {
            foundation,
            component,
            priority,
            addr: SocketAddr::new(ip, port),
            kind,
            related,
        })
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} udp {} {} {} typ {}",
            self.foundation,
            self.component,
            self.priority,
            self.addr.ip(),
            self.addr.port(),
            self.kind
        )?;
        if let Some(related) = self.related {
            write!(f, " raddr {} rport {}", related.ip(), related.port())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let c = Candidate::server_reflexive(
            "203.0.113.7:40000".parse().unwrap(),
            "192.168.1.10:51820".parse().unwrap(),
        );
        let text = c.marshal();
        assert!(text.contains(" udp "));
        assert!(text.contains("203.0.113.7 40000 typ srflx raddr 192.168.1.10 rport 51820"));
        assert_eq!(Candidate::unmarshal(text.as_bytes()).unwrap(), c);
    }

    #[test]
    fn test_parse_with_prefix() {
        let c: Candidate = "candidate:1 1 UDP 2130706431 192.168.1.1 54321 typ host"
            .parse()
            .unwrap();
        assert_eq!(c.kind, CandidateType::Host);
        assert_eq!(c.addr, "192.168.1.1:54321".parse().unwrap());
        assert_eq!(c.priority, 2130706431);
        assert_eq!(c.related, None);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "1 1 udp".parse::<Candidate>().unwrap_err(),
            CandidateError::TooShort(3)
        );
        assert_eq!(
            "1 1 tcp 1 10.0.0.1 1 typ host".parse::<Candidate>().unwrap_err(),
            CandidateError::Transport("tcp".to_string())
        );
        assert_eq!(
            "1 1 udp 1 10.0.0.1 1 typ bogus".parse::<Candidate>().unwrap_err(),
            CandidateError::Type("bogus".to_string())
        );
        assert!(matches!(
            "1 1 udp 1 not-an-ip 1 typ host".parse::<Candidate>(),
            Err(CandidateError::Field { field: "address", .. })
        ));
        assert!(Candidate::unmarshal(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_priority_order() {
        let addr: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let host = Candidate::host(addr, 65535);
        let prflx = Candidate::peer_reflexive(addr);
        let srflx = Candidate::server_reflexive(addr, addr);
        assert!(host.priority > prflx.priority);
        assert!(prflx.priority > srflx.priority);
        assert_eq!(host.priority, 2130706431);
    }
}
