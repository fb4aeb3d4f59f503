/**
 * ice/check.rs
 *
 * Connectivity check packets, authenticated with the receiver's ICE password
 */

use anyhow::{anyhow, Context, Result};

const MAGIC: &[u8; 4] = b"MTCK";
const MAC_LEN: usize = 32;
const HEADER_LEN: usize = 4 + 1 + 1 + 12 + 1;
const FLAG_NOMINATE: u8 = 0x01;
const MAC_CONTEXT: &str = "meshtun 2024-05 ice connectivity check";

/// True if the datagram looks like a connectivity check
pub fn is_check(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN + MAC_LEN && &data[0..4] == MAGIC
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Request = 1,
    Response = 2,
}

/// Connectivity check request or response
///
/// `username` is `"<receiver ufrag>:<sender ufrag>"` for requests; a
/// response echoes the request's username and transaction id and is
/// authenticated with the same password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckPacket {
    pub kind: CheckKind,
    pub nominate: bool,
    pub transaction_id: [u8; 12],
    pub username: String,
    mac: [u8; MAC_LEN],
}

impl CheckPacket {
    pub fn request(receiver_ufrag: &str, sender_ufrag: &str, nominate: bool) -> Self {
        Self {
            kind: CheckKind::Request,
            nominate,
            transaction_id: rand::random(),
            username: format!("{}:{}", receiver_ufrag, sender_ufrag),
            mac: [0u8; MAC_LEN],
        }
    }

    /// Response to this request
    pub fn response(&self) -> Self {
        Self {
            kind: CheckKind::Response,
            mac: [0u8; MAC_LEN],
            ..self.clone()
        }
    }

    /// Fragment of the side that must answer this check
    pub fn receiver_ufrag(&self) -> &str {
        self.username.split(':').next().unwrap_or_default()
    }

    /// Serialize and authenticate with `pwd`
    pub fn to_bytes(&self, pwd: &str) -> Result<Vec<u8>> {
        let mut bytes = self.signed_part()?;
        bytes.extend_from_slice(compute_mac(pwd, &bytes).as_bytes());
        Ok(bytes)
    }

    /// Deserialize without authenticating; call [`CheckPacket::verify`]
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if !is_check(data) {
            return Err(anyhow!("Invalid check packet"));
        }

        let kind = match data[4] {
            1 => CheckKind::Request,
            2 => CheckKind::Response,
            other => return Err(anyhow!("Invalid check kind: {}", other)),
        };
        let nominate = data[5] & FLAG_NOMINATE != 0;
        let transaction_id: [u8; 12] = data[6..18].try_into().context("Invalid transaction id")?;

        let username_len = data[18] as usize;
        if data.len() != HEADER_LEN + username_len + MAC_LEN {
            return Err(anyhow!("Invalid check packet length: {}", data.len()));
        }
        let username = std::str::from_utf8(&data[HEADER_LEN..HEADER_LEN + username_len])
            .context("Invalid username")?
            .to_string();
        let mac: [u8; MAC_LEN] = data[HEADER_LEN + username_len..]
            .try_into()
            .context("Invalid MAC")?;

        Ok(Self {
            kind,
            nominate,
            transaction_id,
            username,
            mac,
        })
    }

    /// Check the MAC against `pwd`
    pub fn verify(&self, pwd: &str) -> bool {
        let Ok(signed) = self.signed_part() else {
            return false;
        };
        // blake3::Hash comparison is constant time
        compute_mac(pwd, &signed) == blake3::Hash::from(self.mac)
    }

    fn signed_part(&self) -> Result<Vec<u8>> {
        let username = self.username.as_bytes();
        let username_len = u8::try_from(username.len())
            .map_err(|_| anyhow!("Check username too long: {} bytes", username.len()))?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + username.len() + MAC_LEN);
        bytes.extend_from_slice(MAGIC);
        bytes.push(self.kind as u8);
        bytes.push(if self.nominate { FLAG_NOMINATE } else { 0 });
        bytes.extend_from_slice(&self.transaction_id);
        bytes.push(username_len);
        bytes.extend_from_slice(username);
        Ok(bytes)
    }
}

fn compute_mac(pwd: &str, data: &[u8]) -> blake3::Hash {
    let key = blake3::derive_key(MAC_CONTEXT, pwd.as_bytes());
    blake3::keyed_hash(&key, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_response_authentication() {
        let request = CheckPacket::request("remoteufrag", "localufrag", true);
        let bytes = request.to_bytes("remote-password").unwrap();
        assert!(is_check(&bytes));

        let parsed = CheckPacket::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.kind, CheckKind::Request);
        assert!(parsed.nominate);
        assert_eq!(parsed.receiver_ufrag(), "remoteufrag");
        assert!(parsed.verify("remote-password"));
        assert!(!parsed.verify("local-password"));

        let response = parsed.response();
        let parsed = CheckPacket::from_bytes(&response.to_bytes("remote-password").unwrap()).unwrap();
        assert_eq!(parsed.kind, CheckKind::Response);
        assert_eq!(parsed.transaction_id, request.transaction_id);
        assert!(parsed.verify("remote-password"));
    }

    #[test]
    fn test_tampering_is_detected() {
        let mut bytes = CheckPacket::request("a", "b", false).to_bytes("pwd").unwrap();
        // flip the nominate flag
        bytes[5] ^= FLAG_NOMINATE;
        let parsed = CheckPacket::from_bytes(&bytes).unwrap();
        assert!(parsed.nominate);
        assert!(!parsed.verify("pwd"));
    }

    #[test]
    fn test_rejects_foreign_datagrams() {
        // WireGuard handshake initiation starts with type 1 and three zero bytes
        let mut wg = [9u8; 148];
        wg[..4].copy_from_slice(&[1, 0, 0, 0]);
        assert!(!is_check(&wg));
        assert!(CheckPacket::from_bytes(&wg).is_err());

        let mut bytes = CheckPacket::request("a", "b", false).to_bytes("pwd").unwrap();
        bytes.push(0);
        assert!(CheckPacket::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_username_length_is_bounded() {
        let longest = CheckPacket::request(&"r".repeat(127), &"s".repeat(127), false);
        let bytes = longest.to_bytes("pwd").unwrap();
        let parsed = CheckPacket::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.username.len(), 255);
        assert!(parsed.verify("pwd"));

        let oversized = CheckPacket::request(&"r".repeat(300), "s", false);
        assert!(oversized.to_bytes("pwd").is_err());
        assert!(!oversized.verify("pwd"));
    }
}
