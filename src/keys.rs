/**
 * keys.rs
 *
 * WireGuard (Curve25519) keys in their base64 text form
 */

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::fmt;
use std::str::FromStr;
use x25519_dalek::{PublicKey as DalekPublic, SharedSecret, StaticSecret};

use crate::error::KeyError;

const KEY_LEN: usize = 32;

fn decode(s: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let bytes = STANDARD
        .decode(s.trim())
        .map_err(|e| KeyError::Encoding(e.to_string()))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| KeyError::Length(bytes.len()))
}

/// Local private key
#[derive(Clone)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// Generate a new clamped private key
    pub fn generate() -> Self {
        let mut bytes: [u8; KEY_LEN] = rand::random();
        // Curve25519 clamping, same as `wg genkey`
        bytes[0] &= 248;
        bytes[31] &= 127;
        bytes[31] |= 64;
        Self(bytes)
    }

    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(DalekPublic::from(&secret).to_bytes())
    }

    /// X25519 agreement with a remote public key
    pub fn diffie_hellman(&self, remote: &PublicKey) -> SharedSecret {
        StaticSecret::from(self.0).diffie_hellman(&DalekPublic::from(remote.0))
    }
}

impl FromStr for Key {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s).map(Self)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(public={})", self.public_key().short())
    }
}

/// Remote (or local) public key, the identity of a peer
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// First characters of the key, for logs
    pub fn short(&self) -> String {
        let full = self.to_string();
        full[..8].to_string()
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s).map(Self)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

/// Shortened form of a key string that may not parse
pub fn short(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_text_roundtrip() {
        let key = Key::generate();
        let parsed: Key = key.to_string().parse().unwrap();
        assert_eq!(parsed.public_key(), key.public_key());
        assert_eq!(key.to_string().len(), 44);
    }

    #[test]
    fn test_shared_secret_is_symmetric() {
        let alice = Key::generate();
        let bob = Key::generate();
        let ab = alice.diffie_hellman(&bob.public_key());
        let ba = bob.diffie_hellman(&alice.public_key());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert!(matches!("not base64!".parse::<PublicKey>(), Err(KeyError::Encoding(_))));
        assert_eq!(
            "AAAA".parse::<PublicKey>().unwrap_err().to_string(),
            KeyError::Length(3).to_string()
        );
    }

    #[test]
    fn test_short() {
        assert_eq!(short("abc"), "abc");
        assert_eq!(short("0123456789"), "01234567");
    }
}
