/**
 * signal/mod.rs
 *
 * Signaling protocol between peers:
 * - addressed messages with OFFER / ANSWER / CANDIDATE bodies
 * - sealed credential and candidate payloads
 * - the transport seam (`Signal`) and inbound handler seam (`MessageHandler`)
 */

mod client;
mod crypto;
mod memory;

pub use client::WsSignal;
pub use crypto::{open, seal};
pub use memory::{MemoryRelay, MemorySignal};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{RouteError, SignalError};
use crate::ice::{Candidate, IceCredentials, MAX_PWD_LEN, MAX_UFRAG_LEN};
use crate::keys::{Key, PublicKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BodyType {
    Offer,
    Answer,
    Candidate,
}

impl fmt::Display for BodyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BodyType::Offer => "OFFER",
            BodyType::Answer => "ANSWER",
            BodyType::Candidate => "CANDIDATE",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    #[serde(rename = "type")]
    pub kind: BodyType,
    /// Sealed payload, base64 on the wire
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// Message exchanged through the signal relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender_key: String,
    pub recipient_key: String,
    pub body: Body,
}

impl Message {
    pub fn kind(&self) -> BodyType {
        self.body.kind
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

fn sealed_message(
    kind: BodyType,
    plaintext: &[u8],
    local: &Key,
    remote: &PublicKey,
) -> Result<Message, SignalError> {
    Ok(Message {
        sender_key: local.public_key().to_string(),
        recipient_key: remote.to_string(),
        body: Body {
            kind,
            payload: seal(plaintext, local, remote)?,
        },
    })
}

/// Build a sealed OFFER or ANSWER carrying `credentials`
pub fn marshal_credential(
    kind: BodyType,
    credentials: &IceCredentials,
    local: &Key,
    remote: &PublicKey,
) -> Result<Message, SignalError> {
    if kind == BodyType::Candidate {
        return Err(SignalError::UnexpectedType(kind.to_string()));
    }
    let text = format!("{}:{}", credentials.ufrag, credentials.pwd);
    sealed_message(kind, text.as_bytes(), local, remote)
}

/// Build a sealed CANDIDATE
pub fn marshal_candidate(
    candidate: &Candidate,
    local: &Key,
    remote: &PublicKey,
) -> Result<Message, SignalError> {
    sealed_message(
        BodyType::Candidate,
        candidate.marshal().as_bytes(),
        local,
        remote,
    )
}

/// Open the payload of a message addressed to `local`
pub fn open_payload(message: &Message, local: &Key) -> Result<Vec<u8>, SignalError> {
    let sender: PublicKey = message.sender_key.parse()?;
    open(&message.body.payload, local, &sender)
}

/// Parse an opened `"<ufrag>:<pwd>"` credential payload
pub fn parse_credentials(payload: &[u8]) -> Result<IceCredentials, SignalError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| SignalError::InvalidPayload("credentials are not UTF-8".to_string()))?;
    let (ufrag, pwd) = match text.split_once(':') {
        Some((ufrag, pwd)) if !ufrag.is_empty() && !pwd.is_empty() => (ufrag, pwd),
        _ => {
            return Err(SignalError::InvalidPayload(format!(
                "malformed credentials ({} bytes)",
                payload.len()
            )))
        }
    };
    if ufrag.len() > MAX_UFRAG_LEN || pwd.len() > MAX_PWD_LEN {
        return Err(SignalError::InvalidPayload(format!(
            "credentials too long (ufrag {} bytes, pwd {} bytes)",
            ufrag.len(),
            pwd.len()
        )));
    }
    Ok(IceCredentials {
        ufrag: ufrag.to_string(),
        pwd: pwd.to_string(),
    })
}

/// Open and parse an OFFER or ANSWER
pub fn unmarshal_credential(message: &Message, local: &Key) -> Result<IceCredentials, SignalError> {
    if message.kind() == BodyType::Candidate {
        return Err(SignalError::UnexpectedType(message.kind().to_string()));
    }
    parse_credentials(&open_payload(message, local)?)
}

/// Consumer of the inbound message stream
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<(), RouteError>;
}

/// Signaling transport
///
/// Messages from one sender are delivered to the handler in the order they
/// were sent, one at a time. Handler errors are logged and the stream goes on.
#[async_trait]
pub trait Signal: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), SignalError>;

    /// Start delivering inbound messages to `handler`
    fn receive(&self, handler: Arc<dyn MessageHandler>);

    /// Resolves once the transport can send
    async fn wait_connected(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_message() {
        let alice = Key::generate();
        let bob = Key::generate();
        let creds = IceCredentials::generate();

        let msg = marshal_credential(BodyType::Offer, &creds, &alice, &bob.public_key()).unwrap();
        assert_eq!(msg.sender_key, alice.public_key().to_string());
        assert_eq!(msg.recipient_key, bob.public_key().to_string());
        assert_eq!(unmarshal_credential(&msg, &bob).unwrap(), creds);

        assert!(marshal_credential(BodyType::Candidate, &creds, &alice, &bob.public_key()).is_err());
    }

    #[test]
    fn test_json_layout() {
        let alice = Key::generate();
        let bob = Key::generate();
        let candidate = Candidate::host("10.0.0.2:5000".parse().unwrap(), 65535);
        let msg = marshal_candidate(&candidate, &alice, &bob.public_key()).unwrap();

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["body"]["type"], "CANDIDATE");
        assert!(json["body"]["payload"].is_string());

        let back: Message = serde_json::from_value(json).unwrap();
        let payload = open_payload(&back, &bob).unwrap();
        assert_eq!(Candidate::unmarshal(&payload).unwrap(), candidate);
    }

    #[test]
    fn test_parse_credentials_errors() {
        assert!(parse_credentials(b"nocolon").is_err());
        assert!(parse_credentials(b":pwd").is_err());
        assert!(parse_credentials(&[0xff, b':', b'a']).is_err());
        let creds = parse_credentials(b"abc:def").unwrap();
        assert_eq!(creds.ufrag, "abc");
        assert_eq!(creds.pwd, "def");
    }

    #[test]
    fn test_parse_credentials_length_bound() {
        let longest = format!("{}:{}", "u".repeat(MAX_UFRAG_LEN), "p".repeat(MAX_PWD_LEN));
        assert!(parse_credentials(longest.as_bytes()).is_ok());

        let long_ufrag = format!("{}:pwd", "u".repeat(300));
        assert!(matches!(
            parse_credentials(long_ufrag.as_bytes()),
            Err(SignalError::InvalidPayload(_))
        ));
        let long_pwd = format!("ufrag:{}", "p".repeat(MAX_PWD_LEN + 1));
        assert!(matches!(
            parse_credentials(long_pwd.as_bytes()),
            Err(SignalError::InvalidPayload(_))
        ));
    }
}
