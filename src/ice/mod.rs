/**
 * ice/mod.rs
 *
 * ICE-style NAT traversal:
 * - session credentials
 * - candidate model and wire format
 * - STUN server reflexive discovery
 * - authenticated UDP connectivity checks
 * - the agent driving gathering, checks and nomination
 */

mod agent;
mod candidate;
mod check;
mod stun;
mod url;

pub use agent::{Agent, AgentCommand, AgentConfig, AgentEvent, Role, SelectedPath};
pub use candidate::{Candidate, CandidateType};
pub use check::{CheckKind, CheckPacket};
pub use stun::StunClient;
pub use url::{IceUrl, Scheme};

use std::fmt;

/// Longest accepted fragment; two of them joined by `:` must fit a check
/// packet's one byte username length
pub const MAX_UFRAG_LEN: usize = 127;

/// Longest accepted password (RFC 8445 section 5.3)
pub const MAX_PWD_LEN: usize = 256;

/// Local or remote ICE session credentials
#[derive(Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    /// Fresh random credentials (16 char fragment, 32 char password)
    pub fn generate() -> Self {
        Self {
            ufrag: hex::encode(rand::random::<[u8; 8]>()),
            pwd: hex::encode(rand::random::<[u8; 16]>()),
        }
    }
}

impl fmt::Debug for IceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IceCredentials")
            .field("ufrag", &self.ufrag)
            .field("pwd", &"<redacted>")
            .finish()
    }
}
