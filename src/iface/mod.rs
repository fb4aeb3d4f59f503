/**
 * iface/mod.rs
 *
 * Tunnel interface configuration seam
 */

mod memory;
mod wg;

pub use memory::{MemoryIface, PeerEntry};
pub use wg::WgIface;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::IfaceError;
use crate::keys::{Key, PublicKey};

/// Persistent keepalive installed with every peer entry
pub const PEER_KEEPALIVE: Duration = Duration::from_secs(25);

/// WireGuard interface driver
#[async_trait]
pub trait Iface: Send + Sync {
    /// Create `name` if missing, assign `address` and bring it up
    async fn create(&self, name: &str, address: &str) -> Result<(), IfaceError>;

    async fn configure(&self, name: &str, private_key: &Key) -> Result<(), IfaceError>;

    /// UDP port WireGuard listens on
    async fn listen_port(&self, name: &str) -> Result<u16, IfaceError>;

    /// Add or replace the entry for `peer`
    async fn update_peer(
        &self,
        name: &str,
        peer: &PublicKey,
        allowed_ips: &str,
        endpoint: SocketAddr,
        keepalive: Option<Duration>,
    ) -> Result<(), IfaceError>;

    async fn remove_peer(&self, name: &str, peer: &PublicKey) -> Result<(), IfaceError>;
}
