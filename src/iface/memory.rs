/**
 * iface/memory.rs
 *
 * In-memory interface driver recording the configuration it receives
 */

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::Iface;
use crate::error::IfaceError;
use crate::keys::{Key, PublicKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub allowed_ips: String,
    pub endpoint: SocketAddr,
    pub keepalive: Option<Duration>,
}

#[derive(Debug, Default)]
struct Interface {
    address: String,
    public_key: Option<PublicKey>,
    peers: HashMap<PublicKey, PeerEntry>,
}

#[derive(Debug, Default)]
struct State {
    interfaces: HashMap<String, Interface>,
    fail_create: bool,
}

#[derive(Debug)]
pub struct MemoryIface {
    listen_port: u16,
    state: Mutex<State>,
}

impl MemoryIface {
    /// Interfaces report `listen_port`, which should be a free local UDP port
    pub fn new(listen_port: u16) -> Self {
        Self {
            listen_port,
            state: Mutex::new(State::default()),
        }
    }

    /// Driver whose `create` always fails
    pub fn failing() -> Self {
        let iface = Self::new(0);
        iface.lock().fail_create = true;
        iface
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn address(&self, name: &str) -> Option<String> {
        self.lock().interfaces.get(name).map(|i| i.address.clone())
    }

    /// Public key matching the configured private key
    pub fn public_key(&self, name: &str) -> Option<PublicKey> {
        self.lock().interfaces.get(name).and_then(|i| i.public_key)
    }

    pub fn peer(&self, name: &str, peer: &PublicKey) -> Option<PeerEntry> {
        self.lock()
            .interfaces
            .get(name)
            .and_then(|i| i.peers.get(peer).cloned())
    }

    pub fn peer_count(&self, name: &str) -> usize {
        self.lock()
            .interfaces
            .get(name)
            .map(|i| i.peers.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Iface for MemoryIface {
    async fn create(&self, name: &str, address: &str) -> Result<(), IfaceError> {
        let mut state = self.lock();
        if state.fail_create {
            return Err(IfaceError::Command {
                command: format!("ip link add dev {} type wireguard", name),
                status: "exit status: 2".to_string(),
                stderr: "Operation not permitted".to_string(),
            });
        }
        state.interfaces.entry(name.to_string()).or_default().address = address.to_string();
        Ok(())
    }

    async fn configure(&self, name: &str, private_key: &Key) -> Result<(), IfaceError> {
        let mut state = self.lock();
        let iface = state
            .interfaces
            .get_mut(name)
            .ok_or_else(|| IfaceError::NotFound(name.to_string()))?;
        iface.public_key = Some(private_key.public_key());
        Ok(())
    }

    async fn listen_port(&self, name: &str) -> Result<u16, IfaceError> {
        if !self.lock().interfaces.contains_key(name) {
            return Err(IfaceError::NotFound(name.to_string()));
        }
        Ok(self.listen_port)
    }

    async fn update_peer(
        &self,
        name: &str,
        peer: &PublicKey,
        allowed_ips: &str,
        endpoint: SocketAddr,
        keepalive: Option<Duration>,
    ) -> Result<(), IfaceError> {
        let mut state = self.lock();
        let iface = state
            .interfaces
            .get_mut(name)
            .ok_or_else(|| IfaceError::NotFound(name.to_string()))?;
        iface.peers.insert(
            *peer,
            PeerEntry {
                allowed_ips: allowed_ips.to_string(),
                endpoint,
                keepalive,
            },
        );
        Ok(())
    }

    async fn remove_peer(&self, name: &str, peer: &PublicKey) -> Result<(), IfaceError> {
        let mut state = self.lock();
        let iface = state
            .interfaces
            .get_mut(name)
            .ok_or_else(|| IfaceError::NotFound(name.to_string()))?;
        iface.peers.remove(peer);
        Ok(())
    }
}
