/**
 * engine.rs
 *
 * Peer connection engine
 *
 * Owns one Connection per remote key behind a single mutex, keeps each peer
 * connected with a supervising task, and routes inbound signaling messages
 * to the connection they belong to.
 */

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::connection::{ConnConfig, Connection, SealedSink, Status, DEFAULT_PATH_TIMEOUT};
use crate::error::{EngineError, RouteError};
use crate::ice::{Candidate, IceUrl};
use crate::iface::Iface;
use crate::keys::{self, Key, PublicKey};
use crate::signal::{self, BodyType, Message, MessageHandler, Signal};

/// Time a single negotiation may take
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// A remote node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Base64 WireGuard public key
    pub wg_pub_key: String,
    /// Traffic routed to the peer, e.g. `100.64.0.2/32`
    pub wg_allowed_ips: String,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub wg_iface: String,
    /// Address of the local interface, e.g. `100.64.0.1/24`
    pub wg_addr: String,
    pub stun_turn_urls: Vec<IceUrl>,
    pub iface_black_list: HashSet<String>,
    pub allow_loopback: bool,
    pub attempt_timeout: Duration,
    pub path_timeout: Duration,
    pub backoff: ExponentialBackoff,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wg_iface: "wt0".to_string(),
            wg_addr: "100.64.0.1/24".to_string(),
            stun_turn_urls: Vec::new(),
            iface_black_list: HashSet::new(),
            allow_loopback: false,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            path_timeout: DEFAULT_PATH_TIMEOUT,
            backoff: ExponentialBackoff::peer_default(),
        }
    }
}

struct Local {
    key: Key,
    public: PublicKey,
    wg_listen_addr: SocketAddr,
}

struct Inner {
    config: EngineConfig,
    signal: Arc<dyn Signal>,
    iface: Arc<dyn Iface>,
    conns: Mutex<HashMap<String, Arc<Connection>>>,
    local: OnceLock<Local>,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(config: EngineConfig, signal: Arc<dyn Signal>, iface: Arc<dyn Iface>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                signal,
                iface,
                conns: Mutex::new(HashMap::new()),
                local: OnceLock::new(),
                shutdown,
            }),
        }
    }

    /// Bring up the interface, start routing signal messages and connect to
    /// every peer
    pub async fn start(&self, local_key: Key, peers: Vec<Peer>) -> Result<(), EngineError> {
        if self.inner.local.get().is_some() {
            return Err(EngineError::AlreadyStarted);
        }
        let config = &self.inner.config;
        let iface = &self.inner.iface;

        iface.create(&config.wg_iface, &config.wg_addr).await?;
        iface.configure(&config.wg_iface, &local_key).await?;
        let port = iface.listen_port(&config.wg_iface).await?;
        info!("Interface {} listening on port {}", config.wg_iface, port);

        let public = local_key.public_key();
        self.inner
            .local
            .set(Local {
                key: local_key,
                public,
                wg_listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            })
            .map_err(|_| EngineError::AlreadyStarted)?;

        self.inner.signal.receive(Arc::new(Router {
            engine: Arc::downgrade(&self.inner),
        }));
        self.inner.signal.wait_connected().await;
        info!("Engine started as {}", public.short());

        for peer in peers {
            if let Err(e) = self.add_peer(peer).await {
                error!("Skipping peer: {}", e);
            }
        }
        Ok(())
    }

    /// Start keeping `peer` connected
    ///
    /// The peer's first Connection is registered before this returns, so a
    /// removal right after it always reaches the supervisor.
    pub async fn add_peer(&self, peer: Peer) -> Result<(), EngineError> {
        if self.inner.local.get().is_none() {
            return Err(EngineError::NotStarted);
        }
        let remote: PublicKey =
            peer.wg_pub_key
                .parse()
                .map_err(|source| EngineError::InvalidPeerKey {
                    key: peer.wg_pub_key.clone(),
                    source,
                })?;

        info!("Adding peer {}", remote.short());
        let Some(conn) = self.register(&peer, &remote, None).await else {
            return Err(EngineError::NotStarted);
        };
        tokio::spawn(self.clone().establish(peer, remote, conn));
        Ok(())
    }

    /// Negotiate `conn`, retrying with a fresh Connection until connected,
    /// then watch it and reconnect when its path fails. Ends once the map
    /// entry is gone or owned by someone else.
    async fn establish(self, peer: Peer, remote: PublicKey, mut conn: Arc<Connection>) {
        let mut backoff = self.inner.config.backoff.clone();
        backoff.reset();
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                return;
            }

            let result = conn.open(self.inner.config.attempt_timeout).await;

            if !self.is_current(&remote, &conn).await {
                debug!("Discarding attempt to {}: entry removed or superseded", remote.short());
                if let Err(e) = conn.close().await {
                    warn!("Failed to close connection to {}: {}", remote.short(), e);
                }
                return;
            }

            match result {
                Ok(()) => {
                    backoff.reset();
                    let mut status = conn.subscribe();
                    tokio::select! {
                        _ = status.wait_for(|s| *s != Status::Connected) => {}
                        _ = shutdown.wait_for(|stop| *stop) => return,
                    }
                    if conn.status() == Status::Closed {
                        return;
                    }
                    warn!("Connection to {} lost, reconnecting", remote.short());
                }
                Err(e) => {
                    warn!("Connection attempt to {} failed: {}", remote.short(), e);
                    let Some(delay) = backoff.next_backoff() else {
                        error!("Giving up on peer {}: retry policy expired", remote.short());
                        return;
                    };
                    debug!("Retrying {} in {:?}", remote.short(), delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait_for(|stop| *stop) => return,
                    }
                }
            }

            conn = match self.register(&peer, &remote, Some(&conn)).await {
                Some(next) => next,
                None => {
                    debug!("Stopped connecting to {}: entry removed", remote.short());
                    return;
                }
            };
        }
    }

    async fn is_current(&self, remote: &PublicKey, conn: &Arc<Connection>) -> bool {
        let conns = self.inner.conns.lock().await;
        matches!(conns.get(&remote.to_string()), Some(current) if Arc::ptr_eq(current, conn))
    }

    /// Put a fresh Connection for `peer` in the map and close the one it
    /// replaces
    ///
    /// With `previous` set this only happens while that connection is still
    /// the registered one; `None` means the entry was removed or taken over.
    async fn register(
        &self,
        peer: &Peer,
        remote: &PublicKey,
        previous: Option<&Arc<Connection>>,
    ) -> Option<Arc<Connection>> {
        let local = self.inner.local.get()?;
        let key = remote.to_string();

        let (conn, stale) = {
            let mut conns = self.inner.conns.lock().await;
            if let Some(previous) = previous {
                let owned = matches!(conns.get(&key), Some(current) if Arc::ptr_eq(current, previous));
                if !owned {
                    return None;
                }
            }

            let config = ConnConfig {
                wg_listen_addr: local.wg_listen_addr,
                wg_iface: self.inner.config.wg_iface.clone(),
                wg_allowed_ips: peer.wg_allowed_ips.clone(),
                local_key: local.key.clone(),
                remote_key: *remote,
                stun_turn_urls: self.inner.config.stun_turn_urls.clone(),
                iface_black_list: self.inner.config.iface_black_list.clone(),
                allow_loopback: self.inner.config.allow_loopback,
                path_timeout: self.inner.config.path_timeout,
            };
            let sink = Arc::new(SealedSink::new(
                self.inner.signal.clone(),
                local.key.clone(),
                *remote,
            ));
            let conn = Arc::new(Connection::new(config, sink, self.inner.iface.clone()));
            let stale = conns.insert(key, conn.clone());
            (conn, stale)
        };

        if let Some(stale) = stale {
            if let Err(e) = stale.close().await {
                warn!("Failed to close stale connection to {}: {}", remote.short(), e);
            }
        }
        Some(conn)
    }

    /// Forget `key` and close its connection; unknown keys are ignored
    pub async fn remove_peer_connection(&self, key: &str) -> Result<(), EngineError> {
        let removed = {
            let mut conns = self.inner.conns.lock().await;
            conns.remove(&normalize(key))
        };
        if let Some(conn) = removed {
            info!("Removed peer {}", keys::short(key));
            conn.close().await?;
        }
        Ok(())
    }

    /// Status of the connection to `key`, `None` when there is none
    pub async fn get_status(&self, key: &str) -> Option<Status> {
        let conns = self.inner.conns.lock().await;
        conns.get(&normalize(key)).map(|c| c.status())
    }

    /// Keys of every registered connection
    pub async fn peers(&self) -> Vec<String> {
        self.inner.conns.lock().await.keys().cloned().collect()
    }

    /// Stop all supervisors and close every connection
    pub async fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
        let conns: Vec<Arc<Connection>> = {
            let mut conns = self.inner.conns.lock().await;
            conns.drain().map(|(_, c)| c).collect()
        };
        for conn in conns {
            if let Err(e) = conn.close().await {
                warn!("Failed to close connection to {}: {}", conn.remote_key().short(), e);
            }
        }
        info!("Engine stopped");
    }
}

/// Canonical map key for a public key string
fn normalize(key: &str) -> String {
    key.parse::<PublicKey>()
        .map(|k| k.to_string())
        .unwrap_or_else(|_| key.to_string())
}

/// Dispatches inbound signal messages to their connection
struct Router {
    engine: Weak<Inner>,
}

#[async_trait]
impl MessageHandler for Router {
    async fn handle(&self, message: Message) -> Result<(), RouteError> {
        let Some(inner) = self.engine.upgrade() else {
            return Ok(());
        };
        let Some(local) = inner.local.get() else {
            return Ok(());
        };

        if message.recipient_key != local.public.to_string() {
            return Err(RouteError::WrongRecipient(message.recipient_key));
        }

        let conn = {
            let conns = inner.conns.lock().await;
            conns.get(&normalize(&message.sender_key)).cloned()
        };
        let Some(conn) = conn else {
            return Err(RouteError::UnknownPeer(message.sender_key));
        };
        let remote = conn.remote_key().to_string();
        if remote != message.sender_key {
            return Err(RouteError::KeyMismatch {
                expected: remote,
                got: message.sender_key,
            });
        }

        let payload = signal::open_payload(&message, &local.key)?;
        match message.kind() {
            BodyType::Offer => conn.on_offer(signal::parse_credentials(&payload)?).await?,
            BodyType::Answer => conn.on_answer(signal::parse_credentials(&payload)?).await?,
            BodyType::Candidate => conn.on_remote_candidate(Candidate::unmarshal(&payload)?)?,
        }
        Ok(())
    }
}
