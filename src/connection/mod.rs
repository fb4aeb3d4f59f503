/**
 * connection/mod.rs
 *
 * Per-peer NAT traversal negotiation:
 * - the status machine every event goes through
 * - credential exchange and candidate forwarding to the ICE agent
 * - installing the WireGuard peer once a path is selected
 */

mod proxy;
mod sink;

pub use sink::{RecordingSink, SealedSink, Sent, SignalSink};

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::ConnError;
use crate::ice::{
    Agent, AgentCommand, AgentConfig, AgentEvent, Candidate, IceCredentials, IceUrl, Role,
    SelectedPath,
};
use crate::iface::{Iface, PEER_KEEPALIVE};
use crate::keys::{Key, PublicKey};

/// Default silence on a connected path before it counts as lost
pub const DEFAULT_PATH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    New,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::New => "new",
            Status::Negotiating => "negotiating",
            Status::Connected => "connected",
            Status::Failed => "failed",
            Status::Closed => "closed",
        })
    }
}

/// Inputs of the status machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Open,
    Offer,
    Answer,
    RemoteCandidate,
    PathSelected,
    PathLost,
    Timeout,
    Fail,
    Close,
}

impl Event {
    fn name(self) -> &'static str {
        match self {
            Event::Open => "open",
            Event::Offer => "offer",
            Event::Answer => "answer",
            Event::RemoteCandidate => "remote candidate",
            Event::PathSelected => "path selected",
            Event::PathLost => "path lost",
            Event::Timeout => "timeout",
            Event::Fail => "fail",
            Event::Close => "close",
        }
    }
}

impl Status {
    /// The only place a status changes
    pub fn next(self, event: Event) -> Result<Status, ConnError> {
        use Event::*;
        use Status::*;

        match (self, event) {
            (_, Close) => Ok(Closed),
            (New, Open) => Ok(Negotiating),
            (New | Negotiating, Offer | Answer) => Ok(self),
            (Closed, RemoteCandidate) => Err(self.reject(event)),
            (_, RemoteCandidate) => Ok(self),
            (Negotiating, PathSelected) => Ok(Connected),
            (Negotiating, Timeout | Fail) => Ok(Failed),
            (Connected, PathLost | Fail) => Ok(Failed),
            _ => Err(self.reject(event)),
        }
    }

    fn reject(self, event: Event) -> ConnError {
        ConnError::InvalidTransition {
            from: self,
            event: event.name(),
        }
    }
}

/// Everything a connection needs to know about its two ends
#[derive(Clone)]
pub struct ConnConfig {
    /// Where the local WireGuard socket listens
    pub wg_listen_addr: SocketAddr,
    pub wg_iface: String,
    pub wg_allowed_ips: String,
    pub local_key: Key,
    pub remote_key: PublicKey,
    pub stun_turn_urls: Vec<IceUrl>,
    pub iface_black_list: HashSet<String>,
    pub allow_loopback: bool,
    pub path_timeout: Duration,
}

impl fmt::Debug for ConnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnConfig")
            .field("wg_listen_addr", &self.wg_listen_addr)
            .field("wg_iface", &self.wg_iface)
            .field("wg_allowed_ips", &self.wg_allowed_ips)
            .field("remote_key", &self.remote_key)
            .finish_non_exhaustive()
    }
}

struct AgentHandle {
    commands: mpsc::UnboundedSender<AgentCommand>,
    shutdown: watch::Sender<bool>,
}

impl AgentHandle {
    fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

struct State {
    status: Status,
    local: Option<IceCredentials>,
    remote: Option<IceCredentials>,
    /// Remote candidates received before the agent runs
    pending: Vec<Candidate>,
    agent: Option<AgentHandle>,
    /// The interface carries a peer entry for this connection
    installed: bool,
    failure: Option<ConnError>,
}

struct Inner {
    config: ConnConfig,
    sink: Arc<dyn SignalSink>,
    iface: Arc<dyn Iface>,
    state: Mutex<State>,
    status: watch::Sender<Status>,
}

/// Negotiated path to one remote peer
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(config: ConnConfig, sink: Arc<dyn SignalSink>, iface: Arc<dyn Iface>) -> Self {
        let (status, _) = watch::channel(Status::New);
        Self {
            inner: Arc::new(Inner {
                config,
                sink,
                iface,
                state: Mutex::new(State {
                    status: Status::New,
                    local: None,
                    remote: None,
                    pending: Vec::new(),
                    agent: None,
                    installed: false,
                    failure: None,
                }),
                status,
            }),
        }
    }

    pub fn remote_key(&self) -> &PublicKey {
        &self.inner.config.remote_key
    }

    pub fn status(&self) -> Status {
        *self.inner.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.inner.status.subscribe()
    }

    /// Start negotiating and wait until a path is selected or `timeout`
    pub async fn open(&self, timeout: Duration) -> Result<(), ConnError> {
        let mut status = self.subscribe();

        let (local, reply) = {
            let mut state = self.inner.lock();
            self.inner.apply(&mut state, Event::Open)?;
            let local = IceCredentials::generate();
            state.local = Some(local.clone());
            (local, state.remote.is_some())
        };

        let sent = if reply {
            self.inner.sink.send_answer(&local).await
        } else {
            self.inner.sink.send_offer(&local).await
        };
        if let Err(e) = sent {
            self.inner.fail(e.into());
            return Err(self.inner.take_failure());
        }

        if let Err(e) = Inner::start_agent(&self.inner) {
            self.inner.fail(e);
            return Err(self.inner.take_failure());
        }

        let outcome = tokio::time::timeout(timeout, status.wait_for(|s| *s != Status::Negotiating))
            .await
            .map(|changed| changed.map(|s| *s).unwrap_or(Status::Closed));

        match outcome {
            Ok(Status::Connected) => Ok(()),
            Ok(Status::Closed) => Err(ConnError::Closed),
            Ok(_) => Err(self.inner.take_failure()),
            Err(_) => {
                let mut state = self.inner.lock();
                if self.inner.apply(&mut state, Event::Timeout).is_ok() {
                    if let Some(agent) = state.agent.take() {
                        agent.stop();
                    }
                }
                match state.status {
                    Status::Connected => Ok(()),
                    Status::Closed => Err(ConnError::Closed),
                    _ => Err(ConnError::Timeout),
                }
            }
        }
    }

    /// Remote credentials from an OFFER; answers once local ones exist
    pub async fn on_offer(&self, credentials: IceCredentials) -> Result<(), ConnError> {
        let answer = {
            let mut state = self.inner.lock();
            self.inner.apply(&mut state, Event::Offer)?;
            Inner::record_remote(&mut state, credentials);
            state.local.clone()
        };

        if let Some(local) = answer {
            self.inner.sink.send_answer(&local).await?;
        }
        Ok(())
    }

    pub async fn on_answer(&self, credentials: IceCredentials) -> Result<(), ConnError> {
        let mut state = self.inner.lock();
        self.inner.apply(&mut state, Event::Answer)?;
        Inner::record_remote(&mut state, credentials);
        Ok(())
    }

    pub fn on_remote_candidate(&self, candidate: Candidate) -> Result<(), ConnError> {
        let mut state = self.inner.lock();
        self.inner.apply(&mut state, Event::RemoteCandidate)?;
        if state.status == Status::Connected || state.status == Status::Failed {
            return Ok(());
        }
        match &state.agent {
            Some(agent) => {
                let _ = agent.commands.send(AgentCommand::RemoteCandidate(candidate));
            }
            None => state.pending.push(candidate),
        }
        Ok(())
    }

    /// Tear everything down; closing twice is a no-op
    pub async fn close(&self) -> Result<(), ConnError> {
        let installed = {
            let mut state = self.inner.lock();
            if state.status == Status::Closed {
                return Ok(());
            }
            self.inner.apply(&mut state, Event::Close)?;
            if let Some(agent) = state.agent.take() {
                agent.stop();
            }
            std::mem::take(&mut state.installed)
        };

        if installed {
            self.inner.remove_peer().await?;
        }
        debug!("Closed connection to {}", self.inner.config.remote_key.short());
        Ok(())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply(&self, state: &mut State, event: Event) -> Result<Status, ConnError> {
        let next = state.status.next(event)?;
        if next != state.status {
            debug!(
                "Connection to {}: {} -> {} ({})",
                self.config.remote_key.short(),
                state.status,
                next,
                event.name()
            );
            state.status = next;
            self.status.send_replace(next);
        }
        Ok(next)
    }

    /// Move to Failed keeping `error` as the reason
    fn fail(&self, error: ConnError) {
        let mut state = self.lock();
        if self.apply(&mut state, Event::Fail).is_ok() {
            state.failure = Some(error);
            if let Some(agent) = state.agent.take() {
                agent.stop();
            }
        }
    }

    fn take_failure(&self) -> ConnError {
        let mut state = self.lock();
        match state.failure.take() {
            Some(error) => error,
            None if state.status == Status::Closed => ConnError::Closed,
            None => ConnError::PathLost,
        }
    }

    fn record_remote(state: &mut State, credentials: IceCredentials) {
        if state.remote.as_ref() == Some(&credentials) {
            return;
        }
        // a new session invalidates candidates of the previous one
        if state.remote.is_some() {
            state.pending.clear();
        }
        if let Some(agent) = &state.agent {
            let _ = agent
                .commands
                .send(AgentCommand::RemoteCredentials(credentials.clone()));
        }
        state.remote = Some(credentials);
    }

    fn role(&self) -> Role {
        if self.config.local_key.public_key() > self.config.remote_key {
            Role::Controlling
        } else {
            Role::Controlled
        }
    }

    fn start_agent(inner: &Arc<Self>) -> Result<(), ConnError> {
        let mut state = inner.lock();
        if state.status != Status::Negotiating {
            return Err(ConnError::Closed);
        }
        let Some(local) = state.local.clone() else {
            return Err(ConnError::Closed);
        };

        let (events_tx, events) = mpsc::unbounded_channel();
        let agent = Agent::bind(
            AgentConfig {
                role: inner.role(),
                local,
                stun_turn_urls: inner.config.stun_turn_urls.clone(),
                iface_black_list: inner.config.iface_black_list.clone(),
                allow_loopback: inner.config.allow_loopback,
                path_timeout: inner.config.path_timeout,
            },
            events_tx,
        )?;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        if let Some(remote) = &state.remote {
            let _ = commands.send(AgentCommand::RemoteCredentials(remote.clone()));
        }
        for candidate in state.pending.drain(..) {
            let _ = commands.send(AgentCommand::RemoteCandidate(candidate));
        }
        state.agent = Some(AgentHandle { commands, shutdown });
        drop(state);

        tokio::spawn(agent.run(commands_rx, shutdown_rx));
        tokio::spawn(Inner::drive(inner.clone(), events));
        Ok(())
    }

    /// React to the agent until it stops
    async fn drive(inner: Arc<Self>, mut events: mpsc::UnboundedReceiver<AgentEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                AgentEvent::LocalCandidate(candidate) => {
                    if let Err(e) = inner.sink.send_candidate(&candidate).await {
                        warn!(
                            "Failed to send candidate to {}: {}",
                            inner.config.remote_key.short(),
                            e
                        );
                    }
                }
                AgentEvent::Selected(path) => {
                    if let Err(e) = inner.install(path).await {
                        warn!(
                            "Failed to install path to {}: {}",
                            inner.config.remote_key.short(),
                            e
                        );
                        inner.fail(e);
                        break;
                    }
                }
                AgentEvent::PathLost => {
                    let mut state = inner.lock();
                    if inner.apply(&mut state, Event::PathLost).is_ok() {
                        state.failure = Some(ConnError::PathLost);
                        state.agent = None;
                    }
                    break;
                }
            }
        }
    }

    /// Install the WireGuard peer behind a loopback proxy, then mark Connected
    async fn install(&self, path: SelectedPath) -> Result<(), ConnError> {
        let socket = proxy::bind().await?;
        let endpoint = socket.local_addr()?;
        let remote = path.remote;

        self.iface
            .update_peer(
                &self.config.wg_iface,
                &self.config.remote_key,
                &self.config.wg_allowed_ips,
                endpoint,
                Some(PEER_KEEPALIVE),
            )
            .await?;

        let selected = {
            let mut state = self.lock();
            match self.apply(&mut state, Event::PathSelected) {
                Ok(_) => {
                    state.installed = true;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };

        if let Err(e) = selected {
            // closed or timed out while the peer was being installed
            if let Err(remove) = self.remove_peer().await {
                warn!("Failed to remove stale peer entry: {}", remove);
            }
            return Err(e);
        }

        info!(
            "Connected to {} via {}",
            self.config.remote_key.short(),
            remote
        );
        tokio::spawn(proxy::run(socket, self.config.wg_listen_addr, path));
        Ok(())
    }

    async fn remove_peer(&self) -> Result<(), ConnError> {
        self.iface
            .remove_peer(&self.config.wg_iface, &self.config.remote_key)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SignalError;
    use crate::iface::MemoryIface;
    use async_trait::async_trait;
    use std::sync::{OnceLock, Weak};

    /// Closes its connection while the offer is in flight
    struct ClosingSink {
        conn: OnceLock<Weak<Connection>>,
    }

    #[async_trait]
    impl SignalSink for ClosingSink {
        async fn send_offer(&self, _: &IceCredentials) -> Result<(), SignalError> {
            if let Some(conn) = self.conn.get().and_then(Weak::upgrade) {
                conn.close().await.unwrap();
            }
            Ok(())
        }

        async fn send_answer(&self, _: &IceCredentials) -> Result<(), SignalError> {
            Ok(())
        }

        async fn send_candidate(&self, _: &Candidate) -> Result<(), SignalError> {
            Ok(())
        }
    }

    fn connection(sink: Arc<dyn SignalSink>) -> Connection {
        let local_key = Key::generate();
        let remote_key = Key::generate().public_key();
        Connection::new(
            ConnConfig {
                wg_listen_addr: "127.0.0.1:51820".parse().unwrap(),
                wg_iface: "wt0".to_string(),
                wg_allowed_ips: "100.64.0.2/32".to_string(),
                local_key,
                remote_key,
                stun_turn_urls: Vec::new(),
                iface_black_list: HashSet::new(),
                allow_loopback: true,
                path_timeout: DEFAULT_PATH_TIMEOUT,
            },
            sink,
            Arc::new(MemoryIface::new(51820)),
        )
    }

    #[test]
    fn test_transitions() {
        use Event::*;
        use Status::*;

        assert_eq!(New.next(Open).unwrap(), Negotiating);
        assert_eq!(Negotiating.next(Offer).unwrap(), Negotiating);
        assert_eq!(New.next(Answer).unwrap(), New);
        assert_eq!(Negotiating.next(PathSelected).unwrap(), Connected);
        assert_eq!(Negotiating.next(Timeout).unwrap(), Failed);
        assert_eq!(Connected.next(PathLost).unwrap(), Failed);
        assert_eq!(Connected.next(RemoteCandidate).unwrap(), Connected);
        assert_eq!(Failed.next(Close).unwrap(), Closed);
        assert_eq!(Closed.next(Close).unwrap(), Closed);

        assert!(matches!(
            Connected.next(Offer),
            Err(ConnError::InvalidTransition { from: Connected, event: "offer" })
        ));
        assert!(Closed.next(RemoteCandidate).is_err());
        assert!(Negotiating.next(Open).is_err());
        assert!(New.next(PathSelected).is_err());
        assert!(Failed.next(Answer).is_err());
    }

    #[tokio::test]
    async fn test_open_sends_offer_then_times_out() {
        let sink = Arc::new(RecordingSink::new());
        let conn = connection(sink.clone());

        let err = conn.open(Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, ConnError::Timeout));
        assert_eq!(conn.status(), Status::Failed);
        assert!(matches!(sink.sent().first(), Some(Sent::Offer(_))));

        conn.close().await.unwrap();
        assert_eq!(conn.status(), Status::Closed);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_offer_before_open_is_answered_by_open() {
        let sink = Arc::new(RecordingSink::new());
        let conn = connection(sink.clone());

        conn.on_offer(IceCredentials::generate()).await.unwrap();
        assert!(sink.sent().is_empty());

        let _ = conn.open(Duration::from_millis(100)).await;
        assert!(matches!(sink.sent().first(), Some(Sent::Answer(_))));
        assert!(!sink.sent().iter().any(|s| matches!(s, Sent::Offer(_))));
    }

    #[tokio::test]
    async fn test_offer_during_negotiation_is_answered() {
        let sink = Arc::new(RecordingSink::new());
        let conn = Arc::new(connection(sink.clone()));

        let opening = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.open(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        conn.on_offer(IceCredentials::generate()).await.unwrap();

        let sent = sink.sent();
        let Some(Sent::Offer(offered)) = sent.first().cloned() else {
            panic!("expected an offer first, got {:?}", sent);
        };
        assert!(sent.iter().any(|s| *s == Sent::Answer(offered.clone())));

        conn.close().await.unwrap();
        assert!(matches!(opening.await.unwrap(), Err(ConnError::Closed)));
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_messages() {
        let sink = Arc::new(RecordingSink::new());
        let conn = connection(sink.clone());
        conn.close().await.unwrap();

        assert!(conn.on_offer(IceCredentials::generate()).await.is_err());
        assert!(conn.on_answer(IceCredentials::generate()).await.is_err());
        let candidate = Candidate::host("10.0.0.1:4000".parse().unwrap(), 1);
        assert!(conn.on_remote_candidate(candidate).is_err());
        assert!(conn.open(Duration::from_millis(10)).await.is_err());
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_close_during_open_reports_closed() {
        let sink = Arc::new(ClosingSink {
            conn: OnceLock::new(),
        });
        let conn = Arc::new(connection(sink.clone()));
        let _ = sink.conn.set(Arc::downgrade(&conn));

        let err = conn.open(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ConnError::Closed), "got {:?}", err);
        assert_eq!(conn.status(), Status::Closed);
    }
}
