/**
 * ice/agent.rs
 *
 * ICE agent: candidate gathering, connectivity checks, nomination and
 * datagram forwarding over the selected pair
 */

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use get_if_addrs::get_if_addrs;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::candidate::{Candidate, CandidateType};
use super::check::{is_check, CheckKind, CheckPacket};
use super::stun::StunClient;
use super::url::{IceUrl, Scheme};
use super::IceCredentials;

/// Interval between connectivity check rounds
const CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// Interval of consent checks on the selected pair (controlling side)
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

/// Unanswered checks are forgotten after this long
const PENDING_TTL: Duration = Duration::from_secs(5);

const STUN_TIMEOUT: Duration = Duration::from_secs(3);

/// Queue depth between the agent and the tunnel proxy
const DATA_QUEUE: usize = 1024;

const MAX_DATAGRAM: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Nominates the pair to use
    Controlling,
    /// Accepts the pair nominated by the remote side
    Controlled,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub role: Role,
    pub local: IceCredentials,
    pub stun_turn_urls: Vec<IceUrl>,
    /// Interface names excluded from host candidate gathering
    pub iface_black_list: HashSet<String>,
    /// Offer loopback addresses as host candidates
    pub allow_loopback: bool,
    /// Silence on the selected pair after which the path is considered lost
    pub path_timeout: Duration,
}

/// Input from the signaling side
#[derive(Debug)]
pub enum AgentCommand {
    RemoteCredentials(IceCredentials),
    RemoteCandidate(Candidate),
}

/// Output of the agent
#[derive(Debug)]
pub enum AgentEvent {
    LocalCandidate(Candidate),
    Selected(SelectedPath),
    PathLost,
}

/// Datagram channels over the selected candidate pair
#[derive(Debug)]
pub struct SelectedPath {
    pub remote: SocketAddr,
    /// Non-check datagrams received from the remote
    pub inbound: mpsc::Receiver<Vec<u8>>,
    /// Datagrams to send to the remote
    pub outbound: mpsc::Sender<Vec<u8>>,
}

struct Pending {
    addr: SocketAddr,
    nominate: bool,
    sent: Instant,
}

pub struct Agent {
    config: AgentConfig,
    socket: Arc<UdpSocket>,
    events: mpsc::UnboundedSender<AgentEvent>,
    remote: Option<IceCredentials>,
    remote_candidates: Vec<Candidate>,
    pending: HashMap<[u8; 12], Pending>,
    succeeded: HashMap<SocketAddr, u32>,
    selected: Option<SocketAddr>,
    last_seen: Instant,
    last_keepalive: Instant,
    inbound_tx: Option<mpsc::Sender<Vec<u8>>>,
    outbound_rx: Option<mpsc::Receiver<Vec<u8>>>,
}

impl Agent {
    /// Bind the agent's UDP socket (IPv4 wildcard, ephemeral port)
    pub fn bind(
        config: AgentConfig,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> std::io::Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::from(([0, 0, 0, 0], 0)).into())?;
        let socket = UdpSocket::from_std(socket.into())?;

        let now = Instant::now();
        Ok(Self {
            config,
            socket: Arc::new(socket),
            events,
            remote: None,
            remote_candidates: Vec::new(),
            pending: HashMap::new(),
            succeeded: HashMap::new(),
            selected: None,
            last_seen: now,
            last_keepalive: now,
            inbound_tx: None,
            outbound_rx: None,
        })
    }

    /// Gather candidates, then run checks until shutdown, path loss or the
    /// command channel closes
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<AgentCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.gather().await;

        let mut ticker = interval(CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let socket = self.socket.clone();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // a dropped handle stops the agent too
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                received = socket.recv_from(&mut buffer) => match received {
                    Ok((len, from)) => self.handle_datagram(&buffer[..len], from).await,
                    Err(e) => debug!("ICE socket receive error: {}", e),
                },
                packet = next_outbound(&mut self.outbound_rx) => {
                    if let (Some(packet), Some(remote)) = (packet, self.selected) {
                        if let Err(e) = self.socket.send_to(&packet, remote).await {
                            debug!("Failed to forward datagram to {}: {}", remote, e);
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !self.tick().await {
                        let _ = self.events.send(AgentEvent::PathLost);
                        break;
                    }
                }
            }
        }
        trace!("ICE agent stopped");
    }

    async fn gather(&mut self) {
        let port = match self.socket.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                warn!("ICE socket has no local address: {}", e);
                return;
            }
        };

        for (index, ip) in self.host_ips().into_iter().enumerate() {
            let preference = u16::MAX.saturating_sub(index as u16);
            self.emit_local(Candidate::host(SocketAddr::new(ip, port), preference));
        }

        let mut reflexive = HashSet::new();
        for url in self.config.stun_turn_urls.clone() {
            if url.scheme != Scheme::Stun {
                debug!("Skipping {}: relay allocation is not supported", url);
                continue;
            }
            let server = match tokio::net::lookup_host(url.authority()).await {
                Ok(mut addrs) => addrs.find(SocketAddr::is_ipv4),
                Err(e) => {
                    warn!("Failed to resolve {}: {}", url, e);
                    continue;
                }
            };
            let Some(server) = server else {
                debug!("{} has no IPv4 address", url);
                continue;
            };

            match StunClient::new(server).query(&self.socket, STUN_TIMEOUT).await {
                Ok(mapped) => {
                    if reflexive.insert(mapped) {
                        let base = SocketAddr::from(([0, 0, 0, 0], port));
                        self.emit_local(Candidate::server_reflexive(mapped, base));
                    }
                }
                Err(e) => warn!("STUN query to {} failed: {}", url, e),
            }
        }
    }

    fn host_ips(&self) -> Vec<IpAddr> {
        let interfaces = match get_if_addrs() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!("Failed to list network interfaces: {}", e);
                return Vec::new();
            }
        };

        let mut ips = Vec::new();
        for iface in interfaces {
            if self.config.iface_black_list.contains(&iface.name) {
                continue;
            }
            let ip = iface.ip();
            // the check socket is IPv4 only
            if !ip.is_ipv4() || ip.is_multicast() || ip.is_unspecified() {
                continue;
            }
            if ip.is_loopback() && !self.config.allow_loopback {
                continue;
            }
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }
        ips
    }

    fn emit_local(&self, candidate: Candidate) {
        debug!("Gathered local candidate {}", candidate);
        let _ = self.events.send(AgentEvent::LocalCandidate(candidate));
    }

    fn handle_command(&mut self, command: AgentCommand) {
        match command {
            AgentCommand::RemoteCredentials(credentials) => {
                if self.remote.as_ref() == Some(&credentials) {
                    return;
                }
                if self.remote.is_some() {
                    debug!("Remote restarted its session, dropping old candidates");
                }
                self.remote = Some(credentials);
                self.remote_candidates.clear();
                self.succeeded.clear();
                self.pending.clear();
            }
            AgentCommand::RemoteCandidate(candidate) => self.add_remote_candidate(candidate),
        }
    }

    fn add_remote_candidate(&mut self, candidate: Candidate) {
        if !candidate.addr.is_ipv4() {
            trace!("Ignoring non IPv4 remote candidate {}", candidate);
            return;
        }
        if self.remote_candidates.iter().any(|c| c.addr == candidate.addr) {
            return;
        }
        debug!("Added remote candidate {}", candidate);
        self.remote_candidates.push(candidate);
        self.remote_candidates
            .sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    async fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        if !is_check(data) {
            if self.selected == Some(from) {
                self.last_seen = Instant::now();
                if let Some(tx) = &self.inbound_tx {
                    if tx.try_send(data.to_vec()).is_err() {
                        trace!("Tunnel queue full, dropping datagram");
                    }
                }
            }
            return;
        }

        let packet = match CheckPacket::from_bytes(data) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("Malformed check from {}: {}", from, e);
                return;
            }
        };

        match packet.kind {
            CheckKind::Request => self.handle_request(packet, from).await,
            CheckKind::Response => self.handle_response(packet, from),
        }
    }

    async fn handle_request(&mut self, packet: CheckPacket, from: SocketAddr) {
        let local = &self.config.local;
        if packet.receiver_ufrag() != local.ufrag || !packet.verify(&local.pwd) {
            trace!("Unauthenticated check from {}", from);
            return;
        }

        let response = match packet.response().to_bytes(&local.pwd) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Failed to answer check from {}: {}", from, e);
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&response, from).await {
            debug!("Failed to answer check from {}: {}", from, e);
        }

        if self.selected == Some(from) {
            self.last_seen = Instant::now();
            return;
        }
        if self.selected.is_some() {
            return;
        }

        if !self.remote_candidates.iter().any(|c| c.addr == from) {
            self.add_remote_candidate(Candidate::peer_reflexive(from));
        }

        if packet.nominate && self.config.role == Role::Controlled {
            self.select(from);
        }
    }

    fn handle_response(&mut self, packet: CheckPacket, from: SocketAddr) {
        let Some(pending) = self.pending.remove(&packet.transaction_id) else {
            return;
        };
        let Some(remote) = &self.remote else {
            return;
        };
        if pending.addr != from || !packet.verify(&remote.pwd) {
            trace!("Rejected check response from {}", from);
            return;
        }

        let priority = self
            .remote_candidates
            .iter()
            .find(|c| c.addr == from)
            .map(|c| c.priority)
            .unwrap_or_else(|| Candidate::peer_reflexive(from).priority);
        self.succeeded.insert(from, priority);

        if self.selected == Some(from) {
            self.last_seen = Instant::now();
        } else if self.selected.is_none()
            && pending.nominate
            && self.config.role == Role::Controlling
        {
            self.select(from);
        }
    }

    fn select(&mut self, remote: SocketAddr) {
        info!("Selected candidate pair {} -> {}", self.local_addr_string(), remote);
        let (inbound_tx, inbound) = mpsc::channel(DATA_QUEUE);
        let (outbound, outbound_rx) = mpsc::channel(DATA_QUEUE);
        self.selected = Some(remote);
        self.last_seen = Instant::now();
        self.inbound_tx = Some(inbound_tx);
        self.outbound_rx = Some(outbound_rx);
        self.pending.clear();
        let _ = self.events.send(AgentEvent::Selected(SelectedPath {
            remote,
            inbound,
            outbound,
        }));
    }

    fn local_addr_string(&self) -> String {
        self.socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string())
    }

    /// One check round; false once the selected path has gone silent
    async fn tick(&mut self) -> bool {
        let now = Instant::now();
        self.pending.retain(|_, p| now.duration_since(p.sent) < PENDING_TTL);

        if let Some(selected) = self.selected {
            if now.duration_since(self.last_seen) > self.config.path_timeout {
                warn!("No traffic from {} for {:?}", selected, self.config.path_timeout);
                return false;
            }
            if self.config.role == Role::Controlling
                && now.duration_since(self.last_keepalive) >= self.keepalive_interval()
            {
                self.last_keepalive = now;
                self.send_check(selected, true).await;
            }
            return true;
        }

        if self.remote.is_none() {
            return true;
        }

        if self.config.role == Role::Controlling {
            let best = self
                .succeeded
                .iter()
                .max_by_key(|(_, priority)| **priority)
                .map(|(addr, _)| *addr);
            if let Some(best) = best {
                self.send_check(best, true).await;
                return true;
            }
        }

        let targets: Vec<SocketAddr> = self
            .remote_candidates
            .iter()
            .filter(|c| c.kind != CandidateType::Relay)
            .map(|c| c.addr)
            .collect();
        for addr in targets {
            self.send_check(addr, false).await;
        }
        true
    }

    /// Consent checks must arrive well within the remote's path timeout
    fn keepalive_interval(&self) -> Duration {
        KEEPALIVE_INTERVAL.min(self.config.path_timeout / 3)
    }

    async fn send_check(&mut self, addr: SocketAddr, nominate: bool) {
        let Some(remote) = &self.remote else {
            return;
        };
        let request = CheckPacket::request(&remote.ufrag, &self.config.local.ufrag, nominate);
        let bytes = match request.to_bytes(&remote.pwd) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot check {}: {}", addr, e);
                return;
            }
        };
        match self.socket.send_to(&bytes, addr).await {
            Ok(_) => {
                self.pending.insert(
                    request.transaction_id,
                    Pending {
                        addr,
                        nominate,
                        sent: Instant::now(),
                    },
                );
            }
            Err(e) => trace!("Failed to send check to {}: {}", addr, e),
        }
    }
}

async fn next_outbound(rx: &mut Option<mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Running {
        commands: mpsc::UnboundedSender<AgentCommand>,
        events: mpsc::UnboundedReceiver<AgentEvent>,
        shutdown: watch::Sender<bool>,
        credentials: IceCredentials,
    }

    fn start(role: Role, path_timeout: Duration) -> Running {
        let credentials = IceCredentials::generate();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let agent = Agent::bind(
            AgentConfig {
                role,
                local: credentials.clone(),
                stun_turn_urls: Vec::new(),
                iface_black_list: HashSet::new(),
                allow_loopback: true,
                path_timeout,
            },
            events_tx,
        )
        .unwrap();
        tokio::spawn(agent.run(commands_rx, shutdown_rx));
        Running {
            commands,
            events,
            shutdown,
            credentials,
        }
    }

    /// Collect local loopback candidates until the agent reports none for a while
    async fn loopback_candidates(events: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(300), events.recv()).await
        {
            if let AgentEvent::LocalCandidate(c) = event {
                if c.addr.ip().is_loopback() {
                    candidates.push(c);
                }
            }
        }
        candidates
    }

    async fn selected(events: &mut mpsc::UnboundedReceiver<AgentEvent>) -> SelectedPath {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("no pair selected in time")
                .expect("agent stopped");
            if let AgentEvent::Selected(path) = event {
                return path;
            }
        }
    }

    #[tokio::test]
    async fn test_agents_select_pair_and_forward_datagrams() {
        let mut a = start(Role::Controlling, Duration::from_secs(30));
        let mut b = start(Role::Controlled, Duration::from_secs(30));

        let a_candidates = loopback_candidates(&mut a.events).await;
        let b_candidates = loopback_candidates(&mut b.events).await;
        assert!(!a_candidates.is_empty());

        a.commands
            .send(AgentCommand::RemoteCredentials(b.credentials.clone()))
            .unwrap();
        b.commands
            .send(AgentCommand::RemoteCredentials(a.credentials.clone()))
            .unwrap();
        for c in a_candidates {
            b.commands.send(AgentCommand::RemoteCandidate(c)).unwrap();
        }
        for c in b_candidates {
            a.commands.send(AgentCommand::RemoteCandidate(c)).unwrap();
        }

        let a_path = selected(&mut a.events).await;
        let mut b_path = selected(&mut b.events).await;

        a_path.outbound.send(b"tunnel datagram".to_vec()).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(2), b_path.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"tunnel datagram");

        let _ = a.shutdown.send(true);
        let _ = b.shutdown.send(true);
    }

    #[tokio::test]
    async fn test_peer_reflexive_learning_with_one_sided_candidates() {
        // only the controlled side knows where to send checks
        let mut a = start(Role::Controlling, Duration::from_secs(30));
        let mut b = start(Role::Controlled, Duration::from_secs(30));

        let _ = loopback_candidates(&mut a.events).await;
        let b_candidates = loopback_candidates(&mut b.events).await;

        a.commands
            .send(AgentCommand::RemoteCredentials(b.credentials.clone()))
            .unwrap();
        b.commands
            .send(AgentCommand::RemoteCredentials(a.credentials.clone()))
            .unwrap();
        for c in b_candidates {
            a.commands.send(AgentCommand::RemoteCandidate(c)).unwrap();
        }

        let a_path = selected(&mut a.events).await;
        let b_path = selected(&mut b.events).await;
        assert!(a_path.remote.ip().is_loopback() || b_path.remote.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_path_lost_after_remote_goes_silent() {
        let mut a = start(Role::Controlling, Duration::from_millis(800));
        let mut b = start(Role::Controlled, Duration::from_millis(800));

        let a_candidates = loopback_candidates(&mut a.events).await;
        let b_candidates = loopback_candidates(&mut b.events).await;
        a.commands
            .send(AgentCommand::RemoteCredentials(b.credentials.clone()))
            .unwrap();
        b.commands
            .send(AgentCommand::RemoteCredentials(a.credentials.clone()))
            .unwrap();
        for c in a_candidates {
            b.commands.send(AgentCommand::RemoteCandidate(c)).unwrap();
        }
        for c in b_candidates {
            a.commands.send(AgentCommand::RemoteCandidate(c)).unwrap();
        }
        let _a_path = selected(&mut a.events).await;
        let _b_path = selected(&mut b.events).await;

        b.shutdown.send(true).unwrap();

        let lost = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match a.events.recv().await {
                    Some(AgentEvent::PathLost) => return true,
                    Some(_) => continue,
                    None => return false,
                }
            }
        })
        .await
        .unwrap();
        assert!(lost);
    }
}
