#![allow(unused_doc_comments)]
/**
 * tests/connection.rs
 *
 * Two connections negotiating directly with each other
 */

use std::collections::HashSet;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use meshtun::connection::{ConnConfig, Connection, SignalSink, Status};
use meshtun::error::SignalError;
use meshtun::ice::{Candidate, IceCredentials};
use meshtun::iface::{Iface, MemoryIface, PEER_KEEPALIVE};
use meshtun::keys::Key;

/// Delivers negotiation messages straight to the other connection
struct Forward {
    peer: OnceLock<Weak<Connection>>,
    candidates: bool,
}

impl Forward {
    fn new(candidates: bool) -> Arc<Self> {
        Arc::new(Self {
            peer: OnceLock::new(),
            candidates,
        })
    }

    fn peer(&self) -> Option<Arc<Connection>> {
        self.peer.get().and_then(Weak::upgrade)
    }
}

#[async_trait]
impl SignalSink for Forward {
    async fn send_offer(&self, credentials: &IceCredentials) -> Result<(), SignalError> {
        if let Some(peer) = self.peer() {
            let _ = peer.on_offer(credentials.clone()).await;
        }
        Ok(())
    }

    async fn send_answer(&self, credentials: &IceCredentials) -> Result<(), SignalError> {
        if let Some(peer) = self.peer() {
            let _ = peer.on_answer(credentials.clone()).await;
        }
        Ok(())
    }

    async fn send_candidate(&self, candidate: &Candidate) -> Result<(), SignalError> {
        if !self.candidates {
            return Ok(());
        }
        if let Some(peer) = self.peer() {
            let _ = peer.on_remote_candidate(candidate.clone());
        }
        Ok(())
    }
}

struct Side {
    conn: Arc<Connection>,
    iface: Arc<MemoryIface>,
    key: Key,
}

async fn pair(path_timeout: Duration) -> (Side, Side) {
    let a_key = Key::generate();
    let b_key = Key::generate();
    // only A's candidates reach B; A has to learn B's address from its checks
    let a_sink = Forward::new(true);
    let b_sink = Forward::new(false);

    let side = |local: &Key, remote: &Key, sink: Arc<Forward>, allowed: &str| {
        let iface = Arc::new(MemoryIface::new(51820));
        let config = ConnConfig {
            wg_listen_addr: "127.0.0.1:9".parse().unwrap(),
            wg_iface: "wt0".to_string(),
            wg_allowed_ips: allowed.to_string(),
            local_key: local.clone(),
            remote_key: remote.public_key(),
            stun_turn_urls: Vec::new(),
            iface_black_list: HashSet::new(),
            allow_loopback: true,
            path_timeout,
        };
        let conn = Arc::new(Connection::new(config, sink, iface.clone()));
        Side {
            conn,
            iface,
            key: local.clone(),
        }
    };

    let a = side(&a_key, &b_key, a_sink.clone(), "100.64.0.2/32");
    let b = side(&b_key, &a_key, b_sink.clone(), "100.64.0.1/32");
    a.iface.create("wt0", "100.64.0.1/24").await.unwrap();
    b.iface.create("wt0", "100.64.0.2/24").await.unwrap();
    let _ = a_sink.peer.set(Arc::downgrade(&b.conn));
    let _ = b_sink.peer.set(Arc::downgrade(&a.conn));
    (a, b)
}

async fn connect(a: &Side, b: &Side) {
    let opening = {
        let conn = a.conn.clone();
        tokio::spawn(async move { conn.open(Duration::from_secs(15)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    b.conn.open(Duration::from_secs(15)).await.unwrap();
    opening.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_offer_answer_round_trip_connects() {
    let (a, b) = pair(Duration::from_secs(30)).await;
    assert_eq!(a.conn.status(), Status::New);

    connect(&a, &b).await;
    assert_eq!(a.conn.status(), Status::Connected);
    assert_eq!(b.conn.status(), Status::Connected);

    let entry = a
        .iface
        .peer("wt0", &b.key.public_key())
        .expect("peer installed on A");
    assert_eq!(entry.allowed_ips, "100.64.0.2/32");
    assert!(entry.endpoint.ip().is_loopback());
    assert_eq!(entry.keepalive, Some(PEER_KEEPALIVE));
    assert!(b.iface.peer("wt0", &a.key.public_key()).is_some());

    // late duplicates do not disturb the established path
    assert!(a.conn.on_offer(IceCredentials::generate()).await.is_err());
    assert!(a.conn.on_answer(IceCredentials::generate()).await.is_err());
    let stray = Candidate::host("10.9.9.9:9999".parse().unwrap(), 1);
    a.conn.on_remote_candidate(stray).unwrap();
    assert_eq!(a.conn.status(), Status::Connected);

    a.conn.close().await.unwrap();
    assert_eq!(a.conn.status(), Status::Closed);
    assert_eq!(a.iface.peer_count("wt0"), 0);
    b.conn.close().await.unwrap();
}

#[tokio::test]
async fn test_silent_remote_fails_connection() {
    let (a, b) = pair(Duration::from_secs(1)).await;
    connect(&a, &b).await;

    b.conn.close().await.unwrap();

    let mut status = a.conn.subscribe();
    let failed = tokio::time::timeout(
        Duration::from_secs(10),
        status.wait_for(|s| *s == Status::Failed),
    )
    .await;
    assert!(failed.is_ok(), "connection still {}", a.conn.status());
    // release the watch read guard so later status updates can proceed
    drop(failed);

    // a failed connection accepts no new offer
    assert!(a.conn.on_offer(IceCredentials::generate()).await.is_err());
    a.conn.close().await.unwrap();
    assert_eq!(a.conn.status(), Status::Closed);
}

#[tokio::test]
async fn test_open_times_out_without_remote() {
    let (a, _b) = pair(Duration::from_secs(30)).await;
    let started = tokio::time::Instant::now();

    let result = a.conn.open(Duration::from_millis(500)).await;
    assert!(result.is_err());
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(a.conn.status(), Status::Failed);
}
