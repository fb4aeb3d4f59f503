/**
 * connection/sink.rs
 *
 * Outbound signaling capability handed to a connection
 */

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::SignalError;
use crate::ice::{Candidate, IceCredentials};
use crate::keys::{Key, PublicKey};
use crate::signal::{self, BodyType, Signal};

/// Where a connection sends its negotiation messages
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send_offer(&self, credentials: &IceCredentials) -> Result<(), SignalError>;
    async fn send_answer(&self, credentials: &IceCredentials) -> Result<(), SignalError>;
    async fn send_candidate(&self, candidate: &Candidate) -> Result<(), SignalError>;
}

/// Seals messages for one remote peer and sends them over a signal transport
pub struct SealedSink {
    signal: Arc<dyn Signal>,
    local: Key,
    remote: PublicKey,
}

impl SealedSink {
    pub fn new(signal: Arc<dyn Signal>, local: Key, remote: PublicKey) -> Self {
        Self {
            signal,
            local,
            remote,
        }
    }
}

#[async_trait]
impl SignalSink for SealedSink {
    async fn send_offer(&self, credentials: &IceCredentials) -> Result<(), SignalError> {
        let message =
            signal::marshal_credential(BodyType::Offer, credentials, &self.local, &self.remote)?;
        self.signal.send(message).await
    }

    async fn send_answer(&self, credentials: &IceCredentials) -> Result<(), SignalError> {
        let message =
            signal::marshal_credential(BodyType::Answer, credentials, &self.local, &self.remote)?;
        self.signal.send(message).await
    }

    async fn send_candidate(&self, candidate: &Candidate) -> Result<(), SignalError> {
        let message = signal::marshal_candidate(candidate, &self.local, &self.remote)?;
        self.signal.send(message).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Offer(IceCredentials),
    Answer(IceCredentials),
    Candidate(Candidate),
}

/// Sink that only records what it was asked to send
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, sent: Sent) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(sent);
    }
}

#[async_trait]
impl SignalSink for RecordingSink {
    async fn send_offer(&self, credentials: &IceCredentials) -> Result<(), SignalError> {
        self.record(Sent::Offer(credentials.clone()));
        Ok(())
    }

    async fn send_answer(&self, credentials: &IceCredentials) -> Result<(), SignalError> {
        self.record(Sent::Answer(credentials.clone()));
        Ok(())
    }

    async fn send_candidate(&self, candidate: &Candidate) -> Result<(), SignalError> {
        self.record(Sent::Candidate(candidate.clone()));
        Ok(())
    }
}
