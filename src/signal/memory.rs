/**
 * signal/memory.rs
 *
 * In-process signal relay for tests and local experiments
 */

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::{Message, MessageHandler, Signal};
use crate::error::SignalError;

type Filter = Box<dyn FnMut(&Message) -> bool + Send>;

#[derive(Default)]
struct RelayState {
    endpoints: HashMap<String, mpsc::UnboundedSender<Message>>,
    sent: Vec<Message>,
    filter: Option<Filter>,
}

/// Routes messages between in-process endpoints by recipient key
///
/// Every sent message is logged, including the ones a filter drops.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an endpoint for `key`, replacing any previous one
    pub fn connect(&self, key: &str) -> Arc<MemorySignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().endpoints.insert(key.to_string(), tx);
        Arc::new(MemorySignal {
            relay: self.clone(),
            inbound: Mutex::new(Some(rx)),
        })
    }

    /// Only messages for which `filter` returns true are delivered
    pub fn set_filter(&self, filter: impl FnMut(&Message) -> bool + Send + 'static) {
        self.lock().filter = Some(Box::new(filter));
    }

    /// Every message sent through the relay so far
    pub fn sent(&self) -> Vec<Message> {
        self.lock().sent.clone()
    }

    /// Deliver a message as if it had been sent by `message.sender_key`
    pub fn inject(&self, message: Message) -> Result<(), SignalError> {
        self.route(message)
    }

    fn route(&self, message: Message) -> Result<(), SignalError> {
        let mut state = self.lock();
        state.sent.push(message.clone());

        if let Some(filter) = state.filter.as_mut() {
            if !filter(&message) {
                trace!("Relay dropped {} for {}", message.kind(), message.recipient_key);
                return Ok(());
            }
        }

        let endpoint = state
            .endpoints
            .get(&message.recipient_key)
            .ok_or_else(|| SignalError::NoRoute(message.recipient_key.clone()))?;
        endpoint.send(message).map_err(|_| SignalError::Closed)
    }
}

pub struct MemorySignal {
    relay: MemoryRelay,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
}

#[async_trait]
impl Signal for MemorySignal {
    async fn send(&self, message: Message) -> Result<(), SignalError> {
        self.relay.route(message)
    }

    fn receive(&self, handler: Arc<dyn MessageHandler>) {
        let inbound = self
            .inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut inbound) = inbound else {
            warn!("Memory signal is already being consumed");
            return;
        };

        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let kind = message.kind();
                if let Err(e) = handler.handle(message).await {
                    warn!("Dropped {} message: {}", kind, e);
                }
            }
        });
    }

    async fn wait_connected(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RouteError;
    use crate::signal::{Body, BodyType};

    struct Collect(mpsc::UnboundedSender<Message>);

    #[async_trait]
    impl MessageHandler for Collect {
        async fn handle(&self, message: Message) -> Result<(), RouteError> {
            let _ = self.0.send(message);
            Ok(())
        }
    }

    fn message(from: &str, to: &str, kind: BodyType) -> Message {
        Message {
            sender_key: from.to_string(),
            recipient_key: to.to_string(),
            body: Body {
                kind,
                payload: vec![1, 2, 3],
            },
        }
    }

    #[tokio::test]
    async fn test_routes_in_order_and_filters() {
        let relay = MemoryRelay::new();
        let a = relay.connect("a");
        let b = relay.connect("b");
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.receive(Arc::new(Collect(tx)));

        relay.set_filter(|m| m.kind() != BodyType::Answer);
        a.send(message("a", "b", BodyType::Offer)).await.unwrap();
        a.send(message("a", "b", BodyType::Answer)).await.unwrap();
        a.send(message("a", "b", BodyType::Candidate)).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().kind(), BodyType::Offer);
        assert_eq!(rx.recv().await.unwrap().kind(), BodyType::Candidate);
        assert_eq!(relay.sent().len(), 3);

        assert!(matches!(
            a.send(message("a", "nobody", BodyType::Offer)).await,
            Err(SignalError::NoRoute(_))
        ));
    }
}
