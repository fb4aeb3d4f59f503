/**
 * signal/client.rs
 *
 * WebSocket signal client (ws:// or wss://, self-signed certs allowed on request)
 *
 * Frames are JSON objects tagged by `type`. The client registers its public
 * key, relays messages and reconnects with backoff when the socket drops.
 */

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use native_tls::TlsConnector;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{Message, MessageHandler, Signal};
use crate::backoff::ExponentialBackoff;
use crate::error::SignalError;
use crate::keys::PublicKey;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Signal server frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Register { key: String },
    RegisterAck { success: bool, message: String },
    Relay { message: Message },
    Keepalive,
    Error { message: String },
}

impl Frame {
    fn to_ws(&self) -> Result<WsMessage, SignalError> {
        Ok(WsMessage::Text(serde_json::to_string(self)?))
    }
}

/// Reconnecting WebSocket signal client
pub struct WsSignal {
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    connected: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
}

struct Session {
    url: String,
    key: String,
    insecure_tls: bool,
    outbound: mpsc::UnboundedReceiver<Frame>,
    inbound: mpsc::UnboundedSender<Message>,
    connected: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
}

impl WsSignal {
    /// Spawn the connection task; use [`Signal::wait_connected`] to wait for
    /// the first registration
    pub fn connect(url: &str, key: PublicKey, insecure_tls: bool) -> Arc<Self> {
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected) = watch::channel(false);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let session = Session {
            url: url.to_string(),
            key: key.to_string(),
            insecure_tls,
            outbound,
            inbound,
            connected: connected_tx,
            shutdown: shutdown_rx,
        };
        tokio::spawn(session.run());

        Arc::new(Self {
            outbound: outbound_tx,
            inbound: Mutex::new(Some(inbound_rx)),
            connected,
            shutdown,
        })
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for WsSignal {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[async_trait]
impl Signal for WsSignal {
    async fn send(&self, message: Message) -> Result<(), SignalError> {
        if !self.is_connected() {
            return Err(SignalError::NotConnected);
        }
        self.outbound
            .send(Frame::Relay { message })
            .map_err(|_| SignalError::Closed)
    }

    fn receive(&self, handler: Arc<dyn MessageHandler>) {
        let inbound = self
            .inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut inbound) = inbound else {
            warn!("Signal stream is already being consumed");
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

    async fn wait_connected(&self) {
        let mut connected = self.connected.clone();
        let _ = connected.wait_for(|up| *up).await;
    }
}

impl Session {
    async fn run(mut self) {
        let mut backoff = ExponentialBackoff::peer_default();

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.connect().await {
                Ok(ws) => {
                    info!("Connected to signal server {}", self.url);
                    backoff.reset();
                    let _ = self.connected.send(true);
                    if let Err(e) = self.pump(ws).await {
                        warn!("Signal connection lost: {}", e);
                    }
                    let _ = self.connected.send(false);
                }
                Err(e) => warn!("Failed to connect to signal server {}: {}", self.url, e),
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or(backoff.max_interval);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => {}
            }
        }
        debug!("Signal client stopped");
    }

    async fn connect(&self) -> Result<WsStream, SignalError> {
        let request = self.url.as_str().into_client_request()?;

        let mut tls = TlsConnector::builder();
        if self.insecure_tls {
            tls.danger_accept_invalid_certs(true);
        }
        let connector = Connector::NativeTls(tls.build()?);

        let (mut ws, _response) =
            connect_async_tls_with_config(request, None, false, Some(connector)).await?;

        ws.send(Frame::Register { key: self.key.clone() }.to_ws()?)
            .await?;

        let ack = tokio::time::timeout(REGISTER_TIMEOUT, next_frame(&mut ws))
            .await
            .map_err(|_| SignalError::Timeout)??;
        match ack {
            Frame::RegisterAck { success: true, .. } => Ok(ws),
            Frame::RegisterAck { message, .. } | Frame::Error { message } => {
                Err(SignalError::Registration(message))
            }
            other => Err(SignalError::Registration(format!(
                "unexpected frame {:?}",
                other
            ))),
        }
    }

    /// Shuttle frames until the socket fails or the client shuts down
    async fn pump(&mut self, ws: WsStream) -> Result<(), SignalError> {
        let (mut sink, mut stream) = ws.split();
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    let _ = sink.close().await;
                    return Ok(());
                }
                frame = self.outbound.recv() => {
                    let Some(frame) = frame else {
                        return Ok(());
                    };
                    sink.send(frame.to_ws()?).await?;
                }
                _ = keepalive.tick() => {
                    sink.send(Frame::Keepalive.to_ws()?).await?;
                }
                received = stream.next() => {
                    let Some(received) = received else {
                        return Err(SignalError::Closed);
                    };
                    match received? {
                        WsMessage::Text(text) => self.dispatch(&text),
                        WsMessage::Close(_) => return Err(SignalError::Closed),
                        _ => {}
                    }
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<Frame>(text) {
            Ok(Frame::Relay { message }) => {
                let _ = self.inbound.send(message);
            }
            Ok(Frame::Keepalive) => {}
            Ok(Frame::Error { message }) => warn!("Signal server error: {}", message),
            Ok(other) => debug!("Ignoring signal frame {:?}", other),
            Err(e) => warn!("Invalid signal frame: {}", e),
        }
    }
}

async fn next_frame(ws: &mut WsStream) -> Result<Frame, SignalError> {
    while let Some(received) = ws.next().await {
        match received? {
            WsMessage::Text(text) => return Ok(serde_json::from_str(&text)?),
            WsMessage::Close(_) => break,
            _ => continue,
        }
    }
    Err(SignalError::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{Body, BodyType};

    #[test]
    fn test_frame_layout() {
        let frame = Frame::Relay {
            message: Message {
                sender_key: "a".to_string(),
                recipient_key: "b".to_string(),
                body: Body {
                    kind: BodyType::Offer,
                    payload: b"sealed".to_vec(),
                },
            },
        };
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "relay");
        assert_eq!(json["message"]["body"]["type"], "OFFER");

        let ack: Frame =
            serde_json::from_str(r#"{"type":"register_ack","success":true,"message":"ok"}"#)
                .unwrap();
        assert!(matches!(ack, Frame::RegisterAck { success: true, .. }));
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let key = crate::keys::Key::generate().public_key();
        // nothing listens on the discard port
        let client = WsSignal::connect("ws://127.0.0.1:9", key, false);
        assert!(!client.is_connected());
        let message = Message {
            sender_key: key.to_string(),
            recipient_key: key.to_string(),
            body: Body {
                kind: BodyType::Offer,
                payload: Vec::new(),
            },
        };
        assert!(matches!(
            client.send(message).await,
            Err(SignalError::NotConnected)
        ));
        client.close();
    }
}
