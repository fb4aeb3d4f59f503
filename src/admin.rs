/**
 * admin.rs
 *
 * Local HTTP surface for managing peers at runtime
 *
 *   POST   /peer         add a peer (JSON body)
 *   DELETE /peer         remove a peer (JSON body)
 *   GET    /peer?key=K   connection status of a peer
 */

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::engine::{Engine, Peer};

pub fn router(engine: Engine) -> Router {
    Router::new()
        .route("/peer", post(add_peer).delete(remove_peer).get(peer_status))
        .with_state(engine)
}

pub async fn serve(addr: SocketAddr, engine: Engine) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind admin address {}", addr))?;
    info!("Admin API listening on http://{}", addr);
    axum::serve(listener, router(engine))
        .await
        .context("Admin server failed")
}

pub async fn add_peer(State(engine): State<Engine>, Json(peer): Json<Peer>) -> Response {
    match engine.add_peer(peer).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

pub async fn remove_peer(State(engine): State<Engine>, Json(peer): Json<Peer>) -> Response {
    match engine.remove_peer_connection(&peer.wg_pub_key).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub key: String,
}

pub async fn peer_status(
    State(engine): State<Engine>,
    Query(query): Query<StatusQuery>,
) -> Response {
    match engine.get_status(&query.key).await {
        Some(status) => Json(json!({
            "key": query.key,
            "status": status,
        }))
        .into_response(),
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::iface::MemoryIface;
    use crate::keys::Key;
    use crate::signal::MemoryRelay;
    use std::sync::Arc;

    async fn started_engine() -> Engine {
        let key = Key::generate();
        let relay = MemoryRelay::new();
        let signal = relay.connect(&key.public_key().to_string());
        let engine = Engine::new(
            EngineConfig::default(),
            signal,
            Arc::new(MemoryIface::new(51820)),
        );
        engine.start(key, Vec::new()).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_status_not_found() {
        let engine = started_engine().await;
        let response = peer_status(
            State(engine),
            Query(StatusQuery {
                key: Key::generate().public_key().to_string(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_add_and_remove_peer() {
        let engine = started_engine().await;
        let remote = Key::generate().public_key().to_string();
        let peer = Peer {
            wg_pub_key: remote.clone(),
            wg_allowed_ips: "100.64.0.2/32".to_string(),
        };

        let response = add_peer(State(engine.clone()), Json(peer.clone())).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(engine.get_status(&remote).await.is_some());

        let response = remove_peer(State(engine.clone()), Json(peer)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(engine.get_status(&remote).await, None);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_add_rejects_bad_key() {
        let engine = started_engine().await;
        let peer = Peer {
            wg_pub_key: "not a key".to_string(),
            wg_allowed_ips: "100.64.0.2/32".to_string(),
        };
        let response = add_peer(State(engine), Json(peer)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
