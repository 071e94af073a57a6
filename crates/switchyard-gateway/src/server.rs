use crate::connection::{ConnectionHandle, ConnectionRegistry, OutboundFrame};
use crate::middleware::{auth_middleware, AuthConfig, Principal};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Extension, Query, State, WebSocketUpgrade,
    },
    http::{StatusCode, Uri},
    middleware as axum_mw,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Source of the system status snapshot served on `/status`.
pub trait StatusSource: Send + Sync {
    /// Current snapshot as JSON.
    fn system_status(&self) -> serde_json::Value;
}

/// Shared application state.
pub struct AppState {
    /// The connection registry every socket is attached to.
    pub registry: Arc<ConnectionRegistry>,
    /// Snapshot provider for `/status`, if one is wired.
    pub status: Option<Arc<dyn StatusSource>>,
}

/// The gateway server.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the gateway with WebSocket endpoints and `/health` only.
    pub fn build(registry: Arc<ConnectionRegistry>) -> Router {
        Self::build_with_status(registry, None, AuthConfig::default())
    }

    /// Build the gateway with the authenticated status endpoints.
    pub fn build_with_status(
        registry: Arc<ConnectionRegistry>,
        status: Option<Arc<dyn StatusSource>>,
        auth: AuthConfig,
    ) -> Router {
        if auth.is_enabled() {
            info!(keys = auth.api_keys.len(), "API key auth enabled for status endpoints");
        }
        let state = Arc::new(AppState { registry, status });

        let protected = Router::new()
            .route("/status", get(status_handler))
            .route("/connections", get(connections_handler))
            .route_layer(axum_mw::from_fn_with_state(Arc::new(auth), auth_middleware));

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/ws/{kind}", get(ws_handler))
            .route("/health", get(health_handler))
            .merge(protected)
            .with_state(state)
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "service": "switchyard"}))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.status {
        Some(source) => (StatusCode::OK, Json(source.system_status())).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "Status monitor not running").into_response(),
    }
}

async fn connections_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> impl IntoResponse {
    let connections = state.registry.list().await;
    debug!(?principal, count = connections.len(), "Connections listed");
    Json(connections)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    uri: Uri,
    Query(mut params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let path = uri.path().to_string();
    let name = params.remove("name");
    let metadata = params
        .into_iter()
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect();
    ws.on_upgrade(move |socket| handle_socket(socket, state, path, name, metadata))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    path: String,
    name: Option<String>,
    metadata: HashMap<String, serde_json::Value>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for frames queued by the registry for this socket
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let registry = state.registry.clone();
    let connection_id = registry
        .register(ConnectionHandle {
            path,
            name,
            metadata,
            tx,
        })
        .await;

    // Task: forward queued frames to the WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let msg = match frame {
                OutboundFrame::Text(text) => Message::Text(text.into()),
                OutboundFrame::Ping => Message::Ping(Default::default()),
                OutboundFrame::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Task: receive frames from the WebSocket and dispatch them
    let inbound = registry.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => inbound.handle_inbound(connection_id, text.as_str()).await,
                Message::Close(_) => break,
                _ => inbound.touch(connection_id).await,
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    registry.unregister(connection_id).await;
    debug!(connection_id = %connection_id, "WebSocket closed");
}
