//! API server setup and the realtime events endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::api::jwt::JwtService;
use crate::error::Result;
use crate::lifecycle::LifecycleService;
use crate::worker::WorkerHandle;

/// Heartbeat ping interval for WebSocket connections.
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Server bind address
    pub bind_address: String,
    /// Server port
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 14569,
            enable_cors: true,
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// JWT service built from the bus-distributed secret.
    pub jwt_service: Arc<JwtService>,
    /// One handle per worker; connections are spread round-robin.
    pub workers: Vec<WorkerHandle>,
    /// Per-worker lifecycle services the REST route glue calls into.
    pub lifecycle: Vec<LifecycleService>,
    next_worker: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(
        jwt_service: Arc<JwtService>,
        workers: Vec<WorkerHandle>,
        lifecycle: Vec<LifecycleService>,
    ) -> Self {
        Self {
            jwt_service,
            workers,
            lifecycle,
            next_worker: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Pick the worker the next connection is handled by.
    fn assign_worker(&self) -> &WorkerHandle {
        let i = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[i]
    }
}

/// Query parameters for WebSocket connection (JWT token).
#[derive(Debug, Deserialize)]
pub struct WsAuthParams {
    /// JWT token for authentication
    pub token: String,
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/events/ws", get(events_ws))
        .with_state(state)
}

/// WebSocket handler streaming lifecycle events to a realtime client.
///
/// Authenticates via JWT token in query parameter, then upgrades and
/// attaches the client to one worker's local hub. Fan-out guarantees the
/// client observes broadcasts submitted on any worker.
async fn events_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(auth): Query<WsAuthParams>,
) -> impl IntoResponse {
    if !state.jwt_service.verify(&auth.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let events = state.assign_worker().subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, events))
        .into_response()
}

/// Handle an established WebSocket connection.
async fn handle_socket(
    socket: WebSocket,
    mut events: broadcast::Receiver<crate::bus::BroadcastMessage>,
) {
    let (mut sender, mut receiver) = socket.split();

    let mut heartbeat_interval =
        tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if let Err(e) = sender.send(Message::Text(text.into())).await {
                            debug!("Failed to send event, client may be slow: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Realtime client lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = heartbeat_interval.tick() => {
                if awaiting_pong {
                    debug!("Client failed to respond to Ping, closing connection");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_ok() {
                    awaiting_pong = true;
                } else {
                    break;
                }
            }
        }
    }
}

/// API server.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    /// Create with state and a shutdown token.
    pub fn new(config: ApiServerConfig, state: AppState, cancel_token: CancellationToken) -> Self {
        Self {
            config,
            state,
            cancel_token,
        }
    }

    fn build_router(&self) -> Router {
        let mut router = create_router(self.state.clone());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }

        router.layer(TraceLayer::new_for_http())
    }

    /// Start the server.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| crate::Error::config(format!("Invalid address: {}", e)))?;

        let router = self.build_router();
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("API server listening on http://{}", addr);

        let cancel_token = self.cancel_token.clone();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("API server shutting down...");
            })
            .await
            .map_err(|e| crate::Error::Other(format!("Server error: {}", e)))?;

        Ok(())
    }
}
