//! Inbound WebSocket acceptor with a pluggable authorizer, an HTTP route
//! table, and heartbeat supervision (§4.6).
//!
//! Grounded in `services/server/src/lib.rs`'s `build_router` assembly and
//! `services/server/src/ws_common.rs`'s per-socket helpers, generalized past
//! a single forwarder protocol to an authorizer-gated, multi-event wire.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::RawQuery;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;

/// Attributes an [`Authorizer`] stashes on an accepted socket. Named after
/// the source's `socket.ctx` free-form bag, given fixed shape here.
#[derive(Debug, Clone, Default)]
pub struct SocketAttrs {
    pub peer_id: Option<String>,
    pub publisher_id: Option<String>,
    pub data: Option<Value>,
}

impl SocketAttrs {
    pub fn carries_identity(&self) -> bool {
        self.peer_id.is_some() || self.publisher_id.is_some()
    }
}

/// `(request, socket) -> bool`. Runs before upgrade; a `false` result
/// destroys the connection without a reply.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, token: Option<&str>) -> Option<SocketAttrs>;
}

/// The sink a `WireServer` drives once a socket is accepted — the systems
/// translation of the source's `client`/`disconnect`/`event` emits, named
/// per SPEC_FULL.md §9's design note alongside `HubObserver`.
pub trait PeerConduit: Send + Sync {
    fn on_client(&self, attrs: &SocketAttrs, remote_key: &str, handle: PeerHandle);
    fn on_event(&self, attrs: &SocketAttrs, remote_key: &str, event_tag: &str, data: &Value);
    fn on_disconnect(&self, attrs: &SocketAttrs, remote_key: &str);
}

/// A cheap, cloneable handle the `Cluster` uses to push frames back down a
/// socket this `WireServer` accepted.
#[derive(Clone)]
pub struct PeerHandle {
    outbound_tx: tokio::sync::mpsc::UnboundedSender<String>,
}

impl PeerHandle {
    pub fn send(&self, event: &str, data: mesh_util::EncodeData) -> bool {
        let frame = mesh_util::encode(event, data, None);
        self.outbound_tx.send(frame).is_ok()
    }

    pub fn close(&self) {
        let _ = self.outbound_tx.send(String::new());
    }
}

pub struct WireServerConfig {
    pub ws_path: String,
    pub heartbeat_interval: Duration,
}

impl Default for WireServerConfig {
    fn default() -> Self {
        Self { ws_path: "/".to_owned(), heartbeat_interval: Duration::from_secs(10) }
    }
}

struct Inner {
    authorizer: Arc<dyn Authorizer>,
    conduit: Arc<dyn PeerConduit>,
    heartbeat_interval: Duration,
}

/// Builds the axum [`Router`] mounting the gated websocket upgrade route
/// plus whatever HTTP handlers the caller adds — mirrors `build_router`'s
/// "assemble once at startup" shape.
pub struct WireServer {
    inner: Arc<Inner>,
    router: Router,
}

fn canonical_remote_key(addr: SocketAddr, port_override: Option<u16>) -> String {
    let ip = addr.ip();
    let port = port_override.unwrap_or(addr.port());
    format!("{ip}:{port}")
}

fn extract_token(headers: &HeaderMap, query: &str) -> Option<String> {
    if let Some(v) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(rest) = v.strip_prefix("Bearer ") {
            return Some(rest.to_owned());
        }
    }
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("token=").map(|t| t.to_owned()))
}

impl WireServer {
    pub fn new(config: WireServerConfig, authorizer: Arc<dyn Authorizer>, conduit: Arc<dyn PeerConduit>) -> Self {
        let inner = Arc::new(Inner { authorizer, conduit, heartbeat_interval: config.heartbeat_interval });
        let router = Router::new()
            .route(&config.ws_path, get(upgrade_handler))
            .with_state(inner.clone());
        Self { inner, router }
    }

    /// Registers an exact-match HTTP route. Handlers follow the teacher's
    /// router-assembly convention: a plain async fn returning `impl
    /// IntoResponse`, merged in with `Router::merge`.
    pub fn add_handler(&mut self, handler_router: Router) {
        self.router = std::mem::take(&mut self.router).merge(handler_router);
    }

    pub fn into_router(self) -> Router {
        self.router.fallback(fallback_404)
    }
}

async fn fallback_404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    axum::extract::State(inner): axum::extract::State<Arc<Inner>>,
) -> Response {
    let query = query.unwrap_or_default();
    let token = extract_token(&headers, &query);
    let Some(attrs) = inner.authorizer.authorize(token.as_deref()) else {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, remote, attrs, inner))
}

async fn handle_socket(mut socket: WebSocket, remote: SocketAddr, attrs: SocketAttrs, inner: Arc<Inner>) {
    let port_override = attrs
        .data
        .as_ref()
        .and_then(|d| d.get("port"))
        .and_then(|p| p.as_u64())
        .map(|p| p as u16);
    let remote_key = canonical_remote_key(remote, port_override);

    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    if attrs.carries_identity() {
        inner.conduit.on_client(&attrs, &remote_key, PeerHandle { outbound_tx: outbound_tx.clone() });
    }

    let alive = Arc::new(AtomicBool::new(true));
    let heartbeat_alive = alive.clone();
    let heartbeat_active = attrs.carries_identity();
    let mut ticker = tokio::time::interval(inner.heartbeat_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick(), if heartbeat_active => {
                if !heartbeat_alive.swap(false, Ordering::Relaxed) {
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            frame = outbound_rx.recv() => {
                match frame {
                    Some(f) if f.is_empty() => break,
                    Some(f) => {
                        if socket.send(Message::Text(f.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        alive.store(true, Ordering::Relaxed);
                        if let Ok(decoded) = mesh_util::decode(&text) {
                            let data = match decoded.data {
                                mesh_util::FrameData::Json(v) => v,
                                mesh_util::FrameData::Raw(s) => Value::String(s),
                                mesh_util::FrameData::Empty => Value::Null,
                            };
                            inner.conduit.on_event(&attrs, &remote_key, &decoded.event, &data);
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        alive.store(true, Ordering::Relaxed);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        alive.store(true, Ordering::Relaxed);
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    if attrs.carries_identity() {
        inner.conduit.on_disconnect(&attrs, &remote_key);
    }
}
