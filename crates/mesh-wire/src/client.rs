//! Outbound persistent WebSocket session (§4.5).
//!
//! Grounded in `services/forwarder/src/uplink.rs`'s `UplinkSession` —
//! `connect_async` + `IntoClientRequest`, a read loop that answers pings
//! inline, and a `send_*`/`recv_*` pair of private helpers. Generalized here
//! with reconnect, send buffering, and the first-frame verify gate the
//! teacher's single-purpose uplink didn't need.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::WireError;

/// How a `WireClient` obtains its auth token: a fixed string, or a closure
/// re-resolved on every dial (the source's "string vs callable" factory).
#[derive(Clone)]
pub enum TokenSource {
    Static(String),
    Lazy(Arc<dyn Fn() -> String + Send + Sync>),
}

impl TokenSource {
    fn resolve(&self) -> String {
        match self {
            TokenSource::Static(s) => s.clone(),
            TokenSource::Lazy(f) => f(),
        }
    }
}

#[derive(Clone)]
pub struct WireClientConfig {
    pub url: String,
    pub token: TokenSource,
    /// `None` disables reconnect entirely (Cluster relies on its own
    /// discovery ticker to re-dial instead — see DESIGN.md).
    pub reconnect_delay: Option<Duration>,
    pub max_reconnects: Option<u32>,
    /// When true, `send` while disconnected enqueues for the next `open`;
    /// when false, `send` drops and returns `false`.
    pub buffer: bool,
}

/// Sink the cluster provides to receive frames and disconnect notice from a
/// `WireClient`. The systems-language translation of the source's `event`
/// and `disconnect` emits (SPEC_FULL.md §9).
pub trait WireClientObserver: Send + Sync {
    fn on_event(&self, event_tag: &str, seq: Option<i64>, data: &Value);
    fn on_disconnect(&self);
}

enum OutboundCommand {
    Send(String),
    Destroy,
}

/// A live or reconnecting outbound session. Cloning is cheap; clones share
/// the same background task and socket.
#[derive(Clone)]
pub struct WireClient {
    outbound_tx: mpsc::UnboundedSender<OutboundCommand>,
    connected: Arc<AtomicBool>,
    destroyed: Arc<AtomicBool>,
    buffer: bool,
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

fn build_request(
    url: &str,
    token: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, WireError> {
    let mut request = if token.is_empty() {
        url.into_client_request()
    } else {
        let sep = if url.contains('?') { '&' } else { '?' };
        format!("{url}{sep}token={token}").into_client_request()
    }
    .map_err(|e| WireError::Connect(format!("invalid url {url:?}: {e}")))?;
    request.headers_mut().insert(
        "User-Agent",
        "meshbus-node".parse().expect("static header value is valid"),
    );
    Ok(request)
}

async fn dial(url: &str, token: &str) -> Result<WsStream, WireError> {
    let request = build_request(url, token)?;
    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| WireError::Connect(e.to_string()))?;
    Ok(stream)
}

impl WireClient {
    /// `Connect(verifyFn?)`. When `verify` is given, the first incoming
    /// frame (within `verify_timeout`) is decoded and handed to the
    /// closure; the connect future only resolves once it returns `true`.
    /// Without a verifier, the future resolves as soon as the socket opens.
    pub async fn connect(
        config: WireClientConfig,
        observer: Arc<dyn WireClientObserver>,
        verify: Option<(Duration, Box<dyn FnOnce(&str, &Value) -> bool + Send>)>,
    ) -> Result<Self, WireError> {
        let token = config.token.resolve();
        let mut stream = dial(&config.url, &token).await?;

        if let Some((timeout, verify_fn)) = verify {
            let first = tokio::time::timeout(timeout, stream.next())
                .await
                .map_err(|_| WireError::HandshakeTimeout)?;
            let frame = match first {
                Some(Ok(Message::Text(t))) => t.to_string(),
                Some(Ok(_)) | None => return Err(WireError::Ws("no frame before verify timeout".into())),
                Some(Err(e)) => return Err(WireError::Ws(e.to_string())),
            };
            let decoded = mesh_util::decode(&frame).map_err(|e| WireError::Ws(e.to_string()))?;
            let data = match &decoded.data {
                mesh_util::FrameData::Json(v) => v.clone(),
                mesh_util::FrameData::Raw(s) => Value::String(s.clone()),
                mesh_util::FrameData::Empty => Value::Null,
            };
            if !verify_fn(&decoded.event, &data) {
                let _ = stream.close(None).await;
                return Err(WireError::VerifyRejected);
            }
            observer.on_event(&decoded.event, decoded.seq, &data);
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let destroyed = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());
        let buffer = config.buffer;

        tokio::spawn(run_session(
            config,
            stream,
            observer,
            outbound_rx,
            connected.clone(),
            destroyed.clone(),
            shutdown,
        ));

        Ok(Self { outbound_tx, connected, destroyed, buffer })
    }

    /// `Send(event, data)`. Returns `false` without side effect when not
    /// connected and buffering is disabled.
    pub fn send(&self, event: &str, data: mesh_util::EncodeData) -> bool {
        if self.destroyed.load(Ordering::Relaxed) {
            return false;
        }
        if !self.connected.load(Ordering::Relaxed) && !self.buffer {
            return false;
        }
        let frame = mesh_util::encode(event, data, None);
        self.outbound_tx.send(OutboundCommand::Send(frame)).is_ok()
    }

    /// Idempotent: stops reconnects, closes the socket, drops listeners.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::Relaxed) {
            return;
        }
        let _ = self.outbound_tx.send(OutboundCommand::Destroy);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

async fn run_session(
    config: WireClientConfig,
    mut stream: WsStream,
    observer: Arc<dyn WireClientObserver>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundCommand>,
    connected: Arc<AtomicBool>,
    destroyed: Arc<AtomicBool>,
    _shutdown: Arc<Notify>,
) {
    let mut pending: Vec<String> = Vec::new();
    let mut attempts: u32 = 0;

    'reconnect: loop {
        for frame in pending.drain(..) {
            if stream.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }

        loop {
            tokio::select! {
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(decoded) = mesh_util::decode(&text) {
                                let data = match decoded.data {
                                    mesh_util::FrameData::Json(v) => v,
                                    mesh_util::FrameData::Raw(s) => Value::String(s),
                                    mesh_util::FrameData::Empty => Value::Null,
                                };
                                observer.on_event(&decoded.event, decoded.seq, &data);
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = stream.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => break,
                    }
                }
                cmd = outbound_rx.recv() => {
                    match cmd {
                        Some(OutboundCommand::Send(frame)) => {
                            if connected.load(Ordering::Relaxed) {
                                if stream.send(Message::Text(frame.into())).await.is_err() {
                                    break;
                                }
                            } else if config.buffer {
                                pending.push(frame);
                            }
                        }
                        Some(OutboundCommand::Destroy) | None => {
                            let _ = stream.close(None).await;
                            return;
                        }
                    }
                }
            }
        }

        connected.store(false, Ordering::Relaxed);
        observer.on_disconnect();

        if destroyed.load(Ordering::Relaxed) {
            return;
        }
        let Some(delay) = config.reconnect_delay else {
            return;
        };
        if let Some(max) = config.max_reconnects {
            if attempts >= max {
                return;
            }
        }
        attempts += 1;
        tokio::time::sleep(delay).await;

        let token = config.token.resolve();
        match dial(&config.url, &token).await {
            Ok(new_stream) => {
                stream = new_stream;
                connected.store(true, Ordering::Relaxed);
                continue 'reconnect;
            }
            Err(_) => {
                tracing::trace!(url = %config.url, "reconnect attempt failed, will retry");
                continue 'reconnect;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_source_static_resolves_fixed_string() {
        let source = TokenSource::Static("abc".to_owned());
        assert_eq!(source.resolve(), "abc");
    }

    #[test]
    fn token_source_lazy_reresolves_each_call() {
        let counter = Arc::new(AtomicBool::new(false));
        let flipped = counter.clone();
        let source = TokenSource::Lazy(Arc::new(move || {
            let first = !flipped.swap(true, Ordering::Relaxed);
            if first { "first".to_owned() } else { "second".to_owned() }
        }));
        assert_eq!(source.resolve(), "first");
        assert_eq!(source.resolve(), "second");
    }

    #[test]
    fn build_request_appends_token_query_param() {
        let req = build_request("ws://example.test/fabric", "tok123").unwrap();
        let uri = req.uri().to_string();
        assert!(uri.contains("token=tok123"), "uri was {uri}");
    }

    #[test]
    fn build_request_without_token_leaves_url_untouched() {
        let req = build_request("ws://example.test/fabric", "").unwrap();
        assert_eq!(req.uri().to_string(), "ws://example.test/fabric");
    }

    #[test]
    fn build_request_with_existing_query_uses_ampersand() {
        let req = build_request("ws://example.test/fabric?a=1", "tok").unwrap();
        let uri = req.uri().to_string();
        assert!(uri.contains("a=1&token=tok"), "uri was {uri}");
    }
}
