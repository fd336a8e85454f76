//! The cluster fabric itself: peer maps, gossip dispatch, readiness gate,
//! and publication routing (§4.7).
//!
//! The struct is new (no direct teacher counterpart at this granularity),
//! but its shape is grounded throughout: the single-lock state bag follows
//! `server/src/state.rs`'s `AppState` wrapping pattern, the gossip dispatch
//! switch follows `server/src/ws_forwarder.rs`'s per-message-type match, and
//! peer dial/establish follows `forwarder/src/uplink.rs`'s
//! connect-then-verify sequencing.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use axum::Router;
use mesh_hub::{ChannelHub, HubEvent};
use mesh_protocol::tag;
use mesh_wire::{
    Authorizer, PeerConduit, PeerHandle, SocketAttrs, TokenSource, WireClient, WireClientConfig,
    WireClientObserver, WireServer, WireServerConfig,
};
use rand::RngCore;
use rand::rngs::OsRng;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::authorizer::{ClusterAuthorizer, stashed_port};
use crate::config::ClusterConfig;
use crate::discovery::{self, PeerAddress};

const NODE_INFO_TIMEOUT: Duration = Duration::from_secs(3);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// `<namespace>-1-<randHex4><unixMillisLast4>`.
fn generate_node_id(namespace: &str) -> String {
    let mut bytes = [0u8; 2];
    OsRng.try_fill_bytes(&mut bytes).expect("OS RNG must be available at boot");
    let rand_hex = format!("{:02x}{:02x}", bytes[0], bytes[1]);
    let millis_tail = (now_millis().unsigned_abs() % 10_000) as u32;
    format!("{namespace}-1-{rand_hex}{millis_tail:04}")
}

enum PeerSink {
    Inbound(PeerHandle),
    Outbound(WireClient),
}

impl PeerSink {
    fn send(&self, event: &str, data: Value) -> bool {
        match self {
            PeerSink::Inbound(h) => h.send(event, mesh_util::EncodeData::Json(data)),
            PeerSink::Outbound(c) => c.send(event, mesh_util::EncodeData::Json(data)),
        }
    }

    fn destroy(&self) {
        match self {
            PeerSink::Inbound(h) => h.close(),
            PeerSink::Outbound(c) => c.destroy(),
        }
    }
}

struct NodeRecord {
    sink: PeerSink,
}

struct PendingGossip {
    sid: String,
    event_tag: String,
    data: Value,
}

struct ClusterState {
    hub: ChannelHub,
    nodes: HashMap<String, NodeRecord>,
    node_ips: HashMap<String, String>,
    pending: HashSet<String>,
    ready: bool,
    pending_events: Vec<PendingGossip>,
}

pub struct Cluster {
    pub self_id: String,
    config: ClusterConfig,
    state: Mutex<ClusterState>,
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Arc<Self> {
        let self_id = generate_node_id(&config.namespace);
        Arc::new(Self {
            self_id,
            config,
            state: Mutex::new(ClusterState {
                hub: ChannelHub::new(),
                nodes: HashMap::new(),
                node_ips: HashMap::new(),
                pending: HashSet::new(),
                ready: false,
                pending_events: Vec::new(),
            }),
        })
    }

    /// Builds the HTTP router (ws upgrade + health routes), binds the
    /// listener, runs discovery's first pass, arms the readiness timeout,
    /// and returns the router plus bound address for `main.rs` to serve.
    pub async fn start(self: Arc<Self>) -> Router {
        let conduit: Arc<dyn PeerConduit> = Arc::new(ClusterConduit(self.clone()));
        let authorizer: Arc<dyn Authorizer> = Arc::new(ClusterAuthorizer::new(self.config.auth.clone()));
        let mut server = WireServer::new(
            WireServerConfig { ws_path: self.config.path.clone(), heartbeat_interval: HEARTBEAT_INTERVAL },
            authorizer,
            conduit,
        );
        server.add_handler(crate::health::router(self.clone(), &self.config.path));
        let router = server.into_router();

        self.clone().run_discovery_pass().await;
        self.clone().arm_ready_timeout();
        self.start_discovery_ticker();

        router
    }

    async fn run_discovery_pass(self: Arc<Self>) {
        let addrs = discovery::discover(&self.config, &self.self_id).await;
        for addr in addrs {
            self.clone().add_node(addr).await;
        }
        if self.config.discovery.service.is_none()
            && self.config.discovery.nodes.is_empty()
            && self.config.discovery.fetch.is_none()
        {
            let mut state = self.state.lock().await;
            if !state.ready {
                state.ready = true;
                tracing::info!("no discovery sources configured, declaring readiness immediately");
            }
        }
    }

    fn arm_ready_timeout(self: Arc<Self>) {
        if self.config.max_ready_after.is_zero() {
            return;
        }
        let cluster = self;
        let delay = cluster.config.max_ready_after;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let became_ready = {
                let mut state = cluster.state.lock().await;
                if state.ready {
                    false
                } else {
                    state.ready = true;
                    true
                }
            };
            if became_ready {
                tracing::info!("readiness forced after max_ready_after timeout");
                cluster.flush_pending_events().await;
            }
        });
    }

    fn start_discovery_ticker(self: Arc<Self>) {
        let cluster = self;
        let interval = cluster.config.discovery.timer;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let addrs = discovery::discover(&cluster.config, &cluster.self_id).await;
                for addr in addrs {
                    cluster.clone().add_node(addr).await;
                }
            }
        });
    }

    /// `AddNode(address)` — outbound peer establishment (§4.7.2).
    pub async fn add_node(self: Arc<Self>, addr: PeerAddress) {
        let key = addr.to_string();
        {
            let mut state = self.state.lock().await;
            if state.node_ips.contains_key(&key) || state.pending.contains(&key) {
                return;
            }
            state.pending.insert(key.clone());
        }

        let secret = self.config.auth.clone();
        let self_id_for_token = self.self_id.clone();
        let self_port = self.config.port;
        let token = TokenSource::Lazy(Arc::new(move || {
            mesh_token::create(
                json!({"port": self_port}),
                mesh_token::CreateOptions {
                    type_tag: mesh_token::type_tag::CLUSTER_PEER,
                    secret: secret.as_deref(),
                    issuer: Some(&self_id_for_token),
                    expire_at_ms: None,
                    ttl_ms: None,
                },
            )
            .unwrap_or_default()
        }));

        let url = format!("ws://{key}{}", self.config.path);
        let first_frame: Arc<StdMutex<Option<Value>>> = Arc::new(StdMutex::new(None));
        let observer = Arc::new(OutboundObserver {
            cluster: self.clone(),
            first_frame: first_frame.clone(),
            node_id: StdMutex::new(None),
        });

        let client_config =
            WireClientConfig { url, token, reconnect_delay: None, max_reconnects: None, buffer: false };
        let verify: (Duration, Box<dyn FnOnce(&str, &Value) -> bool + Send>) =
            (NODE_INFO_TIMEOUT, Box::new(|event_tag: &str, _data: &Value| event_tag == tag::NODE_INFO));

        let connected = WireClient::connect(client_config, observer.clone(), Some(verify)).await;
        let wire_client = match connected {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(addr = %key, error = %e, "add_node: dial failed");
                let mut state = self.state.lock().await;
                state.pending.remove(&key);
                return;
            }
        };

        let first = first_frame.lock().expect("mutex not poisoned").take();
        let Some(data) = first else {
            wire_client.destroy();
            let mut state = self.state.lock().await;
            state.pending.remove(&key);
            return;
        };

        let remote_id = data.get("_i").and_then(|v| v.as_str()).map(str::to_owned);
        let channels: Vec<String> = data
            .get("c")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|c| c.as_str().map(str::to_owned)).collect())
            .unwrap_or_default();

        let Some(remote_id) = remote_id else {
            wire_client.destroy();
            let mut state = self.state.lock().await;
            state.pending.remove(&key);
            return;
        };

        if remote_id == self.self_id {
            wire_client.destroy();
            let mut state = self.state.lock().await;
            state.pending.remove(&key);
            return;
        }

        let mut became_ready = false;
        {
            let mut state = self.state.lock().await;
            state.pending.remove(&key);
            if state.nodes.contains_key(&remote_id) {
                drop(state);
                wire_client.destroy();
                return;
            }
            for channel in &channels {
                state.hub.subscribe_node(&remote_id, channel);
            }
            state.nodes.insert(remote_id.clone(), NodeRecord { sink: PeerSink::Outbound(wire_client) });
            state.node_ips.insert(key.clone(), remote_id.clone());
            if !state.ready {
                state.ready = true;
                became_ready = true;
            }
        }
        *observer.node_id.lock().expect("mutex not poisoned") = Some(remote_id.clone());
        tracing::info!(node = %remote_id, addr = %key, "peer established (outbound)");
        if became_ready {
            self.flush_pending_events().await;
        }
    }

    async fn flush_pending_events(self: Arc<Self>) {
        let drained = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.pending_events)
        };
        for ev in drained {
            self.clone().dispatch_gossip(&ev.sid, &ev.event_tag, ev.data).await;
        }
    }

    /// `Publish(channel, msg)` from application code (§4.7.6).
    pub async fn publish(&self, channel: &str, msg: Value) -> bool {
        let mut state = self.state.lock().await;
        let self_id = self.self_id.clone();
        let (events, matched) = state.hub.publish(channel, msg, Some(self_id.as_str()), false, false);
        for event in events {
            match event {
                HubEvent::NodeMessage { channel, node, message } if node != self_id => {
                    if let Some(rec) = state.nodes.get(&node) {
                        rec.sink.send(tag::CHANNEL_MESSAGE, json!({"c": channel, "s": self_id, "m": message}));
                    }
                }
                HubEvent::NodeBroadcast { channel, message } => {
                    for rec in state.nodes.values() {
                        rec.sink.send(tag::CHANNEL_MESSAGE, json!({"c": channel, "s": self_id, "m": message}));
                    }
                }
                HubEvent::ChannelMessage { channel, message } => {
                    tracing::trace!(channel, message, "channel.message (observability)");
                }
                HubEvent::ClientMessage { channel, client, message } => {
                    tracing::trace!(channel, client, message, "client.message (no local client transport)");
                }
                _ => {}
            }
        }
        matched
    }

    /// Locally-originated publish on behalf of an authorized Publisher
    /// socket (§9 Publisher sessions, SPEC_FULL.md 4.7).
    pub async fn publish_from_publisher(&self, channel: &str, msg: Value) {
        self.publish(channel, msg).await;
    }

    /// Registers this node's own interest in `channel` and broadcasts
    /// `ChannelJoin` to every peer (§4.7.5's `J` row: "broadcast on local
    /// node.join"). Matches spec.md's `SubscribeNode(selfId, channel)`.
    pub async fn subscribe(&self, channel: &str) {
        let events = {
            let mut state = self.state.lock().await;
            state.hub.subscribe_node(&self.self_id, channel)
        };
        if events.iter().any(|e| matches!(e, HubEvent::NodeJoin { .. } | HubEvent::ChannelAdd { .. })) {
            let state = self.state.lock().await;
            for rec in state.nodes.values() {
                rec.sink.send(tag::CHANNEL_JOIN, json!({"c": channel}));
            }
        }
    }

    /// Inverse of [`subscribe`](Self::subscribe); broadcasts `ChannelLeave`.
    pub async fn unsubscribe(&self, channel: &str) {
        let events = {
            let mut state = self.state.lock().await;
            state.hub.unsubscribe_node(&self.self_id, channel)
        };
        if !events.is_empty() {
            let state = self.state.lock().await;
            for rec in state.nodes.values() {
                rec.sink.send(tag::CHANNEL_LEAVE, json!({"c": channel}));
            }
        }
    }

    async fn dispatch_gossip(self: Arc<Self>, sid: &str, event_tag: &str, data: Value) {
        let to_dial;
        {
            let mut state = self.state.lock().await;
            if !state.ready && event_tag != tag::NODE_STATE {
                state.pending_events.push(PendingGossip {
                    sid: sid.to_owned(),
                    event_tag: event_tag.to_owned(),
                    data,
                });
                return;
            }
            let became_ready = !state.ready;
            if became_ready {
                state.ready = true;
            }
            to_dial = (Self::process_gossip(&mut state, &self.self_id, sid, event_tag, &data), became_ready);
        }
        let (addrs, became_ready) = to_dial;
        for addr in addrs {
            self.clone().add_node(addr).await;
        }
        if became_ready {
            self.flush_pending_events().await;
        }
    }

    /// Mutates the hub / peer maps under the lock and performs any
    /// resulting sends synchronously (no suspension points in this
    /// function), returning addresses discovered via `NodeState` that the
    /// caller must dial outside the lock.
    fn process_gossip(
        state: &mut ClusterState,
        self_id: &str,
        sid: &str,
        event_tag: &str,
        data: &Value,
    ) -> Vec<PeerAddress> {
        let mut to_dial = Vec::new();
        let Ok(payload) = mesh_protocol::GossipPayload::decode(event_tag, data) else {
            tracing::debug!(tag = event_tag, "dropping malformed gossip frame");
            return to_dial;
        };
        match payload {
            mesh_protocol::GossipPayload::NodeState(s) => {
                for entry in &s.n {
                    if entry.sid == self_id {
                        continue;
                    }
                    if state.nodes.contains_key(&entry.sid) {
                        continue;
                    }
                    if let Some((ip, port)) = entry.url.rsplit_once(':').and_then(|(ip, p)| {
                        p.parse::<u16>().ok().map(|port| (ip.to_owned(), port))
                    }) {
                        to_dial.push(PeerAddress { ip, port });
                    }
                }
                for channel in &s.c {
                    state.hub.subscribe_node(&s.s, channel);
                }
            }
            mesh_protocol::GossipPayload::ChannelJoin(j) => {
                state.hub.subscribe_node(sid, &j.c);
            }
            mesh_protocol::GossipPayload::ChannelLeave(l) => {
                state.hub.unsubscribe_node(sid, &l.c);
            }
            mesh_protocol::GossipPayload::ChannelMessage(m) => {
                state.hub.publish(&m.c, Value::String(m.m), Some(sid), true, true);
            }
            mesh_protocol::GossipPayload::ClientKick(k) => {
                state.hub.remove_client(&k.cid);
                Self::rebroadcast(state, sid, event_tag, data);
            }
            mesh_protocol::GossipPayload::ClientUnsubscribe(u) => {
                state.hub.unsubscribe_client(&u.cid, &u.c);
                Self::rebroadcast(state, sid, event_tag, data);
            }
            mesh_protocol::GossipPayload::NodeInfo(_) => {
                tracing::debug!("unexpected NodeInfo frame after establishment, ignoring");
            }
        }
        to_dial
    }

    fn rebroadcast(state: &ClusterState, exclude_sid: &str, event_tag: &str, data: &Value) {
        for (node_id, rec) in state.nodes.iter() {
            if node_id != exclude_sid {
                rec.sink.send(event_tag, data.clone());
            }
        }
    }

    /// Announces membership to the mesh after a local channel join/leave or
    /// peer loss (§4.7.4, the `NodeState` broadcast path).
    async fn broadcast_node_state(&self) {
        let state = self.state.lock().await;
        let entries: Vec<Value> =
            state.nodes.keys().map(|sid| json!({"url": sid, "sid": sid})).collect();
        let channels = state.hub.channels();
        let body = json!({"s": self.self_id, "n": entries, "c": channels});
        for rec in state.nodes.values() {
            rec.sink.send(tag::NODE_STATE, body.clone());
        }
    }

    async fn handle_peer_loss(&self, node_id: &str, remote_key: &str) {
        {
            let mut state = self.state.lock().await;
            state.nodes.remove(node_id);
            state.node_ips.remove(remote_key);
            state.pending.remove(remote_key);
            state.hub.remove_node(node_id);
        }
        tracing::info!(node = node_id, "peer lost");
        self.broadcast_node_state().await;
    }

    /// Closes this node's socket to `node_id` without waiting for the remote
    /// side to go away, so peer-loss handling (§4.7.4) can be exercised
    /// without actually killing a process.
    pub async fn disconnect_peer(&self, node_id: &str) {
        let state = self.state.lock().await;
        if let Some(rec) = state.nodes.get(node_id) {
            rec.sink.destroy();
        }
    }

    pub async fn status(&self) -> mesh_protocol::StatusResponse {
        let state = self.state.lock().await;
        mesh_protocol::StatusResponse {
            ready: state.ready,
            nodes: state
                .nodes
                .keys()
                .map(|sid| mesh_protocol::NodeEntry { url: sid.clone(), sid: sid.clone() })
                .collect(),
            channels: state.hub.channels(),
        }
    }

    pub async fn is_ready(&self) -> bool {
        self.state.lock().await.ready
    }
}

/// Bridges `mesh_wire::PeerConduit`'s `&self` callbacks to `Cluster`'s
/// `Arc<Self>`-based async methods.
struct ClusterConduit(Arc<Cluster>);

impl PeerConduit for ClusterConduit {
    fn on_client(&self, attrs: &SocketAttrs, remote_key: &str, handle: PeerHandle) {
        let cluster = self.0.clone();
        let attrs = attrs.clone();
        let remote_key = remote_key.to_owned();
        tokio::spawn(async move { cluster.handle_inbound_client(attrs, remote_key, handle).await });
    }

    fn on_event(&self, attrs: &SocketAttrs, remote_key: &str, event_tag: &str, data: &Value) {
        let cluster = self.0.clone();
        let attrs = attrs.clone();
        let remote_key = remote_key.to_owned();
        let event_tag = event_tag.to_owned();
        let data = data.clone();
        tokio::spawn(
            async move { cluster.handle_inbound_event(attrs, remote_key, event_tag, data).await },
        );
    }

    fn on_disconnect(&self, attrs: &SocketAttrs, remote_key: &str) {
        let cluster = self.0.clone();
        let attrs = attrs.clone();
        let remote_key = remote_key.to_owned();
        tokio::spawn(async move { cluster.handle_inbound_disconnect(attrs, remote_key).await });
    }
}

impl Cluster {
    /// §4.7.1: admit an inbound peer, or register a Publisher session.
    async fn handle_inbound_client(self: Arc<Self>, attrs: SocketAttrs, remote_key: String, handle: PeerHandle) {
        let Some(peer_id) = attrs.peer_id.clone() else {
            // Publisher session: no peer-map admission, no NodeInfo, no gossip.
            return;
        };
        let port = stashed_port(&attrs.data);
        let key = match port {
            Some(p) => {
                let ip = remote_key.rsplit_once(':').map(|(ip, _)| ip).unwrap_or(&remote_key);
                format!("{ip}:{p}")
            }
            None => remote_key,
        };

        let mut became_ready = false;
        {
            let mut state = self.state.lock().await;
            if state.node_ips.contains_key(&key) {
                drop(state);
                handle.close();
                return;
            }
            let channels = state.hub.channels();
            handle.send(
                tag::NODE_INFO,
                mesh_util::EncodeData::Json(json!({"_t": 1, "_i": self.self_id, "c": channels})),
            );
            state.nodes.insert(peer_id.clone(), NodeRecord { sink: PeerSink::Inbound(handle) });
            state.node_ips.insert(key, peer_id.clone());
            if !state.ready {
                state.ready = true;
                became_ready = true;
            }
        }
        tracing::info!(node = %peer_id, "peer established (inbound)");
        if became_ready {
            self.flush_pending_events().await;
        }
    }

    async fn handle_inbound_event(
        self: Arc<Self>,
        attrs: SocketAttrs,
        _remote_key: String,
        event_tag: String,
        data: Value,
    ) {
        if let Some(peer_id) = &attrs.peer_id {
            self.dispatch_gossip(peer_id, &event_tag, data).await;
            return;
        }
        if attrs.publisher_id.is_some() && event_tag == tag::CHANNEL_MESSAGE {
            if let (Some(c), Some(m)) = (data.get("c").and_then(|v| v.as_str()), data.get("m")) {
                self.publish_from_publisher(c, m.clone()).await;
            }
        }
    }

    async fn handle_inbound_disconnect(self: Arc<Self>, attrs: SocketAttrs, remote_key: String) {
        let Some(peer_id) = attrs.peer_id else { return };
        let key = {
            let state = self.state.lock().await;
            state
                .node_ips
                .iter()
                .find(|(_, v)| **v == peer_id)
                .map(|(k, _)| k.clone())
                .unwrap_or(remote_key)
        };
        self.handle_peer_loss(&peer_id, &key).await;
    }
}

/// Drives an outbound `WireClient`'s first-NodeInfo establishment and all
/// subsequent gossip frames (§4.7.2).
struct OutboundObserver {
    cluster: Arc<Cluster>,
    first_frame: Arc<StdMutex<Option<Value>>>,
    node_id: StdMutex<Option<String>>,
}

impl WireClientObserver for OutboundObserver {
    fn on_event(&self, event_tag: &str, _seq: Option<i64>, data: &Value) {
        {
            let mut first = self.first_frame.lock().expect("mutex not poisoned");
            if first.is_none() {
                *first = Some(data.clone());
                return;
            }
        }
        let sid = self.node_id.lock().expect("mutex not poisoned").clone();
        let Some(sid) = sid else {
            return;
        };
        let cluster = self.cluster.clone();
        let event_tag = event_tag.to_owned();
        let data = data.clone();
        tokio::spawn(async move { cluster.dispatch_gossip(&sid, &event_tag, data).await });
    }

    fn on_disconnect(&self) {
        let Some(sid) = self.node_id.lock().expect("mutex not poisoned").clone() else {
            return;
        };
        let cluster = self.cluster.clone();
        tokio::spawn(async move {
            let key = {
                let state = cluster.state.lock().await;
                state.node_ips.iter().find(|(_, v)| **v == sid).map(|(k, _)| k.clone())
            };
            if let Some(key) = key {
                cluster.handle_peer_loss(&sid, &key).await;
            }
        });
    }
}

pub async fn bind(config: &ClusterConfig) -> Result<(tokio::net::TcpListener, SocketAddr), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}
