//! Shared test tooling for the cluster fabric: a bare-protocol
//! [`MockWsClient`], a [`MockPeerServer`] standing in for a remote peer, and
//! a couple of trivial `mesh_wire` trait impls every integration test
//! otherwise has to hand-roll.

pub mod mock_ws_client;
pub mod mock_ws_server;

pub use mock_ws_client::MockWsClient;
pub use mock_ws_server::MockPeerServer;

use std::sync::Mutex;

use mesh_wire::{Authorizer, PeerConduit, PeerHandle, SocketAttrs};
use serde_json::Value;

/// Issues a signed ClusterPeer token for test dialers, mirroring the token
/// factory `Cluster::add_node` builds in production (SPEC_FULL.md 4.7.2).
pub fn cluster_peer_token(secret: &str, self_id: &str, listen_port: u16) -> String {
    mesh_token::create(
        serde_json::json!({"port": listen_port}),
        mesh_token::CreateOptions {
            type_tag: mesh_token::type_tag::CLUSTER_PEER,
            secret: Some(secret),
            issuer: Some(self_id),
            expire_at_ms: None,
            ttl_ms: None,
        },
    )
    .expect("token payload is a JSON object")
}

/// An [`Authorizer`] that admits every connection with a fixed identity,
/// for `WireServer` tests that don't exercise the token path.
pub struct AllowAllAuthorizer {
    pub peer_id: Option<String>,
    pub publisher_id: Option<String>,
}

impl Authorizer for AllowAllAuthorizer {
    fn authorize(&self, _token: Option<&str>) -> Option<SocketAttrs> {
        Some(SocketAttrs {
            peer_id: self.peer_id.clone(),
            publisher_id: self.publisher_id.clone(),
            data: None,
        })
    }
}

#[derive(Debug, Clone)]
pub enum RecordedEvent {
    Client { remote_key: String },
    Event { remote_key: String, event_tag: String, data: Value },
    Disconnect { remote_key: String },
}

/// A [`PeerConduit`] that appends every callback to a shared log, for tests
/// that assert on the sequence of client/event/disconnect notifications a
/// `WireServer` produces.
#[derive(Default)]
pub struct RecordingConduit {
    pub events: Mutex<Vec<RecordedEvent>>,
}

impl PeerConduit for RecordingConduit {
    fn on_client(&self, _attrs: &SocketAttrs, remote_key: &str, _handle: PeerHandle) {
        self.events.lock().unwrap().push(RecordedEvent::Client { remote_key: remote_key.to_owned() });
    }

    fn on_event(&self, _attrs: &SocketAttrs, remote_key: &str, event_tag: &str, data: &Value) {
        self.events.lock().unwrap().push(RecordedEvent::Event {
            remote_key: remote_key.to_owned(),
            event_tag: event_tag.to_owned(),
            data: data.clone(),
        });
    }

    fn on_disconnect(&self, _attrs: &SocketAttrs, remote_key: &str) {
        self.events
            .lock()
            .unwrap()
            .push(RecordedEvent::Disconnect { remote_key: remote_key.to_owned() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::serve;
    use mesh_util::EncodeData;
    use mesh_wire::{WireServer, WireServerConfig};
    use tokio::net::TcpListener;

    async fn start_test_server(
        authorizer: Arc<dyn Authorizer>,
        conduit: Arc<RecordingConduit>,
    ) -> std::net::SocketAddr {
        let server = WireServer::new(WireServerConfig::default(), authorizer, conduit);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = server
            .into_router()
            .into_make_service_with_connect_info::<std::net::SocketAddr>();
        tokio::spawn(async move {
            let _ = serve(listener, router).await;
        });
        addr
    }

    #[tokio::test]
    async fn mock_client_round_trips_a_channel_join_frame() {
        let conduit = Arc::new(RecordingConduit::default());
        let authorizer: Arc<dyn Authorizer> =
            Arc::new(AllowAllAuthorizer { peer_id: Some("peer-under-test".to_owned()), publisher_id: None });
        let addr = start_test_server(authorizer, conduit.clone()).await;

        let mut client = MockWsClient::connect(&format!("ws://{addr}")).await.unwrap();
        client
            .send_frame("J", EncodeData::Json(serde_json::json!({"c": "room-1"})))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = conduit.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            RecordedEvent::Event { event_tag, .. } if event_tag == "J"
        )));
    }

    #[tokio::test]
    async fn mock_peer_server_greets_a_dialing_client_with_node_info() {
        let peer = MockPeerServer::start("remote-1", &["a", "b"]).await.unwrap();
        let mut client = MockWsClient::connect(&format!("ws://{}", peer.local_addr())).await.unwrap();
        let frame = client.recv_frame().await.unwrap();
        assert_eq!(frame.event, "I");
        match frame.data {
            mesh_util::FrameData::Json(v) => {
                assert_eq!(v["_i"], "remote-1");
                assert_eq!(v["c"], serde_json::json!(["a", "b"]));
            }
            other => panic!("expected JSON NodeInfo payload, got {other:?}"),
        }
    }

    #[test]
    fn cluster_peer_token_is_verifiable_with_matching_secret() {
        let token = cluster_peer_token("shared-secret", "node-a", 9000);
        let verified = mesh_token::verify(
            &token,
            mesh_token::VerifyOptions {
                type_tag: Some(mesh_token::type_tag::CLUSTER_PEER),
                secret: Some("shared-secret"),
            },
        )
        .unwrap();
        assert_eq!(verified.issuer.as_deref(), Some("node-a"));
        assert_eq!(verified.data["port"], 9000);
    }
}
