//! Gossip wire types shared between `mesh-wire`, `mesh-hub` consumers, and the
//! `meshbus-node` binary.
//!
//! The wire frame itself (`"<tag>|<body>"`) is encoded/decoded by
//! `mesh-util`; this crate only owns the JSON shapes that travel inside
//! `<body>` for each gossip tag, plus the small set of constants both sides
//! need to agree on (event tags, token type tags, HTTP status shape).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque node identity, of the form `<namespace>-<typeTag>-<random><tsTail>`.
pub type NodeId = String;
/// Opaque, case-sensitive channel name.
pub type ChannelName = String;
/// Opaque identifier for a client session attached to some node's local Hub.
pub type ClientId = String;

/// Gossip event tags (§4.7.5). Kept as `&str` constants rather than an enum
/// discriminant because they travel literally on the wire ahead of `|`.
pub mod tag {
    pub const NODE_INFO: &str = "I";
    pub const NODE_STATE: &str = "S";
    pub const CHANNEL_JOIN: &str = "J";
    pub const CHANNEL_LEAVE: &str = "L";
    pub const CHANNEL_MESSAGE: &str = "M";
    pub const CLIENT_KICK: &str = "CK";
    pub const CLIENT_UNSUBSCRIBE: &str = "CU";
}

/// Token type tags (reserved field `_t` in a token envelope, §4.3).
pub mod token_type {
    pub const CLUSTER_PEER: u8 = 1;
    pub const PUBLISHER: u8 = 2;
}

/// First frame sent by a server to an inbound peer, and the frame an
/// outbound dialer waits up to 3s for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    #[serde(rename = "_t")]
    pub type_tag: u8,
    #[serde(rename = "_i")]
    pub node_id: NodeId,
    pub c: Vec<ChannelName>,
}

/// One entry of `NodeState.n` — a peer another node knows about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeEntry {
    pub url: String,
    pub sid: NodeId,
}

/// Broadcast on membership change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeState {
    pub s: NodeId,
    pub n: Vec<NodeEntry>,
    pub c: Vec<ChannelName>,
}

/// Broadcast when this node locally subscribes to a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelJoin {
    pub c: ChannelName,
}

/// Broadcast when this node locally unsubscribes from a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelLeave {
    pub c: ChannelName,
}

/// A published message, either targeted at one peer or broadcast to all.
/// The two cases are wire-identical and handled identically on receipt —
/// there is no broadcast marker field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelMessage {
    pub c: ChannelName,
    pub s: NodeId,
    pub m: String,
}

/// Targeted then rebroadcast: tear down a client on its origin node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientKick {
    pub cid: ClientId,
}

/// Targeted then rebroadcast: remove a client from a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientUnsubscribe {
    pub c: ChannelName,
    pub cid: ClientId,
}

/// Dispatch-friendly union of every gossip payload, keyed by the wire tag.
#[derive(Debug, Clone, PartialEq)]
pub enum GossipPayload {
    NodeInfo(NodeInfo),
    NodeState(NodeState),
    ChannelJoin(ChannelJoin),
    ChannelLeave(ChannelLeave),
    ChannelMessage(ChannelMessage),
    ClientKick(ClientKick),
    ClientUnsubscribe(ClientUnsubscribe),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown gossip tag {0:?}")]
    UnknownTag(String),
    #[error("malformed payload for tag {tag:?}: {source}")]
    Malformed {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
}

impl GossipPayload {
    pub fn tag(&self) -> &'static str {
        match self {
            GossipPayload::NodeInfo(_) => tag::NODE_INFO,
            GossipPayload::NodeState(_) => tag::NODE_STATE,
            GossipPayload::ChannelJoin(_) => tag::CHANNEL_JOIN,
            GossipPayload::ChannelLeave(_) => tag::CHANNEL_LEAVE,
            GossipPayload::ChannelMessage(_) => tag::CHANNEL_MESSAGE,
            GossipPayload::ClientKick(_) => tag::CLIENT_KICK,
            GossipPayload::ClientUnsubscribe(_) => tag::CLIENT_UNSUBSCRIBE,
        }
    }

    /// JSON-encode this payload's body (the part after `|` in the wire frame).
    pub fn body(&self) -> serde_json::Value {
        match self {
            GossipPayload::NodeInfo(v) => serde_json::to_value(v),
            GossipPayload::NodeState(v) => serde_json::to_value(v),
            GossipPayload::ChannelJoin(v) => serde_json::to_value(v),
            GossipPayload::ChannelLeave(v) => serde_json::to_value(v),
            GossipPayload::ChannelMessage(v) => serde_json::to_value(v),
            GossipPayload::ClientKick(v) => serde_json::to_value(v),
            GossipPayload::ClientUnsubscribe(v) => serde_json::to_value(v),
        }
        .expect("gossip payloads are always representable as JSON")
    }

    /// Decode a payload given its wire tag and JSON body.
    pub fn decode(event_tag: &str, body: &serde_json::Value) -> Result<Self, ProtocolError> {
        fn parse<T: serde::de::DeserializeOwned>(
            tag: &str,
            body: &serde_json::Value,
        ) -> Result<T, ProtocolError> {
            serde_json::from_value(body.clone())
                .map_err(|source| ProtocolError::Malformed { tag: tag.to_owned(), source })
        }
        match event_tag {
            tag::NODE_INFO => parse(event_tag, body).map(GossipPayload::NodeInfo),
            tag::NODE_STATE => parse(event_tag, body).map(GossipPayload::NodeState),
            tag::CHANNEL_JOIN => parse(event_tag, body).map(GossipPayload::ChannelJoin),
            tag::CHANNEL_LEAVE => parse(event_tag, body).map(GossipPayload::ChannelLeave),
            tag::CHANNEL_MESSAGE => parse(event_tag, body).map(GossipPayload::ChannelMessage),
            tag::CLIENT_KICK => parse(event_tag, body).map(GossipPayload::ClientKick),
            tag::CLIENT_UNSUBSCRIBE => parse(event_tag, body).map(GossipPayload::ClientUnsubscribe),
            other => Err(ProtocolError::UnknownTag(other.to_owned())),
        }
    }
}

/// `GET /_status` and `/health` response body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub ready: bool,
    pub nodes: Vec<NodeEntry>,
    pub channels: Vec<ChannelName>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_info_round_trips_through_json() {
        let info = NodeInfo {
            type_tag: token_type::CLUSTER_PEER,
            node_id: "quty-1-abcd1234".to_owned(),
            c: vec!["room:1".to_owned()],
        };
        let payload = GossipPayload::NodeInfo(info.clone());
        assert_eq!(payload.tag(), tag::NODE_INFO);
        let decoded = GossipPayload::decode(tag::NODE_INFO, &payload.body()).unwrap();
        assert_eq!(decoded, GossipPayload::NodeInfo(info));
    }

    #[test]
    fn channel_message_has_no_broadcast_marker() {
        let msg = ChannelMessage {
            c: "room:1".to_owned(),
            s: "quty-1-aaaa0000".to_owned(),
            m: "hi".to_owned(),
        };
        let body = serde_json::to_value(&msg).unwrap();
        assert!(body.get("b").is_none());
        assert_eq!(body.as_object().unwrap().len(), 3);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = GossipPayload::decode("ZZ", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTag(t) if t == "ZZ"));
    }
}
