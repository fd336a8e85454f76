//! Pure in-memory subscription registry + fan-out event emitter (§4.4).
//!
//! No I/O, no async. Every operation runs to completion and returns the
//! [`HubEvent`]s it produced rather than invoking callbacks inline — the
//! systems-language translation of the source's event-emitter cycles (see
//! SPEC_FULL.md §9 / DESIGN.md). Because nothing external can run mid-call,
//! the "recompute length each iteration" hazard `RemoveChannel` guards
//! against in the source cannot occur here; `remove_channel` still re-reads
//! the live subscriber sets on every loop pass rather than snapshotting
//! up front, to keep that invariant visibly true in the code.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

pub type NodeId = String;
pub type ChannelName = String;
pub type ClientId = String;

/// Every event `ChannelHub` can produce, grouped by what the cluster does
/// with it: channel lifecycle, node/client membership, and fan-out delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    ChannelAdd { channel: ChannelName },
    ChannelRemove { channel: ChannelName },
    NodeJoin { channel: ChannelName, node: NodeId },
    NodeLeave { channel: ChannelName, node: NodeId },
    ClientJoin { channel: ChannelName, client: ClientId },
    ClientLeave { channel: ChannelName, client: ClientId },
    NodeMessage { channel: ChannelName, node: NodeId, message: String },
    NodeBroadcast { channel: ChannelName, message: String },
    ClientMessage { channel: ChannelName, client: ClientId, message: String },
    ChannelMessage { channel: ChannelName, message: String },
}

#[derive(Debug, Default)]
pub struct ChannelHub {
    node_channels: HashMap<ChannelName, HashSet<NodeId>>,
    client_channels: HashMap<ChannelName, HashSet<ClientId>>,
    node_index: HashMap<NodeId, HashSet<ChannelName>>,
    client_index: HashMap<ClientId, HashSet<ChannelName>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent. Emits `channel.add(c)` on first subscriber of `c`, then
    /// `node.join(c, sid)` iff `sid` was absent.
    pub fn subscribe_node(&mut self, sid: &str, c: &str) -> Vec<HubEvent> {
        let mut events = Vec::new();
        let is_new_channel = !self.node_channels.contains_key(c);
        let inserted = self.node_channels.entry(c.to_owned()).or_default().insert(sid.to_owned());
        if is_new_channel {
            events.push(HubEvent::ChannelAdd { channel: c.to_owned() });
        }
        if inserted {
            self.node_index.entry(sid.to_owned()).or_default().insert(c.to_owned());
            events.push(HubEvent::NodeJoin { channel: c.to_owned(), node: sid.to_owned() });
        }
        events
    }

    /// Idempotent. Emits `node.leave(c, sid)` iff present; emits
    /// `channel.remove(c)` when this removal empties `nodeChannels[c]` and
    /// `clientChannels[c]` is also absent.
    pub fn unsubscribe_node(&mut self, sid: &str, c: &str) -> Vec<HubEvent> {
        self.unsubscribe_node_inner(sid, c)
    }

    fn unsubscribe_node_inner(&mut self, sid: &str, c: &str) -> Vec<HubEvent> {
        let mut events = Vec::new();
        let mut removed = false;
        let mut node_became_empty = false;
        if let Some(set) = self.node_channels.get_mut(c) {
            removed = set.remove(sid);
            if set.is_empty() {
                self.node_channels.remove(c);
                node_became_empty = true;
            }
        }
        if !removed {
            return events;
        }
        if let Some(idx) = self.node_index.get_mut(sid) {
            idx.remove(c);
            if idx.is_empty() {
                self.node_index.remove(sid);
            }
        }
        events.push(HubEvent::NodeLeave { channel: c.to_owned(), node: sid.to_owned() });
        if node_became_empty && !self.client_channels.contains_key(c) {
            events.push(HubEvent::ChannelRemove { channel: c.to_owned() });
        }
        events
    }

    /// Calls `subscribe_node` first, then adds `cid` to `clientChannels[c]`;
    /// emits `client.join(c, cid)` on transition.
    pub fn subscribe_client(&mut self, sid: &str, cid: &str, c: &str) -> Vec<HubEvent> {
        let mut events = self.subscribe_node(sid, c);
        let inserted = self.client_channels.entry(c.to_owned()).or_default().insert(cid.to_owned());
        if inserted {
            self.client_index.entry(cid.to_owned()).or_default().insert(c.to_owned());
            events.push(HubEvent::ClientJoin { channel: c.to_owned(), client: cid.to_owned() });
        }
        events
    }

    /// Removes `cid`; emits `client.leave(c, cid)`; when the last client
    /// subscriber leaves, drives `remove_channel(c)`.
    pub fn unsubscribe_client(&mut self, cid: &str, c: &str) -> Vec<HubEvent> {
        let (mut events, removed, client_became_empty) = self.unsubscribe_client_inner(cid, c);
        if !removed {
            return events;
        }
        if client_became_empty {
            events.extend(self.remove_channel(c));
        }
        events
    }

    fn unsubscribe_client_inner(&mut self, cid: &str, c: &str) -> (Vec<HubEvent>, bool, bool) {
        let mut events = Vec::new();
        let mut removed = false;
        let mut client_became_empty = false;
        if let Some(set) = self.client_channels.get_mut(c) {
            removed = set.remove(cid);
            if set.is_empty() {
                self.client_channels.remove(c);
                client_became_empty = true;
            }
        }
        if !removed {
            return (events, false, false);
        }
        if let Some(idx) = self.client_index.get_mut(cid) {
            idx.remove(c);
            if idx.is_empty() {
                self.client_index.remove(cid);
            }
        }
        events.push(HubEvent::ClientLeave { channel: c.to_owned(), client: cid.to_owned() });
        (events, true, client_became_empty)
    }

    /// Walks current subscribers of `c` (node and client) and unsubscribes
    /// each, driving the emit cascade. Re-reads the live subscriber sets on
    /// every pass rather than snapshotting once.
    pub fn remove_channel(&mut self, c: &str) -> Vec<HubEvent> {
        let mut events = Vec::new();
        loop {
            if let Some(sid) = self.node_channels.get(c).and_then(|s| s.iter().next().cloned()) {
                events.extend(self.unsubscribe_node_inner(&sid, c));
                continue;
            }
            if let Some(cid) = self.client_channels.get(c).and_then(|s| s.iter().next().cloned()) {
                let (ev, _removed, _was_last) = self.unsubscribe_client_inner(&cid, c);
                events.extend(ev);
                continue;
            }
            break;
        }
        events
    }

    /// Iterate channels `sid` is subscribed to and unsubscribe from each.
    pub fn remove_node(&mut self, sid: &str) -> Vec<HubEvent> {
        let channels: Vec<ChannelName> =
            self.node_index.get(sid).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        let mut events = Vec::new();
        for c in channels {
            events.extend(self.unsubscribe_node(sid, &c));
        }
        events
    }

    /// Iterate channels `cid` is subscribed to and unsubscribe from each.
    pub fn remove_client(&mut self, cid: &str) -> Vec<HubEvent> {
        let channels: Vec<ChannelName> =
            self.client_index.get(cid).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        let mut events = Vec::new();
        for c in channels {
            events.extend(self.unsubscribe_client(cid, &c));
        }
        events
    }

    pub fn is_node_subscribed(&self, sid: &str, c: &str) -> bool {
        self.node_channels.get(c).is_some_and(|s| s.contains(sid))
    }

    pub fn is_client_subscribed(&self, cid: &str, c: &str) -> bool {
        self.client_channels.get(c).is_some_and(|s| s.contains(cid))
    }

    /// Every channel this hub currently tracks node interest for — the
    /// `channels` field of the `/_status` response.
    pub fn channels(&self) -> Vec<ChannelName> {
        self.node_channels.keys().cloned().collect()
    }

    pub fn node_subscribers(&self, c: &str) -> Vec<NodeId> {
        self.node_channels.get(c).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn client_subscribers(&self, c: &str) -> Vec<ClientId> {
        self.client_channels.get(c).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    /// Objects are JSON-stringified once on entry so every downstream emit
    /// sees the same payload shape.
    ///
    /// - `nodeChannels[c]` exists and `skip_nodes` is false: one
    ///   `node.message` per subscribed node.
    /// - `nodeChannels[c]` does not exist and `skip_broadcast` is false:
    ///   `node.broadcast` (the cluster doesn't know any subscriber; flood).
    /// - `clientChannels[c]` exists: one `client.message` per local client.
    /// - `sender_sid` absent, or a known subscriber of `c`: `channel.message`
    ///   (observability hook for the originating node).
    ///
    /// Returns whether any *known* subscriber (node or client) exists —
    /// independent of whether a broadcast fallback was emitted.
    pub fn publish(
        &self,
        c: &str,
        msg: Value,
        sender_sid: Option<&str>,
        skip_nodes: bool,
        skip_broadcast: bool,
    ) -> (Vec<HubEvent>, bool) {
        let payload = match msg {
            Value::String(s) => s,
            other => other.to_string(),
        };
        let mut events = Vec::new();

        let node_subs = self.node_channels.get(c);
        if let Some(nodes) = node_subs {
            if !skip_nodes {
                for sid in nodes {
                    events.push(HubEvent::NodeMessage {
                        channel: c.to_owned(),
                        node: sid.clone(),
                        message: payload.clone(),
                    });
                }
            }
        } else if !skip_broadcast {
            events.push(HubEvent::NodeBroadcast { channel: c.to_owned(), message: payload.clone() });
        }

        if let Some(clients) = self.client_channels.get(c) {
            for cid in clients {
                events.push(HubEvent::ClientMessage {
                    channel: c.to_owned(),
                    client: cid.clone(),
                    message: payload.clone(),
                });
            }
        }

        let sender_is_subscriber = match sender_sid {
            None => true,
            Some(sid) => node_subs.is_some_and(|s| s.contains(sid)),
        };
        if sender_is_subscriber {
            events.push(HubEvent::ChannelMessage { channel: c.to_owned(), message: payload });
        }

        let matched = self.node_channels.contains_key(c) || self.client_channels.contains_key(c);
        (events, matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h_idempotent_node_join_fires_once() {
        let mut hub = ChannelHub::new();
        let first = hub.subscribe_node("n1", "c");
        let second = hub.subscribe_node("n1", "c");
        assert!(first.iter().any(|e| matches!(e, HubEvent::NodeJoin { .. })));
        assert!(second.is_empty());
    }

    #[test]
    fn h_cleanup_removes_both_maps_and_emits_once() {
        let mut hub = ChannelHub::new();
        hub.subscribe_node("n1", "c");
        let events = hub.unsubscribe_node("n1", "c");
        assert_eq!(events.iter().filter(|e| matches!(e, HubEvent::ChannelRemove { .. })).count(), 1);
        assert!(hub.node_subscribers("c").is_empty());
        assert!(hub.client_subscribers("c").is_empty());
    }

    #[test]
    fn h_client_implies_node() {
        let mut hub = ChannelHub::new();
        hub.subscribe_client("n1", "cid1", "c");
        assert!(hub.is_node_subscribed("n1", "c"));
        assert!(hub.is_client_subscribed("cid1", "c"));
    }

    #[test]
    fn last_client_leaving_drops_node_entry_too() {
        let mut hub = ChannelHub::new();
        hub.subscribe_client("n1", "cid1", "c");
        let events = hub.unsubscribe_client("cid1", "c");
        assert!(events.iter().any(|e| matches!(e, HubEvent::ChannelRemove { .. })));
        assert!(!hub.is_node_subscribed("n1", "c"));
    }

    #[test]
    fn remove_channel_drains_multiple_node_and_client_subscribers() {
        let mut hub = ChannelHub::new();
        hub.subscribe_node("n1", "c");
        hub.subscribe_client("n1", "cid1", "c");
        hub.subscribe_node("n2", "c");
        let events = hub.remove_channel("c");
        assert_eq!(events.iter().filter(|e| matches!(e, HubEvent::ChannelRemove { .. })).count(), 1);
        assert!(hub.node_subscribers("c").is_empty());
        assert!(hub.client_subscribers("c").is_empty());
    }

    #[test]
    fn publish_with_no_subscribers_returns_false() {
        let hub = ChannelHub::new();
        let (events, matched) = hub.publish("ch", Value::String("hi".into()), None, false, false);
        assert!(!matched);
        assert!(events.iter().any(|e| matches!(e, HubEvent::NodeBroadcast { .. })));
    }

    #[test]
    fn publish_after_self_subscribe_matches_and_emits_channel_message() {
        let mut hub = ChannelHub::new();
        hub.subscribe_node("self", "ch");
        let (events, matched) = hub.publish("ch", Value::String("hi".into()), Some("self"), false, false);
        assert!(matched);
        assert!(events.iter().any(|e| matches!(e, HubEvent::ChannelMessage { message, .. }) if message == "hi"));
    }

    #[test]
    fn publish_skip_nodes_and_broadcast_limits_to_local_clients() {
        let mut hub = ChannelHub::new();
        hub.subscribe_client("n1", "cid1", "c");
        let (events, matched) = hub.publish("c", Value::String("m".into()), Some("n1"), true, true);
        assert!(matched);
        assert!(!events.iter().any(|e| matches!(e, HubEvent::NodeMessage { .. } | HubEvent::NodeBroadcast { .. })));
        assert!(events.iter().any(|e| matches!(e, HubEvent::ClientMessage { .. })));
    }

    #[test]
    fn publish_stringifies_object_payload_once() {
        let mut hub = ChannelHub::new();
        hub.subscribe_node("n1", "c");
        let (events, _) =
            hub.publish("c", serde_json::json!({"x": 1}), None, false, false);
        let HubEvent::NodeMessage { message, .. } =
            events.into_iter().find(|e| matches!(e, HubEvent::NodeMessage { .. })).unwrap()
        else {
            unreachable!()
        };
        assert_eq!(message, r#"{"x":1}"#);
    }
}
