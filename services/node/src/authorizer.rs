//! Inbound connection authorizer (§4.7 "Authorizer").
//!
//! Grounded in `server/src/auth.rs`'s bearer-extraction shape, generalized
//! from a database-backed device lookup to `mesh_token::verify` against the
//! cluster's shared secret.

use mesh_wire::{Authorizer, SocketAttrs};
use serde_json::Value;

pub struct ClusterAuthorizer {
    secret: Option<String>,
}

impl ClusterAuthorizer {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }
}

impl Authorizer for ClusterAuthorizer {
    fn authorize(&self, token: Option<&str>) -> Option<SocketAttrs> {
        let token = token?;
        let verified = mesh_token::verify(
            token,
            mesh_token::VerifyOptions { type_tag: None, secret: self.secret.as_deref() },
        )
        .ok()?;

        match verified.type_tag {
            mesh_token::type_tag::CLUSTER_PEER => {
                let peer_id = verified.issuer?;
                Some(SocketAttrs { peer_id: Some(peer_id), publisher_id: None, data: Some(verified.data) })
            }
            mesh_token::type_tag::PUBLISHER => {
                let publisher_id = verified
                    .issuer
                    .unwrap_or_else(|| mesh_util::random_id(12).unwrap_or_else(|_| "publisher".to_owned()));
                Some(SocketAttrs {
                    peer_id: None,
                    publisher_id: Some(publisher_id),
                    data: Some(verified.data),
                })
            }
            _ => None,
        }
    }
}

/// Extracts the declared listen port a peer stashed in its token payload
/// (`{"port": ...}`), used to form the `ip:port` node key on admission.
pub fn stashed_port(data: &Option<Value>) -> Option<u16> {
    data.as_ref()?.get("port")?.as_u64().map(|p| p as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_cluster_peer_token_and_stashes_peer_id() {
        let token = mesh_token::create(
            serde_json::json!({"port": 7300}),
            mesh_token::CreateOptions {
                type_tag: mesh_token::type_tag::CLUSTER_PEER,
                secret: Some("s3cr3t"),
                issuer: Some("node-a"),
                expire_at_ms: None,
                ttl_ms: None,
            },
        )
        .unwrap();
        let authorizer = ClusterAuthorizer::new(Some("s3cr3t".to_owned()));
        let attrs = authorizer.authorize(Some(&token)).unwrap();
        assert_eq!(attrs.peer_id.as_deref(), Some("node-a"));
        assert_eq!(stashed_port(&attrs.data), Some(7300));
    }

    #[test]
    fn accepts_publisher_token_generating_id_when_absent() {
        let token = mesh_token::create(
            serde_json::json!({}),
            mesh_token::CreateOptions {
                type_tag: mesh_token::type_tag::PUBLISHER,
                secret: None,
                issuer: None,
                expire_at_ms: None,
                ttl_ms: None,
            },
        )
        .unwrap();
        let authorizer = ClusterAuthorizer::new(None);
        let attrs = authorizer.authorize(Some(&token)).unwrap();
        assert!(attrs.publisher_id.is_some());
        assert!(attrs.peer_id.is_none());
    }

    #[test]
    fn rejects_missing_token() {
        let authorizer = ClusterAuthorizer::new(Some("s3cr3t".to_owned()));
        assert!(authorizer.authorize(None).is_none());
    }

    #[test]
    fn rejects_wrong_secret() {
        let token = mesh_token::create(
            serde_json::json!({}),
            mesh_token::CreateOptions {
                type_tag: mesh_token::type_tag::CLUSTER_PEER,
                secret: Some("right"),
                issuer: Some("node-a"),
                expire_at_ms: None,
                ttl_ms: None,
            },
        )
        .unwrap();
        let authorizer = ClusterAuthorizer::new(Some("wrong".to_owned()));
        assert!(authorizer.authorize(Some(&token)).is_none());
    }
}
