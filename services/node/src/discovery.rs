//! Peer discovery: three address sources, unioned and deduped by `ip:port`
//! (§4.7.3).
//!
//! Grounded in `forwarder/src/discovery.rs`'s address-expansion module,
//! repurposed here from reader-IP-range expansion to peer-address
//! union-and-dedup; the tolerant `"ip"` / `"ip:port"` / `{ip, port}` parsing
//! plays the role the teacher's range syntax played.

use std::collections::BTreeSet;

use crate::config::{ClusterConfig, DiscoveryConfig};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PeerAddress {
    pub ip: String,
    pub port: u16,
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parses a single static-list entry, tolerant of `"ip"`, `"ip:port"`, or a
/// raw `ip:port` string already split from JSON. `default_port` is used
/// when the entry carries no port.
fn parse_static_entry(entry: &str, default_port: u16) -> Option<PeerAddress> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }
    match entry.rsplit_once(':') {
        Some((ip, port_str)) => match port_str.parse::<u16>() {
            Ok(port) => Some(PeerAddress { ip: ip.to_owned(), port }),
            Err(_) => Some(PeerAddress { ip: entry.to_owned(), port: default_port }),
        },
        None => Some(PeerAddress { ip: entry.to_owned(), port: default_port }),
    }
}

fn parse_json_entry(value: &serde_json::Value, default_port: u16) -> Option<PeerAddress> {
    match value {
        serde_json::Value::String(s) => parse_static_entry(s, default_port),
        serde_json::Value::Object(obj) => {
            let ip = obj.get("ip")?.as_str()?.to_owned();
            let port = obj.get("port").and_then(|p| p.as_u64()).map(|p| p as u16).unwrap_or(default_port);
            Some(PeerAddress { ip, port })
        }
        _ => None,
    }
}

/// Runs all three discovery sources and returns the unioned, deduped
/// address set. Never fails: individual source failures are logged and
/// skipped, matching spec.md's "discovery never throws to its caller".
pub async fn discover(config: &ClusterConfig, self_id: &str) -> Vec<PeerAddress> {
    let mut found: BTreeSet<PeerAddress> = BTreeSet::new();

    if let Some(service) = &config.discovery.service {
        match mesh_util::resolve_ipv4(service).await {
            Ok(addrs) => {
                for ip in addrs {
                    found.insert(PeerAddress { ip: ip.to_string(), port: config.port });
                }
            }
            Err(e) => tracing::warn!(service, error = %e, "discovery: service resolution failed"),
        }
    }

    for entry in &config.discovery.nodes {
        if let Some(addr) = parse_static_entry(entry, config.port) {
            found.insert(addr);
        }
    }

    if let Some(fetch_url) = &config.discovery.fetch {
        match fetch_peers(fetch_url, self_id, config.port).await {
            Ok(addrs) => found.extend(addrs),
            Err(e) => tracing::warn!(url = fetch_url, error = %e, "discovery: fetch failed"),
        }
    }

    found.into_iter().collect()
}

async fn fetch_peers(
    fetch_url: &str,
    self_id: &str,
    default_port: u16,
) -> Result<Vec<PeerAddress>, mesh_util::UtilError> {
    let body = mesh_util::fetch_json(
        fetch_url,
        reqwest::Method::GET,
        Some(&[("id", self_id)]),
        None,
        None,
    )
    .await?;
    let entries = body.as_array().cloned().unwrap_or_default();
    Ok(entries.iter().filter_map(|v| parse_json_entry(v, default_port)).collect())
}

pub fn static_addresses(discovery: &DiscoveryConfig, default_port: u16) -> Vec<PeerAddress> {
    discovery.nodes.iter().filter_map(|entry| parse_static_entry(entry, default_port)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_ip_with_default_port() {
        assert_eq!(
            parse_static_entry("10.0.0.5", 7300),
            Some(PeerAddress { ip: "10.0.0.5".to_owned(), port: 7300 })
        );
    }

    #[test]
    fn parses_ip_with_explicit_port() {
        assert_eq!(
            parse_static_entry("10.0.0.5:9100", 7300),
            Some(PeerAddress { ip: "10.0.0.5".to_owned(), port: 9100 })
        );
    }

    #[test]
    fn parses_object_entry() {
        let v = serde_json::json!({"ip": "10.0.0.9", "port": 7301});
        assert_eq!(parse_json_entry(&v, 7300), Some(PeerAddress { ip: "10.0.0.9".to_owned(), port: 7301 }));
    }

    #[test]
    fn parses_object_entry_without_port_uses_default() {
        let v = serde_json::json!({"ip": "10.0.0.9"});
        assert_eq!(parse_json_entry(&v, 7300), Some(PeerAddress { ip: "10.0.0.9".to_owned(), port: 7300 }));
    }

    #[test]
    fn empty_entry_is_skipped() {
        assert_eq!(parse_static_entry("  ", 7300), None);
    }

    #[test]
    fn static_addresses_dedupe_via_discover_union() {
        let discovery = DiscoveryConfig {
            nodes: vec!["10.0.0.1:7300".to_owned(), "10.0.0.1:7300".to_owned()],
            ..Default::default()
        };
        let addrs = static_addresses(&discovery, 7300);
        assert_eq!(addrs.len(), 2, "static_addresses itself does not dedupe; discover() does via BTreeSet");
    }
}
