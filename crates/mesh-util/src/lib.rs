//! Random id generation, hostname resolution, HTTP(S) JSON fetch, and the
//! wire frame codec (§4.2).
//!
//! Grounded in `services/forwarder/src/discovery.rs` (address parsing style)
//! and `services/server/src/http/admin.rs` (OsRng + base64 alphabet usage).

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use rand::RngCore;
use rand::rngs::OsRng;
use serde_json::Value;
use thiserror::Error;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum UtilError {
    #[error("rng unavailable")]
    RngUnavailable,
    #[error("resolve failed for {host:?}: {reason}")]
    ResolveFailed { host: String, reason: String },
    #[error("fetch failed for {url:?}: {reason}")]
    FetchFailed { url: String, reason: String },
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// `RandomId(n)` — n characters from a fixed 62-char alphanumeric alphabet,
/// backed by a cryptographic RNG.
pub fn random_id(n: usize) -> Result<String, UtilError> {
    let mut bytes = vec![0u8; n];
    OsRng.try_fill_bytes(&mut bytes).map_err(|_| UtilError::RngUnavailable)?;
    Ok(bytes.iter().map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char).collect())
}

/// `ResolveIPv4(host)` — deduplicated set of IPv4 addresses for `host`; AAAA
/// records are discarded.
pub async fn resolve_ipv4(host: &str) -> Result<HashSet<Ipv4Addr>, UtilError> {
    let lookup_target = format!("{host}:0");
    let addrs = tokio::net::lookup_host(&lookup_target).await.map_err(|e| {
        UtilError::ResolveFailed { host: host.to_owned(), reason: e.to_string() }
    })?;
    let v4: HashSet<Ipv4Addr> = addrs
        .filter_map(|addr| match addr.ip() {
            std::net::IpAddr::V4(v4) => Some(v4),
            std::net::IpAddr::V6(_) => None,
        })
        .collect();
    if v4.is_empty() {
        return Err(UtilError::ResolveFailed {
            host: host.to_owned(),
            reason: "no A records".to_owned(),
        });
    }
    Ok(v4)
}

/// `FetchJson(url, method, query?, body?, timeout=3s)` — one HTTP(S) request;
/// rejects unless status is 2xx and content-type contains `/json`.
pub async fn fetch_json(
    url: &str,
    method: reqwest::Method,
    query: Option<&[(&str, &str)]>,
    body: Option<&Value>,
    timeout: Option<Duration>,
) -> Result<Value, UtilError> {
    let client = reqwest::Client::new();
    let mut req = client.request(method, url).timeout(timeout.unwrap_or(DEFAULT_FETCH_TIMEOUT));
    if let Some(q) = query {
        req = req.query(q);
    }
    if let Some(b) = body {
        req = req.json(b);
    }
    let resp = req.send().await.map_err(|e| UtilError::FetchFailed {
        url: url.to_owned(),
        reason: e.to_string(),
    })?;
    if !resp.status().is_success() {
        return Err(UtilError::FetchFailed {
            url: url.to_owned(),
            reason: format!("status {}", resp.status()),
        });
    }
    let is_json = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("/json"));
    if !is_json {
        return Err(UtilError::FetchFailed {
            url: url.to_owned(),
            reason: "response content-type is not JSON".to_owned(),
        });
    }
    resp.json::<Value>()
        .await
        .map_err(|e| UtilError::FetchFailed { url: url.to_owned(), reason: e.to_string() })
}

/// Payload to encode onto the wire. `Json` must be an object or array root.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeData {
    Undefined,
    Raw(String),
    Json(Value),
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub event: String,
    pub seq: Option<i64>,
    pub data: FrameData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameData {
    Empty,
    Raw(String),
    Json(Value),
}

/// `Encode(event, data)` — wire frame `"<event>|<payload>"`. When `data` is
/// a JSON object and `seq` is given, `_q` is spliced into the object before
/// serialization (advisory, tracing only — see SPEC_FULL.md §9).
pub fn encode(event: &str, data: EncodeData, seq: Option<u64>) -> String {
    match data {
        EncodeData::Undefined => format!("{event}|"),
        EncodeData::Raw(s) => format!("{event}|{s}"),
        EncodeData::Json(value) => {
            let spliced = match (value, seq) {
                (Value::Object(mut obj), Some(q)) => {
                    obj.insert("_q".to_owned(), Value::from(q));
                    Value::Object(obj)
                }
                (other, _) => other,
            };
            format!(
                "{event}|{}",
                serde_json::to_string(&spliced).expect("json values always serialize")
            )
        }
    }
}

/// `Decode(bytes)` — the inverse of [`encode`]. Splits on the first `|` only.
pub fn decode(frame: &str) -> Result<Frame, UtilError> {
    let (event, rest) = frame
        .split_once('|')
        .ok_or_else(|| UtilError::Malformed(format!("no '|' separator in {frame:?}")))?;
    if rest.is_empty() {
        return Ok(Frame { event: event.to_owned(), seq: None, data: FrameData::Empty });
    }
    let starts_structured = rest.starts_with('{') || rest.starts_with('[');
    if !starts_structured {
        return Ok(Frame {
            event: event.to_owned(),
            seq: None,
            data: FrameData::Raw(rest.to_owned()),
        });
    }
    let mut value: Value = serde_json::from_str(rest)
        .map_err(|e| UtilError::Malformed(format!("invalid JSON payload: {e}")))?;
    let seq = if let Value::Object(obj) = &mut value {
        match obj.remove("_q") {
            Some(Value::Number(n)) => n.as_i64(),
            _ => None,
        }
    } else {
        None
    };
    Ok(Frame { event: event.to_owned(), seq, data: FrameData::Json(value) })
}
