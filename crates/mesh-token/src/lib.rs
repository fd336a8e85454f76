//! Signed opaque credentials carrying type, issuer id, and expiry (§4.3).
//!
//! Grounded in `services/server/src/auth.rs` (token verification shape) and
//! `http/admin.rs` (base64 `URL_SAFE_NO_PAD` usage). HMAC support comes from
//! the `hmac` crate, the natural companion to the teacher's existing `sha2`
//! dependency.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD as B64_STD, URL_SAFE_NO_PAD as B64_URL};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub mod type_tag {
    pub const CLUSTER_PEER: u8 = 1;
    pub const PUBLISHER: u8 = 2;
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token data must be a JSON object")]
    NotAnObject,
    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Options accepted by [`create`].
#[derive(Debug, Default, Clone)]
pub struct CreateOptions<'a> {
    pub type_tag: u8,
    pub secret: Option<&'a str>,
    pub issuer: Option<&'a str>,
    pub expire_at_ms: Option<i64>,
    pub ttl_ms: Option<i64>,
}

/// The decoded, verified payload, with reserved fields split out.
#[derive(Debug, Clone, PartialEq)]
pub struct Verified {
    pub data: Value,
    pub type_tag: u8,
    pub issuer: Option<String>,
}

/// Options accepted by [`verify`].
#[derive(Debug, Default, Clone)]
pub struct VerifyOptions<'a> {
    pub type_tag: Option<u8>,
    pub secret: Option<&'a str>,
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis() as i64
}

/// `Create(data, {expire|ttl, secret, type, id})` — injects reserved fields
/// `_v=1, _t=type, _e=expiryMillis?, _i=issuerId?` and signs.
pub fn create(data: Value, opts: CreateOptions) -> Result<String, TokenError> {
    let Value::Object(mut obj) = data else {
        return Err(TokenError::NotAnObject);
    };
    obj.insert("_v".to_owned(), Value::from(1));
    obj.insert("_t".to_owned(), Value::from(opts.type_tag));
    if let Some(issuer) = opts.issuer {
        obj.insert("_i".to_owned(), Value::from(issuer));
    }
    let expiry = opts.expire_at_ms.or_else(|| opts.ttl_ms.map(|ttl| now_millis() + ttl));
    if let Some(expiry) = expiry {
        obj.insert("_e".to_owned(), Value::from(expiry));
    }

    let json = serde_json::to_string(&Value::Object(obj)).expect("token payload always serializes");
    let b64json = B64_URL.encode(json.as_bytes());

    match opts.secret {
        Some(secret) => {
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                .expect("HMAC accepts keys of any length");
            mac.update(b64json.as_bytes());
            let sig = mac.finalize().into_bytes();
            Ok(format!("{b64json}-{}", B64_STD.encode(sig)))
        }
        None => Ok(b64json),
    }
}

/// `Verify(token, {type?, secret?})` — returns the decoded payload with
/// reserved fields stripped, or [`TokenError::Invalid`].
pub fn verify(token: &str, opts: VerifyOptions) -> Result<Verified, TokenError> {
    let b64json = match opts.secret {
        Some(secret) => {
            let (b64json, b64sig) = token
                .rsplit_once('-')
                .ok_or_else(|| TokenError::Invalid("missing signature".to_owned()))?;
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                .expect("HMAC accepts keys of any length");
            mac.update(b64json.as_bytes());
            let provided = B64_STD
                .decode(b64sig)
                .map_err(|_| TokenError::Invalid("malformed signature".to_owned()))?;
            mac.verify_slice(&provided)
                .map_err(|_| TokenError::Invalid("signature mismatch".to_owned()))?;
            b64json
        }
        None => token,
    };

    let json_bytes = B64_URL
        .decode(b64json)
        .map_err(|_| TokenError::Invalid("malformed base64 payload".to_owned()))?;
    let mut value: Value = serde_json::from_slice(&json_bytes)
        .map_err(|_| TokenError::Invalid("malformed JSON payload".to_owned()))?;
    let obj = value.as_object_mut().ok_or_else(|| TokenError::Invalid("payload is not an object".to_owned()))?;

    let version = obj.remove("_v").and_then(|v| v.as_i64());
    if version != Some(1) {
        return Err(TokenError::Invalid("version mismatch".to_owned()));
    }
    let type_tag = obj
        .remove("_t")
        .and_then(|v| v.as_u64())
        .map(|v| v as u8)
        .ok_or_else(|| TokenError::Invalid("missing type tag".to_owned()))?;
    if let Some(expected) = opts.type_tag {
        if type_tag != expected {
            return Err(TokenError::Invalid("type mismatch".to_owned()));
        }
    }
    if let Some(expiry) = obj.remove("_e").and_then(|v| v.as_i64()) {
        if expiry < now_millis() {
            return Err(TokenError::Invalid("expired".to_owned()));
        }
    }
    let issuer = obj.remove("_i").and_then(|v| v.as_str().map(str::to_owned));

    Ok(Verified { data: value, type_tag, issuer })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_without_secret() {
        let token = create(
            serde_json::json!({"port": 7300}),
            CreateOptions { type_tag: type_tag::CLUSTER_PEER, ..Default::default() },
        )
        .unwrap();
        let verified = verify(&token, VerifyOptions::default()).unwrap();
        assert_eq!(verified.type_tag, type_tag::CLUSTER_PEER);
        assert_eq!(verified.data, serde_json::json!({"port": 7300}));
    }

    #[test]
    fn round_trip_with_secret_and_issuer() {
        let token = create(
            serde_json::json!({"port": 7300}),
            CreateOptions {
                type_tag: type_tag::CLUSTER_PEER,
                secret: Some("s3cr3t"),
                issuer: Some("quty-1-aaaa0000"),
                ..Default::default()
            },
        )
        .unwrap();
        let verified = verify(
            &token,
            VerifyOptions { type_tag: Some(type_tag::CLUSTER_PEER), secret: Some("s3cr3t") },
        )
        .unwrap();
        assert_eq!(verified.issuer.as_deref(), Some("quty-1-aaaa0000"));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = create(
            serde_json::json!({}),
            CreateOptions { type_tag: type_tag::CLUSTER_PEER, secret: Some("right"), ..Default::default() },
        )
        .unwrap();
        let err = verify(&token, VerifyOptions { secret: Some("wrong"), type_tag: None });
        assert!(err.is_err());
    }

    #[test]
    fn single_bit_flip_is_rejected() {
        let token = create(
            serde_json::json!({}),
            CreateOptions { type_tag: type_tag::CLUSTER_PEER, secret: Some("right"), ..Default::default() },
        )
        .unwrap();
        let mut bytes = token.into_bytes();
        let flip_at = bytes.len() - 1;
        bytes[flip_at] ^= 0x01;
        let tampered = String::from_utf8(bytes).unwrap();
        assert!(verify(&tampered, VerifyOptions { secret: Some("right"), type_tag: None }).is_err());
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let token = create(
            serde_json::json!({}),
            CreateOptions { type_tag: type_tag::PUBLISHER, ..Default::default() },
        )
        .unwrap();
        let err = verify(&token, VerifyOptions { type_tag: Some(type_tag::CLUSTER_PEER), secret: None });
        assert!(matches!(err, Err(TokenError::Invalid(_))));
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = create(
            serde_json::json!({}),
            CreateOptions { type_tag: type_tag::CLUSTER_PEER, expire_at_ms: Some(1), ..Default::default() },
        )
        .unwrap();
        assert!(verify(&token, VerifyOptions::default()).is_err());
    }
}
