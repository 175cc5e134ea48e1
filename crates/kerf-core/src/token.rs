//! HMAC-SHA256 bearer tokens for the websocket upgrade.
//!
//! Tokens are compact JWTs signed with a shared secret, issuer "kerf".
//! `exp` is required; the optional `subscribed` claim marks paying
//! clients whose requests bypass the per-request expiry check.

use crate::error::{KerfError, KerfResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::hmac;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Token issuer expected and produced by this gateway.
pub const ISSUER: &str = "kerf";

/// Verified claims, as placed in a session's authorization snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthClaims {
    pub expiry: SystemTime,
    pub subscribed: bool,
    pub subject: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

#[derive(Serialize, Deserialize)]
struct Claims {
    iss: String,
    exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subscribed: Option<bool>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn sign(secret: &[u8], signing_input: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, signing_input.as_bytes());
    URL_SAFE_NO_PAD.encode(tag.as_ref())
}

/// Mint a token for `subject` valid for `ttl`.
pub fn generate_token(
    secret: &[u8],
    subject: &str,
    ttl: Duration,
    subscribed: bool,
) -> KerfResult<String> {
    let header = Header {
        alg: "HS256".into(),
        typ: "JWT".into(),
    };
    let claims = Claims {
        iss: ISSUER.into(),
        exp: now_secs() + ttl.as_secs(),
        sub: Some(subject.to_string()),
        subscribed: subscribed.then_some(true),
    };

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?),
    );
    let signature = sign(secret, &signing_input);
    Ok(format!("{signing_input}.{signature}"))
}

/// Verify a token's signature, issuer and expiry.
///
/// Expired tokens are rejected here; a token that expires after the
/// upgrade is caught by the per-request check in the dispatcher.
pub fn verify_token(secret: &[u8], token: &str) -> KerfResult<AuthClaims> {
    let mut parts = token.split('.');
    let (header_b64, claims_b64, signature_b64) =
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(c), Some(s), None) => (h, c, s),
            _ => return Err(KerfError::Token("malformed token".into())),
        };

    let signing_input = format!("{header_b64}.{claims_b64}");
    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| KerfError::Token("malformed signature".into()))?;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, signing_input.as_bytes(), &signature)
        .map_err(|_| KerfError::Token("invalid signature".into()))?;

    let header_json = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| KerfError::Token("malformed header".into()))?;
    let header: Header =
        serde_json::from_slice(&header_json).map_err(|_| KerfError::Token("invalid header".into()))?;
    if header.alg != "HS256" {
        return Err(KerfError::Token(format!(
            "unsupported algorithm: {}",
            header.alg
        )));
    }

    let claims_json = URL_SAFE_NO_PAD
        .decode(claims_b64)
        .map_err(|_| KerfError::Token("malformed claims".into()))?;
    let claims: Claims =
        serde_json::from_slice(&claims_json).map_err(|_| KerfError::Token("invalid claims".into()))?;

    if claims.iss != ISSUER {
        return Err(KerfError::Token(format!("unknown issuer: {}", claims.iss)));
    }
    if claims.exp < now_secs() {
        return Err(KerfError::Token("token expired".into()));
    }

    Ok(AuthClaims {
        expiry: UNIX_EPOCH + Duration::from_secs(claims.exp),
        subscribed: claims.subscribed.unwrap_or(false),
        subject: claims.sub,
    })
}
