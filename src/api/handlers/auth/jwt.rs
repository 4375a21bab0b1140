use anyhow::{Context, Result};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Claims carried by an access token: the user (`sub`) and the session it
/// was minted from (`sid`). Revoking the session kills every access token
/// that references it.
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct AccessTokenClaims {
    pub(super) sub: String,
    pub(super) sid: String,
    pub(super) iat: i64,
    pub(super) exp: i64,
}

fn now_unix_seconds() -> Result<i64> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before the unix epoch")?;

    i64::try_from(now.as_secs()).context("unix time out of range")
}

pub(super) fn issue_access_token(
    secret: &SecretString,
    user_id: Uuid,
    session_id: Uuid,
    ttl_seconds: i64,
) -> Result<String> {
    let iat = now_unix_seconds()?;

    let claims = AccessTokenClaims {
        sub: user_id.to_string(),
        sid: session_id.to_string(),
        iat,
        exp: iat + ttl_seconds,
    };

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.expose_secret().as_bytes()),
    )
    .context("failed to sign access token")
}

/// Signature and expiry check only. Session liveness is a separate lookup.
pub(super) fn decode_access_token(secret: &SecretString, token: &str) -> Option<AccessTokenClaims> {
    let validation = Validation::new(Algorithm::HS256);

    decode::<AccessTokenClaims>(
        token,
        &DecodingKey::from_secret(secret.expose_secret().as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .ok()
}
