use anyhow::{Context, Result};
use axum::http::{header, HeaderMap};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

const REFRESH_TOKEN_BYTES: usize = 32;

// Verification codes cover [100000, 999999].
const CODE_SPAN: u32 = 900_000;
const CODE_FLOOR: u32 = 100_000;

const MAX_USER_AGENT_CHARS: usize = 512;

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub(crate) fn valid_email(email: &str) -> bool {
    regex::Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email))
}

pub(crate) fn valid_password(password: &str) -> bool {
    password.len() >= 8 && password.len() <= 128
}

pub(crate) fn valid_username(username: &str) -> bool {
    regex::Regex::new(r"^[A-Za-z0-9_]{3,32}$").is_ok_and(|regex| regex.is_match(username))
}

/// Generate an opaque refresh token from 32 bytes of OS randomness.
pub(super) fn generate_refresh_token() -> Result<String> {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];

    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate refresh token")?;

    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Generate a six digit verification code.
///
/// Rejection sampling keeps the draw uniform over the whole range.
pub(super) fn generate_verification_code() -> Result<String> {
    let limit = u32::MAX - (u32::MAX % CODE_SPAN);

    loop {
        let mut bytes = [0u8; 4];

        OsRng
            .try_fill_bytes(&mut bytes)
            .context("failed to generate verification code")?;

        let value = u32::from_be_bytes(bytes);

        if value < limit {
            return Ok((CODE_FLOOR + value % CODE_SPAN).to_string());
        }
    }
}

/// SHA-256 digest used for refresh tokens and verification codes at rest.
pub(super) fn hash_token(value: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hasher.finalize().to_vec()
}

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = error {
        db_err.code().as_deref() == Some("23505")
    } else {
        false
    }
}

pub(super) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;

    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();

    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// First hop of `x-forwarded-for`, falling back to `x-real-ip`. Values
/// that do not parse as an IP address are dropped, the column is `inet`.
pub(super) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(ip) = forwarded
            .split(',')
            .next()
            .and_then(|first| first.trim().parse::<std::net::IpAddr>().ok())
        {
            return Some(ip.to_string());
        }
    }

    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<std::net::IpAddr>().ok())
        .map(|ip| ip.to_string())
}

pub(super) fn extract_user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().chars().take(MAX_USER_AGENT_CHARS).collect::<String>())
        .filter(|value| !value.is_empty())
}
