//! Authentication and session service for the Mercato marketplace.
//!
//! ## Accounts
//!
//! Users register with an email address and password and start out as
//! `pending_verification`. A six digit code sent by email promotes the
//! account to `active`; until then password sign-in is refused. Accounts
//! created through Google OAuth skip the code entirely, the provider has
//! already verified the address.
//!
//! ## Sessions and tokens
//!
//! A successful sign-in creates a session row bound to a long-lived
//! refresh token, stored only as a SHA-256 hash. Clients trade the
//! refresh token for short-lived signed access tokens and the refresh
//! token itself is rotated on every use. Revoking the session row is
//! enough to kill both tokens.
//!
//! ## Moderation
//!
//! Moderators and admins act through `/v1/admin`: listing accounts,
//! suspending, banning, reactivating and changing roles, with every
//! mutation recorded in an audit log.

pub mod api;
pub mod cli;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
