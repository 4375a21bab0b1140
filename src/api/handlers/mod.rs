//! API handlers for the auth service.
//!
//! `auth` holds the account lifecycle, `admin` the role-gated moderation
//! surface, `me` the authenticated profile, and `health` the probe endpoint.

pub mod admin;
pub mod auth;
pub mod health;
pub mod me;
