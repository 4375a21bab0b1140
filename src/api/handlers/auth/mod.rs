//! Auth handlers and supporting modules.
//!
//! This module covers the account lifecycle: registration, email
//! verification, password and Google sign-in, refresh token rotation, and
//! password reset.
//!
//! ## Sessions
//!
//! Refresh tokens are opaque random strings, stored hashed, and rotated on
//! every use. A rotation is a single conditional `UPDATE` on the session
//! row, so when two clients race with the same token exactly one wins and
//! the loser gets a 401. Access tokens are short-lived JWTs that stay valid
//! only while the session row behind them exists.
//!
//! ## Verification codes
//!
//! Email verification and password reset share one ledger of single-use
//! six-digit codes. Issuing a new code retires any unused predecessor for
//! the same address and purpose, and consumption is a conditional `UPDATE`
//! so a code can never be spent twice, not even by concurrent requests.

mod error;
pub(crate) mod google;
mod jwt;
pub(crate) mod login;
pub(crate) mod password;
pub(crate) mod password_reset;
pub(crate) mod principal;
pub(crate) mod register;
pub(crate) mod session;
pub(crate) mod state;
pub(crate) mod storage;
pub(crate) mod types;
pub(crate) mod utils;
pub(crate) mod verification;

#[cfg(test)]
mod tests;

pub use principal::{Principal, Role};
pub use state::{AuthConfig, AuthState};
