use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

/// Failures surfaced by the auth handlers.
///
/// The 401 variants share fixed, generic bodies, a caller cannot tell
/// which check rejected them. Infrastructure failures stay
/// [`AuthError::Internal`] and become a 500, never an auth failure.
#[derive(Debug, Error)]
pub(crate) enum AuthError {
    #[error("bad request: {0}")]
    BadRequest(&'static str),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid or expired code")]
    InvalidOrExpiredCode,
    #[error("invalid refresh token")]
    UnauthorizedRefresh,
    #[error("email not verified")]
    EmailNotVerified,
    #[error("account suspended")]
    AccountSuspended,
    #[error("account banned")]
    AccountBanned,
    #[error("email already registered")]
    EmailTaken,
    #[error("username already taken")]
    UsernameTaken,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            Self::InvalidCredentials => {
                (StatusCode::UNAUTHORIZED, "Invalid credentials").into_response()
            }
            Self::InvalidOrExpiredCode => {
                (StatusCode::UNAUTHORIZED, "Invalid or expired code").into_response()
            }
            Self::UnauthorizedRefresh => {
                (StatusCode::UNAUTHORIZED, "Invalid refresh token").into_response()
            }
            Self::EmailNotVerified => {
                (StatusCode::FORBIDDEN, "Email not verified").into_response()
            }
            Self::AccountSuspended => {
                (StatusCode::FORBIDDEN, "Account suspended").into_response()
            }
            Self::AccountBanned => (StatusCode::FORBIDDEN, "Account banned").into_response(),
            Self::EmailTaken => {
                (StatusCode::CONFLICT, "Email already registered").into_response()
            }
            Self::UsernameTaken => {
                (StatusCode::CONFLICT, "Username already taken").into_response()
            }
            Self::Internal(err) => {
                error!("internal error: {err:#}");

                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}
