use super::{
    error::AuthError,
    session::issue_session,
    state::AuthState,
    storage::{self, ResendOutcome, VerifyOutcome},
    types::{MessageResponse, ResendVerificationRequest, TokenResponse, VerifyEmailRequest},
    utils::{normalize_email, valid_email},
};
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, info};

#[utoipa::path(
    post,
    path = "/v1/auth/verify-email",
    request_body = VerifyEmailRequest,
    responses(
        (status = 200, description = "Email verified, account activated and signed in", body = TokenResponse),
        (status = 400, description = "Invalid payload"),
        (status = 401, description = "Invalid or expired code"),
    ),
    tag = "auth"
)]
pub async fn verify_email(
    Extension(pool): Extension<PgPool>,
    Extension(state): Extension<Arc<AuthState>>,
    headers: HeaderMap,
    payload: Option<Json<VerifyEmailRequest>>,
) -> Result<Response, AuthError> {
    let Some(Json(request)) = payload else {
        return Err(AuthError::BadRequest("Missing payload"));
    };

    let email = normalize_email(&request.email);
    let code = request.code.trim();

    if !valid_email(&email) || code.is_empty() {
        return Err(AuthError::BadRequest("Email and code are required"));
    }

    match storage::verify_email_with_code(&pool, &email, code).await? {
        VerifyOutcome::InvalidCode => Err(AuthError::InvalidOrExpiredCode),
        VerifyOutcome::Verified { user_id } => {
            info!(%user_id, "email verified, account active");

            let tokens = issue_session(&pool, &state, user_id, &headers).await?;

            Ok((StatusCode::OK, Json(tokens)).into_response())
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/resend-verification",
    request_body = ResendVerificationRequest,
    responses(
        (status = 200, description = "Accepted. The body is identical whether or not the address exists", body = MessageResponse),
        (status = 400, description = "Address is already verified"),
    ),
    tag = "auth"
)]
pub async fn resend_verification(
    Extension(pool): Extension<PgPool>,
    Extension(state): Extension<Arc<AuthState>>,
    payload: Option<Json<ResendVerificationRequest>>,
) -> Result<Response, AuthError> {
    let Some(Json(request)) = payload else {
        return Ok(accepted());
    };

    let email = normalize_email(&request.email);

    if !valid_email(&email) {
        return Ok(accepted());
    }

    let outcome = storage::enqueue_verification_resend(
        &pool,
        &email,
        state.config().verification_code_ttl_seconds(),
        state.config().resend_cooldown_seconds(),
    )
    .await?;

    match outcome {
        ResendOutcome::Queued => info!("verification code re-sent"),
        ResendOutcome::Cooldown => debug!("verification resend suppressed by cooldown"),
        ResendOutcome::AlreadyVerified => {
            return Err(AuthError::BadRequest("Email already verified"));
        }
        ResendOutcome::Noop => debug!("verification resend had nothing to do"),
    }

    Ok(accepted())
}

/// One fixed response when the address is unknown or unverified, the
/// endpoint must not confirm whether an address is registered. An already
/// verified address is not a secret, it gets an explicit rejection.
fn accepted() -> Response {
    (
        StatusCode::OK,
        Json(MessageResponse {
            message: "If the address needs verification, a new code is on its way.".to_string(),
        }),
    )
        .into_response()
}
