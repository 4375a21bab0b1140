use super::{
    error::AuthError,
    jwt,
    state::AuthState,
    storage::{self, RotateOutcome},
    types::{RefreshRequest, TokenResponse},
    utils::{bearer_token, extract_client_ip, extract_user_agent},
};
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

/// Create a session row and mint the token pair for it. The refresh token
/// in the response is the only copy that ever leaves the database hash.
pub(super) async fn issue_session(
    pool: &PgPool,
    state: &AuthState,
    user_id: Uuid,
    headers: &HeaderMap,
) -> Result<TokenResponse, AuthError> {
    let ip = extract_client_ip(headers);
    let user_agent = extract_user_agent(headers);

    let session = storage::insert_session(
        pool,
        user_id,
        state.config().refresh_token_ttl_seconds(),
        ip.as_deref(),
        user_agent.as_deref(),
    )
    .await?;

    let access_token = jwt::issue_access_token(
        state.config().access_token_secret(),
        user_id,
        session.session_id,
        state.config().access_token_ttl_seconds(),
    )?;

    Ok(TokenResponse::new(
        access_token,
        session.refresh_token,
        state.config().access_token_ttl_seconds(),
    ))
}

#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Rotated token pair", body = TokenResponse),
        (status = 400, description = "Invalid payload"),
        (status = 401, description = "Unknown, expired or already rotated refresh token"),
    ),
    tag = "auth"
)]
pub async fn refresh(
    Extension(pool): Extension<PgPool>,
    Extension(state): Extension<Arc<AuthState>>,
    payload: Option<Json<RefreshRequest>>,
) -> Result<Response, AuthError> {
    let Some(Json(request)) = payload else {
        return Err(AuthError::BadRequest("Missing payload"));
    };

    let presented = request.refresh_token.trim();

    if presented.is_empty() {
        return Err(AuthError::UnauthorizedRefresh);
    }

    let outcome = storage::rotate_session(
        &pool,
        presented,
        state.config().refresh_token_ttl_seconds(),
    )
    .await?;

    match outcome {
        RotateOutcome::Invalid => Err(AuthError::UnauthorizedRefresh),
        RotateOutcome::Rotated {
            session_id,
            user_id,
            refresh_token,
        } => {
            let access_token = jwt::issue_access_token(
                state.config().access_token_secret(),
                user_id,
                session_id,
                state.config().access_token_ttl_seconds(),
            )?;

            Ok((
                StatusCode::OK,
                Json(TokenResponse::new(
                    access_token,
                    refresh_token,
                    state.config().access_token_ttl_seconds(),
                )),
            )
                .into_response())
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 204, description = "Session revoked, or there was nothing to revoke"),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn logout(
    Extension(pool): Extension<PgPool>,
    Extension(state): Extension<Arc<AuthState>>,
    headers: HeaderMap,
) -> StatusCode {
    // Best effort. Logout answers 204 even when the token is invalid or
    // the session is already gone.
    if let Some(token) = bearer_token(&headers) {
        if let Some(claims) = jwt::decode_access_token(state.config().access_token_secret(), &token)
        {
            if let Ok(session_id) = Uuid::parse_str(&claims.sid) {
                if let Err(err) = storage::delete_session(&pool, session_id).await {
                    error!("failed to delete session on logout: {err:#}");
                }
            }
        }
    }

    StatusCode::NO_CONTENT
}
