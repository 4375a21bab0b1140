use super::{
    error::AuthError,
    password::hash_password,
    state::AuthState,
    storage::{self, SignupOutcome},
    types::{RegisterRequest, RegisterResponse},
    utils::{normalize_email, valid_email, valid_password, valid_username},
};
use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

#[utoipa::path(
    post,
    path = "/v1/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created, verification code emailed", body = RegisterResponse),
        (status = 400, description = "Invalid payload"),
        (status = 409, description = "Email already registered or username already taken"),
    ),
    tag = "auth"
)]
pub async fn register(
    Extension(pool): Extension<PgPool>,
    Extension(state): Extension<Arc<AuthState>>,
    payload: Option<Json<RegisterRequest>>,
) -> Result<Response, AuthError> {
    let Some(Json(request)) = payload else {
        return Err(AuthError::BadRequest("Missing payload"));
    };

    let email = normalize_email(&request.email);

    if !valid_email(&email) {
        return Err(AuthError::BadRequest("Invalid email"));
    }

    if !valid_password(&request.password) {
        return Err(AuthError::BadRequest(
            "Password must be between 8 and 128 characters",
        ));
    }

    let display_name = request.name.trim();

    if display_name.is_empty() {
        return Err(AuthError::BadRequest("Name is required"));
    }

    let username = match request.username.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(handle) if valid_username(handle) => Some(handle),
        Some(_) => {
            return Err(AuthError::BadRequest(
                "Username must be 3 to 32 letters, digits or underscores",
            ));
        }
    };

    let password_hash = hash_password(&request.password)?;

    let outcome = storage::insert_user(
        &pool,
        &email,
        &password_hash,
        display_name,
        username,
        state.config().verification_code_ttl_seconds(),
    )
    .await?;

    match outcome {
        SignupOutcome::Created { user_id } => {
            info!(%user_id, "account registered, verification pending");

            Ok((StatusCode::CREATED, Json(RegisterResponse { user_id })).into_response())
        }
        SignupOutcome::EmailTaken => Err(AuthError::EmailTaken),
        SignupOutcome::UsernameTaken => Err(AuthError::UsernameTaken),
    }
}
