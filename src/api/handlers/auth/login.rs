use super::{
    error::AuthError,
    password::{verify_password, verify_password_opaque},
    session::issue_session,
    state::AuthState,
    storage,
    types::{LoginRequest, LoginResponse, UserSummary},
    utils::normalize_email,
};
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Signed in", body = LoginResponse),
        (status = 400, description = "Invalid payload"),
        (status = 401, description = "Invalid credentials. Unknown email, wrong password and password-less accounts answer identically"),
        (status = 403, description = "Account not verified, suspended or banned"),
    ),
    tag = "auth"
)]
pub async fn login(
    Extension(pool): Extension<PgPool>,
    Extension(state): Extension<Arc<AuthState>>,
    headers: HeaderMap,
    payload: Option<Json<LoginRequest>>,
) -> Result<Response, AuthError> {
    let Some(Json(request)) = payload else {
        return Err(AuthError::BadRequest("Missing payload"));
    };

    let email = normalize_email(&request.email);

    let record = storage::lookup_user_for_login(&pool, &email).await?;

    let Some(record) = record else {
        let _ = verify_password_opaque(&request.password, None);

        return Err(AuthError::InvalidCredentials);
    };

    // OAuth-only accounts have no hash and must look like a bad password.
    let Some(password_hash) = record.password_hash.as_deref() else {
        let _ = verify_password_opaque(&request.password, None);

        return Err(AuthError::InvalidCredentials);
    };

    match record.status.as_str() {
        "banned" => return Err(AuthError::AccountBanned),
        "suspended" => return Err(AuthError::AccountSuspended),
        _ => {}
    }

    if !record.email_verified {
        return Err(AuthError::EmailNotVerified);
    }

    if !verify_password(&request.password, password_hash) {
        return Err(AuthError::InvalidCredentials);
    }

    let tokens = issue_session(&pool, &state, record.user_id, &headers).await?;

    info!(user_id = %record.user_id, "password sign-in");

    Ok((
        StatusCode::OK,
        Json(LoginResponse {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            token_type: tokens.token_type,
            expires_in: tokens.expires_in,
            user: UserSummary {
                id: record.user_id,
                email: record.email,
                username: record.username,
                display_name: record.display_name,
                role: record.role,
            },
        }),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::login;
    use crate::api::handlers::auth::{AuthConfig, AuthState};
    use anyhow::Result;
    use axum::{
        extract::Extension,
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
    };
    use secrecy::SecretString;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;

    fn test_state() -> Result<Arc<AuthState>> {
        let config = AuthConfig::new(
            "http://localhost:5173".to_string(),
            SecretString::from("test-secret".to_string()),
        );

        Ok(Arc::new(AuthState::new(config)?))
    }

    fn lazy_pool() -> Result<sqlx::PgPool> {
        Ok(PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?)
    }

    #[tokio::test]
    async fn test_login_missing_payload() -> Result<()> {
        let response = login(
            Extension(lazy_pool()?),
            Extension(test_state()?),
            HeaderMap::new(),
            None,
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        Ok(())
    }
}
