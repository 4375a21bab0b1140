//! Authenticated self-service endpoints.

use super::auth::{principal::require_auth, AuthState};
use anyhow::{Context, Result};
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info_span, Instrument};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub id: Uuid,
    pub email: String,
    pub username: Option<String>,
    pub display_name: String,
    pub role: String,
    pub status: String,
    pub email_verified: bool,
    pub created_at: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ProfileRow {
    username: Option<String>,
    status: String,
    email_verified: bool,
    created_at: String,
}

#[utoipa::path(
    get,
    path = "/v1/me",
    responses(
        (status = 200, description = "Profile of the authenticated user", body = MeResponse),
        (status = 401, description = "Missing or invalid access token"),
    ),
    tag = "me"
)]
pub async fn get_me(
    Extension(pool): Extension<PgPool>,
    Extension(state): Extension<Arc<AuthState>>,
    headers: HeaderMap,
) -> Response {
    let principal = match require_auth(&headers, &pool, &state).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    match fetch_profile(&pool, principal.user_id).await {
        Ok(Some(profile)) => (
            StatusCode::OK,
            Json(MeResponse {
                id: principal.user_id,
                email: principal.email,
                username: profile.username,
                display_name: principal.display_name,
                role: principal.role.as_str().to_string(),
                status: profile.status,
                email_verified: profile.email_verified,
                created_at: profile.created_at,
            }),
        )
            .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!("failed to fetch profile: {err:#}");

            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn fetch_profile(pool: &PgPool, user_id: Uuid) -> Result<Option<ProfileRow>> {
    let query = r#"SELECT username::text AS username, status, email_verified, to_char(created_at AT TIME ZONE 'utc', 'YYYY-MM-DD"T"HH24:MI:SS"Z"') AS created_at FROM users WHERE id = $1"#;
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );

    sqlx::query_as::<_, ProfileRow>(query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to fetch user profile")
}
