use super::{
    error::AuthError,
    session::issue_session,
    state::AuthState,
    storage::{self, GoogleSignInOutcome},
    types::{GoogleSignInRequest, LoginResponse, UserSummary},
    utils::{normalize_email, valid_email},
};
use anyhow::{anyhow, Context};
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use secrecy::ExposeSecret;
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, info_span, Instrument};

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

#[derive(Debug, Deserialize)]
struct GoogleTokens {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct GoogleProfile {
    id: String,
    email: String,
    #[serde(default)]
    verified_email: bool,
    #[serde(default)]
    name: Option<String>,
}

#[utoipa::path(
    post,
    path = "/v1/auth/google",
    request_body = GoogleSignInRequest,
    responses(
        (status = 200, description = "Signed in, account created on first use", body = LoginResponse),
        (status = 400, description = "Invalid payload or Google sign-in not configured"),
        (status = 401, description = "Authorization code rejected by Google"),
        (status = 403, description = "Account suspended or banned"),
    ),
    tag = "auth"
)]
pub async fn google_sign_in(
    Extension(pool): Extension<PgPool>,
    Extension(state): Extension<Arc<AuthState>>,
    headers: HeaderMap,
    payload: Option<Json<GoogleSignInRequest>>,
) -> Result<Response, AuthError> {
    if !state.config().google_enabled() {
        return Err(AuthError::BadRequest("Google sign-in is not configured"));
    }

    let Some(Json(request)) = payload else {
        return Err(AuthError::BadRequest("Missing payload"));
    };

    let code = request.code.trim();

    if code.is_empty() {
        return Err(AuthError::BadRequest("Missing authorization code"));
    }

    let Some(tokens) = exchange_code(&state, code).await? else {
        return Err(AuthError::InvalidCredentials);
    };

    let profile = fetch_profile(&state, &tokens.access_token).await?;

    // Only addresses Google has verified may bypass the code flow.
    if !profile.verified_email {
        return Err(AuthError::EmailNotVerified);
    }

    let email = normalize_email(&profile.email);

    if !valid_email(&email) {
        return Err(AuthError::BadRequest("Google profile has no usable email"));
    }

    let display_name = profile
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(email.as_str());

    match storage::upsert_google_user(&pool, &email, &profile.id, display_name).await? {
        GoogleSignInOutcome::Blocked { status } => {
            if status == "banned" {
                Err(AuthError::AccountBanned)
            } else {
                Err(AuthError::AccountSuspended)
            }
        }
        GoogleSignInOutcome::SignedIn(user) => {
            let tokens = issue_session(&pool, &state, user.user_id, &headers).await?;

            info!(user_id = %user.user_id, "google sign-in");

            Ok((
                StatusCode::OK,
                Json(LoginResponse {
                    access_token: tokens.access_token,
                    refresh_token: tokens.refresh_token,
                    token_type: tokens.token_type,
                    expires_in: tokens.expires_in,
                    user: UserSummary {
                        id: user.user_id,
                        email: user.email,
                        username: user.username,
                        display_name: user.display_name,
                        role: user.role,
                    },
                }),
            )
                .into_response())
        }
    }
}

/// Trade the authorization code for Google tokens. `None` means Google
/// rejected the code, anything else unexpected is an internal error.
async fn exchange_code(state: &AuthState, code: &str) -> Result<Option<GoogleTokens>, AuthError> {
    let config = state.config();

    let params = [
        ("code", code),
        ("client_id", config.google_client_id()),
        ("client_secret", config.google_client_secret().expose_secret()),
        ("redirect_uri", config.google_redirect_url()),
        ("grant_type", "authorization_code"),
    ];

    let span = info_span!(
        "http.client",
        http.method = "POST",
        http.url = GOOGLE_TOKEN_URL
    );

    let response = state
        .http()
        .post(GOOGLE_TOKEN_URL)
        .form(&params)
        .send()
        .instrument(span)
        .await
        .context("failed to reach google token endpoint")?;

    if response.status().is_client_error() {
        return Ok(None);
    }

    if !response.status().is_success() {
        return Err(AuthError::Internal(anyhow!(
            "google token endpoint returned {}",
            response.status()
        )));
    }

    let tokens = response
        .json::<GoogleTokens>()
        .await
        .context("failed to parse google token response")?;

    Ok(Some(tokens))
}

async fn fetch_profile(state: &AuthState, access_token: &str) -> Result<GoogleProfile, AuthError> {
    let span = info_span!(
        "http.client",
        http.method = "GET",
        http.url = GOOGLE_USERINFO_URL
    );

    let response = state
        .http()
        .get(GOOGLE_USERINFO_URL)
        .bearer_auth(access_token)
        .send()
        .instrument(span)
        .await
        .context("failed to reach google userinfo endpoint")?;

    if !response.status().is_success() {
        return Err(AuthError::Internal(anyhow!(
            "google userinfo endpoint returned {}",
            response.status()
        )));
    }

    let profile = response
        .json::<GoogleProfile>()
        .await
        .context("failed to parse google profile")?;

    Ok(profile)
}
