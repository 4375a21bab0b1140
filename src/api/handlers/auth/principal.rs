use super::{jwt, state::AuthState, storage, utils};
use axum::http::{HeaderMap, StatusCode};
use sqlx::PgPool;
use tracing::error;
use uuid::Uuid;

/// Platform roles in ascending order of authority. The derived ordering
/// follows declaration order, so `Role::Admin >= Role::Moderator` holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    User,
    Moderator,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn parse(role: &str) -> Option<Self> {
        match role {
            "user" => Some(Self::User),
            "moderator" => Some(Self::Moderator),
            "admin" => Some(Self::Admin),
            "super_admin" => Some(Self::SuperAdmin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Moderator => "moderator",
            Self::Admin => "admin",
            Self::SuperAdmin => "super_admin",
        }
    }
}

/// The authenticated caller behind a valid access token and live session.
#[derive(Debug)]
pub struct Principal {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: String,
    pub role: Role,
}

/// Authenticate a request from its `Authorization` header. A token is only
/// good while the session it references is still in the database, so both
/// the signature check and the session lookup must succeed.
pub(crate) async fn require_auth(
    headers: &HeaderMap,
    pool: &PgPool,
    state: &AuthState,
) -> Result<Principal, StatusCode> {
    let Some(token) = utils::bearer_token(headers) else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(claims) = jwt::decode_access_token(state.config().access_token_secret(), &token)
    else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Ok(session_id) = claims.sid.parse::<Uuid>() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Ok(user_id) = claims.sub.parse::<Uuid>() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let identity = match storage::lookup_live_session(pool, session_id).await {
        Ok(Some(identity)) => identity,
        Ok(None) => return Err(StatusCode::UNAUTHORIZED),
        Err(err) => {
            error!("failed to resolve session: {err:#}");

            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    // The session row is the source of truth for who the token belongs to.
    if identity.user_id != user_id {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let Some(role) = Role::parse(&identity.role) else {
        error!(user_id = %identity.user_id, role = %identity.role, "unknown role on user row");

        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    };

    Ok(Principal {
        user_id: identity.user_id,
        email: identity.email,
        display_name: identity.display_name,
        role,
    })
}

#[cfg(test)]
mod tests {
    use super::{require_auth, Role};
    use crate::api::handlers::auth::{AuthConfig, AuthState};
    use anyhow::Result;
    use axum::http::{HeaderMap, StatusCode};
    use secrecy::SecretString;
    use sqlx::postgres::PgPoolOptions;

    fn test_state() -> Result<AuthState> {
        let config = AuthConfig::new(
            "http://localhost:5173".to_string(),
            SecretString::from("test-secret".to_string()),
        );

        AuthState::new(config)
    }

    fn lazy_pool() -> Result<sqlx::PgPool> {
        Ok(PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?)
    }

    #[test]
    fn test_role_ordering() {
        assert!(Role::User < Role::Moderator);
        assert!(Role::Moderator < Role::Admin);
        assert!(Role::Admin < Role::SuperAdmin);
        assert!(Role::Admin >= Role::Moderator);
    }

    #[test]
    fn test_role_parse_round_trip() {
        for role in [Role::User, Role::Moderator, Role::Admin, Role::SuperAdmin] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }

        assert_eq!(Role::parse("root"), None);
        assert_eq!(Role::parse(""), None);
    }

    #[tokio::test]
    async fn test_require_auth_missing_header() -> Result<()> {
        let result = require_auth(&HeaderMap::new(), &lazy_pool()?, &test_state()?).await;

        assert_eq!(result.map(|_| ()), Err(StatusCode::UNAUTHORIZED));

        Ok(())
    }

    #[tokio::test]
    async fn test_require_auth_garbage_token() -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer not-a-jwt".parse()?);

        let result = require_auth(&headers, &lazy_pool()?, &test_state()?).await;

        assert_eq!(result.map(|_| ()), Err(StatusCode::UNAUTHORIZED));

        Ok(())
    }
}
