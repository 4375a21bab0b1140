//! Auth flow tests that need live Postgres. Each test connects through
//! `MERCATO_TEST_DSN` and skips silently when the variable is unset; a
//! plain `cargo test` run never needs a database.

use super::error::AuthError;
use super::login::login;
use super::password::hash_password;
use super::state::{AuthConfig, AuthState};
use super::storage::{
    cleanup_verification_codes, delete_session, enqueue_password_reset,
    enqueue_verification_resend, insert_session, insert_user, lookup_live_session,
    reset_password_with_code, rotate_session, verify_email_with_code, ResendOutcome, ResetOutcome,
    RotateOutcome, SignupOutcome, VerifyOutcome,
};
use super::types::LoginRequest;
use anyhow::{anyhow, Context, Result};
use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use secrecy::SecretString;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgConnection, PgPool};
use std::sync::Arc;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));
const SCHEMA_LOCK_KEY: i64 = 0x4d45_5243;

const CODE_TTL: i64 = 60;
const SESSION_TTL: i64 = 3600;
const PASSWORD: &str = "CorrectHorseBatteryStaple";

struct TestDb {
    pool: PgPool,
}

impl TestDb {
    async fn new() -> Result<Self> {
        let Ok(dsn) = std::env::var("MERCATO_TEST_DSN") else {
            eprintln!("Skipping integration test: MERCATO_TEST_DSN is not set");
            return Err(anyhow!("MERCATO_TEST_DSN is not set"));
        };

        apply_schema(&dsn).await?;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&dsn)
            .await
            .context("failed to connect test pool")?;

        Ok(Self { pool })
    }
}

/// The schema is idempotent, but two test binaries applying it at the
/// same time still race on the catalogs. An advisory lock serializes it.
async fn apply_schema(dsn: &str) -> Result<()> {
    let mut connection = PgConnection::connect(dsn)
        .await
        .context("failed to connect for schema setup")?;

    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(SCHEMA_LOCK_KEY)
        .execute(&mut connection)
        .await
        .context("failed to take schema lock")?;

    let mut outcome = Ok(());

    for (index, statement) in split_sql_statements(SCHEMA_SQL).iter().enumerate() {
        if let Err(err) = sqlx::query(statement).execute(&mut connection).await {
            outcome = Err(anyhow::Error::new(err)
                .context(format!("failed to execute schema statement {}", index + 1)));

            break;
        }
    }

    sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(SCHEMA_LOCK_KEY)
        .execute(&mut connection)
        .await
        .context("failed to release schema lock")?;

    outcome
}

fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in sql.lines() {
        current.push_str(line);
        current.push('\n');

        if line.trim().ends_with(';') {
            let statement = current.trim();
            if !statement.is_empty() {
                statements.push(statement.to_string());
            }
            current.clear();
        }
    }

    let leftover = current.trim();
    if !leftover.is_empty() {
        statements.push(leftover.to_string());
    }

    statements
}

fn unique_email(prefix: &str) -> String {
    format!("{prefix}-{}@example.com", Uuid::new_v4().simple())
}

fn test_state() -> Result<Arc<AuthState>> {
    let config = AuthConfig::new(
        "https://mercato.live".to_string(),
        SecretString::from("integration-test-secret".to_string()),
    );

    Ok(Arc::new(AuthState::new(config)?))
}

async fn create_pending_user(pool: &PgPool, email: &str, password_hash: &str) -> Result<Uuid> {
    match insert_user(pool, email, password_hash, "Test User", None, CODE_TTL).await? {
        SignupOutcome::Created { user_id } => Ok(user_id),
        SignupOutcome::EmailTaken | SignupOutcome::UsernameTaken => {
            Err(anyhow!("unexpected signup conflict for {email}"))
        }
    }
}

async fn create_active_user(
    pool: &PgPool,
    email: &str,
    password_hash: Option<&str>,
) -> Result<Uuid> {
    sqlx::query_scalar::<_, Uuid>(
        "INSERT INTO users (email, display_name, password_hash, email_verified, status) VALUES ($1, 'Test User', $2, TRUE, 'active') RETURNING id",
    )
    .bind(email)
    .bind(password_hash)
    .fetch_one(pool)
    .await
    .context("failed to seed active user")
}

/// Read the code most recently queued for delivery to `email`.
async fn latest_code(pool: &PgPool, email: &str, template: &str) -> Result<String> {
    sqlx::query_scalar::<_, String>(
        "SELECT payload_json->>'code' FROM email_outbox WHERE to_email = $1 AND template = $2 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(email)
    .bind(template)
    .fetch_one(pool)
    .await
    .context("failed to read queued code")
}

async fn session_count(pool: &PgPool, user_id: Uuid) -> Result<i64> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM user_sessions WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .context("failed to count sessions")
}

async fn try_login(
    pool: &PgPool,
    state: &Arc<AuthState>,
    email: &str,
    password: &str,
) -> Result<Response, AuthError> {
    login(
        Extension(pool.clone()),
        Extension(state.clone()),
        HeaderMap::new(),
        Some(Json(LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        })),
    )
    .await
}

#[test]
fn schema_splits_into_full_statement_set() {
    let statements = split_sql_statements(SCHEMA_SQL);

    assert_eq!(statements.len(), 11);
    assert!(statements
        .iter()
        .all(|statement| statement.contains("CREATE")));
    assert!(statements
        .last()
        .is_some_and(|statement| statement.contains("admin_audit_log")));
}

#[tokio::test]
async fn register_concurrent_email_unique() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let email = unique_email("alice");
    let password_hash = hash_password(PASSWORD)?;

    let task_one = insert_user(&db.pool, &email, &password_hash, "Alice", None, CODE_TTL);
    let task_two = insert_user(&db.pool, &email, &password_hash, "Alice", None, CODE_TTL);

    let (result_one, result_two) = tokio::join!(task_one, task_two);
    let outcomes = [result_one?, result_two?];

    let created = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, SignupOutcome::Created { .. }))
        .count();
    let conflicts = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, SignupOutcome::EmailTaken))
        .count();

    assert_eq!(created, 1);
    assert_eq!(conflicts, 1);

    Ok(())
}

#[tokio::test]
async fn register_username_stored_and_unique() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let email = unique_email("hazel");
    let password_hash = hash_password(PASSWORD)?;
    let handle = format!("hazel_{}", &Uuid::new_v4().simple().to_string()[..10]);

    let outcome = insert_user(&db.pool, &email, &password_hash, "Hazel", Some(&handle), CODE_TTL)
        .await?;
    let SignupOutcome::Created { user_id } = outcome else {
        return Err(anyhow!("expected signup to succeed"));
    };

    let stored = sqlx::query_scalar::<_, Option<String>>(
        "SELECT username::text FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_one(&db.pool)
    .await
    .context("failed to read username")?;
    assert_eq!(stored.as_deref(), Some(handle.as_str()));

    // Same handle under a different email must lose to the unique index,
    // case-insensitively.
    let other_email = unique_email("hazel2");
    let upper = handle.to_uppercase();
    let outcome =
        insert_user(&db.pool, &other_email, &password_hash, "Hazel", Some(&upper), CODE_TTL)
            .await?;
    assert_eq!(outcome, SignupOutcome::UsernameTaken);

    Ok(())
}

#[tokio::test]
async fn verify_code_promotes_then_rejects_reuse() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let email = unique_email("bob");
    let password_hash = hash_password(PASSWORD)?;
    let user_id = create_pending_user(&db.pool, &email, &password_hash).await?;
    let code = latest_code(&db.pool, &email, "verify_email").await?;

    let first = verify_email_with_code(&db.pool, &email, &code).await?;
    assert_eq!(first, VerifyOutcome::Verified { user_id });

    let row = sqlx::query_as::<_, (bool, String)>(
        "SELECT email_verified, status FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_one(&db.pool)
    .await?;
    assert_eq!(row, (true, "active".to_string()));

    let second = verify_email_with_code(&db.pool, &email, &code).await?;
    assert_eq!(second, VerifyOutcome::InvalidCode);

    Ok(())
}

#[tokio::test]
async fn verify_code_expired_rejected() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let email = unique_email("carol");
    let password_hash = hash_password(PASSWORD)?;
    create_pending_user(&db.pool, &email, &password_hash).await?;
    let code = latest_code(&db.pool, &email, "verify_email").await?;

    sqlx::query("UPDATE verification_codes SET expires_at = NOW() - INTERVAL '1 second' WHERE email = $1")
        .bind(&email)
        .execute(&db.pool)
        .await
        .context("failed to expire code")?;

    let outcome = verify_email_with_code(&db.pool, &email, &code).await?;
    assert_eq!(outcome, VerifyOutcome::InvalidCode);

    Ok(())
}

#[tokio::test]
async fn reissue_supersedes_prior_code() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let email = unique_email("dave");
    let password_hash = hash_password(PASSWORD)?;
    create_pending_user(&db.pool, &email, &password_hash).await?;
    let first_code = latest_code(&db.pool, &email, "verify_email").await?;

    let outcome = enqueue_verification_resend(&db.pool, &email, CODE_TTL, 0).await?;
    assert_eq!(outcome, ResendOutcome::Queued);
    let second_code = latest_code(&db.pool, &email, "verify_email").await?;

    let superseded = verify_email_with_code(&db.pool, &email, &first_code).await?;
    assert_eq!(superseded, VerifyOutcome::InvalidCode);

    let promoted = verify_email_with_code(&db.pool, &email, &second_code).await?;
    assert!(matches!(promoted, VerifyOutcome::Verified { .. }));

    Ok(())
}

#[tokio::test]
async fn resend_respects_cooldown() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    // Signup issued a code moments ago; a resend inside the window must wait.
    let email = unique_email("erin");
    let password_hash = hash_password(PASSWORD)?;
    create_pending_user(&db.pool, &email, &password_hash).await?;

    let outcome = enqueue_verification_resend(&db.pool, &email, CODE_TTL, 300).await?;
    assert_eq!(outcome, ResendOutcome::Cooldown);

    let unknown = unique_email("nobody");
    let outcome = enqueue_verification_resend(&db.pool, &unknown, CODE_TTL, 300).await?;
    assert_eq!(outcome, ResendOutcome::Noop);

    Ok(())
}

#[tokio::test]
async fn resend_for_verified_address_rejected() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let email = unique_email("frank");
    create_active_user(&db.pool, &email, None).await?;

    let outcome = enqueue_verification_resend(&db.pool, &email, CODE_TTL, 0).await?;
    assert_eq!(outcome, ResendOutcome::AlreadyVerified);

    // No code row may be issued for an address that is already verified.
    let issued = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM verification_codes WHERE email = $1",
    )
    .bind(&email)
    .fetch_one(&db.pool)
    .await
    .context("failed to count codes")?;
    assert_eq!(issued, 0);

    Ok(())
}

#[tokio::test]
async fn wrong_purpose_code_rejected() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let email = unique_email("grace");
    let password_hash = hash_password(PASSWORD)?;
    create_pending_user(&db.pool, &email, &password_hash).await?;
    let code = latest_code(&db.pool, &email, "verify_email").await?;

    let outcome = reset_password_with_code(&db.pool, &email, &code, &password_hash).await?;
    assert_eq!(outcome, ResetOutcome::InvalidCode);

    Ok(())
}

#[tokio::test]
async fn rotate_invalidates_presented_token() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let email = unique_email("henry");
    let user_id = create_active_user(&db.pool, &email, None).await?;
    let session = insert_session(&db.pool, user_id, SESSION_TTL, None, None).await?;

    let rotated = rotate_session(&db.pool, &session.refresh_token, SESSION_TTL).await?;
    let RotateOutcome::Rotated {
        session_id,
        user_id: rotated_user,
        refresh_token,
    } = rotated
    else {
        return Err(anyhow!("expected rotation to succeed"));
    };
    assert_eq!(session_id, session.session_id);
    assert_eq!(rotated_user, user_id);

    let replay = rotate_session(&db.pool, &session.refresh_token, SESSION_TTL).await?;
    assert!(matches!(replay, RotateOutcome::Invalid));

    let next = rotate_session(&db.pool, &refresh_token, SESSION_TTL).await?;
    assert!(matches!(next, RotateOutcome::Rotated { .. }));

    Ok(())
}

#[tokio::test]
async fn concurrent_rotate_single_winner() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let email = unique_email("iris");
    let user_id = create_active_user(&db.pool, &email, None).await?;
    let session = insert_session(&db.pool, user_id, SESSION_TTL, None, None).await?;

    let task_one = rotate_session(&db.pool, &session.refresh_token, SESSION_TTL);
    let task_two = rotate_session(&db.pool, &session.refresh_token, SESSION_TTL);

    let (result_one, result_two) = tokio::join!(task_one, task_two);
    let outcomes = [result_one?, result_two?];

    let winners = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, RotateOutcome::Rotated { .. }))
        .count();
    let losers = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, RotateOutcome::Invalid))
        .count();

    assert_eq!(winners, 1);
    assert_eq!(losers, 1);

    Ok(())
}

#[tokio::test]
async fn expired_session_deleted_on_refresh() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let email = unique_email("judy");
    let user_id = create_active_user(&db.pool, &email, None).await?;
    let session = insert_session(&db.pool, user_id, SESSION_TTL, None, None).await?;

    sqlx::query("UPDATE user_sessions SET expires_at = NOW() - INTERVAL '1 second' WHERE id = $1")
        .bind(session.session_id)
        .execute(&db.pool)
        .await
        .context("failed to expire session")?;

    let outcome = rotate_session(&db.pool, &session.refresh_token, SESSION_TTL).await?;
    assert!(matches!(outcome, RotateOutcome::Invalid));

    assert_eq!(session_count(&db.pool, user_id).await?, 0);

    Ok(())
}

#[tokio::test]
async fn revoked_session_not_resolvable() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let email = unique_email("kate");
    let user_id = create_active_user(&db.pool, &email, None).await?;
    let session = insert_session(&db.pool, user_id, SESSION_TTL, None, None).await?;

    let live = lookup_live_session(&db.pool, session.session_id).await?;
    assert!(live.is_some_and(|identity| identity.user_id == user_id));

    delete_session(&db.pool, session.session_id).await?;
    assert!(lookup_live_session(&db.pool, session.session_id)
        .await?
        .is_none());

    // A second delete is a no-op, not an error.
    delete_session(&db.pool, session.session_id).await?;

    Ok(())
}

#[tokio::test]
async fn suspended_user_invalidates_session() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let email = unique_email("liam");
    let user_id = create_active_user(&db.pool, &email, None).await?;
    let session = insert_session(&db.pool, user_id, SESSION_TTL, None, None).await?;

    sqlx::query("UPDATE users SET status = 'suspended' WHERE id = $1")
        .bind(user_id)
        .execute(&db.pool)
        .await
        .context("failed to suspend user")?;

    assert!(lookup_live_session(&db.pool, session.session_id)
        .await?
        .is_none());

    let outcome = rotate_session(&db.pool, &session.refresh_token, SESSION_TTL).await?;
    assert!(matches!(outcome, RotateOutcome::Invalid));

    Ok(())
}

#[tokio::test]
async fn reset_password_revokes_sessions() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let email = unique_email("mona");
    let old_hash = hash_password(PASSWORD)?;
    let user_id = create_active_user(&db.pool, &email, Some(&old_hash)).await?;
    insert_session(&db.pool, user_id, SESSION_TTL, None, None).await?;
    insert_session(&db.pool, user_id, SESSION_TTL, None, None).await?;
    assert_eq!(session_count(&db.pool, user_id).await?, 2);

    let outcome = enqueue_password_reset(&db.pool, &email, CODE_TTL, 0).await?;
    assert_eq!(outcome, ResendOutcome::Queued);

    let code = latest_code(&db.pool, &email, "reset_password").await?;
    let new_hash = hash_password("EntirelyDifferentPassphrase")?;
    let outcome = reset_password_with_code(&db.pool, &email, &code, &new_hash).await?;
    assert_eq!(outcome, ResetOutcome::Updated);

    assert_eq!(session_count(&db.pool, user_id).await?, 0);

    let stored =
        sqlx::query_scalar::<_, Option<String>>("SELECT password_hash FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_one(&db.pool)
            .await?;
    assert_eq!(stored.as_deref(), Some(new_hash.as_str()));

    Ok(())
}

#[tokio::test]
async fn forgot_password_unknown_email_leaves_no_trace() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let email = unique_email("ghost");
    let outcome = enqueue_password_reset(&db.pool, &email, CODE_TTL, 0).await?;
    assert_eq!(outcome, ResendOutcome::Noop);

    let codes =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM verification_codes WHERE email = $1")
            .bind(&email)
            .fetch_one(&db.pool)
            .await?;
    let queued =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM email_outbox WHERE to_email = $1")
            .bind(&email)
            .fetch_one(&db.pool)
            .await?;
    assert_eq!((codes, queued), (0, 0));

    Ok(())
}

#[tokio::test]
async fn cleanup_purges_expired_and_stale_codes() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let expired = unique_email("old");
    let consumed = unique_email("done");
    let fresh = unique_email("new");
    let password_hash = hash_password(PASSWORD)?;
    create_pending_user(&db.pool, &expired, &password_hash).await?;
    create_pending_user(&db.pool, &consumed, &password_hash).await?;
    create_pending_user(&db.pool, &fresh, &password_hash).await?;

    sqlx::query("UPDATE verification_codes SET expires_at = NOW() - INTERVAL '1 hour' WHERE email = $1")
        .bind(&expired)
        .execute(&db.pool)
        .await?;
    sqlx::query("UPDATE verification_codes SET consumed_at = NOW() - INTERVAL '25 hours' WHERE email = $1")
        .bind(&consumed)
        .execute(&db.pool)
        .await?;

    let purged = cleanup_verification_codes(&db.pool).await?;
    assert!(purged >= 2);

    for (email, expected) in [(expired.as_str(), 0_i64), (consumed.as_str(), 0), (fresh.as_str(), 1)] {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM verification_codes WHERE email = $1",
        )
        .bind(email)
        .fetch_one(&db.pool)
        .await?;
        assert_eq!(count, expected, "rows left for {email}");
    }

    Ok(())
}

#[tokio::test]
async fn login_rejections_generic_and_distinct() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let state = test_state()?;
    let password_hash = hash_password(PASSWORD)?;

    let unknown = unique_email("unknown");
    let result = try_login(&db.pool, &state, &unknown, PASSWORD).await;
    assert!(matches!(result, Err(AuthError::InvalidCredentials)));

    let oauth_only = unique_email("oauth");
    create_active_user(&db.pool, &oauth_only, None).await?;
    let result = try_login(&db.pool, &state, &oauth_only, PASSWORD).await;
    assert!(matches!(result, Err(AuthError::InvalidCredentials)));

    let wrong = unique_email("wrong");
    create_active_user(&db.pool, &wrong, Some(&password_hash)).await?;
    let result = try_login(&db.pool, &state, &wrong, "not-the-password").await;
    assert!(matches!(result, Err(AuthError::InvalidCredentials)));

    let pending = unique_email("pending");
    create_pending_user(&db.pool, &pending, &password_hash).await?;
    let result = try_login(&db.pool, &state, &pending, PASSWORD).await;
    assert!(matches!(result, Err(AuthError::EmailNotVerified)));

    let suspended = unique_email("suspended");
    let suspended_id = create_active_user(&db.pool, &suspended, Some(&password_hash)).await?;
    sqlx::query("UPDATE users SET status = 'suspended' WHERE id = $1")
        .bind(suspended_id)
        .execute(&db.pool)
        .await?;
    let result = try_login(&db.pool, &state, &suspended, PASSWORD).await;
    assert!(matches!(result, Err(AuthError::AccountSuspended)));

    let banned = unique_email("banned");
    let banned_id = create_active_user(&db.pool, &banned, Some(&password_hash)).await?;
    sqlx::query("UPDATE users SET status = 'banned' WHERE id = $1")
        .bind(banned_id)
        .execute(&db.pool)
        .await?;
    let result = try_login(&db.pool, &state, &banned, PASSWORD).await;
    assert!(matches!(result, Err(AuthError::AccountBanned)));

    Ok(())
}

#[tokio::test]
async fn login_happy_path_issues_tokens() -> Result<()> {
    let Ok(db) = TestDb::new().await else {
        return Ok(());
    };

    let state = test_state()?;
    let email = unique_email("olive");
    let password_hash = hash_password(PASSWORD)?;
    let user_id = create_active_user(&db.pool, &email, Some(&password_hash)).await?;

    let response = try_login(&db.pool, &state, &email, PASSWORD)
        .await
        .map_err(|err| anyhow!("login failed: {err}"))?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(session_count(&db.pool, user_id).await?, 1);

    Ok(())
}
