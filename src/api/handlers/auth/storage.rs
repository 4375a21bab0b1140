//! SQL behind the auth flows. Every mutation that must be atomic is a
//! single conditional statement or a short transaction, concurrency is
//! settled by the database rather than by application locks.

use super::utils::{
    generate_refresh_token, generate_verification_code, hash_token, is_unique_violation,
};
use anyhow::{anyhow, Context, Result};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info_span, Instrument};
use uuid::Uuid;

const SESSION_TOKEN_ATTEMPTS: usize = 3;

/// What a stored code is good for. One live code per `(email, purpose)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum CodePurpose {
    EmailVerification,
    PasswordReset,
}

impl CodePurpose {
    pub(super) const fn as_str(self) -> &'static str {
        match self {
            Self::EmailVerification => "email_verification",
            Self::PasswordReset => "password_reset",
        }
    }

    const fn email_template(self) -> &'static str {
        match self {
            Self::EmailVerification => "verify_email",
            Self::PasswordReset => "reset_password",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum SignupOutcome {
    Created { user_id: Uuid },
    EmailTaken,
    UsernameTaken,
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum ResendOutcome {
    Queued,
    Cooldown,
    AlreadyVerified,
    Noop,
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum VerifyOutcome {
    Verified { user_id: Uuid },
    InvalidCode,
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum ResetOutcome {
    Updated,
    InvalidCode,
}

#[derive(Debug)]
pub(super) enum RotateOutcome {
    Rotated {
        session_id: Uuid,
        user_id: Uuid,
        refresh_token: String,
    },
    Invalid,
}

#[derive(Debug)]
pub(super) enum GoogleSignInOutcome {
    SignedIn(GoogleUser),
    Blocked { status: String },
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct UserAuthRecord {
    pub(super) user_id: Uuid,
    pub(super) email: String,
    pub(super) username: Option<String>,
    pub(super) display_name: String,
    pub(super) password_hash: Option<String>,
    pub(super) email_verified: bool,
    pub(super) status: String,
    pub(super) role: String,
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct SessionIdentity {
    pub(super) user_id: Uuid,
    pub(super) email: String,
    pub(super) display_name: String,
    pub(super) role: String,
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct GoogleUser {
    pub(super) user_id: Uuid,
    pub(super) email: String,
    pub(super) username: Option<String>,
    pub(super) display_name: String,
    pub(super) role: String,
}

#[derive(Debug)]
pub(super) struct NewSession {
    pub(super) session_id: Uuid,
    pub(super) refresh_token: String,
}

/// Create a pending user and queue their first verification code.
pub(super) async fn insert_user(
    pool: &PgPool,
    email: &str,
    password_hash: &str,
    display_name: &str,
    username: Option<&str>,
    code_ttl_seconds: i64,
) -> Result<SignupOutcome> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to start signup transaction")?;

    let query = "INSERT INTO users (email, password_hash, display_name, username) VALUES ($1, $2, $3, $4) RETURNING id";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );

    let user_id = match sqlx::query_scalar::<_, Uuid>(query)
        .bind(email)
        .bind(password_hash)
        .bind(display_name)
        .bind(username)
        .fetch_one(&mut *tx)
        .instrument(span)
        .await
    {
        Ok(user_id) => user_id,
        Err(err) if is_unique_violation(&err) => {
            // The constraint name tells the two unique columns apart.
            let on_username = err
                .as_database_error()
                .and_then(|db_err| db_err.constraint())
                .is_some_and(|name| name.contains("username"));

            let _ = tx.rollback().await;

            return Ok(if on_username {
                SignupOutcome::UsernameTaken
            } else {
                SignupOutcome::EmailTaken
            });
        }
        Err(err) => return Err(anyhow::Error::new(err).context("failed to insert user")),
    };

    issue_verification_code(&mut tx, email, CodePurpose::EmailVerification, code_ttl_seconds)
        .await?;

    tx.commit()
        .await
        .context("failed to commit signup transaction")?;

    Ok(SignupOutcome::Created { user_id })
}

/// Issue a fresh code for `(email, purpose)`, superseding any unused one,
/// and queue the matching email. Returns the raw code.
pub(super) async fn issue_verification_code(
    tx: &mut Transaction<'_, Postgres>,
    email: &str,
    purpose: CodePurpose,
    ttl_seconds: i64,
) -> Result<String> {
    let supersede = "UPDATE verification_codes SET consumed_at = NOW() WHERE email = $1 AND purpose = $2 AND consumed_at IS NULL";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = supersede
    );

    sqlx::query(supersede)
        .bind(email)
        .bind(purpose.as_str())
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to supersede verification codes")?;

    let code = generate_verification_code()?;

    let insert = "INSERT INTO verification_codes (email, purpose, code_hash, expires_at) VALUES ($1, $2, $3, NOW() + ($4 * INTERVAL '1 second'))";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = insert
    );

    sqlx::query(insert)
        .bind(email)
        .bind(purpose.as_str())
        .bind(hash_token(&code))
        .bind(ttl_seconds)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to insert verification code")?;

    let enqueue = "INSERT INTO email_outbox (to_email, template, payload_json) VALUES ($1, $2, $3::jsonb)";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = enqueue
    );

    let payload = serde_json::json!({
        "code": code,
        "expiresMinutes": ttl_seconds / 60,
    })
    .to_string();

    sqlx::query(enqueue)
        .bind(email)
        .bind(purpose.email_template())
        .bind(payload)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to enqueue verification email")?;

    Ok(code)
}

/// The conditional update is the consumption: it only matches a row that
/// is unused and unexpired, so two racing callers cannot both win.
pub(super) async fn consume_verification_code(
    tx: &mut Transaction<'_, Postgres>,
    email: &str,
    purpose: CodePurpose,
    code: &str,
) -> Result<bool> {
    let query = "UPDATE verification_codes SET consumed_at = NOW() WHERE email = $1 AND purpose = $2 AND code_hash = $3 AND consumed_at IS NULL AND expires_at > NOW()";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );

    let result = sqlx::query(query)
        .bind(email)
        .bind(purpose.as_str())
        .bind(hash_token(code))
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to consume verification code")?;

    Ok(result.rows_affected() == 1)
}

/// Consume an email verification code and promote the pending account.
pub(super) async fn verify_email_with_code(
    pool: &PgPool,
    email: &str,
    code: &str,
) -> Result<VerifyOutcome> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to start verification transaction")?;

    if !consume_verification_code(&mut tx, email, CodePurpose::EmailVerification, code).await? {
        let _ = tx.rollback().await;

        return Ok(VerifyOutcome::InvalidCode);
    }

    let query = "UPDATE users SET email_verified = TRUE, status = 'active', updated_at = NOW() WHERE email = $1 AND status = 'pending_verification' RETURNING id";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );

    let user_id = sqlx::query_scalar::<_, Uuid>(query)
        .bind(email)
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to activate user")?;

    let Some(user_id) = user_id else {
        // Code matched but the account is not pending, nothing to promote.
        let _ = tx.rollback().await;

        return Ok(VerifyOutcome::InvalidCode);
    };

    tx.commit()
        .await
        .context("failed to commit verification transaction")?;

    Ok(VerifyOutcome::Verified { user_id })
}

pub(super) async fn lookup_user_for_login(
    pool: &PgPool,
    email: &str,
) -> Result<Option<UserAuthRecord>> {
    let query = "SELECT id AS user_id, email::text AS email, username::text AS username, display_name, password_hash, email_verified, status, role FROM users WHERE email = $1";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );

    sqlx::query_as::<_, UserAuthRecord>(query)
        .bind(email)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to look up user")
}

/// Create a session row, retrying on the astronomically unlikely token
/// collision. Returns the raw refresh token, shown to the caller once.
pub(super) async fn insert_session(
    pool: &PgPool,
    user_id: Uuid,
    ttl_seconds: i64,
    ip: Option<&str>,
    user_agent: Option<&str>,
) -> Result<NewSession> {
    let query = "INSERT INTO user_sessions (user_id, refresh_token_hash, ip, user_agent, expires_at) VALUES ($1, $2, $3::inet, $4, NOW() + ($5 * INTERVAL '1 second')) RETURNING id";

    for _ in 0..SESSION_TOKEN_ATTEMPTS {
        let refresh_token = generate_refresh_token()?;
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );

        match sqlx::query_scalar::<_, Uuid>(query)
            .bind(user_id)
            .bind(hash_token(&refresh_token))
            .bind(ip)
            .bind(user_agent)
            .bind(ttl_seconds)
            .fetch_one(pool)
            .instrument(span)
            .await
        {
            Ok(session_id) => {
                return Ok(NewSession {
                    session_id,
                    refresh_token,
                })
            }
            Err(err) if is_unique_violation(&err) => continue,
            Err(err) => return Err(anyhow::Error::new(err).context("failed to insert session")),
        }
    }

    Err(anyhow!("failed to generate a unique refresh token"))
}

/// Swap the refresh token and extend the session in one conditional
/// update. A concurrent caller presenting the same token matches zero
/// rows and gets [`RotateOutcome::Invalid`]. Expired rows are deleted,
/// never extended.
pub(super) async fn rotate_session(
    pool: &PgPool,
    presented_token: &str,
    ttl_seconds: i64,
) -> Result<RotateOutcome> {
    let presented_hash = hash_token(presented_token);

    let query = "UPDATE user_sessions SET refresh_token_hash = $2, expires_at = NOW() + ($3 * INTERVAL '1 second'), last_seen_at = NOW() FROM users WHERE user_sessions.refresh_token_hash = $1 AND user_sessions.expires_at > NOW() AND users.id = user_sessions.user_id AND users.status = 'active' RETURNING user_sessions.id, user_sessions.user_id";

    for _ in 0..SESSION_TOKEN_ATTEMPTS {
        let refresh_token = generate_refresh_token()?;
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );

        match sqlx::query_as::<_, (Uuid, Uuid)>(query)
            .bind(&presented_hash)
            .bind(hash_token(&refresh_token))
            .bind(ttl_seconds)
            .fetch_optional(pool)
            .instrument(span)
            .await
        {
            Ok(Some((session_id, user_id))) => {
                return Ok(RotateOutcome::Rotated {
                    session_id,
                    user_id,
                    refresh_token,
                })
            }
            Ok(None) => {
                delete_expired_session(pool, &presented_hash).await?;

                return Ok(RotateOutcome::Invalid);
            }
            Err(err) if is_unique_violation(&err) => continue,
            Err(err) => return Err(anyhow::Error::new(err).context("failed to rotate session")),
        }
    }

    Err(anyhow!("failed to generate a unique refresh token"))
}

async fn delete_expired_session(pool: &PgPool, token_hash: &[u8]) -> Result<()> {
    let query = "DELETE FROM user_sessions WHERE refresh_token_hash = $1 AND expires_at <= NOW()";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );

    sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete expired session")?;

    Ok(())
}

/// Resolve a session id from an access token to a live, active user.
/// Returns `None` for revoked and expired sessions and inactive users.
pub(super) async fn lookup_live_session(
    pool: &PgPool,
    session_id: Uuid,
) -> Result<Option<SessionIdentity>> {
    let query = "SELECT users.id AS user_id, users.email::text AS email, users.display_name, users.role FROM user_sessions JOIN users ON users.id = user_sessions.user_id WHERE user_sessions.id = $1 AND user_sessions.expires_at > NOW() AND users.status = 'active'";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );

    let identity = sqlx::query_as::<_, SessionIdentity>(query)
        .bind(session_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to look up session")?;

    if identity.is_some() {
        let touch = "UPDATE user_sessions SET last_seen_at = NOW() WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = touch
        );

        sqlx::query(touch)
            .bind(session_id)
            .execute(pool)
            .instrument(span)
            .await
            .context("failed to touch session")?;
    }

    Ok(identity)
}

/// Idempotent: deleting an already revoked session is not an error.
pub(super) async fn delete_session(pool: &PgPool, session_id: Uuid) -> Result<()> {
    let query = "DELETE FROM user_sessions WHERE id = $1";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );

    sqlx::query(query)
        .bind(session_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete session")?;

    Ok(())
}

pub(crate) async fn delete_sessions_for_user(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
) -> Result<u64> {
    let query = "DELETE FROM user_sessions WHERE user_id = $1";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );

    let result = sqlx::query(query)
        .bind(user_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to delete user sessions")?;

    Ok(result.rows_affected())
}

/// Re-send a verification code. Unknown addresses collapse to `Noop` so
/// the handler can answer generically; an already verified address is the
/// one case that gets its own rejection.
pub(super) async fn enqueue_verification_resend(
    pool: &PgPool,
    email: &str,
    code_ttl_seconds: i64,
    cooldown_seconds: i64,
) -> Result<ResendOutcome> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to start resend transaction")?;

    let query = "SELECT status, email_verified FROM users WHERE email = $1";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );

    let user = sqlx::query_as::<_, (String, bool)>(query)
        .bind(email)
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to look up user for resend")?;

    let Some((status, email_verified)) = user else {
        let _ = tx.rollback().await;

        return Ok(ResendOutcome::Noop);
    };

    if email_verified {
        let _ = tx.rollback().await;

        return Ok(ResendOutcome::AlreadyVerified);
    }

    if status != "pending_verification" {
        let _ = tx.rollback().await;

        return Ok(ResendOutcome::Noop);
    }

    if within_cooldown(&mut tx, email, CodePurpose::EmailVerification, cooldown_seconds).await? {
        let _ = tx.rollback().await;

        return Ok(ResendOutcome::Cooldown);
    }

    issue_verification_code(&mut tx, email, CodePurpose::EmailVerification, code_ttl_seconds)
        .await?;

    tx.commit()
        .await
        .context("failed to commit resend transaction")?;

    Ok(ResendOutcome::Queued)
}

/// Queue a password reset code when the address belongs to an account.
pub(super) async fn enqueue_password_reset(
    pool: &PgPool,
    email: &str,
    code_ttl_seconds: i64,
    cooldown_seconds: i64,
) -> Result<ResendOutcome> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to start password reset transaction")?;

    let query = "SELECT 1 FROM users WHERE email = $1";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );

    let exists = sqlx::query_scalar::<_, i32>(query)
        .bind(email)
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to look up user for password reset")?;

    if exists.is_none() {
        let _ = tx.rollback().await;

        return Ok(ResendOutcome::Noop);
    }

    if within_cooldown(&mut tx, email, CodePurpose::PasswordReset, cooldown_seconds).await? {
        let _ = tx.rollback().await;

        return Ok(ResendOutcome::Cooldown);
    }

    issue_verification_code(&mut tx, email, CodePurpose::PasswordReset, code_ttl_seconds).await?;

    tx.commit()
        .await
        .context("failed to commit password reset transaction")?;

    Ok(ResendOutcome::Queued)
}

async fn within_cooldown(
    tx: &mut Transaction<'_, Postgres>,
    email: &str,
    purpose: CodePurpose,
    cooldown_seconds: i64,
) -> Result<bool> {
    if cooldown_seconds <= 0 {
        return Ok(false);
    }

    let query = "SELECT 1 FROM verification_codes WHERE email = $1 AND purpose = $2 AND created_at > NOW() - ($3 * INTERVAL '1 second') LIMIT 1";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );

    let recent = sqlx::query_scalar::<_, i32>(query)
        .bind(email)
        .bind(purpose.as_str())
        .bind(cooldown_seconds)
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to check resend cooldown")?;

    Ok(recent.is_some())
}

/// Consume a reset code, swap the password hash and revoke every session
/// of the account, all in one transaction.
pub(super) async fn reset_password_with_code(
    pool: &PgPool,
    email: &str,
    code: &str,
    new_password_hash: &str,
) -> Result<ResetOutcome> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to start reset transaction")?;

    if !consume_verification_code(&mut tx, email, CodePurpose::PasswordReset, code).await? {
        let _ = tx.rollback().await;

        return Ok(ResetOutcome::InvalidCode);
    }

    let query = "UPDATE users SET password_hash = $2, updated_at = NOW() WHERE email = $1 RETURNING id";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );

    let user_id = sqlx::query_scalar::<_, Uuid>(query)
        .bind(email)
        .bind(new_password_hash)
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to update password")?;

    let Some(user_id) = user_id else {
        let _ = tx.rollback().await;

        return Ok(ResetOutcome::InvalidCode);
    };

    delete_sessions_for_user(&mut tx, user_id).await?;

    tx.commit()
        .await
        .context("failed to commit reset transaction")?;

    Ok(ResetOutcome::Updated)
}

/// Find or create the account behind a Google profile. Provider-verified
/// addresses skip the code flow entirely, the account lands `active` with
/// `email_verified` set.
pub(super) async fn upsert_google_user(
    pool: &PgPool,
    email: &str,
    google_id: &str,
    display_name: &str,
) -> Result<GoogleSignInOutcome> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to start google sign-in transaction")?;

    let query = "SELECT id AS user_id, email::text AS email, username::text AS username, display_name, password_hash, email_verified, status, role FROM users WHERE email = $1";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );

    let existing = sqlx::query_as::<_, UserAuthRecord>(query)
        .bind(email)
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to look up user for google sign-in")?;

    let user = match existing {
        Some(record) if record.status == "suspended" || record.status == "banned" => {
            let _ = tx.rollback().await;

            return Ok(GoogleSignInOutcome::Blocked {
                status: record.status,
            });
        }
        Some(record) => {
            if !record.email_verified || record.status != "active" {
                let promote = "UPDATE users SET email_verified = TRUE, status = 'active', updated_at = NOW() WHERE id = $1";
                let span = info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "UPDATE",
                    db.statement = promote
                );

                sqlx::query(promote)
                    .bind(record.user_id)
                    .execute(&mut *tx)
                    .instrument(span)
                    .await
                    .context("failed to promote google user")?;
            }

            GoogleUser {
                user_id: record.user_id,
                email: record.email,
                username: record.username,
                display_name: record.display_name,
                role: record.role,
            }
        }
        None => {
            let insert = "INSERT INTO users (email, display_name, email_verified, status) VALUES ($1, $2, TRUE, 'active') RETURNING id";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.statement = insert
            );

            let user_id = match sqlx::query_scalar::<_, Uuid>(insert)
                .bind(email)
                .bind(display_name)
                .fetch_one(&mut *tx)
                .instrument(span)
                .await
            {
                Ok(user_id) => user_id,
                Err(err) if is_unique_violation(&err) => {
                    let _ = tx.rollback().await;

                    return Err(anyhow!("concurrent google sign-up for {email}, retry"));
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err).context("failed to create google user"))
                }
            };

            GoogleUser {
                user_id,
                email: email.to_string(),
                username: None,
                display_name: display_name.to_string(),
                role: "user".to_string(),
            }
        }
    };

    let link = "INSERT INTO user_identities (user_id, provider, provider_id) VALUES ($1, 'google', $2) ON CONFLICT DO NOTHING";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = link
    );

    sqlx::query(link)
        .bind(user.user_id)
        .bind(google_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to link google identity")?;

    tx.commit()
        .await
        .context("failed to commit google sign-in transaction")?;

    Ok(GoogleSignInOutcome::SignedIn(user))
}

/// Purge codes that are expired, or consumed more than a day ago.
/// Returns the number of rows removed.
pub(crate) async fn cleanup_verification_codes(pool: &PgPool) -> Result<u64> {
    let query = "DELETE FROM verification_codes WHERE expires_at <= NOW() OR (consumed_at IS NOT NULL AND consumed_at < NOW() - INTERVAL '24 hours')";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );

    let result = sqlx::query(query)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to clean up verification codes")?;

    Ok(result.rows_affected())
}
