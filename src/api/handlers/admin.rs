//! Role-gated user administration endpoints.
//!
//! Access control is an ordered list of named rules per operation, checked
//! top to bottom against the caller and the target row. The first rule that
//! fails settles the response and its name is logged. Every mutation lands
//! in `admin_audit_log` inside the same transaction.

use super::auth::{
    password, principal::require_auth, storage, utils, AuthState, Principal, Role,
};
use anyhow::anyhow;
use axum::{
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::{error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

const USER_STATUSES: &[&str] = &["pending_verification", "active", "suspended", "banned"];

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 100;

const ADMIN_USER_COLUMNS: &str = r#"id::text AS id, email::text AS email, display_name, role, status, email_verified, CASE WHEN suspended_until IS NULL THEN NULL ELSE to_char(suspended_until AT TIME ZONE 'utc', 'YYYY-MM-DD"T"HH24:MI:SS"Z"') END AS suspended_until, suspension_reason, to_char(created_at AT TIME ZONE 'utc', 'YYYY-MM-DD"T"HH24:MI:SS"Z"') AS created_at"#;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdminUser {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub role: String,
    pub status: String,
    pub email_verified: bool,
    pub suspended_until: Option<String>,
    pub suspension_reason: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListUsersQuery {
    pub status: Option<String>,
    pub role: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BucketCount {
    pub key: String,
    pub count: i64,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub total: i64,
    pub by_status: Vec<BucketCount>,
    pub by_role: Vec<BucketCount>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SuspendRequest {
    pub reason: String,
    /// Informational only, suspensions end through explicit reactivation.
    pub days: Option<i64>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BanRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoleChangeRequest {
    pub role: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateAdminRequest {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdminCreatedResponse {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    pub purged: u64,
}

#[derive(Debug)]
enum AdminError {
    Forbidden,
    BadRequest(&'static str),
    NotFound,
    Conflict(&'static str),
    Database(sqlx::Error),
    Internal(anyhow::Error),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        match self {
            Self::Forbidden => StatusCode::FORBIDDEN.into_response(),
            Self::NotFound => StatusCode::NOT_FOUND.into_response(),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            Self::Conflict(message) => (StatusCode::CONFLICT, message).into_response(),
            Self::Database(err) => {
                error!("admin query failed: {err}");

                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
            Self::Internal(err) => {
                error!("admin operation failed: {err:#}");

                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// The user row an admin operation acts on, locked for the transaction.
#[derive(Debug)]
struct Target {
    id: Uuid,
    role: Role,
}

struct AccessRule {
    name: &'static str,
    check: fn(&Principal, &Target) -> bool,
}

const MODERATION_RULES: &[AccessRule] = &[
    AccessRule {
        name: "actor_is_admin",
        check: |actor, _| actor.role >= Role::Admin,
    },
    AccessRule {
        name: "target_is_not_actor",
        check: |actor, target| actor.user_id != target.id,
    },
    AccessRule {
        name: "target_is_plain_user",
        check: |_, target| target.role == Role::User,
    },
];

const ACTIVATE_RULES: &[AccessRule] = &[
    AccessRule {
        name: "actor_is_admin",
        check: |actor, _| actor.role >= Role::Admin,
    },
    AccessRule {
        name: "target_is_not_actor",
        check: |actor, target| actor.user_id != target.id,
    },
    AccessRule {
        name: "actor_outranks_target",
        check: |actor, target| actor.role > target.role,
    },
];

const ROLE_CHANGE_RULES: &[AccessRule] = &[
    AccessRule {
        name: "actor_is_admin",
        check: |actor, _| actor.role >= Role::Admin,
    },
    AccessRule {
        name: "target_is_not_actor",
        check: |actor, target| actor.user_id != target.id,
    },
    AccessRule {
        name: "actor_outranks_target",
        check: |actor, target| actor.role > target.role,
    },
];

fn check_rules(rules: &[AccessRule], actor: &Principal, target: &Target) -> Result<(), AdminError> {
    for rule in rules {
        if !(rule.check)(actor, target) {
            warn!(
                rule = rule.name,
                actor = %actor.user_id,
                target = %target.id,
                "admin access denied"
            );

            return Err(AdminError::Forbidden);
        }
    }

    Ok(())
}

fn require_role(principal: &Principal, minimum: Role) -> Result<(), AdminError> {
    if principal.role >= minimum {
        Ok(())
    } else {
        warn!(
            actor = %principal.user_id,
            role = principal.role.as_str(),
            "admin access denied"
        );

        Err(AdminError::Forbidden)
    }
}

/// The super_admin role is never grantable over the API, and granting or
/// revoking admin is reserved for the super admin.
fn can_grant(actor: Role, desired: Role) -> bool {
    match desired {
        Role::SuperAdmin => false,
        Role::Admin => actor == Role::SuperAdmin,
        Role::User | Role::Moderator => actor >= Role::Admin,
    }
}

#[utoipa::path(
    get,
    path = "/v1/admin/users",
    params(
        ("status" = Option<String>, Query, description = "Filter by account status"),
        ("role" = Option<String>, Query, description = "Filter by role"),
        ("limit" = Option<i64>, Query, description = "Page size, at most 100"),
        ("offset" = Option<i64>, Query, description = "Rows to skip"),
    ),
    responses(
        (status = 200, description = "Users matching the filters", body = [AdminUser]),
        (status = 400, description = "Unknown filter value"),
        (status = 401, description = "Missing or invalid access token"),
        (status = 403, description = "Caller is not at least a moderator"),
    ),
    tag = "admin"
)]
pub async fn list_users(
    Extension(pool): Extension<PgPool>,
    Extension(state): Extension<Arc<AuthState>>,
    headers: HeaderMap,
    Query(query): Query<ListUsersQuery>,
) -> Response {
    let principal = match require_auth(&headers, &pool, &state).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    if let Err(err) = require_role(&principal, Role::Moderator) {
        return err.into_response();
    }

    if let Some(status) = query.status.as_deref() {
        if !USER_STATUSES.contains(&status) {
            return AdminError::BadRequest("Unknown status filter").into_response();
        }
    }

    if let Some(role) = query.role.as_deref() {
        if Role::parse(role).is_none() {
            return AdminError::BadRequest("Unknown role filter").into_response();
        }
    }

    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);

    match fetch_users(&pool, query.status, query.role, limit, offset).await {
        Ok(users) => (StatusCode::OK, Json(users)).into_response(),
        Err(err) => AdminError::Database(err).into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/v1/admin/users/stats",
    responses(
        (status = 200, description = "User counts by status and role", body = UserStats),
        (status = 401, description = "Missing or invalid access token"),
        (status = 403, description = "Caller is not at least a moderator"),
    ),
    tag = "admin"
)]
pub async fn user_stats(
    Extension(pool): Extension<PgPool>,
    Extension(state): Extension<Arc<AuthState>>,
    headers: HeaderMap,
) -> Response {
    let principal = match require_auth(&headers, &pool, &state).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    if let Err(err) = require_role(&principal, Role::Moderator) {
        return err.into_response();
    }

    match fetch_stats(&pool).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(err) => AdminError::Database(err).into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/v1/admin/users/{id}/suspend",
    params(("id" = String, Path, description = "User id")),
    request_body = SuspendRequest,
    responses(
        (status = 200, description = "User suspended, sessions revoked", body = AdminUser),
        (status = 400, description = "Invalid id, missing reason, or user not active"),
        (status = 401, description = "Missing or invalid access token"),
        (status = 403, description = "Rule check failed"),
        (status = 404, description = "User not found"),
    ),
    tag = "admin"
)]
pub async fn suspend_user(
    Extension(pool): Extension<PgPool>,
    Extension(state): Extension<Arc<AuthState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    payload: Option<Json<SuspendRequest>>,
) -> Response {
    let principal = match require_auth(&headers, &pool, &state).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    let Ok(user_id) = Uuid::parse_str(id.trim()) else {
        return AdminError::BadRequest("Invalid user id").into_response();
    };

    let Some(Json(request)) = payload else {
        return AdminError::BadRequest("Missing payload").into_response();
    };

    let reason = request.reason.trim();

    if reason.is_empty() {
        return AdminError::BadRequest("Reason is required").into_response();
    }

    if request.days.is_some_and(|days| days <= 0) {
        return AdminError::BadRequest("Days must be positive").into_response();
    }

    match suspend(&pool, &principal, user_id, reason, request.days).await {
        Ok(user) => (StatusCode::OK, Json(user)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/v1/admin/users/{id}/activate",
    params(("id" = String, Path, description = "User id")),
    responses(
        (status = 200, description = "User reactivated", body = AdminUser),
        (status = 400, description = "Invalid id or user not suspended"),
        (status = 401, description = "Missing or invalid access token"),
        (status = 403, description = "Rule check failed"),
        (status = 404, description = "User not found"),
    ),
    tag = "admin"
)]
pub async fn activate_user(
    Extension(pool): Extension<PgPool>,
    Extension(state): Extension<Arc<AuthState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let principal = match require_auth(&headers, &pool, &state).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    let Ok(user_id) = Uuid::parse_str(id.trim()) else {
        return AdminError::BadRequest("Invalid user id").into_response();
    };

    match activate(&pool, &principal, user_id).await {
        Ok(user) => (StatusCode::OK, Json(user)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/v1/admin/users/{id}/ban",
    params(("id" = String, Path, description = "User id")),
    request_body = BanRequest,
    responses(
        (status = 200, description = "User banned, sessions revoked", body = AdminUser),
        (status = 400, description = "Invalid id, missing reason, or user already banned"),
        (status = 401, description = "Missing or invalid access token"),
        (status = 403, description = "Rule check failed"),
        (status = 404, description = "User not found"),
    ),
    tag = "admin"
)]
pub async fn ban_user(
    Extension(pool): Extension<PgPool>,
    Extension(state): Extension<Arc<AuthState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    payload: Option<Json<BanRequest>>,
) -> Response {
    let principal = match require_auth(&headers, &pool, &state).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    let Ok(user_id) = Uuid::parse_str(id.trim()) else {
        return AdminError::BadRequest("Invalid user id").into_response();
    };

    let Some(Json(request)) = payload else {
        return AdminError::BadRequest("Missing payload").into_response();
    };

    let reason = request.reason.trim();

    if reason.is_empty() {
        return AdminError::BadRequest("Reason is required").into_response();
    }

    match ban(&pool, &principal, user_id, reason).await {
        Ok(user) => (StatusCode::OK, Json(user)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    put,
    path = "/v1/admin/users/{id}/role",
    params(("id" = String, Path, description = "User id")),
    request_body = RoleChangeRequest,
    responses(
        (status = 200, description = "Role updated", body = AdminUser),
        (status = 400, description = "Invalid id or role value"),
        (status = 401, description = "Missing or invalid access token"),
        (status = 403, description = "Rule check failed"),
        (status = 404, description = "User not found"),
    ),
    tag = "admin"
)]
pub async fn change_role(
    Extension(pool): Extension<PgPool>,
    Extension(state): Extension<Arc<AuthState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    payload: Option<Json<RoleChangeRequest>>,
) -> Response {
    let principal = match require_auth(&headers, &pool, &state).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    let Ok(user_id) = Uuid::parse_str(id.trim()) else {
        return AdminError::BadRequest("Invalid user id").into_response();
    };

    let Some(Json(request)) = payload else {
        return AdminError::BadRequest("Missing payload").into_response();
    };

    let Some(desired) = Role::parse(request.role.trim()) else {
        return AdminError::BadRequest("Unknown role").into_response();
    };

    if desired == Role::SuperAdmin {
        return AdminError::BadRequest("The super_admin role cannot be granted").into_response();
    }

    match assign_role(&pool, &principal, user_id, desired).await {
        Ok(user) => (StatusCode::OK, Json(user)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/v1/admin/admins",
    request_body = CreateAdminRequest,
    responses(
        (status = 201, description = "Admin account created, verified and active", body = AdminCreatedResponse),
        (status = 400, description = "Invalid payload"),
        (status = 401, description = "Missing or invalid access token"),
        (status = 403, description = "Caller is not the super admin"),
        (status = 409, description = "Email already registered"),
    ),
    tag = "admin"
)]
pub async fn create_admin(
    Extension(pool): Extension<PgPool>,
    Extension(state): Extension<Arc<AuthState>>,
    headers: HeaderMap,
    payload: Option<Json<CreateAdminRequest>>,
) -> Response {
    let principal = match require_auth(&headers, &pool, &state).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    if let Err(err) = require_role(&principal, Role::SuperAdmin) {
        return err.into_response();
    }

    let Some(Json(request)) = payload else {
        return AdminError::BadRequest("Missing payload").into_response();
    };

    let email = utils::normalize_email(&request.email);

    if !utils::valid_email(&email) {
        return AdminError::BadRequest("Invalid email").into_response();
    }

    if !utils::valid_password(&request.password) {
        return AdminError::BadRequest("Password must be between 8 and 128 characters")
            .into_response();
    }

    let name = request.name.trim();

    if name.is_empty() {
        return AdminError::BadRequest("Name is required").into_response();
    }

    let password_hash = match password::hash_password(&request.password) {
        Ok(hash) => hash,
        Err(err) => return AdminError::Internal(err).into_response(),
    };

    match insert_admin(&pool, &principal, &email, name, &password_hash).await {
        Ok(user_id) => {
            info!(%user_id, "admin account created");

            (StatusCode::CREATED, Json(AdminCreatedResponse { user_id })).into_response()
        }
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/v1/admin/verification-codes/cleanup",
    responses(
        (status = 200, description = "Expired and long-consumed codes purged", body = CleanupResponse),
        (status = 401, description = "Missing or invalid access token"),
        (status = 403, description = "Caller is not at least an admin"),
    ),
    tag = "admin"
)]
pub async fn cleanup_verification_codes(
    Extension(pool): Extension<PgPool>,
    Extension(state): Extension<Arc<AuthState>>,
    headers: HeaderMap,
) -> Response {
    let principal = match require_auth(&headers, &pool, &state).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    if let Err(err) = require_role(&principal, Role::Admin) {
        return err.into_response();
    }

    match storage::cleanup_verification_codes(&pool).await {
        Ok(purged) => {
            info!(purged, "verification codes purged");

            (StatusCode::OK, Json(CleanupResponse { purged })).into_response()
        }
        Err(err) => AdminError::Internal(err).into_response(),
    }
}

async fn fetch_users(
    pool: &PgPool,
    status: Option<String>,
    role: Option<String>,
    limit: i64,
    offset: i64,
) -> Result<Vec<AdminUser>, sqlx::Error> {
    let query = format!(
        "SELECT {ADMIN_USER_COLUMNS} FROM users WHERE ($1::text IS NULL OR status = $1::text) AND ($2::text IS NULL OR role = $2::text) ORDER BY created_at DESC LIMIT $3 OFFSET $4"
    );

    let rows = sqlx::query(&query)
        .bind(status)
        .bind(role)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

    Ok(rows.iter().map(map_admin_user).collect())
}

async fn fetch_stats(pool: &PgPool) -> Result<UserStats, sqlx::Error> {
    let by_status = sqlx::query(
        "SELECT status AS key, COUNT(*) AS count FROM users GROUP BY status ORDER BY status",
    )
    .fetch_all(pool)
    .await?;

    let by_role =
        sqlx::query("SELECT role AS key, COUNT(*) AS count FROM users GROUP BY role ORDER BY role")
            .fetch_all(pool)
            .await?;

    let by_status: Vec<BucketCount> = by_status.iter().map(map_bucket).collect();
    let by_role = by_role.iter().map(map_bucket).collect();
    let total = by_status.iter().map(|bucket| bucket.count).sum();

    Ok(UserStats {
        total,
        by_status,
        by_role,
    })
}

async fn suspend(
    pool: &PgPool,
    principal: &Principal,
    user_id: Uuid,
    reason: &str,
    days: Option<i64>,
) -> Result<AdminUser, AdminError> {
    let mut tx = pool.begin().await.map_err(AdminError::Database)?;
    let target = lock_target(&mut tx, user_id).await?;

    check_rules(MODERATION_RULES, principal, &target)?;

    let query = format!(
        "UPDATE users SET status = 'suspended', suspension_reason = $2, suspended_until = NOW() + ($3::bigint * INTERVAL '1 day'), updated_at = NOW() WHERE id = $1 AND status = 'active' RETURNING {ADMIN_USER_COLUMNS}"
    );

    let row = sqlx::query(&query)
        .bind(user_id)
        .bind(reason)
        .bind(days)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AdminError::Database)?;

    let Some(row) = row else {
        return Err(AdminError::BadRequest("User is not active"));
    };

    let revoked = storage::delete_sessions_for_user(&mut tx, user_id)
        .await
        .map_err(AdminError::Internal)?;

    record_audit(&mut tx, principal.user_id, user_id, "suspend_user", Some(reason)).await?;

    tx.commit().await.map_err(AdminError::Database)?;

    info!(
        actor = %principal.user_id,
        target = %user_id,
        revoked,
        "user suspended"
    );

    Ok(map_admin_user(&row))
}

async fn activate(
    pool: &PgPool,
    principal: &Principal,
    user_id: Uuid,
) -> Result<AdminUser, AdminError> {
    let mut tx = pool.begin().await.map_err(AdminError::Database)?;
    let target = lock_target(&mut tx, user_id).await?;

    check_rules(ACTIVATE_RULES, principal, &target)?;

    let query = format!(
        "UPDATE users SET status = 'active', suspension_reason = NULL, suspended_until = NULL, updated_at = NOW() WHERE id = $1 AND status = 'suspended' RETURNING {ADMIN_USER_COLUMNS}"
    );

    let row = sqlx::query(&query)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AdminError::Database)?;

    let Some(row) = row else {
        return Err(AdminError::BadRequest("User is not suspended"));
    };

    record_audit(&mut tx, principal.user_id, user_id, "activate_user", None).await?;

    tx.commit().await.map_err(AdminError::Database)?;

    info!(actor = %principal.user_id, target = %user_id, "user reactivated");

    Ok(map_admin_user(&row))
}

async fn ban(
    pool: &PgPool,
    principal: &Principal,
    user_id: Uuid,
    reason: &str,
) -> Result<AdminUser, AdminError> {
    let mut tx = pool.begin().await.map_err(AdminError::Database)?;
    let target = lock_target(&mut tx, user_id).await?;

    check_rules(MODERATION_RULES, principal, &target)?;

    // A ban is allowed from active or suspended, never from banned.
    let query = format!(
        "UPDATE users SET status = 'banned', suspension_reason = $2, suspended_until = NULL, updated_at = NOW() WHERE id = $1 AND status IN ('active', 'suspended') RETURNING {ADMIN_USER_COLUMNS}"
    );

    let row = sqlx::query(&query)
        .bind(user_id)
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AdminError::Database)?;

    let Some(row) = row else {
        return Err(AdminError::BadRequest("User cannot be banned in their current status"));
    };

    let revoked = storage::delete_sessions_for_user(&mut tx, user_id)
        .await
        .map_err(AdminError::Internal)?;

    record_audit(&mut tx, principal.user_id, user_id, "ban_user", Some(reason)).await?;

    tx.commit().await.map_err(AdminError::Database)?;

    info!(
        actor = %principal.user_id,
        target = %user_id,
        revoked,
        "user banned"
    );

    Ok(map_admin_user(&row))
}

async fn assign_role(
    pool: &PgPool,
    principal: &Principal,
    user_id: Uuid,
    desired: Role,
) -> Result<AdminUser, AdminError> {
    let mut tx = pool.begin().await.map_err(AdminError::Database)?;
    let target = lock_target(&mut tx, user_id).await?;

    check_rules(ROLE_CHANGE_RULES, principal, &target)?;

    if !can_grant(principal.role, desired) {
        warn!(
            rule = "grant_requires_super_admin",
            actor = %principal.user_id,
            target = %target.id,
            "admin access denied"
        );

        return Err(AdminError::Forbidden);
    }

    let query = format!(
        "UPDATE users SET role = $2, updated_at = NOW() WHERE id = $1 RETURNING {ADMIN_USER_COLUMNS}"
    );

    let row = sqlx::query(&query)
        .bind(user_id)
        .bind(desired.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(AdminError::Database)?;

    let detail = format!("{} -> {}", target.role.as_str(), desired.as_str());

    record_audit(&mut tx, principal.user_id, user_id, "change_role", Some(&detail)).await?;

    tx.commit().await.map_err(AdminError::Database)?;

    info!(actor = %principal.user_id, target = %user_id, detail, "role changed");

    Ok(map_admin_user(&row))
}

async fn insert_admin(
    pool: &PgPool,
    principal: &Principal,
    email: &str,
    name: &str,
    password_hash: &str,
) -> Result<Uuid, AdminError> {
    let mut tx = pool.begin().await.map_err(AdminError::Database)?;

    let query = "INSERT INTO users (email, display_name, password_hash, email_verified, status, role) VALUES ($1, $2, $3, TRUE, 'active', 'admin') RETURNING id";

    let user_id = match sqlx::query(query)
        .bind(email)
        .bind(name)
        .bind(password_hash)
        .fetch_one(&mut *tx)
        .await
    {
        Ok(row) => row.get::<Uuid, _>("id"),
        Err(err) if utils::is_unique_violation(&err) => {
            return Err(AdminError::Conflict("Email already registered"));
        }
        Err(err) => return Err(AdminError::Database(err)),
    };

    record_audit(&mut tx, principal.user_id, user_id, "create_admin", None).await?;

    tx.commit().await.map_err(AdminError::Database)?;

    Ok(user_id)
}

async fn lock_target(tx: &mut Transaction<'_, Postgres>, user_id: Uuid) -> Result<Target, AdminError> {
    let row = sqlx::query("SELECT id, role FROM users WHERE id = $1 FOR UPDATE")
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(AdminError::Database)?;

    let Some(row) = row else {
        return Err(AdminError::NotFound);
    };

    let role: String = row.get("role");
    let Some(role) = Role::parse(&role) else {
        return Err(AdminError::Internal(anyhow!(
            "unknown role {role} on user {user_id}"
        )));
    };

    Ok(Target {
        id: row.get("id"),
        role,
    })
}

async fn record_audit(
    tx: &mut Transaction<'_, Postgres>,
    actor_id: Uuid,
    target_id: Uuid,
    action: &str,
    detail: Option<&str>,
) -> Result<(), AdminError> {
    sqlx::query(
        "INSERT INTO admin_audit_log (actor_id, target_id, action, detail) VALUES ($1, $2, $3, $4)",
    )
    .bind(actor_id)
    .bind(target_id)
    .bind(action)
    .bind(detail)
    .execute(&mut **tx)
    .await
    .map_err(AdminError::Database)?;

    Ok(())
}

fn map_admin_user(row: &PgRow) -> AdminUser {
    AdminUser {
        id: row.get("id"),
        email: row.get("email"),
        display_name: row.get("display_name"),
        role: row.get("role"),
        status: row.get("status"),
        email_verified: row.get("email_verified"),
        suspended_until: row.get("suspended_until"),
        suspension_reason: row.get("suspension_reason"),
        created_at: row.get("created_at"),
    }
}

fn map_bucket(row: &PgRow) -> BucketCount {
    BucketCount {
        key: row.get("key"),
        count: row.get("count"),
    }
}
