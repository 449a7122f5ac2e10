//! Access/refresh tokens, bearer authentication and role-based permissions.

use crate::entities;
use crate::errors::SakhiError;
use crate::jwks::JwksManager;
use crate::settings::Settings;
use crate::storage;
use crate::types::UserRole;
use crate::web::AppState;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use chrono::Utc;
use josekit::jwt::JwtPayload;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const TOKEN_TYPE_ACCESS: &str = "access";
pub const TOKEN_TYPE_REFRESH: &str = "refresh";

// ============================================================================
// Phone numbers
// ============================================================================

/// Trim and check an E.164-style number: `+` then digits, 10 to 16 chars total
pub fn normalize_phone(raw: &str) -> Result<String, SakhiError> {
    let phone = raw.trim();
    let valid = phone.len() >= 10
        && phone.len() <= 16
        && phone.starts_with('+')
        && phone[1..].chars().all(|c| c.is_ascii_digit());
    if !valid {
        return Err(SakhiError::BadRequest(
            "phone must be in international format, e.g. +919876543210".into(),
        ));
    }
    Ok(phone.to_string())
}

// ============================================================================
// Tokens
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub jti: String,
    pub token_type: String,
    pub phone: String,
    pub role: UserRole,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

fn sign(
    jwks: &JwksManager,
    issuer: &str,
    user: &entities::user::Model,
    token_type: &str,
    jti: &str,
    now: i64,
    ttl_secs: i64,
) -> Result<String, SakhiError> {
    let mut payload = JwtPayload::new();
    payload.set_issuer(issuer);
    payload.set_subject(&user.id);
    payload.set_jwt_id(jti);
    payload.set_claim("iat", Some(json!(now)))?;
    payload.set_claim("exp", Some(json!(now + ttl_secs)))?;
    payload.set_claim("type", Some(json!(token_type)))?;
    payload.set_claim("phone", Some(json!(user.phone)))?;
    payload.set_claim("role", Some(json!(user.role)))?;
    jwks.sign_jwt_rs256(&payload)
}

/// Sign a new access/refresh pair and persist the refresh token's `jti`.
/// `parent_jti` links a rotated refresh token to its predecessor.
pub async fn issue_token_pair(
    db: &DatabaseConnection,
    jwks: &JwksManager,
    settings: &Settings,
    user: &entities::user::Model,
    parent_jti: Option<String>,
) -> Result<TokenPair, SakhiError> {
    let now = Utc::now().timestamp();
    let issuer = settings.base_url();
    let access_ttl = settings.auth.access_token_ttl_secs;
    let refresh_ttl = settings.auth.refresh_token_ttl_secs;

    let access_token = sign(
        jwks,
        &issuer,
        user,
        TOKEN_TYPE_ACCESS,
        &storage::random_id(),
        now,
        access_ttl,
    )?;
    let refresh_jti = storage::random_id();
    let refresh_token = sign(
        jwks,
        &issuer,
        user,
        TOKEN_TYPE_REFRESH,
        &refresh_jti,
        now,
        refresh_ttl,
    )?;
    storage::store_refresh_token(db, &refresh_jti, &user.id, now + refresh_ttl, parent_jti)
        .await?;

    Ok(TokenPair {
        access_token,
        refresh_token,
        token_type: "bearer".into(),
        expires_in: access_ttl,
    })
}

fn str_claim(payload: &JwtPayload, name: &str) -> Option<String> {
    payload.claim(name).and_then(Value::as_str).map(str::to_string)
}

fn int_claim(payload: &JwtPayload, name: &str) -> Option<i64> {
    payload.claim(name).and_then(Value::as_i64)
}

/// Verify signature, expiry and token type
pub fn verify_token(
    jwks: &JwksManager,
    token: &str,
    expected_type: &str,
) -> Result<TokenClaims, SakhiError> {
    let invalid = || SakhiError::Unauthorized("invalid token".into());
    let payload = jwks.verify_jwt_rs256(token).map_err(|_| invalid())?;

    let exp = int_claim(&payload, "exp").ok_or_else(invalid)?;
    if Utc::now().timestamp() >= exp {
        return Err(SakhiError::Unauthorized("token expired".into()));
    }
    let token_type = str_claim(&payload, "type").ok_or_else(invalid)?;
    if token_type != expected_type {
        return Err(SakhiError::Unauthorized(format!(
            "expected {} token",
            expected_type
        )));
    }

    Ok(TokenClaims {
        sub: payload.subject().ok_or_else(invalid)?.to_string(),
        jti: payload.jwt_id().ok_or_else(invalid)?.to_string(),
        phone: str_claim(&payload, "phone").unwrap_or_default(),
        role: str_claim(&payload, "role")
            .and_then(|r| r.parse().ok())
            .ok_or_else(invalid)?,
        iat: int_claim(&payload, "iat").unwrap_or_default(),
        exp,
        token_type,
    })
}

/// Exchange a refresh token for a new pair, revoking the old one
pub async fn rotate_refresh(
    db: &DatabaseConnection,
    jwks: &JwksManager,
    settings: &Settings,
    refresh_token: &str,
) -> Result<TokenPair, SakhiError> {
    let claims = verify_token(jwks, refresh_token, TOKEN_TYPE_REFRESH)?;
    let stored = storage::get_refresh_token(db, &claims.jti)
        .await?
        .ok_or_else(|| SakhiError::Unauthorized("refresh token revoked or expired".into()))?;
    if stored.user_id != claims.sub {
        return Err(SakhiError::Unauthorized("invalid token".into()));
    }
    let user = storage::get_user(db, &claims.sub)
        .await?
        .filter(|u| u.is_active)
        .ok_or_else(|| SakhiError::Unauthorized("user inactive".into()))?;

    // Revocation is the single-use check; a concurrent rotation loses here
    if !storage::revoke_refresh_token(db, &claims.jti).await? {
        return Err(SakhiError::Unauthorized(
            "refresh token revoked or expired".into(),
        ));
    }
    issue_token_pair(db, jwks, settings, &user, Some(claims.jti)).await
}

// ============================================================================
// Bearer extraction
// ============================================================================

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// The authenticated caller of a request
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: entities::user::Model,
    pub role: UserRole,
}

impl AuthUser {
    pub fn id(&self) -> &str {
        &self.user.id
    }

    pub fn can(&self, permission: Permission) -> bool {
        has_permission(self.role, permission)
    }

    pub fn require(&self, permission: Permission) -> Result<(), SakhiError> {
        if self.can(permission) {
            Ok(())
        } else {
            Err(SakhiError::Forbidden(format!(
                "role {} lacks permission {:?}",
                self.role, permission
            )))
        }
    }

    pub fn require_farmer_access(
        &self,
        farmer: &entities::farmer::Model,
    ) -> Result<(), SakhiError> {
        if can_access_farmer(self, farmer) {
            Ok(())
        } else {
            Err(SakhiError::Forbidden(
                "not allowed to access this farmer".into(),
            ))
        }
    }
}

/// Resolve an access token to an active user
pub async fn authenticate(
    db: &DatabaseConnection,
    jwks: &JwksManager,
    token: &str,
) -> Result<AuthUser, SakhiError> {
    let claims = verify_token(jwks, token, TOKEN_TYPE_ACCESS)?;
    let user = storage::get_user(db, &claims.sub)
        .await?
        .filter(|u| u.is_active)
        .ok_or_else(|| SakhiError::Unauthorized("user not found or inactive".into()))?;
    // Role comes from the row so role changes apply without re-login
    let role = storage::user_role(&user);
    Ok(AuthUser { user, role })
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = SakhiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| SakhiError::Unauthorized("bearer token required".into()))?;
        authenticate(&state.db, &state.jwks, token).await
    }
}

// ============================================================================
// Permissions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    ProfileRead,
    ProfileWrite,
    FarmRead,
    FarmWrite,
    ActivityRead,
    ActivityWrite,
    AdvisoryRead,
    AdvisoryWrite,
    ReminderRead,
    ReminderWrite,
    NotificationRead,
    KbRead,
    KbWrite,
    ExtRead,
    ExtWrite,
    MediaUpload,
    PrivacySelf,
    FarmersReadAll,
    FarmersWriteAll,
    AuditRead,
    UsersManage,
    SystemStats,
}

const FARMER_PERMISSIONS: &[Permission] = &[
    Permission::ProfileRead,
    Permission::ProfileWrite,
    Permission::FarmRead,
    Permission::FarmWrite,
    Permission::ActivityRead,
    Permission::ActivityWrite,
    Permission::AdvisoryRead,
    Permission::ReminderRead,
    Permission::ReminderWrite,
    Permission::NotificationRead,
    Permission::KbRead,
    Permission::ExtRead,
    Permission::MediaUpload,
    Permission::PrivacySelf,
];

const STAFF_EXTRA: &[Permission] = &[
    Permission::FarmersReadAll,
    Permission::FarmersWriteAll,
    Permission::AdvisoryWrite,
    Permission::KbWrite,
    Permission::ExtWrite,
];

pub fn has_permission(role: UserRole, permission: Permission) -> bool {
    match role {
        UserRole::Admin => true,
        UserRole::Staff => {
            FARMER_PERMISSIONS.contains(&permission) || STAFF_EXTRA.contains(&permission)
        }
        UserRole::Farmer => FARMER_PERMISSIONS.contains(&permission),
    }
}

/// Staff and admins see every farmer; a farmer only their own profile
pub fn can_access_farmer(user: &AuthUser, farmer: &entities::farmer::Model) -> bool {
    user.role.is_staff_or_admin() || farmer.user_id == user.user.id
}

/// Uploads are private to their owner; staff and admins may read any
pub fn can_access_media(user: &AuthUser, media: &entities::media::Model) -> bool {
    user.role.is_staff_or_admin() || media.owner_user_id == user.user.id
}
