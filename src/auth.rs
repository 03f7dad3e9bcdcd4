use crate::errors::AppError;
use crate::handlers::AppState;
use crate::models::{Role, User};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

pub const MIN_PASSWORD_LENGTH: usize = 6;

/// Claims carried by every bearer token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: Uuid,
    pub name: String,
    pub role: Role,
    pub org: Option<Uuid>,
    pub iat: i64,
    pub exp: i64,
}

/// Sign an HS256 token for `user`, valid for `expiry_hours`.
pub fn issue_token(user: &User, secret: &str, expiry_hours: i64) -> Result<String, AppError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user.id,
        name: user.name.clone(),
        role: user.role,
        org: user.organization_id,
        iat: now.timestamp(),
        exp: (now + Duration::hours(expiry_hours)).timestamp(),
    };

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::InternalError(format!("Failed to sign token: {}", e)))
}

/// Verify signature and expiry of `token`.
pub fn decode_token(token: &str, secret: &str) -> Result<Claims, AppError> {
    let validation = Validation::new(Algorithm::HS256);
    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(decoded.claims)
}

/// Hex SHA-256 of a token; revoked tokens are remembered by digest only.
pub fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn validate_password(password: &str) -> Result<(), AppError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AppError::BadRequest(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }
    Ok(())
}

/// Bcrypt-hash on the blocking pool; hashing is CPU bound.
pub async fn hash_password(password: String) -> Result<String, AppError> {
    hash_password_with_cost(password, bcrypt::DEFAULT_COST).await
}

pub(crate) async fn hash_password_with_cost(password: String, cost: u32) -> Result<String, AppError> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| AppError::InternalError(format!("Hashing task failed: {}", e)))?
        .map_err(AppError::from)
}

pub async fn verify_password(password: String, hash: String) -> Result<bool, AppError> {
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| AppError::InternalError(format!("Verification task failed: {}", e)))?
        .map_err(AppError::from)
}

/// The authenticated caller, extracted from the `Authorization: Bearer` header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
    pub name: String,
    pub role: Role,
    pub organization_id: Option<Uuid>,
    pub token_digest: String,
    pub expires_at: i64,
}

impl AuthUser {
    /// 403 unless the caller holds one of `roles`.
    pub fn require_roles(&self, roles: &[Role]) -> Result<(), AppError> {
        if roles.contains(&self.role) {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "Role '{}' is not allowed to perform this action",
                self.role
            )))
        }
    }

    pub fn is_superadmin(&self) -> bool {
        self.role == Role::Superadmin
    }

    /// The caller's organization; superadmins without one must name it explicitly.
    pub fn organization(&self) -> Result<Uuid, AppError> {
        self.organization_id.ok_or_else(|| {
            AppError::BadRequest("An organization must be specified".to_string())
        })
    }

    /// Organization to act in: superadmins may pick any, everyone else is
    /// pinned to their own.
    pub fn effective_organization(&self, requested: Option<Uuid>) -> Result<Uuid, AppError> {
        if self.is_superadmin() {
            return requested
                .or(self.organization_id)
                .ok_or_else(|| AppError::BadRequest("organization is required".to_string()));
        }
        let own = self.organization()?;
        match requested {
            Some(other) if other != own => Err(AppError::Forbidden(
                "Cannot act on another organization".to_string(),
            )),
            _ => Ok(own),
        }
    }

    /// 403 unless the caller may see data of `organization_id`.
    pub fn ensure_organization(&self, organization_id: Uuid) -> Result<(), AppError> {
        if self.is_superadmin() || self.organization_id == Some(organization_id) {
            Ok(())
        } else {
            Err(AppError::Forbidden(
                "Resource belongs to another organization".to_string(),
            ))
        }
    }
}

/// Current account state checked against every presented token.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UserStatus {
    pub is_active: bool,
    #[sqlx(try_from = "String")]
    pub role: Role,
    pub organization_id: Option<Uuid>,
}

impl UserStatus {
    pub fn of(user: &User) -> Self {
        Self {
            is_active: user.is_active,
            role: user.role,
            organization_id: user.organization_id,
        }
    }

    /// Whether a token carrying `claims` still describes this account.
    /// A changed role or organization invalidates earlier tokens.
    pub fn admits(&self, claims: &Claims) -> bool {
        self.is_active && self.role == claims.role && self.organization_id == claims.org
    }
}

/// Validate a raw token against signature, expiry, revocation and the
/// account's current active flag, role and organization.
pub async fn authenticate_token(state: &AppState, token: &str) -> Result<AuthUser, AppError> {
    let claims = decode_token(token, &state.config.jwt_secret)?;

    let digest = token_digest(token);
    if state.revoked_tokens.contains_key(&digest) {
        return Err(AppError::Unauthorized("Token has been revoked".to_string()));
    }

    match user_status(state, claims.sub).await? {
        Some(status) if status.admits(&claims) => {}
        Some(status) if status.is_active => {
            tracing::info!("Rejected stale token for {}: account changed", claims.sub);
            return Err(AppError::Unauthorized(
                "Account changed since this token was issued, log in again".to_string(),
            ));
        }
        _ => {
            return Err(AppError::Unauthorized(
                "Account is inactive or no longer exists".to_string(),
            ))
        }
    }

    Ok(AuthUser {
        id: claims.sub,
        name: claims.name,
        role: claims.role,
        organization_id: claims.org,
        token_digest: digest,
        expires_at: claims.exp,
    })
}

/// Status of a user (`None` once deleted), cached briefly so every request
/// does not hit the database.
async fn user_status(state: &AppState, user_id: Uuid) -> Result<Option<UserStatus>, AppError> {
    if let Some(status) = state.user_status_cache.get(&user_id).await {
        return Ok(status);
    }

    let status = sqlx::query_as::<_, UserStatus>(
        "SELECT is_active, role, organization_id FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(&state.db)
    .await?;

    state.user_status_cache.insert(user_id, status.clone()).await;
    Ok(status)
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| AppError::Unauthorized("Missing bearer token".to_string()))?;
        authenticate_token(state, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-0123456789";

    fn user(role: Role) -> User {
        User {
            id: Uuid::new_v4(),
            name: "Robin Admin".to_string(),
            email: "robin@example.com".to_string(),
            password_hash: String::new(),
            role,
            organization_id: Some(Uuid::new_v4()),
            is_active: true,
            last_login: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn auth_user(role: Role, org: Option<Uuid>) -> AuthUser {
        AuthUser {
            id: Uuid::new_v4(),
            name: "Caller".to_string(),
            role,
            organization_id: org,
            token_digest: String::new(),
            expires_at: 0,
        }
    }

    #[test]
    fn test_token_round_trip() {
        let user = user(Role::Admin);
        let token = issue_token(&user, SECRET, 1).unwrap();
        let claims = decode_token(&token, SECRET).unwrap();

        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.role, Role::Admin);
        assert_eq!(claims.org, user.organization_id);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = issue_token(&user(Role::Agent1), SECRET, 1).unwrap();
        let err = decode_token(&token, "another-secret-9876543210").unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = issue_token(&user(Role::Agent1), SECRET, -2).unwrap();
        assert!(matches!(
            decode_token(&token, SECRET),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_token_digest_is_stable_hex() {
        let digest = token_digest("abc");
        assert_eq!(digest, token_digest("abc"));
        assert_eq!(digest.len(), 64);
        assert_ne!(digest, token_digest("abd"));
    }

    #[test]
    fn test_require_roles() {
        let agent2 = auth_user(Role::Agent2, Some(Uuid::new_v4()));
        assert!(agent2.require_roles(&[Role::Agent2]).is_ok());
        assert!(matches!(
            agent2.require_roles(&[Role::Admin, Role::Superadmin]),
            Err(AppError::Forbidden(_))
        ));
    }

    #[test]
    fn test_effective_organization() {
        let own = Uuid::new_v4();
        let other = Uuid::new_v4();

        let admin = auth_user(Role::Admin, Some(own));
        assert_eq!(admin.effective_organization(None).unwrap(), own);
        assert_eq!(admin.effective_organization(Some(own)).unwrap(), own);
        assert!(matches!(
            admin.effective_organization(Some(other)),
            Err(AppError::Forbidden(_))
        ));

        let superadmin = auth_user(Role::Superadmin, None);
        assert_eq!(superadmin.effective_organization(Some(other)).unwrap(), other);
        assert!(matches!(
            superadmin.effective_organization(None),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn test_status_admits_only_matching_claims() {
        let mut account = user(Role::Agent2);
        let claims = decode_token(&issue_token(&account, SECRET, 1).unwrap(), SECRET).unwrap();
        assert!(UserStatus::of(&account).admits(&claims));

        account.role = Role::Agent1;
        assert!(!UserStatus::of(&account).admits(&claims));

        account.role = Role::Agent2;
        account.organization_id = Some(Uuid::new_v4());
        assert!(!UserStatus::of(&account).admits(&claims));

        account.organization_id = claims.org;
        account.is_active = false;
        assert!(!UserStatus::of(&account).admits(&claims));
    }

    #[test]
    fn test_password_length() {
        assert!(validate_password("12345").is_err());
        assert!(validate_password("123456").is_ok());
    }

    #[tokio::test]
    async fn test_hash_and_verify() {
        let hash = hash_password_with_cost("hunter22".to_string(), 4).await.unwrap();
        assert!(verify_password("hunter22".to_string(), hash.clone()).await.unwrap());
        assert!(!verify_password("hunter23".to_string(), hash).await.unwrap());
    }
}
