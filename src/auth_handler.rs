use crate::account_storage::{AccountStorage, NewUser, UserChanges};
use crate::auth::{
    hash_password, issue_token, validate_password, verify_password, AuthUser, UserStatus,
};
use crate::contact::normalize_email;
use crate::errors::AppError;
use crate::handlers::AppState;
use crate::lead_service::MANAGER_ROLES;
use crate::models::*;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

const AGENT_ROLES: &[Role] = &[Role::Agent1, Role::Agent2];
const ADMIN_ASSIGNABLE_ROLES: &[Role] = &[Role::Agent1, Role::Agent2, Role::Admin];

fn required_email(raw: &str) -> Result<String, AppError> {
    normalize_email(raw)
        .map_err(AppError::BadRequest)?
        .ok_or_else(|| AppError::BadRequest("Email is required".to_string()))
}

fn required_name(raw: &str) -> Result<String, AppError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("Name is required".to_string()));
    }
    Ok(name.to_string())
}

/// POST /api/auth/login
///
/// Exchanges email and password for a bearer token. Inactive accounts and
/// accounts of inactive organizations are refused.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, AppError> {
    let email = payload.email.trim().to_lowercase();
    tracing::info!("POST /auth/login - {}", email);

    let accounts = AccountStorage::new(state.db.clone());
    let invalid = || AppError::Unauthorized("Invalid email or password".to_string());

    let user = accounts.find_user_by_email(&email).await?.ok_or_else(invalid)?;
    if !verify_password(payload.password, user.password_hash.clone()).await? {
        return Err(invalid());
    }

    if !user.is_active {
        return Err(AppError::Unauthorized("Account is inactive".to_string()));
    }
    if let Some(org) = user.organization_id {
        if !accounts.is_organization_active(org).await? {
            return Err(AppError::Unauthorized(
                "Organization is inactive".to_string(),
            ));
        }
    }

    accounts.touch_last_login(user.id).await?;
    let user = accounts.get_user(user.id).await?;
    let token = issue_token(&user, &state.config.jwt_secret, state.config.jwt_expiry_hours)?;
    state
        .user_status_cache
        .insert(user.id, Some(UserStatus::of(&user)))
        .await;

    tracing::info!("✓ {} logged in as {}", user.email, user.role);
    Ok(Json(AuthResponse {
        success: true,
        token,
        user,
    }))
}

/// POST /api/auth/register
///
/// Open only while no account exists (bootstraps the first superadmin).
/// Afterwards admins create agents in their own organization and
/// superadmins create any account.
pub async fn register(
    State(state): State<Arc<AppState>>,
    caller: Option<AuthUser>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    tracing::info!("POST /auth/register - role {}", payload.role);

    let accounts = AccountStorage::new(state.db.clone());
    let name = required_name(&payload.name)?;
    let email = required_email(&payload.email)?;
    validate_password(&payload.password)?;

    let bootstrapping = accounts.count_users().await? == 0;
    let organization_id = if bootstrapping {
        if payload.role != Role::Superadmin {
            return Err(AppError::BadRequest(
                "The first account must be a superadmin".to_string(),
            ));
        }
        tracing::warn!("Bootstrapping first superadmin account {}", email);
        payload.organization
    } else {
        let caller = caller.ok_or_else(|| {
            AppError::Unauthorized("Authentication required to register users".to_string())
        })?;
        resolve_new_account_org(&caller, payload.role, payload.organization)?
    };

    if let Some(org) = organization_id {
        accounts.get_organization(org).await.map_err(|e| match e {
            AppError::NotFound(msg) => AppError::BadRequest(msg),
            other => other,
        })?;
    }

    let new_user = NewUser {
        name,
        email,
        password_hash: hash_password(payload.password).await?,
        role: payload.role,
        organization_id,
    };
    let user = if bootstrapping {
        // Another request may have bootstrapped since the count above.
        accounts
            .insert_first_user(new_user)
            .await?
            .ok_or_else(|| {
                AppError::Unauthorized("Authentication required to register users".to_string())
            })?
    } else {
        accounts.insert_user(new_user).await?
    };

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "User registered successfully",
            "data": user,
        })),
    ))
}

/// Organization a new account lands in, enforcing who may create which role.
pub fn resolve_new_account_org(
    caller: &AuthUser,
    role: Role,
    requested: Option<Uuid>,
) -> Result<Option<Uuid>, AppError> {
    match caller.role {
        Role::Superadmin => match (role, requested) {
            (Role::Superadmin, org) => Ok(org),
            (_, Some(org)) => Ok(Some(org)),
            (_, None) => Err(AppError::BadRequest(
                "organization is required for this role".to_string(),
            )),
        },
        Role::Admin => {
            if !role.is_agent() {
                return Err(AppError::Forbidden(
                    "Admins can only create agent accounts".to_string(),
                ));
            }
            Ok(Some(caller.effective_organization(requested)?))
        }
        Role::Agent1 | Role::Agent2 => Err(AppError::Forbidden(
            "Agents cannot register users".to_string(),
        )),
    }
}

/// POST /api/auth/logout
///
/// Revokes the presented token until it would have expired.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Json<MessageResponse> {
    state.revoked_tokens.insert(user.token_digest.clone(), ()).await;
    tracing::info!("{} logged out", user.name);
    Json(MessageResponse::ok("Logged out successfully"))
}

/// GET /api/auth/me
pub async fn me(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let account = AccountStorage::new(state.db.clone()).get_user(user.id).await?;
    Ok(Json(json!({ "success": true, "data": account })))
}

/// PUT /api/auth/profile
pub async fn update_profile(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<UpdateProfileRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let changes = UserChanges {
        name: payload.name.as_deref().map(required_name).transpose()?,
        email: payload.email.as_deref().map(required_email).transpose()?,
        ..Default::default()
    };

    let account = AccountStorage::new(state.db.clone())
        .update_user(user.id, changes)
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": "Profile updated successfully",
        "data": account,
    })))
}

/// PUT /api/auth/change-password
pub async fn change_password(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    let accounts = AccountStorage::new(state.db.clone());
    let account = accounts.get_user(user.id).await?;

    if !verify_password(payload.current_password, account.password_hash).await? {
        return Err(AppError::BadRequest(
            "Current password is incorrect".to_string(),
        ));
    }
    validate_password(&payload.new_password)?;

    accounts
        .update_user(
            user.id,
            UserChanges {
                password_hash: Some(hash_password(payload.new_password).await?),
                ..Default::default()
            },
        )
        .await?;

    tracing::info!("🔑 Password changed for {}", account.email);
    Ok(Json(MessageResponse::ok("Password changed successfully")))
}

// ============ Account administration ============

/// 403 unless `caller` may administer `target`: superadmins manage everyone,
/// admins manage agents of their own organization.
pub fn ensure_can_manage(caller: &AuthUser, target: &User) -> Result<(), AppError> {
    if caller.id == target.id {
        return Err(AppError::BadRequest(
            "Use the profile endpoints to change your own account".to_string(),
        ));
    }
    match caller.role {
        Role::Superadmin => Ok(()),
        Role::Admin if target.role.is_agent() && target.organization_id == caller.organization_id => {
            Ok(())
        }
        _ => Err(AppError::Forbidden(
            "Not allowed to manage this account".to_string(),
        )),
    }
}

async fn load_managed(
    state: &AppState,
    caller: &AuthUser,
    id: Uuid,
    expected: &[Role],
) -> Result<User, AppError> {
    let target = AccountStorage::new(state.db.clone()).get_user(id).await?;
    if !expected.contains(&target.role) {
        return Err(AppError::NotFound(format!(
            "No {} account with id {}",
            expected
                .iter()
                .map(Role::as_str)
                .collect::<Vec<_>>()
                .join("/"),
            id
        )));
    }
    ensure_can_manage(caller, &target)?;
    Ok(target)
}

async fn apply_account_update(
    state: &AppState,
    target: &User,
    payload: UpdateAccountRequest,
    allowed_roles: &[Role],
) -> Result<User, AppError> {
    if let Some(role) = payload.role {
        if !allowed_roles.contains(&role) {
            return Err(AppError::BadRequest(format!(
                "Role cannot be changed to '{}' here",
                role
            )));
        }
    }

    let changes = UserChanges {
        name: payload.name.as_deref().map(required_name).transpose()?,
        email: payload.email.as_deref().map(required_email).transpose()?,
        role: payload.role,
        is_active: payload.is_active,
        ..Default::default()
    };

    let updated = AccountStorage::new(state.db.clone())
        .update_user(target.id, changes)
        .await?;
    state.user_status_cache.invalidate(&target.id).await;

    tracing::info!("✓ Account {} updated", updated.email);
    Ok(updated)
}

async fn remove_account(state: &AppState, target: &User) -> Result<(), AppError> {
    let unassigned = AccountStorage::new(state.db.clone())
        .delete_user(target.id)
        .await?;
    state.user_status_cache.invalidate(&target.id).await;

    tracing::info!(
        "🗑️ Account {} deleted, {} lead(s) unassigned",
        target.email,
        unassigned.len()
    );
    if let Some(org) = target.organization_id {
        if !unassigned.is_empty() {
            state.broadcaster.stats_updated(org);
        }
    }
    Ok(())
}

/// GET /api/auth/agents
pub async fn list_agents(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(params): Query<ScopeQueryParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    user.require_roles(MANAGER_ROLES)?;

    let roles = match params.role {
        Some(role) if role.is_agent() => vec![role],
        Some(role) => {
            return Err(AppError::BadRequest(format!(
                "'{}' is not an agent role",
                role
            )))
        }
        None => AGENT_ROLES.to_vec(),
    };
    let organization = if user.is_superadmin() {
        params.organization
    } else {
        Some(user.effective_organization(params.organization)?)
    };

    let agents = AccountStorage::new(state.db.clone())
        .list_users(&roles, organization)
        .await?;
    Ok(Json(json!({ "success": true, "data": agents })))
}

/// PUT /api/auth/agents/:id
pub async fn update_agent(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateAccountRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    user.require_roles(MANAGER_ROLES)?;

    let target = load_managed(&state, &user, id, AGENT_ROLES).await?;
    let updated = apply_account_update(&state, &target, payload, AGENT_ROLES).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Agent updated successfully",
        "data": updated,
    })))
}

/// DELETE /api/auth/agents/:id
pub async fn delete_agent(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageResponse>, AppError> {
    user.require_roles(MANAGER_ROLES)?;

    let target = load_managed(&state, &user, id, AGENT_ROLES).await?;
    remove_account(&state, &target).await?;
    Ok(Json(MessageResponse::ok("Agent deleted successfully")))
}

/// GET /api/auth/admins
pub async fn list_admins(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(params): Query<ScopeQueryParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    user.require_roles(&[Role::Superadmin])?;

    let admins = AccountStorage::new(state.db.clone())
        .list_users(&[Role::Admin], params.organization)
        .await?;
    Ok(Json(json!({ "success": true, "data": admins })))
}

/// PUT /api/auth/admins/:id
pub async fn update_admin(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateAccountRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    user.require_roles(&[Role::Superadmin])?;

    let target = load_managed(&state, &user, id, &[Role::Admin]).await?;
    let updated = apply_account_update(&state, &target, payload, ADMIN_ASSIGNABLE_ROLES).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Admin updated successfully",
        "data": updated,
    })))
}

/// DELETE /api/auth/admins/:id
pub async fn delete_admin(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageResponse>, AppError> {
    user.require_roles(&[Role::Superadmin])?;

    let target = load_managed(&state, &user, id, &[Role::Admin]).await?;
    remove_account(&state, &target).await?;
    Ok(Json(MessageResponse::ok("Admin deleted successfully")))
}

/// PUT /api/auth/users/:id
///
/// Superadmin-only full edit: role, organization, active flag and password reset.
pub async fn update_user(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateUserRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    user.require_roles(&[Role::Superadmin])?;

    let accounts = AccountStorage::new(state.db.clone());
    let target = accounts.get_user(id).await?;
    ensure_can_manage(&user, &target)?;

    let role = payload.role.unwrap_or(target.role);
    let organization = payload.organization.or(target.organization_id);
    if role != Role::Superadmin && organization.is_none() {
        return Err(AppError::BadRequest(
            "organization is required for this role".to_string(),
        ));
    }
    if let Some(org) = payload.organization {
        accounts.get_organization(org).await?;
    }

    let password_hash = match payload.password {
        Some(password) => {
            validate_password(&password)?;
            Some(hash_password(password).await?)
        }
        None => None,
    };

    let changes = UserChanges {
        name: payload.name.as_deref().map(required_name).transpose()?,
        email: payload.email.as_deref().map(required_email).transpose()?,
        role: payload.role,
        organization_id: payload.organization,
        is_active: payload.is_active,
        password_hash,
    };

    let updated = accounts.update_user(id, changes).await?;
    state.user_status_cache.invalidate(&id).await;

    tracing::info!("✓ User {} updated by superadmin {}", updated.email, user.name);
    Ok(Json(json!({
        "success": true,
        "message": "User updated successfully",
        "data": updated,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn caller(role: Role, org: Option<Uuid>) -> AuthUser {
        AuthUser {
            id: Uuid::new_v4(),
            name: "Caller".to_string(),
            role,
            organization_id: org,
            token_digest: String::new(),
            expires_at: 0,
        }
    }

    fn account(role: Role, org: Option<Uuid>) -> User {
        User {
            id: Uuid::new_v4(),
            name: "Target".to_string(),
            email: "target@example.com".to_string(),
            password_hash: String::new(),
            role,
            organization_id: org,
            is_active: true,
            last_login: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_admin_creates_agents_in_own_org_only() {
        let org = Uuid::new_v4();
        let admin = caller(Role::Admin, Some(org));

        assert_eq!(
            resolve_new_account_org(&admin, Role::Agent2, None).unwrap(),
            Some(org)
        );
        assert!(matches!(
            resolve_new_account_org(&admin, Role::Admin, None),
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            resolve_new_account_org(&admin, Role::Agent1, Some(Uuid::new_v4())),
            Err(AppError::Forbidden(_))
        ));
    }

    #[test]
    fn test_superadmin_must_pick_org_for_scoped_roles() {
        let superadmin = caller(Role::Superadmin, None);
        let org = Uuid::new_v4();

        assert_eq!(
            resolve_new_account_org(&superadmin, Role::Admin, Some(org)).unwrap(),
            Some(org)
        );
        assert!(resolve_new_account_org(&superadmin, Role::Agent1, None).is_err());
        assert_eq!(
            resolve_new_account_org(&superadmin, Role::Superadmin, None).unwrap(),
            None
        );
    }

    #[test]
    fn test_agents_cannot_register() {
        let agent = caller(Role::Agent1, Some(Uuid::new_v4()));
        assert!(matches!(
            resolve_new_account_org(&agent, Role::Agent1, None),
            Err(AppError::Forbidden(_))
        ));
    }

    #[test]
    fn test_manage_rules() {
        let org = Uuid::new_v4();
        let admin = caller(Role::Admin, Some(org));

        assert!(ensure_can_manage(&admin, &account(Role::Agent2, Some(org))).is_ok());
        assert!(ensure_can_manage(&admin, &account(Role::Agent2, Some(Uuid::new_v4()))).is_err());
        assert!(ensure_can_manage(&admin, &account(Role::Admin, Some(org))).is_err());

        let superadmin = caller(Role::Superadmin, None);
        assert!(ensure_can_manage(&superadmin, &account(Role::Admin, Some(org))).is_ok());

        let mut own = account(Role::Superadmin, None);
        own.id = superadmin.id;
        assert!(matches!(
            ensure_can_manage(&superadmin, &own),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn test_required_fields() {
        assert_eq!(required_email(" A@B.co ").unwrap(), "a@b.co");
        assert!(required_email("").is_err());
        assert!(required_name("  ").is_err());
    }
}
