use crate::account_storage::AccountStorage;
use crate::auth::AuthUser;
use crate::contact::{normalize_optional_email, normalize_optional_phone};
use crate::errors::AppError;
use crate::handlers::AppState;
use crate::lead_service::MANAGER_ROLES;
use crate::models::*;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Contact fields of an organization after normalization.
struct OrgContact {
    email: Option<String>,
    phone: Option<String>,
}

fn normalize_org_contact(
    email: Option<&str>,
    phone: Option<&str>,
) -> Result<OrgContact, AppError> {
    Ok(OrgContact {
        email: normalize_optional_email(email).map_err(AppError::BadRequest)?,
        phone: normalize_optional_phone(phone).map_err(AppError::BadRequest)?,
    })
}

/// GET /api/organizations
///
/// Superadmins see every organization, admins only their own.
pub async fn list_organizations(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<serde_json::Value>, AppError> {
    user.require_roles(MANAGER_ROLES)?;

    let accounts = AccountStorage::new(state.db.clone());
    let organizations = if user.is_superadmin() {
        accounts.list_organizations().await?
    } else {
        vec![accounts.get_organization(user.organization()?).await?]
    };

    Ok(Json(json!({ "success": true, "data": organizations })))
}

/// GET /api/organizations/:id
///
/// # Returns
///
/// * The organization with per-role user counts and its lead count.
pub async fn get_organization(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    user.require_roles(MANAGER_ROLES)?;
    user.ensure_organization(id)?;

    let accounts = AccountStorage::new(state.db.clone());
    let details = accounts
        .organization_details(accounts.get_organization(id).await?)
        .await?;

    Ok(Json(json!({ "success": true, "data": details })))
}

/// POST /api/organizations
pub async fn create_organization(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<CreateOrganizationRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    user.require_roles(&[Role::Superadmin])?;

    let name = payload.name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest(
            "Organization name is required".to_string(),
        ));
    }
    let contact = normalize_org_contact(
        payload.contact_email.as_deref(),
        payload.contact_phone.as_deref(),
    )?;

    let organization = AccountStorage::new(state.db.clone())
        .insert_organization(
            name,
            payload.description.as_deref(),
            contact.email.as_deref(),
            contact.phone.as_deref(),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "Organization created successfully",
            "data": organization,
        })),
    ))
}

/// PUT /api/organizations/:id
pub async fn update_organization(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateOrganizationRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    user.require_roles(&[Role::Superadmin])?;

    let name = payload.name.as_deref().map(str::trim);
    if name == Some("") {
        return Err(AppError::BadRequest(
            "Organization name cannot be empty".to_string(),
        ));
    }
    let contact = normalize_org_contact(
        payload.contact_email.as_deref(),
        payload.contact_phone.as_deref(),
    )?;

    let organization = AccountStorage::new(state.db.clone())
        .update_organization(
            id,
            name,
            payload.description.as_deref(),
            contact.email.as_deref(),
            contact.phone.as_deref(),
            payload.is_active,
        )
        .await?;

    if payload.is_active == Some(false) {
        // Members keep valid tokens until their cached status expires.
        tracing::warn!("Organization {} deactivated", organization.name);
    }

    Ok(Json(json!({
        "success": true,
        "message": "Organization updated successfully",
        "data": organization,
    })))
}

/// DELETE /api/organizations/:id
///
/// Refused with 409 while the organization still owns users or leads.
pub async fn delete_organization(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageResponse>, AppError> {
    user.require_roles(&[Role::Superadmin])?;

    AccountStorage::new(state.db.clone())
        .delete_organization(id)
        .await?;
    Ok(Json(MessageResponse::ok("Organization deleted successfully")))
}
