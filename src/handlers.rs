use crate::auth::{AuthUser, UserStatus};
use crate::config::Config;
use crate::db_storage::LeadStorage;
use crate::duplicates::ContactLocks;
use crate::errors::AppError;
use crate::events::Broadcaster;
use crate::lead_service::{self, MANAGER_ROLES};
use crate::models::*;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use moka::future::Cache;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub db: PgPool,
    /// Application configuration.
    pub config: Config,
    /// Publisher for real-time lead events.
    pub broadcaster: Broadcaster,
    /// Serializes duplicate check-and-write per organization and contact value.
    pub contact_locks: ContactLocks,
    /// Digests of logged-out tokens, kept until the tokens would have expired anyway.
    pub revoked_tokens: Cache<String, ()>,
    /// Short-lived cache of account status consulted on every authenticated
    /// request. `None` marks a deleted account.
    pub user_status_cache: Cache<Uuid, Option<UserStatus>>,
}

impl AppState {
    pub fn new(db: PgPool, config: Config) -> Self {
        let token_lifetime = Duration::from_secs(config.jwt_expiry_hours.max(1) as u64 * 3600);

        Self {
            broadcaster: Broadcaster::new(config.event_channel_capacity),
            contact_locks: ContactLocks::new(),
            revoked_tokens: Cache::builder()
                .time_to_live(token_lifetime)
                .max_capacity(100_000)
                .build(),
            user_status_cache: Cache::builder()
                .time_to_live(Duration::from_secs(60))
                .max_capacity(10_000)
                .build(),
            db,
            config,
        }
    }
}

/// Health check endpoint.
///
/// Returns the service status, version, and the number of connected sockets.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "rust-leads-api",
            "version": env!("CARGO_PKG_VERSION"),
            "sockets": state.broadcaster.subscriber_count(),
        })),
    )
}

/// POST /api/leads
///
/// Creates a lead in the caller's organization. Phone numbers are normalized
/// to `+1` + 10 digits and the lead is flagged (not rejected) when its phone
/// or email matches an earlier lead of the same organization.
///
/// # Returns
///
/// * `201 Created` with the stored lead and the duplicate verdict.
pub async fn create_lead(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<CreateLeadRequest>,
) -> Result<(StatusCode, Json<LeadResponse>), AppError> {
    tracing::info!("POST /leads - by {} ({})", user.name, user.role);

    let (lead, duplicate) = lead_service::create_lead(&state, &user, payload).await?;

    let message = if duplicate.is_duplicate {
        "Lead created and flagged as a possible duplicate"
    } else {
        "Lead created successfully"
    };

    Ok((
        StatusCode::CREATED,
        Json(LeadResponse {
            success: true,
            message: message.to_string(),
            data: lead,
            duplicate: Some(duplicate),
        }),
    ))
}

/// GET /api/leads
///
/// Lists the leads visible to the caller: their own creations (agent1),
/// their assignments (agent2), their organization (admin) or everything
/// (superadmin), filtered and paginated by the query parameters.
pub async fn list_leads(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(params): Query<LeadQueryParams>,
) -> Result<Json<LeadListResponse>, AppError> {
    tracing::debug!("GET /leads - params: {:?}", params);

    let scope = lead_service::scope_for(&user, params.organization)?;
    let (leads, total) = LeadStorage::new(state.db.clone())
        .list(&scope, &params)
        .await?;
    let (page, limit) = params.pagination();

    Ok(Json(LeadListResponse {
        success: true,
        data: leads,
        total,
        page,
        pages: (total + limit - 1) / limit,
    }))
}

/// GET /api/leads/:id
pub async fn get_lead(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let lead = lead_service::load_visible_lead(&state, &user, id).await?;
    Ok(Json(json!({ "success": true, "data": lead })))
}

/// PUT /api/leads/:id
///
/// Follow-up agents and admins outside the privileged organization may only
/// change workflow fields; a contact change re-runs duplicate matching.
pub async fn update_lead(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateLeadRequest>,
) -> Result<Json<LeadResponse>, AppError> {
    tracing::info!("PUT /leads/{} - by {} ({})", id, user.name, user.role);

    let (lead, duplicate) = lead_service::update_lead(&state, &user, id, payload).await?;

    Ok(Json(LeadResponse {
        success: true,
        message: "Lead updated successfully".to_string(),
        data: lead,
        duplicate,
    }))
}

/// DELETE /api/leads/:id
pub async fn delete_lead(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageResponse>, AppError> {
    tracing::info!("DELETE /leads/{} - by {}", id, user.name);

    let lead = lead_service::delete_lead(&state, &user, id).await?;
    Ok(Json(MessageResponse::ok(format!(
        "Lead {} deleted successfully",
        lead.lead_id
    ))))
}

/// POST /api/leads/:id/assign
pub async fn assign_lead(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<AssignLeadRequest>,
) -> Result<Json<LeadResponse>, AppError> {
    tracing::info!("POST /leads/{}/assign - agent {}", id, payload.agent_id);

    let lead = lead_service::assign_lead(&state, &user, id, payload).await?;
    Ok(Json(LeadResponse {
        success: true,
        message: "Lead assigned successfully".to_string(),
        data: lead,
        duplicate: None,
    }))
}

/// POST /api/leads/:id/unassign
pub async fn unassign_lead(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<LeadResponse>, AppError> {
    tracing::info!("POST /leads/{}/unassign", id);

    let lead = lead_service::unassign_lead(&state, &user, id).await?;
    Ok(Json(LeadResponse {
        success: true,
        message: "Lead unassigned successfully".to_string(),
        data: lead,
        duplicate: None,
    }))
}

#[derive(Debug, Deserialize)]
pub struct OrganizationQuery {
    pub organization: Option<Uuid>,
}

/// GET /api/leads/available-agents
///
/// Active follow-up agents the caller can assign leads to, least loaded first.
pub async fn available_agents(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<OrganizationQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    user.require_roles(MANAGER_ROLES)?;

    let organization_id = user.effective_organization(query.organization)?;
    let agents = LeadStorage::new(state.db.clone())
        .available_agents(organization_id)
        .await?;

    Ok(Json(json!({ "success": true, "data": agents })))
}

/// GET /api/leads/dashboard/stats
///
/// Aggregate counts over the leads visible to the caller.
pub async fn dashboard_stats(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<OrganizationQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let scope = lead_service::scope_for(&user, query.organization)?;
    let stats = LeadStorage::new(state.db.clone()).stats(&scope).await?;

    Ok(Json(json!({ "success": true, "data": stats })))
}
