//! Lead workflows shared by the HTTP handlers:
//! 1. Normalize contact fields
//! 2. Serialize and run duplicate detection
//! 3. Persist
//! 4. Notify connected dashboards
use crate::account_storage::AccountStorage;
use crate::auth::AuthUser;
use crate::contact::{normalize_optional_email, normalize_optional_phone};
use crate::db_storage::{completion_percentage, generate_lead_code, LeadScope, LeadStorage};
use crate::duplicates::{find_duplicate, ContactKey, DuplicateMatch};
use crate::errors::AppError;
use crate::handlers::AppState;
use crate::models::{
    AssignLeadRequest, CreateLeadRequest, DuplicateSummary, Lead, LeadCategory, LeadStatus,
    QualificationStatus, Role, UpdateLeadRequest,
};
use bigdecimal::BigDecimal;
use chrono::Utc;
use uuid::Uuid;

const CREDIT_SCORE_RANGE: std::ops::RangeInclusive<i32> = 300..=850;

/// Roles allowed to create leads.
pub const CREATOR_ROLES: &[Role] = &[Role::Agent1, Role::Admin, Role::Superadmin];
/// Roles allowed to assign, unassign and delete leads.
pub const MANAGER_ROLES: &[Role] = &[Role::Admin, Role::Superadmin];

/// Leads visible to `user`.
pub fn scope_for(user: &AuthUser, requested_org: Option<Uuid>) -> Result<LeadScope, AppError> {
    Ok(match user.role {
        Role::Superadmin => LeadScope::All {
            organization: requested_org,
        },
        Role::Admin => LeadScope::Organization(user.effective_organization(requested_org)?),
        Role::Agent1 => LeadScope::CreatedBy(user.id),
        Role::Agent2 => LeadScope::AssignedTo(user.id),
    })
}

/// Load a lead the caller is allowed to see. Leads outside the caller's scope
/// are reported as missing.
pub async fn load_visible_lead(state: &AppState, user: &AuthUser, id: Uuid) -> Result<Lead, AppError> {
    let lead = LeadStorage::new(state.db.clone()).get_required(id).await?;
    if !scope_for(user, None)?.contains(&lead) {
        return Err(AppError::NotFound(format!("Lead with id {} not found", id)));
    }
    Ok(lead)
}

fn clean_text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn check_non_negative(field: &str, value: Option<&BigDecimal>) -> Result<(), AppError> {
    match value {
        Some(v) if v < &BigDecimal::from(0) => {
            Err(AppError::BadRequest(format!("{} cannot be negative", field)))
        }
        _ => Ok(()),
    }
}

fn validate_debt_profile(
    total_debt_amount: Option<&BigDecimal>,
    monthly_debt_payment: Option<&BigDecimal>,
    number_of_creditors: Option<i32>,
    credit_score: Option<i32>,
) -> Result<(), AppError> {
    check_non_negative("totalDebtAmount", total_debt_amount)?;
    check_non_negative("monthlyDebtPayment", monthly_debt_payment)?;

    if number_of_creditors.is_some_and(|n| n < 0) {
        return Err(AppError::BadRequest(
            "numberOfCreditors cannot be negative".to_string(),
        ));
    }
    if let Some(score) = credit_score {
        if !CREDIT_SCORE_RANGE.contains(&score) {
            return Err(AppError::BadRequest(format!(
                "creditScore must be between {} and {}",
                CREDIT_SCORE_RANGE.start(),
                CREDIT_SCORE_RANGE.end()
            )));
        }
    }
    Ok(())
}

fn apply_duplicate(lead: &mut Lead, found: Option<DuplicateMatch>) -> DuplicateSummary {
    lead.is_duplicate = found.is_some();
    lead.duplicate_of = found.map(|m| m.original);
    lead.duplicate_reason = found.map(|m| m.reason);
    DuplicateMatch::summary(found)
}

/// Build the unsaved lead for a creation request. Pure apart from id/time generation.
pub fn build_lead(
    user: &AuthUser,
    organization_id: Uuid,
    request: CreateLeadRequest,
) -> Result<Lead, AppError> {
    let name = request.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::BadRequest("Lead name is required".to_string()));
    }

    let phone = normalize_optional_phone(request.phone.as_deref()).map_err(AppError::BadRequest)?;
    let alternate_phone =
        normalize_optional_phone(request.alternate_phone.as_deref()).map_err(AppError::BadRequest)?;
    let email = normalize_optional_email(request.email.as_deref()).map_err(AppError::BadRequest)?;

    validate_debt_profile(
        request.total_debt_amount.as_ref(),
        request.monthly_debt_payment.as_ref(),
        request.number_of_creditors,
        request.credit_score,
    )?;

    let mut lead = Lead {
        id: Uuid::new_v4(),
        lead_id: generate_lead_code(),
        organization_id,
        name,
        email,
        phone,
        alternate_phone,
        debt_category: clean_text(request.debt_category),
        debt_types: request
            .debt_types
            .into_iter()
            .filter_map(|t| clean_text(Some(t)))
            .collect(),
        total_debt_amount: request.total_debt_amount,
        number_of_creditors: request.number_of_creditors,
        monthly_debt_payment: request.monthly_debt_payment,
        credit_score: request.credit_score,
        credit_score_range: clean_text(request.credit_score_range),
        category: request.category.unwrap_or(LeadCategory::Cold),
        completion_percentage: 0,
        status: LeadStatus::New,
        qualification_status: QualificationStatus::Pending,
        lead_progress_status: None,
        notes: clean_text(request.notes),
        assigned_to: None,
        assigned_by: None,
        assigned_at: None,
        assignment_notes: None,
        is_duplicate: false,
        duplicate_of: None,
        duplicate_reason: None,
        created_by: Some(user.id),
        created_at: Utc::now(),
        last_updated_by: None,
        last_updated_at: None,
    };
    lead.completion_percentage = completion_percentage(&lead);
    Ok(lead)
}

/// Create a lead, flagging (never rejecting) duplicates within its organization.
///
/// The creation time is stamped while the contact locks are held, so among
/// leads sharing a contact value the lock order is also the `created_at`
/// order and the first one in stays the canonical original.
pub async fn create_lead(
    state: &AppState,
    user: &AuthUser,
    request: CreateLeadRequest,
) -> Result<(Lead, DuplicateSummary), AppError> {
    user.require_roles(CREATOR_ROLES)?;

    let organization_id = user.effective_organization(request.organization)?;
    let mut lead = build_lead(user, organization_id, request)?;

    let accounts = AccountStorage::new(state.db.clone());
    if !accounts.is_organization_active(organization_id).await? {
        return Err(AppError::BadRequest(
            "Organization is inactive or does not exist".to_string(),
        ));
    }

    let key = ContactKey::new(lead.phone.clone(), lead.email.clone());
    let (stored, summary) = {
        let _guard = state.contact_locks.acquire(organization_id, &key).await;
        lead.created_at = Utc::now();
        let found = find_duplicate(&state.db, organization_id, &key, None).await?;
        let summary = apply_duplicate(&mut lead, found);
        (LeadStorage::new(state.db.clone()).insert(&lead).await?, summary)
    };

    state.broadcaster.lead_created(&stored, &user.name);
    Ok((stored, summary))
}

/// Whether `user` may edit every field of leads in their scope.
pub async fn can_fully_edit(state: &AppState, user: &AuthUser) -> Result<bool, AppError> {
    match user.role {
        Role::Superadmin => Ok(true),
        Role::Admin => {
            let org = AccountStorage::new(state.db.clone())
                .get_organization(user.organization()?)
                .await?;
            Ok(org
                .name
                .trim()
                .eq_ignore_ascii_case(state.config.privileged_org_name.trim()))
        }
        Role::Agent1 | Role::Agent2 => Ok(false),
    }
}

/// Apply `request` to `lead`. Returns true when phone or email changed.
pub fn apply_update(lead: &mut Lead, request: UpdateLeadRequest) -> Result<bool, AppError> {
    let before = (lead.phone.clone(), lead.email.clone());

    if let Some(name) = request.name {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::BadRequest("Lead name cannot be empty".to_string()));
        }
        lead.name = name;
    }
    if let Some(phone) = request.phone {
        lead.phone = normalize_optional_phone(Some(&phone)).map_err(AppError::BadRequest)?;
    }
    if let Some(phone) = request.alternate_phone {
        lead.alternate_phone =
            normalize_optional_phone(Some(&phone)).map_err(AppError::BadRequest)?;
    }
    if let Some(email) = request.email {
        lead.email = normalize_optional_email(Some(&email)).map_err(AppError::BadRequest)?;
    }

    validate_debt_profile(
        request.total_debt_amount.as_ref(),
        request.monthly_debt_payment.as_ref(),
        request.number_of_creditors,
        request.credit_score,
    )?;

    if request.debt_category.is_some() {
        lead.debt_category = clean_text(request.debt_category);
    }
    if let Some(types) = request.debt_types {
        lead.debt_types = types.into_iter().filter_map(|t| clean_text(Some(t))).collect();
    }
    if let Some(amount) = request.total_debt_amount {
        lead.total_debt_amount = Some(amount);
    }
    if let Some(count) = request.number_of_creditors {
        lead.number_of_creditors = Some(count);
    }
    if let Some(payment) = request.monthly_debt_payment {
        lead.monthly_debt_payment = Some(payment);
    }
    if let Some(score) = request.credit_score {
        lead.credit_score = Some(score);
    }
    if request.credit_score_range.is_some() {
        lead.credit_score_range = clean_text(request.credit_score_range);
    }
    if let Some(category) = request.category {
        lead.category = category;
    }
    if let Some(status) = request.status {
        lead.status = status;
    }
    if let Some(qualification) = request.qualification_status {
        lead.qualification_status = qualification;
    }
    if request.lead_progress_status.is_some() {
        lead.lead_progress_status = clean_text(request.lead_progress_status);
    }
    if request.notes.is_some() {
        lead.notes = clean_text(request.notes);
    }
    if request.assignment_notes.is_some() {
        lead.assignment_notes = clean_text(request.assignment_notes);
    }

    lead.completion_percentage = completion_percentage(lead);
    Ok((lead.phone.clone(), lead.email.clone()) != before)
}

/// Update a lead under the role rules: follow-up agents and admins outside
/// the privileged organization may only touch workflow fields.
pub async fn update_lead(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    request: UpdateLeadRequest,
) -> Result<(Lead, Option<DuplicateSummary>), AppError> {
    user.require_roles(&[Role::Agent2, Role::Admin, Role::Superadmin])?;

    let mut lead = load_visible_lead(state, user, id).await?;

    if request.touches_profile_fields() && !can_fully_edit(state, user).await? {
        return Err(AppError::Forbidden(
            "Only workflow fields (status, qualificationStatus, leadProgressStatus, notes) may be changed"
                .to_string(),
        ));
    }

    let previous_key = ContactKey::new(lead.phone.clone(), lead.email.clone());
    let contact_changed = apply_update(&mut lead, request)?;
    lead.last_updated_by = Some(user.id);
    lead.last_updated_at = Some(Utc::now());

    let storage = LeadStorage::new(state.db.clone());
    if !contact_changed {
        let stored = storage.save(&lead).await?;
        state.broadcaster.lead_updated(&stored, &user.name, None);
        return Ok((stored, None));
    }

    let key = ContactKey::new(lead.phone.clone(), lead.email.clone());
    let mut lock_keys = vec![previous_key, key.clone()];
    lock_keys.extend(
        storage
            .duplicates_of(lead.id)
            .await?
            .into_iter()
            .map(|d| ContactKey::new(d.phone, d.email)),
    );

    let (stored, summary, rematched) = {
        let _guard = state
            .contact_locks
            .acquire_all(lead.organization_id, &lock_keys)
            .await;
        let found = find_duplicate(
            &state.db,
            lead.organization_id,
            &key,
            Some((lead.created_at, lead.id)),
        )
        .await?;
        let summary = apply_duplicate(&mut lead, found);
        let stored = storage.save(&lead).await?;
        let rematched = rematch_dependents(state, &storage, &stored).await?;
        (stored, summary, rematched)
    };

    state.broadcaster.lead_updated(&stored, &user.name, None);
    for dependent in &rematched {
        state.broadcaster.lead_updated(dependent, &user.name, None);
    }
    Ok((stored, Some(summary)))
}

/// Re-run matching for the leads flagged as duplicates of `original` after
/// its contact fields changed. Returns the leads whose flags changed.
///
/// Must run under the contact locks of `original`'s old and new values. A
/// lead flagged between the unlocked read in `update_lead` and the locks
/// matched on a locked old value, so it is still found here.
async fn rematch_dependents(
    state: &AppState,
    storage: &LeadStorage,
    original: &Lead,
) -> Result<Vec<Lead>, AppError> {
    let mut changed = Vec::new();

    for mut dependent in storage.duplicates_of(original.id).await? {
        let key = ContactKey::new(dependent.phone.clone(), dependent.email.clone());
        let found = find_duplicate(
            &state.db,
            dependent.organization_id,
            &key,
            Some((dependent.created_at, dependent.id)),
        )
        .await?;

        let before = (dependent.duplicate_of, dependent.duplicate_reason);
        apply_duplicate(&mut dependent, found);
        if (dependent.duplicate_of, dependent.duplicate_reason) == before {
            continue;
        }

        tracing::info!(
            "🔁 Lead {} re-matched after {} changed contact: duplicate_of={:?}",
            dependent.lead_id,
            original.lead_id,
            dependent.duplicate_of
        );
        changed.push(storage.save(&dependent).await?);
    }

    Ok(changed)
}

/// Assign a lead to an active follow-up agent of the same organization.
pub async fn assign_lead(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    request: AssignLeadRequest,
) -> Result<Lead, AppError> {
    user.require_roles(MANAGER_ROLES)?;

    let mut lead = load_visible_lead(state, user, id).await?;
    let agent = AccountStorage::new(state.db.clone())
        .find_user(request.agent_id)
        .await?
        .ok_or_else(|| AppError::BadRequest("Agent not found".to_string()))?;

    if agent.role != Role::Agent2 || !agent.is_active {
        return Err(AppError::BadRequest(
            "Leads can only be assigned to active follow-up agents".to_string(),
        ));
    }
    if agent.organization_id != Some(lead.organization_id) {
        return Err(AppError::BadRequest(
            "Agent belongs to a different organization".to_string(),
        ));
    }

    let previous = lead.assigned_to;
    let now = Utc::now();
    lead.assigned_to = Some(agent.id);
    lead.assigned_by = Some(user.id);
    lead.assigned_at = Some(now);
    if request.notes.is_some() {
        lead.assignment_notes = clean_text(request.notes);
    }
    lead.last_updated_by = Some(user.id);
    lead.last_updated_at = Some(now);

    let stored = LeadStorage::new(state.db.clone()).save(&lead).await?;
    tracing::info!(
        "👤 Lead {} assigned to {} by {}",
        stored.lead_id,
        agent.email,
        user.name
    );

    state.broadcaster.lead_updated(&stored, &user.name, previous);
    Ok(stored)
}

pub async fn unassign_lead(state: &AppState, user: &AuthUser, id: Uuid) -> Result<Lead, AppError> {
    user.require_roles(MANAGER_ROLES)?;

    let mut lead = load_visible_lead(state, user, id).await?;
    let previous = lead
        .assigned_to
        .ok_or_else(|| AppError::BadRequest("Lead is not assigned".to_string()))?;

    lead.assigned_to = None;
    lead.assigned_by = None;
    lead.assigned_at = None;
    lead.assignment_notes = None;
    lead.last_updated_by = Some(user.id);
    lead.last_updated_at = Some(Utc::now());

    let stored = LeadStorage::new(state.db.clone()).save(&lead).await?;
    tracing::info!("Lead {} unassigned from {}", stored.lead_id, previous);

    state
        .broadcaster
        .lead_updated(&stored, &user.name, Some(previous));
    Ok(stored)
}

pub async fn delete_lead(state: &AppState, user: &AuthUser, id: Uuid) -> Result<Lead, AppError> {
    user.require_roles(MANAGER_ROLES)?;

    let lead = load_visible_lead(state, user, id).await?;
    if !LeadStorage::new(state.db.clone()).delete(id).await? {
        return Err(AppError::NotFound(format!("Lead with id {} not found", id)));
    }
    tracing::info!("🗑️ Lead {} deleted by {}", lead.lead_id, user.name);

    state.broadcaster.lead_deleted(&lead, &user.name);
    Ok(lead)
}
