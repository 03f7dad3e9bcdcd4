use std::env;
use std::sync::Arc;
use uuid::Uuid;

use rust_leads_api::account_storage::{AccountStorage, NewUser};
use rust_leads_api::auth::AuthUser;
use rust_leads_api::config::Config;
use rust_leads_api::db::Database;
use rust_leads_api::db_storage::{LeadScope, LeadStorage};
use rust_leads_api::errors::AppError;
use rust_leads_api::events::user_room;
use rust_leads_api::handlers::AppState;
use rust_leads_api::lead_service;
use rust_leads_api::models::{
    AssignLeadRequest, CreateLeadRequest, DuplicateReason, Role, UpdateLeadRequest,
};

// Database-backed tests. Marked ignored so they never run against a real
// database by accident; set TEST_DATABASE_URL to run them.

async fn test_state() -> anyhow::Result<Arc<AppState>> {
    let db_url = env::var("TEST_DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("Set TEST_DATABASE_URL to run this test"))?;

    let db = Database::new(&db_url).await?;
    let config = Config {
        database_url: db_url,
        port: 0,
        jwt_secret: "storage-test-secret-0123456789".to_string(),
        jwt_expiry_hours: 1,
        privileged_org_name: "Reddington".to_string(),
        request_timeout_secs: 10,
        rate_limit_per_second: 20,
        rate_limit_burst: 50,
        event_channel_capacity: 64,
    };
    Ok(Arc::new(AppState::new(db.pool.clone(), config)))
}

/// A stored account of `role` in `organization_id`, as an authenticated caller.
async fn account(
    state: &AppState,
    organization_id: Option<Uuid>,
    role: Role,
) -> anyhow::Result<AuthUser> {
    let user = AccountStorage::new(state.db.clone())
        .insert_user(NewUser {
            name: format!("Test {}", role),
            email: format!("{}-{}@example.com", role, Uuid::new_v4().simple()),
            password_hash: "not-a-real-hash".to_string(),
            role,
            organization_id,
        })
        .await?;

    Ok(AuthUser {
        id: user.id,
        name: user.name,
        role: user.role,
        organization_id: user.organization_id,
        token_digest: String::new(),
        expires_at: 0,
    })
}

/// A fresh organization with one lead-entry agent in it.
async fn org_with_agent(state: &AppState) -> anyhow::Result<(Uuid, AuthUser)> {
    let org = AccountStorage::new(state.db.clone())
        .insert_organization(
            &format!("Test Org {}", Uuid::new_v4().simple()),
            None,
            None,
            None,
        )
        .await?;
    let caller = account(state, Some(org.id), Role::Agent1).await?;
    Ok((org.id, caller))
}

fn phone_update(phone: &str) -> UpdateLeadRequest {
    UpdateLeadRequest {
        phone: Some(phone.to_string()),
        ..Default::default()
    }
}

fn lead(name: &str, phone: Option<&str>, email: Option<&str>) -> CreateLeadRequest {
    CreateLeadRequest {
        name: name.to_string(),
        phone: phone.map(str::to_string),
        email: email.map(str::to_string),
        ..Default::default()
    }
}

#[tokio::test]
#[ignore]
async fn formatted_phone_is_flagged_against_earlier_lead() -> anyhow::Result<()> {
    let state = test_state().await?;
    let (_, agent) = org_with_agent(&state).await?;

    let (a, a_dup) =
        lead_service::create_lead(&state, &agent, lead("Alice", Some("+12025550123"), None)).await?;
    assert!(!a_dup.is_duplicate);

    let (b, b_dup) =
        lead_service::create_lead(&state, &agent, lead("Bob", Some("2025550123"), None)).await?;
    assert_eq!(b.phone.as_deref(), Some("+12025550123"));
    assert!(b.is_duplicate);
    assert_eq!(b.duplicate_of, Some(a.id));
    assert_eq!(b_dup.duplicate_reason, Some(DuplicateReason::Phone));

    // A third match still points at the earliest lead.
    let (c, _) = lead_service::create_lead(
        &state,
        &agent,
        lead("Carol", Some("(202) 555-0123"), None),
    )
    .await?;
    assert_eq!(c.duplicate_of, Some(a.id));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn leads_without_contact_are_never_flagged() -> anyhow::Result<()> {
    let state = test_state().await?;
    let (_, agent) = org_with_agent(&state).await?;

    let (_, first) = lead_service::create_lead(&state, &agent, lead("Same Name", None, None)).await?;
    let (_, second) = lead_service::create_lead(&state, &agent, lead("Same Name", None, None)).await?;
    assert!(!first.is_duplicate);
    assert!(!second.is_duplicate);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn organizations_do_not_share_duplicates() -> anyhow::Result<()> {
    let state = test_state().await?;
    let (_, agent_a) = org_with_agent(&state).await?;
    let (_, agent_b) = org_with_agent(&state).await?;
    let email = format!("shared-{}@example.com", Uuid::new_v4().simple());

    lead_service::create_lead(&state, &agent_a, lead("One", None, Some(&email))).await?;
    let (_, other_org) =
        lead_service::create_lead(&state, &agent_b, lead("Two", None, Some(&email))).await?;
    assert!(!other_org.is_duplicate);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn concurrent_creation_flags_exactly_one() -> anyhow::Result<()> {
    let state = test_state().await?;
    let (_, agent) = org_with_agent(&state).await?;

    let (first, second) = tokio::join!(
        lead_service::create_lead(&state, &agent, lead("Racer 1", Some("3125550199"), None)),
        lead_service::create_lead(&state, &agent, lead("Racer 2", Some("312-555-0199"), None)),
    );
    let (first, second) = (first?.0, second?.0);
    let flagged = [&first, &second].iter().filter(|l| l.is_duplicate).count();
    assert_eq!(flagged, 1);

    // The flagged lead is also the later one, so it stays the duplicate.
    let (original, duplicate) = if first.is_duplicate {
        (second, first)
    } else {
        (first, second)
    };
    assert_eq!(duplicate.duplicate_of, Some(original.id));
    assert!(duplicate.created_at > original.created_at);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn updated_contact_matches_only_earlier_leads() -> anyhow::Result<()> {
    let state = test_state().await?;
    let (org, agent) = org_with_agent(&state).await?;
    let superadmin = account(&state, None, Role::Superadmin).await?;

    let (first, _) = lead_service::create_lead(&state, &agent, lead("First", Some("5035550101"), None)).await?;
    let (second, _) = lead_service::create_lead(&state, &agent, lead("Second", Some("5035550102"), None)).await?;
    let (third, _) = lead_service::create_lead(&state, &agent, lead("Third", Some("5035550103"), None)).await?;

    // Matching a later lead does not make the earlier one a duplicate.
    let (updated, summary) =
        lead_service::update_lead(&state, &superadmin, first.id, phone_update("5035550102")).await?;
    assert!(!updated.is_duplicate);
    assert!(!summary.map(|s| s.is_duplicate).unwrap_or(true));

    let (updated, summary) =
        lead_service::update_lead(&state, &superadmin, third.id, phone_update("5035550102")).await?;
    assert!(updated.is_duplicate);
    assert_eq!(updated.duplicate_of, Some(first.id));
    assert_eq!(updated.duplicate_reason, Some(DuplicateReason::Phone));
    assert_eq!(summary.and_then(|s| s.duplicate_of), Some(first.id));

    let stored = LeadStorage::new(state.db.clone()).get_required(second.id).await?;
    assert!(!stored.is_duplicate);
    assert_eq!(stored.organization_id, org);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn clearing_contact_fields_clears_duplicate_flag() -> anyhow::Result<()> {
    let state = test_state().await?;
    let (_, agent) = org_with_agent(&state).await?;
    let superadmin = account(&state, None, Role::Superadmin).await?;

    lead_service::create_lead(&state, &agent, lead("Kept", Some("6175550110"), Some("kept@example.com"))).await?;
    let (flagged, _) =
        lead_service::create_lead(&state, &agent, lead("Cleared", Some("6175550110"), Some("kept@example.com"))).await?;
    assert_eq!(flagged.duplicate_reason, Some(DuplicateReason::Both));

    let cleared = UpdateLeadRequest {
        phone: Some(String::new()),
        email: Some("  ".to_string()),
        ..Default::default()
    };
    let (updated, _) = lead_service::update_lead(&state, &superadmin, flagged.id, cleared).await?;
    assert!(!updated.is_duplicate);
    assert_eq!(updated.duplicate_of, None);
    assert_eq!(updated.duplicate_reason, None);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn dependents_follow_when_original_contact_changes() -> anyhow::Result<()> {
    let state = test_state().await?;
    let (_, agent) = org_with_agent(&state).await?;
    let superadmin = account(&state, None, Role::Superadmin).await?;

    let (original, _) = lead_service::create_lead(&state, &agent, lead("Original", Some("7185550120"), None)).await?;
    let (second, _) = lead_service::create_lead(&state, &agent, lead("Second", Some("7185550120"), None)).await?;
    let (third, _) = lead_service::create_lead(&state, &agent, lead("Third", Some("7185550120"), None)).await?;
    assert_eq!(second.duplicate_of, Some(original.id));
    assert_eq!(third.duplicate_of, Some(original.id));

    let mut rx = state.broadcaster.subscribe();
    lead_service::update_lead(&state, &superadmin, original.id, phone_update("7185550199")).await?;

    let storage = LeadStorage::new(state.db.clone());
    let second = storage.get_required(second.id).await?;
    let third = storage.get_required(third.id).await?;
    assert!(!second.is_duplicate);
    assert_eq!(second.duplicate_of, None);
    assert_eq!(second.duplicate_reason, None);
    assert_eq!(third.duplicate_of, Some(second.id));

    let mut updated_ids = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        if envelope.event_name == "leadUpdated" {
            let json: serde_json::Value = serde_json::from_str(&envelope.json)?;
            updated_ids.push(json["data"]["id"].as_str().unwrap_or_default().to_string());
        }
    }
    for id in [original.id, second.id, third.id] {
        assert!(updated_ids.contains(&id.to_string()), "no leadUpdated for {}", id);
    }
    Ok(())
}

#[tokio::test]
#[ignore]
async fn deleting_original_keeps_duplicate_flag() -> anyhow::Result<()> {
    let state = test_state().await?;
    let (_, agent) = org_with_agent(&state).await?;
    let superadmin = account(&state, None, Role::Superadmin).await?;

    let (original, _) =
        lead_service::create_lead(&state, &agent, lead("Gone", None, Some("gone@example.com"))).await?;
    let (duplicate, _) =
        lead_service::create_lead(&state, &agent, lead("Stays", None, Some("GONE@example.com"))).await?;
    assert_eq!(duplicate.duplicate_of, Some(original.id));

    lead_service::delete_lead(&state, &superadmin, original.id).await?;

    let stored = LeadStorage::new(state.db.clone()).get_required(duplicate.id).await?;
    assert!(stored.is_duplicate);
    assert_eq!(stored.duplicate_of, None);
    assert_eq!(stored.duplicate_reason, Some(DuplicateReason::Email));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn assignment_rejects_agent_of_other_organization() -> anyhow::Result<()> {
    let state = test_state().await?;
    let (org, agent) = org_with_agent(&state).await?;
    let (other_org, _) = org_with_agent(&state).await?;
    let admin = account(&state, Some(org), Role::Admin).await?;
    let outsider = account(&state, Some(other_org), Role::Agent2).await?;

    let (created, _) = lead_service::create_lead(&state, &agent, lead("Unassigned", None, None)).await?;
    let result = lead_service::assign_lead(
        &state,
        &admin,
        created.id,
        AssignLeadRequest {
            agent_id: outsider.id,
            notes: None,
        },
    )
    .await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn reassignment_notifies_previous_assignee() -> anyhow::Result<()> {
    let state = test_state().await?;
    let (org, agent) = org_with_agent(&state).await?;
    let admin = account(&state, Some(org), Role::Admin).await?;
    let first_agent = account(&state, Some(org), Role::Agent2).await?;
    let second_agent = account(&state, Some(org), Role::Agent2).await?;

    let (created, _) = lead_service::create_lead(&state, &agent, lead("Handed Over", None, None)).await?;
    let assign_to = |agent_id| AssignLeadRequest {
        agent_id,
        notes: None,
    };
    lead_service::assign_lead(&state, &admin, created.id, assign_to(first_agent.id)).await?;

    let mut rx = state.broadcaster.subscribe();
    let reassigned =
        lead_service::assign_lead(&state, &admin, created.id, assign_to(second_agent.id)).await?;
    assert_eq!(reassigned.assigned_to, Some(second_agent.id));

    let envelope = loop {
        let envelope = rx.recv().await?;
        if envelope.event_name == "leadUpdated" {
            break envelope;
        }
    };
    assert!(envelope.rooms.contains(&user_room(first_agent.id)));
    assert!(envelope.rooms.contains(&user_room(second_agent.id)));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn bootstrap_is_refused_once_accounts_exist() -> anyhow::Result<()> {
    let state = test_state().await?;
    org_with_agent(&state).await?;
    let accounts = AccountStorage::new(state.db.clone());
    let email = format!("late-root-{}@example.com", Uuid::new_v4().simple());

    let bootstrap = || NewUser {
        name: "Late Root".to_string(),
        email: email.clone(),
        password_hash: "not-a-real-hash".to_string(),
        role: Role::Superadmin,
        organization_id: None,
    };
    let (first, second) = tokio::join!(
        accounts.insert_first_user(bootstrap()),
        accounts.insert_first_user(bootstrap()),
    );
    assert!(first?.is_none());
    assert!(second?.is_none());
    assert!(accounts.find_user_by_email(&email).await?.is_none());
    Ok(())
}

#[tokio::test]
#[ignore]
async fn listing_and_stats_follow_scope() -> anyhow::Result<()> {
    let state = test_state().await?;
    let (org, agent) = org_with_agent(&state).await?;

    lead_service::create_lead(&state, &agent, lead("Listed", Some("4155550100"), None)).await?;
    lead_service::create_lead(&state, &agent, lead("Listed Again", Some("4155550100"), None)).await?;

    let storage = LeadStorage::new(state.db.clone());
    let (leads, total) = storage
        .list(&LeadScope::CreatedBy(agent.id), &Default::default())
        .await?;
    assert_eq!(total, 2);
    assert_eq!(leads.len(), 2);

    let stats = storage.stats(&LeadScope::Organization(org)).await?;
    assert_eq!(stats.total_leads, 2);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.unassigned, 2);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn lead_entry_agent_cannot_update() -> anyhow::Result<()> {
    let state = test_state().await?;
    let (_, agent) = org_with_agent(&state).await?;
    let (created, _) = lead_service::create_lead(&state, &agent, lead("Locked", None, None)).await?;

    let result =
        lead_service::update_lead(&state, &agent, created.id, UpdateLeadRequest::default()).await;
    assert!(matches!(result, Err(AppError::Forbidden(_))));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn organization_with_leads_cannot_be_deleted() -> anyhow::Result<()> {
    let state = test_state().await?;
    let (org, agent) = org_with_agent(&state).await?;
    lead_service::create_lead(&state, &agent, lead("Keeps Org", None, None)).await?;

    let result = AccountStorage::new(state.db.clone())
        .delete_organization(org)
        .await;
    assert!(matches!(result, Err(AppError::Conflict(_))));
    Ok(())
}
