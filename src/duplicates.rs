//! Duplicate lead detection.
//!
//! A lead is a duplicate when its normalized phone and/or email equals that of
//! an earlier lead in the same organization. The earliest-created match is the
//! canonical original. Matching never rejects a lead; it only flags it.

use crate::errors::AppError;
use crate::models::{DuplicateReason, DuplicateSummary};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Normalized contact fields of a candidate lead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactKey {
    /// `+1` + 10 digits, or `None` when absent.
    pub phone: Option<String>,
    /// Lower-cased email, or `None` when absent.
    pub email: Option<String>,
}

impl ContactKey {
    pub fn new(phone: Option<String>, email: Option<String>) -> Self {
        Self {
            phone: phone.filter(|p| !p.is_empty()),
            email: email.filter(|e| !e.is_empty()),
        }
    }

    /// A lead with neither phone nor email can never be flagged.
    pub fn is_empty(&self) -> bool {
        self.phone.is_none() && self.email.is_none()
    }

    /// Which of this key's fields equal those of `existing`.
    pub fn reason_against(&self, existing: &ExistingContact) -> Option<DuplicateReason> {
        let phone_match = matches!(
            (&self.phone, &existing.phone),
            (Some(a), Some(b)) if a == b
        );
        let email_match = matches!(
            (&self.email, &existing.email),
            (Some(a), Some(b)) if a == b
        );

        match (phone_match, email_match) {
            (true, true) => Some(DuplicateReason::Both),
            (true, false) => Some(DuplicateReason::Phone),
            (false, true) => Some(DuplicateReason::Email),
            (false, false) => None,
        }
    }
}

/// Contact projection of a stored lead.
#[derive(Debug, Clone, FromRow)]
pub struct ExistingContact {
    pub id: Uuid,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The canonical original a candidate duplicates, and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateMatch {
    pub original: Uuid,
    pub reason: DuplicateReason,
}

impl DuplicateMatch {
    pub fn summary(found: Option<DuplicateMatch>) -> DuplicateSummary {
        DuplicateSummary {
            is_duplicate: found.is_some(),
            duplicate_of: found.map(|m| m.original),
            duplicate_reason: found.map(|m| m.reason),
        }
    }
}

/// Pick the canonical original among `existing` for `candidate`.
///
/// The earliest `created_at` wins; equal timestamps fall back to the smaller id.
/// The reason describes the fields matching that original only.
pub fn find_original(candidate: &ContactKey, existing: &[ExistingContact]) -> Option<DuplicateMatch> {
    if candidate.is_empty() {
        return None;
    }

    existing
        .iter()
        .filter_map(|lead| {
            candidate
                .reason_against(lead)
                .map(|reason| (lead, reason))
        })
        .min_by_key(|(lead, _)| (lead.created_at, lead.id))
        .map(|(lead, reason)| DuplicateMatch {
            original: lead.id,
            reason,
        })
}

/// Look up the canonical original for `candidate` inside `organization_id`.
///
/// `before` restricts the search to leads created strictly before the given
/// `(created_at, id)` position and excludes that lead itself; it is used when
/// re-matching an existing lead after its contact fields change.
pub async fn find_duplicate(
    db: &PgPool,
    organization_id: Uuid,
    candidate: &ContactKey,
    before: Option<(DateTime<Utc>, Uuid)>,
) -> Result<Option<DuplicateMatch>, AppError> {
    if candidate.is_empty() {
        return Ok(None);
    }

    let (before_at, before_id) = before.unzip();

    let earliest = sqlx::query_as::<_, ExistingContact>(
        r#"
        SELECT id, phone, email, created_at
        FROM leads
        WHERE organization_id = $1
          AND (
                ($2::text IS NOT NULL AND phone = $2)
             OR ($3::text IS NOT NULL AND email = $3)
          )
          AND ($4::timestamptz IS NULL OR (created_at, id) < ($4, $5))
        ORDER BY created_at ASC, id ASC
        LIMIT 1
        "#,
    )
    .bind(organization_id)
    .bind(candidate.phone.as_deref())
    .bind(candidate.email.as_deref())
    .bind(before_at)
    .bind(before_id)
    .fetch_optional(db)
    .await?;

    let found = earliest.and_then(|lead| find_original(candidate, std::slice::from_ref(&lead)));

    if let Some(m) = &found {
        tracing::info!(
            "🔁 Duplicate detected in org {}: original={}, reason={}",
            organization_id,
            m.original,
            m.reason
        );
    }

    Ok(found)
}

/// Keyed async locks that serialize duplicate check-and-write per
/// organization and contact value within this process.
#[derive(Clone)]
pub struct ContactLocks {
    locks: Cache<String, Arc<Mutex<()>>>,
}

/// Held for the duration of a check-and-write; releases on drop.
pub struct ContactGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl ContactLocks {
    pub fn new() -> Self {
        Self {
            locks: Cache::builder()
                .time_to_idle(Duration::from_secs(300))
                .max_capacity(100_000)
                .build(),
        }
    }

    /// Lock keys for `candidate`, sorted so concurrent callers never deadlock.
    pub fn keys_for(organization_id: Uuid, candidate: &ContactKey) -> Vec<String> {
        let mut keys = Vec::with_capacity(2);
        if let Some(phone) = &candidate.phone {
            keys.push(format!("{}:phone:{}", organization_id, phone));
        }
        if let Some(email) = &candidate.email {
            keys.push(format!("{}:email:{}", organization_id, email));
        }
        keys.sort();
        keys
    }

    pub async fn acquire(&self, organization_id: Uuid, candidate: &ContactKey) -> ContactGuard {
        self.acquire_all(organization_id, std::slice::from_ref(candidate))
            .await
    }

    /// Lock the union of several contacts' keys in one sorted pass.
    pub async fn acquire_all(&self, organization_id: Uuid, candidates: &[ContactKey]) -> ContactGuard {
        let mut keys: Vec<String> = candidates
            .iter()
            .flat_map(|c| Self::keys_for(organization_id, c))
            .collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let mutex = self
                .locks
                .get_with(key, async { Arc::new(Mutex::new(())) })
                .await;
            guards.push(mutex.lock_owned().await);
        }
        ContactGuard { _guards: guards }
    }
}

impl Default for ContactLocks {
    fn default() -> Self {
        Self::new()
    }
}
