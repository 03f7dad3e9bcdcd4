use crate::errors::{AppError, ResultExt};
use crate::models::{
    AvailableAgent, CategoryCounts, DashboardStats, Lead, LeadQueryParams, QualificationCounts,
    StatusCounts,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

/// Which leads a caller can see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadScope {
    /// Superadmin view, optionally narrowed to one organization.
    All { organization: Option<Uuid> },
    /// Admin view of one organization.
    Organization(Uuid),
    /// Lead creator view: only leads they created.
    CreatedBy(Uuid),
    /// Follow-up view: only leads assigned to them.
    AssignedTo(Uuid),
}

impl LeadScope {
    /// Whether `lead` falls inside this scope.
    pub fn contains(&self, lead: &Lead) -> bool {
        match self {
            LeadScope::All { organization: None } => true,
            LeadScope::All {
                organization: Some(org),
            }
            | LeadScope::Organization(org) => lead.organization_id == *org,
            LeadScope::CreatedBy(user) => lead.created_by == Some(*user),
            LeadScope::AssignedTo(user) => lead.assigned_to == Some(*user),
        }
    }

    fn push_where(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        match self {
            LeadScope::All { organization: None } => {
                qb.push(" WHERE TRUE");
            }
            LeadScope::All {
                organization: Some(org),
            }
            | LeadScope::Organization(org) => {
                qb.push(" WHERE organization_id = ").push_bind(*org);
            }
            LeadScope::CreatedBy(user) => {
                qb.push(" WHERE created_by = ").push_bind(*user);
            }
            LeadScope::AssignedTo(user) => {
                qb.push(" WHERE assigned_to = ").push_bind(*user);
            }
        }
    }
}

/// Fields counted towards a lead's completion percentage.
pub const PROFILE_FIELD_COUNT: i32 = 11;

/// Share of profile fields that are filled, rounded to the nearest integer.
pub fn completion_percentage(lead: &Lead) -> i32 {
    let filled = [
        !lead.name.trim().is_empty(),
        lead.email.is_some(),
        lead.phone.is_some(),
        lead.alternate_phone.is_some(),
        lead.debt_category.is_some(),
        !lead.debt_types.is_empty(),
        lead.total_debt_amount.is_some(),
        lead.number_of_creditors.is_some(),
        lead.monthly_debt_payment.is_some(),
        lead.credit_score.is_some(),
        lead.credit_score_range.is_some(),
    ]
    .iter()
    .filter(|f| **f)
    .count() as i32;

    (filled * 100 + PROFILE_FIELD_COUNT / 2) / PROFILE_FIELD_COUNT
}

/// Human-readable lead code: `LD` + 8 upper-case hex characters.
pub fn generate_lead_code() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("LD{}", simple[..8].to_uppercase())
}

/// Exclusive upper bound for a `toDate` filter. `None` for the last
/// representable date, where the filter bounds nothing.
fn end_of_day(to: NaiveDate) -> Option<DateTime<Utc>> {
    to.succ_opt()
        .map(|next| next.and_time(NaiveTime::MIN).and_utc())
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[derive(Debug, FromRow)]
struct StatsRow {
    total: i64,
    duplicates: i64,
    assigned: i64,
    created_today: i64,
    hot: i64,
    warm: i64,
    cold: i64,
    status_new: i64,
    interested: i64,
    not_interested: i64,
    successful: i64,
    follow_up: i64,
    qualified: i64,
    unqualified: i64,
    pending: i64,
}

/// Database storage for leads.
pub struct LeadStorage {
    pool: PgPool,
}

impl LeadStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, lead: &Lead) -> Result<Lead, AppError> {
        let stored = sqlx::query_as::<_, Lead>(
            r#"
            INSERT INTO leads (
                id, lead_id, organization_id, name, email, phone, alternate_phone,
                debt_category, debt_types, total_debt_amount, number_of_creditors,
                monthly_debt_payment, credit_score, credit_score_range, category,
                completion_percentage, status, qualification_status, lead_progress_status,
                notes, assigned_to, assigned_by, assigned_at, assignment_notes,
                is_duplicate, duplicate_of, duplicate_reason, created_by, created_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29
            )
            RETURNING *
            "#,
        )
        .bind(lead.id)
        .bind(&lead.lead_id)
        .bind(lead.organization_id)
        .bind(&lead.name)
        .bind(&lead.email)
        .bind(&lead.phone)
        .bind(&lead.alternate_phone)
        .bind(&lead.debt_category)
        .bind(&lead.debt_types)
        .bind(&lead.total_debt_amount)
        .bind(lead.number_of_creditors)
        .bind(&lead.monthly_debt_payment)
        .bind(lead.credit_score)
        .bind(&lead.credit_score_range)
        .bind(lead.category.as_str())
        .bind(lead.completion_percentage)
        .bind(lead.status.as_str())
        .bind(lead.qualification_status.as_str())
        .bind(&lead.lead_progress_status)
        .bind(&lead.notes)
        .bind(lead.assigned_to)
        .bind(lead.assigned_by)
        .bind(lead.assigned_at)
        .bind(&lead.assignment_notes)
        .bind(lead.is_duplicate)
        .bind(lead.duplicate_of)
        .bind(lead.duplicate_reason)
        .bind(lead.created_by)
        .bind(lead.created_at)
        .fetch_one(&self.pool)
        .await
        .context("inserting lead")?;

        tracing::info!(
            "✓ Stored lead {} ({}) in org {}",
            stored.lead_id,
            stored.id,
            stored.organization_id
        );
        Ok(stored)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Lead>, AppError> {
        let lead = sqlx::query_as::<_, Lead>("SELECT * FROM leads WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(lead)
    }

    pub async fn get_required(&self, id: Uuid) -> Result<Lead, AppError> {
        self.get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Lead with id {} not found", id)))
    }

    /// Write back every mutable column of `lead`.
    pub async fn save(&self, lead: &Lead) -> Result<Lead, AppError> {
        let stored = sqlx::query_as::<_, Lead>(
            r#"
            UPDATE leads SET
                name = $2, email = $3, phone = $4, alternate_phone = $5,
                debt_category = $6, debt_types = $7, total_debt_amount = $8,
                number_of_creditors = $9, monthly_debt_payment = $10, credit_score = $11,
                credit_score_range = $12, category = $13, completion_percentage = $14,
                status = $15, qualification_status = $16, lead_progress_status = $17,
                notes = $18, assigned_to = $19, assigned_by = $20, assigned_at = $21,
                assignment_notes = $22, is_duplicate = $23, duplicate_of = $24,
                duplicate_reason = $25, last_updated_by = $26, last_updated_at = $27
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(lead.id)
        .bind(&lead.name)
        .bind(&lead.email)
        .bind(&lead.phone)
        .bind(&lead.alternate_phone)
        .bind(&lead.debt_category)
        .bind(&lead.debt_types)
        .bind(&lead.total_debt_amount)
        .bind(lead.number_of_creditors)
        .bind(&lead.monthly_debt_payment)
        .bind(lead.credit_score)
        .bind(&lead.credit_score_range)
        .bind(lead.category.as_str())
        .bind(lead.completion_percentage)
        .bind(lead.status.as_str())
        .bind(lead.qualification_status.as_str())
        .bind(&lead.lead_progress_status)
        .bind(&lead.notes)
        .bind(lead.assigned_to)
        .bind(lead.assigned_by)
        .bind(lead.assigned_at)
        .bind(&lead.assignment_notes)
        .bind(lead.is_duplicate)
        .bind(lead.duplicate_of)
        .bind(lead.duplicate_reason)
        .bind(lead.last_updated_by)
        .bind(lead.last_updated_at)
        .fetch_optional(&self.pool)
        .await
        .context("updating lead")?
        .ok_or_else(|| AppError::NotFound(format!("Lead with id {} not found", lead.id)))?;

        Ok(stored)
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM leads WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting lead")?;
        Ok(result.rows_affected() > 0)
    }

    fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, scope: &LeadScope, params: &LeadQueryParams) {
        scope.push_where(qb);

        if let Some(status) = params.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(category) = params.category {
            qb.push(" AND category = ").push_bind(category.as_str());
        }
        if let Some(qualification) = params.qualification_status {
            qb.push(" AND qualification_status = ")
                .push_bind(qualification.as_str());
        }
        if let Some(is_duplicate) = params.is_duplicate {
            qb.push(" AND is_duplicate = ").push_bind(is_duplicate);
        }
        if let Some(assigned_to) = params.assigned_to {
            qb.push(" AND assigned_to = ").push_bind(assigned_to);
        }
        if let Some(created_by) = params.created_by {
            qb.push(" AND created_by = ").push_bind(created_by);
        }
        if let Some(term) = params.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            let pattern = format!("%{}%", escape_like(term));
            qb.push(" AND (name ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR email ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR phone ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR lead_id ILIKE ")
                .push_bind(pattern)
                .push(")");
        }
        if let Some(from) = params.from_date {
            qb.push(" AND created_at >= ")
                .push_bind(from.and_time(NaiveTime::MIN).and_utc());
        }
        if let Some(end) = params.to_date.and_then(end_of_day) {
            qb.push(" AND created_at < ").push_bind(end);
        }
    }

    /// Leads currently flagged as duplicates of `original_id`, oldest first.
    pub async fn duplicates_of(&self, original_id: Uuid) -> Result<Vec<Lead>, AppError> {
        let leads = sqlx::query_as::<_, Lead>(
            "SELECT * FROM leads WHERE duplicate_of = $1 ORDER BY created_at, id",
        )
        .bind(original_id)
        .fetch_all(&self.pool)
        .await
        .context("loading duplicates of lead")?;
        Ok(leads)
    }

    /// Filtered, paginated listing, newest first. Returns the page and the total count.
    pub async fn list(
        &self,
        scope: &LeadScope,
        params: &LeadQueryParams,
    ) -> Result<(Vec<Lead>, i64), AppError> {
        let (page, limit) = params.pagination();

        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM leads");
        Self::push_filters(&mut count_qb, scope, params);
        let total: i64 = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .context("counting leads")?;

        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM leads");
        Self::push_filters(&mut qb, scope, params);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind((page - 1) * limit);

        let leads = qb
            .build_query_as::<Lead>()
            .fetch_all(&self.pool)
            .await
            .context("listing leads")?;

        Ok((leads, total))
    }

    pub async fn stats(&self, scope: &LeadScope) -> Result<DashboardStats, AppError> {
        let today = Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc();

        let mut qb = QueryBuilder::<Postgres>::new(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE is_duplicate) AS duplicates,
                COUNT(*) FILTER (WHERE assigned_to IS NOT NULL) AS assigned,
                COUNT(*) FILTER (WHERE created_at >= "#,
        );
        qb.push_bind(today).push(
            r#") AS created_today,
                COUNT(*) FILTER (WHERE category = 'hot') AS hot,
                COUNT(*) FILTER (WHERE category = 'warm') AS warm,
                COUNT(*) FILTER (WHERE category = 'cold') AS cold,
                COUNT(*) FILTER (WHERE status = 'new') AS status_new,
                COUNT(*) FILTER (WHERE status = 'interested') AS interested,
                COUNT(*) FILTER (WHERE status = 'not-interested') AS not_interested,
                COUNT(*) FILTER (WHERE status = 'successful') AS successful,
                COUNT(*) FILTER (WHERE status = 'follow-up') AS follow_up,
                COUNT(*) FILTER (WHERE qualification_status = 'qualified') AS qualified,
                COUNT(*) FILTER (WHERE qualification_status = 'unqualified') AS unqualified,
                COUNT(*) FILTER (WHERE qualification_status = 'pending') AS pending
            FROM leads"#,
        );
        scope.push_where(&mut qb);

        let row = qb
            .build_query_as::<StatsRow>()
            .fetch_one(&self.pool)
            .await
            .context("computing dashboard stats")?;

        Ok(DashboardStats {
            total_leads: row.total,
            duplicates: row.duplicates,
            assigned: row.assigned,
            unassigned: row.total - row.assigned,
            created_today: row.created_today,
            by_category: CategoryCounts {
                hot: row.hot,
                warm: row.warm,
                cold: row.cold,
            },
            by_status: StatusCounts {
                new: row.status_new,
                interested: row.interested,
                not_interested: row.not_interested,
                successful: row.successful,
                follow_up: row.follow_up,
            },
            by_qualification: QualificationCounts {
                qualified: row.qualified,
                unqualified: row.unqualified,
                pending: row.pending,
            },
        })
    }

    /// Active follow-up agents of an organization with their current load.
    pub async fn available_agents(&self, organization_id: Uuid) -> Result<Vec<AvailableAgent>, AppError> {
        let agents = sqlx::query_as::<_, AvailableAgent>(
            r#"
            SELECT u.id, u.name, u.email, COUNT(l.id) AS assigned_leads
            FROM users u
            LEFT JOIN leads l ON l.assigned_to = u.id
            WHERE u.organization_id = $1 AND u.role = 'agent2' AND u.is_active
            GROUP BY u.id, u.name, u.email
            ORDER BY assigned_leads ASC, u.name ASC
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await
        .context("listing available agents")?;
        Ok(agents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::tests::sample_lead;
    use bigdecimal::BigDecimal;

    #[test]
    fn test_end_of_day_bounds() {
        let day = NaiveDate::from_ymd_opt(2026, 2, 28).unwrap();
        assert_eq!(
            end_of_day(day),
            Some(
                NaiveDate::from_ymd_opt(2026, 3, 1)
                    .unwrap()
                    .and_time(NaiveTime::MIN)
                    .and_utc()
            )
        );
        assert_eq!(end_of_day(NaiveDate::MAX), None);
    }

    #[test]
    fn test_extreme_to_date_query_parses_without_bound() {
        let params: LeadQueryParams =
            serde_json::from_str(r#"{"toDate":"+262142-12-31","page":9223372036854775807}"#).unwrap();
        assert_eq!(params.to_date.and_then(end_of_day), None);
        let (page, limit) = params.pagination();
        assert!((page - 1).checked_mul(limit).is_some());
    }

    #[test]
    fn test_lead_code_format() {
        let code = generate_lead_code();
        assert_eq!(code.len(), 10);
        assert!(code.starts_with("LD"));
        assert!(code[2..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_completion_percentage() {
        let mut lead = sample_lead(Uuid::new_v4(), None, None);
        // name, email, phone
        assert_eq!(completion_percentage(&lead), 27);

        lead.alternate_phone = Some("+13035550100".to_string());
        lead.debt_category = Some("unsecured".to_string());
        lead.debt_types = vec!["credit-card".to_string()];
        lead.total_debt_amount = Some(BigDecimal::from(25_000));
        lead.number_of_creditors = Some(4);
        lead.monthly_debt_payment = Some(BigDecimal::from(600));
        lead.credit_score = Some(640);
        lead.credit_score_range = Some("600-649".to_string());
        assert_eq!(completion_percentage(&lead), 100);
    }

    #[test]
    fn test_scope_contains() {
        let org = Uuid::new_v4();
        let agent = Uuid::new_v4();
        let lead = sample_lead(org, Some(agent), None);

        assert!(LeadScope::All { organization: None }.contains(&lead));
        assert!(LeadScope::Organization(org).contains(&lead));
        assert!(!LeadScope::Organization(Uuid::new_v4()).contains(&lead));
        assert!(LeadScope::CreatedBy(agent).contains(&lead));
        assert!(!LeadScope::AssignedTo(agent).contains(&lead));
    }

    #[test]
    fn test_like_escaping() {
        assert_eq!(escape_like("50%_off"), "50\\%\\_off");
    }

    #[test]
    fn test_filters_render_placeholders() {
        let params = LeadQueryParams {
            search: Some("pat".to_string()),
            is_duplicate: Some(true),
            ..Default::default()
        };
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM leads");
        LeadStorage::push_filters(&mut qb, &LeadScope::Organization(Uuid::new_v4()), &params);
        let sql = qb.sql();

        assert!(sql.contains("WHERE organization_id = $1"));
        assert!(sql.contains("is_duplicate = $2"));
        assert!(sql.contains("lead_id ILIKE $6"));
    }
}
