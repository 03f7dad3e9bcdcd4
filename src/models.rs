use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef, Postgres};
use sqlx::{Decode, Encode, FromRow, Type};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============ Enumerations ============

/// Generates `as_str`, `FromStr`, `TryFrom<String>` and `Display` for a
/// string-backed enum stored in a TEXT column.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(
                        "invalid {} '{}'",
                        stringify!($name),
                        other
                    )),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Account role. Decides which dashboard a user gets and what they may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Lead creator.
    Agent1,
    /// Follow-up agent working assigned leads.
    Agent2,
    /// Organization administrator.
    Admin,
    /// Cross-organization administrator.
    Superadmin,
}

text_enum!(Role {
    Agent1 => "agent1",
    Agent2 => "agent2",
    Admin => "admin",
    Superadmin => "superadmin",
});

impl Role {
    pub fn is_agent(&self) -> bool {
        matches!(self, Role::Agent1 | Role::Agent2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeadCategory {
    Hot,
    Warm,
    Cold,
}

text_enum!(LeadCategory {
    Hot => "hot",
    Warm => "warm",
    Cold => "cold",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeadStatus {
    New,
    Interested,
    NotInterested,
    Successful,
    FollowUp,
}

text_enum!(LeadStatus {
    New => "new",
    Interested => "interested",
    NotInterested => "not-interested",
    Successful => "successful",
    FollowUp => "follow-up",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualificationStatus {
    Qualified,
    Unqualified,
    Pending,
}

text_enum!(QualificationStatus {
    Qualified => "qualified",
    Unqualified => "unqualified",
    Pending => "pending",
});

/// Which contact field(s) of a new lead matched the original lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateReason {
    Email,
    Phone,
    Both,
}

text_enum!(DuplicateReason {
    Email => "email",
    Phone => "phone",
    Both => "both",
});

// Nullable column, so it decodes through `Option<DuplicateReason>` rather
// than `try_from`.
impl Type<Postgres> for DuplicateReason {
    fn type_info() -> PgTypeInfo {
        <String as Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <String as Type<Postgres>>::compatible(ty)
    }
}

impl<'r> Decode<'r, Postgres> for DuplicateReason {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let text = <&str as Decode<Postgres>>::decode(value)?;
        Ok(text.parse::<DuplicateReason>()?)
    }
}

impl<'q> Encode<'q, Postgres> for DuplicateReason {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        <&str as Encode<Postgres>>::encode_by_ref(&self.as_str(), buf)
    }
}

// ============ Database Models ============

/// Tenant boundary scoping users and leads.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// User counts of an organization, grouped by role.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoleCounts {
    pub agent1: i64,
    pub agent2: i64,
    pub admin: i64,
    pub superadmin: i64,
    pub total: i64,
}

impl RoleCounts {
    /// Folds `(role, count)` rows into per-role totals. Unknown roles are ignored.
    pub fn from_rows(rows: &[(String, i64)]) -> Self {
        let mut counts = RoleCounts::default();
        for (role, count) in rows {
            match role.parse::<Role>() {
                Ok(Role::Agent1) => counts.agent1 += count,
                Ok(Role::Agent2) => counts.agent2 += count,
                Ok(Role::Admin) => counts.admin += count,
                Ok(Role::Superadmin) => counts.superadmin += count,
                Err(_) => continue,
            }
            counts.total += count;
        }
        counts
    }
}

/// Organization with aggregated user counts, as returned by the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationDetails {
    #[serde(flatten)]
    pub organization: Organization,
    pub user_counts: RoleCounts,
    pub lead_count: i64,
}

/// A user account. The password hash never leaves the server.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    #[sqlx(try_from = "String")]
    pub role: Role,
    #[serde(rename = "organization")]
    pub organization_id: Option<Uuid>,
    pub is_active: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A prospective customer record with contact and debt-profile data.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: Uuid,
    pub lead_id: String,
    #[serde(rename = "organization")]
    pub organization_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub alternate_phone: Option<String>,
    pub debt_category: Option<String>,
    pub debt_types: Vec<String>,
    pub total_debt_amount: Option<BigDecimal>,
    pub number_of_creditors: Option<i32>,
    pub monthly_debt_payment: Option<BigDecimal>,
    pub credit_score: Option<i32>,
    pub credit_score_range: Option<String>,
    #[sqlx(try_from = "String")]
    pub category: LeadCategory,
    pub completion_percentage: i32,
    #[sqlx(try_from = "String")]
    pub status: LeadStatus,
    #[sqlx(try_from = "String")]
    pub qualification_status: QualificationStatus,
    pub lead_progress_status: Option<String>,
    pub notes: Option<String>,
    pub assigned_to: Option<Uuid>,
    pub assigned_by: Option<Uuid>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub assignment_notes: Option<String>,
    pub is_duplicate: bool,
    pub duplicate_of: Option<Uuid>,
    pub duplicate_reason: Option<DuplicateReason>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub last_updated_by: Option<Uuid>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

// ============ Lead Requests ============

/// Body of `POST /api/leads`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLeadRequest {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub alternate_phone: Option<String>,
    pub debt_category: Option<String>,
    #[serde(default)]
    pub debt_types: Vec<String>,
    pub total_debt_amount: Option<BigDecimal>,
    pub number_of_creditors: Option<i32>,
    pub monthly_debt_payment: Option<BigDecimal>,
    pub credit_score: Option<i32>,
    pub credit_score_range: Option<String>,
    pub category: Option<LeadCategory>,
    pub notes: Option<String>,
    /// Only honored for superadmins; everyone else creates in their own organization.
    pub organization: Option<Uuid>,
}

/// Body of `PUT /api/leads/:id`. Absent fields are left unchanged; empty
/// strings clear optional text fields.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLeadRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub alternate_phone: Option<String>,
    pub debt_category: Option<String>,
    pub debt_types: Option<Vec<String>>,
    pub total_debt_amount: Option<BigDecimal>,
    pub number_of_creditors: Option<i32>,
    pub monthly_debt_payment: Option<BigDecimal>,
    pub credit_score: Option<i32>,
    pub credit_score_range: Option<String>,
    pub category: Option<LeadCategory>,
    pub status: Option<LeadStatus>,
    pub qualification_status: Option<QualificationStatus>,
    pub lead_progress_status: Option<String>,
    pub notes: Option<String>,
    pub assignment_notes: Option<String>,
}

impl UpdateLeadRequest {
    /// True when the request touches anything beyond the workflow fields
    /// follow-up agents are allowed to change.
    pub fn touches_profile_fields(&self) -> bool {
        self.name.is_some()
            || self.email.is_some()
            || self.phone.is_some()
            || self.alternate_phone.is_some()
            || self.debt_category.is_some()
            || self.debt_types.is_some()
            || self.total_debt_amount.is_some()
            || self.number_of_creditors.is_some()
            || self.monthly_debt_payment.is_some()
            || self.credit_score.is_some()
            || self.credit_score_range.is_some()
            || self.category.is_some()
            || self.assignment_notes.is_some()
    }
}

/// Body of `POST /api/leads/:id/assign`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignLeadRequest {
    pub agent_id: Uuid,
    pub notes: Option<String>,
}

/// Query parameters of `GET /api/leads`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadQueryParams {
    pub status: Option<LeadStatus>,
    pub category: Option<LeadCategory>,
    pub qualification_status: Option<QualificationStatus>,
    pub is_duplicate: Option<bool>,
    pub assigned_to: Option<Uuid>,
    pub created_by: Option<Uuid>,
    pub organization: Option<Uuid>,
    pub search: Option<String>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

impl LeadQueryParams {
    pub const DEFAULT_LIMIT: i64 = 20;
    pub const MAX_LIMIT: i64 = 100;

    /// Page and limit after clamping into valid ranges.
    pub fn pagination(&self) -> (i64, i64) {
        let page = self
            .page
            .unwrap_or(1)
            .clamp(1, i64::MAX / Self::MAX_LIMIT);
        let limit = self
            .limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT);
        (page, limit)
    }
}

/// Query parameters shared by the agent/admin listing endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeQueryParams {
    pub organization: Option<Uuid>,
    pub role: Option<Role>,
}

// ============ Lead Responses ============

/// Duplicate verdict reported alongside a created or updated lead.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateSummary {
    pub is_duplicate: bool,
    pub duplicate_of: Option<Uuid>,
    pub duplicate_reason: Option<DuplicateReason>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadResponse {
    pub success: bool,
    pub message: String,
    pub data: Lead,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<DuplicateSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadListResponse {
    pub success: bool,
    pub data: Vec<Lead>,
    pub total: i64,
    pub page: i64,
    pub pages: i64,
}

/// Follow-up agent available for assignment.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableAgent {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub assigned_leads: i64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CategoryCounts {
    pub hot: i64,
    pub warm: i64,
    pub cold: i64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub new: i64,
    pub interested: i64,
    pub not_interested: i64,
    pub successful: i64,
    pub follow_up: i64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QualificationCounts {
    pub qualified: i64,
    pub unqualified: i64,
    pub pending: i64,
}

/// Aggregates behind `GET /api/leads/dashboard/stats`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_leads: i64,
    pub duplicates: i64,
    pub assigned: i64,
    pub unassigned: i64,
    pub created_today: i64,
    pub by_category: CategoryCounts,
    pub by_status: StatusCounts,
    pub by_qualification: QualificationCounts,
}

// ============ Auth Requests ============

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub role: Role,
    pub organization: Option<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub success: bool,
    pub token: String,
    pub user: User,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateProfileRequest {
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// Body of `PUT /api/auth/agents/:id` and `PUT /api/auth/admins/:id`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAccountRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
    pub is_active: Option<bool>,
}

/// Body of `PUT /api/auth/users/:id` (superadmin only).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
    pub organization: Option<Uuid>,
    pub is_active: Option<bool>,
    pub password: Option<String>,
}

// ============ Organization Requests ============

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrganizationRequest {
    pub name: String,
    pub description: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOrganizationRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub is_active: Option<bool>,
}

/// Generic `{success, message}` acknowledgement.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

impl MessageResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}
