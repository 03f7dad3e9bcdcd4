use crate::errors::{AppError, ResultExt};
use crate::models::{Organization, OrganizationDetails, Role, RoleCounts, User};
use chrono::Utc;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

/// Fields of a user row that can be changed after creation.
#[derive(Debug, Clone, Default)]
pub struct UserChanges {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
    pub organization_id: Option<Uuid>,
    pub is_active: Option<bool>,
    pub password_hash: Option<String>,
}

/// Fields of a user row written at creation.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub organization_id: Option<Uuid>,
}

/// Database storage for users and organizations.
pub struct AccountStorage {
    pool: PgPool,
}

impl AccountStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ============ Users ============

    pub async fn count_users(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn insert_user(&self, user: NewUser) -> Result<User, AppError> {
        let stored = Self::insert_user_with(&self.pool, &user).await?;
        tracing::info!(
            "✓ Created {} account {} ({})",
            stored.role,
            stored.email,
            stored.id
        );
        Ok(stored)
    }

    /// Insert `user` only while the users table is still empty. The table
    /// lock makes concurrent callers queue behind each other, so at most one
    /// of them gets `Some`.
    pub async fn insert_first_user(&self, user: NewUser) -> Result<Option<User>, AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("LOCK TABLE users IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .context("locking users table")?;
        let existing = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
            .fetch_one(&mut *tx)
            .await?;
        if existing > 0 {
            tracing::warn!("Bootstrap of {} refused: accounts already exist", user.email);
            return Ok(None);
        }

        let stored = Self::insert_user_with(&mut *tx, &user).await?;
        tx.commit().await?;

        tracing::info!("✓ Bootstrapped superadmin {} ({})", stored.email, stored.id);
        Ok(Some(stored))
    }

    async fn insert_user_with<'e, E>(executor: E, user: &NewUser) -> Result<User, AppError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let stored = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, name, email, password_hash, role, organization_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(user.organization_id)
        .fetch_one(executor)
        .await
        .context("inserting user")?;
        Ok(stored)
    }

    pub async fn find_user(&self, id: Uuid) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn get_user(&self, id: Uuid) -> Result<User, AppError> {
        self.find_user(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User with id {} not found", id)))
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    /// Users holding one of `roles`, optionally limited to one organization.
    pub async fn list_users(
        &self,
        roles: &[Role],
        organization_id: Option<Uuid>,
    ) -> Result<Vec<User>, AppError> {
        let role_names: Vec<String> = roles.iter().map(|r| r.as_str().to_string()).collect();

        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM users WHERE role = ANY(");
        qb.push_bind(role_names).push(")");
        if let Some(org) = organization_id {
            qb.push(" AND organization_id = ").push_bind(org);
        }
        qb.push(" ORDER BY created_at DESC");

        let users = qb
            .build_query_as::<User>()
            .fetch_all(&self.pool)
            .await
            .context("listing users")?;
        Ok(users)
    }

    pub async fn update_user(&self, id: Uuid, changes: UserChanges) -> Result<User, AppError> {
        let stored = sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET
                name = COALESCE($2, name),
                email = COALESCE($3, email),
                role = COALESCE($4, role),
                organization_id = COALESCE($5, organization_id),
                is_active = COALESCE($6, is_active),
                password_hash = COALESCE($7, password_hash),
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(changes.name)
        .bind(changes.email)
        .bind(changes.role.map(|r| r.as_str()))
        .bind(changes.organization_id)
        .bind(changes.is_active)
        .bind(changes.password_hash)
        .fetch_optional(&self.pool)
        .await
        .context("updating user")?
        .ok_or_else(|| AppError::NotFound(format!("User with id {} not found", id)))?;
        Ok(stored)
    }

    pub async fn touch_last_login(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE users SET last_login = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a user. Their assigned leads become unassigned through the
    /// foreign keys; returns the ids of the leads that lost their assignee.
    pub async fn delete_user(&self, id: Uuid) -> Result<Vec<Uuid>, AppError> {
        let mut tx = self.pool.begin().await?;

        let unassigned = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM leads WHERE assigned_to = $1",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("deleting user")?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("User with id {} not found", id)));
        }

        tx.commit().await?;
        Ok(unassigned)
    }

    // ============ Organizations ============

    pub async fn insert_organization(
        &self,
        name: &str,
        description: Option<&str>,
        contact_email: Option<&str>,
        contact_phone: Option<&str>,
    ) -> Result<Organization, AppError> {
        let org = sqlx::query_as::<_, Organization>(
            r#"
            INSERT INTO organizations (id, name, description, contact_email, contact_phone)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(description)
        .bind(contact_email)
        .bind(contact_phone)
        .fetch_one(&self.pool)
        .await
        .context("inserting organization")?;

        tracing::info!("✓ Created organization {} ({})", org.name, org.id);
        Ok(org)
    }

    pub async fn find_organization(&self, id: Uuid) -> Result<Option<Organization>, AppError> {
        let org = sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(org)
    }

    pub async fn get_organization(&self, id: Uuid) -> Result<Organization, AppError> {
        self.find_organization(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Organization with id {} not found", id)))
    }

    pub async fn list_organizations(&self) -> Result<Vec<Organization>, AppError> {
        let orgs = sqlx::query_as::<_, Organization>("SELECT * FROM organizations ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(orgs)
    }

    pub async fn organization_details(&self, org: Organization) -> Result<OrganizationDetails, AppError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT role, COUNT(*) FROM users WHERE organization_id = $1 GROUP BY role",
        )
        .bind(org.id)
        .fetch_all(&self.pool)
        .await?;

        let lead_count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM leads WHERE organization_id = $1")
                .bind(org.id)
                .fetch_one(&self.pool)
                .await?;

        Ok(OrganizationDetails {
            organization: org,
            user_counts: RoleCounts::from_rows(&rows),
            lead_count,
        })
    }

    pub async fn update_organization(
        &self,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
        contact_email: Option<&str>,
        contact_phone: Option<&str>,
        is_active: Option<bool>,
    ) -> Result<Organization, AppError> {
        let org = sqlx::query_as::<_, Organization>(
            r#"
            UPDATE organizations SET
                name = COALESCE($2, name),
                description = COALESCE($3, description),
                contact_email = COALESCE($4, contact_email),
                contact_phone = COALESCE($5, contact_phone),
                is_active = COALESCE($6, is_active),
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(description)
        .bind(contact_email)
        .bind(contact_phone)
        .bind(is_active)
        .fetch_optional(&self.pool)
        .await
        .context("updating organization")?
        .ok_or_else(|| AppError::NotFound(format!("Organization with id {} not found", id)))?;
        Ok(org)
    }

    /// Delete an organization that no longer owns users or leads.
    pub async fn delete_organization(&self, id: Uuid) -> Result<(), AppError> {
        let details = self.organization_details(self.get_organization(id).await?).await?;
        if details.user_counts.total > 0 || details.lead_count > 0 {
            return Err(AppError::Conflict(format!(
                "Organization still has {} user(s) and {} lead(s)",
                details.user_counts.total, details.lead_count
            )));
        }

        sqlx::query("DELETE FROM organizations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting organization")?;

        tracing::info!("🗑️ Deleted organization {}", id);
        Ok(())
    }

    pub async fn is_organization_active(&self, id: Uuid) -> Result<bool, AppError> {
        let active = sqlx::query_scalar::<_, bool>("SELECT is_active FROM organizations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .unwrap_or(false);
        Ok(active)
    }
}
