use crate::error::{OrchestratorError, Result};
use crate::instance::{
    CreationMode, InstanceRecord, InstanceState, ResourceRef, ResourceSizing,
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;

#[derive(Debug, Clone, Default)]
pub struct InstanceFilters {
    pub user_id: Option<String>,
    pub state: Option<InstanceState>,
}

/// Durable store of instance records.
///
/// Updates are compare-and-swap on the `version` column: a writer holding a
/// stale record gets `Conflict` instead of silently overwriting.
#[derive(Clone)]
pub struct InstanceRegistry {
    pool: SqlitePool,
}

impl InstanceRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new record. Fails with `Conflict` if the id was ever issued
    /// before or the user's idempotency key is already taken.
    #[instrument(skip(self, record), fields(instance_id = %record.instance_id))]
    pub async fn insert(&self, record: &InstanceRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO issued_instance_ids (id, issued_at) VALUES (?, ?)")
            .bind(&record.instance_id)
            .bind(record.created_at.timestamp_millis())
            .execute(&mut *tx)
            .await
            .map_err(|e| unique_violation_as_conflict(e, &record.instance_id))?;

        sqlx::query(
            r#"
            INSERT INTO instances (id, user_id, state, creation_mode, base_image, built_image_reference,
                                   build_log_handle, access_token, resource_refs, error, resources,
                                   idempotency_key, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.instance_id)
        .bind(&record.user_id)
        .bind(record.state)
        .bind(record.creation_mode)
        .bind(&record.base_image)
        .bind(&record.built_image_reference)
        .bind(&record.build_log_handle)
        .bind(&record.access_token)
        .bind(serde_json::to_string(&record.resource_refs)?)
        .bind(&record.error)
        .bind(serde_json::to_string(&record.resources)?)
        .bind(&record.idempotency_key)
        .bind(record.version)
        .bind(record.created_at.timestamp_millis())
        .bind(record.updated_at.timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(|e| unique_violation_as_conflict(e, &record.instance_id))?;

        tx.commit().await?;
        Ok(())
    }

    /// Get a single instance by ID
    pub async fn get(&self, instance_id: &str) -> Result<InstanceRecord> {
        self.find(instance_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(instance_id.to_string()))
    }

    pub async fn find(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        let row = sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances WHERE id = ?")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(InstanceRecord::try_from).transpose()
    }

    pub async fn find_by_idempotency_key(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<InstanceRecord>> {
        let row = sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM instances WHERE user_id = ? AND idempotency_key = ?",
        )
        .bind(user_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(InstanceRecord::try_from).transpose()
    }

    /// List instances with optional filters, newest first
    pub async fn list(&self, filters: &InstanceFilters) -> Result<Vec<InstanceRecord>> {
        let mut query = "SELECT * FROM instances WHERE 1=1".to_string();

        if filters.user_id.is_some() {
            query.push_str(" AND user_id = ?");
        }
        if filters.state.is_some() {
            query.push_str(" AND state = ?");
        }

        query.push_str(" ORDER BY created_at DESC, id ASC");

        let mut q = sqlx::query_as::<_, InstanceRow>(&query);

        if let Some(user_id) = &filters.user_id {
            q = q.bind(user_id);
        }
        if let Some(state) = &filters.state {
            q = q.bind(state);
        }

        let rows = q.fetch_all(&self.pool).await?;

        rows.into_iter().map(InstanceRecord::try_from).collect()
    }

    /// All instances currently in any of `states`, oldest first
    pub async fn list_in_states(&self, states: &[InstanceState]) -> Result<Vec<InstanceRecord>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; states.len()].join(", ");
        let query = format!(
            "SELECT * FROM instances WHERE state IN ({placeholders}) ORDER BY created_at ASC"
        );

        let mut q = sqlx::query_as::<_, InstanceRow>(&query);
        for state in states {
            q = q.bind(state);
        }

        let rows = q.fetch_all(&self.pool).await?;

        rows.into_iter().map(InstanceRecord::try_from).collect()
    }

    /// Write every mutable field of `record` if its `version` is still current.
    /// Returns the stored record with the bumped version.
    #[instrument(skip(self, record), fields(instance_id = %record.instance_id, state = %record.state))]
    pub async fn update(&self, record: &InstanceRecord) -> Result<InstanceRecord> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE instances
            SET state = ?, built_image_reference = ?, build_log_handle = ?, access_token = ?,
                resource_refs = ?, error = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(record.state)
        .bind(&record.built_image_reference)
        .bind(&record.build_log_handle)
        .bind(&record.access_token)
        .bind(serde_json::to_string(&record.resource_refs)?)
        .bind(&record.error)
        .bind(now.timestamp_millis())
        .bind(&record.instance_id)
        .bind(record.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.find(&record.instance_id).await? {
                Some(current) => Err(OrchestratorError::Conflict(format!(
                    "instance {} was modified concurrently (expected version {}, found {})",
                    record.instance_id, record.version, current.version
                ))),
                None => Err(OrchestratorError::NotFound(record.instance_id.clone())),
            };
        }

        let mut updated = record.clone();
        updated.version += 1;
        updated.updated_at = now;
        Ok(updated)
    }

    /// Remove a record and its build log. The id stays reserved.
    #[instrument(skip(self))]
    pub async fn remove(&self, instance_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let handle: Option<Option<String>> =
            sqlx::query_scalar("SELECT build_log_handle FROM instances WHERE id = ?")
                .bind(instance_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(handle) = handle else {
            tx.rollback().await?;
            return Ok(false);
        };

        if let Some(handle) = handle {
            sqlx::query("DELETE FROM build_log_lines WHERE log_handle = ?")
                .bind(handle)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM instances WHERE id = ?")
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}

fn unique_violation_as_conflict(err: sqlx::Error, instance_id: &str) -> OrchestratorError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            if db_err.message().contains("issued_instance_ids") {
                OrchestratorError::Conflict(format!("instance id {instance_id} was already issued"))
            } else {
                OrchestratorError::Conflict("idempotency key already in use".to_string())
            }
        }
        _ => OrchestratorError::Database(err),
    }
}

// Internal row type for sqlx
#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: String,
    user_id: String,
    state: InstanceState,
    creation_mode: CreationMode,
    base_image: String,
    built_image_reference: Option<String>,
    build_log_handle: Option<String>,
    access_token: Option<String>,
    resource_refs: String,
    error: Option<String>,
    resources: String,
    idempotency_key: Option<String>,
    version: i64,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<InstanceRow> for InstanceRecord {
    type Error = OrchestratorError;

    fn try_from(row: InstanceRow) -> Result<Self> {
        let resource_refs: Vec<ResourceRef> = serde_json::from_str(&row.resource_refs)?;
        let resources: ResourceSizing = serde_json::from_str(&row.resources)?;

        Ok(Self {
            instance_id: row.id,
            user_id: row.user_id,
            state: row.state,
            creation_mode: row.creation_mode,
            base_image: row.base_image,
            built_image_reference: row.built_image_reference,
            build_log_handle: row.build_log_handle,
            access_token: row.access_token,
            resource_refs,
            error: row.error,
            resources,
            idempotency_key: row.idempotency_key,
            version: row.version,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        })
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
