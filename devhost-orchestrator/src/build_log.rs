use crate::error::{OrchestratorError, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::warn;

/// Append-only build output for one instance, stored in `build_log_lines`.
#[derive(Debug, Clone)]
pub struct BuildLog {
    pool: SqlitePool,
    handle: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildLogChunk {
    pub lines: Vec<String>,
    /// Pass back as `offset` to read only newer lines.
    pub next_offset: i64,
}

impl BuildLog {
    pub fn handle_for(instance_id: &str) -> String {
        format!("{instance_id}-build-logs")
    }

    pub fn open(pool: SqlitePool, handle: impl Into<String>) -> Self {
        Self {
            pool,
            handle: handle.into(),
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Append one line. Losing a log line must not fail the build, so write
    /// errors are only logged.
    pub async fn append(&self, line: impl AsRef<str>) {
        let result = sqlx::query(
            "INSERT INTO build_log_lines (log_handle, line, created_at) VALUES (?, ?, ?)",
        )
        .bind(&self.handle)
        .bind(line.as_ref())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(log_handle = %self.handle, error = %e, "failed to append build log line");
        }
    }

    /// Lines after `offset` (0 reads everything), oldest first.
    pub async fn read(&self, offset: usize) -> Result<BuildLogChunk> {
        let offset = i64::try_from(offset).map_err(|_| {
            OrchestratorError::Validation(format!("log offset {offset} is out of range"))
        })?;
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT seq, line FROM build_log_lines WHERE log_handle = ? ORDER BY seq ASC LIMIT -1 OFFSET ?",
        )
        .bind(&self.handle)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let next_offset = offset.saturating_add(rows.len() as i64);
        Ok(BuildLogChunk {
            lines: rows.into_iter().map(|(_, line)| line).collect(),
            next_offset,
        })
    }
}
