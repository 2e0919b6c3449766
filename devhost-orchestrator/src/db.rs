//! SQLite pool setup, embedded migrations and pre-migration backups.

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Backups kept next to the database file.
const BACKUPS_TO_KEEP: usize = 5;

#[instrument(fields(db_path = %db_path.display()))]
pub async fn create_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Pipeline tasks write concurrently with request handlers
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    Ok(pool)
}

#[instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;

    Ok(())
}

/// Copy the database aside before migrating it.
///
/// Returns `None` when there is no database yet. Only the newest
/// [`BACKUPS_TO_KEEP`] copies are retained.
pub fn backup_database(db_path: &Path) -> Result<Option<PathBuf>> {
    if !db_path.exists() {
        return Ok(None);
    }

    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let mut name = db_path.as_os_str().to_owned();
    name.push(format!(".backup.{stamp}"));
    let backup_path = PathBuf::from(name);
    fs::copy(db_path, &backup_path)?;
    info!(backup = %backup_path.display(), "database backed up");

    prune_backups(db_path);
    Ok(Some(backup_path))
}

fn prune_backups(db_path: &Path) {
    let (Some(dir), Some(file_name)) = (db_path.parent(), db_path.file_name()) else {
        return;
    };
    let prefix = format!("{}.backup.", file_name.to_string_lossy());
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };

    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    // Timestamps sort lexically
    let mut backups: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(&prefix))
        })
        .collect();
    backups.sort();

    let excess = backups.len().saturating_sub(BACKUPS_TO_KEEP);
    for old in backups.into_iter().take(excess) {
        if let Err(e) = fs::remove_file(&old) {
            warn!(backup = %old.display(), error = %e, "failed to prune old backup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_pool_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("devhost.db");

        assert!(backup_database(&db_path).unwrap().is_none());

        let pool = create_pool(&db_path).await.unwrap();
        run_migrations(&pool).await.unwrap();
        assert!(db_path.exists());

        let backup = backup_database(&db_path)
            .unwrap()
            .expect("existing database is backed up");
        assert!(backup.exists());
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("devhost.db.backup."));
    }

    #[test]
    fn test_old_backups_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("devhost.db");
        fs::write(&db_path, b"sqlite").unwrap();
        for i in 0..7 {
            fs::write(
                dir.path().join(format!("devhost.db.backup.2024010{i}T000000.000Z")),
                b"old",
            )
            .unwrap();
        }

        backup_database(&db_path).unwrap();

        let remaining = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".backup."))
            .count();
        assert_eq!(remaining, BACKUPS_TO_KEEP);
        assert!(!dir
            .path()
            .join("devhost.db.backup.20240100T000000.000Z")
            .exists());
    }
}
