//! SQLite ledger of distributed build requests.
//!
//! The controller records every build request so a detached initiator
//! can come back later to query status or cancel. Rows mirror the
//! protocol's `BuildInfo`.

use chrono::{DateTime, Utc};
use morph_core::protocol::{BuildInfo, BuildStatus};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

const BUILDS_COLUMNS: &str = "id, repo, commit_sha1, morphology, original_ref, \
    component_names, status, error, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("build not found: {0}")]
    BuildNotFound(String),
    #[error("invalid build status: {0}")]
    InvalidStatus(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the controller.
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (or create) the ledger database.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations to initialise the schema.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    match sqlx::query(trimmed).execute(&self.pool).await {
                        Ok(_) => {}
                        Err(e) => {
                            let msg = e.to_string();
                            if !msg.contains("duplicate column") && !msg.contains("already exists")
                            {
                                return Err(e.into());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn insert_build(&self, build: &BuildInfo) -> Result<()> {
        sqlx::query(
            "INSERT INTO builds (id, repo, commit_sha1, morphology, original_ref, \
             component_names, status, error, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&build.id)
        .bind(&build.repo)
        .bind(&build.commit)
        .bind(&build.morphology)
        .bind(&build.original_ref)
        .bind(serde_json::to_string(&build.component_names)?)
        .bind(build.status.as_str())
        .bind(&build.error)
        .bind(build.created_at.to_rfc3339())
        .bind(build.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_build(&self, id: &str) -> Result<BuildInfo> {
        let row: Option<BuildRow> =
            sqlx::query_as(&format!("SELECT {BUILDS_COLUMNS} FROM builds WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| StorageError::BuildNotFound(id.to_string()))?
            .into_build()
    }

    /// All builds, newest first.
    pub async fn list_builds(&self) -> Result<Vec<BuildInfo>> {
        let rows: Vec<BuildRow> = sqlx::query_as(&format!(
            "SELECT {BUILDS_COLUMNS} FROM builds ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BuildRow::into_build).collect()
    }

    pub async fn update_build_status(
        &self,
        id: &str,
        status: BuildStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE builds SET status = ?, error = ?, updated_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(error)
                .bind(Utc::now().to_rfc3339())
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::BuildNotFound(id.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BuildRow {
    id: String,
    repo: String,
    commit_sha1: String,
    morphology: String,
    original_ref: Option<String>,
    component_names: String,
    status: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl BuildRow {
    fn into_build(self) -> Result<BuildInfo> {
        let status = BuildStatus::parse(&self.status)
            .ok_or_else(|| StorageError::InvalidStatus(self.status.clone()))?;
        Ok(BuildInfo {
            id: self.id,
            repo: self.repo,
            commit: self.commit_sha1,
            morphology: self.morphology,
            original_ref: self.original_ref,
            component_names: serde_json::from_str(&self.component_names)?,
            status,
            error: self.error,
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
        })
    }
}

fn parse_timestamp(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
