use anyhow::{Context, Result};
use async_trait::async_trait;
use board_core::backend::{ChangeFeed, MutationSink, RecordSource, Subscription};
use chrono::{DateTime, Utc};
use shared::{
    domain::{Record, RecordId, Stage, StageId},
    protocol::{ChangeEvent, ChangeKind, EntityKind, StageUpdateRequest},
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

mod watch;

pub use watch::DEFAULT_POLL_INTERVAL;

const CHANGE_FEED_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    RecordNotFound(RecordId),
    #[error("stage {0} is not registered")]
    UnknownStage(StageId),
}

/// Local SQLite stand-in for the managed backend.
///
/// In-memory stores publish their own writes on an in-process feed. File-backed
/// stores watch the database file instead, so writes from other handles and
/// other processes reach subscribers too.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    events: broadcast::Sender<ChangeEvent>,
    watch_options: Option<SqliteConnectOptions>,
    poll_interval: Duration,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let watch_options = sqlite_path(database_url).map(|_| connect_options.clone());
        // In-memory databases live in a shared cache; keep them to one connection.
        let max_connections = if database_url.starts_with("sqlite::memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        let (events, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            pool,
            events,
            watch_options,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// How often a file-backed store checks for commits.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    fn publish(&self, event: ChangeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub async fn upsert_stage(&self, stage: &Stage) -> Result<()> {
        let existed = sqlx::query("SELECT 1 FROM stages WHERE id = ?")
            .bind(stage.id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        sqlx::query(
            "INSERT INTO stages (id, display_name, sort_order) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET display_name=excluded.display_name, sort_order=excluded.sort_order",
        )
        .bind(stage.id.as_str())
        .bind(&stage.display_name)
        .bind(stage.sort_order)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert stage {}", stage.id))?;

        self.publish(ChangeEvent::StageChanged {
            kind: if existed {
                ChangeKind::Update
            } else {
                ChangeKind::Insert
            },
            stage_id: stage.id.clone(),
        });
        Ok(())
    }

    pub async fn list_stages(&self) -> Result<Vec<Stage>> {
        let rows = sqlx::query(
            "SELECT id, display_name, sort_order FROM stages ORDER BY sort_order, rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| Stage {
                id: StageId(r.get::<String, _>(0)),
                display_name: r.get::<String, _>(1),
                sort_order: r.get::<i32, _>(2),
            })
            .collect())
    }

    pub async fn insert_record(&self, record: &Record) -> Result<()> {
        let fields_json = serde_json::to_string(&record.fields)?;
        sqlx::query(
            "INSERT INTO records (id, stage_id, last_contact_at, fields_json) VALUES (?, ?, ?, ?)",
        )
        .bind(record.id.as_str())
        .bind(record.stage_id.as_ref().map(StageId::as_str))
        .bind(record.last_contact_at)
        .bind(fields_json)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert record {}", record.id))?;

        self.publish(ChangeEvent::RecordChanged {
            kind: ChangeKind::Insert,
            record_id: record.id.clone(),
        });
        Ok(())
    }

    /// Inserts a record under a fresh id.
    pub async fn create_record(
        &self,
        stage_id: Option<StageId>,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<RecordId> {
        let record = Record {
            id: RecordId::new(uuid::Uuid::new_v4().to_string()),
            stage_id,
            last_contact_at: None,
            fields,
        };
        self.insert_record(&record).await?;
        Ok(record.id)
    }

    /// Records in insertion order.
    pub async fn list_records(&self) -> Result<Vec<Record>> {
        let rows = sqlx::query(
            "SELECT id, stage_id, last_contact_at, fields_json FROM records ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn get_record(&self, record_id: &RecordId) -> Result<Option<Record>> {
        let row = sqlx::query(
            "SELECT id, stage_id, last_contact_at, fields_json FROM records WHERE id = ?",
        )
        .bind(record_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Moves a record to a registered stage in one transaction.
    pub async fn set_record_stage(
        &self,
        record_id: &RecordId,
        update: &StageUpdateRequest,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let stage_known = sqlx::query("SELECT 1 FROM stages WHERE id = ?")
            .bind(update.stage_id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !stage_known {
            return Err(StoreError::UnknownStage(update.stage_id.clone()).into());
        }

        let result = sqlx::query(
            "UPDATE records
             SET stage_id = ?,
                 last_contact_at = COALESCE(?, last_contact_at),
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
        )
        .bind(update.stage_id.as_str())
        .bind(update.last_contact_at)
        .bind(record_id.as_str())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RecordNotFound(record_id.clone()).into());
        }
        tx.commit().await?;

        debug!(record_id = %record_id, stage_id = %update.stage_id, "record stage updated");
        self.publish(ChangeEvent::RecordChanged {
            kind: ChangeKind::Update,
            record_id: record_id.clone(),
        });
        Ok(())
    }

    pub async fn delete_record(&self, record_id: &RecordId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM records WHERE id = ?")
            .bind(record_id.as_str())
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            info!(record_id = %record_id, "record deleted");
            self.publish(ChangeEvent::RecordChanged {
                kind: ChangeKind::Delete,
                record_id: record_id.clone(),
            });
        }
        Ok(deleted)
    }
}

fn record_from_row(row: &SqliteRow) -> Result<Record> {
    let id: String = row.try_get("id")?;
    let stage_id: Option<String> = row.try_get("stage_id")?;
    let last_contact_at: Option<DateTime<Utc>> = row.try_get("last_contact_at")?;
    let fields_json: String = row.try_get("fields_json")?;
    let fields = serde_json::from_str(&fields_json)
        .with_context(|| format!("invalid fields_json for record {id}"))?;
    Ok(Record {
        id: RecordId(id),
        stage_id: stage_id.map(StageId),
        last_contact_at,
        fields,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[async_trait]
impl RecordSource for Storage {
    async fn fetch_records(&self) -> Result<Vec<Record>> {
        self.list_records().await
    }

    async fn fetch_stages(&self) -> Result<Vec<Stage>> {
        self.list_stages().await
    }
}

#[async_trait]
impl MutationSink for Storage {
    async fn update_record_stage(
        &self,
        record_id: &RecordId,
        update: &StageUpdateRequest,
    ) -> Result<()> {
        self.set_record_stage(record_id, update).await
    }
}

#[async_trait]
impl ChangeFeed for Storage {
    async fn subscribe(&self, entity: EntityKind) -> Result<Subscription> {
        match &self.watch_options {
            Some(options) => watch::subscribe(options.clone(), entity, self.poll_interval).await,
            None => Ok(Subscription::new(entity, self.events.subscribe())),
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
