//! Change detection for file-backed stores shared between processes.
//!
//! A dedicated connection polls `PRAGMA data_version`, which moves whenever
//! another connection (in this process or another one) commits. Each move
//! triggers a snapshot diff that is turned into change events.

use std::{collections::BTreeMap, time::Duration};

use anyhow::{Context, Result};
use board_core::backend::Subscription;
use shared::{
    domain::{RecordId, StageId},
    protocol::{ChangeEvent, ChangeKind, EntityKind},
};
use sqlx::{sqlite::SqliteConnectOptions, ConnectOptions, Row, SqliteConnection};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

const WATCH_CAPACITY: usize = 256;

/// `(stage_id, last_contact_at, fields_json, updated_at)` as stored.
type RecordRow = (Option<String>, Option<String>, String, String);

#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct Snapshot {
    pub(crate) records: BTreeMap<RecordId, RecordRow>,
    pub(crate) stages: BTreeMap<StageId, (String, i32)>,
}

pub(crate) async fn subscribe(
    options: SqliteConnectOptions,
    entity: EntityKind,
    interval: Duration,
) -> Result<Subscription> {
    let mut conn = options
        .connect()
        .await
        .context("failed to open change watch connection")?;
    let mut version = data_version(&mut conn).await?;
    let mut known = snapshot(&mut conn).await?;
    let (events, receiver) = broadcast::channel(WATCH_CAPACITY);

    let pump = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let changes = match poll(&mut conn, &mut version, &mut known).await {
                Ok(changes) => changes,
                Err(err) => {
                    warn!(error = %err, "change watch poll failed");
                    continue;
                }
            };
            for event in changes {
                if events.send(event).is_err() {
                    debug!("change watch has no subscribers left");
                    return;
                }
            }
        }
    });

    Ok(Subscription::new(entity, receiver).with_pump(pump))
}

async fn poll(
    conn: &mut SqliteConnection,
    version: &mut i64,
    known: &mut Snapshot,
) -> Result<Vec<ChangeEvent>> {
    let current = data_version(conn).await?;
    if current == *version {
        return Ok(Vec::new());
    }
    let next = snapshot(conn).await?;
    let changes = diff(known, &next);
    *version = current;
    *known = next;
    Ok(changes)
}

async fn data_version(conn: &mut SqliteConnection) -> Result<i64> {
    sqlx::query_scalar("PRAGMA data_version")
        .fetch_one(&mut *conn)
        .await
        .context("failed to read data_version")
}

async fn snapshot(conn: &mut SqliteConnection) -> Result<Snapshot> {
    let mut snapshot = Snapshot::default();

    let rows = sqlx::query(
        "SELECT id, stage_id, last_contact_at, fields_json, updated_at FROM records",
    )
    .fetch_all(&mut *conn)
    .await?;
    for row in rows {
        snapshot.records.insert(
            RecordId(row.try_get("id")?),
            (
                row.try_get("stage_id")?,
                row.try_get("last_contact_at")?,
                row.try_get("fields_json")?,
                row.try_get("updated_at")?,
            ),
        );
    }

    let rows = sqlx::query("SELECT id, display_name, sort_order FROM stages")
        .fetch_all(&mut *conn)
        .await?;
    for row in rows {
        snapshot.stages.insert(
            StageId(row.try_get("id")?),
            (row.try_get("display_name")?, row.try_get("sort_order")?),
        );
    }

    Ok(snapshot)
}

/// Events turning `before` into `after`: records first, then stages.
pub(crate) fn diff(before: &Snapshot, after: &Snapshot) -> Vec<ChangeEvent> {
    let mut events = Vec::new();

    for (kind, record_id) in changed_keys(&before.records, &after.records) {
        events.push(ChangeEvent::RecordChanged { kind, record_id });
    }
    for (kind, stage_id) in changed_keys(&before.stages, &after.stages) {
        events.push(ChangeEvent::StageChanged { kind, stage_id });
    }

    events
}

fn changed_keys<K: Ord + Clone, V: PartialEq>(
    before: &BTreeMap<K, V>,
    after: &BTreeMap<K, V>,
) -> Vec<(ChangeKind, K)> {
    let mut changes = Vec::new();
    for (key, value) in after {
        match before.get(key) {
            None => changes.push((ChangeKind::Insert, key.clone())),
            Some(old) if old != value => changes.push((ChangeKind::Update, key.clone())),
            Some(_) => {}
        }
    }
    for key in before.keys() {
        if !after.contains_key(key) {
            changes.push((ChangeKind::Delete, key.clone()));
        }
    }
    changes
}

#[cfg(test)]
#[path = "tests/watch_tests.rs"]
mod tests;
