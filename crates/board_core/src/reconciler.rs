//! Authoritative column state: optimistic moves, persistence, rollback and
//! change-feed reconciliation.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use shared::{
    domain::{Record, RecordId, StageId},
    protocol::StageUpdateRequest,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    backend::{FeedSignal, MutationSink, RecordSource},
    distributor::{distribute, Card, Column},
    drag::{DragSession, Slot},
    error::{DragError, PersistError},
    options::BoardOptions,
    registry::StageRegistry,
};

const REFRESH_ATTEMPTS: usize = 3;

/// User-visible, non-blocking board notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum BoardNotice {
    MoveConfirmed {
        record_id: RecordId,
        label: String,
        stage_id: StageId,
        stage_name: String,
    },
    MoveFailed {
        record_id: RecordId,
        label: String,
        error: PersistError,
    },
    Refreshed {
        records: usize,
    },
    RefreshFailed(String),
    FeedUnavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MoveOutcome {
    /// Dropped on its own slot.
    Noop,
    /// Reordered inside its stage; nothing to persist.
    Reordered,
    Confirmed,
    RolledBack(PersistError),
    /// The session no longer matches the board.
    Rejected(DragError),
}

struct PendingMove {
    source: Slot,
    stage_id: StageId,
    last_contact_at: Option<DateTime<Utc>>,
}

struct BoardState {
    /// Last records fetched from the source, with confirmed moves applied.
    records: Vec<Record>,
    columns: Vec<Column>,
    pending: HashMap<RecordId, PendingMove>,
    deferred: HashSet<RecordId>,
    /// Bumped whenever a move resolves.
    epoch: u64,
}

struct PreparedMove {
    record_id: RecordId,
    label: String,
    update: StageUpdateRequest,
}

enum Prepared {
    Done(MoveOutcome),
    Persist(PreparedMove),
}

pub struct BoardReconciler {
    registry: StageRegistry,
    options: BoardOptions,
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn MutationSink>,
    state: Mutex<BoardState>,
    notices: broadcast::Sender<BoardNotice>,
}

impl BoardReconciler {
    pub fn new(
        registry: StageRegistry,
        options: BoardOptions,
        source: Arc<dyn RecordSource>,
        sink: Arc<dyn MutationSink>,
        records: Vec<Record>,
    ) -> Self {
        let columns = distribute(&records, &registry, &options.default_column);
        let (notices, _) = broadcast::channel(256);
        Self {
            registry,
            options,
            source,
            sink,
            state: Mutex::new(BoardState {
                records,
                columns,
                pending: HashMap::new(),
                deferred: HashSet::new(),
                epoch: 0,
            }),
            notices,
        }
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn options(&self) -> &BoardOptions {
        &self.options
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<BoardNotice> {
        self.notices.subscribe()
    }

    pub(crate) fn notify(&self, notice: BoardNotice) {
        let _ = self.notices.send(notice);
    }

    /// Snapshot of the current columns.
    pub async fn columns(&self) -> Vec<Column> {
        self.state.lock().await.columns.clone()
    }

    pub async fn is_pending(&self, record_id: &RecordId) -> bool {
        self.state.lock().await.pending.contains_key(record_id)
    }

    pub async fn locate(&self, record_id: &RecordId) -> Option<Slot> {
        locate(&self.state.lock().await.columns, record_id)
    }

    pub async fn column_len(&self, column: usize) -> Option<usize> {
        self.state.lock().await.columns.get(column).map(Column::len)
    }

    /// Current slot of `record_id` and the number of cards `column` holds
    /// once that record is lifted out, read under one lock.
    pub async fn move_bounds(
        &self,
        record_id: &RecordId,
        column: usize,
    ) -> Result<(Slot, usize), DragError> {
        let state = self.state.lock().await;
        let source = locate(&state.columns, record_id)
            .ok_or_else(|| DragError::UnknownRecord(record_id.clone()))?;
        let len = state
            .columns
            .get(column)
            .map(Column::len)
            .ok_or(DragError::UnknownColumn(column))?;
        let len = if column == source.column {
            len.saturating_sub(1)
        } else {
            len
        };
        Ok((source, len))
    }

    /// Resolves a finished drag. Persistence failures are reported through
    /// notices and the returned outcome, never as errors.
    pub async fn on_drop(&self, session: DragSession) -> MoveOutcome {
        if session.is_noop() {
            debug!(record_id = %session.record_id, "drop on source slot; nothing to do");
            return MoveOutcome::Noop;
        }

        let prepared = {
            let mut state = self.state.lock().await;
            self.apply_optimistic(&mut state, &session)
        };
        let prepared = match prepared {
            Prepared::Done(outcome) => return outcome,
            Prepared::Persist(prepared) => prepared,
        };

        info!(
            record_id = %prepared.record_id,
            stage_id = %prepared.update.stage_id,
            "persisting stage change"
        );
        let result = match tokio::time::timeout(
            self.options.persist_timeout,
            self.sink
                .update_record_stage(&prepared.record_id, &prepared.update),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(PersistError::Rejected(format!("{err:#}"))),
            Err(_) => Err(PersistError::TimedOut(self.options.persist_timeout)),
        };

        let needs_refresh = {
            let mut state = self.state.lock().await;
            self.resolve(&mut state, &prepared.record_id, &result)
        };

        let outcome = match result {
            Ok(()) => {
                let stage_id = prepared.update.stage_id.clone();
                let stage_name = self
                    .registry
                    .get(&stage_id)
                    .map(|stage| stage.display_name.clone())
                    .unwrap_or_else(|| stage_id.to_string());
                self.notify(BoardNotice::MoveConfirmed {
                    record_id: prepared.record_id.clone(),
                    label: prepared.label.clone(),
                    stage_id,
                    stage_name,
                });
                MoveOutcome::Confirmed
            }
            Err(err) => {
                error!(record_id = %prepared.record_id, error = %err, "stage change failed; rolled back");
                self.notify(BoardNotice::MoveFailed {
                    record_id: prepared.record_id.clone(),
                    label: prepared.label.clone(),
                    error: err.clone(),
                });
                MoveOutcome::RolledBack(err)
            }
        };

        if needs_refresh {
            if let Err(err) = self.refresh().await {
                warn!(record_id = %prepared.record_id, error = %err, "deferred refresh failed");
            }
        }

        outcome
    }

    fn apply_optimistic(&self, state: &mut BoardState, session: &DragSession) -> Prepared {
        let record_id = &session.record_id;
        if state.pending.contains_key(record_id) {
            return Prepared::Done(MoveOutcome::Rejected(DragError::PendingMutation(
                record_id.clone(),
            )));
        }
        if session.dest.column >= state.columns.len() {
            return Prepared::Done(MoveOutcome::Rejected(DragError::UnknownColumn(
                session.dest.column,
            )));
        }

        // The columns may have been re-derived since the drag started.
        let source = match card_slot(&state.columns, session.source, record_id) {
            Some(source) => source,
            None => {
                return Prepared::Done(MoveOutcome::Rejected(DragError::UnknownRecord(
                    record_id.clone(),
                )))
            }
        };

        let mut card = state.columns[source.column].cards.remove(source.index);
        let source_stage = state.columns[source.column].stage.clone();
        let dest_stage = state.columns[session.dest.column].stage.clone();

        let target = match dest_stage {
            Some(stage_id) if source_stage.as_ref() != Some(&stage_id) => {
                let last_contact_at = self.options.contact_policy.derive(&stage_id, Utc::now());
                card.record.stage_id = Some(stage_id.clone());
                if last_contact_at.is_some() {
                    card.record.last_contact_at = last_contact_at;
                }
                Some((stage_id, last_contact_at))
            }
            _ => None,
        };

        let label = card.record.label().to_string();
        let dest_cards = &mut state.columns[session.dest.column].cards;
        let index = session.dest.index.min(dest_cards.len());
        dest_cards.insert(index, card);

        let Some((stage_id, last_contact_at)) = target else {
            debug!(record_id = %record_id, index, "reordered within stage");
            return Prepared::Done(MoveOutcome::Reordered);
        };

        state.pending.insert(
            record_id.clone(),
            PendingMove {
                source,
                stage_id: stage_id.clone(),
                last_contact_at,
            },
        );
        Prepared::Persist(PreparedMove {
            record_id: record_id.clone(),
            label,
            update: StageUpdateRequest {
                stage_id,
                last_contact_at,
            },
        })
    }

    /// Confirms or rolls back a pending move. Returns whether a change-feed
    /// event was deferred while it was in flight.
    fn resolve(
        &self,
        state: &mut BoardState,
        record_id: &RecordId,
        result: &std::result::Result<(), PersistError>,
    ) -> bool {
        state.epoch += 1;
        let Some(pending) = state.pending.remove(record_id) else {
            return state.deferred.remove(record_id);
        };

        match result {
            Ok(()) => {
                if let Some(record) = state.records.iter_mut().find(|r| &r.id == record_id) {
                    record.stage_id = Some(pending.stage_id);
                    if pending.last_contact_at.is_some() {
                        record.last_contact_at = pending.last_contact_at;
                    }
                }
            }
            Err(_) => {
                if let Some(current) = locate(&state.columns, record_id) {
                    state.columns[current.column].cards.remove(current.index);
                }
                // Cached records never carry optimistic state, so the cached
                // copy is the pre-move record. A record deleted meanwhile stays gone.
                let original = state.records.iter().find(|r| &r.id == record_id).cloned();
                if let Some(original) = original {
                    if let Some(column) = state.columns.get_mut(pending.source.column) {
                        let index = pending.source.index.min(column.cards.len());
                        column.cards.insert(index, Card::new(original));
                    }
                }
            }
        }

        state.deferred.remove(record_id)
    }

    /// Handles one change-feed signal: defers events for records with a move
    /// in flight, re-derives the board for everything else.
    pub async fn invalidate(&self, signal: FeedSignal) -> Result<()> {
        if let FeedSignal::Event(event) = &signal {
            if let Some(record_id) = event.record_id() {
                let mut state = self.state.lock().await;
                if state.pending.contains_key(record_id) {
                    debug!(record_id = %record_id, "deferring change event for pending move");
                    state.deferred.insert(record_id.clone());
                    return Ok(());
                }
            }
        }
        self.refresh().await
    }

    /// Re-fetches records and re-derives every column.
    pub async fn refresh(&self) -> Result<()> {
        for attempt in 1..=REFRESH_ATTEMPTS {
            let epoch = self.state.lock().await.epoch;
            let records = match self
                .source
                .fetch_records()
                .await
                .context("failed to fetch records")
            {
                Ok(records) => records,
                Err(err) => {
                    self.notify(BoardNotice::RefreshFailed(format!("{err:#}")));
                    return Err(err);
                }
            };

            let mut state = self.state.lock().await;
            if state.epoch != epoch && attempt < REFRESH_ATTEMPTS {
                debug!(attempt, "a move resolved during fetch; fetching again");
                continue;
            }
            let count = records.len();
            state.records = records;
            let columns = self.derive(&state);
            state.columns = columns;
            drop(state);

            debug!(records = count, "board re-derived");
            self.notify(BoardNotice::Refreshed { records: count });
            return Ok(());
        }
        Ok(())
    }

    /// Distribution of the cached records with in-flight moves overlaid.
    fn derive(&self, state: &BoardState) -> Vec<Column> {
        if state.pending.is_empty() {
            return distribute(&state.records, &self.registry, &self.options.default_column);
        }

        let overlaid: Vec<Record> = state
            .records
            .iter()
            .map(|record| match state.pending.get(&record.id) {
                Some(pending) => {
                    let mut record = record.clone();
                    record.stage_id = Some(pending.stage_id.clone());
                    if pending.last_contact_at.is_some() {
                        record.last_contact_at = pending.last_contact_at;
                    }
                    record
                }
                None => record.clone(),
            })
            .collect();
        distribute(&overlaid, &self.registry, &self.options.default_column)
    }
}

fn locate(columns: &[Column], record_id: &RecordId) -> Option<Slot> {
    columns.iter().enumerate().find_map(|(column, cards)| {
        cards
            .position_of(record_id)
            .map(|index| Slot { column, index })
    })
}

/// Current slot of `record_id`, preferring the slot the drag started from.
fn card_slot(columns: &[Column], hint: Slot, record_id: &RecordId) -> Option<Slot> {
    let at_hint = columns
        .get(hint.column)
        .and_then(|column| column.cards.get(hint.index))
        .is_some_and(|card| &card.record.id == record_id);
    if at_hint {
        Some(hint)
    } else {
        locate(columns, record_id)
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
