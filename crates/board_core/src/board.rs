//! Mounted pipeline board: drag gestures in, reconciled columns out.

use std::sync::Arc;

use anyhow::{Context, Result};
use shared::{
    domain::{RecordId, StageId},
    protocol::EntityKind,
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    backend::BoardBackend,
    distributor::{Column, DragIdentity},
    drag::{DragController, DragPayload, DragSession, Slot},
    error::DragError,
    geometry::{resolve_index, resolve_target, CardBounds, ColumnBounds, Point},
    options::BoardOptions,
    reconciler::{BoardNotice, BoardReconciler, MoveOutcome},
    registry::StageRegistry,
    settle::SettleTimer,
};

pub struct Board {
    reconciler: Arc<BoardReconciler>,
    drag: Mutex<DragController>,
    settle: Mutex<SettleTimer>,
    settling: Arc<Mutex<Option<RecordId>>>,
    feed_task: Mutex<Option<JoinHandle<()>>>,
}

impl Board {
    /// Loads stages (unless `registry` is given) and records, lays out the
    /// columns and subscribes to record changes. A feed that cannot be
    /// subscribed is reported and the board runs without it.
    pub async fn mount(
        options: BoardOptions,
        registry: Option<StageRegistry>,
        backend: BoardBackend,
    ) -> Result<Arc<Self>> {
        let registry = match registry {
            Some(registry) => registry,
            None => {
                let stages = backend
                    .source
                    .fetch_stages()
                    .await
                    .context("failed to fetch stages")?;
                StageRegistry::new(stages)?
            }
        };
        let records = backend
            .source
            .fetch_records()
            .await
            .context("failed to fetch records")?;
        info!(
            stages = registry.len(),
            records = records.len(),
            "mounting board"
        );

        let reconciler = Arc::new(BoardReconciler::new(
            registry,
            options,
            backend.source.clone(),
            backend.sink.clone(),
            records,
        ));

        let feed_task = match backend.feed.subscribe(EntityKind::Record).await {
            Ok(mut subscription) => {
                let reconciler = reconciler.clone();
                Some(tokio::spawn(async move {
                    while let Some(signal) = subscription.recv().await {
                        if let Err(err) = reconciler.invalidate(signal).await {
                            warn!(error = %err, "failed to apply change event");
                        }
                    }
                    info!("change feed closed");
                }))
            }
            Err(err) => {
                warn!(error = %err, "change feed unavailable; board keeps its last fetched state");
                reconciler.notify(BoardNotice::FeedUnavailable(format!("{err:#}")));
                None
            }
        };

        Ok(Arc::new(Self {
            reconciler,
            drag: Mutex::new(DragController::new()),
            settle: Mutex::new(SettleTimer::new()),
            settling: Arc::new(Mutex::new(None)),
            feed_task: Mutex::new(feed_task),
        }))
    }

    pub fn registry(&self) -> &StageRegistry {
        self.reconciler.registry()
    }

    pub async fn columns(&self) -> Vec<Column> {
        self.reconciler.columns().await
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<BoardNotice> {
        self.reconciler.subscribe_notices()
    }

    pub async fn feed_connected(&self) -> bool {
        self.feed_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Record most recently dropped, until its settle delay expires.
    pub async fn settling(&self) -> Option<RecordId> {
        self.settling.lock().await.clone()
    }

    pub async fn active_drag(&self) -> Option<DragSession> {
        self.drag.lock().await.session().cloned()
    }

    pub async fn refresh(&self) -> Result<()> {
        self.reconciler.refresh().await
    }

    pub async fn start_drag(
        &self,
        active_id: &str,
        source: Slot,
        payload: serde_json::Value,
    ) -> Result<DragSession, DragError> {
        let identity = DragIdentity::parse(active_id)
            .ok_or_else(|| DragError::InvalidPayload(format!("unknown drag identity {active_id}")))?;
        let record_id = identity.record_id();
        if self.reconciler.is_pending(&record_id).await {
            return Err(DragError::PendingMutation(record_id));
        }
        let columns = self.reconciler.columns().await;
        let card = columns
            .get(source.column)
            .ok_or(DragError::UnknownColumn(source.column))?
            .cards
            .get(source.index)
            .ok_or(DragError::SourceOutOfRange {
                column: source.column,
                index: source.index,
            })?;
        if card.record.id != record_id {
            return Err(DragError::SourceOutOfRange {
                column: source.column,
                index: source.index,
            });
        }

        let mut drag = self.drag.lock().await;
        let session = drag.start_drag(identity, source, payload)?.clone();
        self.settle.lock().await.cancel();
        *self.settling.lock().await = None;
        Ok(session)
    }

    /// Pointer moved while dragging; `columns` are the rendered column bounds.
    pub async fn drag_over(
        &self,
        pointer: Point,
        columns: &[ColumnBounds],
    ) -> Result<Slot, DragError> {
        let mut drag = self.drag.lock().await;
        let source = drag.session().ok_or(DragError::NoSession)?.source;
        let target = resolve_target(columns, pointer).map(|slot| post_removal(slot, source));
        drag.update_destination(target)?;
        drag.session()
            .map(|session| session.dest)
            .ok_or(DragError::NoSession)
    }

    /// Pointer moved over a single known column.
    pub async fn drag_over_column(
        &self,
        column: usize,
        cards: &[CardBounds],
        pointer_y: f32,
    ) -> Result<Slot, DragError> {
        if self.reconciler.column_len(column).await.is_none() {
            return Err(DragError::UnknownColumn(column));
        }
        let mut drag = self.drag.lock().await;
        let source = drag.session().ok_or(DragError::NoSession)?.source;
        let slot = post_removal(
            Slot {
                column,
                index: resolve_index(cards, pointer_y),
            },
            source,
        );
        drag.update_destination(Some(slot))?;
        Ok(slot)
    }

    /// Releases the drag and reconciles it. The session is cleared whatever
    /// the outcome.
    pub async fn drop_drag(&self) -> Result<MoveOutcome, DragError> {
        let session = self.drag.lock().await.end()?;
        Ok(self.finish(session).await)
    }

    /// Cancels the drag as a no-op move.
    pub async fn cancel_drag(&self) -> Result<MoveOutcome, DragError> {
        let session = self.drag.lock().await.cancel()?;
        Ok(self.reconciler.on_drop(session).await)
    }

    /// Moves a record through the drag pipeline without pointer input.
    /// `index` defaults to the end of the target column.
    pub async fn move_record(
        &self,
        record_id: &RecordId,
        stage_id: &StageId,
        index: Option<usize>,
    ) -> Result<MoveOutcome, DragError> {
        let column = self
            .registry()
            .position(stage_id)
            .ok_or_else(|| DragError::UnknownStage(stage_id.clone()))?;
        let (source, len) = self.reconciler.move_bounds(record_id, column).await?;
        let dest = Slot {
            column,
            index: index.unwrap_or(len).min(len),
        };

        let identity = DragIdentity::for_record(record_id);
        let payload = serde_json::to_value(DragPayload::card(record_id.clone(), None))
            .map_err(|err| DragError::InvalidPayload(err.to_string()))?;
        self.start_drag(identity.as_str(), source, payload).await?;
        self.drag.lock().await.update_destination(Some(dest))?;
        self.drop_drag().await
    }

    /// Stops the change feed and any scheduled settle callback.
    pub async fn unmount(&self) {
        if let Some(task) = self.feed_task.lock().await.take() {
            task.abort();
        }
        self.settle.lock().await.cancel();
        info!("board unmounted");
    }

    async fn finish(&self, session: DragSession) -> MoveOutcome {
        let record_id = session.record_id.clone();
        let noop = session.is_noop();
        let outcome = self.reconciler.on_drop(session).await;
        if noop || matches!(outcome, MoveOutcome::Rejected(_)) {
            return outcome;
        }

        *self.settling.lock().await = Some(record_id.clone());
        let settling = self.settling.clone();
        self.settle
            .lock()
            .await
            .schedule(self.reconciler.options().settle_delay, async move {
                let mut current = settling.lock().await;
                if current.as_ref() == Some(&record_id) {
                    *current = None;
                }
            });
        outcome
    }
}

/// Rendered columns still show the dragged card in its source slot; indices
/// below it shift up by one once it is removed.
fn post_removal(slot: Slot, source: Slot) -> Slot {
    if slot.column == source.column && slot.index > source.index {
        Slot {
            column: slot.column,
            index: slot.index - 1,
        }
    } else {
        slot
    }
}

#[cfg(test)]
#[path = "tests/board_tests.rs"]
mod tests;
