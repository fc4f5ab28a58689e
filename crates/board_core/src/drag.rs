//! Lifecycle of the single in-progress drag gesture.

use std::mem;

use serde::{Deserialize, Serialize};
use shared::domain::{RecordId, StageId};
use tracing::debug;

use crate::{distributor::DragIdentity, error::DragError};

/// Position of a card: column index on the board, card index inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    pub column: usize,
    pub index: usize,
}

impl Slot {
    pub fn new(column: usize, index: usize) -> Self {
        Self { column, index }
    }
}

/// Payload attached to a drag by the input layer. Validated on drag start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DragPayload {
    Card {
        record_id: RecordId,
        #[serde(default)]
        stage_id: Option<StageId>,
    },
}

impl DragPayload {
    pub fn card(record_id: RecordId, stage_id: Option<StageId>) -> Self {
        Self::Card {
            record_id,
            stage_id,
        }
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, DragError> {
        serde_json::from_value(value).map_err(|err| DragError::InvalidPayload(err.to_string()))
    }

    pub fn record_id(&self) -> &RecordId {
        match self {
            Self::Card { record_id, .. } => record_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DragSession {
    pub active_id: DragIdentity,
    pub record_id: RecordId,
    pub source: Slot,
    pub dest: Slot,
    pub payload: DragPayload,
}

impl DragSession {
    pub fn is_noop(&self) -> bool {
        self.source == self.dest
    }
}

#[derive(Debug, Default)]
enum DragState {
    #[default]
    Idle,
    Dragging(DragSession),
}

/// Idle/Dragging state machine. A second start while dragging is rejected.
#[derive(Debug, Default)]
pub struct DragController {
    state: DragState,
}

impl DragController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_dragging(&self) -> bool {
        matches!(self.state, DragState::Dragging(_))
    }

    pub fn session(&self) -> Option<&DragSession> {
        match &self.state {
            DragState::Idle => None,
            DragState::Dragging(session) => Some(session),
        }
    }

    pub fn start_drag(
        &mut self,
        active_id: DragIdentity,
        source: Slot,
        payload: serde_json::Value,
    ) -> Result<&DragSession, DragError> {
        if let DragState::Dragging(session) = &self.state {
            return Err(DragError::SessionActive(session.active_id.to_string()));
        }

        let payload = DragPayload::from_value(payload)?;
        let record_id = active_id.record_id();
        if payload.record_id() != &record_id {
            return Err(DragError::PayloadMismatch {
                identity: record_id,
                payload: payload.record_id().clone(),
            });
        }

        debug!(active_id = %active_id, column = source.column, index = source.index, "drag started");
        self.state = DragState::Dragging(DragSession {
            active_id,
            record_id,
            source,
            dest: source,
            payload,
        });
        match &self.state {
            DragState::Dragging(session) => Ok(session),
            DragState::Idle => Err(DragError::NoSession),
        }
    }

    /// `None` means the pointer left every drop target; the last valid
    /// destination is kept.
    pub fn update_destination(&mut self, dest: Option<Slot>) -> Result<(), DragError> {
        let DragState::Dragging(session) = &mut self.state else {
            return Err(DragError::NoSession);
        };
        match dest {
            Some(dest) => session.dest = dest,
            None => debug!(
                active_id = %session.active_id,
                "pointer outside drop targets; keeping last destination"
            ),
        }
        Ok(())
    }

    /// Consumes the session and returns to idle.
    pub fn end(&mut self) -> Result<DragSession, DragError> {
        match mem::take(&mut self.state) {
            DragState::Dragging(session) => Ok(session),
            DragState::Idle => Err(DragError::NoSession),
        }
    }

    /// Ends the session as a no-op move back to its source slot.
    pub fn cancel(&mut self) -> Result<DragSession, DragError> {
        let mut session = self.end()?;
        session.dest = session.source;
        Ok(session)
    }
}

#[cfg(test)]
#[path = "tests/drag_tests.rs"]
mod tests;
