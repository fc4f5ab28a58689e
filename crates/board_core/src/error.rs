use std::time::Duration;

use shared::domain::{RecordId, StageId};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate stage id {0}")]
    DuplicateStage(StageId),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DragError {
    #[error("a drag session is already active for {0}")]
    SessionActive(String),
    #[error("no drag session is active")]
    NoSession,
    #[error("invalid drag payload: {0}")]
    InvalidPayload(String),
    #[error("drag payload names record {payload} but the drag identity belongs to {identity}")]
    PayloadMismatch { identity: RecordId, payload: RecordId },
    #[error("unknown column {0}")]
    UnknownColumn(usize),
    #[error("column {column} has no card at index {index}")]
    SourceOutOfRange { column: usize, index: usize },
    #[error("record {0} has a stage update in flight")]
    PendingMutation(RecordId),
    #[error("unknown record {0}")]
    UnknownRecord(RecordId),
    #[error("unknown stage {0}")]
    UnknownStage(StageId),
}

/// Terminal failure of a single move's persistence call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistError {
    #[error("stage update rejected: {0}")]
    Rejected(String),
    #[error("stage update timed out after {0:?}")]
    TimedOut(Duration),
}
