use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{RecordId, StageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Record,
    Stage,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Stage => "stage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Notification delivered by the change feed. Consumers treat it as an
/// invalidation signal, never as a patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChangeEvent {
    RecordChanged {
        kind: ChangeKind,
        record_id: RecordId,
    },
    StageChanged {
        kind: ChangeKind,
        stage_id: StageId,
    },
}

impl ChangeEvent {
    pub fn entity(&self) -> EntityKind {
        match self {
            Self::RecordChanged { .. } => EntityKind::Record,
            Self::StageChanged { .. } => EntityKind::Stage,
        }
    }

    pub fn record_id(&self) -> Option<&RecordId> {
        match self {
            Self::RecordChanged { record_id, .. } => Some(record_id),
            Self::StageChanged { .. } => None,
        }
    }
}

/// Body of the single write the board issues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageUpdateRequest {
    pub stage_id: StageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_contact_at: Option<DateTime<Utc>>,
}
