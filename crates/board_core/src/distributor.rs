//! Pure mapping from a flat record list onto board columns.
//!
//! Cards keep the order in which records arrived from the source. No position
//! field exists, so that order is not guaranteed to survive a re-fetch.

use std::fmt;

use shared::domain::{Record, RecordId, StageId};
use tracing::warn;

use crate::registry::StageRegistry;

const DRAG_IDENTITY_PREFIX: &str = "drag-";

/// Stable per-record handle handed to the input layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DragIdentity(String);

impl DragIdentity {
    pub fn for_record(record_id: &RecordId) -> Self {
        Self(format!("{DRAG_IDENTITY_PREFIX}{record_id}"))
    }

    /// Parses an identity string coming back from the input layer.
    pub fn parse(raw: &str) -> Option<Self> {
        let record_id = raw.strip_prefix(DRAG_IDENTITY_PREFIX)?;
        if record_id.is_empty() {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn record_id(&self) -> RecordId {
        RecordId::new(&self.0[DRAG_IDENTITY_PREFIX.len()..])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DragIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where records without a known stage are placed. This is product policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DefaultColumnPolicy {
    #[default]
    LowestSortOrder,
    Stage(StageId),
}

impl DefaultColumnPolicy {
    fn resolve(&self, registry: &StageRegistry) -> usize {
        match self {
            Self::LowestSortOrder => 0,
            Self::Stage(stage_id) => registry.position(stage_id).unwrap_or_else(|| {
                warn!(
                    stage_id = %stage_id,
                    "default column stage is not registered; using lowest sort order"
                );
                0
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub drag_id: DragIdentity,
    pub record: Record,
}

impl Card {
    pub fn new(record: Record) -> Self {
        Self {
            drag_id: DragIdentity::for_record(&record.id),
            record,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// `None` only for the implicit column of a board without stages.
    pub stage: Option<StageId>,
    pub cards: Vec<Card>,
}

impl Column {
    pub fn position_of(&self, record_id: &RecordId) -> Option<usize> {
        self.cards.iter().position(|card| &card.record.id == record_id)
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

/// Lays `records` out into one column per registered stage.
pub fn distribute(
    records: &[Record],
    registry: &StageRegistry,
    policy: &DefaultColumnPolicy,
) -> Vec<Column> {
    if registry.is_empty() {
        return vec![Column {
            stage: None,
            cards: records.iter().cloned().map(Card::new).collect(),
        }];
    }

    let mut columns: Vec<Column> = registry
        .iter()
        .map(|stage| Column {
            stage: Some(stage.id.clone()),
            cards: Vec::new(),
        })
        .collect();
    let fallback = policy.resolve(registry);

    for record in records {
        let position = record
            .stage_id
            .as_ref()
            .and_then(|stage_id| registry.position(stage_id))
            .unwrap_or(fallback);
        columns[position].cards.push(Card::new(record.clone()));
    }

    columns
}

#[cfg(test)]
#[path = "tests/distributor_tests.rs"]
mod tests;
