//! Per-stage side effects applied when a card moves into a stage.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use shared::domain::StageId;
use tracing::warn;

/// Largest offset, in either direction, accepted from configuration.
pub const MAX_OFFSET_DAYS: i64 = 36_500;

/// Synthetic last-contact date table: entering a listed stage stamps the
/// record with `now - days`. Stages not listed leave the date untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactDatePolicy {
    days_ago: BTreeMap<StageId, i64>,
}

impl ContactDatePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, stage_id: impl Into<StageId>, days_ago: i64) -> Self {
        self.days_ago.insert(stage_id.into(), days_ago);
        self
    }

    pub fn from_table<I, K>(table: I) -> Self
    where
        I: IntoIterator<Item = (K, i64)>,
        K: Into<StageId>,
    {
        Self {
            days_ago: table
                .into_iter()
                .map(|(stage_id, days)| (stage_id.into(), days))
                .collect(),
        }
    }

    pub fn accepts_offset(days_ago: i64) -> bool {
        (-MAX_OFFSET_DAYS..=MAX_OFFSET_DAYS).contains(&days_ago)
    }

    /// Offsets that leave the representable date range derive nothing.
    pub fn derive(&self, stage_id: &StageId, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let days = *self.days_ago.get(stage_id)?;
        let derived = TimeDelta::try_days(days).and_then(|offset| now.checked_sub_signed(offset));
        if derived.is_none() {
            warn!(stage_id = %stage_id, days, "contact date offset out of range; leaving date unchanged");
        }
        derived
    }

    pub fn is_empty(&self) -> bool {
        self.days_ago.is_empty()
    }
}
