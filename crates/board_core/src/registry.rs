//! Ordered set of pipeline stages a board lays its columns out from.

use std::collections::HashSet;

use shared::domain::{Stage, StageId};

use crate::error::RegistryError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageRegistry {
    stages: Vec<Stage>,
}

impl StageRegistry {
    /// Builds a registry ordered by `sort_order`. Ties keep input order.
    pub fn new(stages: Vec<Stage>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::with_capacity(stages.len());
        for stage in &stages {
            if !seen.insert(stage.id.clone()) {
                return Err(RegistryError::DuplicateStage(stage.id.clone()));
            }
        }

        let mut stages = stages;
        stages.sort_by_key(|stage| stage.sort_order);
        Ok(Self { stages })
    }

    /// Status board used for prospect tracking.
    pub fn prospect_status() -> Self {
        Self {
            stages: vec![
                Stage::new("new", "New", 0),
                Stage::new("contacted", "Contacted", 1),
                Stage::new("qualified", "Qualified", 2),
                Stage::new("proposal", "Proposal", 3),
                Stage::new("won", "Won", 4),
                Stage::new("lost", "Lost", 5),
            ],
        }
    }

    /// Deal-stage board used for the sales pipeline.
    pub fn deal_stages() -> Self {
        Self {
            stages: vec![
                Stage::new("lead", "Lead", 0),
                Stage::new("discovery", "Discovery", 1),
                Stage::new("negotiation", "Negotiation", 2),
                Stage::new("closed_won", "Closed won", 3),
                Stage::new("closed_lost", "Closed lost", 4),
            ],
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "prospects" | "status" => Some(Self::prospect_status()),
            "deals" => Some(Self::deal_stages()),
            _ => None,
        }
    }

    pub fn get(&self, stage_id: &StageId) -> Option<&Stage> {
        self.stages.iter().find(|stage| &stage.id == stage_id)
    }

    /// Column position of a stage.
    pub fn position(&self, stage_id: &StageId) -> Option<usize> {
        self.stages.iter().position(|stage| &stage.id == stage_id)
    }

    pub fn contains(&self, stage_id: &StageId) -> bool {
        self.position(stage_id).is_some()
    }

    /// Stage with the minimum `sort_order`.
    pub fn lowest(&self) -> Option<&Stage> {
        self.stages.first()
    }

    pub fn at(&self, position: usize) -> Option<&Stage> {
        self.stages.get(position)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
