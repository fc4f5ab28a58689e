//! Narrow interfaces the board consumes from the managed backend.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{Record, RecordId, Stage},
    protocol::{ChangeEvent, EntityKind, StageUpdateRequest},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::warn;

#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_records(&self) -> Result<Vec<Record>>;
    async fn fetch_stages(&self) -> Result<Vec<Stage>>;
}

#[async_trait]
pub trait MutationSink: Send + Sync {
    /// The only write the board issues. Must succeed or fail as a whole.
    async fn update_record_stage(
        &self,
        record_id: &RecordId,
        update: &StageUpdateRequest,
    ) -> Result<()>;
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, entity: EntityKind) -> Result<Subscription>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSignal {
    Event(ChangeEvent),
    /// Events were dropped; the consumer must assume anything changed.
    Lagged(u64),
}

/// Live change-feed subscription. Dropping it tears the feed down.
pub struct Subscription {
    entity: EntityKind,
    events: broadcast::Receiver<ChangeEvent>,
    pump: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(entity: EntityKind, events: broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            entity,
            events,
            pump: None,
        }
    }

    /// Ties a background task feeding `events` to the subscription lifetime.
    pub fn with_pump(mut self, pump: JoinHandle<()>) -> Self {
        self.pump = Some(pump);
        self
    }

    pub fn entity(&self) -> EntityKind {
        self.entity
    }

    /// Next signal for the subscribed entity, or `None` once the feed closed.
    pub async fn recv(&mut self) -> Option<FeedSignal> {
        loop {
            match self.events.recv().await {
                Ok(event) if event.entity() == self.entity => {
                    return Some(FeedSignal::Event(event));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, entity = self.entity.as_str(), "change feed lagged");
                    return Some(FeedSignal::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Feed for backends without realtime support.
pub struct MissingChangeFeed;

#[async_trait]
impl ChangeFeed for MissingChangeFeed {
    async fn subscribe(&self, entity: EntityKind) -> Result<Subscription> {
        Err(anyhow!(
            "change feed is unavailable for {} events",
            entity.as_str()
        ))
    }
}

/// The three backend seams a board is mounted against.
#[derive(Clone)]
pub struct BoardBackend {
    pub source: Arc<dyn RecordSource>,
    pub sink: Arc<dyn MutationSink>,
    pub feed: Arc<dyn ChangeFeed>,
}

impl BoardBackend {
    pub fn new(
        source: Arc<dyn RecordSource>,
        sink: Arc<dyn MutationSink>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Self {
        Self { source, sink, feed }
    }

    /// Uses one object for all three seams.
    pub fn from_shared<T>(backend: Arc<T>) -> Self
    where
        T: RecordSource + MutationSink + ChangeFeed + 'static,
    {
        Self {
            source: backend.clone(),
            sink: backend.clone(),
            feed: backend,
        }
    }

    /// Same backend with realtime disabled.
    pub fn without_feed(mut self) -> Self {
        self.feed = Arc::new(MissingChangeFeed);
        self
    }
}
