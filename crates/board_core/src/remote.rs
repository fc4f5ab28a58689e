//! HTTP + WebSocket client for a REST-style managed backend.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use shared::{
    domain::{Record, RecordId, Stage},
    error::{ApiError, ApiException},
    protocol::{ChangeEvent, EntityKind, StageUpdateRequest},
};
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::backend::{ChangeFeed, MutationSink, RecordSource, Subscription};

const FEED_CAPACITY: usize = 256;

pub struct RestBackend {
    http: Client,
    base_url: Url,
}

impl RestBackend {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("invalid backend url: {base_url}"))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(anyhow!("backend url must start with http:// or https://"));
        }
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("backend url cannot carry a path: {base_url}"));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("backend url cannot carry a path: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn changes_url(&self, entity: EntityKind) -> Result<Url> {
        let mut url = self.endpoint(&["changes"])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive websocket url from {}", self.base_url))?;
        url.query_pairs_mut().append_pair("entity", entity.as_str());
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, segments: &[&str]) -> Result<T> {
        let url = self.endpoint(segments)?;
        let res = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("request failed: GET {url}"))?;
        let res = ensure_success(res).await?;
        res.json()
            .await
            .with_context(|| format!("invalid response body from GET {url}"))
    }
}

async fn ensure_success(res: Response) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(ApiException::from(api_error).into()),
        Err(_) if body.is_empty() => Err(anyhow!("backend returned {status}")),
        Err(_) => Err(anyhow!("backend returned {status}: {body}")),
    }
}

#[async_trait]
impl RecordSource for RestBackend {
    async fn fetch_records(&self) -> Result<Vec<Record>> {
        self.get_json(&["records"]).await
    }

    async fn fetch_stages(&self) -> Result<Vec<Stage>> {
        self.get_json(&["stages"]).await
    }
}

#[async_trait]
impl MutationSink for RestBackend {
    async fn update_record_stage(
        &self,
        record_id: &RecordId,
        update: &StageUpdateRequest,
    ) -> Result<()> {
        let url = self.endpoint(&["records", record_id.as_str(), "stage"])?;
        let res = self
            .http
            .patch(url.clone())
            .json(update)
            .send()
            .await
            .with_context(|| format!("request failed: PATCH {url}"))?;
        ensure_success(res).await?;
        debug!(record_id = %record_id, stage_id = %update.stage_id, "stage update accepted");
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for RestBackend {
    async fn subscribe(&self, entity: EntityKind) -> Result<Subscription> {
        let ws_url = self.changes_url(entity)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .with_context(|| format!("failed to connect change feed: {ws_url}"))?;
        let (_, mut ws_reader) = ws_stream.split();
        let (events, receiver) = broadcast::channel(FEED_CAPACITY);

        let pump = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ChangeEvent>(&text) {
                        Ok(event) => {
                            let _ = events.send(event);
                        }
                        Err(err) => warn!(error = %err, "ignoring invalid change event"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "change feed receive failed");
                        break;
                    }
                }
            }
            info!("change feed connection ended");
        });

        info!(url = %ws_url, entity = entity.as_str(), "change feed subscribed");
        Ok(Subscription::new(entity, receiver).with_pump(pump))
    }
}

#[cfg(test)]
#[path = "tests/remote_tests.rs"]
mod tests;
