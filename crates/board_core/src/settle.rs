//! Cancellable delayed callback used to clear post-drop UI markers.

use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;

#[derive(Default)]
pub struct SettleTimer {
    pending: Option<JoinHandle<()>>,
}

impl SettleTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `callback` after `delay`, replacing any callback still waiting.
    pub fn schedule<F>(&mut self, delay: Duration, callback: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback.await;
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|pending| !pending.is_finished())
    }
}

impl Drop for SettleTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
