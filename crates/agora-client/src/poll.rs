use std::{sync::Arc, time::Duration};

use tokio::{sync::oneshot, task::JoinHandle};

use crate::cache::{CacheKey, QueryCache, ReadOutcome};
use crate::mutation::{refresh_collection, CollectionSource};
use crate::AgoraError;

#[derive(Clone)]
/// Background refresher for a session's message list.
///
/// Reads go through the shared cache, so a session whose turn is in flight
/// is skipped and a read that straddles the start of a turn is discarded.
pub struct MessagePoller {
    source: Arc<dyn CollectionSource>,
    cache: Arc<QueryCache>,
    interval: Duration,
}

impl MessagePoller {
    pub fn new(source: Arc<dyn CollectionSource>, cache: Arc<QueryCache>, interval: Duration) -> Self {
        Self {
            source,
            cache,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn poll_once(&self, session_id: &str) -> Result<ReadOutcome, AgoraError> {
        let key = CacheKey::session_messages(session_id);
        if self.cache.is_suspended(&key) {
            tracing::debug!(session_id, "message poll skipped while turn is in flight");
            return Ok(ReadOutcome::Suspended);
        }
        refresh_collection(&self.cache, self.source.as_ref(), &key).await
    }

    /// Polls `session_id` every interval until the handle is shut down or dropped.
    pub fn spawn(&self, session_id: impl Into<String>) -> PollerHandle {
        let session_id = session_id.into();
        let poller = self.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poller.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = &mut shutdown_rx => break,
                }
                if let Err(error) = poller.poll_once(&session_id).await {
                    tracing::warn!(session_id = %session_id, error = %error, "message poll failed");
                }
            }
        });

        PollerHandle {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

#[derive(Debug)]
/// Stops the poll loop when shut down or dropped.
pub struct PollerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
