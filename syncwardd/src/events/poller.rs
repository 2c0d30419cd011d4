use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use syncward_core::{ApiError, EngineClient, Event, EventBatch};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::mirror::MirrorError;
use crate::store::StateStore;

/// Default cycle interval and the floor the daemon config enforces.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Mirror(#[from] MirrorError),
    #[error("{event_type} event is missing `{field}`")]
    MissingField {
        event_type: String,
        field: &'static str,
    },
}

/// Receives the events of every batch in engine order.
pub trait EventSink: Send + Sync {
    fn on_event<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), DispatchError>>;

    /// Called after a batch with the highest event ID it contained.
    fn on_batch_done(&self, _last_id: u64) {}
}

#[derive(Debug, Clone)]
pub struct EventPollerConfig {
    pub interval: Duration,
    /// `0` fetches everything since the cursor.
    pub fetch_limit: u32,
    /// Server-side long-poll bound sent as `timeout=`. Keep it at or below
    /// `interval`; `None` leaves the engine's own default in place.
    pub fetch_timeout: Option<Duration>,
}

impl Default for EventPollerConfig {
    fn default() -> Self {
        Self {
            interval: MIN_POLL_INTERVAL,
            fetch_limit: 0,
            fetch_timeout: Some(MIN_POLL_INTERVAL),
        }
    }
}

struct PollerInner {
    client: EngineClient,
    sink: Arc<dyn EventSink>,
    store: Option<StateStore>,
    config: EventPollerConfig,
    cursor: AtomicU64,
    shutdown: AtomicBool,
    cancel: CancellationToken,
}

/// Drains the engine event log on a fixed schedule and keeps the resume
/// cursor.
pub struct EventPoller {
    inner: Arc<PollerInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventPoller {
    pub fn new(
        client: EngineClient,
        sink: Arc<dyn EventSink>,
        store: Option<StateStore>,
        config: EventPollerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                client,
                sink,
                store,
                config,
                cursor: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn cursor(&self) -> u64 {
        self.inner.cursor.load(Ordering::SeqCst)
    }

    /// Starts the recurring poll. The first cycle runs immediately.
    pub fn start(&self, from_cursor: u64) {
        let mut task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if task.is_some() || self.inner.shutdown.load(Ordering::SeqCst) {
            tracing::warn!("event poller already started or stopped");
            return;
        }
        self.inner.cursor.store(from_cursor, Ordering::SeqCst);
        tracing::info!(cursor = from_cursor, "event poller started");
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move { inner.run().await }));
    }

    /// Stops the schedule and waits for an in-flight cycle to finish.
    /// Calling it again is a no-op.
    pub async fn stop(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(%err, "event poller task failed");
            }
        }
        tracing::info!(cursor = self.cursor(), "event poller stopped");
    }

    /// One fetch-and-dispatch cycle starting at `cursor`. Returns the cursor
    /// for the next cycle.
    pub async fn poll_once(&self, cursor: u64) -> Result<u64, ApiError> {
        self.inner.poll_once(cursor).await
    }
}

impl PollerInner {
    async fn run(&self) {
        let interval = self.config.interval;
        loop {
            let cursor = self.cursor.load(Ordering::SeqCst);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                polled = self.poll_once(cursor) => match polled {
                    Ok(next) => self.cursor.store(next, Ordering::SeqCst),
                    Err(err) if err.is_retryable() => {
                        tracing::debug!(%err, cursor, "event poll failed, retrying next cycle");
                    }
                    Err(err) => tracing::warn!(
                        %err,
                        cursor,
                        class = ?err.classification(),
                        "event poll failed"
                    ),
                },
            }
            // A cycle that completed after stop() must not schedule another.
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn poll_once(&self, cursor: u64) -> Result<u64, ApiError> {
        let mut since = cursor;
        if since > 0 {
            let latest = self.client.events(0, 1, None).await?;
            if latest.max_id().is_some_and(|latest| latest < since) {
                tracing::info!(cursor = since, "engine event numbering restarted");
                since = 0;
            }
        }

        let mut batch = self.fetch(since).await?;
        if since > 0 && batch.events.first().is_some_and(|event| event.id < since) {
            tracing::info!(cursor = since, "engine returned events below the cursor, resetting");
            since = 0;
            batch = self.fetch(since).await?;
        }

        if batch.malformed > 0 {
            tracing::warn!(count = batch.malformed, "skipped malformed events");
        }
        for event in &batch.events {
            if let Err(err) = self.sink.on_event(event).await {
                tracing::warn!(
                    id = event.id,
                    event_type = %event.event_type,
                    %err,
                    "event handling failed"
                );
            }
        }

        let Some(last_id) = batch.max_id() else {
            return Ok(since);
        };
        self.sink.on_batch_done(last_id);
        if let Some(store) = &self.store {
            if let Err(err) = store.set_last_event_id(last_id).await {
                tracing::warn!(%err, last_id, "failed to persist event cursor");
            }
        }
        Ok(last_id)
    }

    async fn fetch(&self, since: u64) -> Result<EventBatch, ApiError> {
        self.client
            .events(since, self.config.fetch_limit, self.config.fetch_timeout)
            .await
    }
}

#[cfg(test)]
#[path = "poller_tests.rs"]
mod tests;
