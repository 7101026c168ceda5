// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Progress channel: weaker-guarantee non-terminal notifications.
//!
//! Progress updates never participate in the terminal fan-in and never
//! mutate the pending set. Delivery is best-effort with one ordering
//! guarantee: updates for a given correlation id reach the progress
//! callback in creation order, one at a time, enforced by the leased
//! single-worker pop plus an in-memory busy-token set. Updates for
//! distinct tokens proceed concurrently.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument};

use crate::callback::CallbackRegistry;
use crate::error::EngineError;
use crate::persistence::{Persistence, ProgressUpdateRecord, deadline_after};

/// Publisher side of the progress channel.
pub struct ProgressChannel {
    persistence: Arc<dyn Persistence>,
}

impl ProgressChannel {
    /// Create a progress channel over the given persistence backend.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Publish a non-terminal progress update for a correlation id.
    ///
    /// Best-effort, no uniqueness: multiple updates per token are
    /// expected and delivered in order.
    #[instrument(skip(self, payload), fields(correlation_id = %correlation_id))]
    pub async fn publish(&self, correlation_id: &str, payload: &[u8]) -> Result<(), EngineError> {
        if correlation_id.is_empty() {
            return Err(EngineError::ValidationError {
                field: "correlation_id".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        self.persistence
            .insert_progress(correlation_id, payload, Utc::now())
            .await?;
        debug!("Progress update published");
        Ok(())
    }
}

/// Configuration for the progress polling worker.
#[derive(Debug, Clone)]
pub struct ProgressWorkerConfig {
    /// How often to poll for pending updates.
    pub poll_interval: Duration,
    /// Processing lease per update.
    pub lease: Duration,
}

impl Default for ProgressWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(60),
        }
    }
}

/// Background worker that delivers progress updates to registered
/// progress callbacks.
pub struct ProgressWorker {
    persistence: Arc<dyn Persistence>,
    callbacks: Arc<CallbackRegistry>,
    config: ProgressWorkerConfig,
    shutdown: Arc<Notify>,
    busy: Arc<Mutex<HashSet<String>>>,
}

impl ProgressWorker {
    /// Create a new progress worker.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        callbacks: Arc<CallbackRegistry>,
        config: ProgressWorkerConfig,
    ) -> Self {
        Self {
            persistence,
            callbacks,
            config,
            shutdown: Arc::new(Notify::new()),
            busy: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the progress worker loop until shutdown is signalled.
    pub async fn run(self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Progress worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Progress worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.drain_available().await {
                        error!(error = %e, "Failed to process progress updates");
                    }
                }
            }
        }

        info!("Progress worker stopped");
    }

    /// Lease every available update whose token is not busy and spawn
    /// a delivery task per update.
    async fn drain_available(&self) -> Result<(), EngineError> {
        loop {
            let busy_tokens: Vec<String> = self.busy.lock().unwrap().iter().cloned().collect();
            let now = Utc::now();
            let lease_until = deadline_after(now, self.config.lease);

            let Some(update) = self
                .persistence
                .lease_next_progress(&busy_tokens, now, lease_until)
                .await?
            else {
                return Ok(());
            };

            self.busy
                .lock()
                .unwrap()
                .insert(update.correlation_id.clone());

            let persistence = self.persistence.clone();
            let callbacks = self.callbacks.clone();
            let busy = self.busy.clone();
            tokio::spawn(async move {
                let correlation_id = update.correlation_id.clone();
                if let Err(e) = deliver_update(persistence, callbacks, update).await {
                    error!(
                        correlation_id = %correlation_id,
                        error = %e,
                        "Failed to deliver progress update"
                    );
                }
                busy.lock().unwrap().remove(&correlation_id);
            });
        }
    }
}

/// Deliver one leased update to every instance referencing its token,
/// then delete it.
async fn deliver_update(
    persistence: Arc<dyn Persistence>,
    callbacks: Arc<CallbackRegistry>,
    update: ProgressUpdateRecord,
) -> Result<(), EngineError> {
    let targets = persistence.progress_targets(&update.correlation_id).await?;
    debug!(
        correlation_id = %update.correlation_id,
        targets = targets.len(),
        "Delivering progress update"
    );

    for instance in &targets {
        let Some(bytes) = instance.progress_callback.as_ref() else {
            continue;
        };
        match callbacks.decode_progress(bytes) {
            Ok(callback) => {
                if let Err(e) = callback.on_progress(&update.correlation_id, &update.payload) {
                    error!(
                        wait_instance_id = %instance.wait_instance_id,
                        correlation_id = %update.correlation_id,
                        error = %e,
                        "Progress callback failed"
                    );
                }
            }
            Err(e) => {
                error!(
                    wait_instance_id = %instance.wait_instance_id,
                    error = %e,
                    "Failed to decode progress callback"
                );
            }
        }
    }

    persistence.delete_progress(update.id).await
}
