// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timeout guard: forced terminal delivery on missed deadlines.
//!
//! Deadlines live in the store, not in process timers, so they survive
//! restarts. The guard polls for due instances and finishes each one
//! through the dispatcher's lease; when it loses the lease race the
//! primary path already delivered the terminal callback. Together with
//! the dispatcher this guarantees every waiter that supplied a timeout
//! eventually receives exactly one terminal callback, even under total
//! producer failure.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::dispatcher::Dispatcher;
use crate::error::EngineError;
use crate::persistence::Persistence;

/// Configuration for the timeout guard.
#[derive(Debug, Clone)]
pub struct TimeoutGuardConfig {
    /// How often to poll for due deadlines.
    pub poll_interval: Duration,
    /// Maximum due instances processed per poll.
    pub batch_size: i64,
}

impl Default for TimeoutGuardConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
        }
    }
}

/// Background worker that fires `notify_timeout` for instances whose
/// deadline elapsed before fan-in completed.
pub struct TimeoutGuard {
    persistence: Arc<dyn Persistence>,
    dispatcher: Arc<Dispatcher>,
    config: TimeoutGuardConfig,
    shutdown: Arc<Notify>,
}

impl TimeoutGuard {
    /// Create a new timeout guard.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        dispatcher: Arc<Dispatcher>,
        config: TimeoutGuardConfig,
    ) -> Self {
        Self {
            persistence,
            dispatcher,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the timeout poll loop until shutdown is signalled.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Timeout guard started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Timeout guard received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.expire_due().await {
                        error!(error = %e, "Failed to process due timeouts");
                    }
                }
            }
        }

        info!("Timeout guard stopped");
    }

    /// Force terminal delivery for every instance whose deadline passed.
    pub async fn expire_due(&self) -> Result<(), EngineError> {
        let now = Utc::now();
        let due = self
            .persistence
            .list_timed_out_instances(now, self.config.batch_size)
            .await?;

        for instance in due {
            debug!(
                wait_instance_id = %instance.wait_instance_id,
                pending = instance.waiting_on_correlation_ids.len(),
                "Deadline elapsed, forcing terminal callback"
            );
            if let Err(e) = self
                .dispatcher
                .process_timeout(&instance.wait_instance_id)
                .await
            {
                error!(
                    wait_instance_id = %instance.wait_instance_id,
                    error = %e,
                    "Failed to time out wait instance"
                );
            }
        }
        Ok(())
    }
}
