// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Self-healing reconciliation sweep.
//!
//! The queue offers at-least-once delivery at best, and the primary
//! path (record response, decrement, publish wakeup) can be cut short
//! by a crash between any two steps. The sweeper is the bounded-latency
//! compensating transaction: it garbage-collects responses nobody
//! references, re-drives wakeups for completed instances whose hint was
//! lost, and forces decrements the primary path missed. It also purges
//! instances past their TTL backstop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::error::EngineError;
use crate::persistence::{Persistence, cutoff_before, deadline_after};
use crate::registry::WaitRegistry;

/// Lock row name shared by all sweeper replicas.
const SWEEP_LOCK: &str = "wait-notify-sweep";

/// Configuration for the reconciliation sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often to run a sweep cycle.
    pub interval: Duration,
    /// Minimum response age before the sweeper will touch it, so a
    /// registration that has not landed yet is not raced.
    pub grace: Duration,
    /// Maximum responses inspected per cycle.
    pub batch_size: i64,
    /// Cluster lock lifetime; a crashed holder frees the lock after this.
    pub lock_ttl: Duration,
    /// Orphaned responses deleted per batch statement.
    pub delete_chunk: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            grace: Duration::from_secs(15),
            batch_size: 500,
            lock_ttl: Duration::from_secs(60),
            delete_chunk: 100,
        }
    }
}

/// Background worker that reconciles orphaned responses and lost
/// wakeups.
pub struct Sweeper {
    persistence: Arc<dyn Persistence>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<WaitRegistry>,
    config: SweeperConfig,
    holder: String,
    shutdown: Arc<Notify>,
}

impl Sweeper {
    /// Create a new sweeper.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<WaitRegistry>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            persistence,
            dispatcher,
            registry,
            config,
            holder: Uuid::new_v4().to_string(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            grace_secs = self.config.grace.as_secs(),
            "Sweeper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Sweeper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Sweep cycle failed");
                    }
                }
            }
        }

        info!("Sweeper stopped");
    }

    /// Run one sweep cycle under the cluster lock.
    ///
    /// The lock only prevents duplicate work across replicas; a
    /// duplicate sweep would be safe, just wasteful.
    pub async fn sweep(&self) -> Result<(), EngineError> {
        let now = Utc::now();
        let lock_until = deadline_after(now, self.config.lock_ttl);
        if !self
            .persistence
            .try_acquire_lock(SWEEP_LOCK, &self.holder, now, lock_until)
            .await?
        {
            debug!("Another replica holds the sweep lock, skipping cycle");
            return Ok(());
        }

        let result = self.sweep_cycle(now).await;

        if let Err(e) = self.persistence.release_lock(SWEEP_LOCK, &self.holder).await {
            warn!(error = %e, "Failed to release sweep lock; it expires on its own");
        }
        result
    }

    async fn sweep_cycle(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let purged = self.persistence.purge_expired_wait_instances(now).await?;

        let cutoff = cutoff_before(now, self.config.grace);
        let stale = self
            .persistence
            .list_responses_older_than(cutoff, self.config.batch_size)
            .await?;

        let mut orphans: Vec<String> = Vec::new();
        let mut redriven = 0u64;
        let mut forced = 0u64;

        for response in stale {
            let references = self
                .persistence
                .instances_referencing(&response.correlation_id)
                .await?;

            if references.is_empty() {
                orphans.push(response.correlation_id);
                continue;
            }

            let mut force_decrement = false;
            for reference in references {
                if reference.pending {
                    // The primary decrement path missed this token,
                    // e.g. a crash between response insert and decrement.
                    force_decrement = true;
                } else if reference.instance.fan_in_complete()
                    && !reference.instance.is_leased(now)
                {
                    // Fan-in completed but the wakeup never arrived.
                    debug!(
                        wait_instance_id = %reference.instance.wait_instance_id,
                        correlation_id = %response.correlation_id,
                        "Re-driving lost wakeup"
                    );
                    self.dispatcher.try_enqueue_wakeup(&reference.instance).await;
                    redriven += 1;
                }
            }

            if force_decrement {
                self.registry.decrement_all(&response.correlation_id).await?;
                forced += 1;
            }
        }

        let mut deleted = 0u64;
        for chunk in orphans.chunks(self.config.delete_chunk) {
            deleted += self.persistence.delete_responses(chunk).await?;
        }

        if purged > 0 || deleted > 0 || redriven > 0 || forced > 0 {
            info!(
                purged,
                deleted, redriven, forced, "Sweep cycle completed"
            );
        } else {
            debug!("Sweep cycle completed, nothing to reconcile");
        }
        Ok(())
    }
}
