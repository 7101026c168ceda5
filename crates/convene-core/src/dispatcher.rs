// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exactly-once callback dispatch.
//!
//! The dispatcher turns "fan-in complete" into one callback execution:
//! it publishes wakeup hints on the instance's publisher topic, and on
//! consumption atomically leases the instance, gathers its responses,
//! invokes the terminal callback, and deletes the instance. Deletion is
//! the only exit from the leased state, so callback execution is
//! at-most-once per wait instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, instrument, warn};

use crate::callback::{CallbackRegistry, ResponseMap};
use crate::error::EngineError;
use crate::persistence::{Persistence, WaitInstanceRecord, deadline_after};
use crate::queue::{NotifyEvent, NotifyQueue};
use crate::response::ResponseStore;

/// Which terminal outcome a dispatch run delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Completed,
    TimedOut,
}

/// Wakeup publisher and queue-consumer processing for wait instances.
pub struct Dispatcher {
    persistence: Arc<dyn Persistence>,
    responses: Arc<ResponseStore>,
    callbacks: Arc<CallbackRegistry>,
    publishers: HashMap<String, Arc<dyn NotifyQueue>>,
    lease: Duration,
}

impl Dispatcher {
    /// Create a dispatcher with an explicit publisher-to-queue mapping.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        responses: Arc<ResponseStore>,
        callbacks: Arc<CallbackRegistry>,
        publishers: HashMap<String, Arc<dyn NotifyQueue>>,
        lease: Duration,
    ) -> Self {
        Self {
            persistence,
            responses,
            callbacks,
            publishers,
            lease,
        }
    }

    /// The configured processing-time budget.
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Publish a wakeup hint for the instance on its publisher topic.
    ///
    /// An unmapped publisher is a configuration error; the caller
    /// decides whether to surface or swallow it.
    pub async fn enqueue_wakeup(&self, instance: &WaitInstanceRecord) -> Result<(), EngineError> {
        let Some(queue) = self.publishers.get(&instance.publisher) else {
            return Err(EngineError::PublisherNotRegistered {
                publisher: instance.publisher.clone(),
            });
        };
        debug!(
            wait_instance_id = %instance.wait_instance_id,
            publisher = %instance.publisher,
            "Publishing wakeup"
        );
        queue
            .publish(
                &instance.publisher,
                NotifyEvent {
                    wait_instance_id: instance.wait_instance_id.clone(),
                },
            )
            .await
    }

    /// Publish a wakeup hint, logging and dropping any failure.
    ///
    /// The instance then relies on the sweeper/timeout guard, which
    /// re-drive wakeups for completed-but-undispatched instances.
    pub async fn try_enqueue_wakeup(&self, instance: &WaitInstanceRecord) {
        if let Err(e) = self.enqueue_wakeup(instance).await {
            warn!(
                wait_instance_id = %instance.wait_instance_id,
                publisher = %instance.publisher,
                error = %e,
                "Failed to publish wakeup; the sweeper will re-drive it"
            );
        }
    }

    /// Queue-consumer entry point: deliver the terminal callback for a
    /// completed wait instance.
    ///
    /// Safe to call redundantly: an absent instance means another
    /// consumer already handled it, and a held lease means one is
    /// handling it right now.
    #[instrument(skip(self), fields(wait_instance_id = %wait_instance_id))]
    pub async fn process(&self, wait_instance_id: &str) -> Result<(), EngineError> {
        self.process_terminal(wait_instance_id, Terminal::Completed)
            .await
    }

    /// Deliver the timeout callback for an instance whose deadline
    /// elapsed. Races the primary dispatch path on the lease; exactly
    /// one path wins.
    #[instrument(skip(self), fields(wait_instance_id = %wait_instance_id))]
    pub async fn process_timeout(&self, wait_instance_id: &str) -> Result<(), EngineError> {
        self.process_terminal(wait_instance_id, Terminal::TimedOut)
            .await
    }

    async fn process_terminal(
        &self,
        wait_instance_id: &str,
        kind: Terminal,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let now = Utc::now();
        let lease_until = deadline_after(now, self.lease);

        let Some(instance) = self
            .persistence
            .lease_wait_instance(wait_instance_id, now, lease_until)
            .await?
        else {
            debug!("Wait instance already handled or currently leased, skipping");
            return Ok(());
        };

        if kind == Terminal::Completed && !instance.fan_in_complete() {
            // The wakeup message is a hint; a stray one must not fire
            // the callback before fan-in actually completed.
            warn!(
                pending = instance.waiting_on_correlation_ids.len(),
                "Wakeup for an instance with pending correlations, releasing lease"
            );
            self.persistence.clear_lease(wait_instance_id).await?;
            return Ok(());
        }

        let (responses, any_error) = self.responses.fetch_all(&instance.correlation_ids).await?;
        self.invoke(&instance, kind, &responses, any_error);

        self.persistence.delete_wait_instance(wait_instance_id).await?;
        debug!("Wait instance completed and deleted");

        let elapsed = started.elapsed();
        if elapsed > self.lease {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                lease_ms = self.lease.as_millis() as u64,
                "Callback processing exceeded the lease budget; lease starvation or systemic overload"
            );
        }
        Ok(())
    }

    fn invoke(
        &self,
        instance: &WaitInstanceRecord,
        kind: Terminal,
        responses: &ResponseMap,
        any_error: bool,
    ) {
        let callback = match self.callbacks.decode_notify(&instance.callback) {
            Ok(callback) => callback,
            Err(e) => {
                error!(error = %e, "Failed to decode terminal callback");
                return;
            }
        };

        let result = match kind {
            Terminal::TimedOut => callback.notify_timeout(responses),
            Terminal::Completed if any_error => callback.notify_error(responses),
            Terminal::Completed => callback.notify(responses),
        };

        if let Err(e) = result {
            error!(error = %e, outcome = ?kind, "Terminal callback failed");
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("publishers", &self.publishers.keys().collect::<Vec<_>>())
            .field("lease", &self.lease)
            .finish()
    }
}
