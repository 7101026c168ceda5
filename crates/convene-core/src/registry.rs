// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wait registry: registration and the fan-in decrement protocol.
//!
//! Registration and fulfillment may race on the same token. The
//! double-check closes that race: registration absorbs responses that
//! landed first, and fulfillment decrements instances registered
//! first, so at least one path always observes a completed fan-in.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::callback::CallbackEnvelope;
use crate::dispatcher::Dispatcher;
use crate::error::EngineError;
use crate::persistence::{NewWaitInstance, Persistence, deadline_after};

/// Registers waiters and drives the atomic fan-in decrement.
pub struct WaitRegistry {
    persistence: Arc<dyn Persistence>,
    dispatcher: Arc<Dispatcher>,
    default_ttl: Duration,
}

impl WaitRegistry {
    /// Create a wait registry.
    ///
    /// `default_ttl` bounds the lifetime of instances that are never
    /// referenced again (the orphan backstop).
    pub fn new(
        persistence: Arc<dyn Persistence>,
        dispatcher: Arc<Dispatcher>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            persistence,
            dispatcher,
            default_ttl,
        }
    }

    /// Register a waiter for the given correlation ids.
    ///
    /// Returns the new wait instance id immediately; fan-in completion
    /// is always delivered asynchronously through the callback, never
    /// by blocking this call.
    #[instrument(skip(self, callback, progress_callback, correlation_ids), fields(publisher = %publisher))]
    pub async fn register(
        &self,
        publisher: &str,
        callback: CallbackEnvelope,
        progress_callback: Option<CallbackEnvelope>,
        correlation_ids: &[String],
        timeout: Option<Duration>,
    ) -> Result<String, EngineError> {
        if publisher.is_empty() {
            return Err(EngineError::ValidationError {
                field: "publisher".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        let mut seen = HashSet::new();
        let mut deduped = Vec::with_capacity(correlation_ids.len());
        for correlation_id in correlation_ids {
            if correlation_id.is_empty() {
                return Err(EngineError::ValidationError {
                    field: "correlation_ids".to_string(),
                    message: "must not contain empty ids".to_string(),
                });
            }
            if seen.insert(correlation_id.as_str()) {
                deduped.push(correlation_id.clone());
            }
        }
        if deduped.is_empty() {
            return Err(EngineError::ValidationError {
                field: "correlation_ids".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        let now = Utc::now();
        let wait_instance_id = Uuid::new_v4().to_string();
        let new = NewWaitInstance {
            wait_instance_id: wait_instance_id.clone(),
            publisher: publisher.to_string(),
            callback: callback.to_bytes()?,
            progress_callback: progress_callback
                .as_ref()
                .map(CallbackEnvelope::to_bytes)
                .transpose()?,
            correlation_ids: deduped,
            timeout_at: timeout.map(|t| deadline_after(now, t)),
            valid_until: deadline_after(now, self.default_ttl),
            created_at: now,
        };
        self.persistence.insert_wait_instance(&new).await?;
        debug!(
            wait_instance_id = %wait_instance_id,
            correlation_ids = new.correlation_ids.len(),
            timeout = ?timeout,
            "Wait instance registered"
        );

        // Close the registration race: a response may have landed for
        // one of the tokens before this registration was persisted.
        if let Some(instance) = self
            .persistence
            .absorb_existing_responses(&wait_instance_id)
            .await?
            && instance.fan_in_complete()
            && !instance.is_leased(now)
        {
            debug!(
                wait_instance_id = %wait_instance_id,
                "All correlations already fulfilled at registration"
            );
            self.dispatcher.try_enqueue_wakeup(&instance).await;
        }

        Ok(wait_instance_id)
    }

    /// Pull `correlation_id` out of the pending set of every instance
    /// still waiting on it, waking each instance whose fan-in is now
    /// complete.
    ///
    /// A bounded loop around one atomic conditional-update primitive:
    /// each iteration decrements a single instance, and the loop ends
    /// when the store reports no instance waiting on the token. A
    /// token nobody awaits is a silent no-op; publishers do not know
    /// who, if anyone, is listening.
    #[instrument(skip(self), fields(correlation_id = %correlation_id))]
    pub async fn decrement_all(&self, correlation_id: &str) -> Result<(), EngineError> {
        let mut decremented = 0u64;
        loop {
            let Some(instance) = self.persistence.decrement_one(correlation_id).await? else {
                if decremented == 0 {
                    debug!("No wait instance is waiting on this correlation id");
                }
                return Ok(());
            };
            decremented += 1;

            if instance.fan_in_complete() && !instance.is_leased(Utc::now()) {
                debug!(
                    wait_instance_id = %instance.wait_instance_id,
                    "Fan-in complete"
                );
                self.dispatcher.try_enqueue_wakeup(&instance).await;
            } else {
                debug!(
                    wait_instance_id = %instance.wait_instance_id,
                    remaining = instance.waiting_on_correlation_ids.len(),
                    "Decremented wait instance"
                );
            }
        }
    }
}
