// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine facade exposed to calling business services.
//!
//! Thin composition over the coordination components: `wait_for_all`
//! registers a waiter, `fulfill` records a response and drives the
//! fan-in decrement, `progress` publishes a non-terminal update.

use std::sync::Arc;
use std::time::Duration;

use crate::callback::CallbackEnvelope;
use crate::error::EngineError;
use crate::progress::ProgressChannel;
use crate::registry::WaitRegistry;
use crate::response::ResponseStore;

/// Handle for registering waiters and fulfilling correlation ids.
///
/// Cheap to clone; all clones share the same underlying components.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<WaitRegistry>,
    responses: Arc<ResponseStore>,
    progress: Arc<ProgressChannel>,
}

impl Engine {
    pub(crate) fn new(
        registry: Arc<WaitRegistry>,
        responses: Arc<ResponseStore>,
        progress: Arc<ProgressChannel>,
    ) -> Self {
        Self {
            registry,
            responses,
            progress,
        }
    }

    /// Register a waiter for the given correlation ids.
    ///
    /// Exactly one of the callback's terminal methods (`notify`,
    /// `notify_error`, `notify_timeout`) will be invoked at most once,
    /// asynchronously, once all ids are fulfilled or the timeout
    /// elapses. Returns the wait instance id immediately.
    pub async fn wait_for_all(
        &self,
        publisher: &str,
        callback: CallbackEnvelope,
        progress_callback: Option<CallbackEnvelope>,
        correlation_ids: &[String],
        timeout: Option<Duration>,
    ) -> Result<String, EngineError> {
        self.registry
            .register(publisher, callback, progress_callback, correlation_ids, timeout)
            .await
    }

    /// Fulfill a correlation id with a response payload.
    ///
    /// Idempotent under retries (first writer wins). Storage failures
    /// are surfaced so the producer can retry with its own backoff.
    pub async fn fulfill(
        &self,
        correlation_id: &str,
        payload: &[u8],
        is_error: bool,
    ) -> Result<(), EngineError> {
        self.responses.record(correlation_id, payload, is_error).await?;
        self.registry.decrement_all(correlation_id).await
    }

    /// Publish a non-terminal progress update for a correlation id.
    pub async fn progress(&self, correlation_id: &str, payload: &[u8]) -> Result<(), EngineError> {
        self.progress.publish(correlation_id, payload).await
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}
