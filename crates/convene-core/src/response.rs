// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Response store: single-writer-per-token fulfillment records.
//!
//! The store's uniqueness constraint on the correlation id makes
//! response persistence first-writer-wins; a racing producer's
//! duplicate write is an expected outcome and is swallowed here, never
//! surfaced to the caller. Storage failures at the write boundary are
//! surfaced so the producer can retry with its own backoff.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};

use crate::callback::ResponseMap;
use crate::error::EngineError;
use crate::persistence::Persistence;

/// Records and fetches [`NotifyResponse`](crate::persistence::NotifyResponseRecord)
/// fulfillment events.
pub struct ResponseStore {
    persistence: Arc<dyn Persistence>,
}

impl ResponseStore {
    /// Create a response store over the given persistence backend.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Record a fulfillment for `correlation_id`.
    ///
    /// A duplicate write (the token was already fulfilled) is logged
    /// and ignored: the first recorded response wins.
    #[instrument(skip(self, payload), fields(correlation_id = %correlation_id))]
    pub async fn record(
        &self,
        correlation_id: &str,
        payload: &[u8],
        is_error: bool,
    ) -> Result<(), EngineError> {
        if correlation_id.is_empty() {
            return Err(EngineError::ValidationError {
                field: "correlation_id".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        match self
            .persistence
            .insert_response(correlation_id, payload, is_error, Utc::now())
            .await
        {
            Ok(()) => {
                debug!(is_error, "Response recorded");
                Ok(())
            }
            Err(EngineError::DuplicateResponse { .. }) => {
                debug!("Duplicate response ignored, first writer wins");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch the responses recorded for the given tokens.
    ///
    /// Returns the payload map plus an aggregate error flag that is
    /// true if any fetched response was marked as an error. Tokens
    /// without a response are absent from the map.
    pub async fn fetch_all(
        &self,
        correlation_ids: &[String],
    ) -> Result<(ResponseMap, bool), EngineError> {
        let records = self.persistence.fetch_responses(correlation_ids).await?;
        let any_error = records.iter().any(|r| r.is_error);
        let map = records
            .into_iter()
            .map(|r| (r.correlation_id, r.payload))
            .collect();
        Ok((map, any_error))
    }
}
