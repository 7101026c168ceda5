// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Convene engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Callback processing lease duration (the processing-time budget)
    pub lease: Duration,
    /// How often the sweeper reconciles orphaned state
    pub sweep_interval: Duration,
    /// Minimum response age before the sweeper will touch it
    pub sweep_grace: Duration,
    /// Maximum responses inspected per sweep cycle
    pub sweep_batch_size: i64,
    /// How often the timeout guard polls for due deadlines
    pub timeout_poll_interval: Duration,
    /// How often the progress worker polls for pending updates
    pub progress_poll_interval: Duration,
    /// Default wait-instance TTL (the orphan backstop)
    pub default_ttl: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CONVENE_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `CONVENE_LEASE_SECS`: callback lease duration (default: 60)
    /// - `CONVENE_SWEEP_INTERVAL_SECS`: sweep interval (default: 30)
    /// - `CONVENE_SWEEP_GRACE_SECS`: response grace window (default: 15)
    /// - `CONVENE_SWEEP_BATCH_SIZE`: responses per sweep (default: 500)
    /// - `CONVENE_TIMEOUT_POLL_SECS`: timeout guard poll (default: 5)
    /// - `CONVENE_PROGRESS_POLL_MS`: progress worker poll (default: 500)
    /// - `CONVENE_DEFAULT_TTL_SECS`: wait-instance TTL (default: 30 days)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CONVENE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("CONVENE_DATABASE_URL"))?;

        let lease = secs_var("CONVENE_LEASE_SECS", 60)?;
        let sweep_interval = secs_var("CONVENE_SWEEP_INTERVAL_SECS", 30)?;
        let sweep_grace = secs_var("CONVENE_SWEEP_GRACE_SECS", 15)?;
        let timeout_poll_interval = secs_var("CONVENE_TIMEOUT_POLL_SECS", 5)?;
        let default_ttl = secs_var("CONVENE_DEFAULT_TTL_SECS", 30 * 24 * 3600)?;

        let sweep_batch_size: i64 = std::env::var("CONVENE_SWEEP_BATCH_SIZE")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CONVENE_SWEEP_BATCH_SIZE", "must be a positive integer")
            })?;
        if sweep_batch_size <= 0 {
            return Err(ConfigError::Invalid(
                "CONVENE_SWEEP_BATCH_SIZE",
                "must be a positive integer",
            ));
        }

        let progress_poll_ms: u64 = std::env::var("CONVENE_PROGRESS_POLL_MS")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CONVENE_PROGRESS_POLL_MS", "must be a positive integer")
            })?;

        Ok(Self {
            database_url,
            lease,
            sweep_interval,
            sweep_grace,
            sweep_batch_size,
            timeout_poll_interval,
            progress_poll_interval: Duration::from_millis(progress_poll_ms),
            default_ttl,
        })
    }
}

/// Parse a seconds-valued environment variable with a default.
fn secs_var(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let secs: u64 = std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(name, "must be a positive integer"))?;
    Ok(Duration::from_secs(secs))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
