// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Convene Core - Durable Wait/Notify Coordination Engine
//!
//! This crate lets any number of independent producers asynchronously
//! fulfill named correlation tokens while waiters register interest in
//! one or more tokens and receive a single callback invocation once all
//! of their tokens are fulfilled (or a timeout elapses), even if the
//! waiting process, the producing process, or the callback-dispatch
//! process crashes and restarts in between. It is the backbone for
//! joining results of distributed task execution back into a single
//! continuation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Business Services                           │
//! │        (task scheduling, deployment orchestration, ...)         │
//! └─────────────────────────────────────────────────────────────────┘
//!        │ wait_for_all              │ fulfill           │ progress
//!        ▼                           ▼                   ▼
//! ┌──────────────┐       ┌───────────────┐       ┌────────────────┐
//! │ WaitRegistry │◄──────│ ResponseStore │       │ ProgressChannel│
//! │ register +   │ decr. │ record +      │       │ publish +      │
//! │ fan-in decr. │       │ fetch_all     │       │ poll worker    │
//! └──────┬───────┘       └───────────────┘       └────────────────┘
//!        │ fan-in complete
//!        ▼
//! ┌──────────────┐  NotifyEvent   ┌─────────────────────────────────┐
//! │  Dispatcher  │───────────────►│  Queue (topic per publisher)    │
//! │ lease+invoke │◄───────────────│  at-least-once, manual ack      │
//! └──────┬───────┘   consume      └─────────────────────────────────┘
//!        │
//!        ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │           Store (PostgreSQL or SQLite via Persistence)          │
//! │   wait_instances / wait_correlations / notify_responses / ...   │
//! └─────────────────────────────────────────────────────────────────┘
//!        ▲                           ▲
//!        │ reconcile                 │ due deadlines
//! ┌──────┴───────┐            ┌──────┴───────┐
//! │   Sweeper    │            │ TimeoutGuard │
//! └──────────────┘            └──────────────┘
//! ```
//!
//! # Coordination Protocol
//!
//! | Step | Operation |
//! |------|-----------|
//! | Register | Persist the instance, then absorb responses that landed first |
//! | Fulfill | Record the response (first writer wins), then decrement every waiting instance |
//! | Wakeup | Fan-in complete and unleased ⇒ publish a `NotifyEvent` hint |
//! | Dispatch | Lease the instance, gather responses, invoke the callback, delete |
//! | Sweep | Delete orphaned responses, re-drive lost wakeups, force missed decrements |
//! | Timeout | Lease due instances and deliver `notify_timeout` with the partial map |
//!
//! Callback execution is at-most-once per wait instance (deletion is
//! the only exit from the leased state); response persistence is
//! at-least-once from the producer's point of view with first-writer-
//! wins semantics at the store.
//!
//! # Crash Safety
//!
//! No in-memory state is relied upon across restarts, and multiple
//! replicas of every component may run concurrently. All cross-replica
//! coordination is expressed as atomic conditional updates against the
//! shared store; the only cluster lock is the sweeper's, and it exists
//! to avoid duplicate work, not for correctness. A crash between any
//! two steps of the primary path is repaired by the sweeper within one
//! sweep interval, and `valid_until` bounds the lifetime of instances
//! nothing ever references again.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CONVENE_DATABASE_URL` | Yes | - | PostgreSQL or SQLite connection string |
//! | `CONVENE_LEASE_SECS` | No | `60` | Callback processing lease |
//! | `CONVENE_SWEEP_INTERVAL_SECS` | No | `30` | Sweep cycle interval |
//! | `CONVENE_SWEEP_GRACE_SECS` | No | `15` | Response grace window |
//! | `CONVENE_SWEEP_BATCH_SIZE` | No | `500` | Responses per sweep cycle |
//! | `CONVENE_TIMEOUT_POLL_SECS` | No | `5` | Timeout guard poll interval |
//! | `CONVENE_PROGRESS_POLL_MS` | No | `500` | Progress worker poll interval |
//! | `CONVENE_DEFAULT_TTL_SECS` | No | 30 days | Wait-instance TTL backstop |
//!
//! # Modules
//!
//! - [`config`]: Engine configuration from environment variables
//! - [`error`]: Error types with stable error codes
//! - [`callback`]: Callback traits, envelopes, and the factory registry
//! - [`queue`]: Wakeup queue abstraction and in-process implementation
//! - [`persistence`]: Persistence trait with PostgreSQL and SQLite backends
//! - [`migrations`]: Embedded database migrations
//! - [`registry`]: Waiter registration and the fan-in decrement protocol
//! - [`response`]: Fulfillment recording and response gathering
//! - [`dispatcher`]: Exactly-once callback dispatch via leasing
//! - [`progress`]: Non-terminal progress channel and its poll worker
//! - [`sweeper`]: Self-healing reconciliation sweep
//! - [`timeout`]: Forced terminal delivery on missed deadlines
//! - [`engine`]: Facade exposed to business services
//! - [`runtime`]: Embeddable runtime wiring everything together

#![deny(missing_docs)]

/// Callback traits, envelopes, and the factory registry.
pub mod callback;

/// Engine configuration loaded from environment variables.
pub mod config;

/// Exactly-once callback dispatch via wait-instance leasing.
pub mod dispatcher;

/// Facade exposed to calling business services.
pub mod engine;

/// Error types for engine operations with stable error codes.
pub mod error;

/// Embedded database migrations for both backends.
pub mod migrations;

/// Persistence trait and the PostgreSQL/SQLite backends.
pub mod persistence;

/// Non-terminal progress channel and its polling worker.
pub mod progress;

/// Wakeup queue abstraction and the in-process implementation.
pub mod queue;

/// Waiter registration and the fan-in decrement protocol.
pub mod registry;

/// Fulfillment recording and response gathering.
pub mod response;

/// Embeddable runtime wiring consumers and background workers.
pub mod runtime;

/// Self-healing reconciliation sweep.
pub mod sweeper;

/// Forced terminal delivery on missed deadlines.
pub mod timeout;
