// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for convene-core integration tests.
//!
//! Provides TestContext for setting up a SQLite-backed engine runtime
//! with recorder callbacks, plus helpers for backdating rows and
//! waiting on asynchronous callback delivery.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tempfile::TempDir;
use tokio::time::Instant;

use convene_core::callback::{
    CallbackEnvelope, CallbackRegistry, NotifyCallback, ProgressCallback, ResponseMap,
};
use convene_core::engine::Engine;
use convene_core::error::EngineError;
use convene_core::migrations;
use convene_core::persistence::SqlitePersistence;
use convene_core::progress::ProgressWorkerConfig;
use convene_core::queue::{InProcessQueue, NotifyEvent, NotifyQueue, QueueConsumer};
use convene_core::runtime::{EngineRuntime, EngineRuntimeBuilder};
use convene_core::sweeper::SweeperConfig;
use convene_core::timeout::TimeoutGuardConfig;

/// Default publisher topic wired into every test runtime.
pub const PUBLISHER: &str = "orchestration";

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// Recorder Callbacks
// ============================================================================

/// Which terminal method fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOutcome {
    Notify,
    NotifyError,
    NotifyTimeout,
}

#[derive(Debug, Clone)]
pub struct RecordedTerminal {
    pub outcome: TerminalOutcome,
    pub responses: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct RecordedProgress {
    pub correlation_id: String,
    pub payload: Vec<u8>,
}

/// Shared sink collecting every callback invocation, keyed by the
/// label embedded in the callback envelope state.
#[derive(Clone, Default)]
pub struct CallbackSink {
    terminals: Arc<Mutex<HashMap<String, Vec<RecordedTerminal>>>>,
    progress: Arc<Mutex<HashMap<String, Vec<RecordedProgress>>>>,
}

impl CallbackSink {
    pub fn terminals_for(&self, label: &str) -> Vec<RecordedTerminal> {
        self.terminals
            .lock()
            .unwrap()
            .get(label)
            .cloned()
            .unwrap_or_default()
    }

    pub fn progress_for(&self, label: &str) -> Vec<RecordedProgress> {
        self.progress
            .lock()
            .unwrap()
            .get(label)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_terminals(&self) -> usize {
        self.terminals.lock().unwrap().values().map(Vec::len).sum()
    }

    fn push_terminal(&self, label: &str, event: RecordedTerminal) {
        self.terminals
            .lock()
            .unwrap()
            .entry(label.to_string())
            .or_default()
            .push(event);
    }

    fn push_progress(&self, label: &str, event: RecordedProgress) {
        self.progress
            .lock()
            .unwrap()
            .entry(label.to_string())
            .or_default()
            .push(event);
    }
}

struct RecordingCallback {
    label: String,
    sink: CallbackSink,
    fail: bool,
}

impl RecordingCallback {
    fn record(&self, outcome: TerminalOutcome, responses: &ResponseMap) -> anyhow::Result<()> {
        self.sink.push_terminal(
            &self.label,
            RecordedTerminal {
                outcome,
                responses: responses.clone(),
            },
        );
        if self.fail {
            anyhow::bail!("callback '{}' failed on purpose", self.label);
        }
        Ok(())
    }
}

impl NotifyCallback for RecordingCallback {
    fn notify(&self, responses: &ResponseMap) -> anyhow::Result<()> {
        self.record(TerminalOutcome::Notify, responses)
    }

    fn notify_error(&self, responses: &ResponseMap) -> anyhow::Result<()> {
        self.record(TerminalOutcome::NotifyError, responses)
    }

    fn notify_timeout(&self, responses: &ResponseMap) -> anyhow::Result<()> {
        self.record(TerminalOutcome::NotifyTimeout, responses)
    }
}

struct RecordingProgressCallback {
    label: String,
    sink: CallbackSink,
}

impl ProgressCallback for RecordingProgressCallback {
    fn on_progress(&self, correlation_id: &str, payload: &[u8]) -> anyhow::Result<()> {
        self.sink.push_progress(
            &self.label,
            RecordedProgress {
                correlation_id: correlation_id.to_string(),
                payload: payload.to_vec(),
            },
        );
        Ok(())
    }
}

fn label_from(state: &Value) -> String {
    state
        .get("label")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Build a registry with "recorder" and "failing" factories feeding
/// the given sink.
pub fn recorder_registry(sink: &CallbackSink) -> CallbackRegistry {
    let mut registry = CallbackRegistry::new();

    let terminal_sink = sink.clone();
    registry.register_notify("recorder", move |state| {
        Ok(Box::new(RecordingCallback {
            label: label_from(state),
            sink: terminal_sink.clone(),
            fail: false,
        }))
    });

    let failing_sink = sink.clone();
    registry.register_notify("failing", move |state| {
        Ok(Box::new(RecordingCallback {
            label: label_from(state),
            sink: failing_sink.clone(),
            fail: true,
        }))
    });

    let progress_sink = sink.clone();
    registry.register_progress("recorder", move |state| {
        Ok(Box::new(RecordingProgressCallback {
            label: label_from(state),
            sink: progress_sink.clone(),
        }))
    });

    registry
}

/// Envelope for a recorder callback with the given label.
pub fn recorder(label: &str) -> CallbackEnvelope {
    CallbackEnvelope::new("recorder", json!({"label": label}))
}

/// Envelope for a callback that records the invocation and then fails.
pub fn failing(label: &str) -> CallbackEnvelope {
    CallbackEnvelope::new("failing", json!({"label": label}))
}

// ============================================================================
// Dropping Queue
// ============================================================================

/// Queue wrapper that silently discards publishes while enabled,
/// simulating a lost wakeup message.
pub struct DroppingQueue {
    inner: InProcessQueue,
    dropping: AtomicBool,
}

impl DroppingQueue {
    pub fn new() -> Self {
        Self {
            inner: InProcessQueue::new(),
            dropping: AtomicBool::new(false),
        }
    }

    pub fn set_dropping(&self, dropping: bool) {
        self.dropping.store(dropping, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl NotifyQueue for DroppingQueue {
    async fn publish(&self, topic: &str, event: NotifyEvent) -> Result<(), EngineError> {
        if self.dropping.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.publish(topic, event).await
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn QueueConsumer>, EngineError> {
        self.inner.subscribe(topic).await
    }
}

// ============================================================================
// Test Context
// ============================================================================

/// Open a fresh migrated SQLite database under a temp directory.
pub async fn open_database() -> (TempDir, SqlitePool, Arc<SqlitePersistence>) {
    let tempdir = TempDir::new().expect("Failed to create temp dir");
    let db_path = tempdir.path().join("convene.db");

    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .expect("Failed to connect to SQLite");

    migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");

    let persistence = Arc::new(SqlitePersistence::new(pool.clone()));
    (tempdir, pool, persistence)
}

/// Test context managing database, runtime, queue, and callback sink.
pub struct TestContext {
    pub pool: SqlitePool,
    pub persistence: Arc<SqlitePersistence>,
    pub runtime: EngineRuntime,
    pub engine: Engine,
    pub sink: CallbackSink,
    pub queue: Arc<InProcessQueue>,
    _tempdir: TempDir,
}

impl TestContext {
    /// Create a context with test-tuned defaults: fast timeout and
    /// progress polling, sweeper effectively disabled.
    pub async fn new() -> Self {
        Self::start(|builder| builder).await
    }

    /// Create a context, letting the test customize the runtime builder.
    pub async fn start(
        customize: impl FnOnce(EngineRuntimeBuilder) -> EngineRuntimeBuilder,
    ) -> Self {
        init_tracing();

        let (tempdir, pool, persistence) = open_database().await;

        let sink = CallbackSink::default();
        let registry = recorder_registry(&sink);
        let queue = Arc::new(InProcessQueue::new());

        let builder = EngineRuntime::builder()
            .persistence(persistence.clone())
            .callbacks(registry)
            .publisher(PUBLISHER, queue.clone())
            .sweeper_config(SweeperConfig {
                interval: Duration::from_secs(3600),
                ..Default::default()
            })
            .timeout_config(TimeoutGuardConfig {
                poll_interval: Duration::from_millis(100),
                ..Default::default()
            })
            .progress_config(ProgressWorkerConfig {
                poll_interval: Duration::from_millis(50),
                ..Default::default()
            });

        let runtime = customize(builder)
            .build()
            .expect("Failed to build runtime")
            .start()
            .await
            .expect("Failed to start runtime");
        let engine = runtime.engine().clone();

        Self {
            pool,
            persistence,
            runtime,
            engine,
            sink,
            queue,
            _tempdir: tempdir,
        }
    }

    /// Wait until `count` terminal callbacks have fired for `label`.
    pub async fn wait_for_terminals(
        &self,
        label: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<RecordedTerminal> {
        let deadline = Instant::now() + timeout;
        loop {
            let events = self.sink.terminals_for(label);
            if events.len() >= count {
                return events;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {} terminal callback(s) for '{}', got {}",
                count,
                label,
                events.len()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until `count` progress callbacks have fired for `label`.
    pub async fn wait_for_progress(
        &self,
        label: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<RecordedProgress> {
        let deadline = Instant::now() + timeout;
        loop {
            let events = self.sink.progress_for(label);
            if events.len() >= count {
                return events;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {} progress callback(s) for '{}', got {}",
                count,
                label,
                events.len()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Assert no terminal callback fires for `label` within `window`.
    pub async fn assert_no_terminal(&self, label: &str, window: Duration) {
        tokio::time::sleep(window).await;
        let events = self.sink.terminals_for(label);
        assert!(
            events.is_empty(),
            "expected no terminal callback for '{}', got {:?}",
            label,
            events
        );
    }

    /// Rewrite a response's creation time, e.g. to age it past the
    /// sweeper's grace window.
    pub async fn backdate_response(&self, correlation_id: &str, age: Duration) {
        let created_at: DateTime<Utc> = Utc::now() - chrono::Duration::from_std(age).unwrap();
        sqlx::query("UPDATE notify_responses SET created_at = ? WHERE correlation_id = ?")
            .bind(created_at)
            .bind(correlation_id)
            .execute(&self.pool)
            .await
            .expect("Failed to backdate response");
    }

    /// Rewrite a wait instance's TTL backstop.
    pub async fn backdate_valid_until(&self, wait_instance_id: &str, age: Duration) {
        let valid_until: DateTime<Utc> = Utc::now() - chrono::Duration::from_std(age).unwrap();
        sqlx::query("UPDATE wait_instances SET valid_until = ? WHERE wait_instance_id = ?")
            .bind(valid_until)
            .bind(wait_instance_id)
            .execute(&self.pool)
            .await
            .expect("Failed to backdate wait instance");
    }

    /// Insert a response row directly, bypassing the engine (simulates
    /// a producer that crashed between insert and decrement).
    pub async fn insert_raw_response(&self, correlation_id: &str, payload: &[u8], age: Duration) {
        let created_at: DateTime<Utc> = Utc::now() - chrono::Duration::from_std(age).unwrap();
        sqlx::query(
            "INSERT INTO notify_responses (correlation_id, payload, is_error, created_at) \
             VALUES (?, ?, FALSE, ?)",
        )
        .bind(correlation_id)
        .bind(payload)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .expect("Failed to insert raw response");
    }

    /// Wait until the wait_instances table reaches the expected size
    /// (deletion happens just after the terminal callback fires).
    pub async fn wait_for_instance_count(&self, expected: i64, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let count = self.wait_instance_count().await;
            if count == expected {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {} wait instance(s), got {}",
                expected,
                count
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn response_count(&self) -> i64 {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM notify_responses")
            .fetch_one(&self.pool)
            .await
            .unwrap();
        row.0
    }

    pub async fn wait_instance_count(&self) -> i64 {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM wait_instances")
            .fetch_one(&self.pool)
            .await
            .unwrap();
        row.0
    }

    pub async fn progress_count(&self) -> i64 {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM progress_updates")
            .fetch_one(&self.pool)
            .await
            .unwrap();
        row.0
    }
}
