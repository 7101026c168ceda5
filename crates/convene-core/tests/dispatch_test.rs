// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatcher tests: redelivery safety, lease contention, callback
//! failures, and stray wakeup hints. These drive the components
//! directly instead of going through the runtime's queue consumers.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use tempfile::TempDir;

use common::*;
use convene_core::callback::{CallbackEnvelope, CallbackRegistry};
use convene_core::dispatcher::Dispatcher;
use convene_core::persistence::Persistence;
use convene_core::queue::{InProcessQueue, NotifyQueue};
use convene_core::registry::WaitRegistry;
use convene_core::response::ResponseStore;

struct Components {
    persistence: Arc<dyn Persistence>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<WaitRegistry>,
    responses: Arc<ResponseStore>,
    sink: CallbackSink,
    _pool: SqlitePool,
    _tempdir: TempDir,
}

async fn components() -> Components {
    init_tracing();
    let (tempdir, pool, sqlite) = open_database().await;
    let persistence: Arc<dyn Persistence> = sqlite;

    let sink = CallbackSink::default();
    let callbacks: Arc<CallbackRegistry> = Arc::new(recorder_registry(&sink));
    let responses = Arc::new(ResponseStore::new(persistence.clone()));

    let mut publishers: HashMap<String, Arc<dyn NotifyQueue>> = HashMap::new();
    publishers.insert(PUBLISHER.to_string(), Arc::new(InProcessQueue::new()));

    let dispatcher = Arc::new(Dispatcher::new(
        persistence.clone(),
        responses.clone(),
        callbacks,
        publishers,
        Duration::from_secs(60),
    ));
    let registry = Arc::new(WaitRegistry::new(
        persistence.clone(),
        dispatcher.clone(),
        Duration::from_secs(3600),
    ));

    Components {
        persistence,
        dispatcher,
        registry,
        responses,
        sink,
        _pool: pool,
        _tempdir: tempdir,
    }
}

/// Register a waiter and fulfill every given token through the store.
async fn register_and_fulfill(
    c: &Components,
    callback: CallbackEnvelope,
    tokens: &[&str],
    fulfill: &[&str],
) -> String {
    let ids: Vec<String> = tokens.iter().map(|s| s.to_string()).collect();
    let wait_instance_id = c
        .registry
        .register(PUBLISHER, callback, None, &ids, None)
        .await
        .unwrap();
    for token in fulfill {
        c.responses.record(token, b"payload", false).await.unwrap();
        c.registry.decrement_all(token).await.unwrap();
    }
    wait_instance_id
}

#[tokio::test]
async fn test_concurrent_process_invokes_exactly_once() {
    let c = components().await;
    let id = register_and_fulfill(&c, recorder("w1"), &["a"], &["a"]).await;

    let (r1, r2) = futures::join!(c.dispatcher.process(&id), c.dispatcher.process(&id));
    r1.unwrap();
    r2.unwrap();

    assert_eq!(c.sink.terminals_for("w1").len(), 1);
    assert!(c.persistence.get_wait_instance(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_sequential_redelivery_is_noop() {
    let c = components().await;
    let id = register_and_fulfill(&c, recorder("w1"), &["a"], &["a"]).await;

    c.dispatcher.process(&id).await.unwrap();
    // A redelivered wakeup observes "already handled".
    c.dispatcher.process(&id).await.unwrap();

    assert_eq!(c.sink.terminals_for("w1").len(), 1);
}

#[tokio::test]
async fn test_process_absent_instance_is_noop() {
    let c = components().await;
    c.dispatcher.process("no-such-instance").await.unwrap();
    assert_eq!(c.sink.total_terminals(), 0);
}

#[tokio::test]
async fn test_callback_failure_still_deletes_instance() {
    let c = components().await;
    let id = register_and_fulfill(&c, failing("w1"), &["a"], &["a"]).await;

    c.dispatcher.process(&id).await.unwrap();

    // The callback ran (and failed); the delivery guarantee is the
    // attempt, so the instance is deleted and nothing retries.
    assert_eq!(c.sink.terminals_for("w1").len(), 1);
    assert!(c.persistence.get_wait_instance(&id).await.unwrap().is_none());

    c.dispatcher.process(&id).await.unwrap();
    assert_eq!(c.sink.terminals_for("w1").len(), 1);
}

#[tokio::test]
async fn test_unknown_callback_kind_still_deletes_instance() {
    let c = components().await;
    let envelope = CallbackEnvelope::new("mystery", json!({}));
    let id = register_and_fulfill(&c, envelope, &["a"], &["a"]).await;

    c.dispatcher.process(&id).await.unwrap();

    assert_eq!(c.sink.total_terminals(), 0);
    assert!(c.persistence.get_wait_instance(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_stray_wakeup_does_not_fire_early() {
    let c = components().await;
    let id = register_and_fulfill(&c, recorder("w1"), &["a", "b"], &["a"]).await;

    // A stray hint arrives while "b" is still pending.
    c.dispatcher.process(&id).await.unwrap();

    assert_eq!(c.sink.terminals_for("w1").len(), 0);
    let instance = c
        .persistence
        .get_wait_instance(&id)
        .await
        .unwrap()
        .expect("instance must survive a stray wakeup");
    assert_eq!(instance.waiting_on_correlation_ids, vec!["b"]);
    // The lease was released so a later wakeup can proceed.
    assert!(!instance.is_leased(Utc::now()));

    c.responses.record("b", b"payload", false).await.unwrap();
    c.registry.decrement_all("b").await.unwrap();
    c.dispatcher.process(&id).await.unwrap();

    let events = c.sink.terminals_for("w1");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].responses.len(), 2);
}

#[tokio::test]
async fn test_lease_contention_skips_processing() {
    let c = components().await;
    let id = register_and_fulfill(&c, recorder("w1"), &["a"], &["a"]).await;

    // Another replica currently holds the lease.
    let now = Utc::now();
    let leased = c
        .persistence
        .lease_wait_instance(&id, now, now + chrono::Duration::seconds(60))
        .await
        .unwrap();
    assert!(leased.is_some());

    c.dispatcher.process(&id).await.unwrap();

    assert_eq!(c.sink.terminals_for("w1").len(), 0);
    assert!(c.persistence.get_wait_instance(&id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_expired_lease_can_be_reacquired() {
    let c = components().await;
    let id = register_and_fulfill(&c, recorder("w1"), &["a"], &["a"]).await;

    // A stale lease from a crashed consumer.
    let past = Utc::now() - chrono::Duration::seconds(120);
    c.persistence
        .lease_wait_instance(&id, past, past + chrono::Duration::seconds(60))
        .await
        .unwrap()
        .expect("initial lease should succeed");

    c.dispatcher.process(&id).await.unwrap();

    assert_eq!(c.sink.terminals_for("w1").len(), 1);
    assert!(c.persistence.get_wait_instance(&id).await.unwrap().is_none());
}
