// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wakeup queue abstraction.
//!
//! The engine publishes a [`NotifyEvent`] on a topic named after the
//! wait instance's publisher when its fan-in completes. The event is a
//! pure hint: it carries only the instance id, may be redelivered or
//! lost, and is idempotent to process redundantly. Lost events are
//! recovered by the sweeper, so queue implementations only need to be
//! best-effort-or-better.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::EngineError;

/// Wakeup message carrying only the wait instance id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyEvent {
    /// The wait instance whose fan-in may be complete.
    pub wait_instance_id: String,
}

/// A message handed to a consumer.
///
/// Call [`ack`](Self::ack) after the wakeup has been processed;
/// brokers with at-least-once semantics redeliver unacked messages.
pub struct QueueDelivery {
    /// The wakeup event.
    pub event: NotifyEvent,
    acker: Option<Box<dyn FnOnce() + Send>>,
}

impl QueueDelivery {
    /// Wrap an event with no acknowledgment action (ack is a no-op).
    pub fn new(event: NotifyEvent) -> Self {
        Self { event, acker: None }
    }

    /// Wrap an event with an acknowledgment action.
    pub fn with_acker(event: NotifyEvent, acker: impl FnOnce() + Send + 'static) -> Self {
        Self {
            event,
            acker: Some(Box::new(acker)),
        }
    }

    /// Acknowledge the delivery.
    pub fn ack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker();
        }
    }
}

impl fmt::Debug for QueueDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDelivery")
            .field("event", &self.event)
            .field("acker", &self.acker.as_ref().map(|_| "..."))
            .finish()
    }
}

/// Consumer side of a topic subscription.
#[async_trait]
pub trait QueueConsumer: Send {
    /// Receive the next delivery; `None` when the topic is closed.
    async fn next(&mut self) -> Option<QueueDelivery>;
}

/// Durable queue transport for wakeup events.
#[async_trait]
pub trait NotifyQueue: Send + Sync {
    /// Publish an event on the named topic.
    async fn publish(&self, topic: &str, event: NotifyEvent) -> Result<(), EngineError>;

    /// Subscribe to the named topic. Each topic supports one consumer.
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn QueueConsumer>, EngineError>;
}

struct TopicState {
    tx: mpsc::UnboundedSender<NotifyEvent>,
    rx: Option<mpsc::UnboundedReceiver<NotifyEvent>>,
}

fn new_topic() -> TopicState {
    let (tx, rx) = mpsc::unbounded_channel();
    TopicState { tx, rx: Some(rx) }
}

/// In-process queue backed by a tokio channel per topic.
///
/// Events published before the topic is subscribed are buffered.
/// Acknowledgment is a no-op, so delivery is effectively at-most-once
/// across process restarts; the sweeper covers the difference.
#[derive(Default)]
pub struct InProcessQueue {
    topics: Mutex<HashMap<String, TopicState>>,
}

impl InProcessQueue {
    /// Create a new empty queue.
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for InProcessQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topics = self.topics.lock().unwrap();
        f.debug_struct("InProcessQueue")
            .field("topics", &topics.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl NotifyQueue for InProcessQueue {
    async fn publish(&self, topic: &str, event: NotifyEvent) -> Result<(), EngineError> {
        let mut topics = self.topics.lock().unwrap();
        let state = topics
            .entry(topic.to_string())
            .or_insert_with(new_topic);
        state.tx.send(event).map_err(|_| EngineError::QueueError {
            topic: topic.to_string(),
            details: "topic closed".to_string(),
        })
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn QueueConsumer>, EngineError> {
        let mut topics = self.topics.lock().unwrap();
        let state = topics
            .entry(topic.to_string())
            .or_insert_with(new_topic);
        let rx = state.rx.take().ok_or_else(|| EngineError::QueueError {
            topic: topic.to_string(),
            details: "topic already has a consumer".to_string(),
        })?;
        Ok(Box::new(InProcessConsumer { rx }))
    }
}

struct InProcessConsumer {
    rx: mpsc::UnboundedReceiver<NotifyEvent>,
}

#[async_trait]
impl QueueConsumer for InProcessConsumer {
    async fn next(&mut self) -> Option<QueueDelivery> {
        self.rx.recv().await.map(QueueDelivery::new)
    }
}
