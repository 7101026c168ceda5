// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for convene-core.
//!
//! This module provides [`EngineRuntime`] which wires the coordination
//! components together inside an existing tokio application: one
//! wakeup consumer per configured publisher, plus the sweeper, timeout
//! guard, and progress worker as background tasks.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use convene_core::callback::CallbackRegistry;
//! use convene_core::persistence::SqlitePersistence;
//! use convene_core::queue::InProcessQueue;
//! use convene_core::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path(".data/convene.db").await?);
//!     let mut callbacks = CallbackRegistry::new();
//!     callbacks.register_notify("deploy-join", |state| { /* ... */ todo!() });
//!
//!     let runtime = EngineRuntime::builder()
//!         .persistence(persistence)
//!         .callbacks(callbacks)
//!         .publisher("orchestration", Arc::new(InProcessQueue::new()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let engine = runtime.engine().clone();
//!     // ... register waiters, fulfill correlation ids ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::callback::CallbackRegistry;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::engine::Engine;
use crate::persistence::Persistence;
use crate::progress::{ProgressChannel, ProgressWorker, ProgressWorkerConfig};
use crate::queue::{NotifyQueue, QueueConsumer};
use crate::registry::WaitRegistry;
use crate::response::ResponseStore;
use crate::sweeper::{Sweeper, SweeperConfig};
use crate::timeout::{TimeoutGuard, TimeoutGuardConfig};

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    callbacks: Option<CallbackRegistry>,
    publishers: HashMap<String, Arc<dyn NotifyQueue>>,
    lease: Duration,
    default_ttl: Duration,
    sweeper: SweeperConfig,
    timeout_guard: TimeoutGuardConfig,
    progress_worker: ProgressWorkerConfig,
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("callbacks", &self.callbacks)
            .field("publishers", &self.publishers.keys().collect::<Vec<_>>())
            .field("lease", &self.lease)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            callbacks: None,
            publishers: HashMap::new(),
            lease: Duration::from_secs(60),
            default_ttl: Duration::from_secs(30 * 24 * 3600),
            sweeper: SweeperConfig::default(),
            timeout_guard: TimeoutGuardConfig::default(),
            progress_worker: ProgressWorkerConfig::default(),
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the callback registry (required).
    pub fn callbacks(mut self, callbacks: CallbackRegistry) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Map a publisher name to the queue carrying its wakeup events.
    ///
    /// A wakeup consumer is started for every mapped publisher.
    pub fn publisher(mut self, name: impl Into<String>, queue: Arc<dyn NotifyQueue>) -> Self {
        self.publishers.insert(name.into(), queue);
        self
    }

    /// Set the callback processing lease duration.
    ///
    /// Default: 60 seconds.
    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Set the default wait-instance TTL (the orphan backstop).
    ///
    /// Default: 30 days.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Override the sweeper configuration.
    pub fn sweeper_config(mut self, config: SweeperConfig) -> Self {
        self.sweeper = config;
        self
    }

    /// Override the timeout guard configuration.
    pub fn timeout_config(mut self, config: TimeoutGuardConfig) -> Self {
        self.timeout_guard = config;
        self
    }

    /// Override the progress worker configuration.
    pub fn progress_config(mut self, config: ProgressWorkerConfig) -> Self {
        self.progress_worker = config;
        self
    }

    /// Apply tuning values loaded from the environment.
    pub fn configure(mut self, config: &Config) -> Self {
        self.lease = config.lease;
        self.default_ttl = config.default_ttl;
        self.sweeper.interval = config.sweep_interval;
        self.sweeper.grace = config.sweep_grace;
        self.sweeper.batch_size = config.sweep_batch_size;
        self.timeout_guard.poll_interval = config.timeout_poll_interval;
        self.progress_worker.poll_interval = config.progress_poll_interval;
        self.progress_worker.lease = config.lease;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let callbacks = self
            .callbacks
            .ok_or_else(|| anyhow::anyhow!("callbacks are required"))?;

        Ok(EngineRuntimeConfig {
            persistence,
            callbacks,
            publishers: self.publishers,
            lease: self.lease,
            default_ttl: self.default_ttl,
            sweeper: self.sweeper,
            timeout_guard: self.timeout_guard,
            progress_worker: self.progress_worker,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    callbacks: CallbackRegistry,
    publishers: HashMap<String, Arc<dyn NotifyQueue>>,
    lease: Duration,
    default_ttl: Duration,
    sweeper: SweeperConfig,
    timeout_guard: TimeoutGuardConfig,
    progress_worker: ProgressWorkerConfig,
}

impl std::fmt::Debug for EngineRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeConfig")
            .field("persistence", &"...")
            .field("publishers", &self.publishers.keys().collect::<Vec<_>>())
            .field("lease", &self.lease)
            .finish()
    }
}

impl EngineRuntimeConfig {
    /// Start the runtime, spawning consumers and background workers.
    pub async fn start(self) -> Result<EngineRuntime> {
        let callbacks = Arc::new(self.callbacks);
        let responses = Arc::new(ResponseStore::new(self.persistence.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            self.persistence.clone(),
            responses.clone(),
            callbacks.clone(),
            self.publishers.clone(),
            self.lease,
        ));
        let registry = Arc::new(WaitRegistry::new(
            self.persistence.clone(),
            dispatcher.clone(),
            self.default_ttl,
        ));
        let progress = Arc::new(ProgressChannel::new(self.persistence.clone()));
        let engine = Engine::new(registry.clone(), responses, progress);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        for (publisher, queue) in &self.publishers {
            let consumer = queue.subscribe(publisher).await?;
            handles.push(tokio::spawn(run_consumer(
                publisher.clone(),
                consumer,
                dispatcher.clone(),
                shutdown_rx.clone(),
            )));
        }

        let mut worker_shutdowns = Vec::new();

        let sweeper = Sweeper::new(
            self.persistence.clone(),
            dispatcher.clone(),
            registry.clone(),
            self.sweeper,
        );
        worker_shutdowns.push(sweeper.shutdown_handle());
        handles.push(tokio::spawn(sweeper.run()));

        let timeout_guard = TimeoutGuard::new(
            self.persistence.clone(),
            dispatcher.clone(),
            self.timeout_guard,
        );
        worker_shutdowns.push(timeout_guard.shutdown_handle());
        handles.push(tokio::spawn(timeout_guard.run()));

        let progress_worker = ProgressWorker::new(
            self.persistence.clone(),
            callbacks.clone(),
            self.progress_worker,
        );
        worker_shutdowns.push(progress_worker.shutdown_handle());
        handles.push(tokio::spawn(progress_worker.run()));

        info!(
            publishers = self.publishers.len(),
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            engine,
            persistence: self.persistence,
            shutdown_tx,
            worker_shutdowns,
            handles,
        })
    }
}

/// A running convene engine that can be embedded in an application.
///
/// The runtime manages one wakeup consumer per publisher plus the
/// sweeper, timeout guard, and progress worker. Call
/// [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    engine: Engine,
    persistence: Arc<dyn Persistence>,
    shutdown_tx: watch::Sender<bool>,
    worker_shutdowns: Vec<Arc<Notify>>,
    handles: Vec<JoinHandle<()>>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Get the engine facade for registering waiters and fulfilling
    /// correlation ids.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get a reference to the persistence layer.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Check if the runtime's tasks are still running.
    pub fn is_running(&self) -> bool {
        self.handles.iter().any(|handle| !handle.is_finished())
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals every consumer and worker to stop and waits for their
    /// tasks to complete.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        let _ = self.shutdown_tx.send(true);
        for handle in &self.worker_shutdowns {
            handle.notify_one();
        }

        let mut panicked = false;
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Runtime task panicked during shutdown: {}", e);
                panicked = true;
            }
        }

        if panicked {
            anyhow::bail!("one or more runtime tasks panicked");
        }
        info!("EngineRuntime shutdown complete");
        Ok(())
    }
}

/// Consume wakeup events for one publisher until shutdown.
async fn run_consumer(
    publisher: String,
    mut consumer: Box<dyn QueueConsumer>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(publisher = %publisher, "Wakeup consumer started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            delivery = consumer.next() => {
                match delivery {
                    Some(delivery) => {
                        let wait_instance_id = delivery.event.wait_instance_id.clone();
                        if let Err(e) = dispatcher.process(&wait_instance_id).await {
                            error!(
                                wait_instance_id = %wait_instance_id,
                                error = %e,
                                "Failed to process wakeup"
                            );
                        }
                        // Ack even on failure; redelivery is the sweeper's job.
                        delivery.ack();
                    }
                    None => {
                        info!(publisher = %publisher, "Wakeup topic closed");
                        break;
                    }
                }
            }
        }
    }

    info!(publisher = %publisher, "Wakeup consumer stopped");
}
