use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::broadcast::BroadcastService;
use crate::config::NodeConfig;
use crate::coordination::{CoordinationClient, CoordinationStore};
use crate::error::Result;
use crate::events::{ConsumerMetrics, EventConsumer, EventHandler, EventPublisher};
use crate::execution::{TaskExecutionCoordinator, TaskStore};
use crate::http::{self, HttpState};
use crate::lock::ExecutionLockService;
use crate::transport::EventBroker;

/// Main node that wires all components together.
pub struct Node {
    pub config: NodeConfig,
    pub coordination: Arc<CoordinationClient>,
    pub locks: Arc<ExecutionLockService>,
    pub publisher: EventPublisher,
    pub broadcast: BroadcastService,
    pub coordinator: Arc<TaskExecutionCoordinator>,
    consumer: EventConsumer,
}

impl Node {
    /// Connect to the coordination store and build every component.
    ///
    /// # Errors
    ///
    /// Fails if the coordination session does not connect within the
    /// configured timeout. Nothing else at startup is fatal.
    pub async fn start(
        config: NodeConfig,
        store: Arc<dyn CoordinationStore>,
        broker: Arc<dyn EventBroker>,
        tasks: Arc<dyn TaskStore>,
    ) -> Result<Self> {
        let coordination = match CoordinationClient::start(store, &config.coordination).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                tracing::error!(node_id = %config.node_id, error = %e, "Coordination client failed to start");
                return Err(e);
            }
        };

        let locks = Arc::new(ExecutionLockService::new(
            coordination.clone(),
            config.node_id.clone(),
            config.locks.clone(),
        ));
        let publisher = EventPublisher::new(broker.clone(), config.events.source.clone());
        let broadcast = BroadcastService::new(config.broadcast.clone());
        let coordinator = Arc::new(TaskExecutionCoordinator::new(
            locks.clone(),
            tasks,
            publisher.clone(),
        ));

        let handler: Arc<dyn EventHandler> = Arc::new(broadcast.clone());
        let consumer = EventConsumer::new(
            broker,
            config.consumer_group(),
            handler,
            config.events.clone(),
        );

        tracing::info!(
            node_id = %config.node_id,
            group = %consumer.group(),
            "Node started"
        );

        Ok(Self {
            config,
            coordination,
            locks,
            publisher,
            broadcast,
            coordinator,
            consumer,
        })
    }

    pub fn consumer_metrics(&self) -> Arc<ConsumerMetrics> {
        self.consumer.metrics()
    }

    pub fn http_state(&self) -> HttpState {
        HttpState {
            node_id: self.config.node_id.clone(),
            broadcast: self.broadcast.clone(),
            locks: self.locks.clone(),
            coordination: self.coordination.clone(),
            consumer_metrics: self.consumer.metrics(),
        }
    }

    /// Run background loops until `shutdown` fires, then close the
    /// coordination session.
    ///
    /// Spawns:
    /// 1. The event consumer feeding the broadcast service
    /// 2. The stream heartbeat loop
    /// 3. The stale lock audit loop
    /// 4. The HTTP server, if an address is configured
    ///
    /// # Errors
    ///
    /// Returns an error only if the HTTP listener cannot be bound.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let http_state = self.http_state();
        let listener = match self.config.http_addr {
            Some(addr) => Some(http::bind(addr).await?),
            None => None,
        };

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(self.consumer.run(shutdown.clone())));

        let broadcast = self.broadcast.clone();
        let heartbeat_interval = self.config.broadcast.heartbeat_interval;
        let heartbeat_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            Self::heartbeat_loop(broadcast, heartbeat_interval, heartbeat_shutdown).await;
        }));

        let locks = self.locks.clone();
        let audit_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            locks.run_stale_audit(audit_shutdown).await;
        }));

        if let Some(listener) = listener {
            tasks.push(tokio::spawn(http::serve(
                listener,
                http_state,
                shutdown.clone(),
            )));
        }

        shutdown.cancelled().await;
        tracing::info!(node_id = %self.config.node_id, "Shutting down node");

        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        for lock in self.locks.held_locks() {
            self.locks.release(&lock).await;
        }
        self.coordination.close().await;
        tracing::info!(node_id = %self.config.node_id, "Node stopped");
        Ok(())
    }

    /// Keep client streams warm and prune the ones whose client went away.
    async fn heartbeat_loop(
        broadcast: BroadcastService,
        interval: std::time::Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let alive = broadcast.heartbeat();
                    tracing::trace!(alive, "Stream heartbeat sent");
                }
            }
        }
    }
}
