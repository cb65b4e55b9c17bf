// Wires the link components together and owns the shutdown order.
use crate::client::buffer::MessageBuffer;
use crate::client::connection::{ConnectionHandle, ConnectionManager};
use crate::client::inflight::InflightSet;
use crate::client::liveness::{LIVENESS_POLL_INTERVAL, LivenessEvent, LivenessMonitor};
use crate::client::publisher::PublishPipeline;
use crate::client::stats::{StatsAggregator, StatsSnapshot};
use crate::client::subscription::{Receipt, SubscriptionConsumer};
use crate::config::LinkConfig;
use crate::counters::CounterRegistry;
use crate::error::{LinkError, Result};
use link_transport::Transport;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A running link. Dropping it without `shutdown` leaves tasks running until the
/// runtime exits.
pub struct LinkRuntime {
    config: LinkConfig,
    transport: Arc<dyn Transport>,
    connection: ConnectionHandle,
    counters: Arc<CounterRegistry>,
    pipeline: PublishPipeline,
    stats: StatsAggregator,
    consumer: SubscriptionConsumer,
    liveness: broadcast::Sender<LivenessEvent>,
    // Stops tickers, the flusher and the connection manager.
    publish_stop: watch::Sender<bool>,
    // Stops liveness, stats and the consumer after the final snapshot.
    monitor_stop: watch::Sender<bool>,
    manager_task: Option<JoinHandle<Result<()>>>,
    publish_tasks: Vec<JoinHandle<()>>,
    monitor_tasks: Vec<JoinHandle<()>>,
}

impl LinkRuntime {
    /// Validate, connect once and spawn every link task.
    ///
    /// A failed first connect is fatal only when auto-reconnect is disabled; otherwise
    /// the manager keeps retrying in the background while ticks buffer.
    pub async fn start(config: LinkConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        config.log_effective();
        if config.buffer.persist {
            warn!("buffer persistence is not supported; buffering in memory only");
        }
        let inbound = transport
            .take_inbound()
            .ok_or(LinkError::InboundUnavailable)?;

        let topic_names = config
            .publish
            .iter()
            .map(|topic| topic.topic.clone())
            .chain(config.subscribe.iter().map(|topic| topic.topic.clone()));
        let counters = Arc::new(CounterRegistry::new(topic_names));

        let manager = ConnectionManager::new(
            Arc::clone(&transport),
            config.retry.clone(),
            config.subscribe.clone(),
        );
        let connection = manager.handle();
        match manager.connect().await {
            Ok(()) => info!(
                host = %config.mqtt.host,
                port = config.mqtt.port,
                client_id = %config.mqtt.client_id,
                "connected"
            ),
            Err(err) if config.retry.auto_reconnect => {
                warn!(error = %err, "initial connect failed; retrying in background")
            }
            Err(err) => return Err(LinkError::Connect(err)),
        }

        let (publish_stop, publish_rx) = watch::channel(false);
        let (monitor_stop, monitor_rx) = watch::channel(false);
        let manager_task = tokio::spawn(manager.run(publish_rx.clone()));

        let buffer = config
            .buffer
            .enabled
            .then(|| Arc::new(MessageBuffer::new(config.buffer.capacity, config.buffer.drop_oldest)));
        let pipeline = PublishPipeline::new(
            Arc::clone(&transport),
            connection.clone(),
            Arc::clone(&counters),
            Arc::new(InflightSet::new(config.buffer.max_inflight)),
            buffer,
            config.retry.write_timeout,
        );

        let mut publish_tasks = Vec::with_capacity(config.publish.len() + 1);
        publish_tasks.push(tokio::spawn(pipeline.clone().run_flusher(publish_rx.clone())));
        for topic in &config.publish {
            publish_tasks.push(tokio::spawn(
                pipeline.clone().run_ticker(topic.clone(), publish_rx.clone()),
            ));
        }

        let consumer = SubscriptionConsumer::new(Arc::clone(&counters));
        let (liveness, _) = broadcast::channel(64);
        let monitor = LivenessMonitor::new(connection.clone(), LIVENESS_POLL_INTERVAL, liveness.clone());
        let stats = StatsAggregator::new(
            connection.clone(),
            Arc::clone(&counters),
            pipeline.clone(),
            config.stats_interval,
        );
        let monitor_tasks = vec![
            tokio::spawn(consumer.clone().run(inbound, monitor_rx.clone())),
            tokio::spawn(monitor.run(monitor_rx.clone())),
            tokio::spawn(stats.clone().run(monitor_rx)),
        ];

        info!(
            role = config.role.as_str(),
            publish_topics = config.publish.len(),
            subscribe_topics = config.subscribe.len(),
            buffer_enabled = config.buffer.enabled,
            "link started"
        );

        Ok(Self {
            config,
            transport,
            connection,
            counters,
            pipeline,
            stats,
            consumer,
            liveness,
            publish_stop,
            monitor_stop,
            manager_task: Some(manager_task),
            publish_tasks,
            monitor_tasks,
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn connection(&self) -> ConnectionHandle {
        self.connection.clone()
    }

    pub fn counters(&self) -> Arc<CounterRegistry> {
        Arc::clone(&self.counters)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.capture()
    }

    pub fn receipts(&self) -> broadcast::Receiver<Receipt> {
        self.consumer.receipts()
    }

    pub fn liveness_events(&self) -> broadcast::Receiver<LivenessEvent> {
        self.liveness.subscribe()
    }

    /// Resolves when the connection manager gives up, which happens only on a loss
    /// with auto-reconnect disabled. Pending forever otherwise.
    pub async fn terminated(&mut self) -> LinkError {
        let Some(task) = self.manager_task.as_mut() else {
            return std::future::pending().await;
        };
        let result = task.await;
        self.manager_task = None;
        match result {
            Ok(Err(err)) => err,
            Ok(Ok(())) => std::future::pending().await,
            Err(join) => LinkError::Task(join.to_string()),
        }
    }

    /// Stop schedulers, let ack waits finish, disconnect within the grace period, then
    /// stop reporting after one final snapshot.
    pub async fn shutdown(mut self) -> Result<StatsSnapshot> {
        info!("link shutting down");
        self.publish_stop.send_replace(true);
        for task in self.publish_tasks.drain(..) {
            if let Err(err) = task.await {
                warn!(error = %err, "publish task ended abnormally");
            }
        }

        self.pipeline.drain_acks().await;

        let manager_result = match self.manager_task.take() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(join) => Err(LinkError::Task(join.to_string())),
            },
            None => Ok(()),
        };
        if let Err(err) = &manager_result {
            debug!(error = %err, "connection manager stopped with error");
        }

        let grace = self.config.shutdown_grace;
        match tokio::time::timeout(grace, self.transport.disconnect(grace)).await {
            Ok(Ok(())) => debug!("disconnected"),
            Ok(Err(err)) => warn!(error = %err, "disconnect failed"),
            Err(_) => warn!(grace_ms = grace.as_millis() as u64, "disconnect exceeded grace period"),
        }

        let snapshot = self.stats.capture();
        snapshot.log();

        self.monitor_stop.send_replace(true);
        for task in self.monitor_tasks.drain(..) {
            if let Err(err) = task.await {
                warn!(error = %err, "monitor task ended abnormally");
            }
        }
        info!("link stopped");
        Ok(snapshot)
    }
}
