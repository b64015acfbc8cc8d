//! Consumer worker pool.
//!
//! Consumers share one channel. QoS is applied once before any consumer
//! starts; each consumer then registers its own feed, logs and acknowledges
//! every delivery, and keeps going until the feed closes or the pool is shut
//! down. Per-consumer failures are logged and never stop sibling consumers.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Barrier;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::ConsumerError;
use crate::gateway::{BrokerChannel, ConsumeOptions, InboundDelivery};
use crate::shutdown::{ShutdownHandle, ShutdownSignal};
use crate::types::normalize_worker_count;
use crate::PREFETCH_PER_CONSUMER;

/// Lifecycle of a started pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Consumers are registered (or have given up) and the pool is waiting
    /// for shutdown
    Running,
    /// Shutdown requested and every consumer has exited
    Stopped,
}

/// What one consumer did before it exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub consumer: usize,
    /// Whether the feed registration succeeded
    pub registered: bool,
    pub received: usize,
    pub acked: usize,
    pub ack_failures: usize,
}

impl ConsumerReport {
    fn new(consumer: usize) -> Self {
        Self {
            consumer,
            ..Default::default()
        }
    }
}

/// Per-consumer reports collected at shutdown.
#[derive(Debug, Clone, Default)]
pub struct PoolReport {
    pub consumers: Vec<ConsumerReport>,
}

impl PoolReport {
    pub fn received(&self) -> usize {
        self.consumers.iter().map(|c| c.received).sum()
    }

    pub fn acked(&self) -> usize {
        self.consumers.iter().map(|c| c.acked).sum()
    }

    pub fn registered(&self) -> usize {
        self.consumers.iter().filter(|c| c.registered).count()
    }
}

/// A fixed number of consumers draining one queue over a shared channel.
pub struct ConsumerPool<C: BrokerChannel> {
    channel: Arc<C>,
    queue: String,
    consumers: usize,
}

impl<C: BrokerChannel> ConsumerPool<C> {
    /// Any requested consumer count below 1 is treated as 1.
    pub fn new(channel: Arc<C>, queue: impl Into<String>, requested_consumers: i64) -> Self {
        Self {
            channel,
            queue: queue.into(),
            consumers: normalize_worker_count(requested_consumers),
        }
    }

    /// Effective number of consumers.
    pub fn consumers(&self) -> usize {
        self.consumers
    }

    /// Apply QoS, start every consumer and return once all of them have begun
    /// registering.
    ///
    /// A QoS failure aborts before any consumer is started.
    pub async fn start(self, shutdown: ShutdownHandle) -> Result<RunningPool, ConsumerError> {
        self.channel
            .set_qos(PREFETCH_PER_CONSUMER, false)
            .await
            .map_err(ConsumerError::Qos)?;

        let ready = Arc::new(Barrier::new(self.consumers + 1));
        let workers = (0..self.consumers)
            .map(|consumer| {
                tokio::spawn(run_consumer(
                    consumer,
                    Arc::clone(&self.channel),
                    self.queue.clone(),
                    Arc::clone(&ready),
                    shutdown.subscribe(),
                ))
            })
            .collect();

        ready.wait().await;
        info!(
            consumers = self.consumers,
            queue = %self.queue,
            " [*] {} consumers waiting for messages. To exit press CTRL+C",
            self.consumers
        );

        Ok(RunningPool {
            signal: shutdown.subscribe(),
            shutdown,
            workers,
            state: PoolState::Running,
        })
    }

    /// Start the pool and block until `shutdown` is triggered.
    pub async fn run(self, shutdown: ShutdownHandle) -> Result<PoolReport, ConsumerError> {
        let mut running = self.start(shutdown).await?;
        Ok(running.wait().await)
    }
}

/// A started consumer pool. Only leaves [`PoolState::Running`] through its
/// [`ShutdownHandle`].
#[derive(Debug)]
pub struct RunningPool {
    shutdown: ShutdownHandle,
    signal: ShutdownSignal,
    workers: Vec<JoinHandle<ConsumerReport>>,
    state: PoolState,
}

impl RunningPool {
    pub fn state(&self) -> PoolState {
        self.state
    }

    /// Handle that stops this pool when triggered.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Block until shutdown is requested, then join every consumer.
    pub async fn wait(&mut self) -> PoolReport {
        self.signal.wait().await;
        self.join().await
    }

    /// Request shutdown and join every consumer.
    pub async fn shutdown(&mut self) -> PoolReport {
        self.shutdown.trigger();
        self.join().await
    }

    async fn join(&mut self) -> PoolReport {
        let mut report = PoolReport::default();
        for (consumer, worker) in self.workers.drain(..).enumerate() {
            match worker.await {
                Ok(consumer_report) => report.consumers.push(consumer_report),
                Err(e) => {
                    error!(consumer, error = %e, "Consumer task failed");
                    report.consumers.push(ConsumerReport::new(consumer));
                }
            }
        }
        self.state = PoolState::Stopped;
        info!(
            received = report.received(),
            acked = report.acked(),
            "Consumer pool stopped"
        );
        report
    }
}

async fn run_consumer<C: BrokerChannel>(
    consumer: usize,
    channel: Arc<C>,
    queue: String,
    ready: Arc<Barrier>,
    mut shutdown: ShutdownSignal,
) -> ConsumerReport {
    let mut report = ConsumerReport::new(consumer);
    ready.wait().await;

    let mut feed = match channel.consume(&queue, ConsumeOptions::manual_ack()).await {
        Ok(feed) => feed,
        Err(e) => {
            error!(consumer, error = %e, "Consumer {} failed to register", consumer);
            return report;
        }
    };
    report.registered = true;

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            next = feed.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                warn!(consumer, error = %e, "Consumer feed error");
                continue;
            }
            None => {
                info!(consumer, "Consumer feed closed");
                break;
            }
        };

        report.received += 1;
        info!(
            consumer,
            routing_key = delivery.routing_key(),
            body = %String::from_utf8_lossy(delivery.body()),
            "Consumer {} received a message",
            consumer
        );

        match delivery.ack(false).await {
            Ok(()) => report.acked += 1,
            Err(e) => {
                report.ack_failures += 1;
                error!(consumer, error = %e, "Consumer {} failed to acknowledge message", consumer);
            }
        }
    }

    report
}

/// Consume `queue` with a single auto-acknowledging consumer until `shutdown`
/// is triggered.
pub async fn receive_messages<C: BrokerChannel>(
    channel: &C,
    queue: &str,
    shutdown: ShutdownHandle,
) -> Result<ConsumerReport, ConsumerError> {
    let mut feed = channel
        .consume(queue, ConsumeOptions::auto_ack())
        .await
        .map_err(ConsumerError::Register)?;
    let mut signal = shutdown.subscribe();
    let mut report = ConsumerReport {
        registered: true,
        ..Default::default()
    };

    info!(queue = %queue, " [*] Waiting for messages. To exit press CTRL+C");

    loop {
        let next = tokio::select! {
            biased;
            _ = signal.wait() => return Ok(report),
            next = feed.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                report.received += 1;
                info!(
                    routing_key = delivery.routing_key(),
                    body = %String::from_utf8_lossy(delivery.body()),
                    "Received a message"
                );
            }
            Some(Err(e)) => warn!(error = %e, "Consumer feed error"),
            None => break,
        }
    }

    info!(queue = %queue, "Consumer feed closed");
    signal.wait().await;
    Ok(report)
}
