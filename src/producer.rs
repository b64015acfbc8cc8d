//! Producer worker pool.
//!
//! A batch is partitioned into shards and each shard is published by its own
//! task on its own channel. Workers never cancel each other; the pool waits
//! for all of them and reports the first error observed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::aggregate::{DispatchSummary, OutcomeSet, WorkerOutcome};
use crate::error::DispatchError;
use crate::gateway::{close_channel_with_log, BrokerChannel, BrokerGateway, PublishOptions};
use crate::partition::{partition, Shard};
use crate::types::{DispatchBatch, Message, PublishTarget, JSON_CONTENT_TYPE};
use crate::DEFAULT_PUBLISH_TIMEOUT_SECS;

/// Fans batches out across producer workers.
pub struct ProducerPool<G: BrokerGateway> {
    gateway: Arc<G>,
    target: PublishTarget,
    publish_timeout: Duration,
}

impl<G: BrokerGateway> ProducerPool<G> {
    /// Create a pool publishing to `target` through `gateway`.
    pub fn new(gateway: Arc<G>, target: PublishTarget) -> Self {
        Self {
            gateway,
            target,
            publish_timeout: Duration::from_secs(DEFAULT_PUBLISH_TIMEOUT_SECS),
        }
    }

    /// Set the per-message publish timeout.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Publish every message of `batch`, each exactly once.
    ///
    /// Returns once every worker has finished. If any worker failed, the first
    /// error the pool observed is returned; a failing worker publishes nothing
    /// after its failing message.
    pub async fn dispatch(&self, batch: DispatchBatch) -> Result<DispatchSummary, DispatchError> {
        let dispatch_id = Uuid::new_v4();
        let started_at = Utc::now();

        if batch.is_empty() {
            debug!(dispatch_id = %dispatch_id, "No messages to send");
            return OutcomeSet::new(dispatch_id, 0).into_result(started_at);
        }

        let total = batch.len();
        let shards = partition(batch);
        let workers = shards.len();

        info!(
            dispatch_id = %dispatch_id,
            messages = total,
            senders = workers,
            "Starting dispatch"
        );

        let (tx, mut rx) = mpsc::channel::<(usize, WorkerOutcome)>(workers);

        for shard in shards {
            let tx = tx.clone();
            let gateway = Arc::clone(&self.gateway);
            let target = self.target.clone();
            let timeout = self.publish_timeout;

            tokio::spawn(async move {
                let worker = shard.worker;
                let outcome = run_sender(gateway.as_ref(), &target, shard, timeout).await;
                let _ = tx.send((worker, outcome)).await;
            });
        }
        drop(tx);

        let mut outcomes = OutcomeSet::new(dispatch_id, workers);
        outcomes.collect(&mut rx).await;
        let result = outcomes.into_result(started_at);

        if let Ok(summary) = &result {
            info!(
                dispatch_id = %dispatch_id,
                published = summary.published,
                senders = summary.workers,
                "Dispatch complete"
            );
        }

        result
    }
}

/// Publish one shard on a dedicated channel.
async fn run_sender<G: BrokerGateway>(
    gateway: &G,
    target: &PublishTarget,
    shard: Shard,
    timeout: Duration,
) -> WorkerOutcome {
    let worker = shard.worker;
    let channel = gateway
        .open_channel()
        .await
        .map_err(|source| DispatchError::ChannelOpen { worker, source })?;

    let mut published = 0;
    let mut result = Ok(());
    for message in &shard.messages {
        if let Err(e) = publish_one(&channel, target, worker, message, timeout).await {
            result = Err(e);
            break;
        }
        published += 1;
    }

    close_channel_with_log(&channel, "failed to close sender channel").await;
    result.map(|()| published)
}

/// Serialize and publish a single message within `timeout`.
async fn publish_one<C: BrokerChannel>(
    channel: &C,
    target: &PublishTarget,
    worker: usize,
    message: &Message,
    timeout: Duration,
) -> Result<(), DispatchError> {
    let body = message
        .to_bytes()
        .map_err(|source| DispatchError::Serialize { worker, source })?;

    let publish = channel.publish(
        &target.exchange,
        &target.routing_key,
        PublishOptions::default(),
        JSON_CONTENT_TYPE,
        &body,
    );

    match tokio::time::timeout(timeout, publish).await {
        Ok(Ok(())) => {
            info!(
                sender = worker,
                body = %String::from_utf8_lossy(&body),
                "Sent message"
            );
            Ok(())
        }
        Ok(Err(source)) => Err(DispatchError::Publish { worker, source }),
        Err(_) => Err(DispatchError::Timeout { worker, timeout }),
    }
}

/// Publish a single message on an existing channel.
pub async fn send_message<C: BrokerChannel>(
    channel: &C,
    target: &PublishTarget,
    message: &Message,
    timeout: Duration,
) -> Result<(), DispatchError> {
    publish_one(channel, target, 0, message, timeout).await
}
