//! In-process broker with a single competing-consumer queue.
//!
//! Every publish is recorded and enqueued; every feed registered through
//! [`BrokerChannel::consume`] pulls from the same queue, so deliveries are
//! spread across consumers the way a broker would. Faults can be injected for
//! each capability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    BrokerChannel, BrokerGateway, ConsumeOptions, DeliveryFeed, InboundDelivery, PublishOptions,
};
use crate::error::{GatewayError, PRECONDITION_FAILED};
use crate::types::QueueParams;

/// A message accepted by [`MemoryChannel::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub channel_id: u16,
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// An acknowledgement that reached the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRecord {
    pub delivery_tag: u64,
    pub multiple: bool,
}

/// Injected failures.
#[derive(Debug, Clone, Default)]
struct Faults {
    open_channel: bool,
    publish_matching: Option<String>,
    publish_delay: Option<Duration>,
    qos: bool,
    /// Remaining registrations to reject
    consume_failures: usize,
    ack: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    channels_opened: usize,
    channels_closed: usize,
    published: Vec<PublishedMessage>,
    qos_calls: Vec<(u16, bool)>,
    consume_registrations: usize,
    acks: Vec<AckRecord>,
    ack_attempts: usize,
    declared: HashMap<String, QueueParams>,
    next_delivery_tag: u64,
    faults: Faults,
}

struct QueuedMessage {
    delivery_tag: u64,
    routing_key: String,
    body: Vec<u8>,
}

struct Inner {
    state: Mutex<BrokerState>,
    queue_tx: Mutex<Option<mpsc::UnboundedSender<QueuedMessage>>>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedMessage>>>,
    next_channel_id: AtomicU16,
}

/// Handle to an in-memory broker. Clones share the same state.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                queue_tx: Mutex::new(Some(tx)),
                queue_rx: Arc::new(tokio::sync::Mutex::new(rx)),
                next_channel_id: AtomicU16::new(1),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put a message on the queue as if another producer had sent it.
    pub fn enqueue(&self, routing_key: &str, body: &[u8]) {
        let delivery_tag = {
            let mut state = self.state();
            state.next_delivery_tag += 1;
            state.next_delivery_tag
        };

        let sender = self.inner.queue_tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = sender.as_ref() {
            let _ = tx.send(QueuedMessage {
                delivery_tag,
                routing_key: routing_key.to_string(),
                body: body.to_vec(),
            });
        }
    }

    /// Close the queue. Feeds end once the remaining messages are drained.
    pub fn close_queue(&self) {
        self.inner
            .queue_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Make every channel open fail.
    pub fn fail_open_channel(&self) {
        self.state().faults.open_channel = true;
    }

    /// Reject publishes whose body contains `needle`.
    pub fn fail_publish_matching(&self, needle: &str) {
        self.state().faults.publish_matching = Some(needle.to_string());
    }

    /// Delay every publish by `delay`.
    pub fn delay_publish(&self, delay: Duration) {
        self.state().faults.publish_delay = Some(delay);
    }

    /// Make QoS calls fail.
    pub fn fail_qos(&self) {
        self.state().faults.qos = true;
    }

    /// Make every consumer registration fail.
    pub fn fail_consume(&self) {
        self.state().faults.consume_failures = usize::MAX;
    }

    /// Make the next `times` consumer registrations fail.
    pub fn fail_consume_times(&self, times: usize) {
        self.state().faults.consume_failures = times;
    }

    /// Make acknowledgements fail.
    pub fn fail_ack(&self) {
        self.state().faults.ack = true;
    }

    pub fn channels_opened(&self) -> usize {
        self.state().channels_opened
    }

    pub fn channels_closed(&self) -> usize {
        self.state().channels_closed
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    /// Bodies of published messages, decoded as UTF-8.
    pub fn published_bodies(&self) -> Vec<String> {
        self.state()
            .published
            .iter()
            .map(|m| String::from_utf8_lossy(&m.body).into_owned())
            .collect()
    }

    pub fn qos_calls(&self) -> Vec<(u16, bool)> {
        self.state().qos_calls.clone()
    }

    /// Number of consumer registrations attempted, including failed ones.
    pub fn consume_registrations(&self) -> usize {
        self.state().consume_registrations
    }

    pub fn acks(&self) -> Vec<AckRecord> {
        self.state().acks.clone()
    }

    /// Number of acknowledgements attempted, including failed ones.
    pub fn ack_attempts(&self) -> usize {
        self.state().ack_attempts
    }

    pub fn declared(&self, queue: &str) -> Option<QueueParams> {
        self.state().declared.get(queue).cloned()
    }
}

#[async_trait]
impl BrokerGateway for MemoryBroker {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<MemoryChannel, GatewayError> {
        let mut state = self.state();
        if state.faults.open_channel {
            return Err(GatewayError::Closed("connection refused channel".to_string()));
        }
        state.channels_opened += 1;

        let id = self.inner.next_channel_id.fetch_add(1, Ordering::SeqCst);
        debug!(channel_id = id, "Memory channel opened");

        Ok(MemoryChannel {
            id,
            broker: self.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

/// Channel on a [`MemoryBroker`].
pub struct MemoryChannel {
    id: u16,
    broker: MemoryBroker,
    closed: AtomicBool,
}

impl MemoryChannel {
    pub fn id(&self) -> u16 {
        self.id
    }

    fn ensure_open(&self) -> Result<(), GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Closed(format!("channel {} is closed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    type Delivery = MemoryDelivery;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _options: PublishOptions,
        content_type: &str,
        body: &[u8],
    ) -> Result<(), GatewayError> {
        self.ensure_open()?;

        let delay = self.broker.state().faults.publish_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut state = self.broker.state();
            if let Some(needle) = &state.faults.publish_matching {
                if String::from_utf8_lossy(body).contains(needle.as_str()) {
                    return Err(GatewayError::Other(format!("publish rejected: {needle}")));
                }
            }
            state.published.push(PublishedMessage {
                channel_id: self.id,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                content_type: content_type.to_string(),
                body: body.to_vec(),
            });
        }

        self.broker.enqueue(routing_key, body);
        Ok(())
    }

    async fn set_qos(&self, prefetch_count: u16, global: bool) -> Result<(), GatewayError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        state.qos_calls.push((prefetch_count, global));
        if state.faults.qos {
            return Err(GatewayError::Closed("basic.qos refused".to_string()));
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _options: ConsumeOptions,
    ) -> Result<DeliveryFeed<MemoryDelivery>, GatewayError> {
        self.ensure_open()?;
        {
            let mut state = self.broker.state();
            state.consume_registrations += 1;
            if state.faults.consume_failures > 0 {
                state.faults.consume_failures -= 1;
                return Err(GatewayError::Rejected {
                    code: 404,
                    reason: format!("NOT_FOUND - no queue '{queue}'"),
                });
            }
        }

        let receiver = Arc::clone(&self.broker.inner.queue_rx);
        let broker = self.broker.clone();

        let feed = stream::unfold((receiver, broker), |(receiver, broker)| async move {
            let next = receiver.lock().await.recv().await;
            next.map(|message| {
                let delivery = MemoryDelivery {
                    delivery_tag: message.delivery_tag,
                    routing_key: message.routing_key,
                    body: message.body,
                    broker: broker.clone(),
                };
                (Ok::<_, GatewayError>(delivery), (receiver, broker))
            })
        });

        Ok(feed.boxed())
    }

    async fn close(&self) -> Result<(), GatewayError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::Closed(format!("channel {} already closed", self.id)));
        }
        self.broker.state().channels_closed += 1;
        Ok(())
    }

    async fn declare_queue(&self, params: &QueueParams) -> Result<(), GatewayError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if let Some(existing) = state.declared.get(&params.name) {
            if existing.durable != params.durable {
                return Err(GatewayError::Rejected {
                    code: PRECONDITION_FAILED,
                    reason: format!(
                        "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}' in \
                         vhost '/': received '{}' but current is '{}'",
                        params.name, params.durable, existing.durable
                    ),
                });
            }
            if existing.auto_delete != params.auto_delete {
                return Err(GatewayError::Rejected {
                    code: PRECONDITION_FAILED,
                    reason: format!(
                        "PRECONDITION_FAILED - inequivalent arg 'auto_delete' for queue '{}'",
                        params.name
                    ),
                });
            }
            return Ok(());
        }
        state.declared.insert(params.name.clone(), params.clone());
        Ok(())
    }
}

/// Delivery handed out by a [`MemoryChannel`] feed.
pub struct MemoryDelivery {
    delivery_tag: u64,
    routing_key: String,
    body: Vec<u8>,
    broker: MemoryBroker,
}

impl MemoryDelivery {
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }
}

#[async_trait]
impl InboundDelivery for MemoryDelivery {
    fn routing_key(&self) -> &str {
        &self.routing_key
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    async fn ack(&self, multiple: bool) -> Result<(), GatewayError> {
        let mut state = self.broker.state();
        state.ack_attempts += 1;
        if state.faults.ack {
            return Err(GatewayError::Closed(format!(
                "delivery tag {} could not be acknowledged",
                self.delivery_tag
            )));
        }
        state.acks.push(AckRecord {
            delivery_tag: self.delivery_tag,
            multiple,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_is_recorded_and_delivered() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();

        channel
            .publish("", "hello", PublishOptions::default(), "application/json", b"{}")
            .await
            .unwrap();
        broker.close_queue();

        let mut feed = channel.consume("hello", ConsumeOptions::manual_ack()).await.unwrap();
        let delivery = feed.next().await.unwrap().unwrap();
        assert_eq!(delivery.routing_key(), "hello");
        assert_eq!(delivery.body(), b"{}");
        assert!(feed.next().await.is_none());

        assert_eq!(broker.published().len(), 1);
        assert_eq!(broker.published()[0].content_type, "application/json");
    }

    #[tokio::test]
    async fn test_redeclare_with_other_durability_is_rejected() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        let params = QueueParams {
            name: "hello".to_string(),
            durable: false,
            auto_delete: false,
            exclusive: false,
            no_wait: false,
        };
        channel.declare_queue(&params).await.unwrap();
        channel.declare_queue(&params).await.unwrap();

        let err = channel
            .declare_queue(&QueueParams {
                durable: true,
                ..params
            })
            .await
            .unwrap_err();
        assert_eq!(err.reply_code(), Some(PRECONDITION_FAILED));
        assert!(err.to_string().contains("inequivalent arg 'durable'"));
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_publish() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        channel.close().await.unwrap();

        let result = channel
            .publish("", "hello", PublishOptions::default(), "text/plain", b"x")
            .await;
        assert!(matches!(result, Err(GatewayError::Closed(_))));
        assert!(channel.close().await.is_err());
        assert_eq!(broker.channels_closed(), 1);
    }
}
