//! Broker gateway abstraction.
//!
//! The dispatch engine only needs a handful of broker capabilities: open a
//! channel, publish on it, limit prefetch, open a consumption feed and ack
//! deliveries. These traits describe that surface so the pools can run against
//! RabbitMQ ([`RabbitGateway`]) or the in-process [`MemoryBroker`].

pub mod memory;
pub mod rabbit;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::warn;

use crate::error::GatewayError;
use crate::types::QueueParams;

pub use memory::MemoryBroker;
pub use rabbit::RabbitGateway;

/// Stream of deliveries from one consumer registration. Ends when the broker
/// closes the feed.
pub type DeliveryFeed<D> = BoxStream<'static, Result<D, GatewayError>>;

/// Publish flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub mandatory: bool,
    pub immediate: bool,
}

/// Consumer registration flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Consumer tag; empty lets the broker generate one
    pub consumer_tag: String,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
}

impl ConsumeOptions {
    /// Broker-generated tag, manual acknowledgement, non-exclusive.
    pub fn manual_ack() -> Self {
        Self::default()
    }

    /// Broker-generated tag with automatic acknowledgement.
    pub fn auto_ack() -> Self {
        Self {
            auto_ack: true,
            ..Self::default()
        }
    }
}

/// Source of dedicated channels over one shared connection.
///
/// Implementations must allow concurrent callers of [`open_channel`].
///
/// [`open_channel`]: BrokerGateway::open_channel
#[async_trait]
pub trait BrokerGateway: Send + Sync + 'static {
    type Channel: BrokerChannel;

    /// Open a new channel on the shared connection.
    async fn open_channel(&self) -> Result<Self::Channel, GatewayError>;
}

/// A logical channel used to publish and consume.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    type Delivery: InboundDelivery;

    /// Publish `body` to `exchange` with `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        content_type: &str,
        body: &[u8],
    ) -> Result<(), GatewayError>;

    /// Limit unacknowledged deliveries. `global` applies the limit to the whole
    /// channel instead of each consumer on it.
    async fn set_qos(&self, prefetch_count: u16, global: bool) -> Result<(), GatewayError>;

    /// Register a consumer on `queue` and return its delivery feed.
    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryFeed<Self::Delivery>, GatewayError>;

    /// Close the channel.
    async fn close(&self) -> Result<(), GatewayError>;

    /// Declare `params.name` with the given flags.
    async fn declare_queue(&self, params: &QueueParams) -> Result<(), GatewayError>;
}

/// Close a channel, logging instead of failing.
pub async fn close_channel_with_log<C: BrokerChannel>(channel: &C, context: &str) {
    if let Err(e) = channel.close().await {
        warn!(error = %e, "{}", context);
    }
}

/// A single inbound message awaiting acknowledgement.
#[async_trait]
pub trait InboundDelivery: Send + Sync + 'static {
    fn routing_key(&self) -> &str;

    fn body(&self) -> &[u8];

    /// Acknowledge this delivery (and all earlier ones if `multiple`).
    async fn ack(&self, multiple: bool) -> Result<(), GatewayError>;
}
