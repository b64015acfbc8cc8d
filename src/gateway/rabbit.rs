//! RabbitMQ gateway backed by lapin.
//!
//! One [`RabbitGateway`] owns the AMQP connection; every call to
//! [`BrokerGateway::open_channel`] creates a fresh channel on it.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery, options::*, types::FieldTable, BasicProperties, Channel, Connection,
    ConnectionProperties,
};
use tracing::{debug, info, instrument, warn};

use super::{
    BrokerChannel, BrokerGateway, ConsumeOptions, DeliveryFeed, InboundDelivery, PublishOptions,
};
use crate::error::GatewayError;
use crate::types::QueueParams;

/// Reply code sent when closing channels and connections normally.
const REPLY_SUCCESS: u16 = 200;

/// AMQP connection shared by all workers.
pub struct RabbitGateway {
    connection: Connection,
}

impl RabbitGateway {
    /// Connect to the broker at `uri`.
    pub async fn connect(uri: &str) -> Result<Self, GatewayError> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;

        info!("RabbitMQ connection established");

        Ok(Self { connection })
    }

    /// Close the connection, logging instead of failing.
    pub async fn close_connection_with_log(&self, context: &str) {
        if let Err(e) = self.connection.close(REPLY_SUCCESS, "OK").await {
            warn!(error = %e, "{}", context);
        }
    }
}

#[async_trait]
impl BrokerGateway for RabbitGateway {
    type Channel = RabbitChannel;

    async fn open_channel(&self) -> Result<RabbitChannel, GatewayError> {
        let channel = self.connection.create_channel().await?;
        debug!(channel_id = channel.id(), "Channel opened");
        Ok(RabbitChannel { channel })
    }
}

/// A lapin channel.
pub struct RabbitChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for RabbitChannel {
    type Delivery = RabbitDelivery;

    #[instrument(skip(self, body), fields(channel_id = self.channel.id(), bytes = body.len()))]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        content_type: &str,
        body: &[u8],
    ) -> Result<(), GatewayError> {
        let properties = BasicProperties::default().with_content_type(content_type.into());

        // Publisher confirms are not enabled, so the returned confirm is
        // resolved as soon as the frame is written.
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    immediate: options.immediate,
                },
                body,
                properties,
            )
            .await?;

        Ok(())
    }

    async fn set_qos(&self, prefetch_count: u16, global: bool) -> Result<(), GatewayError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await?;
        Ok(())
    }

    #[instrument(skip(self, options), fields(channel_id = self.channel.id()))]
    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryFeed<RabbitDelivery>, GatewayError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    nowait: options.no_wait,
                },
                FieldTable::default(),
            )
            .await?;

        debug!(consumer_tag = %consumer.tag().as_str(), "Consumer registered");

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|delivery| RabbitDelivery { delivery })
                    .map_err(GatewayError::from)
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), GatewayError> {
        self.channel.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %params.name))]
    async fn declare_queue(&self, params: &QueueParams) -> Result<(), GatewayError> {
        let queue = self
            .channel
            .queue_declare(
                &params.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: params.durable,
                    exclusive: params.exclusive,
                    auto_delete: params.auto_delete,
                    nowait: params.no_wait,
                },
                FieldTable::default(),
            )
            .await?;

        info!(
            queue = %params.name,
            messages = queue.message_count(),
            consumers = queue.consumer_count(),
            "Queue declared"
        );

        Ok(())
    }
}

/// A delivery received from RabbitMQ.
pub struct RabbitDelivery {
    delivery: Delivery,
}

#[async_trait]
impl InboundDelivery for RabbitDelivery {
    fn routing_key(&self) -> &str {
        self.delivery.routing_key.as_str()
    }

    fn body(&self) -> &[u8] {
        &self.delivery.data
    }

    async fn ack(&self, multiple: bool) -> Result<(), GatewayError> {
        self.delivery
            .acker
            .ack(BasicAckOptions { multiple })
            .await?;
        Ok(())
    }
}
