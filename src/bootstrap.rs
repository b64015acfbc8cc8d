//! Connection and queue setup.
//!
//! Everything here returns [`SetupError`]; deciding whether a failure ends the
//! process is left to the caller.

use std::sync::Arc;

use tracing::{error, info};

use crate::error::{GatewayError, SetupError, PRECONDITION_FAILED};
use crate::gateway::rabbit::RabbitChannel;
use crate::gateway::{close_channel_with_log, BrokerChannel, BrokerGateway, RabbitGateway};
use crate::types::{BrokerConfig, QueueParams};

/// A connected broker plus the channel used for declaration and consumption.
pub struct Session {
    pub gateway: Arc<RabbitGateway>,
    pub channel: Arc<RabbitChannel>,
}

impl Session {
    /// Close the shared channel, then the connection, logging any failure.
    pub async fn close(self) {
        close_channel_with_log(self.channel.as_ref(), "failed to close Rabbit channel").await;
        self.gateway
            .close_connection_with_log("failed to close Rabbit connection")
            .await;
    }
}

/// Connect to the configured broker and open the shared channel.
pub async fn connect(config: &BrokerConfig) -> Result<Session, SetupError> {
    let gateway = RabbitGateway::connect(&config.rabbit_url)
        .await
        .map_err(SetupError::Connect)?;

    let channel = match gateway.open_channel().await {
        Ok(channel) => channel,
        Err(e) => {
            gateway
                .close_connection_with_log("failed to close Rabbit connection")
                .await;
            return Err(SetupError::Channel(e));
        }
    };

    Ok(Session {
        gateway: Arc::new(gateway),
        channel: Arc::new(channel),
    })
}

/// Declare the queue, reporting a durability mismatch distinctly.
pub async fn declare_queue<C: BrokerChannel>(
    channel: &C,
    params: &QueueParams,
) -> Result<(), SetupError> {
    match channel.declare_queue(params).await {
        Ok(()) => {
            info!(
                queue = %params.name,
                durable = params.durable,
                auto_delete = params.auto_delete,
                exclusive = params.exclusive,
                "Queue ready"
            );
            Ok(())
        }
        Err(e) => {
            let err = classify_declare_error(e, params);
            error!(error = %err, "Queue declaration failed");
            Err(err)
        }
    }
}

/// Map a declaration failure to a setup error.
pub fn classify_declare_error(err: GatewayError, params: &QueueParams) -> SetupError {
    let durable_mismatch = match &err {
        GatewayError::Rejected { code, reason } => {
            *code == PRECONDITION_FAILED && reason.contains("inequivalent arg 'durable'")
        }
        _ => false,
    };

    if durable_mismatch {
        SetupError::DurabilityMismatch {
            queue: params.name.clone(),
            durable: params.durable,
        }
    } else {
        SetupError::Declare {
            queue: params.name.clone(),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryBroker;

    fn params(durable: bool) -> QueueParams {
        QueueParams {
            name: "hello".to_string(),
            durable,
            auto_delete: false,
            exclusive: false,
            no_wait: false,
        }
    }

    #[tokio::test]
    async fn test_declare_then_redeclare_same_flags() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();

        declare_queue(&channel, &params(true)).await.unwrap();
        declare_queue(&channel, &params(true)).await.unwrap();
        assert_eq!(broker.declared("hello"), Some(params(true)));
    }

    #[tokio::test]
    async fn test_durability_mismatch_is_distinct() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        declare_queue(&channel, &params(false)).await.unwrap();

        let err = declare_queue(&channel, &params(true)).await.unwrap_err();
        assert!(matches!(
            err,
            SetupError::DurabilityMismatch { durable: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_other_precondition_failure_is_generic() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        declare_queue(&channel, &params(false)).await.unwrap();

        let err = declare_queue(
            &channel,
            &QueueParams {
                auto_delete: true,
                ..params(false)
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SetupError::Declare { .. }));
    }

    #[test]
    fn test_non_406_durable_text_is_generic() {
        let err = classify_declare_error(
            GatewayError::Rejected {
                code: 405,
                reason: "RESOURCE_LOCKED - inequivalent arg 'durable'".to_string(),
            },
            &params(true),
        );
        assert!(matches!(err, SetupError::Declare { .. }));
    }
}
