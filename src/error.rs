//! Error types for broker I/O, dispatch and consumption.

use std::time::Duration;

use thiserror::Error;

/// AMQP reply code for a failed precondition (e.g. inequivalent queue args).
pub const PRECONDITION_FAILED: u16 = 406;

/// Errors raised by a broker gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The broker refused an operation with an AMQP reply code.
    #[error("broker rejected operation ({code}): {reason}")]
    Rejected { code: u16, reason: String },

    /// The channel or connection is no longer usable.
    #[error("channel closed: {0}")]
    Closed(String),

    /// Any other client-side failure.
    #[error(transparent)]
    Amqp(lapin::Error),

    /// Failure raised by a non-AMQP gateway.
    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// AMQP reply code, if the broker supplied one.
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            GatewayError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<lapin::Error> for GatewayError {
    fn from(err: lapin::Error) -> Self {
        match &err {
            lapin::Error::ProtocolError(amqp) => GatewayError::Rejected {
                code: amqp.get_id(),
                reason: amqp.get_message().as_str().to_string(),
            },
            _ => GatewayError::Amqp(err),
        }
    }
}

/// Errors reported by a producer worker and surfaced by a dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The worker could not open its dedicated channel.
    #[error("sender {worker} failed to open a channel: {source}")]
    ChannelOpen {
        worker: usize,
        #[source]
        source: GatewayError,
    },

    /// A message could not be serialized.
    #[error("sender {worker} failed to serialize message: {source}")]
    Serialize {
        worker: usize,
        #[source]
        source: serde_json::Error,
    },

    /// The broker rejected or failed a publish.
    #[error("sender {worker} failed to publish: {source}")]
    Publish {
        worker: usize,
        #[source]
        source: GatewayError,
    },

    /// A publish did not complete in time.
    #[error("sender {worker} timed out publishing after {timeout:?}")]
    Timeout { worker: usize, timeout: Duration },

    /// The worker ended without reporting an outcome.
    #[error("sender {worker} stopped without reporting an outcome")]
    WorkerLost { worker: usize },
}

impl DispatchError {
    /// Index of the worker that reported the error.
    pub fn worker(&self) -> usize {
        match self {
            DispatchError::ChannelOpen { worker, .. }
            | DispatchError::Serialize { worker, .. }
            | DispatchError::Publish { worker, .. }
            | DispatchError::Timeout { worker, .. }
            | DispatchError::WorkerLost { worker } => *worker,
        }
    }
}

/// Errors that prevent a consumer pool from starting.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("failed to set QoS: {0}")]
    Qos(#[source] GatewayError),

    #[error("failed to register consumer: {0}")]
    Register(#[source] GatewayError),
}

/// Fatal bootstrap errors.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to load config: {0}")]
    Config(#[from] config::ConfigError),

    #[error("failed to connect to broker: {0}")]
    Connect(#[source] GatewayError),

    #[error("failed to open channel: {0}")]
    Channel(#[source] GatewayError),

    /// The queue already exists with a different durability setting.
    #[error(
        "queue '{queue}' exists with a different durable setting, but config requires \
         durable={durable}; delete the queue or update its settings"
    )]
    DurabilityMismatch { queue: String, durable: bool },

    #[error("failed to declare queue '{queue}': {source}")]
    Declare {
        queue: String,
        #[source]
        source: GatewayError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_code() {
        let err = GatewayError::Rejected {
            code: PRECONDITION_FAILED,
            reason: "PRECONDITION_FAILED".to_string(),
        };
        assert_eq!(err.reply_code(), Some(406));
        assert_eq!(GatewayError::Closed("gone".into()).reply_code(), None);
    }

    #[test]
    fn test_durability_mismatch_message() {
        let err = SetupError::DurabilityMismatch {
            queue: "hello".to_string(),
            durable: true,
        };
        let message = err.to_string();
        assert!(message.contains("'hello'"));
        assert!(message.contains("durable=true"));
    }

    #[test]
    fn test_dispatch_error_worker() {
        let err = DispatchError::Timeout {
            worker: 3,
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.worker(), 3);
    }
}
