//! Rabbit Fanout Library
//!
//! Worker-pool dispatcher for publishing to and consuming from a single
//! RabbitMQ queue. Batches are partitioned across producer workers, each on
//! its own channel; a fixed set of consumers drains the queue over a shared
//! channel and acknowledges every delivery.

pub mod aggregate;
pub mod bootstrap;
pub mod consumer;
pub mod error;
pub mod gateway;
pub mod partition;
pub mod producer;
pub mod shutdown;
pub mod types;

pub use aggregate::{DispatchSummary, OutcomeSet};
pub use consumer::{ConsumerPool, PoolReport, PoolState, RunningPool};
pub use error::{ConsumerError, DispatchError, GatewayError, SetupError};
pub use partition::{partition, Shard, ShardPlan};
pub use producer::ProducerPool;
pub use shutdown::ShutdownHandle;
pub use types::{BrokerConfig, DispatchBatch, Message};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::consumer::*;
    pub use crate::error::*;
    pub use crate::gateway::{BrokerChannel, BrokerGateway, InboundDelivery};
    pub use crate::producer::*;
    pub use crate::shutdown::*;
    pub use crate::types::*;
}

/// Unacknowledged deliveries each consumer may hold
pub const PREFETCH_PER_CONSUMER: u16 = 10;

/// Default per-message publish timeout in seconds
pub const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 5;

/// Default number of producer workers
pub const DEFAULT_SENDERS: i64 = 2;

/// Default number of consumer workers
pub const DEFAULT_CONSUMERS: i64 = 4;
