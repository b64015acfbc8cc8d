//! Core types for the dispatcher.

mod config;
mod message;

pub use config::{BrokerConfig, PublishTarget, QueueParams, ENV_PREFIX};
pub use message::{normalize_worker_count, DispatchBatch, Message, JSON_CONTENT_TYPE};
