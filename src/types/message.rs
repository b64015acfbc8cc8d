//! Message and batch type definitions.

use serde::{Deserialize, Serialize};

/// Content type declared on every published message.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message published to the queue.
///
/// Serialized as a JSON object with a single `content` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The message payload
    pub content: String,
}

impl Message {
    /// Create a new message with the given content.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }

    /// Serialize the message into its wire representation.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

impl From<&str> for Message {
    fn from(content: &str) -> Self {
        Self::new(content)
    }
}

/// An ordered set of messages to fan out across producer workers.
#[derive(Debug, Clone)]
pub struct DispatchBatch {
    messages: Vec<Message>,
    workers: usize,
}

impl DispatchBatch {
    /// Create a batch. Any requested worker count below 1 is treated as 1.
    pub fn new(messages: Vec<Message>, requested_workers: i64) -> Self {
        Self {
            messages,
            workers: normalize_worker_count(requested_workers),
        }
    }

    /// Number of messages in the batch.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the batch holds no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Effective worker count (always at least 1).
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Messages in dispatch order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub(crate) fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

/// Coerce a requested worker or consumer count to at least 1.
pub fn normalize_worker_count(requested: i64) -> usize {
    if requested < 1 {
        1
    } else {
        usize::try_from(requested).unwrap_or(usize::MAX)
    }
}
