//! Transport collaborator boundary.
//!
//! The streaming layer shapes and frames data; carrying it is the job of a
//! [`Transport`] implementation backed by a partitioned log broker. The
//! contract expected from implementations: `publish` is ordered and
//! at-least-once per key, `subscribe` delivers raw messages with their
//! metadata, and `commit` acknowledges a consumer position.
//!
//! [`InMemoryTransport`] is an in-process implementation used by tests and
//! local wiring; it delivers published messages synchronously to all
//! subscribers and can be switched into a rejecting mode to exercise
//! failure paths.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by a transport implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The broker refused the publish.
    #[error("publish rejected: {0}")]
    Rejected(String),

    /// No acknowledgment within the bounded wait.
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    /// The connection to the broker is gone.
    #[error("transport disconnected")]
    Disconnected,

    /// Offset commit failed.
    #[error("commit failed: {0}")]
    CommitFailed(String),
}

// ---------------------------------------------------------------------------
// Messages and handlers
// ---------------------------------------------------------------------------

/// Broker-assigned metadata accompanying a delivered message.
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    /// Partition key the message was published under.
    pub key: String,
    /// Position in the broker's log.
    pub offset: u64,
    /// Broker-assigned timestamp (epoch millis).
    pub timestamp: i64,
}

/// Callback receiving raw messages from a subscription.
pub type MessageHandler = Arc<dyn Fn(Bytes, MessageMetadata) + Send + Sync>;

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// An ordered, at-least-once message transport over a partitioned log.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Publish a message under a partition key. Resolves on broker
    /// acknowledgment.
    async fn publish(&self, key: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Register a handler for inbound messages.
    fn subscribe(&self, handler: MessageHandler);

    /// Commit a consumer position.
    async fn commit(&self, metadata: &MessageMetadata) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// InMemoryTransport
// ---------------------------------------------------------------------------

/// A published message retained for introspection.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    /// Partition key.
    pub key: String,
    /// Message payload.
    pub payload: Bytes,
}

/// In-process transport delivering publishes synchronously to subscribers.
#[derive(Default)]
pub struct InMemoryTransport {
    subscribers: RwLock<Vec<MessageHandler>>,
    published: Mutex<Vec<PublishedMessage>>,
    committed: Mutex<Vec<u64>>,
    next_offset: AtomicU64,
    reject: AtomicBool,
}

impl InMemoryTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle publish rejection for failure-path tests.
    pub fn reject_publishes(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// All messages published so far, in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    /// Number of messages published so far.
    pub fn published_count(&self) -> usize {
        self.published.lock().len()
    }

    /// Offsets committed so far.
    pub fn committed_offsets(&self) -> Vec<u64> {
        self.committed.lock().clone()
    }
}

#[async_trait::async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, key: &str, payload: Bytes) -> Result<(), TransportError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("rejecting publishes".to_string()));
        }

        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        self.published.lock().push(PublishedMessage {
            key: key.to_string(),
            payload: payload.clone(),
        });

        let metadata = MessageMetadata {
            key: key.to_string(),
            offset,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let handlers: Vec<MessageHandler> = self.subscribers.read().clone();
        for handler in handlers {
            handler(payload.clone(), metadata.clone());
        }
        Ok(())
    }

    fn subscribe(&self, handler: MessageHandler) {
        self.subscribers.write().push(handler);
    }

    async fn commit(&self, metadata: &MessageMetadata) -> Result<(), TransportError> {
        self.committed.lock().push(metadata.offset);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
