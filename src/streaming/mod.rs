//! Client facade: the lifecycle owner for producers and consumers.
//!
//! A [`StreamingClient`] holds the transport handle, the registry of open
//! stream writers, and the consumer-side router. It is the single owner of
//! every per-stream resource; [`StreamingClient::shutdown`] performs the
//! ordered teardown (stop accepting writes, force-flush every open writer
//! with bounded acknowledgment waits, then release consumer state).

mod reader;
mod writer;

pub use reader::StreamReader;
pub use writer::StreamWriter;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::buffer::{BufferConfig, WriteBufferOptions};
use crate::error::{Error, Result};
use crate::model::{StreamCloseType, StreamState};
use crate::router::{RouterConfig, StreamCallback, StreamRouter};
use crate::split::ReassemblyConfig;
use crate::stats::{ClientStats, DropHook, SharedDropHook, StatsSnapshot};
use crate::transport::{MessageHandler, Transport};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Top-level configuration for a [`StreamingClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Flush policy for producer-side buffers.
    #[serde(default)]
    pub write_buffer: BufferConfig,
    /// Re-batching policy for consumer-side buffers.
    #[serde(default)]
    pub read_buffer: BufferConfig,
    /// Retention policy for incomplete message-groups.
    #[serde(default)]
    pub reassembly: ReassemblyConfig,
    /// Maximum payload bytes per transport fragment.
    #[serde(default = "default_max_fragment_size")]
    pub max_fragment_size: usize,
    /// Bounded wait for each publish acknowledgment.
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout: Duration,
}

fn default_max_fragment_size() -> usize {
    1_048_576
}
fn default_publish_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            write_buffer: BufferConfig::default(),
            read_buffer: BufferConfig::default(),
            reassembly: ReassemblyConfig::default(),
            max_fragment_size: default_max_fragment_size(),
            publish_timeout: default_publish_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// StreamingClient
// ---------------------------------------------------------------------------

/// Entry point for producing and consuming telemetry streams over one
/// transport.
pub struct StreamingClient {
    transport: Arc<dyn Transport>,
    config: StreamingConfig,
    writers: DashMap<String, StreamWriter>,
    router: Arc<StreamRouter>,
    stats: Arc<ClientStats>,
    drop_hook: SharedDropHook,
    closed: AtomicBool,
}

impl StreamingClient {
    /// Create a client over the given transport.
    pub fn new(transport: Arc<dyn Transport>, config: StreamingConfig) -> Self {
        let stats = Arc::new(ClientStats::default());
        let drop_hook: SharedDropHook = Arc::new(RwLock::new(None));
        let router = StreamRouter::new(
            transport.clone(),
            RouterConfig {
                read_buffer: config.read_buffer.clone(),
                reassembly: config.reassembly.clone(),
            },
            stats.clone(),
            drop_hook.clone(),
        );
        Self {
            transport,
            config,
            writers: DashMap::new(),
            router,
            stats,
            drop_hook,
            closed: AtomicBool::new(false),
        }
    }

    /// Create a client with default configuration.
    pub fn with_defaults(transport: Arc<dyn Transport>) -> Self {
        Self::new(transport, StreamingConfig::default())
    }

    // ── Producer side ───────────────────────────────────────────────────

    /// Open a stream for writing.
    ///
    /// The id must be unique within the topic; opening an id that is
    /// already open fails with [`Error::DuplicateStream`]. A previously
    /// closed id may be reopened.
    pub fn open_stream(&self, stream_id: impl Into<String>) -> Result<StreamWriter> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ClientClosed);
        }
        let stream_id = stream_id.into();

        match self.writers.entry(stream_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().state() != StreamState::Closed {
                    return Err(Error::DuplicateStream(stream_id));
                }
                let writer = self.make_writer(stream_id);
                occupied.insert(writer.clone());
                Ok(writer)
            }
            Entry::Vacant(vacant) => {
                let writer = self.make_writer(stream_id);
                vacant.insert(writer.clone());
                Ok(writer)
            }
        }
    }

    /// Open a stream under a freshly generated identifier.
    pub fn open_stream_auto(&self) -> Result<StreamWriter> {
        self.open_stream(Uuid::new_v4().to_string())
    }

    /// Number of writers currently registered.
    pub fn open_stream_count(&self) -> usize {
        self.writers.len()
    }

    // ── Consumer side ───────────────────────────────────────────────────

    /// Register the callback fired once per newly received stream.
    pub fn on_stream_received(&self, callback: StreamCallback) {
        self.router.on_stream_received(callback);
    }

    /// Attach the consumer pipeline to the transport. Inbound messages are
    /// demultiplexed to per-stream state from here on.
    pub fn subscribe(&self) {
        let router = self.router.clone();
        self.transport.subscribe(Arc::new(move |payload, metadata| {
            router.handle_message(&payload, metadata);
        }));
    }

    // ── Raw bypass ──────────────────────────────────────────────────────

    /// Publish raw bytes under a key, skipping the frame codec and
    /// splitter. For interop with peers outside this SDK; none of the
    /// framing invariants apply.
    pub async fn publish_raw(&self, key: &str, payload: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ClientClosed);
        }
        self.transport.publish(key, payload).await?;
        Ok(())
    }

    /// Receive raw messages directly from the transport, skipping the
    /// router.
    pub fn on_raw_message(&self, handler: MessageHandler) {
        self.transport.subscribe(handler);
    }

    // ── Observability ───────────────────────────────────────────────────

    /// Snapshot of the client's counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Register the hook fired for every dropped or rejected unit of data.
    pub fn on_data_dropped(&self, hook: DropHook) {
        *self.drop_hook.write() = Some(hook);
    }

    /// Evict stale incomplete message-groups; see [`ReassemblyConfig`].
    pub fn evict_stale_groups(&self) -> usize {
        self.router.evict_stale_groups()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Ordered teardown of every owned resource.
    ///
    /// Stops accepting new streams, closes every open writer (flushing
    /// pending rows with bounded acknowledgment waits), then flushes and
    /// discards consumer-side state. The first writer failure is returned
    /// after all writers were attempted.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(writers = self.writers.len(), "client shutting down");

        let writers: Vec<StreamWriter> = self
            .writers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut first_error = None;
        for writer in writers {
            if writer.state() == StreamState::Closed {
                continue;
            }
            if let Err(e) = writer.close(StreamCloseType::Normal).await {
                tracing::warn!(stream = %writer.stream_id(), error = %e, "close failed during shutdown");
                first_error.get_or_insert(e);
            }
        }
        self.writers.clear();
        self.router.shutdown();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn make_writer(&self, stream_id: String) -> StreamWriter {
        StreamWriter::new(
            stream_id,
            self.config.write_buffer.clone(),
            WriteBufferOptions {
                max_fragment_size: self.config.max_fragment_size,
                publish_timeout: self.config.publish_timeout,
            },
            self.transport.clone(),
            self.stats.clone(),
            self.drop_hook.clone(),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
