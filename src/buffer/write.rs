//! Write buffer: per-(stream, kind) accumulation and flush.
//!
//! Rows append under a single region mutex per (stream, kind); a flush
//! snapshots and clears the pending rows atomically with respect to
//! concurrent writers, then encodes, splits, and publishes outside the
//! lock. Per-stream emission order is preserved by an async publish lock
//! shared by all flush paths of the stream: every fragment of one flush
//! reaches the transport before the next flush's fragments begin.
//!
//! The time threshold is an epoch-counted timer task: armed only when the
//! first row lands in an idle buffer, disarmed by an epoch bump inside the
//! flush snapshot. A stale timer firing after its epoch is a no-op.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::codec::{self, Frame, Message};
use crate::model::{DataKind, Definition, Row};
use crate::split;
use crate::stats::{notify_drop, ClientStats, DropEvent, SharedDropHook};
use crate::transport::Transport;

use super::{BufferConfig, BufferError, FlushReason};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Emission parameters shared by every buffer of a client.
#[derive(Debug, Clone)]
pub struct WriteBufferOptions {
    /// Maximum payload bytes per transport fragment.
    pub max_fragment_size: usize,
    /// Bounded wait for each publish acknowledgment.
    pub publish_timeout: Duration,
}

impl Default for WriteBufferOptions {
    fn default() -> Self {
        Self {
            max_fragment_size: 1_048_576,
            publish_timeout: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// WriteBuffer
// ---------------------------------------------------------------------------

/// Accumulates rows for one (stream, kind) and flushes them as frames.
#[derive(Clone)]
pub struct WriteBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    stream_id: String,
    kind: DataKind,
    config: BufferConfig,
    options: WriteBufferOptions,
    transport: Arc<dyn Transport>,
    /// Serializes frame emission per stream, shared across kinds and
    /// control messages.
    publish_lock: Arc<AsyncMutex<()>>,
    /// Stream-wide schema generation, shared across kinds.
    generation: Arc<AtomicU32>,
    state: Mutex<Pending>,
    /// Bumped on every flush snapshot; disarms any armed timer.
    epoch: AtomicU64,
    closed: AtomicBool,
    stats: Arc<ClientStats>,
    drop_hook: SharedDropHook,
}

struct Pending {
    rows: Vec<Row>,
    bytes: usize,
    first_at: Option<Instant>,
    definitions: BTreeMap<String, Definition>,
    /// Embed the definition set in the next frame.
    embed_definitions: bool,
}

impl WriteBuffer {
    /// Create an idle buffer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream_id: impl Into<String>,
        kind: DataKind,
        config: BufferConfig,
        mut options: WriteBufferOptions,
        transport: Arc<dyn Transport>,
        publish_lock: Arc<AsyncMutex<()>>,
        generation: Arc<AtomicU32>,
        stats: Arc<ClientStats>,
        drop_hook: SharedDropHook,
    ) -> Self {
        options.max_fragment_size = options.max_fragment_size.max(1);
        Self {
            inner: Arc::new(Inner {
                stream_id: stream_id.into(),
                kind,
                config,
                options,
                transport,
                publish_lock,
                generation,
                state: Mutex::new(Pending {
                    rows: Vec::new(),
                    bytes: 0,
                    first_at: None,
                    definitions: BTreeMap::new(),
                    embed_definitions: true,
                }),
                epoch: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                stats,
                drop_hook,
            }),
        }
    }

    /// Append one row. May trigger a flush if a threshold fires; flush
    /// failures surface here as [`BufferError::TransportRejected`].
    pub async fn write(&self, row: Row) -> Result<(), BufferError> {
        self.write_many(vec![row]).await
    }

    /// Append a batch of rows. The whole batch is validated before any row
    /// is accepted.
    pub async fn write_many(&self, rows: Vec<Row>) -> Result<(), BufferError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BufferError::BufferClosed {
                stream_id: self.inner.stream_id.clone(),
            });
        }

        let fire = {
            let mut state = self.inner.state.lock();
            for row in &rows {
                for name in row.values.keys() {
                    if !state.definitions.contains_key(name) {
                        return Err(BufferError::SchemaConflict {
                            stream_id: self.inner.stream_id.clone(),
                            parameter: name.clone(),
                        });
                    }
                }
            }
            let accepted = rows.len() as u64;
            for row in rows {
                state.bytes += row.size_hint();
                state.rows.push(row);
            }
            ClientStats::bump(&self.inner.stats.rows_written, accepted);

            let fire = self.inner.trigger(&state);
            if fire.is_none() && state.first_at.is_none() {
                state.first_at = Some(Instant::now());
                self.arm_timer();
            }
            fire
        };

        if let Some(reason) = fire {
            self.inner.flush_inner(None, reason).await?;
        }
        Ok(())
    }

    /// Register or update a definition.
    ///
    /// Rows already pending were written under the old schema generation
    /// and are flushed first; a frame never mixes two generations.
    pub async fn add_definition(&self, definition: Definition) -> Result<(), BufferError> {
        debug_assert_eq!(definition.kind, self.inner.kind);
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BufferError::BufferClosed {
                stream_id: self.inner.stream_id.clone(),
            });
        }

        self.inner
            .flush_inner(None, FlushReason::SchemaChange)
            .await?;

        let mut state = self.inner.state.lock();
        state.definitions.insert(definition.name.clone(), definition);
        state.embed_definitions = true;
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Flush all pending rows now.
    pub async fn flush(&self) -> Result<(), BufferError> {
        self.inner.flush_inner(None, FlushReason::Manual).await
    }

    /// Flush pending rows and refuse further writes.
    ///
    /// On a rejected flush the buffer reopens so the caller may retry
    /// after handling the returned rows.
    pub async fn close(&self) -> Result<(), BufferError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.inner.flush_inner(None, FlushReason::Close).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.closed.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Rows currently pending.
    pub fn pending_rows(&self) -> usize {
        self.inner.state.lock().rows.len()
    }

    /// Active definitions, in name order.
    pub fn definitions(&self) -> Vec<Definition> {
        self.inner.state.lock().definitions.values().cloned().collect()
    }

    /// Current schema generation.
    pub fn generation(&self) -> u32 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Arm the flush timer for the rows just accepted. Armed only on the
    /// idle-to-accumulating edge; a flush bumps the epoch and makes any
    /// armed timer a no-op.
    fn arm_timer(&self) {
        let Some(delay) = self.inner.config.max_delay else {
            return;
        };
        let epoch = self.inner.epoch.load(Ordering::Acquire);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.epoch.load(Ordering::Acquire) != epoch {
                return;
            }
            match inner.flush_inner(Some(epoch), FlushReason::Timer).await {
                Ok(()) => {}
                Err(BufferError::TransportRejected {
                    stream_id,
                    rows,
                    reason,
                }) => {
                    tracing::warn!(
                        stream = %stream_id,
                        rows = rows.len(),
                        %reason,
                        "timer flush rejected"
                    );
                    notify_drop(
                        &inner.drop_hook,
                        DropEvent::FlushFailed { stream_id, rows },
                    );
                }
                Err(e) => {
                    tracing::warn!(stream = %inner.stream_id, error = %e, "timer flush failed");
                }
            }
        });
    }
}

impl Inner {
    fn trigger(&self, state: &Pending) -> Option<FlushReason> {
        if let Some(max_rows) = self.config.max_rows {
            if state.rows.len() >= max_rows {
                return Some(FlushReason::RowCount);
            }
        }
        if let Some(max_bytes) = self.config.max_bytes {
            if state.bytes >= max_bytes {
                return Some(FlushReason::ByteSize);
            }
        }
        None
    }

    /// Snapshot-and-clear pending rows, then emit them as one frame.
    ///
    /// `expected_epoch` makes a timer-initiated flush a no-op if any other
    /// flush already snapshotted its rows.
    async fn flush_inner(
        &self,
        expected_epoch: Option<u64>,
        reason: FlushReason,
    ) -> Result<(), BufferError> {
        let _permit = self.publish_lock.lock().await;

        let (rows, generation, definitions) = {
            let mut state = self.state.lock();
            if let Some(epoch) = expected_epoch {
                if self.epoch.load(Ordering::Acquire) != epoch {
                    return Ok(());
                }
            }
            if state.rows.is_empty() {
                return Ok(());
            }
            self.epoch.fetch_add(1, Ordering::AcqRel);
            let rows = std::mem::take(&mut state.rows);
            state.bytes = 0;
            state.first_at = None;
            let definitions = if state.embed_definitions {
                state.embed_definitions = false;
                Some(state.definitions.values().cloned().collect::<Vec<_>>())
            } else {
                None
            };
            (rows, self.generation.load(Ordering::Acquire), definitions)
        };

        let row_count = rows.len();
        let message = Message::Frame(Frame {
            kind: self.kind,
            generation,
            definitions,
            rows,
        });
        let payload = codec::encode(&message);

        let fragments = match split::split(&self.stream_id, payload, self.options.max_fragment_size)
        {
            Ok(fragments) => fragments,
            Err(e) => return Err(self.rejected(message, e.to_string())),
        };

        for fragment in &fragments {
            let encoded = fragment.encode();
            match tokio::time::timeout(
                self.options.publish_timeout,
                self.transport.publish(&self.stream_id, encoded),
            )
            .await
            {
                Ok(Ok(())) => {
                    ClientStats::bump(&self.stats.fragments_published, 1);
                }
                Ok(Err(e)) => return Err(self.rejected(message, e.to_string())),
                Err(_) => {
                    let reason =
                        format!("no acknowledgment within {:?}", self.options.publish_timeout);
                    return Err(self.rejected(message, reason));
                }
            }
        }

        ClientStats::bump(&self.stats.frames_encoded, 1);
        tracing::debug!(
            stream = %self.stream_id,
            kind = ?self.kind,
            rows = row_count,
            fragments = fragments.len(),
            reason = ?reason,
            "flushed frame"
        );
        Ok(())
    }

    /// Turn a failed emission into a `TransportRejected` carrying the
    /// snapshot rows back to the caller. Rows are not re-queued.
    fn rejected(&self, message: Message, reason: String) -> BufferError {
        let (rows, had_definitions) = match message {
            Message::Frame(frame) => (frame.rows, frame.definitions.is_some()),
            _ => (Vec::new(), false),
        };
        if had_definitions {
            // The definition set never reached the transport; embed it in
            // the next frame instead.
            self.state.lock().embed_definitions = true;
        }
        ClientStats::bump(&self.stats.rows_returned, rows.len() as u64);
        BufferError::TransportRejected {
            stream_id: self.stream_id.clone(),
            rows,
            reason,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
