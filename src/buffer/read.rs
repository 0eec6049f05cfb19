//! Read buffer: consumer-side re-batching of decoded rows.
//!
//! Decoded frames arrive in whatever granularity the producer flushed.
//! The read buffer re-chunks them under the consumer's own policy before
//! invoking the rows callback, so one consumer can take rows one at a time
//! while another batches thousands, from the same broker messages.
//!
//! Rows are delivered in arrival order; the buffer never reorders across
//! its own flush boundaries and does not hide producer timestamp disorder.
//! Rows are held until a callback is registered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::model::Row;
use crate::stats::ClientStats;

use super::BufferConfig;

/// Callback receiving re-batched rows.
pub type RowsCallback = Arc<dyn Fn(Vec<Row>) + Send + Sync>;

/// Accumulates decoded rows for one stream and delivers them in
/// consumer-sized batches.
#[derive(Clone)]
pub struct ReadBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    stream_id: String,
    config: BufferConfig,
    state: Mutex<Pending>,
    /// Bumped whenever pending rows drain; disarms any armed timer.
    epoch: AtomicU64,
    callback: RwLock<Option<RowsCallback>>,
    stats: Arc<ClientStats>,
}

struct Pending {
    rows: Vec<Row>,
    bytes: usize,
    first_at: Option<Instant>,
}

impl ReadBuffer {
    /// Create an empty read buffer.
    pub fn new(stream_id: impl Into<String>, config: BufferConfig, stats: Arc<ClientStats>) -> Self {
        Self {
            inner: Arc::new(Inner {
                stream_id: stream_id.into(),
                config,
                state: Mutex::new(Pending {
                    rows: Vec::new(),
                    bytes: 0,
                    first_at: None,
                }),
                epoch: AtomicU64::new(0),
                callback: RwLock::new(None),
                stats,
            }),
        }
    }

    /// Register the rows callback. Pending rows are delivered on the next
    /// push or flush.
    pub fn on_rows(&self, callback: RowsCallback) {
        *self.inner.callback.write() = Some(callback);
    }

    /// Accept a decoded batch, delivering any chunks that complete a
    /// threshold.
    pub fn push_batch(&self, batch: Vec<Row>) {
        let Some(callback) = self.inner.callback.read().clone() else {
            // No consumer yet; hold the rows.
            let mut state = self.inner.state.lock();
            for row in batch {
                state.bytes += row.size_hint();
                state.rows.push(row);
            }
            return;
        };

        let chunks = {
            let mut state = self.inner.state.lock();
            let mut chunks: Vec<Vec<Row>> = Vec::new();
            for row in batch {
                state.bytes += row.size_hint();
                state.rows.push(row);
                if self.inner.threshold_reached(&state) {
                    chunks.push(std::mem::take(&mut state.rows));
                    state.bytes = 0;
                }
            }
            if !chunks.is_empty() {
                self.inner.epoch.fetch_add(1, Ordering::AcqRel);
                state.first_at = None;
            }
            if !state.rows.is_empty() && state.first_at.is_none() {
                state.first_at = Some(Instant::now());
                self.arm_timer();
            }
            chunks
        };

        for chunk in chunks {
            ClientStats::bump(&self.inner.stats.rows_delivered, chunk.len() as u64);
            callback(chunk);
        }
    }

    /// Deliver all pending rows now, regardless of thresholds.
    ///
    /// With no callback registered the pending rows are discarded; flush
    /// is only invoked on caller-initiated close and shutdown.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Rows currently pending.
    pub fn pending_rows(&self) -> usize {
        self.inner.state.lock().rows.len()
    }

    fn arm_timer(&self) {
        let Some(delay) = self.inner.config.max_delay else {
            return;
        };
        // The time threshold needs a runtime; without one only the count
        // and size thresholds apply.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let epoch = self.inner.epoch.load(Ordering::Acquire);
        let inner = self.inner.clone();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.epoch.load(Ordering::Acquire) == epoch {
                inner.flush();
            }
        });
    }
}

impl Inner {
    fn threshold_reached(&self, state: &Pending) -> bool {
        if let Some(max_rows) = self.config.max_rows {
            if state.rows.len() >= max_rows {
                return true;
            }
        }
        if let Some(max_bytes) = self.config.max_bytes {
            if state.bytes >= max_bytes {
                return true;
            }
        }
        false
    }

    fn flush(&self) {
        let (rows, callback) = {
            let mut state = self.state.lock();
            if state.rows.is_empty() {
                return;
            }
            self.epoch.fetch_add(1, Ordering::AcqRel);
            state.bytes = 0;
            state.first_at = None;
            (std::mem::take(&mut state.rows), self.callback.read().clone())
        };

        match callback {
            Some(callback) => {
                ClientStats::bump(&self.stats.rows_delivered, rows.len() as u64);
                callback(rows);
            }
            None => {
                tracing::debug!(
                    stream = %self.stream_id,
                    rows = rows.len(),
                    "flushed read buffer with no rows callback"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn collected(buffer: &ReadBuffer) -> Arc<Mutex<Vec<Vec<i64>>>> {
        let batches: Arc<Mutex<Vec<Vec<i64>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        buffer.on_rows(Arc::new(move |rows| {
            sink.lock().push(rows.iter().map(|r| r.timestamp).collect());
        }));
        batches
    }

    fn rows(range: std::ops::Range<i64>) -> Vec<Row> {
        range.map(Row::at).collect()
    }

    #[test]
    fn test_rechunks_large_batch() {
        let buffer = ReadBuffer::new(
            "s",
            BufferConfig::rows(10),
            Arc::new(ClientStats::default()),
        );
        let batches = collected(&buffer);

        buffer.push_batch(rows(0..25));
        assert_eq!(buffer.pending_rows(), 5);
        buffer.flush();

        let batches = batches.lock();
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[test]
    fn test_single_row_batches() {
        let buffer = ReadBuffer::new(
            "s",
            BufferConfig::rows(1),
            Arc::new(ClientStats::default()),
        );
        let batches = collected(&buffer);

        buffer.push_batch(rows(0..5));
        assert_eq!(batches.lock().len(), 5);
        assert_eq!(buffer.pending_rows(), 0);
    }

    #[test]
    fn test_arrival_order_preserved() {
        let buffer = ReadBuffer::new(
            "s",
            BufferConfig::rows(2),
            Arc::new(ClientStats::default()),
        );
        let batches = collected(&buffer);

        // Producer emitted out-of-order timestamps; the buffer must not
        // hide that.
        buffer.push_batch(vec![Row::at(5), Row::at(3), Row::at(9), Row::at(1)]);

        let batches = batches.lock();
        assert_eq!(*batches, vec![vec![5, 3], vec![9, 1]]);
    }

    #[test]
    fn test_rows_held_until_callback_registered() {
        let buffer = ReadBuffer::new(
            "s",
            BufferConfig::rows(1),
            Arc::new(ClientStats::default()),
        );
        buffer.push_batch(rows(0..3));
        assert_eq!(buffer.pending_rows(), 3);

        let batches = collected(&buffer);
        buffer.push_batch(rows(3..4));
        // All four rows drain once the callback exists.
        assert_eq!(buffer.pending_rows(), 0);
        let total: usize = batches.lock().iter().map(Vec::len).sum();
        assert_eq!(total, 4);
    }

    #[tokio::test]
    async fn test_time_threshold_delivers() {
        let buffer = ReadBuffer::new(
            "s",
            BufferConfig {
                max_rows: None,
                max_bytes: None,
                max_delay: Some(std::time::Duration::from_millis(50)),
            },
            Arc::new(ClientStats::default()),
        );
        let batches = collected(&buffer);

        buffer.push_batch(rows(0..2));
        assert_eq!(batches.lock().len(), 0);

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert_eq!(*batches.lock(), vec![vec![0, 1]]);
    }

    #[test]
    fn test_flush_without_callback_discards() {
        let stats = Arc::new(ClientStats::default());
        let buffer = ReadBuffer::new("s", BufferConfig::rows(10), stats.clone());
        buffer.push_batch(rows(0..3));
        buffer.flush();
        assert_eq!(buffer.pending_rows(), 0);
        assert_eq!(stats.snapshot().rows_delivered, 0);
    }
}
