//! Write-side and read-side row buffering.
//!
//! Both sides batch rows under the same [`BufferConfig`] policy: a row
//! count threshold, a byte-size threshold, and a time-since-first-row
//! threshold, evaluated as OR-conditions with the first to fire winning.
//! The producer's flush granularity and a consumer's processing
//! granularity are independent concerns; each side applies its own policy.

mod read;
mod write;

pub use read::{ReadBuffer, RowsCallback};
pub use write::{WriteBuffer, WriteBufferOptions};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::Row;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by the write buffer.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// A row referenced a parameter with no active definition.
    #[error("unknown parameter '{parameter}' on stream '{stream_id}'")]
    SchemaConflict { stream_id: String, parameter: String },

    /// The transport refused a flush; the snapshot rows are handed back to
    /// the caller, which may retry or persist them.
    #[error("transport rejected flush on stream '{stream_id}' ({} rows returned): {reason}", .rows.len())]
    TransportRejected {
        stream_id: String,
        rows: Vec<Row>,
        reason: String,
    },

    /// The buffer was closed and accepts no further writes.
    #[error("buffer for stream '{stream_id}' is closed")]
    BufferClosed { stream_id: String },
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Flush policy for a buffer. Thresholds are OR-conditions; `None`
/// disables a threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Flush once this many rows are pending.
    #[serde(default = "default_max_rows")]
    pub max_rows: Option<usize>,
    /// Flush once the pending size estimate reaches this many bytes.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: Option<usize>,
    /// Flush this long after the first pending row, even with no further
    /// writes. Requires a tokio runtime.
    #[serde(default = "default_max_delay")]
    pub max_delay: Option<Duration>,
}

fn default_max_rows() -> Option<usize> {
    Some(100)
}
fn default_max_bytes() -> Option<usize> {
    Some(256 * 1024)
}
fn default_max_delay() -> Option<Duration> {
    Some(Duration::from_secs(1))
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            max_bytes: default_max_bytes(),
            max_delay: default_max_delay(),
        }
    }
}

impl BufferConfig {
    /// A config with every threshold disabled; flushes are manual only.
    pub fn unbounded() -> Self {
        Self {
            max_rows: None,
            max_bytes: None,
            max_delay: None,
        }
    }

    /// A config flushing on row count alone.
    pub fn rows(max_rows: usize) -> Self {
        Self {
            max_rows: Some(max_rows),
            max_bytes: None,
            max_delay: None,
        }
    }
}

/// Why a flush fired, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Row-count threshold reached.
    RowCount,
    /// Byte-size threshold reached.
    ByteSize,
    /// Time threshold fired.
    Timer,
    /// Caller-requested flush.
    Manual,
    /// Definitions changed; old-generation rows flushed first.
    SchemaChange,
    /// Stream close or shutdown.
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let config = BufferConfig::default();
        assert_eq!(config.max_rows, Some(100));
        assert_eq!(config.max_bytes, Some(256 * 1024));
        assert_eq!(config.max_delay, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = BufferConfig::rows(10);
        let json = serde_json::to_string(&config).unwrap();
        let back: BufferConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_rows, Some(10));
        assert_eq!(back.max_bytes, None);
        assert_eq!(back.max_delay, None);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: BufferConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_rows, Some(100));
    }
}
