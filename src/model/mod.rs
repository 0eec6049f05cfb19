//! Core data model: rows, values, definitions, and stream context.
//!
//! A [`Row`] is one timestamped set of parameter values plus tags. Rows are
//! built with the consuming builder methods and treated as immutable once
//! committed to a buffer. [`Definition`]s describe the parameters and events
//! a stream may carry; the active definition set is versioned per stream as
//! a *schema generation*.

mod context;
mod definition;

pub use context::{StreamCloseType, StreamContext, StreamProperties, StreamState};
pub use definition::{Definition, Level};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// DataKind
// ---------------------------------------------------------------------------

/// Distinguishes the two independent row channels of a stream.
///
/// Parameters and events are buffered, framed, and flushed separately; a
/// frame carries rows of exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataKind {
    /// Periodic timeseries values.
    Parameters,
    /// Sporadic occurrences with a severity level.
    Events,
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A single typed telemetry value.
///
/// Absence of a parameter in a row is expressed by the parameter simply not
/// being present in the row's value map — there is no null variant, so an
/// absent value is always distinguishable from `0.0` or an empty string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Numeric value with exact double-precision semantics.
    Float(f64),
    /// UTF-8 string value.
    Text(String),
    /// Opaque binary value.
    Blob(Vec<u8>),
}

impl Value {
    /// Approximate encoded size in bytes, used for buffer accounting.
    pub fn size_hint(&self) -> usize {
        match self {
            Value::Float(_) => 8,
            Value::Text(s) => 5 + s.len(),
            Value::Blob(b) => 5 + b.len(),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

// ---------------------------------------------------------------------------
// Row
// ---------------------------------------------------------------------------

/// One timestamped set of parameter values and tags.
///
/// Timestamps are nanosecond-resolution integers, monotonic only within a
/// stream. Construction is builder-style:
///
/// ```
/// use siderite::model::Row;
///
/// let row = Row::at(1_700_000_000_000_000_000)
///     .value("speed", 212.4)
///     .value("gear", "S5")
///     .tag("driver", "axel");
/// assert_eq!(row.values.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Timestamp in nanoseconds.
    pub timestamp: i64,
    /// Parameter name → value. Absent parameters are simply not present.
    pub values: BTreeMap<String, Value>,
    /// Tag name → tag value.
    pub tags: BTreeMap<String, String>,
}

impl Row {
    /// Create an empty row at the given nanosecond timestamp.
    pub fn at(timestamp: i64) -> Self {
        Self {
            timestamp,
            values: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }

    /// Create an empty row stamped with the current wall-clock time.
    pub fn now() -> Self {
        let ts = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX);
        Self::at(ts)
    }

    /// Add a parameter value.
    pub fn value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Add a tag.
    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(name.into(), value.into());
        self
    }

    /// Approximate encoded size in bytes, used by the write buffer's
    /// byte-size flush threshold.
    pub fn size_hint(&self) -> usize {
        let values: usize = self
            .values
            .iter()
            .map(|(k, v)| 3 + k.len() + v.size_hint())
            .sum();
        let tags: usize = self.tags.iter().map(|(k, v)| 4 + k.len() + v.len()).sum();
        8 + 8 + values + tags
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_builder() {
        let row = Row::at(42)
            .value("a", 1.5)
            .value("b", "text")
            .value("c", vec![1u8, 2, 3])
            .tag("source", "test");

        assert_eq!(row.timestamp, 42);
        assert_eq!(row.values.get("a"), Some(&Value::Float(1.5)));
        assert_eq!(row.values.get("b"), Some(&Value::Text("text".to_string())));
        assert_eq!(row.values.get("c"), Some(&Value::Blob(vec![1, 2, 3])));
        assert_eq!(row.tags.get("source"), Some(&"test".to_string()));
    }

    #[test]
    fn test_absent_value_distinguishable_from_zero() {
        let with_zero = Row::at(0).value("a", 0.0);
        let without = Row::at(0);
        assert_ne!(with_zero, without);
        assert!(without.values.get("a").is_none());
    }

    #[test]
    fn test_row_now_is_recent() {
        let row = Row::now();
        // Sanity: after 2020-01-01 in nanoseconds.
        assert!(row.timestamp > 1_577_836_800_000_000_000);
    }

    #[test]
    fn test_size_hint_grows_with_content() {
        let small = Row::at(0).value("a", 1.0);
        let large = Row::at(0).value("a", 1.0).value("blob", vec![0u8; 1024]);
        assert!(large.size_hint() > small.size_hint() + 1024);
    }
}
