//! Stream context: properties, lifecycle state, and close semantics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{DataKind, Definition};

/// Descriptive properties of a stream, replicated to consumers as a
/// control message whenever they change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamProperties {
    /// Display name.
    pub name: Option<String>,
    /// Physical or logical location of the source.
    pub location: Option<String>,
    /// Free-form metadata.
    pub metadata: BTreeMap<String, String>,
    /// Identifiers of parent streams this stream derives from.
    pub parents: Vec<String>,
    /// Original recording time in nanoseconds, for replayed data.
    pub time_of_recording: Option<i64>,
}

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    Open,
    Closing,
    Closed,
}

/// How a stream was closed, carried in the close control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamCloseType {
    /// Clean close; all buffered data was flushed.
    Normal,
    /// The producer abandoned the stream.
    Aborted,
    /// The producing process terminated.
    Terminated,
}

impl Default for StreamCloseType {
    fn default() -> Self {
        Self::Normal
    }
}

/// Consumer-side view of one stream: identity, properties, active
/// definitions, and lifecycle state.
#[derive(Debug, Clone)]
pub struct StreamContext {
    /// Stream identifier, unique within a topic.
    pub stream_id: String,
    /// Last received properties snapshot.
    pub properties: StreamProperties,
    /// Last observed schema generation.
    pub generation: u32,
    /// Active definitions by name, across both kinds.
    pub definitions: BTreeMap<String, Definition>,
    /// Lifecycle state.
    pub state: StreamState,
}

impl StreamContext {
    /// Create a fresh open context for a newly seen stream.
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            properties: StreamProperties::default(),
            generation: 0,
            definitions: BTreeMap::new(),
            state: StreamState::Open,
        }
    }

    /// Replace the active definitions of one kind, keeping the other kind's
    /// definitions untouched.
    pub fn replace_definitions(&mut self, kind: DataKind, defs: &[Definition]) {
        self.definitions.retain(|_, d| d.kind != kind);
        for def in defs {
            self.definitions.insert(def.name.clone(), def.clone());
        }
    }

    /// Definitions of the given kind, in name order.
    pub fn definitions_of(&self, kind: DataKind) -> Vec<Definition> {
        self.definitions
            .values()
            .filter(|d| d.kind == kind)
            .cloned()
            .collect()
    }
}
