//! Consumer-side handle for one received stream.

use std::sync::Arc;

use crate::buffer::RowsCallback;
use crate::model::{
    DataKind, Definition, StreamContext, StreamProperties, StreamState,
};
use crate::router::{ClosedCallback, DefinitionsCallback, PropertiesCallback, StreamEntry};
use crate::transport::{Transport, TransportError};

/// Handle to one stream on the consume side.
///
/// Obtained through the client's stream-received callback. Callbacks
/// registered here fire on the transport's delivery thread; keep them
/// short or hand the batch off to your own executor.
#[derive(Clone)]
pub struct StreamReader {
    entry: Arc<StreamEntry>,
    transport: Arc<dyn Transport>,
}

impl StreamReader {
    pub(crate) fn new(entry: Arc<StreamEntry>, transport: Arc<dyn Transport>) -> Self {
        Self { entry, transport }
    }

    /// Stream identifier.
    pub fn stream_id(&self) -> &str {
        &self.entry.id
    }

    /// Snapshot of the stream's context.
    pub fn context(&self) -> StreamContext {
        self.entry.context.read().clone()
    }

    /// Last received properties.
    pub fn properties(&self) -> StreamProperties {
        self.entry.context.read().properties.clone()
    }

    /// Active definitions of one kind, in name order.
    pub fn definitions(&self, kind: DataKind) -> Vec<Definition> {
        self.entry.context.read().definitions_of(kind)
    }

    /// Lifecycle state.
    pub fn state(&self) -> StreamState {
        self.entry.context.read().state
    }

    /// Register the rows callback. Batch sizes follow the consumer's
    /// read-buffer policy, not the producer's flush granularity.
    pub fn on_rows_received(&self, callback: RowsCallback) {
        self.entry.read_buffer.on_rows(callback);
    }

    /// Register the definitions-changed callback.
    pub fn on_definitions_changed(&self, callback: DefinitionsCallback) {
        *self.entry.on_definitions.write() = Some(callback);
    }

    /// Register the properties-changed callback.
    pub fn on_properties_changed(&self, callback: PropertiesCallback) {
        *self.entry.on_properties.write() = Some(callback);
    }

    /// Register the stream-closed callback.
    pub fn on_stream_closed(&self, callback: ClosedCallback) {
        *self.entry.on_closed.write() = Some(callback);
    }

    /// Commit the position of the most recently delivered message to the
    /// checkpoint collaborator. A no-op before the first delivery.
    pub async fn commit(&self) -> Result<(), TransportError> {
        let metadata = self.entry.last_metadata.lock().clone();
        match metadata {
            Some(metadata) => self.transport.commit(&metadata).await,
            None => Ok(()),
        }
    }
}
