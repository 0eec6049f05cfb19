//! Stream context router: demultiplexes inbound messages to per-stream
//! state.
//!
//! Raw transport messages carry a fragment envelope with the stream id.
//! The router looks up or creates the stream's entry (reassembly state,
//! read buffer, context, callbacks), reassembles, decodes, and dispatches.
//! The registry lookup is the only cross-stream synchronization point;
//! everything after it touches per-stream state only, so concurrent
//! arrivals for distinct streams never block each other.
//!
//! Malformed inbound data never escapes the offending stream or group: it
//! is counted, logged, and dropped.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::buffer::{BufferConfig, ReadBuffer};
use crate::codec::{self, Message};
use crate::model::{
    DataKind, Definition, StreamCloseType, StreamContext, StreamProperties, StreamState,
};
use crate::split::{Fragment, Reassembler, ReassemblyConfig};
use crate::stats::{notify_drop, ClientStats, DropEvent, SharedDropHook};
use crate::streaming::StreamReader;
use crate::transport::{MessageMetadata, Transport};

// ---------------------------------------------------------------------------
// Callback types
// ---------------------------------------------------------------------------

/// Invoked when a message for a previously unseen stream arrives.
pub type StreamCallback = Arc<dyn Fn(StreamReader) + Send + Sync>;
/// Invoked when a stream's definition set changes.
pub type DefinitionsCallback = Arc<dyn Fn(DataKind, Vec<Definition>) + Send + Sync>;
/// Invoked when a stream's properties change.
pub type PropertiesCallback = Arc<dyn Fn(StreamProperties) + Send + Sync>;
/// Invoked when a stream closes.
pub type ClosedCallback = Arc<dyn Fn(StreamCloseType) + Send + Sync>;

// ---------------------------------------------------------------------------
// Per-stream entry
// ---------------------------------------------------------------------------

/// Consumer-side state owned by the router for one stream.
pub(crate) struct StreamEntry {
    pub(crate) id: String,
    pub(crate) context: RwLock<StreamContext>,
    pub(crate) read_buffer: ReadBuffer,
    pub(crate) on_definitions: RwLock<Option<DefinitionsCallback>>,
    pub(crate) on_properties: RwLock<Option<PropertiesCallback>>,
    pub(crate) on_closed: RwLock<Option<ClosedCallback>>,
    /// Metadata of the most recent message, for commit passthrough.
    pub(crate) last_metadata: Mutex<Option<MessageMetadata>>,
}

// ---------------------------------------------------------------------------
// StreamRouter
// ---------------------------------------------------------------------------

/// Configuration for the consumer side of a client.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Re-batching policy applied before the rows callback.
    pub read_buffer: BufferConfig,
    /// Retention policy for incomplete message-groups.
    pub reassembly: ReassemblyConfig,
}

/// Demultiplexes inbound fragments to per-stream reassembly and buffering
/// state, creating entries on first sight and tearing them down on close.
pub struct StreamRouter {
    transport: Arc<dyn Transport>,
    config: RouterConfig,
    streams: DashMap<String, Arc<StreamEntry>>,
    reassembler: Reassembler,
    on_stream: RwLock<Option<StreamCallback>>,
    stats: Arc<ClientStats>,
    drop_hook: SharedDropHook,
}

impl StreamRouter {
    /// Create a router with no open streams.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: RouterConfig,
        stats: Arc<ClientStats>,
        drop_hook: SharedDropHook,
    ) -> Arc<Self> {
        let reassembler =
            Reassembler::new(config.reassembly.clone(), stats.clone(), drop_hook.clone());
        Arc::new(Self {
            transport,
            config,
            streams: DashMap::new(),
            reassembler,
            on_stream: RwLock::new(None),
            stats,
            drop_hook,
        })
    }

    /// Register the new-stream callback. It fires synchronously before the
    /// first message of a stream is dispatched, so callbacks registered
    /// inside it see every row.
    pub fn on_stream_received(&self, callback: StreamCallback) {
        *self.on_stream.write() = Some(callback);
    }

    /// Handle one raw transport message.
    pub fn handle_message(&self, payload: &[u8], metadata: MessageMetadata) {
        ClientStats::bump(&self.stats.fragments_received, 1);

        let fragment = match Fragment::decode(payload) {
            Ok(fragment) => fragment,
            Err(e) => {
                self.malformed(None, &e.to_string());
                return;
            }
        };

        let stream_id = fragment.stream_id.clone();
        let entry = self.entry_for(&stream_id);
        *entry.last_metadata.lock() = Some(metadata);

        let completed = match self.reassembler.accept(fragment) {
            Ok(completed) => completed,
            Err(e) => {
                self.malformed(Some(&stream_id), &e.to_string());
                return;
            }
        };
        let Some(payload) = completed else {
            return;
        };

        match codec::decode(&payload) {
            Ok(message) => self.dispatch(&entry, message),
            Err(e) => self.malformed(Some(&stream_id), &e.to_string()),
        }
    }

    /// Number of currently open streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Look up an open stream.
    pub(crate) fn entry(&self, stream_id: &str) -> Option<Arc<StreamEntry>> {
        self.streams.get(stream_id).map(|e| e.value().clone())
    }

    /// Evict stale reassembly groups; see [`ReassemblyConfig`].
    pub fn evict_stale_groups(&self) -> usize {
        self.reassembler.evict_stale()
    }

    /// Tear down every stream without close notifications.
    ///
    /// Pending read-buffer rows are flushed to their callbacks; partial
    /// message-groups are discarded silently, acceptable because shutdown
    /// is caller-initiated.
    pub fn shutdown(&self) {
        let entries: Vec<Arc<StreamEntry>> = self
            .streams
            .iter()
            .map(|e| e.value().clone())
            .collect();
        self.streams.clear();
        self.reassembler.clear();
        for entry in &entries {
            entry.read_buffer.flush();
            entry.context.write().state = StreamState::Closed;
        }
        tracing::info!(streams = entries.len(), "router shut down");
    }

    fn entry_for(&self, stream_id: &str) -> Arc<StreamEntry> {
        if let Some(entry) = self.streams.get(stream_id) {
            return entry.value().clone();
        }

        let entry = Arc::new(StreamEntry {
            id: stream_id.to_string(),
            context: RwLock::new(StreamContext::new(stream_id)),
            read_buffer: ReadBuffer::new(
                stream_id,
                self.config.read_buffer.clone(),
                self.stats.clone(),
            ),
            on_definitions: RwLock::new(None),
            on_properties: RwLock::new(None),
            on_closed: RwLock::new(None),
            last_metadata: Mutex::new(None),
        });

        let created = self
            .streams
            .entry(stream_id.to_string())
            .or_insert_with(|| entry.clone())
            .clone();

        // Fire only for the entry that won the insert race.
        if Arc::ptr_eq(&created, &entry) {
            tracing::debug!(stream = %stream_id, "new stream");
            let callback = self.on_stream.read().clone();
            if let Some(callback) = callback {
                callback(StreamReader::new(created.clone(), self.transport.clone()));
            }
        }
        created
    }

    fn dispatch(&self, entry: &Arc<StreamEntry>, message: Message) {
        match message {
            Message::Frame(frame) => {
                ClientStats::bump(&self.stats.frames_decoded, 1);
                if let Some(defs) = frame.definitions {
                    let changed = {
                        let mut context = entry.context.write();
                        let changed = context.generation != frame.generation
                            || context.definitions_of(frame.kind) != defs;
                        context.generation = frame.generation;
                        context.replace_definitions(frame.kind, &defs);
                        changed
                    };
                    if changed {
                        let callback = entry.on_definitions.read().clone();
                        if let Some(callback) = callback {
                            callback(frame.kind, defs);
                        }
                    }
                } else {
                    entry.context.write().generation = frame.generation;
                }
                entry.read_buffer.push_batch(frame.rows);
            }
            Message::Properties(properties) => {
                entry.context.write().properties = properties.clone();
                let callback = entry.on_properties.read().clone();
                if let Some(callback) = callback {
                    callback(properties);
                }
            }
            Message::StreamClosed(close_type) => {
                self.close_stream(&entry.id, close_type);
            }
        }
    }

    /// Flush and remove one stream's state, then notify the application.
    fn close_stream(&self, stream_id: &str, close_type: StreamCloseType) {
        let Some((_, entry)) = self.streams.remove(stream_id) else {
            return;
        };
        entry.read_buffer.flush();
        self.reassembler.discard_stream(stream_id);
        entry.context.write().state = StreamState::Closed;
        tracing::debug!(stream = %stream_id, close_type = ?close_type, "stream closed");

        let callback = entry.on_closed.read().clone();
        if let Some(callback) = callback {
            callback(close_type);
        }
    }

    fn malformed(&self, stream_id: Option<&str>, reason: &str) {
        ClientStats::bump(&self.stats.malformed_messages, 1);
        tracing::warn!(stream = stream_id.unwrap_or("<unknown>"), %reason, "dropped malformed message");
        notify_drop(
            &self.drop_hook,
            DropEvent::MalformedMessage {
                stream_id: stream_id.map(str::to_string),
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Frame;
    use crate::model::Row;
    use crate::split;
    use crate::transport::InMemoryTransport;
    use bytes::Bytes;

    fn router(read_buffer: BufferConfig) -> Arc<StreamRouter> {
        StreamRouter::new(
            Arc::new(InMemoryTransport::new()),
            RouterConfig {
                read_buffer,
                reassembly: ReassemblyConfig::default(),
            },
            Arc::new(ClientStats::default()),
            Arc::new(RwLock::new(None)),
        )
    }

    fn metadata() -> MessageMetadata {
        MessageMetadata {
            key: "s".to_string(),
            offset: 0,
            timestamp: 0,
        }
    }

    fn frame_message(stream_id: &str, rows: Vec<Row>) -> Vec<Bytes> {
        let payload = codec::encode(&Message::Frame(Frame {
            kind: DataKind::Parameters,
            generation: 1,
            definitions: None,
            rows,
        }));
        split::split(stream_id, payload, 1_048_576)
            .unwrap()
            .iter()
            .map(Fragment::encode)
            .collect()
    }

    #[test]
    fn test_stream_created_on_first_sight() {
        let router = router(BufferConfig::rows(1));
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        router.on_stream_received(Arc::new(move |reader| {
            seen2.lock().push(reader.stream_id().to_string());
        }));

        for message in frame_message("car-7", vec![Row::at(1)]) {
            router.handle_message(&message, metadata());
        }
        for message in frame_message("car-7", vec![Row::at(2)]) {
            router.handle_message(&message, metadata());
        }

        assert_eq!(*seen.lock(), vec!["car-7".to_string()]);
        assert_eq!(router.stream_count(), 1);
    }

    #[test]
    fn test_rows_reach_reader_callback() {
        let router = router(BufferConfig::rows(1));
        let delivered: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let delivered2 = delivered.clone();
        router.on_stream_received(Arc::new(move |reader| {
            let sink = delivered2.clone();
            reader.on_rows_received(Arc::new(move |rows| {
                sink.lock().extend(rows.iter().map(|r| r.timestamp));
            }));
        }));

        for message in frame_message("s", vec![Row::at(1), Row::at(2)]) {
            router.handle_message(&message, metadata());
        }
        assert_eq!(*delivered.lock(), vec![1, 2]);
    }

    #[test]
    fn test_close_tears_down_and_notifies() {
        let router = router(BufferConfig::unbounded());
        let closed: Arc<Mutex<Vec<StreamCloseType>>> = Arc::new(Mutex::new(Vec::new()));
        let closed2 = closed.clone();
        let delivered: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let delivered2 = delivered.clone();
        router.on_stream_received(Arc::new(move |reader| {
            let closed = closed2.clone();
            reader.on_stream_closed(Arc::new(move |close_type| {
                closed.lock().push(close_type);
            }));
            let delivered = delivered2.clone();
            reader.on_rows_received(Arc::new(move |rows| {
                *delivered.lock() += rows.len();
            }));
        }));

        for message in frame_message("s", vec![Row::at(1), Row::at(2), Row::at(3)]) {
            router.handle_message(&message, metadata());
        }
        // Unbounded policy: rows are still pending in the read buffer.
        assert_eq!(*delivered.lock(), 0);

        let close = codec::encode(&Message::StreamClosed(StreamCloseType::Aborted));
        for fragment in split::split("s", close, 1_048_576).unwrap() {
            router.handle_message(&fragment.encode(), metadata());
        }

        // Close flushed the read buffer before notifying.
        assert_eq!(*delivered.lock(), 3);
        assert_eq!(*closed.lock(), vec![StreamCloseType::Aborted]);
        assert_eq!(router.stream_count(), 0);
    }

    #[test]
    fn test_malformed_message_is_isolated() {
        let stats = Arc::new(ClientStats::default());
        let router = StreamRouter::new(
            Arc::new(InMemoryTransport::new()),
            RouterConfig {
                read_buffer: BufferConfig::rows(1),
                reassembly: ReassemblyConfig::default(),
            },
            stats.clone(),
            Arc::new(RwLock::new(None)),
        );

        router.handle_message(b"garbage", metadata());
        assert_eq!(stats.snapshot().malformed_messages, 1);
        assert_eq!(router.stream_count(), 0);

        // A valid fragment envelope with a garbage frame payload is
        // isolated to its stream, which stays open.
        let fragment = split::split("s", Bytes::from_static(b"not a frame"), 1_048_576)
            .unwrap()
            .remove(0);
        router.handle_message(&fragment.encode(), metadata());
        assert_eq!(stats.snapshot().malformed_messages, 2);
        assert_eq!(router.stream_count(), 1);

        // The stream still processes valid frames afterwards.
        for message in frame_message("s", vec![Row::at(1)]) {
            router.handle_message(&message, metadata());
        }
        assert_eq!(stats.snapshot().frames_decoded, 1);
    }

    #[test]
    fn test_definitions_callback_fires_on_change() {
        let router = router(BufferConfig::rows(1));
        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        router.on_stream_received(Arc::new(move |reader| {
            let sink = seen2.clone();
            reader.on_definitions_changed(Arc::new(move |_kind, defs| {
                sink.lock().push(defs.len());
            }));
        }));

        let send_frame = |generation: u32, defs: Option<Vec<Definition>>| {
            let payload = codec::encode(&Message::Frame(Frame {
                kind: DataKind::Parameters,
                generation,
                definitions: defs,
                rows: vec![Row::at(0)],
            }));
            for fragment in split::split("s", payload, 1_048_576).unwrap() {
                router.handle_message(&fragment.encode(), metadata());
            }
        };

        send_frame(1, Some(vec![Definition::parameter("speed")]));
        send_frame(1, None);
        send_frame(
            2,
            Some(vec![
                Definition::parameter("speed"),
                Definition::parameter("rpm"),
            ]),
        );

        assert_eq!(*seen.lock(), vec![1, 2]);
        let entry = router.entry("s").unwrap();
        assert_eq!(entry.context.read().generation, 2);
        assert_eq!(entry.context.read().definitions.len(), 2);
    }

    #[test]
    fn test_properties_update_context() {
        let router = router(BufferConfig::rows(1));
        let props = StreamProperties {
            name: Some("car 7".to_string()),
            ..StreamProperties::default()
        };
        let payload = codec::encode(&Message::Properties(props.clone()));
        for fragment in split::split("s", payload, 1_048_576).unwrap() {
            router.handle_message(&fragment.encode(), metadata());
        }

        let entry = router.entry("s").unwrap();
        assert_eq!(entry.context.read().properties, props);
    }

    #[test]
    fn test_shutdown_flushes_and_clears() {
        let router = router(BufferConfig::unbounded());
        let delivered: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let delivered2 = delivered.clone();
        router.on_stream_received(Arc::new(move |reader| {
            let sink = delivered2.clone();
            reader.on_rows_received(Arc::new(move |rows| {
                *sink.lock() += rows.len();
            }));
        }));

        for message in frame_message("a", vec![Row::at(1)]) {
            router.handle_message(&message, metadata());
        }
        for message in frame_message("b", vec![Row::at(2), Row::at(3)]) {
            router.handle_message(&message, metadata());
        }

        router.shutdown();
        assert_eq!(*delivered.lock(), 3);
        assert_eq!(router.stream_count(), 0);
    }
}
