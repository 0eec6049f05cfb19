//! Producer-side handle for one open stream.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::buffer::{BufferConfig, WriteBuffer, WriteBufferOptions};
use crate::codec::{self, Message};
use crate::error::{Error, Result};
use crate::model::{
    DataKind, Definition, Row, StreamCloseType, StreamProperties, StreamState,
};
use crate::split;
use crate::stats::{ClientStats, SharedDropHook};
use crate::transport::Transport;

/// Handle to one stream on the produce side.
///
/// Parameter and event rows are buffered independently; properties and
/// close notifications are published as control messages. All emission
/// for the stream is serialized, so frames and control messages reach the
/// transport in the order they were produced.
#[derive(Clone)]
pub struct StreamWriter {
    inner: Arc<WriterInner>,
}

struct WriterInner {
    stream_id: String,
    transport: Arc<dyn Transport>,
    /// Serializes every publish of this stream.
    publish_lock: Arc<AsyncMutex<()>>,
    options: WriteBufferOptions,
    parameters: WriteBuffer,
    events: WriteBuffer,
    properties: Mutex<StreamProperties>,
    state: Mutex<StreamState>,
    stats: Arc<ClientStats>,
}

impl StreamWriter {
    pub(crate) fn new(
        stream_id: String,
        buffer_config: BufferConfig,
        options: WriteBufferOptions,
        transport: Arc<dyn Transport>,
        stats: Arc<ClientStats>,
        drop_hook: SharedDropHook,
    ) -> Self {
        let publish_lock = Arc::new(AsyncMutex::new(()));
        let generation = Arc::new(AtomicU32::new(0));
        let parameters = WriteBuffer::new(
            stream_id.clone(),
            DataKind::Parameters,
            buffer_config.clone(),
            options.clone(),
            transport.clone(),
            publish_lock.clone(),
            generation.clone(),
            stats.clone(),
            drop_hook.clone(),
        );
        let events = WriteBuffer::new(
            stream_id.clone(),
            DataKind::Events,
            buffer_config,
            options.clone(),
            transport.clone(),
            publish_lock.clone(),
            generation,
            stats.clone(),
            drop_hook,
        );
        Self {
            inner: Arc::new(WriterInner {
                stream_id,
                transport,
                publish_lock,
                options,
                parameters,
                events,
                properties: Mutex::new(StreamProperties::default()),
                state: Mutex::new(StreamState::Open),
                stats,
            }),
        }
    }

    /// Stream identifier.
    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    /// Lifecycle state.
    pub fn state(&self) -> StreamState {
        *self.inner.state.lock()
    }

    /// Current properties snapshot.
    pub fn properties(&self) -> StreamProperties {
        self.inner.properties.lock().clone()
    }

    /// Set the display name and publish the properties snapshot.
    pub async fn set_name(&self, name: impl Into<String>) -> Result<()> {
        self.update_properties(|p| p.name = Some(name.into())).await
    }

    /// Set the source location and publish the properties snapshot.
    pub async fn set_location(&self, location: impl Into<String>) -> Result<()> {
        self.update_properties(|p| p.location = Some(location.into()))
            .await
    }

    /// Set one metadata entry and publish the properties snapshot.
    pub async fn set_property(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        self.update_properties(|p| {
            p.metadata.insert(key.into(), value.into());
        })
        .await
    }

    /// Record a parent stream and publish the properties snapshot.
    pub async fn add_parent(&self, parent_id: impl Into<String>) -> Result<()> {
        self.update_properties(|p| p.parents.push(parent_id.into()))
            .await
    }

    /// Replace the whole properties snapshot and publish it.
    pub async fn set_properties(&self, properties: StreamProperties) -> Result<()> {
        self.update_properties(|p| *p = properties).await
    }

    /// Register or update a parameter or event definition.
    ///
    /// Pending rows of the affected kind are flushed under the old schema
    /// generation first.
    pub async fn add_definition(&self, definition: Definition) -> Result<()> {
        self.ensure_open()?;
        let buffer = match definition.kind {
            DataKind::Parameters => &self.inner.parameters,
            DataKind::Events => &self.inner.events,
        };
        buffer.add_definition(definition).await?;
        Ok(())
    }

    /// Write one parameter row.
    pub async fn write(&self, row: Row) -> Result<()> {
        self.ensure_open()?;
        self.inner.parameters.write(row).await?;
        Ok(())
    }

    /// Write one event row.
    pub async fn write_event(&self, row: Row) -> Result<()> {
        self.ensure_open()?;
        self.inner.events.write(row).await?;
        Ok(())
    }

    /// Write a batch of parameter rows.
    pub async fn write_many(&self, rows: Vec<Row>) -> Result<()> {
        self.ensure_open()?;
        self.inner.parameters.write_many(rows).await?;
        Ok(())
    }

    /// Flush all pending rows of both kinds.
    pub async fn flush(&self) -> Result<()> {
        self.inner.parameters.flush().await?;
        self.inner.events.flush().await?;
        Ok(())
    }

    /// Flush pending rows, publish the close notification, and close the
    /// stream.
    ///
    /// Blocks until every emission is acknowledged. A rejected flush
    /// reopens the stream and hands the pending rows back through
    /// [`BufferError::TransportRejected`](crate::buffer::BufferError); the
    /// caller may retry the close after handling them.
    pub async fn close(&self, close_type: StreamCloseType) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state == StreamState::Closed {
                return Err(Error::StreamClosed(self.inner.stream_id.clone()));
            }
            *state = StreamState::Closing;
        }

        if let Err(e) = self.inner.parameters.close().await {
            *self.inner.state.lock() = StreamState::Open;
            return Err(e.into());
        }
        if let Err(e) = self.inner.events.close().await {
            *self.inner.state.lock() = StreamState::Open;
            return Err(e.into());
        }

        self.publish_control(&Message::StreamClosed(close_type))
            .await?;
        *self.inner.state.lock() = StreamState::Closed;
        tracing::debug!(stream = %self.inner.stream_id, close_type = ?close_type, "stream closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        match *self.inner.state.lock() {
            StreamState::Open => Ok(()),
            _ => Err(Error::StreamClosed(self.inner.stream_id.clone())),
        }
    }

    async fn update_properties(&self, mutate: impl FnOnce(&mut StreamProperties)) -> Result<()> {
        self.ensure_open()?;
        let snapshot = {
            let mut properties = self.inner.properties.lock();
            mutate(&mut properties);
            properties.clone()
        };
        self.publish_control(&Message::Properties(snapshot)).await
    }

    /// Publish one control message under the stream's emission lock.
    async fn publish_control(&self, message: &Message) -> Result<()> {
        let payload = codec::encode(message);
        let fragments = split::split(
            &self.inner.stream_id,
            payload,
            self.inner.options.max_fragment_size,
        )?;

        let _permit = self.inner.publish_lock.lock().await;
        for fragment in fragments {
            match tokio::time::timeout(
                self.inner.options.publish_timeout,
                self.inner
                    .transport
                    .publish(&self.inner.stream_id, fragment.encode()),
            )
            .await
            {
                Ok(Ok(())) => {
                    ClientStats::bump(&self.inner.stats.fragments_published, 1);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(crate::transport::TransportError::Timeout(
                        self.inner.options.publish_timeout,
                    )
                    .into())
                }
            }
        }
        Ok(())
    }
}
