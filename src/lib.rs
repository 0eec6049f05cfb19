#![forbid(unsafe_code)]
//! # siderite — telemetry streaming over partitioned log brokers
//!
//! A client-side streaming layer that lets producers emit time-indexed,
//! multi-parameter telemetry rows as logical *streams* multiplexed over
//! broker topics, and lets consumers receive those streams back as
//! reconstructed, ordered row batches with attached context.
//!
//! ## Features
//!
//! - **Write buffering** — rows batch per stream under count, size, and
//!   time thresholds, flushing into self-describing binary frames
//! - **Transparent splitting** — frames larger than the transport's
//!   message size fragment on write and reassemble losslessly on read,
//!   tolerating out-of-order and interleaved delivery
//! - **Read re-batching** — consumers pick their own batch granularity,
//!   independent of the producer's flush policy
//! - **Schema generations** — parameter and event definitions version per
//!   stream; a frame never mixes two generations
//! - **No silent gaps** — every dropped or rejected unit of data bumps a
//!   counter and can fire a drop hook
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use siderite::{Definition, Row, StreamCloseType, StreamingClient};
//! use siderite::transport::InMemoryTransport;
//!
//! #[tokio::main]
//! async fn main() -> siderite::Result<()> {
//!     let transport = Arc::new(InMemoryTransport::new());
//!     let client = StreamingClient::with_defaults(transport);
//!
//!     // Consumer
//!     client.on_stream_received(Arc::new(|reader| {
//!         reader.on_rows_received(Arc::new(|rows| {
//!             println!("got {} rows", rows.len());
//!         }));
//!     }));
//!     client.subscribe();
//!
//!     // Producer
//!     let stream = client.open_stream("car-7")?;
//!     stream.add_definition(Definition::parameter("speed").with_unit("km/h")).await?;
//!     stream.write(Row::now().value("speed", 212.4)).await?;
//!     stream.close(StreamCloseType::Normal).await?;
//!
//!     client.shutdown().await
//! }
//! ```

pub mod buffer;
pub mod codec;
pub mod error;
pub mod model;
pub mod router;
pub mod split;
pub mod stats;
pub mod streaming;
pub mod transport;

// ── Re-exports for ergonomic top-level usage ────────────────────────────────

pub use buffer::{BufferConfig, BufferError};
pub use error::{Error, Result};
pub use model::{
    DataKind, Definition, Level, Row, StreamCloseType, StreamProperties, StreamState, Value,
};
pub use split::ReassemblyConfig;
pub use stats::{DropEvent, StatsSnapshot};
pub use streaming::{StreamReader, StreamWriter, StreamingClient, StreamingConfig};
pub use transport::{InMemoryTransport, Transport};
