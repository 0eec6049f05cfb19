//! Message splitting and reassembly.
//!
//! Frames larger than the transport's maximum message size are split into
//! fragments, each carrying enough header to reassemble the original
//! payload on the other side. Fragments of one message-group may arrive in
//! any order, interleaved with fragments of other groups and other streams,
//! and duplicates are tolerated.
//!
//! Fragment wire header (big-endian):
//!
//! ```text
//! [stream_id: u16-length-prefixed UTF-8]
//! [group_id: 16 bytes]
//! [fragment_index: u32]
//! [fragment_count: u32]
//! [payload: remaining bytes]
//! ```
//!
//! Every data message carries this header; an unsplit payload is a single
//! fragment with `fragment_count = 1`, which the reassembler passes through
//! without allocating any per-group state.

use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::codec::{decode_str, encode_str};
use crate::stats::{notify_drop, ClientStats, DropEvent, SharedDropHook};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by splitting or reassembly.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SplitError {
    /// The configured maximum fragment size was zero.
    #[error("maximum fragment size must be at least 1")]
    InvalidFragmentSize,

    /// Truncated or structurally invalid fragment header.
    #[error("malformed fragment header: {0}")]
    MalformedHeader(String),

    /// A fragment declared a different total than its group.
    #[error("fragment count mismatch for group {group}: group has {expected}, fragment declares {actual}")]
    CountMismatch {
        group: Uuid,
        expected: u32,
        actual: u32,
    },

    /// A fragment's index was outside its declared count.
    #[error("fragment index {index} out of range for group {group} of {count} fragments")]
    IndexOutOfRange { group: Uuid, index: u32, count: u32 },
}

// ---------------------------------------------------------------------------
// Fragment
// ---------------------------------------------------------------------------

/// One transport message carrying a slice of a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// Stream the payload belongs to.
    pub stream_id: String,
    /// Message-group identifier, unique per split operation.
    pub group_id: Uuid,
    /// Zero-based index within the group.
    pub index: u32,
    /// Total fragments in the group, at least 1.
    pub count: u32,
    /// Payload slice.
    pub payload: Bytes,
}

impl Fragment {
    /// Encode the fragment into its wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.stream_id.len() + 24 + self.payload.len());
        encode_str(&mut buf, &self.stream_id);
        buf.put_slice(self.group_id.as_bytes());
        buf.put_u32(self.index);
        buf.put_u32(self.count);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a fragment from its wire form.
    pub fn decode(payload: &[u8]) -> Result<Self, SplitError> {
        let buf = &mut &payload[..];
        let stream_id =
            decode_str(buf).map_err(|e| SplitError::MalformedHeader(e.to_string()))?;
        if buf.remaining() < 16 + 4 + 4 {
            return Err(SplitError::MalformedHeader(
                "truncated fragment header".to_string(),
            ));
        }
        let mut group = [0u8; 16];
        buf.copy_to_slice(&mut group);
        let group_id = Uuid::from_bytes(group);
        let index = buf.get_u32();
        let count = buf.get_u32();
        if count == 0 {
            return Err(SplitError::MalformedHeader(
                "fragment count is zero".to_string(),
            ));
        }
        if index >= count {
            return Err(SplitError::IndexOutOfRange {
                group: group_id,
                index,
                count,
            });
        }
        Ok(Self {
            stream_id,
            group_id,
            index,
            count,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}

/// Split a payload into `ceil(len / max_fragment_size)` fragments under a
/// freshly generated message-group id.
///
/// `max_fragment_size` bounds the payload slice of each fragment, not the
/// encoded message. An empty payload still produces one empty fragment.
pub fn split(
    stream_id: &str,
    payload: Bytes,
    max_fragment_size: usize,
) -> Result<Vec<Fragment>, SplitError> {
    if max_fragment_size == 0 {
        return Err(SplitError::InvalidFragmentSize);
    }
    let count = payload.len().div_ceil(max_fragment_size).max(1) as u32;
    let group_id = Uuid::new_v4();

    let mut fragments = Vec::with_capacity(count as usize);
    for index in 0..count {
        let start = index as usize * max_fragment_size;
        let end = (start + max_fragment_size).min(payload.len());
        fragments.push(Fragment {
            stream_id: stream_id.to_string(),
            group_id,
            index,
            count,
            payload: payload.slice(start..end),
        });
    }
    Ok(fragments)
}

// ---------------------------------------------------------------------------
// Reassembly
// ---------------------------------------------------------------------------

/// Retention policy for incomplete message-groups.
///
/// A group that never completes would otherwise hold its fragments forever;
/// bounded retention evicts the oldest groups past `max_pending_groups` and
/// any group older than `max_group_age`. `None` disables the bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassemblyConfig {
    /// Maximum incomplete groups retained across all streams.
    #[serde(default = "default_max_pending_groups")]
    pub max_pending_groups: Option<usize>,
    /// Maximum age of an incomplete group.
    #[serde(default = "default_max_group_age")]
    pub max_group_age: Option<Duration>,
}

fn default_max_pending_groups() -> Option<usize> {
    Some(64)
}
fn default_max_group_age() -> Option<Duration> {
    Some(Duration::from_secs(30))
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            max_pending_groups: default_max_pending_groups(),
            max_group_age: default_max_group_age(),
        }
    }
}

struct GroupSlots {
    slots: Vec<Option<Bytes>>,
    received: u32,
    created_at: Instant,
}

impl GroupSlots {
    fn new(count: u32) -> Self {
        Self {
            slots: vec![None; count as usize],
            received: 0,
            created_at: Instant::now(),
        }
    }

    fn total(&self) -> u32 {
        self.slots.len() as u32
    }

    fn assemble(self) -> Bytes {
        let len: usize = self.slots.iter().flatten().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(len);
        for slot in self.slots.into_iter().flatten() {
            buf.put_slice(&slot);
        }
        buf.freeze()
    }
}

/// Buffers fragments per (stream, message-group) until each group is
/// complete, then yields the reassembled payload.
///
/// Keys are fully independent: fragments of unrelated groups or streams
/// never contend beyond the map's sharded locking.
pub struct Reassembler {
    groups: DashMap<(String, Uuid), GroupSlots>,
    config: ReassemblyConfig,
    stats: Arc<ClientStats>,
    drop_hook: SharedDropHook,
}

impl Reassembler {
    /// Create a reassembler with the given retention policy.
    pub fn new(config: ReassemblyConfig, stats: Arc<ClientStats>, drop_hook: SharedDropHook) -> Self {
        Self {
            groups: DashMap::new(),
            config,
            stats,
            drop_hook,
        }
    }

    /// Accept one fragment.
    ///
    /// Returns the reassembled payload once the fragment completes its
    /// group, `None` while the group is still partial. Duplicate fragments
    /// are ignored. Single-fragment groups pass straight through.
    pub fn accept(&self, fragment: Fragment) -> Result<Option<Bytes>, SplitError> {
        if fragment.count == 0 {
            return Err(SplitError::MalformedHeader(
                "fragment count is zero".to_string(),
            ));
        }
        if fragment.index >= fragment.count {
            return Err(SplitError::IndexOutOfRange {
                group: fragment.group_id,
                index: fragment.index,
                count: fragment.count,
            });
        }
        if fragment.count == 1 {
            return Ok(Some(fragment.payload));
        }

        let key = (fragment.stream_id.clone(), fragment.group_id);
        let completed = match self.groups.entry(key) {
            Entry::Occupied(mut occupied) => {
                let group = occupied.get_mut();
                if group.total() != fragment.count {
                    return Err(SplitError::CountMismatch {
                        group: fragment.group_id,
                        expected: group.total(),
                        actual: fragment.count,
                    });
                }
                let slot = &mut group.slots[fragment.index as usize];
                if slot.is_none() {
                    *slot = Some(fragment.payload);
                    group.received += 1;
                }
                if group.received == group.total() {
                    Some(occupied.remove())
                } else {
                    None
                }
            }
            Entry::Vacant(vacant) => {
                let mut group = GroupSlots::new(fragment.count);
                group.slots[fragment.index as usize] = Some(fragment.payload);
                group.received = 1;
                vacant.insert(group);
                None
            }
        };

        if let Some(group) = completed {
            return Ok(Some(group.assemble()));
        }

        self.enforce_retention();
        Ok(None)
    }

    /// Evict incomplete groups older than the configured age.
    ///
    /// Returns the number of groups evicted.
    pub fn evict_stale(&self) -> usize {
        let Some(max_age) = self.config.max_group_age else {
            return 0;
        };
        let now = Instant::now();
        let stale: Vec<(String, Uuid)> = self
            .groups
            .iter()
            .filter(|entry| now.duration_since(entry.value().created_at) > max_age)
            .map(|entry| entry.key().clone())
            .collect();
        for key in &stale {
            self.groups.remove(key);
            self.evicted(key);
        }
        stale.len()
    }

    /// Number of incomplete groups currently retained.
    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    /// Discard all incomplete groups of one stream, silently.
    ///
    /// Used on stream close and shutdown, where the discard is
    /// caller-initiated and not a data-loss event.
    pub fn discard_stream(&self, stream_id: &str) -> usize {
        let before = self.groups.len();
        self.groups.retain(|(sid, _), _| sid != stream_id);
        before - self.groups.len()
    }

    /// Discard all incomplete groups, silently.
    pub fn clear(&self) {
        self.groups.clear();
    }

    fn enforce_retention(&self) {
        let Some(max_groups) = self.config.max_pending_groups else {
            return;
        };
        if self.groups.len() <= max_groups {
            return;
        }
        self.evict_stale();
        while self.groups.len() > max_groups {
            let oldest = self
                .groups
                .iter()
                .min_by_key(|entry| entry.value().created_at)
                .map(|entry| entry.key().clone());
            let Some(key) = oldest else { break };
            self.groups.remove(&key);
            self.evicted(&key);
        }
    }

    fn evicted(&self, key: &(String, Uuid)) {
        ClientStats::bump(&self.stats.groups_evicted, 1);
        tracing::warn!(stream = %key.0, group = %key.1, "evicted incomplete message-group");
        notify_drop(
            &self.drop_hook,
            DropEvent::GroupEvicted {
                stream_id: key.0.clone(),
                group_id: key.1,
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
