use serde::{Deserialize, Serialize};

/// No byte cap: pass to `limit_size` / `entries` to disable the limit.
pub const NO_LIMIT: u64 = u64::MAX;

/// Fixed per-entry overhead (index + term + type tag + length prefix) used
/// when accounting serialized entry sizes against a byte cap.
const ENTRY_OVERHEAD_BYTES: u64 = 28;

/// Kind of a replicated log entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// Application payload proposed by a client.
    #[default]
    Normal,
    /// Cluster membership change.
    ConfChange,
}

/// One position in the replicated log.
///
/// Indices are dense and strictly increasing within a term; a new leader may
/// overwrite indices above the commit point with entries of a higher term.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub entry_type: EntryType,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn new(index: u64, term: u64, data: Vec<u8>) -> Self {
        Self {
            index,
            term,
            entry_type: EntryType::Normal,
            data,
        }
    }

    /// Serialized footprint of this entry, used for byte-capped reads.
    pub fn size_bytes(&self) -> u64 {
        ENTRY_OVERHEAD_BYTES + self.data.len() as u64
    }
}

/// Persistent consensus state: current term, vote in that term, and the
/// highest log position known to be replicated on a quorum.
///
/// `commit` never decreases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

impl HardState {
    pub fn is_empty(&self) -> bool {
        *self == HardState::default()
    }
}

/// Cluster membership recorded in snapshot metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfState {
    pub voters: Vec<u64>,
    pub learners: Vec<u64>,
}

/// Metadata of a snapshot: the log position it covers and the membership at
/// that position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub index: u64,
    pub term: u64,
    pub conf_state: ConfState,
}

/// A point-in-time capture of the state machine. Supersedes all entries with
/// index at or below `metadata.index`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.metadata.index == 0
    }
}

/// Returns true when a `save(state, entries)` must reach disk before the
/// write is acknowledged: any new entries, or a change of term or vote.
/// A bare commit-index advance rides on the next forced sync.
pub fn must_sync(st: &HardState, prev_st: &HardState, ents_len: usize) -> bool {
    ents_len != 0 || st.vote != prev_st.vote || st.term != prev_st.term
}

/// Truncates `ents` to the longest prefix whose cumulative serialized size
/// stays within `max_size`, always keeping at least one entry.
pub fn limit_size(mut ents: Vec<Entry>, max_size: u64) -> Vec<Entry> {
    if ents.is_empty() {
        return ents;
    }
    let mut size = ents[0].size_bytes();
    let mut limit = 1;
    while limit < ents.len() {
        size += ents[limit].size_bytes();
        if size > max_size {
            break;
        }
        limit += 1;
    }
    ents.truncate(limit);
    ents
}
