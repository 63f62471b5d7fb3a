use osprey_common::error::LogError;
use osprey_common::types::{limit_size, ConfState, Entry, HardState, Snapshot};
use parking_lot::Mutex;

/// Read-side interface the log facade uses to reach stable entries.
///
/// An error from any method makes the consensus instance inoperable; the
/// application is responsible for cleanup and recovery.
pub trait Storage {
    /// The saved hard state and membership.
    fn initial_state(&self) -> Result<(HardState, ConfState), LogError>;

    /// Entries in `[lo, hi)`, byte-capped by `max_size` but never empty when
    /// any entry is in range.
    fn entries(&self, lo: u64, hi: u64, max_size: u64) -> Result<Vec<Entry>, LogError>;

    /// Term of entry `i`, which must be in `[first_index - 1, last_index]`.
    /// The term of the entry before `first_index` is retained for matching
    /// even though the entry itself is gone.
    fn term(&self, i: u64) -> Result<u64, LogError>;

    /// Index of the first entry still available (older ones live only in the
    /// latest snapshot).
    fn first_index(&self) -> Result<u64, LogError>;

    /// Index of the last entry.
    fn last_index(&self) -> Result<u64, LogError>;

    /// The most recent snapshot. `SnapshotTemporarilyUnavailable` tells the
    /// consensus layer to retry later.
    fn snapshot(&self) -> Result<Snapshot, LogError>;
}

/// In-memory stable log store.
///
/// Holds the entries already persisted by the WAL, fronted by a dummy entry
/// whose index/term mirror the latest snapshot. `ents[i]` has log position
/// `i + snapshot.metadata.index`.
#[derive(Debug)]
pub struct MemoryStorage {
    inner: Mutex<MemoryStorageCore>,
}

#[derive(Debug)]
struct MemoryStorageCore {
    hard_state: HardState,
    snapshot: Snapshot,
    ents: Vec<Entry>,
}

impl MemoryStorageCore {
    fn first_index(&self) -> u64 {
        self.ents[0].index + 1
    }

    fn last_index(&self) -> u64 {
        self.ents[0].index + self.ents.len() as u64 - 1
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Creates an empty store holding only the dummy entry at term zero.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryStorageCore {
                hard_state: HardState::default(),
                snapshot: Snapshot::default(),
                ents: vec![Entry::default()],
            }),
        }
    }

    /// Saves the current hard state.
    pub fn set_hard_state(&self, st: HardState) {
        self.inner.lock().hard_state = st;
    }

    /// Overwrites this store with the contents of `snap`. Fails with
    /// `SnapOutOfDate` when `snap` is not newer than the current snapshot.
    pub fn apply_snapshot(&self, snap: Snapshot) -> Result<(), LogError> {
        let mut core = self.inner.lock();
        if core.snapshot.metadata.index >= snap.metadata.index {
            return Err(LogError::SnapOutOfDate);
        }
        core.ents = vec![Entry {
            index: snap.metadata.index,
            term: snap.metadata.term,
            ..Entry::default()
        }];
        core.snapshot = snap;
        Ok(())
    }

    /// Makes a snapshot at index `i` that can later be retrieved with
    /// `snapshot()` and used to reconstruct the state at that point. If any
    /// membership change happened since the last compaction, pass the result
    /// of the latest one in `cs`.
    ///
    /// Panics if `i` is beyond the last index.
    pub fn create_snapshot(
        &self,
        i: u64,
        cs: Option<ConfState>,
        data: Vec<u8>,
    ) -> Result<Snapshot, LogError> {
        let mut core = self.inner.lock();
        if i <= core.snapshot.metadata.index {
            return Err(LogError::SnapOutOfDate);
        }
        if i > core.last_index() {
            panic!("snapshot {i} is out of bound lastindex({})", core.last_index());
        }
        let offset = core.ents[0].index;
        core.snapshot.metadata.index = i;
        core.snapshot.metadata.term = core.ents[(i - offset) as usize].term;
        if let Some(cs) = cs {
            core.snapshot.metadata.conf_state = cs;
        }
        core.snapshot.data = data;
        Ok(core.snapshot.clone())
    }

    /// Discards all entries before `compact_index`, making the entry at that
    /// index the new dummy. The application must not compact an index
    /// greater than its applied position.
    ///
    /// Panics if `compact_index` is beyond the last index.
    pub fn compact(&self, compact_index: u64) -> Result<(), LogError> {
        let mut core = self.inner.lock();
        let offset = core.ents[0].index;
        if compact_index <= offset {
            return Err(LogError::Compacted);
        }
        if compact_index > core.last_index() {
            panic!(
                "compact {compact_index} is out of bound lastindex({})",
                core.last_index()
            );
        }
        let i = (compact_index - offset) as usize;
        let mut ents = Vec::with_capacity(1 + core.ents.len() - i);
        ents.push(Entry {
            index: core.ents[i].index,
            term: core.ents[i].term,
            ..Entry::default()
        });
        ents.extend_from_slice(&core.ents[i + 1..]);
        core.ents = ents;
        Ok(())
    }

    /// Appends new entries, truncating at `entries[0].index` first. Entries
    /// below `first_index` are silently discarded.
    ///
    /// Panics when the append would leave a gap after the last index.
    pub fn append(&self, entries: &[Entry]) -> Result<(), LogError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut core = self.inner.lock();
        let first = core.first_index();
        let last = entries[0].index + entries.len() as u64 - 1;
        if last < first {
            // everything predates the snapshot
            return Ok(());
        }
        // drop the prefix already folded into the snapshot
        let entries = if first > entries[0].index {
            &entries[(first - entries[0].index) as usize..]
        } else {
            entries
        };
        let offset = (entries[0].index - core.ents[0].index) as usize;
        if core.ents.len() > offset {
            core.ents.truncate(offset);
            core.ents.extend_from_slice(entries);
        } else if core.ents.len() == offset {
            core.ents.extend_from_slice(entries);
        } else {
            panic!(
                "missing log entry [last: {}, append at: {}]",
                core.last_index(),
                entries[0].index
            );
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn initial_state(&self) -> Result<(HardState, ConfState), LogError> {
        let core = self.inner.lock();
        Ok((core.hard_state, core.snapshot.metadata.conf_state.clone()))
    }

    fn entries(&self, lo: u64, hi: u64, max_size: u64) -> Result<Vec<Entry>, LogError> {
        let core = self.inner.lock();
        let offset = core.ents[0].index;
        if lo <= offset {
            return Err(LogError::Compacted);
        }
        if hi > core.last_index() + 1 {
            panic!("entries' hi({hi}) is out of bound lastindex({})", core.last_index());
        }
        // only the dummy entry
        if core.ents.len() == 1 {
            return Err(LogError::Unavailable);
        }
        let ents = core.ents[(lo - offset) as usize..(hi - offset) as usize].to_vec();
        Ok(limit_size(ents, max_size))
    }

    fn term(&self, i: u64) -> Result<u64, LogError> {
        let core = self.inner.lock();
        let offset = core.ents[0].index;
        if i < offset {
            return Err(LogError::Compacted);
        }
        if (i - offset) as usize >= core.ents.len() {
            return Err(LogError::Unavailable);
        }
        Ok(core.ents[(i - offset) as usize].term)
    }

    fn first_index(&self) -> Result<u64, LogError> {
        Ok(self.inner.lock().first_index())
    }

    fn last_index(&self) -> Result<u64, LogError> {
        Ok(self.inner.lock().last_index())
    }

    fn snapshot(&self) -> Result<Snapshot, LogError> {
        Ok(self.inner.lock().snapshot.clone())
    }
}
