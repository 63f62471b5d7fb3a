use osprey_common::error::LogError;
use osprey_common::types::{limit_size, Entry, Snapshot, NO_LIMIT};

use crate::storage::Storage;
use crate::unstable::Unstable;

/// The unified replicated log: an unstable tail over a stable store.
///
/// Reads resolve against the unstable tail first, then fall through to the
/// store. `committed` and `applied` track consensus progress and satisfy
/// `applied <= committed <= last_index()` at all times; both are monotone.
pub struct RaftLog<S: Storage> {
    /// All stable entries since the last snapshot.
    pub storage: S,
    /// Entries and snapshot not yet saved to stable storage.
    pub unstable: Unstable,
    /// Highest position known to be replicated on a quorum.
    pub committed: u64,
    /// Highest position the application has been told to apply.
    pub applied: u64,
    /// Byte cap on the entries returned by one `next_entries` call.
    max_next_ents_size: u64,
}

impl<S: Storage> RaftLog<S> {
    /// Recovers a log from `storage`, positioning `committed`/`applied` at
    /// the last compaction point. Panics when the store cannot answer its
    /// own bounds; a broken store cannot be reasoned about.
    pub fn new(storage: S, max_next_ents_size: u64) -> Self {
        let first_index = storage.first_index().expect("storage first_index");
        let last_index = storage.last_index().expect("storage last_index");
        let mut log = Self {
            storage,
            unstable: Unstable::default(),
            committed: first_index - 1,
            applied: first_index - 1,
            max_next_ents_size,
        };
        log.unstable.offset = last_index + 1;
        log
    }

    /// `new` with no byte cap on `next_entries`.
    pub fn new_unbounded(storage: S) -> Self {
        Self::new(storage, NO_LIMIT)
    }

    /// Follower append: if the local entry at `index` carries `log_term`,
    /// removes any conflicting suffix, appends the new entries, and advances
    /// `committed`. Returns the resulting last index, or `None` when the
    /// previous-entry check fails.
    ///
    /// Panics if a conflict is found at or below `committed`.
    pub fn maybe_append(
        &mut self,
        index: u64,
        log_term: u64,
        committed: u64,
        ents: &[Entry],
    ) -> Option<u64> {
        if !self.match_term(index, log_term) {
            return None;
        }
        let last_new_i = index + ents.len() as u64;
        let ci = self.find_conflict(ents);
        if ci != 0 {
            if ci <= self.committed {
                panic!(
                    "entry {ci} conflict with committed entry [committed({})]",
                    self.committed
                );
            }
            let offset = index + 1;
            self.append(&ents[(ci - offset) as usize..]);
        }
        self.commit_to(committed.min(last_new_i));
        Some(last_new_i)
    }

    /// Leader append. Panics when the entries would overwrite a committed
    /// position.
    pub fn append(&mut self, ents: &[Entry]) -> u64 {
        if ents.is_empty() {
            return self.last_index();
        }
        let after = ents[0].index - 1;
        if after < self.committed {
            panic!("after({after}) is out of range [committed({})]", self.committed);
        }
        self.unstable.truncate_and_append(ents);
        self.last_index()
    }

    /// Index of the first conflicting entry between the log and `ents`:
    /// same index, different term. Returns 0 when the log already contains
    /// every given entry; returns the first new index when the log is a
    /// strict prefix. `ents` must be contiguous and increasing.
    pub fn find_conflict(&self, ents: &[Entry]) -> u64 {
        for ne in ents {
            if !self.match_term(ne.index, ne.term) {
                if ne.index <= self.last_index() {
                    tracing::info!(
                        index = ne.index,
                        existing_term = self.zero_term_on_err_compacted(self.term(ne.index)),
                        conflicting_term = ne.term,
                        "found conflict"
                    );
                }
                return ne.index;
            }
        }
        0
    }

    /// Given a conflicting `(index, term)` reported during an append, finds
    /// the largest index in this log with term <= `term` and index <=
    /// `index`; falls back to the first index when no such entry exists.
    pub fn find_conflict_by_term(&self, index: u64, term: u64) -> u64 {
        let li = self.last_index();
        if index > li {
            tracing::warn!(index, last_index = li, "index out of range in find_conflict_by_term");
            return index;
        }
        let mut index = index;
        loop {
            match self.term(index) {
                Ok(log_term) if log_term > term => index -= 1,
                _ => break,
            }
        }
        index
    }

    /// Entries not yet handed to stable storage.
    pub fn unstable_entries(&self) -> &[Entry] {
        &self.unstable.entries
    }

    /// All committed-but-unapplied entries, byte-capped and clipped to
    /// `first_index`. Panics when the committed range cannot be read back;
    /// committed entries are persisted by contract.
    pub fn next_entries(&self) -> Vec<Entry> {
        let off = (self.applied + 1).max(self.first_index());
        if self.committed + 1 > off {
            return self
                .slice(off, self.committed + 1, self.max_next_ents_size)
                .unwrap_or_else(|e| panic!("unexpected error when getting unapplied entries ({e})"));
        }
        Vec::new()
    }

    /// Fast check for `next_entries` without materializing the slice.
    pub fn has_next_entries(&self) -> bool {
        let off = (self.applied + 1).max(self.first_index());
        self.committed + 1 > off
    }

    /// True when a received snapshot is waiting to be applied.
    pub fn has_pending_snapshot(&self) -> bool {
        matches!(&self.unstable.snapshot, Some(s) if !s.is_empty())
    }

    /// The most recent snapshot: the pending one if present, else the
    /// store's.
    pub fn snapshot(&self) -> Result<Snapshot, LogError> {
        if let Some(s) = &self.unstable.snapshot {
            return Ok(s.clone());
        }
        self.storage.snapshot()
    }

    pub fn first_index(&self) -> u64 {
        if let Some(i) = self.unstable.maybe_first_index() {
            return i;
        }
        self.storage.first_index().expect("storage first_index")
    }

    pub fn last_index(&self) -> u64 {
        if let Some(i) = self.unstable.maybe_last_index() {
            return i;
        }
        self.storage.last_index().expect("storage last_index")
    }

    /// Advances `committed`, which never decreases. Panics when asked to
    /// commit past the last index: that means the log was corrupted,
    /// truncated or lost.
    pub fn commit_to(&mut self, to_commit: u64) {
        if self.committed < to_commit {
            if self.last_index() < to_commit {
                panic!(
                    "to_commit({to_commit}) is out of range [last_index({})]. \
                     Was the raft log corrupted, truncated, or lost?",
                    self.last_index()
                );
            }
            self.committed = to_commit;
        }
    }

    /// Records that the application has applied up to `i`. Panics when `i`
    /// moves backwards or runs ahead of `committed`.
    pub fn applied_to(&mut self, i: u64) {
        if i == 0 {
            return;
        }
        if self.committed < i || i < self.applied {
            panic!(
                "applied({i}) is out of range [prev_applied({}), committed({})]",
                self.applied, self.committed
            );
        }
        self.applied = i;
    }

    /// Durability acknowledgement: entries up to `(i, t)` are on disk.
    pub fn stable_to(&mut self, i: u64, t: u64) {
        self.unstable.stable_to(i, t);
    }

    /// Durability acknowledgement for a pending snapshot.
    pub fn stable_snap_to(&mut self, i: u64) {
        self.unstable.stable_snap_to(i);
    }

    /// Term of the last entry.
    pub fn last_term(&self) -> u64 {
        self.term(self.last_index())
            .unwrap_or_else(|e| panic!("unexpected error when getting the last term ({e})"))
    }

    /// Term of the entry at `i`. `Ok(0)` outside the valid range
    /// `[dummy index, last index]`, mirroring an absent entry.
    pub fn term(&self, i: u64) -> Result<u64, LogError> {
        let dummy_index = self.first_index() - 1;
        if i < dummy_index || i > self.last_index() {
            return Ok(0);
        }
        if let Some(t) = self.unstable.maybe_term(i) {
            return Ok(t);
        }
        match self.storage.term(i) {
            Ok(t) => Ok(t),
            Err(e @ (LogError::Compacted | LogError::Unavailable)) => Err(e),
            Err(e) => panic!("unexpected storage error ({e})"),
        }
    }

    /// Entries from `i` through the end of the log, byte-capped.
    pub fn entries(&self, i: u64, max_size: u64) -> Result<Vec<Entry>, LogError> {
        if i > self.last_index() {
            return Ok(Vec::new());
        }
        self.slice(i, self.last_index() + 1, max_size)
    }

    /// Every entry in the log; retries across a racing compaction.
    pub fn all_entries(&self) -> Vec<Entry> {
        loop {
            match self.entries(self.first_index(), NO_LIMIT) {
                Ok(ents) => return ents,
                Err(LogError::Compacted) => continue,
                Err(e) => panic!("unexpected error ({e})"),
            }
        }
    }

    /// The voting predicate: a candidate's log is up to date when its last
    /// term is higher, or the terms tie and its last index is no smaller.
    pub fn is_up_to_date(&self, last_i: u64, term: u64) -> bool {
        term > self.last_term() || (term == self.last_term() && last_i >= self.last_index())
    }

    pub fn match_term(&self, i: u64, term: u64) -> bool {
        matches!(self.term(i), Ok(t) if t == term)
    }

    /// Advances `committed` to `max_index` iff it is newer than the current
    /// commit point and carries the given term.
    pub fn maybe_commit(&mut self, max_index: u64, term: u64) -> bool {
        if max_index > self.committed
            && self.zero_term_on_err_compacted(self.term(max_index)) == term
        {
            self.commit_to(max_index);
            return true;
        }
        false
    }

    /// Resets the log to a received snapshot.
    pub fn restore(&mut self, s: Snapshot) {
        tracing::info!(
            index = s.metadata.index,
            term = s.metadata.term,
            committed = self.committed,
            "log starts to restore snapshot"
        );
        self.committed = s.metadata.index;
        self.unstable.restore(s);
    }

    /// Entries in `[lo, hi)`, stitched from the store below
    /// `unstable.offset` and the unstable tail above it, byte-capped.
    ///
    /// Panics when `lo > hi` or `hi` runs past the last index.
    pub fn slice(&self, lo: u64, hi: u64, max_size: u64) -> Result<Vec<Entry>, LogError> {
        self.must_check_out_of_bounds(lo, hi)?;
        if lo == hi {
            return Ok(Vec::new());
        }
        let mut ents: Vec<Entry> = Vec::new();
        if lo < self.unstable.offset {
            let stored = match self
                .storage
                .entries(lo, hi.min(self.unstable.offset), max_size)
            {
                Ok(ents) => ents,
                Err(LogError::Compacted) => return Err(LogError::Compacted),
                Err(LogError::Unavailable) => panic!(
                    "entries[{lo}:{}) is unavailable from storage",
                    hi.min(self.unstable.offset)
                ),
                Err(e) => panic!("unexpected storage error ({e})"),
            };
            // the byte cap already clipped the stable prefix
            if (stored.len() as u64) < hi.min(self.unstable.offset) - lo {
                return Ok(stored);
            }
            ents = stored;
        }
        if hi > self.unstable.offset {
            let unstable = self.unstable.slice(lo.max(self.unstable.offset), hi);
            ents.extend_from_slice(unstable);
        }
        Ok(limit_size(ents, max_size))
    }

    // first_index <= lo <= hi <= first_index + len
    fn must_check_out_of_bounds(&self, lo: u64, hi: u64) -> Result<(), LogError> {
        if lo > hi {
            panic!("invalid slice {lo} > {hi}");
        }
        let fi = self.first_index();
        if lo < fi {
            return Err(LogError::Compacted);
        }
        let length = self.last_index() + 1 - fi;
        if hi > fi + length {
            panic!("slice[{lo},{hi}) out of bound [{fi},{}]", self.last_index());
        }
        Ok(())
    }

    fn zero_term_on_err_compacted(&self, t: Result<u64, LogError>) -> u64 {
        match t {
            Ok(t) => t,
            Err(LogError::Compacted) => 0,
            Err(e) => panic!("unexpected error ({e})"),
        }
    }
}

impl<S: Storage> std::fmt::Display for RaftLog<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "committed={}, applied={}, unstable.offset={}, len(unstable.entries)={}",
            self.committed,
            self.applied,
            self.unstable.offset,
            self.unstable.entries.len()
        )
    }
}
