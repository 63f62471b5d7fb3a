use osprey_common::types::{Entry, Snapshot};

/// The tail of the log that has not yet been handed to stable storage.
///
/// `entries[i]` holds log position `i + offset`. `offset` may be less than
/// the highest position in stable storage; in that case the next persistence
/// pass must truncate the stable log before appending.
#[derive(Debug, Default)]
pub struct Unstable {
    /// An incoming snapshot, if any, waiting to be persisted.
    pub snapshot: Option<Snapshot>,
    /// Entries not yet written to stable storage.
    pub entries: Vec<Entry>,
    /// Log index of `entries[0]`.
    pub offset: u64,
}

impl Unstable {
    /// Index of the first entry this tail can answer for, defined only when
    /// a pending snapshot is present.
    pub fn maybe_first_index(&self) -> Option<u64> {
        self.snapshot.as_ref().map(|s| s.metadata.index + 1)
    }

    /// Last index covered by the tail: the last entry if there is one,
    /// otherwise the pending snapshot's index.
    pub fn maybe_last_index(&self) -> Option<u64> {
        if !self.entries.is_empty() {
            return Some(self.offset + self.entries.len() as u64 - 1);
        }
        self.snapshot.as_ref().map(|s| s.metadata.index)
    }

    /// Term of the entry at `i`, if this tail knows it.
    pub fn maybe_term(&self, i: u64) -> Option<u64> {
        if i < self.offset {
            return match &self.snapshot {
                Some(s) if s.metadata.index == i => Some(s.metadata.term),
                _ => None,
            };
        }
        let last = self.maybe_last_index()?;
        if i > last {
            return None;
        }
        Some(self.entries[(i - self.offset) as usize].term)
    }

    /// Drops entries up to and including `i` once they are stable, provided
    /// the term at `i` still matches `t` (a mismatch means the entry was
    /// overwritten after it was sent to storage).
    pub fn stable_to(&mut self, i: u64, t: u64) {
        let Some(gt) = self.maybe_term(i) else {
            return;
        };
        // if i < offset, term matched the snapshot; only entries are dropped
        if gt == t && i >= self.offset {
            self.entries.drain(..=(i - self.offset) as usize);
            self.offset = i + 1;
            self.shrink_entries_vec();
        }
    }

    /// Releases the oversized backing allocation once less than half of it
    /// is live. Entries can be large, so the spare capacity is real memory.
    fn shrink_entries_vec(&mut self) {
        if self.entries.is_empty() {
            self.entries = Vec::new();
        } else if self.entries.len() * 2 < self.entries.capacity() {
            let mut shrunk = Vec::with_capacity(self.entries.len());
            shrunk.append(&mut self.entries);
            self.entries = shrunk;
        }
    }

    /// Clears the pending snapshot once it has been persisted.
    pub fn stable_snap_to(&mut self, i: u64) {
        if matches!(&self.snapshot, Some(s) if s.metadata.index == i) {
            self.snapshot = None;
        }
    }

    /// Resets the tail to a freshly received snapshot.
    pub fn restore(&mut self, s: Snapshot) {
        self.offset = s.metadata.index + 1;
        self.entries.clear();
        self.snapshot = Some(s);
    }

    /// Appends `ents`, truncating any suffix they overwrite.
    pub fn truncate_and_append(&mut self, ents: &[Entry]) {
        let after = ents[0].index;
        if after == self.offset + self.entries.len() as u64 {
            // contiguous with the tail
            self.entries.extend_from_slice(ents);
        } else if after <= self.offset {
            tracing::info!(index = after, "replacing the unstable entries");
            // the whole tail is being overwritten
            self.offset = after;
            self.entries = ents.to_vec();
        } else {
            tracing::info!(index = after, "truncating the unstable entries");
            // keep [offset, after), drop the conflicting suffix, then append
            self.entries.truncate((after - self.offset) as usize);
            self.entries.extend_from_slice(ents);
        }
    }

    /// Returns entries in `[lo, hi)`. Both bounds must fall inside the tail.
    pub fn slice(&self, lo: u64, hi: u64) -> &[Entry] {
        self.must_check_out_of_bounds(lo, hi);
        &self.entries[(lo - self.offset) as usize..(hi - self.offset) as usize]
    }

    // offset <= lo <= hi <= offset + len(entries)
    fn must_check_out_of_bounds(&self, lo: u64, hi: u64) {
        if lo > hi {
            panic!("invalid unstable.slice {lo} > {hi}");
        }
        let upper = self.offset + self.entries.len() as u64;
        if lo < self.offset || hi > upper {
            panic!(
                "unstable.slice[{lo},{hi}) out of bound [{},{upper}]",
                self.offset
            );
        }
    }
}
