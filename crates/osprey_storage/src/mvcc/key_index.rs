use std::collections::HashSet;

use osprey_common::error::MvccError;

use super::revision::Revision;

/// The revision history of one user key.
///
/// A key index holds an ordered list of generations, oldest first. A put
/// appends a revision to the newest generation; a tombstone closes that
/// generation and starts a new empty one at the tail. Only the last
/// generation may be empty, and a key whose only generation is empty must
/// be removed from the index.
///
/// For example, `put(1.0); put(2.0); tombstone(3.0); put(4.0);
/// tombstone(5.0)` on a key produces:
///
/// ```text
/// generations:
///     {empty}
///     {4.0, 5.0(t)}
///     {1.0, 2.0, 3.0(t)}
/// ```
///
/// Compacting removes the revisions at or below the compaction point except
/// the newest such (dropped too when it is a tombstone outside the newest
/// generation); generations emptied by compaction disappear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyIndex {
    pub key: Vec<u8>,
    /// The revision of the last modification.
    pub modified: Revision,
    generations: Vec<Generation>,
}

/// The span of revisions for one key between two tombstones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    /// Number of revisions ever written to this generation.
    pub ver: i64,
    /// The revision that created the generation (its first put).
    pub created: Revision,
    pub revs: Vec<Revision>,
}

impl Generation {
    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    /// Walks the revisions newest-first, calling `f` on each. Returns the
    /// position where `f` returned false, or `None` after walking them all.
    fn walk(&self, mut f: impl FnMut(Revision) -> bool) -> Option<usize> {
        let l = self.revs.len();
        for i in 0..l {
            let idx = l - i - 1;
            if !f(self.revs[idx]) {
                return Some(idx);
            }
        }
        None
    }
}

impl KeyIndex {
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            key,
            modified: Revision::default(),
            generations: Vec::new(),
        }
    }

    /// Appends a revision. Panics when the revision does not advance the
    /// modification order; revisions are handed out monotonically by the
    /// write transaction.
    pub fn put(&mut self, main: i64, sub: i64) {
        let rev = Revision { main, sub };
        if !rev.greater_than(self.modified) {
            panic!(
                "'put' with an unexpected smaller revision (given {:?}, modified {:?})",
                rev, self.modified
            );
        }
        if self.generations.is_empty() {
            self.generations.push(Generation::default());
        }
        let g = self.generations.last_mut().unwrap();
        if g.revs.is_empty() {
            // creating a new key
            g.created = rev;
        }
        g.revs.push(rev);
        g.ver += 1;
        self.modified = rev;
    }

    /// Rebuilds a key index from a stored row during recovery. The index
    /// must be empty.
    pub fn restore(&mut self, created: Revision, modified: Revision, ver: i64) {
        if !self.generations.is_empty() {
            panic!(
                "'restore' got an unexpected non-empty generations (size {})",
                self.generations.len()
            );
        }
        self.modified = modified;
        self.generations.push(Generation {
            ver,
            created,
            revs: vec![modified],
        });
    }

    /// Appends a tombstone revision and opens a new empty generation.
    /// Returns `RevisionNotFound` when the current generation is already
    /// empty (the key does not exist at this point).
    pub fn tombstone(&mut self, main: i64, sub: i64) -> Result<(), MvccError> {
        if self.is_empty() {
            panic!(
                "'tombstone' got an unexpected empty key index (key {:?})",
                self.key
            );
        }
        if self.generations.last().unwrap().is_empty() {
            return Err(MvccError::RevisionNotFound);
        }
        self.put(main, sub);
        self.generations.push(Generation::default());
        Ok(())
    }

    /// The modified revision, creation revision and version of the key as
    /// visible at `at_rev`.
    pub fn get(&self, at_rev: i64) -> Result<(Revision, Revision, i64), MvccError> {
        if self.is_empty() {
            panic!("'get' got an unexpected empty key index (key {:?})", self.key);
        }
        let Some(g) = self.find_generation(at_rev) else {
            return Err(MvccError::RevisionNotFound);
        };
        match g.walk(|rev| rev.main > at_rev) {
            Some(n) => Ok((
                g.revs[n],
                g.created,
                g.ver - (g.revs.len() - n - 1) as i64,
            )),
            None => Err(MvccError::RevisionNotFound),
        }
    }

    /// All revisions with main revision at or above `rev`, oldest first.
    /// When several share a main revision, only the one with the largest
    /// sub revision is returned.
    pub fn since(&self, rev: i64) -> Vec<Revision> {
        if self.is_empty() {
            panic!(
                "'since' got an unexpected empty key index (key {:?})",
                self.key
            );
        }
        let since = Revision { main: rev, sub: 0 };
        // find the oldest generation that can hold revisions >= rev
        let mut gi = self.generations.len() - 1;
        while gi > 0 {
            let g = &self.generations[gi];
            if !g.is_empty() && since.greater_than(g.created) {
                break;
            }
            gi -= 1;
        }

        let mut revs: Vec<Revision> = Vec::new();
        let mut last = 0i64;
        for g in &self.generations[gi..] {
            for &r in &g.revs {
                if since.greater_than(r) {
                    continue;
                }
                if r.main == last {
                    // same transaction: keep only the largest sub revision
                    *revs.last_mut().unwrap() = r;
                    continue;
                }
                revs.push(r);
                last = r.main;
            }
        }
        revs
    }

    /// Removes the revisions superseded as of `at_rev`, keeping the newest
    /// revision at or below it (unless that survivor is a tombstone outside
    /// the newest generation). Generations emptied on the way are dropped.
    /// Revisions that remain referenced are added to `available`.
    ///
    /// The caller must delete the whole index when only an empty generation
    /// remains.
    pub fn compact(&mut self, at_rev: i64, available: &mut HashSet<Revision>) {
        if self.is_empty() {
            panic!(
                "'compact' got an unexpected empty key index (key {:?})",
                self.key
            );
        }

        let (mut gen_idx, rev_idx) = self.do_compact(at_rev, available);
        let last_idx = self.generations.len() - 1;
        let g = &mut self.generations[gen_idx];
        if !g.is_empty() {
            if let Some(rev_idx) = rev_idx {
                g.revs.drain(..rev_idx);
            }
            // a surviving tombstone carries no value worth keeping unless
            // it closes the newest generation
            if g.revs.len() == 1 && gen_idx != last_idx {
                available.remove(&g.revs[0]);
                gen_idx += 1;
            }
        }
        self.generations.drain(..gen_idx);
    }

    /// Like `compact`, but only collects the still-referenced revisions
    /// without mutating the index.
    pub fn keep(&self, at_rev: i64, available: &mut HashSet<Revision>) {
        if self.is_empty() {
            return;
        }
        let (gen_idx, rev_idx) = self.do_compact(at_rev, available);
        let g = &self.generations[gen_idx];
        if !g.is_empty() {
            if let Some(rev_idx) = rev_idx {
                if rev_idx == g.revs.len() - 1 && gen_idx != self.generations.len() - 1 {
                    available.remove(&g.revs[rev_idx]);
                }
            }
        }
    }

    /// Walks to the first revision at or below `at_rev` in the generation
    /// containing it (or created after it), recording it as available.
    fn do_compact(&self, at_rev: i64, available: &mut HashSet<Revision>) -> (usize, Option<usize>) {
        let mut gen_idx = 0;
        while gen_idx < self.generations.len() - 1 {
            let tomb = self.generations[gen_idx].revs.last().unwrap().main;
            if tomb > at_rev {
                break;
            }
            gen_idx += 1;
        }

        let rev_idx = self.generations[gen_idx].walk(|rev| {
            if rev.main <= at_rev {
                available.insert(rev);
                return false;
            }
            true
        });
        (gen_idx, rev_idx)
    }

    pub fn is_empty(&self) -> bool {
        self.generations.len() == 1 && self.generations[0].is_empty()
    }

    /// The generation whose revisions span `rev`. `None` when `rev` falls
    /// in the gap between a tombstone and the next generation's creation,
    /// meaning the key did not exist at that revision.
    fn find_generation(&self, rev: i64) -> Option<&Generation> {
        let lastg = self.generations.len() as i64 - 1;
        let mut cg = lastg;
        while cg >= 0 {
            let g = &self.generations[cg as usize];
            if g.revs.is_empty() {
                cg -= 1;
                continue;
            }
            if cg != lastg {
                let tomb = g.revs.last().unwrap().main;
                if tomb <= rev {
                    return None;
                }
            }
            if g.revs[0].main <= rev {
                return Some(g);
            }
            cg -= 1;
        }
        None
    }
}
