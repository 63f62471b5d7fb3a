//! MVCC key index and revisioned KV store.
//!
//! Every mutation gets a revision `(main, sub)`: `main` is the global
//! transaction revision, `sub` orders the changes inside one transaction.
//! The store keeps an in-memory tree index from user keys to their revision
//! generations, and persists each change in the backend's `key` bucket under
//! a revision-encoded key, so reads can time-travel to any uncompacted
//! revision and compaction can drop superseded rows.

mod key_index;
mod revision;

pub use key_index::{Generation, KeyIndex};
pub use revision::Revision;

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use osprey_common::error::{BackendError, MvccError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::backend::{
    Backend, BatchTxGuard, ConcurrentReadTx, ReadTxGuard, BUCKET_KEY, BUCKET_META,
};

use self::revision::{bytes_to_rev, is_tombstone, mark_tombstone, rev_to_bytes};

const SCHEDULED_COMPACT_KEY: &[u8] = b"scheduledCompactRev";
const FINISHED_COMPACT_KEY: &[u8] = b"finishedCompactRev";

/// Rows deleted per batch while applying a compaction.
const COMPACT_BATCH_LIMIT: i64 = 1000;

/// A revisioned key/value row as stored in the `key` bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    /// Revision of the put that created the current generation.
    pub create_revision: i64,
    /// Revision of this modification.
    pub mod_revision: i64,
    /// Number of puts since creation; a tombstone resets it.
    pub version: i64,
    pub value: Vec<u8>,
    /// Attached lease id; 0 means none.
    pub lease: i64,
}

/// Options for a ranged read.
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeOptions {
    /// Maximum number of rows returned; `<= 0` means unlimited.
    pub limit: i64,
    /// Revision to read at; `<= 0` means the current revision.
    pub rev: i64,
    /// Only report the match count, not the rows.
    pub count_only: bool,
}

/// Result of a ranged read.
#[derive(Debug, Clone, Default)]
pub struct RangeResult {
    pub kvs: Vec<KeyValue>,
    /// The store revision the read executed at.
    pub rev: i64,
    /// Total matches, regardless of `limit`.
    pub count: usize,
}

/// How a read transaction sources the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTxMode {
    /// Copy the buffer (through the version cache) and never block writers.
    ConcurrentBuffered,
    /// Share the live buffer under its lock; cheaper, but writeback waits.
    SharedBuffered,
}

struct RevState {
    /// Revision of the last completed write transaction.
    current_rev: i64,
    /// Greatest compacted main revision; reads at or below it fail.
    compact_main_rev: i64,
}

/// The revisioned KV store over the transactional backend.
pub struct KvStore {
    backend: Arc<Backend>,
    index: RwLock<BTreeMap<Vec<u8>, KeyIndex>>,
    revs: Mutex<RevState>,
}

impl KvStore {
    /// Opens the store over `backend`, creating the buckets and rebuilding
    /// the in-memory index from the `key` bucket.
    pub fn new(backend: Arc<Backend>) -> KvStore {
        {
            let mut tx = backend.batch_tx();
            tx.create_bucket(BUCKET_KEY);
            tx.create_bucket(BUCKET_META);
        }
        backend.force_commit();

        let store = KvStore {
            backend,
            index: RwLock::new(BTreeMap::new()),
            revs: Mutex::new(RevState {
                current_rev: 1,
                compact_main_rev: -1,
            }),
        };
        store.restore();
        store
    }

    /// Rebuilds the tree index and revision counters from the backend, and
    /// resumes a compaction that was scheduled but not finished before the
    /// last shutdown.
    pub fn restore(&self) {
        let started = Instant::now();
        let mut scheduled_compact = 0i64;
        {
            let mut index = self.index.write();
            let mut revs = self.revs.lock();
            index.clear();
            revs.current_rev = 1;
            revs.compact_main_rev = -1;

            let tx = self.backend.batch_tx();
            let (_, finished) = tx.range(BUCKET_META, FINISHED_COMPACT_KEY, b"", 0);
            if let Some(v) = finished.first() {
                revs.compact_main_rev = bytes_to_rev(v).main;
            }
            let (_, sched) = tx.range(BUCKET_META, SCHEDULED_COMPACT_KEY, b"", 0);
            if let Some(v) = sched.first() {
                scheduled_compact = bytes_to_rev(v).main;
            }

            tx.for_each::<()>(BUCKET_KEY, &mut |k, v| {
                let rev = bytes_to_rev(k);
                let kv: KeyValue = match bincode::deserialize(v) {
                    Ok(kv) => kv,
                    Err(e) => panic!("failed to decode key-value row: {e}"),
                };
                match index.get_mut(&kv.key) {
                    Some(ki) => {
                        if is_tombstone(k) {
                            let _ = ki.tombstone(rev.main, rev.sub);
                        } else {
                            ki.put(rev.main, rev.sub);
                        }
                    }
                    None => {
                        if !is_tombstone(k) {
                            let mut ki = KeyIndex::new(kv.key.clone());
                            ki.restore(
                                Revision::new(kv.create_revision, 0),
                                rev,
                                kv.version,
                            );
                            index.insert(kv.key.clone(), ki);
                        }
                    }
                }
                revs.current_rev = revs.current_rev.max(rev.main);
                Ok(())
            })
            .ok();

            if scheduled_compact <= revs.compact_main_rev {
                scheduled_compact = 0;
            } else {
                revs.compact_main_rev = scheduled_compact;
            }
        }

        if scheduled_compact != 0 {
            let keep = {
                let mut index = self.index.write();
                index_compact(&mut index, scheduled_compact)
            };
            self.schedule_compaction(scheduled_compact, keep);
            tracing::info!(
                scheduled_compact_revision = scheduled_compact,
                "resume scheduled compaction"
            );
        }
        tracing::debug!(took_ms = started.elapsed().as_millis() as u64, "restored kv store");
    }

    /// Opens a read transaction at the current revision.
    pub fn read(&self, mode: ReadTxMode) -> TxnRead<'_> {
        let (first_rev, rev) = {
            let revs = self.revs.lock();
            (revs.compact_main_rev + 1, revs.current_rev)
        };
        let view = match mode {
            ReadTxMode::ConcurrentBuffered => ReadView::Concurrent(self.backend.concurrent_read_tx()),
            ReadTxMode::SharedBuffered => ReadView::Shared(self.backend.read_tx()),
        };
        TxnRead {
            store: self,
            view,
            first_rev,
            rev,
        }
    }

    /// Opens a write transaction holding the batch-transaction lock.
    pub fn write(&self) -> TxnWrite<'_> {
        let tx = self.backend.batch_tx();
        let begin_rev = self.revs.lock().current_rev;
        TxnWrite {
            store: self,
            tx,
            begin_rev,
            changes: Vec::new(),
        }
    }

    /// Schedules compaction at `rev`: every key's revisions at or below it
    /// are dropped except the newest surviving one, then superseded rows are
    /// deleted from the backend in batches on a background thread. The
    /// returned receiver fires when the backend sweep completes.
    pub fn compact(&self, rev: i64) -> Result<Receiver<()>, MvccError> {
        {
            let mut revs = self.revs.lock();
            if rev <= revs.compact_main_rev {
                return Err(MvccError::Compacted);
            }
            if rev > revs.current_rev {
                return Err(MvccError::FutureRev);
            }
            revs.compact_main_rev = rev;
        }

        // persist the schedule point first so an interrupted compaction
        // resumes after restart
        {
            let mut tx = self.backend.batch_tx();
            tx.put(
                BUCKET_META,
                SCHEDULED_COMPACT_KEY,
                &rev_to_bytes(Revision::new(rev, 0)),
            );
        }
        self.backend.force_commit();

        let keep = {
            let mut index = self.index.write();
            index_compact(&mut index, rev)
        };
        Ok(self.schedule_compaction(rev, keep))
    }

    fn schedule_compaction(&self, rev: i64, keep: HashSet<Revision>) -> Receiver<()> {
        let backend = Arc::clone(&self.backend);
        let (done_tx, done_rx) = mpsc::channel();
        thread::Builder::new()
            .name("mvcc-compaction".into())
            .spawn(move || {
                let started = Instant::now();
                let mut deleted = 0usize;
                let end = rev_to_bytes(Revision::new(rev + 1, 0));
                let mut last = rev_to_bytes(Revision::new(0, 0));
                loop {
                    let mut tx = backend.batch_tx();
                    let (keys, _) = tx.range(BUCKET_KEY, &last, &end, COMPACT_BATCH_LIMIT);
                    for k in &keys {
                        if !keep.contains(&bytes_to_rev(k)) {
                            tx.delete(BUCKET_KEY, k);
                            deleted += 1;
                        }
                    }
                    if (keys.len() as i64) < COMPACT_BATCH_LIMIT {
                        tx.put(
                            BUCKET_META,
                            FINISHED_COMPACT_KEY,
                            &rev_to_bytes(Revision::new(rev, 0)),
                        );
                        drop(tx);
                        backend.force_commit();
                        tracing::info!(
                            compact_revision = rev,
                            deleted,
                            took_ms = started.elapsed().as_millis() as u64,
                            "finished scheduled compaction"
                        );
                        let _ = done_tx.send(());
                        return;
                    }
                    let tail = bytes_to_rev(keys.last().unwrap());
                    last = rev_to_bytes(Revision::new(tail.main, tail.sub + 1));
                    drop(tx);
                }
            })
            .expect("failed to spawn compaction thread");
        done_rx
    }

    /// Commits outstanding batched writes to the backend.
    pub fn commit(&self) {
        self.backend.force_commit();
    }

    /// Castagnoli hash of the whole store, ignoring the compaction markers
    /// so replicas compacting at different times still agree.
    pub fn hash(&self) -> Result<u32, BackendError> {
        self.backend.force_commit();
        self.backend.hash(Some(&|bucket: &[u8], key: &[u8]| {
            bucket == BUCKET_META.name.as_bytes()
                && (key == SCHEDULED_COMPACT_KEY || key == FINISHED_COMPACT_KEY)
        }))
    }

    /// The revisions that would remain referenced if a compaction ran at
    /// `rev`, computed without mutating the index. Tells which value rows in
    /// the backend are still live.
    pub fn keep(&self, rev: i64) -> HashSet<Revision> {
        index_keep(&self.index.read(), rev)
    }

    /// Revision of the last completed write transaction.
    pub fn current_rev(&self) -> i64 {
        self.revs.lock().current_rev
    }

    /// Greatest compacted main revision.
    pub fn compact_rev(&self) -> i64 {
        self.revs.lock().compact_main_rev
    }
}

enum ReadView<'a> {
    Concurrent(ConcurrentReadTx),
    Shared(ReadTxGuard<'a>),
}

impl ReadView<'_> {
    fn get_row(&self, rev_key: &[u8]) -> Option<Vec<u8>> {
        let (_, mut vals) = match self {
            ReadView::Concurrent(tx) => tx.range(BUCKET_KEY, rev_key, b"", 0),
            ReadView::Shared(tx) => tx.range(BUCKET_KEY, rev_key, b"", 0),
        };
        vals.pop()
    }
}

/// A read-only transaction pinned to the revision state at open time.
pub struct TxnRead<'a> {
    store: &'a KvStore,
    view: ReadView<'a>,
    first_rev: i64,
    rev: i64,
}

impl TxnRead<'_> {
    /// Keys in `[key, end)` at `opts.rev`. An empty `end` reads the single
    /// key. Fails with `Compacted`/`FutureRev` when the requested revision
    /// is outside the readable window.
    pub fn range(
        &self,
        key: &[u8],
        end: &[u8],
        opts: RangeOptions,
    ) -> Result<RangeResult, MvccError> {
        let rev = if opts.rev <= 0 { self.rev } else { opts.rev };
        if rev < self.first_rev {
            return Err(MvccError::Compacted);
        }
        if rev > self.rev {
            return Err(MvccError::FutureRev);
        }

        let (revpairs, total) = {
            let index = self.store.index.read();
            index_revisions(&index, key, end, rev, opts.limit)
        };
        if opts.count_only || revpairs.is_empty() {
            return Ok(RangeResult {
                kvs: Vec::new(),
                rev: self.rev,
                count: total,
            });
        }

        let mut kvs = Vec::with_capacity(revpairs.len());
        for rp in revpairs {
            let rev_key = rev_to_bytes(rp);
            let Some(row) = self.view.get_row(&rev_key) else {
                panic!(
                    "revision {:?} present in the index but missing from the store",
                    rp
                );
            };
            let kv: KeyValue = match bincode::deserialize(&row) {
                Ok(kv) => kv,
                Err(e) => panic!("failed to decode key-value row: {e}"),
            };
            kvs.push(kv);
        }
        Ok(RangeResult {
            kvs,
            rev: self.rev,
            count: total,
        })
    }

    /// The store revision at transaction open.
    pub fn rev(&self) -> i64 {
        self.rev
    }

    /// The oldest readable revision at transaction open.
    pub fn first_rev(&self) -> i64 {
        self.first_rev
    }

    /// Ends the transaction.
    pub fn end(self) {}
}

/// A write transaction. Holds the batch-transaction lock; changes stage in
/// the backend writer and the tree index, and the store revision advances
/// once at `end` when the transaction made any change.
pub struct TxnWrite<'a> {
    store: &'a KvStore,
    tx: BatchTxGuard<'a>,
    begin_rev: i64,
    changes: Vec<KeyValue>,
}

impl TxnWrite<'_> {
    /// Writes `key = value`, returning the revision of the put.
    pub fn put(&mut self, key: &[u8], value: &[u8], lease: i64) -> i64 {
        let rev = self.begin_rev + 1;
        let sub = self.changes.len() as i64;

        let (create_revision, version) = {
            let index = self.store.index.read();
            match index_get(&index, key, rev) {
                Ok((_, created, ver)) => (created.main, ver + 1),
                Err(_) => (rev, 1),
            }
        };

        let kv = KeyValue {
            key: key.to_vec(),
            create_revision,
            mod_revision: rev,
            version,
            value: value.to_vec(),
            lease,
        };
        let row = bincode::serialize(&kv).expect("failed to encode key-value row");
        let rev_key = rev_to_bytes(Revision::new(rev, sub));
        self.tx.put_seq(BUCKET_KEY, &rev_key, &row);

        self.store
            .index
            .write()
            .entry(key.to_vec())
            .or_insert_with(|| KeyIndex::new(key.to_vec()))
            .put(rev, sub);
        self.changes.push(kv);
        rev
    }

    /// Deletes every key in `[key, end)`, returning the number deleted and
    /// the revision of the operation.
    pub fn delete_range(&mut self, key: &[u8], end: &[u8]) -> (i64, i64) {
        let rrev = if self.changes.is_empty() {
            self.begin_rev
        } else {
            self.begin_rev + 1
        };
        let keys = {
            let index = self.store.index.read();
            index_range_keys(&index, key, end, rrev)
        };
        let n = keys.len() as i64;
        for k in keys {
            self.delete(&k);
        }
        if n != 0 || !self.changes.is_empty() {
            (n, self.begin_rev + 1)
        } else {
            (0, self.begin_rev)
        }
    }

    fn delete(&mut self, key: &[u8]) {
        let rev = self.begin_rev + 1;
        let sub = self.changes.len() as i64;
        let mut rev_key = rev_to_bytes(Revision::new(rev, sub));
        mark_tombstone(&mut rev_key);

        let kv = KeyValue {
            key: key.to_vec(),
            mod_revision: rev,
            ..KeyValue::default()
        };
        let row = bincode::serialize(&kv).expect("failed to encode tombstone row");
        self.tx.put_seq(BUCKET_KEY, &rev_key, &row);

        let mut index = self.store.index.write();
        let ki = index
            .get_mut(key)
            .unwrap_or_else(|| panic!("cannot tombstone missing key {key:?}"));
        if let Err(e) = ki.tombstone(rev, sub) {
            panic!("cannot tombstone an existing key {key:?}: {e}");
        }
        self.changes.push(kv);
    }

    /// Ranged read inside the write transaction; observes this
    /// transaction's own staged changes.
    pub fn range(
        &self,
        key: &[u8],
        end: &[u8],
        opts: RangeOptions,
    ) -> Result<RangeResult, MvccError> {
        let cur_rev = if self.changes.is_empty() {
            self.begin_rev
        } else {
            self.begin_rev + 1
        };
        let rev = if opts.rev <= 0 { cur_rev } else { opts.rev };
        let first_rev = self.store.revs.lock().compact_main_rev + 1;
        if rev < first_rev {
            return Err(MvccError::Compacted);
        }
        if rev > cur_rev {
            return Err(MvccError::FutureRev);
        }

        let (revpairs, total) = {
            let index = self.store.index.read();
            index_revisions(&index, key, end, rev, opts.limit)
        };
        if opts.count_only || revpairs.is_empty() {
            return Ok(RangeResult {
                kvs: Vec::new(),
                rev: cur_rev,
                count: total,
            });
        }
        let mut kvs = Vec::with_capacity(revpairs.len());
        for rp in revpairs {
            let rev_key = rev_to_bytes(rp);
            let (_, mut vals) = self.tx.range(BUCKET_KEY, &rev_key, b"", 0);
            let Some(row) = vals.pop() else {
                panic!(
                    "revision {:?} present in the index but missing from the store",
                    rp
                );
            };
            let kv: KeyValue = match bincode::deserialize(&row) {
                Ok(kv) => kv,
                Err(e) => panic!("failed to decode key-value row: {e}"),
            };
            kvs.push(kv);
        }
        Ok(RangeResult {
            kvs,
            rev: cur_rev,
            count: total,
        })
    }

    /// The changes staged by this transaction, in order.
    pub fn changes(&self) -> &[KeyValue] {
        &self.changes
    }

    /// Ends the transaction, advancing the store revision if it changed
    /// anything and releasing the batch lock (which merges the write buffer
    /// into the read buffer).
    pub fn end(self) {}
}

impl Drop for TxnWrite<'_> {
    fn drop(&mut self) {
        if !self.changes.is_empty() {
            self.store.revs.lock().current_rev += 1;
        }
        // the batch guard drops after this, running writeback under the
        // read-transaction lock
    }
}

fn index_get(
    map: &BTreeMap<Vec<u8>, KeyIndex>,
    key: &[u8],
    at_rev: i64,
) -> Result<(Revision, Revision, i64), MvccError> {
    match map.get(key) {
        Some(ki) => ki.get(at_rev),
        None => Err(MvccError::RevisionNotFound),
    }
}

/// Revisions of the keys in `[key, end)` visible at `at_rev`, plus the
/// total match count regardless of `limit`.
fn index_revisions(
    map: &BTreeMap<Vec<u8>, KeyIndex>,
    key: &[u8],
    end: &[u8],
    at_rev: i64,
    limit: i64,
) -> (Vec<Revision>, usize) {
    let mut revs = Vec::new();
    let mut total = 0usize;
    if end.is_empty() {
        if let Ok((rev, _, _)) = index_get(map, key, at_rev) {
            revs.push(rev);
            total = 1;
        }
        return (revs, total);
    }
    for (_, ki) in map.range::<[u8], _>((Bound::Included(key), Bound::Excluded(end))) {
        if let Ok((rev, _, _)) = ki.get(at_rev) {
            total += 1;
            if limit <= 0 || (revs.len() as i64) < limit {
                revs.push(rev);
            }
        }
    }
    (revs, total)
}

fn index_range_keys(
    map: &BTreeMap<Vec<u8>, KeyIndex>,
    key: &[u8],
    end: &[u8],
    at_rev: i64,
) -> Vec<Vec<u8>> {
    if end.is_empty() {
        return match index_get(map, key, at_rev) {
            Ok(_) => vec![key.to_vec()],
            Err(_) => Vec::new(),
        };
    }
    map.range::<[u8], _>((Bound::Included(key), Bound::Excluded(end)))
        .filter(|(_, ki)| ki.get(at_rev).is_ok())
        .map(|(k, _)| k.clone())
        .collect()
}

/// Compacts every key index at `rev`, removing indexes left with nothing
/// but an empty generation. Returns the set of still-referenced revisions.
fn index_compact(map: &mut BTreeMap<Vec<u8>, KeyIndex>, rev: i64) -> HashSet<Revision> {
    let mut available = HashSet::new();
    map.retain(|_, ki| {
        ki.compact(rev, &mut available);
        !ki.is_empty()
    });
    available
}

/// The non-mutating dual of `index_compact`, used to learn which backend
/// rows remain live.
fn index_keep(map: &BTreeMap<Vec<u8>, KeyIndex>, rev: i64) -> HashSet<Revision> {
    let mut available = HashSet::new();
    for ki in map.values() {
        ki.keep(rev, &mut available);
    }
    available
}
