//! Consistency Test Suite — Backend & MVCC Invariants
//!
//! - BEND-1: Read-after-write within a batch
//! - BEND-2: Concurrent reader isolation across commits
//! - BEND-3: Deletes force an immediate commit
//! - BEND-4: Periodic commit loop
//! - BEND-5: Snapshot streaming
//! - BEND-6: Defragmentation preserves contents
//! - MVCC-1..: Revisioned reads, tombstones, compaction, restore

use std::sync::Arc;
use std::time::Duration;

use osprey_common::error::MvccError;
use osprey_storage::backend::{Backend, BackendConfig, BUCKET_KEY};
use osprey_storage::mvcc::{KvStore, RangeOptions, ReadTxMode};

fn open_backend(dir: &std::path::Path) -> Arc<Backend> {
    let mut cfg = BackendConfig::new(dir.join("store.db"));
    cfg.cache_size_bytes = 16 * 1024 * 1024;
    Arc::new(Backend::new(cfg).unwrap())
}

// ═══════════════════════════════════════════════════════════════════════════
// BEND-1: Read-after-write within a batch
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_bend1_batch_sees_own_writes() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open_backend(dir.path());

    let mut tx = backend.batch_tx();
    tx.create_bucket(BUCKET_KEY);
    tx.put(BUCKET_KEY, b"k", b"v");
    let (keys, vals) = tx.range(BUCKET_KEY, b"k", b"", 0);
    assert_eq!(keys, vec![b"k".to_vec()]);
    assert_eq!(vals, vec![b"v".to_vec()]);
    drop(tx);

    // after unlock the write buffer shadows the store for new readers
    let read = backend.read_tx();
    let (_, vals) = read.range(BUCKET_KEY, b"k", b"", 0);
    assert_eq!(vals, vec![b"v".to_vec()]);
    drop(read);

    let creader = backend.concurrent_read_tx();
    let (_, vals) = creader.range(BUCKET_KEY, b"k", b"", 0);
    assert_eq!(vals, vec![b"v".to_vec()]);
    creader.end();
    backend.close();
}

#[test]
fn test_bend1_buffer_wins_over_store_for_equal_keys() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open_backend(dir.path());

    {
        let mut tx = backend.batch_tx();
        tx.create_bucket(BUCKET_KEY);
        tx.put(BUCKET_KEY, b"k", b"old");
    }
    backend.force_commit();
    {
        let mut tx = backend.batch_tx();
        tx.put(BUCKET_KEY, b"k", b"new");
    }
    // not yet committed: the store still has "old", the buffer has "new"
    let read = backend.read_tx();
    let (_, vals) = read.range(BUCKET_KEY, b"k", b"", 0);
    assert_eq!(vals, vec![b"new".to_vec()]);
    drop(read);
    backend.close();
}

// ═══════════════════════════════════════════════════════════════════════════
// BEND-2: Concurrent reader isolation
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_bend2_concurrent_reader_pinned_across_commit() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open_backend(dir.path());

    {
        let mut tx = backend.batch_tx();
        tx.create_bucket(BUCKET_KEY);
        tx.put(BUCKET_KEY, b"k", b"v1");
    }
    backend.force_commit();

    let pinned = backend.concurrent_read_tx();

    {
        let mut tx = backend.batch_tx();
        tx.put(BUCKET_KEY, b"k", b"v2");
    }
    backend.force_commit();

    // the pre-commit reader keeps observing the old state for its lifetime
    let (_, vals) = pinned.range(BUCKET_KEY, b"k", b"", 0);
    assert_eq!(vals, vec![b"v1".to_vec()]);

    // a reader created after the commit sees the new state
    let fresh = backend.concurrent_read_tx();
    let (_, vals) = fresh.range(BUCKET_KEY, b"k", b"", 0);
    assert_eq!(vals, vec![b"v2".to_vec()]);

    pinned.end();
    fresh.end();
    backend.close();
}

#[test]
fn test_bend2_reader_during_commit_from_another_thread() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open_backend(dir.path());
    {
        let mut tx = backend.batch_tx();
        tx.create_bucket(BUCKET_KEY);
        tx.put(BUCKET_KEY, b"k", b"v1");
    }
    backend.force_commit();

    let pinned = backend.concurrent_read_tx();

    let writer = {
        let backend = Arc::clone(&backend);
        std::thread::spawn(move || {
            let mut tx = backend.batch_tx();
            tx.put(BUCKET_KEY, b"k", b"v2");
            drop(tx);
            backend.force_commit();
        })
    };
    writer.join().unwrap();

    let (_, vals) = pinned.range(BUCKET_KEY, b"k", b"", 0);
    assert_eq!(vals, vec![b"v1".to_vec()]);
    pinned.end();
    backend.close();
}

// ═══════════════════════════════════════════════════════════════════════════
// BEND-3: Deletes force an immediate commit
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_bend3_delete_commits_on_unlock() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open_backend(dir.path());
    {
        let mut tx = backend.batch_tx();
        tx.create_bucket(BUCKET_KEY);
        tx.put(BUCKET_KEY, b"k", b"v");
    }
    backend.force_commit();
    let commits_before = backend.commits();

    {
        let mut tx = backend.batch_tx();
        tx.delete(BUCKET_KEY, b"k");
    }
    assert_eq!(backend.commits(), commits_before + 1);

    let read = backend.read_tx();
    let (keys, _) = read.range(BUCKET_KEY, b"k", b"", 0);
    assert!(keys.is_empty());
    drop(read);
    backend.close();
}

// ═══════════════════════════════════════════════════════════════════════════
// BEND-4: Periodic commit loop
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_bend4_periodic_commit() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = BackendConfig::new(dir.path().join("store.db"));
    cfg.batch_interval = Duration::from_millis(20);
    cfg.cache_size_bytes = 16 * 1024 * 1024;
    let backend = Arc::new(Backend::new(cfg).unwrap());

    let commits_before = backend.commits();
    {
        let mut tx = backend.batch_tx();
        tx.create_bucket(BUCKET_KEY);
        tx.put(BUCKET_KEY, b"k", b"v");
    }
    std::thread::sleep(Duration::from_millis(500));
    assert!(
        backend.commits() > commits_before,
        "background loop never committed"
    );
    backend.close();
}

// ═══════════════════════════════════════════════════════════════════════════
// BEND-5: Snapshot streaming
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_bend5_snapshot_stream_contains_all_pairs() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open_backend(dir.path());
    {
        let mut tx = backend.batch_tx();
        tx.create_bucket(BUCKET_KEY);
        for i in 0..20u32 {
            tx.put(
                BUCKET_KEY,
                format!("key-{i:04}").as_bytes(),
                format!("value-{i:04}").as_bytes(),
            );
        }
    }

    let snap = backend.snapshot();
    assert!(snap.size() > 0);
    let mut out = Vec::new();
    let written = snap.write_to(&mut out).unwrap();
    assert_eq!(written as usize, out.len());
    snap.close();

    let stream = String::from_utf8_lossy(&out);
    for i in 0..20u32 {
        assert!(stream.contains(&format!("value-{i:04}")));
    }
    backend.close();
}

// ═══════════════════════════════════════════════════════════════════════════
// BEND-6: Defragmentation
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_bend6_defrag_preserves_contents() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open_backend(dir.path());
    {
        let mut tx = backend.batch_tx();
        tx.create_bucket(BUCKET_KEY);
        for i in 0..200u32 {
            tx.put(
                BUCKET_KEY,
                format!("key-{i:04}").as_bytes(),
                format!("value-{i:04}").as_bytes(),
            );
        }
    }
    backend.force_commit();
    let hash_before = backend.hash(None).unwrap();

    backend.defrag().unwrap();

    assert_eq!(backend.hash(None).unwrap(), hash_before);
    let read = backend.read_tx();
    let (_, vals) = read.range(BUCKET_KEY, b"key-0123", b"", 0);
    assert_eq!(vals, vec![b"value-0123".to_vec()]);
    drop(read);

    // the backend stays writable after the swap
    {
        let mut tx = backend.batch_tx();
        tx.put(BUCKET_KEY, b"post-defrag", b"yes");
    }
    backend.force_commit();
    let read = backend.read_tx();
    let (keys, _) = read.range(BUCKET_KEY, b"post-defrag", b"", 0);
    assert_eq!(keys.len(), 1);
    drop(read);
    backend.close();
}

// ═══════════════════════════════════════════════════════════════════════════
// MVCC: revisioned store
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_mvcc1_put_versions_and_create_revision() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open_backend(dir.path());
    let store = KvStore::new(Arc::clone(&backend));

    let mut w = store.write();
    let rev1 = w.put(b"foo", b"bar1", 0);
    w.end();
    let mut w = store.write();
    let rev2 = w.put(b"foo", b"bar2", 0);
    w.end();
    assert_eq!(rev1, 2);
    assert_eq!(rev2, 3);

    let r = store.read(ReadTxMode::ConcurrentBuffered);
    let res = r.range(b"foo", b"", RangeOptions::default()).unwrap();
    assert_eq!(res.kvs.len(), 1);
    let kv = &res.kvs[0];
    assert_eq!(kv.value, b"bar2");
    assert_eq!(kv.create_revision, 2);
    assert_eq!(kv.mod_revision, 3);
    assert_eq!(kv.version, 2);
    r.end();
    backend.close();
}

#[test]
fn test_mvcc2_time_travel_reads() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open_backend(dir.path());
    let store = KvStore::new(Arc::clone(&backend));

    let mut w = store.write();
    w.put(b"k", b"v1", 0);
    w.end(); // rev 2
    let mut w = store.write();
    w.put(b"k", b"v2", 0);
    w.end(); // rev 3

    let r = store.read(ReadTxMode::ConcurrentBuffered);
    let old = r
        .range(
            b"k",
            b"",
            RangeOptions {
                rev: 2,
                ..RangeOptions::default()
            },
        )
        .unwrap();
    assert_eq!(old.kvs[0].value, b"v1");
    let new = r.range(b"k", b"", RangeOptions::default()).unwrap();
    assert_eq!(new.kvs[0].value, b"v2");
    assert!(matches!(
        r.range(
            b"k",
            b"",
            RangeOptions {
                rev: 99,
                ..RangeOptions::default()
            }
        ),
        Err(MvccError::FutureRev)
    ));
    r.end();
    backend.close();
}

#[test]
fn test_mvcc3_delete_range_and_tombstones() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open_backend(dir.path());
    let store = KvStore::new(Arc::clone(&backend));

    let mut w = store.write();
    w.put(b"a", b"1", 0);
    w.put(b"b", b"2", 0);
    w.end(); // rev 2

    let mut w = store.write();
    let (n, rev) = w.delete_range(b"a", b"c");
    w.end(); // rev 3
    assert_eq!(n, 2);
    assert_eq!(rev, 3);

    let r = store.read(ReadTxMode::ConcurrentBuffered);
    // gone at the current revision
    let now = r.range(b"a", b"c", RangeOptions::default()).unwrap();
    assert!(now.kvs.is_empty());
    assert_eq!(now.count, 0);
    // both visible through time travel
    let before = r
        .range(
            b"a",
            b"c",
            RangeOptions {
                rev: 2,
                ..RangeOptions::default()
            },
        )
        .unwrap();
    assert_eq!(before.kvs.len(), 2);
    r.end();

    // deleting nothing reports the unchanged revision
    let mut w = store.write();
    let (n, rev) = w.delete_range(b"x", b"z");
    w.end();
    assert_eq!((n, rev), (0, 3));
    backend.close();
}

#[test]
fn test_mvcc4_write_txn_reads_own_changes() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open_backend(dir.path());
    let store = KvStore::new(Arc::clone(&backend));

    let mut w = store.write();
    w.put(b"k", b"v", 0);
    let res = w.range(b"k", b"", RangeOptions::default()).unwrap();
    assert_eq!(res.kvs.len(), 1);
    assert_eq!(res.kvs[0].value, b"v");
    assert_eq!(w.changes().len(), 1);
    w.end();
    backend.close();
}

#[test]
fn test_mvcc5_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open_backend(dir.path());
    let store = KvStore::new(Arc::clone(&backend));

    // keys k000..k099 written at revisions 2..=101
    for i in 0..100u32 {
        let mut w = store.write();
        w.put(format!("k{i:03}").as_bytes(), format!("v{i:03}").as_bytes(), 0);
        w.end();
    }
    assert_eq!(store.current_rev(), 101);

    let done = store.compact(50).unwrap();
    done.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(store.compact_rev(), 50);

    let r = store.read(ReadTxMode::ConcurrentBuffered);
    // below the compaction point
    assert!(matches!(
        r.range(
            b"k000",
            b"l",
            RangeOptions {
                rev: 49,
                ..RangeOptions::default()
            }
        ),
        Err(MvccError::Compacted)
    ));
    // at a surviving revision: keys written at or before rev 60 are visible
    let res = r
        .range(
            b"k000",
            b"l",
            RangeOptions {
                rev: 60,
                ..RangeOptions::default()
            },
        )
        .unwrap();
    assert_eq!(res.kvs.len(), 59, "puts at revs 2..=60 are k000..k058");
    // current reads still see everything
    let res = r.range(b"k000", b"l", RangeOptions::default()).unwrap();
    assert_eq!(res.kvs.len(), 100);
    r.end();

    // compacting the same revision again reports Compacted
    assert!(matches!(store.compact(50), Err(MvccError::Compacted)));
    assert!(matches!(store.compact(1000), Err(MvccError::FutureRev)));
    backend.close();
}

#[test]
fn test_mvcc6_restore_rebuilds_index() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open_backend(dir.path());
    let store = KvStore::new(Arc::clone(&backend));

    let mut w = store.write();
    w.put(b"a", b"1", 7);
    w.end();
    let mut w = store.write();
    w.put(b"a", b"2", 7);
    w.put(b"b", b"3", 0);
    w.end();
    let mut w = store.write();
    w.delete_range(b"b", b"");
    w.end();
    store.commit();
    let rev_before = store.current_rev();
    let hash_before = store.hash().unwrap();
    drop(store);

    // a fresh store over the same backend must converge to the same state
    let store = KvStore::new(Arc::clone(&backend));
    assert_eq!(store.current_rev(), rev_before);
    assert_eq!(store.hash().unwrap(), hash_before);

    let r = store.read(ReadTxMode::ConcurrentBuffered);
    let res = r.range(b"a", b"", RangeOptions::default()).unwrap();
    assert_eq!(res.kvs[0].value, b"2");
    assert_eq!(res.kvs[0].version, 2);
    assert_eq!(res.kvs[0].lease, 7);
    let res = r.range(b"b", b"", RangeOptions::default()).unwrap();
    assert!(res.kvs.is_empty());
    r.end();
    backend.close();
}

#[test]
fn test_mvcc7_count_only_and_limit() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open_backend(dir.path());
    let store = KvStore::new(Arc::clone(&backend));

    let mut w = store.write();
    for i in 0..10u32 {
        w.put(format!("k{i}").as_bytes(), b"v", 0);
    }
    w.end();

    let r = store.read(ReadTxMode::SharedBuffered);
    let counted = r
        .range(
            b"k",
            b"l",
            RangeOptions {
                count_only: true,
                ..RangeOptions::default()
            },
        )
        .unwrap();
    assert_eq!(counted.count, 10);
    assert!(counted.kvs.is_empty());

    let limited = r
        .range(
            b"k",
            b"l",
            RangeOptions {
                limit: 3,
                ..RangeOptions::default()
            },
        )
        .unwrap();
    assert_eq!(limited.kvs.len(), 3);
    assert_eq!(limited.count, 10);
    r.end();
    backend.close();
}

#[test]
fn test_mvcc8_keep_matches_surviving_rows() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open_backend(dir.path());
    let store = KvStore::new(Arc::clone(&backend));

    let mut w = store.write();
    w.put(b"k", b"v1", 0);
    w.end(); // rev 2
    let mut w = store.write();
    w.put(b"k", b"v2", 0);
    w.end(); // rev 3

    let keep = store.keep(3);
    // only the newest revision at or below the compaction point stays live
    assert_eq!(keep.len(), 1);
    assert!(keep.iter().any(|r| r.main == 3));
    backend.close();
}
