//! Transactional backend over an embedded B-tree store.
//!
//! One buffered batch (writer) transaction coalesces mutations and commits
//! either every `batch_interval` or once `batch_limit` mutations (or any
//! delete) are staged. Reads never block on the writer: the serial read path
//! shares a store read transaction plus a read buffer shadowing uncommitted
//! writes, while concurrent readers take a reference-counted hold on that
//! transaction and a deep copy of the buffer through a versioned cache.
//!
//! Lock order is batch transaction, then the store handle, then the read
//! transaction. Defragmentation is the only operation that takes all three.

mod batch_tx;
mod read_tx;
mod tx_buffer;

pub use batch_tx::BatchTxGuard;
pub use read_tx::{ConcurrentReadTx, ReadTxGuard};

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use osprey_common::error::BackendError;
use parking_lot::{Mutex, RwLock};
use redb::{Database, Durability, ReadTransaction, ReadableTable, TableDefinition, TableError};

use self::batch_tx::BatchTxState;
use self::tx_buffer::{TxReadBuffer, TxWriteBuffer};

pub(crate) use self::read_tx::ReadTxState;

/// Pairs copied per writer transaction while defragmenting.
const DEFRAG_LIMIT: usize = 10_000;

/// Floor for the slow-snapshot warning timer.
const MIN_SNAPSHOT_WARNING: Duration = Duration::from_secs(30);

/// Lightweight in-memory identifier of a bucket.
pub type BucketId = u8;

/// A named key-space within the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub id: BucketId,
    pub name: &'static str,
    /// True when the bucket never overwrites keys, so ranged reads cannot
    /// observe duplicates.
    pub safe_range: bool,
}

impl Bucket {
    pub(crate) fn table_def(&self) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
        TableDefinition::new(self.name)
    }
}

/// Revision-keyed key/value rows.
pub const BUCKET_KEY: Bucket = Bucket {
    id: 0,
    name: "key",
    safe_range: true,
};

/// Store metadata: compaction progress markers.
pub const BUCKET_META: Bucket = Bucket {
    id: 1,
    name: "meta",
    safe_range: false,
};

pub(crate) const ALL_BUCKETS: [Bucket; 2] = [BUCKET_KEY, BUCKET_META];

/// Backend construction options.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Path of the store file.
    pub path: PathBuf,
    /// Maximum time between two batch commits.
    pub batch_interval: Duration,
    /// Maximum staged mutations before a batch commits on unlock.
    pub batch_limit: usize,
    /// In-memory cache budget handed to the store.
    pub cache_size_bytes: usize,
    /// Skip store fsyncs. Data loss on crash; for benchmarks only.
    pub unsafe_no_fsync: bool,
}

impl BackendConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            batch_interval: Duration::from_millis(100),
            batch_limit: 10_000,
            cache_size_bytes: 1024 * 1024 * 1024,
            unsafe_no_fsync: false,
        }
    }
}

struct ReadBufCache {
    buf: Option<Arc<TxReadBuffer>>,
    version: u64,
}

pub(crate) struct BackendInner {
    /// The store handle; swapped during defragmentation.
    db: RwLock<Option<Database>>,
    path: PathBuf,
    cache_size_bytes: usize,
    durability_none: bool,
    batch: Mutex<BatchTxState>,
    pub(crate) read: RwLock<ReadTxState>,
    /// Copy cache of the read buffer keyed by its version; lets consecutive
    /// concurrent readers share one deep copy.
    read_buf_cache: Mutex<ReadBufCache>,
    batch_interval: Duration,
    pub(crate) batch_limit: usize,
    commits: AtomicU64,
}

/// The transactional backend.
pub struct Backend {
    inner: Arc<BackendInner>,
    stop: Mutex<Option<mpsc::Sender<()>>>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl Backend {
    /// Opens (or creates) the store and starts the periodic commit loop.
    pub fn new(cfg: BackendConfig) -> Result<Backend, BackendError> {
        let db = Database::builder()
            .set_cache_size(cfg.cache_size_bytes)
            .create(&cfg.path)
            .map_err(|e| BackendError::Store(e.to_string()))?;

        let inner = Arc::new(BackendInner {
            db: RwLock::new(Some(db)),
            path: cfg.path,
            cache_size_bytes: cfg.cache_size_bytes,
            durability_none: cfg.unsafe_no_fsync,
            batch: Mutex::new(BatchTxState {
                tx: None,
                pending: 0,
                pending_deletes: 0,
                buf: TxWriteBuffer::default(),
            }),
            read: RwLock::new(ReadTxState {
                tx: None,
                buf: TxReadBuffer::default(),
            }),
            read_buf_cache: Mutex::new(ReadBufCache {
                buf: None,
                version: 0,
            }),
            batch_interval: cfg.batch_interval,
            batch_limit: cfg.batch_limit,
            commits: AtomicU64::new(0),
        });

        // open the first writer and store read transaction
        {
            let mut batch = inner.batch.lock();
            let mut read = inner.read.write();
            inner.unsafe_commit(&mut batch, &mut read, false);
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let runner = thread::Builder::new()
            .name("backend-commit".into())
            .spawn({
                let inner = Arc::clone(&inner);
                move || run(&inner, &stop_rx)
            })
            .expect("failed to spawn backend commit loop");

        Ok(Backend {
            inner,
            stop: Mutex::new(Some(stop_tx)),
            runner: Mutex::new(Some(runner)),
        })
    }

    /// Locks and returns the batch transaction. Writes performed through the
    /// guard are readable within the same batch immediately and become
    /// visible to other transactions at commit.
    pub fn batch_tx(&self) -> BatchTxGuard<'_> {
        BatchTxGuard {
            inner: &self.inner,
            state: self.inner.batch.lock(),
        }
    }

    /// The serial read path, sharing the current read buffer and store read
    /// transaction.
    pub fn read_tx(&self) -> ReadTxGuard<'_> {
        ReadTxGuard {
            state: self.inner.read.read(),
        }
    }

    /// Creates a non-blocking reader pinned to the current commit state.
    pub fn concurrent_read_tx(&self) -> ConcurrentReadTx {
        let read = self.inner.read.read();
        let tx = read.tx.clone();

        let mut cache = self.inner.read_buf_cache.lock();
        let cur_version = read.buf.buf_version;
        let buf = match &cache.buf {
            Some(cached) if cache.version == cur_version => Arc::clone(cached),
            _ => {
                let copy = Arc::new(read.buf.deep_copy());
                cache.buf = Some(Arc::clone(&copy));
                cache.version = cur_version;
                copy
            }
        };
        ConcurrentReadTx { buf, tx }
    }

    /// Commits the current batch now.
    pub fn force_commit(&self) {
        let mut batch = self.inner.batch.lock();
        let mut read = self.inner.read.write();
        self.inner.unsafe_commit(&mut batch, &mut read, false);
    }

    /// Number of batch commits since the backend started.
    pub fn commits(&self) -> u64 {
        self.inner.commits.load(Ordering::Relaxed)
    }

    /// Bytes currently allocated for the store file.
    pub fn size(&self) -> u64 {
        fs::metadata(&self.inner.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Bytes logically in use by stored data.
    pub fn size_in_use(&self) -> u64 {
        let batch = self.inner.batch.lock();
        let Some(tx) = batch.tx.as_ref() else {
            return 0;
        };
        match tx.stats() {
            Ok(stats) => stats.stored_bytes() + stats.metadata_bytes(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read store stats");
                0
            }
        }
    }

    /// Takes a streamable snapshot: forces a commit, then pins a long-lived
    /// store read transaction. A watchdog sized by expected transfer
    /// throughput (floored at 30s) logs while the consumer is slow.
    pub fn snapshot(&self) -> BackendSnapshot {
        self.force_commit();

        let tx = Arc::new(self.inner.begin_read());
        let size = self.size();
        let stop = Arc::new(AtomicBool::new(false));

        // sized for a ~100 MB/s transfer path
        let send_rate: u64 = 100 * 1024 * 1024;
        let warning_timeout =
            Duration::from_secs(size / send_rate).max(MIN_SNAPSHOT_WARNING);

        let (done_tx, done_rx) = mpsc::channel::<()>();
        let watchdog = thread::Builder::new()
            .name("backend-snapshot-watchdog".into())
            .spawn(move || {
                let start = Instant::now();
                loop {
                    match done_rx.recv_timeout(warning_timeout) {
                        Err(RecvTimeoutError::Timeout) => {
                            tracing::warn!(
                                taking_secs = start.elapsed().as_secs(),
                                bytes = size,
                                "snapshotting taking too long to transfer"
                            );
                        }
                        _ => return,
                    }
                }
            })
            .expect("failed to spawn snapshot watchdog");

        BackendSnapshot {
            tx: Some(tx),
            size,
            stop,
            done: Some(done_tx),
            watchdog: Some(watchdog),
        }
    }

    /// Copies every bucket into a fresh store file with compact pages and
    /// renames it over the live one. Blocks all transactions for the
    /// duration.
    pub fn defrag(&self) -> Result<(), BackendError> {
        let started = Instant::now();

        // batch tx, then store handle, then read tx
        let mut batch = self.inner.batch.lock();
        let mut db_slot = self.inner.db.write();
        let mut read = self.inner.read.write();

        // stop: commit outstanding work and hold no transactions
        self.inner.unsafe_commit(&mut batch, &mut read, true);

        let db = db_slot.take().expect("backend store closed");
        let size_before = self.size();
        tracing::info!(
            path = %self.inner.path.display(),
            size_bytes = size_before,
            "defragmenting"
        );

        let tmp_path = self.inner.path.with_extension("tmp");
        if tmp_path.exists() {
            fs::remove_file(&tmp_path)?;
        }
        let tmpdb = Database::builder()
            .set_cache_size(self.inner.cache_size_bytes)
            .create(&tmp_path)
            .map_err(|e| BackendError::Store(e.to_string()))?;

        if let Err(e) = defrag_copy(&db, &tmpdb) {
            drop(tmpdb);
            let _ = fs::remove_file(&tmp_path);
            // reopen the untouched original
            *db_slot = Some(db);
            drop(db_slot);
            self.inner.unsafe_commit(&mut batch, &mut read, false);
            return Err(e);
        }

        drop(db);
        drop(tmpdb);
        fs::rename(&tmp_path, &self.inner.path)?;

        let newdb = Database::builder()
            .set_cache_size(self.inner.cache_size_bytes)
            .create(&self.inner.path)
            .map_err(|e| BackendError::Store(e.to_string()))?;
        *db_slot = Some(newdb);
        drop(db_slot);

        // reopen the writer and the store read transaction
        self.inner.unsafe_commit(&mut batch, &mut read, false);

        tracing::info!(
            path = %self.inner.path.display(),
            size_bytes_diff = self.size() as i64 - size_before as i64,
            took_ms = started.elapsed().as_millis() as u64,
            "finished defragmenting"
        );
        Ok(())
    }

    /// Castagnoli hash over every bucket's name and contents. `ignores`
    /// returns true for (bucket, key) pairs to leave out.
    pub fn hash(
        &self,
        ignores: Option<&dyn Fn(&[u8], &[u8]) -> bool>,
    ) -> Result<u32, BackendError> {
        let tx = self.inner.begin_read();
        let mut h: u32 = 0;
        for bucket in ALL_BUCKETS {
            let table = match tx.open_table(bucket.table_def()) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => continue,
                Err(e) => return Err(BackendError::Store(e.to_string())),
            };
            h = crc32c::crc32c_append(h, bucket.name.as_bytes());
            let iter = table
                .iter()
                .map_err(|e| BackendError::Store(e.to_string()))?;
            for item in iter {
                let (k, v) = item.map_err(|e| BackendError::Store(e.to_string()))?;
                let skip = ignores.map_or(false, |f| f(bucket.name.as_bytes(), k.value()));
                if !skip {
                    h = crc32c::crc32c_append(h, k.value());
                    h = crc32c::crc32c_append(h, v.value());
                }
            }
        }
        Ok(h)
    }

    /// Stops the commit loop, commits outstanding work, and closes the
    /// store.
    pub fn close(&self) {
        let stop = self.stop.lock().take();
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        let runner = self.runner.lock().take();
        if let Some(runner) = runner {
            let _ = runner.join();
        }
        *self.inner.db.write() = None;
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.close();
    }
}

impl BackendInner {
    /// The commit cycle. Releases the shared store read transaction (it
    /// closes once the last concurrent reader drops its hold), commits the
    /// writer if anything is pending, and (unless stopping) opens a fresh
    /// writer and read transaction.
    ///
    /// Callers hold the batch lock and the read-transaction write lock, so
    /// no reader can observe the swap half-done.
    pub(crate) fn unsafe_commit(
        &self,
        batch: &mut BatchTxState,
        read: &mut ReadTxState,
        stop: bool,
    ) {
        read.tx = None;
        read.buf.reset();

        if let Some(tx) = batch.tx.take() {
            if batch.pending == 0 && !stop {
                batch.tx = Some(tx);
            } else {
                let start = Instant::now();
                if let Err(e) = tx.commit() {
                    tracing::error!(error = %e, "failed to commit batch transaction");
                    panic!("failed to commit batch transaction: {e}");
                }
                self.commits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    pending = batch.pending,
                    took_us = start.elapsed().as_micros() as u64,
                    "committed batch transaction"
                );
                batch.pending = 0;
                batch.pending_deletes = 0;
            }
        }

        if !stop {
            if batch.tx.is_none() {
                batch.tx = Some(self.begin_write());
            }
            read.tx = Some(Arc::new(self.begin_read()));
        }
    }

    fn begin_write(&self) -> redb::WriteTransaction {
        let db = self.db.read();
        let db = db.as_ref().expect("backend store closed");
        match db.begin_write() {
            Ok(mut tx) => {
                if self.durability_none {
                    tx.set_durability(Durability::None);
                }
                tx
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to begin write transaction");
                panic!("failed to begin write transaction: {e}");
            }
        }
    }

    fn begin_read(&self) -> ReadTransaction {
        let db = self.db.read();
        let db = db.as_ref().expect("backend store closed");
        match db.begin_read() {
            Ok(tx) => tx,
            Err(e) => {
                tracing::error!(error = %e, "failed to begin read transaction");
                panic!("failed to begin read transaction: {e}");
            }
        }
    }
}

/// The periodic commit loop: every `batch_interval`, commit the batch if
/// anything is pending. A stop message commits once more and exits.
fn run(inner: &BackendInner, stop: &mpsc::Receiver<()>) {
    loop {
        match stop.recv_timeout(inner.batch_interval) {
            Err(RecvTimeoutError::Timeout) => {
                let mut batch = inner.batch.lock();
                if batch.pending != 0 {
                    let mut read = inner.read.write();
                    inner.unsafe_commit(&mut batch, &mut read, false);
                }
            }
            _ => {
                let mut batch = inner.batch.lock();
                let mut read = inner.read.write();
                inner.unsafe_commit(&mut batch, &mut read, true);
                return;
            }
        }
    }
}

fn defrag_copy(src: &Database, dst: &Database) -> Result<(), BackendError> {
    let store_err = |e: &dyn std::fmt::Display| BackendError::Store(e.to_string());

    let rtx = src.begin_read().map_err(|e| store_err(&e))?;
    let mut wtx = dst.begin_write().map_err(|e| store_err(&e))?;
    let mut pending = 0usize;

    for bucket in ALL_BUCKETS {
        let src_table = match rtx.open_table(bucket.table_def()) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => continue,
            Err(e) => return Err(store_err(&e)),
        };
        let mut iter = src_table.iter().map_err(|e| store_err(&e))?;
        loop {
            let mut done = false;
            {
                let mut dst_table = wtx
                    .open_table(bucket.table_def())
                    .map_err(|e| store_err(&e))?;
                while pending < DEFRAG_LIMIT {
                    match iter.next() {
                        Some(item) => {
                            let (k, v) = item.map_err(|e| store_err(&e))?;
                            dst_table
                                .insert(k.value(), v.value())
                                .map_err(|e| store_err(&e))?;
                            pending += 1;
                        }
                        None => {
                            done = true;
                            break;
                        }
                    }
                }
            }
            if pending >= DEFRAG_LIMIT {
                wtx.commit().map_err(|e| store_err(&e))?;
                wtx = dst.begin_write().map_err(|e| store_err(&e))?;
                pending = 0;
            }
            if done {
                break;
            }
        }
    }
    wtx.commit().map_err(|e| store_err(&e))
}

/// A point-in-time, streamable view of the whole store.
pub struct BackendSnapshot {
    tx: Option<Arc<ReadTransaction>>,
    size: u64,
    stop: Arc<AtomicBool>,
    done: Option<mpsc::Sender<()>>,
    watchdog: Option<JoinHandle<()>>,
}

impl BackendSnapshot {
    /// Size of the backing store file when the snapshot was taken.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Signals an in-flight `write_to` on another thread to abort.
    pub fn abort(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Streams every bucket into `w`: per bucket a length-prefixed name,
    /// then length-prefixed key/value pairs, terminated by a `u32::MAX` key
    /// length. Returns the bytes written.
    pub fn write_to(&self, w: &mut dyn Write) -> Result<u64, BackendError> {
        let tx = self.tx.as_ref().expect("snapshot closed");
        let mut written = 0u64;
        for bucket in ALL_BUCKETS {
            let table = match tx.open_table(bucket.table_def()) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => continue,
                Err(e) => return Err(BackendError::Store(e.to_string())),
            };
            let name = bucket.name.as_bytes();
            w.write_all(&(name.len() as u32).to_le_bytes())?;
            w.write_all(name)?;
            written += 4 + name.len() as u64;

            let iter = table
                .iter()
                .map_err(|e| BackendError::Store(e.to_string()))?;
            for item in iter {
                if self.stop.load(Ordering::Relaxed) {
                    return Err(BackendError::Store("snapshot transfer aborted".into()));
                }
                let (k, v) = item.map_err(|e| BackendError::Store(e.to_string()))?;
                let (k, v) = (k.value(), v.value());
                w.write_all(&(k.len() as u32).to_le_bytes())?;
                w.write_all(k)?;
                w.write_all(&(v.len() as u32).to_le_bytes())?;
                w.write_all(v)?;
                written += 8 + k.len() as u64 + v.len() as u64;
            }
            w.write_all(&u32::MAX.to_le_bytes())?;
            written += 4;
        }
        Ok(written)
    }

    /// Ends the snapshot, stopping the watchdog and releasing the pinned
    /// read transaction.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.done.take();
        if let Some(watchdog) = self.watchdog.take() {
            let _ = watchdog.join();
        }
        self.tx.take();
    }
}

impl Drop for BackendSnapshot {
    fn drop(&mut self) {
        self.release();
    }
}
