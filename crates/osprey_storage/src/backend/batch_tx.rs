use parking_lot::MutexGuard;
use redb::{ReadableTable, WriteTransaction};

use super::read_tx::table_range;
use super::tx_buffer::TxWriteBuffer;
use super::{BackendInner, Bucket};

/// State of the single batch (writer) transaction.
pub(crate) struct BatchTxState {
    /// The live writer on the store; absent only while stopped or swapped
    /// during defragmentation.
    pub tx: Option<WriteTransaction>,
    /// Mutations staged in the current batch.
    pub pending: usize,
    /// Deletes staged in the current batch. Any pending delete forces a
    /// commit on unlock: the read buffer can shadow puts but cannot
    /// represent the absence of a key.
    pub pending_deletes: usize,
    /// Write-through buffer of this batch, merged into the read buffer on
    /// unlock.
    pub buf: TxWriteBuffer,
}

/// Exclusive handle on the batch transaction.
///
/// Writes go through to the store's writer and into the write buffer, so
/// reads within the same batch observe them immediately. Dropping the guard
/// is the unlock: buffered writes are merged into the read buffer under the
/// read-transaction lock, and the batch commits when it crossed the batch
/// limit or staged any delete.
pub struct BatchTxGuard<'a> {
    pub(crate) inner: &'a BackendInner,
    pub(crate) state: MutexGuard<'a, BatchTxState>,
}

impl BatchTxGuard<'_> {
    /// Ensures the bucket exists in the store.
    pub fn create_bucket(&mut self, bucket: Bucket) {
        let tx = self.state.tx.as_ref().expect("batch transaction stopped");
        if let Err(e) = tx.open_table(bucket.table_def()) {
            tracing::error!(bucket = bucket.name, error = %e, "failed to create a bucket");
            panic!("failed to create bucket {}: {e}", bucket.name);
        }
        self.state.pending += 1;
    }

    /// Writes a key/value pair into the bucket.
    pub fn put(&mut self, bucket: Bucket, key: &[u8], value: &[u8]) {
        self.unsafe_put(bucket, key, value);
        self.state.buf.put(bucket, key, value);
    }

    /// `put` for monotonically growing keys; the buffer skips re-sorting
    /// such buckets on writeback.
    pub fn put_seq(&mut self, bucket: Bucket, key: &[u8], value: &[u8]) {
        self.unsafe_put(bucket, key, value);
        self.state.buf.put_seq(bucket, key, value);
    }

    fn unsafe_put(&mut self, bucket: Bucket, key: &[u8], value: &[u8]) {
        let tx = self.state.tx.as_ref().expect("batch transaction stopped");
        let mut table = match tx.open_table(bucket.table_def()) {
            Ok(table) => table,
            Err(e) => {
                tracing::error!(bucket = bucket.name, error = %e, "failed to open a bucket");
                panic!("failed to open bucket {}: {e}", bucket.name);
            }
        };
        if let Err(e) = table.insert(key, value) {
            tracing::error!(bucket = bucket.name, error = %e, "failed to write to a bucket");
            panic!("failed to write to bucket {}: {e}", bucket.name);
        }
        drop(table);
        self.state.pending += 1;
    }

    /// Deletes a key from the bucket. The batch will commit on unlock.
    pub fn delete(&mut self, bucket: Bucket, key: &[u8]) {
        let tx = self.state.tx.as_ref().expect("batch transaction stopped");
        let mut table = match tx.open_table(bucket.table_def()) {
            Ok(table) => table,
            Err(e) => {
                tracing::error!(bucket = bucket.name, error = %e, "failed to open a bucket");
                panic!("failed to open bucket {}: {e}", bucket.name);
            }
        };
        if let Err(e) = table.remove(key) {
            tracing::error!(bucket = bucket.name, error = %e, "failed to delete a key");
            panic!("failed to delete from bucket {}: {e}", bucket.name);
        }
        drop(table);
        self.state.pending += 1;
        self.state.pending_deletes += 1;
    }

    /// Reads through the writer, observing this batch's uncommitted writes.
    /// An empty `end_key` is an exact lookup; `limit <= 0` means unlimited.
    pub fn range(
        &self,
        bucket: Bucket,
        key: &[u8],
        end_key: &[u8],
        limit: i64,
    ) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let tx = self.state.tx.as_ref().expect("batch transaction stopped");
        let limit = if end_key.is_empty() {
            1
        } else if limit <= 0 {
            i64::MAX
        } else {
            limit
        };
        match tx.open_table(bucket.table_def()) {
            Ok(table) => table_range(&table, key, end_key, limit),
            Err(e) => {
                tracing::error!(bucket = bucket.name, error = %e, "failed to open a bucket");
                panic!("failed to open bucket {}: {e}", bucket.name);
            }
        }
    }

    /// Visits every pair in the bucket through the writer.
    pub fn for_each<E>(
        &self,
        bucket: Bucket,
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), E>,
    ) -> Result<(), E> {
        let tx = self.state.tx.as_ref().expect("batch transaction stopped");
        let table = match tx.open_table(bucket.table_def()) {
            Ok(table) => table,
            Err(e) => {
                tracing::error!(bucket = bucket.name, error = %e, "failed to open a bucket");
                panic!("failed to open bucket {}: {e}", bucket.name);
            }
        };
        let iter = match table.iter() {
            Ok(iter) => iter,
            Err(e) => panic!("failed to iterate bucket {}: {e}", bucket.name),
        };
        for item in iter {
            let (k, v) = match item {
                Ok(kv) => kv,
                Err(e) => panic!("failed to iterate bucket {}: {e}", bucket.name),
            };
            visitor(k.value(), v.value())?;
        }
        Ok(())
    }

    /// Commits the batch now and begins a fresh one.
    pub fn commit(&mut self) {
        let mut read = self.inner.read.write();
        if !self.state.buf.is_empty() {
            self.state.buf.writeback(&mut read.buf);
        }
        self.inner.unsafe_commit(&mut self.state, &mut read, false);
    }

    pub fn pending(&self) -> usize {
        self.state.pending
    }
}

impl Drop for BatchTxGuard<'_> {
    fn drop(&mut self) {
        if self.state.pending == 0 {
            return;
        }
        let mut read = self.inner.read.write();
        if !self.state.buf.is_empty() {
            self.state.buf.writeback(&mut read.buf);
        }
        if self.state.pending >= self.inner.batch_limit || self.state.pending_deletes > 0 {
            self.inner.unsafe_commit(&mut self.state, &mut read, false);
        }
    }
}
