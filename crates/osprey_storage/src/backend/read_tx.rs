use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLockReadGuard;
use redb::{ReadTransaction, ReadableTable, TableError};

use super::tx_buffer::TxReadBuffer;
use super::Bucket;

/// Shared state of the serial read path: the store read transaction for the
/// current batch interval plus the read buffer shadowing uncommitted writes.
pub(crate) struct ReadTxState {
    pub tx: Option<Arc<ReadTransaction>>,
    pub buf: TxReadBuffer,
}

/// The serial read path: a read lock on the shared read-transaction state.
///
/// Ranges consult the read buffer first, then the store's read transaction,
/// merged in key order with the buffer winning on equal keys.
pub struct ReadTxGuard<'a> {
    pub(crate) state: RwLockReadGuard<'a, ReadTxState>,
}

impl ReadTxGuard<'_> {
    /// An empty `end_key` is an exact lookup; `limit <= 0` means unlimited.
    pub fn range(
        &self,
        bucket: Bucket,
        key: &[u8],
        end_key: &[u8],
        limit: i64,
    ) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        buffered_range(
            &self.state.buf,
            self.state.tx.as_deref(),
            bucket,
            key,
            end_key,
            limit,
        )
    }

    pub fn for_each<E>(
        &self,
        bucket: Bucket,
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), E>,
    ) -> Result<(), E> {
        buffered_for_each(&self.state.buf, self.state.tx.as_deref(), bucket, visitor)
    }
}

/// A non-blocking reader: owns a deep copy of the read buffer (shared
/// through the backend's version cache) and a reference-counted hold on the
/// store read transaction in effect at creation time.
///
/// The hold keeps that transaction's view alive across batch commits; it is
/// released when the reader drops. Concurrent readers never write to their
/// buffer copy.
pub struct ConcurrentReadTx {
    pub(crate) buf: Arc<TxReadBuffer>,
    pub(crate) tx: Option<Arc<ReadTransaction>>,
}

impl ConcurrentReadTx {
    /// An empty `end_key` is an exact lookup; `limit <= 0` means unlimited.
    pub fn range(
        &self,
        bucket: Bucket,
        key: &[u8],
        end_key: &[u8],
        limit: i64,
    ) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        buffered_range(&self.buf, self.tx.as_deref(), bucket, key, end_key, limit)
    }

    pub fn for_each<E>(
        &self,
        bucket: Bucket,
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), E>,
    ) -> Result<(), E> {
        buffered_for_each(&self.buf, self.tx.as_deref(), bucket, visitor)
    }

    /// Ends the reader, releasing its hold on the store transaction.
    pub fn end(self) {}
}

fn buffered_range(
    buf: &TxReadBuffer,
    tx: Option<&ReadTransaction>,
    bucket: Bucket,
    key: &[u8],
    end_key: &[u8],
    limit: i64,
) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let limit = if end_key.is_empty() {
        1
    } else if limit <= 0 {
        i64::MAX
    } else {
        limit
    };
    let (bk, bv) = buf.range(bucket, key, end_key, limit);
    if bk.len() as i64 == limit {
        return (bk, bv);
    }
    let (sk, sv) = match tx {
        Some(tx) => store_range(tx, bucket, key, end_key, limit),
        None => (Vec::new(), Vec::new()),
    };
    merge_by_key(bk, bv, sk, sv, limit)
}

fn store_range(
    tx: &ReadTransaction,
    bucket: Bucket,
    key: &[u8],
    end_key: &[u8],
    limit: i64,
) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let table = match tx.open_table(bucket.table_def()) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return (Vec::new(), Vec::new()),
        Err(e) => {
            tracing::error!(bucket = bucket.name, error = %e, "failed to open a bucket");
            panic!("failed to open bucket {}: {e}", bucket.name);
        }
    };
    table_range(&table, key, end_key, limit)
}

/// Ranges a store table directly. Shared between the read paths and the
/// batch transaction's writer-side reads.
pub(crate) fn table_range<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    key: &[u8],
    end_key: &[u8],
    limit: i64,
) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let mut keys = Vec::new();
    let mut vals = Vec::new();
    if end_key.is_empty() {
        match table.get(key) {
            Ok(Some(guard)) => {
                keys.push(key.to_vec());
                vals.push(guard.value().to_vec());
            }
            Ok(None) => {}
            Err(e) => panic!("failed to read bucket: {e}"),
        }
        return (keys, vals);
    }
    let iter = match table.range(key..end_key) {
        Ok(iter) => iter,
        Err(e) => panic!("failed to range bucket: {e}"),
    };
    for item in iter {
        let (k, v) = match item {
            Ok(kv) => kv,
            Err(e) => panic!("failed to range bucket: {e}"),
        };
        keys.push(k.value().to_vec());
        vals.push(v.value().to_vec());
        if keys.len() as i64 >= limit {
            break;
        }
    }
    (keys, vals)
}

/// Merges two key-sorted result sets; the buffer side wins on equal keys.
fn merge_by_key(
    mut bk: Vec<Vec<u8>>,
    mut bv: Vec<Vec<u8>>,
    mut sk: Vec<Vec<u8>>,
    mut sv: Vec<Vec<u8>>,
    limit: i64,
) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let mut keys = Vec::with_capacity(bk.len() + sk.len());
    let mut vals = Vec::with_capacity(bk.len() + sk.len());
    let (mut i, mut j) = (0, 0);
    while (keys.len() as i64) < limit && (i < bk.len() || j < sk.len()) {
        let take_buffer = if i >= bk.len() {
            false
        } else if j >= sk.len() {
            true
        } else {
            bk[i] <= sk[j]
        };
        if take_buffer {
            if j < sk.len() && bk[i] == sk[j] {
                // shadowed by the buffer
                j += 1;
            }
            keys.push(std::mem::take(&mut bk[i]));
            vals.push(std::mem::take(&mut bv[i]));
            i += 1;
        } else {
            keys.push(std::mem::take(&mut sk[j]));
            vals.push(std::mem::take(&mut sv[j]));
            j += 1;
        }
    }
    (keys, vals)
}

fn buffered_for_each<E>(
    buf: &TxReadBuffer,
    tx: Option<&ReadTransaction>,
    bucket: Bucket,
    visitor: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), E>,
) -> Result<(), E> {
    // buffered keys shadow their store versions
    let mut dups: HashSet<Vec<u8>> = HashSet::new();
    buf.for_each::<E>(bucket, &mut |k, _| {
        dups.insert(k.to_vec());
        Ok(())
    })?;
    if let Some(tx) = tx {
        match tx.open_table(bucket.table_def()) {
            Ok(table) => {
                let iter = match table.iter() {
                    Ok(iter) => iter,
                    Err(e) => panic!("failed to iterate bucket {}: {e}", bucket.name),
                };
                for item in iter {
                    let (k, v) = match item {
                        Ok(kv) => kv,
                        Err(e) => panic!("failed to iterate bucket {}: {e}", bucket.name),
                    };
                    if !dups.contains(k.value()) {
                        visitor(k.value(), v.value())?;
                    }
                }
            }
            Err(TableError::TableDoesNotExist(_)) => {}
            Err(e) => panic!("failed to open bucket {}: {e}", bucket.name),
        }
    }
    buf.for_each(bucket, visitor)
}
