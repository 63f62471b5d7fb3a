use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;

use super::{Bucket, BucketId};

const BUCKET_BUFFER_INITIAL_SIZE: usize = 512;

#[derive(Debug, Clone, Default)]
struct KvPair {
    key: Vec<u8>,
    val: Vec<u8>,
}

/// A small growable array of key/value pairs plus a `used` watermark, so the
/// backing slots can be reused across batches without reallocation.
#[derive(Debug)]
pub(crate) struct BucketBuffer {
    buf: Vec<KvPair>,
    used: usize,
}

impl BucketBuffer {
    fn new() -> Self {
        Self {
            buf: vec![KvPair::default(); BUCKET_BUFFER_INITIAL_SIZE],
            used: 0,
        }
    }

    pub fn add(&mut self, key: Vec<u8>, val: Vec<u8>) {
        self.buf[self.used] = KvPair { key, val };
        self.used += 1;
        if self.used == self.buf.len() {
            let grown = self.buf.len() * 3 / 2;
            self.buf.resize_with(grown, KvPair::default);
        }
    }

    /// Range over the sorted live prefix. An empty `end_key` means an exact
    /// lookup of `key`.
    pub fn range(&self, key: &[u8], end_key: &[u8], limit: i64) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let live = &self.buf[..self.used];
        let idx = live.partition_point(|p| p.key.as_slice() < key);
        let mut keys = Vec::new();
        let mut vals = Vec::new();
        if end_key.is_empty() {
            if idx < live.len() && live[idx].key.as_slice() == key {
                keys.push(live[idx].key.clone());
                vals.push(live[idx].val.clone());
            }
            return (keys, vals);
        }
        if idx < live.len() && end_key <= live[idx].key.as_slice() {
            return (keys, vals);
        }
        for p in &live[idx..] {
            if end_key <= p.key.as_slice() || keys.len() as i64 >= limit {
                break;
            }
            keys.push(p.key.clone());
            vals.push(p.val.clone());
        }
        (keys, vals)
    }

    pub fn for_each<E>(
        &self,
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), E>,
    ) -> Result<(), E> {
        for p in &self.buf[..self.used] {
            visitor(&p.key, &p.val)?;
        }
        Ok(())
    }

    fn sort(&mut self) {
        let used = self.used;
        // stable: equal keys keep write order so dedup retains the newest
        self.buf[..used].sort_by(|a, b| a.key.cmp(&b.key));
    }

    /// Merges `src` into this buffer by move, keeping the result sorted and
    /// deduplicated with the newest value winning for equal keys.
    pub fn merge(&mut self, src: BucketBuffer) {
        let src_used = src.used;
        for p in src.buf.into_iter().take(src_used) {
            self.add(p.key, p.val);
        }
        // this buffer was empty: the source order stands
        if self.used == src_used {
            return;
        }
        // already in order when the source starts strictly past our old tail
        if self.buf[self.used - src_used - 1].key < self.buf[self.used - src_used].key {
            return;
        }
        self.sort();

        // collapse duplicates, newest (later position) wins
        let mut widx = 0;
        for ridx in 1..self.used {
            if self.buf[ridx].key != self.buf[widx].key {
                widx += 1;
            }
            self.buf.swap(widx, ridx);
        }
        self.used = widx + 1;
    }

    pub fn deep_copy(&self) -> BucketBuffer {
        BucketBuffer {
            buf: self.buf.clone(),
            used: self.used,
        }
    }

    pub fn len(&self) -> usize {
        self.used
    }
}

/// Buffers writes of the current batch that have not committed yet.
#[derive(Debug, Default)]
pub(crate) struct TxWriteBuffer {
    buckets: HashMap<BucketId, BucketBuffer>,
    /// Whether each bucket has only seen sequential (monotonic-key) writes
    /// this batch; sequential buffers skip the pre-merge sort.
    bucket2seq: HashMap<BucketId, bool>,
}

impl TxWriteBuffer {
    pub fn put(&mut self, bucket: Bucket, key: &[u8], val: &[u8]) {
        self.bucket2seq.insert(bucket.id, false);
        self.put_internal(bucket, key, val);
    }

    pub fn put_seq(&mut self, bucket: Bucket, key: &[u8], val: &[u8]) {
        self.put_internal(bucket, key, val);
    }

    fn put_internal(&mut self, bucket: Bucket, key: &[u8], val: &[u8]) {
        self.buckets
            .entry(bucket.id)
            .or_insert_with(BucketBuffer::new)
            .add(key.to_vec(), val.to_vec());
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Moves every buffered bucket into the read buffer: handing over
    /// ownership when the read buffer has no buffer for that bucket yet,
    /// merging (sort + dedup keeping newest) when it does. Must run under
    /// the read transaction's write lock so no reader observes a half-merged
    /// buffer.
    pub fn writeback(&mut self, txr: &mut TxReadBuffer) {
        for (id, mut wb) in self.buckets.drain() {
            match txr.buckets.entry(id) {
                MapEntry::Vacant(slot) => {
                    if !self.bucket2seq.get(&id).copied().unwrap_or(true) && wb.used > 1 {
                        wb.sort();
                    }
                    slot.insert(wb);
                }
                MapEntry::Occupied(mut slot) => {
                    if !self.bucket2seq.get(&id).copied().unwrap_or(true) && wb.used > 1 {
                        wb.sort();
                    }
                    slot.get_mut().merge(wb);
                }
            }
        }
        self.bucket2seq.clear();
        txr.buf_version += 1;
    }
}

/// The committed-side buffer consulted by read transactions before the
/// store. `buf_version` advances on every writeback and reset, keying the
/// concurrent readers' copy cache.
#[derive(Debug, Default)]
pub(crate) struct TxReadBuffer {
    buckets: HashMap<BucketId, BucketBuffer>,
    pub buf_version: u64,
}

impl TxReadBuffer {
    pub fn range(
        &self,
        bucket: Bucket,
        key: &[u8],
        end_key: &[u8],
        limit: i64,
    ) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        match self.buckets.get(&bucket.id) {
            Some(b) => b.range(key, end_key, limit),
            None => (Vec::new(), Vec::new()),
        }
    }

    pub fn for_each<E>(
        &self,
        bucket: Bucket,
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), E>,
    ) -> Result<(), E> {
        match self.buckets.get(&bucket.id) {
            Some(b) => b.for_each(visitor),
            None => Ok(()),
        }
    }

    /// Deep copy for a concurrent reader; the copy starts its own version
    /// space.
    pub fn deep_copy(&self) -> TxReadBuffer {
        TxReadBuffer {
            buckets: self
                .buckets
                .iter()
                .map(|(id, b)| (*id, b.deep_copy()))
                .collect(),
            buf_version: 0,
        }
    }

    /// Drops the buffered state after the batch it shadowed has committed.
    /// The version bump invalidates every cached copy.
    pub fn reset(&mut self) {
        self.buckets.clear();
        self.buf_version += 1;
    }
}
