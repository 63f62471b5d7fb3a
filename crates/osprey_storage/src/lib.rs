//! Durable storage for the osprey core.
//!
//! - [`wal`]: a segmented, frame-aligned, CRC-chained append-only log.
//!   Entries and hard state are made crash-durable here before the
//!   replicated log hands them to the stable store.
//! - [`backend`]: buffered batch transactions over an embedded B-tree store
//!   (redb), with non-blocking concurrent readers and atomic snapshots.
//! - [`mvcc`]: the per-key revision index and the revisioned KV store built
//!   from it, supporting time-travel reads and compaction.

pub mod backend;
pub mod mvcc;
pub mod wal;

#[cfg(test)]
mod tests;
