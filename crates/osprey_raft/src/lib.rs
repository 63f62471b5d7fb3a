//! Replicated log for the osprey storage core.
//!
//! Three layers, composed bottom-up:
//!
//! - [`Unstable`]: entries (and at most one snapshot) received but not yet
//!   persisted by the WAL. Lives entirely in memory and is truncated from the
//!   front as durability acknowledgements arrive.
//! - [`MemoryStorage`]: the stable store; every entry here has been saved by
//!   the WAL (or replayed from it on restart), kept behind a dummy entry that
//!   carries the latest snapshot position.
//! - [`RaftLog`]: the unified facade the consensus collaborator drives. It
//!   resolves reads against the unstable tail first, tracks the `committed`
//!   and `applied` pointers, and enforces the truncation rules that keep an
//!   acknowledged prefix immutable.
//!
//! ```text
//! | snapshot | MemoryStorage entries |  unstable entries  |
//! |          |                       |                    |
//! |     first_index            unstable.offset       last_index
//! ```

mod log;
mod storage;
mod unstable;


pub use crate::log::RaftLog;
pub use crate::storage::{MemoryStorage, Storage};
pub use crate::unstable::Unstable;
