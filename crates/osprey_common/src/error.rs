use thiserror::Error;

/// Convenience alias for `Result<T, OspreyError>`.
pub type OspreyResult<T> = Result<T, OspreyError>;

/// Top-level error type that all layer-specific errors convert into.
///
/// Recoverable conditions are returned as values; storage-integrity failures
/// during replay halt startup; invariant violations (truncating below the
/// commit point, applying past it, slicing backwards) panic instead of
/// surfacing here; they indicate a bug in the consensus collaborator.
#[derive(Error, Debug)]
pub enum OspreyError {
    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("wal error: {0}")]
    Wal(#[from] WalError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("mvcc error: {0}")]
    Mvcc(#[from] MvccError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Replicated-log errors.
///
/// `Compacted`/`Unavailable` are ordinary out-of-range conditions: the caller
/// falls back to a snapshot or retries once more entries are stable.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogError {
    /// The requested index predates the last snapshot.
    #[error("requested index is unavailable due to compaction")]
    Compacted,

    /// The requested index is older than the existing snapshot.
    #[error("requested index is older than the existing snapshot")]
    SnapOutOfDate,

    /// The requested entry at this index is not yet available.
    #[error("requested entry at index is unavailable")]
    Unavailable,

    /// A snapshot is being prepared; the caller should retry later.
    #[error("snapshot is temporarily unavailable")]
    SnapshotTemporarilyUnavailable,
}

/// Write-ahead log errors.
///
/// The replay-integrity variants (`CrcMismatch`, `MetadataConflict`,
/// `SnapshotMismatch`) poison the WAL: startup must not proceed past them.
#[derive(Error, Debug)]
pub enum WalError {
    #[error("wal: conflicting metadata found")]
    MetadataConflict,

    #[error("wal: file not found")]
    FileNotFound,

    #[error("wal: crc mismatch")]
    CrcMismatch,

    #[error("wal: snapshot mismatch")]
    SnapshotMismatch,

    #[error("wal: snapshot not found")]
    SnapshotNotFound,

    #[error("wal: slice bounds out of range")]
    SliceOutOfRange,

    #[error("wal: decoder not found")]
    DecoderNotFound,

    #[error("wal: corrupt record: {0}")]
    Corrupt(String),

    #[error("wal: io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transactional backend errors.
///
/// Mid-run failures on the store file are fatal (the backend logs and
/// aborts); only open/rename-time failures surface here.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend: store error: {0}")]
    Store(String),

    #[error("backend: io error: {0}")]
    Io(#[from] std::io::Error),
}

/// MVCC errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MvccError {
    /// The key did not exist at the requested revision.
    #[error("mvcc: revision not found")]
    RevisionNotFound,

    /// The requested revision has been compacted away.
    #[error("mvcc: required revision has been compacted")]
    Compacted,

    /// The requested revision is ahead of the store's current revision.
    #[error("mvcc: required revision is a future revision")]
    FutureRev,
}
