use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use fs2::FileExt;
use osprey_common::error::WalError;

use super::fileutil::LockedFile;

/// Pipelines segment allocation: a background thread keeps exactly one
/// preallocated `.tmp` file ready so a segment cut is just a rename.
///
/// Dropping the pipeline shuts the thread down and removes its pending
/// temp file.
pub(crate) struct FilePipeline {
    filec: Option<Receiver<Result<LockedFile, WalError>>>,
    handle: Option<JoinHandle<()>>,
}

impl FilePipeline {
    pub fn new(dir: PathBuf, size: u64) -> Self {
        let (tx, rx) = mpsc::sync_channel(0);
        let handle = thread::Builder::new()
            .name("wal-file-pipeline".into())
            .spawn(move || run(&dir, size, tx))
            .expect("failed to spawn wal file pipeline");
        Self {
            filec: Some(rx),
            handle: Some(handle),
        }
    }

    /// Returns a fresh preallocated file. Rename it before calling `open`
    /// again or the next allocation will collide.
    pub fn open(&mut self) -> Result<LockedFile, WalError> {
        match self.filec.as_ref().expect("pipeline closed").recv() {
            Ok(res) => res,
            Err(_) => Err(WalError::Corrupt("wal file pipeline stopped".into())),
        }
    }
}

impl Drop for FilePipeline {
    fn drop(&mut self) {
        // closing the channel unblocks the producer, which removes its
        // pending temp file and exits
        self.filec.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(dir: &Path, size: u64, filec: SyncSender<Result<LockedFile, WalError>>) {
    let mut count = 0u64;
    loop {
        let res = alloc(dir, size, count);
        count += 1;
        let failed = res.is_err();
        match filec.send(res) {
            Ok(()) => {
                if failed {
                    return;
                }
            }
            Err(mpsc::SendError(res)) => {
                // consumer is gone; clean up the file nobody will take
                if let Ok(f) = res {
                    let _ = std::fs::remove_file(&f.path);
                }
                return;
            }
        }
    }
}

fn alloc(dir: &Path, size: u64, count: u64) -> Result<LockedFile, WalError> {
    // alternate between two names so the new temp never collides with the
    // one just handed out
    let path = dir.join(format!("{}.tmp", count % 2));
    let f = LockedFile::open(
        &path,
        OpenOptions::new().create(true).write(true).truncate(true),
    )?;
    if let Err(e) = f.file.allocate(size) {
        tracing::error!(size, error = %e, "failed to preallocate space for a new WAL segment");
        return Err(e.into());
    }
    Ok(f)
}
