use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// A file held under an exclusive advisory lock for the lifetime of the
/// handle. WAL segments are locked so no second process appends to them.
#[derive(Debug)]
pub(crate) struct LockedFile {
    pub file: File,
    pub path: PathBuf,
}

impl LockedFile {
    /// Opens `path` with `opts` and takes the exclusive lock, failing
    /// immediately when another holder exists.
    pub fn open(path: &Path, opts: &OpenOptions) -> io::Result<Self> {
        let file = opts.open(path)?;
        file.try_lock_exclusive()?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// Overwrites everything from `off` to the current end of `f` with zeros and
/// repositions the handle at `off`. A zeroed tail reads back as clean EOF,
/// which keeps the CRC chain of future appends intact.
pub(crate) fn zero_to_end(f: &mut File, off: u64) -> io::Result<()> {
    let end = f.metadata()?.len();
    f.seek(SeekFrom::Start(off))?;
    const ZEROS: [u8; 32 * 1024] = [0; 32 * 1024];
    let mut remaining = end.saturating_sub(off);
    while remaining > 0 {
        let n = remaining.min(ZEROS.len() as u64) as usize;
        f.write_all(&ZEROS[..n])?;
        remaining -= n as u64;
    }
    f.sync_data()?;
    f.seek(SeekFrom::Start(off))?;
    Ok(())
}

/// Fsyncs a directory so a rename performed inside it survives a crash.
pub(crate) fn fsync_dir(dir: &Path) -> io::Result<()> {
    let handle = File::open(dir)?;
    handle.sync_all()
}
