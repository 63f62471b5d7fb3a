//! Segmented write-ahead log.
//!
//! A WAL directory holds append-only segment files named
//! `<seq>-<firstIndex>.wal`, each preallocated to the configured segment
//! size. Every segment opens with a crc record (chaining the checksum from
//! the previous segment), a metadata record (identical across segments) and,
//! after a cut, the latest hard state. Entries and state records follow as
//! `save` is called; a record is durable only once its fdatasync returns.
//!
//! A WAL is either in append mode or read mode. A newly created WAL appends;
//! a reopened one must first `read_all` its records, after which it is
//! positioned for appending again.

mod decoder;
mod encoder;
mod file_pipeline;
mod fileutil;
mod record;

pub use record::{Record, RecordType, WalSnapshot};

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use osprey_common::error::WalError;
use osprey_common::types::{must_sync, Entry, HardState};

use self::decoder::Decoder;
use self::encoder::Encoder;
use self::file_pipeline::FilePipeline;
use self::fileutil::{fsync_dir, zero_to_end, LockedFile};

/// Fsyncs slower than this are logged.
const WARN_SYNC_DURATION: Duration = Duration::from_secs(1);

/// WAL construction options.
#[derive(Debug, Clone)]
pub struct WalOptions {
    /// Preallocated size of each segment file.
    pub segment_size: u64,
    /// Skip every fsync. Data loss on crash; for benchmarks only.
    pub unsafe_no_fsync: bool,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            segment_size: 64 * 1024 * 1024,
            unsafe_no_fsync: false,
        }
    }
}

/// The write-ahead log.
pub struct Wal {
    dir: PathBuf,
    /// Handle on the directory itself, fsynced after segment renames.
    dir_file: Option<File>,
    /// Metadata recorded at the head of each segment.
    metadata: Vec<u8>,
    /// Hard state recorded at the head of each segment after a cut.
    state: HardState,
    /// Snapshot position to start reading from.
    start: WalSnapshot,
    decoder: Option<Decoder>,
    unsafe_no_sync: bool,
    /// Index of the last entry saved to the WAL.
    enti: u64,
    encoder: Option<Encoder>,
    /// The locked segment files this WAL holds, names increasing.
    locks: Vec<LockedFile>,
    fp: Option<FilePipeline>,
    segment_size: u64,
}

impl Wal {
    /// Creates a WAL ready for appending. `metadata` is recorded at the head
    /// of every segment and handed back by `read_all` after reopening.
    ///
    /// The directory is built under a temporary name and renamed into place,
    /// so initialization is atomic: a crash part-way leaves no usable WAL.
    pub fn create(dir: &Path, metadata: Vec<u8>, opts: WalOptions) -> Result<Wal, WalError> {
        if dir.exists() {
            return Err(WalError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("wal directory {} already exists", dir.display()),
            )));
        }

        let tmpdir = PathBuf::from(format!("{}.tmp", dir.display()));
        if tmpdir.exists() {
            fs::remove_dir_all(&tmpdir)?;
        }
        fs::create_dir_all(&tmpdir)?;

        let p = tmpdir.join(wal_name(0, 0));
        let f = LockedFile::open(&p, OpenOptions::new().create(true).write(true))?;
        f.file.allocate(opts.segment_size)?;

        let mut w = Wal {
            dir: dir.to_path_buf(),
            dir_file: None,
            metadata,
            state: HardState::default(),
            start: WalSnapshot::default(),
            decoder: None,
            unsafe_no_sync: opts.unsafe_no_fsync,
            enti: 0,
            encoder: Some(Encoder::new(f.file.try_clone()?, 0)?),
            locks: vec![f],
            fp: None,
            segment_size: opts.segment_size,
        };
        w.save_crc(0)?;
        let mut md = Record {
            rtype: RecordType::Metadata,
            crc: 0,
            data: w.metadata.clone(),
        };
        w.encoder.as_mut().unwrap().encode(&mut md)?;
        w.save_snapshot(WalSnapshot::default())?;

        fs::rename(&tmpdir, &w.dir)?;
        w.fp = Some(FilePipeline::new(w.dir.clone(), w.segment_size));
        w.dir_file = Some(File::open(&w.dir)?);
        if let Some(parent) = w.dir.parent() {
            fsync_dir(parent)?;
        }
        Ok(w)
    }

    /// Opens the WAL at the given snapshot position for appending. The snap
    /// must have been saved to this WAL previously, or `read_all` fails with
    /// `SnapshotNotFound`. Appending is only possible after `read_all` has
    /// consumed every record.
    pub fn open(dir: &Path, snap: WalSnapshot, opts: WalOptions) -> Result<Wal, WalError> {
        Self::open_at_index(dir, snap, true, opts)
    }

    /// Opens the WAL for reading only. `save` on the result panics.
    pub fn open_for_read(dir: &Path, snap: WalSnapshot) -> Result<Wal, WalError> {
        Self::open_at_index(dir, snap, false, WalOptions::default())
    }

    fn open_at_index(
        dir: &Path,
        snap: WalSnapshot,
        write: bool,
        opts: WalOptions,
    ) -> Result<Wal, WalError> {
        if write {
            remove_stale_temp_files(dir);
        }

        let names = read_wal_names(dir)?;
        let name_index = search_index(&names, snap.index).ok_or(WalError::FileNotFound)?;
        if !is_valid_seq(&names[name_index..]) {
            return Err(WalError::FileNotFound);
        }

        let mut locks = Vec::new();
        let mut readers = Vec::new();
        for name in &names[name_index..] {
            let p = dir.join(name);
            if write {
                locks.push(LockedFile::open(&p, OpenOptions::new().read(true).write(true))?);
            }
            readers.push(File::open(&p)?);
        }

        Ok(Wal {
            dir: dir.to_path_buf(),
            dir_file: if write { Some(File::open(dir)?) } else { None },
            metadata: Vec::new(),
            state: HardState::default(),
            start: snap,
            decoder: Some(Decoder::new(readers)?),
            unsafe_no_sync: opts.unsafe_no_fsync,
            enti: 0,
            encoder: None,
            locks,
            fp: if write {
                Some(FilePipeline::new(dir.to_path_buf(), opts.segment_size))
            } else {
                None
            },
            segment_size: opts.segment_size,
        })
    }

    /// Reads out every record after the opening snapshot: the segment
    /// metadata, the latest hard state, and the entries above the snapshot
    /// index.
    ///
    /// An entry record overriding an earlier index replaces the accumulated
    /// suffix: a restart can legitimately have recorded both a stale and a
    /// newer entry at the same position, and the later write reflects
    /// consensus truth. Returned entries above `state.commit` are still
    /// subject to change and must not be applied.
    ///
    /// In append mode the tail segment is rewound to the end of the last
    /// valid record and zeroed beyond it, then the encoder is armed with the
    /// chained checksum.
    pub fn read_all(&mut self) -> Result<(Vec<u8>, HardState, Vec<Entry>), WalError> {
        let mut decoder = self.decoder.take().ok_or(WalError::DecoderNotFound)?;

        let mut metadata: Option<Vec<u8>> = None;
        let mut state = HardState::default();
        let mut ents: Vec<Entry> = Vec::new();
        let mut matched = false;

        while let Some(rec) = decoder.decode()? {
            match rec.rtype {
                RecordType::Entry => {
                    let e: Entry = bincode::deserialize(&rec.data)
                        .map_err(|e| WalError::Corrupt(format!("decode entry: {e}")))?;
                    self.enti = e.index;
                    if e.index > self.start.index {
                        let up = (e.index - self.start.index - 1) as usize;
                        if up > ents.len() {
                            return Err(WalError::SliceOutOfRange);
                        }
                        // overriding an already-read suffix (Figure 7)
                        ents.truncate(up);
                        ents.push(e);
                    }
                }
                RecordType::State => {
                    state = bincode::deserialize(&rec.data)
                        .map_err(|e| WalError::Corrupt(format!("decode hard state: {e}")))?;
                }
                RecordType::Metadata => {
                    if let Some(md) = &metadata {
                        if md != &rec.data {
                            return Err(WalError::MetadataConflict);
                        }
                    }
                    metadata = Some(rec.data);
                }
                RecordType::Crc => {
                    // a fresh decoder carries crc 0 and accepts any anchor
                    let crc = decoder.crc();
                    if crc != 0 {
                        rec.validate(crc)?;
                    }
                    decoder.update_crc(rec.crc);
                }
                RecordType::Snapshot => {
                    let s: WalSnapshot = bincode::deserialize(&rec.data)
                        .map_err(|e| WalError::Corrupt(format!("decode snapshot marker: {e}")))?;
                    if s.index == self.start.index {
                        if s.term != self.start.term {
                            return Err(WalError::SnapshotMismatch);
                        }
                        matched = true;
                    }
                }
            }
        }

        if let Some(tail) = self.locks.last_mut() {
            // append mode: position at the decoded end and zero the rest so
            // future appends extend a clean crc chain
            zero_to_end(&mut tail.file, decoder.last_offset())?;
            self.encoder = Some(Encoder::new(tail.file.try_clone()?, decoder.crc())?);
        }

        if !matched {
            return Err(WalError::SnapshotNotFound);
        }

        self.start = WalSnapshot::default();
        self.metadata = metadata.clone().unwrap_or_default();
        Ok((self.metadata.clone(), state, ents))
    }

    /// Appends entries followed by the hard state, then makes them durable.
    /// The fsync is skipped only when nothing forces it (no entries and no
    /// term/vote change) and the segment has room left.
    pub fn save(&mut self, st: HardState, ents: &[Entry]) -> Result<(), WalError> {
        if st.is_empty() && ents.is_empty() {
            return Ok(());
        }

        let must = must_sync(&st, &self.state, ents.len());
        for e in ents {
            self.save_entry(e)?;
        }
        self.save_state(&st)?;

        let cur_off = self.encoder().offset();
        if cur_off < self.segment_size {
            if must {
                self.sync()?;
            }
            return Ok(());
        }
        self.cut()
    }

    /// Records a snapshot marker and makes it durable. Replays may then
    /// start from this position.
    pub fn save_snapshot(&mut self, snap: WalSnapshot) -> Result<(), WalError> {
        let data = bincode::serialize(&snap)
            .map_err(|e| WalError::Corrupt(format!("encode snapshot marker: {e}")))?;
        let mut rec = Record {
            rtype: RecordType::Snapshot,
            crc: 0,
            data,
        };
        self.encoder().encode(&mut rec)?;
        if self.enti < snap.index {
            self.enti = snap.index;
        }
        self.sync()
    }

    /// Seals the current segment and switches appends to the next one.
    ///
    /// The sealed segment is truncated to its written length and fsynced;
    /// the preallocated successor comes from the file pipeline, gets its
    /// crc/metadata/state header, and is renamed into place with a directory
    /// fsync so the rotation survives a crash.
    fn cut(&mut self) -> Result<(), WalError> {
        let off = self.encoder().flushed_offset()?;
        self.locks
            .last()
            .expect("wal holds no segment")
            .file
            .set_len(off)?;
        self.sync()?;

        let fpath = self.dir.join(wal_name(self.seq()? + 1, self.enti + 1));

        let tmp = self
            .fp
            .as_mut()
            .expect("wal not open for appending")
            .open()?;
        self.locks.push(tmp);
        let prev_crc = self.encoder().crc();
        self.encoder = Some(Encoder::new(
            self.locks.last().unwrap().file.try_clone()?,
            prev_crc,
        )?);

        // segment header: chained crc, metadata, latest hard state
        self.save_crc(prev_crc)?;
        let mut md = Record {
            rtype: RecordType::Metadata,
            crc: 0,
            data: self.metadata.clone(),
        };
        self.encoder().encode(&mut md)?;
        let st = self.state;
        self.save_state(&st)?;
        self.sync()?;

        let off = self.encoder().flushed_offset()?;

        fs::rename(&self.locks.last().unwrap().path, &fpath)?;
        if let Some(dirf) = &self.dir_file {
            dirf.sync_all()?;
        }

        // reopen under the final name so lock bookkeeping matches disk
        let old = self.locks.pop().unwrap();
        drop(old);
        let lf = LockedFile::open(&fpath, OpenOptions::new().write(true))?;
        {
            let mut f: &File = &lf.file;
            f.seek(SeekFrom::Start(off))?;
        }
        self.locks.push(lf);

        let prev_crc = self.encoder().crc();
        self.encoder = Some(Encoder::new(
            self.locks.last().unwrap().file.try_clone()?,
            prev_crc,
        )?);

        tracing::info!(path = %fpath.display(), "created a new WAL segment");
        Ok(())
    }

    /// Flushes buffered frames and fdatasyncs the tail segment. A save is
    /// durable only once this returns.
    pub fn sync(&mut self) -> Result<(), WalError> {
        if let Some(enc) = self.encoder.as_mut() {
            enc.flush()?;
        }
        if self.unsafe_no_sync {
            return Ok(());
        }
        let Some(tail) = self.locks.last() else {
            return Ok(());
        };
        let start = Instant::now();
        tail.file.sync_data()?;
        let took = start.elapsed();
        if took > WARN_SYNC_DURATION {
            tracing::warn!(
                took_ms = took.as_millis() as u64,
                expected_ms = WARN_SYNC_DURATION.as_millis() as u64,
                "slow fdatasync"
            );
        }
        Ok(())
    }

    /// Releases the locks on segments whose first index is below `index`,
    /// keeping the greatest such segment so replay can still start just
    /// before `index`.
    pub fn release_lock_to(&mut self, index: u64) -> Result<(), WalError> {
        if self.locks.is_empty() {
            return Ok(());
        }

        let mut smaller = self.locks.len() - 1;
        for (i, l) in self.locks.iter().enumerate() {
            let (_, lock_index) = parse_wal_name(l.name())?;
            if lock_index >= index {
                if i == 0 {
                    return Ok(());
                }
                smaller = i - 1;
                break;
            }
        }
        if smaller == 0 {
            return Ok(());
        }
        self.locks.drain(..smaller);
        Ok(())
    }

    /// Syncs and closes every segment; the file pipeline removes its
    /// pending temp file.
    pub fn close(mut self) -> Result<(), WalError> {
        self.fp.take();
        if self.locks.last().is_some() {
            self.sync()?;
        }
        Ok(())
    }

    fn save_entry(&mut self, e: &Entry) -> Result<(), WalError> {
        let data = bincode::serialize(e)
            .map_err(|err| WalError::Corrupt(format!("encode entry: {err}")))?;
        let mut rec = Record {
            rtype: RecordType::Entry,
            crc: 0,
            data,
        };
        self.encoder().encode(&mut rec)?;
        self.enti = e.index;
        Ok(())
    }

    fn save_state(&mut self, st: &HardState) -> Result<(), WalError> {
        if st.is_empty() {
            return Ok(());
        }
        self.state = *st;
        let data = bincode::serialize(st)
            .map_err(|e| WalError::Corrupt(format!("encode hard state: {e}")))?;
        let mut rec = Record {
            rtype: RecordType::State,
            crc: 0,
            data,
        };
        self.encoder().encode(&mut rec)
    }

    fn save_crc(&mut self, prev_crc: u32) -> Result<(), WalError> {
        let mut rec = Record {
            rtype: RecordType::Crc,
            crc: prev_crc,
            data: Vec::new(),
        };
        self.encoder().encode(&mut rec)
    }

    fn encoder(&mut self) -> &mut Encoder {
        self.encoder
            .as_mut()
            .expect("wal is not positioned for appending; read_all must complete first")
    }

    fn seq(&self) -> Result<u64, WalError> {
        let tail = self.locks.last().expect("wal holds no segment");
        Ok(parse_wal_name(tail.name())?.0)
    }
}

/// Reads through the WAL at `dir` and verifies metadata consistency and the
/// CRC chain without taking any locks. Returns the latest hard state.
pub fn verify(dir: &Path, snap: WalSnapshot) -> Result<HardState, WalError> {
    let names = read_wal_names(dir)?;
    let name_index = search_index(&names, snap.index).ok_or(WalError::FileNotFound)?;
    if !is_valid_seq(&names[name_index..]) {
        return Err(WalError::FileNotFound);
    }
    let files = names[name_index..]
        .iter()
        .map(|n| File::open(dir.join(n)))
        .collect::<io::Result<Vec<_>>>()?;
    let mut decoder = Decoder::new(files)?;

    let mut metadata: Option<Vec<u8>> = None;
    let mut state = HardState::default();
    let mut matched = false;
    while let Some(rec) = decoder.decode()? {
        match rec.rtype {
            RecordType::Metadata => {
                if let Some(md) = &metadata {
                    if md != &rec.data {
                        return Err(WalError::MetadataConflict);
                    }
                }
                metadata = Some(rec.data);
            }
            RecordType::Crc => {
                let crc = decoder.crc();
                if crc != 0 {
                    rec.validate(crc)?;
                }
                decoder.update_crc(rec.crc);
            }
            RecordType::Snapshot => {
                let s: WalSnapshot = bincode::deserialize(&rec.data)
                    .map_err(|e| WalError::Corrupt(format!("decode snapshot marker: {e}")))?;
                if s.index == snap.index {
                    if s.term != snap.term {
                        return Err(WalError::SnapshotMismatch);
                    }
                    matched = true;
                }
            }
            RecordType::State => {
                state = bincode::deserialize(&rec.data)
                    .map_err(|e| WalError::Corrupt(format!("decode hard state: {e}")))?;
            }
            RecordType::Entry => {}
        }
    }
    if !matched {
        return Err(WalError::SnapshotNotFound);
    }
    Ok(state)
}

/// All snapshot markers recorded in the WAL whose index is at or below the
/// latest committed hard state, i.e. the positions a restart can recover
/// from.
pub fn valid_snapshot_entries(dir: &Path) -> Result<Vec<WalSnapshot>, WalError> {
    let names = read_wal_names(dir)?;
    let files = names
        .iter()
        .map(|n| File::open(dir.join(n)))
        .collect::<io::Result<Vec<_>>>()?;
    let mut decoder = Decoder::new(files)?;

    let mut snaps = Vec::new();
    let mut state = HardState::default();
    while let Some(rec) = decoder.decode()? {
        match rec.rtype {
            RecordType::Snapshot => {
                let s: WalSnapshot = bincode::deserialize(&rec.data)
                    .map_err(|e| WalError::Corrupt(format!("decode snapshot marker: {e}")))?;
                snaps.push(s);
            }
            RecordType::State => {
                state = bincode::deserialize(&rec.data)
                    .map_err(|e| WalError::Corrupt(format!("decode hard state: {e}")))?;
            }
            RecordType::Crc => {
                let crc = decoder.crc();
                if crc != 0 {
                    rec.validate(crc)?;
                }
                decoder.update_crc(rec.crc);
            }
            _ => {}
        }
    }
    snaps.retain(|s| s.index <= state.commit);
    Ok(snaps)
}

fn remove_stale_temp_files(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().ends_with(".tmp") {
            tracing::warn!(file = %entry.path().display(), "removing stale temporary WAL file");
            let _ = fs::remove_file(entry.path());
        }
    }
}

fn wal_name(seq: u64, index: u64) -> String {
    format!("{seq:016x}-{index:016x}.wal")
}

fn parse_wal_name(name: &str) -> Result<(u64, u64), WalError> {
    let base = name.strip_suffix(".wal").ok_or(WalError::FileNotFound)?;
    let (seq, index) = base.split_once('-').ok_or(WalError::FileNotFound)?;
    let seq = u64::from_str_radix(seq, 16).map_err(|_| WalError::FileNotFound)?;
    let index = u64::from_str_radix(index, 16).map_err(|_| WalError::FileNotFound)?;
    Ok((seq, index))
}

fn read_wal_names(dir: &Path) -> Result<Vec<String>, WalError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if parse_wal_name(&name).is_ok() {
            names.push(name);
        } else if name.ends_with(".wal") {
            tracing::warn!(file = %name, "ignoring WAL file with unparsable name");
        }
    }
    if names.is_empty() {
        return Err(WalError::FileNotFound);
    }
    names.sort();
    Ok(names)
}

/// Index of the segment with the greatest first-index at or below `index`.
fn search_index(names: &[String], index: u64) -> Option<usize> {
    for i in (0..names.len()).rev() {
        let (_, cur_index) = parse_wal_name(&names[i]).ok()?;
        if index >= cur_index {
            return Some(i);
        }
    }
    None
}

/// Segment sequence numbers must increase by exactly one.
fn is_valid_seq(names: &[String]) -> bool {
    let mut last_seq = 0u64;
    for (i, name) in names.iter().enumerate() {
        let Ok((cur_seq, _)) = parse_wal_name(name) else {
            return false;
        };
        if i > 0 && cur_seq != last_seq + 1 {
            return false;
        }
        last_seq = cur_seq;
    }
    true
}

#[cfg(test)]
mod name_tests {
    use super::*;

    #[test]
    fn test_wal_name_round_trip() {
        let name = wal_name(3, 0x1234);
        assert_eq!(name, "0000000000000003-0000000000001234.wal");
        assert_eq!(parse_wal_name(&name).unwrap(), (3, 0x1234));
        assert!(parse_wal_name("0.tmp").is_err());
        assert!(parse_wal_name("garbage.wal").is_err());
    }

    #[test]
    fn test_search_index() {
        let names = vec![wal_name(0, 0), wal_name(1, 10), wal_name(2, 20)];
        assert_eq!(search_index(&names, 0), Some(0));
        assert_eq!(search_index(&names, 5), Some(0));
        assert_eq!(search_index(&names, 10), Some(1));
        assert_eq!(search_index(&names, 19), Some(1));
        assert_eq!(search_index(&names, 25), Some(2));
    }

    #[test]
    fn test_is_valid_seq() {
        assert!(is_valid_seq(&[wal_name(0, 0), wal_name(1, 5), wal_name(2, 9)]));
        assert!(!is_valid_seq(&[wal_name(0, 0), wal_name(2, 9)]));
    }
}
