use std::fs::File;
use std::io::{self, BufWriter, Seek, Write};

use osprey_common::error::WalError;

use super::record::{encode_frame_size, Record, RecordType, FRAME_HEADER_BYTES};

const WRITE_BUFFER_BYTES: usize = 128 * 1024;

/// Serializes records into length-prefixed, 8-byte-aligned frames and
/// maintains the running CRC chain.
///
/// The encoder owns a duplicated handle of the current tail segment; the
/// duplicate shares the file offset with the original, so seeks performed on
/// the segment after a flush stay coherent.
pub(crate) struct Encoder {
    w: BufWriter<File>,
    crc: u32,
    /// Logical write offset including bytes still in the buffer.
    offset: u64,
}

impl Encoder {
    /// Wraps `file` at its current position, chaining the checksum from
    /// `prev_crc`.
    pub fn new(mut file: File, prev_crc: u32) -> io::Result<Self> {
        let offset = file.stream_position()?;
        Ok(Self {
            w: BufWriter::with_capacity(WRITE_BUFFER_BYTES, file),
            crc: prev_crc,
            offset,
        })
    }

    /// Appends one record. The record's `crc` field is stamped with the
    /// chain value after folding in this record's payload.
    pub fn encode(&mut self, rec: &mut Record) -> Result<(), WalError> {
        self.crc = crc32c::crc32c_append(self.crc, &rec.data);
        if rec.rtype != RecordType::Crc {
            rec.crc = self.crc;
        }
        let data =
            bincode::serialize(rec).map_err(|e| WalError::Corrupt(format!("encode record: {e}")))?;

        let (len_field, pad_bytes) = encode_frame_size(data.len());
        self.w.write_all(&len_field.to_le_bytes())?;
        self.w.write_all(&data)?;
        if pad_bytes != 0 {
            const PAD: [u8; 8] = [0; 8];
            self.w.write_all(&PAD[..pad_bytes])?;
        }
        self.offset += FRAME_HEADER_BYTES + (data.len() + pad_bytes) as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.w.flush()
    }

    pub fn file(&self) -> &File {
        self.w.get_ref()
    }

    /// Flushes the buffer and returns the on-disk offset of the underlying
    /// handle.
    pub fn flushed_offset(&mut self) -> io::Result<u64> {
        self.w.flush()?;
        let mut f: &File = self.w.get_ref();
        f.stream_position()
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    /// Logical offset of the next frame, counting unflushed bytes.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}
