use std::fs::File;
use std::io::{self, BufReader, Read};

use osprey_common::error::WalError;

use super::record::{decode_frame_size, Record, RecordType, FRAME_HEADER_BYTES, MIN_SECTOR_SIZE};

struct SegmentReader {
    r: BufReader<File>,
    size: u64,
}

/// Decodes frames forward across an ordered set of segment files, verifying
/// the CRC chain as it goes.
///
/// A partially written final record is detected by splitting its bytes on
/// sector boundaries: a fully zeroed sector means the write was torn, and
/// the decoder reports clean end-of-log instead of corruption. The caller
/// rewinds to `last_offset()` and zeroes the tail before appending again.
pub(crate) struct Decoder {
    segments: Vec<SegmentReader>,
    index: usize,
    /// File offset following the last valid decoded record, within the
    /// segment currently being read.
    last_valid_off: u64,
    crc: u32,
}

impl Decoder {
    pub fn new(files: Vec<File>) -> io::Result<Self> {
        let mut segments = Vec::with_capacity(files.len());
        for f in files {
            let size = f.metadata()?.len();
            segments.push(SegmentReader {
                r: BufReader::new(f),
                size,
            });
        }
        Ok(Self {
            segments,
            index: 0,
            last_valid_off: 0,
            crc: 0,
        })
    }

    /// Returns the next record, or `None` at the end of the decodable log
    /// (clean EOF, preallocated zeros, or a torn tail write).
    pub fn decode(&mut self) -> Result<Option<Record>, WalError> {
        loop {
            if self.index >= self.segments.len() {
                return Ok(None);
            }

            let seg = &mut self.segments[self.index];
            let mut len_buf = [0u8; 8];
            let n = read_full(&mut seg.r, &mut len_buf)?;
            if n == 0 {
                // end of this segment; move on to the next
                self.index += 1;
                self.last_valid_off = 0;
                continue;
            }
            if n < len_buf.len() {
                // a torn length field can only happen on the last segment
                if self.on_last_segment() {
                    return Ok(None);
                }
                return Err(WalError::Corrupt(
                    "short frame length field mid-log".into(),
                ));
            }

            let len_field = u64::from_le_bytes(len_buf);
            if len_field == 0 {
                // hit the preallocated tail
                self.index += 1;
                self.last_valid_off = 0;
                continue;
            }

            let (rec_bytes, pad_bytes) = decode_frame_size(len_field);

            // a frame cannot be longer than what remains of the file
            let limit = seg
                .size
                .saturating_sub(self.last_valid_off + FRAME_HEADER_BYTES + pad_bytes);
            if rec_bytes > limit {
                if self.on_last_segment() {
                    return Ok(None);
                }
                return Err(WalError::Corrupt(format!(
                    "frame of {rec_bytes} bytes exceeds remaining segment size {limit}"
                )));
            }

            let mut data = vec![0u8; (rec_bytes + pad_bytes) as usize];
            let n = read_full(&mut seg.r, &mut data)?;
            if n < data.len() {
                if self.on_last_segment() {
                    return Ok(None);
                }
                return Err(WalError::Corrupt("short frame payload mid-log".into()));
            }

            let rec: Record = match bincode::deserialize(&data[..rec_bytes as usize]) {
                Ok(rec) => rec,
                Err(e) => {
                    if self.is_torn_entry(&data) {
                        return Ok(None);
                    }
                    return Err(WalError::Corrupt(format!("decode record: {e}")));
                }
            };

            // the crc record itself re-anchors the chain; everything else
            // must extend it
            if rec.rtype != RecordType::Crc {
                self.crc = crc32c::crc32c_append(self.crc, &rec.data);
                if rec.validate(self.crc).is_err() {
                    if self.is_torn_entry(&data) {
                        return Ok(None);
                    }
                    return Err(WalError::CrcMismatch);
                }
            }

            self.last_valid_off += FRAME_HEADER_BYTES + rec_bytes + pad_bytes;
            return Ok(Some(rec));
        }
    }

    /// Whether the frame bytes at the current offset carry a fully zeroed
    /// sector, the signature of a torn write. Only meaningful on the last
    /// segment; anywhere else a bad frame is corruption.
    fn is_torn_entry(&self, data: &[u8]) -> bool {
        if !self.on_last_segment() {
            return false;
        }
        let mut file_off = self.last_valid_off + FRAME_HEADER_BYTES;
        let mut cur = 0usize;
        while cur < data.len() {
            let chunk_len =
                ((MIN_SECTOR_SIZE - (file_off % MIN_SECTOR_SIZE)) as usize).min(data.len() - cur);
            let sector = &data[cur..cur + chunk_len];
            if sector.iter().all(|&b| b == 0) {
                return true;
            }
            file_off += chunk_len as u64;
            cur += chunk_len;
        }
        false
    }

    fn on_last_segment(&self) -> bool {
        self.index + 1 >= self.segments.len()
    }

    /// Re-anchors the chain at the checksum carried by a crc record.
    pub fn update_crc(&mut self, prev_crc: u32) {
        self.crc = prev_crc;
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    /// Offset just past the last valid record in the segment being read.
    pub fn last_offset(&self) -> u64 {
        self.last_valid_off
    }
}

/// Reads until `buf` is full or EOF; returns the number of bytes read.
fn read_full(r: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        let n = r.read(&mut buf[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(read)
}
