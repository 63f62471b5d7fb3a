use osprey_common::error::WalError;
use serde::{Deserialize, Serialize};

/// Minimum disk sector size. Torn-write detection splits a failed record on
/// these boundaries; a fully zeroed sector distinguishes a torn write from
/// ordinary corruption.
pub(crate) const MIN_SECTOR_SIZE: u64 = 512;

/// Size of the frame length field preceding every record.
pub(crate) const FRAME_HEADER_BYTES: u64 = 8;

/// On-disk record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    /// Opaque application metadata, written once at the head of every
    /// segment and required to be identical across segments.
    Metadata,
    /// A replicated log entry.
    Entry,
    /// The consensus hard state, written after each batch of entries.
    State,
    /// Chains the running checksum from the previous segment.
    Crc,
    /// A snapshot marker (metadata only, the snapshot body travels out of
    /// band).
    Snapshot,
}

/// One WAL record. `crc` is the running Castagnoli checksum of every record
/// payload written so far, chained across segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub rtype: RecordType,
    pub crc: u32,
    pub data: Vec<u8>,
}

impl Record {
    pub(crate) fn validate(&self, crc: u32) -> Result<(), WalError> {
        if self.crc == crc {
            Ok(())
        } else {
            Err(WalError::CrcMismatch)
        }
    }
}

/// The snapshot position recorded in the WAL. Replay starts from the
/// greatest recorded marker at or below the snapshot the caller recovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalSnapshot {
    pub index: u64,
    pub term: u64,
}

/// Builds the 64-bit frame length field: low 56 bits carry the payload
/// length; when padding to 8-byte alignment is needed, the sign bit is set
/// and bits 56..59 carry the pad width. Alignment keeps the length field
/// itself from ever spanning a torn write.
pub(crate) fn encode_frame_size(data_bytes: usize) -> (u64, usize) {
    let mut len_field = data_bytes as u64;
    let pad_bytes = (8 - (data_bytes % 8)) % 8;
    if pad_bytes != 0 {
        len_field |= (0x80 | pad_bytes as u64) << 56;
    }
    (len_field, pad_bytes)
}

/// Inverse of `encode_frame_size`: returns (payload bytes, pad bytes).
pub(crate) fn decode_frame_size(len_field: u64) -> (u64, u64) {
    let rec_bytes = len_field & !(0xffu64 << 56);
    // non-zero padding is flagged by the sign bit
    let pad_bytes = if (len_field as i64) < 0 {
        (len_field >> 56) & 0x7
    } else {
        0
    };
    (rec_bytes, pad_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_round_trip() {
        for data_len in [0usize, 1, 7, 8, 9, 511, 512, 1 << 20] {
            let (len_field, pad) = encode_frame_size(data_len);
            assert_eq!((data_len + pad) % 8, 0, "unaligned frame for {data_len}");
            let (rec, dpad) = decode_frame_size(len_field);
            assert_eq!(rec, data_len as u64);
            assert_eq!(dpad, pad as u64);
        }
    }

    #[test]
    fn test_frame_size_sign_bit_only_when_padded() {
        let (len_field, pad) = encode_frame_size(16);
        assert_eq!(pad, 0);
        assert!((len_field as i64) >= 0);

        let (len_field, pad) = encode_frame_size(17);
        assert_eq!(pad, 7);
        assert!((len_field as i64) < 0);
    }

    #[test]
    fn test_record_validate() {
        let rec = Record {
            rtype: RecordType::Entry,
            crc: 7,
            data: vec![1, 2, 3],
        };
        assert!(rec.validate(7).is_ok());
        assert!(rec.validate(8).is_err());
    }
}
