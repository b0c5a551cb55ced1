//! On-disk logpack header layout, record flags, and (de)serialization.
//!
//! One physical block: `{sector_type, total_io_size_pb, checksum,
//! logpack_lsid, n_records, n_padding, record[]}`. Encoding is a fixed byte
//! layout (not `serde`/`bincode`) so the bytes on disk match the spec's field
//! order exactly and the self-verifying checksum property holds.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::checksum;
use crate::error::{Result, WalbError};

pub const SECTOR_TYPE_LOGPACK: u16 = 1;
/// Fixed header prefix before the record array:
/// u16 + u16 + u32 + u64 + u16 + u16 = 20 bytes.
const HEADER_PREFIX_LEN: usize = 20;
/// Each record: u32 flags + u32 checksum + u64 lsid + u16 lsid_local + u32 io_size + u64 offset.
const RECORD_LEN: usize = 4 + 4 + 8 + 2 + 4 + 8;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RecordFlags: u32 {
        const EXIST   = 0b001;
        const PADDING = 0b010;
        const DISCARD = 0b100;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub flags: RecordFlags,
    pub checksum: u32,
    pub lsid: u64,
    pub lsid_local: u16,
    pub io_size_lb: u32,
    pub offset_lb: u64,
}

#[derive(Debug, Clone)]
pub struct LogpackHeader {
    pub total_io_size_pb: u16,
    pub checksum: u32,
    pub logpack_lsid: u64,
    pub n_padding: u16,
    pub records: Vec<LogRecord>,
}

impl LogpackHeader {
    pub fn new(logpack_lsid: u64) -> Self {
        Self {
            total_io_size_pb: 0,
            checksum: 0,
            logpack_lsid,
            n_padding: 0,
            records: Vec::new(),
        }
    }

    pub fn n_records(&self) -> u16 {
        self.records.len() as u16
    }

    /// Encode the header into a zero-padded physical block and stamp its
    /// self-verifying checksum (the field is zeroed before folding).
    pub fn encode(&self, pbs: usize, salt: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(pbs);
        buf.put_u16_le(SECTOR_TYPE_LOGPACK);
        buf.put_u16_le(self.total_io_size_pb);
        buf.put_u32_le(0); // checksum placeholder
        buf.put_u64_le(self.logpack_lsid);
        buf.put_u16_le(self.n_records());
        buf.put_u16_le(self.n_padding);
        for rec in &self.records {
            buf.put_u32_le(rec.flags.bits());
            buf.put_u32_le(rec.checksum);
            buf.put_u64_le(rec.lsid);
            buf.put_u16_le(rec.lsid_local);
            buf.put_u32_le(rec.io_size_lb);
            buf.put_u64_le(rec.offset_lb);
        }
        buf.resize(pbs, 0);

        let sum = checksum::checksum(&buf, salt);
        buf[4..8].copy_from_slice(&sum.to_le_bytes());
        buf.freeze()
    }

    /// Decode and validate a physical block read back from the log device.
    /// `pbs` is the physical block size in bytes, needed to convert each
    /// record's sector count into physical blocks the same way the builder
    /// does (a pb is `pbs / 512` sectors, not always one sector).
    pub fn decode(mut block: Bytes, salt: u32, pbs: usize) -> Result<Self> {
        if !checksum::verify(&block, salt) {
            return Err(WalbError::ChecksumMismatch { lsid: 0 });
        }

        if block.len() < HEADER_PREFIX_LEN {
            return Err(WalbError::InvalidLogpackHeader("block too short".into()));
        }
        let sector_type = block.get_u16_le();
        if sector_type != SECTOR_TYPE_LOGPACK {
            return Err(WalbError::InvalidLogpackHeader(format!(
                "unexpected sector_type {sector_type}"
            )));
        }
        let total_io_size_pb = block.get_u16_le();
        let checksum_field = block.get_u32_le();
        let logpack_lsid = block.get_u64_le();
        let n_records = block.get_u16_le();
        let n_padding = block.get_u16_le();

        if n_padding > n_records {
            return Err(WalbError::InvalidLogpackHeader(
                "n_padding exceeds n_records".into(),
            ));
        }
        if n_padding > 1 {
            return Err(WalbError::InvalidLogpackHeader(
                "at most one padding record per logpack".into(),
            ));
        }

        let mut records = Vec::with_capacity(n_records as usize);
        for _ in 0..n_records {
            if block.remaining() < RECORD_LEN {
                return Err(WalbError::RecordOutOfRange(
                    "truncated record array".into(),
                ));
            }
            let flags = RecordFlags::from_bits_truncate(block.get_u32_le());
            let rec_checksum = block.get_u32_le();
            let lsid = block.get_u64_le();
            let lsid_local = block.get_u16_le();
            let io_size_lb = block.get_u32_le();
            let offset_lb = block.get_u64_le();
            records.push(LogRecord {
                flags,
                checksum: rec_checksum,
                lsid,
                lsid_local,
                io_size_lb,
                offset_lb,
            });
        }

        let lb_per_pb = (pbs / 512) as u32;
        let declared_total: u32 = records
            .iter()
            .filter(|r| !r.flags.contains(RecordFlags::DISCARD))
            .map(|r| r.io_size_lb.div_ceil(lb_per_pb))
            .sum();
        if total_io_size_pb as u32 != declared_total && n_records > 0 {
            return Err(WalbError::InvalidLogpackHeader(format!(
                "total_io_size_pb {total_io_size_pb} != sum of record sizes {declared_total}"
            )));
        }

        Ok(Self {
            total_io_size_pb,
            checksum: checksum_field,
            logpack_lsid,
            n_padding,
            records,
        })
    }

    pub fn is_zero_flush_only(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> LogpackHeader {
        let mut h = LogpackHeader::new(10);
        h.records.push(LogRecord {
            flags: RecordFlags::EXIST,
            checksum: 0xdead_beef,
            lsid: 11,
            lsid_local: 0,
            io_size_lb: 8,
            offset_lb: 0,
        });
        h.total_io_size_pb = 1;
        h
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let h = sample_header();
        let block = h.encode(4096, 0x42);
        let decoded = LogpackHeader::decode(block, 0x42, 4096).unwrap();
        assert_eq!(decoded.logpack_lsid, 10);
        assert_eq!(decoded.n_records(), 1);
        assert_eq!(decoded.records[0].lsid, 11);
    }

    #[test]
    fn wrong_salt_fails_checksum_verification() {
        let h = sample_header();
        let block = h.encode(4096, 0x42);
        assert!(LogpackHeader::decode(block, 0x43, 4096).is_err());
    }

    #[test]
    fn multi_block_record_round_trips_with_default_pbs() {
        // 4096-byte pbs is 8 sectors; a 32-sector (16 KiB) write is 4 pb, not
        // 32 as a naive lb-is-a-pb conversion would compute.
        let mut h = LogpackHeader::new(10);
        h.records.push(LogRecord {
            flags: RecordFlags::EXIST,
            checksum: 0xdead_beef,
            lsid: 11,
            lsid_local: 0,
            io_size_lb: 32,
            offset_lb: 0,
        });
        h.total_io_size_pb = 4;
        let block = h.encode(4096, 0x99);
        let decoded = LogpackHeader::decode(block, 0x99, 4096).unwrap();
        assert_eq!(decoded.total_io_size_pb, 4);
    }

    #[test]
    fn two_padding_records_are_rejected() {
        let mut block = BytesMut::with_capacity(4096);
        block.put_u16_le(SECTOR_TYPE_LOGPACK);
        block.put_u16_le(0);
        block.put_u32_le(0);
        block.put_u64_le(0);
        block.put_u16_le(2); // n_records
        block.put_u16_le(2); // n_padding > 1
        block.resize(4096, 0);
        let sum = checksum::checksum(&block, 0);
        block[4..8].copy_from_slice(&sum.to_le_bytes());
        assert!(LogpackHeader::decode(block.freeze(), 0, 4096).is_err());
    }
}
