//! Redo Engine (spec §4.9): replays a serialized walblog stream onto a raw
//! block device, merging contiguous IOs and respecting discard records.
//!
//! Grounded on `tool/wlog/wlredo.cpp`'s `IoQueue` (merge-adjacent, 1 MiB cap)
//! and `OverlappedData` (per-range submission ordering); the latter is the
//! same conceptual structure as [`crate::overlap::OverlapTable`].

use std::collections::VecDeque;
use std::io::Read;

use bytes::{Buf, Bytes};
use tracing::{debug, info, warn};

use crate::device::{Bio, BlockDevice, SECTOR_SIZE};
use crate::error::{Result, WalbError};
use crate::logpack::{LogpackHeader, RecordFlags};

/// Header prefixing a serialized log stream: `{sector_type, physical_block_size, salt}`.
pub struct WalbLogHeader {
    pub physical_block_size: u32,
    pub log_checksum_salt: u32,
}

const LOG_HEADER_SECTOR_TYPE: u16 = 0x0102;
const LOG_HEADER_LEN: usize = 512;

impl WalbLogHeader {
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut buf = vec![0u8; LOG_HEADER_LEN];
        r.read_exact(&mut buf)?;
        let mut block = Bytes::from(buf);
        let sector_type = block.get_u16_le();
        if sector_type != LOG_HEADER_SECTOR_TYPE {
            return Err(WalbError::InvalidLogpackHeader(format!(
                "unexpected walblog header sector_type {sector_type}"
            )));
        }
        block.advance(2); // reserved/alignment
        let physical_block_size = block.get_u32_le();
        let log_checksum_salt = block.get_u32_le();
        Ok(Self {
            physical_block_size,
            log_checksum_salt,
        })
    }
}

/// One physically contiguous IO pending submission, possibly the result of
/// merging several adjacent log records.
struct PendingIo {
    pos_sectors: u64,
    data: Vec<u8>,
    discard_sectors: u64,
}

impl PendingIo {
    fn end_sector(&self) -> u64 {
        self.pos_sectors + (self.data.len() as u64 / SECTOR_SIZE) + self.discard_sectors
    }

    fn budget_bytes(&self) -> usize {
        self.data.len() + (self.discard_sectors * SECTOR_SIZE) as usize
    }
}

pub struct RedoEngine {
    physical_block_size: usize,
    log_checksum_salt: u32,
    merge_cap_bytes: usize,
    /// Bounded in-flight budget in bytes (spec §4.9 "Queue discipline":
    /// `queue_size = buffer_bytes / block_size` physical blocks).
    queue_budget_bytes: usize,
}

pub struct RedoStats {
    pub logpacks_applied: u64,
    pub records_applied: u64,
    pub ios_submitted: u64,
}

impl RedoEngine {
    pub fn new(header: &WalbLogHeader, merge_cap_bytes: usize, buffer_bytes: usize) -> Self {
        let physical_block_size = header.physical_block_size as usize;
        let queue_size_pb = buffer_bytes / physical_block_size;
        Self {
            physical_block_size,
            log_checksum_salt: header.log_checksum_salt,
            merge_cap_bytes,
            queue_budget_bytes: queue_size_pb * physical_block_size,
        }
    }

    /// Read logpacks from `stream` until EOF or a structural error, applying
    /// each to `target`. Returns once the stream is exhausted and every IO
    /// has been submitted and `fdatasync`ed.
    pub fn run<R: Read>(&self, stream: &mut R, target: &dyn BlockDevice) -> Result<RedoStats> {
        let mut stats = RedoStats {
            logpacks_applied: 0,
            records_applied: 0,
            ios_submitted: 0,
        };
        let mut queue: VecDeque<PendingIo> = VecDeque::new();

        loop {
            let header = match self.read_logpack_header(stream) {
                Ok(Some(h)) => h,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "stopping replay on invalid logpack header");
                    return Err(e);
                }
            };

            for rec in &header.records {
                if rec.flags.contains(RecordFlags::PADDING) {
                    continue;
                }
                if rec.flags.contains(RecordFlags::DISCARD) {
                    // A discard must apply after every write queued ahead of
                    // it, so drain the whole queue before issuing it.
                    self.drain_all(&mut queue, target, &mut stats)?;
                    target.submit(&Bio::new_discard(rec.offset_lb, rec.io_size_lb as u64))?;
                    stats.ios_submitted += 1;
                    stats.records_applied += 1;
                    continue;
                }

                let payload = self.read_payload(stream, rec.io_size_lb)?;
                self.merge_or_queue(&mut queue, rec.offset_lb, payload, target, &mut stats)?;
                stats.records_applied += 1;
            }

            stats.logpacks_applied += 1;
        }

        self.drain_all(&mut queue, target, &mut stats)?;
        target.flush()?;
        info!(
            logpacks = stats.logpacks_applied,
            records = stats.records_applied,
            ios = stats.ios_submitted,
            "replay complete"
        );
        Ok(stats)
    }

    fn read_logpack_header<R: Read>(&self, stream: &mut R) -> Result<Option<LogpackHeader>> {
        let mut buf = vec![0u8; self.physical_block_size];
        match stream.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let header = LogpackHeader::decode(Bytes::from(buf), self.log_checksum_salt, self.physical_block_size)?;
        Ok(Some(header))
    }

    fn read_payload<R: Read>(&self, stream: &mut R, io_size_lb: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; io_size_lb as usize * SECTOR_SIZE as usize];
        stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Merge into the queue's tail IO if contiguous and within the merge
    /// cap, otherwise append a new entry. Once appended, the queue head is
    /// drained until the total queued budget is back under
    /// `queue_budget_bytes` (spec §4.9 "Queue discipline").
    fn merge_or_queue(
        &self,
        queue: &mut VecDeque<PendingIo>,
        offset_lb: u64,
        payload: Vec<u8>,
        target: &dyn BlockDevice,
        stats: &mut RedoStats,
    ) -> Result<()> {
        if let Some(p) = queue.back_mut() {
            let contiguous = p.discard_sectors == 0 && p.end_sector() == offset_lb;
            let within_cap = p.data.len() + payload.len() <= self.merge_cap_bytes;
            if contiguous && within_cap {
                p.data.extend_from_slice(&payload);
                return self.enforce_budget(queue, target, stats);
            }
        }
        queue.push_back(PendingIo {
            pos_sectors: offset_lb,
            data: payload,
            discard_sectors: 0,
        });
        self.enforce_budget(queue, target, stats)
    }

    /// While the queue holds more than `queue_budget_bytes`, wait for the
    /// head IO (submit is synchronous, so waiting collapses to submitting
    /// it now) and release its blocks before re-checking the budget.
    fn enforce_budget(
        &self,
        queue: &mut VecDeque<PendingIo>,
        target: &dyn BlockDevice,
        stats: &mut RedoStats,
    ) -> Result<()> {
        if self.queue_budget_bytes == 0 {
            return Ok(());
        }
        let mut queued: usize = queue.iter().map(PendingIo::budget_bytes).sum();
        while queued > self.queue_budget_bytes {
            let Some(head) = queue.pop_front() else { break };
            queued -= head.budget_bytes();
            self.submit_one(head, target, stats)?;
        }
        Ok(())
    }

    fn drain_all(&self, queue: &mut VecDeque<PendingIo>, target: &dyn BlockDevice, stats: &mut RedoStats) -> Result<()> {
        while let Some(p) = queue.pop_front() {
            self.submit_one(p, target, stats)?;
        }
        Ok(())
    }

    fn submit_one(&self, p: PendingIo, target: &dyn BlockDevice, stats: &mut RedoStats) -> Result<()> {
        debug!(pos = p.pos_sectors, bytes = p.data.len(), "submitting merged IO");
        target.submit(&Bio::new_write(p.pos_sectors, p.data))?;
        stats.ios_submitted += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileDevice;
    use bytes::{BufMut, BytesMut};
    use std::io::Cursor;

    fn walblog_header(pbs: u32, salt: u32) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(LOG_HEADER_LEN);
        buf.put_u16_le(LOG_HEADER_SECTOR_TYPE);
        buf.put_u16_le(0);
        buf.put_u32_le(pbs);
        buf.put_u32_le(salt);
        buf.resize(LOG_HEADER_LEN, 0);
        buf.to_vec()
    }

    fn logpack_bytes(pbs: usize, salt: u32, logpack_lsid: u64, records: Vec<crate::logpack::LogRecord>, total_io_size_pb: u16) -> Vec<u8> {
        let mut h = LogpackHeader::new(logpack_lsid);
        h.records = records;
        h.total_io_size_pb = total_io_size_pb;
        h.encode(pbs, salt).to_vec()
    }

    #[test]
    fn replays_a_single_record_logpack() {
        let pbs = 4096usize;
        let salt = 7u32;
        let mut stream = Vec::new();
        stream.extend(walblog_header(pbs as u32, salt));
        stream.extend(logpack_bytes(
            pbs,
            salt,
            0,
            vec![crate::logpack::LogRecord {
                flags: RecordFlags::EXIST,
                checksum: 0,
                lsid: 1,
                lsid_local: 0,
                io_size_lb: 8,
                offset_lb: 100,
            }],
            1,
        ));
        stream.extend(vec![0x99u8; 4096]); // payload

        let dir = tempfile::tempdir().unwrap();
        let dev = FileDevice::open(dir.path().join("target")).unwrap();

        let mut cursor = Cursor::new(&stream[..LOG_HEADER_LEN]);
        let walb_header = WalbLogHeader::read_from(&mut cursor).unwrap();
        let mut rest = Cursor::new(&stream[LOG_HEADER_LEN..]);
        let engine = RedoEngine::new(&walb_header, 1024 * 1024, 16 * 1024 * 1024);
        let stats = engine.run(&mut rest, &dev).unwrap();

        assert_eq!(stats.logpacks_applied, 1);
        assert_eq!(stats.records_applied, 1);
        let written = dev.read_at(100, 8).unwrap();
        assert_eq!(written, vec![0x99u8; 4096]);
    }

    #[test]
    fn adjacent_records_are_merged_into_one_io() {
        let pbs = 4096usize;
        let salt = 3u32;
        let mut stream = Vec::new();
        stream.extend(walblog_header(pbs as u32, salt));
        stream.extend(logpack_bytes(
            pbs,
            salt,
            0,
            vec![
                crate::logpack::LogRecord {
                    flags: RecordFlags::EXIST,
                    checksum: 0,
                    lsid: 1,
                    lsid_local: 0,
                    io_size_lb: 8,
                    offset_lb: 0,
                },
                crate::logpack::LogRecord {
                    flags: RecordFlags::EXIST,
                    checksum: 0,
                    lsid: 2,
                    lsid_local: 1,
                    io_size_lb: 8,
                    offset_lb: 8,
                },
            ],
            2,
        ));
        stream.extend(vec![0xAAu8; 4096]);
        stream.extend(vec![0xBBu8; 4096]);

        let dir = tempfile::tempdir().unwrap();
        let dev = FileDevice::open(dir.path().join("target")).unwrap();
        let mut header_cursor = Cursor::new(&stream[..LOG_HEADER_LEN]);
        let walb_header = WalbLogHeader::read_from(&mut header_cursor).unwrap();
        let mut rest = Cursor::new(&stream[LOG_HEADER_LEN..]);
        let engine = RedoEngine::new(&walb_header, 1024 * 1024, 16 * 1024 * 1024);
        let stats = engine.run(&mut rest, &dev).unwrap();

        assert_eq!(stats.ios_submitted, 1); // merged into a single contiguous write
        let written = dev.read_at(0, 16).unwrap();
        assert_eq!(&written[..4096], &vec![0xAAu8; 4096][..]);
        assert_eq!(&written[4096..], &vec![0xBBu8; 4096][..]);
    }

    #[test]
    fn tiny_buffer_budget_still_applies_every_non_contiguous_write() {
        // Three 1-pb writes at disjoint offsets, none of them mergeable, with
        // a budget of exactly one physical block -- every push forces the
        // queue head out before the next record can be accepted.
        let pbs = 4096usize;
        let salt = 1u32;
        let mut stream = Vec::new();
        stream.extend(walblog_header(pbs as u32, salt));
        stream.extend(logpack_bytes(
            pbs,
            salt,
            0,
            vec![
                crate::logpack::LogRecord {
                    flags: RecordFlags::EXIST,
                    checksum: 0,
                    lsid: 1,
                    lsid_local: 0,
                    io_size_lb: 8,
                    offset_lb: 0,
                },
                crate::logpack::LogRecord {
                    flags: RecordFlags::EXIST,
                    checksum: 0,
                    lsid: 2,
                    lsid_local: 1,
                    io_size_lb: 8,
                    offset_lb: 100,
                },
                crate::logpack::LogRecord {
                    flags: RecordFlags::EXIST,
                    checksum: 0,
                    lsid: 3,
                    lsid_local: 2,
                    io_size_lb: 8,
                    offset_lb: 200,
                },
            ],
            3,
        ));
        stream.extend(vec![0x11u8; 4096]);
        stream.extend(vec![0x22u8; 4096]);
        stream.extend(vec![0x33u8; 4096]);

        let dir = tempfile::tempdir().unwrap();
        let dev = FileDevice::open(dir.path().join("target")).unwrap();
        let mut header_cursor = Cursor::new(&stream[..LOG_HEADER_LEN]);
        let walb_header = WalbLogHeader::read_from(&mut header_cursor).unwrap();
        let mut rest = Cursor::new(&stream[LOG_HEADER_LEN..]);
        let engine = RedoEngine::new(&walb_header, 1024 * 1024, pbs);
        let stats = engine.run(&mut rest, &dev).unwrap();

        assert_eq!(stats.ios_submitted, 3);
        assert_eq!(dev.read_at(0, 8).unwrap(), vec![0x11u8; 4096]);
        assert_eq!(dev.read_at(100, 8).unwrap(), vec![0x22u8; 4096]);
        assert_eq!(dev.read_at(200, 8).unwrap(), vec![0x33u8; 4096]);
    }
}
