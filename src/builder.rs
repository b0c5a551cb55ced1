//! Logpack Builder: groups incoming writes into `Pack`s, assigning LSNs and
//! inserting padding records so no pack straddles the ring-buffer wrap.
//!
//! Grounded on `module/io.c::writepack_add_bio_wrapper` /
//! `writepack_check_and_set_flush`.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::bio_wrapper::{BioState, BioWrapper};
use crate::checksum;
use crate::config::WalbConfig;
use crate::error::{Result, WalbError};
use crate::logpack::{LogRecord, RecordFlags};
use crate::pack::Pack;

pub struct LogpackBuilder {
    cfg: WalbConfig,
    lb_per_pb: u64,
    latest_lsid: u64,
    flush_lsid: u64,
    last_flush_at: Instant,
    open: Option<Pack>,
    oldest: u64,
}

impl LogpackBuilder {
    pub fn new(cfg: WalbConfig, start_lsid: u64) -> Self {
        let lb_per_pb = (cfg.physical_block_size / 512) as u64;
        Self {
            cfg,
            lb_per_pb,
            latest_lsid: start_lsid,
            flush_lsid: start_lsid,
            last_flush_at: Instant::now(),
            open: None,
            oldest: 0,
        }
    }

    pub fn latest_lsid(&self) -> u64 {
        self.latest_lsid
    }

    fn lb_to_pb(&self, lb: u64) -> u64 {
        lb.div_ceil(self.lb_per_pb)
    }

    /// Feed one wrapper into the builder. Returns any packs that were sealed
    /// as a result (zero, one, or — on a wrap split — more than one).
    pub fn add(&mut self, wrapper: Arc<Mutex<BioWrapper>>) -> Result<Vec<Pack>> {
        let (pos, len_sectors, is_flush, is_discard) = {
            let w = wrapper.lock();
            (w.pos, w.len_sectors, w.original.is_flush, w.direction == crate::device::BioDirection::Discard)
        };

        if self.latest_lsid.saturating_sub(self.oldest_hint()) > self.cfg.ring_buffer_size {
            return Err(WalbError::LogOverflow(self.cfg.ring_buffer_size));
        }

        let mut sealed = Vec::new();

        // Flush-only marker (zero length): always starts (and alone fills) its own pack.
        if len_sectors == 0 && is_flush {
            if let Some(pack) = self.open.take() {
                sealed.push(self.seal(pack));
            }
            let mut pack = Pack::new(self.latest_lsid);
            pack.is_zero_flush_only = true;
            pack.is_flush_contained = true;
            pack.bios.push(Arc::clone(&wrapper));
            wrapper.lock().transition(BioState::InLogSubmit);
            sealed.push(self.seal(pack));
            self.flush_lsid = self.latest_lsid;
            self.last_flush_at = Instant::now();
            return Ok(sealed);
        }

        let io_size_lb = len_sectors;
        let io_size_pb = self.lb_to_pb(io_size_lb) as u32;

        // Rule 2: flush must be first record of its pack.
        if is_flush {
            if let Some(pack) = &self.open {
                if pack.header.n_records() > 0 {
                    let pack = self.open.take().unwrap();
                    sealed.push(self.seal(pack));
                }
            }
        }

        // Rule 3: size limit.
        if let Some(pack) = &self.open {
            if pack.header.total_io_size_pb as u32 + io_size_pb > self.cfg.max_logpack_pb {
                let pack = self.open.take().unwrap();
                sealed.push(self.seal(pack));
            }
        }

        if self.open.is_none() {
            self.open = Some(Pack::new(self.latest_lsid));
        }

        // Rule 4: wrap handling -- pad to the wrap boundary if this record
        // would straddle it.
        let ring = self.cfg.ring_buffer_size;
        let pack_start = self.open.as_ref().unwrap().logpack_lsid();
        let header_occupied = 1u64; // the header block itself occupies 1 pb in the ring.
        let data_start = pack_start + header_occupied + self.open.as_ref().unwrap().header.total_io_size_pb as u64;
        let ring_pos = data_start % ring;
        if ring > 0 && ring_pos + io_size_pb as u64 > ring {
            let residual = ring - ring_pos;
            if residual > 0 {
                let pack = self.open.as_mut().unwrap();
                pack.header.records.push(LogRecord {
                    flags: RecordFlags::PADDING,
                    checksum: 0,
                    lsid: pack_start + header_occupied + pack.header.total_io_size_pb as u64,
                    lsid_local: pack.header.total_io_size_pb,
                    io_size_lb: (residual * self.lb_per_pb) as u32,
                    offset_lb: 0,
                });
                pack.header.total_io_size_pb += residual as u16;
                pack.header.n_padding += 1;
            }
            let padded_pack = self.open.take().unwrap();
            sealed.push(self.seal(padded_pack));
            let next_start = data_start + residual;
            debug_assert_eq!(next_start % ring, 0);
            self.open = Some(Pack::new(next_start));
        }

        // Append the real record.
        let pack = self.open.as_mut().unwrap();
        let lsid_local = pack.header.total_io_size_pb;
        let rec_lsid = pack.logpack_lsid() + header_occupied + lsid_local as u64;
        let flags = if is_discard {
            RecordFlags::EXIST | RecordFlags::DISCARD
        } else {
            RecordFlags::EXIST
        };
        let checksum_val = {
            let w = wrapper.lock();
            if is_discard {
                0
            } else {
                checksum::checksum(&w.original.data, 0)
            }
        };
        pack.header.records.push(LogRecord {
            flags,
            checksum: checksum_val,
            lsid: rec_lsid,
            lsid_local,
            io_size_lb: io_size_lb as u32,
            offset_lb: pos,
        });
        if !is_discard {
            pack.header.total_io_size_pb += io_size_pb as u16;
        }
        {
            let mut w = wrapper.lock();
            w.lsid = rec_lsid;
            w.transition(BioState::InLogSubmit);
        }
        pack.bios.push(Arc::clone(&wrapper));

        if is_flush {
            pack.is_flush_contained = true;
            self.flush_lsid = if is_discard { pack.next_lsid() } else { rec_lsid };
            self.last_flush_at = Instant::now();
        }

        Ok(sealed)
    }

    /// Seal the currently open pack (if any) without waiting for more input,
    /// e.g. at shutdown or when a batch boundary is reached.
    pub fn flush_open(&mut self) -> Option<Pack> {
        self.open.take().map(|p| self.seal(p))
    }

    fn seal(&mut self, mut pack: Pack) -> Pack {
        pack.finalize_zero_flush_check();
        self.latest_lsid = pack.next_lsid();

        let promote = self.latest_lsid.saturating_sub(self.flush_lsid) > self.cfg.log_flush_interval_pb
            || self.last_flush_at.elapsed() > self.cfg.log_flush_interval_jiffies;
        if promote && !pack.is_zero_flush_only {
            pack.is_flush_header = true;
            self.flush_lsid = self.latest_lsid;
            self.last_flush_at = Instant::now();
        }
        pack
    }

    fn oldest_hint(&self) -> u64 {
        // The builder only enforces the overflow guard against its own
        // high-water mark; the GC-driven `oldest` cursor is supplied by the
        // caller through `set_oldest_hint` in the full pipeline.
        self.oldest
    }

    pub fn set_oldest_hint(&mut self, oldest: u64) {
        self.oldest = oldest;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Bio;

    fn wrapper(pos: u64, data: Vec<u8>) -> Arc<Mutex<BioWrapper>> {
        Arc::new(Mutex::new(BioWrapper::new(Bio::new_write(pos, data), 0)))
    }

    fn test_config() -> WalbConfig {
        let mut cfg = WalbConfig::default();
        cfg.physical_block_size = 4096;
        cfg.max_logpack_pb = 256;
        cfg.ring_buffer_size = 1024;
        cfg
    }

    #[test]
    fn single_write_produces_one_record_pack() {
        let mut builder = LogpackBuilder::new(test_config(), 0);
        let w = wrapper(0, vec![0xAAu8; 4096]);
        let mut sealed = builder.add(Arc::clone(&w)).unwrap();
        sealed.extend(builder.flush_open());

        assert_eq!(sealed.len(), 1);
        let pack = &sealed[0];
        assert_eq!(pack.header.n_records(), 1);
        assert_eq!(pack.header.total_io_size_pb, 1);
        assert_eq!(w.lock().lsid, 1); // header at lsid 0, payload at lsid 1
        assert_eq!(builder.latest_lsid(), 2);
    }

    #[test]
    fn flush_only_bio_is_its_own_zero_record_pack() {
        let mut builder = LogpackBuilder::new(test_config(), 0);
        let w = Arc::new(Mutex::new(BioWrapper::new(Bio::new_flush(), 0)));

        let sealed = builder.add(w).unwrap();
        assert_eq!(sealed.len(), 1);
        assert!(sealed[0].is_zero_flush_only);
        assert_eq!(sealed[0].header.n_records(), 0);
    }

    #[test]
    fn write_straddling_the_wrap_gets_a_padding_record() {
        let mut cfg = test_config();
        cfg.ring_buffer_size = 8;
        let mut builder = LogpackBuilder::new(cfg, 6);

        // 4 physical blocks = 32 sectors = 16384 bytes.
        let w = wrapper(0, vec![0x11u8; 16384]);
        let mut sealed = builder.add(w).unwrap();
        sealed.extend(builder.flush_open());

        // First pack: header at lsid 6, padding fills the single remaining
        // slot at lsid 7 before the ring wraps back to 0.
        assert_eq!(sealed[0].logpack_lsid(), 6);
        assert_eq!(sealed[0].header.n_padding, 1);
        assert_eq!(sealed[0].header.total_io_size_pb, 1);

        // Second pack opens wrap-aligned at lsid 8 (== 0 mod 8) with the real record.
        assert_eq!(sealed[1].logpack_lsid(), 8);
        assert_eq!(sealed[1].header.n_records(), 1);
    }

    #[test]
    fn overflow_guard_fails_when_ring_would_be_exceeded() {
        let mut cfg = test_config();
        cfg.ring_buffer_size = 4;
        let mut builder = LogpackBuilder::new(cfg, 0);
        builder.set_oldest_hint(0);
        builder.latest_lsid = 10; // simulate a builder far past the ring size vs. oldest
        let w = wrapper(0, vec![0u8; 4096]);
        assert!(matches!(builder.add(w), Err(WalbError::LogOverflow(_))));
    }
}
