//! Log Submitter: turns a sealed `Pack` into bios against the log device.
//!
//! Grounded on `module/io.c::submit_logpack` / `logpack_submit_header` /
//! `logpack_submit_bio_wrapper` / `logpack_submit_bio_wrapper_zero` /
//! `logpack_submit_flush`.

use crate::bio_wrapper::BioState;
use crate::config::WalbConfig;
use crate::device::{Bio, BlockDevice};
use crate::error::Result;
use crate::logpack::RecordFlags;
use crate::pack::Pack;

/// Maps a ring-relative lsid to an absolute sector offset on the log device.
fn ring_sector(cfg: &WalbConfig, lsid: u64) -> u64 {
    let spb = cfg.sectors_per_block();
    (cfg.ring_buffer_off + lsid % cfg.ring_buffer_size) * spb
}

pub struct LogSubmitter<'a> {
    cfg: &'a WalbConfig,
}

impl<'a> LogSubmitter<'a> {
    pub fn new(cfg: &'a WalbConfig) -> Self {
        Self { cfg }
    }

    /// Submit every bio belonging to `pack` to `log_device`, moving each of
    /// the pack's wrappers from `InLogSubmit` to `InLogWait`.
    pub fn submit(&self, pack: &Pack, log_device: &dyn BlockDevice) -> Result<()> {
        if pack.is_zero_flush_only {
            log_device.submit(&Bio::new_flush())?;
            for w in &pack.bios {
                w.lock().transition(BioState::InLogWait);
            }
            return Ok(());
        }

        let pbs = self.cfg.physical_block_size;
        let header_bytes = pack.header.encode(pbs, self.cfg.log_checksum_salt);
        let mut header_bio = Bio::new_write(ring_sector(self.cfg, pack.logpack_lsid()), header_bytes.to_vec());
        header_bio.is_flush = pack.is_flush_header;
        log_device.submit(&header_bio)?;

        for (rec, wrapper) in pack.header.records.iter().zip(&pack.bios) {
            if rec.flags.contains(RecordFlags::DISCARD) || rec.flags.contains(RecordFlags::PADDING) {
                continue;
            }
            let mut bio = wrapper.lock().original.deep_clone();
            bio.pos = ring_sector(self.cfg, rec.lsid);
            for chunk in bio.split(self.cfg.chunk_sectors) {
                log_device.submit(&chunk)?;
            }
        }

        for w in &pack.bios {
            w.lock().transition(BioState::InLogWait);
        }
        Ok(())
    }
}
