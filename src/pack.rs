//! In-memory staging object for a logpack being built or in flight.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::bio_wrapper::BioWrapper;
use crate::logpack::LogpackHeader;

/// A group of `BioWrapper`s destined for one logpack.
pub struct Pack {
    pub header: LogpackHeader,
    pub bios: Vec<Arc<Mutex<BioWrapper>>>,
    pub is_zero_flush_only: bool,
    pub is_flush_contained: bool,
    pub is_flush_header: bool,
    pub is_logpack_failed: bool,
}

impl Pack {
    pub fn new(logpack_lsid: u64) -> Self {
        Self {
            header: LogpackHeader::new(logpack_lsid),
            bios: Vec::new(),
            is_zero_flush_only: false,
            is_flush_contained: false,
            is_flush_header: false,
            is_logpack_failed: false,
        }
    }

    pub fn logpack_lsid(&self) -> u64 {
        self.header.logpack_lsid
    }

    /// LSN of the logpack that follows this one: header block plus data.
    pub fn next_lsid(&self) -> u64 {
        self.header.logpack_lsid + 1 + self.header.total_io_size_pb as u64
    }

    pub fn finalize_zero_flush_check(&mut self) {
        if self.header.n_records() == 0 {
            self.is_zero_flush_only = true;
        }
    }
}
