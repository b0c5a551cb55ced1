//! Engine configuration.
//!
//! Mirrors the tunables the kernel module exposes through sysfs, grouped by
//! the subsystem each governs.

use std::path::PathBuf;
use std::time::Duration;

/// WalB engine configuration.
#[derive(Debug, Clone)]
pub struct WalbConfig {
    // Ring buffer geometry
    /// Offset of the ring buffer on the log device, in physical blocks.
    pub ring_buffer_off: u64,
    /// Size of the ring buffer, in physical blocks.
    pub ring_buffer_size: u64,
    /// Physical block size in bytes.
    pub physical_block_size: usize,
    /// Salt mixed into every logpack header checksum.
    pub log_checksum_salt: u32,

    // Logpack builder
    /// Maximum physical blocks (header + data) per logpack.
    pub max_logpack_pb: u32,
    /// Distance (in physical blocks) between forced header flushes.
    pub log_flush_interval_pb: u64,
    /// Wall-clock interval between forced header flushes.
    pub log_flush_interval_jiffies: Duration,

    // Submission
    /// Bio alignment boundary for the log device, in sectors.
    pub chunk_sectors: u32,
    /// Bio alignment boundary for the data device, in sectors.
    pub ddev_chunk_sectors: u32,
    /// Number of packs drained per log-submit bulk.
    pub n_pack_bulk: usize,
    /// Number of IOs drained per data-submit bulk.
    pub n_io_bulk: usize,

    // Backpressure
    /// Pending-map size, in sectors, above which new submissions are throttled.
    pub max_pending_sectors: u64,
    /// Pending-map size, in sectors, below which throttling clears.
    pub min_pending_sectors: u64,
    /// How long a throttle persists before clearing unconditionally.
    pub queue_stop_timeout: Duration,

    // Failure handling
    /// Executable invoked (detached) on read-only / log-overflow transitions.
    pub userland_hook_path: Option<PathBuf>,

    // Redo engine
    /// In-flight IO budget for the redo engine, in bytes.
    pub redo_buffer_bytes: usize,
    /// Cap on merged IO size in the redo engine, in bytes.
    pub redo_merge_cap_bytes: usize,
}

impl Default for WalbConfig {
    fn default() -> Self {
        Self {
            ring_buffer_off: 0,
            ring_buffer_size: 64 * 1024,
            physical_block_size: 4096,
            log_checksum_salt: 0,

            max_logpack_pb: 256,
            log_flush_interval_pb: 2048,
            log_flush_interval_jiffies: Duration::from_millis(100),

            chunk_sectors: 0,
            ddev_chunk_sectors: 0,
            n_pack_bulk: 32,
            n_io_bulk: 128,

            max_pending_sectors: 1024 * 1024,
            min_pending_sectors: 512 * 1024,
            queue_stop_timeout: Duration::from_secs(10),

            userland_hook_path: None,

            redo_buffer_bytes: 16 * 1024 * 1024,
            redo_merge_cap_bytes: 1024 * 1024,
        }
    }
}

impl WalbConfig {
    /// Physical block size expressed in 512-byte sectors.
    pub fn sectors_per_block(&self) -> u64 {
        (self.physical_block_size / 512) as u64
    }

    /// `log_flush_interval_jiffies == 0` disables durability batching (test mode).
    pub fn is_flush_interval_disabled(&self) -> bool {
        self.log_flush_interval_jiffies.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_orders_pending_thresholds() {
        let cfg = WalbConfig::default();
        assert!(cfg.min_pending_sectors < cfg.max_pending_sectors);
    }

    #[test]
    fn sectors_per_block_matches_block_size() {
        let cfg = WalbConfig::default();
        assert_eq!(cfg.sectors_per_block(), 8);
    }
}
