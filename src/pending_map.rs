//! Pending Map: writes acknowledged upstream but not yet landed on the data
//! device. Indexed by sector position with an `IntMap`-style range scan
//! bounded by the largest entry currently pending.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bio_wrapper::BioWrapper;

/// Thread-safe pending-write index.
pub struct PendingMap {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: BTreeMap<u64, Arc<Mutex<BioWrapper>>>,
    pending_sectors: u64,
    max_sectors_in_pending: u64,
}

impl PendingMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                pending_sectors: 0,
                max_sectors_in_pending: 0,
            }),
        }
    }

    pub fn pending_sectors(&self) -> u64 {
        self.inner.lock().pending_sectors
    }

    pub fn max_sectors_in_pending(&self) -> u64 {
        self.inner.lock().max_sectors_in_pending
    }

    pub fn insert(&self, wrapper: Arc<Mutex<BioWrapper>>) {
        let mut inner = self.inner.lock();
        let (pos, len) = {
            let w = wrapper.lock();
            (w.pos, w.len_sectors)
        };
        inner.pending_sectors += len;
        inner.max_sectors_in_pending = inner.max_sectors_in_pending.max(len);
        inner.entries.insert(pos, wrapper);
    }

    pub fn delete(&self, pos: u64) {
        let mut inner = self.inner.lock();
        if let Some(w) = inner.entries.remove(&pos) {
            let len = w.lock().len_sectors;
            inner.pending_sectors = inner.pending_sectors.saturating_sub(len);
        }
    }

    /// Insert `wrapper`, then mark any older entry that `wrapper` fully
    /// overwrites as skippable for its data-device IO.
    pub fn insert_and_delete_fully_overwritten(&self, wrapper: Arc<Mutex<BioWrapper>>) {
        let (pos, len, new_lsid) = {
            let w = wrapper.lock();
            (w.pos, w.len_sectors, w.lsid)
        };

        let candidates = self.scan_range(pos, len);
        for other in candidates {
            if Arc::ptr_eq(&other, &wrapper) {
                continue;
            }
            let mut o = other.lock();
            if o.lsid < new_lsid {
                let w = wrapper.lock();
                if w.fully_covers(o.pos, o.len_sectors) {
                    o.skip_data_io = true;
                }
            }
        }

        self.insert(wrapper);
    }

    /// Entries whose range intersects `[pos, pos+len)`, scanning only back
    /// to `pos - max_sectors_in_pending` as the invariant guarantees no
    /// larger entry lurks further back.
    pub fn scan_range(&self, pos: u64, len: u64) -> Vec<Arc<Mutex<BioWrapper>>> {
        let inner = self.inner.lock();
        let lo = pos.saturating_sub(inner.max_sectors_in_pending);
        let hi = pos + len;
        inner
            .entries
            .range(lo..)
            .take_while(|(k, _)| **k < hi)
            .filter_map(|(_, w)| {
                let g = w.lock();
                if g.pos < hi && pos < g.pos + g.len_sectors {
                    drop(g);
                    Some(Arc::clone(w))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Copy bytes from any overlapping pending entries into `dst`, which
    /// represents the read at `[pos, pos+len)`. Later (higher-LSN) entries
    /// must be applied last so they win over earlier overlapping writes.
    pub fn check_and_copy(&self, pos: u64, len: u64, dst: &mut [u8]) {
        let mut candidates = self.scan_range(pos, len);
        candidates.sort_by_key(|w| w.lock().lsid);

        for entry in candidates {
            let w = entry.lock();
            let overlap_start = w.pos.max(pos);
            let overlap_end = (w.pos + w.len_sectors).min(pos + len);
            if overlap_start >= overlap_end {
                continue;
            }
            let src_off = ((overlap_start - w.pos) * 512) as usize;
            let dst_off = ((overlap_start - pos) * 512) as usize;
            let n = ((overlap_end - overlap_start) * 512) as usize;
            if src_off + n <= w.original.data.len() && dst_off + n <= dst.len() {
                dst[dst_off..dst_off + n].copy_from_slice(&w.original.data[src_off..src_off + n]);
            }
        }
    }
}

impl Default for PendingMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Bio;

    fn wrapper(pos: u64, data: Vec<u8>, lsid: u64) -> Arc<Mutex<BioWrapper>> {
        let mut w = BioWrapper::new(Bio::new_write(pos, data), 0);
        w.lsid = lsid;
        Arc::new(Mutex::new(w))
    }

    #[test]
    fn insert_updates_pending_sectors_and_max() {
        let map = PendingMap::new();
        map.insert(wrapper(0, vec![0u8; 4096], 1));
        assert_eq!(map.pending_sectors(), 8);
        assert_eq!(map.max_sectors_in_pending(), 8);
    }

    #[test]
    fn fully_overwritten_entry_is_marked_skippable() {
        let map = PendingMap::new();
        let first = wrapper(0, vec![1u8; 4096], 1); // sectors [0, 8)
        map.insert(Arc::clone(&first));

        let second = wrapper(0, vec![2u8; 8192], 2); // sectors [0, 16), fully covers first
        map.insert_and_delete_fully_overwritten(second);

        assert!(first.lock().skip_data_io);
    }

    #[test]
    fn read_overlay_prefers_highest_lsn() {
        let map = PendingMap::new();
        map.insert(wrapper(0, vec![0xAAu8; 4096], 1)); // sectors [0, 8)
        map.insert(wrapper(4, vec![0xBBu8; 2048], 2)); // sectors [4, 8)

        let mut dst = vec![0u8; 4096];
        map.check_and_copy(0, 8, &mut dst);

        assert_eq!(dst[0], 0xAA);
        assert_eq!(dst[4 * 512], 0xBB);
    }
}
