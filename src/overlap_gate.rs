//! Binds the generic `OverlapTable` to `BioWrapper` handles: tracks which
//! wrapper is waiting at each position so a release can be turned back into
//! a concrete wrapper to resubmit (spec §4.5).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bio_wrapper::BioWrapper;
use crate::overlap::{OverlapTable, Ranged};

struct Entry {
    pos: u64,
    len: u64,
}

impl Ranged for Entry {
    fn pos(&self) -> u64 {
        self.pos
    }
    fn len(&self) -> u64 {
        self.len
    }
}

pub struct OverlapGate {
    table: Mutex<OverlapTable<Entry>>,
    waiting: Mutex<HashMap<u64, VecDeque<Arc<Mutex<BioWrapper>>>>>,
}

impl OverlapGate {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(OverlapTable::new()),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    /// Register `handle` for data-device dispatch. Returns `true` if it may
    /// submit immediately (no live earlier entry overlaps its range).
    pub fn register(&self, handle: Arc<Mutex<BioWrapper>>) -> bool {
        let (pos, len) = {
            let w = handle.lock();
            (w.pos, w.len_sectors)
        };

        let inserted = self.table.lock().insert(Entry { pos, len });
        handle.lock().overlap_count = inserted.overlap_count;
        self.waiting.lock().entry(pos).or_default().push_back(handle);

        inserted.overlap_count == 0
    }

    /// The wrapper at `pos`/`len` has completed its data-device IO. Remove it
    /// from the table and return the wrappers (if any) whose overlap count
    /// just reached zero, in release order, ready for resubmission.
    pub fn complete(&self, pos: u64, len: u64) -> Vec<Arc<Mutex<BioWrapper>>> {
        if let Some(queue) = self.waiting.lock().get_mut(&pos) {
            queue.pop_front();
        }

        let released_positions = self.table.lock().remove(pos, len);
        let waiting = self.waiting.lock();
        let released: Vec<_> = released_positions
            .into_iter()
            .filter_map(|p| waiting.get(&p).and_then(|q| q.front()).cloned())
            .collect();
        drop(waiting);
        for w in &released {
            w.lock().signal_overlap_ready();
        }
        released
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

impl Default for OverlapGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio_wrapper::BioWrapper;
    use crate::device::Bio;

    fn wrapper(pos: u64, len_sectors: u64) -> Arc<Mutex<BioWrapper>> {
        Arc::new(Mutex::new(BioWrapper::new(
            Bio::new_write(pos, vec![0u8; (len_sectors * 512) as usize]),
            0,
        )))
    }

    #[test]
    fn three_way_overlap_releases_in_arrival_order() {
        let gate = OverlapGate::new();
        let w1 = wrapper(0, 8);
        let w2 = wrapper(4, 8);
        let w3 = wrapper(0, 16);

        assert!(gate.register(Arc::clone(&w1)));
        assert!(!gate.register(Arc::clone(&w2)));
        assert!(!gate.register(Arc::clone(&w3)));

        let released = gate.complete(0, 8);
        assert_eq!(released.len(), 1);
        assert!(Arc::ptr_eq(&released[0], &w2));

        let released = gate.complete(4, 8);
        assert_eq!(released.len(), 1);
        assert!(Arc::ptr_eq(&released[0], &w3));
    }

    #[test]
    fn non_overlapping_writes_both_submit_immediately() {
        let gate = OverlapGate::new();
        assert!(gate.register(wrapper(0, 8)));
        assert!(gate.register(wrapper(100, 8)));
    }
}
