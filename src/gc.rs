//! GC Worker (spec §4.8): waits for every wrapper in a Pack to finish, then
//! advances the `written` cursor and drops the Pack's wrappers.
//!
//! Grounded on `module/io.c`'s logpack GC pass, which destroys a writepack
//! once the last bio it contains has completed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

use crate::bio_wrapper::{BioState, BioWrapper};
use crate::cursors::SharedCursors;

struct PackGcState {
    remaining: usize,
    next_lsid: u64,
    wrappers: Vec<Arc<Mutex<BioWrapper>>>,
    failed: bool,
}

fn wrapper_key(w: &Arc<Mutex<BioWrapper>>) -> usize {
    Arc::as_ptr(w) as usize
}

/// Reclaims Packs whose every wrapper has reached `Completed` (or `Failed`).
pub struct GcWorker {
    cursors: SharedCursors,
    index: Mutex<HashMap<usize, Arc<Mutex<PackGcState>>>>,
}

impl GcWorker {
    pub fn new(cursors: SharedCursors) -> Arc<Self> {
        Arc::new(Self {
            cursors,
            index: Mutex::new(HashMap::new()),
        })
    }

    /// Register a sealed Pack's wrappers for reclamation once all complete.
    pub fn register_pack(&self, next_lsid: u64, wrappers: Vec<Arc<Mutex<BioWrapper>>>) {
        let state = Arc::new(Mutex::new(PackGcState {
            remaining: wrappers.len(),
            next_lsid,
            wrappers: wrappers.clone(),
            failed: false,
        }));
        let mut index = self.index.lock();
        for w in &wrappers {
            index.insert(wrapper_key(w), Arc::clone(&state));
        }
    }

    /// Consume the GC queue until the channel closes, bulk-draining whatever
    /// is immediately available up to `n_pack_bulk` entries per pass.
    pub async fn run(self: Arc<Self>, mut rx: UnboundedReceiver<Arc<Mutex<BioWrapper>>>, n_pack_bulk: usize) {
        let mut bulk = Vec::with_capacity(n_pack_bulk);
        loop {
            bulk.clear();
            match rx.recv().await {
                Some(w) => bulk.push(w),
                None => return,
            }
            while bulk.len() < n_pack_bulk {
                match rx.try_recv() {
                    Ok(w) => bulk.push(w),
                    Err(_) => break,
                }
            }
            for wrapper in bulk.drain(..) {
                self.complete_one(wrapper);
            }
        }
    }

    fn complete_one(&self, wrapper: Arc<Mutex<BioWrapper>>) {
        let failed = matches!(wrapper.lock().state, BioState::Failed);
        let state = {
            let mut index = self.index.lock();
            index.remove(&wrapper_key(&wrapper))
        };
        let Some(state) = state else {
            return;
        };

        let mut s = state.lock();
        s.remaining = s.remaining.saturating_sub(1);
        s.failed |= failed;
        if s.remaining == 0 {
            if !s.failed {
                self.cursors.set_written(s.next_lsid);
            }
            debug!(next_lsid = s.next_lsid, failed = s.failed, "pack reclaimed");
            for w in &s.wrappers {
                if matches!(w.lock().state, BioState::Completed) {
                    w.lock().transition(BioState::Gc);
                }
            }
        }
    }
}
