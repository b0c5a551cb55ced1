//! Data Submitter/Waiter (spec §4.6), gated by the Overlap Serializer
//! (§4.5): waits for log durability, orders overlapping writes, submits to
//! the data device, then releases the Pending Map entry and any writes that
//! were blocked on this one.
//!
//! Grounded on `module/io.c`'s data-dispatch half of `writepack_add_bio_wrapper`
//! and the multimap-based overlap release in `wlredo.cpp::OverlappedData`.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::error;

use crate::bio_wrapper::{BioState, BioWrapper};
use crate::config::WalbConfig;
use crate::cursors::SharedCursors;
use crate::device::BlockDevice;
use crate::overlap_gate::OverlapGate;
use crate::pending_map::PendingMap;

pub struct DataPath {
    cfg: WalbConfig,
    log_device: Arc<dyn BlockDevice>,
    data_device: Arc<dyn BlockDevice>,
    gate: OverlapGate,
    pending: Arc<PendingMap>,
    cursors: SharedCursors,
    gc_tx: UnboundedSender<Arc<Mutex<BioWrapper>>>,
}

impl DataPath {
    pub fn new(
        cfg: WalbConfig,
        log_device: Arc<dyn BlockDevice>,
        data_device: Arc<dyn BlockDevice>,
        pending: Arc<PendingMap>,
        cursors: SharedCursors,
        gc_tx: UnboundedSender<Arc<Mutex<BioWrapper>>>,
    ) -> Self {
        Self {
            cfg,
            log_device,
            data_device,
            gate: OverlapGate::new(),
            pending,
            cursors,
            gc_tx,
        }
    }

    /// The GC queue's sender half, for completions (e.g. flush markers) that
    /// bypass the data-submit path entirely.
    pub fn gc_sender(&self) -> UnboundedSender<Arc<Mutex<BioWrapper>>> {
        self.gc_tx.clone()
    }

    /// Data Submitter (spec §4.6): drain the data-submit queue in bulks of
    /// `n_io_bulk`, sorted by sector position so adjacent writes land on the
    /// data device together, then drive each wrapper (and any dependents the
    /// overlap gate releases) through to GC eligibility.
    pub async fn run_queue(self: Arc<Self>, mut rx: UnboundedReceiver<Arc<Mutex<BioWrapper>>>, n_io_bulk: usize) {
        let mut bulk = Vec::with_capacity(n_io_bulk);
        loop {
            bulk.clear();
            match rx.recv().await {
                Some(w) => bulk.push(w),
                None => return,
            }
            while bulk.len() < n_io_bulk {
                match rx.try_recv() {
                    Ok(w) => bulk.push(w),
                    Err(_) => break,
                }
            }
            bulk.sort_by_key(|w| w.lock().pos);
            for wrapper in bulk.drain(..) {
                Arc::clone(&self).run(wrapper).await;
            }
        }
    }

    /// Drive one prepared wrapper from the data-submit queue through to GC
    /// eligibility. Recursion through released dependents is iterative, not
    /// stack-bound.
    pub async fn run(self: Arc<Self>, wrapper: Arc<Mutex<BioWrapper>>) {
        let mut queue = vec![wrapper];
        while let Some(w) = queue.pop() {
            match self.submit_one(&w).await {
                Ok(released) => queue.extend(released),
                Err(e) => {
                    error!(error = %e, "data-device IO failed, wrapper entering failed state");
                    w.lock().fail(e.to_string());
                }
            }
        }
    }

    async fn submit_one(&self, wrapper: &Arc<Mutex<BioWrapper>>) -> crate::error::Result<Vec<Arc<Mutex<BioWrapper>>>> {
        let lsid = wrapper.lock().lsid;
        self.cursors.wait_for_log_permanent(lsid, self.log_device.as_ref()).await?;

        let ready = self.gate.register(Arc::clone(wrapper));
        if !ready {
            let handle = {
                let w = wrapper.lock();
                if w.is_overlap_ready() {
                    None
                } else {
                    Some(w.overlap_ready_handle())
                }
            };
            if let Some(h) = handle {
                h.notified().await;
            }
        }

        {
            let mut w = wrapper.lock();
            w.transition(BioState::InDataSubmit);
        }

        let (pos, len_sectors, skip, data) = {
            let w = wrapper.lock();
            (w.pos, w.len_sectors, w.skip_data_io, w.original.deep_clone())
        };

        if !skip {
            let mut bio = data;
            bio.pos = pos;
            for chunk in bio.split(self.cfg.ddev_chunk_sectors) {
                self.data_device.submit(&chunk)?;
            }
        }

        {
            let mut w = wrapper.lock();
            w.transition(BioState::Submitted);
            w.complete();
        }

        self.pending.delete(pos);
        let released = self.gate.complete(pos, len_sectors);

        let _ = self.gc_tx.send(Arc::clone(wrapper));
        Ok(released)
    }
}
