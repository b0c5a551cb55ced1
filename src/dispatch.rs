//! Log Waiter & Data Dispatcher (spec §4.3): once a Pack's log IO has
//! completed, prepare each wrapper for the data device and acknowledge the
//! write upward.
//!
//! Grounded on `module/io.c::writepack_add_bio_wrapper` and the completion
//! half of `submit_logpack` (the wait-then-dispatch side of the same pass).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::bio_wrapper::{BioState, BioWrapper};
use crate::config::WalbConfig;
use crate::cursors::SharedCursors;
use crate::error::Result;
use crate::overlap::Ranged;
use crate::pack::Pack;
use crate::pending_map::PendingMap;

/// Pending-map backpressure (spec §4.3 / §5): latches a stop once
/// `pending_sectors` exceeds `max_pending_sectors`, counting it into the
/// engine's shared `n_stoppers` alongside freeze. The stop clears once
/// `pending_sectors` falls back under `min_pending_sectors`, or
/// `queue_stop_timeout` has elapsed since it latched, whichever comes first.
pub struct Stopper {
    stopped_at: Mutex<Option<Instant>>,
    n_stoppers: Arc<AtomicU64>,
    changed: Notify,
}

impl Stopper {
    pub fn new(n_stoppers: Arc<AtomicU64>) -> Self {
        Self {
            stopped_at: Mutex::new(None),
            n_stoppers,
            changed: Notify::new(),
        }
    }

    /// Re-evaluate the stop condition against the current pending-map size.
    /// Called after both insertion (may latch a stop) and deletion (may
    /// clear one).
    pub fn update(&self, pending_sectors: u64, cfg: &WalbConfig) {
        let mut stopped_at = self.stopped_at.lock();
        match *stopped_at {
            None if pending_sectors > cfg.max_pending_sectors => {
                *stopped_at = Some(Instant::now());
                self.n_stoppers.fetch_add(1, Ordering::AcqRel);
                warn!(
                    pending_sectors,
                    max = cfg.max_pending_sectors,
                    "pending map over budget, stopping submission"
                );
            }
            Some(since)
                if pending_sectors <= cfg.min_pending_sectors || since.elapsed() >= cfg.queue_stop_timeout =>
            {
                *stopped_at = None;
                self.n_stoppers.fetch_sub(1, Ordering::AcqRel);
                drop(stopped_at);
                self.changed.notify_waiters();
            }
            _ => {}
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped_at.lock().is_some()
    }

    /// Suspend the caller until the pending-map stop condition clears.
    pub async fn wait_until_clear(&self) {
        loop {
            if !self.is_stopped() {
                return;
            }
            self.changed.notified().await;
        }
    }
}

pub type SharedStopper = Arc<Stopper>;

/// Adapts a `BioWrapper` handle to the `Ranged` trait the overlap table needs,
/// without requiring the lock to be held by the table itself.
pub struct WrapperRange {
    pub handle: Arc<Mutex<BioWrapper>>,
    pub pos: u64,
    pub len: u64,
}

impl Ranged for WrapperRange {
    fn pos(&self) -> u64 {
        self.pos
    }
    fn len(&self) -> u64 {
        self.len
    }
}

/// A wrapper that is ready for the data-submit queue.
pub struct PreparedWrite {
    pub wrapper: Arc<Mutex<BioWrapper>>,
}

pub struct Dispatcher<'a> {
    cfg: &'a WalbConfig,
    pending: &'a PendingMap,
    cursors: &'a SharedCursors,
    stopper: &'a Stopper,
}

impl<'a> Dispatcher<'a> {
    pub fn new(cfg: &'a WalbConfig, pending: &'a PendingMap, cursors: &'a SharedCursors, stopper: &'a Stopper) -> Self {
        Self {
            cfg,
            pending,
            cursors,
            stopper,
        }
    }

    /// The pack's log IO has completed successfully (submission in this
    /// engine is synchronous, so "await completion" collapses to this call
    /// running right after `LogSubmitter::submit` returns `Ok`). Returns the
    /// wrappers now ready for the data-submit queue (flush markers are
    /// acked and excluded).
    pub fn dispatch(&self, pack: &Pack) -> Vec<PreparedWrite> {
        let mut ready = Vec::with_capacity(pack.bios.len());

        for wrapper in &pack.bios {
            let is_flush_marker = {
                let w = wrapper.lock();
                w.is_flush_marker()
            };

            if is_flush_marker {
                let mut w = wrapper.lock();
                w.ack_log();
                w.complete();
                continue;
            }

            self.pending.insert_and_delete_fully_overwritten(Arc::clone(wrapper));
            self.stopper.update(self.pending.pending_sectors(), self.cfg);

            {
                let mut w = wrapper.lock();
                w.transition(BioState::Prepared);
                w.ack_log();
            }

            ready.push(PreparedWrite {
                wrapper: Arc::clone(wrapper),
            });
        }

        self.post_pack_actions(pack);
        ready
    }

    fn post_pack_actions(&self, pack: &Pack) {
        // A pack's lsids are already the highest assigned by construction;
        // bumping latest here is a no-op when the caller already tracks it
        // (monotonic max), and self-sufficient when it doesn't.
        self.cursors.set_latest(pack.next_lsid());
        // Mirrors module/io.c's non-REQ_FLUSH fallback: without a device that
        // honors per-bio FUA, flush/permanent promote alongside completed for
        // every pack, not just flush-contained ones.
        self.cursors.advance_completed(pack.next_lsid());
    }

    /// On a failing Pack: fail every remaining wrapper and leave the device
    /// for the caller to mark read-only.
    pub fn fail_pack(&self, pack: &Pack, reason: &str) -> Result<()> {
        for wrapper in &pack.bios {
            wrapper.lock().fail(reason.to_string());
        }
        Ok(())
    }
}
