//! `BioWrapper`: the per-write tracking object that rides the whole pipeline.

use std::sync::Arc;

use tokio::sync::Notify;

use crate::device::{Bio, BioDirection};

pub type Lsn = u64;

/// Lifecycle state of a `BioWrapper`. Transitions are one-directional and
/// asserted by [`BioWrapper::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioState {
    New,
    InLogSubmit,
    InLogWait,
    Prepared,
    InDataSubmit,
    Submitted,
    Completed,
    Gc,
    Failed,
}

impl BioState {
    /// Whether `self -> next` is a legal forward transition.
    fn can_advance_to(self, next: BioState) -> bool {
        use BioState::*;
        if next == Failed {
            return self != Gc && self != Completed;
        }
        matches!(
            (self, next),
            (New, InLogSubmit)
                | (InLogSubmit, InLogWait)
                | (InLogWait, Prepared)
                // flush markers have no data-device phase: they complete
                // directly off the log wait.
                | (InLogWait, Completed)
                | (Prepared, InDataSubmit)
                | (InDataSubmit, Submitted)
                | (Submitted, Completed)
                | (Completed, Gc)
        )
    }
}

/// One in-flight write, owned by whichever pipeline stage currently holds it.
#[derive(Debug)]
pub struct BioWrapper {
    pub pos: u64,
    pub len_sectors: u64,
    pub direction: BioDirection,
    pub checksum: u32,
    pub lsid: Lsn,
    pub state: BioState,
    pub error: Option<String>,
    /// Owned payload; cloned again for the data-device dispatch.
    pub original: Bio,
    /// How many earlier, still-live data-device writes this entry overlaps.
    pub overlap_count: usize,
    /// Set when a later, fully-overlapping wrapper makes this entry's
    /// data-device IO redundant.
    pub skip_data_io: bool,
    notify: Arc<Notify>,
    /// Signalled once the write is durable in the log, independent of the
    /// `Completed` state (which is reserved for data-device + GC completion).
    /// This is what the upper block layer actually waits on.
    log_ack: Arc<Notify>,
    log_acked: bool,
    /// Signalled by the overlap serializer once this wrapper's overlap count
    /// reaches zero and it may submit to the data device.
    overlap_ready: Arc<Notify>,
    overlap_ready_signaled: bool,
}

impl BioWrapper {
    pub fn new(original: Bio, checksum: u32) -> Self {
        let pos = original.pos;
        let len_sectors = original.len_sectors;
        let direction = original.direction;
        Self {
            pos,
            len_sectors,
            direction,
            checksum,
            lsid: 0,
            state: BioState::New,
            error: None,
            original,
            overlap_count: 0,
            skip_data_io: false,
            notify: Arc::new(Notify::new()),
            log_ack: Arc::new(Notify::new()),
            log_acked: false,
            overlap_ready: Arc::new(Notify::new()),
            overlap_ready_signaled: false,
        }
    }

    pub fn overlap_ready_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.overlap_ready)
    }

    pub fn is_overlap_ready(&self) -> bool {
        self.overlap_ready_signaled
    }

    pub fn signal_overlap_ready(&mut self) {
        self.overlap_ready_signaled = true;
        self.overlap_ready.notify_waiters();
    }

    /// Signal the upper layer that the write is durable in the log; this is
    /// the point at which the original bio "ends upward".
    pub fn ack_log(&mut self) {
        self.log_acked = true;
        self.log_ack.notify_waiters();
    }

    pub async fn wait_log_ack(&self) {
        if self.log_acked {
            return;
        }
        self.log_ack.notified().await;
    }

    pub fn log_ack_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.log_ack)
    }

    pub fn is_log_acked(&self) -> bool {
        self.log_acked
    }

    pub fn is_flush_marker(&self) -> bool {
        self.len_sectors == 0 && self.original.is_flush
    }

    pub fn range(&self) -> (u64, u64) {
        (self.pos, self.pos + self.len_sectors)
    }

    pub fn overlaps(&self, other_pos: u64, other_len: u64) -> bool {
        self.pos < other_pos + other_len && other_pos < self.pos + self.len_sectors
    }

    /// Does `self`'s range fully contain `other`'s range?
    pub fn fully_covers(&self, other_pos: u64, other_len: u64) -> bool {
        self.pos <= other_pos && other_pos + other_len <= self.pos + self.len_sectors
    }

    pub fn transition(&mut self, next: BioState) {
        assert!(
            self.state.can_advance_to(next),
            "illegal bio wrapper transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    pub fn fail(&mut self, reason: String) {
        self.error = Some(reason);
        self.state = BioState::Failed;
        self.notify.notify_waiters();
    }

    pub fn complete(&mut self) {
        self.transition(BioState::Completed);
        self.notify.notify_waiters();
    }

    pub fn notify_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    pub async fn wait_done(&self) {
        if matches!(self.state, BioState::Completed | BioState::Failed) {
            return;
        }
        self.notify.notified().await;
    }
}
