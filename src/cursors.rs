//! LSN cursor manager: the six monotonic cursors and `wait_for_log_permanent`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::device::BlockDevice;
use crate::error::Result;

#[derive(Debug, Clone, Copy, Default)]
pub struct Cursors {
    pub oldest: u64,
    pub written: u64,
    pub permanent: u64,
    pub completed: u64,
    pub flush: u64,
    pub latest: u64,
}

impl Cursors {
    fn assert_ordered(&self) {
        debug_assert!(
            self.oldest <= self.written
                && self.written <= self.permanent
                && self.permanent <= self.completed
                && self.completed <= self.flush
                && self.flush <= self.latest,
            "cursor ordering invariant violated: {self:?}"
        );
    }
}

/// Holds the shared cursor state and coordinates flush batching for
/// `wait_for_log_permanent`.
pub struct CursorManager {
    state: Mutex<Cursors>,
    last_forced_flush: Mutex<Instant>,
    changed: Notify,
    log_flush_interval_pb: u64,
    log_flush_interval: Duration,
}

impl CursorManager {
    pub fn new(log_flush_interval_pb: u64, log_flush_interval: Duration) -> Self {
        Self {
            state: Mutex::new(Cursors::default()),
            last_forced_flush: Mutex::new(Instant::now()),
            changed: Notify::new(),
            log_flush_interval_pb,
            log_flush_interval,
        }
    }

    pub fn snapshot(&self) -> Cursors {
        *self.state.lock()
    }

    // The individual setters below bump a single cursor and deliberately do
    // not assert the full chain: a cursor can be ahead of its neighbors for
    // the span of one update until a sibling call catches the rest up.
    // `advance_completed` is the one call site production code uses to move
    // more than one cursor at once, and it asserts the chain atomically.

    pub fn set_latest(&self, lsn: u64) {
        let mut s = self.state.lock();
        s.latest = s.latest.max(lsn);
    }

    pub fn set_completed(&self, lsn: u64) {
        let mut s = self.state.lock();
        s.completed = s.completed.max(lsn);
        drop(s);
        self.changed.notify_waiters();
    }

    pub fn set_written(&self, lsn: u64) {
        let mut s = self.state.lock();
        s.written = s.written.max(lsn);
        drop(s);
        self.changed.notify_waiters();
    }

    pub fn set_oldest(&self, lsn: u64) {
        let mut s = self.state.lock();
        s.oldest = s.oldest.max(lsn);
    }

    pub fn advance_flush(&self, lsn: u64) {
        let mut s = self.state.lock();
        s.flush = s.flush.max(lsn);
    }

    /// Promote `permanent` without re-issuing a flush (used when the
    /// underlying device does not honor `FLUSH`; §4.3 post-pack actions).
    pub fn advance_flush_and_permanent(&self, lsn: u64) {
        let mut s = self.state.lock();
        s.flush = s.flush.max(lsn);
        s.permanent = s.permanent.max(lsn);
        drop(s);
        self.changed.notify_waiters();
    }

    /// Promote `completed`, `permanent`, and `flush` together in a single
    /// critical section (mirrors `module/io.c`'s one `lsid_lock` acquisition
    /// covering all three fields on pack completion — updating them one at a
    /// time would transiently violate the chain invariant).
    pub fn advance_completed(&self, lsn: u64) {
        let mut s = self.state.lock();
        s.completed = s.completed.max(lsn);
        s.permanent = s.permanent.max(lsn);
        s.flush = s.flush.max(lsn);
        s.assert_ordered();
        drop(s);
        self.changed.notify_waiters();
    }

    pub fn ring_usage(&self) -> u64 {
        let s = self.state.lock();
        s.latest - s.oldest
    }

    /// Block until `permanent >= target_lsn`, batching flushes as the spec
    /// describes. A zero flush interval disables the wait entirely (test
    /// mode: durability ordering is not required).
    pub async fn wait_for_log_permanent(
        &self,
        target_lsn: u64,
        log_device: &dyn BlockDevice,
    ) -> Result<()> {
        if self.log_flush_interval.is_zero() {
            return Ok(());
        }

        loop {
            let (permanent, latest, flush) = {
                let s = self.state.lock();
                (s.permanent, s.latest, s.flush)
            };
            if permanent >= target_lsn {
                return Ok(());
            }

            let elapsed_ok = self.last_forced_flush.lock().elapsed() < self.log_flush_interval;
            let within_batch_window = target_lsn.saturating_sub(flush) < self.log_flush_interval_pb;

            if elapsed_ok && within_batch_window {
                debug!(target_lsn, flush, "batching before forced log flush");
                sleep(Duration::from_millis(1)).await;
                continue;
            }

            log_device.flush().map_err(|e| {
                warn!(error = %e, "log device flush failed, entering read-only");
                e
            })?;

            let mut s = self.state.lock();
            s.flush = latest;
            s.permanent = latest;
            drop(s);
            *self.last_forced_flush.lock() = Instant::now();
            self.changed.notify_waiters();
            return Ok(());
        }
    }
}

pub type SharedCursors = Arc<CursorManager>;
