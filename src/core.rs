//! Top-level engine: wires the five worker roles (log submit, log wait /
//! dispatch, data submit, data wait, GC) and exposes the control surface
//! (spec §6: freeze, melt, set-read-only, clear-log-overflow, flush-all).
//!
//! Grounded on `module/io.c`'s `iocore_make_request` / `iocore_freeze` /
//! `iocore_melt` and the atomic state-bit discipline described in spec §5.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{error, info, warn};

use crate::bio_wrapper::BioWrapper;
use crate::builder::LogpackBuilder;
use crate::checksum;
use crate::config::WalbConfig;
use crate::cursors::{CursorManager, Cursors, SharedCursors};
use crate::data_path::DataPath;
use crate::device::{Bio, BlockDevice};
use crate::dispatch::{Dispatcher, Stopper};
use crate::error::{Result, WalbError};
use crate::gc::GcWorker;
use crate::log_submit::LogSubmitter;
use crate::pack::Pack;
use crate::pending_map::PendingMap;

/// The WalB core engine: logpack pipeline plus control surface.
pub struct WalbCore {
    cfg: WalbConfig,
    builder: Mutex<LogpackBuilder>,
    log_device: Arc<dyn BlockDevice>,
    data_device: Arc<dyn BlockDevice>,
    pending: Arc<PendingMap>,
    cursors: SharedCursors,
    data_path: Arc<DataPath>,
    data_tx: tokio::sync::mpsc::UnboundedSender<Arc<Mutex<BioWrapper>>>,
    gc: Arc<GcWorker>,
    frozen: AtomicBool,
    read_only: AtomicBool,
    log_overflow: AtomicBool,
    n_stoppers: Arc<AtomicU64>,
    stopper: Stopper,
}

impl WalbCore {
    pub fn new(cfg: WalbConfig, log_device: Arc<dyn BlockDevice>, data_device: Arc<dyn BlockDevice>, start_lsid: u64) -> Arc<Self> {
        let cursors: SharedCursors = Arc::new(CursorManager::new(
            cfg.log_flush_interval_pb,
            cfg.log_flush_interval_jiffies,
        ));
        cursors.set_latest(start_lsid);
        cursors.set_oldest(start_lsid);

        let pending = Arc::new(PendingMap::new());
        let gc = GcWorker::new(Arc::clone(&cursors));

        let (gc_tx, gc_rx) = unbounded_channel();
        let data_path = Arc::new(DataPath::new(
            cfg.clone(),
            Arc::clone(&log_device),
            Arc::clone(&data_device),
            Arc::clone(&pending),
            Arc::clone(&cursors),
            gc_tx,
        ));

        let n_pack_bulk = cfg.n_pack_bulk;
        tokio::spawn(Arc::clone(&gc).run(gc_rx, n_pack_bulk));

        let (data_tx, data_rx) = unbounded_channel();
        tokio::spawn(Arc::clone(&data_path).run_queue(data_rx, cfg.n_io_bulk));

        let n_stoppers = Arc::new(AtomicU64::new(0));
        let stopper = Stopper::new(Arc::clone(&n_stoppers));

        Arc::new(Self {
            builder: Mutex::new(LogpackBuilder::new(cfg.clone(), start_lsid)),
            cfg,
            log_device,
            data_device,
            pending,
            cursors,
            data_path,
            data_tx,
            gc,
            frozen: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            log_overflow: AtomicBool::new(false),
            n_stoppers,
            stopper,
        })
    }

    pub fn cursors(&self) -> Cursors {
        self.cursors.snapshot()
    }

    pub fn pending_sectors(&self) -> u64 {
        self.pending.pending_sectors()
    }

    // ---- control surface (spec §6) ----

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
        self.n_stoppers.fetch_add(1, Ordering::AcqRel);
        info!("engine frozen");
    }

    pub fn melt(&self) {
        self.frozen.store(false, Ordering::Release);
        self.n_stoppers.fetch_sub(1, Ordering::AcqRel);
        info!("engine melted");
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn set_read_only(&self) {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            warn!("engine entering read-only mode");
            self.invoke_hook("readonly");
        }
    }

    pub fn is_log_overflow(&self) -> bool {
        self.log_overflow.load(Ordering::Acquire)
    }

    fn set_log_overflow(&self) {
        if !self.log_overflow.swap(true, Ordering::AcqRel) {
            warn!("log-overflow latched, engine is read-only until cleared");
            self.invoke_hook("log_overflow");
        }
    }

    pub fn clear_log_overflow(&self) {
        self.log_overflow.store(false, Ordering::Release);
        info!("log-overflow cleared");
    }

    pub fn flush_all(&self) -> Result<()> {
        self.log_device.flush()?;
        self.data_device.flush()?;
        Ok(())
    }

    fn invoke_hook(&self, event: &str) {
        let Some(path) = &self.cfg.userland_hook_path else {
            return;
        };
        if let Err(e) = std::process::Command::new(path).arg(event).spawn() {
            warn!(error = %e, event, "userland hook failed to spawn");
        }
    }

    // ---- write path ----

    /// Submit one bio. Resolves once the write is durable in the log (the
    /// point at which the spec says the bio "ends upward"); data-device
    /// application and GC continue in the background.
    pub async fn submit_write(&self, bio: Bio) -> Result<()> {
        self.submit_batch(vec![bio]).await
    }

    /// Submit several bios as one logpack-builder batch, sealing any
    /// remaining open Pack at the end. All bios are acked together once
    /// their logpacks are durable.
    pub async fn submit_batch(&self, bios: Vec<Bio>) -> Result<()> {
        if self.is_frozen() {
            return Err(WalbError::Frozen);
        }
        if self.is_read_only() || self.is_log_overflow() {
            return Err(WalbError::ReadOnly("engine is read-only".to_string()));
        }
        self.stopper.wait_until_clear().await;

        let mut wrappers = Vec::with_capacity(bios.len());
        let mut sealed = Vec::new();
        {
            let mut builder = self.builder.lock();
            for bio in bios {
                let sum = if matches!(bio.direction, crate::device::BioDirection::Write) {
                    checksum::checksum(&bio.data, 0)
                } else {
                    0
                };
                let wrapper = Arc::new(Mutex::new(BioWrapper::new(bio, sum)));
                wrappers.push(Arc::clone(&wrapper));
                match builder.add(wrapper) {
                    Ok(packs) => sealed.extend(packs),
                    Err(WalbError::LogOverflow(n)) => {
                        self.set_log_overflow();
                        return Err(WalbError::LogOverflow(n));
                    }
                    Err(e) => return Err(e),
                }
            }
            if let Some(pack) = builder.flush_open() {
                sealed.push(pack);
            }
        }

        for pack in sealed {
            self.process_pack(pack)?;
        }

        for wrapper in &wrappers {
            let (handle, acked) = {
                let w = wrapper.lock();
                (w.log_ack_handle(), w.is_log_acked())
            };
            if !acked {
                handle.notified().await;
            }
        }
        Ok(())
    }

    fn process_pack(&self, pack: Pack) -> Result<()> {
        let submitter = LogSubmitter::new(&self.cfg);
        if let Err(e) = submitter.submit(&pack, self.log_device.as_ref()) {
            error!(error = %e, "log device IO failed, entering read-only");
            self.set_read_only();
            let dispatcher = Dispatcher::new(&self.cfg, &self.pending, &self.cursors, &self.stopper);
            dispatcher.fail_pack(&pack, &e.to_string())?;
            return Err(e);
        }

        let dispatcher = Dispatcher::new(&self.cfg, &self.pending, &self.cursors, &self.stopper);
        let next_lsid = pack.next_lsid();
        self.cursors.set_latest(next_lsid);
        let all_wrappers = pack.bios.clone();
        let ready = dispatcher.dispatch(&pack);

        self.gc.register_pack(next_lsid, all_wrappers.clone());
        for w in &all_wrappers {
            let done = matches!(w.lock().state, crate::bio_wrapper::BioState::Completed);
            if done {
                // flush markers complete synchronously in the dispatcher and
                // never touch the data-submit queue; hand them to GC directly.
                let tx = self.data_path_gc_sender();
                let _ = tx.send(Arc::clone(w));
            }
        }

        for prepared in ready {
            let _ = self.data_tx.send(prepared.wrapper);
        }
        Ok(())
    }

    fn data_path_gc_sender(&self) -> tokio::sync::mpsc::UnboundedSender<Arc<Mutex<BioWrapper>>> {
        self.data_path.gc_sender()
    }
}
