//! Interrupt-to-deferred-work handoff.
//!
//! The interrupt path must finish in bounded time and never block, so it only
//! captures a small snapshot and pushes it onto a bounded lock-free queue. A
//! dedicated worker thread per device pops items and runs the handlers that
//! may lock and call into the frame consumer.
//!
//! ```text
//!   hardware irq ──► fast path ──push──► ArrayQueue<Work> ──pop──► worker ──► handler
//!                       │                                             │
//!                       └── unpark (try_lock, never waits) ──────────►┘
//! ```
//!
//! The worker also wakes on a short poll interval, so a wakeup skipped
//! because the thread handle was momentarily locked only delays work.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::state::Slot;

/// Worker wakeup interval when no unpark arrives.
const IDLE_POLL: Duration = Duration::from_millis(2);

/// Default queue capacity.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// Snapshot taken at frame start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartSnapshot {
    /// Frame number after the increment.
    pub frame: u64,
    /// Slot claimed for the frame; `None` in on-the-fly mode.
    pub slot: Option<Slot>,
}

/// Snapshot taken at frame end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndSnapshot {
    /// Frame number current when the frame ended.
    pub frame: u64,
    /// Buffer count after the increment.
    pub buffer: u64,
}

/// One unit of deferred work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Work {
    /// Frame-start handler.
    FrameStart(StartSnapshot),
    /// Frame-end handler.
    FrameEnd(EndSnapshot),
    /// Retry draining slots the consumer has not released yet.
    Drain,
}

/// Receiver of deferred work, run on the worker thread.
pub(crate) trait WorkHandler: Send + Sync + 'static {
    /// Run one work item.
    fn handle(&self, work: Work);

    /// Called after an item is fully accounted for (pending already decremented).
    fn work_done(&self);
}

/// Bounded queue plus the worker thread that drains it.
pub(crate) struct DeferredQueue {
    queue: ArrayQueue<Work>,
    pending: AtomicUsize,
    dropped: AtomicU64,
    shutdown: AtomicBool,
    thread: Mutex<Option<Thread>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeferredQueue {
    pub(crate) fn new(depth: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: ArrayQueue::new(depth.max(1)),
            pending: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            thread: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Queue `work` from interrupt context.
    ///
    /// Never blocks. Returns `false` if the queue is full or the worker is
    /// shutting down; the item is then counted as dropped.
    pub(crate) fn schedule(&self, work: Work) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.queue.push(work).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if let Some(thread) = self.thread.try_lock() {
            if let Some(thread) = thread.as_ref() {
                thread.unpark();
            }
        }
        true
    }

    /// Items queued or running.
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Items rejected because the queue was full.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Spawn the worker. Discards anything left over from a previous session.
    pub(crate) fn start<H: WorkHandler>(self: &Arc<Self>, name: String, handler: Arc<H>) -> io::Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let mut stale = 0usize;
        while self.queue.pop().is_some() {
            stale += 1;
        }
        if stale > 0 {
            debug!(stale, "Discarded stale deferred work");
        }
        self.pending.store(0, Ordering::Release);
        self.dropped.store(0, Ordering::Relaxed);
        self.shutdown.store(false, Ordering::Release);

        let queue = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || queue.run(handler.as_ref()))?;

        *self.thread.lock() = Some(handle.thread().clone());
        *worker = Some(handle);
        Ok(())
    }

    /// Stop and join the worker. No handler runs after this returns.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.lock().take() {
            thread.unpark();
        }
        if let Some(handle) = self.worker.lock().take() {
            if let Err(e) = handle.join() {
                error!("Deferred worker panicked: {:?}", e);
            }
        }
    }

    fn run<H: WorkHandler + ?Sized>(&self, handler: &H) {
        debug!("Deferred worker started");
        loop {
            while let Some(work) = self.queue.pop() {
                if self.shutdown.load(Ordering::Acquire) {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    continue;
                }
                handler.handle(work);
                self.pending.fetch_sub(1, Ordering::AcqRel);
                handler.work_done();
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            thread::park_timeout(IDLE_POLL);
        }
        debug!("Deferred worker exiting");
    }
}
