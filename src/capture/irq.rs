//! Interrupt fast path.
//!
//! Runs in interrupt context: no locks that can block, no allocation, no
//! calls into the frame consumer. Everything here either succeeds or is
//! counted; nothing returns an error.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::trace;

use super::{Shared, SoftwareChecks};
use crate::csi::IrqStatus;
use crate::deferred::{EndSnapshot, StartSnapshot, Work};
use crate::state::StateFlags;

/// Cloneable entry point for a device's interrupt line.
///
/// Holds only the interrupt-visible half of the device, so it can be moved
/// into a dispatcher thread.
#[derive(Clone)]
pub struct IrqHandle {
    shared: Arc<Shared>,
}

impl IrqHandle {
    pub(super) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Capture instance this handle belongs to.
    pub fn instance(&self) -> u32 {
        self.shared.instance
    }

    /// Service the interrupt line. Returns the acknowledged status bits.
    pub fn handle(&self) -> IrqStatus {
        self.shared.on_interrupt()
    }
}

impl std::fmt::Debug for IrqHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrqHandle")
            .field("instance", &self.shared.instance)
            .finish()
    }
}

impl Shared {
    pub(super) fn on_interrupt(&self) -> IrqStatus {
        // Only open/close write the controller handle; a failed try_read
        // means the device is being torn down or armed, not streaming.
        let Some(guard) = self.csi.try_read() else {
            return IrqStatus::empty();
        };
        let Some(csi) = &*guard else {
            return IrqStatus::empty();
        };
        let status = csi.take_interrupt_status();
        drop(guard);

        let state = self.state.load();
        if self.checks().contains(SoftwareChecks::FRAME_TRACE) {
            trace!(instance = self.instance, ?status, %state, "CSI interrupt");
        }
        if !state.accepts_interrupts() {
            return status;
        }

        if status.intersects(IrqStatus::ERRORS) {
            self.hw_errors.fetch_add(1, Ordering::Relaxed);
        }
        if status.contains(IrqStatus::FRAME_START) {
            self.frame_start();
        }
        if status.contains(IrqStatus::FRAME_END) {
            self.frame_end();
        }
        status
    }

    /// Count a frame start, claim a slot and queue the start handler.
    ///
    /// Once `LAST_CAPTURE` is set the frame is still counted, but no slot is
    /// claimed and no start work is queued, so a drain can finish while the
    /// sensor keeps streaming. Returns the new frame number.
    pub(super) fn frame_start(&self) -> u64 {
        let frame = self.frame_count.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let flags = self.flags.load();

        if flags.contains(StateFlags::LAST_CAPTURE) {
            self.late_frames.fetch_add(1, Ordering::Relaxed);
            if self.checks().contains(SoftwareChecks::FRAME_TRACE) {
                trace!(instance = self.instance, frame, "Frame start while draining, not buffered");
            }
            return frame;
        }

        let slot = if flags.contains(StateFlags::OTF_TO_NEXT_STAGE) {
            None
        } else {
            match self.flags.claim_slot(self.preferred_slot()) {
                Some(slot) => {
                    self.set_preferred_slot(slot.other());
                    Some(slot)
                }
                None => {
                    self.overruns.fetch_add(1, Ordering::Relaxed);
                    if self.checks().contains(SoftwareChecks::FRAME_TRACE) {
                        trace!(instance = self.instance, frame, "Both slots occupied, frame dropped");
                    }
                    return frame;
                }
            }
        };

        if !self.queue.schedule(Work::FrameStart(StartSnapshot { frame, slot })) {
            // No handler will ever drain it.
            if let Some(slot) = slot {
                self.flags.release_slot(slot);
            }
        }
        frame
    }

    /// Count a frame end and queue the end handler.
    pub(super) fn frame_end(&self) {
        let buffer = self.buffer_count.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let frame = self.frame_count.load(Ordering::Acquire);
        self.queue.schedule(Work::FrameEnd(EndSnapshot { frame, buffer }));
    }
}
