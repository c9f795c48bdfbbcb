//! Deferred frame handlers, run on the device's worker thread.

use tracing::{trace, warn};

use super::{Shared, SoftwareChecks};
use crate::deferred::{EndSnapshot, StartSnapshot, Work, WorkHandler};
use crate::frame_manager::Binding;
use crate::state::{CaptureState, Slot, StateFlags};

impl WorkHandler for Shared {
    fn handle(&self, work: Work) {
        match work {
            Work::FrameStart(start) => self.on_frame_start(start),
            Work::FrameEnd(end) => self.on_frame_end(end),
            Work::Drain => self.retry_drain(),
        }

        if self.checks().contains(SoftwareChecks::VERIFY_FLAGS) {
            if let Err(violation) = self.flags.load().validate() {
                warn!(instance = self.instance, ?work, "State flag violation: {violation}");
            }
        }
    }

    fn work_done(&self) {
        if self.state.load() == CaptureState::Draining {
            let _waiters = self.waiters.lock();
            self.drained.notify_all();
        }
    }
}

impl Shared {
    fn on_frame_start(&self, start: StartSnapshot) {
        let binding = self.binding.read();
        match (binding.as_ref(), start.slot) {
            (Some(Binding::OnTheFly { group, target }), _) => {
                trace!(instance = self.instance, frame = start.frame, group, "Forwarding frame");
                target.forward(self.instance, start.frame, self.payload());
            }
            (Some(Binding::Local(manager)), Some(slot)) => {
                trace!(instance = self.instance, frame = start.frame, ?slot, "Frame ready");
                manager.notify_frame_ready(self.instance, slot, start.frame);
                self.awaiting_drain.lock().insert(slot.flag());
                if manager.drain_slot(self.instance, slot) {
                    self.drained_slot(slot);
                }
            }
            (Some(Binding::Local(_)), None) => {
                warn!(instance = self.instance, frame = start.frame, "Local frame start without a slot");
            }
            (None, _) => {
                warn!(instance = self.instance, frame = start.frame, "Frame start with no consumer bound");
                if let Some(slot) = start.slot {
                    self.flags.release_slot(slot);
                }
            }
        }
    }

    fn on_frame_end(&self, end: EndSnapshot) {
        self.retry_drain();
        self.publish.publish(end.frame);
        trace!(
            instance = self.instance,
            frame = end.frame,
            buffer = end.buffer,
            "Frame complete"
        );
    }

    /// Ask the frame manager again for every notified slot still held.
    fn retry_drain(&self) {
        let pending = *self.awaiting_drain.lock();
        if pending.is_empty() {
            return;
        }
        let binding = self.binding.read();
        let Some(Binding::Local(manager)) = binding.as_ref() else {
            return;
        };
        for slot in [Slot::A, Slot::B] {
            if pending.contains(slot.flag()) && manager.drain_slot(self.instance, slot) {
                self.drained_slot(slot);
            }
        }
    }

    fn drained_slot(&self, slot: Slot) {
        self.awaiting_drain.lock().remove(slot.flag());
        if !self.flags.release_slot(slot) {
            warn!(instance = self.instance, ?slot, "Drained a slot that was not marked valid");
        }
        trace!(instance = self.instance, ?slot, flags = ?self.flags.load() & StateFlags::SLOT_MASK, "Slot drained");
    }
}
