//! Per-sensor capture state machine.
//!
//! A [`CaptureDevice`] ties one CSI receiver instance to its D-PHY lane, the
//! double-buffering slot flags and the consumer bound at `open`:
//!
//! ```text
//!  probe ──► Closed ──open──► Configuring ──► Armed ──start──► Streaming
//!              ▲                  │             │                 │
//!              │   (rollback) ◄───┘             │               stop
//!              │                                │                 ▼
//!              └──────────── close ◄────────────┴──────────── Draining
//! ```
//!
//! Work is split across three contexts:
//!
//! - **interrupt** ([`IrqHandle::handle`]): reads and acknowledges the CSI
//!   status, bumps counters, claims a slot and queues a snapshot. Atomics only.
//! - **deferred** (one worker thread per open device): notifies and drains the
//!   frame manager, or forwards to the routing group, then publishes the
//!   frame count.
//! - **caller** (`open`/`start`/`stop`/`close`): serialized by a control lock;
//!   `stop` blocks with a deadline until the slots and the queue are empty.

mod irq;
mod work;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{CaptureSettings, SensorConfig};
use crate::csi::CsiController;
use crate::deferred::{DeferredQueue, Work};
use crate::error::{CaptureError, Result};
use crate::frame_manager::{Binding, PayloadDescriptor};
use crate::phy::PhyArbiter;
use crate::publisher::{FrameCountPublisher, PublishSlot};
use crate::regs::RegisterMap;
use crate::state::{AtomicFlags, AtomicState, CaptureState, Slot, StateFlags};

pub use irq::IrqHandle;

/// Interval at which a waiting `stop` re-queues a drain of undrained slots.
const DRAIN_RETRY: Duration = Duration::from_millis(1);

bitflags! {
    /// Optional runtime checks and tracing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SoftwareChecks: u32 {
        /// Re-validate the state flags after every deferred work item.
        const VERIFY_FLAGS = 1 << 0;
        /// Emit a trace event for every interrupt.
        const FRAME_TRACE = 1 << 1;
    }
}

/// Shared hardware every probed device uses.
#[derive(Clone)]
pub struct Platform {
    /// Hands out per-instance CSI register windows.
    pub map: Arc<dyn RegisterMap>,
    /// Arbiter of the shared D-PHY control register.
    pub phy: Arc<PhyArbiter>,
    /// Where completed frame counts are published.
    pub publisher: Arc<FrameCountPublisher>,
    /// Engine tuning.
    pub settings: CaptureSettings,
}

impl Platform {
    /// Platform with default settings.
    pub fn new(
        map: Arc<dyn RegisterMap>,
        phy: Arc<PhyArbiter>,
        publisher: Arc<FrameCountPublisher>,
    ) -> Self {
        Self {
            map,
            phy,
            publisher,
            settings: CaptureSettings::default(),
        }
    }

    /// Replace the engine tuning.
    pub fn with_settings(mut self, settings: CaptureSettings) -> Self {
        self.settings = settings;
        self
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("phy", &self.phy)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Point-in-time counters of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    /// Capture instance.
    pub instance: u32,
    /// Lifecycle state.
    pub state: CaptureState,
    /// Per-frame flags.
    pub flags: StateFlags,
    /// Frame starts seen this session.
    pub frame_count: u64,
    /// Frame ends seen this session.
    pub buffer_count: u64,
    /// Last published frame count.
    pub published: u64,
    /// Frame starts dropped because both slots were occupied.
    pub overruns: u64,
    /// Frame starts counted after the drain began; never buffered.
    pub late_frames: u64,
    /// Hardware error interrupts (overflow, ECC, CRC).
    pub hw_errors: u64,
    /// Work items rejected by a full queue.
    pub dropped_work: u64,
    /// Work items queued or running.
    pub pending_work: usize,
}

impl fmt::Display for CaptureStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "csi{} {:<11} frames={} buffers={} published={} overruns={} late={} hw_errors={} dropped={} pending={} flags={:?}",
            self.instance,
            self.state,
            self.frame_count,
            self.buffer_count,
            self.published,
            self.overruns,
            self.late_frames,
            self.hw_errors,
            self.dropped_work,
            self.pending_work,
            self.flags,
        )
    }
}

/// State reachable from the interrupt path and the deferred worker.
pub(crate) struct Shared {
    instance: u32,
    sensor: SensorConfig,
    state: AtomicState,
    flags: AtomicFlags,
    frame_count: AtomicU64,
    buffer_count: AtomicU64,
    overruns: AtomicU64,
    late_frames: AtomicU64,
    hw_errors: AtomicU64,
    /// Slot the next frame start tries first (0 = A, 1 = B).
    next_slot: AtomicU8,
    checks: AtomicU32,
    software_trigger: AtomicBool,
    /// Written only at open/close; the interrupt path uses `try_read`.
    csi: RwLock<Option<Arc<CsiController>>>,
    binding: RwLock<Option<Binding>>,
    /// Slots notified to the frame manager and not yet drained. Worker only.
    awaiting_drain: Mutex<StateFlags>,
    queue: Arc<DeferredQueue>,
    publish: PublishSlot,
    waiters: Mutex<()>,
    drained: Condvar,
}

impl Shared {
    fn payload(&self) -> PayloadDescriptor {
        PayloadDescriptor {
            channel: self.sensor.channel,
            format: self.sensor.pixel_format,
            width: self.sensor.width,
            height: self.sensor.height,
        }
    }

    fn checks(&self) -> SoftwareChecks {
        SoftwareChecks::from_bits_truncate(self.checks.load(Ordering::Relaxed))
    }

    fn preferred_slot(&self) -> Slot {
        if self.next_slot.load(Ordering::Relaxed) == 0 {
            Slot::A
        } else {
            Slot::B
        }
    }

    fn set_preferred_slot(&self, slot: Slot) {
        self.next_slot.store(slot.index() as u8, Ordering::Relaxed);
    }

    fn quiescent(&self) -> bool {
        self.flags.load().valid_slots().is_empty() && self.queue.pending() == 0
    }

    fn reset_counters(&self, otf: bool) {
        self.frame_count.store(0, Ordering::Release);
        self.buffer_count.store(0, Ordering::Release);
        self.overruns.store(0, Ordering::Relaxed);
        self.late_frames.store(0, Ordering::Relaxed);
        self.hw_errors.store(0, Ordering::Relaxed);
        self.set_preferred_slot(Slot::A);
        *self.awaiting_drain.lock() = StateFlags::empty();
        self.flags.store(if otf {
            StateFlags::OTF_TO_NEXT_STAGE
        } else {
            StateFlags::empty()
        });
        self.publish.reset();
    }

    /// Block until no slot is valid and no work is pending, or `timeout` passes.
    fn wait_quiescent(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut guard = self.waiters.lock();
        loop {
            if self.quiescent() {
                debug!(instance = self.instance, waited = ?started.elapsed(), "Capture quiesced");
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    instance = self.instance,
                    ?timeout,
                    flags = ?self.flags.load(),
                    pending = self.queue.pending(),
                    "Timed out waiting for capture to drain"
                );
                return Err(CaptureError::Timeout {
                    what: "capture quiescence",
                    waited: started.elapsed(),
                });
            }
            if !self.flags.load().valid_slots().is_empty() && self.queue.pending() == 0 {
                self.queue.schedule(Work::Drain);
            }
            self.drained
                .wait_for(&mut guard, (deadline - now).min(DRAIN_RETRY));
        }
    }
}

/// One capture instance.
///
/// Created by [`CaptureDevice::probe`] without touching hardware. All
/// lifecycle methods take `&self` and may be called from any thread; they are
/// serialized internally.
pub struct CaptureDevice {
    shared: Arc<Shared>,
    platform: Platform,
    control: Mutex<()>,
}

impl CaptureDevice {
    /// Create the device for `instance`. No hardware is accessed.
    ///
    /// The `instance` argument takes precedence over `sensor.instance`.
    pub fn probe(mut sensor: SensorConfig, instance: u32, platform: &Platform) -> Result<Self> {
        sensor.instance = instance;
        let publish = platform.publisher.writer(instance).ok_or_else(|| {
            CaptureError::invalid_argument(format!("no published counter slot for instance {instance}"))
        })?;

        debug!(instance, sensor = %sensor.name, "Probed capture device");
        Ok(Self {
            shared: Arc::new(Shared {
                instance,
                sensor,
                state: AtomicState::default(),
                flags: AtomicFlags::default(),
                frame_count: AtomicU64::new(0),
                buffer_count: AtomicU64::new(0),
                overruns: AtomicU64::new(0),
                late_frames: AtomicU64::new(0),
                hw_errors: AtomicU64::new(0),
                next_slot: AtomicU8::new(0),
                checks: AtomicU32::new(0),
                software_trigger: AtomicBool::new(false),
                csi: RwLock::new(None),
                binding: RwLock::new(None),
                awaiting_drain: Mutex::new(StateFlags::empty()),
                queue: DeferredQueue::new(platform.settings.work_queue_depth),
                publish,
                waiters: Mutex::new(()),
                drained: Condvar::new(),
            }),
            platform: platform.clone(),
            control: Mutex::new(()),
        })
    }

    /// Capture instance number.
    pub fn instance(&self) -> u32 {
        self.shared.instance
    }

    /// Sensor description.
    pub fn sensor(&self) -> &SensorConfig {
        &self.shared.sensor
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CaptureState {
        self.shared.state.load()
    }

    /// Current per-frame flags.
    pub fn flags(&self) -> StateFlags {
        self.shared.flags.load()
    }

    /// Frame starts seen this session.
    pub fn frame_count(&self) -> u64 {
        self.shared.frame_count.load(Ordering::Acquire)
    }

    /// Frame count published by the deferred end handler.
    pub fn published_frame_count(&self) -> u64 {
        self.shared.publish.load()
    }

    /// Downstream group, when bound on the fly.
    pub fn routing_group(&self) -> Option<u32> {
        self.shared
            .binding
            .read()
            .as_ref()
            .and_then(Binding::routing_group)
    }

    /// Handle the platform's interrupt dispatcher calls into.
    pub fn irq_handle(&self) -> IrqHandle {
        IrqHandle::new(Arc::clone(&self.shared))
    }

    /// Service a pending interrupt of this instance.
    pub fn handle_interrupt(&self) {
        self.shared.on_interrupt();
    }

    /// Enable or disable diagnostic checks.
    pub fn set_software_checks(&self, checks: SoftwareChecks) {
        self.shared.checks.store(checks.bits(), Ordering::Relaxed);
    }

    /// Allow or forbid [`CaptureDevice::software_trigger`].
    pub fn set_software_trigger(&self, enabled: bool) {
        self.shared.software_trigger.store(enabled, Ordering::Release);
    }

    /// Inject one frame-start/frame-end pair through the interrupt path.
    ///
    /// Requires the software trigger to be enabled and the device to be streaming.
    pub fn software_trigger(&self) -> Result<u64> {
        if !self.shared.software_trigger.load(Ordering::Acquire) {
            return Err(CaptureError::invalid_argument("software trigger is disabled"));
        }
        let state = self.state();
        if state != CaptureState::Streaming {
            return Err(CaptureError::InvalidState {
                op: "software_trigger",
                state,
            });
        }
        let frame = self.shared.frame_start();
        self.shared.frame_end();
        Ok(frame)
    }

    /// Snapshot of the device counters.
    pub fn stats(&self) -> CaptureStats {
        let shared = &self.shared;
        CaptureStats {
            instance: shared.instance,
            state: shared.state.load(),
            flags: shared.flags.load(),
            frame_count: shared.frame_count.load(Ordering::Acquire),
            buffer_count: shared.buffer_count.load(Ordering::Acquire),
            published: shared.publish.load(),
            overruns: shared.overruns.load(Ordering::Relaxed),
            late_frames: shared.late_frames.load(Ordering::Relaxed),
            hw_errors: shared.hw_errors.load(Ordering::Relaxed),
            dropped_work: shared.queue.dropped(),
            pending_work: shared.queue.pending(),
        }
    }

    /// Run `f` against the CSI controller of an open device.
    ///
    /// Calls are serialized with the lifecycle operations.
    pub fn with_csi<R>(&self, f: impl FnOnce(&CsiController) -> Result<R>) -> Result<R> {
        let _control = self.control.lock();
        let csi = self.csi("with_csi")?;
        f(&csi)
    }

    /// Bind the consumer, program the hardware and arm interrupts.
    ///
    /// `Closed → Configuring → Armed`. Any failure releases what was acquired
    /// and leaves the device `Closed`.
    pub fn open(&self, binding: Binding) -> Result<()> {
        let _control = self.control.lock();
        let shared = &self.shared;

        shared
            .state
            .transition(CaptureState::Closed, CaptureState::Configuring)
            .map_err(|state| CaptureError::InvalidState { op: "open", state })?;

        let mut phy_enabled = false;
        match self.configure(binding, &mut phy_enabled) {
            Ok(()) => {
                shared
                    .state
                    .transition(CaptureState::Configuring, CaptureState::Armed)
                    .map_err(|state| CaptureError::InvalidState { op: "open", state })?;
                info!(
                    instance = shared.instance,
                    sensor = %shared.sensor.name,
                    routing_group = ?self.routing_group(),
                    "Capture device armed"
                );
                Ok(())
            }
            Err(e) => {
                warn!(instance = shared.instance, error = %e, "Open failed, rolling back");
                self.release(phy_enabled);
                if let Err(state) = shared
                    .state
                    .transition(CaptureState::Configuring, CaptureState::Closed)
                {
                    warn!(instance = shared.instance, %state, "Unexpected state during rollback");
                }
                Err(e)
            }
        }
    }

    fn configure(&self, binding: Binding, phy_enabled: &mut bool) -> Result<()> {
        let shared = &self.shared;
        let sensor = &shared.sensor;
        sensor.validate(self.platform.phy.lanes())?;

        shared.reset_counters(binding.is_on_the_fly());

        let regs = self.platform.map.map_csi(shared.instance)?;
        let csi = CsiController::new(regs);
        csi.reset()?;
        csi.set_data_lanes(sensor.data_lanes)?;
        csi.set_settle_time(sensor.settle)?;
        csi.configure(sensor.channel, sensor.pixel_format, sensor.width, sensor.height)?;

        self.platform
            .phy
            .configure(sensor.phy_lane(), true, sensor.phy_reset)?;
        *phy_enabled = true;

        *shared.binding.write() = Some(binding);
        shared
            .queue
            .start(format!("csi{}-work", shared.instance), Arc::clone(shared))
            .map_err(|e| CaptureError::unavailable(format!("failed to spawn deferred worker: {e}")))?;

        csi.set_interrupt_enabled(true)?;
        *shared.csi.write() = Some(Arc::new(csi));
        Ok(())
    }

    /// Enable the stream. `Armed → Streaming`.
    pub fn start(&self) -> Result<()> {
        let _control = self.control.lock();
        let state = self.state();
        if state != CaptureState::Armed {
            return Err(CaptureError::InvalidState { op: "start", state });
        }
        let csi = self.csi("start")?;
        self.shared
            .state
            .transition(CaptureState::Armed, CaptureState::Streaming)
            .map_err(|state| CaptureError::InvalidState { op: "start", state })?;
        csi.enable()?;
        info!(instance = self.shared.instance, "Capture streaming");
        Ok(())
    }

    /// Request the last capture and wait for the pipeline to drain.
    ///
    /// `Streaming → Draining`. Returns once no slot is valid and no deferred
    /// work is pending, after disabling the stream. On [`CaptureError::Timeout`]
    /// the device stays `Draining` with the stream still enabled, and `stop`
    /// may be called again.
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        let _control = self.control.lock();
        match self.state() {
            CaptureState::Streaming => self.begin_draining("stop")?,
            CaptureState::Draining => {}
            state => return Err(CaptureError::InvalidState { op: "stop", state }),
        }
        self.finish_draining(timeout)
    }

    fn begin_draining(&self, op: &'static str) -> Result<()> {
        let shared = &self.shared;
        shared
            .state
            .transition(CaptureState::Streaming, CaptureState::Draining)
            .map_err(|state| CaptureError::InvalidState { op, state })?;
        shared.flags.insert(StateFlags::LAST_CAPTURE);
        info!(instance = shared.instance, "Capture draining");
        Ok(())
    }

    fn finish_draining(&self, timeout: Duration) -> Result<()> {
        let csi = self.csi("stop")?;
        if !csi.is_enabled() {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        self.shared.wait_quiescent(timeout)?;
        csi.disable()?;

        // Interrupts raised before the disable landed may have queued more work.
        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Err(err) = self.shared.wait_quiescent(remaining.max(DRAIN_RETRY)) {
            csi.enable()?;
            return Err(err);
        }
        info!(
            instance = self.shared.instance,
            frames = self.frame_count(),
            published = self.published_frame_count(),
            "Capture stopped"
        );
        Ok(())
    }

    /// Quiesce and release the device. `→ Closed`.
    ///
    /// A streaming device, or one whose `stop` timed out, is stopped first
    /// with the configured stop timeout; if that wait times out the error is
    /// returned and the device stays `Draining`.
    pub fn close(&self) -> Result<()> {
        let _control = self.control.lock();
        let from = match self.state() {
            CaptureState::Closed => return Ok(()),
            CaptureState::Armed => CaptureState::Armed,
            CaptureState::Streaming => {
                self.begin_draining("close")?;
                self.finish_draining(self.platform.settings.stop_timeout())?;
                CaptureState::Draining
            }
            CaptureState::Draining => {
                self.finish_draining(self.platform.settings.stop_timeout())?;
                CaptureState::Draining
            }
            state @ CaptureState::Configuring => {
                return Err(CaptureError::InvalidState { op: "close", state })
            }
        };

        self.release(true);
        self.shared
            .state
            .transition(from, CaptureState::Closed)
            .map_err(|state| CaptureError::InvalidState { op: "close", state })?;
        info!(instance = self.shared.instance, "Capture device closed");
        Ok(())
    }

    /// Mask interrupts, power down the lane, join the worker and unbind.
    fn release(&self, phy_enabled: bool) {
        let shared = &self.shared;
        if let Some(csi) = shared.csi.write().take() {
            if let Err(e) = csi.set_interrupt_enabled(false).and_then(|()| csi.disable()) {
                warn!(instance = shared.instance, error = %e, "Failed to quiesce CSI");
            }
        }
        if phy_enabled {
            let sensor = &shared.sensor;
            if let Err(e) = self
                .platform
                .phy
                .configure(sensor.phy_lane(), false, sensor.phy_reset)
            {
                warn!(instance = shared.instance, error = %e, "Failed to power down D-PHY lane");
            }
        }
        shared.queue.shutdown();
        *shared.binding.write() = None;
        *shared.awaiting_drain.lock() = StateFlags::empty();
        shared.flags.store(StateFlags::empty());
    }

    fn csi(&self, op: &'static str) -> Result<Arc<CsiController>> {
        self.shared
            .csi
            .read()
            .clone()
            .ok_or_else(|| CaptureError::InvalidState {
                op,
                state: self.state(),
            })
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        if self.state() == CaptureState::Closed {
            return;
        }
        if let Err(e) = self.close() {
            warn!(instance = self.shared.instance, error = %e, "Close on drop failed; forcing release");
            self.release(true);
        }
    }
}

impl fmt::Debug for CaptureDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureDevice")
            .field("instance", &self.shared.instance)
            .field("sensor", &self.shared.sensor.name)
            .field("state", &self.state())
            .field("flags", &self.flags())
            .finish()
    }
}
