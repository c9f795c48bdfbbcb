//! Simulated hardware.
//!
//! Stand-ins for the platform pieces that only exist on a real board: a
//! register map backed by [`SimRegisters`], a sensor that raises frame
//! interrupts while the stream is enabled, and recording consumers. Used by
//! the `csi-capture` binary and the test suites.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::capture::{IrqHandle, Platform};
use crate::config::CaptureSettings;
use crate::csi::{reg, CsiController, IrqStatus};
use crate::error::{CaptureError, Result};
use crate::frame_manager::{FrameManager, PayloadDescriptor, RoutingGroup};
use crate::phy::PhyArbiter;
use crate::publisher::FrameCountPublisher;
use crate::regs::{RegisterMap, SharedRegisters, SimRegisters};
use crate::state::Slot;

/// Register map handing out one in-memory CSI window per instance.
///
/// Windows persist across open/close, like the real register ranges.
#[derive(Debug, Default)]
pub struct SimRegisterMap {
    windows: Mutex<HashMap<u32, Arc<SimRegisters>>>,
    unavailable: Mutex<HashSet<u32>>,
}

impl SimRegisterMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `map_csi(instance)` fail, as a missing resource would.
    pub fn set_unavailable(&self, instance: u32, unavailable: bool) {
        let mut set = self.unavailable.lock();
        if unavailable {
            set.insert(instance);
        } else {
            set.remove(&instance);
        }
    }

    /// Window of `instance`, if it was ever mapped.
    pub fn registers(&self, instance: u32) -> Option<Arc<SimRegisters>> {
        self.windows.lock().get(&instance).cloned()
    }

    /// Latch interrupt status bits of `instance`.
    pub fn raise(&self, instance: u32, status: IrqStatus) {
        if let Some(regs) = self.registers(instance) {
            regs.raise(reg::INT_SRC, status.bits());
        }
    }
}

impl RegisterMap for SimRegisterMap {
    fn map_csi(&self, instance: u32) -> Result<SharedRegisters> {
        if self.unavailable.lock().contains(&instance) {
            return Err(CaptureError::unavailable(format!(
                "CSI{instance} register window not available"
            )));
        }
        let regs = self
            .windows
            .lock()
            .entry(instance)
            .or_insert_with(|| {
                Arc::new(SimRegisters::new(reg::WINDOW_SIZE).with_write_one_to_clear(reg::INT_SRC))
            })
            .clone();
        Ok(regs)
    }
}

/// Simulated platform: register map, PHY register and arbiter.
#[derive(Debug, Clone)]
pub struct SimPlatform {
    /// Platform handed to `CaptureDevice::probe`.
    pub platform: Platform,
    /// Register map behind `platform.map`.
    pub map: Arc<SimRegisterMap>,
    /// Shared PHY control register.
    pub phy_regs: Arc<SimRegisters>,
}

impl SimPlatform {
    /// Build a simulated platform with its own publisher.
    pub fn new(settings: CaptureSettings) -> Self {
        Self::with_publisher(settings, Arc::new(FrameCountPublisher::new()))
    }

    /// Build a simulated platform publishing into `publisher`.
    pub fn with_publisher(settings: CaptureSettings, publisher: Arc<FrameCountPublisher>) -> Self {
        let map = Arc::new(SimRegisterMap::new());
        let phy_regs = Arc::new(SimRegisters::new(4));
        let phy = PhyArbiter::with_lanes(phy_regs.clone(), settings.phy_lanes)
            .with_lock_timeout(settings.phy_lock_timeout());
        let platform = Platform::new(map.clone(), Arc::new(phy), publisher).with_settings(settings);
        Self {
            platform,
            map,
            phy_regs,
        }
    }
}

/// A sensor streaming frames into one CSI instance.
///
/// While the receiver's enable bit is set, each period raises FRAME_START,
/// then FRAME_END half a period later, calling the interrupt handle after
/// each.
pub struct SimSensor {
    stop: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl SimSensor {
    /// Start streaming into `regs` at one frame per `period`.
    pub fn spawn(regs: Arc<SimRegisters>, irq: IrqHandle, period: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicU64::new(0));
        let instance = irq.instance();

        let thread = {
            let stop = stop.clone();
            let frames = frames.clone();
            thread::Builder::new()
                .name(format!("csi{instance}-sensor"))
                .spawn(move || {
                    let csi = CsiController::new(regs.clone());
                    let half = period / 2;
                    while !stop.load(Ordering::Acquire) {
                        if !csi.is_enabled() {
                            thread::sleep(half.max(Duration::from_micros(100)));
                            continue;
                        }
                        regs.raise(reg::INT_SRC, IrqStatus::FRAME_START.bits());
                        irq.handle();
                        thread::sleep(half);
                        regs.raise(reg::INT_SRC, IrqStatus::FRAME_END.bits());
                        irq.handle();
                        frames.fetch_add(1, Ordering::AcqRel);
                        thread::sleep(half);
                    }
                    debug!(instance, frames = frames.load(Ordering::Acquire), "Sensor stopped");
                })
                .map_err(|e| CaptureError::unavailable(format!("failed to spawn sensor thread: {e}")))?
        };

        info!(instance, ?period, "Simulated sensor running");
        Ok(Self {
            stop,
            frames,
            thread: Some(thread),
        })
    }

    /// Frame pairs emitted so far.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// Stop the sensor thread and wait for it.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if let Err(e) = thread.join() {
                error!("Sensor thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for SimSensor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SimSensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimSensor")
            .field("frames", &self.frames())
            .finish()
    }
}

/// Frame manager that records every call.
///
/// Drains succeed unless [`RecordingFrameManager::hold`] is set, which
/// simulates a consumer that keeps its buffers.
#[derive(Debug, Default)]
pub struct RecordingFrameManager {
    ready: Mutex<Vec<(u32, Slot, u64)>>,
    drains: AtomicU64,
    hold: AtomicBool,
}

impl RecordingFrameManager {
    /// New manager that drains immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep (`true`) or release (`false`) slots on drain requests.
    pub fn hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::Release);
    }

    /// Every `notify_frame_ready` call so far.
    pub fn ready_frames(&self) -> Vec<(u32, Slot, u64)> {
        self.ready.lock().clone()
    }

    /// Number of `drain_slot` calls.
    pub fn drain_calls(&self) -> u64 {
        self.drains.load(Ordering::Acquire)
    }
}

impl FrameManager for RecordingFrameManager {
    fn notify_frame_ready(&self, instance: u32, slot: Slot, frame: u64) {
        self.ready.lock().push((instance, slot, frame));
    }

    fn drain_slot(&self, _instance: u32, _slot: Slot) -> bool {
        self.drains.fetch_add(1, Ordering::AcqRel);
        !self.hold.load(Ordering::Acquire)
    }
}

/// Routing group that records every forwarded frame.
#[derive(Debug, Default)]
pub struct RecordingRoutingGroup {
    forwarded: Mutex<Vec<(u32, u64, PayloadDescriptor)>>,
}

impl RecordingRoutingGroup {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every forwarded frame so far.
    pub fn forwarded(&self) -> Vec<(u32, u64, PayloadDescriptor)> {
        self.forwarded.lock().clone()
    }
}

impl RoutingGroup for RecordingRoutingGroup {
    fn forward(&self, instance: u32, frame: u64, payload: PayloadDescriptor) {
        self.forwarded.lock().push((instance, frame, payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_map_reuses_windows() {
        let map = SimRegisterMap::new();
        let first = map.map_csi(0).unwrap();
        first.write(reg::CTRL, 0x5);
        let second = map.map_csi(0).unwrap();
        assert_eq!(second.read(reg::CTRL), 0x5);
        assert!(map.registers(1).is_none());
    }

    #[test]
    fn test_unavailable_instance() {
        let map = SimRegisterMap::new();
        map.set_unavailable(2, true);
        assert_eq!(map.map_csi(2).err().unwrap().kind(), ErrorKind::ResourceUnavailable);
        map.set_unavailable(2, false);
        assert!(map.map_csi(2).is_ok());
    }
}
