//! End-to-end lifecycle tests on the simulated platform.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use csi_capture::config::{CaptureSettings, SensorConfig};
use csi_capture::csi::{IrqStatus, PixelFormat};
use csi_capture::sim::{RecordingFrameManager, RecordingRoutingGroup, SimPlatform, SimSensor};
use csi_capture::{Binding, CaptureDevice, CaptureState, ErrorKind, FrameManager, Slot, StateFlags};
use parking_lot::{Condvar, Mutex};

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn frame_pair(sim: &SimPlatform, device: &CaptureDevice) {
    sim.map.raise(device.instance(), IrqStatus::FRAME_START);
    device.irq_handle().handle();
    sim.map.raise(device.instance(), IrqStatus::FRAME_END);
    device.irq_handle().handle();
}

#[test]
fn test_end_to_end_capture() {
    let sim = SimPlatform::new(CaptureSettings::default());
    let manager = Arc::new(RecordingFrameManager::new());
    let device = CaptureDevice::probe(SensorConfig::new("imx477", 0, 1920, 1080), 0, &sim.platform).unwrap();
    assert_eq!(device.state(), CaptureState::Closed);

    device.open(Binding::Local(manager.clone())).unwrap();
    device
        .with_csi(|csi| csi.configure(0, PixelFormat::RAW12, 1920, 1080))
        .unwrap();
    device.with_csi(|csi| csi.set_data_lanes(4)).unwrap();
    let err = device.with_csi(|csi| csi.set_data_lanes(5)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    device.start().unwrap();
    for frame in 1..=3 {
        frame_pair(&sim, &device);
        assert!(wait_until(Duration::from_secs(2), || {
            device.published_frame_count() == frame
        }));
    }
    assert_eq!(sim.platform.publisher.read(0), Some(3));

    device.stop(Duration::from_secs(5)).unwrap();
    device.close().unwrap();
    assert_eq!(device.state(), CaptureState::Closed);
    assert!(device.flags().valid_slots().is_empty());
    assert_eq!(manager.ready_frames().len(), 3);
}

#[test]
fn test_published_count_advances_by_frame_pairs() {
    let sim = SimPlatform::new(CaptureSettings::default());
    let device = CaptureDevice::probe(SensorConfig::new("ov5647", 1, 640, 480), 1, &sim.platform).unwrap();
    device
        .open(Binding::Local(Arc::new(RecordingFrameManager::new())))
        .unwrap();
    device.start().unwrap();

    let before = device.published_frame_count();
    const N: u64 = 25;
    for frame in 1..=N {
        frame_pair(&sim, &device);
        assert!(wait_until(Duration::from_secs(2), || {
            device.published_frame_count() == before + frame
        }));
    }

    device.stop(Duration::from_secs(5)).unwrap();
    assert_eq!(device.published_frame_count() - before, N);
    assert_eq!(sim.platform.publisher.read(0), Some(0));
    device.close().unwrap();
}

/// Frame manager that records the order of its calls.
#[derive(Default)]
struct StrictManager {
    calls: Mutex<Vec<&'static str>>,
}

impl FrameManager for StrictManager {
    fn notify_frame_ready(&self, _instance: u32, _slot: Slot, _frame: u64) {
        self.calls.lock().push("notify");
    }

    fn drain_slot(&self, _instance: u32, _slot: Slot) -> bool {
        self.calls.lock().push("drain");
        true
    }
}

#[test]
fn test_on_the_fly_and_local_are_exclusive() {
    let sim = SimPlatform::new(CaptureSettings::default());

    let group = Arc::new(RecordingRoutingGroup::new());
    let otf = CaptureDevice::probe(SensorConfig::new("otf", 0, 1280, 720), 0, &sim.platform).unwrap();
    otf.open(Binding::OnTheFly {
        group: 7,
        target: group.clone(),
    })
    .unwrap();

    let manager = Arc::new(StrictManager::default());
    let local = CaptureDevice::probe(
        SensorConfig {
            phy_lane: Some(1),
            ..SensorConfig::new("local", 1, 1280, 720)
        },
        1,
        &sim.platform,
    )
    .unwrap();
    local.open(Binding::Local(manager.clone())).unwrap();

    otf.start().unwrap();
    local.start().unwrap();
    for frame in 1..=4 {
        frame_pair(&sim, &otf);
        frame_pair(&sim, &local);
        assert!(wait_until(Duration::from_secs(2), || {
            otf.published_frame_count() == frame && local.published_frame_count() == frame
        }));
        assert!(otf.flags().valid_slots().is_empty());
        assert!(otf.flags().validate().is_ok());
    }

    otf.stop(Duration::from_secs(1)).unwrap();
    local.stop(Duration::from_secs(1)).unwrap();

    // Only the on-the-fly device forwarded, and only the local one buffered.
    let forwarded = group.forwarded();
    assert_eq!(forwarded.len(), 4);
    assert!(forwarded.iter().all(|(instance, _, _)| *instance == 0));
    let calls = manager.calls.lock().clone();
    assert_eq!(calls.iter().filter(|c| **c == "notify").count(), 4);
    assert!(calls.iter().any(|c| *c == "drain"));

    otf.close().unwrap();
    local.close().unwrap();
}

#[test]
fn test_stalled_consumer_times_out_then_recovers() {
    let sim = SimPlatform::new(CaptureSettings::default());
    let manager = Arc::new(RecordingFrameManager::new());
    manager.hold(true);
    let device = CaptureDevice::probe(SensorConfig::new("stall", 2, 1920, 1080), 2, &sim.platform).unwrap();
    device.open(Binding::Local(manager.clone())).unwrap();
    device.start().unwrap();
    frame_pair(&sim, &device);
    frame_pair(&sim, &device);

    let err = device.stop(Duration::from_millis(30)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(device.state(), CaptureState::Draining);
    assert!(device.with_csi(|csi| Ok(csi.is_enabled())).unwrap());
    assert!(device.flags().contains(StateFlags::LAST_CAPTURE));

    // Still draining: late frames are counted but never claim a slot.
    frame_pair(&sim, &device);
    let stats = device.stats();
    assert_eq!(stats.frame_count, 3);
    assert_eq!(stats.late_frames, 1);
    assert_eq!(stats.overruns, 0);
    assert_eq!(stats.flags.valid_slots(), StateFlags::SLOT_MASK);

    manager.hold(false);
    device.stop(Duration::from_secs(2)).unwrap();
    assert!(!device.with_csi(|csi| Ok(csi.is_enabled())).unwrap());
    device.close().unwrap();
    assert_eq!(device.state(), CaptureState::Closed);
}

#[test]
fn test_simulated_sensor_streams_until_stop() {
    let sim = SimPlatform::new(CaptureSettings::default());
    let device = CaptureDevice::probe(SensorConfig::new("sim", 0, 1920, 1080), 0, &sim.platform).unwrap();
    device
        .open(Binding::Local(Arc::new(RecordingFrameManager::new())))
        .unwrap();

    let regs = sim.map.registers(0).unwrap();
    let mut sensor = SimSensor::spawn(regs, device.irq_handle(), Duration::from_millis(2)).unwrap();

    // Nothing is emitted until the stream is enabled.
    thread::sleep(Duration::from_millis(10));
    assert_eq!(sensor.frames(), 0);

    device.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || device.published_frame_count() >= 5));

    device.stop(Duration::from_secs(2)).unwrap();
    let emitted = sensor.frames();
    thread::sleep(Duration::from_millis(10));
    assert!(sensor.frames() <= emitted + 1);
    sensor.stop();

    let stats = device.stats();
    assert!(stats.frame_count >= 5);
    assert_eq!(stats.pending_work, 0);
    device.close().unwrap();
}

/// Frame manager that takes longer to accept a frame than the sensor takes to
/// produce one.
struct SlowManager {
    delay: Duration,
    notified: AtomicU64,
}

impl FrameManager for SlowManager {
    fn notify_frame_ready(&self, _instance: u32, _slot: Slot, _frame: u64) {
        thread::sleep(self.delay);
        self.notified.fetch_add(1, Ordering::Relaxed);
    }

    fn drain_slot(&self, _instance: u32, _slot: Slot) -> bool {
        true
    }
}

#[test]
fn test_stop_converges_with_live_sensor_and_slow_consumer() {
    let sim = SimPlatform::new(CaptureSettings::default());
    let manager = Arc::new(SlowManager {
        delay: Duration::from_millis(5),
        notified: AtomicU64::new(0),
    });
    let device = CaptureDevice::probe(SensorConfig::new("slow", 1, 1280, 720), 1, &sim.platform).unwrap();
    device.open(Binding::Local(manager.clone())).unwrap();

    let regs = sim.map.registers(1).unwrap();
    let mut sensor = SimSensor::spawn(regs, device.irq_handle(), Duration::from_millis(2)).unwrap();
    device.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        manager.notified.load(Ordering::Relaxed) >= 3
    }));

    // The sensor keeps raising interrupts until the stream is disabled.
    device.stop(Duration::from_secs(2)).unwrap();
    let stats = device.stats();
    assert_eq!(stats.state, CaptureState::Draining);
    assert_eq!(stats.pending_work, 0);
    assert!(stats.flags.valid_slots().is_empty());
    assert!(!device.with_csi(|csi| Ok(csi.is_enabled())).unwrap());

    let emitted = sensor.frames();
    thread::sleep(Duration::from_millis(10));
    assert!(sensor.frames() <= emitted + 1);
    sensor.stop();
    device.close().unwrap();
    assert_eq!(device.state(), CaptureState::Closed);
}

/// Frame manager whose notify blocks the worker until the gate opens.
#[derive(Default)]
struct GatedManager {
    open: Mutex<bool>,
    opened: Condvar,
    entered: AtomicBool,
}

impl GatedManager {
    fn release(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }
}

impl FrameManager for GatedManager {
    fn notify_frame_ready(&self, _instance: u32, _slot: Slot, _frame: u64) {
        self.entered.store(true, Ordering::Release);
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
    }

    fn drain_slot(&self, _instance: u32, _slot: Slot) -> bool {
        true
    }
}

#[test]
fn test_blocked_worker_times_out_with_work_pending() {
    let sim = SimPlatform::new(CaptureSettings::default());
    let manager = Arc::new(GatedManager::default());
    let device = CaptureDevice::probe(SensorConfig::new("gated", 2, 1920, 1080), 2, &sim.platform).unwrap();
    device.open(Binding::Local(manager.clone())).unwrap();
    device.start().unwrap();

    frame_pair(&sim, &device);
    assert!(wait_until(Duration::from_secs(2), || manager.entered.load(Ordering::Acquire)));

    let err = device.stop(Duration::from_millis(30)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    let stats = device.stats();
    assert_eq!(stats.state, CaptureState::Draining);
    assert!(stats.pending_work > 0);
    assert_eq!(stats.published, 0);
    assert!(device.with_csi(|csi| Ok(csi.is_enabled())).unwrap());

    manager.release();
    device.stop(Duration::from_secs(2)).unwrap();
    let stats = device.stats();
    assert_eq!(stats.pending_work, 0);
    assert_eq!(stats.published, 1);
    assert!(stats.flags.valid_slots().is_empty());
    assert!(!device.with_csi(|csi| Ok(csi.is_enabled())).unwrap());
    device.close().unwrap();
}
