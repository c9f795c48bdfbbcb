//! # CSI Capture Synchronization Layer
//!
//! Coordinates MIPI CSI-2 receivers with their D-PHY lanes and the frame
//! consumers downstream. For every sensor instance it keeps a small state
//! machine that turns frame-start/frame-end interrupts into double-buffered
//! slot handoffs (or on-the-fly forwarding), and publishes a per-instance
//! count of completed frames.
//!
//! ## Crate Structure
//!
//! - **`capture`**: [`CaptureDevice`], the per-instance lifecycle
//!   (`probe`/`open`/`start`/`stop`/`close`), interrupt fast path and deferred
//!   handlers.
//! - **`csi`**: register-level control of one CSI receiver.
//! - **`phy`**: arbitration of the D-PHY control register shared by all lanes.
//! - **`publisher`**: the per-instance published frame counters.
//! - **`frame_manager`**: contracts of the frame consumers ([`FrameManager`],
//!   [`RoutingGroup`]) and the [`Binding`] chosen at `open`.
//! - **`state`**: lifecycle states and per-frame state flags.
//! - **`regs`**: the [`RegisterIo`] seam to hardware and an in-memory backend.
//! - **`config`**: Figment-based configuration.
//! - **`logging`**: tracing subscriber setup.
//! - **`sim`**: simulated register map, sensor and recording consumers.
//! - **`error`**: [`CaptureError`] and the crate [`Result`] alias.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use csi_capture::config::{CaptureSettings, SensorConfig};
//! use csi_capture::sim::{RecordingFrameManager, SimPlatform};
//! use csi_capture::{Binding, CaptureDevice};
//!
//! # fn main() -> csi_capture::Result<()> {
//! let sim = SimPlatform::new(CaptureSettings::default());
//! let sensor = SensorConfig::new("imx219", 0, 1920, 1080);
//! let device = CaptureDevice::probe(sensor, 0, &sim.platform)?;
//!
//! device.open(Binding::Local(Arc::new(RecordingFrameManager::new())))?;
//! device.start()?;
//! // ... interrupts arrive ...
//! device.stop(Duration::from_secs(1))?;
//! device.close()?;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod csi;
mod deferred;
pub mod error;
pub mod frame_manager;
pub mod logging;
pub mod phy;
pub mod publisher;
pub mod regs;
pub mod sim;
pub mod state;

pub use capture::{CaptureDevice, CaptureStats, IrqHandle, Platform, SoftwareChecks};
pub use deferred::DEFAULT_QUEUE_DEPTH;
pub use error::{CaptureError, ErrorKind, Result};
pub use frame_manager::{Binding, FrameManager, PayloadDescriptor, RoutingGroup};
pub use publisher::FrameCountPublisher;
pub use regs::{RegisterIo, RegisterMap};
pub use state::{CaptureState, Slot, StateFlags};
