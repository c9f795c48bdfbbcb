//! D-PHY arbiter.
//!
//! The D-PHY lanes of every CSI instance share a single control register. Each
//! lane owns a 4-bit field in it:
//!
//! ```text
//!  31        12 11    8 7     4 3     0
//! ┌────────────┬───────┬───────┬───────┐
//! │  reserved  │ lane2 │ lane1 │ lane0 │   bit 0: ENABLE
//! └────────────┴───────┴───────┴───────┘   bit 1: S_RESETN  bit 2: M_RESETN
//! ```
//!
//! Updating one lane is a read-modify-write of the whole register, so two
//! instances configuring their lanes at the same time would lose each other's
//! bits without serialization. [`PhyArbiter`] owns the one lock for the
//! register and hands out a [`PhyGuard`] for the duration of a transaction.
//! The lock is taken by spinning on `try_lock` for a bounded time. The waiter
//! never parks, so the arbiter stays usable from contexts that must not sleep.

use std::hint;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CaptureError, Result};
use crate::regs::{RegisterIo, SharedRegisters};

/// Offset of the shared PHY control register.
pub const PHY_CONTROL: usize = 0x0;

/// Number of D-PHY lanes sharing the control register.
pub const DEFAULT_PHY_COUNT: u32 = 3;

/// Width of one lane's field in [`PHY_CONTROL`].
const LANE_STRIDE: u32 = 4;

const PHY_ENABLE: u32 = 1 << 0;
const PHY_S_RESETN: u32 = 1 << 1;
const PHY_M_RESETN: u32 = 1 << 2;

/// Default bound on waiting for the PHY register lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_micros(500);

/// Which reset line of a lane to pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetSelector {
    /// Slave (receiver) reset; the normal choice for CSI reception.
    #[default]
    Slave,
    /// Master (transmitter) reset.
    Master,
}

impl ResetSelector {
    fn bit(self) -> u32 {
        match self {
            Self::Slave => PHY_S_RESETN,
            Self::Master => PHY_M_RESETN,
        }
    }
}

/// Decoded state of one lane's field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneBits {
    /// Lane powered.
    pub enabled: bool,
    /// Slave reset released.
    pub slave_out_of_reset: bool,
    /// Master reset released.
    pub master_out_of_reset: bool,
}

impl LaneBits {
    fn decode(field: u32) -> Self {
        Self {
            enabled: field & PHY_ENABLE != 0,
            slave_out_of_reset: field & PHY_S_RESETN != 0,
            master_out_of_reset: field & PHY_M_RESETN != 0,
        }
    }

    /// Whether the selected reset line is released.
    pub fn out_of_reset(&self, reset: ResetSelector) -> bool {
        match reset {
            ResetSelector::Slave => self.slave_out_of_reset,
            ResetSelector::Master => self.master_out_of_reset,
        }
    }
}

/// Serializes access to the shared D-PHY control register.
pub struct PhyArbiter {
    regs: SharedRegisters,
    lock: Mutex<()>,
    lanes: u32,
    lock_timeout: Duration,
}

/// Exclusive access token for the PHY control register.
///
/// Held for exactly one register transaction; dropping it releases the lock.
pub struct PhyGuard<'a> {
    regs: &'a dyn RegisterIo,
    _guard: MutexGuard<'a, ()>,
}

impl PhyGuard<'_> {
    /// Read the control register.
    pub fn read(&self) -> u32 {
        self.regs.read(PHY_CONTROL)
    }

    /// Read-modify-write the control register.
    pub fn modify(&self, clear: u32, set: u32) -> u32 {
        self.regs.modify(PHY_CONTROL, clear, set)
    }
}

impl PhyArbiter {
    /// Create an arbiter over `regs` with [`DEFAULT_PHY_COUNT`] lanes.
    pub fn new(regs: SharedRegisters) -> Self {
        Self::with_lanes(regs, DEFAULT_PHY_COUNT)
    }

    /// Create an arbiter with an explicit lane count (at most 8).
    pub fn with_lanes(regs: SharedRegisters, lanes: u32) -> Self {
        Self {
            regs,
            lock: Mutex::new(()),
            lanes: lanes.min(32 / LANE_STRIDE),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Set the bound on waiting for the register lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Number of lanes managed.
    pub fn lanes(&self) -> u32 {
        self.lanes
    }

    /// Acquire the register for one transaction.
    ///
    /// Spins without sleeping. Fails with `ResourceUnavailable` if the lock
    /// is not obtained within the configured bound.
    pub fn lock(&self) -> Result<PhyGuard<'_>> {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            if let Some(guard) = self.lock.try_lock() {
                return Ok(PhyGuard {
                    regs: self.regs.as_ref(),
                    _guard: guard,
                });
            }
            if Instant::now() >= deadline {
                warn!(timeout = ?self.lock_timeout, "PHY control register lock contended");
                return Err(CaptureError::unavailable(format!(
                    "PHY control register busy for more than {:?}",
                    self.lock_timeout
                )));
            }
            hint::spin_loop();
        }
    }

    /// Reset and enable or disable one lane.
    ///
    /// The selected reset line is pulsed (asserted, then released). Enabling
    /// then powers the lane; disabling powers it down and holds the reset
    /// asserted.
    pub fn configure(&self, id: u32, enable: bool, reset: ResetSelector) -> Result<()> {
        self.check_id(id)?;

        let shift = id * LANE_STRIDE;
        let reset_bit = reset.bit() << shift;
        let enable_bit = PHY_ENABLE << shift;

        let phy = self.lock()?;
        phy.modify(reset_bit, 0);
        phy.modify(0, reset_bit);
        let value = if enable {
            phy.modify(0, enable_bit)
        } else {
            phy.modify(enable_bit | reset_bit, 0)
        };
        drop(phy);

        debug!(id, enable, ?reset, value = format_args!("{value:#010x}"), "Configured D-PHY lane");
        Ok(())
    }

    /// Current bits of lane `id`.
    pub fn lane_bits(&self, id: u32) -> Result<LaneBits> {
        self.check_id(id)?;
        let value = self.lock()?.read();
        Ok(LaneBits::decode((value >> (id * LANE_STRIDE)) & 0xF))
    }

    fn check_id(&self, id: u32) -> Result<()> {
        if id >= self.lanes {
            return Err(CaptureError::invalid_argument(format!(
                "PHY lane {id} out of range: {} lanes available",
                self.lanes
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for PhyArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhyArbiter")
            .field("lanes", &self.lanes)
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::SimRegisters;
    use std::sync::Arc;

    fn arbiter() -> (Arc<SimRegisters>, PhyArbiter) {
        let regs = Arc::new(SimRegisters::new(4));
        let phy = PhyArbiter::new(regs.clone());
        (regs, phy)
    }

    #[test]
    fn test_enable_sets_only_own_field() {
        let (regs, phy) = arbiter();
        phy.configure(1, true, ResetSelector::Slave).unwrap();
        assert_eq!(regs.read(PHY_CONTROL), (PHY_ENABLE | PHY_S_RESETN) << 4);

        let bits = phy.lane_bits(1).unwrap();
        assert!(bits.enabled);
        assert!(bits.out_of_reset(ResetSelector::Slave));
        assert!(!bits.out_of_reset(ResetSelector::Master));
    }

    #[test]
    fn test_disable_holds_reset() {
        let (regs, phy) = arbiter();
        phy.configure(0, true, ResetSelector::Slave).unwrap();
        phy.configure(2, true, ResetSelector::Slave).unwrap();
        phy.configure(0, false, ResetSelector::Slave).unwrap();

        assert_eq!(regs.read(PHY_CONTROL), (PHY_ENABLE | PHY_S_RESETN) << 8);
        assert!(!phy.lane_bits(0).unwrap().enabled);
    }

    #[test]
    fn test_invalid_lane_writes_nothing() {
        let (regs, phy) = arbiter();
        let err = phy.configure(3, true, ResetSelector::Slave).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);
        assert_eq!(regs.write_count(), 0);
    }

    #[test]
    fn test_contended_lock_reports_unavailable() {
        let (_regs, phy) = arbiter();
        let phy = phy.with_lock_timeout(Duration::from_millis(1));
        let held = phy.lock().unwrap();

        let err = phy.configure(0, true, ResetSelector::Slave).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ResourceUnavailable);
        drop(held);
        assert!(phy.configure(0, true, ResetSelector::Slave).is_ok());
    }
}
