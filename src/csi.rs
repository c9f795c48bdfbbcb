//! CSI receiver register controller.
//!
//! Stateless register-level operations over one instance's CSI register
//! window. Every operation validates its parameters before touching a
//! register, then performs read-modify-write updates. The controller has no
//! internal locking: the capture device that owns it serializes control-path
//! calls, and the interrupt path only touches the write-one-to-clear
//! interrupt source register.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CaptureError, Result};
use crate::regs::{RegisterIo, SharedRegisters};

/// Register offsets within a CSI window.
pub mod reg {
    /// Control: enable, software reset, lane count.
    pub const CTRL: usize = 0x00;
    /// D-PHY control: HS settle time and lane enables.
    pub const DPHY_CTRL: usize = 0x04;
    /// Interrupt mask (1 = enabled).
    pub const INT_MASK: usize = 0x10;
    /// Interrupt source, write-one-to-clear.
    pub const INT_SRC: usize = 0x14;
    /// Channel 0 configuration; channel `n` is at `CONFIG_CH0 + n * CH_STRIDE`.
    pub const CONFIG_CH0: usize = 0x20;
    /// Channel 0 resolution; follows the channel's configuration register.
    pub const RESOL_CH0: usize = 0x24;
    /// Distance between per-channel register pairs.
    pub const CH_STRIDE: usize = 0x10;
    /// Size of the CSI register window.
    pub const WINDOW_SIZE: usize = 0x60;
}

const CTRL_ENABLE: u32 = 1 << 0;
const CTRL_SW_RESET: u32 = 1 << 1;
const CTRL_UPDATE_SHADOW: u32 = 1 << 2;
const CTRL_LANE_SHIFT: u32 = 8;
const CTRL_LANE_MASK: u32 = 0x3 << CTRL_LANE_SHIFT;

const DPHY_CLK_LANE_EN: u32 = 1 << 0;
const DPHY_DATA_LANE_SHIFT: u32 = 1;
const DPHY_DATA_LANE_MASK: u32 = 0xF << DPHY_DATA_LANE_SHIFT;
const DPHY_SETTLE_SHIFT: u32 = 24;
const DPHY_SETTLE_MASK: u32 = 0xFF << DPHY_SETTLE_SHIFT;

const CONFIG_DATA_TYPE_SHIFT: u32 = 2;
const CONFIG_DATA_TYPE_MASK: u32 = 0x3F << CONFIG_DATA_TYPE_SHIFT;

/// Number of virtual channels.
pub const CHANNEL_COUNT: u32 = 4;
/// Largest accepted frame dimension in pixels.
pub const MAX_DIMENSION: u32 = 8192;
/// Largest HS settle value (8-bit field).
pub const MAX_SETTLE: u32 = 0xFF;

bitflags! {
    /// Bits of the interrupt mask and source registers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IrqStatus: u32 {
        /// Frame start received.
        const FRAME_START = 1 << 0;
        /// Frame end received.
        const FRAME_END = 1 << 1;
        /// Receive FIFO overflow.
        const ERR_OVERFLOW = 1 << 4;
        /// Uncorrectable packet header ECC error.
        const ERR_ECC = 1 << 5;
        /// Payload CRC error.
        const ERR_CRC = 1 << 6;
    }
}

impl IrqStatus {
    /// Error bits.
    pub const ERRORS: Self = Self::ERR_OVERFLOW
        .union(Self::ERR_ECC)
        .union(Self::ERR_CRC);
}

/// Opaque CSI-2 data type code (6 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PixelFormat(pub u32);

impl PixelFormat {
    /// YUV422 8-bit.
    pub const YUV422_8: Self = Self(0x1E);
    /// RGB888.
    pub const RGB888: Self = Self(0x24);
    /// RAW8.
    pub const RAW8: Self = Self(0x2A);
    /// RAW10.
    pub const RAW10: Self = Self(0x2B);
    /// RAW12.
    pub const RAW12: Self = Self(0x2C);
}

/// Register-level control of one CSI receiver.
pub struct CsiController {
    regs: SharedRegisters,
}

impl CsiController {
    /// Wrap a CSI register window.
    pub fn new(regs: SharedRegisters) -> Self {
        Self { regs }
    }

    /// Underlying register window.
    pub fn registers(&self) -> &dyn RegisterIo {
        self.regs.as_ref()
    }

    /// Software-reset the receiver and return every control field to its default.
    pub fn reset(&self) -> Result<()> {
        self.regs.write(reg::CTRL, CTRL_SW_RESET);
        self.regs.write(reg::CTRL, 0);
        self.regs.write(reg::DPHY_CTRL, 0);
        self.regs.write(reg::INT_MASK, 0);
        self.regs.write(reg::INT_SRC, u32::MAX);
        debug!("CSI software reset");
        Ok(())
    }

    /// Program the D-PHY HS settle time (0..=255 byte clocks).
    pub fn set_settle_time(&self, settle: u32) -> Result<()> {
        if settle > MAX_SETTLE {
            return Err(CaptureError::invalid_argument(format!(
                "settle time {settle} exceeds {MAX_SETTLE}"
            )));
        }
        self.regs.modify(
            reg::DPHY_CTRL,
            DPHY_SETTLE_MASK,
            settle << DPHY_SETTLE_SHIFT,
        );
        debug!(settle, "Set CSI settle time");
        Ok(())
    }

    /// Set the number of active data lanes (1..=4).
    pub fn set_data_lanes(&self, lanes: u32) -> Result<()> {
        if !(1..=4).contains(&lanes) {
            return Err(CaptureError::invalid_argument(format!(
                "data lane count {lanes} not in 1..=4"
            )));
        }
        self.regs.modify(
            reg::CTRL,
            CTRL_LANE_MASK,
            (lanes - 1) << CTRL_LANE_SHIFT,
        );
        let lane_enables = ((1 << lanes) - 1) << DPHY_DATA_LANE_SHIFT;
        self.regs.modify(
            reg::DPHY_CTRL,
            DPHY_DATA_LANE_MASK,
            lane_enables | DPHY_CLK_LANE_EN,
        );
        debug!(lanes, "Set CSI data lanes");
        Ok(())
    }

    /// Number of data lanes currently programmed.
    pub fn data_lanes(&self) -> u32 {
        ((self.regs.read(reg::CTRL) & CTRL_LANE_MASK) >> CTRL_LANE_SHIFT) + 1
    }

    /// Configure data type and geometry of a virtual channel.
    pub fn configure(
        &self,
        channel: u32,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<()> {
        if channel >= CHANNEL_COUNT {
            return Err(CaptureError::invalid_argument(format!(
                "channel {channel} out of range: {CHANNEL_COUNT} channels"
            )));
        }
        if format.0 > 0x3F {
            return Err(CaptureError::invalid_argument(format!(
                "pixel format {:#x} is not a 6-bit data type",
                format.0
            )));
        }
        if !(1..=MAX_DIMENSION).contains(&width) || !(1..=MAX_DIMENSION).contains(&height) {
            return Err(CaptureError::invalid_argument(format!(
                "geometry {width}x{height} outside 1..={MAX_DIMENSION}"
            )));
        }

        let base = channel as usize * reg::CH_STRIDE;
        self.regs.modify(
            reg::CONFIG_CH0 + base,
            CONFIG_DATA_TYPE_MASK,
            format.0 << CONFIG_DATA_TYPE_SHIFT,
        );
        self.regs.write(reg::RESOL_CH0 + base, (width << 16) | height);
        self.regs.modify(reg::CTRL, 0, CTRL_UPDATE_SHADOW);

        debug!(channel, format = format.0, width, height, "Configured CSI channel");
        Ok(())
    }

    /// Unmask or mask frame and error interrupts.
    pub fn set_interrupt_enabled(&self, enabled: bool) -> Result<()> {
        let mask = IrqStatus::FRAME_START | IrqStatus::FRAME_END | IrqStatus::ERRORS;
        if enabled {
            self.regs.modify(reg::INT_MASK, 0, mask.bits());
        } else {
            self.regs.modify(reg::INT_MASK, mask.bits(), 0);
            self.regs.write(reg::INT_SRC, mask.bits());
        }
        debug!(enabled, "Set CSI interrupts");
        Ok(())
    }

    /// Start reception.
    pub fn enable(&self) -> Result<()> {
        self.regs.modify(reg::CTRL, 0, CTRL_ENABLE);
        debug!("CSI stream enabled");
        Ok(())
    }

    /// Stop reception.
    pub fn disable(&self) -> Result<()> {
        self.regs.modify(reg::CTRL, CTRL_ENABLE, 0);
        debug!("CSI stream disabled");
        Ok(())
    }

    /// Whether reception is enabled.
    pub fn is_enabled(&self) -> bool {
        self.regs.read(reg::CTRL) & CTRL_ENABLE != 0
    }

    /// Read and acknowledge pending unmasked interrupts.
    ///
    /// Called from the interrupt path: a single read and a single
    /// write-one-to-clear, no other register traffic.
    pub fn take_interrupt_status(&self) -> IrqStatus {
        let pending = self.regs.read(reg::INT_SRC) & self.regs.read(reg::INT_MASK);
        if pending != 0 {
            self.regs.write(reg::INT_SRC, pending);
        }
        IrqStatus::from_bits_truncate(pending)
    }
}

impl std::fmt::Debug for CsiController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsiController")
            .field("ctrl", &format_args!("{:#010x}", self.regs.read(reg::CTRL)))
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::SimRegisters;
    use crate::ErrorKind;
    use std::sync::Arc;

    fn controller() -> (Arc<SimRegisters>, CsiController) {
        let regs = Arc::new(SimRegisters::new(reg::WINDOW_SIZE).with_write_one_to_clear(reg::INT_SRC));
        let csi = CsiController::new(regs.clone());
        (regs, csi)
    }

    #[test]
    fn test_data_lanes_range() {
        let (regs, csi) = controller();
        for lanes in 1..=4 {
            csi.set_data_lanes(lanes).unwrap();
            assert_eq!(csi.data_lanes(), lanes);
        }

        let writes = regs.write_count();
        assert_eq!(csi.set_data_lanes(0).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(csi.set_data_lanes(5).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(regs.write_count(), writes);
        assert_eq!(csi.data_lanes(), 4);
    }

    #[test]
    fn test_settle_time_field() {
        let (regs, csi) = controller();
        csi.set_data_lanes(2).unwrap();
        csi.set_settle_time(0x1C).unwrap();

        let dphy = regs.read(reg::DPHY_CTRL);
        assert_eq!(dphy >> DPHY_SETTLE_SHIFT, 0x1C);
        assert_eq!(dphy & DPHY_DATA_LANE_MASK, 0b11 << DPHY_DATA_LANE_SHIFT);
        assert!(csi.set_settle_time(256).is_err());
    }

    #[test]
    fn test_configure_channel() {
        let (regs, csi) = controller();
        csi.configure(1, PixelFormat::RAW10, 1920, 1080).unwrap();

        let config = regs.read(reg::CONFIG_CH0 + reg::CH_STRIDE);
        assert_eq!((config & CONFIG_DATA_TYPE_MASK) >> CONFIG_DATA_TYPE_SHIFT, 0x2B);
        assert_eq!(
            regs.read(reg::RESOL_CH0 + reg::CH_STRIDE),
            (1920 << 16) | 1080
        );

        assert!(csi.configure(4, PixelFormat::RAW10, 1920, 1080).is_err());
        assert!(csi.configure(0, PixelFormat(0x40), 1920, 1080).is_err());
        assert!(csi.configure(0, PixelFormat::RAW10, 0, 1080).is_err());
        assert!(csi.configure(0, PixelFormat::RAW10, 1920, MAX_DIMENSION + 1).is_err());
    }

    #[test]
    fn test_interrupt_status_masked_and_acknowledged() {
        let (regs, csi) = controller();
        regs.raise(reg::INT_SRC, IrqStatus::FRAME_START.bits());
        assert!(csi.take_interrupt_status().is_empty());

        csi.set_interrupt_enabled(true).unwrap();
        regs.raise(reg::INT_SRC, (IrqStatus::FRAME_START | IrqStatus::FRAME_END).bits());
        assert_eq!(
            csi.take_interrupt_status(),
            IrqStatus::FRAME_START | IrqStatus::FRAME_END
        );
        assert!(csi.take_interrupt_status().is_empty());
    }

    #[test]
    fn test_enable_disable() {
        let (_regs, csi) = controller();
        csi.set_data_lanes(4).unwrap();
        csi.enable().unwrap();
        assert!(csi.is_enabled());
        assert_eq!(csi.data_lanes(), 4);
        csi.disable().unwrap();
        assert!(!csi.is_enabled());
    }
}
