//! Contracts of the frame consumers.
//!
//! The capture layer never touches pixel memory. Completed frames go either to
//! a [`FrameManager`] that owns the two local slots' buffers, or, in
//! on-the-fly mode, straight to a downstream [`RoutingGroup`]. Which one is
//! fixed for a whole open/close session by the [`Binding`] passed to `open`.
//!
//! Both traits are called from deferred-work context only: implementations
//! may take locks but must return in bounded time.

use std::fmt;
use std::sync::Arc;

use crate::csi::PixelFormat;
use crate::state::Slot;

/// Owner of the local double-buffer slots.
pub trait FrameManager: Send + Sync {
    /// A frame landed in `slot` and is ready to be consumed.
    fn notify_frame_ready(&self, instance: u32, slot: Slot, frame: u64);

    /// Try to release `slot`. Returns `true` once the slot is empty.
    fn drain_slot(&self, instance: u32, slot: Slot) -> bool;
}

/// Downstream processing group fed directly in on-the-fly mode.
pub trait RoutingGroup: Send + Sync {
    /// Hand `frame` to the group.
    fn forward(&self, instance: u32, frame: u64, payload: PayloadDescriptor);
}

/// What the downstream stage needs to interpret a forwarded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadDescriptor {
    /// CSI virtual channel.
    pub channel: u32,
    /// Opaque data type code.
    pub format: PixelFormat,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Consumer bound to a device between `open` and `close`.
#[derive(Clone)]
pub enum Binding {
    /// Buffer frames in the local slots for a frame manager.
    Local(Arc<dyn FrameManager>),
    /// Forward every frame to a routing group, bypassing the slots.
    OnTheFly {
        /// Downstream group id.
        group: u32,
        /// Group entry point.
        target: Arc<dyn RoutingGroup>,
    },
}

impl Binding {
    /// Whether frames bypass local buffering.
    pub fn is_on_the_fly(&self) -> bool {
        matches!(self, Self::OnTheFly { .. })
    }

    /// Routing group id, if on-the-fly.
    pub fn routing_group(&self) -> Option<u32> {
        match self {
            Self::OnTheFly { group, .. } => Some(*group),
            Self::Local(_) => None,
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(_) => f.write_str("Local"),
            Self::OnTheFly { group, .. } => f.debug_struct("OnTheFly").field("group", group).finish(),
        }
    }
}
