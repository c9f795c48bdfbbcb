//! Lifecycle state and per-frame state flags of a capture instance.
//!
//! Two independent pieces of state live here:
//!
//! - [`CaptureState`]: the coarse lifecycle
//!   (`Closed → Configuring → Armed → Streaming → Draining → Closed`), changed
//!   only from caller context.
//! - [`StateFlags`]: the per-frame bits (slot A/B valid, last capture,
//!   on-the-fly), changed from both the interrupt path and deferred work.
//!
//! Both are stored in atomics so the interrupt path can read them without
//! taking the control lock.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use bitflags::bitflags;

/// Lifecycle state of a capture instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CaptureState {
    /// Probed or released; no hardware bound.
    #[default]
    Closed = 0,
    /// `open` in progress: registers acquired, CSI and PHY being programmed.
    Configuring = 1,
    /// Configured with interrupts enabled, stream not running.
    Armed = 2,
    /// Stream enabled; interrupts drive the frame state machine.
    Streaming = 3,
    /// `stop` requested; waiting for slots and deferred work to drain.
    Draining = 4,
}

impl CaptureState {
    /// Convert from the raw value stored in [`AtomicState`].
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Closed),
            1 => Some(Self::Configuring),
            2 => Some(Self::Armed),
            3 => Some(Self::Streaming),
            4 => Some(Self::Draining),
            _ => None,
        }
    }

    /// Whether `self → next` is one of the enumerated lifecycle transitions.
    ///
    /// `Configuring → Closed` is the rollback edge of a failed `open`;
    /// `Armed → Closed` is closing a device that never streamed.
    pub fn can_transition_to(self, next: Self) -> bool {
        use CaptureState::*;
        matches!(
            (self, next),
            (Closed, Configuring)
                | (Configuring, Armed)
                | (Configuring, Closed)
                | (Armed, Streaming)
                | (Armed, Closed)
                | (Streaming, Draining)
                | (Draining, Closed)
        )
    }

    /// Whether hardware interrupts are processed in this state.
    pub fn accepts_interrupts(self) -> bool {
        matches!(self, Self::Streaming | Self::Draining)
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "Closed",
            Self::Configuring => "Configuring",
            Self::Armed => "Armed",
            Self::Streaming => "Streaming",
            Self::Draining => "Draining",
        };
        f.pad(name)
    }
}

/// Lock-free cell holding a [`CaptureState`].
#[derive(Debug, Default)]
pub struct AtomicState(AtomicU8);

impl AtomicState {
    /// Current state.
    pub fn load(&self) -> CaptureState {
        CaptureState::from_raw(self.0.load(Ordering::Acquire)).unwrap_or_default()
    }

    /// Move from `from` to `to`, failing with the actual state if it was not `from`.
    ///
    /// Only enumerated transitions are accepted; an illegal edge reports the
    /// current state unchanged.
    pub fn transition(&self, from: CaptureState, to: CaptureState) -> Result<(), CaptureState> {
        if !from.can_transition_to(to) {
            return Err(self.load());
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| CaptureState::from_raw(actual).unwrap_or_default())
    }
}

bitflags! {
    /// Per-frame state bits of a capture instance.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StateFlags: u32 {
        /// Slot A holds a frame the consumer has not drained.
        const SLOT_A_VALID = 1 << 0;
        /// Slot B holds a frame the consumer has not drained.
        const SLOT_B_VALID = 1 << 1;
        /// `stop` requested; the stream ends once the slots drain.
        const LAST_CAPTURE = 1 << 2;
        /// Frames bypass the slots and go straight to the routing group.
        const OTF_TO_NEXT_STAGE = 1 << 3;
    }
}

/// Combination of flags that must never be observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagViolation(pub StateFlags);

impl fmt::Display for FlagViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "on-the-fly routing with a valid local slot: {:?}", self.0)
    }
}

impl StateFlags {
    /// Both slot-valid bits.
    pub const SLOT_MASK: Self = Self::SLOT_A_VALID.union(Self::SLOT_B_VALID);

    /// Slot bits currently set.
    pub fn valid_slots(self) -> Self {
        self.intersection(Self::SLOT_MASK)
    }

    /// Pick the slot the next frame lands in: `preferred` if free, else the other one.
    ///
    /// `None` means both slots still hold undrained frames (overrun).
    pub fn free_slot(self, preferred: Slot) -> Option<Slot> {
        [preferred, preferred.other()]
            .into_iter()
            .find(|slot| !self.contains(slot.flag()))
    }

    /// Check the flags for illegal combinations.
    pub fn validate(self) -> Result<(), FlagViolation> {
        if self.contains(Self::OTF_TO_NEXT_STAGE) && !self.valid_slots().is_empty() {
            return Err(FlagViolation(self));
        }
        Ok(())
    }
}

/// One of the two double-buffering slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// First slot.
    A,
    /// Second slot.
    B,
}

impl Slot {
    /// Valid bit of this slot.
    pub fn flag(self) -> StateFlags {
        match self {
            Self::A => StateFlags::SLOT_A_VALID,
            Self::B => StateFlags::SLOT_B_VALID,
        }
    }

    /// The other slot.
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    /// Zero-based index (A = 0, B = 1).
    pub fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }
}

/// Lock-free cell holding [`StateFlags`].
#[derive(Debug, Default)]
pub struct AtomicFlags(AtomicU32);

impl AtomicFlags {
    /// Current flags.
    pub fn load(&self) -> StateFlags {
        StateFlags::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    /// Replace all flags.
    pub fn store(&self, flags: StateFlags) {
        self.0.store(flags.bits(), Ordering::Release);
    }

    /// Set `flags`, returning the previous value.
    pub fn insert(&self, flags: StateFlags) -> StateFlags {
        StateFlags::from_bits_retain(self.0.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clear `flags`, returning the previous value.
    pub fn remove(&self, flags: StateFlags) -> StateFlags {
        StateFlags::from_bits_retain(self.0.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    /// Atomically mark a free slot valid, preferring `preferred`.
    ///
    /// Returns the claimed slot, or `None` when both slots are occupied.
    pub fn claim_slot(&self, preferred: Slot) -> Option<Slot> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let slot = StateFlags::from_bits_retain(current).free_slot(preferred)?;
            let next = current | slot.flag().bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(slot),
                Err(actual) => current = actual,
            }
        }
    }

    /// Clear a slot's valid bit. Returns whether it was set.
    pub fn release_slot(&self, slot: Slot) -> bool {
        self.remove(slot.flag()).contains(slot.flag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use CaptureState::*;
        assert!(Closed.can_transition_to(Configuring));
        assert!(Configuring.can_transition_to(Armed));
        assert!(Armed.can_transition_to(Streaming));
        assert!(Streaming.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Closed));

        assert!(!Closed.can_transition_to(Streaming));
        assert!(!Streaming.can_transition_to(Closed));
        assert!(!Draining.can_transition_to(Streaming));
    }

    #[test]
    fn test_atomic_state_rejects_wrong_origin() {
        let state = AtomicState::default();
        assert_eq!(
            state.transition(CaptureState::Armed, CaptureState::Streaming),
            Err(CaptureState::Closed)
        );
        assert!(state
            .transition(CaptureState::Closed, CaptureState::Configuring)
            .is_ok());
        assert_eq!(state.load(), CaptureState::Configuring);
    }

    #[test]
    fn test_claim_slots_until_overrun() {
        let flags = AtomicFlags::default();
        assert_eq!(flags.claim_slot(Slot::A), Some(Slot::A));
        assert_eq!(flags.claim_slot(Slot::A), Some(Slot::B));
        assert_eq!(flags.claim_slot(Slot::B), None);

        assert!(flags.release_slot(Slot::A));
        assert!(!flags.release_slot(Slot::A));
        assert_eq!(flags.claim_slot(Slot::B), Some(Slot::A));
    }

    #[test]
    fn test_otf_with_valid_slot_is_a_violation() {
        let ok = StateFlags::OTF_TO_NEXT_STAGE | StateFlags::LAST_CAPTURE;
        assert!(ok.validate().is_ok());

        let bad = StateFlags::OTF_TO_NEXT_STAGE | StateFlags::SLOT_B_VALID;
        assert_eq!(bad.validate(), Err(FlagViolation(bad)));
    }
}
