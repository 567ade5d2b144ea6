//! # CPP Identifiers
//!
//! Packing of target, action, token and island into the 32-bit CPP ID, plus
//! the interface and model identifiers reported by a device.
//!
//! ```text
//!  31 30      24 23      16 15       8 7        0
//! ┌──┬──────────┬──────────┬──────────┬──────────┐
//! │ 0│  target  │  token   │  action  │  island  │
//! └──┴──────────┴──────────┴──────────┴──────────┘
//! ```

use core::fmt;

// =============================================================================
// TARGETS AND ACTIONS
// =============================================================================

/// Well-known CPP target ids
pub mod target {
    //! CPP target ids

    /// Invalid/unused target
    pub const INVALID: u8 = 0;
    /// Network Bus Interface
    pub const NBI: u8 = 1;
    /// QDR SRAM
    pub const QDR: u8 = 2;
    /// Interlaken look-aside
    pub const ILA: u8 = 6;
    /// Memory unit (internal/external memory engines)
    pub const MU: u8 = 7;
    /// PCIe island
    pub const PCIE: u8 = 9;
    /// ARM island
    pub const ARM: u8 = 10;
    /// Crypto engine
    pub const CRYPTO: u8 = 12;
    /// Island XPB (auxiliary control bus)
    pub const CT_XPB: u8 = 14;
    /// Cluster local scratch
    pub const CLS: u8 = 15;
}

/// CPP action ids
pub mod action {
    //! CPP action ids

    /// Wildcard: the action follows the direction of the access.
    ///
    /// Prefer it even for read-only or write-only ids, the transport can then
    /// share one bus window for both directions.
    pub const RW: u8 = 32;

    /// MU atomic engine: 32-bit atomic read
    pub const ATOMIC_READ: u8 = 3;
    /// MU atomic engine: 32-bit atomic write
    pub const ATOMIC_WRITE: u8 = 4;
    /// MU atomic engine: test-and-set immediate with readback
    pub const TEST_SET_IMM: u8 = 5;
    /// Token selecting the readback flavour of [`TEST_SET_IMM`]
    pub const TEST_SET_IMM_TOKEN: u8 = 3;
}

/// Width mask of the target field
pub const TARGET_MASK: u8 = 0x7f;

// =============================================================================
// CPP ID
// =============================================================================

/// Packed 32-bit CPP identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CppId(u32);

impl CppId {
    /// Pack target, action and token (island 0)
    pub const fn new(target: u8, action: u8, token: u8) -> Self {
        Self::with_island(target, action, token, 0)
    }

    /// Pack target, action, token and island
    pub const fn with_island(target: u8, action: u8, token: u8, island: u8) -> Self {
        Self(
            ((target & TARGET_MASK) as u32) << 24
                | (token as u32) << 16
                | (action as u32) << 8
                | island as u32,
        )
    }

    /// Read-or-write id for a target
    pub const fn rw(target: u8) -> Self {
        Self::new(target, action::RW, 0)
    }

    /// Wrap a raw value
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw packed value
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Target field
    pub const fn target(self) -> u8 {
        ((self.0 >> 24) as u8) & TARGET_MASK
    }

    /// Token field
    pub const fn token(self) -> u8 {
        (self.0 >> 16) as u8
    }

    /// Action field
    pub const fn action(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Island field
    pub const fn island(self) -> u8 {
        self.0 as u8
    }

    /// Same id, different island
    pub const fn on_island(self, island: u8) -> Self {
        Self((self.0 & !0xff) | island as u32)
    }
}

impl fmt::Debug for CppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CppId")
            .field("target", &self.target())
            .field("action", &self.action())
            .field("token", &self.token())
            .field("island", &self.island())
            .finish()
    }
}

impl fmt::Display for CppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}@{}",
            self.target(),
            self.action(),
            self.token(),
            self.island()
        )
    }
}

// =============================================================================
// INTERFACE ID
// =============================================================================

/// Logical interface type of a CPP connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InterfaceType {
    /// Not a valid interface
    Invalid = 0x0,
    /// Host over PCIe
    Pci     = 0x1,
    /// On-chip ARM
    Arm     = 0x2,
    /// Remote procedure call bridge
    Rpc     = 0x3,
    /// Interlaken look-aside
    Ila     = 0x4,
}

impl InterfaceType {
    /// Decode a 4-bit type field
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(Self::Invalid),
            0x1 => Some(Self::Pci),
            0x2 => Some(Self::Arm),
            0x3 => Some(Self::Rpc),
            0x4 => Some(Self::Ila),
            _ => None,
        }
    }
}

/// 16-bit interface id: 4 bits type, 4 bits unit, 8 bits channel.
///
/// Limited to 16 bits so it fits the owner half of a mutex lock word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct InterfaceId(u16);

impl InterfaceId {
    /// Build from type, unit and channel
    pub const fn new(kind: InterfaceType, unit: u8, channel: u8) -> Self {
        Self(((kind as u16) & 0xf) << 12 | ((unit as u16) & 0xf) << 8 | channel as u16)
    }

    /// Wrap a raw value
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Raw value
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    /// Raw 4-bit type field
    pub const fn type_bits(self) -> u8 {
        ((self.0 >> 12) & 0xf) as u8
    }

    /// Decoded interface type, if known
    pub const fn kind(self) -> Option<InterfaceType> {
        InterfaceType::from_bits(self.type_bits())
    }

    /// Unit field
    pub const fn unit(self) -> u8 {
        ((self.0 >> 8) & 0xf) as u8
    }

    /// Channel field
    pub const fn channel(self) -> u8 {
        self.0 as u8
    }
}

impl fmt::Debug for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InterfaceId({:#06x})", self.0)
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

// =============================================================================
// CHIP MODEL
// =============================================================================

/// NFP chip model id
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ChipModel(u32);

impl ChipModel {
    /// Model could not be determined
    pub const INVALID: Self = Self(0xffff_ffff);

    /// Wrap a raw value
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw value
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// 16-bit BCD+A-F chip id
    pub const fn chip(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// NFP-6000 family (NFP-4000 counts as a variant)
    pub const fn is_nfp6000(self) -> bool {
        let chip = self.chip();
        chip >= 0x3800 && chip < 0x7000
    }

    /// Check for a usable model
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for ChipModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChipModel({:#010x})", self.0)
    }
}

// =============================================================================
// TESTS
// =============================================================================
