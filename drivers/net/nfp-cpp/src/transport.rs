//! # Transport Contract
//!
//! The operations a bus backend provides to the CPP core.
//!
//! A backend moves bytes between host and device (over PCIe BARs, an RPC
//! bridge, a simulator, ...). The core never assumes a particular bus; it only
//! calls the methods below, and it owns the backend through the device handle
//! as a `Box<dyn Transport>`.
//!
//! ## Serialization
//!
//! | Operation                     | Serialized by the core            |
//! |-------------------------------|-----------------------------------|
//! | `init`, `teardown`            | exclusive (`&mut self`)           |
//! | `area_init`, `area_cleanup`   | never                             |
//! | `area_acquire`, `area_release`| when the handle serialization flag is set |
//! | `area_read`, `area_write`     | when the handle serialization flag is set |
//! | `area_iomem`                  | never                             |
//!
//! Backends that are not reentrant must either ask the caller to open the
//! handle with serialization enabled or synchronize internally.

use std::any::Any;
use std::ptr::NonNull;

use crate::error::Result;
use crate::id::{ChipModel, CppId, InterfaceId};

/// Backend-private state attached to each area
pub type AreaPrivate = Box<dyn Any + Send>;

// =============================================================================
// AREA WINDOW
// =============================================================================

/// The bus window an area reserves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaWindow {
    /// CPP ID the window addresses
    pub id: CppId,
    /// Base address within the target's address space
    pub address: u64,
    /// Window size in bytes
    pub size: usize,
}

impl AreaWindow {
    /// Check that `offset..offset + length` lies inside the window
    pub fn contains(&self, offset: u64, length: usize) -> bool {
        offset
            .checked_add(length as u64)
            .is_some_and(|end| end <= self.size as u64)
    }
}

// =============================================================================
// IDENTITY
// =============================================================================

/// Identity reported by a backend at init
#[derive(Debug, Clone)]
pub struct TransportIdentity {
    /// Interface id of this connection
    pub interface: InterfaceId,
    /// Device serial number
    pub serial: Vec<u8>,
    /// Chip model, when the backend already knows it.
    ///
    /// `None` makes the core read it from the device.
    pub model: Option<ChipModel>,
}

// =============================================================================
// TRANSPORT TRAIT
// =============================================================================

/// Bus backend operations
pub trait Transport: Send + Sync {
    /// Backend name for diagnostics
    fn name(&self) -> &'static str {
        "cpp-transport"
    }

    /// Bind to the host device.
    ///
    /// `host` is passed through from `Cpp::open` untouched; the backend
    /// downcasts it to whatever device handle type it expects.
    fn init(&mut self, host: &dyn Any) -> Result<TransportIdentity>;

    /// Release everything acquired by `init`.
    ///
    /// Called exactly once, when the device handle is closed or dropped.
    fn teardown(&mut self);

    /// Prepare backend state for a new area. Not serialized.
    fn area_init(&self, window: &AreaWindow) -> Result<AreaPrivate>;

    /// Tear down backend state of an area before it is freed. Not serialized.
    fn area_cleanup(&self, _window: &AreaWindow, _private: &mut AreaPrivate) {}

    /// Commit hardware resources (bus windows, BAR slots) to an area
    fn area_acquire(&self, window: &AreaWindow, private: &mut AreaPrivate) -> Result<()>;

    /// Return the hardware resources of an area
    fn area_release(&self, window: &AreaWindow, private: &mut AreaPrivate) -> Result<()>;

    /// Direct pointer to the mapped window, if the bus supports one.
    ///
    /// Only meaningful between acquire and release.
    fn area_iomem(&self, _window: &AreaWindow, _private: &AreaPrivate) -> Option<NonNull<u8>> {
        None
    }

    /// Read `buf.len()` bytes at `offset` into the window.
    ///
    /// The core guarantees the range lies inside the window.
    fn area_read(
        &self,
        window: &AreaWindow,
        private: &mut AreaPrivate,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()>;

    /// Write `buf` at `offset` into the window.
    ///
    /// The core guarantees the range lies inside the window.
    fn area_write(
        &self,
        window: &AreaWindow,
        private: &mut AreaPrivate,
        offset: u64,
        buf: &[u8],
    ) -> Result<()>;
}
