//! # NFP CPP
//!
//! Command Push/Pull (CPP) bus access for Netronome flow processors.
//!
//! Every register and memory location on the chip is reached over the CPP
//! bus, addressed by a packed [`CppId`] (target, action, token, island) plus
//! an address. This crate provides:
//!
//! - the identifier codec;
//! - [`Cpp`], a device handle over a pluggable [`Transport`] backend;
//! - [`CppArea`], reserved and acquirable windows into a target;
//! - one-shot addressed reads and writes, including XPB registers;
//! - [`CppMutex`], a lock kept in device memory and shared by every host
//!   attached to the device.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         nfp-cpp                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │  CppMutex   │  │   access    │  │        id           │  │
//! │  │ (lock word) │──▶ (read32,xpb)│  │ (CppId, InterfaceId)│  │
//! │  └─────────────┘  └──────┬──────┘  └─────────────────────┘  │
//! │                   ┌──────▼──────┐                           │
//! │                   │   CppArea   │                           │
//! │                   └──────┬──────┘                           │
//! │                   ┌──────▼──────┐                           │
//! │                   │     Cpp     │ identity, IMB table,      │
//! │                   │             │ mutex cache               │
//! │                   └──────┬──────┘                           │
//! └──────────────────────────┼──────────────────────────────────┘
//!                     ┌──────▼──────┐
//!                     │  Transport  │ PCIe, RPC, sim, ...
//!                     └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use nfp_cpp::sim::{SimDevice, SimTransport};
//! use nfp_cpp::{target, CppId, CppMutex, InterfaceId, InterfaceType};
//!
//! let device = SimDevice::nfp6000();
//! let cpp = SimTransport::open(&device, InterfaceId::new(InterfaceType::Pci, 0, 0))?;
//!
//! cpp.write32(CppId::rw(target::MU), 0x2000, 0x1234_5678)?;
//! assert_eq!(cpp.read32(CppId::rw(target::MU), 0x2000)?, 0x1234_5678);
//!
//! CppMutex::init(&cpp, target::MU, 0x1000, 0xabcd)?;
//! let mutex = CppMutex::alloc(&cpp, target::MU, 0x1000, 0xabcd)?;
//! // init leaves the lock held by this thread
//! assert_eq!(mutex.depth(), 1);
//! mutex.unlock()?;
//! mutex.lock()?;
//! mutex.unlock()?;
//! # Ok::<(), nfp_cpp::Error>(())
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod access;
pub mod area;
pub mod config;
pub mod cpp;
pub mod error;
pub mod id;
pub mod mutex;
pub mod sim;
pub mod transport;

// Re-exports for convenience
pub use access::xpb;
pub use area::{AreaState, CppArea};
pub use config::{CppConfig, LockConfig};
pub use cpp::Cpp;
pub use error::{Error, Result, TransportError};
pub use id::{action, target, ChipModel, CppId, InterfaceId, InterfaceType};
pub use mutex::{CppMutex, LockState};
pub use transport::{AreaPrivate, AreaWindow, Transport, TransportIdentity};
