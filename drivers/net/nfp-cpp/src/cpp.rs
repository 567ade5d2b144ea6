//! # CPP Device Handle
//!
//! One open connection to an NFP device.
//!
//! The handle owns the transport backend, the identity the backend reported
//! (interface, serial, model), the island address-translation table read from
//! the device at open, and the per-handle cache of mutex descriptors.
//!
//! Areas and mutexes borrow the handle, so the borrow checker keeps the
//! handle alive (and un-closed) while any of them exist.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use spin::Mutex;

use crate::access::xpb;
use crate::config::CppConfig;
use crate::error::{Error, Result};
use crate::id::{target, ChipModel, InterfaceId};
use crate::mutex::MutexShared;
use crate::transport::Transport;

/// Number of entries in the island address-translation table
pub const IMB_TABLE_LEN: usize = 16;

/// Cache of mutex descriptors, keyed by `(target, address)`
pub(crate) type MutexCache = HashMap<(u8, u64), Arc<MutexShared>>;

// =============================================================================
// MU LOCALITY
// =============================================================================

/// Address-mode field of an IMB translation entry
const IMB_ADDRESS_MODE_SHIFT: u32 = 13;
const IMB_ADDRESS_MODE_MASK: u32 = 0x7;
/// 40-bit addressing enable bit of an IMB translation entry
const IMB_ADDR40: u32 = 1 << 12;

/// Bit position of the MU locality field for an IMB translation entry.
///
/// Returns `None` for address modes that have no locality field.
pub const fn mu_locality_lsb(imb_entry: u32) -> Option<u32> {
    let mode = (imb_entry >> IMB_ADDRESS_MODE_SHIFT) & IMB_ADDRESS_MODE_MASK;
    let addr40 = imb_entry & IMB_ADDR40 != 0;

    match mode {
        0..=3 => Some(if addr40 { 38 } else { 30 }),
        _ => None,
    }
}

// =============================================================================
// CPP HANDLE
// =============================================================================

/// Open CPP device handle
pub struct Cpp {
    transport: Box<dyn Transport>,
    config: CppConfig,
    model: ChipModel,
    interface: InterfaceId,
    serial: Vec<u8>,
    imb_cat_table: [u32; IMB_TABLE_LEN],
    mu_locality_lsb: Option<u32>,
    /// Driver lock for serialized backend calls
    bus_lock: Mutex<()>,
    pub(crate) mutex_cache: Mutex<MutexCache>,
    areas_live: AtomicUsize,
    areas_acquired: AtomicUsize,
    torn_down: bool,
}

impl Cpp {
    /// Open a handle over `transport`.
    ///
    /// `host` is handed to the backend's `init` without inspection. When the
    /// backend does not report a model it is read from the device, and on
    /// NFP-6000 family chips the island translation table is loaded.
    pub fn open(mut transport: Box<dyn Transport>, host: &dyn Any, config: CppConfig) -> Result<Self> {
        let identity = transport.init(host)?;

        // From here on dropping `cpp` tears the backend down.
        let mut cpp = Self {
            transport,
            config,
            model: identity.model.unwrap_or(ChipModel::INVALID),
            interface: identity.interface,
            serial: identity.serial,
            imb_cat_table: [0; IMB_TABLE_LEN],
            mu_locality_lsb: None,
            bus_lock: Mutex::new(()),
            mutex_cache: Mutex::new(HashMap::new()),
            areas_live: AtomicUsize::new(0),
            areas_acquired: AtomicUsize::new(0),
            torn_down: false,
        };

        if identity.model.is_none() {
            cpp.model = cpp.autodetect_model()?;
        }

        if cpp.model.is_nfp6000() {
            cpp.load_imb_table()?;
        }

        log::info!(
            "nfp-cpp: opened {} interface {} model {:#010x}{}",
            cpp.transport.name(),
            cpp.interface,
            cpp.model.as_raw(),
            if cpp.config.serialize { " (serialized)" } else { "" }
        );

        Ok(cpp)
    }

    /// Close the handle and tear down the backend.
    ///
    /// Areas still acquired at this point (only possible if one was leaked)
    /// are reported as an error; the backend is torn down regardless.
    pub fn close(mut self) -> Result<()> {
        let acquired = self.areas_acquired.load(Ordering::Acquire);
        let result = if acquired > 0 {
            log::error!("nfp-cpp: closing handle with {} acquired areas", acquired);
            Err(Error::AreasOutstanding { acquired })
        } else {
            Ok(())
        };

        self.shutdown();
        result
    }

    fn shutdown(&mut self) {
        if self.torn_down {
            return;
        }

        let cached = {
            let mut cache = self.mutex_cache.lock();
            let n = cache.len();
            cache.clear();
            n
        };
        if cached > 0 {
            log::warn!("nfp-cpp: dropping {} cached mutex descriptors", cached);
        }

        self.transport.teardown();
        self.torn_down = true;
        log::info!("nfp-cpp: closed {} interface {}", self.transport.name(), self.interface);
    }

    fn autodetect_model(&self) -> Result<ChipModel> {
        let reg = self.xpb_read32(xpb::device(1, 1, 16) + xpb::PL_DEVICE_ID)?;

        let mut model = reg & xpb::PL_DEVICE_MODEL_MASK;
        if model & xpb::PL_DEVICE_ID_MASK != 0 {
            model = model.wrapping_sub(0x10);
        }

        log::debug!("nfp-cpp: autodetected model {:#010x}", model);
        Ok(ChipModel::from_raw(model))
    }

    fn load_imb_table(&mut self) -> Result<()> {
        let mut table = [0u32; IMB_TABLE_LEN];
        for (tgt, entry) in table.iter_mut().enumerate() {
            *entry = self.xpb_read32(xpb::IMB_CPP_AT_BASE + (tgt as u32) * 4)?;
        }

        self.imb_cat_table = table;
        self.mu_locality_lsb = mu_locality_lsb(table[target::MU as usize]);
        Ok(())
    }

    // =========================================================================
    // Identity
    // =========================================================================

    /// Chip model
    pub fn model(&self) -> ChipModel {
        self.model
    }

    /// Interface id of this connection
    pub fn interface(&self) -> InterfaceId {
        self.interface
    }

    /// Device serial number
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    /// Island address-translation table, indexed by target id
    pub fn imb_cat_table(&self) -> &[u32; IMB_TABLE_LEN] {
        &self.imb_cat_table
    }

    /// Bit position distinguishing island-local from global MU addresses
    pub fn mu_locality_lsb(&self) -> Option<u32> {
        self.mu_locality_lsb
    }

    /// Handle configuration
    pub fn config(&self) -> &CppConfig {
        &self.config
    }

    /// Whether backend calls are serialized by the handle
    pub fn is_serialized(&self) -> bool {
        self.config.serialize
    }

    /// Backend name
    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Distinct mutex words with live handles
    pub fn cached_mutexes(&self) -> usize {
        self.mutex_cache.lock().len()
    }

    /// Areas currently allocated from this handle
    pub fn areas_live(&self) -> usize {
        self.areas_live.load(Ordering::Acquire)
    }

    /// Areas currently acquired from this handle
    pub fn areas_acquired(&self) -> usize {
        self.areas_acquired.load(Ordering::Acquire)
    }

    // =========================================================================
    // Backend dispatch
    // =========================================================================

    /// Backend, for calls the core does not serialize
    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Run a serialized backend call, under the driver lock if required
    pub(crate) fn serialized<R>(&self, f: impl FnOnce(&dyn Transport) -> R) -> R {
        let _guard = self.config.serialize.then(|| self.bus_lock.lock());
        f(self.transport.as_ref())
    }

    pub(crate) fn track_alloc(&self) {
        self.areas_live.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn track_free(&self) {
        self.areas_live.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn track_acquire(&self) {
        self.areas_acquired.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn track_release(&self) {
        self.areas_acquired.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for Cpp {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl core::fmt::Debug for Cpp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cpp")
            .field("transport", &self.transport.name())
            .field("model", &self.model)
            .field("interface", &self.interface)
            .field("serialize", &self.config.serialize)
            .field("areas_live", &self.areas_live())
            .field("areas_acquired", &self.areas_acquired())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
