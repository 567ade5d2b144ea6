//! # Simulated Device
//!
//! An in-memory CPP device and a [`Transport`] backend that talks to it.
//!
//! Memory is sparse and per target. Several [`SimTransport`]s (and so several
//! [`Cpp`] handles with different interface ids) can share one
//! [`SimDevice`], which is how cross-host mutex contention is exercised
//! without hardware. The memory unit's test-and-set-immediate action is
//! emulated atomically; every other action is a plain read or write.
//!
//! The device also counts backend calls, can be told to fail the next few of
//! them, and records when acquire, release, read or write calls overlap.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use spin::Mutex;

use crate::access::xpb;
use crate::config::{CppConfig, LockConfig};
use crate::cpp::{Cpp, IMB_TABLE_LEN};
use crate::error::{Error, Result, TransportError};
use crate::id::{action, target, ChipModel, InterfaceId, InterfaceType};
use crate::transport::{AreaPrivate, AreaWindow, Transport, TransportIdentity};

/// Model reported by [`SimDevice::nfp6000`] after autodetection
pub const SIM_MODEL: ChipModel = ChipModel::from_raw(0x6000_0000);

/// Raw device ID register of the simulated NFP-6000 (revision byte set)
const SIM_DEVICE_ID: u32 = 0x6000_0010;

/// IMB entry for the MU target: address mode 0, 40-bit addressing
const SIM_MU_IMB: u32 = 1 << 12;

const SIM_SERIAL: [u8; 6] = [0x00, 0x15, 0x4d, 0x00, 0x0c, 0x01];

// =============================================================================
// STATISTICS AND FAULTS
// =============================================================================

/// Snapshot of backend calls seen by a simulated device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    /// `init` calls
    pub inits: u64,
    /// `teardown` calls
    pub teardowns: u64,
    /// `area_init` calls
    pub area_inits: u64,
    /// `area_cleanup` calls
    pub area_cleanups: u64,
    /// `area_acquire` calls
    pub acquires: u64,
    /// `area_release` calls
    pub releases: u64,
    /// `area_read` calls
    pub reads: u64,
    /// `area_write` calls
    pub writes: u64,
    /// Acquire/release/read/write calls that started while another was
    /// still in flight
    pub overlaps: u64,
}

#[derive(Default)]
struct Counters {
    inits: AtomicU64,
    teardowns: AtomicU64,
    area_inits: AtomicU64,
    area_cleanups: AtomicU64,
    acquires: AtomicU64,
    releases: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    overlaps: AtomicU64,
}

#[derive(Default)]
struct Faults {
    init: AtomicBool,
    acquires: AtomicU32,
    releases: AtomicU32,
    reads: AtomicU32,
    writes: AtomicU32,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Consume one pending fault
fn take_fault(pending: &AtomicU32) -> bool {
    pending
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

// =============================================================================
// SIMULATED DEVICE
// =============================================================================

#[derive(Default)]
struct SimInner {
    memory: Mutex<HashMap<(u8, u64), u8>>,
    counters: Counters,
    faults: Faults,
    in_flight: AtomicU32,
    latency_ns: AtomicU64,
}

/// Marks one serialized backend call as in flight
struct InFlight<'a> {
    inner: &'a SimInner,
}

impl<'a> InFlight<'a> {
    fn enter(inner: &'a SimInner) -> Self {
        if inner.in_flight.fetch_add(1, Ordering::AcqRel) > 0 {
            bump(&inner.counters.overlaps);
        }
        let latency = inner.latency_ns.load(Ordering::Relaxed);
        if latency > 0 {
            std::thread::sleep(Duration::from_nanos(latency));
        }
        Self { inner }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Shared simulated device
#[derive(Clone, Default)]
pub struct SimDevice {
    inner: Arc<SimInner>,
}

fn load(memory: &HashMap<(u8, u64), u8>, target: u8, address: u64, buf: &mut [u8]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        let key = (target, address.wrapping_add(i as u64));
        *byte = memory.get(&key).copied().unwrap_or(0);
    }
}

fn store(memory: &mut HashMap<(u8, u64), u8>, target: u8, address: u64, buf: &[u8]) {
    for (i, &byte) in buf.iter().enumerate() {
        let key = (target, address.wrapping_add(i as u64));
        if byte == 0 {
            memory.remove(&key);
        } else {
            memory.insert(key, byte);
        }
    }
}

impl SimDevice {
    /// Blank device (all memory reads as zero, model unknown)
    pub fn new() -> Self {
        Self::default()
    }

    /// Device answering model autodetection as an NFP-6000 with 40-bit MU
    /// addressing
    pub fn nfp6000() -> Self {
        let device = Self::new();

        let id_reg = xpb::device(1, 1, 16) + xpb::PL_DEVICE_ID;
        for kind in [InterfaceType::Pci, InterfaceType::Arm] {
            let (_, address) = xpb::route(InterfaceId::new(kind, 0, 0), id_reg);
            device.poke32(target::CT_XPB, address as u64, SIM_DEVICE_ID);
        }

        let imb = xpb::IMB_CPP_AT_BASE as u64;
        debug_assert!((target::MU as usize) < IMB_TABLE_LEN);
        device.poke32(target::CT_XPB, imb + 4 * target::MU as u64, SIM_MU_IMB);

        device
    }

    /// Read raw device memory
    pub fn read_bytes(&self, target: u8, address: u64, buf: &mut [u8]) {
        load(&self.inner.memory.lock(), target, address, buf);
    }

    /// Write raw device memory
    pub fn write_bytes(&self, target: u8, address: u64, buf: &[u8]) {
        store(&mut self.inner.memory.lock(), target, address, buf);
    }

    /// Read a little-endian u32 without going through a transport
    pub fn peek32(&self, target: u8, address: u64) -> u32 {
        let mut bytes = [0u8; 4];
        self.read_bytes(target, address, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    /// Write a little-endian u32 without going through a transport
    pub fn poke32(&self, target: u8, address: u64, value: u32) {
        self.write_bytes(target, address, &value.to_le_bytes());
    }

    /// Read a little-endian u64 without going through a transport
    pub fn peek64(&self, target: u8, address: u64) -> u64 {
        let mut bytes = [0u8; 8];
        self.read_bytes(target, address, &mut bytes);
        u64::from_le_bytes(bytes)
    }

    /// Backend call counters
    pub fn stats(&self) -> SimStats {
        let c = &self.inner.counters;
        SimStats {
            inits: c.inits.load(Ordering::Relaxed),
            teardowns: c.teardowns.load(Ordering::Relaxed),
            area_inits: c.area_inits.load(Ordering::Relaxed),
            area_cleanups: c.area_cleanups.load(Ordering::Relaxed),
            acquires: c.acquires.load(Ordering::Relaxed),
            releases: c.releases.load(Ordering::Relaxed),
            reads: c.reads.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            overlaps: c.overlaps.load(Ordering::Relaxed),
        }
    }

    /// Stall every acquire, release, read and write for `latency`
    pub fn set_latency(&self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.inner.latency_ns.store(nanos, Ordering::Relaxed);
    }

    /// Fail the next transport `init`
    pub fn fail_init(&self) {
        self.inner.faults.init.store(true, Ordering::Release);
    }

    /// Fail the next `count` area acquires
    pub fn fail_acquires(&self, count: u32) {
        self.inner.faults.acquires.store(count, Ordering::Release);
    }

    /// Fail the next `count` area releases
    pub fn fail_releases(&self, count: u32) {
        self.inner.faults.releases.store(count, Ordering::Release);
    }

    /// Fail the next `count` area reads
    pub fn fail_reads(&self, count: u32) {
        self.inner.faults.reads.store(count, Ordering::Release);
    }

    /// Fail the next `count` area writes
    pub fn fail_writes(&self, count: u32) {
        self.inner.faults.writes.store(count, Ordering::Release);
    }

    /// Test-and-set-immediate: return the old word, set the state bits
    fn test_and_set(&self, target: u8, address: u64) -> u32 {
        let mut memory = self.inner.memory.lock();

        let mut bytes = [0u8; 4];
        load(&memory, target, address, &mut bytes);
        let old = u32::from_le_bytes(bytes);
        store(&mut memory, target, address, &(old | 0xf).to_le_bytes());

        old
    }
}

impl core::fmt::Debug for SimDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimDevice")
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// SIMULATED TRANSPORT
// =============================================================================

/// Per-area backend state
struct SimArea {
    acquired: bool,
}

fn sim_area(private: &mut AreaPrivate) -> Result<&mut SimArea> {
    private
        .downcast_mut::<SimArea>()
        .ok_or(Error::InvalidParameter)
}

/// Transport backend over a [`SimDevice`]
#[derive(Debug, Clone)]
pub struct SimTransport {
    device: SimDevice,
    interface: InterfaceId,
    serial: Vec<u8>,
    model: Option<ChipModel>,
}

impl SimTransport {
    /// Backend reporting `interface`; the model is left to autodetection
    pub fn new(device: &SimDevice, interface: InterfaceId) -> Self {
        Self {
            device: device.clone(),
            interface,
            serial: SIM_SERIAL.to_vec(),
            model: None,
        }
    }

    /// Report `model` at init instead of letting the core read it
    pub fn with_model(mut self, model: ChipModel) -> Self {
        self.model = Some(model);
        self
    }

    /// Report `serial` at init
    pub fn with_serial(mut self, serial: &[u8]) -> Self {
        self.serial = serial.to_vec();
        self
    }

    /// Open a handle over a new backend, with a busy-polling lock policy
    pub fn open(device: &SimDevice, interface: InterfaceId) -> Result<Cpp> {
        let config = CppConfig::default().with_lock(LockConfig::busy_poll());
        Cpp::open(Box::new(Self::new(device, interface)), &(), config)
    }

    fn enter(&self) -> InFlight<'_> {
        InFlight::enter(&self.device.inner)
    }

    fn counters(&self) -> &Counters {
        &self.device.inner.counters
    }

    fn faults(&self) -> &Faults {
        &self.device.inner.faults
    }
}

impl Transport for SimTransport {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn init(&mut self, _host: &dyn Any) -> Result<TransportIdentity> {
        bump(&self.counters().inits);
        if self.faults().init.swap(false, Ordering::AcqRel) {
            return Err(TransportError::InitFailed.into());
        }

        Ok(TransportIdentity {
            interface: self.interface,
            serial: self.serial.clone(),
            model: self.model,
        })
    }

    fn teardown(&mut self) {
        bump(&self.counters().teardowns);
    }

    fn area_init(&self, _window: &AreaWindow) -> Result<AreaPrivate> {
        bump(&self.counters().area_inits);
        Ok(Box::new(SimArea { acquired: false }))
    }

    fn area_cleanup(&self, _window: &AreaWindow, _private: &mut AreaPrivate) {
        bump(&self.counters().area_cleanups);
    }

    fn area_acquire(&self, _window: &AreaWindow, private: &mut AreaPrivate) -> Result<()> {
        bump(&self.counters().acquires);
        let _busy = self.enter();
        if take_fault(&self.faults().acquires) {
            return Err(TransportError::AcquireFailed.into());
        }
        sim_area(private)?.acquired = true;
        Ok(())
    }

    fn area_release(&self, _window: &AreaWindow, private: &mut AreaPrivate) -> Result<()> {
        bump(&self.counters().releases);
        let _busy = self.enter();
        sim_area(private)?.acquired = false;
        if take_fault(&self.faults().releases) {
            return Err(TransportError::ReleaseFailed.into());
        }
        Ok(())
    }

    fn area_read(
        &self,
        window: &AreaWindow,
        private: &mut AreaPrivate,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        bump(&self.counters().reads);
        let _busy = self.enter();
        if take_fault(&self.faults().reads) {
            return Err(TransportError::ReadFailed.into());
        }
        if !sim_area(private)?.acquired {
            return Err(Error::AreaNotAcquired);
        }

        let id = window.id;
        let address = window.address + offset;
        if id.action() == action::TEST_SET_IMM
            && id.token() == action::TEST_SET_IMM_TOKEN
            && buf.len() == 4
        {
            let old = self.device.test_and_set(id.target(), address);
            buf.copy_from_slice(&old.to_le_bytes());
        } else {
            self.device.read_bytes(id.target(), address, buf);
        }
        Ok(())
    }

    fn area_write(
        &self,
        window: &AreaWindow,
        private: &mut AreaPrivate,
        offset: u64,
        buf: &[u8],
    ) -> Result<()> {
        bump(&self.counters().writes);
        let _busy = self.enter();
        if take_fault(&self.faults().writes) {
            return Err(TransportError::WriteFailed.into());
        }
        if !sim_area(private)?.acquired {
            return Err(Error::AreaNotAcquired);
        }

        self.device
            .write_bytes(window.id.target(), window.address + offset, buf);
        Ok(())
    }
}
