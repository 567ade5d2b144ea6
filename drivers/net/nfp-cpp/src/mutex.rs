//! # Device Mutex
//!
//! A lock whose state lives in a 64-bit word in device memory, so that
//! independent hosts attached to the same device can exclude each other.
//!
//! ## Word layout
//!
//! ```text
//!  addr+0 (lock word)                 addr+4
//! ┌───────────────────┬─────────────┬──────────────────────┐
//! │ owner interface   │ state       │ key                  │
//! │ 31..16            │ 15..0       │ 31..0                │
//! └───────────────────┴─────────────┴──────────────────────┘
//!  state: 0x0000 unlocked, 0x000f locked
//! ```
//!
//! Acquisition uses the memory unit's test-and-set-immediate engine, which
//! returns the old word and sets the low state bits in one bus transaction.
//! Whoever observes an unlocked old value owns the lock and then stamps its
//! interface id into the owner half.
//!
//! A lock left held by a crashed owner stays held. There is no lease or
//! stealing mechanism; recovery has to happen above this layer.

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use spin::Mutex;
use static_assertions::{const_assert, const_assert_eq};

use crate::cpp::Cpp;
use crate::error::{Error, Result};
use crate::id::{action, CppId, InterfaceId, TARGET_MASK};

/// Size of the on-device mutex word
pub const MUTEX_WORD_BYTES: u64 = 8;
/// Offset of the key within the mutex word
pub const KEY_OFFSET: u64 = 4;
/// Maximum local recursion depth
pub const MAX_DEPTH: u16 = 0xffff;

const STATE_MASK: u32 = 0xffff;
const STATE_UNLOCKED: u32 = 0x0000;
const STATE_LOCKED: u32 = 0x000f;

const_assert_eq!(MUTEX_WORD_BYTES, 8);
const_assert!(KEY_OFFSET + 4 <= MUTEX_WORD_BYTES);
const_assert_eq!(locked_by(InterfaceId::from_raw(0xffff)) >> 16, 0xffff);
const_assert_eq!(locked_by(InterfaceId::from_raw(0xffff)) & STATE_MASK, STATE_LOCKED);

/// Lock word value for `interface` holding the lock
pub const fn locked_by(interface: InterfaceId) -> u32 {
    (interface.as_raw() as u32) << 16 | STATE_LOCKED
}

fn read_id(target: u8) -> CppId {
    CppId::new(target, action::ATOMIC_READ, 0)
}

fn write_id(target: u8) -> CppId {
    CppId::new(target, action::ATOMIC_WRITE, 0)
}

fn test_set_id(target: u8) -> CppId {
    CppId::new(target, action::TEST_SET_IMM, action::TEST_SET_IMM_TOKEN)
}

fn validate(target: u8, address: u64) -> Result<()> {
    if target == 0 || target > TARGET_MASK {
        return Err(Error::InvalidParameter);
    }
    if address % MUTEX_WORD_BYTES != 0 {
        return Err(Error::Misaligned {
            offset: address,
            align: MUTEX_WORD_BYTES as u32,
        });
    }
    Ok(())
}

// =============================================================================
// LOCK STATE
// =============================================================================

/// Decoded lock word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Nobody holds the lock
    Unlocked,
    /// Held by the given interface
    LockedBy(InterfaceId),
}

impl LockState {
    /// Decode a raw lock word
    pub fn from_word(value: u32) -> Result<Self> {
        match value & STATE_MASK {
            STATE_UNLOCKED => Ok(Self::Unlocked),
            STATE_LOCKED => Ok(Self::LockedBy(InterfaceId::from_raw((value >> 16) as u16))),
            _ => Err(Error::CorruptLock { value }),
        }
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

/// Local holder of a mutex within this process
struct LocalHold {
    owner: Option<ThreadId>,
    depth: u16,
}

/// Per-word state shared by every handle allocated from one `Cpp`
pub(crate) struct MutexShared {
    target: u8,
    address: u64,
    key: u32,
    hold: Mutex<LocalHold>,
}

impl MutexShared {
    fn new(target: u8, address: u64, key: u32) -> Self {
        Self {
            target,
            address,
            key,
            hold: Mutex::new(LocalHold {
                owner: None,
                depth: 0,
            }),
        }
    }
}

// =============================================================================
// MUTEX HANDLE
// =============================================================================

/// Handle to a device mutex
pub struct CppMutex<'cpp> {
    cpp: &'cpp Cpp,
    shared: Arc<MutexShared>,
}

impl<'cpp> CppMutex<'cpp> {
    /// Create the mutex word, locked by this interface.
    ///
    /// Provisioning only: must not race with any lock attempt on the same
    /// word. The calling thread holds the lock afterwards; finish
    /// provisioning with [`CppMutex::unlock`] on a handle from
    /// [`CppMutex::alloc`] on the same `cpp`, from the same thread.
    pub fn init(cpp: &Cpp, target: u8, address: u64, key: u32) -> Result<()> {
        validate(target, address)?;

        // Any cached state describes the previous provisioning.
        cpp.mutex_cache.lock().remove(&(target, address));

        let muw = write_id(target);
        cpp.write32(muw, address + KEY_OFFSET, key)?;
        cpp.write32(muw, address, locked_by(cpp.interface()))?;

        let shared = MutexShared::new(target, address, key);
        *shared.hold.lock() = LocalHold {
            owner: Some(thread::current().id()),
            depth: 1,
        };
        cpp.mutex_cache
            .lock()
            .insert((target, address), Arc::new(shared));

        log::debug!(
            "nfp-cpp: initialized mutex {}@{:#x} key {:#010x}",
            target,
            address,
            key
        );
        Ok(())
    }

    /// Attach to an existing mutex word.
    ///
    /// Fails with [`Error::KeyMismatch`] when the stored key differs. Handles
    /// for the same word allocated from one `Cpp` share their local state.
    pub fn alloc(cpp: &'cpp Cpp, target: u8, address: u64, key: u32) -> Result<Self> {
        validate(target, address)?;

        if let Some(shared) = cpp.mutex_cache.lock().get(&(target, address)) {
            if shared.key != key {
                return Err(Error::KeyMismatch {
                    expected: key,
                    found: shared.key,
                });
            }
            return Ok(Self {
                cpp,
                shared: Arc::clone(shared),
            });
        }

        let found = cpp.read32(read_id(target), address + KEY_OFFSET)?;
        if found != key {
            return Err(Error::KeyMismatch {
                expected: key,
                found,
            });
        }

        let shared = Arc::clone(
            cpp.mutex_cache
                .lock()
                .entry((target, address))
                .or_insert_with(|| Arc::new(MutexShared::new(target, address, key))),
        );
        if shared.key != key {
            return Err(Error::KeyMismatch {
                expected: key,
                found: shared.key,
            });
        }

        log::debug!(
            "nfp-cpp: allocated mutex {}@{:#x} key {:#010x}",
            target,
            address,
            key
        );
        Ok(Self { cpp, shared })
    }

    /// Drop the local handle. The device word is not touched.
    pub fn free(self) {}

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Owning device handle
    pub fn cpp(&self) -> &'cpp Cpp {
        self.cpp
    }

    /// Target id
    pub fn target(&self) -> u8 {
        self.shared.target
    }

    /// Device address of the mutex word
    pub fn address(&self) -> u64 {
        self.shared.address
    }

    /// Key
    pub fn key(&self) -> u32 {
        self.shared.key
    }

    /// Local recursion depth (0 when not held by this process)
    pub fn depth(&self) -> u16 {
        self.shared.hold.lock().depth
    }

    /// Read the current state of the device word
    pub fn state(&self) -> Result<LockState> {
        let value = self
            .cpp
            .read32(read_id(self.shared.target), self.shared.address)?;
        LockState::from_word(value)
    }

    fn check_key(&self) -> Result<()> {
        let s = &self.shared;
        let found = self.cpp.read32(read_id(s.target), s.address + KEY_OFFSET)?;
        if found != s.key {
            return Err(Error::KeyMismatch {
                expected: s.key,
                found,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Locking
    // =========================================================================

    /// Single acquisition attempt.
    ///
    /// Returns [`Error::WouldBlock`] if the word is locked by anyone, this
    /// interface included, unless the calling thread is the local holder.
    /// Re-locking from the holding thread nests.
    pub fn trylock(&self) -> Result<()> {
        let s = &self.shared;
        let me = thread::current().id();
        let mut hold = s.hold.lock();

        match hold.owner {
            Some(owner) if owner == me => {
                if hold.depth == MAX_DEPTH {
                    return Err(Error::DepthOverflow);
                }
                hold.depth += 1;
                return Ok(());
            },
            Some(_) => return Err(Error::WouldBlock),
            None => {},
        }

        self.check_key()?;

        let interface = self.cpp.interface();
        let old = self.cpp.read32(test_set_id(s.target), s.address)?;

        match LockState::from_word(old)? {
            LockState::Unlocked => {
                let muw = write_id(s.target);
                if let Err(e) = self.cpp.write32(muw, s.address, locked_by(interface)) {
                    // Undo the test-and-set so the word is not left ownerless.
                    if let Err(restore) = self.cpp.write32(muw, s.address, old) {
                        log::error!("nfp-cpp: {} left at {:#010x}: {}", self, old | STATE_LOCKED, restore);
                    }
                    return Err(e);
                }
            },
            LockState::LockedBy(_) => return Err(Error::WouldBlock),
        }

        hold.owner = Some(me);
        hold.depth = 1;
        Ok(())
    }

    /// Block until the lock is acquired
    pub fn lock(&self) -> Result<()> {
        self.lock_until(None, None)
    }

    /// Block until the lock is acquired or `timeout` elapses
    pub fn lock_timeout(&self, timeout: Duration) -> Result<()> {
        self.lock_until(Instant::now().checked_add(timeout), None)
    }

    /// Retry [`CppMutex::trylock`] until it succeeds, `deadline` passes or
    /// `cancel` is set.
    ///
    /// Only contention is retried; any other error is returned at once. On
    /// timeout or cancellation the device word is left as it was.
    pub fn lock_until(&self, deadline: Option<Instant>, cancel: Option<&AtomicBool>) -> Result<()> {
        let config = &self.cpp.config().lock;
        let start = Instant::now();
        let mut next_warn = start.checked_add(config.warn_after);
        let mut backoff = config.initial_backoff;

        loop {
            match self.trylock() {
                Err(e) if e.is_contention() => {},
                result => return result,
            }

            if cancel.is_some_and(|c| c.load(Ordering::Acquire)) {
                return Err(Error::Cancelled);
            }

            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return Err(Error::Timeout);
            }

            if next_warn.is_some_and(|w| now >= w) {
                log::warn!(
                    "nfp-cpp: waited {}s for {}",
                    now.duration_since(start).as_secs(),
                    self
                );
                next_warn = now.checked_add(config.warn_interval);
            }

            if backoff.is_zero() {
                core::hint::spin_loop();
            } else {
                let pause = deadline.map_or(backoff, |d| backoff.min(d.saturating_duration_since(now)));
                thread::sleep(pause);
            }
            backoff = backoff.saturating_mul(2).min(config.max_backoff);
        }
    }

    /// Release the lock.
    ///
    /// Only the thread holding the lock locally may unlock; anyone else gets
    /// [`Error::NotOwner`] without any device access. Nested holds only drop
    /// a level. The device word is cleared only if it still names this
    /// interface as owner; otherwise the word is left alone.
    pub fn unlock(&self) -> Result<()> {
        let s = &self.shared;
        let me = thread::current().id();
        let mut hold = s.hold.lock();

        let interface = self.cpp.interface();
        match hold.owner {
            Some(owner) if owner != me => {
                return Err(Error::NotOwner {
                    owner: Some(interface),
                });
            },
            Some(_) if hold.depth > 1 => {
                hold.depth -= 1;
                return Ok(());
            },
            Some(_) => {},
            None => return Err(Error::NotOwner { owner: None }),
        }

        self.check_key()?;

        let value = self.cpp.read32(read_id(s.target), s.address)?;
        if value != locked_by(interface) {
            let owner = match LockState::from_word(value) {
                Ok(LockState::LockedBy(owner)) => Some(owner),
                _ => None,
            };
            return Err(Error::NotOwner { owner });
        }

        self.cpp.write32(write_id(s.target), s.address, 0)?;

        hold.owner = None;
        hold.depth = 0;
        Ok(())
    }
}

impl Drop for CppMutex<'_> {
    fn drop(&mut self) {
        let key = (self.shared.target, self.shared.address);
        let mut cache = self.cpp.mutex_cache.lock();

        let last = cache
            .get(&key)
            .is_some_and(|cached| Arc::ptr_eq(cached, &self.shared))
            && Arc::strong_count(&self.shared) == 2;
        if !last {
            return;
        }

        // A held lock keeps its local state so a later handle can unlock it.
        if self.shared.hold.lock().owner.is_some() {
            log::warn!("nfp-cpp: freeing {} while locked", self);
        } else {
            cache.remove(&key);
        }
    }
}

impl fmt::Display for CppMutex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mutex {}@{:#x}", self.shared.target, self.shared.address)
    }
}

impl fmt::Debug for CppMutex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CppMutex")
            .field("target", &self.shared.target)
            .field("address", &format_args!("{:#x}", self.shared.address))
            .field("key", &format_args!("{:#010x}", self.shared.key))
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CppConfig, LockConfig};
    use crate::error::TransportError;
    use crate::id::{target, InterfaceType};
    use crate::sim::{SimDevice, SimTransport};

    const TARGET: u8 = 4;
    const ADDR: u64 = 0x1000;
    const KEY: u32 = 0xABCD;

    fn pci(channel: u8) -> InterfaceId {
        InterfaceId::new(InterfaceType::Pci, 0, channel)
    }

    fn open(device: &SimDevice, channel: u8) -> Cpp {
        SimTransport::open(device, pci(channel)).unwrap()
    }

    /// Provisioned, unlocked word
    fn provisioned() -> SimDevice {
        let device = SimDevice::nfp6000();
        device.poke32(TARGET, ADDR + KEY_OFFSET, KEY);
        device
    }

    #[test]
    fn test_lock_state_decode() {
        assert_eq!(LockState::from_word(0), Ok(LockState::Unlocked));
        assert_eq!(
            LockState::from_word(0x1000_000f),
            Ok(LockState::LockedBy(InterfaceId::from_raw(0x1000)))
        );
        assert_eq!(
            LockState::from_word(0x1000_0003),
            Err(Error::CorruptLock { value: 0x1000_0003 })
        );
    }

    #[test]
    fn test_init_then_alloc() {
        let device = SimDevice::nfp6000();
        let cpp = open(&device, 0);

        CppMutex::init(&cpp, TARGET, ADDR, KEY).unwrap();
        assert_eq!(device.peek32(TARGET, ADDR), locked_by(cpp.interface()));
        assert_eq!(device.peek32(TARGET, ADDR + KEY_OFFSET), KEY);

        let mutex = CppMutex::alloc(&cpp, TARGET, ADDR, KEY).unwrap();
        assert_eq!(mutex.state(), Ok(LockState::LockedBy(cpp.interface())));
        assert_eq!(mutex.key(), KEY);

        assert_eq!(
            CppMutex::alloc(&cpp, TARGET, ADDR, 0x1234).unwrap_err(),
            Error::KeyMismatch {
                expected: 0x1234,
                found: KEY
            }
        );
    }

    #[test]
    fn test_alloc_key_mismatch_uncached() {
        let device = provisioned();
        let cpp = open(&device, 0);

        assert_eq!(
            CppMutex::alloc(&cpp, TARGET, ADDR, 0x1234).unwrap_err(),
            Error::KeyMismatch {
                expected: 0x1234,
                found: KEY
            }
        );
        assert_eq!(cpp.cached_mutexes(), 0);
    }

    #[test]
    fn test_alloc_validation() {
        let device = provisioned();
        let cpp = open(&device, 0);

        assert_eq!(
            CppMutex::alloc(&cpp, TARGET, ADDR + 4, KEY).unwrap_err(),
            Error::Misaligned {
                offset: ADDR + 4,
                align: 8
            }
        );
        assert_eq!(
            CppMutex::alloc(&cpp, target::INVALID, ADDR, KEY).unwrap_err(),
            Error::InvalidParameter
        );
        assert_eq!(
            CppMutex::init(&cpp, 0x80, ADDR, KEY).unwrap_err(),
            Error::InvalidParameter
        );
    }

    #[test]
    fn test_alloc_shares_cached_state() {
        let device = provisioned();
        let cpp = open(&device, 0);

        let a = CppMutex::alloc(&cpp, TARGET, ADDR, KEY).unwrap();
        let reads = device.stats().reads;
        let b = CppMutex::alloc(&cpp, TARGET, ADDR, KEY).unwrap();
        assert_eq!(device.stats().reads, reads);
        assert_eq!(cpp.cached_mutexes(), 1);

        a.lock().unwrap();
        assert_eq!(b.depth(), 1);
        a.unlock().unwrap();

        drop(a);
        assert_eq!(cpp.cached_mutexes(), 1);
        b.free();
        assert_eq!(cpp.cached_mutexes(), 0);
    }

    #[test]
    fn test_lock_unlock() {
        let device = provisioned();
        let cpp = open(&device, 3);
        let mutex = CppMutex::alloc(&cpp, TARGET, ADDR, KEY).unwrap();

        mutex.lock().unwrap();
        assert_eq!(device.peek32(TARGET, ADDR), 0x1003_000f);
        assert_eq!(mutex.depth(), 1);

        mutex.unlock().unwrap();
        assert_eq!(device.peek32(TARGET, ADDR), 0);
        assert_eq!(mutex.depth(), 0);
        assert_eq!(device.peek32(TARGET, ADDR + KEY_OFFSET), KEY);
    }

    #[test]
    fn test_provisioned_lock_released_by_owner() {
        let device = SimDevice::nfp6000();
        let cpp = open(&device, 0);

        CppMutex::init(&cpp, TARGET, ADDR, KEY).unwrap();
        let mutex = CppMutex::alloc(&cpp, TARGET, ADDR, KEY).unwrap();
        assert_eq!(mutex.depth(), 1);
        mutex.unlock().unwrap();
        assert_eq!(mutex.state(), Ok(LockState::Unlocked));
        assert_eq!(mutex.depth(), 0);
    }

    #[test]
    fn test_provisioned_lock_kept_from_peer() {
        let device = SimDevice::nfp6000();
        let cpp = open(&device, 0);
        let peer = open(&device, 0);

        CppMutex::init(&cpp, TARGET, ADDR, KEY).unwrap();
        let word = device.peek32(TARGET, ADDR);

        let other = CppMutex::alloc(&peer, TARGET, ADDR, KEY).unwrap();
        assert_eq!(other.trylock(), Err(Error::WouldBlock));
        assert_eq!(other.unlock(), Err(Error::NotOwner { owner: None }));
        assert_eq!(device.peek32(TARGET, ADDR), word);

        // another thread of the provisioning handle is not the holder either
        let mutex = CppMutex::alloc(&cpp, TARGET, ADDR, KEY).unwrap();
        thread::scope(|s| {
            s.spawn(|| assert!(matches!(mutex.unlock(), Err(Error::NotOwner { .. }))));
        });
        assert_eq!(device.peek32(TARGET, ADDR), word);

        mutex.unlock().unwrap();
        other.trylock().unwrap();
    }

    #[test]
    fn test_reinit_refreshes_cached_key() {
        let device = SimDevice::nfp6000();
        let cpp = open(&device, 0);

        CppMutex::init(&cpp, TARGET, ADDR, KEY).unwrap();
        let stale = CppMutex::alloc(&cpp, TARGET, ADDR, KEY).unwrap();

        CppMutex::init(&cpp, TARGET, ADDR, 0x5678).unwrap();
        let mutex = CppMutex::alloc(&cpp, TARGET, ADDR, 0x5678).unwrap();
        assert_eq!(mutex.key(), 0x5678);
        assert_eq!(
            CppMutex::alloc(&cpp, TARGET, ADDR, KEY).unwrap_err(),
            Error::KeyMismatch {
                expected: KEY,
                found: 0x5678
            }
        );

        drop(stale);
        assert_eq!(cpp.cached_mutexes(), 1);
        mutex.unlock().unwrap();
        assert_eq!(device.peek32(TARGET, ADDR), 0);
    }

    #[test]
    fn test_free_while_locked_keeps_hold() {
        let device = provisioned();
        let cpp = open(&device, 0);

        let mutex = CppMutex::alloc(&cpp, TARGET, ADDR, KEY).unwrap();
        mutex.lock().unwrap();
        mutex.free();
        assert_eq!(cpp.cached_mutexes(), 1);

        let mutex = CppMutex::alloc(&cpp, TARGET, ADDR, KEY).unwrap();
        assert_eq!(mutex.depth(), 1);
        mutex.unlock().unwrap();
        mutex.free();
        assert_eq!(cpp.cached_mutexes(), 0);
        assert_eq!(device.peek32(TARGET, ADDR), 0);
    }

    #[test]
    fn test_trylock_locked_by_other() {
        let device = provisioned();
        let cpp_a = open(&device, 1);
        let cpp_b = open(&device, 2);

        let a = CppMutex::alloc(&cpp_a, TARGET, ADDR, KEY).unwrap();
        let b = CppMutex::alloc(&cpp_b, TARGET, ADDR, KEY).unwrap();

        a.lock().unwrap();
        let writes = device.stats().writes;
        assert_eq!(b.trylock(), Err(Error::WouldBlock));
        assert_eq!(device.stats().writes, writes);
        assert_eq!(b.depth(), 0);
        assert_eq!(device.peek32(TARGET, ADDR), locked_by(cpp_a.interface()));

        a.unlock().unwrap();
        b.trylock().unwrap();
        assert_eq!(b.state(), Ok(LockState::LockedBy(cpp_b.interface())));
    }

    #[test]
    fn test_unlock_not_owner_leaves_word() {
        let device = provisioned();
        let cpp_a = open(&device, 1);
        let cpp_b = open(&device, 2);

        let a = CppMutex::alloc(&cpp_a, TARGET, ADDR, KEY).unwrap();
        let b = CppMutex::alloc(&cpp_b, TARGET, ADDR, KEY).unwrap();

        assert_eq!(b.unlock(), Err(Error::NotOwner { owner: None }));
        assert_eq!(device.peek32(TARGET, ADDR), 0);

        a.lock().unwrap();
        let word = device.peek32(TARGET, ADDR);
        let before = device.stats();
        assert_eq!(b.unlock(), Err(Error::NotOwner { owner: None }));
        assert_eq!(device.peek32(TARGET, ADDR), word);
        assert_eq!(device.stats().reads, before.reads);
        assert_eq!(device.stats().writes, before.writes);
    }

    #[test]
    fn test_same_interface_handles_exclude() {
        let device = provisioned();
        let cpp_a = open(&device, 1);
        let cpp_b = open(&device, 1);
        assert_eq!(cpp_a.interface(), cpp_b.interface());

        let a = CppMutex::alloc(&cpp_a, TARGET, ADDR, KEY).unwrap();
        let b = CppMutex::alloc(&cpp_b, TARGET, ADDR, KEY).unwrap();

        a.lock().unwrap();
        let word = device.peek32(TARGET, ADDR);
        assert_eq!(b.trylock(), Err(Error::WouldBlock));
        assert_eq!(b.depth(), 0);

        assert_eq!(b.unlock(), Err(Error::NotOwner { owner: None }));
        assert_eq!(device.peek32(TARGET, ADDR), word);
        assert_eq!(a.depth(), 1);

        a.unlock().unwrap();
        b.trylock().unwrap();
        assert_eq!(a.trylock(), Err(Error::WouldBlock));
        b.unlock().unwrap();
        assert_eq!(device.peek32(TARGET, ADDR), 0);
    }

    #[test]
    fn test_owner_stamp_failure_restores_word() {
        let device = provisioned();
        let cpp_a = open(&device, 1);
        let cpp_b = open(&device, 2);

        let a = CppMutex::alloc(&cpp_a, TARGET, ADDR, KEY).unwrap();
        let b = CppMutex::alloc(&cpp_b, TARGET, ADDR, KEY).unwrap();

        device.fail_writes(1);
        assert_eq!(
            a.trylock(),
            Err(Error::Transport(TransportError::WriteFailed))
        );
        assert_eq!(device.peek32(TARGET, ADDR), 0);
        assert_eq!(a.depth(), 0);

        b.trylock().unwrap();
        assert_eq!(b.state(), Ok(LockState::LockedBy(cpp_b.interface())));
        b.unlock().unwrap();
        a.trylock().unwrap();
    }

    #[test]
    fn test_recursive_lock() {
        let device = provisioned();
        let cpp = open(&device, 0);
        let mutex = CppMutex::alloc(&cpp, TARGET, ADDR, KEY).unwrap();

        mutex.lock().unwrap();
        mutex.lock().unwrap();
        mutex.trylock().unwrap();
        assert_eq!(mutex.depth(), 3);

        mutex.unlock().unwrap();
        mutex.unlock().unwrap();
        assert_ne!(device.peek32(TARGET, ADDR), 0);
        mutex.unlock().unwrap();
        assert_eq!(device.peek32(TARGET, ADDR), 0);
    }

    #[test]
    fn test_depth_overflow() {
        let device = provisioned();
        let cpp = open(&device, 0);
        let mutex = CppMutex::alloc(&cpp, TARGET, ADDR, KEY).unwrap();

        for _ in 0..MAX_DEPTH {
            mutex.trylock().unwrap();
        }
        assert_eq!(mutex.depth(), MAX_DEPTH);
        assert_eq!(mutex.trylock(), Err(Error::DepthOverflow));
    }

    #[test]
    fn test_corrupt_word() {
        let device = provisioned();
        device.poke32(TARGET, ADDR, 0x0000_0003);
        let cpp = open(&device, 0);
        let mutex = CppMutex::alloc(&cpp, TARGET, ADDR, KEY).unwrap();

        assert_eq!(mutex.trylock(), Err(Error::CorruptLock { value: 3 }));
        assert_eq!(mutex.depth(), 0);

        // test-and-set left the state bits set with no owner
        assert_eq!(device.peek32(TARGET, ADDR), 0xf);
        assert_eq!(mutex.trylock(), Err(Error::WouldBlock));
    }

    #[test]
    fn test_key_changed_underneath() {
        let device = provisioned();
        let cpp = open(&device, 0);
        let mutex = CppMutex::alloc(&cpp, TARGET, ADDR, KEY).unwrap();

        device.poke32(TARGET, ADDR + KEY_OFFSET, 0x5555);
        assert_eq!(
            mutex.trylock(),
            Err(Error::KeyMismatch {
                expected: KEY,
                found: 0x5555
            })
        );
        assert_eq!(device.peek32(TARGET, ADDR), 0);
    }

    #[test]
    fn test_lock_timeout() {
        let device = provisioned();
        let cpp_a = open(&device, 1);
        let cpp_b = open(&device, 2);

        let a = CppMutex::alloc(&cpp_a, TARGET, ADDR, KEY).unwrap();
        let b = CppMutex::alloc(&cpp_b, TARGET, ADDR, KEY).unwrap();
        a.lock().unwrap();

        let word = device.peek32(TARGET, ADDR);
        assert_eq!(
            b.lock_timeout(Duration::from_millis(20)),
            Err(Error::Timeout)
        );
        assert_eq!(device.peek32(TARGET, ADDR), word);
    }

    #[test]
    fn test_lock_wait_with_extreme_config() {
        let device = provisioned();
        let config = CppConfig::default().with_lock(LockConfig {
            warn_after: Duration::ZERO,
            warn_interval: Duration::MAX,
            initial_backoff: Duration::from_micros(1),
            max_backoff: Duration::MAX,
        });
        let cpp_a = open(&device, 1);
        let cpp_b = Cpp::open(Box::new(SimTransport::new(&device, pci(2))), &(), config).unwrap();

        let a = CppMutex::alloc(&cpp_a, TARGET, ADDR, KEY).unwrap();
        let b = CppMutex::alloc(&cpp_b, TARGET, ADDR, KEY).unwrap();
        a.lock().unwrap();

        assert_eq!(
            b.lock_timeout(Duration::from_millis(20)),
            Err(Error::Timeout)
        );

        let start = Instant::now();
        assert_eq!(
            b.lock_until(Some(start + Duration::from_millis(5)), None),
            Err(Error::Timeout)
        );
        assert!(start.elapsed() < Duration::from_secs(5));

        let config = CppConfig::default().with_lock(LockConfig {
            warn_after: Duration::MAX,
            ..LockConfig::busy_poll()
        });
        let cpp_c = Cpp::open(Box::new(SimTransport::new(&device, pci(3))), &(), config).unwrap();
        let c = CppMutex::alloc(&cpp_c, TARGET, ADDR, KEY).unwrap();
        assert_eq!(
            c.lock_timeout(Duration::from_millis(5)),
            Err(Error::Timeout)
        );
    }

    #[test]
    fn test_lock_cancelled() {
        let device = provisioned();
        let cpp_a = open(&device, 1);
        let cpp_b = open(&device, 2);

        let a = CppMutex::alloc(&cpp_a, TARGET, ADDR, KEY).unwrap();
        let b = CppMutex::alloc(&cpp_b, TARGET, ADDR, KEY).unwrap();
        a.lock().unwrap();

        let cancel = AtomicBool::new(true);
        assert_eq!(b.lock_until(None, Some(&cancel)), Err(Error::Cancelled));
    }

    #[test]
    fn test_lock_returns_backend_fault() {
        let device = provisioned();
        let cpp = open(&device, 0);
        let mutex = CppMutex::alloc(&cpp, TARGET, ADDR, KEY).unwrap();

        device.fail_reads(1);
        assert_eq!(
            mutex.lock(),
            Err(Error::Transport(TransportError::ReadFailed))
        );
        assert_eq!(mutex.depth(), 0);
    }

    #[test]
    fn test_local_threads_contend() {
        let device = provisioned();
        let cpp = open(&device, 0);
        let mutex = CppMutex::alloc(&cpp, TARGET, ADDR, KEY).unwrap();

        mutex.lock().unwrap();
        thread::scope(|s| {
            s.spawn(|| {
                assert_eq!(mutex.trylock(), Err(Error::WouldBlock));
                assert!(matches!(mutex.unlock(), Err(Error::NotOwner { .. })));
            });
        });
        assert_eq!(mutex.depth(), 1);
        mutex.unlock().unwrap();
    }

    #[test]
    fn test_mutual_exclusion_across_handles() {
        const ROUNDS: usize = 200;

        let device = provisioned();
        let config = CppConfig::default().with_lock(LockConfig::busy_poll());
        let open_with = |channel| {
            let transport = SimTransport::new(&device, pci(channel));
            Cpp::open(Box::new(transport), &(), config.clone()).unwrap()
        };
        let cpp_a = open_with(1);
        let cpp_b = open_with(2);

        let inside = AtomicBool::new(false);
        let counter = std::sync::atomic::AtomicUsize::new(0);

        thread::scope(|s| {
            for cpp in [&cpp_a, &cpp_b] {
                let inside = &inside;
                let counter = &counter;
                s.spawn(move || {
                    let mutex = CppMutex::alloc(cpp, TARGET, ADDR, KEY).unwrap();
                    for _ in 0..ROUNDS {
                        mutex.lock().unwrap();
                        assert!(!inside.swap(true, Ordering::AcqRel));
                        counter.fetch_add(1, Ordering::Relaxed);
                        inside.store(false, Ordering::Release);
                        mutex.unlock().unwrap();
                    }
                });
            }
        });

        assert_eq!(counter.load(Ordering::Relaxed), 2 * ROUNDS);
        assert_eq!(device.peek32(TARGET, ADDR), 0);
    }
}
