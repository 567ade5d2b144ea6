//! # CPP Areas
//!
//! An area is a reserved window into one target's address space.
//!
//! ```text
//!            alloc                acquire
//!   (none) ─────────▶ Allocated ─────────▶ Acquired
//!     ▲                 │   ▲                 │
//!     │      free/drop  │   │     release     │
//!     └─────────────────┘   └─────────────────┘
//! ```
//!
//! `alloc` only asks the backend for per-area state; hardware resources are
//! committed by `acquire`. Reads, writes and `iomem` are valid only while the
//! area is acquired, and every access is bounds checked before the backend
//! sees it.

use core::fmt;
use std::ptr::NonNull;

use crate::cpp::Cpp;
use crate::error::{Error, Result};
use crate::id::CppId;
use crate::transport::{AreaPrivate, AreaWindow};

/// Area lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaState {
    /// Descriptor exists, no hardware resources committed
    Allocated,
    /// Hardware resources committed; I/O is valid
    Acquired,
}

/// A window into a target's address space
pub struct CppArea<'cpp> {
    cpp: &'cpp Cpp,
    name: String,
    window: AreaWindow,
    private: AreaPrivate,
    state: AreaState,
}

impl<'cpp> CppArea<'cpp> {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Allocate an area with a generated name
    pub fn alloc(cpp: &'cpp Cpp, id: CppId, address: u64, size: usize) -> Result<Self> {
        Self::alloc_named(cpp, id, None, address, size)
    }

    /// Allocate an area.
    ///
    /// Not serialized: callers must not allocate overlapping areas from
    /// several threads at once.
    pub fn alloc_named(
        cpp: &'cpp Cpp,
        id: CppId,
        name: Option<&str>,
        address: u64,
        size: usize,
    ) -> Result<Self> {
        if size == 0 || address.checked_add(size as u64).is_none() {
            return Err(Error::InvalidParameter);
        }

        let window = AreaWindow { id, address, size };
        let private = cpp.transport().area_init(&window)?;
        cpp.track_alloc();

        let name = match name {
            Some(name) => name.to_owned(),
            None => format!(
                "{}.{}.{}@{:#x}",
                id.target(),
                id.action(),
                id.token(),
                address
            ),
        };

        Ok(Self {
            cpp,
            name,
            window,
            private,
            state: AreaState::Allocated,
        })
    }

    /// Allocate and acquire; the allocation is undone if acquire fails
    pub fn alloc_acquire(cpp: &'cpp Cpp, id: CppId, address: u64, size: usize) -> Result<Self> {
        let mut area = Self::alloc(cpp, id, address, size)?;
        area.acquire()?;
        Ok(area)
    }

    /// Allocate, acquire and read the whole window.
    ///
    /// The area is returned still acquired.
    pub fn map(cpp: &'cpp Cpp, id: CppId, address: u64, size: usize) -> Result<(Vec<u8>, Self)> {
        let mut area = Self::alloc_acquire(cpp, id, address, size)?;
        let mut buf = vec![0u8; size];
        area.read(0, &mut buf)?;
        Ok((buf, area))
    }

    /// Commit hardware resources.
    ///
    /// On failure the area stays allocated and may be retried or freed.
    pub fn acquire(&mut self) -> Result<()> {
        if self.state == AreaState::Acquired {
            return Err(Error::AreaAcquired);
        }

        let (window, private) = (&self.window, &mut self.private);
        self.cpp.serialized(|t| t.area_acquire(window, private))?;

        self.state = AreaState::Acquired;
        self.cpp.track_acquire();
        log::debug!("nfp-cpp: acquired area {}", self.name);
        Ok(())
    }

    /// Return hardware resources.
    ///
    /// The area is allocated afterwards even if the backend reports an error.
    pub fn release(&mut self) -> Result<()> {
        if self.state != AreaState::Acquired {
            return Err(Error::AreaNotAcquired);
        }

        let (window, private) = (&self.window, &mut self.private);
        let result = self.cpp.serialized(|t| t.area_release(window, private));

        self.state = AreaState::Allocated;
        self.cpp.track_release();

        match result {
            Ok(()) => {
                log::debug!("nfp-cpp: released area {}", self.name);
                Ok(())
            },
            Err(e) => {
                log::warn!("nfp-cpp: release of area {} failed: {}", self.name, e);
                Err(e)
            },
        }
    }

    /// Destroy the descriptor.
    ///
    /// An acquired area is handed back unchanged.
    pub fn free(self) -> core::result::Result<(), Self> {
        if self.state == AreaState::Acquired {
            return Err(self);
        }
        drop(self);
        Ok(())
    }

    /// Release (if acquired) and free, ignoring release failures
    pub fn release_free(mut self) {
        if self.state == AreaState::Acquired {
            let _ = self.release();
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Owning device handle
    pub fn cpp(&self) -> &'cpp Cpp {
        self.cpp
    }

    /// Diagnostic name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// CPP ID
    pub fn id(&self) -> CppId {
        self.window.id
    }

    /// Base address
    pub fn address(&self) -> u64 {
        self.window.address
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.window.size
    }

    /// Lifecycle state
    pub fn state(&self) -> AreaState {
        self.state
    }

    /// Direct pointer to the mapped window, if the backend provides one
    pub fn iomem(&self) -> Option<NonNull<u8>> {
        if self.state != AreaState::Acquired {
            return None;
        }
        self.cpp.transport().area_iomem(&self.window, &self.private)
    }

    // =========================================================================
    // I/O
    // =========================================================================

    fn check_access(&self, offset: u64, length: usize) -> Result<()> {
        if self.state != AreaState::Acquired {
            return Err(Error::AreaNotAcquired);
        }
        if !self.window.contains(offset, length) {
            return Err(Error::OutOfRange {
                offset,
                length,
                size: self.window.size,
            });
        }
        Ok(())
    }

    /// Read `buf.len()` bytes at `offset`
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_access(offset, buf.len())?;
        let (window, private) = (&self.window, &mut self.private);
        self.cpp
            .serialized(|t| t.area_read(window, private, offset, buf))
    }

    /// Write `buf` at `offset`
    pub fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_access(offset, buf.len())?;
        let (window, private) = (&self.window, &mut self.private);
        self.cpp
            .serialized(|t| t.area_write(window, private, offset, buf))
    }

    /// Read a little-endian u32 at a 4-byte aligned offset
    pub fn read32(&mut self, offset: u64) -> Result<u32> {
        check_align(offset, 4)?;
        let mut bytes = [0u8; 4];
        self.read(offset, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write a little-endian u32 at a 4-byte aligned offset
    pub fn write32(&mut self, offset: u64, value: u32) -> Result<()> {
        check_align(offset, 4)?;
        self.write(offset, &value.to_le_bytes())
    }

    /// Read a little-endian u64 at an 8-byte aligned offset
    pub fn read64(&mut self, offset: u64) -> Result<u64> {
        check_align(offset, 8)?;
        let mut bytes = [0u8; 8];
        self.read(offset, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Write a little-endian u64 at an 8-byte aligned offset
    pub fn write64(&mut self, offset: u64, value: u64) -> Result<()> {
        check_align(offset, 8)?;
        self.write(offset, &value.to_le_bytes())
    }
}

pub(crate) fn check_align(offset: u64, align: u32) -> Result<()> {
    if offset % align as u64 != 0 {
        return Err(Error::Misaligned { offset, align });
    }
    Ok(())
}

impl Drop for CppArea<'_> {
    fn drop(&mut self) {
        if self.state == AreaState::Acquired {
            log::error!("nfp-cpp: area {} dropped while acquired", self.name);
            let _ = self.release();
        }
        self.cpp
            .transport()
            .area_cleanup(&self.window, &mut self.private);
        self.cpp.track_free();
    }
}

impl fmt::Debug for CppArea<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CppArea")
            .field("name", &self.name)
            .field("id", &self.window.id)
            .field("address", &format_args!("{:#x}", self.window.address))
            .field("size", &self.window.size)
            .field("state", &self.state)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
