//! # Direct Addressed Access
//!
//! One-shot reads and writes that manage a transient area internally, plus
//! the XPB (auxiliary control bus) register helpers.

use crate::area::{check_align, CppArea};
use crate::cpp::Cpp;
use crate::error::Result;
use crate::id::{target, CppId, InterfaceId, InterfaceType};

/// XPB address composition and routing
pub mod xpb {
    use super::*;

    /// Global XPB access bit
    pub const GLOBAL: u32 = 1 << 30;
    /// Island field of an XPB address
    pub const ISLAND_MASK: u32 = 0x3f << 24;
    /// ARM overlay island
    pub const ARM_ISLAND: u32 = 1;
    /// Highest island-1 address reached through the global path
    pub const ARM_GLOBAL_LIMIT: u32 = 0x60000;

    /// Pluggable-device ID register offset
    pub const PL_DEVICE_ID: u32 = 0x4;
    /// Revision byte of the device ID register
    pub const PL_DEVICE_ID_MASK: u32 = 0xff;
    /// Model bits of the device ID register
    pub const PL_DEVICE_MODEL_MASK: u32 = 0xffff_00ff;
    /// Base of the island translation CSRs
    pub const IMB_CPP_AT_BASE: u32 = 0x000a_0000;

    /// Base address of an XPB device
    pub const fn device(island: u8, slave: u8, device: u8) -> u32 {
        (island as u32 & 0x3f) << 24 | (slave as u32 & 0x3) << 22 | (device as u32 & 0x3f) << 16
    }

    /// CPP ID and bus address for an XPB register.
    ///
    /// Island 0 addresses pass through. The ARM overlay island is reached
    /// globally below [`ARM_GLOBAL_LIMIT`]; above it, interfaces other than
    /// the ARM itself address island 1 explicitly. Other islands are always
    /// reached globally.
    pub fn route(interface: InterfaceId, address: u32) -> (CppId, u32) {
        let id = CppId::rw(target::CT_XPB);
        let island = (address & ISLAND_MASK) >> 24;

        let address = match island {
            0 => address,
            ARM_ISLAND => {
                let local = address & !0x7f00_0000;
                if local < ARM_GLOBAL_LIMIT {
                    local | GLOBAL
                } else if interface.kind() != Some(InterfaceType::Arm) {
                    local | ARM_ISLAND << 24
                } else {
                    local
                }
            },
            _ => address | GLOBAL,
        };

        (id, address)
    }
}

impl Cpp {
    /// Read `length` bytes
    pub fn read(&self, id: CppId, address: u64, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length];
        self.read_into(id, address, &mut buf)?;
        Ok(buf)
    }

    /// Read into `buf`. An empty buffer is a no-op.
    pub fn read_into(&self, id: CppId, address: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut area = CppArea::alloc_acquire(self, id, address, buf.len())?;
        let result = area.read(0, buf);
        area.release_free();
        result
    }

    /// Write `buf`. An empty buffer is a no-op.
    pub fn write(&self, id: CppId, address: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut area = CppArea::alloc_acquire(self, id, address, buf.len())?;
        let result = area.write(0, buf);
        area.release_free();
        result
    }

    /// Read a u32 at a 4-byte aligned address
    pub fn read32(&self, id: CppId, address: u64) -> Result<u32> {
        check_align(address, 4)?;
        let mut bytes = [0u8; 4];
        self.read_into(id, address, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write a u32 at a 4-byte aligned address
    pub fn write32(&self, id: CppId, address: u64, value: u32) -> Result<()> {
        check_align(address, 4)?;
        self.write(id, address, &value.to_le_bytes())
    }

    /// Read a u64 at an 8-byte aligned address
    pub fn read64(&self, id: CppId, address: u64) -> Result<u64> {
        check_align(address, 8)?;
        let mut bytes = [0u8; 8];
        self.read_into(id, address, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Write a u64 at an 8-byte aligned address
    pub fn write64(&self, id: CppId, address: u64, value: u64) -> Result<()> {
        check_align(address, 8)?;
        self.write(id, address, &value.to_le_bytes())
    }

    /// Read an XPB register
    pub fn xpb_read32(&self, address: u32) -> Result<u32> {
        let (id, address) = xpb::route(self.interface(), address);
        self.read32(id, address as u64)
    }

    /// Write an XPB register
    pub fn xpb_write32(&self, address: u32, value: u32) -> Result<()> {
        let (id, address) = xpb::route(self.interface(), address);
        self.write32(id, address as u64, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, TransportError};
    use crate::sim::{SimDevice, SimTransport};

    fn pci() -> InterfaceId {
        InterfaceId::new(InterfaceType::Pci, 0, 0)
    }

    fn arm() -> InterfaceId {
        InterfaceId::new(InterfaceType::Arm, 0, 0)
    }

    #[test]
    fn test_xpb_device_address() {
        assert_eq!(xpb::device(1, 1, 16), 0x0150_0000);
        assert_eq!(xpb::device(0x7f, 7, 0x7f), 0x3fff_0000);
    }

    #[test]
    fn test_xpb_route() {
        let (id, addr) = xpb::route(pci(), 0x000a_0010);
        assert_eq!(id, CppId::new(target::CT_XPB, crate::id::action::RW, 0));
        assert_eq!(addr, 0x000a_0010);

        // ARM overlay, low range goes global
        assert_eq!(xpb::route(pci(), 0x0101_0000).1, 0x4001_0000);
        assert_eq!(xpb::route(arm(), 0x0101_0000).1, 0x4001_0000);

        // ARM overlay, high range
        assert_eq!(xpb::route(pci(), 0x0150_0004).1, 0x0150_0004);
        assert_eq!(xpb::route(arm(), 0x0150_0004).1, 0x0050_0004);

        // other islands
        assert_eq!(xpb::route(pci(), 0x2401_0000).1, 0x6401_0000);
    }

    #[test]
    fn test_direct_round_trip() {
        let device = SimDevice::nfp6000();
        let cpp = SimTransport::open(&device, pci()).unwrap();
        let id = CppId::rw(target::MU);

        cpp.write(id, 0x9000, b"nfp-cpp").unwrap();
        assert_eq!(cpp.read(id, 0x9000, 7).unwrap(), b"nfp-cpp");

        cpp.write64(id, 0x9008, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(cpp.read32(id, 0x9008).unwrap(), 0x5566_7788);
        assert_eq!(cpp.read64(id, 0x9008).unwrap(), 0x1122_3344_5566_7788);

        assert_eq!(cpp.areas_live(), 0);
        assert_eq!(cpp.areas_acquired(), 0);
    }

    #[test]
    fn test_direct_alignment() {
        let device = SimDevice::nfp6000();
        let cpp = SimTransport::open(&device, pci()).unwrap();
        let id = CppId::rw(target::MU);
        let before = device.stats();

        assert_eq!(
            cpp.read32(id, 0x9002),
            Err(Error::Misaligned {
                offset: 0x9002,
                align: 4
            })
        );
        assert!(cpp.write64(id, 0x9004, 0).is_err());
        assert_eq!(device.stats().area_inits, before.area_inits);
    }

    #[test]
    fn test_direct_empty_transfer() {
        let device = SimDevice::nfp6000();
        let cpp = SimTransport::open(&device, pci()).unwrap();

        assert!(cpp.read(CppId::rw(target::MU), 0, 0).unwrap().is_empty());
        cpp.write(CppId::rw(target::MU), 0, &[]).unwrap();
    }

    #[test]
    fn test_direct_read_failure_releases_area() {
        let device = SimDevice::nfp6000();
        let cpp = SimTransport::open(&device, pci()).unwrap();

        device.fail_reads(1);
        assert_eq!(
            cpp.read32(CppId::rw(target::MU), 0),
            Err(Error::Transport(TransportError::ReadFailed))
        );
        assert_eq!(cpp.areas_live(), 0);
        assert_eq!(cpp.areas_acquired(), 0);
    }

    #[test]
    fn test_xpb_register_access() {
        let device = SimDevice::nfp6000();
        let cpp = SimTransport::open(&device, pci()).unwrap();

        cpp.xpb_write32(0x2401_0020, 0xa5a5_0001).unwrap();
        assert_eq!(device.peek32(target::CT_XPB, 0x6401_0020), 0xa5a5_0001);
        assert_eq!(cpp.xpb_read32(0x2401_0020).unwrap(), 0xa5a5_0001);
    }
}
