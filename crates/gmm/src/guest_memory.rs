//! Checked guest memory accessors.
//!
//! Emulated code normally reaches guest memory through [`AddressSpace::translate`] and
//! raw host pointers. These accessors are for host-side code that wants bounds checks:
//! they refuse unallocated ranges instead of faulting, and they go through the page
//! indirection table one page at a time, so externally mapped pages are honoured.
//!
//! Writes to protected pages still fault and fire the armed callbacks, exactly as a
//! store from emulated code would.

use core::ptr;

use crate::{AddressSpace, GuestAddress, MemoryFault};

/// Byte and little-endian integer access to guest memory.
pub trait GuestMemory {
    fn read_bytes(&self, address: GuestAddress, buf: &mut [u8]) -> Result<(), MemoryFault>;
    fn write_bytes(&self, address: GuestAddress, data: &[u8]) -> Result<(), MemoryFault>;

    fn read_u8(&self, address: GuestAddress) -> Result<u8, MemoryFault> {
        let mut buf = [0; 1];
        self.read_bytes(address, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, address: GuestAddress) -> Result<u16, MemoryFault> {
        let mut buf = [0; 2];
        self.read_bytes(address, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, address: GuestAddress) -> Result<u32, MemoryFault> {
        let mut buf = [0; 4];
        self.read_bytes(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, address: GuestAddress) -> Result<u64, MemoryFault> {
        let mut buf = [0; 8];
        self.read_bytes(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u8(&self, address: GuestAddress, value: u8) -> Result<(), MemoryFault> {
        self.write_bytes(address, &[value])
    }

    fn write_u16(&self, address: GuestAddress, value: u16) -> Result<(), MemoryFault> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    fn write_u32(&self, address: GuestAddress, value: u32) -> Result<(), MemoryFault> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    fn write_u64(&self, address: GuestAddress, value: u64) -> Result<(), MemoryFault> {
        self.write_bytes(address, &value.to_le_bytes())
    }
}

impl AddressSpace {
    /// Splits `[address, address + len)` into per-page chunks of
    /// `(host pointer, offset into the caller's buffer, length)`.
    fn page_chunks(
        &self,
        address: GuestAddress,
        len: usize,
    ) -> Result<impl Iterator<Item = (*mut u8, usize, usize)> + '_, MemoryFault> {
        let page_size = self.page_size();
        if len != 0 && !self.is_valid_range(address, len) {
            let first = address.page_index(page_size);
            let last = (address.as_usize() + len - 1) / page_size;
            let bad = (first..=last)
                .map(|page| (page * page_size).max(address.as_usize()))
                .filter_map(GuestAddress::from_offset)
                .find(|&candidate| !self.is_valid(candidate))
                .unwrap_or(address);
            return Err(MemoryFault::Unmapped(bad));
        }

        let mut done = 0;
        Ok(core::iter::from_fn(move || {
            if done >= len {
                return None;
            }
            let offset = address.as_usize() + done;
            let chunk = (page_size - offset % page_size).min(len - done);
            let item = (self.translate(GuestAddress::from_offset(offset)?), done, chunk);
            done += chunk;
            Some(item)
        }))
    }
}

impl GuestMemory for AddressSpace {
    fn read_bytes(&self, address: GuestAddress, buf: &mut [u8]) -> Result<(), MemoryFault> {
        for (host, at, len) in self.page_chunks(address, buf.len())? {
            // SAFETY: the page is allocated, so `host` points at `len` readable bytes.
            unsafe { ptr::copy_nonoverlapping(host, buf[at..].as_mut_ptr(), len) };
        }
        Ok(())
    }

    fn write_bytes(&self, address: GuestAddress, data: &[u8]) -> Result<(), MemoryFault> {
        for (host, at, len) in self.page_chunks(address, data.len())? {
            // SAFETY: the page is allocated; protected pages fault and are un-armed by
            // the fault handler before the store retries.
            unsafe { ptr::copy_nonoverlapping(data[at..].as_ptr(), host, len) };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::small_space;

    #[test]
    fn little_endian_round_trip() {
        let space = small_space();
        let addr = space.alloc(64, "io", GuestAddress::NULL).unwrap();

        space.write_u32(addr, 0x0102_0304).unwrap();
        assert_eq!(space.read_u8(addr).unwrap(), 0x04);
        assert_eq!(space.read_u16(addr + 2).unwrap(), 0x0102);

        space.write_u64(addr + 8, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(space.read_u64(addr + 8).unwrap(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn access_spanning_pages() {
        let space = small_space();
        let page = space.page_size();
        let addr = space.alloc(2 * page, "span", GuestAddress::NULL).unwrap();
        let edge = addr + (page as u32 - 2);

        space.write_u32(edge, 0xaabb_ccdd).unwrap();
        assert_eq!(space.read_u32(edge).unwrap(), 0xaabb_ccdd);

        let data: Vec<u8> = (0..=255).cycle().take(page + 100).collect();
        space.write_bytes(addr + 50, &data).unwrap();
        let mut back = vec![0; data.len()];
        space.read_bytes(addr + 50, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn unallocated_access_faults() {
        let space = small_space();
        let page = space.page_size();
        let addr = space.alloc(page, "edge", GuestAddress::NULL).unwrap();
        let tail = addr + (page as u32 - 2);

        assert_eq!(
            space.read_u32(tail),
            Err(MemoryFault::Unmapped(addr + page as u32))
        );
        assert_eq!(
            space.write_u8(GuestAddress::NULL, 1),
            Err(MemoryFault::Unmapped(GuestAddress::NULL))
        );
        assert!(space.read_bytes(GuestAddress::NULL, &mut []).is_ok());
    }
}
