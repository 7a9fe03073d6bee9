//! Guest address type.
//!
//! Guest addresses are 32-bit offsets into the emulated program's flat address space.
//! The host side of the translation lives in [`AddressSpace::translate`].
//!
//! [`AddressSpace::translate`]: crate::AddressSpace::translate

use core::fmt;
use core::ops::{Add, Sub};

/// A 32-bit guest address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GuestAddress(u32);

impl GuestAddress {
    /// The guest null pointer. Page 0 is never backed, so dereferencing it faults.
    pub const NULL: Self = Self(0);

    /// Creates a new guest address.
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Creates a guest address from a host-sized offset, if it fits in 32 bits.
    #[inline]
    pub const fn from_offset(offset: usize) -> Option<Self> {
        if offset > u32::MAX as usize {
            None
        } else {
            Some(Self(offset as u32))
        }
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the address as an offset from the start of the reservation.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the address is a multiple of `align`.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.as_usize() & (align - 1) == 0
    }

    /// Rounds the address down to a multiple of `align`.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[inline]
    pub const fn align_down(self, align: usize) -> Self {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self((self.as_usize() & !(align - 1)) as u32)
    }

    /// Rounds the address up to a multiple of `align`, or `None` if that leaves the
    /// 32-bit space.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[inline]
    pub const fn checked_align_up(self, align: usize) -> Option<Self> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self::from_offset((self.as_usize() + align - 1) & !(align - 1))
    }

    #[inline]
    pub const fn checked_add(self, rhs: usize) -> Option<Self> {
        match self.as_usize().checked_add(rhs) {
            Some(sum) => Self::from_offset(sum),
            None => None,
        }
    }

    /// Returns the index of the page containing this address.
    #[inline]
    pub const fn page_index(self, page_size: usize) -> usize {
        self.as_usize() / page_size
    }

    /// Returns the offset of this address within its page.
    #[inline]
    pub const fn page_offset(self, page_size: usize) -> usize {
        self.as_usize() % page_size
    }
}

impl From<u32> for GuestAddress {
    #[inline]
    fn from(addr: u32) -> Self {
        Self(addr)
    }
}

impl From<GuestAddress> for u32 {
    #[inline]
    fn from(addr: GuestAddress) -> Self {
        addr.0
    }
}

impl Add<u32> for GuestAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0.checked_add(rhs).expect("guest address overflow"))
    }
}

impl Sub for GuestAddress {
    type Output = u32;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0.checked_sub(rhs.0).expect("guest address underflow")
    }
}

impl fmt::Debug for GuestAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GuestAddress({:#010x})", self.0)
    }
}

impl fmt::Display for GuestAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::LowerHex for GuestAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligns_down_and_up() {
        let addr = GuestAddress::new(0x8100_0123);
        assert_eq!(addr.align_down(0x1000), GuestAddress::new(0x8100_0000));
        assert_eq!(
            addr.checked_align_up(0x1000),
            Some(GuestAddress::new(0x8100_1000))
        );
        assert!(GuestAddress::new(0x4000).is_aligned(0x4000));
        assert!(!addr.is_aligned(4));
    }

    #[test]
    fn align_up_past_top_is_none() {
        assert_eq!(GuestAddress::new(0xFFFF_F001).checked_align_up(0x1000), None);
        assert_eq!(GuestAddress::new(u32::MAX).checked_add(1), None);
    }

    #[test]
    fn page_split() {
        let addr = GuestAddress::new(0x3005);
        assert_eq!(addr.page_index(0x1000), 3);
        assert_eq!(addr.page_offset(0x1000), 5);
    }

    #[test]
    fn formats_as_hex() {
        assert_eq!(format!("{}", GuestAddress::new(0x1000)), "0x00001000");
        assert_eq!(
            format!("{:?}", GuestAddress::NULL),
            "GuestAddress(0x00000000)"
        );
    }

    #[test]
    fn offset_conversion() {
        assert_eq!(GuestAddress::from_offset(0x1_0000_0000), None);
        assert_eq!(
            GuestAddress::from_offset(0xFFFF_FFFF),
            Some(GuestAddress::new(u32::MAX))
        );
    }
}
