//! # Guest Memory Manager (GMM)
//!
//! The Guest Memory Manager backs the 32-bit address space of an emulated program with
//! host memory. It provides:
//!
//! - A single up-front reservation of the guest space, with pages committed and zeroed
//!   on allocation and a permanently unbacked page at guest address zero.
//! - Page allocation by first fit, at fixed addresses, or with large alignments.
//! - Write detection: guest ranges can be made read-only with a one-shot callback that
//!   fires from the host fault handler on the first access that traps.
//! - External mappings, which redirect guest pages to caller-owned host buffers.
//! - Software breakpoints patched into guest code and restored on removal.
//!
//! ```no_run
//! use gmm::{AddressSpace, AddressSpaceConfig, GuestAddress, GuestMemory, Permission};
//!
//! let space = AddressSpace::new(AddressSpaceConfig::default())?;
//! let texture = space.alloc(0x4000, "texture", GuestAddress::NULL)?;
//! space.add_protect(texture, 0x4000, Permission::ReadOnly, |address, is_write| {
//!     log::debug!("texture dirtied at {} (write: {})", address, is_write);
//! })?;
//! space.write_u32(texture, 0xffff_ffff)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#[cfg(not(target_pointer_width = "64"))]
compile_error!("gmm needs a 64-bit host to reserve a full 32-bit guest space");

mod address;
mod address_space;
mod breakpoints;
mod config;
mod error;
mod external;
mod fault;
mod guest_memory;
mod human_size;
mod os;
mod page_allocator;
mod protection;

#[cfg(test)]
mod test_support;

pub use address::GuestAddress;
pub use address_space::{AddressSpace, NULL_PAGE_TAG};
pub use breakpoints::{BreakpointCallback, Breakpoints, InstructionSet};
pub use config::{AddressSpaceConfig, GUEST_SPACE_SIZE, MIN_PAGE_SIZE};
pub use error::{MemError, MemResult, MemoryFault};
pub use guest_memory::GuestMemory;
pub use human_size::HumanSize;
pub use page_allocator::{Fit, PageAllocator};
pub use protection::{Permission, ProtectCallback};
