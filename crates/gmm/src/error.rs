use std::io;

use thiserror::Error;

use crate::{GuestAddress, Permission};

/// Errors returned by [`AddressSpace`](crate::AddressSpace) operations.
#[derive(Debug, Error)]
pub enum MemError {
    #[error("out of guest memory: no free run of {pages} pages")]
    OutOfMemory { pages: usize },

    #[error("allocation size must be non-zero")]
    ZeroSize,

    #[error("allocation tag must not be empty")]
    EmptyTag,

    #[error("alignment {0:#x} is not a power of two")]
    InvalidAlignment(usize),

    #[error("range {address}+{size:#x} lies outside the address space")]
    OutOfRange { address: GuestAddress, size: usize },

    #[error("range {address}+{size:#x} overlaps an existing allocation")]
    AddressInUse { address: GuestAddress, size: usize },

    #[error("{0} is not the first page of an allocation")]
    NotAllocationStart(GuestAddress),

    #[error("range {address}+{size:#x} is not fully allocated")]
    NotMapped { address: GuestAddress, size: usize },

    #[error("{what} {value:#x} is not page aligned")]
    Misaligned { what: &'static str, value: usize },

    #[error("{0:?} access cannot be used to arm a protection")]
    InvalidPermission(Permission),

    #[error("range {address}+{size:#x} has live protections")]
    RangeProtected { address: GuestAddress, size: usize },

    #[error("range {address}+{size:#x} is externally mapped")]
    ExternallyMapped { address: GuestAddress, size: usize },

    #[error("mapping {address}+{size:#x} overlaps an existing external mapping")]
    MappingOverlap { address: GuestAddress, size: usize },

    #[error("no external mapping of {size:#x} bytes at host address {host:#x}")]
    UnknownMapping { host: usize, size: usize },

    #[error("external mappings require the page indirection table")]
    IndirectionDisabled,

    #[error("another address space already owns the fault handler")]
    HandlerBusy,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("{op} failed")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

pub type MemResult<T> = Result<T, MemError>;

impl MemError {
    pub(crate) fn os(op: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Os { op, source }
    }
}

/// A guest access that touched memory no allocation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryFault {
    #[error("unmapped guest address {0}")]
    Unmapped(GuestAddress),
}
