//! The guest address space.
//!
//! An [`AddressSpace`] reserves the whole guest range up front as inaccessible host
//! memory and commits pages on allocation. Guest address `g` lives at host address
//! `base + g` unless an external mapping has redirected its page through the
//! indirection table.
//!
//! Two locks guard the mutable state:
//!
//! - the generation lock serializes allocation and release, and owns the page bitmap
//!   and the allocation tags;
//! - the protection lock owns the protection registry and the external mapping table,
//!   and is the only lock the fault handler takes.
//!
//! When both are needed the generation lock is taken first. Per-page records and the
//! indirection table are atomics so the fault handler can read them without locking.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::collections::BTreeMap;
use std::io;

use crate::external::{ExternalMapping, ExternalMappingTable};
use crate::fault::FaultBridge;
use crate::page_allocator::{Fit, PageAllocator};
use crate::protection::{ProtectLock, ProtectionRegistry};
use crate::{
    AddressSpaceConfig, GuestAddress, HumanSize, MemError, MemResult, Permission, os,
};

/// Tag of the permanently reserved page at guest address zero.
pub const NULL_PAGE_TAG: &str = "NULL";

/// Set on every page that belongs to an allocation.
const RECORD_ALLOCATED: u32 = 1 << 31;
/// Run length in pages, stored on the first page of an allocation only.
const RECORD_RUN_MASK: u32 = !RECORD_ALLOCATED;

struct Generation {
    pages: PageAllocator,
    tags: BTreeMap<usize, String>,
}

pub(crate) struct ProtectionState {
    registry: ProtectionRegistry,
    mappings: ExternalMappingTable,
}

/// State shared with the fault handler. Lives behind a `Box` so its address is stable
/// for as long as the handler may reach it.
pub(crate) struct Shared {
    base: NonNull<u8>,
    total_size: usize,
    page_size: usize,
    page_shift: u32,
    records: Box<[AtomicU32]>,
    indirection: Option<Box<[AtomicUsize]>>,
    generation: spin::Mutex<Generation>,
    protection: ProtectLock<ProtectionState>,
}

// SAFETY: `base` points at a reservation owned by `Shared`; all mutation of the memory
// behind it and of the bookkeeping goes through atomics or the two locks.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn page_count(&self) -> usize {
        self.records.len()
    }

    fn primary_page(&self, page: usize) -> NonNull<u8> {
        // SAFETY: callers pass pages inside the reservation.
        unsafe { self.base.add(page * self.page_size) }
    }

    /// Host address currently backing `page`.
    fn host_page(&self, page: usize) -> *mut u8 {
        match &self.indirection {
            Some(table) => table[page].load(Ordering::Acquire) as *mut u8,
            None => self.primary_page(page).as_ptr(),
        }
    }

    fn translate(&self, offset: usize) -> *mut u8 {
        self.host_page(offset >> self.page_shift)
            .wrapping_add(offset & (self.page_size - 1))
    }

    /// True if `page` belongs to an allocation. The guard page never does.
    fn page_allocated(&self, page: usize) -> bool {
        page != 0
            && page < self.page_count()
            && self.records[page].load(Ordering::Acquire) & RECORD_ALLOCATED != 0
    }

    /// First page that is not allocated in `[start, start + size)`, if any.
    fn first_unallocated(&self, start: usize, size: usize) -> Option<usize> {
        let first = start >> self.page_shift;
        let last = (start + size).div_ceil(self.page_size);
        (first..last).find(|&page| !self.page_allocated(page))
    }

    /// Applies `permission` to the host pages backing `[start, start + size)`,
    /// following the indirection table.
    fn set_access(&self, start: usize, size: usize, permission: Permission) -> io::Result<()> {
        let first = start >> self.page_shift;
        let last = (start + size).div_ceil(self.page_size);

        let mut span: Option<(*mut u8, usize)> = None;
        for page in first..last {
            let host = self.host_page(page);
            if let Some((span_start, len)) = span.as_mut()
                && (*span_start).wrapping_add(*len) == host
            {
                *len += self.page_size;
                continue;
            }
            if let Some((span_start, len)) = span.replace((host, self.page_size)) {
                protect_span(span_start, len, permission)?;
            }
        }
        match span {
            Some((span_start, len)) => protect_span(span_start, len, permission),
            None => Ok(()),
        }
    }

    /// Resolves a host fault against the armed protections. Returns true if the fault
    /// was ours and the access can be retried.
    pub(crate) fn handle_fault(&self, host: usize, is_write: bool) -> bool {
        // Faults raised while this thread updates protections are not ours to resolve.
        let Some(mut protection) = self.protection.lock_from_trap() else {
            return false;
        };

        let base = self.base.as_ptr() as usize;
        let guest = if host >= base && host - base < self.total_size {
            host - base
        } else {
            match protection.mappings.resolve(host) {
                Some(guest) => guest,
                None => return false,
            }
        };
        if !self.page_allocated(guest >> self.page_shift) {
            return false;
        }

        let Some(range) = protection.registry.take(guest) else {
            // Another thread un-armed the range while this one waited for the lock; the
            // page is accessible again unless an external mapping forbids the access.
            return protection
                .mappings
                .find_guest(guest)
                .is_none_or(|mapping| mapping.permission.allows(is_write));
        };
        if self
            .set_access(range.start(), range.size(), Permission::ReadWrite)
            .is_err()
        {
            return false;
        }
        drop(protection);

        range.fire(guest, is_write);
        true
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let mappings = self.protection.lock().mappings.len();
        if mappings != 0 {
            log::warn!(
                "releasing guest address space with {} live external mappings",
                mappings
            );
        }
        // SAFETY: the fault bridge is gone and no borrow of the reservation outlives `self`.
        if let Err(err) = unsafe { os::release(self.base, self.total_size) } {
            log::error!("failed to release guest address space: {}", err);
        }
    }
}

fn protect_span(start: *mut u8, len: usize, permission: Permission) -> io::Result<()> {
    let start = NonNull::new(start).ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: spans come from pages of the reservation or of a live external mapping.
    unsafe { os::protect(start, len, permission) }
}

/// A reserved 32-bit guest address space with page allocation, write protection and
/// external mappings.
pub struct AddressSpace {
    // Dropped before `shared`: the handler must be gone before the reservation is.
    bridge: Option<FaultBridge>,
    shared: Box<Shared>,
}

impl AddressSpace {
    /// Reserves the guest address space described by `config`.
    ///
    /// Guest page 0 is reserved with the tag `"NULL"` and never committed, so guest
    /// null-pointer accesses fault. With `fault_handling` enabled this also installs the
    /// process-wide fault handler, which only one address space can own at a time.
    pub fn new(config: AddressSpaceConfig) -> MemResult<Self> {
        let page_size = config.page_size(os::page_size())?;
        let page_count = config.total_size / page_size;

        let base = os::reserve(config.total_size).map_err(|source| {
            log::error!(
                "failed to reserve {} of guest address space: {}",
                HumanSize(config.total_size),
                source
            );
            MemError::Os {
                op: "reserve",
                source,
            }
        })?;

        let records = (0..page_count).map(|_| AtomicU32::new(0)).collect();
        let indirection = config.page_indirection.then(|| {
            (0..page_count)
                .map(|page| AtomicUsize::new(base.as_ptr() as usize + page * page_size))
                .collect()
        });

        let mut pages = PageAllocator::new(page_count);
        pages.allocate_at(0, 1);
        let mut tags = BTreeMap::new();
        tags.insert(0, NULL_PAGE_TAG.to_owned());

        let shared = Box::new(Shared {
            base,
            total_size: config.total_size,
            page_size,
            page_shift: page_size.trailing_zeros(),
            records,
            indirection,
            generation: spin::Mutex::new(Generation { pages, tags }),
            protection: ProtectLock::new(ProtectionState {
                registry: ProtectionRegistry::new(),
                mappings: ExternalMappingTable::new(),
            }),
        });
        shared.records[0].store(RECORD_ALLOCATED | 1, Ordering::Release);

        let bridge = if config.fault_handling {
            // SAFETY: the box is owned by the returned space and outlives the bridge.
            Some(unsafe { FaultBridge::install(&shared) }?)
        } else {
            None
        };

        log::info!(
            "reserved {} of guest address space at {:p} ({} pages of {})",
            HumanSize(config.total_size),
            base,
            page_count,
            HumanSize(page_size)
        );
        Ok(Self { bridge, shared })
    }

    pub fn page_size(&self) -> usize {
        self.shared.page_size
    }

    pub fn total_size(&self) -> usize {
        self.shared.total_size
    }

    /// Returns true if this space owns the process fault handler.
    pub fn handles_faults(&self) -> bool {
        self.bridge.is_some()
    }

    /// Returns the end of `[address, address + size)` if it fits in the space.
    fn range_end(&self, address: GuestAddress, size: usize) -> Option<usize> {
        address
            .as_usize()
            .checked_add(size)
            .filter(|&end| end <= self.shared.total_size)
    }

    fn pages_for(&self, size: usize) -> usize {
        size.div_ceil(self.shared.page_size)
    }

    fn check_request(size: usize, tag: &str) -> MemResult<()> {
        if size == 0 {
            log::error!("zero-size guest allocation requested");
            return Err(MemError::ZeroSize);
        }
        if tag.is_empty() {
            log::error!("guest allocation requested without a tag");
            return Err(MemError::EmptyTag);
        }
        Ok(())
    }

    /// Allocates `size` bytes (rounded up to whole pages) from the first free run at or
    /// after `start_hint`. The memory is committed and zeroed.
    pub fn alloc(&self, size: usize, tag: &str, start_hint: GuestAddress) -> MemResult<GuestAddress> {
        Self::check_request(size, tag)?;
        let pages = self.pages_for(size);
        let hint = start_hint.page_index(self.shared.page_size);

        let mut generation = self.shared.generation.lock();
        let Some(first) = generation.pages.allocate_from(hint, pages, Fit::First) else {
            log::warn!(
                "out of guest memory: failed to allocate {} for {:?}",
                HumanSize(size),
                tag
            );
            return Err(MemError::OutOfMemory { pages });
        };
        self.commit_run(&mut generation, first, pages, tag)
    }

    /// Allocates exactly the pages covering `[address, address + size)`. Fails if any of
    /// them is already in use. Returns `address` unchanged; it is also accepted by
    /// [`free`](Self::free).
    pub fn alloc_at(&self, address: GuestAddress, size: usize, tag: &str) -> MemResult<GuestAddress> {
        Self::check_request(size, tag)?;
        let Some(end) = self.range_end(address, size) else {
            log::error!("fixed allocation {}+{:#x} is out of range", address, size);
            return Err(MemError::OutOfRange { address, size });
        };

        let first = address.page_index(self.shared.page_size);
        let pages = end.div_ceil(self.shared.page_size) - first;

        let mut generation = self.shared.generation.lock();
        if !generation.pages.allocate_at(first, pages) {
            log::error!(
                "fixed allocation {}+{:#x} for {:?} overlaps existing memory",
                address,
                size,
                tag
            );
            return Err(MemError::AddressInUse { address, size });
        }
        self.commit_run(&mut generation, first, pages, tag)?;
        Ok(address)
    }

    /// Allocates `size` bytes at a multiple of `alignment`.
    ///
    /// Alignments up to the page size behave like [`alloc`](Self::alloc). Larger ones
    /// over-allocate by `alignment` bytes and return the unaligned head and the unused
    /// tail of the run to the free pool, so only the aligned pages stay allocated.
    pub fn alloc_aligned(
        &self,
        size: usize,
        tag: &str,
        alignment: usize,
        start_hint: GuestAddress,
    ) -> MemResult<GuestAddress> {
        if !alignment.is_power_of_two() {
            log::error!("invalid alignment requested: {:#x}", alignment);
            return Err(MemError::InvalidAlignment(alignment));
        }
        if alignment <= self.shared.page_size {
            return self.alloc(size, tag, start_hint);
        }
        Self::check_request(size, tag)?;

        let page_size = self.shared.page_size;
        let pages = self.pages_for(size.saturating_add(alignment));
        let hint = start_hint.page_index(page_size);

        let mut generation = self.shared.generation.lock();
        let Some(first) = generation.pages.allocate_from(hint, pages, Fit::First) else {
            log::warn!(
                "out of guest memory: failed to allocate {} aligned to {:#x} for {:?}",
                HumanSize(size),
                alignment,
                tag
            );
            return Err(MemError::OutOfMemory { pages });
        };

        let aligned = (first * page_size).next_multiple_of(alignment) / page_size;
        let used = self.pages_for(size);
        let head = aligned - first;
        if head != 0 {
            generation.pages.free(first, head);
        }
        let tail = pages - head - used;
        if tail != 0 {
            generation.pages.free(aligned + used, tail);
        }
        self.commit_run(&mut generation, aligned, used, tag)
    }

    /// Marks `pages` pages from `first` as one allocation: commits and zeroes them and
    /// records the run and its tag. The pages must already be taken in the bitmap.
    fn commit_run(
        &self,
        generation: &mut Generation,
        first: usize,
        pages: usize,
        tag: &str,
    ) -> MemResult<GuestAddress> {
        let shared = &*self.shared;
        let start = shared.primary_page(first);
        let len = pages * shared.page_size;

        // SAFETY: the pages were free, so nothing else references them.
        if let Err(source) = unsafe { os::commit(start, len) } {
            generation.pages.free(first, pages);
            log::error!("failed to commit {} for {:?}: {}", HumanSize(len), tag, source);
            return Err(MemError::Os {
                op: "commit",
                source,
            });
        }
        // SAFETY: just committed read-write.
        unsafe { ptr::write_bytes(start.as_ptr(), 0, len) };

        for record in &shared.records[first + 1..first + pages] {
            record.store(RECORD_ALLOCATED, Ordering::Release);
        }
        shared.records[first].store(RECORD_ALLOCATED | pages as u32, Ordering::Release);
        generation.tags.insert(first, tag.to_owned());

        let address = GuestAddress::from_offset(first * shared.page_size).unwrap_or_default();
        log::debug!("allocated {} at {} for {:?}", HumanSize(len), address, tag);
        #[cfg(feature = "detailed-logging")]
        for page in first..first + pages {
            log::trace!("committed page {:#x}", page * shared.page_size);
        }
        Ok(address)
    }

    /// Releases the allocation whose first page contains `address`.
    ///
    /// Protections overlapping the allocation are discarded without firing. Fails if
    /// `address` is not in the first page of an allocation or if part of it is externally
    /// mapped.
    pub fn free(&self, address: GuestAddress) -> MemResult<()> {
        let shared = &*self.shared;
        let page = address.page_index(shared.page_size);

        let mut generation = shared.generation.lock();
        let record = shared
            .records
            .get(page)
            .map_or(0, |record| record.load(Ordering::Acquire));
        let run = (record & RECORD_RUN_MASK) as usize;
        if page == 0 || record & RECORD_ALLOCATED == 0 || run == 0 {
            log::error!("free of {}, which does not start an allocation", address);
            return Err(MemError::NotAllocationStart(address));
        }

        let start = page * shared.page_size;
        let size = run * shared.page_size;
        {
            let mut protection = shared.protection.lock();
            if protection.mappings.covers_guest(start, size) {
                log::error!("free of externally mapped allocation at {}", address);
                return Err(MemError::ExternallyMapped { address, size });
            }
            // Merged ranges may reach into neighbouring allocations, which get their
            // write access back here.
            for range in protection.registry.discard(start, size) {
                shared
                    .set_access(range.start(), range.size(), Permission::ReadWrite)
                    .map_err(MemError::os("mprotect"))?;
            }
            for record in &shared.records[page..page + run] {
                record.store(0, Ordering::Release);
            }
        }

        generation.tags.remove(&page);
        generation.pages.free(page, run);
        log::debug!("freed {} at {:#x}", HumanSize(size), start);
        #[cfg(feature = "detailed-logging")]
        for page in page..page + run {
            log::trace!("decommitting page {:#x}", page * shared.page_size);
        }
        // SAFETY: the run is no longer allocated and nothing maps over it.
        unsafe { os::decommit(shared.primary_page(page), size) }.map_err(MemError::os("decommit"))
    }

    /// Bytes of guest space not currently allocated.
    pub fn mem_available(&self) -> usize {
        let generation = self.shared.generation.lock();
        generation.pages.free_slot_count(0, generation.pages.len()) * self.shared.page_size
    }

    /// Returns the tag of the allocation containing `address`.
    pub fn allocation_tag(&self, address: GuestAddress) -> Option<String> {
        let shared = &*self.shared;
        let generation = shared.generation.lock();
        let mut page = address.page_index(shared.page_size);
        if page >= shared.page_count() {
            return None;
        }
        loop {
            let record = shared.records[page].load(Ordering::Acquire);
            if record & RECORD_ALLOCATED == 0 {
                return None;
            }
            if record & RECORD_RUN_MASK != 0 {
                return generation.tags.get(&page).cloned();
            }
            page = page.checked_sub(1)?;
        }
    }

    /// Returns true if `address` lies in allocated guest memory.
    pub fn is_valid(&self, address: GuestAddress) -> bool {
        self.shared
            .page_allocated(address.page_index(self.shared.page_size))
    }

    /// Returns true if every byte of `[address, address + size)` is allocated.
    pub fn is_valid_range(&self, address: GuestAddress, size: usize) -> bool {
        size != 0
            && self.range_end(address, size).is_some()
            && self.shared.first_unallocated(address.as_usize(), size).is_none()
    }

    /// Returns the host pointer backing `address`, following the indirection table, or
    /// null if `address` lies past the end of the space.
    ///
    /// The pointer is only meaningful while the containing page stays allocated.
    pub fn translate(&self, address: GuestAddress) -> *mut u8 {
        if address.as_usize() >= self.shared.total_size {
            return ptr::null_mut();
        }
        self.shared.translate(address.as_usize())
    }

    /// Arms write detection on `[address, address + size)`.
    ///
    /// The covering pages are set to `permission`, merged with any armed range they touch.
    /// The first access that faults on the merged range un-arms all of it and calls, in
    /// registration order, each callback whose own range contains the faulting address.
    pub fn add_protect<F>(
        &self,
        address: GuestAddress,
        size: usize,
        permission: Permission,
        callback: F,
    ) -> MemResult<()>
    where
        F: FnOnce(GuestAddress, bool) + Send + 'static,
    {
        if permission == Permission::ReadWrite {
            return Err(MemError::InvalidPermission(permission));
        }
        if size == 0 {
            return Err(MemError::ZeroSize);
        }
        let shared = &*self.shared;
        let start = address.as_usize();
        let Some(end) = self.range_end(address, size) else {
            return Err(MemError::OutOfRange { address, size });
        };

        let extent_start = address.align_down(shared.page_size).as_usize();
        let extent_end = end.next_multiple_of(shared.page_size);

        let mut protection = shared.protection.lock();
        if shared
            .first_unallocated(extent_start, extent_end - extent_start)
            .is_some()
        {
            log::error!("protection of unallocated range {}+{:#x}", address, size);
            return Err(MemError::NotMapped { address, size });
        }

        let (merged_start, merged_size, merged_permission) = protection.registry.insert(
            (extent_start, extent_end - extent_start),
            start,
            size,
            permission,
            Box::new(callback),
        );
        log::trace!(
            "armed {}+{:#x} as {:?}; range now {:#x}+{:#x}",
            address,
            size,
            permission,
            merged_start,
            merged_size
        );
        shared
            .set_access(merged_start, merged_size, merged_permission)
            .map_err(|source| {
                log::error!("failed to protect {}+{:#x}: {}", address, size, source);
                MemError::Os {
                    op: "mprotect",
                    source,
                }
            })
    }

    /// Removes every armed range overlapping `[address, address + size)` without firing
    /// callbacks, and restores write access. Returns the number of ranges removed.
    pub fn unprotect(&self, address: GuestAddress, size: usize) -> MemResult<usize> {
        let shared = &*self.shared;
        let mut protection = shared.protection.lock();
        let removed = protection.registry.discard(address.as_usize(), size);
        for range in &removed {
            shared
                .set_access(range.start(), range.size(), Permission::ReadWrite)
                .map_err(MemError::os("mprotect"))?;
        }
        Ok(removed.len())
    }

    /// Returns the permission left on `address` if an armed range covers it.
    pub fn is_protecting(&self, address: GuestAddress) -> Option<Permission> {
        self.shared
            .protection
            .lock()
            .registry
            .find(address.as_usize())
            .map(|range| range.permission())
    }

    /// Number of armed protection ranges, after merging.
    pub fn protected_range_count(&self) -> usize {
        self.shared.protection.lock().registry.len()
    }

    /// Redirects the guest range `[guest, guest + size)` to the host buffer `alias`.
    ///
    /// The current guest contents are copied into the buffer, the buffer is set to
    /// `permission`, and guest accesses go to the buffer until
    /// [`remove_external_mapping`](Self::remove_external_mapping). The range must be
    /// page aligned, allocated, free of armed protections and of other mappings.
    ///
    /// # Safety
    ///
    /// `alias` must point to `size` bytes of page-aligned, writable host memory that
    /// stays valid and is not otherwise used until the mapping is removed.
    pub unsafe fn add_external_mapping(
        &self,
        guest: GuestAddress,
        size: usize,
        alias: NonNull<u8>,
        permission: Permission,
    ) -> MemResult<()> {
        let shared = &*self.shared;
        let Some(indirection) = &shared.indirection else {
            return Err(MemError::IndirectionDisabled);
        };
        let host = alias.as_ptr() as usize;
        let page_size = shared.page_size;
        for (what, value) in [("guest address", guest.as_usize()), ("size", size), ("alias", host)] {
            if value % page_size != 0 {
                return Err(MemError::Misaligned { what, value });
            }
        }
        if size == 0 {
            return Err(MemError::ZeroSize);
        }
        let start = guest.as_usize();
        if self.range_end(guest, size).is_none() {
            return Err(MemError::OutOfRange {
                address: guest,
                size,
            });
        }

        let mut protection = shared.protection.lock();
        if shared.first_unallocated(start, size).is_some() {
            return Err(MemError::NotMapped {
                address: guest,
                size,
            });
        }
        if protection.mappings.overlaps(host, start, size) {
            log::error!("external mapping {}+{:#x} overlaps another", guest, size);
            return Err(MemError::MappingOverlap {
                address: guest,
                size,
            });
        }
        if protection.registry.intersects(start, size) {
            return Err(MemError::RangeProtected {
                address: guest,
                size,
            });
        }

        let first = start / page_size;
        // SAFETY: the guest range is committed and unmapped, and the caller vouches for
        // `alias`.
        unsafe { ptr::copy_nonoverlapping(shared.primary_page(first).as_ptr(), alias.as_ptr(), size) };
        for (index, slot) in indirection[first..first + size / page_size].iter().enumerate() {
            slot.store(host + index * page_size, Ordering::Release);
        }
        // SAFETY: the caller owns `alias` for the lifetime of the mapping.
        if let Err(source) = unsafe { os::protect(alias, size, permission) } {
            for (index, slot) in indirection[first..first + size / page_size].iter().enumerate() {
                slot.store(shared.primary_page(first + index).as_ptr() as usize, Ordering::Release);
            }
            return Err(MemError::Os {
                op: "mprotect",
                source,
            });
        }

        protection
            .mappings
            .insert(
                host,
                ExternalMapping {
                    guest: start,
                    size,
                    permission,
                },
            );
        log::debug!("mapped {} of guest memory at {} to {:p}", HumanSize(size), guest, alias);
        Ok(())
    }

    /// Undoes [`add_external_mapping`](Self::add_external_mapping): discards protections
    /// on the guest range, copies the buffer's contents back and points the guest range
    /// at its own pages again.
    pub fn remove_external_mapping(&self, alias: NonNull<u8>, size: usize) -> MemResult<()> {
        let shared = &*self.shared;
        let Some(indirection) = &shared.indirection else {
            return Err(MemError::IndirectionDisabled);
        };
        let host = alias.as_ptr() as usize;

        let mut protection = shared.protection.lock();
        let Some(mapping) = protection.mappings.get(host).copied() else {
            log::error!("no external mapping at {:p}", alias);
            return Err(MemError::UnknownMapping { host, size });
        };
        if mapping.size != size {
            log::error!(
                "external mapping at {:p} is {:#x} bytes, not {:#x}",
                alias,
                mapping.size,
                size
            );
            return Err(MemError::UnknownMapping { host, size });
        }

        for range in protection.registry.discard(mapping.guest, mapping.size) {
            shared
                .set_access(range.start(), range.size(), Permission::ReadWrite)
                .map_err(MemError::os("mprotect"))?;
        }
        // SAFETY: the alias is still owned by this mapping.
        unsafe { os::protect(alias, size, Permission::ReadWrite) }.map_err(MemError::os("mprotect"))?;

        let first = mapping.guest / shared.page_size;
        // SAFETY: the primary pages stayed committed underneath the mapping.
        unsafe { ptr::copy_nonoverlapping(alias.as_ptr(), shared.primary_page(first).as_ptr(), size) };
        for (index, slot) in indirection[first..first + size / shared.page_size]
            .iter()
            .enumerate()
        {
            slot.store(shared.primary_page(first + index).as_ptr() as usize, Ordering::Release);
        }
        protection.mappings.remove(host);
        log::debug!("unmapped external mapping at {:p}", alias);
        Ok(())
    }

    /// Number of live external mappings.
    pub fn external_mapping_count(&self) -> usize {
        self.shared.protection.lock().mappings.len()
    }
}
