//! POSIX backend: `mmap`, `mprotect` and `madvise`.

use std::io;
use std::ptr::{self, NonNull};

use crate::Permission;

fn check(result: libc::c_int) -> io::Result<()> {
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn prot_flags(permission: Permission) -> libc::c_int {
    match permission {
        Permission::None => libc::PROT_NONE,
        Permission::ReadOnly => libc::PROT_READ,
        Permission::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    }
}

pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(4096)
}

/// Reserves `size` bytes of inaccessible address space.
pub(crate) fn reserve(size: usize) -> io::Result<NonNull<u8>> {
    #[cfg(target_os = "linux")]
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    #[cfg(not(target_os = "linux"))]
    let flags = libc::MAP_PRIVATE | libc::MAP_ANON;

    // SAFETY: an anonymous mapping at a kernel-chosen address aliases nothing.
    let ptr = unsafe { libc::mmap(ptr::null_mut(), size, libc::PROT_NONE, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr.cast()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
}

/// # Safety
///
/// `ptr` and `size` must describe a whole reservation returned by [`reserve`] that
/// nothing references any more.
pub(crate) unsafe fn release(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    check(unsafe { libc::munmap(ptr.as_ptr().cast(), size) })
}

/// Makes a page-aligned range readable and writable.
///
/// # Safety
///
/// The range must lie inside a reservation owned by the caller.
pub(crate) unsafe fn commit(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    check(unsafe {
        libc::mprotect(
            ptr.as_ptr().cast(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    })
}

/// Drops the backing of a page-aligned range and makes it inaccessible again.
///
/// # Safety
///
/// The range must lie inside a reservation owned by the caller, and nothing may
/// rely on its contents afterwards.
pub(crate) unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    let advice = libc::MADV_DONTNEED;
    #[cfg(not(target_os = "linux"))]
    let advice = libc::MADV_FREE;

    check(unsafe { libc::madvise(ptr.as_ptr().cast(), size, advice) })?;
    check(unsafe { libc::mprotect(ptr.as_ptr().cast(), size, libc::PROT_NONE) })
}

/// # Safety
///
/// The range must be page aligned and mapped. Lowering access on memory other code
/// is using makes that code fault.
pub(crate) unsafe fn protect(ptr: NonNull<u8>, size: usize, permission: Permission) -> io::Result<()> {
    check(unsafe { libc::mprotect(ptr.as_ptr().cast(), size, prot_flags(permission)) })
}

/// A non-zero identifier for the calling thread.
pub(crate) fn current_thread_id() -> usize {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() as usize }
}
