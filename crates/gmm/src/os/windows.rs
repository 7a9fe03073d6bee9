//! Windows backend: `VirtualAlloc`, `VirtualProtect` and `VirtualFree`.

use std::io;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};

use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS,
    PAGE_READONLY, PAGE_READWRITE, VirtualAlloc, VirtualFree, VirtualProtect,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows_sys::Win32::System::Threading::GetCurrentThreadId;

use crate::Permission;

fn check(ok: i32) -> io::Result<()> {
    if ok != 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn page_flags(permission: Permission) -> PAGE_PROTECTION_FLAGS {
    match permission {
        Permission::None => PAGE_NOACCESS,
        Permission::ReadOnly => PAGE_READONLY,
        Permission::ReadWrite => PAGE_READWRITE,
    }
}

pub(crate) fn page_size() -> usize {
    let mut info = MaybeUninit::<SYSTEM_INFO>::uninit();
    // SAFETY: GetSystemInfo always fills the structure.
    let info = unsafe {
        GetSystemInfo(info.as_mut_ptr());
        info.assume_init()
    };
    info.dwPageSize as usize
}

/// Reserves `size` bytes of inaccessible address space.
pub(crate) fn reserve(size: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: reserving at a system-chosen address aliases nothing.
    let ptr = unsafe { VirtualAlloc(ptr::null(), size, MEM_RESERVE, PAGE_NOACCESS) };
    NonNull::new(ptr.cast()).ok_or_else(io::Error::last_os_error)
}

/// # Safety
///
/// `ptr` must be a reservation returned by [`reserve`] that nothing references any more.
pub(crate) unsafe fn release(ptr: NonNull<u8>, _size: usize) -> io::Result<()> {
    check(unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) })
}

/// Commits a page-aligned range as readable and writable.
///
/// # Safety
///
/// The range must lie inside a reservation owned by the caller.
pub(crate) unsafe fn commit(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    let committed = unsafe { VirtualAlloc(ptr.as_ptr().cast(), size, MEM_COMMIT, PAGE_READWRITE) };
    if committed.is_null() {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// # Safety
///
/// The range must lie inside a reservation owned by the caller, and nothing may
/// rely on its contents afterwards.
pub(crate) unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    check(unsafe { VirtualFree(ptr.as_ptr().cast(), size, MEM_DECOMMIT) })
}

/// # Safety
///
/// The range must be page aligned and committed. Lowering access on memory other code
/// is using makes that code fault.
pub(crate) unsafe fn protect(ptr: NonNull<u8>, size: usize, permission: Permission) -> io::Result<()> {
    let mut previous: PAGE_PROTECTION_FLAGS = 0;
    check(unsafe {
        VirtualProtect(
            ptr.as_ptr().cast(),
            size,
            page_flags(permission),
            &mut previous,
        )
    })
}

/// A non-zero identifier for the calling thread.
pub(crate) fn current_thread_id() -> usize {
    // SAFETY: GetCurrentThreadId has no preconditions.
    unsafe { GetCurrentThreadId() as usize }
}
