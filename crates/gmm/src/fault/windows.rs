//! Windows fault delivery through a vectored exception handler.

use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::io;

use windows_sys::Win32::Foundation::EXCEPTION_ACCESS_VIOLATION;
use windows_sys::Win32::System::Diagnostics::Debug::{
    AddVectoredExceptionHandler, EXCEPTION_CONTINUE_EXECUTION, EXCEPTION_CONTINUE_SEARCH,
    EXCEPTION_POINTERS, RemoveVectoredExceptionHandler,
};

use super::{Access, dispatch};
use crate::{MemError, MemResult};

static HANDLE: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());

unsafe extern "system" fn vectored_exception_handler(info: *mut EXCEPTION_POINTERS) -> i32 {
    let record = unsafe { &*(*info).ExceptionRecord };
    if record.ExceptionCode != EXCEPTION_ACCESS_VIOLATION {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let access = match record.ExceptionInformation[0] {
        0 => Access::Read,
        1 => Access::Write,
        8 => Access::Execute,
        _ => return EXCEPTION_CONTINUE_SEARCH,
    };
    if dispatch(record.ExceptionInformation[1], access) {
        EXCEPTION_CONTINUE_EXECUTION
    } else {
        EXCEPTION_CONTINUE_SEARCH
    }
}

pub(super) fn install() -> MemResult<()> {
    let handle = unsafe { AddVectoredExceptionHandler(1, Some(vectored_exception_handler)) };
    if handle.is_null() {
        return Err(MemError::Os {
            op: "AddVectoredExceptionHandler",
            source: io::Error::last_os_error(),
        });
    }
    HANDLE.store(handle, Ordering::SeqCst);
    Ok(())
}

pub(super) fn uninstall() {
    let handle = HANDLE.swap(ptr::null_mut(), Ordering::SeqCst);
    if !handle.is_null() && unsafe { RemoveVectoredExceptionHandler(handle) } == 0 {
        log::error!("failed to remove vectored exception handler");
    }
}
