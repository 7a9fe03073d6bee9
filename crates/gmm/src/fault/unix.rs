//! POSIX fault delivery through `SIGSEGV` and `SIGBUS`.
//!
//! Only async-signal-safe work happens in the handler. Unhandled faults go to the
//! previously installed action, or to the default action, which terminates the process
//! when the faulting instruction re-executes.

use core::ffi::{c_int, c_void};
use core::{mem, ptr};
use std::io;

use super::{Access, dispatch};
use crate::{MemError, MemResult};

const SIGNALS: [c_int; 2] = [libc::SIGSEGV, libc::SIGBUS];

/// Actions that were installed before ours, indexed like [`SIGNALS`].
static PREVIOUS: spin::Mutex<[Option<libc::sigaction>; 2]> = spin::Mutex::new([None; 2]);

extern "C" fn handle_signal(signal: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    // SAFETY: the kernel hands SA_SIGINFO handlers valid siginfo and ucontext pointers.
    let (host, access) = unsafe { (fault_address(info), access_kind(context)) };
    if dispatch(host, access) {
        return;
    }
    // SAFETY: same pointers, forwarded unchanged.
    unsafe { forward(signal, info, context) };
}

unsafe fn forward(signal: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    let index = SIGNALS.iter().position(|&s| s == signal);
    let previous = PREVIOUS
        .try_lock()
        .and_then(|previous| index.and_then(|i| previous[i]));

    match previous {
        Some(action)
            if action.sa_sigaction != libc::SIG_DFL && action.sa_sigaction != libc::SIG_IGN =>
        {
            if action.sa_flags & libc::SA_SIGINFO != 0 {
                let handler: extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) =
                    unsafe { mem::transmute(action.sa_sigaction) };
                handler(signal, info, context);
            } else {
                let handler: extern "C" fn(c_int) = unsafe { mem::transmute(action.sa_sigaction) };
                handler(signal);
            }
        }
        _ => {
            let mut default: libc::sigaction = unsafe { mem::zeroed() };
            default.sa_sigaction = libc::SIG_DFL;
            unsafe { libc::sigaction(signal, &raw const default, ptr::null_mut()) };
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
    unsafe { (*info).si_addr() as usize }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
    unsafe { (*info).si_addr as usize }
}

/// Page-fault error code bits pushed by x86 CPUs.
#[cfg(target_arch = "x86_64")]
const PF_WRITE: u64 = 1 << 1;
#[cfg(target_arch = "x86_64")]
const PF_INSTRUCTION: u64 = 1 << 4;

#[cfg(target_arch = "x86_64")]
fn decode_x86_error(err: u64) -> Access {
    if err & PF_INSTRUCTION != 0 {
        Access::Execute
    } else if err & PF_WRITE != 0 {
        Access::Write
    } else {
        Access::Read
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn access_kind(context: *mut c_void) -> Access {
    let ucontext = unsafe { &*context.cast::<libc::ucontext_t>() };
    decode_x86_error(ucontext.uc_mcontext.gregs[libc::REG_ERR as usize] as u64)
}

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
unsafe fn access_kind(context: *mut c_void) -> Access {
    let mcontext = unsafe { &*(*context.cast::<libc::ucontext_t>()).uc_mcontext };
    decode_x86_error(u64::from(mcontext.__es.__err))
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
unsafe fn access_kind(context: *mut c_void) -> Access {
    const EC_INSTRUCTION_ABORT_LOWER: u32 = 0x20;
    const EC_INSTRUCTION_ABORT_SAME: u32 = 0x21;
    const ESR_WNR: u32 = 1 << 6;

    let mcontext = unsafe { &*(*context.cast::<libc::ucontext_t>()).uc_mcontext };
    let esr = mcontext.__es.__esr;
    match esr >> 26 {
        EC_INSTRUCTION_ABORT_LOWER | EC_INSTRUCTION_ABORT_SAME => Access::Execute,
        _ if esr & ESR_WNR != 0 => Access::Write,
        _ => Access::Read,
    }
}

/// Hosts without a decoder report every fault as a write. Read faults on protected
/// pages then also un-arm, which only costs an extra callback.
#[cfg(not(any(
    all(target_os = "linux", target_arch = "x86_64"),
    all(target_os = "macos", target_arch = "x86_64"),
    all(target_os = "macos", target_arch = "aarch64"),
)))]
unsafe fn access_kind(_context: *mut c_void) -> Access {
    Access::Write
}

pub(super) fn install() -> MemResult<()> {
    let mut previous = PREVIOUS.lock();

    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = handle_signal as usize;
    // Callbacks run inside the handler and may fault on other protected ranges.
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_NODEFER;
    unsafe { libc::sigemptyset(&raw mut action.sa_mask) };

    for (index, &signal) in SIGNALS.iter().enumerate() {
        let mut old: libc::sigaction = unsafe { mem::zeroed() };
        if unsafe { libc::sigaction(signal, &raw const action, &raw mut old) } != 0 {
            let source = io::Error::last_os_error();
            restore(&mut previous);
            return Err(MemError::Os {
                op: "sigaction",
                source,
            });
        }
        previous[index] = Some(old);
    }
    Ok(())
}

pub(super) fn uninstall() {
    restore(&mut PREVIOUS.lock());
}

fn restore(previous: &mut [Option<libc::sigaction>; 2]) {
    for (slot, &signal) in previous.iter_mut().zip(SIGNALS.iter()) {
        if let Some(old) = slot.take()
            && unsafe { libc::sigaction(signal, &raw const old, ptr::null_mut()) } != 0
        {
            log::error!(
                "failed to restore handler for signal {}: {}",
                signal,
                io::Error::last_os_error()
            );
        }
    }
}
