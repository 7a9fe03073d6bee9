//! Bridge from host access faults to the protection registry.
//!
//! Only one [`FaultBridge`] can be installed per process. The platform handler looks the
//! active address space up through a global pointer, asks it to resolve the fault, and
//! otherwise hands the fault on to whatever handler was installed before.
//!
//! Nothing on the handler path logs or allocates: it runs in signal context.

use core::hint;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::address_space::Shared;
use crate::{MemError, MemResult};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as backend;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as backend;

/// The kind of access that faulted, as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
    Execute,
}

static ACTIVE: AtomicPtr<Shared> = AtomicPtr::new(ptr::null_mut());
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// The installed process-wide fault handler. Dropping it restores the previous handler
/// once no fault is being handled against the address space any more.
#[derive(Debug)]
pub(crate) struct FaultBridge {
    _installed: (),
}

impl FaultBridge {
    /// Routes host faults to `shared`.
    ///
    /// # Safety
    ///
    /// `shared` must stay at the same address, and alive, until the returned bridge
    /// is dropped.
    pub(crate) unsafe fn install(shared: &Shared) -> MemResult<Self> {
        let target = ptr::from_ref(shared).cast_mut();
        if ACTIVE
            .compare_exchange(ptr::null_mut(), target, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::error!("fault handler already owned by another address space");
            return Err(MemError::HandlerBusy);
        }

        if let Err(err) = backend::install() {
            ACTIVE.store(ptr::null_mut(), Ordering::SeqCst);
            log::error!("failed to install fault handler: {}", err);
            return Err(err);
        }

        log::debug!("fault handler installed");
        Ok(Self { _installed: () })
    }
}

impl Drop for FaultBridge {
    fn drop(&mut self) {
        backend::uninstall();
        ACTIVE.store(ptr::null_mut(), Ordering::SeqCst);
        while IN_FLIGHT.load(Ordering::SeqCst) != 0 {
            hint::spin_loop();
        }
        log::debug!("fault handler removed");
    }
}

/// Offers a fault to the active address space. Returns true if it was one of ours and
/// the access can be retried.
fn dispatch(host: usize, access: Access) -> bool {
    if access == Access::Execute {
        return false;
    }

    IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
    let shared = ACTIVE.load(Ordering::SeqCst);
    // SAFETY: the bridge keeps the pointee alive until IN_FLIGHT drains.
    let handled = unsafe { shared.as_ref() }
        .is_some_and(|shared| shared.handle_fault(host, access == Access::Write));
    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
    handled
}
