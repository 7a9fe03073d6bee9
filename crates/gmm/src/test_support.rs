//! Shared fixtures for the unit tests.

use core::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{AddressSpace, AddressSpaceConfig};

static FAULT_LOCK: Mutex<()> = Mutex::new(());

/// Serializes tests that own the process fault handler.
pub(crate) fn fault_lock() -> MutexGuard<'static, ()> {
    FAULT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A 64 MiB space without fault handling. Any number can exist at once.
pub(crate) fn small_space() -> AddressSpace {
    AddressSpace::new(
        AddressSpaceConfig::default()
            .with_total_size(64 << 20)
            .with_fault_handling(false),
    )
    .unwrap()
}

/// A 64 MiB space that owns the fault handler, held under [`fault_lock`].
pub(crate) struct ArmedSpace {
    space: Arc<AddressSpace>,
    _lock: MutexGuard<'static, ()>,
}

impl ArmedSpace {
    pub(crate) fn handle(&self) -> Arc<AddressSpace> {
        self.space.clone()
    }
}

impl Deref for ArmedSpace {
    type Target = AddressSpace;

    fn deref(&self) -> &AddressSpace {
        &self.space
    }
}

pub(crate) fn armed_space() -> ArmedSpace {
    let lock = fault_lock();
    let space = AddressSpace::new(AddressSpaceConfig::default().with_total_size(64 << 20)).unwrap();
    ArmedSpace {
        space: Arc::new(space),
        _lock: lock,
    }
}
