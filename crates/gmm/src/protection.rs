//! Write-detection bookkeeping.
//!
//! A [`ProtectionRegistry`] maps page-aligned guest ranges to the callbacks armed on them.
//! Ranges that touch or overlap are merged when a new protection is added, so every page
//! belongs to at most one range and a single fault un-arms the whole merged extent.
//!
//! The registry is pure bookkeeping. Changing host page permissions is done by the
//! [`AddressSpace`](crate::AddressSpace), which owns both the registry and the lock
//! guarding it.

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::BTreeMap;

use crate::{GuestAddress, os};

/// Access allowed on a guest range.
///
/// Ordered from most to least restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Permission {
    None,
    ReadOnly,
    ReadWrite,
}

impl Permission {
    /// Returns true if an access of the given kind is allowed.
    pub fn allows(self, is_write: bool) -> bool {
        match self {
            Permission::None => false,
            Permission::ReadOnly => !is_write,
            Permission::ReadWrite => true,
        }
    }
}

/// Callback fired once when a protected range is hit.
///
/// Receives the faulting guest address and whether the access was a write.
pub type ProtectCallback = Box<dyn FnOnce(GuestAddress, bool) + Send + 'static>;

struct ProtectBlock {
    start: usize,
    size: usize,
    sequence: u64,
    callback: ProtectCallback,
}

impl ProtectBlock {
    fn contains(&self, address: usize) -> bool {
        address >= self.start && address - self.start < self.size
    }
}

/// A merged, page-aligned guest range with the callbacks armed on it.
pub(crate) struct ProtectedRange {
    start: usize,
    size: usize,
    permission: Permission,
    blocks: Vec<ProtectBlock>,
}

impl ProtectedRange {
    pub(crate) fn start(&self) -> usize {
        self.start
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn end(&self) -> usize {
        self.start + self.size
    }

    pub(crate) fn permission(&self) -> Permission {
        self.permission
    }

    /// Invokes, in registration order, every callback whose exact block contains
    /// `address`. The remaining callbacks are dropped unfired.
    pub(crate) fn fire(self, address: usize, is_write: bool) {
        let Some(guest) = GuestAddress::from_offset(address) else {
            return;
        };
        for block in self.blocks {
            if block.contains(address) {
                (block.callback)(guest, is_write);
            }
        }
    }
}

/// The set of armed ranges, keyed by start offset.
#[derive(Default)]
pub(crate) struct ProtectionRegistry {
    ranges: BTreeMap<usize, ProtectedRange>,
    next_sequence: u64,
}

impl ProtectionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Arms `callback` on the block `[block_start, block_start + block_size)`.
    ///
    /// `extent` is the block widened to page boundaries. Every existing range that
    /// touches or overlaps it is absorbed, and the merged range keeps the most
    /// restrictive permission. Returns the merged range's start, size and permission.
    pub(crate) fn insert(
        &mut self,
        extent: (usize, usize),
        block_start: usize,
        block_size: usize,
        permission: Permission,
        callback: ProtectCallback,
    ) -> (usize, usize, Permission) {
        let (mut start, size) = extent;
        let mut end = start + size;
        let mut permission = permission;

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let mut blocks = vec![ProtectBlock {
            start: block_start,
            size: block_size,
            sequence,
            callback,
        }];

        let absorbed: Vec<usize> = self
            .ranges
            .range(..=end)
            .rev()
            .take_while(|(_, range)| range.end() >= start)
            .map(|(key, _)| *key)
            .collect();
        for key in absorbed {
            if let Some(range) = self.ranges.remove(&key) {
                start = start.min(range.start);
                end = end.max(range.end());
                permission = permission.min(range.permission);
                blocks.extend(range.blocks);
            }
        }
        blocks.sort_by_key(|block| block.sequence);

        self.ranges.insert(
            start,
            ProtectedRange {
                start,
                size: end - start,
                permission,
                blocks,
            },
        );
        (start, end - start, permission)
    }

    /// Returns the range containing `address`.
    pub(crate) fn find(&self, address: usize) -> Option<&ProtectedRange> {
        self.ranges
            .range(..=address)
            .next_back()
            .map(|(_, range)| range)
            .filter(|range| address < range.end())
    }

    /// Removes and returns the range containing `address`.
    pub(crate) fn take(&mut self, address: usize) -> Option<ProtectedRange> {
        let start = self.find(address)?.start;
        self.ranges.remove(&start)
    }

    /// Returns true if any range overlaps `[start, start + size)`.
    pub(crate) fn intersects(&self, start: usize, size: usize) -> bool {
        self.ranges
            .range(..start.saturating_add(size))
            .next_back()
            .is_some_and(|(_, range)| range.end() > start)
    }

    /// Removes every range overlapping `[start, start + size)` without firing callbacks.
    pub(crate) fn discard(&mut self, start: usize, size: usize) -> Vec<ProtectedRange> {
        let keys: Vec<usize> = self
            .ranges
            .range(..start.saturating_add(size))
            .rev()
            .take_while(|(_, range)| range.end() > start)
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter()
            .filter_map(|key| self.ranges.remove(&key))
            .collect()
    }
}

/// A spin lock that remembers which thread holds it.
///
/// Fault handlers run on whichever thread touched the page. If that thread already
/// holds the lock, because the fault came from inside a protection update, blocking
/// would deadlock; [`ProtectLock::lock_from_trap`] reports that case instead.
pub(crate) struct ProtectLock<T> {
    owner: AtomicUsize,
    inner: spin::Mutex<T>,
}

impl<T> ProtectLock<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self {
            owner: AtomicUsize::new(0),
            inner: spin::Mutex::new(value),
        }
    }

    pub(crate) fn lock(&self) -> ProtectGuard<'_, T> {
        let guard = self.inner.lock();
        self.owner.store(os::current_thread_id(), Ordering::Relaxed);
        ProtectGuard {
            owner: &self.owner,
            guard,
        }
    }

    /// Locks from a fault handler. Returns `None` if the calling thread already holds
    /// the lock.
    pub(crate) fn lock_from_trap(&self) -> Option<ProtectGuard<'_, T>> {
        if self.owner.load(Ordering::Relaxed) == os::current_thread_id() {
            return None;
        }
        Some(self.lock())
    }
}

pub(crate) struct ProtectGuard<'a, T> {
    owner: &'a AtomicUsize,
    guard: spin::MutexGuard<'a, T>,
}

impl<T> Deref for ProtectGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ProtectGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for ProtectGuard<'_, T> {
    fn drop(&mut self) {
        // Cleared before the inner guard unlocks.
        self.owner.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    const PAGE: usize = 0x1000;

    fn recorder() -> (Arc<Mutex<Vec<(u32, u32, bool)>>>, impl Fn(u32) -> ProtectCallback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |id: u32| -> ProtectCallback {
            let sink = sink.clone();
            Box::new(move |address: GuestAddress, is_write: bool| {
                sink.lock().unwrap().push((id, address.as_u32(), is_write));
            })
        };
        (log, make)
    }

    #[test]
    fn permission_allows() {
        assert!(!Permission::None.allows(false));
        assert!(Permission::ReadOnly.allows(false));
        assert!(!Permission::ReadOnly.allows(true));
        assert!(Permission::ReadWrite.allows(true));
    }

    #[test]
    fn touching_ranges_merge() {
        let (_, make) = recorder();
        let mut registry = ProtectionRegistry::new();
        registry.insert((PAGE, PAGE), PAGE, PAGE, Permission::ReadOnly, make(0));
        let merged = registry.insert((2 * PAGE, PAGE), 2 * PAGE, PAGE, Permission::ReadOnly, make(1));

        assert_eq!(merged, (PAGE, 2 * PAGE, Permission::ReadOnly));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn disjoint_ranges_stay_separate() {
        let (_, make) = recorder();
        let mut registry = ProtectionRegistry::new();
        registry.insert((PAGE, PAGE), PAGE, 16, Permission::ReadOnly, make(0));
        registry.insert((4 * PAGE, PAGE), 4 * PAGE, 16, Permission::ReadOnly, make(1));

        assert_eq!(registry.len(), 2);
        assert!(registry.find(3 * PAGE).is_none());
        assert_eq!(registry.find(4 * PAGE + 8).map(|r| r.start()), Some(4 * PAGE));
    }

    #[test]
    fn merge_bridges_several_ranges() {
        let (_, make) = recorder();
        let mut registry = ProtectionRegistry::new();
        registry.insert((PAGE, PAGE), PAGE, 4, Permission::ReadOnly, make(0));
        registry.insert((3 * PAGE, PAGE), 3 * PAGE, 4, Permission::None, make(1));
        let merged = registry.insert((PAGE, 3 * PAGE), 2 * PAGE, 4, Permission::ReadOnly, make(2));

        assert_eq!(merged, (PAGE, 3 * PAGE, Permission::None));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn fire_runs_only_containing_blocks_in_order() {
        let (log, make) = recorder();
        let mut registry = ProtectionRegistry::new();
        let a = 0x8100_0000usize;
        registry.insert((a, PAGE), a, 15, Permission::ReadOnly, make(0));
        registry.insert((a, PAGE), a + 5, 15, Permission::ReadOnly, make(1));
        registry.insert((a, PAGE), a + 100, 4, Permission::ReadOnly, make(2));

        let range = registry.take(a + 7).expect("range armed");
        assert_eq!(registry.len(), 0);
        range.fire(a + 7, true);

        let log = log.lock().unwrap();
        assert_eq!(*log, vec![(0, a as u32 + 7, true), (1, a as u32 + 7, true)]);
    }

    #[test]
    fn discard_drops_callbacks_unfired() {
        let (log, make) = recorder();
        let mut registry = ProtectionRegistry::new();
        registry.insert((PAGE, PAGE), PAGE, 8, Permission::ReadOnly, make(0));
        registry.insert((8 * PAGE, PAGE), 8 * PAGE, 8, Permission::ReadOnly, make(1));

        assert!(registry.intersects(0, 2 * PAGE));
        assert!(!registry.intersects(2 * PAGE, PAGE));
        let removed = registry.discard(0, 2 * PAGE);
        assert_eq!(removed.len(), 1);
        drop(removed);

        assert_eq!(registry.len(), 1);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn trap_lock_detects_reentry() {
        let lock = ProtectLock::new(0u32);
        {
            let _held = lock.lock();
            assert!(lock.lock_from_trap().is_none());
        }
        let mut guard = lock.lock_from_trap().expect("not held");
        *guard += 1;
        drop(guard);
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn trap_lock_waits_for_other_threads() {
        let lock = Arc::new(ProtectLock::new(0u32));
        let guard = lock.lock();
        let other = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                let mut guard = lock.lock_from_trap().expect("other thread is not the owner");
                *guard += 1;
            })
        };
        drop(guard);
        other.join().unwrap();
        assert_eq!(*lock.lock(), 1);
    }
}
