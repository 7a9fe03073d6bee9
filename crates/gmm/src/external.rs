//! Host buffers aliased over guest ranges.
//!
//! While a mapping is live, the page indirection table points the guest range at a
//! caller-owned host buffer. The table here records each mapping by its host address so
//! faults on the alias can be translated back to guest addresses.

use std::collections::BTreeMap;

use crate::Permission;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExternalMapping {
    pub(crate) guest: usize,
    pub(crate) size: usize,
    /// Access applied to the alias while it is mapped.
    pub(crate) permission: Permission,
}

/// Live external mappings, keyed by the alias's host address.
#[derive(Debug, Default)]
pub(crate) struct ExternalMappingTable {
    by_host: BTreeMap<usize, ExternalMapping>,
}

fn overlap(a_start: usize, a_size: usize, b_start: usize, b_size: usize) -> bool {
    a_start < b_start + b_size && b_start < a_start + a_size
}

impl ExternalMappingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_host.len()
    }

    /// Returns true if a new mapping of `size` bytes from `host` onto `guest` would
    /// overlap an existing one on either side.
    pub(crate) fn overlaps(&self, host: usize, guest: usize, size: usize) -> bool {
        self.by_host.iter().any(|(&mapped_host, mapping)| {
            overlap(mapped_host, mapping.size, host, size)
                || overlap(mapping.guest, mapping.size, guest, size)
        })
    }

    /// Returns true if any mapping covers part of the guest range.
    pub(crate) fn covers_guest(&self, guest: usize, size: usize) -> bool {
        self.by_host
            .values()
            .any(|mapping| overlap(mapping.guest, mapping.size, guest, size))
    }

    /// Returns the mapping whose guest range contains `guest`.
    pub(crate) fn find_guest(&self, guest: usize) -> Option<&ExternalMapping> {
        self.by_host
            .values()
            .find(|mapping| overlap(mapping.guest, mapping.size, guest, 1))
    }

    pub(crate) fn insert(&mut self, host: usize, mapping: ExternalMapping) {
        self.by_host.insert(host, mapping);
    }

    pub(crate) fn get(&self, host: usize) -> Option<&ExternalMapping> {
        self.by_host.get(&host)
    }

    pub(crate) fn remove(&mut self, host: usize) -> Option<ExternalMapping> {
        self.by_host.remove(&host)
    }

    /// Translates a host address inside any alias back to its guest offset.
    pub(crate) fn resolve(&self, host: usize) -> Option<usize> {
        let (&mapped_host, mapping) = self.by_host.range(..=host).next_back()?;
        let offset = host - mapped_host;
        (offset < mapping.size).then_some(mapping.guest + offset)
    }
}
