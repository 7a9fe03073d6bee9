//! Construction parameters for [`AddressSpace`](crate::AddressSpace).

use crate::{MemError, MemResult};

/// Size of the guest address space: the full 32-bit range.
pub const GUEST_SPACE_SIZE: usize = 1 << 32;

/// Smallest page size the manager will use, whatever the host reports.
pub const MIN_PAGE_SIZE: usize = 4096;

/// Configuration for a guest address space.
///
/// The defaults describe the production layout: a 4 GiB reservation, 4 KiB minimum
/// pages, the page indirection table, and the process-wide fault handler. Tests that
/// do not arm protections turn `fault_handling` off so several spaces can coexist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpaceConfig {
    pub total_size: usize,
    pub min_page_size: usize,
    pub page_indirection: bool,
    pub fault_handling: bool,
}

impl Default for AddressSpaceConfig {
    fn default() -> Self {
        Self {
            total_size: GUEST_SPACE_SIZE,
            min_page_size: MIN_PAGE_SIZE,
            page_indirection: true,
            fault_handling: true,
        }
    }
}

impl AddressSpaceConfig {
    pub fn with_total_size(mut self, total_size: usize) -> Self {
        self.total_size = total_size;
        self
    }

    pub fn with_min_page_size(mut self, min_page_size: usize) -> Self {
        self.min_page_size = min_page_size;
        self
    }

    pub fn with_page_indirection(mut self, enabled: bool) -> Self {
        self.page_indirection = enabled;
        self
    }

    pub fn with_fault_handling(mut self, enabled: bool) -> Self {
        self.fault_handling = enabled;
        self
    }

    /// Resolves the page size for a host that reports `host_page_size`, and checks
    /// that the total size is a usable multiple of it.
    pub(crate) fn page_size(&self, host_page_size: usize) -> MemResult<usize> {
        if !self.min_page_size.is_power_of_two() {
            return Err(MemError::InvalidConfig(
                "minimum page size must be a power of two",
            ));
        }
        if self.total_size == 0 || self.total_size > GUEST_SPACE_SIZE {
            return Err(MemError::InvalidConfig(
                "total size must be between one page and 4 GiB",
            ));
        }

        let page_size = host_page_size.max(self.min_page_size);
        if self.total_size % page_size != 0 || self.total_size / page_size < 2 {
            return Err(MemError::InvalidConfig(
                "total size must be a multiple of the page size and hold at least two pages",
            ));
        }
        Ok(page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_full_guest_space() {
        let config = AddressSpaceConfig::default();
        assert_eq!(config.total_size, 1 << 32);
        assert_eq!(config.min_page_size, 4096);
        assert!(config.page_indirection);
        assert!(config.fault_handling);
    }

    #[test]
    fn page_size_is_at_least_the_minimum() {
        let config = AddressSpaceConfig::default();
        assert_eq!(config.page_size(4096).unwrap(), 4096);
        assert_eq!(config.page_size(16384).unwrap(), 16384);
        assert_eq!(config.page_size(1024).unwrap(), 4096);
    }

    #[test]
    fn rejects_bad_sizes() {
        let config = AddressSpaceConfig::default().with_total_size(4096 * 3 + 1);
        assert!(matches!(config.page_size(4096), Err(MemError::InvalidConfig(_))));

        let config = AddressSpaceConfig::default().with_total_size(4096);
        assert!(matches!(config.page_size(4096), Err(MemError::InvalidConfig(_))));

        let config = AddressSpaceConfig::default().with_min_page_size(3000);
        assert!(matches!(config.page_size(4096), Err(MemError::InvalidConfig(_))));
    }
}
