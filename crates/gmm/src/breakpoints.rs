//! Software breakpoints patched into guest code.
//!
//! Setting a breakpoint saves the instruction bytes at the address and overwrites them
//! with the `BKPT` encoding of the requested instruction set. Removing it writes the
//! saved bytes back. The table only owns the patch records; whoever executes guest code
//! decides what a `BKPT` means and calls [`Breakpoints::hit`].

use std::collections::BTreeMap;

use crate::{GuestAddress, GuestMemory, MemoryFault};

/// `BKPT #0` in Thumb encoding, little-endian.
const THUMB_BKPT: [u8; 2] = [0x00, 0xbe];
/// `BKPT #0` in ARM encoding, little-endian.
const ARM_BKPT: [u8; 4] = [0x70, 0x00, 0x20, 0xe1];

/// Instruction set of the code a breakpoint is patched into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionSet {
    Thumb,
    Arm,
}

impl InstructionSet {
    fn opcode(self) -> &'static [u8] {
        match self {
            InstructionSet::Thumb => &THUMB_BKPT,
            InstructionSet::Arm => &ARM_BKPT,
        }
    }
}

/// Called with the breakpoint's address each time it is hit.
pub type BreakpointCallback = Box<dyn FnMut(GuestAddress) + Send + 'static>;

struct Breakpoint {
    set: InstructionSet,
    saved: [u8; 4],
    debugger: bool,
    callback: BreakpointCallback,
}

impl Breakpoint {
    fn saved(&self) -> &[u8] {
        &self.saved[..self.set.opcode().len()]
    }
}

/// Live breakpoints, keyed by guest address.
#[derive(Default)]
pub struct Breakpoints {
    entries: BTreeMap<GuestAddress, Breakpoint>,
}

impl Breakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, address: GuestAddress) -> bool {
        self.entries.contains_key(&address)
    }

    /// Returns whether the breakpoint at `address` belongs to an attached debugger.
    pub fn is_debugger(&self, address: GuestAddress) -> Option<bool> {
        self.entries.get(&address).map(|breakpoint| breakpoint.debugger)
    }

    /// Patches a breakpoint into `memory` at `address`.
    ///
    /// A breakpoint already set at `address` is removed first, so the saved bytes are
    /// always the original code.
    pub fn add<M: GuestMemory + ?Sized>(
        &mut self,
        memory: &M,
        address: GuestAddress,
        set: InstructionSet,
        debugger: bool,
        callback: impl FnMut(GuestAddress) + Send + 'static,
    ) -> Result<(), MemoryFault> {
        self.remove(memory, address)?;

        let opcode = set.opcode();
        let mut saved = [0; 4];
        memory.read_bytes(address, &mut saved[..opcode.len()])?;
        memory.write_bytes(address, opcode)?;

        log::debug!("breakpoint set at {} ({:?})", address, set);
        self.entries.insert(
            address,
            Breakpoint {
                set,
                saved,
                debugger,
                callback: Box::new(callback),
            },
        );
        Ok(())
    }

    /// Restores the code under the breakpoint at `address`. Returns false if there was
    /// none.
    pub fn remove<M: GuestMemory + ?Sized>(
        &mut self,
        memory: &M,
        address: GuestAddress,
    ) -> Result<bool, MemoryFault> {
        let Some(breakpoint) = self.entries.get(&address) else {
            return Ok(false);
        };
        memory.write_bytes(address, breakpoint.saved())?;
        self.entries.remove(&address);
        log::debug!("breakpoint removed at {}", address);
        Ok(true)
    }

    /// Removes every breakpoint, restoring the original code.
    pub fn clear<M: GuestMemory + ?Sized>(&mut self, memory: &M) -> Result<(), MemoryFault> {
        while let Some((&address, breakpoint)) = self.entries.first_key_value() {
            memory.write_bytes(address, breakpoint.saved())?;
            self.entries.remove(&address);
        }
        Ok(())
    }

    /// Runs the callback of the breakpoint at `address`. Returns false if there is none.
    pub fn hit(&mut self, address: GuestAddress) -> bool {
        match self.entries.get_mut(&address) {
            Some(breakpoint) => {
                (breakpoint.callback)(address);
                true
            }
            None => false,
        }
    }
}

impl core::fmt::Debug for Breakpoints {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(address, breakpoint)| (address, breakpoint.set)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::small_space;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn patch_and_restore() {
        let space = small_space();
        let code = space.alloc(64, "code", GuestAddress::NULL).unwrap();
        space.write_u32(code, 0xe1a0_0000).unwrap();
        space.write_u16(code + 8, 0x4770).unwrap();

        let mut breakpoints = Breakpoints::new();
        breakpoints
            .add(&space, code, InstructionSet::Arm, false, |_| {})
            .unwrap();
        breakpoints
            .add(&space, code + 8, InstructionSet::Thumb, true, |_| {})
            .unwrap();
        assert_eq!(space.read_u32(code).unwrap(), 0xe120_0070);
        assert_eq!(space.read_u16(code + 8).unwrap(), 0xbe00);
        assert_eq!(breakpoints.is_debugger(code + 8), Some(true));

        assert!(breakpoints.remove(&space, code).unwrap());
        assert!(!breakpoints.remove(&space, code).unwrap());
        assert_eq!(space.read_u32(code).unwrap(), 0xe1a0_0000);

        breakpoints.clear(&space).unwrap();
        assert!(breakpoints.is_empty());
        assert_eq!(space.read_u16(code + 8).unwrap(), 0x4770);
    }

    #[test]
    fn resetting_keeps_original_code() {
        let space = small_space();
        let code = space.alloc(16, "code", GuestAddress::NULL).unwrap();
        space.write_u32(code, 0x1234_5678).unwrap();

        let mut breakpoints = Breakpoints::new();
        breakpoints
            .add(&space, code, InstructionSet::Thumb, false, |_| {})
            .unwrap();
        breakpoints
            .add(&space, code, InstructionSet::Arm, false, |_| {})
            .unwrap();
        assert_eq!(breakpoints.len(), 1);

        breakpoints.remove(&space, code).unwrap();
        assert_eq!(space.read_u32(code).unwrap(), 0x1234_5678);
    }

    #[test]
    fn hit_runs_callback() {
        let space = small_space();
        let code = space.alloc(16, "code", GuestAddress::NULL).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let mut breakpoints = Breakpoints::new();
        let counter = hits.clone();
        breakpoints
            .add(&space, code + 4, InstructionSet::Thumb, false, move |address| {
                assert_eq!(address, code + 4);
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(breakpoints.hit(code + 4));
        assert!(breakpoints.hit(code + 4));
        assert!(!breakpoints.hit(code));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unmapped_address_is_refused() {
        let space = small_space();
        let mut breakpoints = Breakpoints::new();
        assert_eq!(
            breakpoints.add(&space, GuestAddress::new(0x10_0000), InstructionSet::Arm, false, |_| {}),
            Err(MemoryFault::Unmapped(GuestAddress::new(0x10_0000)))
        );
        assert!(breakpoints.is_empty());
    }
}
