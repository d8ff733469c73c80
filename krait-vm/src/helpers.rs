//! Host functions callable from bytecode.
//!
//! Helpers occupy 64 indexed slots; a program calls one with `CALL src=0`.
//! An embedder may instead register an external dispatcher which takes over
//! every helper call and receives the index as an extra argument, paired with
//! a validator the loader consults so that calls to indices the dispatcher
//! will not serve are rejected up front.

use crate::consts::MAX_HELPERS;
use crate::error::ConfigError;

use std::ffi::c_void;

/// A host helper. The five `u64` arguments come from `r1..=r5`; the final
/// pointer is the execution's context cookie (the data pointer handed to
/// `exec`). The return value lands in `r0`.
pub type Helper = extern "C" fn(u64, u64, u64, u64, u64, *mut c_void) -> u64;

/// An external dispatcher: like [`Helper`] but additionally told which
/// helper index the bytecode requested.
pub type Dispatcher = extern "C" fn(u64, u64, u64, u64, u64, u32, *mut c_void) -> u64;

/// Load-time companion of a [`Dispatcher`]: whether the dispatcher will
/// serve the given helper index.
pub type DispatcherValidator = fn(u32) -> bool;

/// Bounds-check callback: may the program touch `size` bytes at `addr`?
pub type BoundsCheck = fn(cookie: *mut c_void, addr: u64, size: u64) -> bool;

/// Data-relocation callback, consulted by program-loading front ends.
pub type DataRelocation =
    fn(cookie: *mut c_void, data: *const u8, data_len: usize, symbol: &str, offset: u64) -> u64;

/// Per-instruction debug callout: program counter, register snapshot, stack
/// snapshot, and bitmasks of the registers/stack bytes written since the
/// previous callout.
pub type DebugCallout = fn(
    cookie: *mut c_void,
    pc: u32,
    registers: &[u64; 16],
    stack: &[u8],
    register_mask: u64,
    stack_mask: &[u8],
);

/// Stack-usage calculator: bytes of stack the local function entered at `pc`
/// needs. Must return 0 or a multiple of 16, at most 512.
pub type StackUsageCalculator = fn(cookie: *mut c_void, pc: u32) -> u16;

/// One registered helper.
#[derive(Clone)]
pub(crate) struct HelperEntry {
    pub func: Helper,
    pub name: Option<String>,
}

/// The 64-slot helper table.
pub(crate) struct HelperTable {
    slots: [Option<HelperEntry>; MAX_HELPERS],
}

impl Default for HelperTable {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }
}

impl HelperTable {
    pub fn register(&mut self, idx: u32, name: Option<&str>, func: Helper) -> Result<(), ConfigError> {
        let slot = self
            .slots
            .get_mut(idx as usize)
            .ok_or(ConfigError::HelperIndexOutOfRange(idx))?;
        *slot = Some(HelperEntry {
            func,
            name: name.map(str::to_owned),
        });
        Ok(())
    }

    pub fn get(&self, idx: u32) -> Option<&HelperEntry> {
        self.slots.get(idx as usize)?.as_ref()
    }

    pub fn is_registered(&self, idx: i64) -> bool {
        usize::try_from(idx)
            .ok()
            .and_then(|idx| self.slots.get(idx))
            .map(Option::is_some)
            .unwrap_or(false)
    }

    pub fn index_by_name(&self, name: &str) -> Option<u32> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .and_then(|entry| entry.name.as_deref())
                .is_some_and(|n| n == name)
        }).map(|idx| idx as u32)
    }

    /// Raw function addresses for the JIT's tail table; empty slots are null.
    pub fn address_table(&self) -> [u64; MAX_HELPERS] {
        let mut table = [0u64; MAX_HELPERS];
        for (slot, out) in self.slots.iter().zip(table.iter_mut()) {
            if let Some(entry) = slot {
                *out = entry.func as usize as u64;
            }
        }
        table
    }

    pub fn clear(&mut self) {
        self.slots = std::array::from_fn(|_| None);
    }
}
