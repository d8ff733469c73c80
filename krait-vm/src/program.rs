//! Storage for the loaded instruction copy.
//!
//! With the read-only-bytecode flag on (the default) the defensive copy
//! lives in its own mapping which is re-protected to read-only once
//! validation has passed, so that nothing in the host process can rewrite a
//! vetted program behind the machine's back.

use crate::error::TranslateError;

use krait_asm::Instruction;

use std::{mem, ptr, slice};

pub(crate) enum ProgramStore {
    Plain(Vec<Instruction>),
    ReadOnly(ReadOnlyStore),
}

impl ProgramStore {
    /// Copy `insts`, sealing the copy when `readonly` is set.
    pub fn new(insts: Vec<Instruction>, readonly: bool) -> Self {
        if readonly {
            match ReadOnlyStore::new(&insts) {
                Ok(store) => return Self::ReadOnly(store),
                // Out of address space; fall back to the plain allocation
                // rather than failing the load.
                Err(_) => {}
            }
        }
        Self::Plain(insts)
    }

    pub fn as_slice(&self) -> &[Instruction] {
        match self {
            Self::Plain(insts) => insts,
            Self::ReadOnly(store) => store.as_slice(),
        }
    }
}

pub(crate) struct ReadOnlyStore {
    ptr: *mut Instruction,
    len: usize,
    map_len: usize,
}

// The mapping is immutable after construction and freed on drop only.
unsafe impl Send for ReadOnlyStore {}
unsafe impl Sync for ReadOnlyStore {}

impl ReadOnlyStore {
    fn new(insts: &[Instruction]) -> Result<Self, TranslateError> {
        let byte_len = insts.len().max(1) * mem::size_of::<Instruction>();
        let map_len = round_up_to_page(byte_len);

        // Safety: anonymous private mapping, never handed out mutably.
        unsafe {
            let ptr = libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(TranslateError::Memory {
                    errno: errno(),
                });
            }
            let ptr = ptr.cast::<Instruction>();
            ptr::copy_nonoverlapping(insts.as_ptr(), ptr, insts.len());
            if libc::mprotect(ptr.cast(), map_len, libc::PROT_READ) != 0 {
                let err = TranslateError::Memory {
                    errno: errno(),
                };
                libc::munmap(ptr.cast(), map_len);
                return Err(err);
            }
            Ok(Self {
                ptr,
                len: insts.len(),
                map_len,
            })
        }
    }

    fn as_slice(&self) -> &[Instruction] {
        // Safety: the mapping holds `len` initialised instructions.
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for ReadOnlyStore {
    fn drop(&mut self) {
        // Safety: exclusively owned mapping.
        unsafe {
            libc::munmap(self.ptr.cast(), self.map_len);
        }
    }
}

pub(crate) fn round_up_to_page(len: usize) -> usize {
    let page = page_size();
    (len + page - 1) & !(page - 1)
}

pub(crate) fn page_size() -> usize {
    // Safety: trivially safe libc call.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        4096
    } else {
        page as usize
    }
}

pub(crate) fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
