//! W^X management of the JIT output buffer.
//!
//! The buffer is mapped writable for the duration of translation, flipped to
//! read-execute before the entry pointer is handed out, and unmapped when the
//! owning machine unloads or drops. Patching a live buffer (the external
//! dispatcher slot) round-trips the protection and re-establishes
//! instruction-cache coherence over the whole range, tail included, because
//! loads and branches reach into the data tail.

use crate::error::TranslateError;
use crate::program::{errno, round_up_to_page};

use std::ptr;

pub(crate) struct ExecMemory {
    ptr: *mut u8,
    map_len: usize,
    executable: bool,
}

// The mapping is owned; the raw pointer never escapes with write permission
// while the executable flag is set.
unsafe impl Send for ExecMemory {}

impl ExecMemory {
    /// Map `capacity` writable bytes.
    pub fn new(capacity: usize) -> Result<Self, TranslateError> {
        let map_len = round_up_to_page(capacity.max(1));
        // Safety: fresh anonymous mapping.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(TranslateError::Memory { errno: errno() });
        }
        Ok(Self {
            ptr: ptr.cast(),
            map_len,
            executable: false,
        })
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        assert!(!self.executable, "buffer already sealed");
        // Safety: the mapping is writable while not sealed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.map_len) }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Flip the mapping to read-execute and make the emitted code reachable
    /// by the instruction fetcher.
    pub fn seal(&mut self) -> Result<(), TranslateError> {
        // Safety: protection change on an owned mapping.
        let rc = unsafe { libc::mprotect(self.ptr.cast(), self.map_len, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            return Err(TranslateError::Memory { errno: errno() });
        }
        flush_icache(self.ptr, self.map_len);
        self.executable = true;
        Ok(())
    }

    /// Overwrite `bytes` at `offset` in a sealed buffer.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) -> Result<(), TranslateError> {
        if offset + bytes.len() > self.map_len {
            return Err(TranslateError::NotEnoughSpace);
        }
        // Safety: protection round-trip on an owned mapping; the caller
        // serialises against concurrent execution per the machine's
        // concurrency contract.
        unsafe {
            if libc::mprotect(self.ptr.cast(), self.map_len, libc::PROT_READ | libc::PROT_WRITE) != 0 {
                return Err(TranslateError::Memory { errno: errno() });
            }
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
            if libc::mprotect(self.ptr.cast(), self.map_len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                return Err(TranslateError::Memory { errno: errno() });
            }
        }
        flush_icache(self.ptr, self.map_len);
        Ok(())
    }
}

impl Drop for ExecMemory {
    fn drop(&mut self) {
        // Safety: exclusively owned mapping.
        unsafe {
            libc::munmap(self.ptr.cast(), self.map_len);
        }
    }
}

/// Make freshly written instructions visible to the instruction fetcher.
///
/// On AArch64 data and instruction caches are not coherent; clean the data
/// cache to the point of unification and invalidate the instruction cache
/// line by line, using the line sizes advertised in `CTR_EL0`.
#[cfg(target_arch = "aarch64")]
fn flush_icache(start: *const u8, len: usize) {
    use std::arch::asm;

    // Safety: cache-maintenance instructions over an owned mapping.
    unsafe {
        let ctr: u64;
        asm!("mrs {ctr}, ctr_el0", ctr = out(reg) ctr, options(nomem, nostack));
        let dline = 4usize << ((ctr >> 16) & 0xf);
        let iline = 4usize << (ctr & 0xf);

        let begin = start as usize;
        let end = begin + len;

        let mut addr = begin & !(dline - 1);
        while addr < end {
            asm!("dc cvau, {addr}", addr = in(reg) addr, options(nostack));
            addr += dline;
        }
        asm!("dsb ish", options(nostack));

        let mut addr = begin & !(iline - 1);
        while addr < end {
            asm!("ic ivau, {addr}", addr = in(reg) addr, options(nostack));
            addr += iline;
        }
        asm!("dsb ish", options(nostack));
        asm!("isb", options(nostack));
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn flush_icache(_start: *const u8, _len: usize) {}
