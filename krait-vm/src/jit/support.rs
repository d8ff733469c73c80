//! Shared machinery of the two back-ends.
//!
//! While translating, the targets of program-control instructions are not
//! always known yet. Sites that need a later fix are recorded in one of four
//! tables — branches, literal loads, PC-relative address computations, and
//! local calls — and a single ordered pass after emission patches each site
//! once every target location is final.

use crate::error::TranslateError;
use crate::jit::JitMode;

use rand::rngs::OsRng;
use rand::RngCore;

/// Targets whose location only exists in the emitted code, not in bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpecialTarget {
    /// The shared epilogue.
    Exit,
    /// The start of the translated instruction stream.
    Enter,
    /// The indirect-call trampoline (x86-64 only).
    Retpoline,
    /// The 8-byte external-dispatcher slot in the data tail.
    ExternalDispatcher,
    /// The helper address table in the data tail.
    LoadHelperTable,
}

/// Where a recorded site should end up pointing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PatchableTarget {
    /// A named location of the emitted layout.
    Special(SpecialTarget),
    /// A location described by bytecode index and/or an explicit byte offset
    /// in the output. The explicit offset wins when both are present.
    Regular {
        /// Bytecode index, resolved through `pc_locs`.
        ebpf_pc: Option<u32>,
        /// Byte offset in the JIT output, overriding the lookup.
        jit_pc: Option<u32>,
    },
}

impl PatchableTarget {
    pub fn pc(pc: u32) -> Self {
        Self::Regular {
            ebpf_pc: Some(pc),
            jit_pc: None,
        }
    }

    pub fn jit(offset: u32) -> Self {
        Self::Regular {
            ebpf_pc: None,
            jit_pc: Some(offset),
        }
    }
}

/// One site awaiting its final target.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PatchableRelative {
    /// Byte offset of the instruction (or its displacement field) to patch.
    pub offset_loc: u32,
    /// How to compute the final target.
    pub target: PatchableTarget,
}

/// Mutable state threaded through one translation.
pub(crate) struct JitState<'a> {
    pub buf: &'a mut [u8],
    pub offset: usize,
    /// Bytecode index → byte offset of its first emitted instruction.
    pub pc_locs: Vec<u32>,
    pub jumps: Vec<PatchableRelative>,
    pub loads: Vec<PatchableRelative>,
    pub leas: Vec<PatchableRelative>,
    pub local_calls: Vec<PatchableRelative>,
    pub exit_loc: u32,
    pub entry_loc: u32,
    pub retpoline_loc: u32,
    pub dispatcher_loc: u32,
    pub helper_table_loc: u32,
    /// First error observed; emission becomes a no-op once set.
    pub status: Option<TranslateError>,
    pub mode: JitMode,
    /// Bytes of the per-function frame staging sequence, needed to aim local
    /// calls past the callee's staging code.
    pub prolog_size: u32,
    /// Entry budget per fixup table.
    table_cap: usize,
}

impl<'a> JitState<'a> {
    pub fn new(buf: &'a mut [u8], num_insts: usize, mode: JitMode) -> Self {
        Self {
            buf,
            offset: 0,
            pc_locs: vec![0; num_insts + 1],
            jumps: Vec::new(),
            loads: Vec::new(),
            leas: Vec::new(),
            local_calls: Vec::new(),
            exit_loc: 0,
            entry_loc: 0,
            retpoline_loc: 0,
            dispatcher_loc: 0,
            helper_table_loc: 0,
            status: None,
            mode,
            prolog_size: 0,
            // A single instruction can record a handful of sites (a helper
            // call with an unwind check records three).
            table_cap: num_insts.saturating_mul(4) + 64,
        }
    }

    pub fn ok(&self) -> bool {
        self.status.is_none()
    }

    pub fn fail(&mut self, error: TranslateError) {
        if self.status.is_none() {
            self.status = Some(error);
        }
    }

    pub fn emit(&mut self, bytes: &[u8]) {
        if self.status.is_some() {
            return;
        }
        if self.offset + bytes.len() > self.buf.len() {
            self.fail(TranslateError::NotEnoughSpace);
            self.offset = self.buf.len();
            return;
        }
        self.buf[self.offset..self.offset + bytes.len()].copy_from_slice(bytes);
        self.offset += bytes.len();
    }

    pub fn emit1(&mut self, byte: u8) {
        self.emit(&[byte]);
    }

    pub fn emit2(&mut self, half: u16) {
        self.emit(&half.to_le_bytes());
    }

    pub fn emit4(&mut self, word: u32) {
        self.emit(&word.to_le_bytes());
    }

    pub fn emit8(&mut self, dword: u64) {
        self.emit(&dword.to_le_bytes());
    }

    /// Record a branch site at the current offset.
    pub fn note_jump(&mut self, target: PatchableTarget) {
        if self.jumps.len() >= self.table_cap {
            self.fail(TranslateError::TooManyJumps);
            return;
        }
        let offset_loc = self.offset as u32;
        self.jumps.push(PatchableRelative { offset_loc, target });
    }

    /// Record a literal-load site at the current offset.
    pub fn note_load(&mut self, target: PatchableTarget) {
        if self.loads.len() >= self.table_cap {
            self.fail(TranslateError::TooManyLoads);
            return;
        }
        let offset_loc = self.offset as u32;
        self.loads.push(PatchableRelative { offset_loc, target });
    }

    /// Record a PC-relative address computation at the current offset.
    pub fn note_lea(&mut self, target: PatchableTarget) {
        if self.leas.len() >= self.table_cap {
            self.fail(TranslateError::TooManyLeas);
            return;
        }
        let offset_loc = self.offset as u32;
        self.leas.push(PatchableRelative { offset_loc, target });
    }

    /// Record a local-call site at the current offset.
    pub fn note_local_call(&mut self, target: PatchableTarget) {
        if self.local_calls.len() >= self.table_cap {
            self.fail(TranslateError::TooManyLocalCalls);
            return;
        }
        let offset_loc = self.offset as u32;
        self.local_calls.push(PatchableRelative { offset_loc, target });
    }

    /// Re-aim every jump recorded at `src_offset` at the current offset.
    ///
    /// Used for forward branches inside one emitted sequence, where the
    /// landing spot is only known a few instructions later.
    pub fn set_jump_target_here(&mut self, src_offset: u32) {
        let here = PatchableTarget::jit(self.offset as u32);
        for jump in self.jumps.iter_mut().filter(|j| j.offset_loc == src_offset) {
            jump.target = here;
        }
    }

    /// Final byte offset a target resolves to.
    pub fn target_loc(&self, target: &PatchableTarget) -> Result<u32, TranslateError> {
        match target {
            PatchableTarget::Special(special) => Ok(match special {
                SpecialTarget::Exit => self.exit_loc,
                SpecialTarget::Enter => self.entry_loc,
                SpecialTarget::Retpoline => self.retpoline_loc,
                SpecialTarget::ExternalDispatcher => self.dispatcher_loc,
                SpecialTarget::LoadHelperTable => self.helper_table_loc,
            }),
            PatchableTarget::Regular { ebpf_pc, jit_pc } => match (jit_pc, ebpf_pc) {
                (Some(offset), _) => Ok(*offset),
                (None, Some(pc)) => self
                    .pc_locs
                    .get(*pc as usize)
                    .copied()
                    .ok_or(TranslateError::UnresolvedPatch),
                // Neither side set is a translator bug; refuse loudly.
                (None, None) => Err(TranslateError::UnresolvedPatch),
            },
        }
    }
}

/// A fresh 64-bit blinding constant from the process-wide secure source.
///
/// `OsRng` draws from the operating system generator and needs no
/// initialisation or locking, which keeps this the only process-wide state
/// in the crate.
pub(crate) fn blinding_constant() -> u64 {
    OsRng.next_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emission_stops_at_capacity() {
        let mut buf = [0u8; 4];
        let mut state = JitState::new(&mut buf, 1, JitMode::Basic);
        state.emit4(0xaabb_ccdd);
        assert!(state.ok());
        state.emit1(0xee);
        assert_eq!(state.status, Some(TranslateError::NotEnoughSpace));
    }

    #[test]
    fn jit_offset_overrides_pc_lookup() {
        let mut buf = [0u8; 16];
        let mut state = JitState::new(&mut buf, 4, JitMode::Basic);
        state.pc_locs[2] = 8;

        let by_pc = PatchableTarget::pc(2);
        assert_eq!(state.target_loc(&by_pc).unwrap(), 8);

        let overridden = PatchableTarget::Regular {
            ebpf_pc: Some(2),
            jit_pc: Some(12),
        };
        assert_eq!(state.target_loc(&overridden).unwrap(), 12);
    }

    #[test]
    fn targetless_entry_is_rejected() {
        let mut buf = [0u8; 16];
        let state = JitState::new(&mut buf, 4, JitMode::Basic);
        let none = PatchableTarget::Regular {
            ebpf_pc: None,
            jit_pc: None,
        };
        assert_eq!(state.target_loc(&none), Err(TranslateError::UnresolvedPatch));
    }

    #[test]
    fn retargeting_by_source_offset() {
        let mut buf = [0u8; 32];
        let mut state = JitState::new(&mut buf, 4, JitMode::Basic);
        state.offset = 4;
        state.note_jump(PatchableTarget::pc(0));
        state.offset = 20;
        state.set_jump_target_here(4);
        assert_eq!(state.jumps[0].target, PatchableTarget::jit(20));
    }
}
