//! Per-thread state shared between translated code and the runtime.
//!
//! Translated code addresses the thread context through the `fs` segment. The jump cache
//! occupies the start of the segment, the slots below follow it.

use crate::{jump_cache::JMP_CACHE_BYTES, x86::X86Register};

/// Slots of the thread context, in units of four bytes after the jump cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ThreadCtxSlot {
    /// Original address to resume at after a syscall
    UserEip = 0,
    /// Translated address a fragment exit or an emulation stub continues at
    JitEip = 1,
    /// `eax` while taint code or a resolver stub uses it
    SavedEax = 2,
    /// `ecx` while taint code or a resolver stub uses it
    SavedEcx = 3,
    /// Operand address recorded by the compare-exchange pre fix-up
    ScratchAddress = 4,
    /// Taint of the pending indirect jump target
    IjmpTaint = 5,
    /// Set by the runtime if an interrupted syscall must be restarted
    RestartSyscall = 6,
    /// Register taint, four bytes per general purpose register
    RegTaint = 8,
}

/// Size of the thread context following the jump cache
pub const THREAD_CTX_SLOTS_BYTES: u32 = 4 * (ThreadCtxSlot::RegTaint as u32 + 8);

impl ThreadCtxSlot {
    /// Offset of the slot from the `fs` base
    pub const fn offset(self) -> u32 {
        JMP_CACHE_BYTES + 4 * self as u32
    }
}

/// Offset of the taint of a 32 / 16 bit register from the `fs` base
pub const fn reg_taint_offset(reg: X86Register) -> u32 {
    ThreadCtxSlot::RegTaint.offset() + 4 * reg as u32
}

/// Offset of the taint of an 8 bit register (`al`..`bl`, `ah`..`bh`) from the `fs` base
pub const fn reg8_taint_offset(reg8: u8) -> u32 {
    ThreadCtxSlot::RegTaint.offset() + 4 * (reg8 as u32 & 3) + (reg8 as u32 >> 2)
}

/// What the signal handler knows about the interrupted thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalContext {
    /// Interrupted program counter
    pub pc: u32,
    /// An interrupted syscall has to be issued again
    pub restart_syscall: bool,
}

impl SignalContext {
    /// Context interrupted at `pc`
    pub fn new(pc: u32) -> Self {
        Self {
            pc,
            restart_syscall: false,
        }
    }
}
