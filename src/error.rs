//! Fatal conditions of the translator and the shadow memory manager.
//!
//! None of these are recoverable: they indicate either a gap in the opcode tables, a broken
//! assumption about the shape of translated code, or an address space that cannot be set up.
//! They are reported through [`fatal`], which logs and aborts.

/// Error definitions
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JitError {
    /// The classifier produced an action the translator cannot emit
    #[error("unimplemented action {1} at {0:#x}")]
    UnimplementedAction(u32, &'static str),
    /// An instruction of a translated op runs past the end of the op
    #[error("decoding cut off inside translated code at {0:#x}")]
    DecodeCutoff(u32),
    /// An instruction of a translated op is longer than any valid instruction
    #[error("instruction at {0:#x} sticks out of the decoding window")]
    InstructionSticksOut(u32),
    /// The interrupted pc is not at an instruction boundary of the translated op
    #[error("fragment entry point {0:#x} not in translated code")]
    FragmentEntryUnreachable(u32),
    /// A fragment branch lands inside an instruction of the slice
    #[error("fragment branch to {0:#x} lands inside an instruction")]
    FragmentBranchMisaligned(u32),
    /// The fragment does not fit into the per-thread fragment page
    #[error("fragment of {0} bytes does not fit the fragment page")]
    FragmentTooLarge(usize),
    /// Translated code contains a control transfer the fragment builder does not know
    #[error("unexpected translated code at {0:#x}")]
    UnexpectedTranslatedCode(u32),
    /// The signal handler could not reach an op boundary
    #[error("could not finish instruction at {0:#x}")]
    UnfinishedInstruction(u32),
    /// Guest code of a code map could not be read
    #[error("code at {0:#x} is not readable")]
    UnreadableCode(u32),
    /// A direct jump targets an address the block translation never reached
    #[error("jump to {0:#x} left unresolved")]
    UnresolvedJump(u32),
    /// Translated code could not be written into the translated code range
    #[error("could not install translated code at {0:#x}")]
    CodeInstallFailed(u32),
    /// The translated code range has no room for another region
    #[error("exhausted JIT address space ({0:#x} bytes requested)")]
    ExhaustedJitSpace(u32),
    /// Mirroring a user mapping into the shadow range failed
    #[error("shadow mapping of {addr:#x}+{len:#x} failed: errno {errno}")]
    ShadowMapFailed {
        /// Start of the user range
        addr: u32,
        /// Length of the user range
        len: u32,
        /// Error reported by the memory backend
        errno: i32,
    },
    /// Reserving one of the fixed address ranges failed
    #[error("memory initialisation failed: {0}")]
    MemoryInitFailed(&'static str),
    /// Libc calls returned an error
    #[error("libc error code {0}")]
    LibcInvocationFailed(i32),
}

/// Logs `err` and terminates.
///
/// Release builds are compiled with `panic = "abort"`, so this never unwinds into the guest.
#[cold]
#[track_caller]
pub fn fatal(err: JitError) -> ! {
    log::error!("fatal: {err}");
    panic!("{err}")
}
