//! Memory system calls of the i386 guest.
//!
//! The syscall layer hands every guest system call to [`memory_syscall`] first. The calls that
//! change the address space are served by the [`ShadowMemory`], everything else is left to the
//! caller.

use crate::{
    jit::CodeRegions,
    memory_management::{syscall_result, MapFlags, MemoryOps, MremapFlags, Prot},
    shadow::ShadowMemory,
};

/// `brk`
pub const SYS_BRK: u32 = 45;
/// `mmap`, with its arguments in guest memory
pub const SYS_MMAP: u32 = 90;
/// `munmap`
pub const SYS_MUNMAP: u32 = 91;
/// `ipc`
pub const SYS_IPC: u32 = 117;
/// `mprotect`
pub const SYS_MPROTECT: u32 = 125;
/// `mremap`
pub const SYS_MREMAP: u32 = 163;
/// `mmap2`
pub const SYS_MMAP2: u32 = 192;
/// `madvise`
pub const SYS_MADVISE: u32 = 219;

/// `ipc` call number of `shmat`
pub const IPC_SHMAT: u32 = 21;

/// Serves the system call `nr` if it changes the address space.
///
/// Returns the value for the guest's `eax`, or `None` if the call is not a memory call.
pub fn memory_syscall<M: MemoryOps, R: CodeRegions>(
    shadow: &ShadowMemory<M, R>,
    nr: u32,
    args: &[u32; 6],
) -> Option<u32> {
    let [arg1, arg2, arg3, arg4, arg5, arg6] = *args;
    let result = match nr {
        SYS_BRK => Ok(shadow.user_brk(arg1)),
        SYS_MMAP => shadow.user_old_mmap(arg1),
        SYS_MMAP2 => shadow.user_mmap(
            arg1,
            arg2,
            Prot::from_bits_retain(arg3),
            MapFlags::from_bits_retain(arg4),
            arg5 as i32,
            arg6,
        ),
        SYS_MUNMAP => shadow.user_munmap(arg1, arg2),
        SYS_MPROTECT => shadow.user_mprotect(arg1, arg2, Prot::from_bits_retain(arg3)),
        SYS_MADVISE => shadow.user_madvise(arg1, arg2, arg3 as i32),
        SYS_MREMAP => shadow.user_mremap(
            arg1,
            arg2,
            arg3,
            MremapFlags::from_bits_retain(arg4),
            arg5,
        ),
        SYS_IPC if arg1 == IPC_SHMAT => shadow.user_shmat(arg2 as i32, arg5, arg3 as i32, arg4),
        _ => return None,
    };
    log::trace!("memory syscall {} {:x?} = {:x?}", nr, args, result);
    Some(syscall_result(result))
}
