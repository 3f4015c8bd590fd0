//! Guest memory access and the host memory system calls.
//!
//! The translator reads guest code and installs translated code through [`GuestMemory`], the
//! shadow memory manager performs the real mappings through [`MemoryOps`]. [`HostMemory`]
//! implements both for a translator running inside the 32-bit guest process.

use bitflags::bitflags;

/// A negated kernel error number, as returned to the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[error("errno {0}")]
pub struct Errno(pub i32);

impl Errno {
    /// Out of memory, or an address range the guest may not use
    pub const ENOMEM: Errno = Errno(12);
    /// Bad address
    pub const EFAULT: Errno = Errno(14);
    /// Invalid argument
    pub const EINVAL: Errno = Errno(22);
    /// Function not implemented
    pub const ENOSYS: Errno = Errno(38);

    /// The syscall return value, `-errno`
    pub fn as_syscall_result(self) -> u32 {
        (-self.0) as u32
    }
}

/// Folds a syscall outcome into the guest's return register
pub fn syscall_result(result: Result<u32, Errno>) -> u32 {
    match result {
        Ok(value) => value,
        Err(errno) => errno.as_syscall_result(),
    }
}

bitflags! {
    /// `PROT_*`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Prot: u32 {
        /// Readable
        const READ = 0x1;
        /// Writable
        const WRITE = 0x2;
        /// Executable
        const EXEC = 0x4;
    }
}

bitflags! {
    /// `MAP_*`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Shared mapping
        const SHARED = 0x01;
        /// Private mapping
        const PRIVATE = 0x02;
        /// Exactly at the requested address
        const FIXED = 0x10;
        /// Not backed by a file
        const ANONYMOUS = 0x20;
        /// No swap reservation
        const NORESERVE = 0x4000;
    }
}

bitflags! {
    /// `MREMAP_*`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MremapFlags: u32 {
        /// The mapping may be moved
        const MAYMOVE = 0x1;
        /// Moved to exactly the requested address
        const FIXED = 0x2;
    }
}

impl Prot {
    /// User pages never execute natively, execution implies the read permission
    pub fn no_exec(self) -> Prot {
        if self.contains(Prot::EXEC) {
            (self - Prot::EXEC) | Prot::READ
        } else {
            self
        }
    }

    /// Pages mapped executable but not writable hold code
    pub fn is_code(self) -> bool {
        self.contains(Prot::EXEC) && !self.contains(Prot::WRITE)
    }
}

/// `MADV_DONTNEED`
pub const MADV_DONTNEED: i32 = 4;

/// Byte access to the guest address space
pub trait GuestMemory {
    /// Fills `buffer` from `addr`, false if any byte is not readable
    fn read(&self, addr: u32, buffer: &mut [u8]) -> bool;
    /// Stores `data` at `addr`, false if any byte is not writable
    fn write(&self, addr: u32, data: &[u8]) -> bool;

    /// Reads a little endian dword
    fn read_u32(&self, addr: u32) -> Option<u32> {
        let mut buffer = [0; 4];
        self.read(addr, &mut buffer)
            .then(|| u32::from_le_bytes(buffer))
    }
}

/// The memory system calls of the host
pub trait MemoryOps: GuestMemory {
    /// `mmap2`, `pgoffset` counts pages
    fn mmap(
        &self,
        addr: u32,
        len: u32,
        prot: Prot,
        flags: MapFlags,
        fd: i32,
        pgoffset: u32,
    ) -> Result<u32, Errno>;
    /// `munmap`
    fn munmap(&self, addr: u32, len: u32) -> Result<(), Errno>;
    /// `mprotect`
    fn mprotect(&self, addr: u32, len: u32, prot: Prot) -> Result<(), Errno>;
    /// `madvise`
    fn madvise(&self, addr: u32, len: u32, advice: i32) -> Result<(), Errno>;
    /// `mremap`, returns the new address
    fn mremap(
        &self,
        old_addr: u32,
        old_len: u32,
        new_len: u32,
        flags: MremapFlags,
        new_addr: u32,
    ) -> Result<u32, Errno>;
    /// `brk`, returns the new break
    fn brk(&self, addr: u32) -> u32;
    /// `shmat`, returns the attach address
    fn shmat(&self, shmid: i32, addr: u32, shmflg: i32) -> Result<u32, Errno>;
    /// Length of the mapping starting at `addr`
    fn mapping_len(&self, addr: u32) -> Option<u32>;
}

#[cfg(all(feature = "host-memory", target_os = "linux"))]
pub use host::HostMemory;

#[cfg(all(feature = "host-memory", target_os = "linux"))]
mod host {
    use std::io::{BufRead, BufReader};

    use super::*;

    macro_rules! libc_error_guard {
        (mmap, $($arg:expr),*) => {{
            let result = libc::mmap($($arg),*);
            if result == libc::MAP_FAILED {
                Err(last_errno())
            } else {
                Ok(result as usize as u32)
            }
        }};
        (mremap, $($arg:expr),*) => {{
            let result = libc::mremap($($arg),*);
            if result == libc::MAP_FAILED {
                Err(last_errno())
            } else {
                Ok(result as usize as u32)
            }
        }};
        (shmat, $($arg:expr),*) => {{
            let result = libc::shmat($($arg),*);
            if result as isize == -1 {
                Err(last_errno())
            } else {
                Ok(result as usize as u32)
            }
        }};
        ($function:ident, $($arg:expr),*) => {{
            if libc::$function($($arg),*) == 0 {
                Ok(())
            } else {
                Err(last_errno())
            }
        }};
    }

    fn last_errno() -> Errno {
        Errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
    }

    fn pointer(addr: u32) -> *mut libc::c_void {
        addr as usize as *mut libc::c_void
    }

    /// The memory of the process the translator runs in
    #[derive(Debug, Default, Clone, Copy)]
    pub struct HostMemory;

    impl GuestMemory for HostMemory {
        fn read(&self, addr: u32, buffer: &mut [u8]) -> bool {
            let local = libc::iovec {
                iov_base: buffer.as_mut_ptr().cast(),
                iov_len: buffer.len(),
            };
            let remote = libc::iovec {
                iov_base: pointer(addr),
                iov_len: buffer.len(),
            };
            // reading through the kernel reports unmapped memory instead of faulting
            let copied =
                unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
            copied == buffer.len() as isize
        }

        fn write(&self, addr: u32, data: &[u8]) -> bool {
            let local = libc::iovec {
                iov_base: data.as_ptr() as *mut libc::c_void,
                iov_len: data.len(),
            };
            let remote = libc::iovec {
                iov_base: pointer(addr),
                iov_len: data.len(),
            };
            let copied =
                unsafe { libc::process_vm_writev(libc::getpid(), &local, 1, &remote, 1, 0) };
            copied == data.len() as isize
        }
    }

    impl MemoryOps for HostMemory {
        fn mmap(
            &self,
            addr: u32,
            len: u32,
            prot: Prot,
            flags: MapFlags,
            fd: i32,
            pgoffset: u32,
        ) -> Result<u32, Errno> {
            let offset = (pgoffset as libc::off_t) * crate::config::PAGE_SIZE as libc::off_t;
            unsafe {
                libc_error_guard!(
                    mmap,
                    pointer(addr),
                    len as usize,
                    prot.bits() as i32,
                    flags.bits() as i32,
                    fd,
                    offset
                )
            }
        }

        fn munmap(&self, addr: u32, len: u32) -> Result<(), Errno> {
            unsafe { libc_error_guard!(munmap, pointer(addr), len as usize) }
        }

        fn mprotect(&self, addr: u32, len: u32, prot: Prot) -> Result<(), Errno> {
            unsafe {
                libc_error_guard!(mprotect, pointer(addr), len as usize, prot.bits() as i32)
            }
        }

        fn madvise(&self, addr: u32, len: u32, advice: i32) -> Result<(), Errno> {
            unsafe { libc_error_guard!(madvise, pointer(addr), len as usize, advice) }
        }

        fn mremap(
            &self,
            old_addr: u32,
            old_len: u32,
            new_len: u32,
            flags: MremapFlags,
            new_addr: u32,
        ) -> Result<u32, Errno> {
            unsafe {
                libc_error_guard!(
                    mremap,
                    pointer(old_addr),
                    old_len as usize,
                    new_len as usize,
                    flags.bits() as i32,
                    pointer(new_addr)
                )
            }
        }

        fn brk(&self, addr: u32) -> u32 {
            unsafe { libc::syscall(libc::SYS_brk, addr as usize) as usize as u32 }
        }

        fn shmat(&self, shmid: i32, addr: u32, shmflg: i32) -> Result<u32, Errno> {
            unsafe { libc_error_guard!(shmat, shmid, pointer(addr) as *const _, shmflg) }
        }

        fn mapping_len(&self, addr: u32) -> Option<u32> {
            let maps = std::fs::File::open("/proc/self/maps").ok()?;
            BufReader::new(maps).lines().map_while(Result::ok).find_map(|line| {
                let range = line.split_whitespace().next()?;
                let (start, end) = range.split_once('-')?;
                let start = u64::from_str_radix(start, 16).ok()?;
                let end = u64::from_str_radix(end, 16).ok()?;
                (start == addr as u64).then(|| (end - start) as u32)
            })
        }
    }
}
