//! Shadow memory manager.
//!
//! Every page the guest maps at `A` is mirrored by a zero-filled taint page at
//! `A + taint_offset`. The user mapping itself never gets `PROT_EXEC`: translated code is the
//! only code that runs, and pages mapped executable and read-only are registered as code with
//! the translator instead.

#[cfg(not(feature = "shuttle-test"))]
use std::sync::{Mutex, MutexGuard};

#[cfg(feature = "shuttle-test")]
use shuttle::sync::{Mutex, MutexGuard};

use crate::{
    config::{page_next, MemoryLayout, PAGE_MASK, PAGE_SIZE},
    error::{fatal, JitError},
    jit::CodeRegions,
    memory_management::{Errno, MapFlags, MemoryOps, MremapFlags, Prot, MADV_DONTNEED},
};

/// Lowest program break the guest can set
pub const DEFAULT_BRK_MIN: u32 = 0x10000;

/// Protection of shadow pages without a user mapping
const SHADOW_DEFAULT_PROT: Prot = Prot::empty();

#[derive(Debug)]
struct Brk {
    current: u32,
    min: u32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fixed_anonymous() -> MapFlags {
    MapFlags::PRIVATE | MapFlags::FIXED | MapFlags::ANONYMOUS
}

/// Mirrors the guest's memory system calls into the shadow range
pub struct ShadowMemory<M: MemoryOps, R: CodeRegions> {
    memory: M,
    code: R,
    layout: MemoryLayout,
    /// Held around user mappings and while `mremap` leaves a hole in the shadow range
    map_lock: Mutex<()>,
    brk: Mutex<Brk>,
}

impl<M: MemoryOps, R: CodeRegions> ShadowMemory<M, R> {
    /// Creates the manager, [`ShadowMemory::init`] reserves the address ranges
    pub fn new(layout: MemoryLayout, memory: M, code: R) -> Self {
        Self {
            memory,
            code,
            layout,
            map_lock: Mutex::new(()),
            brk: Mutex::new(Brk {
                current: DEFAULT_BRK_MIN,
                min: DEFAULT_BRK_MIN,
            }),
        }
    }

    /// The memory backend
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// The code region registry
    pub fn code_regions(&self) -> &R {
        &self.code
    }

    /// Reserves the shadow range and the translated code range
    pub fn init(&self) {
        let shadow_start = self.layout.taint_offset;
        let flags = fixed_anonymous() | MapFlags::NORESERVE;
        let reservations = [
            // the shadow of page zero stays inaccessible
            (shadow_start, PAGE_SIZE, Prot::empty(), "shadow guard page"),
            (
                shadow_start + PAGE_SIZE,
                self.layout.user_end - PAGE_SIZE,
                SHADOW_DEFAULT_PROT,
                "shadow range",
            ),
            (
                self.layout.jit_start,
                self.layout.jit_size,
                Prot::READ | Prot::WRITE | Prot::EXEC,
                "jit range",
            ),
        ];
        for (addr, len, prot, what) in reservations {
            match self.memory.mmap(addr, len, prot, flags, -1, 0) {
                Ok(mapped) if mapped == addr => {}
                _ => fatal(JitError::MemoryInitFailed(what)),
            }
        }
        log::debug!(
            "shadow range {:#x}+{:#x}, jit range {:#x}+{:#x}",
            shadow_start,
            self.layout.user_end,
            self.layout.jit_start,
            self.layout.jit_size
        );
    }

    fn bad_range(&self, addr: u32, len: u32) -> bool {
        addr > self.layout.user_end || addr as u64 + len as u64 > self.layout.user_end as u64
    }

    fn shadow_addr(&self, addr: u32) -> u32 {
        addr.wrapping_add(self.layout.taint_offset)
    }

    fn classify(&self, addr: u32, len: u32, is_code: bool) {
        let range = addr..addr.saturating_add(page_next(len));
        if is_code {
            self.code.add_code_region(range);
        } else {
            self.code.del_code_region(range);
        }
    }

    fn shadow_mmap(&self, addr: u32, len: u32, prot: Prot) {
        if len == 0 {
            return;
        }
        let shadow = self.shadow_addr(addr);
        if let Err(errno) = self
            .memory
            .mmap(shadow, len, prot.no_exec(), fixed_anonymous(), -1, 0)
        {
            fatal(JitError::ShadowMapFailed {
                addr,
                len,
                errno: errno.0,
            });
        }
        self.classify(addr, len, prot.is_code());
    }

    fn shadow_munmap(&self, addr: u32, len: u32) {
        self.shadow_mmap(addr, len, SHADOW_DEFAULT_PROT);
    }

    /// Moves and resizes the shadow of a remapped range in the same steps as the user range.
    /// Parts of the shadow range the user range left behind are reset.
    fn shadow_mremap(&self, old_addr: u32, old_len: u32, new_len: u32, new_addr: u32) {
        let moved = old_addr != new_addr;
        let flags = if moved {
            MremapFlags::MAYMOVE | MremapFlags::FIXED
        } else {
            MremapFlags::empty()
        };
        let is_code = self.code.is_code(old_addr);
        let old_end = old_addr.wrapping_add(old_len);
        let new_end = new_addr.wrapping_add(new_len);

        if new_addr < old_addr {
            self.shadow_munmap(new_addr, (old_addr - new_addr).min(new_len));
        }

        let mut hole = None;
        if new_end > old_end {
            if moved {
                self.shadow_munmap(new_addr.max(old_end), new_len.min(new_end - old_end));
            } else if new_len != old_len {
                // user mappings must not land in the shadow hole opened for the in-place growth
                let guard = lock(&self.map_lock);
                let unmapped = self
                    .memory
                    .munmap(self.shadow_addr(old_end), new_len - old_len);
                if let Err(errno) = unmapped {
                    fatal(JitError::ShadowMapFailed {
                        addr: old_end,
                        len: new_len - old_len,
                        errno: errno.0,
                    });
                }
                hole = Some(guard);
            }
        }

        if moved || new_len != old_len {
            let remapped = self.memory.mremap(
                self.shadow_addr(old_addr),
                old_len,
                new_len,
                flags,
                self.shadow_addr(new_addr),
            );
            drop(hole);
            if let Err(errno) = remapped {
                fatal(JitError::ShadowMapFailed {
                    addr: new_addr,
                    len: new_len,
                    errno: errno.0,
                });
            }
            self.classify(new_addr, new_len, is_code);
        }

        if old_addr < new_addr {
            self.shadow_munmap(old_addr, (new_addr - old_addr).min(old_len));
        }

        if old_end > new_end {
            self.shadow_munmap(old_addr.max(new_end), old_len.min(old_end - new_end));
        }
    }

    /// `mmap2`
    pub fn user_mmap(
        &self,
        addr: u32,
        len: u32,
        prot: Prot,
        flags: MapFlags,
        fd: i32,
        pgoffset: u32,
    ) -> Result<u32, Errno> {
        if self.bad_range(addr, len) {
            log::warn!("bad range memory map: {:#x}-{:#x}", addr, addr as u64 + len as u64);
            return Err(Errno::EFAULT);
        }
        if prot.contains(Prot::WRITE | Prot::EXEC) {
            log::warn!(
                "RWX memory map: mmap({:#x}, {:#x}, {:?}, {:?}, {}, {:#x})",
                addr,
                len,
                prot,
                flags,
                fd,
                pgoffset
            );
        }
        let mapped = {
            let _guard = lock(&self.map_lock);
            self.memory
                .mmap(addr, len, prot.no_exec(), flags, fd, pgoffset)?
        };
        self.shadow_mmap(mapped, len, prot);
        Ok(mapped)
    }

    /// Legacy `mmap` taking its arguments from a struct in guest memory
    pub fn user_old_mmap(&self, args_addr: u32) -> Result<u32, Errno> {
        let mut args = [0u32; 6];
        for (index, arg) in args.iter_mut().enumerate() {
            *arg = self
                .memory
                .read_u32(args_addr.wrapping_add(4 * index as u32))
                .ok_or(Errno::EFAULT)?;
        }
        let [addr, len, prot, flags, fd, offset] = args;
        if offset & PAGE_MASK != 0 {
            return Err(Errno::EINVAL);
        }
        self.user_mmap(
            addr,
            len,
            Prot::from_bits_retain(prot),
            MapFlags::from_bits_retain(flags),
            fd as i32,
            offset / PAGE_SIZE,
        )
    }

    /// `munmap`
    pub fn user_munmap(&self, addr: u32, len: u32) -> Result<u32, Errno> {
        if self.bad_range(addr, len) {
            return Err(Errno::EFAULT);
        }
        self.memory.munmap(addr, len)?;
        self.shadow_munmap(addr, page_next(len));
        Ok(0)
    }

    /// `mprotect`
    pub fn user_mprotect(&self, addr: u32, len: u32, prot: Prot) -> Result<u32, Errno> {
        if self.bad_range(addr, len) {
            return Err(Errno::EFAULT);
        }
        let result = self.memory.mprotect(addr, len, prot.no_exec());
        // the shadow follows even a partially failed user mprotect
        let _ = self
            .memory
            .mprotect(self.shadow_addr(addr), len, prot.no_exec());
        result?;
        self.classify(addr, len, prot.is_code());
        Ok(0)
    }

    /// `madvise`, discarded user pages discard their taint too
    pub fn user_madvise(&self, addr: u32, len: u32, advice: i32) -> Result<u32, Errno> {
        if self.bad_range(addr, len) {
            return Err(Errno::ENOMEM);
        }
        self.memory.madvise(addr, len, advice)?;
        if advice == MADV_DONTNEED {
            let _ = self.memory.madvise(self.shadow_addr(addr), len, advice);
        }
        Ok(0)
    }

    /// `mremap`
    pub fn user_mremap(
        &self,
        old_addr: u32,
        old_len: u32,
        new_len: u32,
        flags: MremapFlags,
        new_addr: u32,
    ) -> Result<u32, Errno> {
        if self.bad_range(old_addr, old_len) {
            return Err(Errno::ENOMEM);
        }
        if flags.contains(MremapFlags::FIXED) && self.bad_range(new_addr, new_len) {
            return Err(Errno::ENOMEM);
        }
        let remapped = self
            .memory
            .mremap(old_addr, old_len, new_len, flags, new_addr)?;
        self.shadow_mremap(old_addr, old_len, new_len, remapped);
        Ok(remapped)
    }

    /// `shmat`, the attach address is stored at `raddr`
    pub fn user_shmat(
        &self,
        shmid: i32,
        shmaddr: u32,
        shmflg: i32,
        raddr: u32,
    ) -> Result<u32, Errno> {
        let attached = self.memory.shmat(shmid, shmaddr, shmflg)?;
        if !self.memory.write(raddr, &attached.to_le_bytes()) {
            return Err(Errno::EFAULT);
        }
        // the segment size is only known to the kernel
        if let Some(len) = self.memory.mapping_len(attached) {
            self.shadow_mmap(attached, len, Prot::READ | Prot::WRITE);
        }
        Ok(0)
    }

    /// Raises the lowest program break, as the loader does after mapping the data segment
    pub fn set_brk_min(&self, new_brk: u32) -> Option<u32> {
        if new_brk > self.layout.user_end {
            return None;
        }
        let mut brk = lock(&self.brk);
        if new_brk > brk.min {
            brk.min = new_brk;
            brk.current = new_brk;
        }
        self.memory.brk(new_brk);
        Some(brk.current)
    }

    /// `brk` on top of anonymous mappings, returns the new break
    pub fn user_brk(&self, new_brk: u32) -> u32 {
        let mut brk = lock(&self.brk);
        if new_brk > self.layout.user_end || new_brk < brk.min {
            return brk.current;
        }
        let old_alloc = page_next(brk.current);
        let new_alloc = page_next(new_brk);
        let resized = if new_alloc > old_alloc {
            self.user_mmap(
                old_alloc,
                new_alloc - old_alloc,
                Prot::READ | Prot::WRITE,
                fixed_anonymous(),
                -1,
                0,
            )
            .map(|_| ())
        } else if new_alloc < old_alloc {
            self.user_munmap(new_alloc, old_alloc - new_alloc).map(|_| ())
        } else {
            Ok(())
        };
        if resized.is_ok() {
            brk.current = new_brk;
        }
        brk.current
    }
}
