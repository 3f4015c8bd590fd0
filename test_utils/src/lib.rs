#![allow(dead_code)]

//! Guest memories and an x86 interpreter for the tests.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use taint_jit::{
    config::{page_next, PAGE_MASK, PAGE_SIZE},
    memory_management::{
        Errno, GuestMemory, MapFlags, MemoryOps, MremapFlags, Prot, MADV_DONTNEED,
    },
};

pub mod interpreter;

pub use interpreter::Interpreter;

type Page = Box<[u8; PAGE_SIZE as usize]>;

fn zero_page() -> Page {
    Box::new([0; PAGE_SIZE as usize])
}

/// Splits `[addr, addr + len)` into (page, offset in page, offset in buffer, length) pieces
fn page_pieces(addr: u32, len: usize) -> impl Iterator<Item = (u32, usize, usize, usize)> {
    let mut done = 0;
    std::iter::from_fn(move || {
        if done == len {
            return None;
        }
        let at = addr.wrapping_add(done as u32);
        let offset = (at & PAGE_MASK) as usize;
        let piece = (PAGE_SIZE as usize - offset).min(len - done);
        let item = (at & !PAGE_MASK, offset, done, piece);
        done += piece;
        Some(item)
    })
}

/// Flat 4 GiB address space, every byte reads as zero until written
#[derive(Default)]
pub struct SparseMemory {
    pages: Mutex<HashMap<u32, Page>>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` at `addr`
    pub fn load(&self, addr: u32, data: &[u8]) {
        assert!(self.write(addr, data));
    }

    pub fn bytes(&self, addr: u32, len: usize) -> Vec<u8> {
        let mut buffer = vec![0; len];
        assert!(self.read(addr, &mut buffer));
        buffer
    }

    pub fn u32_at(&self, addr: u32) -> u32 {
        self.read_u32(addr).unwrap()
    }

    pub fn set_u32(&self, addr: u32, value: u32) {
        self.load(addr, &value.to_le_bytes());
    }
}

impl GuestMemory for SparseMemory {
    fn read(&self, addr: u32, buffer: &mut [u8]) -> bool {
        let pages = self.pages.lock().unwrap();
        for (page, offset, at, len) in page_pieces(addr, buffer.len()) {
            let target = &mut buffer[at..at + len];
            match pages.get(&page) {
                Some(data) => target.copy_from_slice(&data[offset..offset + len]),
                None => target.fill(0),
            }
        }
        true
    }

    fn write(&self, addr: u32, data: &[u8]) -> bool {
        let mut pages = self.pages.lock().unwrap();
        for (page, offset, at, len) in page_pieces(addr, data.len()) {
            pages.entry(page).or_insert_with(zero_page)[offset..offset + len]
                .copy_from_slice(&data[at..at + len]);
        }
        true
    }
}

struct MappedPage {
    prot: Prot,
    /// Pages of one mapping share the id
    mapping: u64,
    data: Option<Page>,
}

struct SimulatedState {
    pages: BTreeMap<u32, MappedPage>,
    next_mapping: u64,
    brk: u32,
    segments: HashMap<i32, u32>,
}

/// Page granular model of the host's memory system calls
pub struct SimulatedMemory {
    state: Mutex<SimulatedState>,
    /// Addresses mappings without a usable hint are placed at
    search: std::ops::Range<u32>,
}

impl Default for SimulatedMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedMemory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimulatedState {
                pages: BTreeMap::new(),
                next_mapping: 0,
                brk: 0,
                segments: HashMap::new(),
            }),
            search: 0x1000_0000..0x4000_0000,
        }
    }

    /// Registers a shared memory segment `shmat` can attach
    pub fn add_segment(&self, shmid: i32, len: u32) {
        self.state.lock().unwrap().segments.insert(shmid, page_next(len));
    }

    /// Protection of the page holding `addr`, `None` if unmapped
    pub fn prot_at(&self, addr: u32) -> Option<Prot> {
        let state = self.state.lock().unwrap();
        state.pages.get(&(addr & !PAGE_MASK)).map(|page| page.prot)
    }

    pub fn is_mapped(&self, addr: u32) -> bool {
        self.prot_at(addr).is_some()
    }

    /// Number of mapped pages
    pub fn mapped_pages(&self) -> usize {
        self.state.lock().unwrap().pages.len()
    }

    /// Reads regardless of the page protection
    pub fn peek(&self, addr: u32, len: usize) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let mut buffer = vec![0; len];
        for (page, offset, at, piece) in page_pieces(addr, len) {
            let data = state.pages.get(&page)?.data.as_ref();
            if let Some(data) = data {
                buffer[at..at + piece].copy_from_slice(&data[offset..offset + piece]);
            }
        }
        Some(buffer)
    }

    /// Writes regardless of the page protection
    pub fn poke(&self, addr: u32, data: &[u8]) -> bool {
        let mut state = self.state.lock().unwrap();
        for (page, ..) in page_pieces(addr, data.len()) {
            if !state.pages.contains_key(&page) {
                return false;
            }
        }
        for (page, offset, at, piece) in page_pieces(addr, data.len()) {
            if let Some(mapped) = state.pages.get_mut(&page) {
                mapped.data.get_or_insert_with(zero_page)[offset..offset + piece]
                    .copy_from_slice(&data[at..at + piece]);
            }
        }
        true
    }

    fn pages_of(addr: u32, len: u32) -> impl Iterator<Item = u32> {
        (0..page_next(len) / PAGE_SIZE).map(move |page| addr.wrapping_add(page * PAGE_SIZE))
    }

    fn is_free(state: &SimulatedState, addr: u32, len: u32) -> bool {
        addr as u64 + len as u64 <= 1 << 32
            && Self::pages_of(addr, len).all(|page| !state.pages.contains_key(&page))
    }

    fn find_free(&self, state: &SimulatedState, hint: u32, len: u32) -> Result<u32, Errno> {
        if hint != 0 && hint & PAGE_MASK == 0 && Self::is_free(state, hint, len) {
            return Ok(hint);
        }
        let mut addr = self.search.start;
        while addr as u64 + len as u64 <= self.search.end as u64 {
            if Self::is_free(state, addr, len) {
                return Ok(addr);
            }
            addr += PAGE_SIZE;
        }
        Err(Errno::ENOMEM)
    }

    fn map_pages(state: &mut SimulatedState, addr: u32, len: u32, prot: Prot) {
        let mapping = state.next_mapping;
        state.next_mapping += 1;
        for page in Self::pages_of(addr, len) {
            state.pages.insert(
                page,
                MappedPage {
                    prot,
                    mapping,
                    data: None,
                },
            );
        }
    }

    fn all_mapped(state: &SimulatedState, addr: u32, len: u32) -> bool {
        Self::pages_of(addr, len).all(|page| state.pages.contains_key(&page))
    }
}

impl GuestMemory for SimulatedMemory {
    fn read(&self, addr: u32, buffer: &mut [u8]) -> bool {
        let state = self.state.lock().unwrap();
        for (page, offset, at, len) in page_pieces(addr, buffer.len()) {
            let Some(mapped) = state.pages.get(&page) else {
                return false;
            };
            if !mapped.prot.contains(Prot::READ) {
                return false;
            }
            let target = &mut buffer[at..at + len];
            match &mapped.data {
                Some(data) => target.copy_from_slice(&data[offset..offset + len]),
                None => target.fill(0),
            }
        }
        true
    }

    fn write(&self, addr: u32, data: &[u8]) -> bool {
        let mut state = self.state.lock().unwrap();
        let writable = page_pieces(addr, data.len()).all(|(page, ..)| {
            state
                .pages
                .get(&page)
                .is_some_and(|mapped| mapped.prot.contains(Prot::WRITE))
        });
        if !writable {
            return false;
        }
        for (page, offset, at, len) in page_pieces(addr, data.len()) {
            if let Some(mapped) = state.pages.get_mut(&page) {
                mapped.data.get_or_insert_with(zero_page)[offset..offset + len]
                    .copy_from_slice(&data[at..at + len]);
            }
        }
        true
    }
}

impl MemoryOps for SimulatedMemory {
    fn mmap(
        &self,
        addr: u32,
        len: u32,
        prot: Prot,
        flags: MapFlags,
        _fd: i32,
        _pgoffset: u32,
    ) -> Result<u32, Errno> {
        if len == 0 {
            return Err(Errno::EINVAL);
        }
        let mut state = self.state.lock().unwrap();
        let addr = if flags.contains(MapFlags::FIXED) {
            if addr & PAGE_MASK != 0 || addr as u64 + len as u64 > 1 << 32 {
                return Err(Errno::EINVAL);
            }
            addr
        } else {
            self.find_free(&state, addr, len)?
        };
        Self::map_pages(&mut state, addr, len, prot);
        Ok(addr)
    }

    fn munmap(&self, addr: u32, len: u32) -> Result<(), Errno> {
        if addr & PAGE_MASK != 0 || len == 0 {
            return Err(Errno::EINVAL);
        }
        let mut state = self.state.lock().unwrap();
        for page in Self::pages_of(addr, len) {
            state.pages.remove(&page);
        }
        Ok(())
    }

    fn mprotect(&self, addr: u32, len: u32, prot: Prot) -> Result<(), Errno> {
        if addr & PAGE_MASK != 0 {
            return Err(Errno::EINVAL);
        }
        let mut state = self.state.lock().unwrap();
        if !Self::all_mapped(&state, addr, len) {
            return Err(Errno::ENOMEM);
        }
        for page in Self::pages_of(addr, len) {
            if let Some(mapped) = state.pages.get_mut(&page) {
                mapped.prot = prot;
            }
        }
        Ok(())
    }

    fn madvise(&self, addr: u32, len: u32, advice: i32) -> Result<(), Errno> {
        if addr & PAGE_MASK != 0 {
            return Err(Errno::EINVAL);
        }
        let mut state = self.state.lock().unwrap();
        if !Self::all_mapped(&state, addr, len) {
            return Err(Errno::ENOMEM);
        }
        if advice == MADV_DONTNEED {
            for page in Self::pages_of(addr, len) {
                if let Some(mapped) = state.pages.get_mut(&page) {
                    mapped.data = None;
                }
            }
        }
        Ok(())
    }

    fn mremap(
        &self,
        old_addr: u32,
        old_len: u32,
        new_len: u32,
        flags: MremapFlags,
        new_addr: u32,
    ) -> Result<u32, Errno> {
        if old_addr & PAGE_MASK != 0 || new_len == 0 {
            return Err(Errno::EINVAL);
        }
        let mut state = self.state.lock().unwrap();
        if !Self::all_mapped(&state, old_addr, old_len) {
            return Err(Errno::EFAULT);
        }
        let old_len = page_next(old_len);
        let new_len = page_next(new_len);
        let fixed = flags.contains(MremapFlags::FIXED);
        if fixed && !flags.contains(MremapFlags::MAYMOVE) {
            return Err(Errno::EINVAL);
        }
        if !fixed && new_len <= old_len {
            for page in Self::pages_of(old_addr + new_len, old_len - new_len) {
                state.pages.remove(&page);
            }
            return Ok(old_addr);
        }
        let tail = old_addr.wrapping_add(old_len);
        if !fixed && Self::is_free(&state, tail, new_len - old_len) {
            let (prot, mapping) = match state.pages.get(&old_addr) {
                Some(page) => (page.prot, page.mapping),
                None => return Err(Errno::EFAULT),
            };
            for page in Self::pages_of(tail, new_len - old_len) {
                state.pages.insert(
                    page,
                    MappedPage {
                        prot,
                        mapping,
                        data: None,
                    },
                );
            }
            return Ok(old_addr);
        }
        if !flags.contains(MremapFlags::MAYMOVE) {
            return Err(Errno::ENOMEM);
        }
        let moved: Vec<MappedPage> = Self::pages_of(old_addr, old_len)
            .filter_map(|page| state.pages.remove(&page))
            .collect();
        let target = if fixed {
            for page in Self::pages_of(new_addr, new_len) {
                state.pages.remove(&page);
            }
            new_addr
        } else {
            match self.find_free(&state, 0, new_len) {
                Ok(target) => target,
                Err(errno) => {
                    for (page, mapped) in Self::pages_of(old_addr, old_len).zip(moved) {
                        state.pages.insert(page, mapped);
                    }
                    return Err(errno);
                }
            }
        };
        let prot = moved.first().map_or(Prot::empty(), |page| page.prot);
        let mapping = state.next_mapping;
        state.next_mapping += 1;
        let mut moved = moved.into_iter();
        for page in Self::pages_of(target, new_len) {
            let data = moved.next().and_then(|page| page.data);
            state.pages.insert(
                page,
                MappedPage {
                    prot,
                    mapping,
                    data,
                },
            );
        }
        Ok(target)
    }

    fn brk(&self, addr: u32) -> u32 {
        let mut state = self.state.lock().unwrap();
        if addr != 0 {
            state.brk = addr;
        }
        state.brk
    }

    fn shmat(&self, shmid: i32, addr: u32, _shmflg: i32) -> Result<u32, Errno> {
        let mut state = self.state.lock().unwrap();
        let len = *state.segments.get(&shmid).ok_or(Errno::EINVAL)?;
        let addr = if addr != 0 {
            if addr & PAGE_MASK != 0 {
                return Err(Errno::EINVAL);
            }
            addr
        } else {
            self.find_free(&state, 0, len)?
        };
        Self::map_pages(&mut state, addr, len, Prot::READ | Prot::WRITE);
        Ok(addr)
    }

    fn mapping_len(&self, addr: u32) -> Option<u32> {
        let state = self.state.lock().unwrap();
        let mapping = state.pages.get(&addr)?.mapping;
        let starts_here = addr == 0
            || state
                .pages
                .get(&(addr - PAGE_SIZE))
                .map_or(true, |page| page.mapping != mapping);
        if !starts_here {
            return None;
        }
        let pages = state
            .pages
            .range(addr..)
            .zip((addr / PAGE_SIZE)..)
            .take_while(|((page, mapped), expected)| {
                **page / PAGE_SIZE == *expected && mapped.mapping == mapping
            })
            .count() as u32;
        Some(pages * PAGE_SIZE)
    }
}
