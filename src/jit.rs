//! Translation driver: code maps, translated regions and the translation lock

// Derived from uBPF <https://github.com/iovisor/ubpf>
// Copyright 2015 Big Switch Networks, Inc
//      (uBPF: JIT algorithm, originally in C)
// Copyright 2016 6WIND S.A. <quentin.monnet@6wind.com>
//      (Translation to Rust, MetaBuff addition)
// Copyright 2020 Solana Maintainers <maintainers@solana.com>
//
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![allow(clippy::arithmetic_side_effects)]

use std::ops::Range;

#[cfg(not(feature = "shuttle-test"))]
use std::sync::{Mutex, MutexGuard};

#[cfg(feature = "shuttle-test")]
use shuttle::sync::{Mutex, MutexGuard};

use crate::{
    classify::classify,
    codegen::patch_rel32,
    config::{page_next, Config, PAGE_SIZE},
    control::translate_jump,
    decoder::{decode, DecodedInstruction, MAX_INSTRUCTION_LENGTH},
    error::{fatal, JitError},
    jump_cache::JumpCache,
    memory_management::GuestMemory,
    translate::{translate_op, Preseed, TranslationContext},
};

/// The maximum machine code length in bytes of a single guest instruction
pub const MAX_MACHINE_CODE_LENGTH_PER_INSTRUCTION: usize = 256;

/// Marks an original byte with no translation in the `pc_section`
const UNTRANSLATED: u32 = u32::MAX;

/// Registry of the guest pages that hold code
pub trait CodeRegions {
    /// Registers `range` as code, replacing whatever overlapped it
    fn add_code_region(&self, range: Range<u32>);
    /// Forgets the code in `range`
    fn del_code_region(&self, range: Range<u32>);
    /// Returns true if `addr` lies in a registered code range
    fn is_code(&self, addr: u32) -> bool;
}

/// One guest instruction and its translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TranslatedOp {
    /// Original address
    addr: u32,
    /// Byte offset in the text section
    jit_offset: u32,
    /// Length of the translation
    len: u32,
}

#[derive(Debug)]
struct Jump {
    /// Offset of the rel32 field in the text section
    location: usize,
    /// Original address to reach
    target: u32,
}

/// The translated code of one code map
#[derive(Debug)]
struct JitRegion {
    /// Start of the code map
    origin: u32,
    /// Translated address of the first byte
    base: u32,
    /// Bytes reserved in the translated code range
    capacity: u32,
    /// Byte offset in the text section for each original byte of the map
    pc_section: Vec<u32>,
    /// The x86 machine code
    text_section: Vec<u8>,
    /// Translated ops in text order
    ops: Vec<TranslatedOp>,
}

/// How much of a region has been installed
#[derive(Debug, Clone, Copy)]
struct CommitPoint {
    text_len: usize,
    ops: usize,
}

/// The block did not fit the capacity of its region
struct RegionFull;

impl JitRegion {
    fn new(origin: u32, base: u32, capacity: u32, map_len: u32) -> Self {
        Self {
            origin,
            base,
            capacity,
            pc_section: vec![UNTRANSLATED; map_len as usize],
            text_section: Vec::with_capacity(capacity as usize),
            ops: Vec::new(),
        }
    }

    /// Translated address of the next byte appended
    fn next_jit_addr(&self) -> u32 {
        self.base + self.text_section.len() as u32
    }

    fn contains_jit_addr(&self, jit_addr: u32) -> bool {
        (self.base..self.next_jit_addr()).contains(&jit_addr)
    }

    fn lookup(&self, addr: u32) -> Option<u32> {
        let index = addr.checked_sub(self.origin)? as usize;
        match self.pc_section.get(index) {
            Some(&offset) if offset != UNTRANSLATED => Some(self.base + offset),
            _ => None,
        }
    }

    fn rev_lookup(&self, jit_addr: u32) -> Option<RevLookup> {
        if !self.contains_jit_addr(jit_addr) {
            return None;
        }
        let offset = jit_addr - self.base;
        let index = self.ops.partition_point(|op| op.jit_offset <= offset);
        let op = self.ops.get(index.checked_sub(1)?)?;
        (offset < op.jit_offset + op.len).then_some(RevLookup {
            addr: op.addr,
            op_start: self.base + op.jit_offset,
            op_len: op.len,
        })
    }

    fn has_room(&self) -> bool {
        self.text_section.len() + MAX_MACHINE_CODE_LENGTH_PER_INSTRUCTION
            <= self.capacity as usize
    }

    fn commit_point(&self) -> CommitPoint {
        CommitPoint {
            text_len: self.text_section.len(),
            ops: self.ops.len(),
        }
    }

    /// Drops everything appended after `point`
    fn rollback(&mut self, point: CommitPoint) {
        for op in self.ops.drain(point.ops..) {
            if let Some(offset) = self.pc_section.get_mut((op.addr - self.origin) as usize) {
                if *offset == op.jit_offset {
                    *offset = UNTRANSLATED;
                }
            }
        }
        self.text_section.truncate(point.text_len);
    }
}

/// A registered code range and its translation, if any
#[derive(Debug)]
struct CodeMap {
    range: Range<u32>,
    region: Option<JitRegion>,
}

/// Result of a reverse lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevLookup {
    /// Original address of the instruction
    pub addr: u32,
    /// Translated address of the first byte of its translation
    pub op_start: u32,
    /// Length of its translation
    pub op_len: u32,
}

#[derive(Debug)]
struct JitState {
    maps: Vec<CodeMap>,
    /// Regions replaced by a larger one or whose code map went away, kept for reverse lookups
    retired: Vec<JitRegion>,
    /// Bump allocator over the translated code range
    next_jit_addr: u32,
}

impl JitState {
    fn map_index(&self, addr: u32) -> Option<usize> {
        self.maps.iter().position(|map| map.range.contains(&addr))
    }

    fn allocate(&mut self, config: &Config, map: &Range<u32>, capacity: u32) -> JitRegion {
        let base = self.next_jit_addr;
        let end = base as u64 + capacity as u64;
        if end > config.layout.jit_end() as u64 {
            fatal(JitError::ExhaustedJitSpace(capacity));
        }
        self.next_jit_addr = end as u32;
        log::debug!("allocated jit region {:#x}+{:#x}", base, capacity);
        JitRegion::new(map.start, base, capacity, map.end - map.start)
    }

    fn retire(&mut self, region: Option<JitRegion>) {
        if let Some(region) = region {
            log::debug!(
                "retired jit region {:#x}+{:#x}",
                region.base,
                region.text_section.len()
            );
            self.retired.push(region);
        }
    }

    /// Removes `range` from all code maps, keeping the parts outside it
    fn cut(&mut self, range: &Range<u32>) {
        let maps = std::mem::take(&mut self.maps);
        for map in maps {
            if map.range.end <= range.start || range.end <= map.range.start {
                self.maps.push(map);
                continue;
            }
            for remainder in [
                map.range.start..range.start.min(map.range.end),
                range.end.max(map.range.start)..map.range.end,
            ] {
                if !remainder.is_empty() {
                    self.maps.push(CodeMap {
                        range: remainder,
                        region: None,
                    });
                }
            }
            self.retire(map.region);
        }
    }
}

fn initial_capacity(config: &Config, map_len: u32) -> u32 {
    let minimum = page_next(2 * MAX_MACHINE_CODE_LENGTH_PER_INSTRUCTION as u32).max(PAGE_SIZE);
    let wanted = (map_len as u64 * config.initial_code_expansion as u64)
        .clamp(minimum as u64, config.layout.jit_size as u64);
    page_next(wanted as u32)
}

fn read_instruction<M: GuestMemory + ?Sized>(memory: &M, pc: u32, end: u32) -> DecodedInstruction {
    let mut window = [0; MAX_INSTRUCTION_LENGTH];
    let len = (end - pc).min(MAX_INSTRUCTION_LENGTH as u32) as usize;
    if !memory.read(pc, &mut window[..len]) {
        fatal(JitError::UnreadableCode(pc));
    }
    decode(&window[..len], pc)
}

/// Translates everything reachable from `entry` through direct transfers inside the map
fn translate_block<M: GuestMemory + ?Sized>(
    region: &mut JitRegion,
    map: &Range<u32>,
    entry: u32,
    memory: &M,
    config: &Config,
) -> Result<Vec<Preseed>, RegionFull> {
    let mut jumps = Vec::new();
    let mut preseeds = Vec::new();
    let mut worklist = vec![entry];
    while let Some(mut pc) = worklist.pop() {
        if region.lookup(pc).is_some() {
            continue;
        }
        loop {
            if !region.has_room() {
                return Err(RegionFull);
            }
            let jit_offset = region.text_section.len();
            let context = TranslationContext {
                config,
                jit_addr: region.next_jit_addr(),
                map: map.clone(),
            };
            // a block ends by jumping to code translated earlier, or off the end of the map
            let (translation, next) = if pc >= map.end || region.lookup(pc).is_some() {
                (translate_jump(&mut region.text_section, pc, &context), None)
            } else {
                let instruction = read_instruction(memory, pc, map.end);
                let translation = translate_op(&mut region.text_section, &instruction, &context);
                region.pc_section[(pc - map.start) as usize] = jit_offset as u32;
                if let Some(patch) = translation.patch {
                    worklist.push(patch.target);
                }
                let next = classify(&instruction)
                    .falls_through()
                    .then(|| instruction.end());
                (translation, next)
            };
            region.ops.push(TranslatedOp {
                addr: pc,
                jit_offset: jit_offset as u32,
                len: translation.len as u32,
            });
            if let Some(patch) = translation.patch {
                jumps.push(Jump {
                    location: jit_offset + patch.offset,
                    target: patch.target,
                });
            }
            preseeds.extend(translation.preseed);
            match next {
                Some(end) => pc = end,
                None => break,
            }
        }
    }
    resolve_jumps(region, &jumps);
    Ok(preseeds)
}

fn resolve_jumps(region: &mut JitRegion, jumps: &[Jump]) {
    for jump in jumps {
        let Some(destination) = region.lookup(jump.target) else {
            fatal(JitError::UnresolvedJump(jump.target));
        };
        patch_rel32(
            &mut region.text_section,
            jump.location,
            region.base,
            destination,
        );
    }
}

/// Writes the code appended since `point` into the translated code range
fn install<M: GuestMemory + ?Sized>(region: &JitRegion, point: CommitPoint, memory: &M) {
    let jit_addr = region.base + point.text_len as u32;
    if !memory.write(jit_addr, &region.text_section[point.text_len..]) {
        fatal(JitError::CodeInstallFailed(jit_addr));
    }
}

/// The translator of a process
pub struct Jit {
    config: Config,
    cache: JumpCache,
    state: Mutex<JitState>,
}

impl std::fmt::Debug for Jit {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Jit")
            .field("maps", &state.maps.len())
            .field("retired", &state.retired.len())
            .field("next_jit_addr", &state.next_jit_addr)
            .finish()
    }
}

impl Jit {
    /// Creates a translator with no code maps
    pub fn new(config: Config) -> Self {
        let next_jit_addr = config.layout.jit_start;
        Self {
            config,
            cache: JumpCache::new(),
            state: Mutex::new(JitState {
                maps: Vec::new(),
                retired: Vec::new(),
                next_jit_addr,
            }),
        }
    }

    /// Translator configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Jump cache shared with the runtime
    pub fn cache(&self) -> &JumpCache {
        &self.cache
    }

    fn lock(&self) -> MutexGuard<'_, JitState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Translated address of `addr`, translating it first if necessary.
    ///
    /// Returns `None` if `addr` is not in a code region.
    pub fn jit<M: GuestMemory + ?Sized>(&self, addr: u32, memory: &M) -> Option<u32> {
        let mut state = self.lock();
        let index = state.map_index(addr)?;
        let range = state.maps[index].range.clone();
        if let Some(jit_addr) = state.maps[index]
            .region
            .as_ref()
            .and_then(|region| region.lookup(addr))
        {
            return Some(jit_addr);
        }
        let mut capacity = match &state.maps[index].region {
            Some(region) => region.capacity,
            None => initial_capacity(&self.config, range.end - range.start),
        };
        loop {
            let mut region = match state.maps[index].region.take() {
                Some(region) => region,
                None => state.allocate(&self.config, &range, capacity),
            };
            let point = region.commit_point();
            match translate_block(&mut region, &range, addr, memory, &self.config) {
                Ok(preseeds) => {
                    install(&region, point, memory);
                    for preseed in preseeds {
                        self.cache.insert(preseed.addr, preseed.jit_addr);
                    }
                    log::debug!(
                        "translated {:#x}: {} bytes at {:#x}",
                        addr,
                        region.text_section.len() - point.text_len,
                        region.base + point.text_len as u32
                    );
                    let jit_addr = region.lookup(addr);
                    state.maps[index].region = Some(region);
                    return jit_addr;
                }
                Err(RegionFull) => {
                    region.rollback(point);
                    capacity = region.capacity.saturating_mul(2);
                    log::debug!(
                        "jit region {:#x} of {:#x} is full, resizing to {:#x}",
                        region.base,
                        range.start,
                        capacity
                    );
                    state.retire(Some(region));
                }
            }
        }
    }

    /// What the indirect jump resolver does: consult the jump cache, translate on a miss
    pub fn resolve<M: GuestMemory + ?Sized>(&self, addr: u32, memory: &M) -> Option<u32> {
        if let Some(jit_addr) = self.cache.lookup(addr) {
            return Some(jit_addr);
        }
        let jit_addr = self.jit(addr, memory)?;
        self.cache.insert(addr, jit_addr);
        Some(jit_addr)
    }

    /// Translated address of `addr` if it has been translated
    pub fn lookup_addr(&self, addr: u32) -> Option<u32> {
        let state = self.lock();
        state.maps[state.map_index(addr)?]
            .region
            .as_ref()?
            .lookup(addr)
    }

    /// Finds the translated op containing `jit_addr`, in current and retired regions
    pub fn rev_lookup_addr(&self, jit_addr: u32) -> Option<RevLookup> {
        let state = self.lock();
        state
            .maps
            .iter()
            .filter_map(|map| map.region.as_ref())
            .chain(state.retired.iter())
            .find_map(|region| region.rev_lookup(jit_addr))
    }

    /// Copy of `len` bytes of translated code starting at `jit_addr`
    pub fn code_bytes(&self, jit_addr: u32, len: u32) -> Option<Vec<u8>> {
        let state = self.lock();
        let region = state
            .maps
            .iter()
            .filter_map(|map| map.region.as_ref())
            .chain(state.retired.iter())
            .find(|region| region.contains_jit_addr(jit_addr))?;
        let start = (jit_addr - region.base) as usize;
        region
            .text_section
            .get(start..start.checked_add(len as usize)?)
            .map(<[u8]>::to_vec)
    }
}

impl CodeRegions for Jit {
    fn add_code_region(&self, range: Range<u32>) {
        if range.is_empty() {
            return;
        }
        let mut state = self.lock();
        state.cut(&range);
        log::debug!("code region {:#x}..{:#x}", range.start, range.end);
        state.maps.push(CodeMap {
            range,
            region: None,
        });
    }

    fn del_code_region(&self, range: Range<u32>) {
        self.lock().cut(&range);
    }

    fn is_code(&self, addr: u32) -> bool {
        self.lock().map_index(addr).is_some()
    }
}

impl<T: CodeRegions + ?Sized> CodeRegions for &T {
    fn add_code_region(&self, range: Range<u32>) {
        (**self).add_code_region(range)
    }

    fn del_code_region(&self, range: Range<u32>) {
        (**self).del_code_region(range)
    }

    fn is_code(&self, addr: u32) -> bool {
        (**self).is_code(addr)
    }
}

impl<T: CodeRegions + ?Sized> CodeRegions for std::sync::Arc<T> {
    fn add_code_region(&self, range: Range<u32>) {
        (**self).add_code_region(range)
    }

    fn del_code_region(&self, range: Range<u32>) {
        (**self).del_code_region(range)
    }

    fn is_code(&self, addr: u32) -> bool {
        (**self).is_code(addr)
    }
}
