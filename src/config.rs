// Copyright 2020 Solana Maintainers <maintainers@solana.com>
//
// Licensed under the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
// the MIT license <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Translator configuration.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Size of a guest page
pub const PAGE_SIZE: u32 = 0x1000;
/// Mask of the offset bits of a guest address
pub const PAGE_MASK: u32 = PAGE_SIZE - 1;

/// Rounds `len` up to the next page boundary
pub const fn page_next(len: u32) -> u32 {
    len.wrapping_add(PAGE_MASK) & !PAGE_MASK
}

/// What the translation of a call does with the jump cache slot of its return address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "fuzzer-not-safe-for-production", derive(arbitrary::Arbitrary))]
pub enum CallStrategy {
    /// Insert the return address into the cache, at translation time and at run time
    #[default]
    PreseedOnCall,
    /// Prefetch the cache slot of the return address
    PrefetchOnCall,
    /// Leave the cache alone
    None,
}

/// The fixed address ranges of the process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryLayout {
    /// End of the address range available to the guest
    pub user_end: u32,
    /// Distance between a guest byte and its taint byte
    pub taint_offset: u32,
    /// Start of the translated code range
    pub jit_start: u32,
    /// Size of the translated code range
    pub jit_size: u32,
}

impl MemoryLayout {
    /// End of the translated code range
    pub fn jit_end(&self) -> u32 {
        self.jit_start.wrapping_add(self.jit_size)
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            user_end: 0x5000_0000,
            taint_offset: 0x5000_0000,
            jit_start: 0xA000_0000,
            jit_size: 0x1000_0000,
        }
    }
}

/// Addresses of the hand-written runtime code the translated code transfers to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeEntryPoints {
    /// All runtime code; direct jumps into it survive fragment re-translation
    pub code: Range<u32>,
    /// Indirect jump resolver, expects the target in `eax` and its taint in `ecx`
    pub ijmp: u32,
    /// Return resolver
    pub ret: u32,
    /// `int 0x80` emulation
    pub int80_emu: u32,
    /// `syscall` emulation
    pub syscall_emu: u32,
    /// `sysenter` emulation
    pub sysenter_emu: u32,
    /// `cpuid` emulation
    pub cpuid_emu: u32,
    /// Where fragments leave to; the handler picks up `JitEip` from there
    pub fragment_exit: u32,
    /// Jump cache resolution code, which must not be resumed in place
    pub cache_resolution: Range<u32>,
    /// Start of the relocated copy of the cache resolution code
    pub reloc_cache_resolution: u32,
    /// Part of the syscall path that is restarted from its beginning when interrupted
    pub syscall_intr_critical: Range<u32>,
}

impl Default for RuntimeEntryPoints {
    fn default() -> Self {
        Self {
            code: 0xB000_0000..0xB001_0000,
            ijmp: 0xB000_0000,
            ret: 0xB000_0100,
            int80_emu: 0xB000_0200,
            syscall_emu: 0xB000_0280,
            sysenter_emu: 0xB000_0300,
            cpuid_emu: 0xB000_0380,
            fragment_exit: 0xB000_0400,
            cache_resolution: 0xB000_0800..0xB000_0900,
            reloc_cache_resolution: 0xB000_0A00,
            syscall_intr_critical: 0xB000_0C00..0xB000_0C40,
        }
    }
}

/// Translator configuration settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Emit taint propagation code
    pub taint: bool,
    /// Jump cache handling of call sites
    pub call_strategy: CallStrategy,
    /// Fixed address ranges
    pub layout: MemoryLayout,
    /// Runtime stubs
    pub runtime: RuntimeEntryPoints,
    /// Bytes of translated code reserved per original byte when a region is first allocated
    pub initial_code_expansion: u32,
    /// Size of the per-thread page fragments are built in
    pub fragment_page_size: u32,
}

impl Config {
    /// Parses a configuration, missing fields take their default values
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Returns true if `addr` lies in the translated code range
    pub fn is_jit_address(&self, addr: u32) -> bool {
        (self.layout.jit_start..self.layout.jit_end()).contains(&addr)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            taint: true,
            call_strategy: CallStrategy::default(),
            layout: MemoryLayout::default(),
            runtime: RuntimeEntryPoints::default(),
            initial_code_expansion: 12,
            fragment_page_size: PAGE_SIZE,
        }
    }
}
