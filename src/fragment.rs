//! Fragment re-translation of interrupted translated code.
//!
//! A guest instruction may translate into several machine instructions (a taint update loop
//! around a string op, the fix-ups around a compare-exchange). A signal arriving in the middle
//! of such a sequence must not be delivered there, and resuming at the original instruction
//! would repeat the steps already done. Instead the rest of the sequence is copied into a
//! fragment whose every exit records where translated code continues and leaves through the
//! runtime's fragment exit.

use crate::{
    classify::{classify, Action, Control},
    codegen::{gen_code, relative_to},
    config::Config,
    context::{SignalContext, ThreadCtxSlot},
    decoder::{decode, DecodedInstruction, Opcode},
    error::{fatal, JitError},
    jit::Jit,
    x86::OperandSize,
};

/// Marks a slice offset that is not an instruction boundary
const UNMAPPED: u32 = u32::MAX;

/// Rounds of [`finish_instruction`] before giving up
const FINISH_ROUNDS: usize = 3;

/// Self contained copy of the remainder of a translated op
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Address the fragment is built for
    pub base: u32,
    /// Machine code
    pub code: Vec<u8>,
    /// Fragment address matching the interrupted program counter
    pub entry: u32,
    /// Fragment address of each byte offset of the slice, plus one for its end
    pub map: Vec<u32>,
}

impl Fragment {
    /// Fragment address of an address of the slice it was built from
    pub fn fragment_addr(&self, slice_start: u32, addr: u32) -> Option<u32> {
        let offset = addr.checked_sub(slice_start)? as usize;
        self.map
            .get(offset)
            .copied()
            .filter(|fragment_addr| *fragment_addr != UNMAPPED)
    }
}

/// Executes fragments and runtime code on behalf of the signal handler
pub trait FragmentRunner {
    /// Address fragments of the current thread are built at
    fn fragment_page(&self) -> u32;

    /// Installs `fragment`, if any, and runs from `context.pc` until control reaches the
    /// runtime's fragment exit, then sets `context.pc` to the recorded `JitEip`
    fn run(&mut self, fragment: Option<&Fragment>, context: &mut SignalContext);
}

struct FragmentEmitter<'a> {
    /// Translated address of the slice
    addr: u32,
    len: u32,
    base: u32,
    config: &'a Config,
    code: Vec<u8>,
    /// Fills in branch targets on the second pass
    resolve: bool,
}

impl FragmentEmitter<'_> {
    fn pc(&self) -> u32 {
        self.base.wrapping_add(self.code.len() as u32)
    }

    /// Branch targets at the end of the slice stay inside the fragment
    fn in_slice(&self, target: u32) -> bool {
        target.wrapping_sub(self.addr) <= self.len
    }

    fn fragment_target(&self, map: &[u32], target: u32) -> u32 {
        if !self.resolve {
            return self.base;
        }
        match map[(target - self.addr) as usize] {
            UNMAPPED => fatal(JitError::FragmentBranchMisaligned(target)),
            fragment_addr => fragment_addr,
        }
    }

    fn jump(&mut self, target: u32) {
        let rel = relative_to(self.pc().wrapping_add(5), target);
        gen_code(&mut self.code, "E9 L", &[(rel as u32).into()]);
    }

    /// Records where translated code continues and leaves through the fragment exit
    fn jump_exit(&mut self, target: u32) {
        gen_code(
            &mut self.code,
            "64 C7 05 L L",
            &[ThreadCtxSlot::JitEip.offset().into(), target.into()],
        );
        self.jump(self.config.runtime.fragment_exit);
    }

    fn branch(&mut self, map: &[u32], target: u32) {
        if self.in_slice(target) {
            let fragment_addr = self.fragment_target(map, target);
            self.jump(fragment_addr);
        } else {
            self.jump_exit(target);
        }
    }

    fn conditional_branch(&mut self, map: &[u32], condition: u8, target: u32) {
        if self.in_slice(target) {
            let fragment_addr = self.fragment_target(map, target);
            let rel = relative_to(self.pc().wrapping_add(6), fragment_addr);
            gen_code(
                &mut self.code,
                "0F 80 + L",
                &[condition.into(), (rel as u32).into()],
            );
        } else {
            let emitted = gen_code(&mut self.code, "70 + &00", &[(condition ^ 1).into()]);
            let skip = emitted.mark(0);
            self.jump_exit(target);
            self.code[skip] = (self.code.len() - skip - 1) as u8;
        }
    }

    fn relative_jump(&mut self, map: &[u32], target: u32) {
        let config = self.config;
        let runtime = &config.runtime;
        if self.in_slice(target) {
            self.branch(map, target);
        } else if runtime.cache_resolution.contains(&target) {
            // the relocated copy returns here instead of continuing at the resolved address
            let relocated = target
                .wrapping_sub(runtime.cache_resolution.start)
                .wrapping_add(runtime.reloc_cache_resolution);
            self.jump(relocated);
        } else if runtime.code.contains(&target) {
            self.jump(target);
        } else {
            self.jump_exit(target);
        }
    }

    fn control(&mut self, map: &[u32], instruction: &DecodedInstruction, control: Control) {
        let size = match instruction.imm_len() {
            1 => OperandSize::S8,
            2 => OperandSize::S16,
            _ => OperandSize::S32,
        };
        let target = instruction
            .end()
            .wrapping_add(instruction.immediate(size) as u32);
        match control {
            Control::JumpConditional => {
                self.conditional_branch(map, instruction.opcode_byte() & 0x0f, target)
            }
            Control::Loop => {
                let bytes = instruction.bytes();
                let emitted = gen_code(
                    &mut self.code,
                    "$ 02 EB &00",
                    &[(&bytes[..bytes.len() - 1]).into()],
                );
                let skip = emitted.mark(0);
                self.branch(map, target);
                self.code[skip] = (self.code.len() - skip - 1) as u8;
            }
            Control::JumpRelative => self.relative_jump(map, target),
            _ => fatal(JitError::UnexpectedTranslatedCode(instruction.addr)),
        }
    }
}

/// One pass over the slice, recording instruction boundaries in `map`
fn translate_fragment(
    slice: &[u8],
    emitter: &mut FragmentEmitter,
    entry: u32,
    map: &mut [u32],
) -> Option<u32> {
    let mut fragment_entry = None;
    let mut offset = 0;
    loop {
        map[offset] = emitter.pc();
        let addr = emitter.addr.wrapping_add(offset as u32);
        if offset == slice.len() {
            emitter.jump_exit(addr);
            break;
        }
        if addr == entry {
            fragment_entry = Some(emitter.pc());
        }
        let instruction = decode(&slice[offset..], addr);
        match instruction.opcode {
            Opcode::Cutoff => fatal(JitError::DecodeCutoff(addr)),
            Opcode::Bad => fatal(JitError::InstructionSticksOut(addr)),
            _ => {}
        }
        match classify(&instruction) {
            Action::Control(control) => emitter.control(map, &instruction, control),
            _ => emitter.code.extend_from_slice(instruction.bytes()),
        }
        offset += instruction.len;
    }
    fragment_entry
}

/// Re-translates the translated op `slice`, found at `addr`, into a fragment at `base` that
/// starts executing at the op's address `entry`
pub fn build_fragment(
    slice: &[u8],
    addr: u32,
    entry: u32,
    base: u32,
    config: &Config,
) -> Fragment {
    let mut map = vec![UNMAPPED; slice.len() + 1];
    let mut emitter = FragmentEmitter {
        addr,
        len: slice.len() as u32,
        base,
        config,
        code: Vec::new(),
        resolve: false,
    };
    // the first pass only lays out the boundaries forward branches need
    translate_fragment(slice, &mut emitter, entry, &mut map);
    emitter.code.clear();
    emitter.resolve = true;
    let Some(fragment_entry) = translate_fragment(slice, &mut emitter, entry, &mut map) else {
        fatal(JitError::FragmentEntryUnreachable(entry));
    };
    if emitter.code.len() > config.fragment_page_size as usize {
        fatal(JitError::FragmentTooLarge(emitter.code.len()));
    }
    log::debug!(
        "fragment of {:#x}+{:#x} entered at {:#x}: {} bytes",
        addr,
        slice.len(),
        entry,
        emitter.code.len()
    );
    Fragment {
        base,
        code: emitter.code,
        entry: fragment_entry,
        map,
    }
}

/// Brings a thread interrupted at `context.pc` to the start of a translated op.
///
/// Returns the original address the thread continues at, which is where the signal is
/// delivered.
pub fn finish_instruction<R: FragmentRunner + ?Sized>(
    jit: &Jit,
    context: &mut SignalContext,
    runner: &mut R,
) -> u32 {
    let runtime = &jit.config().runtime;
    context.restart_syscall = false;
    for _ in 0..FINISH_ROUNDS {
        match jit.rev_lookup_addr(context.pc) {
            Some(op) if op.op_start == context.pc => {
                return if context.restart_syscall {
                    // back to the `int 0x80` / `sysenter`
                    op.addr.wrapping_sub(2)
                } else {
                    op.addr
                };
            }
            Some(op) => {
                let Some(slice) = jit.code_bytes(op.op_start, op.op_len) else {
                    fatal(JitError::FragmentEntryUnreachable(context.pc));
                };
                let fragment = build_fragment(
                    &slice,
                    op.op_start,
                    context.pc,
                    runner.fragment_page(),
                    jit.config(),
                );
                context.pc = fragment.entry;
                runner.run(Some(&fragment), context);
            }
            None => {
                if runtime.syscall_intr_critical.contains(&context.pc) {
                    // a syscall in progress is started over
                    context.pc = runtime.syscall_intr_critical.start;
                } else if runtime.cache_resolution.contains(&context.pc) {
                    context.pc = context
                        .pc
                        .wrapping_sub(runtime.cache_resolution.start)
                        .wrapping_add(runtime.reloc_cache_resolution);
                }
                runner.run(None, context);
            }
        }
    }
    fatal(JitError::UnfinishedInstruction(context.pc))
}
