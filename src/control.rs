//! Control transfer translation.
//!
//! Translated code never leaves the translated-code range on its own: direct transfers inside
//! the code map become jumps to the (patched later) translation of their target, everything
//! else goes through the runtime's indirect jump resolver with the original target in `eax`
//! and its taint in `ecx`.

use crate::{
    classify::{Control, Emulate},
    codegen::{gen_code, relative_to, Arg, Emitted},
    config::CallStrategy,
    context::ThreadCtxSlot,
    decoder::DecodedInstruction,
    error::{fatal, JitError},
    jump_cache::hash_index,
    taint_code::{clear_ijmp_taint, erase_push, ijmp_taint, ModRmOperand},
    translate::{PendingPatch, Preseed, Translation, TranslationContext},
    x86::{
        OperandSize, X86IndirectAccess, X86Instruction,
        X86Register::{EAX, ECX},
        ADDRESS_SIZE_PREFIX, FS_PREFIX,
    },
};

struct ControlEmitter<'a, 'b> {
    dest: &'a mut Vec<u8>,
    start: usize,
    context: &'a TranslationContext<'b>,
    patch: Option<PendingPatch>,
    preseed: Option<Preseed>,
    /// Return address and the offset of the field receiving its translated address
    preseed_field: Option<(u32, usize)>,
}

impl<'a, 'b> ControlEmitter<'a, 'b> {
    fn new(dest: &'a mut Vec<u8>, context: &'a TranslationContext<'b>) -> Self {
        let start = dest.len();
        Self {
            dest,
            start,
            context,
            patch: None,
            preseed: None,
            preseed_field: None,
        }
    }

    fn len(&self) -> usize {
        self.dest.len() - self.start
    }

    /// Translated address of the next byte
    fn pc(&self) -> u32 {
        self.context.jit_addr.wrapping_add(self.len() as u32)
    }

    fn gen(&mut self, template: &str, args: &[Arg]) -> Emitted {
        gen_code(self.dest, template, args)
    }

    fn taint(&self) -> bool {
        self.context.config.taint
    }

    /// `jmp` to a fixed translated address
    fn jump_to(&mut self, target: u32) {
        let rel = relative_to(self.pc().wrapping_add(5), target);
        X86Instruction::jump_immediate(rel).emit(self.dest);
    }

    /// Saves the scratch registers the resolver takes its arguments in
    fn save_resolver_registers(&mut self) {
        self.gen(
            "64 89 0D L 64 A3 L",
            &[
                ThreadCtxSlot::SavedEcx.offset().into(),
                ThreadCtxSlot::SavedEax.offset().into(),
            ],
        );
    }

    /// Leaves the code map: the resolver looks up (or translates) an untainted constant target
    fn cross_map_jump(&mut self, target: u32) {
        self.save_resolver_registers();
        X86Instruction::load_immediate(EAX, target).emit(self.dest);
        X86Instruction::load_immediate(ECX, 0).emit(self.dest);
        self.jump_to(self.context.config.runtime.ijmp);
    }

    /// `jmp` to the translation of an original address
    fn jump(&mut self, target: u32) {
        if self.context.contains(target) {
            X86Instruction::jump_immediate(0).emit(self.dest);
            self.patch = Some(PendingPatch {
                offset: self.len() - 4,
                target,
            });
        } else {
            self.cross_map_jump(target);
        }
    }

    fn conditional_jump(&mut self, condition: u8, target: u32) {
        if self.context.contains(target) {
            X86Instruction::conditional_jump_immediate(0x80 | condition, 0).emit(self.dest);
            self.patch = Some(PendingPatch {
                offset: self.len() - 4,
                target,
            });
        } else {
            let emitted = self.gen("70 + &00", &[(condition ^ 1).into()]);
            let skip = emitted.mark(0);
            self.cross_map_jump(target);
            self.dest[skip] = (self.dest.len() - skip - 1) as u8;
        }
    }

    /// `loop rel8` keeps its condition: `loop 1f; jmp 2f; 1: <jump>; 2:`
    fn loop_jump(&mut self, instruction: &DecodedInstruction, target: u32) {
        let bytes = instruction.bytes();
        let emitted = self.gen("$ 02 EB &00", &[(&bytes[..bytes.len() - 1]).into()]);
        let skip = emitted.mark(0);
        self.jump(target);
        self.dest[skip] = (self.dest.len() - skip - 1) as u8;
    }

    /// `push $return_address`, then let the resolver find the return site early
    fn push_return_address(&mut self, return_address: u32) {
        X86Instruction::push_immediate(return_address).emit(self.dest);
        let hash = hash_index(return_address) as u32;
        match self.context.config.call_strategy {
            CallStrategy::PreseedOnCall => {
                let emitted = self.gen(
                    "64 C7 05 L L 64 C7 05 L &00 00 00 00",
                    &[(hash * 8).into(), return_address.into(), (hash * 8 + 4).into()],
                );
                // the translated return site is only known once the transfer is emitted
                self.preseed_field = Some((return_address, emitted.mark(0)));
            }
            CallStrategy::PrefetchOnCall => {
                X86Instruction::prefetch(X86IndirectAccess::Absolute(hash * 8))
                    .with_segment(FS_PREFIX)
                    .emit(self.dest);
            }
            CallStrategy::None => {}
        }
    }

    /// Fills in the translated return site now that the whole call is emitted
    fn finish_preseed(&mut self) {
        if let Some((addr, field)) = self.preseed_field.take() {
            let return_site = self.pc();
            self.dest[field..field + 4].copy_from_slice(&return_site.to_le_bytes());
            self.preseed = Some(Preseed {
                addr,
                jit_addr: return_site,
            });
        }
    }

    fn call(&mut self, instruction: &DecodedInstruction, target: u32) {
        if self.taint() {
            erase_push(self.dest, OperandSize::S32, self.context.config.layout.taint_offset);
        }
        self.push_return_address(instruction.end());
        self.jump(target);
        self.finish_preseed();
    }

    /// `eax` receives the transfer target, `ecx` its taint
    fn load_indirect_target(&mut self, instruction: &DecodedInstruction) {
        let modrm = instruction.modrm_bytes();
        let operand = ModRmOperand::new(modrm, instruction.prefixes.is_address_size_16());
        if self.taint() && !instruction.prefixes.has_segment_override() {
            ijmp_taint(self.dest, &operand, self.context.config.layout.taint_offset);
        } else {
            clear_ijmp_taint(self.dest);
        }
        self.save_resolver_registers();
        let address_size = if instruction.prefixes.is_address_size_16() {
            ADDRESS_SIZE_PREFIX
        } else {
            0
        };
        let emitted = self.gen(
            "? ? 8B &$",
            &[
                instruction.prefixes.segment.into(),
                address_size.into(),
                modrm.into(),
            ],
        );
        self.dest[emitted.mark(0)] &= 0xc7;
        self.gen("64 8B 0D L", &[ThreadCtxSlot::IjmpTaint.offset().into()]);
    }

    fn indirect_jump(&mut self, instruction: &DecodedInstruction) {
        self.load_indirect_target(instruction);
        self.jump_to(self.context.config.runtime.ijmp);
    }

    fn indirect_call(&mut self, instruction: &DecodedInstruction) {
        self.load_indirect_target(instruction);
        if self.taint() {
            erase_push(self.dest, OperandSize::S32, self.context.config.layout.taint_offset);
        }
        self.push_return_address(instruction.end());
        self.jump_to(self.context.config.runtime.ijmp);
        self.finish_preseed();
    }

    /// `ret imm16`: the return address and its taint go to the resolver, the arguments are
    /// dropped
    fn return_cleanup(&mut self, instruction: &DecodedInstruction) {
        let cleanup = instruction.immediate(OperandSize::S16) as u16;
        self.save_resolver_registers();
        self.gen(
            "8B 8C 24 L 58 8D A4 24 S 00 00",
            &[self.context.config.layout.taint_offset.into(), cleanup.into()],
        );
        self.jump_to(self.context.config.runtime.ijmp);
    }

    /// Hands the thread to a runtime syscall entry point, resuming at `resume` afterwards
    fn syscall(&mut self, resume: Option<u32>, entry: u32) {
        self.gen(
            "64 C7 05 L 00 00 00 00",
            &[ThreadCtxSlot::IjmpTaint.offset().into()],
        );
        if let Some(resume) = resume {
            self.gen(
                "64 C7 05 L L",
                &[ThreadCtxSlot::UserEip.offset().into(), resume.into()],
            );
        }
        self.jump_to(entry);
    }

    fn cpuid(&mut self) {
        let emitted = self.gen(
            "64 C7 05 L &00 00 00 00",
            &[ThreadCtxSlot::JitEip.offset().into()],
        );
        let field = emitted.mark(0);
        self.jump_to(self.context.config.runtime.cpuid_emu);
        let resume = self.pc();
        self.dest[field..field + 4].copy_from_slice(&resume.to_le_bytes());
    }

    fn illegal(&mut self) {
        X86Instruction::undefined().emit(self.dest);
    }

    fn finish(self) -> Translation {
        Translation {
            len: self.len(),
            patch: self.patch,
            preseed: self.preseed,
        }
    }
}

/// Target of a direct transfer, truncated to 16 bits for a 16 bit immediate
fn direct_target(instruction: &DecodedInstruction, control: Control) -> u32 {
    let mut imm_len = instruction.imm_len();
    if control == Control::JumpFar {
        imm_len = imm_len.saturating_sub(2);
    }
    let size = match imm_len {
        0 => OperandSize::S0,
        1 => OperandSize::S8,
        2 => OperandSize::S16,
        _ => OperandSize::S32,
    };
    let imm = instruction.immediate(size) as u32;
    let target = match control {
        Control::JumpFar => imm,
        _ => instruction.end().wrapping_add(imm),
    };
    if imm_len == 2 {
        target & 0xffff
    } else {
        target
    }
}

/// Appends the translation of a control transfer
pub fn translate_control(
    dest: &mut Vec<u8>,
    instruction: &DecodedInstruction,
    control: Control,
    context: &TranslationContext,
) -> Translation {
    let mut emitter = ControlEmitter::new(dest, context);
    match control {
        Control::JumpRelative | Control::JumpFar => {
            emitter.jump(direct_target(instruction, control))
        }
        Control::JumpConditional => emitter.conditional_jump(
            instruction.opcode_byte() & 0x0f,
            direct_target(instruction, control),
        ),
        Control::Loop => emitter.loop_jump(instruction, direct_target(instruction, control)),
        Control::CallRelative => emitter.call(instruction, direct_target(instruction, control)),
        Control::JumpIndirect => emitter.indirect_jump(instruction),
        Control::CallIndirect => emitter.indirect_call(instruction),
        Control::Return => emitter.jump_to(context.config.runtime.ret),
        Control::ReturnCleanup => emitter.return_cleanup(instruction),
        Control::Join => emitter.illegal(),
        Control::CallFar => fatal(JitError::UnimplementedAction(instruction.addr, "far call")),
        Control::ReturnFar => fatal(JitError::UnimplementedAction(instruction.addr, "far return")),
    }
    emitter.finish()
}

/// Appends a jump to the translation of `target`, for a block that runs into code translated
/// earlier or off the end of its code map
pub fn translate_jump(
    dest: &mut Vec<u8>,
    target: u32,
    context: &TranslationContext,
) -> Translation {
    let mut emitter = ControlEmitter::new(dest, context);
    emitter.jump(target);
    emitter.finish()
}

/// Appends the translation of an instruction the runtime emulates
pub fn translate_emulation(
    dest: &mut Vec<u8>,
    instruction: &DecodedInstruction,
    emulate: Emulate,
    context: &TranslationContext,
) -> Translation {
    let runtime = &context.config.runtime;
    let mut emitter = ControlEmitter::new(dest, context);
    match emulate {
        Emulate::Interrupt if instruction.immediate(OperandSize::S8) as u8 == 0x80 => {
            emitter.syscall(Some(instruction.end()), runtime.int80_emu)
        }
        Emulate::Interrupt => {
            emitter.dest.extend_from_slice(instruction.bytes());
        }
        Emulate::Syscall => emitter.syscall(Some(instruction.end()), runtime.syscall_emu),
        Emulate::Sysenter => emitter.syscall(None, runtime.sysenter_emu),
        Emulate::Cpuid => emitter.cpuid(),
        Emulate::CmpXchg8 | Emulate::CmpXchg | Emulate::CmpXchg8B => fatal(
            JitError::UnimplementedAction(instruction.addr, "compare exchange as emulation"),
        ),
    }
    emitter.finish()
}
