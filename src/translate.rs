//! Translation of a single instruction.
//!
//! [`translate_op`] re-emits one decoded guest instruction into translated code: taint
//! propagation code goes in front of the unmodified instruction, control transfers are handed
//! to [`crate::control`], and the emulated instructions are replaced by transfers into the
//! runtime.

use std::ops::Range;

use crate::{
    classify::{
        classify, Action, AddressOp, Emulate, ImplicitOp, ModRmOp, OffsetOp, RegisterOffsetOp,
        RegisterOp, StringOp, TaintOp,
    },
    config::Config,
    control,
    decoder::DecodedInstruction,
    taint_code::{self, *},
    x86::{OperandSize, X86Instruction, ADDRESS_SIZE_PREFIX, OPERAND_SIZE_PREFIX},
};

/// A rel32 field whose target is only known once the whole block is translated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingPatch {
    /// Offset of the rel32 field from the start of the translation
    pub offset: usize,
    /// Original address the field has to reach
    pub target: u32,
}

/// A return address the translated code pre-seeds into the jump cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preseed {
    /// Original return address
    pub addr: u32,
    /// Translated return address
    pub jit_addr: u32,
}

/// Result of translating one instruction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Translation {
    /// Bytes appended
    pub len: usize,
    /// Jump to resolve after the block is translated
    pub patch: Option<PendingPatch>,
    /// Cache entry to insert once the code is installed
    pub preseed: Option<Preseed>,
}

/// Everything the translation of one instruction depends on
pub struct TranslationContext<'a> {
    /// Translator configuration
    pub config: &'a Config,
    /// Translated address of the first byte appended
    pub jit_addr: u32,
    /// Original code range being translated, transfers leaving it go through the resolver
    pub map: Range<u32>,
}

impl TranslationContext<'_> {
    /// The original address lies in the code map being translated
    pub fn contains(&self, addr: u32) -> bool {
        self.map.contains(&addr)
    }
}

/// Primitive emitting the taint propagation of a [`TaintOp`]
#[derive(Clone, Copy)]
pub enum Generator {
    /// Takes the ModRM operand
    ModRm(ModRmGenerator),
    /// Takes the register in the opcode and the stack
    RegisterOffset(RegisterOffsetGenerator),
    /// Takes a register
    Register(RegisterGenerator),
    /// Operands implied by the instruction, in memory
    Offset(OffsetGenerator),
    /// Operands implied by the instruction, in registers
    Implicit(ImplicitGenerator),
    /// Takes the absolute address of the instruction
    Address(AddressGenerator),
}

/// Generator and operand width of a [`TaintOp`]
#[derive(Clone, Copy)]
pub struct TaintDescriptor {
    /// Code generator
    pub generator: Generator,
    /// Operand width
    pub width: OperandSize,
    /// Operand width under an operand-size prefix, none for byte forms
    pub width16: Option<OperandSize>,
}

impl TaintDescriptor {
    const fn new(generator: Generator, width: OperandSize, width16: Option<OperandSize>) -> Self {
        Self {
            generator,
            width,
            width16,
        }
    }

    const fn full(generator: Generator) -> Self {
        Self::new(generator, OperandSize::S32, Some(OperandSize::S16))
    }

    const fn byte(generator: Generator) -> Self {
        Self::new(generator, OperandSize::S8, None)
    }

    /// Width selected by the operand-size prefix
    pub fn width_for(&self, operand_size_16: bool) -> OperandSize {
        match self.width16 {
            Some(width16) if operand_size_16 => width16,
            _ => self.width,
        }
    }
}

/// Generator and widths of every taint primitive
pub fn descriptor(op: TaintOp) -> TaintDescriptor {
    use Generator as G;
    match op {
        TaintOp::ModRm(op) => match op {
            ModRmOp::OrMemToReg => TaintDescriptor::full(G::ModRm(or_mem_to_reg)),
            ModRmOp::OrRegToMem => TaintDescriptor::full(G::ModRm(or_reg_to_mem)),
            ModRmOp::XorMemToReg => TaintDescriptor::full(G::ModRm(xor_mem_to_reg)),
            ModRmOp::XorRegToMem => TaintDescriptor::full(G::ModRm(xor_reg_to_mem)),
            ModRmOp::CopyMemToReg => TaintDescriptor::full(G::ModRm(copy_mem_to_reg)),
            ModRmOp::CopyRegToMem => TaintDescriptor::full(G::ModRm(copy_reg_to_mem)),
            ModRmOp::ByteOrMemToReg => TaintDescriptor::byte(G::ModRm(or_mem_to_reg)),
            ModRmOp::ByteOrRegToMem => TaintDescriptor::byte(G::ModRm(or_reg_to_mem)),
            ModRmOp::ByteXorMemToReg => TaintDescriptor::byte(G::ModRm(xor_mem_to_reg)),
            ModRmOp::ByteXorRegToMem => TaintDescriptor::byte(G::ModRm(xor_reg_to_mem)),
            ModRmOp::ByteCopyMemToReg => TaintDescriptor::byte(G::ModRm(copy_mem_to_reg)),
            ModRmOp::ByteCopyRegToMem => TaintDescriptor::byte(G::ModRm(copy_reg_to_mem)),
            ModRmOp::CopyZxMemToReg => TaintDescriptor::full(G::ModRm(copy_zx16_mem_to_reg)),
            // the byte source has a 16 bit destination under the prefix
            ModRmOp::ByteCopyZxMemToReg => TaintDescriptor::full(G::ModRm(copy_zx8_mem_to_reg)),
            ModRmOp::SwapRegMem => TaintDescriptor::full(G::ModRm(swap_reg_mem)),
            ModRmOp::ByteSwapRegMem => TaintDescriptor::byte(G::ModRm(swap_reg_mem)),
            ModRmOp::CopyMemToPush => TaintDescriptor::full(G::ModRm(copy_mem_to_push)),
            ModRmOp::CopyPopToMem => TaintDescriptor::full(G::ModRm(copy_pop_to_mem)),
            ModRmOp::EraseMem => TaintDescriptor::full(G::ModRm(erase_mem)),
            ModRmOp::ByteEraseMem => TaintDescriptor::byte(G::ModRm(erase_mem)),
            ModRmOp::Lea => TaintDescriptor::new(G::ModRm(taint_code::lea), OperandSize::S32, None),
        },
        TaintOp::RegisterOffset(op) => match op {
            RegisterOffsetOp::CopyRegToPush => {
                TaintDescriptor::full(G::RegisterOffset(copy_reg_to_push))
            }
            RegisterOffsetOp::CopyPopToReg => {
                TaintDescriptor::full(G::RegisterOffset(copy_pop_to_reg))
            }
        },
        TaintOp::Register(op) => match op {
            RegisterOp::SwapAxReg => TaintDescriptor::full(G::Register(swap_ax_reg)),
            RegisterOp::EraseReg => TaintDescriptor::full(G::Register(erase_reg)),
            RegisterOp::ByteEraseReg => TaintDescriptor::byte(G::Register(erase_reg)),
        },
        TaintOp::Offset(op) => match op {
            OffsetOp::ErasePush => TaintDescriptor::full(G::Offset(erase_push)),
            OffsetOp::Pusha => TaintDescriptor::full(G::Offset(pusha)),
            OffsetOp::Popa => TaintDescriptor::full(G::Offset(popa)),
            OffsetOp::Leave => TaintDescriptor::full(G::Offset(leave)),
            OffsetOp::Enter => TaintDescriptor::full(G::Offset(enter)),
        },
        TaintOp::String(op) => match op {
            StringOp::CopyStrToStr => TaintDescriptor::full(G::Offset(copy_str_to_str)),
            StringOp::CopyAxToStr => TaintDescriptor::full(G::Offset(copy_ax_to_str)),
            StringOp::CopyStrToAx => TaintDescriptor::full(G::Offset(copy_str_to_ax)),
            StringOp::ByteCopyStrToStr => TaintDescriptor::byte(G::Offset(copy_str_to_str)),
            StringOp::ByteCopyAlToStr => TaintDescriptor::byte(G::Offset(copy_ax_to_str)),
            StringOp::ByteCopyStrToAl => TaintDescriptor::byte(G::Offset(copy_str_to_ax)),
        },
        TaintOp::Implicit(op) => match op {
            ImplicitOp::EraseAx => TaintDescriptor::full(G::Implicit(erase_ax)),
            ImplicitOp::EraseDx => TaintDescriptor::full(G::Implicit(erase_dx)),
            ImplicitOp::EraseAxDx => TaintDescriptor::full(G::Implicit(erase_ax_dx)),
            ImplicitOp::EraseAxHigh => TaintDescriptor::full(G::Implicit(erase_ax_high)),
            ImplicitOp::ByteEraseAl => TaintDescriptor::byte(G::Implicit(erase_ax)),
        },
        TaintOp::Address(op) => match op {
            AddressOp::CopyAxToOffset => TaintDescriptor::full(G::Address(copy_ax_to_address)),
            AddressOp::CopyOffsetToAx => TaintDescriptor::full(G::Address(copy_address_to_ax)),
            AddressOp::ByteCopyAlToOffset => TaintDescriptor::byte(G::Address(copy_ax_to_address)),
            AddressOp::ByteCopyOffsetToAl => TaintDescriptor::byte(G::Address(copy_address_to_ax)),
        },
    }
}

/// Replacement of a taint primitive for an instruction with a segment override.
///
/// Segment relative operands are not tracked: a destination register is erased instead, any
/// other primitive is dropped.
pub fn downgrade_for_segment(op: TaintOp) -> Option<TaintOp> {
    use TaintOp::*;
    let erase_reg = Register(RegisterOp::EraseReg);
    let byte_erase_reg = Register(RegisterOp::ByteEraseReg);
    match op {
        ModRm(ModRmOp::CopyMemToReg)
        | ModRm(ModRmOp::CopyZxMemToReg)
        | ModRm(ModRmOp::ByteCopyZxMemToReg)
        | ModRm(ModRmOp::SwapRegMem)
        | Register(RegisterOp::SwapAxReg)
        | Register(RegisterOp::EraseReg) => Some(erase_reg),
        ModRm(ModRmOp::ByteCopyMemToReg)
        | ModRm(ModRmOp::ByteSwapRegMem)
        | Register(RegisterOp::ByteEraseReg) => Some(byte_erase_reg),
        String(StringOp::CopyStrToAx) | Address(AddressOp::CopyOffsetToAx) => {
            Some(Implicit(ImplicitOp::EraseAx))
        }
        String(StringOp::ByteCopyStrToAl) | Address(AddressOp::ByteCopyOffsetToAl) => {
            Some(Implicit(ImplicitOp::ByteEraseAl))
        }
        Implicit(op) => Some(Implicit(op)),
        _ => None,
    }
}

/// The ModRM operand of an instruction that has one
fn modrm_operand(instruction: &DecodedInstruction) -> Option<ModRmOperand<'_>> {
    let bytes = instruction.modrm_bytes();
    (!bytes.is_empty())
        .then(|| ModRmOperand::new(bytes, instruction.prefixes.is_address_size_16()))
}

/// Register named by the instruction: the ModRM reg field, or the low bits of the opcode
fn register_operand(instruction: &DecodedInstruction) -> u8 {
    match instruction.modrm() {
        Some(modrm) => (modrm >> 3) & 7,
        None => instruction.opcode_byte() & 7,
    }
}

/// Absolute address of a `moffs` operand
fn offset_operand(instruction: &DecodedInstruction) -> u32 {
    if instruction.prefixes.is_address_size_16() {
        instruction.immediate(OperandSize::S16) as u32 & 0xffff
    } else {
        instruction.immediate(OperandSize::S32) as u32
    }
}

/// Appends the taint propagation code of `op` for `instruction`
pub fn emit_taint(
    dest: &mut Vec<u8>,
    op: TaintOp,
    instruction: &DecodedInstruction,
    taint_offset: u32,
) {
    let descriptor = descriptor(op);
    let size = descriptor.width_for(instruction.prefixes.is_operand_size_16());
    match descriptor.generator {
        Generator::ModRm(generator) => match modrm_operand(instruction) {
            Some(operand) => generator(dest, size, &operand, taint_offset),
            None => crate::error::fatal(crate::error::JitError::UnimplementedAction(
                instruction.addr,
                "taint without ModRM operand",
            )),
        },
        Generator::RegisterOffset(generator) => {
            generator(dest, size, instruction.opcode_byte() & 7, taint_offset)
        }
        Generator::Register(generator) => generator(dest, size, register_operand(instruction)),
        Generator::Offset(generator) => generator(dest, size, taint_offset),
        Generator::Implicit(generator) => generator(dest, size),
        Generator::Address(generator) => {
            generator(dest, size, offset_operand(instruction), taint_offset)
        }
    }
}

fn copy_instruction(dest: &mut Vec<u8>, instruction: &DecodedInstruction) {
    dest.extend_from_slice(instruction.bytes());
}

fn taint_instruction(
    dest: &mut Vec<u8>,
    op: TaintOp,
    instruction: &DecodedInstruction,
    config: &Config,
) {
    let op = if instruction.prefixes.has_segment_override() {
        downgrade_for_segment(op)
    } else {
        Some(op)
    };
    if let Some(op) = op {
        if config.taint {
            emit_taint(dest, op, instruction, config.layout.taint_offset);
        }
    }
    copy_instruction(dest, instruction);
}

/// `rep` string instruction, one element per iteration:
/// `jecxz end; <taint>; [66][67] op; loop start`
fn taint_rep(dest: &mut Vec<u8>, op: TaintOp, instruction: &DecodedInstruction, config: &Config) {
    if instruction.prefixes.has_segment_override() {
        copy_instruction(dest, instruction);
        return;
    }
    let start = dest.len();
    let address_size_16 = instruction.prefixes.is_address_size_16();
    if address_size_16 {
        dest.push(ADDRESS_SIZE_PREFIX);
    }
    dest.extend_from_slice(&[0xe3, 0]);
    let skip_field = dest.len() - 1;
    if config.taint {
        emit_taint(dest, op, instruction, config.layout.taint_offset);
    }
    if instruction.prefixes.is_operand_size_16() {
        dest.push(OPERAND_SIZE_PREFIX);
    }
    if address_size_16 {
        dest.push(ADDRESS_SIZE_PREFIX);
    }
    dest.push(instruction.opcode_byte());
    if address_size_16 {
        dest.push(ADDRESS_SIZE_PREFIX);
    }
    dest.extend_from_slice(&[0xe2, 0]);
    let len = dest.len() - start;
    debug_assert!(len <= i8::MAX as usize);
    dest[skip_field] = (dest.len() - skip_field - 1) as u8;
    let last = dest.len() - 1;
    dest[last] = (-(len as i32)) as u8;
}

/// `cmovcc reg, r/m`: `j!cc skip; <taint reg = r/m>; mov reg, r/m; skip:`
fn conditional_move(dest: &mut Vec<u8>, instruction: &DecodedInstruction, config: &Config) {
    let condition = instruction.opcode_byte() & 0x0f;
    let mut body = Vec::new();
    if config.taint {
        let op = if instruction.prefixes.has_segment_override() {
            TaintOp::Register(RegisterOp::EraseReg)
        } else {
            TaintOp::ModRm(ModRmOp::CopyMemToReg)
        };
        emit_taint(&mut body, op, instruction, config.layout.taint_offset);
    }
    // the escape byte goes, the prefixes stay
    body.extend_from_slice(&instruction.bytes()[..instruction.opcode_offset - 1]);
    body.push(0x8b);
    body.extend_from_slice(&instruction.bytes()[instruction.mrm..]);
    debug_assert!(body.len() <= i8::MAX as usize);
    X86Instruction::short_conditional_jump(condition ^ 1, body.len() as i8).emit(dest);
    dest.extend_from_slice(&body);
}

/// Compare-exchange family: the operand address is recorded, the instruction runs unmodified,
/// then the taint follows the direction the exchange took
fn compare_exchange(
    dest: &mut Vec<u8>,
    emulate: Emulate,
    instruction: &DecodedInstruction,
    config: &Config,
) {
    let operand = modrm_operand(instruction)
        .filter(|_| config.taint && !instruction.prefixes.has_segment_override());
    let Some(operand) = operand else {
        copy_instruction(dest, instruction);
        return;
    };
    let taint_offset = config.layout.taint_offset;
    cmpxchg_pre(dest, &operand);
    copy_instruction(dest, instruction);
    match emulate {
        Emulate::CmpXchg8 => cmpxchg_post(dest, OperandSize::S8, &operand, taint_offset),
        Emulate::CmpXchg8B => cmpxchg8b_post(dest, &operand, taint_offset),
        _ => {
            let size = if instruction.prefixes.is_operand_size_16() {
                OperandSize::S16
            } else {
                OperandSize::S32
            };
            cmpxchg_post(dest, size, &operand, taint_offset)
        }
    }
}

/// Appends the translation of `instruction` to `dest`
pub fn translate_op(
    dest: &mut Vec<u8>,
    instruction: &DecodedInstruction,
    context: &TranslationContext,
) -> Translation {
    let start = dest.len();
    let config = context.config;
    let action = classify(instruction);
    log::trace!(
        "translate {:#x} {:02x?} as {:?}",
        instruction.addr,
        instruction.bytes(),
        action
    );
    match action {
        Action::Control(control) => {
            return control::translate_control(dest, instruction, control, context);
        }
        Action::Taint(op @ TaintOp::String(_)) if instruction.prefixes.has_repeat() => {
            taint_rep(dest, op, instruction, config)
        }
        Action::Taint(op) => taint_instruction(dest, op, instruction, config),
        Action::Copy => copy_instruction(dest, instruction),
        Action::ConditionalMove => conditional_move(dest, instruction, config),
        Action::Illegal => X86Instruction::undefined().emit(dest),
        Action::Emulate(
            emulate @ (Emulate::CmpXchg8 | Emulate::CmpXchg | Emulate::CmpXchg8B),
        ) => compare_exchange(dest, emulate, instruction, config),
        Action::Emulate(emulate) => {
            return control::translate_emulation(dest, instruction, emulate, context);
        }
    }
    Translation {
        len: dest.len() - start,
        ..Translation::default()
    }
}
