#![allow(clippy::arithmetic_side_effects)]
//! Taint propagation primitives.
//!
//! Every primitive appends code that updates the shadow state to reflect the data movement of
//! the guest instruction that follows it. Memory taint lives at `address + taint_offset`, register
//! taint in the thread context (see [`crate::context`]). The primitives use `eax` (and `ecx` for
//! operand addresses) as scratch registers, saved to and restored from the thread context, and
//! bracket `or` merges with `pushf` / `popf`, so the guest observes no change.

use crate::{
    context::{reg8_taint_offset, reg_taint_offset, ThreadCtxSlot},
    x86::{
        OperandSize, X86IndirectAccess, X86Instruction,
        X86Register::{self, *},
        ADDRESS_SIZE_PREFIX, FS_PREFIX,
    },
};

/// ModRM, SIB and displacement bytes of a guest instruction, with its addressing mode
#[derive(Debug, Clone, Copy)]
pub struct ModRmOperand<'a> {
    bytes: &'a [u8],
    address_size_16: bool,
}

impl<'a> ModRmOperand<'a> {
    /// Wraps the ModRM bytes, `bytes` must not be empty
    pub fn new(bytes: &'a [u8], address_size_16: bool) -> Self {
        debug_assert!(!bytes.is_empty());
        Self {
            bytes,
            address_size_16,
        }
    }

    /// The ModRM bytes
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    fn modrm(&self) -> u8 {
        self.bytes[0]
    }

    fn mode(&self) -> u8 {
        self.modrm() >> 6
    }

    /// The reg field
    pub fn reg(&self) -> u8 {
        (self.modrm() >> 3) & 7
    }

    /// The rm field
    pub fn rm(&self) -> u8 {
        self.modrm() & 7
    }

    /// The operand is a register
    pub fn is_register(&self) -> bool {
        self.mode() == 3
    }

    /// Memory operand based on `esp`
    pub fn has_stack_pointer_base(&self) -> bool {
        !self.address_size_16
            && !self.is_register()
            && self.rm() == 4
            && self.bytes.get(1).is_some_and(|sib| sib & 7 == ESP as u8)
    }

    /// Registers summed up by the address computation
    pub fn address_registers(&self) -> Vec<X86Register> {
        if self.is_register() {
            return Vec::new();
        }
        let mode = self.mode();
        let rm = self.rm();
        if self.address_size_16 {
            return match rm {
                0 => vec![EBX, ESI],
                1 => vec![EBX, EDI],
                2 => vec![EBP, ESI],
                3 => vec![EBP, EDI],
                4 => vec![ESI],
                5 => vec![EDI],
                6 if mode == 0 => Vec::new(),
                6 => vec![EBP],
                _ => vec![EBX],
            };
        }
        if rm == 5 && mode == 0 {
            return Vec::new();
        }
        if rm != 4 {
            return vec![X86Register::from_index(rm)];
        }
        let sib = self.bytes.get(1).copied().unwrap_or(0x24);
        let mut registers = Vec::with_capacity(2);
        let base = sib & 7;
        if !(base == 5 && mode == 0) {
            registers.push(X86Register::from_index(base));
        }
        let index = (sib >> 3) & 7;
        if index != ESP as u8 {
            registers.push(X86Register::from_index(index));
        }
        registers
    }

    /// Appends `lea <operand>, %ecx`
    pub fn emit_lea_ecx(&self, dest: &mut Vec<u8>) {
        if self.address_size_16 {
            dest.push(ADDRESS_SIZE_PREFIX);
        }
        dest.push(0x8d);
        dest.push((self.modrm() & 0xc7) | ((ECX as u8) << 3));
        dest.extend_from_slice(&self.bytes[1..]);
    }
}

/// Where a taint value lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    /// Thread context slot at this `fs` offset
    Slot(u32),
    /// Shadow of the address in `ecx`, plus a displacement
    ShadowEcx(i32),
    /// Shadow of `[base + displacement]`
    Shadow(X86Register, i32),
    /// Shadow of an absolute address
    ShadowAbsolute(u32),
}

/// Taint slot of a register operand
fn register_slot(size: OperandSize, reg: u8) -> Location {
    match size {
        OperandSize::S8 => Location::Slot(reg8_taint_offset(reg)),
        _ => Location::Slot(reg_taint_offset(X86Register::from_index(reg))),
    }
}

fn slot_of(reg: X86Register) -> Location {
    Location::Slot(reg_taint_offset(reg))
}

fn fs_slot(slot: ThreadCtxSlot) -> X86IndirectAccess {
    X86IndirectAccess::Absolute(slot.offset())
}

struct TaintEmitter<'a> {
    dest: &'a mut Vec<u8>,
    taint_offset: u32,
}

impl<'a> TaintEmitter<'a> {
    fn new(dest: &'a mut Vec<u8>, taint_offset: u32) -> Self {
        Self { dest, taint_offset }
    }

    fn emit_ins(&mut self, instruction: X86Instruction) {
        instruction.emit(self.dest);
    }

    fn access(&self, location: Location) -> (X86Register, X86IndirectAccess, u8) {
        let shadow = |displacement: i32| self.taint_offset.wrapping_add(displacement as u32) as i32;
        match location {
            Location::Slot(offset) => (EAX, X86IndirectAccess::Absolute(offset), FS_PREFIX),
            Location::ShadowEcx(displacement) => {
                (ECX, X86IndirectAccess::Offset(shadow(displacement)), 0)
            }
            Location::Shadow(base, displacement) => {
                (base, X86IndirectAccess::Offset(shadow(displacement)), 0)
            }
            Location::ShadowAbsolute(address) => (
                EAX,
                X86IndirectAccess::Absolute(address.wrapping_add(self.taint_offset)),
                0,
            ),
        }
    }

    fn save_scratch(&mut self, ecx: bool) {
        if ecx {
            self.emit_ins(
                X86Instruction::store(OperandSize::S32, ECX, EAX, fs_slot(ThreadCtxSlot::SavedEcx))
                    .with_segment(FS_PREFIX),
            );
        }
        self.emit_ins(
            X86Instruction::store(OperandSize::S32, EAX, EAX, fs_slot(ThreadCtxSlot::SavedEax))
                .with_segment(FS_PREFIX),
        );
    }

    fn restore_scratch(&mut self, ecx: bool) {
        self.emit_ins(
            X86Instruction::load(OperandSize::S32, EAX, EAX, fs_slot(ThreadCtxSlot::SavedEax))
                .with_segment(FS_PREFIX),
        );
        if ecx {
            self.emit_ins(
                X86Instruction::load(OperandSize::S32, EAX, ECX, fs_slot(ThreadCtxSlot::SavedEcx))
                    .with_segment(FS_PREFIX),
            );
        }
    }

    fn load_eax(&mut self, size: OperandSize, from: Location) {
        let (base, indirect, segment) = self.access(from);
        self.emit_ins(X86Instruction::load(size, base, EAX, indirect).with_segment(segment));
    }

    fn store_eax(&mut self, size: OperandSize, to: Location) {
        let (base, indirect, segment) = self.access(to);
        self.emit_ins(X86Instruction::store(size, EAX, base, indirect).with_segment(segment));
    }

    /// `to = from`, `eax` must be saved
    fn copy(&mut self, size: OperandSize, from: Location, to: Location) {
        self.load_eax(size, from);
        self.store_eax(size, to);
    }

    /// `to |= from`, `eax` must be saved
    fn merge(&mut self, size: OperandSize, from: Location, to: Location) {
        let (base, indirect, segment) = self.access(to);
        self.emit_ins(X86Instruction::push_flags());
        self.load_eax(size, from);
        self.emit_ins(
            X86Instruction::alu(size, 0x09, EAX, base, Some(indirect)).with_segment(segment),
        );
        self.emit_ins(X86Instruction::pop_flags());
    }

    /// `to = 0`, needs no scratch register unless `to` is relative to `ecx`
    fn clear(&mut self, size: OperandSize, to: Location) {
        let (base, indirect, segment) = self.access(to);
        self.emit_ins(
            X86Instruction::store_immediate(size, base, indirect, 0).with_segment(segment),
        );
    }

    /// `lea -size(%esp), %ecx`
    fn lea_push_slot(&mut self, size: OperandSize) {
        self.emit_ins(X86Instruction::lea(
            ESP,
            ECX,
            Some(X86IndirectAccess::Offset(-(size.bytes() as i32))),
        ));
    }

    /// Runs `body` with `eax` and `ecx` saved and the ModRM operand's taint location
    fn with_operand(
        &mut self,
        operand: &ModRmOperand,
        size: OperandSize,
        body: impl FnOnce(&mut Self, Location),
    ) {
        self.save_scratch(true);
        let location = if operand.is_register() {
            register_slot(size, operand.rm())
        } else {
            operand.emit_lea_ecx(self.dest);
            Location::ShadowEcx(0)
        };
        body(self, location);
        self.restore_scratch(true);
    }
}

/// Signature of the primitives taking a ModRM operand
pub type ModRmGenerator = fn(&mut Vec<u8>, OperandSize, &ModRmOperand, u32);
/// Signature of the primitives taking a register and the stack
pub type RegisterOffsetGenerator = fn(&mut Vec<u8>, OperandSize, u8, u32);
/// Signature of the primitives taking a register
pub type RegisterGenerator = fn(&mut Vec<u8>, OperandSize, u8);
/// Signature of the primitives with memory operands implied by the instruction
pub type OffsetGenerator = fn(&mut Vec<u8>, OperandSize, u32);
/// Signature of the primitives with implicit register operands
pub type ImplicitGenerator = fn(&mut Vec<u8>, OperandSize);
/// Signature of the primitives taking an absolute address
pub type AddressGenerator = fn(&mut Vec<u8>, OperandSize, u32, u32);

/// `reg |= r/m`
pub fn or_mem_to_reg(
    dest: &mut Vec<u8>,
    size: OperandSize,
    operand: &ModRmOperand,
    taint_offset: u32,
) {
    let reg = register_slot(size, operand.reg());
    TaintEmitter::new(dest, taint_offset).with_operand(operand, size, |emitter, rm| {
        emitter.merge(size, rm, reg)
    });
}

/// `r/m |= reg`
pub fn or_reg_to_mem(
    dest: &mut Vec<u8>,
    size: OperandSize,
    operand: &ModRmOperand,
    taint_offset: u32,
) {
    let reg = register_slot(size, operand.reg());
    TaintEmitter::new(dest, taint_offset).with_operand(operand, size, |emitter, rm| {
        emitter.merge(size, reg, rm)
    });
}

/// `xor reg, r/m`: a register xored with itself is cleared
pub fn xor_mem_to_reg(
    dest: &mut Vec<u8>,
    size: OperandSize,
    operand: &ModRmOperand,
    taint_offset: u32,
) {
    if operand.is_register() && operand.reg() == operand.rm() {
        TaintEmitter::new(dest, taint_offset).clear(size, register_slot(size, operand.reg()));
    } else {
        or_mem_to_reg(dest, size, operand, taint_offset);
    }
}

/// `xor r/m, reg`: a register xored with itself is cleared
pub fn xor_reg_to_mem(
    dest: &mut Vec<u8>,
    size: OperandSize,
    operand: &ModRmOperand,
    taint_offset: u32,
) {
    if operand.is_register() && operand.reg() == operand.rm() {
        TaintEmitter::new(dest, taint_offset).clear(size, register_slot(size, operand.rm()));
    } else {
        or_reg_to_mem(dest, size, operand, taint_offset);
    }
}

/// `reg = r/m`
pub fn copy_mem_to_reg(
    dest: &mut Vec<u8>,
    size: OperandSize,
    operand: &ModRmOperand,
    taint_offset: u32,
) {
    let reg = register_slot(size, operand.reg());
    TaintEmitter::new(dest, taint_offset).with_operand(operand, size, |emitter, rm| {
        emitter.copy(size, rm, reg)
    });
}

/// `r/m = reg`
pub fn copy_reg_to_mem(
    dest: &mut Vec<u8>,
    size: OperandSize,
    operand: &ModRmOperand,
    taint_offset: u32,
) {
    let reg = register_slot(size, operand.reg());
    TaintEmitter::new(dest, taint_offset).with_operand(operand, size, |emitter, rm| {
        emitter.copy(size, reg, rm)
    });
}

fn copy_zero_extended(
    dest: &mut Vec<u8>,
    source_size: OperandSize,
    size: OperandSize,
    operand: &ModRmOperand,
    taint_offset: u32,
) {
    let reg = reg_taint_offset(X86Register::from_index(operand.reg()));
    TaintEmitter::new(dest, taint_offset).with_operand(operand, source_size, |emitter, rm| {
        emitter.copy(source_size, rm, Location::Slot(reg));
        match (source_size, size) {
            (OperandSize::S8, OperandSize::S16) => {
                emitter.clear(OperandSize::S8, Location::Slot(reg + 1))
            }
            (OperandSize::S8, _) => {
                emitter.clear(OperandSize::S8, Location::Slot(reg + 1));
                emitter.clear(OperandSize::S16, Location::Slot(reg + 2));
            }
            (OperandSize::S16, OperandSize::S32) => {
                emitter.clear(OperandSize::S16, Location::Slot(reg + 2))
            }
            _ => {}
        }
    });
}

/// `movzx` / `movsx reg, r/m16`: the low word is copied, the rest cleared
pub fn copy_zx16_mem_to_reg(
    dest: &mut Vec<u8>,
    size: OperandSize,
    operand: &ModRmOperand,
    taint_offset: u32,
) {
    copy_zero_extended(dest, OperandSize::S16, size, operand, taint_offset);
}

/// `movzx` / `movsx reg, r/m8`: the low byte is copied, the rest cleared
pub fn copy_zx8_mem_to_reg(
    dest: &mut Vec<u8>,
    size: OperandSize,
    operand: &ModRmOperand,
    taint_offset: u32,
) {
    copy_zero_extended(dest, OperandSize::S8, size, operand, taint_offset);
}

/// `xchg reg, r/m`
pub fn swap_reg_mem(
    dest: &mut Vec<u8>,
    size: OperandSize,
    operand: &ModRmOperand,
    taint_offset: u32,
) {
    let reg = register_slot(size, operand.reg());
    TaintEmitter::new(dest, taint_offset).with_operand(operand, size, |emitter, rm| {
        emitter.load_eax(size, rm);
        let (base, indirect, segment) = emitter.access(reg);
        emitter.emit_ins(
            X86Instruction::xchg(size, EAX, base, Some(indirect)).with_segment(segment),
        );
        emitter.store_eax(size, rm);
    });
}

/// `push r/m`: the shadow of the new stack top receives the operand's taint
pub fn copy_mem_to_push(
    dest: &mut Vec<u8>,
    size: OperandSize,
    operand: &ModRmOperand,
    taint_offset: u32,
) {
    TaintEmitter::new(dest, taint_offset).with_operand(operand, size, |emitter, rm| {
        emitter.load_eax(size, rm);
        emitter.lea_push_slot(size);
        emitter.store_eax(size, Location::ShadowEcx(0));
    });
}

/// `pop r/m`: the operand receives the taint of the stack top. An `esp` based address is
/// computed after the increment.
pub fn copy_pop_to_mem(
    dest: &mut Vec<u8>,
    size: OperandSize,
    operand: &ModRmOperand,
    taint_offset: u32,
) {
    let stack_based = operand.has_stack_pointer_base();
    TaintEmitter::new(dest, taint_offset).with_operand(operand, size, |emitter, rm| {
        if stack_based {
            emitter.emit_ins(X86Instruction::lea(
                ECX,
                ECX,
                Some(X86IndirectAccess::Offset(size.bytes() as i32)),
            ));
        }
        emitter.copy(size, Location::Shadow(ESP, 0), rm);
    });
}

/// The operand receives an untainted value
pub fn erase_mem(dest: &mut Vec<u8>, size: OperandSize, operand: &ModRmOperand, taint_offset: u32) {
    let mut emitter = TaintEmitter::new(dest, taint_offset);
    if operand.is_register() {
        emitter.clear(size, register_slot(size, operand.rm()));
    } else {
        emitter.with_operand(operand, size, |emitter, rm| emitter.clear(size, rm));
    }
}

/// `lea reg, m`: the result is tainted by the registers of the address computation
pub fn lea(dest: &mut Vec<u8>, size: OperandSize, operand: &ModRmOperand, taint_offset: u32) {
    let reg = register_slot(size, operand.reg());
    let mut emitter = TaintEmitter::new(dest, taint_offset);
    let registers = operand.address_registers();
    let Some((first, rest)) = registers.split_first() else {
        emitter.clear(size, reg);
        return;
    };
    emitter.save_scratch(false);
    emitter.load_eax(size, slot_of(*first));
    if !rest.is_empty() {
        emitter.emit_ins(X86Instruction::push_flags());
        for register in rest {
            let (_, indirect, segment) = emitter.access(slot_of(*register));
            emitter.emit_ins(
                X86Instruction::alu(size, 0x0b, EAX, EAX, Some(indirect)).with_segment(segment),
            );
        }
        emitter.emit_ins(X86Instruction::pop_flags());
    }
    emitter.store_eax(size, reg);
    emitter.restore_scratch(false);
}

/// Taint of an indirect transfer target, stored for the resolver
pub fn ijmp_taint(dest: &mut Vec<u8>, operand: &ModRmOperand, taint_offset: u32) {
    let target = Location::Slot(ThreadCtxSlot::IjmpTaint.offset());
    TaintEmitter::new(dest, taint_offset).with_operand(operand, OperandSize::S32, |emitter, rm| {
        emitter.copy(OperandSize::S32, rm, target)
    });
}

/// Clears the taint of the pending indirect transfer target
pub fn clear_ijmp_taint(dest: &mut Vec<u8>) {
    TaintEmitter::new(dest, 0).clear(
        OperandSize::S32,
        Location::Slot(ThreadCtxSlot::IjmpTaint.offset()),
    );
}

/// `push reg`
pub fn copy_reg_to_push(dest: &mut Vec<u8>, size: OperandSize, reg: u8, taint_offset: u32) {
    let mut emitter = TaintEmitter::new(dest, taint_offset);
    emitter.save_scratch(false);
    emitter.copy(
        size,
        register_slot(size, reg),
        Location::Shadow(ESP, -(size.bytes() as i32)),
    );
    emitter.restore_scratch(false);
}

/// `pop reg`
pub fn copy_pop_to_reg(dest: &mut Vec<u8>, size: OperandSize, reg: u8, taint_offset: u32) {
    let mut emitter = TaintEmitter::new(dest, taint_offset);
    emitter.save_scratch(false);
    emitter.copy(size, Location::Shadow(ESP, 0), register_slot(size, reg));
    emitter.restore_scratch(false);
}

/// `xchg eax, reg`
pub fn swap_ax_reg(dest: &mut Vec<u8>, size: OperandSize, reg: u8) {
    let mut emitter = TaintEmitter::new(dest, 0);
    emitter.save_scratch(false);
    emitter.load_eax(size, register_slot(size, reg));
    let (base, indirect, segment) = emitter.access(register_slot(size, EAX as u8));
    emitter.emit_ins(
        X86Instruction::xchg(size, EAX, base, Some(indirect)).with_segment(segment),
    );
    emitter.store_eax(size, register_slot(size, reg));
    emitter.restore_scratch(false);
}

/// The register receives an untainted value
pub fn erase_reg(dest: &mut Vec<u8>, size: OperandSize, reg: u8) {
    TaintEmitter::new(dest, 0).clear(size, register_slot(size, reg));
}

/// An untainted value is pushed
pub fn erase_push(dest: &mut Vec<u8>, size: OperandSize, taint_offset: u32) {
    TaintEmitter::new(dest, taint_offset)
        .clear(size, Location::Shadow(ESP, -(size.bytes() as i32)));
}

/// `pusha`: the stack receives the taint of every register, `eax` first
pub fn pusha(dest: &mut Vec<u8>, size: OperandSize, taint_offset: u32) {
    let step = size.bytes() as i32;
    let mut emitter = TaintEmitter::new(dest, taint_offset);
    emitter.save_scratch(false);
    for (index, register) in crate::x86::GENERAL_PURPOSE_REGISTERS.iter().enumerate() {
        emitter.copy(
            size,
            slot_of(*register),
            Location::Shadow(ESP, -(index as i32 + 1) * step),
        );
    }
    emitter.restore_scratch(false);
}

/// `popa`: every register but `esp` receives the taint of its stack slot, `edi` first
pub fn popa(dest: &mut Vec<u8>, size: OperandSize, taint_offset: u32) {
    let step = size.bytes() as i32;
    let mut emitter = TaintEmitter::new(dest, taint_offset);
    emitter.save_scratch(false);
    for (index, register) in crate::x86::GENERAL_PURPOSE_REGISTERS.iter().rev().enumerate() {
        if *register != ESP {
            emitter.copy(size, Location::Shadow(ESP, index as i32 * step), slot_of(*register));
        }
    }
    emitter.restore_scratch(false);
}

/// `leave`: `esp` takes the taint of `ebp`, `ebp` the taint of the saved frame pointer
pub fn leave(dest: &mut Vec<u8>, size: OperandSize, taint_offset: u32) {
    let mut emitter = TaintEmitter::new(dest, taint_offset);
    emitter.save_scratch(false);
    emitter.copy(OperandSize::S32, slot_of(EBP), slot_of(ESP));
    emitter.copy(size, Location::Shadow(EBP, 0), slot_of(EBP));
    emitter.restore_scratch(false);
}

/// `enter`: the frame pointer is pushed, then takes the taint of `esp`
pub fn enter(dest: &mut Vec<u8>, size: OperandSize, taint_offset: u32) {
    let mut emitter = TaintEmitter::new(dest, taint_offset);
    emitter.save_scratch(false);
    emitter.copy(size, slot_of(EBP), Location::Shadow(ESP, -(size.bytes() as i32)));
    emitter.copy(OperandSize::S32, slot_of(ESP), slot_of(EBP));
    emitter.restore_scratch(false);
}

/// `movs`: one element from `[esi]` to `[edi]`
pub fn copy_str_to_str(dest: &mut Vec<u8>, size: OperandSize, taint_offset: u32) {
    let mut emitter = TaintEmitter::new(dest, taint_offset);
    emitter.save_scratch(false);
    emitter.copy(size, Location::Shadow(ESI, 0), Location::Shadow(EDI, 0));
    emitter.restore_scratch(false);
}

/// `stos`: one element from `eax` to `[edi]`
pub fn copy_ax_to_str(dest: &mut Vec<u8>, size: OperandSize, taint_offset: u32) {
    let mut emitter = TaintEmitter::new(dest, taint_offset);
    emitter.save_scratch(false);
    emitter.copy(size, register_slot(size, EAX as u8), Location::Shadow(EDI, 0));
    emitter.restore_scratch(false);
}

/// `lods`: one element from `[esi]` to `eax`
pub fn copy_str_to_ax(dest: &mut Vec<u8>, size: OperandSize, taint_offset: u32) {
    let mut emitter = TaintEmitter::new(dest, taint_offset);
    emitter.save_scratch(false);
    emitter.copy(size, Location::Shadow(ESI, 0), register_slot(size, EAX as u8));
    emitter.restore_scratch(false);
}

/// `eax` receives an untainted value
pub fn erase_ax(dest: &mut Vec<u8>, size: OperandSize) {
    erase_reg(dest, size, EAX as u8);
}

/// `edx` receives an untainted value
pub fn erase_dx(dest: &mut Vec<u8>, size: OperandSize) {
    erase_reg(dest, size, EDX as u8);
}

/// `edx:eax` receives an untainted value
pub fn erase_ax_dx(dest: &mut Vec<u8>, size: OperandSize) {
    erase_reg(dest, size, EAX as u8);
    erase_reg(dest, size, EDX as u8);
}

/// The upper half of the accumulator (`cwde`, `cbw`) receives an untainted value
pub fn erase_ax_high(dest: &mut Vec<u8>, size: OperandSize) {
    let eax = reg_taint_offset(EAX);
    let mut emitter = TaintEmitter::new(dest, 0);
    match size {
        OperandSize::S16 => emitter.clear(OperandSize::S8, Location::Slot(eax + 1)),
        _ => emitter.clear(OperandSize::S16, Location::Slot(eax + 2)),
    }
}

/// `mov moffs, eax`
pub fn copy_ax_to_address(dest: &mut Vec<u8>, size: OperandSize, address: u32, taint_offset: u32) {
    let mut emitter = TaintEmitter::new(dest, taint_offset);
    emitter.save_scratch(false);
    emitter.copy(size, register_slot(size, EAX as u8), Location::ShadowAbsolute(address));
    emitter.restore_scratch(false);
}

/// `mov eax, moffs`
pub fn copy_address_to_ax(dest: &mut Vec<u8>, size: OperandSize, address: u32, taint_offset: u32) {
    let mut emitter = TaintEmitter::new(dest, taint_offset);
    emitter.save_scratch(false);
    emitter.copy(size, Location::ShadowAbsolute(address), register_slot(size, EAX as u8));
    emitter.restore_scratch(false);
}

/// `cmpxchg` prefix: the operand address is recorded before the instruction can change it
pub fn cmpxchg_pre(dest: &mut Vec<u8>, operand: &ModRmOperand) {
    if operand.is_register() {
        return;
    }
    let mut emitter = TaintEmitter::new(dest, 0);
    emitter.emit_ins(
        X86Instruction::store(OperandSize::S32, ECX, EAX, fs_slot(ThreadCtxSlot::SavedEcx))
            .with_segment(FS_PREFIX),
    );
    operand.emit_lea_ecx(emitter.dest);
    emitter.emit_ins(
        X86Instruction::store(OperandSize::S32, ECX, EAX, fs_slot(ThreadCtxSlot::ScratchAddress))
            .with_segment(FS_PREFIX),
    );
    emitter.emit_ins(
        X86Instruction::load(OperandSize::S32, EAX, ECX, fs_slot(ThreadCtxSlot::SavedEcx))
            .with_segment(FS_PREFIX),
    );
}

/// `jnz 1f; <exchanged>; jmp 2f; 1: <not_exchanged>; 2:`, flags are left alone
fn on_zero_flag(dest: &mut Vec<u8>, exchanged: &[u8], not_exchanged: &[u8]) {
    let skip_exchanged = exchanged.len() + 2;
    debug_assert!(skip_exchanged <= i8::MAX as usize && not_exchanged.len() <= i8::MAX as usize);
    X86Instruction::short_conditional_jump(0x5, skip_exchanged as i8).emit(dest);
    dest.extend_from_slice(exchanged);
    X86Instruction::short_jump(not_exchanged.len() as i8).emit(dest);
    dest.extend_from_slice(not_exchanged);
}

fn recorded_operand(size: OperandSize, operand: &ModRmOperand, displacement: i32) -> Location {
    if operand.is_register() {
        register_slot(size, operand.rm())
    } else {
        Location::ShadowEcx(displacement)
    }
}

/// Loads the address recorded by [`cmpxchg_pre`] into `ecx`
fn load_recorded_address(emitter: &mut TaintEmitter, operand: &ModRmOperand) {
    if !operand.is_register() {
        emitter.emit_ins(
            X86Instruction::load(OperandSize::S32, EAX, ECX, fs_slot(ThreadCtxSlot::ScratchAddress))
                .with_segment(FS_PREFIX),
        );
    }
}

/// `cmpxchg` suffix: the operand took the source if equal, else the accumulator took the operand
pub fn cmpxchg_post(
    dest: &mut Vec<u8>,
    size: OperandSize,
    operand: &ModRmOperand,
    taint_offset: u32,
) {
    let reg = register_slot(size, operand.reg());
    let accumulator = register_slot(size, EAX as u8);
    let rm = recorded_operand(size, operand, 0);

    let mut exchanged = Vec::new();
    TaintEmitter::new(&mut exchanged, taint_offset).copy(size, reg, rm);
    let mut not_exchanged = Vec::new();
    TaintEmitter::new(&mut not_exchanged, taint_offset).copy(size, rm, accumulator);

    let mut emitter = TaintEmitter::new(dest, taint_offset);
    emitter.save_scratch(true);
    load_recorded_address(&mut emitter, operand);
    on_zero_flag(emitter.dest, &exchanged, &not_exchanged);
    emitter.restore_scratch(true);
}

/// `cmpxchg8b` suffix: the operand took `ecx:ebx` if equal, else `edx:eax` took the operand
pub fn cmpxchg8b_post(dest: &mut Vec<u8>, operand: &ModRmOperand, taint_offset: u32) {
    let size = OperandSize::S32;
    let low = recorded_operand(size, operand, 0);
    let high = recorded_operand(size, operand, 4);

    let mut exchanged = Vec::new();
    let mut emitter = TaintEmitter::new(&mut exchanged, taint_offset);
    emitter.copy(size, slot_of(EBX), low);
    emitter.copy(size, slot_of(ECX), high);
    let mut not_exchanged = Vec::new();
    let mut emitter = TaintEmitter::new(&mut not_exchanged, taint_offset);
    emitter.copy(size, low, slot_of(EAX));
    emitter.copy(size, high, slot_of(EDX));

    let mut emitter = TaintEmitter::new(dest, taint_offset);
    emitter.save_scratch(true);
    load_recorded_address(&mut emitter, operand);
    on_zero_flag(emitter.dest, &exchanged, &not_exchanged);
    emitter.restore_scratch(true);
}
