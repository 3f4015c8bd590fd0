//! A small i386 interpreter covering the instructions translated code is made of.
//!
//! It runs translated code against a [`GuestMemory`], with the thread context behind the `fs`
//! segment, so the tests can observe the architectural and the taint effects of a translation.

use taint_jit::{
    context::{reg_taint_offset, SignalContext, ThreadCtxSlot},
    fragment::{Fragment, FragmentRunner},
    memory_management::GuestMemory,
    x86::X86Register,
};

pub const CF: u32 = 1 << 0;
pub const PF: u32 = 1 << 2;
pub const ZF: u32 = 1 << 6;
pub const SF: u32 = 1 << 7;
pub const DF: u32 = 1 << 10;
pub const OF: u32 = 1 << 11;

const FLAGS_ALWAYS_SET: u32 = 1 << 1;

/// Steps [`FragmentRunner::run`] allows before declaring a runaway
const RUN_STEP_LIMIT: usize = 100_000;

/// Why [`Interpreter::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Reached one of the stop addresses
    Stop(u32),
    /// Executed `hlt`
    Halt,
    /// Ran out of steps
    StepLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Reg(u8),
    Mem(u32),
}

#[derive(Default)]
struct Prefixes {
    segment_base: u32,
    operand_16: bool,
    address_16: bool,
    repeat: Option<u8>,
}

/// Register file and flags of one thread plus the memory it runs on
pub struct Interpreter<'m, M: GuestMemory + ?Sized> {
    pub memory: &'m M,
    pub regs: [u32; 8],
    pub eflags: u32,
    pub pc: u32,
    pub fs_base: u32,
    /// Execution stops before any of these addresses
    pub stops: Vec<u32>,
    /// Where fragments are installed
    pub fragment_page: u32,
    /// Runtime address fragments leave through
    pub fragment_exit: u32,
    /// Instructions executed so far
    pub steps: usize,
    /// Cursor into the instruction being executed
    fetch: u32,
}

impl<'m, M: GuestMemory + ?Sized> Interpreter<'m, M> {
    pub fn new(memory: &'m M, fs_base: u32) -> Self {
        Self {
            memory,
            regs: [0; 8],
            eflags: FLAGS_ALWAYS_SET,
            pc: 0,
            fs_base,
            stops: Vec::new(),
            fragment_page: 0xC000_0000,
            fragment_exit: 0,
            steps: 0,
            fetch: 0,
        }
    }

    pub fn reg(&self, reg: X86Register) -> u32 {
        self.regs[reg as usize]
    }

    pub fn set_reg(&mut self, reg: X86Register, value: u32) {
        self.regs[reg as usize] = value;
    }

    pub fn flag(&self, flag: u32) -> bool {
        self.eflags & flag != 0
    }

    /// Dword at `offset` from the `fs` base
    pub fn fs_u32(&self, offset: u32) -> u32 {
        self.read(self.fs_base.wrapping_add(offset), 4)
    }

    pub fn set_fs_u32(&self, offset: u32, value: u32) {
        self.write(self.fs_base.wrapping_add(offset), 4, value);
    }

    /// Taint of a 32 bit register
    pub fn reg_taint(&self, reg: X86Register) -> u32 {
        self.fs_u32(reg_taint_offset(reg))
    }

    pub fn set_reg_taint(&self, reg: X86Register, taint: u32) {
        self.set_fs_u32(reg_taint_offset(reg), taint);
    }

    /// Runs until a stop address, `hlt` or `max_steps` instructions
    pub fn run(&mut self, max_steps: usize) -> Exit {
        for _ in 0..max_steps {
            if self.stops.contains(&self.pc) {
                return Exit::Stop(self.pc);
            }
            if !self.step() {
                return Exit::Halt;
            }
        }
        if self.stops.contains(&self.pc) {
            return Exit::Stop(self.pc);
        }
        Exit::StepLimit
    }

    fn read(&self, addr: u32, size: u32) -> u32 {
        let mut buffer = [0; 4];
        assert!(
            self.memory.read(addr, &mut buffer[..size as usize]),
            "unreadable {:#x}",
            addr
        );
        u32::from_le_bytes(buffer)
    }

    fn write(&self, addr: u32, size: u32, value: u32) {
        assert!(
            self.memory
                .write(addr, &value.to_le_bytes()[..size as usize]),
            "unwritable {:#x}",
            addr
        );
    }

    fn fetch_u8(&mut self) -> u8 {
        let byte = self.read(self.fetch, 1) as u8;
        self.fetch = self.fetch.wrapping_add(1);
        byte
    }

    fn fetch_imm(&mut self, size: u32) -> u32 {
        let value = self.read(self.fetch, size);
        self.fetch = self.fetch.wrapping_add(size);
        sign_extend(value, size)
    }

    fn get_reg(&self, reg: u8, size: u32) -> u32 {
        match size {
            1 if reg < 4 => self.regs[reg as usize] & 0xff,
            1 => (self.regs[reg as usize - 4] >> 8) & 0xff,
            2 => self.regs[reg as usize] & 0xffff,
            _ => self.regs[reg as usize],
        }
    }

    fn put_reg(&mut self, reg: u8, size: u32, value: u32) {
        match size {
            1 if reg < 4 => {
                let slot = &mut self.regs[reg as usize];
                *slot = (*slot & !0xff) | (value & 0xff);
            }
            1 => {
                let slot = &mut self.regs[reg as usize - 4];
                *slot = (*slot & !0xff00) | ((value & 0xff) << 8);
            }
            2 => {
                let slot = &mut self.regs[reg as usize];
                *slot = (*slot & !0xffff) | (value & 0xffff);
            }
            _ => self.regs[reg as usize] = value,
        }
    }

    fn get(&self, operand: Operand, size: u32) -> u32 {
        match operand {
            Operand::Reg(reg) => self.get_reg(reg, size),
            Operand::Mem(addr) => self.read(addr, size),
        }
    }

    fn put(&mut self, operand: Operand, size: u32, value: u32) {
        match operand {
            Operand::Reg(reg) => self.put_reg(reg, size, value),
            Operand::Mem(addr) => self.write(addr, size, value),
        }
    }

    /// Decodes a ModRM operand, returns the reg field and the effective address without the
    /// segment base for memory operands
    fn modrm(&mut self, address_16: bool) -> (u8, Result<u32, u8>) {
        let modrm = self.fetch_u8();
        let mode = modrm >> 6;
        let reg = (modrm >> 3) & 7;
        let rm = modrm & 7;
        if mode == 3 {
            return (reg, Err(rm));
        }
        if address_16 {
            let base = match rm {
                0 => self.regs[3].wrapping_add(self.regs[6]),
                1 => self.regs[3].wrapping_add(self.regs[7]),
                2 => self.regs[5].wrapping_add(self.regs[6]),
                3 => self.regs[5].wrapping_add(self.regs[7]),
                4 => self.regs[6],
                5 => self.regs[7],
                6 if mode == 0 => 0,
                6 => self.regs[5],
                _ => self.regs[3],
            };
            let displacement = match mode {
                0 if rm == 6 => self.fetch_imm(2),
                1 => self.fetch_imm(1),
                2 => self.fetch_imm(2),
                _ => 0,
            };
            return (reg, Ok(base.wrapping_add(displacement) & 0xffff));
        }
        let base = if rm == 4 {
            let sib = self.fetch_u8();
            let scale = sib >> 6;
            let index = (sib >> 3) & 7;
            let base = sib & 7;
            let index = if index == 4 {
                0
            } else {
                self.regs[index as usize] << scale
            };
            let base = if base == 5 && mode == 0 {
                self.fetch_imm(4)
            } else {
                self.regs[base as usize]
            };
            base.wrapping_add(index)
        } else if rm == 5 && mode == 0 {
            self.fetch_imm(4)
        } else {
            self.regs[rm as usize]
        };
        let displacement = match mode {
            1 => self.fetch_imm(1),
            2 => self.fetch_imm(4),
            _ => 0,
        };
        (reg, Ok(base.wrapping_add(displacement)))
    }

    fn operand(&mut self, prefixes: &Prefixes) -> (u8, Operand) {
        let (reg, rm) = self.modrm(prefixes.address_16);
        let operand = match rm {
            Ok(addr) => Operand::Mem(addr.wrapping_add(prefixes.segment_base)),
            Err(rm) => Operand::Reg(rm),
        };
        (reg, operand)
    }

    fn set_result_flags(&mut self, result: u32, size: u32) {
        let bits = size * 8;
        let result = truncate(result, size);
        self.eflags &= !(ZF | SF | PF);
        if result == 0 {
            self.eflags |= ZF;
        }
        if result >> (bits - 1) & 1 != 0 {
            self.eflags |= SF;
        }
        if (result as u8).count_ones() % 2 == 0 {
            self.eflags |= PF;
        }
    }

    fn set_flag(&mut self, flag: u32, value: bool) {
        if value {
            self.eflags |= flag;
        } else {
            self.eflags &= !flag;
        }
    }

    /// Group 1 arithmetic, returns the result to store, if any
    fn alu(&mut self, op: u8, a: u32, b: u32, size: u32) -> Option<u32> {
        let mask = truncate(u32::MAX, size);
        let sign = 1u32 << (size * 8 - 1);
        let (a, b) = (a & mask, b & mask);
        let carry = self.flag(CF) as u32;
        let result = match op {
            0 | 2 => {
                let carry = if op == 2 { carry } else { 0 };
                let wide = a as u64 + b as u64 + carry as u64;
                let result = wide as u32 & mask;
                self.set_flag(CF, wide > mask as u64);
                self.set_flag(OF, (!(a ^ b) & (a ^ result)) & sign != 0);
                result
            }
            3 | 5 | 7 => {
                let borrow = if op == 3 { carry } else { 0 };
                let result = a.wrapping_sub(b).wrapping_sub(borrow) & mask;
                self.set_flag(CF, (a as u64) < b as u64 + borrow as u64);
                self.set_flag(OF, ((a ^ b) & (a ^ result)) & sign != 0);
                result
            }
            1 | 4 | 6 => {
                let result = match op {
                    1 => a | b,
                    4 => a & b,
                    _ => a ^ b,
                };
                self.eflags &= !(CF | OF);
                result
            }
            _ => unreachable!(),
        };
        self.set_result_flags(result, size);
        (op != 7).then_some(result)
    }

    fn condition(&self, cc: u8) -> bool {
        let result = match cc >> 1 {
            0 => self.flag(OF),
            1 => self.flag(CF),
            2 => self.flag(ZF),
            3 => self.flag(CF) || self.flag(ZF),
            4 => self.flag(SF),
            5 => self.flag(PF),
            6 => self.flag(SF) != self.flag(OF),
            _ => self.flag(ZF) || self.flag(SF) != self.flag(OF),
        };
        result != (cc & 1 != 0)
    }

    fn push(&mut self, size: u32, value: u32) {
        self.regs[4] = self.regs[4].wrapping_sub(size);
        self.write(self.regs[4], size, value);
    }

    fn pop(&mut self, size: u32) -> u32 {
        let value = self.read(self.regs[4], size);
        self.regs[4] = self.regs[4].wrapping_add(size);
        value
    }

    fn counter(&self, address_16: bool) -> u32 {
        if address_16 {
            self.regs[1] & 0xffff
        } else {
            self.regs[1]
        }
    }

    /// Decrements `ecx` (`cx`), returns the new count
    fn count_down(&mut self, address_16: bool) -> u32 {
        let size = if address_16 { 2 } else { 4 };
        let count = self.counter(address_16).wrapping_sub(1);
        self.put_reg(1, size, count);
        self.counter(address_16)
    }

    fn string_step(&mut self, opcode: u8, size: u32, prefixes: &Prefixes) {
        let delta = if self.flag(DF) { size.wrapping_neg() } else { size };
        let source = self.regs[6].wrapping_add(prefixes.segment_base);
        let destination = self.regs[7];
        match opcode & !1 {
            0xa4 => {
                let value = self.read(source, size);
                self.write(destination, size, value);
                self.regs[6] = self.regs[6].wrapping_add(delta);
                self.regs[7] = self.regs[7].wrapping_add(delta);
            }
            0xaa => {
                self.write(destination, size, self.get_reg(0, size));
                self.regs[7] = self.regs[7].wrapping_add(delta);
            }
            0xac => {
                let value = self.read(source, size);
                self.put_reg(0, size, value);
                self.regs[6] = self.regs[6].wrapping_add(delta);
            }
            _ => panic!("unsupported string op {:#x}", opcode),
        }
    }

    fn branch_if(&mut self, taken: bool, rel: u32) {
        if taken {
            self.fetch = self.fetch.wrapping_add(rel);
        }
    }

    /// Executes one instruction, false on `hlt`
    pub fn step(&mut self) -> bool {
        self.steps += 1;
        self.fetch = self.pc;
        let mut prefixes = Prefixes::default();
        let mut opcode = self.fetch_u8();
        loop {
            match opcode {
                0x64 => prefixes.segment_base = self.fs_base,
                0x66 => prefixes.operand_16 = true,
                0x67 => prefixes.address_16 = true,
                0xf2 | 0xf3 => prefixes.repeat = Some(opcode),
                0x26 | 0x2e | 0x36 | 0x3e | 0xf0 => {}
                _ => break,
            }
            opcode = self.fetch_u8();
        }
        let word = if prefixes.operand_16 { 2 } else { 4 };
        let size = if opcode & 1 == 0 { 1 } else { word };
        match opcode {
            // add, or, adc, sbb, and, sub, xor, cmp
            0x00..=0x3f if opcode & 7 < 6 => {
                let op = opcode >> 3;
                match opcode & 7 {
                    0 | 1 => {
                        let (reg, rm) = self.operand(&prefixes);
                        let value = self.alu(op, self.get(rm, size), self.get_reg(reg, size), size);
                        if let Some(value) = value {
                            self.put(rm, size, value);
                        }
                    }
                    2 | 3 => {
                        let (reg, rm) = self.operand(&prefixes);
                        let value = self.alu(op, self.get_reg(reg, size), self.get(rm, size), size);
                        if let Some(value) = value {
                            self.put_reg(reg, size, value);
                        }
                    }
                    _ => {
                        let imm = self.fetch_imm(size);
                        if let Some(value) = self.alu(op, self.get_reg(0, size), imm, size) {
                            self.put_reg(0, size, value);
                        }
                    }
                }
            }
            0x40..=0x4f => {
                let reg = opcode & 7;
                let carry = self.flag(CF);
                let b = 1;
                let op = if opcode < 0x48 { 0 } else { 5 };
                if let Some(value) = self.alu(op, self.get_reg(reg, word), b, word) {
                    self.put_reg(reg, word, value);
                }
                self.set_flag(CF, carry);
            }
            0x50..=0x57 => {
                let value = self.get_reg(opcode & 7, word);
                self.push(word, value);
            }
            0x58..=0x5f => {
                let value = self.pop(word);
                self.put_reg(opcode & 7, word, value);
            }
            0x60 => {
                let esp = self.regs[4];
                for reg in 0..8 {
                    let value = if reg == 4 { esp } else { self.get_reg(reg, word) };
                    self.push(word, value);
                }
            }
            0x61 => {
                for reg in (0..8).rev() {
                    let value = self.pop(word);
                    if reg != 4 {
                        self.put_reg(reg, word, value);
                    }
                }
            }
            0x68 | 0x6a => {
                let imm = self.fetch_imm(if opcode == 0x6a { 1 } else { word });
                self.push(word, imm);
            }
            0x70..=0x7f => {
                let rel = self.fetch_imm(1);
                self.branch_if(self.condition(opcode & 0xf), rel);
            }
            0x80 | 0x81 | 0x83 => {
                let (op, rm) = self.operand(&prefixes);
                let size = if opcode == 0x80 { 1 } else { word };
                let imm = self.fetch_imm(if opcode == 0x81 { word } else { 1 });
                if let Some(value) = self.alu(op, self.get(rm, size), imm, size) {
                    self.put(rm, size, value);
                }
            }
            0x84 | 0x85 => {
                let (reg, rm) = self.operand(&prefixes);
                self.alu(4, self.get(rm, size), self.get_reg(reg, size), size);
            }
            0x86 | 0x87 => {
                let (reg, rm) = self.operand(&prefixes);
                let value = self.get(rm, size);
                let register = self.get_reg(reg, size);
                self.put(rm, size, register);
                self.put_reg(reg, size, value);
            }
            0x88 | 0x89 => {
                let (reg, rm) = self.operand(&prefixes);
                let value = self.get_reg(reg, size);
                self.put(rm, size, value);
            }
            0x8a | 0x8b => {
                let (reg, rm) = self.operand(&prefixes);
                let value = self.get(rm, size);
                self.put_reg(reg, size, value);
            }
            0x8d => {
                let (reg, rm) = self.modrm(prefixes.address_16);
                let Ok(addr) = rm else {
                    panic!("lea of a register at {:#x}", self.pc);
                };
                self.put_reg(reg, word, addr);
            }
            0x90 => {}
            0x91..=0x97 => {
                let reg = opcode & 7;
                let value = self.get_reg(reg, word);
                let accumulator = self.get_reg(0, word);
                self.put_reg(reg, word, accumulator);
                self.put_reg(0, word, value);
            }
            // cbw, cwde
            0x98 => {
                let value = sign_extend(self.get_reg(0, word / 2), word / 2);
                self.put_reg(0, word, value);
            }
            // cwd, cdq
            0x99 => {
                let negative = self.get_reg(0, word) >> (word * 8 - 1) & 1 != 0;
                self.put_reg(2, word, if negative { u32::MAX } else { 0 });
            }
            0x9c => self.push(word, self.eflags),
            0x9d => {
                let value = self.pop(word);
                self.eflags = (self.eflags & !truncate(u32::MAX, word)) | value | FLAGS_ALWAYS_SET;
            }
            0xa0..=0xa3 => {
                let addr = self.fetch_imm(4).wrapping_add(prefixes.segment_base);
                if opcode < 0xa2 {
                    let value = self.read(addr, size);
                    self.put_reg(0, size, value);
                } else {
                    self.write(addr, size, self.get_reg(0, size));
                }
            }
            0xa4 | 0xa5 | 0xaa | 0xab | 0xac | 0xad => match prefixes.repeat {
                Some(_) => {
                    while self.counter(prefixes.address_16) != 0 {
                        self.string_step(opcode, size, &prefixes);
                        self.count_down(prefixes.address_16);
                    }
                }
                None => self.string_step(opcode, size, &prefixes),
            },
            0xb0..=0xb7 => {
                let imm = self.fetch_imm(1);
                self.put_reg(opcode & 7, 1, imm);
            }
            0xb8..=0xbf => {
                let imm = self.fetch_imm(word);
                self.put_reg(opcode & 7, word, imm);
            }
            0xc3 => {
                self.fetch = self.pop(4);
            }
            0xc6 | 0xc7 => {
                let (_, rm) = self.operand(&prefixes);
                let imm = self.fetch_imm(size);
                self.put(rm, size, imm);
            }
            0xc8 => {
                let frame = self.fetch_imm(2) & 0xffff;
                let level = self.fetch_u8();
                assert_eq!(level, 0, "nested enter at {:#x}", self.pc);
                self.push(word, self.regs[5]);
                self.regs[5] = self.regs[4];
                self.regs[4] = self.regs[4].wrapping_sub(frame);
            }
            0xc9 => {
                self.regs[4] = self.regs[5];
                let value = self.pop(word);
                self.put_reg(5, word, value);
            }
            0xe0..=0xe2 => {
                let rel = self.fetch_imm(1);
                let count = self.count_down(prefixes.address_16);
                let taken = count != 0
                    && match opcode {
                        0xe0 => !self.flag(ZF),
                        0xe1 => self.flag(ZF),
                        _ => true,
                    };
                self.branch_if(taken, rel);
            }
            0xe3 => {
                let rel = self.fetch_imm(1);
                let taken = self.counter(prefixes.address_16) == 0;
                self.branch_if(taken, rel);
            }
            0xe8 => {
                let rel = self.fetch_imm(4);
                self.push(4, self.fetch);
                self.fetch = self.fetch.wrapping_add(rel);
            }
            0xe9 => {
                let rel = self.fetch_imm(4);
                self.fetch = self.fetch.wrapping_add(rel);
            }
            0xeb => {
                let rel = self.fetch_imm(1);
                self.fetch = self.fetch.wrapping_add(rel);
            }
            0xf4 => {
                self.pc = self.fetch;
                return false;
            }
            0xfe | 0xff => {
                let (op, rm) = self.operand(&prefixes);
                match op {
                    0 | 1 => {
                        let carry = self.flag(CF);
                        let alu = if op == 0 { 0 } else { 5 };
                        if let Some(value) = self.alu(alu, self.get(rm, size), 1, size) {
                            self.put(rm, size, value);
                        }
                        self.set_flag(CF, carry);
                    }
                    2 => {
                        let target = self.get(rm, 4);
                        self.push(4, self.fetch);
                        self.fetch = target;
                    }
                    4 => self.fetch = self.get(rm, 4),
                    6 => {
                        let value = self.get(rm, word);
                        self.push(word, value);
                    }
                    _ => panic!("unsupported ff /{} at {:#x}", op, self.pc),
                }
            }
            0x0f => self.step_escaped(&prefixes, word),
            _ => panic!("unsupported opcode {:#x} at {:#x}", opcode, self.pc),
        }
        self.pc = self.fetch;
        true
    }

    fn step_escaped(&mut self, prefixes: &Prefixes, word: u32) {
        let opcode = self.fetch_u8();
        match opcode {
            0x0b => panic!("ud2 at {:#x}", self.pc),
            0x18 => {
                self.operand(prefixes);
            }
            0x40..=0x4f => {
                let (reg, rm) = self.operand(prefixes);
                if self.condition(opcode & 0xf) {
                    let value = self.get(rm, word);
                    self.put_reg(reg, word, value);
                }
            }
            0x80..=0x8f => {
                let rel = self.fetch_imm(word);
                self.branch_if(self.condition(opcode & 0xf), rel);
            }
            0xb0 | 0xb1 => {
                let size = if opcode == 0xb0 { 1 } else { word };
                let (reg, rm) = self.operand(prefixes);
                let current = self.get(rm, size);
                let accumulator = self.get_reg(0, size);
                self.alu(7, accumulator, current, size);
                if self.flag(ZF) {
                    let value = self.get_reg(reg, size);
                    self.put(rm, size, value);
                } else {
                    self.put_reg(0, size, current);
                }
            }
            0xb6 | 0xb7 | 0xbe | 0xbf => {
                let from = if opcode & 1 == 0 { 1 } else { 2 };
                let (reg, rm) = self.operand(prefixes);
                let value = self.get(rm, from);
                let value = if opcode >= 0xbe {
                    sign_extend(value, from)
                } else {
                    value
                };
                self.put_reg(reg, word, value);
            }
            0xc7 => {
                let (op, rm) = self.operand(prefixes);
                let Operand::Mem(addr) = rm else {
                    panic!("cmpxchg8b of a register at {:#x}", self.pc);
                };
                assert_eq!(op, 1, "unsupported 0f c7 /{} at {:#x}", op, self.pc);
                let low = self.read(addr, 4);
                let high = self.read(addr.wrapping_add(4), 4);
                let equal = low == self.regs[0] && high == self.regs[2];
                self.set_flag(ZF, equal);
                if equal {
                    self.write(addr, 4, self.regs[3]);
                    self.write(addr.wrapping_add(4), 4, self.regs[1]);
                } else {
                    self.regs[0] = low;
                    self.regs[2] = high;
                }
            }
            _ => panic!("unsupported opcode 0f {:#x} at {:#x}", opcode, self.pc),
        }
    }
}

impl<M: GuestMemory + ?Sized> FragmentRunner for Interpreter<'_, M> {
    fn fragment_page(&self) -> u32 {
        self.fragment_page
    }

    fn run(&mut self, fragment: Option<&Fragment>, context: &mut SignalContext) {
        if let Some(fragment) = fragment {
            assert!(self.memory.write(fragment.base, &fragment.code));
        }
        self.pc = context.pc;
        let stops = std::mem::replace(&mut self.stops, vec![self.fragment_exit]);
        let exit = Interpreter::run(self, RUN_STEP_LIMIT);
        self.stops = stops;
        assert_eq!(exit, Exit::Stop(self.fragment_exit));
        context.pc = self.fs_u32(ThreadCtxSlot::JitEip.offset());
    }
}

fn truncate(value: u32, size: u32) -> u32 {
    match size {
        1 => value & 0xff,
        2 => value & 0xffff,
        _ => value,
    }
}

fn sign_extend(value: u32, size: u32) -> u32 {
    match size {
        1 => value as u8 as i8 as i32 as u32,
        2 => value as u16 as i16 as i32 as u32,
        _ => value,
    }
}
