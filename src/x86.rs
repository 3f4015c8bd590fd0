#![allow(clippy::arithmetic_side_effects)]
//! Encoder for the 32-bit x86 instructions the translator emits on its own.

macro_rules! exclude_operand_sizes {
    ($size:expr, $($to_exclude:path)|+ $(,)?) => {
        debug_assert!(match $size {
            $($to_exclude)|+ => false,
            _ => true,
        });
    }
}

/// Bit width of an instruction operand
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperandSize {
    /// Empty
    S0 = 0,
    /// 8 bit
    S8 = 8,
    /// 16 bit
    S16 = 16,
    /// 32 bit
    S32 = 32,
}

impl OperandSize {
    /// Width in bytes
    pub const fn bytes(self) -> u32 {
        self as u32 / 8
    }
}

/// General purpose registers, in encoding order
#[allow(dead_code, missing_docs, clippy::upper_case_acronyms)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum X86Register {
    EAX = 0,
    ECX = 1,
    EDX = 2,
    EBX = 3,
    ESP = 4,
    EBP = 5,
    ESI = 6,
    EDI = 7,
}
use X86Register::*;

/// All general purpose registers in encoding order
pub const GENERAL_PURPOSE_REGISTERS: [X86Register; 8] = [EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI];

impl X86Register {
    /// Register named by the low three bits of `index`
    pub const fn from_index(index: u8) -> Self {
        GENERAL_PURPOSE_REGISTERS[(index & 0b111) as usize]
    }
}

/// `fs` segment override, the thread context lives there
pub const FS_PREFIX: u8 = 0x64;
/// Operand-size override
pub const OPERAND_SIZE_PREFIX: u8 = 0x66;
/// Address-size override
pub const ADDRESS_SIZE_PREFIX: u8 = 0x67;

struct X86ModRm {
    mode: u8,
    r: u8,
    m: u8,
}

struct X86Sib {
    scale: u8,
    index: u8,
    base: u8,
}

/// Memory operand addressing
#[derive(Copy, Clone, Debug)]
pub enum X86IndirectAccess {
    /// [second_operand + offset]
    Offset(i32),
    /// [offset], segment relative if a segment override is set
    Absolute(u32),
}

/// A single instruction, built by one of the constructors below
#[derive(Copy, Clone, Debug)]
pub struct X86Instruction {
    size: OperandSize,
    segment: u8,
    opcode_escape_sequence: u8,
    opcode: u8,
    modrm: bool,
    indirect: Option<X86IndirectAccess>,
    first_operand: u8,
    second_operand: u8,
    immediate_size: OperandSize,
    immediate: i64,
}

/// Appends the low `size` bytes of `data` in little endian order
pub fn emit_variable_length(dest: &mut Vec<u8>, size: OperandSize, data: u64) {
    match size {
        OperandSize::S0 => {}
        OperandSize::S8 => dest.push(data as u8),
        OperandSize::S16 => dest.extend_from_slice(&(data as u16).to_le_bytes()),
        OperandSize::S32 => dest.extend_from_slice(&(data as u32).to_le_bytes()),
    }
}

impl X86Instruction {
    /// Base for the constructors
    pub const DEFAULT: X86Instruction = X86Instruction {
        size: OperandSize::S0,
        segment: 0,
        opcode_escape_sequence: 0,
        opcode: 0,
        modrm: true,
        indirect: None,
        first_operand: 0,
        second_operand: 0,
        immediate_size: OperandSize::S0,
        immediate: 0,
    };

    /// Appends the encoding to `dest`
    #[inline(always)]
    pub fn emit(&self, dest: &mut Vec<u8>) {
        debug_assert!(!matches!(self.size, OperandSize::S0));
        let mut modrm = X86ModRm {
            mode: 0,
            r: self.first_operand & 0b111,
            m: self.second_operand & 0b111,
        };
        let mut sib = None;
        let mut displacement_size = OperandSize::S0;
        let mut displacement = 0;
        if self.modrm {
            match self.indirect {
                Some(X86IndirectAccess::Offset(offset)) => {
                    displacement = offset;
                    if (-128..=127).contains(&displacement) {
                        displacement_size = OperandSize::S8;
                        modrm.mode = 1;
                    } else {
                        displacement_size = OperandSize::S32;
                        modrm.mode = 2;
                    }
                    if modrm.m == ESP as u8 {
                        sib = Some(X86Sib {
                            scale: 0,
                            index: ESP as u8,
                            base: ESP as u8,
                        });
                    }
                }
                Some(X86IndirectAccess::Absolute(address)) => {
                    displacement = address as i32;
                    displacement_size = OperandSize::S32;
                    modrm.m = 5;
                }
                None => {
                    modrm.mode = 3;
                }
            }
        }
        if self.segment != 0 {
            dest.push(self.segment);
        }
        if matches!(self.size, OperandSize::S16) {
            dest.push(OPERAND_SIZE_PREFIX);
        }
        match self.opcode_escape_sequence {
            1 => dest.push(0x0f),
            2 => dest.extend_from_slice(&[0x0f, 0x38]),
            3 => dest.extend_from_slice(&[0x0f, 0x3a]),
            _ => {}
        }
        dest.push(self.opcode);
        if self.modrm {
            dest.push((modrm.mode << 6) | (modrm.r << 3) | modrm.m);
            if let Some(sib) = sib {
                dest.push((sib.scale << 6) | (sib.index << 3) | sib.base);
            }
            emit_variable_length(dest, displacement_size, displacement as u64);
        }
        emit_variable_length(dest, self.immediate_size, self.immediate as u64);
    }

    /// Prefixes the instruction with a segment override
    pub const fn with_segment(mut self, segment: u8) -> Self {
        self.segment = segment;
        self
    }

    /// Arithmetic or logic, source register into the r/m operand
    pub const fn alu(
        size: OperandSize,
        opcode: u8,
        source: X86Register,
        destination: X86Register,
        indirect: Option<X86IndirectAccess>,
    ) -> Self {
        exclude_operand_sizes!(size, OperandSize::S0);
        Self {
            size,
            opcode: if let OperandSize::S8 = size {
                opcode & !1
            } else {
                opcode
            },
            first_operand: source as u8,
            second_operand: destination as u8,
            indirect,
            ..X86Instruction::DEFAULT
        }
    }

    /// Swap source and destination
    pub const fn xchg(
        size: OperandSize,
        source: X86Register,
        destination: X86Register,
        indirect: Option<X86IndirectAccess>,
    ) -> Self {
        exclude_operand_sizes!(size, OperandSize::S0);
        Self {
            size,
            opcode: if let OperandSize::S8 = size { 0x86 } else { 0x87 },
            first_operand: source as u8,
            second_operand: destination as u8,
            indirect,
            ..Self::DEFAULT
        }
    }

    /// Load effective address of source into destination
    pub const fn lea(
        source: X86Register,
        destination: X86Register,
        indirect: Option<X86IndirectAccess>,
    ) -> Self {
        Self {
            size: OperandSize::S32,
            opcode: 0x8d,
            first_operand: destination as u8,
            second_operand: source as u8,
            indirect,
            ..Self::DEFAULT
        }
    }

    /// Load destination from [source + offset], partial registers keep their upper bits
    pub const fn load(
        size: OperandSize,
        source: X86Register,
        destination: X86Register,
        indirect: X86IndirectAccess,
    ) -> Self {
        exclude_operand_sizes!(size, OperandSize::S0);
        Self {
            size,
            opcode: if let OperandSize::S8 = size { 0x8a } else { 0x8b },
            first_operand: destination as u8,
            second_operand: source as u8,
            indirect: Some(indirect),
            ..Self::DEFAULT
        }
    }

    /// Store source in [destination + offset]
    pub const fn store(
        size: OperandSize,
        source: X86Register,
        destination: X86Register,
        indirect: X86IndirectAccess,
    ) -> Self {
        exclude_operand_sizes!(size, OperandSize::S0);
        Self {
            size,
            opcode: if let OperandSize::S8 = size { 0x88 } else { 0x89 },
            first_operand: source as u8,
            second_operand: destination as u8,
            indirect: Some(indirect),
            ..Self::DEFAULT
        }
    }

    /// Load destination from immediate
    pub const fn load_immediate(destination: X86Register, immediate: u32) -> Self {
        Self {
            size: OperandSize::S32,
            opcode: 0xb8 | ((destination as u8) & 0b111),
            modrm: false,
            second_operand: destination as u8,
            immediate_size: OperandSize::S32,
            immediate: immediate as i64,
            ..Self::DEFAULT
        }
    }

    /// Store immediate in destination
    pub const fn store_immediate(
        size: OperandSize,
        destination: X86Register,
        indirect: X86IndirectAccess,
        immediate: i64,
    ) -> Self {
        exclude_operand_sizes!(size, OperandSize::S0);
        Self {
            size,
            opcode: if let OperandSize::S8 = size { 0xc6 } else { 0xc7 },
            second_operand: destination as u8,
            indirect: Some(indirect),
            immediate_size: size,
            immediate,
            ..Self::DEFAULT
        }
    }

    /// Push immediate onto the stack
    pub const fn push_immediate(immediate: u32) -> Self {
        Self {
            size: OperandSize::S32,
            opcode: 0x68,
            modrm: false,
            immediate_size: OperandSize::S32,
            immediate: immediate as i64,
            ..Self::DEFAULT
        }
    }

    /// pushf
    pub const fn push_flags() -> Self {
        Self {
            size: OperandSize::S32,
            opcode: 0x9c,
            modrm: false,
            ..Self::DEFAULT
        }
    }

    /// popf
    pub const fn pop_flags() -> Self {
        Self {
            size: OperandSize::S32,
            opcode: 0x9d,
            modrm: false,
            ..Self::DEFAULT
        }
    }

    /// Jump to relative destination on condition
    pub const fn conditional_jump_immediate(opcode: u8, relative_destination: i32) -> Self {
        Self {
            size: OperandSize::S32,
            opcode_escape_sequence: 1,
            opcode,
            modrm: false,
            immediate_size: OperandSize::S32,
            immediate: relative_destination as i64,
            ..Self::DEFAULT
        }
    }

    /// Jump to a relative destination within 127 bytes on condition
    pub const fn short_conditional_jump(condition: u8, relative_destination: i8) -> Self {
        Self {
            size: OperandSize::S32,
            opcode: 0x70 | (condition & 0x0f),
            modrm: false,
            immediate_size: OperandSize::S8,
            immediate: relative_destination as i64,
            ..Self::DEFAULT
        }
    }

    /// Jump to relative destination
    pub const fn jump_immediate(relative_destination: i32) -> Self {
        Self {
            size: OperandSize::S32,
            opcode: 0xe9,
            modrm: false,
            immediate_size: OperandSize::S32,
            immediate: relative_destination as i64,
            ..Self::DEFAULT
        }
    }

    /// Jump to a relative destination within 127 bytes
    pub const fn short_jump(relative_destination: i8) -> Self {
        Self {
            size: OperandSize::S32,
            opcode: 0xeb,
            modrm: false,
            immediate_size: OperandSize::S8,
            immediate: relative_destination as i64,
            ..Self::DEFAULT
        }
    }

    /// prefetcht0
    pub const fn prefetch(indirect: X86IndirectAccess) -> Self {
        Self {
            size: OperandSize::S32,
            opcode_escape_sequence: 1,
            opcode: 0x18,
            first_operand: 1,
            indirect: Some(indirect),
            ..Self::DEFAULT
        }
    }

    /// ud2
    pub const fn undefined() -> Self {
        Self {
            size: OperandSize::S32,
            opcode_escape_sequence: 1,
            opcode: 0x0b,
            modrm: false,
            ..Self::DEFAULT
        }
    }
}
