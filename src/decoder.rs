//! Length decoder for 32-bit x86.
//!
//! The decoder only finds out where the parts of an instruction are: prefixes, the opcode,
//! the ModRM / SIB / displacement bytes and the immediate. Semantics are the business of the
//! classifier.

use crate::{codegen::imm_at, x86::OperandSize};

/// Architectural limit on the length of an instruction
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/// Opcode identity, including the table it was found in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// One byte opcode
    Main(u8),
    /// `0F xx`
    Escape(u8),
    /// `0F 38 xx`
    Escape38(u8),
    /// `0F 3A xx`
    Escape3A(u8),
    /// `F6 /reg`
    GroupF6(u8),
    /// `F7 /reg`
    GroupF7(u8),
    /// `FF /reg`
    GroupFF(u8),
    /// Not a valid instruction
    Bad,
    /// The instruction continues past the end of the decoding window
    Cutoff,
}

/// Legacy prefixes, each field holds the prefix byte or zero
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Prefixes {
    /// `F0`, `F2` or `F3`
    pub lock_rep: u8,
    /// `26`, `2E`, `36`, `3E`, `64` or `65`
    pub segment: u8,
    /// `66`
    pub operand_size: u8,
    /// `67`
    pub address_size: u8,
}

impl Prefixes {
    /// A segment override is present
    pub fn has_segment_override(&self) -> bool {
        self.segment != 0
    }

    /// Operands are 16 bits wide
    pub fn is_operand_size_16(&self) -> bool {
        self.operand_size != 0
    }

    /// Addresses are 16 bits wide
    pub fn is_address_size_16(&self) -> bool {
        self.address_size != 0
    }

    /// `F2` or `F3`
    pub fn has_repeat(&self) -> bool {
        matches!(self.lock_rep, 0xf2 | 0xf3)
    }
}

/// One decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    /// Address of the first byte
    pub addr: u32,
    /// Length in bytes
    pub len: usize,
    bytes: [u8; MAX_INSTRUCTION_LENGTH],
    /// Opcode identity
    pub opcode: Opcode,
    /// Legacy prefixes
    pub prefixes: Prefixes,
    /// Offset of the last opcode byte
    pub opcode_offset: usize,
    /// Offset of the ModRM byte, 0 if there is none
    pub mrm: usize,
    /// Offset of the immediate, 0 if there is none
    pub imm: usize,
}

impl DecodedInstruction {
    /// Raw bytes of the instruction
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Address of the next instruction
    pub fn end(&self) -> u32 {
        self.addr.wrapping_add(self.len as u32)
    }

    /// Last opcode byte, its low bits name a register or a condition for some opcodes
    pub fn opcode_byte(&self) -> u8 {
        self.bytes[self.opcode_offset]
    }

    /// The ModRM byte
    pub fn modrm(&self) -> Option<u8> {
        (self.mrm != 0).then(|| self.bytes[self.mrm])
    }

    /// ModRM, SIB and displacement, without the immediate
    pub fn modrm_bytes(&self) -> &[u8] {
        if self.mrm == 0 {
            return &[];
        }
        let end = if self.imm != 0 { self.imm } else { self.len };
        &self.bytes[self.mrm..end]
    }

    /// Bytes in front of the last opcode byte: prefixes and escape bytes
    pub fn leading_bytes(&self) -> &[u8] {
        &self.bytes[..self.opcode_offset]
    }

    /// Length of the immediate
    pub fn imm_len(&self) -> usize {
        if self.imm == 0 {
            0
        } else {
            self.len - self.imm
        }
    }

    /// Sign extended immediate of width `size`
    pub fn immediate(&self, size: OperandSize) -> i32 {
        imm_at(self.bytes(), self.imm, size)
    }

    /// The instruction could not be decoded
    pub fn is_undecodable(&self) -> bool {
        matches!(self.opcode, Opcode::Bad | Opcode::Cutoff)
    }
}

#[derive(Clone, Copy)]
enum Immediate {
    None,
    Byte,
    Word,
    /// Word or dword depending on the operand size
    Full,
    /// Word or dword depending on the address size
    Moffs,
    /// `enter`
    WordByte,
    /// `ptr16:32`
    FarPointer,
}

#[derive(Clone, Copy)]
struct Format {
    modrm: bool,
    immediate: Immediate,
}

const NONE: Format = Format {
    modrm: false,
    immediate: Immediate::None,
};
const MODRM: Format = Format {
    modrm: true,
    immediate: Immediate::None,
};
const IB: Format = imm(Immediate::Byte);
const IZ: Format = imm(Immediate::Full);

const fn imm(immediate: Immediate) -> Format {
    Format {
        modrm: false,
        immediate,
    }
}

const fn modrm(immediate: Immediate) -> Format {
    Format {
        modrm: true,
        immediate,
    }
}

const fn main_format(op: u8) -> Format {
    match op {
        0x00..=0x3f => match op & 7 {
            0..=3 => MODRM,
            4 => IB,
            5 => IZ,
            _ => NONE,
        },
        0x62 | 0x63 => MODRM,
        0x68 => IZ,
        0x69 => modrm(Immediate::Full),
        0x6a => IB,
        0x6b => modrm(Immediate::Byte),
        0x70..=0x7f => IB,
        0x80 | 0x82 | 0x83 => modrm(Immediate::Byte),
        0x81 => modrm(Immediate::Full),
        0x84..=0x8f => MODRM,
        0x9a | 0xea => imm(Immediate::FarPointer),
        0xa0..=0xa3 => imm(Immediate::Moffs),
        0xa8 => IB,
        0xa9 => IZ,
        0xb0..=0xb7 => IB,
        0xb8..=0xbf => IZ,
        0xc0 | 0xc1 | 0xc6 => modrm(Immediate::Byte),
        0xc7 => modrm(Immediate::Full),
        0xc2 | 0xca => imm(Immediate::Word),
        0xc4 | 0xc5 => MODRM,
        0xc8 => imm(Immediate::WordByte),
        0xcd => IB,
        0xd0..=0xd3 => MODRM,
        0xd4 | 0xd5 => IB,
        0xd8..=0xdf => MODRM,
        0xe0..=0xe7 => IB,
        0xe8 | 0xe9 => IZ,
        0xeb => IB,
        0xf6 | 0xf7 | 0xfe | 0xff => MODRM,
        _ => NONE,
    }
}

const fn escape_format(op: u8) -> Format {
    match op {
        0x00..=0x03 | 0x0d => MODRM,
        0x0f => modrm(Immediate::Byte),
        0x10..=0x2f => MODRM,
        0x40..=0x6f => MODRM,
        0x70..=0x73 => modrm(Immediate::Byte),
        0x74..=0x76 | 0x78..=0x7f => MODRM,
        0x80..=0x8f => IZ,
        0x90..=0x9f => MODRM,
        0xa3 | 0xa5 | 0xab | 0xad..=0xaf => MODRM,
        0xa4 | 0xac => modrm(Immediate::Byte),
        0xb0..=0xb9 | 0xbb..=0xbf => MODRM,
        0xba => modrm(Immediate::Byte),
        0xc0 | 0xc1 | 0xc3 | 0xc7 => MODRM,
        0xc2 | 0xc4..=0xc6 => modrm(Immediate::Byte),
        0xd0..=0xff => MODRM,
        _ => NONE,
    }
}

struct Cursor<'a> {
    code: &'a [u8],
    position: usize,
}

impl Cursor<'_> {
    fn check(&self, count: usize) -> Result<(), Opcode> {
        let end = self.position + count;
        if end > MAX_INSTRUCTION_LENGTH {
            Err(Opcode::Bad)
        } else if end > self.code.len() {
            Err(Opcode::Cutoff)
        } else {
            Ok(())
        }
    }

    fn peek(&self) -> Result<u8, Opcode> {
        self.check(1)?;
        Ok(self.code[self.position])
    }

    fn take(&mut self) -> Result<u8, Opcode> {
        let byte = self.peek()?;
        self.position += 1;
        Ok(byte)
    }

    fn skip(&mut self, count: usize) -> Result<(), Opcode> {
        self.check(count)?;
        self.position += count;
        Ok(())
    }
}

fn is_prefix(byte: u8) -> bool {
    matches!(
        byte,
        0xf0 | 0xf2 | 0xf3 | 0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 | 0x66 | 0x67
    )
}

/// Decodes the instruction at the start of `code`, which is located at `addr`.
///
/// `code` bounds the instruction: if it needs more bytes the opcode is [`Opcode::Cutoff`].
pub fn decode(code: &[u8], addr: u32) -> DecodedInstruction {
    let mut instruction = DecodedInstruction {
        addr,
        len: 0,
        bytes: [0; MAX_INSTRUCTION_LENGTH],
        opcode: Opcode::Cutoff,
        prefixes: Prefixes::default(),
        opcode_offset: 0,
        mrm: 0,
        imm: 0,
    };
    let mut cursor = Cursor { code, position: 0 };
    if let Err(opcode) = decode_parts(&mut cursor, &mut instruction) {
        instruction.opcode = opcode;
        instruction.mrm = 0;
        instruction.imm = 0;
        cursor.position = cursor
            .position
            .max(1)
            .min(code.len().min(MAX_INSTRUCTION_LENGTH));
    }
    instruction.len = cursor.position;
    instruction.bytes[..cursor.position].copy_from_slice(&code[..cursor.position]);
    instruction
}

fn decode_parts(
    cursor: &mut Cursor,
    instruction: &mut DecodedInstruction,
) -> Result<(), Opcode> {
    let prefixes = &mut instruction.prefixes;
    let mut byte = cursor.take()?;
    while is_prefix(byte) {
        match byte {
            0xf0 | 0xf2 | 0xf3 => prefixes.lock_rep = byte,
            0x66 => prefixes.operand_size = byte,
            0x67 => prefixes.address_size = byte,
            _ => prefixes.segment = byte,
        }
        byte = cursor.take()?;
    }
    let (opcode, format) = match byte {
        0x0f => {
            let escaped = cursor.take()?;
            match escaped {
                0x38 => (Opcode::Escape38(cursor.take()?), MODRM),
                0x3a => (Opcode::Escape3A(cursor.take()?), modrm(Immediate::Byte)),
                _ => (Opcode::Escape(escaped), escape_format(escaped)),
            }
        }
        0xf6 | 0xf7 | 0xff => {
            let reg = (cursor.peek()? >> 3) & 7;
            match (byte, reg) {
                (0xf6, 0 | 1) => (Opcode::GroupF6(reg), modrm(Immediate::Byte)),
                (0xf6, _) => (Opcode::GroupF6(reg), MODRM),
                (0xf7, 0 | 1) => (Opcode::GroupF7(reg), modrm(Immediate::Full)),
                (0xf7, _) => (Opcode::GroupF7(reg), MODRM),
                _ => (Opcode::GroupFF(reg), MODRM),
            }
        }
        _ => (Opcode::Main(byte), main_format(byte)),
    };
    instruction.opcode_offset = cursor.position - 1;

    if format.modrm {
        instruction.mrm = cursor.position;
        let modrm = cursor.take()?;
        let mode = modrm >> 6;
        let rm = modrm & 7;
        let displacement = if instruction.prefixes.is_address_size_16() {
            match mode {
                0 if rm == 6 => 2,
                1 => 1,
                2 => 2,
                _ => 0,
            }
        } else {
            let mut sib_base = None;
            if mode != 3 && rm == 4 {
                sib_base = Some(cursor.take()? & 7);
            }
            match mode {
                0 if rm == 5 || sib_base == Some(5) => 4,
                1 => 1,
                2 => 4,
                _ => 0,
            }
        };
        cursor.skip(displacement)?;
    }

    let immediate = match format.immediate {
        Immediate::None => 0,
        Immediate::Byte => 1,
        Immediate::Word => 2,
        Immediate::WordByte => 3,
        Immediate::Full if instruction.prefixes.is_operand_size_16() => 2,
        Immediate::Full => 4,
        Immediate::Moffs if instruction.prefixes.is_address_size_16() => 2,
        Immediate::Moffs => 4,
        Immediate::FarPointer if instruction.prefixes.is_operand_size_16() => 4,
        Immediate::FarPointer => 6,
    };
    if immediate != 0 {
        instruction.imm = cursor.position;
        cursor.skip(immediate)?;
    }
    instruction.opcode = opcode;
    Ok(())
}
