//! Template driven byte emitter.
//!
//! A template is a string of directives, whitespace is ignored:
//!
//! | directive | emits |
//! |-----------|-------|
//! | two hex digits | that byte |
//! | `L` | the next argument as a little endian dword |
//! | `S` | the next argument as a little endian word |
//! | `.` | the next argument as a byte |
//! | `?` | the next argument as a byte, nothing if it is zero |
//! | `$` | the next argument, a byte span, verbatim |
//! | `&` | nothing, records the current output offset |
//! | `+` | nothing, adds the next argument to the previously emitted byte |

use byteorder::{ByteOrder, LittleEndian};

use crate::x86::OperandSize;

/// Template argument
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    /// Numeric argument, truncated to the width of the directive consuming it
    Int(u32),
    /// Byte span for `$`
    Bytes(&'a [u8]),
}

impl Arg<'_> {
    fn int(&self) -> u32 {
        match self {
            Arg::Int(value) => *value,
            Arg::Bytes(_) => panic!("numeric template directive given a byte span"),
        }
    }
}

impl From<u32> for Arg<'_> {
    fn from(value: u32) -> Self {
        Arg::Int(value)
    }
}

impl From<u16> for Arg<'_> {
    fn from(value: u16) -> Self {
        Arg::Int(value as u32)
    }
}

impl From<u8> for Arg<'_> {
    fn from(value: u8) -> Self {
        Arg::Int(value as u32)
    }
}

impl<'a> From<&'a [u8]> for Arg<'a> {
    fn from(value: &'a [u8]) -> Self {
        Arg::Bytes(value)
    }
}

/// Result of one [`gen_code`] call
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Emitted {
    /// Number of bytes appended
    pub len: usize,
    /// Offsets into the destination recorded by `&`, in template order
    pub marks: Vec<usize>,
}

impl Emitted {
    /// Offset recorded by the `index`th `&`
    pub fn mark(&self, index: usize) -> usize {
        self.marks[index]
    }
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        b'A'..=b'F' => digit - b'A' + 10,
        _ => panic!("invalid template directive {:?}", digit as char),
    }
}

/// Appends the bytes described by `template` to `dest`.
///
/// Templates are compile time constants of the translator, a malformed template or an
/// argument list that does not match it is a bug and panics.
pub fn gen_code(dest: &mut Vec<u8>, template: &str, args: &[Arg]) -> Emitted {
    let start = dest.len();
    let mut marks = Vec::new();
    let mut args = args.iter();
    let mut next_arg = || {
        args.next()
            .copied()
            .unwrap_or_else(|| panic!("template {template:?} ran out of arguments"))
    };
    let mut directives = template.bytes().filter(|c| !c.is_ascii_whitespace());
    while let Some(directive) = directives.next() {
        match directive {
            b'L' => dest.extend_from_slice(&next_arg().int().to_le_bytes()),
            b'S' => dest.extend_from_slice(&(next_arg().int() as u16).to_le_bytes()),
            b'.' => dest.push(next_arg().int() as u8),
            b'?' => {
                let value = next_arg().int() as u8;
                if value != 0 {
                    dest.push(value);
                }
            }
            b'$' => match next_arg() {
                Arg::Bytes(bytes) => dest.extend_from_slice(bytes),
                Arg::Int(_) => panic!("`$` directive given a number"),
            },
            b'&' => marks.push(dest.len()),
            b'+' => {
                let value = next_arg().int() as u8;
                let last = dest
                    .last_mut()
                    .unwrap_or_else(|| panic!("`+` at the start of the output"));
                *last = last.wrapping_add(value);
            }
            high => {
                let low = directives
                    .next()
                    .unwrap_or_else(|| panic!("template {template:?} ends in half a byte"));
                dest.push((hex_value(high) << 4) | hex_value(low));
            }
        }
    }
    Emitted {
        len: dest.len() - start,
        marks,
    }
}

/// Reads the sign extended immediate of width `size` at `offset`
pub fn imm_at(code: &[u8], offset: usize, size: OperandSize) -> i32 {
    match size {
        OperandSize::S0 => 0,
        OperandSize::S8 => code[offset] as i8 as i32,
        OperandSize::S16 => LittleEndian::read_i16(&code[offset..]) as i32,
        OperandSize::S32 => LittleEndian::read_i32(&code[offset..]),
    }
}

/// Displacement of a relative transfer ending at `instruction_end` and landing on `target`
pub fn relative_to(instruction_end: u32, target: u32) -> i32 {
    target.wrapping_sub(instruction_end) as i32
}

/// Overwrites the rel32 field at `offset`, whose instruction ends right after it
pub fn patch_rel32(code: &mut [u8], offset: usize, code_base: u32, target: u32) {
    let instruction_end = code_base.wrapping_add(offset as u32 + 4);
    LittleEndian::write_i32(&mut code[offset..], relative_to(instruction_end, target));
}
