use iced_x86::{Decoder, DecoderOptions};
use taint_jit::{
    decoder::{decode, Opcode, MAX_INSTRUCTION_LENGTH},
    x86::OperandSize,
};

fn hex(text: &str) -> Vec<u8> {
    text.split_whitespace()
        .map(|byte| u8::from_str_radix(byte, 16).unwrap())
        .collect()
}

const INSTRUCTIONS: &[&str] = &[
    "90",
    "01 d8",
    "8b 03",
    "8b 44 24 08",
    "8b 84 24 00 01 00 00",
    "8b 05 78 56 34 12",
    "8b 44 8d 10",
    "8d 04 85 00 00 00 00",
    "8d 44 24 fc",
    "66 8b 03",
    "67 8b 07",
    "67 8b 46 10",
    "67 8b 06 34 12",
    "c7 05 00 10 00 00 01 00 00 00",
    "66 c7 03 34 12",
    "c6 03 7f",
    "83 c0 01",
    "81 c3 00 01 00 00",
    "66 81 c3 00 01",
    "69 c0 10 00 00 00",
    "6b c0 10",
    "68 00 00 00 01",
    "66 68 34 12",
    "6a 05",
    "e8 00 00 00 00",
    "e9 10 00 00 00",
    "eb 05",
    "74 05",
    "0f 84 00 01 00 00",
    "e2 fe",
    "e3 02",
    "c3",
    "c2 08 00",
    "c8 10 00 00",
    "c9",
    "ea 00 00 00 00 08 00",
    "9a 00 00 00 00 08 00",
    "a1 00 10 00 00",
    "67 a1 00 10",
    "a3 00 10 00 00",
    "f3 a5",
    "f3 66 a5",
    "a4",
    "ab",
    "ad",
    "f6 c3 01",
    "f6 d8",
    "f7 c3 00 01 00 00",
    "f7 d8",
    "66 f7 c3 34 12",
    "ff d0",
    "ff 25 00 10 00 00",
    "ff 74 24 04",
    "8f 00",
    "0f b6 c0",
    "0f b7 03",
    "0f be 44 24 04",
    "0f af c3",
    "0f 44 c1",
    "0f b1 0b",
    "f0 0f b1 0b",
    "0f c7 0e",
    "0f a2",
    "0f 31",
    "0f 05",
    "0f 34",
    "0f 1f 44 00 00",
    "0f 90 c0",
    "0f a3 c8",
    "0f ba e0 05",
    "0f bc c1",
    "0f c8",
    "0f a4 c2 04",
    "0f a5 c2",
    "cd 80",
    "0f 18 0d 00 10 00 00",
    "64 8b 05 00 00 00 00",
    "65 a1 14 00 00 00",
    "c1 e0 04",
    "d1 e0",
    "d3 e0",
    "d9 c0",
    "dd 44 24 08",
    "d9 05 00 10 00 00",
    "98",
    "99",
    "9c",
    "9d",
    "60",
    "61",
    "cc",
    "f4",
    "fc",
];

#[test]
fn test_lengths_match_reference_decoder() {
    for text in INSTRUCTIONS {
        let bytes = hex(text);
        let mut reference = Decoder::with_ip(32, &bytes, 0x1000, DecoderOptions::NONE);
        let expected = reference.decode();
        assert!(!expected.is_invalid(), "{text}");
        let instruction = decode(&bytes, 0x1000);
        assert!(!instruction.is_undecodable(), "{text}");
        assert_eq!(instruction.len, expected.len(), "{text}");
        assert_eq!(instruction.bytes(), &bytes[..], "{text}");
    }
}

#[test]
fn test_trailing_bytes_are_not_consumed() {
    let mut bytes = hex("8b 44 24 08");
    bytes.extend_from_slice(&[0x90; 8]);
    let instruction = decode(&bytes, 0x2000);
    assert_eq!(instruction.len, 4);
    assert_eq!(instruction.end(), 0x2004);
}

#[test]
fn test_instruction_parts() {
    let instruction = decode(&hex("66 c7 44 24 04 34 12"), 0);
    assert_eq!(instruction.opcode, Opcode::Main(0xc7));
    assert!(instruction.prefixes.is_operand_size_16());
    assert_eq!(instruction.opcode_byte(), 0xc7);
    assert_eq!(instruction.modrm(), Some(0x44));
    assert_eq!(instruction.modrm_bytes(), &[0x44, 0x24, 0x04]);
    assert_eq!(instruction.leading_bytes(), &[0x66]);
    assert_eq!(instruction.imm_len(), 2);
    assert_eq!(instruction.immediate(OperandSize::S16), 0x1234);

    let instruction = decode(&hex("0f 84 fa ff ff ff"), 0x1000);
    assert_eq!(instruction.opcode, Opcode::Escape(0x84));
    assert_eq!(instruction.modrm(), None);
    assert_eq!(instruction.immediate(OperandSize::S32), -6);
    assert_eq!(instruction.end(), 0x1006);

    let instruction = decode(&hex("f3 a5"), 0);
    assert!(instruction.prefixes.has_repeat());
    assert_eq!(instruction.opcode, Opcode::Main(0xa5));

    let instruction = decode(&hex("ff 74 24 04"), 0);
    assert_eq!(instruction.opcode, Opcode::GroupFF(6));
    let instruction = decode(&hex("f7 c3 00 01 00 00"), 0);
    assert_eq!(instruction.opcode, Opcode::GroupF7(0));
    assert_eq!(instruction.imm_len(), 4);
    let instruction = decode(&hex("f6 d8"), 0);
    assert_eq!(instruction.opcode, Opcode::GroupF6(3));
    assert_eq!(instruction.imm_len(), 0);

    let instruction = decode(&hex("64 a1 14 00 00 00"), 0);
    assert!(instruction.prefixes.has_segment_override());
    assert_eq!(instruction.prefixes.segment, 0x64);
}

#[test]
fn test_cutoff() {
    assert_eq!(decode(&[], 0).opcode, Opcode::Cutoff);
    assert_eq!(decode(&[0x8b], 0).opcode, Opcode::Cutoff);
    assert_eq!(decode(&hex("8b 44 24"), 0).opcode, Opcode::Cutoff);
    assert_eq!(decode(&hex("e9 00 00"), 0).opcode, Opcode::Cutoff);
    assert_eq!(decode(&hex("0f"), 0).opcode, Opcode::Cutoff);
    let instruction = decode(&hex("66 67"), 0);
    assert_eq!(instruction.opcode, Opcode::Cutoff);
    assert!(instruction.is_undecodable());
    assert!(instruction.len <= 2);
}

#[test]
fn test_too_long() {
    let mut bytes = vec![0x66; MAX_INSTRUCTION_LENGTH];
    bytes.extend_from_slice(&[0x90; 4]);
    let instruction = decode(&bytes, 0);
    assert_eq!(instruction.opcode, Opcode::Bad);
    assert!(instruction.len >= 1 && instruction.len <= MAX_INSTRUCTION_LENGTH);

    let mut bytes = vec![0x26; 10];
    bytes.extend_from_slice(&hex("c7 84 24 00 01 00 00 01 00 00 00"));
    assert_eq!(decode(&bytes, 0).opcode, Opcode::Bad);
}

#[test]
fn test_random_bytes_stay_in_bounds() {
    use rand::{rngs::SmallRng, Rng, SeedableRng};
    let mut rng = SmallRng::seed_from_u64(0x5eed);
    for _ in 0..10_000 {
        let len = rng.gen_range(0..=20);
        let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let instruction = decode(&bytes, 0x4000);
        assert!(instruction.len <= bytes.len().min(MAX_INSTRUCTION_LENGTH));
        if !instruction.is_undecodable() {
            assert!(instruction.len >= 1);
            assert!(instruction.opcode_offset < instruction.len);
            assert!(instruction.mrm < instruction.len);
        }
    }
}
