use iced_x86::{Decoder, DecoderOptions};
use taint_jit::{
    classify::{classify, Action, Control},
    config::{CallStrategy, Config},
    context::ThreadCtxSlot,
    decoder::decode,
    jit::MAX_MACHINE_CODE_LENGTH_PER_INSTRUCTION,
    jump_cache::hash_index,
    translate::{translate_op, PendingPatch, Preseed, Translation, TranslationContext},
};

const CODE_ADDR: u32 = 0x0804_8000;
const MAP_END: u32 = 0x0805_0000;
const JIT_ADDR: u32 = 0xA000_0000;

fn hex(text: &str) -> Vec<u8> {
    text.split_whitespace()
        .map(|byte| u8::from_str_radix(byte, 16).unwrap())
        .collect()
}

fn translate(bytes: &[u8], config: &Config) -> (Vec<u8>, Translation) {
    let context = TranslationContext {
        config,
        jit_addr: JIT_ADDR,
        map: CODE_ADDR..MAP_END,
    };
    let mut code = Vec::new();
    let translation = translate_op(&mut code, &decode(bytes, CODE_ADDR), &context);
    assert_eq!(translation.len, code.len());
    (code, translation)
}

fn le(value: u32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Decodes `code` with the reference decoder, every byte must belong to a valid instruction
fn assert_valid_code(code: &[u8], what: &str) {
    let mut decoder = Decoder::with_ip(32, code, JIT_ADDR as u64, DecoderOptions::NONE);
    let mut consumed = 0;
    while decoder.can_decode() {
        let instruction = decoder.decode();
        assert!(
            !instruction.is_invalid(),
            "{what}: invalid instruction at offset {consumed} of {code:02x?}"
        );
        consumed += instruction.len();
    }
    assert_eq!(consumed, code.len(), "{what}");
}

const GUEST_INSTRUCTIONS: &[&str] = &[
    "8b 03",
    "8b 44 24 08",
    "89 44 8d 10",
    "66 89 03",
    "88 43 01",
    "8a 63 01",
    "67 8b 07",
    "67 89 46 10",
    "01 d8",
    "03 05 00 10 00 00",
    "31 c0",
    "33 03",
    "0f b6 03",
    "0f bf 44 24 04",
    "66 0f b6 c3",
    "87 03",
    "86 e0",
    "93",
    "8d 44 24 fc",
    "8d 04 85 00 10 00 00",
    "ff 74 24 04",
    "8f 00",
    "8f 44 24 04",
    "53",
    "5b",
    "66 50",
    "6a 05",
    "68 00 00 00 01",
    "60",
    "61",
    "c9",
    "c8 10 00 00",
    "c7 05 00 10 00 00 01 00 00 00",
    "66 c7 03 34 12",
    "c6 03 7f",
    "b8 01 00 00 00",
    "b3 01",
    "0f 94 c0",
    "a1 00 10 00 00",
    "a3 00 10 00 00",
    "a2 00 10 00 00",
    "a5",
    "f3 a5",
    "f3 66 ab",
    "f3 aa",
    "ac",
    "98",
    "99",
    "0f 31",
    "0f a2",
    "cd 80",
    "cd 03",
    "0f 05",
    "0f 34",
    "74 05",
    "0f 84 00 01 00 00",
    "eb 05",
    "e9 00 10 00 00",
    "e9 00 00 00 10",
    "e8 00 00 00 00",
    "ff d0",
    "ff 15 00 10 00 00",
    "ff e0",
    "ff 25 00 10 00 00",
    "64 ff 15 10 00 00 00",
    "c3",
    "c2 08 00",
    "e2 fe",
    "e3 02",
    "0f 44 c1",
    "0f 4f 03",
    "64 0f 44 01",
    "0f b1 0b",
    "0f b0 0b",
    "0f b1 c3",
    "0f c7 0e",
    "f0 0f b1 0b",
    "64 8b 03",
    "0f af c3",
    "0f c1 03",
    "83 c0 01",
    "90",
];

#[test]
fn test_translations_are_valid_code() {
    for taint in [true, false] {
        for call_strategy in [
            CallStrategy::PreseedOnCall,
            CallStrategy::PrefetchOnCall,
            CallStrategy::None,
        ] {
            let config = Config {
                taint,
                call_strategy,
                ..Config::default()
            };
            for text in GUEST_INSTRUCTIONS {
                let (code, _) = translate(&hex(text), &config);
                assert_valid_code(&code, text);
            }
        }
    }
}

/// ModRM shapes: register, `[ebx]`, `[esp+disp8]`, `[ebp+ecx*4+disp8]`, `[disp32]`,
/// `[esp+disp32]`
const MODRM_SHAPES: &[&[u8]] = &[
    &[0xc1],
    &[0x03],
    &[0x44, 0x24, 0x10],
    &[0x44, 0x8d, 0x10],
    &[0x05, 0x00, 0x10, 0x00, 0x00],
    &[0x84, 0x24, 0x00, 0x01, 0x00, 0x00],
];

fn far_transfer(bytes: &[u8]) -> bool {
    matches!(
        classify(&decode(bytes, CODE_ADDR)),
        Action::Control(Control::CallFar | Control::ReturnFar)
    )
}

#[test]
fn test_code_length_bound() {
    let mut longest = 0;
    for taint in [true, false] {
        let config = Config {
            taint,
            ..Config::default()
        };
        for prefixes in [&[][..], &[0x66], &[0x67], &[0xf3], &[0x64], &[0x66, 0x67]] {
            for escape in [&[][..], &[0x0f]] {
                for opcode in 0..=u8::MAX {
                    for shape in MODRM_SHAPES {
                        for reg in 0..8u8 {
                            let mut bytes = prefixes.to_vec();
                            bytes.extend_from_slice(escape);
                            bytes.push(opcode);
                            bytes.push(shape[0] | (reg << 3));
                            bytes.extend_from_slice(&shape[1..]);
                            bytes.extend_from_slice(&[0x11; 8]);
                            if far_transfer(&bytes) {
                                continue;
                            }
                            let (code, _) = translate(&bytes, &config);
                            longest = longest.max(code.len());
                            assert!(
                                code.len() <= MAX_MACHINE_CODE_LENGTH_PER_INSTRUCTION,
                                "{bytes:02x?} translates into {} bytes",
                                code.len()
                            );
                        }
                    }
                }
            }
        }
    }
    assert!(longest > 0);
}

#[test]
fn test_copied_verbatim() {
    let config = Config::default();
    for text in ["90", "83 c0 01", "39 c3", "f7 d8", "ff c0", "0f a3 c8", "c1 e0 04"] {
        let bytes = hex(text);
        let (code, translation) = translate(&bytes, &config);
        assert_eq!(code, bytes, "{text}");
        assert_eq!(translation.patch, None);
        assert_eq!(translation.preseed, None);
    }
}

#[test]
fn test_taint_code_only_with_taint_enabled() {
    let untainted = Config {
        taint: false,
        ..Config::default()
    };
    for text in ["8b 03", "89 44 24 08", "a5", "53", "0f b6 03"] {
        let bytes = hex(text);
        let (code, _) = translate(&bytes, &untainted);
        assert_eq!(code, bytes, "{text}");
        let (code, _) = translate(&bytes, &Config::default());
        assert!(code.len() > bytes.len(), "{text}");
        assert!(code.ends_with(&bytes), "{text}");
    }
}

#[test]
fn test_taint_copy_uses_shadow_and_register_slots() {
    let config = Config::default();
    // mov eax, [ebx]
    let (code, _) = translate(&hex("8b 03"), &config);
    let mut saves = vec![0x64, 0x89, 0x0d];
    saves.extend(le(ThreadCtxSlot::SavedEcx.offset()));
    saves.extend([0x64, 0x89, 0x05]);
    saves.extend(le(ThreadCtxSlot::SavedEax.offset()));
    assert!(code.starts_with(&saves));
    // lea ecx, [ebx]
    assert!(contains(&code, &[0x8d, 0x0b]));
    // mov eax, [ecx + taint_offset]
    let mut load = vec![0x8b, 0x81];
    load.extend(le(config.layout.taint_offset));
    assert!(contains(&code, &load));
    // mov %fs:reg_taint(eax), eax
    let mut store = vec![0x64, 0x89, 0x05];
    store.extend(le(taint_jit::context::reg_taint_offset(
        taint_jit::x86::X86Register::EAX,
    )));
    assert!(contains(&code, &store));
}

#[test]
fn test_segment_override_downgrades_taint() {
    let config = Config::default();
    // mov eax, %fs:[ebx] leaves eax untainted instead of reading a shadow
    let (code, _) = translate(&hex("64 8b 03"), &config);
    let mut clear = vec![0x64, 0xc7, 0x05];
    clear.extend(le(taint_jit::context::reg_taint_offset(
        taint_jit::x86::X86Register::EAX,
    )));
    clear.extend(le(0));
    assert_eq!(&code[..clear.len()], &clear[..]);
    assert!(code.ends_with(&hex("64 8b 03")));
}

#[test]
fn test_direct_jump_inside_map() {
    let config = Config::default();
    let (code, translation) = translate(&hex("eb 05"), &config);
    assert_eq!(code, hex("e9 00 00 00 00"));
    assert_eq!(
        translation.patch,
        Some(PendingPatch {
            offset: 1,
            target: CODE_ADDR + 7,
        })
    );

    let (code, translation) = translate(&hex("0f 85 00 01 00 00"), &config);
    assert_eq!(code, hex("0f 85 00 00 00 00"));
    assert_eq!(translation.patch.unwrap().target, CODE_ADDR + 6 + 0x100);
}

fn cross_map_jump(target: u32, jit_addr: u32, config: &Config) -> Vec<u8> {
    let mut code = vec![0x64, 0x89, 0x0d];
    code.extend(le(ThreadCtxSlot::SavedEcx.offset()));
    code.push(0x64);
    code.push(0xa3);
    code.extend(le(ThreadCtxSlot::SavedEax.offset()));
    code.push(0xb8);
    code.extend(le(target));
    code.extend([0xb9, 0, 0, 0, 0]);
    code.push(0xe9);
    let end = jit_addr + code.len() as u32 + 4;
    code.extend(le(config.runtime.ijmp.wrapping_sub(end)));
    code
}

#[test]
fn test_direct_jump_leaving_map() {
    let config = Config::default();
    let (code, translation) = translate(&hex("e9 00 00 00 10"), &config);
    let target = CODE_ADDR + 5 + 0x1000_0000;
    assert_eq!(code, cross_map_jump(target, JIT_ADDR, &config));
    assert_eq!(translation.patch, None);

    // jne out of the map: je over the resolver call
    let bytes = {
        let mut bytes = hex("0f 85");
        bytes.extend(le(0x2000_0000));
        bytes
    };
    let (code, _) = translate(&bytes, &config);
    let target = CODE_ADDR + 6 + 0x2000_0000;
    assert_eq!(code[0], 0x74);
    assert_eq!(code[1] as usize, code.len() - 2);
    assert_eq!(&code[2..], &cross_map_jump(target, JIT_ADDR + 2, &config)[..]);
}

#[test]
fn test_loop_keeps_its_condition() {
    let config = Config::default();
    let (code, translation) = translate(&hex("e2 fe"), &config);
    assert_eq!(code, hex("e2 02 eb 05 e9 00 00 00 00"));
    assert_eq!(translation.patch.unwrap().target, CODE_ADDR);
    assert_eq!(translation.patch.unwrap().offset, 5);

    let (code, _) = translate(&hex("67 e3 10"), &config);
    assert_eq!(&code[..5], &hex("67 e3 02 eb 05")[..]);
}

#[test]
fn test_call_strategies() {
    let call = hex("e8 00 01 00 00");
    let return_address = CODE_ADDR + 5;
    let hash = hash_index(return_address) as u32;

    let (code, translation) = translate(&call, &Config::default());
    let mut push = vec![0x68];
    push.extend(le(return_address));
    assert!(contains(&code, &push));
    let mut seed = vec![0x64, 0xc7, 0x05];
    seed.extend(le(hash * 8));
    seed.extend(le(return_address));
    seed.extend([0x64, 0xc7, 0x05]);
    seed.extend(le(hash * 8 + 4));
    seed.extend(le(JIT_ADDR + code.len() as u32));
    assert!(contains(&code, &seed));
    assert_eq!(
        translation.preseed,
        Some(Preseed {
            addr: return_address,
            jit_addr: JIT_ADDR + code.len() as u32,
        })
    );
    assert_eq!(translation.patch.unwrap().target, return_address + 0x100);

    let prefetching = Config {
        call_strategy: CallStrategy::PrefetchOnCall,
        ..Config::default()
    };
    let (code, translation) = translate(&call, &prefetching);
    let mut prefetch = vec![0x64, 0x0f, 0x18, 0x0d];
    prefetch.extend(le(hash * 8));
    assert!(contains(&code, &prefetch));
    assert_eq!(translation.preseed, None);

    let plain = Config {
        call_strategy: CallStrategy::None,
        taint: false,
        ..Config::default()
    };
    let (code, translation) = translate(&call, &plain);
    let mut expected = push.clone();
    expected.extend(hex("e9 00 00 00 00"));
    assert_eq!(code, expected);
    assert_eq!(translation.patch.unwrap().offset, 6);
    assert_eq!(translation.preseed, None);
}

#[test]
fn test_return_goes_to_resolver() {
    let config = Config::default();
    let (code, _) = translate(&hex("c3"), &config);
    let mut expected = vec![0xe9];
    expected.extend(le(config.runtime.ret.wrapping_sub(JIT_ADDR + 5)));
    assert_eq!(code, expected);
}

#[test]
fn test_syscalls_go_to_runtime() {
    let config = Config::default();
    let (code, _) = translate(&hex("cd 80"), &config);
    let mut expected = vec![0x64, 0xc7, 0x05];
    expected.extend(le(ThreadCtxSlot::IjmpTaint.offset()));
    expected.extend(le(0));
    expected.extend([0x64, 0xc7, 0x05]);
    expected.extend(le(ThreadCtxSlot::UserEip.offset()));
    expected.extend(le(CODE_ADDR + 2));
    expected.push(0xe9);
    let end = JIT_ADDR + expected.len() as u32 + 4;
    expected.extend(le(config.runtime.int80_emu.wrapping_sub(end)));
    assert_eq!(code, expected);

    // other interrupts trap natively
    let (code, _) = translate(&hex("cd 03"), &config);
    assert_eq!(code, hex("cd 03"));
}

#[test]
fn test_cpuid_resumes_after_itself() {
    let config = Config::default();
    let (code, _) = translate(&hex("0f a2"), &config);
    let mut record = vec![0x64, 0xc7, 0x05];
    record.extend(le(ThreadCtxSlot::JitEip.offset()));
    record.extend(le(JIT_ADDR + code.len() as u32));
    assert!(code.starts_with(&record));
    assert_eq!(code.len(), record.len() + 5);
}

#[test]
fn test_rep_string_loop() {
    let config = Config::default();
    let (code, _) = translate(&hex("f3 a5"), &config);
    let len = code.len();
    assert_eq!(code[0], 0xe3);
    assert_eq!(code[1] as usize, len - 2);
    assert_eq!(&code[len - 3..], &[0xa5, 0xe2, (-(len as i32)) as u8]);

    let (code, _) = translate(&hex("67 f3 66 ab"), &config);
    let len = code.len();
    assert_eq!(&code[..2], &[0x67, 0xe3]);
    assert_eq!(&code[len - 6..len - 1], &[0x66, 0x67, 0xab, 0x67, 0xe2]);

    let untainted = Config {
        taint: false,
        ..Config::default()
    };
    let (code, _) = translate(&hex("f3 a4"), &untainted);
    assert_eq!(code, hex("e3 03 a4 e2 fb"));
}

#[test]
fn test_conditional_move() {
    let untainted = Config {
        taint: false,
        ..Config::default()
    };
    // cmove eax, ecx: jne over mov eax, ecx
    let (code, _) = translate(&hex("0f 44 c1"), &untainted);
    assert_eq!(code, hex("75 02 8b c1"));
    let (code, _) = translate(&hex("64 0f 4f 03"), &untainted);
    assert_eq!(code, hex("7e 03 64 8b 03"));

    let (code, _) = translate(&hex("0f 44 c1"), &Config::default());
    assert_eq!(code[0], 0x75);
    assert_eq!(code[1] as usize, code.len() - 2);
    assert!(code.ends_with(&hex("8b c1")));
}

#[test]
fn test_illegal_instructions_trap() {
    let config = Config::default();
    for text in ["0f 0b", "0f 6f c1", "ff f8", "0f 38 00 c1"] {
        let (code, translation) = translate(&hex(text), &config);
        assert_eq!(code, hex("0f 0b"), "{text}");
        assert_eq!(translation.patch, None);
    }
}
