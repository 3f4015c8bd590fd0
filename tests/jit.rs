use taint_jit::{
    config::{CallStrategy, Config},
    context::{ThreadCtxSlot, THREAD_CTX_SLOTS_BYTES},
    jit::{CodeRegions, Jit},
    jump_cache::{hash_index, JumpCache, JMP_CACHE_BYTES, JMP_CACHE_SIZE},
    x86::X86Register::*,
};
use test_utils::{
    interpreter::{Exit, ZF},
    Interpreter, SparseMemory,
};

const CODE: u32 = 0x0804_8000;
const DATA: u32 = 0x0600_0000;
const STACK_TOP: u32 = 0x0010_0000;
const FS_BASE: u32 = 0xD000_0000;

fn hex(text: &str) -> Vec<u8> {
    text.split_whitespace()
        .map(|byte| u8::from_str_radix(byte, 16).unwrap())
        .collect()
}

/// Loads `code` at `CODE` and registers exactly its bytes as a code region
fn load_code(config: Config, code: &[u8]) -> (Jit, SparseMemory) {
    let memory = SparseMemory::new();
    memory.load(CODE, code);
    let jit = Jit::new(config);
    jit.add_code_region(CODE..CODE + code.len() as u32);
    (jit, memory)
}

fn start_at<'m>(
    jit: &Jit,
    memory: &'m SparseMemory,
    entry: u32,
) -> Interpreter<'m, SparseMemory> {
    let mut interpreter = Interpreter::new(memory, FS_BASE);
    interpreter.pc = jit.jit(entry, memory).unwrap();
    interpreter.set_reg(ESP, STACK_TOP);
    let runtime = &jit.config().runtime;
    interpreter.stops = vec![
        runtime.ijmp,
        runtime.ret,
        runtime.int80_emu,
        runtime.cpuid_emu,
    ];
    interpreter
}

fn shadow(jit: &Jit, addr: u32) -> u32 {
    addr.wrapping_add(jit.config().layout.taint_offset)
}

#[test]
fn test_translation_is_idempotent() {
    let (jit, memory) = load_code(Config::default(), &hex("8b 03 89 c2 f4"));
    assert_eq!(jit.lookup_addr(CODE), None);
    let first = jit.jit(CODE, &memory).unwrap();
    assert!(jit.config().is_jit_address(first));
    assert_eq!(first, jit.config().layout.jit_start);
    assert_eq!(jit.jit(CODE, &memory), Some(first));
    assert_eq!(jit.lookup_addr(CODE), Some(first));
    assert_eq!(jit.jit(CODE + 0x1000, &memory), None);

    // the rest of the block was translated along with the entry
    let second = jit.lookup_addr(CODE + 2).unwrap();
    assert!(second > first);
    assert_eq!(jit.jit(CODE + 2, &memory), Some(second));
    assert_eq!(jit.lookup_addr(CODE + 1), None);
}

#[test]
fn test_reverse_lookup() {
    let (jit, memory) = load_code(Config::default(), &hex("8b 03 89 c2 f4"));
    let first = jit.jit(CODE, &memory).unwrap();
    let second = jit.lookup_addr(CODE + 2).unwrap();
    let third = jit.lookup_addr(CODE + 4).unwrap();

    let op = jit.rev_lookup_addr(first).unwrap();
    assert_eq!(op.addr, CODE);
    assert_eq!(op.op_start, first);
    assert_eq!(op.op_len, second - first);

    let op = jit.rev_lookup_addr(second + 3).unwrap();
    assert_eq!(op.addr, CODE + 2);
    assert_eq!(op.op_start, second);

    let op = jit.rev_lookup_addr(third).unwrap();
    assert_eq!(op.addr, CODE + 4);
    assert_eq!(op.op_len, 1);

    assert_eq!(jit.rev_lookup_addr(first - 1), None);
    assert_eq!(jit.rev_lookup_addr(0x1234), None);

    // the code in the text section is what was installed in the translated code range
    let installed = jit.code_bytes(first, op.op_start + op.op_len - first).unwrap();
    assert_eq!(installed, memory.bytes(first, installed.len()));
    assert_eq!(jit.code_bytes(third, 0x1000), None);
}

#[test]
fn test_taint_propagation() {
    // mov (%ebx), %eax; mov %eax, %edx; mov %edx, (%ecx); xor %eax, %eax; hlt
    let (jit, memory) = load_code(Config::default(), &hex("8b 03 89 c2 89 11 31 c0 f4"));
    let destination = DATA + 0x100;
    memory.set_u32(DATA, 0x1234_5678);
    memory.set_u32(shadow(&jit, DATA), 0xff00_ff00);

    let mut interpreter = start_at(&jit, &memory, CODE);
    interpreter.set_reg(EBX, DATA);
    interpreter.set_reg(ECX, destination);
    interpreter.set_reg(ESI, 0x5555);
    interpreter.set_reg_taint(ESI, 0x0f);
    assert_eq!(interpreter.run(1000), Exit::Halt);

    assert_eq!(interpreter.reg(EAX), 0);
    assert_eq!(interpreter.reg(EBX), DATA);
    assert_eq!(interpreter.reg(ECX), destination);
    assert_eq!(interpreter.reg(EDX), 0x1234_5678);
    assert_eq!(interpreter.reg(ESP), STACK_TOP);
    assert!(interpreter.flag(ZF));
    assert_eq!(memory.u32_at(destination), 0x1234_5678);

    assert_eq!(interpreter.reg_taint(EAX), 0);
    assert_eq!(interpreter.reg_taint(EDX), 0xff00_ff00);
    assert_eq!(interpreter.reg_taint(ESI), 0x0f);
    assert_eq!(interpreter.reg_taint(EBX), 0);
    assert_eq!(memory.u32_at(shadow(&jit, destination)), 0xff00_ff00);
    assert_eq!(memory.u32_at(shadow(&jit, DATA)), 0xff00_ff00);
}

#[test]
fn test_taint_merges_and_erases() {
    // add %ebx, %eax; lea 4(%esi,%edi,2), %ecx; mov $1, %edx; push %eax; pop %ebp; hlt
    let (jit, memory) = load_code(
        Config::default(),
        &hex("01 d8 8d 4c 7e 04 ba 01 00 00 00 50 5d f4"),
    );
    let mut interpreter = start_at(&jit, &memory, CODE);
    interpreter.set_reg(EAX, 1);
    interpreter.set_reg(EBX, 2);
    interpreter.set_reg(ESI, 0x100);
    interpreter.set_reg(EDI, 0x10);
    interpreter.set_reg_taint(EAX, 0x0000_00f0);
    interpreter.set_reg_taint(EBX, 0x0f00_0000);
    interpreter.set_reg_taint(ESI, 0x1);
    interpreter.set_reg_taint(EDI, 0x2);
    interpreter.set_reg_taint(EDX, 0xffff_ffff);
    assert_eq!(interpreter.run(1000), Exit::Halt);

    assert_eq!(interpreter.reg(EAX), 3);
    assert_eq!(interpreter.reg(ECX), 0x124);
    assert_eq!(interpreter.reg(EDX), 1);
    assert_eq!(interpreter.reg(EBP), 3);
    assert_eq!(interpreter.reg(ESP), STACK_TOP);
    assert_eq!(interpreter.reg_taint(EAX), 0x0f00_00f0);
    assert_eq!(interpreter.reg_taint(ECX), 0x3);
    assert_eq!(interpreter.reg_taint(EDX), 0);
    assert_eq!(interpreter.reg_taint(EBP), 0x0f00_00f0);
    assert_eq!(memory.u32_at(shadow(&jit, STACK_TOP - 4)), 0x0f00_00f0);
}

#[test]
fn test_taint_disabled_leaves_shadow_alone() {
    let config = Config {
        taint: false,
        ..Config::default()
    };
    let (jit, memory) = load_code(config, &hex("8b 03 89 01 f4"));
    memory.set_u32(DATA, 7);
    memory.set_u32(shadow(&jit, DATA), 0xffff_ffff);
    let mut interpreter = start_at(&jit, &memory, CODE);
    interpreter.set_reg(EBX, DATA);
    interpreter.set_reg(ECX, DATA + 4);
    assert_eq!(interpreter.run(100), Exit::Halt);
    assert_eq!(memory.u32_at(DATA + 4), 7);
    assert_eq!(interpreter.reg_taint(EAX), 0);
    assert_eq!(memory.u32_at(shadow(&jit, DATA + 4)), 0);
}

#[test]
fn test_branches_inside_the_map() {
    // mov $0, %eax; 1: inc %eax; cmp $5, %eax; jne 1b; hlt
    let code = hex("b8 00 00 00 00 40 83 f8 05 75 fa f4");
    let (jit, memory) = load_code(Config::default(), &code);
    let mut interpreter = start_at(&jit, &memory, CODE);
    assert_eq!(interpreter.run(1000), Exit::Halt);
    assert_eq!(interpreter.reg(EAX), 5);

    // jmp 1f; int3; 1: mov $7, %eax; hlt
    let (jit, memory) = load_code(Config::default(), &hex("eb 01 cc b8 07 00 00 00 f4"));
    let mut interpreter = start_at(&jit, &memory, CODE);
    assert_eq!(interpreter.run(1000), Exit::Halt);
    assert_eq!(interpreter.reg(EAX), 7);
    assert_eq!(jit.lookup_addr(CODE + 2), None);
    assert!(jit.lookup_addr(CODE + 3).is_some());
}

#[test]
fn test_leaving_the_map_goes_to_resolver() {
    // mov $3, %eax; jmp CODE + 0x1000
    let mut code = hex("b8 03 00 00 00 e9");
    code.extend_from_slice(&(0x1000u32 - 10).to_le_bytes());
    let (jit, memory) = load_code(Config::default(), &code);
    let mut interpreter = start_at(&jit, &memory, CODE);
    interpreter.set_reg(ECX, 0x99);
    let ijmp = jit.config().runtime.ijmp;
    assert_eq!(interpreter.run(1000), Exit::Stop(ijmp));
    assert_eq!(interpreter.reg(EAX), CODE + 0x1000);
    assert_eq!(interpreter.reg(ECX), 0);

    // the target becomes code later and the resolver finds it
    assert_eq!(jit.resolve(CODE + 0x1000, &memory), None);
    memory.load(CODE + 0x1000, &hex("b9 05 00 00 00 f4"));
    jit.add_code_region(CODE + 0x1000..CODE + 0x1006);
    let target = jit.resolve(CODE + 0x1000, &memory).unwrap();
    assert_eq!(jit.cache().lookup(CODE + 0x1000), Some(target));
    interpreter.pc = target;
    assert_eq!(interpreter.run(1000), Exit::Halt);
    assert_eq!(interpreter.reg(ECX), 5);
}

#[test]
fn test_falling_off_the_map() {
    let (jit, memory) = load_code(Config::default(), &hex("40 40"));
    let mut interpreter = start_at(&jit, &memory, CODE);
    assert_eq!(interpreter.run(1000), Exit::Stop(jit.config().runtime.ijmp));
    assert_eq!(interpreter.reg(EAX), CODE + 2);
}

#[test]
fn test_call_preseeds_return_address() {
    // push $5; call 1f; hlt; 1: ret
    let (jit, memory) = load_code(Config::default(), &hex("6a 05 e8 01 00 00 00 f4 c3"));
    let return_address = CODE + 7;
    let mut interpreter = start_at(&jit, &memory, CODE);
    let return_site = jit.lookup_addr(return_address).unwrap();
    assert_eq!(jit.cache().lookup(return_address), Some(return_site));

    let ret = jit.config().runtime.ret;
    assert_eq!(interpreter.run(1000), Exit::Stop(ret));
    let esp = interpreter.reg(ESP);
    assert_eq!(esp, STACK_TOP - 8);
    assert_eq!(memory.u32_at(esp), return_address);
    assert_eq!(memory.u32_at(esp + 4), 5);
    assert_eq!(memory.u32_at(shadow(&jit, esp)), 0);

    // the translated call also seeded the runtime's copy of the cache
    let slot = hash_index(return_address) as u32 * 8;
    assert_eq!(interpreter.fs_u32(slot), return_address);
    assert_eq!(interpreter.fs_u32(slot + 4), return_site);

    // what the return resolver does
    interpreter.set_reg(ESP, esp + 4);
    interpreter.pc = jit.resolve(return_address, &memory).unwrap();
    assert_eq!(interpreter.pc, return_site);
    assert_eq!(interpreter.run(1000), Exit::Halt);
}

#[test]
fn test_call_without_preseed() {
    for call_strategy in [CallStrategy::PrefetchOnCall, CallStrategy::None] {
        let config = Config {
            call_strategy,
            ..Config::default()
        };
        let (jit, memory) = load_code(config, &hex("e8 01 00 00 00 f4 c3"));
        let mut interpreter = start_at(&jit, &memory, CODE);
        assert_eq!(jit.cache().lookup(CODE + 5), None);
        assert_eq!(interpreter.run(1000), Exit::Stop(jit.config().runtime.ret));
        assert_eq!(memory.u32_at(interpreter.reg(ESP)), CODE + 5);
        let slot = hash_index(CODE + 5) as u32 * 8;
        assert_eq!(interpreter.fs_u32(slot), 0);
    }
}

#[test]
fn test_region_grows() {
    let config = Config {
        initial_code_expansion: 1,
        ..Config::default()
    };
    let mut code = hex("8b 03").repeat(300);
    code.push(0xf4);
    let (jit, memory) = load_code(config, &code);
    memory.set_u32(shadow(&jit, DATA), 0xab);
    let mut interpreter = start_at(&jit, &memory, CODE);
    let jit_start = jit.config().layout.jit_start;

    // the first region could not hold the block and was given up
    let entry = jit.lookup_addr(CODE).unwrap();
    assert!(entry >= jit_start + 0x1000);
    for index in 0..300 {
        let addr = CODE + 2 * index;
        let jit_addr = jit.lookup_addr(addr).unwrap();
        assert_eq!(jit.rev_lookup_addr(jit_addr).unwrap().addr, addr);
    }

    interpreter.set_reg(EBX, DATA);
    assert_eq!(interpreter.run(100_000), Exit::Halt);
    assert_eq!(interpreter.reg_taint(EAX), 0xab);
}

#[test]
fn test_code_regions() {
    let memory = SparseMemory::new();
    memory.load(CODE, &[0x90; 0x100]);
    let jit = Jit::new(Config::default());
    jit.add_code_region(CODE..CODE + 0x100);
    assert!(jit.is_code(CODE));
    assert!(jit.is_code(CODE + 0xff));
    assert!(!jit.is_code(CODE + 0x100));

    let translated = jit.jit(CODE + 0x20, &memory).unwrap();
    jit.del_code_region(CODE + 0x40..CODE + 0x80);
    assert!(jit.is_code(CODE + 0x3f));
    assert!(!jit.is_code(CODE + 0x40));
    assert!(!jit.is_code(CODE + 0x7f));
    assert!(jit.is_code(CODE + 0x80));
    assert_eq!(jit.jit(CODE + 0x50, &memory), None);

    // the translation of the cut map is gone but still reverse resolvable
    assert_eq!(jit.lookup_addr(CODE + 0x20), None);
    assert_eq!(jit.rev_lookup_addr(translated).unwrap().addr, CODE + 0x20);
    let retranslated = jit.jit(CODE + 0x20, &memory).unwrap();
    assert_ne!(retranslated, translated);

    // registering again replaces the overlapped maps
    jit.add_code_region(CODE..CODE + 0x100);
    assert!(jit.is_code(CODE + 0x50));
    assert_eq!(jit.lookup_addr(CODE + 0x20), None);
    assert!(jit.jit(CODE + 0x50, &memory).is_some());

    jit.add_code_region(CODE..CODE);
    assert!(jit.is_code(CODE));
}

#[test]
fn test_resolve_uses_the_cache() {
    let (jit, memory) = load_code(Config::default(), &hex("40 c3"));
    assert_eq!(jit.cache().lookup(CODE), None);
    let jit_addr = jit.resolve(CODE, &memory).unwrap();
    assert_eq!(jit.cache().lookup(CODE), Some(jit_addr));

    // a cached entry wins over the translator
    jit.cache().insert(CODE + 1, 0xdead_beef);
    assert_eq!(jit.resolve(CODE + 1, &memory), Some(0xdead_beef));
}

#[test]
fn test_jump_cache_collisions() {
    use rand::{rngs::SmallRng, Rng, SeedableRng};
    let cache = JumpCache::new();
    let mut rng = SmallRng::seed_from_u64(0xcafe);
    for _ in 0..1000 {
        let addr: u32 = rng.gen();
        let jit_addr = rng.gen_range(0xA000_0000..0xB000_0000);
        cache.insert(addr, jit_addr);
        assert_eq!(cache.lookup(addr), Some(jit_addr));
        assert_eq!(cache.slot(hash_index(addr)), Some((addr, jit_addr)));

        // a colliding address evicts the entry
        let other = addr ^ 1;
        assert_eq!(hash_index(other), hash_index(addr));
        cache.insert(other, jit_addr + 1);
        assert_eq!(cache.lookup(addr), None);
        assert_eq!(cache.lookup(other), Some(jit_addr + 1));
    }
    assert!(hash_index(u32::MAX) < JMP_CACHE_SIZE);
    assert_eq!(JumpCache::new().lookup(0), None);
}

#[test]
fn test_config_from_json() {
    let config = Config::from_json(r#"{"taint": false, "call_strategy": "PrefetchOnCall"}"#)
        .unwrap();
    assert!(!config.taint);
    assert_eq!(config.call_strategy, CallStrategy::PrefetchOnCall);
    assert_eq!(config.layout, Config::default().layout);

    let config = Config::from_json(r#"{"layout": {"jit_start": 2147483648}}"#).unwrap();
    assert_eq!(config.layout.jit_start, 0x8000_0000);
    assert_eq!(config.layout.taint_offset, 0x5000_0000);
    assert!(config.is_jit_address(0x8000_0000));
    assert!(!config.is_jit_address(0x7fff_ffff));

    assert!(Config::from_json(r#"{"taint": 1}"#).is_err());
}

#[cfg(feature = "shuttle-test")]
#[test]
fn test_concurrent_translation() {
    use std::sync::Arc;

    shuttle::check_random(
        || {
            let (jit, memory) = load_code(Config::default(), &hex("40 83 f8 05 75 fa f4"));
            let jit = Arc::new(jit);
            let memory = Arc::new(memory);
            let threads: Vec<_> = (0..2)
                .map(|index| {
                    let jit = jit.clone();
                    let memory = memory.clone();
                    shuttle::thread::spawn(move || jit.jit(CODE + index, &*memory))
                })
                .collect();
            let results: Vec<_> = threads
                .into_iter()
                .map(|thread| thread.join().unwrap())
                .collect();
            assert_eq!(results[0], jit.lookup_addr(CODE));
            assert!(results[0].is_some());
            // whichever thread came second found the translation of the first
            assert_eq!(results[1], jit.lookup_addr(CODE + 1));
        },
        50,
    );
}

#[test]
fn test_cmpxchg_taint_follows_the_outcome() {
    // cmpxchg %ecx, (%ebx); hlt
    for (accumulator, exchanged) in [(5, true), (4, false)] {
        let (jit, memory) = load_code(Config::default(), &hex("0f b1 0b f4"));
        memory.set_u32(DATA, 5);
        memory.set_u32(shadow(&jit, DATA), 0x0000_0011);
        let mut interpreter = start_at(&jit, &memory, CODE);
        interpreter.set_reg(EAX, accumulator);
        interpreter.set_reg(EBX, DATA);
        interpreter.set_reg(ECX, 9);
        interpreter.set_reg_taint(EAX, 0x0000_2200);
        interpreter.set_reg_taint(ECX, 0x00aa_0000);
        assert_eq!(interpreter.run(1000), Exit::Halt);

        assert_eq!(interpreter.flag(ZF), exchanged);
        assert_eq!(interpreter.reg(ECX), 9);
        assert_eq!(interpreter.reg(EBX), DATA);
        assert_eq!(interpreter.reg_taint(ECX), 0x00aa_0000);
        if exchanged {
            assert_eq!(memory.u32_at(DATA), 9);
            assert_eq!(memory.u32_at(shadow(&jit, DATA)), 0x00aa_0000);
            assert_eq!(interpreter.reg_taint(EAX), 0x0000_2200);
        } else {
            assert_eq!(memory.u32_at(DATA), 5);
            assert_eq!(interpreter.reg(EAX), 5);
            assert_eq!(memory.u32_at(shadow(&jit, DATA)), 0x0000_0011);
            assert_eq!(interpreter.reg_taint(EAX), 0x0000_0011);
        }
        // the recorded operand address
        assert_eq!(interpreter.fs_u32(ThreadCtxSlot::ScratchAddress.offset()), DATA);
    }
}

#[test]
fn test_cmpxchg8b_taint_follows_the_outcome() {
    // cmpxchg8b (%ebx); hlt
    for (low, exchanged) in [(1, true), (7, false)] {
        let (jit, memory) = load_code(Config::default(), &hex("0f c7 0b f4"));
        memory.set_u32(DATA, 1);
        memory.set_u32(DATA + 4, 2);
        memory.set_u32(shadow(&jit, DATA), 0x11);
        memory.set_u32(shadow(&jit, DATA + 4), 0x22);
        let mut interpreter = start_at(&jit, &memory, CODE);
        interpreter.set_reg(EAX, low);
        interpreter.set_reg(EDX, 2);
        interpreter.set_reg(EBX, DATA);
        interpreter.set_reg(ECX, 4);
        interpreter.set_reg_taint(EAX, 0xa0);
        interpreter.set_reg_taint(EDX, 0xd0);
        interpreter.set_reg_taint(EBX, 0x33);
        interpreter.set_reg_taint(ECX, 0x44);
        assert_eq!(interpreter.run(1000), Exit::Halt);

        assert_eq!(interpreter.flag(ZF), exchanged);
        if exchanged {
            assert_eq!(memory.u32_at(DATA), DATA);
            assert_eq!(memory.u32_at(DATA + 4), 4);
            assert_eq!(memory.u32_at(shadow(&jit, DATA)), 0x33);
            assert_eq!(memory.u32_at(shadow(&jit, DATA + 4)), 0x44);
            assert_eq!(interpreter.reg_taint(EAX), 0xa0);
            assert_eq!(interpreter.reg_taint(EDX), 0xd0);
        } else {
            assert_eq!((interpreter.reg(EAX), interpreter.reg(EDX)), (1, 2));
            assert_eq!(memory.u32_at(shadow(&jit, DATA)), 0x11);
            assert_eq!(memory.u32_at(shadow(&jit, DATA + 4)), 0x22);
            assert_eq!(interpreter.reg_taint(EAX), 0x11);
            assert_eq!(interpreter.reg_taint(EDX), 0x22);
        }
    }
}

#[test]
fn test_indirect_jump_target_taint() {
    // jmp *(%ebx)
    let (jit, memory) = load_code(Config::default(), &hex("ff 23"));
    memory.set_u32(DATA, 0x0805_0000);
    memory.set_u32(shadow(&jit, DATA), 0x0102_0304);
    let mut interpreter = start_at(&jit, &memory, CODE);
    interpreter.set_reg(EBX, DATA);
    interpreter.set_reg(ECX, 0x99);
    assert_eq!(interpreter.run(1000), Exit::Stop(jit.config().runtime.ijmp));
    assert_eq!(interpreter.reg(EAX), 0x0805_0000);
    assert_eq!(interpreter.reg(ECX), 0x0102_0304);
    assert_eq!(interpreter.fs_u32(ThreadCtxSlot::IjmpTaint.offset()), 0x0102_0304);

    // jmp *%ebx
    let (jit, memory) = load_code(Config::default(), &hex("ff e3"));
    let mut interpreter = start_at(&jit, &memory, CODE);
    interpreter.set_reg(EBX, 0x0805_0000);
    interpreter.set_reg_taint(EBX, 0xff00_0000);
    assert_eq!(interpreter.run(1000), Exit::Stop(jit.config().runtime.ijmp));
    assert_eq!(interpreter.reg(EAX), 0x0805_0000);
    assert_eq!(interpreter.reg(ECX), 0xff00_0000);
}

#[test]
fn test_segment_override_clears_indirect_jump_taint() {
    // jmp *%fs:(%ebx)
    let (jit, memory) = load_code(Config::default(), &hex("64 ff 23"));
    let offset = JMP_CACHE_BYTES + THREAD_CTX_SLOTS_BYTES;
    memory.set_u32(shadow(&jit, offset), 0xffff_ffff);
    let mut interpreter = start_at(&jit, &memory, CODE);
    interpreter.set_fs_u32(offset, 0x0805_0000);
    interpreter.set_fs_u32(ThreadCtxSlot::IjmpTaint.offset(), 0xdead);
    interpreter.set_reg(EBX, offset);
    interpreter.set_reg_taint(EBX, 0xffff_ffff);
    assert_eq!(interpreter.run(1000), Exit::Stop(jit.config().runtime.ijmp));
    assert_eq!(interpreter.reg(EAX), 0x0805_0000);
    assert_eq!(interpreter.reg(ECX), 0);
    assert_eq!(interpreter.fs_u32(ThreadCtxSlot::IjmpTaint.offset()), 0);
}

#[test]
fn test_indirect_call_target_taint() {
    // call *%ebx; hlt
    let (jit, memory) = load_code(Config::default(), &hex("ff d3 f4"));
    memory.set_u32(shadow(&jit, STACK_TOP - 4), 0xffff_ffff);
    let mut interpreter = start_at(&jit, &memory, CODE);
    interpreter.set_reg(EBX, 0x0805_0000);
    interpreter.set_reg_taint(EBX, 0x0000_ff00);
    assert_eq!(interpreter.run(1000), Exit::Stop(jit.config().runtime.ijmp));
    assert_eq!(interpreter.reg(EAX), 0x0805_0000);
    assert_eq!(interpreter.reg(ECX), 0x0000_ff00);
    assert_eq!(interpreter.fs_u32(ThreadCtxSlot::IjmpTaint.offset()), 0x0000_ff00);
    assert_eq!(interpreter.reg(ESP), STACK_TOP - 4);
    assert_eq!(memory.u32_at(STACK_TOP - 4), CODE + 2);
    assert_eq!(memory.u32_at(shadow(&jit, STACK_TOP - 4)), 0);
}

#[test]
fn test_pusha_popa_taint() {
    // pusha; hlt; popa; hlt
    let (jit, memory) = load_code(Config::default(), &hex("60 f4 61 f4"));
    let mut interpreter = start_at(&jit, &memory, CODE);
    let registers = [EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI];
    for (index, reg) in registers.iter().enumerate() {
        if *reg != ESP {
            interpreter.set_reg(*reg, index as u32 * 0x10);
        }
        interpreter.set_reg_taint(*reg, 0x0101_0101 * (index as u32 + 1));
    }
    assert_eq!(interpreter.run(1000), Exit::Halt);
    assert_eq!(interpreter.reg(ESP), STACK_TOP - 32);
    for (index, reg) in registers.iter().enumerate() {
        let slot = STACK_TOP - 4 * (index as u32 + 1);
        assert_eq!(
            memory.u32_at(shadow(&jit, slot)),
            interpreter.reg_taint(*reg),
            "{:?}",
            reg
        );
    }

    for index in 0..8 {
        let slot = STACK_TOP - 4 * (index + 1);
        memory.set_u32(shadow(&jit, slot), 0xa0 + index);
    }
    assert_eq!(interpreter.run(1000), Exit::Halt);
    assert_eq!(interpreter.reg(ESP), STACK_TOP);
    for (index, reg) in registers.iter().enumerate() {
        let expected = if *reg == ESP {
            0x0505_0505
        } else {
            0xa0 + index as u32
        };
        assert_eq!(interpreter.reg_taint(*reg), expected, "{:?}", reg);
    }
}

#[test]
fn test_enter_leave_taint() {
    // enter $8, $0; hlt; leave; hlt
    let (jit, memory) = load_code(Config::default(), &hex("c8 08 00 00 f4 c9 f4"));
    let mut interpreter = start_at(&jit, &memory, CODE);
    interpreter.set_reg(EBP, 0x1234);
    interpreter.set_reg_taint(EBP, 0x77);
    interpreter.set_reg_taint(ESP, 0x05);
    assert_eq!(interpreter.run(1000), Exit::Halt);
    assert_eq!(interpreter.reg(EBP), STACK_TOP - 4);
    assert_eq!(interpreter.reg(ESP), STACK_TOP - 12);
    assert_eq!(memory.u32_at(STACK_TOP - 4), 0x1234);
    assert_eq!(memory.u32_at(shadow(&jit, STACK_TOP - 4)), 0x77);
    assert_eq!(interpreter.reg_taint(EBP), 0x05);
    assert_eq!(interpreter.reg_taint(ESP), 0x05);

    memory.set_u32(shadow(&jit, STACK_TOP - 4), 0x99);
    interpreter.set_reg_taint(EBP, 0x66);
    assert_eq!(interpreter.run(1000), Exit::Halt);
    assert_eq!(interpreter.reg(EBP), 0x1234);
    assert_eq!(interpreter.reg(ESP), STACK_TOP);
    assert_eq!(interpreter.reg_taint(ESP), 0x66);
    assert_eq!(interpreter.reg_taint(EBP), 0x99);
}

#[test]
fn test_xchg_swaps_taint() {
    // xchg %ecx, (%ebx); xchg %eax, %ebx; hlt
    let (jit, memory) = load_code(Config::default(), &hex("87 0b 93 f4"));
    memory.set_u32(DATA, 2);
    memory.set_u32(shadow(&jit, DATA), 0xdd);
    let mut interpreter = start_at(&jit, &memory, CODE);
    interpreter.set_reg(EAX, 3);
    interpreter.set_reg(EBX, DATA);
    interpreter.set_reg(ECX, 1);
    interpreter.set_reg_taint(EAX, 0x0a);
    interpreter.set_reg_taint(EBX, 0x0b);
    interpreter.set_reg_taint(ECX, 0x0c);
    assert_eq!(interpreter.run(1000), Exit::Halt);

    assert_eq!(interpreter.reg(ECX), 2);
    assert_eq!(memory.u32_at(DATA), 1);
    assert_eq!(interpreter.reg_taint(ECX), 0xdd);
    assert_eq!(memory.u32_at(shadow(&jit, DATA)), 0x0c);

    assert_eq!(interpreter.reg(EAX), DATA);
    assert_eq!(interpreter.reg(EBX), 3);
    assert_eq!(interpreter.reg_taint(EAX), 0x0b);
    assert_eq!(interpreter.reg_taint(EBX), 0x0a);
}

#[test]
fn test_extensions_clear_upper_taint() {
    // movzbl (%ebx), %eax; movswl (%ebx), %ecx; movsbw %bl, %dx; hlt
    let (jit, memory) = load_code(
        Config::default(),
        &hex("0f b6 03 0f bf 0b 66 0f be d3 f4"),
    );
    memory.set_u32(DATA, 0x0000_80f0);
    memory.set_u32(shadow(&jit, DATA), 0x4433_2211);
    let mut interpreter = start_at(&jit, &memory, CODE);
    interpreter.set_reg(EBX, DATA);
    interpreter.set_reg_taint(EAX, 0xffff_ffff);
    interpreter.set_reg_taint(ECX, 0xffff_ffff);
    interpreter.set_reg_taint(EDX, 0xffff_ffff);
    interpreter.set_reg_taint(EBX, 0x0000_00bb);
    assert_eq!(interpreter.run(1000), Exit::Halt);

    assert_eq!(interpreter.reg(EAX), 0xf0);
    assert_eq!(interpreter.reg(ECX), 0xffff_80f0);
    assert_eq!(interpreter.reg(EDX) & 0xffff, 0);
    assert_eq!(interpreter.reg_taint(EAX), 0x0000_0011);
    assert_eq!(interpreter.reg_taint(ECX), 0x0000_2211);
    assert_eq!(interpreter.reg_taint(EDX), 0xffff_00bb);

    // cbw; hlt; cwde; hlt; cdq; hlt
    let (jit, memory) = load_code(Config::default(), &hex("66 98 f4 98 f4 99 f4"));
    let mut interpreter = start_at(&jit, &memory, CODE);
    interpreter.set_reg(EAX, 0x80);
    interpreter.set_reg_taint(EAX, 0xffff_ffff);
    interpreter.set_reg_taint(EDX, 0xffff_ffff);
    assert_eq!(interpreter.run(1000), Exit::Halt);
    assert_eq!(interpreter.reg(EAX), 0xff80);
    assert_eq!(interpreter.reg_taint(EAX), 0xffff_00ff);
    assert_eq!(interpreter.run(1000), Exit::Halt);
    assert_eq!(interpreter.reg(EAX), 0xffff_ff80);
    assert_eq!(interpreter.reg_taint(EAX), 0x0000_00ff);
    assert_eq!(interpreter.reg_taint(EDX), 0xffff_ffff);
    assert_eq!(interpreter.run(1000), Exit::Halt);
    assert_eq!(interpreter.reg(EDX), 0xffff_ffff);
    assert_eq!(interpreter.reg_taint(EDX), 0);
    assert_eq!(interpreter.reg_taint(EAX), 0x0000_00ff);
}

#[test]
fn test_16_bit_direct_targets_are_truncated() {
    // jmp .+0x14 with a 16 bit displacement
    let (jit, memory) = load_code(Config::default(), &hex("66 e9 10 00"));
    let mut interpreter = start_at(&jit, &memory, CODE);
    assert_eq!(interpreter.run(1000), Exit::Stop(jit.config().runtime.ijmp));
    assert_eq!(interpreter.reg(EAX), (CODE + 4 + 0x10) & 0xffff);

    // xor %eax, %eax; jz .+0x15 with a 16 bit displacement
    let (jit, memory) = load_code(Config::default(), &hex("31 c0 66 0f 84 10 00"));
    let mut interpreter = start_at(&jit, &memory, CODE);
    assert_eq!(interpreter.run(1000), Exit::Stop(jit.config().runtime.ijmp));
    assert_eq!(interpreter.reg(EAX), (CODE + 7 + 0x10) & 0xffff);
    assert_eq!(interpreter.reg(ECX), 0);
}
