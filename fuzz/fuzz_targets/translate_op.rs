#![no_main]

use libfuzzer_sys::fuzz_target;

use taint_jit::{
    classify::{classify, Action, Control},
    config::{CallStrategy, Config},
    decoder::decode,
    jit::MAX_MACHINE_CODE_LENGTH_PER_INSTRUCTION,
    translate::{translate_op, TranslationContext},
};

const CODE_START: u32 = 0x0804_8000;

#[derive(arbitrary::Arbitrary, Debug)]
struct FuzzData {
    taint: bool,
    call_strategy: CallStrategy,
    code: Vec<u8>,
}

fuzz_target!(|data: FuzzData| {
    let config = Config {
        taint: data.taint,
        call_strategy: data.call_strategy,
        ..Config::default()
    };
    let map = CODE_START..CODE_START.wrapping_add(data.code.len() as u32);
    let mut offset = 0;
    let mut text = Vec::new();
    while offset < data.code.len() {
        let addr = CODE_START + offset as u32;
        let instruction = decode(&data.code[offset..], addr);
        // far transfers abort the translator
        if matches!(
            classify(&instruction),
            Action::Control(Control::CallFar | Control::ReturnFar)
        ) {
            break;
        }
        let context = TranslationContext {
            config: &config,
            jit_addr: config.layout.jit_start + text.len() as u32,
            map: map.clone(),
        };
        let translation = translate_op(&mut text, &instruction, &context);
        assert!(translation.len <= MAX_MACHINE_CODE_LENGTH_PER_INSTRUCTION);
        offset += instruction.len.max(1);
    }
});
