//! Instruction classification.
//!
//! Every opcode maps to exactly one [`Action`] that tells the translator how to re-emit it.
//! The tables are indexed by the opcode byte (or the ModRM reg field for the group tables).

use crate::decoder::{DecodedInstruction, Opcode};

/// Taint primitives taking a ModRM operand
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModRmOp {
    OrMemToReg,
    OrRegToMem,
    XorMemToReg,
    XorRegToMem,
    CopyMemToReg,
    CopyRegToMem,
    ByteOrMemToReg,
    ByteOrRegToMem,
    ByteXorMemToReg,
    ByteXorRegToMem,
    ByteCopyMemToReg,
    ByteCopyRegToMem,
    /// `movzx` / `movsx` from a word
    CopyZxMemToReg,
    /// `movzx` / `movsx` from a byte
    ByteCopyZxMemToReg,
    SwapRegMem,
    ByteSwapRegMem,
    /// `push r/m`
    CopyMemToPush,
    /// `pop r/m`
    CopyPopToMem,
    EraseMem,
    ByteEraseMem,
    Lea,
}

/// Taint primitives taking the register encoded in the opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterOffsetOp {
    /// `push r`
    CopyRegToPush,
    /// `pop r`
    CopyPopToReg,
}

/// Taint primitives taking only a register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterOp {
    /// `xchg eax, r`
    SwapAxReg,
    /// The register receives an untainted value
    EraseReg,
    /// The byte register receives an untainted value
    ByteEraseReg,
}

/// Taint primitives with implicit stack operands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OffsetOp {
    /// An untainted value is pushed
    ErasePush,
    /// `pusha`
    Pusha,
    /// `popa`
    Popa,
    /// `leave`
    Leave,
    /// `enter`
    Enter,
}

/// Taint primitives of the string instructions, `esi` / `edi` operands
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StringOp {
    CopyStrToStr,
    CopyAxToStr,
    CopyStrToAx,
    ByteCopyStrToStr,
    ByteCopyAlToStr,
    ByteCopyStrToAl,
}

/// Taint primitives with implicit register operands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImplicitOp {
    /// `eax` / `ax`
    EraseAx,
    /// `edx` / `dx`
    EraseDx,
    /// `edx:eax` / `dx:ax`
    EraseAxDx,
    /// Upper half of `eax` / `ax`
    EraseAxHigh,
    /// `al`
    ByteEraseAl,
}

/// Taint primitives with an absolute memory operand (`moffs`)
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressOp {
    CopyAxToOffset,
    CopyOffsetToAx,
    ByteCopyAlToOffset,
    ByteCopyOffsetToAl,
}

/// Taint propagation, by operand shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaintOp {
    /// ModRM operand
    ModRm(ModRmOp),
    /// Register in the low bits of the opcode, stack operand
    RegisterOffset(RegisterOffsetOp),
    /// Register operand
    Register(RegisterOp),
    /// Stack operands
    Offset(OffsetOp),
    /// String operands
    String(StringOp),
    /// Implicit registers
    Implicit(ImplicitOp),
    /// Absolute address
    Address(AddressOp),
}

/// Control transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Control {
    /// `jmp rel`
    JumpRelative,
    /// `jcc rel`
    JumpConditional,
    /// `jmp ptr16:32`
    JumpFar,
    /// `jmp r/m`
    JumpIndirect,
    /// `call rel`
    CallRelative,
    /// `call ptr16:32`
    CallFar,
    /// `call r/m`
    CallIndirect,
    /// `ret`
    Return,
    /// `ret imm16`
    ReturnCleanup,
    /// `retf`
    ReturnFar,
    /// `loop`, `loope`, `loopne`, `jecxz`
    Loop,
    /// Translation cannot continue here
    Join,
}

/// Instructions that need the runtime or a taint fix-up around them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Emulate {
    /// `int imm8`, only `int 0x80` is emulated
    Interrupt,
    /// `syscall`
    Syscall,
    /// `sysenter`
    Sysenter,
    /// `cpuid`
    Cpuid,
    /// `cmpxchg r/m8, r8`
    CmpXchg8,
    /// `cmpxchg r/m32, r32`
    CmpXchg,
    /// `cmpxchg8b m64`
    CmpXchg8B,
}

/// How an instruction is translated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Copied verbatim
    Copy,
    /// Replaced by a trap
    Illegal,
    /// `cmovcc`, rewritten into a branch around a `mov`
    ConditionalMove,
    /// Copied after taint propagation code
    Taint(TaintOp),
    /// Rewritten to stay inside translated code
    Control(Control),
    /// Handed to the runtime, or wrapped in taint fix-ups
    Emulate(Emulate),
}

impl Action {
    /// Translation continues with the next instruction
    pub fn falls_through(&self) -> bool {
        match self {
            Action::Illegal => false,
            Action::Control(control) => matches!(
                control,
                Control::JumpConditional
                    | Control::Loop
                    | Control::CallRelative
                    | Control::CallIndirect
            ),
            _ => true,
        }
    }

    /// Name for diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Action::Copy => "copy",
            Action::Illegal => "illegal",
            Action::ConditionalMove => "cmov",
            Action::Taint(_) => "taint",
            Action::Control(Control::CallFar) => "far call",
            Action::Control(Control::ReturnFar) => "far return",
            Action::Control(_) => "control",
            Action::Emulate(_) => "emulate",
        }
    }
}

const C: Action = Action::Copy;
const U: Action = Action::Illegal;
/// Encodings that are prefixes or escapes, never reached through the tables
const BAD: Action = Action::Illegal;
/// Privileged, faults natively
const PRIV: Action = Action::Copy;
/// MMX / SSE, no taint tracking through vector registers
const MM: Action = Action::Illegal;
const CMOV: Action = Action::ConditionalMove;

const JR: Action = Action::Control(Control::JumpRelative);
const JC: Action = Action::Control(Control::JumpConditional);
const JF: Action = Action::Control(Control::JumpFar);
const JI: Action = Action::Control(Control::JumpIndirect);
const CR: Action = Action::Control(Control::CallRelative);
const CF: Action = Action::Control(Control::CallFar);
const CI: Action = Action::Control(Control::CallIndirect);
const R: Action = Action::Control(Control::Return);
const RC: Action = Action::Control(Control::ReturnCleanup);
const RF: Action = Action::Control(Control::ReturnFar);
const L: Action = Action::Control(Control::Loop);

const INT: Action = Action::Emulate(Emulate::Interrupt);
const SC: Action = Action::Emulate(Emulate::Syscall);
const SE: Action = Action::Emulate(Emulate::Sysenter);
const CPUI: Action = Action::Emulate(Emulate::Cpuid);
const CX8: Action = Action::Emulate(Emulate::CmpXchg8);
const CXG: Action = Action::Emulate(Emulate::CmpXchg);
const CX8B: Action = Action::Emulate(Emulate::CmpXchg8B);

const fn mrm(op: ModRmOp) -> Action {
    Action::Taint(TaintOp::ModRm(op))
}

const TOMR: Action = mrm(ModRmOp::OrMemToReg);
const TORM: Action = mrm(ModRmOp::OrRegToMem);
const TXMR: Action = mrm(ModRmOp::XorMemToReg);
const TXRM: Action = mrm(ModRmOp::XorRegToMem);
const TCMR: Action = mrm(ModRmOp::CopyMemToReg);
const TCRM: Action = mrm(ModRmOp::CopyRegToMem);
const TZMR: Action = mrm(ModRmOp::CopyZxMemToReg);
const TSRM: Action = mrm(ModRmOp::SwapRegMem);
const TCMP: Action = mrm(ModRmOp::CopyMemToPush);
const TCPM: Action = mrm(ModRmOp::CopyPopToMem);
const TEM: Action = mrm(ModRmOp::EraseMem);
const TLEA: Action = mrm(ModRmOp::Lea);
const BOMR: Action = mrm(ModRmOp::ByteOrMemToReg);
const BORM: Action = mrm(ModRmOp::ByteOrRegToMem);
const BXMR: Action = mrm(ModRmOp::ByteXorMemToReg);
const BXRM: Action = mrm(ModRmOp::ByteXorRegToMem);
const BCMR: Action = mrm(ModRmOp::ByteCopyMemToReg);
const BCRM: Action = mrm(ModRmOp::ByteCopyRegToMem);
const BZMR: Action = mrm(ModRmOp::ByteCopyZxMemToReg);
const BSRM: Action = mrm(ModRmOp::ByteSwapRegMem);
const BEM: Action = mrm(ModRmOp::ByteEraseMem);

const TCRP: Action = Action::Taint(TaintOp::RegisterOffset(RegisterOffsetOp::CopyRegToPush));
const TCPR: Action = Action::Taint(TaintOp::RegisterOffset(RegisterOffsetOp::CopyPopToReg));

const TSAR: Action = Action::Taint(TaintOp::Register(RegisterOp::SwapAxReg));
const TER: Action = Action::Taint(TaintOp::Register(RegisterOp::EraseReg));
const BER: Action = Action::Taint(TaintOp::Register(RegisterOp::ByteEraseReg));

const TEP: Action = Action::Taint(TaintOp::Offset(OffsetOp::ErasePush));
const TPUA: Action = Action::Taint(TaintOp::Offset(OffsetOp::Pusha));
const TPPA: Action = Action::Taint(TaintOp::Offset(OffsetOp::Popa));
const TLVE: Action = Action::Taint(TaintOp::Offset(OffsetOp::Leave));
const TENT: Action = Action::Taint(TaintOp::Offset(OffsetOp::Enter));

const TCSS: Action = Action::Taint(TaintOp::String(StringOp::CopyStrToStr));
const TCAS: Action = Action::Taint(TaintOp::String(StringOp::CopyAxToStr));
const TCSA: Action = Action::Taint(TaintOp::String(StringOp::CopyStrToAx));
const BCSS: Action = Action::Taint(TaintOp::String(StringOp::ByteCopyStrToStr));
const BCAS: Action = Action::Taint(TaintOp::String(StringOp::ByteCopyAlToStr));
const BCSA: Action = Action::Taint(TaintOp::String(StringOp::ByteCopyStrToAl));

const TEH: Action = Action::Taint(TaintOp::Implicit(ImplicitOp::EraseAxHigh));
const TED: Action = Action::Taint(TaintOp::Implicit(ImplicitOp::EraseDx));
const TEAD: Action = Action::Taint(TaintOp::Implicit(ImplicitOp::EraseAxDx));
const BEA: Action = Action::Taint(TaintOp::Implicit(ImplicitOp::ByteEraseAl));

const TCAO: Action = Action::Taint(TaintOp::Address(AddressOp::CopyAxToOffset));
const TCOA: Action = Action::Taint(TaintOp::Address(AddressOp::CopyOffsetToAx));
const BCAO: Action = Action::Taint(TaintOp::Address(AddressOp::ByteCopyAlToOffset));
const BCOA: Action = Action::Taint(TaintOp::Address(AddressOp::ByteCopyOffsetToAl));

#[rustfmt::skip]
static MAIN_TABLE: [Action; 256] = [
/*        ?0   ?1   ?2   ?3   ?4   ?5   ?6   ?7   ?8   ?9   ?A   ?B   ?C   ?D   ?E   ?F  */
/* 0? */ BORM,TORM,BOMR,TOMR,  C ,  C ,  C ,  C ,BORM,TORM,BOMR,TOMR,  C ,  C ,  C , BAD,
/* 1? */ BORM,TORM,BOMR,TOMR,  C ,  C ,  C ,  C ,BXRM,TXRM,BXMR,TXMR,  C ,  C ,  C ,  C ,
/* 2? */ BORM,TORM,BOMR,TOMR,  C ,  C , BAD,  C ,BXRM,TXRM,BXMR,TXMR,  C ,  C , BAD,  C ,
/* 3? */ BXRM,TXRM,BXMR,TXMR,  C ,  C , BAD,  C ,  C ,  C ,  C ,  C ,  C ,  C , BAD,  C ,
/* 4? */   C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,
/* 5? */ TCRP,TCRP,TCRP,TCRP,TCRP,TCRP,TCRP,TCRP,TCPR,TCPR,TCPR,TCPR,TCPR,TCPR,TCPR,TCPR,
/* 6? */ TPUA,TPPA,  C ,PRIV, BAD, BAD, BAD, BAD, TEP,TCMR, TEP,TCMR,PRIV,PRIV,PRIV,PRIV,
/* 7? */  JC , JC , JC , JC , JC , JC , JC , JC , JC , JC , JC , JC , JC , JC , JC , JC ,
/* 8? */   C ,  C ,  C ,  C ,  C ,  C ,BSRM,TSRM,BCRM,TCRM,BCMR,TCMR, TEM,TLEA,  C ,TCPM,
/* 9? */   C ,TSAR,TSAR,TSAR,TSAR,TSAR,TSAR,TSAR, TEH, TED,  CF,  C , TEP,  C ,  C , BEA,
/* A? */ BCOA,TCOA,BCAO,TCAO,BCSS,TCSS,  C ,  C ,  C ,  C ,BCAS,TCAS,BCSA,TCSA,  C ,  C ,
/* B? */  BER, BER, BER, BER, BER, BER, BER, BER, TER, TER, TER, TER, TER, TER, TER, TER,
/* C? */   C ,  C ,  RC,  R ,  C ,  C , BEM, TEM,TENT,TLVE,  RF,  RF,  C , INT,  C ,  C ,
/* D? */   C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,
/* E? */   L ,  L ,  L ,  L ,PRIV,PRIV,PRIV,PRIV, CR , JR , JF , JR ,PRIV,PRIV,PRIV,PRIV,
/* F? */  BAD,  U , BAD, BAD,PRIV,  C , BAD, BAD,  C ,  C ,  C ,  C ,  C ,  C ,  C , BAD,
];

#[rustfmt::skip]
static ESCAPE_TABLE: [Action; 256] = [
/*        ?0   ?1   ?2   ?3   ?4   ?5   ?6   ?7   ?8   ?9   ?A   ?B   ?C   ?D   ?E   ?F  */
/* 0? */ PRIV,PRIV,PRIV,PRIV,  C , SC ,  C ,  U ,  C ,  C ,  C ,  U ,  C ,  C ,  C ,  C ,
/* 1? */  MM , MM , MM , MM , MM , MM , MM , MM ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,
/* 2? */ PRIV,PRIV,PRIV,PRIV,  C ,  C ,  C ,  C , MM , MM , MM , MM , MM , MM , MM , MM ,
/* 3? */ PRIV,TEAD,TEAD,TEAD, SE ,  C ,  C ,PRIV, BAD,  C , BAD,  C ,  C ,  C ,  C ,  C ,
/* 4? */ CMOV,CMOV,CMOV,CMOV,CMOV,CMOV,CMOV,CMOV,CMOV,CMOV,CMOV,CMOV,CMOV,CMOV,CMOV,CMOV,
/* 5? */  MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM ,
/* 6? */  MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM ,
/* 7? */  MM , MM , MM , MM , MM , MM , MM ,  C ,PRIV,PRIV,  C ,  C , MM , MM , MM , MM ,
/* 8? */  JC , JC , JC , JC , JC , JC , JC , JC , JC , JC , JC , JC , JC , JC , JC , JC ,
/* 9? */  BEM, BEM, BEM, BEM, BEM, BEM, BEM, BEM, BEM, BEM, BEM, BEM, BEM, BEM, BEM, BEM,
/* A? */  TEP,  C ,CPUI,  C ,  C ,  C ,  C ,  C , TEP,  C ,PRIV,  C ,  C ,  C ,  C ,TOMR,
/* B? */  CX8, CXG,  C ,  C ,  C ,  C ,BZMR,TZMR,  C ,  C ,  C ,  C ,  C ,  C ,BZMR,TZMR,
/* C? */ BORM,TORM, MM ,TCRM, MM , MM , MM ,CX8B,  C ,  C ,  C ,  C ,  C ,  C ,  C ,  C ,
/* D? */  MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM ,
/* E? */  MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM ,
/* F? */  MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM , MM ,
];

/// `F6 /reg`: test, (undefined), not, neg, mul, imul, div, idiv
static GROUP_F6_TABLE: [Action; 8] = [C, U, C, C, C, C, C, C];
/// `F7 /reg`
static GROUP_F7_TABLE: [Action; 8] = [C, U, C, C, C, C, C, C];
/// `FF /reg`: inc, dec, call, call far, jmp, jmp far, push, (undefined)
static GROUP_FF_TABLE: [Action; 8] = [C, C, CI, U, JI, U, TCMP, U];

/// Looks up the action of an opcode
pub fn action_for(opcode: Opcode) -> Action {
    match opcode {
        Opcode::Main(byte) => MAIN_TABLE[byte as usize],
        Opcode::Escape(byte) => ESCAPE_TABLE[byte as usize],
        // no three byte opcode is supported
        Opcode::Escape38(_) | Opcode::Escape3A(_) => MM,
        Opcode::GroupF6(reg) => GROUP_F6_TABLE[(reg & 7) as usize],
        Opcode::GroupF7(reg) => GROUP_F7_TABLE[(reg & 7) as usize],
        Opcode::GroupFF(reg) => GROUP_FF_TABLE[(reg & 7) as usize],
        Opcode::Bad => U,
        Opcode::Cutoff => Action::Control(Control::Join),
    }
}

/// Classifies a decoded instruction
pub fn classify(instruction: &DecodedInstruction) -> Action {
    action_for(instruction.opcode)
}
