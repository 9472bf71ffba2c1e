//! CIL opcode byte constants (ECMA-335) and the static opcode table.
//!
//! Single-byte opcodes are named after their mnemonic (e.g. [`CALL`] = `0x28`).
//! Two-byte opcodes that use the `0xFE` prefix have their second byte stored with an
//! `FE_` prefix (e.g. [`FE_CEQ`] = `0x01` for `ceq`, encoded `0xFE 0x01`).
//!
//! [`lookup`] maps an encoded opcode to its [`OpcodeInfo`]: mnemonic, control-flow
//! class, fixed stack effect and operand encoding. Call-like opcodes have a variable
//! stack effect that depends on the callee signature; the table reports zero for
//! them and [`crate::assembly::Instruction`] fills in the real values.
#![allow(missing_docs)]

use crate::assembly::FlowType;

// ── Single-byte opcodes ─────────────────────────────────────────────────────

pub const NOP: u8 = 0x00;

pub const LDARG_0: u8 = 0x02;
pub const LDARG_1: u8 = 0x03;
pub const LDARG_2: u8 = 0x04;
pub const LDARG_3: u8 = 0x05;
pub const LDLOC_0: u8 = 0x06;
pub const LDLOC_1: u8 = 0x07;
pub const LDLOC_2: u8 = 0x08;
pub const LDLOC_3: u8 = 0x09;
pub const STLOC_0: u8 = 0x0A;
pub const STLOC_1: u8 = 0x0B;
pub const STLOC_2: u8 = 0x0C;
pub const STLOC_3: u8 = 0x0D;
pub const LDARG_S: u8 = 0x0E;
pub const STARG_S: u8 = 0x10;
pub const LDLOC_S: u8 = 0x11;
pub const STLOC_S: u8 = 0x13;

pub const LDNULL: u8 = 0x14;
pub const LDC_I4_M1: u8 = 0x15;
pub const LDC_I4_0: u8 = 0x16;
pub const LDC_I4_8: u8 = 0x1E;
pub const LDC_I4_S: u8 = 0x1F;
pub const LDC_I4: u8 = 0x20;
pub const LDC_I8: u8 = 0x21;
pub const LDC_R4: u8 = 0x22;
pub const LDC_R8: u8 = 0x23;

pub const DUP: u8 = 0x25;
pub const POP: u8 = 0x26;
pub const CALL: u8 = 0x28;
pub const RET: u8 = 0x2A;

pub const BR_S: u8 = 0x2B;
pub const BRFALSE_S: u8 = 0x2C;
pub const BRTRUE_S: u8 = 0x2D;
pub const BEQ_S: u8 = 0x2E;
pub const BGE_S: u8 = 0x2F;
pub const BGT_S: u8 = 0x30;
pub const BLE_S: u8 = 0x31;
pub const BLT_S: u8 = 0x32;
pub const BNE_UN_S: u8 = 0x33;
pub const BGE_UN_S: u8 = 0x34;
pub const BGT_UN_S: u8 = 0x35;
pub const BLE_UN_S: u8 = 0x36;
pub const BLT_UN_S: u8 = 0x37;
pub const BR: u8 = 0x38;
pub const BRFALSE: u8 = 0x39;
pub const BRTRUE: u8 = 0x3A;
pub const BEQ: u8 = 0x3B;
pub const BGE: u8 = 0x3C;
pub const BGT: u8 = 0x3D;
pub const BLE: u8 = 0x3E;
pub const BLT: u8 = 0x3F;
pub const BNE_UN: u8 = 0x40;
pub const BGE_UN: u8 = 0x41;
pub const BGT_UN: u8 = 0x42;
pub const BLE_UN: u8 = 0x43;
pub const BLT_UN: u8 = 0x44;
pub const SWITCH: u8 = 0x45;

pub const LDIND_I1: u8 = 0x46;
pub const LDIND_U1: u8 = 0x47;
pub const LDIND_I2: u8 = 0x48;
pub const LDIND_U2: u8 = 0x49;
pub const LDIND_I4: u8 = 0x4A;
pub const LDIND_U4: u8 = 0x4B;
pub const LDIND_I8: u8 = 0x4C;
pub const LDIND_I: u8 = 0x4D;
pub const LDIND_R4: u8 = 0x4E;
pub const LDIND_R8: u8 = 0x4F;
pub const LDIND_REF: u8 = 0x50;
pub const STIND_REF: u8 = 0x51;
pub const STIND_I1: u8 = 0x52;
pub const STIND_I2: u8 = 0x53;
pub const STIND_I4: u8 = 0x54;
pub const STIND_I8: u8 = 0x55;
pub const STIND_R4: u8 = 0x56;
pub const STIND_R8: u8 = 0x57;

pub const ADD: u8 = 0x58;
pub const SUB: u8 = 0x59;
pub const MUL: u8 = 0x5A;
pub const DIV: u8 = 0x5B;
pub const DIV_UN: u8 = 0x5C;
pub const REM: u8 = 0x5D;
pub const REM_UN: u8 = 0x5E;
pub const AND: u8 = 0x5F;
pub const OR: u8 = 0x60;
pub const XOR: u8 = 0x61;
pub const SHL: u8 = 0x62;
pub const SHR: u8 = 0x63;
pub const SHR_UN: u8 = 0x64;
pub const NEG: u8 = 0x65;
pub const NOT: u8 = 0x66;

pub const CONV_I1: u8 = 0x67;
pub const CONV_I2: u8 = 0x68;
pub const CONV_I4: u8 = 0x69;
pub const CONV_I8: u8 = 0x6A;
pub const CONV_R4: u8 = 0x6B;
pub const CONV_R8: u8 = 0x6C;
pub const CONV_U4: u8 = 0x6D;
pub const CONV_U8: u8 = 0x6E;
pub const CALLVIRT: u8 = 0x6F;
pub const LDSTR: u8 = 0x72;
pub const NEWOBJ: u8 = 0x73;
pub const CASTCLASS: u8 = 0x74;
pub const CONV_R_UN: u8 = 0x76;
pub const THROW: u8 = 0x7A;
pub const LDFLD: u8 = 0x7B;
pub const STFLD: u8 = 0x7D;
pub const LDSFLD: u8 = 0x7E;
pub const STSFLD: u8 = 0x80;
pub const BOX: u8 = 0x8C;
pub const NEWARR: u8 = 0x8D;
pub const LDLEN: u8 = 0x8E;
pub const LDELEMA: u8 = 0x8F;
pub const LDELEM_I1: u8 = 0x90;
pub const LDELEM_U1: u8 = 0x91;
pub const LDELEM_I2: u8 = 0x92;
pub const LDELEM_U2: u8 = 0x93;
pub const LDELEM_I4: u8 = 0x94;
pub const LDELEM_U4: u8 = 0x95;
pub const LDELEM_I8: u8 = 0x96;
pub const LDELEM_I: u8 = 0x97;
pub const LDELEM_R4: u8 = 0x98;
pub const LDELEM_R8: u8 = 0x99;
pub const LDELEM_REF: u8 = 0x9A;
pub const STELEM_I: u8 = 0x9B;
pub const STELEM_I1: u8 = 0x9C;
pub const STELEM_I2: u8 = 0x9D;
pub const STELEM_I4: u8 = 0x9E;
pub const STELEM_I8: u8 = 0x9F;
pub const STELEM_R4: u8 = 0xA0;
pub const STELEM_R8: u8 = 0xA1;
pub const STELEM_REF: u8 = 0xA2;
pub const UNBOX_ANY: u8 = 0xA5;
pub const LDTOKEN: u8 = 0xD0;
pub const CONV_U2: u8 = 0xD1;
pub const CONV_U1: u8 = 0xD2;
pub const CONV_I: u8 = 0xD3;
pub const LEAVE: u8 = 0xDD;
pub const LEAVE_S: u8 = 0xDE;
pub const STIND_I: u8 = 0xDF;
pub const CONV_U: u8 = 0xE0;

// ── Two-byte opcodes (0xFE prefix) ─────────────────────────────────────────
//
// The first byte is always FE_PREFIX; the constants below are the second byte.

pub const FE_PREFIX: u8 = 0xFE;

pub const FE_CEQ: u8 = 0x01;
pub const FE_CGT: u8 = 0x02;
pub const FE_CGT_UN: u8 = 0x03;
pub const FE_CLT: u8 = 0x04;
pub const FE_CLT_UN: u8 = 0x05;
pub const FE_LDARG: u8 = 0x09;
pub const FE_STARG: u8 = 0x0B;
pub const FE_LDLOC: u8 = 0x0C;
pub const FE_STLOC: u8 = 0x0E;

/// Encoding of the inline operand that follows an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// No operand
    None,
    /// Signed 8-bit immediate (`ldc.i4.s`)
    Int8,
    /// Signed 32-bit immediate
    Int32,
    /// Signed 64-bit immediate
    Int64,
    /// 32-bit float immediate
    Float32,
    /// 64-bit float immediate
    Float64,
    /// 8-bit local/argument index or alignment byte
    ShortIndex,
    /// 16-bit local/argument index
    Index,
    /// 4-byte metadata token
    Token,
    /// 8-bit relative branch target
    ShortTarget,
    /// 32-bit relative branch target
    Target,
    /// Jump table: 4-byte count followed by one 4-byte target per case
    Switch,
}

impl OperandKind {
    /// Size in bytes of the encoded operand, `None` for the variable-length switch table.
    #[must_use]
    pub const fn size(&self) -> Option<u64> {
        match self {
            OperandKind::None => Some(0),
            OperandKind::Int8 | OperandKind::ShortIndex | OperandKind::ShortTarget => Some(1),
            OperandKind::Index => Some(2),
            OperandKind::Int32 | OperandKind::Float32 | OperandKind::Token | OperandKind::Target => {
                Some(4)
            }
            OperandKind::Int64 | OperandKind::Float64 => Some(8),
            OperandKind::Switch => None,
        }
    }
}

/// Static properties of one opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeInfo {
    /// Textual mnemonic
    pub mnemonic: &'static str,
    /// Control-flow class
    pub flow: FlowType,
    /// Values popped (zero for call-like opcodes)
    pub pops: u8,
    /// Values pushed (zero for call-like opcodes)
    pub pushes: u8,
    /// Inline operand encoding
    pub operand: OperandKind,
}

const fn op(
    mnemonic: &'static str,
    flow: FlowType,
    pops: u8,
    pushes: u8,
    operand: OperandKind,
) -> OpcodeInfo {
    OpcodeInfo {
        mnemonic,
        flow,
        pops,
        pushes,
        operand,
    }
}

const fn seq(mnemonic: &'static str, pops: u8, pushes: u8) -> OpcodeInfo {
    op(mnemonic, FlowType::Sequential, pops, pushes, OperandKind::None)
}

const fn seq_token(mnemonic: &'static str, pops: u8, pushes: u8) -> OpcodeInfo {
    op(mnemonic, FlowType::Sequential, pops, pushes, OperandKind::Token)
}

const fn cond(mnemonic: &'static str, pops: u8, operand: OperandKind) -> OpcodeInfo {
    op(mnemonic, FlowType::ConditionalBranch, pops, 0, operand)
}

/// Looks up a single-byte (`prefix == 0`) or `0xFE`-prefixed opcode.
///
/// Returns `None` for unassigned encodings.
#[must_use]
pub const fn lookup(prefix: u8, opcode: u8) -> Option<OpcodeInfo> {
    use FlowType::{Call, Return, Sequential, Throw};
    use OperandKind as K;

    if prefix == FE_PREFIX {
        return Some(match opcode {
            0x00 => seq("arglist", 0, 1),
            FE_CEQ => seq("ceq", 2, 1),
            FE_CGT => seq("cgt", 2, 1),
            FE_CGT_UN => seq("cgt.un", 2, 1),
            FE_CLT => seq("clt", 2, 1),
            FE_CLT_UN => seq("clt.un", 2, 1),
            0x06 => seq_token("ldftn", 0, 1),
            0x07 => seq_token("ldvirtftn", 1, 1),
            FE_LDARG => op("ldarg", Sequential, 0, 1, K::Index),
            0x0A => op("ldarga", Sequential, 0, 1, K::Index),
            FE_STARG => op("starg", Sequential, 1, 0, K::Index),
            FE_LDLOC => op("ldloc", Sequential, 0, 1, K::Index),
            0x0D => op("ldloca", Sequential, 0, 1, K::Index),
            FE_STLOC => op("stloc", Sequential, 1, 0, K::Index),
            0x0F => seq("localloc", 1, 1),
            0x11 => op("endfilter", Return, 1, 0, K::None),
            0x12 => op("unaligned.", Sequential, 0, 0, K::ShortIndex),
            0x13 => seq("volatile.", 0, 0),
            0x14 => seq("tail.", 0, 0),
            0x15 => seq_token("initobj", 1, 0),
            0x16 => seq_token("constrained.", 0, 0),
            0x17 => seq("cpblk", 3, 0),
            0x18 => seq("initblk", 3, 0),
            0x1A => op("rethrow", Throw, 0, 0, K::None),
            0x1C => seq_token("sizeof", 0, 1),
            0x1D => seq("refanytype", 1, 1),
            0x1E => seq("readonly.", 0, 0),
            _ => return None,
        });
    }
    if prefix != 0 {
        return None;
    }

    Some(match opcode {
        NOP => seq("nop", 0, 0),
        0x01 => seq("break", 0, 0),
        LDARG_0 => seq("ldarg.0", 0, 1),
        LDARG_1 => seq("ldarg.1", 0, 1),
        LDARG_2 => seq("ldarg.2", 0, 1),
        LDARG_3 => seq("ldarg.3", 0, 1),
        LDLOC_0 => seq("ldloc.0", 0, 1),
        LDLOC_1 => seq("ldloc.1", 0, 1),
        LDLOC_2 => seq("ldloc.2", 0, 1),
        LDLOC_3 => seq("ldloc.3", 0, 1),
        STLOC_0 => seq("stloc.0", 1, 0),
        STLOC_1 => seq("stloc.1", 1, 0),
        STLOC_2 => seq("stloc.2", 1, 0),
        STLOC_3 => seq("stloc.3", 1, 0),
        LDARG_S => op("ldarg.s", Sequential, 0, 1, K::ShortIndex),
        0x0F => op("ldarga.s", Sequential, 0, 1, K::ShortIndex),
        STARG_S => op("starg.s", Sequential, 1, 0, K::ShortIndex),
        LDLOC_S => op("ldloc.s", Sequential, 0, 1, K::ShortIndex),
        0x12 => op("ldloca.s", Sequential, 0, 1, K::ShortIndex),
        STLOC_S => op("stloc.s", Sequential, 1, 0, K::ShortIndex),
        LDNULL => seq("ldnull", 0, 1),
        LDC_I4_M1 => seq("ldc.i4.m1", 0, 1),
        0x16 => seq("ldc.i4.0", 0, 1),
        0x17 => seq("ldc.i4.1", 0, 1),
        0x18 => seq("ldc.i4.2", 0, 1),
        0x19 => seq("ldc.i4.3", 0, 1),
        0x1A => seq("ldc.i4.4", 0, 1),
        0x1B => seq("ldc.i4.5", 0, 1),
        0x1C => seq("ldc.i4.6", 0, 1),
        0x1D => seq("ldc.i4.7", 0, 1),
        LDC_I4_8 => seq("ldc.i4.8", 0, 1),
        LDC_I4_S => op("ldc.i4.s", Sequential, 0, 1, K::Int8),
        LDC_I4 => op("ldc.i4", Sequential, 0, 1, K::Int32),
        LDC_I8 => op("ldc.i8", Sequential, 0, 1, K::Int64),
        LDC_R4 => op("ldc.r4", Sequential, 0, 1, K::Float32),
        LDC_R8 => op("ldc.r8", Sequential, 0, 1, K::Float64),
        DUP => seq("dup", 1, 2),
        POP => seq("pop", 1, 0),
        0x27 => op("jmp", Call, 0, 0, K::Token),
        CALL => op("call", Call, 0, 0, K::Token),
        0x29 => op("calli", Call, 0, 0, K::Token),
        RET => op("ret", Return, 0, 0, K::None),
        BR_S => op("br.s", FlowType::UnconditionalBranch, 0, 0, K::ShortTarget),
        BRFALSE_S => cond("brfalse.s", 1, K::ShortTarget),
        BRTRUE_S => cond("brtrue.s", 1, K::ShortTarget),
        BEQ_S => cond("beq.s", 2, K::ShortTarget),
        BGE_S => cond("bge.s", 2, K::ShortTarget),
        BGT_S => cond("bgt.s", 2, K::ShortTarget),
        BLE_S => cond("ble.s", 2, K::ShortTarget),
        BLT_S => cond("blt.s", 2, K::ShortTarget),
        BNE_UN_S => cond("bne.un.s", 2, K::ShortTarget),
        BGE_UN_S => cond("bge.un.s", 2, K::ShortTarget),
        BGT_UN_S => cond("bgt.un.s", 2, K::ShortTarget),
        BLE_UN_S => cond("ble.un.s", 2, K::ShortTarget),
        BLT_UN_S => cond("blt.un.s", 2, K::ShortTarget),
        BR => op("br", FlowType::UnconditionalBranch, 0, 0, K::Target),
        BRFALSE => cond("brfalse", 1, K::Target),
        BRTRUE => cond("brtrue", 1, K::Target),
        BEQ => cond("beq", 2, K::Target),
        BGE => cond("bge", 2, K::Target),
        BGT => cond("bgt", 2, K::Target),
        BLE => cond("ble", 2, K::Target),
        BLT => cond("blt", 2, K::Target),
        BNE_UN => cond("bne.un", 2, K::Target),
        BGE_UN => cond("bge.un", 2, K::Target),
        BGT_UN => cond("bgt.un", 2, K::Target),
        BLE_UN => cond("ble.un", 2, K::Target),
        BLT_UN => cond("blt.un", 2, K::Target),
        SWITCH => op("switch", FlowType::Switch, 1, 0, K::Switch),
        LDIND_I1 => seq("ldind.i1", 1, 1),
        LDIND_U1 => seq("ldind.u1", 1, 1),
        LDIND_I2 => seq("ldind.i2", 1, 1),
        LDIND_U2 => seq("ldind.u2", 1, 1),
        LDIND_I4 => seq("ldind.i4", 1, 1),
        LDIND_U4 => seq("ldind.u4", 1, 1),
        LDIND_I8 => seq("ldind.i8", 1, 1),
        LDIND_I => seq("ldind.i", 1, 1),
        LDIND_R4 => seq("ldind.r4", 1, 1),
        LDIND_R8 => seq("ldind.r8", 1, 1),
        LDIND_REF => seq("ldind.ref", 1, 1),
        STIND_REF => seq("stind.ref", 2, 0),
        STIND_I1 => seq("stind.i1", 2, 0),
        STIND_I2 => seq("stind.i2", 2, 0),
        STIND_I4 => seq("stind.i4", 2, 0),
        STIND_I8 => seq("stind.i8", 2, 0),
        STIND_R4 => seq("stind.r4", 2, 0),
        STIND_R8 => seq("stind.r8", 2, 0),
        ADD => seq("add", 2, 1),
        SUB => seq("sub", 2, 1),
        MUL => seq("mul", 2, 1),
        DIV => seq("div", 2, 1),
        DIV_UN => seq("div.un", 2, 1),
        REM => seq("rem", 2, 1),
        REM_UN => seq("rem.un", 2, 1),
        AND => seq("and", 2, 1),
        OR => seq("or", 2, 1),
        XOR => seq("xor", 2, 1),
        SHL => seq("shl", 2, 1),
        SHR => seq("shr", 2, 1),
        SHR_UN => seq("shr.un", 2, 1),
        NEG => seq("neg", 1, 1),
        NOT => seq("not", 1, 1),
        CONV_I1 => seq("conv.i1", 1, 1),
        CONV_I2 => seq("conv.i2", 1, 1),
        CONV_I4 => seq("conv.i4", 1, 1),
        CONV_I8 => seq("conv.i8", 1, 1),
        CONV_R4 => seq("conv.r4", 1, 1),
        CONV_R8 => seq("conv.r8", 1, 1),
        CONV_U4 => seq("conv.u4", 1, 1),
        CONV_U8 => seq("conv.u8", 1, 1),
        CALLVIRT => op("callvirt", Call, 0, 0, K::Token),
        0x70 => seq_token("cpobj", 2, 0),
        0x71 => seq_token("ldobj", 1, 1),
        LDSTR => seq_token("ldstr", 0, 1),
        NEWOBJ => op("newobj", Call, 0, 1, K::Token),
        CASTCLASS => seq_token("castclass", 1, 1),
        0x75 => seq_token("isinst", 1, 1),
        CONV_R_UN => seq("conv.r.un", 1, 1),
        0x79 => seq_token("unbox", 1, 1),
        THROW => op("throw", Throw, 1, 0, K::None),
        LDFLD => seq_token("ldfld", 1, 1),
        0x7C => seq_token("ldflda", 1, 1),
        STFLD => seq_token("stfld", 2, 0),
        LDSFLD => seq_token("ldsfld", 0, 1),
        0x7F => seq_token("ldsflda", 0, 1),
        STSFLD => seq_token("stsfld", 1, 0),
        0x81 => seq_token("stobj", 2, 0),
        0x82 => seq("conv.ovf.i1.un", 1, 1),
        0x83 => seq("conv.ovf.i2.un", 1, 1),
        0x84 => seq("conv.ovf.i4.un", 1, 1),
        0x85 => seq("conv.ovf.i8.un", 1, 1),
        0x86 => seq("conv.ovf.u1.un", 1, 1),
        0x87 => seq("conv.ovf.u2.un", 1, 1),
        0x88 => seq("conv.ovf.u4.un", 1, 1),
        0x89 => seq("conv.ovf.u8.un", 1, 1),
        0x8A => seq("conv.ovf.i.un", 1, 1),
        0x8B => seq("conv.ovf.u.un", 1, 1),
        BOX => seq_token("box", 1, 1),
        NEWARR => seq_token("newarr", 1, 1),
        LDLEN => seq("ldlen", 1, 1),
        LDELEMA => seq_token("ldelema", 2, 1),
        LDELEM_I1 => seq("ldelem.i1", 2, 1),
        LDELEM_U1 => seq("ldelem.u1", 2, 1),
        LDELEM_I2 => seq("ldelem.i2", 2, 1),
        LDELEM_U2 => seq("ldelem.u2", 2, 1),
        LDELEM_I4 => seq("ldelem.i4", 2, 1),
        LDELEM_U4 => seq("ldelem.u4", 2, 1),
        LDELEM_I8 => seq("ldelem.i8", 2, 1),
        LDELEM_I => seq("ldelem.i", 2, 1),
        LDELEM_R4 => seq("ldelem.r4", 2, 1),
        LDELEM_R8 => seq("ldelem.r8", 2, 1),
        LDELEM_REF => seq("ldelem.ref", 2, 1),
        STELEM_I => seq("stelem.i", 3, 0),
        STELEM_I1 => seq("stelem.i1", 3, 0),
        STELEM_I2 => seq("stelem.i2", 3, 0),
        STELEM_I4 => seq("stelem.i4", 3, 0),
        STELEM_I8 => seq("stelem.i8", 3, 0),
        STELEM_R4 => seq("stelem.r4", 3, 0),
        STELEM_R8 => seq("stelem.r8", 3, 0),
        STELEM_REF => seq("stelem.ref", 3, 0),
        0xA3 => seq_token("ldelem", 2, 1),
        0xA4 => seq_token("stelem", 3, 0),
        UNBOX_ANY => seq_token("unbox.any", 1, 1),
        0xB3 => seq("conv.ovf.i1", 1, 1),
        0xB4 => seq("conv.ovf.u1", 1, 1),
        0xB5 => seq("conv.ovf.i2", 1, 1),
        0xB6 => seq("conv.ovf.u2", 1, 1),
        0xB7 => seq("conv.ovf.i4", 1, 1),
        0xB8 => seq("conv.ovf.u4", 1, 1),
        0xB9 => seq("conv.ovf.i8", 1, 1),
        0xBA => seq("conv.ovf.u8", 1, 1),
        0xC2 => seq_token("refanyval", 1, 1),
        0xC3 => seq("ckfinite", 1, 1),
        0xC6 => seq_token("mkrefany", 1, 1),
        LDTOKEN => seq_token("ldtoken", 0, 1),
        CONV_U2 => seq("conv.u2", 1, 1),
        CONV_U1 => seq("conv.u1", 1, 1),
        CONV_I => seq("conv.i", 1, 1),
        0xD4 => seq("conv.ovf.i", 1, 1),
        0xD5 => seq("conv.ovf.u", 1, 1),
        0xD6 => seq("add.ovf", 2, 1),
        0xD7 => seq("add.ovf.un", 2, 1),
        0xD8 => seq("mul.ovf", 2, 1),
        0xD9 => seq("mul.ovf.un", 2, 1),
        0xDA => seq("sub.ovf", 2, 1),
        0xDB => seq("sub.ovf.un", 2, 1),
        0xDC => op("endfinally", FlowType::EndFinally, 0, 0, K::None),
        LEAVE => op("leave", FlowType::Leave, 0, 0, K::Target),
        LEAVE_S => op("leave.s", FlowType::Leave, 0, 0, K::ShortTarget),
        STIND_I => seq("stind.i", 2, 0),
        CONV_U => seq("conv.u", 1, 1),
        _ => return None,
    })
}

/// Returns the long-form equivalent of a short-form branch opcode, or the opcode itself.
#[must_use]
pub const fn long_branch_form(opcode: u8) -> u8 {
    match opcode {
        BR_S..=BLT_UN_S => opcode - BR_S + BR,
        LEAVE_S => LEAVE,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_single_byte() {
        let info = lookup(0, ADD).unwrap();
        assert_eq!(info.mnemonic, "add");
        assert_eq!((info.pops, info.pushes), (2, 1));
        assert_eq!(info.flow, FlowType::Sequential);

        let info = lookup(0, BGE_UN_S).unwrap();
        assert_eq!(info.mnemonic, "bge.un.s");
        assert_eq!(info.flow, FlowType::ConditionalBranch);
        assert_eq!(info.operand, OperandKind::ShortTarget);
    }

    #[test]
    fn test_lookup_fe_prefixed() {
        assert_eq!(lookup(FE_PREFIX, FE_CLT_UN).unwrap().mnemonic, "clt.un");
        assert_eq!(lookup(FE_PREFIX, FE_STLOC).unwrap().operand, OperandKind::Index);
        assert!(lookup(FE_PREFIX, 0x08).is_none());
    }

    #[test]
    fn test_lookup_unassigned() {
        assert!(lookup(0, 0x24).is_none());
        assert!(lookup(0, 0xF0).is_none());
        assert!(lookup(0x12, ADD).is_none());
    }

    #[test]
    fn test_long_branch_form() {
        assert_eq!(long_branch_form(BR_S), BR);
        assert_eq!(long_branch_form(BRTRUE_S), BRTRUE);
        assert_eq!(long_branch_form(BLT_UN_S), BLT_UN);
        assert_eq!(long_branch_form(LEAVE_S), LEAVE);
        assert_eq!(long_branch_form(ADD), ADD);
    }
}
