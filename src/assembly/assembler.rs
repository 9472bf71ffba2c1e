//! Fluent, label-resolving builder for instruction sequences.
//!
//! [`InstructionAssembler`] lays instructions out at consecutive offsets and resolves
//! symbolic branch labels when [`InstructionAssembler::finish`] is called. It is the way
//! tests, documentation and the rewriting passes build method bodies without hand
//! computing offsets.
//!
//! # Examples
//!
//! ```rust
//! use unconfuse::assembly::InstructionAssembler;
//!
//! let mut asm = InstructionAssembler::new();
//! asm.ldarg_0()?
//!     .brfalse_s("zero")?
//!     .ldc_i4(1)?
//!     .ret()?
//!     .label("zero")?
//!     .ldc_i4(0)?
//!     .ret()?;
//!
//! let instructions = asm.finish()?;
//! assert_eq!(instructions.len(), 6);
//! assert_eq!(instructions[1].branch_targets, vec![instructions[4].offset]);
//! # Ok::<(), unconfuse::Error>(())
//! ```

use std::collections::HashMap;

use crate::{
    assembly::{
        opcodes::{self, FE_PREFIX},
        Immediate, Instruction, Operand,
    },
    metadata::{token::Token, MemberRef},
    Result,
};

struct Pending {
    instruction: Instruction,
    labels: Vec<String>,
}

/// Builds a linear instruction sequence with symbolic branch targets.
#[derive(Default)]
pub struct InstructionAssembler {
    pending: Vec<Pending>,
    labels: HashMap<String, u64>,
    position: u64,
}

impl InstructionAssembler {
    /// Creates an empty assembler positioned at offset 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset the next emitted instruction will get.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Binds `name` to the current position.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the label is already defined.
    pub fn label(&mut self, name: &str) -> Result<&mut Self> {
        if self.labels.contains_key(name) {
            return Err(malformed_error!("Label '{}' defined twice", name));
        }
        self.labels.insert(name.to_string(), self.position);
        Ok(self)
    }

    /// Appends an already-built instruction, moving it to the current position.
    ///
    /// Branch targets of the instruction are kept as they are.
    ///
    /// # Errors
    ///
    /// Never fails; the `Result` keeps the fluent chain uniform.
    pub fn instruction(&mut self, instruction: Instruction) -> Result<&mut Self> {
        self.push(instruction, Vec::new());
        Ok(self)
    }

    /// Emits any opcode with an explicit operand.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the opcode is unassigned or the operand
    /// does not fit it.
    pub fn emit(&mut self, prefix: u8, opcode: u8, operand: Operand) -> Result<&mut Self> {
        let instruction = Instruction::new(prefix, opcode, operand)?;
        self.push(instruction, Vec::new());
        Ok(self)
    }

    fn push(&mut self, instruction: Instruction, labels: Vec<String>) {
        let instruction = instruction.at(self.position);
        self.position += instruction.size;
        self.pending.push(Pending {
            instruction,
            labels,
        });
    }

    fn simple(&mut self, opcode: u8) -> Result<&mut Self> {
        self.emit(0, opcode, Operand::None)
    }

    fn fe(&mut self, opcode: u8) -> Result<&mut Self> {
        self.emit(FE_PREFIX, opcode, Operand::None)
    }

    fn branch(&mut self, opcode: u8, label: &str) -> Result<&mut Self> {
        let instruction = Instruction::new(0, opcode, Operand::Target(0))?;
        self.push(instruction, vec![label.to_string()]);
        Ok(self)
    }

    /// Emits a `switch` whose cases jump to `labels` in order.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if a label stays unresolved at [`Self::finish`].
    pub fn switch(&mut self, labels: &[&str]) -> Result<&mut Self> {
        let instruction =
            Instruction::new(0, opcodes::SWITCH, Operand::Switch(vec![0; labels.len()]))?;
        self.push(
            instruction,
            labels.iter().map(|label| (*label).to_string()).collect(),
        );
        Ok(self)
    }

    /// Resolves all labels and returns the finished sequence.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if a branch refers to an undefined label.
    pub fn finish(self) -> Result<Vec<Instruction>> {
        let mut instructions = Vec::with_capacity(self.pending.len());
        for pending in self.pending {
            let mut instruction = pending.instruction;
            if !pending.labels.is_empty() {
                let mut targets = Vec::with_capacity(pending.labels.len());
                for label in &pending.labels {
                    match self.labels.get(label) {
                        Some(offset) => targets.push(*offset),
                        None => return Err(malformed_error!("Undefined label '{}'", label)),
                    }
                }
                instruction.set_targets(targets)?;
            }
            instructions.push(instruction);
        }
        Ok(instructions)
    }
}

macro_rules! simple_ops {
    ($($(#[$doc:meta])* $name:ident => $opcode:expr;)*) => {
        impl InstructionAssembler {
            $(
                $(#[$doc])*
                ///
                /// # Errors
                ///
                /// Never fails for this opcode.
                pub fn $name(&mut self) -> Result<&mut Self> {
                    self.simple($opcode)
                }
            )*
        }
    };
}

macro_rules! fe_ops {
    ($($(#[$doc:meta])* $name:ident => $opcode:expr;)*) => {
        impl InstructionAssembler {
            $(
                $(#[$doc])*
                ///
                /// # Errors
                ///
                /// Never fails for this opcode.
                pub fn $name(&mut self) -> Result<&mut Self> {
                    self.fe($opcode)
                }
            )*
        }
    };
}

macro_rules! branch_ops {
    ($($(#[$doc:meta])* $name:ident => $opcode:expr;)*) => {
        impl InstructionAssembler {
            $(
                $(#[$doc])*
                ///
                /// # Errors
                ///
                /// Returns [`crate::Error::Malformed`] if the label stays unresolved.
                pub fn $name(&mut self, label: &str) -> Result<&mut Self> {
                    self.branch($opcode, label)
                }
            )*
        }
    };
}

simple_ops! {
    /// `nop`
    nop => opcodes::NOP;
    /// `ldarg.0`
    ldarg_0 => opcodes::LDARG_0;
    /// `ldarg.1`
    ldarg_1 => opcodes::LDARG_1;
    /// `ldloc.0`
    ldloc_0 => opcodes::LDLOC_0;
    /// `ldloc.1`
    ldloc_1 => opcodes::LDLOC_1;
    /// `ldloc.2`
    ldloc_2 => opcodes::LDLOC_2;
    /// `ldloc.3`
    ldloc_3 => opcodes::LDLOC_3;
    /// `stloc.0`
    stloc_0 => opcodes::STLOC_0;
    /// `stloc.1`
    stloc_1 => opcodes::STLOC_1;
    /// `stloc.2`
    stloc_2 => opcodes::STLOC_2;
    /// `stloc.3`
    stloc_3 => opcodes::STLOC_3;
    /// `ldnull`
    ldnull => opcodes::LDNULL;
    /// `ldc.i4.0`
    ldc_i4_0 => opcodes::LDC_I4_0;
    /// `dup`
    dup => opcodes::DUP;
    /// `pop`
    pop => opcodes::POP;
    /// `ret`
    ret => opcodes::RET;
    /// `throw`
    throw => opcodes::THROW;
    /// `add`
    add => opcodes::ADD;
    /// `sub`
    sub => opcodes::SUB;
    /// `mul`
    mul => opcodes::MUL;
    /// `div`
    div => opcodes::DIV;
    /// `div.un`
    div_un => opcodes::DIV_UN;
    /// `rem`
    rem => opcodes::REM;
    /// `rem.un`
    rem_un => opcodes::REM_UN;
    /// `and`
    and => opcodes::AND;
    /// `or`
    or => opcodes::OR;
    /// `xor`
    xor => opcodes::XOR;
    /// `shl`
    shl => opcodes::SHL;
    /// `shr`
    shr => opcodes::SHR;
    /// `shr.un`
    shr_un => opcodes::SHR_UN;
    /// `neg`
    neg => opcodes::NEG;
    /// `not`
    not => opcodes::NOT;
    /// `conv.i1`
    conv_i1 => opcodes::CONV_I1;
    /// `conv.i2`
    conv_i2 => opcodes::CONV_I2;
    /// `conv.i4`
    conv_i4 => opcodes::CONV_I4;
    /// `conv.i8`
    conv_i8 => opcodes::CONV_I8;
    /// `conv.r4`
    conv_r4 => opcodes::CONV_R4;
    /// `conv.r8`
    conv_r8 => opcodes::CONV_R8;
    /// `conv.u1`
    conv_u1 => opcodes::CONV_U1;
    /// `conv.u2`
    conv_u2 => opcodes::CONV_U2;
    /// `conv.u4`
    conv_u4 => opcodes::CONV_U4;
    /// `conv.u8`
    conv_u8 => opcodes::CONV_U8;
    /// `conv.i`
    conv_i => opcodes::CONV_I;
    /// `conv.u`
    conv_u => opcodes::CONV_U;
    /// `conv.r.un`
    conv_r_un => opcodes::CONV_R_UN;
    /// `ldlen`
    ldlen => opcodes::LDLEN;
    /// `ldelem.u1`
    ldelem_u1 => opcodes::LDELEM_U1;
    /// `ldelem.i4`
    ldelem_i4 => opcodes::LDELEM_I4;
    /// `ldelem.u4`
    ldelem_u4 => opcodes::LDELEM_U4;
    /// `ldelem.ref`
    ldelem_ref => opcodes::LDELEM_REF;
    /// `stelem.i1`
    stelem_i1 => opcodes::STELEM_I1;
    /// `stelem.i4`
    stelem_i4 => opcodes::STELEM_I4;
    /// `ldind.u4`
    ldind_u4 => opcodes::LDIND_U4;
    /// `ldind.i4`
    ldind_i4 => opcodes::LDIND_I4;
    /// `stind.i4`
    stind_i4 => opcodes::STIND_I4;
}

fe_ops! {
    /// `ceq`
    ceq => opcodes::FE_CEQ;
    /// `cgt`
    cgt => opcodes::FE_CGT;
    /// `cgt.un`
    cgt_un => opcodes::FE_CGT_UN;
    /// `clt`
    clt => opcodes::FE_CLT;
    /// `clt.un`
    clt_un => opcodes::FE_CLT_UN;
}

branch_ops! {
    /// `br`
    br => opcodes::BR;
    /// `br.s`
    br_s => opcodes::BR_S;
    /// `brfalse`
    brfalse => opcodes::BRFALSE;
    /// `brfalse.s`
    brfalse_s => opcodes::BRFALSE_S;
    /// `brtrue`
    brtrue => opcodes::BRTRUE;
    /// `brtrue.s`
    brtrue_s => opcodes::BRTRUE_S;
    /// `beq`
    beq => opcodes::BEQ;
    /// `bne.un`
    bne_un => opcodes::BNE_UN;
    /// `bge`
    bge => opcodes::BGE;
    /// `bge.un`
    bge_un => opcodes::BGE_UN;
    /// `bgt`
    bgt => opcodes::BGT;
    /// `bgt.un`
    bgt_un => opcodes::BGT_UN;
    /// `ble`
    ble => opcodes::BLE;
    /// `ble.un`
    ble_un => opcodes::BLE_UN;
    /// `blt`
    blt => opcodes::BLT;
    /// `blt.s`
    blt_s => opcodes::BLT_S;
    /// `blt.un`
    blt_un => opcodes::BLT_UN;
    /// `leave`
    leave => opcodes::LEAVE;
}

impl InstructionAssembler {
    /// Shortest `ldc.i4` form for `value`.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn ldc_i4(&mut self, value: i32) -> Result<&mut Self> {
        self.instruction(Instruction::ldc_i4(value))
    }

    /// `ldc.i4 value` in the 5-byte form regardless of magnitude.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn ldc_i4_long(&mut self, value: i32) -> Result<&mut Self> {
        self.emit(0, opcodes::LDC_I4, Operand::Immediate(Immediate::Int32(value)))
    }

    /// `ldc.i8`
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn ldc_i8(&mut self, value: i64) -> Result<&mut Self> {
        self.emit(0, opcodes::LDC_I8, Operand::Immediate(Immediate::Int64(value)))
    }

    /// `ldc.r4`
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn ldc_r4(&mut self, value: f32) -> Result<&mut Self> {
        self.emit(0, opcodes::LDC_R4, Operand::Immediate(Immediate::Float32(value)))
    }

    /// `ldc.r8`
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn ldc_r8(&mut self, value: f64) -> Result<&mut Self> {
        self.emit(0, opcodes::LDC_R8, Operand::Immediate(Immediate::Float64(value)))
    }

    /// `ldstr`
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn ldstr(&mut self, value: &str) -> Result<&mut Self> {
        self.emit(0, opcodes::LDSTR, Operand::String(value.to_string()))
    }

    /// Shortest `ldloc` form for `index`.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn ldloc(&mut self, index: u16) -> Result<&mut Self> {
        match index {
            0..=3 => {
                #[allow(clippy::cast_possible_truncation)]
                let opcode = opcodes::LDLOC_0 + index as u8;
                self.simple(opcode)
            }
            4..=255 => self.emit(0, opcodes::LDLOC_S, Operand::Local(index)),
            _ => self.emit(FE_PREFIX, opcodes::FE_LDLOC, Operand::Local(index)),
        }
    }

    /// Shortest `stloc` form for `index`.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn stloc(&mut self, index: u16) -> Result<&mut Self> {
        match index {
            0..=3 => {
                #[allow(clippy::cast_possible_truncation)]
                let opcode = opcodes::STLOC_0 + index as u8;
                self.simple(opcode)
            }
            4..=255 => self.emit(0, opcodes::STLOC_S, Operand::Local(index)),
            _ => self.emit(FE_PREFIX, opcodes::FE_STLOC, Operand::Local(index)),
        }
    }

    /// Shortest `ldarg` form for `index`.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn ldarg(&mut self, index: u16) -> Result<&mut Self> {
        match index {
            0..=3 => {
                #[allow(clippy::cast_possible_truncation)]
                let opcode = opcodes::LDARG_0 + index as u8;
                self.simple(opcode)
            }
            4..=255 => self.emit(0, opcodes::LDARG_S, Operand::Argument(index)),
            _ => self.emit(FE_PREFIX, opcodes::FE_LDARG, Operand::Argument(index)),
        }
    }

    /// `starg.s` / `starg`
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn starg(&mut self, index: u16) -> Result<&mut Self> {
        if index <= 255 {
            self.emit(0, opcodes::STARG_S, Operand::Argument(index))
        } else {
            self.emit(FE_PREFIX, opcodes::FE_STARG, Operand::Argument(index))
        }
    }

    /// `call` to a resolved member.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn call(&mut self, member: MemberRef) -> Result<&mut Self> {
        self.emit(0, opcodes::CALL, Operand::Member(member))
    }

    /// `callvirt` to a resolved member.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn callvirt(&mut self, member: MemberRef) -> Result<&mut Self> {
        self.emit(0, opcodes::CALLVIRT, Operand::Member(member))
    }

    /// `newarr` of the given element type.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn newarr(&mut self, element_type: MemberRef) -> Result<&mut Self> {
        self.emit(0, opcodes::NEWARR, Operand::Member(element_type))
    }

    /// `ldelema` of the given element type.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn ldelema(&mut self, element_type: MemberRef) -> Result<&mut Self> {
        self.emit(0, opcodes::LDELEMA, Operand::Member(element_type))
    }

    /// `ldtoken`
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn ldtoken(&mut self, token: Token) -> Result<&mut Self> {
        self.emit(0, opcodes::LDTOKEN, Operand::Token(token))
    }

    /// `ldsfld`
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn ldsfld(&mut self, token: Token) -> Result<&mut Self> {
        self.emit(0, opcodes::LDSFLD, Operand::Token(token))
    }

    /// `stsfld`
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn stsfld(&mut self, token: Token) -> Result<&mut Self> {
        self.emit(0, opcodes::STSFLD, Operand::Token(token))
    }

    /// `ldfld`
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn ldfld(&mut self, token: Token) -> Result<&mut Self> {
        self.emit(0, opcodes::LDFLD, Operand::Token(token))
    }

    /// `stfld`
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn stfld(&mut self, token: Token) -> Result<&mut Self> {
        self.emit(0, opcodes::STFLD, Operand::Token(token))
    }
}
