//! CIL instruction representation, operand types and control-flow metadata.
//!
//! The central type is [`Instruction`], an owned record of one decoded or synthesised
//! instruction. Branch operands always hold **absolute** byte offsets, both in
//! [`Operand::Target`] / [`Operand::Switch`] and in [`Instruction::branch_targets`], so
//! rewriting code never has to reason about instruction sizes. Fresh offsets and targets
//! are assigned when a block graph is linearised again.
//!
//! # Key Components
//!
//! - [`Instruction`] - One instruction with its operand, stack effect and targets
//! - [`Operand`] - Typed operand representation
//! - [`Immediate`] - Immediate constants embedded in the instruction stream
//! - [`FlowType`] - Control-flow classification
//! - [`StackBehavior`] - Evaluation stack effect
//!
//! # Examples
//!
//! ```rust
//! use unconfuse::assembly::{Instruction, Operand, Immediate, FlowType, opcodes};
//!
//! let ldc = Instruction::new(0, opcodes::LDC_I4_S, Operand::Immediate(Immediate::Int8(7)))?;
//! assert_eq!(ldc.mnemonic, "ldc.i4.s");
//! assert_eq!(ldc.size, 2);
//! assert_eq!(ldc.ldc_i4_value(), Some(7));
//!
//! let br = Instruction::br(0x20);
//! assert_eq!(br.flow_type, FlowType::UnconditionalBranch);
//! assert_eq!(br.branch_targets, vec![0x20]);
//! # Ok::<(), unconfuse::Error>(())
//! ```

use std::fmt;

use crate::{
    assembly::opcodes::{self, OpcodeInfo, OperandKind},
    metadata::{token::Token, MemberRef},
    Result,
};

/// Immediate constant carried by an instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    /// Signed 8-bit immediate (`ldc.i4.s`)
    Int8(i8),
    /// Unsigned 8-bit immediate (`unaligned.`)
    UInt8(u8),
    /// Signed 32-bit immediate
    Int32(i32),
    /// Signed 64-bit immediate
    Int64(i64),
    /// 32-bit floating point immediate
    Float32(f32),
    /// 64-bit floating point immediate
    Float64(f64),
}

impl Immediate {
    /// Returns the value as `i32` for the integer variants that fit.
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            Immediate::Int8(value) => Some(i32::from(value)),
            Immediate::UInt8(value) => Some(i32::from(value)),
            Immediate::Int32(value) => Some(value),
            Immediate::Int64(value) => i32::try_from(value).ok(),
            Immediate::Float32(_) | Immediate::Float64(_) => None,
        }
    }
}

impl fmt::Display for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Immediate::Int8(value) => write!(f, "{value}"),
            Immediate::UInt8(value) => write!(f, "{value}"),
            Immediate::Int32(value) => write!(f, "{value}"),
            Immediate::Int64(value) => write!(f, "{value}"),
            Immediate::Float32(value) => write!(f, "{value:?}"),
            Immediate::Float64(value) => write!(f, "{value:?}"),
        }
    }
}

/// Structured instruction operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand present
    None,
    /// Immediate value (constant embedded in instruction)
    Immediate(Immediate),
    /// Absolute branch target offset
    Target(u64),
    /// Absolute jump table targets of a `switch`
    Switch(Vec<u64>),
    /// Local variable index
    Local(u16),
    /// Method argument index
    Argument(u16),
    /// Metadata token reference
    Token(Token),
    /// User string literal (`ldstr`)
    String(String),
    /// Resolved external member (call targets, field references)
    Member(MemberRef),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Immediate(imm) => write!(f, "{imm}"),
            Operand::Target(target) => write!(f, "IL_{target:04X}"),
            Operand::Switch(targets) => {
                write!(f, "(")?;
                for (i, target) in targets.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "IL_{target:04X}")?;
                }
                write!(f, ")")
            }
            Operand::Local(index) => write!(f, "V_{index}"),
            Operand::Argument(index) => write!(f, "A_{index}"),
            Operand::Token(token) => write!(f, "{token}"),
            Operand::String(value) => write!(f, "{value:?}"),
            Operand::Member(member) => write!(f, "{}", member.full_name()),
        }
    }
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Normal execution continues to next instruction
    Sequential,
    /// Conditional branch to another location
    ConditionalBranch,
    /// Always branches to another location (unconditional jump)
    UnconditionalBranch,
    /// Call to another method
    Call,
    /// Returns from current method
    Return,
    /// Multi-way branch (switch statement)
    Switch,
    /// Exception throwing
    Throw,
    /// End of finally block
    EndFinally,
    /// Leave protected region (try/catch/finally)
    Leave,
}

/// Stack effect of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackBehavior {
    /// Number of items popped from stack
    pub pops: u8,
    /// Number of items pushed to stack
    pub pushes: u8,
    /// Net effect on stack depth (pushes - pops)
    pub net_effect: i8,
}

impl StackBehavior {
    /// Creates a stack behavior and derives its net effect.
    #[must_use]
    pub const fn new(pops: u8, pushes: u8) -> Self {
        StackBehavior {
            pops,
            pushes,
            #[allow(clippy::cast_possible_wrap)]
            net_effect: pushes as i8 - pops as i8,
        }
    }
}

/// One CIL instruction with everything the emulator and the block graph need.
#[derive(Clone, PartialEq)]
pub struct Instruction {
    /// Byte offset of the instruction inside its method body
    pub offset: u64,
    /// Encoded size in bytes
    pub size: u64,
    /// Opcode byte (second byte for `0xFE`-prefixed opcodes)
    pub opcode: u8,
    /// `0xFE` for two-byte opcodes, `0` otherwise
    pub prefix: u8,
    /// Human-readable instruction mnemonic (e.g., "add", "ldloc.s", "ret")
    pub mnemonic: &'static str,
    /// How this instruction affects control flow
    pub flow_type: FlowType,
    /// The operand data for this instruction
    pub operand: Operand,
    /// How this instruction affects the evaluation stack
    pub stack_behavior: StackBehavior,
    /// Branch targets as absolute offsets; the fallthrough is not included
    pub branch_targets: Vec<u64>,
}

const fn known(prefix: u8, opcode: u8) -> OpcodeInfo {
    match opcodes::lookup(prefix, opcode) {
        Some(info) => info,
        None => panic!("unassigned opcode in constant constructor"),
    }
}

impl Instruction {
    /// Builds an instruction from its encoding and operand, at offset 0.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the opcode is unassigned or the operand does
    /// not match the opcode's operand encoding.
    pub fn new(prefix: u8, opcode: u8, operand: Operand) -> Result<Self> {
        let Some(info) = opcodes::lookup(prefix, opcode) else {
            return Err(malformed_error!(
                "Unassigned opcode {:02X}:{:02X}",
                prefix,
                opcode
            ));
        };

        let compatible = matches!(
            (info.operand, &operand),
            (OperandKind::None, Operand::None)
                | (
                    OperandKind::Int8
                        | OperandKind::Int32
                        | OperandKind::Int64
                        | OperandKind::Float32
                        | OperandKind::Float64,
                    Operand::Immediate(_)
                )
                | (OperandKind::ShortIndex | OperandKind::Index, Operand::Local(_))
                | (OperandKind::ShortIndex | OperandKind::Index, Operand::Argument(_))
                | (OperandKind::ShortIndex, Operand::Immediate(Immediate::UInt8(_)))
                | (
                    OperandKind::Token,
                    Operand::Token(_) | Operand::String(_) | Operand::Member(_)
                )
                | (OperandKind::ShortTarget | OperandKind::Target, Operand::Target(_))
                | (OperandKind::Switch, Operand::Switch(_))
        );
        if !compatible {
            return Err(malformed_error!(
                "Operand {:?} does not fit opcode '{}'",
                operand,
                info.mnemonic
            ));
        }

        Ok(Self::from_info(prefix, opcode, info, operand))
    }

    /// Represents an opcode this crate has no table entry for.
    ///
    /// Such instructions take part in block partitioning like any other sequential
    /// instruction, but the emulator rejects them.
    #[must_use]
    pub fn raw(prefix: u8, opcode: u8, size: u64, operand: Operand) -> Self {
        Instruction {
            offset: 0,
            size,
            opcode,
            prefix,
            mnemonic: "unknown",
            flow_type: FlowType::Sequential,
            operand,
            stack_behavior: StackBehavior::default(),
            branch_targets: Vec::new(),
        }
    }

    fn from_info(prefix: u8, opcode: u8, info: OpcodeInfo, operand: Operand) -> Self {
        let prefix_size = u64::from(prefix != 0);
        let operand_size = match &operand {
            Operand::Switch(targets) => 4 + 4 * targets.len() as u64,
            _ => info.operand.size().unwrap_or(0),
        };

        let stack_behavior = match (&operand, info.flow) {
            (Operand::Member(member), FlowType::Call) => {
                let is_ctor = prefix == 0 && opcode == opcodes::NEWOBJ;
                let pops = member.param_count + u16::from(member.has_this && !is_ctor);
                let pushes = u8::from(member.returns_value || is_ctor);
                StackBehavior::new(u8::try_from(pops).unwrap_or(u8::MAX), pushes)
            }
            _ => StackBehavior::new(info.pops, info.pushes),
        };

        let branch_targets = match &operand {
            Operand::Target(target) if info.flow != FlowType::Sequential => vec![*target],
            Operand::Switch(targets) => targets.clone(),
            _ => Vec::new(),
        };

        Instruction {
            offset: 0,
            size: 1 + prefix_size + operand_size,
            opcode,
            prefix,
            mnemonic: info.mnemonic,
            flow_type: info.flow,
            operand,
            stack_behavior,
            branch_targets,
        }
    }

    /// Returns the instruction moved to `offset`.
    #[must_use]
    pub fn at(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Unconditional long-form `br` to an absolute offset.
    #[must_use]
    pub fn br(target: u64) -> Self {
        Self::from_info(
            0,
            opcodes::BR,
            const { known(0, opcodes::BR) },
            Operand::Target(target),
        )
    }

    /// `pop`
    #[must_use]
    pub fn pop() -> Self {
        Self::from_info(0, opcodes::POP, const { known(0, opcodes::POP) }, Operand::None)
    }

    /// `nop`
    #[must_use]
    pub fn nop() -> Self {
        Self::from_info(0, opcodes::NOP, const { known(0, opcodes::NOP) }, Operand::None)
    }

    /// Shortest `ldc.i4` form for `value`.
    #[must_use]
    pub fn ldc_i4(value: i32) -> Self {
        match value {
            -1 => Self::from_info(
                0,
                opcodes::LDC_I4_M1,
                const { known(0, opcodes::LDC_I4_M1) },
                Operand::None,
            ),
            0..=8 => {
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                let opcode = opcodes::LDC_I4_0 + value as u8;
                match opcodes::lookup(0, opcode) {
                    Some(info) => Self::from_info(0, opcode, info, Operand::None),
                    None => Self::ldc_i4_long(value),
                }
            }
            _ => match i8::try_from(value) {
                Ok(short) => Self::from_info(
                    0,
                    opcodes::LDC_I4_S,
                    const { known(0, opcodes::LDC_I4_S) },
                    Operand::Immediate(Immediate::Int8(short)),
                ),
                Err(_) => Self::ldc_i4_long(value),
            },
        }
    }

    /// Shortest `stloc` form for local `index`.
    #[must_use]
    pub fn stloc(index: u16) -> Self {
        if let Ok(short) = u8::try_from(index) {
            if short <= 3 {
                let opcode = opcodes::STLOC_0 + short;
                if let Some(info) = opcodes::lookup(0, opcode) {
                    return Self::from_info(0, opcode, info, Operand::None);
                }
            }
            return Self::from_info(
                0,
                opcodes::STLOC_S,
                const { known(0, opcodes::STLOC_S) },
                Operand::Local(index),
            );
        }
        Self::from_info(
            opcodes::FE_PREFIX,
            opcodes::FE_STLOC,
            const { known(opcodes::FE_PREFIX, opcodes::FE_STLOC) },
            Operand::Local(index),
        )
    }

    fn ldc_i4_long(value: i32) -> Self {
        Self::from_info(
            0,
            opcodes::LDC_I4,
            const { known(0, opcodes::LDC_I4) },
            Operand::Immediate(Immediate::Int32(value)),
        )
    }

    /// Returns true if the instruction is the single-byte opcode `opcode`.
    #[must_use]
    pub fn is(&self, opcode: u8) -> bool {
        self.prefix == 0 && self.opcode == opcode
    }

    /// Returns true if the instruction is the `0xFE`-prefixed opcode `opcode`.
    #[must_use]
    pub fn is_fe(&self, opcode: u8) -> bool {
        self.prefix == opcodes::FE_PREFIX && self.opcode == opcode
    }

    /// Check if this instruction is a branch instruction (conditional, unconditional or switch).
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(
            self.flow_type,
            FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::Switch
        )
    }

    /// Returns true for two-way conditional branches.
    #[must_use]
    pub fn is_conditional_branch(&self) -> bool {
        self.flow_type == FlowType::ConditionalBranch
    }

    /// Returns true for `br` / `br.s`.
    #[must_use]
    pub fn is_unconditional_branch(&self) -> bool {
        self.flow_type == FlowType::UnconditionalBranch
    }

    /// Check if this instruction ends a basic block.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.flow_type,
            FlowType::ConditionalBranch
                | FlowType::UnconditionalBranch
                | FlowType::Return
                | FlowType::Switch
                | FlowType::Throw
                | FlowType::Leave
                | FlowType::EndFinally
        )
    }

    /// Returns true for `call`, `callvirt`, `calli`, `newobj` and `jmp`.
    #[must_use]
    pub fn is_call(&self) -> bool {
        self.flow_type == FlowType::Call
    }

    /// Returns true for `ret`.
    #[must_use]
    pub fn is_return(&self) -> bool {
        self.flow_type == FlowType::Return
    }

    /// Returns true for `throw` and `rethrow`.
    #[must_use]
    pub fn is_throw(&self) -> bool {
        self.flow_type == FlowType::Throw
    }

    /// Returns true for every `ldc.i4` form.
    #[must_use]
    pub fn is_ldc_i4(&self) -> bool {
        self.prefix == 0 && (opcodes::LDC_I4_M1..=opcodes::LDC_I4).contains(&self.opcode)
    }

    /// Constant pushed by an `ldc.i4` form.
    #[must_use]
    pub fn ldc_i4_value(&self) -> Option<i32> {
        if !self.is_ldc_i4() {
            return None;
        }
        match self.opcode {
            opcodes::LDC_I4_M1 => Some(-1),
            opcodes::LDC_I4_0..=opcodes::LDC_I4_8 => Some(i32::from(self.opcode - opcodes::LDC_I4_0)),
            _ => match &self.operand {
                Operand::Immediate(imm) => imm.as_i32(),
                _ => None,
            },
        }
    }

    /// Returns true for every `ldloc` form (`ldloca` excluded).
    #[must_use]
    pub fn is_ldloc(&self) -> bool {
        (self.prefix == 0
            && matches!(
                self.opcode,
                opcodes::LDLOC_0..=opcodes::LDLOC_3 | opcodes::LDLOC_S
            ))
            || self.is_fe(opcodes::FE_LDLOC)
    }

    /// Returns true for every `stloc` form.
    #[must_use]
    pub fn is_stloc(&self) -> bool {
        (self.prefix == 0
            && matches!(
                self.opcode,
                opcodes::STLOC_0..=opcodes::STLOC_3 | opcodes::STLOC_S
            ))
            || self.is_fe(opcodes::FE_STLOC)
    }

    /// Returns true for every `ldarg` form (`ldarga` excluded).
    #[must_use]
    pub fn is_ldarg(&self) -> bool {
        (self.prefix == 0
            && matches!(
                self.opcode,
                opcodes::LDARG_0..=opcodes::LDARG_3 | opcodes::LDARG_S
            ))
            || self.is_fe(opcodes::FE_LDARG)
    }

    /// Returns true for every `starg` form.
    #[must_use]
    pub fn is_starg(&self) -> bool {
        self.is(opcodes::STARG_S) || self.is_fe(opcodes::FE_STARG)
    }

    /// Local index addressed by an `ldloc`/`stloc`/`ldloca` form.
    #[must_use]
    pub fn local_index(&self) -> Option<u16> {
        if self.prefix == 0 {
            match self.opcode {
                opcodes::LDLOC_0..=opcodes::LDLOC_3 => {
                    return Some(u16::from(self.opcode - opcodes::LDLOC_0))
                }
                opcodes::STLOC_0..=opcodes::STLOC_3 => {
                    return Some(u16::from(self.opcode - opcodes::STLOC_0))
                }
                _ => {}
            }
        }
        match self.operand {
            Operand::Local(index) => Some(index),
            _ => None,
        }
    }

    /// Argument index addressed by an `ldarg`/`starg`/`ldarga` form.
    #[must_use]
    pub fn argument_index(&self) -> Option<u16> {
        if self.prefix == 0 && (opcodes::LDARG_0..=opcodes::LDARG_3).contains(&self.opcode) {
            return Some(u16::from(self.opcode - opcodes::LDARG_0));
        }
        match self.operand {
            Operand::Argument(index) => Some(index),
            _ => None,
        }
    }

    /// Metadata token carried by the operand, including the token of a resolved member.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match &self.operand {
            Operand::Token(token) => Some(*token),
            Operand::Member(member) => Some(member.token),
            _ => None,
        }
    }

    /// Resolved member operand.
    #[must_use]
    pub fn member(&self) -> Option<&MemberRef> {
        match &self.operand {
            Operand::Member(member) => Some(member),
            _ => None,
        }
    }

    /// Replaces the branch targets, keeping operand and `branch_targets` in sync.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the instruction is not a branch or the
    /// number of targets does not match its shape.
    pub fn set_targets(&mut self, targets: Vec<u64>) -> Result<()> {
        match &mut self.operand {
            Operand::Target(target) if targets.len() == 1 => *target = targets[0],
            Operand::Switch(table) if table.len() == targets.len() => table.clone_from(&targets),
            _ => {
                return Err(malformed_error!(
                    "Cannot retarget '{}' at 0x{:04X} to {} targets",
                    self.mnemonic,
                    self.offset,
                    targets.len()
                ))
            }
        }
        self.branch_targets = targets;
        Ok(())
    }

    /// Converts a short-form branch into its 4-byte form, leaving others unchanged.
    #[must_use]
    pub fn into_long_form(self) -> Self {
        if self.prefix != 0 {
            return self;
        }
        let long = opcodes::long_branch_form(self.opcode);
        if long == self.opcode {
            return self;
        }
        match opcodes::lookup(0, long) {
            Some(info) => Self::from_info(0, long, info, self.operand).at(self.offset),
            None => self,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IL_{:04X}: {}", self.offset, self.mnemonic)?;
        if self.operand != Operand::None {
            write!(f, " {}", self.operand)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X} - ", self.offset)?;
        if self.prefix != 0 {
            write!(f, "{:02X}:", self.prefix)?;
        }
        write!(f, "{:02X} - {:<12}", self.opcode, self.mnemonic)?;
        if self.operand != Operand::None {
            write!(f, " {}", self.operand)?;
        }
        if self.flow_type != FlowType::Sequential {
            write!(f, " | {:?}", self.flow_type)?;
        }
        if self.stack_behavior.net_effect != 0 {
            write!(f, " | stack:{:+}", self.stack_behavior.net_effect)?;
        }
        write!(f, " | size:{}", self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::opcodes::*;

    #[test]
    fn test_instruction_sizes() {
        assert_eq!(Instruction::new(0, ADD, Operand::None).unwrap().size, 1);
        assert_eq!(Instruction::ldc_i4(100).size, 2);
        assert_eq!(Instruction::ldc_i4(1000).size, 5);
        assert_eq!(Instruction::br(0).size, 5);
        assert_eq!(
            Instruction::new(FE_PREFIX, FE_STLOC, Operand::Local(300))
                .unwrap()
                .size,
            4
        );
        assert_eq!(
            Instruction::new(0, SWITCH, Operand::Switch(vec![1, 2, 3]))
                .unwrap()
                .size,
            17
        );
    }

    #[test]
    fn test_instruction_rejects_mismatched_operand() {
        assert!(Instruction::new(0, BR, Operand::None).is_err());
        assert!(Instruction::new(0, ADD, Operand::Local(1)).is_err());
        assert!(Instruction::new(0, 0x24, Operand::None).is_err());
    }

    #[test]
    fn test_ldc_i4_forms() {
        for value in [-1, 0, 5, 8, 9, -128, 127, 128, i32::MIN, i32::MAX] {
            let ldc = Instruction::ldc_i4(value);
            assert!(ldc.is_ldc_i4());
            assert_eq!(ldc.ldc_i4_value(), Some(value), "value {value}");
        }
        assert_eq!(Instruction::ldc_i4(3).mnemonic, "ldc.i4.3");
        assert_eq!(Instruction::ldc_i4(-1).mnemonic, "ldc.i4.m1");
    }

    #[test]
    fn test_stloc_forms() {
        for (index, mnemonic, size) in [(0, "stloc.0", 1), (3, "stloc.3", 1), (4, "stloc.s", 2), (300, "stloc", 4)] {
            let stloc = Instruction::stloc(index);
            assert!(stloc.is_stloc());
            assert_eq!(stloc.local_index(), Some(index));
            assert_eq!(stloc.mnemonic, mnemonic);
            assert_eq!(stloc.size, size);
            assert_eq!(stloc.stack_behavior.pops, 1);
        }
    }

    #[test]
    fn test_local_and_argument_indices() {
        let ldloc2 = Instruction::new(0, LDLOC_2, Operand::None).unwrap();
        assert!(ldloc2.is_ldloc());
        assert_eq!(ldloc2.local_index(), Some(2));

        let stloc_s = Instruction::new(0, STLOC_S, Operand::Local(17)).unwrap();
        assert!(stloc_s.is_stloc());
        assert_eq!(stloc_s.local_index(), Some(17));

        let ldarg1 = Instruction::new(0, LDARG_1, Operand::None).unwrap();
        assert!(ldarg1.is_ldarg());
        assert_eq!(ldarg1.argument_index(), Some(1));
        assert_eq!(ldarg1.local_index(), None);
    }

    #[test]
    fn test_call_stack_behavior() {
        let member = MemberRef::new(Token::new(0x0A000001), "System.Math", "Abs")
            .with_params(1)
            .returning();
        let call = Instruction::new(0, CALL, Operand::Member(member.clone())).unwrap();
        assert_eq!(call.stack_behavior, StackBehavior::new(1, 1));

        let instance = member.instance();
        let callvirt = Instruction::new(0, CALLVIRT, Operand::Member(instance)).unwrap();
        assert_eq!(callvirt.stack_behavior.pops, 2);
    }

    #[test]
    fn test_set_targets_and_long_form() {
        let mut branch = Instruction::new(0, BRTRUE_S, Operand::Target(4)).unwrap();
        branch.set_targets(vec![0x40]).unwrap();
        assert_eq!(branch.operand, Operand::Target(0x40));
        assert_eq!(branch.branch_targets, vec![0x40]);

        let long = branch.into_long_form();
        assert_eq!(long.mnemonic, "brtrue");
        assert_eq!(long.size, 5);
        assert_eq!(long.branch_targets, vec![0x40]);

        let mut ret = Instruction::new(0, RET, Operand::None).unwrap();
        assert!(ret.set_targets(vec![1]).is_err());
    }

    #[test]
    fn test_display() {
        let ldc = Instruction::ldc_i4(1000).at(0x10);
        assert_eq!(ldc.to_string(), "IL_0010: ldc.i4 1000");
        let br = Instruction::br(0x2A);
        assert_eq!(br.to_string(), "IL_0000: br IL_002A");
    }
}
