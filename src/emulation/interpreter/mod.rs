//! Core CIL instruction interpreter.
//!
//! The [`Interpreter`] executes one instruction at a time against an
//! [`EmulationContext`]. [`Interpreter::execute`] reports control flow in byte
//! offsets ([`Flow`]), [`Interpreter::step`] maps branch targets to sequence indices
//! ([`StepResult`]) and [`Interpreter::run`] drives a whole instruction sequence from
//! index 0 until `ret` or the end of the sequence.
//!
//! Single-state concrete stepping only: a branch whose predicate is
//! [`EmValue::Unknown`] is reported as undetermined instead of being explored.

mod calls;
mod handlers;

use crate::{
    assembly::{opcodes, Immediate, Instruction, Operand},
    emulation::{
        BinaryOp, CompareOp, ConversionType, ElementType, EmValue, EmulationContext,
        EmulationError, UnaryOp,
    },
    Error, Result,
};

/// Execution limits of one emulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulationLimits {
    /// Maximum number of executed instructions, `None` for no limit
    pub max_instructions: Option<u64>,
}

impl Default for EmulationLimits {
    fn default() -> Self {
        EmulationLimits {
            max_instructions: Some(1_000_000),
        }
    }
}

impl EmulationLimits {
    /// Limits without an instruction bound.
    #[must_use]
    pub fn unlimited() -> Self {
        EmulationLimits {
            max_instructions: None,
        }
    }

    /// Sets the instruction bound.
    #[must_use]
    pub fn with_max_instructions(mut self, limit: u64) -> Self {
        self.max_instructions = Some(limit);
        self
    }
}

/// Control-flow outcome of one instruction, in byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Continue with the next instruction in layout order.
    Next,
    /// Continue at the instruction starting at this offset.
    Branch(u64),
    /// The method returned.
    Return,
    /// The branch predicate is unknown.
    Undetermined,
}

/// Outcome of [`Interpreter::step`], in sequence indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// Continue with the next index.
    Continue,
    /// Continue at this sequence index.
    Jump(usize),
    /// The method returned; there is no next index.
    Return,
    /// The branch predicate is unknown.
    Undetermined,
}

/// Single-state CIL interpreter.
///
/// # Examples
///
/// ```rust
/// use unconfuse::assembly::InstructionAssembler;
/// use unconfuse::emulation::{EmValue, EmulationContext, EmulationLimits, Interpreter};
///
/// let mut asm = InstructionAssembler::new();
/// asm.ldc_i4(6)?.ldc_i4(7)?.mul()?.stloc_0()?.ret()?;
///
/// let ctx = Interpreter::new(EmulationLimits::default()).run(&asm.finish()?, EmulationContext::new())?;
/// assert_eq!(ctx.local(0), EmValue::I32(42));
/// # Ok::<(), unconfuse::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct Interpreter {
    limits: EmulationLimits,
}

fn unsupported(instruction: &Instruction) -> Error {
    Error::UnsupportedInstruction {
        mnemonic: instruction.mnemonic,
        offset: instruction.offset,
    }
}

fn invalid_operand(instruction: &Instruction, expected: &'static str) -> Error {
    EmulationError::InvalidOperand {
        instruction: instruction.mnemonic,
        expected,
    }
    .into()
}

fn branch_target(instruction: &Instruction) -> Result<u64> {
    match instruction.operand {
        Operand::Target(target) => Ok(target),
        _ => Err(invalid_operand(instruction, "branch target")),
    }
}

fn compare_op(opcode: u8) -> Option<CompareOp> {
    match opcode {
        opcodes::BEQ | opcodes::BEQ_S => Some(CompareOp::Eq),
        opcodes::BGE | opcodes::BGE_S => Some(CompareOp::Ge),
        opcodes::BGT | opcodes::BGT_S => Some(CompareOp::Gt),
        opcodes::BLE | opcodes::BLE_S => Some(CompareOp::Le),
        opcodes::BLT | opcodes::BLT_S => Some(CompareOp::Lt),
        opcodes::BNE_UN | opcodes::BNE_UN_S => Some(CompareOp::Ne),
        opcodes::BGE_UN | opcodes::BGE_UN_S => Some(CompareOp::GeUn),
        opcodes::BGT_UN | opcodes::BGT_UN_S => Some(CompareOp::GtUn),
        opcodes::BLE_UN | opcodes::BLE_UN_S => Some(CompareOp::LeUn),
        opcodes::BLT_UN | opcodes::BLT_UN_S => Some(CompareOp::LtUn),
        _ => None,
    }
}

fn binary_op(opcode: u8) -> Option<BinaryOp> {
    match opcode {
        opcodes::ADD => Some(BinaryOp::Add),
        opcodes::SUB => Some(BinaryOp::Sub),
        opcodes::MUL => Some(BinaryOp::Mul),
        opcodes::DIV => Some(BinaryOp::Div),
        opcodes::DIV_UN => Some(BinaryOp::DivUn),
        opcodes::REM => Some(BinaryOp::Rem),
        opcodes::REM_UN => Some(BinaryOp::RemUn),
        opcodes::AND => Some(BinaryOp::And),
        opcodes::OR => Some(BinaryOp::Or),
        opcodes::XOR => Some(BinaryOp::Xor),
        opcodes::SHL => Some(BinaryOp::Shl),
        opcodes::SHR => Some(BinaryOp::Shr),
        opcodes::SHR_UN => Some(BinaryOp::ShrUn),
        _ => None,
    }
}

fn conversion(opcode: u8) -> Option<ConversionType> {
    match opcode {
        opcodes::CONV_I1 => Some(ConversionType::I1),
        opcodes::CONV_I2 => Some(ConversionType::I2),
        opcodes::CONV_I4 => Some(ConversionType::I4),
        opcodes::CONV_I8 => Some(ConversionType::I8),
        opcodes::CONV_R4 => Some(ConversionType::R4),
        opcodes::CONV_R8 => Some(ConversionType::R8),
        opcodes::CONV_U4 => Some(ConversionType::U4),
        opcodes::CONV_U8 => Some(ConversionType::U8),
        opcodes::CONV_R_UN => Some(ConversionType::RUn),
        opcodes::CONV_U2 => Some(ConversionType::U2),
        opcodes::CONV_U1 => Some(ConversionType::U1),
        opcodes::CONV_I => Some(ConversionType::I),
        opcodes::CONV_U => Some(ConversionType::U),
        _ => None,
    }
}

fn indirect_type(opcode: u8) -> Option<ElementType> {
    match opcode {
        opcodes::LDIND_I1 | opcodes::STIND_I1 => Some(ElementType::I1),
        opcodes::LDIND_U1 => Some(ElementType::U1),
        opcodes::LDIND_I2 | opcodes::STIND_I2 => Some(ElementType::I2),
        opcodes::LDIND_U2 => Some(ElementType::U2),
        opcodes::LDIND_I4 | opcodes::STIND_I4 => Some(ElementType::I4),
        opcodes::LDIND_U4 => Some(ElementType::U4),
        opcodes::LDIND_I8 | opcodes::STIND_I8 => Some(ElementType::I8),
        opcodes::LDIND_I | opcodes::STIND_I => Some(ElementType::I),
        opcodes::LDIND_R4 | opcodes::STIND_R4 => Some(ElementType::R4),
        opcodes::LDIND_R8 | opcodes::STIND_R8 => Some(ElementType::R8),
        opcodes::LDIND_REF | opcodes::STIND_REF => Some(ElementType::Ref),
        _ => None,
    }
}

fn element_access_type(opcode: u8) -> Option<ElementType> {
    match opcode {
        opcodes::LDELEM_I1 | opcodes::STELEM_I1 => Some(ElementType::I1),
        opcodes::LDELEM_U1 => Some(ElementType::U1),
        opcodes::LDELEM_I2 | opcodes::STELEM_I2 => Some(ElementType::I2),
        opcodes::LDELEM_U2 => Some(ElementType::U2),
        opcodes::LDELEM_I4 | opcodes::STELEM_I4 => Some(ElementType::I4),
        opcodes::LDELEM_U4 => Some(ElementType::U4),
        opcodes::LDELEM_I8 | opcodes::STELEM_I8 => Some(ElementType::I8),
        opcodes::LDELEM_I | opcodes::STELEM_I => Some(ElementType::I),
        opcodes::LDELEM_R4 | opcodes::STELEM_R4 => Some(ElementType::R4),
        opcodes::LDELEM_R8 | opcodes::STELEM_R8 => Some(ElementType::R8),
        opcodes::LDELEM_REF | opcodes::STELEM_REF => Some(ElementType::Ref),
        _ => None,
    }
}

impl Interpreter {
    /// Creates an interpreter with the given limits.
    #[must_use]
    pub fn new(limits: EmulationLimits) -> Self {
        Interpreter { limits }
    }

    /// Returns the execution limits.
    #[must_use]
    pub fn limits(&self) -> &EmulationLimits {
        &self.limits
    }

    /// Runs `instructions` from index 0 until `ret` or until execution falls off the
    /// end of the sequence.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedInstruction`] for opcodes the emulator does not implement
    /// - [`Error::StackUnderflow`] for a pop on an empty stack
    /// - [`Error::UnresolvedBranch`] for a branch on an unknown value
    /// - [`Error::Emulation`] for every other execution fault, including the
    ///   instruction limit
    pub fn run(
        &self,
        instructions: &[Instruction],
        mut context: EmulationContext,
    ) -> Result<EmulationContext> {
        context.index_instructions(instructions);

        let mut index = 0;
        let mut executed = 0u64;
        while let Some(instruction) = instructions.get(index) {
            if let Some(limit) = self.limits.max_instructions {
                if executed >= limit {
                    return Err(EmulationError::InstructionLimitExceeded { executed, limit }.into());
                }
            }
            executed += 1;

            match self.step(&mut context, instruction)? {
                StepResult::Continue => index += 1,
                StepResult::Jump(next) => index = next,
                StepResult::Return => break,
                StepResult::Undetermined => {
                    return Err(Error::UnresolvedBranch {
                        offset: instruction.offset,
                    })
                }
            }
        }

        Ok(context)
    }

    /// Executes one instruction and maps its branch target through the context's
    /// offset table.
    ///
    /// The offset table is filled by [`EmulationContext::index_instructions`], which
    /// [`Interpreter::run`] calls before the first step.
    ///
    /// # Errors
    ///
    /// Same as [`Interpreter::execute`], plus [`EmulationError::InvalidBranchTarget`]
    /// for a target that does not start an instruction of the indexed sequence.
    pub fn step(
        &self,
        context: &mut EmulationContext,
        instruction: &Instruction,
    ) -> Result<StepResult> {
        match self.execute(context, instruction)? {
            Flow::Next => Ok(StepResult::Continue),
            Flow::Return => Ok(StepResult::Return),
            Flow::Undetermined => Ok(StepResult::Undetermined),
            Flow::Branch(target) => context
                .index_of(target)
                .map(StepResult::Jump)
                .ok_or_else(|| EmulationError::InvalidBranchTarget { target }.into()),
        }
    }

    /// Executes one instruction.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedInstruction`] for opcodes the emulator does not implement
    /// - [`Error::StackUnderflow`] (with the instruction offset) for a pop on an empty stack
    /// - [`Error::Emulation`] for type errors, division by zero and array faults
    pub fn execute(&self, context: &mut EmulationContext, instruction: &Instruction) -> Result<Flow> {
        let result = if instruction.prefix == opcodes::FE_PREFIX {
            Self::execute_fe_prefixed(context, instruction)
        } else if instruction.prefix != 0 {
            Err(unsupported(instruction))
        } else {
            Self::execute_standard(context, instruction)
        };

        result.map_err(|error| match error {
            Error::Emulation(inner) if *inner == EmulationError::StackUnderflow => {
                Error::StackUnderflow {
                    offset: instruction.offset,
                }
            }
            other => other,
        })
    }

    fn execute_standard(context: &mut EmulationContext, instruction: &Instruction) -> Result<Flow> {
        let opcode = instruction.opcode;

        if let Some(op) = binary_op(opcode) {
            let right = context.pop()?;
            let left = context.pop()?;
            context.push(left.binary_op(&right, op)?);
            return Ok(Flow::Next);
        }
        if let Some(conversion) = conversion(opcode) {
            let value = context.pop()?;
            context.push(value.convert(conversion)?);
            return Ok(Flow::Next);
        }
        if let Some(op) = compare_op(opcode) {
            let right = context.pop()?;
            let left = context.pop()?;
            return Self::conditional(instruction, &left.compare(&right, op)?);
        }
        if instruction.is_ldc_i4() {
            let value = instruction
                .ldc_i4_value()
                .ok_or_else(|| invalid_operand(instruction, "int32"))?;
            context.push(EmValue::I32(value));
            return Ok(Flow::Next);
        }
        if instruction.is_ldarg() {
            let index = instruction
                .argument_index()
                .ok_or_else(|| invalid_operand(instruction, "argument"))?;
            context.push(context.arg(index));
            return Ok(Flow::Next);
        }
        if instruction.is_ldloc() {
            let index = instruction
                .local_index()
                .ok_or_else(|| invalid_operand(instruction, "local"))?;
            context.push(context.local(index));
            return Ok(Flow::Next);
        }
        if instruction.is_stloc() {
            let index = instruction
                .local_index()
                .ok_or_else(|| invalid_operand(instruction, "local"))?;
            let value = context.pop()?;
            context.set_local(index, value);
            return Ok(Flow::Next);
        }
        if let Some(access) = indirect_type(opcode) {
            return if (opcodes::LDIND_I1..=opcodes::LDIND_REF).contains(&opcode) {
                handlers::load_indirect(context, access)
            } else {
                handlers::store_indirect(context, access)
            };
        }
        if let Some(access) = element_access_type(opcode) {
            return if (opcodes::LDELEM_I1..=opcodes::LDELEM_REF).contains(&opcode) {
                handlers::load_element(context, access)
            } else {
                handlers::store_element(context, access)
            };
        }

        match opcode {
            opcodes::NOP => {}
            opcodes::STARG_S => {
                let index = instruction
                    .argument_index()
                    .ok_or_else(|| invalid_operand(instruction, "argument"))?;
                let value = context.pop()?;
                context.set_arg(index, value);
            }
            opcodes::LDNULL => context.push(EmValue::Null),
            opcodes::LDC_I8 => match instruction.operand {
                Operand::Immediate(Immediate::Int64(value)) => context.push(EmValue::I64(value)),
                _ => return Err(invalid_operand(instruction, "int64")),
            },
            opcodes::LDC_R4 => match instruction.operand {
                Operand::Immediate(Immediate::Float32(value)) => context.push(EmValue::F32(value)),
                _ => return Err(invalid_operand(instruction, "float32")),
            },
            opcodes::LDC_R8 => match instruction.operand {
                Operand::Immediate(Immediate::Float64(value)) => context.push(EmValue::F64(value)),
                _ => return Err(invalid_operand(instruction, "float64")),
            },
            opcodes::LDSTR => match &instruction.operand {
                Operand::String(value) => context.push(EmValue::from(value.as_str())),
                _ => return Err(invalid_operand(instruction, "string")),
            },
            opcodes::DUP => {
                let value = context.pop()?;
                context.push(value.clone());
                context.push(value);
            }
            opcodes::POP => {
                context.pop()?;
            }
            opcodes::NEG => {
                let value = context.pop()?;
                context.push(value.unary_op(UnaryOp::Neg)?);
            }
            opcodes::NOT => {
                let value = context.pop()?;
                context.push(value.unary_op(UnaryOp::Not)?);
            }
            opcodes::CALL | opcodes::CALLVIRT => calls::invoke(context, instruction)?,
            opcodes::RET => {
                context.set_return_value(context.peek().cloned());
                return Ok(Flow::Return);
            }
            opcodes::BR | opcodes::BR_S => return Ok(Flow::Branch(branch_target(instruction)?)),
            opcodes::LEAVE | opcodes::LEAVE_S => {
                context.clear_stack();
                return Ok(Flow::Branch(branch_target(instruction)?));
            }
            opcodes::BRTRUE | opcodes::BRTRUE_S => {
                let value = context.pop()?;
                return Self::conditional(instruction, &value);
            }
            opcodes::BRFALSE | opcodes::BRFALSE_S => {
                let value = context.pop()?;
                let inverted = match value.truthy() {
                    Some(truth) => EmValue::from(!truth),
                    None => EmValue::Unknown,
                };
                return Self::conditional(instruction, &inverted);
            }
            opcodes::SWITCH => {
                let Operand::Switch(targets) = &instruction.operand else {
                    return Err(invalid_operand(instruction, "switch table"));
                };
                let value = context.pop()?;
                if value.is_unknown() {
                    return Ok(Flow::Undetermined);
                }
                let selected = value
                    .as_u32()
                    .and_then(|index| targets.get(index as usize).copied());
                return Ok(selected.map_or(Flow::Next, Flow::Branch));
            }
            opcodes::CASTCLASS | opcodes::BOX | opcodes::UNBOX_ANY => {
                let value = context.pop()?;
                context.push(value);
            }
            opcodes::LDFLD => {
                context.pop()?;
                context.push(EmValue::I32(0));
            }
            opcodes::LDSFLD => context.push(EmValue::I32(0)),
            opcodes::STFLD => {
                let value = context.pop()?;
                context.pop()?;
                context.set_last_stored(value);
            }
            opcodes::STSFLD => {
                let value = context.pop()?;
                context.set_last_stored(value);
            }
            opcodes::NEWARR => handlers::new_array(context, instruction)?,
            opcodes::LDLEN => handlers::array_length(context)?,
            opcodes::LDELEMA => handlers::element_address(context, instruction)?,
            opcodes::LDTOKEN => {
                let token = instruction
                    .token()
                    .ok_or_else(|| invalid_operand(instruction, "token"))?;
                context.push(EmValue::Token(token));
            }
            _ => return Err(unsupported(instruction)),
        }

        Ok(Flow::Next)
    }

    fn execute_fe_prefixed(
        context: &mut EmulationContext,
        instruction: &Instruction,
    ) -> Result<Flow> {
        let compare = match instruction.opcode {
            opcodes::FE_CEQ => Some(CompareOp::Eq),
            opcodes::FE_CGT => Some(CompareOp::Gt),
            opcodes::FE_CGT_UN => Some(CompareOp::GtUn),
            opcodes::FE_CLT => Some(CompareOp::Lt),
            opcodes::FE_CLT_UN => Some(CompareOp::LtUn),
            _ => None,
        };
        if let Some(op) = compare {
            let right = context.pop()?;
            let left = context.pop()?;
            context.push(left.compare(&right, op)?);
            return Ok(Flow::Next);
        }

        match instruction.opcode {
            opcodes::FE_LDARG => {
                let index = instruction
                    .argument_index()
                    .ok_or_else(|| invalid_operand(instruction, "argument"))?;
                context.push(context.arg(index));
            }
            opcodes::FE_STARG => {
                let index = instruction
                    .argument_index()
                    .ok_or_else(|| invalid_operand(instruction, "argument"))?;
                let value = context.pop()?;
                context.set_arg(index, value);
            }
            opcodes::FE_LDLOC => {
                let index = instruction
                    .local_index()
                    .ok_or_else(|| invalid_operand(instruction, "local"))?;
                context.push(context.local(index));
            }
            opcodes::FE_STLOC => {
                let index = instruction
                    .local_index()
                    .ok_or_else(|| invalid_operand(instruction, "local"))?;
                let value = context.pop()?;
                context.set_local(index, value);
            }
            _ => return Err(unsupported(instruction)),
        }
        Ok(Flow::Next)
    }

    fn conditional(instruction: &Instruction, predicate: &EmValue) -> Result<Flow> {
        let target = branch_target(instruction)?;
        Ok(match predicate.truthy() {
            Some(true) => Flow::Branch(target),
            Some(false) => Flow::Next,
            None => Flow::Undetermined,
        })
    }
}

/// Runs `instructions` with the default limits.
///
/// Execution starts at sequence index 0 and stops at `ret` or when it falls off the
/// end of the sequence. The final context is returned so callers can read locals,
/// bound arrays, the last stored field value and the return value.
///
/// # Errors
///
/// See [`Interpreter::run`].
///
/// # Examples
///
/// ```rust
/// use unconfuse::assembly::InstructionAssembler;
/// use unconfuse::emulation::{emulate, EmValue, EmulationContext};
///
/// let mut asm = InstructionAssembler::new();
/// asm.ldarg_0()?.ldc_i4(0x10)?.xor()?.ret()?;
///
/// let ctx = emulate(&asm.finish()?, EmulationContext::new().with_arg(0, EmValue::I32(0x11)))?;
/// assert_eq!(ctx.return_value(), Some(&EmValue::I32(1)));
/// # Ok::<(), unconfuse::Error>(())
/// ```
pub fn emulate(instructions: &[Instruction], context: EmulationContext) -> Result<EmulationContext> {
    Interpreter::default().run(instructions, context)
}
