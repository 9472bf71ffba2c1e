//! State hand-offs at block tails.
//!
//! A flattened case block hands control back to the dispatcher with the next state.
//! The state either goes through the state local or travels on the evaluation stack
//! into a dispatcher header that captures it:
//!
//! ```text
//! ldc.i4 0x2A           ; or a constant expression: ldc.i4 a; ldc.i4 b; xor
//! stloc  L              ; local hand-off
//! br     dispatcher     ; optional
//!
//! ldc.i4 0x2A           ; stack hand-off
//! br     header         ; header: ldc.i4 K; xor; dup; stloc L; ldc.i4 N; rem.un; switch
//! ```
//!
//! The expression may read the previous state (`ldloc L; ldc.i4 3; mul`). It folds when
//! the block stores a constant to `L` earlier on, or when the caller knows the value of
//! `L` on entry to the block.

use crate::{
    analysis::{Block, BlockGraph, BlockId, Terminator},
    assembly::{opcodes, FlowType, Instruction},
    deobfuscation::unflatten::dispatcher::captured_state,
    emulation::{EmValue, EmulationContext, EmulationLimits, Interpreter},
};

/// How a state value reaches the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Carrier {
    /// Stored to the state local
    Local,
    /// Left on the evaluation stack for a header that stores it
    Stack,
}

/// A state hand-off ending a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateStore {
    /// The state local
    pub local: u16,
    /// Whether the value goes through the local or the stack
    pub carrier: Carrier,
    /// Index of the first instruction of the stored expression
    pub expression_start: usize,
    /// Index of the `stloc`, or of the last instruction of a pushed expression
    pub store: usize,
    /// Where control goes after the hand-off
    pub continuation: BlockId,
}

impl StateStore {
    /// Locates the state hand-off at the tail of `block`, if any.
    ///
    /// The hand-off must either end a fall-through block or be followed by the block's
    /// only `br`. A `stloc` hands off through that local; a pushed value hands off on
    /// the stack only if the continuation is a header for which [`captured_state`]
    /// names the local. The value must come from a side-effect free expression of
    /// constants, arithmetic and the state local itself.
    #[must_use]
    pub fn find(graph: &BlockGraph, block: &Block) -> Option<Self> {
        let instructions = &block.instructions;
        let count = instructions.len();

        let (end, continuation) = match block.terminator {
            Terminator::None if count >= 1 => (count, block.fallthrough?),
            Terminator::Branch if count >= 2 && instructions[count - 1].is_unconditional_branch() => {
                (count - 1, *block.targets.first()?)
            }
            _ => return None,
        };

        let last = &instructions[end - 1];
        if last.is_stloc() {
            let local = last.local_index()?;
            return Some(StateStore {
                local,
                carrier: Carrier::Local,
                expression_start: expression_start(&instructions[..end - 1], local)?,
                store: end - 1,
                continuation,
            });
        }

        // `leave` empties the stack
        if instructions[count - 1].flow_type == FlowType::Leave {
            return None;
        }
        let local = captured_state(graph.block(continuation)?)?;
        Some(StateStore {
            local,
            carrier: Carrier::Stack,
            expression_start: expression_start(&instructions[..end], local)?,
            store: end - 1,
            continuation,
        })
    }

    /// Evaluates the handed-off value; `entry` is the state on entry to `block`.
    ///
    /// Returns `None` if the expression does not fold to a 32-bit constant.
    #[must_use]
    pub fn evaluate(&self, block: &Block, entry: Option<i32>, budget: u64) -> Option<i32> {
        self.dispatch_context(block, entry, budget).map(|(value, _)| value)
    }

    /// The handed-off value together with the emulation state the dispatcher starts
    /// from: the state local set, and for a stack hand-off the value pushed.
    #[must_use]
    pub fn dispatch_context(
        &self,
        block: &Block,
        entry: Option<i32>,
        budget: u64,
    ) -> Option<(i32, EmulationContext)> {
        let interpreter = Interpreter::new(EmulationLimits::default().with_max_instructions(budget));
        let prior = fold_local(
            &interpreter,
            block.instructions.get(..self.expression_start)?,
            self.local,
            entry,
        );

        let expression = block.instructions.get(self.expression_start..=self.store)?;
        let seeded = EmulationContext::new().with_local(self.local, known(prior));
        let context = interpreter.run(expression, seeded).ok()?;
        let value = match self.carrier {
            Carrier::Local => context.local(self.local).as_i32()?,
            Carrier::Stack => context.peek()?.as_i32()?,
        };
        Some((value, context))
    }
}

/// Value of `local` after `instructions`, given its value on entry.
///
/// Every `stloc` of the local is folded with the value known at that point. A store of
/// a non-constant expression, or taking the local's address, makes it unknown.
pub(crate) fn fold_local(
    interpreter: &Interpreter,
    instructions: &[Instruction],
    local: u16,
    entry: Option<i32>,
) -> Option<i32> {
    let mut value = entry;
    for (index, instruction) in instructions.iter().enumerate() {
        if instruction.local_index() != Some(local) || instruction.is_ldloc() {
            continue;
        }
        value = if instruction.is_stloc() {
            expression_start(&instructions[..index], local).and_then(|start| {
                let seeded = EmulationContext::new().with_local(local, known(value));
                interpreter
                    .run(&instructions[start..=index], seeded)
                    .ok()
                    .and_then(|context| context.local(local).as_i32())
            })
        } else {
            None
        };
    }
    value
}

/// Deletes every store to `local` once nothing outside those stores reads it.
///
/// Stores anywhere in a block count, not only hand-offs at block tails. A store of a
/// side-effect free expression is deleted with its expression; any other store
/// becomes a `pop`. Returns the number of deleted stores; zero if a read remains, for
/// example in a dispatcher that could not be collapsed.
pub fn strip_dead_stores(graph: &mut BlockGraph, local: u16) -> usize {
    // (block, expression start, store index) in layout order
    let mut stores: Vec<(BlockId, Option<usize>, usize)> = Vec::new();

    for block in graph.blocks() {
        let instructions = &block.instructions;
        let mut internal = vec![false; instructions.len()];
        for (index, instruction) in instructions.iter().enumerate() {
            if !(instruction.is_stloc() && instruction.local_index() == Some(local)) {
                continue;
            }
            let start = expression_start(&instructions[..index], local);
            internal[start.unwrap_or(index)..=index].fill(true);
            stores.push((block.id, start, index));
        }

        let read_outside = instructions
            .iter()
            .zip(&internal)
            .any(|(instruction, internal)| !internal && instruction.local_index() == Some(local));
        if read_outside {
            return 0;
        }
    }

    for &(id, start, index) in stores.iter().rev() {
        let Some(block) = graph.block_mut(id) else {
            continue;
        };
        let offset = block.instructions[index].offset;
        match start {
            Some(start) => {
                block.instructions.drain(start..=index);
            }
            None => block.instructions[index] = Instruction::pop().at(offset),
        }
        if block.instructions.is_empty() {
            block.instructions.push(Instruction::nop().at(offset));
        }
    }
    stores.len()
}

fn known(value: Option<i32>) -> EmValue {
    value.map_or(EmValue::Unknown, EmValue::I32)
}

/// Finds where the single value left by `prefix` starts.
fn expression_start(prefix: &[Instruction], local: u16) -> Option<usize> {
    let mut needed: i32 = 1;
    for (index, instruction) in prefix.iter().enumerate().rev() {
        let operand = is_constant_operation(instruction)
            || (instruction.is_ldloc() && instruction.local_index() == Some(local));
        if !operand {
            return None;
        }
        needed -= i32::from(instruction.stack_behavior.pushes);
        if needed < 0 {
            return None;
        }
        needed += i32::from(instruction.stack_behavior.pops);
        if needed == 0 {
            return Some(index);
        }
    }
    None
}

/// Constants and side-effect free integer arithmetic.
pub(crate) fn is_constant_operation(instruction: &Instruction) -> bool {
    if instruction.is_ldc_i4() || instruction.is(opcodes::LDC_I8) {
        return true;
    }
    matches!(
        (instruction.prefix, instruction.opcode),
        (
            0,
            opcodes::NOP
                | opcodes::ADD
                | opcodes::SUB
                | opcodes::MUL
                | opcodes::AND
                | opcodes::OR
                | opcodes::XOR
                | opcodes::SHL
                | opcodes::SHR
                | opcodes::SHR_UN
                | opcodes::REM_UN
                | opcodes::NEG
                | opcodes::NOT
                | opcodes::CONV_I1
                | opcodes::CONV_I2
                | opcodes::CONV_I4
                | opcodes::CONV_I8
                | opcodes::CONV_U1
                | opcodes::CONV_U2
                | opcodes::CONV_U4
                | opcodes::CONV_U8
                | opcodes::CONV_I
                | opcodes::CONV_U
        )
    )
}
