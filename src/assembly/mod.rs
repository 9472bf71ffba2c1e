//! CIL instruction model.
//!
//! This module holds everything the emulator and the block graph need to know about
//! individual instructions:
//!
//! - [`opcodes`] - opcode byte constants and the static opcode table
//! - [`Instruction`], [`Operand`], [`Immediate`], [`FlowType`], [`StackBehavior`]
//! - [`InstructionAssembler`] - a label-resolving builder for instruction sequences
//!
//! Instructions are plain owned values. Passes that rewrite code build new vectors of
//! them instead of mutating encoded bytes; offsets are reassigned when a
//! [`crate::analysis::BlockGraph`] is linearised.

mod assembler;
mod instruction;
pub mod opcodes;

pub use assembler::InstructionAssembler;
pub use instruction::{FlowType, Immediate, Instruction, Operand, StackBehavior};
