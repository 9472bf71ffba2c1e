//! # unconfuse Prelude
//!
//! The most commonly used types of the crate, for glob imports.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all unconfuse operations
pub use crate::Error;

/// The result type used throughout unconfuse
pub use crate::Result;

// ================================================================================================
// Instructions
// ================================================================================================

/// Instruction model and assembler
pub use crate::assembly::{
    opcodes, FlowType, Immediate, Instruction, InstructionAssembler, Operand, StackBehavior,
};

/// Block graphs
pub use crate::analysis::{Block, BlockGraph, BlockId, Terminator};

// ================================================================================================
// Emulation
// ================================================================================================

/// Interpreter entry points and values
pub use crate::emulation::{
    emulate, EmValue, EmulationContext, EmulationError, EmulationLimits, Interpreter,
};

// ================================================================================================
// Module Model
// ================================================================================================

/// Metadata token type for referencing table entries
pub use crate::metadata::token::Token;

/// Types, methods, fields and member references
pub use crate::metadata::{
    ExceptionHandler, FieldDef, HandlerKind, MemberRef, MethodDef, MethodSig, Module, TypeDef, TypeId,
};

/// PE sections
pub use crate::file::{Image, SectionCharacteristics, SectionHeader};

// ================================================================================================
// Deobfuscation
// ================================================================================================

/// Configuration presets
pub use crate::deobfuscation::{
    AntiTamperConfig, DeobfuscationConfig, DetectionConfig, UnflattenConfig,
};

/// Event logging
pub use crate::deobfuscation::{Event, EventKind, EventLog};

/// Protection pipeline
pub use crate::deobfuscation::{
    AntiTamper, ControlFlow, ControlFlowDeobfuscator, Pipeline, PipelineReport, Protection,
    ProtectionId, RefProxy,
};
