//! Bytecode emulation engine.
//!
//! The emulator executes short CIL sequences concretely: the constant expressions that
//! drive a flattened dispatcher, the key derivation loop of the anti-tamper decryptor
//! and the token encoding helpers of the reference proxy. It is single-state: no path
//! exploration, no exception handling, no calls into other method bodies.
//!
//! # Architecture
//!
//! - [`EmValue`] - runtime values, with arithmetic in [`value::ops`]
//! - [`EmulationContext`] - stack, arguments, locals, heap and offset table of one run
//! - [`Interpreter`] - instruction dispatch with [`EmulationLimits`]
//! - [`emulate`] - convenience entry point with default limits
//! - [`EmulationError`] - typed execution faults
//!
//! # Example
//!
//! ```rust
//! use unconfuse::assembly::InstructionAssembler;
//! use unconfuse::emulation::{emulate, EmValue, EmulationContext};
//!
//! let mut asm = InstructionAssembler::new();
//! asm.ldc_i4(0x5A)?
//!     .ldc_i4(0x0F)?
//!     .and()?
//!     .stloc_0()?
//!     .ret()?;
//!
//! let ctx = emulate(&asm.finish()?, EmulationContext::new())?;
//! assert_eq!(ctx.local(0), EmValue::I32(0x0A));
//! # Ok::<(), unconfuse::Error>(())
//! ```

mod context;
mod error;
mod heap;
mod interpreter;
pub mod value;

pub use context::EmulationContext;
pub use error::EmulationError;
pub use heap::{ArrayObject, ArrayRef, ElementType, Heap};
pub use interpreter::{emulate, EmulationLimits, Flow, Interpreter, StepResult};
pub use value::{
    ops::{BinaryOp, CompareOp, ConversionType, UnaryOp},
    EmValue,
};
