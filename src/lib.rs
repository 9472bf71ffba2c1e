// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # unconfuse
//!
//! Removal of ConfuserEx protections from .NET modules, built on a small CIL
//! emulator. Instead of matching every variant of an obfuscated sequence, the
//! crate executes the sequences the obfuscator emits and reads back what they
//! compute: dispatcher states, anti-tamper keys and proxy call tokens.
//!
//! ## Features
//!
//! - **Emulation** - A single-state CIL interpreter with typed values, arrays and
//!   pointer-style indirect access
//! - **Control-flow unflattening** - `switch` and if-chain dispatchers are collapsed
//!   to a fixpoint, state stores are stripped and the stack is repaired
//! - **Anti-tamper** - Key schedule, normal and dynamic key derivation and the
//!   section stream cipher, with fallback between derivers
//! - **Reference proxies** - Delegate fields are resolved back to their targets and
//!   call sites restored
//! - **Events** - Every transformation lands in an [`deobfuscation::EventLog`]
//!
//! ## Quick Start
//!
//! ```rust
//! use unconfuse::prelude::*;
//!
//! let mut module = Module::new(Image::default());
//! let events = EventLog::new();
//!
//! let report = Pipeline::confuserex(&DeobfuscationConfig::default()).run(&mut module, &events)?;
//! println!("{report}");
//! # Ok::<(), unconfuse::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`assembly`] - Instruction model, opcodes and a fluent assembler
//! - [`analysis`] - Basic-block graphs and stack-height analysis
//! - [`emulation`] - The interpreter
//! - [`deobfuscation`] - Detectors, unflattening and the protection pipeline
//! - [`metadata`] - The module model the protections rewrite
//! - [`file`] - PE sections and their raw data
//!
//! Loading and saving assemblies are outside this crate; a [`metadata::Module`] is
//! populated by the caller.

#[macro_use]
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types.
///
/// # Example
///
/// ```rust
/// use unconfuse::prelude::*;
///
/// let mut asm = InstructionAssembler::new();
/// asm.ldc_i4(3)?.ldc_i4(4)?.mul()?.stloc_0()?.ret()?;
/// let ctx = emulate(&asm.finish()?, EmulationContext::new())?;
/// assert_eq!(ctx.local(0), EmValue::I32(12));
/// # Ok::<(), unconfuse::Error>(())
/// ```
pub mod prelude;

/// CIL instructions, opcodes and the instruction assembler.
///
/// Instructions carry their offset, decoded operand, flow type and stack behavior.
/// [`assembly::InstructionAssembler`] builds bodies with labels and fluent calls,
/// which is how rewritten and test bodies are produced.
pub mod assembly;

/// Basic-block graphs and stack analysis.
///
/// [`analysis::BlockGraph`] partitions a body at branch targets, supports block
/// edits and re-emits a linear body with fixed-up offsets and branch targets.
pub mod analysis;

/// Concrete CIL emulation.
pub mod emulation;

/// Protection detection and removal.
pub mod deobfuscation;

/// The module model: types, methods, fields and member references.
pub mod metadata;

/// PE sections and the raw image data.
pub mod file;

/// `unconfuse` Result type
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `unconfuse` Error type
///
/// The main error type for all operations in this crate.
pub use error::Error;
