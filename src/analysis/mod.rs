//! Block-level analysis of method bodies.
//!
//! # Key Components
//!
//! - [`BlockGraph`] - Arena of [`Block`]s addressed by [`BlockId`], editable in place
//! - [`Terminator`] - How control leaves a block
//! - [`stack`] - Static stack-height replay over runs and whole graphs
//!
//! # Examples
//!
//! ```rust
//! use unconfuse::analysis::{BlockGraph, Terminator};
//! use unconfuse::assembly::InstructionAssembler;
//!
//! let mut asm = InstructionAssembler::new();
//! asm.ldarg_0()?
//!     .brfalse_s("skip")?
//!     .ldc_i4(1)?
//!     .pop()?
//!     .label("skip")?
//!     .ret()?;
//!
//! let graph = BlockGraph::from_instructions(&asm.finish()?)?;
//! assert_eq!(graph.len(), 3);
//! assert_eq!(
//!     graph.block(graph.entry()).map(|b| b.terminator),
//!     Some(Terminator::ConditionalBranch)
//! );
//! # Ok::<(), unconfuse::Error>(())
//! ```

mod graph;
pub mod stack;

pub use graph::{Block, BlockGraph, BlockId, Terminator};
