//! Deobfuscation of ConfuserEx-protected .NET modules.
//!
//! The framework is built around emulation: state transitions of flattened methods,
//! key derivations of the anti-tamper runtime and the key encoders of the
//! reference-proxy handlers are all computed by running the obfuscated code itself
//! on the [`crate::emulation`] interpreter.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                       Protection Pipeline                     │
//! ├───────────────────────────────────────────────────────────────┤
//! │  Input: Module (types, methods, fields, PE image)             │
//! │           │                                                   │
//! │           ▼                                                   │
//! │  RefProxy      resolve delegate fields, restore direct calls  │
//! │           │                                                   │
//! │           ▼                                                   │
//! │  AntiTamper    derive the section key, decrypt method bodies  │
//! │           │                                                   │
//! │           ▼                                                   │
//! │  ControlFlow   collapse dispatchers, repair the stack         │
//! │           │                                                   │
//! │           ▼                                                   │
//! │  Output: rewritten Module + PipelineReport + EventLog         │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Components
//!
//! - [`Pipeline`] - Ordered [`Protection`] steps with an order check
//! - [`ControlFlowDeobfuscator`] - Fixpoint unflattening of a single method
//! - [`detection`] - Sensitive and strict flattening detectors
//! - [`antitamper`] - Key schedule, derivers and stream cipher of the anti-tamper runtime
//! - [`EventLog`] - Every transformation and diagnostic, for reporting
//! - [`DeobfuscationConfig`] - Thresholds and switches, with presets
//!
//! # Example
//!
//! ```rust
//! use unconfuse::assembly::InstructionAssembler;
//! use unconfuse::deobfuscation::{ControlFlowDeobfuscator, DeobfuscationConfig, EventLog};
//!
//! let mut asm = InstructionAssembler::new();
//! asm.ldc_i4(1)?.stloc_0()?.ldloc_0()?.pop()?.ret()?;
//!
//! let deobfuscator = ControlFlowDeobfuscator::new(&DeobfuscationConfig::default());
//! let events = EventLog::new();
//! let body = deobfuscator.deobfuscate(&asm.finish()?, &events)?;
//! assert!(body.last().is_some_and(|i| i.is_return()));
//! # Ok::<(), unconfuse::Error>(())
//! ```

mod config;
pub mod detection;
mod events;
mod obfuscators;
mod protection;
pub mod stackfix;
mod unflatten;

pub use config::{AntiTamperConfig, DeobfuscationConfig, DetectionConfig, UnflattenConfig};
pub use events::{Event, EventBuilder, EventKind, EventLog};
pub use obfuscators::confuserex::antitamper;
pub use obfuscators::confuserex::{
    AntiTamper, ControlFlow, ControlFlowReport, HandlerKeys, ProxyHandler, RefProxy,
    HANDLER_SIGNATURE,
};
pub use protection::{Pipeline, PipelineReport, Protection, ProtectionId, StepReport};
pub use unflatten::{
    is_dispatcher, strip_dead_stores, Carrier, ControlFlowDeobfuscator, Resolution,
    StateResolver, StateStore, Trace, UnflattenStats, UnresolvedReason,
};
