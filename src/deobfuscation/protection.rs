//! Protection removal steps and the ordered pipeline running them.
//!
//! Every protection is a [`Protection`]: a detector that inspects the module and a
//! remover that rewrites it. The [`Pipeline`] runs them in a fixed order that is
//! kept as data and checked against [`ProtectionId::must_run_before`], so a custom
//! pipeline cannot unflatten methods whose bodies are still encrypted.
//!
//! # Example
//!
//! ```rust
//! use unconfuse::deobfuscation::{DeobfuscationConfig, EventLog, Pipeline, ProtectionId};
//! use unconfuse::file::Image;
//! use unconfuse::metadata::Module;
//!
//! let mut module = Module::new(Image::default());
//! let events = EventLog::new();
//!
//! let mut pipeline = Pipeline::confuserex(&DeobfuscationConfig::default());
//! assert_eq!(
//!     pipeline.ids(),
//!     vec![ProtectionId::RefProxy, ProtectionId::AntiTamper, ProtectionId::ControlFlow]
//! );
//!
//! let report = pipeline.run(&mut module, &events)?;
//! assert_eq!(report.detected().count(), 0);
//! # Ok::<(), unconfuse::Error>(())
//! ```

use std::fmt;

use strum::{Display, EnumIter};

use crate::{
    deobfuscation::{
        obfuscators::confuserex::{AntiTamper, ControlFlow, RefProxy},
        DeobfuscationConfig, EventKind, EventLog,
    },
    metadata::Module,
    Error, Result,
};

/// Identifies a protection step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum ProtectionId {
    /// Indirect calls through generated delegates.
    #[strum(to_string = "RefProxy")]
    RefProxy,
    /// Encrypted method bodies.
    #[strum(to_string = "AntiTamper")]
    AntiTamper,
    /// Control-flow flattening.
    #[strum(to_string = "ControlFlow")]
    ControlFlow,
}

impl ProtectionId {
    /// Protections that must not run before this one.
    ///
    /// Method bodies are only readable once anti-tamper is gone, so it precedes
    /// control-flow removal.
    #[must_use]
    pub fn must_run_before(self) -> &'static [ProtectionId] {
        match self {
            ProtectionId::AntiTamper => &[ProtectionId::ControlFlow],
            ProtectionId::RefProxy | ProtectionId::ControlFlow => &[],
        }
    }
}

/// A removable protection.
pub trait Protection {
    /// Which protection this step removes.
    fn id(&self) -> ProtectionId;

    /// Human-readable name.
    fn name(&self) -> &'static str;

    /// Returns true if the protection is present.
    ///
    /// Implementations may remember what they found for [`Protection::remove`].
    fn detect(&mut self, module: &Module, events: &EventLog) -> bool;

    /// Removes the protection from `module`.
    ///
    /// # Errors
    ///
    /// Returns an error if the protection was detected but could not be removed.
    /// Failures limited to single methods are recorded in `events` instead.
    fn remove(&mut self, module: &mut Module, events: &EventLog) -> Result<()>;
}

/// Outcome of one pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepReport {
    /// The step
    pub id: ProtectionId,
    /// The detector fired
    pub detected: bool,
    /// The remover ran to completion
    pub removed: bool,
}

/// Outcome of a whole pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Steps in execution order
    pub steps: Vec<StepReport>,
}

impl PipelineReport {
    /// Protections that were found.
    pub fn detected(&self) -> impl Iterator<Item = ProtectionId> + '_ {
        self.steps.iter().filter(|s| s.detected).map(|s| s.id)
    }

    /// Returns true if `id` was found and removed.
    #[must_use]
    pub fn removed(&self, id: ProtectionId) -> bool {
        self.steps.iter().any(|s| s.id == id && s.removed)
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, step) in self.steps.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            let state = match (step.detected, step.removed) {
                (false, _) => "absent",
                (true, true) => "removed",
                (true, false) => "present",
            };
            write!(f, "{}: {}", step.id, state)?;
        }
        Ok(())
    }
}

/// An ordered list of protection steps.
#[derive(Default)]
pub struct Pipeline {
    steps: Vec<Box<dyn Protection>>,
}

impl Pipeline {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The ConfuserEx order: ref-proxy, anti-tamper, control flow.
    #[must_use]
    pub fn confuserex(config: &DeobfuscationConfig) -> Self {
        Pipeline::new()
            .with_step(Box::new(RefProxy::new(config)))
            .with_step(Box::new(AntiTamper::new(config)))
            .with_step(Box::new(ControlFlow::new(config)))
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: Box<dyn Protection>) -> Self {
        self.steps.push(step);
        self
    }

    /// Step ids in execution order.
    #[must_use]
    pub fn ids(&self) -> Vec<ProtectionId> {
        self.steps.iter().map(|step| step.id()).collect()
    }

    /// Checks that no step runs after a step it must precede.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtectionFailed`] naming the misplaced step.
    pub fn validate_order(&self) -> Result<()> {
        for (index, step) in self.steps.iter().enumerate() {
            let id = step.id();
            if let Some(earlier) = self.steps[..index]
                .iter()
                .find(|earlier| id.must_run_before().contains(&earlier.id()))
            {
                return Err(Error::ProtectionFailed {
                    protection: step.name(),
                    reason: format!("must run before {}", earlier.id()),
                });
            }
        }
        Ok(())
    }

    /// Runs every step: detect, then remove if detected.
    ///
    /// # Errors
    ///
    /// Returns the order violation from [`Self::validate_order`], or
    /// [`Error::ProtectionFailed`] for the first step whose removal fails. Steps after
    /// it do not run.
    pub fn run(&mut self, module: &mut Module, events: &EventLog) -> Result<PipelineReport> {
        self.validate_order()?;

        let mut report = PipelineReport::default();
        for step in &mut self.steps {
            let id = step.id();
            let name = step.name();

            let detected = step.detect(module, events);
            if !detected {
                log::debug!("{name} not detected");
                report.steps.push(StepReport {
                    id,
                    detected,
                    removed: false,
                });
                continue;
            }

            log::info!("{name} detected, removing");
            events
                .record(EventKind::ProtectionDetected)
                .message(name);

            if let Err(error) = step.remove(module, events) {
                log::error!("Failed to remove {name}: {error}");
                events.error(format!("{name}: {error}"));
                return Err(match error {
                    Error::ProtectionFailed { .. } => error,
                    other => Error::ProtectionFailed {
                        protection: name,
                        reason: other.to_string(),
                    },
                });
            }

            log::info!("{name} removed");
            events.record(EventKind::ProtectionRemoved).message(name);
            report.steps.push(StepReport {
                id,
                detected,
                removed: true,
            });
        }
        Ok(report)
    }
}
