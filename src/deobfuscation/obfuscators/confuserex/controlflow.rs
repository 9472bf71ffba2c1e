//! ConfuserEx control-flow flattening removal.
//!
//! Runs the [`ControlFlowDeobfuscator`] over every method the sensitive detector
//! flags. A method that cannot be restored keeps its original body and is reported;
//! it never fails the step.

use crate::{
    deobfuscation::{
        protection::{Protection, ProtectionId},
        ControlFlowDeobfuscator, DeobfuscationConfig, EventKind, EventLog,
    },
    metadata::{token::Token, Module},
    Error, Result,
};

const NAME: &str = "ControlFlow";

/// Per-method outcome counts of the last removal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlFlowReport {
    /// Methods rewritten
    pub solved: usize,
    /// Methods left as they were
    pub failed: usize,
}

/// The control-flow removal step.
#[derive(Debug, Clone)]
pub struct ControlFlow {
    deobfuscator: ControlFlowDeobfuscator,
    targets: Vec<Token>,
    report: ControlFlowReport,
}

impl ControlFlow {
    /// Creates the step.
    #[must_use]
    pub fn new(config: &DeobfuscationConfig) -> Self {
        ControlFlow {
            deobfuscator: ControlFlowDeobfuscator::new(config),
            targets: Vec::new(),
            report: ControlFlowReport::default(),
        }
    }

    /// Methods flagged by the last [`Protection::detect`].
    #[must_use]
    pub fn targets(&self) -> &[Token] {
        &self.targets
    }

    /// Counts of the last [`Protection::remove`].
    #[must_use]
    pub fn report(&self) -> ControlFlowReport {
        self.report
    }
}

impl Protection for ControlFlow {
    fn id(&self) -> ProtectionId {
        ProtectionId::ControlFlow
    }

    fn name(&self) -> &'static str {
        NAME
    }

    fn detect(&mut self, module: &Module, _events: &EventLog) -> bool {
        self.targets = module
            .methods()
            .iter()
            .filter(|method| {
                method
                    .body
                    .as_deref()
                    .is_some_and(|body| self.deobfuscator.needs_unflattening(body))
            })
            .map(|method| method.token)
            .collect();
        !self.targets.is_empty()
    }

    fn remove(&mut self, module: &mut Module, events: &EventLog) -> Result<()> {
        self.report = ControlFlowReport::default();

        for &token in &self.targets {
            let Some(method) = module.method(token) else {
                continue;
            };

            match self.deobfuscator.deobfuscate_method_with_stats(method, events) {
                Ok((body, stats)) => {
                    events
                        .record(EventKind::MethodDeobfuscated)
                        .method(token)
                        .message(format!(
                            "'{}': {} tails rewritten, {} blocks removed",
                            method.name, stats.collapsed, stats.blocks_removed
                        ));
                    if let Some(method) = module.method_mut(token) {
                        method.body = Some(body);
                    }
                    self.report.solved += 1;
                }
                Err(error) => {
                    log::warn!("Failed to unflatten '{}': {error}", method.name);
                    let event = events
                        .record(EventKind::MethodFailed)
                        .method(token)
                        .message(error.to_string());
                    if let Error::StillObfuscated { dump, .. } = error {
                        event.dump(dump);
                    }
                    self.report.failed += 1;
                }
            }
        }

        log::info!(
            "Control flow: {} methods solved, {} failed",
            self.report.solved,
            self.report.failed
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{opcodes, Instruction, InstructionAssembler},
        file::Image,
        metadata::{MemberRef, MethodDef, MethodSig},
    };

    const FLAT: Token = Token(0x0600_0001);
    const STUCK: Token = Token(0x0600_0002);
    const PLAIN: Token = Token(0x0600_0003);

    fn write_line() -> MemberRef {
        MemberRef::new(Token::new(0x0A00_0001), "System.Console", "WriteLine").with_params(1)
    }

    fn flattened() -> Vec<Instruction> {
        let mut asm = InstructionAssembler::new();
        asm.ldc_i4(4).unwrap().stloc_0().unwrap().label("dispatch").unwrap();
        asm.ldloc_0()
            .unwrap()
            .ldc_i4(2)
            .unwrap()
            .rem_un()
            .unwrap()
            .switch(&["c0", "c1"])
            .unwrap()
            .ret()
            .unwrap();
        asm.label("c0")
            .unwrap()
            .ldc_i4(1)
            .unwrap()
            .call(write_line())
            .unwrap()
            .ldc_i4(7)
            .unwrap()
            .stloc_0()
            .unwrap()
            .br("dispatch")
            .unwrap();
        asm.label("c1")
            .unwrap()
            .ldc_i4(2)
            .unwrap()
            .call(write_line())
            .unwrap()
            .ret()
            .unwrap();
        asm.finish().unwrap()
    }

    fn unresolvable() -> Vec<Instruction> {
        let mut asm = InstructionAssembler::new();
        asm.ldarg_0().unwrap().stloc_0().unwrap().label("dispatch").unwrap();
        asm.ldloc_0()
            .unwrap()
            .ldc_i4(2)
            .unwrap()
            .rem_un()
            .unwrap()
            .switch(&["a", "b"])
            .unwrap()
            .ret()
            .unwrap();
        asm.label("a").unwrap().ret().unwrap();
        asm.label("b")
            .unwrap()
            .ldarg_1()
            .unwrap()
            .stloc_0()
            .unwrap()
            .br("dispatch")
            .unwrap();
        asm.finish().unwrap()
    }

    fn module() -> Module {
        let mut module = Module::new(Image::default());
        let global = module.global_type();
        let sig = || MethodSig::new("System.Void", &[]);

        let mut asm = InstructionAssembler::new();
        asm.ldc_i4(5).unwrap().call(write_line()).unwrap().ret().unwrap();

        module.add_method(MethodDef::new(FLAT, "Flat", global, sig()).with_body(flattened()));
        module.add_method(MethodDef::new(STUCK, "Stuck", global, sig()).with_body(unresolvable()));
        module.add_method(MethodDef::new(PLAIN, "Plain", global, sig()).with_body(asm.finish().unwrap()));
        module
    }

    #[test]
    fn test_detects_flattened_methods_only() {
        let module = module();
        let mut step = ControlFlow::new(&DeobfuscationConfig::default());
        assert!(step.detect(&module, &EventLog::new()));
        assert_eq!(step.targets(), &[FLAT, STUCK]);
    }

    #[test]
    fn test_failure_is_per_method() {
        let mut module = module();
        let events = EventLog::new();
        let mut step = ControlFlow::new(&DeobfuscationConfig::default());
        step.detect(&module, &events);
        step.remove(&mut module, &events).unwrap();

        assert_eq!(step.report(), ControlFlowReport { solved: 1, failed: 1 });

        let flat = module.method(FLAT).unwrap().body.as_deref().unwrap();
        assert!(!flat.iter().any(|i| i.is(opcodes::SWITCH)));
        assert_eq!(module.method(STUCK).unwrap().body.as_deref(), Some(unresolvable().as_slice()));

        let failure = events.filter_method(STUCK).find(|e| e.kind == EventKind::MethodFailed).unwrap();
        assert_eq!(failure.dump.len(), unresolvable().len());
        assert_eq!(events.filter_kind(EventKind::MethodDeobfuscated).count(), 1);
    }
}
