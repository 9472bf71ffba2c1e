//! Control-flow unflattening.
//!
//! Flattening replaces structured control flow with a state machine: every case block
//! hands the next state to a dispatcher, which compares it (as an if-chain or a
//! `rem.un`/`switch`) and branches to the next case. The state goes through a local,
//! or on the stack into a header that stores it (`ldc.i4 K; xor; dup; stloc L`).
//!
//! # Algorithm
//!
//! 1. Drop unreachable blocks and re-partition the body
//! 2. For every block ending in a state hand-off ([`StateStore`]), fold the handed-off
//!    value and walk the dispatcher chain with it ([`StateResolver`]). An expression
//!    that updates the previous state is folded with the state known on entry to the
//!    block ([`entry_states`])
//! 3. If the walk ends at a real block other than the hand-off's continuation, rewrite
//!    the tail to store the resulting state and jump there directly
//! 4. Repeat until a pass changes nothing
//! 5. Delete the stores to state locals nobody reads anymore, drop the now dead
//!    dispatchers and repair the stack at jumps to the entry
//!    ([`crate::deobfuscation::stackfix`])
//! 6. Reject the result if two paths enter a block at different stack heights, and
//!    optionally if the strict detector still sees a dispatcher
//!
//! Exception handler regions are not modeled. Blocks reached only through a handler
//! count as unreachable; methods with handlers get a [`EventKind::Warning`].

mod dispatcher;
mod flow;
mod resolver;
mod statevar;

pub use dispatcher::{captured_state, is_dispatcher};
pub use flow::entry_states;
pub use resolver::{Resolution, StateResolver, Trace, UnresolvedReason};
pub use statevar::{strip_dead_stores, Carrier, StateStore};

use std::collections::{BTreeSet, HashMap};

use crate::{
    analysis::{stack::entry_heights, BlockGraph, BlockId},
    assembly::Instruction,
    deobfuscation::{
        detection::{is_obfuscated, is_still_obfuscated},
        stackfix, DeobfuscationConfig, DetectionConfig, EventBuilder, EventKind, EventLog,
        UnflattenConfig,
    },
    metadata::{token::Token, ExceptionHandler, MethodDef},
    Error, Result,
};

/// Counters of one unflattening run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnflattenStats {
    /// Fixpoint passes executed, including the final one that changed nothing
    pub passes: usize,
    /// Block tails rewritten to bypass a dispatcher chain
    pub collapsed: usize,
    /// State values whose dispatcher chain could not be followed
    pub unresolved: usize,
    /// State stores deleted once the state local became dead
    pub stores_removed: usize,
    /// Unreachable blocks dropped
    pub blocks_removed: usize,
    /// `pop`s inserted before jumps to the entry
    pub pops_inserted: usize,
}

/// Method identity attached to events and errors.
#[derive(Debug, Clone, Copy)]
struct Subject<'a> {
    name: &'a str,
    token: Option<Token>,
    handlers: &'a [ExceptionHandler],
}

impl<'a> Subject<'a> {
    fn anonymous() -> Self {
        Subject {
            name: "<anonymous>",
            token: None,
            handlers: &[],
        }
    }

    fn of(method: &'a MethodDef) -> Self {
        Subject {
            name: &method.name,
            token: Some(method.token),
            handlers: &method.exception_handlers,
        }
    }

    fn event<'e>(&self, events: &'e EventLog, kind: EventKind, location: u64) -> EventBuilder<'e> {
        match self.token {
            Some(token) => events.record(kind).at(token, location),
            None => events.record(kind),
        }
    }
}

/// A state hand-off whose dispatcher chain could not be followed.
struct Stuck {
    location: u64,
    value: i32,
    at: BlockId,
    reason: UnresolvedReason,
}

/// Removes control-flow flattening from method bodies.
///
/// # Examples
///
/// ```rust
/// use unconfuse::assembly::InstructionAssembler;
/// use unconfuse::deobfuscation::{ControlFlowDeobfuscator, DeobfuscationConfig, EventLog};
///
/// // state = 2; while (true) { if (state == 1) return; if (state == 2) state = 1; }
/// let mut asm = InstructionAssembler::new();
/// asm.ldc_i4(2)?.stloc_0()?
///     .label("dispatch")?
///     .ldloc_0()?.ldc_i4(1)?.beq("exit")?
///     .ldloc_0()?.ldc_i4(2)?.beq("case2")?
///     .br("dispatch")?
///     .label("case2")?
///     .ldarg_0()?.ldarg_1()?.starg(0)?.pop()?.ldc_i4(1)?.stloc_0()?.br("dispatch")?
///     .label("exit")?
///     .ldarg_0()?.ldarg_1()?.add()?.starg(1)?.ret()?;
///
/// let events = EventLog::new();
/// let deobfuscator = ControlFlowDeobfuscator::new(&DeobfuscationConfig::default());
/// let body = deobfuscator.deobfuscate(&asm.finish()?, &events)?;
///
/// assert!(body.iter().all(|i| i.local_index() != Some(0)));
/// assert_eq!(events.count_kind(unconfuse::deobfuscation::EventKind::DispatcherCollapsed), 2);
/// # Ok::<(), unconfuse::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct ControlFlowDeobfuscator {
    config: UnflattenConfig,
    detection: DetectionConfig,
}

impl ControlFlowDeobfuscator {
    /// Creates a deobfuscator from the pipeline configuration.
    #[must_use]
    pub fn new(config: &DeobfuscationConfig) -> Self {
        Self::with_configs(config.unflatten.clone(), config.detection.clone())
    }

    /// Creates a deobfuscator from its two settings groups.
    #[must_use]
    pub fn with_configs(config: UnflattenConfig, detection: DetectionConfig) -> Self {
        ControlFlowDeobfuscator { config, detection }
    }

    /// Returns true if the sensitive detector thinks `instructions` are flattened.
    #[must_use]
    pub fn needs_unflattening(&self, instructions: &[Instruction]) -> bool {
        is_obfuscated(instructions, &self.detection)
    }

    /// Unflattens an anonymous method body.
    ///
    /// # Errors
    ///
    /// - [`Error::Empty`] for an empty body
    /// - [`Error::Malformed`] if the body cannot be partitioned or re-emitted
    /// - [`Error::InconsistentStack`] or [`Error::StackUnderflow`] if the rewritten
    ///   body does not keep one stack height per block
    /// - [`Error::StillObfuscated`] if verification is enabled and the result still
    ///   carries a dispatcher
    pub fn deobfuscate(&self, instructions: &[Instruction], events: &EventLog) -> Result<Vec<Instruction>> {
        self.run(Subject::anonymous(), instructions, events)
            .map(|(body, _)| body)
    }

    /// Unflattens the body of `method`; events carry the method token.
    ///
    /// # Errors
    ///
    /// Same as [`Self::deobfuscate`]; a method without a CIL body is [`Error::Empty`].
    pub fn deobfuscate_method(&self, method: &MethodDef, events: &EventLog) -> Result<Vec<Instruction>> {
        self.deobfuscate_method_with_stats(method, events)
            .map(|(body, _)| body)
    }

    /// Like [`Self::deobfuscate_method`], also returning the run's counters.
    ///
    /// # Errors
    ///
    /// Same as [`Self::deobfuscate_method`].
    pub fn deobfuscate_method_with_stats(
        &self,
        method: &MethodDef,
        events: &EventLog,
    ) -> Result<(Vec<Instruction>, UnflattenStats)> {
        let body = method.body.as_deref().ok_or(Error::Empty)?;
        self.run(Subject::of(method), body, events)
    }

    fn run(
        &self,
        subject: Subject<'_>,
        instructions: &[Instruction],
        events: &EventLog,
    ) -> Result<(Vec<Instruction>, UnflattenStats)> {
        let mut graph = BlockGraph::from_instructions(instructions)?;
        if !subject.handlers.is_empty() {
            Self::warn_handlers(subject, &graph, events);
        }
        let mut stats = UnflattenStats {
            blocks_removed: graph.remove_dead_blocks(),
            ..UnflattenStats::default()
        };
        graph.repartition()?;

        let resolver = StateResolver::new(self.config.dispatcher_ceiling);
        let mut state_locals = BTreeSet::new();
        let mut converged = false;

        while stats.passes < self.config.max_fixpoint_passes {
            stats.passes += 1;
            let mut stuck = Vec::new();
            let collapsed =
                self.collapse_pass(&mut graph, &resolver, subject, events, &mut state_locals, &mut stuck);

            if collapsed == 0 {
                stats.unresolved = stuck.len();
                for entry in stuck {
                    subject
                        .event(events, EventKind::BranchUnresolved, entry.location)
                        .message(format!(
                            "state {} stuck at {}: {}",
                            entry.value, entry.at, entry.reason
                        ));
                }
                converged = true;
                break;
            }

            stats.collapsed += collapsed;
            stats.blocks_removed += graph.remove_dead_blocks();
            graph.repartition()?;
        }

        if !converged {
            log::warn!(
                "Unflattening '{}' did not converge within {} passes",
                subject.name,
                self.config.max_fixpoint_passes
            );
            subject.event(events, EventKind::Warning, 0).message(format!(
                "unflattening did not converge within {} passes",
                self.config.max_fixpoint_passes
            ));
        }

        for local in state_locals {
            stats.stores_removed += strip_dead_stores(&mut graph, local);
        }
        stats.blocks_removed += graph.remove_dead_blocks();
        stats.pops_inserted = stackfix::fix_block_graph(&mut graph);
        entry_heights(&graph)?;
        let output = graph.to_instructions()?;

        if stats.blocks_removed > 0 {
            subject
                .event(events, EventKind::BlocksRemoved, 0)
                .message(format!("{} unreachable blocks removed", stats.blocks_removed));
        }
        if stats.pops_inserted > 0 {
            subject
                .event(events, EventKind::StackRepaired, 0)
                .message(format!("{} pops inserted", stats.pops_inserted));
        }

        if self.config.verify && is_still_obfuscated(&output, &self.detection) {
            return Err(Error::StillObfuscated {
                method: subject.name.to_string(),
                dump: instructions.iter().map(ToString::to_string).collect(),
            });
        }

        if stats.collapsed > 0 {
            log::debug!(
                "Unflattened '{}': {} tails rewritten in {} passes, {} blocks removed",
                subject.name,
                stats.collapsed,
                stats.passes,
                stats.blocks_removed
            );
        }
        Ok((output, stats))
    }

    /// Reports handler clauses whose handler only exception flow reaches; those
    /// blocks are dropped with the unreachable ones.
    fn warn_handlers(subject: Subject<'_>, graph: &BlockGraph, events: &EventLog) {
        let reachable = graph.reachable();
        let dropped = subject
            .handlers
            .iter()
            .filter(|handler| {
                graph
                    .block_at_offset(handler.handler_offset)
                    .is_some_and(|id| !reachable.contains(&id))
            })
            .count();

        log::warn!(
            "'{}' has {} exception handlers; {} handler blocks are dropped as unreachable",
            subject.name,
            subject.handlers.len(),
            dropped
        );
        subject.event(events, EventKind::Warning, 0).message(format!(
            "{} exception handlers not modeled, {} handler blocks dropped",
            subject.handlers.len(),
            dropped
        ));
    }

    /// One pass over every block; returns the number of rewritten tails.
    fn collapse_pass(
        &self,
        graph: &mut BlockGraph,
        resolver: &StateResolver,
        subject: Subject<'_>,
        events: &EventLog,
        state_locals: &mut BTreeSet<u16>,
        stuck: &mut Vec<Stuck>,
    ) -> usize {
        let budget = self.config.expression_budget;
        let ids: Vec<BlockId> = graph.block_ids().collect();
        let mut known_states: HashMap<u16, HashMap<BlockId, Option<i32>>> = HashMap::new();
        let mut collapsed = 0;

        for id in ids {
            let Some(block) = graph.block(id) else {
                continue;
            };
            let Some(store) = StateStore::find(graph, block) else {
                continue;
            };

            // Expressions over the previous state need the value known on entry.
            let handed_off = store.dispatch_context(block, None, budget).or_else(|| {
                let states = known_states
                    .entry(store.local)
                    .or_insert_with(|| entry_states(graph, resolver, store.local, budget));
                let entry = states.get(&id).copied().flatten()?;
                store.dispatch_context(block, Some(entry), budget)
            });
            let Some((value, context)) = handed_off else {
                continue;
            };
            let location = block.instructions[store.store].offset;

            let trace = resolver.trace_from(graph, store.continuation, store.local, context);
            match trace.resolution {
                Resolution::Resolved(target) if target != store.continuation => {
                    let Some(state) = trace.state.as_i32() else {
                        continue;
                    };
                    let Some(block) = graph.block_mut(id) else {
                        continue;
                    };
                    block.replace_tail(store.expression_start, target);
                    let jump = block.instructions.len() - 1;
                    block.instructions.splice(
                        jump..jump,
                        [
                            Instruction::ldc_i4(state).at(location),
                            Instruction::stloc(store.local).at(location),
                        ],
                    );

                    log::debug!(
                        "Resolved state {} (local {}) at 0x{:04X} to {}",
                        value,
                        store.local,
                        location,
                        target
                    );
                    subject
                        .event(events, EventKind::DispatcherCollapsed, location)
                        .message(format!("state {value} resolved to {target}"));
                    state_locals.insert(store.local);
                    collapsed += 1;
                }
                Resolution::Resolved(_) => {}
                Resolution::Unresolved { at, reason } => {
                    if trace.dispatched {
                        stuck.push(Stuck {
                            location,
                            value,
                            at,
                            reason,
                        });
                    }
                }
            }
        }
        collapsed
    }
}
