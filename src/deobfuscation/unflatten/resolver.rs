//! Walking a dispatcher chain for one concrete state value.

use std::fmt;

use crate::{
    analysis::{Block, BlockGraph, BlockId, Terminator},
    assembly::Instruction,
    deobfuscation::unflatten::dispatcher::{is_dispatcher, reads_local},
    emulation::{EmValue, EmulationContext, Flow, Interpreter},
};

/// Outcome of resolving a state value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The first non-dispatcher block the state value leads to.
    Resolved(BlockId),
    /// Resolution stopped at `at`.
    Unresolved {
        /// The dispatcher block where resolution stopped
        at: BlockId,
        /// Why it stopped
        reason: UnresolvedReason,
    },
}

/// Why a dispatcher chain could not be followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvedReason {
    /// The chain visits a block twice for the same state value.
    Cycle,
    /// A branch predicate depends on something other than the state.
    UndeterminedBranch,
    /// The chain ends in a return or throw.
    Terminal,
    /// A block has no successor for the taken direction.
    MissingSuccessor,
    /// The emulator faulted.
    Emulation(String),
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnresolvedReason::Cycle => write!(f, "dispatcher cycle"),
            UnresolvedReason::UndeterminedBranch => write!(f, "branch does not depend on the state"),
            UnresolvedReason::Terminal => write!(f, "dispatcher chain ends in a return or throw"),
            UnresolvedReason::MissingSuccessor => write!(f, "missing successor"),
            UnresolvedReason::Emulation(message) => write!(f, "emulation failed: {message}"),
        }
    }
}

/// Full record of one resolution.
#[derive(Debug, Clone)]
pub struct Trace {
    /// Where the state value leads
    pub resolution: Resolution,
    /// Value of the state local when resolution stopped
    pub state: EmValue,
    /// Blocks visited, in order
    pub visited: Vec<BlockId>,
    /// True if a visited dispatcher actually read the state local
    pub dispatched: bool,
}

/// Follows dispatcher chains by emulating them with a concrete state value.
#[derive(Debug, Clone)]
pub struct StateResolver {
    interpreter: Interpreter,
    ceiling: usize,
}

impl StateResolver {
    /// Creates a resolver treating blocks of up to `ceiling` instructions as dispatchers.
    #[must_use]
    pub fn new(ceiling: usize) -> Self {
        StateResolver {
            interpreter: Interpreter::default(),
            ceiling,
        }
    }

    /// Resolves where control goes from `start` when the state local `local` holds
    /// `value`.
    #[must_use]
    pub fn resolve(&self, graph: &BlockGraph, start: BlockId, local: u16, value: EmValue) -> Resolution {
        self.trace(graph, start, local, value).resolution
    }

    /// Like [`Self::resolve`], keeping the visited path and the final state value.
    #[must_use]
    pub fn trace(&self, graph: &BlockGraph, start: BlockId, local: u16, value: EmValue) -> Trace {
        self.trace_from(graph, start, local, EmulationContext::new().with_local(local, value))
    }

    /// Walks the dispatcher chain from `start` with a prepared emulation context.
    ///
    /// One context lives for the whole walk, so updates a dispatcher makes to the
    /// state local are seen by the blocks after it. The evaluation stack carries over
    /// between blocks as well; a state pushed by a trampoline reaches the header that
    /// consumes it.
    #[must_use]
    pub fn trace_from(
        &self,
        graph: &BlockGraph,
        start: BlockId,
        local: u16,
        mut context: EmulationContext,
    ) -> Trace {
        let mut visited = Vec::new();
        let mut dispatched = false;
        let mut current = start;

        let resolution = loop {
            if visited.contains(&current) {
                break Resolution::Unresolved {
                    at: current,
                    reason: UnresolvedReason::Cycle,
                };
            }
            visited.push(current);

            let Some(block) = graph.block(current).filter(|block| !block.is_removed()) else {
                break Resolution::Unresolved {
                    at: current,
                    reason: UnresolvedReason::MissingSuccessor,
                };
            };
            if !self.routes(block, local) {
                break Resolution::Resolved(current);
            }
            dispatched |= reads_local(block, local);

            match self.step(&mut context, block) {
                Ok(next) => current = next,
                Err(reason) => break Resolution::Unresolved { at: current, reason },
            }
        };

        Trace {
            resolution,
            state: context.local(local),
            visited,
            dispatched,
        }
    }

    /// Returns true if `block` counts as a dispatcher for `local` under this
    /// resolver's ceiling.
    #[must_use]
    pub fn routes(&self, block: &Block, local: u16) -> bool {
        is_dispatcher(block, local, self.ceiling)
    }

    fn step(&self, context: &mut EmulationContext, block: &Block) -> Result<BlockId, UnresolvedReason> {
        let Some((last, body)) = block.instructions.split_last() else {
            return block.fallthrough.ok_or(UnresolvedReason::MissingSuccessor);
        };
        for instruction in body {
            self.execute(context, instruction)?;
        }

        match block.terminator {
            Terminator::None => {
                self.execute(context, last)?;
                block.fallthrough.ok_or(UnresolvedReason::MissingSuccessor)
            }
            Terminator::Branch => block
                .targets
                .first()
                .copied()
                .ok_or(UnresolvedReason::MissingSuccessor),
            Terminator::ConditionalBranch | Terminator::Switch => {
                match self.execute(context, last)? {
                    Flow::Next => block.fallthrough.ok_or(UnresolvedReason::MissingSuccessor),
                    Flow::Branch(target) => last
                        .branch_targets
                        .iter()
                        .position(|&candidate| candidate == target)
                        .and_then(|index| block.targets.get(index).copied())
                        .ok_or(UnresolvedReason::MissingSuccessor),
                    Flow::Undetermined => Err(UnresolvedReason::UndeterminedBranch),
                    Flow::Return => Err(UnresolvedReason::Terminal),
                }
            }
            Terminator::Return | Terminator::Throw => Err(UnresolvedReason::Terminal),
        }
    }

    fn execute(&self, context: &mut EmulationContext, instruction: &Instruction) -> Result<Flow, UnresolvedReason> {
        self.interpreter
            .execute(context, instruction)
            .map_err(|error| UnresolvedReason::Emulation(error.to_string()))
    }
}
