//! Known state values on entry to each block.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::{
    analysis::{BlockGraph, BlockId},
    deobfuscation::unflatten::{
        resolver::{Resolution, StateResolver, UnresolvedReason},
        statevar::{fold_local, Carrier, StateStore},
    },
    emulation::{EmValue, EmulationContext, EmulationLimits, Interpreter},
};

/// Value of the state local `local` on entry to each block, where it is known.
///
/// Values propagate forward from the method entry, where the local is unknown. A block
/// that is not a dispatcher passes on the value it leaves in the local. Where control
/// enters a dispatcher chain, the chain is emulated with that value (or with the value
/// a stack hand-off pushes), and the result arrives at the block the chain resolves
/// to. Blocks reached with two different values, or behind a chain that cannot be
/// followed, map to `None`. Dispatcher blocks and blocks that are only entered from
/// inside a chain have no entry.
#[must_use]
pub fn entry_states(
    graph: &BlockGraph,
    resolver: &StateResolver,
    local: u16,
    budget: u64,
) -> HashMap<BlockId, Option<i32>> {
    let interpreter = Interpreter::new(EmulationLimits::default().with_max_instructions(budget));
    let mut flow = Propagation {
        graph,
        resolver,
        local,
        states: HashMap::new(),
        queue: VecDeque::new(),
    };
    flow.join(graph.entry(), None);

    while let Some(id) = flow.queue.pop_front() {
        let Some(block) = graph.block(id) else {
            continue;
        };
        let entry = flow.states.get(&id).copied().flatten();
        let exit = fold_local(&interpreter, &block.instructions, local, entry);
        let pushed = StateStore::find(graph, block).filter(|store| store.carrier == Carrier::Stack);

        for successor in block.successors() {
            let Some(next) = graph.block(successor) else {
                continue;
            };
            if successor == graph.entry() || !resolver.routes(next, local) {
                flow.join(successor, exit);
                continue;
            }

            let context = match &pushed {
                Some(store) if store.continuation == successor => store
                    .dispatch_context(block, entry, budget)
                    .map(|(_, context)| context),
                _ => exit.map(|value| EmulationContext::new().with_local(local, EmValue::I32(value))),
            };
            match context {
                Some(context) => flow.route(successor, context),
                None => flow.poison(successor),
            }
        }
    }
    flow.states
}

struct Propagation<'a> {
    graph: &'a BlockGraph,
    resolver: &'a StateResolver,
    local: u16,
    states: HashMap<BlockId, Option<i32>>,
    queue: VecDeque<BlockId>,
}

impl Propagation<'_> {
    /// Merges `value` into the entry state of `id`; a changed block is queued again.
    fn join(&mut self, id: BlockId, value: Option<i32>) {
        let merged = match self.states.get(&id) {
            None => value,
            Some(None) => return,
            Some(&existing) if existing == value => return,
            Some(_) => None,
        };
        self.states.insert(id, merged);
        self.queue.push_back(id);
    }

    fn route(&mut self, start: BlockId, context: EmulationContext) {
        let trace = self.resolver.trace_from(self.graph, start, self.local, context);
        match trace.resolution {
            Resolution::Resolved(target) => self.join(target, trace.state.as_i32()),
            Resolution::Unresolved {
                reason: UnresolvedReason::Terminal,
                ..
            } => {}
            Resolution::Unresolved { .. } => self.poison(start),
        }
    }

    /// Marks every block a dispatcher chain from `start` can lead to as unknown.
    fn poison(&mut self, start: BlockId) {
        let mut seen = HashSet::new();
        let mut pending = vec![start];
        while let Some(id) = pending.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(block) = self.graph.block(id) else {
                continue;
            };
            if id != start && (id == self.graph.entry() || !self.resolver.routes(block, self.local)) {
                self.join(id, None);
                continue;
            }
            pending.extend(block.successors());
        }
    }
}
