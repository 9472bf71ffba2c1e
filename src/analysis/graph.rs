//! Editable block graph over a linear instruction list.
//!
//! [`BlockGraph`] owns its blocks in an arena addressed by [`BlockId`]. Edges are plain
//! id lists on each [`Block`]; rewriting a branch is an id assignment, and blocks that
//! become unreachable are tombstoned instead of shifted so ids stay stable until the
//! next [`BlockGraph::repartition`].
//!
//! The edges, not the branch operands inside the blocks, are authoritative. Branch
//! operands are recomputed from the edges by [`BlockGraph::to_instructions`].

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
};

use crate::{
    assembly::{FlowType, Instruction},
    Error, Result,
};

/// Index of a block inside its [`BlockGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

impl BlockId {
    /// Returns the arena index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// How control leaves a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// Falls through into [`Block::fallthrough`]
    None,
    /// Unconditional transfer to the single entry of [`Block::targets`]
    Branch,
    /// Two-way branch: taken edge in [`Block::targets`], not-taken edge in the fallthrough
    ConditionalBranch,
    /// Jump table: one target per case, out-of-range indices take the fallthrough
    Switch,
    /// Leaves the method (`ret`, `endfinally`)
    Return,
    /// Raises an exception
    Throw,
}

impl Terminator {
    fn of(instruction: &Instruction) -> Self {
        match instruction.flow_type {
            FlowType::UnconditionalBranch | FlowType::Leave => Terminator::Branch,
            FlowType::ConditionalBranch => Terminator::ConditionalBranch,
            FlowType::Switch => Terminator::Switch,
            FlowType::Return | FlowType::EndFinally => Terminator::Return,
            FlowType::Throw => Terminator::Throw,
            FlowType::Sequential | FlowType::Call => Terminator::None,
        }
    }

    /// Returns true if the last instruction of the block carries branch targets.
    #[must_use]
    pub fn has_targets(self) -> bool {
        matches!(
            self,
            Terminator::Branch | Terminator::ConditionalBranch | Terminator::Switch
        )
    }
}

/// A maximal straight-line run of instructions.
#[derive(Debug, Clone)]
pub struct Block {
    /// Position of this block in the arena
    pub id: BlockId,
    /// Instructions in execution order; the terminator, if any, is the last one
    pub instructions: Vec<Instruction>,
    /// Successor reached when the terminator does not transfer control
    pub fallthrough: Option<BlockId>,
    /// Explicit branch successors, in operand order
    pub targets: Vec<BlockId>,
    /// How control leaves the block
    pub terminator: Terminator,
    removed: bool,
}

impl Block {
    /// Offset of the first instruction, `None` for an empty block.
    #[must_use]
    pub fn start_offset(&self) -> Option<u64> {
        self.instructions.first().map(|instruction| instruction.offset)
    }

    /// All successors: branch targets first, then the fallthrough.
    #[must_use]
    pub fn successors(&self) -> Vec<BlockId> {
        let mut successors = self.targets.clone();
        successors.extend(self.fallthrough);
        successors
    }

    /// Returns true once the block has been dropped as unreachable.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Replaces `instructions[from..]` with an unconditional branch to `target`.
    ///
    /// The block keeps its id and every incoming edge; its outgoing edges become the
    /// single `target`.
    pub fn replace_tail(&mut self, from: usize, target: BlockId) {
        let from = from.min(self.instructions.len());
        let offset = self
            .instructions
            .get(from)
            .or_else(|| self.instructions.last())
            .map_or(0, |instruction| instruction.offset);

        self.instructions.truncate(from);
        self.instructions.push(Instruction::br(0).at(offset));
        self.terminator = Terminator::Branch;
        self.targets = vec![target];
        self.fallthrough = None;
    }
}

/// Arena of blocks for one method body; the entry is always [`BlockId(0)`](BlockId).
#[derive(Debug, Clone)]
pub struct BlockGraph {
    blocks: Vec<Block>,
}

impl BlockGraph {
    /// Partitions a linear instruction list into blocks.
    ///
    /// A block starts at the first instruction, at every branch or switch target, and
    /// after every instruction that transfers control.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Empty`] for an empty list and [`Error::Malformed`] when a branch
    /// target does not start an instruction.
    pub fn from_instructions(instructions: &[Instruction]) -> Result<Self> {
        if instructions.is_empty() {
            return Err(Error::Empty);
        }

        let index_of: HashMap<u64, usize> = instructions
            .iter()
            .enumerate()
            .map(|(index, instruction)| (instruction.offset, index))
            .collect();
        let resolve = |instruction: &Instruction, target: u64| {
            index_of.get(&target).copied().ok_or_else(|| {
                malformed_error!(
                    "Branch at 0x{:04X} targets 0x{:04X}, which is not an instruction boundary",
                    instruction.offset,
                    target
                )
            })
        };

        let mut leaders = vec![false; instructions.len()];
        leaders[0] = true;
        for (index, instruction) in instructions.iter().enumerate() {
            for &target in &instruction.branch_targets {
                leaders[resolve(instruction, target)?] = true;
            }
            if instruction.is_terminal() && index + 1 < instructions.len() {
                leaders[index + 1] = true;
            }
        }

        // Leader index -> block id
        let mut starts = Vec::new();
        let mut block_of = HashMap::new();
        for (index, _) in leaders.iter().enumerate().filter(|(_, leader)| **leader) {
            block_of.insert(index, BlockId(starts.len()));
            starts.push(index);
        }

        let mut blocks = Vec::with_capacity(starts.len());
        for (position, &start) in starts.iter().enumerate() {
            let end = starts.get(position + 1).copied().unwrap_or(instructions.len());
            let body = instructions[start..end].to_vec();
            let next = (position + 1 < starts.len()).then_some(BlockId(position + 1));

            let (terminator, targets) = match body.last() {
                Some(last) if last.is_terminal() => {
                    let mut targets = Vec::with_capacity(last.branch_targets.len());
                    for &target in &last.branch_targets {
                        targets.push(block_of[&resolve(last, target)?]);
                    }
                    (Terminator::of(last), targets)
                }
                _ => (Terminator::None, Vec::new()),
            };
            let fallthrough = match terminator {
                Terminator::None | Terminator::ConditionalBranch | Terminator::Switch => next,
                Terminator::Branch | Terminator::Return | Terminator::Throw => None,
            };

            blocks.push(Block {
                id: BlockId(position),
                instructions: body,
                fallthrough,
                targets,
                terminator,
                removed: false,
            });
        }

        Ok(BlockGraph { blocks })
    }

    /// The entry block id.
    #[must_use]
    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    /// Number of live blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.iter().filter(|block| !block.removed).count()
    }

    /// Returns true if the graph has no live blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live or removed block by id.
    #[must_use]
    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id.0)
    }

    /// Mutable block by id.
    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.get_mut(id.0)
    }

    /// Live blocks in layout order.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> + '_ {
        self.blocks.iter().filter(|block| !block.removed)
    }

    /// Ids of the live blocks in layout order.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks().map(|block| block.id)
    }

    /// Successors of `id`, empty for unknown ids.
    #[must_use]
    pub fn successors(&self, id: BlockId) -> Vec<BlockId> {
        self.block(id).map(Block::successors).unwrap_or_default()
    }

    /// Live block whose first instruction sits at `offset`.
    #[must_use]
    pub fn block_at_offset(&self, offset: u64) -> Option<BlockId> {
        self.blocks()
            .find(|block| block.start_offset() == Some(offset))
            .map(|block| block.id)
    }

    /// Live blocks reachable from the entry.
    #[must_use]
    pub fn reachable(&self) -> HashSet<BlockId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([self.entry()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            for successor in self.successors(id) {
                if !seen.contains(&successor) {
                    queue.push_back(successor);
                }
            }
        }
        seen
    }

    /// Tombstones every block that is unreachable from the entry.
    ///
    /// Returns the number of blocks removed by this call.
    pub fn remove_dead_blocks(&mut self) -> usize {
        let reachable = self.reachable();
        let mut removed = 0;
        for block in &mut self.blocks {
            if !block.removed && !reachable.contains(&block.id) {
                block.removed = true;
                removed += 1;
            }
        }
        removed
    }

    /// Linearises the live blocks with fresh offsets and re-targeted branches.
    ///
    /// Branches are widened to their 4-byte forms. A `br` to the block laid out
    /// immediately after is dropped, and a fallthrough to any other block gets an
    /// explicit `br`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if an edge points at a removed or unknown block, or
    /// if a terminator's edge count does not fit its instruction.
    pub fn to_instructions(&self) -> Result<Vec<Instruction>> {
        let layout: Vec<BlockId> = self.block_ids().collect();
        let mut emitted: Vec<(Instruction, Option<Vec<BlockId>>)> = Vec::new();
        let mut starts: HashMap<BlockId, usize> = HashMap::with_capacity(layout.len());

        for (position, &id) in layout.iter().enumerate() {
            let block = &self.blocks[id.0];
            let next = layout.get(position + 1).copied();
            starts.insert(id, emitted.len());

            let count = block.instructions.len();
            for (index, instruction) in block.instructions.iter().enumerate() {
                let is_tail = index + 1 == count;
                if !(is_tail && block.terminator.has_targets()) {
                    emitted.push((instruction.clone(), None));
                    continue;
                }
                if block.terminator == Terminator::Branch
                    && instruction.is_unconditional_branch()
                    && block.targets.first().copied() == next
                {
                    continue;
                }
                emitted.push((instruction.clone().into_long_form(), Some(block.targets.clone())));
            }

            if let Some(fallthrough) = block.fallthrough {
                if Some(fallthrough) != next {
                    emitted.push((Instruction::br(0), Some(vec![fallthrough])));
                }
            }
        }

        let mut offsets = Vec::with_capacity(emitted.len() + 1);
        let mut offset = 0;
        for (instruction, _) in &mut emitted {
            instruction.offset = offset;
            offsets.push(offset);
            offset += instruction.size;
        }
        offsets.push(offset);

        let mut instructions = Vec::with_capacity(emitted.len());
        for (mut instruction, targets) in emitted {
            if let Some(targets) = targets {
                let mut resolved = Vec::with_capacity(targets.len());
                for target in targets {
                    let Some(&start) = starts.get(&target) else {
                        return Err(malformed_error!(
                            "Edge from 0x{:04X} points at dead block {}",
                            instruction.offset,
                            target
                        ));
                    };
                    resolved.push(offsets[start]);
                }
                instruction.set_targets(resolved)?;
            }
            instructions.push(instruction);
        }
        Ok(instructions)
    }

    /// Re-linearises and re-partitions the graph.
    ///
    /// Removed blocks disappear, ids are renumbered, and blocks that no longer have a
    /// branch between them merge.
    ///
    /// # Errors
    ///
    /// Propagates the errors of [`BlockGraph::to_instructions`] and
    /// [`BlockGraph::from_instructions`].
    pub fn repartition(&mut self) -> Result<()> {
        let instructions = self.to_instructions()?;
        *self = Self::from_instructions(&instructions)?;
        Ok(())
    }
}
