//! Stack-consistency repair after unflattening.
//!
//! Collapsing dispatchers can leave filler blocks that push throwaway values and then
//! jump back to the method entry as an opaque loop. The entry expects an empty
//! evaluation stack, so every such jump gets exactly as many `pop`s as the block left
//! on the stack.

use crate::{
    analysis::{stack::height_after, BlockGraph, Terminator},
    assembly::Instruction,
    Result,
};

/// Inserts `pop`s before every unconditional jump to the entry block.
///
/// The height is replayed statically from the start of the jumping block; values the
/// block consumes from its predecessors are not counted. Returns the number of `pop`s
/// inserted, zero on an already consistent graph.
pub fn fix_block_graph(graph: &mut BlockGraph) -> usize {
    let entry = graph.entry();
    let jumps: Vec<_> = graph
        .blocks()
        .filter(|block| {
            block.terminator == Terminator::Branch
                && block.targets.first() == Some(&entry)
                && block
                    .instructions
                    .last()
                    .is_some_and(Instruction::is_unconditional_branch)
        })
        .map(|block| block.id)
        .collect();

    let mut inserted = 0;
    for id in jumps {
        let Some(block) = graph.block_mut(id) else {
            continue;
        };
        let jump = block.instructions.len() - 1;
        let height = height_after(&block.instructions[..jump], 0);
        if height == 0 {
            continue;
        }

        let offset = block.instructions[jump].offset;
        log::debug!(
            "Inserting {} pop(s) before jump to entry at 0x{:04X}",
            height,
            offset
        );
        block.instructions.splice(
            jump..jump,
            std::iter::repeat_with(|| Instruction::pop().at(offset)).take(height),
        );
        inserted += height;
    }
    inserted
}

/// Repairs a linear instruction list; see [`fix_block_graph`].
///
/// Returns the repaired list with fresh offsets and the number of inserted `pop`s.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] if the instructions cannot be partitioned.
pub fn fix_stack_consistency(instructions: &[Instruction]) -> Result<(Vec<Instruction>, usize)> {
    let mut graph = BlockGraph::from_instructions(instructions)?;
    let inserted = fix_block_graph(&mut graph);
    if inserted == 0 {
        return Ok((instructions.to_vec(), 0));
    }
    Ok((graph.to_instructions()?, inserted))
}
