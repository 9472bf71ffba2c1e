//! Static evaluation-stack height replay.
//!
//! Heights are computed from each instruction's [`crate::assembly::StackBehavior`],
//! without executing anything. [`height_after`] replays a straight run the way the
//! stack repair pass needs it; [`entry_heights`] propagates heights over a whole
//! [`BlockGraph`] and reports blocks that are reached with two different depths.

use std::collections::VecDeque;

use crate::{
    analysis::{Block, BlockGraph},
    assembly::Instruction,
    Error, Result,
};

/// Net stack effect of one instruction.
#[must_use]
pub fn stack_delta(instruction: &Instruction) -> i32 {
    i32::from(instruction.stack_behavior.net_effect)
}

/// Height after replaying `instructions` from `initial`.
///
/// A height that would go negative is clamped to zero, so values consumed from
/// outside the run are not counted.
#[must_use]
pub fn height_after(instructions: &[Instruction], initial: usize) -> usize {
    let mut height = i64::try_from(initial).unwrap_or(i64::MAX);
    for instruction in instructions {
        height = (height + i64::from(stack_delta(instruction))).max(0);
    }
    usize::try_from(height).unwrap_or_default()
}

/// Stack height at the entry of every live block reachable from the entry.
///
/// The result is indexed by [`crate::analysis::BlockId::index`]; unreachable or
/// removed blocks are `None`.
///
/// # Errors
///
/// Returns [`Error::InconsistentStack`] when a block is reached with two different
/// heights, and [`Error::StackUnderflow`] when a block pops more values than its entry
/// height provides.
pub fn entry_heights(graph: &BlockGraph) -> Result<Vec<Option<usize>>> {
    let size = graph
        .block_ids()
        .map(|id| id.index() + 1)
        .max()
        .unwrap_or_default();
    let mut heights: Vec<Option<usize>> = vec![None; size];
    let mut queue = VecDeque::new();

    let entry = graph.entry();
    if entry.index() < size {
        heights[entry.index()] = Some(0);
        queue.push_back(entry);
    }

    while let Some(id) = queue.pop_front() {
        let Some(block) = graph.block(id) else {
            continue;
        };
        let mut height = heights[id.index()].map_or(0, |h| i64::try_from(h).unwrap_or(i64::MAX));
        for instruction in &block.instructions {
            height -= i64::from(instruction.stack_behavior.pops);
            if height < 0 {
                return Err(Error::StackUnderflow {
                    offset: instruction.offset,
                });
            }
            height += i64::from(instruction.stack_behavior.pushes);
        }
        let exit = usize::try_from(height).unwrap_or_default();

        for successor in block.successors() {
            let Some(slot) = heights.get_mut(successor.index()) else {
                continue;
            };
            match *slot {
                None => {
                    *slot = Some(exit);
                    queue.push_back(successor);
                }
                Some(existing) if existing != exit => {
                    return Err(Error::InconsistentStack {
                        offset: graph
                            .block(successor)
                            .and_then(Block::start_offset)
                            .unwrap_or_default(),
                        first: existing,
                        second: exit,
                    });
                }
                Some(_) => {}
            }
        }
    }
    Ok(heights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::InstructionAssembler;

    #[test]
    fn test_height_after_clamps() {
        let mut asm = InstructionAssembler::new();
        asm.pop().unwrap().ldc_i4(1).unwrap().ldc_i4(2).unwrap();
        let instructions = asm.finish().unwrap();
        assert_eq!(height_after(&instructions, 0), 2);
        assert_eq!(height_after(&instructions, 3), 4);
        assert_eq!(stack_delta(&instructions[0]), -1);
    }

    #[test]
    fn test_entry_heights_consistent() {
        let mut asm = InstructionAssembler::new();
        asm.ldarg_0()
            .unwrap()
            .brtrue_s("one")
            .unwrap()
            .ldc_i4(0)
            .unwrap()
            .br_s("end")
            .unwrap()
            .label("one")
            .unwrap()
            .ldc_i4(1)
            .unwrap()
            .label("end")
            .unwrap()
            .ret()
            .unwrap();
        let graph = BlockGraph::from_instructions(&asm.finish().unwrap()).unwrap();
        let heights = entry_heights(&graph).unwrap();
        assert_eq!(heights, vec![Some(0), Some(0), Some(0), Some(1)]);
    }

    #[test]
    fn test_entry_heights_detect_mismatch() {
        let mut asm = InstructionAssembler::new();
        asm.label("top")
            .unwrap()
            .ldc_i4(1)
            .unwrap()
            .br_s("top")
            .unwrap();
        let graph = BlockGraph::from_instructions(&asm.finish().unwrap()).unwrap();
        assert!(matches!(
            entry_heights(&graph),
            Err(Error::InconsistentStack {
                offset: 0,
                first: 0,
                second: 1
            })
        ));
    }

    #[test]
    fn test_entry_heights_detect_underflow() {
        let mut asm = InstructionAssembler::new();
        asm.ldc_i4(1).unwrap().add().unwrap().ret().unwrap();
        let instructions = asm.finish().unwrap();
        let graph = BlockGraph::from_instructions(&instructions).unwrap();
        assert!(matches!(
            entry_heights(&graph),
            Err(Error::StackUnderflow { offset }) if offset == instructions[1].offset
        ));
    }
}
