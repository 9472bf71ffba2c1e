//! ConfuserEx protection removal.
//!
//! ConfuserEx is a popular open-source obfuscator for .NET assemblies. This module
//! removes three of its protections, and those of derivatives such as RacGuard that
//! keep the same runtime:
//!
//! | Protection  | Description                                        | Step           |
//! |-------------|----------------------------------------------------|----------------|
//! | RefProxy    | Calls routed through generated delegate fields     | [`RefProxy`]   |
//! | AntiTamper  | Method bodies encrypted in an extra PE section     | [`AntiTamper`] |
//! | ControlFlow | Method bodies flattened into a state machine       | [`ControlFlow`]|
//!
//! The native x86 modes (x86 ref-proxy encoders, JIT-hook anti-tamper) are not
//! supported.

pub mod antitamper;
mod controlflow;
mod refproxy;

pub use antitamper::AntiTamper;
pub use controlflow::{ControlFlow, ControlFlowReport};
pub use refproxy::{HandlerKeys, ProxyHandler, RefProxy, HANDLER_SIGNATURE};

use crate::{
    analysis::BlockGraph,
    assembly::Instruction,
    Result,
};

/// Deletes the instructions starting at `offsets` from `body`.
///
/// The body goes through a [`BlockGraph`], so branches into a deleted instruction
/// land on its successor and every offset is recomputed. A block left empty keeps a
/// `nop`.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] if the body cannot be partitioned or
/// re-emitted.
pub(crate) fn remove_instructions(body: &[Instruction], offsets: &[u64]) -> Result<Vec<Instruction>> {
    if offsets.is_empty() {
        return Ok(body.to_vec());
    }

    let mut graph = BlockGraph::from_instructions(body)?;
    let ids: Vec<_> = graph.block_ids().collect();
    for id in ids {
        let Some(block) = graph.block_mut(id) else {
            continue;
        };
        let Some(first) = block.instructions.first().map(|i| i.offset) else {
            continue;
        };
        block
            .instructions
            .retain(|instruction| !offsets.contains(&instruction.offset));
        if block.instructions.is_empty() {
            block.instructions.push(Instruction::nop().at(first));
        }
    }
    graph.to_instructions()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::InstructionAssembler;

    #[test]
    fn test_remove_branch_target() {
        let mut asm = InstructionAssembler::new();
        asm.ldarg_0()
            .unwrap()
            .brtrue("target")
            .unwrap()
            .ldc_i4(1)
            .unwrap()
            .pop()
            .unwrap()
            .label("target")
            .unwrap()
            .nop()
            .unwrap()
            .ret()
            .unwrap();
        let body = asm.finish().unwrap();
        let target = body[4].offset;

        let rewritten = remove_instructions(&body, &[target]).unwrap();
        assert_eq!(rewritten.len(), 5);
        let branch = &rewritten[1];
        assert_eq!(branch.branch_targets, vec![rewritten[4].offset]);
        assert!(rewritten[4].is_return());
    }

    #[test]
    fn test_nothing_to_remove() {
        let mut asm = InstructionAssembler::new();
        asm.nop().unwrap().ret().unwrap();
        let body = asm.finish().unwrap();
        assert_eq!(remove_instructions(&body, &[]).unwrap(), body);
    }
}
