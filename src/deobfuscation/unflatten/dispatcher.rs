//! Dispatcher block recognition.

use crate::{
    analysis::Block,
    assembly::opcodes,
    deobfuscation::unflatten::statevar::is_constant_operation,
};

/// Returns true if `block` is part of a dispatcher chain for the state local `local`.
///
/// A dispatcher block only routes control: it is small, calls nothing, throws
/// nothing and writes no local other than the state variable. Blocks that read the
/// state variable (see [`reads_local`]) qualify up to `ceiling` instructions; blocks
/// that do not read it only qualify as trampolines of at most two instructions. The
/// empty block is a dispatcher.
#[must_use]
pub fn is_dispatcher(block: &Block, local: u16, ceiling: usize) -> bool {
    let instructions = &block.instructions;
    if instructions.len() > ceiling {
        return false;
    }
    if instructions.is_empty() {
        return true;
    }

    for instruction in instructions {
        if instruction.is_call() || instruction.is_throw() {
            return false;
        }
        if instruction.is_stloc() && instruction.local_index() != Some(local) {
            return false;
        }
    }

    // A trampoline of two instructions qualifies even when it writes an argument or a
    // static field (`starg`, `stsfld`). Collapsing a chain that runs through one drops
    // that write.
    reads_local(block, local) || instructions.len() <= 2
}

/// Returns true if `block` reads the state local, or captures the incoming state into
/// it with `dup; stloc`.
#[must_use]
pub fn reads_local(block: &Block, local: u16) -> bool {
    let instructions = &block.instructions;
    instructions.iter().enumerate().any(|(index, instruction)| {
        instruction.local_index() == Some(local)
            && (!instruction.is_stloc()
                || index
                    .checked_sub(1)
                    .is_some_and(|previous| instructions[previous].is(opcodes::DUP)))
    })
}

/// The state local a dispatcher header stores the incoming stack value into.
///
/// The header opens with constant arithmetic over the value on the stack on entry,
/// then keeps a copy of the result with `dup; stloc L`:
///
/// ```text
/// ldc.i4 K
/// xor
/// dup
/// stloc  L
/// ldc.i4 N
/// rem.un
/// switch (...)
/// ```
#[must_use]
pub fn captured_state(block: &Block) -> Option<u16> {
    let mut height: i32 = 1;
    for pair in block.instructions.windows(2) {
        let (instruction, next) = (&pair[0], &pair[1]);
        if instruction.is(opcodes::DUP) && next.is_stloc() {
            return if height == 1 { next.local_index() } else { None };
        }
        if !is_constant_operation(instruction) {
            return None;
        }
        height -= i32::from(instruction.stack_behavior.pops);
        if height < 0 {
            return None;
        }
        height += i32::from(instruction.stack_behavior.pushes);
    }
    None
}
