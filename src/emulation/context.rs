//! Mutable state of one emulation run.
//!
//! An [`EmulationContext`] holds the evaluation stack, argument and local slots, the
//! array heap and the offset table of the running instruction sequence. Callers seed it
//! with arguments, locals and bound arrays before handing it to
//! [`crate::emulation::emulate`], and read the results back from the context that
//! `emulate` returns.
//!
//! Argument and local slots that were never written read as [`EmValue::Unknown`]: the
//! emulator does not know method signatures, and an unset slot is exactly as unknown as
//! the result of an unmodelled call.
//!
//! # Examples
//!
//! ```rust
//! use unconfuse::emulation::{EmValue, EmulationContext};
//!
//! let mut ctx = EmulationContext::new().with_local(0, EmValue::I32(5));
//! let words = ctx.bind_local_array(1, &[1, 2, 3]);
//!
//! assert_eq!(ctx.local(0), EmValue::I32(5));
//! assert_eq!(ctx.local(7), EmValue::Unknown);
//! assert_eq!(ctx.array_words(words), Some(vec![1, 2, 3]));
//! ```

use std::collections::HashMap;

use crate::{
    assembly::Instruction,
    emulation::{ArrayObject, ArrayRef, ElementType, EmValue, EmulationError, Heap},
    Result,
};

/// Evaluation stack, variable slots and heap of one emulation run.
#[derive(Debug, Clone, Default)]
pub struct EmulationContext {
    stack: Vec<EmValue>,
    arguments: HashMap<u16, EmValue>,
    locals: HashMap<u16, EmValue>,
    offsets: HashMap<u64, usize>,
    last_stored: Option<EmValue>,
    return_value: Option<EmValue>,
    heap: Heap,
}

impl EmulationContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds argument `index` with `value`.
    #[must_use]
    pub fn with_arg(mut self, index: u16, value: EmValue) -> Self {
        self.arguments.insert(index, value);
        self
    }

    /// Seeds local `index` with `value`.
    #[must_use]
    pub fn with_local(mut self, index: u16, value: EmValue) -> Self {
        self.locals.insert(index, value);
        self
    }

    /// Pushes a value onto the evaluation stack.
    pub fn push(&mut self, value: EmValue) {
        self.stack.push(value);
    }

    /// Pops the top of the evaluation stack.
    ///
    /// # Errors
    ///
    /// Returns [`EmulationError::StackUnderflow`] if the stack is empty.
    pub fn pop(&mut self) -> Result<EmValue> {
        self.stack
            .pop()
            .ok_or_else(|| EmulationError::StackUnderflow.into())
    }

    /// Pops `count` values and discards them.
    ///
    /// # Errors
    ///
    /// Returns [`EmulationError::StackUnderflow`] if fewer than `count` values are present.
    pub fn discard(&mut self, count: usize) -> Result<()> {
        if self.stack.len() < count {
            return Err(EmulationError::StackUnderflow.into());
        }
        self.stack.truncate(self.stack.len() - count);
        Ok(())
    }

    /// Returns the top of the evaluation stack without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&EmValue> {
        self.stack.last()
    }

    /// The evaluation stack, bottom first.
    #[must_use]
    pub fn stack(&self) -> &[EmValue] {
        &self.stack
    }

    /// Empties the evaluation stack (`leave`).
    pub fn clear_stack(&mut self) {
        self.stack.clear();
    }

    /// Reads local `index`; unset locals are [`EmValue::Unknown`].
    #[must_use]
    pub fn local(&self, index: u16) -> EmValue {
        self.locals.get(&index).cloned().unwrap_or(EmValue::Unknown)
    }

    /// Writes local `index`.
    pub fn set_local(&mut self, index: u16, value: EmValue) {
        self.locals.insert(index, value);
    }

    /// Reads argument `index`; unset arguments are [`EmValue::Unknown`].
    #[must_use]
    pub fn arg(&self, index: u16) -> EmValue {
        self.arguments.get(&index).cloned().unwrap_or(EmValue::Unknown)
    }

    /// Writes argument `index`.
    pub fn set_arg(&mut self, index: u16, value: EmValue) {
        self.arguments.insert(index, value);
    }

    /// Allocates a zeroed array on the heap.
    pub fn allocate_array(&mut self, element_type: ElementType, length: usize) -> ArrayRef {
        self.heap.allocate(element_type, length)
    }

    /// Returns the array behind `handle`.
    #[must_use]
    pub fn array(&self, handle: ArrayRef) -> Option<&ArrayObject> {
        self.heap.get(handle)
    }

    /// Returns the array behind `handle` for modification.
    pub fn array_mut(&mut self, handle: ArrayRef) -> Option<&mut ArrayObject> {
        self.heap.get_mut(handle)
    }

    /// Allocates a `uint[]` holding `words` and stores its reference in local `index`.
    pub fn bind_local_array(&mut self, index: u16, words: &[u32]) -> ArrayRef {
        let handle = self.heap.insert(ArrayObject {
            element_type: ElementType::U4,
            items: words.iter().copied().map(EmValue::U32).collect(),
        });
        self.locals.insert(index, EmValue::Array(handle));
        handle
    }

    /// Reads a word array back.
    ///
    /// Returns `None` if the handle is unknown or any element is not a concrete
    /// 32-bit integer.
    #[must_use]
    pub fn array_words(&self, handle: ArrayRef) -> Option<Vec<u32>> {
        self.heap
            .get(handle)?
            .items
            .iter()
            .map(EmValue::as_u32)
            .collect()
    }

    /// Value recorded by the most recent `stfld` or `stsfld`.
    #[must_use]
    pub fn last_stored(&self) -> Option<&EmValue> {
        self.last_stored.as_ref()
    }

    pub(crate) fn set_last_stored(&mut self, value: EmValue) {
        self.last_stored = Some(value);
    }

    /// Value on top of the stack when `ret` executed.
    #[must_use]
    pub fn return_value(&self) -> Option<&EmValue> {
        self.return_value.as_ref()
    }

    pub(crate) fn set_return_value(&mut self, value: Option<EmValue>) {
        self.return_value = value;
    }

    /// Rebuilds the offset to sequence index table for `instructions`.
    pub fn index_instructions(&mut self, instructions: &[Instruction]) {
        self.offsets = instructions
            .iter()
            .enumerate()
            .map(|(index, instruction)| (instruction.offset, index))
            .collect();
    }

    /// Sequence index of the instruction starting at `offset`.
    #[must_use]
    pub fn index_of(&self, offset: u64) -> Option<usize> {
        self.offsets.get(&offset).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assembly::InstructionAssembler, Error};

    #[test]
    fn test_pop_underflow() {
        let mut ctx = EmulationContext::new();
        assert!(matches!(
            ctx.pop(),
            Err(Error::Emulation(ref e)) if matches!(e.as_ref(), EmulationError::StackUnderflow)
        ));
        ctx.push(EmValue::I32(1));
        assert_eq!(ctx.pop().unwrap(), EmValue::I32(1));
    }

    #[test]
    fn test_discard() {
        let mut ctx = EmulationContext::new();
        ctx.push(EmValue::I32(1));
        ctx.push(EmValue::I32(2));
        assert!(ctx.discard(3).is_err());
        ctx.discard(2).unwrap();
        assert!(ctx.stack().is_empty());
    }

    #[test]
    fn test_unset_slots_are_unknown() {
        let ctx = EmulationContext::new().with_arg(0, EmValue::I32(9));
        assert_eq!(ctx.arg(0), EmValue::I32(9));
        assert_eq!(ctx.arg(1), EmValue::Unknown);
        assert_eq!(ctx.local(0), EmValue::Unknown);
    }

    #[test]
    fn test_bound_array_round_trip() {
        let mut ctx = EmulationContext::new();
        let handle = ctx.bind_local_array(3, &[0xDEAD_BEEF, 7]);
        assert_eq!(ctx.local(3), EmValue::Array(handle));

        ctx.array_mut(handle)
            .unwrap()
            .set(1, &EmValue::I32(-1))
            .unwrap();
        assert_eq!(ctx.array_words(handle), Some(vec![0xDEAD_BEEF, u32::MAX]));

        ctx.array_mut(handle).unwrap().items[0] = EmValue::Unknown;
        assert_eq!(ctx.array_words(handle), None);
    }

    #[test]
    fn test_offset_index() {
        let mut asm = InstructionAssembler::new();
        asm.ldc_i4(1000).unwrap().pop().unwrap().ret().unwrap();
        let instructions = asm.finish().unwrap();

        let mut ctx = EmulationContext::new();
        ctx.index_instructions(&instructions);
        assert_eq!(ctx.index_of(0), Some(0));
        assert_eq!(ctx.index_of(5), Some(1));
        assert_eq!(ctx.index_of(6), Some(2));
        assert_eq!(ctx.index_of(1), None);
    }
}
