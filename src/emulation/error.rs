//! Emulation error types.
//!
//! [`EmulationError`] describes faults raised while a single instruction executes.
//! They travel through [`crate::Error::Emulation`]; the interpreter lifts the two
//! faults callers routinely match on (stack underflow and unknown opcodes) into their
//! own top-level variants with the offset of the failing instruction attached.

use std::fmt;

/// Errors that can occur while executing CIL instructions.
#[derive(Debug, Clone, PartialEq)]
pub enum EmulationError {
    /// Evaluation stack underflow (pop from empty stack).
    StackUnderflow,
    /// Operand types are not valid for the operation.
    InvalidOperationTypes {
        /// The operation attempted.
        operation: String,
        /// Description of the operand types.
        operand_types: String,
    },
    /// The instruction carries an operand of the wrong shape.
    InvalidOperand {
        /// Mnemonic of the instruction.
        instruction: &'static str,
        /// Expected operand type.
        expected: &'static str,
    },
    /// Integer division or remainder by zero.
    DivisionByZero,
    /// Arithmetic overflow (`MIN / -1`).
    ArithmeticOverflow,
    /// Array index out of bounds.
    ArrayIndexOutOfBounds {
        /// The requested index.
        index: i64,
        /// The array length.
        length: usize,
    },
    /// A branch target does not start an instruction of the running sequence.
    InvalidBranchTarget {
        /// The offending target offset.
        target: u64,
    },
    /// A value could not be converted to the type an instruction needs.
    ValueConversion {
        /// Source type.
        from: &'static str,
        /// Target type.
        to: &'static str,
    },
    /// The configured instruction limit was reached.
    InstructionLimitExceeded {
        /// Instructions executed so far.
        executed: u64,
        /// The configured limit.
        limit: u64,
    },
}

impl fmt::Display for EmulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmulationError::StackUnderflow => write!(f, "evaluation stack underflow"),
            EmulationError::InvalidOperationTypes {
                operation,
                operand_types,
            } => {
                write!(
                    f,
                    "invalid operand types for {operation}: {operand_types}"
                )
            }
            EmulationError::InvalidOperand {
                instruction,
                expected,
            } => {
                write!(f, "invalid operand for {instruction}: expected {expected}")
            }
            EmulationError::DivisionByZero => write!(f, "division by zero"),
            EmulationError::ArithmeticOverflow => write!(f, "arithmetic overflow"),
            EmulationError::ArrayIndexOutOfBounds { index, length } => {
                write!(f, "array index {index} out of bounds (length: {length})")
            }
            EmulationError::InvalidBranchTarget { target } => {
                write!(f, "invalid branch target: 0x{target:04X}")
            }
            EmulationError::ValueConversion { from, to } => {
                write!(f, "cannot convert {from} to {to}")
            }
            EmulationError::InstructionLimitExceeded { executed, limit } => {
                write!(
                    f,
                    "instruction limit exceeded: {executed} executed (limit: {limit})"
                )
            }
        }
    }
}

impl std::error::Error for EmulationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            EmulationError::StackUnderflow.to_string(),
            "evaluation stack underflow"
        );
        assert_eq!(
            EmulationError::ArrayIndexOutOfBounds {
                index: 16,
                length: 16
            }
            .to_string(),
            "array index 16 out of bounds (length: 16)"
        );
        assert_eq!(
            EmulationError::InvalidBranchTarget { target: 0x2a }.to_string(),
            "invalid branch target: 0x002A"
        );
        assert_eq!(
            EmulationError::InvalidOperationTypes {
                operation: "add".to_string(),
                operand_types: "F64 and I32".to_string(),
            }
            .to_string(),
            "invalid operand types for add: F64 and I32"
        );
    }

    #[test]
    fn test_error_into_crate_error() {
        let error: crate::Error = EmulationError::DivisionByZero.into();
        assert!(matches!(
            error,
            crate::Error::Emulation(ref inner) if **inner == EmulationError::DivisionByZero
        ));
        assert_eq!(error.to_string(), "Emulation failed: division by zero");
    }
}
