use thiserror::Error;

use crate::emulation::EmulationError;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// # Error Categories
///
/// ## Input Errors
/// - [`Error::Malformed`] - An instruction stream, section table or method body is inconsistent
/// - [`Error::Empty`] - An image or method body without content
/// - [`Error::NotSupported`] - A protection variant that this crate cannot handle
/// - [`Error::GoblinErr`] - PE parsing errors from the goblin crate
///
/// ## Emulation Errors
/// - [`Error::UnsupportedInstruction`] - The emulator met an opcode or operand shape it does not model
/// - [`Error::StackUnderflow`] - A pop on an empty evaluation stack
/// - [`Error::UnresolvedBranch`] - A branch predicate evaluated to an unknown value
/// - [`Error::Emulation`] - Any other typed fault raised while executing an instruction
///
/// ## Deobfuscation Errors
/// - [`Error::DerivationAmbiguous`] - The captured key derivation did not expose two array locals
/// - [`Error::StillObfuscated`] - A rewritten method still carries a dispatcher
/// - [`Error::InconsistentStack`] - A rewritten method enters a block at two stack heights
/// - [`Error::ProtectionFailed`] - A pipeline step could not complete
///
/// # Examples
///
/// ```rust
/// use unconfuse::{emulation::{emulate, EmulationContext}, Error};
/// use unconfuse::assembly::InstructionAssembler;
///
/// let mut asm = InstructionAssembler::new();
/// asm.add()?.ret()?;
///
/// match emulate(&asm.finish()?, EmulationContext::new()) {
///     Err(Error::StackUnderflow { offset }) => assert_eq!(offset, 0),
///     other => panic!("unexpected result: {other:?}"),
/// }
/// # Ok::<(), unconfuse::Error>(())
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The input is structurally invalid.
    ///
    /// Carries the location in this crate that detected the problem, which makes the
    /// many "shape mismatch" paths of the pattern scanners distinguishable in logs.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// Provided input was empty
    #[error("Provided input was empty")]
    Empty,

    /// This protection variant is not supported
    #[error("This protection variant is not supported")]
    NotSupported,

    /// Error from the goblin crate during PE parsing
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// Typed fault raised by the bytecode emulator.
    #[error("Emulation failed: {0}")]
    Emulation(Box<EmulationError>),

    /// The emulator reached an instruction it does not implement.
    ///
    /// Never skipped silently: skipping would corrupt the stack depth of every
    /// following instruction.
    #[error("Unsupported instruction '{mnemonic}' at offset 0x{offset:04X}")]
    UnsupportedInstruction {
        /// Mnemonic of the offending instruction
        mnemonic: &'static str,
        /// Byte offset of the offending instruction
        offset: u64,
    },

    /// An instruction popped from an empty evaluation stack.
    #[error("Evaluation stack underflow at offset 0x{offset:04X}")]
    StackUnderflow {
        /// Byte offset of the offending instruction
        offset: u64,
    },

    /// A conditional or indexed branch depended on an unknown value.
    #[error("Branch outcome at offset 0x{offset:04X} could not be determined")]
    UnresolvedBranch {
        /// Byte offset of the branch instruction
        offset: u64,
    },

    /// The captured key derivation exposed fewer than two array or pointer locals.
    #[error("Key derivation is ambiguous - found {found} array locals, need 2")]
    DerivationAmbiguous {
        /// Number of qualifying locals that were found
        found: usize,
    },

    /// The strict detector still flags a method after it was rewritten.
    #[error("Method '{method}' is still obfuscated after deobfuscation")]
    StillObfuscated {
        /// Name of the method
        method: String,
        /// Instruction listing of the method body, one line per instruction
        dump: Vec<String>,
    },

    /// Two paths enter the same block with different evaluation stack heights.
    #[error("Block at offset 0x{offset:04X} is entered with stack heights {first} and {second}")]
    InconsistentStack {
        /// Offset of the first instruction of the block
        offset: u64,
        /// Height recorded first
        first: usize,
        /// Conflicting height
        second: usize,
    },

    /// A protection removal step could not complete.
    #[error("Failed to remove {protection} protection - {reason}")]
    ProtectionFailed {
        /// Name of the protection
        protection: &'static str,
        /// Description of the failure
        reason: String,
    },
}

impl From<EmulationError> for Error {
    fn from(error: EmulationError) -> Self {
        Error::Emulation(Box::new(error))
    }
}
