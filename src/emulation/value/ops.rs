//! Operations for CIL emulation values.
//!
//! This module defines the operation types used during CIL bytecode emulation:
//!
//! - [`BinaryOp`] - Binary arithmetic and bitwise operations (`add`, `sub`, `mul`, `div`, etc.)
//! - [`UnaryOp`] - Unary operations (`neg`, `not`)
//! - [`CompareOp`] - Comparison operations (`ceq`, `clt`, `cgt`, and the branch predicates)
//! - [`ConversionType`] - Type conversion operations (`conv.i4`, `conv.r8`, etc.)
//!
//! # Operand promotion
//!
//! Integer operands are ranked `int32` < `int64` < `native int`; the narrower operand
//! is widened (sign-extended for [`EmValue::I32`], zero-extended for
//! [`EmValue::U32`]) and the result takes the wider stack type. `F32` mixed with `F64`
//! computes in `F64`. Floats never mix with integers. [`EmValue::Unknown`] in any
//! operand makes the result unknown.
//!
//! Arithmetic wraps on overflow, shift counts are masked to the operand width.
//!
//! # Examples
//!
//! ```rust
//! use unconfuse::emulation::{EmValue, BinaryOp, CompareOp, ConversionType};
//!
//! let a = EmValue::I32(10);
//! let b = EmValue::I32(3);
//! assert_eq!(a.binary_op(&b, BinaryOp::Add)?, EmValue::I32(13));
//! assert_eq!(a.compare(&b, CompareOp::Gt)?, EmValue::I32(1));
//! assert_eq!(EmValue::I32(-1).convert(ConversionType::U4)?, EmValue::U32(u32::MAX));
//! # Ok::<(), unconfuse::Error>(())
//! ```

// CIL emulation requires intentional numeric casts to implement ECMA-335 type conversion
// semantics: signed/unsigned reinterpretation, truncation and widening.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::cast_lossless
)]

use std::fmt;

use crate::{
    emulation::{ArrayRef, EmValue, EmulationError},
    Result,
};

/// Binary operations for CIL arithmetic and bitwise instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// Addition (`add`).
    Add,
    /// Subtraction (`sub`).
    Sub,
    /// Multiplication (`mul`).
    Mul,
    /// Signed division (`div`).
    Div,
    /// Unsigned division (`div.un`).
    DivUn,
    /// Signed remainder (`rem`).
    Rem,
    /// Unsigned remainder (`rem.un`).
    RemUn,
    /// Bitwise AND (`and`).
    And,
    /// Bitwise OR (`or`).
    Or,
    /// Bitwise XOR (`xor`).
    Xor,
    /// Shift left (`shl`).
    Shl,
    /// Arithmetic shift right (`shr`).
    Shr,
    /// Logical shift right (`shr.un`).
    ShrUn,
}

impl BinaryOp {
    /// Returns true for operations that are only defined on integers.
    #[must_use]
    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinaryOp::And
                | BinaryOp::Or
                | BinaryOp::Xor
                | BinaryOp::Shl
                | BinaryOp::Shr
                | BinaryOp::ShrUn
        )
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::DivUn => "div.un",
            BinaryOp::Rem => "rem",
            BinaryOp::RemUn => "rem.un",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Shl => "shl",
            BinaryOp::Shr => "shr",
            BinaryOp::ShrUn => "shr.un",
        };
        write!(f, "{name}")
    }
}

/// Unary operations (`neg`, `not`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// Arithmetic negation.
    Neg,
    /// Bitwise complement.
    Not,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Neg => write!(f, "neg"),
            UnaryOp::Not => write!(f, "not"),
        }
    }
}

/// Comparison operations used by `ceq`/`cgt`/`clt` and the compare-and-branch opcodes.
///
/// The `Un` variants compare integers as unsigned and are true for unordered floats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompareOp {
    /// Equal (`ceq`, `beq`).
    Eq,
    /// Not equal or unordered (`bne.un`).
    Ne,
    /// Signed less than (`clt`, `blt`).
    Lt,
    /// Unsigned less than (`clt.un`, `blt.un`).
    LtUn,
    /// Signed less or equal (`ble`).
    Le,
    /// Unsigned less or equal (`ble.un`).
    LeUn,
    /// Signed greater than (`cgt`, `bgt`).
    Gt,
    /// Unsigned greater than (`cgt.un`, `bgt.un`).
    GtUn,
    /// Signed greater or equal (`bge`).
    Ge,
    /// Unsigned greater or equal (`bge.un`).
    GeUn,
}

impl CompareOp {
    fn is_unsigned(self) -> bool {
        matches!(
            self,
            CompareOp::Ne | CompareOp::LtUn | CompareOp::LeUn | CompareOp::GtUn | CompareOp::GeUn
        )
    }

    fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self {
            CompareOp::Eq => ordering == Equal,
            CompareOp::Ne => ordering != Equal,
            CompareOp::Lt | CompareOp::LtUn => ordering == Less,
            CompareOp::Le | CompareOp::LeUn => ordering != Greater,
            CompareOp::Gt | CompareOp::GtUn => ordering == Greater,
            CompareOp::Ge | CompareOp::GeUn => ordering != Less,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne.un",
            CompareOp::Lt => "lt",
            CompareOp::LtUn => "lt.un",
            CompareOp::Le => "le",
            CompareOp::LeUn => "le.un",
            CompareOp::Gt => "gt",
            CompareOp::GtUn => "gt.un",
            CompareOp::Ge => "ge",
            CompareOp::GeUn => "ge.un",
        };
        write!(f, "{name}")
    }
}

/// Target of a `conv.*` instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConversionType {
    /// `conv.i1`
    I1,
    /// `conv.u1`
    U1,
    /// `conv.i2`
    I2,
    /// `conv.u2`
    U2,
    /// `conv.i4`
    I4,
    /// `conv.u4`
    U4,
    /// `conv.i8`
    I8,
    /// `conv.u8`
    U8,
    /// `conv.i`
    I,
    /// `conv.u`
    U,
    /// `conv.r4`
    R4,
    /// `conv.r8`
    R8,
    /// `conv.r.un`
    RUn,
}

impl fmt::Display for ConversionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConversionType::I1 => "conv.i1",
            ConversionType::U1 => "conv.u1",
            ConversionType::I2 => "conv.i2",
            ConversionType::U2 => "conv.u2",
            ConversionType::I4 => "conv.i4",
            ConversionType::U4 => "conv.u4",
            ConversionType::I8 => "conv.i8",
            ConversionType::U8 => "conv.u8",
            ConversionType::I => "conv.i",
            ConversionType::U => "conv.u",
            ConversionType::R4 => "conv.r4",
            ConversionType::R8 => "conv.r8",
            ConversionType::RUn => "conv.r.un",
        };
        write!(f, "{name}")
    }
}

/// Integer width class of a stack value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Width {
    W32,
    W64,
    Native,
}

/// Operands after promotion to a common stack type.
enum Promoted {
    Int {
        width: Width,
        a: i64,
        b: i64,
        unsigned_result: bool,
    },
    F32(f32, f32),
    F64(f64, f64),
}

fn int_parts(value: &EmValue) -> Option<(Width, i64)> {
    match *value {
        EmValue::I32(v) => Some((Width::W32, i64::from(v))),
        EmValue::U32(v) => Some((Width::W32, i64::from(v))),
        EmValue::I64(v) => Some((Width::W64, v)),
        EmValue::U64(v) => Some((Width::W64, v as i64)),
        EmValue::NativeInt(v) => Some((Width::Native, v)),
        EmValue::NativeUInt(v) => Some((Width::Native, v as i64)),
        _ => None,
    }
}

fn pointer_parts(value: &EmValue) -> Option<(ArrayRef, i64)> {
    match *value {
        EmValue::Array(array) => Some((array, 0)),
        EmValue::ElementPtr { array, byte_offset } => Some((array, byte_offset)),
        _ => None,
    }
}

fn invalid(operation: impl fmt::Display, a: &EmValue, b: &EmValue) -> crate::Error {
    EmulationError::InvalidOperationTypes {
        operation: operation.to_string(),
        operand_types: format!("{} and {}", a.type_name(), b.type_name()),
    }
    .into()
}

fn promote(a: &EmValue, b: &EmValue, operation: impl fmt::Display) -> Result<Promoted> {
    if let (Some((wa, va)), Some((wb, vb))) = (int_parts(a), int_parts(b)) {
        let width = wa.max(wb);
        let unsigned_result = match width {
            Width::W32 => false,
            Width::W64 => matches!((a, b), (EmValue::U64(_), EmValue::U64(_))),
            Width::Native => {
                matches!(a, EmValue::NativeUInt(_)) || matches!(b, EmValue::NativeUInt(_))
            }
        };
        return Ok(Promoted::Int {
            width,
            a: va,
            b: vb,
            unsigned_result,
        });
    }

    match (a, b) {
        (EmValue::F32(x), EmValue::F32(y)) => Ok(Promoted::F32(*x, *y)),
        (EmValue::F32(_) | EmValue::F64(_), EmValue::F32(_) | EmValue::F64(_)) => Ok(
            Promoted::F64(a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default()),
        ),
        _ => Err(invalid(operation, a, b)),
    }
}

fn int_result(width: Width, value: i64, unsigned_result: bool) -> EmValue {
    match (width, unsigned_result) {
        (Width::W32, _) => EmValue::I32(value as i32),
        (Width::W64, false) => EmValue::I64(value),
        (Width::W64, true) => EmValue::U64(value as u64),
        (Width::Native, false) => EmValue::NativeInt(value),
        (Width::Native, true) => EmValue::NativeUInt(value as u64),
    }
}

fn asymmetric(op: BinaryOp) -> crate::Error {
    EmulationError::InvalidOperationTypes {
        operation: op.to_string(),
        operand_types: "shift count promoted as operand".to_string(),
    }
    .into()
}

fn int_binary(op: BinaryOp, width: Width, a: i64, b: i64) -> Result<i64> {
    let narrow = width == Width::W32;
    let divisor_zero = if narrow { b as i32 == 0 } else { b == 0 };
    if divisor_zero
        && matches!(
            op,
            BinaryOp::Div | BinaryOp::DivUn | BinaryOp::Rem | BinaryOp::RemUn
        )
    {
        return Err(EmulationError::DivisionByZero.into());
    }

    let value = if narrow {
        let (x, y) = (a as i32, b as i32);
        let result = match op {
            BinaryOp::Add => x.wrapping_add(y),
            BinaryOp::Sub => x.wrapping_sub(y),
            BinaryOp::Mul => x.wrapping_mul(y),
            BinaryOp::Div => {
                if x == i32::MIN && y == -1 {
                    return Err(EmulationError::ArithmeticOverflow.into());
                }
                x / y
            }
            BinaryOp::DivUn => ((x as u32) / (y as u32)) as i32,
            BinaryOp::Rem => x.wrapping_rem(y),
            BinaryOp::RemUn => ((x as u32) % (y as u32)) as i32,
            BinaryOp::And => x & y,
            BinaryOp::Or => x | y,
            BinaryOp::Xor => x ^ y,
            BinaryOp::Shl | BinaryOp::Shr | BinaryOp::ShrUn => return Err(asymmetric(op)),
        };
        i64::from(result)
    } else {
        match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div => {
                if a == i64::MIN && b == -1 {
                    return Err(EmulationError::ArithmeticOverflow.into());
                }
                a / b
            }
            BinaryOp::DivUn => ((a as u64) / (b as u64)) as i64,
            BinaryOp::Rem => a.wrapping_rem(b),
            BinaryOp::RemUn => ((a as u64) % (b as u64)) as i64,
            BinaryOp::And => a & b,
            BinaryOp::Or => a | b,
            BinaryOp::Xor => a ^ b,
            BinaryOp::Shl | BinaryOp::Shr | BinaryOp::ShrUn => return Err(asymmetric(op)),
        }
    };
    Ok(value)
}

impl EmValue {
    /// Performs a binary operation on this value and `other`.
    ///
    /// # Errors
    ///
    /// Returns [`EmulationError::InvalidOperationTypes`] for operand types the operation
    /// is not defined on, [`EmulationError::DivisionByZero`] for integer division or
    /// remainder by zero and [`EmulationError::ArithmeticOverflow`] for `MIN / -1`.
    pub fn binary_op(&self, other: &Self, op: BinaryOp) -> Result<Self> {
        if self.is_unknown() || other.is_unknown() {
            return Ok(EmValue::Unknown);
        }

        if matches!(op, BinaryOp::Shl | BinaryOp::Shr | BinaryOp::ShrUn) {
            return self.shift(other, op);
        }

        if let Some(result) = self.pointer_arithmetic(other, op)? {
            return Ok(result);
        }

        match promote(self, other, op)? {
            Promoted::Int {
                width,
                a,
                b,
                unsigned_result,
            } => Ok(int_result(width, int_binary(op, width, a, b)?, unsigned_result)),
            Promoted::F32(a, b) => match op {
                BinaryOp::Add => Ok(EmValue::F32(a + b)),
                BinaryOp::Sub => Ok(EmValue::F32(a - b)),
                BinaryOp::Mul => Ok(EmValue::F32(a * b)),
                BinaryOp::Div => Ok(EmValue::F32(a / b)),
                BinaryOp::Rem => Ok(EmValue::F32(a % b)),
                _ => Err(invalid(op, self, other)),
            },
            Promoted::F64(a, b) => match op {
                BinaryOp::Add => Ok(EmValue::F64(a + b)),
                BinaryOp::Sub => Ok(EmValue::F64(a - b)),
                BinaryOp::Mul => Ok(EmValue::F64(a * b)),
                BinaryOp::Div => Ok(EmValue::F64(a / b)),
                BinaryOp::Rem => Ok(EmValue::F64(a % b)),
                _ => Err(invalid(op, self, other)),
            },
        }
    }

    fn pointer_arithmetic(&self, other: &Self, op: BinaryOp) -> Result<Option<Self>> {
        let left = pointer_parts(self);
        let right = pointer_parts(other);
        if left.is_none() && right.is_none() {
            return Ok(None);
        }

        let result = match (op, left, right) {
            (BinaryOp::Add, Some((array, offset)), None) => int_parts(other).map(|(_, delta)| {
                EmValue::ElementPtr {
                    array,
                    byte_offset: offset.wrapping_add(delta),
                }
            }),
            (BinaryOp::Add, None, Some((array, offset))) => int_parts(self).map(|(_, delta)| {
                EmValue::ElementPtr {
                    array,
                    byte_offset: offset.wrapping_add(delta),
                }
            }),
            (BinaryOp::Sub, Some((array, offset)), None) => int_parts(other).map(|(_, delta)| {
                EmValue::ElementPtr {
                    array,
                    byte_offset: offset.wrapping_sub(delta),
                }
            }),
            (BinaryOp::Sub, Some((a, x)), Some((b, y))) if a == b => {
                Some(EmValue::NativeInt(x.wrapping_sub(y)))
            }
            _ => None,
        };

        result.map(Some).ok_or_else(|| invalid(op, self, other))
    }

    fn shift(&self, amount: &Self, op: BinaryOp) -> Result<Self> {
        let Some((_, count)) = int_parts(amount) else {
            return Err(invalid(op, self, amount));
        };

        let result = match *self {
            EmValue::I32(_) | EmValue::U32(_) => {
                let value = self.as_i32().unwrap_or_default();
                let count = count as u32;
                EmValue::I32(match op {
                    BinaryOp::Shl => value.wrapping_shl(count),
                    BinaryOp::Shr => value.wrapping_shr(count),
                    _ => (value as u32).wrapping_shr(count) as i32,
                })
            }
            EmValue::I64(value) | EmValue::NativeInt(value) => {
                let count = count as u32;
                let shifted = match op {
                    BinaryOp::Shl => value.wrapping_shl(count),
                    BinaryOp::Shr => value.wrapping_shr(count),
                    _ => (value as u64).wrapping_shr(count) as i64,
                };
                if matches!(self, EmValue::I64(_)) {
                    EmValue::I64(shifted)
                } else {
                    EmValue::NativeInt(shifted)
                }
            }
            EmValue::U64(value) | EmValue::NativeUInt(value) => {
                let count = count as u32;
                let shifted = match op {
                    BinaryOp::Shl => value.wrapping_shl(count),
                    BinaryOp::Shr => (value as i64).wrapping_shr(count) as u64,
                    _ => value.wrapping_shr(count),
                };
                if matches!(self, EmValue::U64(_)) {
                    EmValue::U64(shifted)
                } else {
                    EmValue::NativeUInt(shifted)
                }
            }
            _ => return Err(invalid(op, self, amount)),
        };
        Ok(result)
    }

    /// Performs a unary operation on this value.
    ///
    /// # Errors
    ///
    /// Returns [`EmulationError::InvalidOperationTypes`] for references, and for `not`
    /// on floats.
    pub fn unary_op(&self, op: UnaryOp) -> Result<Self> {
        let invalid_unary = || -> crate::Error {
            EmulationError::InvalidOperationTypes {
                operation: op.to_string(),
                operand_types: self.type_name().to_string(),
            }
            .into()
        };

        let result = match (op, self) {
            (_, EmValue::Unknown) => EmValue::Unknown,
            (UnaryOp::Neg, EmValue::I32(_) | EmValue::U32(_)) => {
                EmValue::I32(self.as_i32().unwrap_or_default().wrapping_neg())
            }
            (UnaryOp::Not, EmValue::I32(_) | EmValue::U32(_)) => {
                EmValue::I32(!self.as_i32().unwrap_or_default())
            }
            (UnaryOp::Neg, EmValue::I64(v)) => EmValue::I64(v.wrapping_neg()),
            (UnaryOp::Not, EmValue::I64(v)) => EmValue::I64(!v),
            (UnaryOp::Neg, EmValue::U64(v)) => EmValue::U64(v.wrapping_neg()),
            (UnaryOp::Not, EmValue::U64(v)) => EmValue::U64(!v),
            (UnaryOp::Neg, EmValue::NativeInt(v)) => EmValue::NativeInt(v.wrapping_neg()),
            (UnaryOp::Not, EmValue::NativeInt(v)) => EmValue::NativeInt(!v),
            (UnaryOp::Neg, EmValue::NativeUInt(v)) => EmValue::NativeUInt(v.wrapping_neg()),
            (UnaryOp::Not, EmValue::NativeUInt(v)) => EmValue::NativeUInt(!v),
            (UnaryOp::Neg, EmValue::F32(v)) => EmValue::F32(-v),
            (UnaryOp::Neg, EmValue::F64(v)) => EmValue::F64(-v),
            _ => return Err(invalid_unary()),
        };
        Ok(result)
    }

    /// Compares this value with `other`.
    ///
    /// Returns `I32(1)` when the comparison holds, `I32(0)` when it does not and
    /// [`EmValue::Unknown`] when either operand is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`EmulationError::InvalidOperationTypes`] for operand pairs that have no
    /// defined ordering, such as a string against an integer.
    pub fn compare(&self, other: &Self, op: CompareOp) -> Result<Self> {
        if self.is_unknown() || other.is_unknown() {
            return Ok(EmValue::Unknown);
        }

        if let (Some((a, x)), Some((b, y))) = (pointer_parts(self), pointer_parts(other)) {
            if a == b {
                let ordering = if op.is_unsigned() {
                    (x as u64).cmp(&(y as u64))
                } else {
                    x.cmp(&y)
                };
                return Ok(EmValue::from(op.holds(ordering)));
            }
        }

        if self.is_reference() || other.is_reference() {
            return self.compare_references(other, op);
        }

        let holds = match promote(self, other, op)? {
            Promoted::Int { width, a, b, .. } => {
                let ordering = match (width, op.is_unsigned()) {
                    (Width::W32, false) => (a as i32).cmp(&(b as i32)),
                    (Width::W32, true) => (a as u32).cmp(&(b as u32)),
                    (_, false) => a.cmp(&b),
                    (_, true) => (a as u64).cmp(&(b as u64)),
                };
                op.holds(ordering)
            }
            Promoted::F32(a, b) => compare_floats(f64::from(a), f64::from(b), op),
            Promoted::F64(a, b) => compare_floats(a, b, op),
        };
        Ok(EmValue::from(holds))
    }

    fn compare_references(&self, other: &Self, op: CompareOp) -> Result<Self> {
        let is_null = |value: &EmValue| match value {
            EmValue::Null => Some(true),
            v if v.is_reference() => Some(false),
            v => v.as_i64().map(|n| n == 0),
        };
        let (Some(left_null), Some(right_null)) = (is_null(self), is_null(other)) else {
            return Err(invalid(op, self, other));
        };

        let same = match (self, other) {
            (EmValue::Str(a), EmValue::Str(b)) => a == b,
            (EmValue::Bytes(a), EmValue::Bytes(b)) => std::rc::Rc::ptr_eq(a, b),
            (EmValue::Array(a), EmValue::Array(b)) => a == b,
            (EmValue::Token(a), EmValue::Token(b)) => a == b,
            (EmValue::ElementPtr { .. }, EmValue::ElementPtr { .. }) => self == other,
            _ => left_null && right_null,
        };

        let holds = match op {
            CompareOp::Eq => same,
            CompareOp::Ne => !same,
            CompareOp::GtUn => !left_null && right_null,
            CompareOp::LtUn => left_null && !right_null,
            CompareOp::GeUn => same || (!left_null && right_null),
            CompareOp::LeUn => same || (left_null && !right_null),
            _ => return Err(invalid(op, self, other)),
        };
        Ok(EmValue::from(holds))
    }

    /// Converts this value as a `conv.*` instruction would.
    ///
    /// References and pointers pass through `conv.i`, `conv.u`, `conv.i8` and
    /// `conv.u8` unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`EmulationError::InvalidOperationTypes`] for references converted to
    /// any other type.
    pub fn convert(&self, conversion: ConversionType) -> Result<Self> {
        if self.is_unknown() {
            return Ok(EmValue::Unknown);
        }

        if self.is_reference() {
            return match conversion {
                ConversionType::I | ConversionType::U | ConversionType::I8 | ConversionType::U8 => {
                    Ok(self.clone())
                }
                _ => Err(EmulationError::InvalidOperationTypes {
                    operation: conversion.to_string(),
                    operand_types: self.type_name().to_string(),
                }
                .into()),
            };
        }

        if let Some(value) = self.as_f64() {
            return Ok(match conversion {
                ConversionType::R4 => EmValue::F32(value as f32),
                ConversionType::R8 | ConversionType::RUn => EmValue::F64(value),
                ConversionType::U8 | ConversionType::U => {
                    from_integer(conversion, value as i64, value as u64)
                }
                _ => from_integer(conversion, value as i64, value as i64 as u64),
            });
        }

        let Some((width, bits)) = int_parts(self) else {
            return Err(EmulationError::ValueConversion {
                from: self.type_name(),
                to: "number",
            }
            .into());
        };
        let (signed, unsigned) = if width == Width::W32 {
            (i64::from(bits as i32), u64::from(bits as u32))
        } else {
            (bits, bits as u64)
        };

        Ok(match conversion {
            ConversionType::R4 => EmValue::F32(signed as f32),
            ConversionType::R8 => EmValue::F64(signed as f64),
            ConversionType::RUn => EmValue::F64(unsigned as f64),
            _ => from_integer(conversion, signed, unsigned),
        })
    }
}

fn from_integer(conversion: ConversionType, signed: i64, unsigned: u64) -> EmValue {
    match conversion {
        ConversionType::I1 => EmValue::I32(i32::from(signed as i8)),
        ConversionType::U1 => EmValue::I32(i32::from(signed as u8)),
        ConversionType::I2 => EmValue::I32(i32::from(signed as i16)),
        ConversionType::U2 => EmValue::I32(i32::from(signed as u16)),
        ConversionType::I4 => EmValue::I32(signed as i32),
        ConversionType::U4 => EmValue::U32(signed as u32),
        ConversionType::I8 => EmValue::I64(signed),
        ConversionType::U8 => EmValue::U64(unsigned),
        ConversionType::I => EmValue::NativeInt(signed),
        ConversionType::U => EmValue::NativeUInt(unsigned),
        ConversionType::R4 => EmValue::F32(signed as f32),
        ConversionType::R8 => EmValue::F64(signed as f64),
        ConversionType::RUn => EmValue::F64(unsigned as f64),
    }
}

fn compare_floats(a: f64, b: f64, op: CompareOp) -> bool {
    match a.partial_cmp(&b) {
        Some(ordering) => op.holds(ordering),
        None => op.is_unsigned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn is_emulation_error(result: &Result<EmValue>, expected: &EmulationError) -> bool {
        matches!(result, Err(Error::Emulation(ref e)) if e.as_ref() == expected)
    }

    #[test]
    fn test_int32_arithmetic_wraps() {
        let max = EmValue::I32(i32::MAX);
        assert_eq!(
            max.binary_op(&EmValue::I32(1), BinaryOp::Add).unwrap(),
            EmValue::I32(i32::MIN)
        );
        assert_eq!(
            EmValue::I32(0x1000_0000)
                .binary_op(&EmValue::I32(0x10), BinaryOp::Mul)
                .unwrap(),
            EmValue::I32(0)
        );
        assert_eq!(
            EmValue::I32(7).binary_op(&EmValue::I32(-2), BinaryOp::Rem).unwrap(),
            EmValue::I32(1)
        );
    }

    #[test]
    fn test_mixed_int32_and_uint32() {
        let sum = EmValue::U32(u32::MAX)
            .binary_op(&EmValue::I32(2), BinaryOp::Add)
            .unwrap();
        assert_eq!(sum, EmValue::I32(1));

        let xor = EmValue::U32(0xF0F0_F0F0)
            .binary_op(&EmValue::U32(0x0F0F_0F0F), BinaryOp::Xor)
            .unwrap();
        assert_eq!(xor.as_u32(), Some(u32::MAX));
    }

    #[test]
    fn test_widening_to_native_and_int64() {
        assert_eq!(
            EmValue::I32(-1)
                .binary_op(&EmValue::NativeInt(1), BinaryOp::Add)
                .unwrap(),
            EmValue::NativeInt(0)
        );
        assert_eq!(
            EmValue::U32(u32::MAX)
                .binary_op(&EmValue::I64(1), BinaryOp::Add)
                .unwrap(),
            EmValue::I64(0x1_0000_0000)
        );
        assert_eq!(
            EmValue::I64(5).binary_op(&EmValue::U64(3), BinaryOp::Sub).unwrap(),
            EmValue::I64(2)
        );
    }

    #[test]
    fn test_float_promotion() {
        assert_eq!(
            EmValue::F32(1.5)
                .binary_op(&EmValue::F64(2.0), BinaryOp::Mul)
                .unwrap(),
            EmValue::F64(3.0)
        );
        assert_eq!(
            EmValue::F32(1.0)
                .binary_op(&EmValue::F32(0.5), BinaryOp::Sub)
                .unwrap(),
            EmValue::F32(0.5)
        );
        let mixed = EmValue::F64(1.0).binary_op(&EmValue::I32(1), BinaryOp::Add);
        assert!(matches!(
            mixed,
            Err(Error::Emulation(ref e)) if matches!(e.as_ref(), EmulationError::InvalidOperationTypes { .. })
        ));
        assert!(EmValue::F64(1.0)
            .binary_op(&EmValue::F64(1.0), BinaryOp::Xor)
            .is_err());
    }

    #[test]
    fn test_unknown_propagates() {
        assert_eq!(
            EmValue::Unknown
                .binary_op(&EmValue::I32(1), BinaryOp::Add)
                .unwrap(),
            EmValue::Unknown
        );
        assert_eq!(
            EmValue::I32(1)
                .compare(&EmValue::Unknown, CompareOp::Eq)
                .unwrap(),
            EmValue::Unknown
        );
        assert_eq!(
            EmValue::Unknown.convert(ConversionType::U4).unwrap(),
            EmValue::Unknown
        );
    }

    #[test]
    fn test_division_faults() {
        let zero = EmValue::I32(10).binary_op(&EmValue::I32(0), BinaryOp::Div);
        assert!(is_emulation_error(&zero, &EmulationError::DivisionByZero));

        let zero_un = EmValue::I64(10).binary_op(&EmValue::I64(0), BinaryOp::RemUn);
        assert!(is_emulation_error(&zero_un, &EmulationError::DivisionByZero));

        let overflow = EmValue::I32(i32::MIN).binary_op(&EmValue::I32(-1), BinaryOp::Div);
        assert!(is_emulation_error(
            &overflow,
            &EmulationError::ArithmeticOverflow
        ));

        assert_eq!(
            EmValue::I32(i32::MIN)
                .binary_op(&EmValue::I32(-1), BinaryOp::Rem)
                .unwrap(),
            EmValue::I32(0)
        );
        assert_eq!(
            EmValue::I32(-2)
                .binary_op(&EmValue::I32(2), BinaryOp::DivUn)
                .unwrap(),
            EmValue::I32(0x7FFF_FFFF)
        );
    }

    #[test]
    fn test_shifts_mask_count() {
        assert_eq!(
            EmValue::I32(1).binary_op(&EmValue::I32(33), BinaryOp::Shl).unwrap(),
            EmValue::I32(2)
        );
        assert_eq!(
            EmValue::I32(-8).binary_op(&EmValue::I32(1), BinaryOp::Shr).unwrap(),
            EmValue::I32(-4)
        );
        assert_eq!(
            EmValue::I32(-8)
                .binary_op(&EmValue::I32(28), BinaryOp::ShrUn)
                .unwrap(),
            EmValue::I32(0xF)
        );
        assert_eq!(
            EmValue::I64(1).binary_op(&EmValue::I32(65), BinaryOp::Shl).unwrap(),
            EmValue::I64(2)
        );
    }

    #[test]
    fn test_pointer_arithmetic() {
        let array = EmValue::Array(ArrayRef(3));
        let ptr = array.binary_op(&EmValue::I32(8), BinaryOp::Add).unwrap();
        assert_eq!(
            ptr,
            EmValue::ElementPtr {
                array: ArrayRef(3),
                byte_offset: 8
            }
        );
        let back = ptr.binary_op(&EmValue::NativeInt(4), BinaryOp::Sub).unwrap();
        assert_eq!(
            back.binary_op(&array, BinaryOp::Sub).unwrap(),
            EmValue::NativeInt(4)
        );
        assert!(EmValue::Array(ArrayRef(1))
            .binary_op(&EmValue::Array(ArrayRef(2)), BinaryOp::Sub)
            .is_err());
    }

    #[test]
    fn test_signed_versus_unsigned_compare() {
        let minus_one = EmValue::I32(-1);
        let one = EmValue::I32(1);
        assert_eq!(
            minus_one.compare(&one, CompareOp::Ge).unwrap(),
            EmValue::I32(0)
        );
        assert_eq!(
            minus_one.compare(&one, CompareOp::GeUn).unwrap(),
            EmValue::I32(1)
        );
        assert_eq!(
            EmValue::U32(u32::MAX).compare(&one, CompareOp::Gt).unwrap(),
            EmValue::I32(0)
        );
    }

    #[test]
    fn test_float_compare_unordered() {
        let nan = EmValue::F64(f64::NAN);
        let one = EmValue::F64(1.0);
        assert_eq!(nan.compare(&one, CompareOp::Lt).unwrap(), EmValue::I32(0));
        assert_eq!(nan.compare(&one, CompareOp::LtUn).unwrap(), EmValue::I32(1));
        assert_eq!(nan.compare(&nan, CompareOp::Eq).unwrap(), EmValue::I32(0));
    }

    #[test]
    fn test_reference_compare() {
        let s = EmValue::from("x");
        assert_eq!(
            s.compare(&EmValue::Null, CompareOp::GtUn).unwrap(),
            EmValue::I32(1)
        );
        assert_eq!(
            EmValue::Null.compare(&EmValue::Null, CompareOp::Eq).unwrap(),
            EmValue::I32(1)
        );
        assert_eq!(
            s.compare(&EmValue::from("x"), CompareOp::Eq).unwrap(),
            EmValue::I32(1)
        );
        assert!(s.compare(&EmValue::I32(3), CompareOp::Lt).is_err());
    }

    #[test]
    fn test_conversions() {
        assert_eq!(
            EmValue::I32(0x1234).convert(ConversionType::U1).unwrap(),
            EmValue::I32(0x34)
        );
        assert_eq!(
            EmValue::I32(0xFF).convert(ConversionType::I1).unwrap(),
            EmValue::I32(-1)
        );
        assert_eq!(
            EmValue::I32(-1).convert(ConversionType::U8).unwrap(),
            EmValue::U64(0xFFFF_FFFF)
        );
        assert_eq!(
            EmValue::I32(-1).convert(ConversionType::I8).unwrap(),
            EmValue::I64(-1)
        );
        assert_eq!(
            EmValue::I64(0x1_0000_0005).convert(ConversionType::I4).unwrap(),
            EmValue::I32(5)
        );
        assert_eq!(
            EmValue::F64(3.9).convert(ConversionType::I4).unwrap(),
            EmValue::I32(3)
        );
        assert_eq!(
            EmValue::I32(-1).convert(ConversionType::RUn).unwrap(),
            EmValue::F64(4_294_967_295.0)
        );
        let array = EmValue::Array(ArrayRef(0));
        assert_eq!(array.convert(ConversionType::I).unwrap(), array);
        assert!(array.convert(ConversionType::I4).is_err());
    }

    #[test]
    fn test_unary_ops() {
        assert_eq!(
            EmValue::I32(i32::MIN).unary_op(UnaryOp::Neg).unwrap(),
            EmValue::I32(i32::MIN)
        );
        assert_eq!(
            EmValue::U32(0).unary_op(UnaryOp::Not).unwrap(),
            EmValue::I32(-1)
        );
        assert_eq!(
            EmValue::F64(2.0).unary_op(UnaryOp::Neg).unwrap(),
            EmValue::F64(-2.0)
        );
        assert!(EmValue::F64(2.0).unary_op(UnaryOp::Not).is_err());
        assert!(EmValue::Null.unary_op(UnaryOp::Neg).is_err());
    }
}
