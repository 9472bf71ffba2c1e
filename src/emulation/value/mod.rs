//! Runtime values of the emulator.
//!
//! [`EmValue`] covers everything that can sit on the evaluation stack, in a local or in
//! an argument slot while a ConfuserEx helper runs: the CIL numeric stack types, the
//! handful of reference shapes the helpers touch (strings, arrays, interior array
//! pointers, metadata handles, byte blobs) and [`EmValue::Unknown`] for anything the
//! emulator cannot know, such as the result of an unmodelled external call.
//!
//! Arithmetic, comparison and conversion live in [`ops`].

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_lossless
)]

use std::{fmt, rc::Rc};

use crate::{emulation::ArrayRef, metadata::token::Token};

pub mod ops;

/// Runtime value during CIL emulation.
///
/// # CIL Type Mapping
///
/// | CIL Type | EmValue Variant |
/// |----------|-----------------|
/// | `int8`, `int16`, `int32`, `bool`, `char` | [`EmValue::I32`] |
/// | `uint32` (from `conv.u4`, `ldelem.u4`, `ldind.u4`) | [`EmValue::U32`] |
/// | `int64` | [`EmValue::I64`] |
/// | `uint64` | [`EmValue::U64`] |
/// | `float32` | [`EmValue::F32`] |
/// | `float64` | [`EmValue::F64`] |
/// | `native int` | [`EmValue::NativeInt`] |
/// | `native uint` | [`EmValue::NativeUInt`] |
/// | `null` | [`EmValue::Null`] |
/// | `string` | [`EmValue::Str`] |
/// | `T[]` | [`EmValue::Array`] |
/// | `T&` / `T*` into an array | [`EmValue::ElementPtr`] |
///
/// `I32` and `U32` are the same stack type; arithmetic mixing them yields `I32`,
/// and unsigned opcodes reinterpret the bits of either.
#[derive(Clone, Debug, PartialEq)]
pub enum EmValue {
    /// 32-bit signed integer.
    I32(i32),
    /// 32-bit integer carrying the unsigned view.
    U32(u32),
    /// 64-bit signed integer.
    I64(i64),
    /// 64-bit unsigned integer.
    U64(u64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// Native-sized signed integer (64-bit host).
    NativeInt(i64),
    /// Native-sized unsigned integer (64-bit host).
    NativeUInt(u64),
    /// Null reference.
    Null,
    /// String reference.
    Str(Rc<str>),
    /// Array reference.
    Array(ArrayRef),
    /// Interior pointer into an array, `byte_offset` bytes from its first element.
    ElementPtr {
        /// The array pointed into
        array: ArrayRef,
        /// Byte offset from element 0
        byte_offset: i64,
    },
    /// Runtime handle produced by `ldtoken`.
    Token(Token),
    /// Opaque byte blob (signature blobs returned by reflection calls).
    Bytes(Rc<[u8]>),
    /// A value the emulator cannot determine.
    Unknown,
}

impl EmValue {
    /// Short name of the variant, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            EmValue::I32(_) => "I32",
            EmValue::U32(_) => "U32",
            EmValue::I64(_) => "I64",
            EmValue::U64(_) => "U64",
            EmValue::F32(_) => "F32",
            EmValue::F64(_) => "F64",
            EmValue::NativeInt(_) => "NativeInt",
            EmValue::NativeUInt(_) => "NativeUInt",
            EmValue::Null => "Null",
            EmValue::Str(_) => "Str",
            EmValue::Array(_) => "Array",
            EmValue::ElementPtr { .. } => "ElementPtr",
            EmValue::Token(_) => "Token",
            EmValue::Bytes(_) => "Bytes",
            EmValue::Unknown => "Unknown",
        }
    }

    /// Returns true for [`EmValue::Unknown`].
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        matches!(self, EmValue::Unknown)
    }

    /// Returns true for [`EmValue::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, EmValue::Null)
    }

    /// Returns true for object references, pointers and handles (null included).
    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            EmValue::Null
                | EmValue::Str(_)
                | EmValue::Array(_)
                | EmValue::ElementPtr { .. }
                | EmValue::Token(_)
                | EmValue::Bytes(_)
        )
    }

    /// Returns true for the integer variants.
    #[must_use]
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            EmValue::I32(_)
                | EmValue::U32(_)
                | EmValue::I64(_)
                | EmValue::U64(_)
                | EmValue::NativeInt(_)
                | EmValue::NativeUInt(_)
        )
    }

    /// The value as `i32` for the 32-bit integer variants.
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            EmValue::I32(v) => Some(v),
            EmValue::U32(v) => Some(v as i32),
            _ => None,
        }
    }

    /// The value as `u32` for the 32-bit integer variants.
    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        self.as_i32().map(|v| v as u32)
    }

    /// The value widened to `i64` (`U32` zero-extends, `I32` sign-extends).
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            EmValue::I32(v) => Some(i64::from(v)),
            EmValue::U32(v) => Some(i64::from(v)),
            EmValue::I64(v) | EmValue::NativeInt(v) => Some(v),
            EmValue::U64(v) | EmValue::NativeUInt(v) => Some(v as i64),
            _ => None,
        }
    }

    /// The value as `f64` for float variants.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            EmValue::F32(v) => Some(f64::from(v)),
            EmValue::F64(v) => Some(v),
            _ => None,
        }
    }

    /// The string payload of [`EmValue::Str`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            EmValue::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Branch predicate view of the value.
    ///
    /// Integers are true when non-zero, floats when non-zero, `Null` is false and any
    /// other reference is true. Returns `None` for [`EmValue::Unknown`].
    #[must_use]
    pub fn truthy(&self) -> Option<bool> {
        match self {
            EmValue::Unknown => None,
            EmValue::Null => Some(false),
            EmValue::F32(v) => Some(*v != 0.0),
            EmValue::F64(v) => Some(*v != 0.0),
            other => match other.as_i64() {
                Some(v) => Some(v != 0),
                None => Some(true),
            },
        }
    }
}

impl fmt::Display for EmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmValue::I32(v) => write!(f, "{v}"),
            EmValue::U32(v) => write!(f, "{v}u"),
            EmValue::I64(v) => write!(f, "{v}L"),
            EmValue::U64(v) => write!(f, "{v}UL"),
            EmValue::F32(v) => write!(f, "{v}f"),
            EmValue::F64(v) => write!(f, "{v}"),
            EmValue::NativeInt(v) => write!(f, "(nint){v}"),
            EmValue::NativeUInt(v) => write!(f, "(nuint){v}"),
            EmValue::Null => write!(f, "null"),
            EmValue::Str(v) => write!(f, "{v:?}"),
            EmValue::Array(array) => write!(f, "{array}"),
            EmValue::ElementPtr { array, byte_offset } => write!(f, "&{array}+{byte_offset}"),
            EmValue::Token(token) => write!(f, "handle({token})"),
            EmValue::Bytes(bytes) => write!(f, "bytes[{}]", bytes.len()),
            EmValue::Unknown => write!(f, "?"),
        }
    }
}

impl From<i32> for EmValue {
    fn from(value: i32) -> Self {
        EmValue::I32(value)
    }
}

impl From<u32> for EmValue {
    fn from(value: u32) -> Self {
        EmValue::U32(value)
    }
}

impl From<i64> for EmValue {
    fn from(value: i64) -> Self {
        EmValue::I64(value)
    }
}

impl From<f64> for EmValue {
    fn from(value: f64) -> Self {
        EmValue::F64(value)
    }
}

impl From<bool> for EmValue {
    fn from(value: bool) -> Self {
        EmValue::I32(i32::from(value))
    }
}

impl From<&str> for EmValue {
    fn from(value: &str) -> Self {
        EmValue::Str(Rc::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert_eq!(EmValue::I32(0).truthy(), Some(false));
        assert_eq!(EmValue::I32(-3).truthy(), Some(true));
        assert_eq!(EmValue::U32(0).truthy(), Some(false));
        assert_eq!(EmValue::Null.truthy(), Some(false));
        assert_eq!(EmValue::from("x").truthy(), Some(true));
        assert_eq!(EmValue::Array(ArrayRef(0)).truthy(), Some(true));
        assert_eq!(EmValue::Unknown.truthy(), None);
    }

    #[test]
    fn test_integer_views() {
        assert_eq!(EmValue::U32(u32::MAX).as_i32(), Some(-1));
        assert_eq!(EmValue::U32(u32::MAX).as_i64(), Some(i64::from(u32::MAX)));
        assert_eq!(EmValue::I32(-1).as_i64(), Some(-1));
        assert_eq!(EmValue::I32(-1).as_u32(), Some(u32::MAX));
        assert_eq!(EmValue::F64(1.0).as_i64(), None);
    }

    #[test]
    fn test_classification() {
        assert!(EmValue::Null.is_reference());
        assert!(EmValue::Token(Token::new(0x0400_0001)).is_reference());
        assert!(!EmValue::I32(1).is_reference());
        assert!(EmValue::NativeUInt(4).is_integer());
        assert!(EmValue::Unknown.is_unknown());
    }

    #[test]
    fn test_display() {
        assert_eq!(EmValue::I32(-5).to_string(), "-5");
        assert_eq!(EmValue::U32(5).to_string(), "5u");
        assert_eq!(EmValue::from("a").to_string(), "\"a\"");
        assert_eq!(
            EmValue::ElementPtr {
                array: ArrayRef(2),
                byte_offset: 8
            }
            .to_string(),
            "&array#2+8"
        );
    }
}
