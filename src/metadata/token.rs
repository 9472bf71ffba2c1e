//! Metadata token representation.
//!
//! A token is a 32-bit value whose high byte selects a metadata table and whose low
//! 24 bits select a row inside that table. Tokens appear as instruction operands
//! (`call`, `ldsfld`, `ldtoken`, ...) and identify the methods, fields and member
//! references of a [`crate::metadata::Module`].
//!
//! # Examples
//!
//! ```rust
//! use unconfuse::metadata::token::{Token, TableId};
//!
//! let token = Token::new(0x0A00_0012);
//! assert_eq!(token.table(), TableId::MemberRef as u8);
//! assert_eq!(token.row(), 0x12);
//! assert!(token.is_method_like());
//! ```

use std::fmt;

/// Metadata tables that tokens produced by the protections refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TableId {
    /// `TypeRef` table (0x01)
    TypeRef = 0x01,
    /// `TypeDef` table (0x02)
    TypeDef = 0x02,
    /// `Field` table (0x04)
    Field = 0x04,
    /// `MethodDef` table (0x06)
    MethodDef = 0x06,
    /// `MemberRef` table (0x0A)
    MemberRef = 0x0A,
    /// `TypeSpec` table (0x1B)
    TypeSpec = 0x1B,
    /// `MethodSpec` table (0x2B)
    MethodSpec = 0x2B,
}

/// A metadata token: table identifier in the high byte, row in the low 24 bits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Token(pub u32);

impl Token {
    /// Creates a new token from its raw value.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Creates a token from a table and a row.
    #[must_use]
    pub fn from_parts(table: TableId, row: u32) -> Self {
        Token((u32::from(table as u8) << 24) | (row & 0x00FF_FFFF))
    }

    /// Returns the raw value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Returns the table byte.
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Returns the row index.
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns true for the null token.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if the token refers to something callable: a method definition, a
    /// member reference or a generic method instantiation.
    #[must_use]
    pub fn is_method_like(&self) -> bool {
        let table = self.table();
        table == TableId::MethodDef as u8
            || table == TableId::MemberRef as u8
            || table == TableId::MethodSpec as u8
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_parts() {
        let token = Token::new(0x06000001);
        assert_eq!(token.table(), 0x06);
        assert_eq!(token.row(), 1);
        assert!(!token.is_null());
        assert!(Token::default().is_null());
    }

    #[test]
    fn test_token_from_parts() {
        let token = Token::from_parts(TableId::Field, 0x1234);
        assert_eq!(token.value(), 0x0400_1234);

        let truncated = Token::from_parts(TableId::MethodDef, 0xFF00_0001);
        assert_eq!(truncated.value(), 0x0600_0001);
    }

    #[test]
    fn test_token_is_method_like() {
        assert!(Token::new(0x06000001).is_method_like());
        assert!(Token::new(0x0A000001).is_method_like());
        assert!(Token::new(0x2B000001).is_method_like());
        assert!(!Token::new(0x04000001).is_method_like());
        assert!(!Token::new(0x02000001).is_method_like());
    }

    #[test]
    fn test_token_display() {
        assert_eq!(format!("{}", Token(0x06000001)), "0x06000001");
        assert_eq!(
            format!("{:?}", Token(0x06000001)),
            "Token(0x06000001, table: 0x06, row: 1)"
        );
    }
}
