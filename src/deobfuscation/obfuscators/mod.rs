//! Obfuscator-specific protection removal.
//!
//! Each obfuscator gets its own module exposing one [`Protection`] step per
//! protection it applies. Generic machinery (unflattening, emulation, block graphs)
//! lives outside; these modules only hold the pattern knowledge.
//!
//! [`Protection`]: crate::deobfuscation::Protection

pub mod confuserex;
