//! Key derivation strategies.
//!
//! The decrypt method turns the two [`KeyArrays`] into the 16-word stream key. Stock
//! ConfuserEx uses a fixed per-slot combination ([`NormalDeriver`]); the dynamic
//! variant emits a randomized sequence of arithmetic that is captured from the
//! decrypt method and replayed through the emulator ([`DynamicDeriver`]).

use std::collections::BTreeSet;

use super::KeyArrays;
use crate::{
    assembly::{opcodes, Instruction},
    emulation::{EmulationContext, EmulationLimits, Interpreter},
    Error, Result,
};

/// A strategy turning the key arrays into the stream key.
pub trait KeyDeriver {
    /// Short name used in logs and events.
    fn name(&self) -> &'static str;

    /// Derives the 16-word key.
    ///
    /// # Errors
    ///
    /// Implementation specific; the dynamic deriver fails when the captured code does
    /// not expose the arrays or cannot be emulated.
    fn derive_key(&self, dst: [u32; 16], src: [u32; 16]) -> Result<[u32; 16]>;
}

/// Per-slot combination used by [`NormalDeriver`].
pub trait NormalRecipe {
    /// Combines slot `index` of the destination and source arrays.
    fn combine(&self, index: usize, dst: u32, src: u32) -> u32;
}

/// The stock recipe: slots cycle through xor, multiply and add.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XorMulAddRecipe;

impl NormalRecipe for XorMulAddRecipe {
    fn combine(&self, index: usize, dst: u32, src: u32) -> u32 {
        match index % 3 {
            0 => dst ^ src,
            1 => dst.wrapping_mul(src),
            _ => dst.wrapping_add(src),
        }
    }
}

/// Closed-form deriver applying a [`NormalRecipe`] slot by slot.
#[derive(Debug, Clone, Default)]
pub struct NormalDeriver<R = XorMulAddRecipe> {
    recipe: R,
}

impl NormalDeriver {
    /// Creates the deriver with the stock recipe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R: NormalRecipe> NormalDeriver<R> {
    /// Creates the deriver with a custom recipe.
    pub fn with_recipe(recipe: R) -> Self {
        NormalDeriver { recipe }
    }
}

impl<R: NormalRecipe> KeyDeriver for NormalDeriver<R> {
    fn name(&self) -> &'static str {
        "normal"
    }

    fn derive_key(&self, dst: [u32; 16], src: [u32; 16]) -> Result<[u32; 16]> {
        let mut key = [0u32; 16];
        for (index, slot) in key.iter_mut().enumerate() {
            *slot = self.recipe.combine(index, dst[index], src[index]);
        }
        Ok(key)
    }
}

/// Replays a captured derivation window through the emulator.
///
/// The window must read two `uint[]` (or `uint*`) locals. The lower-numbered one is
/// bound to `dst`, the other to `src`, and `dst` is read back after the run.
#[derive(Debug, Clone)]
pub struct DynamicDeriver {
    window: Vec<Instruction>,
    interpreter: Interpreter,
}

impl DynamicDeriver {
    /// Creates a deriver for the captured instruction window.
    #[must_use]
    pub fn new(window: Vec<Instruction>) -> Self {
        DynamicDeriver {
            window,
            interpreter: Interpreter::new(EmulationLimits::default()),
        }
    }

    /// The captured window.
    #[must_use]
    pub fn window(&self) -> &[Instruction] {
        &self.window
    }

    /// Locals the window uses as word arrays, in ascending order.
    ///
    /// A local qualifies when it is loaded two instructions before an `ldelem.u4` or
    /// directly before an `ldind.u4`.
    #[must_use]
    pub fn array_locals(&self) -> Vec<u16> {
        let window = &self.window;
        let mut locals = BTreeSet::new();
        for i in 0..window.len().saturating_sub(5) {
            if !window[i].is_ldloc() {
                continue;
            }
            if window[i + 2].is(opcodes::LDELEM_U4) || window[i + 1].is(opcodes::LDIND_U4) {
                if let Some(local) = window[i].local_index() {
                    locals.insert(local);
                }
            }
        }
        locals.into_iter().collect()
    }
}

impl KeyDeriver for DynamicDeriver {
    fn name(&self) -> &'static str {
        "dynamic"
    }

    fn derive_key(&self, dst: [u32; 16], src: [u32; 16]) -> Result<[u32; 16]> {
        let locals = self.array_locals();
        let (dst_local, src_local) = match locals.as_slice() {
            [first, second, ..] => (*first, *second),
            _ => return Err(Error::DerivationAmbiguous { found: locals.len() }),
        };

        let mut context = EmulationContext::new();
        let dst_handle = context.bind_local_array(dst_local, &dst);
        context.bind_local_array(src_local, &src);

        let context = self.interpreter.run(&self.window, context)?;
        let words = context
            .array_words(dst_handle)
            .ok_or_else(|| malformed_error!("Derived key array holds non-integer values"))?;
        <[u32; 16]>::try_from(words.as_slice())
            .map_err(|_| malformed_error!("Derived key has {} words instead of 16", words.len()))
    }
}

/// Derives the stream key from `keys` with `deriver`.
///
/// # Errors
///
/// Whatever the deriver reports.
///
/// # Examples
///
/// ```rust
/// use unconfuse::deobfuscation::antitamper::{derive_key, KeyArrays, NormalDeriver};
///
/// let keys = KeyArrays { dst: [6; 16], src: [3; 16] };
/// let key = derive_key(&keys, &NormalDeriver::new())?;
/// assert_eq!(&key[..3], &[6 ^ 3, 6 * 3, 6 + 3]);
/// # Ok::<(), unconfuse::Error>(())
/// ```
pub fn derive_key(keys: &KeyArrays, deriver: &dyn KeyDeriver) -> Result<[u32; 16]> {
    deriver.derive_key(keys.dst, keys.src)
}

/// Result of [`derive_with_fallback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivation {
    /// The stream key
    pub key: [u32; 16],
    /// Name of the deriver that produced it
    pub deriver: &'static str,
    /// Error message of the preferred deriver if it failed
    pub fallback_reason: Option<String>,
}

/// Tries `preferred` and falls back to `fallback` on any error.
///
/// # Errors
///
/// Returns the fallback's error if both derivers fail.
pub fn derive_with_fallback(
    keys: &KeyArrays,
    preferred: &dyn KeyDeriver,
    fallback: &dyn KeyDeriver,
) -> Result<Derivation> {
    match derive_key(keys, preferred) {
        Ok(key) => Ok(Derivation {
            key,
            deriver: preferred.name(),
            fallback_reason: None,
        }),
        Err(error) => {
            log::warn!(
                "{} key derivation failed ({}), using {}",
                preferred.name(),
                error,
                fallback.name()
            );
            Ok(Derivation {
                key: derive_key(keys, fallback)?,
                deriver: fallback.name(),
                fallback_reason: Some(error.to_string()),
            })
        }
    }
}
