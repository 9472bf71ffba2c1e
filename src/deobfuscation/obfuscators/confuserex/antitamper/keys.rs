//! Key schedule: folding the image's other sections into the key arrays.

/// The two 16-word arrays the key derivation combines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyArrays {
    /// Destination array; the derivation writes the key into it
    pub dst: [u32; 16],
    /// Source array
    pub src: [u32; 16],
}

/// Mixes the four seed constants with every word of `sections` and expands the
/// resulting state into [`KeyArrays`].
///
/// Each section contributes `len >> 2` little-endian words. All arithmetic wraps.
/// The state update assigns `x` twice; only the second assignment takes effect and
/// `c` never changes.
///
/// # Examples
///
/// ```rust
/// use unconfuse::deobfuscation::antitamper::prepare_key_arrays;
///
/// let text = [0u8; 16];
/// let a = prepare_key_arrays([0x1111, 0x2222, 0x3333, 0x4444], [&text[..]]);
/// let b = prepare_key_arrays([0x1111, 0x2222, 0x3333, 0x4444], [&text[..]]);
/// assert_eq!(a, b);
/// ```
#[must_use]
#[allow(unused_assignments)]
pub fn prepare_key_arrays<'a>(
    seeds: [u32; 4],
    sections: impl IntoIterator<Item = &'a [u8]>,
) -> KeyArrays {
    let [mut z, mut x, mut c, mut v] = seeds;

    for section in sections {
        for word in section.chunks_exact(4) {
            let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            let t = (z ^ word).wrapping_add(x).wrapping_add(c.wrapping_mul(v));
            z = x;
            x = c;
            x = v;
            v = t;
        }
    }

    let mut dst = [0u32; 16];
    let mut src = [0u32; 16];
    for i in 0..16 {
        dst[i] = v;
        src[i] = x;
        z = x.rotate_right(5);
        x = c.rotate_right(3);
        c = v.rotate_right(7);
        v = z.rotate_right(11);
    }

    KeyArrays { dst, src }
}
