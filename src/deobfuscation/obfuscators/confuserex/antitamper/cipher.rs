//! Self-feeding stream cipher over the encrypted section.
//!
//! The section is processed as little-endian 32-bit words. Word `i` is combined
//! with key slot `i & 15`, and that slot then advances by the ciphertext word:
//!
//! ```text
//! plain       = cipher ^ key[i & 15]
//! key[i & 15] = (key[i & 15] ^ plain) + 0x3DBB2819    ; = cipher + 0x3DBB2819
//! ```
//!
//! Because the schedule depends only on ciphertext, encryption is the same walk with
//! the roles swapped (see [`encrypt_section`]).

/// Constant added to a key slot after every word.
pub const KEY_INCREMENT: u32 = 0x3DBB_2819;

/// Decrypts `bytes` with the rolling `key` and returns the plain bytes.
///
/// A trailing partial word is copied through unchanged. The key is taken by value, so
/// every call starts from the caller's key.
///
/// # Examples
///
/// ```rust
/// use unconfuse::deobfuscation::antitamper::{decrypt_section, encrypt_section};
///
/// let key = [0x1234_5678u32; 16];
/// let plain = b"method bodies...".to_vec();
/// let cipher = encrypt_section(&plain, key);
/// assert_ne!(cipher, plain);
/// assert_eq!(decrypt_section(&cipher, key), plain);
/// ```
#[must_use]
pub fn decrypt_section(bytes: &[u8], key: [u32; 16]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    decrypt_section_in_place(&mut out, key);
    out
}

/// In-place form of [`decrypt_section`].
pub fn decrypt_section_in_place(bytes: &mut [u8], mut key: [u32; 16]) {
    for (index, chunk) in bytes.chunks_exact_mut(4).enumerate() {
        let slot = index & 0xF;
        let data = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let plain = data ^ key[slot];
        key[slot] = (key[slot] ^ plain).wrapping_add(KEY_INCREMENT);
        chunk.copy_from_slice(&plain.to_le_bytes());
    }
}

/// Encrypts `bytes` so that [`decrypt_section`] with the same key restores them.
#[must_use]
pub fn encrypt_section(bytes: &[u8], mut key: [u32; 16]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    for (index, chunk) in out.chunks_exact_mut(4).enumerate() {
        let slot = index & 0xF;
        let plain = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let cipher = plain ^ key[slot];
        key[slot] = cipher.wrapping_add(KEY_INCREMENT);
        chunk.copy_from_slice(&cipher.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u32; 16] {
        let mut key = [0u32; 16];
        for (i, slot) in key.iter_mut().enumerate() {
            *slot = 0x9E37_79B9u32.wrapping_mul(i as u32 + 1);
        }
        key
    }

    #[test]
    fn test_first_word_is_plain_xor() {
        let key = key();
        let data = 0xDEAD_BEEFu32.to_le_bytes();
        let plain = decrypt_section(&data, key);
        assert_eq!(plain, (0xDEAD_BEEF ^ key[0]).to_le_bytes());
    }

    #[test]
    fn test_slot_advances_by_cipher_word() {
        let key = [0u32; 16];
        // 17 words: word 16 reuses slot 0, which advanced to cipher[0] + increment.
        let mut data = Vec::new();
        for i in 0..17u32 {
            data.extend_from_slice(&(i * 0x0101_0101).to_le_bytes());
        }
        let plain = decrypt_section(&data, key);
        let word16 = u32::from_le_bytes(plain[64..68].try_into().unwrap());
        assert_eq!(word16, (16 * 0x0101_0101) ^ KEY_INCREMENT);
    }

    #[test]
    fn test_round_trip_restores_input() {
        let plain: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let key = key();
        let cipher = encrypt_section(&plain, key);
        assert_eq!(decrypt_section(&cipher, key), plain);
    }

    /// xorshift32; deterministic filler for keys and buffers.
    fn xorshift(state: &mut u32) -> u32 {
        *state ^= *state << 13;
        *state ^= *state >> 17;
        *state ^= *state << 5;
        *state
    }

    #[test]
    fn test_round_trip_over_generated_inputs() {
        // Empty, shorter than a word, exactly one slot, ragged tails, and lengths that
        // wrap the sixteen-slot key several times.
        let lengths = [0usize, 1, 3, 4, 5, 7, 63, 64, 65, 66, 67, 68, 1021, 4096];
        let mut state = 0x2545_F491u32;

        for round in 0..8 {
            let mut key = [0u32; 16];
            for slot in &mut key {
                *slot = xorshift(&mut state);
            }
            if round == 0 {
                key = [0; 16];
            }

            for &length in &lengths {
                let plain: Vec<u8> = (0..length).map(|_| xorshift(&mut state) as u8).collect();
                let cipher = encrypt_section(&plain, key);
                assert_eq!(cipher.len(), length);
                assert_eq!(
                    decrypt_section(&cipher, key),
                    plain,
                    "round {round}, length {length}"
                );

                let mut in_place = cipher.clone();
                decrypt_section_in_place(&mut in_place, key);
                assert_eq!(in_place, plain, "in place, round {round}, length {length}");
            }
        }
    }

    #[test]
    fn test_trailing_bytes_untouched() {
        let data = [1, 2, 3, 4, 5, 6];
        let plain = decrypt_section(&data, key());
        assert_eq!(&plain[4..], &[5, 6]);
    }

    #[test]
    fn test_in_place_matches_copying_form() {
        let data: Vec<u8> = (0..64u8).collect();
        let mut in_place = data.clone();
        decrypt_section_in_place(&mut in_place, key());
        assert_eq!(in_place, decrypt_section(&data, key()));
    }
}
