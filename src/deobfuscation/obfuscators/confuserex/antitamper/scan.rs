//! Pattern scanners over the (unflattened) decrypt method.

use crate::{
    assembly::{opcodes, FlowType, Instruction},
    file::{section_name_words, Image, SectionCharacteristics, SectionHeader},
};

/// Name words of the encrypted section emitted by the RacGuard derivative.
pub const RACGUARD_SECTION_WORDS: (u32, u32) = (0x1F71_4D16, 0x6844_5E6D);

/// How the decrypt method derives its key.
#[derive(Debug, Clone, PartialEq)]
pub enum DerivationKind {
    /// The closed form.
    Normal,
    /// A randomized arithmetic sequence; the captured window.
    Dynamic(Vec<Instruction>),
}

/// The section-name hash the decrypt method compares against, if any.
///
/// Matches `ldloc; ldc.i4 hash; <cond-branch>` first and `ldc.i4 hash; ldloc;
/// <cond-branch>` second.
#[must_use]
pub fn find_section_hash(instructions: &[Instruction]) -> Option<u32> {
    let compares = |i: usize| instructions[i + 2].flow_type == FlowType::ConditionalBranch;

    let count = instructions.len();
    (0..count.saturating_sub(2))
        .find(|&i| instructions[i].is_ldloc() && instructions[i + 1].is_ldc_i4() && compares(i))
        .and_then(|i| instructions[i + 1].ldc_i4_value())
        .or_else(|| {
            (0..count.saturating_sub(2))
                .find(|&i| {
                    instructions[i].is_ldc_i4() && instructions[i + 1].is_ldloc() && compares(i)
                })
                .and_then(|i| instructions[i].ldc_i4_value())
        })
        .map(|hash| hash as u32)
}

/// Selects the encrypted section.
///
/// Sections are checked in table order against the hash found by
/// [`find_section_hash`] and against the RacGuard name. Without a match the first
/// section flagged [`SectionCharacteristics::ENCRYPTED_BODIES`] is chosen.
#[must_use]
pub fn find_encrypted_section<'a>(
    instructions: &[Instruction],
    image: &'a Image,
) -> Option<&'a SectionHeader> {
    let hash = find_section_hash(instructions);
    if let Some(hash) = hash {
        log::debug!("Decrypt method compares section hashes against 0x{hash:08X}");
    }

    let mut candidate = None;
    for section in image.sections() {
        if hash == Some(section.name_hash()) {
            log::debug!("Encrypted section '{}' matched by hash", section.name_str());
            return Some(section);
        }
        if section_name_words(&section.name) == RACGUARD_SECTION_WORDS {
            log::debug!("Encrypted section matched by RacGuard name");
            return Some(section);
        }
        if candidate.is_none()
            && section.characteristics == SectionCharacteristics::ENCRYPTED_BODIES.bits()
        {
            candidate = Some(section);
        }
    }

    if let Some(section) = candidate {
        log::debug!(
            "No section name matched, using '{}' by its characteristics",
            section.name_str()
        );
    }
    candidate
}

/// The four seed constants: `ldc.i4` at every second instruction, with the first or
/// second seed above `0x1000`.
#[must_use]
pub fn find_initial_keys(instructions: &[Instruction]) -> Option<[u32; 4]> {
    (0..instructions.len().saturating_sub(8)).find_map(|i| {
        let seed = |k: usize| instructions[i + 2 * k].ldc_i4_value().map(|v| v as u32);
        let keys = [seed(0)?, seed(1)?, seed(2)?, seed(3)?];
        (keys[0] > 0x1000 || keys[1] > 0x1000).then_some(keys)
    })
}

/// Locates the key derivation.
///
/// A dynamic derivation contains `xor` at `i`, `add` at `i + 2` and `mul` at
/// `i + 5`. Its window starts eight instructions before the `xor` and ends right
/// before the first `blt`, `blt.s` or `ret` after that. Anything else, including a
/// window shorter than five instructions, is the closed form.
#[must_use]
pub fn find_derivation(instructions: &[Instruction]) -> DerivationKind {
    let count = instructions.len();
    let Some(xor) = (0..count.saturating_sub(10)).find(|&i| {
        instructions[i].is(opcodes::XOR)
            && instructions[i + 2].is(opcodes::ADD)
            && instructions[i + 5].is(opcodes::MUL)
    }) else {
        if (0..count.saturating_sub(5))
            .any(|i| instructions[i].is(opcodes::XOR) && instructions[i + 1].is(opcodes::LDLOC_S))
        {
            log::debug!("Key derivation looks like the closed form");
        }
        return DerivationKind::Normal;
    };

    let first = xor.saturating_sub(8);
    let end = (first..count.saturating_sub(1)).find(|&i| {
        let instruction = &instructions[i];
        instruction.is(opcodes::BLT) || instruction.is(opcodes::BLT_S) || instruction.is(opcodes::RET)
    });

    match end {
        Some(end) if end > first + 1 && end - first >= 5 => {
            DerivationKind::Dynamic(instructions[first..end].to_vec())
        }
        _ => DerivationKind::Normal,
    }
}
