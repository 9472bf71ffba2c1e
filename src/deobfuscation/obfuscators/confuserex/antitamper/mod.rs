//! ConfuserEx anti-tamper removal.
//!
//! Anti-tamper moves every method body into an extra PE section and encrypts that
//! section. A method called first thing from the module's static constructor
//! decrypts it at startup:
//!
//! 1. Locate the section by comparing the product of the two name halves of every
//!    section against a constant ([`find_encrypted_section`])
//! 2. Fold the words of all other named sections into four seed constants
//!    ([`find_initial_keys`], [`prepare_key_arrays`])
//! 3. Derive a 16-word key from the two resulting arrays, either with the stock
//!    combination or with a randomized arithmetic sequence ([`find_derivation`],
//!    [`KeyDeriver`])
//! 4. Decrypt the section with a self-feeding stream cipher ([`decrypt_section`])
//!
//! [`AntiTamper`] replays those steps statically. The decrypt method is frequently
//! flattened itself, so it is unflattened before any pattern scan.
//!
//! # Example
//!
//! ```rust
//! use unconfuse::deobfuscation::antitamper::{
//!     decrypt_section, derive_key, encrypt_section, prepare_key_arrays, NormalDeriver,
//! };
//!
//! let other_section = [0x11u8; 32];
//! let keys = prepare_key_arrays([0xC0FF_EE00, 0x1234, 0x5678, 0x9ABC], [&other_section[..]]);
//! let key = derive_key(&keys, &NormalDeriver::new())?;
//!
//! let bodies = b"\x2A\x00\x00\x00encrypted bodies".to_vec();
//! assert_eq!(decrypt_section(&encrypt_section(&bodies, key), key), bodies);
//! # Ok::<(), unconfuse::Error>(())
//! ```

mod cipher;
mod deriver;
mod keys;
mod scan;

pub use cipher::{decrypt_section, decrypt_section_in_place, encrypt_section, KEY_INCREMENT};
pub use deriver::{
    derive_key, derive_with_fallback, Derivation, DynamicDeriver, KeyDeriver, NormalDeriver,
    NormalRecipe, XorMulAddRecipe,
};
pub use keys::{prepare_key_arrays, KeyArrays};
pub use scan::{
    find_derivation, find_encrypted_section, find_initial_keys, find_section_hash,
    DerivationKind, RACGUARD_SECTION_WORDS,
};

use crate::{
    assembly::{opcodes, Instruction},
    deobfuscation::{
        obfuscators::confuserex::remove_instructions,
        protection::{Protection, ProtectionId},
        AntiTamperConfig, ControlFlowDeobfuscator, DeobfuscationConfig, EventKind, EventLog,
    },
    metadata::{token::Token, Module},
    Error, Result,
};

const NAME: &str = "AntiTamper";

fn failed(reason: impl Into<String>) -> Error {
    Error::ProtectionFailed {
        protection: NAME,
        reason: reason.into(),
    }
}

/// Finds the decrypt method: the first `call` in the global static constructor to
/// a method of this module whose body has more than `min_instructions` instructions.
#[must_use]
pub fn find_decrypt_method(module: &Module, min_instructions: usize) -> Option<Token> {
    let cctor = module.static_constructor()?;
    cctor
        .body
        .as_deref()?
        .iter()
        .filter(|instruction| instruction.is(opcodes::CALL))
        .filter_map(Instruction::token)
        .find(|token| {
            module
                .method(*token)
                .is_some_and(|method| method.body.is_some() && method.instruction_count() > min_instructions)
        })
}

/// The anti-tamper removal step.
#[derive(Debug, Clone)]
pub struct AntiTamper {
    config: AntiTamperConfig,
    unflattener: ControlFlowDeobfuscator,
    decrypt_method: Option<Token>,
}

impl AntiTamper {
    /// Creates the step.
    #[must_use]
    pub fn new(config: &DeobfuscationConfig) -> Self {
        AntiTamper {
            config: config.antitamper.clone(),
            unflattener: ControlFlowDeobfuscator::new(config),
            decrypt_method: None,
        }
    }

    /// The decrypt method found by the last [`Protection::detect`].
    #[must_use]
    pub fn decrypt_method(&self) -> Option<Token> {
        self.decrypt_method
    }

    /// Body of the decrypt method, unflattened if necessary.
    fn decrypt_instructions(
        &self,
        module: &Module,
        token: Token,
        events: &EventLog,
    ) -> Result<Vec<Instruction>> {
        let method = module
            .method(token)
            .ok_or_else(|| failed(format!("decrypt method {token} disappeared")))?;
        let body = method.body.as_deref().ok_or(Error::Empty)?;

        if !self.config.unflatten_decrypt_method || !self.unflattener.needs_unflattening(body) {
            return Ok(body.to_vec());
        }

        log::debug!("Decrypt method '{}' is obfuscated, unflattening it", method.name);
        self.unflattener
            .deobfuscate_method(method, events)
            .map_err(|error| failed(format!("decrypt method could not be unflattened: {error}")))
    }

    fn derive(&self, instructions: &[Instruction], keys: &KeyArrays) -> Result<Derivation> {
        let normal = NormalDeriver::new();
        match find_derivation(instructions) {
            DerivationKind::Dynamic(window) if self.config.dynamic_derivation => {
                log::debug!("Captured a {} instruction key derivation", window.len());
                derive_with_fallback(keys, &DynamicDeriver::new(window), &normal)
            }
            _ => Ok(Derivation {
                key: derive_key(keys, &normal)?,
                deriver: normal.name(),
                fallback_reason: None,
            }),
        }
    }

    fn remove_decrypt_method(module: &mut Module, token: Token, events: &EventLog) -> Result<()> {
        if let Some(cctor) = module.static_constructor() {
            let cctor_token = cctor.token;
            let call = cctor.body.as_deref().and_then(|body| {
                body.iter()
                    .find(|i| i.is(opcodes::CALL) && i.token() == Some(token))
                    .map(|i| i.offset)
            });
            if let Some(offset) = call {
                let body = cctor.body.as_deref().unwrap_or_default();
                let rewritten = remove_instructions(body, &[offset])?;
                if let Some(cctor) = module.method_mut(cctor_token) {
                    cctor.body = Some(rewritten);
                }
            }
        }

        if let Some(method) = module.remove_method(token) {
            events
                .record(EventKind::ArtifactRemoved)
                .method(token)
                .message(format!("decrypt method '{}'", method.name));
        }
        Ok(())
    }
}

impl Protection for AntiTamper {
    fn id(&self) -> ProtectionId {
        ProtectionId::AntiTamper
    }

    fn name(&self) -> &'static str {
        NAME
    }

    fn detect(&mut self, module: &Module, _events: &EventLog) -> bool {
        self.decrypt_method = find_decrypt_method(module, self.config.decrypt_method_min_instructions);
        if let Some(token) = self.decrypt_method {
            log::debug!("Anti-tamper decrypt method is {token}");
        }
        self.decrypt_method.is_some()
    }

    fn remove(&mut self, module: &mut Module, events: &EventLog) -> Result<()> {
        let token = self
            .decrypt_method
            .ok_or_else(|| failed("decrypt method was not detected"))?;

        let instructions = self.decrypt_instructions(module, token, events)?;
        log::info!("Decrypt method has {} instructions", instructions.len());

        let section = *find_encrypted_section(&instructions, &module.image)
            .ok_or_else(|| failed("encrypted section not found"))?;
        let seeds =
            find_initial_keys(&instructions).ok_or_else(|| failed("initial keys not found"))?;
        log::debug!(
            "Seeds {:08X} {:08X} {:08X} {:08X}, section '{}'",
            seeds[0],
            seeds[1],
            seeds[2],
            seeds[3],
            section.name_str()
        );

        let keys = prepare_key_arrays(seeds, module.image.auxiliary_sections(&section)?);
        let derivation = self.derive(&instructions, &keys)?;
        if let Some(reason) = &derivation.fallback_reason {
            events
                .record(EventKind::DerivationFallback)
                .method(token)
                .message(reason.clone());
        }
        events
            .record(EventKind::KeyDerived)
            .method(token)
            .message(format!("{} deriver", derivation.deriver));

        decrypt_section_in_place(module.image.section_data_mut(&section)?, derivation.key);
        events.record(EventKind::SectionDecrypted).message(format!(
            "section '{}', {} bytes",
            section.name_str(),
            section.size_of_raw_data
        ));

        if self.config.remove_decrypt_method {
            Self::remove_decrypt_method(module, token, events)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::InstructionAssembler,
        file::{Image, SectionCharacteristics, SectionHeader},
        metadata::{MethodDef, MethodSig},
    };

    const SEEDS: [u32; 4] = [0x5EED_0001, 0x0BAD_F00D, 0x1357, 0x2468];

    /// A decrypt method body: seed stores, a section hash compare and filler.
    fn decrypt_body(hash: u32) -> Vec<Instruction> {
        let mut asm = InstructionAssembler::new();
        asm.ldarg_0().unwrap().pop().unwrap();
        for (local, seed) in SEEDS.iter().enumerate() {
            asm.ldc_i4(*seed as i32).unwrap().stloc(local as u16 + 4).unwrap();
        }
        asm.ldloc(9)
            .unwrap()
            .ldc_i4(hash as i32)
            .unwrap()
            .bne_un("next")
            .unwrap()
            .label("next")
            .unwrap();
        for _ in 0..100 {
            asm.nop().unwrap();
        }
        asm.ret().unwrap();
        asm.finish().unwrap()
    }

    fn protected_module(plain: &[u8]) -> (Module, Token) {
        let other_name = [2u8, 0, 0, 0, 3, 0, 0, 0];
        let target_name = [5u8, 0, 0, 0, 7, 0, 0, 0];
        let other = vec![0xA5u8; 16];

        let keys = prepare_key_arrays(SEEDS, [&other[..]]);
        let key = derive_key(&keys, &NormalDeriver::new()).unwrap();
        let encrypted = encrypt_section(plain, key);

        let mut data = other.clone();
        data.extend_from_slice(&encrypted);
        let sections = vec![
            SectionHeader::new(other_name, 0x2000, 0, 16),
            SectionHeader::new(target_name, 0x4000, 16, plain.len() as u32)
                .with_characteristics(SectionCharacteristics::ENCRYPTED_BODIES),
        ];
        let mut module = Module::new(Image::from_sections(data, sections).unwrap());
        let global = module.global_type();

        let decrypt = Token::new(0x0600_0002);
        module.add_method(
            MethodDef::new(decrypt, "Initialize", global, MethodSig::new("System.Void", &[]))
                .with_body(decrypt_body(35)),
        );
        let decrypt_ref = module.method_ref(module.method(decrypt).unwrap());
        let mut asm = InstructionAssembler::new();
        asm.call(decrypt_ref).unwrap().ret().unwrap();
        module.add_method(
            MethodDef::new(Token::new(0x0600_0001), ".cctor", global, MethodSig::new("System.Void", &[]))
                .with_body(asm.finish().unwrap()),
        );
        (module, decrypt)
    }

    #[test]
    fn test_detect_decrypt_method() {
        let (module, decrypt) = protected_module(&[0; 8]);
        assert_eq!(find_decrypt_method(&module, 100), Some(decrypt));
        assert_eq!(find_decrypt_method(&module, 1000), None);
    }

    #[test]
    fn test_remove_decrypts_section_and_drops_method() {
        let plain: Vec<u8> = (0..64u8).collect();
        let (mut module, decrypt) = protected_module(&plain);
        let events = EventLog::new();

        let mut step = AntiTamper::new(&DeobfuscationConfig::default());
        assert!(step.detect(&module, &events));
        step.remove(&mut module, &events).unwrap();

        let target = module.image.sections()[1];
        assert_eq!(module.image.section_data(&target).unwrap(), &plain[..]);
        assert!(module.method(decrypt).is_none());
        let cctor = module.static_constructor().unwrap();
        assert_eq!(cctor.instruction_count(), 1);
        assert!(events.has(EventKind::KeyDerived));
        assert!(events.has(EventKind::SectionDecrypted));
        assert!(events.has(EventKind::ArtifactRemoved));
    }

    #[test]
    fn test_remove_keeps_method_when_configured() {
        let (mut module, decrypt) = protected_module(&[0; 8]);
        let events = EventLog::new();
        let config = DeobfuscationConfig::default().with_antitamper(AntiTamperConfig {
            remove_decrypt_method: false,
            ..AntiTamperConfig::default()
        });

        let mut step = AntiTamper::new(&config);
        assert!(step.detect(&module, &events));
        step.remove(&mut module, &events).unwrap();
        assert!(module.method(decrypt).is_some());
    }

    #[test]
    fn test_remove_without_detection_fails() {
        let (mut module, _) = protected_module(&[0; 8]);
        let mut step = AntiTamper::new(&DeobfuscationConfig::default());
        let error = step.remove(&mut module, &EventLog::new()).unwrap_err();
        assert!(matches!(error, Error::ProtectionFailed { protection: "AntiTamper", .. }));
    }
}
