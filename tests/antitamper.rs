//! Anti-tamper removal integration tests.
//!
//! Each test builds a module the way the protection lays it out: an encrypted section,
//! an auxiliary section feeding the key schedule and a decrypt method called from the
//! global static constructor. The section is encrypted with the key the selected
//! derivation produces, so a successful removal must reproduce that key exactly.

use unconfuse::{
    assembly::{Instruction, InstructionAssembler},
    deobfuscation::{
        antitamper::{
            derive_key, encrypt_section, find_derivation, prepare_key_arrays, DerivationKind,
            KeyArrays, NormalDeriver, RACGUARD_SECTION_WORDS,
        },
        AntiTamper, DeobfuscationConfig, EventKind, EventLog, Protection,
    },
    file::{Image, SectionCharacteristics, SectionHeader},
    metadata::{token::Token, MethodDef, MethodSig, Module},
};

const SEEDS: [u32; 4] = [0x7A3C_1001, 0x0000_2002, 0x4B1D_3003, 0x0000_4004];
const DECRYPT: Token = Token(0x0600_0010);
const DST: u16 = 10;
const SRC: u16 = 11;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `dst[0] = ((dst[0] ^ src[0]) + 0x1234) * 3`
fn emit_dynamic_window(asm: &mut InstructionAssembler) {
    asm.ldloc(DST)
        .unwrap()
        .ldc_i4(0)
        .unwrap()
        .ldloc(DST)
        .unwrap()
        .ldc_i4(0)
        .unwrap()
        .ldelem_u4()
        .unwrap()
        .ldloc(SRC)
        .unwrap()
        .ldc_i4(0)
        .unwrap()
        .ldelem_u4()
        .unwrap()
        .xor()
        .unwrap()
        .ldc_i4(0x1234)
        .unwrap()
        .add()
        .unwrap()
        .nop()
        .unwrap()
        .ldc_i4(3)
        .unwrap()
        .mul()
        .unwrap()
        .stelem_i4()
        .unwrap();
}

fn dynamic_key(keys: &KeyArrays) -> [u32; 16] {
    let mut key = keys.dst;
    key[0] = (keys.dst[0] ^ keys.src[0]).wrapping_add(0x1234).wrapping_mul(3);
    key
}

fn decrypt_body(hash: u32, dynamic: bool) -> Vec<Instruction> {
    let mut asm = InstructionAssembler::new();
    asm.ldarg_0().unwrap().pop().unwrap();
    for (local, seed) in (4u16..).zip(SEEDS) {
        asm.ldc_i4(seed as i32).unwrap().stloc(local).unwrap();
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
    if dynamic {
        emit_dynamic_window(&mut asm);
        asm.ret().unwrap();
        for _ in 0..4 {
            asm.nop().unwrap();
        }
    }
    asm.ret().unwrap();
    asm.finish().unwrap()
}

struct Layout {
    target_name: [u8; 8],
    hash: u32,
    dynamic: bool,
}

impl Default for Layout {
    fn default() -> Self {
        Layout {
            target_name: [9, 0, 0, 0, 4, 0, 0, 0],
            hash: 36,
            dynamic: false,
        }
    }
}

fn protected_module(plain: &[u8], layout: &Layout) -> Module {
    let auxiliary = (0..32u8).map(|b| b.wrapping_mul(37)).collect::<Vec<_>>();
    let keys = prepare_key_arrays(SEEDS, [&auxiliary[..]]);
    let key = if layout.dynamic {
        dynamic_key(&keys)
    } else {
        derive_key(&keys, &NormalDeriver::new()).unwrap()
    };

    let mut data = auxiliary.clone();
    data.extend_from_slice(&encrypt_section(plain, key));
    let sections = vec![
        SectionHeader::new(*b".rsrc\0\0\0", 0x2000, 0, 32),
        SectionHeader::new(layout.target_name, 0x4000, 32, plain.len() as u32),
    ];
    let mut module = Module::new(Image::from_sections(data, sections).unwrap());
    let global = module.global_type();

    module.add_method(
        MethodDef::new(DECRYPT, "Initialize", global, MethodSig::new("System.Void", &[]))
            .with_body(decrypt_body(layout.hash, layout.dynamic)),
    );
    let decrypt = module.method_ref(module.method(DECRYPT).unwrap());
    let mut asm = InstructionAssembler::new();
    asm.call(decrypt).unwrap().ldc_i4(1).unwrap().pop().unwrap().ret().unwrap();
    module.add_method(
        MethodDef::new(Token::new(0x0600_0001), ".cctor", global, MethodSig::new("System.Void", &[]))
            .with_body(asm.finish().unwrap()),
    );
    module
}

fn remove(module: &mut Module, config: &DeobfuscationConfig) -> EventLog {
    let events = EventLog::new();
    let mut step = AntiTamper::new(config);
    assert!(step.detect(module, &events));
    assert_eq!(step.decrypt_method(), Some(DECRYPT));
    step.remove(module, &events).unwrap();
    events
}

fn decrypted(module: &Module) -> Vec<u8> {
    let target = module.image.sections()[1];
    module.image.section_data(&target).unwrap().to_vec()
}

#[test]
fn test_closed_form_removal() {
    init();
    let plain = b"\x13\x30\x02\x00method bodies live here\x2A\x00\x00".to_vec();
    let mut module = protected_module(&plain, &Layout::default());

    let events = remove(&mut module, &DeobfuscationConfig::default());
    assert_eq!(decrypted(&module), plain);
    assert!(module.method(DECRYPT).is_none());

    let cctor = module.static_constructor().unwrap().body.clone().unwrap();
    assert_eq!(cctor.len(), 3);
    assert!(cctor.iter().all(|i| i.token() != Some(DECRYPT)));

    let derived = events.filter_kind(EventKind::KeyDerived).next().unwrap();
    assert!(derived.message.contains("normal"));
    assert!(!events.has(EventKind::DerivationFallback));
}

#[test]
fn test_dynamic_derivation_is_replayed() {
    init();
    let layout = Layout {
        dynamic: true,
        ..Layout::default()
    };
    assert!(matches!(
        find_derivation(&decrypt_body(layout.hash, true)),
        DerivationKind::Dynamic(_)
    ));

    let plain: Vec<u8> = (0..96u8).rev().collect();
    let mut module = protected_module(&plain, &layout);
    let events = remove(&mut module, &DeobfuscationConfig::default());

    assert_eq!(decrypted(&module), plain);
    let derived = events.filter_kind(EventKind::KeyDerived).next().unwrap();
    assert!(derived.message.contains("dynamic"));
}

#[test]
fn test_dynamic_derivation_can_be_disabled() {
    init();
    let layout = Layout {
        dynamic: true,
        ..Layout::default()
    };
    let plain = vec![0x5Au8; 40];
    let mut module = protected_module(&plain, &layout);

    let config = DeobfuscationConfig::default().with_dynamic_derivation(false);
    remove(&mut module, &config);
    assert_ne!(decrypted(&module), plain);
}

#[test]
fn test_section_found_by_characteristics() {
    init();
    let plain = vec![0xC3u8; 24];
    let mut module = protected_module(
        &plain,
        &Layout {
            hash: 0x0BAD,
            ..Layout::default()
        },
    );
    let mut sections = module.image.sections().to_vec();
    sections[1] = sections[1].with_characteristics(SectionCharacteristics::ENCRYPTED_BODIES);
    module.image = Image::from_sections(module.image.data().to_vec(), sections).unwrap();

    remove(&mut module, &DeobfuscationConfig::default());
    assert_eq!(decrypted(&module), plain);
}

#[test]
fn test_racguard_section_name() {
    init();
    let mut name = [0u8; 8];
    name[..4].copy_from_slice(&RACGUARD_SECTION_WORDS.0.to_le_bytes());
    name[4..].copy_from_slice(&RACGUARD_SECTION_WORDS.1.to_le_bytes());

    let plain = vec![0x11u8, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99];
    let mut module = protected_module(
        &plain,
        &Layout {
            target_name: name,
            hash: 0x0BAD,
            ..Layout::default()
        },
    );

    remove(&mut module, &DeobfuscationConfig::default());
    assert_eq!(decrypted(&module), plain);
}

#[test]
fn test_missing_section_fails_the_step() {
    init();
    let mut module = protected_module(
        &[0u8; 16],
        &Layout {
            hash: 0x0BAD,
            ..Layout::default()
        },
    );

    let events = EventLog::new();
    let mut step = AntiTamper::new(&DeobfuscationConfig::default());
    assert!(step.detect(&module, &events));
    let error = step.remove(&mut module, &events).unwrap_err();
    assert!(error.to_string().contains("encrypted section not found"));
    assert!(module.method(DECRYPT).is_some());
}

#[test]
fn test_small_initializer_is_not_anti_tamper() {
    init();
    let mut module = protected_module(&[0u8; 8], &Layout::default());
    module.method_mut(DECRYPT).unwrap().body = Some(decrypt_body(36, false)[..20].to_vec());

    let mut step = AntiTamper::new(&DeobfuscationConfig::default());
    assert!(!step.detect(&module, &EventLog::new()));
}
