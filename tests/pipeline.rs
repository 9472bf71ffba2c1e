//! Whole-pipeline tests on a module carrying all three protections.
//!
//! The module mirrors what ConfuserEx emits with reference proxies, anti-tamper and
//! control flow enabled:
//!
//! - `<Module>::.cctor` calls the anti-tamper decrypt method first
//! - `<Module>::Handler` resolves delegate fields; `<Module>::Encode` is its key encoder
//! - `Proxy` is a delegate type whose static constructor initializes one field
//! - `Program::Main` calls `Console.WriteLine` through that field
//! - `Program::Run` is flattened behind a `switch` dispatcher

use unconfuse::{
    deobfuscation::antitamper::{derive_key, encrypt_section, prepare_key_arrays, NormalDeriver},
    prelude::*,
};

const DECRYPT: Token = Token(0x0600_0001);
const CCTOR: Token = Token(0x0600_0002);
const HANDLER: Token = Token(0x0600_0003);
const ENCODER: Token = Token(0x0600_0004);
const PROXY_CCTOR: Token = Token(0x0600_0005);
const INVOKE: Token = Token(0x0600_0006);
const MAIN: Token = Token(0x0600_0007);
const RUN: Token = Token(0x0600_0008);
const FIELD: Token = Token(0x0400_0001);
const WRITE_LINE: Token = Token(0x0A00_0010);

const SEEDS: [u32; 4] = [0x6C1E_0F01, 0x0000_0A0B, 0x2D4F_6A81, 0x0000_0C0D];
const MODIFIER: u32 = 0x0100_0004;
const ENCODER_KEY: i32 = 0x3C3C_3C3C;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn void() -> MethodSig {
    MethodSig::new("System.Void", &[])
}

fn inverse(value: u32) -> u32 {
    let mut inverse = value;
    for _ in 0..5 {
        inverse = inverse.wrapping_mul(2u32.wrapping_sub(value.wrapping_mul(inverse)));
    }
    inverse
}

/// The encoded key of field "Proxy" (name units 'P' 'r' 'o' 'x', signature tail
/// 0x0A 0x0B 0x0C 0x0D, shifts 0 8 16 24).
fn encoded_field_key() -> u32 {
    let terms = (u32::from(b'P') ^ 0x0D)
        | (u32::from(b'r') ^ 0x0C) << 8
        | (u32::from(b'o') ^ 0x0B) << 16
        | (u32::from(b'x') ^ 0x0A) << 24;
    MODIFIER.wrapping_add(terms) ^ ENCODER_KEY as u32
}

fn add_anti_tamper(module: &mut Module, plain: &[u8]) {
    let auxiliary = vec![0x3Cu8; 24];
    let keys = prepare_key_arrays(SEEDS, [&auxiliary[..]]);
    let key = derive_key(&keys, &NormalDeriver::new()).unwrap();

    let mut data = auxiliary;
    data.extend_from_slice(&encrypt_section(plain, key));
    let sections = vec![
        SectionHeader::new(*b".text\0\0\0", 0x2000, 0, 24),
        SectionHeader::new([6, 0, 0, 0, 7, 0, 0, 0], 0x4000, 24, plain.len() as u32),
    ];
    module.image = Image::from_sections(data, sections).unwrap();

    let global = module.global_type();
    let mut asm = InstructionAssembler::new();
    asm.ldarg_0().unwrap().pop().unwrap();
    for (local, seed) in (4u16..).zip(SEEDS) {
        asm.ldc_i4(seed as i32).unwrap().stloc(local).unwrap();
    }
    asm.ldloc(9).unwrap().ldc_i4(42).unwrap().bne_un("body").unwrap().label("body").unwrap();
    for _ in 0..110 {
        asm.nop().unwrap();
    }
    asm.ret().unwrap();
    module.add_method(MethodDef::new(DECRYPT, "Decrypt", global, void()).with_body(asm.finish().unwrap()));

    let decrypt = module.method_ref(module.method(DECRYPT).unwrap());
    let mut asm = InstructionAssembler::new();
    asm.call(decrypt).unwrap().ret().unwrap();
    module.add_method(MethodDef::new(CCTOR, ".cctor", global, void()).with_body(asm.finish().unwrap()));
}

fn add_ref_proxy(module: &mut Module, program: TypeId) {
    let global = module.global_type();
    let delegate = module.add_type(TypeDef::new(Token::new(0x0200_0003), "", "Proxy").extends("System.MulticastDelegate"));

    let mut asm = InstructionAssembler::new();
    asm.ldarg_0().unwrap().ldc_i4(ENCODER_KEY).unwrap().xor().unwrap().ret().unwrap();
    module.add_method(
        MethodDef::new(ENCODER, "Encode", global, MethodSig::new("System.Int32", &["System.Int32"]))
            .with_body(asm.finish().unwrap()),
    );

    let get_name = MemberRef::new(Token::new(0x0A00_0001), "System.Reflection.MemberInfo", "get_Name")
        .instance()
        .returning();
    let encoder = module.method_ref(module.method(ENCODER).unwrap());
    let mut asm = InstructionAssembler::new();
    for index in [0, 1, 2, 3, 4] {
        asm.ldarg_0()
            .unwrap()
            .callvirt(get_name.clone())
            .unwrap()
            .ldc_i4(index)
            .unwrap()
            .pop()
            .unwrap()
            .pop()
            .unwrap();
    }
    for shift in [0, 8, 16, 24] {
        asm.ldloc_0().unwrap().ldc_i4(shift).unwrap().shl().unwrap().stloc_0().unwrap();
    }
    asm.ldloc_0().unwrap().call(encoder).unwrap().pop().unwrap().ret().unwrap();
    module.add_method(
        MethodDef::new(
            HANDLER,
            "Handler",
            global,
            MethodSig::new("System.Void", &["System.RuntimeFieldHandle", "System.Byte"]),
        )
        .with_body(asm.finish().unwrap()),
    );

    module.add_field(FieldDef {
        modifier_token: Some(Token::new(MODIFIER)),
        signature_extra: vec![0x0A, 0x0B, 0x0C, 0x0D],
        attribute_hash: Some(WRITE_LINE.value().wrapping_mul(inverse(encoded_field_key())) as i32),
        ..FieldDef::new(FIELD, "Proxy", delegate)
    });

    let handler = module.method_ref(module.method(HANDLER).unwrap());
    let mut asm = InstructionAssembler::new();
    asm.ldtoken(FIELD)
        .unwrap()
        .ldc_i4(i32::from(b'y' ^ opcodes::CALL))
        .unwrap()
        .call(handler)
        .unwrap()
        .ret()
        .unwrap();
    module.add_method(MethodDef::new(PROXY_CCTOR, ".cctor", delegate, void()).with_body(asm.finish().unwrap()));
    module.add_method(
        MethodDef::new(INVOKE, "Invoke", delegate, MethodSig::new("System.Void", &["System.String"])).instance(),
    );

    module.add_member_ref(MemberRef::new(WRITE_LINE, "System.Console", "WriteLine").with_params(1));

    let invoke = module.method_ref(module.method(INVOKE).unwrap());
    let mut asm = InstructionAssembler::new();
    asm.ldsfld(FIELD).unwrap().ldstr("hello").unwrap().call(invoke).unwrap().ret().unwrap();
    module.add_method(MethodDef::new(MAIN, "Main", program, void()).with_body(asm.finish().unwrap()));
}

fn add_flattened(module: &mut Module, program: TypeId) {
    let trace = MemberRef::new(Token::new(0x0A00_0011), "System.Diagnostics.Trace", "WriteLine").with_params(1);
    let mut asm = InstructionAssembler::new();
    asm.ldc_i4(5).unwrap().stloc_0().unwrap().label("dispatch").unwrap();
    asm.ldloc_0()
        .unwrap()
        .ldc_i4(3)
        .unwrap()
        .rem_un()
        .unwrap()
        .switch(&["a", "b", "c"])
        .unwrap()
        .ret()
        .unwrap();
    asm.label("a").unwrap().ldc_i4(2).unwrap().call(trace.clone()).unwrap().ret().unwrap();
    asm.label("b")
        .unwrap()
        .ldc_i4(1)
        .unwrap()
        .call(trace.clone())
        .unwrap()
        .ldc_i4(6)
        .unwrap()
        .stloc_0()
        .unwrap()
        .br("dispatch")
        .unwrap();
    asm.label("c")
        .unwrap()
        .ldc_i4(0)
        .unwrap()
        .call(trace)
        .unwrap()
        .ldc_i4(4)
        .unwrap()
        .stloc_0()
        .unwrap()
        .br("dispatch")
        .unwrap();
    module.add_method(MethodDef::new(RUN, "Run", program, void()).with_body(asm.finish().unwrap()));
}

fn protected_module(plain: &[u8]) -> Module {
    let mut module = Module::new(Image::default());
    let program = module.add_type(TypeDef::new(Token::new(0x0200_0002), "App", "Program"));
    add_anti_tamper(&mut module, plain);
    add_ref_proxy(&mut module, program);
    add_flattened(&mut module, program);
    module
}

#[test]
fn test_full_pipeline() {
    init();
    let plain: Vec<u8> = (0..48u8).map(|b| b ^ 0x5A).collect();
    let mut module = protected_module(&plain);
    let events = EventLog::new();

    let report = Pipeline::confuserex(&DeobfuscationConfig::default())
        .run(&mut module, &events)
        .unwrap();
    assert_eq!(
        report.to_string(),
        "RefProxy: removed, AntiTamper: removed, ControlFlow: removed"
    );

    // RefProxy
    let main = module.method(MAIN).unwrap().body.as_deref().unwrap();
    assert_eq!(main.len(), 3);
    assert!(main[1].is(opcodes::CALL));
    assert_eq!(main[1].member().map(|m| m.full_name()), Some("System.Console::WriteLine".to_string()));
    assert!(module.method(HANDLER).is_none());
    assert!(module.method(INVOKE).is_none());
    assert!(module.field(FIELD).is_none());

    // AntiTamper
    let target = module.image.sections()[1];
    assert_eq!(module.image.section_data(&target).unwrap(), &plain[..]);
    assert!(module.method(DECRYPT).is_none());
    assert_eq!(module.method(CCTOR).unwrap().instruction_count(), 1);

    // ControlFlow
    let run = module.method(RUN).unwrap().body.as_deref().unwrap();
    assert!(!run.iter().any(|i| i.is(opcodes::SWITCH)));
    assert!(run.iter().all(|i| i.local_index() != Some(0)));

    assert!(events.has(EventKind::ProxyResolved));
    assert!(events.has(EventKind::SectionDecrypted));
    assert!(events.has(EventKind::MethodDeobfuscated));
    assert_eq!(events.count_kind(EventKind::ProtectionRemoved), 3);
    assert_eq!(events.errors().count(), 0);
}

#[test]
fn test_unprotected_module_is_untouched() {
    init();
    let mut module = Module::new(Image::default());
    let global = module.global_type();
    let mut asm = InstructionAssembler::new();
    asm.ldc_i4(1).unwrap().pop().unwrap().ret().unwrap();
    let body = asm.finish().unwrap();
    module.add_method(MethodDef::new(MAIN, "Main", global, void()).with_body(body.clone()));

    let events = EventLog::new();
    let report = Pipeline::confuserex(&DeobfuscationConfig::default())
        .run(&mut module, &events)
        .unwrap();
    assert_eq!(report.detected().count(), 0);
    assert_eq!(module.method(MAIN).unwrap().body.as_deref(), Some(body.as_slice()));
    assert!(events.is_empty());
}

#[test]
fn test_failing_step_stops_the_pipeline() {
    init();
    let mut module = protected_module(&[0u8; 16]);
    // No section matches the hash and none carries the anti-tamper flags.
    let sections = vec![SectionHeader::new(*b".text\0\0\0", 0x2000, 0, 16)];
    module.image = Image::from_sections(vec![0; 16], sections).unwrap();

    let events = EventLog::new();
    let error = Pipeline::confuserex(&DeobfuscationConfig::default())
        .run(&mut module, &events)
        .unwrap_err();
    assert!(matches!(error, Error::ProtectionFailed { protection: "AntiTamper", .. }));

    // RefProxy ran, ControlFlow did not.
    assert!(module.method(HANDLER).is_none());
    let run = module.method(RUN).unwrap().body.as_deref().unwrap();
    assert!(run.iter().any(|i| i.is(opcodes::SWITCH)));
    assert_eq!(events.count_kind(EventKind::ProtectionRemoved), 1);
}

#[test]
fn test_custom_order_is_validated() {
    let config = DeobfuscationConfig::default();
    let mut pipeline = Pipeline::new()
        .with_step(Box::new(ControlFlow::new(&config)))
        .with_step(Box::new(AntiTamper::new(&config)));

    let mut module = Module::new(Image::default());
    let error = pipeline.run(&mut module, &EventLog::new()).unwrap_err();
    assert!(matches!(error, Error::ProtectionFailed { protection: "AntiTamper", .. }));
}
