//! Control-flow unflattening integration tests.

use unconfuse::{
    assembly::{opcodes, Instruction, InstructionAssembler},
    deobfuscation::{
        detection::{is_obfuscated, is_still_obfuscated},
        ControlFlow, ControlFlowDeobfuscator, DeobfuscationConfig, DetectionConfig, EventKind,
        EventLog, Protection,
    },
    file::Image,
    metadata::{token::Token, MemberRef, MethodDef, MethodSig, Module},
};

const SWITCHED: Token = Token(0x0600_0001);
const CHAINED: Token = Token(0x0600_0002);

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn trace() -> MemberRef {
    MemberRef::new(Token::new(0x0A00_0007), "System.Diagnostics.Trace", "WriteLine").with_params(1)
}

/// Arguments of the calls along the path that starts at the first instruction and
/// follows unconditional jumps.
fn call_order(body: &[Instruction]) -> Vec<i32> {
    let mut order = Vec::new();
    let mut index = 0;
    for _ in 0..body.len() * 2 {
        let Some(instruction) = body.get(index) else {
            break;
        };
        if instruction.is_call() {
            order.push(body[index - 1].ldc_i4_value().unwrap());
        }
        if instruction.is_return() {
            break;
        }
        index = if instruction.is_unconditional_branch() {
            let target = instruction.branch_targets[0];
            body.iter().position(|i| i.offset == target).unwrap()
        } else {
            index + 1
        };
    }
    order
}

/// Four cases behind `rem.un 4; switch`, visited 1, 3, 0, 2; the state updates are
/// folded constant expressions.
fn switched() -> Vec<Instruction> {
    let mut asm = InstructionAssembler::new();
    asm.ldc_i4(0x25).unwrap().stloc_1().unwrap().label("dispatch").unwrap();
    asm.ldloc_1()
        .unwrap()
        .ldc_i4(4)
        .unwrap()
        .rem_un()
        .unwrap()
        .switch(&["c0", "c1", "c2", "c3"])
        .unwrap()
        .br("exit")
        .unwrap();

    // (next state, argument) per case
    let cases = [("c0", 2, 100), ("c1", 3, 101), ("c2", -1, 102), ("c3", 0, 103)];
    for (label, next, argument) in cases {
        asm.label(label)
            .unwrap()
            .ldc_i4(argument)
            .unwrap()
            .call(trace())
            .unwrap();
        if next < 0 {
            asm.br("exit").unwrap();
            continue;
        }
        asm.ldc_i4(0x1000 | next)
            .unwrap()
            .ldc_i4(0x1000)
            .unwrap()
            .xor()
            .unwrap()
            .stloc_1()
            .unwrap()
            .br("dispatch")
            .unwrap();
    }
    asm.label("exit").unwrap().ret().unwrap();
    asm.finish().unwrap()
}

/// A `ceq`/`brtrue` chain over local 0 with twelve states visited in reverse.
fn chained() -> Vec<Instruction> {
    let mut asm = InstructionAssembler::new();
    asm.ldc_i4(11).unwrap().stloc_0().unwrap().br("dispatch").unwrap();
    asm.label("dispatch").unwrap();
    for state in 0..12 {
        asm.ldloc_0()
            .unwrap()
            .ldc_i4(state)
            .unwrap()
            .ceq()
            .unwrap()
            .brtrue(&format!("s{state}"))
            .unwrap();
    }
    asm.ret().unwrap();
    for state in 0..12 {
        asm.label(&format!("s{state}"))
            .unwrap()
            .ldc_i4(200 + state)
            .unwrap()
            .call(trace())
            .unwrap();
        if state == 0 {
            asm.ret().unwrap();
        } else {
            asm.ldc_i4(state - 1).unwrap().stloc_0().unwrap().br("dispatch").unwrap();
        }
    }
    asm.finish().unwrap()
}

fn module() -> Module {
    let mut module = Module::new(Image::default());
    let global = module.global_type();
    let sig = || MethodSig::new("System.Void", &[]);
    module.add_method(MethodDef::new(SWITCHED, "Switched", global, sig()).with_body(switched()));
    module.add_method(MethodDef::new(CHAINED, "Chained", global, sig()).with_body(chained()));
    module
}

#[test]
fn test_switch_dispatcher_restored() {
    init();
    let body = switched();
    assert!(is_obfuscated(&body, &DetectionConfig::default()));

    let events = EventLog::new();
    let output = ControlFlowDeobfuscator::new(&DeobfuscationConfig::default())
        .deobfuscate(&body, &events)
        .unwrap();

    assert!(!output.iter().any(|i| i.is(opcodes::SWITCH)));
    assert_eq!(call_order(&output), vec![101, 103, 100, 102]);
    assert!(!is_still_obfuscated(&output, &DetectionConfig::default()));
    assert!(events.has(EventKind::DispatcherCollapsed));
}

/// Cases push the next state for a header that decodes it with an xor key, keeps it
/// in local 1 and switches on it. One case derives its state from the previous one.
/// Visits 1, 3, 0, 2.
fn stack_carried() -> Vec<Instruction> {
    const KEY: i32 = 0x5A3C;
    let mut asm = InstructionAssembler::new();
    asm.ldc_i4(KEY ^ 1).unwrap().label("header").unwrap();
    asm.ldc_i4(KEY)
        .unwrap()
        .xor()
        .unwrap()
        .dup()
        .unwrap()
        .stloc_1()
        .unwrap()
        .ldc_i4(4)
        .unwrap()
        .rem_un()
        .unwrap()
        .switch(&["c0", "c1", "c2", "c3"])
        .unwrap()
        .br("exit")
        .unwrap();

    asm.label("c0").unwrap().ldc_i4(100).unwrap().call(trace()).unwrap();
    asm.ldc_i4(KEY ^ 2).unwrap().br("header").unwrap();
    asm.label("c1").unwrap().ldc_i4(101).unwrap().call(trace()).unwrap();
    asm.ldc_i4(KEY ^ 3).unwrap().br("header").unwrap();
    asm.label("c2").unwrap().ldc_i4(102).unwrap().call(trace()).unwrap();
    asm.br("exit").unwrap();
    // state 3 becomes (3 * 3) ^ 0x11 = 24, case 0
    asm.label("c3").unwrap().ldc_i4(103).unwrap().call(trace()).unwrap();
    asm.ldloc_1()
        .unwrap()
        .ldc_i4(3)
        .unwrap()
        .mul()
        .unwrap()
        .ldc_i4(KEY ^ 0x11)
        .unwrap()
        .xor()
        .unwrap()
        .br("header")
        .unwrap();
    asm.label("exit").unwrap().ret().unwrap();
    asm.finish().unwrap()
}

#[test]
fn test_stack_carried_switch_restored() {
    init();
    let body = stack_carried();

    let events = EventLog::new();
    let output = ControlFlowDeobfuscator::new(&DeobfuscationConfig::default())
        .deobfuscate(&body, &events)
        .unwrap();

    assert!(!output.iter().any(|i| i.is(opcodes::SWITCH)));
    assert!(output.iter().all(|i| i.local_index() != Some(1)));
    assert_eq!(call_order(&output), vec![101, 103, 100, 102]);
    assert!(!is_still_obfuscated(&output, &DetectionConfig::default()));
    assert_eq!(events.count_kind(EventKind::DispatcherCollapsed), 4);
}

#[test]
fn test_if_chain_dispatcher_restored() {
    init();
    let body = chained();
    assert!(is_obfuscated(&body, &DetectionConfig::default()));

    let events = EventLog::new();
    let output = ControlFlowDeobfuscator::new(&DeobfuscationConfig::default())
        .deobfuscate(&body, &events)
        .unwrap();

    let expected: Vec<i32> = (200..212).rev().collect();
    assert_eq!(call_order(&output), expected);
    assert!(output.iter().all(|i| i.local_index() != Some(0)));
    assert!(output.len() < body.len());
}

#[test]
fn test_protection_step_rewrites_module() {
    init();
    let mut module = module();
    let events = EventLog::new();
    let mut step = ControlFlow::new(&DeobfuscationConfig::default());

    assert!(step.detect(&module, &events));
    assert_eq!(step.targets(), &[SWITCHED, CHAINED]);
    step.remove(&mut module, &events).unwrap();
    assert_eq!(step.report().solved, 2);
    assert_eq!(step.report().failed, 0);

    for token in [SWITCHED, CHAINED] {
        let body = module.method(token).unwrap().body.as_deref().unwrap();
        assert!(!is_obfuscated(body, &DetectionConfig::default()));
        assert_eq!(events.filter_method(token).filter(|e| e.kind == EventKind::MethodDeobfuscated).count(), 1);
    }

    // A second run finds nothing left to do.
    assert!(!step.detect(&module, &events));
}

#[test]
fn test_unflattening_is_idempotent() {
    init();
    let deobfuscator = ControlFlowDeobfuscator::new(&DeobfuscationConfig::default());
    let events = EventLog::new();
    let once = deobfuscator.deobfuscate(&chained(), &events).unwrap();
    let twice = deobfuscator.deobfuscate(&once, &events).unwrap();
    assert_eq!(call_order(&once), call_order(&twice));
    assert_eq!(once.len(), twice.len());
}
