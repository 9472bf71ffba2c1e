//! Emulator integration tests.
//!
//! Runs the kinds of sequences the protections emit end to end through the public
//! API: state expressions, counted loops over word arrays and pointer walks.

use unconfuse::{
    assembly::InstructionAssembler,
    emulation::{emulate, EmValue, EmulationContext, EmulationError, EmulationLimits, Interpreter},
    metadata::{token::Token, MemberRef},
    Error,
};

#[test]
fn test_state_expression() {
    // num = (num * 0x2F1C5E1B) ^ 0x6D3A2F01, as a flattened dispatcher updates its state
    let mut asm = InstructionAssembler::new();
    asm.ldloc_0()
        .unwrap()
        .ldc_i4(0x2F1C_5E1B)
        .unwrap()
        .mul()
        .unwrap()
        .ldc_i4(0x6D3A_2F01)
        .unwrap()
        .xor()
        .unwrap()
        .stloc_0()
        .unwrap()
        .ret()
        .unwrap();

    let ctx = emulate(
        &asm.finish().unwrap(),
        EmulationContext::new().with_local(0, EmValue::I32(7)),
    )
    .unwrap();
    let expected = 7i32.wrapping_mul(0x2F1C_5E1B) ^ 0x6D3A_2F01;
    assert_eq!(ctx.local(0), EmValue::I32(expected));
}

#[test]
fn test_counted_loop_over_word_arrays() {
    // for (i = 0; i < 16; i++) dst[i] ^= src[i];
    let mut asm = InstructionAssembler::new();
    asm.ldc_i4_0().unwrap().stloc_2().unwrap().label("loop").unwrap();
    asm.ldloc_0()
        .unwrap()
        .ldloc_2()
        .unwrap()
        .ldloc_0()
        .unwrap()
        .ldloc_2()
        .unwrap()
        .ldelem_u4()
        .unwrap()
        .ldloc_1()
        .unwrap()
        .ldloc_2()
        .unwrap()
        .ldelem_u4()
        .unwrap()
        .xor()
        .unwrap()
        .stelem_i4()
        .unwrap();
    asm.ldloc_2()
        .unwrap()
        .ldc_i4(1)
        .unwrap()
        .add()
        .unwrap()
        .stloc_2()
        .unwrap()
        .ldloc_2()
        .unwrap()
        .ldc_i4(16)
        .unwrap()
        .blt("loop")
        .unwrap()
        .ret()
        .unwrap();

    let dst: Vec<u32> = (0..16).map(|i| 0xA000_0000 | i).collect();
    let src: Vec<u32> = (0..16).map(|i| i * 0x0101_0101).collect();
    let mut ctx = EmulationContext::new();
    let dst_handle = ctx.bind_local_array(0, &dst);
    ctx.bind_local_array(1, &src);

    let ctx = emulate(&asm.finish().unwrap(), ctx).unwrap();
    let expected: Vec<u32> = dst.iter().zip(&src).map(|(d, s)| d ^ s).collect();
    assert_eq!(ctx.array_words(dst_handle), Some(expected));
    assert_eq!(ctx.local(2), EmValue::I32(16));
}

#[test]
fn test_pointer_walk() {
    // *(p + 8) = *(p + 8) + *p
    let mut ctx = EmulationContext::new();
    let words = ctx.bind_local_array(0, &[5, 6, 7, 8]);
    let mut asm = InstructionAssembler::new();
    asm.ldloc_0()
        .unwrap()
        .ldc_i4(8)
        .unwrap()
        .add()
        .unwrap()
        .dup()
        .unwrap()
        .ldind_u4()
        .unwrap()
        .ldloc_0()
        .unwrap()
        .ldind_u4()
        .unwrap()
        .add()
        .unwrap()
        .stind_i4()
        .unwrap()
        .ret()
        .unwrap();

    let ctx = emulate(&asm.finish().unwrap(), ctx).unwrap();
    assert_eq!(ctx.array_words(words), Some(vec![5, 6, 12, 8]));
}

#[test]
fn test_encoder_with_return_value() {
    let mut asm = InstructionAssembler::new();
    asm.ldarg_0()
        .unwrap()
        .ldc_i4(0x1F)
        .unwrap()
        .shl()
        .unwrap()
        .ldarg_0()
        .unwrap()
        .or()
        .unwrap()
        .ret()
        .unwrap();
    let ctx = emulate(
        &asm.finish().unwrap(),
        EmulationContext::new().with_arg(0, EmValue::I32(3)),
    )
    .unwrap();
    assert_eq!(ctx.return_value(), Some(&EmValue::I32(3i32.wrapping_shl(31) | 3)));
}

#[test]
fn test_reflection_name_is_a_placeholder() {
    let get_name = MemberRef::new(Token::new(0x0A00_0002), "System.Reflection.MemberInfo", "get_Name")
        .instance()
        .returning();
    let mut asm = InstructionAssembler::new();
    asm.ldnull()
        .unwrap()
        .callvirt(get_name)
        .unwrap()
        .stloc_0()
        .unwrap()
        .ret()
        .unwrap();

    let ctx = emulate(&asm.finish().unwrap(), EmulationContext::new()).unwrap();
    assert!(matches!(ctx.local(0), EmValue::Str(_)));
    assert!(ctx.stack().is_empty());
}

#[test]
fn test_limit_stops_runaway_loops() {
    let mut asm = InstructionAssembler::new();
    asm.label("top").unwrap().nop().unwrap().br("top").unwrap();
    let interpreter = Interpreter::new(EmulationLimits::default().with_max_instructions(1_000));

    let error = interpreter
        .run(&asm.finish().unwrap(), EmulationContext::new())
        .unwrap_err();
    match error {
        Error::Emulation(fault) => assert!(matches!(
            *fault,
            EmulationError::InstructionLimitExceeded { limit: 1_000, .. }
        )),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_faults_surface_as_errors() {
    let mut asm = InstructionAssembler::new();
    asm.ldc_i4(1).unwrap().ldc_i4_0().unwrap().div().unwrap().ret().unwrap();
    let error = emulate(&asm.finish().unwrap(), EmulationContext::new()).unwrap_err();
    assert!(matches!(error, Error::Emulation(ref fault) if **fault == EmulationError::DivisionByZero));

    let mut asm = InstructionAssembler::new();
    asm.pop().unwrap();
    let error = emulate(&asm.finish().unwrap(), EmulationContext::new()).unwrap_err();
    assert!(matches!(error, Error::StackUnderflow { offset: 0 }));
}
