//! Control-flow obfuscation detectors.
//!
//! Two detectors share one instruction scan ([`FlatteningSignals`]):
//!
//! - [`is_obfuscated`] is sensitive. It also fires on counting heuristics (many
//!   constant additions, many if-chain compares, many constant stores) and decides
//!   whether a method is worth unflattening at all.
//! - [`is_still_obfuscated`] is strict. It fires only on structural dispatcher
//!   signatures and decides whether unflattening succeeded. Legitimate constant-heavy
//!   code, such as the decryption routines the obfuscator itself injects, trips the
//!   counting heuristics but not this one.

use std::collections::HashMap;

use crate::{
    assembly::{opcodes, Instruction, Operand},
    deobfuscation::DetectionConfig,
};

/// Pattern counts collected from one method body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlatteningSignals {
    /// `ldc.i4 N; rem.un; switch` with exactly `N` cases
    pub switch_dispatcher: bool,
    /// `ldloc; ldc.i4; mul; ldc.i4; xor; stloc`
    pub state_update: bool,
    /// `ldc.i4` directly followed by `add` or `sub`
    pub constant_arith: usize,
    /// `ldloc; ldc.i4; ceq; brtrue/brfalse`, per local
    pub if_chain: HashMap<u16, usize>,
    /// `ldc.i4; stloc`, per local
    pub state_stores: HashMap<u16, usize>,
}

impl FlatteningSignals {
    /// Scans a method body.
    #[must_use]
    pub fn scan(instructions: &[Instruction]) -> Self {
        let mut signals = FlatteningSignals {
            switch_dispatcher: has_switch_dispatcher(instructions),
            ..Self::default()
        };

        for pair in instructions.windows(2) {
            if pair[0].is_ldc_i4() && (pair[1].is(opcodes::ADD) || pair[1].is(opcodes::SUB)) {
                signals.constant_arith += 1;
            }
            if pair[0].is_ldc_i4() && pair[1].is_stloc() {
                if let Some(local) = pair[1].local_index() {
                    *signals.state_stores.entry(local).or_insert(0) += 1;
                }
            }
        }

        for window in instructions.windows(4) {
            if window[0].is_ldloc()
                && window[1].is_ldc_i4()
                && window[2].is_fe(opcodes::FE_CEQ)
                && is_boolean_branch(&window[3])
            {
                if let Some(local) = window[0].local_index() {
                    *signals.if_chain.entry(local).or_insert(0) += 1;
                }
            }
        }

        signals.state_update = instructions.windows(6).any(|w| {
            w[0].is_ldloc()
                && w[1].is_ldc_i4()
                && w[2].is(opcodes::MUL)
                && w[3].is_ldc_i4()
                && w[4].is(opcodes::XOR)
                && w[5].is_stloc()
        });

        signals
    }

    /// Total if-chain compares over all locals.
    #[must_use]
    pub fn if_chain_total(&self) -> usize {
        self.if_chain.values().sum()
    }

    /// Total constant stores over all locals.
    #[must_use]
    pub fn state_store_total(&self) -> usize {
        self.state_stores.values().sum()
    }

    /// A local that is both compared in an if-chain and assigned constants often
    /// enough to be a state variable.
    #[must_use]
    pub fn state_local(&self, config: &DetectionConfig) -> Option<u16> {
        self.if_chain
            .iter()
            .filter(|(local, compares)| {
                **compares > config.strict_if_chain_threshold
                    && self.state_stores.get(local).copied().unwrap_or(0)
                        > config.strict_state_store_threshold
            })
            .map(|(local, _)| *local)
            .min()
    }
}

fn is_boolean_branch(instruction: &Instruction) -> bool {
    [
        opcodes::BRFALSE,
        opcodes::BRFALSE_S,
        opcodes::BRTRUE,
        opcodes::BRTRUE_S,
    ]
    .iter()
    .any(|&opcode| instruction.is(opcode))
}

/// Returns true for `ldc.i4 N; rem.un; switch` where the switch has `N` cases.
#[must_use]
pub fn has_switch_dispatcher(instructions: &[Instruction]) -> bool {
    instructions.windows(3).any(|w| {
        let cases = match &w[2].operand {
            Operand::Switch(targets) if w[2].is(opcodes::SWITCH) => targets.len(),
            _ => return false,
        };
        w[1].is(opcodes::REM_UN)
            && w[0]
                .ldc_i4_value()
                .and_then(|n| usize::try_from(n).ok())
                .is_some_and(|n| n == cases)
    })
}

/// Sensitive detector: does this method look flattened?
#[must_use]
pub fn is_obfuscated(instructions: &[Instruction], config: &DetectionConfig) -> bool {
    if instructions.is_empty() {
        return false;
    }

    let signals = FlatteningSignals::scan(instructions);
    signals.switch_dispatcher
        || signals.constant_arith > config.constant_arith_threshold
        || signals.if_chain_total() > config.if_chain_threshold
        || signals.state_store_total() > config.state_store_threshold
        || signals.state_update
}

/// Strict detector: does this method still carry a dispatcher?
#[must_use]
pub fn is_still_obfuscated(instructions: &[Instruction], config: &DetectionConfig) -> bool {
    if instructions.is_empty() {
        return false;
    }

    let signals = FlatteningSignals::scan(instructions);
    signals.switch_dispatcher || signals.state_update || signals.state_local(config).is_some()
}
