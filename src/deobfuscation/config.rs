//! Configuration for the removal pipeline.
//!
//! [`DeobfuscationConfig`] groups the tunables of the individual engines: the
//! control-flow unflattener, the obfuscation detectors and the anti-tamper removal
//! step. Every group has a `Default` tuned for stock ConfuserEx output.

/// Tunables of the control-flow unflattener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnflattenConfig {
    /// Blocks with more instructions than this are never dispatchers (default: 50).
    pub dispatcher_ceiling: usize,

    /// Safety bound on fixpoint passes per method (default: 256).
    ///
    /// Every pass that changes the graph shortens at least one dispatcher chain, so
    /// real inputs converge long before this.
    pub max_fixpoint_passes: usize,

    /// Instruction budget for evaluating one state expression (default: 10 000).
    pub expression_budget: u64,

    /// Re-check each rewritten method with the strict detector (default: true).
    pub verify: bool,
}

impl Default for UnflattenConfig {
    fn default() -> Self {
        Self {
            dispatcher_ceiling: 50,
            max_fixpoint_passes: 256,
            expression_budget: 10_000,
            verify: true,
        }
    }
}

impl UnflattenConfig {
    /// Sets the dispatcher size ceiling.
    #[must_use]
    pub fn with_dispatcher_ceiling(mut self, ceiling: usize) -> Self {
        self.dispatcher_ceiling = ceiling;
        self
    }

    /// Sets the fixpoint pass bound.
    #[must_use]
    pub fn with_max_fixpoint_passes(mut self, passes: usize) -> Self {
        self.max_fixpoint_passes = passes;
        self
    }

    /// Enables or disables the post-rewrite check.
    #[must_use]
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }
}

/// Thresholds of the sensitive and strict obfuscation detectors.
///
/// The sensitive detector decides whether a method needs unflattening at all, the
/// strict one decides whether unflattening succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionConfig {
    /// Sensitive: `ldc.i4` followed by `add`/`sub` more often than this (default: 5).
    pub constant_arith_threshold: usize,

    /// Sensitive: `ldloc; ldc.i4; ceq; brtrue/brfalse` more often than this (default: 10).
    pub if_chain_threshold: usize,

    /// Sensitive: `ldc.i4; stloc` more often than this (default: 15).
    pub state_store_threshold: usize,

    /// Strict: if-chain compares on one local more often than this (default: 10).
    pub strict_if_chain_threshold: usize,

    /// Strict: constant stores to that same local more often than this (default: 15).
    pub strict_state_store_threshold: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            constant_arith_threshold: 5,
            if_chain_threshold: 10,
            state_store_threshold: 15,
            strict_if_chain_threshold: 10,
            strict_state_store_threshold: 15,
        }
    }
}

/// Tunables of the anti-tamper removal step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntiTamperConfig {
    /// The decrypt method has more instructions than this (default: 100).
    pub decrypt_method_min_instructions: usize,

    /// Try the captured-sequence deriver before the closed form (default: true).
    pub dynamic_derivation: bool,

    /// Unflatten the decrypt method before scanning it when it is obfuscated (default: true).
    pub unflatten_decrypt_method: bool,

    /// Remove the decrypt method and its call after decryption (default: true).
    pub remove_decrypt_method: bool,
}

impl Default for AntiTamperConfig {
    fn default() -> Self {
        Self {
            decrypt_method_min_instructions: 100,
            dynamic_derivation: true,
            unflatten_decrypt_method: true,
            remove_decrypt_method: true,
        }
    }
}

/// Configuration of the whole removal pipeline.
///
/// # Examples
///
/// ```rust
/// use unconfuse::deobfuscation::DeobfuscationConfig;
///
/// let config = DeobfuscationConfig::confuserex().with_dispatcher_ceiling(80);
/// assert_eq!(config.unflatten.dispatcher_ceiling, 80);
/// assert!(config.antitamper.dynamic_derivation);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeobfuscationConfig {
    /// Control-flow unflattener settings.
    pub unflatten: UnflattenConfig,
    /// Detector thresholds.
    pub detection: DetectionConfig,
    /// Anti-tamper removal settings.
    pub antitamper: AntiTamperConfig,
}

impl DeobfuscationConfig {
    /// Creates a new configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings for stock ConfuserEx output; identical to the defaults.
    #[must_use]
    pub fn confuserex() -> Self {
        Self::default()
    }

    /// Settings for heavily modded derivatives.
    ///
    /// This configuration uses:
    /// - A dispatcher ceiling of 100 instructions
    /// - Four times the fixpoint passes
    /// - Lower sensitive thresholds, so more methods are attempted
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            unflatten: UnflattenConfig {
                dispatcher_ceiling: 100,
                max_fixpoint_passes: 1024,
                expression_budget: 100_000,
                verify: true,
            },
            detection: DetectionConfig {
                constant_arith_threshold: 3,
                if_chain_threshold: 5,
                state_store_threshold: 10,
                ..DetectionConfig::default()
            },
            antitamper: AntiTamperConfig::default(),
        }
    }

    /// Sets the dispatcher size ceiling.
    #[must_use]
    pub fn with_dispatcher_ceiling(mut self, ceiling: usize) -> Self {
        self.unflatten.dispatcher_ceiling = ceiling;
        self
    }

    /// Replaces the detector thresholds.
    #[must_use]
    pub fn with_detection(mut self, detection: DetectionConfig) -> Self {
        self.detection = detection;
        self
    }

    /// Replaces the anti-tamper settings.
    #[must_use]
    pub fn with_antitamper(mut self, antitamper: AntiTamperConfig) -> Self {
        self.antitamper = antitamper;
        self
    }

    /// Enables or disables the captured-sequence key deriver.
    #[must_use]
    pub fn with_dynamic_derivation(mut self, enable: bool) -> Self {
        self.antitamper.dynamic_derivation = enable;
        self
    }
}
