//! ConfuserEx reference-proxy removal.
//!
//! The strong reference-proxy mode replaces every call site with an invocation of a
//! static delegate field:
//!
//! ```text
//! ldsfld  <Delegate> field
//! <arguments>
//! call    <Delegate>::Invoke
//! ```
//!
//! Each delegate type's static constructor fills its fields by calling a handler
//! in the global type, `void Handler(RuntimeFieldHandle, byte)`:
//!
//! ```text
//! ldtoken field
//! ldc.i4  opKey
//! call    Handler
//! ```
//!
//! The handler recovers the real target from the field itself. Its name characters,
//! the trailing bytes of its signature, the optional modifier on its type and a
//! custom attribute argument are combined into the target's metadata token, and one
//! more name character gives the call opcode. [`ProxyHandler`] recomputes both
//! statically; [`RefProxy`] then rewrites every invocation back into a direct call
//! and deletes the handlers and delegate types.

use std::collections::{BTreeSet, HashMap};

use crate::{
    assembly::{opcodes, Instruction, Operand},
    deobfuscation::{
        obfuscators::confuserex::remove_instructions,
        protection::{Protection, ProtectionId},
        ControlFlowDeobfuscator, DeobfuscationConfig, EventKind, EventLog,
    },
    emulation::{emulate, EmValue, EmulationContext},
    metadata::{token::Token, FieldDef, MemberRef, MethodDef, Module, TypeDef, TypeId},
    Error, Result,
};

/// Signature of the proxy handler methods.
pub const HANDLER_SIGNATURE: &str = "System.Void (System.RuntimeFieldHandle,System.Byte)";

const NAME: &str = "RefProxy";

/// Constants a handler uses to decode fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerKeys {
    /// Indices into the field name; the first four feed the token, the last the opcode
    pub name_chars: [usize; 5],
    /// Shift applied to each of the four token terms
    pub shifts: [u32; 4],
}

impl HandlerKeys {
    /// Reads the constants from a handler body.
    ///
    /// Name indices are the `ldc.i4` right after a `callvirt` to `get_Name`; shifts are
    /// the `ldc.i4` right before a `shl`. The first five and four are used.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if fewer constants are found.
    pub fn scan(instructions: &[Instruction]) -> Result<Self> {
        let mut name_chars = Vec::with_capacity(5);
        let mut shifts = Vec::with_capacity(4);

        for i in 0..instructions.len().saturating_sub(2) {
            let instruction = &instructions[i];
            let reads_name = instruction.is(opcodes::CALLVIRT)
                && instruction
                    .member()
                    .is_some_and(|member| member.name.contains("get_Name"));

            if reads_name {
                if let Some(index) = instructions[i + 1].ldc_i4_value() {
                    if name_chars.len() < 5 {
                        name_chars.push(usize::try_from(index).map_err(|_| {
                            malformed_error!("Negative name index {} in proxy handler", index)
                        })?);
                    }
                }
            } else if instruction.is(opcodes::SHL) && i > 0 {
                if let Some(shift) = instructions[i - 1].ldc_i4_value() {
                    if shifts.len() < 4 {
                        shifts.push(shift as u32);
                    }
                }
            }

            if name_chars.len() == 5 && shifts.len() == 4 {
                break;
            }
        }

        match (<[usize; 5]>::try_from(name_chars.as_slice()), <[u32; 4]>::try_from(shifts.as_slice())) {
            (Ok(name_chars), Ok(shifts)) => Ok(HandlerKeys { name_chars, shifts }),
            _ => Err(malformed_error!(
                "Incomplete proxy handler constants: {} name indices, {} shifts",
                name_chars.len(),
                shifts.len()
            )),
        }
    }
}

/// A decoded proxy handler.
#[derive(Debug, Clone)]
pub struct ProxyHandler {
    /// Token of the handler method
    pub token: Token,
    /// Its decoding constants
    pub keys: HandlerKeys,
    encoder: Vec<Instruction>,
}

impl ProxyHandler {
    /// Decodes `handler`.
    ///
    /// The key encoder is the last method of the global type called by the handler
    /// that takes one argument and returns `System.Int32`.
    ///
    /// # Errors
    ///
    /// - [`Error::Empty`] if the handler has no body
    /// - [`Error::Malformed`] if its constants are incomplete
    /// - [`Error::NotSupported`] if the encoder is native code or missing
    pub fn new(module: &Module, handler: &MethodDef) -> Result<Self> {
        let body = handler.body.as_deref().ok_or(Error::Empty)?;
        let keys = HandlerKeys::scan(body)?;

        let mut encoder = None;
        for callee in body
            .iter()
            .filter(|i| i.is(opcodes::CALL))
            .filter_map(Instruction::token)
            .filter_map(|token| module.method(token))
        {
            if callee.is_native {
                log::warn!("Proxy handler '{}' uses native encoder '{}'", handler.name, callee.name);
                return Err(Error::NotSupported);
            }
            if callee.declaring_type == module.global_type()
                && callee.signature.params.len() == 1
                && callee.signature.return_type == "System.Int32"
            {
                encoder = callee.body.clone();
            }
        }

        let Some(encoder) = encoder else {
            log::warn!("Proxy handler '{}' has no managed encoder", handler.name);
            return Err(Error::NotSupported);
        };

        Ok(ProxyHandler {
            token: handler.token,
            keys,
            encoder,
        })
    }

    /// Runs the encoder on `key`.
    ///
    /// # Errors
    ///
    /// Returns the emulation error, or [`Error::Malformed`] if the encoder does not
    /// return a 32-bit integer.
    pub fn encode(&self, key: i32) -> Result<i32> {
        let context = emulate(&self.encoder, EmulationContext::new().with_arg(0, EmValue::I32(key)))?;
        context
            .return_value()
            .and_then(EmValue::as_i32)
            .ok_or_else(|| malformed_error!("Proxy key encoder returned no integer"))
    }

    /// Computes the metadata token of the member `field` stands for.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if the field lacks its modifier, its attribute hash,
    /// four signature bytes or a name character, and the encoder's errors.
    pub fn method_token(&self, field: &FieldDef) -> Result<Token> {
        let modifier = field
            .modifier_token
            .ok_or_else(|| malformed_error!("Proxy field '{}' has no type modifier", field.name))?;
        let hash = field
            .attribute_hash
            .ok_or_else(|| malformed_error!("Proxy field '{}' has no hash attribute", field.name))?;
        let extra = &field.signature_extra;
        if extra.len() < 4 {
            return Err(malformed_error!(
                "Proxy field '{}' signature has {} trailing bytes",
                field.name,
                extra.len()
            ));
        }

        let mut sum = 0u32;
        for k in 0..4 {
            let unit = name_unit(field, self.keys.name_chars[k])?;
            let byte = u16::from(extra[extra.len() - 1 - k]);
            sum = sum.wrapping_add(u32::from(unit ^ byte).wrapping_shl(self.keys.shifts[k]));
        }

        let key = self.encode(modifier.value().wrapping_add(sum) as i32)?;
        Ok(Token::new(key.wrapping_mul(hash) as u32))
    }

    /// The call opcode for `field`, decoded with the call site's `op_key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] unless the result is `call`, `callvirt` or `newobj`.
    pub fn opcode(&self, field: &FieldDef, op_key: u8) -> Result<u8> {
        let code = name_unit(field, self.keys.name_chars[4])? ^ u16::from(op_key);
        match u8::try_from(code) {
            Ok(opcode @ (opcodes::CALL | opcodes::CALLVIRT | opcodes::NEWOBJ)) => Ok(opcode),
            _ => Err(malformed_error!(
                "Proxy field '{}' decodes to opcode 0x{:X}",
                field.name,
                code
            )),
        }
    }
}

fn name_unit(field: &FieldDef, index: usize) -> Result<u16> {
    field.name.encode_utf16().nth(index).ok_or_else(|| {
        malformed_error!("Proxy field name '{}' is shorter than {}", field.name, index + 1)
    })
}

/// A resolved proxy field: the opcode and member of the original call.
type Resolved = HashMap<Token, (u8, MemberRef)>;

/// The reference-proxy removal step.
#[derive(Debug, Clone)]
pub struct RefProxy {
    unflattener: ControlFlowDeobfuscator,
    handlers: Vec<Token>,
}

impl RefProxy {
    /// Creates the step.
    #[must_use]
    pub fn new(config: &DeobfuscationConfig) -> Self {
        RefProxy {
            unflattener: ControlFlowDeobfuscator::new(config),
            handlers: Vec::new(),
        }
    }

    /// Handlers found by the last [`Protection::detect`].
    #[must_use]
    pub fn handlers(&self) -> &[Token] {
        &self.handlers
    }

    fn unflatten_handler(&self, module: &mut Module, token: Token, events: &EventLog) {
        let Some(handler) = module.method(token) else {
            return;
        };
        let Some(body) = handler.body.as_deref() else {
            return;
        };
        if !self.unflattener.needs_unflattening(body) {
            return;
        }

        match self.unflattener.deobfuscate_method(handler, events) {
            Ok(body) => {
                if let Some(handler) = module.method_mut(token) {
                    handler.body = Some(body);
                }
            }
            Err(error) => {
                log::warn!("Failed to unflatten proxy handler {token}: {error}");
                events.warn(format!("proxy handler {token} kept flattened: {error}"));
            }
        }
    }

    fn resolve_fields(
        module: &Module,
        instances: &[Token],
        handlers: &HashMap<Token, ProxyHandler>,
        events: &EventLog,
    ) -> Result<Resolved> {
        let mut resolved = Resolved::new();
        for &instance in instances {
            let Some(body) = module.method(instance).and_then(|m| m.body.as_deref()) else {
                continue;
            };

            for window in body.windows(3) {
                let [ldtoken, key, call] = window else {
                    continue;
                };
                if !ldtoken.is(opcodes::LDTOKEN) || !call.is(opcodes::CALL) {
                    continue;
                }
                let (Some(op_key), Some(handler), Some(field)) = (
                    key.ldc_i4_value(),
                    call.token().and_then(|token| handlers.get(&token)),
                    ldtoken.token().and_then(|token| module.field(token)),
                ) else {
                    continue;
                };

                let token = handler.method_token(field)?;
                let opcode = handler.opcode(field, op_key as u8)?;
                if !token.is_method_like() {
                    log::warn!("Proxy field '{}' resolves to non-method token {token}", field.name);
                    events.warn(format!("proxy field '{}' skipped: token {token}", field.name));
                    continue;
                }
                let Some(target) = module.resolve_member(token) else {
                    log::warn!("Proxy field '{}' resolves to unknown member {token}", field.name);
                    events.warn(format!("proxy field '{}' skipped: unknown {token}", field.name));
                    continue;
                };

                events
                    .record(EventKind::ProxyResolved)
                    .at(instance, ldtoken.offset)
                    .message(format!("'{}' is {}", field.name, target.full_name()));
                resolved.insert(field.token, (opcode, target));
            }
        }
        Ok(resolved)
    }

    /// What a call to a static method of a delegate type stands for.
    fn static_invoke_target(invoke: &MethodDef, resolved: &Resolved) -> Option<(u8, MemberRef)> {
        let body = invoke.body.as_deref()?;
        let first = body.first()?;
        if first.is(opcodes::LDSFLD) {
            let field = first.token()?;
            let target = resolved.get(&field).cloned();
            if target.is_none() {
                log::warn!("Static invoke '{}' reads unresolved field {field}", invoke.name);
            }
            return target;
        }

        // Already rewritten: the forwarded call follows the argument loads.
        let forwarded = body.get(invoke.signature.params.len())?;
        (forwarded.prefix == 0)
            .then(|| forwarded.member().map(|member| (forwarded.opcode, member.clone())))
            .flatten()
    }

    /// Rewrites the proxy invocations of one body.
    ///
    /// Returns `None` if the body has none.
    fn rewrite_body(
        module: &Module,
        body: &[Instruction],
        resolved: &Resolved,
        delegate_types: &BTreeSet<TypeId>,
    ) -> Result<Option<(Vec<Instruction>, usize)>> {
        let field_type = |field: Token| {
            module
                .field(field)
                .and_then(|f| module.type_def(f.declaring_type))
                .map(TypeDef::full_name)
        };

        let mut fields = Vec::new();
        let mut removed = Vec::new();
        let mut rewritten = body.to_vec();
        let mut replaced = 0;

        for (index, instruction) in body.iter().enumerate() {
            if instruction.is(opcodes::LDSFLD) {
                if let Some(field) = instruction.token().filter(|t| resolved.contains_key(t)) {
                    fields.push(field);
                    removed.push(instruction.offset);
                }
                continue;
            }
            if !instruction.is(opcodes::CALL) {
                continue;
            }
            let Some(member) = instruction.member() else {
                continue;
            };

            let pending = fields
                .last()
                .copied()
                .filter(|field| field_type(*field).as_deref() == Some(member.declaring_type.as_str()));
            let target = if let Some(field) = pending {
                fields.pop();
                resolved.get(&field).cloned()
            } else {
                module
                    .method(member.token)
                    .filter(|invoke| delegate_types.contains(&invoke.declaring_type))
                    .and_then(|invoke| Self::static_invoke_target(invoke, resolved))
            };

            if let Some((opcode, member)) = target {
                rewritten[index] =
                    Instruction::new(0, opcode, Operand::Member(member))?.at(instruction.offset);
                replaced += 1;
            }
        }

        if !fields.is_empty() {
            return Err(malformed_error!(
                "{} proxy field load(s) without a matching invocation",
                fields.len()
            ));
        }
        if replaced == 0 && removed.is_empty() {
            return Ok(None);
        }
        Ok(Some((remove_instructions(&rewritten, &removed)?, replaced)))
    }
}

impl Protection for RefProxy {
    fn id(&self) -> ProtectionId {
        ProtectionId::RefProxy
    }

    fn name(&self) -> &'static str {
        NAME
    }

    fn detect(&mut self, module: &Module, _events: &EventLog) -> bool {
        self.handlers = module
            .methods_of(module.global_type())
            .filter(|method| method.signature.to_string() == HANDLER_SIGNATURE)
            .map(|method| method.token)
            .collect();
        !self.handlers.is_empty()
    }

    fn remove(&mut self, module: &mut Module, events: &EventLog) -> Result<()> {
        let mut handlers = HashMap::new();
        let mut instances = Vec::new();
        let mut delegate_types = BTreeSet::new();

        for &token in &self.handlers {
            for method in module.methods() {
                let calls_handler = method.body.as_deref().is_some_and(|body| {
                    body.iter()
                        .any(|i| i.is(opcodes::CALL) && i.token() == Some(token))
                });
                if calls_handler && !instances.contains(&method.token) {
                    instances.push(method.token);
                    delegate_types.insert(method.declaring_type);
                }
            }

            self.unflatten_handler(module, token, events);
            let Some(handler) = module.method(token) else {
                continue;
            };
            match ProxyHandler::new(module, handler) {
                Ok(decoded) => {
                    log::debug!("Proxy handler {token}: {:?}", decoded.keys);
                    handlers.insert(token, decoded);
                }
                Err(Error::NotSupported) => return Err(Error::NotSupported),
                Err(error) => {
                    log::warn!("Skipping proxy handler {token}: {error}");
                    events.warn(format!("proxy handler {token} skipped: {error}"));
                }
            }
        }

        let resolved = Self::resolve_fields(module, &instances, &handlers, events)?;
        log::info!("Resolved {} proxy fields", resolved.len());

        let tokens: Vec<Token> = module.methods().iter().map(|m| m.token).collect();
        for token in tokens {
            let Some(body) = module.method(token).and_then(|m| m.body.as_deref()) else {
                continue;
            };
            let Some((body, replaced)) = Self::rewrite_body(module, body, &resolved, &delegate_types)?
            else {
                continue;
            };
            log::debug!("Rewrote {replaced} proxy invocation(s) in {token}");
            if let Some(method) = module.method_mut(token) {
                method.body = Some(body);
            }
        }

        for &token in &self.handlers {
            if let Some(handler) = module.remove_method(token) {
                events
                    .record(EventKind::ArtifactRemoved)
                    .method(token)
                    .message(format!("proxy handler '{}'", handler.name));
            }
        }
        for id in delegate_types {
            let name = module.type_def(id).map(TypeDef::full_name).unwrap_or_default();
            if module.remove_type(id) {
                events
                    .record(EventKind::ArtifactRemoved)
                    .message(format!("delegate type '{name}'"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::InstructionAssembler,
        file::Image,
        metadata::{MethodSig, TypeDef},
    };

    const HANDLER: Token = Token(0x0600_0001);
    const ENCODER: Token = Token(0x0600_0002);
    const DELEGATE_CCTOR: Token = Token(0x0600_0003);
    const INVOKE: Token = Token(0x0600_0004);
    const CALLER: Token = Token(0x0600_0005);
    const FIELD: Token = Token(0x0400_0001);
    const TARGET: Token = Token(0x0A00_0005);
    const MODIFIER: u32 = 0x0100_0003;

    fn get_name() -> MemberRef {
        MemberRef::new(Token::new(0x0A00_0001), "System.Reflection.MemberInfo", "get_Name")
            .instance()
            .returning()
    }

    fn handler_body(encoder: MemberRef) -> Vec<Instruction> {
        let mut asm = InstructionAssembler::new();
        for index in 0..5 {
            asm.ldnull()
                .unwrap()
                .callvirt(get_name())
                .unwrap()
                .ldc_i4(index)
                .unwrap()
                .pop()
                .unwrap()
                .pop()
                .unwrap();
        }
        for shift in [0, 8, 16, 24] {
            asm.ldc_i4(1).unwrap().ldc_i4(shift).unwrap().shl().unwrap().pop().unwrap();
        }
        asm.ldc_i4(0)
            .unwrap()
            .call(encoder)
            .unwrap()
            .pop()
            .unwrap()
            .ret()
            .unwrap();
        asm.finish().unwrap()
    }

    fn inverse(value: u32) -> u32 {
        let mut inverse = value;
        for _ in 0..5 {
            inverse = inverse.wrapping_mul(2u32.wrapping_sub(value.wrapping_mul(inverse)));
        }
        inverse
    }

    /// Key of field "ABCDE" with trailing signature bytes 01 02 03 04, before
    /// encoding: the four xor terms shifted by 0, 8, 16 and 24.
    fn raw_key() -> u32 {
        let terms = (0x41u32 ^ 0x04) | (0x42 ^ 0x03) << 8 | (0x43 ^ 0x02) << 16 | (0x44 ^ 0x01) << 24;
        MODIFIER.wrapping_add(terms)
    }

    fn encoded_key() -> u32 {
        raw_key() ^ 0x55
    }

    fn protected_module() -> Module {
        let mut module = Module::new(Image::default());
        let global = module.global_type();
        let delegate = module.add_type(
            TypeDef::new(Token::new(0x0200_0002), "", "Proxy").extends("System.MulticastDelegate"),
        );
        let program = module.add_type(TypeDef::new(Token::new(0x0200_0003), "App", "Program"));

        let mut asm = InstructionAssembler::new();
        asm.ldarg_0().unwrap().ldc_i4(0x55).unwrap().xor().unwrap().ret().unwrap();
        module.add_method(
            MethodDef::new(ENCODER, "Encode", global, MethodSig::new("System.Int32", &["System.Int32"]))
                .with_body(asm.finish().unwrap()),
        );
        let encoder = module.method_ref(module.method(ENCODER).unwrap());
        module.add_method(
            MethodDef::new(
                HANDLER,
                "Handler",
                global,
                MethodSig::new("System.Void", &["System.RuntimeFieldHandle", "System.Byte"]),
            )
            .with_body(handler_body(encoder)),
        );

        module.add_field(FieldDef {
            modifier_token: Some(Token::new(MODIFIER)),
            signature_extra: vec![0x01, 0x02, 0x03, 0x04],
            attribute_hash: Some(TARGET.value().wrapping_mul(inverse(encoded_key())) as i32),
            ..FieldDef::new(FIELD, "ABCDE", delegate)
        });

        let handler = module.method_ref(module.method(HANDLER).unwrap());
        let mut asm = InstructionAssembler::new();
        asm.ldtoken(FIELD)
            .unwrap()
            .ldc_i4(i32::from(0x45u8 ^ opcodes::CALL))
            .unwrap()
            .call(handler)
            .unwrap()
            .ret()
            .unwrap();
        module.add_method(
            MethodDef::new(DELEGATE_CCTOR, ".cctor", delegate, MethodSig::new("System.Void", &[]))
                .with_body(asm.finish().unwrap()),
        );
        module.add_method(
            MethodDef::new(INVOKE, "Invoke", delegate, MethodSig::new("System.Void", &["System.String"]))
                .instance(),
        );

        module.add_member_ref(MemberRef::new(TARGET, "System.Console", "WriteLine").with_params(1));

        let invoke = module.method_ref(module.method(INVOKE).unwrap());
        let mut asm = InstructionAssembler::new();
        asm.ldsfld(FIELD)
            .unwrap()
            .ldstr("hi")
            .unwrap()
            .call(invoke)
            .unwrap()
            .ret()
            .unwrap();
        module.add_method(
            MethodDef::new(CALLER, "Main", program, MethodSig::new("System.Void", &[]))
                .with_body(asm.finish().unwrap()),
        );
        module
    }

    #[test]
    fn test_handler_keys() {
        let keys = HandlerKeys::scan(&handler_body(get_name())).unwrap();
        assert_eq!(keys.name_chars, [0, 1, 2, 3, 4]);
        assert_eq!(keys.shifts, [0, 8, 16, 24]);

        let mut asm = InstructionAssembler::new();
        asm.ldc_i4(1).unwrap().ldc_i4(3).unwrap().shl().unwrap().ret().unwrap();
        assert!(HandlerKeys::scan(&asm.finish().unwrap()).is_err());
    }

    #[test]
    fn test_token_arithmetic() {
        let module = protected_module();
        let handler = ProxyHandler::new(&module, module.method(HANDLER).unwrap()).unwrap();
        let field = module.field(FIELD).unwrap();

        assert_eq!(handler.encode(raw_key() as i32).unwrap(), encoded_key() as i32);
        assert_eq!(handler.method_token(field).unwrap(), TARGET);
        assert_eq!(handler.opcode(field, 0x45 ^ opcodes::CALL).unwrap(), opcodes::CALL);
        assert!(handler.opcode(field, 0).is_err());
    }

    #[test]
    fn test_missing_field_data() {
        let module = protected_module();
        let handler = ProxyHandler::new(&module, module.method(HANDLER).unwrap()).unwrap();
        let bare = FieldDef::new(FIELD, "ABCDE", module.global_type());
        assert!(handler.method_token(&bare).is_err());
    }

    #[test]
    fn test_native_encoder_not_supported() {
        let mut module = protected_module();
        module.method_mut(ENCODER).unwrap().is_native = true;
        let result = ProxyHandler::new(&module, module.method(HANDLER).unwrap());
        assert!(matches!(result, Err(Error::NotSupported)));
    }

    #[test]
    fn test_remove_rewrites_invocation() {
        let mut module = protected_module();
        let events = EventLog::new();
        let mut step = RefProxy::new(&DeobfuscationConfig::default());

        assert!(step.detect(&module, &events));
        assert_eq!(step.handlers(), &[HANDLER]);
        step.remove(&mut module, &events).unwrap();

        let body = module.method(CALLER).unwrap().body.as_deref().unwrap();
        assert_eq!(body.len(), 3);
        assert_eq!(body[0].mnemonic, "ldstr");
        assert!(body[1].is(opcodes::CALL));
        assert_eq!(body[1].token(), Some(TARGET));
        assert!(body[2].is_return());

        assert!(module.method(HANDLER).is_none());
        assert!(module.method(INVOKE).is_none());
        assert!(module.field(FIELD).is_none());
        assert!(module.method(ENCODER).is_some());
        assert!(events.has(EventKind::ProxyResolved));
        assert_eq!(events.count_kind(EventKind::ArtifactRemoved), 2);
    }

    #[test]
    fn test_absent_without_handlers() {
        let mut module = protected_module();
        module.remove_method(HANDLER);
        let mut step = RefProxy::new(&DeobfuscationConfig::default());
        assert!(!step.detect(&module, &EventLog::new()));
    }
}
