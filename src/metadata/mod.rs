//! In-memory model of the parts of a .NET module the protections touch.
//!
//! Decoding metadata tables is outside this crate; callers (or tests) populate a
//! [`Module`] with the types, methods, fields and external member references they
//! loaded elsewhere. The model is deliberately flat:
//!
//! - [`TypeDef`] - a type definition, addressed by [`TypeId`]
//! - [`MethodDef`] - a method with an optional decoded body and its [`ExceptionHandler`]s
//! - [`FieldDef`] - a field with the signature details ref-proxy decoding needs
//! - [`MemberRef`] - a resolved call or field target usable as an instruction operand
//!
//! # Examples
//!
//! ```rust
//! use unconfuse::metadata::{Module, MethodDef, MethodSig, token::Token};
//! use unconfuse::file::Image;
//!
//! let mut module = Module::new(Image::default());
//! let global = module.global_type();
//! module.add_method(MethodDef::new(
//!     Token::new(0x0600_0001),
//!     ".cctor",
//!     global,
//!     MethodSig::new("System.Void", &[]),
//! ));
//!
//! assert!(module.static_constructor().is_some());
//! # Ok::<(), unconfuse::Error>(())
//! ```

pub mod token;

use std::fmt;

use crate::{
    assembly::Instruction,
    file::Image,
    metadata::token::{TableId, Token},
};

/// Index of a type inside its [`Module`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub usize);

/// An external or internal member as seen from an instruction operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberRef {
    /// Token of the member
    pub token: Token,
    /// Full name of the declaring type, e.g. `System.Math`
    pub declaring_type: String,
    /// Member name; empty when the reference names a type
    pub name: String,
    /// Number of declared parameters, `this` excluded
    pub param_count: u16,
    /// True for instance members
    pub has_this: bool,
    /// True if a call pushes a return value
    pub returns_value: bool,
}

impl MemberRef {
    /// Creates a static, parameterless, void member reference.
    #[must_use]
    pub fn new(token: Token, declaring_type: &str, name: &str) -> Self {
        MemberRef {
            token,
            declaring_type: declaring_type.to_string(),
            name: name.to_string(),
            param_count: 0,
            has_this: false,
            returns_value: false,
        }
    }

    /// A reference to a type, as used by `newarr`, `box` or `castclass`.
    #[must_use]
    pub fn type_ref(token: Token, full_name: &str) -> Self {
        Self::new(token, full_name, "")
    }

    /// Sets the parameter count.
    #[must_use]
    pub fn with_params(mut self, count: u16) -> Self {
        self.param_count = count;
        self
    }

    /// Marks the member as an instance member.
    #[must_use]
    pub fn instance(mut self) -> Self {
        self.has_this = true;
        self
    }

    /// Marks the member as returning a value.
    #[must_use]
    pub fn returning(mut self) -> Self {
        self.returns_value = true;
        self
    }

    /// `Type::Name`, or the type name alone for type references.
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.name.is_empty() {
            self.declaring_type.clone()
        } else {
            format!("{}::{}", self.declaring_type, self.name)
        }
    }

    /// Returns true for a type reference (no member name).
    #[must_use]
    pub fn is_type(&self) -> bool {
        self.name.is_empty()
    }
}

/// Method signature reduced to type names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MethodSig {
    /// Full name of the return type
    pub return_type: String,
    /// Full names of the parameter types
    pub params: Vec<String>,
}

impl MethodSig {
    /// Creates a signature from the return type and parameter type names.
    #[must_use]
    pub fn new(return_type: &str, params: &[&str]) -> Self {
        MethodSig {
            return_type: return_type.to_string(),
            params: params.iter().map(|p| (*p).to_string()).collect(),
        }
    }

    /// Returns true if the method returns nothing.
    #[must_use]
    pub fn is_void(&self) -> bool {
        self.return_type == "System.Void"
    }
}

impl fmt::Display for MethodSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.return_type, self.params.join(","))
    }
}

/// A type definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    /// Token of the type
    pub token: Token,
    /// Namespace, empty for the global type
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// Full name of the base type, if any
    pub base_type: Option<String>,
}

impl TypeDef {
    /// Creates a type definition.
    #[must_use]
    pub fn new(token: Token, namespace: &str, name: &str) -> Self {
        TypeDef {
            token,
            namespace: namespace.to_string(),
            name: name.to_string(),
            base_type: None,
        }
    }

    /// Sets the base type.
    #[must_use]
    pub fn extends(mut self, base_type: &str) -> Self {
        self.base_type = Some(base_type.to_string());
        self
    }

    /// `Namespace.Name`, or the bare name without a namespace.
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

/// What runs when control leaves a protected region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Typed `catch` clause
    Catch,
    /// `filter` block followed by its handler
    Filter,
    /// `finally` clause
    Finally,
    /// `fault` clause
    Fault,
}

/// One exception handling clause of a method body, as byte ranges of the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Clause kind
    pub kind: HandlerKind,
    /// Offset of the first protected instruction
    pub try_offset: u64,
    /// Length of the protected region
    pub try_length: u64,
    /// Offset of the first handler instruction
    pub handler_offset: u64,
    /// Length of the handler
    pub handler_length: u64,
}

/// A method definition.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    /// Token of the method
    pub token: Token,
    /// Method name
    pub name: String,
    /// Declaring type
    pub declaring_type: TypeId,
    /// Signature
    pub signature: MethodSig,
    /// True for static methods
    pub is_static: bool,
    /// True if the body is native machine code instead of CIL
    pub is_native: bool,
    /// Decoded CIL body
    pub body: Option<Vec<Instruction>>,
    /// Exception handling clauses of the body
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl MethodDef {
    /// Creates a static method without a body.
    #[must_use]
    pub fn new(token: Token, name: &str, declaring_type: TypeId, signature: MethodSig) -> Self {
        MethodDef {
            token,
            name: name.to_string(),
            declaring_type,
            signature,
            is_static: true,
            is_native: false,
            body: None,
            exception_handlers: Vec::new(),
        }
    }

    /// Sets the CIL body.
    #[must_use]
    pub fn with_body(mut self, body: Vec<Instruction>) -> Self {
        self.body = Some(body);
        self
    }

    /// Adds an exception handling clause.
    #[must_use]
    pub fn with_exception_handler(mut self, handler: ExceptionHandler) -> Self {
        self.exception_handlers.push(handler);
        self
    }

    /// Marks the method as an instance method.
    #[must_use]
    pub fn instance(mut self) -> Self {
        self.is_static = false;
        self
    }

    /// Marks the body as native code.
    #[must_use]
    pub fn native(mut self) -> Self {
        self.is_native = true;
        self
    }

    /// Number of body instructions, zero without a body.
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.body.as_ref().map_or(0, Vec::len)
    }

    /// Returns true for the type initializer.
    #[must_use]
    pub fn is_static_constructor(&self) -> bool {
        self.name == ".cctor"
    }
}

/// A field definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Token of the field
    pub token: Token,
    /// Field name
    pub name: String,
    /// Declaring type
    pub declaring_type: TypeId,
    /// Token of the optional custom modifier leading the field type, if any
    pub modifier_token: Option<Token>,
    /// Trailing bytes of the field signature blob
    pub signature_extra: Vec<u8>,
    /// First integer argument of the field's first custom attribute
    pub attribute_hash: Option<i32>,
}

impl FieldDef {
    /// Creates a plain field.
    #[must_use]
    pub fn new(token: Token, name: &str, declaring_type: TypeId) -> Self {
        FieldDef {
            token,
            name: name.to_string(),
            declaring_type,
            modifier_token: None,
            signature_extra: Vec::new(),
            attribute_hash: None,
        }
    }
}

/// A loaded module: its image plus the type system entries the passes operate on.
#[derive(Debug, Clone)]
pub struct Module {
    /// The PE image the module was loaded from
    pub image: Image,
    types: Vec<Option<TypeDef>>,
    methods: Vec<MethodDef>,
    fields: Vec<FieldDef>,
    member_refs: Vec<MemberRef>,
}

impl Module {
    /// Creates a module containing only the global `<Module>` type.
    #[must_use]
    pub fn new(image: Image) -> Self {
        Module {
            image,
            types: vec![Some(TypeDef::new(
                Token::from_parts(TableId::TypeDef, 1),
                "",
                "<Module>",
            ))],
            methods: Vec::new(),
            fields: Vec::new(),
            member_refs: Vec::new(),
        }
    }

    /// The global `<Module>` type.
    #[must_use]
    pub fn global_type(&self) -> TypeId {
        TypeId(0)
    }

    /// Adds a type and returns its id.
    pub fn add_type(&mut self, type_def: TypeDef) -> TypeId {
        self.types.push(Some(type_def));
        TypeId(self.types.len() - 1)
    }

    /// Adds a method.
    pub fn add_method(&mut self, method: MethodDef) {
        self.methods.push(method);
    }

    /// Adds a field.
    pub fn add_field(&mut self, field: FieldDef) {
        self.fields.push(field);
    }

    /// Registers an external member reference or method instantiation.
    pub fn add_member_ref(&mut self, member: MemberRef) {
        self.member_refs.push(member);
    }

    /// A live type by id.
    #[must_use]
    pub fn type_def(&self, id: TypeId) -> Option<&TypeDef> {
        self.types.get(id.0).and_then(Option::as_ref)
    }

    /// Ids of all live types.
    pub fn type_ids(&self) -> impl Iterator<Item = TypeId> + '_ {
        self.types
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_some())
            .map(|(i, _)| TypeId(i))
    }

    /// All methods.
    #[must_use]
    pub fn methods(&self) -> &[MethodDef] {
        &self.methods
    }

    /// All methods, mutably.
    pub fn methods_mut(&mut self) -> &mut [MethodDef] {
        &mut self.methods
    }

    /// All fields.
    #[must_use]
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Method by token.
    #[must_use]
    pub fn method(&self, token: Token) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.token == token)
    }

    /// Method by token, mutably.
    pub fn method_mut(&mut self, token: Token) -> Option<&mut MethodDef> {
        self.methods.iter_mut().find(|m| m.token == token)
    }

    /// Field by token.
    #[must_use]
    pub fn field(&self, token: Token) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.token == token)
    }

    /// Methods declared by `type_id`.
    pub fn methods_of(&self, type_id: TypeId) -> impl Iterator<Item = &MethodDef> + '_ {
        self.methods
            .iter()
            .filter(move |m| m.declaring_type == type_id)
    }

    /// The static constructor of the global type.
    #[must_use]
    pub fn static_constructor(&self) -> Option<&MethodDef> {
        self.methods_of(self.global_type())
            .find(|m| m.is_static_constructor())
    }

    /// Removes a method and returns it.
    pub fn remove_method(&mut self, token: Token) -> Option<MethodDef> {
        let index = self.methods.iter().position(|m| m.token == token)?;
        Some(self.methods.remove(index))
    }

    /// Removes a type together with its methods and fields.
    ///
    /// The global type cannot be removed; the call returns `false` for it.
    pub fn remove_type(&mut self, id: TypeId) -> bool {
        if id == self.global_type() {
            return false;
        }
        match self.types.get_mut(id.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.methods.retain(|m| m.declaring_type != id);
                self.fields.retain(|f| f.declaring_type != id);
                true
            }
            _ => false,
        }
    }

    /// The operand form of a method defined in this module.
    #[must_use]
    pub fn method_ref(&self, method: &MethodDef) -> MemberRef {
        let declaring_type = self
            .type_def(method.declaring_type)
            .map(TypeDef::full_name)
            .unwrap_or_default();
        MemberRef {
            token: method.token,
            declaring_type,
            name: method.name.clone(),
            param_count: u16::try_from(method.signature.params.len()).unwrap_or(u16::MAX),
            has_this: !method.is_static,
            returns_value: !method.signature.is_void(),
        }
    }

    /// Resolves a callable token to its operand form.
    ///
    /// Method definitions resolve through [`Self::method_ref`]; member references and
    /// method instantiations resolve through the registered references.
    #[must_use]
    pub fn resolve_member(&self, token: Token) -> Option<MemberRef> {
        if token.table() == TableId::MethodDef as u8 {
            return self.method(token).map(|m| self.method_ref(m));
        }
        self.member_refs.iter().find(|m| m.token == token).cloned()
    }
}
