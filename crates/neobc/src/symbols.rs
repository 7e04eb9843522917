//! Read-only descriptors handed over by the semantic analyser.
//!
//! The generator only queries these: argument and local layouts, return types,
//! reassignment flags and literal initializers. Nothing here is mutated during
//! generation.

use std::fmt;

use indexmap::IndexMap;

use crate::{bytecode::VmCode, error::CompileError, interop::ContractHash, literal::Literal, types::ValueType};

/// A module-level variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub ty: ValueType,
    /// Literal the variable is initialized with, if any.
    pub literal: Option<Literal>,
    /// Assigned more than once anywhere in the program.
    pub reassigned: bool,
    /// Declared `global` and written from method bodies, so its value must
    /// survive across invocations.
    pub persistent: bool,
}

impl Variable {
    #[must_use]
    pub fn new(ty: ValueType) -> Self {
        Self {
            ty,
            literal: None,
            reassigned: false,
            persistent: false,
        }
    }

    /// Write-once variable initialized with `literal`.
    #[must_use]
    pub fn constant(literal: Literal) -> Self {
        Self {
            ty: literal.value_type(),
            literal: Some(literal),
            reassigned: false,
            persistent: false,
        }
    }

    #[must_use]
    pub fn reassigned(mut self) -> Self {
        self.reassigned = true;
        self
    }

    #[must_use]
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

/// A user-defined function or method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Method {
    /// Arguments in declaration order; instance methods list `self` first.
    pub args: IndexMap<String, ValueType>,
    pub locals: IndexMap<String, ValueType>,
    /// `ValueType::None` for methods that leave nothing on the stack.
    pub return_type: ValueType,
    /// Exported from the contract, hence an entry point.
    pub is_public: bool,
    /// Class constructor; implicitly returns the constructed object.
    pub is_init: bool,
    /// Receives its arguments packed into one array, in declaration order.
    /// Argument loads and stores go through that array.
    pub packs_args: bool,
}

impl Method {
    #[must_use]
    pub fn new(return_type: ValueType) -> Self {
        Self {
            return_type,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_arg(mut self, name: &str, ty: ValueType) -> Self {
        self.args.insert(name.to_owned(), ty);
        self
    }

    #[must_use]
    pub fn with_local(mut self, name: &str, ty: ValueType) -> Self {
        self.locals.insert(name.to_owned(), ty);
        self
    }

    #[must_use]
    pub fn public(mut self) -> Self {
        self.is_public = true;
        self
    }

    #[must_use]
    pub fn packed_args(mut self) -> Self {
        self.packs_args = true;
        self
    }

    /// Argument slots declared by `INITSLOT`.
    #[must_use]
    pub fn arg_slots(&self) -> usize {
        if self.packs_args { 1 } else { self.args.len() }
    }

    #[must_use]
    pub fn constructor(mut self) -> Self {
        self.is_init = true;
        self
    }

    /// Whether a call leaves a value on the caller's stack.
    #[must_use]
    pub fn returns_value(&self) -> bool {
        self.return_type != ValueType::None
    }
}

/// A user class; instances are VM arrays with one slot per field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserClass {
    pub fields: IndexMap<String, ValueType>,
    /// Key of the constructor in [`SymbolTable::methods`].
    pub init: Option<String>,
}

/// A contract event, raised through `System.Runtime.Notify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Name written into the notification.
    pub name: String,
    pub args: Vec<ValueType>,
}

/// Another contract whose hash is statically known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractInterface {
    pub hash: ContractHash,
    pub methods: IndexMap<String, Method>,
}

/// Position of an index argument and of the collection it indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexArgument {
    pub index: usize,
    pub collection: usize,
}

/// A builtin whose body is a straight-line opcode sequence emitted inline.
pub trait BuiltinMethod: fmt::Debug + Sync {
    fn name(&self) -> &'static str;

    fn arg_count(&self) -> usize;

    /// Type left on the stack, `ValueType::None` when nothing is pushed.
    fn return_type(&self, args: &[ValueType]) -> ValueType;

    /// Argument that must have Python negative-index semantics applied before
    /// the builtin runs. Only the last argument may be declared.
    fn index_argument(&self) -> Option<IndexArgument> {
        None
    }

    /// Instructions implementing the builtin for these argument types. They
    /// must not carry jump targets.
    fn opcodes(&self, args: &[ValueType]) -> Result<Vec<VmCode>, CompileError>;
}

/// Every name the generator can resolve.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    pub globals: IndexMap<String, Variable>,
    pub methods: IndexMap<String, Method>,
    pub classes: IndexMap<String, UserClass>,
    pub events: IndexMap<String, Event>,
    pub contracts: IndexMap<String, ContractInterface>,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_global(mut self, name: &str, variable: Variable) -> Self {
        self.globals.insert(name.to_owned(), variable);
        self
    }

    #[must_use]
    pub fn with_method(mut self, name: &str, method: Method) -> Self {
        self.methods.insert(name.to_owned(), method);
        self
    }

    #[must_use]
    pub fn with_class(mut self, name: &str, class: UserClass) -> Self {
        self.classes.insert(name.to_owned(), class);
        self
    }

    #[must_use]
    pub fn with_event(mut self, name: &str, event: Event) -> Self {
        self.events.insert(name.to_owned(), event);
        self
    }

    #[must_use]
    pub fn with_contract(mut self, name: &str, contract: ContractInterface) -> Self {
        self.contracts.insert(name.to_owned(), contract);
        self
    }

    pub fn method(&self, name: &str) -> Result<&Method, CompileError> {
        self.methods
            .get(name)
            .ok_or_else(|| CompileError::UnknownSymbol(name.to_owned()))
    }

    /// Entry points kept by dead-code elimination.
    pub fn public_methods(&self) -> impl Iterator<Item = &str> + '_ {
        self.methods
            .iter()
            .filter(|(_, method)| method.is_public)
            .map(|(name, _)| name.as_str())
    }
}
