//! Builtins lowered to inline opcode sequences.

use crate::{
    bytecode::{Opcode, VmCode},
    error::CompileError,
    symbols::{BuiltinMethod, IndexArgument},
    types::ValueType,
};

/// `len(x)`.
#[derive(Debug)]
pub struct Len;

impl BuiltinMethod for Len {
    fn name(&self) -> &'static str {
        "len"
    }

    fn arg_count(&self) -> usize {
        1
    }

    fn return_type(&self, _args: &[ValueType]) -> ValueType {
        ValueType::NonNegInt
    }

    fn opcodes(&self, args: &[ValueType]) -> Result<Vec<VmCode>, CompileError> {
        match &args[0] {
            ValueType::Any | ValueType::Dict(..) => Ok(vec![VmCode::new(Opcode::Size)]),
            ty if ty.is_sequence() => Ok(vec![VmCode::new(Opcode::Size)]),
            ty => Err(CompileError::unsupported(self.name(), ty)),
        }
    }
}

/// `list.append(value)`.
#[derive(Debug)]
pub struct Append;

impl BuiltinMethod for Append {
    fn name(&self) -> &'static str {
        "append"
    }

    fn arg_count(&self) -> usize {
        2
    }

    fn return_type(&self, _args: &[ValueType]) -> ValueType {
        ValueType::None
    }

    fn opcodes(&self, args: &[ValueType]) -> Result<Vec<VmCode>, CompileError> {
        match &args[0] {
            ValueType::List(_) | ValueType::Any => Ok(vec![VmCode::new(Opcode::Append)]),
            ty => Err(CompileError::unsupported(self.name(), ty)),
        }
    }
}

/// `list.pop()` and `list.pop(index)`.
#[derive(Debug)]
pub struct Pop {
    pub with_index: bool,
}

impl BuiltinMethod for Pop {
    fn name(&self) -> &'static str {
        "pop"
    }

    fn arg_count(&self) -> usize {
        if self.with_index { 2 } else { 1 }
    }

    fn return_type(&self, args: &[ValueType]) -> ValueType {
        args[0].item_type()
    }

    fn index_argument(&self) -> Option<IndexArgument> {
        self.with_index.then_some(IndexArgument { index: 1, collection: 0 })
    }

    fn opcodes(&self, args: &[ValueType]) -> Result<Vec<VmCode>, CompileError> {
        if !matches!(args[0], ValueType::List(_) | ValueType::Any) {
            return Err(CompileError::unsupported(self.name(), &args[0]));
        }
        if !self.with_index {
            return Ok(vec![VmCode::new(Opcode::PopItem)]);
        }
        // [list, i] -> [item] while removing list[i]
        Ok([
            Opcode::Over,
            Opcode::Over,
            Opcode::PickItem,
            Opcode::Reverse3,
            Opcode::Swap,
            Opcode::Remove,
        ]
        .into_iter()
        .map(VmCode::new)
        .collect())
    }
}

/// `abs`, `min` and `max` over integers.
#[derive(Debug)]
pub struct IntFunction {
    name: &'static str,
    opcode: Opcode,
    args: usize,
}

pub const ABS: IntFunction = IntFunction {
    name: "abs",
    opcode: Opcode::Abs,
    args: 1,
};

pub const MIN: IntFunction = IntFunction {
    name: "min",
    opcode: Opcode::Min,
    args: 2,
};

pub const MAX: IntFunction = IntFunction {
    name: "max",
    opcode: Opcode::Max,
    args: 2,
};

impl BuiltinMethod for IntFunction {
    fn name(&self) -> &'static str {
        self.name
    }

    fn arg_count(&self) -> usize {
        self.args
    }

    fn return_type(&self, args: &[ValueType]) -> ValueType {
        let non_negative = |ty: &ValueType| *ty == ValueType::NonNegInt;
        match self.opcode {
            Opcode::Abs => ValueType::NonNegInt,
            Opcode::Max if args.iter().any(non_negative) => ValueType::NonNegInt,
            _ if args.iter().all(non_negative) => ValueType::NonNegInt,
            _ => ValueType::Int,
        }
    }

    fn opcodes(&self, args: &[ValueType]) -> Result<Vec<VmCode>, CompileError> {
        match args.iter().find(|ty| !ty.is_int() && **ty != ValueType::Any) {
            Some(ty) => Err(CompileError::unsupported(self.name, ty)),
            None => Ok(vec![VmCode::new(self.opcode)]),
        }
    }
}

/// Looks up a builtin by the name it is called with.
#[must_use]
pub fn lookup(name: &str) -> Option<&'static dyn BuiltinMethod> {
    static LEN: Len = Len;
    static APPEND: Append = Append;
    static POP: Pop = Pop { with_index: false };
    static POP_INDEX: Pop = Pop { with_index: true };
    static ABS_FN: IntFunction = ABS;
    static MIN_FN: IntFunction = MIN;
    static MAX_FN: IntFunction = MAX;
    let builtin: &'static dyn BuiltinMethod = match name {
        "len" => &LEN,
        "append" => &APPEND,
        "pop" => &POP,
        "pop_index" => &POP_INDEX,
        "abs" => &ABS_FN,
        "min" => &MIN_FN,
        "max" => &MAX_FN,
        _ => return None,
    };
    Some(builtin)
}
