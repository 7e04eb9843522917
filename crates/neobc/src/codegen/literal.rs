//! Literal materialization and type casts.

use num_bigint::BigInt;
use num_traits::ToPrimitive;

use super::CodeGenerator;
use crate::{
    bytecode::{Opcode, VmCode},
    error::CompileError,
    literal::Literal,
    tracer::CodegenTracer,
    types::{StackItemType, ValueType},
};

/// Widths of the `PUSHINT*` family, smallest first.
const PUSH_INT_WIDTHS: [(usize, Opcode); 6] = [
    (1, Opcode::PushInt8),
    (2, Opcode::PushInt16),
    (4, Opcode::PushInt32),
    (8, Opcode::PushInt64),
    (16, Opcode::PushInt128),
    (32, Opcode::PushInt256),
];

/// Shortest instruction sequence pushing `value`.
pub(super) fn integer_codes(value: &BigInt) -> Result<Vec<VmCode>, CompileError> {
    if let Some(small) = value.to_i64() {
        if let Some(opcode) = Opcode::push_small(small) {
            return Ok(vec![VmCode::new(opcode)]);
        }
        if (-16..=-2).contains(&small)
            && let Some(opcode) = Opcode::push_small(-small)
        {
            return Ok(vec![VmCode::new(opcode), VmCode::new(Opcode::Negate)]);
        }
    }
    let mut bytes = value.to_signed_bytes_le();
    let Some(&(width, opcode)) = PUSH_INT_WIDTHS.iter().find(|(width, _)| *width >= bytes.len()) else {
        return Err(CompileError::IntegerTooWide { bytes: bytes.len() });
    };
    let fill = if value.sign() == num_bigint::Sign::Minus { 0xFF } else { 0x00 };
    bytes.resize(width, fill);
    Ok(vec![VmCode::with_data(opcode, &bytes)])
}

impl<Tr: CodegenTracer> CodeGenerator<'_, Tr> {
    /// Pushes a literal of any category.
    pub fn convert_literal(&mut self, literal: &Literal) -> Result<(), CompileError> {
        match literal {
            Literal::None => {
                self.op(Opcode::PushNull, 0, Some(ValueType::None));
            }
            Literal::Bool(value) => {
                let opcode = if *value { Opcode::PushT } else { Opcode::PushF };
                self.op(opcode, 0, Some(ValueType::Bool));
            }
            Literal::Int(value) => self.convert_integer(value)?,
            Literal::Str(value) => {
                self.push_data(value.as_bytes());
                self.convert_cast(ValueType::Str);
            }
            Literal::Bytes(value) => {
                self.push_data(value);
                self.convert_cast(ValueType::Bytes);
            }
            Literal::Sequence(items) => {
                let ty = literal.value_type();
                if items.is_empty() {
                    self.op(Opcode::NewArray0, 0, Some(ty));
                    return Ok(());
                }
                for item in items.iter().rev() {
                    self.convert_literal(item)?;
                }
                self.push_index(items.len());
                self.op(Opcode::Pack, items.len() + 1, Some(ty));
            }
            Literal::Mapping(pairs) => {
                self.op(Opcode::NewMap, 0, Some(literal.value_type()));
                for (key, value) in pairs {
                    self.dup();
                    self.convert_literal(key)?;
                    self.convert_literal(value)?;
                    self.op(Opcode::SetItem, 3, None);
                }
            }
        }
        Ok(())
    }

    pub fn convert_integer(&mut self, value: &BigInt) -> Result<(), CompileError> {
        for code in integer_codes(value)? {
            self.insert(code);
        }
        let ty = if value.sign() == num_bigint::Sign::Minus {
            ValueType::Int
        } else {
            ValueType::NonNegInt
        };
        self.push_type(ty);
        Ok(())
    }

    /// Pushes raw bytes with the smallest length prefix that fits.
    pub(super) fn push_data(&mut self, bytes: &[u8]) {
        self.emit_data(Opcode::push_data_for(bytes.len()), bytes);
        self.push_type(ValueType::Bytes);
    }

    /// Retags the top of the stack as `ty`, emitting `CONVERT` only when the VM
    /// representation changes.
    pub fn convert_cast(&mut self, ty: ValueType) {
        let from = self.stack.peek(0).stack_item();
        let to = ty.stack_item();
        let scalar = |item: StackItemType| {
            matches!(
                item,
                StackItemType::ByteString | StackItemType::Buffer | StackItemType::Integer | StackItemType::Boolean
            )
        };
        if from != to && scalar(from) && scalar(to) {
            self.emit_data(Opcode::Convert, &[to as u8]);
        }
        let at = self.map.last();
        self.stack.pop(at);
        self.stack.push(at, ty);
    }
}
