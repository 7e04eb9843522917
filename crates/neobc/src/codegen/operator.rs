//! Unary and binary operators.
//!
//! Operands are already on the stack, right operand on top. Integer division
//! and modulo follow Python's flooring semantics, so both get a short fixup
//! after the VM's truncating `DIV`/`MOD`.

use super::CodeGenerator;
use crate::{
    bytecode::{Opcode, Target},
    error::CompileError,
    tracer::CodegenTracer,
    types::ValueType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum BinaryOp {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "//")]
    FloorDiv,
    #[strum(serialize = "%")]
    Mod,
    #[strum(serialize = "**")]
    Pow,
    #[strum(serialize = "&")]
    BitAnd,
    #[strum(serialize = "|")]
    BitOr,
    #[strum(serialize = "^")]
    BitXor,
    #[strum(serialize = "<<")]
    LShift,
    #[strum(serialize = ">>")]
    RShift,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    NotEq,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    LtE,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    GtE,
    #[strum(serialize = "is")]
    Is,
    #[strum(serialize = "is not")]
    IsNot,
    #[strum(serialize = "in")]
    In,
    #[strum(serialize = "not in")]
    NotIn,
    #[strum(serialize = "and")]
    And,
    #[strum(serialize = "or")]
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum UnaryOp {
    #[strum(serialize = "-")]
    Neg,
    #[strum(serialize = "+")]
    Pos,
    #[strum(serialize = "not")]
    Not,
    #[strum(serialize = "~")]
    Invert,
}

/// Integer operand, or a value whose type is not known statically.
fn int_like(ty: &ValueType) -> bool {
    ty.is_int() || matches!(ty, ValueType::Any | ValueType::Bool)
}

impl<Tr: CodegenTracer> CodeGenerator<'_, Tr> {
    pub fn convert_unary_op(&mut self, op: UnaryOp) -> Result<(), CompileError> {
        let operand = self.stack.peek(0);
        match op {
            UnaryOp::Pos if int_like(&operand) => {}
            UnaryOp::Neg if int_like(&operand) => {
                self.op(Opcode::Negate, 1, Some(ValueType::Int));
            }
            UnaryOp::Invert if int_like(&operand) => {
                self.op(Opcode::Invert, 1, Some(ValueType::Int));
            }
            UnaryOp::Not => {
                self.op(Opcode::Not, 1, Some(ValueType::Bool));
            }
            _ => return Err(CompileError::unsupported(op.to_string(), &operand)),
        }
        Ok(())
    }

    pub fn convert_binary_op(&mut self, op: BinaryOp) -> Result<(), CompileError> {
        let right = self.stack.peek(0);
        let left = self.stack.peek(1);
        let ints = int_like(&left) && int_like(&right);
        let non_negative = left == ValueType::NonNegInt && right == ValueType::NonNegInt;
        let unsupported = || {
            let operand = if int_like(&left) { right.clone() } else { left.clone() };
            CompileError::unsupported(op.to_string(), &operand)
        };

        match op {
            BinaryOp::Add if ints => {
                let ty = if non_negative { ValueType::NonNegInt } else { ValueType::Int };
                self.op(Opcode::Add, 2, Some(ty));
            }
            BinaryOp::Add if left.is_byte_like() && right.is_byte_like() => {
                self.op(Opcode::Cat, 2, Some(ValueType::ByteArray));
                self.convert_cast(left.clone());
            }
            BinaryOp::Mul | BinaryOp::Pow if ints => {
                let ty = if non_negative { ValueType::NonNegInt } else { ValueType::Int };
                let opcode = if op == BinaryOp::Mul { Opcode::Mul } else { Opcode::Pow };
                self.op(opcode, 2, Some(ty));
            }
            BinaryOp::Sub | BinaryOp::LShift | BinaryOp::RShift if ints => {
                let opcode = match op {
                    BinaryOp::Sub => Opcode::Sub,
                    BinaryOp::LShift => Opcode::Shl,
                    _ => Opcode::Shr,
                };
                self.op(opcode, 2, Some(ValueType::Int));
            }
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor if ints => {
                let opcode = match op {
                    BinaryOp::BitAnd => Opcode::And,
                    BinaryOp::BitOr => Opcode::Or,
                    _ => Opcode::Xor,
                };
                let ty = if left == ValueType::Bool && right == ValueType::Bool {
                    ValueType::Bool
                } else {
                    ValueType::Int
                };
                self.op(opcode, 2, Some(ty));
            }
            BinaryOp::FloorDiv if ints => self.floor_div(non_negative),
            BinaryOp::Mod if ints => self.floor_mod(non_negative),
            BinaryOp::Eq | BinaryOp::NotEq => {
                let opcode = match (ints, op == BinaryOp::Eq) {
                    (true, true) => Opcode::NumEqual,
                    (true, false) => Opcode::NumNotEqual,
                    (false, true) => Opcode::Equal,
                    (false, false) => Opcode::NotEqual,
                };
                self.op(opcode, 2, Some(ValueType::Bool));
            }
            BinaryOp::Lt | BinaryOp::LtE | BinaryOp::Gt | BinaryOp::GtE if ints => {
                let opcode = match op {
                    BinaryOp::Lt => Opcode::Lt,
                    BinaryOp::LtE => Opcode::Le,
                    BinaryOp::Gt => Opcode::Gt,
                    _ => Opcode::Ge,
                };
                self.op(opcode, 2, Some(ValueType::Bool));
            }
            BinaryOp::Is | BinaryOp::IsNot => self.identity(op == BinaryOp::IsNot),
            BinaryOp::In | BinaryOp::NotIn if matches!(right, ValueType::Dict(..)) => {
                self.swap();
                self.op(Opcode::HasKey, 2, Some(ValueType::Bool));
                if op == BinaryOp::NotIn {
                    self.op(Opcode::Not, 1, Some(ValueType::Bool));
                }
            }
            BinaryOp::And | BinaryOp::Or => {
                let opcode = if op == BinaryOp::And { Opcode::BoolAnd } else { Opcode::BoolOr };
                self.op(opcode, 2, Some(ValueType::Bool));
            }
            _ => return Err(unsupported()),
        }
        Ok(())
    }

    /// `isinstance(value, ty)`.
    pub fn convert_isinstance(&mut self, ty: &ValueType) -> Result<(), CompileError> {
        match ty {
            ValueType::None => {
                self.op(Opcode::IsNull, 1, Some(ValueType::Bool));
            }
            ValueType::Any => return Err(CompileError::unsupported("isinstance", ty)),
            _ => {
                let id = self.emit_data(Opcode::IsType, &[ty.stack_item() as u8]);
                self.stack.pop(Some(id));
                self.stack.push(Some(id), ValueType::Bool);
            }
        }
        Ok(())
    }

    /// `a is b`; comparisons against a literal `None` become `ISNULL`.
    fn identity(&mut self, negate: bool) {
        let null_literal = self
            .detachable_last()
            .filter(|&last| self.map.code(last).opcode() == Opcode::PushNull);
        if let Some(last) = null_literal {
            let start = self.map.start_address(last).unwrap_or_default();
            self.remove_codes(start, start);
            self.pop_type();
            self.op(Opcode::IsNull, 1, Some(ValueType::Bool));
            if negate {
                self.op(Opcode::Not, 1, Some(ValueType::Bool));
            }
        } else {
            let opcode = if negate { Opcode::NotEqual } else { Opcode::Equal };
            self.op(opcode, 2, Some(ValueType::Bool));
        }
    }

    /// `[a, b] -> [a // b]`: decrements the truncated quotient when the
    /// remainder and the divisor have opposite signs.
    fn floor_div(&mut self, non_negative: bool) {
        if non_negative {
            self.op(Opcode::Div, 2, Some(ValueType::NonNegInt));
            return;
        }
        for opcode in [
            Opcode::Over,
            Opcode::Over,
            Opcode::Div,
            Opcode::Reverse3,
            Opcode::Over,
            Opcode::Mod,
            Opcode::Mul,
            Opcode::Push0,
            Opcode::Lt,
        ] {
            self.emit(opcode);
        }
        let skip = self.emit_jump(Opcode::JmpIfNot, Target::Unresolved);
        self.emit(Opcode::Dec);
        self.link_next(skip);
        self.settle(2, ValueType::Int);
    }

    /// `[a, b] -> [a % b]` with the result taking the divisor's sign.
    fn floor_mod(&mut self, non_negative: bool) {
        if non_negative {
            self.op(Opcode::Mod, 2, Some(ValueType::NonNegInt));
            return;
        }
        for opcode in [
            Opcode::Swap,
            Opcode::Over,
            Opcode::Mod,
            Opcode::Over,
            Opcode::Over,
            Opcode::Mul,
            Opcode::Push0,
            Opcode::Lt,
        ] {
            self.emit(opcode);
        }
        let skip = self.emit_jump(Opcode::JmpIfNot, Target::Unresolved);
        self.emit(Opcode::Over);
        self.emit(Opcode::Add);
        self.link_next(skip);
        self.emit(Opcode::Nip);
        self.settle(2, ValueType::Int);
    }

    /// Applies the net effect of a fixed sequence emitted without tracking.
    pub(super) fn settle(&mut self, pops: usize, push: ValueType) {
        for _ in 0..pops {
            self.pop_type();
        }
        self.push_type(push);
    }
}
