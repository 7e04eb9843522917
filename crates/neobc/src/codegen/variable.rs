//! Loads and stores of locals, arguments and globals.
//!
//! Globals come in three flavours. A write-once global with a literal
//! initializer is inlined as that literal (from `OptimizationLevel::Default`
//! up). A reassigned global declared persistent lives in contract storage,
//! serialized through StdLib. Everything else gets a static field slot
//! allocated by `_initialize`.

use super::CodeGenerator;
use crate::{
    bytecode::{Opcode, VmCode},
    error::CompileError,
    interop::{MethodToken, Syscall},
    literal::Literal,
    symbols::Variable,
    tracer::CodegenTracer,
    types::ValueType,
};

/// How a global is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum GlobalKind {
    Static,
    Inline,
    Storage,
}

/// Where a name resolves to in the current method.
#[derive(Debug, Clone)]
enum Binding<'a> {
    Local(usize, ValueType),
    Arg(usize, ValueType),
    /// Item of the array a packing method receives as its only argument.
    PackedArg(usize, ValueType),
    Static(u8, ValueType),
    Inline(&'a Literal),
    Storage(ValueType),
}

/// Short form `base + index` for slots 0..=6, generic form with operand otherwise.
fn slot_code(short: Opcode, generic: Opcode, index: usize) -> VmCode {
    if index < 7
        && let Some(opcode) = u8::try_from(index)
            .ok()
            .and_then(|offset| Opcode::from_repr(short as u8 + offset))
    {
        return VmCode::new(opcode);
    }
    VmCode::with_data(generic, &[u8::try_from(index).expect("slot index exceeds u8")])
}

impl<'a, Tr: CodegenTracer> CodeGenerator<'a, Tr> {
    pub(super) fn global_kind(&self, variable: &Variable) -> GlobalKind {
        if variable.reassigned && variable.persistent {
            GlobalKind::Storage
        } else if !variable.reassigned && variable.literal.is_some() && self.options.inlines_globals() {
            GlobalKind::Inline
        } else {
            GlobalKind::Static
        }
    }

    fn resolve(&self, name: &str) -> Result<Binding<'a>, CompileError> {
        let narrowed = self.narrowed_type(name).cloned();
        if let Some(method) = self.current.as_ref().and_then(|frame| frame.method) {
            if let Some((index, _, ty)) = method.locals.get_full(name) {
                return Ok(Binding::Local(index, narrowed.unwrap_or_else(|| ty.clone())));
            }
            if let Some((index, _, ty)) = method.args.get_full(name) {
                let ty = narrowed.unwrap_or_else(|| ty.clone());
                return Ok(if method.packs_args {
                    Binding::PackedArg(index, ty)
                } else {
                    Binding::Arg(index, ty)
                });
            }
        }
        let symbols = self.symbols;
        let variable = symbols
            .globals
            .get(name)
            .ok_or_else(|| CompileError::UnknownSymbol(name.to_owned()))?;
        let ty = narrowed.unwrap_or_else(|| variable.ty.clone());
        Ok(match self.global_kind(variable) {
            GlobalKind::Inline => Binding::Inline(variable.literal.as_ref().expect("inline globals carry a literal")),
            GlobalKind::Storage => Binding::Storage(ty),
            GlobalKind::Static => {
                let slot = self
                    .statics
                    .get(name)
                    .copied()
                    .ok_or_else(|| CompileError::UnknownSymbol(name.to_owned()))?;
                Binding::Static(slot, ty)
            }
        })
    }

    /// Pushes the value of `name`.
    pub fn convert_load_variable(&mut self, name: &str) -> Result<(), CompileError> {
        match self.resolve(name)? {
            Binding::Local(index, ty) => {
                self.insert(slot_code(Opcode::LdLoc0, Opcode::LdLoc, index));
                self.push_type(ty);
            }
            Binding::Arg(index, ty) => {
                self.insert(slot_code(Opcode::LdArg0, Opcode::LdArg, index));
                self.push_type(ty);
            }
            Binding::PackedArg(index, ty) => {
                self.op(Opcode::LdArg0, 0, Some(ValueType::list_of(ValueType::Any)));
                self.push_index(index);
                self.op(Opcode::PickItem, 2, Some(ty));
            }
            Binding::Static(slot, ty) => {
                self.insert(slot_code(Opcode::LdSFld0, Opcode::LdSFld, usize::from(slot)));
                self.push_type(ty);
            }
            Binding::Inline(literal) => self.convert_literal(literal)?,
            Binding::Storage(ty) => {
                let key = self.storage_key(name);
                self.push_data(&key);
                self.syscall(Syscall::StorageGetReadOnlyContext, 0, Some(ValueType::Any));
                self.syscall(Syscall::StorageGet, 2, Some(ValueType::Bytes));
                self.call_token(MethodToken::stdlib_deserialize(), 1, Some(ty));
            }
        }
        Ok(())
    }

    /// Pops the top of the stack into `name`.
    pub fn convert_store_variable(&mut self, name: &str) -> Result<(), CompileError> {
        match self.resolve(name)? {
            Binding::Local(index, _) => {
                self.insert(slot_code(Opcode::StLoc0, Opcode::StLoc, index));
                self.pop_type();
            }
            Binding::Arg(index, _) => {
                self.insert(slot_code(Opcode::StArg0, Opcode::StArg, index));
                self.pop_type();
            }
            Binding::PackedArg(index, _) => {
                // [value] -> [args, index, value]
                self.op(Opcode::LdArg0, 0, Some(ValueType::list_of(ValueType::Any)));
                self.swap();
                self.push_index(index);
                self.swap();
                self.op(Opcode::SetItem, 3, None);
            }
            Binding::Static(slot, _) => {
                self.insert(slot_code(Opcode::StSFld0, Opcode::StSFld, usize::from(slot)));
                self.pop_type();
            }
            // the value is known at every load, so the initializer is discarded
            Binding::Inline(_) => self.discard_top(),
            Binding::Storage(_) => {
                self.call_token(MethodToken::stdlib_serialize(), 1, Some(ValueType::Bytes));
                let key = self.storage_key(name);
                self.push_data(&key);
                self.syscall(Syscall::StorageGetContext, 0, Some(ValueType::Any));
                self.syscall(Syscall::StoragePut, 3, None);
            }
        }
        Ok(())
    }

    /// Drops the top of the stack, removing the push that produced it when it is
    /// a plain constant nothing jumps to.
    fn discard_top(&mut self) {
        let removable = self.detachable_last().filter(|&last| {
            let code = self.map.code(last);
            code.pushed_int().is_some()
                || matches!(
                    code.opcode(),
                    Opcode::PushT
                        | Opcode::PushF
                        | Opcode::PushNull
                        | Opcode::PushData1
                        | Opcode::PushData2
                        | Opcode::PushData4
                )
        });
        match removable {
            Some(last) => {
                let start = self.map.start_address(last).unwrap_or_default();
                let end = self.map.end_address(last).unwrap_or_default();
                self.remove_codes(start, end);
                self.pop_type();
            }
            None => self.drop_top(),
        }
    }

    pub(super) fn storage_key(&self, name: &str) -> Vec<u8> {
        let mut key = self.options.storage_prefix.clone();
        key.extend_from_slice(name.as_bytes());
        key
    }

    pub(super) fn syscall(&mut self, syscall: Syscall, pops: usize, push: Option<ValueType>) {
        let id = self.emit_data(Opcode::Syscall, &syscall.operand());
        for _ in 0..pops {
            self.stack.pop(Some(id));
        }
        if let Some(ty) = push {
            self.stack.push(Some(id), ty);
        }
    }

    fn call_token(&mut self, token: MethodToken, pops: usize, push: Option<ValueType>) {
        let index = self.method_token(token);
        let id = self.emit_data(Opcode::CallT, &index.to_le_bytes());
        for _ in 0..pops {
            self.stack.pop(Some(id));
        }
        if let Some(ty) = push {
            self.stack.push(Some(id), ty);
        }
    }
}
