//! Indexing, slicing and strides.
//!
//! Python indexes count from the end when negative, slices clamp their bounds
//! to the collection and strides may be negative. The VM has none of that, so
//! every operation here wraps the native opcode in a runtime fixup:
//!
//! * an index whose type may be negative gets `DUP SIGN PUSHM1 JMPNE` followed
//!   by `len(collection) + index`;
//! * slice bounds are additionally clamped into `[0, len]`;
//! * byte strings slice with `SUBSTR`/`LEFT`/`RIGHT`, arrays with an explicit
//!   copy loop, and strides always use a loop.
//!
//! The fixed sequences below are emitted without per-instruction shadow-stack
//! tracking; each public operation settles the net effect once at the end.

use super::CodeGenerator;
use crate::{
    bytecode::{Opcode, Target},
    error::CompileError,
    tracer::CodegenTracer,
    types::{StackItemType, ValueType},
};

impl<Tr: CodegenTracer> CodeGenerator<'_, Tr> {
    /// `[c, i] -> [c[i]]`.
    pub fn convert_get_item(&mut self) -> Result<(), CompileError> {
        let collection = self.stack.peek(1);
        match &collection {
            ValueType::Dict(..) => self.emit_ops(&[Opcode::PickItem]),
            ValueType::Str => {
                self.fix_negative_index(1);
                self.emit_ops(&[Opcode::Push1, Opcode::SubStr]);
                self.emit_data(Opcode::Convert, &[StackItemType::ByteString as u8]);
            }
            ty if ty.is_sequence() || *ty == ValueType::Any => {
                self.fix_negative_index(1);
                self.emit_ops(&[Opcode::PickItem]);
            }
            ty => return Err(CompileError::unsupported("[]", ty)),
        }
        self.settle(2, collection.subscript_type());
        Ok(())
    }

    /// `[c, i, v] -> []`, storing `v` at `c[i]`.
    pub fn convert_set_item(&mut self) -> Result<(), CompileError> {
        let collection = self.stack.peek(2);
        match &collection {
            ValueType::Dict(..) => {}
            ValueType::List(_) | ValueType::ByteArray | ValueType::Any => {
                if self.stack.peek(1) != ValueType::NonNegInt {
                    self.swap();
                    self.fix_negative_index(2);
                    self.swap();
                }
            }
            ty => return Err(CompileError::unsupported("[]=", ty)),
        }
        self.op(Opcode::SetItem, 3, None);
        Ok(())
    }

    /// `[c, i] -> []`, removing `c[i]`.
    pub fn convert_del_item(&mut self) -> Result<(), CompileError> {
        let collection = self.stack.peek(1);
        match &collection {
            ValueType::Dict(..) => {}
            ValueType::List(_) | ValueType::Any => self.fix_negative_index(1),
            ty => return Err(CompileError::unsupported("del", ty)),
        }
        self.op(Opcode::Remove, 2, None);
        Ok(())
    }

    /// `[c, start, end] -> [c[start:end]]`.
    pub fn convert_get_sub_sequence(&mut self) -> Result<(), CompileError> {
        let collection = self.sliceable(2)?;
        let (start, end) = (self.stack.peek(1), self.stack.peek(0));
        self.emit_slice(&collection, &start, &end);
        self.settle(3, collection);
        Ok(())
    }

    /// `[c, end] -> [c[:end]]`.
    pub fn convert_get_sequence_beginning(&mut self) -> Result<(), CompileError> {
        let collection = self.sliceable(1)?;
        let end = self.stack.peek(0);
        self.emit_clamp(&end, 1);
        if collection.is_byte_like() {
            self.emit_ops(&[Opcode::Left]);
            self.emit_byte_result(&collection);
        } else {
            self.emit_ops(&[Opcode::Push0, Opcode::Swap]);
            self.emit_slice_bounded(&collection);
        }
        self.settle(2, collection);
        Ok(())
    }

    /// `[c, start] -> [c[start:]]`.
    pub fn convert_get_sequence_ending(&mut self) -> Result<(), CompileError> {
        let collection = self.sliceable(1)?;
        let start = self.stack.peek(0);
        self.emit_clamp(&start, 1);
        if collection.is_byte_like() {
            self.emit_ops(&[Opcode::Over, Opcode::Size, Opcode::Swap, Opcode::Sub, Opcode::Right]);
            self.emit_byte_result(&collection);
        } else {
            self.emit_ops(&[Opcode::Over, Opcode::Size]);
            self.emit_slice_bounded(&collection);
        }
        self.settle(2, collection);
        Ok(())
    }

    /// `[c] -> [c[:]]`.
    pub fn convert_copy_sequence(&mut self) -> Result<(), CompileError> {
        let collection = self.sliceable(0)?;
        self.emit_copy(&collection);
        self.settle(1, collection);
        Ok(())
    }

    /// `[c, step] -> [c[::step]]`.
    pub fn convert_get_stride(&mut self) -> Result<(), CompileError> {
        let collection = self.sliceable(1)?;
        if !collection.is_byte_like() {
            self.emit_ops(&[Opcode::Swap]);
            self.emit_copy(&collection);
            self.emit_ops(&[Opcode::Swap]);
        }
        self.emit_stride(&collection);
        self.settle(2, collection);
        Ok(())
    }

    /// `[c, start, end, step] -> [c[start:end:step]]`.
    ///
    /// A negative step walks from `start` down to `end`, exclusive: the items
    /// of `c[end + 1:start + 1]` are taken in reverse.
    pub fn convert_get_sub_sequence_stride(&mut self) -> Result<(), CompileError> {
        let collection = self.sliceable(3)?;
        let (start, end, step) = (self.stack.peek(2), self.stack.peek(1), self.stack.peek(0));
        // [c, s, e, k] -> [k, c, s, e]
        self.emit_ops(&[Opcode::Reverse4, Opcode::Reverse3]);
        self.emit_fix_bound(&end, 2);
        self.emit_ops(&[Opcode::Swap]);
        self.emit_fix_bound(&start, 2);
        self.emit_ops(&[Opcode::Swap]);
        if step != ValueType::NonNegInt {
            // k < 0: [k, c, s, e] -> [k, c, e + 1, s + 1]
            self.emit_ops(&[Opcode::Push3, Opcode::Pick, Opcode::Push0]);
            let forward = self.emit_jump(Opcode::JmpGe, Target::Unresolved);
            self.emit_ops(&[Opcode::Inc, Opcode::Swap, Opcode::Inc]);
            self.link_next(forward);
        }
        let bounds = if start == ValueType::NonNegInt && end == ValueType::NonNegInt {
            ValueType::NonNegInt
        } else {
            ValueType::Int
        };
        self.emit_clamp_fixed(&bounds, 2);
        self.emit_ops(&[Opcode::Swap]);
        self.emit_clamp_fixed(&bounds, 2);
        self.emit_ops(&[Opcode::Swap]);
        self.emit_slice_bounded(&collection);
        self.emit_ops(&[Opcode::Swap]);
        self.emit_stride(&collection);
        self.settle(4, collection);
        Ok(())
    }

    /// Applies negative-index semantics to the index on top of the stack, the
    /// collection being `collection_depth` items below it.
    pub(super) fn fix_negative_index(&mut self, collection_depth: usize) {
        let index = self.stack.peek(0);
        if index == ValueType::NonNegInt {
            return;
        }
        self.emit_fix_index(collection_depth);
        let at = self.map.last();
        self.stack.pop(at);
        self.stack.push(at, ValueType::Int);
    }

    /// Type of the collection `depth` items below the top, if it can be sliced.
    fn sliceable(&self, depth: usize) -> Result<ValueType, CompileError> {
        match self.stack.peek(depth) {
            ValueType::Any => Ok(ValueType::list_of(ValueType::Any)),
            ty if ty.is_sequence() => Ok(ty),
            ty => Err(CompileError::unsupported("[:]", &ty)),
        }
    }

    fn emit_ops(&mut self, opcodes: &[Opcode]) {
        for &opcode in opcodes {
            self.emit(opcode);
        }
    }

    /// Copies the item `depth` places below the top, without tracking.
    fn emit_pick(&mut self, depth: usize) {
        match depth {
            0 => self.emit_ops(&[Opcode::Dup]),
            1 => self.emit_ops(&[Opcode::Over]),
            _ => {
                let push = i64::try_from(depth)
                    .ok()
                    .and_then(Opcode::push_small)
                    .expect("pick depths stay within PUSH16");
                self.emit_ops(&[push, Opcode::Pick]);
            }
        }
    }

    /// `DUP SIGN PUSHM1 JMPNE skip; <collection> SIZE ADD; skip:`
    fn emit_fix_index(&mut self, collection_depth: usize) {
        self.emit_ops(&[Opcode::Dup, Opcode::Sign, Opcode::PushM1]);
        let skip = self.emit_jump(Opcode::JmpNe, Target::Unresolved);
        self.emit_pick(collection_depth);
        self.emit_ops(&[Opcode::Size, Opcode::Add]);
        self.link_next(skip);
    }

    /// Normalizes a slice bound on top of the stack into `[0, len]`.
    fn emit_clamp(&mut self, bound: &ValueType, collection_depth: usize) {
        self.emit_fix_bound(bound, collection_depth);
        self.emit_clamp_fixed(bound, collection_depth);
    }

    /// Counts a possibly negative bound on top of the stack from the end.
    fn emit_fix_bound(&mut self, bound: &ValueType, collection_depth: usize) {
        if *bound != ValueType::NonNegInt {
            self.emit_fix_index(collection_depth);
        }
    }

    /// Clamps a bound already counted from the start into `[0, len]`.
    fn emit_clamp_fixed(&mut self, bound: &ValueType, collection_depth: usize) {
        if *bound != ValueType::NonNegInt {
            self.emit_ops(&[Opcode::Push0, Opcode::Max]);
        }
        self.emit_pick(collection_depth);
        self.emit_ops(&[Opcode::Size, Opcode::Min]);
    }

    /// `[c, s, e] -> [c[s:e]]` with both bounds clamped.
    fn emit_slice(&mut self, collection: &ValueType, start: &ValueType, end: &ValueType) {
        self.emit_clamp(end, 2);
        self.emit_ops(&[Opcode::Swap]);
        self.emit_clamp(start, 2);
        self.emit_ops(&[Opcode::Swap]);
        self.emit_slice_bounded(collection);
    }

    /// `[c, s, e] -> [c[s:e]]` for bounds already inside `[0, len]`.
    fn emit_slice_bounded(&mut self, collection: &ValueType) {
        if collection.is_byte_like() {
            self.emit_ops(&[Opcode::Over, Opcode::Sub, Opcode::Push0, Opcode::Max, Opcode::SubStr]);
            self.emit_byte_result(collection);
            return;
        }
        // [c, s, e] -> [r, c, e, i] with i = s
        self.emit_ops(&[Opcode::Swap, Opcode::NewArray0, Opcode::Reverse4, Opcode::Reverse3]);
        let to_condition = self.emit_jump(Opcode::Jmp, Target::Unresolved);
        let body = self.emit(Opcode::Push3);
        self.emit_ops(&[
            Opcode::Pick,
            Opcode::Push3,
            Opcode::Pick,
            Opcode::Push2,
            Opcode::Pick,
            Opcode::PickItem,
            Opcode::Append,
            Opcode::Inc,
        ]);
        self.link_next(to_condition);
        self.emit_ops(&[Opcode::Dup, Opcode::Push2, Opcode::Pick, Opcode::Lt]);
        self.emit_jump(Opcode::JmpIf, Target::Code(body));
        self.emit_ops(&[Opcode::Drop, Opcode::Drop, Opcode::Drop]);
    }

    /// `[c] -> [copy of c]`; immutable byte strings are shared.
    fn emit_copy(&mut self, collection: &ValueType) {
        match collection {
            ValueType::Str | ValueType::Bytes => {}
            ValueType::ByteArray => self.emit_ops(&[Opcode::Dup, Opcode::Size, Opcode::Left]),
            _ => self.emit_ops(&[Opcode::Unpack, Opcode::Pack]),
        }
    }

    /// `[r, k] -> [every k-th item of r]`, reversed first when `k < 0`.
    fn emit_stride(&mut self, collection: &ValueType) {
        if collection.is_byte_like() {
            self.emit_stride_bytes(collection);
        } else {
            self.emit_stride_array();
        }
    }

    /// Removes in place every item whose position is not a multiple of the step,
    /// walking from the end. `r` must be a fresh array.
    fn emit_stride_array(&mut self) {
        self.emit_step_direction();
        self.emit_ops(&[Opcode::Over, Opcode::Size, Opcode::Dec]);
        let to_condition = self.emit_jump(Opcode::Jmp, Target::Unresolved);
        let body = self.emit(Opcode::Dup);
        self.emit_ops(&[Opcode::Push2, Opcode::Pick, Opcode::Mod]);
        let keep = self.emit_jump(Opcode::JmpIfNot, Target::Unresolved);
        self.emit_ops(&[Opcode::Push2, Opcode::Pick, Opcode::Over, Opcode::Remove]);
        self.link_next(keep);
        self.emit_ops(&[Opcode::Dec]);
        self.link_next(to_condition);
        self.emit_ops(&[Opcode::Dup, Opcode::Push0]);
        self.emit_jump(Opcode::JmpGe, Target::Code(body));
        self.emit_ops(&[Opcode::Drop, Opcode::Drop]);
    }

    /// Builds a new byte string from every k-th byte.
    fn emit_stride_bytes(&mut self, collection: &ValueType) {
        // reversing needs a private buffer
        self.emit_ops(&[Opcode::Swap]);
        if *collection == ValueType::ByteArray {
            self.emit_ops(&[Opcode::Dup, Opcode::Size, Opcode::Left]);
        } else {
            self.emit_data(Opcode::Convert, &[StackItemType::Buffer as u8]);
        }
        self.emit_ops(&[Opcode::Swap]);
        self.emit_step_direction();
        // [b, k] -> [b, k, i, acc]
        self.emit_ops(&[Opcode::Push0]);
        self.emit_data(Opcode::PushData1, &[]);
        let to_condition = self.emit_jump(Opcode::Jmp, Target::Unresolved);
        let body = self.emit(Opcode::Push3);
        self.emit_ops(&[
            Opcode::Pick,
            Opcode::Push2,
            Opcode::Pick,
            Opcode::Push1,
            Opcode::SubStr,
            Opcode::Cat,
            Opcode::Swap,
            Opcode::Push2,
            Opcode::Pick,
            Opcode::Add,
            Opcode::Swap,
        ]);
        self.link_next(to_condition);
        self.emit_ops(&[Opcode::Over, Opcode::Push4, Opcode::Pick, Opcode::Size, Opcode::Lt]);
        self.emit_jump(Opcode::JmpIf, Target::Code(body));
        self.emit_ops(&[Opcode::Nip, Opcode::Nip, Opcode::Nip]);
        self.emit_byte_result(collection);
    }

    /// `[r, k] -> [r, |k|]`, reversing `r` in place when `k < 0`.
    fn emit_step_direction(&mut self) {
        self.emit_ops(&[Opcode::Dup, Opcode::Push0]);
        let forward = self.emit_jump(Opcode::JmpGe, Target::Unresolved);
        self.emit_ops(&[Opcode::Over, Opcode::ReverseItems]);
        self.link_next(forward);
        self.emit_ops(&[Opcode::Abs]);
    }

    /// Byte opcodes produce buffers; immutable results are converted back.
    fn emit_byte_result(&mut self, collection: &ValueType) {
        if *collection != ValueType::ByteArray {
            self.emit_data(Opcode::Convert, &[StackItemType::ByteString as u8]);
        }
    }
}
