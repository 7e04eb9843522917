//! Structured control flow: `if`, `while`, `for`, `try`, `return` and `raise`.
//!
//! Every construct is a `begin_X`/`end_X` pair driven by the visitor. Forward
//! jumps are linked to "whatever is emitted next" through the pending table;
//! backward jumps capture the destination's handle directly.
//!
//! Loops are laid out with the test after the body:
//!
//! ```text
//!     JMP cond
//! body:
//!     ...
//! cond:
//!     <test>
//!     JMPIF body
//!     <cleanup>            natural exit
//!     PUSHF                only with `else` and at least one `break`
//! breaks land here
//!     JMPIF after_else
//!     <else body>
//! after_else:
//! ```
//!
//! A `while` test is emitted by the visitor before the body and relocated to
//! the end once the body is complete.

use super::{CodeGenerator, Scope, pending::Patch};
use crate::{
    bytecode::{CodeId, Opcode, Target},
    error::CompileError,
    interop::Syscall,
    tracer::CodegenTracer,
    types::{StackItemType, ValueType},
};

#[derive(Debug, Clone)]
pub(super) struct IfContext {
    /// `JMPIFNOT` skipping the `if` body.
    jump: CodeId,
    /// `JMP` skipping the `else` body, once `else` was opened.
    else_jump: Option<CodeId>,
    /// Stack at the end of the `if` body, joined with the `else` body's at the end.
    then_stack: Option<Vec<ValueType>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    While,
    /// Walks an array, map keys or string by position; keeps `[collection, index]`.
    Indexed,
    /// Drives a VM iterator; keeps `[iterator]`.
    Iterator,
}

#[derive(Debug, Clone, Copy)]
struct Break {
    /// `PUSHT` telling the exit point that the loop was left by `break`.
    flag: CodeId,
    jump: CodeId,
}

#[derive(Debug, Clone)]
pub(super) struct LoopContext {
    kind: LoopKind,
    /// Initial `JMP` to the test.
    start_jump: CodeId,
    /// First body instruction, the destination of the backward test jump.
    body: Option<CodeId>,
    /// `JMPIF` closing a `while` test.
    body_jump: Option<CodeId>,
    continues: Vec<CodeId>,
    breaks: Vec<Break>,
    /// Items the loop keeps on the stack while it runs.
    cleanup: usize,
    /// Number of enclosing `try` blocks when the loop was opened.
    try_depth: usize,
    /// Stack shape at the start of each iteration.
    stack: Vec<ValueType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TryStage {
    Body,
    Except,
    Finally,
}

#[derive(Debug, Clone)]
pub(super) struct TryContext {
    try_code: CodeId,
    /// `ENDTRY`s leaving the protected regions, linked past the whole statement.
    end_tries: Vec<CodeId>,
    stack: Vec<ValueType>,
    stage: TryStage,
}

fn join_stacks(a: &[ValueType], b: &[ValueType]) -> Vec<ValueType> {
    if a.len() != b.len() {
        return a.to_vec();
    }
    a.iter().zip(b).map(|(x, y)| x.join(y)).collect()
}

impl<Tr: CodegenTracer> CodeGenerator<'_, Tr> {
    // ------------------------------------------------------------------
    // if
    // ------------------------------------------------------------------

    /// Pops the condition and opens the `if` body.
    pub fn convert_begin_if(&mut self) -> Result<(), CompileError> {
        let jump = self.emit_jump(Opcode::JmpIfNot, Target::Unresolved);
        self.stack.pop(Some(jump));
        self.scopes.push(Scope::default());
        self.ifs.push(IfContext {
            jump,
            else_jump: None,
            then_stack: None,
        });
        Ok(())
    }

    pub fn convert_begin_else(&mut self) -> Result<(), CompileError> {
        let mut context = self
            .ifs
            .pop()
            .filter(|context| context.else_jump.is_none())
            .ok_or(CompileError::Unbalanced { construct: "if" })?;
        let then_stack = self.stack.stack().to_vec();
        let else_jump = self.emit_jump(Opcode::Jmp, Target::Unresolved);
        self.link_next(context.jump);
        let address = self.map.start_address(context.jump).unwrap_or_default();
        let before = self.stack.get_snapshot(address, &self.map);
        self.restore_stack(before);
        if let Some(scope) = self.scopes.last_mut() {
            *scope = Scope::default();
        }
        context.else_jump = Some(else_jump);
        context.then_stack = Some(then_stack);
        self.ifs.push(context);
        Ok(())
    }

    pub fn convert_end_if(&mut self) -> Result<(), CompileError> {
        let context = self.ifs.pop().ok_or(CompileError::Unbalanced { construct: "if" })?;
        let other = match (context.else_jump, context.then_stack) {
            (Some(else_jump), Some(then_stack)) => {
                self.link_next(else_jump);
                then_stack
            }
            _ => {
                self.link_next(context.jump);
                let address = self.map.start_address(context.jump).unwrap_or_default();
                self.stack.get_snapshot(address, &self.map)
            }
        };
        let joined = join_stacks(self.stack.stack(), &other);
        self.restore_stack(joined);
        self.scopes.pop();
        Ok(())
    }

    // ------------------------------------------------------------------
    // loops
    // ------------------------------------------------------------------

    fn open_loop(&mut self, kind: LoopKind, start_jump: CodeId, cleanup: usize) {
        self.loops.push(LoopContext {
            kind,
            start_jump,
            body: None,
            body_jump: None,
            continues: Vec::new(),
            breaks: Vec::new(),
            cleanup,
            try_depth: self.tries.len(),
            stack: self.stack.stack().to_vec(),
        });
        self.scopes.push(Scope::default());
    }

    /// Opens a `while`; the visitor emits the test next.
    pub fn convert_begin_while(&mut self) -> Result<(), CompileError> {
        let start_jump = self.emit_forward_jump(Opcode::Jmp);
        self.open_loop(LoopKind::While, start_jump, 0);
        Ok(())
    }

    /// Pops the test result and opens the `while` body.
    pub fn convert_begin_while_body(&mut self) -> Result<(), CompileError> {
        if !self
            .loops
            .last()
            .is_some_and(|context| context.kind == LoopKind::While && context.body_jump.is_none())
        {
            return Err(CompileError::Unbalanced { construct: "while" });
        }
        let jump = self.emit_jump(Opcode::JmpIf, Target::Unresolved);
        self.stack.pop(Some(jump));
        self.link_next(jump);
        if let Some(context) = self.loops.last_mut() {
            context.body_jump = Some(jump);
        }
        Ok(())
    }

    /// Closes the `while` body and moves the test behind it. With `has_else`
    /// the visitor emits the `else` body next and closes it with
    /// [`convert_end_loop_else`](Self::convert_end_loop_else).
    pub fn convert_end_while(&mut self, has_else: bool) -> Result<(), CompileError> {
        let unbalanced = CompileError::Unbalanced { construct: "while" };
        let context = self
            .loops
            .pop()
            .filter(|context| context.kind == LoopKind::While)
            .ok_or(unbalanced.clone())?;
        let body_jump = context.body_jump.ok_or(unbalanced.clone())?;
        let Some(Target::Code(condition)) = self.map.code(context.start_jump).target() else {
            return Err(unbalanced);
        };

        if self.pending.cancel_jump(body_jump) {
            // empty body: spin on the test
            self.set_target(body_jump, Target::Code(condition));
        } else {
            for patch in self.pending.take() {
                self.apply_patch(patch, condition);
            }
            let first = self.map.start_address(condition).unwrap_or_default();
            let last = self.map.end_address(body_jump).unwrap_or_default();
            if let Some(new_start) = self.map.relocate(first, last) {
                self.tracer.on_relocate(first, last, new_start);
            }
        }
        for &jump in &context.continues {
            self.set_target(jump, Target::Code(condition));
        }
        self.finish_loop(context, has_else);
        Ok(())
    }

    /// Opens a `for` over the iterable on top of the stack. The loop variable's
    /// value is left on the stack for the visitor to store.
    pub fn convert_begin_for(&mut self) -> Result<(), CompileError> {
        let mut iterable = self.stack.peek(0);
        if let ValueType::Dict(key, _) = &iterable {
            let keys = ValueType::List(key.clone());
            self.op(Opcode::Keys, 1, Some(keys.clone()));
            iterable = keys;
        }
        match &iterable {
            ValueType::Iterator(item) => {
                let item = (**item).clone();
                let start_jump = self.emit_jump(Opcode::Jmp, Target::Unresolved);
                self.open_loop(LoopKind::Iterator, start_jump, 1);
                let body = self.emit(Opcode::Dup);
                self.syscall(Syscall::IteratorValue, 0, None);
                self.push_type(item);
                self.set_loop_body(body);
            }
            ty if ty.is_sequence() || *ty == ValueType::Any => {
                self.op(Opcode::Push0, 0, Some(ValueType::NonNegInt));
                let start_jump = self.emit_jump(Opcode::Jmp, Target::Unresolved);
                self.open_loop(LoopKind::Indexed, start_jump, 2);
                let body = self.emit(Opcode::Over);
                self.emit(Opcode::Over);
                if *ty == ValueType::Str {
                    self.emit(Opcode::Push1);
                    self.emit(Opcode::SubStr);
                    self.emit_data(Opcode::Convert, &[StackItemType::ByteString as u8]);
                } else {
                    self.emit(Opcode::PickItem);
                }
                self.push_type(ty.item_type());
                self.set_loop_body(body);
            }
            ty => return Err(CompileError::unsupported("for", ty)),
        }
        Ok(())
    }

    fn set_loop_body(&mut self, body: CodeId) {
        if let Some(context) = self.loops.last_mut() {
            context.body = Some(body);
        }
    }

    /// Closes the `for` body: advances the index or iterator and jumps back.
    pub fn convert_end_for(&mut self, has_else: bool) -> Result<(), CompileError> {
        let unbalanced = CompileError::Unbalanced { construct: "for" };
        let context = self
            .loops
            .pop()
            .filter(|context| context.kind != LoopKind::While)
            .ok_or(unbalanced.clone())?;
        let body = context.body.ok_or(unbalanced)?;
        self.restore_stack(context.stack.clone());

        for &jump in &context.continues {
            self.link_next(jump);
        }
        if context.kind == LoopKind::Indexed {
            self.op(Opcode::Inc, 1, Some(ValueType::NonNegInt));
        }
        self.link_next(context.start_jump);
        self.dup();
        if context.kind == LoopKind::Indexed {
            // [c, i, i] -> [c, i, i < len(c)]
            self.push_index(2);
            self.op(Opcode::Pick, 1, None);
            self.push_type(ValueType::Any);
            self.op(Opcode::Size, 1, Some(ValueType::NonNegInt));
            self.op(Opcode::Lt, 2, Some(ValueType::Bool));
        } else {
            self.syscall(Syscall::IteratorNext, 1, Some(ValueType::Bool));
        }
        let jump = self.emit_jump(Opcode::JmpIf, Target::Code(body));
        self.stack.pop(Some(jump));
        self.finish_loop(context, has_else);
        Ok(())
    }

    /// Emits the natural loop exit and links every `break`.
    fn finish_loop(&mut self, context: LoopContext, has_else: bool) {
        self.scopes.pop();
        self.restore_stack(context.stack.clone());
        let kept = context.stack.len().saturating_sub(context.cleanup);
        let exit_stack = context.stack[..kept].to_vec();

        if has_else && !context.breaks.is_empty() {
            for _ in 0..context.cleanup {
                self.drop_top();
            }
            self.op(Opcode::PushF, 0, Some(ValueType::Bool));
            for exit in &context.breaks {
                self.link_next(exit.jump);
            }
            let guard = self.emit_jump(Opcode::JmpIf, Target::Unresolved);
            self.stack.pop(Some(guard));
            self.loop_else_guards.push(Some(guard));
        } else {
            // nobody tests the flags
            for exit in &context.breaks {
                if let Some(start) = self.map.start_address(exit.flag) {
                    self.remove_codes(start, start);
                }
            }
            for _ in 0..context.cleanup {
                self.drop_top();
            }
            for exit in &context.breaks {
                self.link_next(exit.jump);
            }
            if has_else {
                self.loop_else_guards.push(None);
            }
        }
        self.restore_stack(exit_stack);
    }

    /// Closes the `else` body of a `while` or `for`.
    pub fn convert_end_loop_else(&mut self) -> Result<(), CompileError> {
        let guard = self
            .loop_else_guards
            .pop()
            .ok_or(CompileError::Unbalanced { construct: "loop else" })?;
        if let Some(guard) = guard {
            self.link_next(guard);
        }
        Ok(())
    }

    pub fn convert_break(&mut self) -> Result<(), CompileError> {
        let context = self
            .loops
            .last()
            .ok_or(CompileError::OutsideLoop { statement: "break" })?;
        let (cleanup, try_levels) = (context.cleanup, self.tries.len() - context.try_depth);
        let saved = self.stack.stack().to_vec();
        for _ in 0..cleanup {
            self.drop_top();
        }
        let flag = self.op(Opcode::PushT, 0, Some(ValueType::Bool));
        let jump = self.exit_jump(try_levels);
        self.restore_stack(saved);
        if let Some(context) = self.loops.last_mut() {
            context.breaks.push(Break { flag, jump });
        }
        Ok(())
    }

    pub fn convert_continue(&mut self) -> Result<(), CompileError> {
        let context = self
            .loops
            .last()
            .ok_or(CompileError::OutsideLoop { statement: "continue" })?;
        let try_levels = self.tries.len() - context.try_depth;
        let jump = self.exit_jump(try_levels);
        if let Some(context) = self.loops.last_mut() {
            context.continues.push(jump);
        }
        Ok(())
    }

    /// Unconditional jump leaving `try_levels` protected regions; each `ENDTRY`
    /// but the last continues straight into the next one.
    fn exit_jump(&mut self, try_levels: usize) -> CodeId {
        if try_levels == 0 {
            return self.emit_jump(Opcode::Jmp, Target::Unresolved);
        }
        for _ in 1..try_levels {
            let end_try = self.emit_jump(Opcode::EndTry, Target::Unresolved);
            self.link_next(end_try);
        }
        self.emit_jump(Opcode::EndTry, Target::Unresolved)
    }

    // ------------------------------------------------------------------
    // try
    // ------------------------------------------------------------------

    pub fn convert_begin_try(&mut self) -> Result<(), CompileError> {
        let try_code = self.emit_jump(
            Opcode::Try,
            Target::Try {
                except: None,
                finally: None,
            },
        );
        self.tries.push(TryContext {
            try_code,
            end_tries: Vec::new(),
            stack: self.stack.stack().to_vec(),
            stage: TryStage::Body,
        });
        Ok(())
    }

    /// Closes the `try` body and opens the `except` handler. The exception is
    /// stored into `variable`, or dropped.
    pub fn convert_try_except(&mut self, variable: Option<&str>) -> Result<(), CompileError> {
        let mut context = self
            .tries
            .pop()
            .filter(|context| context.stage == TryStage::Body)
            .ok_or(CompileError::Unbalanced { construct: "try" })?;
        context.end_tries.push(self.emit_jump(Opcode::EndTry, Target::Unresolved));
        self.pending.defer(Patch::TryExcept(context.try_code));
        self.restore_stack(context.stack.clone());
        context.stage = TryStage::Except;
        self.tries.push(context);

        // the VM pushes the exception when entering the handler
        self.stack.push(None, ValueType::Any);
        match variable {
            Some(name) => self.convert_store_variable(name),
            None => {
                self.drop_top();
                Ok(())
            }
        }
    }

    /// Closes the protected body or the `except` handler. Without `has_finally`
    /// this ends the whole statement.
    pub fn convert_end_try(&mut self, has_finally: bool) -> Result<(), CompileError> {
        let mut context = self
            .tries
            .pop()
            .filter(|context| context.stage != TryStage::Finally)
            .ok_or(CompileError::Unbalanced { construct: "try" })?;
        context.end_tries.push(self.emit_jump(Opcode::EndTry, Target::Unresolved));
        self.restore_stack(context.stack.clone());
        if has_finally {
            self.pending.defer(Patch::TryFinally(context.try_code));
            context.stage = TryStage::Finally;
            self.tries.push(context);
        } else {
            for &end_try in &context.end_tries {
                self.link_next(end_try);
            }
        }
        Ok(())
    }

    /// Closes the `finally` body.
    pub fn convert_end_try_finally(&mut self) -> Result<(), CompileError> {
        let context = self
            .tries
            .pop()
            .filter(|context| context.stage == TryStage::Finally)
            .ok_or(CompileError::Unbalanced { construct: "try" })?;
        self.emit(Opcode::EndFinally);
        for &end_try in &context.end_tries {
            self.link_next(end_try);
        }
        self.restore_stack(context.stack);
        Ok(())
    }

    // ------------------------------------------------------------------
    // leaving
    // ------------------------------------------------------------------

    /// `return` with or without the value on top of the stack. Items kept by
    /// enclosing loops are discarded first.
    pub fn convert_return(&mut self, has_value: bool) -> Result<(), CompileError> {
        let frame = self
            .current
            .as_ref()
            .ok_or(CompileError::Unbalanced { construct: "method" })?;
        let is_init = frame.method.is_some_and(|method| method.is_init);
        let cleanup: usize = self.loops.iter().map(|context| context.cleanup).sum();
        let mut saved = self.stack.stack().to_vec();
        if has_value {
            saved.pop();
        }
        for _ in 0..cleanup {
            if has_value {
                self.nip();
            } else {
                self.drop_top();
            }
        }
        if is_init && !has_value {
            self.op(Opcode::LdArg0, 0, Some(ValueType::Any));
        }
        self.emit(Opcode::Ret);
        self.restore_stack(saved);
        Ok(())
    }

    /// `raise` of the exception on top of the stack.
    pub fn convert_raise(&mut self) -> Result<(), CompileError> {
        let mut saved = self.stack.stack().to_vec();
        saved.pop();
        self.emit(Opcode::Throw);
        self.restore_stack(saved);
        Ok(())
    }

    /// `assert` of the condition on top of the stack, with the message above it
    /// when `has_message`.
    pub fn convert_assert(&mut self, has_message: bool) -> Result<(), CompileError> {
        if has_message {
            self.op(Opcode::AssertMsg, 2, None);
        } else {
            self.op(Opcode::Assert, 1, None);
        }
        Ok(())
    }
}
