//! The code generator: one emission operation per language construct.
//!
//! Each `convert_*` operation reads the shadow stack to pick the right
//! instruction variant, appends instructions to the [`CodeMap`], mirrors their
//! net stack effect on the [`StackMemento`], and records or resolves deferred
//! links. All three structures are owned here, so every emission keeps them
//! consistent with each other.
//!
//! The operations are split by construct family:
//!
//! | Module | Constructs |
//! |--------|------------|
//! | `literal` | literals and casts |
//! | `variable` | locals, arguments, statics, inlined and storage-backed globals |
//! | `operator` | unary and binary operators, `isinstance` |
//! | `sequence` | indexing, slicing, strides |
//! | `control` | `if`, loops, `try`, `return`, `raise` |
//! | `call` | methods, builtins, classes, events, other contracts |

mod call;
mod control;
mod literal;
mod operator;
mod pending;
mod sequence;
mod variable;

use ahash::{AHashMap, AHashSet};
use indexmap::{IndexMap, IndexSet};
use num_bigint::BigInt;

pub use self::operator::{BinaryOp, UnaryOp};
use self::{
    control::{IfContext, LoopContext, TryContext},
    pending::{Patch, PendingTargets},
};
use crate::{
    bytecode::{CodeId, CodeMap, Opcode, Target, VmCode},
    error::CompileError,
    interop::MethodToken,
    optimizer,
    options::CompilerOptions,
    stack::{StackCheckpoint, StackMemento},
    symbols::{Method, SymbolTable},
    tracer::{CodegenTracer, NoopTracer},
    types::ValueType,
};

/// Name of the synthetic method that initializes static fields.
pub const INITIALIZE: &str = "_initialize";

/// The method whose body is currently being emitted.
#[derive(Debug, Clone)]
struct MethodFrame<'a> {
    name: String,
    /// `None` for synthetic methods such as `_initialize`.
    method: Option<&'a Method>,
}

/// Type narrowing recorded inside one lexical region.
#[derive(Debug, Default, Clone)]
struct Scope {
    narrowed: AHashMap<String, ValueType>,
}

/// Saved generator position for speculative emission.
#[derive(Debug, Clone)]
pub struct Checkpoint<'a> {
    address: u32,
    stack: StackCheckpoint,
    method: Option<MethodFrame<'a>>,
    scopes: usize,
    ifs: usize,
    loops: usize,
    loop_else_guards: usize,
    tries: usize,
    tokens: usize,
}

/// Output of [`CodeGenerator::finish`], before it is wrapped into a unit.
#[derive(Debug)]
pub(crate) struct Linked {
    pub script: Vec<u8>,
    pub tokens: Vec<MethodToken>,
    /// Entry address and last byte of each generated method, in address order.
    pub methods: Vec<(String, u32, u32)>,
    pub static_fields: u8,
}

/// Stack-machine code generator for one compilation.
///
/// The symbol table is borrowed for the generator's lifetime and never
/// mutated. The tracer is a type parameter so the default [`NoopTracer`]
/// compiles away.
#[derive(Debug)]
pub struct CodeGenerator<'a, Tr: CodegenTracer = NoopTracer> {
    symbols: &'a SymbolTable,
    options: CompilerOptions,
    map: CodeMap,
    stack: StackMemento,
    pending: PendingTargets,
    /// Entry instruction of every method generated so far.
    method_entries: IndexMap<String, CodeId>,
    /// `CALL`s waiting for their callee's entry to be emitted.
    pending_calls: AHashMap<String, Vec<CodeId>>,
    current: Option<MethodFrame<'a>>,
    scopes: Vec<Scope>,
    ifs: Vec<IfContext>,
    loops: Vec<LoopContext>,
    /// Guard jump skipping each pending loop `else` body, `None` when elided.
    loop_else_guards: Vec<Option<CodeId>>,
    tries: Vec<TryContext>,
    tokens: IndexSet<MethodToken>,
    /// Static field slot of each global that lives in one.
    statics: IndexMap<String, u8>,
    /// Why the globals could not be given slots; every method fails with it.
    slot_error: Option<CompileError>,
    tracer: Tr,
}

impl<'a> CodeGenerator<'a> {
    #[must_use]
    pub fn new(symbols: &'a SymbolTable, options: CompilerOptions) -> Self {
        Self::with_tracer(symbols, options, NoopTracer)
    }
}

impl<'a, Tr: CodegenTracer> CodeGenerator<'a, Tr> {
    pub fn with_tracer(symbols: &'a SymbolTable, options: CompilerOptions, tracer: Tr) -> Self {
        let mut generator = Self {
            symbols,
            options,
            map: CodeMap::new(),
            stack: StackMemento::new(),
            pending: PendingTargets::default(),
            method_entries: IndexMap::new(),
            pending_calls: AHashMap::new(),
            current: None,
            scopes: Vec::new(),
            ifs: Vec::new(),
            loops: Vec::new(),
            loop_else_guards: Vec::new(),
            tries: Vec::new(),
            tokens: IndexSet::new(),
            statics: IndexMap::new(),
            slot_error: None,
            tracer,
        };
        match generator.static_slots() {
            Ok(statics) => generator.statics = statics,
            Err(err) => generator.slot_error = Some(err),
        }
        generator
    }

    #[must_use]
    pub fn code_map(&self) -> &CodeMap {
        &self.map
    }

    #[must_use]
    pub fn stack(&self) -> &StackMemento {
        &self.stack
    }

    #[must_use]
    pub fn symbols(&self) -> &'a SymbolTable {
        self.symbols
    }

    #[must_use]
    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    #[must_use]
    pub fn tracer(&self) -> &Tr {
        &self.tracer
    }

    pub fn into_tracer(self) -> Tr {
        self.tracer
    }

    /// Name of the method being generated, if any.
    #[must_use]
    pub fn current_method(&self) -> Option<&str> {
        self.current.as_ref().map(|frame| frame.name.as_str())
    }

    /// Whether `name` already has an emitted entry.
    #[must_use]
    pub fn is_generated(&self, name: &str) -> bool {
        self.method_entries.contains_key(name)
    }

    /// Number of static field slots the script needs.
    #[must_use]
    pub fn static_field_count(&self) -> usize {
        self.statics.len()
    }

    /// Globals living in static field slots, in slot order.
    pub(crate) fn static_globals(&self) -> impl Iterator<Item = &str> + '_ {
        self.statics.keys().map(String::as_str)
    }

    /// Returns the generator to its freshly created state, keeping the symbol
    /// table, options and tracer.
    pub fn reset(&mut self) {
        self.map.reset();
        self.stack.reset();
        self.pending = PendingTargets::default();
        self.method_entries.clear();
        self.pending_calls.clear();
        self.current = None;
        self.scopes.clear();
        self.ifs.clear();
        self.loops.clear();
        self.loop_else_guards.clear();
        self.tries.clear();
        self.tokens.clear();
    }

    // ------------------------------------------------------------------
    // emission primitives
    // ------------------------------------------------------------------

    /// Appends an instruction and links every deferred patch to it.
    fn insert(&mut self, code: VmCode) -> CodeId {
        let address = self.map.bytecode_size();
        let opcode = code.opcode();
        let id = self.map.insert(code);
        self.tracer.on_emit(address, opcode, self.stack.depth());
        for patch in self.pending.take() {
            self.apply_patch(patch, id);
        }
        id
    }

    fn apply_patch(&mut self, patch: Patch, destination: CodeId) {
        match patch {
            Patch::Jump(code) => self.set_target(code, Target::Code(destination)),
            Patch::TryExcept(code) => {
                let finally = match self.map.code(code).target() {
                    Some(Target::Try { finally, .. }) => finally,
                    _ => None,
                };
                self.set_target(
                    code,
                    Target::Try {
                        except: Some(destination),
                        finally,
                    },
                );
            }
            Patch::TryFinally(code) => {
                let except = match self.map.code(code).target() {
                    Some(Target::Try { except, .. }) => except,
                    _ => None,
                };
                self.set_target(
                    code,
                    Target::Try {
                        except,
                        finally: Some(destination),
                    },
                );
            }
            Patch::MethodEntry(name) => {
                for call in self.pending_calls.remove(&name).unwrap_or_default() {
                    self.set_target(call, Target::Code(destination));
                }
                self.method_entries.insert(name, destination);
            }
        }
    }

    fn set_target(&mut self, code: CodeId, target: Target) {
        self.map.set_target(code, target);
        if let Some(address) = self.map.start_address(code) {
            let destination = match target {
                Target::Code(dest) | Target::Try { except: Some(dest), .. } => self.map.start_address(dest),
                _ => None,
            };
            self.tracer.on_patch(address, self.map.code(code).opcode(), destination);
        }
    }

    fn emit(&mut self, opcode: Opcode) -> CodeId {
        self.insert(VmCode::new(opcode))
    }

    fn emit_data(&mut self, opcode: Opcode, data: &[u8]) -> CodeId {
        self.insert(VmCode::with_data(opcode, data))
    }

    fn emit_jump(&mut self, opcode: Opcode, target: Target) -> CodeId {
        self.insert(VmCode::jump(opcode, target))
    }

    /// Emits a jump that lands on whatever instruction comes next.
    fn emit_forward_jump(&mut self, opcode: Opcode) -> CodeId {
        let jump = self.emit_jump(opcode, Target::Unresolved);
        self.link_next(jump);
        jump
    }

    /// Links `jump` to the next instruction emitted.
    fn link_next(&mut self, jump: CodeId) {
        self.pending.defer(Patch::Jump(jump));
    }

    /// Emits `opcode`, pops `pops` items and pushes `push` on the shadow stack.
    fn op(&mut self, opcode: Opcode, pops: usize, push: Option<ValueType>) -> CodeId {
        let id = self.emit(opcode);
        for _ in 0..pops {
            self.stack.pop(Some(id));
        }
        if let Some(ty) = push {
            self.stack.push(Some(id), ty);
        }
        id
    }

    fn push_type(&mut self, ty: ValueType) {
        let at = self.map.last();
        self.stack.push(at, ty);
    }

    fn pop_type(&mut self) -> ValueType {
        let at = self.map.last();
        self.stack.pop(at)
    }

    /// Forgets the stack effect of code that never falls through, restoring the
    /// shape seen by the instruction that follows it.
    fn restore_stack(&mut self, stack: Vec<ValueType>) {
        let at = self.map.last();
        self.stack.replace(at, stack);
    }

    /// Last instruction, when it can be deleted without breaking a link to it.
    fn detachable_last(&self) -> Option<CodeId> {
        let last = self.map.last()?;
        let targeted = self.map.codes_with_target().any(|code| {
            self.map
                .code(code)
                .target()
                .is_some_and(|target| target.codes().any(|dest| dest == last))
        });
        (self.pending.is_empty() && !targeted).then_some(last)
    }

    /// Pushes a small non-negative count or index.
    fn push_index(&mut self, value: usize) {
        for code in literal::integer_codes(&BigInt::from(value)).expect("index fits in 32 bytes") {
            self.insert(code);
        }
        self.push_type(ValueType::NonNegInt);
    }

    /// Copies the item `depth` places below the top onto the top.
    fn pick(&mut self, depth: usize) {
        let ty = self.stack.peek(depth);
        match depth {
            0 => {
                self.emit(Opcode::Dup);
            }
            1 => {
                self.emit(Opcode::Over);
            }
            _ => {
                self.push_index(depth);
                self.op(Opcode::Pick, 1, None);
            }
        }
        self.push_type(ty);
    }

    fn dup(&mut self) {
        self.pick(0);
    }

    fn swap(&mut self) {
        let id = self.emit(Opcode::Swap);
        self.stack.reverse(Some(id), 2, false);
    }

    fn drop_top(&mut self) {
        self.op(Opcode::Drop, 1, None);
    }

    fn nip(&mut self) {
        let id = self.emit(Opcode::Nip);
        self.stack.remove(Some(id), 1);
    }

    /// Reverses the order of the top `count` items.
    fn reverse_top(&mut self, count: usize) {
        let opcode = match count {
            0 | 1 => return,
            2 => Opcode::Swap,
            3 => Opcode::Reverse3,
            4 => Opcode::Reverse4,
            _ => {
                self.push_index(count);
                let id = self.op(Opcode::ReverseN, 1, None);
                self.stack.reverse(Some(id), count, false);
                return;
            }
        };
        let id = self.emit(opcode);
        self.stack.reverse(Some(id), count, false);
    }

    /// Records a method token once and returns its `CALLT` index.
    fn method_token(&mut self, token: MethodToken) -> u16 {
        let (index, _) = self.tokens.insert_full(token);
        u16::try_from(index).expect("method token table exceeds u16")
    }

    // ------------------------------------------------------------------
    // scopes
    // ------------------------------------------------------------------

    /// Records that `name` is known to hold a `ty` in the current scope.
    pub fn convert_narrow(&mut self, name: &str, ty: ValueType) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.narrowed.insert(name.to_owned(), ty);
        }
    }

    fn narrowed_type(&self, name: &str) -> Option<&ValueType> {
        self.scopes.iter().rev().find_map(|scope| scope.narrowed.get(name))
    }

    // ------------------------------------------------------------------
    // removal and rollback
    // ------------------------------------------------------------------

    /// Removes the instructions inside `[start, end]`; anything linked to them
    /// is relinked to the instruction that followed the range.
    fn remove_codes(&mut self, start: u32, end: u32) {
        let successor = self.map.get_exact(end + 1);
        let removed = self.map.remove_range(start, end);
        if removed.is_empty() {
            return;
        }
        self.tracer.on_remove(start, end, removed.len());
        let removed: AHashSet<CodeId> = removed.into_iter().collect();
        self.relink_removed(&removed, successor);
    }

    /// Fixes every reference into `removed`: targets move to `successor`, or are
    /// deferred to the next instruction when nothing follows.
    fn relink_removed(&mut self, removed: &AHashSet<CodeId>, successor: Option<CodeId>) {
        self.pending.forget(removed);
        for calls in self.pending_calls.values_mut() {
            calls.retain(|call| !removed.contains(call));
        }
        let entry_points: AHashSet<CodeId> = self.method_entries.values().copied().collect();
        let moved = successor.filter(|next| !entry_points.contains(next));
        // removed entry -> name of the method that lost it
        let mut orphaned: AHashMap<CodeId, String> = AHashMap::new();
        self.method_entries.retain(|name, entry| {
            if !removed.contains(entry) {
                return true;
            }
            match moved {
                Some(next) => {
                    *entry = next;
                    true
                }
                None => {
                    orphaned.insert(*entry, name.clone());
                    false
                }
            }
        });
        // the open method gets its entry back from whatever is emitted next
        if successor.is_none()
            && let Some(frame) = &self.current
            && orphaned.values().any(|name| *name == frame.name)
        {
            self.pending.defer(Patch::MethodEntry(frame.name.clone()));
        }

        let linked: Vec<CodeId> = self.map.codes_with_target().collect();
        for code in linked {
            let Some(target) = self.map.code(code).target() else {
                continue;
            };
            // calls into a method that lost its body wait for it to be generated again
            if self.map.code(code).opcode().is_call()
                && let Target::Code(stale) = target
                && let Some(name) = orphaned.get(&stale)
            {
                self.map.set_target(code, Target::Unresolved);
                self.pending_calls.entry(name.clone()).or_default().push(code);
                continue;
            }
            for stale in target.codes().filter(|dest| removed.contains(dest)) {
                let current = self.map.code(code).target().unwrap_or(target);
                let except_half = matches!(current, Target::Try { except: Some(dest), .. } if dest == stale);
                self.map.set_target(code, current.retarget(stale, successor));
                if successor.is_none() {
                    self.pending.defer(match current {
                        Target::Try { .. } if except_half => Patch::TryExcept(code),
                        Target::Try { .. } => Patch::TryFinally(code),
                        _ => Patch::Jump(code),
                    });
                }
            }
        }
    }

    /// Saves the current position so speculative emission can be undone.
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint<'a> {
        Checkpoint {
            address: self.map.bytecode_size(),
            stack: self.stack.checkpoint(),
            method: self.current.clone(),
            scopes: self.scopes.len(),
            ifs: self.ifs.len(),
            loops: self.loops.len(),
            loop_else_guards: self.loop_else_guards.len(),
            tries: self.tries.len(),
            tokens: self.tokens.len(),
        }
    }

    /// Discards everything emitted since `checkpoint`.
    pub fn rollback(&mut self, checkpoint: Checkpoint<'a>) {
        let removed: AHashSet<CodeId> = self.map.truncate(checkpoint.address).into_iter().collect();
        self.tracer.on_rollback(checkpoint.address);
        self.relink_removed(&removed, None);
        if let Some(frame) = &self.current
            && checkpoint.method.as_ref().is_none_or(|saved| saved.name != frame.name)
        {
            self.pending.forget_method(&frame.name);
        }
        self.stack.restore(checkpoint.address, &self.map);
        self.stack.rollback(checkpoint.stack);
        self.current = checkpoint.method;
        self.scopes.truncate(checkpoint.scopes);
        self.ifs.truncate(checkpoint.ifs);
        self.loops.truncate(checkpoint.loops);
        self.loop_else_guards.truncate(checkpoint.loop_else_guards);
        self.tries.truncate(checkpoint.tries);
        self.tokens.truncate(checkpoint.tokens);
    }

    // ------------------------------------------------------------------
    // methods
    // ------------------------------------------------------------------

    /// Opens the body of `name`; its first instruction becomes the entry.
    pub fn convert_begin_method(&mut self, name: &str) -> Result<(), CompileError> {
        if self.current.is_some() {
            return Err(CompileError::Unbalanced { construct: "method" });
        }
        if let Some(err) = &self.slot_error {
            return Err(err.clone());
        }
        let method = if name == INITIALIZE {
            None
        } else {
            Some(self.symbols.method(name)?)
        };
        self.restore_stack(Vec::new());
        self.scopes.push(Scope::default());
        self.pending.defer(Patch::MethodEntry(name.to_owned()));
        self.tracer.on_method_begin(name, self.map.bytecode_size());

        match method {
            None if !self.statics.is_empty() => {
                let count = self.static_field_byte()?;
                self.emit_data(Opcode::InitSSlot, &[count]);
            }
            Some(method) if method.arg_slots() > 0 || !method.locals.is_empty() => {
                let slots = |count: usize, what: &str| {
                    u8::try_from(count).map_err(|_| CompileError::Semantic(format!("too many {what} in '{name}'")))
                };
                let locals = slots(method.locals.len(), "locals")?;
                let args = slots(method.arg_slots(), "arguments")?;
                self.emit_data(Opcode::InitSlot, &[locals, args]);
            }
            _ => {}
        }
        self.current = Some(MethodFrame {
            name: name.to_owned(),
            method,
        });
        Ok(())
    }

    /// Closes the current method, adding the implicit return when the body
    /// does not already end with one.
    pub fn convert_end_method(&mut self) -> Result<(), CompileError> {
        if !self.ifs.is_empty() || !self.loops.is_empty() || !self.loop_else_guards.is_empty() || !self.tries.is_empty() {
            return Err(CompileError::Unbalanced { construct: "method" });
        }
        let frame = self.current.take().ok_or(CompileError::Unbalanced { construct: "method" })?;
        let ends_with_return = self.pending.is_empty()
            && self.method_entries.contains_key(&frame.name)
            && self
                .map
                .last()
                .is_some_and(|last| self.map.code(last).opcode() == Opcode::Ret);
        if !ends_with_return {
            if frame.method.is_some_and(|method| method.is_init) {
                self.emit(Opcode::LdArg0);
            }
            self.emit(Opcode::Ret);
        }
        self.restore_stack(Vec::new());
        self.scopes.pop();
        self.tracer
            .on_method_end(&frame.name, self.map.bytecode_size().saturating_sub(1));
        Ok(())
    }

    // ------------------------------------------------------------------
    // finishing
    // ------------------------------------------------------------------

    /// Links what is still pending, removes dead code, widens overflowing jumps
    /// and serializes the script.
    pub(crate) fn finish(&mut self) -> Result<Linked, CompileError> {
        if let Some(frame) = &self.current {
            return Err(CompileError::Semantic(format!("method '{}' was never closed", frame.name)));
        }
        if let Some(err) = &self.slot_error {
            return Err(err.clone());
        }
        for patch in self.pending.take() {
            match patch {
                Patch::Jump(code) => self.set_target(code, Target::End),
                other => debug_assert!(false, "unresolvable patch at end of script: {other:?}"),
            }
        }
        if let Some((name, _)) = self.pending_calls.iter().find(|(_, calls)| !calls.is_empty()) {
            return Err(CompileError::Semantic(format!("'{name}' is called but was never generated")));
        }

        if self.options.removes_dead_code() {
            self.eliminate_dead_code();
        }
        if self.options.widen_jumps {
            for code in self.map.widen_jumps() {
                let address = self.map.start_address(code).unwrap_or_default();
                self.tracer.on_widen(address, self.map.code(code).opcode());
            }
        } else if let Some(code) = self.overflowing_jump() {
            let address = self.map.start_address(code).unwrap_or_default();
            return Err(CompileError::Semantic(format!(
                "jump at address {address} does not fit its operand and widening is disabled"
            )));
        }

        let mut entries: Vec<(String, u32)> = self
            .method_entries
            .iter()
            .filter_map(|(name, &entry)| Some((name.clone(), self.map.start_address(entry)?)))
            .collect();
        entries.sort_by_key(|(_, start)| *start);
        let size = self.map.bytecode_size();
        let methods = entries
            .iter()
            .enumerate()
            .map(|(i, (name, start))| {
                let end = entries.get(i + 1).map_or(size, |(_, next)| *next).saturating_sub(1);
                (name.clone(), *start, end)
            })
            .collect();

        Ok(Linked {
            script: self.map.result(),
            tokens: self.tokens.iter().cloned().collect(),
            methods,
            static_fields: self.static_field_byte()?,
        })
    }

    /// Removes every instruction unreachable from the public methods and
    /// `_initialize`. Returns the number of instructions removed.
    pub fn eliminate_dead_code(&mut self) -> usize {
        let entries: Vec<CodeId> = self
            .symbols
            .public_methods()
            .chain([INITIALIZE])
            .filter_map(|name| self.method_entries.get(name).copied())
            .collect();
        if entries.is_empty() {
            return 0;
        }
        let reachable = optimizer::reachable(&self.map, entries);
        let before = (self.map.len(), self.map.bytecode_size());
        for (start, end) in optimizer::unreachable_ranges(&self.map, &reachable).into_iter().rev() {
            self.remove_codes(start, end);
        }
        let removed = before.0 - self.map.len();
        if removed > 0 {
            self.tracer.on_dead_code(removed, before.1 - self.map.bytecode_size());
        }
        removed
    }

    fn overflowing_jump(&self) -> Option<CodeId> {
        self.map.codes_with_target().find(|&code| {
            let opcode = self.map.code(code).opcode();
            let width = match opcode {
                Opcode::Try => 1,
                Opcode::TryL => 4,
                _ => opcode.info().operand_size,
            };
            self.map
                .offsets(code)
                .into_iter()
                .any(|offset| !crate::bytecode::offset_fits(offset, width))
        })
    }

    fn static_field_byte(&self) -> Result<u8, CompileError> {
        u8::try_from(self.statics.len())
            .map_err(|_| CompileError::Semantic(format!("{} static fields exceed the slot limit", self.statics.len())))
    }

    /// Collects the static field slot of every global that is neither inlined
    /// nor storage-backed.
    fn static_slots(&self) -> Result<IndexMap<String, u8>, CompileError> {
        let mut slots = IndexMap::new();
        let statics = self
            .symbols
            .globals
            .iter()
            .filter(|(_, variable)| self.global_kind(variable) == variable::GlobalKind::Static);
        for (name, _) in statics {
            // INITSSLOT takes the slot count as one byte
            let slot = u8::try_from(slots.len())
                .ok()
                .filter(|&slot| slot < u8::MAX)
                .ok_or_else(|| CompileError::Semantic("static fields exceed the 255 slot limit".to_owned()))?;
            slots.insert(name.clone(), slot);
        }
        Ok(slots)
    }
}
