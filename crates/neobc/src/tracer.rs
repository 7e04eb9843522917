//! Code generation tracing infrastructure.
//!
//! Provides a trait-based tracing system for the generator with zero-cost abstraction.
//! When using [`NoopTracer`], all trace methods compile away entirely via monomorphization.
//!
//! # Architecture
//!
//! The [`CodegenTracer`] trait defines hook points at key generation events (instruction
//! emission, jump patching, code relocation and removal, method boundaries, widening).
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | Zero-cost no-op (production default) |
//! | [`StderrTracer`] | Human-readable generation log to stderr |
//! | [`RecordingTracer`] | Full event recording for tests or post-mortem |
//!
//! # Usage
//!
//! The generator is parameterized as `CodeGenerator<'a, Tr: CodegenTracer>`.
//! Callers choose the tracer when opening a session:
//!
//! ```ignore
//! // Production (zero overhead):
//! let session = CompilationSession::new(&symbols, CompilerOptions::default());
//!
//! // Debugging:
//! let session = CompilationSession::with_tracer(&symbols, options, StderrTracer::new());
//! ```

use crate::bytecode::Opcode;

/// Trace event emitted during code generation.
///
/// Used by [`RecordingTracer`] to capture a full generation trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// An instruction was appended to the code map.
    Emit {
        address: u32,
        opcode: Opcode,
        /// Shadow-stack depth when the instruction was appended.
        stack_depth: usize,
    },
    /// A control-transfer instruction received its destination.
    Patch {
        address: u32,
        opcode: Opcode,
        /// Destination start address, `None` when patched to the end of the script.
        target: Option<u32>,
    },
    /// A contiguous block was moved to the end of the code.
    Relocate { first: u32, last: u32, new_start: u32 },
    /// Instructions were deleted from the code map.
    Remove { start: u32, end: u32, count: usize },
    /// Speculatively emitted code was discarded back to `address`.
    Rollback { address: u32 },
    MethodBegin { name: String, address: u32 },
    MethodEnd { name: String, end: u32 },
    /// A narrow control-transfer instruction was switched to its wide sibling.
    Widen { address: u32, opcode: Opcode },
    /// Unreachable instructions were removed by the optimizer.
    DeadCode { removed: usize, bytes: u32 },
}

/// Trait for code generation tracing.
///
/// All methods have default no-op implementations, so [`NoopTracer`] requires
/// zero lines of code and compiles to zero instructions. Implementations only
/// override the hooks they care about.
pub trait CodegenTracer: std::fmt::Debug {
    /// Called after every instruction is appended.
    ///
    /// This is the hottest hook; implementations should be lightweight.
    #[inline(always)]
    fn on_emit(&mut self, _address: u32, _opcode: Opcode, _stack_depth: usize) {}

    /// Called when a pending jump, call or try handler is linked.
    #[inline(always)]
    fn on_patch(&mut self, _address: u32, _opcode: Opcode, _target: Option<u32>) {}

    #[inline(always)]
    fn on_relocate(&mut self, _first: u32, _last: u32, _new_start: u32) {}

    #[inline(always)]
    fn on_remove(&mut self, _start: u32, _end: u32, _count: usize) {}

    #[inline(always)]
    fn on_rollback(&mut self, _address: u32) {}

    #[inline(always)]
    fn on_method_begin(&mut self, _name: &str, _address: u32) {}

    #[inline(always)]
    fn on_method_end(&mut self, _name: &str, _end: u32) {}

    #[inline(always)]
    fn on_widen(&mut self, _address: u32, _opcode: Opcode) {}

    #[inline(always)]
    fn on_dead_code(&mut self, _removed: usize, _bytes: u32) {}
}

/// A tracer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl CodegenTracer for NoopTracer {}

/// Tracer that prints a human-readable generation log to stderr.
///
/// Output format:
/// ```text
///   >>> METHOD main        @0
/// [    0] INITSLOT          stack=0
/// [    3] PUSH1             stack=1
///   ~~~ PATCH JMPIFNOT @5 -> 12
///   <<< METHOD main        end=14
/// ```
#[derive(Debug, Default)]
pub struct StderrTracer {
    /// Maximum number of events to print before going quiet. None = unlimited.
    limit: Option<usize>,
    count: usize,
    stopped: bool,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracer that stops printing after `limit` events.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Counts one event and reports whether it may still be printed.
    fn admit(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        self.count += 1;
        if let Some(limit) = self.limit
            && self.count > limit
        {
            eprintln!("--- trace limit reached ({limit} events) ---");
            self.stopped = true;
            return false;
        }
        true
    }
}

impl CodegenTracer for StderrTracer {
    #[inline]
    fn on_emit(&mut self, address: u32, opcode: Opcode, stack_depth: usize) {
        if self.admit() {
            eprintln!("[{address:>5}] {opcode:<16}  stack={stack_depth}");
        }
    }

    fn on_patch(&mut self, address: u32, opcode: Opcode, target: Option<u32>) {
        if self.admit() {
            match target {
                Some(target) => eprintln!("  ~~~ PATCH {opcode} @{address} -> {target}"),
                None => eprintln!("  ~~~ PATCH {opcode} @{address} -> <end>"),
            }
        }
    }

    fn on_relocate(&mut self, first: u32, last: u32, new_start: u32) {
        if self.admit() {
            eprintln!("  ... RELOCATE {first}..={last} to {new_start}");
        }
    }

    fn on_remove(&mut self, start: u32, end: u32, count: usize) {
        if self.admit() {
            eprintln!("  --- REMOVE {start}..={end} ({count} instructions)");
        }
    }

    fn on_rollback(&mut self, address: u32) {
        if self.admit() {
            eprintln!("  <-- ROLLBACK to {address}");
        }
    }

    fn on_method_begin(&mut self, name: &str, address: u32) {
        if self.admit() {
            eprintln!("  >>> METHOD {name:<12} @{address}");
        }
    }

    fn on_method_end(&mut self, name: &str, end: u32) {
        if self.admit() {
            eprintln!("  <<< METHOD {name:<12} end={end}");
        }
    }

    fn on_widen(&mut self, address: u32, opcode: Opcode) {
        if self.admit() {
            eprintln!("  +++ WIDEN @{address} to {opcode}");
        }
    }

    fn on_dead_code(&mut self, removed: usize, bytes: u32) {
        if self.admit() {
            eprintln!("  xxx DEAD CODE {removed} instructions, {bytes} bytes");
        }
    }
}

/// Tracer that records all events for tests or post-mortem analysis.
///
/// Allocates per event, so use it only for debugging or short compilations.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
    limit: Option<usize>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a recording tracer that stops recording after `limit` events.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            events: Vec::with_capacity(limit.min(1024)),
            limit: Some(limit),
        }
    }

    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    #[must_use]
    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    fn record(&mut self, event: TraceEvent) {
        if self.limit.is_none_or(|limit| self.events.len() < limit) {
            self.events.push(event);
        }
    }
}

impl CodegenTracer for RecordingTracer {
    #[inline]
    fn on_emit(&mut self, address: u32, opcode: Opcode, stack_depth: usize) {
        self.record(TraceEvent::Emit {
            address,
            opcode,
            stack_depth,
        });
    }

    fn on_patch(&mut self, address: u32, opcode: Opcode, target: Option<u32>) {
        self.record(TraceEvent::Patch { address, opcode, target });
    }

    fn on_relocate(&mut self, first: u32, last: u32, new_start: u32) {
        self.record(TraceEvent::Relocate { first, last, new_start });
    }

    fn on_remove(&mut self, start: u32, end: u32, count: usize) {
        self.record(TraceEvent::Remove { start, end, count });
    }

    fn on_rollback(&mut self, address: u32) {
        self.record(TraceEvent::Rollback { address });
    }

    fn on_method_begin(&mut self, name: &str, address: u32) {
        self.record(TraceEvent::MethodBegin {
            name: name.to_owned(),
            address,
        });
    }

    fn on_method_end(&mut self, name: &str, end: u32) {
        self.record(TraceEvent::MethodEnd {
            name: name.to_owned(),
            end,
        });
    }

    fn on_widen(&mut self, address: u32, opcode: Opcode) {
        self.record(TraceEvent::Widen { address, opcode });
    }

    fn on_dead_code(&mut self, removed: usize, bytes: u32) {
        self.record(TraceEvent::DeadCode { removed, bytes });
    }
}

impl<Tr: CodegenTracer> CodegenTracer for &mut Tr {
    fn on_emit(&mut self, address: u32, opcode: Opcode, stack_depth: usize) {
        (**self).on_emit(address, opcode, stack_depth);
    }

    fn on_patch(&mut self, address: u32, opcode: Opcode, target: Option<u32>) {
        (**self).on_patch(address, opcode, target);
    }

    fn on_relocate(&mut self, first: u32, last: u32, new_start: u32) {
        (**self).on_relocate(first, last, new_start);
    }

    fn on_remove(&mut self, start: u32, end: u32, count: usize) {
        (**self).on_remove(start, end, count);
    }

    fn on_rollback(&mut self, address: u32) {
        (**self).on_rollback(address);
    }

    fn on_method_begin(&mut self, name: &str, address: u32) {
        (**self).on_method_begin(name, address);
    }

    fn on_method_end(&mut self, name: &str, end: u32) {
        (**self).on_method_end(name, end);
    }

    fn on_widen(&mut self, address: u32, opcode: Opcode) {
        (**self).on_widen(address, opcode);
    }

    fn on_dead_code(&mut self, removed: usize, bytes: u32) {
        (**self).on_dead_code(removed, bytes);
    }
}
