#![doc = include_str!("../../../README.md")]

mod builtins;
pub mod bytecode;
mod codegen;
mod error;
mod interop;
mod literal;
mod optimizer;
mod options;
mod session;
mod stack;
mod symbols;
pub mod tracer;
mod types;

pub use crate::{
    builtins::lookup as lookup_builtin,
    codegen::{BinaryOp, Checkpoint, CodeGenerator, INITIALIZE, UnaryOp},
    error::{CompileError, DecodeError, SerializeError},
    interop::{CallFlags, ContractHash, MethodToken, STDLIB_HASH, Syscall, interop_hash, interop_operand},
    literal::Literal,
    optimizer::{reachable, unreachable_ranges},
    options::{CompilerOptions, OptimizationLevel},
    session::{CompilationSession, CompiledUnit, MethodFailure, MethodRange},
    stack::{StackCheckpoint, StackMemento},
    symbols::{BuiltinMethod, ContractInterface, Event, IndexArgument, Method, SymbolTable, UserClass, Variable},
    tracer::{CodegenTracer, NoopTracer, RecordingTracer, StderrTracer, TraceEvent},
    types::{StackItemType, ValueType},
};
