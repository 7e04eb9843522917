//! Loops, branches, calls and exception handlers, checked both on the
//! finished script layout and by running it.

mod common;

use common::{Value, assert_targets_resolve, run};
use indexmap::IndexMap;
use neobc::{
    BinaryOp, CodegenTracer, CompilationSession, CompileError, CompilerOptions, Literal, Method, RecordingTracer, SymbolTable,
    TraceEvent, UserClass, ValueType,
    bytecode::{Opcode, disasm::Instruction},
};
use pretty_assertions::assert_eq;

fn int(value: i64) -> Literal {
    Literal::from(value)
}

fn ints() -> ValueType {
    ValueType::list_of(ValueType::Int)
}

fn at(program: &[Instruction], address: u32) -> &Instruction {
    program
        .iter()
        .find(|ins| ins.address == address)
        .unwrap_or_else(|| panic!("no instruction at {address}"))
}

#[test]
fn while_loop_accumulates() {
    let symbols = SymbolTable::new().with_method(
        "sum_to",
        Method::new(ValueType::Int)
            .public()
            .with_arg("n", ValueType::Int)
            .with_local("total", ValueType::Int)
            .with_local("i", ValueType::Int),
    );
    let mut session = CompilationSession::new(&symbols, CompilerOptions::default());
    session
        .generate_method("sum_to", |g| {
            g.convert_literal(&int(0))?;
            g.convert_store_variable("total")?;
            g.convert_literal(&int(0))?;
            g.convert_store_variable("i")?;
            g.convert_begin_while()?;
            g.convert_load_variable("i")?;
            g.convert_load_variable("n")?;
            g.convert_binary_op(BinaryOp::Lt)?;
            g.convert_begin_while_body()?;
            g.convert_load_variable("i")?;
            g.convert_literal(&int(1))?;
            g.convert_binary_op(BinaryOp::Add)?;
            g.convert_store_variable("i")?;
            g.convert_load_variable("total")?;
            g.convert_load_variable("i")?;
            g.convert_binary_op(BinaryOp::Add)?;
            g.convert_store_variable("total")?;
            g.convert_end_while(false)?;
            g.convert_load_variable("total")?;
            g.convert_return(true)
        })
        .unwrap();
    let unit = session.finish().unwrap();
    assert_targets_resolve(&unit);
    assert_eq!(run(&unit, "sum_to", vec![Value::Int(4)]), Ok(Value::Int(10)));
    assert_eq!(run(&unit, "sum_to", vec![Value::Int(0)]), Ok(Value::Int(0)));
}

fn search_symbols() -> SymbolTable {
    let search = || {
        Method::new(ValueType::Int)
            .public()
            .with_arg("items", ints())
            .with_arg("target", ValueType::Int)
            .with_local("x", ValueType::Int)
    };
    SymbolTable::new()
        .with_method("find", search())
        .with_method("first_over", search())
        .with_method(
            "count_even",
            Method::new(ValueType::Int)
                .public()
                .with_arg("items", ints())
                .with_local("x", ValueType::Int)
                .with_local("count", ValueType::Int),
        )
}

#[test]
fn for_else_runs_only_without_break() {
    let symbols = search_symbols();
    let mut session = CompilationSession::new(&symbols, CompilerOptions::default());
    session
        .generate_method("find", |g| {
            g.convert_load_variable("items")?;
            g.convert_begin_for()?;
            g.convert_store_variable("x")?;
            g.convert_load_variable("x")?;
            g.convert_load_variable("target")?;
            g.convert_binary_op(BinaryOp::Eq)?;
            g.convert_begin_if()?;
            g.convert_break()?;
            g.convert_end_if()?;
            g.convert_end_for(true)?;
            g.convert_literal(&int(-1))?;
            g.convert_return(true)?;
            g.convert_end_loop_else()?;
            g.convert_load_variable("x")?;
            g.convert_return(true)
        })
        .unwrap();
    let unit = session.finish().unwrap();
    assert_targets_resolve(&unit);
    let find = |target: i64| run(&unit, "find", vec![Value::ints(&[1, 2, 3]), Value::Int(target)]);
    assert_eq!(find(2), Ok(Value::Int(2)));
    assert_eq!(find(9), Ok(Value::Int(-1)));
    assert_eq!(
        run(&unit, "find", vec![Value::ints(&[]), Value::Int(1)]),
        Ok(Value::Int(-1))
    );
}

#[test]
fn break_without_else_leaves_no_flag() {
    let symbols = search_symbols();
    let mut session = CompilationSession::new(&symbols, CompilerOptions::default());
    session
        .generate_method("first_over", |g| {
            g.convert_load_variable("items")?;
            g.convert_begin_for()?;
            g.convert_store_variable("x")?;
            g.convert_load_variable("x")?;
            g.convert_load_variable("target")?;
            g.convert_binary_op(BinaryOp::Gt)?;
            g.convert_begin_if()?;
            g.convert_break()?;
            g.convert_end_if()?;
            g.convert_end_for(false)?;
            g.convert_load_variable("x")?;
            g.convert_return(true)
        })
        .unwrap();
    let unit = session.finish().unwrap();
    assert_targets_resolve(&unit);
    let program = unit.disassemble().unwrap();
    assert!(
        program
            .iter()
            .all(|ins| !matches!(ins.opcode, Opcode::PushT | Opcode::PushF))
    );
    let first_over = |limit: i64| run(&unit, "first_over", vec![Value::ints(&[1, 5, 7]), Value::Int(limit)]);
    assert_eq!(first_over(4), Ok(Value::Int(5)));
    assert_eq!(first_over(10), Ok(Value::Int(7)));
}

#[test]
fn continue_skips_rest_of_body() {
    let symbols = search_symbols();
    let mut session = CompilationSession::new(&symbols, CompilerOptions::default());
    session
        .generate_method("count_even", |g| {
            g.convert_literal(&int(0))?;
            g.convert_store_variable("count")?;
            g.convert_load_variable("items")?;
            g.convert_begin_for()?;
            g.convert_store_variable("x")?;
            g.convert_load_variable("x")?;
            g.convert_literal(&int(2))?;
            g.convert_binary_op(BinaryOp::Mod)?;
            g.convert_literal(&int(1))?;
            g.convert_binary_op(BinaryOp::Eq)?;
            g.convert_begin_if()?;
            g.convert_continue()?;
            g.convert_end_if()?;
            g.convert_load_variable("count")?;
            g.convert_literal(&int(1))?;
            g.convert_binary_op(BinaryOp::Add)?;
            g.convert_store_variable("count")?;
            g.convert_end_for(false)?;
            g.convert_load_variable("count")?;
            g.convert_return(true)
        })
        .unwrap();
    let unit = session.finish().unwrap();
    assert_targets_resolve(&unit);
    assert_eq!(
        run(&unit, "count_even", vec![Value::ints(&[1, 2, 3, 4, 6])]),
        Ok(Value::Int(3))
    );
    assert_eq!(
        run(&unit, "count_even", vec![Value::ints(&[-3, -2])]),
        Ok(Value::Int(1))
    );
}

#[test]
fn recursive_call_resolves_to_own_entry() {
    let symbols = SymbolTable::new().with_method(
        "fact",
        Method::new(ValueType::Int).public().with_arg("n", ValueType::Int),
    );
    let mut session = CompilationSession::new(&symbols, CompilerOptions::default());
    session
        .generate_method("fact", |g| {
            g.convert_load_variable("n")?;
            g.convert_literal(&int(1))?;
            g.convert_binary_op(BinaryOp::LtE)?;
            g.convert_begin_if()?;
            g.convert_literal(&int(1))?;
            g.convert_return(true)?;
            g.convert_end_if()?;
            g.convert_load_variable("n")?;
            g.convert_load_variable("n")?;
            g.convert_literal(&int(1))?;
            g.convert_binary_op(BinaryOp::Sub)?;
            g.convert_method_call("fact")?;
            g.convert_binary_op(BinaryOp::Mul)?;
            g.convert_return(true)
        })
        .unwrap();
    let unit = session.finish().unwrap();
    assert_targets_resolve(&unit);
    let call = unit
        .disassemble()
        .unwrap()
        .into_iter()
        .find(|ins| ins.opcode == Opcode::Call)
        .unwrap();
    assert_eq!(call.target, unit.method_address("fact"));
    assert_eq!(run(&unit, "fact", vec![Value::Int(5)]), Ok(Value::Int(120)));
}

#[test]
fn forward_call_and_constructor() {
    let fields: IndexMap<String, ValueType> = [("amount".to_owned(), ValueType::Int)].into_iter().collect();
    let account = ValueType::Object("Account".to_owned());
    let symbols = SymbolTable::new()
        .with_class(
            "Account",
            UserClass {
                fields,
                init: Some("Account.__init__".to_owned()),
            },
        )
        .with_method(
            "Account.__init__",
            Method::new(ValueType::None)
                .constructor()
                .with_arg("self", account)
                .with_arg("amount", ValueType::Int),
        )
        .with_method(
            "open",
            Method::new(ValueType::Int).public().with_arg("amount", ValueType::Int),
        );
    let mut session = CompilationSession::new(&symbols, CompilerOptions::default());
    session
        .generate_method("open", |g| {
            g.convert_load_variable("amount")?;
            g.convert_new_object("Account")?;
            g.convert_load_field("amount")?;
            g.convert_return(true)
        })
        .unwrap();
    session
        .generate_method("Account.__init__", |g| {
            g.convert_load_variable("amount")?;
            g.convert_load_variable("self")?;
            g.convert_store_field("amount")
        })
        .unwrap();
    let unit = session.finish().unwrap();
    assert_targets_resolve(&unit);
    assert_eq!(
        unit.methods.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["open", "Account.__init__"]
    );
    assert_eq!(run(&unit, "open", vec![Value::Int(7)]), Ok(Value::Int(7)));
}

#[test]
fn packed_arguments_keep_source_order() {
    let symbols = SymbolTable::new()
        .with_method(
            "diff",
            Method::new(ValueType::Int)
                .with_arg("a", ValueType::Int)
                .with_arg("b", ValueType::Int)
                .packed_args(),
        )
        .with_method("main", Method::new(ValueType::Int).public());
    let mut session = CompilationSession::new(&symbols, CompilerOptions::default());
    session
        .generate_method("main", |g| {
            g.convert_literal(&int(10))?;
            g.convert_literal(&int(3))?;
            g.convert_method_call("diff")?;
            g.convert_return(true)
        })
        .unwrap();
    session
        .generate_method("diff", |g| {
            g.convert_load_variable("a")?;
            g.convert_load_variable("b")?;
            g.convert_binary_op(BinaryOp::Sub)?;
            g.convert_store_variable("b")?;
            g.convert_load_variable("b")?;
            g.convert_return(true)
        })
        .unwrap();
    let unit = session.finish().unwrap();
    assert_targets_resolve(&unit);
    let program = unit.disassemble().unwrap();
    let init = program.iter().find(|ins| ins.opcode == Opcode::InitSlot).unwrap();
    assert_eq!(init.operand, vec![0, 1]);
    assert_eq!(run(&unit, "main", vec![]), Ok(Value::Int(7)));
}

#[test]
fn failed_callee_can_be_generated_again() {
    let symbols = SymbolTable::new()
        .with_method("helper", Method::new(ValueType::Int).with_arg("x", ValueType::Int))
        .with_method("main", Method::new(ValueType::Int).public());
    let mut session = CompilationSession::new(&symbols, CompilerOptions::default());
    session
        .generate_method("main", |g| {
            g.convert_literal(&int(20))?;
            g.convert_method_call("helper")?;
            g.convert_return(true)
        })
        .unwrap();
    let failed = session.generate_method("helper", |g| {
        g.convert_load_variable("x")?;
        g.convert_method_call("missing")
    });
    assert_eq!(failed, Err(CompileError::UnknownSymbol("missing".to_owned())));
    assert_eq!(session.failures().len(), 1);
    session
        .generate_method("helper", |g| {
            g.convert_load_variable("x")?;
            g.convert_literal(&int(1))?;
            g.convert_binary_op(BinaryOp::Add)?;
            g.convert_return(true)
        })
        .unwrap();
    let unit = session.finish().unwrap();
    assert_targets_resolve(&unit);
    let call = unit
        .disassemble()
        .unwrap()
        .into_iter()
        .find(|ins| ins.opcode == Opcode::Call)
        .unwrap();
    assert_eq!(call.target, unit.method_address("helper"));
    assert_eq!(run(&unit, "main", vec![]), Ok(Value::Int(21)));
}

fn long_loop_symbols() -> SymbolTable {
    SymbolTable::new().with_method(
        "repeat",
        Method::new(ValueType::Int)
            .public()
            .with_arg("n", ValueType::Int)
            .with_local("total", ValueType::Int),
    )
}

/// `total += 1` fifty times per iteration, so both loop jumps span more than
/// a one-byte offset can reach.
fn generate_long_loop<Tr: CodegenTracer>(session: &mut CompilationSession<'_, Tr>) {
    session
        .generate_method("repeat", |g| {
            g.convert_literal(&int(0))?;
            g.convert_store_variable("total")?;
            g.convert_begin_while()?;
            g.convert_load_variable("n")?;
            g.convert_literal(&int(0))?;
            g.convert_binary_op(BinaryOp::Gt)?;
            g.convert_begin_while_body()?;
            for _ in 0..50 {
                g.convert_load_variable("total")?;
                g.convert_literal(&int(1))?;
                g.convert_binary_op(BinaryOp::Add)?;
                g.convert_store_variable("total")?;
            }
            g.convert_load_variable("n")?;
            g.convert_literal(&int(1))?;
            g.convert_binary_op(BinaryOp::Sub)?;
            g.convert_store_variable("n")?;
            g.convert_end_while(false)?;
            g.convert_load_variable("total")?;
            g.convert_return(true)
        })
        .unwrap();
}

#[test]
fn long_jumps_are_widened() {
    let symbols = long_loop_symbols();
    let mut session = CompilationSession::with_tracer(&symbols, CompilerOptions::default(), RecordingTracer::new());
    generate_long_loop(&mut session);
    let (unit, tracer) = session.finish_traced().unwrap();
    assert_targets_resolve(&unit);

    let opcodes: Vec<Opcode> = unit.disassemble().unwrap().iter().map(|ins| ins.opcode).collect();
    assert!(opcodes.contains(&Opcode::JmpL));
    assert!(opcodes.contains(&Opcode::JmpIfL));
    assert!(!opcodes.contains(&Opcode::Jmp));
    let widened = tracer
        .into_events()
        .into_iter()
        .filter(|event| matches!(event, TraceEvent::Widen { .. }))
        .count();
    assert_eq!(widened, 2);
    assert_eq!(run(&unit, "repeat", vec![Value::Int(3)]), Ok(Value::Int(150)));
}

#[test]
fn overflowing_jump_without_widening_is_an_error() {
    let symbols = long_loop_symbols();
    let mut session = CompilationSession::new(&symbols, CompilerOptions::default().with_widen_jumps(false));
    generate_long_loop(&mut session);
    assert!(matches!(session.finish(), Err(CompileError::Semantic(message)) if message.contains("widening")));
}

#[test]
fn try_handlers_point_at_their_blocks() {
    let symbols = SymbolTable::new().with_method(
        "guarded",
        Method::new(ValueType::Int)
            .public()
            .with_arg("a", ValueType::Int)
            .with_local("x", ValueType::Int),
    );
    let mut session = CompilationSession::new(&symbols, CompilerOptions::default());
    session
        .generate_method("guarded", |g| {
            g.convert_begin_try()?;
            g.convert_load_variable("a")?;
            g.convert_store_variable("x")?;
            g.convert_try_except(None)?;
            g.convert_literal(&int(0))?;
            g.convert_store_variable("x")?;
            g.convert_end_try(true)?;
            g.convert_load_variable("x")?;
            g.convert_literal(&int(1))?;
            g.convert_binary_op(BinaryOp::Add)?;
            g.convert_store_variable("x")?;
            g.convert_end_try_finally()?;
            g.convert_load_variable("x")?;
            g.convert_return(true)
        })
        .unwrap();
    let unit = session.finish().unwrap();
    assert_targets_resolve(&unit);
    let program = unit.disassemble().unwrap();

    let try_ins = program.iter().find(|ins| ins.opcode == Opcode::Try).unwrap();
    let (Some(except), Some(finally)) = try_ins.handlers.unwrap() else {
        panic!("both handlers expected");
    };
    assert_eq!(at(&program, except).opcode, Opcode::Drop);
    assert_eq!(at(&program, finally).opcode, Opcode::LdLoc0);

    let end_finally = program.iter().find(|ins| ins.opcode == Opcode::EndFinally).unwrap();
    let after = end_finally.address + end_finally.size();
    let end_tries: Vec<_> = program.iter().filter(|ins| ins.opcode == Opcode::EndTry).collect();
    assert_eq!(end_tries.len(), 2);
    assert!(end_tries.iter().all(|ins| ins.target == Some(after)));
    assert_eq!(at(&program, after).opcode, Opcode::LdLoc0);
}

fn dead_code_symbols() -> SymbolTable {
    SymbolTable::new()
        .with_method("unused", Method::new(ValueType::Int))
        .with_method("main", Method::new(ValueType::Int).public())
}

fn generate_dead_code(session: &mut CompilationSession<'_, RecordingTracer>) {
    session
        .generate_method("unused", |g| {
            g.convert_literal(&int(41))?;
            g.convert_return(true)
        })
        .unwrap();
    session
        .generate_method("main", |g| {
            g.convert_literal(&int(42))?;
            g.convert_return(true)
        })
        .unwrap();
}

#[test]
fn uncalled_private_method_is_removed() {
    let symbols = dead_code_symbols();
    let mut session = CompilationSession::with_tracer(&symbols, CompilerOptions::default(), RecordingTracer::new());
    generate_dead_code(&mut session);
    let (unit, tracer) = session.finish_traced().unwrap();
    assert_eq!(unit.methods.keys().map(String::as_str).collect::<Vec<_>>(), vec!["main"]);
    assert_eq!(unit.method_address("main"), Some(0));
    assert_eq!(unit.script, [0x00, 42, 0x40]);
    assert!(
        tracer
            .into_events()
            .contains(&TraceEvent::DeadCode { removed: 2, bytes: 3 })
    );
}

#[test]
fn dead_code_elimination_is_idempotent() {
    let symbols = dead_code_symbols();
    let mut session = CompilationSession::with_tracer(&symbols, CompilerOptions::default(), RecordingTracer::new());
    generate_dead_code(&mut session);
    assert_eq!(session.generator().eliminate_dead_code(), 2);
    assert_eq!(session.generator().eliminate_dead_code(), 0);
    let unit = session.finish().unwrap();
    assert_eq!(unit.script, [0x00, 42, 0x40]);
}
