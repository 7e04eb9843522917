//! Calls: user methods, builtins, class construction and field access, events
//! and other contracts.
//!
//! The visitor pushes arguments in source order. A callee's `INITSLOT` takes
//! its first argument from the top of the stack, so user calls reverse the
//! arguments first; events, contract calls and methods taking packed arguments
//! reverse them before `PACK` so the packed array keeps source order.

use super::CodeGenerator;
use crate::{
    bytecode::{Opcode, Target},
    error::CompileError,
    interop::{CallFlags, Syscall},
    symbols::BuiltinMethod,
    tracer::CodegenTracer,
    types::ValueType,
};

impl<Tr: CodegenTracer> CodeGenerator<'_, Tr> {
    /// Calls the user method `name` with its arguments on the stack.
    pub fn convert_method_call(&mut self, name: &str) -> Result<(), CompileError> {
        let method = self.symbols.method(name)?;
        let args = method.args.len();
        if method.packs_args {
            self.pack_args(args);
        } else {
            self.reverse_top(args);
        }
        self.emit_call(name);
        for _ in 0..method.arg_slots() {
            self.pop_type();
        }
        if method.returns_value() {
            self.push_type(method.return_type.clone());
        }
        Ok(())
    }

    /// `CALL` linked to the entry of `name`, now or once it is generated.
    fn emit_call(&mut self, name: &str) {
        match self.method_entries.get(name) {
            Some(&entry) => {
                self.emit_jump(Opcode::Call, Target::Code(entry));
            }
            None => {
                let call = self.emit_jump(Opcode::Call, Target::Unresolved);
                // a call that is itself the callee's first instruction was linked on insert
                if self.map.code(call).target() == Some(Target::Unresolved) {
                    self.pending_calls.entry(name.to_owned()).or_default().push(call);
                }
            }
        }
    }

    /// Inlines `builtin` over the arguments on the stack.
    pub fn convert_builtin_call(&mut self, builtin: &dyn BuiltinMethod) -> Result<(), CompileError> {
        let count = builtin.arg_count();
        if let Some(argument) = builtin.index_argument() {
            if argument.index + 1 != count || argument.collection >= argument.index {
                return Err(CompileError::Semantic(format!(
                    "'{}' declares an index argument that is not last",
                    builtin.name()
                )));
            }
            self.fix_negative_index(argument.index - argument.collection);
        }
        let args: Vec<ValueType> = (0..count).rev().map(|depth| self.stack.peek(depth)).collect();
        let codes = builtin.opcodes(&args)?;
        let return_type = builtin.return_type(&args);
        for code in codes {
            debug_assert!(code.target().is_none(), "builtin '{}' emitted a jump", builtin.name());
            self.insert(code);
        }
        for _ in 0..count {
            self.pop_type();
        }
        if return_type != ValueType::None {
            self.push_type(return_type);
        }
        Ok(())
    }

    /// Instantiates `class` with the constructor arguments on the stack. The
    /// instance is an array with one null slot per field.
    pub fn convert_new_object(&mut self, class: &str) -> Result<(), CompileError> {
        let descriptor = self
            .symbols
            .classes
            .get(class)
            .ok_or_else(|| CompileError::UnknownSymbol(class.to_owned()))?;
        let init = match &descriptor.init {
            Some(init) => Some((init.as_str(), self.symbols.method(init)?)),
            None => None,
        };
        if init.is_some_and(|(_, method)| method.packs_args) {
            return Err(CompileError::Semantic(format!(
                "constructor of '{class}' cannot take packed arguments"
            )));
        }
        // `self` is passed as the first argument of the constructor
        let args = init.map_or(0, |(_, method)| method.args.len().saturating_sub(1));
        self.reverse_top(args);
        self.push_index(descriptor.fields.len());
        self.op(Opcode::NewArray, 1, Some(ValueType::Object(class.to_owned())));
        if let Some((name, _)) = init {
            self.emit_call(name);
            for _ in 0..=args {
                self.pop_type();
            }
            self.push_type(ValueType::Object(class.to_owned()));
        }
        Ok(())
    }

    fn field_slot(&self, object: &ValueType, field: &str) -> Result<(usize, ValueType), CompileError> {
        let ValueType::Object(class) = object else {
            return Err(CompileError::unsupported(format!(".{field}"), object));
        };
        self.symbols
            .classes
            .get(class)
            .and_then(|descriptor| descriptor.fields.get_full(field))
            .map(|(slot, _, ty)| (slot, ty.clone()))
            .ok_or_else(|| CompileError::UnknownSymbol(format!("{class}.{field}")))
    }

    /// Replaces the object on top of the stack with the value of `field`.
    pub fn convert_load_field(&mut self, field: &str) -> Result<(), CompileError> {
        let (slot, ty) = self.field_slot(&self.stack.peek(0), field)?;
        self.push_index(slot);
        self.op(Opcode::PickItem, 2, Some(ty));
        Ok(())
    }

    /// Stores the value below the object on top of the stack into `field`.
    pub fn convert_store_field(&mut self, field: &str) -> Result<(), CompileError> {
        let (slot, _) = self.field_slot(&self.stack.peek(0), field)?;
        // [value, obj] -> [obj, slot, value]
        self.swap();
        self.push_index(slot);
        self.swap();
        self.op(Opcode::SetItem, 3, None);
        Ok(())
    }

    /// Raises `event` with its arguments on the stack.
    pub fn convert_event(&mut self, event: &str) -> Result<(), CompileError> {
        let descriptor = self
            .symbols
            .events
            .get(event)
            .ok_or_else(|| CompileError::UnknownSymbol(event.to_owned()))?;
        self.pack_args(descriptor.args.len());
        self.push_data(descriptor.name.as_bytes());
        self.syscall(Syscall::RuntimeNotify, 2, None);
        Ok(())
    }

    /// Calls `method` of the statically known `contract` through
    /// `System.Contract.Call`.
    pub fn convert_contract_call(&mut self, contract: &str, method: &str) -> Result<(), CompileError> {
        let interface = self
            .symbols
            .contracts
            .get(contract)
            .ok_or_else(|| CompileError::UnknownSymbol(contract.to_owned()))?;
        let descriptor = interface
            .methods
            .get(method)
            .ok_or_else(|| CompileError::UnknownSymbol(format!("{contract}.{method}")))?;
        self.pack_args(descriptor.args.len());
        self.push_index(usize::from(CallFlags::ALL.bits()));
        self.push_data(method.as_bytes());
        self.push_data(&interface.hash);
        self.syscall(Syscall::ContractCall, 4, Some(descriptor.return_type.clone()));
        if !descriptor.returns_value() {
            self.drop_top();
        }
        Ok(())
    }

    /// Packs the top `count` items into an array holding them in push order.
    fn pack_args(&mut self, count: usize) {
        if count == 0 {
            self.op(Opcode::NewArray0, 0, Some(ValueType::list_of(ValueType::Any)));
            return;
        }
        self.reverse_top(count);
        self.push_index(count);
        self.op(Opcode::Pack, count + 1, Some(ValueType::list_of(ValueType::Any)));
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        builtins,
        interop::ContractHash,
        literal::Literal,
        options::CompilerOptions,
        symbols::{ContractInterface, Event, Method, SymbolTable, UserClass},
    };

    const TOKEN: ContractHash = [7; 20];

    fn opcodes<Tr: CodegenTracer>(generator: &CodeGenerator<'_, Tr>) -> Vec<Opcode> {
        generator.code_map().iter().map(|(_, _, code)| code.opcode()).collect()
    }

    fn symbols() -> SymbolTable {
        let mut fields = IndexMap::new();
        fields.insert("owner".to_owned(), ValueType::Bytes);
        fields.insert("amount".to_owned(), ValueType::Int);
        let mut methods = IndexMap::new();
        methods.insert(
            "transfer".to_owned(),
            Method::new(ValueType::Bool)
                .with_arg("to", ValueType::Bytes)
                .with_arg("amount", ValueType::Int),
        );
        methods.insert("touch".to_owned(), Method::new(ValueType::None));
        SymbolTable::new()
            .with_method("main", Method::new(ValueType::Int).public())
            .with_method(
                "add",
                Method::new(ValueType::Int)
                    .with_arg("a", ValueType::Int)
                    .with_arg("b", ValueType::Int),
            )
            .with_method(
                "Account.__init__",
                Method::new(ValueType::None)
                    .constructor()
                    .with_arg("self", ValueType::Object("Account".to_owned()))
                    .with_arg("amount", ValueType::Int),
            )
            .with_class(
                "Account",
                UserClass {
                    fields,
                    init: Some("Account.__init__".to_owned()),
                },
            )
            .with_event(
                "Transfer",
                Event {
                    name: "Transfer".to_owned(),
                    args: vec![ValueType::Bytes, ValueType::Int],
                },
            )
            .with_contract(
                "token",
                ContractInterface {
                    hash: TOKEN,
                    methods,
                },
            )
    }

    #[test]
    fn test_method_call_reverses_args() {
        let symbols = symbols();
        let mut generator = CodeGenerator::new(&symbols, CompilerOptions::default());
        generator.convert_begin_method("main").unwrap();
        generator.convert_literal(&Literal::from(1)).unwrap();
        generator.convert_literal(&Literal::from(2)).unwrap();
        generator.convert_method_call("add").unwrap();
        assert_eq!(
            opcodes(&generator),
            vec![Opcode::Push1, Opcode::Push2, Opcode::Swap, Opcode::Call]
        );
        assert_eq!(generator.stack().stack(), &[ValueType::Int]);
        assert_eq!(generator.pending_calls["add"].len(), 1);
    }

    #[test]
    fn test_packed_callee_receives_one_array() {
        let symbols = symbols().with_method(
            "sum",
            Method::new(ValueType::Int)
                .with_arg("a", ValueType::Int)
                .with_arg("b", ValueType::Int)
                .packed_args(),
        );
        let mut generator = CodeGenerator::new(&symbols, CompilerOptions::default());
        generator.convert_begin_method("main").unwrap();
        generator.convert_literal(&Literal::from(1)).unwrap();
        generator.convert_literal(&Literal::from(2)).unwrap();
        generator.convert_method_call("sum").unwrap();
        assert_eq!(
            opcodes(&generator),
            vec![
                Opcode::Push1,
                Opcode::Push2,
                Opcode::Swap,
                Opcode::Push2,
                Opcode::Pack,
                Opcode::Call
            ]
        );
        assert_eq!(generator.stack().stack(), &[ValueType::Int]);
        generator.convert_return(true).unwrap();
        generator.convert_end_method().unwrap();

        generator.convert_begin_method("sum").unwrap();
        let before = generator.code_map().len();
        generator.convert_load_variable("b").unwrap();
        assert_eq!(
            opcodes(&generator)[before..],
            [Opcode::LdArg0, Opcode::Push1, Opcode::PickItem]
        );
        assert_eq!(generator.stack().stack(), &[ValueType::Int]);
    }

    #[test]
    fn test_constructor_cannot_take_packed_args() {
        let mut symbols = symbols();
        symbols.methods["Account.__init__"].packs_args = true;
        let mut generator = CodeGenerator::new(&symbols, CompilerOptions::default());
        generator.convert_begin_method("main").unwrap();
        generator.convert_literal(&Literal::from(5)).unwrap();
        assert!(matches!(
            generator.convert_new_object("Account"),
            Err(CompileError::Semantic(message)) if message.contains("packed")
        ));
    }

    #[test]
    fn test_builtin_pop_with_negative_index() {
        let symbols = symbols().with_method(
            "f",
            Method::new(ValueType::Int)
                .with_arg("items", ValueType::list_of(ValueType::Int))
                .with_arg("i", ValueType::Int),
        );
        let mut generator = CodeGenerator::new(&symbols, CompilerOptions::default());
        generator.convert_begin_method("f").unwrap();
        generator.convert_load_variable("items").unwrap();
        generator.convert_load_variable("i").unwrap();
        let before = generator.code_map().len();
        generator.convert_builtin_call(builtins::lookup("pop_index").unwrap()).unwrap();
        let emitted = &opcodes(&generator)[before..];
        assert!(emitted.contains(&Opcode::JmpNe));
        assert_eq!(
            emitted[emitted.len() - 6..],
            [
                Opcode::Over,
                Opcode::Over,
                Opcode::PickItem,
                Opcode::Reverse3,
                Opcode::Swap,
                Opcode::Remove
            ]
        );
        assert_eq!(generator.stack().stack(), &[ValueType::Int]);
    }

    #[test]
    fn test_builtin_len_and_type_errors() {
        let symbols = symbols().with_method("g", Method::new(ValueType::Int).with_arg("flag", ValueType::Bool));
        let mut generator = CodeGenerator::new(&symbols, CompilerOptions::default());
        generator.convert_begin_method("g").unwrap();
        generator.convert_literal(&Literal::from("abc")).unwrap();
        generator.convert_builtin_call(builtins::lookup("len").unwrap()).unwrap();
        assert_eq!(generator.stack().stack(), &[ValueType::NonNegInt]);
        generator.convert_load_variable("flag").unwrap();
        assert_eq!(
            generator.convert_builtin_call(builtins::lookup("len").unwrap()),
            Err(CompileError::unsupported("len", &ValueType::Bool))
        );
    }

    #[test]
    fn test_new_object_and_fields() {
        let symbols = symbols();
        let mut generator = CodeGenerator::new(&symbols, CompilerOptions::default());
        generator.convert_begin_method("main").unwrap();
        generator.convert_literal(&Literal::from(5)).unwrap();
        generator.convert_new_object("Account").unwrap();
        let account = ValueType::Object("Account".to_owned());
        assert_eq!(generator.stack().stack(), &[account.clone()]);
        generator.convert_load_field("amount").unwrap();
        assert_eq!(generator.stack().stack(), &[ValueType::Int]);
        assert_eq!(
            opcodes(&generator),
            vec![
                Opcode::Push5,
                Opcode::Push2,
                Opcode::NewArray,
                Opcode::Call,
                Opcode::Push1,
                Opcode::PickItem
            ]
        );
        assert_eq!(
            generator.convert_load_field("amount"),
            Err(CompileError::unsupported(".amount", &ValueType::Int))
        );
    }

    #[test]
    fn test_store_field() {
        let symbols = symbols().with_method(
            "set",
            Method::new(ValueType::None)
                .with_arg("account", ValueType::Object("Account".to_owned()))
                .with_arg("who", ValueType::Bytes),
        );
        let mut generator = CodeGenerator::new(&symbols, CompilerOptions::default());
        generator.convert_begin_method("set").unwrap();
        generator.convert_load_variable("who").unwrap();
        generator.convert_load_variable("account").unwrap();
        generator.convert_store_field("owner").unwrap();
        assert_eq!(
            opcodes(&generator)[3..],
            [Opcode::Swap, Opcode::Push0, Opcode::Swap, Opcode::SetItem]
        );
        assert_eq!(generator.stack().depth(), 0);
        generator.convert_load_variable("account").unwrap();
        assert_eq!(
            generator.convert_store_field("balance"),
            Err(CompileError::UnknownSymbol("Account.balance".to_owned()))
        );
    }

    #[test]
    fn test_event_notify() {
        let symbols = symbols();
        let mut generator = CodeGenerator::new(&symbols, CompilerOptions::default());
        generator.convert_begin_method("main").unwrap();
        generator.convert_literal(&Literal::from(b"ab".to_vec())).unwrap();
        generator.convert_literal(&Literal::from(3)).unwrap();
        generator.convert_event("Transfer").unwrap();
        assert_eq!(
            opcodes(&generator),
            vec![
                Opcode::PushData1,
                Opcode::Push3,
                Opcode::Swap,
                Opcode::Push2,
                Opcode::Pack,
                Opcode::PushData1,
                Opcode::Syscall
            ]
        );
        let last = generator.code_map().last().unwrap();
        assert_eq!(
            generator.code_map().code(last).data(),
            &Syscall::RuntimeNotify.operand()[..]
        );
        assert_eq!(generator.stack().depth(), 0);
    }

    #[test]
    fn test_contract_call() {
        let symbols = symbols();
        let mut generator = CodeGenerator::new(&symbols, CompilerOptions::default());
        generator.convert_begin_method("main").unwrap();
        generator.convert_literal(&Literal::from(b"to".to_vec())).unwrap();
        generator.convert_literal(&Literal::from(10)).unwrap();
        generator.convert_contract_call("token", "transfer").unwrap();
        assert_eq!(generator.stack().stack(), &[ValueType::Bool]);
        let codes: Vec<_> = generator
            .code_map()
            .iter()
            .skip(5)
            .map(|(_, _, code)| (code.opcode(), code.data().to_vec()))
            .collect();
        assert_eq!(
            codes,
            vec![
                (Opcode::Push15, vec![]),
                (Opcode::PushData1, b"transfer".to_vec()),
                (Opcode::PushData1, TOKEN.to_vec()),
                (Opcode::Syscall, Syscall::ContractCall.operand().to_vec()),
            ]
        );

        generator.convert_contract_call("token", "touch").unwrap();
        assert_eq!(opcodes(&generator).last(), Some(&Opcode::Drop));
        assert_eq!(generator.stack().stack(), &[ValueType::Bool]);
    }
}
