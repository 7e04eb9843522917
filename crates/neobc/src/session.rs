//! One compilation from first method to finished script.
//!
//! A [`CompilationSession`] owns every piece of mutable generation state, so
//! independent contracts can be compiled side by side in one process. The
//! visitor drives it one method at a time; a method whose visitor fails is
//! rolled back and recorded, and generation continues with the next one.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    bytecode::disasm::{self, Instruction},
    codegen::{CodeGenerator, INITIALIZE},
    error::{CompileError, DecodeError, SerializeError},
    interop::MethodToken,
    options::CompilerOptions,
    symbols::SymbolTable,
    tracer::{CodegenTracer, NoopTracer},
};

/// First and last byte of a generated method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodRange {
    pub start: u32,
    pub end: u32,
}

/// A method that was dropped from the unit because generating it failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodFailure {
    pub method: String,
    pub message: String,
}

/// The finished script and everything a manifest or debugger needs from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledUnit {
    pub script: Vec<u8>,
    /// Method-token table indexed by `CALLT`.
    pub tokens: Vec<MethodToken>,
    /// Address range of every generated method, in address order.
    pub methods: IndexMap<String, MethodRange>,
    pub static_fields: u8,
    pub failures: Vec<MethodFailure>,
}

impl CompiledUnit {
    /// Entry address of `method`, the offset a manifest exports.
    #[must_use]
    pub fn method_address(&self, method: &str) -> Option<u32> {
        self.methods.get(method).map(|range| range.start)
    }

    pub fn disassemble(&self) -> Result<Vec<Instruction>, DecodeError> {
        disasm::disassemble(&self.script)
    }

    /// Human readable listing of the script.
    pub fn listing(&self) -> Result<String, DecodeError> {
        Ok(disasm::format_listing(&self.disassemble()?))
    }

    /// Serializes the unit to a binary format.
    pub fn dump(&self) -> Result<Vec<u8>, SerializeError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Deserializes a unit produced by [`dump`](Self::dump).
    pub fn load(bytes: &[u8]) -> Result<Self, SerializeError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Compilation context for one contract.
#[derive(Debug)]
pub struct CompilationSession<'a, Tr: CodegenTracer = NoopTracer> {
    generator: CodeGenerator<'a, Tr>,
    failures: Vec<MethodFailure>,
}

impl<'a> CompilationSession<'a> {
    #[must_use]
    pub fn new(symbols: &'a SymbolTable, options: CompilerOptions) -> Self {
        Self::with_tracer(symbols, options, NoopTracer)
    }
}

impl<'a, Tr: CodegenTracer> CompilationSession<'a, Tr> {
    pub fn with_tracer(symbols: &'a SymbolTable, options: CompilerOptions, tracer: Tr) -> Self {
        Self {
            generator: CodeGenerator::with_tracer(symbols, options, tracer),
            failures: Vec::new(),
        }
    }

    /// Direct access to the generator, for emission outside any method body.
    pub fn generator(&mut self) -> &mut CodeGenerator<'a, Tr> {
        &mut self.generator
    }

    #[must_use]
    pub fn failures(&self) -> &[MethodFailure] {
        &self.failures
    }

    /// Drops everything generated so far.
    pub fn reset(&mut self) {
        self.generator.reset();
        self.failures.clear();
    }

    /// Generates the body of `name` with `body`, which calls the `convert_*`
    /// operations in program order.
    ///
    /// On failure everything emitted for the method is rolled back, the failure
    /// is recorded in the unit and the error is returned.
    pub fn generate_method(
        &mut self,
        name: &str,
        body: impl FnOnce(&mut CodeGenerator<'a, Tr>) -> Result<(), CompileError>,
    ) -> Result<(), CompileError> {
        let checkpoint = self.generator.checkpoint();
        let result = self
            .generator
            .convert_begin_method(name)
            .and_then(|()| body(&mut self.generator))
            .and_then(|()| self.generator.convert_end_method());
        if let Err(err) = &result {
            self.generator.rollback(checkpoint);
            self.failures.push(MethodFailure {
                method: name.to_owned(),
                message: err.to_string(),
            });
        }
        result
    }

    /// Generates `_initialize`: stores the literal initializer of every static
    /// global, then runs `body` for the remaining module-level statements.
    pub fn generate_initialize(
        &mut self,
        body: impl FnOnce(&mut CodeGenerator<'a, Tr>) -> Result<(), CompileError>,
    ) -> Result<(), CompileError> {
        self.generate_method(INITIALIZE, |generator| {
            let symbols = generator.symbols();
            let initializers: Vec<_> = generator
                .static_globals()
                .filter_map(|name| {
                    let literal = symbols.globals.get(name)?.literal.as_ref()?;
                    Some((name.to_owned(), literal))
                })
                .collect();
            for (name, literal) in initializers {
                generator.convert_literal(literal)?;
                generator.convert_store_variable(&name)?;
            }
            body(generator)
        })
    }

    /// Links, optimizes and serializes the unit. `_initialize` is generated
    /// first when static fields exist and it was not generated explicitly.
    pub fn finish(self) -> Result<CompiledUnit, CompileError> {
        self.finish_traced().map(|(unit, _)| unit)
    }

    /// Like [`finish`](Self::finish), also handing back the tracer.
    pub fn finish_traced(mut self) -> Result<(CompiledUnit, Tr), CompileError> {
        if self.generator.static_field_count() > 0 && !self.generator.is_generated(INITIALIZE) {
            self.generate_initialize(|_| Ok(()))?;
        }
        let linked = self.generator.finish()?;
        let methods = linked
            .methods
            .into_iter()
            .map(|(name, start, end)| (name, MethodRange { start, end }))
            .collect();
        let unit = CompiledUnit {
            script: linked.script,
            tokens: linked.tokens,
            methods,
            static_fields: linked.static_fields,
            failures: self.failures,
        };
        Ok((unit, self.generator.into_tracer()))
    }
}
