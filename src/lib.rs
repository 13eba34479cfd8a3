//! Opal: a small dynamically-typed scripting language with first-class
//! functions, closures, classes and a bytecode virtual machine.
//!
//! Source text goes through a single-pass compiler straight to
//! bytecode; the VM executes it against a managed heap with a precise
//! mark-sweep garbage collector.

pub mod bytecode;
pub mod error;
pub mod lexer;
pub mod repl;
pub mod span;

use std::path::Path;

use error::OpalError;

pub use bytecode::vm::VM;

/// Compile and run a source string on a fresh VM.
pub fn interpret(source: &str) -> Result<(), OpalError> {
    run_with_options(source, false)
}

/// Compile and run, optionally printing the disassembly first.
pub fn run_with_options(source: &str, disassemble: bool) -> Result<(), OpalError> {
    let function = bytecode::compiler::compile(source)?;

    if disassemble {
        print!("{}", bytecode::disassembler::disassemble_function(&function));
        println!("---");
    }

    let mut vm = VM::new();
    vm.run(function)?;
    Ok(())
}

/// Run a script file.
pub fn interpret_file(path: &Path, disassemble: bool) -> Result<(), OpalError> {
    let source = std::fs::read_to_string(path)?;
    run_with_options(&source, disassemble)
}

/// Compile without executing; used by tooling and tests.
pub fn compile(source: &str) -> Result<std::rc::Rc<bytecode::CompiledFunction>, OpalError> {
    Ok(bytecode::compiler::compile(source)?)
}
