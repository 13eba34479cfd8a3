//! Bytecode disassembler for debugging.

use std::fmt::Write;

use crate::bytecode::chunk::{Chunk, CompiledFunction, Constant};
use crate::bytecode::instruction::OpCode;

/// Disassemble a compiled function into human-readable output,
/// recursing into nested function constants.
pub fn disassemble_function(function: &CompiledFunction) -> String {
    let mut output = String::new();

    writeln!(
        &mut output,
        "== {} (arity: {}) ==",
        if function.name.is_empty() {
            "<script>"
        } else {
            &function.name
        },
        function.arity
    )
    .unwrap();

    disassemble_chunk(&function.chunk, &mut output);

    for constant in &function.chunk.constants {
        if let Constant::Function(nested) = constant {
            writeln!(&mut output).unwrap();
            output.push_str(&disassemble_function(nested));
        }
    }

    output
}

/// Disassemble a whole chunk into `output`.
pub fn disassemble_chunk(chunk: &Chunk, output: &mut String) {
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, output);
    }
}

/// Disassemble the instruction at `offset`; returns the offset of the
/// next instruction.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, output: &mut String) -> usize {
    write!(output, "{:04} ", offset).unwrap();

    let line = chunk.get_line(offset);
    if offset > 0 && line == chunk.get_line(offset - 1) {
        write!(output, "   | ").unwrap();
    } else {
        write!(output, "{:4} ", line).unwrap();
    }

    let byte = chunk.code[offset];
    let opcode = match OpCode::from_u8(byte) {
        Some(op) => op,
        None => {
            writeln!(output, "Unknown opcode {}", byte).unwrap();
            return offset + 1;
        }
    };

    match opcode {
        OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Dup
        | OpCode::Pop
        | OpCode::CloseUpvalue
        | OpCode::Equal
        | OpCode::Greater
        | OpCode::Less
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Modulo
        | OpCode::Not
        | OpCode::Negate
        | OpCode::Print
        | OpCode::Return
        | OpCode::Inherit => {
            writeln!(output, "{:?}", opcode).unwrap();
            offset + 1
        }

        // Slot, upvalue index or argument count.
        OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue | OpCode::SetUpvalue
        | OpCode::Call => {
            let operand = chunk.code[offset + 1];
            writeln!(output, "{:?} {}", opcode, operand).unwrap();
            offset + 2
        }

        // One-byte constant index.
        OpCode::Constant
        | OpCode::DefineGlobal
        | OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::Class
        | OpCode::Method
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper => {
            let index = chunk.code[offset + 1] as usize;
            writeln!(
                output,
                "{:?} {} ({})",
                opcode, index, chunk.constants[index]
            )
            .unwrap();
            offset + 2
        }

        OpCode::ConstantLong => {
            let index = chunk.read_u24(offset + 1);
            writeln!(
                output,
                "{:?} {} ({})",
                opcode, index, chunk.constants[index]
            )
            .unwrap();
            offset + 4
        }

        OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
            let distance = chunk.read_u16(offset + 1) as usize;
            writeln!(
                output,
                "{:?} {} -> {}",
                opcode,
                offset,
                offset + 3 + distance
            )
            .unwrap();
            offset + 3
        }

        OpCode::Loop => {
            let distance = chunk.read_u16(offset + 1) as usize;
            writeln!(
                output,
                "{:?} {} -> {}",
                opcode,
                offset,
                offset + 3 - distance
            )
            .unwrap();
            offset + 3
        }

        OpCode::Invoke | OpCode::SuperInvoke => {
            let index = chunk.code[offset + 1] as usize;
            let arg_count = chunk.code[offset + 2];
            writeln!(
                output,
                "{:?} ({} args) {} ({})",
                opcode, arg_count, index, chunk.constants[index]
            )
            .unwrap();
            offset + 3
        }

        OpCode::Closure => {
            let index = chunk.code[offset + 1] as usize;
            writeln!(
                output,
                "{:?} {} ({})",
                opcode, index, chunk.constants[index]
            )
            .unwrap();

            // The upvalue descriptor pairs follow the constant index.
            let upvalue_count = match &chunk.constants[index] {
                Constant::Function(function) => function.upvalue_count,
                _ => 0,
            };
            let mut next = offset + 2;
            for _ in 0..upvalue_count {
                let is_local = chunk.code[next] == 1;
                let capture = chunk.code[next + 1];
                writeln!(
                    output,
                    "{:04}    |                     {} {}",
                    next,
                    if is_local { "local" } else { "upvalue" },
                    capture
                )
                .unwrap();
                next += 2;
            }
            next
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compiler::compile;

    #[test]
    fn test_disassembles_simple_script() {
        let script = compile("print 1 + 2;").expect("compile failed");
        let output = disassemble_function(&script);
        assert!(output.contains("== <script> (arity: 0) =="));
        assert!(output.contains("Add"));
        assert!(output.contains("Print"));
        assert!(output.contains("Return"));
    }

    #[test]
    fn test_closure_listing_includes_captures() {
        let script = compile("fun outer() { var x = 1; fun inner() { return x; } return inner; }")
            .expect("compile failed");
        let output = disassemble_function(&script);
        assert!(output.contains("Closure"));
        assert!(output.contains("local 1"));
    }

    #[test]
    fn test_repeated_lines_collapse() {
        let script = compile("1;\n2; 3;").expect("compile failed");
        let output = disassemble_function(&script);
        assert!(output.contains("   | "));
    }
}
