//! Single-pass bytecode compiler.
//!
//! The compiler drives the scanner one token at a time and emits
//! bytecode as it parses; there is no AST. Expressions are parsed with
//! a Pratt precedence climber, nested functions push a fresh
//! `FunctionCompiler` frame, and lexical scope, upvalue capture and
//! loop/break patching are all resolved during the same pass.

use std::mem;
use std::rc::Rc;

use crate::bytecode::chunk::{Chunk, CompiledFunction, Constant};
use crate::bytecode::instruction::{OpCode, UpvalueInfo};
use crate::bytecode::precedence::{get_precedence, Precedence};
use crate::error::{CompileError, Diagnostic, ErrorLocation};
use crate::lexer::{Scanner, Token, TokenKind};

/// Local slots per function, counting the reserved slot 0.
const MAX_LOCALS: usize = 256;
/// Upvalues per function.
const MAX_UPVALUES: usize = 256;
/// Parameters per function (leaves room for the receiver).
const MAX_PARAMS: usize = 255;

/// Compile a source string into the top-level script function.
pub fn compile(source: &str) -> Result<Rc<CompiledFunction>, CompileError> {
    let mut compiler = Compiler::new(source);
    compiler.advance();
    while !compiler.matches(&TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.finish()
}

/// What kind of function body is being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// A local variable in scope.
#[derive(Debug)]
struct Local {
    name: String,
    /// Scope depth, or -1 while the initializer is still running.
    depth: i32,
    /// Whether some closure captures this slot.
    is_captured: bool,
}

/// An enclosing loop, for `break`/`continue`.
#[derive(Debug, Clone, Copy)]
struct LoopContext {
    /// Jump target for `continue` (the increment clause in a `for`).
    start: usize,
    /// Scope depth just outside the loop; locals deeper than this are
    /// discarded before jumping out.
    scope_depth: u32,
}

/// A pending `break` jump, tagged with the loop nesting depth that owns
/// it so nested loops only patch their own breaks.
#[derive(Debug, Clone, Copy)]
struct BreakJump {
    offset: usize,
    loop_depth: usize,
}

/// Per-function compilation state.
#[derive(Debug)]
struct FunctionCompiler {
    function: CompiledFunction,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueInfo>,
    scope_depth: u32,
    loops: Vec<LoopContext>,
    break_jumps: Vec<BreakJump>,
}

impl FunctionCompiler {
    fn new(name: String, kind: FunctionKind) -> Self {
        // Slot 0 belongs to the callee; methods use it for `this`.
        let slot_zero = Local {
            name: match kind {
                FunctionKind::Method | FunctionKind::Initializer => "this".to_string(),
                _ => String::new(),
            },
            depth: 0,
            is_captured: false,
        };
        Self {
            function: CompiledFunction::new(name),
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            break_jumps: Vec::new(),
        }
    }
}

/// Context for class compilation, tracking `this`/`super` validity.
#[derive(Debug)]
struct ClassContext {
    has_superclass: bool,
}

/// The compiler itself: parser state plus a stack of function frames.
pub struct Compiler<'a> {
    scanner: Scanner<'a>,
    previous: Token,
    current: Token,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    /// Function frames; the innermost is last.
    compilers: Vec<FunctionCompiler>,
    /// Enclosing class declarations; independent of the function stack.
    classes: Vec<ClassContext>,
}

impl<'a> Compiler<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            scanner: Scanner::new(source),
            previous: Token::eof(0, 1, 1),
            current: Token::eof(0, 1, 1),
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            compilers: vec![FunctionCompiler::new(String::new(), FunctionKind::Script)],
            classes: Vec::new(),
        }
    }

    fn finish(mut self) -> Result<Rc<CompiledFunction>, CompileError> {
        self.emit_return();
        if self.had_error {
            return Err(CompileError::new(self.diagnostics));
        }
        let frame = self
            .compilers
            .pop()
            .expect("the script frame is never popped early");
        Ok(Rc::new(frame.function))
    }

    // ========== Token plumbing ==========

    fn advance(&mut self) {
        self.previous = mem::replace(&mut self.current, Token::eof(0, 1, 1));
        loop {
            match self.scanner.scan_token() {
                Ok(token) => {
                    self.current = token;
                    break;
                }
                Err(error) => {
                    let line = error.span().line;
                    let message = error.to_string();
                    self.report(line, ErrorLocation::Bare, &message);
                }
            }
        }
    }

    /// Does the current token have this kind? Payloads are ignored.
    fn check(&self, kind: &TokenKind) -> bool {
        mem::discriminant(&self.current.kind) == mem::discriminant(kind)
    }

    fn matches(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            return true;
        }
        false
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    /// Consume an identifier token and return its name; reports an
    /// error and returns an empty name otherwise.
    fn consume_identifier(&mut self, message: &str) -> String {
        if let TokenKind::Identifier(name) = &self.current.kind {
            let name = name.clone();
            self.advance();
            return name;
        }
        self.error_at_current(message);
        String::new()
    }

    /// The lexeme of the identifier just consumed.
    fn previous_identifier(&self) -> String {
        match &self.previous.kind {
            TokenKind::Identifier(name) => name.clone(),
            _ => String::new(),
        }
    }

    // ========== Error reporting ==========

    fn report(&mut self, line: usize, location: ErrorLocation, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.diagnostics.push(Diagnostic {
            line,
            location,
            message: message.to_string(),
        });
    }

    fn error_at(&mut self, token: &Token, message: &str) {
        let location = if token.kind == TokenKind::Eof {
            ErrorLocation::AtEnd
        } else {
            ErrorLocation::At(token.kind.to_string())
        };
        self.report(token.line(), location, message);
    }

    /// Report an error at the token just consumed.
    fn error(&mut self, message: &str) {
        let token = self.previous.clone();
        self.error_at(&token, message);
    }

    /// Report an error at the token about to be consumed.
    fn error_at_current(&mut self, message: &str) {
        let token = self.current.clone();
        self.error_at(&token, message);
    }

    /// Leave panic mode by skipping to a statement boundary.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Switch
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ========== Emission helpers ==========

    fn current(&mut self) -> &mut FunctionCompiler {
        self.compilers
            .last_mut()
            .expect("the compiler stack is never empty")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.current().function.chunk
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line();
        self.chunk().write_op(op, line);
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line();
        self.chunk().write_byte(byte, line);
    }

    /// Emit the instruction that loads `constant`, using the wide
    /// encoding when the pool index needs it.
    fn emit_constant(&mut self, constant: Constant) {
        let line = self.previous.line();
        self.chunk().write_constant(constant, line);
    }

    /// Add a constant whose index must fit one operand byte (names,
    /// function constants for `CLOSURE`).
    fn make_constant(&mut self, constant: Constant) -> u8 {
        let index = self.chunk().add_constant(constant);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    /// Emit a jump with a placeholder offset; returns the offset of the
    /// operand for later patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        let offset = self.chunk().current_offset();
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        offset
    }

    fn patch_jump(&mut self, offset: usize) {
        if !self.chunk().patch_jump(offset) {
            self.error("Too much code to jump over.");
        }
    }

    /// Emit a backward jump to `start`.
    fn emit_loop(&mut self, start: usize) {
        self.emit_op(OpCode::Loop);
        // +2 for the operand of the LOOP instruction itself.
        let distance = self.chunk().current_offset() - start + 2;
        if distance > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte((distance >> 8) as u8);
        self.emit_byte((distance & 0xff) as u8);
    }

    fn emit_return(&mut self) {
        if self.current().kind == FunctionKind::Initializer {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    // ========== Declarations ==========

    fn declaration(&mut self) {
        if self.matches(&TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(&TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(&TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(&TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            &TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        let name = self.previous_identifier();
        // A function may refer to itself; it is initialized as soon as
        // its name is bound.
        self.mark_initialized();
        self.function(name, FunctionKind::Function);
        self.define_variable(global);
    }

    fn class_declaration(&mut self) {
        let name = self.consume_identifier("Expect class name.");
        let name_constant = self.make_constant(Constant::String(name.clone()));
        self.declare_variable(&name);

        self.emit_op(OpCode::Class);
        self.emit_byte(name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassContext {
            has_superclass: false,
        });

        if self.matches(&TokenKind::Less) {
            let superclass = self.consume_identifier("Expect superclass name.");
            self.named_variable(&superclass, false);
            if superclass == name {
                self.error("A class can't inherit from itself.");
            }

            // The superclass value becomes a hidden `super` local in a
            // scope wrapping the method bodies.
            self.begin_scope();
            self.add_local("super".to_string());
            self.define_variable(0);

            self.named_variable(&name, false);
            self.emit_op(OpCode::Inherit);
            self.classes
                .last_mut()
                .expect("class context was just pushed")
                .has_superclass = true;
        }

        self.named_variable(&name, false);
        self.consume(&TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            self.method();
        }
        self.consume(&TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self
            .classes
            .last()
            .expect("class context is still on the stack")
            .has_superclass
        {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        let name = self.consume_identifier("Expect method name.");
        let constant = self.make_constant(Constant::String(name.clone()));
        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(name, kind);
        self.emit_op(OpCode::Method);
        self.emit_byte(constant);
    }

    /// Compile a function body (parameters + block) into a fresh frame
    /// and emit the `CLOSURE` that materializes it at runtime.
    fn function(&mut self, name: String, kind: FunctionKind) {
        self.compilers.push(FunctionCompiler::new(name, kind));
        self.begin_scope();

        self.consume(&TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(&TokenKind::RightParen) {
            loop {
                if self.current().function.arity as usize == MAX_PARAMS {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let frame = self.current();
                frame.function.arity = frame.function.arity.wrapping_add(1);
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(&TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        self.emit_return();
        let frame = self
            .compilers
            .pop()
            .expect("function frame was just pushed");

        let constant = self.make_constant(Constant::Function(Rc::new(frame.function)));
        self.emit_op(OpCode::Closure);
        self.emit_byte(constant);
        for upvalue in &frame.upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    // ========== Variables & scope ==========

    /// Parse a variable name in a declaration; returns the name
    /// constant for globals, 0 for locals.
    fn parse_variable(&mut self, message: &str) -> u8 {
        let name = self.consume_identifier(message);
        self.declare_variable(&name);
        if self.current().scope_depth > 0 {
            return 0;
        }
        self.make_constant(Constant::String(name))
    }

    fn declare_variable(&mut self, name: &str) {
        if self.current().scope_depth == 0 {
            return;
        }

        let mut shadowed = false;
        {
            let frame = self.current();
            for local in frame.locals.iter().rev() {
                if local.depth != -1 && local.depth < frame.scope_depth as i32 {
                    break;
                }
                if local.name == name {
                    shadowed = true;
                    break;
                }
            }
        }
        if shadowed {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name.to_string());
    }

    fn add_local(&mut self, name: String) {
        if self.current().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.current().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let frame = self.current();
        if frame.scope_depth == 0 {
            return;
        }
        let depth = frame.scope_depth as i32;
        if let Some(local) = frame.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.current().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(OpCode::DefineGlobal);
        self.emit_byte(global);
    }

    fn begin_scope(&mut self) {
        self.current().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current().scope_depth -= 1;
        loop {
            let frame = self.current();
            let Some(local) = frame.locals.last() else {
                break;
            };
            if local.depth <= frame.scope_depth as i32 {
                break;
            }
            let captured = local.is_captured;
            self.current().locals.pop();
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    /// Emit pops (or upvalue closes) for every local deeper than
    /// `target_depth` without forgetting them, for `break`/`continue`
    /// jumps that leave the scope early.
    fn discard_locals(&mut self, target_depth: u32) {
        let frame = self.current();
        let captured: Vec<bool> = frame
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > target_depth as i32)
            .map(|local| local.is_captured)
            .collect();
        for is_captured in captured {
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn resolve_local(&mut self, level: usize, name: &str) -> Option<u8> {
        let mut uninitialized = false;
        let mut found = None;
        for (i, local) in self.compilers[level].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    uninitialized = true;
                }
                found = Some(i as u8);
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    /// Resolve `name` as an upvalue of the function at `level`, walking
    /// outward through the enclosing frames and threading a capture
    /// through every function in between.
    fn resolve_upvalue(&mut self, level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return None;
        }

        if let Some(local) = self.resolve_local(level - 1, name) {
            self.compilers[level - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(level, local, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(level - 1, name) {
            return Some(self.add_upvalue(level, upvalue, false));
        }

        None
    }

    fn add_upvalue(&mut self, level: usize, index: u8, is_local: bool) -> u8 {
        let frame = &mut self.compilers[level];
        for (i, upvalue) in frame.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return i as u8;
            }
        }

        if frame.upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }

        frame.upvalues.push(UpvalueInfo::new(is_local, index));
        frame.function.upvalue_count = frame.upvalues.len();
        (frame.upvalues.len() - 1) as u8
    }

    /// Compile a read of (or assignment to) `name`, resolving local,
    /// then upvalue, then global.
    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let top = self.compilers.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(top, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(index) = self.resolve_upvalue(top, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
        } else {
            let constant = self.make_constant(Constant::String(name.to_string()));
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.matches(&TokenKind::Equal) {
            self.expression();
            self.emit_op(set_op);
        } else {
            self.emit_op(get_op);
        }
        self.emit_byte(arg);
    }

    // ========== Statements ==========

    fn statement(&mut self) {
        if self.matches(&TokenKind::Print) {
            self.print_statement();
        } else if self.matches(&TokenKind::If) {
            self.if_statement();
        } else if self.matches(&TokenKind::While) {
            self.while_statement();
        } else if self.matches(&TokenKind::For) {
            self.for_statement();
        } else if self.matches(&TokenKind::Switch) {
            self.switch_statement();
        } else if self.matches(&TokenKind::Return) {
            self.return_statement();
        } else if self.matches(&TokenKind::Break) {
            self.break_statement();
        } else if self.matches(&TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(&TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            self.declaration();
        }
        self.consume(&TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(&TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(&TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    /// Both condition forms compile to the same jump skeleton; `elif`
    /// recurses as the else branch.
    fn if_statement(&mut self) {
        if self.matches(&TokenKind::LeftParen) {
            self.expression();
            self.consume(&TokenKind::RightParen, "Expect ')' after condition.");
            // Tolerate `if (cond) then`, so the two forms compose.
            self.matches(&TokenKind::Then);
        } else {
            self.expression();
            self.consume(&TokenKind::Then, "Expect 'then' after condition.");
        }

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.matches(&TokenKind::Elif) {
            self.if_statement();
        } else if self.matches(&TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().current_offset();
        let scope_depth = self.current().scope_depth;
        self.current().loops.push(LoopContext {
            start: loop_start,
            scope_depth,
        });

        self.consume(&TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(&TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.close_loop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(&TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.matches(&TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(&TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().current_offset();
        let mut exit_jump = None;
        if !self.matches(&TokenKind::Semicolon) {
            self.expression();
            self.consume(&TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(&TokenKind::RightParen) {
            // Jump over the increment; the loop body runs first, then
            // the increment, then the condition again.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().current_offset();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(&TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let scope_depth = self.current().scope_depth;
        self.current().loops.push(LoopContext {
            start: loop_start,
            scope_depth,
        });

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.close_loop();
        self.end_scope();
    }

    /// Patch this loop's pending breaks and drop its context.
    fn close_loop(&mut self) {
        let depth = self.current().loops.len();
        let pending: Vec<usize> = {
            let frame = self.current();
            let pending = frame
                .break_jumps
                .iter()
                .filter(|b| b.loop_depth == depth)
                .map(|b| b.offset)
                .collect();
            frame.break_jumps.retain(|b| b.loop_depth != depth);
            pending
        };
        for offset in pending {
            self.patch_jump(offset);
        }
        self.current().loops.pop();
    }

    fn break_statement(&mut self) {
        let Some(context) = self.current().loops.last().copied() else {
            self.error("Can't use 'break' outside of a loop.");
            self.consume(&TokenKind::Semicolon, "Expect ';' after 'break'.");
            return;
        };

        self.discard_locals(context.scope_depth);
        let offset = self.emit_jump(OpCode::Jump);
        let loop_depth = self.current().loops.len();
        self.current().break_jumps.push(BreakJump { offset, loop_depth });
        self.consume(&TokenKind::Semicolon, "Expect ';' after 'break'.");
    }

    fn continue_statement(&mut self) {
        let Some(context) = self.current().loops.last().copied() else {
            self.error("Can't use 'continue' outside of a loop.");
            self.consume(&TokenKind::Semicolon, "Expect ';' after 'continue'.");
            return;
        };

        self.discard_locals(context.scope_depth);
        self.emit_loop(context.start);
        self.consume(&TokenKind::Semicolon, "Expect ';' after 'continue'.");
    }

    /// The selector stays on the stack while the cases test against it
    /// with DUP/EQUAL. A trailing `fallthrough` jumps into the next
    /// case's body, skipping its test; end-jumps of matched cases land
    /// at the `default` body when there is one, else past the cases.
    fn switch_statement(&mut self) {
        self.consume(&TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(&TokenKind::RightParen, "Expect ')' after value.");
        self.consume(&TokenKind::LeftBrace, "Expect '{' before switch cases.");

        // The selector occupies a stack slot for the whole statement.
        // Track it as a hidden local so a `break` out of an enclosing
        // loop discards it; the empty name can never collide.
        self.begin_scope();
        self.add_local(String::new());
        self.mark_initialized();

        let mut end_jumps = Vec::new();
        let mut pending_fallthrough: Option<usize> = None;

        while self.matches(&TokenKind::Case) {
            self.emit_op(OpCode::Dup);
            self.expression();
            self.consume(&TokenKind::Colon, "Expect ':' after case value.");
            self.emit_op(OpCode::Equal);
            let miss = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop);

            if let Some(offset) = pending_fallthrough.take() {
                self.patch_jump(offset);
            }

            while !self.check(&TokenKind::Case)
                && !self.check(&TokenKind::Default)
                && !self.check(&TokenKind::Fallthrough)
                && !self.check(&TokenKind::RightBrace)
                && !self.check(&TokenKind::Eof)
            {
                self.statement();
            }

            if self.matches(&TokenKind::Fallthrough) {
                pending_fallthrough = Some(self.emit_jump(OpCode::Jump));
            } else {
                end_jumps.push(self.emit_jump(OpCode::Jump));
            }

            self.patch_jump(miss);
            self.emit_op(OpCode::Pop);
        }

        if self.matches(&TokenKind::Default) {
            self.consume(&TokenKind::Colon, "Expect ':' after 'default'.");
            if let Some(offset) = pending_fallthrough.take() {
                self.patch_jump(offset);
            }
            for offset in end_jumps.drain(..) {
                self.patch_jump(offset);
            }
            while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
                self.statement();
            }
        }

        self.consume(&TokenKind::RightBrace, "Expect '}' after switch cases.");
        if let Some(offset) = pending_fallthrough {
            self.patch_jump(offset);
        }
        for offset in end_jumps {
            self.patch_jump(offset);
        }
        // Pops the selector.
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.current().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.matches(&TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(&TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    // ========== Expressions ==========

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix_rule(can_assign) {
            self.error("Expect expression.");
            return;
        }

        while precedence <= get_precedence(&self.current.kind) {
            self.advance();
            self.infix_rule(can_assign);
        }

        if can_assign && self.matches(&TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    /// Dispatch on the token just consumed as the start of an
    /// expression. Returns false when it has no prefix rule.
    fn prefix_rule(&mut self, can_assign: bool) -> bool {
        match self.previous.kind.clone() {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::NumberLiteral(value) => self.emit_constant(Constant::Number(value)),
            TokenKind::StringLiteral(text) => self.emit_constant(Constant::String(text)),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Identifier(name) => self.named_variable(&name, can_assign),
            TokenKind::This => self.this_expression(),
            TokenKind::Super => self.super_expression(),
            _ => return false,
        }
        true
    }

    /// Dispatch on the token just consumed as an infix operator.
    fn infix_rule(&mut self, can_assign: bool) {
        match self.previous.kind {
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::Percent
            | TokenKind::BangEqual
            | TokenKind::EqualEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => self.binary(),
            TokenKind::And => self.and_expression(),
            TokenKind::Or => self.or_expression(),
            TokenKind::Question => self.ternary(),
            TokenKind::LeftParen => self.call(),
            TokenKind::Dot => self.dot(can_assign),
            _ => unreachable!("token has no infix rule despite its precedence"),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(&TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let operator = self.previous.kind.clone();
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!("unary dispatch is exhaustive"),
        }
    }

    fn binary(&mut self) {
        let operator = self.previous.kind.clone();
        self.parse_precedence(get_precedence(&operator).next());
        match operator {
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Percent => self.emit_op(OpCode::Modulo),
            _ => unreachable!("binary dispatch is exhaustive"),
        }
    }

    fn and_expression(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expression(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    /// `c ? t : e`; right-associative through the else branch.
    fn ternary(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Assignment);
        self.consume(&TokenKind::Colon, "Expect ':' in conditional expression.");

        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Ternary);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        let name = self.consume_identifier("Expect property name after '.'.");
        let constant = self.make_constant(Constant::String(name));

        if can_assign && self.matches(&TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
            self.emit_byte(constant);
        } else if self.matches(&TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_byte(constant);
            self.emit_byte(arg_count);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_byte(constant);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(&TokenKind::RightParen) {
            loop {
                self.expression();
                if count == MAX_PARAMS {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(MAX_PARAMS) as u8
    }

    fn this_expression(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_expression(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self
            .classes
            .last()
            .expect("class stack is non-empty")
            .has_superclass
        {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(&TokenKind::Dot, "Expect '.' after 'super'.");
        let name = self.consume_identifier("Expect superclass method name.");
        let constant = self.make_constant(Constant::String(name));

        self.named_variable("this", false);
        if self.matches(&TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_op(OpCode::SuperInvoke);
            self.emit_byte(constant);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_op(OpCode::GetSuper);
            self.emit_byte(constant);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> Rc<CompiledFunction> {
        compile(source).expect("compilation failed")
    }

    fn compile_err(source: &str) -> CompileError {
        compile(source).expect_err("compilation unexpectedly succeeded")
    }

    #[test]
    fn test_expression_statement_bytecode() {
        let script = compile_ok("1 + 2;");
        let code = &script.chunk.code;
        assert_eq!(
            code,
            &vec![
                OpCode::Constant as u8,
                0,
                OpCode::Constant as u8,
                1,
                OpCode::Add as u8,
                OpCode::Pop as u8,
                OpCode::Nil as u8,
                OpCode::Return as u8,
            ]
        );
    }

    #[test]
    fn test_comparison_desugaring() {
        let script = compile_ok("1 >= 2;");
        let code = &script.chunk.code;
        assert_eq!(code[4], OpCode::Less as u8);
        assert_eq!(code[5], OpCode::Not as u8);
    }

    #[test]
    fn test_global_and_local() {
        compile_ok("var a = 1; { var b = a; print b; }");
    }

    #[test]
    fn test_reading_local_in_own_initializer_fails() {
        let error = compile_err("{ var a = a; }");
        assert!(error
            .to_string()
            .contains("Can't read local variable in its own initializer."));
    }

    #[test]
    fn test_shadowing_in_same_scope_fails() {
        let error = compile_err("{ var a = 1; var a = 2; }");
        assert!(error
            .to_string()
            .contains("Already a variable with this name in this scope."));
        // Shadowing across scopes is allowed.
        compile_ok("{ var a = 1; { var a = 2; } }");
    }

    #[test]
    fn test_invalid_assignment_target() {
        let error = compile_err("1 + 2 = 3;");
        assert!(error.to_string().contains("Invalid assignment target."));
    }

    #[test]
    fn test_expect_expression_diagnostic_format() {
        let error = compile_err("print ;");
        assert_eq!(error.to_string(), "[line 1] Error at ';': Expect expression.");
    }

    #[test]
    fn test_return_outside_function_fails() {
        let error = compile_err("return 1;");
        assert!(error
            .to_string()
            .contains("Can't return from top-level code."));
    }

    #[test]
    fn test_initializer_cannot_return_value() {
        let error = compile_err("class A { init() { return 1; } }");
        assert!(error
            .to_string()
            .contains("Can't return a value from an initializer."));
        // A bare return is allowed.
        compile_ok("class A { init() { return; } }");
    }

    #[test]
    fn test_this_and_super_outside_class_fail() {
        assert!(compile_err("print this;")
            .to_string()
            .contains("Can't use 'this' outside of a class."));
        assert!(compile_err("fun f() { return super.x; }")
            .to_string()
            .contains("Can't use 'super' outside of a class."));
        assert!(compile_err("class A { m() { return super.m(); } }")
            .to_string()
            .contains("Can't use 'super' in a class with no superclass."));
    }

    #[test]
    fn test_break_and_continue_require_a_loop() {
        assert!(compile_err("break;")
            .to_string()
            .contains("Can't use 'break' outside of a loop."));
        assert!(compile_err("continue;")
            .to_string()
            .contains("Can't use 'continue' outside of a loop."));
        compile_ok("while (true) { break; }");
        compile_ok("for (var i = 0; i < 3; i = i + 1) { continue; }");
    }

    #[test]
    fn test_both_if_forms() {
        compile_ok("if (true) print 1; else print 2;");
        compile_ok("if true then print 1; elif false then print 2; else print 3;");
        compile_ok("if (true) then print 1;");
    }

    #[test]
    fn test_switch_parses() {
        compile_ok(
            "switch (1) { case 1: print 1; fallthrough case 2: print 2; default: print 3; }",
        );
        compile_ok("switch (1) { }");
        compile_ok("switch (1) { default: print 0; }");
    }

    #[test]
    fn test_too_many_locals() {
        // 255 locals fit beside the reserved slot; one more overflows.
        let mut ok = String::from("{");
        for i in 0..255 {
            ok.push_str(&format!("var l{} = 0;", i));
        }
        ok.push('}');
        compile_ok(&ok);

        let mut overflow = String::from("{");
        for i in 0..256 {
            overflow.push_str(&format!("var l{} = 0;", i));
        }
        overflow.push('}');
        assert!(compile_err(&overflow)
            .to_string()
            .contains("Too many local variables in function."));
    }

    #[test]
    fn test_too_many_parameters() {
        let params: Vec<String> = (0..256).map(|i| format!("p{}", i)).collect();
        let source = format!("fun f({}) {{ }}", params.join(", "));
        assert!(compile_err(&source)
            .to_string()
            .contains("Can't have more than 255 parameters."));

        let params: Vec<String> = (0..255).map(|i| format!("p{}", i)).collect();
        let source = format!("fun f({}) {{ }}", params.join(", "));
        compile_ok(&source);
    }

    #[test]
    fn test_long_constant_emission() {
        // 300 distinct number literals push the pool past one byte.
        let body: Vec<String> = (0..300).map(|i| format!("{}.5;", i)).collect();
        let script = compile_ok(&body.join("\n"));

        // Walk the instruction stream; the loads for indices past 255
        // must use the wide encoding.
        let code = &script.chunk.code;
        let mut offset = 0;
        let mut wide_loads = 0;
        while offset < code.len() {
            let op = OpCode::from_u8(code[offset]).expect("valid opcode");
            if op == OpCode::ConstantLong {
                wide_loads += 1;
                assert!(script.chunk.read_u24(offset + 1) > u8::MAX as usize);
            }
            offset += 1 + op.operand_size();
        }
        assert_eq!(wide_loads, 300 - 256);
    }

    #[test]
    fn test_closure_upvalue_counts() {
        let script = compile_ok(
            "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
        );
        let outer = script
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) if f.name == "outer" => Some(f.clone()),
                _ => None,
            })
            .expect("outer function constant");
        let inner = outer
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) if f.name == "inner" => Some(f.clone()),
                _ => None,
            })
            .expect("inner function constant");
        assert_eq!(inner.upvalue_count, 1);
        assert_eq!(outer.upvalue_count, 0);
    }

    #[test]
    fn test_jump_distance_overflow() {
        // A then-branch bigger than a 16-bit jump can span. Each `1;`
        // statement costs three bytes.
        let mut body = String::from("if (true) then {");
        for _ in 0..22000 {
            body.push_str("1;");
        }
        body.push('}');
        assert!(compile_err(&body)
            .to_string()
            .contains("Too much code to jump over."));
    }

    #[test]
    fn test_compiling_twice_is_deterministic() {
        let source = "
            fun greet(name) { return \"hi \" + name; }
            class A { init() { this.x = 1; } }
            for (var i = 0; i < 3; i = i + 1) { print greet(\"x\"); }
        ";
        let first = compile_ok(source);
        let second = compile_ok(source);
        assert_eq!(first.chunk.code, second.chunk.code);
    }

    #[test]
    fn test_panic_mode_collects_multiple_errors() {
        let error = compile_err("var 1; var 2;");
        assert_eq!(error.diagnostics.len(), 2);
    }

    #[test]
    fn test_line_numbers_in_chunk() {
        let script = compile_ok("1;\n2;\n");
        assert_eq!(script.chunk.get_line(0), 1);
        let last = script.chunk.code.len() - 1;
        assert_eq!(script.chunk.get_line(last), 2);
    }
}
