//! Single-pass compiler: source text straight to bytecode.
//!
//! A Pratt parser drives a bytecode emitter; there is no AST (patterns are
//! the one exception, parsed into a small tree because their tests and binds
//! are emitted in two passes). Local variables live in consecutive stack
//! slots resolved through a lexical scope stack; free variables of nested
//! functions become upvalues; everything else is a global resolved by name
//! at runtime.
//!
//! On a syntax error the compiler records a diagnostic, resynchronizes to
//! the next statement boundary, and keeps parsing, so one run reports as
//! many errors as possible. A compile with any diagnostic never produces a
//! runnable [`Program`].

use ahash::AHashMap;

use super::{
    builder::{CodeBuilder, JumpLabel},
    code::{Const, FuncId, FunctionProto, Program},
    op::Opcode,
};
use crate::{
    error::{Diagnostic, DiagnosticKind},
    lexer::Lexer,
    token::{Token, TokenKind},
};

/// Most locals a single function may declare (including hidden loop slots).
const MAX_LOCALS: usize = 1024;

/// Most upvalues a single function may capture; bounded by the u8 operand.
const MAX_UPVALUES: usize = 255;

/// Compiles a source file into a [`Program`].
///
/// `name` labels the implicit top-level function in call traces.
pub(crate) fn compile(source: &str, name: &str) -> Result<Program, Vec<Diagnostic>> {
    let mut compiler = Compiler::new(source, name);
    compiler.advance();
    while !compiler.check(&TokenKind::Eof) {
        let before = compiler.tokens_consumed;
        compiler.declaration();
        if compiler.tokens_consumed == before {
            // A stray block terminator at top level would otherwise stall
            // the loop: error recovery stops at block boundaries.
            compiler.error_at_current(DiagnosticKind::UnexpectedToken, "unexpected token at top level");
            compiler.advance();
            compiler.panic_mode = false;
        }
    }
    compiler.finish_script()
}

/// Expression precedence, low to high. Assignment is right-associative; all
/// binary operators are left-associative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Range,
    Term,
    Factor,
    Unary,
    Call,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Range,
            Self::Range => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary | Self::Call => Self::Call,
        }
    }
}

/// Infix binding power of a token, if it can appear in infix position.
fn infix_precedence(kind: &TokenKind) -> Precedence {
    match kind {
        TokenKind::Or => Precedence::Or,
        TokenKind::And => Precedence::And,
        TokenKind::EqEq | TokenKind::BangEq => Precedence::Equality,
        TokenKind::Less | TokenKind::LessEq | TokenKind::Greater | TokenKind::GreaterEq => Precedence::Comparison,
        TokenKind::DotDot => Precedence::Range,
        TokenKind::Plus | TokenKind::Minus => Precedence::Term,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => Precedence::Factor,
        TokenKind::LParen | TokenKind::LBracket | TokenKind::Dot => Precedence::Call,
        _ => Precedence::None,
    }
}

/// Whether a token can begin an expression (decides `return` vs `return expr`).
fn starts_expression(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Int(_)
            | TokenKind::Float(_)
            | TokenKind::Str(_)
            | TokenKind::Ident(_)
            | TokenKind::True
            | TokenKind::False
            | TokenKind::Nil
            | TokenKind::LParen
            | TokenKind::LBracket
            | TokenKind::LBrace
            | TokenKind::Minus
            | TokenKind::Not
            | TokenKind::Fn
    )
}

/// What kind of function body is being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FuncKind {
    /// The implicit top-level script.
    Script,
    Function,
}

/// A local variable slot.
#[derive(Debug)]
struct Local {
    name: Box<str>,
    depth: u32,
    is_const: bool,
    /// Set when a nested function captures this local; scope exit then
    /// closes the upvalue instead of popping.
    captured: bool,
}

/// Per-function compilation state, stacked for nested function bodies.
#[derive(Debug)]
struct FunctionCtx {
    enclosing: Option<Box<FunctionCtx>>,
    builder: CodeBuilder,
    /// Reserved slot in the program's prototype table.
    proto_index: usize,
    name: Box<str>,
    arity: u8,
    kind: FuncKind,
    /// Slot 0 is the callee and stays unnamed.
    locals: Vec<Local>,
    scope_depth: u32,
    /// Upvalue descriptors in capture order: `(is_local, index)`.
    upvalues: Vec<(bool, u8)>,
}

impl FunctionCtx {
    fn new(proto_index: usize, name: Box<str>, kind: FuncKind) -> Self {
        let base_depth = if kind == FuncKind::Script { 0 } else { 1 };
        Self {
            enclosing: None,
            builder: CodeBuilder::new(),
            proto_index,
            name,
            arity: 0,
            kind,
            locals: vec![Local {
                name: "".into(),
                depth: base_depth,
                is_const: false,
                captured: false,
            }],
            scope_depth: base_depth,
            upvalues: Vec::new(),
        }
    }
}

/// A parsed `match` pattern.
///
/// The only tree the compiler builds: tests and binds walk it in two
/// separate passes so a failing test never leaves half-bound locals behind.
#[derive(Debug)]
enum Pattern {
    Int(i64),
    Float(f64),
    Str(Box<str>),
    Bool(bool),
    Nil,
    Bind(Box<str>),
    Wildcard,
    Array(Vec<Pattern>),
}

struct Compiler<'src> {
    lexer: Lexer<'src>,
    previous: Token,
    current: Token,
    tokens_consumed: usize,
    diagnostics: Vec<Diagnostic>,
    panic_mode: bool,
    func: Box<FunctionCtx>,
    /// Prototype slots, reserved at function start and filled at finish so
    /// ids are stable while bodies are still being compiled.
    protos: Vec<Option<FunctionProto>>,
    /// Global/member name table shared by the whole program.
    names: Vec<Box<str>>,
    name_indices: AHashMap<Box<str>, u16>,
    /// Name-table indices of globals declared `const`.
    const_globals: Vec<bool>,
}

impl<'src> Compiler<'src> {
    fn new(source: &'src str, script_name: &str) -> Self {
        Self {
            lexer: Lexer::new(source),
            previous: Token::eof(),
            current: Token::eof(),
            tokens_consumed: 0,
            diagnostics: Vec::new(),
            panic_mode: false,
            func: Box::new(FunctionCtx::new(0, script_name.into(), FuncKind::Script)),
            protos: vec![None],
            names: Vec::new(),
            name_indices: AHashMap::new(),
            const_globals: Vec::new(),
        }
    }

    fn finish_script(mut self) -> Result<Program, Vec<Diagnostic>> {
        self.func.builder.emit(Opcode::Halt);
        let ctx = *self.func;
        debug_assert!(ctx.enclosing.is_none(), "unbalanced function contexts");
        self.protos[ctx.proto_index] = Some(FunctionProto {
            name: ctx.name,
            arity: 0,
            upvalue_count: 0,
            code: ctx.builder.build(),
        });
        if self.diagnostics.is_empty() {
            Ok(Program {
                protos: self.protos.into_iter().map(|p| p.expect("unfinished prototype")).collect(),
                names: self.names,
            })
        } else {
            Err(self.diagnostics)
        }
    }

    // ========================================================================
    // Token plumbing
    // ========================================================================

    fn advance(&mut self) {
        self.previous = std::mem::replace(&mut self.current, Token::eof());
        self.tokens_consumed += 1;
        loop {
            let token = self.lexer.next_token();
            if let TokenKind::Error(kind, message) = token.kind {
                let message = message.into_string();
                self.error_at(kind, token.line, token.column, message);
            } else {
                self.current = token;
                break;
            }
        }
        self.func.builder.set_line(self.previous.line.max(1));
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current.kind) == std::mem::discriminant(kind)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(DiagnosticKind::UnexpectedToken, message);
        }
    }

    /// Consumes an identifier and returns its spelling, or `None` after
    /// reporting a diagnostic.
    fn consume_ident(&mut self, message: &str) -> Option<Box<str>> {
        if let TokenKind::Ident(_) = &self.current.kind {
            self.advance();
            let TokenKind::Ident(name) = &self.previous.kind else {
                unreachable!("checked above");
            };
            Some(name.clone())
        } else {
            self.error_at_current(DiagnosticKind::UnexpectedToken, message);
            None
        }
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    fn error_at_current(&mut self, kind: DiagnosticKind, message: impl Into<String>) {
        let (line, column) = (self.current.line, self.current.column);
        self.error_at(kind, line, column, message);
    }

    fn error_at_previous(&mut self, kind: DiagnosticKind, message: impl Into<String>) {
        let (line, column) = (self.previous.line, self.previous.column);
        self.error_at(kind, line, column, message);
    }

    fn error_at(&mut self, kind: DiagnosticKind, line: u32, column: u32, message: impl Into<String>) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.diagnostics.push(Diagnostic::new(kind, line, column, message));
    }

    /// Skips tokens until the next plausible statement boundary.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(&TokenKind::Eof) {
            if self.current.kind.starts_statement() || self.current.kind.ends_block() {
                return;
            }
            self.advance();
        }
    }

    // ========================================================================
    // Names, constants, scopes
    // ========================================================================

    /// Interns a name into the program-wide name table.
    fn name_index(&mut self, name: &str) -> u16 {
        if let Some(&index) = self.name_indices.get(name) {
            return index;
        }
        let Ok(index) = u16::try_from(self.names.len()) else {
            self.error_at_previous(DiagnosticKind::TooManyConstants, "too many distinct names in program");
            return 0;
        };
        self.names.push(name.into());
        self.name_indices.insert(name.into(), index);
        self.const_globals.push(false);
        index
    }

    fn make_const(&mut self, value: Const) -> u16 {
        match self.func.builder.add_const(value) {
            Some(index) => index,
            None => {
                self.error_at_previous(DiagnosticKind::TooManyConstants, "too many constants in one function");
                0
            }
        }
    }

    fn emit_const(&mut self, value: Const) {
        let index = self.make_const(value);
        self.func.builder.emit_u16(Opcode::LoadConst, index);
    }

    /// Emits an integer push, using the short form when it fits.
    fn emit_int(&mut self, value: i64) {
        if let Ok(small) = i8::try_from(value) {
            self.func.builder.emit_i8(Opcode::LoadSmallInt, small);
        } else {
            self.emit_const(Const::Int(value));
        }
    }

    fn begin_scope(&mut self) {
        self.func.scope_depth += 1;
    }

    /// Ends the innermost scope, popping (or closing) its locals.
    fn end_scope(&mut self) {
        self.func.scope_depth -= 1;
        while let Some(local) = self.func.locals.last() {
            if local.depth <= self.func.scope_depth {
                break;
            }
            if local.captured {
                self.func.builder.emit(Opcode::CloseUpvalue);
            } else {
                self.func.builder.emit(Opcode::Pop);
            }
            self.func.locals.pop();
        }
    }

    /// Emits the pop/close sequence for the innermost scope without touching
    /// the compile-time local list.
    ///
    /// Used for the secondary exits of a `match` case, which leave the same
    /// runtime state as the primary exit but from a different code path.
    fn emit_scope_pops(&mut self) {
        let depth = self.func.scope_depth;
        for index in (0..self.func.locals.len()).rev() {
            if self.func.locals[index].depth < depth {
                break;
            }
            if self.func.locals[index].captured {
                self.func.builder.emit(Opcode::CloseUpvalue);
            } else {
                self.func.builder.emit(Opcode::Pop);
            }
        }
    }

    /// Discards the innermost scope's locals from the compile-time list
    /// without emitting anything.
    fn truncate_scope(&mut self) {
        self.func.scope_depth -= 1;
        while let Some(local) = self.func.locals.last() {
            if local.depth <= self.func.scope_depth {
                break;
            }
            self.func.locals.pop();
        }
    }

    /// Declares a local whose value is already on the stack top.
    ///
    /// The new slot index equals the value's stack position, which is what
    /// makes locals-as-stack-slots work: the compiler and the VM agree on
    /// layout by construction.
    fn add_local(&mut self, name: Box<str>, is_const: bool) {
        if self.func.locals.len() >= MAX_LOCALS {
            self.error_at_previous(DiagnosticKind::TooManyLocals, "too many local variables in function");
            return;
        }
        let depth = self.func.scope_depth;
        self.func.locals.push(Local {
            name,
            depth,
            is_const,
            captured: false,
        });
    }

    /// Resolves a name against the current function's locals.
    fn resolve_local(&self, name: &str) -> Option<(u16, bool)> {
        find_local(&self.func, name)
    }

    /// Resolves a name as an upvalue, creating intermediate captures in
    /// every enclosing function on the way out.
    fn resolve_upvalue(&mut self, name: &str) -> Option<(u8, bool)> {
        match resolve_upvalue(&mut self.func, name) {
            Ok(found) => found,
            Err(()) => {
                self.error_at_previous(DiagnosticKind::TooManyUpvalues, "too many captured variables in function");
                Some((0, false))
            }
        }
    }

    // ========================================================================
    // Declarations and statements
    // ========================================================================

    fn declaration(&mut self) {
        match self.current.kind {
            TokenKind::Let => {
                self.advance();
                self.let_declaration(false);
            }
            TokenKind::Const => {
                self.advance();
                self.let_declaration(true);
            }
            TokenKind::Fn => {
                self.advance();
                self.fn_declaration();
            }
            _ => self.statement(),
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        match self.current.kind {
            TokenKind::If => {
                self.advance();
                self.if_statement();
            }
            TokenKind::While => {
                self.advance();
                self.while_statement();
            }
            TokenKind::For => {
                self.advance();
                self.for_statement();
            }
            TokenKind::Match => {
                self.advance();
                self.match_statement();
            }
            TokenKind::Return => {
                self.advance();
                self.return_statement();
            }
            _ => {
                self.expression();
                self.func.builder.emit(Opcode::Pop);
            }
        }
    }

    /// Parses statements until a block terminator (`end`, `elif`, `else`,
    /// `case`, or EOF). The terminator is left for the caller.
    fn block(&mut self) {
        while !self.current.kind.ends_block() {
            self.declaration();
        }
    }

    /// A block body in its own lexical scope, so `let` bindings inside it
    /// are popped (or closed) when the block ends.
    fn scoped_block(&mut self) {
        self.begin_scope();
        self.block();
        self.end_scope();
    }

    fn let_declaration(&mut self, is_const: bool) {
        let keyword = if is_const { "const" } else { "let" };
        let Some(name) = self.consume_ident(&format!("expected variable name after '{keyword}'")) else {
            return;
        };

        if self.match_token(&TokenKind::Eq) {
            self.expression();
        } else if is_const {
            self.error_at_previous(
                DiagnosticKind::UndefinedConstInit,
                format!("const '{name}' must be initialized"),
            );
            self.func.builder.emit(Opcode::LoadNil);
        } else {
            self.func.builder.emit(Opcode::LoadNil);
        }

        if self.func.kind == FuncKind::Script && self.func.scope_depth == 0 {
            let index = self.name_index(&name);
            self.const_globals[index as usize] = is_const;
            self.func.builder.emit_u16(Opcode::DefineGlobal, index);
        } else {
            self.add_local(name, is_const);
        }
    }

    fn fn_declaration(&mut self) {
        let Some(name) = self.consume_ident("expected function name after 'fn'") else {
            return;
        };

        if self.func.kind == FuncKind::Script && self.func.scope_depth == 0 {
            let index = self.name_index(&name);
            self.function_body(name);
            self.func.builder.emit_u16(Opcode::DefineGlobal, index);
        } else {
            // Declare the name before the body so the function can call
            // itself through its own slot.
            self.add_local(name.clone(), false);
            let slot = self.func.locals.len() - 1;
            self.function_body(name);
            // The closure value lands exactly in the reserved slot.
            debug_assert_eq!(slot, self.func.locals.len() - 1);
        }
    }

    /// Compiles a function body (parameters through `end` / `-> expr`) and
    /// emits the instruction that produces the function value.
    fn function_body(&mut self, name: Box<str>) {
        let proto_index = self.protos.len();
        self.protos.push(None);

        let ctx = FunctionCtx::new(proto_index, name, FuncKind::Function);
        let enclosing = std::mem::replace(&mut self.func, Box::new(ctx));
        self.func.enclosing = Some(enclosing);
        self.func.builder.set_line(self.previous.line.max(1));

        self.consume(&TokenKind::LParen, "expected '(' after function name");
        if !self.check(&TokenKind::RParen) {
            loop {
                if let Some(param) = self.consume_ident("expected parameter name") {
                    if self.func.locals.iter().any(|l| l.name == param) {
                        self.error_at_previous(
                            DiagnosticKind::DuplicateLocal,
                            format!("duplicate parameter '{param}'"),
                        );
                    }
                    if self.func.arity == u8::MAX {
                        self.error_at_previous(DiagnosticKind::TooManyArguments, "more than 255 parameters");
                    } else {
                        self.func.arity += 1;
                        self.add_local(param, false);
                    }
                }
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RParen, "expected ')' after parameters");

        if self.match_token(&TokenKind::Arrow) {
            // Short body: `fn f(x) -> expr` returns the expression.
            self.expression();
            self.func.builder.emit(Opcode::Return);
        } else {
            self.block();
            self.consume(&TokenKind::End, "expected 'end' after function body");
            self.func.builder.emit(Opcode::LoadNil);
            self.func.builder.emit(Opcode::Return);
        }

        let enclosing = self.func.enclosing.take().expect("function context missing parent");
        let finished = std::mem::replace(&mut self.func, enclosing);
        let upvalues = finished.upvalues;
        let upvalue_count = upvalues.len();
        self.protos[finished.proto_index] = Some(FunctionProto {
            name: finished.name,
            arity: finished.arity,
            upvalue_count: u8::try_from(upvalue_count).expect("upvalue count bounded by MAX_UPVALUES"),
            code: finished.builder.build(),
        });

        let func_id = FuncId(u32::try_from(finished.proto_index).expect("prototype count exceeds u32"));
        let const_index = self.make_const(Const::Func(func_id));
        if upvalue_count == 0 {
            // No captures: the function is a plain immediate value and needs
            // no heap allocation.
            self.func.builder.emit_u16(Opcode::LoadConst, const_index);
        } else {
            self.func.builder.emit_closure(const_index, &upvalues);
        }
    }

    fn return_statement(&mut self) {
        if self.func.kind == FuncKind::Script {
            self.error_at_previous(DiagnosticKind::ReturnOutsideFunction, "cannot return from top-level code");
        }
        if starts_expression(&self.current.kind) {
            self.expression();
        } else {
            self.func.builder.emit(Opcode::LoadNil);
        }
        self.func.builder.emit(Opcode::Return);
    }

    fn if_statement(&mut self) {
        self.expression();
        self.consume(&TokenKind::Then, "expected 'then' after if condition");
        let mut next_branch = self.func.builder.emit_jump(Opcode::JumpIfFalse);
        self.scoped_block();

        let mut end_jumps: Vec<JumpLabel> = Vec::new();
        while self.check(&TokenKind::Elif) {
            end_jumps.push(self.func.builder.emit_jump(Opcode::Jump));
            self.patch_jump(next_branch);
            self.advance();
            self.expression();
            self.consume(&TokenKind::Then, "expected 'then' after elif condition");
            next_branch = self.func.builder.emit_jump(Opcode::JumpIfFalse);
            self.scoped_block();
        }

        if self.check(&TokenKind::Else) {
            end_jumps.push(self.func.builder.emit_jump(Opcode::Jump));
            self.patch_jump(next_branch);
            self.advance();
            self.scoped_block();
        } else {
            self.patch_jump(next_branch);
        }

        self.consume(&TokenKind::End, "expected 'end' to close if statement");
        for label in end_jumps {
            self.patch_jump(label);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.func.builder.current_offset();
        self.expression();
        self.consume(&TokenKind::Do, "expected 'do' after while condition");
        let exit = self.func.builder.emit_jump(Opcode::JumpIfFalse);
        self.scoped_block();
        self.emit_loop(loop_start);
        self.patch_jump(exit);
        self.consume(&TokenKind::End, "expected 'end' to close while loop");
    }

    fn for_statement(&mut self) {
        let Some(name) = self.consume_ident("expected loop variable name after 'for'") else {
            return;
        };
        self.consume(&TokenKind::In, "expected 'in' after loop variable");

        self.begin_scope();
        self.expression();

        if self.match_token(&TokenKind::To) {
            self.counting_for(name);
        } else {
            self.iterator_for(name);
        }
        self.end_scope();
    }

    /// `for i in a to b do ... end` — inclusive integer range, no allocation.
    fn counting_for(&mut self, name: Box<str>) {
        // Start value is on the stack and becomes the loop variable.
        self.add_local(name, false);
        let var_slot = u16::try_from(self.func.locals.len() - 1).expect("local count bounded");

        self.expression();
        self.add_local("(for limit)".into(), false);
        let limit_slot = u16::try_from(self.func.locals.len() - 1).expect("local count bounded");

        self.consume(&TokenKind::Do, "expected 'do' after for range");

        let loop_start = self.func.builder.current_offset();
        self.func.builder.emit_load_local(var_slot);
        self.func.builder.emit_load_local(limit_slot);
        self.func.builder.emit(Opcode::LessEqual);
        let exit = self.func.builder.emit_jump(Opcode::JumpIfFalse);

        self.scoped_block();

        self.func.builder.emit_load_local(var_slot);
        self.func.builder.emit_i8(Opcode::LoadSmallInt, 1);
        self.func.builder.emit(Opcode::Add);
        self.func.builder.emit_store_local(var_slot);
        self.func.builder.emit(Opcode::Pop);

        self.emit_loop(loop_start);
        self.patch_jump(exit);
        self.consume(&TokenKind::End, "expected 'end' to close for loop");
    }

    /// `for x in iterable do ... end` — arrays yield elements, dicts yield
    /// keys, strings yield one-character strings.
    fn iterator_for(&mut self, name: Box<str>) {
        // The iterable stays on the stack as a hidden local, with the
        // iteration cursor beside it.
        self.add_local("(iter)".into(), false);
        self.func.builder.emit(Opcode::IterInit);
        self.add_local("(iter cursor)".into(), false);

        self.consume(&TokenKind::Do, "expected 'do' after for iterable");

        let loop_start = self.func.builder.current_offset();
        let exit = self.func.builder.emit_jump(Opcode::IterNext);

        // The pushed element is the loop variable, scoped per iteration so
        // closures capture a fresh cell each time around.
        self.begin_scope();
        self.add_local(name, false);
        self.block();
        self.end_scope();

        self.emit_loop(loop_start);
        self.patch_jump(exit);
        self.consume(&TokenKind::End, "expected 'end' to close for loop");
    }

    fn match_statement(&mut self) {
        self.begin_scope();
        self.expression();
        self.add_local("(match)".into(), false);
        let scrutinee_slot = u16::try_from(self.func.locals.len() - 1).expect("local count bounded");

        let mut end_jumps: Vec<JumpLabel> = Vec::new();
        while self.match_token(&TokenKind::Case) {
            let pattern = self.parse_pattern();

            self.begin_scope();
            let mut fail_jumps: Vec<JumpLabel> = Vec::new();
            let mut path: Vec<i64> = Vec::new();
            self.pattern_tests(&pattern, scrutinee_slot, &mut path, &mut fail_jumps);
            debug_assert!(path.is_empty());
            let binds_before = self.func.locals.len();
            self.pattern_binds(&pattern, scrutinee_slot, &mut path);
            let bind_count = self.func.locals.len() - binds_before;

            let guard_fail = if self.match_token(&TokenKind::If) {
                self.expression();
                Some(self.func.builder.emit_jump(Opcode::JumpIfFalse))
            } else {
                None
            };

            self.consume(&TokenKind::Then, "expected 'then' after case pattern");
            self.block();

            // Primary exit: unbind and leave the match.
            self.emit_scope_pops();
            end_jumps.push(self.func.builder.emit_jump(Opcode::Jump));

            // Guard failure arrives with only the binds on the stack (the
            // body never ran), so pop exactly those.
            if let Some(label) = guard_fail {
                self.patch_jump(label);
                let delta = i16::try_from(bind_count).expect("bind count bounded by MAX_LOCALS");
                self.func.builder.adjust_stack_depth(delta);
                let bind_captures: Vec<bool> = self.func.locals[binds_before..binds_before + bind_count]
                    .iter()
                    .map(|local| local.captured)
                    .collect();
                for &captured in bind_captures.iter().rev() {
                    if captured {
                        self.func.builder.emit(Opcode::CloseUpvalue);
                    } else {
                        self.func.builder.emit(Opcode::Pop);
                    }
                }
            }

            // Test failures arrive with nothing extra on the stack.
            for label in fail_jumps {
                self.patch_jump(label);
            }
            self.truncate_scope();
        }
        self.consume(&TokenKind::End, "expected 'end' to close match statement");

        for label in end_jumps {
            self.patch_jump(label);
        }
        self.end_scope();
    }

    /// Parses one `case` pattern.
    fn parse_pattern(&mut self) -> Pattern {
        match &self.current.kind {
            TokenKind::Int(value) => {
                let value = *value;
                self.advance();
                Pattern::Int(value)
            }
            TokenKind::Float(value) => {
                let value = *value;
                self.advance();
                Pattern::Float(value)
            }
            TokenKind::Minus => {
                self.advance();
                match &self.current.kind {
                    TokenKind::Int(value) => {
                        let value = value.wrapping_neg();
                        self.advance();
                        Pattern::Int(value)
                    }
                    TokenKind::Float(value) => {
                        let value = -*value;
                        self.advance();
                        Pattern::Float(value)
                    }
                    _ => {
                        self.error_at_current(
                            DiagnosticKind::UnexpectedToken,
                            "expected numeric literal after '-' in pattern",
                        );
                        Pattern::Wildcard
                    }
                }
            }
            TokenKind::Str(text) => {
                let text = text.clone();
                self.advance();
                Pattern::Str(text)
            }
            TokenKind::True => {
                self.advance();
                Pattern::Bool(true)
            }
            TokenKind::False => {
                self.advance();
                Pattern::Bool(false)
            }
            TokenKind::Nil => {
                self.advance();
                Pattern::Nil
            }
            TokenKind::Ident(name) => {
                let pattern = if name.as_ref() == "_" {
                    Pattern::Wildcard
                } else {
                    Pattern::Bind(name.clone())
                };
                self.advance();
                pattern
            }
            TokenKind::LBracket => {
                self.advance();
                let mut elements = Vec::new();
                if !self.check(&TokenKind::RBracket) {
                    loop {
                        elements.push(self.parse_pattern());
                        if !self.match_token(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(&TokenKind::RBracket, "expected ']' after array pattern");
                Pattern::Array(elements)
            }
            _ => {
                self.error_at_current(DiagnosticKind::UnexpectedToken, "expected pattern after 'case'");
                Pattern::Wildcard
            }
        }
    }

    /// Emits the structural and literal tests of a pattern. All failure
    /// paths jump with nothing extra on the stack.
    fn pattern_tests(
        &mut self,
        pattern: &Pattern,
        scrutinee_slot: u16,
        path: &mut Vec<i64>,
        fail_jumps: &mut Vec<JumpLabel>,
    ) {
        match pattern {
            Pattern::Bind(_) | Pattern::Wildcard => {}
            Pattern::Int(value) => {
                self.emit_path_load(scrutinee_slot, path);
                self.emit_int(*value);
                self.func.builder.emit(Opcode::Equal);
                fail_jumps.push(self.func.builder.emit_jump(Opcode::JumpIfFalse));
            }
            Pattern::Float(value) => {
                self.emit_path_load(scrutinee_slot, path);
                self.emit_const(Const::Float(*value));
                self.func.builder.emit(Opcode::Equal);
                fail_jumps.push(self.func.builder.emit_jump(Opcode::JumpIfFalse));
            }
            Pattern::Str(text) => {
                self.emit_path_load(scrutinee_slot, path);
                self.emit_const(Const::Str(text.clone()));
                self.func.builder.emit(Opcode::Equal);
                fail_jumps.push(self.func.builder.emit_jump(Opcode::JumpIfFalse));
            }
            Pattern::Bool(value) => {
                self.emit_path_load(scrutinee_slot, path);
                self.func
                    .builder
                    .emit(if *value { Opcode::LoadTrue } else { Opcode::LoadFalse });
                self.func.builder.emit(Opcode::Equal);
                fail_jumps.push(self.func.builder.emit_jump(Opcode::JumpIfFalse));
            }
            Pattern::Nil => {
                self.emit_path_load(scrutinee_slot, path);
                self.func.builder.emit(Opcode::LoadNil);
                self.func.builder.emit(Opcode::Equal);
                fail_jumps.push(self.func.builder.emit_jump(Opcode::JumpIfFalse));
            }
            Pattern::Array(elements) => {
                self.emit_path_load(scrutinee_slot, path);
                self.func.builder.emit(Opcode::IsArray);
                fail_jumps.push(self.func.builder.emit_jump(Opcode::JumpIfFalse));

                self.emit_path_load(scrutinee_slot, path);
                self.func.builder.emit(Opcode::Len);
                self.emit_int(i64::try_from(elements.len()).expect("pattern length fits i64"));
                self.func.builder.emit(Opcode::Equal);
                fail_jumps.push(self.func.builder.emit_jump(Opcode::JumpIfFalse));

                for (index, element) in elements.iter().enumerate() {
                    path.push(i64::try_from(index).expect("pattern length fits i64"));
                    self.pattern_tests(element, scrutinee_slot, path, fail_jumps);
                    path.pop();
                }
            }
        }
    }

    /// Declares the locals bound by a pattern, loading each bound value
    /// through its access path. Runs only after all tests passed.
    fn pattern_binds(&mut self, pattern: &Pattern, scrutinee_slot: u16, path: &mut Vec<i64>) {
        match pattern {
            Pattern::Bind(name) => {
                self.emit_path_load(scrutinee_slot, path);
                self.add_local(name.clone(), false);
            }
            Pattern::Array(elements) => {
                for (index, element) in elements.iter().enumerate() {
                    path.push(i64::try_from(index).expect("pattern length fits i64"));
                    self.pattern_binds(element, scrutinee_slot, path);
                    path.pop();
                }
            }
            _ => {}
        }
    }

    /// Loads `scrutinee[path[0]][path[1]]...` onto the stack.
    fn emit_path_load(&mut self, scrutinee_slot: u16, path: &[i64]) {
        self.func.builder.emit_load_local(scrutinee_slot);
        for &index in path {
            self.emit_int(index);
            self.func.builder.emit(Opcode::IndexGet);
        }
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(can_assign) {
            return;
        }

        while precedence <= infix_precedence(&self.current.kind) {
            self.advance();
            self.infix(can_assign);
        }

        if can_assign && self.check(&TokenKind::Eq) {
            self.error_at_current(DiagnosticKind::InvalidAssignmentTarget, "invalid assignment target");
            // Consume the '=' and the junk right-hand side to recover.
            self.advance();
            self.expression();
            self.func.builder.emit(Opcode::Pop);
        }
    }

    /// Dispatches the prefix rule for `previous`. Returns false if the token
    /// cannot start an expression.
    fn prefix(&mut self, can_assign: bool) -> bool {
        match &self.previous.kind {
            TokenKind::Int(value) => {
                let value = *value;
                self.emit_int(value);
            }
            TokenKind::Float(value) => {
                let value = *value;
                self.emit_const(Const::Float(value));
            }
            TokenKind::Str(text) => {
                let text = text.clone();
                self.emit_const(Const::Str(text));
            }
            TokenKind::True => self.func.builder.emit(Opcode::LoadTrue),
            TokenKind::False => self.func.builder.emit(Opcode::LoadFalse),
            TokenKind::Nil => self.func.builder.emit(Opcode::LoadNil),
            TokenKind::Ident(_) => {
                let TokenKind::Ident(name) = std::mem::replace(&mut self.previous.kind, TokenKind::Eof) else {
                    unreachable!("checked above");
                };
                self.variable(&name, can_assign);
            }
            TokenKind::LParen => {
                self.expression();
                self.consume(&TokenKind::RParen, "expected ')' after expression");
            }
            TokenKind::LBracket => self.array_literal(),
            TokenKind::LBrace => self.dict_literal(),
            TokenKind::Minus => {
                self.parse_precedence(Precedence::Unary);
                self.func.builder.emit(Opcode::Negate);
            }
            TokenKind::Not => {
                self.parse_precedence(Precedence::Unary);
                self.func.builder.emit(Opcode::Not);
            }
            TokenKind::Fn => self.function_expression(),
            _ => {
                let message = format!("unexpected token '{}'", self.previous.kind);
                self.error_at_previous(DiagnosticKind::UnexpectedToken, message);
                return false;
            }
        }
        true
    }

    /// Dispatches the infix rule for `previous`.
    fn infix(&mut self, can_assign: bool) {
        match &self.previous.kind {
            TokenKind::Plus => self.binary(Precedence::Term, Opcode::Add),
            TokenKind::Minus => self.binary(Precedence::Term, Opcode::Sub),
            TokenKind::Star => self.binary(Precedence::Factor, Opcode::Mul),
            TokenKind::Slash => self.binary(Precedence::Factor, Opcode::Div),
            TokenKind::Percent => self.binary(Precedence::Factor, Opcode::Mod),
            TokenKind::EqEq => self.binary(Precedence::Equality, Opcode::Equal),
            TokenKind::BangEq => self.binary(Precedence::Equality, Opcode::NotEqual),
            TokenKind::Less => self.binary(Precedence::Comparison, Opcode::Less),
            TokenKind::LessEq => self.binary(Precedence::Comparison, Opcode::LessEqual),
            TokenKind::Greater => self.binary(Precedence::Comparison, Opcode::Greater),
            TokenKind::GreaterEq => self.binary(Precedence::Comparison, Opcode::GreaterEqual),
            TokenKind::DotDot => self.binary(Precedence::Range, Opcode::BuildRange),
            TokenKind::And => self.and_expression(),
            TokenKind::Or => self.or_expression(),
            TokenKind::LParen => self.call_expression(),
            TokenKind::LBracket => self.index_expression(can_assign),
            TokenKind::Dot => self.member_expression(can_assign),
            other => unreachable!("no infix rule for {other:?}"),
        }
    }

    fn binary(&mut self, precedence: Precedence, op: Opcode) {
        self.parse_precedence(precedence.next());
        self.func.builder.emit(op);
    }

    /// `a and b`: if `a` is falsy it is the result; otherwise `b` is.
    fn and_expression(&mut self) {
        self.func.builder.emit(Opcode::Dup);
        let short_circuit = self.func.builder.emit_jump(Opcode::JumpIfFalse);
        self.func.builder.emit(Opcode::Pop);
        self.parse_precedence(Precedence::And.next());
        self.patch_jump(short_circuit);
    }

    /// `a or b`: if `a` is truthy it is the result; otherwise `b` is.
    fn or_expression(&mut self) {
        self.func.builder.emit(Opcode::Dup);
        let take_rhs = self.func.builder.emit_jump(Opcode::JumpIfFalse);
        let short_circuit = self.func.builder.emit_jump(Opcode::Jump);
        self.patch_jump(take_rhs);
        self.func.builder.emit(Opcode::Pop);
        self.parse_precedence(Precedence::Or.next());
        self.patch_jump(short_circuit);
    }

    fn call_expression(&mut self) {
        let mut argc: u16 = 0;
        if !self.check(&TokenKind::RParen) {
            loop {
                self.expression();
                argc += 1;
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RParen, "expected ')' after arguments");
        let Ok(argc) = u8::try_from(argc) else {
            self.error_at_previous(DiagnosticKind::TooManyArguments, "more than 255 arguments");
            return;
        };
        self.func.builder.emit_u8(Opcode::Call, argc);
    }

    fn index_expression(&mut self, can_assign: bool) {
        self.expression();
        self.consume(&TokenKind::RBracket, "expected ']' after index");
        if can_assign && self.match_token(&TokenKind::Eq) {
            self.expression();
            self.func.builder.emit(Opcode::IndexSet);
        } else {
            self.func.builder.emit(Opcode::IndexGet);
        }
    }

    fn member_expression(&mut self, can_assign: bool) {
        let Some(name) = self.consume_ident("expected member name after '.'") else {
            return;
        };
        let index = self.name_index(&name);
        if can_assign && self.match_token(&TokenKind::Eq) {
            self.expression();
            self.func.builder.emit_u16(Opcode::MemberSet, index);
        } else {
            self.func.builder.emit_u16(Opcode::MemberGet, index);
        }
    }

    fn array_literal(&mut self) {
        let mut count: u16 = 0;
        if !self.check(&TokenKind::RBracket) {
            loop {
                self.expression();
                count = count.saturating_add(1);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RBracket, "expected ']' after array elements");
        self.func.builder.emit_u16(Opcode::BuildArray, count);
    }

    fn dict_literal(&mut self) {
        let mut count: u16 = 0;
        if !self.check(&TokenKind::RBrace) {
            loop {
                self.expression();
                self.consume(&TokenKind::Colon, "expected ':' after dict key");
                self.expression();
                count = count.saturating_add(1);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RBrace, "expected '}' after dict entries");
        self.func.builder.emit_u16(Opcode::BuildDict, count);
    }

    /// Anonymous function expression: `fn (params) ... end` or
    /// `fn (params) -> expr`.
    fn function_expression(&mut self) {
        self.function_body("<anonymous>".into());
    }

    /// Loads or assigns a named variable: local, then upvalue, then global.
    fn variable(&mut self, name: &str, can_assign: bool) {
        let assign = can_assign && self.match_token(&TokenKind::Eq);

        if let Some((slot, is_const)) = self.resolve_local(name) {
            if assign {
                if is_const {
                    self.error_at_previous(
                        DiagnosticKind::ConstReassignment,
                        format!("cannot assign to const '{name}'"),
                    );
                }
                self.expression();
                self.func.builder.emit_store_local(slot);
            } else {
                self.func.builder.emit_load_local(slot);
            }
            return;
        }

        if let Some((index, is_const)) = self.resolve_upvalue(name) {
            if assign {
                if is_const {
                    self.error_at_previous(
                        DiagnosticKind::ConstReassignment,
                        format!("cannot assign to const '{name}'"),
                    );
                }
                self.expression();
                self.func.builder.emit_u8(Opcode::StoreUpvalue, index);
            } else {
                self.func.builder.emit_u8(Opcode::LoadUpvalue, index);
            }
            return;
        }

        let index = self.name_index(name);
        if assign {
            if self.const_globals[index as usize] {
                self.error_at_previous(
                    DiagnosticKind::ConstReassignment,
                    format!("cannot assign to const '{name}'"),
                );
            }
            self.expression();
            self.func.builder.emit_u16(Opcode::StoreGlobal, index);
        } else {
            self.func.builder.emit_u16(Opcode::LoadGlobal, index);
        }
    }

    // ========================================================================
    // Jump helpers
    // ========================================================================

    fn patch_jump(&mut self, label: JumpLabel) {
        if !self.func.builder.patch_jump(label) {
            self.error_at_previous(DiagnosticKind::JumpTooFar, "jump distance exceeds 32767 bytes");
        }
    }

    fn emit_loop(&mut self, target: usize) {
        if !self.func.builder.emit_loop(target) {
            self.error_at_previous(DiagnosticKind::JumpTooFar, "loop body exceeds 32767 bytes");
        }
    }
}

/// Finds a local by name in one function context, innermost declaration
/// first. Returns the slot and its constness.
fn find_local(ctx: &FunctionCtx, name: &str) -> Option<(u16, bool)> {
    ctx.locals
        .iter()
        .enumerate()
        .rev()
        .find(|(_, local)| local.name.as_ref() == name)
        .map(|(slot, local)| {
            (
                u16::try_from(slot).expect("local count bounded by MAX_LOCALS"),
                local.is_const,
            )
        })
}

/// Resolves `name` as an upvalue of `ctx`, recursing into enclosing
/// functions and materializing intermediate captures along the chain.
///
/// `Err(())` signals an overflow of the upvalue table.
fn resolve_upvalue(ctx: &mut FunctionCtx, name: &str) -> Result<Option<(u8, bool)>, ()> {
    let Some(enclosing) = ctx.enclosing.as_deref_mut() else {
        return Ok(None);
    };

    if let Some((slot, is_const)) = find_local(enclosing, name) {
        let Ok(slot) = u8::try_from(slot) else {
            // Captured locals must sit in the u8-addressable range; slots
            // this high only occur in pathological functions.
            return Err(());
        };
        enclosing.locals[slot as usize].captured = true;
        return add_upvalue(ctx, true, slot).map(|index| Some((index, is_const)));
    }

    if let Some((index, is_const)) = resolve_upvalue(enclosing, name)? {
        return add_upvalue(ctx, false, index).map(|i| Some((i, is_const)));
    }

    Ok(None)
}

/// Adds (or reuses) an upvalue descriptor on `ctx`.
fn add_upvalue(ctx: &mut FunctionCtx, is_local: bool, index: u8) -> Result<u8, ()> {
    for (existing_index, &(existing_local, existing_slot)) in ctx.upvalues.iter().enumerate() {
        if existing_local == is_local && existing_slot == index {
            return Ok(u8::try_from(existing_index).expect("upvalue count bounded by MAX_UPVALUES"));
        }
    }
    if ctx.upvalues.len() >= MAX_UPVALUES {
        return Err(());
    }
    ctx.upvalues.push((is_local, index));
    Ok(u8::try_from(ctx.upvalues.len() - 1).expect("upvalue count bounded by MAX_UPVALUES"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> Program {
        compile(source, "test").expect("program should compile")
    }

    fn compile_err(source: &str) -> Vec<Diagnostic> {
        compile(source, "test").expect_err("program should fail to compile")
    }

    #[test]
    fn compiles_arithmetic_expression() {
        let program = compile_ok("print(1 + 2 * 3)");
        let listing = program.disassemble();
        assert!(listing.contains("Mul"));
        assert!(listing.contains("Add"));
        assert!(listing.contains("Call 1"));
        assert!(listing.contains("Halt"));
    }

    #[test]
    fn global_function_declaration_defines_global() {
        let program = compile_ok("fn f(a, b) return a + b end");
        let listing = program.disassemble();
        assert!(listing.contains("DefineGlobal"));
        assert!(listing.contains("fn f (#1, arity 2)"));
    }

    #[test]
    fn closure_captures_emit_upvalue_descriptors() {
        let program = compile_ok("fn make(x) fn g() return x end return g end");
        let listing = program.disassemble();
        assert!(listing.contains("Closure"), "inner fn must be a closure:\n{listing}");
        assert!(listing.contains("[local 1]"), "captures make's first local:\n{listing}");
    }

    #[test]
    fn plain_function_avoids_closure_allocation() {
        let program = compile_ok("fn f() return 1 end");
        let listing = program.disassemble();
        assert!(!listing.contains("Closure"));
        assert!(listing.contains("LoadConst"));
    }

    #[test]
    fn counting_for_needs_no_iterator() {
        let program = compile_ok("for i in 1 to 10 do print(i) end");
        let listing = program.disassemble();
        assert!(!listing.contains("IterInit"));
        assert!(listing.contains("LessEqual"));
        assert!(listing.contains("Loop"));
    }

    #[test]
    fn iterator_for_uses_iter_opcodes() {
        let program = compile_ok("for x in [1, 2] do print(x) end");
        let listing = program.disassemble();
        assert!(listing.contains("IterInit"));
        assert!(listing.contains("IterNext"));
    }

    #[test]
    fn const_reassignment_is_rejected() {
        let diagnostics = compile_err("const x = 1 x = 2");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::ConstReassignment);
    }

    #[test]
    fn const_requires_initializer() {
        let diagnostics = compile_err("const x");
        assert_eq!(diagnostics[0].kind, DiagnosticKind::UndefinedConstInit);
    }

    #[test]
    fn const_local_reassignment_is_rejected() {
        let diagnostics = compile_err("fn f() const k = 1 k = 2 end");
        assert_eq!(diagnostics[0].kind, DiagnosticKind::ConstReassignment);
    }

    #[test]
    fn return_at_top_level_is_rejected() {
        let diagnostics = compile_err("return 1");
        assert_eq!(diagnostics[0].kind, DiagnosticKind::ReturnOutsideFunction);
    }

    #[test]
    fn invalid_assignment_target_is_rejected() {
        let diagnostics = compile_err("1 + 2 = 3");
        assert_eq!(diagnostics[0].kind, DiagnosticKind::InvalidAssignmentTarget);
    }

    #[test]
    fn resynchronizes_and_reports_multiple_errors() {
        let diagnostics = compile_err("let = 1\nlet y = )\nlet z = 3 z = ,");
        assert!(diagnostics.len() >= 2, "expected several diagnostics, got {diagnostics:?}");
    }

    #[test]
    fn match_with_guard_compiles() {
        let program = compile_ok(
            "fn describe(v) match v case 0 then return \"zero\" case n if n < 0 then return \"neg\" case _ then return \"pos\" end end",
        );
        let listing = program.disassemble();
        assert!(listing.contains("Equal"));
        assert!(listing.contains("JumpIfFalse"));
    }

    #[test]
    fn array_pattern_emits_structure_tests() {
        let program = compile_ok("match [1, 2] case [a, b] then print(a + b) end");
        let listing = program.disassemble();
        assert!(listing.contains("IsArray"));
        assert!(listing.contains("Len"));
    }

    #[test]
    fn duplicate_parameter_is_rejected() {
        let diagnostics = compile_err("fn f(a, a) return a end");
        assert_eq!(diagnostics[0].kind, DiagnosticKind::DuplicateLocal);
    }

    #[test]
    fn stray_end_at_top_level_recovers() {
        let diagnostics = compile_err("end end");
        assert!(!diagnostics.is_empty());
    }

    #[test]
    fn arrow_body_returns_expression() {
        let program = compile_ok("fn double(x) -> x * 2\nprint(double(4))");
        let listing = program.disassemble();
        assert!(listing.contains("fn double"));
        assert!(listing.contains("Return"));
    }
}
