use crate::chunk::*;
use crate::lexer::{self, Token, TokenKind};
use crate::object::{ObjFunction, ObjString};
use crate::value::Value;
use crate::vm::Vm;

// ── Single-pass bytecode compiler ────────────────────────────────────
//
// A Pratt expression parser fused with an ad-hoc statement parser; code is
// emitted directly into the chunk of the function being compiled. There is
// no AST. Scopes form a stack, one entry per function being compiled, each
// owning its locals and its chunk.

const MAX_LOCALS: usize = 256;
const MAX_SHORT_OPERAND: u32 = 256;

/// Marker error: diagnostics were already written to stderr while parsing.
#[derive(Debug, thiserror::Error)]
#[error("compile error")]
pub struct CompileFailed;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * / %
    Unary,      // ! -
    Call,       // ()
    Primary,
}

impl Precedence {
    fn one_higher(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'vm> = fn(&mut Compiler<'src, 'vm>, bool);

struct ParseRule<'src, 'vm> {
    prefix: Option<ParseFn<'src, 'vm>>,
    infix: Option<ParseFn<'src, 'vm>>,
    precedence: Precedence,
}

struct Local<'src> {
    name: &'src str,
    /// Block depth, or -1 while the initializer is still being compiled.
    depth: i32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Function,
    Script,
}

struct Scope<'src> {
    kind: FunctionKind,
    name: *const ObjString,
    arity: u32,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    depth: i32,
}

impl<'src> Scope<'src> {
    fn new(kind: FunctionKind, name: *const ObjString) -> Scope<'src> {
        Scope {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            // Slot 0 is reserved so local indices line up with runtime
            // stack slots relative to the frame base.
            locals: vec![Local { name: "", depth: 0 }],
            depth: 0,
        }
    }
}

pub struct Compiler<'src, 'vm> {
    vm: &'vm mut Vm,
    tokens: Vec<Token<'src>>,
    next: usize,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    scopes: Vec<Scope<'src>>,
    loop_start: Option<usize>,
    loop_scope_depth: i32,
    break_jump: Option<usize>,
    inside_switch: bool,
}

/// Compile `source` against `vm` (globals and interned strings land in the
/// VM as a side effect). Returns the root function, or the failure marker
/// after all diagnostics have been printed.
pub fn compile(vm: &mut Vm, source: &str) -> Result<*const ObjFunction, CompileFailed> {
    let tokens = lexer::scan(source);
    let placeholder = Token {
        kind: TokenKind::Eof,
        lexeme: "",
        line: 0,
    };

    let mut compiler = Compiler {
        vm,
        tokens,
        next: 0,
        previous: placeholder,
        current: placeholder,
        had_error: false,
        panic_mode: false,
        scopes: vec![Scope::new(FunctionKind::Script, std::ptr::null())],
        loop_start: None,
        loop_scope_depth: 0,
        break_jump: None,
        inside_switch: false,
    };

    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let function = compiler.end_compiler();

    if compiler.had_error {
        Err(CompileFailed)
    } else {
        Ok(function)
    }
}

impl<'src, 'vm> Compiler<'src, 'vm> {
    // ── Token plumbing ───────────────────────────────────────────

    fn next_token(&mut self) -> Token<'src> {
        if self.next < self.tokens.len() {
            let token = self.tokens[self.next];
            self.next += 1;
            token
        } else {
            // The stream ends with Eof; stay there.
            self.tokens[self.tokens.len() - 1]
        }
    }

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    /// Consume a compound-assignment operator if one is next.
    fn match_compound(&mut self) -> Option<TokenKind> {
        for kind in [
            TokenKind::MinusEqual,
            TokenKind::PlusEqual,
            TokenKind::SlashEqual,
            TokenKind::StarEqual,
            TokenKind::PercentEqual,
        ] {
            if self.match_token(kind) {
                return Some(kind);
            }
        }
        None
    }

    // ── Error reporting ──────────────────────────────────────────

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        eprint!("[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => eprint!(" at end"),
            TokenKind::Error => {}
            _ => eprint!(" at '{}'", token.lexeme),
        }
        eprintln!(": {}", message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

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

    // ── Emitting ─────────────────────────────────────────────────

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.scopes.last_mut().unwrap().chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_two(&mut self, b1: u8, b2: u8) {
        self.emit_byte(b1);
        self.emit_byte(b2);
    }

    fn emit_u16(&mut self, value: u16) {
        self.emit_byte((value & 0xff) as u8);
        self.emit_byte((value >> 8) as u8);
    }

    fn emit_u24(&mut self, value: u32) {
        self.emit_byte((value & 0xff) as u8);
        self.emit_byte(((value >> 8) & 0xff) as u8);
        self.emit_byte(((value >> 16) & 0xff) as u8);
    }

    fn emit_return(&mut self) {
        self.emit_byte(OP_NIL);
        self.emit_byte(OP_RETURN);
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.current_chunk().add_constant(value);
        if index < MAX_SHORT_OPERAND {
            self.emit_two(OP_CONSTANT, index as u8);
        } else {
            self.emit_byte(OP_CONSTANT_LONG);
            self.emit_u24(index);
        }
    }

    /// Emit a forward jump with a placeholder offset; returns the offset of
    /// the operand for `patch_jump`.
    fn emit_jump(&mut self, instruction: u8) -> usize {
        self.emit_byte(instruction);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 to adjust for the operand bytes themselves.
        let jump = self.current_chunk().len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = self.current_chunk();
        chunk.code[offset] = (jump & 0xff) as u8;
        chunk.code[offset + 1] = ((jump >> 8) & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_byte(OP_JUMP_BACK);
        let offset = self.current_chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_u16(offset as u16);
    }

    fn emit_get_local(&mut self, slot: usize) {
        if (slot as u32) < MAX_SHORT_OPERAND {
            self.emit_two(OP_GET_LOCAL, slot as u8);
        } else {
            self.emit_byte(OP_GET_LOCAL_SHORT);
            self.emit_u16(slot as u16);
        }
    }

    fn emit_set_local(&mut self, slot: usize) {
        if (slot as u32) < MAX_SHORT_OPERAND {
            self.emit_two(OP_SET_LOCAL, slot as u8);
        } else {
            self.emit_byte(OP_SET_LOCAL_SHORT);
            self.emit_u16(slot as u16);
        }
    }

    fn emit_get_global(&mut self, index: u32) {
        if index < MAX_SHORT_OPERAND {
            self.emit_two(OP_GET_GLOBAL, index as u8);
        } else {
            self.emit_byte(OP_GET_GLOBAL_LONG);
            self.emit_u24(index);
        }
    }

    fn emit_set_global(&mut self, index: u32) {
        if index < MAX_SHORT_OPERAND {
            self.emit_two(OP_SET_GLOBAL, index as u8);
        } else {
            self.emit_byte(OP_SET_GLOBAL_LONG);
            self.emit_u24(index);
        }
    }

    fn end_compiler(&mut self) -> *const ObjFunction {
        self.emit_return();
        let scope = self.scopes.pop().unwrap();
        let function = self
            .vm
            .heap
            .new_function(scope.name, scope.arity, scope.chunk);
        if self.vm.trace && !self.had_error {
            // SAFETY: the function was just allocated and the heap outlives
            // this compiler.
            let f = unsafe { &*function };
            crate::vm::debug::disassemble_chunk(&f.chunk, f.name_str());
        }
        function
    }

    // ── Scopes & variables ───────────────────────────────────────

    fn begin_scope(&mut self) {
        self.scopes.last_mut().unwrap().depth += 1;
    }

    fn end_scope(&mut self) {
        let scope = self.scopes.last_mut().unwrap();
        scope.depth -= 1;
        let target = scope.depth;

        let mut pops = 0;
        while scope
            .locals
            .last()
            .map_or(false, |local| local.depth > target)
        {
            scope.locals.pop();
            pops += 1;
        }
        for _ in 0..pops {
            self.emit_byte(OP_POP);
        }
    }

    /// Slot index of `name` in the current function, walking innermost-out.
    fn resolve_local(&mut self, name: &str) -> Option<usize> {
        let scope = self.scopes.last().unwrap();
        let mut found = None;
        let mut in_initializer = false;
        for (i, local) in scope.locals.iter().enumerate().rev() {
            if local.name == name {
                in_initializer = local.depth == -1;
                found = Some(i);
                break;
            }
        }
        if in_initializer {
            self.error("Cannot read local variable in its own initializer.");
        }
        found
    }

    /// Global slot for `name`, allocated on first textual reference.
    fn identifier_constant(&mut self, name: &str) -> u32 {
        if let Some(&index) = self.vm.globals_map.get(&name.to_string()) {
            return index;
        }
        self.vm.global_values.push(Value::Undefined);
        self.vm.global_names.push(name.to_string());
        let index = (self.vm.global_values.len() - 1) as u32;
        self.vm.globals_map.insert(name.to_string(), index);
        index
    }

    fn add_local(&mut self, name: &'src str) {
        if self.scopes.last().unwrap().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in scope.");
            return;
        }
        self.scopes
            .last_mut()
            .unwrap()
            .locals
            .push(Local { name, depth: -1 });
    }

    fn declare_variable(&mut self) {
        // Globals are implicitly declared.
        if self.scopes.last().unwrap().depth == 0 {
            return;
        }

        let name = self.previous.lexeme;
        let mut duplicate = false;
        {
            let scope = self.scopes.last().unwrap();
            for local in scope.locals.iter().rev() {
                if local.depth != -1 && local.depth < scope.depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Variable with this name already declared in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u32 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.scopes.last().unwrap().depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        let scope = self.scopes.last_mut().unwrap();
        if scope.depth == 0 {
            return;
        }
        let depth = scope.depth;
        if let Some(local) = scope.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u32) {
        if self.scopes.last().unwrap().depth > 0 {
            self.mark_initialized();
            return;
        }
        if global < MAX_SHORT_OPERAND {
            self.emit_two(OP_DEFINE_GLOBAL, global as u8);
        } else {
            self.emit_byte(OP_DEFINE_GLOBAL_LONG);
            self.emit_u24(global);
        }
    }

    // ── Expressions (Pratt) ──────────────────────────────────────

    fn rule(kind: TokenKind) -> ParseRule<'src, 'vm> {
        use TokenKind::*;
        let (prefix, infix, precedence): (
            Option<ParseFn<'src, 'vm>>,
            Option<ParseFn<'src, 'vm>>,
            Precedence,
        ) = match kind {
            LeftParen => (Some(Self::grouping), Some(Self::call), Precedence::Call),
            Dot => (None, None, Precedence::Call),
            Minus => (Some(Self::unary), Some(Self::binary), Precedence::Term),
            Plus => (None, Some(Self::binary), Precedence::Term),
            Slash | Star | Percent => (None, Some(Self::binary), Precedence::Factor),
            Bang => (Some(Self::unary), None, Precedence::None),
            BangEqual | EqualEqual => (None, Some(Self::binary), Precedence::Equality),
            Greater | GreaterEqual | Less | LessEqual => {
                (None, Some(Self::binary), Precedence::Comparison)
            }
            Identifier => (Some(Self::variable), None, Precedence::None),
            String => (Some(Self::string), None, Precedence::None),
            Number => (Some(Self::number), None, Precedence::None),
            And => (None, Some(Self::and_), Precedence::And),
            Or => (None, Some(Self::or_), Precedence::Or),
            False | Nil | True => (Some(Self::literal), None, Precedence::None),
            _ => (None, None, Precedence::None),
        };
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = match Self::rule(self.previous.kind).prefix {
            Some(rule) => rule,
            None => {
                self.error("Expect expression.");
                return;
            }
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = Self::rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
            self.expression();
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let content = &lexeme[1..lexeme.len() - 1];
        let interned = self.vm.heap.intern(content);
        self.emit_constant(Value::string(interned));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_byte(OP_FALSE),
            TokenKind::Nil => self.emit_byte(OP_NIL),
            TokenKind::True => self.emit_byte(OP_TRUE),
            _ => unreachable!(),
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Bang => self.emit_byte(OP_NOT),
            TokenKind::Minus => self.emit_byte(OP_NEGATE),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let rule = Self::rule(operator);
        self.parse_precedence(rule.precedence.one_higher());

        match operator {
            TokenKind::BangEqual => self.emit_two(OP_EQUAL, OP_NOT),
            TokenKind::EqualEqual => self.emit_byte(OP_EQUAL),
            TokenKind::Greater => self.emit_byte(OP_GREATER),
            TokenKind::GreaterEqual => self.emit_two(OP_LESS, OP_NOT),
            TokenKind::Less => self.emit_byte(OP_LESS),
            TokenKind::LessEqual => self.emit_two(OP_GREATER, OP_NOT),
            TokenKind::Plus => self.emit_byte(OP_ADD),
            TokenKind::Minus => self.emit_byte(OP_SUBTRACT),
            TokenKind::Star => self.emit_byte(OP_MULTIPLY),
            TokenKind::Slash => self.emit_byte(OP_DIVIDE),
            TokenKind::Percent => self.emit_byte(OP_MODULO),
            _ => unreachable!(),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OP_JUMP_IF_FALSE);
        self.emit_byte(OP_POP);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OP_JUMP_IF_TRUE);
        self.emit_byte(OP_POP);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_two(OP_CALL, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count >= 255 {
                    self.error("Cannot have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after function arguments.");
        count.min(255) as u8
    }

    fn compound_op(kind: TokenKind) -> u8 {
        match kind {
            TokenKind::MinusEqual => OP_SUBTRACT,
            TokenKind::PlusEqual => OP_ADD,
            TokenKind::SlashEqual => OP_DIVIDE,
            TokenKind::StarEqual => OP_MULTIPLY,
            TokenKind::PercentEqual => OP_MODULO,
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous;
        self.named_variable(name, can_assign);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        if let Some(slot) = self.resolve_local(name.lexeme) {
            if can_assign {
                if let Some(compound) = self.match_compound() {
                    // x op= e  =>  load x; e; op; store x
                    self.emit_get_local(slot);
                    self.expression();
                    self.emit_byte(Self::compound_op(compound));
                    self.emit_set_local(slot);
                    return;
                }
                if self.match_token(TokenKind::Equal) {
                    self.expression();
                    self.emit_set_local(slot);
                    return;
                }
            }
            self.emit_get_local(slot);
        } else {
            let index = self.identifier_constant(name.lexeme);
            if can_assign {
                if let Some(compound) = self.match_compound() {
                    self.emit_get_global(index);
                    self.expression();
                    self.emit_byte(Self::compound_op(compound));
                    self.emit_set_global(index);
                    return;
                }
                if self.match_token(TokenKind::Equal) {
                    self.expression();
                    self.emit_set_global(index);
                    return;
                }
            }
            self.emit_get_global(index);
        }
    }

    // ── Declarations & statements ────────────────────────────────

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // Initialized before the body so the function can call itself.
        self.mark_initialized();
        self.function();
        self.define_variable(global);
    }

    fn function(&mut self) {
        let name = self.vm.heap.intern(self.previous.lexeme);
        self.scopes.push(Scope::new(FunctionKind::Function, name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let param = self.parse_variable("Expect parameter name.");
                self.define_variable(param);

                let scope = self.scopes.last_mut().unwrap();
                scope.arity += 1;
                if scope.arity > 255 {
                    self.error("Cannot have more than 255 parameters.");
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameter list.");

        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let function = self.end_compiler();
        self.emit_constant(Value::function(function));
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_byte(OP_NIL);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );

        self.define_variable(global);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_byte(OP_PRINT);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_byte(OP_POP);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OP_JUMP_IF_FALSE);
        self.emit_byte(OP_POP);
        self.statement();

        let else_jump = self.emit_jump(OP_JUMP);

        self.patch_jump(then_jump);
        self.emit_byte(OP_POP);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let saved_break = self.break_jump.take();
        let saved_loop_start = self.loop_start;
        let saved_loop_depth = self.loop_scope_depth;

        self.loop_start = Some(self.current_chunk().len());
        self.loop_scope_depth = self.scopes.last().unwrap().depth;

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OP_JUMP_IF_FALSE);

        self.emit_byte(OP_POP);
        self.statement();

        let start = self.loop_start.unwrap();
        self.emit_loop(start);

        self.patch_jump(exit_jump);
        self.emit_byte(OP_POP);

        if let Some(break_jump) = self.break_jump {
            self.patch_jump(break_jump);
        }

        self.break_jump = saved_break;
        self.loop_start = saved_loop_start;
        self.loop_scope_depth = saved_loop_depth;
    }

    fn for_statement(&mut self) {
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else {
            self.expression_statement();
        }

        let saved_break = self.break_jump.take();
        let saved_loop_start = self.loop_start;
        let saved_loop_depth = self.loop_scope_depth;

        self.loop_start = Some(self.current_chunk().len());
        self.loop_scope_depth = self.scopes.last().unwrap().depth;

        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump(OP_JUMP_IF_FALSE));
            self.emit_byte(OP_POP); // Condition.
        }

        if !self.match_token(TokenKind::RightParen) {
            // The increment runs after the body: jump over it now, loop back
            // to it from the body's end.
            let body_jump = self.emit_jump(OP_JUMP);

            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_byte(OP_POP);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            let start = self.loop_start.unwrap();
            self.emit_loop(start);
            self.loop_start = Some(increment_start);
            self.patch_jump(body_jump);
        }

        self.statement();

        let start = self.loop_start.unwrap();
        self.emit_loop(start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_byte(OP_POP);
        }

        if let Some(break_jump) = self.break_jump {
            self.patch_jump(break_jump);
        }

        self.break_jump = saved_break;
        self.loop_start = saved_loop_start;
        self.loop_scope_depth = saved_loop_depth;

        self.end_scope();
    }

    /// POP every local deeper than the innermost loop/switch scope, without
    /// forgetting the locals themselves (the scope is still open).
    fn pop_to_loop_depth(&mut self) {
        let depth = self.loop_scope_depth;
        let pops = {
            let scope = self.scopes.last().unwrap();
            scope
                .locals
                .iter()
                .rev()
                .take_while(|local| local.depth > depth)
                .count()
        };
        for _ in 0..pops {
            self.emit_byte(OP_POP);
        }
    }

    fn continue_statement(&mut self) {
        if self.loop_start.is_none() {
            self.error("Cannot use 'continue' outside of a loop.");
        }

        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        self.pop_to_loop_depth();

        if let Some(start) = self.loop_start {
            self.emit_loop(start);
        }
    }

    fn break_statement(&mut self) {
        if self.loop_start.is_none() && !self.inside_switch {
            self.error("Cannot use 'break' outside of a loop or a 'switch' statement.");
        }

        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        self.pop_to_loop_depth();

        self.break_jump = Some(self.emit_jump(OP_JUMP));
    }

    fn switch_statement(&mut self) {
        self.begin_scope();

        let saved_break = self.break_jump.take();
        let saved_loop_depth = self.loop_scope_depth;
        let saved_inside_switch = self.inside_switch;

        self.loop_scope_depth = self.scopes.last().unwrap().depth;
        self.inside_switch = true;

        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after value.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before switch cases.");

        // Pin the subject as a hidden local so scope teardown pops it.
        self.add_local("__switch__");
        self.mark_initialized();

        // 0: before all cases, 1: inside cases, 2: after default.
        let mut state = 0;
        let mut previous_case_skip: Option<usize> = None;
        let mut end_jumps: Vec<usize> = Vec::new();

        while !self.match_token(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.match_token(TokenKind::Case) || self.match_token(TokenKind::Default) {
                let case_kind = self.previous.kind;

                if state == 2 {
                    self.error("Cannot have another case or default after the default case.");
                }

                if state == 1 {
                    // The previous case body ends here; it exits the switch
                    // rather than falling into the next case.
                    end_jumps.push(self.emit_jump(OP_JUMP));

                    if let Some(skip) = previous_case_skip.take() {
                        self.patch_jump(skip);
                        self.emit_byte(OP_POP);
                    }
                }

                if case_kind == TokenKind::Case {
                    state = 1;

                    self.emit_byte(OP_DUP);
                    self.expression();
                    self.consume(TokenKind::Colon, "Expect ':' after case value.");
                    self.emit_byte(OP_EQUAL);
                    previous_case_skip = Some(self.emit_jump(OP_JUMP_IF_FALSE));

                    // Pop the comparison result on the matching path.
                    self.emit_byte(OP_POP);
                } else {
                    state = 2;
                    self.consume(TokenKind::Colon, "Expect ':' after default.");
                    previous_case_skip = None;

                    // The default clause must have a statement after it.
                    self.statement();
                    self.collect_switch_break(&mut end_jumps);
                }
            } else {
                if state == 0 {
                    self.error("Cannot have statements before any case.");
                }
                self.statement();
                self.collect_switch_break(&mut end_jumps);
            }
        }

        // No default: the last case's failed comparison lands here and its
        // result still needs popping.
        if state == 1 {
            if let Some(skip) = previous_case_skip {
                self.patch_jump(skip);
                self.emit_byte(OP_POP);
            }
        }

        for jump in end_jumps {
            self.patch_jump(jump);
        }

        self.inside_switch = saved_inside_switch;
        self.loop_scope_depth = saved_loop_depth;
        self.break_jump = saved_break;

        self.end_scope();
    }

    fn collect_switch_break(&mut self, end_jumps: &mut Vec<usize>) {
        if let Some(break_jump) = self.break_jump {
            if end_jumps.last() != Some(&break_jump) {
                end_jumps.push(break_jump);
            }
        }
    }

    fn return_statement(&mut self) {
        if self.scopes.last().unwrap().kind == FunctionKind::Script {
            self.error("Cannot return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_byte(OP_RETURN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;

    fn compile_ok(source: &str) -> (Vm, *const ObjFunction) {
        let mut vm = Vm::new();
        let function = compile(&mut vm, source).expect("expected successful compile");
        (vm, function)
    }

    fn compile_err(source: &str) {
        let mut vm = Vm::new();
        assert!(compile(&mut vm, source).is_err(), "expected compile error");
    }

    fn code(function: *const ObjFunction) -> Vec<u8> {
        unsafe { (*function).chunk.code.clone() }
    }

    #[test]
    fn arithmetic_emits_precedence_order() {
        let (_vm, f) = compile_ok("print 1 + 2 * 3;");
        assert_eq!(
            code(f),
            vec![
                OP_CONSTANT,
                0,
                OP_CONSTANT,
                1,
                OP_CONSTANT,
                2,
                OP_MULTIPLY,
                OP_ADD,
                OP_PRINT,
                OP_NIL,
                OP_RETURN,
            ]
        );
    }

    #[test]
    fn comparison_sugar_uses_not() {
        let (_vm, f) = compile_ok("1 <= 2;");
        assert_eq!(
            code(f),
            vec![
                OP_CONSTANT,
                0,
                OP_CONSTANT,
                1,
                OP_GREATER,
                OP_NOT,
                OP_POP,
                OP_NIL,
                OP_RETURN,
            ]
        );
    }

    #[test]
    fn block_locals_are_popped() {
        let (_vm, f) = compile_ok("{ var a = 1; var b = 2; }");
        assert_eq!(
            code(f),
            vec![
                OP_CONSTANT,
                0,
                OP_CONSTANT,
                1,
                OP_POP,
                OP_POP,
                OP_NIL,
                OP_RETURN,
            ]
        );
    }

    #[test]
    fn global_slots_are_allocated_in_reference_order() {
        // Slot 0 is the clock native registered at VM construction.
        let (vm, f) = compile_ok("var a = 1; print a;");
        assert_eq!(vm.global_names[0], "clock");
        assert_eq!(vm.global_names[1], "a");
        assert_eq!(
            code(f),
            vec![
                OP_CONSTANT,
                0,
                OP_DEFINE_GLOBAL,
                1,
                OP_GET_GLOBAL,
                1,
                OP_PRINT,
                OP_NIL,
                OP_RETURN,
            ]
        );
    }

    #[test]
    fn compound_assignment_lowers_to_load_op_store() {
        let (_vm, f) = compile_ok("{ var x = 1; x += 2; }");
        assert_eq!(
            code(f),
            vec![
                OP_CONSTANT,
                0,
                OP_GET_LOCAL,
                1,
                OP_CONSTANT,
                1,
                OP_ADD,
                OP_SET_LOCAL,
                1,
                OP_POP,
                OP_POP,
                OP_NIL,
                OP_RETURN,
            ]
        );
    }

    #[test]
    fn shadowing_initializer_sees_enclosing_binding() {
        // The inner x is still "reserved" while its initializer compiles, so
        // the reference resolves to the outer local.
        let (_vm, f) = compile_ok("{ var x = 1; { var x = x + 1; } }");
        assert_eq!(
            code(f),
            vec![
                OP_CONSTANT,
                0,
                OP_GET_LOCAL,
                1,
                OP_CONSTANT,
                0,
                OP_ADD,
                OP_POP,
                OP_POP,
                OP_NIL,
                OP_RETURN,
            ]
        );
    }

    #[test]
    fn local_in_own_initializer_without_enclosing_is_an_error() {
        compile_err("{ var x = x; }");
    }

    #[test]
    fn duplicate_local_in_same_scope_is_an_error() {
        compile_err("{ var a = 1; var a = 2; }");
    }

    #[test]
    fn functions_compile_into_constants() {
        let (_vm, f) = compile_ok("fun double(x) { return x * 2; } print double(21);");
        let constants = unsafe { &(*f).chunk.constants };
        let nested = constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(_) if c.obj_kind() == Some(crate::object::ObjKind::Function) => {
                    Some(unsafe { c.as_function() })
                }
                _ => None,
            })
            .expect("nested function constant");
        assert_eq!(nested.arity, 1);
        assert_eq!(nested.name_str(), "double");
        assert_eq!(
            nested.chunk.code,
            vec![
                OP_GET_LOCAL,
                1,
                OP_CONSTANT,
                0,
                OP_MULTIPLY,
                OP_RETURN,
                OP_NIL,
                OP_RETURN,
            ]
        );
    }

    #[test]
    fn boundary_255_locals_compile_and_256_do_not() {
        let mut ok = String::from("{");
        for i in 0..255 {
            ok.push_str(&format!("var v{} = {};", i, i));
        }
        ok.push('}');
        compile_ok(&ok);

        let mut too_many = String::from("{");
        for i in 0..256 {
            too_many.push_str(&format!("var v{} = {};", i, i));
        }
        too_many.push('}');
        compile_err(&too_many);
    }

    #[test]
    fn boundary_parameters_and_arguments() {
        let params: Vec<String> = (0..255).map(|i| format!("p{}", i)).collect();
        let ok = format!("fun f({}) {{ }}", params.join(","));
        compile_ok(&ok);

        let params: Vec<String> = (0..256).map(|i| format!("p{}", i)).collect();
        let too_many = format!("fun f({}) {{ }}", params.join(","));
        compile_err(&too_many);

        let args: Vec<String> = (0..256).map(|i| i.to_string()).collect();
        let too_many_args = format!("fun f() {{ }} f({});", args.join(","));
        compile_err(&too_many_args);
    }

    #[test]
    fn constant_index_256_switches_to_long_form() {
        let mut source = String::new();
        for i in 0..257 {
            source.push_str(&format!("print {}.5;", i));
        }
        let (_vm, f) = compile_ok(&source);
        let bytes = code(f);
        assert!(bytes.contains(&OP_CONSTANT_LONG));

        // Exactly one long constant: index 256 (the 257th literal).
        let mut offset = 0;
        let mut long_indices = Vec::new();
        while offset < bytes.len() {
            if bytes[offset] == OP_CONSTANT_LONG {
                let idx = u32::from(bytes[offset + 1])
                    | u32::from(bytes[offset + 2]) << 8
                    | u32::from(bytes[offset + 3]) << 16;
                long_indices.push(idx);
            }
            offset += instruction_width(bytes[offset]);
        }
        assert_eq!(long_indices, vec![256]);
    }

    #[test]
    fn global_slot_256_switches_to_long_form() {
        // clock holds slot 0, so the 256th declaration lands in slot 256.
        let mut source = String::new();
        for i in 0..256 {
            source.push_str(&format!("var g{} = nil;", i));
        }
        let (vm, f) = compile_ok(&source);
        assert_eq!(vm.global_names.len(), 257);

        let bytes = code(f);
        let mut offset = 0;
        let mut long_slots = Vec::new();
        while offset < bytes.len() {
            if bytes[offset] == OP_DEFINE_GLOBAL_LONG {
                let slot = u32::from(bytes[offset + 1])
                    | u32::from(bytes[offset + 2]) << 8
                    | u32::from(bytes[offset + 3]) << 16;
                long_slots.push(slot);
            }
            offset += instruction_width(bytes[offset]);
        }
        assert_eq!(long_slots, vec![256]);
    }

    #[test]
    fn jump_spans_beyond_u16_are_rejected() {
        // "x = x + 1;" encodes to 8 bytes; 8200 of them overflow the
        // 16-bit jump operand in both directions.
        let mut then_branch = String::from("if (true) {");
        for _ in 0..8200 {
            then_branch.push_str("x = x + 1;");
        }
        then_branch.push('}');
        compile_err(&then_branch);

        let mut loop_body = String::from("while (true) {");
        for _ in 0..8200 {
            loop_body.push_str("x = x + 1;");
        }
        loop_body.push('}');
        compile_err(&loop_body);
    }

    #[test]
    fn control_flow_misuse_is_rejected() {
        compile_err("break;");
        compile_err("continue;");
        compile_err("return 1;");
        compile_err("1 = 2;");
        compile_err("switch (1) { print 1; case 1: print 1; }");
        compile_err("switch (1) { default: print 0; case 1: print 1; }");
        compile_err("switch (1) { default: print 0; default: print 0; }");
    }

    #[test]
    fn switch_accepts_bare_default() {
        compile_ok("switch (1) { default: print 0; }");
    }

    #[test]
    fn break_inside_switch_and_loop_compiles() {
        compile_ok("switch (1) { case 1: break; }");
        compile_ok("while (true) { break; }");
        compile_ok("for (;;) { break; }");
        compile_ok("while (true) { continue; }");
    }

    #[test]
    fn every_jump_lands_inside_the_chunk() {
        let (_vm, f) = compile_ok(
            "var s = 0;\n\
             for (var i = 0; i < 10; i = i + 1) {\n\
               if (i == 5) continue;\n\
               if (i == 8) break;\n\
               s = s + i;\n\
             }\n\
             switch (s) { case 1: print 1; default: print s; }\n\
             while (false) { print 0; }",
        );
        let bytes = code(f);
        let mut offset = 0;
        while offset < bytes.len() {
            let op = bytes[offset];
            match op {
                OP_JUMP | OP_JUMP_IF_FALSE | OP_JUMP_IF_TRUE => {
                    let jump = u16::from(bytes[offset + 1]) | u16::from(bytes[offset + 2]) << 8;
                    let target = offset + 3 + jump as usize;
                    assert!(target <= bytes.len(), "forward jump at {} escapes", offset);
                }
                OP_JUMP_BACK => {
                    let jump = u16::from(bytes[offset + 1]) | u16::from(bytes[offset + 2]) << 8;
                    assert!(offset + 3 >= jump as usize, "back jump at {} escapes", offset);
                }
                _ => {}
            }
            offset += instruction_width(op);
        }
        assert_eq!(offset, bytes.len());
    }

    #[test]
    fn mixed_programs_with_nested_scopes_compile() {
        compile_ok(
            "var a = 1;\n\
             { var b = 2; { var c = b; print c; } }\n\
             if (a) { print a; } else { print 0; }\n\
             fun outer(n) { fun2(n); return n; }\n\
             print a and true or false;",
        );
    }
}
