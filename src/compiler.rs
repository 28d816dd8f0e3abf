// File: src/compiler.rs
//
// Single-pass, indentation-sensitive compiler for the Fun language (spec
// §3/§4): a recursive-descent cursor over the raw source that emits
// bytecode::Instruction directly, with no intermediate AST. Structurally
// grounded on `original_source/src/parser.c` and `parser_utils.c`: the
// same symbol-table shape (parallel names/types arrays, capacity-bounded
// globals, swapped-in-and-out per-function locals), the same expression
// precedence chain, and the same statement dispatch (eager symbol
// resolution on the leading identifier, then branch on the next token).

use crate::bytecode::{Bytecode, OpCode};
use crate::errors::{FunError, FunResult, SourceLocation};
use crate::value::Value;

const MAX_GLOBALS: usize = 128;
const MAX_FRAME_LOCALS: usize = 64;

/// Global symbol table: parallel name/declared-width arrays, capacity
/// bounded the same way `vm::Vm`'s global slot vector is (spec §4.5).
struct GlobalTable {
    names: Vec<String>,
    types: Vec<i32>,
}

impl GlobalTable {
    fn new() -> Self {
        Self { names: Vec::new(), types: Vec::new() }
    }

    /// Finds an existing global slot or creates one, erroring past
    /// `MAX_GLOBALS` (mirrors `sym_index`).
    fn index(&mut self, name: &str) -> FunResult<usize> {
        if let Some(i) = self.names.iter().position(|n| n == name) {
            return Ok(i);
        }
        if self.names.len() >= MAX_GLOBALS {
            return Err(FunError::bounds(
                format!("Too many globals (max {})", MAX_GLOBALS),
                SourceLocation::unknown(),
            ));
        }
        self.names.push(name.to_string());
        self.types.push(0);
        Ok(self.names.len() - 1)
    }

    /// Looks up an existing global without creating a new symbol (used by
    /// `typeof(ident)` so that referencing an unknown name doesn't
    /// silently allocate a slot as a side effect of introspection).
    fn find(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

/// Per-function local table, swapped in around function/method/class
/// bodies the way `g_locals` is saved and restored around each body.
struct LocalScope {
    names: Vec<String>,
    types: Vec<i32>,
}

impl LocalScope {
    fn new() -> Self {
        Self { names: Vec::new(), types: Vec::new() }
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    fn add(&mut self, name: &str) -> FunResult<usize> {
        if self.names.len() >= MAX_FRAME_LOCALS {
            return Err(FunError::bounds(
                format!("Too many local variables/parameters (max {})", MAX_FRAME_LOCALS),
                SourceLocation::unknown(),
            ));
        }
        self.names.push(name.to_string());
        self.types.push(0);
        Ok(self.names.len() - 1)
    }
}

/// Where a resolved/declared variable lives: a local slot in the current
/// function body, or a global slot.
#[derive(Clone, Copy)]
enum Slot {
    Local(usize),
    Global(usize),
}

/// Chained loop context for `break`/`continue` back-patching. Unlike the
/// original's fixed 64-entry arrays, these lists are unbounded `Vec`s
/// (see DESIGN.md Open Questions) since nothing in the VM depends on a
/// cap here.
struct LoopCtx {
    break_jumps: Vec<usize>,
    continue_jumps: Vec<usize>,
}

impl LoopCtx {
    fn new() -> Self {
        Self { break_jumps: Vec::new(), continue_jumps: Vec::new() }
    }
}

/// The compiler. Walks `src` byte-by-byte (the language is ASCII-
/// oriented at the syntax level; string contents may still carry UTF-8),
/// emitting into whichever `Bytecode` is "current" — the outer program,
/// or a function/method/class-factory body being built on the side.
pub struct Compiler {
    src: Vec<u8>,
    pos: usize,
    source_file: Option<String>,
    globals: GlobalTable,
    locals: Option<LocalScope>,
    loop_stack: Vec<LoopCtx>,
    temp_counter: u32,
}

/// Compiles a whole program from a string, with an optional source-file
/// name for diagnostics (spec §3.1).
pub fn compile_string(src: &str, source_file: Option<String>) -> FunResult<Bytecode> {
    Compiler::new(src, source_file).compile_program()
}

pub fn compile_file(path: &str) -> FunResult<Bytecode> {
    let src = std::fs::read_to_string(path)
        .map_err(|e| FunError::resource(format!("cannot read file: {path}: {e}"), SourceLocation::unknown()))?;
    compile_string(&src, Some(path.to_string()))
}

impl Compiler {
    fn new(src: &str, source_file: Option<String>) -> Self {
        Self {
            src: src.as_bytes().to_vec(),
            pos: 0,
            source_file,
            globals: GlobalTable::new(),
            locals: None,
            loop_stack: Vec::new(),
            temp_counter: 0,
        }
    }

    // ---------------------------------------------------------------
    // Lexical helpers
    // ---------------------------------------------------------------

    fn at(&self, i: usize) -> u8 {
        if i < self.src.len() {
            self.src[i]
        } else {
            0
        }
    }

    fn cur(&self) -> u8 {
        self.at(self.pos)
    }

    fn eof(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn calc_line_col(&self, pos: usize) -> (usize, usize) {
        let mut line = 1usize;
        let mut col = 1usize;
        let limit = pos.min(self.src.len());
        for &b in &self.src[..limit] {
            if b == b'\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        (line, col)
    }

    fn loc(&self, pos: usize) -> SourceLocation {
        let (line, col) = self.calc_line_col(pos);
        match &self.source_file {
            Some(f) => SourceLocation::with_file(line, col, f.clone()),
            None => SourceLocation::new(line, col),
        }
    }

    fn fail(&self, pos: usize, msg: impl Into<String>) -> FunError {
        FunError::parse(msg.into(), self.loc(pos))
    }

    /// `skip_spaces`: spaces/tabs/CR only, no newlines.
    fn skip_spaces(&mut self) {
        while !self.eof() {
            match self.cur() {
                b' ' | b'\t' | b'\r' => self.pos += 1,
                _ => break,
            }
        }
    }

    /// `skip_ws`: also swallows newlines (used before the top-level block).
    fn skip_ws(&mut self) {
        while !self.eof() {
            match self.cur() {
                b' ' | b'\t' | b'\r' | b'\n' => self.pos += 1,
                _ => break,
            }
        }
    }

    fn skip_line(&mut self) {
        while !self.eof() && self.cur() != b'\n' {
            self.pos += 1;
        }
        if !self.eof() && self.cur() == b'\n' {
            self.pos += 1;
        }
    }

    fn skip_comments(&mut self) {
        loop {
            self.skip_ws();
            if self.cur() == b'/' && self.at(self.pos + 1) == b'/' {
                self.pos += 2;
                self.skip_line();
                continue;
            }
            if self.cur() == b'/' && self.at(self.pos + 1) == b'*' {
                self.pos += 2;
                while !self.eof() && !(self.cur() == b'*' && self.at(self.pos + 1) == b'/') {
                    self.pos += 1;
                }
                if !self.eof() {
                    self.pos += 2;
                }
                continue;
            }
            break;
        }
    }

    fn starts_with(&self, pos: usize, kw: &str) -> bool {
        let kb = kw.as_bytes();
        if pos + kb.len() > self.src.len() {
            return false;
        }
        &self.src[pos..pos + kb.len()] == kb
    }

    /// `starts_with` on a keyword also requires the next byte not
    /// continue an identifier, so `forever` isn't mistaken for `for`.
    fn starts_with_keyword(&self, pos: usize, kw: &str) -> bool {
        if !self.starts_with(pos, kw) {
            return false;
        }
        let after = pos + kw.len();
        !is_ident_continue(self.at(after))
    }

    fn skip_shebang_if_present(&mut self) {
        if self.pos == 0 && self.starts_with(0, "#!") {
            self.skip_line();
        }
    }

    fn consume_char(&mut self, expected: u8) -> bool {
        self.skip_spaces();
        if !self.eof() && self.cur() == expected {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn read_identifier(&mut self) -> Option<String> {
        let p = self.pos;
        if p < self.src.len() && is_ident_start(self.src[p]) {
            let start = p;
            let mut q = p + 1;
            while q < self.src.len() && is_ident_continue(self.src[q]) {
                q += 1;
            }
            self.pos = q;
            Some(String::from_utf8_lossy(&self.src[start..q]).into_owned())
        } else {
            None
        }
    }

    fn parse_int_literal(&mut self) -> Option<i64> {
        let save = self.pos;
        self.skip_spaces();
        let mut sign: i64 = 1;
        if !self.eof() && (self.cur() == b'+' || self.cur() == b'-') {
            if self.cur() == b'-' {
                sign = -1;
            }
            self.pos += 1;
        }
        if self.eof() || !self.cur().is_ascii_digit() {
            self.pos = save;
            return None;
        }
        let mut val: i64 = 0;
        while !self.eof() && self.cur().is_ascii_digit() {
            val = val.wrapping_mul(10).wrapping_add((self.cur() - b'0') as i64);
            self.pos += 1;
        }
        Some(sign * val)
    }

    /// Parses a single- or double-quoted string literal with the
    /// original's escape table: unknown escapes pass the escaped
    /// character through literally.
    fn parse_string_literal(&mut self) -> Option<String> {
        self.skip_spaces();
        if self.eof() {
            return None;
        }
        let quote = self.cur();
        if quote != b'"' && quote != b'\'' {
            return None;
        }
        self.pos += 1;
        let mut out = String::new();
        while !self.eof() {
            let c = self.cur();
            if c == quote {
                self.pos += 1;
                break;
            }
            if c == b'\\' {
                self.pos += 1;
                if self.eof() {
                    break;
                }
                let e = self.cur();
                let mapped = match e {
                    b'n' => '\n',
                    b'r' => '\r',
                    b't' => '\t',
                    b'\\' => '\\',
                    b'"' => '"',
                    b'\'' => '\'',
                    b'0' => '\0',
                    other => other as char,
                };
                out.push(mapped);
                self.pos += 1;
            } else {
                out.push(c as char);
                self.pos += 1;
            }
        }
        Some(out)
    }

    // ---------------------------------------------------------------
    // Symbol resolution
    // ---------------------------------------------------------------

    fn local_find(&self, name: &str) -> Option<usize> {
        self.locals.as_ref().and_then(|l| l.find(name))
    }

    /// Resolves `name` to a slot, creating a global if it doesn't exist
    /// in either scope (mirrors `sym_index` being called eagerly at
    /// statement/primary-identifier resolution time).
    fn resolve_or_create(&mut self, name: &str) -> FunResult<Slot> {
        if let Some(i) = self.local_find(name) {
            return Ok(Slot::Local(i));
        }
        let gi = self.globals.index(name)?;
        Ok(Slot::Global(gi))
    }

    /// Declares `name` as a local (if inside a function body) or global,
    /// reusing an existing slot of the same name (redeclare-updates-width
    /// semantics).
    fn declare(&mut self, name: &str) -> FunResult<Slot> {
        if self.locals.is_some() {
            let existing = self.local_find(name);
            let idx = match existing {
                Some(i) => i,
                None => self.locals.as_mut().unwrap().add(name)?,
            };
            Ok(Slot::Local(idx))
        } else {
            let gi = self.globals.index(name)?;
            Ok(Slot::Global(gi))
        }
    }

    fn set_decl_width(&mut self, slot: Slot, bits: i32) {
        match slot {
            Slot::Local(i) => {
                if let Some(l) = self.locals.as_mut() {
                    l.types[i] = bits;
                }
            }
            Slot::Global(i) => self.globals.types[i] = bits,
        }
    }

    fn decl_width(&self, slot: Slot) -> i32 {
        match slot {
            Slot::Local(i) => self.locals.as_ref().map(|l| l.types[i]).unwrap_or(0),
            Slot::Global(i) => self.globals.types[i],
        }
    }

    fn next_temp(&mut self, prefix: &str) -> String {
        let n = self.temp_counter;
        self.temp_counter += 1;
        format!("__{}_{}", prefix, n)
    }

    fn emit_load(&self, bc: &mut Bytecode, slot: Slot) {
        match slot {
            Slot::Local(i) => bc.emit(OpCode::LoadLocal, i as i32),
            Slot::Global(i) => bc.emit(OpCode::LoadGlobal, i as i32),
        };
    }

    fn emit_store(&self, bc: &mut Bytecode, slot: Slot) {
        match slot {
            Slot::Local(i) => bc.emit(OpCode::StoreLocal, i as i32),
            Slot::Global(i) => bc.emit(OpCode::StoreGlobal, i as i32),
        };
    }

    /// Declares a fresh temporary (local if inside a function body, else
    /// global) and stores the current top-of-stack value into it,
    /// returning the slot for later reloads.
    fn store_to_temp(&mut self, bc: &mut Bytecode, prefix: &str) -> FunResult<Slot> {
        let name = self.next_temp(prefix);
        let slot = self.declare(&name)?;
        self.emit_store(bc, slot);
        Ok(slot)
    }

    // ---------------------------------------------------------------
    // Entry point
    // ---------------------------------------------------------------

    fn compile_program(mut self) -> FunResult<Bytecode> {
        let mut bc = Bytecode::new(None, self.source_file.clone());
        self.skip_shebang_if_present();
        self.skip_comments();
        self.skip_ws();
        self.parse_block(&mut bc, 0)?;
        bc.emit(OpCode::Halt, 0);
        Ok(bc)
    }

    // ---------------------------------------------------------------
    // Indentation / line structure
    // ---------------------------------------------------------------

    /// Skips blank and comment-only lines, then reports the indent (in
    /// 2-space units) of the next code line. Returns `Ok(None)` at EOF.
    fn read_line_start(&mut self) -> FunResult<Option<usize>> {
        loop {
            if self.eof() {
                return Ok(None);
            }
            let p = self.pos;
            let mut spaces = 0usize;
            let mut q = p;
            while q < self.src.len() && self.src[q] == b' ' {
                spaces += 1;
                q += 1;
            }
            if q < self.src.len() && self.src[q] == b'\t' {
                return Err(self.fail(q, "Tabs are forbidden for indentation"));
            }
            if q >= self.src.len() {
                self.pos = q;
                return Ok(None);
            }
            if self.src[q] == b'\n' {
                self.pos = q + 1;
                continue;
            }
            if q + 1 < self.src.len() && self.src[q] == b'/' && self.src[q + 1] == b'/' {
                self.pos = q;
                self.skip_line();
                continue;
            }
            if q + 1 < self.src.len() && self.src[q] == b'/' && self.src[q + 1] == b'*' {
                let mut r = q + 2;
                while r + 1 < self.src.len() && !(self.src[r] == b'*' && self.src[r + 1] == b'/') {
                    r += 1;
                }
                if r + 1 < self.src.len() {
                    r += 2;
                }
                while r < self.src.len() && self.src[r] != b'\n' {
                    r += 1;
                }
                if r < self.src.len() && self.src[r] == b'\n' {
                    r += 1;
                }
                self.pos = r;
                continue;
            }
            if spaces % 2 != 0 {
                return Err(self.fail(q, "Indentation must be multiples of two spaces"));
            }
            self.pos = q;
            return Ok(Some(spaces / 2));
        }
    }

    /// Peeks the indent of the next line without consuming it.
    fn peek_indent(&mut self) -> FunResult<Option<usize>> {
        let save = self.pos;
        let r = self.read_line_start();
        self.pos = save;
        r
    }

    /// Consumes trailing spaces/comments until end of line; anything
    /// else is trailing garbage.
    fn skip_to_eol(&mut self) -> FunResult<()> {
        loop {
            while !self.eof() && self.cur() == b' ' {
                self.pos += 1;
            }
            if self.eof() {
                return Ok(());
            }
            if self.cur() == b'\n' {
                self.pos += 1;
                return Ok(());
            }
            if self.cur() == b'/' && self.at(self.pos + 1) == b'/' {
                self.skip_line();
                return Ok(());
            }
            if self.cur() == b'/' && self.at(self.pos + 1) == b'*' {
                self.pos += 2;
                while !self.eof() && !(self.cur() == b'*' && self.at(self.pos + 1) == b'/') {
                    self.pos += 1;
                }
                if self.eof() {
                    return Err(self.fail(self.pos, "Unterminated block comment at end of file"));
                }
                self.pos += 2;
                continue;
            }
            return Err(self.fail(self.pos, "Unexpected trailing characters at end of line"));
        }
    }

    /// Parses a block of statements at `current_indent`, returning
    /// control to the caller on a dedent (or EOF). A line indented
    /// deeper than expected with no governing header is tolerated by
    /// recursing into it (mirrors the original's "nested block without
    /// a header" fallback).
    fn parse_block(&mut self, bc: &mut Bytecode, current_indent: usize) -> FunResult<()> {
        loop {
            let line_start = self.pos;
            let indent = match self.read_line_start()? {
                Some(i) => i,
                None => return Ok(()),
            };
            if indent < current_indent {
                self.pos = line_start;
                return Ok(());
            }
            if indent > current_indent {
                self.parse_block(bc, indent)?;
                continue;
            }

            let (line, _) = self.calc_line_col(line_start);
            bc.emit(OpCode::Line, line as i32);

            if self.starts_with_keyword(self.pos, "class") {
                self.compile_class(bc, current_indent)?;
                continue;
            }
            if self.starts_with_keyword(self.pos, "fun") {
                self.compile_fun_def(bc, current_indent)?;
                continue;
            }
            if self.starts_with_keyword(self.pos, "for") {
                self.compile_for(bc, current_indent)?;
                continue;
            }
            if self.starts_with_keyword(self.pos, "if") {
                self.compile_if(bc, current_indent)?;
                continue;
            }
            if self.starts_with_keyword(self.pos, "while") {
                self.compile_while(bc, current_indent)?;
                continue;
            }

            self.parse_simple_statement(bc)?;
        }
    }

    // ---------------------------------------------------------------
    // Simple (single-line) statements
    // ---------------------------------------------------------------

    fn parse_simple_statement(&mut self, bc: &mut Bytecode) -> FunResult<()> {
        let stmt_start = self.pos;
        let mut local_pos = self.pos;
        let name = {
            let save = self.pos;
            self.pos = local_pos;
            let n = self.read_identifier();
            local_pos = self.pos;
            self.pos = save;
            n
        };

        let Some(mut name) = name else {
            return Err(self.fail(self.pos, "Unknown token at start of statement"));
        };

        // sint* aliases to int*
        name = match name.as_str() {
            "sint8" => "int8".to_string(),
            "sint16" => "int16".to_string(),
            "sint32" => "int32".to_string(),
            "sint64" => "int64".to_string(),
            other => other.to_string(),
        };

        if name == "return" {
            self.pos = local_pos;
            self.skip_spaces();
            let save = self.pos;
            if !self.try_expression(bc)? {
                self.pos = save;
                let ci = bc.add_constant(Value::Nil);
                bc.emit(OpCode::LoadConst, ci as i32);
            }
            bc.emit(OpCode::Return, 0);
            self.skip_to_eol()?;
            return Ok(());
        }

        if name == "break" {
            self.pos = local_pos;
            if self.loop_stack.is_empty() {
                return Err(self.fail(local_pos, "break used outside of loop"));
            }
            let j = bc.emit(OpCode::Jump, 0);
            self.loop_stack.last_mut().unwrap().break_jumps.push(j);
            self.skip_to_eol()?;
            return Ok(());
        }

        if name == "continue" {
            self.pos = local_pos;
            if self.loop_stack.is_empty() {
                return Err(self.fail(local_pos, "continue used outside of loop"));
            }
            let j = bc.emit(OpCode::Jump, 0);
            self.loop_stack.last_mut().unwrap().continue_jumps.push(j);
            self.skip_to_eol()?;
            return Ok(());
        }

        if let Some((decl_bits, is_string, is_nil, is_boolean)) = type_keyword_info(&name) {
            self.pos = local_pos;
            self.compile_typed_decl(bc, decl_bits, is_string, is_nil, is_boolean)?;
            return Ok(());
        }

        if name == "print" {
            self.pos = local_pos;
            self.skip_spaces();
            self.consume_char(b'(');
            if self.try_expression(bc)? {
                self.consume_char(b')');
                bc.emit(OpCode::Print, 0);
            } else {
                self.consume_char(b')');
            }
            self.skip_to_eol()?;
            return Ok(());
        }

        // Assignment / call dispatch: eagerly resolve the symbol now.
        let slot = self.resolve_or_create(&name)?;
        self.pos = local_pos;
        self.skip_spaces();

        // obj.field = expr, or obj.method(...) as an expression statement.
        if !self.eof() && self.cur() == b'.' {
            let look_start = self.pos + 1;
            let mut look = look_start;
            self.skip_spaces_at(&mut look);
            let save = self.pos;
            self.pos = look;
            let fname = self.read_identifier();
            look = self.pos;
            self.pos = save;

            let Some(fname) = fname else {
                return Err(self.fail(look, "Expected field name after '.'"));
            };
            self.skip_spaces_at(&mut look);
            if look >= self.src.len() || self.src[look] != b'=' {
                // Not an assignment: rewind to statement start, compile as
                // a general expression statement.
                self.pos = stmt_start;
                if self.try_expression(bc)? {
                    bc.emit(OpCode::Pop, 0);
                }
                self.skip_to_eol()?;
                return Ok(());
            }

            self.emit_load(bc, slot);
            let kci = bc.add_constant(Value::Str(fname));
            bc.emit(OpCode::LoadConst, kci as i32);
            self.pos = look + 1;
            self.compile_expression(bc)?;
            bc.emit(OpCode::IndexSet, 0);
            self.skip_to_eol()?;
            return Ok(());
        }

        // name[expr] = value, or name[expr1][expr2] = value.
        if !self.eof() && self.cur() == b'[' {
            self.emit_load(bc, slot);
            self.pos += 1;
            self.compile_expression(bc)?;
            if !self.consume_char(b']') {
                return Err(self.fail(self.pos, "Expected ']' after index"));
            }
            self.skip_spaces();

            if !self.eof() && self.cur() == b'[' {
                bc.emit(OpCode::IndexGet, 0);
                self.pos += 1;
                self.compile_expression(bc)?;
                if !self.consume_char(b']') {
                    return Err(self.fail(self.pos, "Expected ']' after nested index"));
                }
                self.skip_spaces();
                if self.eof() || self.cur() != b'=' {
                    return Err(self.fail(self.pos, "Expected '=' after nested array index"));
                }
                self.pos += 1;
                self.compile_expression(bc)?;
                bc.emit(OpCode::IndexSet, 0);
                self.skip_to_eol()?;
                return Ok(());
            }

            if self.eof() || self.cur() != b'=' {
                return Err(self.fail(self.pos, "Expected '=' after array index"));
            }
            self.pos += 1;
            self.compile_expression(bc)?;
            bc.emit(OpCode::IndexSet, 0);
            self.skip_to_eol()?;
            return Ok(());
        }

        if !self.eof() && self.cur() == b'=' {
            self.pos += 1;
            if self.try_expression(bc)? {
                let bits = self.decl_width(slot);
                self.emit_clamp(bc, bits);
                self.emit_store(bc, slot);
            }
            self.skip_to_eol()?;
            return Ok(());
        }

        if !self.eof() && self.cur() == b'(' {
            self.pos = stmt_start;
            if self.try_expression(bc)? {
                bc.emit(OpCode::Pop, 0);
            }
            self.skip_to_eol()?;
            return Ok(());
        }

        Err(self.fail(self.pos, "Expected assignment '=' or call '(...)' after identifier"))
    }

    fn skip_spaces_at(&self, p: &mut usize) {
        while *p < self.src.len() {
            match self.src[*p] {
                b' ' | b'\t' | b'\r' => *p += 1,
                _ => break,
            }
        }
    }

    /// Emits `SCLAMP`/`UCLAMP` if `decl_bits` encodes an integer width
    /// (negative = signed, positive = unsigned, 0 = none).
    fn emit_clamp(&self, bc: &mut Bytecode, decl_bits: i32) {
        let abs_bits = decl_bits.abs();
        if abs_bits > 0 {
            let op = if decl_bits < 0 { OpCode::Sclamp } else { OpCode::Uclamp };
            bc.emit(op, abs_bits);
        }
    }

    fn compile_typed_decl(
        &mut self,
        bc: &mut Bytecode,
        decl_bits: i32,
        is_string: bool,
        is_nil: bool,
        is_boolean_or_number: bool,
    ) -> FunResult<()> {
        // consume the type keyword
        self.read_identifier();
        self.skip_spaces();
        let Some(varname) = self.read_identifier() else {
            return Err(self.fail(self.pos, "Expected identifier after type declaration"));
        };
        let slot = self.declare(&varname)?;
        self.set_decl_width(slot, decl_bits);

        self.skip_spaces();
        if !self.eof() && self.cur() == b'=' {
            self.pos += 1;
            if !self.try_expression(bc)? {
                return Err(self.fail(self.pos, "Expected initializer expression after '='"));
            }
            self.emit_clamp(bc, decl_bits);
            self.emit_store(bc, slot);
        } else {
            // default value per declared type
            let ci = if is_string {
                Some(bc.add_constant(Value::Str(String::new())))
            } else if is_nil {
                Some(bc.add_constant(Value::Nil))
            } else if is_boolean_or_number || decl_bits != 0 {
                Some(bc.add_constant(Value::Int(0)))
            } else {
                None
            };
            if let Some(ci) = ci {
                bc.emit(OpCode::LoadConst, ci as i32);
                self.emit_clamp(bc, decl_bits);
                self.emit_store(bc, slot);
            }
        }
        self.skip_to_eol()
    }

    // ---------------------------------------------------------------
    // Control flow
    // ---------------------------------------------------------------

    fn compile_if(&mut self, bc: &mut Bytecode, current_indent: usize) -> FunResult<()> {
        let mut end_jumps = Vec::new();
        loop {
            if self.starts_with_keyword(self.pos, "if") {
                self.pos += 2;
            }
            self.skip_spaces();
            if !self.try_expression(bc)? {
                let ci = bc.add_constant(Value::Int(0));
                bc.emit(OpCode::LoadConst, ci as i32);
            }
            self.skip_to_eol()?;

            let jmp_false = bc.emit(OpCode::JumpIfFalse, -1);

            if let Some(next_indent) = self.peek_indent()? {
                if next_indent > current_indent {
                    self.parse_block(bc, next_indent)?;
                }
            }

            let jmp_end = bc.emit(OpCode::Jump, -1);
            end_jumps.push(jmp_end);
            bc.patch_operand(jmp_false, bc.next_index() as i32);

            let look_save = self.pos;
            let look_indent = self.peek_indent()?;
            match look_indent {
                None => break,
                Some(li) if li != current_indent => {
                    self.pos = look_save;
                    break;
                }
                _ => {}
            }
            // consume the line start for real now
            self.read_line_start()?;
            if self.starts_with_keyword(self.pos, "else") {
                self.pos += 4;
                self.skip_spaces();
                if self.starts_with_keyword(self.pos, "if") {
                    self.pos += 2;
                    continue;
                } else {
                    self.skip_to_eol()?;
                    if let Some(else_indent) = self.peek_indent()? {
                        if else_indent > current_indent {
                            self.parse_block(bc, else_indent)?;
                        }
                    }
                    break;
                }
            } else {
                self.pos = look_save;
                break;
            }
        }
        for j in end_jumps {
            bc.patch_operand(j, bc.next_index() as i32);
        }
        Ok(())
    }

    fn compile_while(&mut self, bc: &mut Bytecode, current_indent: usize) -> FunResult<()> {
        self.pos += 5; // 'while'
        self.skip_spaces();

        let loop_start = bc.next_index();
        if !self.try_expression(bc)? {
            let ci = bc.add_constant(Value::Int(0));
            bc.emit(OpCode::LoadConst, ci as i32);
        }
        self.skip_to_eol()?;

        let jmp_false = bc.emit(OpCode::JumpIfFalse, -1);

        self.loop_stack.push(LoopCtx::new());
        if let Some(body_indent) = self.peek_indent()? {
            if body_indent > current_indent {
                self.parse_block(bc, body_indent)?;
            }
        }
        let ctx = self.loop_stack.pop().unwrap();
        for j in &ctx.continue_jumps {
            bc.patch_operand(*j, loop_start as i32);
        }

        bc.emit(OpCode::Jump, loop_start as i32);
        let end_label = bc.next_index() as i32;
        bc.patch_operand(jmp_false, end_label);
        for j in &ctx.break_jumps {
            bc.patch_operand(*j, end_label);
        }
        Ok(())
    }

    fn compile_for(&mut self, bc: &mut Bytecode, current_indent: usize) -> FunResult<()> {
        self.pos += 3; // 'for'
        self.skip_spaces();
        let Some(ivar) = self.read_identifier() else {
            return Err(self.fail(self.pos, "Expected loop variable after 'for'"));
        };
        self.skip_spaces();
        if !self.starts_with_keyword(self.pos, "in") {
            return Err(self.fail(self.pos, "Expected 'in' after loop variable"));
        }
        self.pos += 2;
        self.skip_spaces();

        if self.starts_with_keyword(self.pos, "range") {
            self.compile_for_range(bc, current_indent, &ivar)
        } else {
            self.compile_for_array(bc, current_indent, &ivar)
        }
    }

    fn compile_for_range(&mut self, bc: &mut Bytecode, current_indent: usize, ivar: &str) -> FunResult<()> {
        self.pos += 5; // 'range'
        if !self.consume_char(b'(') {
            return Err(self.fail(self.pos, "Expected '(' after range"));
        }
        self.compile_expression(bc)?;
        let ivar_slot = self.declare(ivar)?;
        self.emit_store(bc, ivar_slot);

        self.skip_spaces();
        if self.eof() || self.cur() != b',' {
            return Err(self.fail(self.pos, "Expected ',' between range start and end"));
        }
        self.pos += 1;
        self.skip_spaces();
        self.compile_expression(bc)?;
        let end_slot = self.store_to_temp(bc, "for_end")?;

        if !self.consume_char(b')') {
            return Err(self.fail(self.pos, "Expected ')' after range arguments"));
        }
        self.skip_to_eol()?;

        let loop_start = bc.next_index();
        self.emit_load(bc, ivar_slot);
        self.emit_load(bc, end_slot);
        bc.emit(OpCode::Lt, 0);
        let jmp_false = bc.emit(OpCode::JumpIfFalse, -1);

        self.loop_stack.push(LoopCtx::new());
        if let Some(body_indent) = self.peek_indent()? {
            if body_indent > current_indent {
                self.parse_block(bc, body_indent)?;
            }
        }
        let ctx = self.loop_stack.pop().unwrap();

        let cont_label = bc.next_index();
        let c1 = bc.add_constant(Value::Int(1));
        self.emit_load(bc, ivar_slot);
        bc.emit(OpCode::LoadConst, c1 as i32);
        bc.emit(OpCode::Add, 0);
        self.emit_store(bc, ivar_slot);

        bc.emit(OpCode::Jump, loop_start as i32);
        let end_label = bc.next_index() as i32;
        bc.patch_operand(jmp_false, end_label);
        for j in &ctx.continue_jumps {
            bc.patch_operand(*j, cont_label as i32);
        }
        for j in &ctx.break_jumps {
            bc.patch_operand(*j, end_label);
        }
        Ok(())
    }

    fn compile_for_array(&mut self, bc: &mut Bytecode, current_indent: usize, ivar: &str) -> FunResult<()> {
        self.compile_expression(bc)?;
        let arr_slot = self.store_to_temp(bc, "for_arr")?;

        self.emit_load(bc, arr_slot);
        bc.emit(OpCode::Len, 0);
        let len_slot = self.store_to_temp(bc, "for_len")?;

        let c0 = bc.add_constant(Value::Int(0));
        bc.emit(OpCode::LoadConst, c0 as i32);
        let i_slot = self.store_to_temp(bc, "for_i")?;

        self.skip_to_eol()?;

        let loop_start = bc.next_index();
        self.emit_load(bc, i_slot);
        self.emit_load(bc, len_slot);
        bc.emit(OpCode::Lt, 0);
        let jmp_false = bc.emit(OpCode::JumpIfFalse, -1);

        self.emit_load(bc, arr_slot);
        self.emit_load(bc, i_slot);
        bc.emit(OpCode::IndexGet, 0);
        let ivar_slot = self.declare(ivar)?;
        self.emit_store(bc, ivar_slot);

        self.loop_stack.push(LoopCtx::new());
        if let Some(body_indent) = self.peek_indent()? {
            if body_indent > current_indent {
                self.parse_block(bc, body_indent)?;
            }
        }
        let ctx = self.loop_stack.pop().unwrap();

        let cont_label = bc.next_index();
        let c1 = bc.add_constant(Value::Int(1));
        self.emit_load(bc, i_slot);
        bc.emit(OpCode::LoadConst, c1 as i32);
        bc.emit(OpCode::Add, 0);
        self.emit_store(bc, i_slot);

        bc.emit(OpCode::Jump, loop_start as i32);
        let end_label = bc.next_index() as i32;
        bc.patch_operand(jmp_false, end_label);
        for j in &ctx.continue_jumps {
            bc.patch_operand(*j, cont_label as i32);
        }
        for j in &ctx.break_jumps {
            bc.patch_operand(*j, end_label);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Function / class definitions
    // ---------------------------------------------------------------

    fn compile_fun_def(&mut self, bc: &mut Bytecode, current_indent: usize) -> FunResult<()> {
        self.pos += 3; // 'fun'
        self.skip_spaces();
        let Some(fname) = self.read_identifier() else {
            return Err(self.fail(self.pos, "Expected function name after 'fun'"));
        };
        let fgi = self.globals.index(&fname)?;
        self.skip_spaces();
        if !self.consume_char(b'(') {
            return Err(self.fail(self.pos, "Expected '(' after function name"));
        }

        let prev_locals = self.locals.take();
        self.locals = Some(LocalScope::new());

        let mut param_names = Vec::new();
        self.skip_spaces();
        if self.eof() || self.cur() != b')' {
            loop {
                let Some(pname) = self.read_identifier() else {
                    self.locals = prev_locals;
                    return Err(self.fail(self.pos, "Expected parameter name"));
                };
                if self.local_find(&pname).is_some() {
                    self.locals = prev_locals;
                    return Err(self.fail(self.pos, format!("Duplicate parameter name '{}'", pname)));
                }
                self.locals.as_mut().unwrap().add(&pname)?;
                param_names.push(pname);
                self.skip_spaces();
                if !self.eof() && self.cur() == b',' {
                    self.pos += 1;
                    self.skip_spaces();
                    continue;
                }
                break;
            }
        }
        if !self.consume_char(b')') {
            self.locals = prev_locals;
            return Err(self.fail(self.pos, "Expected ')' after parameter list"));
        }
        self.skip_to_eol()?;

        let mut fn_bc = Bytecode::new(Some(fname.clone()), self.source_file.clone());
        fn_bc.param_count = param_names.len();

        if let Some(body_indent) = self.peek_indent()? {
            if body_indent > current_indent {
                self.parse_block(&mut fn_bc, body_indent)?;
            }
        }
        fn_bc.emit(OpCode::Return, 0);

        self.locals = prev_locals;

        let fci = bc.add_constant(Value::Function(std::rc::Rc::new(fn_bc)));
        bc.emit(OpCode::LoadConst, fci as i32);
        bc.emit(OpCode::StoreGlobal, fgi as i32);
        Ok(())
    }

    fn compile_class(&mut self, bc: &mut Bytecode, current_indent: usize) -> FunResult<()> {
        self.pos += 5; // 'class'
        self.skip_spaces();
        let Some(cname) = self.read_identifier() else {
            return Err(self.fail(self.pos, "Expected class name after 'class'"));
        };
        let cgi = self.globals.index(&cname)?;

        let mut param_names: Vec<String> = Vec::new();
        let mut param_kind: Vec<u8> = Vec::new();

        self.skip_spaces();
        if !self.eof() && self.cur() == b'(' {
            self.pos += 1;
            self.skip_spaces();
            if !self.eof() && self.cur() != b')' {
                loop {
                    let Some(tname) = self.read_identifier() else {
                        return Err(self.fail(self.pos, "Expected type in class parameter list"));
                    };
                    self.skip_spaces();
                    let Some(pname) = self.read_identifier() else {
                        return Err(self.fail(self.pos, "Expected parameter name after type"));
                    };
                    param_kind.push(map_type_kind(&tname));
                    param_names.push(pname);
                    self.skip_spaces();
                    if !self.eof() && self.cur() == b',' {
                        self.pos += 1;
                        self.skip_spaces();
                        continue;
                    }
                    break;
                }
            }
            if !self.consume_char(b')') {
                return Err(self.fail(self.pos, "Expected ')' after class parameter list"));
            }
        }
        self.skip_to_eol()?;

        let mut ctor_bc = Bytecode::new(Some(cname.clone()), self.source_file.clone());
        ctor_bc.param_count = param_names.len();
        let prev_locals = self.locals.take();
        self.locals = Some(LocalScope::new());

        for pname in &param_names {
            self.locals.as_mut().unwrap().add(pname)?;
        }
        let l_extra = self.locals.as_mut().unwrap().add("__extra")?;

        for (i, pname) in param_names.iter().enumerate() {
            ctor_bc.emit(OpCode::LoadLocal, i as i32);
            ctor_bc.emit(OpCode::Typeof, 0);
            let ci_nil = ctor_bc.add_constant(Value::Str("Nil".to_string()));
            ctor_bc.emit(OpCode::LoadConst, ci_nil as i32);
            ctor_bc.emit(OpCode::Eq, 0);
            let j_ok_present = ctor_bc.emit(OpCode::JumpIfFalse, -1);
            let msg = format!("TypeError: missing argument '{}' in {}()", pname, cname);
            let ci_msg = ctor_bc.add_constant(Value::Str(msg));
            ctor_bc.emit(OpCode::LoadConst, ci_msg as i32);
            ctor_bc.emit(OpCode::Print, 0);
            ctor_bc.emit(OpCode::Halt, 0);
            ctor_bc.patch_operand(j_ok_present, ctor_bc.next_index() as i32);

            let kind = param_kind[i];
            if kind == 1 || kind == 2 || kind == 3 {
                ctor_bc.emit(OpCode::LoadLocal, i as i32);
                ctor_bc.emit(OpCode::Typeof, 0);
                let exp = match kind {
                    1 => "Number",
                    2 => "String",
                    _ => "Nil",
                };
                let ci_exp = ctor_bc.add_constant(Value::Str(exp.to_string()));
                ctor_bc.emit(OpCode::LoadConst, ci_exp as i32);
                ctor_bc.emit(OpCode::Eq, 0);
                let j_to_error = ctor_bc.emit(OpCode::JumpIfFalse, -1);
                let j_skip_err = ctor_bc.emit(OpCode::Jump, -1);
                ctor_bc.patch_operand(j_to_error, ctor_bc.next_index() as i32);
                let msg2 = format!("TypeError: {}() expects {} for '{}'", cname, exp, pname);
                let ci_msg2 = ctor_bc.add_constant(Value::Str(msg2));
                ctor_bc.emit(OpCode::LoadConst, ci_msg2 as i32);
                ctor_bc.emit(OpCode::Print, 0);
                ctor_bc.emit(OpCode::Halt, 0);
                ctor_bc.patch_operand(j_skip_err, ctor_bc.next_index() as i32);
            }
        }

        {
            ctor_bc.emit(OpCode::LoadLocal, l_extra as i32);
            ctor_bc.emit(OpCode::Typeof, 0);
            let ci_nil2 = ctor_bc.add_constant(Value::Str("Nil".to_string()));
            ctor_bc.emit(OpCode::LoadConst, ci_nil2 as i32);
            ctor_bc.emit(OpCode::Eq, 0);
            let j_to_error = ctor_bc.emit(OpCode::JumpIfFalse, -1);
            let j_skip_err = ctor_bc.emit(OpCode::Jump, -1);
            ctor_bc.patch_operand(j_to_error, ctor_bc.next_index() as i32);
            let msg3 = format!("TypeError: {}() received too many arguments", cname);
            let ci_msg3 = ctor_bc.add_constant(Value::Str(msg3));
            ctor_bc.emit(OpCode::LoadConst, ci_msg3 as i32);
            ctor_bc.emit(OpCode::Print, 0);
            ctor_bc.emit(OpCode::Halt, 0);
            ctor_bc.patch_operand(j_skip_err, ctor_bc.next_index() as i32);
        }

        let l_this = self.locals.as_mut().unwrap().add("__this")?;
        ctor_bc.emit(OpCode::MakeMap, 0);
        ctor_bc.emit(OpCode::StoreLocal, l_this as i32);

        if let Some(body_indent) = self.peek_indent()? {
            if body_indent > current_indent {
                loop {
                    let member_line_start = self.pos;
                    let member_indent = match self.read_line_start()? {
                        Some(i) => i,
                        None => break,
                    };
                    if member_indent < body_indent {
                        self.pos = member_line_start;
                        break;
                    }
                    if member_indent > body_indent {
                        self.parse_block(&mut ctor_bc, member_indent)?;
                        continue;
                    }

                    if self.starts_with_keyword(self.pos, "fun") {
                        self.compile_class_method(&mut ctor_bc, l_this, body_indent)?;
                        continue;
                    }

                    let Some(fname) = self.read_identifier() else {
                        self.locals = prev_locals;
                        return Err(self.fail(self.pos, "Expected field or 'fun' in class body"));
                    };
                    let mut tmp = self.pos;
                    self.skip_spaces_at(&mut tmp);
                    if tmp >= self.src.len() || self.src[tmp] != b'=' {
                        self.locals = prev_locals;
                        return Err(self.fail(tmp, "Expected '=' in field initializer"));
                    }
                    self.pos = tmp + 1;
                    ctor_bc.emit(OpCode::LoadLocal, l_this as i32);
                    let fkey = ctor_bc.add_constant(Value::Str(fname));
                    ctor_bc.emit(OpCode::LoadConst, fkey as i32);
                    self.compile_expression(&mut ctor_bc)?;
                    ctor_bc.emit(OpCode::IndexSet, 0);
                    self.skip_to_eol()?;
                }
            }
        }

        for (i, pname) in param_names.iter().enumerate() {
            ctor_bc.emit(OpCode::LoadLocal, l_this as i32);
            let kci = ctor_bc.add_constant(Value::Str(pname.clone()));
            ctor_bc.emit(OpCode::LoadConst, kci as i32);
            ctor_bc.emit(OpCode::LoadLocal, i as i32);
            ctor_bc.emit(OpCode::IndexSet, 0);
        }

        ctor_bc.emit(OpCode::LoadLocal, l_this as i32);
        ctor_bc.emit(OpCode::Return, 0);

        self.locals = prev_locals;

        let cci = bc.add_constant(Value::Function(std::rc::Rc::new(ctor_bc)));
        bc.emit(OpCode::LoadConst, cci as i32);
        bc.emit(OpCode::StoreGlobal, cgi as i32);
        Ok(())
    }

    fn compile_class_method(&mut self, ctor_bc: &mut Bytecode, l_this: usize, body_indent: usize) -> FunResult<()> {
        self.pos += 3; // 'fun'
        self.skip_spaces();
        let Some(mname) = self.read_identifier() else {
            return Err(self.fail(self.pos, "Expected method name after 'fun' in class"));
        };
        self.skip_spaces();
        if !self.consume_char(b'(') {
            return Err(self.fail(self.pos, "Expected '(' after method name"));
        }

        let saved = self.locals.take();
        self.locals = Some(LocalScope::new());

        let mut param_count = 0usize;
        self.skip_spaces();
        if !self.eof() && self.cur() != b')' {
            loop {
                let Some(pname) = self.read_identifier() else {
                    self.locals = saved;
                    return Err(self.fail(self.pos, "Expected parameter name"));
                };
                if param_count == 0 && pname != "this" {
                    self.locals = saved;
                    return Err(self.fail(self.pos, "First parameter of a method must be 'this'"));
                }
                self.locals.as_mut().unwrap().add(&pname)?;
                param_count += 1;
                self.skip_spaces();
                if !self.eof() && self.cur() == b',' {
                    self.pos += 1;
                    self.skip_spaces();
                    continue;
                }
                break;
            }
        } else {
            self.locals = saved;
            return Err(self.fail(self.pos, "Method must declare at least 'this' parameter"));
        }

        if !self.consume_char(b')') {
            self.locals = saved;
            return Err(self.fail(self.pos, "Expected ')' after method parameter list"));
        }
        self.skip_to_eol()?;

        let mut m_bc = Bytecode::new(Some(mname.clone()), self.source_file.clone());
        m_bc.param_count = param_count;
        if let Some(m_body_indent) = self.peek_indent()? {
            if m_body_indent > body_indent {
                self.parse_block(&mut m_bc, m_body_indent)?;
            }
        }
        m_bc.emit(OpCode::Return, 0);

        self.locals = saved;

        ctor_bc.emit(OpCode::LoadLocal, l_this as i32);
        let kci = ctor_bc.add_constant(Value::Str(mname));
        ctor_bc.emit(OpCode::LoadConst, kci as i32);
        let mci = ctor_bc.add_constant(Value::Function(std::rc::Rc::new(m_bc)));
        ctor_bc.emit(OpCode::LoadConst, mci as i32);
        ctor_bc.emit(OpCode::IndexSet, 0);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------

    /// Attempts to compile an expression, rewinding `self.pos` on
    /// failure (used everywhere the grammar needs an optional/probing
    /// expression parse, mirroring the original's save-pos-then-retry
    /// idiom).
    fn try_expression(&mut self, bc: &mut Bytecode) -> FunResult<bool> {
        let save = self.pos;
        match self.compile_expression(bc) {
            Ok(()) => Ok(true),
            Err(_) => {
                self.pos = save;
                Ok(false)
            }
        }
    }

    fn compile_expression(&mut self, bc: &mut Bytecode) -> FunResult<()> {
        self.compile_or(bc)
    }

    fn compile_or(&mut self, bc: &mut Bytecode) -> FunResult<()> {
        self.compile_and(bc)?;
        let mut true_jumps = Vec::new();
        let mut has_or = false;
        loop {
            self.skip_spaces();
            if !(self.cur() == b'|' && self.at(self.pos + 1) == b'|') {
                break;
            }
            self.pos += 2;
            has_or = true;

            let jf_proceed = bc.emit(OpCode::JumpIfFalse, -1);
            let c1 = bc.add_constant(Value::Int(1));
            bc.emit(OpCode::LoadConst, c1 as i32);
            true_jumps.push(bc.emit(OpCode::Jump, -1));
            bc.patch_operand(jf_proceed, bc.next_index() as i32);

            self.compile_and(bc)?;
        }
        if has_or {
            let jf_last = bc.emit(OpCode::JumpIfFalse, -1);
            let c1 = bc.add_constant(Value::Int(1));
            bc.emit(OpCode::LoadConst, c1 as i32);
            let j_end_single = bc.emit(OpCode::Jump, -1);

            let l_false = bc.next_index() as i32;
            bc.patch_operand(jf_last, l_false);
            let c0 = bc.add_constant(Value::Int(0));
            bc.emit(OpCode::LoadConst, c0 as i32);

            let l_end = bc.next_index() as i32;
            bc.patch_operand(j_end_single, l_end);
            for j in true_jumps {
                bc.patch_operand(j, l_end);
            }
        }
        Ok(())
    }

    fn compile_and(&mut self, bc: &mut Bytecode) -> FunResult<()> {
        self.compile_equality(bc)?;
        let mut jf_idxs = Vec::new();
        let mut has_and = false;
        loop {
            self.skip_spaces();
            if !(self.cur() == b'&' && self.at(self.pos + 1) == b'&') {
                break;
            }
            self.pos += 2;
            has_and = true;
            jf_idxs.push(bc.emit(OpCode::JumpIfFalse, -1));
            self.compile_equality(bc)?;
        }
        if has_and {
            jf_idxs.push(bc.emit(OpCode::JumpIfFalse, -1));
            let c1 = bc.add_constant(Value::Int(1));
            bc.emit(OpCode::LoadConst, c1 as i32);
            let j_end = bc.emit(OpCode::Jump, -1);

            let l_false = bc.next_index() as i32;
            for j in &jf_idxs {
                bc.patch_operand(*j, l_false);
            }
            let c0 = bc.add_constant(Value::Int(0));
            bc.emit(OpCode::LoadConst, c0 as i32);

            let l_end = bc.next_index() as i32;
            bc.patch_operand(j_end, l_end);
        }
        Ok(())
    }

    fn compile_equality(&mut self, bc: &mut Bytecode) -> FunResult<()> {
        self.compile_relational(bc)?;
        loop {
            self.skip_spaces();
            if self.cur() == b'=' && self.at(self.pos + 1) == b'=' {
                self.pos += 2;
                self.compile_relational(bc)?;
                bc.emit(OpCode::Eq, 0);
                continue;
            }
            if self.cur() == b'!' && self.at(self.pos + 1) == b'=' {
                self.pos += 2;
                self.compile_relational(bc)?;
                bc.emit(OpCode::Neq, 0);
                continue;
            }
            break;
        }
        Ok(())
    }

    fn compile_relational(&mut self, bc: &mut Bytecode) -> FunResult<()> {
        self.compile_additive(bc)?;
        loop {
            self.skip_spaces();
            if self.cur() == b'<' && self.at(self.pos + 1) == b'=' {
                self.pos += 2;
                self.compile_additive(bc)?;
                bc.emit(OpCode::Lte, 0);
                continue;
            }
            if self.cur() == b'>' && self.at(self.pos + 1) == b'=' {
                self.pos += 2;
                self.compile_additive(bc)?;
                bc.emit(OpCode::Gte, 0);
                continue;
            }
            if self.cur() == b'<' {
                self.pos += 1;
                self.compile_additive(bc)?;
                bc.emit(OpCode::Lt, 0);
                continue;
            }
            if self.cur() == b'>' {
                self.pos += 1;
                self.compile_additive(bc)?;
                bc.emit(OpCode::Gt, 0);
                continue;
            }
            break;
        }
        Ok(())
    }

    fn compile_additive(&mut self, bc: &mut Bytecode) -> FunResult<()> {
        self.compile_multiplicative(bc)?;
        loop {
            self.skip_spaces();
            if self.cur() == b'+' {
                self.pos += 1;
                self.compile_multiplicative(bc)?;
                bc.emit(OpCode::Add, 0);
                continue;
            }
            if self.cur() == b'-' {
                self.pos += 1;
                self.compile_multiplicative(bc)?;
                bc.emit(OpCode::Sub, 0);
                continue;
            }
            break;
        }
        Ok(())
    }

    fn compile_multiplicative(&mut self, bc: &mut Bytecode) -> FunResult<()> {
        self.compile_unary(bc)?;
        loop {
            self.skip_spaces();
            if self.cur() == b'/' && self.at(self.pos + 1) == b'/' {
                break;
            }
            if self.cur() == b'/' && self.at(self.pos + 1) == b'*' {
                self.pos += 2;
                while !self.eof() && !(self.cur() == b'*' && self.at(self.pos + 1) == b'/') {
                    self.pos += 1;
                }
                if !self.eof() {
                    self.pos += 2;
                }
                continue;
            }
            if self.cur() == b'*' {
                self.pos += 1;
                self.compile_unary(bc)?;
                bc.emit(OpCode::Mul, 0);
                continue;
            }
            if self.cur() == b'/' {
                self.pos += 1;
                self.compile_unary(bc)?;
                bc.emit(OpCode::Div, 0);
                continue;
            }
            if self.cur() == b'%' {
                self.pos += 1;
                self.compile_unary(bc)?;
                bc.emit(OpCode::Mod, 0);
                continue;
            }
            break;
        }
        Ok(())
    }

    fn compile_unary(&mut self, bc: &mut Bytecode) -> FunResult<()> {
        self.skip_spaces();
        if !self.eof() && self.cur() == b'!' {
            self.pos += 1;
            self.compile_unary(bc)?;
            bc.emit(OpCode::Not, 0);
            return Ok(());
        }
        if !self.eof() && self.cur() == b'-' {
            self.pos += 1;
            let ci = bc.add_constant(Value::Int(0));
            bc.emit(OpCode::LoadConst, ci as i32);
            self.compile_unary(bc)?;
            bc.emit(OpCode::Sub, 0);
            return Ok(());
        }
        self.compile_primary(bc)
    }

    /// Shared postfix loop for `[index]`, `[start:end]` slices, and
    /// `.field` / `.method(...)` sugar following any primary expression.
    fn compile_postfix(&mut self, bc: &mut Bytecode) -> FunResult<()> {
        loop {
            self.skip_spaces();
            if !self.eof() && self.cur() == b'[' {
                self.pos += 1;
                self.compile_expression(bc)?;
                self.skip_spaces();
                if !self.eof() && self.cur() == b':' {
                    self.pos += 1;
                    self.skip_spaces();
                    if !self.try_expression(bc)? {
                        let ci = bc.add_constant(Value::Int(-1));
                        bc.emit(OpCode::LoadConst, ci as i32);
                    }
                    if !self.consume_char(b']') {
                        return Err(self.fail(self.pos, "Expected ']' after slice"));
                    }
                    bc.emit(OpCode::Slice, 0);
                } else {
                    if !self.consume_char(b']') {
                        return Err(self.fail(self.pos, "Expected ']' after index"));
                    }
                    bc.emit(OpCode::IndexGet, 0);
                }
                continue;
            }

            if !self.eof() && self.cur() == b'.' {
                self.pos += 1;
                self.skip_spaces();
                let Some(mname) = self.read_identifier() else {
                    return Err(self.fail(self.pos, "Expected identifier after '.'"));
                };
                let kci = bc.add_constant(Value::Str(mname));

                let mut callp = self.pos;
                self.skip_spaces_at(&mut callp);
                if callp < self.src.len() && self.src[callp] == b'(' {
                    bc.emit(OpCode::Dup, 0);
                    bc.emit(OpCode::LoadConst, kci as i32);
                    bc.emit(OpCode::IndexGet, 0);
                    bc.emit(OpCode::Swap, 0);

                    self.pos = callp + 1;
                    let mut argc = 0i32;
                    self.skip_spaces();
                    if !self.eof() && self.cur() != b')' {
                        loop {
                            self.compile_expression(bc)?;
                            argc += 1;
                            self.skip_spaces();
                            if !self.eof() && self.cur() == b',' {
                                self.pos += 1;
                                self.skip_spaces();
                                continue;
                            }
                            break;
                        }
                    }
                    if !self.consume_char(b')') {
                        return Err(self.fail(self.pos, "Expected ')' after arguments"));
                    }
                    bc.emit(OpCode::Call, argc + 1);
                } else {
                    bc.emit(OpCode::LoadConst, kci as i32);
                    bc.emit(OpCode::IndexGet, 0);
                }
                continue;
            }
            break;
        }
        Ok(())
    }

    fn compile_primary(&mut self, bc: &mut Bytecode) -> FunResult<()> {
        self.skip_spaces();

        if !self.eof() && self.cur() == b'(' {
            self.pos += 1;
            if !self.try_expression(bc)? {
                return Err(self.fail(self.pos, "Expected expression after '('"));
            }
            if !self.consume_char(b')') {
                return Err(self.fail(self.pos, "Expected ')'"));
            }
            return self.compile_postfix(bc);
        }

        if let Some(s) = self.parse_string_literal() {
            let ci = bc.add_constant(Value::Str(s));
            bc.emit(OpCode::LoadConst, ci as i32);
            return self.compile_postfix(bc);
        }

        self.skip_spaces();
        if !self.eof() && self.cur() == b'[' {
            self.pos += 1;
            let mut count = 0i32;
            self.skip_spaces();
            if !self.eof() && self.cur() != b']' {
                loop {
                    if !self.try_expression(bc)? {
                        return Err(self.fail(self.pos, "Expected expression in array literal"));
                    }
                    count += 1;
                    self.skip_spaces();
                    if !self.eof() && self.cur() == b',' {
                        self.pos += 1;
                        self.skip_spaces();
                        continue;
                    }
                    break;
                }
            }
            if !self.consume_char(b']') {
                return Err(self.fail(self.pos, "Expected ']' to close array literal"));
            }
            bc.emit(OpCode::MakeArray, count);
            return self.compile_postfix(bc);
        }

        self.skip_spaces();
        if !self.eof() && self.cur() == b'{' {
            self.pos += 1;
            let mut pairs = 0i32;
            self.skip_spaces();
            if !self.eof() && self.cur() != b'}' {
                loop {
                    let Some(k) = self.parse_string_literal() else {
                        return Err(self.fail(self.pos, "Expected string key in map literal"));
                    };
                    let kci = bc.add_constant(Value::Str(k));
                    bc.emit(OpCode::LoadConst, kci as i32);
                    self.skip_spaces();
                    if !self.consume_char(b':') {
                        return Err(self.fail(self.pos, "Expected ':' after map key"));
                    }
                    if !self.try_expression(bc)? {
                        return Err(self.fail(self.pos, "Expected value expression in map literal"));
                    }
                    pairs += 1;
                    self.skip_spaces();
                    if !self.eof() && self.cur() == b',' {
                        self.pos += 1;
                        self.skip_spaces();
                        continue;
                    }
                    break;
                }
            }
            if !self.consume_char(b'}') {
                return Err(self.fail(self.pos, "Expected '}' to close map literal"));
            }
            bc.emit(OpCode::MakeMap, pairs);
            return Ok(());
        }

        let save = self.pos;
        if let Some(ival) = self.parse_int_literal() {
            let ci = bc.add_constant(Value::Int(ival));
            bc.emit(OpCode::LoadConst, ci as i32);
            return self.compile_postfix(bc);
        }
        self.pos = save;

        if let Some(name) = self.read_identifier() {
            if name == "true" || name == "false" {
                let ci = bc.add_constant(Value::Int(if name == "true" { 1 } else { 0 }));
                bc.emit(OpCode::LoadConst, ci as i32);
                return self.compile_postfix(bc);
            }

            self.skip_spaces();
            let local_idx = self.local_find(&name);
            let is_call = !self.eof() && self.cur() == b'(';

            if is_call {
                if let Some(()) = self.compile_builtin_call(bc, &name)? {
                    return self.compile_postfix(bc);
                }

                match local_idx {
                    Some(i) => {
                        bc.emit(OpCode::LoadLocal, i as i32);
                    }
                    None => {
                        let gi = self.globals.index(&name)?;
                        bc.emit(OpCode::LoadGlobal, gi as i32);
                    }
                }
                self.pos += 1; // '('
                let mut argc = 0i32;
                self.skip_spaces();
                if !self.eof() && self.cur() != b')' {
                    loop {
                        if !self.try_expression(bc)? {
                            return Err(self.fail(self.pos, "Expected expression as function argument"));
                        }
                        argc += 1;
                        self.skip_spaces();
                        if !self.eof() && self.cur() == b',' {
                            self.pos += 1;
                            self.skip_spaces();
                            continue;
                        }
                        break;
                    }
                }
                if !self.consume_char(b')') {
                    return Err(self.fail(self.pos, "Expected ')' after arguments"));
                }
                bc.emit(OpCode::Call, argc);
                return self.compile_postfix(bc);
            } else {
                match local_idx {
                    Some(i) => {
                        bc.emit(OpCode::LoadLocal, i as i32);
                    }
                    None => {
                        let gi = self.globals.index(&name)?;
                        bc.emit(OpCode::LoadGlobal, gi as i32);
                    }
                }
                return self.compile_postfix(bc);
            }
        }

        Err(self.fail(self.pos, "Expected expression"))
    }

    /// `typeof(<identifier>)` compile-time substitution: if `ident` has
    /// a declared integer width, load a literal "Sint<N>"/"Uint<N>"
    /// string constant instead of calling runtime TYPEOF.
    fn compile_typeof_call(&mut self, bc: &mut Bytecode) -> FunResult<()> {
        self.pos += 1; // '('
        let peek_save = self.pos;
        let mut peek = self.pos;
        let save = self.pos;
        self.pos = peek;
        let vname = self.read_identifier();
        peek = self.pos;
        self.pos = save;

        let mut handled = false;
        if let Some(vname) = vname.clone() {
            self.skip_spaces_at(&mut peek);
            if peek < self.src.len() && self.src[peek] == b')' {
                let decl_bits = if let Some(i) = self.local_find(&vname) {
                    self.locals.as_ref().unwrap().types[i]
                } else if let Some(gi) = self.globals.find(&vname) {
                    self.globals.types[gi]
                } else {
                    0
                };

                if decl_bits != 0 {
                    let bits = decl_bits.abs();
                    let is_signed = decl_bits < 0;
                    let tname = format!("{}{}", if is_signed { "Sint" } else { "Uint" }, bits);
                    let ci = bc.add_constant(Value::Str(tname));
                    bc.emit(OpCode::LoadConst, ci as i32);
                } else {
                    match self.local_find(&vname) {
                        Some(i) => {
                            bc.emit(OpCode::LoadLocal, i as i32);
                        }
                        None => {
                            let gi = self.globals.index(&vname)?;
                            bc.emit(OpCode::LoadGlobal, gi as i32);
                        }
                    }
                    bc.emit(OpCode::Typeof, 0);
                }
                self.pos = peek + 1; // consume ')'
                handled = true;
            }
        }

        if !handled {
            self.pos = peek_save;
            if !self.try_expression(bc)? {
                return Err(self.fail(self.pos, "typeof expects 1 argument"));
            }
            if !self.consume_char(b')') {
                return Err(self.fail(self.pos, "Expected ')' after typeof arg"));
            }
            bc.emit(OpCode::Typeof, 0);
        }
        Ok(())
    }

    /// Recognizes and compiles a builtin call by name. Returns `Ok(Some(()))`
    /// if `name` was a recognized builtin (and the whole `name(args...)`
    /// including the trailing `)` was consumed), `Ok(None)` if `name`
    /// isn't one (caller falls back to ordinary call/variable-load
    /// compilation, without having consumed anything beyond `name`).
    fn compile_builtin_call(&mut self, bc: &mut Bytecode, name: &str) -> FunResult<Option<()>> {
        macro_rules! arg {
            ($msg:literal) => {
                if !self.try_expression(bc)? {
                    return Err(self.fail(self.pos, $msg));
                }
            };
        }
        macro_rules! comma {
            ($msg:literal) => {
                if !self.eof() && self.cur() == b',' {
                    self.pos += 1;
                    self.skip_spaces();
                } else {
                    return Err(self.fail(self.pos, $msg));
                }
            };
        }
        macro_rules! close {
            ($msg:literal) => {
                if !self.consume_char(b')') {
                    return Err(self.fail(self.pos, $msg));
                }
            };
        }

        match name {
            "len" => {
                self.pos += 1;
                arg!("len expects 1 argument");
                close!("Expected ')' after len arg");
                bc.emit(OpCode::Len, 0);
            }
            "push" => {
                self.pos += 1;
                arg!("push expects array");
                comma!("push expects 2 args");
                arg!("push expects value");
                close!("Expected ')' after push args");
                bc.emit(OpCode::Push, 0);
            }
            "pop" => {
                self.pos += 1;
                arg!("pop expects array");
                close!("Expected ')' after pop arg");
                bc.emit(OpCode::Apop, 0);
            }
            "set" => {
                self.pos += 1;
                arg!("set expects array");
                comma!("set expects 3 args");
                arg!("set expects index");
                comma!("set expects 3 args");
                arg!("set expects value");
                close!("Expected ')' after set args");
                bc.emit(OpCode::Set, 0);
            }
            "insert" => {
                self.pos += 1;
                arg!("insert expects array");
                comma!("insert expects 3 args");
                arg!("insert expects index");
                comma!("insert expects 3 args");
                arg!("insert expects value");
                close!("Expected ')' after insert args");
                bc.emit(OpCode::Insert, 0);
            }
            "remove" => {
                self.pos += 1;
                arg!("remove expects array");
                comma!("remove expects 2 args");
                arg!("remove expects index");
                close!("Expected ')' after remove args");
                bc.emit(OpCode::Remove, 0);
            }
            "to_number" => {
                self.pos += 1;
                arg!("to_number expects 1 argument");
                close!("Expected ')' after to_number arg");
                bc.emit(OpCode::ToNumber, 0);
            }
            "to_string" => {
                self.pos += 1;
                arg!("to_string expects 1 argument");
                close!("Expected ')' after to_string arg");
                bc.emit(OpCode::ToString, 0);
            }
            "typeof" => {
                self.compile_typeof_call(bc)?;
            }
            "keys" => {
                self.pos += 1;
                arg!("keys expects 1 arg");
                close!("Expected ')' after keys arg");
                bc.emit(OpCode::Keys, 0);
            }
            "values" => {
                self.pos += 1;
                arg!("values expects 1 arg");
                close!("Expected ')' after values arg");
                bc.emit(OpCode::Values, 0);
            }
            "has" => {
                self.pos += 1;
                arg!("has expects (map, key)");
                comma!("has expects (map, key)");
                arg!("has expects (map, key)");
                close!("has expects (map, key)");
                bc.emit(OpCode::HasKey, 0);
            }
            "read_file" => {
                self.pos += 1;
                arg!("read_file expects 1 arg");
                close!("Expected ')' after read_file arg");
                bc.emit(OpCode::ReadFile, 0);
            }
            "write_file" => {
                self.pos += 1;
                arg!("write_file expects 2 args");
                comma!("write_file expects 2 args");
                arg!("write_file expects 2 args");
                close!("Expected ')' after write_file args");
                bc.emit(OpCode::WriteFile, 0);
            }
            "split" => {
                self.pos += 1;
                arg!("split expects string");
                comma!("split expects 2 args");
                arg!("split expects separator");
                close!("Expected ')' after split args");
                bc.emit(OpCode::Split, 0);
            }
            "join" => {
                self.pos += 1;
                arg!("join expects array");
                comma!("join expects 2 args");
                arg!("join expects separator");
                close!("Expected ')' after join args");
                bc.emit(OpCode::Join, 0);
            }
            "substr" => {
                self.pos += 1;
                arg!("substr expects string");
                comma!("substr expects 3 args");
                arg!("substr expects start");
                comma!("substr expects 3 args");
                arg!("substr expects len");
                close!("Expected ')' after substr args");
                bc.emit(OpCode::Substr, 0);
            }
            "find" => {
                self.pos += 1;
                arg!("find expects haystack");
                comma!("find expects 2 args");
                arg!("find expects needle");
                close!("Expected ')' after find args");
                bc.emit(OpCode::Find, 0);
            }
            "contains" => {
                self.pos += 1;
                arg!("contains expects array");
                comma!("contains expects 2 args");
                arg!("contains expects value");
                close!("Expected ')' after contains args");
                bc.emit(OpCode::Contains, 0);
            }
            "indexOf" => {
                self.pos += 1;
                arg!("indexOf expects array");
                comma!("indexOf expects 2 args");
                arg!("indexOf expects value");
                close!("Expected ')' after indexOf args");
                bc.emit(OpCode::IndexOf, 0);
            }
            "clear" => {
                self.pos += 1;
                arg!("clear expects array");
                close!("Expected ')' after clear arg");
                bc.emit(OpCode::Clear, 0);
            }
            "enumerate" => {
                self.pos += 1;
                arg!("enumerate expects array");
                close!("Expected ')' after enumerate arg");
                bc.emit(OpCode::Enumerate, 0);
            }
            "zip" => {
                self.pos += 1;
                arg!("zip expects first array");
                comma!("zip expects 2 args");
                arg!("zip expects second array");
                close!("Expected ')' after zip args");
                bc.emit(OpCode::Zip, 0);
            }
            "min" => {
                self.pos += 1;
                arg!("min expects 2 args");
                comma!("min expects 2 args");
                arg!("min expects 2 args");
                close!("Expected ')' after min args");
                bc.emit(OpCode::Min, 0);
            }
            "max" => {
                self.pos += 1;
                arg!("max expects 2 args");
                comma!("max expects 2 args");
                arg!("max expects 2 args");
                close!("Expected ')' after max args");
                bc.emit(OpCode::Max, 0);
            }
            "clamp" => {
                self.pos += 1;
                arg!("clamp expects 3 args");
                comma!("clamp expects 3 args");
                arg!("clamp expects 3 args");
                comma!("clamp expects 3 args");
                arg!("clamp expects 3 args");
                close!("Expected ')' after clamp args");
                bc.emit(OpCode::Clamp, 0);
            }
            "abs" => {
                self.pos += 1;
                arg!("abs expects 1 arg");
                close!("Expected ')' after abs arg");
                bc.emit(OpCode::Abs, 0);
            }
            "pow" => {
                self.pos += 1;
                arg!("pow expects 2 args");
                comma!("pow expects 2 args");
                arg!("pow expects 2 args");
                close!("Expected ')' after pow args");
                bc.emit(OpCode::Pow, 0);
            }
            "random" => {
                self.pos += 1;
                arg!("random expects 1 arg");
                close!("Expected ')' after random arg");
                bc.emit(OpCode::RandomSeed, 0);
            }
            "randomInt" => {
                self.pos += 1;
                arg!("randomInt expects 2 args");
                comma!("randomInt expects 2 args");
                arg!("randomInt expects 2 args");
                close!("Expected ')' after randomInt args");
                bc.emit(OpCode::RandomInt, 0);
            }
            "map" => {
                self.compile_map_call(bc)?;
            }
            "filter" => {
                self.compile_filter_call(bc)?;
            }
            "reduce" => {
                self.compile_reduce_call(bc)?;
            }
            _ => return Ok(None),
        }
        Ok(Some(()))
    }

    fn compile_map_call(&mut self, bc: &mut Bytecode) -> FunResult<()> {
        self.pos += 1; // '('
        if !self.try_expression(bc)? || !self.consume_char(b',') {
            return Err(self.fail(self.pos, "map expects (array, function)"));
        }
        let arr_slot = self.store_to_temp(bc, "map_arr")?;
        if !self.try_expression(bc)? || !self.consume_char(b')') {
            return Err(self.fail(self.pos, "map expects (array, function)"));
        }
        let fn_slot = self.store_to_temp(bc, "map_fn")?;

        bc.emit(OpCode::MakeArray, 0);
        let res_slot = self.store_to_temp(bc, "map_res")?;
        let c0 = bc.add_constant(Value::Int(0));
        bc.emit(OpCode::LoadConst, c0 as i32);
        let i_slot = self.store_to_temp(bc, "map_i")?;

        let loop_start = bc.next_index();
        self.emit_load(bc, i_slot);
        self.emit_load(bc, arr_slot);
        bc.emit(OpCode::Len, 0);
        bc.emit(OpCode::Lt, 0);
        let jf = bc.emit(OpCode::JumpIfFalse, -1);

        self.emit_load(bc, arr_slot);
        self.emit_load(bc, i_slot);
        bc.emit(OpCode::IndexGet, 0);

        self.emit_load(bc, fn_slot);
        bc.emit(OpCode::Swap, 0);
        bc.emit(OpCode::Call, 1);
        let v_slot = self.store_to_temp(bc, "map_v")?;

        self.emit_load(bc, res_slot);
        self.emit_load(bc, res_slot);
        bc.emit(OpCode::Len, 0);
        self.emit_load(bc, v_slot);
        bc.emit(OpCode::Insert, 0);
        bc.emit(OpCode::Pop, 0);

        let c1 = bc.add_constant(Value::Int(1));
        self.emit_load(bc, i_slot);
        bc.emit(OpCode::LoadConst, c1 as i32);
        bc.emit(OpCode::Add, 0);
        self.emit_store(bc, i_slot);
        bc.emit(OpCode::Jump, loop_start as i32);
        bc.patch_operand(jf, bc.next_index() as i32);
        self.emit_load(bc, res_slot);
        Ok(())
    }

    fn compile_filter_call(&mut self, bc: &mut Bytecode) -> FunResult<()> {
        self.pos += 1; // '('
        if !self.try_expression(bc)? || !self.consume_char(b',') {
            return Err(self.fail(self.pos, "filter expects (array, function)"));
        }
        let arr_slot = self.store_to_temp(bc, "flt_arr")?;
        if !self.try_expression(bc)? || !self.consume_char(b')') {
            return Err(self.fail(self.pos, "filter expects (array, function)"));
        }
        let fn_slot = self.store_to_temp(bc, "flt_fn")?;

        bc.emit(OpCode::MakeArray, 0);
        let res_slot = self.store_to_temp(bc, "flt_res")?;
        let c0 = bc.add_constant(Value::Int(0));
        bc.emit(OpCode::LoadConst, c0 as i32);
        let i_slot = self.store_to_temp(bc, "flt_i")?;

        let loop_start = bc.next_index();
        self.emit_load(bc, i_slot);
        self.emit_load(bc, arr_slot);
        bc.emit(OpCode::Len, 0);
        bc.emit(OpCode::Lt, 0);
        let jf = bc.emit(OpCode::JumpIfFalse, -1);

        self.emit_load(bc, arr_slot);
        self.emit_load(bc, i_slot);
        bc.emit(OpCode::IndexGet, 0);
        self.emit_load(bc, fn_slot);
        bc.emit(OpCode::Swap, 0);
        bc.emit(OpCode::Call, 1);
        let jskip = bc.emit(OpCode::JumpIfFalse, -1);

        self.emit_load(bc, arr_slot);
        self.emit_load(bc, i_slot);
        bc.emit(OpCode::IndexGet, 0);
        let v_slot = self.store_to_temp(bc, "flt_v")?;

        self.emit_load(bc, res_slot);
        self.emit_load(bc, res_slot);
        bc.emit(OpCode::Len, 0);
        self.emit_load(bc, v_slot);
        bc.emit(OpCode::Insert, 0);
        bc.emit(OpCode::Pop, 0);

        bc.patch_operand(jskip, bc.next_index() as i32);
        let c1 = bc.add_constant(Value::Int(1));
        self.emit_load(bc, i_slot);
        bc.emit(OpCode::LoadConst, c1 as i32);
        bc.emit(OpCode::Add, 0);
        self.emit_store(bc, i_slot);
        bc.emit(OpCode::Jump, loop_start as i32);
        bc.patch_operand(jf, bc.next_index() as i32);
        self.emit_load(bc, res_slot);
        Ok(())
    }

    fn compile_reduce_call(&mut self, bc: &mut Bytecode) -> FunResult<()> {
        self.pos += 1; // '('
        if !self.try_expression(bc)? || !self.consume_char(b',') {
            return Err(self.fail(self.pos, "reduce expects (array, init, function)"));
        }
        let arr_slot = self.store_to_temp(bc, "red_arr")?;
        if !self.try_expression(bc)? || !self.consume_char(b',') {
            return Err(self.fail(self.pos, "reduce expects (array, init, function)"));
        }
        let acc_slot = self.store_to_temp(bc, "red_acc")?;
        if !self.try_expression(bc)? || !self.consume_char(b')') {
            return Err(self.fail(self.pos, "reduce expects (array, init, function)"));
        }
        let fn_slot = self.store_to_temp(bc, "red_fn")?;

        let c0 = bc.add_constant(Value::Int(0));
        bc.emit(OpCode::LoadConst, c0 as i32);
        let i_slot = self.store_to_temp(bc, "red_i")?;

        let loop_start = bc.next_index();
        self.emit_load(bc, i_slot);
        self.emit_load(bc, arr_slot);
        bc.emit(OpCode::Len, 0);
        bc.emit(OpCode::Lt, 0);
        let jf = bc.emit(OpCode::JumpIfFalse, -1);

        self.emit_load(bc, arr_slot);
        self.emit_load(bc, i_slot);
        bc.emit(OpCode::IndexGet, 0);
        let elem_slot = self.store_to_temp(bc, "red_elem")?;

        self.emit_load(bc, fn_slot);
        self.emit_load(bc, acc_slot);
        self.emit_load(bc, elem_slot);
        bc.emit(OpCode::Call, 2);
        self.emit_store(bc, acc_slot);

        let c1 = bc.add_constant(Value::Int(1));
        self.emit_load(bc, i_slot);
        bc.emit(OpCode::LoadConst, c1 as i32);
        bc.emit(OpCode::Add, 0);
        self.emit_store(bc, i_slot);
        bc.emit(OpCode::Jump, loop_start as i32);
        bc.patch_operand(jf, bc.next_index() as i32);
        self.emit_load(bc, acc_slot);
        Ok(())
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Maps a type keyword to its declared-width encoding (negative = signed,
/// positive = unsigned, 0 = non-integer), plus the string/nil/
/// boolean-or-number flags `compile_typed_decl` needs for its default-
/// value selection. Returns `None` if `name` isn't a type keyword.
/// `number` maps to signed 64-bit, matching the grounding source exactly
/// (a numeric no-op, emitted for bytecode fidelity).
fn type_keyword_info(name: &str) -> Option<(i32, bool, bool, bool)> {
    match name {
        "number" => Some((-64, false, false, true)),
        "string" => Some((0, true, false, false)),
        "boolean" => Some((0, false, false, true)),
        "nil" => Some((0, false, true, false)),
        "uint8" => Some((8, false, false, false)),
        "uint16" => Some((16, false, false, false)),
        "uint32" => Some((32, false, false, false)),
        "uint64" => Some((64, false, false, false)),
        "int8" => Some((-8, false, false, false)),
        "int16" => Some((-16, false, false, false)),
        "int32" => Some((-32, false, false, false)),
        "int64" => Some((-64, false, false, false)),
        _ => None,
    }
}

/// kind: 1=Number (numeric types incl. boolean), 2=String, 3=Nil, 0=no check.
fn map_type_kind(t: &str) -> u8 {
    match t {
        "string" => 2,
        "nil" => 3,
        "boolean" | "number" => 1,
        other if other.starts_with("uint") || other.starts_with("sint") || other.starts_with("int") => 1,
        _ => 0,
    }
}

/// Persists the global symbol table and temp counter across successive
/// one-line compiles, so a REPL's `x = 1` on one line and `print(x)` on
/// the next resolve to the same global slot (spec §6).
pub struct ReplSession {
    globals: GlobalTable,
    temp_counter: u32,
}

impl ReplSession {
    pub fn new() -> Self {
        Self { globals: GlobalTable::new(), temp_counter: 0 }
    }

    /// Compiles one line (or multi-line block) of top-level source against
    /// the accumulated global table, returning a fresh `Bytecode` whose
    /// global slot indices line up with every prior call's.
    pub fn compile_line(&mut self, src: &str) -> FunResult<Bytecode> {
        let mut c = Compiler {
            src: src.as_bytes().to_vec(),
            pos: 0,
            source_file: None,
            globals: std::mem::replace(&mut self.globals, GlobalTable::new()),
            locals: None,
            loop_stack: Vec::new(),
            temp_counter: self.temp_counter,
        };
        c.skip_shebang_if_present();
        c.skip_comments();
        c.skip_ws();
        let mut bc = Bytecode::new(None, None);
        let result = c.parse_block(&mut bc, 0);
        self.globals = c.globals;
        self.temp_counter = c.temp_counter;
        result?;
        bc.emit(OpCode::Halt, 0);
        Ok(bc)
    }
}

impl Default for ReplSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;

    fn run(src: &str) -> Vec<Value> {
        let bc = compile_string(src, None).expect("compile");
        let mut vm = Vm::new();
        vm.run(std::rc::Rc::new(bc)).expect("run");
        vm.drain_output()
    }

    #[test]
    fn prints_literal() {
        let out = run("print(\"hi\")\n");
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Value::Str(s) if s == "hi"));
    }

    #[test]
    fn typed_declaration_clamps() {
        let out = run("uint8 x = 300\nprint(x)\n");
        assert!(matches!(out[0], Value::Int(44)));
    }

    #[test]
    fn if_else_chain() {
        let out = run("number x = 5\nif x > 10\n  print(\"big\")\nelse if x > 1\n  print(\"mid\")\nelse\n  print(\"small\")\n");
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Value::Str(s) if s == "mid"));
    }

    #[test]
    fn for_range_sums() {
        let out = run("number total = 0\nfor i in range(0, 5)\n  total = total + i\nprint(total)\n");
        assert!(matches!(out[0], Value::Int(10)));
    }

    #[test]
    fn function_call_roundtrip() {
        let out = run("fun add(a, b)\n  return a + b\nprint(add(2, 3))\n");
        assert!(matches!(out[0], Value::Int(5)));
    }

    #[test]
    fn empty_function_body_does_not_swallow_following_statement() {
        let out = run("fun noop()\nprint(1)\n");
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Value::Int(1)));
    }

    #[test]
    fn class_instantiates_and_calls_method() {
        let src = "class Counter(number start)\n  count = start\n  fun bump(this)\n    this[\"count\"] = this[\"count\"] + 1\n    return this[\"count\"]\n\nc = Counter(5)\nprint(c.bump())\n";
        let out = run(src);
        assert!(matches!(out[0], Value::Int(6)));
    }

    #[test]
    fn map_filter_reduce_pipeline() {
        let src = "fun double(x)\n  return x * 2\nfun isEven(x)\n  return x % 2 == 0\nfun add(a, b)\n  return a + b\narr = [1, 2, 3, 4]\ndoubled = map(arr, double)\nevens = filter(doubled, isEven)\nprint(reduce(evens, 0, add))\n";
        let out = run(src);
        assert!(matches!(out[0], Value::Int(20)));
    }

    #[test]
    fn missing_class_argument_halts_with_message() {
        let src = "class Point(number x, number y)\n\np = Point(1)\n";
        let out = run(src);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Value::Str(s) if s == "TypeError: missing argument 'y' in Point()"));
    }

    #[test]
    fn break_and_continue_in_while_loop() {
        let src = "number i = 0\nnumber total = 0\nwhile i < 10\n  i = i + 1\n  if i == 3\n    continue\n  if i == 6\n    break\n  total = total + i\nprint(total)\n";
        // i=1,2 (skip3),4,5 then break at 6 -> total = 1+2+4+5 = 12
        let out = run(src);
        assert!(matches!(out[0], Value::Int(12)));
    }

    #[test]
    fn tab_indentation_is_rejected() {
        let err = compile_string("if 1\n\tprint(\"x\")\n", None);
        assert!(err.is_err());
    }
}
