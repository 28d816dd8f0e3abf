// File: src/vm.rs
//
// The stack-based bytecode VM (spec §3.5/§4.4): fixed-depth value stack,
// a bounded frame stack with fixed-size local slots, a fixed-size global
// table, an output buffer, debugger state, and an error trap. The
// fetch-execute loop's stop-condition ordering (debugger check, fetch,
// trace, breakpoint check, dispatch) and the per-opcode semantics are
// grounded on `original_source/src/vm.c` and the individual
// `original_source/src/vm/**/*.c` handler fragments; the overall struct
// shape (stack/frames/ip fields, `match` dispatch loop) follows
// `ruff::vm::VM`, stripped of its JIT/inline-cache/upvalue/generator/
// channel machinery (out of scope here, see DESIGN.md).

use std::rc::Rc;

use colored::Colorize;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::array;
use crate::bytecode::{Bytecode, Instruction, OpCode};
use crate::debugger::Debugger;
use crate::errors::{ErrorKind, FunError, FunResult, RuntimeContext, SourceLocation};
use crate::map::FunMap;
use crate::strings;
use crate::value::Value;

pub const STACK_SIZE: usize = 1024;
pub const MAX_FRAMES: usize = 128;
pub const MAX_GLOBALS: usize = 128;
pub const FRAME_MAX_LOCALS: usize = 64;

struct Frame {
    chunk: Rc<Bytecode>,
    ip: usize,
    locals: Vec<Value>,
    /// `TRY_PUSH` handler ips, most recent last. `THROW` unwinds to the
    /// nearest handler in the *current* frame (spec §7); exceptions do
    /// not cross frame boundaries in this core.
    handlers: Vec<usize>,
}

impl Frame {
    fn new(chunk: Rc<Bytecode>, args: Vec<Value>) -> Self {
        let mut locals = vec![Value::Nil; FRAME_MAX_LOCALS];
        for (i, a) in args.into_iter().enumerate() {
            if i < FRAME_MAX_LOCALS {
                locals[i] = a;
            }
        }
        Self { chunk, ip: 0, locals, handlers: Vec::new() }
    }
}

enum ControlFlow {
    Continue,
    Halt,
}

pub type ErrorTrap = Box<dyn FnMut(&mut Vm, &FunError)>;
pub type DebugHook = Box<dyn FnMut(&mut Vm)>;

/// The virtual machine. Owns every piece of mutable execution state for
/// one program run; nothing here is shared across VM instances (spec §5).
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    globals: Vec<Value>,
    output: Vec<Value>,
    current_line: i64,
    current_file: Option<String>,
    instr_count: u64,
    exit_code: i32,
    pub debugger: Debugger,
    error_trap: Option<ErrorTrap>,
    debug_hook: Option<DebugHook>,
    rng: StdRng,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self {
            stack: Vec::with_capacity(STACK_SIZE),
            frames: Vec::with_capacity(MAX_FRAMES),
            globals: vec![Value::Nil; MAX_GLOBALS],
            output: Vec::new(),
            current_line: 0,
            current_file: None,
            instr_count: 0,
            exit_code: 0,
            debugger: Debugger::new(),
            error_trap: None,
            debug_hook: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Clears all execution state while keeping debugger configuration,
    /// so a REPL can run successive snippets against the same globals... or
    /// start over entirely (spec §6 `vm_reset`). This resets globals too,
    /// matching the "reset" contract; a REPL wanting persistence across
    /// snippets should not call this between lines.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.globals = vec![Value::Nil; MAX_GLOBALS];
        self.output.clear();
        self.current_line = 0;
        self.current_file = None;
        self.instr_count = 0;
        self.exit_code = 0;
        self.debugger.reset();
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn set_trace(&mut self, on: bool) {
        self.debugger.trace_enabled = on;
    }

    pub fn install_error_trap(&mut self, trap: ErrorTrap) {
        self.error_trap = Some(trap);
    }

    pub fn clear_error_trap(&mut self) {
        self.error_trap = None;
    }

    pub fn install_debug_hook(&mut self, hook: DebugHook) {
        self.debug_hook = Some(hook);
    }

    /// Prints and drains the output buffer (one value per line), the way
    /// the REPL/CLI surface program output after a run.
    pub fn print_output(&mut self) {
        for v in self.output.drain(..) {
            println!("{}", v.to_display_string());
        }
    }

    pub fn drain_output(&mut self) -> Vec<Value> {
        self.output.drain(..).collect()
    }

    pub fn clear_output(&mut self) {
        self.output.clear();
    }

    pub fn dump_globals(&self) -> String {
        let mut out = String::new();
        for (i, v) in self.globals.iter().enumerate() {
            if !matches!(v, Value::Nil) {
                out.push_str(&format!("g{:03}: {}\n", i, v.to_string_summary()));
            }
        }
        out
    }

    /// Runs a compiled program to completion: `HALT`, `EXIT`, an uncaught
    /// error (trapped or propagated), or a `RETURN` from the outermost
    /// frame (spec §2/§4.4).
    pub fn run(&mut self, chunk: Rc<Bytecode>) -> FunResult<()> {
        self.current_line = 0;
        self.current_file = chunk.source_file.clone();
        self.instr_count = 0;
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.fatal(ErrorKind::BoundsError, "too many frames", "CALL"));
        }
        self.frames.push(Frame::new(chunk, Vec::new()));

        match self.run_loop() {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(mut trap) = self.error_trap.take() {
                    trap(self, &err);
                    self.error_trap = Some(trap);
                    Ok(())
                } else {
                    eprintln!("{}", err);
                    Err(err)
                }
            }
        }
    }

    fn run_loop(&mut self) -> FunResult<()> {
        loop {
            if self.frames.is_empty() {
                break;
            }

            let fp = self.frames.len();
            if self.debugger.should_stop_for_step(fp, self.instr_count) {
                self.invoke_debug_hook();
            }

            let frame_idx = self.frames.len() - 1;
            let ip = self.frames[frame_idx].ip;
            if ip >= self.frames[frame_idx].chunk.instructions.len() {
                // Implicit RETURN Nil: ip ran off the end of the block.
                self.frames.pop();
                if self.frames.is_empty() {
                    break;
                }
                self.push(Value::Nil)?;
                continue;
            }

            let inst = self.frames[frame_idx].chunk.instructions[ip];
            self.frames[frame_idx].ip += 1;
            self.instr_count += 1;

            if self.debugger.trace_enabled {
                self.emit_trace(&inst);
            }

            match self.execute(inst)? {
                ControlFlow::Continue => {}
                ControlFlow::Halt => break,
            }
        }
        Ok(())
    }

    fn invoke_debug_hook(&mut self) {
        if let Some(mut hook) = self.debug_hook.take() {
            hook(self);
            self.debug_hook = Some(hook);
        }
    }

    fn emit_trace(&self, inst: &Instruction) {
        let frame = self.frames.last().unwrap();
        let file = frame.chunk.source_file.as_deref().unwrap_or("<unknown>");
        let func = frame.chunk.name.as_deref().unwrap_or("<main>");
        let top: Vec<String> = self
            .stack
            .iter()
            .rev()
            .take(4)
            .map(|v| v.to_string_summary())
            .collect();
        eprintln!(
            "{} {}:{} {} ip={} {} {} | stack[{}]=[{}]",
            "TRACE".dimmed(),
            file,
            self.current_line,
            func,
            frame.ip - 1,
            inst.op.name(),
            inst.operand,
            self.stack.len(),
            top.join(", ")
        );
    }

    fn current_frame(&self) -> &Frame {
        self.frames.last().expect("execute called with no active frame")
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("execute called with no active frame")
    }

    fn push(&mut self, value: Value) -> FunResult<()> {
        if self.stack.len() >= STACK_SIZE {
            return Err(self.fatal(ErrorKind::BoundsError, "value stack overflow", "PUSH"));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> FunResult<Value> {
        self.stack.pop().ok_or_else(|| self.fatal(ErrorKind::BoundsError, "value stack underflow", "POP"))
    }

    fn fatal(&self, kind: ErrorKind, message: impl Into<String>, opcode: &str) -> FunError {
        let loc = SourceLocation::with_file(
            self.current_line.max(0) as usize,
            0,
            self.current_file.clone().unwrap_or_else(|| "<unknown>".to_string()),
        );
        let ctx = RuntimeContext {
            source_file: self.current_file.clone(),
            function_name: self.frames.last().and_then(|f| f.chunk.name.clone()),
            opcode: Some(opcode.to_string()),
            ip: self.frames.last().map(|f| f.ip.saturating_sub(1)),
        };
        FunError::new(kind, message, loc).with_runtime(ctx)
    }

    fn expect_int(&self, v: &Value, opcode: &str) -> FunResult<i64> {
        match v {
            Value::Int(i) => Ok(*i),
            _ => Err(self.fatal(ErrorKind::TypeError, format!("{} expects an integer, got {}", opcode, v.typeof_name()), opcode)),
        }
    }

    fn expect_str(&self, v: &Value, opcode: &str) -> FunResult<String> {
        match v {
            Value::Str(s) => Ok(s.clone()),
            _ => Err(self.fatal(ErrorKind::TypeError, format!("{} expects a string, got {}", opcode, v.typeof_name()), opcode)),
        }
    }

    fn expect_array(&self, v: &Value, opcode: &str) -> FunResult<Rc<std::cell::RefCell<Vec<Value>>>> {
        match v {
            Value::Array(a) => Ok(a.clone()),
            _ => Err(self.fatal(ErrorKind::TypeError, format!("{} expects an array, got {}", opcode, v.typeof_name()), opcode)),
        }
    }

    fn execute(&mut self, inst: Instruction) -> FunResult<ControlFlow> {
        match inst.op {
            OpCode::Nop => {}
            OpCode::Line => {
                self.current_line = inst.operand as i64;
                self.current_file = self.current_frame().chunk.source_file.clone();
                let file = self.current_file.clone().unwrap_or_default();
                if self.debugger.breakpoint_hits(&file, self.current_line) {
                    self.invoke_debug_hook();
                }
            }
            OpCode::LoadConst => {
                let k = inst.operand as usize;
                let v = self
                    .current_frame()
                    .chunk
                    .constants
                    .get(k)
                    .cloned()
                    .ok_or_else(|| self.fatal(ErrorKind::BoundsError, "constant index out of range", "LOAD_CONST"))?;
                self.push(v)?;
            }
            OpCode::LoadLocal => {
                let s = inst.operand as usize;
                let v = self.current_frame().locals.get(s).cloned().unwrap_or(Value::Nil);
                self.push(v)?;
            }
            OpCode::StoreLocal => {
                let s = inst.operand as usize;
                let v = self.pop()?;
                if s < FRAME_MAX_LOCALS {
                    self.current_frame_mut().locals[s] = v;
                }
            }
            OpCode::LoadGlobal => {
                let g = inst.operand as usize;
                if g >= MAX_GLOBALS {
                    return Err(self.fatal(ErrorKind::BoundsError, "global slot out of range", "LOAD_GLOBAL"));
                }
                self.push(self.globals[g].clone())?;
            }
            OpCode::StoreGlobal => {
                let g = inst.operand as usize;
                if g >= MAX_GLOBALS {
                    return Err(self.fatal(ErrorKind::BoundsError, "global slot out of range", "STORE_GLOBAL"));
                }
                let v = self.pop()?;
                self.globals[g] = v;
            }
            OpCode::Pop => {
                self.pop()?;
            }
            OpCode::Dup => {
                let v = self.pop()?;
                self.push(v.clone())?;
                self.push(v)?;
            }
            OpCode::Swap => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b)?;
                self.push(a)?;
            }
            OpCode::Jump => {
                self.current_frame_mut().ip = inst.operand as usize;
            }
            OpCode::JumpIfFalse => {
                let cond = self.pop()?;
                if !cond.is_truthy() {
                    self.current_frame_mut().ip = inst.operand as usize;
                }
            }
            OpCode::Call => self.op_call(inst.operand as usize)?,
            OpCode::Return => return self.op_return(),
            OpCode::Print => {
                let v = self.pop()?;
                self.output.push(v.deep_clone());
            }
            OpCode::Halt => return Ok(ControlFlow::Halt),
            OpCode::Exit => {
                let v = self.pop()?;
                self.exit_code = match v {
                    Value::Nil => 0,
                    Value::Int(i) => i as i32,
                    Value::Str(s) => s.trim().parse::<i32>().unwrap_or(0),
                    _ => 0,
                };
                return Ok(ControlFlow::Halt);
            }

            OpCode::Add => self.op_add()?,
            OpCode::Sub => self.op_arith_numeric(|a, b| a - b, |a, b| a - b, "SUB")?,
            OpCode::Mul => self.op_arith_numeric(|a, b| a * b, |a, b| a * b, "MUL")?,
            OpCode::Div => self.op_div()?,
            OpCode::Mod => self.op_mod()?,
            OpCode::Lt => self.op_compare(|a, b| a < b, "LT")?,
            OpCode::Lte => self.op_compare(|a, b| a <= b, "LTE")?,
            OpCode::Gt => self.op_compare(|a, b| a > b, "GT")?,
            OpCode::Gte => self.op_compare(|a, b| a >= b, "GTE")?,
            OpCode::Eq => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(a.equals(&b)))?;
            }
            OpCode::Neq => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(!a.equals(&b)))?;
            }
            OpCode::And => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(a.is_truthy() && b.is_truthy()))?;
            }
            OpCode::Or => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(a.is_truthy() || b.is_truthy()))?;
            }
            OpCode::Not => {
                let a = self.pop()?;
                self.push(Value::Bool(!a.is_truthy()))?;
            }

            OpCode::MakeArray => self.op_make_array(inst.operand as usize)?,
            OpCode::MakeMap => self.op_make_map(inst.operand as usize)?,
            OpCode::IndexGet => self.op_index_get()?,
            OpCode::IndexSet => self.op_index_set()?,
            OpCode::Len => {
                let v = self.pop()?;
                let n = match &v {
                    Value::Str(s) => s.len() as i64,
                    Value::Array(a) => a.borrow().len() as i64,
                    other => return Err(self.fatal(ErrorKind::TypeError, format!("LEN expects string or array, got {}", other.typeof_name()), "LEN")),
                };
                self.push(Value::Int(n))?;
            }
            OpCode::Push => {
                let value = self.pop()?;
                let arr = self.pop()?;
                let arr = self.expect_array(&arr, "PUSH")?;
                let n = array::push(&mut arr.borrow_mut(), value);
                self.push(Value::Int(n))?;
            }
            OpCode::Apop => {
                let arr = self.pop()?;
                let arr = self.expect_array(&arr, "APOP")?;
                let v = array::pop(&mut arr.borrow_mut()).map_err(|m| self.fatal(ErrorKind::BoundsError, m, "APOP"))?;
                self.push(v)?;
            }
            OpCode::Set => {
                let value = self.pop()?;
                let idx = self.pop()?;
                let arr = self.pop()?;
                let idx = self.expect_int(&idx, "SET")?;
                let arr = self.expect_array(&arr, "SET")?;
                let v = array::set(&mut arr.borrow_mut(), idx, value).map_err(|m| self.fatal(ErrorKind::BoundsError, m, "SET"))?;
                self.push(v)?;
            }
            OpCode::Insert => {
                let value = self.pop()?;
                let idx = self.pop()?;
                let arr = self.pop()?;
                let idx = self.expect_int(&idx, "INSERT")?;
                let arr = self.expect_array(&arr, "INSERT")?;
                let n = array::insert(&mut arr.borrow_mut(), idx, value).map_err(|m| self.fatal(ErrorKind::BoundsError, m, "INSERT"))?;
                self.push(Value::Int(n))?;
            }
            OpCode::Remove => {
                let idx = self.pop()?;
                let arr = self.pop()?;
                let idx = self.expect_int(&idx, "REMOVE")?;
                let arr = self.expect_array(&arr, "REMOVE")?;
                let v = array::remove(&mut arr.borrow_mut(), idx).map_err(|m| self.fatal(ErrorKind::BoundsError, m, "REMOVE"))?;
                self.push(v)?;
            }
            OpCode::Slice => {
                let end = self.pop()?;
                let start = self.pop()?;
                let arr = self.pop()?;
                let end = self.expect_int(&end, "SLICE")?;
                let start = self.expect_int(&start, "SLICE")?;
                let arr = self.expect_array(&arr, "SLICE")?;
                let sliced = array::slice(&arr.borrow(), start, end);
                self.push(Value::new_array(sliced))?;
            }
            OpCode::Keys => {
                let m = self.pop()?;
                match m {
                    Value::Map(m) => self.push(Value::new_array(m.borrow().keys()))?,
                    other => return Err(self.fatal(ErrorKind::TypeError, format!("KEYS expects a map, got {}", other.typeof_name()), "KEYS")),
                }
            }
            OpCode::Values => {
                let m = self.pop()?;
                match m {
                    Value::Map(m) => self.push(Value::new_array(m.borrow().values()))?,
                    other => return Err(self.fatal(ErrorKind::TypeError, format!("VALUES expects a map, got {}", other.typeof_name()), "VALUES")),
                }
            }
            OpCode::HasKey => {
                let key = self.pop()?;
                let m = self.pop()?;
                let key = self.expect_str(&key, "HAS_KEY")?;
                match m {
                    Value::Map(m) => self.push(Value::Bool(m.borrow().has(&key)))?,
                    other => return Err(self.fatal(ErrorKind::TypeError, format!("HAS_KEY expects a map, got {}", other.typeof_name()), "HAS_KEY")),
                }
            }
            OpCode::Contains => {
                let needle = self.pop()?;
                let arr = self.pop()?;
                let arr = self.expect_array(&arr, "CONTAINS")?;
                self.push(Value::Bool(array::contains(&arr.borrow(), &needle)))?;
            }
            OpCode::IndexOf => {
                let needle = self.pop()?;
                let arr = self.pop()?;
                let arr = self.expect_array(&arr, "INDEX_OF")?;
                self.push(Value::Int(array::index_of(&arr.borrow(), &needle)))?;
            }
            OpCode::Clear => {
                let arr = self.pop()?;
                let arr = self.expect_array(&arr, "CLEAR")?;
                array::clear(&mut arr.borrow_mut());
            }
            OpCode::Enumerate => {
                let arr = self.pop()?;
                let arr = self.expect_array(&arr, "ENUMERATE")?;
                self.push(Value::new_array(array::enumerate(&arr.borrow())))?;
            }
            OpCode::Zip => {
                let b = self.pop()?;
                let a = self.pop()?;
                let a = self.expect_array(&a, "ZIP")?;
                let b = self.expect_array(&b, "ZIP")?;
                self.push(Value::new_array(array::zip(&a.borrow(), &b.borrow())))?;
            }

            OpCode::Split => {
                let sep = self.pop()?;
                let s = self.pop()?;
                let sep = self.expect_str(&sep, "SPLIT")?;
                let s = self.expect_str(&s, "SPLIT")?;
                self.push(Value::new_array(strings::split(&s, &sep)))?;
            }
            OpCode::Join => {
                let sep = self.pop()?;
                let arr = self.pop()?;
                let sep = self.expect_str(&sep, "JOIN")?;
                let arr = self.expect_array(&arr, "JOIN")?;
                self.push(Value::Str(strings::join(&arr.borrow(), &sep)))?;
            }
            OpCode::Substr => {
                let len = self.pop()?;
                let start = self.pop()?;
                let s = self.pop()?;
                let len = self.expect_int(&len, "SUBSTR")?;
                let start = self.expect_int(&start, "SUBSTR")?;
                let s = self.expect_str(&s, "SUBSTR")?;
                self.push(Value::Str(strings::substr(&s, start, len)))?;
            }
            OpCode::Find => {
                let needle = self.pop()?;
                let haystack = self.pop()?;
                let needle = self.expect_str(&needle, "FIND")?;
                let haystack = self.expect_str(&haystack, "FIND")?;
                self.push(Value::Int(strings::find(&haystack, &needle)))?;
            }

            OpCode::ToNumber => {
                let v = self.pop()?;
                self.push(v.to_number())?;
            }
            OpCode::ToString => {
                let v = self.pop()?;
                self.push(Value::Str(v.to_string_summary()))?;
            }
            OpCode::Typeof => {
                let v = self.pop()?;
                self.push(Value::Str(v.typeof_name().to_string()))?;
            }
            OpCode::Cast => self.op_cast()?,

            OpCode::Uclamp => {
                let v = self.pop()?;
                let a = coerce_u32(&v);
                let bits = inst.operand;
                let r = uclamp(a, bits);
                self.push(Value::Int(r as i64))?;
            }
            OpCode::Sclamp => {
                let v = self.pop()?;
                let a = coerce_u32(&v);
                let bits = inst.operand;
                self.push(Value::Int(sclamp(a, bits)))?;
            }
            OpCode::Band => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Int((coerce_u32(&a) & coerce_u32(&b)) as i64))?;
            }
            OpCode::Bor => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Int((coerce_u32(&a) | coerce_u32(&b)) as i64))?;
            }
            OpCode::Bxor => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Int((coerce_u32(&a) ^ coerce_u32(&b)) as i64))?;
            }
            OpCode::Bnot => {
                let a = self.pop()?;
                self.push(Value::Int((!coerce_u32(&a)) as i64))?;
            }
            OpCode::Shl => {
                let s = self.pop()?;
                let a = self.pop()?;
                let s = coerce_u32(&s) & 31;
                let a = coerce_u32(&a);
                let r = if s == 0 { a } else { a << s };
                self.push(Value::Int(r as i64))?;
            }
            OpCode::Shr => {
                let s = self.pop()?;
                let a = self.pop()?;
                let s = coerce_u32(&s) & 31;
                let a = coerce_u32(&a);
                let r = if s == 0 { a } else { a >> s };
                self.push(Value::Int(r as i64))?;
            }
            OpCode::Rol => {
                let s = self.pop()?;
                let a = self.pop()?;
                let s = coerce_u32(&s) & 31;
                let a = coerce_u32(&a);
                let r = if s == 0 { a } else { (a << s) | (a >> (32 - s)) };
                self.push(Value::Int(r as i64))?;
            }
            OpCode::Ror => {
                let s = self.pop()?;
                let a = self.pop()?;
                let s = coerce_u32(&s) & 31;
                let a = coerce_u32(&a);
                let r = if s == 0 { a } else { (a >> s) | (a << (32 - s)) };
                self.push(Value::Int(r as i64))?;
            }

            OpCode::Min => {
                let b = self.pop()?;
                let a = self.pop()?;
                let a = self.expect_int(&a, "MIN")?;
                let b = self.expect_int(&b, "MIN")?;
                self.push(Value::Int(a.min(b)))?;
            }
            OpCode::Max => {
                let b = self.pop()?;
                let a = self.pop()?;
                let a = self.expect_int(&a, "MAX")?;
                let b = self.expect_int(&b, "MAX")?;
                self.push(Value::Int(a.max(b)))?;
            }
            OpCode::Clamp => {
                let hi = self.pop()?;
                let lo = self.pop()?;
                let x = self.pop()?;
                let hi = self.expect_int(&hi, "CLAMP")?;
                let lo = self.expect_int(&lo, "CLAMP")?;
                let x = self.expect_int(&x, "CLAMP")?;
                self.push(Value::Int(x.clamp(lo, hi)))?;
            }
            OpCode::Abs => {
                let x = self.pop()?;
                let x = self.expect_int(&x, "ABS")?;
                self.push(Value::Int(x.abs()))?;
            }
            OpCode::Pow => {
                let exp = self.pop()?;
                let base = self.pop()?;
                let exp = self.expect_int(&exp, "POW")?;
                let base = self.expect_int(&base, "POW")?;
                self.push(Value::Int(int_pow(base, exp)))?;
            }
            OpCode::RandomSeed => {
                let seed = self.pop()?;
                let seed = self.expect_int(&seed, "RANDOM_SEED")?;
                self.rng = StdRng::seed_from_u64(seed as u64);
                self.push(Value::Int(0))?;
            }
            OpCode::RandomInt => {
                let hi = self.pop()?;
                let lo = self.pop()?;
                let hi = self.expect_int(&hi, "RANDOM_INT")?;
                let lo = self.expect_int(&lo, "RANDOM_INT")?;
                let r = if hi <= lo { lo } else { self.rng.gen_range(lo..hi) };
                self.push(Value::Int(r))?;
            }

            OpCode::ReadFile => {
                let path = self.pop()?;
                let path = self.expect_str(&path, "READ_FILE")?;
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| self.fatal(ErrorKind::ResourceError, format!("cannot read '{}': {}", path, e), "READ_FILE"))?;
                self.push(Value::Str(contents))?;
            }
            OpCode::WriteFile => {
                let contents = self.pop()?;
                let path = self.pop()?;
                let contents = self.expect_str(&contents, "WRITE_FILE")?;
                let path = self.expect_str(&path, "WRITE_FILE")?;
                std::fs::write(&path, &contents)
                    .map_err(|e| self.fatal(ErrorKind::ResourceError, format!("cannot write '{}': {}", path, e), "WRITE_FILE"))?;
                self.push(Value::Int(contents.len() as i64))?;
            }
            OpCode::Env => {
                let name = self.pop()?;
                let name = self.expect_str(&name, "ENV")?;
                let v = std::env::var(&name).map(Value::Str).unwrap_or(Value::Nil);
                self.push(v)?;
            }

            OpCode::TryPush => {
                let handler_ip = inst.operand as usize;
                self.current_frame_mut().handlers.push(handler_ip);
            }
            OpCode::Throw => {
                let thrown = self.pop()?;
                let handler_ip = self.current_frame_mut().handlers.pop();
                match handler_ip {
                    Some(target) => {
                        self.push(thrown)?;
                        self.current_frame_mut().ip = target;
                    }
                    None => return Err(self.fatal(ErrorKind::RuntimeError, "uncaught exception", "THROW")),
                }
            }
        }
        Ok(ControlFlow::Continue)
    }

    fn op_call(&mut self, argc: usize) -> FunResult<()> {
        if self.stack.len() < argc + 1 {
            return Err(self.fatal(ErrorKind::BoundsError, "value stack underflow", "CALL"));
        }
        let mut args = vec![Value::Nil; argc];
        for i in (0..argc).rev() {
            args[i] = self.pop()?;
        }
        let func = self.pop()?;
        let chunk = match func {
            Value::Function(f) => f,
            other => return Err(self.fatal(ErrorKind::TypeError, format!("CALL expects function, got {}", other.typeof_name()), "CALL")),
        };
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.fatal(ErrorKind::BoundsError, "too many frames", "CALL"));
        }
        self.frames.push(Frame::new(chunk, args));
        Ok(())
    }

    fn op_return(&mut self) -> FunResult<ControlFlow> {
        let ret = if self.stack.is_empty() { Value::Nil } else { self.stack.pop().unwrap() };
        self.frames.pop();
        if self.frames.is_empty() {
            self.push(ret)?;
            return Ok(ControlFlow::Halt);
        }
        self.push(ret)?;
        Ok(ControlFlow::Continue)
    }

    fn op_add(&mut self) -> FunResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => Value::Int(x + y),
            (Value::Str(x), Value::Str(y)) => Value::Str(format!("{}{}", x, y)),
            (Value::Array(x), Value::Array(y)) => Value::new_array(array::concat(&x.borrow(), &y.borrow())),
            _ => match (as_f64(&a), as_f64(&b)) {
                (Some(x), Some(y)) if matches!(a, Value::Float(_)) || matches!(b, Value::Float(_)) => Value::Float(x + y),
                _ => {
                    return Err(self.fatal(
                        ErrorKind::TypeError,
                        format!("ADD expects both ints, both strings, or both arrays, got {} and {}", a.typeof_name(), b.typeof_name()),
                        "ADD",
                    ))
                }
            },
        };
        self.push(result)
    }

    /// `SUB`/`MUL`: Int-only per the base opcode table, extended
    /// symmetrically to promote to Float when either operand is Float
    /// (Open Question resolved in SPEC_FULL.md §11).
    fn op_arith_numeric(&mut self, int_op: fn(i64, i64) -> i64, float_op: fn(f64, f64) -> f64, name: &str) -> FunResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => Value::Int(int_op(*x, *y)),
            _ => match (as_f64(&a), as_f64(&b)) {
                (Some(x), Some(y)) => Value::Float(float_op(x, y)),
                _ => return Err(self.fatal(ErrorKind::TypeError, format!("{} expects numbers, got {} and {}", name, a.typeof_name(), b.typeof_name()), name)),
            },
        };
        self.push(result)
    }

    fn op_div(&mut self) -> FunResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = if matches!(a, Value::Float(_)) || matches!(b, Value::Float(_)) {
            let (x, y) = match (as_f64(&a), as_f64(&b)) {
                (Some(x), Some(y)) => (x, y),
                _ => return Err(self.fatal(ErrorKind::TypeError, "DIV expects numbers", "DIV")),
            };
            if y == 0.0 {
                return Err(self.fatal(ErrorKind::ArithmeticError, "division by zero", "DIV"));
            }
            Value::Float(x / y)
        } else {
            match (&a, &b) {
                (Value::Int(x), Value::Int(y)) => {
                    if *y == 0 {
                        return Err(self.fatal(ErrorKind::ArithmeticError, "division by zero", "DIV"));
                    }
                    Value::Int(x / y)
                }
                _ => return Err(self.fatal(ErrorKind::TypeError, "DIV expects numbers", "DIV")),
            }
        };
        self.push(result)
    }

    fn op_mod(&mut self) -> FunResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = if matches!(a, Value::Float(_)) || matches!(b, Value::Float(_)) {
            let (x, y) = match (as_f64(&a), as_f64(&b)) {
                (Some(x), Some(y)) => (x, y),
                _ => return Err(self.fatal(ErrorKind::TypeError, "MOD expects numbers", "MOD")),
            };
            if y == 0.0 {
                return Err(self.fatal(ErrorKind::ArithmeticError, "modulo by zero", "MOD"));
            }
            Value::Float(x % y)
        } else {
            match (&a, &b) {
                (Value::Int(x), Value::Int(y)) => {
                    if *y == 0 {
                        return Err(self.fatal(ErrorKind::ArithmeticError, "modulo by zero", "MOD"));
                    }
                    Value::Int(x % y)
                }
                _ => return Err(self.fatal(ErrorKind::TypeError, "MOD expects ints", "MOD")),
            }
        };
        self.push(result)
    }

    fn op_compare(&mut self, cmp: fn(i64, i64) -> bool, name: &str) -> FunResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let a = self.expect_int(&a, name)?;
        let b = self.expect_int(&b, name)?;
        self.push(Value::Bool(cmp(a, b)))
    }

    fn op_make_array(&mut self, n: usize) -> FunResult<()> {
        if self.stack.len() < n {
            return Err(self.fatal(ErrorKind::BoundsError, "value stack underflow", "MAKE_ARRAY"));
        }
        let mut vals = vec![Value::Nil; n];
        for i in (0..n).rev() {
            vals[i] = self.pop()?;
        }
        self.push(Value::new_array(vals))
    }

    /// Pops `val` then `key` per pair and inserts immediately, matching
    /// `original_source/src/vm/maps/make_map.c`'s pop-per-iteration loop.
    /// Since the stack is LIFO, iteration 0 processes the *last* pushed
    /// pair first, so a map literal's insertion order (and hence its
    /// `keys()`/`values()` order) is the reverse of source order — e.g.
    /// `{"a": 1, "b": 2}.keys()` is `["b", "a"]`.
    fn op_make_map(&mut self, pairs: usize) -> FunResult<()> {
        if self.stack.len() < pairs * 2 {
            return Err(self.fatal(ErrorKind::BoundsError, "value stack underflow", "MAKE_MAP"));
        }
        let mut map = FunMap::new();
        for _ in 0..pairs {
            let val = self.pop()?;
            let key = self.pop()?;
            let key = self.expect_str(&key, "MAKE_MAP")?;
            map.set(&key, val);
        }
        self.push(Value::new_map(map))
    }

    fn op_index_get(&mut self) -> FunResult<()> {
        let key = self.pop()?;
        let container = self.pop()?;
        let result = match &container {
            Value::Array(a) => {
                let idx = self.expect_int(&key, "INDEX_GET")?;
                array::get_copy(&a.borrow(), idx).map_err(|m| self.fatal(ErrorKind::BoundsError, m, "INDEX_GET"))?
            }
            Value::Map(m) => {
                let k = self.expect_str(&key, "INDEX_GET")?;
                m.borrow().get_copy(&k).unwrap_or(Value::Nil)
            }
            other => return Err(self.fatal(ErrorKind::TypeError, format!("INDEX_GET expects array or map, got {}", other.typeof_name()), "INDEX_GET")),
        };
        self.push(result)
    }

    fn op_index_set(&mut self) -> FunResult<()> {
        let value = self.pop()?;
        let key = self.pop()?;
        let container = self.pop()?;
        match &container {
            Value::Array(a) => {
                let idx = self.expect_int(&key, "INDEX_SET")?;
                array::set(&mut a.borrow_mut(), idx, value).map_err(|m| self.fatal(ErrorKind::BoundsError, m, "INDEX_SET"))?;
            }
            Value::Map(m) => {
                let k = self.expect_str(&key, "INDEX_SET")?;
                m.borrow_mut().set(&k, value);
            }
            other => return Err(self.fatal(ErrorKind::TypeError, format!("INDEX_SET expects array or map, got {}", other.typeof_name()), "INDEX_SET")),
        }
        Ok(())
    }

    fn op_cast(&mut self) -> FunResult<()> {
        let type_name = self.pop()?;
        let value = self.pop()?;
        let target = self.expect_str(&type_name, "CAST")?.to_lowercase();
        let result = match target.as_str() {
            "number" => value.to_number(),
            "string" => Value::Str(value.to_string_summary()),
            "array" => match &value {
                Value::Array(a) => Value::new_array(a.borrow().clone()),
                other => Value::new_array(vec![other.clone()]),
            },
            "map" => match &value {
                Value::Map(m) => Value::new_map(m.borrow().clone()),
                _ => Value::empty_map(),
            },
            "boolean" => Value::Bool(value.is_truthy()),
            "nil" => Value::Nil,
            _ => Value::Nil,
        };
        self.push(result)
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn coerce_u32(v: &Value) -> u32 {
    match v {
        Value::Int(i) => *i as u32,
        _ => 0,
    }
}

fn uclamp(a: u32, bits: i32) -> u32 {
    if bits <= 0 || bits >= 64 {
        return a;
    }
    if bits >= 32 {
        return a;
    }
    let mask = (1u32 << bits) - 1;
    a & mask
}

fn sclamp(a: u32, bits: i32) -> i64 {
    if bits <= 0 || bits >= 64 {
        return a as i64;
    }
    if bits >= 32 {
        return a as i64;
    }
    let mask = (1u64 << bits) - 1;
    let masked = (a as u64) & mask;
    let sign_bit = 1u64 << (bits - 1);
    if masked & sign_bit != 0 {
        masked as i64 - (1i64 << bits)
    } else {
        masked as i64
    }
}

fn int_pow(base: i64, exp: i64) -> i64 {
    if exp < 0 {
        return 0;
    }
    let mut result: i64 = 1;
    let mut b = base;
    let mut e = exp;
    while e > 0 {
        if e & 1 == 1 {
            result = result.wrapping_mul(b);
        }
        b = b.wrapping_mul(b);
        e >>= 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Bytecode;

    fn chunk_from(instrs: Vec<(OpCode, i32)>, constants: Vec<Value>) -> Rc<Bytecode> {
        let mut bc = Bytecode::new(Some("main".to_string()), Some("test.fun".to_string()));
        for c in constants {
            bc.add_constant(c);
        }
        for (op, operand) in instrs {
            bc.emit(op, operand);
        }
        Rc::new(bc)
    }

    #[test]
    fn arithmetic_and_print() {
        // number a = 2; number b = 3; print(a + b * 4)
        let chunk = chunk_from(
            vec![
                (OpCode::LoadConst, 0),
                (OpCode::LoadConst, 1),
                (OpCode::LoadConst, 2),
                (OpCode::Mul, 0),
                (OpCode::Add, 0),
                (OpCode::Print, 0),
                (OpCode::Halt, 0),
            ],
            vec![Value::Int(2), Value::Int(3), Value::Int(4)],
        );
        let mut vm = Vm::new();
        vm.run(chunk).unwrap();
        let out = vm.drain_output();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Value::Int(14)));
    }

    #[test]
    fn division_by_zero_is_fatal() {
        let chunk = chunk_from(
            vec![(OpCode::LoadConst, 0), (OpCode::LoadConst, 1), (OpCode::Div, 0), (OpCode::Halt, 0)],
            vec![Value::Int(1), Value::Int(0)],
        );
        let mut vm = Vm::new();
        let result = vm.run(chunk);
        assert!(result.is_err());
    }

    #[test]
    fn uclamp_wraps_to_width() {
        // uint8 x = 300 -> 300 mod 256 = 44
        let chunk = chunk_from(
            vec![(OpCode::LoadConst, 0), (OpCode::Uclamp, 8), (OpCode::Print, 0), (OpCode::Halt, 0)],
            vec![Value::Int(300)],
        );
        let mut vm = Vm::new();
        vm.run(chunk).unwrap();
        let out = vm.drain_output();
        assert!(matches!(out[0], Value::Int(44)));
    }

    #[test]
    fn sclamp_sign_extends() {
        // int8 y = 200 -> -56
        let chunk = chunk_from(
            vec![(OpCode::LoadConst, 0), (OpCode::Sclamp, 8), (OpCode::Print, 0), (OpCode::Halt, 0)],
            vec![Value::Int(200)],
        );
        let mut vm = Vm::new();
        vm.run(chunk).unwrap();
        let out = vm.drain_output();
        assert!(matches!(out[0], Value::Int(-56)));
    }

    #[test]
    fn call_and_return() {
        let mut callee = Bytecode::new(Some("inc".to_string()), None);
        callee.emit(OpCode::LoadLocal, 0);
        let c_one2 = callee.add_constant(Value::Int(1));
        callee.emit(OpCode::LoadConst, c_one2 as i32);
        callee.emit(OpCode::Add, 0);
        callee.emit(OpCode::Return, 0);
        let callee_rc = Rc::new(callee);

        let mut main = Bytecode::new(Some("main".to_string()), Some("test.fun".to_string()));
        let f_idx = main.add_constant(Value::Function(callee_rc));
        let c_five = main.add_constant(Value::Int(5));
        main.emit(OpCode::LoadConst, f_idx as i32);
        main.emit(OpCode::LoadConst, c_five as i32);
        main.emit(OpCode::Call, 1);
        main.emit(OpCode::Print, 0);
        main.emit(OpCode::Halt, 0);

        let mut vm = Vm::new();
        vm.run(Rc::new(main)).unwrap();
        let out = vm.drain_output();
        assert!(matches!(out[0], Value::Int(6)));
    }
}
