pub mod debug;

use crate::chunk::*;
use crate::compiler;
use crate::object::{Heap, NativeFn, ObjFunction, ObjKind};
use crate::table::Table;
use crate::value::{format_number, Value};

// ── Virtual machine ──────────────────────────────────────────────────
//
// Stack interpreter over the bytecode of §compiler. One Vm per driver
// invocation; the REPL feeds it line after line so globals and interned
// strings persist. The native backend shares this Vm: it reads the same
// globals array and reports errors through the same sink.

pub const FRAMES_MAX: usize = 1024;
pub const STACK_MAX: usize = 12500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok = 0,
    CompileError = 1,
    RuntimeError = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Interpreter,
    Native,
}

pub(crate) struct CallFrame {
    pub function: *const ObjFunction,
    pub ip: usize,
    pub base: usize,
}

pub struct Vm {
    pub(crate) heap: Heap,
    stack: Vec<Value>,
    top: usize,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) globals_map: Table<String, u32>,
    pub(crate) global_names: Vec<String>,
    pub(crate) global_values: Vec<Value>,
    pub(crate) trace: bool,
}

impl Vm {
    pub fn new() -> Vm {
        let mut vm = Vm {
            heap: Heap::new(),
            stack: vec![Value::Nil; STACK_MAX],
            top: 0,
            frames: Vec::with_capacity(FRAMES_MAX),
            globals_map: Table::new(),
            global_names: Vec::new(),
            global_values: Vec::new(),
            trace: std::env::var("SKIFF_DEBUG").map_or(false, |v| v == "1"),
        };
        vm.define_native("clock", native_clock);
        vm
    }

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let native = self.heap.new_native(function);
        self.global_values.push(Value::native(native));
        self.global_names.push(name.to_string());
        let index = (self.global_values.len() - 1) as u32;
        self.globals_map.insert(name.to_string(), index);
    }

    pub fn interpret(&mut self, source: &str, backend: Backend) -> InterpretResult {
        let function = match compiler::compile(self, source) {
            Ok(function) => function,
            Err(_) => return InterpretResult::CompileError,
        };

        self.top = 0;
        self.frames.clear();
        self.push(Value::function(function));
        self.frames.push(CallFrame {
            function,
            ip: 0,
            base: 0,
        });

        match backend {
            Backend::Interpreter => self.run(),
            Backend::Native => {
                #[cfg(feature = "llvm")]
                {
                    crate::jit::run_native(self)
                }
                #[cfg(not(feature = "llvm"))]
                {
                    self.run()
                }
            }
        }
    }

    // ── Stack & frame plumbing ───────────────────────────────────

    #[inline]
    fn push(&mut self, value: Value) {
        self.stack[self.top] = value;
        self.top += 1;
    }

    #[inline]
    fn pop(&mut self) -> Value {
        self.top -= 1;
        self.stack[self.top]
    }

    #[inline]
    fn peek(&self, distance: usize) -> Value {
        self.stack[self.top - 1 - distance]
    }

    #[inline]
    fn frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    #[inline]
    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().unwrap()
    }

    #[inline]
    fn chunk(&self) -> &Chunk {
        // SAFETY: the frame's function lives in this VM's heap, which
        // outlives every frame.
        unsafe { &(*self.frame().function).chunk }
    }

    #[inline]
    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        // SAFETY: as in chunk(); ip stays within the chunk because the
        // compiler only emits in-bounds jump targets.
        let byte = unsafe { (&(*frame.function).chunk.code)[frame.ip] };
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let lo = self.read_byte();
        let hi = self.read_byte();
        u16::from(lo) | u16::from(hi) << 8
    }

    fn read_u24(&mut self) -> u32 {
        let b0 = self.read_byte();
        let b1 = self.read_byte();
        let b2 = self.read_byte();
        u32::from(b0) | u32::from(b1) << 8 | u32::from(b2) << 16
    }

    // ── Error reporting ──────────────────────────────────────────

    /// Print `message` and the source line of the instruction at
    /// `op_offset` in the current frame, then clear the stack.
    fn runtime_error(&mut self, op_offset: usize, message: &str) {
        eprintln!("{}", message);
        let line = self.chunk().lines.get(op_offset).copied().unwrap_or(0);
        eprintln!("[line {}]", line);
        self.top = 0;
    }

    /// Error entry point for the native backend's runtime callbacks: `pc`
    /// is a bytecode offset supplied by generated code.
    pub(crate) fn runtime_error_at_pc(&mut self, pc: u32, message: &str) {
        self.runtime_error(pc as usize, message);
    }

    pub(crate) fn global_name(&self, index: usize) -> &str {
        &self.global_names[index]
    }

    // ── Dispatch loop ────────────────────────────────────────────

    fn run(&mut self) -> InterpretResult {
        loop {
            let op_offset = self.frame().ip;
            if self.trace {
                self.print_trace(op_offset);
            }
            let op = self.read_byte();

            match op {
                OP_CONSTANT => {
                    let index = self.read_byte() as usize;
                    let value = self.chunk().constants[index];
                    self.push(value);
                }
                OP_CONSTANT_LONG => {
                    let index = self.read_u24() as usize;
                    let value = self.chunk().constants[index];
                    self.push(value);
                }
                OP_NIL => self.push(Value::Nil),
                OP_TRUE => self.push(Value::Bool(true)),
                OP_FALSE => self.push(Value::Bool(false)),
                OP_POP => {
                    self.pop();
                }
                OP_DUP => {
                    let value = self.peek(0);
                    self.push(value);
                }
                OP_GET_LOCAL => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().base + slot];
                    self.push(value);
                }
                OP_GET_LOCAL_SHORT => {
                    let slot = self.read_u16() as usize;
                    let value = self.stack[self.frame().base + slot];
                    self.push(value);
                }
                OP_SET_LOCAL => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    let value = self.peek(0);
                    self.stack[base + slot] = value;
                }
                OP_SET_LOCAL_SHORT => {
                    let slot = self.read_u16() as usize;
                    let base = self.frame().base;
                    let value = self.peek(0);
                    self.stack[base + slot] = value;
                }
                OP_GET_GLOBAL => {
                    let index = self.read_byte() as usize;
                    if !self.get_global(index, op_offset) {
                        return InterpretResult::RuntimeError;
                    }
                }
                OP_GET_GLOBAL_LONG => {
                    let index = self.read_u24() as usize;
                    if !self.get_global(index, op_offset) {
                        return InterpretResult::RuntimeError;
                    }
                }
                OP_DEFINE_GLOBAL => {
                    let index = self.read_byte() as usize;
                    let value = self.pop();
                    self.global_values[index] = value;
                }
                OP_DEFINE_GLOBAL_LONG => {
                    let index = self.read_u24() as usize;
                    let value = self.pop();
                    self.global_values[index] = value;
                }
                OP_SET_GLOBAL => {
                    let index = self.read_byte() as usize;
                    if !self.set_global(index, op_offset) {
                        return InterpretResult::RuntimeError;
                    }
                }
                OP_SET_GLOBAL_LONG => {
                    let index = self.read_u24() as usize;
                    if !self.set_global(index, op_offset) {
                        return InterpretResult::RuntimeError;
                    }
                }
                OP_EQUAL => {
                    let b = self.pop();
                    let a = self.peek(0);
                    self.stack[self.top - 1] = Value::Bool(a == b);
                }
                OP_GREATER => {
                    if !self.numeric_compare(op_offset, |a, b| a > b) {
                        return InterpretResult::RuntimeError;
                    }
                }
                OP_LESS => {
                    if !self.numeric_compare(op_offset, |a, b| a < b) {
                        return InterpretResult::RuntimeError;
                    }
                }
                OP_ADD => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    let result = if a.is_number() && b.is_number() {
                        Some(Value::Number(a.as_number() + b.as_number()))
                    } else if a.is_string() && b.is_string() {
                        let text = format!(
                            "{}{}",
                            unsafe { &a.as_string().value },
                            unsafe { &b.as_string().value }
                        );
                        Some(Value::string(self.heap.intern(&text)))
                    } else if a.is_string() && b.is_number() {
                        let text = format!(
                            "{}{}",
                            unsafe { &a.as_string().value },
                            format_number(b.as_number())
                        );
                        Some(Value::string(self.heap.intern(&text)))
                    } else if a.is_number() && b.is_string() {
                        let text = format!(
                            "{}{}",
                            format_number(a.as_number()),
                            unsafe { &b.as_string().value }
                        );
                        Some(Value::string(self.heap.intern(&text)))
                    } else {
                        None
                    };
                    match result {
                        Some(value) => {
                            self.pop();
                            self.stack[self.top - 1] = value;
                        }
                        None => {
                            self.runtime_error(op_offset, "Operands must be numbers or strings.");
                            return InterpretResult::RuntimeError;
                        }
                    }
                }
                OP_SUBTRACT => {
                    if !self.numeric_binary(op_offset, |a, b| a - b) {
                        return InterpretResult::RuntimeError;
                    }
                }
                OP_MULTIPLY => {
                    if !self.numeric_binary(op_offset, |a, b| a * b) {
                        return InterpretResult::RuntimeError;
                    }
                }
                OP_DIVIDE => {
                    // Division by zero yields IEEE inf/NaN; no trap.
                    if !self.numeric_binary(op_offset, |a, b| a / b) {
                        return InterpretResult::RuntimeError;
                    }
                }
                OP_MODULO => {
                    if !self.numeric_binary(op_offset, |a, b| a % b) {
                        return InterpretResult::RuntimeError;
                    }
                }
                OP_NOT => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OP_NEGATE => {
                    let value = self.peek(0);
                    if !value.is_number() {
                        self.runtime_error(op_offset, "Operand must be a number.");
                        return InterpretResult::RuntimeError;
                    }
                    self.stack[self.top - 1] = Value::Number(-value.as_number());
                }
                OP_PRINT => {
                    let value = self.pop();
                    println!("{}", value);
                }
                OP_JUMP => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OP_JUMP_IF_FALSE => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OP_JUMP_IF_TRUE => {
                    let offset = self.read_u16() as usize;
                    if !self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OP_JUMP_BACK => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }
                OP_CALL => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    if !self.call_value(callee, arg_count, op_offset) {
                        return InterpretResult::RuntimeError;
                    }
                }
                OP_RETURN => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    if self.frames.is_empty() {
                        return InterpretResult::Ok;
                    }
                    self.top = frame.base;
                    self.push(result);
                }
                _ => {
                    self.runtime_error(op_offset, &format!("Unknown opcode {}.", op));
                    return InterpretResult::RuntimeError;
                }
            }
        }
    }

    fn get_global(&mut self, index: usize, op_offset: usize) -> bool {
        let value = self.global_values[index];
        if value.is_undefined() {
            let message = format!("Undefined variable {}.", self.global_names[index]);
            self.runtime_error(op_offset, &message);
            return false;
        }
        self.push(value);
        true
    }

    fn set_global(&mut self, index: usize, op_offset: usize) -> bool {
        if self.global_values[index].is_undefined() {
            let message = format!("Undefined variable {}.", self.global_names[index]);
            self.runtime_error(op_offset, &message);
            return false;
        }
        // Assignment is an expression: the value stays on the stack.
        let value = self.peek(0);
        self.global_values[index] = value;
        true
    }

    fn numeric_binary(&mut self, op_offset: usize, op: fn(f64, f64) -> f64) -> bool {
        let b = self.pop();
        let a = self.peek(0);
        if !a.is_number() || !b.is_number() {
            self.runtime_error(op_offset, "Operands must be numbers.");
            return false;
        }
        self.stack[self.top - 1] = Value::Number(op(a.as_number(), b.as_number()));
        true
    }

    fn numeric_compare(&mut self, op_offset: usize, op: fn(f64, f64) -> bool) -> bool {
        let b = self.pop();
        let a = self.peek(0);
        if !a.is_number() || !b.is_number() {
            self.runtime_error(op_offset, "Operands must be numbers.");
            return false;
        }
        self.stack[self.top - 1] = Value::Bool(op(a.as_number(), b.as_number()));
        true
    }

    fn call_value(&mut self, callee: Value, arg_count: usize, op_offset: usize) -> bool {
        match callee.obj_kind() {
            Some(ObjKind::Function) => {
                // SAFETY: kind checked; heap outlives the call.
                let function = unsafe { callee.as_function() };
                if arg_count as u32 != function.arity {
                    let message = format!(
                        "Expected {} arguments but got {}.",
                        function.arity, arg_count
                    );
                    self.runtime_error(op_offset, &message);
                    return false;
                }
                if self.frames.len() == FRAMES_MAX {
                    self.runtime_error(op_offset, "Stack overflow.");
                    return false;
                }
                let base = self.top - arg_count - 1;
                self.frames.push(CallFrame {
                    function: function as *const ObjFunction,
                    ip: 0,
                    base,
                });
                true
            }
            Some(ObjKind::Native) => {
                // SAFETY: kind checked; heap outlives the call.
                let native = unsafe { callee.as_native() };
                let args = self.stack[self.top - arg_count..].as_ptr();
                let result = (native.function)(arg_count as u32, args);
                self.top -= arg_count + 1;
                self.push(result);
                true
            }
            _ => {
                self.runtime_error(op_offset, "Can only call functions and classes.");
                false
            }
        }
    }

    fn print_trace(&self, op_offset: usize) {
        let mut line = String::from("          ");
        for value in &self.stack[..self.top] {
            line.push_str(&format!("[ {} ]", value));
        }
        eprintln!("{}", line);
        debug::disassemble_instruction(self.chunk(), op_offset);
    }
}

// ── Built-in natives ─────────────────────────────────────────────────

/// clock(): milliseconds elapsed since local midnight.
fn native_clock(_arg_count: u32, _args: *const Value) -> Value {
    Value::Number(millis_since_midnight())
}

fn millis_since_midnight() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let now_ms = now.as_millis() as f64;

    let secs = now.as_secs() as libc::time_t;
    // SAFETY: localtime_r fills the zeroed tm from a valid time_t; mktime
    // reads only that tm.
    unsafe {
        let mut tm: libc::tm = std::mem::zeroed();
        if libc::localtime_r(&secs, &mut tm).is_null() {
            return now_ms;
        }
        tm.tm_hour = 0;
        tm.tm_min = 0;
        tm.tm_sec = 0;
        let midnight = libc::mktime(&mut tm);
        if midnight == -1 {
            return now_ms;
        }
        now_ms - midnight as f64 * 1000.0
    }
}
