use std::ffi::c_void;

use crate::object::NativeFn;
use crate::value::{format_number, Value};
use crate::vm::{InterpretResult, Vm};

// ── Runtime ABI ──────────────────────────────────────────────────────
//
// C-callable entry points for the polymorphic operations generated code
// cannot specialize: error reporting, type-sensitive `+`, printing and
// native invocation. The generated module declares these by name; the JIT
// binds them to these addresses with add_global_mapping before any lookup.
// Values always cross the boundary by pointer, never by value.

pub(crate) const STATUS_OK: i32 = InterpretResult::Ok as i32;
pub(crate) const STATUS_RUNTIME_ERROR: i32 = InterpretResult::RuntimeError as i32;

/// # Safety
/// `vm` must be the live Vm that launched the generated code.
pub(crate) unsafe extern "C" fn call_error(vm: *mut c_void, pc: u32) {
    let vm = unsafe { &mut *(vm as *mut Vm) };
    vm.runtime_error_at_pc(pc, "Object is not callable.");
}

/// # Safety
/// `vm` must be the live Vm that launched the generated code.
pub(crate) unsafe extern "C" fn number_error(vm: *mut c_void, pc: u32) {
    let vm = unsafe { &mut *(vm as *mut Vm) };
    vm.runtime_error_at_pc(pc, "Operands must be numbers.");
}

/// # Safety
/// `vm` must be the live Vm; `slot` must be a valid global index.
pub(crate) unsafe extern "C" fn variable_error(vm: *mut c_void, slot: u32, pc: u32) {
    let vm = unsafe { &mut *(vm as *mut Vm) };
    let message = format!("Undefined variable {}.", vm.global_name(slot as usize));
    vm.runtime_error_at_pc(pc, &message);
}

/// # Safety
/// `vm` must be the live Vm that launched the generated code.
pub(crate) unsafe extern "C" fn arity_error(vm: *mut c_void, arity: u32, arg_count: u32, pc: u32) {
    let vm = unsafe { &mut *(vm as *mut Vm) };
    let message = format!("Expected {} arguments but got {}.", arity, arg_count);
    vm.runtime_error_at_pc(pc, &message);
}

/// Type-sensitive `+` over non-number-pair operands. Writes the interned
/// result through `out` and returns the interpret status.
///
/// # Safety
/// `vm` must be the live Vm; `out`, `a` and `b` must point at valid Values.
pub(crate) unsafe extern "C" fn concatenate(
    vm: *mut c_void,
    out: *mut Value,
    a: *const Value,
    b: *const Value,
    pc: u32,
) -> i32 {
    let vm = unsafe { &mut *(vm as *mut Vm) };
    let a = unsafe { *a };
    let b = unsafe { *b };

    let text = if a.is_string() && b.is_string() {
        format!("{}{}", unsafe { &a.as_string().value }, unsafe {
            &b.as_string().value
        })
    } else if a.is_string() && b.is_number() {
        format!(
            "{}{}",
            unsafe { &a.as_string().value },
            format_number(b.as_number())
        )
    } else if a.is_number() && b.is_string() {
        format!("{}{}", format_number(a.as_number()), unsafe {
            &b.as_string().value
        })
    } else {
        vm.runtime_error_at_pc(pc, "Operands must be numbers or strings.");
        return STATUS_RUNTIME_ERROR;
    };

    unsafe { *out = Value::string(vm.heap.intern(&text)) };
    STATUS_OK
}

/// # Safety
/// `value` must point at a valid Value whose heap is alive.
pub(crate) unsafe extern "C" fn print_value(value: *const Value) {
    println!("{}", unsafe { *value });
}

/// # Safety
/// `function` must be a NativeFn loaded from a live ObjNative; `args` must
/// point at `arg_count` valid Values; `out` must be writable.
pub(crate) unsafe extern "C" fn call_native(
    function: *const c_void,
    arg_count: u32,
    args: *const Value,
    out: *mut Value,
) {
    let function: NativeFn = unsafe { std::mem::transmute(function) };
    unsafe { *out = function(arg_count, args) };
}
