pub(crate) mod runtime;
mod translate;

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::passes::PassBuilderOptions;
use inkwell::targets::{CodeModel, InitializationConfig, RelocMode, Target, TargetMachine};
use inkwell::OptimizationLevel;

use crate::object::{ObjFunction, ObjKind};
use crate::value::Value;
use crate::vm::{InterpretResult, Vm};

// ── Native backend orchestration ─────────────────────────────────────
//
// One module per interpret call: runtime declarations, the generated
// helpers, one function per user function reachable from the root's
// constants, and a trampoline. The module is optimized at O3, JIT-linked,
// and every function object's compiled-entry slot is installed by symbol
// lookup before the trampoline runs. The engine (and its context) is
// deliberately leaked afterwards so installed entry pointers stay valid
// for the life of the process.

static MAIN_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn run_native(vm: &mut Vm) -> InterpretResult {
    let root = vm.frames.last().expect("script frame installed").function;

    let mut functions: Vec<*const ObjFunction> = Vec::new();
    collect_functions(root, &mut functions);

    // Symbols are uniquified by object index: shadowed definitions may
    // share a user-visible name but never a symbol.
    let symbols: Vec<String> = functions
        .iter()
        .enumerate()
        .map(|(i, &f)| {
            // SAFETY: function objects live in the VM heap.
            let name = unsafe { (*f).name_str() };
            if name == "<script>" {
                format!("__script_{}", i)
            } else {
                format!("{}_{}", name, i)
            }
        })
        .collect();

    let context = Box::leak(Box::new(Context::create()));
    let module = context.create_module("skiff");

    let codegen = match translate::Codegen::new(context, &module) {
        Ok(codegen) => codegen,
        Err(error) => return internal_failure(&error.to_string()),
    };

    let mut generated = Vec::with_capacity(functions.len());
    for (&function, symbol) in functions.iter().zip(&symbols) {
        // SAFETY: as above; the chunk is immutable once compiled.
        let chunk = unsafe { &(*function).chunk };
        match codegen.generate_function(chunk, symbol) {
            Ok(value) => generated.push(value),
            Err(error) => return internal_failure(&error.to_string()),
        }
    }

    let main_name = format!("_main{}", MAIN_COUNTER.fetch_add(1, Ordering::Relaxed));
    if let Err(error) = codegen.generate_main(&main_name, generated[0]) {
        return internal_failure(&error.to_string());
    }

    if let Err(message) = module.verify() {
        return internal_failure(&message.to_string());
    }

    if let Err(message) = optimize(&module) {
        return internal_failure(&message);
    }

    let engine = match module.create_jit_execution_engine(OptimizationLevel::Aggressive) {
        Ok(engine) => engine,
        Err(error) => return internal_failure(&error.to_string()),
    };

    engine.add_global_mapping(&codegen.rt.call_error, runtime::call_error as usize);
    engine.add_global_mapping(&codegen.rt.number_error, runtime::number_error as usize);
    engine.add_global_mapping(&codegen.rt.variable_error, runtime::variable_error as usize);
    engine.add_global_mapping(&codegen.rt.arity_error, runtime::arity_error as usize);
    engine.add_global_mapping(&codegen.rt.concatenate, runtime::concatenate as usize);
    engine.add_global_mapping(&codegen.rt.print, runtime::print_value as usize);
    engine.add_global_mapping(&codegen.rt.call_native, runtime::call_native as usize);

    for (&function, symbol) in functions.iter().zip(&symbols) {
        let address = match engine.get_function_address(symbol) {
            Ok(address) => address,
            Err(error) => return internal_failure(&error.to_string()),
        };
        // SAFETY: the compiled code matches the entry signature; the engine
        // is leaked below, so the address outlives the function object.
        unsafe {
            (*(function as *mut ObjFunction)).entry = Some(std::mem::transmute(address));
        }
    }

    let main_address = match engine.get_function_address(&main_name) {
        Ok(address) => address,
        Err(error) => return internal_failure(&error.to_string()),
    };

    let trampoline: unsafe extern "C" fn(*mut c_void, *mut Value) -> i32 =
        // SAFETY: generate_main emits exactly this signature.
        unsafe { std::mem::transmute(main_address) };

    let globals = vm.global_values.as_mut_ptr();
    let vm_ptr = vm as *mut Vm as *mut c_void;
    // SAFETY: vm and globals stay valid for the whole call; generated code
    // only reaches back through the runtime ABI above.
    let status = unsafe { trampoline(vm_ptr, globals) };

    // Keep the compiled code mapped: entry slots installed above are used
    // by any later native run of functions still reachable from globals.
    std::mem::forget(engine);

    if status == runtime::STATUS_OK {
        InterpretResult::Ok
    } else {
        InterpretResult::RuntimeError
    }
}

fn collect_functions(function: *const ObjFunction, out: &mut Vec<*const ObjFunction>) {
    out.push(function);
    // SAFETY: function objects and their chunks live in the VM heap.
    let chunk = unsafe { &(*function).chunk };
    for constant in &chunk.constants {
        if constant.obj_kind() == Some(ObjKind::Function) {
            let nested = unsafe { constant.as_function() } as *const ObjFunction;
            collect_functions(nested, out);
        }
    }
}

fn optimize(module: &Module) -> Result<(), String> {
    Target::initialize_native(&InitializationConfig::default())?;
    let triple = TargetMachine::get_default_triple();
    let target = Target::from_triple(&triple).map_err(|e| e.to_string())?;
    let machine = target
        .create_target_machine(
            &triple,
            &TargetMachine::get_host_cpu_name().to_string(),
            &TargetMachine::get_host_cpu_features().to_string(),
            OptimizationLevel::Aggressive,
            RelocMode::Default,
            CodeModel::JITDefault,
        )
        .ok_or_else(|| "no native target machine".to_string())?;
    module
        .run_passes("default<O3>", &machine, PassBuilderOptions::create())
        .map_err(|e| e.to_string())
}

fn internal_failure(message: &str) -> InterpretResult {
    eprintln!("native backend failure: {}", message);
    InterpretResult::RuntimeError
}
