#![warn(clippy::all)]

mod chunk;
mod compiler;
#[cfg(feature = "llvm")]
mod jit;
mod lexer;
mod object;
mod table;
mod value;
mod vm;

use std::io::{self, BufRead, Write};
use std::process::exit;

use vm::{Backend, InterpretResult, Vm};

/// Backend selection stays out of argv (the argument-count contract is
/// exact): SKIFF_BACKEND=vm forces the interpreter, SKIFF_BACKEND=native
/// the compiled backend. Default is native when compiled in.
fn backend_from_env() -> Backend {
    let default = if cfg!(feature = "llvm") {
        Backend::Native
    } else {
        Backend::Interpreter
    };
    match std::env::var("SKIFF_BACKEND").as_deref() {
        Ok("vm") | Ok("interp") => Backend::Interpreter,
        Ok("native") | Ok("jit") => Backend::Native,
        _ => default,
    }
}

fn repl(vm: &mut Vm, backend: Backend) {
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        let _ = io::stdout().flush();

        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                println!();
                break;
            }
            Ok(_) => {
                if !line.ends_with('\n') {
                    line.push('\n');
                }
                vm.interpret(&line, backend);
            }
            Err(_) => break,
        }
    }
}

fn run_file(vm: &mut Vm, path: &str, backend: Backend) -> ! {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(_) => {
            eprintln!("Could not open or read the file \"{}\".", path);
            exit(47);
        }
    };

    match vm.interpret(&source, backend) {
        InterpretResult::Ok => exit(0),
        InterpretResult::CompileError => exit(65),
        InterpretResult::RuntimeError => exit(70),
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let backend = backend_from_env();
    let mut vm = Vm::new();

    match args.len() {
        1 => repl(&mut vm, backend),
        2 => run_file(&mut vm, &args[1], backend),
        _ => {
            eprintln!("Usage: skiff [path]");
            exit(64);
        }
    }
}
