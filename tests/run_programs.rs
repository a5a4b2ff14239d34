use std::io::Write;
use std::process::{Command, Output, Stdio};

fn skiff() -> Command {
    Command::new(env!("CARGO_BIN_EXE_skiff"))
}

fn backends() -> Vec<&'static str> {
    if cfg!(feature = "llvm") {
        vec!["vm", "native"]
    } else {
        vec!["vm"]
    }
}

fn write_program(name: &str, source: &str) -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("skiff-test-{}-{}.skf", std::process::id(), name));
    std::fs::write(&path, source).expect("failed to write test program");
    path
}

fn run_with(backend: &str, name: &str, source: &str) -> Output {
    let path = write_program(&format!("{}-{}", name, backend), source);
    let out = skiff()
        .env("SKIFF_BACKEND", backend)
        .arg(&path)
        .output()
        .expect("failed to run skiff");
    let _ = std::fs::remove_file(&path);
    out
}

fn assert_stdout(name: &str, source: &str, expected: &str) {
    for backend in backends() {
        let out = run_with(backend, name, source);
        assert!(
            out.status.success(),
            "[{}] expected success, stderr: {}",
            backend,
            String::from_utf8_lossy(&out.stderr)
        );
        assert_eq!(
            String::from_utf8_lossy(&out.stdout),
            expected,
            "[{}] stdout mismatch",
            backend
        );
    }
}

fn assert_runtime_error(name: &str, source: &str, message: &str, line: &str) {
    for backend in backends() {
        let out = run_with(backend, name, source);
        assert_eq!(out.status.code(), Some(70), "[{}] exit code", backend);
        let stderr = String::from_utf8_lossy(&out.stderr);
        assert!(
            stderr.contains(message),
            "[{}] stderr missing {:?}, got: {}",
            backend,
            message,
            stderr
        );
        assert!(
            stderr.contains(line),
            "[{}] stderr missing {:?}, got: {}",
            backend,
            line,
            stderr
        );
        assert!(out.stdout.is_empty(), "[{}] expected empty stdout", backend);
    }
}

// --- End-to-end scenarios ---

#[test]
fn arithmetic_precedence() {
    assert_stdout("precedence", "print 1 + 2 * 3;\n", "7\n");
}

#[test]
fn scope_and_shadowing() {
    assert_stdout(
        "shadowing",
        "var x = 1;\n{ var x = x + 1; print x; }\nprint x;\n",
        "2\n1\n",
    );
}

#[test]
fn recursion_prints_in_g_format() {
    assert_stdout(
        "factorial",
        "fun fact(n){ if (n <= 1) return 1; return n * fact(n-1); }\nprint fact(10);\n",
        "3.6288e+06\n",
    );
}

#[test]
fn loop_with_continue_and_break() {
    assert_stdout(
        "loop-control",
        "var s = 0;\n\
         for (var i=0; i<10; i = i+1) { if (i == 5) continue; if (i == 8) break; s = s + i; }\n\
         print s;\n",
        "18\n",
    );
}

#[test]
fn switch_runs_exactly_one_case() {
    assert_stdout(
        "switch",
        "switch (2) { case 1: print 1; case 2: print 2; case 3: print 3; default: print 0; }\n",
        "2\n",
    );
}

#[test]
fn switch_default_when_no_case_matches() {
    assert_stdout(
        "switch-default",
        "switch (42) { case 1: print 1; default: print 0; }\n",
        "0\n",
    );
}

#[test]
fn runtime_type_error_reports_line() {
    assert_runtime_error(
        "type-error",
        "print \"x\" - 1;\n",
        "Operands must be numbers.",
        "[line 1]",
    );
}

#[test]
fn string_number_coercion() {
    assert_stdout("coercion", "print \"answer=\" + 42;\n", "answer=42\n");
}

#[test]
fn undefined_global_reports_name() {
    assert_runtime_error(
        "undefined",
        "print y;\n",
        "Undefined variable y.",
        "[line 1]",
    );
}

#[test]
fn arity_mismatch_is_a_runtime_error() {
    assert_runtime_error(
        "arity",
        "fun f(a, b) { return a; }\nf(1);\n",
        "Expected 2 arguments but got 1.",
        "[line 2]",
    );
}

#[test]
fn calling_a_number_fails() {
    for backend in backends() {
        let out = run_with(backend, "not-callable", "var x = 1;\nx();\n");
        assert_eq!(out.status.code(), Some(70), "[{}]", backend);
        let stderr = String::from_utf8_lossy(&out.stderr);
        assert!(
            stderr.contains("not callable") || stderr.contains("Can only call"),
            "[{}] got: {}",
            backend,
            stderr
        );
    }
}

#[test]
fn logic_and_truthiness() {
    assert_stdout(
        "logic",
        "print true and 3;\nprint false or \"s\";\nprint !0;\nprint nil == false;\n",
        "3\ns\nfalse\nfalse\n",
    );
}

#[test]
fn number_formatting_matches_printf_g() {
    assert_stdout(
        "formatting",
        "print 0.5;\nprint 100000;\nprint 1000000;\nprint 1/3;\nprint -0.0001;\nprint 10 % 3;\n",
        "0.5\n100000\n1e+06\n0.333333\n-0.0001\n1\n",
    );
}

#[test]
fn strings_intern_and_compare_by_identity() {
    assert_stdout(
        "interning",
        "var a = \"he\" + \"llo\";\nprint a == \"hello\";\nprint \"a\" == \"b\";\n",
        "true\nfalse\n",
    );
}

#[test]
fn multiline_strings_are_allowed() {
    assert_stdout(
        "multiline",
        "print \"line one\nline two\";\n",
        "line one\nline two\n",
    );
}

#[test]
fn functions_print_their_names() {
    assert_stdout(
        "fn-display",
        "fun greet() { }\nprint greet;\nprint clock() >= 0;\n",
        "<fn greet>\ntrue\n",
    );
}

#[test]
fn nested_calls_and_globals_interleave() {
    assert_stdout(
        "nested-calls",
        "var total = 0;\n\
         fun bump(by) { total = total + by; return total; }\n\
         fun twice(f, x) { return x; }\n\
         print bump(1);\nprint bump(2);\nprint bump(3);\nprint total;\n",
        "1\n3\n6\n6\n",
    );
}

// --- Error-path exit codes ---

#[test]
fn compile_error_exits_65() {
    for backend in backends() {
        let out = run_with(backend, "compile-error", "print 1\n");
        assert_eq!(out.status.code(), Some(65), "[{}]", backend);
        let stderr = String::from_utf8_lossy(&out.stderr);
        assert!(stderr.contains("[line 1] Error"), "[{}] got: {}", backend, stderr);
    }
}

#[test]
fn unterminated_string_is_a_compile_error() {
    let out = run_with("vm", "unterminated", "print \"oops;\n");
    assert_eq!(out.status.code(), Some(65));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains("Unterminated string."),
        "got: {}",
        stderr
    );
}

#[test]
fn compile_errors_recover_and_report_per_statement() {
    let out = run_with("vm", "multi-error", "var 1 = 2;\nprint ];\n");
    assert_eq!(out.status.code(), Some(65));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("[line 1]"), "got: {}", stderr);
    assert!(stderr.contains("[line 2]"), "got: {}", stderr);
}

#[test]
fn missing_file_exits_47() {
    let out = skiff()
        .arg("/definitely/not/a/real/file.skf")
        .output()
        .expect("failed to run skiff");
    assert_eq!(out.status.code(), Some(47));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Could not open or read the file"), "got: {}", stderr);
}

#[test]
fn extra_arguments_exit_64() {
    let out = skiff()
        .args(["a.skf", "b.skf"])
        .output()
        .expect("failed to run skiff");
    assert_eq!(out.status.code(), Some(64));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Usage"), "got: {}", stderr);
}

// --- REPL ---

#[test]
fn repl_evaluates_lines_until_eof() {
    let mut child = skiff()
        .env("SKIFF_BACKEND", "vm")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn repl");

    child
        .stdin
        .as_mut()
        .expect("stdin")
        .write_all(b"var x = 20;\nprint x + 2;\n")
        .expect("write to repl");

    let out = child.wait_with_output().expect("repl output");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("22"), "got: {}", stdout);
    assert!(stdout.starts_with("> "), "got: {}", stdout);
}

#[test]
fn repl_survives_errors_and_keeps_globals() {
    let mut child = skiff()
        .env("SKIFF_BACKEND", "vm")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn repl");

    child
        .stdin
        .as_mut()
        .expect("stdin")
        .write_all(b"var kept = 7;\nprint missing;\nprint kept;\n")
        .expect("write to repl");

    let out = child.wait_with_output().expect("repl output");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains('7'), "got: {}", stdout);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Undefined variable missing."), "got: {}", stderr);
}

// --- Backend equivalence ---

#[test]
fn backends_produce_identical_stdout() {
    if !cfg!(feature = "llvm") {
        return;
    }
    let source = "\
        fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }\n\
        fun shout(word, times) {\n\
          var s = \"\";\n\
          for (var i = 0; i < times; i = i + 1) { s = s + word; }\n\
          return s;\n\
        }\n\
        print fib(15);\n\
        print shout(\"ab\", 3);\n\
        var total = 0;\n\
        for (var i = 0; i < 20; i = i + 1) {\n\
          if (i % 2 == 0) continue;\n\
          if (i > 15) break;\n\
          total = total + i;\n\
        }\n\
        print total;\n\
        switch (total) { case 64: print \"exact\"; default: print \"other\"; }\n\
        print \"value=\" + total;\n\
        print 1/3;\n\
        print -0 == 0;\n";

    let vm_out = run_with("vm", "equivalence", source);
    let native_out = run_with("native", "equivalence", source);
    assert!(vm_out.status.success(), "vm: {}", String::from_utf8_lossy(&vm_out.stderr));
    assert!(
        native_out.status.success(),
        "native: {}",
        String::from_utf8_lossy(&native_out.stderr)
    );
    assert_eq!(
        String::from_utf8_lossy(&vm_out.stdout),
        String::from_utf8_lossy(&native_out.stdout),
        "backends disagree"
    );
}

#[test]
fn native_backend_handles_natives_and_errors() {
    if !cfg!(feature = "llvm") {
        return;
    }
    let out = run_with("native", "native-clock", "print clock() >= 0;\n");
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert_eq!(String::from_utf8_lossy(&out.stdout), "true\n");

    let out = run_with("native", "native-error", "print 1 + nil;\n");
    assert_eq!(out.status.code(), Some(70));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains("Operands must be numbers or strings."),
        "got: {}",
        stderr
    );
}
