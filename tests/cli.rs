use std::io::Write;
use std::process::{Command, Output};

use opi::ir::{BinOp, Ir, Loc, Module};

fn opi() -> Command {
    Command::new(env!("CARGO_BIN_EXE_opi"))
}

fn module_file(body: Ir) -> tempfile::NamedTempFile {
    let module = Module { types: Vec::new(), body };
    let mut file = tempfile::NamedTempFile::new().expect("failed to create temp file");
    serde_json::to_writer(&mut file, &module).expect("failed to write module");
    file.flush().expect("failed to flush module");
    file
}

fn run(body: Ir, extra: &[&str]) -> Output {
    let file = module_file(body);
    opi().arg(file.path()).args(extra).output().expect("failed to run opi")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

// --- Running modules ---

#[test]
fn prints_the_result() {
    let add = Ir::func(2, vec![], Ir::binop(BinOp::Add, Ir::var(1), Ir::var(0)));
    let out = run(Ir::apply(add, vec![Ir::num(3.0), Ir::num(2.0)]), &[]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(stdout(&out), "5");
}

#[test]
fn same_result_without_inlining() {
    let add = Ir::func(2, vec![], Ir::binop(BinOp::Add, Ir::var(1), Ir::var(0)));
    let out = run(Ir::apply(add, vec![Ir::num(3.0), Ir::num(2.0)]), &["--no-inline", "--verify"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(stdout(&out), "5");
}

#[test]
fn prints_yielded_values_then_the_result() {
    let body = Ir::Block {
        exprs: vec![Ir::Yield(Box::new(Ir::str("a"))), Ir::Yield(Box::new(Ir::num(2.0))), Ir::str("end")],
        keep: false,
    };
    let out = run(body, &[]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(stdout(&out), "yield \"a\"\nyield 2\n\"end\"");
}

// --- Errors ---

#[test]
fn error_value_exits_nonzero_with_trace() {
    let call = Ir::Apply {
        callee: Box::new(Ir::num(1.0)),
        args: vec![],
        guard: true,
        loc: Some(Loc { file: "main.opi".into(), line: 3 }),
    };
    let out = run(Ir::Block { exprs: vec![call, Ir::nil()], keep: false }, &[]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("undefined(not-a-function)"), "stderr: {}", stderr);
    assert!(stderr.contains("at main.opi:3"), "stderr: {}", stderr);
}

#[test]
fn no_traces_flag_drops_call_sites() {
    let call = Ir::Apply {
        callee: Box::new(Ir::num(1.0)),
        args: vec![],
        guard: true,
        loc: Some(Loc { file: "main.opi".into(), line: 3 }),
    };
    let out = run(Ir::Block { exprs: vec![call, Ir::nil()], keep: false }, &["--no-traces"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(!stderr.contains("main.opi"), "stderr: {}", stderr);
}

#[test]
fn malformed_ir_is_a_compile_error() {
    let out = run(Ir::var(3), &[]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("Compile error"));
}

#[test]
fn invalid_json_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().expect("failed to create temp file");
    file.write_all(b"{ not json").expect("failed to write");
    let out = opi().arg(file.path()).output().expect("failed to run opi");
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("Malformed module"));
}

#[test]
fn missing_file_is_reported() {
    let out = opi().arg("/nonexistent/module.json").output().expect("failed to run opi");
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("Error reading"));
}

// --- Disassembly ---

#[test]
fn dump_shows_units() {
    let f = Ir::func(1, vec![0], Ir::binop(BinOp::Add, Ir::var(0), Ir::var(1)));
    let out = run(Ir::let_in(vec![Ir::num(1.0)], f), &["--dump"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let text = stdout(&out);
    assert!(text.contains("main"), "dump: {}", text);
    assert!(text.contains("FINFN"), "dump: {}", text);
}
