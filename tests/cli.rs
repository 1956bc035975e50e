//! Integration tests for the CLI frontend
//!
//! These write Onyx programs to temp files and run them through the
//! compiled binary to verify end-to-end behavior and exit codes.

use std::fs;
use std::process::Command;

use tempfile::tempdir;

fn run_script(code: &str) -> std::process::Output {
    let dir = tempdir().expect("failed to create temp dir");
    let path = dir.path().join("script.onyx");
    fs::write(&path, code).expect("failed to write test file");

    Command::new(env!("CARGO_BIN_EXE_onyx"))
        .arg(&path)
        .output()
        .expect("failed to run interpreter")
}

#[test]
fn test_runs_script_and_prints() {
    let output = run_script("print 1 + 2;");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "3\n");
}

#[test]
fn test_compile_error_exits_65() {
    let output = run_script("print 1");
    assert_eq!(output.status.code(), Some(65));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("[line 1] Error"), "stderr: {}", stderr);
}

#[test]
fn test_runtime_error_exits_70_with_trace() {
    let output = run_script("fun f() { return \"a\" + 1; } f();");
    assert_eq!(output.status.code(), Some(70));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Operands must be two numbers or two strings."),
        "stderr: {}",
        stderr
    );
    // Stack trace, innermost frame first
    assert!(stderr.contains("in f()"), "stderr: {}", stderr);
    assert!(stderr.contains("in script"), "stderr: {}", stderr);
}

#[test]
fn test_missing_file_exits_74() {
    let output = Command::new(env!("CARGO_BIN_EXE_onyx"))
        .arg("/no/such/file.onyx")
        .output()
        .expect("failed to run interpreter");
    assert_eq!(output.status.code(), Some(74));
}

#[test]
fn test_extra_arguments_exit_64() {
    let output = Command::new(env!("CARGO_BIN_EXE_onyx"))
        .args(["one.onyx", "two.onyx"])
        .output()
        .expect("failed to run interpreter");
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn test_bytecode_flag_disassembles() {
    let dir = tempdir().expect("failed to create temp dir");
    let path = dir.path().join("script.onyx");
    fs::write(&path, "print 1;").expect("failed to write test file");

    let output = Command::new(env!("CARGO_BIN_EXE_onyx"))
        .arg("--bytecode")
        .arg(&path)
        .output()
        .expect("failed to run interpreter");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("== script =="), "stdout: {}", stdout);
    assert!(stdout.contains("Constant"), "stdout: {}", stdout);
}

#[test]
fn test_tokens_flag_dumps_stream() {
    let dir = tempdir().expect("failed to create temp dir");
    let path = dir.path().join("script.onyx");
    fs::write(&path, "var x = 1;").expect("failed to write test file");

    let output = Command::new(env!("CARGO_BIN_EXE_onyx"))
        .arg("--tokens")
        .arg(&path)
        .output()
        .expect("failed to run interpreter");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Var"), "stdout: {}", stdout);
    assert!(stdout.contains("Identifier"), "stdout: {}", stdout);
    assert!(stdout.contains("Eof"), "stdout: {}", stdout);
}
