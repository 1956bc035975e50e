//! Onyx - CLI frontend
//!
//! With no script argument this starts the REPL; with one it interprets
//! the file. Exit codes follow the usual interpreter conventions: 64 for
//! usage errors, 65 for compile errors, 70 for runtime errors, 74 when
//! the file cannot be read.

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::error::ErrorKind;
use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::EnvFilter;

use onyx::compiler;
use onyx::debug::disassemble_chunk;
use onyx::object::Heap;
use onyx::scanner::Scanner;
use onyx::token::TokenKind;
use onyx::{InterpretError, Vm};

#[derive(Parser)]
#[command(name = "onyx")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "The Onyx scripting language", long_about = None)]
struct Cli {
    /// Script to interpret; omit to start the REPL
    script: Option<PathBuf>,

    /// Print the token stream instead of running
    #[arg(long)]
    tokens: bool,

    /// Print the compiled bytecode instead of running
    #[arg(long)]
    bytecode: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => process::exit(0),
            _ => process::exit(64),
        }
    });

    match cli.script {
        Some(path) => {
            let source = read_source(&path);
            if cli.tokens {
                print_tokens(&source);
            } else if cli.bytecode {
                print_bytecode(&source);
            } else {
                run_file(&source);
            }
        }
        None => repl(),
    }
}

fn read_source(path: &PathBuf) -> String {
    fs::read_to_string(path).unwrap_or_else(|err| {
        eprintln!("Could not open file \"{}\": {}.", path.display(), err);
        process::exit(74);
    })
}

fn run_file(source: &str) {
    let mut vm = Vm::new();
    match vm.interpret(source) {
        Ok(()) => {}
        Err(InterpretError::Compile) => process::exit(65),
        Err(InterpretError::Runtime) => process::exit(70),
    }
}

fn print_tokens(source: &str) {
    let mut scanner = Scanner::new(source);
    let mut line = 0;
    loop {
        let token = scanner.next_token();
        if token.line != line {
            print!("{:4} ", token.line);
            line = token.line;
        } else {
            print!("   | ");
        }
        println!("{:?} '{}'", token.kind, token.lexeme);

        if token.kind == TokenKind::Eof {
            break;
        }
    }
}

fn print_bytecode(source: &str) {
    let mut heap = Heap::new();
    match compiler::compile(source, &mut heap) {
        Some(script) => disassemble_chunk(&script.chunk, "script"),
        None => process::exit(65),
    }
}

/// Count the net brace depth of a line, so multi-line blocks can be
/// entered at the prompt
fn brace_depth(line: &str) -> i32 {
    let mut depth = 0;
    for c in line.chars() {
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
    }
    depth
}

fn repl() {
    println!("Onyx {}", env!("CARGO_PKG_VERSION"));
    println!("Press Ctrl+D to exit\n");

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("Could not start line editor: {}", err);
            process::exit(74);
        }
    };

    let mut vm = Vm::new();

    loop {
        let mut buffer = match editor.readline(">> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Read error: {}", err);
                break;
            }
        };

        // Keep reading while braces are unbalanced
        let mut depth = brace_depth(&buffer);
        while depth > 0 {
            match editor.readline(".. ") {
                Ok(line) => {
                    depth += brace_depth(&line);
                    buffer.push('\n');
                    buffer.push_str(&line);
                }
                Err(_) => break,
            }
        }

        if buffer.trim().is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(&buffer);

        // Errors were already reported; the REPL keeps going
        let _ = vm.interpret(&buffer);
    }
}
