//! Bytecode disassembler
//!
//! Backs the `--bytecode` CLI flag and, with the `trace` feature, the
//! per-instruction execution trace. Output only; never affects semantics.

use crate::chunk::{Chunk, Op};
use crate::value::Value;

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {} ==", name);

    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset);
    }
}

/// Print one instruction and return the offset of the next
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    print!("{:04X} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        print!("   | ");
    } else {
        print!("{:4} ", chunk.lines[offset]);
    }

    let op = Op::from_byte(chunk.code[offset]);
    match op {
        Op::Constant | Op::GetGlobal | Op::DefineGlobal | Op::SetGlobal => {
            constant_instruction(op, chunk, offset)
        }
        Op::GetLocal | Op::SetLocal | Op::GetUpvalue | Op::SetUpvalue | Op::Call => {
            byte_instruction(op, chunk, offset)
        }
        Op::Jump | Op::JumpIfFalse => jump_instruction(op, 1, chunk, offset),
        Op::Loop => jump_instruction(op, -1, chunk, offset),
        Op::Closure => closure_instruction(chunk, offset),
        Op::Invalid => {
            println!("Unknown opcode 0x{:02X}", chunk.code[offset]);
            offset + 1
        }
        _ => {
            println!("{:?}", op);
            offset + 1
        }
    }
}

fn constant_instruction(op: Op, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1] as usize;
    println!("{:?} {} '{}'", op, constant, chunk.constants[constant]);
    offset + 2
}

fn byte_instruction(op: Op, chunk: &Chunk, offset: usize) -> usize {
    println!("{:?} {}", op, chunk.code[offset + 1]);
    offset + 2
}

fn jump_instruction(op: Op, sign: i64, chunk: &Chunk, offset: usize) -> usize {
    let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]) as i64;
    let target = offset as i64 + 3 + sign * jump;
    println!("{:?} {:04X} -> {:04X}", op, offset, target);
    offset + 3
}

/// CLOSURE carries a constant index plus one (is_local, index) byte pair
/// per upvalue of the referenced function
fn closure_instruction(chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1] as usize;
    println!("Closure {} '{}'", constant, chunk.constants[constant]);

    let upvalue_count = match &chunk.constants[constant] {
        Value::Obj(crate::object::Obj::Function(function)) => function.upvalue_count,
        _ => 0,
    };

    let mut offset = offset + 2;
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset];
        let index = chunk.code[offset + 1];
        println!(
            "{:04X}    |      {} {}",
            offset,
            if is_local == 1 { "local" } else { "upvalue" },
            index
        );
        offset += 2;
    }
    offset
}
