//! Stack-based virtual machine for Onyx bytecode
//!
//! The VM owns every piece of mutable runtime state: the value stack, the
//! call-frame stack, the global environment, the open-upvalue list, and
//! the heap. Execution is a single dispatch loop that runs the current
//! frame's chunk to completion or to the first runtime error.

use std::cell::RefCell;
use std::io::{self, BufRead, Write};
use std::rc::Rc;
use std::time::Instant;

use thiserror::Error;
use tracing::debug;

use crate::chunk::Op;
use crate::compiler;
use crate::object::{Heap, NativeFn, Obj, ObjClosure, ObjString, ObjUpvalue};
use crate::table::Table;
use crate::value::{values_equal, Value};

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// How an `interpret` call went wrong. Compile errors were already
/// reported to stderr token by token; runtime errors come with a stack
/// trace.
#[derive(Debug, Error)]
pub enum InterpretError {
    #[error("compile error")]
    Compile,
    #[error("runtime error")]
    Runtime,
}

/// One function invocation: the running closure, its instruction pointer,
/// and the base of its stack window. `slots` points at the callee itself;
/// arguments and locals follow.
struct CallFrame {
    closure: Rc<ObjClosure>,
    ip: usize,
    slots: usize,
}

macro_rules! binary_op {
    ($vm:expr, $variant:ident, $op:tt) => {{
        let b = $vm.peek(0).clone();
        let a = $vm.peek(1).clone();
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => {
                $vm.pop();
                $vm.pop();
                $vm.push(Value::$variant(a $op b));
            }
            _ => {
                $vm.runtime_error("Operands must be numbers.");
                return Err(InterpretError::Runtime);
            }
        }
    }};
}

pub struct Vm {
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    globals: Table,
    /// Open upvalues, sorted by descending stack slot, no duplicates
    open_upvalues: Vec<Rc<RefCell<ObjUpvalue>>>,
    heap: Heap,
    output: Box<dyn Write>,
    started: Instant,
}

// === Built-in natives ===

/// Seconds elapsed since the VM was created
fn clock_native(vm: &mut Vm, _args: &[Value]) -> Value {
    Value::Number(vm.started.elapsed().as_secs_f64())
}

/// Write the prompt, then read one line from stdin. The trailing newline
/// is kept.
fn input_native(vm: &mut Vm, args: &[Value]) -> Value {
    if let Some(Value::Obj(Obj::String(prompt))) = args.first() {
        let _ = write!(vm.output, "{}", prompt.chars);
        let _ = vm.output.flush();
    }

    let mut line = String::new();
    let _ = io::stdin().lock().read_line(&mut line);
    Value::Obj(Obj::String(vm.heap.take_string(line)))
}

/// Parse a string as a double; unparsable input yields 0
fn num_native(_vm: &mut Vm, args: &[Value]) -> Value {
    match args.first() {
        Some(Value::Obj(Obj::String(s))) => {
            Value::Number(s.chars.trim().parse().unwrap_or(0.0))
        }
        _ => Value::Number(0.0),
    }
}

impl Vm {
    pub fn new() -> Self {
        Vm::with_output(Box::new(io::stdout()))
    }

    /// Build a VM whose `print` statements (and `input` prompts) go to
    /// the given sink instead of stdout
    pub fn with_output(output: Box<dyn Write>) -> Self {
        let mut vm = Vm {
            frames: Vec::with_capacity(FRAMES_MAX),
            stack: Vec::with_capacity(STACK_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            heap: Heap::new(),
            output,
            started: Instant::now(),
        };

        vm.define_native("clock", clock_native);
        vm.define_native("input", input_native);
        vm.define_native("num", num_native);
        vm
    }

    /// Expose a host function to programs under the given name
    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        debug!(name, "registering native");
        let name = self.heap.copy_string(name);
        let native = self.heap.new_native(function);
        self.globals.set(name, Value::Obj(Obj::Native(native)));
    }

    /// Compile and run a source string. The single entry point for both
    /// the REPL and the file runner.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = match compiler::compile(source, &mut self.heap) {
            Some(function) => function,
            None => return Err(InterpretError::Compile),
        };

        self.push(Value::Obj(Obj::Function(function.clone())));
        let closure = self.heap.new_closure(function, Vec::new());
        self.pop();
        self.push(Value::Obj(Obj::Closure(closure.clone())));
        if !self.call(closure, 0) {
            return Err(InterpretError::Runtime);
        }

        self.run()
    }

    // === Stack ABI (also available to natives) ===

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    /// Report a runtime error with a stack trace, innermost frame first,
    /// then reset the stack
    fn runtime_error(&mut self, message: &str) {
        eprintln!("{}", message);

        for frame in self.frames.iter().rev() {
            let function = &frame.closure.function;
            // ip has already moved past the faulting instruction
            let instruction = frame.ip - 1;
            let line = function.chunk.lines[instruction];
            match &function.name {
                Some(name) => eprintln!("[line {}] in {}()", line, name.chars),
                None => eprintln!("[line {}] in script", line),
            }
        }

        self.reset_stack();
    }

    // === Calls ===

    fn call(&mut self, closure: Rc<ObjClosure>, arg_count: usize) -> bool {
        if arg_count != closure.function.arity as usize {
            self.runtime_error(&format!(
                "Expected {} arguments but got {}.",
                closure.function.arity, arg_count
            ));
            return false;
        }

        if self.frames.len() == FRAMES_MAX {
            self.runtime_error("Stack overflow.");
            return false;
        }

        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack.len() - arg_count - 1,
        });
        true
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> bool {
        match callee {
            Value::Obj(Obj::Closure(closure)) => self.call(closure, arg_count),
            Value::Obj(Obj::Native(native)) => {
                // Natives run right here; no frame is pushed. The callee
                // and arguments are replaced by the return value.
                let start = self.stack.len() - arg_count;
                let args: Vec<Value> = self.stack[start..].to_vec();
                let result = (native.function)(self, &args);
                self.stack.truncate(start - 1);
                self.push(result);
                true
            }
            _ => {
                self.runtime_error("Can only call functions and classes.");
                false
            }
        }
    }

    // === Upvalues ===

    /// Return the open upvalue for a stack slot, or create one and link
    /// it into the sorted list
    fn capture_upvalue(&mut self, slot: usize) -> Rc<RefCell<ObjUpvalue>> {
        let mut index = 0;
        while index < self.open_upvalues.len() {
            match self.open_upvalues[index].borrow().open_slot() {
                Some(open) if open > slot => index += 1,
                _ => break,
            }
        }

        if let Some(upvalue) = self.open_upvalues.get(index) {
            if upvalue.borrow().open_slot() == Some(slot) {
                return upvalue.clone();
            }
        }

        let created = self.heap.new_upvalue(slot);
        self.open_upvalues.insert(index, created.clone());
        created
    }

    /// Close every open upvalue at or above `last`: copy the stack value
    /// into the cell and drop it from the open list
    fn close_upvalues(&mut self, last: usize) {
        while let Some(upvalue) = self.open_upvalues.first() {
            let slot = match upvalue.borrow().open_slot() {
                Some(slot) if slot >= last => slot,
                _ => break,
            };
            *upvalue.borrow_mut() = ObjUpvalue::Closed(self.stack[slot].clone());
            self.open_upvalues.remove(0);
        }
    }

    // === Dispatch ===

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let byte = frame.closure.function.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frames.last().unwrap();
        frame.closure.function.chunk.constants[index].clone()
    }

    fn read_string(&mut self) -> Rc<ObjString> {
        match self.read_constant() {
            Value::Obj(Obj::String(s)) => s,
            // The compiler only references name constants here
            _ => unreachable!("constant is not a string"),
        }
    }

    fn frame_slots(&self) -> usize {
        self.frames.last().unwrap().slots
    }

    fn concatenate(&mut self) {
        let b = self.pop();
        let a = self.pop();
        if let (Value::Obj(Obj::String(a)), Value::Obj(Obj::String(b))) = (&a, &b) {
            let chars = format!("{}{}", a.chars, b.chars);
            let result = self.heap.take_string(chars);
            self.push(Value::Obj(Obj::String(result)));
        }
    }

    fn run(&mut self) -> Result<(), InterpretError> {
        loop {
            #[cfg(feature = "trace")]
            {
                print!("          ");
                for value in &self.stack {
                    print!("[ {} ]", value);
                }
                println!();
                let frame = self.frames.last().unwrap();
                crate::debug::disassemble_instruction(&frame.closure.function.chunk, frame.ip);
            }

            match Op::from_byte(self.read_byte()) {
                Op::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                Op::Nil => self.push(Value::Nil),
                Op::True => self.push(Value::Bool(true)),
                Op::False => self.push(Value::Bool(false)),
                Op::Pop => {
                    self.pop();
                }
                Op::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame_slots() + slot].clone();
                    self.push(value);
                }
                Op::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame_slots();
                    self.stack[base + slot] = self.peek(0).clone();
                }
                Op::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(&name) {
                        Some(value) => self.push(value),
                        None => {
                            self.runtime_error(&format!(
                                "Undefined variable '{}'.",
                                name.chars
                            ));
                            return Err(InterpretError::Runtime);
                        }
                    }
                }
                Op::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0).clone();
                    self.globals.set(name, value);
                    self.pop();
                }
                Op::SetGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0).clone();
                    // Assignment must not create the variable; roll the
                    // tentative insert back before reporting
                    if self.globals.set(name.clone(), value) {
                        self.globals.delete(&name);
                        self.runtime_error(&format!(
                            "Undefined variable '{}'.",
                            name.chars
                        ));
                        return Err(InterpretError::Runtime);
                    }
                }
                Op::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.frames.last().unwrap().closure.upvalues[slot].clone();
                    let value = match &*upvalue.borrow() {
                        ObjUpvalue::Open(stack_slot) => self.stack[*stack_slot].clone(),
                        ObjUpvalue::Closed(value) => value.clone(),
                    };
                    self.push(value);
                }
                Op::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.frames.last().unwrap().closure.upvalues[slot].clone();
                    let value = self.peek(0).clone();
                    let mut cell = upvalue.borrow_mut();
                    match &mut *cell {
                        ObjUpvalue::Open(stack_slot) => self.stack[*stack_slot] = value,
                        ObjUpvalue::Closed(closed) => *closed = value,
                    }
                }
                Op::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(values_equal(&a, &b)));
                }
                Op::Greater => binary_op!(self, Bool, >),
                Op::Less => binary_op!(self, Bool, <),
                Op::Add => {
                    match (self.peek(1), self.peek(0)) {
                        (Value::Obj(Obj::String(_)), Value::Obj(Obj::String(_))) => {
                            self.concatenate();
                        }
                        (Value::Number(_), Value::Number(_)) => {
                            binary_op!(self, Number, +);
                        }
                        _ => {
                            self.runtime_error("Operands must be two numbers or two strings.");
                            return Err(InterpretError::Runtime);
                        }
                    }
                }
                Op::Subtract => binary_op!(self, Number, -),
                Op::Multiply => binary_op!(self, Number, *),
                Op::Divide => binary_op!(self, Number, /),
                Op::IntDivide => {
                    let (a, b) = self.number_operands()?;
                    self.push(Value::Number((a.trunc() / b.trunc()).trunc()));
                }
                Op::Modulus => {
                    // C-style remainder: a - trunc(a/b)*b
                    let (a, b) = self.number_operands()?;
                    self.push(Value::Number(a - (a / b).trunc() * b));
                }
                Op::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                Op::Negate => {
                    match self.peek(0) {
                        Value::Number(_) => {}
                        _ => {
                            self.runtime_error("Operand must be a number.");
                            return Err(InterpretError::Runtime);
                        }
                    }
                    if let Value::Number(n) = self.pop() {
                        self.push(Value::Number(-n));
                    }
                }
                Op::Print => {
                    let value = self.pop();
                    let _ = writeln!(self.output, "{}", value);
                }
                Op::Jump => {
                    let offset = self.read_short() as usize;
                    self.frames.last_mut().unwrap().ip += offset;
                }
                Op::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().unwrap().ip += offset;
                    }
                }
                Op::Loop => {
                    let offset = self.read_short() as usize;
                    self.frames.last_mut().unwrap().ip -= offset;
                }
                Op::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count).clone();
                    if !self.call_value(callee, arg_count) {
                        return Err(InterpretError::Runtime);
                    }
                }
                Op::Closure => {
                    let function = match self.read_constant() {
                        Value::Obj(Obj::Function(function)) => function,
                        _ => unreachable!("CLOSURE constant is not a function"),
                    };

                    // One descriptor pair per upvalue: capture a slot of
                    // the running frame, or share one of its cells
                    let mut upvalues = Vec::with_capacity(function.upvalue_count);
                    for _ in 0..function.upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let slot = self.frame_slots() + index;
                            upvalues.push(self.capture_upvalue(slot));
                        } else {
                            let frame = self.frames.last().unwrap();
                            upvalues.push(frame.closure.upvalues[index].clone());
                        }
                    }

                    let closure = self.heap.new_closure(function, upvalues);
                    self.push(Value::Obj(Obj::Closure(closure)));
                }
                Op::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                Op::Return => {
                    let result = self.pop();
                    let slots = self.frame_slots();
                    self.close_upvalues(slots);
                    self.frames.pop();

                    if self.frames.is_empty() {
                        // The top-level script function is still sitting
                        // on the stack
                        self.pop();
                        return Ok(());
                    }

                    self.stack.truncate(slots);
                    self.push(result);
                }
                Op::Invalid => {
                    self.runtime_error("Unknown opcode.");
                    return Err(InterpretError::Runtime);
                }
            }
        }
    }

    /// Pop two numeric operands for an arithmetic opcode
    fn number_operands(&mut self) -> Result<(f64, f64), InterpretError> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(_), Value::Number(_)) => {}
            _ => {
                self.runtime_error("Operands must be numbers.");
                return Err(InterpretError::Runtime);
            }
        }
        let b = match self.pop() {
            Value::Number(b) => b,
            _ => 0.0,
        };
        let a = match self.pop() {
            Value::Number(a) => a,
            _ => 0.0,
        };
        Ok((a, b))
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}
