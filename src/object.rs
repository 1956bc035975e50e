//! Heap-allocated objects and the allocation registry
//!
//! Every object the program creates is registered with the `Heap` at
//! allocation time and kept alive until the VM is torn down. The registry
//! stands in for the C-style intrusive object list: dropping the heap
//! releases everything in bulk.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

/// An interned string: character buffer plus its precomputed FNV-1a hash
#[derive(Debug)]
pub struct ObjString {
    pub chars: String,
    pub hash: u32,
}

/// A compiled function body. The top-level script is a function with no
/// name and arity 0.
#[derive(Debug)]
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: Option<Rc<ObjString>>,
}

/// Host functions receive the VM (for the push/pop ABI, the heap, and the
/// print sink) and the argument window.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Value;

pub struct ObjNative {
    pub function: NativeFn,
}

impl fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<native fn>")
    }
}

/// A function paired with the upvalue cells it captured
#[derive(Debug)]
pub struct ObjClosure {
    pub function: Rc<ObjFunction>,
    pub upvalues: Vec<Rc<RefCell<ObjUpvalue>>>,
}

/// A captured variable cell. Open upvalues point at a live value-stack
/// slot; when that slot dies the cell is closed and owns the value. The
/// transition is one-way.
#[derive(Debug)]
pub enum ObjUpvalue {
    Open(usize),
    Closed(Value),
}

impl ObjUpvalue {
    pub fn open_slot(&self) -> Option<usize> {
        match self {
            ObjUpvalue::Open(slot) => Some(*slot),
            ObjUpvalue::Closed(_) => None,
        }
    }
}

/// A shared reference to any heap object
#[derive(Debug, Clone)]
pub enum Obj {
    String(Rc<ObjString>),
    Function(Rc<ObjFunction>),
    Native(Rc<ObjNative>),
    Closure(Rc<ObjClosure>),
    Upvalue(Rc<RefCell<ObjUpvalue>>),
}

impl Obj {
    /// Identity comparison: two references are equal iff they address the
    /// same heap object
    pub fn ptr_eq(&self, other: &Obj) -> bool {
        match (self, other) {
            (Obj::String(a), Obj::String(b)) => Rc::ptr_eq(a, b),
            (Obj::Function(a), Obj::Function(b)) => Rc::ptr_eq(a, b),
            (Obj::Native(a), Obj::Native(b)) => Rc::ptr_eq(a, b),
            (Obj::Closure(a), Obj::Closure(b)) => Rc::ptr_eq(a, b),
            (Obj::Upvalue(a), Obj::Upvalue(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

fn print_function(f: &mut fmt::Formatter<'_>, function: &ObjFunction) -> fmt::Result {
    match &function.name {
        Some(name) => write!(f, "<fn {}>", name.chars),
        None => write!(f, "<script>"),
    }
}

impl fmt::Display for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Obj::String(s) => write!(f, "{}", s.chars),
            Obj::Function(function) => print_function(f, function),
            Obj::Native(_) => write!(f, "<native fn>"),
            Obj::Closure(closure) => print_function(f, &closure.function),
            Obj::Upvalue(_) => write!(f, "upvalue"),
        }
    }
}

/// FNV-1a, the same 32-bit hash the intern table buckets by
pub fn hash_string(chars: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in chars.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Owns one strong reference to every allocation plus the string intern
/// table. The compiler and the VM both allocate through it.
pub struct Heap {
    objects: Vec<Obj>,
    strings: Table,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            objects: Vec::new(),
            strings: Table::new(),
        }
    }

    fn track(&mut self, obj: Obj) {
        self.objects.push(obj);
    }

    /// Number of live heap objects, for teardown accounting
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Intern an owned string, reusing the existing object when one with
    /// the same contents is already live
    pub fn take_string(&mut self, chars: String) -> Rc<ObjString> {
        let hash = hash_string(&chars);
        if let Some(existing) = self.strings.find_string(&chars, hash) {
            return existing;
        }

        let string = Rc::new(ObjString { chars, hash });
        self.track(Obj::String(string.clone()));
        self.strings.set(string.clone(), Value::Nil);
        string
    }

    /// Intern a borrowed string
    pub fn copy_string(&mut self, chars: &str) -> Rc<ObjString> {
        self.take_string(chars.to_string())
    }

    pub fn new_function(&mut self, function: ObjFunction) -> Rc<ObjFunction> {
        let function = Rc::new(function);
        self.track(Obj::Function(function.clone()));
        function
    }

    pub fn new_native(&mut self, function: NativeFn) -> Rc<ObjNative> {
        let native = Rc::new(ObjNative { function });
        self.track(Obj::Native(native.clone()));
        native
    }

    pub fn new_closure(
        &mut self,
        function: Rc<ObjFunction>,
        upvalues: Vec<Rc<RefCell<ObjUpvalue>>>,
    ) -> Rc<ObjClosure> {
        let closure = Rc::new(ObjClosure { function, upvalues });
        self.track(Obj::Closure(closure.clone()));
        closure
    }

    pub fn new_upvalue(&mut self, slot: usize) -> Rc<RefCell<ObjUpvalue>> {
        let upvalue = Rc::new(RefCell::new(ObjUpvalue::Open(slot)));
        self.track(Obj::Upvalue(upvalue.clone()));
        upvalue
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_dedups_by_content() {
        let mut heap = Heap::new();
        let a = heap.copy_string("counter");
        let b = heap.copy_string("counter");
        assert!(Rc::ptr_eq(&a, &b));
        // Only one string object was allocated
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn test_distinct_contents_distinct_objects() {
        let mut heap = Heap::new();
        let a = heap.copy_string("foo");
        let b = heap.copy_string("bar");
        assert!(!Rc::ptr_eq(&a, &b));
        assert_eq!(heap.object_count(), 2);
    }

    #[test]
    fn test_take_string_reuses_interned() {
        let mut heap = Heap::new();
        let a = heap.copy_string("foobar");
        // Simulates concatenation producing an already-known string
        let b = heap.take_string(format!("{}{}", "foo", "bar"));
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_hash_is_fnv1a() {
        // Reference values for the 32-bit FNV-1a parameters
        assert_eq!(hash_string(""), 2166136261);
        assert_eq!(hash_string("a"), 0xe40c292c);
    }

    #[test]
    fn test_every_allocation_is_tracked() {
        let mut heap = Heap::new();
        let name = heap.copy_string("f");
        let function = heap.new_function(ObjFunction {
            arity: 0,
            upvalue_count: 0,
            chunk: crate::chunk::Chunk::new(),
            name: Some(name),
        });
        heap.new_closure(function, Vec::new());
        heap.new_upvalue(0);
        assert_eq!(heap.object_count(), 4);
    }
}
