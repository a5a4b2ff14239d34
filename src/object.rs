use std::ffi::c_void;

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

// ── Heap objects ─────────────────────────────────────────────────────
//
// Every heap object starts with an ObjHeader so a *const ObjHeader can be
// kind-dispatched, by the interpreter and by generated code alike. The
// structs are repr(C): the native backend reads `kind`, `arity`, `entry`
// and `function` through byte offsets taken with `mem::offset_of!`.

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjKind {
    String = 0,
    Function = 1,
    Native = 2,
}

#[repr(C)]
pub struct ObjHeader {
    pub kind: ObjKind,
    /// Identity hash, assigned at allocation (the allocation address).
    pub hash: u64,
}

#[repr(C)]
pub struct ObjString {
    pub header: ObjHeader,
    pub value: String,
}

/// Host built-in: `(arg_count, args base)` to result value.
pub type NativeFn = fn(arg_count: u32, args: *const Value) -> Value;

/// Compiled entry point installed by the native backend:
/// `(vm, globals, stack window, stack top) -> interpret result code`.
pub type NativeEntry = unsafe extern "C" fn(
    vm: *mut c_void,
    globals: *mut Value,
    stack: *mut Value,
    stack_top: *mut i32,
) -> i32;

#[repr(C)]
pub struct ObjFunction {
    pub header: ObjHeader,
    pub arity: u32,
    /// Interned name; null for the top-level script.
    pub name: *const ObjString,
    /// Compiled entry point, populated when the native backend is used.
    pub entry: Option<NativeEntry>,
    pub chunk: Chunk,
}

impl ObjFunction {
    pub fn name_str(&self) -> &str {
        // SAFETY: `name` is either null or an interned string owned by the
        // same heap as this function.
        unsafe { self.name.as_ref().map_or("<script>", |s| s.value.as_str()) }
    }
}

#[repr(C)]
pub struct ObjNative {
    pub header: ObjHeader,
    pub function: NativeFn,
}

// ── Heap ─────────────────────────────────────────────────────────────
//
// The VM-owned object pool. Allocations are boxed so their addresses are
// stable for the lifetime of the heap; the vector is the "all objects"
// list, drained when the VM is dropped. Strings are interned by content.

enum ObjAlloc {
    Str(Box<ObjString>),
    Fun(Box<ObjFunction>),
    Native(Box<ObjNative>),
}

pub struct Heap {
    objects: Vec<ObjAlloc>,
    strings: Table<String, *const ObjString>,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            objects: Vec::new(),
            strings: Table::new(),
        }
    }

    /// Intern `text`: creating a string with existing content returns the
    /// existing object.
    pub fn intern(&mut self, text: &str) -> *const ObjString {
        let key = text.to_string();
        if let Some(&existing) = self.strings.get(&key) {
            return existing;
        }

        let mut obj = Box::new(ObjString {
            header: ObjHeader {
                kind: ObjKind::String,
                hash: 0,
            },
            value: key.clone(),
        });
        obj.header.hash = &*obj as *const ObjString as u64;
        let ptr = &*obj as *const ObjString;
        self.objects.push(ObjAlloc::Str(obj));
        self.strings.insert(key, ptr);
        ptr
    }

    pub fn new_function(
        &mut self,
        name: *const ObjString,
        arity: u32,
        chunk: Chunk,
    ) -> *const ObjFunction {
        let mut obj = Box::new(ObjFunction {
            header: ObjHeader {
                kind: ObjKind::Function,
                hash: 0,
            },
            arity,
            name,
            entry: None,
            chunk,
        });
        obj.header.hash = &*obj as *const ObjFunction as u64;
        let ptr = &*obj as *const ObjFunction;
        self.objects.push(ObjAlloc::Fun(obj));
        ptr
    }

    pub fn new_native(&mut self, function: NativeFn) -> *const ObjNative {
        let mut obj = Box::new(ObjNative {
            header: ObjHeader {
                kind: ObjKind::Native,
                hash: 0,
            },
            function,
        });
        obj.header.hash = &*obj as *const ObjNative as u64;
        let ptr = &*obj as *const ObjNative;
        self.objects.push(ObjAlloc::Native(obj));
        ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_same_object() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert!(std::ptr::eq(a, b));
        assert!(!std::ptr::eq(a, c));
    }

    #[test]
    fn identity_hash_is_stable_and_distinct() {
        let mut heap = Heap::new();
        let a = heap.intern("a");
        let b = heap.intern("b");
        let (ha, hb) = unsafe { ((*a).header.hash, (*b).header.hash) };
        assert_ne!(ha, 0);
        assert_ne!(ha, hb);
        assert_eq!(ha, a as u64);
    }

    #[test]
    fn function_name_falls_back_to_script() {
        let mut heap = Heap::new();
        let anon = heap.new_function(std::ptr::null(), 0, Chunk::new());
        assert_eq!(unsafe { (*anon).name_str() }, "<script>");

        let name = heap.intern("fact");
        let named = heap.new_function(name, 1, Chunk::new());
        assert_eq!(unsafe { (*named).name_str() }, "fact");
    }

    #[test]
    fn addresses_survive_pool_growth() {
        let mut heap = Heap::new();
        let first = heap.intern("pinned");
        for i in 0..100 {
            heap.intern(&format!("s{}", i));
        }
        assert_eq!(unsafe { (*first).value.as_str() }, "pinned");
    }
}
