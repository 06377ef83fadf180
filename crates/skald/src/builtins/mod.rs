//! The native-function registry and the core builtins.
//!
//! Natives follow one uniform convention: `fn(&mut NativeCtx, &[Value]) ->
//! RunResult<Value>`. The argument slice aliases the VM's value stack, so
//! every argument is a GC root for the duration of the call; natives may
//! allocate freely through the context and either return a single value or
//! raise a typed runtime error. The registry is populated before any source
//! runs and is read-only afterward.

mod array;
mod convert;
mod dict;
mod len;
mod math;
mod print;
mod string;

use ahash::AHashMap;

use crate::{
    bytecode::Program,
    error::RunResult,
    heap::{Heap, HeapData},
    io::PrintWriter,
    value::{Value, format_float},
};

/// Nesting depth at which value rendering gives up on containers.
///
/// Guards against self-referential arrays/dicts; real data never gets close.
const MAX_RENDER_DEPTH: usize = 16;

/// Index of a registered native function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeId(u32);

/// Uniform native call convention.
pub type NativeFn<P> = fn(&mut NativeCtx<'_, P>, &[Value]) -> RunResult<Value>;

/// One registered native function.
pub(crate) struct NativeEntry<P: PrintWriter> {
    pub(crate) name: Box<str>,
    /// Declared argument count; `-1` accepts any number.
    pub(crate) arity: i8,
    pub(crate) func: NativeFn<P>,
}

/// Name → native function mapping, owned by a `Vm`.
pub(crate) struct NativeRegistry<P: PrintWriter> {
    entries: Vec<NativeEntry<P>>,
    by_name: AHashMap<Box<str>, NativeId>,
}

impl<P: PrintWriter> NativeRegistry<P> {
    /// Creates a registry pre-populated with the core builtins.
    pub(crate) fn with_defaults() -> Self {
        let mut registry = Self {
            entries: Vec::new(),
            by_name: AHashMap::new(),
        };
        registry.register("print", -1, print::builtin_print::<P>);
        registry.register("len", 1, len::builtin_len::<P>);
        registry.register("push", 2, array::builtin_push::<P>);
        registry.register("pop", 1, array::builtin_pop::<P>);
        registry.register("contains", 2, array::builtin_contains::<P>);
        registry.register("chars", 1, array::builtin_chars::<P>);
        registry.register("keys", 1, dict::builtin_keys::<P>);
        registry.register("values", 1, dict::builtin_values::<P>);
        registry.register("has", 2, dict::builtin_has::<P>);
        registry.register("str", 1, convert::builtin_str::<P>);
        registry.register("int", 1, convert::builtin_int::<P>);
        registry.register("float", 1, convert::builtin_float::<P>);
        registry.register("type", 1, convert::builtin_type::<P>);
        registry.register("abs", 1, math::builtin_abs::<P>);
        registry.register("min", -1, math::builtin_min::<P>);
        registry.register("max", -1, math::builtin_max::<P>);
        registry.register("floor", 1, math::builtin_floor::<P>);
        registry.register("ceil", 1, math::builtin_ceil::<P>);
        registry.register("round", 1, math::builtin_round::<P>);
        registry.register("sqrt", 1, math::builtin_sqrt::<P>);
        registry.register("sort", 1, array::builtin_sort::<P>);
        registry.register("reverse", 1, array::builtin_reverse::<P>);
        registry.register("concat", 2, array::builtin_concat::<P>);
        registry.register("upper", 1, string::builtin_upper::<P>);
        registry.register("lower", 1, string::builtin_lower::<P>);
        registry.register("trim", 1, string::builtin_trim::<P>);
        registry.register("split", 2, string::builtin_split::<P>);
        registry.register("join", 2, string::builtin_join::<P>);
        registry.register("find", 2, string::builtin_find::<P>);
        registry.register("replace", 3, string::builtin_replace::<P>);
        registry.register("slice", 3, string::builtin_slice::<P>);
        registry
    }

    /// Registers (or replaces) a native function.
    pub(crate) fn register(&mut self, name: &str, arity: i8, func: NativeFn<P>) {
        if let Some(&id) = self.by_name.get(name) {
            self.entries[id.0 as usize] = NativeEntry {
                name: name.into(),
                arity,
                func,
            };
            return;
        }
        let id = NativeId(u32::try_from(self.entries.len()).expect("native count exceeds u32"));
        self.entries.push(NativeEntry {
            name: name.into(),
            arity,
            func,
        });
        self.by_name.insert(name.into(), id);
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<NativeId> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn entry(&self, id: NativeId) -> &NativeEntry<P> {
        &self.entries[id.0 as usize]
    }

    pub(crate) fn name(&self, id: NativeId) -> &str {
        &self.entries[id.0 as usize].name
    }
}

/// Execution context handed to native functions.
///
/// Exposes the heap (allocation, object access), the program (for rendering
/// function names), and the print writer. Holding heap ids across
/// allocations is safe inside one native call: the collector only runs at
/// the VM's dispatch safe point.
pub struct NativeCtx<'a, P: PrintWriter> {
    pub(crate) heap: &'a mut Heap,
    pub(crate) out: &'a mut P,
    pub(crate) program: &'a Program,
    natives: &'a NativeRegistry<P>,
}

impl<'a, P: PrintWriter> NativeCtx<'a, P> {
    pub(crate) fn new(
        heap: &'a mut Heap,
        out: &'a mut P,
        program: &'a Program,
        natives: &'a NativeRegistry<P>,
    ) -> Self {
        Self {
            heap,
            out,
            program,
            natives,
        }
    }

    /// Allocates (or reuses) an interned string value.
    pub fn string(&mut self, text: &str) -> Value {
        Value::Ref(self.heap.alloc_str(text))
    }

    /// Allocates an array value.
    pub fn array(&mut self, items: Vec<Value>) -> Value {
        Value::Ref(self.heap.alloc(HeapData::Array(items)))
    }

    /// Content of a string value, if it is one.
    #[must_use]
    pub fn as_str(&self, value: Value) -> Option<&str> {
        match value {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Str(text) => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    /// The value's type name, as the `type` builtin reports it.
    #[must_use]
    pub fn type_name(&self, value: Value) -> &'static str {
        value.type_name(self.heap)
    }

    /// Writes program output through the VM's print writer.
    pub fn write(&mut self, text: &str) {
        self.out.write_str(text);
    }

    /// Renders a value the way `print` shows it: strings bare, everything
    /// else in literal form.
    #[must_use]
    pub fn render(&self, value: Value) -> String {
        let mut out = String::new();
        self.render_into(value, &mut out);
        out
    }

    /// Appends the `print` form of a value to a buffer.
    pub fn render_into(&self, value: Value, out: &mut String) {
        if let Value::Ref(id) = value
            && let HeapData::Str(text) = self.heap.get(id)
        {
            out.push_str(text);
            return;
        }
        self.render_repr(value, out, 0);
    }

    /// Literal form: strings quoted, containers recursive.
    fn render_repr(&self, value: Value, out: &mut String, depth: usize) {
        if depth > MAX_RENDER_DEPTH {
            out.push_str("...");
            return;
        }
        match value {
            Value::Nil => out.push_str("nil"),
            Value::Bool(true) => out.push_str("true"),
            Value::Bool(false) => out.push_str("false"),
            Value::Int(v) => {
                out.push_str(&v.to_string());
            }
            Value::Float(v) => out.push_str(&format_float(v)),
            Value::Function(func) => {
                out.push_str("<fn ");
                out.push_str(&self.program.proto(func).name);
                out.push('>');
            }
            Value::Native(native) => {
                out.push_str("<native fn ");
                out.push_str(self.natives.name(native));
                out.push('>');
            }
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Str(text) => {
                    out.push('"');
                    for ch in text.chars() {
                        match ch {
                            '"' => out.push_str("\\\""),
                            '\\' => out.push_str("\\\\"),
                            '\n' => out.push_str("\\n"),
                            '\t' => out.push_str("\\t"),
                            '\r' => out.push_str("\\r"),
                            other => out.push(other),
                        }
                    }
                    out.push('"');
                }
                HeapData::Array(items) => {
                    out.push('[');
                    for (index, &item) in items.iter().enumerate() {
                        if index > 0 {
                            out.push_str(", ");
                        }
                        self.render_repr(item, out, depth + 1);
                    }
                    out.push(']');
                }
                HeapData::Dict(dict) => {
                    out.push('{');
                    for (index, (key, value)) in dict.iter().enumerate() {
                        if index > 0 {
                            out.push_str(", ");
                        }
                        self.render_repr(key, out, depth + 1);
                        out.push_str(": ");
                        self.render_repr(value, out, depth + 1);
                    }
                    out.push('}');
                }
                HeapData::Closure(closure) => {
                    out.push_str("<fn ");
                    out.push_str(&self.program.proto(closure.func).name);
                    out.push('>');
                }
                HeapData::Upvalue(_) => out.push_str("<upvalue>"),
            },
        }
    }
}
