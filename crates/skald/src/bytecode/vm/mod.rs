//! The stack-based virtual machine.
//!
//! Execution state is an explicit value stack (a flat vector of [`Value`]s,
//! shared by all frames), a call-frame stack, a globals table, the list of
//! open upvalues, the heap, and the builtin registry. The dispatch loop
//! fetches one opcode at a time from a locally cached frame — code pointer,
//! instruction pointer, frame base — so operand fetching never touches the
//! frame vector; the cache is reloaded whenever a call or return changes the
//! active frame.
//!
//! The top of the loop is the GC safe point: the frame's `ip` is synced back
//! before a collection or a call so stack roots and error positions stay
//! accurate.

mod binary;
mod call;
mod collections;

use ahash::AHashMap;
use smallvec::SmallVec;

use super::code::{Code, Const, FuncId, Program};
use super::op::Opcode;
use crate::{
    builtins::NativeRegistry,
    error::{ErrorKind, MAX_TRACE_FRAMES, RunError, RunResult, TraceFrame},
    heap::{Closure, Heap, HeapData, HeapId, Upvalue},
    io::PrintWriter,
    run::VmConfig,
    tracer::VmTracer,
    value::Value,
};

/// Fetches one operand byte, advancing the cached ip.
macro_rules! fetch_u8 {
    ($cached:expr) => {{
        let byte = $cached.code.bytecode()[$cached.ip];
        $cached.ip += 1;
        byte
    }};
}

macro_rules! fetch_i8 {
    ($cached:expr) => {{ fetch_u8!($cached).cast_signed() }};
}

/// Fetches a little-endian u16 operand.
macro_rules! fetch_u16 {
    ($cached:expr) => {{
        let lo = $cached.code.bytecode()[$cached.ip];
        let hi = $cached.code.bytecode()[$cached.ip + 1];
        $cached.ip += 2;
        u16::from_le_bytes([lo, hi])
    }};
}

macro_rules! fetch_i16 {
    ($cached:expr) => {{ fetch_u16!($cached).cast_signed() }};
}

/// Reloads the cached frame after the frame stack changed.
macro_rules! reload_cache {
    ($self:expr, $cached:ident) => {{
        $cached = $self.cached_frame();
    }};
}

/// Applies a relative jump to the cached ip.
macro_rules! jump_relative {
    ($cached:expr, $offset:expr) => {{
        let target = $cached.ip as i64 + i64::from($offset);
        $cached.ip = usize::try_from(target).expect("jump target out of bounds");
    }};
}

/// Evaluates a fallible operation; on error, attaches the current source
/// line and call trace and unwinds out of the dispatch loop.
macro_rules! vm_try {
    ($self:expr, $cached:expr, $expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(err) => return Err($self.annotate($cached.code, err)),
        }
    };
}

/// One function activation record.
#[derive(Debug)]
pub(crate) struct Frame {
    /// Prototype being executed.
    func: FuncId,
    /// The closure object when the callee captured upvalues; `None` for
    /// plain functions and the top-level script.
    closure: Option<HeapId>,
    /// Saved instruction pointer; authoritative only while the frame is not
    /// the active one (the active frame's ip lives in the dispatch cache).
    ip: usize,
    /// Stack index of the callee; arguments and locals sit above it.
    base: usize,
}

/// Dispatch-loop cache of the active frame.
#[derive(Clone, Copy)]
struct CachedFrame<'run> {
    code: &'run Code,
    ip: usize,
    base: usize,
    closure: Option<HeapId>,
}

/// Mutable VM-lifetime global bindings, shared across runs of one `Vm`.
#[derive(Debug, Default)]
pub(crate) struct GlobalTable {
    /// Name to slot index; slots are never reclaimed.
    slots: AHashMap<Box<str>, u32>,
    /// Slot values; `None` marks a slot whose name is known but which has
    /// not been defined (possible after a failed earlier run).
    values: Vec<Option<Value>>,
}

impl GlobalTable {
    /// Iterates over every defined global value (GC roots).
    pub(crate) fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.values.iter().flatten().copied()
    }

    fn slot_of(&self, name: &str) -> Option<u32> {
        self.slots.get(name).copied()
    }

    fn slot_or_create(&mut self, name: &str) -> u32 {
        if let Some(slot) = self.slots.get(name) {
            return *slot;
        }
        let slot = u32::try_from(self.values.len()).expect("global count exceeds u32");
        self.slots.insert(name.into(), slot);
        self.values.push(None);
        slot
    }

    fn get(&self, slot: u32) -> Option<Value> {
        self.values[slot as usize]
    }

    fn set(&mut self, slot: u32, value: Value) {
        self.values[slot as usize] = Some(value);
    }
}

/// An open upvalue: the stack slot it watches and its heap cell.
///
/// The list is kept sorted by slot so closing everything at or above a frame
/// base is a pop-from-the-back scan.
#[derive(Debug, Clone, Copy)]
struct OpenUpvalue {
    slot: usize,
    id: HeapId,
}

/// The per-run interpreter.
///
/// Borrows the long-lived pieces (heap, globals, registry, writer) from the
/// owning [`crate::Vm`] and owns the per-run pieces (stack, frames, caches).
pub(crate) struct Interp<'run, P: PrintWriter, T> {
    program: &'run Program,
    heap: &'run mut Heap,
    globals: &'run mut GlobalTable,
    natives: &'run NativeRegistry<P>,
    out: &'run mut P,
    tracer: &'run mut T,
    config: VmConfig,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    open_upvalues: Vec<OpenUpvalue>,
    /// Lazily interned heap strings for member names, by name-table index.
    member_ids: Vec<Option<HeapId>>,
    /// Resolved global slots, by name-table index.
    global_slots: Vec<Option<u32>>,
    /// Reused root buffer for collections.
    roots: Vec<HeapId>,
    /// Offset of the opcode currently executing, for error positions.
    instruction_ip: usize,
}

impl<'run, P: PrintWriter, T: VmTracer> Interp<'run, P, T> {
    pub(crate) fn new(
        program: &'run Program,
        heap: &'run mut Heap,
        globals: &'run mut GlobalTable,
        natives: &'run NativeRegistry<P>,
        out: &'run mut P,
        tracer: &'run mut T,
        config: VmConfig,
    ) -> Self {
        let name_count = program.names.len();
        Self {
            program,
            heap,
            globals,
            natives,
            out,
            tracer,
            config,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(16),
            open_upvalues: Vec::new(),
            member_ids: vec![None; name_count],
            global_slots: vec![None; name_count],
            roots: Vec::new(),
            instruction_ip: 0,
        }
    }

    /// Runs the program's top-level function to completion.
    pub(crate) fn run(mut self) -> Result<Value, RunError> {
        let main = self.program.main();
        self.stack.push(Value::Function(main));
        let code = &self.program.proto(main).code;
        if 1 + usize::from(code.max_stack()) > self.config.stack_max {
            return Err(RunError::new(
                ErrorKind::StackOverflow,
                "value stack limit exceeded before execution",
            ));
        }
        self.frames.push(Frame {
            func: main,
            closure: None,
            ip: 0,
            base: 0,
        });

        let result = self.dispatch();
        if result.is_err() {
            // Unwind every frame, closing upvalues on the way out, so the
            // heap is left consistent for a host that keeps using the VM.
            while let Some(frame) = self.frames.pop() {
                self.close_upvalues(frame.base);
            }
            self.stack.clear();
        }
        result
    }

    fn cached_frame(&self) -> CachedFrame<'run> {
        let frame = self.frames.last().expect("no active frame");
        CachedFrame {
            code: &self.program.proto(frame.func).code,
            ip: frame.ip,
            base: frame.base,
            closure: frame.closure,
        }
    }

    /// The main fetch/decode/dispatch loop.
    fn dispatch(&mut self) -> Result<Value, RunError> {
        let mut cached = self.cached_frame();

        loop {
            // Safe point: collect when the allocation watermark was passed.
            if self.heap.should_gc() {
                self.frames.last_mut().expect("active frame").ip = cached.ip;
                self.collect_garbage();
            }

            self.instruction_ip = cached.ip;
            let opcode = Opcode::decode(fetch_u8!(cached));

            if self.config.trace_execution {
                self.tracer.on_instruction(
                    self.instruction_ip,
                    opcode,
                    self.stack.len(),
                    self.frames.len(),
                );
            }

            match opcode {
                // ------------------------------------------------------------
                // Constants and literals
                // ------------------------------------------------------------
                Opcode::LoadConst => {
                    let index = fetch_u16!(cached);
                    let value = match cached.code.constant(index) {
                        Const::Int(v) => Value::Int(*v),
                        Const::Float(v) => Value::Float(*v),
                        Const::Str(text) => Value::Ref(self.heap.alloc_str(text)),
                        Const::Func(id) => Value::Function(*id),
                    };
                    self.stack.push(value);
                }
                Opcode::LoadNil => self.stack.push(Value::Nil),
                Opcode::LoadTrue => self.stack.push(Value::Bool(true)),
                Opcode::LoadFalse => self.stack.push(Value::Bool(false)),
                Opcode::LoadSmallInt => {
                    let value = fetch_i8!(cached);
                    self.stack.push(Value::Int(i64::from(value)));
                }

                // ------------------------------------------------------------
                // Locals
                // ------------------------------------------------------------
                Opcode::LoadLocal => {
                    let slot = usize::from(fetch_u8!(cached));
                    self.stack.push(self.stack[cached.base + slot]);
                }
                Opcode::LoadLocalW => {
                    let slot = usize::from(fetch_u16!(cached));
                    self.stack.push(self.stack[cached.base + slot]);
                }
                Opcode::StoreLocal => {
                    let slot = usize::from(fetch_u8!(cached));
                    self.stack[cached.base + slot] = *self.stack.last().expect("store from empty stack");
                }
                Opcode::StoreLocalW => {
                    let slot = usize::from(fetch_u16!(cached));
                    self.stack[cached.base + slot] = *self.stack.last().expect("store from empty stack");
                }

                // ------------------------------------------------------------
                // Upvalues
                // ------------------------------------------------------------
                Opcode::LoadUpvalue => {
                    let index = usize::from(fetch_u8!(cached));
                    let cell = self.upvalue_cell(cached.closure, index);
                    let value = match self.heap.get(cell) {
                        HeapData::Upvalue(Upvalue::Open(slot)) => self.stack[*slot],
                        HeapData::Upvalue(Upvalue::Closed(value)) => *value,
                        other => unreachable!("upvalue cell holds {}", other.kind_name()),
                    };
                    self.stack.push(value);
                }
                Opcode::StoreUpvalue => {
                    let index = usize::from(fetch_u8!(cached));
                    let value = *self.stack.last().expect("store from empty stack");
                    let cell = self.upvalue_cell(cached.closure, index);
                    match self.heap.get_mut(cell) {
                        HeapData::Upvalue(upvalue) => match upvalue {
                            Upvalue::Open(slot) => {
                                let slot = *slot;
                                self.stack[slot] = value;
                            }
                            Upvalue::Closed(cell_value) => *cell_value = value,
                        },
                        other => unreachable!("upvalue cell holds {}", other.kind_name()),
                    }
                }
                Opcode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.stack.pop();
                }

                // ------------------------------------------------------------
                // Globals
                // ------------------------------------------------------------
                Opcode::LoadGlobal => {
                    let name_index = fetch_u16!(cached);
                    let value = vm_try!(self, cached, self.load_global(name_index));
                    self.stack.push(value);
                }
                Opcode::StoreGlobal => {
                    let name_index = fetch_u16!(cached);
                    let value = *self.stack.last().expect("store from empty stack");
                    vm_try!(self, cached, self.store_global(name_index, value));
                }
                Opcode::DefineGlobal => {
                    let name_index = fetch_u16!(cached);
                    let value = self.stack.pop().expect("define from empty stack");
                    self.define_global(name_index, value);
                }

                // ------------------------------------------------------------
                // Arithmetic, comparison, logic
                // ------------------------------------------------------------
                Opcode::Add => {
                    // Int fast path in line; everything else via binary.rs.
                    if let [.., Value::Int(a), Value::Int(b)] = self.stack[..] {
                        self.stack.truncate(self.stack.len() - 2);
                        self.stack.push(Value::Int(a.wrapping_add(b)));
                    } else {
                        vm_try!(self, cached, self.binary_add());
                    }
                }
                Opcode::Sub => vm_try!(self, cached, self.binary_sub()),
                Opcode::Mul => vm_try!(self, cached, self.binary_mul()),
                Opcode::Div => vm_try!(self, cached, self.binary_div()),
                Opcode::Mod => vm_try!(self, cached, self.binary_mod()),
                Opcode::Negate => vm_try!(self, cached, self.negate()),
                Opcode::Equal => self.equality(false),
                Opcode::NotEqual => self.equality(true),
                Opcode::Less => vm_try!(self, cached, self.compare(Opcode::Less)),
                Opcode::LessEqual => vm_try!(self, cached, self.compare(Opcode::LessEqual)),
                Opcode::Greater => vm_try!(self, cached, self.compare(Opcode::Greater)),
                Opcode::GreaterEqual => vm_try!(self, cached, self.compare(Opcode::GreaterEqual)),
                Opcode::Not => {
                    let value = self.stack.pop().expect("not on empty stack");
                    self.stack.push(Value::Bool(!value.is_truthy()));
                }

                // ------------------------------------------------------------
                // Control flow
                // ------------------------------------------------------------
                Opcode::Jump => {
                    let offset = fetch_i16!(cached);
                    jump_relative!(cached, offset);
                }
                Opcode::JumpIfFalse => {
                    let offset = fetch_i16!(cached);
                    let condition = self.stack.pop().expect("jump condition missing");
                    if !condition.is_truthy() {
                        jump_relative!(cached, offset);
                    }
                }
                Opcode::Loop => {
                    let offset = fetch_i16!(cached);
                    jump_relative!(cached, offset);
                }
                Opcode::Call => {
                    let argc = usize::from(fetch_u8!(cached));
                    // Sync the ip so the callee's return resumes correctly
                    // and GC roots stay exact during the call.
                    self.frames.last_mut().expect("active frame").ip = cached.ip;
                    if vm_try!(self, cached, self.call_value(argc)) {
                        reload_cache!(self, cached);
                    }
                }
                Opcode::Return => {
                    let result = self.stack.pop().expect("return value missing");
                    let frame = self.frames.pop().expect("return without frame");
                    self.close_upvalues(frame.base);
                    self.stack.truncate(frame.base);
                    if self.frames.is_empty() {
                        return Ok(result);
                    }
                    self.stack.push(result);
                    reload_cache!(self, cached);
                }
                Opcode::Closure => {
                    let index = fetch_u16!(cached);
                    let Const::Func(func) = *cached.code.constant(index) else {
                        unreachable!("Closure operand must be a function constant");
                    };
                    let count = usize::from(self.program.proto(func).upvalue_count);
                    let mut upvalues = SmallVec::with_capacity(count);
                    for _ in 0..count {
                        let is_local = fetch_u8!(cached) == 1;
                        let capture_index = usize::from(fetch_u8!(cached));
                        let cell = if is_local {
                            self.capture_upvalue(cached.base + capture_index)
                        } else {
                            self.upvalue_cell(cached.closure, capture_index)
                        };
                        upvalues.push(cell);
                    }
                    let id = self.heap.alloc(HeapData::Closure(Closure { func, upvalues }));
                    self.stack.push(Value::Ref(id));
                }

                // ------------------------------------------------------------
                // Collections
                // ------------------------------------------------------------
                Opcode::BuildArray => {
                    let count = usize::from(fetch_u16!(cached));
                    let start = self.stack.len() - count;
                    let items = self.stack.split_off(start);
                    let id = self.heap.alloc(HeapData::Array(items));
                    self.stack.push(Value::Ref(id));
                }
                Opcode::BuildDict => {
                    let count = usize::from(fetch_u16!(cached));
                    vm_try!(self, cached, self.build_dict(count));
                }
                Opcode::BuildRange => vm_try!(self, cached, self.build_range()),
                Opcode::IndexGet => vm_try!(self, cached, self.index_get()),
                Opcode::IndexSet => vm_try!(self, cached, self.index_set()),
                Opcode::MemberGet => {
                    let name_index = fetch_u16!(cached);
                    vm_try!(self, cached, self.member_get(name_index));
                }
                Opcode::MemberSet => {
                    let name_index = fetch_u16!(cached);
                    vm_try!(self, cached, self.member_set(name_index));
                }

                // ------------------------------------------------------------
                // Iteration and pattern support
                // ------------------------------------------------------------
                Opcode::IterInit => vm_try!(self, cached, self.iter_init()),
                Opcode::IterNext => {
                    let offset = fetch_i16!(cached);
                    if !vm_try!(self, cached, self.iter_next()) {
                        jump_relative!(cached, offset);
                    }
                }
                Opcode::IsArray => {
                    let value = self.stack.pop().expect("IsArray on empty stack");
                    let is_array = matches!(value, Value::Ref(id) if matches!(self.heap.get(id), HeapData::Array(_)));
                    self.stack.push(Value::Bool(is_array));
                }
                Opcode::Len => vm_try!(self, cached, self.length()),

                // ------------------------------------------------------------
                // Stack housekeeping
                // ------------------------------------------------------------
                Opcode::Pop => {
                    self.stack.pop().expect("pop on empty stack");
                }
                Opcode::Dup => {
                    let value = *self.stack.last().expect("dup on empty stack");
                    self.stack.push(value);
                }
                Opcode::Halt => {
                    self.close_upvalues(0);
                    self.frames.pop();
                    debug_assert_eq!(self.stack.len(), 1, "operand stack must be empty at Halt");
                    self.stack.clear();
                    return Ok(Value::Nil);
                }
            }
        }
    }

    // ========================================================================
    // Globals
    // ========================================================================

    /// Resolution order: defined global, then builtin registry, then error.
    fn load_global(&mut self, name_index: u16) -> RunResult<Value> {
        if let Some(slot) = self.resolve_global_slot(name_index)
            && let Some(value) = self.globals.get(slot)
        {
            return Ok(value);
        }
        let name = self.program.name(name_index);
        if let Some(native) = self.natives.lookup(name) {
            return Ok(Value::Native(native));
        }
        Err(RunError::new(
            ErrorKind::UndefinedName,
            format!("undefined variable '{name}'"),
        ))
    }

    fn store_global(&mut self, name_index: u16, value: Value) -> RunResult<()> {
        if let Some(slot) = self.resolve_global_slot(name_index)
            && self.globals.get(slot).is_some()
        {
            self.globals.set(slot, value);
            return Ok(());
        }
        let name = self.program.name(name_index);
        Err(RunError::new(
            ErrorKind::UndefinedName,
            format!("assignment to undefined variable '{name}'"),
        ))
    }

    fn define_global(&mut self, name_index: u16, value: Value) {
        let slot = match self.global_slots[usize::from(name_index)] {
            Some(slot) => slot,
            None => {
                let slot = self.globals.slot_or_create(self.program.name(name_index));
                self.global_slots[usize::from(name_index)] = Some(slot);
                slot
            }
        };
        self.globals.set(slot, value);
    }

    fn resolve_global_slot(&mut self, name_index: u16) -> Option<u32> {
        let cached = &mut self.global_slots[usize::from(name_index)];
        if cached.is_none() {
            *cached = self.globals.slot_of(self.program.name(name_index));
        }
        *cached
    }

    // ========================================================================
    // Upvalues
    // ========================================================================

    /// Heap cell of the running closure's `index`th upvalue.
    fn upvalue_cell(&self, closure: Option<HeapId>, index: usize) -> HeapId {
        let id = closure.expect("upvalue access outside a closure");
        match self.heap.get(id) {
            HeapData::Closure(closure) => closure.upvalues[index],
            other => unreachable!("frame closure holds {}", other.kind_name()),
        }
    }

    /// Captures the stack slot as an open upvalue, reusing an existing cell
    /// when two closures capture the same variable.
    fn capture_upvalue(&mut self, slot: usize) -> HeapId {
        match self.open_upvalues.binary_search_by_key(&slot, |open| open.slot) {
            Ok(position) => self.open_upvalues[position].id,
            Err(position) => {
                let id = self.heap.alloc(HeapData::Upvalue(Upvalue::Open(slot)));
                self.open_upvalues.insert(position, OpenUpvalue { slot, id });
                id
            }
        }
    }

    /// Closes every open upvalue at or above `from_slot`.
    ///
    /// The captured stack value moves into the heap cell; the open→closed
    /// transition happens exactly once per cell.
    pub(super) fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(open) = self.open_upvalues.last().copied() {
            if open.slot < from_slot {
                break;
            }
            let value = self.stack[open.slot];
            *self.heap.get_mut(open.id) = HeapData::Upvalue(Upvalue::Closed(value));
            self.open_upvalues.pop();
        }
    }

    // ========================================================================
    // GC and errors
    // ========================================================================

    /// Gathers the root set and runs a collection.
    ///
    /// Roots: every stack slot (which covers all frame windows and native
    /// argument slices), every defined global, every open upvalue cell, and
    /// the interned member-name cache.
    fn collect_garbage(&mut self) {
        let bytes_before = self.heap.stats().bytes_allocated;

        let mut roots = std::mem::take(&mut self.roots);
        roots.clear();
        roots.extend(self.stack.iter().filter_map(|value| match value {
            Value::Ref(id) => Some(*id),
            _ => None,
        }));
        roots.extend(self.globals.values().filter_map(|value| match value {
            Value::Ref(id) => Some(id),
            _ => None,
        }));
        roots.extend(self.open_upvalues.iter().map(|open| open.id));
        roots.extend(self.member_ids.iter().flatten().copied());

        self.heap.collect(roots.iter().copied());
        self.roots = roots;

        if self.config.trace_execution {
            self.tracer.on_gc(bytes_before, self.heap.stats().bytes_allocated);
        }
    }

    /// Attaches the faulting line and a call trace to an error raised by the
    /// current instruction.
    fn annotate(&mut self, code: &Code, mut error: RunError) -> RunError {
        if error.line == 0 {
            error.line = code.line_at(self.instruction_ip);
        }
        if error.trace.is_empty() {
            for (depth, frame) in self.frames.iter().rev().enumerate() {
                if depth == MAX_TRACE_FRAMES {
                    break;
                }
                let proto = self.program.proto(frame.func);
                let line = if depth == 0 {
                    code.line_at(self.instruction_ip)
                } else {
                    // The saved ip points just past the frame's Call
                    // instruction; its operand byte shares the call's line.
                    proto.code.line_at(frame.ip.saturating_sub(1))
                };
                error.trace.push(TraceFrame {
                    name: proto.name.clone(),
                    line,
                });
            }
        }
        error
    }

    /// Renders a value for error messages (short, typed form).
    fn describe(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_owned(),
            Value::Bool(v) => v.to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => crate::value::format_float(v),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Str(s) => format!("\"{s}\""),
                other => format!("<{}>", other.kind_name().to_ascii_lowercase()),
            },
            Value::Function(func) => format!("<fn {}>", self.program.proto(func).name),
            Value::Native(native) => format!("<native fn {}>", self.natives.name(native)),
        }
    }
}
