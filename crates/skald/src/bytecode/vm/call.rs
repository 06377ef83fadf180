//! Call opcode semantics: function, closure, and native dispatch.
//!
//! The callee sits at `stack[top - argc - 1]` with its arguments above it.
//! Skald-level callees get a new frame whose base is the callee slot (so the
//! callee occupies local slot 0 and the arguments slots 1..=argc); natives
//! are invoked with a read-only slice view of their arguments — the slice
//! aliases the value stack, which keeps every argument a GC root for the
//! duration of the call — and the callee and arguments are replaced by the
//! returned value without pushing a frame.

use super::{Frame, Interp};
use crate::{
    builtins::{NativeCtx, NativeId},
    bytecode::code::FuncId,
    error::{ErrorKind, RunError, RunResult},
    heap::{HeapData, HeapId},
    io::PrintWriter,
    tracer::VmTracer,
    value::Value,
};

impl<P: PrintWriter, T: VmTracer> Interp<'_, P, T> {
    /// Dispatches `Call argc`. Returns true when a frame was pushed (the
    /// dispatch loop must reload its cache).
    pub(super) fn call_value(&mut self, argc: usize) -> RunResult<bool> {
        let callee_index = self.stack.len() - argc - 1;
        match self.stack[callee_index] {
            Value::Function(func) => {
                self.push_frame(func, None, argc, callee_index)?;
                Ok(true)
            }
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Closure(closure) => {
                    let func = closure.func;
                    self.push_frame(func, Some(id), argc, callee_index)?;
                    Ok(true)
                }
                other => Err(RunError::new(
                    ErrorKind::NotCallable,
                    format!("cannot call a {}", other.kind_name().to_ascii_lowercase()),
                )),
            },
            Value::Native(native) => {
                self.call_native(native, argc, callee_index)?;
                Ok(false)
            }
            other => Err(RunError::new(
                ErrorKind::NotCallable,
                format!("cannot call {}", other.type_name(self.heap)),
            )),
        }
    }

    /// Pushes a frame for a Skald-level callee after checking arity and both
    /// execution limits.
    fn push_frame(&mut self, func: FuncId, closure: Option<HeapId>, argc: usize, base: usize) -> RunResult<()> {
        let proto = self.program.proto(func);

        if usize::from(proto.arity) != argc {
            return Err(RunError::new(
                ErrorKind::Arity,
                format!("{} expects {} arguments, got {argc}", proto.name, proto.arity),
            ));
        }
        if self.frames.len() >= self.config.call_depth_max {
            return Err(RunError::new(
                ErrorKind::CallDepthExceeded,
                format!("call depth limit of {} exceeded", self.config.call_depth_max),
            ));
        }
        // One check per call covers every push the body can perform: the
        // callee slot, the arguments, and the body's tracked maximum.
        if base + 1 + usize::from(proto.arity) + usize::from(proto.code.max_stack()) > self.config.stack_max {
            return Err(RunError::new(
                ErrorKind::StackOverflow,
                format!("value stack limit of {} exceeded", self.config.stack_max),
            ));
        }

        self.frames.push(Frame {
            func,
            closure,
            ip: 0,
            base,
        });
        Ok(())
    }

    /// Invokes a native function and replaces callee + arguments with its
    /// result. No frame is pushed.
    fn call_native(&mut self, native: NativeId, argc: usize, callee_index: usize) -> RunResult<()> {
        let entry = self.natives.entry(native);
        if entry.arity >= 0 && usize::try_from(entry.arity).expect("non-negative arity") != argc {
            return Err(RunError::new(
                ErrorKind::Arity,
                format!("{} expects {} arguments, got {argc}", entry.name, entry.arity),
            ));
        }

        let func = entry.func;
        let mut ctx = NativeCtx::new(self.heap, self.out, self.program, self.natives);
        let result = func(&mut ctx, &self.stack[callee_index + 1..])?;

        self.stack.truncate(callee_index);
        self.stack.push(result);
        Ok(())
    }
}
