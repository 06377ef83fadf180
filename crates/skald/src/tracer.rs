//! Execution tracing hooks.
//!
//! The VM calls into a [`VmTracer`] when `trace_execution` is enabled in the
//! config. [`NoopTracer`] is the default and compiles away entirely through
//! monomorphization; [`StderrTracer`] logs one line per instruction, which
//! is what the CLI's `--trace` flag wires up.

use crate::bytecode::Opcode;

/// Observer of VM execution events.
pub trait VmTracer {
    /// Called before each instruction executes.
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, frame_depth: usize) {
        let _ = (ip, opcode, stack_depth, frame_depth);
    }

    /// Called after each garbage collection with the live-byte estimate
    /// before and after.
    fn on_gc(&mut self, bytes_before: usize, bytes_after: usize) {
        let _ = (bytes_before, bytes_after);
    }
}

/// Tracer that observes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// One recorded instruction event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent {
    pub ip: usize,
    pub opcode: Opcode,
    pub stack_depth: usize,
    pub frame_depth: usize,
}

/// Tracer that records events in memory, for tests and tooling.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
    collections: Vec<(usize, usize)>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Instructions recorded so far, in execution order.
    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// `(bytes_before, bytes_after)` for each recorded collection.
    #[must_use]
    pub fn collections(&self) -> &[(usize, usize)] {
        &self.collections
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.collections.clear();
    }
}

impl VmTracer for RecordingTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, frame_depth: usize) {
        self.events.push(TraceEvent {
            ip,
            opcode,
            stack_depth,
            frame_depth,
        });
    }

    fn on_gc(&mut self, bytes_before: usize, bytes_after: usize) {
        self.collections.push((bytes_before, bytes_after));
    }
}

/// Tracer that logs every instruction and collection to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, frame_depth: usize) {
        eprintln!("[trace] {ip:04} {opcode:<14} stack={stack_depth} frames={frame_depth}");
    }

    fn on_gc(&mut self, bytes_before: usize, bytes_after: usize) {
        eprintln!("[gc] {bytes_before} -> {bytes_after} bytes");
    }
}
