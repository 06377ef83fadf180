//! Public entry points: compiling source and running programs.

use crate::{
    builtins::{NativeFn, NativeRegistry},
    bytecode::{GlobalTable, Interp, Program},
    error::{Diagnostic, RunError},
    heap::{Heap, HeapStats},
    io::{PrintWriter, StdPrint},
    tracer::{NoopTracer, StderrTracer, VmTracer},
    value::Value,
};

/// Compiles Skald source text into a runnable [`Program`].
///
/// `name` labels the top-level code in call traces (conventionally the file
/// name). On failure, every diagnostic found before the compiler gave up is
/// returned; the source is never partially runnable.
pub fn compile(source: &str, name: &str) -> Result<Program, Vec<Diagnostic>> {
    crate::bytecode::compile(source, name)
}

/// Tunable execution limits and behavior for a [`Vm`].
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// Maximum value-stack depth, in slots.
    pub stack_max: usize,
    /// Maximum number of simultaneously active call frames.
    pub call_depth_max: usize,
    /// Initial GC watermark in bytes; collections never set the watermark
    /// below this.
    pub heap_initial: usize,
    /// Watermark growth factor applied after each collection (clamped to at
    /// least 1.0).
    pub heap_growth: f64,
    /// When true, the tracer is notified of every instruction and
    /// collection.
    pub trace_execution: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_max: 64 * 1024,
            call_depth_max: 1024,
            heap_initial: 1 << 20,
            heap_growth: 2.0,
            trace_execution: false,
        }
    }
}

/// A Skald virtual machine.
///
/// Owns the heap, the interned-string table, the globals, and the builtin
/// registry; none of that state is shared between instances, so independent
/// `Vm`s may live on different threads. Globals persist across `run` calls,
/// which lets a host run several programs against shared state.
///
/// Dropping the `Vm` releases all heap and stack memory.
pub struct Vm<P: PrintWriter = StdPrint, T: VmTracer = NoopTracer> {
    config: VmConfig,
    heap: Heap,
    globals: GlobalTable,
    natives: NativeRegistry<P>,
    writer: P,
    tracer: T,
}

impl Vm {
    /// Creates a VM that prints to stdout.
    #[must_use]
    pub fn new(config: VmConfig) -> Self {
        Self::with_writer_and_tracer(config, StdPrint::new(), NoopTracer)
    }
}

impl Vm<StdPrint, StderrTracer> {
    /// Creates a VM that prints to stdout and traces every instruction to
    /// stderr. Backs the CLI's `--trace` flag.
    #[must_use]
    pub fn traced(mut config: VmConfig) -> Self {
        config.trace_execution = true;
        Self::with_writer_and_tracer(config, StdPrint::new(), StderrTracer)
    }
}

impl<P: PrintWriter> Vm<P, NoopTracer> {
    /// Creates a VM with a custom print writer.
    #[must_use]
    pub fn with_writer(config: VmConfig, writer: P) -> Self {
        Self::with_writer_and_tracer(config, writer, NoopTracer)
    }
}

impl<P: PrintWriter, T: VmTracer> Vm<P, T> {
    /// Creates a VM with a custom print writer and tracer.
    #[must_use]
    pub fn with_writer_and_tracer(config: VmConfig, writer: P, tracer: T) -> Self {
        let growth = config.heap_growth.max(1.0);
        Self {
            config,
            heap: Heap::new(config.heap_initial.max(1), growth),
            globals: GlobalTable::default(),
            natives: NativeRegistry::with_defaults(),
            writer,
            tracer,
        }
    }

    /// Registers a native function, replacing any existing binding with the
    /// same name (including the core builtins).
    ///
    /// Must be called before any source runs; the registry is consulted
    /// whenever a global name has no definition. `arity` of `-1` accepts any
    /// argument count.
    pub fn register_builtin(&mut self, name: &str, arity: i8, func: NativeFn<P>) {
        self.natives.register(name, arity, func);
    }

    /// Runs a compiled program to completion.
    ///
    /// Returns the program's result value (`nil` for a script that runs off
    /// the end) or the runtime error that unwound it. The VM survives
    /// errors: globals and the heap remain usable for further runs.
    pub fn run(&mut self, program: &Program) -> Result<Value, RunError> {
        Interp::new(
            program,
            &mut self.heap,
            &mut self.globals,
            &self.natives,
            &mut self.writer,
            &mut self.tracer,
            self.config,
        )
        .run()
    }

    /// Snapshot of current heap occupancy.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// The VM's print writer.
    pub fn writer(&self) -> &P {
        &self.writer
    }

    /// The VM's tracer; lets a host inspect a [`crate::RecordingTracer`]
    /// after a traced run.
    pub fn tracer(&self) -> &T {
        &self.tracer
    }

    pub fn tracer_mut(&mut self) -> &mut T {
        &mut self.tracer
    }

    pub fn writer_mut(&mut self) -> &mut P {
        &mut self.writer
    }

    /// Consumes the VM and returns the writer (releasing all other memory).
    #[must_use]
    pub fn into_writer(self) -> P {
        self.writer
    }

    #[must_use]
    pub fn config(&self) -> VmConfig {
        self.config
    }
}
