#![doc = include_str!("../../../README.md")]

mod builtins;
mod bytecode;
mod error;
mod heap;
mod intern;
mod io;
mod lexer;
mod run;
mod token;
mod tracer;
mod value;

pub use crate::{
    builtins::{NativeCtx, NativeFn, NativeId},
    bytecode::{FuncId, Opcode, Program},
    error::{Diagnostic, DiagnosticKind, ErrorKind, RunError, RunResult, TraceFrame},
    heap::{HeapDiff, HeapId, HeapStats},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    run::{Vm, VmConfig, compile},
    tracer::{NoopTracer, RecordingTracer, StderrTracer, TraceEvent, VmTracer},
    value::{Value, values_equal},
};
