//! The `len` builtin.

use super::NativeCtx;
use crate::{
    error::{RunError, RunResult},
    io::PrintWriter,
    value::{Value, value_length},
};

/// `len(x)` — element count of an array, entry count of a dict, or
/// character count of a string.
pub(crate) fn builtin_len<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    match value_length(args[0], ctx.heap) {
        Some(length) => Ok(Value::Int(i64::try_from(length).expect("length fits i64"))),
        None => Err(RunError::type_mismatch(format!(
            "{} has no length",
            ctx.type_name(args[0])
        ))),
    }
}
