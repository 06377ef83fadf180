//! Conversion builtins: `str`, `int`, `float`, `type`.

use super::NativeCtx;
use crate::{
    error::{RunError, RunResult},
    io::PrintWriter,
    value::Value,
};

/// `str(v)` — the value in its `print` form, as a string.
pub(crate) fn builtin_str<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let rendered = ctx.render(args[0]);
    Ok(ctx.string(&rendered))
}

/// `int(v)` — int from a float (truncating toward zero), a numeric string,
/// a bool, or an int.
pub(crate) fn builtin_int<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    match args[0] {
        Value::Int(v) => Ok(Value::Int(v)),
        Value::Bool(v) => Ok(Value::Int(i64::from(v))),
        Value::Float(v) => float_to_int(v),
        value => match ctx.as_str(value) {
            Some(text) => text.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                RunError::type_mismatch(format!("cannot parse {text:?} as int"))
            }),
            None => Err(RunError::type_mismatch(format!(
                "cannot convert {} to int",
                ctx.type_name(value)
            ))),
        },
    }
}

/// Truncates a float toward zero, rejecting values outside the i64 range.
#[expect(clippy::cast_possible_truncation, reason = "range checked before the cast")]
fn float_to_int(v: f64) -> RunResult<Value> {
    let truncated = v.trunc();
    if truncated.is_finite() && truncated >= i64::MIN as f64 && truncated <= i64::MAX as f64 {
        Ok(Value::Int(truncated as i64))
    } else {
        Err(RunError::type_mismatch(format!("float {v} is out of int range")))
    }
}

/// `float(v)` — float from an int, a numeric string, or a float.
pub(crate) fn builtin_float<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    match args[0] {
        Value::Float(v) => Ok(Value::Float(v)),
        Value::Int(v) => Ok(Value::Float(v as f64)),
        value => match ctx.as_str(value) {
            Some(text) => text.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                RunError::type_mismatch(format!("cannot parse {text:?} as float"))
            }),
            None => Err(RunError::type_mismatch(format!(
                "cannot convert {} to float",
                ctx.type_name(value)
            ))),
        },
    }
}

/// `type(v)` — the value's type name as a string.
pub(crate) fn builtin_type<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let name = ctx.type_name(args[0]);
    Ok(ctx.string(name))
}
