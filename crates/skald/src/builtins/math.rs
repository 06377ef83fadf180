//! Numeric builtins: `abs`, `min`, `max`.

use super::NativeCtx;
use crate::{
    error::{ErrorKind, RunError, RunResult},
    io::PrintWriter,
    value::Value,
};

/// `abs(n)` — absolute value. `abs` of the minimum int wraps, matching the
/// language's 64-bit wrapping arithmetic.
pub(crate) fn builtin_abs<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    match args[0] {
        Value::Int(v) => Ok(Value::Int(v.wrapping_abs())),
        Value::Float(v) => Ok(Value::Float(v.abs())),
        value => Err(RunError::type_mismatch(format!(
            "abs expects a number, got {}",
            ctx.type_name(value)
        ))),
    }
}

/// `floor(n)` — largest int not greater than `n`.
pub(crate) fn builtin_floor<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    rounding(ctx, "floor", args[0], f64::floor)
}

/// `ceil(n)` — smallest int not less than `n`.
pub(crate) fn builtin_ceil<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    rounding(ctx, "ceil", args[0], f64::ceil)
}

/// `round(n)` — nearest int, ties away from zero.
pub(crate) fn builtin_round<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    rounding(ctx, "round", args[0], f64::round)
}

/// `sqrt(n)` — square root as a float. Negative inputs yield NaN, per IEEE.
pub(crate) fn builtin_sqrt<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    match args[0] {
        Value::Int(v) => Ok(Value::Float((v as f64).sqrt())),
        Value::Float(v) => Ok(Value::Float(v.sqrt())),
        value => Err(RunError::type_mismatch(format!(
            "sqrt expects a number, got {}",
            ctx.type_name(value)
        ))),
    }
}

/// Shared body of `floor`/`ceil`/`round`: ints pass through, floats are
/// rounded and converted, rejecting values outside the int range.
#[expect(clippy::cast_possible_truncation, reason = "range checked before the cast")]
fn rounding<P: PrintWriter>(
    ctx: &NativeCtx<'_, P>,
    name: &str,
    value: Value,
    apply: fn(f64) -> f64,
) -> RunResult<Value> {
    match value {
        Value::Int(v) => Ok(Value::Int(v)),
        Value::Float(v) => {
            let rounded = apply(v);
            if rounded.is_finite() && rounded >= i64::MIN as f64 && rounded <= i64::MAX as f64 {
                Ok(Value::Int(rounded as i64))
            } else {
                Err(RunError::type_mismatch(format!("float {v} is out of int range")))
            }
        }
        other => Err(RunError::type_mismatch(format!(
            "{name} expects a number, got {}",
            ctx.type_name(other)
        ))),
    }
}

/// `min(values...)` — smallest of one or more numbers.
pub(crate) fn builtin_min<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    fold_numeric(ctx, "min", args, |best, candidate| candidate < best)
}

/// `max(values...)` — largest of one or more numbers.
pub(crate) fn builtin_max<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    fold_numeric(ctx, "max", args, |best, candidate| candidate > best)
}

/// Folds the argument list keeping whichever value `replace` prefers,
/// comparing numerically with int/float promotion but returning the
/// original (unpromoted) value.
fn fold_numeric<P: PrintWriter>(
    ctx: &NativeCtx<'_, P>,
    name: &str,
    args: &[Value],
    replace: fn(f64, f64) -> bool,
) -> RunResult<Value> {
    if args.is_empty() {
        return Err(RunError::new(
            ErrorKind::Arity,
            format!("{name} expects at least 1 argument"),
        ));
    }
    let mut best = args[0];
    let mut best_key = numeric_key(ctx, name, best)?;
    for &candidate in &args[1..] {
        let key = numeric_key(ctx, name, candidate)?;
        if replace(best_key, key) {
            best = candidate;
            best_key = key;
        }
    }
    Ok(best)
}

#[expect(clippy::cast_precision_loss, reason = "promotion rule is int -> float")]
fn numeric_key<P: PrintWriter>(ctx: &NativeCtx<'_, P>, name: &str, value: Value) -> RunResult<f64> {
    match value {
        Value::Int(v) => Ok(v as f64),
        Value::Float(v) => Ok(v),
        other => Err(RunError::type_mismatch(format!(
            "{name} expects numbers, got {}",
            ctx.type_name(other)
        ))),
    }
}
