//! String helpers: `upper`, `lower`, `trim`, `split`, `join`, `find`,
//! `replace`, `slice`.
//!
//! All of these return fresh (interned) strings; the receiver is never
//! mutated, matching the immutability of the string object kind. Positions
//! are character indices, consistent with subscripting and `len`.

use super::NativeCtx;
use crate::{
    error::{RunError, RunResult},
    heap::HeapData,
    io::PrintWriter,
    value::Value,
};

pub(crate) fn builtin_upper<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let text = expect_str(ctx, "upper", args[0])?.to_uppercase();
    Ok(ctx.string(&text))
}

pub(crate) fn builtin_lower<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let text = expect_str(ctx, "lower", args[0])?.to_lowercase();
    Ok(ctx.string(&text))
}

pub(crate) fn builtin_trim<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let text = expect_str(ctx, "trim", args[0])?.trim().to_owned();
    Ok(ctx.string(&text))
}

/// `split(s, sep)` — substrings around each occurrence of `sep`. An empty
/// separator splits into individual characters.
pub(crate) fn builtin_split<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let text = expect_str(ctx, "split", args[0])?;
    let separator = expect_str(ctx, "split", args[1])?;
    let parts: Vec<String> = if separator.is_empty() {
        text.chars().map(String::from).collect()
    } else {
        text.split(separator).map(str::to_owned).collect()
    };
    let mut items = Vec::with_capacity(parts.len());
    for part in &parts {
        items.push(Value::Ref(ctx.heap.alloc_str(part)));
    }
    Ok(ctx.array(items))
}

/// `join(array, sep)` — elements in their `print` form, separated by `sep`.
pub(crate) fn builtin_join<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let Value::Ref(id) = args[0] else {
        return Err(RunError::type_mismatch(format!(
            "join expects an array, got {}",
            ctx.type_name(args[0])
        )));
    };
    let items = match ctx.heap.get(id) {
        HeapData::Array(items) => items.clone(),
        _ => {
            return Err(RunError::type_mismatch(format!(
                "join expects an array, got {}",
                ctx.type_name(args[0])
            )));
        }
    };
    let separator = expect_str(ctx, "join", args[1])?.to_owned();
    let mut out = String::new();
    for (index, &item) in items.iter().enumerate() {
        if index > 0 {
            out.push_str(&separator);
        }
        ctx.render_into(item, &mut out);
    }
    Ok(ctx.string(&out))
}

/// `find(s, needle)` — character index of the first occurrence, or `-1`.
pub(crate) fn builtin_find<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let text = expect_str(ctx, "find", args[0])?;
    let needle = expect_str(ctx, "find", args[1])?;
    match text.find(needle) {
        Some(byte_index) => {
            let char_index = text[..byte_index].chars().count();
            Ok(Value::Int(i64::try_from(char_index).expect("length fits i64")))
        }
        None => Ok(Value::Int(-1)),
    }
}

pub(crate) fn builtin_replace<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let text = expect_str(ctx, "replace", args[0])?;
    let from = expect_str(ctx, "replace", args[1])?;
    let to = expect_str(ctx, "replace", args[2])?;
    if from.is_empty() {
        return Err(RunError::type_mismatch("replace pattern must not be empty"));
    }
    let replaced = text.replace(from, to);
    Ok(ctx.string(&replaced))
}

/// `slice(x, start, end)` — the elements (or characters) from `start`
/// inclusive to `end` exclusive. Negative positions count from the end;
/// out-of-range positions clamp instead of erroring.
pub(crate) fn builtin_slice<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let (Value::Int(start), Value::Int(end)) = (args[1], args[2]) else {
        return Err(RunError::type_mismatch(format!(
            "slice bounds must be ints, got {} and {}",
            ctx.type_name(args[1]),
            ctx.type_name(args[2])
        )));
    };

    if let Value::Ref(id) = args[0] {
        match ctx.heap.get(id) {
            HeapData::Array(items) => {
                let (start, end) = clamp_range(start, end, items.len());
                let sliced = items[start..end].to_vec();
                return Ok(ctx.array(sliced));
            }
            HeapData::Str(text) => {
                let chars: Vec<char> = text.chars().collect();
                let (start, end) = clamp_range(start, end, chars.len());
                let sliced: String = chars[start..end].iter().collect();
                return Ok(ctx.string(&sliced));
            }
            _ => {}
        }
    }
    Err(RunError::type_mismatch(format!(
        "slice expects an array or string, got {}",
        ctx.type_name(args[0])
    )))
}

/// Resolves possibly-negative slice bounds against a length, clamping to
/// `0..=length` and keeping `start <= end`.
fn clamp_range(start: i64, end: i64, length: usize) -> (usize, usize) {
    let length_i64 = i64::try_from(length).expect("length fits i64");
    let resolve = |position: i64| -> usize {
        let adjusted = if position < 0 { position + length_i64 } else { position };
        usize::try_from(adjusted.clamp(0, length_i64)).expect("clamped non-negative")
    };
    let start = resolve(start);
    let end = resolve(end).max(start);
    (start, end)
}

fn expect_str<'c, P: PrintWriter>(
    ctx: &'c NativeCtx<'_, P>,
    name: &str,
    value: Value,
) -> RunResult<&'c str> {
    ctx.as_str(value).ok_or_else(|| {
        RunError::type_mismatch(format!("{name} expects a string, got {}", ctx.type_name(value)))
    })
}
