//! Array and string helpers: `push`, `pop`, `contains`, `chars`.

use super::NativeCtx;
use crate::{
    error::{ErrorKind, RunError, RunResult},
    heap::HeapData,
    io::PrintWriter,
    value::{Value, values_equal},
};

/// `push(array, value)` — appends in place and returns the array.
pub(crate) fn builtin_push<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let Value::Ref(id) = args[0] else {
        return Err(not_an_array(ctx, "push", args[0]));
    };
    match ctx.heap.get_mut(id) {
        HeapData::Array(items) => {
            items.push(args[1]);
            Ok(args[0])
        }
        _ => Err(not_an_array(ctx, "push", args[0])),
    }
}

/// `pop(array)` — removes and returns the last element.
pub(crate) fn builtin_pop<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let Value::Ref(id) = args[0] else {
        return Err(not_an_array(ctx, "pop", args[0]));
    };
    match ctx.heap.get_mut(id) {
        HeapData::Array(items) => items.pop().ok_or_else(|| {
            RunError::new(ErrorKind::IndexOutOfRange, "pop from empty array")
        }),
        _ => Err(not_an_array(ctx, "pop", args[0])),
    }
}

/// `contains(collection, needle)` — membership test: array element, dict
/// key, or substring.
pub(crate) fn builtin_contains<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let Value::Ref(id) = args[0] else {
        return Err(RunError::type_mismatch(format!(
            "contains expects an array, dict, or string, got {}",
            ctx.type_name(args[0])
        )));
    };
    let found = match ctx.heap.get(id) {
        HeapData::Array(items) => items.iter().any(|&item| values_equal(item, args[1])),
        HeapData::Dict(dict) => {
            let Some(key) = ctx.heap.dict_key(args[1]) else {
                return Ok(Value::Bool(false));
            };
            dict.contains(&key)
        }
        HeapData::Str(text) => match ctx.as_str(args[1]) {
            Some(needle) => text.contains(needle),
            None => {
                return Err(RunError::type_mismatch(format!(
                    "substring test needs a string, got {}",
                    ctx.type_name(args[1])
                )));
            }
        },
        _ => {
            return Err(RunError::type_mismatch(format!(
                "contains expects an array, dict, or string, got {}",
                ctx.type_name(args[0])
            )));
        }
    };
    Ok(Value::Bool(found))
}

/// `chars(string)` — the string's characters as an array of one-character
/// strings.
pub(crate) fn builtin_chars<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let Some(text) = ctx.as_str(args[0]) else {
        return Err(RunError::type_mismatch(format!(
            "chars expects a string, got {}",
            ctx.type_name(args[0])
        )));
    };
    let chars: Vec<char> = text.chars().collect();
    let mut items = Vec::with_capacity(chars.len());
    let mut buffer = [0u8; 4];
    for ch in chars {
        let encoded: &str = ch.encode_utf8(&mut buffer);
        items.push(Value::Ref(ctx.heap.alloc_str(encoded)));
    }
    Ok(ctx.array(items))
}

/// `sort(array)` — sorts in place and returns the array. Elements must be
/// all numbers or all strings; the sort is stable.
pub(crate) fn builtin_sort<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let Value::Ref(id) = args[0] else {
        return Err(not_an_array(ctx, "sort", args[0]));
    };
    // Take the elements out so the heap stays borrowable for string keys.
    let mut items = match ctx.heap.get_mut(id) {
        HeapData::Array(items) => std::mem::take(items),
        _ => return Err(not_an_array(ctx, "sort", args[0])),
    };

    let all_numbers = items.iter().all(|v| matches!(v, Value::Int(_) | Value::Float(_)));
    let all_strings = items
        .iter()
        .all(|&v| matches!(v, Value::Ref(id) if matches!(ctx.heap.get(id), HeapData::Str(_))));

    let result = if all_numbers {
        items.sort_by(|&a, &b| numeric_value(a).partial_cmp(&numeric_value(b)).unwrap_or(std::cmp::Ordering::Equal));
        Ok(args[0])
    } else if all_strings {
        items.sort_by(|&a, &b| {
            let (Value::Ref(a), Value::Ref(b)) = (a, b) else {
                unreachable!("checked all strings");
            };
            ctx.heap.str_value(a).cmp(ctx.heap.str_value(b))
        });
        Ok(args[0])
    } else {
        Err(RunError::type_mismatch(
            "sort needs elements that are all numbers or all strings",
        ))
    };

    match ctx.heap.get_mut(id) {
        HeapData::Array(slot) => *slot = items,
        _ => unreachable!("checked above"),
    }
    result
}

/// `reverse(array)` — reverses in place and returns the array.
pub(crate) fn builtin_reverse<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let Value::Ref(id) = args[0] else {
        return Err(not_an_array(ctx, "reverse", args[0]));
    };
    match ctx.heap.get_mut(id) {
        HeapData::Array(items) => {
            items.reverse();
            Ok(args[0])
        }
        _ => Err(not_an_array(ctx, "reverse", args[0])),
    }
}

/// `concat(a, b)` — a new array holding the elements of both.
pub(crate) fn builtin_concat<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let mut combined = array_elements(ctx, "concat", args[0])?;
    combined.extend(array_elements(ctx, "concat", args[1])?);
    Ok(ctx.array(combined))
}

fn array_elements<P: PrintWriter>(
    ctx: &NativeCtx<'_, P>,
    name: &str,
    value: Value,
) -> RunResult<Vec<Value>> {
    if let Value::Ref(id) = value
        && let HeapData::Array(items) = ctx.heap.get(id)
    {
        return Ok(items.clone());
    }
    Err(not_an_array(ctx, name, value))
}

fn numeric_value(value: Value) -> f64 {
    match value {
        Value::Int(v) => v as f64,
        Value::Float(v) => v,
        _ => unreachable!("checked all numbers"),
    }
}

fn not_an_array<P: PrintWriter>(ctx: &NativeCtx<'_, P>, name: &str, value: Value) -> RunError {
    RunError::type_mismatch(format!("{name} expects an array, got {}", ctx.type_name(value)))
}
