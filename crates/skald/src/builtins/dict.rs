//! Dict helpers: `keys`, `values`, `has`.

use super::NativeCtx;
use crate::{
    error::{RunError, RunResult},
    heap::HeapData,
    io::PrintWriter,
    value::Value,
};

/// `keys(dict)` — the keys as an array, in insertion order.
pub(crate) fn builtin_keys<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let id = dict_of(ctx, "keys", args[0])?;
    let items = match ctx.heap.get(id) {
        HeapData::Dict(dict) => dict.iter().map(|(key, _)| key).collect::<Vec<_>>(),
        _ => unreachable!("validated by dict_of"),
    };
    Ok(ctx.array(items))
}

/// `values(dict)` — the values as an array, in insertion order.
pub(crate) fn builtin_values<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let id = dict_of(ctx, "values", args[0])?;
    let items = match ctx.heap.get(id) {
        HeapData::Dict(dict) => dict.iter().map(|(_, value)| value).collect::<Vec<_>>(),
        _ => unreachable!("validated by dict_of"),
    };
    Ok(ctx.array(items))
}

/// `has(dict, key)` — whether the key is present. Unhashable keys are
/// simply absent rather than an error.
pub(crate) fn builtin_has<P: PrintWriter>(ctx: &mut NativeCtx<'_, P>, args: &[Value]) -> RunResult<Value> {
    let id = dict_of(ctx, "has", args[0])?;
    let Some(key) = ctx.heap.dict_key(args[1]) else {
        return Ok(Value::Bool(false));
    };
    let present = match ctx.heap.get(id) {
        HeapData::Dict(dict) => dict.contains(&key),
        _ => unreachable!("validated by dict_of"),
    };
    Ok(Value::Bool(present))
}

fn dict_of<P: PrintWriter>(
    ctx: &NativeCtx<'_, P>,
    name: &str,
    value: Value,
) -> RunResult<crate::heap::HeapId> {
    if let Value::Ref(id) = value
        && matches!(ctx.heap.get(id), HeapData::Dict(_))
    {
        return Ok(id);
    }
    Err(RunError::type_mismatch(format!(
        "{name} expects a dict, got {}",
        ctx.type_name(value)
    )))
}
