//! Index, member, construction, and iteration opcode semantics.
//!
//! Access rules: arrays take integer indices with negative values
//! normalized from the end; dicts take string or number keys; strings are
//! read-only and index to one-character (interned) strings. Missing dict
//! keys are an error through subscript access (`d[k]`) and read as `nil`
//! through member access (`d.k`) — one rule, applied consistently.

use super::Interp;
use crate::{
    error::{ErrorKind, RunError, RunResult},
    heap::{Dict, HeapData, HeapId},
    io::PrintWriter,
    tracer::VmTracer,
    value::Value,
};

/// Outcome of advancing an iterator, decoupled from the heap borrow.
enum IterStep {
    Yield(Value),
    YieldChar(char, usize),
    Done,
}

impl<P: PrintWriter, T: VmTracer> Interp<'_, P, T> {
    /// `BuildDict n`: pops `n` key/value pairs pushed in source order.
    pub(super) fn build_dict(&mut self, count: usize) -> RunResult<()> {
        let base = self.stack.len() - 2 * count;
        let mut dict = Dict::with_capacity(count);
        for pair in 0..count {
            let key_value = self.stack[base + 2 * pair];
            let value = self.stack[base + 2 * pair + 1];
            let key = self.heap.dict_key(key_value).ok_or_else(|| {
                RunError::type_mismatch(format!(
                    "dict key must be a string or number, got {}",
                    key_value.type_name(self.heap)
                ))
            })?;
            // Later duplicates win, matching left-to-right evaluation.
            dict.insert(key, value);
        }
        self.stack.truncate(base);
        let id = self.heap.alloc(HeapData::Dict(dict));
        self.stack.push(Value::Ref(id));
        Ok(())
    }

    /// `BuildRange`: `a .. b` builds the inclusive integer array.
    pub(super) fn build_range(&mut self) -> RunResult<()> {
        let end = self.stack.pop().expect("range end missing");
        let start = self.stack.pop().expect("range start missing");
        let (Value::Int(start), Value::Int(end)) = (start, end) else {
            return Err(RunError::type_mismatch(format!(
                "range bounds must be ints, got {} and {}",
                start.type_name(self.heap),
                end.type_name(self.heap)
            )));
        };
        let items: Vec<Value> = if start <= end {
            (start..=end).map(Value::Int).collect()
        } else {
            Vec::new()
        };
        let id = self.heap.alloc(HeapData::Array(items));
        self.stack.push(Value::Ref(id));
        Ok(())
    }

    pub(super) fn index_get(&mut self) -> RunResult<()> {
        let key = self.stack.pop().expect("index key missing");
        let object = self.stack.pop().expect("index target missing");

        let result = match object {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Array(items) => {
                    let index = self.array_index(key, items.len())?;
                    items[index]
                }
                HeapData::Dict(dict) => {
                    let dict_key = self.heap.dict_key(key).ok_or_else(|| {
                        RunError::type_mismatch(format!(
                            "dict key must be a string or number, got {}",
                            key.type_name(self.heap)
                        ))
                    })?;
                    dict.get(&dict_key).ok_or_else(|| {
                        RunError::new(ErrorKind::KeyMissing, format!("key {} not found", self.describe(key)))
                    })?
                }
                HeapData::Str(text) => {
                    let length = text.chars().count();
                    let index = self.array_index(key, length)?;
                    let ch = text.chars().nth(index).expect("index bounds checked");
                    let mut buffer = [0u8; 4];
                    let encoded: &str = ch.encode_utf8(&mut buffer);
                    let owned = encoded.to_owned();
                    Value::Ref(self.heap.alloc_str(&owned))
                }
                other => {
                    return Err(RunError::type_mismatch(format!(
                        "cannot index a {}",
                        other.kind_name().to_ascii_lowercase()
                    )));
                }
            },
            other => {
                return Err(RunError::type_mismatch(format!(
                    "cannot index {}",
                    other.type_name(self.heap)
                )));
            }
        };
        self.stack.push(result);
        Ok(())
    }

    /// `IndexSet` pops value, key, object and pushes the value back.
    pub(super) fn index_set(&mut self) -> RunResult<()> {
        let value = self.stack.pop().expect("assigned value missing");
        let key = self.stack.pop().expect("index key missing");
        let object = self.stack.pop().expect("index target missing");

        match object {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Array(items) => {
                    let index = self.array_index(key, items.len())?;
                    let HeapData::Array(items) = self.heap.get_mut(id) else {
                        unreachable!("checked above");
                    };
                    items[index] = value;
                }
                HeapData::Dict(_) => {
                    let dict_key = self.heap.dict_key(key).ok_or_else(|| {
                        RunError::type_mismatch(format!(
                            "dict key must be a string or number, got {}",
                            key.type_name(self.heap)
                        ))
                    })?;
                    let HeapData::Dict(dict) = self.heap.get_mut(id) else {
                        unreachable!("checked above");
                    };
                    dict.insert(dict_key, value);
                }
                HeapData::Str(_) => {
                    return Err(RunError::type_mismatch("strings are immutable"));
                }
                other => {
                    return Err(RunError::type_mismatch(format!(
                        "cannot index a {}",
                        other.kind_name().to_ascii_lowercase()
                    )));
                }
            },
            other => {
                return Err(RunError::type_mismatch(format!(
                    "cannot index {}",
                    other.type_name(self.heap)
                )));
            }
        }
        self.stack.push(value);
        Ok(())
    }

    /// `MemberGet`: `d.k` reads `nil` when the key is missing.
    pub(super) fn member_get(&mut self, name_index: u16) -> RunResult<()> {
        let object = self.stack.pop().expect("member target missing");
        let name_id = self.member_id(name_index);
        let result = match object {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Dict(dict) => {
                    let key = self
                        .heap
                        .dict_key(Value::Ref(name_id))
                        .expect("strings are always hashable");
                    dict.get(&key).unwrap_or(Value::Nil)
                }
                other => {
                    return Err(RunError::type_mismatch(format!(
                        "{} has no members",
                        other.kind_name().to_ascii_lowercase()
                    )));
                }
            },
            other => {
                return Err(RunError::type_mismatch(format!(
                    "{} has no members",
                    other.type_name(self.heap)
                )));
            }
        };
        self.stack.push(result);
        Ok(())
    }

    /// `MemberSet` pops value and object, creates or replaces the entry, and
    /// pushes the value back.
    pub(super) fn member_set(&mut self, name_index: u16) -> RunResult<()> {
        let value = self.stack.pop().expect("assigned value missing");
        let object = self.stack.pop().expect("member target missing");
        let name_id = self.member_id(name_index);
        match object {
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Dict(_)) => {
                let key = self
                    .heap
                    .dict_key(Value::Ref(name_id))
                    .expect("strings are always hashable");
                let HeapData::Dict(dict) = self.heap.get_mut(id) else {
                    unreachable!("checked above");
                };
                dict.insert(key, value);
            }
            other => {
                return Err(RunError::type_mismatch(format!(
                    "{} has no members",
                    other.type_name(self.heap)
                )));
            }
        }
        self.stack.push(value);
        Ok(())
    }

    /// `IterInit`: validates the iterable on top of the stack and pushes the
    /// iteration cursor beside it.
    pub(super) fn iter_init(&mut self) -> RunResult<()> {
        let iterable = *self.stack.last().expect("iterable missing");
        let ok = matches!(
            iterable,
            Value::Ref(id) if matches!(
                self.heap.get(id),
                HeapData::Array(_) | HeapData::Dict(_) | HeapData::Str(_)
            )
        );
        if !ok {
            return Err(RunError::type_mismatch(format!(
                "cannot iterate over {}",
                iterable.type_name(self.heap)
            )));
        }
        self.stack.push(Value::Int(0));
        Ok(())
    }

    /// `IterNext`: pushes the next element and returns true, or returns
    /// false (leaving the stack untouched) when the iterator is exhausted.
    ///
    /// Arrays yield elements, dicts yield keys in insertion order, strings
    /// yield one-character strings (the cursor advances by UTF-8 length).
    pub(super) fn iter_next(&mut self) -> RunResult<bool> {
        let cursor_index = self.stack.len() - 1;
        let Value::Int(cursor) = self.stack[cursor_index] else {
            unreachable!("iteration cursor must be an int");
        };
        let Value::Ref(id) = self.stack[cursor_index - 1] else {
            unreachable!("iterable checked by IterInit");
        };
        #[expect(clippy::cast_possible_truncation, reason = "cursor starts at 0 and only increments")]
        #[expect(clippy::cast_sign_loss, reason = "cursor starts at 0 and only increments")]
        let position = cursor as usize;

        let step = match self.heap.get(id) {
            HeapData::Array(items) => match items.get(position) {
                Some(&value) => IterStep::Yield(value),
                None => IterStep::Done,
            },
            HeapData::Dict(dict) => match dict.key_at(position) {
                Some(key) => IterStep::Yield(key),
                None => IterStep::Done,
            },
            HeapData::Str(text) => match text[position..].chars().next() {
                Some(ch) => IterStep::YieldChar(ch, position + ch.len_utf8()),
                None => IterStep::Done,
            },
            other => unreachable!("cannot iterate a {}", other.kind_name()),
        };

        match step {
            IterStep::Yield(value) => {
                self.stack[cursor_index] = Value::Int(cursor + 1);
                self.stack.push(value);
                Ok(true)
            }
            IterStep::YieldChar(ch, next_position) => {
                let mut buffer = [0u8; 4];
                let encoded = ch.encode_utf8(&mut buffer).to_owned();
                let value = Value::Ref(self.heap.alloc_str(&encoded));
                self.stack[cursor_index] =
                    Value::Int(i64::try_from(next_position).expect("string length fits i64"));
                self.stack.push(value);
                Ok(true)
            }
            IterStep::Done => Ok(false),
        }
    }

    /// `Len`: collection length (array elements, dict entries, string
    /// characters).
    pub(super) fn length(&mut self) -> RunResult<()> {
        let value = self.stack.pop().expect("len target missing");
        let Some(length) = crate::value::value_length(value, self.heap) else {
            return Err(RunError::type_mismatch(format!(
                "{} has no length",
                value.type_name(self.heap)
            )));
        };
        self.stack
            .push(Value::Int(i64::try_from(length).expect("length fits i64")));
        Ok(())
    }

    /// Normalizes an index value against a collection length.
    ///
    /// Negative indices count from the end: `-1` is the last element.
    fn array_index(&self, key: Value, length: usize) -> RunResult<usize> {
        let Value::Int(raw) = key else {
            return Err(RunError::type_mismatch(format!(
                "index must be an int, got {}",
                key.type_name(self.heap)
            )));
        };
        let length_i64 = i64::try_from(length).expect("length fits i64");
        let adjusted = if raw < 0 { raw + length_i64 } else { raw };
        if adjusted < 0 || adjusted >= length_i64 {
            return Err(RunError::new(
                ErrorKind::IndexOutOfRange,
                format!("index {raw} out of range for length {length}"),
            ));
        }
        Ok(usize::try_from(adjusted).expect("validated non-negative"))
    }

    /// Interned heap string for a member name, cached per name-table index.
    ///
    /// The cache is a GC root, so member-name strings stay stable for the
    /// whole run.
    fn member_id(&mut self, name_index: u16) -> HeapId {
        if let Some(id) = self.member_ids[usize::from(name_index)] {
            return id;
        }
        let id = self.heap.alloc_str(self.program.name(name_index));
        self.member_ids[usize::from(name_index)] = Some(id);
        id
    }
}
