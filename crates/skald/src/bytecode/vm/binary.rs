//! Arithmetic and comparison opcode semantics.
//!
//! Promotion rules: `int ⊕ int → int` with wrapping at 64 bits, any mixed
//! int/float operation promotes to float with IEEE semantics, and string
//! `+` string concatenates (producing an interned string). Division and
//! modulo by integer zero are errors; float division by zero follows IEEE
//! and yields an infinity or NaN. `/` on two ints is integer division
//! truncating toward zero.

use super::{Interp, Opcode};
use crate::{
    error::{ErrorKind, RunError, RunResult},
    heap::HeapData,
    io::PrintWriter,
    tracer::VmTracer,
    value::{Value, values_equal},
};

/// Operand pair classification shared by the arithmetic handlers.
enum Operands {
    Ints(i64, i64),
    Floats(f64, f64),
    Strings,
    Other,
}

impl<P: PrintWriter, T: VmTracer> Interp<'_, P, T> {
    fn pop_pair(&mut self) -> (Value, Value) {
        let rhs = self.stack.pop().expect("binary op rhs missing");
        let lhs = self.stack.pop().expect("binary op lhs missing");
        (lhs, rhs)
    }

    fn classify(&self, lhs: Value, rhs: Value) -> Operands {
        match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => Operands::Ints(a, b),
            (Value::Float(a), Value::Float(b)) => Operands::Floats(a, b),
            (Value::Int(a), Value::Float(b)) => Operands::Floats(a as f64, b),
            (Value::Float(a), Value::Int(b)) => Operands::Floats(a, b as f64),
            (Value::Ref(a), Value::Ref(b))
                if matches!(self.heap.get(a), HeapData::Str(_)) && matches!(self.heap.get(b), HeapData::Str(_)) =>
            {
                Operands::Strings
            }
            _ => Operands::Other,
        }
    }

    fn binary_type_error(&self, op: &str, lhs: Value, rhs: Value) -> RunError {
        RunError::type_mismatch(format!(
            "unsupported operands for '{op}': {} and {}",
            lhs.type_name(self.heap),
            rhs.type_name(self.heap)
        ))
    }

    pub(super) fn binary_add(&mut self) -> RunResult<()> {
        let (lhs, rhs) = self.pop_pair();
        let result = match self.classify(lhs, rhs) {
            Operands::Ints(a, b) => Value::Int(a.wrapping_add(b)),
            Operands::Floats(a, b) => Value::Float(a + b),
            Operands::Strings => {
                let (Value::Ref(a), Value::Ref(b)) = (lhs, rhs) else {
                    unreachable!("classified as strings");
                };
                let mut text = String::with_capacity(
                    self.heap.str_value(a).len() + self.heap.str_value(b).len(),
                );
                text.push_str(self.heap.str_value(a));
                text.push_str(self.heap.str_value(b));
                Value::Ref(self.heap.alloc_str(&text))
            }
            Operands::Other => return Err(self.binary_type_error("+", lhs, rhs)),
        };
        self.stack.push(result);
        Ok(())
    }

    pub(super) fn binary_sub(&mut self) -> RunResult<()> {
        let (lhs, rhs) = self.pop_pair();
        let result = match self.classify(lhs, rhs) {
            Operands::Ints(a, b) => Value::Int(a.wrapping_sub(b)),
            Operands::Floats(a, b) => Value::Float(a - b),
            _ => return Err(self.binary_type_error("-", lhs, rhs)),
        };
        self.stack.push(result);
        Ok(())
    }

    pub(super) fn binary_mul(&mut self) -> RunResult<()> {
        let (lhs, rhs) = self.pop_pair();
        let result = match self.classify(lhs, rhs) {
            Operands::Ints(a, b) => Value::Int(a.wrapping_mul(b)),
            Operands::Floats(a, b) => Value::Float(a * b),
            _ => return Err(self.binary_type_error("*", lhs, rhs)),
        };
        self.stack.push(result);
        Ok(())
    }

    pub(super) fn binary_div(&mut self) -> RunResult<()> {
        let (lhs, rhs) = self.pop_pair();
        let result = match self.classify(lhs, rhs) {
            Operands::Ints(a, b) => {
                if b == 0 {
                    return Err(RunError::new(ErrorKind::DivisionByZero, "integer division by zero"));
                }
                Value::Int(a.wrapping_div(b))
            }
            Operands::Floats(a, b) => Value::Float(a / b),
            _ => return Err(self.binary_type_error("/", lhs, rhs)),
        };
        self.stack.push(result);
        Ok(())
    }

    pub(super) fn binary_mod(&mut self) -> RunResult<()> {
        let (lhs, rhs) = self.pop_pair();
        let result = match self.classify(lhs, rhs) {
            Operands::Ints(a, b) => {
                if b == 0 {
                    return Err(RunError::new(ErrorKind::DivisionByZero, "integer modulo by zero"));
                }
                Value::Int(a.wrapping_rem(b))
            }
            Operands::Floats(a, b) => Value::Float(a % b),
            _ => return Err(self.binary_type_error("%", lhs, rhs)),
        };
        self.stack.push(result);
        Ok(())
    }

    pub(super) fn negate(&mut self) -> RunResult<()> {
        let value = self.stack.pop().expect("negate on empty stack");
        let result = match value {
            Value::Int(v) => Value::Int(v.wrapping_neg()),
            Value::Float(v) => Value::Float(-v),
            other => {
                return Err(RunError::type_mismatch(format!(
                    "cannot negate {}",
                    other.type_name(self.heap)
                )));
            }
        };
        self.stack.push(result);
        Ok(())
    }

    pub(super) fn equality(&mut self, negate: bool) {
        let (lhs, rhs) = self.pop_pair();
        let equal = values_equal(lhs, rhs);
        self.stack.push(Value::Bool(equal != negate));
    }

    /// Ordered comparison: numbers with promotion, strings
    /// lexicographically; anything else is a type error. NaN compares false
    /// against everything, per IEEE.
    pub(super) fn compare(&mut self, op: Opcode) -> RunResult<()> {
        let (lhs, rhs) = self.pop_pair();
        let result = match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => Some(compare_bool(op, a.cmp(&b))),
            (Value::Float(a), Value::Float(b)) => Some(float_compare(op, a, b)),
            (Value::Int(a), Value::Float(b)) => Some(float_compare(op, a as f64, b)),
            (Value::Float(a), Value::Int(b)) => Some(float_compare(op, a, b as f64)),
            (Value::Ref(a), Value::Ref(b)) => match (self.heap.get(a), self.heap.get(b)) {
                (HeapData::Str(a), HeapData::Str(b)) => Some(compare_bool(op, a.cmp(b))),
                _ => None,
            },
            _ => None,
        };
        match result {
            Some(value) => {
                self.stack.push(Value::Bool(value));
                Ok(())
            }
            None => {
                let op_text = match op {
                    Opcode::Less => "<",
                    Opcode::LessEqual => "<=",
                    Opcode::Greater => ">",
                    Opcode::GreaterEqual => ">=",
                    other => unreachable!("not a comparison opcode: {other:?}"),
                };
                Err(self.binary_type_error(op_text, lhs, rhs))
            }
        }
    }
}

fn compare_bool(op: Opcode, ordering: std::cmp::Ordering) -> bool {
    match op {
        Opcode::Less => ordering.is_lt(),
        Opcode::LessEqual => ordering.is_le(),
        Opcode::Greater => ordering.is_gt(),
        Opcode::GreaterEqual => ordering.is_ge(),
        other => unreachable!("not a comparison opcode: {other:?}"),
    }
}

fn float_compare(op: Opcode, a: f64, b: f64) -> bool {
    match a.partial_cmp(&b) {
        Some(ordering) => compare_bool(op, ordering),
        // NaN is unordered: every comparison is false.
        None => false,
    }
}
