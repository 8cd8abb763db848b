//! Arithmetic opcode handlers: Add, Sub, Mul, Div, Mod, Concat
//!
//! Integer operations that overflow produce doubles.

use crate::interpreter::execution::OpcodeResult;
use crate::interpreter::ExecutionContext;
use crate::value::Value;
use crate::{VmError, VmResult};
use strata_bytecode::Opcode;

fn numeric_operands(op: &str, a: &Value, b: &Value) -> VmResult<(Value, Value)> {
    match (a.to_number(), b.to_number()) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(VmError::TypeError(format!(
            "Unsupported operand types: {} {} {}",
            a.type_name(),
            op,
            b.type_name()
        ))),
    }
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Int(i) => *i as f64,
        Value::Double(d) => *d,
        _ => 0.0,
    }
}

fn arith(opcode: Opcode, a: &Value, b: &Value) -> VmResult<Value> {
    let symbol = match opcode {
        Opcode::Add => "+",
        Opcode::Sub => "-",
        Opcode::Mul => "*",
        Opcode::Div => "/",
        _ => "%",
    };
    let (x, y) = numeric_operands(symbol, a, b)?;

    if opcode == Opcode::Mod {
        let (x, y) = (x.to_int(), y.to_int());
        if y == 0 {
            return Err(VmError::RuntimeError("Modulo by zero".into()));
        }
        return Ok(Value::Int(x.wrapping_rem(y)));
    }

    if let (Value::Int(i), Value::Int(j)) = (&x, &y) {
        let (i, j) = (*i, *j);
        let exact = match opcode {
            Opcode::Add => i.checked_add(j),
            Opcode::Sub => i.checked_sub(j),
            Opcode::Mul => i.checked_mul(j),
            _ => {
                if j == 0 {
                    return Err(VmError::RuntimeError("Division by zero".into()));
                }
                match i.checked_rem(j) {
                    Some(0) => i.checked_div(j),
                    _ => None,
                }
            }
        };
        if let Some(v) = exact {
            return Ok(Value::Int(v));
        }
    }

    let (x, y) = (as_f64(&x), as_f64(&y));
    Ok(Value::Double(match opcode {
        Opcode::Add => x + y,
        Opcode::Sub => x - y,
        Opcode::Mul => x * y,
        _ => {
            if y == 0.0 {
                return Err(VmError::RuntimeError("Division by zero".into()));
            }
            x / y
        }
    }))
}

impl ExecutionContext {
    pub(in crate::interpreter) fn exec_arithmetic_ops(&mut self, opcode: Opcode) -> OpcodeResult {
        let b = vm_try!(self.stack.pop());
        let a = vm_try!(self.stack.pop());
        let result = match opcode {
            Opcode::Concat => {
                let mut s = a.to_display_string();
                s.push_str(&b.to_display_string());
                Value::str(&s)
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                vm_try!(arith(opcode, &a, &b))
            }
            _ => {
                return OpcodeResult::Error(VmError::RuntimeError(format!(
                    "Unexpected opcode in arithmetic handler: {:?}",
                    opcode
                )))
            }
        };
        vm_try!(self.stack.push(result));
        OpcodeResult::Continue
    }
}
