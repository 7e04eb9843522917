//! A tiny NeoVM evaluator covering the opcodes the generator emits for
//! arithmetic, control flow, slots and sequences. Syscalls and exceptions are
//! not modelled.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use neobc::{
    CompiledUnit,
    bytecode::{Opcode, disasm::Instruction},
};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Bytes(Vec<u8>),
    Buffer(Rc<RefCell<Vec<u8>>>),
    Array(Rc<RefCell<Vec<Value>>>),
}

impl Value {
    pub fn ints(items: &[i64]) -> Self {
        Self::array(items.iter().copied().map(Value::Int).collect())
    }

    pub fn array(items: Vec<Value>) -> Self {
        Self::Array(Rc::new(RefCell::new(items)))
    }

    pub fn str(text: &str) -> Self {
        Self::Bytes(text.as_bytes().to_vec())
    }

    fn int(&self) -> Result<i64, String> {
        match self {
            Self::Int(value) => Ok(*value),
            Self::Bool(value) => Ok(i64::from(*value)),
            other => Err(format!("expected an integer, got {other:?}")),
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(value) => *value,
            Self::Int(value) => *value != 0,
            _ => true,
        }
    }

    fn bytes(&self) -> Result<Vec<u8>, String> {
        match self {
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::Buffer(buffer) => Ok(buffer.borrow().clone()),
            other => Err(format!("expected bytes, got {other:?}")),
        }
    }

    fn index(&self) -> Result<usize, String> {
        usize::try_from(self.int()?).map_err(|_| format!("negative index {self:?}"))
    }
}

struct Frame {
    return_to: Option<usize>,
    locals: Vec<Value>,
    args: Vec<Value>,
}

fn slot(op: Opcode, base: Opcode) -> usize {
    usize::from(op as u8 - base as u8)
}

fn small_int(operand: &[u8]) -> i64 {
    let fill = if operand.last().is_some_and(|byte| byte & 0x80 != 0) { 0xFF } else { 0x00 };
    let mut le = [fill; 8];
    le[..operand.len()].copy_from_slice(operand);
    i64::from_le_bytes(le)
}

/// Runs `method` of `unit` with `args` and returns the value it leaves.
pub fn run(unit: &CompiledUnit, method: &str, args: Vec<Value>) -> Result<Value, String> {
    let program = unit.disassemble().map_err(|err| err.to_string())?;
    let by_address: HashMap<u32, usize> = program.iter().enumerate().map(|(i, ins)| (ins.address, i)).collect();
    let start = unit.method_address(method).ok_or("unknown method")?;
    let mut pc = by_address[&start];
    let mut stack: Vec<Value> = args.into_iter().rev().collect();
    let mut frames = vec![Frame {
        return_to: None,
        locals: Vec::new(),
        args: Vec::new(),
    }];
    let mut statics: Vec<Value> = Vec::new();
    let mut steps = 0;

    macro_rules! pop {
        () => {
            stack.pop().ok_or("stack underflow")?
        };
    }

    loop {
        steps += 1;
        if steps > 100_000 {
            return Err("step limit exceeded".to_owned());
        }
        let ins: &Instruction = program.get(pc).ok_or("ran off the end of the script")?;
        let mut next = pc + 1;
        let jump = |target: Option<u32>| -> Result<usize, String> {
            target
                .and_then(|address| by_address.get(&address).copied())
                .ok_or_else(|| format!("bad jump target at {}", ins.address))
        };
        let op = ins.opcode;
        if let Some(value) = op.small_value() {
            stack.push(Value::Int(value));
            pc = next;
            continue;
        }
        match op {
            Opcode::PushInt8 | Opcode::PushInt16 | Opcode::PushInt32 | Opcode::PushInt64 => {
                stack.push(Value::Int(small_int(&ins.operand)));
            }
            Opcode::PushT => stack.push(Value::Bool(true)),
            Opcode::PushF => stack.push(Value::Bool(false)),
            Opcode::PushNull => stack.push(Value::Null),
            Opcode::PushData1 | Opcode::PushData2 | Opcode::PushData4 => stack.push(Value::Bytes(ins.operand.clone())),
            Opcode::Nop => {}
            Opcode::Jmp | Opcode::JmpL => next = jump(ins.target)?,
            Opcode::JmpIf | Opcode::JmpIfL => {
                if pop!().truthy() {
                    next = jump(ins.target)?;
                }
            }
            Opcode::JmpIfNot | Opcode::JmpIfNotL => {
                if !pop!().truthy() {
                    next = jump(ins.target)?;
                }
            }
            Opcode::JmpEq
            | Opcode::JmpEqL
            | Opcode::JmpNe
            | Opcode::JmpNeL
            | Opcode::JmpGt
            | Opcode::JmpGtL
            | Opcode::JmpGe
            | Opcode::JmpGeL
            | Opcode::JmpLt
            | Opcode::JmpLtL
            | Opcode::JmpLe
            | Opcode::JmpLeL => {
                let b = pop!().int()?;
                let a = pop!().int()?;
                let taken = match op {
                    Opcode::JmpEq | Opcode::JmpEqL => a == b,
                    Opcode::JmpNe | Opcode::JmpNeL => a != b,
                    Opcode::JmpGt | Opcode::JmpGtL => a > b,
                    Opcode::JmpGe | Opcode::JmpGeL => a >= b,
                    Opcode::JmpLt | Opcode::JmpLtL => a < b,
                    _ => a <= b,
                };
                if taken {
                    next = jump(ins.target)?;
                }
            }
            Opcode::Call | Opcode::CallL => {
                frames.push(Frame {
                    return_to: Some(next),
                    locals: Vec::new(),
                    args: Vec::new(),
                });
                next = jump(ins.target)?;
            }
            Opcode::Ret => {
                let frame = frames.pop().ok_or("return without frame")?;
                match frame.return_to {
                    Some(to) => next = to,
                    None => return Ok(stack.pop().unwrap_or(Value::Null)),
                }
            }
            Opcode::Throw | Opcode::Abort | Opcode::AbortMsg => return Err(format!("{op} at {}", ins.address)),
            Opcode::Assert => {
                if !pop!().truthy() {
                    return Err(format!("assertion failed at {}", ins.address));
                }
            }
            Opcode::InitSSlot => statics = vec![Value::Null; usize::from(ins.operand[0])],
            Opcode::InitSlot => {
                let frame = frames.last_mut().ok_or("no frame")?;
                frame.locals = vec![Value::Null; usize::from(ins.operand[0])];
                for _ in 0..ins.operand[1] {
                    frame.args.push(stack.pop().ok_or("missing argument")?);
                }
            }
            Opcode::Drop => {
                pop!();
            }
            Opcode::Nip => {
                let top = pop!();
                pop!();
                stack.push(top);
            }
            Opcode::Dup => stack.push(stack.last().cloned().ok_or("stack underflow")?),
            Opcode::Over => stack.push(stack.get(stack.len().wrapping_sub(2)).cloned().ok_or("stack underflow")?),
            Opcode::Pick => {
                let depth = pop!().index()?;
                let item = stack.get(stack.len().wrapping_sub(depth + 1)).cloned().ok_or("stack underflow")?;
                stack.push(item);
            }
            Opcode::Swap => {
                let len = stack.len();
                stack.swap(len - 1, len - 2);
            }
            Opcode::Rot => {
                let item = stack.remove(stack.len() - 3);
                stack.push(item);
            }
            Opcode::Reverse3 | Opcode::Reverse4 => {
                let count = if op == Opcode::Reverse3 { 3 } else { 4 };
                let len = stack.len();
                stack[len - count..].reverse();
            }
            Opcode::Sign | Opcode::Abs | Opcode::Negate | Opcode::Inc | Opcode::Dec => {
                let a = pop!().int()?;
                stack.push(Value::Int(match op {
                    Opcode::Sign => a.signum(),
                    Opcode::Abs => a.abs(),
                    Opcode::Negate => -a,
                    Opcode::Inc => a + 1,
                    _ => a - 1,
                }));
            }
            Opcode::Not => {
                let a = pop!();
                stack.push(Value::Bool(!a.truthy()));
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Min
            | Opcode::Max
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ge
            | Opcode::NumEqual
            | Opcode::NumNotEqual
            | Opcode::BoolAnd
            | Opcode::BoolOr => {
                let b = pop!().int()?;
                let a = pop!().int()?;
                stack.push(match op {
                    Opcode::Add => Value::Int(a + b),
                    Opcode::Sub => Value::Int(a - b),
                    Opcode::Mul => Value::Int(a * b),
                    Opcode::Div => Value::Int(a.checked_div(b).ok_or("division by zero")?),
                    Opcode::Mod => Value::Int(a.checked_rem(b).ok_or("division by zero")?),
                    Opcode::Min => Value::Int(a.min(b)),
                    Opcode::Max => Value::Int(a.max(b)),
                    Opcode::Lt => Value::Bool(a < b),
                    Opcode::Le => Value::Bool(a <= b),
                    Opcode::Gt => Value::Bool(a > b),
                    Opcode::Ge => Value::Bool(a >= b),
                    Opcode::NumEqual => Value::Bool(a == b),
                    Opcode::NumNotEqual => Value::Bool(a != b),
                    Opcode::BoolAnd => Value::Bool(a != 0 && b != 0),
                    _ => Value::Bool(a != 0 || b != 0),
                });
            }
            Opcode::Equal => {
                let b = pop!();
                let a = pop!();
                stack.push(Value::Bool(a == b));
            }
            Opcode::IsNull => {
                let a = pop!();
                stack.push(Value::Bool(a == Value::Null));
            }
            Opcode::LdSFld0 | Opcode::LdSFld1 | Opcode::LdSFld2 => {
                let value = statics.get(slot(op, Opcode::LdSFld0)).cloned();
                stack.push(value.ok_or("static slot out of range")?);
            }
            Opcode::LdLoc0 | Opcode::LdLoc1 | Opcode::LdLoc2 | Opcode::LdLoc3 => {
                let frame = frames.last().ok_or("no frame")?;
                let value = frame.locals.get(slot(op, Opcode::LdLoc0)).cloned();
                stack.push(value.ok_or("local slot out of range")?);
            }
            Opcode::LdArg0 | Opcode::LdArg1 | Opcode::LdArg2 | Opcode::LdArg3 => {
                let frame = frames.last().ok_or("no frame")?;
                let value = frame.args.get(slot(op, Opcode::LdArg0)).cloned();
                stack.push(value.ok_or("argument slot out of range")?);
            }
            Opcode::StSFld0 | Opcode::StSFld1 | Opcode::StSFld2 => {
                let value = pop!();
                *statics.get_mut(slot(op, Opcode::StSFld0)).ok_or("static slot out of range")? = value;
            }
            Opcode::StLoc0 | Opcode::StLoc1 | Opcode::StLoc2 | Opcode::StLoc3 => {
                let value = pop!();
                let frame = frames.last_mut().ok_or("no frame")?;
                *frame.locals.get_mut(slot(op, Opcode::StLoc0)).ok_or("local slot out of range")? = value;
            }
            Opcode::StArg0 | Opcode::StArg1 | Opcode::StArg2 | Opcode::StArg3 => {
                let value = pop!();
                let frame = frames.last_mut().ok_or("no frame")?;
                *frame.args.get_mut(slot(op, Opcode::StArg0)).ok_or("argument slot out of range")? = value;
            }
            Opcode::NewArray0 => stack.push(Value::array(Vec::new())),
            Opcode::NewArray => {
                let count = pop!().index()?;
                stack.push(Value::array(vec![Value::Null; count]));
            }
            Opcode::Pack => {
                let count = pop!().index()?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(pop!());
                }
                stack.push(Value::array(items));
            }
            Opcode::Unpack => {
                let Value::Array(items) = pop!() else {
                    return Err("UNPACK of a non-array".to_owned());
                };
                let items = items.borrow();
                for item in items.iter().rev() {
                    stack.push(item.clone());
                }
                stack.push(Value::Int(i64::try_from(items.len()).unwrap_or(i64::MAX)));
            }
            Opcode::Size => {
                let len = match pop!() {
                    Value::Array(items) => items.borrow().len(),
                    other => other.bytes()?.len(),
                };
                stack.push(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)));
            }
            Opcode::PickItem => {
                let index = pop!().index()?;
                let item = match pop!() {
                    Value::Array(items) => items.borrow().get(index).cloned(),
                    other => other.bytes()?.get(index).map(|&byte| Value::Int(i64::from(byte))),
                };
                stack.push(item.ok_or("index out of range")?);
            }
            Opcode::SetItem => {
                let value = pop!();
                let index = pop!().index()?;
                match pop!() {
                    Value::Array(items) => *items.borrow_mut().get_mut(index).ok_or("index out of range")? = value,
                    Value::Buffer(buffer) => {
                        let byte = u8::try_from(value.int()?).map_err(|_| "byte out of range")?;
                        *buffer.borrow_mut().get_mut(index).ok_or("index out of range")? = byte;
                    }
                    other => return Err(format!("SETITEM on {other:?}")),
                }
            }
            Opcode::Append => {
                let value = pop!();
                let Value::Array(items) = pop!() else {
                    return Err("APPEND to a non-array".to_owned());
                };
                items.borrow_mut().push(value);
            }
            Opcode::Remove => {
                let index = pop!().index()?;
                let Value::Array(items) = pop!() else {
                    return Err("REMOVE from a non-array".to_owned());
                };
                if index >= items.borrow().len() {
                    return Err("index out of range".to_owned());
                }
                items.borrow_mut().remove(index);
            }
            Opcode::PopItem => {
                let Value::Array(items) = pop!() else {
                    return Err("POPITEM from a non-array".to_owned());
                };
                let item = items.borrow_mut().pop().ok_or("pop from empty array")?;
                stack.push(item);
            }
            Opcode::ReverseItems => match pop!() {
                Value::Array(items) => items.borrow_mut().reverse(),
                Value::Buffer(buffer) => buffer.borrow_mut().reverse(),
                other => return Err(format!("REVERSEITEMS on {other:?}")),
            },
            Opcode::Cat => {
                let b = pop!().bytes()?;
                let mut a = pop!().bytes()?;
                a.extend(b);
                stack.push(Value::Buffer(Rc::new(RefCell::new(a))));
            }
            Opcode::SubStr => {
                let count = pop!().index()?;
                let index = pop!().index()?;
                let bytes = pop!().bytes()?;
                let part = bytes.get(index..index + count).ok_or("SUBSTR out of range")?;
                stack.push(Value::Buffer(Rc::new(RefCell::new(part.to_vec()))));
            }
            Opcode::Left | Opcode::Right => {
                let count = pop!().index()?;
                let bytes = pop!().bytes()?;
                if count > bytes.len() {
                    return Err(format!("{op} out of range"));
                }
                let part = if op == Opcode::Left {
                    &bytes[..count]
                } else {
                    &bytes[bytes.len() - count..]
                };
                stack.push(Value::Buffer(Rc::new(RefCell::new(part.to_vec()))));
            }
            Opcode::Convert => {
                let value = pop!();
                stack.push(match ins.operand[0] {
                    0x28 => Value::Bytes(value.bytes()?),
                    0x30 => Value::Buffer(Rc::new(RefCell::new(value.bytes()?))),
                    0x20 => Value::Bool(value.truthy()),
                    _ => value,
                });
            }
            other => return Err(format!("unsupported opcode {other} at {}", ins.address)),
        }
        pc = next;
    }
}

/// Every jump, call and handler destination in the script is the start of an
/// instruction or the end of the script.
pub fn assert_targets_resolve(unit: &CompiledUnit) {
    let program = unit.disassemble().expect("script decodes");
    let end = u32::try_from(unit.script.len()).expect("script fits u32");
    let starts: std::collections::HashSet<u32> = program.iter().map(|ins| ins.address).collect();
    for ins in &program {
        for dest in ins.destinations() {
            assert!(
                starts.contains(&dest) || dest == end,
                "{} at {} points into the middle of an instruction ({dest})",
                ins.opcode,
                ins.address
            );
        }
    }
}
