//! Bytecode verification
//!
//! Walks every reachable path and assigns each instruction a single operand
//! stack depth. Rejects underflow, inconsistent depths at merge points,
//! out-of-range operands, and control falling off the end of the body.

use super::{FunctionCode, Op};
use crate::error::{Error, Result};

/// Verify a function and record its per-instruction stack depths
pub fn verify(function: &mut FunctionCode) -> Result<()> {
    let len = function.code.len();
    let fail = |message: String| Error::verify_error(&function.name, message);

    if len == 0 {
        return Err(fail("empty function body".into()));
    }

    let mut depths: Vec<Option<u16>> = vec![None; len];
    let mut worklist: Vec<(usize, u16)> = vec![(0, 0)];
    let mut max_stack = 0u16;

    while let Some((pc, depth)) = worklist.pop() {
        if pc >= len {
            return Err(fail(format!("control reaches end of body at {}", pc)));
        }
        match depths[pc] {
            Some(known) if known == depth => continue,
            Some(known) => {
                return Err(fail(format!(
                    "stack depth mismatch at {}: {} vs {}",
                    pc, known, depth
                )))
            }
            None => depths[pc] = Some(depth),
        }

        let op = function.code[pc];
        check_operands(function, pc, &op).map_err(fail)?;

        let (pops, pushes) = op.stack_effect();
        if (depth as usize) < pops {
            return Err(fail(format!("stack underflow at {}", pc)));
        }
        let after = depth as usize - pops + pushes;
        let after = u16::try_from(after).map_err(|_| fail(format!("stack overflow at {}", pc)))?;
        max_stack = max_stack.max(after).max(depth);

        match op {
            Op::Jump(target) => worklist.push((target as usize, after)),
            Op::JumpIfFalse(target) | Op::JumpIfTrue(target) => {
                worklist.push((target as usize, after));
                worklist.push((pc + 1, after));
            }
            Op::EnterTry(target) => {
                // The handler sees the stack as it was at entry plus the exception.
                worklist.push((target as usize, depth + 1));
                worklist.push((pc + 1, after));
            }
            Op::Return | Op::Throw => {}
            _ => worklist.push((pc + 1, after)),
        }
    }

    function.stack_depths = depths;
    function.max_stack = max_stack;
    Ok(())
}

fn check_operands(function: &FunctionCode, pc: usize, op: &Op) -> std::result::Result<(), String> {
    let len = function.code.len();
    let slot_ok = |slot: u16| (slot as usize) < function.sites.len();
    match *op {
        Op::Const(i) if i as usize >= function.constants.len() => {
            Err(format!("constant {} out of range at {}", i, pc))
        }
        Op::GetLocal(i) | Op::SetLocal(i) if i >= function.local_count => {
            Err(format!("local {} out of range at {}", i, pc))
        }
        Op::Jump(t) | Op::JumpIfFalse(t) | Op::JumpIfTrue(t) | Op::EnterTry(t)
            if t as usize >= len =>
        {
            Err(format!("jump target {} out of range at {}", t, pc))
        }
        Op::GetProp { slot, .. }
        | Op::SetProp { slot, .. }
        | Op::Call { slot, .. }
        | Op::New { slot, .. }
        | Op::Binary { slot, .. }
            if !slot_ok(slot) =>
        {
            Err(format!("feedback slot {} out of range at {}", slot, pc))
        }
        Op::CallMethod { load, slot, .. } if !slot_ok(load) || !slot_ok(slot) => {
            Err(format!("feedback slot out of range at {}", pc))
        }
        _ => Ok(()),
    }
}
