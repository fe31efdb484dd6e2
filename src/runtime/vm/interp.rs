//! Bytecode interpreter
//!
//! Executes one instruction of the interpreted frame on top of the stack,
//! recording type feedback at every access, call and arithmetic site.

use std::sync::Arc;

use super::frame::Frame;
use super::{Callee, Flow, Vm};
use crate::bytecode::{BinaryOp, FunctionId, Op, UnaryOp};
use crate::error::{messages, Error, Result};
use crate::jit::deopt::TryHandler;
use crate::jit::feedback::{FeedbackKey, SiteId};
use crate::jit::ObservedType;
use crate::runtime::intern::Atom;
use crate::runtime::Value;

impl Vm {
    pub(super) fn step_interpreted(&mut self) -> Result<Flow> {
        let (function, pc) = {
            let frame = self.top()?;
            (frame.function, frame.pc)
        };
        let program = Arc::clone(&self.program);
        let code = program.function(function);
        let Some(&op) = code.code.get(pc) else {
            return Err(Error::InternalError(format!("{}: pc {} out of range", code.name, pc)));
        };
        let strict = code.strict;

        match op {
            Op::Const(index) => {
                let value = code.constants[index as usize].clone();
                self.advance(value)
            }
            Op::Undefined => self.advance(Value::Undefined),
            Op::Null => self.advance(Value::Null),
            Op::True => self.advance(Value::Boolean(true)),
            Op::False => self.advance(Value::Boolean(false)),
            Op::Pop => {
                let frame = self.top()?;
                frame.pop()?;
                frame.pc += 1;
                Ok(Flow::Continue)
            }
            Op::Dup => {
                let value = self.top()?.peek()?.clone();
                self.advance(value)
            }
            Op::Swap => {
                let frame = self.top()?;
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.push(b);
                frame.push(a);
                frame.pc += 1;
                Ok(Flow::Continue)
            }
            Op::GetLocal(index) => {
                let value = self.top()?.slots[index as usize].clone();
                self.advance(value)
            }
            Op::SetLocal(index) => {
                let frame = self.top()?;
                let value = frame.pop()?;
                frame.slots[index as usize] = value;
                frame.pc += 1;
                Ok(Flow::Continue)
            }
            Op::GetGlobal(name) => {
                let value = self.read_global(name)?;
                self.advance(value)
            }
            Op::SetGlobal(name) => {
                let value = self.top()?.pop()?;
                self.write_global(name, value, strict)?;
                self.top()?.pc += 1;
                Ok(Flow::Continue)
            }
            Op::This => {
                let value = self.top()?.this.clone();
                self.advance(value)
            }
            Op::GetProp { name, slot } => {
                let site = self.feedback.site(function, slot);
                let object = self.top()?.pop()?;
                let value = self.get_property(&object, name, Some(site))?;
                self.advance(value)
            }
            Op::SetProp { name, slot } => {
                let site = self.feedback.site(function, slot);
                let frame = self.top()?;
                let value = frame.pop()?;
                let object = frame.pop()?;
                self.set_property(&object, name, value, strict, Some(site))?;
                self.top()?.pc += 1;
                Ok(Flow::Continue)
            }
            Op::DeleteProp(name) => {
                let object = self.top()?.pop()?;
                let deleted = self.delete_property(&object, name, strict)?;
                self.advance(Value::Boolean(deleted))
            }
            Op::NewObject => {
                let object = self.new_object();
                self.advance(Value::Object(object))
            }
            Op::Call { argc, slot } => {
                let site = self.feedback.site(function, slot);
                let frame = self.top()?;
                let args = frame.pop_n(argc as usize)?;
                let callee = frame.pop()?;
                self.call_op(callee, Value::Undefined, args, site)
            }
            Op::CallMethod {
                name,
                argc,
                load,
                slot,
            } => {
                let load = self.feedback.site(function, load);
                let site = self.feedback.site(function, slot);
                let frame = self.top()?;
                let args = frame.pop_n(argc as usize)?;
                let receiver = frame.pop()?;
                let method = self.load_method(&receiver, name, load)?;
                self.call_op(method, receiver, args, site)
            }
            Op::New { argc, slot } => {
                let site = self.feedback.site(function, slot);
                let frame = self.top()?;
                let args = frame.pop_n(argc as usize)?;
                let callee = frame.pop()?;
                self.new_op(callee, args, site)
            }
            Op::Binary { op, slot } => {
                let site = self.feedback.site(function, slot);
                let frame = self.top()?;
                let b = frame.pop()?;
                let a = frame.pop()?;
                self.record_operands(site, &a, &b);
                let value = self.binary(op, &a, &b);
                self.advance(value)
            }
            Op::Unary(op) => {
                let operand = self.top()?.pop()?;
                let value = self.unary(op, &operand);
                self.advance(value)
            }
            Op::Jump(target) => {
                self.top()?.pc = target as usize;
                Ok(Flow::Continue)
            }
            Op::JumpIfFalse(target) => self.branch(function, pc, target, false),
            Op::JumpIfTrue(target) => self.branch(function, pc, target, true),
            Op::EnterTry(catch) => {
                let frame = self.top()?;
                frame.handlers.push(TryHandler {
                    target: catch as usize,
                    stack_depth: frame.stack.len(),
                    frame: 0,
                    catch_pc: catch,
                });
                frame.pc += 1;
                Ok(Flow::Continue)
            }
            Op::LeaveTry => {
                let frame = self.top()?;
                frame.handlers.pop();
                frame.pc += 1;
                Ok(Flow::Continue)
            }
            Op::Throw => {
                let value = self.top()?.pop()?;
                Err(self.exception(value))
            }
            Op::Return => {
                let value = self.top()?.pop()?;
                Ok(Flow::Return(value))
            }
            Op::Debugger => {
                tracing::debug!(function = %self.function_name(function), pc, "debugger statement");
                self.top()?.pc += 1;
                Ok(Flow::Continue)
            }
        }
    }

    /// Push onto the current frame and move to the next instruction
    pub(super) fn advance(&mut self, value: Value) -> Result<Flow> {
        let frame = self.top()?;
        frame.push(value);
        frame.pc += 1;
        Ok(Flow::Continue)
    }

    fn branch(&mut self, function: FunctionId, pc: usize, target: u32, when: bool) -> Result<Flow> {
        let condition = self.top()?.pop()?.to_boolean();
        let taken = condition == when;
        self.feedback
            .with_profile(function, |p| p.record_branch(pc as u32, taken));
        let frame: &mut Frame = self.top()?;
        frame.pc = if taken { target as usize } else { pc + 1 };
        Ok(Flow::Continue)
    }

    pub(super) fn read_global(&self, name: Atom) -> Result<Value> {
        self.globals
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::reference_error(messages::not_defined(self.resolve(name))))
    }

    pub(super) fn write_global(&mut self, name: Atom, value: Value, strict: bool) -> Result<()> {
        if strict && !self.globals.contains_key(&name) {
            return Err(Error::reference_error(messages::not_defined(self.resolve(name))));
        }
        self.globals.insert(name, value);
        Ok(())
    }

    /// Method lookup of a `CallMethod`, observed at the load site
    pub(super) fn load_method(&mut self, receiver: &Value, name: Atom, load: SiteId) -> Result<Value> {
        let method = self.get_property(receiver, name, Some(load))?;
        if !self.is_callable(&method) {
            let path = format!("{}.{}", self.describe(receiver), self.resolve(name));
            return Err(Error::type_error(messages::not_a_function(&path)));
        }
        Ok(method)
    }

    /// Generic call from either tier. Script callees get a new frame; native
    /// results are handed straight back to the calling frame.
    pub(super) fn call_op(&mut self, callee: Value, this: Value, args: Vec<Value>, site: SiteId) -> Result<Flow> {
        self.record_callee(site, &callee);
        match self.callee_of(&callee) {
            Some(Callee::Script(function)) => {
                self.enter_function(function, this, args, None)?;
                Ok(Flow::Continue)
            }
            Some(Callee::Native(native)) => {
                let value = self.invoke_native(native, this, args)?;
                self.resume_caller(value);
                Ok(Flow::Continue)
            }
            None => Err(Error::type_error(messages::not_a_function(&self.describe(&callee)))),
        }
    }

    pub(super) fn new_op(&mut self, callee: Value, args: Vec<Value>, site: SiteId) -> Result<Flow> {
        self.record_callee(site, &callee);
        match self.callee_of(&callee) {
            Some(Callee::Script(function)) => {
                let object = self.construct_receiver(&callee)?;
                self.enter_function(function, Value::Object(object), args, Some(object))?;
                Ok(Flow::Continue)
            }
            Some(Callee::Native(native)) if self.native(native).constructor => {
                let value = self.invoke_native(native, Value::Undefined, args)?;
                self.resume_caller(value);
                Ok(Flow::Continue)
            }
            _ => Err(Error::type_error(messages::not_a_constructor(&self.describe(&callee)))),
        }
    }

    pub(super) fn record_operands(&self, site: SiteId, a: &Value, b: &Value) {
        self.feedback.record(
            site,
            FeedbackKey::Operands(ObservedType::of(a), ObservedType::of(b)),
        );
    }

    /// Generic binary operator
    pub(crate) fn binary(&self, op: BinaryOp, a: &Value, b: &Value) -> Value {
        if let (Value::Number(x), Value::Number(y)) = (a, b) {
            return op.apply_numbers(*x, *y);
        }
        match op {
            BinaryOp::Add => {
                if matches!(a, Value::String(_) | Value::Object(_)) || matches!(b, Value::String(_) | Value::Object(_)) {
                    let mut text = self.display(a);
                    text.push_str(&self.display(b));
                    Value::string(text)
                } else {
                    Value::Number(a.to_number() + b.to_number())
                }
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => match (a, b) {
                (Value::String(x), Value::String(y)) => {
                    let ordering = x.encode_utf16().cmp(y.encode_utf16());
                    Value::Boolean(match op {
                        BinaryOp::Lt => ordering.is_lt(),
                        BinaryOp::Le => ordering.is_le(),
                        BinaryOp::Gt => ordering.is_gt(),
                        _ => ordering.is_ge(),
                    })
                }
                _ => op.apply_numbers(a.to_number(), b.to_number()),
            },
            BinaryOp::StrictEq => Value::Boolean(a.strict_equals(b)),
            BinaryOp::StrictNe => Value::Boolean(!a.strict_equals(b)),
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                op.apply_numbers(a.to_number(), b.to_number())
            }
        }
    }

    pub(crate) fn unary(&self, op: UnaryOp, operand: &Value) -> Value {
        match op {
            UnaryOp::Neg => Value::Number(-operand.to_number()),
            UnaryOp::Not => Value::Boolean(!operand.to_boolean()),
            UnaryOp::TypeOf => Value::string(self.type_of(operand)),
        }
    }
}
