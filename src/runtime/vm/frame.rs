//! Call frames
//!
//! Interpreted frames own their locals and operand stack. A compiled frame
//! owns the unit's whole slot file and one operand stack shared by every
//! inline frame; `inline` tracks which inline frame is executing.

use std::sync::Arc;

use crate::bytecode::FunctionId;
use crate::error::{Error, Result};
use crate::jit::deopt::{FrameState, TryHandler};
use crate::jit::unit::{CompiledUnit, DeoptId, FrameIndex};
use crate::runtime::{ObjectId, Value};

/// What a frame is executing
#[derive(Debug, Clone)]
pub(crate) enum FrameCode {
    Interpreted,
    Compiled(Arc<CompiledUnit>),
}

#[derive(Debug)]
pub(crate) struct Frame {
    pub function: FunctionId,
    pub code: FrameCode,
    /// Bytecode pc, or op index for compiled frames; stays on a call until it returns
    pub pc: usize,
    /// Locals, or the unit's slot file
    pub slots: Vec<Value>,
    /// `this` of an interpreted frame; compiled frames keep it in a slot
    pub this: Value,
    pub stack: Vec<Value>,
    pub handlers: Vec<TryHandler>,
    /// Object under construction for `new` calls
    pub construct: Option<ObjectId>,
    /// Lazy deopt point of the real call in progress
    pub resume: Option<DeoptId>,
    /// Active inline frame of a compiled frame
    pub inline: FrameIndex,
}

impl Frame {
    pub fn interpreted(
        function: FunctionId,
        locals: Vec<Value>,
        this: Value,
        construct: Option<ObjectId>,
    ) -> Self {
        Self {
            function,
            code: FrameCode::Interpreted,
            pc: 0,
            slots: locals,
            this,
            stack: Vec::new(),
            handlers: Vec::new(),
            construct,
            resume: None,
            inline: 0,
        }
    }

    pub fn compiled(unit: Arc<CompiledUnit>, slots: Vec<Value>, construct: Option<ObjectId>) -> Self {
        Self {
            function: unit.function,
            code: FrameCode::Compiled(unit),
            pc: 0,
            slots,
            this: Value::Undefined,
            stack: Vec::new(),
            handlers: Vec::new(),
            construct,
            resume: None,
            inline: 0,
        }
    }

    /// Interpreter frame rebuilt by deoptimization
    pub fn restored(state: FrameState) -> Self {
        Self {
            function: state.function,
            code: FrameCode::Interpreted,
            pc: state.pc,
            slots: state.locals,
            this: state.this,
            stack: state.stack,
            handlers: state.handlers,
            construct: None,
            resume: None,
            inline: 0,
        }
    }

    pub fn unit(&self) -> Option<&Arc<CompiledUnit>> {
        match &self.code {
            FrameCode::Compiled(unit) => Some(unit),
            FrameCode::Interpreted => None,
        }
    }

    /// Logical frames this frame stands for, inlined callees included
    pub fn weight(&self) -> usize {
        match &self.code {
            FrameCode::Interpreted => 1,
            FrameCode::Compiled(unit) => 1 + unit.frames[self.inline as usize].depth as usize,
        }
    }

    /// Function whose code is executing, after inlining
    pub fn active_function(&self) -> FunctionId {
        match &self.code {
            FrameCode::Interpreted => self.function,
            FrameCode::Compiled(unit) => unit.frames[self.inline as usize].function,
        }
    }

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| Error::InternalError("operand stack underflow".into()))
    }

    /// Pop the top `n` values, in push order
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Value>> {
        let len = self.stack.len();
        if n > len {
            return Err(Error::InternalError("operand stack underflow".into()));
        }
        Ok(self.stack.split_off(len - n))
    }

    pub fn peek(&self) -> Result<&Value> {
        self.stack
            .last()
            .ok_or_else(|| Error::InternalError("operand stack underflow".into()))
    }

    /// Every value the frame keeps alive
    pub fn roots(&self) -> impl Iterator<Item = &Value> {
        self.slots
            .iter()
            .chain(self.stack.iter())
            .chain(std::iter::once(&self.this))
    }
}
