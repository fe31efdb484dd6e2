//! Program assembly
//!
//! ```
//! use quicksilver_tier::bytecode::ProgramBuilder;
//!
//! let mut builder = ProgramBuilder::new();
//! builder.function("double", 1, |f| {
//!     f.local(0).number(2.0).mul().ret();
//! });
//! let program = builder.build().unwrap();
//! assert_eq!(program.function(program.lookup("double").unwrap()).size(), 4);
//! ```

use rustc_hash::FxHashMap;

use super::{verify, BinaryOp, FunctionCode, FunctionId, Op, Program, SiteKind, SlotId, UnaryOp};
use crate::error::{Error, Result};
use crate::runtime::intern::AtomTable;
use crate::runtime::Value;

/// Jump target placeholder, bound to an offset with [`FunctionBuilder::bind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

/// Assembles a set of functions into a [`Program`]
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    atoms: AtomTable,
    functions: Vec<FunctionCode>,
    names: FxHashMap<String, FunctionId>,
    error: Option<Error>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a function; its name becomes a global binding when loaded
    pub fn function(
        &mut self,
        name: &str,
        params: u16,
        body: impl FnOnce(&mut FunctionBuilder<'_>),
    ) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        let mut fb = FunctionBuilder::new(&mut self.atoms, name, params);
        body(&mut fb);
        let code = fb.finish(id);
        if self.names.insert(name.to_string(), id).is_some() && self.error.is_none() {
            self.error = Some(Error::verify_error(name, "duplicate function name"));
        }
        match code {
            Ok(code) => self.functions.push(code),
            Err(e) => {
                if self.error.is_none() {
                    self.error = Some(e);
                }
                self.functions.push(placeholder(id, name));
            }
        }
        id
    }

    /// Verify every function and produce the program
    pub fn build(self) -> Result<Program> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let mut functions = self.functions;
        for function in &mut functions {
            verify(function)?;
        }
        Ok(Program::new(functions, self.atoms))
    }
}

fn placeholder(id: FunctionId, name: &str) -> FunctionCode {
    FunctionCode {
        id,
        name: name.to_string(),
        param_count: 0,
        local_count: 0,
        code: Vec::new(),
        constants: Vec::new(),
        sites: Vec::new(),
        strict: false,
        stack_depths: Vec::new(),
        max_stack: 0,
    }
}

/// Emits one function body
#[derive(Debug)]
pub struct FunctionBuilder<'a> {
    atoms: &'a mut AtomTable,
    name: String,
    params: u16,
    locals: u16,
    code: Vec<Op>,
    constants: Vec<Value>,
    sites: Vec<SiteKind>,
    strict: bool,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
}

impl<'a> FunctionBuilder<'a> {
    fn new(atoms: &'a mut AtomTable, name: &str, params: u16) -> Self {
        Self {
            atoms,
            name: name.to_string(),
            params,
            locals: params,
            code: Vec::new(),
            constants: Vec::new(),
            sites: Vec::new(),
            strict: false,
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    fn finish(self, id: FunctionId) -> Result<FunctionCode> {
        let mut code = self.code;
        for (pc, label) in self.fixups {
            let target = self.labels[label.0 as usize]
                .ok_or_else(|| Error::verify_error(&self.name, format!("unbound label at {}", pc)))?;
            code[pc] = match code[pc] {
                Op::Jump(_) => Op::Jump(target),
                Op::JumpIfFalse(_) => Op::JumpIfFalse(target),
                Op::JumpIfTrue(_) => Op::JumpIfTrue(target),
                Op::EnterTry(_) => Op::EnterTry(target),
                other => other,
            };
        }
        Ok(FunctionCode {
            id,
            name: self.name,
            param_count: self.params,
            local_count: self.locals,
            code,
            constants: self.constants,
            sites: self.sites,
            strict: self.strict,
            stack_depths: Vec::new(),
            max_stack: 0,
        })
    }

    fn emit(&mut self, op: Op) -> &mut Self {
        self.code.push(op);
        self
    }

    fn site(&mut self, kind: SiteKind) -> SlotId {
        self.sites.push(kind);
        (self.sites.len() - 1) as SlotId
    }

    /// Offset of the next instruction
    pub fn pc(&self) -> usize {
        self.code.len()
    }

    /// Mark the function strict
    pub fn strict(&mut self) -> &mut Self {
        self.strict = true;
        self
    }

    /// Reserve a local beyond the parameters
    pub fn declare_local(&mut self) -> u16 {
        self.locals += 1;
        self.locals - 1
    }

    pub fn constant(&mut self, value: Value) -> &mut Self {
        let index = match self.constants.iter().position(|c| c.same_value(&value)) {
            Some(i) => i,
            None => {
                self.constants.push(value);
                self.constants.len() - 1
            }
        };
        self.emit(Op::Const(index as u16))
    }

    pub fn number(&mut self, n: f64) -> &mut Self {
        self.constant(Value::Number(n))
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        self.constant(Value::string(s))
    }

    pub fn boolean(&mut self, b: bool) -> &mut Self {
        self.emit(if b { Op::True } else { Op::False })
    }

    pub fn undefined(&mut self) -> &mut Self {
        self.emit(Op::Undefined)
    }

    pub fn null(&mut self) -> &mut Self {
        self.emit(Op::Null)
    }

    pub fn local(&mut self, index: u16) -> &mut Self {
        self.emit(Op::GetLocal(index))
    }

    pub fn set_local(&mut self, index: u16) -> &mut Self {
        self.emit(Op::SetLocal(index))
    }

    pub fn global(&mut self, name: &str) -> &mut Self {
        let atom = self.atoms.intern(name);
        self.emit(Op::GetGlobal(atom))
    }

    pub fn set_global(&mut self, name: &str) -> &mut Self {
        let atom = self.atoms.intern(name);
        self.emit(Op::SetGlobal(atom))
    }

    pub fn this(&mut self) -> &mut Self {
        self.emit(Op::This)
    }

    /// `[obj] -> [obj.name]`
    pub fn get(&mut self, name: &str) -> &mut Self {
        let name = self.atoms.intern(name);
        let slot = self.site(SiteKind::Load);
        self.emit(Op::GetProp { name, slot })
    }

    /// `[obj, value] -> []`
    pub fn set(&mut self, name: &str) -> &mut Self {
        let name = self.atoms.intern(name);
        let slot = self.site(SiteKind::Store);
        self.emit(Op::SetProp { name, slot })
    }

    /// `[obj] -> [deleted]`
    pub fn delete(&mut self, name: &str) -> &mut Self {
        let atom = self.atoms.intern(name);
        self.emit(Op::DeleteProp(atom))
    }

    pub fn new_object(&mut self) -> &mut Self {
        self.emit(Op::NewObject)
    }

    /// `[callee, args..] -> [result]`
    pub fn call(&mut self, argc: u8) -> &mut Self {
        let slot = self.site(SiteKind::Call);
        self.emit(Op::Call { argc, slot })
    }

    /// `[receiver, args..] -> [result]`
    pub fn call_method(&mut self, name: &str, argc: u8) -> &mut Self {
        let name = self.atoms.intern(name);
        let load = self.site(SiteKind::Load);
        let slot = self.site(SiteKind::Call);
        self.emit(Op::CallMethod {
            name,
            argc,
            load,
            slot,
        })
    }

    /// `[constructor, args..] -> [object]`
    pub fn construct(&mut self, argc: u8) -> &mut Self {
        let slot = self.site(SiteKind::Construct);
        self.emit(Op::New { argc, slot })
    }

    pub fn binary(&mut self, op: BinaryOp) -> &mut Self {
        let slot = self.site(SiteKind::Arithmetic);
        self.emit(Op::Binary { op, slot })
    }

    pub fn add(&mut self) -> &mut Self {
        self.binary(BinaryOp::Add)
    }

    pub fn sub(&mut self) -> &mut Self {
        self.binary(BinaryOp::Sub)
    }

    pub fn mul(&mut self) -> &mut Self {
        self.binary(BinaryOp::Mul)
    }

    pub fn div(&mut self) -> &mut Self {
        self.binary(BinaryOp::Div)
    }

    pub fn rem(&mut self) -> &mut Self {
        self.binary(BinaryOp::Mod)
    }

    pub fn lt(&mut self) -> &mut Self {
        self.binary(BinaryOp::Lt)
    }

    pub fn le(&mut self) -> &mut Self {
        self.binary(BinaryOp::Le)
    }

    pub fn gt(&mut self) -> &mut Self {
        self.binary(BinaryOp::Gt)
    }

    pub fn ge(&mut self) -> &mut Self {
        self.binary(BinaryOp::Ge)
    }

    pub fn strict_eq(&mut self) -> &mut Self {
        self.binary(BinaryOp::StrictEq)
    }

    pub fn strict_ne(&mut self) -> &mut Self {
        self.binary(BinaryOp::StrictNe)
    }

    pub fn neg(&mut self) -> &mut Self {
        self.emit(Op::Unary(UnaryOp::Neg))
    }

    pub fn not(&mut self) -> &mut Self {
        self.emit(Op::Unary(UnaryOp::Not))
    }

    pub fn type_of(&mut self) -> &mut Self {
        self.emit(Op::Unary(UnaryOp::TypeOf))
    }

    pub fn pop(&mut self) -> &mut Self {
        self.emit(Op::Pop)
    }

    pub fn dup(&mut self) -> &mut Self {
        self.emit(Op::Dup)
    }

    pub fn swap(&mut self) -> &mut Self {
        self.emit(Op::Swap)
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label((self.labels.len() - 1) as u32)
    }

    /// Bind a label to the next instruction
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0 as usize] = Some(self.code.len() as u32);
        self
    }

    fn jump_op(&mut self, op: Op, label: Label) -> &mut Self {
        self.fixups.push((self.code.len(), label));
        self.emit(op)
    }

    pub fn jump(&mut self, label: Label) -> &mut Self {
        self.jump_op(Op::Jump(u32::MAX), label)
    }

    pub fn jump_if_false(&mut self, label: Label) -> &mut Self {
        self.jump_op(Op::JumpIfFalse(u32::MAX), label)
    }

    pub fn jump_if_true(&mut self, label: Label) -> &mut Self {
        self.jump_op(Op::JumpIfTrue(u32::MAX), label)
    }

    /// Open a try region whose handler starts at `catch`
    pub fn enter_try(&mut self, catch: Label) -> &mut Self {
        self.jump_op(Op::EnterTry(u32::MAX), catch)
    }

    pub fn leave_try(&mut self) -> &mut Self {
        self.emit(Op::LeaveTry)
    }

    pub fn throw(&mut self) -> &mut Self {
        self.emit(Op::Throw)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.emit(Op::Return)
    }

    pub fn ret_undefined(&mut self) -> &mut Self {
        self.emit(Op::Undefined).emit(Op::Return)
    }

    pub fn debugger(&mut self) -> &mut Self {
        self.emit(Op::Debugger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_are_patched() {
        let mut builder = ProgramBuilder::new();
        builder.function("abs", 1, |f| {
            let done = f.new_label();
            f.local(0).number(0.0).lt().jump_if_false(done);
            f.local(0).neg().ret();
            f.bind(done).local(0).ret();
        });
        let program = builder.build().unwrap();
        let abs = program.function(FunctionId(0));
        assert_eq!(abs.code[3], Op::JumpIfFalse(7));
    }

    #[test]
    fn test_unbound_label_is_rejected() {
        let mut builder = ProgramBuilder::new();
        builder.function("bad", 0, |f| {
            let nowhere = f.new_label();
            f.jump(nowhere);
        });
        assert!(matches!(builder.build(), Err(Error::VerifyError { .. })));
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut builder = ProgramBuilder::new();
        builder.function("f", 0, |f| {
            f.ret_undefined();
        });
        builder.function("f", 0, |f| {
            f.ret_undefined();
        });
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_constants_are_deduplicated() {
        let mut builder = ProgramBuilder::new();
        builder.function("k", 0, |f| {
            f.number(2.0).number(2.0).add().string("a").pop().ret();
        });
        let program = builder.build().unwrap();
        assert_eq!(program.function(FunctionId(0)).constants.len(), 2);
    }

    #[test]
    fn test_method_call_allocates_two_sites() {
        let mut builder = ProgramBuilder::new();
        builder.function("m", 1, |f| {
            f.local(0).number(1.0).call_method("sign", 1).ret();
        });
        let program = builder.build().unwrap();
        assert_eq!(
            program.function(FunctionId(0)).sites,
            vec![SiteKind::Load, SiteKind::Call]
        );
    }
}
