//! Bytecode representation and instruction set
//!
//! Functions compile to a stack-based instruction stream. Every instruction
//! that consults feedback (property access, calls, arithmetic) carries a
//! function-local feedback slot; the feedback store maps `(function, slot)` to
//! a global site.
//!
//! Programs are assembled with [`ProgramBuilder`] and verified before use; the
//! verifier records the operand-stack depth at every instruction, which the
//! optimizing compiler relies on to split a compiled frame's stack back into
//! interpreter frames on deoptimization.

mod builder;
mod verify;

pub use builder::{FunctionBuilder, Label, ProgramBuilder};
pub use verify::verify;

use std::fmt;

use rustc_hash::FxHashMap;

use crate::runtime::intern::{Atom, AtomTable};
use crate::runtime::Value;

/// Index of a function in its program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

impl FunctionId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn{}", self.0)
    }
}

/// Function-local feedback slot
pub type SlotId = u16;

/// What a feedback slot observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteKind {
    /// Property read or method lookup
    Load,
    /// Property write
    Store,
    /// Call target
    Call,
    /// Constructor target
    Construct,
    /// Operand types of an arithmetic or comparison operator
    Arithmetic,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    StrictEq,
    StrictNe,
}

impl BinaryOp {
    /// Whether the result is a number when both operands are numbers
    pub fn is_arithmetic(self) -> bool {
        matches!(self, BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod)
    }

    /// Apply to two numbers
    pub fn apply_numbers(self, a: f64, b: f64) -> Value {
        match self {
            BinaryOp::Add => Value::Number(a + b),
            BinaryOp::Sub => Value::Number(a - b),
            BinaryOp::Mul => Value::Number(a * b),
            BinaryOp::Div => Value::Number(a / b),
            BinaryOp::Mod => Value::Number(a % b),
            BinaryOp::Lt => Value::Boolean(a < b),
            BinaryOp::Le => Value::Boolean(a <= b),
            BinaryOp::Gt => Value::Boolean(a > b),
            BinaryOp::Ge => Value::Boolean(a >= b),
            BinaryOp::StrictEq => Value::Boolean(a == b),
            BinaryOp::StrictNe => Value::Boolean(a != b),
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
    TypeOf,
}

/// Bytecode instruction
///
/// Stack effects are listed as `[inputs] -> [outputs]`, top of stack last.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    /// `[] -> [constant]`
    Const(u16),
    Undefined,
    Null,
    True,
    False,
    /// `[a] -> []`
    Pop,
    /// `[a] -> [a, a]`
    Dup,
    /// `[a, b] -> [b, a]`
    Swap,
    GetLocal(u16),
    /// `[v] -> []`
    SetLocal(u16),
    GetGlobal(Atom),
    /// `[v] -> []`
    SetGlobal(Atom),
    This,
    /// `[obj] -> [value]`
    GetProp { name: Atom, slot: SlotId },
    /// `[obj, value] -> []`
    SetProp { name: Atom, slot: SlotId },
    /// `[obj] -> [bool]`
    DeleteProp(Atom),
    /// `[] -> [obj]`
    NewObject,
    /// `[callee, args..] -> [result]`
    Call { argc: u8, slot: SlotId },
    /// `[receiver, args..] -> [result]`; `load` observes the method lookup
    CallMethod {
        name: Atom,
        argc: u8,
        load: SlotId,
        slot: SlotId,
    },
    /// `[constructor, args..] -> [object]`
    New { argc: u8, slot: SlotId },
    /// `[a, b] -> [a op b]`
    Binary { op: BinaryOp, slot: SlotId },
    /// `[a] -> [op a]`
    Unary(UnaryOp),
    Jump(u32),
    /// `[cond] -> []`
    JumpIfFalse(u32),
    /// `[cond] -> []`
    JumpIfTrue(u32),
    /// Push a handler; on throw the stack is cut back and the exception pushed
    EnterTry(u32),
    LeaveTry,
    /// `[value] -> !`
    Throw,
    /// `[value] -> !`
    Return,
    Debugger,
}

impl Op {
    /// Operands consumed and produced
    pub fn stack_effect(&self) -> (usize, usize) {
        match *self {
            Op::Const(_)
            | Op::Undefined
            | Op::Null
            | Op::True
            | Op::False
            | Op::GetLocal(_)
            | Op::GetGlobal(_)
            | Op::This
            | Op::NewObject => (0, 1),
            Op::Pop | Op::SetLocal(_) | Op::SetGlobal(_) => (1, 0),
            Op::Dup => (1, 2),
            Op::Swap => (2, 2),
            Op::GetProp { .. } | Op::DeleteProp(_) | Op::Unary(_) => (1, 1),
            Op::SetProp { .. } => (2, 0),
            Op::Call { argc, .. } | Op::CallMethod { argc, .. } | Op::New { argc, .. } => {
                (argc as usize + 1, 1)
            }
            Op::Binary { .. } => (2, 1),
            Op::JumpIfFalse(_) | Op::JumpIfTrue(_) | Op::Throw | Op::Return => (1, 0),
            Op::Jump(_) | Op::EnterTry(_) | Op::LeaveTry | Op::Debugger => (0, 0),
        }
    }

    /// Whether control never falls through to the next instruction
    pub fn is_terminator(&self) -> bool {
        matches!(self, Op::Jump(_) | Op::Throw | Op::Return)
    }

    /// Whether this instruction performs a real call
    pub fn is_call(&self) -> bool {
        matches!(self, Op::Call { .. } | Op::CallMethod { .. } | Op::New { .. })
    }

    fn mnemonic(&self) -> &'static str {
        match self {
            Op::Const(_) => "CONST",
            Op::Undefined => "UNDEFINED",
            Op::Null => "NULL",
            Op::True => "TRUE",
            Op::False => "FALSE",
            Op::Pop => "POP",
            Op::Dup => "DUP",
            Op::Swap => "SWAP",
            Op::GetLocal(_) => "GET_LOCAL",
            Op::SetLocal(_) => "SET_LOCAL",
            Op::GetGlobal(_) => "GET_GLOBAL",
            Op::SetGlobal(_) => "SET_GLOBAL",
            Op::This => "THIS",
            Op::GetProp { .. } => "GET_PROP",
            Op::SetProp { .. } => "SET_PROP",
            Op::DeleteProp(_) => "DELETE_PROP",
            Op::NewObject => "NEW_OBJECT",
            Op::Call { .. } => "CALL",
            Op::CallMethod { .. } => "CALL_METHOD",
            Op::New { .. } => "NEW",
            Op::Binary { .. } => "BINARY",
            Op::Unary(_) => "UNARY",
            Op::Jump(_) => "JUMP",
            Op::JumpIfFalse(_) => "JUMP_IF_FALSE",
            Op::JumpIfTrue(_) => "JUMP_IF_TRUE",
            Op::EnterTry(_) => "ENTER_TRY",
            Op::LeaveTry => "LEAVE_TRY",
            Op::Throw => "THROW",
            Op::Return => "RETURN",
            Op::Debugger => "DEBUGGER",
        }
    }
}

/// A verified function body
#[derive(Debug, Clone)]
pub struct FunctionCode {
    pub id: FunctionId,
    pub name: String,
    pub param_count: u16,
    /// Parameters plus declared locals
    pub local_count: u16,
    pub code: Vec<Op>,
    pub constants: Vec<Value>,
    /// Kind of each feedback slot
    pub sites: Vec<SiteKind>,
    pub strict: bool,
    /// Operand stack depth before each instruction; `None` if unreachable
    pub stack_depths: Vec<Option<u16>>,
    pub max_stack: u16,
}

impl FunctionCode {
    /// Estimated compiled size, in instructions
    #[inline]
    pub fn size(&self) -> usize {
        self.code.len()
    }

    /// Whether the body has try/catch regions
    pub fn has_handlers(&self) -> bool {
        self.code.iter().any(|op| matches!(op, Op::EnterTry(_)))
    }

    /// Stack depth before `pc`
    pub fn depth_at(&self, pc: usize) -> Option<u16> {
        self.stack_depths.get(pc).copied().flatten()
    }

    /// Disassemble the function for debugging
    pub fn disassemble(&self, atoms: &AtomTable) -> String {
        let mut output = format!(
            "== {} (params: {}, locals: {}{}) ==\n",
            self.name,
            self.param_count,
            self.local_count,
            if self.strict { ", strict" } else { "" }
        );
        for (offset, op) in self.code.iter().enumerate() {
            let depth = match self.depth_at(offset) {
                Some(d) => format!("{:3}", d),
                None => "  -".to_string(),
            };
            output.push_str(&format!(
                "{:04} [{}] {:16} {}\n",
                offset,
                depth,
                op.mnemonic(),
                self.format_operands(op, atoms)
            ));
        }
        output
    }

    fn format_operands(&self, op: &Op, atoms: &AtomTable) -> String {
        match *op {
            Op::Const(i) => match self.constants.get(i as usize) {
                Some(Value::String(s)) => format!("{} ({:?})", i, s),
                Some(v) => format!("{} ({})", i, v),
                None => format!("{} (?)", i),
            },
            Op::GetLocal(i) | Op::SetLocal(i) => format!("{}", i),
            Op::GetGlobal(name) | Op::SetGlobal(name) | Op::DeleteProp(name) => {
                atoms.resolve(name).to_string()
            }
            Op::GetProp { name, slot } | Op::SetProp { name, slot } => {
                format!("{} @{}", atoms.resolve(name), slot)
            }
            Op::Call { argc, slot } | Op::New { argc, slot } => format!("argc={} @{}", argc, slot),
            Op::CallMethod {
                name,
                argc,
                load,
                slot,
            } => format!("{} argc={} @{}/@{}", atoms.resolve(name), argc, load, slot),
            Op::Binary { op, slot } => format!("{:?} @{}", op, slot),
            Op::Unary(op) => format!("{:?}", op),
            Op::Jump(t) | Op::JumpIfFalse(t) | Op::JumpIfTrue(t) | Op::EnterTry(t) => {
                format!("-> {:04}", t)
            }
            _ => String::new(),
        }
    }
}

/// A set of verified functions sharing one atom table
#[derive(Debug, Clone)]
pub struct Program {
    functions: Vec<FunctionCode>,
    atoms: AtomTable,
    by_name: FxHashMap<String, FunctionId>,
}

impl Program {
    pub(crate) fn new(functions: Vec<FunctionCode>, atoms: AtomTable) -> Self {
        let by_name = functions
            .iter()
            .map(|f| (f.name.clone(), f.id))
            .collect();
        Self {
            functions,
            atoms,
            by_name,
        }
    }

    #[inline]
    pub fn function(&self, id: FunctionId) -> &FunctionCode {
        &self.functions[id.index()]
    }

    pub fn functions(&self) -> &[FunctionCode] {
        &self.functions
    }

    /// Find a function by name
    pub fn lookup(&self, name: &str) -> Option<FunctionId> {
        self.by_name.get(name).copied()
    }

    pub fn atoms(&self) -> &AtomTable {
        &self.atoms
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Disassemble every function
    pub fn disassemble(&self) -> String {
        self.functions
            .iter()
            .map(|f| f.disassemble(&self.atoms))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_effects() {
        assert_eq!(Op::Call { argc: 2, slot: 0 }.stack_effect(), (3, 1));
        assert_eq!(Op::Swap.stack_effect(), (2, 2));
        assert!(Op::Return.is_terminator());
        assert!(!Op::JumpIfFalse(3).is_terminator());
    }

    #[test]
    fn test_disassemble_shows_depths_and_names() {
        let mut builder = ProgramBuilder::new();
        builder.function("getX", 1, |f| {
            f.local(0).get("x").ret();
        });
        let program = builder.build().unwrap();
        let text = program.disassemble();
        assert!(text.contains("== getX (params: 1, locals: 1) =="));
        assert!(text.contains("0001 [  1] GET_PROP         x @0"));
        assert!(text.contains("RETURN"));
    }

    #[test]
    fn test_numeric_binary_ops() {
        assert_eq!(BinaryOp::Mod.apply_numbers(7.0, 4.0), Value::Number(3.0));
        assert_eq!(BinaryOp::Le.apply_numbers(2.0, 2.0), Value::Boolean(true));
        assert_eq!(BinaryOp::StrictNe.apply_numbers(f64::NAN, f64::NAN), Value::Boolean(true));
    }
}
