//! Compiled unit layout
//!
//! A unit is a flat stream of [`OptOp`]s executed by the VM's compiled-frame
//! loop. Inlined callees get their own [`InlineFrame`]: a window of the
//! unit's slot file for locals and `this`, and a statically known base in the
//! operand stack. Every op maps back to an `(inline frame, bytecode pc)`
//! origin, which is what stack traces and deoptimization read.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::ic::ProtoLink;
use super::inliner::InlinePlan;
use super::tier::Tier;
use crate::bytecode::{BinaryOp, FunctionId, UnaryOp};
use crate::runtime::heap::NativeId;
use crate::runtime::intern::Atom;
use crate::runtime::shape::{Shape, ShapeId};
use crate::runtime::{ObjectId, PrimitiveTag, Value};
use crate::jit::feedback::SiteId;

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique id of a compiled unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct UnitId(pub u64);

impl UnitId {
    pub(crate) fn next() -> Self {
        UnitId(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// Index into [`CompiledUnit::frames`]; frame 0 is the compiled function itself
pub type FrameIndex = u16;

/// Index into [`CompiledUnit::deopt_points`]
pub type DeoptId = u32;

/// A function body spliced into the unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineFrame {
    pub function: FunctionId,
    pub parent: Option<FrameIndex>,
    /// Bytecode pc of the call in the parent frame
    pub call_pc: u32,
    /// First slot of this frame's locals
    pub slot_base: u16,
    pub local_count: u16,
    pub this_slot: u16,
    /// Operand stack index where this frame's stack starts
    pub stack_base: u16,
    /// Nesting depth; 0 for the root frame
    pub depth: u16,
}

/// Bytecode position an optimized op was lowered from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub frame: FrameIndex,
    pub pc: u32,
}

/// Interpreter state to resume at: innermost frame and bytecode pc
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeoptPoint {
    pub frame: FrameIndex,
    pub pc: u32,
}

/// Where a method guard reads the method from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodSource {
    /// Own data slot of the receiver
    Own { offset: u32 },
    /// Data slot of a prototype
    Holder { holder: ObjectId, offset: u32 },
}

/// What the receiver of a guarded method call must look like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverCheck {
    Shape(ShapeId),
    Primitive(PrimitiveTag),
}

/// A speculative assumption checked at run time.
/// `depth` counts operand stack entries from the top (0 = top).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardCheck {
    /// Object with the given shape
    Shape { depth: u16, shape: ShapeId },
    /// Primitive of the given class
    Primitive { depth: u16, tag: PrimitiveTag },
    /// Exactly this callee object
    Callee { depth: u16, expected: ObjectId },
    /// Receiver layout plus the identity of the method it resolves to
    Method {
        depth: u16,
        receiver: ReceiverCheck,
        source: MethodSource,
        expected: ObjectId,
    },
    /// A number
    Number { depth: u16 },
}

/// Optimized operation
#[derive(Debug, Clone)]
pub enum OptOp {
    Const(Value),
    Undefined,
    Null,
    True,
    False,
    Pop,
    Dup,
    Swap,
    /// Read a slot of the unit's slot file
    GetSlot(u16),
    SetSlot(u16),
    GetGlobal(Atom),
    SetGlobal(Atom),
    /// Generic property read through the site's inline cache
    GetProp { name: Atom, site: SiteId },
    SetProp { name: Atom, site: SiteId },
    DeleteProp(Atom),
    NewObject,
    /// Real call; `resume` is the lazy deopt point used when it returns
    Call { argc: u8, site: SiteId, resume: DeoptId },
    CallMethod {
        name: Atom,
        argc: u8,
        load: SiteId,
        site: SiteId,
        resume: DeoptId,
    },
    New { argc: u8, site: SiteId, resume: DeoptId },
    Binary { op: BinaryOp, site: SiteId },
    Unary(UnaryOp),
    Jump(u32),
    JumpIfFalse(u32),
    JumpIfTrue(u32),
    /// Push a handler belonging to inline frame `frame`
    EnterTry { catch: u32, frame: FrameIndex, catch_pc: u32 },
    LeaveTry,
    Throw,
    /// Return from the root frame
    Return,

    /// Check an assumption; on failure deoptimize at `deopt`
    Guard { check: GuardCheck, deopt: DeoptId },
    /// `[obj] -> [value]` from an own slot
    LoadField(u32),
    /// `[receiver] -> [value]` from a prototype slot
    LoadHolderField { holder: ObjectId, offset: u32 },
    /// `[string] -> [length]`
    StringLength,
    /// `[obj, value] -> []` into an existing writable slot
    StoreField(u32),
    /// `[obj, value] -> []` adding a property
    StoreTransition { shape: Arc<Shape> },
    /// Both operands known to be numbers
    NumberBinary(BinaryOp),
    /// Bind arguments into inline frame `frame` and start its body
    InlineEnter { frame: FrameIndex, argc: u8, method: bool },
    /// Leave inline frame `frame` with the value on top, continuing at `target`
    InlineReturn { frame: FrameIndex, target: u32 },
    /// Direct native invocation behind an identity guard
    CallNative {
        native: NativeId,
        argc: u8,
        method: bool,
        resume: DeoptId,
    },
}

impl OptOp {
    /// Whether this op calls out of the unit
    pub fn is_call(&self) -> bool {
        matches!(
            self,
            OptOp::Call { .. } | OptOp::CallMethod { .. } | OptOp::New { .. } | OptOp::CallNative { .. }
        )
    }

    /// Jump target, if the op has one
    pub fn target_mut(&mut self) -> Option<&mut u32> {
        match self {
            OptOp::Jump(t) | OptOp::JumpIfFalse(t) | OptOp::JumpIfTrue(t) => Some(t),
            OptOp::EnterTry { catch, .. } => Some(catch),
            OptOp::InlineReturn { target, .. } => Some(target),
            _ => None,
        }
    }
}

/// A callee spliced into the unit
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct InlinedCall {
    pub caller: String,
    pub callee: String,
    pub pc: u32,
    pub depth: u16,
    pub native: bool,
}

/// One optimized version of a function
#[derive(Debug)]
pub struct CompiledUnit {
    pub id: UnitId,
    pub function: FunctionId,
    pub tier: Tier,
    pub ops: Vec<OptOp>,
    pub origins: Vec<Origin>,
    pub frames: Vec<InlineFrame>,
    pub deopt_points: Vec<DeoptPoint>,
    pub slot_count: u16,
    pub inlined: Vec<InlinedCall>,
    /// Generation snapshots the unit's unguarded reads rely on
    pub dependencies: Vec<ProtoLink>,
    /// Heap objects embedded in the op stream
    pub referenced: Vec<ObjectId>,
    pub guard_count: usize,
    pub plan: InlinePlan,
    valid: AtomicBool,
}

impl CompiledUnit {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        function: FunctionId,
        tier: Tier,
        ops: Vec<OptOp>,
        origins: Vec<Origin>,
        frames: Vec<InlineFrame>,
        deopt_points: Vec<DeoptPoint>,
        slot_count: u16,
        inlined: Vec<InlinedCall>,
        dependencies: Vec<ProtoLink>,
        referenced: Vec<ObjectId>,
        plan: InlinePlan,
    ) -> Self {
        let guard_count = ops.iter().filter(|op| matches!(op, OptOp::Guard { .. })).count();
        Self {
            id: UnitId::next(),
            function,
            tier,
            ops,
            origins,
            frames,
            deopt_points,
            slot_count,
            inlined,
            dependencies,
            referenced,
            guard_count,
            plan,
            valid: AtomicBool::new(true),
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the unit invalid; true only for the call that flipped it
    pub fn invalidate(&self) -> bool {
        self.valid.swap(false, Ordering::AcqRel)
    }

    pub fn root(&self) -> &InlineFrame {
        &self.frames[0]
    }

    /// Inline frames from `frame` out to the root
    pub fn frame_chain(&self, frame: FrameIndex) -> Vec<FrameIndex> {
        let mut chain = vec![frame];
        let mut current = frame;
        while let Some(parent) = self.frames[current as usize].parent {
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// Deepest inline nesting in the unit
    pub fn max_inline_depth(&self) -> u16 {
        self.frames.iter().map(|f| f.depth).max().unwrap_or(0)
    }

    /// Objects that must stay alive while the unit is installed
    pub fn gc_roots(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.referenced
            .iter()
            .copied()
            .chain(self.dependencies.iter().map(|d| d.object))
    }
}
