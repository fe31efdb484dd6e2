//! Optimizing compiler
//!
//! Lowers a function's bytecode, following its inline plan, into the op
//! stream of a [`CompiledUnit`]. The lowered stream keeps the interpreter's
//! operand stack layout at every bytecode boundary, so any guard can hand its
//! frame back to the interpreter without fixups. Speculation comes only from
//! monomorphic feedback:
//!
//! - property loads and stores become shape/primitive guards plus direct slot
//!   access,
//! - arithmetic that only ever saw numbers becomes guarded number arithmetic,
//! - calls the inliner accepted become an identity guard plus either the
//!   spliced callee body or a direct native invocation.
//!
//! Everything else is lowered to the generic op, which goes through the
//! site's inline cache exactly like the interpreter.

use rustc_hash::FxHashMap;

use super::feedback::{FeedbackKey, FeedbackStore, SiteId};
use super::ic::{Handler, HeapVersions, IcKey, ProtoLink};
use super::inliner::{InlineNode, InlinePlan, InlineSite, InlineTarget, Inliner};
use super::tier::Tier;
use super::unit::{
    CompiledUnit, DeoptId, DeoptPoint, FrameIndex, GuardCheck, InlineFrame, InlinedCall, OptOp,
    Origin,
};
use crate::bytecode::{FunctionId, Op, Program, SlotId};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::runtime::{ObjectId, PrimitiveTag};

/// Compile `function` at `tier` from the current feedback. Prototype-chain
/// handlers that `versions` shows as stale are lowered generically.
pub fn compile(
    program: &Program,
    feedback: &FeedbackStore,
    versions: &HeapVersions,
    config: &EngineConfig,
    function: FunctionId,
    tier: Tier,
) -> Result<CompiledUnit> {
    let plan = Inliner::new(program, feedback, versions, &config.inlining).plan(function, tier);
    compile_with_plan(program, feedback, versions, config, plan)
}

/// Compile following an existing inline plan
pub fn compile_with_plan(
    program: &Program,
    feedback: &FeedbackStore,
    versions: &HeapVersions,
    config: &EngineConfig,
    plan: InlinePlan,
) -> Result<CompiledUnit> {
    let root = program.function(plan.root.function);
    if let Some(pc) = root.code.iter().position(|op| matches!(op, Op::Debugger)) {
        return Err(Error::CompileError(format!(
            "{}: unsupported instruction DEBUGGER at {}",
            root.name, pc
        )));
    }

    let mut lowering = Lowering::new(program, feedback, versions);
    lowering.frames.push(InlineFrame {
        function: root.id,
        parent: None,
        call_pc: 0,
        slot_base: 0,
        local_count: root.local_count,
        this_slot: root.local_count,
        stack_base: 0,
        depth: 0,
    });
    lowering.slot_count = root.local_count as u32 + 1;
    lowering.frame_maps.push(vec![0; root.code.len()]);
    lowering.lower_frame(&plan.root, 0)?;
    lowering.patch();

    if lowering.ops.len() > config.tiering.max_unit_size {
        return Err(Error::CompileError(format!(
            "{}: unit of {} ops exceeds limit {}",
            root.name,
            lowering.ops.len(),
            config.tiering.max_unit_size
        )));
    }
    let slot_count = u16::try_from(lowering.slot_count)
        .map_err(|_| Error::CompileError(format!("{}: too many slots", root.name)))?;

    lowering.dependencies.sort_by_key(|d| (d.object.index(), d.version));
    lowering.dependencies.dedup();
    lowering.referenced.sort_by_key(|id| id.index());
    lowering.referenced.dedup();

    Ok(CompiledUnit::new(
        root.id,
        plan.tier,
        lowering.ops,
        lowering.origins,
        lowering.frames,
        lowering.deopt_points,
        slot_count,
        lowering.inlined,
        lowering.dependencies,
        lowering.referenced,
        plan,
    ))
}

struct Lowering<'a> {
    program: &'a Program,
    feedback: &'a FeedbackStore,
    versions: &'a HeapVersions,
    ops: Vec<OptOp>,
    origins: Vec<Origin>,
    frames: Vec<InlineFrame>,
    frame_maps: Vec<Vec<u32>>,
    deopt_points: Vec<DeoptPoint>,
    point_ids: FxHashMap<(FrameIndex, u32), DeoptId>,
    /// `(op index, frame, bytecode target)` awaiting resolution
    jumps: Vec<(usize, FrameIndex, u32)>,
    slot_count: u32,
    inlined: Vec<InlinedCall>,
    dependencies: Vec<ProtoLink>,
    referenced: Vec<ObjectId>,
}

impl<'a> Lowering<'a> {
    fn new(program: &'a Program, feedback: &'a FeedbackStore, versions: &'a HeapVersions) -> Self {
        Self {
            program,
            feedback,
            versions,
            ops: Vec::new(),
            origins: Vec::new(),
            frames: Vec::new(),
            frame_maps: Vec::new(),
            deopt_points: Vec::new(),
            point_ids: FxHashMap::default(),
            jumps: Vec::new(),
            slot_count: 0,
            inlined: Vec::new(),
            dependencies: Vec::new(),
            referenced: Vec::new(),
        }
    }

    fn emit(&mut self, op: OptOp, frame: FrameIndex, pc: usize) -> usize {
        self.ops.push(op);
        self.origins.push(Origin {
            frame,
            pc: pc as u32,
        });
        self.ops.len() - 1
    }

    fn emit_jump(&mut self, op: OptOp, frame: FrameIndex, pc: usize, target: u32) {
        let index = self.emit(op, frame, pc);
        self.jumps.push((index, frame, target));
    }

    fn point(&mut self, frame: FrameIndex, pc: usize) -> DeoptId {
        let key = (frame, pc as u32);
        if let Some(id) = self.point_ids.get(&key) {
            return *id;
        }
        let id = self.deopt_points.len() as DeoptId;
        self.deopt_points.push(DeoptPoint {
            frame,
            pc: pc as u32,
        });
        self.point_ids.insert(key, id);
        id
    }

    fn guard(&mut self, check: GuardCheck, frame: FrameIndex, pc: usize) {
        let deopt = self.point(frame, pc);
        self.emit(OptOp::Guard { check, deopt }, frame, pc);
    }

    fn site(&self, function: FunctionId, slot: SlotId) -> SiteId {
        self.feedback.site(function, slot)
    }

    /// Lower one function body; returns the `InlineReturn` ops to patch
    fn lower_frame(&mut self, node: &InlineNode, frame: FrameIndex) -> Result<Vec<usize>> {
        let program = self.program;
        let code = program.function(node.function);
        let info = self.frames[frame as usize].clone();
        let slot = |local: u16| info.slot_base + local;
        let mut returns = Vec::new();

        for (pc, op) in code.code.iter().enumerate() {
            self.frame_maps[frame as usize][pc] = self.ops.len() as u32;
            let Some(depth) = code.depth_at(pc) else {
                continue;
            };
            match *op {
                Op::Const(index) => {
                    let value = code.constants[index as usize].clone();
                    self.emit(OptOp::Const(value), frame, pc);
                }
                Op::Undefined => {
                    self.emit(OptOp::Undefined, frame, pc);
                }
                Op::Null => {
                    self.emit(OptOp::Null, frame, pc);
                }
                Op::True => {
                    self.emit(OptOp::True, frame, pc);
                }
                Op::False => {
                    self.emit(OptOp::False, frame, pc);
                }
                Op::Pop => {
                    self.emit(OptOp::Pop, frame, pc);
                }
                Op::Dup => {
                    self.emit(OptOp::Dup, frame, pc);
                }
                Op::Swap => {
                    self.emit(OptOp::Swap, frame, pc);
                }
                Op::GetLocal(local) => {
                    self.emit(OptOp::GetSlot(slot(local)), frame, pc);
                }
                Op::SetLocal(local) => {
                    self.emit(OptOp::SetSlot(slot(local)), frame, pc);
                }
                Op::This => {
                    self.emit(OptOp::GetSlot(info.this_slot), frame, pc);
                }
                Op::GetGlobal(name) => {
                    self.emit(OptOp::GetGlobal(name), frame, pc);
                }
                Op::SetGlobal(name) => {
                    self.emit(OptOp::SetGlobal(name), frame, pc);
                }
                Op::GetProp { name, slot } => {
                    let site = self.site(code.id, slot);
                    self.lower_load(name, site, frame, pc);
                }
                Op::SetProp { name, slot } => {
                    let site = self.site(code.id, slot);
                    self.lower_store(name, site, frame, pc);
                }
                Op::DeleteProp(name) => {
                    self.emit(OptOp::DeleteProp(name), frame, pc);
                }
                Op::NewObject => {
                    self.emit(OptOp::NewObject, frame, pc);
                }
                Op::Call { argc, slot } => match node.site(pc as u32) {
                    Some(site) => self.lower_inline(site, argc, false, frame, pc, depth)?,
                    None => {
                        let resume = self.point(frame, pc + 1);
                        let site = self.site(code.id, slot);
                        self.emit(OptOp::Call { argc, site, resume }, frame, pc);
                    }
                },
                Op::CallMethod {
                    name,
                    argc,
                    load,
                    slot,
                } => match node.site(pc as u32) {
                    Some(site) => self.lower_inline(site, argc, true, frame, pc, depth)?,
                    None => {
                        let resume = self.point(frame, pc + 1);
                        let load = self.site(code.id, load);
                        let site = self.site(code.id, slot);
                        self.emit(
                            OptOp::CallMethod {
                                name,
                                argc,
                                load,
                                site,
                                resume,
                            },
                            frame,
                            pc,
                        );
                    }
                },
                Op::New { argc, slot } => {
                    let resume = self.point(frame, pc + 1);
                    let site = self.site(code.id, slot);
                    self.emit(OptOp::New { argc, site, resume }, frame, pc);
                }
                Op::Binary { op, slot } => {
                    let site = self.site(code.id, slot);
                    if self.only_numbers(site) {
                        self.guard(GuardCheck::Number { depth: 1 }, frame, pc);
                        self.guard(GuardCheck::Number { depth: 0 }, frame, pc);
                        self.emit(OptOp::NumberBinary(op), frame, pc);
                    } else {
                        self.emit(OptOp::Binary { op, site }, frame, pc);
                    }
                }
                Op::Unary(op) => {
                    self.emit(OptOp::Unary(op), frame, pc);
                }
                Op::Jump(target) => self.emit_jump(OptOp::Jump(0), frame, pc, target),
                Op::JumpIfFalse(target) => self.emit_jump(OptOp::JumpIfFalse(0), frame, pc, target),
                Op::JumpIfTrue(target) => self.emit_jump(OptOp::JumpIfTrue(0), frame, pc, target),
                Op::EnterTry(target) => self.emit_jump(
                    OptOp::EnterTry {
                        catch: 0,
                        frame,
                        catch_pc: target,
                    },
                    frame,
                    pc,
                    target,
                ),
                Op::LeaveTry => {
                    self.emit(OptOp::LeaveTry, frame, pc);
                }
                Op::Throw => {
                    self.emit(OptOp::Throw, frame, pc);
                }
                Op::Return if frame == 0 => {
                    self.emit(OptOp::Return, frame, pc);
                }
                Op::Return => {
                    returns.push(self.emit(OptOp::InlineReturn { frame, target: 0 }, frame, pc));
                }
                Op::Debugger => {
                    return Err(Error::CompileError(format!(
                        "{}: unsupported instruction DEBUGGER at {}",
                        code.name, pc
                    )));
                }
            }
        }
        Ok(returns)
    }

    fn lower_load(&mut self, name: crate::runtime::intern::Atom, site: SiteId, frame: FrameIndex, pc: usize) {
        let snapshot = self.feedback.snapshot(site);
        let Some(entry) = snapshot.monomorphic().filter(|e| self.versions.is_current(&e.handler)) else {
            self.emit(OptOp::GetProp { name, site }, frame, pc);
            return;
        };
        let receiver = match entry.key {
            IcKey::Shape(shape) => GuardCheck::Shape { depth: 0, shape },
            IcKey::Primitive(tag) => GuardCheck::Primitive { depth: 0, tag },
            IcKey::Callee(_) => {
                self.emit(OptOp::GetProp { name, site }, frame, pc);
                return;
            }
        };
        let is_object = matches!(entry.key, IcKey::Shape(_));
        match &entry.handler {
            Handler::Field { offset } if is_object => {
                self.guard(receiver, frame, pc);
                self.emit(OptOp::LoadField(*offset), frame, pc);
            }
            Handler::ProtoField {
                holder,
                offset,
                chain,
            } => {
                self.guard(receiver, frame, pc);
                self.dependencies.extend(chain.iter().copied());
                self.referenced.push(*holder);
                self.emit(
                    OptOp::LoadHolderField {
                        holder: *holder,
                        offset: *offset,
                    },
                    frame,
                    pc,
                );
            }
            Handler::Missing { chain } => {
                self.guard(receiver, frame, pc);
                self.dependencies.extend(chain.iter().copied());
                self.emit(OptOp::Pop, frame, pc);
                self.emit(OptOp::Undefined, frame, pc);
            }
            Handler::StringLength if entry.key == IcKey::Primitive(PrimitiveTag::String) => {
                self.guard(receiver, frame, pc);
                self.emit(OptOp::StringLength, frame, pc);
            }
            _ => {
                self.emit(OptOp::GetProp { name, site }, frame, pc);
            }
        }
    }

    fn lower_store(&mut self, name: crate::runtime::intern::Atom, site: SiteId, frame: FrameIndex, pc: usize) {
        let snapshot = self.feedback.snapshot(site);
        let entry = snapshot.monomorphic().filter(|e| self.versions.is_current(&e.handler));
        match entry.map(|e| (e.key, &e.handler)) {
            Some((IcKey::Shape(shape), Handler::Field { offset })) => {
                self.guard(GuardCheck::Shape { depth: 1, shape }, frame, pc);
                self.emit(OptOp::StoreField(*offset), frame, pc);
            }
            Some((IcKey::Shape(shape), Handler::Transition { shape: next, chain })) => {
                self.guard(GuardCheck::Shape { depth: 1, shape }, frame, pc);
                self.dependencies.extend(chain.iter().copied());
                self.referenced.extend(next.proto());
                self.emit(
                    OptOp::StoreTransition {
                        shape: next.clone(),
                    },
                    frame,
                    pc,
                );
            }
            _ => {
                self.emit(OptOp::SetProp { name, site }, frame, pc);
            }
        }
    }

    /// Whether an arithmetic site has only ever seen two numbers
    fn only_numbers(&self, site: SiteId) -> bool {
        let histogram = self.feedback.histogram(site);
        !histogram.is_empty()
            && histogram.iter().all(|(key, _)| match key {
                FeedbackKey::Operands(a, b) => a.is_numeric() && b.is_numeric(),
                _ => false,
            })
    }

    fn lower_inline(
        &mut self,
        site: &InlineSite,
        argc: u8,
        method: bool,
        frame: FrameIndex,
        pc: usize,
        depth: u16,
    ) -> Result<()> {
        let check = match &site.method {
            Some(guard) => {
                self.dependencies.extend(guard.chain.iter().copied());
                if let super::unit::MethodSource::Holder { holder, .. } = guard.source {
                    self.referenced.push(holder);
                }
                GuardCheck::Method {
                    depth: argc as u16,
                    receiver: guard.receiver,
                    source: guard.source,
                    expected: site.callee,
                }
            }
            None => GuardCheck::Callee {
                depth: argc as u16,
                expected: site.callee,
            },
        };
        self.guard(check, frame, pc);
        self.referenced.push(site.callee);

        let caller = self.frames[frame as usize].clone();
        let caller_name = self.program.function(caller.function).name.clone();
        match site.target {
            InlineTarget::Native(native) => {
                let resume = self.point(frame, pc + 1);
                self.inlined.push(InlinedCall {
                    caller: caller_name,
                    callee: self.native_name(caller.function, pc),
                    pc: pc as u32,
                    depth: caller.depth + 1,
                    native: true,
                });
                self.emit(
                    OptOp::CallNative {
                        native,
                        argc,
                        method,
                        resume,
                    },
                    frame,
                    pc,
                );
            }
            InlineTarget::Script(callee) => {
                let Some(body) = site.body.as_ref() else {
                    return Err(Error::InternalError("inline site without body plan".into()));
                };
                let code = self.program.function(callee);
                let index = FrameIndex::try_from(self.frames.len())
                    .map_err(|_| Error::CompileError("too many inline frames".into()))?;
                let slot_base = self.slot_count;
                self.slot_count += code.local_count as u32 + 1;
                let narrow = |n: u32| {
                    u16::try_from(n).map_err(|_| Error::CompileError("too many slots".into()))
                };
                self.frames.push(InlineFrame {
                    function: callee,
                    parent: Some(frame),
                    call_pc: pc as u32,
                    slot_base: narrow(slot_base)?,
                    local_count: code.local_count,
                    this_slot: narrow(slot_base + code.local_count as u32)?,
                    stack_base: caller.stack_base + depth - (argc as u16 + 1),
                    depth: caller.depth + 1,
                });
                self.frame_maps.push(vec![0; code.code.len()]);
                self.inlined.push(InlinedCall {
                    caller: caller_name,
                    callee: code.name.clone(),
                    pc: pc as u32,
                    depth: caller.depth + 1,
                    native: false,
                });
                self.emit(
                    OptOp::InlineEnter {
                        frame: index,
                        argc,
                        method,
                    },
                    frame,
                    pc,
                );
                let returns = self.lower_frame(body, index)?;
                let continuation = self.ops.len() as u32;
                for op in returns {
                    if let Some(target) = self.ops[op].target_mut() {
                        *target = continuation;
                    }
                }
            }
        }
        Ok(())
    }

    fn native_name(&self, caller: FunctionId, pc: usize) -> String {
        let program = self.program;
        match program.function(caller).code[pc] {
            Op::CallMethod { name, .. } => program.atoms().resolve(name).to_string(),
            _ => "<native>".to_string(),
        }
    }

    fn patch(&mut self) {
        for &(index, frame, target) in &self.jumps {
            let resolved = self.frame_maps[frame as usize][target as usize];
            if let Some(slot) = self.ops[index].target_mut() {
                *slot = resolved;
            }
        }
    }
}
