//! Virtual machine
//!
//! One frame stack holds interpreted and compiled frames side by side.
//! Interpreted frames feed the inline caches and profiles; compiled frames run
//! a unit's optimized operations and fall back to interpreter frames through
//! the deoptimization manager when a guard fails or a dependency changes.
//!
//! Mutations of watched objects are flushed before every instruction, so a
//! unit is invalid by the time any code could observe the change.

mod compiled;
mod frame;
mod interp;
mod property;

pub use property::PropertyDescriptor;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use self::frame::{Frame, FrameCode};
use super::gc::{Collector, GcStats, PendingFinalization};
use super::heap::{Heap, NativeId, ObjectKind, Slot};
use super::intern::{Atom, AtomTable, WellKnown};
use super::shape::{PropertyFlags, ShapeTable};
use super::{ObjectId, Value};
use crate::bytecode::{FunctionId, Program};
use crate::config::EngineConfig;
use crate::error::{messages, Error, ErrorKind, Result, StackFrame, StackTrace};
use crate::jit::deopt::{DeoptEvent, DeoptManager, DeoptReason};
use crate::jit::feedback::FeedbackStore;
use crate::jit::ic::HeapVersions;
use crate::jit::queue::WorkQueue;
use crate::jit::tier::{RequestOutcome, Tier, TierController};
use crate::jit::unit::DeoptId;
use crate::jit::worker::{CompileContext, CompileRequest, CompileWorker};
use crate::jit::ObservedType;

/// Built-in function: `(vm, this, args) -> result`
pub type NativeFn = fn(&mut Vm, &Value, &[Value]) -> Result<Value>;

/// Entry of the native function table
#[derive(Debug, Clone)]
pub struct NativeFunction {
    pub name: String,
    pub func: NativeFn,
    /// Whether `new` may be applied to it
    pub constructor: bool,
}

/// Intrinsic prototypes
#[derive(Debug, Clone, Copy)]
pub struct Realm {
    pub object_proto: ObjectId,
    pub function_proto: ObjectId,
    pub string_proto: ObjectId,
    pub number_proto: ObjectId,
    pub boolean_proto: ObjectId,
    pub error_proto: ObjectId,
    pub type_error_proto: ObjectId,
    pub range_error_proto: ObjectId,
    pub reference_error_proto: ObjectId,
    pub weak_ref_proto: ObjectId,
    pub finalization_registry_proto: ObjectId,
    pub weak_map_proto: ObjectId,
}

impl Realm {
    fn objects(&self) -> [ObjectId; 12] {
        [
            self.object_proto,
            self.function_proto,
            self.string_proto,
            self.number_proto,
            self.boolean_proto,
            self.error_proto,
            self.type_error_proto,
            self.range_error_proto,
            self.reference_error_proto,
            self.weak_ref_proto,
            self.finalization_registry_proto,
            self.weak_map_proto,
        ]
    }

    pub fn error_proto(&self, kind: ErrorKind) -> ObjectId {
        match kind {
            ErrorKind::TypeError => self.type_error_proto,
            ErrorKind::RangeError => self.range_error_proto,
            ErrorKind::ReferenceError => self.reference_error_proto,
            ErrorKind::GenericError => self.error_proto,
        }
    }
}

/// Result of one executed instruction
#[derive(Debug)]
pub(crate) enum Flow {
    Continue,
    Return(Value),
}

/// What a callable object runs
#[derive(Debug, Clone, Copy)]
pub(crate) enum Callee {
    Script(FunctionId),
    Native(NativeId),
}

/// The virtual machine
pub struct Vm {
    program: Arc<Program>,
    config: Arc<EngineConfig>,
    atoms: AtomTable,
    names: WellKnown,
    shapes: ShapeTable,
    heap: Heap,
    collector: Collector,
    realm: Realm,
    globals: FxHashMap<Atom, Value>,
    /// Function object of every program function
    functions: Vec<ObjectId>,
    natives: Vec<NativeFunction>,
    feedback: Arc<FeedbackStore>,
    tiers: Arc<TierController>,
    deopt: DeoptManager,
    compiler: CompileContext,
    worker: Option<CompileWorker>,
    frames: Vec<Frame>,
    /// Logical call depth, inlined frames included
    depth: usize,
    /// Nested native-to-script calls in progress
    native_depth: usize,
    /// Arguments of natives currently executing
    native_roots: Vec<Value>,
    finalizations: VecDeque<PendingFinalization>,
    output: Vec<String>,
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("functions", &self.functions.len())
            .field("natives", &self.natives.len())
            .field("frames", &self.frames.len())
            .field("depth", &self.depth)
            .field("live_objects", &self.heap.live_count())
            .field("background", &self.worker.is_some())
            .finish()
    }
}

impl Vm {
    /// Load a program: allocate intrinsics and one function object per function
    pub fn new(program: Arc<Program>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let feedback = Arc::new(FeedbackStore::new(&program, config.ic.polymorphic_limit));
        let tiers = Arc::new(TierController::new(&program, config.tiering.clone()));
        let compiler = CompileContext {
            program: Arc::clone(&program),
            feedback: Arc::clone(&feedback),
            tiers: Arc::clone(&tiers),
            config: Arc::clone(&config),
            completions: Arc::new(WorkQueue::new()),
        };
        let worker = if config.tiering.background_compilation {
            Some(CompileWorker::spawn(compiler.clone())?)
        } else {
            None
        };

        let atoms = program.atoms().clone();
        let names = atoms.well_known();
        let shapes = ShapeTable::new();
        let mut heap = Heap::new();
        let object_proto = heap.alloc(shapes.root(None), ObjectKind::Ordinary);
        let mut derive = |proto: ObjectId| heap.alloc(shapes.root(Some(proto)), ObjectKind::Ordinary);
        let function_proto = derive(object_proto);
        let string_proto = derive(object_proto);
        let number_proto = derive(object_proto);
        let boolean_proto = derive(object_proto);
        let error_proto = derive(object_proto);
        let type_error_proto = derive(error_proto);
        let range_error_proto = derive(error_proto);
        let reference_error_proto = derive(error_proto);
        let weak_ref_proto = derive(object_proto);
        let finalization_registry_proto = derive(object_proto);
        let weak_map_proto = derive(object_proto);
        let realm = Realm {
            object_proto,
            function_proto,
            string_proto,
            number_proto,
            boolean_proto,
            error_proto,
            type_error_proto,
            range_error_proto,
            reference_error_proto,
            weak_ref_proto,
            finalization_registry_proto,
            weak_map_proto,
        };

        let mut vm = Vm {
            program,
            config,
            atoms,
            names,
            shapes,
            heap,
            collector: Collector::new(),
            realm,
            globals: FxHashMap::default(),
            functions: Vec::new(),
            natives: Vec::new(),
            feedback,
            tiers,
            deopt: DeoptManager::new(),
            compiler,
            worker,
            frames: Vec::new(),
            depth: 0,
            native_depth: 0,
            native_roots: Vec::new(),
            finalizations: VecDeque::new(),
            output: Vec::new(),
        };
        for index in 0..vm.program.len() {
            vm.define_script_function(FunctionId(index as u32));
        }
        super::builtins::install(&mut vm);
        Ok(vm)
    }

    fn define_script_function(&mut self, function: FunctionId) {
        let name = self.program.function(function).name.clone();
        let object = self.alloc(Some(self.realm.function_proto), ObjectKind::Function(function));
        let prototype = self.alloc(Some(self.realm.object_proto), ObjectKind::Ordinary);
        let hidden = PropertyFlags::WRITABLE | PropertyFlags::CONFIGURABLE;
        self.heap.add_property(
            &self.shapes,
            prototype,
            self.names.constructor,
            hidden,
            Slot::Data(Value::Object(object)),
        );
        self.heap.add_property(
            &self.shapes,
            object,
            self.names.prototype,
            PropertyFlags::WRITABLE,
            Slot::Data(Value::Object(prototype)),
        );
        self.heap.add_property(
            &self.shapes,
            object,
            self.names.name,
            PropertyFlags::CONFIGURABLE,
            Slot::Data(Value::string(&name)),
        );
        self.functions.push(object);
        let atom = self.atoms.intern(&name);
        self.globals.insert(atom, Value::Object(object));
    }

    // ---- accessors ----

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn shapes(&self) -> &ShapeTable {
        &self.shapes
    }

    pub fn feedback(&self) -> &FeedbackStore {
        &self.feedback
    }

    pub fn tiers(&self) -> &TierController {
        &self.tiers
    }

    pub fn deopt(&self) -> &DeoptManager {
        &self.deopt
    }

    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    pub fn names(&self) -> &WellKnown {
        &self.names
    }

    pub fn gc_stats(&self) -> &GcStats {
        self.collector.stats()
    }

    pub fn intern(&mut self, name: &str) -> Atom {
        self.atoms.intern(name)
    }

    pub fn resolve(&self, atom: Atom) -> &str {
        self.atoms.resolve(atom)
    }

    /// Logical call depth, inlined frames included
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    pub(crate) fn print_line(&mut self, line: String) {
        tracing::trace!(target: "quicksilver_tier::print", "{}", line);
        self.output.push(line);
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        let atom = self.atoms.get(name)?;
        self.globals.get(&atom).cloned()
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        let atom = self.atoms.intern(name);
        self.globals.insert(atom, value);
    }

    pub fn function_object(&self, function: FunctionId) -> ObjectId {
        self.functions[function.index()]
    }

    /// Script function behind a value, if it is one
    pub fn function_of(&self, value: &Value) -> Option<FunctionId> {
        match self.heap.get(value.as_object()?)?.kind() {
            ObjectKind::Function(function) => Some(*function),
            _ => None,
        }
    }

    pub(crate) fn function_name(&self, function: FunctionId) -> &str {
        &self.program.function(function).name
    }

    pub(crate) fn callee_of(&self, value: &Value) -> Option<Callee> {
        match self.heap.get(value.as_object()?)?.kind() {
            ObjectKind::Function(function) => Some(Callee::Script(*function)),
            ObjectKind::Native(native) => Some(Callee::Native(*native)),
            _ => None,
        }
    }

    pub fn is_callable(&self, value: &Value) -> bool {
        self.callee_of(value).is_some()
    }

    /// Allocate an ordinary-layout object
    pub fn alloc(&mut self, proto: Option<ObjectId>, kind: ObjectKind) -> ObjectId {
        let shape = self.shapes.root(proto);
        self.heap.alloc(shape, kind)
    }

    pub fn new_object(&mut self) -> ObjectId {
        self.alloc(Some(self.realm.object_proto), ObjectKind::Ordinary)
    }

    /// Register a native and allocate its function object
    pub fn register_native(&mut self, name: &str, func: NativeFn, constructor: bool) -> ObjectId {
        let id = NativeId(self.natives.len() as u32);
        self.natives.push(NativeFunction {
            name: name.to_string(),
            func,
            constructor,
        });
        let object = self.alloc(Some(self.realm.function_proto), ObjectKind::Native(id));
        self.heap.add_property(
            &self.shapes,
            object,
            self.names.name,
            PropertyFlags::CONFIGURABLE,
            Slot::Data(Value::string(name)),
        );
        object
    }

    pub fn native(&self, id: NativeId) -> &NativeFunction {
        &self.natives[id.0 as usize]
    }

    /// Add a non-enumerable data property, as built-ins are defined
    pub fn define_hidden(&mut self, object: ObjectId, name: &str, value: Value) {
        let atom = self.atoms.intern(name);
        self.heap.add_property(
            &self.shapes,
            object,
            atom,
            PropertyFlags::WRITABLE | PropertyFlags::CONFIGURABLE,
            Slot::Data(value),
        );
    }

    // ---- calls ----

    /// Call a function value from native code or the embedder
    pub fn call_value(&mut self, callee: &Value, this: Value, args: Vec<Value>) -> Result<Value> {
        match self.callee_of(callee) {
            Some(Callee::Native(native)) => self.invoke_native(native, this, args),
            Some(Callee::Script(function)) => self.reenter(function, this, args, None),
            None => Err(Error::type_error(messages::not_a_function(&self.describe(callee)))),
        }
    }

    /// `new callee(...args)` from native code or the embedder
    pub fn construct_value(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value> {
        match self.callee_of(callee) {
            Some(Callee::Script(function)) => {
                let object = self.construct_receiver(callee)?;
                self.reenter(function, Value::Object(object), args, Some(object))
            }
            Some(Callee::Native(native)) if self.native(native).constructor => {
                self.invoke_native(native, Value::Undefined, args)
            }
            _ => Err(Error::type_error(messages::not_a_constructor(&self.describe(callee)))),
        }
    }

    fn reenter(
        &mut self,
        function: FunctionId,
        this: Value,
        args: Vec<Value>,
        construct: Option<ObjectId>,
    ) -> Result<Value> {
        if self.native_depth >= self.config.runtime.max_native_reentry {
            return Err(Error::stack_overflow());
        }
        let base = self.frames.len();
        self.enter_function(function, this, args, construct)?;
        self.native_depth += 1;
        let result = self.run_until(base);
        self.native_depth -= 1;
        result
    }

    /// Object a script constructor is applied to
    pub(crate) fn construct_receiver(&mut self, callee: &Value) -> Result<ObjectId> {
        let proto = match self.get(callee, self.names.prototype)? {
            Value::Object(proto) => proto,
            _ => self.realm.object_proto,
        };
        Ok(self.alloc(Some(proto), ObjectKind::Ordinary))
    }

    pub(crate) fn invoke_native(&mut self, native: NativeId, this: Value, args: Vec<Value>) -> Result<Value> {
        let func = self.natives[native.0 as usize].func;
        let mark = self.native_roots.len();
        self.native_roots.push(this.clone());
        self.native_roots.extend(args.iter().cloned());
        let result = func(self, &this, &args);
        self.native_roots.truncate(mark);
        result.map_err(|error| {
            if !error.stack_trace().is_some_and(StackTrace::is_empty) {
                return error;
            }
            let mut trace = StackTrace::new();
            trace.push(StackFrame::native(self.natives[native.0 as usize].name.clone()));
            for frame in self.capture_stack_trace().frames {
                trace.push(frame);
            }
            error.with_stack_trace(trace)
        })
    }

    /// Push a frame for `function`, compiled if a valid unit is installed
    pub(crate) fn enter_function(
        &mut self,
        function: FunctionId,
        this: Value,
        args: Vec<Value>,
        construct: Option<ObjectId>,
    ) -> Result<()> {
        self.install_ready_units();
        self.tiers.settle(function);
        let types: Vec<ObservedType> = args.iter().map(ObservedType::of).collect();
        self.feedback.with_profile(function, |p| p.record_call(&types));
        if let Some(tier) = self.tiers.on_call(function) {
            self.request_compile(function, tier);
        }
        if self.depth >= self.config.runtime.max_call_depth {
            return Err(Error::stack_overflow());
        }

        let code = self.program.function(function);
        let params = code.param_count as usize;
        let frame = match self.tiers.unit(function).filter(|u| u.is_valid()) {
            Some(unit) => {
                let root = unit.root().clone();
                let mut slots = vec![Value::Undefined; unit.slot_count as usize];
                for (i, arg) in args.into_iter().take(params).enumerate() {
                    slots[root.slot_base as usize + i] = arg;
                }
                slots[root.this_slot as usize] = this;
                Frame::compiled(unit, slots, construct)
            }
            None => {
                let mut locals = vec![Value::Undefined; code.local_count as usize];
                for (slot, arg) in locals.iter_mut().zip(args.into_iter().take(params)) {
                    *slot = arg;
                }
                Frame::interpreted(function, locals, this, construct)
            }
        };
        self.frames.push(frame);
        self.depth += 1;
        Ok(())
    }

    fn pop_frame(&mut self) -> Option<Frame> {
        let frame = self.frames.pop()?;
        self.depth -= frame.weight();
        Some(frame)
    }

    fn truncate_frames(&mut self, base: usize) {
        while self.frames.len() > base {
            self.pop_frame();
        }
    }

    pub(crate) fn top(&mut self) -> Result<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| Error::InternalError("no active frame".into()))
    }

    /// Run until the frame stack is back to `base` frames
    pub(crate) fn run_until(&mut self, base: usize) -> Result<Value> {
        loop {
            if self.heap.has_mutations() {
                self.flush_mutations();
            }
            let compiled = match self.frames.last() {
                Some(frame) => frame.unit().is_some(),
                None => return Err(Error::InternalError("no active frame".into())),
            };
            let step = if compiled {
                self.step_compiled()
            } else {
                self.step_interpreted()
            };
            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Return(value)) => {
                    let Some(frame) = self.pop_frame() else {
                        return Err(Error::InternalError("no active frame".into()));
                    };
                    let ty = ObservedType::of(&value);
                    self.feedback.with_profile(frame.function, |p| p.record_return(ty));
                    let value = match frame.construct {
                        Some(object) if value.as_object().is_none() => Value::Object(object),
                        _ => value,
                    };
                    if self.frames.len() <= base {
                        return Ok(value);
                    }
                    self.resume_caller(value);
                }
                Err(error) => {
                    let error = self.attach_trace(error);
                    self.unwind(error, base)?;
                }
            }
        }
    }

    /// Hand a call result to the frame that made the call
    pub(crate) fn resume_caller(&mut self, value: Value) {
        if self.heap.has_mutations() {
            self.flush_mutations();
        }
        let Some(frame) = self.frames.last_mut() else {
            return;
        };
        frame.push(value);
        frame.pc += 1;
        let resume = frame.resume.take();
        let stale = frame.unit().is_some_and(|u| !u.is_valid());
        if let (true, Some(point)) = (stale, resume) {
            self.deoptimize_frame(point, DeoptReason::DependencyChanged);
        }
    }

    // ---- exceptions ----

    fn attach_trace(&self, error: Error) -> Error {
        if error.stack_trace().is_some_and(StackTrace::is_empty) {
            error.with_stack_trace(self.capture_stack_trace())
        } else {
            error
        }
    }

    /// Stack trace of the current frames, innermost first.
    /// Compiled frames expand into their inlined callees.
    pub fn capture_stack_trace(&self) -> StackTrace {
        let mut trace = StackTrace::new();
        for frame in self.frames.iter().rev() {
            match &frame.code {
                FrameCode::Interpreted => {
                    trace.push(StackFrame::new(self.function_name(frame.function), frame.pc as u32));
                }
                FrameCode::Compiled(unit) => {
                    let Some(origin) = unit.origins.get(frame.pc) else {
                        continue;
                    };
                    let mut index = origin.frame;
                    let mut pc = origin.pc;
                    loop {
                        let inline = &unit.frames[index as usize];
                        trace.push(StackFrame::new(self.function_name(inline.function), pc));
                        match inline.parent {
                            Some(parent) => {
                                pc = inline.call_pc;
                                index = parent;
                            }
                            None => break,
                        }
                    }
                }
            }
        }
        trace
    }

    /// Find a handler at or above `base`; the error escapes when there is none
    fn unwind(&mut self, error: Error, base: usize) -> Result<()> {
        if !error.is_catchable() {
            self.truncate_frames(base);
            return Err(error);
        }
        loop {
            if self.frames.len() <= base {
                return Err(error);
            }
            if self.frames.last().is_some_and(|f| !f.handlers.is_empty()) {
                break;
            }
            if let Some(frame) = self.pop_frame() {
                self.feedback.with_profile(frame.function, |p| p.threw = true);
            }
        }
        let value = self.catch_value(error);
        self.enter_handler(value);
        Ok(())
    }

    fn enter_handler(&mut self, value: Value) {
        let Some(frame) = self.frames.last_mut() else {
            return;
        };
        let Some(handler) = frame.handlers.pop() else {
            return;
        };
        frame.stack.truncate(handler.stack_depth);
        frame.stack.push(value);
        frame.pc = handler.target;
        let mut unwound = 0;
        if let FrameCode::Compiled(unit) = &frame.code {
            let from = unit.frames[frame.inline as usize].depth as usize;
            let to = unit.frames[handler.frame as usize].depth as usize;
            unwound = from - to;
            frame.inline = handler.frame;
        }
        self.depth -= unwound;
    }

    /// Script-visible value of a caught error
    fn catch_value(&mut self, error: Error) -> Value {
        match error {
            Error::Exception { value, .. } => value,
            Error::RuntimeError {
                kind,
                message,
                stack_trace,
            } => Value::Object(self.make_error(kind, &message, &stack_trace)),
            other => Value::string(other.to_string()),
        }
    }

    /// Allocate an error object with `message` and a rendered `stack`
    pub fn make_error(&mut self, kind: ErrorKind, message: &str, trace: &StackTrace) -> ObjectId {
        let object = self.alloc(Some(self.realm.error_proto(kind)), ObjectKind::Error);
        let header = if message.is_empty() {
            kind.name().to_string()
        } else {
            format!("{}: {}", kind.name(), message)
        };
        let hidden = PropertyFlags::WRITABLE | PropertyFlags::CONFIGURABLE;
        self.heap.add_property(
            &self.shapes,
            object,
            self.names.message,
            hidden,
            Slot::Data(Value::string(message)),
        );
        self.heap.add_property(
            &self.shapes,
            object,
            self.names.stack,
            hidden,
            Slot::Data(Value::string(trace.render(&header))),
        );
        object
    }

    /// Error for a value thrown by script code
    pub(crate) fn exception(&self, value: Value) -> Error {
        let message = self.display(&value);
        Error::Exception {
            value,
            message,
            stack_trace: StackTrace::new(),
        }
    }

    // ---- tiering ----

    /// Ask for `function` to be compiled; false if the request was refused
    pub fn request_compile(&mut self, function: FunctionId, tier: Tier) -> bool {
        match self.tiers.request(function, tier) {
            RequestOutcome::Queued { ticket, epoch } => {
                let versions = HeapVersions::capture(self.feedback.referenced_objects(), &self.heap);
                let request = CompileRequest {
                    function,
                    tier,
                    epoch,
                    ticket,
                    versions: Arc::new(versions),
                };
                match &self.worker {
                    Some(worker) => {
                        if !worker.submit(request) {
                            self.tiers.discard(function, epoch);
                            return false;
                        }
                    }
                    None => {
                        self.compiler.process(request);
                        self.install_ready_units();
                    }
                }
                true
            }
            RequestOutcome::Pending(_) | RequestOutcome::AlreadyCompiled => true,
            RequestOutcome::Pinned => false,
        }
    }

    /// Block until an in-flight compile of `function` finishes; true if it is now compiled
    pub fn wait_for_compile(&mut self, function: FunctionId) -> bool {
        // a unit that went stale while compiling is requeued by the install
        while let Some(ticket) = self.tiers.pending_ticket(function) {
            ticket.wait();
            self.install_ready_units();
            if self
                .tiers
                .pending_ticket(function)
                .is_some_and(|next| Arc::ptr_eq(&next, &ticket))
            {
                break;
            }
        }
        self.install_ready_units();
        self.tiers.state(function).is_compiled()
    }

    /// Install every finished compilation whose assumptions still hold. A
    /// unit invalidated by mutations made while it compiled is recompiled
    /// against fresh versions.
    pub(crate) fn install_ready_units(&mut self) {
        let mut retry = Vec::new();
        for outcome in self.compiler.completions.drain() {
            let function = outcome.function;
            match outcome.result {
                Err(reason) => {
                    tracing::warn!(function = %self.function_name(function), %reason, "compile failed");
                    self.tiers.fail(function, outcome.epoch, reason);
                }
                Ok(unit) => {
                    if !DeoptManager::is_current(&unit, &self.heap) {
                        tracing::debug!(function = %self.function_name(function), "discarded stale unit");
                        if self.tiers.epoch(function) == outcome.epoch && self.tiers.state(function).is_pending() {
                            retry.push((function, outcome.tier));
                        }
                        self.tiers.discard(function, outcome.epoch);
                        continue;
                    }
                    let unit = Arc::new(unit);
                    if self.tiers.install(function, outcome.epoch, Arc::clone(&unit)) {
                        self.deopt.register(&unit, &mut self.heap);
                        tracing::debug!(
                            function = %self.function_name(function),
                            tier = %outcome.tier,
                            unit = %unit.id,
                            "installed"
                        );
                    }
                }
            }
        }
        for (function, tier) in retry {
            self.request_compile(function, tier);
        }
    }

    /// Invalidate units depending on objects mutated since the last flush
    pub(crate) fn flush_mutations(&mut self) {
        for object in self.heap.take_mutated() {
            for unit in self.deopt.invalidate_dependents(object) {
                self.tiers.deoptimize(unit.function, unit.id);
                let name = self.function_name(unit.function).to_string();
                self.deopt.record(DeoptEvent {
                    function_id: unit.function,
                    function: name,
                    unit: unit.id,
                    reason: DeoptReason::DependencyChanged,
                    resumed_at: None,
                    lazy: true,
                });
            }
        }
    }

    /// Replace the compiled frame on top with interpreter frames at `point`
    pub(crate) fn deoptimize_frame(&mut self, point: DeoptId, reason: DeoptReason) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        let Some(unit) = frame.unit().cloned() else {
            self.frames.push(frame);
            return;
        };
        let weight = frame.weight();
        let point = unit.deopt_points[point as usize];
        let eager = unit.invalidate();
        if eager {
            self.tiers.deoptimize(unit.function, unit.id);
        }
        let reason = if eager { reason } else { DeoptReason::DependencyChanged };

        let Frame {
            slots,
            stack,
            handlers,
            construct,
            ..
        } = frame;
        let states = DeoptManager::reconstruct(&unit, point, &slots, stack, &handlers);
        let resumed_at = states
            .last()
            .map(|s| (self.function_name(s.function).to_string(), s.pc as u32));
        self.deopt.record(DeoptEvent {
            function_id: unit.function,
            function: self.function_name(unit.function).to_string(),
            unit: unit.id,
            reason,
            resumed_at,
            lazy: !eager,
        });

        self.depth = self.depth - weight + states.len();
        for (i, state) in states.into_iter().enumerate() {
            let mut restored = Frame::restored(state);
            if i == 0 {
                restored.construct = construct;
            }
            self.frames.push(restored);
        }
    }

    // ---- garbage collection ----

    /// Full collection from every root the VM holds
    pub fn collect_garbage(&mut self) {
        let mut roots: Vec<Value> = self.globals.values().cloned().collect();
        roots.extend(self.functions.iter().map(|&id| Value::Object(id)));
        roots.extend(self.realm.objects().into_iter().map(Value::Object));
        for frame in &self.frames {
            roots.extend(frame.roots().cloned());
            if let Some(unit) = frame.unit() {
                roots.extend(unit.gc_roots().map(Value::Object));
            }
        }
        roots.extend(self.native_roots.iter().cloned());
        roots.extend(self.feedback.referenced_objects().into_iter().map(Value::Object));
        for unit in self.tiers.installed_units() {
            roots.extend(unit.gc_roots().map(Value::Object));
        }
        for pending in &self.finalizations {
            roots.push(Value::Object(pending.callback));
            roots.push(pending.held.clone());
        }

        let pending = self.collector.collect(&mut self.heap, roots);
        self.finalizations.extend(pending);
        self.deopt.prune();
        let shapes_pruned = self.shapes.prune();
        let stats = self.collector.stats();
        tracing::debug!(
            live = stats.live_objects,
            freed = stats.last_freed,
            shapes_pruned,
            pending_finalizers = self.finalizations.len(),
            "gc"
        );
    }

    /// Collect if enough has been allocated since the last collection
    pub fn maybe_collect(&mut self) {
        if self.config.gc.auto_collect && self.heap.allocations_since_gc() >= self.config.gc.allocation_threshold {
            self.collect_garbage();
        }
    }

    /// Run queued finalization callbacks; only called between top-level calls
    pub fn run_finalizers(&mut self) {
        while let Some(job) = self.finalizations.pop_front() {
            let callback = Value::Object(job.callback);
            if let Err(error) = self.call_value(&callback, Value::Undefined, vec![job.held]) {
                tracing::warn!(%error, "finalization callback threw");
            }
        }
    }

    /// Top-level call: run, then collect and finalize at the boundary
    pub fn call_top_level(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value> {
        let result = self.call_value(callee, Value::Undefined, args);
        self.truncate_frames(0);
        self.maybe_collect();
        self.run_finalizers();
        self.install_ready_units();
        result
    }

    // ---- value helpers ----

    /// `typeof`, with callables reported as functions
    pub fn type_of(&self, value: &Value) -> &'static str {
        if self.is_callable(value) {
            "function"
        } else {
            value.type_of()
        }
    }

    /// Short description for error messages
    pub(crate) fn describe(&self, value: &Value) -> String {
        match value {
            Value::String(s) => format!("\"{}\"", s),
            Value::Object(_) => self.display(value),
            other => other.to_js_string(),
        }
    }

    /// String conversion used by `print` and string concatenation
    pub fn display(&self, value: &Value) -> String {
        let Value::Object(id) = value else {
            return value.to_js_string();
        };
        let Some(object) = self.heap.get(*id) else {
            return value.to_js_string();
        };
        match object.kind() {
            ObjectKind::Function(function) => format!("function {}() {{ [bytecode] }}", self.function_name(*function)),
            ObjectKind::Native(native) => format!("function {}() {{ [native code] }}", self.native(*native).name),
            ObjectKind::Error => self.error_summary(*id),
            _ => "[object Object]".to_string(),
        }
    }

    /// `Name: message` of an error object
    pub(crate) fn error_summary(&self, id: ObjectId) -> String {
        let name = self
            .lookup_data(id, self.names.name)
            .map_or_else(|| "Error".to_string(), |v| v.to_js_string());
        let message = self
            .lookup_data(id, self.names.message)
            .map(|v| v.to_js_string())
            .unwrap_or_default();
        if message.is_empty() {
            name
        } else {
            format!("{}: {}", name, message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ProgramBuilder;

    fn vm(build: impl FnOnce(&mut ProgramBuilder)) -> Vm {
        let mut builder = ProgramBuilder::new();
        build(&mut builder);
        let program = Arc::new(builder.build().unwrap());
        Vm::new(program, EngineConfig::default().with_synchronous_compilation()).unwrap()
    }

    fn call(vm: &mut Vm, name: &str, args: Vec<Value>) -> Result<Value> {
        let callee = vm.global(name).unwrap();
        vm.call_top_level(&callee, args)
    }

    #[test]
    fn test_string_order_follows_utf16_units() {
        let mut vm = vm(|b| {
            b.function("lt", 2, |f| {
                f.local(0).local(1).lt().ret();
            });
        });
        // U+10000 starts with the surrogate 0xD800, below 0xFFFF
        let astral = Value::string("\u{10000}");
        let bmp = Value::string("\u{FFFF}");
        assert_eq!(call(&mut vm, "lt", vec![astral.clone(), bmp.clone()]).unwrap(), Value::Boolean(true));
        assert_eq!(call(&mut vm, "lt", vec![bmp, astral]).unwrap(), Value::Boolean(false));
        let (a, b) = (Value::string("a"), Value::string("b"));
        assert_eq!(call(&mut vm, "lt", vec![a, b]).unwrap(), Value::Boolean(true));
    }

    #[test]
    fn test_functions_are_globals() {
        let vm = vm(|b| {
            b.function("f", 0, |f| {
                f.undefined().ret();
            });
        });
        let f = vm.global("f").unwrap();
        assert_eq!(vm.function_of(&f), Some(FunctionId(0)));
        assert_eq!(vm.type_of(&f), "function");
    }

    #[test]
    fn test_construct_substitutes_receiver() {
        let mut vm = vm(|b| {
            b.function("Point", 1, |f| {
                f.this().local(0).set("x").number(5.0).ret();
            });
            b.function("make", 0, |f| {
                f.global("Point").number(3.0).construct(1).get("x").ret();
            });
        });
        assert_eq!(call(&mut vm, "make", vec![]).unwrap(), Value::Number(3.0));
    }

    #[test]
    fn test_uncaught_error_has_trace() {
        let mut vm = vm(|b| {
            b.function("inner", 0, |f| {
                f.undefined().get("x").ret();
            });
            b.function("outer", 0, |f| {
                f.global("inner").call(0).ret();
            });
        });
        let error = call(&mut vm, "outer", vec![]).unwrap_err();
        let trace = error.stack_trace().unwrap();
        let names: Vec<_> = trace.frames.iter().map(|f| f.function_name.as_str()).collect();
        assert_eq!(names, ["inner", "outer"]);
        assert_eq!(vm.depth(), 0);
    }

    #[test]
    fn test_stack_overflow_is_range_error() {
        let mut vm = vm(|b| {
            b.function("down", 0, |f| {
                f.global("down").call(0).ret();
            });
        });
        let error = call(&mut vm, "down", vec![]).unwrap_err();
        assert!(error.to_string().starts_with("RangeError: Maximum call stack size exceeded"));
        assert_eq!(vm.depth(), 0);
    }
}
