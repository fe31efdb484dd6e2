//! Background compile worker
//!
//! One thread drains the request queue. It reads only the immutable program
//! and the shared feedback store, and posts finished units to a completion
//! queue; the executing thread installs them at its next safepoint.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::compiler::compile;
use super::feedback::FeedbackStore;
use super::ic::HeapVersions;
use super::queue::{CompileTicket, WorkQueue};
use super::tier::{Tier, TierController};
use super::unit::CompiledUnit;
use crate::bytecode::{FunctionId, Program};
use crate::config::EngineConfig;

/// A function to compile
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub function: FunctionId,
    pub tier: Tier,
    /// Epoch the request was made in; stale requests are dropped
    pub epoch: u64,
    pub ticket: Arc<CompileTicket>,
    /// Prototype versions at request time
    pub versions: Arc<HeapVersions>,
}

impl CompileRequest {
    /// Queue key; a new epoch never collides with a stale request still queued
    fn key(&self) -> u64 {
        (u64::from(self.function.0) << 32) | (self.epoch & 0xffff_ffff)
    }
}

/// A finished compilation awaiting installation
#[derive(Debug)]
pub struct CompileOutcome {
    pub function: FunctionId,
    pub tier: Tier,
    pub epoch: u64,
    pub result: Result<CompiledUnit, String>,
}

/// Everything a compilation reads, shareable across threads
#[derive(Debug, Clone)]
pub struct CompileContext {
    pub program: Arc<Program>,
    pub feedback: Arc<FeedbackStore>,
    pub tiers: Arc<TierController>,
    pub config: Arc<EngineConfig>,
    pub completions: Arc<WorkQueue<CompileOutcome>>,
}

impl CompileContext {
    /// Compile one request and post the outcome; the ticket is finished last
    pub fn process(&self, request: CompileRequest) {
        let function = request.function;
        let name = &self.program.function(function).name;
        if !self.tiers.begin_compile(function, request.epoch) {
            tracing::debug!(function = %name, "dropped stale compile request");
            request.ticket.finish();
            return;
        }

        let start = Instant::now();
        tracing::debug!(function = %name, tier = %request.tier, "compile start");
        let result = compile(
            &self.program,
            &self.feedback,
            &request.versions,
            &self.config,
            function,
            request.tier,
        )
            .map_err(|e| e.to_string());
        if let Ok(unit) = &result {
            tracing::debug!(
                function = %name,
                tier = %request.tier,
                ops = unit.ops.len(),
                guards = unit.guard_count,
                inlined = unit.inlined.len(),
                elapsed_us = start.elapsed().as_micros() as u64,
                "compile finish"
            );
        }

        let outcome = CompileOutcome {
            function,
            tier: request.tier,
            epoch: request.epoch,
            result,
        };
        if self.completions.send(outcome).is_err() {
            tracing::debug!(function = %name, "completion queue closed");
        }
        request.ticket.finish();
    }
}

/// Handle to the compiler thread; dropping it stops and joins the thread
#[derive(Debug)]
pub struct CompileWorker {
    requests: Arc<WorkQueue<CompileRequest>>,
    handle: Option<JoinHandle<()>>,
}

impl CompileWorker {
    /// Start the compiler thread
    pub fn spawn(context: CompileContext) -> std::io::Result<Self> {
        let requests = Arc::new(WorkQueue::new());
        let queue = Arc::clone(&requests);
        let handle = thread::Builder::new()
            .name("qs-tier-compiler".into())
            .spawn(move || {
                while let Some(request) = queue.recv() {
                    context.process(request);
                }
            })?;
        Ok(Self {
            requests,
            handle: Some(handle),
        })
    }

    /// Hand a request to the thread. Returns false if it could not be queued,
    /// in which case its ticket has already been finished.
    pub fn submit(&self, request: CompileRequest) -> bool {
        let ticket = Arc::clone(&request.ticket);
        match self.requests.send_unique(request.key(), request) {
            Ok(true) => true,
            Ok(false) | Err(_) => {
                ticket.finish();
                false
            }
        }
    }

    /// Requests not yet picked up
    pub fn backlog(&self) -> usize {
        self.requests.len()
    }
}

impl Drop for CompileWorker {
    fn drop(&mut self) {
        self.requests.close();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("compiler thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ProgramBuilder;
    use crate::jit::tier::{RequestOutcome, TierState};

    fn context(config: EngineConfig) -> CompileContext {
        let mut builder = ProgramBuilder::new();
        builder.function("plain", 1, |f| {
            f.local(0).number(1.0).add().ret();
        });
        builder.function("paused", 0, |f| {
            f.debugger().undefined().ret();
        });
        let program = Arc::new(builder.build().unwrap());
        let feedback = Arc::new(FeedbackStore::new(&program, config.ic.polymorphic_limit));
        let tiers = Arc::new(TierController::new(&program, config.tiering.clone()));
        CompileContext {
            program,
            feedback,
            tiers,
            config: Arc::new(config),
            completions: Arc::new(WorkQueue::new()),
        }
    }

    fn request(ctx: &CompileContext, function: FunctionId) -> CompileRequest {
        match ctx.tiers.request(function, Tier::Jit) {
            RequestOutcome::Queued { ticket, epoch } => CompileRequest {
                function,
                tier: Tier::Jit,
                epoch,
                ticket,
                versions: Arc::default(),
            },
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_worker_compiles_and_posts_outcome() {
        let ctx = context(EngineConfig::default());
        let worker = CompileWorker::spawn(ctx.clone()).unwrap();
        let req = request(&ctx, FunctionId(0));
        let ticket = Arc::clone(&req.ticket);
        assert!(worker.submit(req));
        ticket.wait();
        let outcomes = ctx.completions.drain();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].result.is_ok());
        assert_eq!(ctx.tiers.state(FunctionId(0)), TierState::Compiling(Tier::Jit));
    }

    #[test]
    fn test_compile_failure_is_reported() {
        let ctx = context(EngineConfig::default());
        let req = request(&ctx, FunctionId(1));
        ctx.process(req);
        let outcome = ctx.completions.try_recv().unwrap();
        assert!(outcome.result.unwrap_err().contains("DEBUGGER"));
    }

    #[test]
    fn test_stale_request_is_dropped() {
        let ctx = context(EngineConfig::default());
        let req = request(&ctx, FunctionId(0));
        let stale = CompileRequest {
            epoch: req.epoch + 1,
            ..req
        };
        let ticket = Arc::clone(&stale.ticket);
        ctx.process(stale);
        assert!(ticket.is_finished());
        assert!(ctx.completions.is_empty());
    }

    #[test]
    fn test_drop_joins_thread() {
        let ctx = context(EngineConfig::default());
        let worker = CompileWorker::spawn(ctx).unwrap();
        assert_eq!(worker.backlog(), 0);
        drop(worker);
    }
}
