//! Dispatcher: the run loop
//!
//! [`ResourceScheduler`] is the environment's entry point. It registers
//! resources and deployments, spawns threads of every kind and drives the
//! simulation: each pass delivers arrived messages, wakes due threads, lets
//! every CPU run its best runnable thread for one scheduling step, and only
//! when nothing could run advances the clock to the next pending event.

use crate::config::{BusConfig, CpuConfig, SchedulerConfig};
use crate::context::{SchedulerContext, Shared};
use crate::cx::{AsyncHandle, ThreadCx};
use crate::error::{RunError, RunResult, SchedulerError, SchedulerResult};
use crate::message::ReplyTo;
use crate::operation::Operation;
use crate::periodic::PeriodicSpec;
use crate::resource::VCPU;
use crate::thread::{Signal, ThreadInfo};
use crate::trace::TraceLog;
use crate::transaction::CellKey;
use crate::verdict::{TestResult, TestStep, Verdict};
use crate::work::{self, Entry};
use futures::future::BoxFuture;
use futures::task::noop_waker_ref;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, info};
use vdm_metrics::Metrics;
use vdm_primitives::{ObjectId, Priority, ResourceId, ThreadId, Time, Value};

/// Snapshot taken when a deadlock is declared
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadlockReport {
    /// Clock at detection
    pub time: Time,
    /// Threads that could not progress
    pub blocked: Vec<ThreadInfo>,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The entry point returned, or the system went quiet
    Completed(Value),
    /// A thread recorded a fatal error
    Failed {
        /// Thread that failed first
        thread: ThreadId,
        /// Its error, unwrapped to the original cause
        error: RunError,
    },
    /// No thread could progress
    Deadlocked(DeadlockReport),
    /// The time limit was reached
    Stopped {
        /// Clock when the run stopped
        at: Time,
    },
}

impl RunOutcome {
    /// Result value of a completed run
    pub fn value(&self) -> Option<&Value> {
        match self {
            RunOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// Whether the run completed normally
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }
}

type Body = BoxFuture<'static, RunResult<Value>>;

/// Deterministic scheduler of simulated threads over virtual CPUs and buses
pub struct ResourceScheduler {
    ctx: Shared,
    bodies: BTreeMap<ThreadId, Body>,
}

impl ResourceScheduler {
    /// Create a scheduler with a virtual CPU and a virtual bus
    pub fn new(config: SchedulerConfig) -> SchedulerResult<Self> {
        Ok(Self {
            ctx: Arc::new(Mutex::new(SchedulerContext::new(config)?)),
            bodies: BTreeMap::new(),
        })
    }

    /// Active configuration
    pub fn config(&self) -> SchedulerConfig {
        self.ctx.lock().config.clone()
    }

    // ==================== Topology ====================

    /// Declare a CPU
    pub fn add_cpu(&self, config: CpuConfig) -> SchedulerResult<ResourceId> {
        self.ctx.lock().add_cpu(config)
    }

    /// Declare a bus between CPUs
    pub fn add_bus(&self, config: BusConfig) -> SchedulerResult<ResourceId> {
        self.ctx.lock().add_bus(config)
    }

    /// Find a CPU by name
    pub fn cpu_named(&self, name: &str) -> Option<ResourceId> {
        self.ctx
            .lock()
            .cpus
            .values()
            .find(|cpu| cpu.name() == name)
            .map(|cpu| cpu.id())
    }

    /// Deploy a named object on a CPU
    pub fn deploy(&self, name: &str, cpu: ResourceId) -> SchedulerResult<ObjectId> {
        self.ctx.lock().deploy(name, cpu)
    }

    /// Find a deployed object by name
    pub fn object_named(&self, name: &str) -> Option<ObjectId> {
        self.ctx.lock().object_named(name)
    }

    /// Override the priority of an operation on one CPU
    pub fn set_priority(&self, cpu: ResourceId, operation: &str, priority: Priority) -> SchedulerResult<()> {
        self.ctx.lock().set_priority(cpu, operation, priority)
    }

    /// Give an instance variable its initial value
    pub fn define_field(&self, object: ObjectId, field: &str, value: Value) -> SchedulerResult<()> {
        let mut ctx = self.ctx.lock();
        ctx.object_cpu(object)?;
        ctx.store.define(CellKey::new(object, field), value);
        Ok(())
    }

    /// Committed value of an instance variable
    pub fn read_committed(&self, object: ObjectId, field: &str) -> Value {
        self.ctx.lock().store.committed(&CellKey::new(object, field))
    }

    // ==================== Spawning ====================

    /// Run an operation as the main thread until it returns or the run ends
    pub fn spawn_main(&mut self, operation: Arc<dyn Operation>, args: Vec<Value>) -> SchedulerResult<RunOutcome> {
        self.ensure_running()?;
        let thread = self.ctx.lock().spawn_main(Entry::Invoke {
            operation,
            args,
            target: None,
        });
        self.run_loop(Some(thread), None)
    }

    /// Call an operation of a deployed object and run until it replies
    pub fn spawn_sync(
        &mut self,
        target: ObjectId,
        operation: Arc<dyn Operation>,
        args: Vec<Value>,
    ) -> SchedulerResult<RunOutcome> {
        self.ensure_running()?;
        let thread = {
            let mut ctx = self.ctx.lock();
            ctx.object_cpu(target)?;
            ctx.spawn_main(Entry::Call {
                target,
                operation,
                args,
            })
        };
        self.run_loop(Some(thread), None)
    }

    /// Send an asynchronous call from the environment. Nothing runs until the
    /// next `run*` call.
    pub fn spawn_async(
        &mut self,
        target: ObjectId,
        operation: Arc<dyn Operation>,
        args: Vec<Value>,
        expects_reply: bool,
    ) -> SchedulerResult<AsyncHandle> {
        self.ensure_running()?;
        let mut ctx = self.ctx.lock();
        let target_cpu = ctx.object_cpu(target)?;
        ctx.route_between(VCPU, target_cpu)?;
        let reply = if expects_reply {
            ReplyTo::Mailbox
        } else {
            ReplyTo::None
        };
        let message = ctx
            .send_request(None, target, operation, args, reply, 1)
            .map_err(SchedulerError::CallRejected)?;
        Ok(AsyncHandle { message, target })
    }

    /// Register a periodic or sporadic activation chain on `target`. Nothing
    /// runs until the next `run*` call.
    pub fn spawn_periodic(
        &mut self,
        target: ObjectId,
        operation: Arc<dyn Operation>,
        args: Vec<Value>,
        spec: PeriodicSpec,
    ) -> SchedulerResult<ThreadId> {
        self.ensure_running()?;
        self.ctx.lock().start_periodic(target, operation, args, spec)
    }

    /// Run a call sequence on a test runner thread and classify the outcome
    pub fn run_test(&mut self, steps: Vec<TestStep>) -> SchedulerResult<TestResult> {
        self.ensure_running()?;
        let thread = self.ctx.lock().spawn_test(steps);
        let outcome = self.run_loop(Some(thread), None)?;

        let mut ctx = self.ctx.lock();
        let mut result = ctx
            .test_results
            .remove(&thread)
            .unwrap_or_else(TestResult::pending);
        if let RunOutcome::Stopped { .. } = outcome {
            result.verdict = Verdict::Inconclusive;
        }
        info!(thread = %thread, verdict = %result.verdict, steps = result.steps.len(), "test finished");
        Ok(result)
    }

    /// Take the reply of an asynchronous call, if it has arrived
    pub fn take_reply(&self, handle: AsyncHandle) -> Option<RunResult<Value>> {
        self.ctx.lock().mailbox.remove(&handle.message)
    }

    // ==================== Run control ====================

    /// Run until no thread and no message is left
    pub fn run(&mut self) -> SchedulerResult<RunOutcome> {
        self.run_loop(None, None)
    }

    /// Run until quiescence, but stop before the clock would pass `t`
    pub fn run_until(&mut self, t: Time) -> SchedulerResult<RunOutcome> {
        self.run_loop(None, Some(t))
    }

    /// Forget every thread, message and value of previous runs
    pub fn reset(&mut self) {
        self.bodies.clear();
        self.ctx.lock().reset();
    }

    // ==================== Diagnostics ====================

    /// Current virtual time
    pub fn current_time(&self) -> Time {
        self.ctx.lock().now()
    }

    /// Whether the last run ended in a deadlock
    pub fn is_deadlocked(&self) -> bool {
        self.ctx.lock().signal == Some(Signal::Deadlocked)
    }

    /// First fatal error recorded, with the thread that raised it
    pub fn error(&self) -> Option<(ThreadId, RunError)> {
        self.ctx.lock().error.clone()
    }

    /// Report of the last deadlock
    pub fn deadlock_report(&self) -> Option<DeadlockReport> {
        self.ctx.lock().deadlock.clone()
    }

    /// Live threads
    pub fn threads(&self) -> Vec<ThreadInfo> {
        self.ctx.lock().threads.values().map(|t| t.info()).collect()
    }

    /// Copy of the execution-event log
    pub fn trace(&self) -> TraceLog {
        self.ctx.lock().trace.clone()
    }

    /// Shared metrics store
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.ctx.lock().metrics)
    }

    // ==================== Loop ====================

    fn ensure_running(&self) -> SchedulerResult<()> {
        match self.ctx.lock().signal {
            Some(signal) => Err(SchedulerError::Halted(signal)),
            None => Ok(()),
        }
    }

    fn run_loop(&mut self, focus: Option<ThreadId>, until: Option<Time>) -> SchedulerResult<RunOutcome> {
        self.ensure_running()?;
        let limit = match (until, self.ctx.lock().config.time_limit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        info!(focus = ?focus, limit = ?limit, time = self.current_time(), "run started");

        let outcome = loop {
            if let Some(outcome) = self.check_stop(focus)? {
                break outcome;
            }
            if self.pass()? {
                continue;
            }

            let mut ctx = self.ctx.lock();
            let now = ctx.now();
            match ctx.next_event_time().filter(|t| *t > now) {
                Some(t) if limit.is_some_and(|limit| t > limit) => {
                    break RunOutcome::Stopped { at: now };
                }
                Some(t) => ctx.advance_to(t)?,
                None if ctx.threads.is_empty() && focus.is_none() => {
                    break RunOutcome::Completed(Value::Void);
                }
                None => {
                    let report = ctx.declare_deadlock();
                    drop(ctx);
                    self.halt(Signal::Deadlocked)?;
                    break RunOutcome::Deadlocked(report);
                }
            }
        };

        info!(time = self.current_time(), outcome = outcome_label(&outcome), "run finished");
        Ok(outcome)
    }

    /// Decide whether the run is over: an error was recorded or the focus
    /// thread has finished
    fn check_stop(&mut self, focus: Option<ThreadId>) -> SchedulerResult<Option<RunOutcome>> {
        let failed = self.ctx.lock().error.clone();
        if let Some((thread, error)) = failed {
            self.halt(Signal::Suspend)?;
            return Ok(Some(RunOutcome::Failed { thread, error }));
        }

        let Some(focus) = focus else {
            return Ok(None);
        };
        if self.ctx.lock().threads.contains_key(&focus) {
            return Ok(None);
        }
        self.shutdown()?;
        let value = self
            .ctx
            .lock()
            .results
            .remove(&focus)
            .unwrap_or(Value::Void);
        Ok(Some(RunOutcome::Completed(value)))
    }

    /// One scheduling pass. Returns whether anything happened.
    fn pass(&mut self) -> SchedulerResult<bool> {
        let delivered = self.ctx.lock().deliver_due()?;
        self.adopt()?;

        let selected = {
            let mut ctx = self.ctx.lock();
            ctx.wake_due()?;
            ctx.evaluate_guards()?;
            ctx.select_all()
        };
        for thread in &selected {
            if self.ctx.lock().signal.is_some() {
                break;
            }
            self.step(*thread)?;
        }
        Ok(delivered > 0 || !selected.is_empty())
    }

    /// Build the bodies of newly registered threads and make them runnable
    fn adopt(&mut self) -> SchedulerResult<()> {
        let pending = std::mem::take(&mut self.ctx.lock().unstarted);
        for (thread, work) in pending {
            let (resource, depth, object) = {
                let ctx = self.ctx.lock();
                let state = ctx
                    .threads
                    .get(&thread)
                    .ok_or(SchedulerError::UnknownThread(thread))?;
                (state.resource, state.depth, state.object)
            };
            let cx = ThreadCx::new(Arc::clone(&self.ctx), thread, resource, depth, object);
            // the lock is free here: building a body may already touch the context
            let body = work::drive(cx, work);
            self.bodies.insert(thread, body);
            self.ctx.lock().make_runnable(thread, None)?;
        }
        Ok(())
    }

    /// Run one thread until it suspends or returns
    fn step(&mut self, thread: ThreadId) -> SchedulerResult<()> {
        self.ctx.lock().begin_step(thread)?;
        let body = self
            .bodies
            .get_mut(&thread)
            .ok_or(SchedulerError::UnknownThread(thread))?;
        debug!(thread = %thread, time = self.ctx.lock().now(), "step");

        match poll_body(body) {
            Poll::Pending => {
                let parked = self.ctx.lock().end_step(thread)?;
                if parked.is_none() {
                    self.bodies.remove(&thread);
                    let err = RunError::internal("thread yielded outside a suspension point");
                    self.ctx.lock().finish(thread, Err(err))?;
                }
            }
            Poll::Ready(result) => {
                self.bodies.remove(&thread);
                self.ctx.lock().finish(thread, result)?;
            }
        }
        Ok(())
    }

    /// Broadcast a signal: every started thread observes it at its
    /// suspension point, then all threads and messages are dropped
    fn halt(&mut self, signal: Signal) -> SchedulerResult<()> {
        let live: Vec<ThreadId> = self.ctx.lock().threads.keys().copied().collect();
        debug!(signal = ?signal, threads = live.len(), "halting");
        for thread in live {
            let started = self.ctx.lock().prepare_cancel(thread, signal)?;
            if let Some(mut body) = self.bodies.remove(&thread) {
                if started {
                    let _ = poll_body(&mut body);
                }
            }
            self.ctx.lock().cancel(thread, Some(signal))?;
        }
        self.discard_pending();
        Ok(())
    }

    /// Drop every remaining thread without running it again
    fn shutdown(&mut self) -> SchedulerResult<()> {
        self.bodies.clear();
        let live: Vec<ThreadId> = self.ctx.lock().threads.keys().copied().collect();
        for thread in live {
            self.ctx.lock().cancel(thread, None)?;
        }
        self.discard_pending();
        Ok(())
    }

    fn discard_pending(&self) {
        let mut ctx = self.ctx.lock();
        ctx.unstarted.clear();
        ctx.in_transit.clear();
    }
}

/// Poll a body once. A panic is a host failure of that thread.
fn poll_body(body: &mut Body) -> Poll<RunResult<Value>> {
    let mut cx = Context::from_waker(noop_waker_ref());
    match panic::catch_unwind(AssertUnwindSafe(|| body.poll_unpin(&mut cx))) {
        Ok(poll) => poll,
        Err(payload) => Poll::Ready(Err(RunError::internal(format!(
            "thread panicked: {}",
            panic_message(payload.as_ref())
        )))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn outcome_label(outcome: &RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Completed(_) => "completed",
        RunOutcome::Failed { .. } => "failed",
        RunOutcome::Deadlocked(_) => "deadlocked",
        RunOutcome::Stopped { .. } => "stopped",
    }
}
