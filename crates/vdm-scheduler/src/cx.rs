//! Thread-side handle to the scheduler
//!
//! Operation bodies receive a [`ThreadCx`]. Every suspension point of the
//! simulation is an `async` method here; awaiting one hands the CPU back to
//! the dispatcher until the wake condition holds.

use crate::context::Shared;
use crate::error::{ErrorKind, RunError, RunResult};
use crate::message::ReplyTo;
use crate::operation::Operation;
use crate::periodic::{PeriodicSpec, PeriodicWork};
use crate::thread::{Blocker, Park, Resumption, Signal};
use crate::transaction::{CellKey, StoreView};
use crate::verdict::{StepOutcome, Verdict};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use vdm_primitives::{MessageId, ObjectId, ResourceId, ThreadId, Time, Value};

/// Handle to an asynchronous call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsyncHandle {
    /// Correlation id of the request
    pub message: MessageId,
    /// Called object
    pub target: ObjectId,
}

/// Execution context of one simulated thread
#[derive(Clone)]
pub struct ThreadCx {
    ctx: Shared,
    thread: ThreadId,
    resource: ResourceId,
    depth: usize,
    object: Option<ObjectId>,
}

impl ThreadCx {
    pub(crate) fn new(
        ctx: Shared,
        thread: ThreadId,
        resource: ResourceId,
        depth: usize,
        object: Option<ObjectId>,
    ) -> Self {
        Self {
            ctx,
            thread,
            resource,
            depth,
            object,
        }
    }

    /// Thread id
    pub fn id(&self) -> ThreadId {
        self.thread
    }

    /// Call depth (0 = thread entry point)
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// CPU the thread is bound to
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    /// Current virtual time
    pub fn now(&self) -> Time {
        self.ctx.lock().clock.now()
    }

    /// Global signal, if one has been raised
    pub fn signal(&self) -> Option<Signal> {
        self.ctx.lock().signal
    }

    /// Object the current operation runs on
    pub fn this(&self) -> RunResult<ObjectId> {
        self.object
            .ok_or_else(|| self.runtime_error("operation has no self object"))
    }

    /// Find a deployed object by name
    pub fn lookup(&self, name: &str) -> Option<ObjectId> {
        self.ctx.lock().object_named(name)
    }

    // ==================== Instance variables ====================

    /// Read an instance variable: this thread's own pending write, else the
    /// committed value
    pub fn read(&self, object: ObjectId, field: &str) -> Value {
        self.ctx
            .lock()
            .store
            .read(&CellKey::new(object, field), Some(self.thread))
    }

    /// Write an instance variable; visible to other threads once this thread
    /// finishes its scheduling step
    pub fn write(&self, object: ObjectId, field: &str, value: Value) -> RunResult<()> {
        let mut ctx = self.ctx.lock();
        if !ctx.objects.contains_key(&object) {
            return Err(self.runtime_error(format!("object {} is not deployed", object)));
        }
        ctx.store
            .write(CellKey::new(object, field), self.thread, value)
            .map_err(|err| RunError::internal(err.to_string()).at_depth(self.depth))
    }

    /// Read a field of the self object
    pub fn read_field(&self, field: &str) -> RunResult<Value> {
        Ok(self.read(self.this()?, field))
    }

    /// Write a field of the self object
    pub fn write_field(&self, field: &str, value: Value) -> RunResult<()> {
        self.write(self.this()?, field, value)
    }

    // ==================== Suspension points ====================

    fn suspend(&self, park: Park) -> Suspend {
        Suspend {
            ctx: Arc::clone(&self.ctx),
            thread: self.thread,
            depth: self.depth,
            park: Some(park),
        }
    }

    /// Consume `d` time units (TIMESTEP until `now + d`)
    pub async fn duration(&self, d: Time) -> RunResult<()> {
        let until = self.now() + d;
        self.suspend(Park::TimeStep(Some(until))).await.map(|_| ())
    }

    /// Consume `n` cycles of this thread's CPU
    pub async fn cycles(&self, n: u64) -> RunResult<()> {
        let d = self
            .ctx
            .lock()
            .cpus
            .get(&self.resource)
            .map(|cpu| cpu.cycles_to_time(n))
            .unwrap_or(n);
        self.duration(d).await
    }

    /// Yield until the clock next advances
    pub async fn timestep(&self) -> RunResult<()> {
        self.suspend(Park::TimeStep(None)).await.map(|_| ())
    }

    /// Sleep (ALARM) until time `t`
    pub async fn sleep_until(&self, t: Time) -> RunResult<()> {
        self.suspend(Park::Alarm {
            until: t,
            initial: false,
        })
        .await
        .map(|_| ())
    }

    pub(crate) async fn initial_alarm(&self, t: Time) -> RunResult<()> {
        self.suspend(Park::Alarm {
            until: t,
            initial: true,
        })
        .await
        .map(|_| ())
    }

    /// Block (WAITING) until `predicate` holds over the committed instance
    /// variables. Returns immediately if it already holds.
    pub async fn guard<F>(&self, predicate: F) -> RunResult<()>
    where
        F: Fn(&StoreView<'_>) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        loop {
            let holds = {
                let ctx = self.ctx.lock();
                let view = ctx.store.view(Some(self.thread));
                (*predicate)(&view)
            };
            if holds {
                return Ok(());
            }
            let shared = Arc::clone(&predicate);
            let guard = Box::new(move |view: &StoreView<'_>| (*shared)(view));
            self.suspend(Park::Waiting(Blocker::Guard(guard))).await?;
        }
    }

    // ==================== Calls ====================

    /// Synchronous call: the callee runs on its own thread on the target's
    /// CPU while this thread waits for the reply
    pub async fn call(
        &self,
        target: ObjectId,
        operation: Arc<dyn Operation>,
        args: Vec<Value>,
    ) -> RunResult<Value> {
        let message = self.send(target, operation, args, ReplyTo::Caller(self.thread))?;
        match self.suspend(Park::Waiting(Blocker::Reply(message))).await? {
            Resumed::Reply(result) => result,
            Resumed::Wake => Err(RunError::internal("woken without a reply").at_depth(self.depth)),
        }
    }

    /// Asynchronous call. With `expects_reply` the result is kept in the
    /// reply mailbox for [`ThreadCx::await_reply`].
    pub fn call_async(
        &self,
        target: ObjectId,
        operation: Arc<dyn Operation>,
        args: Vec<Value>,
        expects_reply: bool,
    ) -> RunResult<AsyncHandle> {
        let reply = if expects_reply {
            ReplyTo::Mailbox
        } else {
            ReplyTo::None
        };
        let message = self.send(target, operation, args, reply)?;
        Ok(AsyncHandle { message, target })
    }

    /// Wait for the reply of an asynchronous call
    pub async fn await_reply(&self, handle: AsyncHandle) -> RunResult<Value> {
        let ready = self.ctx.lock().mailbox.remove(&handle.message);
        if let Some(result) = ready {
            return result;
        }
        match self
            .suspend(Park::Waiting(Blocker::Mailbox(handle.message)))
            .await?
        {
            Resumed::Reply(result) => result,
            Resumed::Wake => Err(RunError::internal("woken without a reply").at_depth(self.depth)),
        }
    }

    fn send(
        &self,
        target: ObjectId,
        operation: Arc<dyn Operation>,
        args: Vec<Value>,
        reply: ReplyTo,
    ) -> RunResult<MessageId> {
        self.ctx
            .lock()
            .send_request(Some(self.thread), target, operation, args, reply, self.depth + 1)
            .map_err(|err| {
                if err.depth == 0 {
                    err.at_depth(self.depth)
                } else {
                    err
                }
            })
    }

    /// Run an operation inline on this thread, one call level deeper.
    /// Failures come back wrapped in an invocation error.
    pub async fn invoke(
        &self,
        target: Option<ObjectId>,
        operation: Arc<dyn Operation>,
        args: Vec<Value>,
    ) -> RunResult<Value> {
        let depth = self.depth + 1;
        let limit = self.ctx.lock().config.max_call_depth;
        if depth > limit {
            return Err(RunError::stack_overflow(depth, limit));
        }
        let child = ThreadCx {
            depth,
            object: target.or(self.object),
            ..self.clone()
        };
        let name = operation.name().to_string();
        operation.invoke(child, args).await.map_err(|err| {
            if err.is_cancelled() {
                err
            } else {
                err.wrap(format!("invocation of {} failed", name))
                    .with_context(format!("in {} at depth {}", name, depth))
            }
        })
    }

    /// Start a periodic or sporadic activation chain on `target`
    pub fn start_periodic(
        &self,
        target: ObjectId,
        operation: Arc<dyn Operation>,
        args: Vec<Value>,
        spec: PeriodicSpec,
    ) -> RunResult<ThreadId> {
        let mut ctx = self.ctx.lock();
        if let Some(signal) = ctx.signal {
            return Err(RunError::cancelled(signal).at_depth(self.depth));
        }
        ctx.start_periodic(target, operation, args, spec)
            .map_err(|err| self.runtime_error(err.to_string()))
    }

    // ==================== Errors ====================

    /// Error of the given kind raised at this call depth
    pub fn error(&self, kind: ErrorKind, message: impl Into<String>) -> RunError {
        RunError::new(kind, message).at_depth(self.depth)
    }

    /// Precondition failure at this call depth
    pub fn precondition_failed(&self, message: impl Into<String>) -> RunError {
        self.error(ErrorKind::Precondition, message)
    }

    /// Postcondition failure at this call depth
    pub fn postcondition_failed(&self, message: impl Into<String>) -> RunError {
        self.error(ErrorKind::Postcondition, message)
    }

    /// Runtime error at this call depth
    pub fn runtime_error(&self, message: impl Into<String>) -> RunError {
        self.error(ErrorKind::Runtime, message)
    }

    // ==================== Kind support ====================

    pub(crate) fn activate(&self, work: &PeriodicWork) -> RunResult<()> {
        self.ctx
            .lock()
            .activate(self.thread, work)
            .map_err(|err| RunError::internal(err.to_string()).at_depth(self.depth))
    }

    pub(crate) fn max_periodic_overlaps(&self) -> usize {
        self.ctx.lock().config.max_periodic_overlaps
    }

    /// Add `delta` to an integer cell and return the new value as this thread sees it
    pub(crate) fn adjust_counter(&self, key: &CellKey, delta: i64) -> RunResult<i64> {
        let current = self.read(key.object, &key.field);
        let next = current
            .add_int(delta)
            .map_err(|err| self.runtime_error(err.to_string()))?;
        let count = next.as_int().unwrap_or_default();
        self.write(key.object, &key.field, next)?;
        Ok(count)
    }

    pub(crate) fn record_step(&self, outcome: StepOutcome) {
        self.ctx.lock().record_step(self.thread, outcome);
    }

    pub(crate) fn finish_test(&self, verdict: Verdict) {
        self.ctx.lock().finish_test(self.thread, verdict);
    }
}

/// What a suspension point was resumed with
#[derive(Debug)]
pub(crate) enum Resumed {
    Wake,
    Reply(RunResult<Value>),
}

/// Future behind every suspension point.
///
/// The first poll parks the thread and returns `Pending`; the dispatcher polls
/// again only once it has stored a resumption.
pub(crate) struct Suspend {
    ctx: Shared,
    thread: ThreadId,
    depth: usize,
    park: Option<Park>,
}

impl Future for Suspend {
    type Output = RunResult<Resumed>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut ctx = this.ctx.lock();
        if let Some(park) = this.park.take() {
            if let Some(signal) = ctx.signal {
                return Poll::Ready(Err(RunError::cancelled(signal).at_depth(this.depth)));
            }
            return match ctx.park(this.thread, park) {
                Ok(()) => Poll::Pending,
                Err(err) => Poll::Ready(Err(RunError::internal(err.to_string()).at_depth(this.depth))),
            };
        }
        match ctx.take_resumption(this.thread) {
            Some(Resumption::Wake) => Poll::Ready(Ok(Resumed::Wake)),
            Some(Resumption::Reply(result)) => Poll::Ready(Ok(Resumed::Reply(result))),
            Some(Resumption::Signal(signal)) => {
                Poll::Ready(Err(RunError::cancelled(signal).at_depth(this.depth)))
            }
            None => Poll::Pending,
        }
    }
}
