//! Thread kinds
//!
//! All kinds share one state machine; they differ in the body that is driven
//! and in what happens to the body's result.

use crate::context::SchedulerContext;
use crate::cx::ThreadCx;
use crate::error::{RunError, RunResult};
use crate::message::MessageRequest;
use crate::operation::Operation;
use crate::periodic::{self, PeriodicWork};
use crate::thread::{Signal, ThreadKind};
use crate::verdict::{self, TestResult, TestStep, Verdict};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, error};
use vdm_primitives::{ObjectId, ThreadId, Value};

/// What a main thread evaluates
#[derive(Debug, Clone)]
pub enum Entry {
    /// Run an operation directly on the main thread
    Invoke {
        /// Operation
        operation: Arc<dyn Operation>,
        /// Arguments
        args: Vec<Value>,
        /// Object the operation runs on, if any
        target: Option<ObjectId>,
    },
    /// Call an operation of a deployed object and wait for the result
    Call {
        /// Called object
        target: ObjectId,
        /// Operation
        operation: Arc<dyn Operation>,
        /// Arguments
        args: Vec<Value>,
    },
}

/// Work carried by a thread
#[derive(Debug, Clone)]
pub enum WorkKind {
    /// Top-level entry point
    Main(Entry),
    /// Callee of a synchronous call
    Object(MessageRequest),
    /// Callee of an asynchronous call
    Async(MessageRequest),
    /// One periodic activation
    Periodic(PeriodicWork),
    /// Test sequence
    Test(Vec<TestStep>),
}

impl WorkKind {
    /// Kind tag
    pub fn kind(&self) -> ThreadKind {
        match self {
            WorkKind::Main(_) => ThreadKind::Main,
            WorkKind::Object(_) => ThreadKind::Object,
            WorkKind::Async(_) => ThreadKind::Async,
            WorkKind::Periodic(_) => ThreadKind::Periodic,
            WorkKind::Test(_) => ThreadKind::Test,
        }
    }

    /// Object the body runs on
    pub fn object(&self) -> Option<ObjectId> {
        match self {
            WorkKind::Main(Entry::Invoke { target, .. }) => *target,
            WorkKind::Main(Entry::Call { .. }) | WorkKind::Test(_) => None,
            WorkKind::Object(req) | WorkKind::Async(req) => Some(req.target),
            WorkKind::Periodic(work) => Some(work.target),
        }
    }

    /// Request that created the thread
    pub fn request(&self) -> Option<&MessageRequest> {
        match self {
            WorkKind::Object(req) | WorkKind::Async(req) => Some(req),
            _ => None,
        }
    }
}

/// Build the body future of a thread
pub(crate) fn drive(cx: ThreadCx, work: WorkKind) -> BoxFuture<'static, RunResult<Value>> {
    match work {
        WorkKind::Main(Entry::Invoke {
            operation, args, ..
        }) => operation.invoke(cx, args),
        WorkKind::Main(Entry::Call {
            target,
            operation,
            args,
        }) => async move { cx.call(target, operation, args).await }.boxed(),
        WorkKind::Object(req) | WorkKind::Async(req) => {
            let MessageRequest {
                target,
                operation,
                args,
                ..
            } = req;
            let frame = format!("in {} on {}", operation.name(), target);
            async move {
                operation
                    .invoke(cx, args)
                    .await
                    .map_err(|err| err.with_context(frame))
            }
            .boxed()
        }
        WorkKind::Periodic(work) => periodic::activation(cx, work),
        WorkKind::Test(steps) => verdict::run_steps(cx, steps),
    }
}

/// Apply the kind-specific completion policy to a finished body
pub(crate) fn settle(ctx: &mut SchedulerContext, thread: ThreadId, result: RunResult<Value>) {
    let Some(state) = ctx.threads.get(&thread) else {
        return;
    };
    let kind = state.kind;
    let origin = state.origin.clone();
    let name = state.name.clone();

    if let Err(err) = &result {
        if let crate::error::ErrorKind::Cancelled(signal) = err.kind {
            settle_cancelled(ctx, thread, Some(signal));
            return;
        }
    }

    match (kind, result) {
        (ThreadKind::Main, Ok(value)) => {
            ctx.results.insert(thread, value);
        }
        (ThreadKind::Main, Err(err)) => {
            error!(thread = %thread, name = %name, "{}", err);
            for frame in &err.context {
                error!(thread = %thread, "  {}", frame);
            }
            ctx.record_error(thread, err.flatten());
        }
        (ThreadKind::Object, Err(err))
            if !origin.as_ref().is_some_and(|req| req.under_test)
                || err.root_cause().kind.is_exhaustion() =>
        {
            // the run halts here; the caller is cancelled rather than answered
            error!(thread = %thread, name = %name, "{}", err);
            ctx.record_error(thread, err.flatten());
        }
        (ThreadKind::Object, result) => {
            if let Some(req) = origin {
                ctx.send_response(&req, result);
            }
        }
        (ThreadKind::Async, Ok(value)) => {
            if let Some(req) = origin.filter(|req| req.expects_reply()) {
                ctx.send_response(&req, Ok(value));
            }
        }
        (ThreadKind::Async | ThreadKind::Periodic, Err(err)) => {
            debug!(thread = %thread, name = %name, "{}", err);
            ctx.record_error(thread, err.flatten());
        }
        (ThreadKind::Periodic, Ok(_)) => {}
        // the runner stored its own verdict
        (ThreadKind::Test, Ok(_)) => {}
        (ThreadKind::Test, Err(err)) => {
            let result = ctx
                .test_results
                .entry(thread)
                .or_insert_with(TestResult::pending);
            result.verdict = Verdict::Failed;
            result.fault = Some(err.flatten());
        }
    }
}

/// A thread stopped by a signal or by shutdown. Only test runners leave a trace
/// of that: their verdict becomes FAILED.
pub(crate) fn settle_cancelled(ctx: &mut SchedulerContext, thread: ThreadId, signal: Option<Signal>) {
    let is_test = ctx
        .threads
        .get(&thread)
        .is_some_and(|t| t.kind == ThreadKind::Test);
    if !is_test {
        return;
    }
    let fault: Option<RunError> = ctx.error.as_ref().map(|(_, err)| err.clone());
    let result = ctx
        .test_results
        .entry(thread)
        .or_insert_with(TestResult::pending);
    result.verdict = Verdict::Failed;
    result.deadlocked = signal == Some(Signal::Deadlocked);
    result.fault = fault;
}
