//! Operation bodies supplied by the evaluator

use crate::cx::ThreadCx;
use crate::error::RunResult;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use vdm_primitives::{Priority, Value};

/// An opaque callable operation body.
///
/// The body runs on a simulated thread and may suspend only through the
/// [`ThreadCx`] it is given.
pub trait Operation: Send + Sync {
    /// Operation name, used for priority overrides and diagnostics
    fn name(&self) -> &str;

    /// Declared priority, if any
    fn priority(&self) -> Option<Priority> {
        None
    }

    /// Start the body
    fn invoke(&self, cx: ThreadCx, args: Vec<Value>) -> BoxFuture<'static, RunResult<Value>>;
}

impl fmt::Debug for dyn Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operation({})", self.name())
    }
}

/// Operation backed by a closure
pub struct FnOperation<F> {
    name: String,
    priority: Option<Priority>,
    body: F,
}

impl<F, Fut> FnOperation<F>
where
    F: Fn(ThreadCx, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RunResult<Value>> + Send + 'static,
{
    /// Wrap a closure
    pub fn new(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            priority: None,
            body,
        }
    }

    /// Declare a priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Share as a trait object
    pub fn into_arc(self) -> Arc<dyn Operation> {
        Arc::new(self)
    }
}

impl<F, Fut> Operation for FnOperation<F>
where
    F: Fn(ThreadCx, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RunResult<Value>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> Option<Priority> {
        self.priority
    }

    fn invoke(&self, cx: ThreadCx, args: Vec<Value>) -> BoxFuture<'static, RunResult<Value>> {
        (self.body)(cx, args).boxed()
    }
}

/// Build an operation from a closure returning a future
pub fn operation<F, Fut>(name: impl Into<String>, body: F) -> Arc<dyn Operation>
where
    F: Fn(ThreadCx, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RunResult<Value>> + Send + 'static,
{
    FnOperation::new(name, body).into_arc()
}
