//! Combinatorial test runner: verdict classification

use crate::cx::ThreadCx;
use crate::error::{ErrorKind, RunError, RunResult};
use crate::operation::Operation;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use vdm_primitives::{ObjectId, Value};

/// Outcome of a test sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Every step completed
    Passed,
    /// A step failed for a reason the test can be blamed for
    Failed,
    /// A step was called outside its precondition
    Inconclusive,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Passed => write!(f, "PASSED"),
            Verdict::Failed => write!(f, "FAILED"),
            Verdict::Inconclusive => write!(f, "INCONCLUSIVE"),
        }
    }
}

/// One call of a test sequence
#[derive(Debug, Clone)]
pub struct TestStep {
    /// Called object
    pub target: ObjectId,
    /// Called operation
    pub operation: Arc<dyn Operation>,
    /// Arguments
    pub args: Vec<Value>,
}

impl TestStep {
    /// Create a step
    pub fn new(target: ObjectId, operation: Arc<dyn Operation>, args: Vec<Value>) -> Self {
        Self {
            target,
            operation,
            args,
        }
    }
}

/// Result of one executed step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    /// Operation name
    pub operation: String,
    /// What the call returned
    pub result: RunResult<Value>,
}

/// Verdict plus the steps that ran
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestResult {
    /// Verdict
    pub verdict: Verdict,
    /// Executed steps, in order
    pub steps: Vec<StepOutcome>,
    /// The run deadlocked before the sequence finished
    pub deadlocked: bool,
    /// Fatal error of another thread that stopped the sequence
    pub fault: Option<RunError>,
}

impl TestResult {
    pub(crate) fn pending() -> Self {
        Self {
            verdict: Verdict::Passed,
            steps: Vec::new(),
            deadlocked: false,
            fault: None,
        }
    }
}

/// Classify a failed step. A precondition failure raised by the operation the
/// test called directly (one level below the runner) is not the test's fault.
pub fn classify(error: &RunError, runner_depth: usize) -> Verdict {
    let cause = error.root_cause();
    if cause.kind == ErrorKind::Precondition && cause.depth == runner_depth + 1 {
        Verdict::Inconclusive
    } else {
        Verdict::Failed
    }
}

/// Body of a test runner thread
pub(crate) fn run_steps(cx: ThreadCx, steps: Vec<TestStep>) -> BoxFuture<'static, RunResult<Value>> {
    async move {
        let mut verdict = Verdict::Passed;
        for step in steps {
            let TestStep {
                target,
                operation,
                args,
            } = step;
            let name = operation.name().to_string();
            let result = cx.call(target, operation, args).await;
            let failed = match &result {
                Err(err) if err.is_cancelled() => return Err(err.clone()),
                Err(err) => Some(classify(err, cx.depth())),
                Ok(_) => None,
            };
            cx.record_step(StepOutcome {
                operation: name,
                result,
            });
            if let Some(v) = failed {
                verdict = v;
                break;
            }
        }
        cx.finish_test(verdict);
        Ok(Value::Void)
    }
    .boxed()
}
