//! Error types for the scheduler
//!
//! Two families live here. [`SchedulerError`] reports misuse of the scheduler
//! API by the environment. [`RunError`] is the value a simulated thread fails
//! with; it never unwinds across thread boundaries, it is returned.

use crate::thread::{RunState, Signal};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use vdm_primitives::{ObjectId, ResourceId, ThreadId, Time};

/// Error code reported when a periodic operation exceeds its overlap limit
pub const PERIODIC_OVERLAP_CODE: u32 = 68;

/// Scheduler errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    /// Resource not registered
    #[error("resource {0} not found")]
    UnknownResource(ResourceId),

    /// Object not deployed
    #[error("object {0} not deployed")]
    UnknownObject(ObjectId),

    /// Thread not registered
    #[error("thread {0} not found")]
    UnknownThread(ThreadId),

    /// Resource exists but is not a CPU
    #[error("resource {0} is not a CPU")]
    NotACpu(ResourceId),

    /// Name already used by another resource or object
    #[error("name already in use: {0}")]
    DuplicateName(String),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No bus connects the two CPUs
    #[error("no bus route from {from} to {to}")]
    NoRoute {
        /// Sending CPU
        from: String,
        /// Target CPU
        to: String,
    },

    /// A CPU was handed a second thread while one still holds it
    #[error("{cpu} already runs {holder}")]
    CpuBusy {
        /// CPU name
        cpu: String,
        /// Thread holding the CPU
        holder: ThreadId,
    },

    /// An environment call was refused by the running simulation
    #[error("call rejected: {0}")]
    CallRejected(RunError),

    /// Invalid periodic or sporadic activation parameters
    #[error("invalid periodic activation: {0}")]
    InvalidPeriodic(String),

    /// A thread was asked to make a transition its state machine forbids
    #[error("illegal transition for thread {thread}: {from:?} -> {to:?}")]
    IllegalTransition {
        /// Thread
        thread: ThreadId,
        /// Current state
        from: RunState,
        /// Requested state
        to: RunState,
    },

    /// Attempt to move the clock backwards
    #[error("clock regression: now {now}, requested {requested}")]
    ClockRegression {
        /// Current time
        now: Time,
        /// Requested time
        requested: Time,
    },

    /// A transaction cell already carries another thread's working value
    #[error("cell {key} has a pending write by {owner}, write by {writer} refused")]
    CellConflict {
        /// Cell description
        key: String,
        /// Current owner
        owner: ThreadId,
        /// Thread attempting the write
        writer: ThreadId,
    },

    /// The previous run halted; the scheduler must be reset before running again
    #[error("scheduler halted by {0:?}; reset before running again")]
    Halted(Signal),
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Classification of a thread failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Declared precondition violated
    Precondition,
    /// Declared postcondition violated
    Postcondition,
    /// Declared invariant violated
    Invariant,
    /// Language runtime error (type error, missing bus route, ...)
    Runtime,
    /// Too many outstanding activations of a periodic operation
    PeriodicOverlap,
    /// Call nesting exceeded the configured depth
    StackOverflow,
    /// Host failure: a body panicked or broke the suspension protocol
    Internal,
    /// Wrapper added when an error crosses an inline invocation
    Invocation,
    /// The thread observed a global signal and stopped early
    Cancelled(Signal),
}

impl ErrorKind {
    /// Resource exhaustion is always fatal to the run
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, ErrorKind::PeriodicOverlap | ErrorKind::StackOverflow)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Precondition => write!(f, "precondition failure"),
            ErrorKind::Postcondition => write!(f, "postcondition failure"),
            ErrorKind::Invariant => write!(f, "invariant failure"),
            ErrorKind::Runtime => write!(f, "runtime error"),
            ErrorKind::PeriodicOverlap => write!(f, "periodic overlap"),
            ErrorKind::StackOverflow => write!(f, "stack overflow"),
            ErrorKind::Internal => write!(f, "internal error"),
            ErrorKind::Invocation => write!(f, "invocation failed"),
            ErrorKind::Cancelled(signal) => write!(f, "cancelled by {:?}", signal),
        }
    }
}

/// Source position reported by the evaluator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Source file or module
    pub file: String,
    /// Line (1-based)
    pub line: u32,
    /// Column (1-based)
    pub column: u32,
}

impl Location {
    /// Create a location
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Failure of a simulated thread
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RunError {
    /// Failure classification
    pub kind: ErrorKind,
    /// Numeric error code, if the failure has one
    pub code: Option<u32>,
    /// Human readable message
    pub message: String,
    /// Where the failure was raised
    pub location: Option<Location>,
    /// Call depth at which the failure was raised (0 = thread entry point)
    pub depth: usize,
    /// Context frames, innermost first
    pub context: Vec<String>,
    /// Wrapped error
    #[source]
    pub source: Option<Box<RunError>>,
}

/// Result type for thread bodies
pub type RunResult<T> = Result<T, RunError>;

impl RunError {
    /// Create an error of the given kind at depth 0
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
            location: None,
            depth: 0,
            context: Vec::new(),
            source: None,
        }
    }

    /// Runtime error
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    /// Host/internal failure
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Error returned from a suspension point after a global signal
    pub fn cancelled(signal: Signal) -> Self {
        Self::new(
            ErrorKind::Cancelled(signal),
            format!("thread stopped by {:?} signal", signal),
        )
    }

    /// Periodic overlap limit exceeded
    pub fn periodic_overlap(operation: &str, outstanding: i64, limit: usize) -> Self {
        Self::new(
            ErrorKind::PeriodicOverlap,
            format!(
                "{} has {} overlapping activations, limit is {}",
                operation, outstanding, limit
            ),
        )
        .with_code(PERIODIC_OVERLAP_CODE)
    }

    /// Call nesting limit exceeded
    pub fn stack_overflow(depth: usize, limit: usize) -> Self {
        Self::new(
            ErrorKind::StackOverflow,
            format!("call depth {} exceeds limit {}", depth, limit),
        )
        .at_depth(depth)
    }

    /// Attach a numeric code
    pub fn with_code(mut self, code: u32) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a source location
    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Set the call depth
    pub fn at_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Push a context frame
    pub fn with_context(mut self, frame: impl Into<String>) -> Self {
        self.context.push(frame.into());
        self
    }

    /// Wrap this error in an invocation error
    pub fn wrap(self, message: impl Into<String>) -> Self {
        let depth = self.depth;
        let mut wrapper = Self::new(ErrorKind::Invocation, message).at_depth(depth);
        wrapper.source = Some(Box::new(self));
        wrapper
    }

    /// The innermost error that is not an invocation wrapper.
    ///
    /// Wrapping may be nested to any depth; the result is the original cause
    /// regardless of how many wrappers sit on top.
    pub fn root_cause(&self) -> &RunError {
        let mut current = self;
        while current.kind == ErrorKind::Invocation {
            match current.source.as_deref() {
                Some(inner) => current = inner,
                None => break,
            }
        }
        current
    }

    /// Strip every invocation wrapper, keeping the wrappers' context frames
    /// (outermost last) on the returned cause.
    pub fn flatten(self) -> RunError {
        let mut frames = Vec::new();
        let mut current = self;
        while current.kind == ErrorKind::Invocation {
            match current.source.take() {
                Some(inner) => {
                    frames.push(std::mem::take(&mut current.context));
                    current = *inner;
                }
                None => break,
            }
        }
        for outer in frames.into_iter().rev() {
            current.context.extend(outer);
        }
        current
    }

    /// Check if this is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled(_))
    }
}
