//! Schedulable thread state machine

use crate::error::{RunResult, SchedulerError, SchedulerResult};
use crate::message::MessageRequest;
use crate::transaction::StoreView;
use serde::{Deserialize, Serialize};
use vdm_primitives::{MessageId, ObjectId, Priority, ResourceId, ThreadId, Time, Value};

/// Lifecycle state of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Registered but not yet handed to its resource
    Created,
    /// Ready to be selected by its CPU
    Runnable,
    /// Holding its CPU
    Running,
    /// Blocked on a reply or a permission guard
    Waiting,
    /// Sleeping until an absolute time
    Alarm,
    /// Yielded until a clock advance
    TimeStep,
    /// Body returned normally
    Completed,
    /// Body failed or was cancelled
    Failed,
}

impl RunState {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    /// Suspended states release the CPU
    pub fn is_suspended(&self) -> bool {
        matches!(self, RunState::Waiting | RunState::Alarm | RunState::TimeStep)
    }

    /// Whether the state machine allows `self -> to`
    pub fn can_transition_to(&self, to: RunState) -> bool {
        use RunState::*;
        match (self, to) {
            (_, Failed) => !self.is_terminal(),
            (Created, Runnable) => true,
            (Runnable, Running) => true,
            (Running, Waiting | Alarm | TimeStep | Completed) => true,
            // woken, or polled once more from the suspension point when cancelled
            (from, Runnable | Running) if from.is_suspended() => true,
            _ => false,
        }
    }
}

/// Global signal broadcast to every thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// A thread recorded a fatal error
    Suspend,
    /// No thread can make progress
    Deadlocked,
}

/// What kind of work a thread carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    /// Top-level entry point
    Main,
    /// Callee of a synchronous call
    Object,
    /// Callee of an asynchronous call
    Async,
    /// One activation of a periodic or sporadic chain
    Periodic,
    /// Combinatorial test runner
    Test,
}

/// Permission guard over committed instance variables
pub type Guard = Box<dyn Fn(&StoreView<'_>) -> bool + Send>;

/// Why a waiting thread is blocked
pub(crate) enum Blocker {
    /// Reply to a synchronous call
    Reply(MessageId),
    /// Reply to an asynchronous call, via the mailbox
    Mailbox(MessageId),
    /// Permission guard
    Guard(Guard),
}

impl std::fmt::Debug for Blocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Blocker::Reply(id) => write!(f, "Reply({})", id),
            Blocker::Mailbox(id) => write!(f, "Mailbox({})", id),
            Blocker::Guard(_) => write!(f, "Guard"),
        }
    }
}

/// Request to leave the CPU, made at a suspension point
#[derive(Debug)]
pub(crate) enum Park {
    /// TIMESTEP until the given time, or until the next clock advance
    TimeStep(Option<Time>),
    /// ALARM until the given time
    Alarm { until: Time, initial: bool },
    /// WAITING on a blocker
    Waiting(Blocker),
}

/// What a suspended thread is resumed with
#[derive(Debug)]
pub(crate) enum Resumption {
    /// Its wake condition holds
    Wake,
    /// A reply arrived
    Reply(RunResult<Value>),
    /// A global signal was raised
    Signal(Signal),
}

/// Per-thread bookkeeping held by the scheduler context
#[derive(Debug)]
pub(crate) struct ThreadState {
    pub id: ThreadId,
    pub name: String,
    pub kind: ThreadKind,
    pub priority: Priority,
    pub resource: ResourceId,
    pub object: Option<ObjectId>,
    pub state: RunState,
    pub wake_time: Option<Time>,
    /// Time at which the thread parked; used by TIMESTEP without a wake time
    pub parked_at: Time,
    pub initial_alarm: bool,
    pub depth: usize,
    pub blocker: Option<Blocker>,
    pub resumption: Option<Resumption>,
    /// Request that created an object or async thread
    pub origin: Option<MessageRequest>,
    /// Order in which the thread last became runnable
    pub ready_seq: u64,
    /// Whether the body has been polled at least once
    pub started: bool,
}

impl ThreadState {
    pub fn new(
        id: ThreadId,
        name: String,
        kind: ThreadKind,
        priority: Priority,
        resource: ResourceId,
        created_at: Time,
    ) -> Self {
        Self {
            id,
            name,
            kind,
            priority,
            resource,
            object: None,
            state: RunState::Created,
            wake_time: None,
            parked_at: created_at,
            initial_alarm: false,
            depth: 0,
            blocker: None,
            resumption: None,
            origin: None,
            ready_seq: 0,
            started: false,
        }
    }

    /// Move to `to`, enforcing the state machine
    pub fn transition(&mut self, to: RunState) -> SchedulerResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(SchedulerError::IllegalTransition {
                thread: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Whether this thread counts as evidence that the run could still progress.
    ///
    /// An alarm before the first activation of a periodic chain does not.
    pub fn is_active(&self) -> bool {
        match self.state {
            RunState::Runnable | RunState::Running | RunState::Waiting | RunState::TimeStep => {
                true
            }
            RunState::Alarm => !self.initial_alarm,
            RunState::Created | RunState::Completed | RunState::Failed => false,
        }
    }

    /// Snapshot for diagnostics
    pub fn info(&self) -> ThreadInfo {
        ThreadInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            priority: self.priority,
            resource: self.resource,
            state: self.state,
            wake_time: self.wake_time,
            active: self.is_active(),
        }
    }
}

/// Public view of a live thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    /// Thread id
    pub id: ThreadId,
    /// Display name
    pub name: String,
    /// Work kind
    pub kind: ThreadKind,
    /// Effective priority
    pub priority: Priority,
    /// Owning CPU
    pub resource: ResourceId,
    /// Current state
    pub state: RunState,
    /// Pending wake time
    pub wake_time: Option<Time>,
    /// See [`RunState`] and the deadlock report
    pub active: bool,
}
