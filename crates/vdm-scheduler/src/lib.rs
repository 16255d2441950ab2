//! # vdm-scheduler
//!
//! Deterministic discrete-event scheduler for VDM threads.
//!
//! Many logical threads of control run on virtual CPUs connected by virtual
//! buses, sharing one virtual clock. Scheduling is cooperative and
//! reproducible:
//! - fixed-priority (or FCFS) selection per CPU, ties by creation order
//! - instance variables isolated in transaction cells until a thread yields
//! - periodic and sporadic activation chains with seeded jitter
//! - synchronous and asynchronous calls carried by bus messages
//! - deadlock detection and first-error-wins suspension
//! - a test runner that classifies call sequences into verdicts
//!
//! Operation bodies are `async` blocks that suspend only through the
//! [`ThreadCx`] they receive.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod clock;
mod config;
mod context;
mod cx;
mod dispatcher;
mod error;
mod message;
mod operation;
mod periodic;
mod resource;
mod thread;
mod trace;
mod transaction;
mod verdict;
mod work;

pub use clock::Clock;
pub use config::{BusConfig, CpuConfig, SchedulerConfig};
pub use context::metric;
pub use cx::{AsyncHandle, ThreadCx};
pub use dispatcher::{DeadlockReport, ResourceScheduler, RunOutcome};
pub use error::{
    ErrorKind, Location, RunError, RunResult, SchedulerError, SchedulerResult,
    PERIODIC_OVERLAP_CODE,
};
pub use message::{EventKey, InTransit, MessageEnvelope, MessageRequest, MessageResponse, ReplyTo};
pub use operation::{operation, FnOperation, Operation};
pub use periodic::{noise, PeriodicSpec, PeriodicWork};
pub use resource::{route, Bus, Cpu, Policy, Route, VBUS, VCPU};
pub use thread::{Guard, RunState, Signal, ThreadInfo, ThreadKind};
pub use trace::{TraceEvent, TraceKind, TraceLog};
pub use transaction::{CellKey, StoreView, TransactionCell, TransactionStore};
pub use verdict::{classify, StepOutcome, TestResult, TestStep, Verdict};
pub use work::{Entry, WorkKind};

pub use vdm_primitives::{MessageId, ObjectId, Priority, ResourceId, ThreadId, Time, Value};
