//! Scheduler context: all state of one simulation
//!
//! The context owns the clock, the resources, every thread's bookkeeping, the
//! transaction store, messages in flight, the signal flag, the first-error
//! slot and the seeded PRNG. It is shared between the dispatcher and the
//! thread handles behind one lock that is never held while a body runs.

use crate::clock::Clock;
use crate::config::{BusConfig, CpuConfig, SchedulerConfig};
use crate::dispatcher::DeadlockReport;
use crate::error::{RunError, RunResult, SchedulerError, SchedulerResult};
use crate::message::{InTransit, MessageEnvelope, MessageRequest, MessageResponse, ReplyTo};
use crate::operation::Operation;
use crate::periodic::{PeriodicSpec, PeriodicWork};
use crate::resource::{self, Bus, Cpu, Route, VBUS, VCPU};
use crate::thread::{Blocker, Park, Resumption, RunState, Signal, ThreadKind, ThreadState};
use crate::trace::{TraceKind, TraceLog};
use crate::transaction::TransactionStore;
use crate::verdict::{StepOutcome, TestResult, TestStep, Verdict};
use crate::work::{self, Entry, WorkKind};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vdm_metrics::Metrics;
use vdm_primitives::{MessageId, ObjectId, Priority, ResourceId, ThreadId, Time, Value};

pub(crate) type Shared = Arc<Mutex<SchedulerContext>>;

/// Metric names
pub mod metric {
    /// Threads registered
    pub const THREADS_SPAWNED: &str = "scheduler.threads_spawned";
    /// Threads whose body returned normally
    pub const THREADS_COMPLETED: &str = "scheduler.threads_completed";
    /// Threads whose body failed
    pub const THREADS_FAILED: &str = "scheduler.threads_failed";
    /// Clock advances
    pub const CLOCK_ADVANCES: &str = "scheduler.clock_advances";
    /// Requests and replies sent
    pub const MESSAGES_SENT: &str = "scheduler.messages_sent";
    /// Periodic activations started
    pub const PERIODIC_ACTIVATIONS: &str = "scheduler.periodic_activations";
    /// Live threads
    pub const LIVE_THREADS: &str = "scheduler.live_threads";
    /// Send-to-delivery time of messages
    pub const MESSAGE_TRANSIT: &str = "scheduler.message_transit";
    /// Distance between expected starts of consecutive activations
    pub const ACTIVATION_GAP: &str = "scheduler.activation_gap";
}

/// A deployed object
#[derive(Debug, Clone)]
pub(crate) struct ObjectInfo {
    pub name: String,
    pub cpu: ResourceId,
}

pub(crate) struct SchedulerContext {
    pub config: SchedulerConfig,
    pub clock: Clock,
    pub rng: ChaCha8Rng,
    pub signal: Option<Signal>,
    pub error: Option<(ThreadId, RunError)>,
    pub deadlock: Option<DeadlockReport>,
    pub threads: BTreeMap<ThreadId, ThreadState>,
    pub cpus: BTreeMap<ResourceId, Cpu>,
    pub buses: BTreeMap<ResourceId, Bus>,
    pub objects: BTreeMap<ObjectId, ObjectInfo>,
    pub store: TransactionStore,
    pub in_transit: InTransit,
    pub mailbox: HashMap<MessageId, RunResult<Value>>,
    /// Registered threads whose body has not been built yet
    pub unstarted: Vec<(ThreadId, WorkKind)>,
    pub results: BTreeMap<ThreadId, Value>,
    pub test_results: BTreeMap<ThreadId, TestResult>,
    pub trace: TraceLog,
    pub metrics: Arc<Metrics>,
    next_thread: u64,
    next_message: u64,
    next_resource: u32,
    next_object: u64,
    ready_seq: u64,
}

impl SchedulerContext {
    pub fn new(config: SchedulerConfig) -> SchedulerResult<Self> {
        config.validate()?;
        let mut cpus = BTreeMap::new();
        cpus.insert(VCPU, Cpu::virtual_cpu());
        let mut buses = BTreeMap::new();
        buses.insert(VBUS, Bus::virtual_bus());

        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            trace: TraceLog::new(config.trace),
            config,
            clock: Clock::new(),
            signal: None,
            error: None,
            deadlock: None,
            threads: BTreeMap::new(),
            cpus,
            buses,
            objects: BTreeMap::new(),
            store: TransactionStore::new(),
            in_transit: InTransit::new(),
            mailbox: HashMap::new(),
            unstarted: Vec::new(),
            results: BTreeMap::new(),
            test_results: BTreeMap::new(),
            metrics: Arc::new(Metrics::new()),
            next_thread: 1,
            next_message: 1,
            next_resource: 2,
            next_object: 1,
            ready_seq: 0,
        })
    }

    pub fn now(&self) -> Time {
        self.clock.now()
    }

    // ==================== Topology ====================

    fn name_taken(&self, name: &str) -> bool {
        self.cpus.values().any(|cpu| cpu.name == name)
            || self.buses.values().any(|bus| bus.name == name)
    }

    pub fn add_cpu(&mut self, config: CpuConfig) -> SchedulerResult<ResourceId> {
        config.validate()?;
        if self.name_taken(&config.name) {
            return Err(SchedulerError::DuplicateName(config.name));
        }
        let id = ResourceId::new(self.next_resource);
        self.next_resource += 1;
        self.cpus.insert(id, Cpu::new(id, &config));
        debug!(cpu = %id, name = %config.name, "cpu added");
        Ok(id)
    }

    pub fn add_bus(&mut self, config: BusConfig) -> SchedulerResult<ResourceId> {
        config.validate()?;
        if self.name_taken(&config.name) {
            return Err(SchedulerError::DuplicateName(config.name));
        }
        for cpu in &config.cpus {
            if !self.cpus.contains_key(cpu) {
                return Err(if self.buses.contains_key(cpu) {
                    SchedulerError::NotACpu(*cpu)
                } else {
                    SchedulerError::UnknownResource(*cpu)
                });
            }
        }
        let id = ResourceId::new(self.next_resource);
        self.next_resource += 1;
        self.buses.insert(id, Bus::new(id, &config));
        debug!(bus = %id, name = %config.name, "bus added");
        Ok(id)
    }

    pub fn cpu(&self, id: ResourceId) -> SchedulerResult<&Cpu> {
        self.cpus.get(&id).ok_or(if self.buses.contains_key(&id) {
            SchedulerError::NotACpu(id)
        } else {
            SchedulerError::UnknownResource(id)
        })
    }

    pub fn deploy(&mut self, name: &str, cpu: ResourceId) -> SchedulerResult<ObjectId> {
        self.cpu(cpu)?;
        if self.object_named(name).is_some() {
            return Err(SchedulerError::DuplicateName(name.to_string()));
        }
        let id = ObjectId::new(self.next_object);
        self.next_object += 1;
        self.objects.insert(
            id,
            ObjectInfo {
                name: name.to_string(),
                cpu,
            },
        );
        Ok(id)
    }

    pub fn object_named(&self, name: &str) -> Option<ObjectId> {
        self.objects
            .iter()
            .find(|(_, info)| info.name == name)
            .map(|(id, _)| *id)
    }

    pub fn object_cpu(&self, object: ObjectId) -> SchedulerResult<ResourceId> {
        self.objects
            .get(&object)
            .map(|info| info.cpu)
            .ok_or(SchedulerError::UnknownObject(object))
    }

    pub fn object_label(&self, object: ObjectId) -> String {
        self.objects
            .get(&object)
            .map(|info| info.name.clone())
            .unwrap_or_else(|| object.to_string())
    }

    pub fn set_priority(&mut self, cpu: ResourceId, operation: &str, priority: Priority) -> SchedulerResult<()> {
        self.cpu(cpu)?;
        if let Some(cpu) = self.cpus.get_mut(&cpu) {
            cpu.priorities.insert(operation.to_string(), priority);
        }
        Ok(())
    }

    fn resolve_priority(&self, cpu: ResourceId, operation: &dyn Operation) -> Priority {
        let default = self.config.default_priority;
        self.cpus
            .get(&cpu)
            .map(|c| c.priority_for(operation.name(), operation.priority(), default))
            .unwrap_or(default)
    }

    // ==================== Thread registration ====================

    fn register(&mut self, work: WorkKind, name: String, resource: ResourceId, priority: Priority, depth: usize) -> ThreadId {
        let id = ThreadId::new(self.next_thread);
        self.next_thread += 1;
        let now = self.now();

        let mut state = ThreadState::new(id, name.clone(), work.kind(), priority, resource, now);
        state.depth = depth;
        state.object = work.object();
        state.origin = work.request().cloned();

        self.trace.record(
            now,
            Some(id),
            TraceKind::ThreadCreated {
                name: name.clone(),
                kind: state.kind,
                priority,
            },
        );
        debug!(thread = %id, name = %name, kind = ?state.kind, priority, cpu = %resource, "thread created");

        self.threads.insert(id, state);
        self.unstarted.push((id, work));
        self.metrics.counter(metric::THREADS_SPAWNED, 1);
        self.metrics.gauge(metric::LIVE_THREADS, self.threads.len() as i64);
        id
    }

    pub fn spawn_main(&mut self, entry: Entry) -> ThreadId {
        let (name, priority) = match &entry {
            Entry::Invoke { operation, .. } => (
                format!("main:{}", operation.name()),
                self.resolve_priority(VCPU, operation.as_ref()),
            ),
            Entry::Call {
                target, operation, ..
            } => (
                format!("main:{}.{}", self.object_label(*target), operation.name()),
                self.resolve_priority(VCPU, operation.as_ref()),
            ),
        };
        self.register(WorkKind::Main(entry), name, VCPU, priority, 0)
    }

    pub fn spawn_test(&mut self, steps: Vec<TestStep>) -> ThreadId {
        let priority = self.config.default_priority;
        let id = self.register(WorkKind::Test(steps), "test".to_string(), VCPU, priority, 0);
        self.test_results.insert(id, TestResult::pending());
        id
    }

    fn spawn_callee(&mut self, request: MessageRequest) -> ThreadId {
        let name = format!(
            "{}.{}",
            self.object_label(request.target),
            request.operation.name()
        );
        let priority = self.resolve_priority(request.target_cpu, request.operation.as_ref());
        let cpu = request.target_cpu;
        let depth = request.depth;
        let work = match request.reply {
            ReplyTo::Caller(_) => WorkKind::Object(request),
            ReplyTo::Mailbox | ReplyTo::None => WorkKind::Async(request),
        };
        self.register(work, name, cpu, priority, depth)
    }

    pub fn start_periodic(
        &mut self,
        target: ObjectId,
        operation: Arc<dyn Operation>,
        args: Vec<Value>,
        spec: PeriodicSpec,
    ) -> SchedulerResult<ThreadId> {
        spec.validate()?;
        self.object_cpu(target)?;
        let expected = spec.first_expected(self.now(), &mut self.rng);
        self.spawn_activation(PeriodicWork {
            target,
            operation,
            args,
            spec,
            expected,
            activation: 1,
        })
    }

    fn spawn_activation(&mut self, work: PeriodicWork) -> SchedulerResult<ThreadId> {
        let cpu = self.object_cpu(work.target)?;
        let name = format!(
            "{}.{}#{}",
            self.object_label(work.target),
            work.operation.name(),
            work.activation
        );
        let priority = self.resolve_priority(cpu, work.operation.as_ref());
        Ok(self.register(WorkKind::Periodic(work), name, cpu, priority, 0))
    }

    /// A periodic activation has left its initial alarm: log it and chain the successor
    pub fn activate(&mut self, thread: ThreadId, work: &PeriodicWork) -> SchedulerResult<()> {
        let started = self.now();
        let name = self
            .threads
            .get(&thread)
            .map(|t| t.name.clone())
            .ok_or(SchedulerError::UnknownThread(thread))?;
        self.trace
            .record(started, Some(thread), TraceKind::Activated { name: name.clone() });
        self.metrics.counter(metric::PERIODIC_ACTIVATIONS, 1);
        debug!(thread = %thread, name = %name, expected = work.expected, started, "periodic activation");

        let next = work.spec.next_expected(work.expected, started, &mut self.rng);
        self.metrics
            .observe(metric::ACTIVATION_GAP, next.saturating_sub(work.expected));
        self.spawn_activation(work.successor(next))?;
        Ok(())
    }

    // ==================== State transitions ====================

    pub fn make_runnable(&mut self, thread: ThreadId, resumption: Option<Resumption>) -> SchedulerResult<()> {
        let seq = self.ready_seq;
        self.ready_seq += 1;
        let state = self
            .threads
            .get_mut(&thread)
            .ok_or(SchedulerError::UnknownThread(thread))?;
        state.transition(RunState::Runnable)?;
        state.wake_time = None;
        state.blocker = None;
        state.initial_alarm = false;
        state.ready_seq = seq;
        state.resumption = resumption;
        Ok(())
    }

    /// Park a running thread at a suspension point
    pub fn park(&mut self, thread: ThreadId, park: Park) -> SchedulerResult<()> {
        let now = self.now();
        let state = self
            .threads
            .get_mut(&thread)
            .ok_or(SchedulerError::UnknownThread(thread))?;
        match park {
            Park::TimeStep(wake) => {
                state.transition(RunState::TimeStep)?;
                state.wake_time = wake.map(|t| t.max(now));
            }
            Park::Alarm { until, initial } => {
                state.transition(RunState::Alarm)?;
                state.wake_time = Some(until.max(now));
                state.initial_alarm = initial;
            }
            Park::Waiting(blocker) => {
                state.transition(RunState::Waiting)?;
                state.wake_time = None;
                state.blocker = Some(blocker);
            }
        }
        state.parked_at = now;
        state.resumption = None;
        Ok(())
    }

    pub fn take_resumption(&mut self, thread: ThreadId) -> Option<Resumption> {
        self.threads
            .get_mut(&thread)
            .and_then(|state| state.resumption.take())
    }

    /// Hand a runnable thread its CPU
    pub fn begin_step(&mut self, thread: ThreadId) -> SchedulerResult<()> {
        let now = self.now();
        let state = self
            .threads
            .get_mut(&thread)
            .ok_or(SchedulerError::UnknownThread(thread))?;
        state.transition(RunState::Running)?;
        state.started = true;
        let cpu = state.resource;
        if let Some(cpu) = self.cpus.get_mut(&cpu) {
            if let Some(holder) = cpu.running {
                return Err(SchedulerError::CpuBusy {
                    cpu: cpu.name.clone(),
                    holder,
                });
            }
            cpu.running = Some(thread);
        }
        self.trace.record(now, Some(thread), TraceKind::SwappedIn);
        Ok(())
    }

    /// The body returned `Pending`. Returns the state it parked in, or `None`
    /// if it never reached a suspension point.
    pub fn end_step(&mut self, thread: ThreadId) -> SchedulerResult<Option<RunState>> {
        self.release_cpu(thread);
        let state = self
            .threads
            .get(&thread)
            .map(|t| t.state)
            .ok_or(SchedulerError::UnknownThread(thread))?;
        if state == RunState::Running {
            return Ok(None);
        }
        self.store.commit_thread(thread);
        self.trace
            .record(self.clock.now(), Some(thread), TraceKind::SwappedOut { state });
        Ok(Some(state))
    }

    fn release_cpu(&mut self, thread: ThreadId) {
        for cpu in self.cpus.values_mut() {
            if cpu.running == Some(thread) {
                cpu.running = None;
            }
        }
    }

    /// The body returned: commit, apply the kind policy and forget the thread
    pub fn finish(&mut self, thread: ThreadId, result: RunResult<Value>) -> SchedulerResult<()> {
        self.release_cpu(thread);
        let now = self.now();
        let cancelled = matches!(&result, Err(err) if err.is_cancelled());
        if cancelled {
            self.store.rollback_thread(thread);
        } else {
            self.store.commit_thread(thread);
        }

        let state = self
            .threads
            .get_mut(&thread)
            .ok_or(SchedulerError::UnknownThread(thread))?;
        match &result {
            Ok(_) => {
                state.transition(RunState::Completed)?;
                self.trace.record(now, Some(thread), TraceKind::Completed);
                self.metrics.counter(metric::THREADS_COMPLETED, 1);
                debug!(thread = %thread, "thread completed");
            }
            Err(err) => {
                state.transition(RunState::Failed)?;
                self.trace.record(
                    now,
                    Some(thread),
                    TraceKind::Failed {
                        message: err.to_string(),
                    },
                );
                self.metrics.counter(metric::THREADS_FAILED, 1);
                debug!(thread = %thread, error = %err, "thread failed");
            }
        }

        work::settle(self, thread, result);
        self.forget(thread);
        Ok(())
    }

    /// Stop a thread that will not run again. Its pending writes are discarded.
    pub fn cancel(&mut self, thread: ThreadId, signal: Option<Signal>) -> SchedulerResult<()> {
        self.release_cpu(thread);
        self.store.rollback_thread(thread);
        let now = self.now();
        if let Some(state) = self.threads.get_mut(&thread) {
            if !state.state.is_terminal() {
                state.transition(RunState::Failed)?;
            }
            self.trace.record(now, Some(thread), TraceKind::Cancelled);
        }
        work::settle_cancelled(self, thread, signal);
        self.forget(thread);
        Ok(())
    }

    /// Prepare a parked thread for its final poll after a signal.
    /// Returns false if its body never ran and must not be started.
    pub fn prepare_cancel(&mut self, thread: ThreadId, signal: Signal) -> SchedulerResult<bool> {
        let state = self
            .threads
            .get_mut(&thread)
            .ok_or(SchedulerError::UnknownThread(thread))?;
        if !state.started {
            return Ok(false);
        }
        if state.state != RunState::Running {
            state.transition(RunState::Running)?;
        }
        state.blocker = None;
        state.resumption = Some(Resumption::Signal(signal));
        Ok(true)
    }

    fn forget(&mut self, thread: ThreadId) {
        self.threads.remove(&thread);
        self.metrics
            .gauge(metric::LIVE_THREADS, self.threads.len() as i64);
    }

    // ==================== Messages ====================

    /// Put a call on its way to the target's CPU
    pub fn send_request(
        &mut self,
        from_thread: Option<ThreadId>,
        target: ObjectId,
        operation: Arc<dyn Operation>,
        args: Vec<Value>,
        reply: ReplyTo,
        depth: usize,
    ) -> RunResult<MessageId> {
        if let Some(signal) = self.signal {
            return Err(RunError::cancelled(signal));
        }
        let limit = self.config.max_call_depth;
        if depth > limit {
            return Err(RunError::stack_overflow(depth, limit));
        }
        let target_cpu = self
            .object_cpu(target)
            .map_err(|err| RunError::runtime(err.to_string()))?;
        let sender = from_thread.and_then(|t| self.threads.get(&t));
        let from_cpu = sender.map(|t| t.resource).unwrap_or(VCPU);
        let under_test = matches!(reply, ReplyTo::Caller(_))
            && sender.is_some_and(|t| {
                t.kind == ThreadKind::Test || t.origin.as_ref().is_some_and(|req| req.under_test)
            });
        let route = self
            .route_between(from_cpu, target_cpu)
            .map_err(|err| RunError::runtime(err.to_string()))?;

        let now = self.now();
        let id = MessageId::new(self.next_message);
        self.next_message += 1;
        let mut request = MessageRequest {
            id,
            from_thread,
            from_cpu,
            target,
            target_cpu,
            operation,
            args,
            reply,
            bus: None,
            depth,
            sent_at: now,
            under_test,
        };
        let arrival = match route {
            Route::Local => now,
            Route::Bus(bus) => {
                request.bus = Some(bus);
                let size = request.size();
                self.buses
                    .get_mut(&bus)
                    .map(|b| b.schedule(now, size))
                    .unwrap_or(now)
            }
        };
        self.trace.record(
            now,
            from_thread,
            TraceKind::MessageSent {
                message: id,
                bus: request.bus,
                arrival,
            },
        );
        self.metrics.counter(metric::MESSAGES_SENT, 1);
        debug!(message = %id, target = %target, arrival, "request sent");
        self.in_transit
            .push(arrival, MessageEnvelope::Request(request));
        Ok(id)
    }

    /// Send the result of a call back over the bus that carried the request
    pub fn send_response(&mut self, request: &MessageRequest, result: RunResult<Value>) {
        if !request.expects_reply() {
            return;
        }
        let now = self.now();
        let response = MessageResponse {
            request: request.id,
            result,
            bus: request.bus,
            reply: request.reply,
            to_cpu: request.from_cpu,
        };
        let arrival = match request.bus {
            Some(bus) => {
                let size = response.size();
                self.buses
                    .get_mut(&bus)
                    .map(|b| b.schedule(now, size))
                    .unwrap_or(now)
            }
            None => now,
        };
        self.trace.record(
            now,
            None,
            TraceKind::MessageSent {
                message: request.id,
                bus: request.bus,
                arrival,
            },
        );
        self.metrics.counter(metric::MESSAGES_SENT, 1);
        self.in_transit
            .push(arrival, MessageEnvelope::Response(response));
    }

    /// Deliver every message that has arrived. Returns how many were delivered.
    pub fn deliver_due(&mut self) -> SchedulerResult<usize> {
        let now = self.now();
        let due = self.in_transit.pop_due(now);
        let delivered = due.len();
        for (_, envelope) in due {
            self.trace.record(
                now,
                None,
                TraceKind::MessageDelivered {
                    message: envelope.id(),
                },
            );
            match envelope {
                MessageEnvelope::Request(request) => {
                    self.metrics
                        .observe(metric::MESSAGE_TRANSIT, now - request.sent_at);
                    self.spawn_callee(request);
                }
                MessageEnvelope::Response(response) => self.deliver_response(response)?,
            }
        }
        Ok(delivered)
    }

    fn deliver_response(&mut self, response: MessageResponse) -> SchedulerResult<()> {
        let message = response.request;
        let blocked_on = |state: &ThreadState| {
            state.state == RunState::Waiting
                && match state.blocker {
                    Some(Blocker::Reply(m)) | Some(Blocker::Mailbox(m)) => m == message,
                    _ => false,
                }
        };
        match response.reply {
            ReplyTo::Caller(thread) => {
                if self.threads.get(&thread).is_some_and(blocked_on) {
                    self.make_runnable(thread, Some(Resumption::Reply(response.result)))?;
                } else {
                    debug!(message = %message, thread = %thread, "reply dropped, caller gone");
                }
            }
            ReplyTo::Mailbox => {
                let waiter = self
                    .threads
                    .values()
                    .find(|state| blocked_on(state))
                    .map(|state| state.id);
                match waiter {
                    Some(thread) => {
                        self.make_runnable(thread, Some(Resumption::Reply(response.result)))?
                    }
                    None => {
                        self.mailbox.insert(message, response.result);
                    }
                }
            }
            ReplyTo::None => {}
        }
        Ok(())
    }

    /// How a message travels from one CPU to another
    pub fn route_between(&self, from: ResourceId, to: ResourceId) -> SchedulerResult<Route> {
        resource::route(&self.buses, from, to).ok_or_else(|| SchedulerError::NoRoute {
            from: self.cpu_label(from),
            to: self.cpu_label(to),
        })
    }

    fn cpu_label(&self, id: ResourceId) -> String {
        self.cpus
            .get(&id)
            .map(|cpu| cpu.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    // ==================== Waking ====================

    /// Wake alarms and timesteps that are due. Returns how many woke.
    pub fn wake_due(&mut self) -> SchedulerResult<usize> {
        let now = self.now();
        let due: Vec<ThreadId> = self
            .threads
            .values()
            .filter(|t| match t.state {
                RunState::Alarm => t.wake_time.is_some_and(|w| w <= now),
                RunState::TimeStep => match t.wake_time {
                    Some(w) => w <= now,
                    None => now > t.parked_at,
                },
                _ => false,
            })
            .map(|t| t.id)
            .collect();
        for thread in &due {
            self.make_runnable(*thread, Some(Resumption::Wake))?;
        }
        Ok(due.len())
    }

    /// Wake waiting threads whose permission guard now holds
    pub fn evaluate_guards(&mut self) -> SchedulerResult<usize> {
        let view = self.store.view(None);
        let ready: Vec<ThreadId> = self
            .threads
            .values()
            .filter(|t| t.state == RunState::Waiting)
            .filter(|t| matches!(&t.blocker, Some(Blocker::Guard(guard)) if guard(&view)))
            .map(|t| t.id)
            .collect();
        for thread in &ready {
            self.make_runnable(*thread, Some(Resumption::Wake))?;
        }
        Ok(ready.len())
    }

    /// One runnable thread per CPU, chosen by the CPU's policy
    pub fn select_all(&self) -> Vec<ThreadId> {
        self.cpus
            .values()
            .filter_map(|cpu| cpu.select(&self.threads))
            .collect()
    }

    /// Earliest time at which something can happen, if anything can
    pub fn next_event_time(&self) -> Option<Time> {
        let now = self.now();
        let timed = self
            .threads
            .values()
            .filter_map(|t| match t.state {
                RunState::Alarm | RunState::TimeStep => t.wake_time,
                _ => None,
            })
            .chain(self.in_transit.next_arrival())
            .min();
        let open_timestep = self
            .threads
            .values()
            .any(|t| t.state == RunState::TimeStep && t.wake_time.is_none());
        match timed {
            Some(t) => Some(t),
            None if open_timestep => Some(now + 1),
            None => None,
        }
    }

    pub fn advance_to(&mut self, t: Time) -> SchedulerResult<()> {
        self.clock.advance_to(t)?;
        self.trace.record(t, None, TraceKind::ClockAdvanced);
        self.metrics.counter(metric::CLOCK_ADVANCES, 1);
        debug!(time = t, "clock advanced");
        Ok(())
    }

    // ==================== Signals and errors ====================

    /// Record a fatal error. The first error wins and raises SUSPEND; later
    /// ones are logged and dropped.
    pub fn record_error(&mut self, thread: ThreadId, error: RunError) {
        if let Some((first, _)) = &self.error {
            warn!(thread = %thread, first = %first, error = %error, "discarding secondary error");
            return;
        }
        info!(thread = %thread, error = %error, time = self.now(), "run suspended");
        self.error = Some((thread, error));
        if self.signal.is_none() {
            self.signal = Some(Signal::Suspend);
            self.trace.record(self.now(), Some(thread), TraceKind::Suspended);
        }
    }

    /// No thread can make progress: raise DEADLOCKED and describe the live threads
    pub fn declare_deadlock(&mut self) -> DeadlockReport {
        let now = self.now();
        let blocked: Vec<_> = self.threads.values().map(ThreadState::info).collect();
        let ids: Vec<ThreadId> = blocked.iter().map(|t| t.id).collect();
        warn!(time = now, threads = ?ids, "deadlock detected");
        self.signal = Some(Signal::Deadlocked);
        self.trace
            .record(now, None, TraceKind::Deadlocked { blocked: ids });
        let report = DeadlockReport { time: now, blocked };
        self.deadlock = Some(report.clone());
        report
    }

    // ==================== Test runner ====================

    pub fn record_step(&mut self, thread: ThreadId, outcome: StepOutcome) {
        self.test_results
            .entry(thread)
            .or_insert_with(TestResult::pending)
            .steps
            .push(outcome);
    }

    pub fn finish_test(&mut self, thread: ThreadId, verdict: Verdict) {
        self.test_results
            .entry(thread)
            .or_insert_with(TestResult::pending)
            .verdict = verdict;
    }

    // ==================== Reset ====================

    /// Forget everything that happened in previous runs; keep the topology,
    /// deployments and initial instance variables
    pub fn reset(&mut self) {
        self.clock.reset();
        self.rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        self.signal = None;
        self.error = None;
        self.deadlock = None;
        self.threads.clear();
        self.unstarted.clear();
        self.store.reset();
        self.in_transit.clear();
        self.mailbox.clear();
        self.results.clear();
        self.test_results.clear();
        self.trace.clear();
        self.metrics.clear();
        for cpu in self.cpus.values_mut() {
            cpu.running = None;
        }
        for bus in self.buses.values_mut() {
            bus.reset();
        }
        self.next_thread = 1;
        self.next_message = 1;
        self.ready_seq = 0;
    }
}
