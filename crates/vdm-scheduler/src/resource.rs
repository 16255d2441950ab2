//! CPU and bus resources

use crate::config::{BusConfig, CpuConfig};
use crate::thread::{RunState, ThreadState};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use vdm_primitives::{Priority, ResourceId, ThreadId, Time};

/// The virtual CPU hosting main, test and environment threads
pub const VCPU: ResourceId = ResourceId(0);

/// The virtual bus linking the virtual CPU to every CPU
pub const VBUS: ResourceId = ResourceId(1);

/// CPU scheduling discipline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// Highest priority first, ties by creation order
    #[default]
    FixedPriority,
    /// Order in which threads became runnable
    Fcfs,
}

/// A virtual processor: runs at most one thread at a time
#[derive(Debug, Clone)]
pub struct Cpu {
    pub(crate) id: ResourceId,
    pub(crate) name: String,
    pub(crate) policy: Policy,
    pub(crate) speed: u64,
    pub(crate) is_virtual: bool,
    pub(crate) running: Option<ThreadId>,
    pub(crate) priorities: HashMap<String, Priority>,
}

impl Cpu {
    pub(crate) fn new(id: ResourceId, config: &CpuConfig) -> Self {
        Self {
            id,
            name: config.name.clone(),
            policy: config.policy,
            speed: config.speed.max(1),
            is_virtual: false,
            running: None,
            priorities: HashMap::new(),
        }
    }

    pub(crate) fn virtual_cpu() -> Self {
        let mut cpu = Self::new(VCPU, &CpuConfig::new("vCPU"));
        cpu.is_virtual = true;
        cpu
    }

    /// Resource id
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scheduling discipline
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Thread currently holding the CPU
    pub fn running(&self) -> Option<ThreadId> {
        self.running
    }

    /// Time needed to execute `cycles` on this CPU
    pub fn cycles_to_time(&self, cycles: u64) -> Time {
        cycles.div_ceil(self.speed)
    }

    /// Effective priority of an operation on this CPU: a CPU override wins,
    /// then the operation's declared priority, then `default`
    pub fn priority_for(&self, operation: &str, declared: Option<Priority>, default: Priority) -> Priority {
        self.priorities
            .get(operation)
            .copied()
            .or(declared)
            .unwrap_or(default)
    }

    /// Pick the next thread to run among the runnable threads bound to this CPU
    pub(crate) fn select(&self, threads: &BTreeMap<ThreadId, ThreadState>) -> Option<ThreadId> {
        let runnable = threads
            .values()
            .filter(|t| t.resource == self.id && t.state == RunState::Runnable);
        match self.policy {
            Policy::FixedPriority => runnable
                .max_by_key(|t| (t.priority, Reverse(t.id)))
                .map(|t| t.id),
            Policy::Fcfs => runnable.min_by_key(|t| (t.ready_seq, t.id)).map(|t| t.id),
        }
    }
}

/// A virtual communication link
#[derive(Debug, Clone)]
pub struct Bus {
    pub(crate) id: ResourceId,
    pub(crate) name: String,
    pub(crate) cpus: BTreeSet<ResourceId>,
    pub(crate) latency: Time,
    pub(crate) speed: u64,
    pub(crate) busy_until: Time,
    pub(crate) is_virtual: bool,
    pub(crate) messages: u64,
}

impl Bus {
    pub(crate) fn new(id: ResourceId, config: &BusConfig) -> Self {
        Self {
            id,
            name: config.name.clone(),
            cpus: config.cpus.iter().copied().collect(),
            latency: config.latency,
            speed: config.speed,
            busy_until: 0,
            is_virtual: false,
            messages: 0,
        }
    }

    pub(crate) fn virtual_bus() -> Self {
        let mut bus = Self::new(VBUS, &BusConfig::new("vBUS", vec![VCPU]));
        bus.is_virtual = true;
        bus
    }

    /// Resource id
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Messages carried so far
    pub fn messages(&self) -> u64 {
        self.messages
    }

    /// Whether this bus links `a` and `b`. The virtual bus links the virtual
    /// CPU to everything, and nothing else.
    pub fn connects(&self, a: ResourceId, b: ResourceId) -> bool {
        if self.is_virtual {
            return a == VCPU || b == VCPU;
        }
        self.cpus.contains(&a) && self.cpus.contains(&b)
    }

    /// Transit time of a message of `size` value units
    pub fn transit(&self, size: u64) -> Time {
        let transfer = if self.speed == 0 {
            0
        } else {
            size.div_ceil(self.speed)
        };
        self.latency + transfer
    }

    /// Reserve the bus for a message sent at `now`; returns its arrival time.
    /// Messages are carried one at a time in send order.
    pub(crate) fn schedule(&mut self, now: Time, size: u64) -> Time {
        let start = now.max(self.busy_until);
        let arrival = start + self.transit(size);
        self.busy_until = arrival;
        self.messages += 1;
        arrival
    }

    pub(crate) fn reset(&mut self) {
        self.busy_until = 0;
        self.messages = 0;
    }
}

/// How a message travels between two CPUs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Same CPU, no bus involved
    Local,
    /// Over the given bus
    Bus(ResourceId),
}

/// Find the route from `from` to `to`: the lowest-id bus connecting both
pub fn route(buses: &BTreeMap<ResourceId, Bus>, from: ResourceId, to: ResourceId) -> Option<Route> {
    if from == to {
        return Some(Route::Local);
    }
    buses
        .values()
        .find(|bus| bus.connects(from, to))
        .map(|bus| Route::Bus(bus.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadKind;

    fn thread(id: u64, priority: Priority, ready_seq: u64) -> ThreadState {
        let mut t = ThreadState::new(
            ThreadId::new(id),
            format!("t{}", id),
            ThreadKind::Async,
            priority,
            ResourceId::new(2),
            0,
        );
        t.state = RunState::Runnable;
        t.ready_seq = ready_seq;
        t
    }

    fn threads(list: Vec<ThreadState>) -> BTreeMap<ThreadId, ThreadState> {
        list.into_iter().map(|t| (t.id, t)).collect()
    }

    #[test]
    fn test_fixed_priority_selection() {
        let cpu = Cpu::new(ResourceId::new(2), &CpuConfig::new("cpu"));
        let ts = threads(vec![thread(1, 1, 0), thread(2, 5, 1), thread(3, 5, 2)]);
        assert_eq!(cpu.select(&ts), Some(ThreadId::new(2)));
    }

    #[test]
    fn test_fcfs_selection() {
        let cpu = Cpu::new(
            ResourceId::new(2),
            &CpuConfig::new("cpu").with_policy(Policy::Fcfs),
        );
        let ts = threads(vec![thread(1, 9, 7), thread(2, 1, 3)]);
        assert_eq!(cpu.select(&ts), Some(ThreadId::new(2)));
    }

    #[test]
    fn test_select_ignores_other_cpus_and_states() {
        let cpu = Cpu::new(ResourceId::new(2), &CpuConfig::new("cpu"));
        let mut waiting = thread(1, 9, 0);
        waiting.state = RunState::Waiting;
        let mut elsewhere = thread(2, 9, 0);
        elsewhere.resource = ResourceId::new(3);
        assert_eq!(cpu.select(&threads(vec![waiting, elsewhere])), None);
    }

    #[test]
    fn test_priority_resolution() {
        let mut cpu = Cpu::new(ResourceId::new(2), &CpuConfig::new("cpu"));
        assert_eq!(cpu.priority_for("op", None, 1), 1);
        assert_eq!(cpu.priority_for("op", Some(4), 1), 4);
        cpu.priorities.insert("op".into(), 9);
        assert_eq!(cpu.priority_for("op", Some(4), 1), 9);
    }

    #[test]
    fn test_cycles_round_up() {
        let cpu = Cpu::new(ResourceId::new(2), &CpuConfig::new("cpu").with_speed(4));
        assert_eq!(cpu.cycles_to_time(0), 0);
        assert_eq!(cpu.cycles_to_time(4), 1);
        assert_eq!(cpu.cycles_to_time(5), 2);
    }

    // ==================== Buses ====================

    #[test]
    fn test_bus_is_fcfs() {
        let config = BusConfig::new("bus", vec![ResourceId::new(2), ResourceId::new(3)])
            .with_latency(2)
            .with_speed(2);
        let mut bus = Bus::new(ResourceId::new(4), &config);
        assert_eq!(bus.transit(3), 4);
        assert_eq!(bus.schedule(0, 3), 4);
        // second message queues behind the first
        assert_eq!(bus.schedule(1, 1), 7);
        assert_eq!(bus.schedule(20, 0), 22);
        assert_eq!(bus.messages(), 3);
    }

    #[test]
    fn test_routes() {
        let (c1, c2, c3) = (ResourceId::new(2), ResourceId::new(3), ResourceId::new(4));
        let mut buses = BTreeMap::new();
        buses.insert(VBUS, Bus::virtual_bus());
        let b = ResourceId::new(5);
        buses.insert(b, Bus::new(b, &BusConfig::new("bus", vec![c1, c2])));

        assert_eq!(route(&buses, c1, c1), Some(Route::Local));
        assert_eq!(route(&buses, VCPU, c3), Some(Route::Bus(VBUS)));
        assert_eq!(route(&buses, c2, VCPU), Some(Route::Bus(VBUS)));
        assert_eq!(route(&buses, c1, c2), Some(Route::Bus(b)));
        assert_eq!(route(&buses, c1, c3), None);
    }
}
