//! Message envelopes for cross-resource calls

use crate::error::RunResult;
use crate::operation::Operation;
use std::collections::BTreeMap;
use std::sync::Arc;
use vdm_primitives::{MessageId, ObjectId, ResourceId, ThreadId, Time, Value};

/// Where the result of a call goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTo {
    /// Nobody: fire-and-forget asynchronous call
    None,
    /// The calling thread, blocked in WAITING
    Caller(ThreadId),
    /// The reply mailbox, keyed by message id
    Mailbox,
}

/// A call travelling to its target CPU
#[derive(Debug, Clone)]
pub struct MessageRequest {
    /// Correlation id
    pub id: MessageId,
    /// Sending thread (none for environment calls)
    pub from_thread: Option<ThreadId>,
    /// Sending CPU
    pub from_cpu: ResourceId,
    /// Target object
    pub target: ObjectId,
    /// CPU the target is deployed on
    pub target_cpu: ResourceId,
    /// Operation to run
    pub operation: Arc<dyn Operation>,
    /// Arguments
    pub args: Vec<Value>,
    /// Reply routing
    pub reply: ReplyTo,
    /// Bus carrying the request (none for local calls)
    pub bus: Option<ResourceId>,
    /// Call depth of the callee
    pub depth: usize,
    /// Send time
    pub sent_at: Time,
    /// Part of a synchronous call chain started by a test runner
    pub under_test: bool,
}

impl MessageRequest {
    /// Whether the sender expects a result
    pub fn expects_reply(&self) -> bool {
        self.reply != ReplyTo::None
    }

    /// Size on the bus: scalar leaves of the arguments, at least one unit
    pub fn size(&self) -> u64 {
        self.args.iter().map(Value::size).sum::<u64>().max(1)
    }
}

/// A result travelling back over the bus that carried its request
#[derive(Debug, Clone)]
pub struct MessageResponse {
    /// Id of the originating request
    pub request: MessageId,
    /// Result of the call
    pub result: RunResult<Value>,
    /// Bus carrying the reply
    pub bus: Option<ResourceId>,
    /// Reply routing copied from the request
    pub reply: ReplyTo,
    /// CPU the reply is delivered to
    pub to_cpu: ResourceId,
}

impl MessageResponse {
    /// Size on the bus
    pub fn size(&self) -> u64 {
        match &self.result {
            Ok(value) => value.size().max(1),
            Err(_) => 1,
        }
    }
}

/// Unit of cross-resource communication
#[derive(Debug, Clone)]
pub enum MessageEnvelope {
    /// Call request
    Request(MessageRequest),
    /// Call result
    Response(MessageResponse),
}

impl MessageEnvelope {
    /// Correlation id
    pub fn id(&self) -> MessageId {
        match self {
            MessageEnvelope::Request(req) => req.id,
            MessageEnvelope::Response(resp) => resp.request,
        }
    }
}

/// Ordering key of a message in transit: arrival time, then send order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventKey {
    /// Arrival time
    pub time: Time,
    /// Send sequence number
    pub seq: u64,
}

/// Messages in flight, delivered in arrival order
#[derive(Debug, Default)]
pub struct InTransit {
    queue: BTreeMap<EventKey, MessageEnvelope>,
    seq: u64,
}

impl InTransit {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule delivery at `time`
    pub fn push(&mut self, time: Time, envelope: MessageEnvelope) {
        let key = EventKey {
            time,
            seq: self.seq,
        };
        self.seq += 1;
        self.queue.insert(key, envelope);
    }

    /// Remove and return every message arriving at or before `now`
    pub fn pop_due(&mut self, now: Time) -> Vec<(Time, MessageEnvelope)> {
        let mut due = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            if entry.key().time > now {
                break;
            }
            let time = entry.key().time;
            due.push((time, entry.remove()));
        }
        due
    }

    /// Earliest arrival time
    pub fn next_arrival(&self) -> Option<Time> {
        self.queue.keys().next().map(|key| key.time)
    }

    /// Number of messages in flight
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if nothing is in flight
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop every message
    pub fn clear(&mut self) {
        self.queue.clear();
        self.seq = 0;
    }
}
