//! Execution-event log

use crate::thread::{RunState, ThreadKind};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use vdm_primitives::{MessageId, Priority, ResourceId, ThreadId, Time};

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceKind {
    /// Thread registered
    ThreadCreated {
        /// Display name
        name: String,
        /// Work kind
        kind: ThreadKind,
        /// Effective priority
        priority: Priority,
    },
    /// Periodic activation started its operation
    Activated {
        /// Activation name
        name: String,
    },
    /// Thread took its CPU
    SwappedIn,
    /// Thread released its CPU at a suspension point
    SwappedOut {
        /// State it parked in
        state: RunState,
    },
    /// Body returned normally
    Completed,
    /// Body failed
    Failed {
        /// Error message
        message: String,
    },
    /// Thread stopped by a signal or at shutdown
    Cancelled,
    /// Request or reply handed to a bus
    MessageSent {
        /// Correlation id
        message: MessageId,
        /// Carrying bus, none for local calls
        bus: Option<ResourceId>,
        /// Arrival time
        arrival: Time,
    },
    /// Request or reply arrived
    MessageDelivered {
        /// Correlation id
        message: MessageId,
    },
    /// Clock moved forward
    ClockAdvanced,
    /// First fatal error recorded
    Suspended,
    /// No thread can make progress
    Deadlocked {
        /// Threads left blocked
        blocked: Vec<ThreadId>,
    },
}

/// One timestamped event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Virtual time
    pub time: Time,
    /// Thread involved
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub thread: Option<ThreadId>,
    /// Event
    #[serde(flatten)]
    pub kind: TraceKind,
}

/// Append-only event log
#[derive(Debug, Clone)]
pub struct TraceLog {
    events: Vec<TraceEvent>,
    enabled: bool,
}

impl TraceLog {
    /// Create a log; a disabled log drops every event
    pub fn new(enabled: bool) -> Self {
        Self {
            events: Vec::new(),
            enabled,
        }
    }

    /// Append an event
    pub fn record(&mut self, time: Time, thread: Option<ThreadId>, kind: TraceKind) {
        if self.enabled {
            self.events.push(TraceEvent { time, thread, kind });
        }
    }

    /// All events in order
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Periodic activations as (time, activation name)
    pub fn activations(&self) -> Vec<(Time, String)> {
        self.events
            .iter()
            .filter_map(|event| match &event.kind {
                TraceKind::Activated { name } => Some((event.time, name.clone())),
                _ => None,
            })
            .collect()
    }

    /// Write one JSON object per line
    pub fn write_json_lines<W: Write>(&self, mut out: W) -> io::Result<()> {
        for event in &self.events {
            serde_json::to_writer(&mut out, event)?;
            out.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Render as JSON lines
    pub fn to_json_lines(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for event in &self.events {
            out.push_str(&serde_json::to_string(event)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Drop every event
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl Default for TraceLog {
    fn default() -> Self {
        Self::new(true)
    }
}
