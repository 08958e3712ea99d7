//! Bounded log of controller events

use std::collections::VecDeque;
use std::fmt;

use fleet_state::NodeId;
use serde::{Deserialize, Serialize};

/// What happened.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A node's effective state changed.
    NodeStateChange,

    /// An operator override was set or cleared.
    WantedStateChange,

    /// A new cluster state version was published.
    PublishedVersion,

    /// This replica became master.
    MastershipGained,

    /// This replica stopped being master.
    MastershipLost,

    /// Feed was blocked or unblocked.
    FeedBlockChange,

    /// A bundle could not be delivered to a node.
    DeliveryFailure,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A logged event.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// When it happened.
    pub timestamp_ms: u64,
    /// What happened.
    pub kind: EventKind,
    /// Node concerned, if any.
    pub node: Option<NodeId>,
    /// Details.
    pub description: String,
}

/// Append-only event log keeping the most recent `max_size` events.
#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<Event>,
    max_size: usize,
}

impl EventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            events: VecDeque::new(),
            max_size: max_size.max(1),
        }
    }

    /// Appends an event, dropping the oldest when full.
    pub fn add(&mut self, event: Event) {
        if self.events.len() >= self.max_size {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Appends an event built from its parts.
    pub fn record(
        &mut self,
        timestamp_ms: u64,
        kind: EventKind,
        node: Option<NodeId>,
        description: impl Into<String>,
    ) {
        self.add(Event {
            timestamp_ms,
            kind,
            node,
            description: description.into(),
        });
    }

    /// All retained events, newest first.
    #[must_use]
    pub fn entries(&self) -> Vec<Event> {
        self.events.iter().rev().cloned().collect()
    }

    /// Retained events about `node`, newest first.
    #[must_use]
    pub fn entries_for_node(&self, node: &NodeId) -> Vec<Event> {
        self.events
            .iter()
            .rev()
            .filter(|event| event.node.as_ref() == Some(node))
            .cloned()
            .collect()
    }

    /// Number of retained events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
