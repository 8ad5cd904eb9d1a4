//! Process lifecycle events and the handler registry that reacts to them

use crate::config::{Action, LaunchContext, OutputPattern};
use chrono::{DateTime, Local};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

/// Session-unique process identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which output stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// What happened to a process
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Process is running
    ProcessStarted { pid: Option<u32> },
    /// Process exited; `None` when killed by a signal
    ProcessExited { code: Option<i32> },
    /// One line of stdout or stderr
    OutputLine { text: String, stream: OutputStream },
    /// Process could not be started
    SpawnFailed { error: String },
}

/// A lifecycle event emitted by the process supervisor
#[derive(Debug, Clone)]
pub struct Event {
    pub process: ProcessId,
    pub timestamp: DateTime<Local>,
    pub kind: EventKind,
}

impl Event {
    pub fn new(process: ProcessId, kind: EventKind) -> Self {
        Self {
            process,
            timestamp: Local::now(),
            kind,
        }
    }
}

/// Timer identifier for delayed actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// Everything the dispatch loop receives
#[derive(Debug, Clone)]
pub enum Notification {
    Process(Event),
    TimerElapsed(TimerId),
}

/// Event kinds a handler can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFilter {
    Start,
    Exit,
    Output,
    SpawnFailed,
}

/// Predicate over events
#[derive(Debug, Clone)]
pub struct EventMatcher {
    pub filter: EventFilter,
    /// Fully qualified process name (any process when `None`)
    pub target: Option<String>,
    pub pattern: Option<OutputPattern>,
}

impl EventMatcher {
    pub fn matches(&self, event: &Event, process_name: &str) -> bool {
        if let Some(target) = &self.target {
            if target != process_name {
                return false;
            }
        }

        match (&event.kind, self.filter) {
            (EventKind::ProcessStarted { .. }, EventFilter::Start) => true,
            (EventKind::ProcessExited { .. }, EventFilter::Exit) => true,
            (EventKind::SpawnFailed { .. }, EventFilter::SpawnFailed) => true,
            (EventKind::OutputLine { text, .. }, EventFilter::Output) => self
                .pattern
                .as_ref()
                .map_or(true, |pattern| pattern.is_match(text)),
            _ => false,
        }
    }
}

/// Actions to run with the scope they were registered in
#[derive(Debug, Clone)]
pub struct Reaction {
    pub actions: Arc<[Action]>,
    pub context: LaunchContext,
    pub include_stack: Vec<String>,
}

#[derive(Debug)]
struct RegisteredHandler {
    id: u64,
    matcher: EventMatcher,
    reaction: Reaction,
    once: bool,
}

/// Registered handlers, delivered to in registration order
#[derive(Debug, Default)]
pub struct EventBus {
    handlers: Vec<RegisteredHandler>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; returns its id
    pub fn register(&mut self, matcher: EventMatcher, reaction: Reaction, once: bool) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        log::debug!(
            "Registered handler {} for {:?} on {}",
            id,
            matcher.filter,
            matcher.target.as_deref().unwrap_or("<any>")
        );
        self.handlers.push(RegisteredHandler {
            id,
            matcher,
            reaction,
            once,
        });
        id
    }

    /// Reactions of every handler accepting `event`, in registration order.
    /// One-shot handlers are removed once they have matched.
    pub fn dispatch(&mut self, event: &Event, process_name: &str) -> Vec<Reaction> {
        let mut reactions = Vec::new();
        self.handlers.retain(|handler| {
            if !handler.matcher.matches(event, process_name) {
                return true;
            }
            log::debug!("Handler {} matched {:?} from {}", handler.id, event.kind, process_name);
            reactions.push(handler.reaction.clone());
            !handler.once
        });
        reactions
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}
