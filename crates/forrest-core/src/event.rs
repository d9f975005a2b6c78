//! # Change Events, Pending Queue, Watermark
//!
//! ## Event Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Change Event Lifecycle                            │
//! │                                                                         │
//! │  server emits ──► Gateway.ingest ──► PendingQueue[branch].push         │
//! │                                           │                             │
//! │                                           ▼                             │
//! │                                SyncEngine pass (per branch)             │
//! │                                 │                      │                │
//! │                             handled                 failed              │
//! │                                 │                      │                │
//! │                                 ▼                      ▼                │
//! │                    remove_handled(branch)      stays pending,           │
//! │                                               retried next pass        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::record::RecordId;
use crate::time::Timestamp;

// =============================================================================
// Action
// =============================================================================

/// What happened to a record on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Action {
    /// Record created.
    Post,
    /// Record replaced.
    Put,
    /// Record removed.
    Delete,
    /// Record moved out of the live collection (removed locally).
    Archive,
}

impl Action {
    /// Returns true for actions that remove the record locally without a fetch.
    pub fn is_removal(&self) -> bool {
        matches!(self, Action::Delete | Action::Archive)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Post => write!(f, "post"),
            Action::Put => write!(f, "put"),
            Action::Delete => write!(f, "delete"),
            Action::Archive => write!(f, "archive"),
        }
    }
}

impl FromStr for Action {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post" => Ok(Action::Post),
            "put" => Ok(Action::Put),
            "delete" => Ok(Action::Delete),
            "archive" => Ok(Action::Archive),
            other => Err(CoreError::InvalidAction(other.to_string())),
        }
    }
}

impl TryFrom<String> for Action {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// =============================================================================
// Change Event
// =============================================================================

/// A change notification for one record of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Affected record.
    pub id: RecordId,
    /// Collection name.
    pub branch: String,
    /// What happened.
    pub action: Action,
    /// Server time of the change.
    pub time: Timestamp,
}

impl ChangeEvent {
    /// Creates a change event.
    pub fn new(
        id: impl Into<RecordId>,
        branch: impl Into<String>,
        action: Action,
        time: impl Into<Timestamp>,
    ) -> Self {
        ChangeEvent {
            id: id.into(),
            branch: branch.into(),
            action,
            time: time.into(),
        }
    }
}

// =============================================================================
// Pending Queue
// =============================================================================

/// Events received but not yet applied, grouped by collection.
///
/// Within a branch, events keep arrival order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingQueue(BTreeMap<String, Vec<ChangeEvent>>);

impl PendingQueue {
    /// Appends an event to its branch.
    pub fn push(&mut self, event: ChangeEvent) {
        self.0.entry(event.branch.clone()).or_default().push(event);
    }

    /// Appends events in order.
    pub fn extend(&mut self, events: impl IntoIterator<Item = ChangeEvent>) {
        for event in events {
            self.push(event);
        }
    }

    /// Returns the pending events of one branch.
    pub fn slice(&self, branch: &str) -> &[ChangeEvent] {
        self.0.get(branch).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Removes the given events from `branch`, one queued occurrence per
    /// handled event, leaving everything else (including newer events for the
    /// same record) in place. Returns how many were removed.
    pub fn remove_handled(&mut self, branch: &str, handled: &[ChangeEvent]) -> usize {
        let Some(events) = self.0.get_mut(branch) else {
            return 0;
        };

        let mut removed = 0;
        for done in handled {
            if let Some(pos) = events.iter().position(|e| e == done) {
                events.remove(pos);
                removed += 1;
            }
        }

        if events.is_empty() {
            self.0.remove(branch);
        }
        removed
    }

    /// Total number of pending events across branches.
    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    /// Returns true if no branch has pending events.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    /// Names of branches with pending events.
    pub fn branches(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

// =============================================================================
// Watermark
// =============================================================================

/// Time of the newest event the process has ingested. Never moves backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(Option<Timestamp>);

impl Watermark {
    /// Creates a watermark at `time`.
    pub fn at(time: Timestamp) -> Self {
        Watermark(Some(time))
    }

    /// Returns the watermark time, if any event was ever seen.
    pub fn get(&self) -> Option<Timestamp> {
        self.0
    }

    /// Moves the watermark to `time` if that is newer. Returns true on change.
    pub fn advance(&mut self, time: Timestamp) -> bool {
        match self.0 {
            Some(current) if current >= time => false,
            _ => {
                self.0 = Some(time);
                true
            }
        }
    }

    /// The `{since}` URL segment: the time, or empty when none.
    pub fn since_segment(&self) -> String {
        self.0.map(|t| t.to_string()).unwrap_or_default()
    }
}
