use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::target::Target;

pub type ScopeId = u64;
pub type TaskId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeEntry {
    pub id: ScopeId,
    /// Canonical network, host bits cleared
    pub network: IpNetwork,
    pub blacklisted: bool,
    pub added_at: DateTime<Utc>,
}

impl ScopeEntry {
    pub fn canonical(&self) -> String {
        format!("{}/{}", self.network.network(), self.network.prefix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeChangeKind {
    Added { blacklisted: bool },
    Removed,
    BlacklistToggled { blacklisted: bool },
}

/// One recorded mutation of the scope store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeChange {
    pub at: DateTime<Utc>,
    pub entry_id: ScopeId,
    pub network: IpNetwork,
    pub kind: ScopeChangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Dispatched,
    Complete,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Dispatched => "dispatched",
            TaskState::Complete => "complete",
        }
    }
}

/// A request to scan a target again.
///
/// Fields are public for reading; the state transitions live on the queue
/// so the timestamp/flag pairs can never drift apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescanTask {
    pub id: TaskId,
    pub created_at: DateTime<Utc>,
    pub requested_by: String,
    pub target: Target,
    pub dispatched: bool,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub complete: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub scan_id: Option<String>,
}

impl RescanTask {
    pub(crate) fn new(id: TaskId, target: Target, requested_by: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at: now,
            requested_by: requested_by.to_string(),
            target,
            dispatched: false,
            dispatched_at: None,
            complete: false,
            completed_at: None,
            scan_id: None,
        }
    }

    pub fn state(&self) -> TaskState {
        if self.complete {
            TaskState::Complete
        } else if self.dispatched {
            TaskState::Dispatched
        } else {
            TaskState::Pending
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == TaskState::Pending
    }

    /// Dispatched but not yet complete
    pub fn is_in_flight(&self) -> bool {
        self.state() == TaskState::Dispatched
    }

    pub(crate) fn dispatch(&mut self, now: DateTime<Utc>) {
        self.dispatched = true;
        self.dispatched_at = Some(now);
    }

    pub(crate) fn finish(&mut self, scan_id: &str, now: DateTime<Utc>) {
        self.scan_id = Some(scan_id.to_string());
        self.complete = true;
        self.completed_at = Some(now);
    }

    pub(crate) fn reset(&mut self) {
        self.dispatched = false;
        self.dispatched_at = None;
    }

    /// Invariants that must hold for every stored task
    pub fn is_consistent(&self) -> bool {
        self.dispatched == self.dispatched_at.is_some()
            && self.complete == self.completed_at.is_some()
            && self.complete == self.scan_id.is_some()
            && (!self.complete || self.dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> RescanTask {
        RescanTask::new(1, Target::parse("10.0.0.6").unwrap(), "alice", Utc::now())
    }

    #[test]
    fn test_task_lifecycle_keeps_invariants() {
        let mut t = task();
        assert_eq!(t.state(), TaskState::Pending);
        assert!(t.is_consistent());

        t.dispatch(Utc::now());
        assert_eq!(t.state(), TaskState::Dispatched);
        assert!(t.is_in_flight());
        assert!(t.is_consistent());

        t.reset();
        assert!(t.is_pending());
        assert!(t.is_consistent());

        t.dispatch(Utc::now());
        t.finish("abc123", Utc::now());
        assert_eq!(t.state(), TaskState::Complete);
        assert_eq!(t.scan_id.as_deref(), Some("abc123"));
        assert!(t.is_consistent());
    }

    #[test]
    fn test_scope_entry_canonical() {
        let entry = ScopeEntry {
            id: 1,
            network: crate::target::canonical_network("10.0.0.0/24").unwrap(),
            blacklisted: false,
            added_at: Utc::now(),
        };
        assert_eq!(entry.canonical(), "10.0.0.0/24");
    }
}
