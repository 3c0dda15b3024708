//! Re-scan task queue.
//!
//! All state lives behind one mutex. `request_rescan` performs its scope
//! check, dedup check and insert under that lock. Scope edits take only the
//! scope lock, so they are not serialized against requests: an edit lands
//! either before the scope check or after the insert. `claim_next` selects
//! and marks a task under the same lock, so no target ever has two
//! incomplete tasks and no task is handed to two agents.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::QueueError;
use crate::scope::ScopeStore;
use crate::target::Target;
use crate::types::{RescanTask, TaskId};

/// Who resets stale dispatched tasks back to pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequeuePolicy {
    /// Only an explicit `requeue` call moves a task back
    #[default]
    Manual,
    /// Stale tasks are requeued whenever the queue is opened
    Automatic,
}

#[derive(Debug, Default)]
struct QueueInner {
    next_id: TaskId,
    tasks: Vec<RescanTask>,
}

#[derive(Debug)]
pub struct TaskQueue {
    scope: Arc<ScopeStore>,
    inner: Mutex<QueueInner>,
}

impl TaskQueue {
    pub fn new(scope: Arc<ScopeStore>) -> Self {
        Self::restore(scope, Vec::new())
    }

    /// Rebuild a queue from persisted tasks
    pub fn restore(scope: Arc<ScopeStore>, tasks: Vec<RescanTask>) -> Self {
        let next_id = tasks.iter().map(|t| t.id).max().map_or(0, |max| max + 1);
        let inconsistent = tasks.iter().filter(|t| !t.is_consistent()).count();
        if inconsistent > 0 {
            log::warn!("[queue] restore: inconsistent_tasks={}", inconsistent);
        }
        log::debug!("[queue] restore: tasks={} next_id={}", tasks.len(), next_id);

        Self {
            scope,
            inner: Mutex::new(QueueInner { next_id, tasks }),
        }
    }

    pub fn scope(&self) -> &Arc<ScopeStore> {
        &self.scope
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn request_rescan(&self, target: &str, requested_by: &str) -> Result<RescanTask, QueueError> {
        let target = Target::parse(target).map_err(|e| QueueError::InvalidNetwork { input: e.input })?;

        // lock order is queue then scope; scope writers never take the queue lock
        let mut inner = self.lock();
        if !self.scope.admits(&target) {
            log::info!("[queue] rescan_rejected: target={} reason=out_of_scope requested_by={}", target, requested_by);
            return Err(QueueError::OutOfScope { target: target.to_string() });
        }

        if let Some(existing) = inner.tasks.iter().find(|t| !t.complete && t.target == target) {
            log::info!("[queue] rescan_rejected: target={} reason=already_queued task_id={}", target, existing.id);
            return Err(QueueError::AlreadyQueued {
                target: target.to_string(),
                task_id: existing.id,
            });
        }

        let task = RescanTask::new(inner.next_id, target, requested_by, Utc::now());
        inner.next_id += 1;
        inner.tasks.push(task.clone());

        log::info!("[queue] rescan_requested: task_id={} target={} requested_by={}", task.id, task.target, requested_by);
        Ok(task)
    }

    /// Hand out the oldest pending task, marking it dispatched
    pub fn claim_next(&self) -> Option<RescanTask> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .iter_mut()
            .filter(|t| t.is_pending())
            .min_by_key(|t| (t.created_at, t.id))?;

        task.dispatch(Utc::now());
        log::info!("[queue] task_dispatched: task_id={} target={}", task.id, task.target);
        Some(task.clone())
    }

    pub fn complete(&self, task_id: TaskId, scan_id: &str) -> Result<RescanTask, QueueError> {
        let scan_id = scan_id.trim();
        if scan_id.is_empty() {
            return Err(QueueError::InvalidScanId);
        }

        let mut inner = self.lock();
        if let Some(owner) = inner.tasks.iter().find(|t| t.scan_id.as_deref() == Some(scan_id)) {
            if owner.id != task_id {
                log::warn!("[queue] complete_rejected: task_id={} scan_id={} reason=duplicate_scan_id owner={}",
                    task_id, scan_id, owner.id);
                return Err(QueueError::DuplicateScanId {
                    scan_id: scan_id.to_string(),
                    owner: owner.id,
                });
            }
        }

        let task = inner
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or(QueueError::NotFound { id: task_id })?;

        if task.complete {
            log::warn!("[queue] complete_rejected: task_id={} reason=already_complete", task_id);
            return Err(QueueError::AlreadyComplete { id: task_id });
        }
        if !task.dispatched {
            log::warn!("[queue] complete_rejected: task_id={} reason=not_dispatched", task_id);
            return Err(QueueError::NotDispatched { id: task_id });
        }

        task.finish(scan_id, Utc::now());
        log::info!("[queue] task_completed: task_id={} target={} scan_id={}", task.id, task.target, scan_id);
        Ok(task.clone())
    }

    /// Move a dispatched, incomplete task back to pending
    pub fn requeue(&self, task_id: TaskId) -> Result<RescanTask, QueueError> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or(QueueError::NotFound { id: task_id })?;

        if task.complete {
            return Err(QueueError::AlreadyComplete { id: task_id });
        }
        if !task.dispatched {
            return Err(QueueError::NotDispatched { id: task_id });
        }

        task.reset();
        log::info!("[queue] task_requeued: task_id={} target={}", task.id, task.target);
        Ok(task.clone())
    }

    /// Dispatched tasks whose dispatch time is older than `older_than`
    pub fn stale(&self, older_than: TimeDelta) -> Vec<RescanTask> {
        self.stale_at(Utc::now(), older_than)
    }

    pub fn stale_at(&self, now: DateTime<Utc>, older_than: TimeDelta) -> Vec<RescanTask> {
        self.select(|t| is_stale(t, now, older_than))
    }

    /// Requeue every stale task in one critical section
    pub fn requeue_stale(&self, older_than: TimeDelta) -> Vec<RescanTask> {
        self.requeue_stale_at(Utc::now(), older_than)
    }

    pub fn requeue_stale_at(&self, now: DateTime<Utc>, older_than: TimeDelta) -> Vec<RescanTask> {
        let mut inner = self.lock();
        let mut requeued = Vec::new();
        for task in inner.tasks.iter_mut().filter(|t| is_stale(t, now, older_than)) {
            task.reset();
            requeued.push(task.clone());
        }
        if !requeued.is_empty() {
            log::info!("[queue] stale_requeued: count={} older_than={}s", requeued.len(), older_than.num_seconds());
        }
        requeued
    }

    fn select(&self, predicate: impl Fn(&RescanTask) -> bool) -> Vec<RescanTask> {
        self.lock().tasks.iter().filter(|t| predicate(t)).cloned().collect()
    }

    pub fn get(&self, task_id: TaskId) -> Option<RescanTask> {
        self.select(|t| t.id == task_id).into_iter().next()
    }

    /// Neither dispatched nor complete
    pub fn pending(&self) -> Vec<RescanTask> {
        self.select(RescanTask::is_pending)
    }

    /// Dispatched but not complete
    pub fn dispatched(&self) -> Vec<RescanTask> {
        self.select(RescanTask::is_in_flight)
    }

    /// Everything not complete: pending plus dispatched
    pub fn incomplete(&self) -> Vec<RescanTask> {
        self.select(|t| !t.complete)
    }

    pub fn incomplete_for(&self, target: &Target) -> Vec<RescanTask> {
        self.select(|t| !t.complete && t.target == *target)
    }

    /// Every task ever created, completed ones included
    pub fn tasks(&self) -> Vec<RescanTask> {
        self.lock().tasks.clone()
    }
}

fn is_stale(task: &RescanTask, now: DateTime<Utc>, older_than: TimeDelta) -> bool {
    task.is_in_flight() && task.dispatched_at.is_some_and(|at| now - at > older_than)
}
