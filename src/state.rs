//! JSON state file shared by CLI invocations and file-backed agents.
//!
//! Each access holds an exclusive `flock` on `<state>.lock` for the whole
//! load, mutate, save cycle, so separate processes get the same
//! check-then-act atomicity the in-memory stores give threads.

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::spawn_blocking;

use crate::agent::TaskSource;
use crate::config::QueueConfig;
use crate::queue::{RequeuePolicy, TaskQueue};
use crate::scope::ScopeStore;
use crate::types::{RescanTask, ScopeChange, ScopeEntry, TaskId};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub scope: Vec<ScopeEntry>,
    #[serde(default)]
    pub scope_history: Vec<ScopeChange>,
    #[serde(default)]
    pub tasks: Vec<RescanTask>,
}

impl Snapshot {
    pub fn capture(queue: &TaskQueue) -> Self {
        let scope = queue.scope();
        Self {
            scope: scope.entries(),
            scope_history: scope.history(),
            tasks: queue.tasks(),
        }
    }

    pub fn into_queue(self) -> TaskQueue {
        let scope = Arc::new(ScopeStore::restore(self.scope, self.scope_history));
        TaskQueue::restore(scope, self.tasks)
    }
}

#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
    queue: QueueConfig,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>, queue: QueueConfig) -> Self {
        Self {
            path: path.into(),
            queue,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn lock(&self) -> Result<Flock<File>> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .wrap_err_with(|| format!("Failed to create state directory {}", parent.display()))?;
        }
        let lock_path = self.sibling(".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .wrap_err_with(|| format!("Failed to open lock file {}", lock_path.display()))?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| eyre!("Failed to lock {}: {}", lock_path.display(), errno))
    }

    fn load_snapshot(&self) -> Result<Snapshot> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .wrap_err_with(|| format!("Corrupt state file {}", self.path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("[state] load: path={} missing, starting empty", self.path.display());
                Ok(Snapshot::default())
            }
            Err(e) => Err(e).wrap_err_with(|| format!("Failed to read state file {}", self.path.display())),
        }
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let tmp = self.sibling(".tmp");
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        fs::write(&tmp, bytes).wrap_err_with(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .wrap_err_with(|| format!("Failed to replace state file {}", self.path.display()))?;
        log::trace!("[state] saved: path={} scope={} tasks={}",
            self.path.display(), snapshot.scope.len(), snapshot.tasks.len());
        Ok(())
    }

    fn open_queue(&self) -> Result<TaskQueue> {
        let queue = self.load_snapshot()?.into_queue();
        if self.queue.requeue == RequeuePolicy::Automatic {
            queue.requeue_stale(self.queue.stale_after());
        }
        Ok(queue)
    }

    /// Run `f` against the stored queue and persist whatever it changed
    pub fn transact<T>(&self, f: impl FnOnce(&TaskQueue) -> T) -> Result<T> {
        let _lock = self.lock()?;
        let queue = self.open_queue()?;
        let out = f(&queue);
        self.save_snapshot(&Snapshot::capture(&queue))?;
        Ok(out)
    }

    /// Run `f` against the stored queue without writing back
    pub fn inspect<T>(&self, f: impl FnOnce(&TaskQueue) -> T) -> Result<T> {
        let _lock = self.lock()?;
        let queue = self.open_queue()?;
        Ok(f(&queue))
    }
}

impl StateFile {
    /// `transact` on the blocking pool; `flock` and the file I/O block
    async fn transact_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&TaskQueue) -> T + Send + 'static,
    {
        let state = self.clone();
        spawn_blocking(move || state.transact(f))
            .await
            .wrap_err("State file task panicked")?
    }
}

#[async_trait]
impl TaskSource for StateFile {
    async fn claim_next(&self) -> Result<Option<RescanTask>> {
        self.transact_blocking(TaskQueue::claim_next).await
    }

    async fn complete(&self, task_id: TaskId, scan_id: &str) -> Result<RescanTask> {
        let scan_id = scan_id.to_string();
        Ok(self.transact_blocking(move |queue| queue.complete(task_id, &scan_id)).await??)
    }
}
