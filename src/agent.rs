//! Agent side of the pull protocol: claim a task, scan it, capture what was
//! found, report completion.

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout};

use crate::capture::CaptureOrchestrator;
use crate::config::AgentConfig;
use crate::queue::TaskQueue;
use crate::scanner::{ScanReport, Scanner};
use crate::services::Service;
use crate::target::Target;
use crate::types::{RescanTask, TaskId};

const SCAN_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
pub const SCAN_ID_LEN: usize = 16;

/// Where an agent gets work from and reports it back to
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn claim_next(&self) -> Result<Option<RescanTask>>;

    async fn complete(&self, task_id: TaskId, scan_id: &str) -> Result<RescanTask>;
}

#[async_trait]
impl TaskSource for TaskQueue {
    async fn claim_next(&self) -> Result<Option<RescanTask>> {
        Ok(TaskQueue::claim_next(self))
    }

    async fn complete(&self, task_id: TaskId, scan_id: &str) -> Result<RescanTask> {
        Ok(TaskQueue::complete(self, task_id, scan_id)?)
    }
}

#[async_trait]
impl<T: TaskSource + ?Sized> TaskSource for Arc<T> {
    async fn claim_next(&self) -> Result<Option<RescanTask>> {
        (**self).claim_next().await
    }

    async fn complete(&self, task_id: TaskId, scan_id: &str) -> Result<RescanTask> {
        (**self).complete(task_id, scan_id).await
    }
}

/// What one agent iteration did. `None` captures were not attempted.
#[derive(Debug, Clone)]
pub struct AgentReport {
    pub task: RescanTask,
    pub scan_id: String,
    pub hosts_up: usize,
    pub services: usize,
    pub web_capture: Option<bool>,
    pub remote_desktop_capture: Option<bool>,
}

pub fn generate_scan_id() -> String {
    let mut rng = rand::rng();
    (0..SCAN_ID_LEN)
        .map(|_| SCAN_ID_CHARSET[rng.random_range(0..SCAN_ID_CHARSET.len())] as char)
        .collect()
}

pub struct Agent<S, D> {
    source: S,
    scanner: D,
    orchestrator: CaptureOrchestrator,
    config: AgentConfig,
}

impl<S: TaskSource, D: Scanner> Agent<S, D> {
    pub fn new(source: S, scanner: D, orchestrator: CaptureOrchestrator, config: AgentConfig) -> Self {
        log::debug!("[agent] new: scanner={} web_screenshots={} remote_desktop_screenshots={}",
            scanner.name(), config.web_screenshots, config.remote_desktop_screenshots);
        Self {
            source,
            scanner,
            orchestrator,
            config,
        }
    }

    /// Claim and process at most one task. A failed scan leaves the task
    /// dispatched; capture failures never prevent completion.
    pub async fn run_once(&self) -> Result<Option<AgentReport>> {
        let Some(task) = self.source.claim_next().await? else {
            log::debug!("[agent] idle: no pending tasks");
            return Ok(None);
        };
        log::info!("[agent] task_claimed: task_id={} target={}", task.id, task.target);

        let started = Instant::now();
        let report = timeout(self.config.scan_timeout(), self.scanner.scan(&task.target))
            .await
            .map_err(|_| eyre!("Scan of {} exceeded {}s", task.target, self.config.scan_timeout_secs))?
            .wrap_err_with(|| format!("Scan failed for task {} ({})", task.id, task.target))?;
        log::info!("[agent] scan_finished: task_id={} hosts_up={} services={} duration={}ms",
            task.id, report.hosts.len(), report.service_count(), started.elapsed().as_millis());

        let scan_id = generate_scan_id();
        let (web_capture, remote_desktop_capture) = self.capture(&task.target, &scan_id, &report).await;

        let completed = self
            .source
            .complete(task.id, &scan_id)
            .await
            .wrap_err_with(|| format!("Failed to report completion of task {}", task.id))?;
        log::info!("[agent] task_reported: task_id={} scan_id={} web_capture={:?} remote_desktop_capture={:?}",
            task.id, scan_id, web_capture, remote_desktop_capture);

        Ok(Some(AgentReport {
            task: completed,
            scan_id,
            hosts_up: report.hosts.len(),
            services: report.service_count(),
            web_capture,
            remote_desktop_capture,
        }))
    }

    async fn capture(&self, target: &Target, scan_id: &str, report: &ScanReport) -> (Option<bool>, Option<bool>) {
        // artifacts are keyed by scan id alone, so only single hosts are captured
        let Some(address) = target.address() else {
            log::info!("[agent] captures_skipped: target={} reason=network_target", target);
            return (None, None);
        };
        let services = report.services_for(address);

        let web_services: Vec<Service> = services.iter().filter(|s| s.is_web()).cloned().collect();
        let web = if self.config.web_screenshots && !web_services.is_empty() {
            Some(self.orchestrator.capture_web(address, scan_id, &web_services).await)
        } else {
            None
        };

        let remote_desktop = if self.config.remote_desktop_screenshots && services.iter().any(Service::is_remote_desktop) {
            Some(self.orchestrator.capture_remote_desktop(address, scan_id).await)
        } else {
            None
        };

        (web, remote_desktop)
    }

    /// Poll forever, backing off for the poll interval whenever there is no
    /// work or an iteration fails.
    pub async fn run(&self) -> Result<()> {
        log::info!("[agent] run: poll_interval={}s", self.config.poll_interval().as_secs());
        let mut processed = 0u64;

        loop {
            match self.run_once().await {
                Ok(Some(_)) => {
                    processed += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e) => log::error!("[agent] iteration_failed: processed={} error={:#}", processed, e),
            }
            sleep(self.config.poll_interval()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CaptureConfig, ToolCommand};
    use crate::scanner::HostServices;
    use crate::scope::ScopeStore;
    use crate::services::Transport;
    use std::ffi::OsString;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FixedScanner {
        services: Vec<Service>,
    }

    #[async_trait]
    impl Scanner for FixedScanner {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn scan(&self, target: &Target) -> Result<ScanReport> {
            let hosts = target
                .hosts()
                .map(|address| HostServices {
                    address,
                    services: self.services.clone(),
                })
                .collect();
            Ok(ScanReport {
                target: *target,
                hosts,
                duration: Duration::from_millis(1),
            })
        }
    }

    struct BrokenScanner;

    #[async_trait]
    impl Scanner for BrokenScanner {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn scan(&self, _target: &Target) -> Result<ScanReport> {
            eyre::bail!("nmap exploded")
        }
    }

    fn queue() -> Arc<TaskQueue> {
        let scope = Arc::new(ScopeStore::new());
        scope.add("10.0.0.0/24", false).unwrap();
        Arc::new(TaskQueue::new(scope))
    }

    fn orchestrator(dir: &TempDir, web: &str, remote: &str, display: bool) -> CaptureOrchestrator {
        let sh = |script: &str| ToolCommand::new("sh").with_args(["-c", script, "tool"]);
        let config = CaptureConfig {
            data_dir: dir.path().to_path_buf(),
            hard_timeout_secs: 5,
            grace_period_ms: 0,
            web_tool: sh(web),
            remote_desktop_tool: sh(remote),
            ..CaptureConfig::default()
        };
        CaptureOrchestrator::new(config).with_display(display.then(|| OsString::from(":99")))
    }

    fn all_services() -> Vec<Service> {
        vec![
            Service::new("ssh", 22, Transport::Tcp),
            Service::new("http", 80, Transport::Tcp),
            Service::new("https", 443, Transport::Tcp),
            Service::new("vnc", 5900, Transport::Tcp),
        ]
    }

    #[test]
    fn test_generate_scan_id() {
        let id = generate_scan_id();
        assert_eq!(id.len(), SCAN_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(generate_scan_id(), generate_scan_id());
    }

    #[tokio::test]
    async fn test_run_once_idle() {
        let dir = TempDir::new().unwrap();
        let agent = Agent::new(
            queue(),
            FixedScanner { services: vec![] },
            orchestrator(&dir, "true", "true", true),
            AgentConfig::default(),
        );
        assert!(agent.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_once_captures_and_completes() {
        let dir = TempDir::new().unwrap();
        let queue = queue();
        let task = queue.request_rescan("10.0.0.6", "alice").unwrap();

        let agent = Agent::new(
            Arc::clone(&queue),
            FixedScanner { services: all_services() },
            orchestrator(&dir, r#"mkdir -p "$4" && cat > "$4/input.txt""#, r#"touch "$4""#, true),
            AgentConfig::default(),
        );

        let report = agent.run_once().await.unwrap().unwrap();
        assert_eq!(report.task.id, task.id);
        assert!(report.task.complete);
        assert_eq!(report.task.scan_id.as_deref(), Some(report.scan_id.as_str()));
        assert_eq!(report.web_capture, Some(true));
        assert_eq!(report.remote_desktop_capture, Some(true));
        assert_eq!(report.services, 4);

        let input = std::fs::read_to_string(dir.path().join(format!("web.{}", report.scan_id)).join("input.txt")).unwrap();
        assert_eq!(input, "http://10.0.0.6\nhttps://10.0.0.6");
        assert!(dir.path().join(format!("{}.vnc.jpg", report.scan_id)).exists());
        assert!(queue.incomplete().is_empty());
    }

    #[tokio::test]
    async fn test_capture_failures_still_complete() {
        let dir = TempDir::new().unwrap();
        let queue = queue();
        queue.request_rescan("10.0.0.6", "alice").unwrap();

        let agent = Agent::new(
            Arc::clone(&queue),
            FixedScanner { services: all_services() },
            orchestrator(&dir, "exit 1", "true", false),
            AgentConfig::default(),
        );

        let report = agent.run_once().await.unwrap().unwrap();
        assert_eq!(report.web_capture, Some(false));
        assert_eq!(report.remote_desktop_capture, Some(false));
        assert!(report.task.complete);
    }

    #[tokio::test]
    async fn test_disabled_captures_are_not_attempted() {
        let dir = TempDir::new().unwrap();
        let queue = queue();
        queue.request_rescan("10.0.0.6", "alice").unwrap();

        let config = AgentConfig {
            web_screenshots: false,
            remote_desktop_screenshots: false,
            ..AgentConfig::default()
        };
        let agent = Agent::new(
            Arc::clone(&queue),
            FixedScanner { services: all_services() },
            orchestrator(&dir, "exit 1", "exit 1", true),
            config,
        );

        let report = agent.run_once().await.unwrap().unwrap();
        assert_eq!(report.web_capture, None);
        assert_eq!(report.remote_desktop_capture, None);
    }

    #[tokio::test]
    async fn test_network_targets_skip_captures() {
        let dir = TempDir::new().unwrap();
        let queue = queue();
        queue.request_rescan("10.0.0.0/30", "alice").unwrap();

        let agent = Agent::new(
            Arc::clone(&queue),
            FixedScanner { services: all_services() },
            orchestrator(&dir, "exit 1", "exit 1", true),
            AgentConfig::default(),
        );

        let report = agent.run_once().await.unwrap().unwrap();
        assert_eq!(report.hosts_up, 4);
        assert_eq!(report.web_capture, None);
        assert!(report.task.complete);
    }

    #[tokio::test]
    async fn test_scan_failure_leaves_task_dispatched() {
        let dir = TempDir::new().unwrap();
        let queue = queue();
        let task = queue.request_rescan("10.0.0.6", "alice").unwrap();

        let agent = Agent::new(
            Arc::clone(&queue),
            BrokenScanner,
            orchestrator(&dir, "true", "true", true),
            AgentConfig::default(),
        );

        assert!(agent.run_once().await.is_err());
        let stored = queue.get(task.id).unwrap();
        assert!(stored.is_in_flight());
        assert_eq!(queue.dispatched().len(), 1);
    }
}
