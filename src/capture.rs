//! Bounded screenshot captures.
//!
//! Every capture spawns one external tool in its own process group and
//! returns only after that child has been reaped, whether it exited on its
//! own, was killed at the ceiling, or failed to drive. Anything the tool
//! left behind in its process group is killed before returning.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};

use crate::config::{CaptureConfig, ToolCommand};
use crate::error::CaptureError;
use crate::services::Service;

#[derive(Debug, Clone)]
pub struct CaptureOrchestrator {
    config: CaptureConfig,
    display: Option<OsString>,
}

impl CaptureOrchestrator {
    /// The virtual display is taken from `DISPLAY` at construction
    pub fn new(config: CaptureConfig) -> Self {
        let display = std::env::var_os("DISPLAY").filter(|d| !d.is_empty());
        log::debug!("[capture] new: data_dir={} hard_timeout={}s display={:?}",
            config.data_dir.display(), config.hard_timeout_secs, display);
        Self { config, display }
    }

    pub fn with_display(mut self, display: Option<OsString>) -> Self {
        self.display = display.filter(|d| !d.is_empty());
        self
    }

    pub fn has_display(&self) -> bool {
        self.display.is_some()
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn web_output_dir(&self, scan_id: &str) -> PathBuf {
        self.config.data_dir.join(format!("web.{}", scan_id))
    }

    pub fn remote_desktop_output(&self, scan_id: &str) -> PathBuf {
        self.config.data_dir.join(format!("{}.vnc.jpg", scan_id))
    }

    /// One URL per service, newline separated, without a trailing newline.
    /// A trailing blank line makes the web capture tool render garbage.
    pub fn web_input(target: IpAddr, services: &[Service]) -> String {
        services
            .iter()
            .map(|service| service.url_for(target))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub async fn capture_web(&self, target: IpAddr, scan_id: &str, services: &[Service]) -> bool {
        let started = Instant::now();
        match self.try_capture_web(target, scan_id, services).await {
            Ok(()) => {
                log::info!("[capture] web_succeeded: scan_id={} target={} services={} duration={}ms",
                    scan_id, target, services.len(), started.elapsed().as_millis());
                true
            }
            Err(e) => {
                log::warn!("[capture] web_failed: scan_id={} target={} cause={} error={}",
                    scan_id, target, e.kind(), e);
                false
            }
        }
    }

    pub async fn capture_remote_desktop(&self, target: IpAddr, scan_id: &str) -> bool {
        let started = Instant::now();
        match self.try_capture_remote_desktop(target, scan_id).await {
            Ok(()) => {
                log::info!("[capture] remote_desktop_succeeded: scan_id={} target={} duration={}ms",
                    scan_id, target, started.elapsed().as_millis());
                true
            }
            Err(e) => {
                log::warn!("[capture] remote_desktop_failed: scan_id={} target={} cause={} error={}",
                    scan_id, target, e.kind(), e);
                false
            }
        }
    }

    pub async fn try_capture_web(
        &self,
        target: IpAddr,
        scan_id: &str,
        services: &[Service],
    ) -> Result<(), CaptureError> {
        let tool = &self.config.web_tool;
        self.ensure_data_dir(tool).await?;

        let input = Self::web_input(target, services);
        let out_dir = self.web_output_dir(scan_id);
        log::debug!("[capture] web_starting: scan_id={} urls={} out={}",
            scan_id, services.len(), out_dir.display());

        let mut command = Command::new(&tool.program);
        command
            .args(&tool.args)
            .arg("-scan-timeout")
            .arg(self.config.web_scan_timeout_ms.to_string())
            .arg("-out")
            .arg(&out_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        run_bounded(tool, command, Some(input), self.config.hard_timeout(), scan_id).await?;

        // let the tool's output files settle before anyone reads them
        sleep(self.config.grace_period()).await;
        Ok(())
    }

    pub async fn try_capture_remote_desktop(&self, target: IpAddr, scan_id: &str) -> Result<(), CaptureError> {
        if !self.has_display() {
            return Err(CaptureError::DisplayUnavailable);
        }

        let tool = &self.config.remote_desktop_tool;
        self.ensure_data_dir(tool).await?;

        let output = self.remote_desktop_output(scan_id);
        log::debug!("[capture] remote_desktop_starting: scan_id={} target={} out={}",
            scan_id, target, output.display());

        let mut command = Command::new(&tool.program);
        command
            .args(&tool.args)
            .arg("-quality")
            .arg(self.config.remote_desktop_quality.to_string())
            .arg(target.to_string())
            .arg(&output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(display) = &self.display {
            command.env("DISPLAY", display);
        }

        run_bounded(tool, command, None, self.config.hard_timeout(), scan_id).await
    }

    async fn ensure_data_dir(&self, tool: &ToolCommand) -> Result<(), CaptureError> {
        tokio::fs::create_dir_all(&self.config.data_dir)
            .await
            .map_err(|source| CaptureError::Io {
                program: tool.display_name(),
                source,
            })
    }
}

/// Spawn, feed, and wait with a hard ceiling. The child is always reaped
/// before this returns.
async fn run_bounded(
    tool: &ToolCommand,
    mut command: Command,
    input: Option<String>,
    ceiling: Duration,
    scan_id: &str,
) -> Result<(), CaptureError> {
    let program = tool.display_name();
    command.kill_on_drop(true).process_group(0);

    let mut child = command.spawn().map_err(|source| CaptureError::Spawn {
        program: program.clone(),
        source,
    })?;
    let pid = child.id();
    log::debug!("[capture] spawned: scan_id={} program={} pid={:?}", scan_id, program, pid);

    match timeout(ceiling, drive(&mut child, input)).await {
        Ok(Ok(status)) => {
            // The leader is already reaped here. While any straggler is alive
            // the kernel keeps the pgid allocated, so the kill can only reach
            // an unrelated group if the group emptied and its pid was recycled
            // as a new group leader in the few instructions since the wait.
            if let Some(pid) = pid {
                signal_group(pid, scan_id);
            }
            if status.success() {
                Ok(())
            } else {
                Err(CaptureError::NonZeroExit { program, status })
            }
        }
        Ok(Err(source)) => {
            terminate(&mut child, pid, scan_id).await;
            Err(CaptureError::Io { program, source })
        }
        Err(_) => {
            log::warn!("[capture] killing_slow_process: scan_id={} program={} pid={:?} ceiling={}s",
                scan_id, program, pid, ceiling.as_secs());
            terminate(&mut child, pid, scan_id).await;
            Err(CaptureError::Timeout { program, after: ceiling })
        }
    }
}

async fn drive(child: &mut Child, input: Option<String>) -> std::io::Result<ExitStatus> {
    if let Some(mut stdin) = child.stdin.take() {
        if let Some(input) = input {
            match stdin.write_all(input.as_bytes()).await {
                Ok(()) => {}
                // the tool may exit without reading everything
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    log::debug!("[capture] stdin_closed_early: bytes={}", input.len());
                }
                Err(e) => return Err(e),
            }
        }
        drop(stdin);
    }
    child.wait().await
}

async fn terminate(child: &mut Child, pid: Option<u32>, scan_id: &str) {
    // leader not reaped yet, so its pgid still names this group
    if let Some(pid) = pid {
        signal_group(pid, scan_id);
    }
    if let Err(e) = child.kill().await {
        log::error!("[capture] reap_failed: scan_id={} pid={:?} error={}", scan_id, pid, e);
    }
}

fn signal_group(pid: u32, scan_id: &str) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => log::debug!("[capture] group_killed: scan_id={} pgid={}", scan_id, raw),
        Err(Errno::ESRCH) => {}
        Err(e) => log::warn!("[capture] group_kill_failed: scan_id={} pgid={} error={}", scan_id, raw, e),
    }
}
