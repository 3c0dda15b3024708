//! Configuration loaded from TOML, then overridden by `SCANRELAY_*`
//! environment variables.

use chrono::TimeDelta;
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::queue::RequeuePolicy;

const DEFAULT_STATE_FILE: &str = "scanrelay.json";
const DEFAULT_STALE_AFTER_SECS: u64 = 3600;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 300;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1500;
const DEFAULT_MAX_CONCURRENT: usize = 50;
const DEFAULT_HARD_TIMEOUT_SECS: u64 = 60;
const DEFAULT_GRACE_PERIOD_MS: u64 = 500;
const DEFAULT_WEB_SCAN_TIMEOUT_MS: u64 = 1000;
const DEFAULT_REMOTE_DESKTOP_QUALITY: u8 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub state_file: PathBuf,
    pub logging: LoggingConfig,
    pub queue: QueueConfig,
    pub agent: AgentConfig,
    pub capture: CaptureConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            logging: LoggingConfig::default(),
            queue: QueueConfig::default(),
            agent: AgentConfig::default(),
            capture: CaptureConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// A dispatched task older than this is stale
    pub stale_after_secs: u64,
    pub requeue: RequeuePolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            requeue: RequeuePolicy::Manual,
        }
    }
}

impl QueueConfig {
    pub fn stale_after(&self) -> TimeDelta {
        i64::try_from(self.stale_after_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub poll_interval_secs: u64,
    pub scan_timeout_secs: u64,
    pub connect_timeout_ms: u64,
    pub max_concurrent: usize,
    pub web_screenshots: bool,
    pub remote_desktop_screenshots: bool,
    /// Services file; the built-in catalog is used when unset
    pub services_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            scan_timeout_secs: DEFAULT_SCAN_TIMEOUT_SECS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            web_screenshots: true,
            remote_desktop_screenshots: true,
            services_file: None,
        }
    }
}

impl AgentConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// An external tool: the program plus any leading arguments. The
/// orchestrator appends its own arguments after these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn display_name(&self) -> String {
        self.program.display().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Root of all capture artifacts
    pub data_dir: PathBuf,
    /// Wall-clock ceiling for any capture subprocess
    pub hard_timeout_secs: u64,
    /// Pause after a successful web capture so output files are flushed
    pub grace_period_ms: u64,
    /// Soft per-target budget handed to the web capture tool
    pub web_scan_timeout_ms: u64,
    pub remote_desktop_quality: u8,
    pub web_tool: ToolCommand,
    pub remote_desktop_tool: ToolCommand,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            hard_timeout_secs: DEFAULT_HARD_TIMEOUT_SECS,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            web_scan_timeout_ms: DEFAULT_WEB_SCAN_TIMEOUT_MS,
            remote_desktop_quality: DEFAULT_REMOTE_DESKTOP_QUALITY,
            web_tool: ToolCommand::new("aquatone"),
            remote_desktop_tool: ToolCommand::new("xvfb-run").with_args(["vncsnapshot"]),
        }
    }
}

impl CaptureConfig {
    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content).wrap_err_with(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Explicit path if given, else the per-user config file if it exists,
    /// else defaults. Environment overrides are applied last.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => {
                    log::debug!("[config] load: path={}", path.display());
                    Self::from_file(path)?
                }
                None => Self::default(),
            },
        };
        Ok(config.merge_env())
    }

    /// Apply `SCANRELAY_*` overrides
    pub fn merge_env(self) -> Self {
        self.merge_vars(std::env::vars())
    }

    fn merge_vars(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        for (key, val) in vars {
            let Some(name) = key.strip_prefix("SCANRELAY_") else {
                continue;
            };
            match name {
                "STATE_FILE" => self.state_file = PathBuf::from(val),
                "LOG_LEVEL" => self.logging.level = val,
                "STALE_AFTER_SECS" => set_parsed(&mut self.queue.stale_after_secs, name, &val),
                "REQUEUE" => match val.to_ascii_lowercase().as_str() {
                    "manual" => self.queue.requeue = RequeuePolicy::Manual,
                    "automatic" => self.queue.requeue = RequeuePolicy::Automatic,
                    other => log::warn!("[config] env_ignored: key={} value={}", name, other),
                },
                "POLL_INTERVAL_SECS" => set_parsed(&mut self.agent.poll_interval_secs, name, &val),
                "SCAN_TIMEOUT_SECS" => set_parsed(&mut self.agent.scan_timeout_secs, name, &val),
                "WEB_SCREENSHOTS" => set_parsed(&mut self.agent.web_screenshots, name, &val),
                "REMOTE_DESKTOP_SCREENSHOTS" => set_parsed(&mut self.agent.remote_desktop_screenshots, name, &val),
                "DATA_DIR" => self.capture.data_dir = PathBuf::from(val),
                "HARD_TIMEOUT_SECS" => set_parsed(&mut self.capture.hard_timeout_secs, name, &val),
                _ => log::debug!("[config] env_unknown: key={}", key),
            }
        }
        self
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, name: &str, val: &str) {
    match val.parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => log::warn!("[config] env_ignored: key={} value={}", name, val),
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("scanrelay").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.capture.hard_timeout(), Duration::from_secs(60));
        assert_eq!(config.capture.grace_period(), Duration::from_millis(500));
        assert_eq!(config.capture.remote_desktop_quality, 50);
        assert_eq!(config.agent.scan_timeout(), Duration::from_secs(300));
        assert_eq!(config.queue.requeue, RequeuePolicy::Manual);
        assert!(config.agent.web_screenshots);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            state_file = "/var/lib/scanrelay/state.json"

            [queue]
            requeue = "automatic"
            stale_after_secs = 600

            [capture.web_tool]
            program = "/opt/aquatone/aquatone"
            "#,
        )
        .unwrap();

        assert_eq!(config.state_file, PathBuf::from("/var/lib/scanrelay/state.json"));
        assert_eq!(config.queue.requeue, RequeuePolicy::Automatic);
        assert_eq!(config.queue.stale_after(), TimeDelta::minutes(10));
        assert_eq!(config.capture.web_tool.program, PathBuf::from("/opt/aquatone/aquatone"));
        assert!(config.capture.web_tool.args.is_empty());
        assert_eq!(config.capture.hard_timeout_secs, 60);
        assert_eq!(config.agent, AgentConfig::default());
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(Config::from_toml("[queue]\nrequeue = \"sometimes\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars = vec![
            ("SCANRELAY_REQUEUE".to_string(), "Automatic".to_string()),
            ("SCANRELAY_HARD_TIMEOUT_SECS".to_string(), "5".to_string()),
            ("SCANRELAY_WEB_SCREENSHOTS".to_string(), "false".to_string()),
            ("SCANRELAY_POLL_INTERVAL_SECS".to_string(), "soon".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ];
        let config = Config::default().merge_vars(vars);
        assert_eq!(config.queue.requeue, RequeuePolicy::Automatic);
        assert_eq!(config.capture.hard_timeout_secs, 5);
        assert!(!config.agent.web_screenshots);
        assert_eq!(config.agent.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
    }
}
