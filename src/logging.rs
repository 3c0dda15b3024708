use eyre::{eyre, Result, WrapErr};
use log::LevelFilter;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Initialize logging to a per-user log file. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str) -> Result<PathBuf> {
    let log_path = get_log_file_path()?;

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .wrap_err_with(|| format!("Failed to create log directory {}", parent.display()))?;
    }

    let log_level = resolve_level(std::env::var("RUST_LOG").ok().as_deref(), level);

    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .wrap_err_with(|| format!("Failed to open log file {}", log_path.display()))?;

    env_logger::Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {} - {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(file)))
        .try_init()
        .wrap_err("Logger already initialized")?;

    log::info!("[logging] initialized: path={} level={}", log_path.display(), log_level);
    Ok(log_path)
}

fn resolve_level(env: Option<&str>, configured: &str) -> LevelFilter {
    env.and_then(|v| v.parse().ok())
        .or_else(|| configured.parse().ok())
        .unwrap_or(LevelFilter::Info)
}

/// Get the system-specific log file path
pub fn get_log_file_path() -> Result<PathBuf> {
    let log_dir = if cfg!(target_os = "macos") {
        // macOS: ~/Library/Logs/scanrelay/
        dirs::home_dir()
            .ok_or_else(|| eyre!("Could not find home directory"))?
            .join("Library")
            .join("Logs")
            .join("scanrelay")
    } else if cfg!(target_os = "linux") && nix::unistd::getuid().is_root() {
        PathBuf::from("/var/log/scanrelay")
    } else {
        dirs::data_local_dir()
            .ok_or_else(|| eyre!("Could not find local data directory"))?
            .join("scanrelay")
            .join("logs")
    };

    Ok(log_dir.join("scanrelay.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_path_generation() {
        let path = get_log_file_path().unwrap();
        assert!(path.to_string_lossy().contains("scanrelay"));
        assert!(path.to_string_lossy().ends_with("scanrelay.log"));
    }

    #[test]
    fn test_env_level_overrides_configured() {
        assert_eq!(resolve_level(Some("debug"), "warn"), LevelFilter::Debug);
        assert_eq!(resolve_level(None, "warn"), LevelFilter::Warn);
        assert_eq!(resolve_level(Some("nonsense"), "error"), LevelFilter::Error);
        assert_eq!(resolve_level(None, "nonsense"), LevelFilter::Info);
    }
}
