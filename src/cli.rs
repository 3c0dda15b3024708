use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::types::{ScopeId, TaskId};

#[derive(Parser)]
#[command(name = "scanrelay")]
#[command(about = "Coordinate distributed rescans of an authorized scope")]
#[command(version)]
pub struct Cli {
    /// Config file (defaults to the per-user config if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// State file shared by all scanrelay commands
    #[arg(short, long, global = true)]
    pub state: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Manage the authorized scope and blacklist
    #[command(subcommand)]
    Scope(ScopeCommand),

    /// Request, claim and complete rescans
    #[command(subcommand)]
    Task(TaskCommand),

    /// Run a single screenshot capture
    #[command(subcommand)]
    Capture(CaptureCommand),

    /// Pull tasks from the state file and scan them
    Agent {
        /// Process at most one task and exit
        #[arg(long)]
        once: bool,
    },
}

#[derive(Subcommand)]
pub enum ScopeCommand {
    /// Add a network or address
    Add {
        network: String,
        /// Add to the blacklist instead of the scope
        #[arg(short, long)]
        blacklist: bool,
    },
    /// Remove an entry by id
    Remove { id: ScopeId },
    /// Move an entry between scope and blacklist
    Toggle { id: ScopeId },
    /// Add one entry per line of a file; `-` reads stdin
    Import {
        file: PathBuf,
        #[arg(short, long)]
        blacklist: bool,
    },
    /// List scope and blacklist entries
    List,
    /// Check whether an address may be scanned
    Check { address: IpAddr },
    /// Show the audit trail of scope changes
    History,
}

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Queue a rescan of an in-scope target
    Request {
        target: String,
        /// Requesting principal
        #[arg(short, long, env = "USER", default_value = "unknown")]
        by: String,
    },
    /// Claim the oldest pending task
    Claim,
    /// Mark a dispatched task complete
    Complete { id: TaskId, scan_id: String },
    /// List tasks
    List(TaskListArgs),
    /// List dispatched tasks older than the configured staleness window
    Stale {
        /// Override the staleness window
        #[arg(long)]
        older_than_secs: Option<u64>,
    },
    /// Return dispatched tasks to pending
    Requeue {
        /// Task to requeue
        id: Option<TaskId>,
        /// Requeue every stale task instead
        #[arg(long, conflicts_with = "id")]
        stale: bool,
    },
}

#[derive(Args)]
pub struct TaskListArgs {
    /// Only pending tasks
    #[arg(long, conflicts_with = "incomplete")]
    pub pending: bool,
    /// Only tasks that are not complete
    #[arg(long)]
    pub incomplete: bool,
}

#[derive(Subcommand)]
pub enum CaptureCommand {
    /// Screenshot web services on a host
    Web {
        target: IpAddr,
        scan_id: String,
        /// Services as `name:port`, e.g. `https:443`; none still runs the tool
        services: Vec<String>,
    },
    /// Screenshot a VNC service
    RemoteDesktop { target: IpAddr, scan_id: String },
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_task_request() {
        let cli = Cli::try_parse_from(["scanrelay", "--state", "/tmp/s.json", "task", "request", "10.0.0.6", "--by", "alice"])
            .unwrap();
        assert_eq!(cli.state, Some(PathBuf::from("/tmp/s.json")));
        match cli.command {
            Command::Task(TaskCommand::Request { target, by }) => {
                assert_eq!(target, "10.0.0.6");
                assert_eq!(by, "alice");
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_capture_web_accepts_no_services() {
        let cli = Cli::try_parse_from(["scanrelay", "capture", "web", "10.0.0.6", "scan1"]).unwrap();
        match cli.command {
            Command::Capture(CaptureCommand::Web { target, scan_id, services }) => {
                assert_eq!(target, "10.0.0.6".parse::<IpAddr>().unwrap());
                assert_eq!(scan_id, "scan1");
                assert!(services.is_empty());
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_requeue_id_conflicts_with_stale() {
        assert!(Cli::try_parse_from(["scanrelay", "task", "requeue", "3", "--stale"]).is_err());
    }
}
