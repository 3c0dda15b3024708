use chrono::TimeDelta;
use eyre::{eyre, Result, WrapErr};
use std::io::Read;
use std::path::Path;

use scanrelay::agent::Agent;
use scanrelay::capture::CaptureOrchestrator;
use scanrelay::cli::{self, CaptureCommand, Command, ScopeCommand, TaskCommand, TaskListArgs};
use scanrelay::config::Config;
use scanrelay::services::{Service, Transport};
use scanrelay::state::StateFile;
use scanrelay::{pretty, scan};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(state) = &cli.state {
        config.state_file = state.clone();
    }

    let level = if cli.verbose { "debug" } else { config.logging.level.as_str() };
    if let Err(e) = scanrelay::init_logging(level) {
        eprintln!("Warning: Failed to initialize logging: {:#}", e);
    }
    log::info!("[main] start: state_file={}", config.state_file.display());

    let state = StateFile::new(&config.state_file, config.queue.clone());

    match cli.command {
        Command::Scope(command) => run_scope(&state, command),
        Command::Task(command) => run_task(&state, &config, command),
        Command::Capture(command) => run_capture(&config, command).await,
        Command::Agent { once } => run_agent(state, config, once).await,
    }
}

fn run_scope(state: &StateFile, command: ScopeCommand) -> Result<()> {
    match command {
        ScopeCommand::Add { network, blacklist } => {
            let entry = state.transact(|q| q.scope().add(&network, blacklist))??;
            pretty::print_scope_entry(&entry);
        }
        ScopeCommand::Remove { id } => {
            let entry = state.transact(|q| q.scope().remove(id))??;
            println!("Removed #{} {}", entry.id, entry.canonical());
        }
        ScopeCommand::Toggle { id } => {
            let entry = state.transact(|q| q.scope().toggle_blacklist(id))??;
            pretty::print_scope_entry(&entry);
        }
        ScopeCommand::Import { file, blacklist } => {
            let text = read_input(&file)?;
            let report = state.transact(|q| q.scope().import(&text, blacklist))?;
            pretty::print_import_report(&report);
        }
        ScopeCommand::List => {
            let (scope, blacklist) = state.inspect(|q| (q.scope().list_scope(), q.scope().list_blacklist()))?;
            pretty::print_scope_entries("Scope", &scope);
            pretty::print_separator();
            pretty::print_scope_entries("Blacklist", &blacklist);
        }
        ScopeCommand::Check { address } => {
            if state.inspect(|q| q.scope().is_in_scope(address))? {
                println!("✅ {} is in scope", address);
            } else {
                println!("⛔ {} is not in scope", address);
            }
        }
        ScopeCommand::History => {
            let history = state.inspect(|q| q.scope().history())?;
            pretty::print_scope_history(&history);
        }
    }
    Ok(())
}

fn run_task(state: &StateFile, config: &Config, command: TaskCommand) -> Result<()> {
    match command {
        TaskCommand::Request { target, by } => {
            let task = state.transact(|q| q.request_rescan(&target, &by))??;
            pretty::print_task(&task);
        }
        TaskCommand::Claim => match state.transact(|q| q.claim_next())? {
            Some(task) => pretty::print_task(&task),
            None => println!("No pending tasks"),
        },
        TaskCommand::Complete { id, scan_id } => {
            let task = state.transact(|q| q.complete(id, &scan_id))??;
            pretty::print_task(&task);
        }
        TaskCommand::List(TaskListArgs { pending, incomplete }) => {
            let tasks = state.inspect(|q| {
                if pending {
                    q.pending()
                } else if incomplete {
                    q.incomplete()
                } else {
                    q.tasks()
                }
            })?;
            pretty::print_tasks(&tasks);
        }
        TaskCommand::Stale { older_than_secs } => {
            let older_than = stale_window(config, older_than_secs)?;
            let tasks = state.inspect(|q| q.stale(older_than))?;
            pretty::print_tasks(&tasks);
        }
        TaskCommand::Requeue { id: Some(id), .. } => {
            let task = state.transact(|q| q.requeue(id))??;
            pretty::print_task(&task);
        }
        TaskCommand::Requeue { id: None, stale: true } => {
            let older_than = config.queue.stale_after();
            let tasks = state.transact(|q| q.requeue_stale(older_than))?;
            println!("Requeued {} stale tasks", tasks.len());
            pretty::print_tasks(&tasks);
        }
        TaskCommand::Requeue { id: None, stale: false } => {
            return Err(eyre!("Give a task id or --stale"));
        }
    }
    Ok(())
}

async fn run_capture(config: &Config, command: CaptureCommand) -> Result<()> {
    let orchestrator = CaptureOrchestrator::new(config.capture.clone());
    match command {
        CaptureCommand::Web { target, scan_id, services } => {
            let services = services
                .iter()
                .map(|s| parse_service(s))
                .collect::<Result<Vec<_>>>()?;
            orchestrator
                .try_capture_web(target, &scan_id, &services)
                .await
                .wrap_err_with(|| format!("Web capture of {} failed", target))?;
            println!("✅ {}", orchestrator.web_output_dir(&scan_id).display());
        }
        CaptureCommand::RemoteDesktop { target, scan_id } => {
            orchestrator
                .try_capture_remote_desktop(target, &scan_id)
                .await
                .wrap_err_with(|| format!("Remote desktop capture of {} failed", target))?;
            println!("✅ {}", orchestrator.remote_desktop_output(&scan_id).display());
        }
    }
    Ok(())
}

async fn run_agent(state: StateFile, config: Config, once: bool) -> Result<()> {
    let scanner = scan::create_default_scanner(&config.agent)?;
    let orchestrator = CaptureOrchestrator::new(config.capture);
    let agent = Agent::new(state, scanner, orchestrator, config.agent);

    if once {
        match agent.run_once().await? {
            Some(report) => pretty::print_agent_report(&report),
            None => println!("No pending tasks"),
        }
        return Ok(());
    }
    agent.run().await
}

fn stale_window(config: &Config, override_secs: Option<u64>) -> Result<TimeDelta> {
    match override_secs {
        None => Ok(config.queue.stale_after()),
        Some(secs) => i64::try_from(secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| eyre!("Staleness window of {}s is out of range", secs)),
    }
}

/// `name:port`, always TCP
fn parse_service(s: &str) -> Result<Service> {
    let (name, port) = s
        .split_once(':')
        .ok_or_else(|| eyre!("Expected name:port, got {:?}", s))?;
    let port = port.parse().wrap_err_with(|| format!("Invalid port in {:?}", s))?;
    Ok(Service::new(name, port, Transport::Tcp))
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text).wrap_err("Failed to read stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(path).wrap_err_with(|| format!("Failed to read {}", path.display()))
}
