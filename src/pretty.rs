use crate::agent::AgentReport;
use crate::scope::ImportReport;
use crate::types::{RescanTask, ScopeChange, ScopeChangeKind, ScopeEntry, TaskState};
use chrono::{DateTime, Utc};
use std::time::Duration;

const SECONDS_PER_MINUTE: u64 = 60;
const SECONDS_PER_HOUR: u64 = 3600;
const SEPARATOR_WIDTH: usize = 80;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn print_task(task: &RescanTask) {
    let status_icon = match task.state() {
        TaskState::Pending => "⏳",
        TaskState::Dispatched => "🔄",
        TaskState::Complete => "✅",
    };

    println!("{} #{} {} ({}, requested by {} at {})",
        status_icon,
        task.id,
        task.target,
        task.state().as_str(),
        task.requested_by,
        format_time(&task.created_at)
    );

    if let Some(at) = &task.dispatched_at {
        println!("  ├─ Dispatched: {} ({} ago)", format_time(at), format_age(at));
    }
    if let (Some(at), Some(scan_id)) = (&task.completed_at, &task.scan_id) {
        println!("  └─ Completed: {} as scan {}", format_time(at), scan_id);
    }
}

pub fn print_tasks(tasks: &[RescanTask]) {
    if tasks.is_empty() {
        println!("No tasks");
        return;
    }
    for task in tasks {
        print_task(task);
    }
}

pub fn print_scope_entry(entry: &ScopeEntry) {
    let icon = if entry.blacklisted { "⛔" } else { "🎯" };
    println!("{} #{} {} (added {})", icon, entry.id, entry.canonical(), format_time(&entry.added_at));
}

pub fn print_scope_entries(title: &str, entries: &[ScopeEntry]) {
    println!("{} ({})", title, entries.len());
    for entry in entries {
        print_scope_entry(entry);
    }
}

pub fn print_scope_history(history: &[ScopeChange]) {
    if history.is_empty() {
        println!("No scope changes recorded");
        return;
    }
    for change in history {
        let what = match change.kind {
            ScopeChangeKind::Added { blacklisted: false } => "added to scope",
            ScopeChangeKind::Added { blacklisted: true } => "added to blacklist",
            ScopeChangeKind::Removed => "removed",
            ScopeChangeKind::BlacklistToggled { blacklisted: true } => "blacklisted",
            ScopeChangeKind::BlacklistToggled { blacklisted: false } => "moved back to scope",
        };
        println!("{} #{} {} {}", format_time(&change.at), change.entry_id, change.network, what);
    }
}

pub fn print_import_report(report: &ImportReport) {
    println!("✅ Imported {} entries", report.added.len());
    for entry in &report.added {
        println!("  ├─ #{} {}", entry.id, entry.canonical());
    }
    if !report.failed.is_empty() {
        println!("❌ Rejected {} lines", report.failed.len());
        for failure in &report.failed {
            println!("  ├─ line {}: {} - {}", failure.line, failure.content, failure.error);
        }
    }
}

pub fn print_agent_report(report: &AgentReport) {
    println!("✅ Task #{} {}: scan {}, {} hosts up, {} services",
        report.task.id,
        report.task.target,
        report.scan_id,
        report.hosts_up,
        report.services
    );
    println!("  ├─ Web capture: {}", format_capture(report.web_capture));
    println!("  └─ Remote desktop capture: {}", format_capture(report.remote_desktop_capture));
}

pub fn format_capture(outcome: Option<bool>) -> &'static str {
    match outcome {
        Some(true) => "captured",
        Some(false) => "failed",
        None => "skipped",
    }
}

fn format_time(at: &DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

fn format_age(at: &DateTime<Utc>) -> String {
    let age = (Utc::now() - *at).to_std().unwrap_or_default();
    format_duration(age)
}

fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();

    if total_secs < SECONDS_PER_MINUTE {
        format!("{}s", total_secs)
    } else if total_secs < SECONDS_PER_HOUR {
        format!("{}m{}s", total_secs / SECONDS_PER_MINUTE, total_secs % SECONDS_PER_MINUTE)
    } else {
        let hours = total_secs / SECONDS_PER_HOUR;
        let minutes = (total_secs % SECONDS_PER_HOUR) / SECONDS_PER_MINUTE;
        format!("{}h{}m", hours, minutes)
    }
}

pub fn print_separator() {
    println!("{}", "─".repeat(SEPARATOR_WIDTH));
}
