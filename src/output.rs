use std::path::Path;

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;

use crate::error::Result;
use crate::lockfile::Rewritten;
use crate::record::LockRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Pretty,
}

/// One line of `solo run` / `solo send` output.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event<'a> {
    Claimed {
        identity: &'a str,
        pid: u32,
        port: Option<u16>,
        lock_file: &'a Path,
    },
    Notified {
        identity: &'a str,
        port: u16,
    },
    AlreadyStarting {
        identity: &'a str,
    },
    AlreadyRunning {
        identity: &'a str,
        port: u16,
    },
    Open {
        identity: &'a str,
        args: &'a [String],
    },
    Stopped {
        identity: &'a str,
        lock_file_removed: bool,
    },
    Reply {
        port: u16,
        request: &'a str,
        reply: &'a str,
    },
}

pub fn print_event(event: &Event<'_>, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(event)?),
        Format::Pretty => match event {
            Event::Claimed {
                identity,
                pid,
                port,
                lock_file,
            } => {
                let port = port.map_or_else(|| "-".to_string(), |p| p.to_string());
                println!("{identity} started (pid {pid}, port {port})");
                println!("  lock file: {}", lock_file.display());
            }
            Event::Notified { identity, port } => {
                println!("Notified running {identity} on port {port}");
            }
            Event::AlreadyStarting { .. } | Event::AlreadyRunning { .. } => {
                println!("Not starting another instance.");
            }
            Event::Open { identity, args } => {
                println!("{identity}: open {}", args.join(" "));
            }
            Event::Stopped {
                identity,
                lock_file_removed,
            } => {
                if *lock_file_removed {
                    println!("{identity} exited, lock file removed");
                } else {
                    println!("{identity} exited");
                }
            }
            Event::Reply { reply, .. } => println!("{reply}"),
        },
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordStatus {
    #[serde(flatten)]
    pub record: LockRecord,
    /// `None` when the record has no port to probe.
    pub live: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockFileStatus {
    pub identity: String,
    pub path: std::path::PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<chrono::DateTime<chrono::Utc>>,
    /// Exclusively held by a launch in progress; records were not read.
    pub busy: bool,
    pub records: Vec<RecordStatus>,
}

pub fn print_status(build: &str, files: &[LockFileStatus], format: Format) -> Result<()> {
    match format {
        Format::Json => println!(
            "{}",
            serde_json::json!({ "version": build, "lock_files": files })
        ),
        Format::Pretty => {
            if files.is_empty() {
                println!("No lock files.");
            }
            for file in files {
                let modified = file
                    .modified
                    .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".into());
                println!("{} ({modified})", file.identity.bold());
                if file.busy {
                    println!("  {}", "starting (locked)".yellow());
                }
                for status in &file.records {
                    let marker = match status.live {
                        Some(true) => "live".green(),
                        Some(false) => "dead".red(),
                        None => "unknown".dimmed(),
                    };
                    println!("  {:<16} {marker}", status.record.to_string());
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CleanupOutcome {
    Updated { records: usize },
    Removed,
    Skipped,
}

impl From<Option<Rewritten>> for CleanupOutcome {
    fn from(outcome: Option<Rewritten>) -> Self {
        match outcome {
            Some(Rewritten::Updated(records)) => Self::Updated { records },
            Some(Rewritten::Removed) => Self::Removed,
            None => Self::Skipped,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupEntry {
    pub path: std::path::PathBuf,
    #[serde(flatten)]
    pub outcome: CleanupOutcome,
}

pub fn print_cleanup(entries: &[CleanupEntry], format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(entries)?),
        Format::Pretty => {
            for entry in entries {
                let outcome = match entry.outcome {
                    CleanupOutcome::Updated { records } => format!("{records} live"),
                    CleanupOutcome::Removed => "removed".into(),
                    CleanupOutcome::Skipped => "skipped (locked)".into(),
                };
                println!("{:<48} {outcome}", entry.path.display());
            }
        }
    }
    Ok(())
}
