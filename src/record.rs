use std::fmt;
use std::path::Path;

use serde::Serialize;

use crate::error::{Result, SoloError};

/// One line of an instance lock file.
///
/// Modern lines are `pid:port`, legacy lines carry a bare port. Either half
/// may be empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct LockRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl LockRecord {
    pub fn new(pid: Option<u32>, port: Option<u16>) -> Self {
        Self { pid, port }
    }

    pub fn is_empty(&self) -> bool {
        self.pid.is_none() && self.port.is_none()
    }

    /// Whether this record was written by the process `pid` listening on
    /// `port` (a record without a port is matched by PID alone).
    pub fn is_own(&self, pid: u32, port: Option<u16>) -> bool {
        match (self.port, port) {
            (Some(theirs), Some(ours)) if theirs == ours => true,
            (None, _) => self.pid == Some(pid),
            _ => false,
        }
    }

    /// Strict parse of one line. Fails on the first half that is not a
    /// number.
    pub fn parse_line(path: &Path, line_no: usize, line: &str) -> Result<Self> {
        let line = line.trim();
        let (pid, port) = match line.split_once(':') {
            Some((pid, port)) => (pid, port),
            None => ("", line),
        };
        Ok(Self {
            pid: parse_half(path, line_no, pid)?,
            port: parse_half(path, line_no, port)?,
        })
    }

    /// Lenient parse: malformed halves are logged and treated as absent.
    pub fn parse_lenient(path: &Path, line_no: usize, line: &str) -> Self {
        let line = line.trim();
        let (pid, port) = match line.split_once(':') {
            Some((pid, port)) => (pid, port),
            None => ("", line),
        };
        let pid = parse_half(path, line_no, pid).unwrap_or_else(|e| {
            log::warn!("couldn't parse PID: {e}");
            None
        });
        let port = parse_half(path, line_no, port).unwrap_or_else(|e| {
            log::warn!("couldn't parse port: {e}");
            None
        });
        Self { pid, port }
    }
}

impl fmt::Display for LockRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(pid) = self.pid {
            write!(f, "{pid}")?;
        }
        f.write_str(":")?;
        if let Some(port) = self.port {
            write!(f, "{port}")?;
        }
        Ok(())
    }
}

fn parse_half<T: std::str::FromStr>(path: &Path, line: usize, value: &str) -> Result<Option<T>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| SoloError::MalformedRecord {
            path: path.to_path_buf(),
            line,
            value: value.to_string(),
        })
}

/// Parse every non-blank line of a lock file's contents, skipping records
/// that end up with neither PID nor port.
pub fn parse_records(path: &Path, contents: &str) -> Vec<LockRecord> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| LockRecord::parse_lenient(path, idx + 1, line))
        .filter(|record| !record.is_empty())
        .collect()
}

/// Render records as lock-file contents, dropping empty ones.
pub fn render_records(records: &[LockRecord]) -> String {
    records
        .iter()
        .filter(|record| !record.is_empty())
        .map(|record| format!("{record}\n"))
        .collect()
}
