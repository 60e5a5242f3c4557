use std::fs;

use chrono::{DateTime, Utc};

use crate::build_info;
use crate::channel::{self, LOOPBACK, Timeouts};
use crate::config::Config;
use crate::error::Result;
use crate::lockfile::{InstanceLockFile, OpenMode};
use crate::output::{self, Format, LockFileStatus, RecordStatus};
use crate::paths::PlatformPaths;

/// Inspect every lock file in the config home and probe each recorded port.
pub fn collect(paths: &PlatformPaths, timeouts: Timeouts) -> Vec<LockFileStatus> {
    paths
        .lock_files()
        .into_iter()
        .map(|path| {
            let identity = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            let modified = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .ok()
                .map(DateTime::<Utc>::from);
            let lockfile = InstanceLockFile::open(&path, OpenMode::Read, false, false);
            let (busy, records) = match lockfile {
                Some(mut lockfile) => {
                    let records = lockfile.read_records();
                    lockfile.unlock();
                    (false, records)
                }
                None => (true, Vec::new()),
            };
            let records = records
                .into_iter()
                .map(|record| RecordStatus {
                    record,
                    live: record
                        .port
                        .map(|port| channel::port_is_live(LOOPBACK, port, timeouts.connect)),
                })
                .collect();
            LockFileStatus {
                identity,
                path,
                modified,
                busy,
                records,
            }
        })
        .collect()
}

pub fn run(paths: &PlatformPaths, config: &Config, format: Format) -> Result<()> {
    let files = collect(paths, config.timeouts());
    output::print_status(&build_info::version_line(), &files, format)
}
