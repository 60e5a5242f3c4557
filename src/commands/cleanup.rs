use crate::channel::Timeouts;
use crate::config::Config;
use crate::coordinator;
use crate::error::Result;
use crate::lockfile::{InstanceLockFile, OpenMode};
use crate::output::{self, CleanupEntry, CleanupOutcome, Format};
use crate::paths::PlatformPaths;

/// Drop dead records from every lock file. Files held by a launch in
/// progress are skipped.
pub fn purge_all(paths: &PlatformPaths, timeouts: Timeouts) -> Vec<CleanupEntry> {
    paths
        .lock_files()
        .into_iter()
        .map(|path| {
            let outcome = match InstanceLockFile::open(&path, OpenMode::ReadWrite, true, false) {
                Some(mut lockfile) => {
                    coordinator::purge_stale(&mut lockfile, None, timeouts).into()
                }
                None => CleanupOutcome::Skipped,
            };
            CleanupEntry { path, outcome }
        })
        .collect()
}

pub fn run(paths: &PlatformPaths, config: &Config, format: Format) -> Result<()> {
    let entries = purge_all(paths, config.timeouts());
    output::print_cleanup(&entries, format)
}
