use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SoloError};
use crate::identity::AppIdentity;

/// Directory name under the platform config/data roots.
pub const APP_DIR: &str = "solo";

const LOCK_EXTENSION: &str = "lock";

/// Per-user directories, resolved once at startup and passed around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformPaths {
    config_home: PathBuf,
    data_home: PathBuf,
    data_dirs: Vec<PathBuf>,
}

impl PlatformPaths {
    pub fn new(config_home: impl Into<PathBuf>, data_home: impl Into<PathBuf>) -> Self {
        Self {
            config_home: config_home.into(),
            data_home: data_home.into(),
            data_dirs: Vec::new(),
        }
    }

    /// Resolve directories: explicit overrides win, then `SOLO_CONFIG_HOME` /
    /// `SOLO_DATA_HOME`, then the platform defaults. `SOLO_DATA_DIRS` adds
    /// read-only resource directories.
    pub fn resolve(config_home: Option<PathBuf>, data_home: Option<PathBuf>) -> Result<Self> {
        let config_home = config_home
            .or_else(|| env_dir("SOLO_CONFIG_HOME"))
            .or_else(|| dirs::config_dir().map(|d| d.join(APP_DIR)))
            .ok_or_else(|| SoloError::Fatal("could not determine the config directory".into()))?;
        let data_home = data_home
            .or_else(|| env_dir("SOLO_DATA_HOME"))
            .or_else(|| dirs::data_dir().map(|d| d.join(APP_DIR)))
            .ok_or_else(|| SoloError::Fatal("could not determine the data directory".into()))?;
        let data_dirs = env::var_os("SOLO_DATA_DIRS")
            .map(|dirs| env::split_paths(&dirs).collect())
            .unwrap_or_default();
        Ok(Self {
            config_home,
            data_home,
            data_dirs,
        })
    }

    pub fn with_data_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.data_dirs = dirs;
        self
    }

    pub fn config_home(&self) -> &Path {
        &self.config_home
    }

    pub fn data_home(&self) -> &Path {
        &self.data_home
    }

    pub fn lock_path(&self, identity: &AppIdentity) -> PathBuf {
        self.config_home
            .join(format!("{}.{LOCK_EXTENSION}", identity.name()))
    }

    /// Every `*.lock` file in the config home, sorted by path.
    pub fn lock_files(&self) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.config_home) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("could not list {}: {e}", self.config_home.display());
                }
                return Vec::new();
            }
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file() && path.extension().is_some_and(|ext| ext == LOCK_EXTENSION)
            })
            .collect();
        files.sort();
        files
    }

    /// Locate a bundled resource (`xrc/3dlut.xrc`) in the data home or any
    /// extra data directory.
    pub fn find_data_file(&self, relative: &str) -> Option<PathBuf> {
        let relative: PathBuf = relative.split('/').collect();
        std::iter::once(&self.data_home)
            .chain(self.data_dirs.iter())
            .map(|dir| dir.join(&relative))
            .find(|path| path.is_file())
    }
}

fn env_dir(name: &str) -> Option<PathBuf> {
    env::var_os(name)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lock_path_uses_identity_name() {
        let paths = PlatformPaths::new("/cfg", "/data");
        let id = AppIdentity::new("solo", Some("synthprofile".into()));
        assert_eq!(paths.lock_path(&id), PathBuf::from("/cfg/solo-synthprofile.lock"));
    }

    #[test]
    fn lock_files_lists_only_lock_files_sorted() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("solo.lock"), "").unwrap();
        fs::write(dir.path().join("solo-curve-viewer.lock"), "").unwrap();
        fs::write(dir.path().join("solo.json"), "{}").unwrap();
        fs::create_dir(dir.path().join("dir.lock")).unwrap();

        let paths = PlatformPaths::new(dir.path(), dir.path());
        let names: Vec<String> = paths
            .lock_files()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["solo-curve-viewer.lock", "solo.lock"]);
    }

    #[test]
    fn missing_config_home_has_no_lock_files() {
        let dir = tempdir().unwrap();
        let paths = PlatformPaths::new(dir.path().join("absent"), dir.path());
        assert!(paths.lock_files().is_empty());
    }

    #[test]
    fn find_data_file_searches_extra_dirs() {
        let home = tempdir().unwrap();
        let extra = tempdir().unwrap();
        fs::create_dir_all(extra.path().join("xrc")).unwrap();
        fs::write(extra.path().join("xrc").join("3dlut.xrc"), "<xrc/>").unwrap();

        let paths = PlatformPaths::new(home.path(), home.path())
            .with_data_dirs(vec![extra.path().into()]);
        assert_eq!(
            paths.find_data_file("xrc/3dlut.xrc"),
            Some(extra.path().join("xrc").join("3dlut.xrc"))
        );
        assert_eq!(paths.find_data_file("xrc/synthicc.xrc"), None);
    }
}
