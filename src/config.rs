use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::Timeouts;
use crate::error::Result;
use crate::identity::AppIdentity;
use crate::paths::PlatformPaths;

pub const CONFIG_FILE: &str = "solo.json";
pub const DEFAULT_PORT: u16 = 15411;

/// Settings read from `<config_home>/solo.json`. Keys are dotted, e.g.
/// `{"app.port": 15411, "app.allow_network_clients": false}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "app.port")]
    pub port: u16,
    #[serde(rename = "app.allow_network_clients")]
    pub allow_network_clients: bool,
    /// Tools that may run any number of concurrent instances.
    #[serde(rename = "app.multi_instance")]
    pub multi_instance: Vec<String>,
    /// Tools whose second launch closes the running instance and takes over.
    #[serde(rename = "app.close_workflow")]
    pub close_workflow: Vec<String>,
    /// Tools that notify a running instance without forwarding arguments.
    #[serde(rename = "app.no_forward_args")]
    pub no_forward_args: Vec<String>,
    /// Resource files each identity needs, relative to the data directories.
    #[serde(rename = "app.required_resources")]
    pub required_resources: BTreeMap<String, Vec<String>>,
    #[serde(rename = "app.connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(rename = "app.read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(rename = "app.peer_exit_timeout_ms")]
    pub peer_exit_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            allow_network_clients: false,
            multi_instance: [
                "curve-viewer",
                "profile-info",
                "scripting-client",
                "synthprofile",
                "testchart-editor",
            ]
            .map(String::from)
            .to_vec(),
            close_workflow: vec!["apply-profiles".into()],
            no_forward_args: vec!["3DLUT-maker".into()],
            required_resources: BTreeMap::from([
                ("3DLUT-maker".to_string(), vec!["xrc/3dlut.xrc".to_string()]),
                ("synthprofile".to_string(), vec!["xrc/synthicc.xrc".to_string()]),
            ]),
            connect_timeout_ms: 1_000,
            read_timeout_ms: 5_000,
            peer_exit_timeout_ms: 30_000,
        }
    }
}

impl Config {
    pub fn path(paths: &PlatformPaths) -> PathBuf {
        paths.config_home().join(CONFIG_FILE)
    }

    /// Load the config for `paths`. A missing file yields defaults; an
    /// unreadable or invalid one is logged and also yields defaults.
    pub fn load(paths: &PlatformPaths) -> Self {
        let path = Self::path(paths);
        if !path.exists() {
            return Self::default();
        }
        Self::load_from(&path).unwrap_or_else(|e| {
            log::warn!("ignoring config {}: {e}", path.display());
            Self::default()
        })
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            read: Duration::from_millis(self.read_timeout_ms),
        }
    }

    pub fn peer_exit_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_exit_timeout_ms)
    }

    pub fn is_multi_instance(&self, identity: &AppIdentity) -> bool {
        identity.is_in(&self.multi_instance)
    }

    pub fn is_close_workflow(&self, identity: &AppIdentity) -> bool {
        identity.is_in(&self.close_workflow)
    }

    pub fn forwards_args(&self, identity: &AppIdentity) -> bool {
        !identity.is_in(&self.no_forward_args)
    }

    pub fn required_resources(&self, identity: &AppIdentity) -> &[String] {
        self.required_resources
            .get(identity.request_target())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}
