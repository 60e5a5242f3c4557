use std::fmt;

/// Base name of the application and of every identity derived from it.
pub const APP_NAME: &str = "solo";

/// Application identity: the base application name plus an optional tool
/// module (`solo` or `solo-curve-viewer`). Each identity owns one lock file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppIdentity {
    base: String,
    module: Option<String>,
}

impl AppIdentity {
    pub fn new(base: impl Into<String>, module: Option<String>) -> Self {
        Self {
            base: base.into(),
            module: module.filter(|m| !m.is_empty()),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn module(&self) -> Option<&str> {
        self.module.as_deref()
    }

    /// Full identity, used as the lock-file stem and as the `getappname`
    /// answer.
    pub fn name(&self) -> String {
        match &self.module {
            Some(module) => format!("{}-{module}", self.base),
            None => self.base.clone(),
        }
    }

    /// Command token a second launch sends to the running instance: the
    /// module name, or the base name for the main application.
    pub fn request_target(&self) -> &str {
        self.module.as_deref().unwrap_or(&self.base)
    }

    /// Whether this identity is listed in `names` (matched on module, or on
    /// the base name for the main application).
    pub fn is_in(&self, names: &[String]) -> bool {
        let target = self.request_target();
        names.iter().any(|name| name == target)
    }
}

impl fmt::Display for AppIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}
