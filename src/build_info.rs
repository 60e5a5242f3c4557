/// Build-time git commit SHA stamped by build.rs when available.
pub fn git_sha() -> Option<&'static str> {
    option_env!("SOLO_BUILD_GIT_SHA")
}

/// Cargo profile the binary was built with.
pub fn profile() -> &'static str {
    option_env!("SOLO_BUILD_PROFILE").unwrap_or("unknown")
}

/// `0.1.0 (abc123def456, release)` style version line.
pub fn version_line() -> String {
    match git_sha() {
        Some(sha) => format!("{} ({sha}, {})", env!("CARGO_PKG_VERSION"), profile()),
        None => format!("{} ({})", env!("CARGO_PKG_VERSION"), profile()),
    }
}
