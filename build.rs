use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs");

    let sha = Command::new("git")
        .args(["rev-parse", "--short=12", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
        .filter(|sha| !sha.is_empty());
    if let Some(sha) = sha {
        println!("cargo:rustc-env=SOLO_BUILD_GIT_SHA={sha}");
    }

    if let Ok(profile) = env::var("PROFILE") {
        println!("cargo:rustc-env=SOLO_BUILD_PROFILE={profile}");
    }
}
