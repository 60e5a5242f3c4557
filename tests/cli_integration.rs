use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tempfile::tempdir;

fn solo(root: &Path) -> Command {
    let binary = assert_cmd::cargo::cargo_bin!("solo");
    let mut cmd = Command::new(binary);
    cmd.arg("--config-home")
        .arg(root.join("config"))
        .arg("--data-home")
        .arg(root.join("data"))
        .arg("--format")
        .arg("json");
    cmd
}

fn run_solo(root: &Path, args: &[&str]) -> Output {
    solo(root).args(args).output().expect("solo command executes")
}

fn run_solo_ok(root: &Path, args: &[&str]) -> Value {
    let output = run_solo(root, args);
    assert!(
        output.status.success(),
        "solo {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    let last = stdout.lines().last().expect("solo prints a result");
    serde_json::from_str(last).expect("stdout is json")
}

fn write_config(root: &Path) {
    fs::create_dir_all(root.join("config")).unwrap();
    fs::write(
        root.join("config").join("solo.json"),
        r#"{"app.port": 0, "app.connect_timeout_ms": 300, "app.read_timeout_ms": 2000}"#,
    )
    .unwrap();
}

/// Poll `send getappname` until the primary has released its startup lock
/// and answers.
fn wait_until_serving(root: &Path) -> Value {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        let output = run_solo(root, &["send", "getappname"]);
        if output.status.success() {
            return serde_json::from_slice(&output.stdout).unwrap();
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("primary instance never started serving");
}

fn wait_for_exit(child: &mut Child) -> String {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if child.try_wait().unwrap().is_some() {
            let mut stdout = String::new();
            child.stdout.take().unwrap().read_to_string(&mut stdout).unwrap();
            return stdout;
        }
        thread::sleep(Duration::from_millis(50));
    }
    child.kill().ok();
    panic!("primary instance did not exit");
}

#[test]
fn status_reports_no_lock_files_initially() {
    let dir = tempdir().unwrap();
    write_config(dir.path());

    let status = run_solo_ok(dir.path(), &["status"]);
    assert_eq!(status["lock_files"], serde_json::json!([]));
    assert!(status["version"].as_str().unwrap().starts_with(env!("CARGO_PKG_VERSION")));
}

#[test]
fn second_run_notifies_primary_and_exit_stops_it() {
    let dir = tempdir().unwrap();
    write_config(dir.path());
    let lock_path = dir.path().join("config").join("solo.lock");

    let mut primary = solo(dir.path())
        .arg("run")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let name = wait_until_serving(dir.path());
    assert_eq!(name["reply"], "solo");
    assert!(lock_path.is_file());

    let notified = run_solo_ok(dir.path(), &["run", "calibrate", "two words"]);
    assert_eq!(notified["event"], "notified");

    let status = run_solo_ok(dir.path(), &["status"]);
    assert_eq!(status["lock_files"][0]["identity"], "solo");
    assert_eq!(status["lock_files"][0]["records"][0]["live"], true);

    let exit = run_solo_ok(dir.path(), &["send", "exit"]);
    assert_eq!(exit["reply"], "");

    let stdout = wait_for_exit(&mut primary);
    let events: Vec<Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(events[0]["event"], "claimed");
    assert_eq!(events[1]["event"], "open");
    assert_eq!(events[1]["args"], serde_json::json!(["calibrate", "two words"]));
    assert_eq!(events.last().unwrap()["event"], "stopped");
    assert_eq!(events.last().unwrap()["lock_file_removed"], true);
    assert!(!lock_path.exists());
}

#[test]
fn send_without_running_instance_fails_with_no_peer() {
    let dir = tempdir().unwrap();
    write_config(dir.path());

    let output = run_solo(dir.path(), &["send", "getappname"]);
    assert!(!output.status.success());
    let err: Value = serde_json::from_slice(&output.stderr).unwrap();
    assert_eq!(err["error"], "no_peer");
}

#[test]
fn cleanup_removes_lock_files_of_dead_instances() {
    let dir = tempdir().unwrap();
    write_config(dir.path());
    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let lock_path = dir.path().join("config").join("solo-apply-profiles.lock");
    fs::write(&lock_path, format!("4242:{dead_port}\n")).unwrap();

    let output = run_solo(dir.path(), &["cleanup"]);
    assert!(output.status.success());
    let entries: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(entries[0]["status"], "removed");
    assert!(!lock_path.exists());
}

#[test]
fn missing_resource_is_reported_as_fatal() {
    let dir = tempdir().unwrap();
    write_config(dir.path());

    let output = run_solo(dir.path(), &["run", "--module", "synthprofile"]);
    assert!(!output.status.success());
    let err: Value = serde_json::from_slice(&output.stderr).unwrap();
    assert_eq!(err["error"], "resource_missing");
    assert!(!dir.path().join("config").join("solo-synthprofile.lock").exists());
}
