use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use solo::channel::{AppListener, LOOPBACK};
use solo::config::Config;
use solo::coordinator::{Coordinator, Startup};
use solo::identity::AppIdentity;
use solo::lockfile::{InstanceLockFile, OpenMode, Rewritten};
use solo::paths::PlatformPaths;
use solo::server::{self, DefaultHandler};
use solo::workers::StopSignal;
use tempfile::tempdir;

fn test_config() -> Config {
    Config {
        port: 0,
        connect_timeout_ms: 300,
        read_timeout_ms: 2_000,
        peer_exit_timeout_ms: 5_000,
        ..Config::default()
    }
}

fn test_paths(root: &std::path::Path) -> PlatformPaths {
    PlatformPaths::new(root.join("config"), root.join("data"))
}

#[test]
fn second_launch_forwards_arguments_to_running_instance() {
    let dir = tempdir().unwrap();
    let paths = test_paths(dir.path());
    let config = test_config();
    let identity = AppIdentity::new("solo", None);

    let Startup::Claimed(mut primary) = Coordinator::new(&paths, &config, identity.clone())
        .start(&[])
        .unwrap()
    else {
        panic!("first launch should claim");
    };
    let listener = primary.take_listener().unwrap();
    let stop = StopSignal::new();
    let server_stop = stop.clone();
    let server_identity = identity.clone();
    let server = thread::spawn(move || {
        let mut handler = DefaultHandler::new(server_identity);
        server::serve(&listener, &mut handler, &server_stop, Default::default()).unwrap();
        handler
    });

    let args = vec!["my profile.icc".to_string(), "--flag".to_string()];
    let startup = Coordinator::new(&paths, &config, identity).start(&args).unwrap();
    assert!(matches!(startup, Startup::Notified { port } if Some(port) == primary.port()));

    stop.stop();
    let handler = server.join().unwrap();
    assert_eq!(handler.opened(), &[args]);
    assert_eq!(primary.shutdown(), Some(Rewritten::Removed));
}

#[test]
fn close_workflow_retries_close_for_legacy_peer_and_takes_over() {
    let dir = tempdir().unwrap();
    let paths = test_paths(dir.path());
    let config = test_config();
    let identity = AppIdentity::new("solo", Some("apply-profiles".into()));
    let lock_path = paths.lock_path(&identity);

    let Startup::Claimed(mut peer) = Coordinator::new(&paths, &config, identity.clone())
        .with_pid(111)
        .start(&[])
        .unwrap()
    else {
        panic!("peer should claim");
    };
    let old_port = peer.port().unwrap();
    assert_eq!(fs::read_to_string(&lock_path).unwrap(), format!("111:{old_port}\n"));
    let listener = peer.take_listener().unwrap();
    let peer_identity = identity.clone();
    let peer_thread = thread::spawn(move || {
        let stop = StopSignal::new();
        let mut handler = DefaultHandler::new(peer_identity).legacy(true);
        server::serve(&listener, &mut handler, &stop, Default::default()).unwrap();
        peer.shutdown()
    });

    let startup = Coordinator::new(&paths, &config, identity)
        .with_pid(222)
        .start(&[])
        .unwrap();
    assert_eq!(peer_thread.join().unwrap(), Some(Rewritten::Removed));

    let Startup::Claimed(successor) = startup else {
        panic!("successor should claim after the peer exited");
    };
    let port = successor.port().unwrap();
    assert_ne!(port, 0);
    let contents = fs::read_to_string(&lock_path).unwrap();
    assert_eq!(contents, format!("222:{port}\n"));
}

#[test]
fn killed_peer_is_detected_within_timeout() {
    let dir = tempdir().unwrap();
    let paths = test_paths(dir.path());
    let config = test_config();
    let identity = AppIdentity::new("solo", None);

    let dead_port = AppListener::bind(LOOPBACK, 0, &[]).unwrap().port();
    fs::create_dir_all(paths.config_home()).unwrap();
    fs::write(paths.lock_path(&identity), format!("31337:{dead_port}\n")).unwrap();

    let started = Instant::now();
    let startup = Coordinator::new(&paths, &config, identity).start(&[]).unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(matches!(startup, Startup::Claimed(_)));
}

#[test]
fn shutdown_drops_dead_records_and_keeps_live_ones() {
    let dir = tempdir().unwrap();
    let paths = test_paths(dir.path());
    let config = test_config();
    let identity = AppIdentity::new("solo", Some("profile-info".into()));
    let lock_path = paths.lock_path(&identity);

    let alive = AppListener::bind(LOOPBACK, 0, &[]).unwrap();
    let dead_port = AppListener::bind(LOOPBACK, 0, &[]).unwrap().port();
    fs::create_dir_all(paths.config_home()).unwrap();
    fs::write(&lock_path, format!("111:{dead_port}\n222:{}\n", alive.port())).unwrap();

    let Startup::Claimed(mut ours) = Coordinator::new(&paths, &config, identity)
        .with_pid(333)
        .start(&[])
        .unwrap()
    else {
        panic!("multi-instance tool should claim");
    };
    let contents = fs::read_to_string(&lock_path).unwrap();
    assert_eq!(contents.lines().count(), 3);

    assert_eq!(ours.shutdown(), Some(Rewritten::Updated(1)));
    assert_eq!(
        fs::read_to_string(&lock_path).unwrap(),
        format!("222:{}\n", alive.port())
    );
}

#[test]
fn rewrite_never_reintroduces_empty_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("solo.lock");
    fs::write(&path, "1:5000\n:\n\n2:\n").unwrap();

    let mut lockfile = InstanceLockFile::open(&path, OpenMode::ReadWrite, true, false).unwrap();
    let records = lockfile.read_records();
    lockfile.rewrite(&records);
    drop(lockfile);

    let mut reopened = InstanceLockFile::open(&path, OpenMode::ReadWrite, true, false).unwrap();
    let records = reopened.read_records();
    assert!(records.iter().all(|record| !record.is_empty()));
    reopened.rewrite(&records);
    assert_eq!(fs::read_to_string(&path).unwrap(), "1:5000\n2:\n");
}

#[test]
fn concurrent_launches_produce_a_single_primary() {
    const LAUNCHES: usize = 6;
    let dir = tempdir().unwrap();
    let paths = Arc::new(test_paths(dir.path()));
    let config = Arc::new(test_config());
    let barrier = Arc::new(Barrier::new(LAUNCHES));
    let stop = StopSignal::new();

    let handles: Vec<_> = (0..LAUNCHES)
        .map(|i| {
            let paths = Arc::clone(&paths);
            let config = Arc::clone(&config);
            let barrier = Arc::clone(&barrier);
            let stop = stop.clone();
            thread::spawn(move || {
                let identity = AppIdentity::new("solo", None);
                barrier.wait();
                let startup = Coordinator::new(&paths, &config, identity.clone())
                    .with_pid(1000 + i as u32)
                    .start(&[format!("launch-{i}")])
                    .unwrap();
                match startup {
                    Startup::Claimed(mut instance) => {
                        let listener = instance.take_listener().unwrap();
                        let mut handler = DefaultHandler::new(identity);
                        server::serve(&listener, &mut handler, &stop, Default::default()).unwrap();
                        "claimed"
                    }
                    Startup::Notified { .. } => "notified",
                    Startup::AlreadyStarting => "already_starting",
                    other => panic!("unexpected startup outcome {}", other.code()),
                }
            })
        })
        .collect();

    // Give every launch time to finish before stopping the primary.
    let deadline = Instant::now() + Duration::from_secs(10);
    while handles.iter().filter(|h| h.is_finished()).count() < LAUNCHES - 1
        && Instant::now() < deadline
    {
        thread::sleep(Duration::from_millis(50));
    }
    stop.stop();

    let outcomes: Vec<&str> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(outcomes.iter().filter(|o| **o == "claimed").count(), 1);
}
