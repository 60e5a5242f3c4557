//! Startup coordination between instances of the same application.
//!
//! A launch first takes a non-blocking exclusive lock on its identity's lock
//! file. Holding it is the only way to reach [`CoordinatorState::Claiming`],
//! so two concurrent launches never both become the primary instance. The
//! winner probes the recorded port of any running instance, relays its
//! request there when the peer confirms its identity, and otherwise binds its
//! own listener and records `pid:port`.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::channel::{self, AppListener, AppSocket, LOOPBACK, Timeouts};
use crate::config::Config;
use crate::error::{Result, SoloError};
use crate::identity::AppIdentity;
use crate::lockfile::{InstanceLockFile, OpenMode, Rewritten};
use crate::paths::PlatformPaths;
use crate::record::LockRecord;
use crate::server::{INVALID, OK};
use crate::workers::Workers;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Probing,
    Relaying,
    Claiming,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Probing => "probing",
            Self::Relaying => "relaying",
            Self::Claiming => "claiming",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Requests that end a running instance, newest protocol first. Peers that
/// predate `exit` answer it with `invalid`, and the next request is tried on
/// the same connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseRequest {
    Exit,
    Close,
}

impl CloseRequest {
    pub const FALLBACK_CHAIN: [Self; 2] = [Self::Exit, Self::Close];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exit => "exit",
            Self::Close => "close",
        }
    }
}

/// Outcome of [`Coordinator::start`].
#[derive(Debug)]
pub enum Startup {
    /// This process is the primary instance.
    Claimed(Instance),
    /// A running instance accepted the forwarded request.
    Notified { port: u16 },
    /// Another launch of the same identity holds the lock right now.
    AlreadyStarting,
    /// A running instance did not accept a close request.
    AlreadyRunning { port: u16 },
    /// A running instance answered but did not accept the request.
    PeerBusy { port: u16, reply: Option<String> },
}

impl Startup {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Claimed(_) => "claimed",
            Self::Notified { .. } => "notified",
            Self::AlreadyStarting => "already_starting",
            Self::AlreadyRunning { .. } => "already_running",
            Self::PeerBusy { .. } => "peer_busy",
        }
    }
}

/// Records found in every readable lock file, keyed by path.
pub type KnownInstances = BTreeMap<PathBuf, Vec<LockRecord>>;

enum Relay {
    /// No confirmed peer; claim ownership.
    Proceed,
    /// The peer closed on request; its records are gone.
    PeerClosed,
    Done(Startup),
}

pub struct Coordinator<'a> {
    paths: &'a PlatformPaths,
    config: &'a Config,
    identity: AppIdentity,
    pid: u32,
    state: CoordinatorState,
}

impl<'a> Coordinator<'a> {
    pub fn new(paths: &'a PlatformPaths, config: &'a Config, identity: AppIdentity) -> Self {
        Self {
            paths,
            config,
            identity,
            pid: std::process::id(),
            state: CoordinatorState::Probing,
        }
    }

    /// Use a different PID for the lock record.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn identity(&self) -> &AppIdentity {
        &self.identity
    }

    fn enter(&mut self, state: CoordinatorState) {
        log::debug!("{}: {} -> {state}", self.identity, self.state);
        self.state = state;
    }

    /// Run startup coordination. `args` are forwarded to a running instance
    /// when one confirms its identity.
    pub fn start(&mut self, args: &[String]) -> Result<Startup> {
        let lock_path = self.paths.lock_path(&self.identity);
        let multi_instance = self.config.is_multi_instance(&self.identity);

        self.enter(CoordinatorState::Probing);
        let Some(mut own) =
            InstanceLockFile::open(&lock_path, OpenMode::Append, true, multi_instance)
        else {
            log::info!("not starting another instance of {}", self.identity);
            return Ok(Startup::AlreadyStarting);
        };
        let mut known = probe(self.paths, &mut own);

        if !multi_instance {
            self.enter(CoordinatorState::Relaying);
            match self.relay(&mut own, &known, args) {
                Relay::Proceed => {}
                Relay::PeerClosed => {
                    known.remove(&lock_path);
                }
                Relay::Done(startup) => return Ok(startup),
            }
        }

        self.enter(CoordinatorState::Claiming);
        let instance = self.claim(own, &known, multi_instance)?;
        self.enter(CoordinatorState::Running);
        Ok(Startup::Claimed(instance))
    }

    fn relay(&self, own: &mut InstanceLockFile, known: &KnownInstances, args: &[String]) -> Relay {
        let timeouts = self.config.timeouts();
        let Some(port) = known
            .get(own.path())
            .and_then(|records| records.first())
            .and_then(|record| record.port)
        else {
            return Relay::Proceed;
        };

        log::info!("connecting to {port}");
        let Some(mut socket) = AppSocket::connect(LOOPBACK, port, timeouts) else {
            return Relay::Proceed;
        };
        log::info!("connected to {port}, getting instance name");

        let expected = self.identity.name();
        match socket.request("getappname") {
            None => {
                log::warn!("no answer on port {port}, treating record as stale");
                return Relay::Proceed;
            }
            Some(reply) if reply.is_empty() => {
                return Relay::Done(Startup::PeerBusy { port, reply: Some(reply) });
            }
            Some(reply) if reply != expected => {
                log::info!("port {port} belongs to {reply:?}, not {expected:?}");
                return Relay::Proceed;
            }
            Some(_) => {}
        }

        if self.config.is_close_workflow(&self.identity) {
            log::info!("closing existing instance");
            // The peer rewrites the lock file while exiting.
            own.unlock();
            if !request_close(&mut socket) {
                log::info!("not starting another instance of {}", self.identity);
                return Relay::Done(Startup::AlreadyRunning { port });
            }
            drop(socket);
            if !wait_for_removal(own.path(), self.config.peer_exit_timeout()) {
                log::warn!("existing instance on port {port} did not exit in time");
                return Relay::Done(Startup::AlreadyRunning { port });
            }
            if !own.relock() {
                return Relay::Done(Startup::AlreadyStarting);
            }
            log::info!("existing instance exited");
            return Relay::PeerClosed;
        }

        log::info!("notifying existing instance");
        let forwarded: &[String] = if self.config.forwards_args(&self.identity) {
            args
        } else {
            &[]
        };
        let line = channel::format_command(self.identity.request_target(), forwarded);
        match socket.request(&line) {
            Some(reply) if reply == OK => Relay::Done(Startup::Notified { port }),
            reply => Relay::Done(Startup::PeerBusy { port, reply }),
        }
    }

    fn claim(
        &self,
        mut own: InstanceLockFile,
        known: &KnownInstances,
        multi_instance: bool,
    ) -> Result<Instance> {
        let host = if self.config.allow_network_clients {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            LOOPBACK
        };
        let used_ports: Vec<u16> = known.values().flatten().filter_map(|r| r.port).collect();
        let listener = AppListener::bind(host, self.config.port, &used_ports);
        let port = listener.as_ref().map(AppListener::port);

        if !multi_instance {
            own.truncate();
        }
        own.write(&LockRecord::new(Some(self.pid), port).to_string());
        match port {
            Some(port) => log::info!("{} listening on port {port}", self.identity),
            None => log::warn!("{} running without a listening port", self.identity),
        }

        let mut instance = Instance {
            identity: self.identity.clone(),
            lock_path: own.path().to_path_buf(),
            pid: self.pid,
            port,
            listener,
            workers: Workers::new(),
            timeouts: self.config.timeouts(),
            state: CoordinatorState::Claiming,
        };

        let missing: Vec<&str> = self
            .config
            .required_resources(&self.identity)
            .iter()
            .map(String::as_str)
            .filter(|resource| self.paths.find_data_file(resource).is_none())
            .collect();
        if !missing.is_empty() {
            drop(own);
            instance.shutdown();
            return Err(SoloError::ResourceMissing(missing.join(", ")));
        }

        if let Err(e) = fs::create_dir_all(self.paths.data_home()) {
            log::warn!("could not create directory {}: {e}", self.paths.data_home().display());
        }

        // Later launches must be able to take the lock to relay to us.
        own.unlock();
        instance.state = CoordinatorState::Running;
        Ok(instance)
    }
}

/// Read every lock file in the config home. `own` is read through its held
/// lock; other files are read under a short shared lock.
pub fn probe(paths: &PlatformPaths, own: &mut InstanceLockFile) -> KnownInstances {
    let mut known = KnownInstances::new();
    for path in paths.lock_files() {
        log::debug!("lockfile {}", path.display());
        let records = if path == own.path() {
            own.read_records()
        } else {
            match InstanceLockFile::open(&path, OpenMode::Read, false, false) {
                Some(mut lockfile) => {
                    let records = lockfile.read_records();
                    lockfile.unlock();
                    records
                }
                None => continue,
            }
        };
        for record in &records {
            log::debug!("existing client using {record}");
        }
        known.insert(path, records);
    }
    known
}

fn request_close(socket: &mut AppSocket) -> bool {
    for request in CloseRequest::FALLBACK_CHAIN {
        match socket.request(request.as_str()) {
            Some(reply) if reply.is_empty() => return true,
            Some(reply) if reply == INVALID && request == CloseRequest::Exit => {
                log::info!("peer does not know `exit`, retrying with `close`");
            }
            reply => {
                log::warn!("{} request answered with {reply:?}", request.as_str());
                return false;
            }
        }
    }
    false
}

/// Poll until `path` is gone. Returns false if it still exists after
/// `timeout`.
fn wait_for_removal(path: &Path, timeout: Duration) -> bool {
    log::info!("waiting for existing instance to exit and delete {}", path.display());
    let deadline = Instant::now() + timeout;
    while path.is_file() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
    true
}

/// Drop `own` (if given) and every record whose port refuses a connection,
/// then rewrite the file or delete it when nothing is left. Records without a
/// port cannot be verified and are kept.
pub fn purge_stale(
    lockfile: &mut InstanceLockFile,
    own: Option<(u32, Option<u16>)>,
    timeouts: Timeouts,
) -> Option<Rewritten> {
    let records = match lockfile.try_read_records() {
        Ok(records) => records,
        Err(e) => {
            log::warn!("could not read lockfile {}: {e}", lockfile.path().display());
            return None;
        }
    };
    let live: Vec<LockRecord> = records
        .into_iter()
        .filter(|record| {
            if let Some((pid, port)) = own
                && record.is_own(pid, port)
            {
                return false;
            }
            match record.port {
                Some(port) => {
                    let live = channel::port_is_live(LOOPBACK, port, timeouts.connect);
                    if !live {
                        log::info!("instance on port {port} probably died, dropping {record}");
                    }
                    live
                }
                None => true,
            }
        })
        .collect();
    Some(lockfile.rewrite(&live))
}

/// A claimed primary instance.
#[derive(Debug)]
pub struct Instance {
    identity: AppIdentity,
    lock_path: PathBuf,
    pid: u32,
    port: Option<u16>,
    listener: Option<AppListener>,
    workers: Workers,
    timeouts: Timeouts,
    state: CoordinatorState,
}

impl Instance {
    pub fn identity(&self) -> &AppIdentity {
        &self.identity
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Hand the listener to whatever serves inbound requests.
    pub fn take_listener(&mut self) -> Option<AppListener> {
        self.listener.take()
    }

    pub fn workers(&mut self) -> &mut Workers {
        &mut self.workers
    }

    /// Stop background workers, then drop our record and any dead peers'
    /// records from the lock file. Runs at most once; also run on drop.
    ///
    /// Waits for the lock: a launch holds it only while it probes or relays,
    /// which its connect and read timeouts bound.
    pub fn shutdown(&mut self) -> Option<Rewritten> {
        if self.state == CoordinatorState::Stopped {
            return None;
        }
        self.state = CoordinatorState::ShuttingDown;
        self.workers.shutdown();
        self.listener = None;

        let outcome = if self.lock_path.is_file() {
            match InstanceLockFile::open(&self.lock_path, OpenMode::ReadWrite, true, true) {
                Some(mut lockfile) => {
                    purge_stale(&mut lockfile, Some((self.pid, self.port)), self.timeouts)
                }
                None => {
                    log::warn!("could not lock {} for cleanup", self.lock_path.display());
                    None
                }
            }
        } else {
            None
        };
        log::info!("exiting {}", self.identity);
        self.state = CoordinatorState::Stopped;
        outcome
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.shutdown();
    }
}
