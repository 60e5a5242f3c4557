use crate::channel::{self, AppSocket, LOOPBACK};
use crate::config::Config;
use crate::error::{Result, SoloError};
use crate::identity::{APP_NAME, AppIdentity};
use crate::lockfile::{InstanceLockFile, OpenMode};
use crate::output::{self, Event, Format};
use crate::paths::PlatformPaths;

/// Send one raw request to the running instance of an identity and print its
/// reply.
pub fn run(
    paths: &PlatformPaths,
    config: &Config,
    module: Option<String>,
    command: String,
    args: Vec<String>,
    format: Format,
) -> Result<()> {
    let identity = AppIdentity::new(APP_NAME, module);
    let lock_path = paths.lock_path(&identity);
    if !lock_path.is_file() {
        return Err(SoloError::NoPeer(identity.name()));
    }
    let Some(mut lockfile) = InstanceLockFile::open(&lock_path, OpenMode::Read, false, false) else {
        return Err(SoloError::Locked(lock_path));
    };
    let records = lockfile.read_records();
    lockfile.unlock();

    let request = channel::format_command(&command, &args);
    for port in records.iter().filter_map(|record| record.port) {
        let Some(mut socket) = AppSocket::connect(LOOPBACK, port, config.timeouts()) else {
            continue;
        };
        let reply = socket
            .request(&request)
            .ok_or_else(|| SoloError::Transport(format!("no reply from port {port}")))?;
        return output::print_event(
            &Event::Reply {
                port,
                request: &request,
                reply: &reply,
            },
            format,
        );
    }
    Err(SoloError::NoPeer(identity.name()))
}
