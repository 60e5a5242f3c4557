use std::time::Duration;

use crate::config::Config;
use crate::coordinator::{Coordinator, Instance, Startup};
use crate::error::{Result, SoloError};
use crate::identity::{APP_NAME, AppIdentity};
use crate::lockfile::Rewritten;
use crate::output::{self, Event, Format};
use crate::paths::PlatformPaths;
use crate::server::{self, DefaultHandler, Reply, Request, RequestHandler};

const WAIT_INTERVAL: Duration = Duration::from_millis(50);

/// Prints every accepted open request as it arrives.
struct Reporting {
    inner: DefaultHandler,
    identity: String,
    format: Format,
}

impl RequestHandler for Reporting {
    fn handle(&mut self, request: &Request) -> Reply {
        let reply = self.inner.handle(request);
        if let (Request::Open { args, .. }, Reply::Text(text)) = (request, &reply)
            && text == server::OK
        {
            let event = Event::Open {
                identity: &self.identity,
                args,
            };
            if let Err(e) = output::print_event(&event, self.format) {
                log::warn!("could not report open request: {e}");
            }
        }
        reply
    }
}

pub fn run(
    paths: &PlatformPaths,
    config: &Config,
    module: Option<String>,
    legacy: bool,
    args: Vec<String>,
    format: Format,
) -> Result<()> {
    let identity = AppIdentity::new(APP_NAME, module);
    let name = identity.name();
    let mut coordinator = Coordinator::new(paths, config, identity);

    let startup = coordinator.start(&args).map_err(|e| match e {
        SoloError::ResourceMissing(_) => e,
        other => SoloError::Fatal(other.to_string()),
    })?;

    match startup {
        Startup::Claimed(mut instance) => {
            output::print_event(
                &Event::Claimed {
                    identity: &name,
                    pid: instance.pid(),
                    port: instance.port(),
                    lock_file: instance.lock_path(),
                },
                format,
            )?;
            let served = serve_until_stopped(&mut instance, legacy, format);
            let removed = instance.shutdown() == Some(Rewritten::Removed);
            served.map_err(|e| SoloError::Fatal(e.to_string()))?;
            output::print_event(
                &Event::Stopped {
                    identity: &name,
                    lock_file_removed: removed,
                },
                format,
            )
        }
        Startup::Notified { port } => {
            output::print_event(&Event::Notified { identity: &name, port }, format)
        }
        Startup::AlreadyStarting => {
            output::print_event(&Event::AlreadyStarting { identity: &name }, format)
        }
        Startup::AlreadyRunning { port } => {
            output::print_event(&Event::AlreadyRunning { identity: &name, port }, format)
        }
        Startup::PeerBusy { port, reply } => {
            log::warn!("instance on port {port} replied {reply:?}");
            Err(SoloError::PeerBusy(name))
        }
    }
}

/// Serve inbound requests on a worker thread until a `close`/`exit` request
/// arrives.
fn serve_until_stopped(instance: &mut Instance, legacy: bool, format: Format) -> Result<()> {
    let Some(listener) = instance.take_listener() else {
        log::warn!("no listening socket, nothing can reach this instance");
        return Ok(());
    };
    let timeouts = instance.timeouts();
    let identity = instance.identity().clone();
    let workers = instance.workers();
    let stop = workers.stop_signal();
    workers.spawn("request-server", move |stop| {
        let mut handler = Reporting {
            identity: identity.name(),
            inner: DefaultHandler::new(identity).legacy(legacy),
            format,
        };
        if let Err(e) = server::serve(&listener, &mut handler, &stop, timeouts) {
            log::error!("request server failed: {e}");
            stop.stop();
        }
    })?;
    stop.wait(WAIT_INTERVAL);
    Ok(())
}
