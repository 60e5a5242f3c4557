//! Answering requests relayed by later launches.

use std::io;

use crate::channel::{AppListener, AppSocket, POLL_TIMEOUT, Timeouts};
use crate::identity::AppIdentity;
use crate::workers::StopSignal;

/// Reply to a request that is not understood.
pub const INVALID: &str = "invalid";
/// Reply acknowledging an open request.
pub const OK: &str = "ok";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Identity probe.
    GetAppName,
    /// End the current workflow gracefully.
    Close,
    /// Terminate the instance.
    Exit,
    /// Handle `args` as if launched with them.
    Open { target: String, args: Vec<String> },
    /// Empty or unparsable line.
    Invalid(String),
}

impl Request {
    pub fn parse(line: &str) -> Self {
        let mut tokens = match shell_words::split(line) {
            Ok(tokens) => tokens.into_iter(),
            Err(e) => {
                log::warn!("could not parse request {line:?}: {e}");
                return Self::Invalid(line.to_string());
            }
        };
        let Some(command) = tokens.next() else {
            return Self::Invalid(line.to_string());
        };
        match command.as_str() {
            "getappname" => Self::GetAppName,
            "close" => Self::Close,
            "exit" => Self::Exit,
            _ => Self::Open {
                target: command,
                args: tokens.collect(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    /// Acknowledge with an empty reply and stop serving.
    Shutdown,
}

pub trait RequestHandler {
    fn handle(&mut self, request: &Request) -> Reply;
}

/// Handler used by the `solo run` main loop.
#[derive(Debug, Clone)]
pub struct DefaultHandler {
    identity: AppIdentity,
    legacy: bool,
    opened: Vec<Vec<String>>,
}

impl DefaultHandler {
    pub fn new(identity: AppIdentity) -> Self {
        Self {
            identity,
            legacy: false,
            opened: Vec::new(),
        }
    }

    /// Behave like peers that predate the `exit` command.
    pub fn legacy(mut self, legacy: bool) -> Self {
        self.legacy = legacy;
        self
    }

    /// Argument lists received through open requests, oldest first.
    pub fn opened(&self) -> &[Vec<String>] {
        &self.opened
    }
}

impl RequestHandler for DefaultHandler {
    fn handle(&mut self, request: &Request) -> Reply {
        match request {
            Request::GetAppName => Reply::Text(self.identity.name()),
            Request::Exit if self.legacy => Reply::Text(INVALID.into()),
            Request::Close | Request::Exit => Reply::Shutdown,
            Request::Open { target, args } if target == self.identity.request_target() => {
                log::info!("open request: {args:?}");
                self.opened.push(args.clone());
                Reply::Text(OK.into())
            }
            Request::Open { .. } | Request::Invalid(_) => Reply::Text(INVALID.into()),
        }
    }
}

/// Serve connections one at a time until the handler asks to shut down or
/// `stop` is set. Each connection may carry several request lines.
pub fn serve<H: RequestHandler>(
    listener: &AppListener,
    handler: &mut H,
    stop: &StopSignal,
    timeouts: Timeouts,
) -> io::Result<()> {
    while !stop.is_stopped() {
        let Some(mut conn) = listener.accept(POLL_TIMEOUT, timeouts)? else {
            continue;
        };
        log::debug!("connection from {}", conn.peer());
        if serve_connection(&mut conn, handler) {
            stop.stop();
        }
    }
    Ok(())
}

/// Returns true when the handler asked to shut down.
fn serve_connection<H: RequestHandler>(conn: &mut AppSocket, handler: &mut H) -> bool {
    while let Some(line) = conn.read_line() {
        let request = Request::parse(&line);
        log::debug!("request {request:?}");
        match handler.handle(&request) {
            Reply::Text(text) => {
                if !conn.reply(&text) {
                    return false;
                }
            }
            Reply::Shutdown => {
                conn.reply("");
                return true;
            }
        }
    }
    false
}
