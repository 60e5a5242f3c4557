//! Loopback request/response transport.
//!
//! Requests are single lines. Replies are arbitrary text terminated by the
//! end-of-transmission byte, so an empty reply is distinguishable from a
//! dropped connection.

use std::borrow::Cow;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

/// End-of-transmission marker terminating every reply.
pub const SENTINEL: u8 = 0x04;

/// Per-`recv`/`accept` wait while probing peers.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(200);

const RETRY_DELAY: Duration = Duration::from_millis(50);
const ACCEPT_SPIN: Duration = Duration::from_millis(10);

/// Characters that force an argument to be double-quoted on the wire.
const SHELL_SPECIAL: &str = "^!$%&()[]{}=;'+,`~\"\\";

pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Upper bound for establishing a connection.
    pub connect: Duration,
    /// Upper bound for a whole reply (or request line) to arrive.
    pub read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(1),
            read: Duration::from_secs(5),
        }
    }
}

/// Client end of a loopback connection (also used by the server for each
/// accepted connection).
#[derive(Debug)]
pub struct AppSocket {
    stream: TcpStream,
    peer: SocketAddr,
    timeouts: Timeouts,
    pending: Vec<u8>,
}

impl AppSocket {
    /// Connect to `host:port`. A refused or timed-out connection usually
    /// means the peer died after recording its port; it is logged and
    /// reported as `None`.
    pub fn connect(host: IpAddr, port: u16, timeouts: Timeouts) -> Option<Self> {
        let addr = SocketAddr::new(host, port);
        match TcpStream::connect_timeout(&addr, timeouts.connect) {
            Ok(stream) => Self::from_stream(stream, timeouts).ok(),
            Err(e) => {
                log::warn!("connection to {addr} failed: {e}");
                None
            }
        }
    }

    /// Connect by host name, trying every resolved address.
    pub fn connect_host(host: &str, port: u16, timeouts: Timeouts) -> Option<Self> {
        let addrs = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                log::warn!("could not resolve {host}: {e}");
                return None;
            }
        };
        addrs
            .into_iter()
            .find_map(|addr| Self::connect(addr.ip(), addr.port(), timeouts))
    }

    pub fn from_stream(stream: TcpStream, timeouts: Timeouts) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        Self::with_peer(stream, peer, timeouts)
    }

    fn with_peer(stream: TcpStream, peer: SocketAddr, timeouts: Timeouts) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(POLL_TIMEOUT))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            peer,
            timeouts,
            pending: Vec::new(),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send one request line. Returns false if the connection is gone.
    pub fn send(&mut self, payload: &str) -> bool {
        let mut line = String::with_capacity(payload.len() + 1);
        line.push_str(payload);
        line.push('\n');
        match self.stream.write_all(line.as_bytes()).and_then(|_| self.stream.flush()) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("could not send data {payload:?} to {}: {e}", self.peer);
                false
            }
        }
    }

    /// Read one reply. `Some("")` is an empty but complete reply; `None`
    /// means the sentinel never arrived.
    pub fn read(&mut self) -> Option<String> {
        let frame = self.read_until(SENTINEL)?;
        Some(String::from_utf8_lossy(&frame).trim_end().to_string())
    }

    /// Read one request line (server side). `None` on EOF or idle timeout.
    pub fn read_line(&mut self) -> Option<String> {
        let frame = self.read_until(b'\n')?;
        Some(String::from_utf8_lossy(&frame).trim().to_string())
    }

    /// Send a request and wait for its reply.
    pub fn request(&mut self, payload: &str) -> Option<String> {
        if !self.send(payload) {
            return None;
        }
        log::debug!("sent {payload:?} to {}, awaiting response", self.peer);
        let reply = self.read();
        log::debug!("got response {reply:?}");
        reply
    }

    /// Write a reply followed by the sentinel.
    pub fn reply(&mut self, text: &str) -> bool {
        let mut frame = Vec::with_capacity(text.len() + 1);
        frame.extend_from_slice(text.as_bytes());
        frame.push(SENTINEL);
        match self.stream.write_all(&frame).and_then(|_| self.stream.flush()) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("could not reply to {}: {e}", self.peer);
                false
            }
        }
    }

    fn read_until(&mut self, delimiter: u8) -> Option<Vec<u8>> {
        let deadline = Instant::now() + self.timeouts.read;
        let mut buf = [0u8; 1024];
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == delimiter) {
                let frame: Vec<u8> = self.pending.drain(..=pos).collect();
                return Some(frame[..pos].to_vec());
            }
            match self.stream.read(&mut buf) {
                Ok(0) => return None,
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    if Instant::now() >= deadline {
                        log::warn!("timed out waiting for data from {}", self.peer);
                        return None;
                    }
                    thread::sleep(RETRY_DELAY);
                }
                Err(e) => {
                    log::warn!("could not receive data from {}: {e}", self.peer);
                    return None;
                }
            }
        }
    }
}

/// Failures that belong to one connection rather than to the listener.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
    )
}

/// Whether something accepts connections on `port`.
pub fn port_is_live(host: IpAddr, port: u16, timeout: Duration) -> bool {
    TcpStream::connect_timeout(&SocketAddr::new(host, port), timeout).is_ok()
}

/// Listening end owned by the primary instance.
#[derive(Debug)]
pub struct AppListener {
    listener: TcpListener,
    addr: SocketAddr,
}

impl AppListener {
    /// Bind `default_port` unless another instance already recorded it, then
    /// fall back to an ephemeral port. `None` when neither works.
    pub fn bind(host: IpAddr, default_port: u16, used_ports: &[u16]) -> Option<Self> {
        let mut candidates = Vec::with_capacity(2);
        if default_port != 0 && !used_ports.contains(&default_port) {
            candidates.push(default_port);
        }
        candidates.push(0);

        for port in candidates {
            let listener = match TcpListener::bind((host, port)) {
                Ok(listener) => listener,
                Err(e) if port != 0 => {
                    log::info!("could not bind to {host}:{port}: {e}, trying an ephemeral port");
                    continue;
                }
                Err(e) => {
                    log::warn!("could not bind to {host}:{port}: {e}");
                    return None;
                }
            };
            if let Err(e) = listener.set_nonblocking(true) {
                log::warn!("could not set socket timeout: {e}");
                return None;
            }
            return match listener.local_addr() {
                Ok(addr) => Some(Self { listener, addr }),
                Err(e) => {
                    log::warn!("could not get socket address: {e}");
                    None
                }
            };
        }
        None
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait up to `wait` for one connection. `Ok(None)` on timeout.
    /// Connections that fail before they can be set up are logged and
    /// skipped; only errors of the listening socket itself are returned.
    pub fn accept(&self, wait: Duration, timeouts: Timeouts) -> io::Result<Option<AppSocket>> {
        let deadline = Instant::now() + wait;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => match AppSocket::with_peer(stream, peer, timeouts) {
                    Ok(socket) => return Ok(Some(socket)),
                    Err(e) => log::warn!("dropping connection from {peer}: {e}"),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(ACCEPT_SPIN);
                }
                Err(e) if is_connection_error(&e) => {
                    log::warn!("inbound connection failed: {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Quote one argument for the wire when it contains whitespace or shell
/// metacharacters.
pub fn quote_arg(arg: &str) -> Cow<'_, str> {
    let needs_quotes = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || SHELL_SPECIAL.contains(c));
    if !needs_quotes {
        return Cow::Borrowed(arg);
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    Cow::Owned(quoted)
}

/// Build a request line from a command and its arguments.
pub fn format_command<S: AsRef<str>>(command: &str, args: &[S]) -> String {
    std::iter::once(quote_arg(command))
        .chain(args.iter().map(|arg| quote_arg(arg.as_ref())))
        .collect::<Vec<_>>()
        .join(" ")
}
