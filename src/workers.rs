//! Background threads owned by a running instance.
//!
//! Workers share one stop flag. They are stopped and joined before the
//! instance touches its lock file during shutdown.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Cooperative stop flag handed to every worker.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Block until stopped, checking every `interval`.
    pub fn wait(&self, interval: Duration) {
        while !self.is_stopped() {
            thread::sleep(interval);
        }
    }
}

#[derive(Debug, Default)]
pub struct Workers {
    stop: StopSignal,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Spawn a named worker. The closure receives the shared stop flag and
    /// should return soon after it is set.
    pub fn spawn<F>(&mut self, name: &str, work: F) -> io::Result<()>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let stop = self.stop.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || work(stop))?;
        self.handles.push(handle);
        Ok(())
    }

    /// Signal every worker and wait for all of them to exit.
    pub fn shutdown(&mut self) {
        self.stop.stop();
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            log::info!("waiting for thread {name} to exit");
            if handle.join().is_err() {
                log::warn!("thread {name} panicked");
            } else {
                log::info!("{name} exited");
            }
        }
    }
}
