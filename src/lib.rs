//! Single-instance coordination for desktop applications.
//!
//! The first launch of an application identity claims an advisory lock file
//! under the user's config directory, binds a loopback port and records
//! `pid:port` in the lock file. Later launches read the record, confirm the
//! peer over the port and relay their request to it instead of starting.

pub mod build_info;
pub mod channel;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod lock;
pub mod lockfile;
pub mod output;
pub mod paths;
pub mod record;
pub mod server;
pub mod workers;
