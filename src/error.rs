use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SoloError {
    #[error("locked by another process: {}", .0.display())]
    Locked(PathBuf),

    #[error("could not lock {}: {source}", path.display())]
    Locking {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not unlock {}: {source}", path.display())]
    Unlocking {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed record {value:?} ({} line {line})", path.display())]
    MalformedRecord {
        path: PathBuf,
        line: usize,
        value: String,
    },

    #[error("required resource not found: {0}")]
    ResourceMissing(String),

    #[error("no running instance of {0} answered")]
    NoPeer(String),

    #[error("another instance of {0} is already running and did not accept the request")]
    PeerBusy(String),

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SoloError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Locked(_) => "locked",
            Self::Locking { .. } => "locking_error",
            Self::Unlocking { .. } => "unlocking_error",
            Self::Transport(_) => "transport_error",
            Self::MalformedRecord { .. } => "malformed_record",
            Self::ResourceMissing(_) => "resource_missing",
            Self::NoPeer(_) => "no_peer",
            Self::PeerBusy(_) => "peer_busy",
            Self::Fatal(_) => "fatal",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }

    /// True when a non-blocking lock attempt lost against another holder.
    pub fn is_contended(&self) -> bool {
        matches!(self, Self::Locked(_))
    }
}

pub type Result<T> = std::result::Result<T, SoloError>;
