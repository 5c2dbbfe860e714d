use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while setting up or configuring the broker.
///
/// `Bind` is fatal: there is no trace stream without a listening socket, so
/// the embedding daemon is expected to report it on stderr and exit. Every
/// other failure the broker encounters at runtime is logged and contained.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("failed to spawn receiver thread: {0}")]
    Spawn(std::io::Error),
    #[error("invalid broker option: {0}")]
    Config(String),
}

/// A wire frame or message failed verification.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("zero-length frame")]
    EmptyFrame,
    #[error("frame of {0} bytes exceeds the maximum message size")]
    Oversized(u32),
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("message carries {0} trailing bytes")]
    TrailingBytes(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single instruction could not be decoded.
#[derive(Debug, Error)]
pub enum DisasmError {
    #[error("malformed instruction at {vaddr:#x}: {msg}")]
    BadEncoding { vaddr: u64, msg: String },
    #[error("truncated instruction at {vaddr:#x}")]
    Truncated { vaddr: u64 },
}

/// The region manifest could not be loaded. The broker logs this and runs
/// without regions.
#[derive(Debug, Error)]
pub enum RegionsError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse manifest: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognized manifest format")]
    UnknownFormat,
    #[error("cannot read symbols from {}: {msg}", path.display())]
    Object { path: PathBuf, msg: String },
}
