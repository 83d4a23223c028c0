use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// Operational severity used for locally logged and network-broadcast
/// error reports. Only `Severe` is expected to terminate a node, and
/// that decision belongs to the embedding application.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Severity {
    Message,
    Warning,
    Error,
    Severe,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message => write!(f, "message"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Severe => write!(f, "severe"),
        }
    }
}

#[derive(Debug)]
pub enum NetError {
    InvalidArgument(String),
    Io(io::Error),
    Serialization(postcard::Error),
    WireClosed,
    /// The node is not the primary master but the operation requires it.
    NotPrimary,
    /// No live client with the given instance id.
    UnknownClient(u32),
    /// Content message for a plugin this node does not have.
    UnknownPlugin(String),
    /// A download token failed validation (bad signature or expired).
    InvalidToken,
    /// The download queue is at its bound.
    DownloadQueueFull,
    /// A resource fetch failed; the resource stays unreached.
    DownloadFailed(String),
    /// The advertised source returned a non-success HTTP status.
    HttpStatus(u16),
    Internal(String),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Io(err) => write!(f, "IO error: {err}"),
            Self::Serialization(err) => write!(f, "serialization error: {err}"),
            Self::WireClosed => write!(f, "wire closed"),
            Self::NotPrimary => write!(f, "not primary master"),
            Self::UnknownClient(id) => write!(f, "unknown client: {id:08x}"),
            Self::UnknownPlugin(name) => write!(f, "unknown plugin: {name}"),
            Self::InvalidToken => write!(f, "invalid resource token"),
            Self::DownloadQueueFull => write!(f, "download queue full"),
            Self::DownloadFailed(msg) => write!(f, "download failed: {msg}"),
            Self::HttpStatus(code) => write!(f, "unexpected HTTP status: {code}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for NetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<postcard::Error> for NetError {
    fn from(err: postcard::Error) -> Self {
        Self::Serialization(err)
    }
}
