use std::{io, path::PathBuf};

/// Runtime error.
///
/// `Io` wraps a failed syscall with its name, the way the kernel errno is
/// normally reported. Everything else is either caller misuse (returned
/// synchronously, state untouched) or a synthetic teardown cause.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{syscall}: {source}")]
    Io {
        syscall: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("idle timeout")]
    IdleTimeout,

    #[error("lookup of {host:?} failed: {reason}")]
    Resolve { host: String, reason: String },

    #[error("close already called")]
    CloseAlreadyCalled,

    #[error("stream is not writable")]
    NotWritable,

    #[error("stream is not connected")]
    NotConnected,

    #[error("stream is closed")]
    Closed,

    #[error("unknown token")]
    UnknownToken,

    #[error("{path:?} exists and is not a regular file")]
    PathNotFile { path: PathBuf },

    #[error("not a tcp stream")]
    NotTcp,
}

impl Error {
    pub(crate) fn io(syscall: &'static str, source: io::Error) -> Self {
        Error::Io { syscall, source }
    }

    /// A write that failed because the descriptor is gone surfaces as
    /// `NotConnected`, not a generic syscall error.
    pub(crate) fn write_failure(source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotConnected {
            Error::NotConnected
        } else {
            Error::io("write", source)
        }
    }
}
