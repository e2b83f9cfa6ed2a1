//! Error types for the redirector core.

use std::io;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the multiplexer and session manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from a socket, pipe, or subprocess.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A relay frame header failed to parse or had a bad magic value.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Startup failed in a way that leaves no valid session to run: the
    /// helper or relay exited early, or the relay's init string didn't match.
    #[error("fatal startup error: {0}")]
    FatalStartup(String),

    /// The relay stream died (or the relay subprocess exited) mid-session.
    /// The whole process must exit so the firewall helper can unwind its
    /// kernel rules.
    #[error("fatal runtime error: {0}")]
    FatalRuntime(String),

    /// A configuration value was invalid (bad CIDR, bad port range, missing
    /// required environment variable).
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl Error {
    /// True for errors that should terminate the whole process rather than
    /// just the flow that triggered them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::FatalStartup(_) | Error::FatalRuntime(_))
    }
}
