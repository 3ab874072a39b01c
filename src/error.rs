//! Error handling utils.
//!
//! The runtime distinguishes two failure classes. Programmer precondition
//! violations (resuming a fiber that is not READY, arming an event twice,
//! binding a second scheduler to a thread) are fatal and assert. Transient
//! syscall failures are reported to the caller as [`Error`] values built
//! from the thread's errno, without modifying runtime state.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all recoverable error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] io::Error),
}

impl Error {
    /// Capture the calling thread's errno as an [`Error`].
    #[inline]
    pub(crate) fn last_os_error() -> Self {
        Error::IO(io::Error::last_os_error())
    }
}
