use std::fmt;
use std::io;

/// Errors returned by the strandio runtime.
#[derive(Debug)]
pub enum Error {
    /// io_uring setup or operation failed.
    Io(io::Error),
    /// Ring setup failed (e.g., unsupported kernel features).
    RingSetup(String),
    /// Provided buffer ring registration failed.
    BufferRegistration(String),
    /// Address resolution produced no usable address.
    InvalidAddress(String),
    /// Submission queue remained full after draining.
    SubmissionQueueFull,
}

impl Error {
    pub(crate) fn cancelled() -> Error {
        Error::Io(io::Error::from_raw_os_error(libc::ECANCELED))
    }

    /// Whether this error is a cancelled operation (shutdown path).
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Io(e) => e.raw_os_error() == Some(libc::ECANCELED),
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::RingSetup(msg) => write!(f, "ring setup: {msg}"),
            Error::BufferRegistration(msg) => write!(f, "buffer registration: {msg}"),
            Error::InvalidAddress(msg) => write!(f, "invalid address: {msg}"),
            Error::SubmissionQueueFull => write!(f, "submission queue full"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
