use std::{error::Error, fmt, io};

const ERR_MSG_DEADLINE: &str = "idle deadline exceeded";
const ERR_MSG_SHUTDOWN: &str = "cancelled by shutdown";
const ERR_MSG_PARENT: &str = "cancelled by parent";
const ERR_MSG_STOPPED: &str = "deadline registry is stopped";

/// Why a guarded operation was cancelled instead of completing.
///
/// Cancellation is always surfaced through this type, never through the
/// operation's own error type, so callers can tell "timed out" apart
/// from "failed".
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Cancelled {
    /// The idle deadline passed and a sweep reclaimed the registration.
    DeadlineExceeded,
    /// The registry was stopped (server shutting down).
    Shutdown,
    /// The enclosing task's cancel token was cancelled.
    Parent,
}

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cancelled::DeadlineExceeded => write!(f, "{ERR_MSG_DEADLINE}"),
            Cancelled::Shutdown => write!(f, "{ERR_MSG_SHUTDOWN}"),
            Cancelled::Parent => write!(f, "{ERR_MSG_PARENT}"),
        }
    }
}

impl Error for Cancelled {}

/// Registration was attempted on a registry that has already been stopped.
///
/// The caller must treat this as an immediate cancellation of the
/// operation it was about to guard.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RegistryStopped;

impl fmt::Display for RegistryStopped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ERR_MSG_STOPPED}")
    }
}

impl Error for RegistryStopped {}

impl From<RegistryStopped> for Cancelled {
    fn from(_: RegistryStopped) -> Self {
        Cancelled::Shutdown
    }
}

/// Server-level failures.
///
/// Per-connection failures never show up here: handler errors go to the
/// failure sink (log), idle timeouts close their own socket. Only binding
/// and the accept loop can fail the server as a whole.
#[derive(Debug)]
pub enum ServerError {
    /// Could not bind the listening socket. Fatal, no retry.
    Bind(io::Error),
    /// The accept call failed with something other than "listener closed".
    Accept(io::Error),
    /// Rejected configuration (e.g. a zero idle timeout).
    Config(String),
    /// The server went away before producing a result (root task dropped
    /// or panicked, or the handle was already consumed).
    Closed,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind(err) => write!(f, "bind failed: {err}"),
            ServerError::Accept(err) => write!(f, "accept failed: {err}"),
            ServerError::Config(msg) => write!(f, "invalid config: {msg}"),
            ServerError::Closed => write!(f, "server closed"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ServerError::Bind(err) | ServerError::Accept(err) => Some(err),
            _ => None,
        }
    }
}

impl ServerError {
    /// True when the error came from the bind step.
    #[inline]
    pub fn is_bind(&self) -> bool {
        matches!(self, ServerError::Bind(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        assert_eq!(Cancelled::DeadlineExceeded.to_string(), ERR_MSG_DEADLINE);
        assert_eq!(Cancelled::Shutdown.to_string(), ERR_MSG_SHUTDOWN);
        assert_eq!(RegistryStopped.to_string(), ERR_MSG_STOPPED);
    }

    #[test]
    fn registry_stopped_maps_to_shutdown() {
        assert_eq!(Cancelled::from(RegistryStopped), Cancelled::Shutdown);
    }

    #[test]
    fn bind_error_keeps_source() {
        let err = ServerError::Bind(io::Error::new(io::ErrorKind::AddrInUse, "taken"));
        assert!(err.is_bind());
        assert!(err.source().is_some());
    }
}
