//! Error types for the shuffle layer.

use std::fmt;

/// Error type for shuffle operations.
///
/// `Config`, `Protocol` and `State` indicate misconfiguration or caller
/// bugs and are fatal: the job cannot make progress once one is raised.
/// `Transport` and `Store` are surfaced from the collaborators and
/// propagate upward; the simulation decides whether to retry the epoch.
#[derive(Debug)]
pub enum Error {
    /// Bad configuration detected at init (unknown protocol, bad env
    /// value, envelope overflow, empty port range, ...).
    Config(String),
    /// Record or envelope disagrees with the configured shape.
    Protocol(String),
    /// Operation issued in the wrong epoch stage.
    State { expected: &'static str, actual: &'static str },
    /// Failure surfaced from the transport.
    Transport(String),
    /// Local or foreign store returned a nonzero code.
    Store(i32),
    /// A peer hung up while the layer was still running.
    Disconnected,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "bad configuration: {}", msg),
            Error::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            Error::State { expected, actual } => {
                write!(f, "bad epoch stage: expected {}, got {}", expected, actual)
            }
            Error::Transport(msg) => write!(f, "transport error: {}", msg),
            Error::Store(code) => write!(f, "store error: {}", code),
            Error::Disconnected => write!(f, "peer disconnected"),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for shuffle operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = Error::Config("id size must be nonzero".to_string());
        assert_eq!(e.to_string(), "bad configuration: id size must be nonzero");

        let e = Error::State {
            expected: "Started",
            actual: "Idle",
        };
        assert_eq!(e.to_string(), "bad epoch stage: expected Started, got Idle");

        let e = Error::Store(-1);
        assert_eq!(e.to_string(), "store error: -1");
    }
}
