/// Error taxonomy shared by every component
///
/// Module-level error enums map onto one of these kinds. The kind decides
/// how a failure is reported on the wire and whether it ends the session.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad audio format, keyword, sensitivity or language. Rejects the session.
    Configuration,

    /// Malformed frame, unexpected message, out-of-order sequence.
    Protocol,

    /// Credential rejection or internal engine failure.
    Engine,

    /// Session pool exhausted.
    ResourceExhaustion,

    /// Connection reset or timeout.
    Transport,
}

impl ErrorKind {
    /// Code sent in the `error` event
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "config",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Engine => "engine",
            ErrorKind::ResourceExhaustion => "capacity",
            ErrorKind::Transport => "transport",
        }
    }

    /// Whether the client should be told about the failure
    pub fn is_reported(&self) -> bool {
        !matches!(self, ErrorKind::Transport)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Protocol => "protocol error",
            ErrorKind::Engine => "engine error",
            ErrorKind::ResourceExhaustion => "resource exhaustion",
            ErrorKind::Transport => "transport error",
        };
        f.write_str(name)
    }
}
