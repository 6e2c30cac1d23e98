use std::borrow::Cow;
use std::{fmt, io};

/// Result type used at every conveyor node boundary.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an [`Error`].
///
/// Recoverable codes describe conditions a caller may retry or ignore, such
/// as a would-block read. Critical codes describe conditions the local chain
/// cannot recover from; a sink receiving a critical error dissolves its
/// chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    /// Unspecified recoverable condition.
    GenericRecoverable,
    /// The operation would block; retry after the next readiness event.
    WouldBlock,
    /// No value is queued right now.
    NotAvailable,
    /// A bounded buffer refused the value instead of dropping it.
    BufferFull,

    /// Unspecified critical condition.
    GenericCritical,
    /// The peer closed the connection.
    Disconnected,
    /// An OS call failed.
    Os,
    /// The chain reached a state it cannot make progress from.
    InvalidState,
    /// A one-shot value was already taken.
    Exhausted,
}

impl Code {
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            Code::GenericCritical
                | Code::Disconnected
                | Code::Os
                | Code::InvalidState
                | Code::Exhausted
        )
    }

    pub fn is_recoverable(self) -> bool {
        !self.is_critical()
    }
}

/// Error value carried through conveyor chains.
///
/// Carries the recoverable/critical distinction as a [`Code`] plus a
/// human-readable message. Errors travel the same storage edges as values;
/// see the crate-level documentation for the propagation rules.
pub struct Error {
    code: Code,
    message: Cow<'static, str>,
}

impl Error {
    pub fn new(code: Code, message: impl Into<Cow<'static, str>>) -> Error {
        Error {
            code,
            message: message.into(),
        }
    }

    /// A generic critical error.
    pub fn critical(message: impl Into<Cow<'static, str>>) -> Error {
        Error::new(Code::GenericCritical, message)
    }

    /// A generic recoverable error.
    pub fn recoverable(message: impl Into<Cow<'static, str>>) -> Error {
        Error::new(Code::GenericRecoverable, message)
    }

    pub fn would_block() -> Error {
        Error::new(Code::WouldBlock, "operation would block")
    }

    pub fn disconnected() -> Error {
        Error::new(Code::Disconnected, "disconnected")
    }

    pub fn exhausted(message: impl Into<Cow<'static, str>>) -> Error {
        Error::new(Code::Exhausted, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_critical(&self) -> bool {
        self.code.is_critical()
    }

    pub fn is_recoverable(&self) -> bool {
        self.code.is_recoverable()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("code", &self.code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        let code = match err.kind() {
            io::ErrorKind::WouldBlock => return Error::would_block(),
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Code::Disconnected,
            _ => Code::Os,
        };
        Error::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_polarity() {
        assert!(Code::Exhausted.is_critical());
        assert!(Code::Disconnected.is_critical());
        assert!(Code::WouldBlock.is_recoverable());
        assert!(Code::BufferFull.is_recoverable());
        assert!(!Code::WouldBlock.is_critical());
    }

    #[test]
    fn io_error_mapping() {
        let wb: Error = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(wb.code(), Code::WouldBlock);
        assert!(wb.is_recoverable());

        let reset: Error = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(reset.code(), Code::Disconnected);

        let other: Error = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert_eq!(other.code(), Code::Os);
        assert!(other.is_critical());
    }
}
