//! POP3 error types and their wire responses

use std::io;

use thiserror::Error;

use crate::server::ServerError;

/// Errors raised while parsing or executing POP3 commands. Every non-I/O
/// variant is answered as `-ERR <message>`; I/O errors terminate the
/// connection.
#[derive(Error, Debug)]
pub enum Pop3Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Unknown command")]
    UnknownCommand,

    #[error("Disabled command")]
    CommandDisabled,

    #[error("Syntax error: {0}")]
    SyntaxError(String),

    #[error("Invalid state")]
    InvalidState,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Unrecognized authentication type")]
    UnrecognizedAuthenticationType,

    #[error("No such message")]
    MessageNotFound,
}

impl ServerError for Pop3Error {
    fn unknown_command() -> Self {
        Self::UnknownCommand
    }

    fn command_disabled() -> Self {
        Self::CommandDisabled
    }

    fn response(&self) -> Option<String> {
        match self {
            Self::Io(_) => None,
            other => Some(format!("-ERR {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_is_prefixed_err_line() {
        assert_eq!(
            Pop3Error::AuthenticationFailed.response().unwrap(),
            "-ERR Authentication failed"
        );
        assert_eq!(
            Pop3Error::MessageNotFound.response().unwrap(),
            "-ERR No such message"
        );
        assert_eq!(
            Pop3Error::SyntaxError("invalid message number: x".to_owned())
                .response()
                .unwrap(),
            "-ERR Syntax error: invalid message number: x"
        );
    }

    #[test]
    fn test_io_errors_have_no_response() {
        let error = Pop3Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(error.response().is_none());
    }
}
