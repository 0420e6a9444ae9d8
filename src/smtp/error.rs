//! SMTP error types and their wire responses

use std::io;

use thiserror::Error;

use crate::server::ServerError;

/// Errors raised while parsing or executing SMTP commands.
///
/// The `Display` rendering of every non-I/O variant is the complete reply
/// line sent to the client, reply code and enhanced status code included.
/// I/O errors have no reply; they terminate the connection.
#[derive(Error, Debug)]
pub enum SmtpError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("500 5.5.1 Unknown command")]
    UnknownCommand,

    #[error("502 5.5.1 Disabled command")]
    CommandDisabled,

    #[error("501 5.5.4 Syntax error: {0}")]
    SyntaxError(String),

    #[error("503 5.5.1 Bad sequence of commands")]
    BadSequenceOfCommands,

    #[error("530 5.7.0 Authentication required")]
    AuthenticationRequired,

    #[error("535 5.7.8 Authentication failed")]
    AuthenticationFailed,

    #[error("504 5.5.4 Unrecognized authentication type")]
    UnrecognizedAuthenticationType,
}

impl ServerError for SmtpError {
    fn unknown_command() -> Self {
        Self::UnknownCommand
    }

    fn command_disabled() -> Self {
        Self::CommandDisabled
    }

    fn response(&self) -> Option<String> {
        match self {
            Self::Io(_) => None,
            other => Some(other.to_string()),
        }
    }
}
