//! Virtual SMTP server for testing (RFC 5321, SASL per RFC 4954)
//!
//! Limitations:
//! - only one client can connect at a time
//! - STARTTLS is answered but never negotiated (use implicit TLS instead)
//! - message formats are not validated

pub mod commands;
mod error;
mod session;

pub use commands::SmtpCommand;
pub use error::SmtpError;
pub use session::{SmtpSession, SmtpState};

use std::io;

use crate::client::Connection;
use crate::server::{CommandParser, MailServer, Protocol, ServerCore, SessionRef};

/// Protocol marker instantiating the server core for SMTP.
pub struct Smtp;

impl Protocol for Smtp {
    type Command = SmtpCommand;
    type Session = SmtpSession;
    type Error = SmtpError;

    const NAME: &'static str = "SMTP";
    const CONTINUATION_PREFIX: &'static str = "334";

    fn default_commands() -> Vec<(&'static str, CommandParser<Self>)> {
        vec![
            ("HELO", commands::parse_helo as CommandParser<Self>),
            ("EHLO", commands::parse_ehlo),
            ("MAIL", commands::parse_mail),
            ("RCPT", commands::parse_rcpt),
            ("DATA", commands::parse_data),
            ("RSET", commands::parse_rset),
            ("NOOP", commands::parse_noop),
            ("VRFY", commands::parse_vrfy),
            ("QUIT", commands::parse_quit),
            ("AUTH", commands::parse_auth),
        ]
    }

    fn create_session(_server: &ServerCore<Self>) -> SmtpSession {
        SmtpSession::new()
    }

    fn greet(
        server: &ServerCore<Self>,
        _session: &SessionRef<Self>,
        client: &mut Connection,
    ) -> io::Result<()> {
        client.write_line(&format!("220 {} Service ready", server.hostname()))
    }

    fn execute(
        command: &SmtpCommand,
        server: &ServerCore<Self>,
        session: &SessionRef<Self>,
        client: &mut Connection,
    ) -> Result<(), SmtpError> {
        commands::execute(command, server, session, client)
    }
}

/// Embedded SMTP server. Point the code under test at
/// [`port()`](ServerCore::port) and inspect delivery through the store, the
/// session history, or [`message()`](ServerCore::message).
pub type SmtpServer = MailServer<Smtp>;

impl ServerCore<Smtp> {
    /// Extension list advertised in the EHLO reply, derived from the enabled
    /// commands and the configured auth types.
    pub fn supported_extensions(&self) -> Vec<String> {
        let mut extensions = Vec::new();
        if self.is_command_enabled("STARTTLS") {
            extensions.push("STARTTLS".to_owned());
        }
        let auth_types = self.auth_types();
        if !auth_types.is_empty() {
            extensions.push(format!("AUTH {}", auth_types.join(" ")));
        }
        extensions
    }

    /// Content of the most recently delivered message, if any.
    pub fn message(&self) -> Option<String> {
        self.sessions()
            .iter()
            .rev()
            .find_map(|session| session.lock().unwrap().message().map(str::to_owned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MailboxStore;

    #[test]
    fn test_default_extensions_are_empty() {
        let server = SmtpServer::new(MailboxStore::new());
        assert!(server.supported_extensions().is_empty());
    }

    #[test]
    fn test_auth_types_show_up_in_extensions() {
        let server = SmtpServer::new(MailboxStore::new());
        server.set_auth_types(&["PLAIN", "LOGIN"]);
        assert_eq!(server.supported_extensions(), vec!["AUTH PLAIN LOGIN"]);
    }

    #[test]
    fn test_starttls_advertised_once_registered() {
        let server = SmtpServer::new(MailboxStore::new());
        server.add_command("STARTTLS", commands::parse_starttls);
        server.set_auth_types(&["PLAIN"]);
        assert_eq!(
            server.supported_extensions(),
            vec!["STARTTLS", "AUTH PLAIN"]
        );
    }
}
