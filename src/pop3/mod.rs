//! Virtual POP3 server for testing (RFC 1939, AUTH per RFC 1734, CAPA per
//! RFC 2449)
//!
//! Limitations:
//! - only one client can connect at a time
//! - the mailbox is not exclusively locked by the server

pub mod commands;
mod error;
mod session;

pub use commands::Pop3Command;
pub use error::Pop3Error;
pub use session::{Pop3Session, Pop3State};

use std::io;
use std::process;

use crate::client::Connection;
use crate::server::{CommandParser, MailServer, Protocol, ServerCore, SessionRef};

/// Protocol marker instantiating the server core for POP3.
pub struct Pop3;

impl Protocol for Pop3 {
    type Command = Pop3Command;
    type Session = Pop3Session;
    type Error = Pop3Error;

    const NAME: &'static str = "POP3";
    const CONTINUATION_PREFIX: &'static str = "+";

    fn default_commands() -> Vec<(&'static str, CommandParser<Self>)> {
        vec![
            ("CAPA", commands::parse_capa as CommandParser<Self>),
            ("AUTH", commands::parse_auth),
            ("APOP", commands::parse_apop),
            ("USER", commands::parse_user),
            ("PASS", commands::parse_pass),
            ("STAT", commands::parse_stat),
            ("LIST", commands::parse_list),
            ("UIDL", commands::parse_uidl),
            ("RETR", commands::parse_retr),
            ("DELE", commands::parse_dele),
            ("TOP", commands::parse_top),
            ("NOOP", commands::parse_noop),
            ("RSET", commands::parse_rset),
            ("QUIT", commands::parse_quit),
        ]
    }

    fn create_session(server: &ServerCore<Self>) -> Pop3Session {
        // APOP challenge, issued with the banner
        let timestamp = format!(
            "<{}.{}@{}>",
            process::id(),
            server.now().timestamp_millis(),
            server.hostname()
        );
        Pop3Session::new(timestamp)
    }

    fn greet(
        _server: &ServerCore<Self>,
        session: &SessionRef<Self>,
        client: &mut Connection,
    ) -> io::Result<()> {
        let timestamp = session.lock().unwrap().timestamp().to_owned();
        client.write_line(&format!("+OK POP3 server ready {timestamp}"))
    }

    fn execute(
        command: &Pop3Command,
        server: &ServerCore<Self>,
        session: &SessionRef<Self>,
        client: &mut Connection,
    ) -> Result<(), Pop3Error> {
        commands::execute(command, server, session, client)
    }
}

/// Embedded POP3 server. Authenticate with USER/PASS, APOP, or a SASL
/// mechanism, then drive the mailbox with the usual transaction commands.
pub type Pop3Server = MailServer<Pop3>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MailboxStore;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    #[test]
    fn test_created_session_carries_apop_timestamp() {
        let server = Pop3Server::new(MailboxStore::new());
        server.set_clock(Arc::new(|| Utc.timestamp_millis_opt(567).unwrap()));
        server.set_hostname("host");

        let session = Pop3::create_session(&server);
        assert_eq!(session.timestamp(), format!("<{}.567@host>", process::id()));
    }
}
