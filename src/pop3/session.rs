//! POP3 session state

use std::sync::Arc;

use super::commands::Pop3Command;
use super::error::Pop3Error;
use crate::session::{MailSession, SocketInfo};
use crate::store::{Mailbox, MailboxStore, Message};

/// Protocol states per RFC 1939. Every command asserts the state it expects
/// before doing anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pop3State {
    /// Connected, not yet authenticated.
    Authorization,
    /// Authenticated, mailbox bound, normal commands available.
    Transaction,
    /// QUIT received; deleted messages are being swept.
    Update,
}

/// State of one POP3 connection: the APOP timestamp issued in the banner,
/// the bound mailbox, and the command history.
#[derive(Debug)]
pub struct Pop3Session {
    state: Pop3State,
    timestamp: String,
    user: Option<String>,
    username: Option<String>,
    mailbox: Option<Arc<Mailbox>>,
    commands: Vec<Pop3Command>,
    closed: bool,
    socket_info: SocketInfo,
}

impl Pop3Session {
    pub(crate) fn new(timestamp: String) -> Self {
        Self {
            state: Pop3State::Authorization,
            timestamp,
            user: None,
            username: None,
            mailbox: None,
            commands: Vec::new(),
            closed: false,
            socket_info: SocketInfo::default(),
        }
    }

    pub fn state(&self) -> Pop3State {
        self.state
    }

    /// APOP challenge issued with the banner, `<pid.millis@hostname>`.
    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// Mailbox bound by a successful authentication.
    pub fn mailbox(&self) -> Option<Arc<Mailbox>> {
        self.mailbox.clone()
    }

    /// Successfully parsed commands in receipt order.
    pub fn commands(&self) -> &[Pop3Command] {
        &self.commands
    }

    pub fn socket_info(&self) -> &SocketInfo {
        &self.socket_info
    }

    pub fn is_authenticated(&self) -> bool {
        self.username.is_some()
    }

    /// Candidate username announced by USER, pending PASS.
    pub(crate) fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub(crate) fn set_user(&mut self, user: &str) {
        self.user = Some(user.to_owned());
    }

    pub(crate) fn set_state(&mut self, state: Pop3State) {
        self.state = state;
    }

    pub(crate) fn expect_state(&self, expected: Pop3State) -> Result<(), Pop3Error> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Pop3Error::InvalidState)
        }
    }

    /// Verify the secret against the store and, on success, bind the mailbox
    /// and enter Transaction state.
    pub(crate) fn login(&mut self, username: &str, secret: &str, store: &MailboxStore) {
        self.username = None;
        self.mailbox = None;
        if let Some(mailbox) = store.find_mailbox(username) {
            if mailbox.secret() == secret {
                self.bind(username, mailbox);
            }
        }
    }

    /// Bind a mailbox whose credentials were already verified (APOP digest
    /// comparison).
    pub(crate) fn bind(&mut self, username: &str, mailbox: Arc<Mailbox>) {
        self.username = Some(username.to_owned());
        self.mailbox = Some(mailbox);
        self.state = Pop3State::Transaction;
    }

    /// Message by its 1-based number. Numbers count deleted messages too;
    /// callers decide whether a deleted message is acceptable.
    pub(crate) fn message(&self, number: usize) -> Result<Arc<Message>, Pop3Error> {
        let mailbox = self.mailbox.as_ref().ok_or(Pop3Error::InvalidState)?;
        number
            .checked_sub(1)
            .and_then(|index| mailbox.messages().get(index).cloned())
            .ok_or(Pop3Error::MessageNotFound)
    }
}

impl MailSession for Pop3Session {
    type Command = Pop3Command;

    fn record_command(&mut self, command: Pop3Command) {
        self.commands.push(command);
    }

    fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn set_socket_info(&mut self, info: SocketInfo) {
        self.socket_info = info;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_alice() -> MailboxStore {
        let store = MailboxStore::new();
        store.add_mailbox("alice", "password", "alice@localhost");
        store
    }

    #[test]
    fn test_new_session_is_in_authorization() {
        let session = Pop3Session::new("<1.2@localhost>".to_owned());
        assert_eq!(session.state(), Pop3State::Authorization);
        assert_eq!(session.timestamp(), "<1.2@localhost>");
        assert!(!session.is_authenticated());
        assert!(session.mailbox().is_none());
    }

    #[test]
    fn test_login_binds_mailbox_and_enters_transaction() {
        let store = store_with_alice();
        let mut session = Pop3Session::new("<1.2@localhost>".to_owned());

        session.login("alice", "password", &store);

        assert!(session.is_authenticated());
        assert_eq!(session.state(), Pop3State::Transaction);
        assert_eq!(session.mailbox().unwrap().username(), "alice");
    }

    #[test]
    fn test_login_with_wrong_secret_stays_in_authorization() {
        let store = store_with_alice();
        let mut session = Pop3Session::new("<1.2@localhost>".to_owned());

        session.login("alice", "wrong", &store);

        assert!(!session.is_authenticated());
        assert_eq!(session.state(), Pop3State::Authorization);
        assert!(session.mailbox().is_none());
    }

    #[test]
    fn test_expect_state() {
        let session = Pop3Session::new("<1.2@localhost>".to_owned());
        assert!(session.expect_state(Pop3State::Authorization).is_ok());
        assert!(matches!(
            session.expect_state(Pop3State::Transaction),
            Err(Pop3Error::InvalidState)
        ));
    }

    #[test]
    fn test_message_lookup_by_number() {
        let store = store_with_alice();
        let mailbox = store.find_mailbox("alice").unwrap();
        mailbox.add_message("A");
        mailbox.add_message("B");

        let mut session = Pop3Session::new("<1.2@localhost>".to_owned());
        session.login("alice", "password", &store);

        assert_eq!(session.message(1).unwrap().content(), "A");
        assert_eq!(session.message(2).unwrap().content(), "B");
        assert!(matches!(session.message(0), Err(Pop3Error::MessageNotFound)));
        assert!(matches!(session.message(3), Err(Pop3Error::MessageNotFound)));
    }

    #[test]
    fn test_message_lookup_without_mailbox_is_state_error() {
        let session = Pop3Session::new("<1.2@localhost>".to_owned());
        assert!(matches!(session.message(1), Err(Pop3Error::InvalidState)));
    }
}
