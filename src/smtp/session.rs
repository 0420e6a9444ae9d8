//! SMTP session state

use super::commands::SmtpCommand;
use crate::session::{MailSession, SocketInfo};
use crate::store::MailboxStore;

/// Explicit protocol state; commands check their preconditions against it
/// and every transition happens inside a command executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    /// Connection accepted, no HELO/EHLO seen yet.
    Connected,
    /// Greeting exchanged, ready for MAIL.
    Greeted,
    /// Sender accepted, waiting for the first recipient.
    MailTransaction,
    /// At least one recipient accepted, DATA may follow.
    RecipientAccepted,
}

/// State of one SMTP connection: the envelope being accumulated, the
/// authenticated identity, and the command history.
#[derive(Debug)]
pub struct SmtpSession {
    state: SmtpState,
    greeted_host: Option<String>,
    username: Option<String>,
    sender: Option<String>,
    recipients: Vec<String>,
    message: Option<String>,
    commands: Vec<SmtpCommand>,
    closed: bool,
    socket_info: SocketInfo,
}

impl SmtpSession {
    pub(crate) fn new() -> Self {
        Self {
            state: SmtpState::Connected,
            greeted_host: None,
            username: None,
            sender: None,
            recipients: Vec::new(),
            message: None,
            commands: Vec::new(),
            closed: false,
            socket_info: SocketInfo::default(),
        }
    }

    pub fn state(&self) -> SmtpState {
        self.state
    }

    /// Host name the client announced with HELO or EHLO.
    pub fn greeted_host(&self) -> Option<&str> {
        self.greeted_host.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// Recipients accepted so far, in insertion order, duplicates kept.
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// Content of the last message delivered on this session.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Successfully parsed commands in receipt order.
    pub fn commands(&self) -> &[SmtpCommand] {
        &self.commands
    }

    pub fn socket_info(&self) -> &SocketInfo {
        &self.socket_info
    }

    pub fn is_authenticated(&self) -> bool {
        self.username.is_some()
    }

    /// HELO/EHLO: remember the client host and drop any open transaction.
    pub(crate) fn greet(&mut self, host: &str) {
        self.greeted_host = Some(host.to_owned());
        self.reset();
    }

    /// Clear the envelope. The greeted host and the last delivered message
    /// survive.
    pub(crate) fn reset(&mut self) {
        self.sender = None;
        self.recipients.clear();
        self.state = if self.greeted_host.is_some() {
            SmtpState::Greeted
        } else {
            SmtpState::Connected
        };
    }

    pub(crate) fn is_in_transaction(&self) -> bool {
        self.sender.is_some()
    }

    pub(crate) fn start_transaction(&mut self, sender: &str) {
        self.sender = Some(sender.to_owned());
        self.recipients.clear();
        self.state = SmtpState::MailTransaction;
    }

    pub(crate) fn add_recipient(&mut self, recipient: &str) {
        self.recipients.push(recipient.to_owned());
        self.state = SmtpState::RecipientAccepted;
    }

    /// DATA finished: clear the envelope and buffer the delivered message
    /// for inspection.
    pub(crate) fn end_transaction(&mut self, message: String) {
        self.message = Some(message);
        self.reset();
    }

    /// Authenticate against the store; on a wrong secret or unknown user the
    /// session stays unauthenticated.
    pub(crate) fn login(&mut self, username: &str, secret: &str, store: &MailboxStore) {
        self.username = None;
        if let Some(mailbox) = store.find_mailbox(username) {
            if mailbox.secret() == secret {
                self.username = Some(username.to_owned());
            }
        }
    }

    pub(crate) fn logout(&mut self) {
        self.username = None;
    }
}

impl MailSession for SmtpSession {
    type Command = SmtpCommand;

    fn record_command(&mut self, command: SmtpCommand) {
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
