//! Common session surface shared by the protocol state machines

use std::fmt;

/// Metadata about the accepted client socket, captured when the connection
/// is established.
#[derive(Debug, Clone, Default)]
pub struct SocketInfo {
    /// Peer address in `ip:port` form.
    pub peer_address: String,
    /// Negotiated TLS protocol version, if the connection is encrypted.
    pub ssl_protocol: Option<String>,
    /// Negotiated TLS cipher suite, if the connection is encrypted.
    pub cipher_suite: Option<String>,
}

/// Behavior the dispatch loop needs from every per-connection session.
///
/// Concrete sessions ([`SmtpSession`](crate::SmtpSession),
/// [`Pop3Session`](crate::Pop3Session)) own the command history, the
/// authenticated identity, a closed flag, and the socket metadata; this trait
/// gives the generic server core uniform access to them.
pub trait MailSession {
    type Command: Clone + fmt::Display + Send;

    /// Append a successfully parsed command to the history.
    fn record_command(&mut self, command: Self::Command);

    /// Name of the authenticated user, if any.
    fn username(&self) -> Option<&str>;

    /// Whether the session has ended (QUIT, EOF, or connection teardown).
    fn is_closed(&self) -> bool;

    /// Mark the session as ended.
    fn close(&mut self);

    fn set_socket_info(&mut self, info: SocketInfo);
}
