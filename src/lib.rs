//! # stubmail
//!
//! Embedded SMTP and POP3 test-double servers with in-memory mailboxes.
//!
//! A test starts a server on an ephemeral loopback port, points the code
//! under test at it, and afterwards inspects the captured session history,
//! the communication log, and the mailbox contents. Real mail clients can
//! authenticate (PLAIN, LOGIN, CRAM-MD5, DIGEST-MD5, XOAUTH2), submit mail
//! over SMTP, and list, retrieve, and delete messages over POP3.
//!
//! ## Quick start
//!
//! ```rust
//! use std::io::{BufRead, BufReader, Write};
//! use std::net::TcpStream;
//! use stubmail::{MailboxStore, SmtpServer};
//!
//! // mailboxes are owned by the test and shared with the server
//! let store = MailboxStore::new();
//! store.add_mailbox("alice", "password", "alice@localhost");
//!
//! let server = SmtpServer::new(store.clone());
//! server.start().unwrap();
//!
//! // the application under test would connect here
//! let mut stream = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
//! let mut reader = BufReader::new(stream.try_clone().unwrap());
//! let mut greeting = String::new();
//! reader.read_line(&mut greeting).unwrap();
//! assert!(greeting.starts_with("220"));
//!
//! write!(stream, "QUIT\r\n").unwrap();
//! let mut reply = String::new();
//! reader.read_line(&mut reply).unwrap();
//! assert!(reply.starts_with("221"));
//!
//! server.stop();
//! ```
//!
//! ## Notes
//!
//! - One client connection is served at a time per server; sessions are
//!   strictly serialized.
//! - Runs in-memory only; nothing is persisted and nothing is relayed.
//! - TLS is implicit: with `set_use_ssl(true)` the listener presents a
//!   self-signed certificate for `localhost`. STARTTLS is not negotiated.
//! - Configuration changes (ports, TLS, auth types, command set) take
//!   effect as documented on the individual methods; most verb-level
//!   settings apply immediately, listener settings at the next start.

mod client;
mod server;
mod session;
mod store;
mod tls;

pub mod auth;
pub mod pop3;
pub mod smtp;

pub use auth::{Authenticator, Credentials};
pub use client::Connection;
pub use pop3::{Pop3, Pop3Command, Pop3Error, Pop3Server, Pop3Session, Pop3State};
pub use server::{Clock, CommandParser, MailServer, Protocol, ServerCore, ServerError, SessionRef};
pub use session::{MailSession, SocketInfo};
pub use smtp::{Smtp, SmtpCommand, SmtpError, SmtpServer, SmtpSession, SmtpState};
pub use store::{Mailbox, MailboxStore, Message};
