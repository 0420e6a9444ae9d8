//! In-memory mailbox storage shared between servers and the test harness

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use md5::{Digest, Md5};

/// Lowercase hex MD5 digest, used for message UIDs and APOP verification.
pub(crate) fn md5_hex(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Collection of mailboxes, keyed by username.
///
/// The store is a cheap `Clone` handle around shared state: the test harness
/// keeps one handle and passes clones to the servers it starts. It outlives
/// server starts and stops, so messages delivered over SMTP can be fetched
/// over POP3 afterwards.
#[derive(Debug, Clone, Default)]
pub struct MailboxStore {
    mailboxes: Arc<RwLock<HashMap<String, Arc<Mailbox>>>>,
}

impl MailboxStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a mailbox for the given user. An existing mailbox with the
    /// same username is replaced.
    pub fn add_mailbox(&self, username: &str, secret: &str, email: &str) -> Arc<Mailbox> {
        let mailbox = Arc::new(Mailbox::new(username, secret, email));
        self.mailboxes
            .write()
            .unwrap()
            .insert(username.to_owned(), Arc::clone(&mailbox));
        mailbox
    }

    /// Look up a mailbox by exact username or email address.
    pub fn find_mailbox(&self, username_or_email: &str) -> Option<Arc<Mailbox>> {
        let mailboxes = self.mailboxes.read().unwrap();
        if let Some(mailbox) = mailboxes.get(username_or_email) {
            return Some(Arc::clone(mailbox));
        }
        mailboxes
            .values()
            .find(|mailbox| mailbox.email() == username_or_email)
            .map(Arc::clone)
    }

    /// Snapshot of all mailboxes, in no particular order.
    pub fn mailboxes(&self) -> Vec<Arc<Mailbox>> {
        self.mailboxes.read().unwrap().values().cloned().collect()
    }

    /// Remove all mailboxes.
    pub fn clear(&self) {
        self.mailboxes.write().unwrap().clear();
    }
}

/// A single user's inbox: credentials plus an ordered message list.
///
/// `secret` is the cleartext password checked by PLAIN, LOGIN, and USER/PASS,
/// the shared secret for CRAM-MD5, DIGEST-MD5, and APOP, and the expected
/// bearer token for XOAUTH2.
#[derive(Debug)]
pub struct Mailbox {
    username: String,
    secret: String,
    email: String,
    messages: RwLock<Vec<Arc<Message>>>,
}

impl Mailbox {
    fn new(username: &str, secret: &str, email: &str) -> Self {
        Self {
            username: username.to_owned(),
            secret: secret.to_owned(),
            email: email.to_owned(),
            messages: RwLock::new(Vec::new()),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// Append a message. Line endings are normalized to CRLF.
    pub fn add_message(&self, content: &str) {
        self.messages
            .write()
            .unwrap()
            .push(Arc::new(Message::new(content)));
    }

    /// Snapshot of the message list in insertion order. POP3 message numbers
    /// are 1-based positions in this sequence. Mutating the snapshot does not
    /// affect the mailbox.
    pub fn messages(&self) -> Vec<Arc<Message>> {
        self.messages.read().unwrap().clone()
    }

    /// Drop all messages whose deleted flag is set, keeping the rest in
    /// their original order. Called by POP3 QUIT when entering Update state.
    pub fn remove_deleted_messages(&self) {
        self.messages
            .write()
            .unwrap()
            .retain(|message| !message.is_deleted());
    }
}

/// A stored message: immutable CRLF-normalized content plus a deleted flag.
///
/// The flag is shared between a POP3 session and the harness. Flipping it on
/// a shared message is sound because a server serves one connection at a
/// time; QUIT sweeps flagged messages, RSET clears the flags.
#[derive(Debug)]
pub struct Message {
    content: String,
    deleted: AtomicBool,
}

impl Message {
    fn new(content: &str) -> Self {
        Self {
            content: normalize_crlf(content),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Size of the message in bytes.
    pub fn size(&self) -> usize {
        self.content.len()
    }

    /// Stable unique identifier: lowercase hex MD5 of the content.
    pub fn uid(&self) -> String {
        md5_hex(self.content.as_bytes())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn set_deleted(&self, deleted: bool) {
        self.deleted.store(deleted, Ordering::SeqCst);
    }

    /// First `n` lines of the content joined by CRLF, without a trailing
    /// CRLF, or the complete content if `n` is at least the line count.
    pub fn top(&self, n: usize) -> String {
        let lines: Vec<&str> = self.content.split("\r\n").collect();
        if n >= lines.len() {
            return self.content.clone();
        }
        lines[..n].join("\r\n")
    }
}

/// Rewrite lone `\n` and `\r` line endings as CRLF.
fn normalize_crlf(content: &str) -> String {
    let mut normalized = String::with_capacity(content.len());
    let mut chars = content.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                normalized.push_str("\r\n");
            }
            '\n' => normalized.push_str("\r\n"),
            other => normalized.push(other),
        }
    }
    normalized
}
