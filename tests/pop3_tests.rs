//! POP3 integration tests: a raw TCP client drives the server end to end

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};
use stubmail::{MailSession, MailboxStore, Pop3Server, SmtpServer};

struct TestClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TestClient {
    fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self { stream, reader }
    }

    fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line.trim_end().to_owned()
    }

    fn send(&mut self, line: &str) {
        write!(self.stream, "{line}\r\n").unwrap();
        self.stream.flush().unwrap();
    }

    fn send_command(&mut self, line: &str) -> String {
        self.send(line);
        self.read_line()
    }

    /// Read lines up to and including the `.` terminator.
    fn read_multiline(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line();
            if line == "." {
                break;
            }
            lines.push(line);
        }
        lines
    }
}

fn md5_hex(data: &[u8]) -> String {
    Md5::digest(data)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn store_with_two_messages() -> MailboxStore {
    let store = MailboxStore::new();
    let mailbox = store.add_mailbox("alice", "pw", "alice@localhost");
    mailbox.add_message("A");
    mailbox.add_message("B");
    store
}

fn start_server(store: &MailboxStore) -> Pop3Server {
    let server = Pop3Server::new(store.clone());
    server.start().unwrap();
    server
}

/// Connect and authenticate with USER/PASS, consuming the banner.
fn login(server: &Pop3Server, username: &str, secret: &str) -> TestClient {
    let mut client = TestClient::connect(server.port());
    assert!(client.read_line().starts_with("+OK POP3 server ready <"));
    assert_eq!(client.send_command(&format!("USER {username}")), "+OK");
    assert_eq!(client.send_command(&format!("PASS {secret}")), "+OK");
    client
}

#[test]
fn test_user_pass_list_retr_dele_quit() {
    let store = store_with_two_messages();
    let server = start_server(&store);
    let mut client = login(&server, "alice", "pw");

    assert_eq!(client.send_command("STAT"), "+OK 2 2");

    assert_eq!(client.send_command("LIST"), "+OK 2 messages");
    assert_eq!(client.read_multiline(), vec!["1 1", "2 1"]);

    assert_eq!(client.send_command("RETR 1"), "+OK 1 octets");
    assert_eq!(client.read_multiline(), vec!["A"]);

    assert_eq!(client.send_command("DELE 1"), "+OK");
    assert_eq!(client.send_command("STAT"), "+OK 1 1");

    assert_eq!(client.send_command("QUIT"), "+OK Goodbye");

    // the sweep kept only message B, in its original position
    let messages = store.find_mailbox("alice").unwrap().messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content(), "B");
}

#[test]
fn test_rset_restores_deleted_messages() {
    let store = store_with_two_messages();
    let server = start_server(&store);
    let mut client = login(&server, "alice", "pw");

    client.send_command("DELE 1");
    assert_eq!(client.send_command("STAT"), "+OK 1 1");

    assert_eq!(client.send_command("RSET"), "+OK");
    assert_eq!(client.send_command("STAT"), "+OK 2 2");

    assert_eq!(client.send_command("QUIT"), "+OK Goodbye");
    assert_eq!(store.find_mailbox("alice").unwrap().messages().len(), 2);
}

#[test]
fn test_top_returns_first_lines_of_message() {
    let store = MailboxStore::new();
    let mailbox = store.add_mailbox("alice", "pw", "alice@localhost");
    mailbox.add_message("L1\r\nL2\r\nL3");
    let server = start_server(&store);
    let mut client = login(&server, "alice", "pw");

    assert_eq!(client.send_command("TOP 1 2"), "+OK");
    assert_eq!(client.read_multiline(), vec!["L1", "L2"]);
}

#[test]
fn test_apop_authentication() {
    let store = store_with_two_messages();
    let server = start_server(&store);

    let mut client = TestClient::connect(server.port());
    let banner = client.read_line();
    // the banner carries the APOP challenge, angle brackets included
    let timestamp = banner.strip_prefix("+OK POP3 server ready ").unwrap();
    assert!(timestamp.starts_with('<') && timestamp.ends_with('>'));

    let digest = md5_hex(format!("{timestamp}pw").as_bytes());
    assert_eq!(client.send_command(&format!("APOP alice {digest}")), "+OK");
    assert_eq!(client.send_command("STAT"), "+OK 2 2");
}

#[test]
fn test_apop_with_wrong_digest_fails() {
    let server = start_server(&store_with_two_messages());

    let mut client = TestClient::connect(server.port());
    client.read_line();

    let digest = md5_hex(b"not the right input");
    assert_eq!(
        client.send_command(&format!("APOP alice {digest}")),
        "-ERR Authentication failed"
    );
    // still in authorization state, a correct login works afterwards
    assert_eq!(client.send_command("USER alice"), "+OK");
    assert_eq!(client.send_command("PASS pw"), "+OK");
}

#[test]
fn test_uidl_reports_content_digests() {
    let store = store_with_two_messages();
    let server = start_server(&store);
    let mut client = login(&server, "alice", "pw");

    assert_eq!(client.send_command("UIDL"), "+OK 2 messages");
    assert_eq!(
        client.read_multiline(),
        vec![
            format!("1 {}", md5_hex(b"A")),
            format!("2 {}", md5_hex(b"B"))
        ]
    );

    assert_eq!(
        client.send_command("UIDL 2"),
        format!("+OK 2 {}", md5_hex(b"B"))
    );
}

#[test]
fn test_message_numbers_stay_stable_after_dele() {
    let store = store_with_two_messages();
    let server = start_server(&store);
    let mut client = login(&server, "alice", "pw");

    client.send_command("DELE 1");

    // message B keeps number 2 while A is only flagged
    assert_eq!(client.send_command("LIST"), "+OK 1 messages");
    assert_eq!(client.read_multiline(), vec!["2 1"]);
    assert_eq!(client.send_command("RETR 2"), "+OK 1 octets");
    assert_eq!(client.read_multiline(), vec!["B"]);

    // the flagged message is gone for every transaction command
    assert_eq!(client.send_command("RETR 1"), "-ERR No such message");
    assert_eq!(client.send_command("LIST 1"), "-ERR No such message");
    assert_eq!(client.send_command("DELE 1"), "-ERR No such message");
}

#[test]
fn test_retr_applies_dot_stuffing() {
    let store = MailboxStore::new();
    let mailbox = store.add_mailbox("alice", "pw", "alice@localhost");
    mailbox.add_message(".hidden\r\nvisible");
    let server = start_server(&store);
    let mut client = login(&server, "alice", "pw");

    assert_eq!(client.send_command("RETR 1"), "+OK 16 octets");
    assert_eq!(client.read_multiline(), vec!["..hidden", "visible"]);
}

#[test]
fn test_capa_lists_capabilities() {
    let store = store_with_two_messages();
    let server = Pop3Server::new(store);
    server.set_auth_types(&["PLAIN", "CRAM-MD5"]);
    server.start().unwrap();

    let mut client = TestClient::connect(server.port());
    client.read_line();

    assert_eq!(client.send_command("CAPA"), "+OK Capability list follows");
    assert_eq!(
        client.read_multiline(),
        vec!["USER", "UIDL", "TOP", "SASL PLAIN CRAM-MD5"]
    );

    // disabled commands drop out of the capability list
    server.set_command_enabled("TOP", false);
    client.send_command("CAPA");
    assert_eq!(client.read_multiline(), vec!["USER", "UIDL", "SASL PLAIN CRAM-MD5"]);
}

#[test]
fn test_auth_plain_with_continuation() {
    let store = MailboxStore::new();
    store.add_mailbox("alice", "password", "alice@localhost");
    let server = Pop3Server::new(store);
    server.set_auth_types(&["PLAIN"]);
    server.start().unwrap();

    let mut client = TestClient::connect(server.port());
    client.read_line();

    // without an initial response the server prompts with "+ "
    assert_eq!(client.send_command("AUTH PLAIN"), "+");
    let blob = BASE64.encode("\0alice\0password");
    assert_eq!(
        client.send_command(&blob),
        "+OK Authentication successful"
    );
    assert_eq!(client.send_command("STAT"), "+OK 0 0");
}

#[test]
fn test_auth_with_initial_response() {
    let store = MailboxStore::new();
    store.add_mailbox("alice", "password", "alice@localhost");
    let server = Pop3Server::new(store);
    server.set_auth_types(&["PLAIN"]);
    server.start().unwrap();

    let mut client = TestClient::connect(server.port());
    client.read_line();

    let blob = BASE64.encode("\0alice\0password");
    assert_eq!(
        client.send_command(&format!("AUTH PLAIN {blob}")),
        "+OK Authentication successful"
    );
}

#[test]
fn test_state_violations_are_rejected() {
    let server = start_server(&store_with_two_messages());

    let mut client = TestClient::connect(server.port());
    client.read_line();

    assert_eq!(client.send_command("STAT"), "-ERR Invalid state");
    assert_eq!(client.send_command("NOOP"), "-ERR Invalid state");
    assert_eq!(client.send_command("RETR 1"), "-ERR Invalid state");

    // USER/PASS are refused once in transaction state
    client.send_command("USER alice");
    client.send_command("PASS pw");
    assert_eq!(client.send_command("USER alice"), "-ERR Invalid state");
}

#[test]
fn test_failed_login_stays_in_authorization() {
    let server = start_server(&store_with_two_messages());

    let mut client = TestClient::connect(server.port());
    client.read_line();

    client.send_command("USER alice");
    assert_eq!(
        client.send_command("PASS wrong"),
        "-ERR Authentication failed"
    );
    assert_eq!(client.send_command("STAT"), "-ERR Invalid state");

    // the second attempt succeeds
    client.send_command("USER alice");
    assert_eq!(client.send_command("PASS pw"), "+OK");
    assert_eq!(client.send_command("STAT"), "+OK 2 2");
}

#[test]
fn test_unknown_and_disabled_commands() {
    let server = start_server(&store_with_two_messages());
    server.set_command_enabled("TOP", false);

    let mut client = TestClient::connect(server.port());
    client.read_line();

    assert_eq!(client.send_command("XTND"), "-ERR Unknown command");
    assert_eq!(client.send_command("TOP 1 1"), "-ERR Disabled command");
}

#[test]
fn test_noop_twice_changes_nothing() {
    let server = start_server(&store_with_two_messages());
    let mut client = login(&server, "alice", "pw");

    assert_eq!(client.send_command("NOOP"), "+OK");
    assert_eq!(client.send_command("NOOP"), "+OK");
    assert_eq!(client.send_command("STAT"), "+OK 2 2");
}

#[test]
fn test_command_history_records_parsed_commands() {
    let server = start_server(&store_with_two_messages());
    let mut client = login(&server, "alice", "pw");

    client.send_command("STAT");
    client.send_command("RETR x");
    client.send_command("QUIT");

    let sessions = server.sessions();
    let session = sessions[0].lock().unwrap();
    let history: Vec<String> = session
        .commands()
        .iter()
        .map(|command| command.to_string())
        .collect();
    assert_eq!(history, vec!["USER alice", "PASS pw", "STAT", "QUIT"]);
    assert!(session.is_closed());
    assert_eq!(stubmail::MailSession::username(&*session), Some("alice"));
}

#[test]
fn test_mail_submitted_over_smtp_is_readable_over_pop3() {
    let store = MailboxStore::new();
    store.add_mailbox("bob", "secret", "bob@localhost");

    let smtp = SmtpServer::new(store.clone());
    smtp.start().unwrap();

    let mut sender = TestClient::connect(smtp.port());
    sender.read_line();
    sender.send_command("HELO localhost");
    sender.send_command("MAIL FROM:<alice@elsewhere>");
    sender.send_command("RCPT TO:<bob@localhost>");
    sender.send_command("DATA");
    sender.send("Subject: Crossover");
    sender.send("");
    sender.send("From SMTP to POP3");
    sender.send_command(".");
    sender.send_command("QUIT");
    smtp.stop();

    let pop3 = start_server(&store);
    let mut client = login(&pop3, "bob", "secret");
    assert_eq!(client.send_command("STAT"), "+OK 1 39");
    client.send_command("RETR 1");
    assert_eq!(
        client.read_multiline(),
        vec!["Subject: Crossover", "", "From SMTP to POP3"]
    );
}

#[test]
fn test_apop_digest_with_fixed_clock() {
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    let store = store_with_two_messages();
    let server = Pop3Server::new(store);
    server.set_clock(Arc::new(|| Utc.timestamp_millis_opt(1234).unwrap()));
    server.start().unwrap();

    let mut client = TestClient::connect(server.port());
    let banner = client.read_line();
    let timestamp = format!("<{}.1234@localhost>", std::process::id());
    assert_eq!(banner, format!("+OK POP3 server ready {timestamp}"));

    let digest = md5_hex(format!("{timestamp}pw").as_bytes());
    assert_eq!(client.send_command(&format!("APOP alice {digest}")), "+OK");
}
