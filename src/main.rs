use std::env;
use std::thread;

use stubmail::{MailboxStore, Pop3Server, SmtpServer};

fn main() {
    let args: Vec<String> = env::args().collect();

    let smtp_port = args
        .get(1)
        .and_then(|port| port.parse().ok())
        .unwrap_or(2525);
    let pop3_port = args
        .get(2)
        .and_then(|port| port.parse().ok())
        .unwrap_or(1110);

    let store = MailboxStore::new();
    store.add_mailbox("alice", "password", "alice@localhost");

    let smtp = SmtpServer::new(store.clone());
    smtp.set_port(smtp_port);
    smtp.set_auth_types(&["PLAIN", "LOGIN"]);

    let pop3 = Pop3Server::new(store);
    pop3.set_port(pop3_port);
    pop3.set_auth_types(&["PLAIN", "LOGIN"]);

    if let Err(e) = smtp.start() {
        eprintln!("failed to start SMTP server: {e}");
        std::process::exit(1);
    }
    if let Err(e) = pop3.start() {
        eprintln!("failed to start POP3 server: {e}");
        std::process::exit(1);
    }

    println!("SMTP server listening on 127.0.0.1:{}", smtp.port());
    println!("POP3 server listening on 127.0.0.1:{}", pop3.port());
    println!("Mailbox: alice / password (alice@localhost)");

    loop {
        thread::park();
    }
}
