//! POP3 command parsing and execution

use std::fmt;
use std::sync::Arc;

use super::error::Pop3Error;
use super::session::Pop3State;
use super::Pop3;
use crate::client::Connection;
use crate::server::{ServerCore, SessionRef};
use crate::session::MailSession;
use crate::store::{md5_hex, Message};

/// A successfully parsed POP3 command. `Display` reproduces the wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop3Command {
    Capa,
    User { username: String },
    Pass { secret: String },
    Apop { username: String, digest: String },
    Auth { mechanism: String, initial: Option<String> },
    Stat,
    List { message: Option<usize> },
    Uidl { message: Option<usize> },
    Retr { message: usize },
    Dele { message: usize },
    Top { message: usize, lines: usize },
    Noop,
    Rset,
    Quit,
}

impl fmt::Display for Pop3Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capa => write!(f, "CAPA"),
            Self::User { username } => write!(f, "USER {username}"),
            Self::Pass { secret } => write!(f, "PASS {secret}"),
            Self::Apop { username, digest } => write!(f, "APOP {username} {digest}"),
            Self::Auth {
                mechanism,
                initial: Some(initial),
            } => write!(f, "AUTH {mechanism} {initial}"),
            Self::Auth {
                mechanism,
                initial: None,
            } => write!(f, "AUTH {mechanism}"),
            Self::Stat => write!(f, "STAT"),
            Self::List { message: Some(n) } => write!(f, "LIST {n}"),
            Self::List { message: None } => write!(f, "LIST"),
            Self::Uidl { message: Some(n) } => write!(f, "UIDL {n}"),
            Self::Uidl { message: None } => write!(f, "UIDL"),
            Self::Retr { message } => write!(f, "RETR {message}"),
            Self::Dele { message } => write!(f, "DELE {message}"),
            Self::Top { message, lines } => write!(f, "TOP {message} {lines}"),
            Self::Noop => write!(f, "NOOP"),
            Self::Rset => write!(f, "RSET"),
            Self::Quit => write!(f, "QUIT"),
        }
    }
}

// parsers ----------------------------------------------------------------

pub fn parse_capa(parameters: Option<&str>) -> Result<Pop3Command, Pop3Error> {
    require_no_parameters(parameters, "CAPA")?;
    Ok(Pop3Command::Capa)
}

pub fn parse_user(parameters: Option<&str>) -> Result<Pop3Command, Pop3Error> {
    Ok(Pop3Command::User {
        username: require_word(parameters, "USER")?,
    })
}

pub fn parse_pass(parameters: Option<&str>) -> Result<Pop3Command, Pop3Error> {
    let secret = parameters
        .filter(|secret| !secret.is_empty())
        .ok_or_else(|| Pop3Error::SyntaxError("PASS requires a password".to_owned()))?;
    Ok(Pop3Command::Pass {
        secret: secret.to_owned(),
    })
}

pub fn parse_apop(parameters: Option<&str>) -> Result<Pop3Command, Pop3Error> {
    let parameters = parameters
        .map(str::trim)
        .filter(|parameters| !parameters.is_empty())
        .ok_or_else(|| Pop3Error::SyntaxError("APOP requires a name and a digest".to_owned()))?;
    let (username, digest) = parameters
        .split_once(' ')
        .ok_or_else(|| Pop3Error::SyntaxError("APOP requires a name and a digest".to_owned()))?;
    Ok(Pop3Command::Apop {
        username: username.to_owned(),
        digest: digest.trim().to_owned(),
    })
}

pub fn parse_auth(parameters: Option<&str>) -> Result<Pop3Command, Pop3Error> {
    let parameters = parameters
        .map(str::trim)
        .filter(|parameters| !parameters.is_empty())
        .ok_or_else(|| Pop3Error::SyntaxError("AUTH requires a mechanism".to_owned()))?;
    let (mechanism, initial) = match parameters.split_once(' ') {
        Some((mechanism, initial)) => (mechanism, Some(initial.trim().to_owned())),
        None => (parameters, None),
    };
    Ok(Pop3Command::Auth {
        mechanism: mechanism.to_uppercase(),
        initial,
    })
}

pub fn parse_stat(parameters: Option<&str>) -> Result<Pop3Command, Pop3Error> {
    require_no_parameters(parameters, "STAT")?;
    Ok(Pop3Command::Stat)
}

pub fn parse_list(parameters: Option<&str>) -> Result<Pop3Command, Pop3Error> {
    Ok(Pop3Command::List {
        message: parse_optional_number(parameters)?,
    })
}

pub fn parse_uidl(parameters: Option<&str>) -> Result<Pop3Command, Pop3Error> {
    Ok(Pop3Command::Uidl {
        message: parse_optional_number(parameters)?,
    })
}

pub fn parse_retr(parameters: Option<&str>) -> Result<Pop3Command, Pop3Error> {
    Ok(Pop3Command::Retr {
        message: parse_number(&require_word(parameters, "RETR")?)?,
    })
}

pub fn parse_dele(parameters: Option<&str>) -> Result<Pop3Command, Pop3Error> {
    Ok(Pop3Command::Dele {
        message: parse_number(&require_word(parameters, "DELE")?)?,
    })
}

pub fn parse_top(parameters: Option<&str>) -> Result<Pop3Command, Pop3Error> {
    let parameters = parameters
        .map(str::trim)
        .filter(|parameters| !parameters.is_empty())
        .ok_or_else(|| Pop3Error::SyntaxError("TOP requires a message number and a line count".to_owned()))?;
    let (message, lines) = parameters.split_once(' ').ok_or_else(|| {
        Pop3Error::SyntaxError("TOP requires a message number and a line count".to_owned())
    })?;
    Ok(Pop3Command::Top {
        message: parse_number(message)?,
        lines: parse_number(lines.trim())?,
    })
}

pub fn parse_noop(parameters: Option<&str>) -> Result<Pop3Command, Pop3Error> {
    require_no_parameters(parameters, "NOOP")?;
    Ok(Pop3Command::Noop)
}

pub fn parse_rset(parameters: Option<&str>) -> Result<Pop3Command, Pop3Error> {
    require_no_parameters(parameters, "RSET")?;
    Ok(Pop3Command::Rset)
}

pub fn parse_quit(parameters: Option<&str>) -> Result<Pop3Command, Pop3Error> {
    require_no_parameters(parameters, "QUIT")?;
    Ok(Pop3Command::Quit)
}

fn require_word(parameters: Option<&str>, verb: &str) -> Result<String, Pop3Error> {
    parameters
        .map(str::trim)
        .filter(|word| !word.is_empty() && !word.contains(' '))
        .map(str::to_owned)
        .ok_or_else(|| Pop3Error::SyntaxError(format!("{verb} requires one argument")))
}

fn require_no_parameters(parameters: Option<&str>, verb: &str) -> Result<(), Pop3Error> {
    if parameters.map(str::trim).unwrap_or("").is_empty() {
        Ok(())
    } else {
        Err(Pop3Error::SyntaxError(format!("{verb} takes no arguments")))
    }
}

fn parse_optional_number(parameters: Option<&str>) -> Result<Option<usize>, Pop3Error> {
    match parameters.map(str::trim).filter(|n| !n.is_empty()) {
        Some(number) => Ok(Some(parse_number(number)?)),
        None => Ok(None),
    }
}

fn parse_number(number: &str) -> Result<usize, Pop3Error> {
    number
        .parse()
        .map_err(|_| Pop3Error::SyntaxError(format!("invalid message number: {number}")))
}

// executors --------------------------------------------------------------

pub(crate) fn execute(
    command: &Pop3Command,
    server: &ServerCore<Pop3>,
    session: &SessionRef<Pop3>,
    client: &mut Connection,
) -> Result<(), Pop3Error> {
    match command {
        Pop3Command::Capa => capa(server, client),
        Pop3Command::User { username } => user(username, session, client),
        Pop3Command::Pass { secret } => pass(secret, server, session, client),
        Pop3Command::Apop { username, digest } => apop(username, digest, server, session, client),
        Pop3Command::Auth { mechanism, initial } => {
            auth(mechanism, initial.as_deref(), server, session, client)
        }
        Pop3Command::Stat => stat(session, client),
        Pop3Command::List { message } => list(*message, session, client),
        Pop3Command::Uidl { message } => uidl(*message, session, client),
        Pop3Command::Retr { message } => retr(*message, session, client),
        Pop3Command::Dele { message } => dele(*message, session, client),
        Pop3Command::Top { message, lines } => top(*message, *lines, session, client),
        Pop3Command::Noop => noop(session, client),
        Pop3Command::Rset => rset(session, client),
        Pop3Command::Quit => quit(session, client),
    }
}

fn capa(server: &ServerCore<Pop3>, client: &mut Connection) -> Result<(), Pop3Error> {
    // allowed in every state
    client.write_line("+OK Capability list follows")?;
    if server.is_command_enabled("USER") {
        client.write_line("USER")?;
    }
    if server.is_command_enabled("UIDL") {
        client.write_line("UIDL")?;
    }
    if server.is_command_enabled("TOP") {
        client.write_line("TOP")?;
    }
    let auth_types = server.auth_types();
    if !auth_types.is_empty() {
        client.write_line(&format!("SASL {}", auth_types.join(" ")))?;
    }
    client.write_line(".")?;
    Ok(())
}

fn user(
    username: &str,
    session: &SessionRef<Pop3>,
    client: &mut Connection,
) -> Result<(), Pop3Error> {
    {
        let mut session = session.lock().unwrap();
        session.expect_state(Pop3State::Authorization)?;
        session.set_user(username);
    }
    client.write_line("+OK")?;
    Ok(())
}

fn pass(
    secret: &str,
    server: &ServerCore<Pop3>,
    session: &SessionRef<Pop3>,
    client: &mut Connection,
) -> Result<(), Pop3Error> {
    {
        let mut session = session.lock().unwrap();
        session.expect_state(Pop3State::Authorization)?;
        let username = session
            .user()
            .map(str::to_owned)
            .ok_or(Pop3Error::InvalidState)?;
        session.login(&username, secret, server.store());
        if !session.is_authenticated() {
            return Err(Pop3Error::AuthenticationFailed);
        }
    }
    client.write_line("+OK")?;
    Ok(())
}

fn apop(
    username: &str,
    digest: &str,
    server: &ServerCore<Pop3>,
    session: &SessionRef<Pop3>,
    client: &mut Connection,
) -> Result<(), Pop3Error> {
    {
        let mut session = session.lock().unwrap();
        session.expect_state(Pop3State::Authorization)?;
        let mailbox = server
            .store()
            .find_mailbox(username)
            .ok_or(Pop3Error::AuthenticationFailed)?;
        let expected = md5_hex(format!("{}{}", session.timestamp(), mailbox.secret()).as_bytes());
        if digest != expected {
            return Err(Pop3Error::AuthenticationFailed);
        }
        session.bind(username, mailbox);
    }
    client.write_line("+OK")?;
    Ok(())
}

fn auth(
    mechanism: &str,
    initial: Option<&str>,
    server: &ServerCore<Pop3>,
    session: &SessionRef<Pop3>,
    client: &mut Connection,
) -> Result<(), Pop3Error> {
    session.lock().unwrap().expect_state(Pop3State::Authorization)?;

    if !server.is_auth_type_supported(mechanism) {
        return Err(Pop3Error::UnrecognizedAuthenticationType);
    }
    let authenticator = server
        .authenticator(mechanism)
        .ok_or(Pop3Error::UnrecognizedAuthenticationType)?;

    let credentials = authenticator.authenticate(initial, client, server.store())?;
    let Some(credentials) = credentials else {
        return Err(Pop3Error::AuthenticationFailed);
    };

    {
        let mut session = session.lock().unwrap();
        session.login(credentials.username(), credentials.secret(), server.store());
        if !session.is_authenticated() {
            return Err(Pop3Error::AuthenticationFailed);
        }
    }
    client.write_line("+OK Authentication successful")?;
    Ok(())
}

fn stat(session: &SessionRef<Pop3>, client: &mut Connection) -> Result<(), Pop3Error> {
    let line = {
        let session = session.lock().unwrap();
        session.expect_state(Pop3State::Transaction)?;
        let mailbox = session.mailbox().ok_or(Pop3Error::InvalidState)?;
        let messages = mailbox.messages();
        let kept: Vec<_> = messages.iter().filter(|m| !m.is_deleted()).collect();
        let size: usize = kept.iter().map(|m| m.size()).sum();
        format!("+OK {} {size}", kept.len())
    };
    client.write_line(&line)?;
    Ok(())
}

/// Non-deleted messages with their 1-based numbers. Numbers count deleted
/// messages, so they stay stable while a session marks messages for
/// deletion.
fn listed_messages(session: &SessionRef<Pop3>) -> Result<Vec<(usize, Arc<Message>)>, Pop3Error> {
    let session = session.lock().unwrap();
    session.expect_state(Pop3State::Transaction)?;
    let mailbox = session.mailbox().ok_or(Pop3Error::InvalidState)?;
    Ok(mailbox
        .messages()
        .iter()
        .enumerate()
        .filter(|(_, message)| !message.is_deleted())
        .map(|(index, message)| (index + 1, Arc::clone(message)))
        .collect())
}

/// Message by number for single-argument LIST/UIDL/RETR/TOP; deleted and
/// out-of-range numbers are both "no such message".
fn live_message(
    session: &SessionRef<Pop3>,
    number: usize,
) -> Result<Arc<Message>, Pop3Error> {
    let session = session.lock().unwrap();
    session.expect_state(Pop3State::Transaction)?;
    let message = session.message(number)?;
    if message.is_deleted() {
        return Err(Pop3Error::MessageNotFound);
    }
    Ok(message)
}

fn list(
    number: Option<usize>,
    session: &SessionRef<Pop3>,
    client: &mut Connection,
) -> Result<(), Pop3Error> {
    match number {
        Some(number) => {
            let message = live_message(session, number)?;
            client.write_line(&format!("+OK {number} {}", message.size()))?;
        }
        None => {
            let listed = listed_messages(session)?;
            client.write_line(&format!("+OK {} messages", listed.len()))?;
            for (number, message) in &listed {
                client.write_line(&format!("{number} {}", message.size()))?;
            }
            client.write_line(".")?;
        }
    }
    Ok(())
}

fn uidl(
    number: Option<usize>,
    session: &SessionRef<Pop3>,
    client: &mut Connection,
) -> Result<(), Pop3Error> {
    match number {
        Some(number) => {
            let message = live_message(session, number)?;
            client.write_line(&format!("+OK {number} {}", message.uid()))?;
        }
        None => {
            let listed = listed_messages(session)?;
            client.write_line(&format!("+OK {} messages", listed.len()))?;
            for (number, message) in &listed {
                client.write_line(&format!("{number} {}", message.uid()))?;
            }
            client.write_line(".")?;
        }
    }
    Ok(())
}

fn retr(
    number: usize,
    session: &SessionRef<Pop3>,
    client: &mut Connection,
) -> Result<(), Pop3Error> {
    let message = live_message(session, number)?;
    client.write_line(&format!("+OK {} octets", message.size()))?;
    write_multiline(client, message.content())?;
    client.write_line(".")?;
    Ok(())
}

fn dele(
    number: usize,
    session: &SessionRef<Pop3>,
    client: &mut Connection,
) -> Result<(), Pop3Error> {
    {
        let session = session.lock().unwrap();
        session.expect_state(Pop3State::Transaction)?;
        let message = session.message(number)?;
        if message.is_deleted() {
            return Err(Pop3Error::MessageNotFound);
        }
        message.set_deleted(true);
    }
    client.write_line("+OK")?;
    Ok(())
}

fn top(
    number: usize,
    lines: usize,
    session: &SessionRef<Pop3>,
    client: &mut Connection,
) -> Result<(), Pop3Error> {
    let message = live_message(session, number)?;
    client.write_line("+OK")?;
    write_multiline(client, &message.top(lines))?;
    client.write_line(".")?;
    Ok(())
}

fn noop(session: &SessionRef<Pop3>, client: &mut Connection) -> Result<(), Pop3Error> {
    session.lock().unwrap().expect_state(Pop3State::Transaction)?;
    client.write_line("+OK")?;
    Ok(())
}

fn rset(session: &SessionRef<Pop3>, client: &mut Connection) -> Result<(), Pop3Error> {
    {
        let session = session.lock().unwrap();
        session.expect_state(Pop3State::Transaction)?;
        let mailbox = session.mailbox().ok_or(Pop3Error::InvalidState)?;
        for message in mailbox.messages() {
            if message.is_deleted() {
                message.set_deleted(false);
            }
        }
    }
    client.write_line("+OK")?;
    Ok(())
}

fn quit(session: &SessionRef<Pop3>, client: &mut Connection) -> Result<(), Pop3Error> {
    {
        let mut session = session.lock().unwrap();
        session.set_state(Pop3State::Update);
        if let Some(mailbox) = session.mailbox() {
            mailbox.remove_deleted_messages();
        }
        session.close();
    }
    client.write_line("+OK Goodbye")?;
    Ok(())
}

/// Write message content line by line with dot stuffing.
fn write_multiline(client: &mut Connection, content: &str) -> Result<(), Pop3Error> {
    for line in content.split("\r\n") {
        if line.starts_with('.') {
            client.write_line(&format!(".{line}"))?;
        } else {
            client.write_line(line)?;
        }
    }
    Ok(())
}
