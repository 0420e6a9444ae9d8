//! SMTP command parsing and execution

use std::fmt;
use std::io;

use super::error::SmtpError;
use super::Smtp;
use crate::client::Connection;
use crate::server::{ServerCore, SessionRef};
use crate::session::MailSession;

/// A successfully parsed SMTP command. `Display` reproduces the wire form,
/// which makes command-history assertions in tests readable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Helo { domain: String },
    Ehlo { domain: String },
    Mail { sender: String },
    Rcpt { recipient: String },
    Data,
    Rset,
    Noop,
    Vrfy { address: String },
    Quit,
    StartTls,
    Auth { mechanism: String, initial: Option<String> },
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo { domain } => write!(f, "HELO {domain}"),
            Self::Ehlo { domain } => write!(f, "EHLO {domain}"),
            Self::Mail { sender } => write!(f, "MAIL FROM:<{sender}>"),
            Self::Rcpt { recipient } => write!(f, "RCPT TO:<{recipient}>"),
            Self::Data => write!(f, "DATA"),
            Self::Rset => write!(f, "RSET"),
            Self::Noop => write!(f, "NOOP"),
            Self::Vrfy { address } => write!(f, "VRFY {address}"),
            Self::Quit => write!(f, "QUIT"),
            Self::StartTls => write!(f, "STARTTLS"),
            Self::Auth {
                mechanism,
                initial: Some(initial),
            } => write!(f, "AUTH {mechanism} {initial}"),
            Self::Auth {
                mechanism,
                initial: None,
            } => write!(f, "AUTH {mechanism}"),
        }
    }
}

// parsers ----------------------------------------------------------------

pub fn parse_helo(parameters: Option<&str>) -> Result<SmtpCommand, SmtpError> {
    Ok(SmtpCommand::Helo {
        domain: require_domain(parameters, "HELO")?,
    })
}

pub fn parse_ehlo(parameters: Option<&str>) -> Result<SmtpCommand, SmtpError> {
    Ok(SmtpCommand::Ehlo {
        domain: require_domain(parameters, "EHLO")?,
    })
}

pub fn parse_mail(parameters: Option<&str>) -> Result<SmtpCommand, SmtpError> {
    Ok(SmtpCommand::Mail {
        sender: parse_path(parameters, "FROM:")?,
    })
}

pub fn parse_rcpt(parameters: Option<&str>) -> Result<SmtpCommand, SmtpError> {
    Ok(SmtpCommand::Rcpt {
        recipient: parse_path(parameters, "TO:")?,
    })
}

pub fn parse_data(parameters: Option<&str>) -> Result<SmtpCommand, SmtpError> {
    require_no_parameters(parameters, "DATA")?;
    Ok(SmtpCommand::Data)
}

pub fn parse_rset(parameters: Option<&str>) -> Result<SmtpCommand, SmtpError> {
    require_no_parameters(parameters, "RSET")?;
    Ok(SmtpCommand::Rset)
}

pub fn parse_noop(parameters: Option<&str>) -> Result<SmtpCommand, SmtpError> {
    require_no_parameters(parameters, "NOOP")?;
    Ok(SmtpCommand::Noop)
}

pub fn parse_vrfy(parameters: Option<&str>) -> Result<SmtpCommand, SmtpError> {
    let address = parameters
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .ok_or_else(|| SmtpError::SyntaxError("VRFY requires an address".to_owned()))?;
    Ok(SmtpCommand::Vrfy {
        address: address.to_owned(),
    })
}

pub fn parse_quit(parameters: Option<&str>) -> Result<SmtpCommand, SmtpError> {
    require_no_parameters(parameters, "QUIT")?;
    Ok(SmtpCommand::Quit)
}

/// Not registered by default; a harness that wants STARTTLS advertised adds
/// this parser under the `STARTTLS` verb.
pub fn parse_starttls(parameters: Option<&str>) -> Result<SmtpCommand, SmtpError> {
    require_no_parameters(parameters, "STARTTLS")?;
    Ok(SmtpCommand::StartTls)
}

pub fn parse_auth(parameters: Option<&str>) -> Result<SmtpCommand, SmtpError> {
    let parameters = parameters
        .map(str::trim)
        .filter(|parameters| !parameters.is_empty())
        .ok_or_else(|| SmtpError::SyntaxError("AUTH requires a mechanism".to_owned()))?;
    let (mechanism, initial) = match parameters.split_once(' ') {
        Some((mechanism, initial)) => (mechanism, Some(initial.trim().to_owned())),
        None => (parameters, None),
    };
    Ok(SmtpCommand::Auth {
        mechanism: mechanism.to_uppercase(),
        initial,
    })
}

fn require_domain(parameters: Option<&str>, verb: &str) -> Result<String, SmtpError> {
    parameters
        .map(str::trim)
        .filter(|domain| !domain.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| SmtpError::SyntaxError(format!("{verb} requires a domain argument")))
}

/// Extract the address from `FROM:<addr>` / `TO:<addr>`. The keyword is
/// matched case-insensitively; anything after the closing bracket (ESMTP
/// parameters) is ignored.
fn parse_path(parameters: Option<&str>, prefix: &str) -> Result<String, SmtpError> {
    let parameters = parameters
        .map(str::trim)
        .filter(|parameters| !parameters.is_empty())
        .ok_or_else(|| SmtpError::SyntaxError(format!("missing {prefix}<address> argument")))?;
    let keyword = parameters.get(..prefix.len());
    if !keyword.map_or(false, |keyword| keyword.eq_ignore_ascii_case(prefix)) {
        return Err(SmtpError::SyntaxError(format!(
            "expected {prefix}<address>"
        )));
    }
    let rest = parameters[prefix.len()..].trim_start();
    let rest = rest.strip_prefix('<').ok_or_else(|| {
        SmtpError::SyntaxError("address must be enclosed in angle brackets".to_owned())
    })?;
    let end = rest.find('>').ok_or_else(|| {
        SmtpError::SyntaxError("address must be enclosed in angle brackets".to_owned())
    })?;
    let address = &rest[..end];
    if address.is_empty() {
        return Err(SmtpError::SyntaxError("address must not be empty".to_owned()));
    }
    Ok(address.to_owned())
}

fn require_no_parameters(parameters: Option<&str>, verb: &str) -> Result<(), SmtpError> {
    if parameters.map(str::trim).unwrap_or("").is_empty() {
        Ok(())
    } else {
        Err(SmtpError::SyntaxError(format!("{verb} takes no arguments")))
    }
}

// executors --------------------------------------------------------------

pub(crate) fn execute(
    command: &SmtpCommand,
    server: &ServerCore<Smtp>,
    session: &SessionRef<Smtp>,
    client: &mut Connection,
) -> Result<(), SmtpError> {
    match command {
        SmtpCommand::Helo { domain } => helo(domain, server, session, client),
        SmtpCommand::Ehlo { domain } => ehlo(domain, server, session, client),
        SmtpCommand::Mail { sender } => mail(sender, server, session, client),
        SmtpCommand::Rcpt { recipient } => rcpt(recipient, session, client),
        SmtpCommand::Data => data(server, session, client),
        SmtpCommand::Rset => rset(session, client),
        SmtpCommand::Noop => noop(client),
        SmtpCommand::Vrfy { .. } => vrfy(client),
        SmtpCommand::Quit => quit(session, client),
        SmtpCommand::StartTls => starttls(client),
        SmtpCommand::Auth { mechanism, initial } => {
            auth(mechanism, initial.as_deref(), server, session, client)
        }
    }
}

fn helo(
    domain: &str,
    server: &ServerCore<Smtp>,
    session: &SessionRef<Smtp>,
    client: &mut Connection,
) -> Result<(), SmtpError> {
    session.lock().unwrap().greet(domain);
    client.write_line(&format!("250 {}", server.hostname()))?;
    Ok(())
}

fn ehlo(
    domain: &str,
    server: &ServerCore<Smtp>,
    session: &SessionRef<Smtp>,
    client: &mut Connection,
) -> Result<(), SmtpError> {
    session.lock().unwrap().greet(domain);
    client.write_line(&format!("250-{} Hello {domain}", server.hostname()))?;
    for extension in server.supported_extensions() {
        client.write_line(&format!("250-{extension}"))?;
    }
    client.write_line("250 OK")?;
    Ok(())
}

fn mail(
    sender: &str,
    server: &ServerCore<Smtp>,
    session: &SessionRef<Smtp>,
    client: &mut Connection,
) -> Result<(), SmtpError> {
    {
        let mut session = session.lock().unwrap();
        if session.is_in_transaction() {
            return Err(SmtpError::BadSequenceOfCommands);
        }
        if server.requires_authentication(&session) {
            return Err(SmtpError::AuthenticationRequired);
        }
        session.start_transaction(sender);
    }
    client.write_line("250 2.1.0 Ok")?;
    Ok(())
}

fn rcpt(
    recipient: &str,
    session: &SessionRef<Smtp>,
    client: &mut Connection,
) -> Result<(), SmtpError> {
    {
        let mut session = session.lock().unwrap();
        if !session.is_in_transaction() {
            return Err(SmtpError::BadSequenceOfCommands);
        }
        session.add_recipient(recipient);
    }
    client.write_line("250 2.1.5 Ok")?;
    Ok(())
}

fn data(
    server: &ServerCore<Smtp>,
    session: &SessionRef<Smtp>,
    client: &mut Connection,
) -> Result<(), SmtpError> {
    {
        let session = session.lock().unwrap();
        if session.recipients().is_empty() {
            return Err(SmtpError::BadSequenceOfCommands);
        }
        if server.requires_authentication(&session) {
            return Err(SmtpError::AuthenticationRequired);
        }
    }
    client.write_line("354 Send message, end with <CRLF>.<CRLF>")?;
    let message = read_message(client)?;

    let mut session = session.lock().unwrap();
    for recipient in session.recipients() {
        if let Some(mailbox) = server.store().find_mailbox(recipient) {
            mailbox.add_message(&message);
        }
    }
    session.end_transaction(message);
    drop(session);

    client.write_line("250 2.6.0 Message accepted")?;
    Ok(())
}

/// Read message lines until one holding only a dot, undoing dot stuffing.
/// Lines are joined with CRLF; the message carries no trailing CRLF.
fn read_message(client: &mut Connection) -> Result<String, SmtpError> {
    let mut lines = Vec::new();
    loop {
        let Some(line) = client.read_line()? else {
            return Err(SmtpError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during DATA",
            )));
        };
        if line == "." {
            break;
        }
        let line = line.strip_prefix('.').unwrap_or(&line);
        lines.push(line.to_owned());
    }
    Ok(lines.join("\r\n"))
}

fn rset(session: &SessionRef<Smtp>, client: &mut Connection) -> Result<(), SmtpError> {
    session.lock().unwrap().reset();
    client.write_line("250 2.0.0 Ok")?;
    Ok(())
}

fn noop(client: &mut Connection) -> Result<(), SmtpError> {
    client.write_line("250 2.0.0 Ok")?;
    Ok(())
}

fn vrfy(client: &mut Connection) -> Result<(), SmtpError> {
    // no verification, as permitted by RFC 5321 section 3.5.3
    client.write_line("252 2.5.0 Cannot verify user")?;
    Ok(())
}

fn quit(session: &SessionRef<Smtp>, client: &mut Connection) -> Result<(), SmtpError> {
    client.write_line("221 2.0.0 Goodbye")?;
    session.lock().unwrap().close();
    Ok(())
}

fn starttls(client: &mut Connection) -> Result<(), SmtpError> {
    client.write_line("454 4.7.0 TLS not available")?;
    Ok(())
}

fn auth(
    mechanism: &str,
    initial: Option<&str>,
    server: &ServerCore<Smtp>,
    session: &SessionRef<Smtp>,
    client: &mut Connection,
) -> Result<(), SmtpError> {
    // a new AUTH attempt drops any previous authentication
    session.lock().unwrap().logout();

    if !server.is_auth_type_supported(mechanism) {
        return Err(SmtpError::UnrecognizedAuthenticationType);
    }
    let authenticator = server
        .authenticator(mechanism)
        .ok_or(SmtpError::UnrecognizedAuthenticationType)?;

    let credentials = authenticator.authenticate(initial, client, server.store())?;
    let Some(credentials) = credentials else {
        return Err(SmtpError::AuthenticationFailed);
    };

    {
        let mut session = session.lock().unwrap();
        session.login(credentials.username(), credentials.secret(), server.store());
        if !session.is_authenticated() {
            return Err(SmtpError::AuthenticationFailed);
        }
    }
    client.write_line("235 2.7.0 Authentication succeeded")?;
    Ok(())
}
