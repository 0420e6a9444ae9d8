//! Generic mail server core
//!
//! [`MailServer`] owns the listener lifecycle, the verb registry, the
//! authenticator registry, and the session history. The SMTP and POP3
//! servers are instantiations of this core over their [`Protocol`]
//! implementations, not subclasses: the protocol type contributes the
//! command set, the session type, the greeting, and the command executor,
//! while the dispatch loop, configuration surface, and threading live here.
//!
//! One worker thread serves one client connection at a time. The harness
//! thread configures the server and inspects sessions, the log, and the
//! store concurrently.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::auth::{
    self, Authenticator, CramMd5Authenticator, DigestMd5Authenticator, LoginAuthenticator,
    PlainAuthenticator, XOauth2Authenticator,
};
use crate::client::Connection;
use crate::session::MailSession;
use crate::store::MailboxStore;
use crate::tls::{Listener, TlsVersion};

/// Source of the current time, injectable for deterministic tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Parser for one verb: turns the parameter remainder of the command line
/// into a command value, or a protocol error rendered as a negative reply.
pub type CommandParser<P> =
    fn(Option<&str>) -> Result<<P as Protocol>::Command, <P as Protocol>::Error>;

/// Shared reference to a per-connection session, inspectable by the harness
/// while the worker mutates it.
pub type SessionRef<P> = Arc<Mutex<<P as Protocol>::Session>>;

/// Errors the dispatch loop knows how to answer.
pub trait ServerError: std::error::Error + From<io::Error> + Send {
    fn unknown_command() -> Self;
    fn command_disabled() -> Self;

    /// The negative response line for this error, or `None` for I/O errors,
    /// which terminate the connection instead of being answered.
    fn response(&self) -> Option<String>;
}

/// One wire protocol: the types and hooks that turn the generic core into a
/// concrete server. Implemented by [`Smtp`](crate::Smtp) and
/// [`Pop3`](crate::Pop3); an IMAP instantiation would plug in here.
pub trait Protocol: Sized + Send + Sync + 'static {
    type Command: Clone + fmt::Display + Send + 'static;
    type Session: MailSession<Command = Self::Command> + Send + 'static;
    type Error: ServerError + 'static;

    const NAME: &'static str;
    /// Prefix for SASL continuation lines: `334` on SMTP, `+` on POP3.
    const CONTINUATION_PREFIX: &'static str;

    /// Verb table registered at construction.
    fn default_commands() -> Vec<(&'static str, CommandParser<Self>)>;

    /// Fresh session state for an accepted connection.
    fn create_session(server: &ServerCore<Self>) -> Self::Session;

    /// Write the protocol banner.
    fn greet(
        server: &ServerCore<Self>,
        session: &SessionRef<Self>,
        client: &mut Connection,
    ) -> io::Result<()>;

    /// Apply a parsed command: check state preconditions, mutate the session
    /// and store, and write the reply lines.
    fn execute(
        command: &Self::Command,
        server: &ServerCore<Self>,
        session: &SessionRef<Self>,
        client: &mut Connection,
    ) -> Result<(), Self::Error>;
}

/// A started or startable mail server. Obtained as
/// [`SmtpServer`](crate::SmtpServer) or [`Pop3Server`](crate::Pop3Server);
/// dereferences to [`ServerCore`] for configuration and inspection.
///
/// Dropping the server stops it, so a test that returns early still releases
/// the listener and worker thread.
pub struct MailServer<P: Protocol> {
    core: Arc<ServerCore<P>>,
}

impl<P: Protocol> MailServer<P> {
    /// Create a server over the given store. The server is not listening
    /// until [`start`](Self::start) is called.
    pub fn new(store: MailboxStore) -> Self {
        Self {
            core: Arc::new(ServerCore::new(store)),
        }
    }

    /// Bind the loopback listener (plain or TLS) and launch the worker
    /// thread.
    ///
    /// # Panics
    ///
    /// Panics if the server is already running.
    pub fn start(&self) -> io::Result<()> {
        assert!(
            self.core.worker.lock().unwrap().is_none(),
            "server already started"
        );
        info!("starting {} server ...", P::NAME);

        let core = &self.core;
        let tls = if core.use_ssl.load(Ordering::SeqCst) {
            Some(*core.ssl_protocol.lock().unwrap())
        } else {
            None
        };
        let listener = Listener::bind(core.port.load(Ordering::SeqCst), tls)?;
        let port = listener.local_addr()?.port();
        *core.bound_port.lock().unwrap() = Some(port);

        let worker_core = Arc::clone(core);
        let handle = thread::Builder::new()
            .name(format!("{}-server-localhost-{port}", P::NAME.to_lowercase()))
            .spawn(move || worker_core.run(listener))?;
        *core.worker.lock().unwrap() = Some(handle);

        info!("{} server started on 127.0.0.1:{port}", P::NAME);
        Ok(())
    }

    /// Signal the worker to stop, wake a blocked `accept`, and wait up to
    /// five seconds for the thread to exit. Safe to call when not running.
    pub fn stop(&self) {
        let core = &self.core;
        let handle = core.worker.lock().unwrap().take();
        let Some(handle) = handle else {
            return;
        };
        info!("stopping {} server ...", P::NAME);
        core.stop.store(true, Ordering::SeqCst);

        if let Some(port) = *core.bound_port.lock().unwrap() {
            // wake the worker if it is blocked in accept
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            let _ = TcpStream::connect_timeout(&addr, Duration::from_millis(250));
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            warn!("{} server worker did not stop within five seconds", P::NAME);
        }
        *core.bound_port.lock().unwrap() = None;
        info!("{} server stopped", P::NAME);
    }
}

impl<P: Protocol> Deref for MailServer<P> {
    type Target = ServerCore<P>;

    fn deref(&self) -> &ServerCore<P> {
        &self.core
    }
}

impl<P: Protocol> Drop for MailServer<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Configuration, registries, and runtime state shared between the harness
/// thread and the worker thread.
pub struct ServerCore<P: Protocol> {
    store: MailboxStore,
    hostname: Mutex<String>,
    commands: Mutex<HashMap<String, CommandParser<P>>>,
    enabled_commands: Mutex<HashMap<String, bool>>,
    authenticators: Mutex<HashMap<String, Arc<dyn Authenticator>>>,
    auth_types: Mutex<Vec<String>>,
    authentication_required: AtomicBool,
    port: AtomicU16,
    use_ssl: AtomicBool,
    ssl_protocol: Mutex<TlsVersion>,
    clock: Mutex<Clock>,
    bound_port: Mutex<Option<u16>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stop: AtomicBool,
    sessions: Mutex<Vec<SessionRef<P>>>,
    active_session: Mutex<Option<SessionRef<P>>>,
    log: Arc<Mutex<String>>,
}

impl<P: Protocol> ServerCore<P> {
    fn new(store: MailboxStore) -> Self {
        let mut commands = HashMap::new();
        for (verb, parser) in P::default_commands() {
            commands.insert(verb.to_owned(), parser);
        }

        let mut authenticators: HashMap<String, Arc<dyn Authenticator>> = HashMap::new();
        authenticators.insert(auth::LOGIN.to_owned(), Arc::new(LoginAuthenticator));
        authenticators.insert(auth::PLAIN.to_owned(), Arc::new(PlainAuthenticator));
        authenticators.insert(auth::CRAM_MD5.to_owned(), Arc::new(CramMd5Authenticator));
        authenticators.insert(auth::DIGEST_MD5.to_owned(), Arc::new(DigestMd5Authenticator));
        authenticators.insert(auth::XOAUTH2.to_owned(), Arc::new(XOauth2Authenticator));

        Self {
            store,
            hostname: Mutex::new("localhost".to_owned()),
            commands: Mutex::new(commands),
            enabled_commands: Mutex::new(HashMap::new()),
            authenticators: Mutex::new(authenticators),
            auth_types: Mutex::new(Vec::new()),
            authentication_required: AtomicBool::new(false),
            port: AtomicU16::new(0),
            use_ssl: AtomicBool::new(false),
            ssl_protocol: Mutex::new(TlsVersion::Tls12),
            clock: Mutex::new(Arc::new(Utc::now) as Clock),
            bound_port: Mutex::new(None),
            worker: Mutex::new(None),
            stop: AtomicBool::new(false),
            sessions: Mutex::new(Vec::new()),
            active_session: Mutex::new(None),
            log: Arc::new(Mutex::new(String::new())),
        }
    }

    // configuration ------------------------------------------------------

    pub fn store(&self) -> &MailboxStore {
        &self.store
    }

    /// Hostname used in banners, HELO/EHLO replies, and APOP timestamps.
    pub fn hostname(&self) -> String {
        self.hostname.lock().unwrap().clone()
    }

    pub fn set_hostname(&self, hostname: &str) {
        assert!(!hostname.is_empty(), "hostname must not be empty");
        *self.hostname.lock().unwrap() = hostname.to_owned();
    }

    /// Port the server listens on: the actual port while running, the
    /// configured one otherwise. Port 0 selects a free port at start.
    pub fn port(&self) -> u16 {
        self.bound_port
            .lock()
            .unwrap()
            .unwrap_or_else(|| self.port.load(Ordering::SeqCst))
    }

    /// Takes effect at the next start.
    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::SeqCst);
    }

    pub fn is_use_ssl(&self) -> bool {
        self.use_ssl.load(Ordering::SeqCst)
    }

    /// Switch between a plain and an implicit-TLS listener. Takes effect at
    /// the next start.
    pub fn set_use_ssl(&self, use_ssl: bool) {
        self.use_ssl.store(use_ssl, Ordering::SeqCst);
    }

    pub fn ssl_protocol(&self) -> String {
        self.ssl_protocol.lock().unwrap().name().to_owned()
    }

    /// Select the single TLS protocol version the listener enables,
    /// `"TLSv1.2"` or `"TLSv1.3"`.
    ///
    /// # Panics
    ///
    /// Panics on an unsupported protocol name.
    pub fn set_ssl_protocol(&self, protocol: &str) {
        let version = TlsVersion::from_name(protocol)
            .unwrap_or_else(|| panic!("unsupported SSL protocol: {protocol}"));
        *self.ssl_protocol.lock().unwrap() = version;
    }

    pub fn is_authentication_required(&self) -> bool {
        self.authentication_required.load(Ordering::SeqCst)
    }

    pub fn set_authentication_required(&self, required: bool) {
        self.authentication_required.store(required, Ordering::SeqCst);
    }

    /// Whether the given session still has to authenticate before it may
    /// submit mail.
    pub(crate) fn requires_authentication(&self, session: &P::Session) -> bool {
        self.is_authentication_required() && session.username().is_none()
    }

    /// Replace the installed clock, e.g. with a fixed time for APOP tests.
    pub fn set_clock(&self, clock: Clock) {
        *self.clock.lock().unwrap() = clock;
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock.lock().unwrap())()
    }

    // authentication types ----------------------------------------------

    /// Ordered list of enabled SASL mechanism names.
    pub fn auth_types(&self) -> Vec<String> {
        self.auth_types.lock().unwrap().clone()
    }

    /// Replace the enabled mechanism list.
    ///
    /// # Panics
    ///
    /// Panics if a name has no registered authenticator.
    pub fn set_auth_types(&self, auth_types: &[&str]) {
        self.auth_types.lock().unwrap().clear();
        for auth_type in auth_types {
            self.add_auth_type(auth_type);
        }
    }

    /// Append a mechanism to the end of the enabled list, moving it there if
    /// already present.
    ///
    /// # Panics
    ///
    /// Panics if the name has no registered authenticator.
    pub fn add_auth_type(&self, auth_type: &str) {
        assert!(
            self.authenticators.lock().unwrap().contains_key(auth_type),
            "authenticator not found: {auth_type}"
        );
        let mut auth_types = self.auth_types.lock().unwrap();
        auth_types.retain(|name| name != auth_type);
        auth_types.push(auth_type.to_owned());
    }

    pub fn remove_auth_type(&self, auth_type: &str) {
        self.auth_types
            .lock()
            .unwrap()
            .retain(|name| name != auth_type);
    }

    /// Supported means enabled in the list and backed by a registered
    /// authenticator.
    pub fn is_auth_type_supported(&self, auth_type: &str) -> bool {
        self.auth_types.lock().unwrap().iter().any(|name| name == auth_type)
            && self.authenticators.lock().unwrap().contains_key(auth_type)
    }

    pub fn authenticator(&self, auth_type: &str) -> Option<Arc<dyn Authenticator>> {
        self.authenticators.lock().unwrap().get(auth_type).cloned()
    }

    /// Register an additional mechanism implementation.
    pub fn add_authenticator(&self, auth_type: &str, authenticator: Arc<dyn Authenticator>) {
        self.authenticators
            .lock()
            .unwrap()
            .insert(auth_type.to_owned(), authenticator);
    }

    // command registry ---------------------------------------------------

    /// Register (or replace) the parser for a verb. The verb is uppercased.
    pub fn add_command(&self, verb: &str, parser: CommandParser<P>) {
        self.commands
            .lock()
            .unwrap()
            .insert(verb.to_uppercase(), parser);
    }

    pub fn remove_command(&self, verb: &str) {
        self.commands.lock().unwrap().remove(&verb.to_uppercase());
    }

    /// A verb is enabled when it is registered and not explicitly disabled.
    pub fn is_command_enabled(&self, verb: &str) -> bool {
        let verb = verb.to_uppercase();
        self.commands.lock().unwrap().contains_key(&verb)
            && self
                .enabled_commands
                .lock()
                .unwrap()
                .get(&verb)
                .copied()
                .unwrap_or(true)
    }

    /// Gate dispatch of a registered verb without unregistering it. Disabled
    /// verbs answer the protocol's "disabled" error without being parsed.
    pub fn set_command_enabled(&self, verb: &str, enabled: bool) {
        self.enabled_commands
            .lock()
            .unwrap()
            .insert(verb.to_uppercase(), enabled);
    }

    // inspection ---------------------------------------------------------

    /// Transcript of the current (or most recent) connection: client lines
    /// prefixed `C: `, server lines prefixed `S: `.
    pub fn log(&self) -> String {
        self.log.lock().unwrap().clone()
    }

    /// Session of the connection currently being served, if any.
    pub fn active_session(&self) -> Option<SessionRef<P>> {
        self.active_session.lock().unwrap().clone()
    }

    /// All sessions handled by this server, oldest first.
    pub fn sessions(&self) -> Vec<SessionRef<P>> {
        self.sessions.lock().unwrap().clone()
    }

    // worker -------------------------------------------------------------

    fn run(self: Arc<Self>, listener: Listener) {
        self.stop.store(false, Ordering::SeqCst);
        let port = listener.local_addr().map(|addr| addr.port()).unwrap_or(0);

        while !self.stop.load(Ordering::SeqCst) {
            debug!("waiting for {} connection on 127.0.0.1:{port}", P::NAME);
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    if self.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!("{} accept failed: {e}", P::NAME);
                    continue;
                }
            };
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            info!("{} connection from {peer}", P::NAME);

            // previous connection's transcript is discarded
            self.log.lock().unwrap().clear();

            let mut client =
                Connection::new(stream, peer, Arc::clone(&self.log), P::CONTINUATION_PREFIX);
            let session = Arc::new(Mutex::new(P::create_session(&self)));
            session.lock().unwrap().set_socket_info(client.socket_info());
            self.sessions.lock().unwrap().push(Arc::clone(&session));
            *self.active_session.lock().unwrap() = Some(Arc::clone(&session));

            if let Err(e) = self.serve(&mut client, &session) {
                if !self.stop.load(Ordering::SeqCst) {
                    warn!("unexpected {} I/O error: {e}", P::NAME);
                }
            }

            // test code may wait for the closed flag
            let mut locked = session.lock().unwrap();
            if !locked.is_closed() {
                locked.close();
            }
            drop(locked);
            *self.active_session.lock().unwrap() = None;
        }
    }

    fn serve(&self, client: &mut Connection, session: &SessionRef<P>) -> io::Result<()> {
        P::greet(self, session, client)?;

        loop {
            let Some(line) = client.read_line()? else {
                debug!("{} client closed connection", P::NAME);
                break;
            };
            // clients may send a bare empty line, e.g. after a failed
            // authentication exchange
            if line.is_empty() {
                continue;
            }
            self.handle_command(&line, session, client)?;
            if session.lock().unwrap().is_closed() {
                break;
            }
        }
        Ok(())
    }

    fn handle_command(
        &self,
        line: &str,
        session: &SessionRef<P>,
        client: &mut Connection,
    ) -> io::Result<()> {
        let (verb, parameters) = match line.find(' ') {
            Some(position) => (line[..position].to_uppercase(), Some(&line[position + 1..])),
            None => (line.to_uppercase(), None),
        };

        let parser = self.commands.lock().unwrap().get(&verb).copied();
        let Some(parser) = parser else {
            return self.answer_failure(client, P::Error::unknown_command());
        };
        if !self.is_command_enabled(&verb) {
            return self.answer_failure(client, P::Error::command_disabled());
        }

        match parser(parameters) {
            Ok(command) => {
                session.lock().unwrap().record_command(command.clone());
                if let Err(e) = P::execute(&command, self, session, client) {
                    self.answer_failure(client, e)?;
                }
                Ok(())
            }
            Err(e) => self.answer_failure(client, e),
        }
    }

    fn answer_failure(&self, client: &mut Connection, error: P::Error) -> io::Result<()> {
        match error.response() {
            Some(line) => client.write_line(&line),
            None => Err(io::Error::new(io::ErrorKind::Other, error.to_string())),
        }
    }
}
