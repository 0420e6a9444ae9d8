//! Loopback socket factory
//!
//! Supplies the listener a server binds at start: plain TCP, or implicit TLS
//! with a self-signed certificate for `localhost` generated on the fly. Only
//! the configured protocol version is enabled on a TLS listener.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use rcgen::generate_simple_self_signed;
use rustls::pki_types::PrivatePkcs8KeyDer;
use rustls::{ServerConfig, ServerConnection, StreamOwned};

use crate::session::SocketInfo;

/// TLS protocol versions the factory can pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    /// Parse a protocol name as configured via `set_ssl_protocol`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "TLSv1.2" => Some(Self::Tls12),
            "TLSv1.3" => Some(Self::Tls13),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Tls12 => "TLSv1.2",
            Self::Tls13 => "TLSv1.3",
        }
    }
}

/// A bound loopback listener, plain or TLS.
pub(crate) enum Listener {
    Plain(TcpListener),
    Tls(TcpListener, Arc<ServerConfig>),
}

impl Listener {
    /// Bind `127.0.0.1:{port}`; port 0 selects a free port.
    pub fn bind(port: u16, tls: Option<TlsVersion>) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        match tls {
            None => Ok(Self::Plain(listener)),
            Some(version) => {
                let config = self_signed_config(version)?;
                Ok(Self::Tls(listener, Arc::new(config)))
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Plain(listener) | Self::Tls(listener, _) => listener.local_addr(),
        }
    }

    /// Block until a client connects. On a TLS listener the handshake is
    /// driven to completion before the stream is handed out, so negotiated
    /// session parameters are available immediately.
    pub fn accept(&self) -> io::Result<(Stream, SocketAddr)> {
        match self {
            Self::Plain(listener) => {
                let (tcp, peer) = listener.accept()?;
                Ok((Stream::Plain(tcp), peer))
            }
            Self::Tls(listener, config) => {
                let (tcp, peer) = listener.accept()?;
                let connection = ServerConnection::new(Arc::clone(config))
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                let mut stream = StreamOwned::new(connection, tcp);
                while stream.conn.is_handshaking() {
                    stream.conn.complete_io(&mut stream.sock)?;
                }
                Ok((Stream::Tls(stream), peer))
            }
        }
    }
}

/// An accepted client stream.
pub(crate) enum Stream {
    Plain(TcpStream),
    Tls(StreamOwned<ServerConnection, TcpStream>),
}

impl Stream {
    pub fn socket_info(&self, peer: SocketAddr) -> SocketInfo {
        match self {
            Self::Plain(_) => SocketInfo {
                peer_address: peer.to_string(),
                ssl_protocol: None,
                cipher_suite: None,
            },
            Self::Tls(stream) => SocketInfo {
                peer_address: peer.to_string(),
                ssl_protocol: stream.conn.protocol_version().map(protocol_name),
                cipher_suite: stream
                    .conn
                    .negotiated_cipher_suite()
                    .map(|suite| format!("{:?}", suite.suite())),
            },
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf),
            Self::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buf),
            Self::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush(),
            Self::Tls(stream) => stream.flush(),
        }
    }
}

fn protocol_name(version: rustls::ProtocolVersion) -> String {
    match version {
        rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2".to_owned(),
        rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3".to_owned(),
        other => format!("{other:?}"),
    }
}

fn self_signed_config(version: TlsVersion) -> io::Result<ServerConfig> {
    let cert = generate_simple_self_signed(vec!["localhost".to_owned()])
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let cert_der = cert.cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let versions: &[&rustls::SupportedProtocolVersion] = match version {
        TlsVersion::Tls12 => &[&rustls::version::TLS12],
        TlsVersion::Tls13 => &[&rustls::version::TLS13],
    };
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(versions)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}
