//! Line-oriented client connection
//!
//! Frames CRLF-terminated lines over the accepted stream and records both
//! directions in the server's communication log. Bytes map to chars one to
//! one (Latin-1), so 8-bit message content passes through unchanged.

use std::io::{self, BufRead, BufReader, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::session::SocketInfo;
use crate::tls::Stream;

/// One client connection, created per accepted socket and discarded when the
/// dispatch loop exits.
pub struct Connection {
    stream: BufReader<Stream>,
    log: Arc<Mutex<String>>,
    continuation_prefix: &'static str,
    socket_info: SocketInfo,
}

impl Connection {
    pub(crate) fn new(
        stream: Stream,
        peer: SocketAddr,
        log: Arc<Mutex<String>>,
        continuation_prefix: &'static str,
    ) -> Self {
        let socket_info = stream.socket_info(peer);
        Self {
            stream: BufReader::new(stream),
            log,
            continuation_prefix,
            socket_info,
        }
    }

    pub(crate) fn socket_info(&self) -> SocketInfo {
        self.socket_info.clone()
    }

    /// Read the next line, without its CRLF terminator. Returns `None` when
    /// the client has closed the connection.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut buffer = Vec::new();
        let n = match self.stream.read_until(b'\n', &mut buffer) {
            Ok(n) => n,
            // a TLS peer that drops the socket without close_notify surfaces
            // as UnexpectedEof; treat it like a plain EOF
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => 0,
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Ok(None);
        }
        while buffer.last() == Some(&b'\n') || buffer.last() == Some(&b'\r') {
            buffer.pop();
        }
        let line: String = buffer.iter().map(|&b| b as char).collect();
        self.append_log("C: ", &line);
        Ok(Some(line))
    }

    /// Write `line` followed by CRLF and flush. The line is logged first so
    /// a harness that saw the reply also sees it in the log.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.append_log("S: ", line);
        let mut bytes: Vec<u8> = line.chars().map(|c| c as u8).collect();
        bytes.extend_from_slice(b"\r\n");
        let stream = self.stream.get_mut();
        stream.write_all(&bytes)?;
        stream.flush()?;
        Ok(())
    }

    /// Write a SASL continuation: `334 <prompt>` on SMTP, `+ <prompt>` on
    /// POP3.
    pub fn write_continuation(&mut self, prompt: &str) -> io::Result<()> {
        self.write_line(&format!("{} {}", self.continuation_prefix, prompt))
    }

    fn append_log(&self, direction: &str, line: &str) {
        let mut log = self.log.lock().unwrap();
        log.push_str(direction);
        log.push_str(line);
        log.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn connected_pair() -> (Connection, TcpStream, Arc<Mutex<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server_side, peer) = listener.accept().unwrap();
        let client_side = handle.join().unwrap();
        let log = Arc::new(Mutex::new(String::new()));
        let connection = Connection::new(Stream::Plain(server_side), peer, Arc::clone(&log), "+");
        (connection, client_side, log)
    }

    #[test]
    fn test_read_line_strips_crlf() {
        let (mut connection, mut client, _log) = connected_pair();
        client.write_all(b"STAT\r\nQUIT\r\n").unwrap();

        assert_eq!(connection.read_line().unwrap(), Some("STAT".to_owned()));
        assert_eq!(connection.read_line().unwrap(), Some("QUIT".to_owned()));
    }

    #[test]
    fn test_read_line_returns_none_on_eof() {
        let (mut connection, client, _log) = connected_pair();
        drop(client);

        assert_eq!(connection.read_line().unwrap(), None);
    }

    #[test]
    fn test_write_line_appends_crlf() {
        let (mut connection, client, _log) = connected_pair();
        connection.write_line("+OK").unwrap();
        drop(connection);

        let mut reader = BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "+OK\r\n");
    }

    #[test]
    fn test_continuation_uses_protocol_prefix() {
        let (mut connection, client, _log) = connected_pair();
        connection.write_continuation("VXNlcm5hbWU6").unwrap();
        drop(connection);

        let mut reader = BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "+ VXNlcm5hbWU6\r\n");
    }

    #[test]
    fn test_log_captures_both_directions() {
        let (mut connection, mut client, log) = connected_pair();
        client.write_all(b"NOOP\r\n").unwrap();

        connection.read_line().unwrap();
        connection.write_line("+OK").unwrap();

        assert_eq!(*log.lock().unwrap(), "C: NOOP\nS: +OK\n");
    }

    #[test]
    fn test_eight_bit_bytes_round_trip() {
        let (mut connection, mut client, _log) = connected_pair();
        client.write_all(&[0x41, 0xe9, 0x42, b'\r', b'\n']).unwrap();

        let line = connection.read_line().unwrap().unwrap();
        connection.write_line(&line).unwrap();
        drop(connection);

        let mut reader = BufReader::new(client);
        let mut echoed = Vec::new();
        reader.read_until(b'\n', &mut echoed).unwrap();
        assert_eq!(echoed, vec![0x41, 0xe9, 0x42, b'\r', b'\n']);
    }
}
