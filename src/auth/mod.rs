//! Pluggable SASL authentication
//!
//! Each mechanism is a stateless strategy keyed by its SASL name. Given the
//! remainder of the AUTH command line, the client connection, and the mailbox
//! store, it drives the mechanism-specific challenge/response exchange and
//! returns the credentials the command layer then checks against the store.
//!
//! All five mechanisms are registered on every server; which ones a client
//! may use is controlled by the server's ordered `auth_types` list.

mod cram_md5;
mod digest_md5;
mod login;
mod plain;
mod xoauth2;

pub use cram_md5::CramMd5Authenticator;
pub use digest_md5::DigestMd5Authenticator;
pub use login::LoginAuthenticator;
pub use plain::PlainAuthenticator;
pub use xoauth2::XOauth2Authenticator;

use std::io;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::client::Connection;
use crate::store::MailboxStore;

pub const LOGIN: &str = "LOGIN";
pub const PLAIN: &str = "PLAIN";
pub const CRAM_MD5: &str = "CRAM-MD5";
pub const DIGEST_MD5: &str = "DIGEST-MD5";
pub const XOAUTH2: &str = "XOAUTH2";

/// Username and secret produced by a successful mechanism exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    secret: String,
}

impl Credentials {
    pub fn new(username: &str, secret: &str) -> Self {
        Self {
            username: username.to_owned(),
            secret: secret.to_owned(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

/// A SASL mechanism implementation.
pub trait Authenticator: Send + Sync {
    /// Run the mechanism exchange with the client.
    ///
    /// `parameters` is the remainder of the AUTH command line after the
    /// mechanism name (the optional initial response). Returns `Ok(None)` on
    /// mechanism failure: malformed base64, wrong exchange shape, or digest
    /// mismatch. I/O errors terminate the connection.
    fn authenticate(
        &self,
        parameters: Option<&str>,
        client: &mut Connection,
        store: &MailboxStore,
    ) -> io::Result<Option<Credentials>>;
}

pub(crate) fn encode_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub(crate) fn decode_base64(data: &str) -> Option<Vec<u8>> {
    BASE64.decode(data.trim()).ok()
}

pub(crate) fn decode_base64_utf8(data: &str) -> Option<String> {
    String::from_utf8(decode_base64(data)?).ok()
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_round_trip() {
        assert_eq!(encode_base64(b"Username:"), "VXNlcm5hbWU6");
        assert_eq!(decode_base64("VXNlcm5hbWU6").unwrap(), b"Username:");
        assert!(decode_base64("not base64!").is_none());
    }

    #[test]
    fn test_decode_tolerates_surrounding_whitespace() {
        assert_eq!(decode_base64_utf8(" cGFzc3dvcmQ= ").unwrap(), "password");
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x00, 0x7f, 0xc5, 0x62]), "007fc562");
    }
}
