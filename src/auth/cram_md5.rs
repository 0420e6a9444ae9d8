//! CRAM-MD5 mechanism (RFC 2195)

use std::io;

use hmac::{Hmac, Mac};
use md5::Md5;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use super::{decode_base64_utf8, encode_base64, to_hex, Authenticator, Credentials};
use crate::client::Connection;
use crate::store::MailboxStore;

type HmacMd5 = Hmac<Md5>;

/// Sends a fresh `nonce@hostname` challenge and verifies the client's
/// `username HMAC-MD5-hex(secret, challenge)` reply against the stored
/// secret for that username.
pub struct CramMd5Authenticator;

impl Authenticator for CramMd5Authenticator {
    fn authenticate(
        &self,
        parameters: Option<&str>,
        client: &mut Connection,
        store: &MailboxStore,
    ) -> io::Result<Option<Credentials>> {
        // CRAM-MD5 has no initial response
        if parameters.is_some() {
            return Ok(None);
        }

        let nonce: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        let challenge = format!("{nonce}@localhost");
        client.write_continuation(&encode_base64(challenge.as_bytes()))?;

        let Some(line) = client.read_line()? else {
            return Ok(None);
        };
        let Some(response) = decode_base64_utf8(&line) else {
            return Ok(None);
        };
        let Some((username, digest)) = response.split_once(' ') else {
            return Ok(None);
        };

        let Some(mailbox) = store.find_mailbox(username) else {
            return Ok(None);
        };
        let expected = hmac_md5_hex(mailbox.secret().as_bytes(), challenge.as_bytes());
        if digest == expected {
            Ok(Some(Credentials::new(username, mailbox.secret())))
        } else {
            Ok(None)
        }
    }
}

/// Keyed HMAC-MD5 digest, hex encoded.
pub(crate) fn hmac_md5_hex(secret: &[u8], challenge: &[u8]) -> String {
    let mut mac = HmacMd5::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(challenge);
    to_hex(&mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_md5_rfc2195_example() {
        // worked example from RFC 2195 section 2
        let digest = hmac_md5_hex(
            b"tanstaaftanstaaf",
            b"<1896.697170952@postoffice.reston.mci.net>",
        );
        assert_eq!(digest, "b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn test_digest_depends_on_secret_and_challenge() {
        let digest = hmac_md5_hex(b"secret", b"a@localhost");
        assert_ne!(digest, hmac_md5_hex(b"other", b"a@localhost"));
        assert_ne!(digest, hmac_md5_hex(b"secret", b"b@localhost"));
    }
}
