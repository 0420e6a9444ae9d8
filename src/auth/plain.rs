//! PLAIN mechanism (RFC 4616)

use std::io;

use super::{decode_base64, Authenticator, Credentials};
use crate::client::Connection;
use crate::store::MailboxStore;

/// Single base64 blob `authzid NUL authcid NUL password`, sent either as the
/// initial response on the AUTH line or after an empty continuation prompt.
pub struct PlainAuthenticator;

impl Authenticator for PlainAuthenticator {
    fn authenticate(
        &self,
        parameters: Option<&str>,
        client: &mut Connection,
        _store: &MailboxStore,
    ) -> io::Result<Option<Credentials>> {
        let response = match parameters {
            Some(parameters) => parameters.to_owned(),
            None => {
                client.write_continuation("")?;
                match client.read_line()? {
                    Some(line) => line,
                    None => return Ok(None),
                }
            }
        };
        Ok(parse_plain_response(&response))
    }
}

/// Decode and split the blob; the authorization identity is ignored.
fn parse_plain_response(response: &str) -> Option<Credentials> {
    let decoded = String::from_utf8(decode_base64(response)?).ok()?;
    let mut parts = decoded.split('\0');
    let _authzid = parts.next()?;
    let authcid = parts.next()?;
    let password = parts.next()?;
    if parts.next().is_some() || authcid.is_empty() {
        return None;
    }
    Some(Credentials::new(authcid, password))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_response() {
        // base64("\0alice\0password")
        let credentials = parse_plain_response("AGFsaWNlAHBhc3N3b3Jk").unwrap();
        assert_eq!(credentials.username(), "alice");
        assert_eq!(credentials.secret(), "password");
    }

    #[test]
    fn test_parse_keeps_authzid_out() {
        // base64("admin\0alice\0password")
        let credentials = parse_plain_response("YWRtaW4AYWxpY2UAcGFzc3dvcmQ=").unwrap();
        assert_eq!(credentials.username(), "alice");
    }

    #[test]
    fn test_reject_malformed_base64() {
        assert!(parse_plain_response("!!!").is_none());
    }

    #[test]
    fn test_reject_wrong_part_count() {
        // base64("alice") - no separators
        assert!(parse_plain_response("YWxpY2U=").is_none());
        // base64("\0alice\0pw\0extra")
        assert!(parse_plain_response("AGFsaWNlAHB3AGV4dHJh").is_none());
    }

    #[test]
    fn test_reject_empty_authcid() {
        // base64("\0\0password")
        assert!(parse_plain_response("AABwYXNzd29yZA==").is_none());
    }
}
