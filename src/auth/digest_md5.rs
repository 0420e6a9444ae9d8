//! DIGEST-MD5 mechanism (RFC 2831)

use std::collections::HashMap;
use std::io;

use md5::{Digest, Md5};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use super::{decode_base64_utf8, encode_base64, Authenticator, Credentials};
use crate::client::Connection;
use crate::store::md5_hex;
use crate::store::MailboxStore;

const REALM: &str = "localhost";

/// Challenge/response digest authentication. The server issues a nonce
/// challenge, verifies the client's `response` value computed from the stored
/// secret, and proves knowledge of the secret back with `rspauth`.
pub struct DigestMd5Authenticator;

impl Authenticator for DigestMd5Authenticator {
    fn authenticate(
        &self,
        parameters: Option<&str>,
        client: &mut Connection,
        store: &MailboxStore,
    ) -> io::Result<Option<Credentials>> {
        // DIGEST-MD5 has no initial response
        if parameters.is_some() {
            return Ok(None);
        }

        let nonce: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        let challenge = format!(
            "realm=\"{REALM}\",nonce=\"{nonce}\",qop=\"auth\",charset=utf-8,algorithm=md5-sess"
        );
        client.write_continuation(&encode_base64(challenge.as_bytes()))?;

        let Some(line) = client.read_line()? else {
            return Ok(None);
        };
        let Some(response) = decode_base64_utf8(&line) else {
            return Ok(None);
        };
        let directives = parse_directives(&response);

        let (Some(username), Some(client_nonce), Some(cnonce), Some(nc), Some(digest_uri), Some(response_value)) = (
            directives.get("username"),
            directives.get("nonce"),
            directives.get("cnonce"),
            directives.get("nc"),
            directives.get("digest-uri"),
            directives.get("response"),
        ) else {
            return Ok(None);
        };
        if *client_nonce != nonce {
            return Ok(None);
        }
        let qop = directives.get("qop").map(String::as_str).unwrap_or("auth");
        let realm = directives.get("realm").map(String::as_str).unwrap_or(REALM);

        let Some(mailbox) = store.find_mailbox(username) else {
            return Ok(None);
        };
        let expected = compute_response(
            username,
            realm,
            mailbox.secret(),
            &nonce,
            cnonce,
            nc,
            qop,
            digest_uri,
            "AUTHENTICATE",
        );
        if *response_value != expected {
            return Ok(None);
        }

        // mutual authentication step: prove we know the secret too
        let rspauth = compute_response(
            username,
            realm,
            mailbox.secret(),
            &nonce,
            cnonce,
            nc,
            qop,
            digest_uri,
            "",
        );
        client.write_continuation(&encode_base64(format!("rspauth={rspauth}").as_bytes()))?;
        if client.read_line()?.is_none() {
            return Ok(None);
        }

        Ok(Some(Credentials::new(username, mailbox.secret())))
    }
}

/// Response computation from RFC 2831 section 2.1.2.1 (md5-sess, qop=auth).
/// `method` is `AUTHENTICATE` for the client's `response` value and empty
/// for the server's `rspauth` value.
fn compute_response(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    nc: &str,
    qop: &str,
    digest_uri: &str,
    method: &str,
) -> String {
    let mut a1 = Md5::digest(format!("{username}:{realm}:{password}")).to_vec();
    a1.extend_from_slice(format!(":{nonce}:{cnonce}").as_bytes());
    let ha1 = md5_hex(&a1);
    let ha2 = md5_hex(format!("{method}:{digest_uri}").as_bytes());
    md5_hex(format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}").as_bytes())
}

/// Split a digest-response into its `key=value` directives. Values may be
/// quoted; backslash escapes inside quotes are honored.
fn parse_directives(input: &str) -> HashMap<String, String> {
    let mut directives = HashMap::new();
    let mut chars = input.chars().peekable();
    loop {
        while let Some(&c) = chars.peek() {
            if c == ',' || c == ' ' || c == '\t' {
                chars.next();
            } else {
                break;
            }
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if chars.next() != Some('=') {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '"' => break,
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    other => value.push(other),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        if !key.is_empty() {
            directives.insert(key.trim().to_owned(), value);
        }
    }
    directives
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directives_mixed_quoting() {
        let directives = parse_directives(
            "username=\"chris\",realm=\"elwood.innosoft.com\",nc=00000001,qop=auth",
        );
        assert_eq!(directives["username"], "chris");
        assert_eq!(directives["realm"], "elwood.innosoft.com");
        assert_eq!(directives["nc"], "00000001");
        assert_eq!(directives["qop"], "auth");
    }

    #[test]
    fn test_parse_directives_quoted_comma_and_escape() {
        let directives = parse_directives("a=\"x,y\",b=\"quo\\\"te\"");
        assert_eq!(directives["a"], "x,y");
        assert_eq!(directives["b"], "quo\"te");
    }

    #[test]
    fn test_response_matches_rfc2831_example() {
        // worked example from RFC 2831 section 4
        let response = compute_response(
            "chris",
            "elwood.innosoft.com",
            "secret",
            "OA6MG9tEQGm2hh",
            "OA6MHXh6VqTrRk",
            "00000001",
            "auth",
            "imap/elwood.innosoft.com",
            "AUTHENTICATE",
        );
        assert_eq!(response, "d388dad90d4bbd760a152321f2143af7");
    }

    #[test]
    fn test_rspauth_matches_rfc2831_example() {
        let rspauth = compute_response(
            "chris",
            "elwood.innosoft.com",
            "secret",
            "OA6MG9tEQGm2hh",
            "OA6MHXh6VqTrRk",
            "00000001",
            "auth",
            "imap/elwood.innosoft.com",
            "",
        );
        assert_eq!(rspauth, "ea40f60335c427b5527b84dbabcdfffd");
    }
}
