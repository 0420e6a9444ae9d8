//! XOAUTH2 mechanism (OAuth2 bearer token, single shot)

use std::io;

use super::{decode_base64_utf8, Authenticator, Credentials};
use crate::client::Connection;
use crate::store::MailboxStore;

/// Decodes `user={user}\x01auth=Bearer {token}\x01\x01` and hands the token
/// back as the secret; the command layer compares it against the stored one.
pub struct XOauth2Authenticator;

impl Authenticator for XOauth2Authenticator {
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
        Ok(parse_xoauth2_response(&response))
    }
}

fn parse_xoauth2_response(response: &str) -> Option<Credentials> {
    let decoded = decode_base64_utf8(response)?;
    let rest = decoded.strip_suffix("\x01\x01")?;
    let (user_part, auth_part) = rest.split_once('\x01')?;
    let user = user_part.strip_prefix("user=")?;
    let token = auth_part.strip_prefix("auth=Bearer ")?;
    if user.is_empty() {
        return None;
    }
    Some(Credentials::new(user, token))
}
