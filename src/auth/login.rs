//! LOGIN mechanism (legacy two-prompt exchange)

use std::io;

use super::{decode_base64_utf8, Authenticator, Credentials};
use crate::client::Connection;
use crate::store::MailboxStore;

/// Prompts `Username:` and `Password:` (base64) and reads one base64 reply
/// each. An initial response on the AUTH line is accepted as the username.
pub struct LoginAuthenticator;

impl Authenticator for LoginAuthenticator {
    fn authenticate(
        &self,
        parameters: Option<&str>,
        client: &mut Connection,
        _store: &MailboxStore,
    ) -> io::Result<Option<Credentials>> {
        let username_line = match parameters {
            Some(parameters) => parameters.to_owned(),
            None => {
                client.write_continuation("VXNlcm5hbWU6")?;
                match client.read_line()? {
                    Some(line) => line,
                    None => return Ok(None),
                }
            }
        };
        let Some(username) = decode_base64_utf8(&username_line) else {
            return Ok(None);
        };

        client.write_continuation("UGFzc3dvcmQ6")?;
        let Some(password_line) = client.read_line()? else {
            return Ok(None);
        };
        let Some(password) = decode_base64_utf8(&password_line) else {
            return Ok(None);
        };

        if username.is_empty() {
            return Ok(None);
        }
        Ok(Some(Credentials::new(&username, &password)))
    }
}
