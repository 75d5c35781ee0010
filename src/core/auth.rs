//! Legacy nonce/digest authentication.
//!
//! The handshake is two commands: `getnonce` fetches a server nonce, then
//! `authenticate` presents `md5hex(nonce + user + md5hex(user + ":mongo:" +
//! password))`. Successful databases are memoized per connection so higher
//! layers re-authenticate at most once per connection per database.

use bson::doc;
use serde::Deserialize;
use tracing::debug;

use crate::core::connection::RawConnection;
use crate::error::DriverError;

#[derive(Debug, Deserialize)]
struct NonceResponse {
    nonce: String,
}

#[derive(Debug, Deserialize)]
struct AuthenticateResponse {
    #[serde(default)]
    ok: f64,
    #[serde(default)]
    errmsg: Option<String>,
}

/// The password never travels; only this digest does.
fn authentication_key(nonce: &str, username: &str, password: &str) -> String {
    let password_digest = hex::encode(md5::compute(format!("{}:mongo:{}", username, password)).0);
    hex::encode(md5::compute(format!("{}{}{}", nonce, username, password_digest)).0)
}

impl RawConnection {
    /// Authenticate this connection against a database.
    ///
    /// A database that already authenticated on this connection is a no-op.
    pub async fn authenticate(
        &self,
        database: &str,
        username: &str,
        password: &str,
    ) -> Result<(), DriverError> {
        if self.is_authenticated(database) {
            return Ok(());
        }

        let nonce: NonceResponse = self.send_command(database, &doc! { "getnonce": 1i32 }).await?;

        let key = authentication_key(&nonce.nonce, username, password);
        let command = doc! {
            "authenticate": 1i32,
            "user": username,
            "nonce": nonce.nonce.as_str(),
            "key": key.as_str(),
        };
        let response: AuthenticateResponse = self.send_command(database, &command).await?;

        if response.ok != 1.0 {
            return Err(DriverError::Authentication {
                database: database.to_string(),
                message: response
                    .errmsg
                    .unwrap_or_else(|| "authentication rejected by server".to_string()),
            });
        }

        debug!("Authenticated database '{}' on {}", database, self.endpoint());
        self.mark_authenticated(database);
        Ok(())
    }
}
