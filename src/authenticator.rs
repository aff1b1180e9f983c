//! Authentication collaborators.

use std::sync::Mutex;

/// This will allow plugable authentication mechanisms.
///
/// This trait is used by [`Client::authenticate`](crate::client::Client::authenticate) to
/// [authenticate](https://tools.ietf.org/html/rfc3501#section-6.2.2) using SASL.
pub trait Authenticator {
    /// The type of the response to the challenge. This will usually be a `Vec<u8>` or `String`.
    type Response: AsRef<[u8]>;

    /// Each base64-decoded server challenge is passed to `process`.
    /// The returned byte-string is base64-encoded and then sent back to the server.
    fn process(&self, challenge: &[u8]) -> Self::Response;
}

/// `AUTHENTICATE PLAIN` ([RFC 4616](https://tools.ietf.org/html/rfc4616)), used when the server
/// advertises `LOGINDISABLED`.
#[derive(Debug)]
pub struct PlainAuthenticator<'a> {
    /// The authentication identity.
    pub user: &'a str,
    /// The password.
    pub password: &'a str,
}

impl<'a> Authenticator for PlainAuthenticator<'a> {
    type Response = Vec<u8>;

    fn process(&self, _challenge: &[u8]) -> Self::Response {
        let mut out = Vec::with_capacity(self.user.len() + self.password.len() + 2);
        out.push(0);
        out.extend_from_slice(self.user.as_bytes());
        out.push(0);
        out.extend_from_slice(self.password.as_bytes());
        out
    }
}

/// Supplies passwords for the connect sequence.
///
/// The store asks for a password before authenticating and calls
/// [`forget_password`](CredentialProvider::forget_password) when the server rejects it, so an
/// interactive provider can prompt again.
pub trait CredentialProvider: Send + Sync {
    /// Return the password, or `None` to abort the login.
    fn get_password(&self, prompt: &str) -> Option<String>;

    /// The last password was rejected.
    fn forget_password(&self);
}

/// A fixed password. After it has been rejected once it is no longer offered.
#[derive(Debug)]
pub struct StaticCredentials {
    password: Mutex<Option<String>>,
}

impl StaticCredentials {
    /// Offer `password` until the server rejects it.
    pub fn new(password: impl Into<String>) -> Self {
        StaticCredentials {
            password: Mutex::new(Some(password.into())),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn get_password(&self, _prompt: &str) -> Option<String> {
        self.password.lock().ok().and_then(|p| p.clone())
    }

    fn forget_password(&self) {
        if let Ok(mut p) = self.password.lock() {
            *p = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_response_layout() {
        let auth = PlainAuthenticator {
            user: "tim",
            password: "tanstaaftanstaaf",
        };
        assert_eq!(auth.process(b""), b"\0tim\0tanstaaftanstaaf".to_vec());
    }

    #[test]
    fn static_credentials_forget() {
        let creds = StaticCredentials::new("secret");
        assert_eq!(creds.get_password("pw?").as_deref(), Some("secret"));
        creds.forget_password();
        assert_eq!(creds.get_password("pw?"), None);
    }
}
