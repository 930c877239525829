//! Challenge/response authentication.

/// Handles the server challenges of an `AUTHENTICATE` exchange.
///
/// The engine base64-decodes each challenge before calling
/// [`process`](Authenticator::process) and base64-encodes the returned
/// response before it goes on the wire.
pub trait Authenticator {
    /// The raw response bytes for one challenge.
    type Response: AsRef<[u8]>;

    /// Answer a decoded server challenge.
    fn process(&mut self, challenge: &[u8]) -> Self::Response;
}

/// `PLAIN` (RFC 4616): authorization, user and password in one step.
#[derive(Debug)]
pub struct PlainAuthenticator {
    user: String,
    password: String,
}

impl PlainAuthenticator {
    /// Authenticate as `user` with no separate authorization identity.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        PlainAuthenticator {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl Authenticator for PlainAuthenticator {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> String {
        format!("\u{0}{}\u{0}{}", self.user, self.password)
    }
}
