//! SASL authentication mechanisms.
//!
//! The dialer selects a mechanism from the server's EHLO announcement:
//! CRAM-MD5 when advertised, otherwise LOGIN when LOGIN is advertised and
//! PLAIN is not, otherwise PLAIN. Callers can bypass selection entirely by
//! supplying their own [`Authenticator`].

use hmac::{Hmac, Mac};
use md5::Md5;
use secrecy::{ExposeSecret, SecretString};

use crate::errors::{SmtpError, SmtpResult};

/// What the client knows about the server when authentication starts.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Hostname the connection was dialed to.
    pub host: String,
    /// Whether the connection is encrypted (immediate SSL or STARTTLS).
    pub tls: bool,
    /// SASL mechanisms advertised in the EHLO reply, uppercased.
    pub mechanisms: Vec<String>,
}

impl ServerInfo {
    /// Whether the server advertised the given mechanism.
    pub fn advertises(&self, mechanism: &str) -> bool {
        let mechanism = mechanism.to_ascii_uppercase();
        self.mechanisms.iter().any(|m| *m == mechanism)
    }
}

/// A SASL client mechanism.
///
/// [`start`](Authenticator::start) yields the mechanism name and an optional
/// initial response; [`next`](Authenticator::next) answers each 334
/// challenge. After the final server reply, `next` is called once more with
/// `more` set to false so the mechanism can verify it finished cleanly.
pub trait Authenticator: Send + Sync {
    /// Begins the dialogue. Returns the mechanism name and the initial
    /// response bytes, empty when the mechanism sends none.
    fn start(&self, server: &ServerInfo) -> SmtpResult<(String, Vec<u8>)>;

    /// Answers a server challenge. `more` is false exactly once, after the
    /// server has accepted or rejected the dialogue; the returned bytes are
    /// ignored in that case.
    fn next(&self, challenge: &[u8], more: bool) -> SmtpResult<Vec<u8>>;
}

/// The PLAIN mechanism (RFC 4616): identity and password in one response.
///
/// Refuses to run over an unencrypted connection unless the server
/// explicitly advertises PLAIN, and refuses to talk to a host other than
/// the one it was built for.
pub struct PlainAuthenticator {
    username: String,
    password: SecretString,
    host: String,
}

impl PlainAuthenticator {
    /// Creates a PLAIN authenticator bound to `host`.
    pub fn new(
        username: impl Into<String>,
        password: SecretString,
        host: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password,
            host: host.into(),
        }
    }
}

impl Authenticator for PlainAuthenticator {
    fn start(&self, server: &ServerInfo) -> SmtpResult<(String, Vec<u8>)> {
        if !server.tls && !server.advertises("PLAIN") {
            return Err(SmtpError::UnencryptedConnection);
        }
        if server.host != self.host {
            return Err(SmtpError::HostMismatch {
                configured: self.host.clone(),
                advertised: server.host.clone(),
            });
        }
        let mut initial = Vec::new();
        initial.push(0);
        initial.extend_from_slice(self.username.as_bytes());
        initial.push(0);
        initial.extend_from_slice(self.password.expose_secret().as_bytes());
        Ok(("PLAIN".to_string(), initial))
    }

    fn next(&self, challenge: &[u8], more: bool) -> SmtpResult<Vec<u8>> {
        if more {
            return Err(SmtpError::UnexpectedChallenge {
                challenge: String::from_utf8_lossy(challenge).into_owned(),
            });
        }
        Ok(Vec::new())
    }
}

/// The LOGIN mechanism: username and password sent in separate responses
/// to literal `Username:` and `Password:` challenges.
///
/// LOGIN is obsolete but still the only option on some servers. It refuses
/// unencrypted connections unless the server explicitly advertises LOGIN.
pub struct LoginAuthenticator {
    username: String,
    password: SecretString,
    host: String,
}

impl LoginAuthenticator {
    /// Creates a LOGIN authenticator bound to `host`.
    pub fn new(
        username: impl Into<String>,
        password: SecretString,
        host: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password,
            host: host.into(),
        }
    }
}

impl Authenticator for LoginAuthenticator {
    fn start(&self, server: &ServerInfo) -> SmtpResult<(String, Vec<u8>)> {
        if !server.tls && !server.advertises("LOGIN") {
            return Err(SmtpError::UnencryptedConnection);
        }
        if server.host != self.host {
            return Err(SmtpError::HostMismatch {
                configured: self.host.clone(),
                advertised: server.host.clone(),
            });
        }
        Ok(("LOGIN".to_string(), Vec::new()))
    }

    fn next(&self, challenge: &[u8], more: bool) -> SmtpResult<Vec<u8>> {
        if !more {
            return Ok(Vec::new());
        }
        match challenge {
            b"Username:" => Ok(self.username.as_bytes().to_vec()),
            b"Password:" => Ok(self.password.expose_secret().as_bytes().to_vec()),
            other => Err(SmtpError::UnexpectedChallenge {
                challenge: String::from_utf8_lossy(other).into_owned(),
            }),
        }
    }
}

/// The CRAM-MD5 mechanism (RFC 2195): challenge-response with an HMAC-MD5
/// digest, so the password never crosses the wire.
pub struct CramMd5Authenticator {
    username: String,
    password: SecretString,
}

impl CramMd5Authenticator {
    /// Creates a CRAM-MD5 authenticator.
    pub fn new(username: impl Into<String>, password: SecretString) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }
}

impl Authenticator for CramMd5Authenticator {
    fn start(&self, _server: &ServerInfo) -> SmtpResult<(String, Vec<u8>)> {
        Ok(("CRAM-MD5".to_string(), Vec::new()))
    }

    fn next(&self, challenge: &[u8], more: bool) -> SmtpResult<Vec<u8>> {
        if !more {
            return Ok(Vec::new());
        }
        let mut mac = Hmac::<Md5>::new_from_slice(self.password.expose_secret().as_bytes())
            .map_err(|e| SmtpError::Protocol(format!("invalid CRAM-MD5 key: {}", e)))?;
        mac.update(challenge);
        let digest = mac.finalize().into_bytes();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            hex.push_str(&format!("{:02x}", byte));
        }
        Ok(format!("{} {}", self.username, hex).into_bytes())
    }
}
