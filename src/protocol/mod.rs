//! SMTP wire protocol: commands, responses, and capability discovery.

use std::fmt;

use crate::errors::{SmtpError, SmtpResult};

/// Reply codes used by the dialer.
pub mod codes {
    /// Service ready (greeting, STARTTLS go-ahead).
    pub const SERVICE_READY: u16 = 220;
    /// Service closing (QUIT acknowledgment).
    pub const SERVICE_CLOSING: u16 = 221;
    /// Authentication succeeded.
    pub const AUTH_SUCCESS: u16 = 235;
    /// Requested action completed.
    pub const OK: u16 = 250;
    /// Server challenge during an AUTH dialogue.
    pub const AUTH_CHALLENGE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
}

/// An SMTP command as sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended greeting carrying the client identity.
    Ehlo(String),
    /// Legacy greeting, used when EHLO is rejected.
    Helo(String),
    /// Request the TLS upgrade.
    StartTls,
    /// Begin an authentication dialogue.
    Auth {
        /// SASL mechanism name.
        mechanism: String,
        /// Base64-encoded initial response, when the mechanism has one.
        initial: Option<String>,
    },
    /// A base64-encoded reply to a 334 challenge.
    AuthResponse(String),
    /// Declare the envelope sender.
    MailFrom {
        /// Envelope sender address.
        address: String,
    },
    /// Declare an envelope recipient.
    RcptTo {
        /// Envelope recipient address.
        address: String,
    },
    /// Begin the message body.
    Data,
    /// End the session.
    Quit,
}

impl SmtpCommand {
    /// Renders the command line without the trailing CRLF.
    pub fn to_wire(&self) -> String {
        match self {
            SmtpCommand::Ehlo(name) => format!("EHLO {}", name),
            SmtpCommand::Helo(name) => format!("HELO {}", name),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth { mechanism, initial } => match initial {
                Some(resp) => format!("AUTH {} {}", mechanism, resp),
                None => format!("AUTH {}", mechanism),
            },
            SmtpCommand::AuthResponse(payload) => payload.clone(),
            SmtpCommand::MailFrom { address } => format!("MAIL FROM:<{}>", address),
            SmtpCommand::RcptTo { address } => format!("RCPT TO:<{}>", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

/// A parsed server reply, possibly spanning multiple lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    /// Three-digit reply code.
    pub code: u16,
    /// Text of each reply line, code prefixes stripped.
    pub lines: Vec<String>,
}

impl SmtpResponse {
    /// Parses one raw reply line, returning the code, the text, and whether
    /// more lines follow (code-hyphen continuation).
    pub fn parse_line(raw: &str) -> SmtpResult<(u16, String, bool)> {
        let raw = raw.trim_end_matches(['\r', '\n']);
        // Work on bytes: the line may carry arbitrary UTF-8, so indexing
        // the str directly could split a multi-byte character.
        let bytes = raw.as_bytes();
        if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
            return Err(SmtpError::Protocol(format!(
                "malformed reply code: {:?}",
                raw
            )));
        }
        let code = (bytes[0] - b'0') as u16 * 100
            + (bytes[1] - b'0') as u16 * 10
            + (bytes[2] - b'0') as u16;
        match bytes.get(3) {
            None => Ok((code, String::new(), false)),
            Some(b' ') => Ok((code, raw[4..].to_string(), false)),
            Some(b'-') => Ok((code, raw[4..].to_string(), true)),
            Some(_) => Err(SmtpError::Protocol(format!(
                "malformed reply separator: {:?}",
                raw
            ))),
        }
    }

    /// True for 2xx and 3xx replies.
    pub fn is_success(&self) -> bool {
        self.code < 400
    }

    /// True for 3xx replies, which expect further client input.
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Text of the first reply line.
    pub fn first_line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or("")
    }

    /// All reply lines joined with newlines.
    pub fn full_message(&self) -> String {
        self.lines.join("\n")
    }

    /// Converts a failure reply into the corresponding error.
    pub fn to_error(&self) -> SmtpError {
        SmtpError::Response {
            code: self.code,
            message: self.full_message(),
        }
    }

    /// Returns `Ok(self)` when the reply carries `expected`, otherwise the
    /// reply converted to an error.
    pub fn expect_code(self, expected: u16) -> SmtpResult<Self> {
        if self.code == expected {
            Ok(self)
        } else {
            Err(self.to_error())
        }
    }
}

/// Server capabilities announced in the EHLO reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether the server advertises STARTTLS.
    pub starttls: bool,
    /// Advertised SASL mechanisms, uppercased, in announcement order.
    pub auth_mechanisms: Vec<String>,
    /// Every extension line as announced.
    pub raw: Vec<String>,
}

impl Capabilities {
    /// Parses the capability lines of an EHLO reply. The first line is the
    /// server identity and carries no extension.
    pub fn from_ehlo(response: &SmtpResponse) -> Self {
        let mut caps = Capabilities::default();
        for line in response.lines.iter().skip(1) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            caps.raw.push(line.to_string());
            let mut words = line.split_whitespace();
            let keyword = words.next().unwrap_or("").to_ascii_uppercase();
            match keyword.as_str() {
                "STARTTLS" => caps.starttls = true,
                "AUTH" => {
                    for mech in words {
                        let mech = mech.to_ascii_uppercase();
                        if !caps.auth_mechanisms.contains(&mech) {
                            caps.auth_mechanisms.push(mech);
                        }
                    }
                }
                _ => {}
            }
        }
        caps
    }

    /// Whether the server advertised the given SASL mechanism.
    pub fn supports_auth(&self, mechanism: &str) -> bool {
        let mechanism = mechanism.to_ascii_uppercase();
        self.auth_mechanisms.iter().any(|m| *m == mechanism)
    }
}

/// Prepares a message body for the DATA phase: doubles leading dots and
/// guarantees a trailing CRLF so the terminator lands on its own line.
pub fn dot_stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 2);
    let mut at_line_start = true;
    for &b in body {
        if at_line_start && b == b'.' {
            out.push(b'.');
        }
        out.push(b);
        at_line_start = b == b'\n';
    }
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        assert_eq!(
            SmtpCommand::Ehlo("localhost".into()).to_wire(),
            "EHLO localhost"
        );
        assert_eq!(
            SmtpCommand::MailFrom {
                address: "a@b.example".into()
            }
            .to_wire(),
            "MAIL FROM:<a@b.example>"
        );
        assert_eq!(
            SmtpCommand::RcptTo {
                address: "c@d.example".into()
            }
            .to_wire(),
            "RCPT TO:<c@d.example>"
        );
        assert_eq!(
            SmtpCommand::Auth {
                mechanism: "PLAIN".into(),
                initial: Some("AGEAYg==".into())
            }
            .to_wire(),
            "AUTH PLAIN AGEAYg=="
        );
        assert_eq!(
            SmtpCommand::Auth {
                mechanism: "CRAM-MD5".into(),
                initial: None
            }
            .to_wire(),
            "AUTH CRAM-MD5"
        );
        assert_eq!(SmtpCommand::StartTls.to_wire(), "STARTTLS");
    }

    #[test]
    fn test_parse_line() {
        let (code, text, more) = SmtpResponse::parse_line("250-smtp.example.com\r\n").unwrap();
        assert_eq!(code, 250);
        assert_eq!(text, "smtp.example.com");
        assert!(more);

        let (code, text, more) = SmtpResponse::parse_line("250 AUTH PLAIN LOGIN").unwrap();
        assert_eq!(code, 250);
        assert_eq!(text, "AUTH PLAIN LOGIN");
        assert!(!more);

        assert!(SmtpResponse::parse_line("2x").is_err());
        assert!(SmtpResponse::parse_line("abc hello").is_err());
    }

    #[test]
    fn test_parse_line_multibyte_garbage() {
        // A multi-byte character landing inside the code position must be
        // rejected, not split.
        assert!(SmtpResponse::parse_line("2\u{20ac}").is_err());
        assert!(SmtpResponse::parse_line("\u{20ac}\u{20ac}\u{20ac} hi").is_err());
        let (code, text, _) = SmtpResponse::parse_line("250 caf\u{e9}").unwrap();
        assert_eq!(code, 250);
        assert_eq!(text, "caf\u{e9}");
    }

    #[test]
    fn test_response_classification() {
        let ok = SmtpResponse {
            code: 250,
            lines: vec!["OK".into()],
        };
        assert!(ok.is_success());
        assert!(!ok.is_intermediate());

        let challenge = SmtpResponse {
            code: 334,
            lines: vec!["VXNlcm5hbWU6".into()],
        };
        assert!(challenge.is_success());
        assert!(challenge.is_intermediate());

        let rejected = SmtpResponse {
            code: 550,
            lines: vec!["mailbox unavailable".into()],
        };
        assert!(!rejected.is_success());
        let err = rejected.to_error();
        assert!(matches!(err, SmtpError::Response { code: 550, .. }));
    }

    #[test]
    fn test_capabilities_from_ehlo() {
        let response = SmtpResponse {
            code: 250,
            lines: vec![
                "smtp.example.com at your service".into(),
                "SIZE 35882577".into(),
                "STARTTLS".into(),
                "AUTH CRAM-MD5 PLAIN login".into(),
                "8BITMIME".into(),
            ],
        };
        let caps = Capabilities::from_ehlo(&response);
        assert!(caps.starttls);
        assert_eq!(caps.auth_mechanisms, vec!["CRAM-MD5", "PLAIN", "LOGIN"]);
        assert!(caps.supports_auth("plain"));
        assert!(!caps.supports_auth("XOAUTH2"));
    }

    #[test]
    fn test_capabilities_ignore_identity_line() {
        let response = SmtpResponse {
            code: 250,
            lines: vec!["STARTTLS.example.com".into()],
        };
        let caps = Capabilities::from_ehlo(&response);
        assert!(!caps.starttls);
        assert!(caps.auth_mechanisms.is_empty());
    }

    #[test]
    fn test_dot_stuffing() {
        assert_eq!(dot_stuff(b"hello\r\n"), b"hello\r\n");
        assert_eq!(dot_stuff(b".hidden\r\n"), b"..hidden\r\n");
        assert_eq!(dot_stuff(b"line\r\n.dot\r\n"), b"line\r\n..dot\r\n");
        assert_eq!(dot_stuff(b"no newline"), b"no newline\r\n");
        assert_eq!(dot_stuff(b"a\r\n..b\r\n"), b"a\r\n...b\r\n");
    }
}
