//! Scripted in-memory transports for tests.
//!
//! [`MockFactory`] stands in for the TCP factory and hands out transports
//! that answer like a well-behaved server. Every command crossing the
//! seam is recorded in a log shared across reconnects, so tests can assert
//! on the exact command sequence including retries.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::config::{DialerConfig, TlsConfig};
use crate::errors::{SmtpError, SmtpResult};
use crate::protocol::{codes, SmtpCommand, SmtpResponse};
use crate::transport::{SmtpTransport, TransportFactory};

/// CRAM-MD5 challenge issued by the mock server.
pub const MOCK_CRAM_CHALLENGE: &str = "<1896.697170952@postoffice.reston.mci.net>";

/// How the mock server behaves.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Whether EHLO advertises STARTTLS (dropped once upgraded).
    pub starttls: bool,
    /// Whether EHLO is rejected outright, forcing the HELO fallback.
    pub reject_ehlo: bool,
    /// SASL mechanisms advertised in the EHLO reply.
    pub mechanisms: Vec<String>,
    /// How many MAIL commands fail with a timeout before succeeding.
    pub mail_failures: usize,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            starttls: true,
            reject_ehlo: false,
            mechanisms: Vec::new(),
            mail_failures: 0,
        }
    }
}

impl MockBehavior {
    /// A server advertising STARTTLS and no authentication.
    pub fn plain() -> Self {
        Self::default()
    }

    /// A server advertising the given mechanisms.
    pub fn with_auth(mechanisms: &[&str]) -> Self {
        Self {
            mechanisms: mechanisms.iter().map(|m| m.to_string()).collect(),
            ..Self::default()
        }
    }
}

/// Hands out [`MockTransport`]s and records everything they see.
#[derive(Debug)]
pub struct MockFactory {
    behavior: MockBehavior,
    log: Arc<Mutex<Vec<String>>>,
    data: Arc<Mutex<Vec<u8>>>,
    dials: AtomicUsize,
    mail_failures_remaining: Arc<AtomicUsize>,
}

impl MockFactory {
    /// Creates a factory with the given behavior.
    pub fn new(behavior: MockBehavior) -> Arc<Self> {
        let failures = behavior.mail_failures;
        Arc::new(Self {
            behavior,
            log: Arc::new(Mutex::new(Vec::new())),
            data: Arc::new(Mutex::new(Vec::new())),
            dials: AtomicUsize::new(0),
            mail_failures_remaining: Arc::new(AtomicUsize::new(failures)),
        })
    }

    /// Number of transports opened so far.
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Snapshot of the shared command log.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Number of log entries equal to `entry`.
    pub fn count(&self, entry: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|e| *e == entry).count()
    }

    /// Bytes written during DATA phases, concatenated.
    pub fn data_written(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn open(&self, _addr: &str, _config: &DialerConfig) -> SmtpResult<Box<dyn SmtpTransport>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push("dial".to_string());
        Ok(Box::new(MockTransport {
            behavior: self.behavior.clone(),
            log: Arc::clone(&self.log),
            data: Arc::clone(&self.data),
            mail_failures_remaining: Arc::clone(&self.mail_failures_remaining),
            pending: VecDeque::new(),
            auth_stage: AuthStage::Idle,
            greeted: false,
            tls: false,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthStage {
    Idle,
    LoginUsername,
    LoginPassword,
    CramChallenge,
}

enum Scripted {
    Reply(SmtpResponse),
    Fail(SmtpError),
}

impl fmt::Debug for Scripted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scripted::Reply(r) => write!(f, "Reply({})", r.code),
            Scripted::Fail(e) => write!(f, "Fail({})", e),
        }
    }
}

/// A transport that plays the server side of the dialogue.
#[derive(Debug)]
pub struct MockTransport {
    behavior: MockBehavior,
    log: Arc<Mutex<Vec<String>>>,
    data: Arc<Mutex<Vec<u8>>>,
    mail_failures_remaining: Arc<AtomicUsize>,
    pending: VecDeque<Scripted>,
    auth_stage: AuthStage,
    greeted: bool,
    tls: bool,
}

fn reply(code: u16, line: &str) -> Scripted {
    Scripted::Reply(SmtpResponse {
        code,
        lines: vec![line.to_string()],
    })
}

impl MockTransport {
    fn script(&mut self, command: &SmtpCommand) {
        let scripted = match command {
            SmtpCommand::Ehlo(_) if self.behavior.reject_ehlo => {
                reply(502, "command not implemented")
            }
            SmtpCommand::Ehlo(_) => {
                let mut lines = vec!["mock.example.com".to_string()];
                if self.behavior.starttls && !self.tls {
                    lines.push("STARTTLS".to_string());
                }
                if !self.behavior.mechanisms.is_empty() {
                    lines.push(format!("AUTH {}", self.behavior.mechanisms.join(" ")));
                }
                Scripted::Reply(SmtpResponse {
                    code: codes::OK,
                    lines,
                })
            }
            SmtpCommand::Helo(_) => reply(codes::OK, "mock.example.com"),
            SmtpCommand::StartTls => {
                if self.behavior.starttls {
                    reply(codes::SERVICE_READY, "ready to start TLS")
                } else {
                    reply(502, "command not implemented")
                }
            }
            SmtpCommand::Auth { mechanism, .. } => match mechanism.as_str() {
                "LOGIN" => {
                    self.auth_stage = AuthStage::LoginUsername;
                    reply(codes::AUTH_CHALLENGE, &BASE64.encode("Username:"))
                }
                "CRAM-MD5" => {
                    self.auth_stage = AuthStage::CramChallenge;
                    reply(codes::AUTH_CHALLENGE, &BASE64.encode(MOCK_CRAM_CHALLENGE))
                }
                _ => reply(codes::AUTH_SUCCESS, "accepted"),
            },
            SmtpCommand::AuthResponse(_) => match self.auth_stage {
                AuthStage::LoginUsername => {
                    self.auth_stage = AuthStage::LoginPassword;
                    reply(codes::AUTH_CHALLENGE, &BASE64.encode("Password:"))
                }
                AuthStage::LoginPassword | AuthStage::CramChallenge => {
                    self.auth_stage = AuthStage::Idle;
                    reply(codes::AUTH_SUCCESS, "accepted")
                }
                AuthStage::Idle => reply(503, "bad sequence of commands"),
            },
            SmtpCommand::MailFrom { .. } => {
                let remaining = self.mail_failures_remaining.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.mail_failures_remaining
                        .store(remaining - 1, Ordering::SeqCst);
                    Scripted::Fail(SmtpError::Timeout {
                        what: "response read",
                    })
                } else {
                    reply(codes::OK, "sender ok")
                }
            }
            SmtpCommand::RcptTo { .. } => reply(codes::OK, "recipient ok"),
            SmtpCommand::Data => reply(codes::START_MAIL_INPUT, "end data with <CRLF>.<CRLF>"),
            SmtpCommand::Quit => reply(codes::SERVICE_CLOSING, "bye"),
        };
        self.pending.push_back(scripted);
    }
}

#[async_trait]
impl SmtpTransport for MockTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<()> {
        self.log.lock().unwrap().push(command.to_wire());
        self.script(command);
        Ok(())
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> SmtpResult<()> {
        self.data.lock().unwrap().extend_from_slice(bytes);
        // The terminator closes the DATA phase.
        if bytes.ends_with(b".\r\n") {
            self.log.lock().unwrap().push("data".to_string());
            self.pending.push_back(reply(codes::OK, "message accepted"));
        }
        Ok(())
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        if let Some(scripted) = self.pending.pop_front() {
            return match scripted {
                Scripted::Reply(response) => Ok(response),
                Scripted::Fail(err) => Err(err),
            };
        }
        if !self.greeted {
            self.greeted = true;
            return Ok(SmtpResponse {
                code: codes::SERVICE_READY,
                lines: vec!["mock.example.com ESMTP ready".to_string()],
            });
        }
        Err(SmtpError::ConnectionClosed)
    }

    async fn upgrade_tls(&mut self, _tls: &TlsConfig, _host: &str) -> SmtpResult<()> {
        self.log.lock().unwrap().push("tls".to_string());
        self.tls = true;
        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.tls
    }

    async fn close(&mut self) -> SmtpResult<()> {
        self.log.lock().unwrap().push("close".to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_greeting_then_ehlo() {
        let factory = MockFactory::new(MockBehavior::with_auth(&["PLAIN"]));
        let config = DialerConfig::new("mock.example.com", 587, "user", "pwd");
        let mut transport = factory.open("mock.example.com:587", &config).await.unwrap();

        let greeting = transport.read_response().await.unwrap();
        assert_eq!(greeting.code, codes::SERVICE_READY);

        transport
            .send_command(&SmtpCommand::Ehlo("localhost".into()))
            .await
            .unwrap();
        let response = transport.read_response().await.unwrap();
        assert_eq!(response.code, codes::OK);
        assert!(response.lines.iter().any(|l| l == "STARTTLS"));
        assert!(response.lines.iter().any(|l| l == "AUTH PLAIN"));
    }

    #[tokio::test]
    async fn test_starttls_dropped_after_upgrade() {
        let factory = MockFactory::new(MockBehavior::plain());
        let config = DialerConfig::new("mock.example.com", 587, "user", "pwd");
        let mut transport = factory.open("mock.example.com:587", &config).await.unwrap();

        transport
            .upgrade_tls(&TlsConfig::default(), "mock.example.com")
            .await
            .unwrap();
        transport
            .send_command(&SmtpCommand::Ehlo("localhost".into()))
            .await
            .unwrap();
        let response = transport.read_response().await.unwrap();
        assert!(!response.lines.iter().any(|l| l == "STARTTLS"));
        assert!(transport.is_tls());
    }

    #[tokio::test]
    async fn test_mail_failure_countdown() {
        let factory = MockFactory::new(MockBehavior {
            mail_failures: 1,
            ..MockBehavior::plain()
        });
        let config = DialerConfig::new("mock.example.com", 587, "user", "pwd");
        let mut transport = factory.open("mock.example.com:587", &config).await.unwrap();

        transport
            .send_command(&SmtpCommand::MailFrom {
                address: "a@example.com".into(),
            })
            .await
            .unwrap();
        assert!(transport.read_response().await.unwrap_err().is_transient());

        transport
            .send_command(&SmtpCommand::MailFrom {
                address: "a@example.com".into(),
            })
            .await
            .unwrap();
        assert_eq!(transport.read_response().await.unwrap().code, codes::OK);
    }
}
