//! The dialer and sending session.
//!
//! [`Dialer`] holds the connection configuration and turns it into ready
//! [`SmtpSender`] sessions: it opens the transport (through the dial
//! middleware chain), negotiates the greeting, STARTTLS, and
//! authentication, and hands back a session that can transmit any number
//! of messages before QUIT.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::future::BoxFuture;
use secrecy::SecretString;
use tokio::sync::Mutex;

use crate::auth::{
    Authenticator, CramMd5Authenticator, LoginAuthenticator, PlainAuthenticator, ServerInfo,
};
use crate::config::{DialerConfig, StartTlsPolicy};
use crate::errors::{SmtpError, SmtpResult};
use crate::message::Message;
use crate::middleware::{
    compose_dial, compose_send, DialMiddleware, DialOp, DialRequest, SendMiddleware, SendOp,
    SendRequest,
};
use crate::protocol::{codes, Capabilities, SmtpCommand};
use crate::transport::{SmtpTransport, TcpFactory, TransportFactory};

/// Sends messages over an established session.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Transmits one message to the given recipients.
    async fn send(
        &self,
        from: &str,
        recipients: &[String],
        message: Arc<dyn Message>,
    ) -> SmtpResult<()>;
}

/// A [`Sender`] that also owns the connection teardown.
#[async_trait]
pub trait SendCloser: Sender {
    /// Sends QUIT and shuts the connection down. Safe to call twice.
    async fn close(&self) -> SmtpResult<()>;
}

/// Connects to an SMTP server and produces sending sessions.
#[derive(Clone)]
pub struct Dialer {
    config: Arc<DialerConfig>,
    factory: Arc<dyn TransportFactory>,
    authenticator: Arc<OnceLock<Arc<dyn Authenticator>>>,
    dial_middleware: Vec<Arc<dyn DialMiddleware>>,
    send_middleware: Vec<Arc<dyn SendMiddleware>>,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Dialer {
    /// Creates a dialer over real TCP connections.
    pub fn new(config: DialerConfig) -> SmtpResult<Self> {
        Self::with_factory(config, Arc::new(TcpFactory))
    }

    /// Creates a dialer with a custom transport factory. Tests use this to
    /// swap in scripted transports.
    pub fn with_factory(
        config: DialerConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> SmtpResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            factory,
            authenticator: Arc::new(OnceLock::new()),
            dial_middleware: Vec::new(),
            send_middleware: Vec::new(),
        })
    }

    /// The dialer's configuration.
    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    /// Fixes the authenticator instead of selecting one from the server's
    /// announcement.
    pub fn authenticator(self, auth: Arc<dyn Authenticator>) -> Self {
        let _ = self.authenticator.set(auth);
        self
    }

    /// Adds a dial middleware layer. The first layer added is outermost.
    pub fn dial_middleware(mut self, layer: Arc<dyn DialMiddleware>) -> Self {
        self.dial_middleware.push(layer);
        self
    }

    /// Adds a send middleware layer. The first layer added is outermost.
    pub fn send_middleware(mut self, layer: Arc<dyn SendMiddleware>) -> Self {
        self.send_middleware.push(layer);
        self
    }

    /// Dials, negotiates, and returns a ready sending session.
    pub async fn dial(&self) -> SmtpResult<SmtpSender> {
        let conn = self.connect().await?;
        Ok(SmtpSender {
            dialer: self.clone(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Dials, sends each message, and closes the session. The convenience
    /// entry point for one-shot delivery.
    pub async fn dial_and_send(&self, messages: &[Arc<dyn Message>]) -> SmtpResult<()> {
        let sender = self.dial().await?;
        let result = send_messages(&sender, messages).await;
        let _ = sender.close().await;
        result
    }

    pub(crate) async fn connect(&self) -> SmtpResult<Connection> {
        let factory = Arc::clone(&self.factory);
        let config = Arc::clone(&self.config);
        let terminal: DialOp = Arc::new(move |request: DialRequest| {
            let factory = Arc::clone(&factory);
            let config = Arc::clone(&config);
            Box::pin(async move { factory.open(&request.addr, &config).await })
        });
        let op = compose_dial(&self.dial_middleware, terminal);

        let mut transport = op(DialRequest {
            addr: self.config.address(),
        })
        .await?;

        match self.negotiate(&mut transport).await {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(host = %self.config.host, tls = transport.is_tls(), "session ready");
                Ok(Connection {
                    transport,
                    closed: false,
                })
            }
            Err(err) => {
                let _ = transport.close().await;
                Err(err)
            }
        }
    }

    async fn negotiate(&self, transport: &mut Box<dyn SmtpTransport>) -> SmtpResult<()> {
        // Immediate SSL wraps the socket before the server speaks.
        if self.config.ssl {
            transport
                .upgrade_tls(&self.config.tls, &self.config.host)
                .await?;
        }

        transport
            .read_response()
            .await?
            .expect_code(codes::SERVICE_READY)?;

        let mut caps = self.hello(transport).await?;

        if !transport.is_tls() {
            let negotiate_tls = match self.config.starttls {
                StartTlsPolicy::Disabled => false,
                StartTlsPolicy::Opportunistic => caps.starttls,
                StartTlsPolicy::Mandatory => {
                    if !caps.starttls {
                        return Err(SmtpError::StartTlsUnsupported {
                            policy: self.config.starttls,
                        });
                    }
                    true
                }
            };
            if negotiate_tls {
                transport.send_command(&SmtpCommand::StartTls).await?;
                transport
                    .read_response()
                    .await?
                    .expect_code(codes::SERVICE_READY)?;
                transport
                    .upgrade_tls(&self.config.tls, &self.config.host)
                    .await?;
                // Capabilities can change across the upgrade.
                caps = self.hello(transport).await?;
            }
        }

        if let Some(auth) = self.resolve_authenticator(&caps) {
            let server = ServerInfo {
                host: self.config.host.clone(),
                tls: transport.is_tls(),
                mechanisms: caps.auth_mechanisms.clone(),
            };
            self.authenticate(transport, auth.as_ref(), &server).await?;
        }

        Ok(())
    }

    /// Greets with EHLO; falls back to HELO when the server rejects it.
    async fn hello(&self, transport: &mut Box<dyn SmtpTransport>) -> SmtpResult<Capabilities> {
        let name = self.config.greeting_name().to_string();
        transport
            .send_command(&SmtpCommand::Ehlo(name.clone()))
            .await?;
        let response = transport.read_response().await?;
        if response.code == codes::OK {
            return Ok(Capabilities::from_ehlo(&response));
        }
        transport.send_command(&SmtpCommand::Helo(name)).await?;
        transport.read_response().await?.expect_code(codes::OK)?;
        Ok(Capabilities::default())
    }

    /// Picks the mechanism for this server: CRAM-MD5 when advertised,
    /// LOGIN when LOGIN is advertised without PLAIN, PLAIN otherwise.
    /// A caller-supplied authenticator always wins, and the choice is
    /// cached for reconnects.
    fn resolve_authenticator(&self, caps: &Capabilities) -> Option<Arc<dyn Authenticator>> {
        if let Some(auth) = self.authenticator.get() {
            return Some(Arc::clone(auth));
        }
        let username = self.config.username.clone()?;
        if caps.auth_mechanisms.is_empty() {
            return None;
        }
        let password = self
            .config
            .password
            .clone()
            .unwrap_or_else(|| SecretString::new(String::new()));

        let selected: Arc<dyn Authenticator> = if caps.supports_auth("CRAM-MD5") {
            Arc::new(CramMd5Authenticator::new(username, password))
        } else if caps.supports_auth("LOGIN") && !caps.supports_auth("PLAIN") {
            Arc::new(LoginAuthenticator::new(
                username,
                password,
                self.config.host.clone(),
            ))
        } else {
            Arc::new(PlainAuthenticator::new(
                username,
                password,
                self.config.host.clone(),
            ))
        };
        let _ = self.authenticator.set(Arc::clone(&selected));
        Some(selected)
    }

    async fn authenticate(
        &self,
        transport: &mut Box<dyn SmtpTransport>,
        auth: &dyn Authenticator,
        server: &ServerInfo,
    ) -> SmtpResult<()> {
        let (mechanism, initial) = auth.start(server)?;
        let initial = if initial.is_empty() {
            None
        } else {
            Some(BASE64.encode(initial))
        };
        transport
            .send_command(&SmtpCommand::Auth { mechanism, initial })
            .await?;

        loop {
            let response = transport.read_response().await?;
            match response.code {
                codes::AUTH_CHALLENGE => {
                    let challenge =
                        BASE64
                            .decode(response.first_line().trim())
                            .map_err(|e| SmtpError::Protocol(format!(
                                "undecodable auth challenge: {}",
                                e
                            )))?;
                    let answer = auth.next(&challenge, true)?;
                    transport
                        .send_command(&SmtpCommand::AuthResponse(BASE64.encode(answer)))
                        .await?;
                }
                codes::AUTH_SUCCESS => {
                    auth.next(&[], false)?;
                    return Ok(());
                }
                _ => return Err(response.to_error()),
            }
        }
    }
}

/// A negotiated connection; drives the per-message command sequence.
pub(crate) struct Connection {
    transport: Box<dyn SmtpTransport>,
    closed: bool,
}

impl Connection {
    async fn mail(&mut self, from: &str) -> SmtpResult<()> {
        self.transport
            .send_command(&SmtpCommand::MailFrom {
                address: from.to_string(),
            })
            .await?;
        let response = self.transport.read_response().await?;
        if !response.is_success() {
            return Err(response.to_error());
        }
        Ok(())
    }

    async fn rcpt(&mut self, to: &str) -> SmtpResult<()> {
        self.transport
            .send_command(&SmtpCommand::RcptTo {
                address: to.to_string(),
            })
            .await?;
        let response = self.transport.read_response().await?;
        if !response.is_success() {
            return Err(response.to_error());
        }
        Ok(())
    }

    async fn data(&mut self, message: &dyn Message) -> SmtpResult<()> {
        self.transport.send_command(&SmtpCommand::Data).await?;
        self.transport
            .read_response()
            .await?
            .expect_code(codes::START_MAIL_INPUT)?;

        let mut body = Vec::new();
        match message.write_to(&mut body).await {
            Ok(_) => {
                let mut payload = crate::protocol::dot_stuff(&body);
                payload.extend_from_slice(b".\r\n");
                self.transport.write_raw(&payload).await?;
                self.transport
                    .read_response()
                    .await?
                    .expect_code(codes::OK)?;
                Ok(())
            }
            Err(err) => {
                // Terminate the DATA phase so the connection stays usable.
                let _ = self.transport.write_raw(b"\r\n.\r\n").await;
                let _ = self.transport.read_response().await;
                Err(err)
            }
        }
    }

    async fn quit(&mut self) -> SmtpResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let quit_result = async {
            self.transport.send_command(&SmtpCommand::Quit).await?;
            self.transport
                .read_response()
                .await?
                .expect_code(codes::SERVICE_CLOSING)?;
            Ok(())
        }
        .await;
        let close_result = self.transport.close().await;
        quit_result.and(close_result)
    }
}

/// A ready sending session over one negotiated connection.
///
/// Cloning is cheap; clones share the underlying connection. A transient
/// failure at the MAIL step triggers a reconnect and a full resend when
/// the configuration allows retries.
#[derive(Clone)]
pub struct SmtpSender {
    dialer: Dialer,
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SmtpSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpSender")
            .field("dialer", &self.dialer)
            .finish_non_exhaustive()
    }
}

impl SmtpSender {
    async fn send_request(&self, request: SendRequest) -> SmtpResult<()> {
        let session = self.clone();
        let terminal: SendOp = Arc::new(move |request: SendRequest| {
            let session = session.clone();
            Box::pin(async move { session.transmit(request).await })
        });
        let op = compose_send(&self.dialer.send_middleware, terminal);
        op(request).await
    }

    fn send_request_boxed(&self, request: SendRequest) -> BoxFuture<'static, SmtpResult<()>> {
        let session = self.clone();
        Box::pin(async move { session.send_request(request).await })
    }

    async fn transmit(&self, request: SendRequest) -> SmtpResult<()> {
        let mut conn = self.conn.lock().await;

        if let Err(err) = conn.mail(&request.from).await {
            if self.dialer.config.retry_failure && err.is_transient() {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %err, "transient failure at MAIL, reconnecting");
                match self.dialer.connect().await {
                    Ok(fresh) => {
                        *conn = fresh;
                        drop(conn);
                        return self.send_request_boxed(request).await;
                    }
                    // Reconnect failed; surface the original failure.
                    Err(_) => return Err(err),
                }
            }
            return Err(err);
        }

        for recipient in &request.recipients {
            conn.rcpt(recipient).await?;
        }
        conn.data(request.message.as_ref()).await
    }
}

#[async_trait]
impl Sender for SmtpSender {
    async fn send(
        &self,
        from: &str,
        recipients: &[String],
        message: Arc<dyn Message>,
    ) -> SmtpResult<()> {
        self.send_request(SendRequest {
            from: from.to_string(),
            recipients: recipients.to_vec(),
            message,
        })
        .await
    }
}

#[async_trait]
impl SendCloser for SmtpSender {
    async fn close(&self) -> SmtpResult<()> {
        self.conn.lock().await.quit().await
    }
}

/// Sends a batch of messages over one session, resolving each envelope
/// from the message itself. Stops at the first failure and reports its
/// zero-based position.
pub async fn send_messages(sender: &dyn Sender, messages: &[Arc<dyn Message>]) -> SmtpResult<()> {
    for (index, message) in messages.iter().enumerate() {
        let result = async {
            let from = message.envelope_sender()?;
            let recipients = message.recipients()?;
            sender.send(&from, &recipients, Arc::clone(message)).await
        }
        .await;
        if let Err(source) = result {
            return Err(SmtpError::Batch {
                index,
                source: Box::new(source),
            });
        }
    }
    Ok(())
}
