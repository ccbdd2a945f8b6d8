//! An async SMTP client: dial once, send many.
//!
//! The crate centers on [`Dialer`], which holds the connection
//! configuration, and [`SmtpSender`], the negotiated session it produces.
//! Negotiation covers the greeting, STARTTLS according to the configured
//! [`StartTlsPolicy`], and SASL authentication with a mechanism chosen
//! from the server's announcement (CRAM-MD5, LOGIN, or PLAIN) or supplied
//! by the caller.
//!
//! Sessions recover from transient network failures: when the MAIL step
//! times out or hits a closed connection, the sender re-dials and replays
//! the whole message on the fresh connection. Dial and send operations
//! accept middleware layers for instrumentation.
//!
//! ```no_run
//! use std::sync::Arc;
//! use courier_smtp::{Dialer, DialerConfig, Envelope, Message};
//!
//! # async fn demo() -> courier_smtp::SmtpResult<()> {
//! let config = DialerConfig::new("smtp.example.com", 587, "user", "secret");
//! let dialer = Dialer::new(config)?;
//!
//! let message: Arc<dyn Message> = Arc::new(
//!     Envelope::new()
//!         .from("alice@example.com")
//!         .to("bob@example.com")
//!         .body(&b"Subject: hello\r\n\r\nhi there\r\n"[..]),
//! );
//! dialer.dial_and_send(&[message]).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod auth;
pub mod client;
pub mod config;
pub mod errors;
pub mod message;
pub mod middleware;
pub mod mocks;
pub mod protocol;
pub mod transport;

pub use auth::{
    Authenticator, CramMd5Authenticator, LoginAuthenticator, PlainAuthenticator, ServerInfo,
};
pub use client::{send_messages, Dialer, SendCloser, Sender, SmtpSender};
pub use config::{DialerConfig, DialerConfigBuilder, StartTlsPolicy, TlsConfig, TlsVersion};
pub use errors::{SmtpError, SmtpResult};
pub use message::{AddressValidator, BareValidator, Envelope, Message};
pub use middleware::{DialMiddleware, DialStats, SendMiddleware, SendStats};
pub use protocol::{Capabilities, SmtpCommand, SmtpResponse};
pub use transport::{SmtpTransport, TcpFactory, TcpTransport, TransportFactory};
