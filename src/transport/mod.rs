//! Network transport: buffered TCP streams with optional TLS, timeouts on
//! every operation, and keep-alive configuration.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::{DialerConfig, TlsConfig};
use crate::errors::{SmtpError, SmtpResult};
use crate::protocol::{SmtpCommand, SmtpResponse};

/// The byte-level connection to an SMTP server.
///
/// Implemented by [`TcpTransport`] for real connections and by the mock
/// transport for tests. Command/response exchange, TLS upgrade, and
/// teardown all go through this seam.
#[async_trait]
pub trait SmtpTransport: Send + fmt::Debug {
    /// Writes the command followed by CRLF and flushes.
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<()>;

    /// Writes raw bytes and flushes. Used for the message body.
    async fn write_raw(&mut self, bytes: &[u8]) -> SmtpResult<()>;

    /// Reads one complete, possibly multiline, server reply.
    async fn read_response(&mut self) -> SmtpResult<SmtpResponse>;

    /// Wraps the connection in TLS.
    async fn upgrade_tls(&mut self, tls: &TlsConfig, host: &str) -> SmtpResult<()>;

    /// Whether the connection is currently encrypted.
    fn is_tls(&self) -> bool;

    /// Shuts the connection down. No QUIT is sent here; protocol-level
    /// teardown belongs to the session.
    async fn close(&mut self) -> SmtpResult<()>;
}

/// Opens transports for the dialer. Swapped out in tests.
#[async_trait]
pub trait TransportFactory: Send + Sync + fmt::Debug {
    /// Connects to `addr` and returns a ready transport. The connection is
    /// plain TCP; TLS upgrades happen through the transport afterwards.
    async fn open(&self, addr: &str, config: &DialerConfig) -> SmtpResult<Box<dyn SmtpTransport>>;
}

enum TransportStream {
    Plain(BufReader<TcpStream>),
    Tls(BufReader<TlsStream<TcpStream>>),
}

impl fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportStream::Plain(_) => f.write_str("Plain"),
            TransportStream::Tls(_) => f.write_str("Tls"),
        }
    }
}

/// A buffered TCP connection, plain or TLS, with a per-operation timeout.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TransportStream>,
    timeout: Duration,
}

async fn with_timeout<T, F>(limit: Duration, what: &'static str, fut: F) -> SmtpResult<T>
where
    F: Future<Output = SmtpResult<T>>,
{
    if limit.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SmtpError::Timeout { what }),
    }
}

impl TcpTransport {
    /// Wraps an established TCP stream.
    pub fn new(stream: TcpStream, timeout: Duration) -> Self {
        Self {
            stream: Some(TransportStream::Plain(BufReader::new(stream))),
            timeout,
        }
    }

    fn stream_mut(&mut self) -> SmtpResult<&mut TransportStream> {
        self.stream.as_mut().ok_or(SmtpError::ConnectionClosed)
    }

    async fn write_all_flush(&mut self, bytes: &[u8]) -> SmtpResult<()> {
        match self.stream_mut()? {
            TransportStream::Plain(s) => {
                s.get_mut().write_all(bytes).await?;
                s.get_mut().flush().await?;
            }
            TransportStream::Tls(s) => {
                s.get_mut().write_all(bytes).await?;
                s.get_mut().flush().await?;
            }
        }
        Ok(())
    }

    async fn read_line(&mut self) -> SmtpResult<String> {
        let mut line = String::new();
        let n = match self.stream_mut()? {
            TransportStream::Plain(s) => s.read_line(&mut line).await?,
            TransportStream::Tls(s) => s.read_line(&mut line).await?,
        };
        if n == 0 {
            return Err(SmtpError::ConnectionClosed);
        }
        Ok(line)
    }

    async fn read_response_inner(&mut self) -> SmtpResult<SmtpResponse> {
        let mut lines = Vec::new();
        let mut code = 0;
        loop {
            let raw = self.read_line().await?;
            let (line_code, text, more) = SmtpResponse::parse_line(&raw)?;
            if !lines.is_empty() && line_code != code {
                return Err(SmtpError::Protocol(format!(
                    "reply code changed mid-response: {} then {}",
                    code, line_code
                )));
            }
            code = line_code;
            lines.push(text);
            if !more {
                break;
            }
        }
        Ok(SmtpResponse { code, lines })
    }
}

#[async_trait]
impl SmtpTransport for TcpTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<()> {
        let mut wire = command.to_wire();
        wire.push_str("\r\n");
        let timeout = self.timeout;
        with_timeout(timeout, "command write", self.write_all_flush(wire.as_bytes())).await
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> SmtpResult<()> {
        let timeout = self.timeout;
        with_timeout(timeout, "data write", self.write_all_flush(bytes)).await
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        let timeout = self.timeout;
        with_timeout(timeout, "response read", self.read_response_inner()).await
    }

    async fn upgrade_tls(&mut self, tls: &TlsConfig, host: &str) -> SmtpResult<()> {
        let stream = self.stream.take().ok_or(SmtpError::ConnectionClosed)?;
        let tcp = match stream {
            TransportStream::Plain(buf) => buf.into_inner(),
            TransportStream::Tls(buf) => {
                self.stream = Some(TransportStream::Tls(buf));
                return Err(SmtpError::Tls {
                    host: host.to_string(),
                    reason: "connection is already encrypted".to_string(),
                });
            }
        };

        let client_config = tls.resolve(host)?;
        let server_name = tls.server_name(host)?;
        let connector = TlsConnector::from(client_config);

        let handshake = async {
            connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| SmtpError::Tls {
                    host: host.to_string(),
                    reason: e.to_string(),
                })
        };
        let tls_stream = with_timeout(self.timeout, "TLS handshake", handshake).await?;
        self.stream = Some(TransportStream::Tls(BufReader::new(tls_stream)));
        Ok(())
    }

    fn is_tls(&self) -> bool {
        matches!(self.stream, Some(TransportStream::Tls(_)))
    }

    async fn close(&mut self) -> SmtpResult<()> {
        if let Some(stream) = self.stream.take() {
            match stream {
                TransportStream::Plain(mut s) => s.get_mut().shutdown().await?,
                TransportStream::Tls(mut s) => s.get_mut().shutdown().await?,
            }
        }
        Ok(())
    }
}

/// Opens real TCP connections with nodelay and keep-alive applied.
#[derive(Debug, Default, Clone)]
pub struct TcpFactory;

#[async_trait]
impl TransportFactory for TcpFactory {
    async fn open(&self, addr: &str, config: &DialerConfig) -> SmtpResult<Box<dyn SmtpTransport>> {
        let connect = async {
            TcpStream::connect(addr).await.map_err(|e| SmtpError::Connect {
                addr: addr.to_string(),
                source: e,
            })
        };
        let stream = with_timeout(config.timeout, "connect", connect).await?;

        stream.set_nodelay(true)?;
        if !config.keep_alive.is_zero() {
            let keepalive = TcpKeepalive::new()
                .with_time(config.keep_alive)
                .with_interval(config.keep_alive);
            SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(addr, "tcp connection established");

        Ok(Box::new(TcpTransport::new(stream, config.timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pipe() -> (TcpTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (TcpTransport::new(client, Duration::from_secs(5)), server)
    }

    #[tokio::test]
    async fn test_send_command_appends_crlf() {
        let (mut transport, mut server) = pipe().await;
        transport
            .send_command(&SmtpCommand::Ehlo("localhost".into()))
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"EHLO localhost\r\n");
    }

    #[tokio::test]
    async fn test_read_multiline_response() {
        let (mut transport, mut server) = pipe().await;
        server
            .write_all(b"250-smtp.example.com\r\n250-STARTTLS\r\n250 AUTH PLAIN\r\n")
            .await
            .unwrap();
        let response = transport.read_response().await.unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(
            response.lines,
            vec!["smtp.example.com", "STARTTLS", "AUTH PLAIN"]
        );
    }

    #[tokio::test]
    async fn test_inconsistent_multiline_code_rejected() {
        let (mut transport, mut server) = pipe().await;
        server
            .write_all(b"250-smtp.example.com\r\n550 no\r\n")
            .await
            .unwrap();
        let err = transport.read_response().await.unwrap_err();
        assert!(matches!(err, SmtpError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_eof_maps_to_connection_closed() {
        let (mut transport, server) = pipe().await;
        drop(server);
        let err = transport.read_response().await.unwrap_err();
        assert!(matches!(err, SmtpError::ConnectionClosed));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (mut transport, _server) = pipe().await;
        transport.timeout = Duration::from_millis(20);
        let err = transport.read_response().await.unwrap_err();
        assert!(matches!(err, SmtpError::Timeout { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut transport, _server) = pipe().await;
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(matches!(
            transport.read_response().await.unwrap_err(),
            SmtpError::ConnectionClosed
        ));
    }

    #[tokio::test]
    async fn test_plain_connection_reports_no_tls() {
        let (transport, _server) = pipe().await;
        assert!(!transport.is_tls());
    }
}
