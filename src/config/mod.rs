//! Configuration for the SMTP dialer.
//!
//! Provides the connection configuration with builder pattern:
//! - Server endpoint and protocol greeting identity
//! - Credentials
//! - STARTTLS policy and TLS material
//! - Timeouts, keep-alive, and retry behavior

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::{SmtpError, SmtpResult};

/// Default read/write timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default TCP keep-alive interval.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(10);

/// Conventional SMTPS port; immediate TLS defaults on when dialing it.
pub const SMTPS_PORT: u16 = 465;

/// STARTTLS negotiation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartTlsPolicy {
    /// Upgrade when the server advertises STARTTLS, otherwise continue in
    /// the clear. This is the default.
    #[default]
    Opportunistic,
    /// Abort the dial unless the server supports STARTTLS. Recommended for
    /// all modern SMTP servers.
    Mandatory,
    /// Never negotiate STARTTLS.
    Disabled,
}

impl fmt::Display for StartTlsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartTlsPolicy::Opportunistic => write!(f, "opportunistic"),
            StartTlsPolicy::Mandatory => write!(f, "mandatory"),
            StartTlsPolicy::Disabled => write!(f, "disabled"),
        }
    }
}

/// Minimum TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsVersion {
    /// TLS 1.2 (default floor).
    #[default]
    Tls12,
    /// TLS 1.3 only.
    Tls13,
}

/// TLS material used for immediate-SSL and STARTTLS upgrades.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Minimum accepted protocol version.
    #[serde(default)]
    pub min_version: TlsVersion,
    /// Server Name Indication override; defaults to the dialed host.
    pub sni_override: Option<String>,
    /// Extra PEM CA bundle trusted in addition to the webpki roots.
    pub ca_cert_path: Option<PathBuf>,
    /// Caller-supplied rustls configuration; overrides everything else.
    #[serde(skip)]
    pub client_config: Option<Arc<rustls::ClientConfig>>,
}

impl TlsConfig {
    /// Resolves the rustls client configuration: the caller-supplied one if
    /// present, else a default with webpki roots and the version floor.
    pub fn resolve(&self, host: &str) -> SmtpResult<Arc<rustls::ClientConfig>> {
        if let Some(custom) = &self.client_config {
            return Ok(Arc::clone(custom));
        }

        let versions: &[&rustls::SupportedProtocolVersion] = match self.min_version {
            TlsVersion::Tls12 => &[&rustls::version::TLS13, &rustls::version::TLS12],
            TlsVersion::Tls13 => &[&rustls::version::TLS13],
        };

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = &self.ca_cert_path {
            let pem = std::fs::read(path).map_err(|e| SmtpError::Tls {
                host: host.to_string(),
                reason: format!("cannot read CA bundle {}: {}", path.display(), e),
            })?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                let cert = cert.map_err(|e| SmtpError::Tls {
                    host: host.to_string(),
                    reason: format!("invalid certificate in {}: {}", path.display(), e),
                })?;
                roots.add(cert).map_err(|e| SmtpError::Tls {
                    host: host.to_string(),
                    reason: format!("cannot trust certificate: {}", e),
                })?;
            }
        }

        let config = rustls::ClientConfig::builder_with_protocol_versions(versions)
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Arc::new(config))
    }

    /// The name presented during the TLS handshake.
    pub fn server_name(&self, host: &str) -> SmtpResult<rustls::pki_types::ServerName<'static>> {
        let name = self.sni_override.as_deref().unwrap_or(host).to_string();
        rustls::pki_types::ServerName::try_from(name.clone()).map_err(|_| SmtpError::Tls {
            host: host.to_string(),
            reason: format!("invalid server name: {}", name),
        })
    }
}

/// Connection configuration for a [`Dialer`](crate::client::Dialer).
///
/// Created once by the caller and reused across any number of dials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialerConfig {
    /// SMTP server hostname.
    pub host: String,
    /// SMTP server port.
    pub port: u16,
    /// Identity sent with EHLO/HELO; defaults to "localhost".
    pub local_name: Option<String>,
    /// Authentication username.
    pub username: Option<String>,
    /// Authentication password (never serialized).
    #[serde(skip)]
    pub password: Option<SecretString>,
    /// TLS material for immediate SSL and STARTTLS upgrades.
    #[serde(default)]
    pub tls: TlsConfig,
    /// STARTTLS policy; has no effect when `ssl` is set.
    #[serde(default)]
    pub starttls: StartTlsPolicy,
    /// Read/write timeout; zero disables timeouts.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// TCP keep-alive interval; zero disables keep-alive probes.
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Whether the connection is wrapped in TLS immediately after dialing.
    /// No STARTTLS negotiation occurs on this path.
    pub ssl: bool,
    /// Whether a transient MAIL-step failure triggers a reconnect and
    /// resend. Defaults to true.
    pub retry_failure: bool,
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}
fn default_keep_alive() -> Duration {
    DEFAULT_KEEP_ALIVE
}

impl DialerConfig {
    /// Creates a configuration with the conventional defaults: 10 second
    /// timeouts, retry enabled, and immediate SSL when `port` is 465.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            local_name: None,
            username: Some(username.into()),
            password: Some(SecretString::new(password.into())),
            tls: TlsConfig::default(),
            starttls: StartTlsPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            keep_alive: DEFAULT_KEEP_ALIVE,
            ssl: port == SMTPS_PORT,
            retry_failure: true,
        }
    }

    /// Creates a configuration builder.
    pub fn builder() -> DialerConfigBuilder {
        DialerConfigBuilder::default()
    }

    /// Returns the target address in `host:port` form.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The identity sent in the protocol greeting.
    pub fn greeting_name(&self) -> &str {
        self.local_name.as_deref().unwrap_or("localhost")
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.host.is_empty() {
            return Err(SmtpError::Configuration("host is required".into()));
        }
        if self.port == 0 {
            return Err(SmtpError::Configuration("port must be non-zero".into()));
        }
        Ok(())
    }
}

/// Builder for [`DialerConfig`].
#[derive(Debug, Default)]
pub struct DialerConfigBuilder {
    host: Option<String>,
    port: u16,
    local_name: Option<String>,
    username: Option<String>,
    password: Option<SecretString>,
    tls: TlsConfig,
    starttls: StartTlsPolicy,
    timeout: Option<Duration>,
    keep_alive: Option<Duration>,
    ssl: Option<bool>,
    retry_failure: Option<bool>,
}

impl DialerConfigBuilder {
    /// Sets the SMTP server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the SMTP server port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the identity sent with EHLO/HELO.
    pub fn local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    /// Sets plain credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets the TLS material.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Sets the STARTTLS policy.
    pub fn starttls(mut self, policy: StartTlsPolicy) -> Self {
        self.starttls = policy;
        self
    }

    /// Sets the read/write timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the TCP keep-alive interval.
    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = Some(interval);
        self
    }

    /// Sets whether the connection is wrapped in TLS immediately.
    pub fn ssl(mut self, ssl: bool) -> Self {
        self.ssl = Some(ssl);
        self
    }

    /// Sets whether transient MAIL-step failures trigger a resend.
    pub fn retry_failure(mut self, retry: bool) -> Self {
        self.retry_failure = Some(retry);
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> SmtpResult<DialerConfig> {
        let port = self.port;
        let config = DialerConfig {
            host: self
                .host
                .ok_or_else(|| SmtpError::Configuration("host is required".into()))?,
            port,
            local_name: self.local_name,
            username: self.username,
            password: self.password,
            tls: self.tls,
            starttls: self.starttls,
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            keep_alive: self.keep_alive.unwrap_or(DEFAULT_KEEP_ALIVE),
            ssl: self.ssl.unwrap_or(port == SMTPS_PORT),
            retry_failure: self.retry_failure.unwrap_or(true),
        };
        config.validate()?;
        Ok(config)
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_defaults() {
        let config = DialerConfig::new("smtp.example.com", 587, "user", "pwd");
        assert_eq!(config.address(), "smtp.example.com:587");
        assert!(!config.ssl);
        assert!(config.retry_failure);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.keep_alive, DEFAULT_KEEP_ALIVE);
        assert_eq!(config.starttls, StartTlsPolicy::Opportunistic);
        assert_eq!(config.greeting_name(), "localhost");
    }

    #[test]
    fn test_smtps_port_implies_ssl() {
        let config = DialerConfig::new("smtp.example.com", 465, "user", "pwd");
        assert!(config.ssl);

        let config = DialerConfig::builder()
            .host("smtp.example.com")
            .port(465)
            .build()
            .unwrap();
        assert!(config.ssl);

        let config = DialerConfig::builder()
            .host("smtp.example.com")
            .port(465)
            .ssl(false)
            .build()
            .unwrap();
        assert!(!config.ssl);
    }

    #[test]
    fn test_builder_validation() {
        assert!(DialerConfig::builder().port(25).build().is_err());
        assert!(DialerConfig::builder().host("smtp.example.com").build().is_err());
    }

    #[test]
    fn test_policy_display() {
        assert_eq!(StartTlsPolicy::Opportunistic.to_string(), "opportunistic");
        assert_eq!(StartTlsPolicy::Mandatory.to_string(), "mandatory");
        assert_eq!(StartTlsPolicy::Disabled.to_string(), "disabled");
    }

    #[test]
    fn test_password_redacted_in_debug() {
        let config = DialerConfig::new("smtp.example.com", 587, "user", "hunter2");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
    }
}
