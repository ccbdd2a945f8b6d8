//! Message abstraction: envelope resolution, address validation, and body
//! streaming.
//!
//! The sending session only needs three things from a message: who it is
//! from, who it goes to, and its bytes. [`Message`] captures exactly that,
//! so any composer can plug in. [`Envelope`] is the built-in implementation
//! backed by header-style fields and a byte body.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::errors::{SmtpError, SmtpResult};

/// What the sending session needs from a message.
#[async_trait]
pub trait Message: Send + Sync {
    /// The envelope sender, already validated.
    fn envelope_sender(&self) -> SmtpResult<String>;

    /// The envelope recipients, validated and deduplicated, in order.
    fn recipients(&self) -> SmtpResult<Vec<String>>;

    /// Streams the message body into `sink`, returning the byte count.
    async fn write_to(&self, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> SmtpResult<u64>;
}

/// Validates and normalizes a single address value.
///
/// Returns the bare address on success, or a reason string the caller
/// wraps with the offending field name.
pub trait AddressValidator: Send + Sync {
    /// Validates `raw`, returning the address to place on the wire.
    fn validate(&self, raw: &str) -> Result<String, String>;
}

/// The default validator: accepts `addr` or `Name <addr>` forms and applies
/// basic RFC 5321 length and shape checks.
#[derive(Debug, Default, Clone)]
pub struct BareValidator;

impl AddressValidator for BareValidator {
    fn validate(&self, raw: &str) -> Result<String, String> {
        let raw = raw.trim();
        // Accept a display-name form and extract the angle-bracketed part.
        let addr = match (raw.rfind('<'), raw.rfind('>')) {
            (Some(open), Some(close)) if open < close => raw[open + 1..close].trim(),
            (None, None) => raw,
            _ => return Err("unbalanced angle brackets".to_string()),
        };

        if addr.is_empty() {
            return Err("empty address".to_string());
        }
        if addr.len() > 254 {
            return Err("address exceeds 254 characters".to_string());
        }
        if addr.chars().any(|c| c.is_control() || c == ' ') {
            return Err("address contains whitespace or control characters".to_string());
        }

        let mut parts = addr.splitn(2, '@');
        let local = parts.next().unwrap_or("");
        let domain = parts.next().ok_or_else(|| "missing @".to_string())?;
        if domain.contains('@') {
            return Err("more than one @".to_string());
        }
        if local.is_empty() || local.len() > 64 {
            return Err("local part must be 1 to 64 characters".to_string());
        }
        if domain.is_empty() {
            return Err("empty domain".to_string());
        }

        Ok(addr.to_string())
    }
}

/// A message built from envelope fields and a raw byte body.
///
/// Field semantics mirror common mail headers: the envelope sender is the
/// "Sender" field when set, otherwise "From"; recipients are the union of
/// "To", "Cc", and "Bcc" in the order they were added, with exact
/// duplicates dropped.
#[derive(Clone)]
pub struct Envelope {
    sender: Option<String>,
    from: Option<String>,
    to: Vec<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    body: Vec<u8>,
    validator: Arc<dyn AddressValidator>,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("sender", &self.sender)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("cc", &self.cc)
            .field("bcc", &self.bcc)
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

impl Envelope {
    /// Creates an empty envelope with the default validator.
    pub fn new() -> Self {
        Self {
            sender: None,
            from: None,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            body: Vec::new(),
            validator: Arc::new(BareValidator),
        }
    }

    /// Sets the "Sender" field, which takes precedence over "From".
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Sets the "From" field.
    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Adds a "To" recipient.
    pub fn to(mut self, addr: impl Into<String>) -> Self {
        self.to.push(addr.into());
        self
    }

    /// Adds a "Cc" recipient.
    pub fn cc(mut self, addr: impl Into<String>) -> Self {
        self.cc.push(addr.into());
        self
    }

    /// Adds a "Bcc" recipient.
    pub fn bcc(mut self, addr: impl Into<String>) -> Self {
        self.bcc.push(addr.into());
        self
    }

    /// Sets the message body.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Replaces the address validator.
    pub fn validator(mut self, validator: Arc<dyn AddressValidator>) -> Self {
        self.validator = validator;
        self
    }

    fn check(&self, field: &str, raw: &str) -> SmtpResult<String> {
        self.validator
            .validate(raw)
            .map_err(|reason| SmtpError::InvalidAddress {
                field: field.to_string(),
                reason,
            })
    }
}

#[async_trait]
impl Message for Envelope {
    fn envelope_sender(&self) -> SmtpResult<String> {
        if let Some(sender) = &self.sender {
            return self.check("Sender", sender);
        }
        if let Some(from) = &self.from {
            return self.check("From", from);
        }
        Err(SmtpError::SenderMissing)
    }

    fn recipients(&self) -> SmtpResult<Vec<String>> {
        let fields = [("To", &self.to), ("Cc", &self.cc), ("Bcc", &self.bcc)];
        let mut out = Vec::new();
        for (field, values) in fields {
            for raw in values {
                let addr = self.check(field, raw)?;
                if !out.contains(&addr) {
                    out.push(addr);
                }
            }
        }
        Ok(out)
    }

    async fn write_to(&self, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> SmtpResult<u64> {
        sink.write_all(&self.body).await?;
        Ok(self.body.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_prefers_sender_field() {
        let message = Envelope::new()
            .from("from@example.com")
            .sender("sender@example.com");
        assert_eq!(message.envelope_sender().unwrap(), "sender@example.com");
    }

    #[test]
    fn test_sender_falls_back_to_from() {
        let message = Envelope::new().from("from@example.com");
        assert_eq!(message.envelope_sender().unwrap(), "from@example.com");
    }

    #[test]
    fn test_sender_missing() {
        let message = Envelope::new().to("to@example.com");
        assert!(matches!(
            message.envelope_sender().unwrap_err(),
            SmtpError::SenderMissing
        ));
    }

    #[test]
    fn test_recipients_order_and_dedup() {
        let message = Envelope::new()
            .to("a@example.com")
            .to("b@example.com")
            .cc("a@example.com")
            .cc("c@example.com")
            .bcc("d@example.com")
            .bcc("b@example.com");
        assert_eq!(
            message.recipients().unwrap(),
            vec![
                "a@example.com",
                "b@example.com",
                "c@example.com",
                "d@example.com"
            ]
        );
    }

    #[test]
    fn test_invalid_recipient_names_field() {
        let message = Envelope::new().to("a@example.com").cc("not-an-address");
        let err = message.recipients().unwrap_err();
        match err {
            SmtpError::InvalidAddress { field, .. } => assert_eq!(field, "Cc"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_display_name_form_extracted() {
        let message = Envelope::new().from("Alice Example <alice@example.com>");
        assert_eq!(message.envelope_sender().unwrap(), "alice@example.com");
    }

    #[test]
    fn test_validator_rejections() {
        let v = BareValidator;
        assert!(v.validate("plain@example.com").is_ok());
        assert!(v.validate("Name <n@example.com>").is_ok());
        assert!(v.validate("").is_err());
        assert!(v.validate("no-at-sign").is_err());
        assert!(v.validate("two@@example.com").is_err());
        assert!(v.validate("a@b@example.com").is_err());
        assert!(v.validate("@example.com").is_err());
        assert!(v.validate("user@").is_err());
        assert!(v.validate("Broken <x@example.com").is_err());
        let long_local = format!("{}@example.com", "x".repeat(65));
        assert!(v.validate(&long_local).is_err());
    }

    #[tokio::test]
    async fn test_write_to_reports_length() {
        let message = Envelope::new().body(&b"Subject: hi\r\n\r\nbody\r\n"[..]);
        let mut sink = Vec::new();
        let n = message.write_to(&mut sink).await.unwrap();
        assert_eq!(n, sink.len() as u64);
        assert_eq!(sink, b"Subject: hi\r\n\r\nbody\r\n");
    }
}
