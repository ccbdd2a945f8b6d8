//! Middleware hooks around dialing and sending.
//!
//! Both operations are modeled as boxed async functions; middleware wraps
//! the next function in the chain and can observe, short-circuit, or retry
//! the call. Layers compose so that the first registered layer is the
//! outermost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::errors::SmtpResult;
use crate::message::Message;
use crate::transport::SmtpTransport;

/// Input to the dial operation.
#[derive(Debug, Clone)]
pub struct DialRequest {
    /// Target address in `host:port` form.
    pub addr: String,
}

/// Input to the send operation.
#[derive(Clone)]
pub struct SendRequest {
    /// Envelope sender.
    pub from: String,
    /// Envelope recipients, deduplicated, in order.
    pub recipients: Vec<String>,
    /// The message body source.
    pub message: Arc<dyn Message>,
}

impl std::fmt::Debug for SendRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendRequest")
            .field("from", &self.from)
            .field("recipients", &self.recipients)
            .finish_non_exhaustive()
    }
}

/// The dial operation as seen by middleware.
pub type DialOp =
    Arc<dyn Fn(DialRequest) -> BoxFuture<'static, SmtpResult<Box<dyn SmtpTransport>>> + Send + Sync>;

/// The send operation as seen by middleware.
pub type SendOp = Arc<dyn Fn(SendRequest) -> BoxFuture<'static, SmtpResult<()>> + Send + Sync>;

/// A layer around the dial operation.
pub trait DialMiddleware: Send + Sync {
    /// Wraps `next`, returning the decorated operation.
    fn wrap(self: Arc<Self>, next: DialOp) -> DialOp;
}

/// A layer around the send operation.
pub trait SendMiddleware: Send + Sync {
    /// Wraps `next`, returning the decorated operation.
    fn wrap(self: Arc<Self>, next: SendOp) -> SendOp;
}

/// Composes dial layers around a terminal operation. The layer at index 0
/// ends up outermost.
pub fn compose_dial(layers: &[Arc<dyn DialMiddleware>], terminal: DialOp) -> DialOp {
    layers
        .iter()
        .rev()
        .fold(terminal, |op, layer| Arc::clone(layer).wrap(op))
}

/// Composes send layers around a terminal operation. The layer at index 0
/// ends up outermost.
pub fn compose_send(layers: &[Arc<dyn SendMiddleware>], terminal: SendOp) -> SendOp {
    layers
        .iter()
        .rev()
        .fold(terminal, |op, layer| Arc::clone(layer).wrap(op))
}

/// In-memory dial counters: attempts and failures.
#[derive(Debug, Default)]
pub struct DialStats {
    attempted: AtomicU64,
    failed: AtomicU64,
}

impl DialStats {
    /// Creates a zeroed counter set.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of dials attempted.
    pub fn attempted(&self) -> u64 {
        self.attempted.load(Ordering::Relaxed)
    }

    /// Number of dials that returned an error.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl DialMiddleware for DialStats {
    fn wrap(self: Arc<Self>, next: DialOp) -> DialOp {
        Arc::new(move |request| {
            let stats = Arc::clone(&self);
            let next = Arc::clone(&next);
            Box::pin(async move {
                stats.attempted.fetch_add(1, Ordering::Relaxed);
                let result = next(request).await;
                if result.is_err() {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                }
                result
            })
        })
    }
}

/// In-memory send counters: attempts and failures.
#[derive(Debug, Default)]
pub struct SendStats {
    attempted: AtomicU64,
    failed: AtomicU64,
}

impl SendStats {
    /// Creates a zeroed counter set.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of sends attempted.
    pub fn attempted(&self) -> u64 {
        self.attempted.load(Ordering::Relaxed)
    }

    /// Number of sends that returned an error.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl SendMiddleware for SendStats {
    fn wrap(self: Arc<Self>, next: SendOp) -> SendOp {
        Arc::new(move |request| {
            let stats = Arc::clone(&self);
            let next = Arc::clone(&next);
            Box::pin(async move {
                stats.attempted.fetch_add(1, Ordering::Relaxed);
                let result = next(request).await;
                if result.is_err() {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                }
                result
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SmtpError;
    use crate::message::Envelope;
    use std::sync::Mutex;

    fn request() -> SendRequest {
        SendRequest {
            from: "a@example.com".into(),
            recipients: vec!["b@example.com".into()],
            message: Arc::new(Envelope::new()),
        }
    }

    struct Tag {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl SendMiddleware for Tag {
        fn wrap(self: Arc<Self>, next: SendOp) -> SendOp {
            Arc::new(move |request| {
                let this = Arc::clone(&self);
                let next = Arc::clone(&next);
                Box::pin(async move {
                    this.log.lock().unwrap().push(this.name);
                    next(request).await
                })
            })
        }
    }

    #[tokio::test]
    async fn test_first_layer_is_outermost() {
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let layers: Vec<Arc<dyn SendMiddleware>> = vec![
            Arc::new(Tag {
                name: "outer",
                log: Arc::clone(&log),
            }),
            Arc::new(Tag {
                name: "inner",
                log: Arc::clone(&log),
            }),
        ];
        let terminal_log = Arc::clone(&log);
        let terminal: SendOp = Arc::new(move |_| {
            let log = Arc::clone(&terminal_log);
            Box::pin(async move {
                log.lock().unwrap().push("terminal");
                Ok(())
            })
        });

        let op = compose_send(&layers, terminal);
        op(request()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["outer", "inner", "terminal"]);
    }

    #[tokio::test]
    async fn test_send_stats_counts_failures() {
        let stats = SendStats::new();
        let layers: Vec<Arc<dyn SendMiddleware>> =
            vec![Arc::clone(&stats) as Arc<dyn SendMiddleware>];
        let terminal: SendOp =
            Arc::new(|_| Box::pin(async { Err(SmtpError::ConnectionClosed) }));

        let op = compose_send(&layers, terminal);
        assert!(op(request()).await.is_err());
        assert!(op(request()).await.is_err());
        assert_eq!(stats.attempted(), 2);
        assert_eq!(stats.failed(), 2);
    }

    #[tokio::test]
    async fn test_dial_stats_counts_successes() {
        let stats = DialStats::new();
        let layers: Vec<Arc<dyn DialMiddleware>> =
            vec![Arc::clone(&stats) as Arc<dyn DialMiddleware>];
        let terminal: DialOp = Arc::new(|_| {
            Box::pin(async { Err(SmtpError::ConnectionClosed) })
        });

        let op = compose_dial(&layers, terminal);
        let _ = op(DialRequest {
            addr: "localhost:25".into(),
        })
        .await;
        assert_eq!(stats.attempted(), 1);
        assert_eq!(stats.failed(), 1);
    }
}
