// Transport handle contract shared by the link runtime and its adapters.
// The link layer never talks to a broker directly: it connects, publishes, subscribes
// and observes connection events through `Transport`, and waits on `DeliveryToken`s
// for per-message acknowledgment.
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

pub mod loopback;

pub use loopback::{JournalEntry, LoopbackBroker, LoopbackTransport};

pub type Result<T> = std::result::Result<T, TransportError>;

/// Capacity of the per-transport connection event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;
/// Capacity of the per-transport inbound message channel.
pub const INBOUND_CHANNEL_CAPACITY: usize = 1024;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("not connected")]
    NotConnected,
    #[error("disconnect failed: {0}")]
    Disconnect(String),
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// True when the failure means the session is gone rather than the request was refused.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Closed)
    }
}

/// Delivery guarantee requested for a publish or subscription.
///
/// ```
/// use link_transport::QoS;
///
/// assert_eq!(QoS::from_level(1), Some(QoS::AtLeastOnce));
/// assert!(QoS::from_level(3).is_none());
/// assert!(!QoS::AtMostOnce.expects_ack());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "u8")]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        self as u8
    }

    /// QoS 0 has no broker acknowledgment; it completes when handed to the network.
    pub fn expects_ack(self) -> bool {
        !matches!(self, Self::AtMostOnce)
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(level: u8) -> std::result::Result<Self, Self::Error> {
        Self::from_level(level).ok_or_else(|| format!("invalid qos level {level}"))
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

/// Opaque identifier of one in-flight publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(pub u64);

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Failed(String),
}

/// Awaitable completion of a single publish.
///
/// ```
/// use link_transport::{DeliveryOutcome, DeliveryToken, TokenId};
///
/// # tokio_test_block(async {
/// let (token, completer) = DeliveryToken::pending(TokenId(1));
/// completer.ack();
/// assert_eq!(token.wait().await, DeliveryOutcome::Acked);
/// # });
/// # fn tokio_test_block(fut: impl std::future::Future<Output = ()>) {
/// #     tokio::runtime::Builder::new_current_thread().build().expect("rt").block_on(fut);
/// # }
/// ```
#[derive(Debug)]
pub struct DeliveryToken {
    id: TokenId,
    rx: oneshot::Receiver<DeliveryOutcome>,
}

impl DeliveryToken {
    pub fn pending(id: TokenId) -> (Self, DeliveryCompleter) {
        let (tx, rx) = oneshot::channel();
        (Self { id, rx }, DeliveryCompleter { id, tx })
    }

    /// Token that is already complete, used for QoS 0 publishes.
    pub fn acked(id: TokenId) -> Self {
        let (token, completer) = Self::pending(id);
        completer.ack();
        token
    }

    pub fn id(&self) -> TokenId {
        self.id
    }

    /// Wait for the broker's verdict. A completer dropped without a verdict is a failure.
    pub async fn wait(self) -> DeliveryOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => DeliveryOutcome::Failed("delivery abandoned by transport".to_string()),
        }
    }
}

/// Transport-side half of a `DeliveryToken`.
#[derive(Debug)]
pub struct DeliveryCompleter {
    id: TokenId,
    tx: oneshot::Sender<DeliveryOutcome>,
}

impl DeliveryCompleter {
    pub fn id(&self) -> TokenId {
        self.id
    }

    pub fn ack(self) {
        let _ = self.tx.send(DeliveryOutcome::Acked);
    }

    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.tx.send(DeliveryOutcome::Failed(reason.into()));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    ConnectionLost { cause: String },
    /// The transport is retrying on its own.
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
}

/// Connection to a broker as seen by the link runtime.
///
/// Implementations must not reconnect on their own after `ConnectionLost` unless they
/// announce it with `TransportEvent::Reconnecting`; the caller owns the retry policy.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a fresh session. Subscriptions from any prior session are gone.
    async fn connect(&self, timeout: Duration) -> Result<()>;

    /// Hand one message to the network and return a token for its acknowledgment.
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: Bytes,
        retain: bool,
    ) -> Result<DeliveryToken>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Close the session, waiting at most `grace` for outstanding work to flush.
    async fn disconnect(&self, grace: Duration) -> Result<()>;

    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Receiver for messages on subscribed topics. Yields `Some` exactly once.
    fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_completer_fails_token() {
        let (token, completer) = DeliveryToken::pending(TokenId(9));
        drop(completer);
        assert!(matches!(token.wait().await, DeliveryOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn failed_completer_carries_reason() {
        let (token, completer) = DeliveryToken::pending(TokenId(3));
        assert_eq!(token.id(), TokenId(3));
        completer.fail("broker said no");
        assert_eq!(
            token.wait().await,
            DeliveryOutcome::Failed("broker said no".to_string())
        );
    }

    #[test]
    fn qos_deserializes_from_level() {
        assert_eq!(QoS::try_from(2), Ok(QoS::ExactlyOnce));
        assert!(QoS::try_from(7).is_err());
        assert_eq!(QoS::AtLeastOnce.to_string(), "1");
    }

    #[test]
    fn loss_errors_are_classified() {
        assert!(TransportError::NotConnected.is_connection_loss());
        assert!(TransportError::Closed.is_connection_loss());
        assert!(!TransportError::Connect("refused".into()).is_connection_loss());
    }
}
