// Connection lifecycle: initial connect, loss detection, backoff retries, resubscribe.
//
// The manager is the only writer of the connection state. Everything else observes it
// through a cloned `ConnectionHandle`.
use crate::client::backoff::{Backoff, BackoffPolicy};
use crate::client::shutdown_signalled;
use crate::config::{RetryConfig, SubscribeTopic};
use crate::error::LinkError;
use link_transport::{Transport, TransportError, TransportEvent};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            _ => Self::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct ConnectionCell {
    state: AtomicU8,
    changes: watch::Sender<ConnectionState>,
}

impl ConnectionCell {
    fn new() -> Self {
        let (changes, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            changes,
        }
    }

    fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, next: ConnectionState) {
        let previous = ConnectionState::from_u8(self.state.swap(next as u8, Ordering::AcqRel));
        if previous == next {
            return;
        }
        debug!(from = %previous, to = %next, "connection state changed");
        let connected = if next == ConnectionState::Connected { 1.0 } else { 0.0 };
        metrics::gauge!("link_connected").set(connected);
        self.changes.send_replace(next);
    }
}

/// Read-only view of the connection state.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    cell: Arc<ConnectionCell>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        self.cell.load()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver that wakes on every state transition.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.cell.changes.subscribe()
    }
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    cell: Arc<ConnectionCell>,
    retry: RetryConfig,
    subscriptions: Vec<SubscribeTopic>,
    events: broadcast::Receiver<TransportEvent>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        retry: RetryConfig,
        subscriptions: Vec<SubscribeTopic>,
    ) -> Self {
        // Subscribe before the first connect so no loss event can slip past.
        let events = transport.events();
        Self {
            transport,
            cell: Arc::new(ConnectionCell::new()),
            retry,
            subscriptions,
            events,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            cell: Arc::clone(&self.cell),
        }
    }

    /// First connection attempt. A failure is returned to the caller, which decides
    /// whether it is fatal.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.cell.set(ConnectionState::Connecting);
        match self.attempt().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.cell.set(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    /// Supervise the connection until shutdown. Returns an error only when a loss is
    /// terminal because auto-reconnect is disabled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), LinkError> {
        let mut backoff = Backoff::new(BackoffPolicy {
            base: self.retry.base_reconnect_interval,
            max: self.retry.max_reconnect_interval,
        });
        // Start of the current session. Backoff resets only after one that outlived a
        // base interval.
        let mut session_since = self.handle().is_connected().then(Instant::now);

        if !self.handle().is_connected() {
            if !self.retry.auto_reconnect {
                return Err(LinkError::ConnectionLost {
                    cause: "not connected and auto-reconnect disabled".to_string(),
                });
            }
            // The initial attempt already happened; the next one waits one base interval.
            self.cell.set(ConnectionState::Reconnecting);
            if !self.reconnect(&mut backoff, &mut shutdown, false).await {
                return Ok(());
            }
            session_since = Some(Instant::now());
        }

        loop {
            let event = tokio::select! {
                _ = shutdown_signalled(&mut shutdown) => return Ok(()),
                event = self.events.recv() => event,
            };
            let cause = match event {
                Ok(TransportEvent::ConnectionLost { cause }) => cause,
                Ok(TransportEvent::Reconnecting) => {
                    self.cell.set(ConnectionState::Reconnecting);
                    continue;
                }
                Ok(TransportEvent::Connected) => {
                    // Our own connects already set the state; this path is for
                    // transports that came back on their own.
                    if !self.handle().is_connected() && self.transport.is_open() {
                        self.cell.set(ConnectionState::Connected);
                        session_since = Some(Instant::now());
                        self.resubscribe().await;
                    }
                    continue;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "connection event stream lagged");
                    if self.transport.is_open() {
                        continue;
                    }
                    "connection events lagged while transport closed".to_string()
                }
                Err(broadcast::error::RecvError::Closed) => "transport event stream closed".to_string(),
            };

            if self.transport.is_open() {
                debug!(cause = %cause, "ignoring loss event from a previous session");
                continue;
            }

            warn!(cause = %cause, "connection lost");
            if !self.retry.auto_reconnect {
                self.cell.set(ConnectionState::Disconnected);
                return Err(LinkError::ConnectionLost { cause });
            }
            self.cell.set(ConnectionState::Reconnecting);
            let base = backoff.policy().base;
            let stable = session_since
                .take()
                .is_some_and(|since| since.elapsed() >= base);
            if stable {
                backoff.reset();
            } else {
                debug!(base_ms = base.as_millis() as u64, "session ended early; keeping backoff");
            }
            if !self.reconnect(&mut backoff, &mut shutdown, stable).await {
                return Ok(());
            }
            session_since = Some(Instant::now());
        }
    }

    /// Retry until connected or shut down. Attempts are spaced start-to-start by the
    /// backoff delay; `immediate` fires the first one without waiting. The backoff is
    /// left where it ended; the caller resets it after a stable session.
    async fn reconnect(
        &mut self,
        backoff: &mut Backoff,
        shutdown: &mut watch::Receiver<bool>,
        immediate: bool,
    ) -> bool {
        let mut next_attempt = Instant::now();
        if !immediate {
            next_attempt += backoff.next_delay();
        }
        let mut attempt: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown_signalled(shutdown) => return false,
                _ = tokio::time::sleep_until(next_attempt) => {}
            }
            attempt += 1;
            let started = Instant::now();
            metrics::counter!("link_reconnect_attempts_total").increment(1);
            match self.attempt().await {
                Ok(()) => {
                    info!(attempt, "reconnected");
                    return true;
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(attempt, error = %err, retry_in_ms = delay.as_millis() as u64, "reconnect failed");
                    next_attempt = started + delay;
                }
            }
        }
    }

    async fn attempt(&self) -> Result<(), TransportError> {
        let timeout = self.retry.connect_timeout;
        match tokio::time::timeout(timeout, self.transport.connect(timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(TransportError::ConnectTimeout(timeout)),
        }
        self.cell.set(ConnectionState::Connected);
        self.resubscribe().await;
        Ok(())
    }

    /// Re-issue every subscription. Failures are logged and retried on the next session.
    async fn resubscribe(&self) {
        for subscription in &self.subscriptions {
            match self
                .transport
                .subscribe(&subscription.topic, subscription.qos)
                .await
            {
                Ok(()) => debug!(topic = %subscription.topic, qos = %subscription.qos, "subscribed"),
                Err(err) => warn!(topic = %subscription.topic, error = %err, "subscribe failed"),
            }
        }
    }
}
