// In-process broker for tests and demos.
// Every transport gets a clean session on connect; impairment switches let callers cut
// the network, drop live sessions, delay or swallow acknowledgments.
use crate::{
    DeliveryCompleter, DeliveryToken, EVENT_CHANNEL_CAPACITY, INBOUND_CHANNEL_CAPACITY,
    InboundMessage, QoS, Result, TokenId, Transport, TransportError, TransportEvent,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

const JOURNAL_CAPACITY: usize = 65_536;

/// One message accepted by the broker, in acceptance order.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub client_id: String,
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
    pub at: Instant,
}

#[derive(Debug)]
struct Session {
    client_id: String,
    subscriptions: HashMap<String, QoS>,
    inbound: mpsc::Sender<InboundMessage>,
    events: broadcast::Sender<TransportEvent>,
    open: Arc<AtomicBool>,
    // Completers parked while acks are being swallowed.
    stalled: Vec<DeliveryCompleter>,
}

impl Session {
    fn close(self, cause: Option<&str>) {
        self.open.store(false, Ordering::Release);
        let reason = cause.unwrap_or("session closed");
        for completer in self.stalled {
            completer.fail(reason);
        }
        if let Some(cause) = cause {
            let _ = self.events.send(TransportEvent::ConnectionLost {
                cause: cause.to_string(),
            });
        }
    }
}

#[derive(Debug)]
struct BrokerState {
    reachable: AtomicBool,
    drop_acks: AtomicBool,
    reject_subscribes: AtomicBool,
    ack_delay_ms: AtomicU64,
    next_session: AtomicU64,
    sessions: Mutex<HashMap<u64, Session>>,
    journal: Mutex<VecDeque<JournalEntry>>,
    connect_attempts: Mutex<Vec<Instant>>,
}

/// Shared handle to the in-process broker.
///
/// ```
/// use link_transport::{LoopbackBroker, Transport};
///
/// let broker = LoopbackBroker::new();
/// let transport = broker.transport("agent-1");
/// assert!(!transport.is_open());
/// broker.set_reachable(false);
/// assert!(!broker.is_reachable());
/// ```
#[derive(Debug, Clone)]
pub struct LoopbackBroker {
    state: Arc<BrokerState>,
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                reachable: AtomicBool::new(true),
                drop_acks: AtomicBool::new(false),
                reject_subscribes: AtomicBool::new(false),
                ack_delay_ms: AtomicU64::new(0),
                next_session: AtomicU64::new(1),
                sessions: Mutex::new(HashMap::new()),
                journal: Mutex::new(VecDeque::new()),
                connect_attempts: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn transport(&self, client_id: impl Into<String>) -> LoopbackTransport {
        LoopbackTransport::new(self.clone(), client_id.into())
    }

    /// Cut or restore the network. Cutting it drops every live session.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::Release);
        if !reachable {
            self.sever_all("network unreachable");
        }
        tracing::debug!(reachable, "loopback reachability changed");
    }

    pub fn is_reachable(&self) -> bool {
        self.state.reachable.load(Ordering::Acquire)
    }

    /// Drop every live session without touching reachability.
    pub fn drop_connections(&self, cause: &str) {
        self.sever_all(cause);
    }

    pub fn set_ack_delay(&self, delay: Duration) {
        self.state
            .ack_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Park acknowledgments until the session ends; tokens then fail.
    pub fn set_drop_acks(&self, drop_acks: bool) {
        self.state.drop_acks.store(drop_acks, Ordering::Relaxed);
    }

    pub fn set_reject_subscribes(&self, reject: bool) {
        self.state.reject_subscribes.store(reject, Ordering::Relaxed);
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state.journal.lock().iter().cloned().collect()
    }

    pub fn journal_for(&self, topic: &str) -> Vec<JournalEntry> {
        self.state
            .journal
            .lock()
            .iter()
            .filter(|entry| entry.topic == topic)
            .cloned()
            .collect()
    }

    /// Time of every connect attempt, successful or not.
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.state.connect_attempts.lock().clone()
    }

    pub fn session_count(&self) -> usize {
        self.state.sessions.lock().len()
    }

    /// Topic filters held by the live session of `client_id`, sorted.
    pub fn subscriptions_of(&self, client_id: &str) -> Vec<String> {
        let sessions = self.state.sessions.lock();
        let mut filters: Vec<String> = sessions
            .values()
            .filter(|session| session.client_id == client_id)
            .flat_map(|session| session.subscriptions.keys().cloned())
            .collect();
        filters.sort();
        filters
    }

    fn sever_all(&self, cause: &str) {
        let drained: Vec<Session> = {
            let mut sessions = self.state.sessions.lock();
            sessions.drain().map(|(_, session)| session).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(sessions = drained.len(), cause, "loopback dropping sessions");
        }
        for session in drained {
            session.close(Some(cause));
        }
    }

    fn open_session(
        &self,
        client_id: &str,
        inbound: mpsc::Sender<InboundMessage>,
        events: broadcast::Sender<TransportEvent>,
        open: Arc<AtomicBool>,
    ) -> Result<u64> {
        self.state.connect_attempts.lock().push(Instant::now());
        if !self.is_reachable() {
            return Err(TransportError::Connect("broker unreachable".to_string()));
        }
        let id = self.state.next_session.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            client_id: client_id.to_string(),
            subscriptions: HashMap::new(),
            inbound,
            events,
            open,
            stalled: Vec::new(),
        };
        self.state.sessions.lock().insert(id, session);
        Ok(id)
    }

    fn close_session(&self, session_id: u64) {
        let session = self.state.sessions.lock().remove(&session_id);
        if let Some(session) = session {
            session.close(None);
        }
    }

    fn subscribe(&self, session_id: u64, topic: &str, qos: QoS) -> Result<()> {
        if self.state.reject_subscribes.load(Ordering::Relaxed) {
            return Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "rejected by broker".to_string(),
            });
        }
        let mut sessions = self.state.sessions.lock();
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "not connected".to_string(),
            })?;
        session.subscriptions.insert(topic.to_string(), qos);
        Ok(())
    }

    fn route(
        &self,
        session_id: u64,
        token_id: TokenId,
        topic: &str,
        qos: QoS,
        payload: Bytes,
    ) -> Result<DeliveryToken> {
        let mut sessions = self.state.sessions.lock();
        let client_id = match sessions.get(&session_id) {
            Some(session) => session.client_id.clone(),
            None => return Err(TransportError::NotConnected),
        };

        {
            let mut journal = self.state.journal.lock();
            if journal.len() == JOURNAL_CAPACITY {
                journal.pop_front();
            }
            journal.push_back(JournalEntry {
                client_id,
                topic: topic.to_string(),
                qos,
                payload: payload.clone(),
                at: Instant::now(),
            });
        }

        for session in sessions.values() {
            let granted = session
                .subscriptions
                .iter()
                .filter(|(filter, _)| topic_matches(filter, topic))
                .map(|(_, sub_qos)| *sub_qos)
                .max();
            let Some(sub_qos) = granted else {
                continue;
            };
            let message = InboundMessage {
                topic: topic.to_string(),
                qos: qos.min(sub_qos),
                payload: payload.clone(),
            };
            if session.inbound.try_send(message).is_err() {
                tracing::debug!(topic, client_id = %session.client_id, "loopback inbound full; dropping");
            }
        }

        if !qos.expects_ack() {
            return Ok(DeliveryToken::acked(token_id));
        }

        let (token, completer) = DeliveryToken::pending(token_id);
        if self.state.drop_acks.load(Ordering::Relaxed) {
            if let Some(session) = sessions.get_mut(&session_id) {
                session.stalled.push(completer);
            }
            return Ok(token);
        }
        drop(sessions);

        let delay = Duration::from_millis(self.state.ack_delay_ms.load(Ordering::Relaxed));
        if delay.is_zero() {
            completer.ack();
        } else {
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if state.sessions.lock().contains_key(&session_id) {
                    completer.ack();
                } else {
                    completer.fail("connection lost before acknowledgment");
                }
            });
        }
        Ok(token)
    }
}

/// MQTT-style topic filter match with `+` and trailing `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Client side of the loopback broker.
#[derive(Debug)]
pub struct LoopbackTransport {
    broker: LoopbackBroker,
    client_id: String,
    session: Mutex<Option<u64>>,
    open: Arc<AtomicBool>,
    events: broadcast::Sender<TransportEvent>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    next_token: AtomicU64,
}

impl LoopbackTransport {
    fn new(broker: LoopbackBroker, client_id: String) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        Self {
            broker,
            client_id,
            session: Mutex::new(None),
            open: Arc::new(AtomicBool::new(false)),
            events,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn current_session(&self) -> Option<u64> {
        *self.session.lock()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, _timeout: Duration) -> Result<()> {
        if let Some(previous) = self.session.lock().take() {
            self.broker.close_session(previous);
        }
        let id = self.broker.open_session(
            &self.client_id,
            self.inbound_tx.clone(),
            self.events.clone(),
            Arc::clone(&self.open),
        )?;
        *self.session.lock() = Some(id);
        self.open.store(true, Ordering::Release);
        let _ = self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: Bytes,
        _retain: bool,
    ) -> Result<DeliveryToken> {
        let session = self.current_session().ok_or(TransportError::NotConnected)?;
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let token_id = TokenId(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.broker.route(session, token_id, topic, qos, payload)
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        let session = self
            .current_session()
            .ok_or_else(|| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "not connected".to_string(),
            })?;
        self.broker.subscribe(session, topic, qos)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn disconnect(&self, _grace: Duration) -> Result<()> {
        let session = self.session.lock().take();
        if let Some(session) = session {
            self.broker.close_session(session);
        }
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeliveryOutcome;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn publish_reaches_subscriber_and_acks() {
        let broker = LoopbackBroker::new();
        let agent = broker.transport("agent");
        let backend = broker.transport("backend");
        let mut inbound = backend.take_inbound().expect("inbound");
        assert!(backend.take_inbound().is_none());

        agent.connect(TIMEOUT).await.expect("connect agent");
        backend.connect(TIMEOUT).await.expect("connect backend");
        backend
            .subscribe("/driver/location", QoS::AtLeastOnce)
            .await
            .expect("subscribe");

        let token = agent
            .publish(
                "/driver/location",
                QoS::AtLeastOnce,
                Bytes::from_static(b"ts=1|seq=1|"),
                false,
            )
            .await
            .expect("publish");
        assert_eq!(token.wait().await, DeliveryOutcome::Acked);

        let message = inbound.recv().await.expect("message");
        assert_eq!(message.topic, "/driver/location");
        assert_eq!(message.qos, QoS::AtLeastOnce);
        assert_eq!(&message.payload[..], b"ts=1|seq=1|");
        assert_eq!(broker.journal_for("/driver/location").len(), 1);
    }

    #[tokio::test]
    async fn unreachable_broker_refuses_connect() {
        let broker = LoopbackBroker::new();
        broker.set_reachable(false);
        let transport = broker.transport("agent");
        let err = transport.connect(TIMEOUT).await.expect_err("refused");
        assert!(matches!(err, TransportError::Connect(_)));
        assert!(!transport.is_open());
        assert_eq!(broker.connect_attempts().len(), 1);
    }

    #[tokio::test]
    async fn severed_session_emits_loss_and_clears_subscriptions() {
        let broker = LoopbackBroker::new();
        let transport = broker.transport("agent");
        let mut events = transport.events();
        transport.connect(TIMEOUT).await.expect("connect");
        transport
            .subscribe("/driver/offer", QoS::AtLeastOnce)
            .await
            .expect("subscribe");
        assert_eq!(broker.subscriptions_of("agent"), vec!["/driver/offer"]);
        assert_eq!(events.recv().await.expect("event"), TransportEvent::Connected);

        broker.drop_connections("test blip");
        assert!(!transport.is_open());
        assert_eq!(
            events.recv().await.expect("event"),
            TransportEvent::ConnectionLost {
                cause: "test blip".to_string()
            }
        );
        let err = transport
            .publish("/driver/offer", QoS::AtMostOnce, Bytes::new(), false)
            .await
            .expect_err("not connected");
        assert_eq!(err, TransportError::NotConnected);

        transport.connect(TIMEOUT).await.expect("reconnect");
        assert!(broker.subscriptions_of("agent").is_empty());
    }

    #[tokio::test]
    async fn dropped_acks_fail_when_session_ends() {
        let broker = LoopbackBroker::new();
        let transport = broker.transport("agent");
        transport.connect(TIMEOUT).await.expect("connect");
        broker.set_drop_acks(true);

        let token = transport
            .publish("/t", QoS::AtLeastOnce, Bytes::from_static(b"x"), false)
            .await
            .expect("publish");
        broker.drop_connections("gone");
        assert!(matches!(token.wait().await, DeliveryOutcome::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_ack_completes_after_delay() {
        let broker = LoopbackBroker::new();
        let transport = broker.transport("agent");
        transport.connect(TIMEOUT).await.expect("connect");
        broker.set_ack_delay(Duration::from_millis(300));

        let started = Instant::now();
        let token = transport
            .publish("/t", QoS::AtLeastOnce, Bytes::from_static(b"x"), false)
            .await
            .expect("publish");
        assert_eq!(token.wait().await, DeliveryOutcome::Acked);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn rejected_subscribe_is_reported() {
        let broker = LoopbackBroker::new();
        let transport = broker.transport("agent");
        transport.connect(TIMEOUT).await.expect("connect");
        broker.set_reject_subscribes(true);
        let err = transport
            .subscribe("/driver/ride", QoS::AtLeastOnce)
            .await
            .expect_err("rejected");
        assert!(matches!(err, TransportError::Subscribe { .. }));
    }

    #[test]
    fn topic_filters_match_wildcards() {
        assert!(topic_matches("/driver/location", "/driver/location"));
        assert!(topic_matches("/driver/+", "/driver/offer"));
        assert!(topic_matches("/driver/#", "/driver/ride/extra"));
        assert!(!topic_matches("/driver/offer", "/driver/ride"));
        assert!(!topic_matches("/driver/+", "/driver/ride/extra"));
    }
}
