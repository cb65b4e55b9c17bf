// MQTT 3.1.1 transport on rumqttc. Each successful connect owns a fresh event loop
// driven by one task until the session ends.
use async_trait::async_trait;
use bytes::Bytes;
use link_transport::{
    DeliveryToken, EVENT_CHANNEL_CAPACITY, INBOUND_CHANNEL_CAPACITY, InboundMessage, QoS, Result,
    TokenId, Transport, TransportError, TransportEvent,
};
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Outgoing, Packet, Publish,
    SubscribeReasonCode,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

mod options;
mod pending;

pub use options::{MqttSettings, REQUEST_CHANNEL_CAPACITY};

use options::{from_mqtt_qos, to_mqtt_qos};
use pending::PendingTable;

/// Transport handle over a real broker. Reconnection is left to the caller: after a
/// `ConnectionLost` event the handle stays closed until `connect` succeeds again.
pub struct MqttTransport {
    inner: Arc<Inner>,
}

struct Inner {
    settings: MqttSettings,
    client: Mutex<Option<AsyncClient>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    session: AtomicU64,
    open: AtomicBool,
    closing: AtomicBool,
    pending: Mutex<PendingTable>,
    // Keeps pending-table order identical to request-channel order.
    submit: tokio::sync::Mutex<()>,
    next_token: AtomicU64,
    events: broadcast::Sender<TransportEvent>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
}

impl MqttTransport {
    pub fn new(settings: MqttSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                settings,
                client: Mutex::new(None),
                driver: Mutex::new(None),
                session: AtomicU64::new(0),
                open: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                pending: Mutex::new(PendingTable::default()),
                submit: tokio::sync::Mutex::new(()),
                next_token: AtomicU64::new(1),
                events,
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
            }),
        }
    }

    /// Publishes written but not yet acknowledged by the broker.
    pub fn pending_deliveries(&self) -> usize {
        self.inner.pending.lock().inflight()
    }

    fn open_client(&self) -> Result<AsyncClient> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        self.inner
            .client
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, timeout: Duration) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let settings = &self.inner.settings;
        let session = self.inner.session.fetch_add(1, Ordering::SeqCst) + 1;
        let (client, mut eventloop) =
            AsyncClient::new(settings.mqtt_options(), REQUEST_CHANNEL_CAPACITY);
        eventloop.set_network_options(settings.network_options(timeout));

        match tokio::time::timeout(timeout, await_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(TransportError::ConnectTimeout(timeout)),
        }

        self.inner.closing.store(false, Ordering::SeqCst);
        *self.inner.client.lock() = Some(client);
        self.inner.open.store(true, Ordering::SeqCst);
        let driver = tokio::spawn(drive(Arc::clone(&self.inner), eventloop, session));
        if let Some(stale) = self.inner.driver.lock().replace(driver) {
            stale.abort();
        }
        info!(
            host = %settings.host,
            port = settings.port,
            client_id = %settings.client_id,
            session,
            "mqtt session established"
        );
        let _ = self.inner.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: Bytes,
        retain: bool,
    ) -> Result<DeliveryToken> {
        let _submit = self.inner.submit.lock().await;
        let client = self.open_client()?;
        let id = TokenId(self.inner.next_token.fetch_add(1, Ordering::Relaxed));
        let (token, completer) = DeliveryToken::pending(id);
        self.inner.pending.lock().submit_publish(qos, completer);
        if let Err(err) = client
            .publish_bytes(topic, to_mqtt_qos(qos), retain, payload)
            .await
        {
            self.inner.pending.lock().withdraw_publish();
            if !self.is_open() {
                return Err(TransportError::NotConnected);
            }
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            });
        }
        Ok(token)
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        let (reply, confirmed) = oneshot::channel();
        {
            let _submit = self.inner.submit.lock().await;
            let client = self.open_client()?;
            self.inner
                .pending
                .lock()
                .submit_subscribe(topic.to_string(), reply);
            if let Err(err) = client.subscribe(topic, to_mqtt_qos(qos)).await {
                self.inner.pending.lock().withdraw_subscribe();
                return Err(TransportError::Subscribe {
                    topic: topic.to_string(),
                    reason: err.to_string(),
                });
            }
        }
        let wait = self.inner.settings.request_timeout;
        match tokio::time::timeout(wait, confirmed).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: format!("no SUBACK within {wait:?}"),
            }),
        }
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    async fn disconnect(&self, grace: Duration) -> Result<()> {
        self.inner.closing.store(true, Ordering::SeqCst);
        let client = self.inner.client.lock().take();
        let driver = self.inner.driver.lock().take();
        let mut outcome = Ok(());
        if let Some(client) = client
            && let Err(err) = client.disconnect().await
        {
            outcome = Err(TransportError::Disconnect(err.to_string()));
        }
        if let Some(mut driver) = driver
            && tokio::time::timeout(grace, &mut driver).await.is_err()
        {
            warn!(grace_ms = grace.as_millis() as u64, "mqtt session did not close in time");
            driver.abort();
        }
        self.inner.open.store(false, Ordering::SeqCst);
        self.inner.pending.lock().fail_all("disconnected");
        outcome
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inner.inbound_rx.lock().take()
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(TransportError::Connect(format!("refused: {:?}", ack.code)));
            }
            Ok(_) => {}
            Err(err) => return Err(TransportError::Connect(err.to_string())),
        }
    }
}

async fn drive(inner: Arc<Inner>, mut eventloop: EventLoop, session: u64) {
    let watchdog = (!inner.settings.keepalive.is_zero()).then(|| inner.settings.watchdog_window());
    let mut last_incoming = Instant::now();
    let cause = loop {
        let polled = match watchdog {
            Some(window) => {
                match tokio::time::timeout_at(last_incoming + window, eventloop.poll()).await {
                    Ok(polled) => polled,
                    Err(_) => break Some(format!("no broker traffic for {window:?}")),
                }
            }
            None => eventloop.poll().await,
        };
        match polled {
            Ok(event) => {
                if matches!(event, Event::Incoming(_)) {
                    last_incoming = Instant::now();
                }
                if inner.handle(event) {
                    break None;
                }
            }
            Err(err) => break Some(err.to_string()),
        }
    };
    inner.end_session(session, cause);
}

impl Inner {
    /// Returns true once our DISCONNECT has been written.
    fn handle(&self, event: Event) -> bool {
        match event {
            Event::Incoming(Packet::Publish(publish)) => self.deliver(publish),
            Event::Incoming(Packet::PubAck(ack)) => {
                self.pending.lock().publish_acked(ack.pkid);
            }
            Event::Incoming(Packet::PubComp(comp)) => {
                self.pending.lock().publish_acked(comp.pkid);
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let granted = ack
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
                self.pending.lock().subscribe_acked(ack.pkid, granted);
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => self.pending.lock().publish_sent(pkid),
            Event::Outgoing(Outgoing::Subscribe(pkid)) => self.pending.lock().subscribe_sent(pkid),
            Event::Outgoing(Outgoing::Disconnect) => return true,
            _ => {}
        }
        false
    }

    fn deliver(&self, publish: Publish) {
        let message = InboundMessage {
            topic: publish.topic,
            qos: from_mqtt_qos(publish.qos),
            payload: publish.payload,
        };
        match self.inbound_tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(topic = %message.topic, "inbound queue full; dropping message")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn end_session(&self, session: u64, cause: Option<String>) {
        if self.session.load(Ordering::SeqCst) != session {
            return;
        }
        let was_open = self.open.swap(false, Ordering::SeqCst);
        self.client.lock().take();
        let reason = cause.as_deref().unwrap_or("disconnected");
        self.pending.lock().fail_all(reason);
        match cause {
            Some(cause) if was_open && !self.closing.load(Ordering::SeqCst) => {
                warn!(session, cause = %cause, "mqtt connection lost");
                let _ = self.events.send(TransportEvent::ConnectionLost { cause });
            }
            _ => debug!(session, "mqtt session closed"),
        }
    }
}
