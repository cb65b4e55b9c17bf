// Correlates submitted requests with the packet ids rumqttc assigns on the wire.
use link_transport::{DeliveryCompleter, QoS, TransportError};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

pub(crate) type SubscribeReply = oneshot::Sender<Result<(), TransportError>>;

/// Requests are queued in submission order; rumqttc reports them as outgoing in the
/// same order, which is when the packet id becomes known.
#[derive(Default)]
pub(crate) struct PendingTable {
    publishes: VecDeque<(QoS, DeliveryCompleter)>,
    unacked: HashMap<u16, DeliveryCompleter>,
    subscribes: VecDeque<(String, SubscribeReply)>,
    unconfirmed: HashMap<u16, (String, SubscribeReply)>,
}

impl PendingTable {
    pub(crate) fn submit_publish(&mut self, qos: QoS, completer: DeliveryCompleter) {
        self.publishes.push_back((qos, completer));
    }

    /// Undo the latest submission when the client refused it.
    pub(crate) fn withdraw_publish(&mut self) -> Option<DeliveryCompleter> {
        self.publishes.pop_back().map(|(_, completer)| completer)
    }

    /// QoS 0 completes on write; higher levels wait for PUBACK/PUBCOMP.
    pub(crate) fn publish_sent(&mut self, pkid: u16) {
        let Some((qos, completer)) = self.publishes.pop_front() else {
            return;
        };
        if qos.expects_ack() {
            self.unacked.insert(pkid, completer);
        } else {
            completer.ack();
        }
    }

    pub(crate) fn publish_acked(&mut self, pkid: u16) -> bool {
        match self.unacked.remove(&pkid) {
            Some(completer) => {
                completer.ack();
                true
            }
            None => false,
        }
    }

    pub(crate) fn submit_subscribe(&mut self, topic: String, reply: SubscribeReply) {
        self.subscribes.push_back((topic, reply));
    }

    pub(crate) fn withdraw_subscribe(&mut self) {
        self.subscribes.pop_back();
    }

    pub(crate) fn subscribe_sent(&mut self, pkid: u16) {
        if let Some(entry) = self.subscribes.pop_front() {
            self.unconfirmed.insert(pkid, entry);
        }
    }

    /// `granted` is false when the broker answered with a failure return code.
    pub(crate) fn subscribe_acked(&mut self, pkid: u16, granted: bool) {
        let Some((topic, reply)) = self.unconfirmed.remove(&pkid) else {
            return;
        };
        let result = if granted {
            Ok(())
        } else {
            Err(TransportError::Subscribe {
                topic,
                reason: "rejected by broker".to_string(),
            })
        };
        let _ = reply.send(result);
    }

    pub(crate) fn inflight(&self) -> usize {
        self.publishes.len() + self.unacked.len()
    }

    /// Fail everything still waiting; used when the session ends.
    pub(crate) fn fail_all(&mut self, reason: &str) {
        for (_, completer) in self.publishes.drain(..) {
            completer.fail(reason);
        }
        for (_, completer) in self.unacked.drain() {
            completer.fail(reason);
        }
        for (_, reply) in self.subscribes.drain(..).chain(self.unconfirmed.drain().map(|(_, e)| e)) {
            let _ = reply.send(Err(TransportError::NotConnected));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use link_transport::{DeliveryOutcome, DeliveryToken, TokenId};

    #[tokio::test]
    async fn qos0_completes_when_written() {
        let mut table = PendingTable::default();
        let (token, completer) = DeliveryToken::pending(TokenId(1));
        table.submit_publish(QoS::AtMostOnce, completer);
        table.publish_sent(0);
        assert_eq!(table.inflight(), 0);
        assert_eq!(token.wait().await, DeliveryOutcome::Acked);
    }

    #[tokio::test]
    async fn acks_resolve_by_packet_id() {
        let mut table = PendingTable::default();
        let (first, first_completer) = DeliveryToken::pending(TokenId(1));
        let (second, second_completer) = DeliveryToken::pending(TokenId(2));
        table.submit_publish(QoS::AtLeastOnce, first_completer);
        table.submit_publish(QoS::ExactlyOnce, second_completer);
        table.publish_sent(7);
        table.publish_sent(8);
        assert_eq!(table.inflight(), 2);

        assert!(table.publish_acked(8));
        assert!(!table.publish_acked(8));
        assert_eq!(second.wait().await, DeliveryOutcome::Acked);

        table.fail_all("connection lost");
        assert_eq!(
            first.wait().await,
            DeliveryOutcome::Failed("connection lost".to_string())
        );
    }

    #[tokio::test]
    async fn withdrawn_publish_is_not_matched() {
        let mut table = PendingTable::default();
        let (_token, completer) = DeliveryToken::pending(TokenId(1));
        table.submit_publish(QoS::AtLeastOnce, completer);
        assert!(table.withdraw_publish().is_some());
        table.publish_sent(3);
        assert_eq!(table.inflight(), 0);
    }

    #[tokio::test]
    async fn rejected_subscription_reports_topic() {
        let mut table = PendingTable::default();
        let (tx, rx) = oneshot::channel();
        table.submit_subscribe("/driver/offer".to_string(), tx);
        table.subscribe_sent(4);
        table.subscribe_acked(4, false);
        let result = rx.await.expect("reply");
        assert!(matches!(
            result,
            Err(TransportError::Subscribe { topic, .. }) if topic == "/driver/offer"
        ));
    }
}
