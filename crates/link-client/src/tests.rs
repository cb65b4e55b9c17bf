// End-to-end link scenarios over the loopback broker, on paused time.
use super::*;
use crate::client::liveness::LivenessEvent;
use crate::config::{PublishTopic, SubscribeTopic, TOPIC_LOCATION, TOPIC_OFFER, TOPIC_RIDE};
use link_transport::{LoopbackBroker, QoS, Transport};
use link_wire::PayloadHeader;
use std::sync::Arc;
use tokio::time::{Duration, Instant, sleep};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn agent_config(period: Duration) -> LinkConfig {
    let mut config = LinkConfig::defaults_for(LinkRole::Agent);
    config.publish = vec![PublishTopic {
        topic: TOPIC_LOCATION.to_string(),
        period,
        qos: QoS::AtLeastOnce,
        payload_bytes: 80,
    }];
    config
}

fn transport(broker: &LoopbackBroker, client_id: &str) -> Arc<dyn Transport> {
    Arc::new(broker.transport(client_id))
}

fn published_seqs(broker: &LoopbackBroker, topic: &str) -> Vec<u64> {
    broker
        .journal_for(topic)
        .iter()
        .filter_map(|entry| PayloadHeader::parse(&entry.payload).seq)
        .collect()
}

fn assert_near(actual: Duration, expected_ms: u64) {
    let actual_ms = actual.as_millis() as i64;
    assert!(
        (actual_ms - expected_ms as i64).abs() <= 50,
        "expected ~{expected_ms}ms, got {actual_ms}ms"
    );
}

#[tokio::test(start_paused = true)]
async fn steady_link_acknowledges_every_publish() {
    init_tracing();
    let broker = LoopbackBroker::new();
    let runtime = LinkRuntime::start(
        agent_config(Duration::from_millis(100)),
        transport(&broker, "agent"),
    )
    .await
    .expect("start");

    sleep(Duration::from_millis(950)).await;
    let snapshot = runtime.shutdown().await.expect("shutdown");

    let location = snapshot.counters.topic(TOPIC_LOCATION).expect("topic");
    assert!((10..=11).contains(&location.published), "published {}", location.published);
    assert_eq!(location.acknowledged, location.published);
    assert_eq!(location.failed, 0);
    assert_eq!(snapshot.inflight, 0);
    let defaults = LinkConfig::defaults_for(LinkRole::Agent);
    assert_eq!(snapshot.max_inflight, defaults.buffer.max_inflight);
    let seqs = published_seqs(&broker, TOPIC_LOCATION);
    assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());
    assert_eq!(broker.journal().len(), seqs.len());
}

#[tokio::test(start_paused = true)]
async fn blackout_retries_on_backoff_schedule_and_resubscribes() {
    init_tracing();
    let broker = LoopbackBroker::new();
    let mut config = agent_config(Duration::from_millis(1_000));
    config.retry.base_reconnect_interval = Duration::from_secs(1);
    config.retry.max_reconnect_interval = Duration::from_secs(10);
    let runtime = LinkRuntime::start(config, transport(&broker, "agent"))
        .await
        .expect("start");
    assert_eq!(broker.subscriptions_of("agent"), vec![TOPIC_OFFER, TOPIC_RIDE]);

    // The session outlives one base interval, so the first retry is immediate.
    sleep(Duration::from_millis(1_500)).await;
    let lost_at = Instant::now();
    broker.set_reachable(false);
    sleep(Duration::from_millis(2_500)).await;
    assert_eq!(runtime.connection().state(), ConnectionState::Reconnecting);
    assert!(broker.subscriptions_of("agent").is_empty());
    broker.set_reachable(true);
    sleep(Duration::from_secs(10)).await;

    let attempts = broker.connect_attempts();
    assert_eq!(attempts.len(), 4, "initial connect plus three reconnect attempts");
    assert_near(attempts[1].duration_since(lost_at), 0);
    assert_near(attempts[2].duration_since(lost_at), 1_000);
    assert_near(attempts[3].duration_since(lost_at), 3_000);
    assert!(runtime.connection().is_connected());
    assert_eq!(broker.subscriptions_of("agent"), vec![TOPIC_OFFER, TOPIC_RIDE]);

    runtime.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn buffered_backlog_flushes_newest_in_order() {
    init_tracing();
    let broker = LoopbackBroker::new();
    broker.set_reachable(false);
    let mut config = agent_config(Duration::from_millis(200));
    config.buffer.capacity = 3;
    config.buffer.drop_oldest = true;
    config.retry.base_reconnect_interval = Duration::from_millis(900);
    let runtime = LinkRuntime::start(config, transport(&broker, "agent"))
        .await
        .expect("start with broker down");

    // Ticks at 0, 200, 400, 600 and 800 ms all land in the buffer.
    sleep(Duration::from_millis(850)).await;
    let backlog = runtime.snapshot();
    assert_eq!(backlog.buffered, 3);
    assert_eq!(backlog.buffer_capacity, 3);
    broker.set_reachable(true);
    sleep(Duration::from_millis(100)).await;

    let seqs = published_seqs(&broker, TOPIC_LOCATION);
    assert_eq!(seqs, vec![3, 4, 5]);
    let snapshot = runtime.shutdown().await.expect("shutdown");
    let location = snapshot.counters.topic(TOPIC_LOCATION).expect("topic");
    assert_eq!(location.dropped, 2);
    assert_eq!(location.acknowledged, location.published);
}

#[tokio::test(start_paused = true)]
async fn loss_is_fatal_without_auto_reconnect() {
    init_tracing();
    let broker = LoopbackBroker::new();
    let mut config = agent_config(Duration::from_millis(500));
    config.retry.auto_reconnect = false;
    let mut runtime = LinkRuntime::start(config, transport(&broker, "agent"))
        .await
        .expect("start");

    sleep(Duration::from_millis(100)).await;
    broker.drop_connections("broker restarted");
    let err = runtime.terminated().await;
    assert!(matches!(err, LinkError::ConnectionLost { .. }), "got {err}");
    assert_eq!(runtime.connection().state(), ConnectionState::Disconnected);
    runtime.shutdown().await.expect("shutdown after fatal loss");
    assert_eq!(broker.connect_attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn initial_connect_failure_is_fatal_without_auto_reconnect() {
    let broker = LoopbackBroker::new();
    broker.set_reachable(false);
    let mut config = agent_config(Duration::from_millis(500));
    config.retry.auto_reconnect = false;
    let result = LinkRuntime::start(config, transport(&broker, "agent")).await;
    assert!(matches!(result, Err(LinkError::Connect(_))));
}

#[tokio::test]
async fn invalid_config_is_rejected_before_connecting() {
    let broker = LoopbackBroker::new();
    let mut config = agent_config(Duration::from_millis(500));
    config.buffer.max_inflight = 0;
    let result = LinkRuntime::start(config, transport(&broker, "agent")).await;
    assert!(matches!(result, Err(LinkError::Config(_))));
    assert!(broker.connect_attempts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn agent_and_backend_exchange_telemetry() {
    init_tracing();
    let broker = LoopbackBroker::new();
    let agent = LinkRuntime::start(
        LinkConfig::defaults_for(LinkRole::Agent),
        transport(&broker, "agent"),
    )
    .await
    .expect("agent");
    let backend = LinkRuntime::start(
        LinkConfig::defaults_for(LinkRole::Backend),
        transport(&broker, "backend"),
    )
    .await
    .expect("backend");
    let mut backend_receipts = backend.receipts();

    sleep(Duration::from_millis(4_500)).await;

    let receipt = backend_receipts.recv().await.expect("receipt");
    assert_eq!(receipt.topic, TOPIC_LOCATION);
    assert!(receipt.seq.is_some());
    assert!(receipt.latency_ms.is_some());

    let agent_stats = agent.shutdown().await.expect("agent shutdown");
    let backend_stats = backend.shutdown().await.expect("backend shutdown");
    let offers = agent_stats.counters.topic(TOPIC_OFFER).expect("offer");
    let rides = agent_stats.counters.topic(TOPIC_RIDE).expect("ride");
    assert!(offers.received >= 4, "offers {}", offers.received);
    assert!(rides.received >= 2, "rides {}", rides.received);
    let locations = backend_stats.counters.topic(TOPIC_LOCATION).expect("location");
    assert!(locations.received >= 4, "locations {}", locations.received);
    assert_eq!(agent_stats.counters.unmatched, 0);
}

#[tokio::test(start_paused = true)]
async fn backend_skips_ticks_while_disconnected() {
    init_tracing();
    let broker = LoopbackBroker::new();
    let mut config = LinkConfig::defaults_for(LinkRole::Backend);
    config.publish.truncate(1);
    config.retry.base_reconnect_interval = Duration::from_secs(5);
    config.retry.max_reconnect_interval = Duration::from_secs(5);
    let runtime = LinkRuntime::start(config, transport(&broker, "backend"))
        .await
        .expect("start");

    sleep(Duration::from_millis(500)).await;
    broker.set_reachable(false);
    sleep(Duration::from_millis(2_000)).await;
    broker.set_reachable(true);
    sleep(Duration::from_millis(4_000)).await;

    let snapshot = runtime.shutdown().await.expect("shutdown");
    let offers = snapshot.counters.topic(TOPIC_OFFER).expect("offer");
    assert_eq!(offers.dropped, 0);
    // Skipped ticks consume no sequence numbers.
    let seqs = published_seqs(&broker, TOPIC_OFFER);
    assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());
    assert_eq!(offers.published, seqs.len() as u64);
}

#[tokio::test(start_paused = true)]
async fn liveness_reports_each_edge_once() {
    init_tracing();
    let broker = LoopbackBroker::new();
    let mut config = agent_config(Duration::from_millis(1_000));
    config.retry.base_reconnect_interval = Duration::from_secs(2);
    let runtime = LinkRuntime::start(config, transport(&broker, "agent"))
        .await
        .expect("start");
    let mut events = runtime.liveness_events();

    sleep(Duration::from_millis(2_200)).await;
    broker.set_reachable(false);
    sleep(Duration::from_millis(3_000)).await;
    broker.set_reachable(true);
    sleep(Duration::from_millis(6_000)).await;

    assert_eq!(events.try_recv().expect("dead"), LivenessEvent::Dead);
    assert_eq!(events.try_recv().expect("alive"), LivenessEvent::Alive);
    assert!(events.try_recv().is_err());
    runtime.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_publishes_fail_after_write_timeout() {
    init_tracing();
    let broker = LoopbackBroker::new();
    let mut config = agent_config(Duration::from_millis(1_000));
    config.retry.write_timeout = Duration::from_millis(300);
    config.subscribe = vec![SubscribeTopic {
        topic: TOPIC_OFFER.to_string(),
        qos: QoS::AtMostOnce,
    }];
    let runtime = LinkRuntime::start(config, transport(&broker, "agent"))
        .await
        .expect("start");
    broker.set_drop_acks(true);

    sleep(Duration::from_millis(2_500)).await;
    let snapshot = runtime.shutdown().await.expect("shutdown");
    let location = snapshot.counters.topic(TOPIC_LOCATION).expect("topic");
    assert_eq!(location.acknowledged, 0);
    assert_eq!(location.timed_out, location.published);
    assert_eq!(location.failed, location.published);
    assert_eq!(snapshot.inflight, 0);
}
