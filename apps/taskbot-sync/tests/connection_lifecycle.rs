use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use taskbot_proto::{Envelope, Message, NotificationPayload, Topic};
use taskbot_sync::connection::{
    ConnectionHandle, ConnectionState, DriverSettings, NullSink, QueueStats,
};
use taskbot_sync::error::SyncError;
use taskbot_sync::transport::mock::{ConnectOutcome, MockConnector, MockPeer};
use taskbot_sync::transport::{Connector, Transport, TransportError};
use tokio::time::{Instant, sleep, timeout};
use url::Url;

fn url() -> Url {
    Url::parse("ws://127.0.0.1:8787/ws").unwrap()
}

fn quiet_settings() -> DriverSettings {
    DriverSettings {
        heartbeat_interval: Duration::ZERO,
        ..DriverSettings::default()
    }
}

fn spawn(connector: &Arc<MockConnector>, settings: DriverSettings) -> ConnectionHandle {
    ConnectionHandle::spawn(connector.clone(), settings, Arc::new(NullSink)).0
}

async fn connected(settings: DriverSettings) -> (Arc<MockConnector>, ConnectionHandle, MockPeer) {
    let connector = Arc::new(MockConnector::new());
    let handle = spawn(&connector, settings);
    handle.connect(url(), None).await.unwrap();
    let peer = connector.next_peer().await;
    (connector, handle, peer)
}

fn note(body: &str) -> Message {
    Message::Notification(NotificationPayload {
        title: None,
        message: body.to_string(),
        level: None,
        data: Value::Null,
    })
}

fn notes(peer: &MockPeer) -> Vec<String> {
    peer.sent_envelopes()
        .into_iter()
        .filter_map(|envelope| match envelope.message {
            Message::Notification(payload) => Some(payload.message),
            _ => None,
        })
        .collect()
}

fn subscribed(peer: &MockPeer) -> Vec<Topic> {
    peer.sent_envelopes()
        .into_iter()
        .filter_map(|envelope| match envelope.message {
            Message::Subscribe(topic) => Some(topic),
            _ => None,
        })
        .collect()
}

#[test_timeout::tokio_timeout_test]
async fn offline_sends_flush_in_order_before_later_sends() {
    let connector = Arc::new(MockConnector::new());
    let handle = spawn(&connector, quiet_settings());

    for body in ["one", "two", "three"] {
        handle.send(note(body));
    }
    assert_eq!(
        handle.stats().await.unwrap().queue,
        QueueStats {
            pending: 3,
            total_queued: 3
        }
    );

    handle.connect(url(), None).await.unwrap();
    handle.send(note("four"));

    let peer = connector.next_peer().await;
    peer.wait_for_sent(4).await;
    assert_eq!(notes(&peer), ["one", "two", "three", "four"]);
    // Flushed, not forgotten: the running total keeps counting.
    assert_eq!(
        handle.stats().await.unwrap().queue,
        QueueStats {
            pending: 0,
            total_queued: 3
        }
    );
}

#[test_timeout::tokio_timeout_test]
async fn token_is_sent_before_the_queue() {
    let connector = Arc::new(MockConnector::new());
    let handle = spawn(&connector, quiet_settings());
    handle.send(note("queued"));
    handle.connect(url(), Some("secret".into())).await.unwrap();

    let peer = connector.next_peer().await;
    peer.wait_for_sent(2).await;
    let sent = peer.sent_envelopes();
    assert_eq!(
        sent[0].message,
        Message::Authenticate {
            token: "secret".into()
        }
    );
    assert_eq!(sent[1].kind(), "notification");
    // The authenticate frame is correlated; queued frames are not.
    assert!(sent[0].request_id.as_deref().is_some_and(|id| !id.is_empty()));
    assert!(sent[1].request_id.is_none());
}

#[test_timeout::tokio_timeout_test(start_paused)]
async fn every_socket_authenticates_with_a_fresh_request_id() {
    let connector = Arc::new(MockConnector::new());
    let handle = spawn(&connector, quiet_settings());
    handle.connect(url(), Some("secret".into())).await.unwrap();
    let first = connector.next_peer().await;
    first.wait_for_sent(1).await;
    let first_id = first.sent_envelopes()[0].request_id.clone();

    // An echoed reply is accepted and does not disturb the connection.
    first.push(
        &Envelope::new(Message::Authenticated {
            user_id: Some("u-1".into()),
        })
        .with_request_id(first_id.clone().unwrap_or_default()),
    );
    first.drop_connection();

    let second = connector.next_peer().await;
    second.wait_for_sent(1).await;
    let resent = &second.sent_envelopes()[0];
    assert_eq!(
        resent.message,
        Message::Authenticate {
            token: "secret".into()
        }
    );
    assert!(resent.request_id.is_some());
    assert_ne!(resent.request_id, first_id);
    handle.wait_for(ConnectionState::Connected).await.unwrap();
}

#[test_timeout::tokio_timeout_test]
async fn shared_topic_is_on_the_wire_once() {
    let (_connector, handle, peer) = connected(quiet_settings()).await;
    let topic = Topic::task("42");

    handle.subscribe(topic.clone());
    handle.subscribe(topic.clone());
    handle.stats().await.unwrap();
    assert_eq!(subscribed(&peer), [topic.clone()]);

    // First consumer goes away; the wire subscription must stay.
    handle.unsubscribe(topic.clone());
    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.active_topics, [topic.clone()]);
    assert!(!peer.sent_kinds().contains(&"unsubscribe"));

    handle.unsubscribe(topic.clone());
    peer.wait_for_sent(2).await;
    assert_eq!(peer.sent_kinds(), ["subscribe", "unsubscribe"]);
    assert!(handle.stats().await.unwrap().active_topics.is_empty());

    // Extra releases are no-ops.
    handle.unsubscribe(topic);
    handle.stats().await.unwrap();
    assert_eq!(peer.sent().len(), 2);
}

#[test_timeout::tokio_timeout_test]
async fn subscriptions_made_offline_are_sent_once_on_connect() {
    let connector = Arc::new(MockConnector::new());
    let handle = spawn(&connector, quiet_settings());
    handle.subscribe(Topic::task("1"));
    handle.subscribe(Topic::task("1"));
    handle.subscribe(Topic::workspace("9"));
    handle.subscribe(Topic::task("5"));
    handle.unsubscribe(Topic::task("5"));

    handle.connect(url(), None).await.unwrap();
    let peer = connector.next_peer().await;
    handle.stats().await.unwrap();

    let topics: HashSet<Topic> = subscribed(&peer).into_iter().collect();
    assert_eq!(peer.sent_kinds(), ["subscribe", "subscribe"]);
    assert_eq!(
        topics,
        HashSet::from([Topic::task("1"), Topic::workspace("9")])
    );
}

#[test_timeout::tokio_timeout_test(start_paused)]
async fn reconnect_resubscribes_every_active_topic_once() {
    let (connector, handle, peer) = connected(quiet_settings()).await;
    handle.subscribe(Topic::task("1"));
    handle.subscribe(Topic::workspace("9"));
    peer.wait_for_sent(2).await;

    peer.drop_connection();
    let status = handle.wait_for(ConnectionState::Reconnecting).await.unwrap();
    assert_eq!(status.attempt, 1);

    let second = connector.next_peer().await;
    handle.wait_for(ConnectionState::Connected).await.unwrap();
    handle.stats().await.unwrap();

    let topics: HashSet<Topic> = subscribed(&second).into_iter().collect();
    assert_eq!(second.sent_kinds(), ["subscribe", "subscribe"]);
    assert_eq!(
        topics,
        HashSet::from([Topic::task("1"), Topic::workspace("9")])
    );
    assert_eq!(handle.status().attempt, 0);
}

#[test_timeout::tokio_timeout_test(start_paused)]
async fn sends_during_reconnect_are_flushed_after_it() {
    let (connector, handle, peer) = connected(quiet_settings()).await;
    peer.drop_connection();
    handle.wait_for(ConnectionState::Reconnecting).await.unwrap();

    handle.send(note("while-down"));
    let second = connector.next_peer().await;
    second.wait_for_sent(1).await;
    assert_eq!(notes(&second), ["while-down"]);
    assert!(notes(&peer).is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn unknown_and_malformed_frames_are_ignored() {
    let (_connector, handle, peer) = connected(quiet_settings()).await;

    peer.push_raw(r#"{"kind":"future_unknown_kind","payload":{"x":1},"timestamp":"2024-01-01T00:00:00Z"}"#);
    peer.push_raw("this is not json");
    peer.push_raw(r#"{"kind":"task_updated","payload":{"nope":true}}"#);
    // Frames are handled in order, so the pong proves the rest were seen.
    peer.push(&Envelope::new(Message::Ping));
    peer.wait_for_sent(1).await;

    assert_eq!(peer.sent_kinds(), ["pong"]);
    assert_eq!(handle.state(), ConnectionState::Connected);
}

#[test_timeout::tokio_timeout_test]
async fn disconnect_is_idempotent() {
    let connector = Arc::new(MockConnector::new());
    let handle = spawn(&connector, quiet_settings());

    let mut rx = handle.watch();
    handle.disconnect().await;
    assert!(!rx.has_changed().unwrap());

    handle.connect(url(), None).await.unwrap();
    let peer = connector.next_peer().await;
    handle.disconnect().await;
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert!(peer.closed_by_client());

    rx.borrow_and_update();
    handle.disconnect().await;
    handle.disconnect().await;
    assert!(!rx.has_changed().unwrap());
    assert_eq!(handle.state(), ConnectionState::Disconnected);
}

#[test_timeout::tokio_timeout_test]
async fn connect_when_connected_keeps_the_socket() {
    let (connector, handle, peer) = connected(quiet_settings()).await;
    handle.connect(url(), None).await.unwrap();
    assert_eq!(connector.attempts().len(), 1);
    assert!(!peer.closed_by_client());
}

#[test_timeout::tokio_timeout_test]
async fn refused_initial_connect_lands_in_error() {
    let connector = Arc::new(MockConnector::new());
    connector.script([ConnectOutcome::Refuse("connection refused".into())]);
    let handle = spawn(&connector, quiet_settings());

    let err = handle.connect(url(), None).await.unwrap_err();
    assert_eq!(
        err,
        SyncError::Transport(TransportError::Connect("connection refused".into()))
    );
    let status = handle.status();
    assert_eq!(status.state, ConnectionState::Error);
    assert_eq!(status.last_error, Some(err));

    // Error needs an explicit connect; the next one succeeds.
    handle.connect(url(), None).await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Connected);
}

#[test_timeout::tokio_timeout_test(start_paused)]
async fn hanging_open_times_out() {
    let connector = Arc::new(MockConnector::new());
    connector.script([ConnectOutcome::Hang]);
    let settings = DriverSettings {
        connect_timeout: Duration::from_secs(10),
        ..quiet_settings()
    };
    let handle = spawn(&connector, settings);

    let start = Instant::now();
    let err = handle.connect(url(), None).await.unwrap_err();
    assert_eq!(
        err,
        SyncError::Transport(TransportError::Timeout(Duration::from_secs(10)))
    );
    assert!(start.elapsed() >= Duration::from_secs(10));
    assert_eq!(handle.state(), ConnectionState::Error);
}

#[test_timeout::tokio_timeout_test]
async fn rejected_token_is_terminal() {
    let connector = Arc::new(MockConnector::new());
    let handle = spawn(&connector, quiet_settings());
    handle.connect(url(), Some("expired".into())).await.unwrap();
    let peer = connector.next_peer().await;

    peer.push(&Envelope::new(Message::AuthenticationFailed {
        reason: "token expired".into(),
    }));
    peer.wait_for_close().await;
    let status = handle.wait_for(ConnectionState::Error).await.unwrap();
    assert_eq!(
        status.last_error,
        Some(SyncError::AuthenticationRejected("token expired".into()))
    );

    let reconnected = timeout(Duration::from_millis(200), connector.next_peer()).await;
    assert!(reconnected.is_err(), "no automatic retry after rejection");
    assert_eq!(connector.attempts().len(), 1);
}

/// Wraps the mock connector and records when each open was attempted.
struct TimedConnector {
    inner: MockConnector,
    opened_at: Mutex<Vec<Instant>>,
}

#[async_trait]
impl Connector for TimedConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, TransportError> {
        self.opened_at.lock().push(Instant::now());
        self.inner.connect(url).await
    }
}

#[test_timeout::tokio_timeout_test(start_paused)]
async fn backoff_doubles_and_stops_after_five_attempts() {
    let connector = Arc::new(TimedConnector {
        inner: MockConnector::new(),
        opened_at: Mutex::new(Vec::new()),
    });
    let (handle, _driver) =
        ConnectionHandle::spawn(connector.clone(), quiet_settings(), Arc::new(NullSink));
    handle.connect(url(), None).await.unwrap();
    let peer = connector.inner.next_peer().await;

    connector
        .inner
        .script((0..5).map(|n| ConnectOutcome::Refuse(format!("refused {n}"))));
    let dropped_at = Instant::now();
    peer.drop_connection();

    let status = handle.wait_for(ConnectionState::Disconnected).await.unwrap();
    assert_eq!(status.last_error, Some(SyncError::ReconnectExhausted(5)));

    let opened_at = connector.opened_at.lock().clone();
    assert_eq!(opened_at.len(), 6, "initial open plus five retries");

    let mut previous = dropped_at;
    for (at, expected_ms) in opened_at[1..].iter().zip([1_000u64, 2_000, 4_000, 8_000, 16_000]) {
        let gap = at.duration_since(previous);
        let expected = Duration::from_millis(expected_ms);
        assert!(
            gap >= expected && gap < expected + Duration::from_millis(50),
            "expected ~{expected:?}, got {gap:?}"
        );
        previous = *at;
    }

    // No sixth retry, however long we wait.
    sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.opened_at.lock().len(), 6);
    assert_eq!(handle.state(), ConnectionState::Disconnected);
}

#[test_timeout::tokio_timeout_test(start_paused)]
async fn disconnect_cancels_pending_reconnect() {
    let (connector, handle, peer) = connected(quiet_settings()).await;
    peer.drop_connection();
    handle.wait_for(ConnectionState::Reconnecting).await.unwrap();

    handle.disconnect().await;
    sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts().len(), 1);
    assert_eq!(handle.state(), ConnectionState::Disconnected);
}

#[test_timeout::tokio_timeout_test(start_paused)]
async fn connect_during_backoff_retries_immediately() {
    let (connector, handle, peer) = connected(quiet_settings()).await;
    connector.script([ConnectOutcome::Refuse("still down".into())]);
    peer.drop_connection();
    handle.wait_for(ConnectionState::Reconnecting).await.unwrap();
    sleep(Duration::from_millis(1_100)).await;
    assert_eq!(handle.status().attempt, 2);

    let start = Instant::now();
    handle.connect(url(), None).await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(handle.status().attempt, 0);
    assert_eq!(connector.attempts().len(), 3);
}

#[test_timeout::tokio_timeout_test(start_paused)]
async fn pings_on_the_heartbeat_interval() {
    let settings = DriverSettings {
        heartbeat_interval: Duration::from_secs(30),
        ..DriverSettings::default()
    };
    let (_connector, handle, peer) = connected(settings).await;

    let start = Instant::now();
    peer.wait_for_sent(1).await;
    assert!(start.elapsed() >= Duration::from_secs(30));
    assert_eq!(handle.stats().await.unwrap().last_rtt, None);
    peer.push(&Envelope::new(Message::Pong));

    peer.wait_for_sent(2).await;
    assert!(handle.stats().await.unwrap().last_rtt.is_some());
    assert!(start.elapsed() >= Duration::from_secs(60));
    assert_eq!(peer.sent_kinds(), ["ping", "ping"]);
    assert_eq!(handle.state(), ConnectionState::Connected);
}

#[test_timeout::tokio_timeout_test(start_paused)]
async fn missing_pong_forces_a_reconnect_when_enforced() {
    let settings = DriverSettings {
        heartbeat_interval: Duration::from_secs(30),
        pong_timeout: Some(Duration::from_secs(10)),
        ..DriverSettings::default()
    };
    let (connector, handle, peer) = connected(settings).await;
    let start = Instant::now();

    let second = connector.next_peer().await;
    assert!(start.elapsed() >= Duration::from_secs(41));
    assert!(peer.closed_by_client());
    assert_eq!(peer.sent_kinds(), ["ping"]);
    assert!(!second.closed_by_client());
    handle.wait_for(ConnectionState::Connected).await.unwrap();
}

#[test_timeout::tokio_timeout_test(start_paused)]
async fn unanswered_pings_are_harmless_without_a_timeout() {
    let settings = DriverSettings {
        heartbeat_interval: Duration::from_secs(30),
        pong_timeout: None,
        ..DriverSettings::default()
    };
    let (connector, handle, peer) = connected(settings).await;

    peer.wait_for_sent(3).await;
    assert_eq!(handle.state(), ConnectionState::Connected);
    assert_eq!(connector.attempts().len(), 1);
}
