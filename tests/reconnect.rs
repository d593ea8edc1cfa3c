mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ctrader_connector_rs::auth::SessionState;
use ctrader_connector_rs::error::CTraderError;
use ctrader_connector_rs::hooks::SessionEvent;
use ctrader_connector_rs::session::CTraderSession;
use ctrader_connector_rs::types::payload_type;

use common::StubBroker;

async fn wait_for_event(
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    timeout: Duration,
    mut matcher: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for session event");
        let event = tokio::time::timeout(remaining, events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event bus closed");
        if matcher(&event) {
            return event;
        }
    }
}

/// Transport loss fails in-flight requests, the supervisor reconnects and
/// re-auths, live tick subscriptions are rearmed, and both iterators keep
/// yielding without ever ending.
#[tokio::test]
async fn test_reconnect_keeps_streams_alive() {
    common::setup();
    let broker = StubBroker::start().await;
    let session = Arc::new(CTraderSession::new(broker.session_config()).unwrap());
    session.connect().await.unwrap();
    let mut events = session.events();

    let mut eur = session.subscribe_ticks(1, "EURUSD").await.unwrap();
    let mut jpy = session.subscribe_ticks(2, "USDJPY").await.unwrap();
    assert_eq!(broker.received_count(payload_type::SUBSCRIBE_SPOTS_REQ), 2);

    // Ticks flow on the first connection.
    broker.push(common::spot_push(1, 110_000, 110_020));
    broker.push(common::spot_push(2, 15_000_000, 15_001_000));
    tokio::time::timeout(Duration::from_secs(2), eur.next())
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), jpy.next())
        .await
        .unwrap()
        .unwrap();

    // Park a request the stub never answers, then cut the connection.
    broker.behavior.swallow(payload_type::RECONCILE_REQ);
    let in_flight = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            session
                .send_request(
                    payload_type::RECONCILE_REQ,
                    Bytes::new(),
                    Some(Duration::from_secs(10)),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    broker.behavior.swallow_types.lock().unwrap().clear();
    broker.kill_connections();

    let lost = in_flight.await.unwrap();
    assert!(matches!(lost, Err(CTraderError::TransportLost { .. })));

    wait_for_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SessionEvent::ReconnectAttempt { .. })
    })
    .await;
    wait_for_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SessionEvent::ReconnectSuccess { .. })
    })
    .await;

    assert_eq!(session.state(), SessionState::Ready);
    assert!(broker.connection_count() >= 2);
    // Both subscriptions were rearmed on the fresh connection.
    common::wait_for("subscriptions rearmed", Duration::from_secs(2), || {
        broker.received_count(payload_type::SUBSCRIBE_SPOTS_REQ) >= 4
    })
    .await;
    // Refresh-only recovery re-fetched the model.
    assert!(broker.received_count(payload_type::SYMBOLS_LIST_REQ) >= 1);
    assert!(broker.received_count(payload_type::TRADER_REQ) >= 1);
    assert!(broker.received_count(payload_type::RECONCILE_REQ) >= 1);

    // Ticks flow again on both iterators; neither saw end-of-stream.
    broker.push(common::spot_push(1, 110_100, 110_120));
    broker.push(common::spot_push(2, 15_002_000, 15_003_000));
    let eur_tick = tokio::time::timeout(Duration::from_secs(2), eur.next())
        .await
        .unwrap()
        .unwrap();
    assert!((eur_tick.bid.unwrap() - 1.101).abs() < 1e-9);
    tokio::time::timeout(Duration::from_secs(2), jpy.next())
        .await
        .unwrap()
        .unwrap();

    let metrics = session.metrics();
    assert!(metrics.reconnect_attempts >= 1);
    assert_eq!(metrics.reconnect_successes, 1);

    session.disconnect().await;
}

/// A non-retriable rejection during the initial connect latches `Fatal`.
#[tokio::test]
async fn test_fatal_auth_on_connect() {
    common::setup();
    let broker = StubBroker::start().await;
    broker
        .behavior
        .fail_app_auth
        .store(true, std::sync::atomic::Ordering::Release);

    let session = CTraderSession::new(broker.session_config()).unwrap();
    let result = session.connect().await;
    assert!(matches!(result, Err(CTraderError::AuthFailed(_))));
    assert_eq!(session.state(), SessionState::Fatal);

    // A fatal session refuses new work with AuthFailed.
    let refused = session
        .send_request(payload_type::TRADER_REQ, Bytes::new(), None)
        .await;
    assert!(matches!(refused, Err(CTraderError::AuthFailed(_))));
}

/// A non-retriable rejection during re-auth moves the session to `Fatal`,
/// ends every stream, and emits the fatal reconnect event.
#[tokio::test]
async fn test_fatal_auth_during_reconnect() {
    common::setup();
    let broker = StubBroker::start().await;
    let session = CTraderSession::new(broker.session_config()).unwrap();
    session.connect().await.unwrap();
    let mut events = session.events();

    let mut ticks = session.subscribe_ticks(1, "EURUSD").await.unwrap();

    broker
        .behavior
        .fail_account_auth
        .store(true, std::sync::atomic::Ordering::Release);
    broker.kill_connections();

    wait_for_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SessionEvent::ReconnectFatal { .. })
    })
    .await;
    assert_eq!(session.state(), SessionState::Fatal);

    // Streams end with end-of-stream rather than an error.
    let ended = tokio::time::timeout(Duration::from_secs(2), ticks.next())
        .await
        .unwrap();
    assert!(ended.is_none());

    let refused = session
        .send_request(payload_type::TRADER_REQ, Bytes::new(), None)
        .await;
    assert!(matches!(refused, Err(CTraderError::AuthFailed(_))));
}

/// With reconnection disabled, transport loss leaves the session
/// disconnected and ends streams.
#[tokio::test]
async fn test_reconnect_disabled_stays_down() {
    common::setup();
    let broker = StubBroker::start().await;
    let mut config = broker.session_config();
    config.reconnect_enabled = false;
    let session = CTraderSession::new(config).unwrap();
    session.connect().await.unwrap();

    let mut ticks = session.subscribe_ticks(1, "EURUSD").await.unwrap();
    broker.kill_connections();

    common::wait_for("session disconnected", Duration::from_secs(3), || {
        session.state() == SessionState::Disconnected
    })
    .await;
    let ended = tokio::time::timeout(Duration::from_secs(2), ticks.next())
        .await
        .unwrap();
    assert!(ended.is_none());
    assert_eq!(broker.connection_count(), 1);
}

/// The refresh boundary events bracket the re-fetched model slices.
#[tokio::test]
async fn test_model_refresh_boundary_events() {
    common::setup();
    let broker = StubBroker::start().await;
    let session = CTraderSession::new(broker.session_config()).unwrap();
    session.connect().await.unwrap();
    let mut events = session.events();

    broker.kill_connections();

    wait_for_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SessionEvent::ModelRefreshStart)
    })
    .await;
    let mut refreshed = 0;
    loop {
        let event = wait_for_event(&mut events, Duration::from_secs(5), |e| {
            matches!(
                e,
                SessionEvent::ModelRefreshed { .. } | SessionEvent::ModelRefreshEnd
            )
        })
        .await;
        match event {
            SessionEvent::ModelRefreshed { .. } => refreshed += 1,
            SessionEvent::ModelRefreshEnd => break,
            _ => unreachable!(),
        }
    }
    assert_eq!(refreshed, 3);

    session.disconnect().await;
}
