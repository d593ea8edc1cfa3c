mod common;

use std::time::{Duration, Instant};

use bytes::Bytes;
use ctrader_connector_rs::error::CTraderError;
use ctrader_connector_rs::session::CTraderSession;
use ctrader_connector_rs::types::payload_type;

use common::StubBroker;

/// Happy path: a correlated request resolves with the response payload and
/// the request/response counters move.
#[tokio::test]
async fn test_request_response_happy_path() {
    common::setup();
    let broker = StubBroker::start().await;
    let session = CTraderSession::new(broker.session_config()).unwrap();
    session.connect().await.unwrap();

    let started = Instant::now();
    let payload = session
        .send_request(
            payload_type::APPLICATION_AUTH_REQ,
            Bytes::new(),
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    assert_eq!(&payload[..], b"\x01");
    assert!(started.elapsed() < Duration::from_secs(1));

    let metrics = session.metrics();
    assert_eq!(metrics.requests_sent, 1);
    assert_eq!(metrics.responses_received, 1);
    assert_eq!(metrics.latency_count, 1);
    assert!(metrics.latency_min.is_some());

    session.disconnect().await;
}

/// A swallowed request resolves with `Timeout` close to its deadline and
/// leaves no correlator entry behind.
#[tokio::test]
async fn test_request_timeout_cleans_up() {
    common::setup();
    let broker = StubBroker::start().await;
    broker.behavior.swallow(payload_type::TRADER_REQ);

    let session = CTraderSession::new(broker.session_config()).unwrap();
    session.connect().await.unwrap();

    let started = Instant::now();
    let result = session
        .send_request(
            payload_type::TRADER_REQ,
            Bytes::new(),
            Some(Duration::from_millis(100)),
        )
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(CTraderError::Timeout { .. })));
    // Deadline plus at most one housekeeping tick, with scheduling slack.
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(600));
    assert_eq!(session.pending_requests(), 0);
    assert_eq!(session.metrics().request_timeouts, 1);

    session.disconnect().await;
}

/// Cancelling (dropping) a request that is still queued behind the rate
/// limiter removes it before the wire: no bytes leave the socket.
#[tokio::test]
async fn test_cancellation_before_dispatch() {
    common::setup();
    let broker = StubBroker::start().await;
    let mut config = broker.session_config();
    config.rate_limit_per_second = 1;
    let session = std::sync::Arc::new(CTraderSession::new(config).unwrap());
    session.connect().await.unwrap();

    // Drain the bucket with a request that completes normally.
    session
        .send_request(
            payload_type::TRADER_REQ,
            Bytes::new(),
            Some(Duration::from_secs(3)),
        )
        .await
        .unwrap();

    let before = session.metrics();

    // This one sits in the queue waiting for a token; cancel it there.
    let pending = {
        let session = std::sync::Arc::clone(&session);
        tokio::spawn(async move {
            session
                .send_request(
                    payload_type::RECONCILE_REQ,
                    Bytes::new(),
                    Some(Duration::from_secs(5)),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    pending.abort();
    let _ = pending.await;

    common::wait_for("cancellation recorded", Duration::from_secs(1), || {
        session.metrics().requests_cancelled == 1
    })
    .await;
    assert_eq!(session.pending_requests(), 0);

    // Give the writer time to reach the cancelled frame and discard it.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let after = session.metrics();
    assert_eq!(after.frames_sent, before.frames_sent);
    assert_eq!(after.bytes_sent, before.bytes_sent);
    assert_eq!(broker.received_count(payload_type::RECONCILE_REQ), 0);

    session.disconnect().await;
}

/// A generic error response surfaces as `Remote` with code and description
/// and does not tear the connection.
#[tokio::test]
async fn test_remote_error_is_per_request() {
    common::setup();
    let broker = StubBroker::start().await;
    broker.behavior.reply_error(payload_type::TRADER_REQ);

    let session = CTraderSession::new(broker.session_config()).unwrap();
    session.connect().await.unwrap();

    let result = session
        .send_request(payload_type::TRADER_REQ, Bytes::new(), None)
        .await;
    match result {
        Err(CTraderError::Remote {
            code, description, ..
        }) => {
            assert_eq!(code, "TRADING_BAD_VOLUME");
            assert!(description.contains("volume"));
        }
        other => panic!("expected remote error, got {:?}", other),
    }

    // The connection survived: the next request works.
    session
        .send_request(payload_type::RECONCILE_REQ, Bytes::new(), None)
        .await
        .unwrap();
    assert!(session.is_ready());

    session.disconnect().await;
}

/// Requests made before `connect` fail fast with `NotReady`.
#[tokio::test]
async fn test_not_ready_before_connect() {
    common::setup();
    let broker = StubBroker::start().await;
    let session = CTraderSession::new(broker.session_config()).unwrap();

    let result = session
        .send_request(payload_type::TRADER_REQ, Bytes::new(), None)
        .await;
    assert!(matches!(result, Err(CTraderError::NotReady { .. })));
}

/// A response that arrives after its request timed out lands on the
/// `orphan` topic and is counted.
#[tokio::test]
async fn test_late_response_goes_to_orphan_topic() {
    common::setup();
    let broker = StubBroker::start().await;
    broker
        .behavior
        .delay_response(payload_type::TRADER_REQ, 400);

    let session = CTraderSession::new(broker.session_config()).unwrap();
    session.connect().await.unwrap();

    let mut orphans = session.subscribe_orphans().await.unwrap();

    let result = session
        .send_request(
            payload_type::TRADER_REQ,
            Bytes::new(),
            Some(Duration::from_millis(100)),
        )
        .await;
    assert!(matches!(result, Err(CTraderError::Timeout { .. })));

    let orphan = tokio::time::timeout(Duration::from_secs(2), orphans.next())
        .await
        .expect("orphan envelope should arrive")
        .expect("orphan stream should stay open");
    assert_eq!(orphan.payload_type, payload_type::TRADER_RES);
    assert_eq!(session.metrics().inbound_orphaned, 1);

    session.disconnect().await;
}

/// `connect` is idempotent: calling it twice leaves one live connection.
#[tokio::test]
async fn test_connect_is_idempotent() {
    common::setup();
    let broker = StubBroker::start().await;
    let session = CTraderSession::new(broker.session_config()).unwrap();
    session.connect().await.unwrap();
    session.connect().await.unwrap();
    assert_eq!(broker.connection_count(), 1);
    assert!(session.is_ready());
    session.disconnect().await;
}
