// tests/common.rs
//
// In-process stub broker speaking the length-prefixed envelope protocol
// over plain TCP, plus configuration helpers shared by the integration
// tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use ctrader_connector_rs::config::SessionConfig;
use ctrader_connector_rs::protocol::envelope::{self, Envelope};
use ctrader_connector_rs::transport::FrameCodec;
use ctrader_connector_rs::types::{encode_payload, payload_type, OaErrorRes};

static INIT: Once = Once::new();

// Initializes logging once across all tests; RUST_LOG controls verbosity.
pub fn setup() {
    INIT.call_once(|| {
        dotenv::dotenv().ok();
        env_logger::builder().is_test(true).try_init().ok();
    });
}

/// Knobs the tests flip at runtime to steer the stub's behavior.
#[derive(Default)]
pub struct BrokerBehavior {
    /// Reply to ApplicationAuth with a non-retriable error
    pub fail_app_auth: AtomicBool,
    /// Reply to AccountAuth with a non-retriable error
    pub fail_account_auth: AtomicBool,
    /// Swallow these request types (no response at all)
    pub swallow_types: Mutex<HashSet<u32>>,
    /// Reply to these request types with the generic error message
    pub error_types: Mutex<HashSet<u32>>,
    /// Delay responses to these request types by N milliseconds
    pub delay_response_ms: Mutex<std::collections::HashMap<u32, u64>>,
}

impl BrokerBehavior {
    pub fn swallow(&self, tag: u32) {
        self.swallow_types.lock().unwrap().insert(tag);
    }

    pub fn reply_error(&self, tag: u32) {
        self.error_types.lock().unwrap().insert(tag);
    }

    pub fn delay_response(&self, tag: u32, millis: u64) {
        self.delay_response_ms.lock().unwrap().insert(tag, millis);
    }

    fn swallows(&self, tag: u32) -> bool {
        self.swallow_types.lock().unwrap().contains(&tag)
    }

    fn errors(&self, tag: u32) -> bool {
        self.error_types.lock().unwrap().contains(&tag)
    }

    fn delay_for(&self, tag: u32) -> u64 {
        self.delay_response_ms
            .lock()
            .unwrap()
            .get(&tag)
            .copied()
            .unwrap_or(0)
    }
}

fn generic_error(correlation_id: Option<String>) -> Envelope {
    let res = OaErrorRes {
        ctid_trader_account_id: None,
        error_code: "TRADING_BAD_VOLUME".to_string(),
        description: Some("volume out of range".to_string()),
        maintenance_end_timestamp: None,
    };
    Envelope {
        payload_type: payload_type::OA_ERROR_RES,
        payload: encode_payload(&res),
        client_msg_id: correlation_id,
    }
}

fn auth_failure(correlation_id: Option<String>) -> Envelope {
    let res = OaErrorRes {
        ctid_trader_account_id: None,
        error_code: "CH_CLIENT_AUTH_FAILURE".to_string(),
        description: Some("invalid client credentials".to_string()),
        maintenance_end_timestamp: None,
    };
    Envelope {
        payload_type: payload_type::OA_ERROR_RES,
        payload: encode_payload(&res),
        client_msg_id: correlation_id,
    }
}

fn success_response_tag(request_tag: u32) -> Option<u32> {
    use ctrader_connector_rs::types::payload_type::*;
    Some(match request_tag {
        APPLICATION_AUTH_REQ => APPLICATION_AUTH_RES,
        ACCOUNT_AUTH_REQ => ACCOUNT_AUTH_RES,
        SUBSCRIBE_SPOTS_REQ => SUBSCRIBE_SPOTS_RES,
        UNSUBSCRIBE_SPOTS_REQ => UNSUBSCRIBE_SPOTS_RES,
        SUBSCRIBE_DEPTH_QUOTES_REQ => SUBSCRIBE_DEPTH_QUOTES_RES,
        UNSUBSCRIBE_DEPTH_QUOTES_REQ => UNSUBSCRIBE_DEPTH_QUOTES_RES,
        SUBSCRIBE_LIVE_TRENDBAR_REQ => SUBSCRIBE_LIVE_TRENDBAR_RES,
        UNSUBSCRIBE_LIVE_TRENDBAR_REQ => UNSUBSCRIBE_LIVE_TRENDBAR_RES,
        SYMBOLS_LIST_REQ => SYMBOLS_LIST_RES,
        TRADER_REQ => TRADER_RES,
        RECONCILE_REQ => RECONCILE_RES,
        _ => return None,
    })
}

fn respond(behavior: &BrokerBehavior, request: &Envelope) -> Vec<Envelope> {
    use ctrader_connector_rs::types::payload_type::*;

    if behavior.swallows(request.payload_type) {
        return Vec::new();
    }
    if request.payload_type == APPLICATION_AUTH_REQ
        && behavior.fail_app_auth.load(Ordering::Acquire)
    {
        return vec![auth_failure(request.client_msg_id.clone())];
    }
    if request.payload_type == ACCOUNT_AUTH_REQ
        && behavior.fail_account_auth.load(Ordering::Acquire)
    {
        return vec![auth_failure(request.client_msg_id.clone())];
    }
    if behavior.errors(request.payload_type) {
        return vec![generic_error(request.client_msg_id.clone())];
    }

    match success_response_tag(request.payload_type) {
        Some(tag) => vec![Envelope {
            payload_type: tag,
            payload: Bytes::from_static(b"\x01"),
            client_msg_id: request.client_msg_id.clone(),
        }],
        None => Vec::new(),
    }
}

/// A minimal broker: accepts any number of sequential/parallel connections,
/// answers the reserved request set, records everything it receives, and
/// lets tests push server-initiated envelopes or kill live connections.
pub struct StubBroker {
    pub port: u16,
    pub behavior: Arc<BrokerBehavior>,
    push_tx: broadcast::Sender<Envelope>,
    kill_tx: broadcast::Sender<()>,
    received: Arc<Mutex<Vec<Envelope>>>,
    connections: Arc<AtomicU64>,
    _accept_task: JoinHandle<()>,
}

impl StubBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let behavior = Arc::new(BrokerBehavior::default());
        let (push_tx, _) = broadcast::channel(256);
        let (kill_tx, _) = broadcast::channel(16);
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicU64::new(0));

        let accept_task = {
            let behavior = Arc::clone(&behavior);
            let push_tx = push_tx.clone();
            let kill_tx = kill_tx.clone();
            let received = Arc::clone(&received);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        break;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve_connection(
                        socket,
                        Arc::clone(&behavior),
                        push_tx.clone(),
                        kill_tx.subscribe(),
                        Arc::clone(&received),
                    ));
                }
            })
        };

        Self {
            port,
            behavior,
            push_tx,
            kill_tx,
            received,
            connections,
            _accept_task: accept_task,
        }
    }

    /// A session configuration pointed at this stub: plain TCP, fast
    /// timeouts, generous rate limit, and quick reconnect backoff.
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::new("test-client", "test-secret", "test-token", 12345);
        config.host_override = Some("127.0.0.1".to_string());
        config.port = self.port;
        config.use_tls = false;
        config.connect_timeout_secs = 5.0;
        config.request_timeout_secs = 2.0;
        config.auth_timeout_secs = 2.0;
        config.rate_limit_per_second = 50;
        config.reconnect_backoff_base_ms = 20;
        config.reconnect_backoff_cap_ms = 100;
        config
    }

    /// Sends a server push to every live connection.
    pub fn push(&self, envelope: Envelope) {
        let _ = self.push_tx.send(envelope);
    }

    /// Drops every live connection, as a broker restart would.
    pub fn kill_connections(&self) {
        let _ = self.kill_tx.send(());
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }

    /// How many frames with the given payload type the broker has seen.
    pub fn received_count(&self, tag: u32) -> usize {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.payload_type == tag)
            .count()
    }
}

async fn serve_connection(
    socket: TcpStream,
    behavior: Arc<BrokerBehavior>,
    push_tx: broadcast::Sender<Envelope>,
    mut kill_rx: broadcast::Receiver<()>,
    received: Arc<Mutex<Vec<Envelope>>>,
) {
    socket.set_nodelay(true).ok();
    let mut push_rx = push_tx.subscribe();
    let mut framed = Framed::new(socket, FrameCodec::new(15 * 1024 * 1024));

    loop {
        tokio::select! {
            frame = framed.next() => {
                let Some(Ok(bytes)) = frame else { break };
                let Ok(request) = envelope::decode(&bytes) else { break };
                received.lock().unwrap().push(request.clone());

                let delay = behavior.delay_for(request.payload_type);
                let responses = respond(&behavior, &request);
                if delay == 0 {
                    for response in responses {
                        if framed.send(envelope::encode(&response)).await.is_err() {
                            return;
                        }
                    }
                } else {
                    // Late responses ride the push channel so the read loop
                    // stays responsive.
                    let push_tx = push_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                        for response in responses {
                            let _ = push_tx.send(response);
                        }
                    });
                }
            }
            push = push_rx.recv() => {
                if let Ok(envelope) = push {
                    if framed.send(envelope::encode(&envelope)).await.is_err() {
                        return;
                    }
                }
            }
            _ = kill_rx.recv() => break,
        }
    }
}

/// Builds a spot-event push envelope.
pub fn spot_push(symbol_id: i64, bid: u64, ask: u64) -> Envelope {
    use ctrader_connector_rs::types::SpotEvent;
    let event = SpotEvent {
        ctid_trader_account_id: 12345,
        symbol_id,
        bid: Some(bid),
        ask: Some(ask),
        trendbar: Vec::new(),
        timestamp: Some(1_700_000_000_000),
    };
    Envelope::new(payload_type::SPOT_EVENT, encode_payload(&event))
}

/// Builds a depth-event push envelope.
pub fn depth_push(
    symbol_id: u64,
    new_quotes: Vec<ctrader_connector_rs::types::DepthQuoteData>,
    deleted_quotes: Vec<u64>,
) -> Envelope {
    use ctrader_connector_rs::types::DepthEvent;
    let event = DepthEvent {
        ctid_trader_account_id: 12345,
        symbol_id,
        new_quotes,
        deleted_quotes,
    };
    Envelope::new(payload_type::DEPTH_EVENT, encode_payload(&event))
}

/// Waits until `predicate` holds or the timeout elapses; panics on timeout.
pub async fn wait_for(label: &str, timeout: std::time::Duration, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {}",
            label
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
