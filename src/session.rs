//! The public session handle.
//!
//! [`CTraderSession`] composes the transport, correlator, dispatcher,
//! registry, auth machine, and reconnect supervisor behind `connect` /
//! `send_request` / `subscribe_*`. One session owns one connection at a
//! time; dropping the session stops every background task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::auth::{self, SessionState};
use crate::config::SessionConfig;
use crate::error::{CTraderError, Result};
use crate::hooks::{event_bus, HookManager, ModelRefreshKind, SessionEvent};
use crate::metrics::{MetricsSnapshot, SessionMetrics};
use crate::protocol::correlation::RequestCorrelator;
use crate::protocol::dispatcher::{
    candle_topic, depth_topic, tick_topic, EventDispatcher, EXECUTION_TOPIC, ORPHAN_TOPIC,
};
use crate::protocol::handler::{self, ConnectionLost, Outbound};
use crate::protocol::queue::QueuePolicy;
use crate::rate_limit::TokenBucket;
use crate::reconnect::ReconnectConfig;
use crate::streams::{
    CandleStream, DepthStream, ExecutionStream, MultiTickStream, RawStream, ResubscribeRequest,
    StreamRegistry, TickStream,
};
use crate::types::{
    encode_payload, payload_type, ReconcileReq, SubscribeDepthQuotesReq, SubscribeLiveTrendbarReq,
    SubscribeSpotsReq, SymbolsListReq, TraderReq, TrendbarPeriod, UnsubscribeDepthQuotesReq,
    UnsubscribeLiveTrendbarReq, UnsubscribeSpotsReq,
};

/// State shared by the session handle and every background task.
pub(crate) struct SessionShared {
    pub(crate) config: SessionConfig,
    state_tx: watch::Sender<SessionState>,
    pub(crate) correlator: RequestCorrelator,
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) registry: StreamRegistry,
    pub(crate) bucket: TokenBucket,
    pub(crate) hooks: HookManager,
    events: broadcast::Sender<SessionEvent>,
    pub(crate) metrics: Arc<SessionMetrics>,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    conn_token: Mutex<Option<CancellationToken>>,
    access_token: Mutex<String>,
    conn_gen: AtomicU64,
    shutdown: AtomicBool,
}

impl SessionShared {
    fn new(config: SessionConfig) -> Arc<Self> {
        let bucket = TokenBucket::new(config.rate_limit_per_second);
        let access_token = Mutex::new(config.access_token.clone());
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Arc::new(Self {
            config,
            state_tx,
            correlator: RequestCorrelator::new(),
            dispatcher: EventDispatcher::new(),
            registry: StreamRegistry::new(),
            bucket,
            hooks: HookManager::new(),
            events: event_bus(256),
            metrics: Arc::new(SessionMetrics::new()),
            outbound: Mutex::new(None),
            conn_token: Mutex::new(None),
            access_token,
            conn_gen: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        })
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!("Session state -> {}", state);
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No receivers is fine; the bus is purely observational.
        let _ = self.events.send(event);
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn sender(&self) -> Option<mpsc::Sender<Outbound>> {
        self.outbound.lock().expect("outbound lock poisoned").clone()
    }

    pub(crate) fn install_connection(
        &self,
        sender: mpsc::Sender<Outbound>,
        token: CancellationToken,
    ) {
        if let Some(old) = self
            .conn_token
            .lock()
            .expect("token lock poisoned")
            .replace(token)
        {
            old.cancel();
        }
        *self.outbound.lock().expect("outbound lock poisoned") = Some(sender);
    }

    /// Cancels the live connection's tasks and removes its sender. Queued
    /// frames die with the channel.
    pub(crate) fn teardown_connection(&self) {
        if let Some(token) = self.conn_token.lock().expect("token lock poisoned").take() {
            token.cancel();
        }
        *self.outbound.lock().expect("outbound lock poisoned") = None;
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.conn_gen.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn current_generation(&self) -> u64 {
        self.conn_gen.load(Ordering::SeqCst)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn set_shutdown(&self, value: bool) {
        self.shutdown.store(value, Ordering::Release);
    }

    pub(crate) fn current_access_token(&self) -> String {
        self.access_token
            .lock()
            .expect("token lock poisoned")
            .clone()
    }

    pub(crate) fn set_access_token(&self, token: String) {
        *self.access_token.lock().expect("token lock poisoned") = token;
    }

    /// Latches the session in `Fatal`: every pending request fails with
    /// `AuthFailed` and every stream ends.
    pub(crate) fn enter_fatal(&self, reason: &str) {
        warn!("Session entering fatal state: {}", reason);
        self.set_state(SessionState::Fatal);
        self.teardown_connection();
        let reason = reason.to_string();
        self.correlator
            .fail_all(|| CTraderError::AuthFailed(reason.clone()));
        self.registry.close_all();
    }
}

struct SessionTasks {
    supervisor: Option<tokio::task::JoinHandle<()>>,
    housekeeping: Option<tokio::task::JoinHandle<()>>,
}

/// An asynchronous cTrader Open API session.
///
/// # Examples
///
/// ```no_run
/// use ctrader_connector_rs::config::SessionConfig;
/// use ctrader_connector_rs::session::CTraderSession;
///
/// #[tokio::main]
/// async fn main() -> ctrader_connector_rs::Result<()> {
///     let config = SessionConfig::from_env()?;
///     let session = CTraderSession::new(config)?;
///     session.connect().await?;
///
///     let mut ticks = session.subscribe_ticks(1, "EURUSD").await?;
///     while let Some(tick) = ticks.next().await {
///         println!("{} {:?}/{:?}", tick.symbol_name, tick.bid, tick.ask);
///     }
///
///     session.disconnect().await;
///     Ok(())
/// }
/// ```
pub struct CTraderSession {
    shared: Arc<SessionShared>,
    tasks: Mutex<SessionTasks>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl CTraderSession {
    /// Creates a session from a validated configuration. No I/O happens
    /// until [`CTraderSession::connect`].
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: SessionShared::new(config),
            tasks: Mutex::new(SessionTasks {
                supervisor: None,
                housekeeping: None,
            }),
            connect_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Opens the transport and drives authentication to `Ready`.
    ///
    /// Idempotent and safe to call concurrently: while another connect (or
    /// the supervisor) is in flight, this waits for it instead of opening a
    /// second socket.
    pub async fn connect(&self) -> Result<()> {
        if self.shared.state().is_transient() {
            return handler::wait_ready(&self.shared, self.shared.config.connect_timeout()).await;
        }
        let _guard = self.connect_lock.lock().await;
        match self.shared.state() {
            SessionState::Ready => return Ok(()),
            SessionState::Fatal => {
                return Err(CTraderError::AuthFailed(
                    "session is in the fatal state".to_string(),
                ))
            }
            _ => {}
        }

        self.shared.set_shutdown(false);
        self.shared.set_state(SessionState::Connecting);
        info!(
            "Connecting to cTrader ({}:{})...",
            self.shared.config.host(),
            self.shared.config.port
        );

        // Housekeeping must run before the first auth round-trip so a
        // connection dying mid-handshake still expires its requests.
        {
            let mut tasks = self.tasks.lock().expect("task lock poisoned");
            if tasks.housekeeping.is_none() {
                tasks.housekeeping = Some(handler::spawn_housekeeping(&self.shared));
            }
        }

        let (lost_tx, lost_rx) = mpsc::channel::<ConnectionLost>(8);
        let attempt = async {
            handler::open_connection(&self.shared, &lost_tx).await?;
            auth::authenticate(&self.shared).await
        };

        match attempt.await {
            Ok(()) => {
                let mut tasks = self.tasks.lock().expect("task lock poisoned");
                tasks.supervisor = Some(tokio::spawn(supervisor_loop(
                    Arc::clone(&self.shared),
                    lost_rx,
                    lost_tx,
                )));
                info!("Session ready");
                Ok(())
            }
            Err(e) => {
                self.shared.teardown_connection();
                if e.is_fatal_auth() {
                    self.shared.enter_fatal(&e.to_string());
                } else {
                    self.shared.set_state(SessionState::Disconnected);
                }
                Err(e)
            }
        }
    }

    /// Closes the connection, fails in-flight requests with
    /// `TransportLost`, and ends every stream. Idempotent.
    pub async fn disconnect(&self) {
        let _guard = self.connect_lock.lock().await;
        self.shared.set_shutdown(true);

        let (supervisor, housekeeping) = {
            let mut tasks = self.tasks.lock().expect("task lock poisoned");
            (tasks.supervisor.take(), tasks.housekeeping.take())
        };
        if let Some(task) = supervisor {
            task.abort();
        }
        if let Some(task) = housekeeping {
            task.abort();
        }

        self.shared.teardown_connection();
        self.shared
            .correlator
            .fail_all(|| CTraderError::transport_lost("session disconnected"));
        self.shared.registry.close_all();
        if self.shared.state() != SessionState::Fatal {
            self.shared.set_state(SessionState::Disconnected);
        }
        info!("Disconnected");
    }

    /// Sends a correlated request and returns the response payload bytes.
    ///
    /// Fails with `NotReady`, `Timeout`, `TransportLost`, or `Remote` when
    /// the server answers with its generic error message. Dropping the
    /// returned future cancels the request: the correlator slot is removed
    /// and a frame still queued behind the rate limiter never reaches the
    /// wire. `timeout` defaults to the configured request timeout.
    pub async fn send_request(
        &self,
        request_type: u32,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        let timeout = timeout.unwrap_or_else(|| self.shared.config.request_timeout());
        let response =
            handler::request_envelope(&self.shared, request_type, payload, timeout, true).await?;
        Ok(response.payload)
    }

    /// Opens a raw subscription for a caller-chosen topic key.
    ///
    /// The `recipe` requests are sent now and re-issued after every
    /// reconnect; `unsubscribe` runs when the stream is closed.
    pub async fn subscribe(
        &self,
        topic_key: impl Into<String>,
        queue_size: usize,
        policy: QueuePolicy,
        recipe: Vec<ResubscribeRequest>,
        unsubscribe: Vec<ResubscribeRequest>,
    ) -> Result<RawStream> {
        let sub = self.shared.registry.subscribe(
            &self.shared.dispatcher,
            vec![topic_key.into()],
            queue_size,
            policy,
            recipe.clone(),
            unsubscribe,
            false,
        );
        self.arm_subscription(&sub, &recipe).await?;
        Ok(RawStream::new(Arc::clone(&self.shared), sub))
    }

    /// Streams ticks for one symbol.
    pub async fn subscribe_ticks(
        &self,
        symbol_id: i64,
        symbol_name: impl Into<String>,
    ) -> Result<TickStream> {
        let recipe = vec![ResubscribeRequest {
            payload_type: payload_type::SUBSCRIBE_SPOTS_REQ,
            payload: encode_payload(&SubscribeSpotsReq {
                ctid_trader_account_id: self.shared.config.account_id,
                symbol_id: vec![symbol_id],
            }),
        }];
        let unsubscribe = vec![ResubscribeRequest {
            payload_type: payload_type::UNSUBSCRIBE_SPOTS_REQ,
            payload: encode_payload(&UnsubscribeSpotsReq {
                ctid_trader_account_id: self.shared.config.account_id,
                symbol_id: vec![symbol_id],
            }),
        }];
        let sub = self.shared.registry.subscribe(
            &self.shared.dispatcher,
            vec![tick_topic(symbol_id)],
            self.shared.config.tick_queue_size,
            QueuePolicy::DropOldest,
            recipe.clone(),
            unsubscribe,
            false,
        );
        self.arm_subscription(&sub, &recipe).await?;
        Ok(TickStream::new(
            Arc::clone(&self.shared),
            sub,
            symbol_id,
            symbol_name.into(),
        ))
    }

    /// Streams ticks for several symbols over one subscription. With
    /// `coalesce_latest`, only the newest tick per symbol survives load.
    pub async fn subscribe_multi_ticks(
        &self,
        symbols: &[(i64, &str)],
        coalesce_latest: bool,
    ) -> Result<MultiTickStream> {
        let ids: Vec<i64> = symbols.iter().map(|(id, _)| *id).collect();
        let names: HashMap<i64, String> = symbols
            .iter()
            .map(|(id, name)| (*id, name.to_string()))
            .collect();

        let recipe = vec![ResubscribeRequest {
            payload_type: payload_type::SUBSCRIBE_SPOTS_REQ,
            payload: encode_payload(&SubscribeSpotsReq {
                ctid_trader_account_id: self.shared.config.account_id,
                symbol_id: ids.clone(),
            }),
        }];
        let unsubscribe = vec![ResubscribeRequest {
            payload_type: payload_type::UNSUBSCRIBE_SPOTS_REQ,
            payload: encode_payload(&UnsubscribeSpotsReq {
                ctid_trader_account_id: self.shared.config.account_id,
                symbol_id: ids.clone(),
            }),
        }];
        let policy = if coalesce_latest {
            QueuePolicy::CoalesceLatest
        } else {
            QueuePolicy::DropOldest
        };
        let sub = self.shared.registry.subscribe(
            &self.shared.dispatcher,
            ids.iter().map(|id| tick_topic(*id)).collect(),
            self.shared.config.tick_queue_size,
            policy,
            recipe.clone(),
            unsubscribe,
            false,
        );
        self.arm_subscription(&sub, &recipe).await?;
        Ok(MultiTickStream::new(Arc::clone(&self.shared), sub, names))
    }

    /// Streams order book snapshots for one symbol. The book rebuilds from
    /// scratch after a reconnect.
    pub async fn subscribe_depth(
        &self,
        symbol_id: i64,
        symbol_name: impl Into<String>,
    ) -> Result<DepthStream> {
        let recipe = vec![ResubscribeRequest {
            payload_type: payload_type::SUBSCRIBE_DEPTH_QUOTES_REQ,
            payload: encode_payload(&SubscribeDepthQuotesReq {
                ctid_trader_account_id: self.shared.config.account_id,
                symbol_id: vec![symbol_id],
            }),
        }];
        let unsubscribe = vec![ResubscribeRequest {
            payload_type: payload_type::UNSUBSCRIBE_DEPTH_QUOTES_REQ,
            payload: encode_payload(&UnsubscribeDepthQuotesReq {
                ctid_trader_account_id: self.shared.config.account_id,
                symbol_id: vec![symbol_id],
            }),
        }];
        let sub = self.shared.registry.subscribe(
            &self.shared.dispatcher,
            vec![depth_topic(symbol_id)],
            self.shared.config.depth_queue_size,
            QueuePolicy::DropOldest,
            recipe.clone(),
            unsubscribe,
            // Stale deltas from the previous connection must never be
            // applied to the rebuilt book.
            true,
        );
        self.arm_subscription(&sub, &recipe).await?;
        Ok(DepthStream::new(
            Arc::clone(&self.shared),
            sub,
            symbol_name.into(),
        ))
    }

    /// Streams the forming candle for one symbol/timeframe pair.
    pub async fn subscribe_candles(
        &self,
        symbol_id: i64,
        period: TrendbarPeriod,
    ) -> Result<CandleStream> {
        let account_id = self.shared.config.account_id;
        let recipe = vec![
            ResubscribeRequest {
                payload_type: payload_type::SUBSCRIBE_SPOTS_REQ,
                payload: encode_payload(&SubscribeSpotsReq {
                    ctid_trader_account_id: account_id,
                    symbol_id: vec![symbol_id],
                }),
            },
            ResubscribeRequest {
                payload_type: payload_type::SUBSCRIBE_LIVE_TRENDBAR_REQ,
                payload: encode_payload(&SubscribeLiveTrendbarReq {
                    ctid_trader_account_id: account_id,
                    period: period.wire_value(),
                    symbol_id,
                }),
            },
        ];
        let unsubscribe = vec![ResubscribeRequest {
            payload_type: payload_type::UNSUBSCRIBE_LIVE_TRENDBAR_REQ,
            payload: encode_payload(&UnsubscribeLiveTrendbarReq {
                ctid_trader_account_id: account_id,
                period: period.wire_value(),
                symbol_id,
            }),
        }];
        let sub = self.shared.registry.subscribe(
            &self.shared.dispatcher,
            vec![candle_topic(symbol_id, period.wire_value())],
            self.shared.config.candle_queue_size,
            QueuePolicy::DropOldest,
            recipe.clone(),
            unsubscribe,
            false,
        );
        self.arm_subscription(&sub, &recipe).await?;
        Ok(CandleStream::new(Arc::clone(&self.shared), sub, period))
    }

    /// Streams typed execution events. These flow without an explicit
    /// subscribe, so the stream carries no resubscribe recipe and the
    /// supervisor's reconcile re-fetch covers reconnect gaps.
    pub async fn subscribe_execution(&self) -> Result<ExecutionStream> {
        let sub = self.shared.registry.subscribe(
            &self.shared.dispatcher,
            vec![EXECUTION_TOPIC.to_string()],
            self.shared.config.tick_queue_size,
            QueuePolicy::Block,
            Vec::new(),
            Vec::new(),
            false,
        );
        Ok(ExecutionStream::new(Arc::clone(&self.shared), sub))
    }

    /// Diagnostics: responses that arrived after their request was
    /// cancelled or timed out.
    pub async fn subscribe_orphans(&self) -> Result<RawStream> {
        let sub = self.shared.registry.subscribe(
            &self.shared.dispatcher,
            vec![ORPHAN_TOPIC.to_string()],
            64,
            QueuePolicy::DropOldest,
            Vec::new(),
            Vec::new(),
            false,
        );
        Ok(RawStream::new(Arc::clone(&self.shared), sub))
    }

    async fn arm_subscription(
        &self,
        sub: &Arc<crate::streams::Subscription>,
        recipe: &[ResubscribeRequest],
    ) -> Result<()> {
        for req in recipe {
            let result = handler::request_envelope(
                &self.shared,
                req.payload_type,
                req.payload.clone(),
                self.shared.config.request_timeout(),
                true,
            )
            .await;
            if let Err(e) = result {
                self.shared.registry.remove(&self.shared.dispatcher, sub);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// A watch receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.shared.state_receiver()
    }

    /// Subscribes to the session event bus (reconnect lifecycle, raw
    /// envelope tap, drops, model refresh).
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.subscribe_events()
    }

    /// Request-path hook registry.
    pub fn hooks(&self) -> &HookManager {
        &self.shared.hooks
    }

    /// Point-in-time copy of the session counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.pending_count()
    }

    /// Installs a refreshed OAuth access token, used on the next account
    /// authentication (i.e. the next reconnect).
    pub fn set_access_token(&self, token: impl Into<String>) {
        self.shared.set_access_token(token.into());
    }

    pub fn is_ready(&self) -> bool {
        self.shared.state() == SessionState::Ready
    }
}

impl Drop for CTraderSession {
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock().expect("task lock poisoned");
        if let Some(task) = tasks.supervisor.take() {
            task.abort();
        }
        if let Some(task) = tasks.housekeeping.take() {
            task.abort();
        }
        self.shared.teardown_connection();
        self.shared.registry.close_all();
    }
}

/// Runs `f` against a connected session and disconnects on every exit path.
///
/// # Examples
///
/// ```no_run
/// # use ctrader_connector_rs::{config::SessionConfig, session::with_session};
/// # async fn example(config: SessionConfig) -> ctrader_connector_rs::Result<()> {
/// let balance_payload = with_session(config, |session| async move {
///     session.send_request(2121, bytes::Bytes::new(), None).await
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn with_session<F, Fut, T>(config: SessionConfig, f: F) -> Result<T>
where
    F: FnOnce(Arc<CTraderSession>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let session = Arc::new(CTraderSession::new(config)?);
    session.connect().await?;
    let result = f(Arc::clone(&session)).await;
    session.disconnect().await;
    result
}

// ---------------------------------------------------------------------------
// Reconnect supervisor
// ---------------------------------------------------------------------------

enum RecoveryOutcome {
    Recovered { attempts: u32 },
    Fatal(CTraderError),
    Exhausted,
    Shutdown,
}

async fn supervisor_loop(
    shared: Arc<SessionShared>,
    mut lost_rx: mpsc::Receiver<ConnectionLost>,
    lost_tx: mpsc::Sender<ConnectionLost>,
) {
    while let Some(lost) = lost_rx.recv().await {
        // Stale notification from a generation already replaced.
        if lost.generation != shared.current_generation() {
            continue;
        }
        if shared.is_shutdown() {
            break;
        }

        warn!("Transport lost: {}", lost.reason);
        shared.teardown_connection();
        let failed = shared
            .correlator
            .fail_all(|| CTraderError::transport_lost(lost.reason.clone()));
        if failed > 0 {
            debug!("Failed {} in-flight request(s) with transport loss", failed);
        }

        if !shared.config.reconnect_enabled {
            info!("Reconnect disabled; session stays disconnected");
            shared.set_state(SessionState::Disconnected);
            shared.registry.close_all();
            break;
        }

        shared.set_state(SessionState::Reconnecting);
        match recovery_cycle(&shared, &lost_tx).await {
            RecoveryOutcome::Recovered { attempts } => {
                info!("Reconnected after {} attempt(s)", attempts);
                shared.metrics.reconnect_success();
                shared.emit(SessionEvent::ReconnectSuccess { attempts });
            }
            RecoveryOutcome::Fatal(e) => {
                shared.emit(SessionEvent::ReconnectFatal {
                    reason: e.to_string(),
                });
                shared.enter_fatal(&e.to_string());
                break;
            }
            RecoveryOutcome::Exhausted => {
                let reason = format!(
                    "reconnect attempts exhausted ({})",
                    shared.config.reconnect_max_attempts
                );
                shared.emit(SessionEvent::ReconnectFatal {
                    reason: reason.clone(),
                });
                shared.enter_fatal(&reason);
                break;
            }
            RecoveryOutcome::Shutdown => break,
        }
    }
    debug!("Reconnect supervisor finished");
}

async fn recovery_cycle(
    shared: &Arc<SessionShared>,
    lost_tx: &mpsc::Sender<ConnectionLost>,
) -> RecoveryOutcome {
    let policy = ReconnectConfig::from_session(&shared.config);
    let mut attempts: u32 = 0;
    loop {
        if shared.is_shutdown() {
            return RecoveryOutcome::Shutdown;
        }
        if !policy.allows_attempt(attempts) {
            return RecoveryOutcome::Exhausted;
        }

        let delay = policy.delay_for(attempts);
        attempts += 1;
        debug!("Reconnect attempt {} in {:?}", attempts, delay);
        tokio::time::sleep(delay).await;
        if shared.is_shutdown() {
            return RecoveryOutcome::Shutdown;
        }

        shared.metrics.reconnect_attempt();
        shared.emit(SessionEvent::ReconnectAttempt { attempt: attempts });

        match try_recover(shared, lost_tx).await {
            Ok(()) => return RecoveryOutcome::Recovered { attempts },
            Err(e) if e.is_fatal_auth() => return RecoveryOutcome::Fatal(e),
            Err(e) => {
                warn!("Reconnect attempt {} failed: {}", attempts, e);
                shared.teardown_connection();
                shared.set_state(SessionState::Reconnecting);
            }
        }
    }
}

async fn try_recover(
    shared: &Arc<SessionShared>,
    lost_tx: &mpsc::Sender<ConnectionLost>,
) -> Result<()> {
    handler::open_connection(shared, lost_tx).await?;
    auth::authenticate(shared).await?;
    refresh_model(shared).await;
    shared.registry.rearm_all(shared).await;
    Ok(())
}

/// Refresh-only recovery: re-fetch the server-side model and emit the
/// results as events. Trading requests are never replayed.
async fn refresh_model(shared: &Arc<SessionShared>) {
    let account_id = shared.config.account_id;
    let refreshes: [(ModelRefreshKind, u32, Bytes); 3] = [
        (
            ModelRefreshKind::Symbols,
            payload_type::SYMBOLS_LIST_REQ,
            encode_payload(&SymbolsListReq {
                ctid_trader_account_id: account_id,
            }),
        ),
        (
            ModelRefreshKind::Trader,
            payload_type::TRADER_REQ,
            encode_payload(&TraderReq {
                ctid_trader_account_id: account_id,
            }),
        ),
        (
            ModelRefreshKind::Reconcile,
            payload_type::RECONCILE_REQ,
            encode_payload(&ReconcileReq {
                ctid_trader_account_id: account_id,
            }),
        ),
    ];

    shared.emit(SessionEvent::ModelRefreshStart);
    for (kind, request_type, payload) in refreshes {
        match handler::request_envelope(
            shared,
            request_type,
            payload,
            shared.config.request_timeout(),
            false,
        )
        .await
        {
            Ok(response) => shared.emit(SessionEvent::ModelRefreshed {
                kind,
                payload: response.payload,
            }),
            Err(e) => warn!("Model refresh ({:?}) failed: {}", kind, e),
        }
    }
    shared.emit(SessionEvent::ModelRefreshEnd);
}
