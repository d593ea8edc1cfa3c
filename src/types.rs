//! Payload-type registry, reserved wire messages, and market data models.
//!
//! The session treats payload bodies as opaque byte strings except for a
//! small reserved set it must understand itself: authentication, the
//! generic error response, keepalives, and the event payloads needed for
//! topic routing. Those are declared here as partial prost messages carrying
//! only the fields the session reads; everything else in the body passes
//! through untouched.

use bytes::Bytes;
use prost::Message;

/// Payload-type tags for the reserved message set.
///
/// Tags outside this set flow through the session as opaque payloads and
/// are classified by number only.
pub mod payload_type {
    /// Common-layer generic error response
    pub const ERROR_RES: u32 = 50;
    /// Keepalive, in both directions
    pub const HEARTBEAT_EVENT: u32 = 51;

    pub const APPLICATION_AUTH_REQ: u32 = 2100;
    pub const APPLICATION_AUTH_RES: u32 = 2101;
    pub const ACCOUNT_AUTH_REQ: u32 = 2102;
    pub const ACCOUNT_AUTH_RES: u32 = 2103;

    pub const SYMBOLS_LIST_REQ: u32 = 2114;
    pub const SYMBOLS_LIST_RES: u32 = 2115;
    pub const TRADER_REQ: u32 = 2121;
    pub const TRADER_RES: u32 = 2122;
    pub const RECONCILE_REQ: u32 = 2124;
    pub const RECONCILE_RES: u32 = 2125;

    pub const EXECUTION_EVENT: u32 = 2126;
    pub const SUBSCRIBE_SPOTS_REQ: u32 = 2127;
    pub const SUBSCRIBE_SPOTS_RES: u32 = 2128;
    pub const UNSUBSCRIBE_SPOTS_REQ: u32 = 2129;
    pub const UNSUBSCRIBE_SPOTS_RES: u32 = 2130;
    pub const SPOT_EVENT: u32 = 2131;
    pub const SUBSCRIBE_LIVE_TRENDBAR_REQ: u32 = 2135;
    pub const SUBSCRIBE_LIVE_TRENDBAR_RES: u32 = 2136;
    pub const UNSUBSCRIBE_LIVE_TRENDBAR_REQ: u32 = 2137;
    pub const UNSUBSCRIBE_LIVE_TRENDBAR_RES: u32 = 2138;
    /// Trading-layer generic error response
    pub const OA_ERROR_RES: u32 = 2142;
    pub const DEPTH_EVENT: u32 = 2155;
    pub const SUBSCRIBE_DEPTH_QUOTES_REQ: u32 = 2156;
    pub const SUBSCRIBE_DEPTH_QUOTES_RES: u32 = 2157;
    pub const UNSUBSCRIBE_DEPTH_QUOTES_REQ: u32 = 2158;
    pub const UNSUBSCRIBE_DEPTH_QUOTES_RES: u32 = 2159;
}

/// True when the tag is one of the two generic error responses.
pub fn is_error_payload(tag: u32) -> bool {
    tag == payload_type::ERROR_RES || tag == payload_type::OA_ERROR_RES
}

// Prices on the wire are fixed-point with five implied decimal places;
// sizes are hundredths of lots scaled by 10^6.
const PRICE_SCALE: f64 = 100_000.0;
const VOLUME_SCALE: f64 = 100_000_000.0;

/// Converts a wire price (1/100000 units) to a float.
pub fn price_from_wire(raw: u64) -> f64 {
    raw as f64 / PRICE_SCALE
}

/// Converts a wire volume to lots.
pub fn volume_from_wire(raw: u64) -> f64 {
    raw as f64 / VOLUME_SCALE
}

// ---------------------------------------------------------------------------
// Reserved wire messages (partial views)
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct ApplicationAuthReq {
    #[prost(string, tag = "2")]
    pub client_id: String,
    #[prost(string, tag = "3")]
    pub client_secret: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct AccountAuthReq {
    #[prost(int64, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(string, tag = "3")]
    pub access_token: String,
}

/// Trading-layer error response (tag 2142).
#[derive(Clone, PartialEq, Message)]
pub struct OaErrorRes {
    #[prost(int64, optional, tag = "2")]
    pub ctid_trader_account_id: Option<i64>,
    #[prost(string, tag = "3")]
    pub error_code: String,
    #[prost(string, optional, tag = "4")]
    pub description: Option<String>,
    #[prost(int64, optional, tag = "5")]
    pub maintenance_end_timestamp: Option<i64>,
}

/// Common-layer error response (tag 50).
#[derive(Clone, PartialEq, Message)]
pub struct CommonErrorRes {
    #[prost(string, tag = "2")]
    pub error_code: String,
    #[prost(string, optional, tag = "3")]
    pub description: Option<String>,
    #[prost(int64, optional, tag = "4")]
    pub maintenance_end_timestamp: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct HeartbeatEvent {}

#[derive(Clone, PartialEq, Message)]
pub struct SubscribeSpotsReq {
    #[prost(int64, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(int64, repeated, tag = "3")]
    pub symbol_id: Vec<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UnsubscribeSpotsReq {
    #[prost(int64, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(int64, repeated, tag = "3")]
    pub symbol_id: Vec<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SubscribeLiveTrendbarReq {
    #[prost(int64, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(int32, tag = "3")]
    pub period: i32,
    #[prost(int64, tag = "4")]
    pub symbol_id: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct UnsubscribeLiveTrendbarReq {
    #[prost(int64, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(int32, tag = "3")]
    pub period: i32,
    #[prost(int64, tag = "4")]
    pub symbol_id: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct SubscribeDepthQuotesReq {
    #[prost(int64, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(int64, repeated, tag = "3")]
    pub symbol_id: Vec<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UnsubscribeDepthQuotesReq {
    #[prost(int64, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(int64, repeated, tag = "3")]
    pub symbol_id: Vec<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TraderReq {
    #[prost(int64, tag = "2")]
    pub ctid_trader_account_id: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReconcileReq {
    #[prost(int64, tag = "2")]
    pub ctid_trader_account_id: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct SymbolsListReq {
    #[prost(int64, tag = "2")]
    pub ctid_trader_account_id: i64,
}

/// Spot (tick) event. Also carries live trendbar updates for subscribed
/// timeframes.
#[derive(Clone, PartialEq, Message)]
pub struct SpotEvent {
    #[prost(int64, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(int64, tag = "3")]
    pub symbol_id: i64,
    #[prost(uint64, optional, tag = "4")]
    pub bid: Option<u64>,
    #[prost(uint64, optional, tag = "5")]
    pub ask: Option<u64>,
    #[prost(message, repeated, tag = "6")]
    pub trendbar: Vec<TrendbarData>,
    #[prost(int64, optional, tag = "8")]
    pub timestamp: Option<i64>,
}

/// Wire form of a trendbar: OHLC is delta-encoded against `low`.
#[derive(Clone, PartialEq, Message)]
pub struct TrendbarData {
    #[prost(int64, tag = "3")]
    pub volume: i64,
    #[prost(int32, optional, tag = "4")]
    pub period: Option<i32>,
    #[prost(int64, optional, tag = "5")]
    pub low: Option<i64>,
    #[prost(uint64, optional, tag = "6")]
    pub delta_open: Option<u64>,
    #[prost(uint64, optional, tag = "7")]
    pub delta_close: Option<u64>,
    #[prost(uint64, optional, tag = "8")]
    pub delta_high: Option<u64>,
    #[prost(uint32, optional, tag = "9")]
    pub utc_timestamp_in_minutes: Option<u32>,
}

/// Incremental order book event: quotes added plus quote ids removed.
#[derive(Clone, PartialEq, Message)]
pub struct DepthEvent {
    #[prost(int64, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(uint64, tag = "3")]
    pub symbol_id: u64,
    #[prost(message, repeated, tag = "4")]
    pub new_quotes: Vec<DepthQuoteData>,
    #[prost(uint64, repeated, tag = "5")]
    pub deleted_quotes: Vec<u64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DepthQuoteData {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "3")]
    pub size: u64,
    #[prost(uint64, optional, tag = "4")]
    pub bid: Option<u64>,
    #[prost(uint64, optional, tag = "5")]
    pub ask: Option<u64>,
}

/// Execution event payload. Nested entities are partial views carrying only
/// the identifiers the typed event layer reports.
#[derive(Clone, PartialEq, Message)]
pub struct ExecutionEventData {
    #[prost(int64, tag = "2")]
    pub ctid_trader_account_id: i64,
    #[prost(int32, tag = "3")]
    pub execution_type: i32,
    #[prost(message, optional, tag = "4")]
    pub position: Option<PositionData>,
    #[prost(message, optional, tag = "5")]
    pub order: Option<OrderData>,
    #[prost(message, optional, tag = "6")]
    pub deal: Option<DealData>,
    #[prost(string, optional, tag = "9")]
    pub error_code: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PositionData {
    #[prost(int64, tag = "1")]
    pub position_id: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct OrderData {
    #[prost(int64, tag = "1")]
    pub order_id: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct DealData {
    #[prost(int64, tag = "1")]
    pub deal_id: i64,
}

/// Serializes a reserved message into opaque payload bytes.
pub fn encode_payload<M: Message>(msg: &M) -> Bytes {
    let mut buf = Vec::with_capacity(msg.encoded_len());
    msg.encode(&mut buf)
        .expect("Vec<u8> writes are infallible");
    Bytes::from(buf)
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// Trendbar periods, by wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TrendbarPeriod {
    M1 = 1,
    M2 = 2,
    M3 = 3,
    M4 = 4,
    M5 = 5,
    M10 = 6,
    M15 = 7,
    M30 = 8,
    H1 = 9,
    H4 = 10,
    H12 = 11,
    D1 = 12,
    W1 = 13,
    Mn1 = 14,
}

impl TrendbarPeriod {
    pub fn from_wire(value: i32) -> Option<Self> {
        Some(match value {
            1 => Self::M1,
            2 => Self::M2,
            3 => Self::M3,
            4 => Self::M4,
            5 => Self::M5,
            6 => Self::M10,
            7 => Self::M15,
            8 => Self::M30,
            9 => Self::H1,
            10 => Self::H4,
            11 => Self::H12,
            12 => Self::D1,
            13 => Self::W1,
            14 => Self::Mn1,
            _ => return None,
        })
    }

    pub fn wire_value(self) -> i32 {
        self as i32
    }
}

/// A single immutable price tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol_id: i64,
    pub symbol_name: String,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    /// Server timestamp in Unix milliseconds, when present
    pub timestamp: Option<i64>,
}

/// Side of a depth quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteSide {
    Bid,
    Ask,
}

/// One price level in the order book.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthQuote {
    pub id: u64,
    pub price: f64,
    pub volume: f64,
    pub side: QuoteSide,
}

/// A point-in-time view of the order book after applying a delta.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthSnapshot {
    pub symbol_id: u64,
    pub symbol_name: String,
    /// Sorted by price descending (best bid first)
    pub bids: Vec<DepthQuote>,
    /// Sorted by price ascending (best ask first)
    pub asks: Vec<DepthQuote>,
    /// Snapshot creation time in Unix milliseconds
    pub timestamp: i64,
}

impl DepthSnapshot {
    pub fn best_bid(&self) -> Option<&DepthQuote> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&DepthQuote> {
        self.asks.first()
    }

    /// Best ask minus best bid, when both sides are populated.
    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    pub fn bid_volume(&self) -> f64 {
        self.bids.iter().map(|q| q.volume).sum()
    }

    pub fn ask_volume(&self) -> f64 {
        self.asks.iter().map(|q| q.volume).sum()
    }
}

/// A live candle for one timeframe, decoded from the delta form on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendBar {
    pub symbol_id: i64,
    pub period: TrendbarPeriod,
    pub low: f64,
    pub open: f64,
    pub high: f64,
    /// Close of the forming bar; absent until the server reports it
    pub close: Option<f64>,
    pub volume: i64,
    /// Bar open time in Unix milliseconds
    pub timestamp: i64,
}

impl TrendBar {
    pub(crate) fn from_wire(symbol_id: i64, bar: &TrendbarData) -> Option<Self> {
        let period = TrendbarPeriod::from_wire(bar.period?)?;
        let low = bar.low?;
        let open = low + bar.delta_open.unwrap_or(0) as i64;
        let high = low + bar.delta_high.unwrap_or(0) as i64;
        let close = bar.delta_close.map(|d| low + d as i64);
        Some(Self {
            symbol_id,
            period,
            low: price_from_wire(low as u64),
            open: price_from_wire(open as u64),
            high: price_from_wire(high as u64),
            close: close.map(|c| price_from_wire(c as u64)),
            volume: bar.volume,
            timestamp: bar.utc_timestamp_in_minutes.unwrap_or(0) as i64 * 60_000,
        })
    }
}

/// Execution event kinds, by wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionType {
    OrderAccepted,
    OrderFilled,
    OrderReplaced,
    OrderCancelled,
    OrderExpired,
    OrderRejected,
    OrderCancelRejected,
    Swap,
    DepositWithdraw,
    OrderPartialFill,
    BonusDepositWithdraw,
    Unknown(i32),
}

impl ExecutionType {
    pub fn from_wire(value: i32) -> Self {
        match value {
            2 => Self::OrderAccepted,
            3 => Self::OrderFilled,
            4 => Self::OrderReplaced,
            5 => Self::OrderCancelled,
            6 => Self::OrderExpired,
            7 => Self::OrderRejected,
            8 => Self::OrderCancelRejected,
            9 => Self::Swap,
            10 => Self::DepositWithdraw,
            11 => Self::OrderPartialFill,
            12 => Self::BonusDepositWithdraw,
            other => Self::Unknown(other),
        }
    }
}

/// A typed execution event delivered by the execution stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionEvent {
    pub execution_type: ExecutionType,
    pub order_id: Option<i64>,
    pub position_id: Option<i64>,
    pub deal_id: Option<i64>,
    pub error_code: Option<String>,
}

impl ExecutionEvent {
    pub(crate) fn from_wire(data: &ExecutionEventData) -> Self {
        Self {
            execution_type: ExecutionType::from_wire(data.execution_type),
            order_id: data.order.as_ref().map(|o| o.order_id),
            position_id: data.position.as_ref().map(|p| p.position_id),
            deal_id: data.deal.as_ref().map(|d| d.deal_id),
            error_code: data.error_code.clone(),
        }
    }
}
