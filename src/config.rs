//! Session configuration.

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CTraderError, Result};
use crate::transport::endpoints::{host_for, PROTOBUF_PORT};

/// Configuration for a cTrader session.
///
/// Configuration can be built directly, loaded from environment variables
/// under the `CTRADER_` prefix, or loaded from a JSON file.
///
/// # Examples
///
/// ```no_run
/// use ctrader_connector_rs::config::SessionConfig;
///
/// let mut config = SessionConfig::new("client_id", "client_secret", "access_token", 12345);
/// config.host_type = "demo".to_string();
/// config.validate().expect("invalid configuration");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// OAuth client ID
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// OAuth access token for the trading account
    pub access_token: String,
    /// Trading account ID (ctidTraderAccountId)
    pub account_id: i64,
    /// Server type: "demo" or "live"
    pub host_type: String,
    /// Overrides the host derived from `host_type`. Used by tests to point
    /// the session at a local stub server.
    pub host_override: Option<String>,
    /// Server port (5035 for both demo and live)
    pub port: u16,
    /// Whether to wrap the connection in TLS. The production endpoint
    /// requires TLS; tests disable it to talk to a plain TCP stub.
    pub use_tls: bool,

    /// Connection timeout in seconds
    pub connect_timeout_secs: f64,
    /// Default timeout for correlated requests, in seconds
    pub request_timeout_secs: f64,
    /// Timeout for each authentication round-trip, in seconds
    pub auth_timeout_secs: f64,

    /// Maximum frame size in bytes, enforced in both directions
    pub max_frame_bytes: usize,
    /// Outbound messages per second (token bucket capacity)
    pub rate_limit_per_second: u32,
    /// Idle interval after which a keepalive is written, in seconds
    pub heartbeat_idle_secs: f64,

    /// Capacity of the inbound staging queue between the reader and dispatch
    pub inbound_queue_size: usize,
    /// When true, a full inbound queue drops the oldest frame instead of
    /// pausing the reader
    pub drop_inbound_when_full: bool,
    /// Queue capacity for tick subscriptions
    pub tick_queue_size: usize,
    /// Queue capacity for depth subscriptions
    pub depth_queue_size: usize,
    /// Queue capacity for candle subscriptions
    pub candle_queue_size: usize,

    /// Whether the supervisor reconnects after transport loss
    pub reconnect_enabled: bool,
    /// Base delay for exponential backoff, in milliseconds
    pub reconnect_backoff_base_ms: u64,
    /// Cap on the backoff delay, in milliseconds
    pub reconnect_backoff_cap_ms: u64,
    /// Maximum reconnect attempts (0 = unlimited)
    pub reconnect_max_attempts: u32,

    /// Enables verbose connect/reconnect logging
    pub connection_debug: bool,
}

impl SessionConfig {
    /// Creates a configuration with the given credentials and the documented
    /// defaults for everything else.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        access_token: impl Into<String>,
        account_id: i64,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            access_token: access_token.into(),
            account_id,
            host_type: "demo".to_string(),
            host_override: None,
            port: PROTOBUF_PORT,
            use_tls: true,
            connect_timeout_secs: 30.0,
            request_timeout_secs: 5.0,
            auth_timeout_secs: 30.0,
            max_frame_bytes: 15 * 1024 * 1024,
            rate_limit_per_second: 5,
            heartbeat_idle_secs: 20.0,
            inbound_queue_size: 1000,
            drop_inbound_when_full: false,
            tick_queue_size: 1000,
            depth_queue_size: 100,
            candle_queue_size: 100,
            reconnect_enabled: true,
            reconnect_backoff_base_ms: 500,
            reconnect_backoff_cap_ms: 30_000,
            reconnect_max_attempts: 0,
            connection_debug: false,
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// Reads `CTRADER_CLIENT_ID`, `CTRADER_CLIENT_SECRET`,
    /// `CTRADER_ACCESS_TOKEN`, `CTRADER_ACCOUNT_ID`, `CTRADER_HOST_TYPE` and
    /// the optional tuning knobs (`CTRADER_RATE_LIMIT_PER_SECOND`,
    /// `CTRADER_REQUEST_TIMEOUT_SECS`, ...). Unset variables keep their
    /// defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_env_prefixed("CTRADER_")
    }

    /// Same as [`SessionConfig::from_env`] with a custom variable prefix.
    pub fn from_env_prefixed(prefix: &str) -> Result<Self> {
        fn get(prefix: &str, key: &str) -> Option<String> {
            env::var(format!("{}{}", prefix, key)).ok()
        }
        fn parse<T: std::str::FromStr>(prefix: &str, key: &str, default: T) -> Result<T> {
            match get(prefix, key) {
                None => Ok(default),
                Some(raw) => raw.parse().map_err(|_| {
                    CTraderError::Config(format!("invalid value for {}{}: {}", prefix, key, raw))
                }),
            }
        }
        fn parse_bool(prefix: &str, key: &str, default: bool) -> bool {
            match get(prefix, key) {
                None => default,
                Some(raw) => matches!(raw.to_lowercase().as_str(), "true" | "1" | "yes" | "on"),
            }
        }

        let mut config = Self::new(
            get(prefix, "CLIENT_ID").unwrap_or_default(),
            get(prefix, "CLIENT_SECRET").unwrap_or_default(),
            get(prefix, "ACCESS_TOKEN").unwrap_or_default(),
            parse(prefix, "ACCOUNT_ID", 0)?,
        );
        config.host_type = get(prefix, "HOST_TYPE").unwrap_or_else(|| "demo".to_string());
        config.port = parse(prefix, "PORT", config.port)?;
        config.use_tls = parse_bool(prefix, "USE_TLS", config.use_tls);
        config.connect_timeout_secs =
            parse(prefix, "CONNECT_TIMEOUT_SECS", config.connect_timeout_secs)?;
        config.request_timeout_secs =
            parse(prefix, "REQUEST_TIMEOUT_SECS", config.request_timeout_secs)?;
        config.auth_timeout_secs = parse(prefix, "AUTH_TIMEOUT_SECS", config.auth_timeout_secs)?;
        config.max_frame_bytes = parse(prefix, "MAX_FRAME_BYTES", config.max_frame_bytes)?;
        config.rate_limit_per_second =
            parse(prefix, "RATE_LIMIT_PER_SECOND", config.rate_limit_per_second)?;
        config.heartbeat_idle_secs =
            parse(prefix, "HEARTBEAT_IDLE_SECS", config.heartbeat_idle_secs)?;
        config.inbound_queue_size =
            parse(prefix, "INBOUND_QUEUE_SIZE", config.inbound_queue_size)?;
        config.drop_inbound_when_full =
            parse_bool(prefix, "DROP_INBOUND_WHEN_FULL", config.drop_inbound_when_full);
        config.tick_queue_size = parse(prefix, "TICK_QUEUE_SIZE", config.tick_queue_size)?;
        config.depth_queue_size = parse(prefix, "DEPTH_QUEUE_SIZE", config.depth_queue_size)?;
        config.candle_queue_size = parse(prefix, "CANDLE_QUEUE_SIZE", config.candle_queue_size)?;
        config.reconnect_enabled =
            parse_bool(prefix, "RECONNECT_ENABLED", config.reconnect_enabled);
        config.reconnect_backoff_base_ms = parse(
            prefix,
            "RECONNECT_BACKOFF_BASE_MS",
            config.reconnect_backoff_base_ms,
        )?;
        config.reconnect_backoff_cap_ms = parse(
            prefix,
            "RECONNECT_BACKOFF_CAP_MS",
            config.reconnect_backoff_cap_ms,
        )?;
        config.reconnect_max_attempts = parse(
            prefix,
            "RECONNECT_MAX_ATTEMPTS",
            config.reconnect_max_attempts,
        )?;
        config.connection_debug = parse_bool(prefix, "CONNECTION_DEBUG", config.connection_debug);
        Ok(config)
    }

    /// Loads configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&raw)
            .map_err(|e| CTraderError::Config(format!("invalid config file: {}", e)))
    }

    /// Validates that required fields are present and numeric fields are
    /// sane.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.client_id.is_empty() {
            missing.push("client_id");
        }
        if self.client_secret.is_empty() {
            missing.push("client_secret");
        }
        if self.access_token.is_empty() {
            missing.push("access_token");
        }
        if self.account_id <= 0 {
            missing.push("account_id");
        }
        if !missing.is_empty() {
            return Err(CTraderError::Config(format!(
                "missing required configuration: {}",
                missing.join(", ")
            )));
        }
        if self.host_type != "demo" && self.host_type != "live" {
            return Err(CTraderError::Config(format!(
                "host_type must be \"demo\" or \"live\", got: {}",
                self.host_type
            )));
        }
        if self.rate_limit_per_second == 0 {
            return Err(CTraderError::Config(
                "rate_limit_per_second must be positive".to_string(),
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(CTraderError::Config(
                "max_frame_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The host to connect to, honoring `host_override`.
    pub fn host(&self) -> String {
        match &self.host_override {
            Some(host) => host.clone(),
            None => host_for(&self.host_type).to_string(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.auth_timeout_secs)
    }

    pub fn heartbeat_idle(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_idle_secs)
    }
}
