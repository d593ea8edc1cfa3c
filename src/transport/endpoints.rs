//! cTrader server endpoints.

/// Demo environment protobuf endpoint.
pub const DEMO_HOST: &str = "demo.ctraderapi.com";
/// Live environment protobuf endpoint.
pub const LIVE_HOST: &str = "live.ctraderapi.com";
/// Both environments listen on the same port.
pub const PROTOBUF_PORT: u16 = 5035;

/// Returns the host for the given environment name.
///
/// Unknown names fall back to the demo host; `SessionConfig::validate`
/// rejects them before a connection is attempted.
pub fn host_for(host_type: &str) -> &'static str {
    match host_type.to_lowercase().as_str() {
        "live" => LIVE_HOST,
        _ => DEMO_HOST,
    }
}
