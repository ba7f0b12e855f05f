//! Client configuration for the server link.

use nowallet_core::constants::DEFAULT_SERVER_PORT;
use std::time::Duration;

/// Configuration for an [`ElectrumClient`](crate::ElectrumClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout for establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Timeout for a single request/response exchange.
    pub request_timeout: Duration,
    /// Longest line accepted from the server, in bytes.
    pub max_line_length: usize,
    /// Client name sent in the `server.version` handshake.
    pub client_name: String,
    /// Oldest protocol version accepted in the handshake.
    pub protocol_min: String,
    /// Newest protocol version requested in the handshake. Servers dropped
    /// the `blockchain.address.*` methods in 1.3, so this stays below it.
    pub protocol_max: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_line_length: 8 * 1024 * 1024,
            client_name: format!("nowallet/{}", env!("CARGO_PKG_VERSION")),
            protocol_min: "1.1".to_string(),
            protocol_max: "1.2".to_string(),
        }
    }
}

/// Normalize a `host` or `host:port` server string, appending the default
/// port when none is given.
pub fn server_address(server: &str) -> String {
    let server = server.trim();
    match server.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => server.to_string(),
        _ => format!("{server}:{DEFAULT_SERVER_PORT}"),
    }
}
