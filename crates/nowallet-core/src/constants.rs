//! Protocol constants. All monetary values in satoshis (1 BTC = 10^8 sat).

use bitcoin::Network;

pub const COIN: u64 = 100_000_000;

/// Consecutive unused addresses scanned before discovery stops.
pub const GAP_LIMIT: u32 = 20;

/// Confirmation horizon (in blocks) asked of the fee estimator.
pub const FEE_TARGET_BLOCKS: u32 = 6;

/// Bytes in one fee-rate kilobyte.
pub const BYTES_PER_KB: u64 = 1024;

/// BIP-44 purpose level.
pub const BIP44_PURPOSE: u32 = 44;

/// Default plaintext TCP port of lightweight servers.
pub const DEFAULT_SERVER_PORT: u16 = 50001;

/// Wire method identifiers. These must match the server byte for byte.
pub mod methods {
    pub const SERVER_VERSION: &str = "server.version";
    pub const ADDRESS_GET_HISTORY: &str = "blockchain.address.get_history";
    pub const ADDRESS_SUBSCRIBE: &str = "blockchain.address.subscribe";
    pub const ADDRESS_GET_BALANCE: &str = "blockchain.address.get_balance";
    pub const ADDRESS_LISTUNSPENT: &str = "blockchain.address.listunspent";
    pub const TRANSACTION_GET: &str = "blockchain.transaction.get";
    pub const ESTIMATE_FEE: &str = "blockchain.estimatefee";
    pub const TRANSACTION_BROADCAST: &str = "blockchain.transaction.broadcast";
}

/// BIP-44 coin type for a network: 0 on mainnet, 1 on every test network.
pub fn coin_type(network: Network) -> u32 {
    match network {
        Network::Bitcoin => 0,
        _ => 1,
    }
}

/// Short ticker used when printing balances.
pub fn ticker(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "BTC",
        _ => "TBTC",
    }
}
