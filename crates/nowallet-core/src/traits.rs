//! The server boundary.
//!
//! [`ServerLink`] is the only way the wallet engine talks to a lightweight
//! server. `nowallet-network` implements it over TCP; tests implement it in
//! memory.

use async_trait::async_trait;
use bitcoin::Txid;
use tokio::sync::mpsc;

use crate::error::LinkError;
use crate::types::{AddressNotification, HistoryItem, ServerBalance, UnspentItem};

/// Request/response calls and the subscription stream of one server
/// connection.
#[async_trait]
pub trait ServerLink: Send + Sync {
    /// `blockchain.address.get_history`
    async fn get_history(&self, address: &str) -> Result<Vec<HistoryItem>, LinkError>;

    /// `blockchain.address.get_balance`
    async fn get_balance(&self, address: &str) -> Result<ServerBalance, LinkError>;

    /// `blockchain.address.listunspent`
    async fn list_unspent(&self, address: &str) -> Result<Vec<UnspentItem>, LinkError>;

    /// `blockchain.transaction.get`, returning the raw transaction hex.
    async fn get_transaction(&self, txid: &Txid) -> Result<String, LinkError>;

    /// `blockchain.estimatefee`, returning coins per kilobyte. Servers answer
    /// with a non-positive value when they cannot estimate.
    async fn estimate_fee(&self, target_blocks: u32) -> Result<f64, LinkError>;

    /// `blockchain.transaction.broadcast`, returning whatever the server
    /// answered (normally the txid).
    async fn broadcast(&self, raw_hex: &str) -> Result<String, LinkError>;

    /// `blockchain.address.subscribe`. Returns the current status; later
    /// changes arrive on the stream handed out by [`notifications`](Self::notifications).
    async fn subscribe_address(&self, address: &str) -> Result<Option<String>, LinkError>;

    /// Take the notification stream. There is one stream per link; the
    /// first caller gets it and later calls return `None`.
    fn notifications(&self) -> Option<mpsc::UnboundedReceiver<AddressNotification>>;
}
