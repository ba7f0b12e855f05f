//! Wire records exchanged with the server and the wallet-side UTXO type.
//!
//! Records returned by the server mirror its JSON field names so they can be
//! deserialized directly. Values are in satoshis.

use bitcoin::{OutPoint, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the two non-hardened derivation branches under an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Chain {
    /// External branch (`/0/i`): addresses handed out to receive funds.
    Spend,
    /// Internal branch (`/1/i`): addresses that receive change.
    Change,
}

impl Chain {
    /// Both chains in scan order.
    pub const ALL: [Chain; 2] = [Chain::Spend, Chain::Change];

    /// The derivation-path component of this chain.
    pub fn branch(self) -> u32 {
        match self {
            Chain::Spend => 0,
            Chain::Change => 1,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::Spend => f.write_str("spend"),
            Chain::Change => f.write_str("change"),
        }
    }
}

/// An entry of `blockchain.address.get_history`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HistoryItem {
    pub tx_hash: Txid,
    /// Confirmation height; 0 or negative while in the mempool.
    pub height: i64,
}

/// An entry of `blockchain.address.listunspent`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UnspentItem {
    pub tx_hash: Txid,
    pub tx_pos: u32,
    pub value: u64,
    #[serde(default)]
    pub height: i64,
}

impl UnspentItem {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.tx_hash,
            vout: self.tx_pos,
        }
    }
}

/// Result of `blockchain.address.get_balance`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServerBalance {
    pub confirmed: u64,
    #[serde(default)]
    pub unconfirmed: i64,
}

impl ServerBalance {
    /// Confirmed plus unconfirmed value, clamped at zero.
    pub fn total(&self) -> u64 {
        let total = self.confirmed as i128 + self.unconfirmed as i128;
        total.max(0) as u64
    }
}

/// A push event from `blockchain.address.subscribe`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressNotification {
    pub address: String,
    /// The server's status hash of the address history; `None` for an
    /// address with no history.
    pub status: Option<String>,
}

/// The wallet key that controls an output.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Owner {
    pub chain: Chain,
    pub index: u32,
    pub address: String,
}

/// An unspent output controlled by the wallet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub owner: Owner,
    /// Value in satoshis.
    pub value: u64,
    /// The locking script of the output.
    pub script_pubkey: ScriptBuf,
    /// Confirmation height as reported by the server (0 when unconfirmed).
    pub height: i64,
}

impl fmt::Display for Utxo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} sat ({})", self.outpoint, self.value, self.owner.address)
    }
}
