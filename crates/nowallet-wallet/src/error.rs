//! Wallet error types.

use nowallet_core::error::LinkError;
use nowallet_core::types::Chain;
use thiserror::Error;

/// Errors that can occur in wallet operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// The server transport could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(LinkError),

    /// A request failed while scanning a chain. Windows applied before the
    /// failure stay in the ledger.
    #[error("discovery failed on {chain} chain: {source}")]
    DiscoveryFailed {
        /// The chain whose scan was aborted.
        chain: Chain,
        /// The failing request's error.
        source: LinkError,
    },

    /// Coin selection exhausted the UTXO set before reaching the target.
    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds {
        /// Total value of the UTXO set in satoshis.
        have: u64,
        /// Requested amount in satoshis.
        need: u64,
    },

    /// The selected inputs cover the amount but not the fee.
    #[error("insufficient funds for fee: fee {fee}, available {available}")]
    InsufficientFundsForFee {
        /// Fee in satoshis.
        fee: u64,
        /// Value left for change before the fee, in satoshis.
        available: u64,
    },

    /// Index is not a valid non-hardened child number.
    #[error("invalid derivation index: {0}")]
    InvalidDerivationIndex(u32),

    /// The signer rejected the assembled transaction.
    #[error("signing failed: {0}")]
    SigningFailed(String),

    /// The server refused the signed transaction.
    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),

    /// Transport or protocol error from the server link.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Invalid address string or address for another network.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid monetary amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Seed or extended-key derivation failure.
    #[error("key derivation: {0}")]
    KeyDerivation(String),

    /// Undecodable data, such as a malformed raw transaction.
    #[error("decode: {0}")]
    Decode(String),
}

impl WalletError {
    /// True for both insufficient-funds cases: selection and fee.
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(
            self,
            WalletError::InsufficientFunds { .. } | WalletError::InsufficientFundsForFee { .. }
        )
    }
}
